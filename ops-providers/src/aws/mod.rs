//! EC2-style backend. All backend calls go through [`Ec2Api`]; the SDK
//! binding itself lives behind that trait.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ops_common::{
    CloudImage, CloudInstance, Config, NanosVolume, OpsError, ProviderConfig, Tag,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod cidr;
pub mod instance_group;
pub mod model;
pub mod network;

pub use api::Ec2Api;
pub use instance_group::LaunchTemplateInput;

use crate::tags::{build_tags, name_tag, CREATED_BY_KEY, CREATED_BY_VALUE, NAME_KEY};
use crate::waiter::{Poll, Waiter};
use crate::{ImageBuilder, Provider};
use model::*;

const IMAGE_TAG: &str = "image";
const DEFAULT_INSTANCE_TYPE: &str = "t2.micro";
const LIVE_STATES: [&str; 5] = ["running", "pending", "shutting-down", "stopping", "stopped"];
const GIB: i64 = 1024 * 1024 * 1024;

pub struct AwsProvider<C: Ec2Api> {
    label: &'static str,
    ec2: Arc<C>,
    builder: Arc<dyn ImageBuilder>,
    zone: String,
    snapshot_waiter: Waiter,
    termination_waiter: Waiter,
    static_ip_waiter: Waiter,
}

impl<C: Ec2Api + 'static> AwsProvider<C> {
    pub fn new(ec2: Arc<C>, builder: Arc<dyn ImageBuilder>) -> Self {
        Self {
            label: "aws",
            ec2,
            builder,
            zone: String::new(),
            snapshot_waiter: Waiter::snapshot_import(),
            termination_waiter: Waiter::instance_terminated(),
            static_ip_waiter: Waiter::static_ip(),
        }
    }

    /// Name reported by [`Provider::name`].
    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    pub fn with_waiters(mut self, snapshot: Waiter, termination: Waiter, static_ip: Waiter) -> Self {
        self.snapshot_waiter = snapshot;
        self.termination_waiter = termination;
        self.static_ip_waiter = static_ip;
        self
    }

    pub fn client(&self) -> &C {
        &self.ec2
    }

    fn api(&self) -> &dyn Ec2Api {
        &*self.ec2
    }

    fn zone<'a>(&'a self, cloud: &'a ProviderConfig) -> &'a str {
        if cloud.zone.is_empty() {
            &self.zone
        } else {
            &cloud.zone
        }
    }

    async fn find_image(&self, image_name: &str) -> Result<Image> {
        let images = self
            .ec2
            .describe_images(&[Filter::tag(NAME_KEY, image_name)])
            .await
            .with_context(|| format!("unable to describe image {image_name}"))?;
        images
            .into_iter()
            .next()
            .ok_or_else(|| OpsError::ImageNotFound(image_name.to_string()).into())
    }

    async fn find_instance(&self, name: &str) -> Result<Ec2Instance> {
        let instances = self
            .ec2
            .describe_instances(
                &[],
                &[
                    Filter::tag(NAME_KEY, name),
                    Filter::new("instance-state-name", &LIVE_STATES),
                ],
            )
            .await
            .with_context(|| format!("unable to describe instance {name}"))?;
        instances
            .into_iter()
            .next()
            .ok_or_else(|| OpsError::InstanceNotFound(name.to_string()).into())
    }

    async fn find_volume(&self, name: &str) -> Result<Volume> {
        let by_name = self
            .ec2
            .describe_volumes(&[Filter::tag(NAME_KEY, name)])
            .await
            .with_context(|| format!("unable to describe volume {name}"))?;
        if let Some(v) = by_name.into_iter().next() {
            return Ok(v);
        }
        let by_id = self
            .ec2
            .describe_volumes(&[Filter::new("volume-id", &[name])])
            .await
            .with_context(|| format!("unable to describe volume {name}"))?;
        by_id
            .into_iter()
            .next()
            .ok_or_else(|| OpsError::VolumeNotFound(name.to_string()).into())
    }

    async fn wait_for_snapshot(&self, task_id: &str) -> Result<String> {
        let ec2 = self.ec2.clone();
        let task_id = task_id.to_string();
        self.snapshot_waiter
            .wait_with_progress(
                || {
                    let ec2 = ec2.clone();
                    let task_id = task_id.clone();
                    async move {
                        let task = ec2
                            .describe_import_snapshot_tasks(&[task_id.clone()])
                            .await?
                            .into_iter()
                            .next()
                            .ok_or_else(|| anyhow::anyhow!("import task {task_id} not found"))?;
                        Ok(snapshot_task_state(task))
                    }
                },
                |progress| info!("[aws] snapshot import {}%", progress),
            )
            .await
    }

    async fn wait_until_terminated(&self, instance_id: &str) -> Result<()> {
        let ec2 = self.ec2.clone();
        let id = instance_id.to_string();
        self.termination_waiter
            .wait(|| {
                let ec2 = ec2.clone();
                let id = id.clone();
                async move {
                    let instances = ec2.describe_instances(&[id], &[]).await?;
                    Ok(match instances.first().map(|i| i.state.as_str()) {
                        None | Some("terminated") => Poll::Ready(()),
                        Some(_) => Poll::pending(),
                    })
                }
            })
            .await
    }

    async fn wait_until_not_pending(&self, instance_id: &str) -> Result<()> {
        let ec2 = self.ec2.clone();
        let id = instance_id.to_string();
        self.static_ip_waiter
            .wait(|| {
                let ec2 = ec2.clone();
                let id = id.clone();
                async move {
                    let instances = ec2.describe_instances(&[id.clone()], &[]).await?;
                    Ok(match instances.first().map(|i| i.state.as_str()) {
                        Some("pending") => Poll::pending(),
                        Some(_) => Poll::Ready(()),
                        None => Poll::Failed(format!("instance {id} disappeared")),
                    })
                }
            })
            .await
    }
}

fn snapshot_task_state(task: ImportSnapshotTask) -> Poll<String> {
    match task.status.as_str() {
        "completed" => match task.snapshot_id {
            Some(id) => Poll::Ready(id),
            None => Poll::Failed("completed without a snapshot id".into()),
        },
        "deleted" | "deleting" => Poll::Failed(match task.status_message {
            Some(msg) if !msg.is_empty() => format!("{}: {}", task.status, msg),
            _ => task.status,
        }),
        _ => Poll::Pending {
            progress: task.progress.and_then(|p| p.trim().parse().ok()),
        },
    }
}

fn instance_name(config: &Config) -> String {
    if !config.run.instance_name.is_empty() {
        return config.run.instance_name.clone();
    }
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{}-{}", config.cloud.image_name, secs)
}

/// `"10"`, `"10g"`, `"512m"` → whole GiB, at least one.
pub fn parse_size_gb(size: &str) -> Result<i64> {
    let s = size.trim().to_ascii_lowercase();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s.as_str(), "g"),
    };
    let n: i64 = digits
        .parse()
        .with_context(|| format!("invalid volume size {size:?}"))?;
    let gb = match unit.trim_end_matches('b') {
        "g" | "" => n,
        "m" => (n + 1023) / 1024,
        "t" => n * 1024,
        other => bail!("unknown size unit {other:?} in {size:?}"),
    };
    Ok(gb.max(1))
}

/// `/dev/sdb` for attach id 1.
pub fn device_name(attach_id: u32) -> Result<String> {
    if attach_id == 0 || attach_id > 25 {
        bail!("attach id {attach_id} out of range 1..=25");
    }
    Ok(format!("/dev/sd{}", (b'a' + attach_id as u8) as char))
}

#[async_trait]
impl<C: Ec2Api + 'static> Provider for AwsProvider<C> {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn initialize(&mut self, config: &ProviderConfig) -> Result<()> {
        if config.zone.is_empty() {
            return Err(OpsError::Environment(format!("{}: a zone is required", self.label)).into());
        }
        self.zone = config.zone.clone();
        Ok(())
    }

    async fn build_image(&self, config: &Config) -> Result<PathBuf> {
        self.builder.build_image(config).await
    }

    async fn build_image_with_package(&self, config: &Config, package_path: &Path) -> Result<PathBuf> {
        self.builder.build_image_from_package(package_path, config).await
    }

    async fn create_image(&self, config: &Config, image_path: &Path) -> Result<()> {
        let image_name = if config.cloud.image_name.is_empty() {
            image_path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            config.cloud.image_name.clone()
        };

        let task_id = self
            .ec2
            .import_snapshot(image_path, &format!("snapshot for {image_name}"))
            .await
            .with_context(|| format!("unable to import {} as a snapshot", image_path.display()))?;
        info!("[aws] importing {} (task {})", image_name, task_id);

        let snapshot_id = self
            .wait_for_snapshot(&task_id)
            .await
            .with_context(|| format!("snapshot import for {image_name} did not complete"))?;

        let (tags, _) = build_tags(&config.cloud.tags, &image_name);
        let image_id = self
            .ec2
            .register_image(RegisterImageInput {
                name: image_name.clone(),
                snapshot_id: snapshot_id.clone(),
                architecture: config.run.arch_or_host(),
                tags,
            })
            .await
            .with_context(|| {
                format!("unable to register image {image_name}; snapshot {snapshot_id} remains")
            })?;
        info!("[aws] image {} registered as {}", image_name, image_id);
        Ok(())
    }

    async fn get_images(&self, _config: &Config) -> Result<Vec<CloudImage>> {
        let images = self
            .ec2
            .describe_images(&[Filter::tag(CREATED_BY_KEY, CREATED_BY_VALUE)])
            .await
            .context("unable to list images")?;
        Ok(images
            .into_iter()
            .map(|i| CloudImage {
                name: name_tag(&i.tags).unwrap_or(&i.name).to_string(),
                id: i.image_id,
                status: i.state,
                size: i.size_gb * GIB,
                path: String::new(),
                created: i.creation_date,
            })
            .collect())
    }

    async fn delete_image(&self, _config: &Config, image_name: &str) -> Result<()> {
        let image = self.find_image(image_name).await?;
        self.ec2
            .deregister_image(&image.image_id)
            .await
            .with_context(|| format!("unable to deregister image {image_name}"))?;
        if let Some(snapshot) = &image.snapshot_id {
            self.ec2
                .delete_snapshot(snapshot)
                .await
                .with_context(|| format!("image {image_name} deregistered but snapshot {snapshot} remains"))?;
        }
        info!("[aws] deleted image {}", image_name);
        Ok(())
    }

    async fn create_instance(&self, config: &Config) -> Result<()> {
        let cloud = &config.cloud;
        let run = &config.run;
        let image = self.find_image(&cloud.image_name).await?;
        let name = instance_name(config);

        let vpc = network::get_or_create_vpc(self.api(), cloud).await?;
        let security_group = if cloud.security_group.is_empty() {
            network::create_security_group(self.api(), cloud, run, &name, &vpc.vpc_id).await?
        } else {
            network::get_security_group(self.api(), cloud, &vpc).await?.group_id
        };
        let subnet = network::get_or_create_subnet(self.api(), cloud, &vpc).await?;

        let mut user_tags = cloud.tags.clone();
        user_tags.retain(|t| t.key != IMAGE_TAG);
        let (mut tags, name) = build_tags(&user_tags, &name);
        tags.push(Tag::new(IMAGE_TAG, &cloud.image_name));

        let mut nic = NetworkInterfaceSpec {
            device_index: 0,
            delete_on_termination: true,
            subnet_id: subnet.subnet_id.clone(),
            groups: vec![security_group],
            ..Default::default()
        };
        if !run.ip_address.is_empty() {
            nic.private_ip_address = Some(run.ip_address.clone());
        }
        if cloud.enable_ipv6 {
            if run.ipv6_address.is_empty() {
                nic.ipv6_address_count = Some(1);
            } else {
                nic.ipv6_addresses = vec![run.ipv6_address.clone()];
            }
        }

        let instance_type = if cloud.flavor.is_empty() {
            DEFAULT_INSTANCE_TYPE.to_string()
        } else {
            cloud.flavor.clone()
        };
        let user_data = (!cloud.user_data.is_empty()).then(|| STANDARD.encode(&cloud.user_data));
        let profile = (!cloud.instance_profile.is_empty()).then(|| cloud.instance_profile.clone());

        if !run.instance_group.is_empty() {
            let input = LaunchTemplateInput {
                auto_scaling_group: run.instance_group.clone(),
                image_id: image.image_id.clone(),
                instance_profile_name: profile,
                instance_type,
                launch_template_name: format!("{}-{}", run.instance_group, cloud.image_name),
                tags,
                network_interface: nic,
                user_data,
            };
            return instance_group::roll_instance_group(self.api(), &input).await;
        }

        info!("[aws] launching {} from {}", name, image.image_id);
        let instance = self
            .ec2
            .run_instances(RunInstancesInput {
                image_id: image.image_id,
                instance_type,
                tags,
                network_interface: Some(nic),
                iam_instance_profile: profile,
                launch_template: None,
                user_data,
            })
            .await
            .with_context(|| {
                format!("unable to launch {name}; network resources created for it may need manual cleanup")
            })?;

        if !cloud.static_ip.is_empty() {
            self.wait_until_not_pending(&instance.instance_id)
                .await
                .with_context(|| format!("instance {name} never left pending"))?;
            self.ec2
                .associate_address(&instance.instance_id, &cloud.static_ip)
                .await
                .with_context(|| format!("unable to associate {} with {name}", cloud.static_ip))?;
            info!("[aws] {} reachable at {}", name, cloud.static_ip);
        }
        Ok(())
    }

    async fn get_instances(&self, _config: &Config) -> Result<Vec<CloudInstance>> {
        let instances = self
            .ec2
            .describe_instances(
                &[],
                &[
                    Filter::tag(CREATED_BY_KEY, CREATED_BY_VALUE),
                    Filter::new("instance-state-name", &LIVE_STATES),
                ],
            )
            .await
            .context("unable to list instances")?;
        Ok(instances.into_iter().map(to_cloud_instance).collect())
    }

    async fn get_instance_by_name(&self, _config: &Config, name: &str) -> Result<CloudInstance> {
        self.find_instance(name).await.map(to_cloud_instance)
    }

    async fn delete_instance(&self, _config: &Config, name: &str) -> Result<()> {
        let instance = self.find_instance(name).await?;
        let security_group = network::find_instance_security_group(self.api(), name).await?;

        self.ec2
            .terminate_instances(&[instance.instance_id.clone()])
            .await
            .with_context(|| format!("unable to terminate {name}"))?;
        info!("[aws] terminating {} ({})", name, instance.instance_id);

        if let Some(sg) = security_group {
            self.wait_until_terminated(&instance.instance_id)
                .await
                .with_context(|| format!("security group {} of {name} was left behind", sg.group_id))?;
            if let Err(e) = self.ec2.delete_security_group(&sg.group_id).await {
                warn!("[aws] unable to delete security group {}: {:#}", sg.group_id, e);
            } else {
                debug!("[aws] deleted security group {}", sg.group_id);
            }
        }
        Ok(())
    }

    async fn start_instance(&self, _config: &Config, name: &str) -> Result<()> {
        let instance = self.find_instance(name).await?;
        self.ec2
            .start_instances(&[instance.instance_id])
            .await
            .with_context(|| format!("unable to start {name}"))
    }

    async fn stop_instance(&self, _config: &Config, name: &str) -> Result<()> {
        let instance = self.find_instance(name).await?;
        self.ec2
            .stop_instances(&[instance.instance_id])
            .await
            .with_context(|| format!("unable to stop {name}"))
    }

    async fn reboot_instance(&self, _config: &Config, name: &str) -> Result<()> {
        let instance = self.find_instance(name).await?;
        self.ec2
            .reboot_instances(&[instance.instance_id])
            .await
            .with_context(|| format!("unable to reboot {name}"))
    }

    async fn get_instance_logs(&self, _config: &Config, name: &str) -> Result<String> {
        let instance = self.find_instance(name).await?;
        let output = self
            .ec2
            .get_console_output(&instance.instance_id)
            .await
            .with_context(|| format!("unable to read console output of {name}"))?;
        match output {
            None => Ok(String::new()),
            Some(encoded) => {
                let raw = STANDARD
                    .decode(encoded.trim())
                    .context("console output is not valid base64")?;
                Ok(String::from_utf8_lossy(&raw).into_owned())
            }
        }
    }

    async fn create_volume(
        &self,
        config: &Config,
        name: &str,
        data: Option<&Path>,
        size: Option<&str>,
    ) -> Result<NanosVolume> {
        if data.is_some() {
            return Err(OpsError::unsupported(format!(
                "{}: volumes from local data",
                self.label
            )));
        }
        let size_gb = parse_size_gb(size.unwrap_or("1"))?;
        let (tags, _) = build_tags(&config.cloud.tags, name);
        let volume = self
            .ec2
            .create_volume(CreateVolumeInput {
                availability_zone: self.zone(&config.cloud).to_string(),
                size_gb,
                snapshot_id: None,
                tags,
            })
            .await
            .with_context(|| format!("unable to create volume {name}"))?;
        info!("[aws] created volume {} ({})", name, volume.volume_id);
        Ok(to_nanos_volume(volume))
    }

    async fn get_all_volumes(&self, _config: &Config) -> Result<Vec<NanosVolume>> {
        let volumes = self
            .ec2
            .describe_volumes(&[Filter::tag(CREATED_BY_KEY, CREATED_BY_VALUE)])
            .await
            .context("unable to list volumes")?;
        Ok(volumes.into_iter().map(to_nanos_volume).collect())
    }

    async fn delete_volume(&self, _config: &Config, name: &str) -> Result<()> {
        let volume = self.find_volume(name).await?;
        self.ec2
            .delete_volume(&volume.volume_id)
            .await
            .with_context(|| format!("unable to delete volume {name}"))
    }

    async fn attach_volume(
        &self,
        _config: &Config,
        instance_name: &str,
        volume_name: &str,
        attach_id: u32,
    ) -> Result<()> {
        let device = device_name(attach_id)?;
        let instance = self.find_instance(instance_name).await?;
        let volume = self.find_volume(volume_name).await?;
        self.ec2
            .attach_volume(&volume.volume_id, &instance.instance_id, &device)
            .await
            .with_context(|| format!("unable to attach {volume_name} to {instance_name}"))
    }

    async fn detach_volume(&self, _config: &Config, instance_name: &str, volume_name: &str) -> Result<()> {
        let instance = self.find_instance(instance_name).await?;
        let volume = self.find_volume(volume_name).await?;
        self.ec2
            .detach_volume(&volume.volume_id, &instance.instance_id)
            .await
            .with_context(|| format!("unable to detach {volume_name} from {instance_name}"))
    }
}

fn to_cloud_instance(i: Ec2Instance) -> CloudInstance {
    CloudInstance {
        name: name_tag(&i.tags).unwrap_or_default().to_string(),
        image: i
            .tags
            .iter()
            .find(|t| t.key == IMAGE_TAG)
            .map(|t| t.value.clone())
            .unwrap_or_default(),
        id: i.instance_id,
        status: i.state,
        created: i.launch_time,
        private_ips: i.private_ips,
        public_ips: i.public_ips,
        ports: vec![],
    }
}

fn to_nanos_volume(v: Volume) -> NanosVolume {
    let name = name_tag(&v.tags).unwrap_or_default().to_string();
    NanosVolume {
        id: v.volume_id,
        label: name.clone(),
        name,
        size: format!("{}GiB", v.size_gb),
        path: String::new(),
        created_at: v.create_time,
        attached_to: v.attached_instance_id.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_up_to_gib() {
        assert_eq!(parse_size_gb("10").unwrap(), 10);
        assert_eq!(parse_size_gb("2G").unwrap(), 2);
        assert_eq!(parse_size_gb("512m").unwrap(), 1);
        assert_eq!(parse_size_gb("1536mb").unwrap(), 2);
        assert!(parse_size_gb("lots").is_err());
        assert!(parse_size_gb("3x").is_err());
    }

    #[test]
    fn devices_skip_root() {
        assert_eq!(device_name(1).unwrap(), "/dev/sdb");
        assert_eq!(device_name(5).unwrap(), "/dev/sdf");
        assert!(device_name(0).is_err());
    }

    #[test]
    fn snapshot_states() {
        let task = |status: &str, progress: Option<&str>| ImportSnapshotTask {
            import_task_id: "t".into(),
            status: status.into(),
            progress: progress.map(str::to_string),
            snapshot_id: Some("snap-1".into()),
            status_message: None,
        };
        assert_eq!(snapshot_task_state(task("completed", None)), Poll::Ready("snap-1".into()));
        assert_eq!(
            snapshot_task_state(task("active", Some("42"))),
            Poll::Pending { progress: Some(42) }
        );
        assert_eq!(
            snapshot_task_state(task("deleting", None)),
            Poll::Failed("deleting".into())
        );
    }
}
