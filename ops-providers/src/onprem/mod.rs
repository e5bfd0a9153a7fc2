//! Guests run as local hypervisor processes. The only state is the record
//! directory kept by [`store::InstanceStore`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ops_common::{CloudImage, CloudInstance, Config, NanosVolume, OpsError, ProviderConfig};
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

pub mod dhcp;
pub mod discovery;
pub mod network;
pub mod qemu;
pub mod qmp;
pub mod store;
pub mod volume;

pub use discovery::{ArpResolver, IpResolver, ResolvedAddress};
pub use network::{IprouteNetworkService, NetworkService};
pub use qemu::{Hypervisor, Qemu};
pub use qmp::{MemoryStats, QmpClient};
pub use store::{InstanceRecord, InstanceStore, StoredInstance};

use crate::{ImageBuilder, MkfsImageBuilder, Provider};

const MGMT_PORTS: std::ops::Range<u16> = 40000..50000;
const LOOPBACK: &str = "127.0.0.1";

/// Locally administered address under the QEMU prefix.
pub fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

pub struct OnPrem {
    builder: Arc<dyn ImageBuilder>,
    hypervisor: Arc<dyn Hypervisor>,
    network: Arc<dyn NetworkService>,
    resolver: Arc<dyn IpResolver>,
    log_dir: PathBuf,
    manage_host_network: bool,
}

impl Default for OnPrem {
    fn default() -> Self {
        Self::new()
    }
}

impl OnPrem {
    pub fn new() -> Self {
        let log_dir = std::env::temp_dir();
        Self {
            builder: Arc::new(MkfsImageBuilder::new()),
            hypervisor: Arc::new(Qemu::new().with_log_dir(&log_dir)),
            network: Arc::new(IprouteNetworkService),
            resolver: Arc::new(ArpResolver),
            log_dir,
            manage_host_network: cfg!(target_os = "linux"),
        }
    }

    pub fn with_hypervisor(mut self, hypervisor: Arc<dyn Hypervisor>) -> Self {
        self.hypervisor = hypervisor;
        self
    }

    pub fn with_image_builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_ip_resolver(mut self, resolver: Arc<dyn IpResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Tap and bridge setup for bridged instances goes through `network`.
    pub fn with_network_service(mut self, network: Arc<dyn NetworkService>) -> Self {
        self.network = network;
        self.manage_host_network = true;
        self
    }

    /// Where guest consoles are read from; must match the hypervisor's.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn store(config: &Config) -> InstanceStore {
        InstanceStore::new(config.instances_dir())
    }

    /// Boots the configured image and returns the hypervisor pid.
    pub async fn create_instance_pid(&self, config: &Config) -> Result<u32> {
        let image_name = &config.cloud.image_name;
        let image_path = config.image_file(image_name);
        if image_name.is_empty() || !image_path.is_file() {
            return Err(OpsError::ImageNotFound(image_name.clone()).into());
        }

        let mut run = config.run.clone();
        if !run.mounts.is_empty() {
            run.drives = volume::resolve_mounts(&config.volumes_dir(), &run.mounts)?;
        }
        if run.bridged && run.mac.is_empty() {
            run.mac = random_mac();
        }
        if run.bridged && !run.tap_name.is_empty() && self.manage_host_network {
            let bridge = if run.bridge_name.is_empty() {
                network::BRIDGE_NAME
            } else {
                run.bridge_name.as_str()
            };
            network::setup_network_interfaces(
                self.network.as_ref(),
                &run.tap_name,
                Some(bridge),
                &run.ip_address,
                &run.netmask,
            )
            .await
            .with_context(|| format!("unable to set up {} on {}", run.tap_name, bridge))?;
        }
        if run.instance_name.is_empty() {
            run.instance_name = image_name.split('.').next().unwrap_or(image_name).to_string();
        }
        run.image_path = image_path.clone();
        run.mgmt = rand::thread_rng().gen_range(MGMT_PORTS);

        info!("[onprem] booting {} from {}", run.instance_name, image_path.display());
        let pid = self.hypervisor.start(&run).await?;

        let record = InstanceRecord {
            instance: run.instance_name.clone(),
            image: image_path.to_string_lossy().into_owned(),
            ports: run.ports.clone(),
            bridged: run.bridged,
            private_ip: if run.bridged { run.ip_address.clone() } else { String::new() },
            mac: run.mac.clone(),
            pid: pid.to_string(),
            mgmt: run.mgmt.to_string(),
            arch: Some(run.arch_or_host()),
        };
        Self::store(config).write(pid, &record)?;
        Ok(pid)
    }

    /// Looks up a bridged guest's address and caches it on its record.
    pub async fn find_bridged_ip_by_pid(&self, config: &Config, pid: u32) -> Option<String> {
        let found = self.resolver.resolve(pid).await?;
        if let Err(e) = Self::store(config).log_mac(pid, &found.mac, &found.ip) {
            warn!("[onprem] unable to cache address of {}: {:#}", pid, e);
        }
        Some(found.ip)
    }

    pub fn instance_record(&self, config: &Config, name: &str) -> Result<StoredInstance> {
        Self::store(config).find_by_name(name)
    }

    fn qmp(&self, config: &Config, name: &str) -> Result<(StoredInstance, QmpClient)> {
        let found = self.instance_record(config, name)?;
        let port = found.record.mgmt_port()?;
        Ok((found, QmpClient::localhost(port)))
    }

    pub async fn instance_stats(&self, config: &Config, name: &str) -> Result<MemoryStats> {
        let (found, qmp) = self.qmp(config, name)?;
        let arch = found.record.arch.unwrap_or_else(ops_common::Arch::host);
        qmp.memory_stats(arch).await
    }

    fn image_entry(path: &Path, meta: &std::fs::Metadata) -> CloudImage {
        let name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        CloudImage {
            id: name.clone(),
            name,
            status: String::new(),
            size: meta.len() as i64,
            path: path.to_string_lossy().into_owned(),
            created: meta.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}

#[async_trait]
impl Provider for OnPrem {
    fn name(&self) -> &'static str {
        "onprem"
    }

    async fn initialize(&mut self, _config: &ProviderConfig) -> Result<()> {
        Ok(())
    }

    async fn build_image(&self, config: &Config) -> Result<PathBuf> {
        self.builder.build_image(config).await
    }

    async fn build_image_with_package(&self, config: &Config, package_path: &Path) -> Result<PathBuf> {
        self.builder.build_image_from_package(package_path, config).await
    }

    async fn create_image(&self, config: &Config, image_path: &Path) -> Result<()> {
        let name = if config.cloud.image_name.is_empty() {
            image_path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .ok_or_else(|| OpsError::ImageNotFound(image_path.display().to_string()))?
        } else {
            config.cloud.image_name.clone()
        };
        let target = config.image_file(&name);

        let same = match (std::fs::canonicalize(image_path), std::fs::canonicalize(&target)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if same {
            debug!("[onprem] image {} already in place", name);
            return Ok(());
        }
        tokio::fs::create_dir_all(config.images_dir()).await?;
        tokio::fs::copy(image_path, &target)
            .await
            .with_context(|| format!("unable to copy {} to {}", image_path.display(), target.display()))?;
        info!("[onprem] image {} created", name);
        Ok(())
    }

    async fn get_images(&self, config: &Config) -> Result<Vec<CloudImage>> {
        let dir = config.images_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).with_context(|| format!("unable to read {}", dir.display())),
        };
        let mut images = Vec::new();
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                images.push(Self::image_entry(&entry.path(), &meta));
            }
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    async fn delete_image(&self, config: &Config, image_name: &str) -> Result<()> {
        match tokio::fs::remove_file(config.image_file(image_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(OpsError::ImageNotFound(image_name.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_instance(&self, config: &Config) -> Result<()> {
        self.create_instance_pid(config).await.map(drop)
    }

    async fn get_instances(&self, config: &Config) -> Result<Vec<CloudInstance>> {
        let mut out = Vec::new();
        for stored in Self::store(config).list_live()? {
            let r = &stored.record;
            let private_ips = if !r.bridged {
                vec![LOOPBACK.to_string()]
            } else if !r.private_ip.is_empty() {
                vec![r.private_ip.clone()]
            } else {
                self.resolver
                    .resolve(stored.pid)
                    .await
                    .map(|found| found.ip)
                    .into_iter()
                    .collect()
            };
            out.push(CloudInstance {
                id: stored.pid.to_string(),
                name: r.instance.clone(),
                status: "Running".into(),
                created: stored.created,
                private_ips,
                public_ips: vec![],
                ports: r.ports.clone(),
                image: r.image.clone(),
            });
        }
        Ok(out)
    }

    async fn delete_instance(&self, config: &Config, name: &str) -> Result<()> {
        let store = Self::store(config);
        let found = store.find_by_name(name)?;
        store::kill_process(found.pid)?;
        store.remove(found.pid)?;
        info!("[onprem] deleted instance {} (pid {})", name, found.pid);
        Ok(())
    }

    async fn start_instance(&self, config: &Config, name: &str) -> Result<()> {
        let (_, qmp) = self.qmp(config, name)?;
        qmp.command("cont").await.map(drop)
    }

    async fn stop_instance(&self, config: &Config, name: &str) -> Result<()> {
        let (_, qmp) = self.qmp(config, name)?;
        qmp.command("stop").await.map(drop)
    }

    async fn reboot_instance(&self, config: &Config, name: &str) -> Result<()> {
        let (_, qmp) = self.qmp(config, name)?;
        qmp.command("system_reset").await.map(drop)
    }

    async fn get_instance_logs(&self, _config: &Config, name: &str) -> Result<String> {
        let path = Qemu::log_path(&self.log_dir, name);
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("no console log for {name} at {}", path.display()))
    }

    async fn create_volume(
        &self,
        config: &Config,
        name: &str,
        data: Option<&Path>,
        size: Option<&str>,
    ) -> Result<NanosVolume> {
        volume::create_volume(config, name, data, size).await
    }

    async fn get_all_volumes(&self, config: &Config) -> Result<Vec<NanosVolume>> {
        volume::list_volumes(&config.volumes_dir())
    }

    async fn delete_volume(&self, config: &Config, name: &str) -> Result<()> {
        volume::delete_volume(&config.volumes_dir(), name).await
    }

    /// Hot-plugs the volume file as a SCSI disk of the running guest.
    async fn attach_volume(
        &self,
        config: &Config,
        instance_name: &str,
        volume_name: &str,
        attach_id: u32,
    ) -> Result<()> {
        let vol = volume::find_volume(&config.volumes_dir(), volume_name)?;
        let (_, qmp) = self.qmp(config, instance_name)?;
        qmp.execute(&[
            json!({"execute": "blockdev-add", "arguments": {
                "driver": "raw", "node-name": vol.label,
                "file": {"driver": "file", "filename": vol.path}}}),
            json!({"execute": "device_add", "arguments": {
                "driver": "scsi-hd", "bus": "scsi0.0", "drive": vol.label, "id": vol.label,
                "device_id": format!("persistent-disk-{attach_id}")}}),
        ])
        .await
        .with_context(|| format!("unable to attach {volume_name} to {instance_name}"))?;
        info!("[onprem] attached {} to {}", vol.label, instance_name);
        Ok(())
    }

    async fn detach_volume(&self, config: &Config, instance_name: &str, volume_name: &str) -> Result<()> {
        let vol = volume::find_volume(&config.volumes_dir(), volume_name)?;
        let (_, qmp) = self.qmp(config, instance_name)?;
        qmp.execute(&[
            json!({"execute": "device_del", "arguments": {"id": vol.label}}),
            json!({"execute": "blockdev-del", "arguments": {"node-name": vol.label}}),
        ])
        .await
        .with_context(|| format!("unable to detach {volume_name} from {instance_name}"))?;
        info!("[onprem] detached {} from {}", vol.label, instance_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use ops_common::RunConfig;

    use super::network::tests::FakeNetwork;

    struct OwnPid {
        started: Mutex<Vec<RunConfig>>,
    }

    #[async_trait]
    impl Hypervisor for OwnPid {
        async fn start(&self, run: &RunConfig) -> Result<u32> {
            self.started.lock().unwrap().push(run.clone());
            Ok(std::process::id())
        }
    }

    struct CountingResolver(AtomicUsize);

    #[async_trait]
    impl IpResolver for CountingResolver {
        async fn resolve(&self, _pid: u32) -> Option<ResolvedAddress> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(ResolvedAddress {
                mac: "52:54:00:01:02:03".into(),
                ip: "192.168.1.77".into(),
            })
        }
    }

    fn setup() -> (tempfile::TempDir, Config, Arc<OwnPid>) {
        let home = tempfile::tempdir().unwrap();
        let mut config = Config::default().with_home(home.path());
        config.cloud.image_name = "web.img".into();
        std::fs::create_dir_all(config.images_dir()).unwrap();
        std::fs::write(config.image_file("web.img"), b"disk").unwrap();
        (home, config, Arc::new(OwnPid { started: Mutex::new(vec![]) }))
    }

    #[tokio::test]
    async fn create_writes_record_named_by_pid() {
        let (_home, config, hv) = setup();
        let onprem = OnPrem::new().with_hypervisor(hv.clone());

        let pid = onprem.create_instance_pid(&config).await.unwrap();
        assert_eq!(pid, std::process::id());

        let record = OnPrem::store(&config).read(pid).unwrap().unwrap();
        assert_eq!(record.instance, "web");
        assert_eq!(record.pid, pid.to_string());
        let mgmt: u16 = record.mgmt.parse().unwrap();
        assert!(MGMT_PORTS.contains(&mgmt));

        let started = hv.started.lock().unwrap();
        assert_eq!(started[0].image_path, config.image_file("web.img"));
        assert_eq!(started[0].mgmt, mgmt);
    }

    #[tokio::test]
    async fn missing_image_boots_nothing() {
        let (_home, mut config, hv) = setup();
        config.cloud.image_name = "absent".into();
        let onprem = OnPrem::new().with_hypervisor(hv.clone());

        let err = onprem.create_instance_pid(&config).await.unwrap_err();
        assert!(matches!(OpsError::find(&err), Some(OpsError::ImageNotFound(n)) if n == "absent"));
        assert!(hv.started.lock().unwrap().is_empty());
        assert!(!config.instances_dir().exists());
    }

    #[tokio::test]
    async fn bridged_tap_is_prepared_before_boot() {
        let (_home, mut config, hv) = setup();
        config.run.bridged = true;
        config.run.tap_name = "tap9".into();
        config.run.ip_address = "10.0.0.5".into();
        let net = Arc::new(FakeNetwork::default());
        let onprem = OnPrem::new()
            .with_hypervisor(hv.clone())
            .with_network_service(net.clone());

        onprem.create_instance_pid(&config).await.unwrap();
        let calls = net.calls();
        assert!(calls.contains(&"add_tap tap9".to_string()));
        assert!(calls.contains(&"add_address br0 10.0.0.66/24".to_string()));
        assert!(!hv.started.lock().unwrap()[0].mac.is_empty());
    }

    #[tokio::test]
    async fn listing_resolves_bridged_addresses_without_persisting() {
        let (_home, mut config, hv) = setup();
        config.run.bridged = true;
        let resolver = Arc::new(CountingResolver(AtomicUsize::new(0)));
        let onprem = OnPrem::new()
            .with_hypervisor(hv)
            .with_ip_resolver(resolver.clone());
        let pid = onprem.create_instance_pid(&config).await.unwrap();

        let listed = onprem.get_instances(&config).await.unwrap();
        assert_eq!(listed[0].private_ips, vec!["192.168.1.77"]);
        assert_eq!(listed[0].status, "Running");
        assert!(OnPrem::store(&config).read(pid).unwrap().unwrap().private_ip.is_empty());

        assert_eq!(
            onprem.find_bridged_ip_by_pid(&config, pid).await.as_deref(),
            Some("192.168.1.77")
        );
        let record = OnPrem::store(&config).read(pid).unwrap().unwrap();
        assert_eq!(record.private_ip, "192.168.1.77");
        assert_eq!(record.mac, "52:54:00:01:02:03");

        onprem.get_instances(&config).await.unwrap();
        assert_eq!(resolver.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn user_mode_instances_report_loopback() {
        let (_home, config, hv) = setup();
        let onprem = OnPrem::new().with_hypervisor(hv);
        onprem.create_instance_pid(&config).await.unwrap();
        let found = onprem.get_instance_by_name(&config, "web").await.unwrap();
        assert_eq!(found.private_ips, vec![LOOPBACK]);
        assert!(OpsError::is_not_found(
            &onprem.get_instance_by_name(&config, "db").await.unwrap_err()
        ));
    }

    #[tokio::test]
    async fn images_are_copied_listed_and_deleted() {
        let (home, mut config, _) = setup();
        let onprem = OnPrem::new();
        let built = home.path().join("build.img");
        std::fs::write(&built, b"0123456789").unwrap();

        config.cloud.image_name = "app".into();
        onprem.create_image(&config, &built).await.unwrap();
        onprem.create_image(&config, &config.image_file("app")).await.unwrap();

        let images = onprem.get_images(&config).await.unwrap();
        let names: Vec<_> = images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["app", "web.img"]);
        assert_eq!(images[0].size, 10);

        onprem.delete_image(&config, "app").await.unwrap();
        assert!(OpsError::is_not_found(&onprem.delete_image(&config, "app").await.unwrap_err()));
    }

    #[tokio::test]
    async fn logs_come_from_the_log_dir() {
        let (home, config, _) = setup();
        let onprem = OnPrem::new().with_log_dir(home.path());
        std::fs::write(home.path().join("web.log"), "en1: assigned 10.0.2.15\n").unwrap();
        assert!(onprem
            .get_instance_logs(&config, "web")
            .await
            .unwrap()
            .contains("assigned"));
        assert!(onprem.get_instance_logs(&config, "db").await.is_err());
    }

    #[test]
    fn random_macs_are_local() {
        let mac = random_mac();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
        assert_eq!(mac, mac.to_lowercase());
    }
}
