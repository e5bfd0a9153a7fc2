use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ops_common::{CloudImage, CloudInstance, Config, NanosVolume, OpsError, ProviderConfig};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::aws::parse_size_gb;
use crate::tags::{build_tags, flatten_tags, parse_flat_tags, CREATED_BY_KEY, CREATED_BY_VALUE};
use crate::waiter::{Poll, Waiter};
use crate::{ImageBuilder, Provider};

pub const API_URL: &str = "https://api.scaleway.com";
const DEFAULT_ZONE: &str = "fr-par-1";
const DEFAULT_COMMERCIAL_TYPE: &str = "DEV1-S";
const IMAGE_TAG: &str = "image";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

pub struct ScalewayProvider {
    client: Client,
    base_url: String,
    object_storage_url: Option<String>,
    project_id: String,
    secret_key: String,
    zone: String,
    builder: Arc<dyn ImageBuilder>,
    stop_waiter: Waiter,
    snapshot_waiter: Waiter,
}

impl ScalewayProvider {
    pub fn new(project_id: String, secret_key: String, builder: Arc<dyn ImageBuilder>) -> Result<Self> {
        // Default reqwest client has no overall timeout. If Scaleway stalls, a job can hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .context("unable to build http client")?;
        Ok(Self {
            client,
            base_url: API_URL.to_string(),
            object_storage_url: None,
            project_id: project_id.trim().to_string(),
            secret_key: secret_key.trim().to_string(),
            zone: DEFAULT_ZONE.to_string(),
            builder,
            stop_waiter: Waiter::new("server poweroff", Duration::from_secs(2), 30),
            snapshot_waiter: Waiter::new("snapshot import", Duration::from_secs(15), 120),
        })
    }

    /// Points the client at another API endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Uploads images to this endpoint instead of the zone's regional one.
    pub fn with_object_storage_url(mut self, url: impl Into<String>) -> Self {
        self.object_storage_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn with_waiters(mut self, stop: Waiter, snapshot: Waiter) -> Self {
        self.stop_waiter = stop;
        self.snapshot_waiter = snapshot;
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Auth-Token",
            HeaderValue::from_str(&self.secret_key).context("secret key is not a valid header")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn zone<'a>(&'a self, cloud: &'a ProviderConfig) -> &'a str {
        if cloud.zone.is_empty() {
            &self.zone
        } else {
            &cloud.zone
        }
    }

    fn instance_url(&self, zone: &str, path: &str) -> String {
        format!("{}/instance/v1/zones/{}/{}", self.base_url, zone, path)
    }

    fn object_url(&self, zone: &str, bucket: &str, key: &str) -> String {
        match &self.object_storage_url {
            Some(base) => format!("{base}/{bucket}/{key}"),
            None => format!("https://s3.{}.scw.cloud/{}/{}", zone_region(zone), bucket, key),
        }
    }

    async fn upload_object(&self, url: &str, image_path: &Path) -> Result<()> {
        let body = tokio::fs::read(image_path)
            .await
            .with_context(|| format!("unable to read image {}", image_path.display()))?;
        info!("🔵 [Scaleway API] uploading {} ({} bytes) to {}", image_path.display(), body.len(), url);
        let resp = self
            .client
            .put(url)
            .header("X-Auth-Token", HeaderValue::from_str(&self.secret_key).context("secret key is not a valid header")?)
            .header(CONTENT_TYPE, "application/octet-stream")
            .timeout(UPLOAD_TIMEOUT)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Scaleway PUT {url} failed to send"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!("❌ [Scaleway API] PUT {} failed: status={}, response={}", url, status.as_u16(), text);
            return Err(anyhow!("Scaleway PUT {} failed: status={} body={}", url, status.as_u16(), text));
        }
        debug!("✅ [Scaleway API] PUT {} succeeded: status={}", url, status.as_u16());
        Ok(())
    }

    fn block_url(&self, zone: &str, path: &str) -> String {
        format!("{}/block/v1alpha1/zones/{}/{}", self.base_url, zone, path)
    }

    async fn request(&self, method: Method, url: &str, body: Option<Value>) -> Result<Value> {
        debug!("🔵 [Scaleway API] {} {}", method, url);
        let mut req = self.client.request(method.clone(), url).headers(self.headers()?);
        if let Some(body) = &body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("Scaleway {method} {url} failed to send"))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!(
                "❌ [Scaleway API] {} {} failed: status={}, response={}",
                method,
                url,
                status.as_u16(),
                text
            );
            return Err(anyhow!(
                "Scaleway {} {} failed: status={} body={}",
                method,
                url,
                status.as_u16(),
                text
            ));
        }
        debug!("✅ [Scaleway API] {} {} succeeded: status={}", method, url, status.as_u16());

        if text.trim().is_empty() || status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).with_context(|| format!("invalid JSON from {url}"))
    }

    async fn list_servers(&self, zone: &str) -> Result<Vec<Value>> {
        let url = self.instance_url(
            zone,
            &format!("servers?project={}&tags={}={}", self.project_id, CREATED_BY_KEY, CREATED_BY_VALUE),
        );
        let resp = self.request(Method::GET, &url, None).await?;
        Ok(array(&resp, "servers"))
    }

    async fn find_server(&self, zone: &str, name: &str) -> Result<Value> {
        self.list_servers(zone)
            .await?
            .into_iter()
            .find(|s| s["name"].as_str() == Some(name))
            .ok_or_else(|| OpsError::InstanceNotFound(name.to_string()).into())
    }

    async fn server_state(&self, zone: &str, server_id: &str) -> Result<Option<String>> {
        let url = self.instance_url(zone, &format!("servers/{server_id}"));
        let resp = self.request(Method::GET, &url, None).await?;
        Ok(resp["server"]["state"].as_str().map(str::to_string))
    }

    async fn server_action(&self, zone: &str, server_id: &str, action: &str) -> Result<()> {
        let url = self.instance_url(zone, &format!("servers/{server_id}/action"));
        info!("🔵 [Scaleway API] {} server {} in {}", action, server_id, zone);
        self.request(Method::POST, &url, Some(json!({ "action": action })))
            .await
            .map(|_| ())
    }

    async fn list_images(&self, zone: &str) -> Result<Vec<Value>> {
        let url = self.instance_url(zone, &format!("images?project={}&public=false", self.project_id));
        let resp = self.request(Method::GET, &url, None).await?;
        Ok(array(&resp, "images")
            .into_iter()
            .filter(|i| parse_flat_tags(&string_list(&i["tags"])).iter().any(|t| {
                t.key == CREATED_BY_KEY && t.value == CREATED_BY_VALUE
            }))
            .collect())
    }

    async fn find_image(&self, zone: &str, name: &str) -> Result<Value> {
        self.list_images(zone)
            .await?
            .into_iter()
            .find(|i| i["name"].as_str() == Some(name))
            .ok_or_else(|| OpsError::ImageNotFound(name.to_string()).into())
    }

    async fn list_volumes(&self, zone: &str) -> Result<Vec<Value>> {
        let url = self.block_url(zone, &format!("volumes?project_id={}", self.project_id));
        let resp = self.request(Method::GET, &url, None).await?;
        Ok(array(&resp, "volumes")
            .into_iter()
            .filter(|v| string_list(&v["tags"]).iter().any(|t| *t == format!("{CREATED_BY_KEY}={CREATED_BY_VALUE}")))
            .collect())
    }

    async fn find_volume(&self, zone: &str, name: &str) -> Result<Value> {
        self.list_volumes(zone)
            .await?
            .into_iter()
            .find(|v| v["name"].as_str() == Some(name) || v["id"].as_str() == Some(name))
            .ok_or_else(|| OpsError::VolumeNotFound(name.to_string()).into())
    }

    async fn wait_until_stopped(&self, zone: &str, server_id: &str) -> Result<()> {
        self.stop_waiter
            .wait(|| async move {
                Ok(match self.server_state(zone, server_id).await?.as_deref() {
                    Some(s) if is_stopped(s) => Poll::Ready(()),
                    _ => Poll::pending(),
                })
            })
            .await
    }
}

/// `fr-par-1` lives in region `fr-par`.
fn zone_region(zone: &str) -> &str {
    match zone.rsplit_once('-') {
        Some((region, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => region,
        _ => zone,
    }
}

fn is_stopped(state: &str) -> bool {
    matches!(
        state.to_ascii_lowercase().as_str(),
        "stopped" | "stopped_in_place" | "stopped in place"
    )
}

fn array(v: &Value, key: &str) -> Vec<Value> {
    v[key].as_array().cloned().unwrap_or_default()
}

fn string_list(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn timestamp(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

pub fn server_to_instance(server: &Value) -> CloudInstance {
    let tags = parse_flat_tags(&string_list(&server["tags"]));
    let mut public_ips: Vec<String> = server["public_ips"]
        .as_array()
        .map(|a| a.iter().filter_map(|ip| ip["address"].as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    if public_ips.is_empty() {
        if let Some(ip) = server["public_ip"]["address"].as_str() {
            public_ips.push(ip.to_string());
        }
    }
    CloudInstance {
        id: server["id"].as_str().unwrap_or_default().to_string(),
        name: server["name"].as_str().unwrap_or_default().to_string(),
        status: server["state"].as_str().unwrap_or_default().to_string(),
        created: timestamp(&server["creation_date"]),
        private_ips: server["private_ip"].as_str().map(|ip| vec![ip.to_string()]).unwrap_or_default(),
        public_ips,
        ports: vec![],
        image: tags
            .iter()
            .find(|t| t.key == IMAGE_TAG)
            .map(|t| t.value.clone())
            .unwrap_or_default(),
    }
}

pub fn image_to_cloud(image: &Value) -> CloudImage {
    CloudImage {
        id: image["id"].as_str().unwrap_or_default().to_string(),
        name: image["name"].as_str().unwrap_or_default().to_string(),
        status: image["state"].as_str().unwrap_or_default().to_string(),
        size: image["root_volume"]["size"].as_i64().unwrap_or_default(),
        path: String::new(),
        created: timestamp(&image["creation_date"]),
    }
}

fn volume_to_nanos(volume: &Value) -> NanosVolume {
    let name = volume["name"].as_str().unwrap_or_default().to_string();
    NanosVolume {
        id: volume["id"].as_str().unwrap_or_default().to_string(),
        label: name.clone(),
        name,
        size: volume["size"].as_i64().map(|s| format!("{}GB", s / 1_000_000_000)).unwrap_or_default(),
        path: String::new(),
        created_at: timestamp(&volume["created_at"]),
        attached_to: volume["references"][0]["product_resource_id"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    }
}

fn scaleway_arch(config: &Config) -> &'static str {
    match config.run.arch_or_host() {
        ops_common::Arch::Amd64 => "x86_64",
        ops_common::Arch::Arm64 => "arm64",
    }
}

#[async_trait]
impl Provider for ScalewayProvider {
    fn name(&self) -> &'static str {
        "scaleway"
    }

    async fn initialize(&mut self, config: &ProviderConfig) -> Result<()> {
        if !config.zone.is_empty() {
            self.zone = config.zone.clone();
        }
        if !config.project_id.is_empty() {
            self.project_id = config.project_id.clone();
        }
        if self.project_id.is_empty() || self.secret_key.is_empty() {
            return Err(OpsError::Environment(
                "SCALEWAY_PROJECT_ID and SCALEWAY_SECRET_KEY are required".into(),
            )
            .into());
        }
        Ok(())
    }

    async fn build_image(&self, config: &Config) -> Result<PathBuf> {
        self.builder.build_image(config).await
    }

    async fn build_image_with_package(&self, config: &Config, package_path: &Path) -> Result<PathBuf> {
        self.builder.build_image_from_package(package_path, config).await
    }

    /// Imports an image already uploaded to `bucket_name` (object key = file
    /// name) as a snapshot, then registers it.
    async fn create_image(&self, config: &Config, image_path: &Path) -> Result<()> {
        let cloud = &config.cloud;
        let zone = self.zone(cloud);
        if cloud.bucket_name.is_empty() {
            return Err(OpsError::Environment(
                "scaleway image import needs a bucket_name holding the image".into(),
            )
            .into());
        }
        let key = image_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("invalid image path {}", image_path.display()))?;
        let image_name = if cloud.image_name.is_empty() { key.clone() } else { cloud.image_name.clone() };
        let (tags, _) = build_tags(&cloud.tags, &image_name);

        let object = self.object_url(zone, &cloud.bucket_name, &key);
        self.upload_object(&object, image_path)
            .await
            .with_context(|| format!("unable to upload {} to bucket {}", key, cloud.bucket_name))?;

        let snapshot = self
            .request(
                Method::POST,
                &self.instance_url(zone, "snapshots"),
                Some(json!({
                    "name": image_name,
                    "project": self.project_id,
                    "volume_type": "l_ssd",
                    "bucket": cloud.bucket_name,
                    "key": key,
                })),
            )
            .await
            .with_context(|| format!("unable to import s3://{}/{}", cloud.bucket_name, key))?;
        let snapshot_id = snapshot["snapshot"]["id"]
            .as_str()
            .ok_or_else(|| anyhow!("No snapshot id in import response"))?
            .to_string();
        info!("🔵 [Scaleway API] importing {} as snapshot {}", image_name, snapshot_id);

        let url = self.instance_url(zone, &format!("snapshots/{snapshot_id}"));
        let url = url.as_str();
        self.snapshot_waiter
            .wait(|| async move {
                let resp = self.request(Method::GET, url, None).await?;
                Ok(match resp["snapshot"]["state"].as_str().unwrap_or_default() {
                    "available" => Poll::Ready(()),
                    state @ ("error" | "invalid_data") => Poll::Failed(state.to_string()),
                    _ => Poll::pending(),
                })
            })
            .await
            .with_context(|| format!("snapshot {snapshot_id} for {image_name} did not become available"))?;

        self.request(
            Method::POST,
            &self.instance_url(zone, "images"),
            Some(json!({
                "name": image_name,
                "root_volume": snapshot_id,
                "arch": scaleway_arch(config),
                "project": self.project_id,
                "tags": flatten_tags(&tags),
            })),
        )
        .await
        .with_context(|| format!("unable to register image {image_name}; snapshot {snapshot_id} remains"))?;
        info!("✅ [Scaleway API] image {} created", image_name);
        Ok(())
    }

    async fn get_images(&self, config: &Config) -> Result<Vec<CloudImage>> {
        let images = self.list_images(self.zone(&config.cloud)).await?;
        Ok(images.iter().map(image_to_cloud).collect())
    }

    async fn delete_image(&self, config: &Config, image_name: &str) -> Result<()> {
        let zone = self.zone(&config.cloud);
        let image = self.find_image(zone, image_name).await?;
        let id = image["id"].as_str().unwrap_or_default();
        self.request(Method::DELETE, &self.instance_url(zone, &format!("images/{id}")), None)
            .await
            .with_context(|| format!("unable to delete image {image_name}"))?;

        if let Some(snapshot) = image["root_volume"]["id"].as_str() {
            let url = self.instance_url(zone, &format!("snapshots/{snapshot}"));
            if let Err(e) = self.request(Method::DELETE, &url, None).await {
                warn!("⚠️ [Scaleway API] snapshot {} of {} left behind: {:#}", snapshot, image_name, e);
            }
        }
        Ok(())
    }

    async fn create_instance(&self, config: &Config) -> Result<()> {
        let cloud = &config.cloud;
        let zone = self.zone(cloud);
        let image = self.find_image(zone, &cloud.image_name).await?;

        let default_name = if config.run.instance_name.is_empty() {
            format!("{}-{}", cloud.image_name, Utc::now().timestamp())
        } else {
            config.run.instance_name.clone()
        };
        let (mut tags, name) = build_tags(&cloud.tags, &default_name);
        tags.push(ops_common::Tag::new(IMAGE_TAG, &cloud.image_name));

        let commercial_type = if cloud.flavor.is_empty() { DEFAULT_COMMERCIAL_TYPE } else { cloud.flavor.as_str() };
        let body = json!({
            "name": name,
            "commercial_type": commercial_type,
            "project": self.project_id,
            "image": image["id"],
            "tags": flatten_tags(&tags),
            "dynamic_ip_required": true
        });
        info!(
            "🔵 [Scaleway API] Creating instance {}: type={}, image={}, zone={}",
            name, commercial_type, cloud.image_name, zone
        );
        let resp = self
            .request(Method::POST, &self.instance_url(zone, "servers"), Some(body))
            .await
            .with_context(|| format!("unable to create server {name}"))?;
        let server_id = resp["server"]["id"]
            .as_str()
            .ok_or_else(|| anyhow!("No server id in create response"))?
            .to_string();

        if !cloud.user_data.trim().is_empty() {
            let url = self.instance_url(zone, &format!("servers/{server_id}/user_data/cloud-init"));
            let mut headers = self.headers()?;
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            let resp = self
                .client
                .patch(&url)
                .headers(headers)
                .body(cloud.user_data.clone())
                .send()
                .await?;
            if !resp.status().is_success() {
                warn!("⚠️ [Scaleway API] cloud-init for {} rejected: status={}", name, resp.status().as_u16());
            }
        }

        self.server_action(zone, &server_id, "poweron")
            .await
            .with_context(|| format!("server {name} created but did not power on"))
    }

    async fn get_instances(&self, config: &Config) -> Result<Vec<CloudInstance>> {
        let servers = self.list_servers(self.zone(&config.cloud)).await?;
        Ok(servers.iter().map(server_to_instance).collect())
    }

    async fn delete_instance(&self, config: &Config, name: &str) -> Result<()> {
        let zone = self.zone(&config.cloud);
        let server = self.find_server(zone, name).await?;
        let server_id = server["id"].as_str().unwrap_or_default().to_string();

        // Scaleway requires instances to be powered off before deletion
        let state = server["state"].as_str().unwrap_or_default();
        if !is_stopped(state) {
            info!("🔵 [Scaleway API] Instance {} is {} - stopping before termination", name, state);
            self.server_action(zone, &server_id, "poweroff").await?;
            self.wait_until_stopped(zone, &server_id)
                .await
                .with_context(|| format!("server {name} did not stop"))?;
        }

        self.request(Method::DELETE, &self.instance_url(zone, &format!("servers/{server_id}")), None)
            .await
            .with_context(|| format!("unable to delete server {name}"))?;
        info!("✅ [Scaleway API] deleted server {}", name);
        Ok(())
    }

    async fn start_instance(&self, config: &Config, name: &str) -> Result<()> {
        let zone = self.zone(&config.cloud);
        let server = self.find_server(zone, name).await?;
        self.server_action(zone, server["id"].as_str().unwrap_or_default(), "poweron").await
    }

    async fn stop_instance(&self, config: &Config, name: &str) -> Result<()> {
        let zone = self.zone(&config.cloud);
        let server = self.find_server(zone, name).await?;
        if is_stopped(server["state"].as_str().unwrap_or_default()) {
            info!("ℹ️ [Scaleway API] Server {} already stopped", name);
            return Ok(());
        }
        self.server_action(zone, server["id"].as_str().unwrap_or_default(), "poweroff").await
    }

    async fn reboot_instance(&self, config: &Config, name: &str) -> Result<()> {
        let zone = self.zone(&config.cloud);
        let server = self.find_server(zone, name).await?;
        self.server_action(zone, server["id"].as_str().unwrap_or_default(), "reboot").await
    }

    async fn create_volume(
        &self,
        config: &Config,
        name: &str,
        data: Option<&Path>,
        size: Option<&str>,
    ) -> Result<NanosVolume> {
        if data.is_some() {
            return Err(OpsError::unsupported("scaleway: volumes from local data"));
        }
        let zone = self.zone(&config.cloud);
        let size_bytes = parse_size_gb(size.unwrap_or("1"))? * 1_000_000_000;
        let (tags, _) = build_tags(&config.cloud.tags, name);
        let resp = self
            .request(
                Method::POST,
                &self.block_url(zone, "volumes"),
                Some(json!({
                    "name": name,
                    "project_id": self.project_id,
                    "from_empty": { "size": size_bytes },
                    "tags": flatten_tags(&tags),
                })),
            )
            .await
            .with_context(|| format!("unable to create volume {name}"))?;
        Ok(volume_to_nanos(&resp))
    }

    async fn get_all_volumes(&self, config: &Config) -> Result<Vec<NanosVolume>> {
        let volumes = self.list_volumes(self.zone(&config.cloud)).await?;
        Ok(volumes.iter().map(volume_to_nanos).collect())
    }

    async fn delete_volume(&self, config: &Config, name: &str) -> Result<()> {
        let zone = self.zone(&config.cloud);
        let volume = self.find_volume(zone, name).await?;
        let id = volume["id"].as_str().unwrap_or_default();
        self.request(Method::DELETE, &self.block_url(zone, &format!("volumes/{id}")), None)
            .await
            .with_context(|| format!("unable to delete volume {name}"))
            .map(|_| ())
    }

    async fn attach_volume(
        &self,
        config: &Config,
        instance_name: &str,
        volume_name: &str,
        _attach_id: u32,
    ) -> Result<()> {
        let zone = self.zone(&config.cloud);
        let server = self.find_server(zone, instance_name).await?;
        let volume = self.find_volume(zone, volume_name).await?;
        let url = self.instance_url(
            zone,
            &format!("servers/{}/attach-volume", server["id"].as_str().unwrap_or_default()),
        );
        self.request(
            Method::POST,
            &url,
            Some(json!({ "volume_id": volume["id"], "volume_type": "sbs_volume" })),
        )
        .await
        .with_context(|| format!("unable to attach {volume_name} to {instance_name}"))
        .map(|_| ())
    }

    async fn detach_volume(&self, config: &Config, instance_name: &str, volume_name: &str) -> Result<()> {
        let zone = self.zone(&config.cloud);
        let server = self.find_server(zone, instance_name).await?;
        let volume = self.find_volume(zone, volume_name).await?;
        let url = self.instance_url(
            zone,
            &format!("servers/{}/detach-volume", server["id"].as_str().unwrap_or_default()),
        );
        self.request(Method::POST, &url, Some(json!({ "volume_id": volume["id"] })))
            .await
            .with_context(|| format!("unable to detach {volume_name} from {instance_name}"))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_json_maps_to_instance() {
        let server = json!({
            "id": "11111111-2222",
            "name": "web-1",
            "state": "running",
            "creation_date": "2026-03-01T10:00:00.000000+00:00",
            "private_ip": "10.1.2.3",
            "public_ips": [{"address": "51.15.0.1"}],
            "tags": ["Name=web-1", "CreatedBy=ops", "image=web-img"]
        });
        let inst = server_to_instance(&server);
        assert_eq!(inst.name, "web-1");
        assert_eq!(inst.status, "running");
        assert_eq!(inst.private_ips, vec!["10.1.2.3"]);
        assert_eq!(inst.public_ips, vec!["51.15.0.1"]);
        assert_eq!(inst.image, "web-img");
        assert!(inst.created.is_some());
    }

    #[test]
    fn legacy_public_ip_field_is_read() {
        let server = json!({"id": "x", "name": "a", "public_ip": {"address": "1.2.3.4"}});
        assert_eq!(server_to_instance(&server).public_ips, vec!["1.2.3.4"]);
    }

    #[test]
    fn image_json_maps_to_cloud_image() {
        let image = json!({"id": "img-1", "name": "web-img", "state": "available",
                           "root_volume": {"id": "snap-1", "size": 10000000000i64}});
        let img = image_to_cloud(&image);
        assert_eq!(img.id, "img-1");
        assert_eq!(img.size, 10_000_000_000);
        assert_eq!(img.created, None);
    }

    #[test]
    fn uploads_go_to_the_zone_region() {
        assert_eq!(zone_region("fr-par-1"), "fr-par");
        assert_eq!(zone_region("nl-ams-3"), "nl-ams");
        assert_eq!(zone_region("fr-par"), "fr-par");

        let p = ScalewayProvider::new("proj".into(), "secret".into(), Arc::new(crate::builder::MkfsImageBuilder))
            .unwrap();
        assert_eq!(
            p.object_url("pl-waw-2", "images", "web.img"),
            "https://s3.pl-waw.scw.cloud/images/web.img"
        );
        let p = p.with_object_storage_url("http://127.0.0.1:9000/");
        assert_eq!(p.object_url("pl-waw-2", "images", "web.img"), "http://127.0.0.1:9000/images/web.img");
    }

    #[test]
    fn stopped_states() {
        assert!(is_stopped("stopped"));
        assert!(is_stopped("stopped in place"));
        assert!(!is_stopped("running"));
    }
}
