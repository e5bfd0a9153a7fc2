use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use ops_common::{CloudImage, CloudInstance, Config, NanosVolume, OpsError, ProviderConfig};

pub mod aws;
pub mod builder;
pub mod bulk;
pub mod manager;
pub mod tags;
pub mod waiter;

#[cfg(feature = "mock")]
pub mod mock;
#[cfg(feature = "onprem")]
pub mod onprem;
#[cfg(feature = "scaleway")]
pub mod scaleway;

pub use builder::{ImageBuilder, MkfsImageBuilder};
pub use manager::ProviderManager;

/// One compute backend. Every operation receives its own `Config`; a
/// provider keeps only its credentials and clients between calls.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once by the factory before the provider is handed out.
    async fn initialize(&mut self, config: &ProviderConfig) -> Result<()>;

    async fn build_image(&self, config: &Config) -> Result<PathBuf>;
    async fn build_image_with_package(&self, config: &Config, package_path: &Path)
        -> Result<PathBuf>;

    /// Publishes a locally built image file to the backend.
    async fn create_image(&self, config: &Config, image_path: &Path) -> Result<()>;
    async fn get_images(&self, config: &Config) -> Result<Vec<CloudImage>>;
    async fn delete_image(&self, config: &Config, image_name: &str) -> Result<()>;

    async fn create_instance(&self, config: &Config) -> Result<()>;
    async fn get_instances(&self, config: &Config) -> Result<Vec<CloudInstance>>;

    async fn get_instance_by_name(&self, config: &Config, name: &str) -> Result<CloudInstance> {
        self.get_instances(config)
            .await?
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| OpsError::InstanceNotFound(name.to_string()).into())
    }

    async fn delete_instance(&self, config: &Config, name: &str) -> Result<()>;

    async fn start_instance(&self, _config: &Config, _name: &str) -> Result<()> {
        Err(OpsError::unsupported(format!("{}: start instance", self.name())))
    }

    async fn stop_instance(&self, _config: &Config, _name: &str) -> Result<()> {
        Err(OpsError::unsupported(format!("{}: stop instance", self.name())))
    }

    async fn reboot_instance(&self, _config: &Config, _name: &str) -> Result<()> {
        Err(OpsError::unsupported(format!("{}: reboot instance", self.name())))
    }

    async fn get_instance_logs(&self, _config: &Config, _name: &str) -> Result<String> {
        Err(OpsError::unsupported(format!("{}: instance logs", self.name())))
    }

    // Optional: volume lifecycle. Backends without volumes keep the defaults.
    async fn create_volume(
        &self,
        _config: &Config,
        _name: &str,
        _data: Option<&Path>,
        _size: Option<&str>,
    ) -> Result<NanosVolume> {
        Err(OpsError::unsupported(format!("{}: create volume", self.name())))
    }

    async fn get_all_volumes(&self, _config: &Config) -> Result<Vec<NanosVolume>> {
        Err(OpsError::unsupported(format!("{}: list volumes", self.name())))
    }

    async fn delete_volume(&self, _config: &Config, _name: &str) -> Result<()> {
        Err(OpsError::unsupported(format!("{}: delete volume", self.name())))
    }

    async fn attach_volume(
        &self,
        _config: &Config,
        _instance_name: &str,
        _volume_name: &str,
        _attach_id: u32,
    ) -> Result<()> {
        Err(OpsError::unsupported(format!("{}: attach volume", self.name())))
    }

    async fn detach_volume(
        &self,
        _config: &Config,
        _instance_name: &str,
        _volume_name: &str,
    ) -> Result<()> {
        Err(OpsError::unsupported(format!("{}: detach volume", self.name())))
    }
}
