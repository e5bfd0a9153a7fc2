use std::env;
use std::fs;
use std::sync::Arc;

use anyhow::Result;
use ops_common::{Config, OpsError};
use tracing::debug;

use crate::{MkfsImageBuilder, Provider};

pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name() -> String {
        env::var("PROVIDER")
            .ok()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "onprem".to_string())
    }

    /// Builds and initializes the backend called `provider_name`.
    pub async fn get_provider(provider_name: &str, config: &Config) -> Result<Box<dyn Provider>> {
        let name = provider_name.trim().to_lowercase();
        let mut cloud = config.cloud.clone();
        let mut provider: Box<dyn Provider> = match name.as_str() {
            #[cfg(feature = "onprem")]
            "onprem" => Box::new(crate::onprem::OnPrem::new()),
            #[cfg(feature = "mock")]
            "mock" => {
                if cloud.zone.is_empty() {
                    cloud.zone = crate::mock::DEFAULT_ZONE.to_string();
                }
                Box::new(
                    crate::aws::AwsProvider::new(
                        Arc::new(crate::mock::MockEc2::with_default_vpc()),
                        Arc::new(MkfsImageBuilder::new()),
                    )
                    .with_label("mock"),
                )
            }
            #[cfg(feature = "scaleway")]
            "scaleway" => {
                let (project_id, secret_key) = scaleway_credentials(|k| env::var(k).ok())?;
                Box::new(crate::scaleway::ScalewayProvider::new(
                    project_id,
                    secret_key,
                    Arc::new(MkfsImageBuilder::new()),
                )?)
            }
            _ => return Err(OpsError::UnknownProvider(provider_name.to_string()).into()),
        };

        provider.initialize(&cloud).await?;
        debug!("provider {} ready", provider.name());
        Ok(provider)
    }
}

/// Project id from `SCALEWAY_PROJECT_ID`; the secret from the file named by
/// `SCALEWAY_SECRET_KEY_FILE` (default `/run/secrets/scaleway_secret_key`),
/// falling back to `SCALEWAY_SECRET_KEY`.
pub fn scaleway_credentials<F>(lookup: F) -> Result<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let project_id = lookup("SCALEWAY_PROJECT_ID")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let secret_key_file = lookup("SCALEWAY_SECRET_KEY_FILE")
        .unwrap_or_else(|| "/run/secrets/scaleway_secret_key".to_string());
    let secret_key = fs::read_to_string(&secret_key_file)
        .ok()
        .or_else(|| lookup("SCALEWAY_SECRET_KEY"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if project_id.is_empty() || secret_key.is_empty() {
        return Err(OpsError::Environment(
            "SCALEWAY_PROJECT_ID and SCALEWAY_SECRET_KEY(_FILE) are required".into(),
        )
        .into());
    }
    Ok((project_id, secret_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let err = ProviderManager::get_provider("vultr", &Config::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(OpsError::find(&err), Some(OpsError::UnknownProvider(n)) if n == "vultr"));
    }

    #[tokio::test]
    async fn mock_and_onprem_are_available() {
        let mock = ProviderManager::get_provider("MOCK", &Config::default()).await.unwrap();
        assert_eq!(mock.name(), "mock");
        let onprem = ProviderManager::get_provider("onprem", &Config::default()).await.unwrap();
        assert_eq!(onprem.name(), "onprem");
    }

    #[test]
    fn secret_file_wins_over_env() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("key");
        std::fs::write(&file, "from-file\n").unwrap();

        let vars: HashMap<&str, String> = [
            ("SCALEWAY_PROJECT_ID", " proj ".to_string()),
            ("SCALEWAY_SECRET_KEY_FILE", file.to_string_lossy().into_owned()),
            ("SCALEWAY_SECRET_KEY", "from-env".to_string()),
        ]
        .into_iter()
        .collect();
        let (project, secret) = scaleway_credentials(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(project, "proj");
        assert_eq!(secret, "from-file");
    }

    #[test]
    fn missing_credentials() {
        let vars: HashMap<&str, String> = [
            ("SCALEWAY_SECRET_KEY_FILE", "/nonexistent/key".to_string()),
            ("SCALEWAY_SECRET_KEY", "s".to_string()),
        ]
        .into_iter()
        .collect();
        assert!(scaleway_credentials(|k| vars.get(k).cloned()).is_err());
    }
}
