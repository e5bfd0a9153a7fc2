use std::sync::Arc;

use anyhow::{anyhow, Result};
use ops_common::Config;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::Provider;

#[derive(Debug, Clone, Copy)]
enum Target {
    Instance,
    Image,
}

/// Deletes every named instance concurrently. Exactly one result per name;
/// order follows completion, not input.
pub async fn delete_instances(
    provider: Arc<dyn Provider>,
    config: Arc<Config>,
    names: Vec<String>,
) -> Vec<(String, Result<()>)> {
    fan_out(provider, config, names, Target::Instance).await
}

pub async fn delete_images(
    provider: Arc<dyn Provider>,
    config: Arc<Config>,
    names: Vec<String>,
) -> Vec<(String, Result<()>)> {
    fan_out(provider, config, names, Target::Image).await
}

async fn fan_out(
    provider: Arc<dyn Provider>,
    config: Arc<Config>,
    names: Vec<String>,
    target: Target,
) -> Vec<(String, Result<()>)> {
    let (tx, mut rx) = mpsc::channel(names.len().max(1));

    for name in names.iter().cloned() {
        let tx = tx.clone();
        let provider = provider.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let res = match target {
                Target::Instance => provider.delete_instance(&config, &name).await,
                Target::Image => provider.delete_image(&config, &name).await,
            };
            let _ = tx.send((name, res)).await;
        });
    }
    drop(tx);

    let mut results = Vec::with_capacity(names.len());
    while let Some((name, res)) = rx.recv().await {
        match &res {
            Ok(()) => info!("[bulk] deleted {:?} {}", target, name),
            Err(e) => warn!("[bulk] failed to delete {:?} {}: {:#}", target, name, e),
        }
        results.push((name, res));
    }

    // A worker that panicked never reported; account for it anyway.
    for name in names {
        if !results.iter().any(|(n, _)| *n == name) {
            results.push((name, Err(anyhow!("delete task aborted"))));
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ops_common::{CloudImage, CloudInstance, OpsError, ProviderConfig};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    struct Recorder {
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provider for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        async fn initialize(&mut self, _config: &ProviderConfig) -> Result<()> {
            Ok(())
        }
        async fn build_image(&self, _config: &Config) -> Result<PathBuf> {
            unimplemented!()
        }
        async fn build_image_with_package(&self, _c: &Config, _p: &Path) -> Result<PathBuf> {
            unimplemented!()
        }
        async fn create_image(&self, _config: &Config, _path: &Path) -> Result<()> {
            Ok(())
        }
        async fn get_images(&self, _config: &Config) -> Result<Vec<CloudImage>> {
            Ok(vec![])
        }
        async fn delete_image(&self, _config: &Config, name: &str) -> Result<()> {
            if name.starts_with("missing") {
                return Err(OpsError::ImageNotFound(name.into()).into());
            }
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn create_instance(&self, _config: &Config) -> Result<()> {
            Ok(())
        }
        async fn get_instances(&self, _config: &Config) -> Result<Vec<CloudInstance>> {
            Ok(vec![])
        }
        async fn delete_instance(&self, _config: &Config, name: &str) -> Result<()> {
            if name == "boom" {
                panic!("worker crashed");
            }
            if name.starts_with("missing") {
                return Err(OpsError::InstanceNotFound(name.into()).into());
            }
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder {
            deleted: Mutex::new(vec![]),
        })
    }

    #[tokio::test]
    async fn one_result_per_name() {
        let rec = recorder();
        let names: Vec<String> = ["a", "b", "missing-c", "d"].iter().map(|s| s.to_string()).collect();
        let results = delete_instances(rec.clone(), Arc::new(Config::default()), names).await;

        assert_eq!(results.len(), 4);
        let failed: Vec<_> = results.iter().filter(|(_, r)| r.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "missing-c");
        assert!(OpsError::is_not_found(failed[0].1.as_ref().unwrap_err()));

        let mut deleted = rec.deleted.lock().unwrap().clone();
        deleted.sort();
        assert_eq!(deleted, vec!["a", "b", "d"]);
    }

    #[tokio::test]
    async fn panicked_worker_still_reports() {
        let names = vec!["ok".to_string(), "boom".to_string()];
        let results = delete_instances(recorder(), Arc::new(Config::default()), names).await;
        assert_eq!(results.len(), 2);
        let boom = results.iter().find(|(n, _)| n == "boom").unwrap();
        assert!(boom.1.is_err());
    }

    #[tokio::test]
    async fn images_and_empty_input() {
        let rec = recorder();
        let cfg = Arc::new(Config::default());
        let results = delete_images(rec.clone(), cfg.clone(), vec!["i1".into(), "missing".into()]).await;
        assert_eq!(results.len(), 2);
        assert_eq!(rec.deleted.lock().unwrap().as_slice(), ["i1"]);

        assert!(delete_images(rec, cfg, vec![]).await.is_empty());
    }
}
