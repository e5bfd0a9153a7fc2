//! Boots a set of packages on the local backend behind a small DNS guest.
//! Every service registers as `<pkg>.service` once its address is known.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ops_common::{Arch, Config, OpsError};
use ops_providers::onprem::OnPrem;
use ops_providers::Provider;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const DNS_PACKAGE: &str = "eyberg/ops-dns:0.0.1";
pub const DNS_INSTANCE: &str = "dns";
pub const DEFAULT_COMPOSE_FILE: &str = "compose.yaml";
pub const DEFAULT_DNS_PORT: u16 = 8080;

const NONCE_LEN: usize = 32;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComposePackage {
    /// Service name, registered as `<pkg>.service`.
    pub pkg: String,
    /// Package to boot, e.g. `eyberg/node:20.5.0`.
    pub name: String,
    pub local: bool,
    pub arch: String,
    pub base_volume_sz: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComposeFile {
    pub packages: Vec<ComposePackage>,
}

impl ComposeFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| {
            format!(
                "unable to read {}; is compose running next to a {}?",
                path.display(),
                DEFAULT_COMPOSE_FILE
            )
        })?;
        serde_yaml::from_str(&raw).with_context(|| format!("invalid compose file {}", path.display()))
    }
}

/// A service booted by [`Compose::up`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposeService {
    pub name: String,
    pub pid: u32,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposeReport {
    pub nonce: String,
    pub dns: ComposeService,
    pub services: Vec<ComposeService>,
}

/// Random lowercase hex string of `len` characters.
pub fn gen_nonce(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

pub struct Compose {
    config: Config,
    onprem: Arc<OnPrem>,
    http: reqwest::Client,
    dns_port: u16,
    ip_attempts: u32,
    ip_retry_delay: Duration,
}

impl Compose {
    pub fn new(config: Config, onprem: Arc<OnPrem>) -> Self {
        Self {
            config,
            onprem,
            http: reqwest::Client::new(),
            dns_port: DEFAULT_DNS_PORT,
            ip_attempts: 10,
            ip_retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_dns_port(mut self, port: u16) -> Self {
        self.dns_port = port;
        self
    }

    pub fn with_ip_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.ip_attempts = attempts.max(1);
        self.ip_retry_delay = delay;
        self
    }

    /// Boots DNS, then each package in order. Instances already booted stay
    /// up when a later step fails.
    pub async fn up(&self, compose_file: Option<&Path>) -> Result<ComposeReport> {
        let path = compose_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_COMPOSE_FILE));
        let file = ComposeFile::load(&path)?;
        self.up_with(&file).await
    }

    pub async fn up_with(&self, file: &ComposeFile) -> Result<ComposeReport> {
        let nonce = gen_nonce(NONCE_LEN);

        let dns_pid = self.spawn_dns(&nonce).await.context("unable to boot dns")?;
        let dns_ip = self.wait_for_ip(dns_pid).await.context("dns never got an address")?;
        info!("[compose] dns up at {} (pid {})", dns_ip, dns_pid);

        let mut services = Vec::with_capacity(file.packages.len());
        for pkg in &file.packages {
            let pid = self
                .spawn_package(pkg, &dns_ip)
                .await
                .with_context(|| format!("unable to boot {}", pkg.pkg))?;
            let ip = self
                .wait_for_ip(pid)
                .await
                .with_context(|| format!("{} never got an address", pkg.pkg))?;
            self.add_dns(&dns_ip, &pkg.pkg, &ip)
                .await
                .with_context(|| format!("unable to register {}", pkg.pkg))?;
            info!("[compose] {} up at {} (pid {})", pkg.pkg, ip, pid);
            services.push(ComposeService {
                name: pkg.pkg.clone(),
                pid,
                ip,
            });
        }

        Ok(ComposeReport {
            nonce,
            dns: ComposeService {
                name: DNS_INSTANCE.to_string(),
                pid: dns_pid,
                ip: dns_ip,
            },
            services,
        })
    }

    async fn spawn_dns(&self, nonce: &str) -> Result<u32> {
        let mut c = self.config.clone();
        let arch = c.run.arch_or_host();
        let package_path = c.package_path(DNS_PACKAGE, false, arch);
        if !package_path.join("package.manifest").is_file() {
            return Err(OpsError::Environment(format!(
                "you need the dns package to use compose: {} not found under {}",
                DNS_PACKAGE,
                package_path.display()
            ))
            .into());
        }

        c.run.arch = Some(arch);
        c.run.instance_name = DNS_INSTANCE.to_string();
        c.cloud.image_name = DNS_INSTANCE.to_string();
        c.env.insert("non".to_string(), nonce.to_string());

        self.boot(&c, Some(&package_path)).await
    }

    async fn spawn_package(&self, pkg: &ComposePackage, dns_ip: &str) -> Result<u32> {
        let mut c = self.config.clone();
        let arch = if pkg.arch.is_empty() {
            c.run.arch_or_host()
        } else {
            Arch::parse(&pkg.arch).with_context(|| format!("unknown arch '{}'", pkg.arch))?
        };

        c.run.arch = Some(arch);
        c.run.instance_name = pkg.pkg.clone();
        c.cloud.image_name = pkg.pkg.clone();
        c.nameservers = vec![dns_ip.to_string()];
        if !pkg.base_volume_sz.is_empty() {
            c.base_volume_sz = pkg.base_volume_sz.clone();
        }

        if pkg.name.is_empty() {
            self.boot(&c, None).await
        } else {
            let package_path = c.package_path(&pkg.name, pkg.local, arch);
            self.boot(&c, Some(&package_path)).await
        }
    }

    async fn boot(&self, c: &Config, package_path: Option<&Path>) -> Result<u32> {
        let image = match package_path {
            Some(p) => self.onprem.build_image_with_package(c, p).await?,
            None => self.onprem.build_image(c).await?,
        };
        self.onprem.create_image(c, &image).await?;
        let pid = self.onprem.create_instance_pid(c).await?;
        debug!("[compose] {} booted with pid {}", c.run.instance_name, pid);
        Ok(pid)
    }

    /// Polls for the bridged address of `pid`.
    pub async fn wait_for_ip(&self, pid: u32) -> Result<String> {
        for attempt in 1..=self.ip_attempts {
            if let Some(ip) = self.onprem.find_bridged_ip_by_pid(&self.config, pid).await {
                return Ok(ip);
            }
            debug!("[compose] no address for pid {} yet (attempt {})", pid, attempt);
            if attempt < self.ip_attempts {
                tokio::time::sleep(self.ip_retry_delay).await;
            }
        }
        bail!("ip timeout: no address for pid {} after {} attempts", pid, self.ip_attempts)
    }

    async fn add_dns(&self, dns_ip: &str, pkg: &str, ip: &str) -> Result<()> {
        let url = format!("http://{}:{}/add", dns_ip, self.dns_port);
        let svc = format!("{}.service", pkg);
        let res = self
            .http
            .get(&url)
            .query(&[("svc", svc.as_str()), ("ip", ip)])
            .send()
            .await?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        debug!("[compose] dns add {} -> {}: {} {}", svc, ip, status, body);
        if !status.is_success() {
            bail!("dns registration of {} failed: {} {}", svc, status, body);
        }
        Ok(())
    }
}
