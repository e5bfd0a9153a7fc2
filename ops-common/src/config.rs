use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Arch, Tag};

/// Cloud-side settings for one operation. Never persisted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub platform: String,
    pub zone: String,
    pub flavor: String,
    pub image_name: String,
    pub vpc: String,
    pub subnet: String,
    pub security_group: String,
    pub tags: Vec<Tag>,
    pub enable_ipv6: bool,
    pub static_ip: String,
    pub instance_profile: String,
    pub project_id: String,
    pub bucket_name: String,
    pub user_data: String,
    pub domain_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct RunConfig {
    pub instance_name: String,
    pub image_path: PathBuf,
    pub ports: Vec<String>,
    pub udp_ports: Vec<String>,
    pub bridged: bool,
    pub bridge_name: String,
    pub tap_name: String,
    pub ip_address: String,
    pub ipv6_address: String,
    pub netmask: String,
    pub mac: String,
    pub memory: String,
    pub cpus: u32,
    /// `<volume label or id>:<mount point>` pairs.
    pub mounts: Vec<String>,
    /// Backing files for `mounts`, filled in at instance creation.
    #[serde(skip)]
    pub drives: Vec<PathBuf>,
    /// QMP management port of a local instance.
    pub mgmt: u16,
    /// Target architecture; `None` means the host architecture.
    pub arch: Option<Arch>,
    pub instance_group: String,
    pub accel: bool,
    pub debug: bool,
}

impl RunConfig {
    pub fn arch_or_host(&self) -> Arch {
        self.arch.unwrap_or_else(Arch::host)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub cloud: ProviderConfig,
    pub run: RunConfig,
    /// Tool home holding images, instances, volumes and packages.
    pub home: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub boot: String,
    pub kernel: String,
    pub mkfs: String,
    pub nameservers: Vec<String>,
    pub base_volume_sz: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup (the process
    /// environment in `from_env`).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).unwrap_or_default();
        let flag = |key: &str| parse_flag(&get(key));

        let home = match lookup("OPS_HOME").filter(|v| !v.trim().is_empty()) {
            Some(h) => PathBuf::from(h.trim()),
            None => lookup("HOME")
                .map(|h| PathBuf::from(h).join(".ops"))
                .unwrap_or_else(|| PathBuf::from(".ops")),
        };

        let cloud = ProviderConfig {
            platform: lookup("PROVIDER")
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "onprem".to_string()),
            zone: get("OPS_ZONE"),
            flavor: get("OPS_FLAVOR"),
            vpc: get("OPS_VPC"),
            subnet: get("OPS_SUBNET"),
            security_group: get("OPS_SECURITY_GROUP"),
            enable_ipv6: flag("OPS_ENABLE_IPV6"),
            ..Default::default()
        };

        let run = RunConfig {
            ports: split_list(&get("OPS_PORTS")),
            udp_ports: split_list(&get("OPS_UDP_PORTS")),
            bridged: flag("OPS_BRIDGED"),
            debug: flag("OPS_DEBUG"),
            ..Default::default()
        };

        Config {
            cloud,
            run,
            home,
            ..Default::default()
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.home.join("images")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.home.join("instances")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.home.join("volumes")
    }

    /// Location of a package: `<home>/local_packages/<name>` for local ones,
    /// `<home>/packages/<arch>/<name>` otherwise. `:` in the name becomes `_`.
    pub fn package_path(&self, name: &str, local: bool, arch: Arch) -> PathBuf {
        let dir_name = name.replace(':', "_");
        if local {
            self.home.join("local_packages").join(dir_name)
        } else {
            self.home.join("packages").join(arch.as_str()).join(dir_name)
        }
    }

    pub fn image_file(&self, image_name: &str) -> PathBuf {
        self.images_dir().join(image_name)
    }

    pub fn with_home(mut self, home: impl AsRef<Path>) -> Self {
        self.home = home.as_ref().to_path_buf();
        self
    }
}

pub fn env_flag(key: &str) -> bool {
    env::var(key).map(|v| parse_flag(&v)).unwrap_or(false)
}

fn parse_flag(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
