use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ops_common::{Config, OpsError};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Turns a program or a package into a bootable disk image file.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build_image(&self, config: &Config) -> Result<PathBuf>;
    async fn build_image_from_package(&self, package_path: &Path, config: &Config)
        -> Result<PathBuf>;
}

/// `package.manifest` shipped inside every package directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct PackageManifest {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub version: String,
}

impl PackageManifest {
    pub fn load(package_path: &Path) -> Result<Self> {
        let path = package_path.join("package.manifest");
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid {}", path.display()))
    }

    /// Folds the package's program, arguments and environment into `config`.
    /// Values already set on the config win.
    pub fn apply_to(&self, package_path: &Path, config: &mut Config) {
        if config.program.is_empty() {
            config.program = package_path.join(&self.program).to_string_lossy().into_owned();
        }
        let mut args = self.args.clone();
        args.extend(config.args.drain(..));
        config.args = args;
        for (k, v) in &self.env {
            config.env.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

/// Invocation of the nanos `mkfs` tool. The manifest goes on stdin.
#[derive(Debug, Clone, Default)]
pub struct MkfsCommand {
    pub mkfs: PathBuf,
    pub boot: Option<PathBuf>,
    pub empty: bool,
    pub size: Option<String>,
    pub target_root: Option<PathBuf>,
    pub label: Option<String>,
    pub output: PathBuf,
}

impl MkfsCommand {
    pub fn new(mkfs: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            mkfs: mkfs.into(),
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if self.empty {
            args.push("-e".into());
        }
        if let Some(size) = &self.size {
            args.push("-s".into());
            args.push(size.into());
        }
        if let Some(root) = &self.target_root {
            args.push("-r".into());
            args.push(root.into());
        }
        if let Some(label) = &self.label {
            args.push("-l".into());
            args.push(label.into());
        }
        if let Some(boot) = &self.boot {
            args.push("-b".into());
            args.push(boot.into());
        }
        args.push(self.output.clone().into());
        args
    }

    /// Runs mkfs and returns the filesystem UUID it reports, if any.
    pub async fn run(&self, manifest: &str) -> Result<Option<String>> {
        if let Some(parent) = self.output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("unable to create {}", parent.display()))?;
        }

        debug!("[mkfs] {} {:?}", self.mkfs.display(), self.args());
        let mut child = Command::new(&self.mkfs)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("unable to run {}", self.mkfs.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(manifest.as_bytes()).await?;
        }
        let out = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        if !out.status.success() {
            bail!(
                "mkfs failed ({}): {}{}",
                out.status,
                stdout.trim(),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(parse_uuid(&stdout))
    }
}

/// The token after `UUID` in mkfs output (`UUID: 3f2a...`).
pub fn parse_uuid(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        if word.trim_end_matches(':') == "UUID" {
            return words
                .next()
                .map(|w| w.trim_matches(|c: char| c == ':' || c == '"').to_string())
                .filter(|w| !w.is_empty());
        }
    }
    None
}

/// Renders the nanos tuple manifest for a program image.
pub fn render_manifest(config: &Config, program: &Path, resolv_conf: Option<&Path>) -> String {
    let file_name = program
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "program".to_string());

    let mut m = String::from("(\n");
    m.push_str("    children:(\n");
    m.push_str(&format!(
        "        {}:(contents:(host:{}))\n",
        quote(&file_name),
        quote(&program.to_string_lossy())
    ));
    if let Some(resolv) = resolv_conf {
        m.push_str(&format!(
            "        etc:(children:(resolv.conf:(contents:(host:{}))))\n",
            quote(&resolv.to_string_lossy())
        ));
    }
    m.push_str("    )\n");

    if !config.kernel.is_empty() {
        m.push_str(&format!(
            "    boot:(children:(kernel:(contents:(host:{}))))\n",
            quote(&config.kernel)
        ));
    }

    m.push_str(&format!("    program:/{}\n", quote(&file_name)));

    let mut args = vec![quote(&file_name)];
    args.extend(config.args.iter().map(|a| quote(a)));
    m.push_str(&format!("    arguments:[{}]\n", args.join(" ")));

    if !config.env.is_empty() {
        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}:{}", quote(k), quote(v)))
            .collect();
        m.push_str(&format!("    environment:({})\n", env.join(" ")));
    }

    let mounts: Vec<String> = config
        .run
        .mounts
        .iter()
        .filter_map(|m| m.split_once(':'))
        .map(|(volume, at)| format!("{}:{}", quote(volume), quote(at)))
        .collect();
    if !mounts.is_empty() {
        m.push_str(&format!("    mounts:({})\n", mounts.join(" ")));
    }

    m.push(')');
    m
}

pub(crate) fn quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=,@%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// First executable named `binary` on `PATH`.
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Builds images with the nanos `mkfs` tool into `<home>/images`.
#[derive(Debug, Clone, Default)]
pub struct MkfsImageBuilder;

impl MkfsImageBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn mkfs_path(config: &Config) -> Result<PathBuf> {
        if !config.mkfs.is_empty() {
            return Ok(PathBuf::from(&config.mkfs));
        }
        let in_home = config.home.join("mkfs");
        if in_home.is_file() {
            return Ok(in_home);
        }
        find_in_path("mkfs").ok_or_else(|| {
            OpsError::Environment("mkfs not found in the tool home or on PATH".into()).into()
        })
    }

    async fn build(&self, config: &Config, target_root: Option<PathBuf>) -> Result<PathBuf> {
        let program = PathBuf::from(&config.program);
        if config.program.is_empty() || !program.exists() {
            bail!("program {:?} does not exist", config.program);
        }
        let program = std::fs::canonicalize(&program)?;

        let image_name = if config.cloud.image_name.is_empty() {
            program
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow!("cannot derive an image name from {}", program.display()))?
        } else {
            config.cloud.image_name.clone()
        };
        let output = config.image_file(&image_name);

        let resolv_conf = if config.nameservers.is_empty() {
            None
        } else {
            let dir = config.home.join("build").join(&image_name);
            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join("resolv.conf");
            let body: String = config
                .nameservers
                .iter()
                .map(|ns| format!("nameserver {ns}\n"))
                .collect();
            tokio::fs::write(&path, body).await?;
            Some(path)
        };

        let mut cmd = MkfsCommand::new(Self::mkfs_path(config)?, &output);
        cmd.target_root = target_root;
        if !config.boot.is_empty() {
            cmd.boot = Some(PathBuf::from(&config.boot));
        }
        if !config.base_volume_sz.is_empty() {
            cmd.size = Some(config.base_volume_sz.clone());
        }

        let manifest = render_manifest(config, &program, resolv_conf.as_deref());
        cmd.run(&manifest)
            .await
            .with_context(|| format!("unable to build image {image_name}"))?;
        info!("[mkfs] built image {}", output.display());
        Ok(output)
    }
}

#[async_trait]
impl ImageBuilder for MkfsImageBuilder {
    async fn build_image(&self, config: &Config) -> Result<PathBuf> {
        self.build(config, None).await
    }

    async fn build_image_from_package(
        &self,
        package_path: &Path,
        config: &Config,
    ) -> Result<PathBuf> {
        let manifest = PackageManifest::load(package_path)?;
        let mut config = config.clone();
        manifest.apply_to(package_path, &mut config);

        let sysroot = package_path.join("sysroot");
        let target_root = sysroot.is_dir().then_some(sysroot);
        self.build(&config, target_root).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkfs_argument_order() {
        let mut cmd = MkfsCommand::new("/opt/mkfs", "/tmp/out.img");
        cmd.empty = true;
        cmd.size = Some("100m".into());
        cmd.label = Some("data".into());
        let args: Vec<String> = cmd
            .args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["-e", "-s", "100m", "-l", "data", "/tmp/out.img"]);
    }

    #[test]
    fn uuid_is_read_from_output() {
        assert_eq!(
            parse_uuid("creating fs\nUUID: 2b6c2f0e-0f3e-4c5e-9a7c-4d1c0a9e1a11\n").as_deref(),
            Some("2b6c2f0e-0f3e-4c5e-9a7c-4d1c0a9e1a11")
        );
        assert_eq!(parse_uuid("no id here"), None);
    }

    #[test]
    fn manifest_lists_program_args_and_env() {
        let mut config = Config::default();
        config.args = vec!["-port".into(), "8080".into(), "hello world".into()];
        config.env.insert("non".into(), "abc123".into());
        config.run.mounts = vec!["data:/mnt/data".into()];
        let m = render_manifest(&config, Path::new("/srv/app/server"), None);

        assert!(m.contains("server:(contents:(host:/srv/app/server))"));
        assert!(m.contains("program:/server"));
        assert!(m.contains("arguments:[server -port 8080 \"hello world\"]"));
        assert!(m.contains("environment:(non:abc123)"));
        assert!(m.contains("mounts:(data:/mnt/data)"));
        assert!(!m.contains("boot:"));
    }

    #[test]
    fn package_manifest_merges_into_config() {
        let raw = r#"{"Program":"ops-dns/ops-dns","Args":["-v"],"Env":{"a":"1","non":"pkg"},"Version":"0.0.1"}"#;
        let manifest: PackageManifest = serde_json::from_str(raw).unwrap();
        let mut config = Config::default();
        config.args = vec!["extra".into()];
        config.env.insert("non".into(), "cfg".into());
        manifest.apply_to(Path::new("/pkgs/dns"), &mut config);

        assert_eq!(config.program, "/pkgs/dns/ops-dns/ops-dns");
        assert_eq!(config.args, vec!["-v", "extra"]);
        assert_eq!(config.env["non"], "cfg");
        assert_eq!(config.env["a"], "1");
    }
}
