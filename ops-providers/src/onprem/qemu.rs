use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ops_common::{Arch, OpsError, RunConfig};
use tokio::process::Command;
use tracing::{debug, info};

use crate::aws::network::parse_port_range;
use crate::builder::find_in_path;

use super::network::TAP_NAME;

/// Launches a guest in the background and reports its pid.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn start(&self, run: &RunConfig) -> Result<u32>;
}

#[derive(Debug, Clone)]
pub struct Qemu {
    log_dir: PathBuf,
}

impl Default for Qemu {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwarded ports beyond this many in one range are rejected.
const MAX_FORWARDS_PER_RANGE: i32 = 256;

impl Qemu {
    pub fn new() -> Self {
        Self {
            log_dir: std::env::temp_dir(),
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn binary_name(arch: Arch) -> String {
        format!("qemu-system-{}", arch.machine_name())
    }

    pub fn log_path(log_dir: &Path, instance: &str) -> PathBuf {
        log_dir.join(format!("{instance}.log"))
    }

    fn forwards(proto: &str, specs: &[String]) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for spec in specs {
            let (from, to) = parse_port_range(spec)?;
            if from < 0 || to - from >= MAX_FORWARDS_PER_RANGE {
                return Err(OpsError::InvalidPort(spec.clone()).into());
            }
            out.extend((from..=to).map(|p| format!("hostfwd={proto}::{p}-:{p}")));
        }
        Ok(out)
    }

    pub fn args(run: &RunConfig) -> Result<Vec<String>> {
        let arch = run.arch_or_host();
        let mut args: Vec<String> = Vec::new();

        match arch {
            Arch::Amd64 => extend(&mut args, &["-machine", "q35"]),
            Arch::Arm64 => extend(&mut args, &["-machine", "virt", "-cpu", "max"]),
        }
        let memory = if run.memory.is_empty() { "2G" } else { run.memory.as_str() };
        let cpus = run.cpus.max(1).to_string();
        extend(&mut args, &["-m", memory, "-smp", &cpus]);
        extend(&mut args, &["-display", "none", "-serial", "stdio", "-no-reboot"]);

        extend(&mut args, &["-device", "virtio-scsi-pci,id=scsi0"]);
        let disks = std::iter::once(&run.image_path).chain(run.drives.iter());
        for (i, disk) in disks.enumerate() {
            let drive = format!("file={},format=raw,if=none,id=hd{i}", disk.display());
            let device = format!("scsi-hd,bus=scsi0.0,drive=hd{i}");
            extend(&mut args, &["-drive", &drive, "-device", &device]);
        }

        if run.bridged {
            let tap = if run.tap_name.is_empty() { TAP_NAME } else { run.tap_name.as_str() };
            let netdev = format!("tap,id=n0,ifname={tap},script=no,downscript=no");
            extend(&mut args, &["-netdev", &netdev]);
        } else {
            let mut netdev = vec!["user".to_string(), "id=n0".to_string()];
            netdev.extend(Self::forwards("tcp", &run.ports)?);
            netdev.extend(Self::forwards("udp", &run.udp_ports)?);
            extend(&mut args, &["-netdev", &netdev.join(",")]);
        }
        let mut nic = "virtio-net,netdev=n0".to_string();
        if !run.mac.is_empty() {
            nic.push_str(&format!(",mac={}", run.mac));
        }
        extend(&mut args, &["-device", &nic]);
        extend(&mut args, &["-device", "virtio-balloon"]);

        if run.mgmt != 0 {
            let qmp = format!("tcp:localhost:{},server,nowait", run.mgmt);
            extend(&mut args, &["-qmp", &qmp]);
        }
        if run.accel && arch == Arch::host() && Path::new("/dev/kvm").exists() {
            extend(&mut args, &["-enable-kvm"]);
        }
        Ok(args)
    }
}

fn extend(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

#[async_trait]
impl Hypervisor for Qemu {
    async fn start(&self, run: &RunConfig) -> Result<u32> {
        let binary = Self::binary_name(run.arch_or_host());
        let path = find_in_path(&binary)
            .ok_or_else(|| OpsError::Environment(format!("{binary} not found on $PATH")))?;
        let args = Self::args(run)?;

        let log_path = Self::log_path(&self.log_dir, &run.instance_name);
        let log = std::fs::File::create(&log_path)
            .with_context(|| format!("unable to create {}", log_path.display()))?;
        let err_log = log.try_clone()?;

        debug!("[onprem] {} {}", path.display(), args.join(" "));
        let child = Command::new(&path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .spawn()
            .with_context(|| format!("unable to start {}", path.display()))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("{binary} exited immediately"))?;
        info!("[onprem] started {} as pid {}", run.instance_name, pid);
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> RunConfig {
        RunConfig {
            instance_name: "web".into(),
            image_path: "/home/u/.ops/images/web".into(),
            mgmt: 41234,
            arch: Some(Arch::Amd64),
            ..Default::default()
        }
    }

    fn joined(run: &RunConfig) -> String {
        Qemu::args(run).unwrap().join(" ")
    }

    #[test]
    fn user_mode_forwards_ports() {
        let mut r = run();
        r.ports = vec!["8080".into(), "9000-9001".into()];
        r.udp_ports = vec!["53".into()];
        let args = Qemu::args(&r).unwrap();
        let netdev = &args[args.iter().position(|a| a == "-netdev").unwrap() + 1];
        assert_eq!(
            netdev,
            "user,id=n0,hostfwd=tcp::8080-:8080,hostfwd=tcp::9000-:9000,hostfwd=tcp::9001-:9001,hostfwd=udp::53-:53"
        );
        assert!(joined(&r).contains("-qmp tcp:localhost:41234,server,nowait"));
        assert!(joined(&r).contains("file=/home/u/.ops/images/web,format=raw,if=none,id=hd0"));
        assert!(joined(&r).starts_with("-machine q35 -m 2G -smp 1"));
    }

    #[test]
    fn bridged_uses_tap_and_mac() {
        let mut r = run();
        r.bridged = true;
        r.tap_name = "tap7".into();
        r.mac = "52:54:00:12:34:56".into();
        r.drives = vec!["/vols/data:abc.raw".into()];
        let s = joined(&r);
        assert!(s.contains("-netdev tap,id=n0,ifname=tap7,script=no,downscript=no"));
        assert!(s.contains("-device virtio-net,netdev=n0,mac=52:54:00:12:34:56"));
        assert!(s.contains("id=hd1 -device scsi-hd,bus=scsi0.0,drive=hd1"));
        assert!(!s.contains("hostfwd"));

        r.tap_name.clear();
        assert!(joined(&r).contains("ifname=tap0"));
    }

    #[test]
    fn arm64_and_bad_ports() {
        let mut r = run();
        r.arch = Some(Arch::Arm64);
        r.memory = "512M".into();
        r.cpus = 2;
        assert!(joined(&r).starts_with("-machine virt -cpu max -m 512M -smp 2"));
        assert_eq!(Qemu::binary_name(Arch::Arm64), "qemu-system-aarch64");

        r.ports = vec!["http".into()];
        assert!(Qemu::args(&r).is_err());
        r.ports = vec!["1-5000".into()];
        assert!(Qemu::args(&r).is_err());
    }
}
