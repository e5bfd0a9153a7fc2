//! Directory of instance records under `<home>/instances`, one JSON file per
//! running hypervisor process, named by its pid.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use ops_common::{Arch, OpsError};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

fn null_as_default<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    pub instance: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub image: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ports: Vec<String>,
    #[serde(default)]
    pub bridged: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub private_ip: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub mac: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub pid: String,
    /// QMP port on localhost.
    #[serde(default, deserialize_with = "null_as_default")]
    pub mgmt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,
}

impl InstanceRecord {
    pub fn mgmt_port(&self) -> Result<u16> {
        self.mgmt
            .trim()
            .parse()
            .with_context(|| format!("instance {} has no usable management port", self.instance))
    }
}

/// A record whose process was alive when the directory was scanned.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredInstance {
    pub pid: u32,
    pub record: InstanceRecord,
    pub created: Option<DateTime<Utc>>,
}

/// `kill(pid, 0)`: only `ESRCH` means the process is gone.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    !matches!(kill(Pid::from_raw(raw), None::<Signal>), Err(Errno::ESRCH))
}

/// SIGKILL; a process that already exited is not an error.
pub fn kill_process(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid).with_context(|| format!("invalid pid {pid}"))?;
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("unable to kill {pid}")),
    }
}

#[derive(Debug, Clone)]
pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, pid: u32) -> PathBuf {
        self.dir.join(pid.to_string())
    }

    pub fn write(&self, pid: u32, record: &InstanceRecord) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("unable to create {}", self.dir.display()))?;
        let path = self.path(pid);
        let body = serde_json::to_vec(record)?;
        std::fs::write(&path, body).with_context(|| format!("unable to write {}", path.display()))?;
        Ok(path)
    }

    pub fn read(&self, pid: u32) -> Result<Option<InstanceRecord>> {
        match std::fs::read(self.path(pid)) {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removing a record that is already gone succeeds.
    pub fn remove(&self, pid: u32) -> Result<()> {
        match std::fs::remove_file(self.path(pid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("unable to remove record {pid}")),
        }
    }

    /// Records of live processes. Records of dead processes are deleted;
    /// files that are not pids or not valid records are skipped.
    pub fn list_live(&self) -> Result<Vec<StoredInstance>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).with_context(|| format!("unable to read {}", self.dir.display())),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let pid = match file_name.parse::<u32>() {
                Ok(pid) if pid > 0 => pid,
                _ => {
                    warn!("[onprem] skipping {} in {}: not a pid", file_name, self.dir.display());
                    continue;
                }
            };

            if !is_alive(pid) {
                debug!("[onprem] process {} is gone, removing its record", pid);
                if let Err(e) = self.remove(pid) {
                    warn!("[onprem] unable to prune stale record {}: {:#}", pid, e);
                }
                continue;
            }

            let record = match self.read(pid) {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    warn!("[onprem] skipping unreadable record {}: {:#}", pid, e);
                    continue;
                }
            };

            out.push(StoredInstance {
                pid,
                record,
                created: entry.metadata().ok().and_then(|m| created_time(&m)),
            });
        }
        Ok(out)
    }

    pub fn find_by_name(&self, name: &str) -> Result<StoredInstance> {
        self.list_live()?
            .into_iter()
            .find(|i| i.record.instance == name)
            .ok_or_else(|| OpsError::InstanceNotFound(name.to_string()).into())
    }

    /// Caches a resolved address on the record of `pid`.
    pub fn log_mac(&self, pid: u32, mac: &str, ip: &str) -> Result<()> {
        let mut record = self
            .read(pid)?
            .ok_or_else(|| OpsError::InstanceNotFound(pid.to_string()))?;
        record.private_ip = ip.to_string();
        record.mac = mac.to_string();
        record.pid = pid.to_string();
        self.write(pid, &record).map(|_| ())
    }
}

#[cfg(unix)]
fn created_time(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    use std::os::unix::fs::MetadataExt;
    DateTime::from_timestamp(meta.ctime(), meta.ctime_nsec() as u32)
}

#[cfg(not(unix))]
fn created_time(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}
