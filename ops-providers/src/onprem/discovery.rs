//! Finding the address a bridged guest got from the LAN: the MAC comes from
//! the hypervisor command line, the IP from the host ARP table.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub mac: String,
    pub ip: String,
}

/// Strips leading zeros from each octet, keeping at least one digit, and
/// lowercases. `arp` on some hosts prints `8:0:27:...` for `08:00:27:...`.
pub fn format_octet(mac: &str) -> String {
    mac.split(':')
        .map(|octet| {
            let trimmed = octet.trim_start_matches('0');
            if trimmed.is_empty() {
                "0".to_string()
            } else {
                trimmed.to_ascii_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// MAC following `mac=` on a QEMU command line.
pub fn mac_from_cmdline(cmdline: &str) -> Option<String> {
    let (_, rest) = cmdline.split_once("mac=")?;
    let mac: String = rest
        .chars()
        .take_while(|c| c.is_ascii_hexdigit() || *c == ':')
        .collect();
    (!mac.is_empty()).then_some(mac)
}

/// First bracketed IP in `arp -a` output on a line whose MAC matches.
pub fn parse_arp(output: &str, mac: &str) -> Option<String> {
    let want = format_octet(mac);
    output.lines().find_map(|line| {
        let matches = line
            .split_whitespace()
            .any(|tok| tok.contains(':') && format_octet(tok) == want);
        if !matches {
            return None;
        }
        let start = line.find('(')?;
        let end = line[start..].find(')')? + start;
        Some(line[start + 1..end].to_string())
    })
}

#[async_trait]
pub trait IpResolver: Send + Sync {
    /// Not found is `None`, never an error.
    async fn resolve(&self, pid: u32) -> Option<ResolvedAddress>;
}

#[derive(Debug, Default, Clone)]
pub struct ArpResolver;

impl ArpResolver {
    async fn cmdline(pid: u32) -> Option<String> {
        if cfg!(target_os = "linux") {
            let raw = tokio::fs::read(format!("/proc/{pid}/cmdline")).await.ok()?;
            return Some(
                raw.split(|b| *b == 0)
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .join(" "),
            );
        }
        let out = Command::new("ps")
            .args(["-ww", "-o", "command=", "-p", &pid.to_string()])
            .output()
            .await
            .ok()?;
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[async_trait]
impl IpResolver for ArpResolver {
    async fn resolve(&self, pid: u32) -> Option<ResolvedAddress> {
        let cmdline = Self::cmdline(pid).await?;
        let mac = mac_from_cmdline(&cmdline)?;
        let out = Command::new("arp").arg("-an").output().await.ok()?;
        let table = String::from_utf8_lossy(&out.stdout);
        let ip = parse_arp(&table, &mac);
        debug!("[onprem] pid {} mac {} -> {:?}", pid, mac, ip);
        Some(ResolvedAddress { mac, ip: ip? })
    }
}
