//! Host bridge and tap management for bridged guests.

use std::net::{IpAddr, Ipv4Addr};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use macaddr::MacAddr6;
use ops_common::OpsError;
use tokio::process::Command;
use tracing::{debug, info};

use super::dhcp::Dhcp;

pub const BRIDGE_NAME: &str = "br0";
pub const TAP_NAME: &str = "tap0";
/// Hardware address the host bridge leases its own address with.
pub const BRIDGE_MAC: MacAddr6 = MacAddr6::new(0x08, 0x00, 0x27, 0x00, 0xA8, 0xE8);

#[async_trait]
pub trait NetworkService: Send + Sync {
    async fn add_bridge(&self, name: &str) -> Result<()>;
    async fn add_tap(&self, name: &str) -> Result<()>;
    async fn set_master(&self, link: &str, bridge: &str) -> Result<()>;
    async fn set_nomaster(&self, link: &str) -> Result<()>;
    async fn set_up(&self, link: &str) -> Result<()>;
    async fn set_down(&self, link: &str) -> Result<()>;
    async fn delete_link(&self, link: &str) -> Result<()>;
    async fn add_address(&self, link: &str, cidr: &str) -> Result<()>;
    async fn flush_addresses(&self, link: &str) -> Result<()>;
    async fn link_exists(&self, link: &str) -> Result<bool>;
    async fn is_up(&self, link: &str) -> Result<bool>;
    async fn bridge_members(&self, bridge: &str) -> Result<Vec<String>>;
    async fn ipv4_address(&self, link: &str) -> Result<Option<Ipv4Addr>>;
    async fn up_links(&self) -> Result<Vec<String>>;
}

/// `ip` from iproute2, one argument array per operation.
#[derive(Debug, Default, Clone)]
pub struct IprouteNetworkService;

impl IprouteNetworkService {
    async fn ip(&self, args: &[&str]) -> Result<String> {
        debug!("[onprem] ip {}", args.join(" "));
        let out = Command::new("ip")
            .args(args)
            .output()
            .await
            .context("unable to run ip")?;
        if !out.status.success() {
            bail!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Link names from `ip -o link show` output (`3: tap0@if2: <...> ...`).
pub fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let name = line.split(':').nth(1)?.trim();
            let name = name.split('@').next().unwrap_or(name);
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

/// Whether the flag set in `<BROADCAST,MULTICAST,UP,LOWER_UP>` contains UP.
pub fn parse_link_up(output: &str) -> bool {
    let Some(start) = output.find('<') else {
        return false;
    };
    let Some(end) = output[start..].find('>') else {
        return false;
    };
    output[start + 1..start + end].split(',').any(|f| f == "UP")
}

/// First address in `ip -o -4 address show` output.
pub fn parse_ipv4(output: &str) -> Option<Ipv4Addr> {
    let mut tokens = output.split_whitespace();
    tokens.find(|t| *t == "inet")?;
    tokens.next()?.split('/').next()?.parse().ok()
}

#[async_trait]
impl NetworkService for IprouteNetworkService {
    async fn add_bridge(&self, name: &str) -> Result<()> {
        self.ip(&["link", "add", "name", name, "type", "bridge"]).await.map(drop)
    }

    async fn add_tap(&self, name: &str) -> Result<()> {
        self.ip(&["tuntap", "add", "dev", name, "mode", "tap"]).await.map(drop)
    }

    async fn set_master(&self, link: &str, bridge: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", link, "master", bridge]).await.map(drop)
    }

    async fn set_nomaster(&self, link: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", link, "nomaster"]).await.map(drop)
    }

    async fn set_up(&self, link: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", link, "up"]).await.map(drop)
    }

    async fn set_down(&self, link: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", link, "down"]).await.map(drop)
    }

    async fn delete_link(&self, link: &str) -> Result<()> {
        self.ip(&["link", "delete", "dev", link]).await.map(drop)
    }

    async fn add_address(&self, link: &str, cidr: &str) -> Result<()> {
        self.ip(&["address", "add", cidr, "dev", link]).await.map(drop)
    }

    async fn flush_addresses(&self, link: &str) -> Result<()> {
        self.ip(&["address", "flush", "dev", link]).await.map(drop)
    }

    async fn link_exists(&self, link: &str) -> Result<bool> {
        let status = Command::new("ip")
            .args(["link", "show", "dev", link])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .context("unable to run ip")?;
        Ok(status.success())
    }

    async fn is_up(&self, link: &str) -> Result<bool> {
        Ok(parse_link_up(&self.ip(&["-o", "link", "show", "dev", link]).await?))
    }

    async fn bridge_members(&self, bridge: &str) -> Result<Vec<String>> {
        Ok(parse_link_names(&self.ip(&["-o", "link", "show", "master", bridge]).await?))
    }

    async fn ipv4_address(&self, link: &str) -> Result<Option<Ipv4Addr>> {
        Ok(parse_ipv4(&self.ip(&["-o", "-4", "address", "show", "dev", link]).await?))
    }

    async fn up_links(&self) -> Result<Vec<String>> {
        Ok(parse_link_names(&self.ip(&["-o", "link", "show", "up"]).await?))
    }
}

/// First up adapter whose name starts with `e` (eth0, enp3s0, ...).
pub async fn first_active_adapter(svc: &dyn NetworkService) -> Result<String> {
    svc.up_links()
        .await?
        .into_iter()
        .find(|l| l.starts_with('e'))
        .ok_or_else(|| OpsError::Environment("no active ethernet adapter found".into()).into())
}

/// Bridges the first active adapter into `br0` with a `tap0` beside it and
/// gives the bridge a DHCP lease. Stops at the first failure without undoing
/// earlier steps.
pub async fn setup_bridge_network(svc: &dyn NetworkService, dhcp: &dyn Dhcp) -> Result<Ipv4Addr> {
    let adapter = first_active_adapter(svc).await?;
    info!("[onprem] bridging {} into {}", adapter, BRIDGE_NAME);

    svc.add_bridge(BRIDGE_NAME).await?;
    svc.set_up(BRIDGE_NAME).await?;
    svc.set_master(&adapter, BRIDGE_NAME).await?;
    svc.add_tap(TAP_NAME).await?;
    svc.set_up(TAP_NAME).await?;
    svc.set_master(TAP_NAME, BRIDGE_NAME).await?;

    let ip = match dhcp.acquire(BRIDGE_NAME, BRIDGE_MAC).await? {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => bail!("bridge lease {} is not IPv4", ip),
    };
    svc.add_address(BRIDGE_NAME, &format!("{ip}/24")).await?;
    info!("[onprem] {} has address {}", BRIDGE_NAME, ip);
    Ok(ip)
}

/// Reverses [`setup_bridge_network`]; the first failing step is returned.
pub async fn reset_bridge_network(svc: &dyn NetworkService) -> Result<()> {
    let adapter = first_active_adapter(svc).await?;
    svc.set_nomaster(&adapter).await?;
    svc.set_nomaster(TAP_NAME).await?;
    svc.set_down(TAP_NAME).await?;
    svc.set_down(BRIDGE_NAME).await?;
    svc.delete_link(TAP_NAME).await?;
    svc.delete_link(BRIDGE_NAME).await?;
    info!("[onprem] removed {} and {}", TAP_NAME, BRIDGE_NAME);
    Ok(())
}

fn prefix_len(netmask: &str) -> Result<u8> {
    if netmask.is_empty() {
        return Ok(24);
    }
    let mask: Ipv4Addr = netmask
        .parse()
        .with_context(|| format!("invalid netmask {netmask}"))?;
    ipnetwork::ipv4_mask_to_prefix(mask).with_context(|| format!("invalid netmask {netmask}"))
}

/// `.66` in the guest's /24 is taken by the host side of the bridge.
pub fn bridge_address(guest_ip: &str) -> Result<Ipv4Addr> {
    let ip: Ipv4Addr = guest_ip
        .parse()
        .with_context(|| format!("invalid IPv4 address {guest_ip}"))?;
    let [a, b, c, _] = ip.octets();
    Ok(Ipv4Addr::new(a, b, c, 66))
}

/// Ensures a tap for one instance exists and is up, attached to `bridge`
/// when bridged. Each step is skipped when already in place.
pub async fn setup_network_interfaces(
    svc: &dyn NetworkService,
    tap: &str,
    bridge: Option<&str>,
    guest_ip: &str,
    netmask: &str,
) -> Result<()> {
    if !svc.link_exists(tap).await? {
        svc.add_tap(tap).await.context("unable to create tap")?;
    }

    if let Some(bridge) = bridge {
        if !svc.link_exists(bridge).await? {
            svc.add_bridge(bridge).await.context("unable to create bridge")?;
        }

        if !guest_ip.is_empty() {
            let wanted = bridge_address(guest_ip)?;
            if svc.ipv4_address(bridge).await? != Some(wanted) {
                svc.flush_addresses(bridge).await?;
                let cidr = format!("{}/{}", wanted, prefix_len(netmask)?);
                svc.add_address(bridge, &cidr)
                    .await
                    .context("unable to assign IP to bridge")?;
            }
        }

        if !svc.bridge_members(bridge).await?.iter().any(|m| m == tap) {
            svc.set_master(tap, bridge).await.context("unable to add tap to bridge")?;
        }
        if !svc.is_up(bridge).await? {
            svc.set_up(bridge).await?;
        }
    }

    if !svc.is_up(tap).await? {
        svc.set_up(tap).await?;
    }
    Ok(())
}

/// Takes the tap down, and the bridge too once none of its members is up.
pub async fn turn_off_network_interfaces(
    svc: &dyn NetworkService,
    tap: &str,
    bridge: Option<&str>,
) -> Result<()> {
    svc.set_down(tap).await.context("unable to turn tap down")?;

    if let Some(bridge) = bridge {
        let mut any_up = false;
        for member in svc.bridge_members(bridge).await? {
            if svc.is_up(&member).await? {
                any_up = true;
                break;
            }
        }
        if !any_up {
            svc.set_down(bridge).await?;
            svc.flush_addresses(bridge).await?;
        }
    }
    Ok(())
}
