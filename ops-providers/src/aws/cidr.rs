use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use ipnetwork::{Ipv4Network, Ipv6Network};

/// Used when the account has no VPC blocks yet.
pub const DEFAULT_VPC_CIDR: &str = "10.0.0.0/16";

/// Picks the block after the highest existing one: the second octet is
/// incremented for a /16, the third for a /24, carrying into the octets
/// above on overflow. When the highest block is neither, allocation starts
/// at [`DEFAULT_VPC_CIDR`]. Candidates overlapping any existing block are
/// skipped.
pub fn allocate_new_cidr_block(existing: &[String]) -> Result<String> {
    let taken: Vec<Ipv4Network> = existing
        .iter()
        .filter_map(|c| Ipv4Network::from_str(c.trim()).ok())
        .collect();

    let highest = taken.iter().max_by_key(|n| u32::from(n.network()));
    let (mut addr, prefix) = match highest {
        Some(n) if matches!(n.prefix(), 16 | 24) => match next_block(n.network(), n.prefix()) {
            Some(addr) => (addr, n.prefix()),
            None => bail!("no free cidr block after {n}"),
        },
        _ => {
            let default = Ipv4Network::from_str(DEFAULT_VPC_CIDR)
                .with_context(|| format!("invalid default cidr {DEFAULT_VPC_CIDR}"))?;
            (default.network(), default.prefix())
        }
    };

    loop {
        let candidate = Ipv4Network::new(addr, prefix)
            .with_context(|| format!("invalid cidr block {addr}/{prefix}"))?;
        if !taken.iter().any(|t| t.overlaps(candidate)) {
            return Ok(candidate.to_string());
        }
        addr = match next_block(addr, prefix) {
            Some(next) => next,
            None => bail!("no free /{prefix} cidr block left"),
        };
    }
}

/// Network address of the block following `addr`, `None` past 255.x.
fn next_block(addr: Ipv4Addr, prefix: u8) -> Option<Ipv4Addr> {
    let mut octets = addr.octets();
    let mut i = if prefix == 24 { 2 } else { 1 };
    loop {
        let (v, overflow) = octets[i].overflowing_add(1);
        octets[i] = v;
        if !overflow {
            return Some(Ipv4Addr::from(octets));
        }
        if i == 0 {
            return None;
        }
        i -= 1;
    }
}

/// Narrows a VPC IPv6 block to the `/64` handed to a subnet.
pub fn subnet_ipv6_block(vpc_block: &str) -> Option<String> {
    let net = Ipv6Network::from_str(vpc_block.trim()).ok()?;
    Some(format!("{}/64", net.network()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn allocate_after_highest() {
        let cases = [
            (vec!["10.0.0.0/16", "172.31.0.0/16"], "172.32.0.0/16"),
            (vec!["10.0.0.0/24", "172.31.0.0/24"], "172.31.1.0/24"),
            (vec!["10.0.0.0/16", "172.255.0.0/16"], "173.0.0.0/16"),
            (vec!["10.0.0.0/16", "172.1.255.0/24"], "172.2.0.0/24"),
            (vec!["10.0.0.0/16", "172.255.255.0/24"], "173.0.0.0/24"),
        ];
        for (input, want) in cases {
            assert_eq!(
                allocate_new_cidr_block(&blocks(&input)).unwrap(),
                want,
                "input {input:?}"
            );
        }
    }

    #[test]
    fn low_second_octet_does_not_carry() {
        assert_eq!(
            allocate_new_cidr_block(&blocks(&["10.0.0.0/24"])).unwrap(),
            "10.0.1.0/24"
        );
    }

    #[test]
    fn candidates_inside_existing_blocks_are_skipped() {
        let existing = blocks(&["10.0.0.0/16", "10.0.5.0/24"]);
        let got = allocate_new_cidr_block(&existing).unwrap();
        assert_eq!(got, "10.1.0.0/24");

        let got: Ipv4Network = got.parse().unwrap();
        for b in &existing {
            assert!(!got.overlaps(b.parse().unwrap()), "{got} overlaps {b}");
        }
    }

    #[test]
    fn default_block_is_checked_too() {
        assert_eq!(allocate_new_cidr_block(&[]).unwrap(), DEFAULT_VPC_CIDR);
        assert_eq!(allocate_new_cidr_block(&blocks(&["garbage"])).unwrap(), DEFAULT_VPC_CIDR);
        assert_eq!(
            allocate_new_cidr_block(&blocks(&["10.0.0.0/16", "172.31.0.0/20"])).unwrap(),
            "10.1.0.0/16"
        );
        assert_eq!(
            allocate_new_cidr_block(&blocks(&["10.0.0.0/20"])).unwrap(),
            "10.1.0.0/16"
        );
    }

    #[test]
    fn exhausted_space_is_an_error() {
        assert!(allocate_new_cidr_block(&blocks(&["255.255.0.0/16"])).is_err());
        assert!(allocate_new_cidr_block(&blocks(&["0.0.0.0/0", "10.0.0.0/20"])).is_err());
    }

    #[test]
    fn ipv6_block_narrowed_to_64() {
        assert_eq!(
            subnet_ipv6_block("2600:1f18:abcd:1200::/56").as_deref(),
            Some("2600:1f18:abcd:1200::/64")
        );
        assert_eq!(subnet_ipv6_block("not-v6"), None);
    }
}
