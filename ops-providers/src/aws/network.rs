//! Find-or-create for the VPC, subnet and security group an instance
//! launches into. Nothing here rolls back: a failure after a resource was
//! created leaves it in place and says so in the error.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use ops_common::{OpsError, ProviderConfig, RunConfig, Tag};
use tracing::{debug, info};

use super::api::Ec2Api;
use super::cidr::{allocate_new_cidr_block, subnet_ipv6_block};
use super::model::*;
use crate::tags::{build_tags, NAME_KEY, OPS_CREATED_KEY};

const IPV4_ANYWHERE: &str = "0.0.0.0/0";
const IPV6_ANYWHERE: &str = "::/0";
const CLEANUP_HINT: &str = "manual cleanup may be required";

fn is_id(value: &str, prefix: &str) -> bool {
    value.len() > prefix.len() && value.starts_with(prefix)
}

pub async fn get_vpc(api: &dyn Ec2Api, cloud: &ProviderConfig) -> Result<Option<Vpc>> {
    let name = cloud.vpc.trim();

    if is_id(name, "vpc-") {
        debug!("[aws] looking up vpc by id {}", name);
        let vpcs = api
            .describe_vpcs(&[name.to_string()], &[])
            .await
            .with_context(|| format!("unable to describe vpc {name}"))?;
        return Ok(vpcs.into_iter().next());
    }

    if !name.is_empty() {
        debug!("[aws] looking up vpc by name {}", name);
        let vpcs = api
            .describe_vpcs(&[], &[Filter::tag(NAME_KEY, name)])
            .await
            .with_context(|| format!("unable to describe vpc {name}"))?;
        return Ok(vpcs.into_iter().next());
    }

    let vpcs = api
        .describe_vpcs(&[], &[])
        .await
        .context("unable to describe vpcs")?;
    let default = vpcs.iter().position(|v| v.is_default);
    Ok(match default {
        Some(i) => vpcs.into_iter().nth(i),
        None => vpcs.into_iter().next(),
    })
}

pub async fn create_vpc(api: &dyn Ec2Api, cloud: &ProviderConfig) -> Result<Vpc> {
    let name = cloud.vpc.trim();
    if name.is_empty() {
        bail!("a vpc name is required to create one");
    }

    let existing: Vec<String> = api
        .describe_vpcs(&[], &[])
        .await
        .context("unable to list vpc cidr blocks")?
        .into_iter()
        .map(|v| v.cidr_block)
        .collect();
    let cidr = allocate_new_cidr_block(&existing)
        .with_context(|| format!("unable to pick a cidr block for vpc {name}"))?;

    let user_tags: Vec<Tag> = cloud
        .tags
        .iter()
        .filter(|t| t.key != NAME_KEY)
        .cloned()
        .collect();
    let (tags, _) = build_tags(&user_tags, name);

    info!("[aws] creating vpc {} ({})", name, cidr);
    let created = api
        .create_vpc(CreateVpcInput {
            cidr_block: cidr,
            amazon_provided_ipv6: cloud.enable_ipv6,
            tags,
        })
        .await
        .with_context(|| format!("unable to create vpc {name}"))?;
    let vpc_id = created.vpc_id.clone();

    let vpc = api
        .describe_vpcs(&[vpc_id.clone()], &[])
        .await
        .with_context(|| format!("unable to read back vpc {vpc_id}; {CLEANUP_HINT}"))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("vpc {vpc_id} vanished after creation; {CLEANUP_HINT}"))?;

    let route_table = api
        .describe_route_tables(&[Filter::new("vpc-id", &[vpc_id.as_str()])])
        .await
        .with_context(|| format!("unable to describe route tables of {vpc_id}; {CLEANUP_HINT}"))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no route table found for vpc {vpc_id}; {CLEANUP_HINT}"))?;

    let gateway_id = ensure_internet_gateway(api, &vpc_id).await?;

    if cloud.enable_ipv6 {
        api.create_route(&route_table.route_table_id, IPV6_ANYWHERE, &gateway_id)
            .await
            .with_context(|| format!("unable to add ipv6 default route to {vpc_id}; {CLEANUP_HINT}"))?;
    }
    api.create_route(&route_table.route_table_id, IPV4_ANYWHERE, &gateway_id)
        .await
        .with_context(|| format!("unable to add default route to {vpc_id}; {CLEANUP_HINT}"))?;

    Ok(vpc)
}

async fn ensure_internet_gateway(api: &dyn Ec2Api, vpc_id: &str) -> Result<String> {
    let attached = api
        .describe_internet_gateways(&[Filter::new("attachment.vpc-id", &[vpc_id])])
        .await
        .with_context(|| format!("unable to describe internet gateways of {vpc_id}; {CLEANUP_HINT}"))?;
    if let Some(gw) = attached.into_iter().next() {
        return Ok(gw.internet_gateway_id);
    }

    let gw = api
        .create_internet_gateway()
        .await
        .with_context(|| format!("unable to create internet gateway for {vpc_id}; {CLEANUP_HINT}"))?;
    api.attach_internet_gateway(&gw.internet_gateway_id, vpc_id)
        .await
        .with_context(|| {
            format!(
                "unable to attach internet gateway {} to {vpc_id}; {CLEANUP_HINT}",
                gw.internet_gateway_id
            )
        })?;
    Ok(gw.internet_gateway_id)
}

pub async fn get_or_create_vpc(api: &dyn Ec2Api, cloud: &ProviderConfig) -> Result<Vpc> {
    if let Some(vpc) = get_vpc(api, cloud).await? {
        return Ok(vpc);
    }
    if cloud.vpc.trim().is_empty() {
        bail!("no vpc available");
    }
    create_vpc(api, cloud).await
}

pub async fn get_subnet(
    api: &dyn Ec2Api,
    cloud: &ProviderConfig,
    vpc_id: &str,
) -> Result<Option<Subnet>> {
    let name = cloud.subnet.trim();
    let in_vpc = Filter::new("vpc-id", &[vpc_id]);

    let subnets = if is_id(name, "subnet-") {
        api.describe_subnets(&[name.to_string()], &[in_vpc]).await
    } else if !name.is_empty() {
        api.describe_subnets(&[], &[in_vpc, Filter::tag(NAME_KEY, name)])
            .await
    } else {
        api.describe_subnets(&[], &[in_vpc]).await
    }
    .with_context(|| format!("unable to describe subnets of {vpc_id}"))?;

    if !name.is_empty() {
        return Ok(subnets.into_iter().next());
    }
    let default = subnets.iter().position(|s| s.default_for_az);
    Ok(match default {
        Some(i) => subnets.into_iter().nth(i),
        None => subnets.into_iter().next(),
    })
}

pub async fn create_subnet(api: &dyn Ec2Api, cloud: &ProviderConfig, vpc: &Vpc) -> Result<Subnet> {
    let name = if cloud.subnet.trim().is_empty() {
        cloud.vpc.trim()
    } else {
        cloud.subnet.trim()
    };
    let (tags, _) = build_tags(&[], name);

    let ipv6_cidr_block = if cloud.enable_ipv6 {
        vpc.ipv6_cidr_blocks
            .first()
            .and_then(|b| subnet_ipv6_block(b))
    } else {
        None
    };

    info!("[aws] creating subnet {} in {}", name, vpc.vpc_id);
    api.create_subnet(CreateSubnetInput {
        vpc_id: vpc.vpc_id.clone(),
        cidr_block: vpc.cidr_block.clone(),
        ipv6_cidr_block,
        availability_zone: cloud.zone.clone(),
        tags,
    })
    .await
    .with_context(|| format!("unable to create subnet in {}", vpc.vpc_id))
}

pub async fn get_or_create_subnet(
    api: &dyn Ec2Api,
    cloud: &ProviderConfig,
    vpc: &Vpc,
) -> Result<Subnet> {
    match get_subnet(api, cloud, &vpc.vpc_id).await? {
        Some(s) => Ok(s),
        None => create_subnet(api, cloud, vpc).await,
    }
}

/// The configured security group, looked up by name and then by id. Names
/// are only unique per VPC, so a group of that name in `vpc` wins over any
/// other; a match that exists only elsewhere is a mismatch.
pub async fn get_security_group(
    api: &dyn Ec2Api,
    cloud: &ProviderConfig,
    vpc: &Vpc,
) -> Result<SecurityGroup> {
    let name = cloud.security_group.trim();

    let mut found = api
        .describe_security_groups(&[], &[Filter::new("group-name", &[name])])
        .await
        .with_context(|| format!("unable to describe security group {name}"))?;
    if found.is_empty() && is_id(name, "sg-") {
        found = api
            .describe_security_groups(&[name.to_string()], &[])
            .await
            .with_context(|| format!("unable to describe security group {name}"))?;
    }

    if let Some(i) = found.iter().position(|sg| sg.vpc_id == vpc.vpc_id) {
        return Ok(found.swap_remove(i));
    }
    match found.into_iter().next() {
        Some(other) => Err(OpsError::Mismatch {
            resource: "security group".into(),
            name: name.to_string(),
            expected: vpc.vpc_id.clone(),
            actual: other.vpc_id,
        }
        .into()),
        None => Err(OpsError::SecurityGroupNotFound(name.to_string()).into()),
    }
}

pub fn security_group_description(instance_name: &str) -> String {
    format!("security group for {instance_name}")
}

/// Creates the per-instance group with ICMPv6 (when IPv6 is on), then TCP,
/// then UDP ingress. Port specs are checked before anything is created.
pub async fn create_security_group(
    api: &dyn Ec2Api,
    cloud: &ProviderConfig,
    run: &RunConfig,
    instance_name: &str,
    vpc_id: &str,
) -> Result<String> {
    let rules = ingress_rules(run, cloud.enable_ipv6)?;

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let group_name = format!("{instance_name}-{nanos}");

    info!("[aws] creating security group {} in {}", group_name, vpc_id);
    let group_id = api
        .create_security_group(CreateSecurityGroupInput {
            group_name: group_name.clone(),
            description: security_group_description(instance_name),
            vpc_id: vpc_id.to_string(),
            tags: vec![Tag::new(OPS_CREATED_KEY, "true")],
        })
        .await
        .with_context(|| format!("unable to create security group {group_name}"))?;

    if !rules.is_empty() {
        api.authorize_security_group_ingress(&group_id, &rules)
            .await
            .with_context(|| {
                format!("unable to authorize ingress on {group_id}; {CLEANUP_HINT}")
            })?;
    }
    Ok(group_id)
}

/// The group `create_security_group` made for `instance_name`, if any.
pub async fn find_instance_security_group(
    api: &dyn Ec2Api,
    instance_name: &str,
) -> Result<Option<SecurityGroup>> {
    let description = security_group_description(instance_name);
    let groups = api
        .describe_security_groups(
            &[],
            &[
                Filter::tag(OPS_CREATED_KEY, "true"),
                Filter::new("description", &[description.as_str()]),
            ],
        )
        .await
        .with_context(|| format!("unable to look up security group of {instance_name}"))?;
    Ok(groups.into_iter().next())
}

pub fn ingress_rules(run: &RunConfig, ipv6: bool) -> Result<Vec<IpPermission>> {
    let mut rules = Vec::new();
    if ipv6 {
        rules.push(build_firewall_rule("icmpv6", "-1", false, true)?);
    }
    for port in &run.ports {
        rules.push(build_firewall_rule("tcp", port, true, ipv6)?);
    }
    for port in &run.udp_ports {
        rules.push(build_firewall_rule("udp", port, true, ipv6)?);
    }
    Ok(rules)
}

pub fn build_firewall_rule(
    protocol: &str,
    port: &str,
    ipv4: bool,
    ipv6: bool,
) -> Result<IpPermission> {
    let (from_port, to_port) = parse_port_range(port)?;
    Ok(IpPermission {
        ip_protocol: protocol.to_string(),
        from_port,
        to_port,
        ipv4_ranges: if ipv4 { vec![IPV4_ANYWHERE.into()] } else { vec![] },
        ipv6_ranges: if ipv6 { vec![IPV6_ANYWHERE.into()] } else { vec![] },
    })
}

/// `"9000-9040"` is a range, `"80"` a single port, `"-1"` means all.
pub fn parse_port_range(spec: &str) -> Result<(i32, i32)> {
    let spec = spec.trim();
    let invalid = || OpsError::InvalidPort(spec.to_string());

    if let Some((from, to)) = spec.split_once('-').filter(|(from, _)| !from.is_empty()) {
        let from: i32 = from.parse().map_err(|_| invalid())?;
        let to: i32 = to.parse().map_err(|_| invalid())?;
        if from < 0 || to < from || to > 65535 {
            return Err(invalid().into());
        }
        return Ok((from, to));
    }

    let port: i32 = spec.parse().map_err(|_| invalid())?;
    if port == -1 || (0..=65535).contains(&port) {
        Ok((port, port))
    } else {
        Err(invalid().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_specs() {
        assert_eq!(parse_port_range("9000-9040").unwrap(), (9000, 9040));
        assert_eq!(parse_port_range("80").unwrap(), (80, 80));
        assert_eq!(parse_port_range("-1").unwrap(), (-1, -1));
        for bad in ["http", "10-x", "90-80", "70000", "-5", ""] {
            let err = parse_port_range(bad).unwrap_err();
            assert!(
                matches!(OpsError::find(&err), Some(OpsError::InvalidPort(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn rules_in_protocol_order() {
        let run = RunConfig {
            ports: vec!["80".into(), "8000-8010".into()],
            udp_ports: vec!["53".into()],
            ..Default::default()
        };
        let rules = ingress_rules(&run, true).unwrap();
        let protos: Vec<_> = rules.iter().map(|r| r.ip_protocol.as_str()).collect();
        assert_eq!(protos, vec!["icmpv6", "tcp", "tcp", "udp"]);

        assert_eq!((rules[0].from_port, rules[0].to_port), (-1, -1));
        assert!(rules[0].ipv4_ranges.is_empty());
        assert_eq!(rules[0].ipv6_ranges, vec!["::/0"]);
        assert_eq!((rules[1].from_port, rules[1].to_port), (80, 80));
        assert_eq!(rules[1].ipv4_ranges, vec!["0.0.0.0/0"]);
        assert_eq!(rules[1].ipv6_ranges, vec!["::/0"]);
        assert_eq!(rules[2].from_port, 8000);
        assert_eq!(rules[3].ipv4_ranges, vec!["0.0.0.0/0"]);
        assert_eq!(rules[3].ipv6_ranges, vec!["::/0"]);
    }

    #[test]
    fn ipv4_only_rules() {
        let run = RunConfig {
            ports: vec!["443".into()],
            ..Default::default()
        };
        let rules = ingress_rules(&run, false).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].ipv6_ranges.is_empty());
    }
}
