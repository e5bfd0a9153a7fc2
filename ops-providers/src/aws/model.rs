use chrono::{DateTime, Utc};
use ops_common::{Arch, Tag};
use serde::{Deserialize, Serialize};

/// Server-side filter, e.g. `tag:Name` or `vpc-id`. An item matches when one
/// of its values for `name` is in `values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn tag(key: &str, value: &str) -> Self {
        Self::new(format!("tag:{key}"), &[value])
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Vpc {
    pub vpc_id: String,
    pub cidr_block: String,
    pub ipv6_cidr_blocks: Vec<String>,
    pub is_default: bool,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Subnet {
    pub subnet_id: String,
    pub vpc_id: String,
    pub cidr_block: String,
    pub ipv6_cidr_block: Option<String>,
    pub availability_zone: String,
    pub default_for_az: bool,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IpPermission {
    pub ip_protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    pub ipv4_ranges: Vec<String>,
    pub ipv6_ranges: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub group_id: String,
    pub group_name: String,
    pub description: String,
    pub vpc_id: String,
    pub tags: Vec<Tag>,
    pub ingress: Vec<IpPermission>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,
    pub gateway_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteTable {
    pub route_table_id: String,
    pub vpc_id: String,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InternetGateway {
    pub internet_gateway_id: String,
    pub attached_vpc_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateVpcInput {
    pub cidr_block: String,
    pub amazon_provided_ipv6: bool,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateSubnetInput {
    pub vpc_id: String,
    pub cidr_block: String,
    pub ipv6_cidr_block: Option<String>,
    pub availability_zone: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateSecurityGroupInput {
    pub group_name: String,
    pub description: String,
    pub vpc_id: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Image {
    pub image_id: String,
    pub name: String,
    pub state: String,
    pub snapshot_id: Option<String>,
    pub size_gb: i64,
    pub creation_date: Option<DateTime<Utc>>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImportSnapshotTask {
    pub import_task_id: String,
    /// `active`, `completed`, `deleting` or `deleted`.
    pub status: String,
    pub progress: Option<String>,
    pub snapshot_id: Option<String>,
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterImageInput {
    pub name: String,
    pub snapshot_id: String,
    pub architecture: Arch,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    pub device_index: i32,
    pub delete_on_termination: bool,
    pub subnet_id: String,
    pub groups: Vec<String>,
    pub private_ip_address: Option<String>,
    pub ipv6_address_count: Option<i32>,
    pub ipv6_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunInstancesInput {
    pub image_id: String,
    pub instance_type: String,
    pub tags: Vec<Tag>,
    pub network_interface: Option<NetworkInterfaceSpec>,
    pub iam_instance_profile: Option<String>,
    pub launch_template: Option<String>,
    /// Base64 encoded.
    pub user_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ec2Instance {
    pub instance_id: String,
    /// `pending`, `running`, `stopping`, `stopped`, `shutting-down`, `terminated`.
    pub state: String,
    pub image_id: String,
    pub launch_time: Option<DateTime<Utc>>,
    pub private_ips: Vec<String>,
    pub public_ips: Vec<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: String,
    pub size_gb: i64,
    pub state: String,
    pub availability_zone: String,
    pub create_time: Option<DateTime<Utc>>,
    pub attached_instance_id: Option<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateVolumeInput {
    pub availability_zone: String,
    pub size_gb: i64,
    pub snapshot_id: Option<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LaunchTemplate {
    pub name: String,
    pub latest_version: i64,
}
