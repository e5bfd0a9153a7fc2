//! In-memory EC2 with the behaviour the convergence code relies on: filters,
//! a default VPC, implicit route tables, snapshot imports that progress over
//! several polls and instances that take a few polls to terminate.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use ops_common::Tag;

use crate::aws::api::Ec2Api;
use crate::aws::instance_group::LaunchTemplateInput;
use crate::aws::model::*;

pub const DEFAULT_ZONE: &str = "us-east-1a";

trait Fields {
    fn tags(&self) -> &[Tag] {
        &[]
    }
    fn field(&self, name: &str) -> Vec<String>;
}

fn matches<T: Fields>(item: &T, filters: &[Filter]) -> bool {
    filters.iter().all(|f| {
        let values: Vec<String> = match f.name.strip_prefix("tag:") {
            Some(key) => item
                .tags()
                .iter()
                .filter(|t| t.key == key)
                .map(|t| t.value.clone())
                .collect(),
            None => item.field(&f.name),
        };
        values.iter().any(|v| f.values.contains(v))
    })
}

fn select<T: Fields + Clone>(
    items: &[T],
    ids: &[String],
    id_of: impl Fn(&T) -> &str,
    filters: &[Filter],
) -> Vec<T> {
    items
        .iter()
        .filter(|i| ids.is_empty() || ids.iter().any(|id| id == id_of(*i)))
        .filter(|i| matches(*i, filters))
        .cloned()
        .collect()
}

impl Fields for Vpc {
    fn tags(&self) -> &[Tag] {
        &self.tags
    }
    fn field(&self, name: &str) -> Vec<String> {
        match name {
            "vpc-id" => vec![self.vpc_id.clone()],
            "cidr" | "cidr-block" => vec![self.cidr_block.clone()],
            "is-default" | "isDefault" => vec![self.is_default.to_string()],
            _ => vec![],
        }
    }
}

impl Fields for Subnet {
    fn tags(&self) -> &[Tag] {
        &self.tags
    }
    fn field(&self, name: &str) -> Vec<String> {
        match name {
            "vpc-id" => vec![self.vpc_id.clone()],
            "subnet-id" => vec![self.subnet_id.clone()],
            "availability-zone" => vec![self.availability_zone.clone()],
            "default-for-az" => vec![self.default_for_az.to_string()],
            _ => vec![],
        }
    }
}

impl Fields for SecurityGroup {
    fn tags(&self) -> &[Tag] {
        &self.tags
    }
    fn field(&self, name: &str) -> Vec<String> {
        match name {
            "group-name" => vec![self.group_name.clone()],
            "group-id" => vec![self.group_id.clone()],
            "vpc-id" => vec![self.vpc_id.clone()],
            "description" => vec![self.description.clone()],
            _ => vec![],
        }
    }
}

impl Fields for RouteTable {
    fn field(&self, name: &str) -> Vec<String> {
        match name {
            "vpc-id" => vec![self.vpc_id.clone()],
            "route-table-id" => vec![self.route_table_id.clone()],
            _ => vec![],
        }
    }
}

impl Fields for InternetGateway {
    fn field(&self, name: &str) -> Vec<String> {
        match name {
            "attachment.vpc-id" => self.attached_vpc_ids.clone(),
            "internet-gateway-id" => vec![self.internet_gateway_id.clone()],
            _ => vec![],
        }
    }
}

impl Fields for Image {
    fn tags(&self) -> &[Tag] {
        &self.tags
    }
    fn field(&self, name: &str) -> Vec<String> {
        match name {
            "name" => vec![self.name.clone()],
            "image-id" => vec![self.image_id.clone()],
            "state" => vec![self.state.clone()],
            _ => vec![],
        }
    }
}

impl Fields for Ec2Instance {
    fn tags(&self) -> &[Tag] {
        &self.tags
    }
    fn field(&self, name: &str) -> Vec<String> {
        match name {
            "instance-id" => vec![self.instance_id.clone()],
            "instance-state-name" => vec![self.state.clone()],
            "image-id" => vec![self.image_id.clone()],
            _ => vec![],
        }
    }
}

impl Fields for Volume {
    fn tags(&self) -> &[Tag] {
        &self.tags
    }
    fn field(&self, name: &str) -> Vec<String> {
        match name {
            "volume-id" => vec![self.volume_id.clone()],
            "status" => vec![self.state.clone()],
            "attachment.instance-id" => self.attached_instance_id.iter().cloned().collect(),
            _ => vec![],
        }
    }
}

struct Tracked<T> {
    item: T,
    polls: u32,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    calls: Vec<String>,
    failures: HashMap<String, String>,
    vpcs: Vec<Vpc>,
    subnets: Vec<Subnet>,
    security_groups: Vec<SecurityGroup>,
    route_tables: Vec<RouteTable>,
    gateways: Vec<InternetGateway>,
    imports: Vec<Tracked<ImportSnapshotTask>>,
    snapshots: Vec<String>,
    images: Vec<Image>,
    instances: Vec<Tracked<Ec2Instance>>,
    consoles: HashMap<String, String>,
    addresses: HashMap<String, String>,
    templates: HashMap<String, i64>,
    default_versions: HashMap<String, i64>,
    group_templates: HashMap<String, String>,
    volumes: Vec<Volume>,
}

impl MockState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08x}", self.next_id)
    }

    fn call(&mut self, op: &str) -> Result<()> {
        self.calls.push(op.to_string());
        match self.failures.get(op) {
            Some(msg) => Err(anyhow!("{op}: {msg}")),
            None => Ok(()),
        }
    }

    fn instance_mut(&mut self, id: &str) -> Result<&mut Tracked<Ec2Instance>> {
        self.instances
            .iter_mut()
            .find(|t| t.item.instance_id == id)
            .ok_or_else(|| anyhow!("InvalidInstanceID.NotFound: {id}"))
    }
}

pub struct MockEc2 {
    state: Mutex<MockState>,
    import_polls: u32,
    pending_polls: u32,
    terminate_polls: u32,
    implicit_route_tables: bool,
    fail_imports: bool,
}

impl Default for MockEc2 {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEc2 {
    /// An empty account: no VPCs at all.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            import_polls: 3,
            pending_polls: 1,
            terminate_polls: 2,
            implicit_route_tables: true,
            fail_imports: false,
        }
    }

    /// An account with a default VPC, subnet, route table and gateway.
    pub fn with_default_vpc() -> Self {
        let mock = Self::new();
        {
            let mut s = mock.lock();
            let vpc_id = s.id("vpc");
            let igw_id = s.id("igw");
            let rtb_id = s.id("rtb");
            let subnet_id = s.id("subnet");
            s.vpcs.push(Vpc {
                vpc_id: vpc_id.clone(),
                cidr_block: "172.31.0.0/16".into(),
                is_default: true,
                ..Default::default()
            });
            s.gateways.push(InternetGateway {
                internet_gateway_id: igw_id.clone(),
                attached_vpc_ids: vec![vpc_id.clone()],
            });
            s.route_tables.push(RouteTable {
                route_table_id: rtb_id,
                vpc_id: vpc_id.clone(),
                routes: vec![Route {
                    destination: "0.0.0.0/0".into(),
                    gateway_id: igw_id,
                }],
            });
            s.subnets.push(Subnet {
                subnet_id,
                vpc_id,
                cidr_block: "172.31.0.0/20".into(),
                availability_zone: DEFAULT_ZONE.into(),
                default_for_az: true,
                ..Default::default()
            });
        }
        mock
    }

    pub fn with_import_polls(mut self, polls: u32) -> Self {
        self.import_polls = polls.max(1);
        self
    }

    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn with_terminate_polls(mut self, polls: u32) -> Self {
        self.terminate_polls = polls;
        self
    }

    /// New VPCs come without a main route table.
    pub fn without_implicit_route_tables(mut self) -> Self {
        self.implicit_route_tables = false;
        self
    }

    /// Snapshot imports end in the `deleted` state.
    pub fn failing_imports(mut self) -> Self {
        self.fail_imports = true;
        self
    }

    /// Makes every later call to `op` (an `Ec2Api` method name) fail.
    pub fn fail_on(&self, op: &str, message: &str) {
        self.lock().failures.insert(op.to_string(), message.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn vpcs(&self) -> Vec<Vpc> {
        self.lock().vpcs.clone()
    }

    pub fn subnets(&self) -> Vec<Subnet> {
        self.lock().subnets.clone()
    }

    pub fn security_groups(&self) -> Vec<SecurityGroup> {
        self.lock().security_groups.clone()
    }

    pub fn route_tables(&self) -> Vec<RouteTable> {
        self.lock().route_tables.clone()
    }

    pub fn gateways(&self) -> Vec<InternetGateway> {
        self.lock().gateways.clone()
    }

    pub fn images(&self) -> Vec<Image> {
        self.lock().images.clone()
    }

    pub fn instances(&self) -> Vec<Ec2Instance> {
        self.lock().instances.iter().map(|t| t.item.clone()).collect()
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.lock().volumes.clone()
    }

    pub fn address_of(&self, public_ip: &str) -> Option<String> {
        self.lock().addresses.get(public_ip).cloned()
    }

    pub fn group_template(&self, group: &str) -> Option<String> {
        self.lock().group_templates.get(group).cloned()
    }

    pub fn default_version(&self, template: &str) -> Option<i64> {
        self.lock().default_versions.get(template).copied()
    }

    pub fn set_console_output(&self, instance_id: &str, text: &str) {
        self.lock()
            .consoles
            .insert(instance_id.to_string(), STANDARD.encode(text));
    }

    /// Adds a security group directly, bypassing the tool.
    pub fn insert_security_group(&self, name: &str, vpc_id: &str) -> String {
        let mut s = self.lock();
        let id = s.id("sg");
        s.security_groups.push(SecurityGroup {
            group_id: id.clone(),
            group_name: name.to_string(),
            vpc_id: vpc_id.to_string(),
            ..Default::default()
        });
        id
    }

    fn advance_instances(&self, s: &mut MockState) {
        for t in s.instances.iter_mut() {
            match t.item.state.as_str() {
                "pending" => {
                    t.polls += 1;
                    if t.polls >= self.pending_polls {
                        t.item.state = "running".into();
                    }
                }
                "shutting-down" => {
                    t.polls += 1;
                    if t.polls >= self.terminate_polls {
                        t.item.state = "terminated".into();
                    }
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl Ec2Api for MockEc2 {
    async fn describe_vpcs(&self, vpc_ids: &[String], filters: &[Filter]) -> Result<Vec<Vpc>> {
        let mut s = self.lock();
        s.call("describe_vpcs")?;
        Ok(select(&s.vpcs, vpc_ids, |v| v.vpc_id.as_str(), filters))
    }

    async fn create_vpc(&self, input: CreateVpcInput) -> Result<Vpc> {
        let mut s = self.lock();
        s.call("create_vpc")?;
        if s.vpcs.iter().any(|v| v.cidr_block == input.cidr_block) {
            bail!("InvalidVpc.Range: {} already in use", input.cidr_block);
        }
        let vpc_id = s.id("vpc");
        let n = s.next_id;
        let vpc = Vpc {
            vpc_id: vpc_id.clone(),
            cidr_block: input.cidr_block,
            ipv6_cidr_blocks: if input.amazon_provided_ipv6 {
                vec![format!("2600:1f18:4000:{:02x}00::/56", n % 256)]
            } else {
                vec![]
            },
            is_default: false,
            tags: input.tags,
        };
        s.vpcs.push(vpc.clone());
        if self.implicit_route_tables {
            let rtb = s.id("rtb");
            s.route_tables.push(RouteTable {
                route_table_id: rtb,
                vpc_id,
                routes: vec![],
            });
        }
        Ok(vpc)
    }

    async fn describe_route_tables(&self, filters: &[Filter]) -> Result<Vec<RouteTable>> {
        let mut s = self.lock();
        s.call("describe_route_tables")?;
        Ok(select(&s.route_tables, &[], |r| r.route_table_id.as_str(), filters))
    }

    async fn create_route(&self, route_table_id: &str, destination: &str, gateway_id: &str) -> Result<()> {
        let mut s = self.lock();
        s.call("create_route")?;
        let table = s
            .route_tables
            .iter_mut()
            .find(|r| r.route_table_id == route_table_id)
            .ok_or_else(|| anyhow!("InvalidRouteTableID.NotFound: {route_table_id}"))?;
        if table.routes.iter().any(|r| r.destination == destination) {
            bail!("RouteAlreadyExists: {destination}");
        }
        table.routes.push(Route {
            destination: destination.to_string(),
            gateway_id: gateway_id.to_string(),
        });
        Ok(())
    }

    async fn describe_internet_gateways(&self, filters: &[Filter]) -> Result<Vec<InternetGateway>> {
        let mut s = self.lock();
        s.call("describe_internet_gateways")?;
        Ok(select(&s.gateways, &[], |g| g.internet_gateway_id.as_str(), filters))
    }

    async fn create_internet_gateway(&self) -> Result<InternetGateway> {
        let mut s = self.lock();
        s.call("create_internet_gateway")?;
        let gw = InternetGateway {
            internet_gateway_id: s.id("igw"),
            attached_vpc_ids: vec![],
        };
        s.gateways.push(gw.clone());
        Ok(gw)
    }

    async fn attach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> Result<()> {
        let mut s = self.lock();
        s.call("attach_internet_gateway")?;
        let gw = s
            .gateways
            .iter_mut()
            .find(|g| g.internet_gateway_id == gateway_id)
            .ok_or_else(|| anyhow!("InvalidInternetGatewayID.NotFound: {gateway_id}"))?;
        gw.attached_vpc_ids.push(vpc_id.to_string());
        Ok(())
    }

    async fn describe_subnets(&self, subnet_ids: &[String], filters: &[Filter]) -> Result<Vec<Subnet>> {
        let mut s = self.lock();
        s.call("describe_subnets")?;
        Ok(select(&s.subnets, subnet_ids, |n| n.subnet_id.as_str(), filters))
    }

    async fn create_subnet(&self, input: CreateSubnetInput) -> Result<Subnet> {
        let mut s = self.lock();
        s.call("create_subnet")?;
        if !s.vpcs.iter().any(|v| v.vpc_id == input.vpc_id) {
            bail!("InvalidVpcID.NotFound: {}", input.vpc_id);
        }
        let subnet = Subnet {
            subnet_id: s.id("subnet"),
            vpc_id: input.vpc_id,
            cidr_block: input.cidr_block,
            ipv6_cidr_block: input.ipv6_cidr_block,
            availability_zone: input.availability_zone,
            default_for_az: false,
            tags: input.tags,
        };
        s.subnets.push(subnet.clone());
        Ok(subnet)
    }

    async fn describe_security_groups(&self, group_ids: &[String], filters: &[Filter]) -> Result<Vec<SecurityGroup>> {
        let mut s = self.lock();
        s.call("describe_security_groups")?;
        Ok(select(&s.security_groups, group_ids, |g| g.group_id.as_str(), filters))
    }

    async fn create_security_group(&self, input: CreateSecurityGroupInput) -> Result<String> {
        let mut s = self.lock();
        s.call("create_security_group")?;
        if s
            .security_groups
            .iter()
            .any(|g| g.group_name == input.group_name && g.vpc_id == input.vpc_id)
        {
            bail!("InvalidGroup.Duplicate: {}", input.group_name);
        }
        let id = s.id("sg");
        s.security_groups.push(SecurityGroup {
            group_id: id.clone(),
            group_name: input.group_name,
            description: input.description,
            vpc_id: input.vpc_id,
            tags: input.tags,
            ingress: vec![],
        });
        Ok(id)
    }

    async fn authorize_security_group_ingress(&self, group_id: &str, permissions: &[IpPermission]) -> Result<()> {
        let mut s = self.lock();
        s.call("authorize_security_group_ingress")?;
        let sg = s
            .security_groups
            .iter_mut()
            .find(|g| g.group_id == group_id)
            .ok_or_else(|| anyhow!("InvalidGroup.NotFound: {group_id}"))?;
        sg.ingress.extend(permissions.iter().cloned());
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        let mut s = self.lock();
        s.call("delete_security_group")?;
        let before = s.security_groups.len();
        s.security_groups.retain(|g| g.group_id != group_id);
        if s.security_groups.len() == before {
            bail!("InvalidGroup.NotFound: {group_id}");
        }
        Ok(())
    }

    async fn import_snapshot(&self, image_path: &Path, description: &str) -> Result<String> {
        let mut s = self.lock();
        s.call("import_snapshot")?;
        if !image_path.exists() {
            bail!("image {} does not exist", image_path.display());
        }
        let id = s.id("import-snap");
        s.imports.push(Tracked {
            item: ImportSnapshotTask {
                import_task_id: id.clone(),
                status: "active".into(),
                progress: Some("0".into()),
                snapshot_id: None,
                status_message: Some(description.to_string()),
            },
            polls: 0,
        });
        Ok(id)
    }

    async fn describe_import_snapshot_tasks(&self, task_ids: &[String]) -> Result<Vec<ImportSnapshotTask>> {
        let mut s = self.lock();
        s.call("describe_import_snapshot_tasks")?;
        let mut out = Vec::new();
        let mut new_snapshots = Vec::new();
        for i in 0..s.imports.len() {
            if !task_ids.contains(&s.imports[i].item.import_task_id) {
                continue;
            }
            if s.imports[i].item.status == "active" {
                s.imports[i].polls += 1;
                let polls = s.imports[i].polls;
                if polls >= self.import_polls {
                    if self.fail_imports {
                        s.imports[i].item.status = "deleted".into();
                        s.imports[i].item.status_message = Some("disk validation failed".into());
                    } else {
                        let snap = s.id("snap");
                        let task = &mut s.imports[i].item;
                        task.status = "completed".into();
                        task.progress = None;
                        task.snapshot_id = Some(snap.clone());
                        new_snapshots.push(snap);
                    }
                } else {
                    s.imports[i].item.progress = Some((polls * 100 / self.import_polls).to_string());
                }
            }
            out.push(s.imports[i].item.clone());
        }
        s.snapshots.extend(new_snapshots);
        Ok(out)
    }

    async fn register_image(&self, input: RegisterImageInput) -> Result<String> {
        let mut s = self.lock();
        s.call("register_image")?;
        if !s.snapshots.contains(&input.snapshot_id) {
            bail!("InvalidSnapshot.NotFound: {}", input.snapshot_id);
        }
        let id = s.id("ami");
        s.images.push(Image {
            image_id: id.clone(),
            name: input.name,
            state: "available".into(),
            snapshot_id: Some(input.snapshot_id),
            size_gb: 1,
            creation_date: Some(Utc::now()),
            tags: input.tags,
        });
        Ok(id)
    }

    async fn describe_images(&self, filters: &[Filter]) -> Result<Vec<Image>> {
        let mut s = self.lock();
        s.call("describe_images")?;
        Ok(select(&s.images, &[], |i| i.image_id.as_str(), filters))
    }

    async fn deregister_image(&self, image_id: &str) -> Result<()> {
        let mut s = self.lock();
        s.call("deregister_image")?;
        let before = s.images.len();
        s.images.retain(|i| i.image_id != image_id);
        if s.images.len() == before {
            bail!("InvalidAMIID.NotFound: {image_id}");
        }
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let mut s = self.lock();
        s.call("delete_snapshot")?;
        let before = s.snapshots.len();
        s.snapshots.retain(|id| id != snapshot_id);
        if s.snapshots.len() == before {
            bail!("InvalidSnapshot.NotFound: {snapshot_id}");
        }
        Ok(())
    }

    async fn run_instances(&self, input: RunInstancesInput) -> Result<Ec2Instance> {
        let mut s = self.lock();
        s.call("run_instances")?;
        if !s.images.iter().any(|i| i.image_id == input.image_id) {
            bail!("InvalidAMIID.NotFound: {}", input.image_id);
        }
        let id = s.id("i");
        let host = s.next_id % 250 + 2;
        let private_ip = input
            .network_interface
            .as_ref()
            .and_then(|n| n.private_ip_address.clone())
            .unwrap_or_else(|| format!("172.31.0.{host}"));
        let instance = Ec2Instance {
            instance_id: id,
            state: "pending".into(),
            image_id: input.image_id,
            launch_time: Some(Utc::now()),
            private_ips: vec![private_ip],
            public_ips: vec![],
            tags: input.tags,
        };
        s.instances.push(Tracked {
            item: instance.clone(),
            polls: 0,
        });
        Ok(instance)
    }

    async fn describe_instances(&self, instance_ids: &[String], filters: &[Filter]) -> Result<Vec<Ec2Instance>> {
        let mut s = self.lock();
        s.call("describe_instances")?;
        self.advance_instances(&mut s);
        Ok(s.instances
            .iter()
            .map(|t| &t.item)
            .filter(|i| instance_ids.is_empty() || instance_ids.contains(&i.instance_id))
            .filter(|i| matches(*i, filters))
            .cloned()
            .collect())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        let mut s = self.lock();
        s.call("terminate_instances")?;
        for id in instance_ids {
            let t = s.instance_mut(id)?;
            t.item.state = "shutting-down".into();
            t.polls = 0;
        }
        Ok(())
    }

    async fn start_instances(&self, instance_ids: &[String]) -> Result<()> {
        let mut s = self.lock();
        s.call("start_instances")?;
        for id in instance_ids {
            s.instance_mut(id)?.item.state = "running".into();
        }
        Ok(())
    }

    async fn stop_instances(&self, instance_ids: &[String]) -> Result<()> {
        let mut s = self.lock();
        s.call("stop_instances")?;
        for id in instance_ids {
            s.instance_mut(id)?.item.state = "stopped".into();
        }
        Ok(())
    }

    async fn reboot_instances(&self, instance_ids: &[String]) -> Result<()> {
        let mut s = self.lock();
        s.call("reboot_instances")?;
        for id in instance_ids {
            s.instance_mut(id)?;
        }
        Ok(())
    }

    async fn get_console_output(&self, instance_id: &str) -> Result<Option<String>> {
        let mut s = self.lock();
        s.call("get_console_output")?;
        s.instance_mut(instance_id)?;
        Ok(s.consoles.get(instance_id).cloned())
    }

    async fn associate_address(&self, instance_id: &str, public_ip: &str) -> Result<()> {
        let mut s = self.lock();
        s.call("associate_address")?;
        let t = s.instance_mut(instance_id)?;
        if t.item.state == "pending" {
            bail!("IncorrectInstanceState: {instance_id} is pending");
        }
        t.item.public_ips = vec![public_ip.to_string()];
        s.addresses.insert(public_ip.to_string(), instance_id.to_string());
        Ok(())
    }

    async fn create_launch_template(&self, input: &LaunchTemplateInput) -> Result<LaunchTemplate> {
        let mut s = self.lock();
        s.call("create_launch_template")?;
        let version = s.templates.get(&input.launch_template_name).copied().unwrap_or(0) + 1;
        s.templates.insert(input.launch_template_name.clone(), version);
        Ok(LaunchTemplate {
            name: input.launch_template_name.clone(),
            latest_version: version,
        })
    }

    async fn modify_launch_template(&self, name: &str, default_version: i64) -> Result<()> {
        let mut s = self.lock();
        s.call("modify_launch_template")?;
        match s.templates.get(name).copied() {
            Some(latest) if default_version <= latest => {
                s.default_versions.insert(name.to_string(), default_version);
                Ok(())
            }
            Some(_) => bail!("InvalidLaunchTemplateVersion: {name} v{default_version}"),
            None => bail!("InvalidLaunchTemplateName.NotFound: {name}"),
        }
    }

    async fn update_auto_scaling_group(&self, group: &str, launch_template: &str) -> Result<()> {
        let mut s = self.lock();
        s.call("update_auto_scaling_group")?;
        if !s.templates.contains_key(launch_template) {
            bail!("launch template {launch_template} not found");
        }
        s.group_templates
            .insert(group.to_string(), launch_template.to_string());
        Ok(())
    }

    async fn create_volume(&self, input: CreateVolumeInput) -> Result<Volume> {
        let mut s = self.lock();
        s.call("create_volume")?;
        let volume = Volume {
            volume_id: s.id("vol"),
            size_gb: input.size_gb,
            state: "available".into(),
            availability_zone: input.availability_zone,
            create_time: Some(Utc::now()),
            attached_instance_id: None,
            tags: input.tags,
        };
        s.volumes.push(volume.clone());
        Ok(volume)
    }

    async fn describe_volumes(&self, filters: &[Filter]) -> Result<Vec<Volume>> {
        let mut s = self.lock();
        s.call("describe_volumes")?;
        Ok(select(&s.volumes, &[], |v| v.volume_id.as_str(), filters))
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let mut s = self.lock();
        s.call("delete_volume")?;
        let volume = s
            .volumes
            .iter()
            .find(|v| v.volume_id == volume_id)
            .ok_or_else(|| anyhow!("InvalidVolume.NotFound: {volume_id}"))?;
        if volume.attached_instance_id.is_some() {
            bail!("VolumeInUse: {volume_id}");
        }
        s.volumes.retain(|v| v.volume_id != volume_id);
        Ok(())
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, _device: &str) -> Result<()> {
        let mut s = self.lock();
        s.call("attach_volume")?;
        s.instance_mut(instance_id)?;
        let volume = s
            .volumes
            .iter_mut()
            .find(|v| v.volume_id == volume_id)
            .ok_or_else(|| anyhow!("InvalidVolume.NotFound: {volume_id}"))?;
        if volume.attached_instance_id.is_some() {
            bail!("VolumeInUse: {volume_id}");
        }
        volume.attached_instance_id = Some(instance_id.to_string());
        volume.state = "in-use".into();
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        let mut s = self.lock();
        s.call("detach_volume")?;
        let volume = s
            .volumes
            .iter_mut()
            .find(|v| v.volume_id == volume_id)
            .ok_or_else(|| anyhow!("InvalidVolume.NotFound: {volume_id}"))?;
        if volume.attached_instance_id.as_deref() != Some(instance_id) {
            bail!("IncorrectState: {volume_id} is not attached to {instance_id}");
        }
        volume.attached_instance_id = None;
        volume.state = "available".into();
        Ok(())
    }
}
