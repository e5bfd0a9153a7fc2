use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use super::instance_group::LaunchTemplateInput;
use super::model::*;

/// The EC2-style calls the convergence and instance code depend on. One
/// method per backend call; implementations keep their own client and
/// credentials.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    // Networking
    async fn describe_vpcs(&self, vpc_ids: &[String], filters: &[Filter]) -> Result<Vec<Vpc>>;
    async fn create_vpc(&self, input: CreateVpcInput) -> Result<Vpc>;
    async fn describe_route_tables(&self, filters: &[Filter]) -> Result<Vec<RouteTable>>;
    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &str,
        gateway_id: &str,
    ) -> Result<()>;
    async fn describe_internet_gateways(&self, filters: &[Filter])
        -> Result<Vec<InternetGateway>>;
    async fn create_internet_gateway(&self) -> Result<InternetGateway>;
    async fn attach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> Result<()>;
    async fn describe_subnets(&self, subnet_ids: &[String], filters: &[Filter])
        -> Result<Vec<Subnet>>;
    async fn create_subnet(&self, input: CreateSubnetInput) -> Result<Subnet>;

    // Security groups
    async fn describe_security_groups(
        &self,
        group_ids: &[String],
        filters: &[Filter],
    ) -> Result<Vec<SecurityGroup>>;
    /// Returns the new group id.
    async fn create_security_group(&self, input: CreateSecurityGroupInput) -> Result<String>;
    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        permissions: &[IpPermission],
    ) -> Result<()>;
    async fn delete_security_group(&self, group_id: &str) -> Result<()>;

    // Images
    /// Starts a snapshot import of a local disk image; returns the task id.
    async fn import_snapshot(&self, image_path: &Path, description: &str) -> Result<String>;
    async fn describe_import_snapshot_tasks(&self, task_ids: &[String])
        -> Result<Vec<ImportSnapshotTask>>;
    /// Returns the new image id.
    async fn register_image(&self, input: RegisterImageInput) -> Result<String>;
    async fn describe_images(&self, filters: &[Filter]) -> Result<Vec<Image>>;
    async fn deregister_image(&self, image_id: &str) -> Result<()>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    // Instances
    async fn run_instances(&self, input: RunInstancesInput) -> Result<Ec2Instance>;
    async fn describe_instances(
        &self,
        instance_ids: &[String],
        filters: &[Filter],
    ) -> Result<Vec<Ec2Instance>>;
    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()>;
    async fn start_instances(&self, instance_ids: &[String]) -> Result<()>;
    async fn stop_instances(&self, instance_ids: &[String]) -> Result<()>;
    async fn reboot_instances(&self, instance_ids: &[String]) -> Result<()>;
    /// Base64 encoded console output, if any has been captured yet.
    async fn get_console_output(&self, instance_id: &str) -> Result<Option<String>>;
    async fn associate_address(&self, instance_id: &str, public_ip: &str) -> Result<()>;

    // Instance groups
    async fn create_launch_template(&self, input: &LaunchTemplateInput) -> Result<LaunchTemplate>;
    async fn modify_launch_template(&self, name: &str, default_version: i64) -> Result<()>;
    async fn update_auto_scaling_group(&self, group: &str, launch_template: &str) -> Result<()>;

    // Volumes
    async fn create_volume(&self, input: CreateVolumeInput) -> Result<Volume>;
    async fn describe_volumes(&self, filters: &[Filter]) -> Result<Vec<Volume>>;
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;
    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;
    async fn detach_volume(&self, volume_id: &str, instance_id: &str) -> Result<()>;
}
