use anyhow::{Context, Result};
use ops_common::Tag;
use tracing::info;

use super::api::Ec2Api;
use super::model::NetworkInterfaceSpec;

/// Everything needed to roll an auto scaling group onto a new image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LaunchTemplateInput {
    pub auto_scaling_group: String,
    pub image_id: String,
    pub instance_profile_name: Option<String>,
    pub instance_type: String,
    pub launch_template_name: String,
    pub tags: Vec<Tag>,
    pub network_interface: NetworkInterfaceSpec,
    pub user_data: Option<String>,
}

/// Creates a launch template version, makes it the default and points the
/// group at it. Stops at the first failing step.
pub async fn roll_instance_group(api: &dyn Ec2Api, input: &LaunchTemplateInput) -> Result<()> {
    let template = api
        .create_launch_template(input)
        .await
        .with_context(|| format!("unable to create launch template {}", input.launch_template_name))?;

    api.modify_launch_template(&template.name, template.latest_version)
        .await
        .with_context(|| {
            format!(
                "unable to set default version {} of launch template {}",
                template.latest_version, template.name
            )
        })?;

    api.update_auto_scaling_group(&input.auto_scaling_group, &template.name)
        .await
        .with_context(|| {
            format!("unable to update auto scaling group {}", input.auto_scaling_group)
        })?;

    info!(
        "[aws] auto scaling group {} now uses {} v{}",
        input.auto_scaling_group, template.name, template.latest_version
    );
    Ok(())
}
