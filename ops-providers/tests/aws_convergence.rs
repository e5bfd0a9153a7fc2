use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use ops_common::{Config, OpsError, ProviderConfig};
use ops_providers::aws::{network, AwsProvider};
use ops_providers::mock::{MockEc2, DEFAULT_ZONE};
use ops_providers::waiter::Waiter;
use ops_providers::{ImageBuilder, Provider};

struct NoBuilds;

#[async_trait]
impl ImageBuilder for NoBuilds {
    async fn build_image(&self, _config: &Config) -> Result<PathBuf> {
        bail!("not building in tests")
    }

    async fn build_image_from_package(&self, _pkg: &Path, _config: &Config) -> Result<PathBuf> {
        bail!("not building in tests")
    }
}

fn fast(op: &str) -> Waiter {
    Waiter::new(op, Duration::from_millis(10), 10)
}

fn provider(mock: MockEc2) -> (Arc<MockEc2>, AwsProvider<MockEc2>) {
    let ec2 = Arc::new(mock);
    let p = AwsProvider::new(ec2.clone(), Arc::new(NoBuilds)).with_waiters(
        fast("snapshot import"),
        fast("instance termination"),
        fast("static ip"),
    );
    (ec2, p)
}

fn config(home: &Path) -> Config {
    let mut c = Config::default().with_home(home);
    c.cloud.zone = DEFAULT_ZONE.into();
    c.cloud.image_name = "web".into();
    c.run.instance_name = "web-1".into();
    c.run.ports = vec!["80".into(), "8000-8010".into()];
    c
}

async fn with_image(p: &AwsProvider<MockEc2>, config: &Config) {
    let disk = config.home.join("web.img");
    std::fs::write(&disk, b"disk").unwrap();
    p.create_image(config, &disk).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn image_and_instance_in_default_vpc() {
    let home = tempfile::tempdir().unwrap();
    let cfg = config(home.path());
    let (ec2, p) = provider(MockEc2::with_default_vpc());

    with_image(&p, &cfg).await;
    let images = p.get_images(&cfg).await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].name, "web");

    p.create_instance(&cfg).await.unwrap();
    assert_eq!(ec2.vpcs().len(), 1);
    assert_eq!(ec2.subnets().len(), 1);

    let groups = ec2.security_groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].description, "security group for web-1");
    assert!(groups[0].tags.iter().any(|t| t.key == "ops-created" && t.value == "true"));
    let ports: Vec<_> = groups[0]
        .ingress
        .iter()
        .map(|r| (r.ip_protocol.as_str(), r.from_port, r.to_port))
        .collect();
    assert_eq!(ports, vec![("tcp", 80, 80), ("tcp", 8000, 8010)]);
    assert!(groups[0].ingress.iter().all(|r| r.ipv6_ranges.is_empty()));

    let found = p.get_instance_by_name(&cfg, "web-1").await.unwrap();
    assert_eq!(found.image, "web");
    assert_eq!(p.get_instances(&cfg).await.unwrap().len(), 1);

    p.delete_instance(&cfg, "web-1").await.unwrap();
    assert!(ec2.security_groups().is_empty());
    assert_eq!(ec2.instances()[0].state, "terminated");
    assert!(p.get_instances(&cfg).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn named_vpc_is_built_once() {
    let home = tempfile::tempdir().unwrap();
    let mut cfg = config(home.path());
    cfg.cloud.vpc = "ops-net".into();
    cfg.cloud.enable_ipv6 = true;
    let (ec2, p) = provider(MockEc2::with_default_vpc());
    with_image(&p, &cfg).await;

    p.create_instance(&cfg).await.unwrap();
    let vpcs = ec2.vpcs();
    assert_eq!(vpcs.len(), 2);
    let vpc = vpcs.iter().find(|v| !v.is_default).unwrap();
    assert_eq!(vpc.cidr_block, "172.32.0.0/16");
    assert!(vpc.tags.iter().any(|t| t.key == "Name" && t.value == "ops-net"));
    assert!(vpc.tags.iter().any(|t| t.key == "CreatedBy" && t.value == "ops"));

    let table = ec2
        .route_tables()
        .into_iter()
        .find(|r| r.vpc_id == vpc.vpc_id)
        .unwrap();
    let routes: Vec<_> = table.routes.iter().map(|r| r.destination.as_str()).collect();
    assert_eq!(routes, vec!["::/0", "0.0.0.0/0"]);
    assert_eq!(ec2.gateways().len(), 2);

    let subnet = ec2
        .subnets()
        .into_iter()
        .find(|s| s.vpc_id == vpc.vpc_id)
        .unwrap();
    assert!(subnet.ipv6_cidr_block.as_deref().unwrap().ends_with("/64"));
    assert_eq!(ec2.security_groups()[0].ingress[0].ip_protocol, "icmpv6");

    cfg.run.instance_name = "web-2".into();
    p.create_instance(&cfg).await.unwrap();
    assert_eq!(ec2.vpcs().len(), 2);
    assert_eq!(ec2.subnets().len(), 2);
    assert_eq!(ec2.instances().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn no_vpc_at_all_is_an_error() {
    let home = tempfile::tempdir().unwrap();
    let cfg = config(home.path());
    let (ec2, p) = provider(MockEc2::new());
    with_image(&p, &cfg).await;

    let err = p.create_instance(&cfg).await.unwrap_err();
    assert!(err.to_string().contains("no vpc available"));
    assert!(ec2.instances().is_empty());
}

#[tokio::test(start_paused = true)]
async fn foreign_security_group_is_rejected() {
    let home = tempfile::tempdir().unwrap();
    let mut cfg = config(home.path());
    let (ec2, p) = provider(MockEc2::with_default_vpc());
    with_image(&p, &cfg).await;

    ec2.insert_security_group("shared", "vpc-elsewhere");
    cfg.cloud.security_group = "shared".into();
    let err = p.create_instance(&cfg).await.unwrap_err();
    assert!(matches!(OpsError::find(&err), Some(OpsError::Mismatch { .. })));

    cfg.cloud.security_group = "missing".into();
    let err = p.create_instance(&cfg).await.unwrap_err();
    assert!(OpsError::is_not_found(&err));
    assert!(!ec2.calls().contains(&"run_instances".to_string()));
}

#[tokio::test(start_paused = true)]
async fn same_named_group_in_another_vpc_is_ignored() {
    let ec2 = MockEc2::with_default_vpc();
    let vpc = ec2.vpcs()[0].clone();
    ec2.insert_security_group("web", "vpc-other");
    let ours = ec2.insert_security_group("web", &vpc.vpc_id);

    let cloud = ProviderConfig {
        security_group: "web".into(),
        ..Default::default()
    };
    let sg = network::get_security_group(&ec2, &cloud, &vpc).await.unwrap();
    assert_eq!(sg.group_id, ours);
    assert_eq!(sg.vpc_id, vpc.vpc_id);

    let elsewhere = ProviderConfig {
        security_group: "db".into(),
        ..Default::default()
    };
    ec2.insert_security_group("db", "vpc-other");
    let err = network::get_security_group(&ec2, &elsewhere, &vpc).await.unwrap_err();
    assert!(matches!(OpsError::find(&err), Some(OpsError::Mismatch { .. })));
}

#[tokio::test(start_paused = true)]
async fn configured_security_group_survives_delete() {
    let home = tempfile::tempdir().unwrap();
    let mut cfg = config(home.path());
    let (ec2, p) = provider(MockEc2::with_default_vpc());
    with_image(&p, &cfg).await;

    let vpc_id = ec2.vpcs()[0].vpc_id.clone();
    let sg = ec2.insert_security_group("shared", &vpc_id);
    cfg.cloud.security_group = sg.clone();
    p.create_instance(&cfg).await.unwrap();
    p.delete_instance(&cfg, "web-1").await.unwrap();

    assert_eq!(ec2.security_groups().len(), 1);
    assert!(!ec2.calls().contains(&"delete_security_group".to_string()));
}

#[tokio::test(start_paused = true)]
async fn failed_import_registers_nothing() {
    let home = tempfile::tempdir().unwrap();
    let cfg = config(home.path());
    let (ec2, p) = provider(MockEc2::with_default_vpc().failing_imports());
    let disk = home.path().join("web.img");
    std::fs::write(&disk, b"disk").unwrap();

    let err = p.create_image(&cfg, &disk).await.unwrap_err();
    assert!(matches!(OpsError::find(&err), Some(OpsError::Failed { .. })));
    assert!(ec2.images().is_empty());
    assert!(!ec2.calls().contains(&"register_image".to_string()));
}

#[tokio::test(start_paused = true)]
async fn slow_import_times_out() {
    let home = tempfile::tempdir().unwrap();
    let cfg = config(home.path());
    let (_, p) = provider(MockEc2::with_default_vpc().with_import_polls(50));
    let disk = home.path().join("web.img");
    std::fs::write(&disk, b"disk").unwrap();

    let err = p.create_image(&cfg, &disk).await.unwrap_err();
    assert!(OpsError::is_timeout(&err));
}

#[tokio::test(start_paused = true)]
async fn instance_group_rolls_a_template() {
    let home = tempfile::tempdir().unwrap();
    let mut cfg = config(home.path());
    cfg.run.instance_group = "asg-web".into();
    let (ec2, p) = provider(MockEc2::with_default_vpc());
    with_image(&p, &cfg).await;

    p.create_instance(&cfg).await.unwrap();
    assert_eq!(ec2.group_template("asg-web").as_deref(), Some("asg-web-web"));
    assert_eq!(ec2.default_version("asg-web-web"), Some(1));
    assert!(ec2.instances().is_empty());

    p.create_instance(&cfg).await.unwrap();
    assert_eq!(ec2.default_version("asg-web-web"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn static_ip_waits_out_pending() {
    let home = tempfile::tempdir().unwrap();
    let mut cfg = config(home.path());
    cfg.cloud.static_ip = "54.1.2.3".into();
    let (ec2, p) = provider(MockEc2::with_default_vpc().with_pending_polls(3));
    with_image(&p, &cfg).await;

    p.create_instance(&cfg).await.unwrap();
    let id = ec2.instances()[0].instance_id.clone();
    assert_eq!(ec2.address_of("54.1.2.3"), Some(id));
}

#[tokio::test(start_paused = true)]
async fn volumes_attach_and_detach() {
    let home = tempfile::tempdir().unwrap();
    let cfg = config(home.path());
    let (ec2, p) = provider(MockEc2::with_default_vpc());
    with_image(&p, &cfg).await;
    p.create_instance(&cfg).await.unwrap();

    let vol = p.create_volume(&cfg, "data", None, Some("2G")).await.unwrap();
    assert_eq!(vol.size, "2GiB");
    assert_eq!(vol.name, "data");
    assert_eq!(p.get_all_volumes(&cfg).await.unwrap().len(), 1);

    assert!(p.attach_volume(&cfg, "web-1", "data", 0).await.is_err());
    p.attach_volume(&cfg, "web-1", "data", 1).await.unwrap();
    assert!(ec2.volumes()[0].attached_instance_id.is_some());
    assert!(p.delete_volume(&cfg, "data").await.is_err());

    p.detach_volume(&cfg, "web-1", "data").await.unwrap();
    p.delete_volume(&cfg, &vol.id).await.unwrap();
    assert!(ec2.volumes().is_empty());

    let dir = home.path().to_path_buf();
    let err = p.create_volume(&cfg, "seeded", Some(&dir), None).await.unwrap_err();
    assert!(matches!(OpsError::find(&err), Some(OpsError::Unsupported(_))));
}

#[tokio::test(start_paused = true)]
async fn lifecycle_and_console() {
    let home = tempfile::tempdir().unwrap();
    let cfg = config(home.path());
    let (ec2, p) = provider(MockEc2::with_default_vpc());
    with_image(&p, &cfg).await;
    p.create_instance(&cfg).await.unwrap();
    let id = ec2.instances()[0].instance_id.clone();

    p.stop_instance(&cfg, "web-1").await.unwrap();
    assert_eq!(p.get_instance_by_name(&cfg, "web-1").await.unwrap().status, "stopped");
    p.start_instance(&cfg, "web-1").await.unwrap();
    p.reboot_instance(&cfg, "web-1").await.unwrap();

    assert_eq!(p.get_instance_logs(&cfg, "web-1").await.unwrap(), "");
    ec2.set_console_output(&id, "en1: assigned 172.31.0.9");
    assert_eq!(
        p.get_instance_logs(&cfg, "web-1").await.unwrap(),
        "en1: assigned 172.31.0.9"
    );

    assert!(OpsError::is_not_found(&p.get_instance_by_name(&cfg, "nope").await.unwrap_err()));
    assert!(OpsError::is_not_found(&p.delete_image(&cfg, "nope").await.unwrap_err()));

    p.delete_image(&cfg, "web").await.unwrap();
    assert!(ec2.images().is_empty());
}
