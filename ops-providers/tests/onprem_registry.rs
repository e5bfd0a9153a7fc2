use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use ops_common::{Config, OpsError, RunConfig};
use ops_providers::bulk;
use ops_providers::onprem::{Hypervisor, InstanceRecord, InstanceStore, OnPrem};
use ops_providers::Provider;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};

const DEAD_PID: u32 = 2_147_483_000;

/// Runs `sleep` in place of a guest so pids are real processes.
#[derive(Default)]
struct SleepHypervisor {
    children: Mutex<Vec<Child>>,
}

#[async_trait]
impl Hypervisor for SleepHypervisor {
    async fn start(&self, _run: &RunConfig) -> Result<u32> {
        let child = Command::new("sleep").arg("30").spawn()?;
        let pid = child.id().unwrap();
        self.children.lock().unwrap().push(child);
        Ok(pid)
    }
}

/// Hands out our own pid, which is always alive.
struct SelfHypervisor;

#[async_trait]
impl Hypervisor for SelfHypervisor {
    async fn start(&self, _run: &RunConfig) -> Result<u32> {
        Ok(std::process::id())
    }
}

fn home_with_image() -> (tempfile::TempDir, Config) {
    let home = tempfile::tempdir().unwrap();
    let mut config = Config::default().with_home(home.path());
    config.cloud.image_name = "app".into();
    std::fs::create_dir_all(config.images_dir()).unwrap();
    std::fs::write(config.image_file("app"), b"disk").unwrap();
    (home, config)
}

#[tokio::test]
async fn boot_list_and_bulk_delete() {
    let (_home, config) = home_with_image();
    let hv = Arc::new(SleepHypervisor::default());
    let onprem: Arc<dyn Provider> = Arc::new(OnPrem::new().with_hypervisor(hv.clone()));

    for name in ["a", "b"] {
        let mut c = config.clone();
        c.run.instance_name = name.into();
        c.run.ports = vec!["8080".into()];
        onprem.create_instance(&c).await.unwrap();
    }

    let mut listed = onprem.get_instances(&config).await.unwrap();
    listed.sort_by(|x, y| x.name.cmp(&y.name));
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].name, "a");
    assert_eq!(listed[0].private_ips, vec!["127.0.0.1"]);
    assert_eq!(listed[0].ports, vec!["8080"]);
    assert!(listed[0].created.is_some());

    let results = bulk::delete_instances(
        onprem.clone(),
        Arc::new(config.clone()),
        vec!["a".into(), "b".into(), "c".into()],
    )
    .await;
    assert_eq!(results.len(), 3);
    for (name, res) in &results {
        match name.as_str() {
            "c" => assert!(OpsError::is_not_found(res.as_ref().unwrap_err())),
            _ => assert!(res.is_ok(), "{name}: {res:?}"),
        }
    }
    assert!(onprem.get_instances(&config).await.unwrap().is_empty());

    let children: Vec<Child> = hv.children.lock().unwrap().drain(..).collect();
    for mut child in children {
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}

#[tokio::test]
async fn stale_records_are_purged_on_listing() {
    let (_home, config) = home_with_image();
    let store = InstanceStore::new(config.instances_dir());
    store
        .write(
            DEAD_PID,
            &InstanceRecord {
                instance: "ghost".into(),
                pid: DEAD_PID.to_string(),
                ..Default::default()
            },
        )
        .unwrap();

    let onprem = OnPrem::new().with_hypervisor(Arc::new(SelfHypervisor));
    onprem.create_instance(&config).await.unwrap();

    let listed = onprem.get_instances(&config).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "app");
    assert_eq!(listed[0].id, std::process::id().to_string());
    assert!(!config.instances_dir().join(DEAD_PID.to_string()).exists());

    let err = onprem.delete_instance(&config, "ghost").await.unwrap_err();
    assert!(matches!(OpsError::find(&err), Some(OpsError::InstanceNotFound(n)) if n == "ghost"));
}

async fn qmp_server() -> (u16, Arc<Mutex<Vec<Value>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"{\"QMP\": {}}\n").await.unwrap();
            while let Ok(Some(line)) = lines.next_line().await {
                log.lock().unwrap().push(serde_json::from_str(&line).unwrap());
                write.write_all(b"{\"return\": {}}\n").await.unwrap();
            }
        }
    });
    (port, seen)
}

#[tokio::test]
async fn lifecycle_and_hotplug_go_over_qmp() {
    let (_home, config) = home_with_image();
    let onprem = OnPrem::new().with_hypervisor(Arc::new(SelfHypervisor));
    let pid = onprem.create_instance_pid(&config).await.unwrap();

    let (port, seen) = qmp_server().await;
    let store = InstanceStore::new(config.instances_dir());
    let mut record = store.read(pid).unwrap().unwrap();
    record.mgmt = port.to_string();
    store.write(pid, &record).unwrap();

    onprem.stop_instance(&config, "app").await.unwrap();
    onprem.start_instance(&config, "app").await.unwrap();
    onprem.reboot_instance(&config, "app").await.unwrap();

    std::fs::create_dir_all(config.volumes_dir()).unwrap();
    std::fs::write(config.volumes_dir().join("data:0123.raw"), b"").unwrap();
    onprem.attach_volume(&config, "app", "data", 2).await.unwrap();
    onprem.detach_volume(&config, "app", "0123").await.unwrap();

    let commands: Vec<String> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|v| v["execute"].as_str().unwrap().to_string())
        .filter(|c| c != "qmp_capabilities")
        .collect();
    assert_eq!(
        commands,
        vec!["stop", "cont", "system_reset", "blockdev-add", "device_add", "device_del", "blockdev-del"]
    );

    let device_add = seen
        .lock()
        .unwrap()
        .iter()
        .find(|v| v["execute"] == "device_add")
        .cloned()
        .unwrap();
    assert_eq!(device_add["arguments"]["device_id"], "persistent-disk-2");
    assert_eq!(device_add["arguments"]["bus"], "scsi0.0");

    assert!(OpsError::is_not_found(
        &onprem.attach_volume(&config, "app", "nope", 1).await.unwrap_err()
    ));
    store.remove(pid).unwrap();
}
