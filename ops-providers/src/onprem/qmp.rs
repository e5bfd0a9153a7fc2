//! QEMU machine protocol over the instance's localhost management port.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use ops_common::Arch;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct QmpClient {
    addr: String,
    timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    pub free_mb: u64,
    pub total_mb: u64,
}

impl QmpClient {
    pub fn localhost(port: u16) -> Self {
        Self {
            addr: format!("localhost:{port}"),
            timeout: Duration::from_secs(5),
        }
    }

    /// Negotiates capabilities, then sends each command in order and returns
    /// their `return` values.
    pub async fn execute(&self, commands: &[Value]) -> Result<Vec<Value>> {
        tokio::time::timeout(self.timeout, self.session(commands))
            .await
            .with_context(|| format!("qmp on {} timed out", self.addr))?
    }

    async fn session(&self, commands: &[Value]) -> Result<Vec<Value>> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("unable to reach qmp on {}", self.addr))?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let greeting = lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("qmp closed before greeting"))?;
        debug!("[onprem] qmp greeting {}", greeting);

        let negotiate = json!({ "execute": "qmp_capabilities" });
        let mut out = Vec::with_capacity(commands.len());
        for (i, cmd) in std::iter::once(&negotiate).chain(commands).enumerate() {
            write.write_all(format!("{cmd}\n").as_bytes()).await?;
            let reply = loop {
                let line = lines
                    .next_line()
                    .await?
                    .ok_or_else(|| anyhow!("qmp closed while waiting for {}", cmd["execute"]))?;
                let v: Value = serde_json::from_str(&line)
                    .with_context(|| format!("invalid qmp reply: {line}"))?;
                // asynchronous events are interleaved with replies
                if v.get("event").is_none() {
                    break v;
                }
            };
            if let Some(err) = reply.get("error") {
                bail!(
                    "qmp {} failed: {}",
                    cmd["execute"],
                    err["desc"].as_str().unwrap_or("unknown error")
                );
            }
            if i > 0 {
                out.push(reply.get("return").cloned().unwrap_or(Value::Null));
            }
        }
        Ok(out)
    }

    pub async fn command(&self, name: &str) -> Result<Value> {
        let mut out = self.execute(&[json!({ "execute": name })]).await?;
        Ok(out.pop().unwrap_or(Value::Null))
    }

    /// Balloon statistics; needs a virtio-balloon device on the guest.
    pub async fn memory_stats(&self, arch: Arch) -> Result<MemoryStats> {
        let devid = match arch {
            Arch::Amd64 => "3",
            Arch::Arm64 => "2",
        };
        let path = format!("/machine/peripheral-anon/device[{devid}]");
        let out = self
            .execute(&[
                json!({"execute": "qom-set", "arguments": {
                    "path": path, "property": "guest-stats-polling-interval", "value": 2}}),
                json!({"execute": "qom-get", "arguments": {
                    "path": path, "property": "guest-stats"}}),
            ])
            .await?;
        let stats = &out[1]["stats"];
        let read = |key: &str| {
            stats[key]
                .as_u64()
                .map(|bytes| bytes / 1_000_000)
                .ok_or_else(|| anyhow!("guest stats missing {key}"))
        };
        Ok(MemoryStats {
            free_mb: read("stat-free-memory")?,
            total_mb: read("stat-total-memory")?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    /// Accepts QMP sessions forever, answering each command with
    /// `respond(execute)` and recording the command names.
    pub(crate) async fn fake_qmp<F>(respond: F) -> (u16, Arc<Mutex<Vec<String>>>)
    where
        F: Fn(&str) -> Value + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let respond = Arc::new(respond);
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                write
                    .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
                    .await
                    .unwrap();
                while let Ok(Some(line)) = lines.next_line().await {
                    let v: Value = serde_json::from_str(&line).unwrap();
                    let name = v["execute"].as_str().unwrap().to_string();
                    log.lock().unwrap().push(name.clone());
                    let reply = (*respond)(&name);
                    write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
                }
            }
        });
        (port, seen)
    }

    #[tokio::test]
    async fn negotiates_then_runs_command() {
        let (port, seen) = fake_qmp(|_| json!({"return": {}})).await;
        QmpClient::localhost(port).command("stop").await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["qmp_capabilities", "stop"]);
    }

    #[tokio::test]
    async fn error_reply_fails() {
        let (port, _) = fake_qmp(|name| {
            if name == "cont" {
                json!({"error": {"class": "GenericError", "desc": "not paused"}})
            } else {
                json!({"return": {}})
            }
        })
        .await;
        let err = QmpClient::localhost(port).command("cont").await.unwrap_err();
        assert!(err.to_string().contains("not paused"));
    }

    #[tokio::test]
    async fn reads_memory_stats() {
        let (port, seen) = fake_qmp(|name| match name {
            "qom-get" => json!({"return": {"stats": {
                "stat-free-memory": 1_500_000_000u64,
                "stat-total-memory": 2_000_000_000u64}}}),
            _ => json!({"return": {}}),
        })
        .await;
        let stats = QmpClient::localhost(port).memory_stats(Arch::Amd64).await.unwrap();
        assert_eq!(stats, MemoryStats { free_mb: 1500, total_mb: 2000 });
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["qmp_capabilities", "qom-set", "qom-get"]
        );
    }

    #[tokio::test]
    async fn unreachable_port_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(QmpClient::localhost(port).command("stop").await.is_err());
    }
}
