use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ops_common::Config;
use ops_orchestrator::Compose;
use ops_providers::onprem::dhcp::DhcpClient;
use ops_providers::onprem::{network, IprouteNetworkService, OnPrem};
use ops_providers::{bulk, Provider, ProviderManager};
use tracing::error;

const USAGE: &str = "usage: ops <command>

  compose up [file]
  instance list | delete <name...> | start|stop|reboot|logs|stats <name>
  image list | delete <name...>
  volume list | create <name> [size] [data-dir] | delete <name>
         | attach <instance> <volume> <id> | detach <instance> <volume>
  network setup | reset";

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    ops_common::logging::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Vec<String>) -> Result<()> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let config = Config::from_env();

    match args.as_slice() {
        ["compose", "up", rest @ ..] => {
            let file = rest.first().map(PathBuf::from);
            let mut compose = Compose::new(config, Arc::new(OnPrem::new()));
            if let Some(port) = std::env::var("OPS_DNS_PORT").ok().filter(|p| !p.is_empty()) {
                compose = compose.with_dns_port(port.parse().context("invalid OPS_DNS_PORT")?);
            }
            let report = compose.up(file.as_deref()).await?;
            println!("dns\t{}\t{}", report.dns.pid, report.dns.ip);
            for s in report.services {
                println!("{}\t{}\t{}", s.name, s.pid, s.ip);
            }
        }
        ["instance", "stats", name] => {
            let stats = OnPrem::new().instance_stats(&config, name).await?;
            println!("{} MB free of {} MB", stats.free_mb, stats.total_mb);
        }
        ["instance", rest @ ..] => instance_command(config, rest).await?,
        ["image", rest @ ..] => image_command(config, rest).await?,
        ["volume", rest @ ..] => volume_command(config, rest).await?,
        ["network", "setup"] => {
            let svc = IprouteNetworkService;
            let ip = network::setup_bridge_network(&svc, &DhcpClient::default()).await?;
            println!("{} up with {}", network::BRIDGE_NAME, ip);
        }
        ["network", "reset"] => {
            network::reset_bridge_network(&IprouteNetworkService).await?;
            println!("{} removed", network::BRIDGE_NAME);
        }
        _ => bail!("{}", USAGE),
    }
    Ok(())
}

async fn provider(config: &Config) -> Result<Arc<dyn Provider>> {
    let name = ProviderManager::current_provider_name();
    let provider = ProviderManager::get_provider(&name, config).await?;
    Ok(Arc::from(provider))
}

fn report(results: Vec<(String, Result<()>)>) -> Result<()> {
    let mut failed = 0;
    for (name, res) in results {
        match res {
            Ok(()) => println!("{} deleted", name),
            Err(e) => {
                failed += 1;
                println!("{}: {:#}", name, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} deletion(s) failed", failed);
    }
    Ok(())
}

async fn instance_command(config: Config, args: &[&str]) -> Result<()> {
    let p = provider(&config).await?;
    match args {
        ["list"] => {
            for i in p.get_instances(&config).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    i.id,
                    i.name,
                    i.status,
                    i.private_ips.join(","),
                    i.public_ips.join(",")
                );
            }
        }
        ["delete", names @ ..] if !names.is_empty() => {
            let names = names.iter().map(|n| n.to_string()).collect();
            report(bulk::delete_instances(p, Arc::new(config), names).await)?;
        }
        ["start", name] => p.start_instance(&config, name).await?,
        ["stop", name] => p.stop_instance(&config, name).await?,
        ["reboot", name] => p.reboot_instance(&config, name).await?,
        ["logs", name] => print!("{}", p.get_instance_logs(&config, name).await?),
        _ => bail!("{}", USAGE),
    }
    Ok(())
}

async fn image_command(config: Config, args: &[&str]) -> Result<()> {
    let p = provider(&config).await?;
    match args {
        ["list"] => {
            for i in p.get_images(&config).await? {
                println!("{}\t{}\t{}\t{}", i.id, i.name, i.status, i.size);
            }
        }
        ["delete", names @ ..] if !names.is_empty() => {
            let names = names.iter().map(|n| n.to_string()).collect();
            report(bulk::delete_images(p, Arc::new(config), names).await)?;
        }
        _ => bail!("{}", USAGE),
    }
    Ok(())
}

async fn volume_command(config: Config, args: &[&str]) -> Result<()> {
    let p = provider(&config).await?;
    match args {
        ["list"] => {
            for v in p.get_all_volumes(&config).await? {
                println!("{}\t{}\t{}\t{}\t{}", v.id, v.name, v.size, v.attached_to, v.path);
            }
        }
        ["create", name, rest @ ..] => {
            let size = rest.first().copied();
            let data = rest.get(1).map(PathBuf::from);
            let v = p.create_volume(&config, name, data.as_deref(), size).await?;
            println!("{} created at {}", v.name, v.path);
        }
        ["delete", name] => p.delete_volume(&config, name).await?,
        ["attach", instance, volume, id] => {
            let id: u32 = id.parse().context("attach id must be a number")?;
            p.attach_volume(&config, instance, volume, id).await?;
        }
        ["detach", instance, volume] => p.detach_volume(&config, instance, volume).await?,
        _ => bail!("{}", USAGE),
    }
    Ok(())
}
