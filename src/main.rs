use anyhow::Context;
use dotenv::dotenv;
use replica_balancer::config::{BalancerConfig, NodeConfig};
use replica_balancer::core::logging::init_logging;
use replica_balancer::{LoadBalancer, MemoryDriver, NodeDriver};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Replicas started when the configuration lists none
const DEFAULT_NODES: [&str; 3] = ["db1", "db2", "db3"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BALANCER_CONFIG").ok());
    let mut config = BalancerConfig::load(config_path.as_deref())
        .await
        .context("Failed to load configuration")?;
    if config.nodes.is_empty() {
        config.nodes = DEFAULT_NODES
            .iter()
            .map(|name| NodeConfig {
                name: name.to_string(),
                weight: 1,
                endpoint: None,
            })
            .collect();
    }

    init_logging(&config.logging)?;

    let mut replicas: HashMap<String, Arc<MemoryDriver>> = HashMap::new();
    let balancer = LoadBalancer::from_config(&config, |node| {
        let replica = Arc::new(MemoryDriver::new(node.name.clone()));
        replicas.insert(node.name.clone(), replica.clone());
        Ok(replica as Arc<dyn NodeDriver>)
    })
    .await?;

    info!(
        nodes = config.nodes.len(),
        strategy = %balancer.strategy(),
        "🚀 Replica balancer started"
    );
    balancer.start_monitoring().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('\\') {
            let mut parts = command.split_whitespace();
            let name = parts.next().unwrap_or_default();
            let arg = parts.next().unwrap_or_default();
            let output = match name {
                "quit" | "q" => break,
                "nodes" => Ok(json!(balancer.nodes().await)),
                "disable" => balancer.disable_node(arg).await.map(|_| json!({ "disabled": arg })),
                "enable" => balancer.enable_node(arg).await.map(|outcome| json!(outcome)),
                "down" | "up" => match replicas.get(arg) {
                    Some(replica) => {
                        replica.set_available(name == "up");
                        Ok(json!({ "replica": arg, "available": name == "up" }))
                    }
                    None => Ok(json!({ "error": format!("unknown replica {}", arg) })),
                },
                "strategy" => arg.parse().map(|algorithm| {
                    balancer.set_strategy(algorithm);
                    json!({ "strategy": balancer.strategy() })
                }),
                other => Ok(json!({ "error": format!("unknown command \\{}", other) })),
            };
            print_result(output);
            continue;
        }

        print_result(balancer.execute(line).await.map(|outcome| json!(outcome)));
    }

    balancer.stop_monitoring().await;
    balancer.coordinator().wait_for_recoveries().await;
    let log = balancer.command_log();
    let pending = log.total_len().await;
    if pending > 0 {
        warn!(
            pending = pending,
            nodes = ?log.nodes_with_entries().await,
            "Exiting with commands still waiting for replay"
        );
    }
    Ok(())
}

fn print_result(result: replica_balancer::Result<serde_json::Value>) {
    let value = match result {
        Ok(value) => value,
        Err(e) => json!({ "error": e.to_string() }),
    };
    match serde_json::to_string_pretty(&value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("failed to render result: {}", e),
    }
}
