//! Shared Components Server
//!
//! Demo replication server: one wallet component per demo instance, a
//! periodic income tick, and a remote `buy` function players can call
//! once connected.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shared_components::{
    component::guard,
    network::{ReplicationServer, ServerConfig},
    ComponentDescriptor, InstanceHandle, Recipients, Registry, RuntimeConfig, ServerRuntime, SyncScope,
    VERSION,
};

const DEMO_INSTANCES: u64 = 4;
const INCOME_PER_TICK: i64 = 10;
const INCOME_INTERVAL: Duration = Duration::from_secs(5);

struct Storage;
struct MoneyStorage;

fn registry() -> Arc<Registry> {
    let storage = ComponentDescriptor::builder::<Storage>("Storage")
        .initial_state(json!({ "amount": 0 }))
        .remote_function("buy", guard::typed::<(i64,)>())
        .server_event("purchased", guard::arity(2))
        .abstract_type()
        .build();

    let money = ComponentDescriptor::builder::<MoneyStorage>("MoneyStorage")
        .extends(&storage)
        .sync_scope(SyncScope::Connected)
        .action("deposit", |state, args| {
            let amount = state["amount"].as_i64().unwrap_or(0);
            let add = args.first().and_then(Value::as_i64).unwrap_or(0);
            json!({ "amount": amount + add })
        })
        .on_request("buy", |component, player, args| {
            let price = args.first().and_then(Value::as_i64).unwrap_or(0);
            let amount = component.state()["amount"].as_i64().unwrap_or(0);
            if price <= 0 || price > amount {
                return json!(false);
            }
            if let Err(e) = component.dispatch(json!({ "amount": amount - price })) {
                warn!("Purchase by {} failed: {}", player, e);
                return json!(false);
            }
            let details = vec![json!(player.to_uuid_string()), json!(price)];
            let _ = component.fire_event("purchased", Recipients::All, details);
            json!(true)
        })
        .build();

    Registry::builder().component(storage).component(money).build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Shared Components Server v{}", VERSION);

    let runtime_config = RuntimeConfig::from_env();
    let server_config = ServerConfig::from_env();
    info!(
        "Diff mode {:?}, call timeout {:?}, anonymous players {}",
        runtime_config.diff_mode, runtime_config.call_timeout, server_config.auth.allow_anonymous
    );

    let runtime = Arc::new(Mutex::new(ServerRuntime::new(registry(), runtime_config)));
    let mut wallets = Vec::new();
    {
        let mut rt = runtime.lock().await;
        for instance in 1..=DEMO_INSTANCES {
            let key = rt
                .add::<MoneyStorage>(InstanceHandle(instance))
                .context("Failed to create demo wallet")?;
            wallets.push(key);
        }
    }
    info!("Created {} demo wallets", wallets.len());

    let income = Arc::clone(&runtime);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(INCOME_INTERVAL);
        loop {
            ticker.tick().await;
            let mut rt = income.lock().await;
            for key in &wallets {
                if let Err(e) = rt.call_action(*key, "deposit", &[json!(INCOME_PER_TICK)]) {
                    warn!("Income tick for {} failed: {}", key, e);
                }
            }
        }
    });

    let server = Arc::new(ReplicationServer::new(server_config, runtime));
    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.shutdown();
        }
    });

    server.run().await.context("Replication server failed")?;
    info!("Server stopped");
    Ok(())
}
