//! SimCommander demo - scripted tour of the client API.
//!
//! Connects to the host, pings the server, opens a session and exercises a
//! handful of requests and a subscription before disconnecting.
//!
//! Usage: `simcommander-demo [config.json]`. Environment overrides
//! (`SIMCOMMANDER_SOCKET`, `SIMCOMMANDER_TCP`, ...) apply on top of the file.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simcommander::{
    CalcResultType, ClientConfig, ClientError, Command, CommandId, DataRequest, ListOutcome, LogLevel,
    LookupItemType, SimClient, UpdatePeriod, ValueType,
};

const RPM_REQUEST_ID: u32 = 1;

fn load_config() -> Result<ClientConfig> {
    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::load(&path)?,
        None => ClientConfig::default(),
    };
    config
        .with_overrides(|key| std::env::var(key).ok())
        .context("Invalid environment override")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "simcommander=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Starting SimCommander demo v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    println!("Endpoint: {}", config.endpoint);
    let client = SimClient::new(config);

    client.on_status_changed(|event| {
        println!("[status] {:?}: {}", event.event_type, event.message);
    });
    client.on_log_record(|record| {
        if record.level <= LogLevel::Warning {
            println!("[server {}] {}", record.level.as_str(), record.message);
        }
    });

    let result = run(&client).await;
    client.dispose().await;
    result
}

async fn run(client: &SimClient) -> Result<()> {
    client.connect_host().await.context("Failed to reach host")?;

    let version = client.ping_server().await;
    if version.is_none() {
        bail!("Server did not respond to ping");
    }
    println!("Server responded to ping, version {}", version);

    let version = client.connect_server().await.context("Failed to open server session")?;
    println!("Connected to server v{} (client v{})", version, client.client_version());

    // Single variable read.
    match client.get_local_variable("SIMCOMMANDER_DEMO", "").await {
        Ok(value) => println!("L:SIMCOMMANDER_DEMO = {}", value),
        Err(ClientError::ServerRejected { reason, .. }) => {
            println!("L:SIMCOMMANDER_DEMO not available: {}", reason)
        }
        Err(e) => println!("Get failed: {}", e),
    }

    // Calculator code with a formatted result.
    let zulu = client
        .execute_calculator_code(
            "(E:ZULU TIME,seconds) 3600 / 24 % @fmt{%02d:%02d}",
            CalcResultType::Formatted,
        )
        .await;
    match zulu {
        Ok(Some(value)) => println!("Zulu time: {}", value),
        Ok(None) => println!("Zulu time: no result"),
        Err(e) => println!("Exec failed: {}", e),
    }

    // Subscription: wait for the first value only.
    let (first_tx, first_rx) = oneshot::channel();
    let first_tx = Arc::new(Mutex::new(Some(first_tx)));
    client.on_data_received(move |record| {
        if record.request_id() != RPM_REQUEST_ID {
            return;
        }
        let sender = first_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = sender {
            let _ = tx.send(record.clone());
        }
    });
    client
        .save_data_request(
            DataRequest::sim_var(RPM_REQUEST_ID, "GENERAL ENG RPM", "rpm", 1, ValueType::Float64)
                .with_period(UpdatePeriod::PerSecond, 0),
        )
        .await
        .context("Failed to subscribe")?;
    match tokio::time::timeout(Duration::from_secs(3), first_rx).await {
        Ok(Ok(record)) => match &record.value {
            Some(value) => println!("Engine RPM: {}", value),
            None => println!("Engine RPM: no value"),
        },
        _ => println!("No RPM update within 3s"),
    }
    client.remove_data_request(RPM_REQUEST_ID).await?;

    // Listing arrives through the list handler.
    let (list_tx, list_rx) = oneshot::channel();
    let list_tx = Arc::new(Mutex::new(Some(list_tx)));
    client.on_list_result(move |result| {
        let sender = list_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = sender {
            let _ = tx.send(result.clone());
        }
    });
    client.list(LookupItemType::LocalVariable).await?;
    match tokio::time::timeout(Duration::from_secs(5), list_rx).await {
        Ok(Ok(result)) => {
            if result.outcome != ListOutcome::Complete {
                println!("Listing ended early: {:?}", result.outcome);
            }
            println!("{} local variables", result.items.len());
            for (id, name) in result.items.iter().take(10) {
                println!("  {:>5}  {}", id, name);
            }
        }
        _ => println!("No list result"),
    }

    match client
        .lookup(LookupItemType::KeyEventId, "TOGGLE_BEACON_LIGHTS")
        .await?
    {
        Some(id) => println!("TOGGLE_BEACON_LIGHTS is key event {}", id),
        None => println!("TOGGLE_BEACON_LIGHTS not found"),
    }

    let response = client
        .send_command_with_response(Command::new(CommandId::Ping))
        .await?;
    println!("Raw ping response: {}", response);

    client.disconnect_server().await?;
    client.disconnect_host().await?;
    Ok(())
}
