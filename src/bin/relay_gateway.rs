//! Demo gateway binary
//!
//! Connects to the relay endpoints named in the environment, logs client
//! traffic, and echoes every client payload back to its sender.

use async_trait::async_trait;
use bytes::Bytes;
use relay_gateway::bin_common::{init_tracing, load_env_config, RunConfig};
use servicelink::{
    CallScope, ClientConnectionContext, GatewayConfig, HubDispatcher, RelayGateway,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Hub that logs lifecycle events and queues every payload for echoing
struct EchoHub {
    outbox: mpsc::Sender<(String, Bytes)>,
}

#[async_trait]
impl HubDispatcher for EchoHub {
    async fn on_client_connected(
        &self,
        ctx: Arc<ClientConnectionContext>,
    ) -> servicelink::Result<()> {
        info!(
            connection_id = %ctx.connection_id(),
            user_id = ?ctx.user_id(),
            "client connected"
        );
        Ok(())
    }

    async fn on_client_disconnected(
        &self,
        connection_id: &str,
        error: Option<String>,
    ) -> servicelink::Result<()> {
        info!(connection_id, ?error, "client disconnected");
        Ok(())
    }

    async fn on_client_message(
        &self,
        connection_id: &str,
        payload: Bytes,
    ) -> servicelink::Result<()> {
        info!(connection_id, bytes = payload.len(), "client message");
        let _ = self.outbox.send((connection_id.to_string(), payload)).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let run_config = RunConfig::new("relay-gateway");
    run_config.print_banner();

    let env = load_env_config()?;
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<(String, Bytes)>(256);

    let mut builder = RelayGateway::builder(GatewayConfig::new(env.server_id.clone()))
        .with_hub(Arc::new(EchoHub { outbox: outbox_tx }));
    for connection_string in &env.connection_strings {
        builder = builder.with_connection_string(connection_string)?;
    }
    let gateway = Arc::new(builder.build()?);

    gateway.start().await?;
    info!(server_id = %env.server_id, "gateway started");

    let echo_gateway = gateway.clone();
    let echo_task = tokio::spawn(async move {
        while let Some((connection_id, payload)) = outbox_rx.recv().await {
            if let Err(e) = echo_gateway
                .send_to_connection(&connection_id, payload, &CallScope::new())
                .await
            {
                warn!(connection_id = %connection_id, "echo failed: {}", e);
            }
        }
    });

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(run_config.heartbeat_interval_secs));
    heartbeat.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = heartbeat.tick() => {
                let snapshot = gateway.snapshot();
                info!(
                    clients = snapshot.clients,
                    containers = ?snapshot.containers,
                    "heartbeat"
                );
            }
        }
    }

    info!("shutting down");
    gateway.shutdown().await;
    echo_task.abort();
    run_config.print_shutdown();
    Ok(())
}
