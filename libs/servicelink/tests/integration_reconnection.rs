//! Integration tests for reconnection, backoff exhaustion and migration.

mod common;

use bytes::Bytes;
use common::{wait_until, MockRelayServer, RecordingHub, RefusingServer};
use servicelink::protocol::ServiceMessage;
use servicelink::traits::backoff::FixedBackOff;
use servicelink::{
    CallScope, Endpoint, EndpointType, GatewayConfig, RelayGateway, ServiceLinkError,
    StaticCredential,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn endpoint(url: String) -> Arc<Endpoint> {
    Arc::new(Endpoint::new(
        "mock",
        url,
        EndpointType::Primary,
        Arc::new(StaticCredential::new("test-key")),
    ))
}

#[tokio::test]
async fn bounded_backoff_exhausts_with_an_aggregate_error() {
    let server = RefusingServer::start().await;

    let mut config = GatewayConfig::new("srv-test");
    config.container.connection_count = 2;
    config.container.backoff = Arc::new(FixedBackOff::new(Duration::from_millis(100), Some(2)));

    let gateway = RelayGateway::builder(config)
        .with_endpoint(endpoint(server.url()))
        .build()
        .unwrap();

    let started = Instant::now();
    let err = gateway.start().await.unwrap_err();
    let elapsed = started.elapsed();

    // Per slot: one attempt plus two retries, 100ms apart
    verbose_println!("start failed after {:?}: {}", elapsed, err);
    match err {
        ServiceLinkError::ReconnectExhausted { attempts, errors } => {
            assert_eq!(attempts, 3);
            assert_eq!(errors.len(), 3);
        }
        other => panic!("expected exhaustion, got {}", other),
    }
    assert!(
        elapsed >= Duration::from_millis(400),
        "two slots x two 100ms delays each, got {:?}",
        elapsed
    );
    assert!(wait_until(|| server.attempt_count() == 6).await);
}

#[tokio::test]
async fn dropped_connection_is_rebuilt_and_clients_migrate() {
    let server = MockRelayServer::start().await;

    let mut config = GatewayConfig::new("srv-test");
    config.container.connection_count = 1;
    config.container.backoff = Arc::new(FixedBackOff::new(Duration::from_millis(50), Some(10)));

    let hub = Arc::new(RecordingHub::default());
    let gateway = RelayGateway::builder(config)
        .with_endpoint(endpoint(server.url()))
        .with_hub(hub.clone())
        .build()
        .unwrap();
    gateway.start().await.unwrap();
    assert!(wait_until(|| server.handshake_count() == 1).await);

    server.send(ServiceMessage::OpenConnection {
        connection_id: "c1".to_string(),
        user_id: None,
        claims: Default::default(),
    });
    assert!(wait_until(|| gateway.registry().len() == 1).await);
    let before = gateway.registry().serving_tag("c1").unwrap();

    server.drop_connections();

    // The supervisor rebuilds the slot and hands the client over
    assert!(wait_until(|| server.handshake_count() == 2).await);
    assert!(wait_until(|| hub.has_event("migrated:1:0->0")).await);

    let after = gateway.registry().serving_tag("c1").unwrap();
    assert_eq!(after.slot, before.slot);
    assert!(after.generation > before.generation, "epoch must advance");

    // The rebuilt connection carries traffic
    gateway
        .broadcast(Bytes::from_static(b"{}"), vec![], &CallScope::new())
        .await
        .unwrap();
    let envelope = server.recv().await.unwrap();
    assert!(matches!(envelope.message, ServiceMessage::BroadcastData { .. }));

    gateway.shutdown().await;
}
