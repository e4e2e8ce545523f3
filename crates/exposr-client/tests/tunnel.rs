//! Orchestrator behaviour against a mock transport

mod common;

use common::{descriptor, MockConnector, MockService};
use exposr_client::{BackoffConfig, ErrorCode, Tunnel, TunnelConfig, TunnelError};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const ENDPOINT: &str = "ws://broker.invalid/v1/tunnel/quiet-river/ws-endpoint";

fn config(max_transports: usize) -> TunnelConfig {
    TunnelConfig::builder()
        .target_url("http://127.0.0.1:3000")
        .max_transports(max_transports)
        .build()
        .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_pool_never_exceeds_max_transports() {
    let connector = MockConnector::new();
    let service = MockService::new(descriptor(ENDPOINT, None));
    let tunnel = Tunnel::new(config(3), service.clone(), connector.clone()).unwrap();
    assert_eq!(tunnel.status().max_connections, 0);

    let cancel = CancellationToken::new();
    let run = {
        let tunnel = tunnel.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { tunnel.connect(cancel).await })
    };

    wait_until(|| connector.live() == 3).await;
    let status = tunnel.status();
    assert!(status.connected);
    assert_eq!(status.current_connections, 3);
    assert_eq!(status.max_connections, 3);
    assert_eq!(status.transports.len(), 3);

    // Every slot reconnects after a normal close, one transport each
    for round in 1..=3 {
        connector.close_remote(1000, "Broker restart");
        wait_until(|| connector.attempts().len() == 3 + round * 3 && connector.live() == 3)
            .await;
    }
    assert_eq!(connector.max_live(), 3);
    assert!(service.reads.load(Ordering::SeqCst) >= 12);

    cancel.cancel();
    timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Cancelling leaves the transports for disconnect()
    assert_eq!(connector.live(), 3);
    tunnel.disconnect().await;
    assert_eq!(connector.live(), 0);
    let status = tunnel.status();
    assert!(status.transports.is_empty());
    assert_eq!(status.current_connections, 0);
    assert_eq!(status.max_connections, 0);
}

#[tokio::test]
async fn test_cancel_publishes_each_slot() {
    let connector = MockConnector::new();
    let service = MockService::new(descriptor(ENDPOINT, None));
    let tunnel = Tunnel::new(config(2), service, connector.clone()).unwrap();

    let cancel = CancellationToken::new();
    let run = {
        let tunnel = tunnel.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { tunnel.connect(cancel).await })
    };
    wait_until(|| tunnel.status().current_connections == 2).await;
    let ids: Vec<u64> = tunnel.status().transports.iter().map(|t| t.id).collect();

    // Only updates published by the exiting slot loops
    let mut updates = tunnel.subscribe();
    cancel.cancel();
    timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let mut sources = Vec::new();
    while let Ok(update) = updates.try_recv() {
        assert_eq!(update.status.max_connections, 2);
        sources.extend(update.source);
    }
    sources.sort_unstable();
    assert_eq!(sources, ids);

    tunnel.disconnect().await;
}

#[tokio::test]
async fn test_cancel_during_backoff_joins_every_slot() {
    let connector = MockConnector::failing(usize::MAX);
    let service = MockService::new(descriptor(ENDPOINT, None));
    let tunnel = Tunnel::new(config(4), service, connector.clone()).unwrap();
    let mut updates = tunnel.subscribe();

    let cancel = CancellationToken::new();
    let run = {
        let tunnel = tunnel.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { tunnel.connect(cancel).await })
    };

    wait_until(|| connector.attempts().len() >= 4).await;
    cancel.cancel();

    // connect() only returns once all slot loops are done
    let result = timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
    assert!(result.is_ok());

    let attempts = connector.attempts().len();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(connector.attempts().len(), attempts, "a slot kept retrying");

    tunnel.disconnect().await;
    assert_eq!(connector.live(), 0);

    let mut saw_error = false;
    while let Ok(update) = updates.try_recv() {
        if let Some(transport) = update.source_transport() {
            saw_error |= transport
                .error
                .as_deref()
                .is_some_and(|e| e.contains("Connection refused"));
        }
    }
    assert!(saw_error);
}

#[tokio::test(start_paused = true)]
async fn test_retry_delay_grows() {
    let connector = MockConnector::failing(3);
    let service = MockService::new(descriptor(ENDPOINT, None));
    let tunnel = Tunnel::new(config(1), service, connector.clone()).unwrap();

    let cancel = CancellationToken::new();
    let run = {
        let tunnel = tunnel.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { tunnel.connect(cancel).await })
    };

    wait_until(|| connector.live() == 1).await;

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(1000), "{:?}", gaps);
    assert!(gaps[1] > gaps[0] * 109 / 100, "{:?}", gaps);
    assert!(gaps[2] > gaps[1] * 109 / 100, "{:?}", gaps);
    assert!(gaps[2] < Duration::from_millis(1400), "{:?}", gaps);

    // A success clears the recorded error
    let status = tunnel.status();
    assert_eq!(status.transports[0].error, None);

    cancel.cancel();
    run.await.unwrap().unwrap();
    tunnel.disconnect().await;
}

#[tokio::test]
async fn test_policy_close_stops_reconnecting() {
    let connector = MockConnector::new();
    let service = MockService::new(descriptor(ENDPOINT, None));
    let tunnel = Tunnel::new(config(1), service, connector.clone()).unwrap();

    let run = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.connect(CancellationToken::new()).await })
    };

    wait_until(|| connector.live() == 1).await;
    connector.close_remote(1000, "");
    wait_until(|| connector.attempts().len() == 2 && connector.live() == 1).await;

    connector.close_remote(1008, "Tunnel deleted");
    let result = timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    match result {
        Err(TunnelError::Closed(info)) => assert_eq!(info.code, 1008),
        other => panic!("expected close error, got {:?}", other),
    }

    assert_eq!(connector.attempts().len(), 2);
    let status = tunnel.status();
    assert!(!status.connected);
    assert_eq!(
        status.transports[0].closed.as_deref(),
        Some("Tunnel deleted (1008)")
    );
}

#[tokio::test]
async fn test_missing_endpoint_is_fatal() {
    let mut descriptor = descriptor(ENDPOINT, None);
    descriptor.transport.ws = None;

    let connector = MockConnector::new();
    let tunnel = Tunnel::new(config(2), MockService::new(descriptor), connector.clone()).unwrap();

    let result = timeout(Duration::from_secs(5), tunnel.connect(CancellationToken::new()))
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(TunnelError::Server(ErrorCode::NoTunnelEndpoint))
    ));
    assert!(connector.attempts().is_empty());
}

#[tokio::test]
async fn test_slot_ids_are_not_reused() {
    let connector = MockConnector::new();
    let service = MockService::new(descriptor(ENDPOINT, None));
    let config = TunnelConfig::builder()
        .target_url("http://127.0.0.1:3000")
        .max_transports(2)
        .backoff(BackoffConfig::default())
        .build()
        .unwrap();
    let tunnel = Tunnel::new(config, service, connector.clone()).unwrap();

    let mut ids = Vec::new();
    for _ in 0..2 {
        let cancel = CancellationToken::new();
        let run = {
            let tunnel = tunnel.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tunnel.connect(cancel).await })
        };
        wait_until(|| tunnel.status().current_connections == 2).await;
        ids.extend(tunnel.status().transports.iter().map(|t| t.id));

        cancel.cancel();
        run.await.unwrap().unwrap();
        tunnel.disconnect().await;
    }

    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(connector.max_live(), 2);
    assert_eq!(connector.live(), 0);
}
