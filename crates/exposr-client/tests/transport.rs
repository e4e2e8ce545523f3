//! `TunnelTransport` lifecycle against a real socket

mod common;

use common::descriptor;
use exposr_client::{
    CloseInfo, ErrorCode, TargetConnector, TargetOptions, TransformRules, TransportEvent,
    TransportState, TunnelError, TunnelTransport,
};
use exposr_proto::{CLOSE_ABNORMAL, CLOSE_NORMAL};
use exposr_transport_websocket::{WebSocketConfig, WebSocketConnector};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

type Events = mpsc::UnboundedReceiver<(u64, TransportEvent)>;

async fn broker_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!(
        "ws://{}/v1/tunnel/quiet-river/ws-endpoint",
        listener.local_addr().unwrap()
    );
    (listener, endpoint)
}

fn transport(handshake_timeout: Duration) -> (TunnelTransport<WebSocketConnector>, Events) {
    let connector =
        Arc::new(WebSocketConnector::new(Arc::new(WebSocketConfig::default())).unwrap());
    let target = TargetConnector::new(
        &Url::parse("http://127.0.0.1:1").unwrap(),
        TargetOptions::default(),
    )
    .unwrap();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = TunnelTransport::new(
        7,
        connector,
        Arc::new(target),
        Arc::new(TransformRules::default()),
        handshake_timeout,
        events_tx,
    );
    (transport, events_rx)
}

/// Accept one TCP connection, never answer the upgrade, and report when the
/// client goes away.
fn silent_broker(listener: TcpListener) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
}

fn close_events(events: &mut Events) -> Vec<CloseInfo> {
    let mut closes = Vec::new();
    while let Ok((id, event)) = events.try_recv() {
        assert_eq!(id, 7);
        if let TransportEvent::Close(info) = event {
            closes.push(info);
        }
    }
    closes
}

#[tokio::test]
async fn test_unanswered_handshake_times_out() {
    let (listener, endpoint) = broker_listener().await;
    let broker = silent_broker(listener);
    let (transport, mut events) = transport(Duration::from_millis(300));

    let result = timeout(
        Duration::from_secs(5),
        transport.connect(&descriptor(&endpoint, None), &CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(matches!(
        result,
        Err(TunnelError::Server(ErrorCode::ServerTimeout))
    ));
    match transport.state() {
        TransportState::Closed(info) => assert_eq!(info.code, CLOSE_ABNORMAL),
        other => panic!("expected closed, got {:?}", other),
    }
    assert!(!transport.is_connected());
    assert!(close_events(&mut events).is_empty());

    // The half-open socket is dropped with the attempt
    timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_during_handshake() {
    let (listener, endpoint) = broker_listener().await;
    let broker = silent_broker(listener);
    let (transport, _events) = transport(Duration::from_secs(30));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
    }

    let result = timeout(
        Duration::from_secs(5),
        transport.connect(&descriptor(&endpoint, None), &cancel),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(TunnelError::Cancelled)));
    assert_eq!(
        transport.state(),
        TransportState::Closed(CloseInfo::new(CLOSE_NORMAL, "Cancelled"))
    );

    // The broker sees the socket end
    timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();

    // A transport is single-use
    let again = transport
        .connect(&descriptor(&endpoint, None), &CancellationToken::new())
        .await;
    assert!(matches!(again, Err(TunnelError::InvalidState(_))));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (listener, endpoint) = broker_listener().await;
    let broker = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let mut close_frames = 0;
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Close(frame) = message {
                close_frames += 1;
                let reason = frame.map(|f| f.reason.to_string());
                assert_eq!(reason.as_deref(), Some("Connection closed"));
            }
        }
        close_frames
    });

    let (transport, mut events) = transport(Duration::from_secs(5));
    transport
        .connect(&descriptor(&endpoint, None), &CancellationToken::new())
        .await
        .unwrap();
    assert!(transport.is_connected());
    assert!(matches!(events.recv().await, Some((7, TransportEvent::Open))));

    tokio::join!(transport.close(), transport.close());
    transport.close().await;
    transport.close_with(4000, "Later").await;

    let expected = CloseInfo::new(CLOSE_NORMAL, "");
    assert_eq!(expected.to_string(), "Connection closed (1000)");
    assert_eq!(transport.state(), TransportState::Closed(expected.clone()));
    assert_eq!(transport.closed().await, expected);
    assert_eq!(close_events(&mut events), vec![expected]);

    let close_frames = timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
    assert_eq!(close_frames, 1);

    let again = transport
        .connect(&descriptor(&endpoint, None), &CancellationToken::new())
        .await;
    assert!(matches!(again, Err(TunnelError::InvalidState(_))));
}

#[tokio::test]
async fn test_broker_close_without_reason() {
    let (listener, endpoint) = broker_listener().await;
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })))
        .await
        .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let (transport, mut events) = transport(Duration::from_secs(5));
    transport
        .connect(&descriptor(&endpoint, None), &CancellationToken::new())
        .await
        .unwrap();

    let info = timeout(Duration::from_secs(5), transport.closed())
        .await
        .unwrap();
    assert_eq!(info.code, CLOSE_NORMAL);
    assert_eq!(info.reason, "Connection closed");

    let mut close = None;
    while let Some((_, event)) = timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
        if let TransportEvent::Close(info) = event {
            close = Some(info);
            break;
        }
    }
    assert_eq!(
        close.map(|info| info.to_string()).as_deref(),
        Some("Connection closed (1000)")
    );
}
