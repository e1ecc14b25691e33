use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aperture_protocol::SignalMessage;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared context for the signaling WebSocket connection.
pub(crate) struct SignalingCtx<'a> {
    pub server_url: &'a str,
    pub token: Option<&'a str>,
    pub tls_cert_path: Option<&'a str>,
}

/// Run the signaling WebSocket connection with reconnect.
///
/// `outbox_rx` receives outgoing messages (answer, trickled candidates)
/// from the session; incoming JSON messages are forwarded to `events_tx`.
pub(crate) async fn run_signaling(
    ctx: &SignalingCtx<'_>,
    outbox_rx: &mut mpsc::Receiver<SignalMessage>,
    events_tx: &mpsc::Sender<SignalMessage>,
) {
    if ctx.server_url.is_empty() {
        info!("No signaling URL provided, sleeping forever");
        std::future::pending::<()>().await;
        return;
    }

    // Connect with exponential backoff retry
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(60);
    loop {
        info!(url = ctx.server_url, "Connecting to signaling relay");

        match connect_and_handle(ctx, outbox_rx, events_tx).await {
            Ok(()) => {
                info!("Signaling connection closed cleanly");
                break;
            }
            Err(e) => {
                warn!("Signaling connection error: {e:#}");
                info!("Reconnecting in {} seconds...", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

/// Build a TLS connector, pinning the relay certificate if a cert path is
/// provided.
fn build_tls_connector(tls_cert_path: Option<&str>) -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();

    for cert in rustls_native_certs::load_native_certs().expect("Could not load platform certs") {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Failed to add pinned cert to root store: {e}");
                    } else {
                        info!("Pinned relay certificate from {cert_path}");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read TLS cert from {cert_path}: {e}, falling back to system roots");
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

async fn connect_and_handle(
    ctx: &SignalingCtx<'_>,
    outbox_rx: &mut mpsc::Receiver<SignalMessage>,
    events_tx: &mpsc::Sender<SignalMessage>,
) -> anyhow::Result<()> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let url = match ctx.token {
        Some(token) => format!("{}?token={}", ctx.server_url, urlencoding::encode(token)),
        None => ctx.server_url.to_string(),
    };

    let connector = build_tls_connector(ctx.tls_cert_path);
    let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
        &url,
        None,
        false,
        Some(connector),
    )
    .await
    .context("WebSocket connection failed")?;

    info!("Connected to signaling relay");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            // Incoming messages from the relay
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalMessage>(&text) {
                            Ok(signal) => {
                                if events_tx.send(signal).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                warn!("Invalid message from relay: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {
                        debug!("Ignoring non-text frame from relay");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(e.into());
                    }
                }
            }
            // Outgoing messages from the session
            Some(signal) = outbox_rx.recv() => {
                let text = serde_json::to_string(&signal).context("Serialize signaling message")?;
                ws_tx.send(Message::text(text)).await?;
            }
        }
    }
}
