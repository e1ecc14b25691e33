mod buffer;
mod candidate;
mod cli;
mod dtls;
mod flow;
mod h264;
mod ice;
mod rtp;
mod sdp;
mod session;
mod signaling;
mod singleton;
mod source;
mod srtp;
mod stun;

use std::sync::Arc;

use anyhow::Context;
use aperture_protocol::{SignalKind, SignalMessage};
use dtls::{DtlsHandshake, Identity, StaticKeyHandshake};
use session::{SessionContext, SessionHandle};
use signaling::SignalingCtx;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (needed for TLS WebSocket to the relay)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;
    let config = args.into_config()?;
    if let Err(issues) = config.validate() {
        for issue in &issues {
            warn!("{issue}");
        }
        if issues.iter().any(|i| i.starts_with("ERROR:")) {
            anyhow::bail!("Configuration is not usable");
        }
    }
    let config = Arc::new(config);
    info!(
        source = %config.video.source,
        signal_url = %config.signaling.url,
        "Starting aperture-agent"
    );

    let identity = Arc::new(Identity::generate().context("Failed to generate DTLS identity")?);
    info!(fingerprint = %identity.fingerprint(), "DTLS identity ready");

    let video = source::create_video_source(&config.video.source, &config.video)
        .context("Failed to create video source")?;
    info!(
        codec = video.codec(),
        width = video.width(),
        height = video.height(),
        "Video source ready"
    );

    // The DTLS stack is a deployment collaborator behind the handshake
    // trait; without one linked, SRTP keys come preshared from the
    // environment or are process-random.
    let dtls: Arc<dyn DtlsHandshake> = match StaticKeyHandshake::from_env() {
        Some(preshared) => Arc::new(preshared),
        None => {
            warn!(
                "No DTLS stack linked and APERTURE_SRTP_KEYS unset; \
                 using process-random SRTP keys (remote peers cannot decrypt)"
            );
            Arc::new(StaticKeyHandshake::process_random())
        }
    };

    let ctx = SessionContext {
        config: Arc::clone(&config),
        identity,
        dtls,
        video,
        audio: None,
    };

    // Signaling channel plumbing: one outbox for everything we send, one
    // event stream for everything the relay delivers.
    let (signal_tx, mut signal_outbox_rx) = mpsc::channel::<SignalMessage>(64);
    let (events_tx, mut events_rx) = mpsc::channel::<SignalMessage>(64);

    let signaling_task = {
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            let ctx = SignalingCtx {
                server_url: &config.signaling.url,
                token: config.signaling.token.as_deref(),
                tls_cert_path: config.signaling.tls_cert.as_deref(),
            };
            signaling::run_signaling(&ctx, &mut signal_outbox_rx, &events_tx).await;
        })
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut current: Option<SessionHandle> = None;

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else {
                    info!("Signaling event stream closed");
                    break;
                };
                match event.kind {
                    SignalKind::Offer => {
                        // One live session at a time: a new offer replaces
                        // the previous browser connection.
                        if let Some(old) = current.take() {
                            info!(session = %old.id, "Replacing session on new offer");
                            old.join().await;
                        }
                        let handle = session::spawn_session(
                            ctx.clone(),
                            event.text,
                            signal_tx.clone(),
                        );
                        info!(session = %handle.id, "Session spawned for offer");
                        current = Some(handle);
                    }
                    SignalKind::IceCandidate => {
                        match &current {
                            Some(session) => session.add_remote_candidate(event.text),
                            None => warn!("Dropping candidate with no live session"),
                        }
                    }
                    SignalKind::Answer => {
                        warn!("Unexpected answer from relay, ignoring");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    if let Some(session) = current.take() {
        session.join().await;
    }
    signaling_task.abort();
    info!("Agent shutdown complete");
    Ok(())
}
