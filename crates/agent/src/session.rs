//! One remote-peer lifecycle: offer in, answer out, ICE, DTLS-SRTP, then
//! the RTP send loop fed by a `Flow` receiver on the video source.

use std::sync::Arc;
use std::time::Duration;

use aperture_protocol::{ApertureConfig, SignalMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dtls::{DtlsError, DtlsHandshake, DtlsRole, Identity};
use crate::flow::FlowError;
use crate::h264;
use crate::ice::{Agent, AgentConfig, IceCredentials, IceError, IceRole};
use crate::rtp::{self, H264Packetizer, H264PacketizerConfig, OpusPacketizer};
use crate::sdp::{self, AnswerParams, MediaKind, SdpError, Setup};
use crate::source::{AudioSource, VideoSource};
use crate::srtp::{SrtpContext, SrtpError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("offer could not be parsed: {0}")]
    Parse(#[from] SdpError),
    #[error(transparent)]
    Ice(#[from] IceError),
    #[error("transport closed: {0}")]
    Transport(#[source] std::io::Error),
    #[error("source failed: {0}")]
    Source(FlowError),
    #[error(transparent)]
    Dtls(#[from] DtlsError),
    #[error(transparent)]
    Srtp(#[from] SrtpError),
    #[error("remote violated the protocol: {0}")]
    Protocol(&'static str),
    #[error("session interrupted")]
    Interrupted,
}

impl SessionError {
    /// Category code attached to the "session ended" log line.
    pub fn category(&self) -> &'static str {
        match self {
            SessionError::Parse(_) => "parse-error",
            SessionError::Ice(IceError::NoCandidates) => "ice-gather",
            SessionError::Ice(IceError::ConnectivityTimeout) => "ice-timeout",
            SessionError::Ice(IceError::Cancelled) => "interrupted",
            SessionError::Ice(IceError::Transport(_)) => "transport-closed",
            SessionError::Ice(IceError::ProtocolViolation(_)) => "protocol-violation",
            SessionError::Ice(IceError::Candidate(_)) => "parse-error",
            SessionError::Transport(_) => "transport-closed",
            SessionError::Source(FlowError::Interrupted) => "interrupted",
            SessionError::Source(_) => "source-error",
            SessionError::Dtls(_) => "dtls-error",
            SessionError::Srtp(_) => "protocol-violation",
            SessionError::Protocol(_) => "protocol-violation",
            SessionError::Interrupted => "interrupted",
        }
    }
}

/// Everything a session borrows from the process.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ApertureConfig>,
    pub identity: Arc<Identity>,
    pub dtls: Arc<dyn DtlsHandshake>,
    pub video: Arc<dyn VideoSource>,
    pub audio: Option<Arc<dyn AudioSource>>,
}

/// Handle held by the signaling loop for the one live session.
pub struct SessionHandle {
    pub id: Uuid,
    candidates_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Forward a trickled remote candidate line ("" = end-of-candidates).
    pub fn add_remote_candidate(&self, line: String) {
        if self.candidates_tx.try_send(line).is_err() {
            debug!(session = %self.id, "Candidate dropped, session intake closed");
        }
    }

    pub async fn join(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Launch a session for a received offer. The returned handle feeds remote
/// candidates in and tears the session down.
pub fn spawn_session(
    ctx: SessionContext,
    offer: String,
    signal_tx: mpsc::Sender<SignalMessage>,
) -> SessionHandle {
    let id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    let (candidates_tx, candidates_rx) = mpsc::channel(32);
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            info!(session = %id, "Session starting");
            match drive(&ctx, &offer, signal_tx, candidates_rx, &cancel).await {
                Ok(()) => info!(session = %id, category = "closed", "Session ended"),
                Err(e) => warn!(session = %id, category = e.category(), "Session ended: {e:#}"),
            }
            // Stop the aux tasks (keepalive, drain, intake) with the session
            cancel.cancel();
        }
    });
    SessionHandle {
        id,
        candidates_tx,
        cancel,
        task,
    }
}

async fn drive(
    ctx: &SessionContext,
    offer_text: &str,
    signal_tx: mpsc::Sender<SignalMessage>,
    mut candidates_rx: mpsc::Receiver<String>,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    // 1-2. Parse the offer: credentials, role, payload formats.
    let offer = sdp::parse_session(offer_text)?;
    let video_section = offer
        .first_media(MediaKind::Video)
        .ok_or(SdpError::NoUsableMedia("video"))?;
    let (remote_ufrag, remote_pwd) = offer
        .ice_credentials(video_section)
        .ok_or(SessionError::Protocol("offer carries no ICE credentials"))?;
    if offer.fingerprint_for(video_section).is_none() {
        return Err(SessionError::Protocol("offer carries no DTLS fingerprint"));
    }
    let video_pt = video_section
        .h264_format()
        .ok_or(SdpError::NoUsableMedia("H264 video"))?;
    let mid = video_section.mid.clone();

    // The answerer side of `a=setup` decides both roles: against the usual
    // actpass offer we are the DTLS client and the controlled ICE agent.
    let remote_setup = offer.setup_for(video_section).unwrap_or(Setup::Actpass);
    let (ice_role, dtls_role) = match remote_setup {
        Setup::Active => (IceRole::Controlling, DtlsRole::Server),
        Setup::Passive | Setup::Actpass => (IceRole::Controlled, DtlsRole::Client),
    };

    // 3-4. Compose and send the answer.
    let local_creds = IceCredentials::random();
    let video_ssrc = rtp::random_ssrc();
    let audio_enabled = ctx.config.audio.enabled
        && ctx.audio.is_some()
        && offer.first_media(MediaKind::Audio).is_some();
    let audio_ssrc = audio_enabled.then(rtp::random_ssrc);
    let answer = sdp::compose_answer(
        &offer,
        &AnswerParams {
            ufrag: &local_creds.ufrag,
            pwd: &local_creds.pwd,
            fingerprint: &ctx.identity.fingerprint(),
            setup: match dtls_role {
                DtlsRole::Client => Setup::Active,
                DtlsRole::Server => Setup::Passive,
            },
            cname: "aperture",
            msid: "aperture-cam",
            video_ssrc,
            audio_ssrc,
            sprop_parameter_sets: None,
        },
    )?;
    signal_tx
        .send(SignalMessage::answer(answer.to_string()))
        .await
        .map_err(|_| SessionError::Interrupted)?;
    debug!(video_pt, ?ice_role, "Answer sent");

    // 5. Run the ICE agent: full local gather (streamed out as it lands),
    // remote trickle in, then connectivity checks.
    let agent = Agent::new(
        local_creds,
        IceCredentials {
            ufrag: remote_ufrag,
            pwd: remote_pwd,
        },
        ice_role,
        AgentConfig {
            stun_servers: ctx.config.ice.stun_servers.clone(),
            keepalive: Duration::from_millis(ctx.config.ice.keepalive_ms),
        },
        cancel.child_token(),
    )
    .await
    .map_err(SessionError::Ice)?;

    // Candidates already present in the offer join before any trickle
    for candidate in &video_section.candidates {
        if let Err(e) = agent.add_remote_candidate(&candidate.to_string()) {
            warn!("Offer candidate rejected: {e}");
        }
    }
    tokio::spawn({
        let agent = Arc::clone(&agent);
        let cancel = cancel.child_token();
        async move {
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = candidates_rx.recv() => line,
                };
                let Some(line) = line else { break };
                // A malformed candidate only loses that candidate
                if let Err(e) = agent.add_remote_candidate(&line) {
                    warn!("Remote candidate rejected: {e}");
                }
            }
        }
    });

    let (gathered_tx, mut gathered_rx) = mpsc::unbounded_channel();
    let forward = tokio::spawn({
        let signal_tx = signal_tx.clone();
        let mid = mid.clone();
        async move {
            while let Some(line) = gathered_rx.recv().await {
                let msg = SignalMessage::ice_candidate(line, mid.clone());
                if signal_tx.send(msg).await.is_err() {
                    return;
                }
            }
            let _ = signal_tx.send(SignalMessage::end_of_candidates(mid)).await;
        }
    });
    let gathered = agent
        .gather_local_candidates(|candidate| {
            let _ = gathered_tx.send(candidate.to_string());
        })
        .await;
    drop(gathered_tx);
    let _ = forward.await;
    gathered?;

    let conn = agent
        .establish(Duration::from_millis(ctx.config.ice.timeout_ms))
        .await?;

    // 6. DTLS-SRTP: the collaborator hands back the exporter material.
    let keys = ctx.dtls.handshake(&conn, dtls_role).await?;
    info!("DTLS handshake complete, SRTP keys derived");

    // Keepalives and inbound-check answering outlive selection.
    tokio::spawn({
        let conn = conn.clone();
        let interval = Duration::from_millis(ctx.config.ice.keepalive_ms);
        async move { conn.run_keepalive(interval).await }
    });
    tokio::spawn({
        let conn = conn.clone();
        async move {
            let mut buf = vec![0u8; 2048];
            // A sendonly endpoint discards inbound media; recv only keeps
            // answering the peer's STUN checks.
            while conn.recv(&mut buf).await.is_ok() {}
        }
    });

    if let Some(audio) = audio_ssrc.and_then(|ssrc| ctx.audio.clone().map(|a| (a, ssrc))) {
        let (source, ssrc) = audio;
        let audio_pt = offer
            .first_media(MediaKind::Audio)
            .and_then(|m| m.find_format("opus", rtp::OPUS_CLOCK_RATE))
            .unwrap_or(111);
        tokio::spawn(run_audio_send_loop(
            source,
            conn.clone(),
            SrtpContext::new_outbound(&keys, dtls_role),
            OpusPacketizer::new(audio_pt, ssrc),
            cancel.child_token(),
        ));
    }

    // 7. Subscribe to the source and pump RTP until something ends us.
    let receiver = ctx.video.add_receiver(8);
    let packetizer = H264Packetizer::new(H264PacketizerConfig {
        mtu: ctx.config.rtp.mtu,
        payload_type: video_pt,
        ssrc: video_ssrc,
        framerate: ctx.config.video.framerate,
        repeat_parameter_sets: ctx.config.video.repeat_sequence_header,
    });
    let srtp = SrtpContext::new_outbound(&keys, dtls_role);
    run_video_send_loop(receiver, &conn, srtp, packetizer, cancel, ctx).await
}

/// Read access units off the flow, packetize, protect, send.
async fn run_video_send_loop(
    mut receiver: crate::flow::FlowReceiver,
    conn: &crate::ice::Conn,
    mut srtp: SrtpContext,
    mut packetizer: H264Packetizer,
    cancel: &CancellationToken,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    let mut units: u64 = 0;
    let mut packets: u64 = 0;
    let mut keyframes: u64 = 0;
    let result = 'session: loop {
        let buf = tokio::select! {
            _ = cancel.cancelled() => break Err(SessionError::Interrupted),
            buf = receiver.recv() => buf,
        };
        let Some(buf) = buf else {
            break Err(match receiver.error() {
                Some(FlowError::Interrupted) | None => SessionError::Interrupted,
                Some(e) => SessionError::Source(e),
            });
        };
        if h264::contains_idr(&buf) {
            keyframes += 1;
        }
        let nals = h264::extract_nals(&buf);
        drop(buf);
        if nals.is_empty() {
            continue;
        }
        for packet in packetizer.packetize(&nals) {
            let protected = match srtp.protect(&packet) {
                Ok(protected) => protected,
                Err(e) => break 'session Err(SessionError::Srtp(e)),
            };
            if let Err(e) = conn.send(&protected).await {
                break 'session Err(SessionError::Transport(e));
            }
            packets += 1;
        }
        units += 1;
        if units == 1 {
            info!("First access unit sent");
        }
        if units.is_multiple_of(300) {
            debug!(units, packets, keyframes, "RTP send stats");
        }
    };
    ctx.video.remove_receiver(receiver);
    info!(units, packets, keyframes, "Video send loop finished");
    result
}

async fn run_audio_send_loop(
    source: Arc<dyn AudioSource>,
    conn: crate::ice::Conn,
    mut srtp: SrtpContext,
    mut packetizer: OpusPacketizer,
    cancel: CancellationToken,
) {
    let mut receiver = source.add_receiver(8);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = receiver.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let packet = packetizer.packetize(&frame);
        match srtp.protect(&packet) {
            Ok(protected) => {
                if conn.send(&protected).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Audio SRTP protect failed: {e}");
                break;
            }
        }
    }
    source.remove_receiver(receiver);
}
