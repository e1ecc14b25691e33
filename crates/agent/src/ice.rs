//! ICE agent: candidate gathering, connectivity checks, pair selection,
//! and the selected-pair datagram transport.
//!
//! Single data component over a single UDP socket. The agent runs the
//! Full procedures for whichever role the SDP `a=setup` negotiation put it
//! in; the roles differ only in the advertised attribute and the tie-break
//! comparison. Local gathering completes before candidates go out; remote
//! candidates may trickle in while checks run.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::candidate::{
    Candidate, CandidateParseError, CandidatePair, CandidateType, FoundationRegistry, PairState,
    Protocol, pair_priority,
};
use crate::stun::{self, Attribute, Class, Message};

/// Initial retransmission timeout for connectivity checks (doubles).
const RTO_INITIAL: Duration = Duration::from_millis(500);
/// A check is abandoned after this many transmissions.
const MAX_CHECK_TRANSMITS: u32 = 7;
/// Gather requests give up sooner; an unreachable server only delays start.
const MAX_GATHER_TRANSMITS: u32 = 3;
/// Check-list pacing tick.
const TICK: Duration = Duration::from_millis(50);
/// Route-selection probe target when no STUN server is configured. The
/// connect is local only; no packet is sent.
const FALLBACK_PROBE: &str = "8.8.8.8:53";

const SOFTWARE: &str = concat!("aperture-agent/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum IceError {
    #[error("no candidate pair succeeded")]
    ConnectivityTimeout,
    #[error("gathering produced no usable candidates")]
    NoCandidates,
    #[error("agent cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error(transparent)]
    Candidate(#[from] CandidateParseError),
}

/// Short-term ICE credentials (RFC 8445 §5.3: ufrag >= 4, pwd >= 22
/// printable characters).
#[derive(Debug, Clone)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn random() -> Self {
        Self {
            ufrag: random_string(4),
            pwd: random_string(22),
        }
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controlled,
    Controlling,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// STUN servers as host:port; one srflx candidate is gathered per server.
    pub stun_servers: Vec<String>,
    /// Binding Indication interval on the selected pair.
    pub keepalive: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            stun_servers: Vec::new(),
            keepalive: Duration::from_secs(15),
        }
    }
}

struct CheckState {
    transaction_id: [u8; 12],
    transmits: u32,
    rto: Duration,
    next_send: Instant,
}

struct PairEntry {
    pair: CandidatePair,
    check: Option<CheckState>,
}

struct AgentState {
    local: Vec<Candidate>,
    remote: Vec<Candidate>,
    /// Check list, ordered by pair priority descending.
    pairs: Vec<PairEntry>,
    local_foundations: FoundationRegistry,
    remote_foundations: FoundationRegistry,
    selected: Option<usize>,
    end_of_remote_candidates: bool,
}

/// One ICE agent for one session's data component.
pub struct Agent {
    socket: Arc<UdpSocket>,
    local_creds: IceCredentials,
    remote_creds: IceCredentials,
    role: IceRole,
    tie_breaker: u64,
    config: AgentConfig,
    state: Mutex<AgentState>,
    cancel: CancellationToken,
}

impl Agent {
    pub async fn new(
        local_creds: IceCredentials,
        remote_creds: IceCredentials,
        role: IceRole,
        config: AgentConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Agent>, IceError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        info!(local = %socket.local_addr()?, ?role, "ICE agent socket bound");
        Ok(Arc::new(Agent {
            socket: Arc::new(socket),
            local_creds,
            remote_creds,
            role,
            tie_breaker: rand::random(),
            config,
            state: Mutex::new(AgentState {
                local: Vec::new(),
                remote: Vec::new(),
                pairs: Vec::new(),
                local_foundations: FoundationRegistry::new(),
                remote_foundations: FoundationRegistry::new(),
                selected: None,
                end_of_remote_candidates: false,
            }),
            cancel,
        }))
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Gather host and server-reflexive candidates, emitting each through
    /// `emit` as soon as it is known. Returns the number gathered; zero is
    /// an error. Runs before `establish`, which owns the socket afterwards.
    pub async fn gather_local_candidates<F>(&self, mut emit: F) -> Result<usize, IceError>
    where
        F: FnMut(&Candidate),
    {
        let port = self.local_port();
        let mut count = 0usize;
        let mut base: Option<SocketAddr> = None;

        // Host candidate: the kernel's route selection picks the address.
        let probe = self
            .config
            .stun_servers
            .first()
            .cloned()
            .unwrap_or_else(|| FALLBACK_PROBE.to_string());
        match probe_local_ip(&probe).await {
            Ok(ip) => {
                let addr = SocketAddr::new(ip, port);
                base = Some(addr);
                let candidate = {
                    let mut state = self.lock_state();
                    let foundation =
                        state
                            .local_foundations
                            .foundation(CandidateType::Host, ip, Protocol::Udp, None);
                    let candidate = Candidate::host(foundation, addr, 65535);
                    state.local.push(candidate.clone());
                    candidate
                };
                debug!(candidate = %candidate, "Gathered host candidate");
                emit(&candidate);
                count += 1;
            }
            Err(e) => {
                // Gather failures are not fatal unless nothing at all comes out
                warn!("Host candidate discovery failed: {e}");
            }
        }

        // One server-reflexive candidate per configured STUN server.
        for server in self.config.stun_servers.clone() {
            match self.gather_server_reflexive(&server, base).await {
                Ok(Some(candidate)) => {
                    debug!(candidate = %candidate, server, "Gathered srflx candidate");
                    emit(&candidate);
                    count += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(server, "STUN gather failed: {e}");
                }
            }
        }

        if count == 0 {
            return Err(IceError::NoCandidates);
        }
        Ok(count)
    }

    async fn gather_server_reflexive(
        &self,
        server: &str,
        base: Option<SocketAddr>,
    ) -> Result<Option<Candidate>, IceError> {
        let Some(server_addr) = tokio::net::lookup_host(server)
            .await?
            .find(|a| a.is_ipv4() == base.is_none_or(|b| b.is_ipv4()))
        else {
            warn!(server, "STUN server resolved to no usable address");
            return Ok(None);
        };

        let transaction_id = stun::random_transaction_id();
        let mut request = Message::binding(Class::Request, transaction_id);
        request.add(Attribute::Software(SOFTWARE.to_string()));
        let wire = request.serialize();

        let mut rto = RTO_INITIAL;
        let mut buf = [0u8; 1500];
        for _ in 0..MAX_GATHER_TRANSMITS {
            self.socket.send_to(&wire, server_addr).await?;
            let deadline = Instant::now() + rto;
            loop {
                let recv = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(IceError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => break,
                    r = self.socket.recv_from(&mut buf) => r,
                };
                let (len, from) = recv?;
                if from != server_addr {
                    trace!(%from, "Ignoring datagram during gather");
                    continue;
                }
                let Ok(Some(response)) = stun::parse(&buf[..len]) else {
                    continue;
                };
                if response.transaction_id != transaction_id
                    || response.class != Class::SuccessResponse
                {
                    continue;
                }
                let Some(mapped) = response.xor_mapped_address() else {
                    return Err(IceError::ProtocolViolation(
                        "binding response without XOR-MAPPED-ADDRESS",
                    ));
                };
                let candidate = {
                    let mut state = self.lock_state();
                    let foundation = state.local_foundations.foundation(
                        CandidateType::ServerReflexive,
                        base.map(|b| b.ip()).unwrap_or_else(|| mapped.ip()),
                        Protocol::Udp,
                        Some(server),
                    );
                    let base = base.unwrap_or(mapped);
                    let candidate = Candidate::server_reflexive(foundation, mapped, base);
                    if state.local.contains(&candidate) {
                        None
                    } else {
                        state.local.push(candidate.clone());
                        Some(candidate)
                    }
                };
                return Ok(candidate);
            }
            rto *= 2;
        }
        warn!(server, "STUN server did not answer");
        Ok(None)
    }

    /// Feed one trickled remote candidate line; the empty line is the
    /// end-of-candidates sentinel. Safe to call while `establish` runs.
    pub fn add_remote_candidate(&self, line: &str) -> Result<(), IceError> {
        if line.is_empty() {
            let mut state = self.lock_state();
            state.end_of_remote_candidates = true;
            debug!("Remote signalled end-of-candidates");
            return Ok(());
        }
        let candidate: Candidate = line.parse()?;
        let mut state = self.lock_state();
        if state.remote.contains(&candidate) {
            trace!(candidate = %candidate, "Duplicate remote candidate ignored");
            return Ok(());
        }
        info!(candidate = %candidate, "Remote candidate added");
        state.remote.push(candidate);
        let remote_idx = state.remote.len() - 1;
        self.form_pairs_locked(&mut state, remote_idx);
        Ok(())
    }

    /// Pair a newly added remote candidate against the local list.
    /// Local srflx candidates share the host base and socket, so pairs are
    /// formed from host candidates only (base replacement + dedup).
    fn form_pairs_locked(&self, state: &mut AgentState, remote_idx: usize) {
        if state.remote[remote_idx].protocol != Protocol::Udp {
            debug!("TCP candidate acknowledged but not checked");
            return;
        }
        let remote_priority = state.remote[remote_idx].priority;
        let mut added = 0;
        for local_idx in 0..state.local.len() {
            let local = &state.local[local_idx];
            if local.typ != CandidateType::Host || local.protocol != Protocol::Udp {
                continue;
            }
            if state
                .pairs
                .iter()
                .any(|e| e.pair.local == local_idx && e.pair.remote == remote_idx)
            {
                continue;
            }
            let priority = match self.role {
                IceRole::Controlled => pair_priority(remote_priority, local.priority),
                IceRole::Controlling => pair_priority(local.priority, remote_priority),
            };
            let pair = CandidatePair::new(local_idx, remote_idx, priority);
            let insert_at = state
                .pairs
                .partition_point(|e| e.pair.priority >= priority);
            state.pairs.insert(
                insert_at,
                PairEntry {
                    pair,
                    check: None,
                },
            );
            // Keep the selected index stable across inserts
            if let Some(selected) = state.selected.as_mut()
                && insert_at <= *selected
            {
                *selected += 1;
            }
            added += 1;
        }
        trace!(added, total = state.pairs.len(), "Check list updated");
    }

    /// Run connectivity checks until a pair succeeds or `timeout` expires.
    /// Newly trickled remote candidates join the check list immediately.
    pub async fn establish(self: &Arc<Self>, timeout: Duration) -> Result<Conn, IceError> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; 2048];
        loop {
            for (wire, dest) in self.pump_checks() {
                self.socket.send_to(&wire, dest).await?;
            }
            if let Some(conn) = self.selected_conn() {
                return Ok(conn);
            }
            if self.checks_exhausted() {
                warn!("Every pair failed after end-of-candidates");
                return Err(IceError::ConnectivityTimeout);
            }

            let recv = tokio::select! {
                _ = self.cancel.cancelled() => return Err(IceError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("ICE deadline expired with no succeeded pair");
                    return Err(IceError::ConnectivityTimeout);
                }
                _ = tokio::time::sleep(TICK) => None,
                r = self.socket.recv_from(&mut buf) => Some(r?),
            };
            if let Some((len, from)) = recv {
                for (wire, dest) in self.handle_datagram(&buf[..len], from)? {
                    self.socket.send_to(&wire, dest).await?;
                }
            }
        }
    }

    fn selected_conn(self: &Arc<Self>) -> Option<Conn> {
        let state = self.lock_state();
        let selected = state.selected?;
        let entry = &state.pairs[selected];
        let remote = state.remote[entry.pair.remote].addr;
        let local = state.local[entry.pair.local].addr;
        info!(%local, %remote, "ICE pair selected");
        Some(Conn {
            socket: Arc::clone(&self.socket),
            remote,
            local_pwd: self.local_creds.pwd.clone(),
            cancel: self.cancel.child_token(),
        })
    }

    /// Start the highest-priority Waiting check and service retransmit
    /// timers. Returns datagrams to send, so no lock is held across I/O.
    fn pump_checks(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        let now = Instant::now();
        let mut out = Vec::new();
        let mut state = self.lock_state();
        let state = &mut *state;
        let mut started_new = false;
        for entry in state.pairs.iter_mut() {
            match entry.pair.state {
                PairState::Waiting if !started_new => {
                    // One fresh check per tick approximates RFC pacing
                    started_new = true;
                    let remote = state.remote[entry.pair.remote].addr;
                    let local_priority = state.local[entry.pair.local].priority;
                    let (wire, transaction_id) = self.build_check(local_priority);
                    entry.pair.state = PairState::InProgress;
                    entry.check = Some(CheckState {
                        transaction_id,
                        transmits: 1,
                        rto: RTO_INITIAL,
                        next_send: now + RTO_INITIAL,
                    });
                    trace!(%remote, "Connectivity check started");
                    out.push((wire, remote));
                }
                PairState::InProgress => {
                    let Some(check) = entry.check.as_mut() else {
                        continue;
                    };
                    if check.next_send > now {
                        continue;
                    }
                    if check.transmits >= MAX_CHECK_TRANSMITS {
                        debug!("Check exhausted retransmits, pair failed");
                        entry.pair.state = PairState::Failed;
                        entry.check = None;
                        continue;
                    }
                    let remote = state.remote[entry.pair.remote].addr;
                    let local_priority = state.local[entry.pair.local].priority;
                    let wire =
                        self.build_check_with_id(local_priority, check.transaction_id);
                    check.transmits += 1;
                    check.rto *= 2;
                    check.next_send = now + check.rto;
                    out.push((wire, remote));
                }
                _ => {}
            }
        }
        out
    }

    fn build_check(&self, local_priority: u32) -> (Vec<u8>, [u8; 12]) {
        let transaction_id = stun::random_transaction_id();
        (
            self.build_check_with_id(local_priority, transaction_id),
            transaction_id,
        )
    }

    fn build_check_with_id(&self, local_priority: u32, transaction_id: [u8; 12]) -> Vec<u8> {
        let mut msg = Message::binding(Class::Request, transaction_id);
        msg.add(Attribute::Username(format!(
            "{}:{}",
            self.remote_creds.ufrag, self.local_creds.ufrag
        )));
        msg.add(match self.role {
            IceRole::Controlled => Attribute::IceControlled(self.tie_breaker),
            IceRole::Controlling => Attribute::IceControlling(self.tie_breaker),
        });
        msg.add(Attribute::Priority(local_priority));
        msg.add(Attribute::Software(SOFTWARE.to_string()));
        msg.add_message_integrity(self.remote_creds.pwd.as_bytes());
        msg.add_fingerprint();
        msg.serialize()
    }

    fn handle_datagram(
        &self,
        raw: &[u8],
        from: SocketAddr,
    ) -> Result<Vec<(Vec<u8>, SocketAddr)>, IceError> {
        let msg = match stun::parse(raw) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                trace!(%from, "Non-STUN datagram before selection, ignored");
                return Ok(Vec::new());
            }
            Err(e) => {
                debug!(%from, "Dropping malformed STUN message: {e}");
                return Ok(Vec::new());
            }
        };
        match msg.class {
            Class::Request => Ok(self.handle_binding_request(&msg, raw, from)),
            Class::SuccessResponse => {
                self.handle_binding_response(&msg, raw)?;
                Ok(Vec::new())
            }
            Class::ErrorResponse => {
                self.handle_error_response(&msg);
                Ok(Vec::new())
            }
            Class::Indication => {
                trace!(%from, "Binding indication received");
                Ok(Vec::new())
            }
        }
    }

    /// Inbound check: authenticate, synthesize a prflx candidate for an
    /// unknown source, answer with the mapped source address, and trigger
    /// our own check on that pair.
    fn handle_binding_request(
        &self,
        msg: &Message,
        raw: &[u8],
        from: SocketAddr,
    ) -> Vec<(Vec<u8>, SocketAddr)> {
        if !stun::validate_fingerprint(raw) {
            debug!(%from, "Binding request failed fingerprint check");
            return Vec::new();
        }
        if !stun::validate_message_integrity(raw, self.local_creds.pwd.as_bytes()) {
            debug!(%from, "Binding request failed integrity check");
            return Vec::new();
        }
        let expected = format!("{}:{}", self.local_creds.ufrag, self.remote_creds.ufrag);
        if msg.username() != Some(expected.as_str()) {
            debug!(%from, username = ?msg.username(), "Binding request username mismatch");
            return Vec::new();
        }

        if let Err(stun::StunError::UnknownMandatoryAttribute(unknown)) =
            msg.require_comprehension()
        {
            debug!(%from, ?unknown, "Rejecting request with unknown mandatory attributes");
            let mut resp = Message::binding(Class::ErrorResponse, msg.transaction_id);
            resp.add(Attribute::ErrorCode {
                code: 420,
                reason: "Unknown Attribute".to_string(),
            });
            resp.add(Attribute::UnknownAttributes(unknown));
            resp.add_message_integrity(self.local_creds.pwd.as_bytes());
            resp.add_fingerprint();
            return vec![(resp.serialize(), from)];
        }

        if msg.has_use_candidate() {
            debug!(%from, "Peer set USE-CANDIDATE on this pair");
        }

        let mut out = Vec::new();
        {
            let mut state = self.lock_state();
            let state_ref = &mut *state;
            let remote_idx = match state_ref.remote.iter().position(|c| c.addr == from) {
                Some(idx) => idx,
                None => {
                    // A source we never saw in signaling: peer-reflexive
                    let priority = msg.priority().unwrap_or_else(|| {
                        Candidate::compute_priority(CandidateType::PeerReflexive, 65535, 1)
                    });
                    let foundation = state_ref.remote_foundations.foundation(
                        CandidateType::PeerReflexive,
                        from.ip(),
                        Protocol::Udp,
                        None,
                    );
                    let candidate = Candidate::peer_reflexive(foundation, from, priority);
                    info!(candidate = %candidate, "Synthesized peer-reflexive remote candidate");
                    state_ref.remote.push(candidate);
                    state_ref.remote.len() - 1
                }
            };
            self.form_pairs_locked(state_ref, remote_idx);

            // Triggered check: answer traffic proves the path is worth
            // checking now, ahead of its list position.
            if let Some(entry) = state_ref
                .pairs
                .iter_mut()
                .find(|e| e.pair.remote == remote_idx && e.pair.state == PairState::Waiting)
            {
                let local_priority = state_ref.local[entry.pair.local].priority;
                let (wire, transaction_id) = self.build_check(local_priority);
                entry.pair.state = PairState::InProgress;
                entry.check = Some(CheckState {
                    transaction_id,
                    transmits: 1,
                    rto: RTO_INITIAL,
                    next_send: Instant::now() + RTO_INITIAL,
                });
                debug!(%from, "Triggered check on inbound request");
                out.push((wire, from));
            }
        }

        let mut resp = Message::binding(Class::SuccessResponse, msg.transaction_id);
        resp.add(Attribute::XorMappedAddress(from));
        resp.add(Attribute::Software(SOFTWARE.to_string()));
        resp.add_message_integrity(self.local_creds.pwd.as_bytes());
        resp.add_fingerprint();
        // Respond first so the peer's own check concludes promptly
        out.insert(0, (resp.serialize(), from));
        out
    }

    fn handle_binding_response(&self, msg: &Message, raw: &[u8]) -> Result<(), IceError> {
        if !stun::validate_message_integrity(raw, self.remote_creds.pwd.as_bytes()) {
            debug!("Binding response failed integrity check");
            return Ok(());
        }
        let mut state = self.lock_state();
        let Some(idx) = state.pairs.iter().position(|e| {
            e.check
                .as_ref()
                .is_some_and(|c| c.transaction_id == msg.transaction_id)
        }) else {
            trace!("Response with no in-flight check, ignored");
            return Ok(());
        };
        let Some(mapped) = msg.xor_mapped_address() else {
            return Err(IceError::ProtocolViolation(
                "binding response without XOR-MAPPED-ADDRESS",
            ));
        };
        let entry = &mut state.pairs[idx];
        entry.pair.state = PairState::Succeeded;
        entry.check = None;
        debug!(%mapped, "Connectivity check succeeded");
        if state.selected.is_none() {
            // First success wins; this agent does not continue hunting for
            // a better pair afterwards.
            state.selected = Some(idx);
        }
        Ok(())
    }

    fn handle_error_response(&self, msg: &Message) {
        let mut state = self.lock_state();
        if let Some(entry) = state.pairs.iter_mut().find(|e| {
            e.check
                .as_ref()
                .is_some_and(|c| c.transaction_id == msg.transaction_id)
        }) {
            warn!(code = ?msg.error_code(), "Check failed with error response");
            entry.pair.state = PairState::Failed;
            entry.check = None;
        }
    }

    /// True once the remote sent end-of-candidates and no pair can still
    /// succeed; keeps `establish` from sitting out the full deadline.
    fn checks_exhausted(&self) -> bool {
        let state = self.lock_state();
        state.end_of_remote_candidates
            && state
                .pairs
                .iter()
                .all(|e| e.pair.state == PairState::Failed)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn seed_local_candidate(&self, candidate: Candidate) {
        self.lock_state().local.push(candidate);
    }

    #[cfg(test)]
    fn pair_states(&self) -> Vec<PairState> {
        self.lock_state().pairs.iter().map(|e| e.pair.state).collect()
    }

    #[cfg(test)]
    fn remote_candidates(&self) -> Vec<Candidate> {
        self.lock_state().remote.clone()
    }
}

/// Duplex datagram channel anchored to the selected pair.
///
/// `recv` keeps the ICE path alive after selection: inbound Binding
/// requests are answered internally and only non-STUN payloads surface.
#[derive(Clone, Debug)]
pub struct Conn {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    local_pwd: String,
    cancel: CancellationToken,
}

impl Conn {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    pub async fn send(&self, payload: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(payload, self.remote).await
    }

    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let (len, from) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        "connection cancelled",
                    ));
                }
                r = self.socket.recv_from(buf) => r?,
            };
            if from != self.remote {
                trace!(%from, "Datagram from non-selected address dropped");
                continue;
            }
            if stun::is_stun(&buf[..len]) {
                if let Ok(Some(msg)) = stun::parse(&buf[..len])
                    && msg.class == Class::Request
                    && stun::validate_message_integrity(&buf[..len], self.local_pwd.as_bytes())
                {
                    let mut resp = Message::binding(Class::SuccessResponse, msg.transaction_id);
                    resp.add(Attribute::XorMappedAddress(from));
                    resp.add_message_integrity(self.local_pwd.as_bytes());
                    resp.add_fingerprint();
                    let _ = self.socket.send_to(&resp.serialize(), from).await;
                }
                continue;
            }
            return Ok(len);
        }
    }

    /// Bound-but-unconnected loopback channel for collaborator tests.
    #[cfg(test)]
    pub(crate) async fn loopback_for_tests() -> Conn {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = socket.local_addr().unwrap();
        Conn {
            socket: Arc::new(socket),
            remote,
            local_pwd: "test-password-test-pass".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Send a Binding Indication every `interval` until cancelled. No
    /// response is expected; this only refreshes NAT bindings.
    pub async fn run_keepalive(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let mut indication =
                Message::binding(Class::Indication, stun::random_transaction_id());
            indication.add(Attribute::Software(SOFTWARE.to_string()));
            indication.add_fingerprint();
            if let Err(e) = self.send(&indication.serialize()).await {
                debug!("Keepalive send failed: {e}");
                return;
            }
            trace!("Keepalive indication sent");
        }
    }
}

async fn probe_local_ip(probe: &str) -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect(probe).await?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no route to probe address",
        ));
    }
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_creds() -> (IceCredentials, IceCredentials) {
        (
            IceCredentials {
                ufrag: "LFRG".to_string(),
                pwd: "localpasswordlocalpass".to_string(),
            },
            IceCredentials {
                ufrag: "RFRG".to_string(),
                pwd: "remotepasswordremotepw".to_string(),
            },
        )
    }

    async fn test_agent(role: IceRole) -> Arc<Agent> {
        let (local, remote) = test_creds();
        Agent::new(
            local,
            remote,
            role,
            AgentConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn credentials_meet_minimum_lengths() {
        let creds = IceCredentials::random();
        assert!(creds.ufrag.len() >= 4);
        assert!(creds.pwd.len() >= 22);
        assert!(creds.pwd.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn remote_candidates_form_ordered_pairs() {
        let agent = test_agent(IceRole::Controlled).await;
        agent.seed_local_candidate(Candidate::host(
            "0".to_string(),
            "192.168.1.10:40000".parse().unwrap(),
            65535,
        ));

        agent
            .add_remote_candidate("candidate:1 1 udp 1694498815 203.0.113.5 50000 typ srflx")
            .unwrap();
        agent
            .add_remote_candidate("candidate:2 1 udp 2130706431 10.1.2.3 50001 typ host")
            .unwrap();

        let state = agent.lock_state();
        assert_eq!(state.pairs.len(), 2);
        // Higher remote priority (the host candidate) sorts first
        assert!(state.pairs[0].pair.priority > state.pairs[1].pair.priority);
        assert_eq!(state.remote[state.pairs[0].pair.remote].addr.port(), 50001);
        assert!(state.pairs.iter().all(|e| e.pair.state == PairState::Waiting));
    }

    #[tokio::test]
    async fn duplicate_and_tcp_candidates_form_no_pairs() {
        let agent = test_agent(IceRole::Controlled).await;
        agent.seed_local_candidate(Candidate::host(
            "0".to_string(),
            "192.168.1.10:40000".parse().unwrap(),
            65535,
        ));

        agent
            .add_remote_candidate("candidate:1 1 udp 99 203.0.113.5 50000 typ host")
            .unwrap();
        agent
            .add_remote_candidate("candidate:9 1 udp 77 203.0.113.5 50000 typ host")
            .unwrap();
        agent
            .add_remote_candidate("candidate:2 1 tcp 88 203.0.113.9 9 typ host")
            .unwrap();

        let state = agent.lock_state();
        assert_eq!(state.remote.len(), 2, "duplicate dropped, tcp kept");
        assert_eq!(state.pairs.len(), 1, "only the UDP candidate paired");
    }

    #[tokio::test]
    async fn end_of_candidates_sentinel_sets_flag() {
        let agent = test_agent(IceRole::Controlled).await;
        agent.add_remote_candidate("").unwrap();
        assert!(agent.lock_state().end_of_remote_candidates);
    }

    #[tokio::test]
    async fn establish_times_out_without_candidates() {
        let agent = test_agent(IceRole::Controlled).await;
        let err = agent.establish(Duration::from_millis(120)).await.unwrap_err();
        assert!(matches!(err, IceError::ConnectivityTimeout));
        assert_eq!(err.to_string(), "no candidate pair succeeded");
    }

    #[tokio::test]
    async fn establish_fails_fast_after_end_of_candidates() {
        let agent = test_agent(IceRole::Controlled).await;
        agent.add_remote_candidate("").unwrap();
        let start = std::time::Instant::now();
        let err = agent.establish(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, IceError::ConnectivityTimeout));
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "empty check list with end-of-candidates must not wait out the deadline"
        );
    }

    #[tokio::test]
    async fn establish_cancellation_propagates() {
        let (local, remote) = test_creds();
        let cancel = CancellationToken::new();
        let agent = Agent::new(
            local,
            remote,
            IceRole::Controlled,
            AgentConfig::default(),
            cancel.clone(),
        )
        .await
        .unwrap();
        let task = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.establish(Duration::from_secs(30)).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_millis(200), task)
            .await
            .expect("establish must unblock promptly on cancel")
            .unwrap();
        assert!(matches!(result, Err(IceError::Cancelled)));
    }

    /// An unexpected Binding request creates a prflx remote candidate, a
    /// pair, a success response carrying the request's source address, and
    /// a triggered check; answering the check selects the pair.
    #[tokio::test(flavor = "multi_thread")]
    async fn inbound_request_triggers_prflx_pair_and_selection() {
        let (local, remote) = test_creds();
        let agent = Agent::new(
            local.clone(),
            remote.clone(),
            IceRole::Controlled,
            AgentConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let agent_port = agent.local_port();
        agent.seed_local_candidate(Candidate::host(
            "0".to_string(),
            format!("127.0.0.1:{agent_port}").parse().unwrap(),
            65535,
        ));

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let agent_addr: SocketAddr = format!("127.0.0.1:{agent_port}").parse().unwrap();

        let establish = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.establish(Duration::from_secs(5)).await }
        });

        // The browser-side check: USERNAME is our ufrag first, keyed with
        // our password, controlling role advertised.
        let mut check = Message::binding(Class::Request, stun::random_transaction_id());
        check.add(Attribute::Username(format!("{}:{}", local.ufrag, remote.ufrag)));
        check.add(Attribute::IceControlling(7));
        check.add(Attribute::Priority(1_845_501_695));
        check.add_message_integrity(local.pwd.as_bytes());
        check.add_fingerprint();
        peer.send_to(&check.serialize(), agent_addr).await.unwrap();

        // Expect both a success response to our check and the agent's
        // triggered check, in either order.
        let mut saw_response = false;
        let mut triggered: Option<Message> = None;
        let mut buf = [0u8; 1500];
        while !(saw_response && triggered.is_some()) {
            let (len, from) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
                .await
                .expect("agent did not answer")
                .unwrap();
            assert_eq!(from, agent_addr);
            let msg = stun::parse(&buf[..len]).unwrap().unwrap();
            match msg.class {
                Class::SuccessResponse => {
                    assert_eq!(msg.transaction_id, check.transaction_id);
                    assert_eq!(msg.xor_mapped_address(), Some(peer_addr));
                    assert!(stun::validate_message_integrity(&buf[..len], local.pwd.as_bytes()));
                    saw_response = true;
                }
                Class::Request => {
                    assert_eq!(
                        msg.username(),
                        Some(format!("{}:{}", remote.ufrag, local.ufrag).as_str())
                    );
                    assert!(stun::validate_message_integrity(&buf[..len], remote.pwd.as_bytes()));
                    assert!(msg.attributes.iter().any(|a| matches!(a, Attribute::IceControlled(_))));
                    triggered = Some(msg);
                }
                other => panic!("unexpected message class {other:?}"),
            }
        }

        // Agent state: prflx candidate and a pair in progress
        let remotes = agent.remote_candidates();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].typ, CandidateType::PeerReflexive);
        assert_eq!(remotes[0].addr, peer_addr);
        assert_eq!(agent.pair_states(), vec![PairState::InProgress]);

        // Answer the triggered check; the pair gets selected.
        let triggered = triggered.unwrap();
        let mut resp = Message::binding(Class::SuccessResponse, triggered.transaction_id);
        resp.add(Attribute::XorMappedAddress(agent_addr));
        resp.add_message_integrity(remote.pwd.as_bytes());
        resp.add_fingerprint();
        peer.send_to(&resp.serialize(), agent_addr).await.unwrap();

        let conn = tokio::time::timeout(Duration::from_secs(2), establish)
            .await
            .expect("establish did not settle")
            .unwrap()
            .expect("expected a selected pair");
        assert_eq!(conn.peer_addr(), peer_addr);
        assert_eq!(agent.pair_states(), vec![PairState::Succeeded]);

        // The selected-pair channel carries media bytes through
        conn.send(b"\x80media").await.unwrap();
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"\x80media");
    }

    /// Post-selection, `Conn::recv` answers Binding requests internally and
    /// only surfaces non-STUN payloads.
    #[tokio::test(flavor = "multi_thread")]
    async fn conn_recv_answers_checks_and_passes_media() {
        let (local, _) = test_creds();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn_addr = socket.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let conn = Conn {
            socket: Arc::new(socket),
            remote: peer_addr,
            local_pwd: local.pwd.clone(),
            cancel: CancellationToken::new(),
        };

        let recv_task = tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let len = conn.recv(&mut buf).await.unwrap();
            buf[..len].to_vec()
        });

        // A keepalive check from the peer, then media
        let mut check = Message::binding(Class::Request, stun::random_transaction_id());
        check.add(Attribute::Username("any:thing".to_string()));
        check.add_message_integrity(local.pwd.as_bytes());
        check.add_fingerprint();
        peer.send_to(&check.serialize(), conn_addr).await.unwrap();

        let mut buf = [0u8; 1500];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .expect("no response to keepalive check")
            .unwrap();
        let resp = stun::parse(&buf[..len]).unwrap().unwrap();
        assert_eq!(resp.class, Class::SuccessResponse);
        assert_eq!(resp.xor_mapped_address(), Some(peer_addr));

        peer.send_to(b"\x80rtp-bytes", conn_addr).await.unwrap();
        let media = tokio::time::timeout(Duration::from_secs(2), recv_task)
            .await
            .expect("recv did not surface media")
            .unwrap();
        assert_eq!(media, b"\x80rtp-bytes");
    }
}
