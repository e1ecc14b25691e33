use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Transport protocol of a candidate. TCP candidates are parsed but never
/// checked; only UDP pairs enter the check list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = CandidateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            _ => Err(CandidateParseError::UnknownProtocol(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    /// RFC 8445 recommended type preferences.
    pub fn preference(self) -> u8 {
        match self {
            CandidateType::Host => 126,
            CandidateType::ServerReflexive | CandidateType::PeerReflexive => 110,
            CandidateType::Relay => 0,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CandidateType {
    type Err = CandidateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            _ => Err(CandidateParseError::UnknownType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CandidateParseError {
    #[error("not a candidate line")]
    NotACandidate,
    #[error("candidate line is missing the {0} field")]
    MissingField(&'static str),
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("component {0} outside [1,256]")]
    ComponentOutOfRange(u32),
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
    #[error("unknown candidate type {0:?}")]
    UnknownType(String),
}

/// One transport address a peer advertises, as carried in an SDP
/// `candidate:` line.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: Protocol,
    pub priority: u32,
    pub addr: SocketAddr,
    pub typ: CandidateType,
    pub raddr: Option<IpAddr>,
    pub rport: Option<u16>,
    /// Extension attributes after `typ`, in original order.
    pub extensions: Vec<(String, String)>,
}

/// Candidates are equal when they name the same transport address:
/// (protocol, ip, port, type).
impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.addr == other.addr && self.typ == other.typ
    }
}

impl Eq for Candidate {}

impl Candidate {
    /// RFC 8445 §5.1.2.1 candidate priority.
    pub fn compute_priority(typ: CandidateType, local_pref: u16, component: u16) -> u32 {
        ((typ.preference() as u32) << 24)
            | ((local_pref as u32) << 8)
            | (256 - component as u32)
    }

    pub fn host(foundation: String, addr: SocketAddr, local_pref: u16) -> Self {
        Self {
            foundation,
            component: 1,
            protocol: Protocol::Udp,
            priority: Self::compute_priority(CandidateType::Host, local_pref, 1),
            addr,
            typ: CandidateType::Host,
            raddr: None,
            rport: None,
            extensions: Vec::new(),
        }
    }

    pub fn server_reflexive(foundation: String, addr: SocketAddr, base: SocketAddr) -> Self {
        Self {
            foundation,
            component: 1,
            protocol: Protocol::Udp,
            priority: Self::compute_priority(CandidateType::ServerReflexive, 65535, 1),
            addr,
            typ: CandidateType::ServerReflexive,
            raddr: Some(base.ip()),
            rport: Some(base.port()),
            extensions: Vec::new(),
        }
    }

    /// Remote candidate synthesized from an unexpected Binding request.
    pub fn peer_reflexive(foundation: String, addr: SocketAddr, priority: u32) -> Self {
        Self {
            foundation,
            component: 1,
            protocol: Protocol::Udp,
            priority,
            addr,
            typ: CandidateType::PeerReflexive,
            raddr: None,
            rport: None,
            extensions: Vec::new(),
        }
    }
}

impl FromStr for Candidate {
    type Err = CandidateParseError;

    /// Parse `candidate:F C PROTO PRIO IP PORT typ T [raddr R] [rport P]
    /// [name value]*`, with or without the `a=` prefix.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim().trim_start_matches("a=");
        let rest = line
            .strip_prefix("candidate:")
            .ok_or(CandidateParseError::NotACandidate)?;
        let mut fields = rest.split_whitespace();

        let foundation = fields
            .next()
            .ok_or(CandidateParseError::MissingField("foundation"))?
            .to_string();
        let component_raw = fields
            .next()
            .ok_or(CandidateParseError::MissingField("component"))?;
        let component: u32 =
            component_raw
                .parse()
                .map_err(|_| CandidateParseError::InvalidField {
                    field: "component",
                    value: component_raw.to_string(),
                })?;
        if !(1..=256).contains(&component) {
            return Err(CandidateParseError::ComponentOutOfRange(component));
        }
        let protocol: Protocol = fields
            .next()
            .ok_or(CandidateParseError::MissingField("protocol"))?
            .parse()?;
        let priority_raw = fields
            .next()
            .ok_or(CandidateParseError::MissingField("priority"))?;
        let priority: u32 =
            priority_raw
                .parse()
                .map_err(|_| CandidateParseError::InvalidField {
                    field: "priority",
                    value: priority_raw.to_string(),
                })?;
        let ip_raw = fields.next().ok_or(CandidateParseError::MissingField("ip"))?;
        let ip: IpAddr = ip_raw.parse().map_err(|_| CandidateParseError::InvalidField {
            field: "ip",
            value: ip_raw.to_string(),
        })?;
        let port_raw = fields.next().ok_or(CandidateParseError::MissingField("port"))?;
        let port: u16 = port_raw
            .parse()
            .map_err(|_| CandidateParseError::InvalidField {
                field: "port",
                value: port_raw.to_string(),
            })?;
        match fields.next() {
            Some("typ") => {}
            _ => return Err(CandidateParseError::MissingField("typ")),
        }
        let typ: CandidateType = fields
            .next()
            .ok_or(CandidateParseError::MissingField("type"))?
            .parse()?;

        let mut raddr = None;
        let mut rport = None;
        let mut extensions = Vec::new();
        while let Some(name) = fields.next() {
            let value = fields
                .next()
                .ok_or(CandidateParseError::MissingField("extension value"))?;
            match name {
                "raddr" => {
                    raddr = Some(value.parse().map_err(|_| CandidateParseError::InvalidField {
                        field: "raddr",
                        value: value.to_string(),
                    })?);
                }
                "rport" => {
                    rport = Some(value.parse().map_err(|_| CandidateParseError::InvalidField {
                        field: "rport",
                        value: value.to_string(),
                    })?);
                }
                _ => extensions.push((name.to_string(), value.to_string())),
            }
        }

        Ok(Candidate {
            foundation,
            component: component as u16,
            protocol,
            priority,
            addr: SocketAddr::new(ip, port),
            typ,
            raddr,
            rport,
            extensions,
        })
    }
}

impl fmt::Display for Candidate {
    /// Canonical line form; the protocol field is normalized to lowercase.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.addr.ip(),
            self.addr.port(),
            self.typ,
        )?;
        if let Some(raddr) = self.raddr {
            write!(f, " raddr {raddr}")?;
        }
        if let Some(rport) = self.rport {
            write!(f, " rport {rport}")?;
        }
        for (name, value) in &self.extensions {
            write!(f, " {name} {value}")?;
        }
        Ok(())
    }
}

/// Candidate pair states; `Waiting` on construction, mutated only by the
/// agent's check scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

/// One local x remote candidate combination; the unit of connectivity check.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    /// Index into the agent's local candidate list.
    pub local: usize,
    /// Index into the agent's remote candidate list.
    pub remote: usize,
    pub priority: u64,
    pub state: PairState,
}

impl CandidatePair {
    pub fn new(local: usize, remote: usize, priority: u64) -> Self {
        Self {
            local,
            remote,
            priority,
            state: PairState::Waiting,
        }
    }
}

/// RFC 8445 §6.1.2.3 pair priority. 64-bit throughout so two maximum
/// candidate priorities cannot overflow.
pub fn pair_priority(controlling: u32, controlled: u32) -> u64 {
    let g = controlling as u64;
    let d = controlled as u64;
    (g.min(d) << 32) + (g.max(d) << 1) + u64::from(g > d)
}

/// Assigns foundation strings: candidates sharing
/// (type, base address, protocol, STUN server) share a foundation, and
/// foundations are small integers in first-appearance order.
#[derive(Default)]
pub struct FoundationRegistry {
    assigned: HashMap<u64, String>,
    next: u32,
}

impl FoundationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn foundation(
        &mut self,
        typ: CandidateType,
        base: IpAddr,
        protocol: Protocol,
        stun_server: Option<&str>,
    ) -> String {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        let mut mix = |bytes: &[u8]| {
            for &b in bytes {
                hash ^= b as u64;
                hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
            }
        };
        mix(typ.to_string().as_bytes());
        mix(base.to_string().as_bytes());
        mix(protocol.to_string().as_bytes());
        mix(stun_server.unwrap_or("").as_bytes());

        if let Some(existing) = self.assigned.get(&hash) {
            return existing.clone();
        }
        let assigned = self.next.to_string();
        self.next += 1;
        self.assigned.insert(hash, assigned.clone());
        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_candidate_roundtrip() {
        let line = "candidate:0 1 UDP 123456789 192.168.1.1 12345 typ host";
        let c: Candidate = line.parse().unwrap();
        assert_eq!(c.foundation, "0");
        assert_eq!(c.component, 1);
        assert_eq!(c.protocol, Protocol::Udp);
        assert_eq!(c.priority, 123456789);
        assert_eq!(c.addr, "192.168.1.1:12345".parse().unwrap());
        assert_eq!(c.typ, CandidateType::Host);
        // Lowercase protocol is the documented normalization
        assert_eq!(c.to_string(), "candidate:0 1 udp 123456789 192.168.1.1 12345 typ host");
    }

    #[test]
    fn parse_srflx_with_related_address() {
        let line = "candidate:830412194 1 udp 1694498815 71.167.39.185 49701 typ srflx raddr 10.1.2.3 rport 49701";
        let c: Candidate = line.parse().unwrap();
        assert_eq!(c.typ, CandidateType::ServerReflexive);
        assert_eq!(c.raddr, Some("10.1.2.3".parse().unwrap()));
        assert_eq!(c.rport, Some(49701));
        assert_eq!(c.to_string(), line);
    }

    #[test]
    fn parse_preserves_extension_attributes() {
        let line = "candidate:1 1 udp 2130706431 10.0.0.2 9 typ host generation 0 ufrag abcd";
        let c: Candidate = line.parse().unwrap();
        assert_eq!(
            c.extensions,
            vec![
                ("generation".to_string(), "0".to_string()),
                ("ufrag".to_string(), "abcd".to_string())
            ]
        );
        assert_eq!(c.to_string(), line);
    }

    #[test]
    fn parse_accepts_attribute_prefix() {
        let line = "a=candidate:0 1 udp 1 1.2.3.4 5 typ host";
        let c: Candidate = line.parse().unwrap();
        assert_eq!(c.addr.port(), 5);
    }

    #[test]
    fn component_bounds_are_enforced() {
        let zero = "candidate:0 0 udp 1 1.2.3.4 5 typ host".parse::<Candidate>();
        assert_eq!(zero.unwrap_err(), CandidateParseError::ComponentOutOfRange(0));
        let big = "candidate:0 257 udp 1 1.2.3.4 5 typ host".parse::<Candidate>();
        assert_eq!(big.unwrap_err(), CandidateParseError::ComponentOutOfRange(257));
        assert!("candidate:0 256 udp 1 1.2.3.4 5 typ host".parse::<Candidate>().is_ok());
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert_eq!(
            "foo".parse::<Candidate>().unwrap_err(),
            CandidateParseError::NotACandidate
        );
        assert!(matches!(
            "candidate:0 1 udp".parse::<Candidate>().unwrap_err(),
            CandidateParseError::MissingField(_)
        ));
        assert!(matches!(
            "candidate:0 1 udp 1 nothost 5 typ host".parse::<Candidate>().unwrap_err(),
            CandidateParseError::InvalidField { field: "ip", .. }
        ));
        assert!(matches!(
            "candidate:0 1 ipx 1 1.2.3.4 5 typ host".parse::<Candidate>().unwrap_err(),
            CandidateParseError::UnknownProtocol(_)
        ));
    }

    #[test]
    fn equality_ignores_priority_and_foundation() {
        let a: Candidate = "candidate:0 1 udp 999 1.2.3.4 5 typ host".parse().unwrap();
        let b: Candidate = "candidate:7 1 udp 1 1.2.3.4 5 typ host".parse().unwrap();
        assert_eq!(a, b);
        let c: Candidate = "candidate:0 1 udp 999 1.2.3.4 5 typ srflx".parse().unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn candidate_priority_formula() {
        // host, local pref 65535, component 1
        let p = Candidate::compute_priority(CandidateType::Host, 65535, 1);
        assert_eq!(p, (126 << 24) | (65535 << 8) | 255);
        // relay has type preference 0
        let r = Candidate::compute_priority(CandidateType::Relay, 0, 256);
        assert_eq!(r, 0);
    }

    #[test]
    fn pair_priority_matches_rfc_example() {
        // G = 0x6EFFFFFE (controlling), D = 0x7EFFFFFF (controlled), G < D so B = 0
        let expected = (0x6EFF_FFFEu64 << 32) + (0x7EFF_FFFFu64 << 1);
        assert_eq!(pair_priority(0x6EFF_FFFE, 0x7EFF_FFFF), expected);
    }

    #[test]
    fn pair_priority_does_not_overflow_at_max() {
        let max = (1u32 << 31) - 1;
        let p = pair_priority(max, max);
        assert_eq!(p, ((max as u64) << 32) + ((max as u64) << 1));
    }

    #[test]
    fn pair_priority_tie_break_bit() {
        assert_eq!(pair_priority(2, 1) & 1, 1);
        assert_eq!(pair_priority(1, 2) & 1, 0);
    }

    #[test]
    fn pairs_start_waiting() {
        let pair = CandidatePair::new(0, 0, 42);
        assert_eq!(pair.state, PairState::Waiting);
    }

    #[test]
    fn foundations_are_assigned_in_first_appearance_order() {
        let mut registry = FoundationRegistry::new();
        let base: IpAddr = "192.168.1.10".parse().unwrap();
        let host = registry.foundation(CandidateType::Host, base, Protocol::Udp, None);
        let srflx = registry.foundation(
            CandidateType::ServerReflexive,
            base,
            Protocol::Udp,
            Some("stun.example.net:3478"),
        );
        assert_eq!(host, "0");
        assert_eq!(srflx, "1");
        // Same tuple maps back to the same foundation
        let again = registry.foundation(CandidateType::Host, base, Protocol::Udp, None);
        assert_eq!(again, host);
    }
}
