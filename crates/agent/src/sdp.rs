//! SDP parse/serialize for the subset a WebRTC offer/answer exchange uses
//! (RFC 4566 line model plus the ICE, DTLS, and RTP attributes).
//!
//! Parsing is two-phase: the line scan dispatches on the single-character
//! key (`v,o,s,i,u,e,p,c,t,a,m`), and `a=` values inside a media section go
//! through per-name strategies (`rtpmap`, `fmtp`, `candidate`, ...) into a
//! strongly typed record. Unrecognized attributes are preserved verbatim.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::candidate::Candidate;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SdpError {
    #[error("SDP must start with v=0")]
    MissingVersion,
    #[error("line {0} is not of the form key=value")]
    InvalidLine(usize),
    #[error("malformed {what} line: {line:?}")]
    Malformed { what: &'static str, line: String },
    #[error("offer has no usable {0} section")]
    NoUsableMedia(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: u64,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

impl Origin {
    fn parse(value: &str) -> Result<Self, SdpError> {
        let mut f = value.split_whitespace();
        let mut next = |what| {
            f.next().map(str::to_string).ok_or(SdpError::Malformed {
                what,
                line: value.to_string(),
            })
        };
        let username = next("origin")?;
        let session_id = next("origin")?;
        let session_version = next("origin")?
            .parse()
            .map_err(|_| SdpError::Malformed {
                what: "origin",
                line: value.to_string(),
            })?;
        Ok(Origin {
            username,
            session_id,
            session_version,
            network_type: next("origin")?,
            address_type: next("origin")?,
            address: next("origin")?,
        })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.username,
            self.session_id,
            self.session_version,
            self.network_type,
            self.address_type,
            self.address
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Application,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Application => write!(f, "application"),
        }
    }
}

impl FromStr for MediaKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            "application" => Ok(MediaKind::Application),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendOnly,
    RecvOnly,
    SendRecv,
    Inactive,
}

impl Direction {
    fn name(self) -> &'static str {
        match self {
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::SendRecv => "sendrecv",
            Direction::Inactive => "inactive",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "sendrecv" => Some(Direction::SendRecv),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }
}

/// `a=setup` role (RFC 4145 as used by DTLS-SRTP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setup {
    Active,
    Passive,
    Actpass,
}

impl Setup {
    fn name(self) -> &'static str {
        match self {
            Setup::Active => "active",
            Setup::Passive => "passive",
            Setup::Actpass => "actpass",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "active" => Some(Setup::Active),
            "passive" => Some(Setup::Passive),
            "actpass" => Some(Setup::Actpass),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpAttribute {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaSection {
    pub kind: Option<MediaKind>,
    /// Raw kind token when it is not one we model (kept for reserialization).
    pub kind_raw: String,
    pub port: u16,
    pub protocol: String,
    /// Payload types in `m=` line order.
    pub formats: Vec<u8>,
    pub connection: Option<String>,
    pub bandwidth: Option<String>,
    pub mid: Option<String>,
    pub direction: Option<Direction>,
    pub rtcp_mux: bool,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    /// (hash function, fingerprint value)
    pub fingerprint: Option<(String, String)>,
    pub setup: Option<Setup>,
    pub msid: Option<String>,
    pub candidates: Vec<Candidate>,
    pub end_of_candidates: bool,
    /// payload type -> codec mapping
    pub rtpmaps: BTreeMap<u8, RtpMap>,
    /// payload type -> raw fmtp parameter string
    pub fmtps: BTreeMap<u8, String>,
    /// `a=ssrc:<id> <attribute>` lines, order preserved.
    pub ssrcs: Vec<(u32, String)>,
    /// Attributes without a dedicated strategy, order preserved.
    pub attributes: Vec<SdpAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub version: u8,
    pub origin: Origin,
    pub name: String,
    pub info: Option<String>,
    pub uri: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub connection: Option<String>,
    pub timing: (u64, u64),
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub fingerprint: Option<(String, String)>,
    pub setup: Option<Setup>,
    pub attributes: Vec<SdpAttribute>,
    pub media: Vec<MediaSection>,
}

impl SessionDescription {
    /// Effective ICE credentials for a media section, falling back to the
    /// session level (browsers differ on where they put them).
    pub fn ice_credentials(&self, media: &MediaSection) -> Option<(String, String)> {
        let ufrag = media.ice_ufrag.clone().or_else(|| self.ice_ufrag.clone())?;
        let pwd = media.ice_pwd.clone().or_else(|| self.ice_pwd.clone())?;
        Some((ufrag, pwd))
    }

    pub fn setup_for(&self, media: &MediaSection) -> Option<Setup> {
        media.setup.or(self.setup)
    }

    pub fn fingerprint_for(&self, media: &MediaSection) -> Option<(String, String)> {
        media.fingerprint.clone().or_else(|| self.fingerprint.clone())
    }

    pub fn first_media(&self, kind: MediaKind) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.kind == Some(kind) && m.port != 0)
    }
}

impl MediaSection {
    /// First payload type mapped to `encoding` at `clock_rate`
    /// (case-insensitive encoding match).
    pub fn find_format(&self, encoding: &str, clock_rate: u32) -> Option<u8> {
        self.formats.iter().copied().find(|pt| {
            self.rtpmaps.get(pt).is_some_and(|map| {
                map.encoding.eq_ignore_ascii_case(encoding) && map.clock_rate == clock_rate
            })
        })
    }

    /// Preferred H.264 payload type: packetization-mode=1 if offered,
    /// otherwise the first H264 mapping.
    pub fn h264_format(&self) -> Option<u8> {
        let h264: Vec<u8> = self
            .formats
            .iter()
            .copied()
            .filter(|pt| {
                self.rtpmaps
                    .get(pt)
                    .is_some_and(|m| m.encoding.eq_ignore_ascii_case("H264"))
            })
            .collect();
        h264.iter()
            .copied()
            .find(|pt| {
                self.fmtps
                    .get(pt)
                    .is_some_and(|f| H264FormatParams::parse(f).packetization_mode == 1)
            })
            .or_else(|| h264.first().copied())
    }
}

/// Parsed H.264 `a=fmtp` options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct H264FormatParams {
    pub profile_level_id: Option<String>,
    pub packetization_mode: u8,
    pub sprop_parameter_sets: Option<String>,
}

impl H264FormatParams {
    pub fn parse(fmtp: &str) -> Self {
        let mut params = H264FormatParams::default();
        for part in fmtp.split(';') {
            let Some((name, value)) = part.trim().split_once('=') else {
                continue;
            };
            match name {
                "profile-level-id" => params.profile_level_id = Some(value.to_string()),
                "packetization-mode" => {
                    params.packetization_mode = value.parse().unwrap_or(0);
                }
                "sprop-parameter-sets" => {
                    params.sprop_parameter_sets = Some(value.to_string());
                }
                _ => {}
            }
        }
        params
    }
}

/// Parse an SDP blob. Lines may end with either `\r\n` or `\n`.
pub fn parse_session(input: &str) -> Result<SessionDescription, SdpError> {
    let mut lines = input
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .enumerate();

    let Some((_, first)) = lines.next() else {
        return Err(SdpError::MissingVersion);
    };
    let Some(version) = first.strip_prefix("v=") else {
        return Err(SdpError::MissingVersion);
    };
    let version: u8 = version.trim().parse().map_err(|_| SdpError::MissingVersion)?;

    let mut session = SessionDescription {
        version,
        origin: Origin {
            username: "-".to_string(),
            session_id: "0".to_string(),
            session_version: 0,
            network_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            address: "0.0.0.0".to_string(),
        },
        name: "-".to_string(),
        info: None,
        uri: None,
        email: None,
        phone: None,
        connection: None,
        timing: (0, 0),
        ice_ufrag: None,
        ice_pwd: None,
        fingerprint: None,
        setup: None,
        attributes: Vec::new(),
        media: Vec::new(),
    };

    for (index, line) in lines {
        let (key, value) = line
            .split_once('=')
            .filter(|(k, _)| k.len() == 1)
            .ok_or(SdpError::InvalidLine(index + 1))?;
        let key = key.chars().next().expect("checked length");
        match key {
            'o' => session.origin = Origin::parse(value)?,
            's' => session.name = value.to_string(),
            'i' => session.info = Some(value.to_string()),
            'u' => session.uri = Some(value.to_string()),
            'e' => session.email = Some(value.to_string()),
            'p' => session.phone = Some(value.to_string()),
            'c' => match session.media.last_mut() {
                Some(media) => media.connection = Some(value.to_string()),
                None => session.connection = Some(value.to_string()),
            },
            'b' => {
                if let Some(media) = session.media.last_mut() {
                    media.bandwidth = Some(value.to_string());
                }
            }
            't' => {
                let mut f = value.split_whitespace();
                let start = f.next().and_then(|v| v.parse().ok());
                let stop = f.next().and_then(|v| v.parse().ok());
                session.timing = match (start, stop) {
                    (Some(start), Some(stop)) => (start, stop),
                    _ => {
                        return Err(SdpError::Malformed {
                            what: "timing",
                            line: line.to_string(),
                        });
                    }
                };
            }
            'm' => session.media.push(parse_media_line(value)?),
            'a' => {
                let (name, attr_value) = match value.split_once(':') {
                    Some((name, v)) => (name, Some(v)),
                    None => (value, None),
                };
                match session.media.last_mut() {
                    Some(media) => apply_media_attribute(media, name, attr_value, line)?,
                    None => apply_session_attribute(&mut session, name, attr_value),
                }
            }
            // Keys with no bearing on the exchange (k, r, z, ...)
            _ => {}
        }
    }

    Ok(session)
}

fn parse_media_line(value: &str) -> Result<MediaSection, SdpError> {
    let malformed = || SdpError::Malformed {
        what: "media",
        line: value.to_string(),
    };
    let mut f = value.split_whitespace();
    let kind_raw = f.next().ok_or_else(malformed)?.to_string();
    let port = f.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
    let protocol = f.next().ok_or_else(malformed)?.to_string();
    let formats = f
        .map(|pt| pt.parse::<u8>().map_err(|_| malformed()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MediaSection {
        kind: kind_raw.parse().ok(),
        kind_raw,
        port,
        protocol,
        formats,
        ..MediaSection::default()
    })
}

fn apply_session_attribute(session: &mut SessionDescription, name: &str, value: Option<&str>) {
    match (name, value) {
        ("ice-ufrag", Some(v)) => session.ice_ufrag = Some(v.to_string()),
        ("ice-pwd", Some(v)) => session.ice_pwd = Some(v.to_string()),
        ("fingerprint", Some(v)) => {
            if let Some((alg, fp)) = v.split_once(' ') {
                session.fingerprint = Some((alg.to_string(), fp.to_string()));
            }
        }
        ("setup", Some(v)) => session.setup = Setup::from_name(v),
        _ => session.attributes.push(SdpAttribute {
            name: name.to_string(),
            value: value.map(str::to_string),
        }),
    }
}

fn apply_media_attribute(
    media: &mut MediaSection,
    name: &str,
    value: Option<&str>,
    line: &str,
) -> Result<(), SdpError> {
    let malformed = |what| SdpError::Malformed {
        what,
        line: line.to_string(),
    };
    match (name, value) {
        ("mid", Some(v)) => media.mid = Some(v.to_string()),
        ("msid", Some(v)) => media.msid = Some(v.to_string()),
        ("ice-ufrag", Some(v)) => media.ice_ufrag = Some(v.to_string()),
        ("ice-pwd", Some(v)) => media.ice_pwd = Some(v.to_string()),
        ("rtcp-mux", None) => media.rtcp_mux = true,
        ("end-of-candidates", None) => media.end_of_candidates = true,
        ("fingerprint", Some(v)) => {
            let (alg, fp) = v.split_once(' ').ok_or_else(|| malformed("fingerprint"))?;
            media.fingerprint = Some((alg.to_string(), fp.to_string()));
        }
        ("setup", Some(v)) => {
            media.setup = Some(Setup::from_name(v).ok_or_else(|| malformed("setup"))?);
        }
        ("rtpmap", Some(v)) => {
            let (pt, mapping) = v.split_once(' ').ok_or_else(|| malformed("rtpmap"))?;
            let pt: u8 = pt.parse().map_err(|_| malformed("rtpmap"))?;
            let mut parts = mapping.split('/');
            let encoding = parts.next().ok_or_else(|| malformed("rtpmap"))?.to_string();
            let clock_rate = parts
                .next()
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| malformed("rtpmap"))?;
            let channels = parts.next().and_then(|c| c.parse().ok());
            media.rtpmaps.insert(
                pt,
                RtpMap {
                    encoding,
                    clock_rate,
                    channels,
                },
            );
        }
        ("fmtp", Some(v)) => {
            let (pt, params) = v.split_once(' ').ok_or_else(|| malformed("fmtp"))?;
            let pt: u8 = pt.parse().map_err(|_| malformed("fmtp"))?;
            media.fmtps.insert(pt, params.to_string());
        }
        ("candidate", Some(v)) => {
            let candidate: Candidate = format!("candidate:{v}")
                .parse()
                .map_err(|_| malformed("candidate"))?;
            media.candidates.push(candidate);
        }
        ("ssrc", Some(v)) => {
            let (id, rest) = v.split_once(' ').ok_or_else(|| malformed("ssrc"))?;
            let id: u32 = id.parse().map_err(|_| malformed("ssrc"))?;
            media.ssrcs.push((id, rest.to_string()));
        }
        (direction, None) if Direction::from_name(direction).is_some() => {
            media.direction = Direction::from_name(direction);
        }
        _ => media.attributes.push(SdpAttribute {
            name: name.to_string(),
            value: value.map(str::to_string),
        }),
    }
    Ok(())
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(f, "o={}\r\n", self.origin)?;
        write!(f, "s={}\r\n", self.name)?;
        if let Some(info) = &self.info {
            write!(f, "i={info}\r\n")?;
        }
        if let Some(uri) = &self.uri {
            write!(f, "u={uri}\r\n")?;
        }
        if let Some(email) = &self.email {
            write!(f, "e={email}\r\n")?;
        }
        if let Some(phone) = &self.phone {
            write!(f, "p={phone}\r\n")?;
        }
        if let Some(connection) = &self.connection {
            write!(f, "c={connection}\r\n")?;
        }
        write!(f, "t={} {}\r\n", self.timing.0, self.timing.1)?;
        if let Some(ufrag) = &self.ice_ufrag {
            write!(f, "a=ice-ufrag:{ufrag}\r\n")?;
        }
        if let Some(pwd) = &self.ice_pwd {
            write!(f, "a=ice-pwd:{pwd}\r\n")?;
        }
        if let Some((alg, fp)) = &self.fingerprint {
            write!(f, "a=fingerprint:{alg} {fp}\r\n")?;
        }
        if let Some(setup) = self.setup {
            write!(f, "a=setup:{}\r\n", setup.name())?;
        }
        for attr in &self.attributes {
            write_attribute(f, attr)?;
        }
        for media in &self.media {
            write!(f, "{media}")?;
        }
        Ok(())
    }
}

impl fmt::Display for MediaSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {} {}", self.kind_raw, self.port, self.protocol)?;
        for pt in &self.formats {
            write!(f, " {pt}")?;
        }
        write!(f, "\r\n")?;
        if let Some(connection) = &self.connection {
            write!(f, "c={connection}\r\n")?;
        }
        if let Some(bandwidth) = &self.bandwidth {
            write!(f, "b={bandwidth}\r\n")?;
        }
        if let Some(mid) = &self.mid {
            write!(f, "a=mid:{mid}\r\n")?;
        }
        if let Some(ufrag) = &self.ice_ufrag {
            write!(f, "a=ice-ufrag:{ufrag}\r\n")?;
        }
        if let Some(pwd) = &self.ice_pwd {
            write!(f, "a=ice-pwd:{pwd}\r\n")?;
        }
        if let Some((alg, fp)) = &self.fingerprint {
            write!(f, "a=fingerprint:{alg} {fp}\r\n")?;
        }
        if let Some(setup) = self.setup {
            write!(f, "a=setup:{}\r\n", setup.name())?;
        }
        if let Some(direction) = self.direction {
            write!(f, "a={}\r\n", direction.name())?;
        }
        if self.rtcp_mux {
            write!(f, "a=rtcp-mux\r\n")?;
        }
        if let Some(msid) = &self.msid {
            write!(f, "a=msid:{msid}\r\n")?;
        }
        for (pt, map) in &self.rtpmaps {
            write!(f, "a=rtpmap:{pt} {}/{}", map.encoding, map.clock_rate)?;
            if let Some(channels) = map.channels {
                write!(f, "/{channels}")?;
            }
            write!(f, "\r\n")?;
        }
        for (pt, params) in &self.fmtps {
            write!(f, "a=fmtp:{pt} {params}\r\n")?;
        }
        for (id, rest) in &self.ssrcs {
            write!(f, "a=ssrc:{id} {rest}\r\n")?;
        }
        for candidate in &self.candidates {
            write!(f, "a={candidate}\r\n")?;
        }
        if self.end_of_candidates {
            write!(f, "a=end-of-candidates\r\n")?;
        }
        for attr in &self.attributes {
            write_attribute(f, attr)?;
        }
        Ok(())
    }
}

fn write_attribute(f: &mut fmt::Formatter<'_>, attr: &SdpAttribute) -> fmt::Result {
    match &attr.value {
        Some(value) => write!(f, "a={}:{value}\r\n", attr.name),
        None => write!(f, "a={}\r\n", attr.name),
    }
}

/// Inputs for composing the camera endpoint's answer.
pub struct AnswerParams<'a> {
    pub ufrag: &'a str,
    pub pwd: &'a str,
    /// SHA-256 certificate fingerprint (colon-separated hex).
    pub fingerprint: &'a str,
    /// Our `a=setup` role: `active` against the usual actpass offer,
    /// `passive` when the offerer claimed `active` itself.
    pub setup: Setup,
    pub cname: &'a str,
    pub msid: &'a str,
    pub video_ssrc: u32,
    /// Present when audio is enabled and a source provides Opus.
    pub audio_ssrc: Option<u32>,
    /// `sprop-parameter-sets` value, when the source already knows its
    /// SPS/PPS.
    pub sprop_parameter_sets: Option<String>,
}

/// Compose the `a=setup:active`, `a=sendonly`, rtcp-muxed answer to a
/// browser offer. Every offered section is answered; sections this
/// endpoint cannot serve are rejected with port 0 (their mid preserved for
/// the bundle).
pub fn compose_answer(
    offer: &SessionDescription,
    params: &AnswerParams<'_>,
) -> Result<SessionDescription, SdpError> {
    let video = offer
        .first_media(MediaKind::Video)
        .ok_or(SdpError::NoUsableMedia("video"))?;
    video.h264_format().ok_or(SdpError::NoUsableMedia("H264 video"))?;

    let mut answer = SessionDescription {
        version: 0,
        origin: Origin {
            username: "-".to_string(),
            session_id: rand::thread_rng().r#gen::<u32>().to_string(),
            session_version: 2,
            network_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            address: "127.0.0.1".to_string(),
        },
        name: "-".to_string(),
        info: None,
        uri: None,
        email: None,
        phone: None,
        connection: None,
        timing: (0, 0),
        ice_ufrag: None,
        ice_pwd: None,
        fingerprint: None,
        setup: None,
        attributes: Vec::new(),
        media: Vec::new(),
    };

    let mut accepted_mids = Vec::new();
    for offered in &offer.media {
        let section = match offered.kind {
            Some(MediaKind::Video) if std::ptr::eq(offered, video) => {
                let pt = video.h264_format().expect("checked above");
                let mut section = answer_section(offered, params);
                section.formats = vec![pt];
                section.direction = Some(Direction::SendOnly);
                section.rtpmaps.insert(
                    pt,
                    RtpMap {
                        encoding: "H264".to_string(),
                        clock_rate: 90_000,
                        channels: None,
                    },
                );
                section.fmtps.insert(pt, video_fmtp(offered, pt, params));
                section
                    .ssrcs
                    .push((params.video_ssrc, format!("cname:{}", params.cname)));
                section
                    .ssrcs
                    .push((params.video_ssrc, format!("msid:{} video", params.msid)));
                section.msid = Some(format!("{} video", params.msid));
                section
            }
            Some(MediaKind::Audio) if params.audio_ssrc.is_some() => {
                let Some(pt) = offered.find_format("opus", 48_000) else {
                    // Offer carries audio this endpoint cannot produce
                    answer.media.push(rejected_section(offered));
                    continue;
                };
                let ssrc = params.audio_ssrc.expect("guarded by arm");
                let mut section = answer_section(offered, params);
                section.formats = vec![pt];
                section.direction = Some(Direction::SendOnly);
                section.rtpmaps.insert(
                    pt,
                    RtpMap {
                        encoding: "opus".to_string(),
                        clock_rate: 48_000,
                        channels: Some(2),
                    },
                );
                if let Some(fmtp) = offered.fmtps.get(&pt) {
                    section.fmtps.insert(pt, fmtp.clone());
                }
                section.ssrcs.push((ssrc, format!("cname:{}", params.cname)));
                section
            }
            _ => rejected_section(offered),
        };
        if section.port != 0 && let Some(mid) = &section.mid {
            accepted_mids.push(mid.clone());
        }
        answer.media.push(section);
    }

    // Echo the bundle group when the offer had one
    if offer.attributes.iter().any(|a| a.name == "group") && !accepted_mids.is_empty() {
        answer.attributes.push(SdpAttribute {
            name: "group".to_string(),
            value: Some(format!("BUNDLE {}", accepted_mids.join(" "))),
        });
    }

    Ok(answer)
}

fn answer_section(offered: &MediaSection, params: &AnswerParams<'_>) -> MediaSection {
    MediaSection {
        kind: offered.kind,
        kind_raw: offered.kind_raw.clone(),
        port: 9,
        protocol: offered.protocol.clone(),
        connection: Some("IN IP4 0.0.0.0".to_string()),
        mid: offered.mid.clone(),
        rtcp_mux: true,
        ice_ufrag: Some(params.ufrag.to_string()),
        ice_pwd: Some(params.pwd.to_string()),
        fingerprint: Some(("sha-256".to_string(), params.fingerprint.to_string())),
        setup: Some(params.setup),
        ..MediaSection::default()
    }
}

fn rejected_section(offered: &MediaSection) -> MediaSection {
    MediaSection {
        kind: offered.kind,
        kind_raw: offered.kind_raw.clone(),
        port: 0,
        protocol: offered.protocol.clone(),
        formats: offered.formats.clone(),
        mid: offered.mid.clone(),
        ..MediaSection::default()
    }
}

fn video_fmtp(offered: &MediaSection, pt: u8, params: &AnswerParams<'_>) -> String {
    let offered_params = offered
        .fmtps
        .get(&pt)
        .map(|f| H264FormatParams::parse(f))
        .unwrap_or_default();
    let profile = offered_params
        .profile_level_id
        .unwrap_or_else(|| "42e01f".to_string());
    let mut fmtp =
        format!("level-asymmetry-allowed=1;packetization-mode=1;profile-level-id={profile}");
    if let Some(sprop) = &params.sprop_parameter_sets {
        fmtp.push_str(";sprop-parameter-sets=");
        fmtp.push_str(sprop);
    }
    fmtp
}
