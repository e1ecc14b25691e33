//! STUN message codec (RFC 5389 subset used by ICE).
//!
//! Header layout (20 bytes, network order):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Transaction ID (96 bits)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//! The body is a TLV attribute stream, each value padded to a 4-byte
//! boundary. MESSAGE-INTEGRITY is an HMAC-SHA1 over the message with the
//! header length rewritten to include the integrity attribute itself;
//! FINGERPRINT is a CRC-32 over the preceding bytes (length rewritten the
//! same way) XORed with 0x5354554e.

use std::net::{IpAddr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LEN: usize = 20;
pub const METHOD_BINDING: u16 = 0x001;

const FINGERPRINT_XOR: u32 = 0x5354_554e;
const INTEGRITY_LEN: usize = 20;
const FINGERPRINT_ATTR_LEN: usize = 8;

pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_UNKNOWN_ATTRIBUTES: u16 = 0x000A;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_PRIORITY: u16 = 0x0024;
pub const ATTR_USE_CANDIDATE: u16 = 0x0025;
pub const ATTR_SOFTWARE: u16 = 0x8022;
pub const ATTR_FINGERPRINT: u16 = 0x8028;
pub const ATTR_ICE_CONTROLLED: u16 = 0x8029;
pub const ATTR_ICE_CONTROLLING: u16 = 0x802A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Request = 0,
    Indication = 1,
    SuccessResponse = 2,
    ErrorResponse = 3,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StunError {
    #[error("attribute 0x{typ:04x}: {detail}")]
    MalformedAttribute { typ: u16, detail: &'static str },
    #[error("unknown comprehension-required attributes {0:?}")]
    UnknownMandatoryAttribute(Vec<u16>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    MappedAddress(SocketAddr),
    Username(String),
    MessageIntegrity([u8; 20]),
    ErrorCode { code: u16, reason: String },
    UnknownAttributes(Vec<u16>),
    XorMappedAddress(SocketAddr),
    Priority(u32),
    UseCandidate,
    Software(String),
    Fingerprint(u32),
    IceControlled(u64),
    IceControlling(u64),
    /// Unrecognized attribute carried verbatim.
    Other { typ: u16, value: Vec<u8> },
}

impl Attribute {
    pub fn typ(&self) -> u16 {
        match self {
            Attribute::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Attribute::Username(_) => ATTR_USERNAME,
            Attribute::MessageIntegrity(_) => ATTR_MESSAGE_INTEGRITY,
            Attribute::ErrorCode { .. } => ATTR_ERROR_CODE,
            Attribute::UnknownAttributes(_) => ATTR_UNKNOWN_ATTRIBUTES,
            Attribute::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Attribute::Priority(_) => ATTR_PRIORITY,
            Attribute::UseCandidate => ATTR_USE_CANDIDATE,
            Attribute::Software(_) => ATTR_SOFTWARE,
            Attribute::Fingerprint(_) => ATTR_FINGERPRINT,
            Attribute::IceControlled(_) => ATTR_ICE_CONTROLLED,
            Attribute::IceControlling(_) => ATTR_ICE_CONTROLLING,
            Attribute::Other { typ, .. } => *typ,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub class: Class,
    pub method: u16,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<Attribute>,
}

impl Message {
    pub fn new(class: Class, method: u16, transaction_id: [u8; 12]) -> Self {
        Self {
            class,
            method,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn binding(class: Class, transaction_id: [u8; 12]) -> Self {
        Self::new(class, METHOD_BINDING, transaction_id)
    }

    pub fn add(&mut self, attr: Attribute) -> &mut Self {
        self.attributes.push(attr);
        self
    }

    /// Serialize to the wire form. MESSAGE-INTEGRITY and FINGERPRINT values
    /// already present are emitted as stored, so parse -> serialize is
    /// byte-identical.
    pub fn serialize(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        for attr in &self.attributes {
            encode_attribute(attr, &self.transaction_id, &mut body);
        }
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        self.write_header(body.len() as u16, &mut out);
        out.extend_from_slice(&body);
        out
    }

    /// Append MESSAGE-INTEGRITY keyed by `password`, computed over the
    /// message with the header length rewritten to include the trailing
    /// 24-byte attribute.
    pub fn add_message_integrity(&mut self, password: &[u8]) {
        let mut body = Vec::with_capacity(64);
        for attr in &self.attributes {
            encode_attribute(attr, &self.transaction_id, &mut body);
        }
        let mut input = Vec::with_capacity(HEADER_LEN + body.len());
        self.write_header((body.len() + 4 + INTEGRITY_LEN) as u16, &mut input);
        input.extend_from_slice(&body);

        let tag = hmac_sha1(password, &input);
        self.attributes.push(Attribute::MessageIntegrity(tag));
    }

    /// Append FINGERPRINT: CRC-32/IEEE over the message (length rewritten to
    /// include the trailing 8 bytes) XORed with 0x5354554e.
    pub fn add_fingerprint(&mut self) {
        let mut body = Vec::with_capacity(64);
        for attr in &self.attributes {
            encode_attribute(attr, &self.transaction_id, &mut body);
        }
        let mut input = Vec::with_capacity(HEADER_LEN + body.len());
        self.write_header((body.len() + FINGERPRINT_ATTR_LEN) as u16, &mut input);
        input.extend_from_slice(&body);

        let crc = crc32fast::hash(&input) ^ FINGERPRINT_XOR;
        self.attributes.push(Attribute::Fingerprint(crc));
    }

    fn write_header(&self, length: u16, out: &mut Vec<u8>) {
        out.extend_from_slice(&encode_type(self.class, self.method).to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(&self.transaction_id);
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Username(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn priority(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Priority(p) => Some(*p),
            _ => None,
        })
    }

    pub fn error_code(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, .. } => Some(*code),
            _ => None,
        })
    }

    pub fn has_use_candidate(&self) -> bool {
        self.attributes.iter().any(|a| matches!(a, Attribute::UseCandidate))
    }

    /// Types of unrecognized attributes in the comprehension-required range
    /// (< 0x8000); reported back in a 420 response.
    pub fn unknown_comprehension_required(&self) -> Vec<u16> {
        self.attributes
            .iter()
            .filter_map(|a| match a {
                Attribute::Other { typ, .. } if *typ < 0x8000 => Some(*typ),
                _ => None,
            })
            .collect()
    }

    /// Err when the message carries comprehension-required attributes this
    /// agent does not implement.
    pub fn require_comprehension(&self) -> Result<(), StunError> {
        let unknown = self.unknown_comprehension_required();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(StunError::UnknownMandatoryAttribute(unknown))
        }
    }
}

/// Quick datagram classification for demultiplexing STUN from media.
pub fn is_stun(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN
        && buf[0] & 0xC0 == 0
        && u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) == MAGIC_COOKIE
}

pub fn random_transaction_id() -> [u8; 12] {
    rand::random()
}

/// Parse a datagram. `Ok(None)` means the buffer is not a STUN message
/// (short, top bits set, length not a multiple of 4, or cookie mismatch);
/// a malformed attribute stream inside a STUN message is an error.
pub fn parse(buf: &[u8]) -> Result<Option<Message>, StunError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    if buf[0] & 0xC0 != 0 {
        return Ok(None);
    }
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if length % 4 != 0 {
        return Ok(None);
    }
    if u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) != MAGIC_COOKIE {
        return Ok(None);
    }

    let raw_type = u16::from_be_bytes([buf[0], buf[1]]);
    let (class, method) = decode_type(raw_type);
    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&buf[8..20]);

    if buf.len() < HEADER_LEN + length {
        return Err(StunError::MalformedAttribute {
            typ: 0,
            detail: "declared length exceeds datagram",
        });
    }

    let mut attributes = Vec::new();
    let body = &buf[HEADER_LEN..HEADER_LEN + length];
    let mut off = 0;
    while off < body.len() {
        if off + 4 > body.len() {
            return Err(StunError::MalformedAttribute {
                typ: 0,
                detail: "truncated attribute header",
            });
        }
        let typ = u16::from_be_bytes([body[off], body[off + 1]]);
        let len = u16::from_be_bytes([body[off + 2], body[off + 3]]) as usize;
        let value_start = off + 4;
        if value_start + len > body.len() {
            return Err(StunError::MalformedAttribute {
                typ,
                detail: "length exceeds remaining buffer",
            });
        }
        let value = &body[value_start..value_start + len];
        attributes.push(decode_attribute(typ, value, &transaction_id)?);
        off = value_start + len + pad4(len);
    }

    Ok(Some(Message {
        class,
        method,
        transaction_id,
        attributes,
    }))
}

/// Recompute the HMAC over `raw` up to its MESSAGE-INTEGRITY attribute and
/// compare. `false` when the attribute is absent or the tag differs.
pub fn validate_message_integrity(raw: &[u8], password: &[u8]) -> bool {
    let Some((off, value)) = find_attribute(raw, ATTR_MESSAGE_INTEGRITY) else {
        return false;
    };
    if value.len() != INTEGRITY_LEN {
        return false;
    }
    let mut input = raw[..off].to_vec();
    let rewritten = (off - HEADER_LEN + 4 + INTEGRITY_LEN) as u16;
    input[2..4].copy_from_slice(&rewritten.to_be_bytes());
    hmac_sha1(password, &input)[..] == value[..]
}

/// Recompute the fingerprint CRC over `raw` up to its FINGERPRINT attribute
/// and compare.
pub fn validate_fingerprint(raw: &[u8]) -> bool {
    let Some((off, value)) = find_attribute(raw, ATTR_FINGERPRINT) else {
        return false;
    };
    if value.len() != 4 {
        return false;
    }
    let mut input = raw[..off].to_vec();
    let rewritten = (off - HEADER_LEN + FINGERPRINT_ATTR_LEN) as u16;
    input[2..4].copy_from_slice(&rewritten.to_be_bytes());
    let expected = crc32fast::hash(&input) ^ FINGERPRINT_XOR;
    u32::from_be_bytes([value[0], value[1], value[2], value[3]]) == expected
}

/// Walk the raw attribute stream for `wanted`; returns (offset of the
/// attribute's TLV header, value slice).
fn find_attribute(raw: &[u8], wanted: u16) -> Option<(usize, &[u8])> {
    if !is_stun(raw) {
        return None;
    }
    let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    let end = (HEADER_LEN + length).min(raw.len());
    let mut off = HEADER_LEN;
    while off + 4 <= end {
        let typ = u16::from_be_bytes([raw[off], raw[off + 1]]);
        let len = u16::from_be_bytes([raw[off + 2], raw[off + 3]]) as usize;
        if off + 4 + len > end {
            return None;
        }
        if typ == wanted {
            return Some((off, &raw[off + 4..off + 4 + len]));
        }
        off += 4 + len + pad4(len);
    }
    None
}

/// RFC 5389 §6: class bits sit at positions 4 and 8 of the 14-bit type,
/// with the method bits interleaved around them.
fn encode_type(class: Class, method: u16) -> u16 {
    let c = class as u16;
    ((method & 0x1F80) << 2)
        | ((method & 0x0070) << 1)
        | (method & 0x000F)
        | ((c & 0x2) << 7)
        | ((c & 0x1) << 4)
}

fn decode_type(raw: u16) -> (Class, u16) {
    let class = match ((raw >> 7) & 0x2) | ((raw >> 4) & 0x1) {
        0 => Class::Request,
        1 => Class::Indication,
        2 => Class::SuccessResponse,
        _ => Class::ErrorResponse,
    };
    let method = ((raw >> 2) & 0x1F80) | ((raw >> 1) & 0x0070) | (raw & 0x000F);
    (class, method)
}

fn pad4(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn hmac_sha1(key: &[u8], input: &[u8]) -> [u8; 20] {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(input);
    mac.finalize().into_bytes().into()
}

fn encode_attribute(attr: &Attribute, transaction_id: &[u8; 12], out: &mut Vec<u8>) {
    let mut value = Vec::with_capacity(32);
    match attr {
        Attribute::MappedAddress(addr) => encode_address(*addr, None, &mut value),
        Attribute::XorMappedAddress(addr) => {
            encode_address(*addr, Some(transaction_id), &mut value)
        }
        Attribute::Username(name) => value.extend_from_slice(name.as_bytes()),
        Attribute::Software(software) => value.extend_from_slice(software.as_bytes()),
        Attribute::MessageIntegrity(tag) => value.extend_from_slice(tag),
        Attribute::Fingerprint(crc) => value.extend_from_slice(&crc.to_be_bytes()),
        Attribute::Priority(p) => value.extend_from_slice(&p.to_be_bytes()),
        Attribute::UseCandidate => {}
        Attribute::IceControlled(tie) => value.extend_from_slice(&tie.to_be_bytes()),
        Attribute::IceControlling(tie) => value.extend_from_slice(&tie.to_be_bytes()),
        Attribute::ErrorCode { code, reason } => {
            value.extend_from_slice(&[0, 0, (code / 100) as u8, (code % 100) as u8]);
            value.extend_from_slice(reason.as_bytes());
        }
        Attribute::UnknownAttributes(types) => {
            for t in types {
                value.extend_from_slice(&t.to_be_bytes());
            }
        }
        Attribute::Other { value: raw, .. } => value.extend_from_slice(raw),
    }

    out.extend_from_slice(&attr.typ().to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(&value);
    out.extend(std::iter::repeat_n(0u8, pad4(value.len())));
}

fn encode_address(addr: SocketAddr, xor: Option<&[u8; 12]>, out: &mut Vec<u8>) {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let port = match xor {
        Some(_) => addr.port() ^ (MAGIC_COOKIE >> 16) as u16,
        None => addr.port(),
    };
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(0);
            out.push(0x01);
            out.extend_from_slice(&port.to_be_bytes());
            let mut octets = ip.octets();
            if xor.is_some() {
                for (b, c) in octets.iter_mut().zip(cookie) {
                    *b ^= c;
                }
            }
            out.extend_from_slice(&octets);
        }
        IpAddr::V6(ip) => {
            out.push(0);
            out.push(0x02);
            out.extend_from_slice(&port.to_be_bytes());
            let mut octets = ip.octets();
            if let Some(txid) = xor {
                let mask: Vec<u8> = cookie.iter().chain(txid.iter()).copied().collect();
                for (b, m) in octets.iter_mut().zip(mask) {
                    *b ^= m;
                }
            }
            out.extend_from_slice(&octets);
        }
    }
}

fn decode_address(
    typ: u16,
    value: &[u8],
    xor: Option<&[u8; 12]>,
) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::MalformedAttribute {
            typ,
            detail: "address attribute too short",
        });
    }
    let family = value[1];
    let raw_port = u16::from_be_bytes([value[2], value[3]]);
    let port = match xor {
        Some(_) => raw_port ^ (MAGIC_COOKIE >> 16) as u16,
        None => raw_port,
    };
    let cookie = MAGIC_COOKIE.to_be_bytes();
    match family {
        0x01 => {
            if value.len() != 8 {
                return Err(StunError::MalformedAttribute {
                    typ,
                    detail: "bad IPv4 address length",
                });
            }
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xor.is_some() {
                for (b, c) in octets.iter_mut().zip(cookie) {
                    *b ^= c;
                }
            }
            Ok(SocketAddr::new(IpAddr::from(octets), port))
        }
        0x02 => {
            if value.len() != 20 {
                return Err(StunError::MalformedAttribute {
                    typ,
                    detail: "bad IPv6 address length",
                });
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(txid) = xor {
                let mask: Vec<u8> = cookie.iter().chain(txid.iter()).copied().collect();
                for (b, m) in octets.iter_mut().zip(mask) {
                    *b ^= m;
                }
            }
            Ok(SocketAddr::new(IpAddr::from(octets), port))
        }
        _ => Err(StunError::MalformedAttribute {
            typ,
            detail: "unknown address family",
        }),
    }
}

fn decode_attribute(
    typ: u16,
    value: &[u8],
    transaction_id: &[u8; 12],
) -> Result<Attribute, StunError> {
    let fixed = |typ: u16, want: usize, got: usize| -> Result<(), StunError> {
        if want != got {
            Err(StunError::MalformedAttribute {
                typ,
                detail: "unexpected value length",
            })
        } else {
            Ok(())
        }
    };
    let attr = match typ {
        ATTR_MAPPED_ADDRESS => Attribute::MappedAddress(decode_address(typ, value, None)?),
        ATTR_XOR_MAPPED_ADDRESS => {
            Attribute::XorMappedAddress(decode_address(typ, value, Some(transaction_id))?)
        }
        ATTR_USERNAME => Attribute::Username(
            String::from_utf8(value.to_vec()).map_err(|_| StunError::MalformedAttribute {
                typ,
                detail: "username is not UTF-8",
            })?,
        ),
        ATTR_SOFTWARE => Attribute::Software(String::from_utf8_lossy(value).into_owned()),
        ATTR_MESSAGE_INTEGRITY => {
            fixed(typ, INTEGRITY_LEN, value.len())?;
            let mut tag = [0u8; 20];
            tag.copy_from_slice(value);
            Attribute::MessageIntegrity(tag)
        }
        ATTR_FINGERPRINT => {
            fixed(typ, 4, value.len())?;
            Attribute::Fingerprint(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
        }
        ATTR_PRIORITY => {
            fixed(typ, 4, value.len())?;
            Attribute::Priority(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
        }
        ATTR_USE_CANDIDATE => {
            fixed(typ, 0, value.len())?;
            Attribute::UseCandidate
        }
        ATTR_ICE_CONTROLLED | ATTR_ICE_CONTROLLING => {
            fixed(typ, 8, value.len())?;
            let mut tie = [0u8; 8];
            tie.copy_from_slice(value);
            let tie = u64::from_be_bytes(tie);
            if typ == ATTR_ICE_CONTROLLED {
                Attribute::IceControlled(tie)
            } else {
                Attribute::IceControlling(tie)
            }
        }
        ATTR_ERROR_CODE => {
            if value.len() < 4 {
                return Err(StunError::MalformedAttribute {
                    typ,
                    detail: "error code too short",
                });
            }
            let code = (value[2] & 0x7) as u16 * 100 + value[3] as u16;
            Attribute::ErrorCode {
                code,
                reason: String::from_utf8_lossy(&value[4..]).into_owned(),
            }
        }
        ATTR_UNKNOWN_ATTRIBUTES => {
            if value.len() % 2 != 0 {
                return Err(StunError::MalformedAttribute {
                    typ,
                    detail: "odd unknown-attributes length",
                });
            }
            Attribute::UnknownAttributes(
                value
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect(),
            )
        }
        _ => Attribute::Other {
            typ,
            value: value.to_vec(),
        },
    };
    Ok(attr)
}
