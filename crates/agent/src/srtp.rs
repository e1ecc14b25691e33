//! Outbound SRTP transform: AES-128-CM encryption with an 80-bit
//! HMAC-SHA1 authentication tag (RFC 3711), keyed from DTLS-SRTP exporter
//! material (RFC 5764).

use aes::Aes128;
use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::dtls::DtlsRole;
use crate::rtp::RTP_HEADER_LEN;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const MASTER_KEY_LEN: usize = 16;
pub const MASTER_SALT_LEN: usize = 14;
/// Total exporter output: two keys + two salts.
pub const KEY_MATERIAL_LEN: usize = 2 * MASTER_KEY_LEN + 2 * MASTER_SALT_LEN;
pub const AUTH_TAG_LEN: usize = 10;

const LABEL_RTP_ENCRYPTION: u8 = 0x00;
const LABEL_RTP_AUTH: u8 = 0x01;
const LABEL_RTP_SALT: u8 = 0x02;

#[derive(Debug, thiserror::Error)]
pub enum SrtpError {
    #[error("packet shorter than an RTP header")]
    PacketTooShort,
    #[error("exporter block has wrong length: {0}")]
    BadKeyMaterial(usize),
}

/// Master keys and salts as laid out by the "EXTRACTOR-dtls_srtp" exporter
/// (RFC 5764 §4.2): client key, server key, client salt, server salt.
#[derive(Clone)]
pub struct SrtpKeyMaterial {
    pub client_key: [u8; MASTER_KEY_LEN],
    pub server_key: [u8; MASTER_KEY_LEN],
    pub client_salt: [u8; MASTER_SALT_LEN],
    pub server_salt: [u8; MASTER_SALT_LEN],
}

impl SrtpKeyMaterial {
    pub fn from_dtls_export(block: &[u8]) -> Result<Self, SrtpError> {
        if block.len() != KEY_MATERIAL_LEN {
            return Err(SrtpError::BadKeyMaterial(block.len()));
        }
        let mut material = SrtpKeyMaterial {
            client_key: [0; MASTER_KEY_LEN],
            server_key: [0; MASTER_KEY_LEN],
            client_salt: [0; MASTER_SALT_LEN],
            server_salt: [0; MASTER_SALT_LEN],
        };
        material.client_key.copy_from_slice(&block[..16]);
        material.server_key.copy_from_slice(&block[16..32]);
        material.client_salt.copy_from_slice(&block[32..46]);
        material.server_salt.copy_from_slice(&block[46..60]);
        Ok(material)
    }
}

/// Per-direction SRTP context holding derived session keys and the
/// rollover counter.
pub struct SrtpContext {
    session_key: [u8; MASTER_KEY_LEN],
    session_salt: [u8; MASTER_SALT_LEN],
    auth_key: [u8; 20],
    roc: u32,
    last_seq: Option<u16>,
}

impl SrtpContext {
    /// Build the outbound context: the DTLS client protects with the client
    /// write keys, the server with the server write keys.
    pub fn new_outbound(material: &SrtpKeyMaterial, role: DtlsRole) -> Self {
        let (master_key, master_salt) = match role {
            DtlsRole::Client => (&material.client_key, &material.client_salt),
            DtlsRole::Server => (&material.server_key, &material.server_salt),
        };
        let mut session_key = [0u8; MASTER_KEY_LEN];
        derive(master_key, master_salt, LABEL_RTP_ENCRYPTION, &mut session_key);
        let mut auth_key = [0u8; 20];
        derive(master_key, master_salt, LABEL_RTP_AUTH, &mut auth_key);
        let mut session_salt = [0u8; MASTER_SALT_LEN];
        derive(master_key, master_salt, LABEL_RTP_SALT, &mut session_salt);
        Self {
            session_key,
            session_salt,
            auth_key,
            roc: 0,
            last_seq: None,
        }
    }

    /// Encrypt an RTP packet in place and append the authentication tag.
    /// The header (including CSRCs) stays in the clear.
    pub fn protect(&mut self, packet: &[u8]) -> Result<Vec<u8>, SrtpError> {
        if packet.len() < RTP_HEADER_LEN {
            return Err(SrtpError::PacketTooShort);
        }
        let csrc_count = (packet[0] & 0x0F) as usize;
        let header_len = RTP_HEADER_LEN + csrc_count * 4;
        if packet.len() < header_len {
            return Err(SrtpError::PacketTooShort);
        }

        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        if let Some(last) = self.last_seq
            && seq < last
            && last - seq > 0x8000
        {
            self.roc = self.roc.wrapping_add(1);
        }
        self.last_seq = Some(seq);
        let index = ((self.roc as u64) << 16) | seq as u64;

        let mut out = Vec::with_capacity(packet.len() + AUTH_TAG_LEN);
        out.extend_from_slice(packet);
        let iv = self.packet_iv(ssrc, index);
        let mut cipher = Aes128Ctr::new((&self.session_key).into(), (&iv).into());
        cipher.apply_keystream(&mut out[header_len..]);

        // Tag covers the encrypted packet plus the rollover counter.
        let mut mac = Hmac::<Sha1>::new_from_slice(&self.auth_key)
            .expect("hmac accepts any key length");
        mac.update(&out);
        mac.update(&self.roc.to_be_bytes());
        let tag = mac.finalize().into_bytes();
        out.extend_from_slice(&tag[..AUTH_TAG_LEN]);
        Ok(out)
    }

    #[cfg(test)]
    fn rollover_count(&self) -> u32 {
        self.roc
    }
}

/// RFC 3711 §4.1.1 per-packet IV:
/// (salt << 16) XOR (ssrc << 64) XOR (index << 16).
impl SrtpContext {
    fn packet_iv(&self, ssrc: u32, index: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..MASTER_SALT_LEN].copy_from_slice(&self.session_salt);
        for (i, b) in ssrc.to_be_bytes().into_iter().enumerate() {
            iv[4 + i] ^= b;
        }
        // index << 16 occupies the 48 bits ending two bytes before the tail
        for (i, b) in index.to_be_bytes()[2..].iter().enumerate() {
            iv[8 + i] ^= b;
        }
        iv
    }
}

/// RFC 3711 §4.3 key derivation with kdr = 0: for each label, the AES-CM
/// keystream under the master key at IV = (salt XOR label-at-byte-7) << 16.
fn derive(master_key: &[u8; 16], master_salt: &[u8; 14], label: u8, out: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(master_salt);
    iv[7] ^= label;
    out.fill(0);
    let mut cipher = Aes128Ctr::new(master_key.into(), (&iv).into());
    cipher.apply_keystream(out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_material() -> SrtpKeyMaterial {
        let mut block = [0u8; KEY_MATERIAL_LEN];
        for (i, b) in block.iter_mut().enumerate() {
            *b = i as u8;
        }
        SrtpKeyMaterial::from_dtls_export(&block).unwrap()
    }

    fn sample_packet(seq: u16) -> Vec<u8> {
        let mut packet = vec![
            0x80, 0x66, 0, 0, 0x00, 0x00, 0x30, 0x39, 0xDE, 0xAD, 0xBE, 0xEF,
        ];
        packet[2..4].copy_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&[0x65, 1, 2, 3, 4, 5, 6, 7]);
        packet
    }

    #[test]
    fn export_block_layout() {
        let material = test_material();
        assert_eq!(material.client_key[0], 0);
        assert_eq!(material.server_key[0], 16);
        assert_eq!(material.client_salt[0], 32);
        assert_eq!(material.server_salt[0], 46);
        assert!(matches!(
            SrtpKeyMaterial::from_dtls_export(&[0u8; 10]),
            Err(SrtpError::BadKeyMaterial(10))
        ));
    }

    #[test]
    fn derived_keys_differ_per_label_and_direction() {
        let material = test_material();
        let client = SrtpContext::new_outbound(&material, DtlsRole::Client);
        let server = SrtpContext::new_outbound(&material, DtlsRole::Server);
        assert_ne!(client.session_key, server.session_key);
        assert_ne!(client.session_key[..], client.auth_key[..16]);
        assert_ne!(client.session_key[..14], client.session_salt[..]);
    }

    #[test]
    fn protect_keeps_header_appends_tag() {
        let material = test_material();
        let mut ctx = SrtpContext::new_outbound(&material, DtlsRole::Client);
        let packet = sample_packet(100);
        let protected = ctx.protect(&packet).unwrap();

        assert_eq!(protected.len(), packet.len() + AUTH_TAG_LEN);
        assert_eq!(&protected[..RTP_HEADER_LEN], &packet[..RTP_HEADER_LEN]);
        assert_ne!(&protected[RTP_HEADER_LEN..packet.len()], &packet[RTP_HEADER_LEN..]);
    }

    #[test]
    fn protect_is_deterministic_per_index() {
        let material = test_material();
        let mut a = SrtpContext::new_outbound(&material, DtlsRole::Client);
        let mut b = SrtpContext::new_outbound(&material, DtlsRole::Client);
        let packet = sample_packet(7);
        assert_eq!(a.protect(&packet).unwrap(), b.protect(&packet).unwrap());

        // Same payload at a different sequence produces different ciphertext
        let mut shifted = packet.clone();
        shifted[2..4].copy_from_slice(&8u16.to_be_bytes());
        let pa = a.protect(&shifted).unwrap();
        let pb = b.protect(&packet).unwrap();
        assert_ne!(pa[RTP_HEADER_LEN..pa.len() - AUTH_TAG_LEN], pb[RTP_HEADER_LEN..pb.len() - AUTH_TAG_LEN]);
    }

    #[test]
    fn rollover_counter_increments_on_wrap() {
        let material = test_material();
        let mut ctx = SrtpContext::new_outbound(&material, DtlsRole::Client);
        ctx.protect(&sample_packet(0xFFFE)).unwrap();
        ctx.protect(&sample_packet(0xFFFF)).unwrap();
        assert_eq!(ctx.rollover_count(), 0);
        ctx.protect(&sample_packet(0x0000)).unwrap();
        assert_eq!(ctx.rollover_count(), 1);
        ctx.protect(&sample_packet(0x0001)).unwrap();
        assert_eq!(ctx.rollover_count(), 1);
    }

    #[test]
    fn short_packet_is_rejected() {
        let material = test_material();
        let mut ctx = SrtpContext::new_outbound(&material, DtlsRole::Client);
        assert!(matches!(
            ctx.protect(&[0x80, 0x66, 0, 0]),
            Err(SrtpError::PacketTooShort)
        ));
    }
}
