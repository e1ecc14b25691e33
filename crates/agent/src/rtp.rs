//! RTP packetization: RFC 3550 headers, RFC 6184 H.264 payloads
//! (single NAL / STAP-A / FU-A), and the RFC 7587 Opus payload.

use bytes::Bytes;
use rand::Rng;

use crate::h264::{self, ParameterSets};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;
pub const H264_CLOCK_RATE: u32 = 90_000;
pub const OPUS_CLOCK_RATE: u32 = 48_000;
/// Samples per 20 ms Opus frame at 48 kHz.
pub const OPUS_FRAME_SAMPLES: u32 = 960;

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;
const FU_START_BIT: u8 = 0x80;
const FU_END_BIT: u8 = 0x40;

/// 12-byte fixed header (no CSRCs, no extension on the send path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.push(RTP_VERSION << 6);
        out.push((self.payload_type & 0x7F) | if self.marker { 0x80 } else { 0 });
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
    }

    /// Parse a header, returning it and the payload offset (skips CSRCs).
    pub fn parse(buf: &[u8]) -> Option<(RtpHeader, usize)> {
        if buf.len() < RTP_HEADER_LEN {
            return None;
        }
        if buf[0] >> 6 != RTP_VERSION {
            return None;
        }
        let csrc_count = (buf[0] & 0x0F) as usize;
        let offset = RTP_HEADER_LEN + csrc_count * 4;
        if buf.len() < offset {
            return None;
        }
        Some((
            RtpHeader {
                marker: buf[1] & 0x80 != 0,
                payload_type: buf[1] & 0x7F,
                sequence: u16::from_be_bytes([buf[2], buf[3]]),
                timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
                ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            },
            offset,
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct H264PacketizerConfig {
    /// Largest datagram (header + payload) to emit.
    pub mtu: usize,
    pub payload_type: u8,
    pub ssrc: u32,
    /// Access units per second; fixes the per-frame timestamp step.
    pub framerate: u32,
    /// Prepend SPS/PPS to every IDR access unit, not only after updates.
    pub repeat_parameter_sets: bool,
}

/// Turns H.264 access units (lists of NAL units, no start codes) into RTP
/// packets.
///
/// Policy per NAL: fits in `mtu - 12` -> single NAL packet; otherwise FU-A
/// with the original NAL header type repeated in each FU header. Runs of
/// small NALs are aggregated into STAP-A while the packet stays under the
/// MTU. All packets of one access unit share a timestamp; the last carries
/// the marker bit.
pub struct H264Packetizer {
    config: H264PacketizerConfig,
    sequence: u16,
    timestamp: u32,
    timestamp_step: u32,
    params: ParameterSets,
}

impl H264Packetizer {
    pub fn new(config: H264PacketizerConfig) -> Self {
        let mut rng = rand::thread_rng();
        let timestamp_step =
            ((H264_CLOCK_RATE as f64) / (config.framerate.max(1) as f64)).round() as u32;
        Self {
            config,
            sequence: rng.r#gen(),
            timestamp: rng.r#gen(),
            timestamp_step,
            params: ParameterSets::new(),
        }
    }

    /// Packetize one access unit. Consumes the whole unit even when a NAL
    /// needs fragmenting; the concatenation of the emitted payloads
    /// de-aggregates back to the input NAL sequence.
    pub fn packetize(&mut self, access_unit: &[Bytes]) -> Vec<Vec<u8>> {
        if access_unit.is_empty() {
            return Vec::new();
        }
        for nal in access_unit {
            self.params.observe(nal);
        }

        let nals = self.with_parameter_sets(access_unit);
        let mut packets = Vec::new();

        let max_single = self.config.mtu.saturating_sub(RTP_HEADER_LEN);
        let mut i = 0;
        while i < nals.len() {
            // Try to aggregate a run of small NALs into one STAP-A.
            let mut agg_end = i;
            let mut agg_size = 1; // STAP-A NAL header byte
            while agg_end < nals.len() && agg_size + 2 + nals[agg_end].len() <= max_single {
                agg_size += 2 + nals[agg_end].len();
                agg_end += 1;
            }

            if agg_end - i >= 2 {
                packets.push(self.stap_a_packet(&nals[i..agg_end]));
                i = agg_end;
            } else if nals[i].len() <= max_single {
                packets.push(self.single_nal_packet(&nals[i]));
                i += 1;
            } else {
                self.fu_a_packets(&nals[i], &mut packets);
                i += 1;
            }
        }

        // Marker closes the access unit.
        if let Some(last) = packets.last_mut() {
            last[1] |= 0x80;
        }
        self.timestamp = self.timestamp.wrapping_add(self.timestamp_step);
        packets
    }

    /// Prepend the tracked SPS/PPS ahead of an IDR when the set changed (or
    /// always, when configured to repeat) and the unit does not already
    /// carry its own.
    fn with_parameter_sets(&mut self, access_unit: &[Bytes]) -> Vec<Bytes> {
        let has_idr = access_unit
            .iter()
            .any(|n| h264::nal_type(n) == h264::NAL_TYPE_IDR);
        let has_sps = access_unit
            .iter()
            .any(|n| h264::nal_type(n) == h264::NAL_TYPE_SPS);

        let has_pps = access_unit
            .iter()
            .any(|n| h264::nal_type(n) == h264::NAL_TYPE_PPS);
        let inject = has_idr
            && !has_sps
            && self.params.is_complete()
            && (self.params.updated() || self.config.repeat_parameter_sets);
        // Injection, or a unit carrying the full pair in-band, transmits
        // the current parameter sets.
        if inject || (has_sps && has_pps) {
            self.params.clear_updated();
        }
        if !inject {
            return access_unit.to_vec();
        }

        let mut nals = Vec::with_capacity(access_unit.len() + 2);
        nals.push(self.params.sps.clone().expect("checked complete"));
        nals.push(self.params.pps.clone().expect("checked complete"));
        nals.extend_from_slice(access_unit);
        nals
    }

    fn header(&mut self) -> RtpHeader {
        let header = RtpHeader {
            marker: false,
            payload_type: self.config.payload_type,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.config.ssrc,
        };
        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    fn single_nal_packet(&mut self, nal: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + nal.len());
        self.header().serialize_into(&mut packet);
        packet.extend_from_slice(nal);
        packet
    }

    fn stap_a_packet(&mut self, nals: &[Bytes]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(self.config.mtu);
        self.header().serialize_into(&mut packet);
        // STAP-A header: F=0, NRI = max over the aggregated units, type 24
        let nri = nals.iter().map(|n| n[0] & 0x60).max().unwrap_or(0);
        packet.push(nri | NAL_TYPE_STAP_A);
        for nal in nals {
            packet.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            packet.extend_from_slice(nal);
        }
        packet
    }

    fn fu_a_packets(&mut self, nal: &[u8], packets: &mut Vec<Vec<u8>>) {
        let indicator = (nal[0] & 0x60) | NAL_TYPE_FU_A;
        let nal_type = nal[0] & 0x1F;
        let chunk_size = self.config.mtu.saturating_sub(RTP_HEADER_LEN + 2).max(1);
        let body = &nal[1..];
        let count = body.len().div_ceil(chunk_size);
        for (idx, chunk) in body.chunks(chunk_size).enumerate() {
            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + 2 + chunk.len());
            self.header().serialize_into(&mut packet);
            packet.push(indicator);
            let mut fu_header = nal_type;
            if idx == 0 {
                fu_header |= FU_START_BIT;
            }
            if idx == count - 1 {
                fu_header |= FU_END_BIT;
            }
            packet.push(fu_header);
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }
    }
}

/// RFC 7587: one Opus frame per RTP packet, 48 kHz clock. The marker is set
/// on the first packet after a silent period.
pub struct OpusPacketizer {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    sending: bool,
}

impl OpusPacketizer {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            payload_type,
            ssrc,
            sequence: rng.r#gen(),
            timestamp: rng.r#gen(),
            sending: false,
        }
    }

    pub fn packetize(&mut self, frame: &[u8]) -> Vec<u8> {
        let marker = !self.sending;
        self.sending = true;
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + frame.len());
        RtpHeader {
            marker,
            payload_type: self.payload_type,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        }
        .serialize_into(&mut packet);
        packet.extend_from_slice(frame);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(OPUS_FRAME_SAMPLES);
        packet
    }

    /// Note a gap in the stream so the next packet re-sets the marker.
    pub fn mark_silence(&mut self) {
        self.sending = false;
    }
}

pub fn random_ssrc() -> u32 {
    rand::thread_rng().r#gen()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packetizer(mtu: usize, framerate: u32) -> H264Packetizer {
        H264Packetizer::new(H264PacketizerConfig {
            mtu,
            payload_type: 102,
            ssrc: 0x1234_5678,
            framerate,
            repeat_parameter_sets: false,
        })
    }

    /// Reassemble per RFC 6184: unwrap STAP-A, join FU-A, pass single NALs.
    fn reassemble(packets: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut nals = Vec::new();
        let mut fragment: Option<Vec<u8>> = None;
        for packet in packets {
            let (_, offset) = RtpHeader::parse(packet).unwrap();
            let payload = &packet[offset..];
            match payload[0] & 0x1F {
                NAL_TYPE_STAP_A => {
                    let mut i = 1;
                    while i + 2 <= payload.len() {
                        let size = u16::from_be_bytes([payload[i], payload[i + 1]]) as usize;
                        i += 2;
                        nals.push(payload[i..i + size].to_vec());
                        i += size;
                    }
                }
                NAL_TYPE_FU_A => {
                    let header = payload[1];
                    if header & FU_START_BIT != 0 {
                        let reconstructed = (payload[0] & 0xE0) | (header & 0x1F);
                        fragment = Some(vec![reconstructed]);
                    }
                    if let Some(frag) = fragment.as_mut() {
                        frag.extend_from_slice(&payload[2..]);
                        if header & FU_END_BIT != 0 {
                            nals.push(fragment.take().unwrap());
                        }
                    }
                }
                _ => nals.push(payload.to_vec()),
            }
        }
        nals
    }

    #[test]
    fn idr_fragmentation_layout() {
        let mut p = packetizer(1200, 30);
        let mut nal = vec![0x65u8]; // F=0, NRI=3, type 5 (IDR)
        nal.extend(std::iter::repeat_n(0xAB, 2999));
        assert_eq!(nal.len(), 3000);

        let packets = p.packetize(&[Bytes::from(nal.clone())]);
        // 2999 body bytes in chunks of 1200 - 12 - 2 = 1186
        assert_eq!(packets.len(), 3);

        // First fragment: FU indicator copies NRI, FU header has S=1
        let first = &packets[0];
        assert_eq!(first.len(), 12 + 2 + 1186);
        assert_eq!(first[12], 0x60 | 28);
        assert_eq!(first[13], FU_START_BIT | 5);

        let middle = &packets[1];
        assert_eq!(middle[13], 5);

        let last = &packets[2];
        assert_eq!(last[13], FU_END_BIT | 5);
        // Marker only on the last packet of the access unit
        assert!(last[1] & 0x80 != 0);
        assert!(first[1] & 0x80 == 0);

        // Same timestamp, consecutive sequence numbers
        let headers: Vec<RtpHeader> = packets
            .iter()
            .map(|p| RtpHeader::parse(p).unwrap().0)
            .collect();
        assert!(headers.windows(2).all(|w| w[0].timestamp == w[1].timestamp));
        assert!(headers
            .windows(2)
            .all(|w| w[1].sequence == w[0].sequence.wrapping_add(1)));

        assert_eq!(reassemble(&packets), vec![nal]);
    }

    #[test]
    fn nal_exactly_mtu_minus_header_stays_single() {
        let mut p = packetizer(1200, 30);
        let mut nal = vec![0x61u8];
        nal.extend(std::iter::repeat_n(0x00, 1187)); // total 1188 = 1200 - 12
        let packets = p.packetize(&[Bytes::from(nal.clone())]);
        assert_eq!(packets.len(), 1);
        // Single NAL mode: payload is the NAL itself, no FU prefix
        assert_eq!(&packets[0][12..], &nal[..]);

        // One byte more forces fragmentation
        let mut p = packetizer(1200, 30);
        let mut bigger = nal;
        bigger.push(0xFF);
        let packets = p.packetize(&[Bytes::from(bigger)]);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0][12] & 0x1F, 28);
    }

    #[test]
    fn small_nals_aggregate_into_stap_a() {
        let mut p = packetizer(1200, 30);
        let sps = Bytes::from_static(&[0x67, 0x4d, 0x40, 0x28]);
        let pps = Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80]);
        let slice = Bytes::from_static(&[0x65, 0x88, 0x80, 0x40]);
        let packets = p.packetize(&[sps.clone(), pps.clone(), slice.clone()]);

        assert_eq!(packets.len(), 1);
        let payload = &packets[0][12..];
        assert_eq!(payload[0] & 0x1F, NAL_TYPE_STAP_A);
        // NRI is the max over aggregated NALs (0x60 from SPS/IDR)
        assert_eq!(payload[0] & 0x60, 0x60);

        assert_eq!(
            reassemble(&packets),
            vec![sps.to_vec(), pps.to_vec(), slice.to_vec()]
        );
    }

    #[test]
    fn mixed_unit_reassembles_to_input() {
        let mut p = packetizer(1200, 30);
        let mut big = vec![0x65u8];
        big.extend(std::iter::repeat_n(0x11, 5000));
        let unit = vec![
            Bytes::from_static(&[0x67, 0x4d, 0x40, 0x28]),
            Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80]),
            Bytes::from(big.clone()),
            Bytes::from_static(&[0x61, 0x01, 0x02]),
        ];
        let packets = p.packetize(&unit);
        let nals = reassemble(&packets);
        assert_eq!(nals.len(), 4);
        assert_eq!(nals[2], big);
        // Marker only on the final packet
        let markers: Vec<bool> = packets.iter().map(|p| p[1] & 0x80 != 0).collect();
        assert_eq!(markers.iter().filter(|m| **m).count(), 1);
        assert!(*markers.last().unwrap());
    }

    #[test]
    fn timestamp_advances_per_access_unit() {
        let mut p = packetizer(1200, 30);
        let unit = vec![Bytes::from_static(&[0x61, 0x01])];
        let first = p.packetize(&unit);
        let second = p.packetize(&unit);
        let t1 = RtpHeader::parse(&first[0]).unwrap().0.timestamp;
        let t2 = RtpHeader::parse(&second[0]).unwrap().0.timestamp;
        assert_eq!(t2.wrapping_sub(t1), 3000); // round(90000 / 30)
    }

    #[test]
    fn timestamp_step_rounds() {
        let p = packetizer(1200, 60);
        assert_eq!(p.timestamp_step, 1500);
        let p = packetizer(1200, 24);
        assert_eq!(p.timestamp_step, 3750);
        // 90000/7 = 12857.14... rounds to 12857
        let p = packetizer(1200, 7);
        assert_eq!(p.timestamp_step, 12857);
    }

    #[test]
    fn parameter_sets_injected_before_idr_when_repeating() {
        let mut p = H264Packetizer::new(H264PacketizerConfig {
            mtu: 1200,
            payload_type: 102,
            ssrc: 1,
            framerate: 30,
            repeat_parameter_sets: true,
        });
        let sps = Bytes::from_static(&[0x67, 0x42, 0xe0, 0x1f]);
        let pps = Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]);
        // First unit carries its own parameter sets
        let _ = p.packetize(&[sps.clone(), pps.clone(), Bytes::from_static(&[0x65, 0x01])]);

        // A later bare IDR gets them re-injected
        let packets = p.packetize(&[Bytes::from_static(&[0x65, 0x02])]);
        let nals = reassemble(&packets);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0], sps.to_vec());
        assert_eq!(nals[1], pps.to_vec());
        assert_eq!(nals[2], vec![0x65, 0x02]);

        // Non-IDR units are left alone
        let packets = p.packetize(&[Bytes::from_static(&[0x61, 0x03])]);
        assert_eq!(reassemble(&packets).len(), 1);
    }

    #[test]
    fn updated_parameter_sets_injected_without_repeat_flag() {
        let mut p = packetizer(1200, 30); // repeat_parameter_sets = false
        let sps = Bytes::from_static(&[0x67, 0x42, 0xe0, 0x1f]);
        let pps = Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]);
        let _ = p.packetize(&[sps, pps, Bytes::from_static(&[0x65, 0x01])]);

        // Set unchanged: bare IDR is not decorated
        let packets = p.packetize(&[Bytes::from_static(&[0x65, 0x02])]);
        assert_eq!(reassemble(&packets).len(), 1);

        // New SPS arrives mid-stream, the next bare IDR gets the fresh pair
        let sps2 = Bytes::from_static(&[0x67, 0x4d, 0x40, 0x28]);
        let _ = p.packetize(&[sps2.clone(), Bytes::from_static(&[0x61, 0x03])]);
        let packets = p.packetize(&[Bytes::from_static(&[0x65, 0x04])]);
        let nals = reassemble(&packets);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0], sps2.to_vec());
    }

    #[test]
    fn sequence_wraps_around() {
        let mut p = packetizer(1200, 30);
        p.sequence = u16::MAX;
        let unit = vec![Bytes::from_static(&[0x61, 0x01])];
        let a = p.packetize(&unit);
        let b = p.packetize(&unit);
        assert_eq!(RtpHeader::parse(&a[0]).unwrap().0.sequence, u16::MAX);
        assert_eq!(RtpHeader::parse(&b[0]).unwrap().0.sequence, 0);
    }

    #[test]
    fn opus_frames_are_one_packet_each() {
        let mut p = OpusPacketizer::new(111, 42);
        let a = p.packetize(&[0xF8, 0xFF, 0xFE]);
        let b = p.packetize(&[0xF8, 0x01]);
        let (ha, off) = RtpHeader::parse(&a).unwrap();
        let (hb, _) = RtpHeader::parse(&b).unwrap();
        assert_eq!(&a[off..], &[0xF8, 0xFF, 0xFE]);
        // Marker on the first packet of a talk spurt only
        assert!(ha.marker);
        assert!(!hb.marker);
        assert_eq!(hb.timestamp.wrapping_sub(ha.timestamp), OPUS_FRAME_SAMPLES);

        p.mark_silence();
        let c = p.packetize(&[0xF8]);
        assert!(RtpHeader::parse(&c).unwrap().0.marker);
    }
}
