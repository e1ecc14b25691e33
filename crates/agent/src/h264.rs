//! H.264 Annex B bitstream utilities.
//!
//! NAL unit extraction, access-unit grouping, IDR detection, and SPS/PPS
//! tracking for the RTP packetizer and the SDP answer.

use base64::Engine;
use bytes::Bytes;

pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;

/// NAL unit type from the header byte.
pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1F).unwrap_or(0)
}

/// Coded-slice NAL types (1..=5) close an access unit.
pub fn is_vcl(typ: u8) -> bool {
    (1..=5).contains(&typ)
}

/// Check whether an Annex B chunk contains an IDR slice (NAL type 5).
pub fn contains_idr(data: &[u8]) -> bool {
    extract_nals(data).iter().any(|n| nal_type(n) == NAL_TYPE_IDR)
}

/// Extract NAL units (header byte included, start codes stripped) from an
/// Annex B byte stream. Handles both 3- and 4-byte start codes.
pub fn extract_nals(data: &[u8]) -> Vec<Bytes> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push(i + 4);
                i += 4;
                continue;
            } else if data[i + 2] == 1 {
                starts.push(i + 3);
                i += 3;
                continue;
            }
        }
        i += 1;
    }

    let data = Bytes::copy_from_slice(data);
    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        if start >= data.len() {
            continue;
        }
        let end = if idx + 1 < starts.len() {
            let next = starts[idx + 1];
            // Back up past the next NAL's start code (3 or 4 bytes)
            if next >= 4
                && data[next - 4] == 0
                && data[next - 3] == 0
                && data[next - 2] == 0
                && data[next - 1] == 1
            {
                next - 4
            } else {
                next - 3
            }
        } else {
            data.len()
        };
        if end > start {
            nals.push(data.slice(start..end));
        }
    }
    nals
}

/// Serialize NAL units back to Annex B with 4-byte start codes.
pub fn to_annex_b(nals: &[Bytes]) -> Vec<u8> {
    let total: usize = nals.iter().map(|n| 4 + n.len()).sum();
    let mut out = Vec::with_capacity(total);
    for nal in nals {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nal);
    }
    out
}

/// Incremental Annex B splitter for a streaming reader.
///
/// Bytes go in via `push`; complete NAL units come out of `pop`. A NAL is
/// complete once the next start code arrives; `finish` flushes the trailing
/// unit at end of input.
#[derive(Default)]
pub struct AnnexBScanner {
    buf: Vec<u8>,
    /// Offset of the first byte after the last seen start code, if any.
    nal_start: Option<usize>,
    scan_pos: usize,
}

impl AnnexBScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete NAL unit, if one is delimited.
    pub fn pop(&mut self) -> Option<Bytes> {
        loop {
            let (code_at, code_len) = self.find_start_code(self.scan_pos)?;
            match self.nal_start {
                None => {
                    // First start code: discard any leading garbage.
                    self.nal_start = Some(code_at + code_len);
                    self.scan_pos = code_at + code_len;
                }
                Some(start) => {
                    let nal = Bytes::copy_from_slice(&self.buf[start..code_at]);
                    let rest_start = code_at + code_len;
                    self.buf.drain(..rest_start);
                    self.nal_start = Some(0);
                    self.scan_pos = 0;
                    if nal.is_empty() {
                        continue;
                    }
                    return Some(nal);
                }
            }
        }
    }

    /// Flush the trailing NAL at end of input.
    pub fn finish(&mut self) -> Option<Bytes> {
        let start = self.nal_start.take()?;
        let nal = Bytes::copy_from_slice(&self.buf[start..]);
        self.buf.clear();
        self.scan_pos = 0;
        (!nal.is_empty()).then_some(nal)
    }

    fn find_start_code(&mut self, from: usize) -> Option<(usize, usize)> {
        let buf = &self.buf;
        let mut i = from;
        while i + 2 < buf.len() {
            if buf[i] == 0 && buf[i + 1] == 0 {
                if buf[i + 2] == 1 {
                    return Some((i, 3));
                }
                if i + 3 < buf.len() && buf[i + 2] == 0 && buf[i + 3] == 1 {
                    return Some((i, 4));
                }
            }
            i += 1;
        }
        // Keep the scan position just behind the tail so a start code split
        // across pushes is still found.
        self.scan_pos = buf.len().saturating_sub(3).max(from);
        None
    }
}

/// Groups NAL units into access units: non-VCL units (SPS, PPS, SEI, AUD)
/// attach to the following coded slice, and the slice closes the unit.
#[derive(Default)]
pub struct AccessUnitAssembler {
    pending: Vec<Bytes>,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one NAL; returns a complete access unit when one closes.
    pub fn push(&mut self, nal: Bytes) -> Option<Vec<Bytes>> {
        let typ = nal_type(&nal);
        self.pending.push(nal);
        is_vcl(typ).then(|| std::mem::take(&mut self.pending))
    }

    /// Flush whatever is pending (end of stream).
    pub fn finish(&mut self) -> Option<Vec<Bytes>> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }
}

/// Last-seen SPS/PPS pair, with a dirty flag for key-frame injection.
#[derive(Default, Clone)]
pub struct ParameterSets {
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
    updated: bool,
}

impl ParameterSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a NAL; captures SPS/PPS and marks the set updated when the
    /// bytes actually change.
    pub fn observe(&mut self, nal: &Bytes) {
        match nal_type(nal) {
            NAL_TYPE_SPS => {
                if self.sps.as_ref() != Some(nal) {
                    self.sps = Some(nal.clone());
                    self.updated = true;
                }
            }
            NAL_TYPE_PPS => {
                if self.pps.as_ref() != Some(nal) {
                    self.pps = Some(nal.clone());
                    self.updated = true;
                }
            }
            _ => {}
        }
    }

    /// True when both sets are known and at least one changed since the last
    /// `clear_updated`.
    pub fn updated(&self) -> bool {
        self.updated && self.sps.is_some() && self.pps.is_some()
    }

    /// Mark the current pair as transmitted.
    pub fn clear_updated(&mut self) {
        self.updated = false;
    }

    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// `sprop-parameter-sets` fmtp value: base64(SPS),base64(PPS).
    pub fn sprop_parameter_sets(&self) -> Option<String> {
        let engine = base64::engine::general_purpose::STANDARD;
        match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) => {
                Some(format!("{},{}", engine.encode(sps), engine.encode(pps)))
            }
            _ => None,
        }
    }

    /// `profile-level-id` fmtp value: hex of the three bytes after the SPS
    /// NAL header (profile_idc, constraint flags, level_idc).
    pub fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_ref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x4d, 0x40, 0x28];
    const PPS: &[u8] = &[0x68, 0xEE, 0x3C, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x80, 0x40];
    const SLICE: &[u8] = &[0x61, 0x88, 0x80, 0x40];

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn extract_multiple_nals() {
        let data = annex_b(&[SPS, PPS, IDR]);
        let nals = extract_nals(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nal_type(&nals[0]), NAL_TYPE_SPS);
        assert_eq!(nal_type(&nals[1]), NAL_TYPE_PPS);
        assert_eq!(nal_type(&nals[2]), NAL_TYPE_IDR);
        assert_eq!(&nals[2][..], IDR);
    }

    #[test]
    fn extract_with_3byte_start_codes() {
        let data = [0x00, 0x00, 0x01, 0x67, 0x4d, 0x40, 0x00, 0x00, 0x01, 0x68, 0xEE, 0x3C];
        let nals = extract_nals(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nal_type(&nals[0]), 7);
        assert_eq!(nal_type(&nals[1]), 8);
    }

    #[test]
    fn idr_detection() {
        assert!(contains_idr(&annex_b(&[SPS, PPS, IDR])));
        assert!(!contains_idr(&annex_b(&[SPS, PPS, SLICE])));
        assert!(!contains_idr(&[]));
        assert!(!contains_idr(&[0x00, 0x00, 0x01]));
    }

    #[test]
    fn annex_b_roundtrip() {
        let data = annex_b(&[SPS, PPS, IDR]);
        let nals = extract_nals(&data);
        assert_eq!(to_annex_b(&nals), data);
    }

    #[test]
    fn scanner_splits_across_pushes() {
        let data = annex_b(&[SPS, PPS, IDR]);
        let mut scanner = AnnexBScanner::new();
        let mut nals = Vec::new();
        // Feed one byte at a time to exercise split start codes
        for b in &data {
            scanner.push(std::slice::from_ref(b));
            while let Some(nal) = scanner.pop() {
                nals.push(nal);
            }
        }
        if let Some(nal) = scanner.finish() {
            nals.push(nal);
        }
        assert_eq!(nals.len(), 3);
        assert_eq!(&nals[0][..], SPS);
        assert_eq!(&nals[1][..], PPS);
        assert_eq!(&nals[2][..], IDR);
    }

    #[test]
    fn scanner_discards_leading_garbage() {
        let mut data = vec![0xFF, 0x00, 0x12];
        data.extend_from_slice(&annex_b(&[IDR, SLICE]));
        let mut scanner = AnnexBScanner::new();
        scanner.push(&data);
        let first = scanner.pop().unwrap();
        assert_eq!(&first[..], IDR);
        assert!(scanner.pop().is_none());
        assert_eq!(&scanner.finish().unwrap()[..], SLICE);
    }

    #[test]
    fn assembler_groups_parameter_sets_with_slice() {
        let mut asm = AccessUnitAssembler::new();
        assert!(asm.push(Bytes::from_static(SPS)).is_none());
        assert!(asm.push(Bytes::from_static(PPS)).is_none());
        let au = asm.push(Bytes::from_static(IDR)).unwrap();
        assert_eq!(au.len(), 3);

        let au2 = asm.push(Bytes::from_static(SLICE)).unwrap();
        assert_eq!(au2.len(), 1);
        assert!(asm.finish().is_none());
    }

    #[test]
    fn parameter_sets_track_updates() {
        let mut params = ParameterSets::new();
        assert!(!params.updated());

        params.observe(&Bytes::from_static(SPS));
        // SPS alone is not a complete set
        assert!(!params.updated());
        params.observe(&Bytes::from_static(PPS));
        assert!(params.updated());
        params.clear_updated();
        assert!(!params.updated());

        // Re-observing identical bytes does not re-mark
        params.observe(&Bytes::from_static(SPS));
        assert!(!params.updated());

        // A changed SPS does
        params.observe(&Bytes::from_static(&[0x67, 0x42, 0xe0, 0x1f]));
        assert!(params.updated());
    }

    #[test]
    fn profile_level_id_from_sps() {
        let mut params = ParameterSets::new();
        params.observe(&Bytes::from_static(&[0x67, 0x42, 0xe0, 0x1f, 0x80]));
        assert_eq!(params.profile_level_id().as_deref(), Some("42e01f"));
    }

    #[test]
    fn sprop_encodes_both_sets() {
        let mut params = ParameterSets::new();
        params.observe(&Bytes::from_static(SPS));
        assert!(params.sprop_parameter_sets().is_none());
        params.observe(&Bytes::from_static(PPS));
        let sprop = params.sprop_parameter_sets().unwrap();
        let (sps_b64, pps_b64) = sprop.split_once(',').unwrap();
        let engine = base64::engine::general_purpose::STANDARD;
        assert_eq!(engine.decode(sps_b64).unwrap(), SPS);
        assert_eq!(engine.decode(pps_b64).unwrap(), PPS);
    }
}
