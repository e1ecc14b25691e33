use serde::{Deserialize, Serialize};

/// One signaling message exchanged with the browser peer through the relay.
///
/// Every message is a JSON object of the form
/// `{"type": T, "text": S, "params": {…}?}`. The `text` field carries the
/// whole SDP for offers/answers, or a single `candidate:` line for trickled
/// ICE candidates. An `iceCandidate` with empty `text` signals
/// end-of-candidates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<SignalParams>,
}

/// Message types in use on the signaling channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    /// SDP offer from the remote peer; this side replies with an answer.
    Offer,
    /// SDP answer from this side.
    Answer,
    /// A single trickled SDP candidate line (empty = end-of-candidates).
    IceCandidate,
}

/// Optional per-message parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalParams {
    /// Media section the candidate belongs to (`a=mid` value).
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

impl SignalMessage {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Offer,
            text: sdp.into(),
            params: None,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Answer,
            text: sdp.into(),
            params: None,
        }
    }

    pub fn ice_candidate(line: impl Into<String>, sdp_mid: Option<String>) -> Self {
        Self {
            kind: SignalKind::IceCandidate,
            text: line.into(),
            params: sdp_mid.map(|mid| SignalParams { sdp_mid: Some(mid) }),
        }
    }

    /// End-of-candidates sentinel: an `iceCandidate` with empty text.
    pub fn end_of_candidates(sdp_mid: Option<String>) -> Self {
        Self::ice_candidate("", sdp_mid)
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.kind == SignalKind::IceCandidate && self.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_roundtrip() {
        let msg = SignalMessage::offer("v=0\r\n...");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"offer""#));
        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, SignalKind::Offer);
        assert_eq!(parsed.text, "v=0\r\n...");
    }

    #[test]
    fn ice_candidate_is_camel_case() {
        let msg = SignalMessage::ice_candidate(
            "candidate:0 1 udp 2130706431 192.168.1.1 50000 typ host",
            Some("0".to_string()),
        );
        let json = serde_json::to_string(&msg).unwrap();
        // The wire tag is camelCase, NOT snake_case or kebab-case
        assert!(json.contains(r#""type":"iceCandidate""#));
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(!json.contains("ice_candidate"));
    }

    #[test]
    fn candidate_from_browser_format() {
        let browser_json = r#"{
            "type": "iceCandidate",
            "text": "candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host",
            "params": {"sdpMid": "video"}
        }"#;
        let msg: SignalMessage = serde_json::from_str(browser_json).unwrap();
        assert_eq!(msg.kind, SignalKind::IceCandidate);
        assert!(msg.text.starts_with("candidate:1"));
        assert_eq!(msg.params.unwrap().sdp_mid.as_deref(), Some("video"));
    }

    #[test]
    fn params_omitted_when_absent() {
        let msg = SignalMessage::answer("v=0\r\n");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("params"));
        // And a message without params still parses
        let parsed: SignalMessage = serde_json::from_str(r#"{"type":"answer","text":"v=0"}"#).unwrap();
        assert!(parsed.params.is_none());
    }

    #[test]
    fn end_of_candidates_sentinel() {
        let msg = SignalMessage::end_of_candidates(Some("video".to_string()));
        assert!(msg.is_end_of_candidates());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""text":"""#));

        let real = SignalMessage::ice_candidate("candidate:0 1 udp 1 1.2.3.4 5 typ host", None);
        assert!(!real.is_end_of_candidates());
        // An offer with empty text is not the sentinel
        assert!(!SignalMessage::offer("").is_end_of_candidates());
    }

    #[test]
    fn unknown_params_are_tolerated() {
        // Browsers attach sdpMLineIndex and other fields; they must not break parsing
        let json = r#"{
            "type": "iceCandidate",
            "text": "candidate:1 1 udp 1 1.2.3.4 5 typ host",
            "params": {"sdpMid": "0", "sdpMLineIndex": 0}
        }"#;
        let msg: SignalMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.params.unwrap().sdp_mid.as_deref(), Some("0"));
    }
}
