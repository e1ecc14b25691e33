use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApertureConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub rtp: RtpConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling relay (e.g. "wss://relay.example/ws")
    #[serde(default)]
    pub url: String,
    /// Bearer token appended to the connect URL (prefer APERTURE_TOKEN env)
    pub token: Option<String>,
    /// TLS certificate to pin for the relay connection
    pub tls_cert: Option<String>,
}

/// ICE/STUN configuration for NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN servers as host:port (default: Google's public STUN server)
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Overall connectivity deadline in milliseconds
    #[serde(default = "default_ice_timeout_ms")]
    pub timeout_ms: u64,
    /// Interval between Binding Indication keepalives on the selected pair
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpConfig {
    /// Largest RTP datagram (header + payload) handed to the transport
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Source spec: registry tag, optionally with a path ("h264:clip.264", "-")
    #[serde(default = "default_source")]
    pub source: String,
    /// Target bitrate in bits per second (advisory, passed to the driver)
    #[serde(default = "default_bitrate_bps")]
    pub bitrate_bps: u32,
    /// Capture width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Capture height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
    /// Access units per second
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Mirror horizontally (driver capability)
    #[serde(default)]
    pub hflip: bool,
    /// Mirror vertically (driver capability)
    #[serde(default)]
    pub vflip: bool,
    /// Re-send SPS/PPS ahead of every key frame
    #[serde(default = "default_true")]
    pub repeat_sequence_header: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Enable the Opus audio track when a source provides one
    #[serde(default)]
    pub enabled: bool,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            timeout_ms: default_ice_timeout_ms(),
            keepalive_ms: default_keepalive_ms(),
        }
    }
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self { mtu: default_mtu() }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            bitrate_bps: default_bitrate_bps(),
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
            hflip: false,
            vflip: false,
            repeat_sequence_header: true,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

impl ApertureConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the agent should not start)
    /// or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // The packetizer needs room for the RTP header plus the FU-A prefix
        if self.rtp.mtu < 64 {
            issues.push(format!(
                "ERROR: rtp.mtu = {} is too small (minimum 64)",
                self.rtp.mtu
            ));
        }
        if self.rtp.mtu > 65_000 {
            issues.push(format!(
                "ERROR: rtp.mtu = {} exceeds the UDP payload limit",
                self.rtp.mtu
            ));
        }
        if self.video.framerate == 0 {
            issues.push("ERROR: video.framerate must be at least 1".to_string());
        }
        if self.ice.timeout_ms == 0 {
            issues.push("ERROR: ice.timeout_ms must be nonzero".to_string());
        }
        if self.ice.stun_servers.is_empty() {
            issues.push(
                "WARNING: no STUN servers configured, only host candidates will be gathered"
                    .to_string(),
            );
        }
        for server in &self.ice.stun_servers {
            if !server.contains(':') {
                issues.push(format!(
                    "WARNING: STUN server \"{server}\" has no port, expected host:port"
                ));
            }
        }
        if self.ice.keepalive_ms < 1000 {
            issues.push(format!(
                "WARNING: ice.keepalive_ms = {} is unusually aggressive",
                self.ice.keepalive_ms
            ));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    /// True when `validate` found no fatal issues.
    pub fn is_usable(&self) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(issues) => !issues.iter().any(|i| i.starts_with("ERROR:")),
        }
    }
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun.l.google.com:19302".to_string()]
}

fn default_ice_timeout_ms() -> u64 {
    15_000
}

fn default_keepalive_ms() -> u64 {
    15_000
}

fn default_mtu() -> usize {
    1200
}

fn default_source() -> String {
    "-".to_string()
}

fn default_bitrate_bps() -> u32 {
    2_000_000
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_framerate() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: ApertureConfig = toml::from_str("").unwrap();
        assert_eq!(config.ice.stun_servers, vec!["stun.l.google.com:19302"]);
        assert_eq!(config.ice.timeout_ms, 15_000);
        assert_eq!(config.ice.keepalive_ms, 15_000);
        assert_eq!(config.rtp.mtu, 1200);
        assert_eq!(config.video.framerate, 30);
        assert_eq!(config.video.width, 1280);
        assert_eq!(config.video.height, 720);
        assert!(!config.video.hflip);
        assert!(!config.video.vflip);
        assert!(config.video.repeat_sequence_header);
        assert_eq!(config.video.source, "-");
        assert!(!config.audio.enabled);
        assert!(config.is_usable());
    }

    #[test]
    fn partial_toml_overrides() {
        let config: ApertureConfig = toml::from_str(
            r#"
            [ice]
            stun_servers = ["stun.example.net:3478", "stun2.example.net:3478"]
            timeout_ms = 5000

            [video]
            source = "h264:clip.264"
            framerate = 25
            hflip = true
            "#,
        )
        .unwrap();
        assert_eq!(config.ice.stun_servers.len(), 2);
        assert_eq!(config.ice.timeout_ms, 5000);
        // Unset fields keep their defaults
        assert_eq!(config.ice.keepalive_ms, 15_000);
        assert_eq!(config.video.framerate, 25);
        assert!(config.video.hflip);
        assert!(!config.video.vflip);
    }

    #[test]
    fn tiny_mtu_is_fatal() {
        let mut config = ApertureConfig::default();
        config.rtp.mtu = 10;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:")));
        assert!(!config.is_usable());
    }

    #[test]
    fn zero_framerate_is_fatal() {
        let mut config = ApertureConfig::default();
        config.video.framerate = 0;
        assert!(!config.is_usable());
    }

    #[test]
    fn portless_stun_server_warns_but_starts() {
        let mut config = ApertureConfig::default();
        config.ice.stun_servers = vec!["stun.example.net".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().all(|i| i.starts_with("WARNING:")));
        assert!(config.is_usable());
    }
}
