use anyhow::Context;
use aperture_protocol::ApertureConfig;

pub(crate) struct Args {
    pub config_path: Option<String>,
    pub signal_url: Option<String>,
    pub token: Option<String>,
    pub tls_cert: Option<String>,
    pub source: Option<String>,
    pub stun_servers: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<u32>,
    pub bitrate_bps: Option<u32>,
    pub mtu: Option<usize>,
    pub ice_timeout_ms: Option<u64>,
    pub audio: bool,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut parsed = Args {
        config_path: None,
        signal_url: None,
        token: None,
        tls_cert: None,
        source: None,
        stun_servers: Vec::new(),
        width: None,
        height: None,
        framerate: None,
        bitrate_bps: None,
        mtu: None,
        ice_timeout_ms: None,
        audio: false,
    };

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("aperture-agent {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("aperture-agent - WebRTC camera endpoint");
                println!();
                println!("USAGE:");
                println!("    aperture-agent [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --config <PATH>              TOML configuration file");
                println!("    --signal-url <URL>           Signaling relay WebSocket URL");
                println!("    --token <TOKEN>              Relay auth token (prefer APERTURE_TOKEN env)");
                println!("    --tls-cert <PATH>            TLS certificate to pin for the relay");
                println!("    --source <SPEC>              Video source: '-', h264:<path>, v4l2:<dev>, mp4:<path>, rtsp:<url>");
                println!("    --stun-server <HOST:PORT>    STUN server (repeatable, overrides config)");
                println!("    --width <PIXELS>             Video width [default: 1280]");
                println!("    --height <PIXELS>            Video height [default: 720]");
                println!("    --framerate <FPS>            Access units per second [default: 30]");
                println!("    --bitrate <BPS>              Target bitrate in bits per second");
                println!("    --mtu <BYTES>                RTP datagram budget [default: 1200]");
                println!("    --ice-timeout-ms <MS>        Connectivity deadline [default: 15000]");
                println!("    --audio                      Enable the Opus audio track");
                println!("    -V, --version                Print version and exit");
                println!("    -h, --help                   Print this help and exit");
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                parsed.config_path = Some(args.get(i).context("Missing --config value")?.clone());
            }
            "--signal-url" => {
                i += 1;
                parsed.signal_url = Some(args.get(i).context("Missing --signal-url value")?.clone());
            }
            "--token" => {
                // Legacy CLI support (prefer APERTURE_TOKEN env var)
                i += 1;
                parsed.token = Some(args.get(i).context("Missing --token value")?.clone());
            }
            "--tls-cert" => {
                i += 1;
                parsed.tls_cert = Some(args.get(i).context("Missing --tls-cert value")?.clone());
            }
            "--source" => {
                i += 1;
                parsed.source = Some(args.get(i).context("Missing --source value")?.clone());
            }
            "--stun-server" => {
                i += 1;
                parsed
                    .stun_servers
                    .push(args.get(i).context("Missing --stun-server value")?.clone());
            }
            "--width" => {
                i += 1;
                parsed.width = Some(
                    args.get(i)
                        .context("Missing --width value")?
                        .parse()
                        .context("Invalid --width value")?,
                );
            }
            "--height" => {
                i += 1;
                parsed.height = Some(
                    args.get(i)
                        .context("Missing --height value")?
                        .parse()
                        .context("Invalid --height value")?,
                );
            }
            "--framerate" => {
                i += 1;
                parsed.framerate = Some(
                    args.get(i)
                        .context("Missing --framerate value")?
                        .parse()
                        .context("Invalid --framerate value")?,
                );
            }
            "--bitrate" => {
                i += 1;
                parsed.bitrate_bps = Some(
                    args.get(i)
                        .context("Missing --bitrate value")?
                        .parse()
                        .context("Invalid --bitrate value")?,
                );
            }
            "--mtu" => {
                i += 1;
                parsed.mtu = Some(
                    args.get(i)
                        .context("Missing --mtu value")?
                        .parse()
                        .context("Invalid --mtu value")?,
                );
            }
            "--ice-timeout-ms" => {
                i += 1;
                parsed.ice_timeout_ms = Some(
                    args.get(i)
                        .context("Missing --ice-timeout-ms value")?
                        .parse()
                        .context("Invalid --ice-timeout-ms value")?,
                );
            }
            "--audio" => {
                parsed.audio = true;
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    // Prefer env var for the relay token (CLI args are visible in /proc)
    if parsed.token.is_none() {
        parsed.token = std::env::var("APERTURE_TOKEN").ok();
    }

    Ok(parsed)
}

impl Args {
    /// Load the TOML config (if any) and overlay the CLI flags on top.
    pub(crate) fn into_config(self) -> anyhow::Result<ApertureConfig> {
        let mut config: ApertureConfig = match &self.config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {path}"))?;
                toml::from_str(&raw).with_context(|| format!("Failed to parse {path}"))?
            }
            None => ApertureConfig::default(),
        };

        if let Some(url) = self.signal_url {
            config.signaling.url = url;
        }
        if self.token.is_some() {
            config.signaling.token = self.token;
        }
        if self.tls_cert.is_some() {
            config.signaling.tls_cert = self.tls_cert;
        }
        if let Some(source) = self.source {
            config.video.source = source;
        }
        if !self.stun_servers.is_empty() {
            config.ice.stun_servers = self.stun_servers;
        }
        if let Some(width) = self.width {
            config.video.width = width;
        }
        if let Some(height) = self.height {
            config.video.height = height;
        }
        if let Some(framerate) = self.framerate {
            config.video.framerate = framerate;
        }
        if let Some(bitrate) = self.bitrate_bps {
            config.video.bitrate_bps = bitrate;
        }
        if let Some(mtu) = self.mtu {
            config.rtp.mtu = mtu;
        }
        if let Some(timeout) = self.ice_timeout_ms {
            config.ice.timeout_ms = timeout;
        }
        if self.audio {
            config.audio.enabled = true;
        }
        Ok(config)
    }
}
