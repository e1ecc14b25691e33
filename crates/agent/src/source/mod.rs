//! Capture sources behind a narrow capability seam.
//!
//! A source owns its `Flow` and a vote-counted producer; subscribers attach
//! through `add_receiver`, and the capture loop runs only while at least one
//! receiver is attached. Concrete drivers (V4L2, MP4 demux, RTSP) live
//! outside this crate; what ships in-tree is the Annex-B elementary-stream
//! source (file or stdin), which covers testing and piping from an encoder
//! process.

mod annexb;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::flow::FlowReceiver;

pub use annexb::{AnnexBReader, AnnexBVideoSource};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("unknown source kind {0:?}")]
    UnknownKind(String),
    #[error("source kind {0:?} needs a driver that is not built into this binary")]
    DriverNotBuilt(String),
    #[error("source spec {0:?} needs a path (tag:path)")]
    MissingPath(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Subscriber lifecycle of a media source.
pub trait Source: Send + Sync {
    fn add_receiver(&self, capacity: usize) -> FlowReceiver;
    fn remove_receiver(&self, receiver: FlowReceiver);
}

pub trait VideoSource: Source {
    fn codec(&self) -> &'static str;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

pub trait AudioSource: Source {
    fn codec(&self) -> &'static str;
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u8;
}

/// Driver-side pull interface for H.264 elementary streams: one whole NAL
/// unit per call, without a start code; an empty slice signals end of
/// stream.
pub trait H264Source: Send {
    fn read_nalu(&mut self) -> std::io::Result<Bytes>;
}

/// Build a video source from a spec tag: `-` (Annex-B on stdin),
/// `h264:<path>` (Annex-B file), or a driver tag (`v4l2`, `mp4`, `rtsp`)
/// registered by the deployment.
pub fn create_video_source(
    spec: &str,
    video: &aperture_protocol::VideoConfig,
) -> Result<Arc<dyn VideoSource>, SourceError> {
    let (tag, path) = match spec.split_once(':') {
        Some((tag, path)) => (tag, Some(path)),
        None => (spec, None),
    };
    match tag {
        "-" => Ok(Arc::new(AnnexBVideoSource::open(None, video))),
        "h264" => {
            let path = path.ok_or_else(|| SourceError::MissingPath(spec.to_string()))?;
            Ok(Arc::new(AnnexBVideoSource::open(
                Some(PathBuf::from(path)),
                video,
            )))
        }
        "v4l2" | "mp4" | "rtsp" => Err(SourceError::DriverNotBuilt(tag.to_string())),
        _ => Err(SourceError::UnknownKind(tag.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_config() -> aperture_protocol::VideoConfig {
        aperture_protocol::VideoConfig::default()
    }

    #[tokio::test]
    async fn registry_resolves_annex_b_tags() {
        let source = create_video_source("-", &video_config()).unwrap();
        assert_eq!(source.codec(), "h264");
        assert_eq!(source.width(), 1280);
        assert_eq!(source.height(), 720);
    }

    #[test]
    fn registry_rejects_unknown_and_unbuilt_kinds() {
        let cfg = video_config();
        assert!(matches!(
            create_video_source("gopro", &cfg),
            Err(SourceError::UnknownKind(k)) if k == "gopro"
        ));
        assert!(matches!(
            create_video_source("v4l2:/dev/video0", &cfg),
            Err(SourceError::DriverNotBuilt(k)) if k == "v4l2"
        ));
        assert!(matches!(
            create_video_source("mp4:clip.mp4", &cfg),
            Err(SourceError::DriverNotBuilt(_))
        ));
        assert!(matches!(
            create_video_source("h264", &cfg),
            Err(SourceError::MissingPath(_))
        ));
    }
}
