//! H.264 Annex-B elementary-stream source (file or stdin).
//!
//! A reader thread pulls NAL units off the byte stream and groups them
//! into access units; the producer task paces them out at the configured
//! frame rate through the embedded `Flow`. Files replay from the start at
//! EOF (a looped clip stands in for live capture); stdin ends the stream.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aperture_protocol::VideoConfig;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{H264Source, Source, VideoSource};
use crate::buffer::SharedBuffer;
use crate::flow::{Flow, FlowError, FlowReceiver};
use crate::h264::{self, AccessUnitAssembler, AnnexBScanner};
use crate::singleton::SingletonLoop;

/// Splits any `Read` into NAL units.
pub struct AnnexBReader<R: Read> {
    inner: R,
    scanner: AnnexBScanner,
    eof: bool,
    drained: bool,
}

impl<R: Read> AnnexBReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            scanner: AnnexBScanner::new(),
            eof: false,
            drained: false,
        }
    }
}

impl<R: Read + Send> H264Source for AnnexBReader<R> {
    fn read_nalu(&mut self) -> std::io::Result<Bytes> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            if let Some(nal) = self.scanner.pop() {
                return Ok(nal);
            }
            if self.eof {
                if self.drained {
                    return Ok(Bytes::new());
                }
                self.drained = true;
                return Ok(self.scanner.finish().unwrap_or_default());
            }
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                self.eof = true;
            } else {
                self.scanner.push(&chunk[..n]);
            }
        }
    }
}

/// Video source reading an Annex-B byte stream.
pub struct AnnexBVideoSource {
    flow: Flow,
    width: u32,
    height: u32,
}

impl AnnexBVideoSource {
    /// `path = None` reads stdin. The producer launches lazily on the first
    /// receiver and stops when the last detaches.
    pub fn open(path: Option<PathBuf>, video: &VideoConfig) -> Self {
        let flow = Flow::new();
        let framerate = video.framerate.max(1);

        let producer_flow = flow.clone();
        let runner = Arc::new(SingletonLoop::new(move |token: CancellationToken| {
            produce(producer_flow.clone(), path.clone(), framerate, token)
        }));

        let start_runner = Arc::clone(&runner);
        let stop_runner = runner;
        flow.set_hooks(
            move || start_runner.start(),
            move || {
                // Stop is asynchronous: the last receiver's removal must not
                // block on producer teardown.
                let runner = Arc::clone(&stop_runner);
                tokio::spawn(async move { runner.stop().await });
            },
        );

        Self {
            flow,
            width: video.width,
            height: video.height,
        }
    }
}

impl Source for AnnexBVideoSource {
    fn add_receiver(&self, capacity: usize) -> FlowReceiver {
        self.flow.add_receiver(capacity)
    }

    fn remove_receiver(&self, receiver: FlowReceiver) {
        self.flow.remove_receiver(receiver)
    }
}

impl VideoSource for AnnexBVideoSource {
    fn codec(&self) -> &'static str {
        "h264"
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Producer: one access unit per tick, published as one buffer.
async fn produce(flow: Flow, path: Option<PathBuf>, framerate: u32, token: CancellationToken) {
    let (tx, mut rx) = mpsc::channel::<Vec<Bytes>>(4);
    let source = path.clone();
    let spawned = std::thread::Builder::new()
        .name("annexb-reader".into())
        .spawn(move || read_loop(source, tx));
    if let Err(e) = spawned {
        warn!("Failed to spawn reader thread: {e}");
        flow.shutdown(FlowError::Source(e.to_string()));
        return;
    }

    info!(
        source = %path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "stdin".into()),
        framerate,
        "Annex-B producer started"
    );
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / framerate);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut frames: u64 = 0;
    loop {
        let unit = tokio::select! {
            _ = token.cancelled() => break,
            unit = rx.recv() => unit,
        };
        let Some(nals) = unit else {
            debug!(frames, "Annex-B stream ended");
            flow.shutdown(FlowError::EndOfStream);
            break;
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        flow.put(SharedBuffer::new(h264::to_annex_b(&nals)));
        frames += 1;
    }
    // Closing `rx` unblocks the reader's next send; a reader parked on a
    // blocking stdin read exits at that point instead of at join time.
    drop(rx);
    info!(frames, "Annex-B producer stopped");
}

fn read_loop(path: Option<PathBuf>, tx: mpsc::Sender<Vec<Bytes>>) {
    loop {
        let reader: Box<dyn Read + Send> = match &path {
            Some(p) => match std::fs::File::open(p) {
                Ok(file) => Box::new(file),
                Err(e) => {
                    warn!(path = %p.display(), "Failed to open source: {e}");
                    return;
                }
            },
            None => Box::new(std::io::stdin()),
        };
        let mut nalus = AnnexBReader::new(reader);
        let mut assembler = AccessUnitAssembler::new();
        loop {
            let nal = match nalus.read_nalu() {
                Ok(nal) => nal,
                Err(e) => {
                    warn!("Source read failed: {e}");
                    return;
                }
            };
            if nal.is_empty() {
                // End of stream; flush a trailing partial access unit
                if let Some(unit) = assembler.finish()
                    && tx.blocking_send(unit).is_err()
                {
                    return;
                }
                break;
            }
            if let Some(unit) = assembler.push(nal)
                && tx.blocking_send(unit).is_err()
            {
                return;
            }
        }
        if path.is_none() {
            // stdin does not rewind
            return;
        }
        debug!("Looping source file");
    }
}
