use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use livecheck_core::FaceObservation;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("frame source error: {0}")]
    Source(String),
    #[error("face analysis unavailable: {0}")]
    Oracle(String),
    #[error("failed to spawn vision thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("vision thread exited")]
    ChannelClosed,
}

/// A single camera frame. Pixel format is the source's concern.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic frame counter assigned by the source.
    pub sequence: u64,
}

/// Camera-like producer of frames. Calls may block.
pub trait FrameSource: Send + 'static {
    fn capture_frame(&mut self) -> Result<Frame, VisionError>;
}

/// Face analysis backend. `Ok(None)` means no face in the frame; `Err` means
/// the oracle itself could not run (model not ready, undecodable frame).
pub trait FaceOracle: Send + 'static {
    fn detect(&mut self, frame: &Frame) -> Result<Option<FaceObservation>, VisionError>;
}

/// Messages sent from async tasks to the vision thread.
enum VisionRequest {
    Detect {
        reply: oneshot::Sender<Result<Option<FaceObservation>, VisionError>>,
    },
    Capture {
        reply: oneshot::Sender<Result<Frame, VisionError>>,
    },
}

/// Clone-safe handle to the vision thread.
#[derive(Clone)]
pub struct VisionHandle {
    tx: mpsc::Sender<VisionRequest>,
}

impl VisionHandle {
    /// Grab a frame and run face analysis on it.
    pub async fn detect(&self) -> Result<Option<FaceObservation>, VisionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(VisionRequest::Detect { reply: reply_tx })
            .await
            .map_err(|_| VisionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| VisionError::ChannelClosed)?
    }

    /// Grab one frame without analysis (used for the liveness photo).
    pub async fn capture(&self) -> Result<Frame, VisionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(VisionRequest::Capture { reply: reply_tx })
            .await
            .map_err(|_| VisionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| VisionError::ChannelClosed)?
    }
}

/// Spawn the frame source and oracle on a dedicated OS thread.
///
/// Discards warmup frames first, then serves detect/capture requests one at
/// a time, so the source and oracle never run concurrently with themselves.
pub fn spawn_vision<S, O>(
    mut source: S,
    mut oracle: O,
    warmup_frames: usize,
) -> Result<VisionHandle, VisionError>
where
    S: FrameSource,
    O: FaceOracle,
{
    // Discard warmup frames for camera AGC/AE stabilization
    if warmup_frames > 0 {
        tracing::info!(count = warmup_frames, "discarding warmup frames");
        for _ in 0..warmup_frames {
            let _ = source.capture_frame();
        }
    }

    let (tx, mut rx) = mpsc::channel::<VisionRequest>(4);

    std::thread::Builder::new()
        .name("livecheck-vision".into())
        .spawn(move || {
            tracing::info!("vision thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    VisionRequest::Detect { reply } => {
                        let result = source
                            .capture_frame()
                            .and_then(|frame| oracle.detect(&frame));
                        let _ = reply.send(result);
                    }
                    VisionRequest::Capture { reply } => {
                        let _ = reply.send(source.capture_frame());
                    }
                }
            }
            tracing::info!("vision thread exiting");
        })
        .map_err(VisionError::Spawn)?;

    Ok(VisionHandle { tx })
}
