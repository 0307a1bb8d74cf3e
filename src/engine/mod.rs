// Face inference engine: three ONNX sessions (detection, recognition, swap)
// loaded once at startup and owned by a dedicated OS thread. Handlers talk to
// the thread through a clone-safe handle; requests are serialized over an
// mpsc channel because ONNX sessions require exclusive access while running.

pub mod alignment;
pub mod detector;
pub mod recognizer;
pub mod swapper;
pub mod types;

use detector::FaceDetector;
use image::RgbImage;
use recognizer::FaceRecognizer;
use swapper::FaceSwapper;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Which of the two uploaded images an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    Source,
    Destination,
}

impl std::fmt::Display for ImageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageRole::Source => write!(f, "source"),
            ImageRole::Destination => write!(f, "destination"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector: {0}")]
    Detector(#[from] detector::DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] recognizer::RecognizerError),
    #[error("swapper: {0}")]
    Swapper(#[from] swapper::SwapperError),
    #[error("no face detected in {0} image")]
    NoFaceDetected(ImageRole),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Model paths and inference settings, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub detector_model: String,
    pub recognizer_model: String,
    pub swapper_model: String,
    pub swapper_emap: String,
    pub intra_threads: usize,
}

enum EngineRequest {
    Swap {
        source: RgbImage,
        dest: RgbImage,
        reply: oneshot::Sender<Result<RgbImage, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Swap the first face of `source` onto the first face of `dest`,
    /// returning the composited destination-sized image.
    pub async fn swap(&self, source: RgbImage, dest: RgbImage) -> Result<RgbImage, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Swap {
                source,
                dest,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Handle backed by a plain closure instead of ONNX sessions.
    #[cfg(test)]
    pub(crate) fn stub<F>(mut swap: F) -> EngineHandle
    where
        F: FnMut(RgbImage, RgbImage) -> Result<RgbImage, EngineError> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
        std::thread::spawn(move || {
            while let Some(EngineRequest::Swap {
                source,
                dest,
                reply,
            }) = rx.blocking_recv()
            {
                let _ = reply.send(swap(source, dest));
            }
        });
        EngineHandle { tx }
    }
}

/// Load all three models and spawn the engine on a dedicated OS thread.
/// Fails fast: any model that cannot be loaded aborts startup.
pub fn spawn_engine(config: &EngineConfig) -> Result<EngineHandle, EngineError> {
    let mut detector = FaceDetector::load(&config.detector_model, config.intra_threads)?;
    tracing::info!(path = %config.detector_model, "face detector loaded");

    let mut recognizer = FaceRecognizer::load(&config.recognizer_model, config.intra_threads)?;
    tracing::info!(path = %config.recognizer_model, "face recognizer loaded");

    let mut swapper = FaceSwapper::load(
        &config.swapper_model,
        &config.swapper_emap,
        config.intra_threads,
    )?;
    tracing::info!(path = %config.swapper_model, "face swapper loaded");

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("swap-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Swap {
                        source,
                        dest,
                        reply,
                    } => {
                        let result =
                            run_swap(&mut detector, &mut recognizer, &mut swapper, &source, &dest);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}

/// The swap pipeline: detect in both images, take the most confident face
/// from each (source checked first), embed the source identity, swap onto
/// the destination face and paste back.
fn run_swap(
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
    swapper: &mut FaceSwapper,
    source: &RgbImage,
    dest: &RgbImage,
) -> Result<RgbImage, EngineError> {
    let source_faces = detector.detect(source)?;
    let dest_faces = detector.detect(dest)?;

    let source_face = source_faces
        .first()
        .ok_or(EngineError::NoFaceDetected(ImageRole::Source))?;
    let dest_face = dest_faces
        .first()
        .ok_or(EngineError::NoFaceDetected(ImageRole::Destination))?;

    tracing::debug!(
        source_faces = source_faces.len(),
        dest_faces = dest_faces.len(),
        source_confidence = source_face.confidence,
        dest_confidence = dest_face.confidence,
        "faces selected for swap"
    );

    let identity = recognizer.extract(source, source_face)?;
    Ok(swapper.swap(dest, dest_face, &identity)?)
}
