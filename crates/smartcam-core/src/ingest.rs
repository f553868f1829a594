/// Camera ingestion worker.
///
/// One worker per live camera, running on its own blocking thread:
///
///   Opening ──open ok──▶ Streaming ──cancel──▶ Closed
///      │                     │
///      │               stream closed
///      │                     ▼
///      └──open failed────▶ Failed
///
/// Streaming publishes every successfully read frame to the camera's
/// buffer. A frame is analysed for faces only when it falls on the
/// sampling cadence (every `frame_skip`-th frame) AND motion is currently
/// reported. Read errors back off for a fixed delay and retry, until the
/// camera hangs up (`StreamClosed`). Both terminal states are final: the
/// worker never restarts itself, the supervisor does on the next snapshot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{is_stream_closed, CaptureBackend, CaptureSettings, Frame};
use crate::device::CameraHandle;
use crate::faces::{
    crop_face, face_file_name, save_face, BoundingBox, FaceClassifier, FaceDetector, FaceUploader,
    UploadRequest,
};
use crate::fault::FaultKind;
use crate::frames::FrameBuffers;
use crate::sensor::SensorState;
use crate::{DEFAULT_FRAME_SKIP, DEFAULT_READ_BACKOFF_MS};

/// Granularity of cancellation checks while backing off.
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Opening,
    Streaming,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u64,
    #[serde(default = "default_read_backoff_ms")]
    pub read_backoff_ms: u64,
    #[serde(default)]
    pub capture: CaptureSettings,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            frame_skip: default_frame_skip(),
            read_backoff_ms: default_read_backoff_ms(),
            capture: CaptureSettings::default(),
        }
    }
}

fn default_frame_skip() -> u64 { DEFAULT_FRAME_SKIP }
fn default_read_backoff_ms() -> u64 { DEFAULT_READ_BACKOFF_MS }

/// The external face collaborators plus where crops are written.
#[derive(Clone)]
pub struct FacePipeline {
    pub detector: Arc<dyn FaceDetector>,
    pub classifier: Arc<dyn FaceClassifier>,
    pub uploader: Arc<dyn FaceUploader>,
    pub capture_dir: PathBuf,
}

/// Counters returned when a worker ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub camera_id: u32,
    pub state: WorkerState,
    pub frames: u64,
    pub read_errors: u64,
    pub candidates: u64,
    pub faces: u64,
    pub uploads_failed: u64,
    pub region_errors: u64,
}

impl WorkerReport {
    fn new(camera_id: u32) -> Self {
        Self {
            camera_id,
            state: WorkerState::Opening,
            frames: 0,
            read_errors: 0,
            candidates: 0,
            faces: 0,
            uploads_failed: 0,
            region_errors: 0,
        }
    }
}

/// Everything a camera worker needs. Cheap to clone; the capture session
/// itself is created inside `run` and never leaves the worker thread.
#[derive(Clone)]
pub struct CameraWorker {
    pub camera: CameraHandle,
    pub backend: Arc<dyn CaptureBackend>,
    pub frames: Arc<FrameBuffers>,
    pub sensor: Arc<SensorState>,
    pub faces: FacePipeline,
    pub settings: IngestSettings,
}

impl CameraWorker {
    /// Run the state machine to completion. Blocks the calling thread.
    pub fn run(self, cancel: CancellationToken) -> WorkerReport {
        let camera_id = self.camera.id;
        let url = self.camera.device.stream_url();
        let mut report = WorkerReport::new(camera_id);

        // ── Opening ──
        let mut session = match self.backend.open(&self.camera.device, &self.settings.capture) {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    kind = %FaultKind::Resolution,
                    camera_id,
                    url = %url,
                    error = %e,
                    "Failed to open camera stream"
                );
                report.state = WorkerState::Failed;
                return report;
            }
        };

        self.frames.register(camera_id);
        report.state = WorkerState::Streaming;
        info!(camera_id, url = %url, "Camera streaming");

        // ── Streaming ──
        let backoff = Duration::from_millis(self.settings.read_backoff_ms);
        let skip = self.settings.frame_skip.max(1);

        while !cancel.is_cancelled() {
            let frame = match session.read_frame() {
                Ok(frame) => frame,
                Err(e) if is_stream_closed(&e) => {
                    warn!(
                        kind = %FaultKind::TransientIo,
                        camera_id,
                        url = %url,
                        frames = report.frames,
                        "Camera closed the stream, worker exiting"
                    );
                    report.state = WorkerState::Failed;
                    return report;
                }
                Err(e) => {
                    report.read_errors += 1;
                    warn!(
                        kind = %FaultKind::TransientIo,
                        camera_id,
                        error = %e,
                        "Frame read failed, retrying in {}ms", backoff.as_millis()
                    );
                    sleep_unless_cancelled(backoff, &cancel);
                    continue;
                }
            };

            report.frames += 1;
            let on_cadence = report.frames % skip == 0;
            // Snapshot of the gate; a later transition does not apply to this frame
            let motion = on_cadence && self.sensor.get_motion();

            if !self.frames.publish_frame(camera_id, frame.clone()) {
                debug!(camera_id, dropped = self.frames.dropped(camera_id), "Frame buffer full, frame dropped");
            }

            if on_cadence && motion {
                report.candidates += 1;
                self.analyze(&frame, &mut report);
            }
        }

        // ── Closed ── (session dropped on return)
        drop(session);
        report.state = WorkerState::Closed;
        info!(
            camera_id,
            frames = report.frames,
            candidates = report.candidates,
            faces = report.faces,
            "Camera worker closed"
        );
        report
    }

    /// Detect faces in a candidate frame and hand each one off. A failing
    /// region is logged and skipped; its siblings still run.
    fn analyze(&self, frame: &Frame, report: &mut WorkerReport) {
        let camera_id = self.camera.id;

        let image = match image::load_from_memory_with_format(&frame.jpeg, ImageFormat::Jpeg) {
            Ok(image) => image,
            Err(e) => {
                warn!(kind = %FaultKind::TransientIo, camera_id, error = %e, "Undecodable frame, skipping analysis");
                return;
            }
        };

        let regions = match self.faces.detector.detect_faces(&image) {
            Ok(regions) => regions,
            Err(e) => {
                warn!(kind = %FaultKind::Collaborator, camera_id, error = %e, "Face detection failed");
                return;
            }
        };

        if regions.is_empty() {
            return;
        }
        debug!(camera_id, regions = regions.len(), "Faces detected");

        for (index, region) in regions.iter().enumerate() {
            match self.process_region(&image, region, index, frame.captured_at_ms) {
                Ok(true) => report.faces += 1,
                Ok(false) => {
                    report.faces += 1;
                    report.uploads_failed += 1;
                }
                Err(e) => {
                    report.region_errors += 1;
                    warn!(
                        kind = %FaultKind::Collaborator,
                        camera_id,
                        region = index,
                        error = %e,
                        "Face region processing failed"
                    );
                }
            }
        }
    }

    /// Crop, persist, classify and upload one face. Returns whether the
    /// upload succeeded; on success the local crop is removed.
    fn process_region(
        &self,
        image: &DynamicImage,
        region: &BoundingBox,
        index: usize,
        timestamp_ms: u64,
    ) -> anyhow::Result<bool> {
        let camera_id = self.camera.id;
        let face = crop_face(image, region).ok_or_else(|| anyhow!("region {:?} outside frame", region))?;

        let name = face_file_name(camera_id, timestamp_ms, index);
        let path = save_face(&self.faces.capture_dir, &name, &face)?;
        let unknown = self.faces.classifier.is_unknown(&face);

        let request = UploadRequest {
            camera_id,
            image_type: "face".to_string(),
            local_path: path.clone(),
            image_name: name,
            timestamp_ms,
            notify: unknown,
        };

        if self.faces.uploader.upload(&request) {
            info!(camera_id, image = %request.image_name, unknown, "Face uploaded");
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "Could not remove uploaded crop");
            }
            Ok(true)
        } else {
            warn!(
                kind = %FaultKind::Collaborator,
                camera_id,
                path = %path.display(),
                "Face upload failed, local copy kept"
            );
            Ok(false)
        }
    }
}

/// Sleep for `duration`, waking early if cancellation is signalled.
pub fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sleep_wakes_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = Instant::now();
        sleep_unless_cancelled(Duration::from_secs(5), &cancel);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn backoff_sleep_runs_full_duration() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        sleep_unless_cancelled(Duration::from_millis(120), &cancel);
        assert!(start.elapsed() >= Duration::from_millis(120));
    }
}
