/// Capture session abstraction.
///
/// A `CaptureBackend` opens one `CaptureSession` per camera. The session is
/// moved onto the camera's worker thread and never shared; dropping it
/// releases the underlying stream.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::ResolvedDevice;

/// One encoded frame as delivered by the camera.
#[derive(Debug, Clone)]
pub struct Frame {
    /// JPEG bytes, shared so the viewer buffer and the face pipeline can
    /// both hold the same frame without copying
    pub jpeg: Arc<[u8]>,
    pub captured_at_ms: u64,
}

impl Frame {
    pub fn new(jpeg: impl Into<Arc<[u8]>>) -> Self {
        Self {
            jpeg: jpeg.into(),
            captured_at_ms: crate::now_ms(),
        }
    }

    pub fn len(&self) -> usize {
        self.jpeg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }
}

/// Sensor frame sizes understood by ESP32 camera firmware
/// (`framesize_t` values for the `framesize` control variable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameSize {
    Qqvga,
    Qvga,
    Cif,
    Vga,
    Svga,
}

impl FrameSize {
    pub fn control_value(&self) -> u8 {
        match self {
            Self::Qqvga => 1,
            Self::Qvga => 5,
            Self::Cif => 6,
            Self::Vga => 8,
            Self::Svga => 9,
        }
    }
}

/// Fixed settings applied when a session is opened. These bound the
/// bandwidth and CPU each camera can consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    #[serde(default = "default_frame_size")]
    pub frame_size: FrameSize,
    /// Reads are paced to at most this many frames per second (0 = unpaced)
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound on a single frame read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frame_size: default_frame_size(),
            max_fps: default_max_fps(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl CaptureSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Minimum spacing between frames, if pacing is enabled.
    pub fn frame_interval(&self) -> Option<Duration> {
        (self.max_fps > 0).then(|| Duration::from_secs(1) / self.max_fps)
    }
}

fn default_frame_size() -> FrameSize { FrameSize::Vga }
fn default_max_fps() -> u32 { 10 }
fn default_connect_timeout_ms() -> u64 { 2000 }
fn default_read_timeout_ms() -> u64 { 2000 }

/// Read error meaning the camera ended the stream. A session that returns
/// it is spent; every other read error is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed;

impl fmt::Display for StreamClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("stream closed by camera")
    }
}

impl std::error::Error for StreamClosed {}

/// True when `error` reports the end of the stream.
pub fn is_stream_closed(error: &anyhow::Error) -> bool {
    error.is::<StreamClosed>()
}

/// An open stream owned by exactly one worker.
pub trait CaptureSession: Send {
    /// Read the next frame. Must return within the session's read timeout.
    /// Returns `StreamClosed` once the camera has hung up.
    fn read_frame(&mut self) -> anyhow::Result<Frame>;
}

/// Opens capture sessions for resolved cameras.
pub trait CaptureBackend: Send + Sync {
    fn open(
        &self,
        device: &ResolvedDevice,
        settings: &CaptureSettings,
    ) -> anyhow::Result<Box<dyn CaptureSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_interval_from_fps() {
        let settings = CaptureSettings { max_fps: 10, ..CaptureSettings::default() };
        assert_eq!(settings.frame_interval(), Some(Duration::from_millis(100)));

        let unpaced = CaptureSettings { max_fps: 0, ..CaptureSettings::default() };
        assert_eq!(unpaced.frame_interval(), None);
    }

    #[test]
    fn stream_closed_is_recognised_through_anyhow() {
        assert!(is_stream_closed(&anyhow::Error::from(StreamClosed)));
        assert!(!is_stream_closed(&anyhow::anyhow!("no complete frame within 2000ms")));
    }

    #[test]
    fn frame_size_control_values() {
        assert_eq!(FrameSize::Qvga.control_value(), 5);
        assert_eq!(FrameSize::Vga.control_value(), 8);
    }
}
