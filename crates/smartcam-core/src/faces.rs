/// Face pipeline collaborators and the crop/persist step between them.
///
/// Detection, known/unknown classification and upload are external; this
/// module only fixes their contracts and prepares the face crops handed to
/// them. All calls are synchronous and run on the camera worker thread.

use std::path::{Path, PathBuf};

use anyhow::Context;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};

/// Crops are enlarged by this factor before persisting.
pub const UPSCALE_FACTOR: u32 = 2;

/// Mean luma below which a crop gets low-light enhancement.
pub const LOW_LIGHT_THRESHOLD: f32 = 50.0;

/// Contrast boost applied to low-light crops.
const LOW_LIGHT_CONTRAST: f32 = 40.0;

/// Face region in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Finds face regions in a frame. No side effects.
pub trait FaceDetector: Send + Sync {
    fn detect_faces(&self, image: &DynamicImage) -> anyhow::Result<Vec<BoundingBox>>;
}

/// Decides whether a face is absent from the reference gallery.
///
/// Implementations must fail open: with no gallery loaded or on any
/// internal error the answer is `true` (unknown), so failures lean toward
/// alerting rather than silence.
pub trait FaceClassifier: Send + Sync {
    fn is_unknown(&self, face: &DynamicImage) -> bool;
}

/// Metadata handed to the storage / notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadRequest {
    pub camera_id: u32,
    pub image_type: String,
    pub local_path: PathBuf,
    pub image_name: String,
    pub timestamp_ms: u64,
    /// Push a notification in addition to storing the image
    pub notify: bool,
}

/// Stores a face image remotely and optionally notifies. Returns false on
/// failure; it never raises into the ingestion loop.
pub trait FaceUploader: Send + Sync {
    fn upload(&self, request: &UploadRequest) -> bool;
}

/// Cut a detected region out of the frame, clamped to the frame bounds.
/// Returns `None` when the clamped region is empty.
pub fn crop_face(frame: &DynamicImage, region: &BoundingBox) -> Option<DynamicImage> {
    let (frame_w, frame_h) = frame.dimensions();
    if region.x >= frame_w || region.y >= frame_h {
        return None;
    }

    let width = region.width.min(frame_w - region.x);
    let height = region.height.min(frame_h - region.y);
    if width == 0 || height == 0 {
        return None;
    }

    let face = frame.crop_imm(region.x, region.y, width, height);
    let face = face.resize_exact(width * UPSCALE_FACTOR, height * UPSCALE_FACTOR, FilterType::Triangle);

    if mean_luma(&face) < LOW_LIGHT_THRESHOLD {
        let gray = face.to_luma8();
        let boosted = image::imageops::contrast(&gray, LOW_LIGHT_CONTRAST);
        return Some(DynamicImage::ImageLuma8(boosted));
    }

    Some(DynamicImage::ImageRgb8(face.to_rgb8()))
}

/// Average 8-bit luma of an image (0 for an empty image).
pub fn mean_luma(image: &DynamicImage) -> f32 {
    let gray = image.to_luma8();
    let count = (gray.width() as usize) * (gray.height() as usize);
    if count == 0 {
        return 0.0;
    }
    let sum: u64 = gray.pixels().map(|p| u64::from(p.0[0])).sum();
    sum as f32 / count as f32
}

/// File name encoding camera id, capture time and region index.
pub fn face_file_name(camera_id: u32, timestamp_ms: u64, index: usize) -> String {
    format!("cam{}_{}_{}.jpg", camera_id, timestamp_ms, index)
}

/// Write a face crop as JPEG under `dir`, returning its path.
pub fn save_face(dir: &Path, name: &str, face: &DynamicImage) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating capture directory {}", dir.display()))?;
    let path = dir.join(name);
    face.save_with_format(&path, ImageFormat::Jpeg)
        .with_context(|| format!("writing face crop {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(width: u32, height: u32, level: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([level, level, level])))
    }

    #[test]
    fn crop_is_upscaled() {
        let frame = solid(100, 80, 200);
        let region = BoundingBox { x: 10, y: 10, width: 20, height: 30 };
        let face = crop_face(&frame, &region).unwrap();
        assert_eq!(face.dimensions(), (40, 60));
    }

    #[test]
    fn crop_is_clamped_to_frame() {
        let frame = solid(100, 80, 200);
        let region = BoundingBox { x: 90, y: 70, width: 50, height: 50 };
        let face = crop_face(&frame, &region).unwrap();
        assert_eq!(face.dimensions(), (20, 20));

        let outside = BoundingBox { x: 100, y: 0, width: 5, height: 5 };
        assert!(crop_face(&frame, &outside).is_none());
    }

    #[test]
    fn dark_crop_is_enhanced_to_grayscale() {
        let frame = solid(64, 64, 10);
        let region = BoundingBox { x: 0, y: 0, width: 16, height: 16 };
        let face = crop_face(&frame, &region).unwrap();
        assert!(matches!(face, DynamicImage::ImageLuma8(_)));

        let bright = crop_face(&solid(64, 64, 180), &region).unwrap();
        assert!(matches!(bright, DynamicImage::ImageRgb8(_)));
    }

    #[test]
    fn file_name_encodes_camera_and_time() {
        assert_eq!(face_file_name(2, 1700000000123, 1), "cam2_1700000000123_1.jpg");
    }

    #[test]
    fn save_face_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_face(dir.path(), "face.jpg", &solid(8, 8, 128)).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
