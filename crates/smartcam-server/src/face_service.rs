/// HTTP face service client.
///
/// The detector is POSTed the frame as `image/jpeg` and answers with face
/// boxes, either a bare JSON array or `{"faces": [...]}`. The classifier is
/// POSTed a crop and answers `{"unknown": bool}`. Without a detector URL no
/// faces are ever found; without a classifier URL, or on any classifier
/// failure, every face counts as unknown.

use std::io::Cursor;

use anyhow::Context;
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::debug;

use smartcam_core::faces::{BoundingBox, FaceClassifier, FaceDetector};
use smartcam_core::fault::FaultKind;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DetectResponse {
    Boxes(Vec<BoundingBox>),
    Wrapped { faces: Vec<BoundingBox> },
}

impl DetectResponse {
    fn into_boxes(self) -> Vec<BoundingBox> {
        match self {
            Self::Boxes(boxes) | Self::Wrapped { faces: boxes } => boxes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    unknown: bool,
}

pub struct HttpFaceService {
    http: reqwest::Client,
    runtime: Handle,
    detector_url: Option<String>,
    classifier_url: Option<String>,
}

impl HttpFaceService {
    pub fn new(
        http: reqwest::Client,
        runtime: Handle,
        detector_url: Option<String>,
        classifier_url: Option<String>,
    ) -> Self {
        Self {
            http,
            runtime,
            detector_url,
            classifier_url,
        }
    }

    /// POST a JPEG and decode the JSON reply.
    fn post_jpeg<T: serde::de::DeserializeOwned>(&self, url: &str, image: &DynamicImage) -> anyhow::Result<T> {
        let body = encode_jpeg(image)?;
        let request = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body);

        self.runtime.block_on(async move {
            let resp = request.send().await?.error_for_status()?;
            Ok::<T, anyhow::Error>(resp.json::<T>().await?)
        })
    }
}

impl FaceDetector for HttpFaceService {
    fn detect_faces(&self, image: &DynamicImage) -> anyhow::Result<Vec<BoundingBox>> {
        let Some(url) = &self.detector_url else {
            return Ok(Vec::new());
        };
        let reply: DetectResponse = self
            .post_jpeg(url, image)
            .with_context(|| format!("face detector at {} failed", url))?;
        Ok(reply.into_boxes())
    }
}

impl FaceClassifier for HttpFaceService {
    fn is_unknown(&self, face: &DynamicImage) -> bool {
        let Some(url) = &self.classifier_url else {
            return true;
        };
        match self.post_jpeg::<ClassifyResponse>(url, face) {
            Ok(reply) => reply.unknown,
            Err(e) => {
                debug!(kind = %FaultKind::Collaborator, url = %url, error = %e, "Classifier failed, treating face as unknown");
                true
            }
        }
    }
}

fn encode_jpeg(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_reply_in_either_shape() {
        let bare: DetectResponse =
            serde_json::from_str(r#"[{"x": 1, "y": 2, "width": 30, "height": 40}]"#).unwrap();
        assert_eq!(bare.into_boxes(), vec![BoundingBox { x: 1, y: 2, width: 30, height: 40 }]);

        let wrapped: DetectResponse = serde_json::from_str(r#"{"faces": []}"#).unwrap();
        assert!(wrapped.into_boxes().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn unconfigured_service_finds_nothing_and_fails_open() {
        let service = HttpFaceService::new(reqwest::Client::new(), Handle::current(), None, None);
        let image = DynamicImage::new_rgb8(8, 8);

        let (faces, unknown) = tokio::task::spawn_blocking(move || {
            (service.detect_faces(&image).unwrap(), service.is_unknown(&image))
        })
        .await
        .unwrap();

        assert!(faces.is_empty());
        assert!(unknown);
    }
}
