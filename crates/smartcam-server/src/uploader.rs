/// HTTP face uploader: multipart POST of the crop plus its metadata to the
/// storage / notification endpoint. Failures are logged and reported as
/// `false`; the caller keeps the local file.

use tokio::runtime::Handle;
use tracing::{debug, warn};

use smartcam_core::faces::{FaceUploader, UploadRequest};
use smartcam_core::fault::FaultKind;

pub struct HttpUploader {
    http: reqwest::Client,
    runtime: Handle,
    url: Option<String>,
}

impl HttpUploader {
    pub fn new(http: reqwest::Client, runtime: Handle, url: Option<String>) -> Self {
        Self { http, runtime, url }
    }

    fn send(&self, url: &str, request: &UploadRequest) -> anyhow::Result<()> {
        let image = std::fs::read(&request.local_path)?;
        let part = reqwest::multipart::Part::bytes(image)
            .file_name(request.image_name.clone())
            .mime_str("image/jpeg")?;

        let form = reqwest::multipart::Form::new()
            .text("camera_id", request.camera_id.to_string())
            .text("image_type", request.image_type.clone())
            .text("image_name", request.image_name.clone())
            .text("local_path", request.local_path.display().to_string())
            .text("timestamp_ms", request.timestamp_ms.to_string())
            .text("notify", request.notify.to_string())
            .part("image", part);

        let pending = self.http.post(url).multipart(form).send();
        self.runtime.block_on(async move {
            pending.await?.error_for_status()?;
            Ok::<(), anyhow::Error>(())
        })
    }
}

impl FaceUploader for HttpUploader {
    fn upload(&self, request: &UploadRequest) -> bool {
        let Some(url) = &self.url else {
            debug!(image = %request.image_name, "No upload endpoint configured");
            return false;
        };

        match self.send(url, request) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    kind = %FaultKind::Collaborator,
                    url = %url,
                    image = %request.image_name,
                    error = %e,
                    "Face upload failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request(path: PathBuf) -> UploadRequest {
        UploadRequest {
            camera_id: 1,
            image_type: "face".to_string(),
            local_path: path,
            image_name: "cam1_0_0.jpg".to_string(),
            timestamp_ms: 0,
            notify: true,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn missing_endpoint_or_file_is_a_failed_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam1_0_0.jpg");
        std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xD9]).unwrap();

        let unconfigured = HttpUploader::new(reqwest::Client::new(), Handle::current(), None);
        let missing_file = HttpUploader::new(
            reqwest::Client::new(),
            Handle::current(),
            Some("http://127.0.0.1:9/images".to_string()),
        );
        let gone = dir.path().join("nope.jpg");

        let (a, b) = tokio::task::spawn_blocking(move || {
            (unconfigured.upload(&request(path)), missing_file.upload(&request(gone)))
        })
        .await
        .unwrap();

        assert!(!a);
        assert!(!b);
    }
}
