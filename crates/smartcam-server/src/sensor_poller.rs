/// HTTP sensor poller: one GET against the sensor's reporting endpoint
/// per poll, bounded by the client timeout.

use std::future::Future;
use std::time::Duration;

use smartcam_core::device::ResolvedDevice;
use smartcam_core::monitor::SensorPoller;
use smartcam_core::supervisor::SensorPollerFactory;

pub struct HttpSensorPoller {
    http: reqwest::Client,
    url: String,
}

impl SensorPoller for HttpSensorPoller {
    fn poll(&self) -> impl Future<Output = anyhow::Result<String>> + Send {
        async move {
            let resp = self.http.get(&self.url).send().await?.error_for_status()?;
            Ok::<String, anyhow::Error>(resp.text().await?)
        }
    }
}

pub struct HttpPollerFactory {
    http: reqwest::Client,
}

impl HttpPollerFactory {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

impl SensorPollerFactory for HttpPollerFactory {
    type Poller = HttpSensorPoller;

    fn poller_for(&self, sensor: &ResolvedDevice) -> HttpSensorPoller {
        HttpSensorPoller {
            http: self.http.clone(),
            url: sensor.stream_url(),
        }
    }
}
