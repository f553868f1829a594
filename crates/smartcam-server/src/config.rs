/// Server configuration, loaded once from TOML at startup.
///
/// Every section is optional and falls back to its defaults. `[[devices]]`
/// entries are decoded one at a time so a single bad entry (unknown role,
/// missing field) is skipped without rejecting the file.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use smartcam_core::capture::{CaptureSettings, FrameSize};
use smartcam_core::device::DeviceConfig;
use smartcam_core::fault::FaultKind;
use smartcam_core::ingest::IngestSettings;
use smartcam_core::prober::ProbeSettings;
use smartcam_core::publisher::PublisherSettings;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub capture: CaptureSection,
    #[serde(default)]
    pub sensor: SensorSection,
    #[serde(default)]
    pub faces: FacesSection,
    /// Raw entries; see `device_entries`
    #[serde(default)]
    pub devices: Vec<toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// mDNS host label (`<host_name>.local.`)
    #[serde(default = "default_host_name")]
    pub host_name: String,
    /// Address advertised for every camera service (auto-detected if unset)
    #[serde(default)]
    pub advertise_ip: Option<IpAddr>,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_s: u64,
    /// Operation mode reported by `GET /mode`
    #[serde(default = "default_mode")]
    pub mode: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            host_name: default_host_name(),
            advertise_ip: None,
            join_timeout_s: default_join_timeout(),
            mode: default_mode(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    /// Network interface for arp-scan (empty = let arp-scan choose)
    #[serde(default)]
    pub interface: String,
    /// Subnet to scan, e.g. `192.168.2.0/24` (empty = `--localnet`)
    #[serde(default)]
    pub subnet: String,
    #[serde(default = "default_arp_scan_path")]
    pub arp_scan_path: String,
    /// Run arp-scan through sudo (it needs raw sockets)
    #[serde(default)]
    pub use_sudo: bool,
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ms: u64,
    #[serde(default = "default_min_rescan")]
    pub min_rescan_s: u64,
    #[serde(default = "default_rescan_check")]
    pub rescan_check_s: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            interface: String::new(),
            subnet: String::new(),
            arp_scan_path: default_arp_scan_path(),
            use_sudo: false,
            verify_attempts: default_verify_attempts(),
            liveness_timeout_ms: default_liveness_timeout(),
            min_rescan_s: default_min_rescan(),
            rescan_check_s: default_rescan_check(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureSection {
    #[serde(default = "default_frame_size")]
    pub frame_size: FrameSize,
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Port of the camera's `/control` endpoint
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u64,
    #[serde(default = "default_read_backoff")]
    pub read_backoff_ms: u64,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            frame_size: default_frame_size(),
            max_fps: default_max_fps(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            control_port: default_control_port(),
            frame_skip: default_frame_skip(),
            read_backoff_ms: default_read_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorSection {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_sensor_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            request_timeout_ms: default_sensor_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacesSection {
    /// Where crops are written before upload
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,
    /// Face detection service (absent = detection disabled)
    #[serde(default)]
    pub detector_url: Option<String>,
    /// Gallery classifier (absent = every face is unknown)
    #[serde(default)]
    pub classifier_url: Option<String>,
    /// Storage / notification endpoint (absent = uploads fail)
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default = "default_faces_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for FacesSection {
    fn default() -> Self {
        Self {
            capture_dir: default_capture_dir(),
            detector_url: None,
            classifier_url: None,
            upload_url: None,
            request_timeout_ms: default_faces_timeout(),
        }
    }
}

// Default value functions
fn default_listen() -> String { format!("0.0.0.0:{}", smartcam_core::DEFAULT_HTTP_PORT) }
fn default_host_name() -> String { "smartcam".to_string() }
fn default_join_timeout() -> u64 { smartcam_core::DEFAULT_JOIN_TIMEOUT_SECS }
fn default_mode() -> String { "live".to_string() }
fn default_arp_scan_path() -> String { "arp-scan".to_string() }
fn default_verify_attempts() -> u32 { smartcam_core::DEFAULT_VERIFY_ATTEMPTS }
fn default_liveness_timeout() -> u64 { smartcam_core::DEFAULT_LIVENESS_TIMEOUT_MS }
fn default_min_rescan() -> u64 { smartcam_core::DEFAULT_MIN_RESCAN_SECS }
fn default_rescan_check() -> u64 { smartcam_core::DEFAULT_RESCAN_CHECK_SECS }
fn default_frame_size() -> FrameSize { FrameSize::Vga }
fn default_max_fps() -> u32 { 10 }
fn default_connect_timeout() -> u64 { 2000 }
fn default_read_timeout() -> u64 { 2000 }
fn default_control_port() -> u16 { 80 }
fn default_frame_skip() -> u64 { smartcam_core::DEFAULT_FRAME_SKIP }
fn default_read_backoff() -> u64 { smartcam_core::DEFAULT_READ_BACKOFF_MS }
fn default_poll_interval() -> u64 { smartcam_core::DEFAULT_SENSOR_POLL_MS }
fn default_sensor_timeout() -> u64 { 500 }
fn default_capture_dir() -> PathBuf { PathBuf::from("captured_faces") }
fn default_faces_timeout() -> u64 { 5000 }

/// Parse the configuration file contents.
pub fn parse(raw: &str) -> anyhow::Result<ServerConfig> {
    Ok(toml::from_str(raw)?)
}

impl ServerConfig {
    /// Decode `[[devices]]`, skipping entries that do not parse.
    pub fn device_entries(&self) -> Vec<DeviceConfig> {
        self.devices
            .iter()
            .enumerate()
            .filter_map(|(index, value)| match DeviceConfig::deserialize(value.clone()) {
                Ok(device) => Some(device),
                Err(e) => {
                    warn!(
                        kind = %FaultKind::Configuration,
                        index,
                        error = %e,
                        "Skipping malformed device entry"
                    );
                    None
                }
            })
            .collect()
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            frame_size: self.capture.frame_size,
            max_fps: self.capture.max_fps,
            connect_timeout_ms: self.capture.connect_timeout_ms,
            read_timeout_ms: self.capture.read_timeout_ms,
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            frame_skip: self.capture.frame_skip,
            read_backoff_ms: self.capture.read_backoff_ms,
            capture: self.capture_settings(),
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            verify_attempts: self.discovery.verify_attempts,
            liveness_timeout: Duration::from_millis(self.discovery.liveness_timeout_ms),
            capture: self.capture_settings(),
        }
    }

    /// Publisher settings; `addresses` is what every record advertises.
    pub fn publisher_settings(&self, addresses: Vec<IpAddr>) -> anyhow::Result<PublisherSettings> {
        let listen: std::net::SocketAddr = self
            .server
            .listen
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid [server] listen {:?}: {}", self.server.listen, e))?;

        Ok(PublisherSettings {
            service_port: listen.port(),
            addresses,
            host_name: format!("{}.local.", self.server.host_name),
            min_interval: Duration::from_secs(self.discovery.min_rescan_s),
            check_interval: Duration::from_secs(self.discovery.rescan_check_s.max(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartcam_core::device::DeviceRole;

    const SAMPLE: &str = r#"
[server]
listen = "0.0.0.0:2003"
host_name = "gate"
advertise_ip = "192.168.2.1"

[discovery]
interface = "wlan0"
subnet = "192.168.2.0/24"

[capture]
frame_size = "qvga"
max_fps = 8

[faces]
upload_url = "http://192.168.2.1:9000/images"

[[devices]]
name = "esp32cam 1"
mac = "a8:42:a1:b9:53:23"
role = "camera"

[[devices]]
name = "ultrasonic"
mac = "A8-42-A1-B9-53-30"
role = "sensor"
port = 81

[[devices]]
name = "toaster"
mac = "a8:42:a1:b9:53:99"
role = "kitchen"
"#;

    #[test]
    fn parses_sections_and_defaults() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.server.host_name, "gate");
        assert_eq!(config.server.mode, "live");
        assert_eq!(config.server.advertise_ip, Some("192.168.2.1".parse().unwrap()));
        assert_eq!(config.discovery.interface, "wlan0");
        assert_eq!(config.discovery.min_rescan_s, 30);
        assert_eq!(config.capture.frame_size, FrameSize::Qvga);
        assert_eq!(config.capture.frame_skip, 5);
        assert_eq!(config.sensor.poll_interval_ms, 100);
        assert!(config.faces.detector_url.is_none());
    }

    #[test]
    fn bad_device_entry_is_skipped() {
        let devices = parse(SAMPLE).unwrap().device_entries();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].role, DeviceRole::Camera);
        assert_eq!(devices[0].port, 81);
        assert_eq!(devices[0].stream_path, "/stream");
        assert_eq!(devices[1].name, "ultrasonic");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert!(config.device_entries().is_empty());
        let publisher = config.publisher_settings(Vec::new()).unwrap();
        assert_eq!(publisher.service_port, 2003);
        assert_eq!(publisher.host_name, "smartcam.local.");
    }

    #[test]
    fn shipped_config_parses() {
        let config = parse(include_str!("../../../config/server.toml")).unwrap();
        let devices = config.device_entries();
        assert_eq!(devices.len(), 4);
        assert!(config.publisher_settings(Vec::new()).is_ok());
    }

    #[test]
    fn invalid_listen_is_an_error() {
        let config = parse("[server]\nlisten = \"nowhere\"\n").unwrap();
        assert!(config.publisher_settings(Vec::new()).is_err());
    }
}
