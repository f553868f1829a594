/// Device identity types: the static configuration entry and its live,
/// resolved counterpart.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// What a configured device does in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Camera,
    Sensor,
    Server,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Camera => "camera",
            Self::Sensor => "sensor",
            Self::Server => "server",
        })
    }
}

/// One `[[devices]]` entry. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// Normalised by the registry (upper-case hex, no separators)
    pub mac: String,
    pub role: DeviceRole,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
}

fn default_port() -> u16 { 81 }
fn default_stream_path() -> String { "/stream".to_string() }

/// A configured device found on the network and verified live.
/// Recreated on every scan cycle, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub config: DeviceConfig,
    pub ip: IpAddr,
    pub verified_at: SystemTime,
}

impl ResolvedDevice {
    pub fn new(config: DeviceConfig, ip: IpAddr) -> Self {
        Self {
            config,
            ip,
            verified_at: SystemTime::now(),
        }
    }

    /// Socket address of the device's service port.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.config.port)
    }

    /// Human-readable stream location, for logs.
    pub fn stream_url(&self) -> String {
        format!("http://{}:{}{}", self.ip, self.config.port, self.config.stream_path)
    }
}

/// A resolved camera with its process-lifetime id (1-based, assigned from
/// configuration order). The capture session itself lives on the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraHandle {
    pub id: u32,
    pub device: ResolvedDevice,
}

/// Normalise a MAC address to 12 upper-case hex digits.
///
/// Accepts `:` / `-` / `.` separators or none. Returns `None` for anything
/// that is not exactly six octets.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let hex: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    Some(hex.to_ascii_uppercase())
}

/// Render a normalised MAC as `aa:bb:cc:dd:ee:ff` for advertisement.
pub fn display_mac(normalized: &str) -> String {
    normalized
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_case() {
        assert_eq!(normalize_mac("a8:42:a1:b9:53:23").as_deref(), Some("A842A1B95323"));
        assert_eq!(normalize_mac("A8-42-A1-B9-53-23").as_deref(), Some("A842A1B95323"));
        assert_eq!(normalize_mac(" a842a1b95323 ").as_deref(), Some("A842A1B95323"));
    }

    #[test]
    fn rejects_malformed_mac() {
        assert!(normalize_mac("").is_none());
        assert!(normalize_mac("a8:42:a1:b9:53").is_none());
        assert!(normalize_mac("zz:42:a1:b9:53:23").is_none());
    }

    #[test]
    fn display_mac_uses_colons() {
        assert_eq!(display_mac("A842A1B95323"), "a8:42:a1:b9:53:23");
    }

    #[test]
    fn stream_url_includes_port_and_path() {
        let config = DeviceConfig {
            name: "esp32cam 1".to_string(),
            mac: "A842A1B95323".to_string(),
            role: DeviceRole::Camera,
            port: 81,
            stream_path: "/stream".to_string(),
        };
        let device = ResolvedDevice::new(config, "192.168.2.10".parse().unwrap());
        assert_eq!(device.stream_url(), "http://192.168.2.10:81/stream");
    }
}
