/// Network prober: maps configured MAC addresses to live IP addresses.
///
/// One scan produces the current `{ip, mac}` table for the LAN. Each
/// configured device is looked up in it and then verified:
///   - cameras: open the stream and read one frame (bounded retries)
///   - sensors: bounded TCP connect to the reporting port
///   - server:  MAC lookup only
///
/// Anything not found or not live is logged and left out. A failed scan
/// yields an empty result rather than an error. All calls block and are
/// meant to run on a blocking thread.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::capture::{CaptureBackend, CaptureSettings};
use crate::device::{normalize_mac, CameraHandle, DeviceConfig, ResolvedDevice};
use crate::fault::FaultKind;
use crate::registry::DeviceRegistry;
use crate::{DEFAULT_LIVENESS_TIMEOUT_MS, DEFAULT_VERIFY_ATTEMPTS};

/// One row of the discovery table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: IpAddr,
    /// Normalised MAC (see `device::normalize_mac`)
    pub mac: String,
}

impl ArpEntry {
    /// Build an entry from raw scan output fields; `None` if either is
    /// malformed.
    pub fn parse(ip: &str, mac: &str) -> Option<Self> {
        Some(Self {
            ip: ip.parse().ok()?,
            mac: normalize_mac(mac)?,
        })
    }
}

/// Network-wide address/MAC discovery.
pub trait NetworkScanner: Send + Sync {
    fn scan(&self) -> anyhow::Result<Vec<ArpEntry>>;
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub verify_attempts: u32,
    pub liveness_timeout: Duration,
    pub capture: CaptureSettings,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            verify_attempts: DEFAULT_VERIFY_ATTEMPTS,
            liveness_timeout: Duration::from_millis(DEFAULT_LIVENESS_TIMEOUT_MS),
            capture: CaptureSettings::default(),
        }
    }
}

/// Result of one discovery cycle. Replaced wholesale each cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedDevices {
    pub cameras: Vec<CameraHandle>,
    pub sensors: Vec<ResolvedDevice>,
    pub server: Option<ResolvedDevice>,
}

impl ResolvedDevices {
    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty() && self.sensors.is_empty() && self.server.is_none()
    }
}

/// How thoroughly cameras are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CameraCheck {
    /// Open the stream and read a frame
    Stream,
    /// TCP connect only (stream slot may be held by a running worker)
    Port,
}

pub struct DeviceProber {
    scanner: Arc<dyn NetworkScanner>,
    capture: Arc<dyn CaptureBackend>,
    settings: ProbeSettings,
}

impl DeviceProber {
    pub fn new(
        scanner: Arc<dyn NetworkScanner>,
        capture: Arc<dyn CaptureBackend>,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            scanner,
            capture,
            settings,
        }
    }

    /// Full resolution used at startup: cameras must deliver a frame.
    pub fn resolve_devices(&self, registry: &DeviceRegistry) -> ResolvedDevices {
        self.resolve(registry, CameraCheck::Stream)
    }

    /// Lightweight resolution for periodic rescans: cameras only need an
    /// open port.
    pub fn rediscover(&self, registry: &DeviceRegistry) -> ResolvedDevices {
        self.resolve(registry, CameraCheck::Port)
    }

    fn resolve(&self, registry: &DeviceRegistry, check: CameraCheck) -> ResolvedDevices {
        let table = self.scan_table();
        let mut resolved = ResolvedDevices::default();

        for camera in registry.cameras() {
            let Some(device) = lookup(&table, &camera.config) else {
                continue;
            };
            let live = match check {
                CameraCheck::Stream => self.verify_stream(&device),
                CameraCheck::Port => tcp_alive(device.addr(), self.settings.liveness_timeout),
            };
            if live {
                info!(camera_id = camera.id, name = %camera.config.name, ip = %device.ip, "Camera resolved");
                resolved.cameras.push(CameraHandle { id: camera.id, device });
            } else {
                warn!(
                    kind = %FaultKind::Resolution,
                    camera_id = camera.id,
                    name = %camera.config.name,
                    url = %device.stream_url(),
                    "Camera found but not live, skipping"
                );
            }
        }

        for sensor in registry.sensors() {
            let Some(device) = lookup(&table, sensor) else {
                continue;
            };
            if tcp_alive(device.addr(), self.settings.liveness_timeout) {
                info!(name = %sensor.name, ip = %device.ip, "Sensor resolved");
                resolved.sensors.push(device);
            } else {
                warn!(
                    kind = %FaultKind::Resolution,
                    name = %sensor.name,
                    addr = %device.addr(),
                    "Sensor port unreachable, skipping"
                );
            }
        }

        if let Some(server) = registry.server() {
            resolved.server = lookup(&table, server);
        }

        info!(
            cameras = resolved.cameras.len(),
            configured_cameras = registry.cameras().len(),
            sensors = resolved.sensors.len(),
            configured_sensors = registry.sensors().len(),
            "Device resolution complete"
        );

        resolved
    }

    /// Run the scan and index it by MAC. Scan failure yields an empty table.
    fn scan_table(&self) -> HashMap<String, IpAddr> {
        match self.scanner.scan() {
            Ok(entries) => {
                debug!(entries = entries.len(), "Network scan returned");
                entries.into_iter().map(|e| (e.mac, e.ip)).collect()
            }
            Err(e) => {
                warn!(kind = %FaultKind::Resolution, error = %e, "Network scan failed, no devices resolved");
                HashMap::new()
            }
        }
    }

    /// Open the stream and read one frame, up to `verify_attempts` times.
    /// The capture timeouts are the only delay between attempts.
    fn verify_stream(&self, device: &ResolvedDevice) -> bool {
        for attempt in 1..=self.settings.verify_attempts.max(1) {
            let result = self
                .capture
                .open(device, &self.settings.capture)
                .and_then(|mut session| session.read_frame());

            match result {
                Ok(frame) if !frame.is_empty() => return true,
                Ok(_) => debug!(url = %device.stream_url(), attempt, "Empty frame during verification"),
                Err(e) => debug!(url = %device.stream_url(), attempt, error = %e, "Stream verification attempt failed"),
            }
        }
        false
    }
}

fn lookup(table: &HashMap<String, IpAddr>, config: &DeviceConfig) -> Option<ResolvedDevice> {
    match table.get(&config.mac) {
        Some(ip) => Some(ResolvedDevice::new(config.clone(), *ip)),
        None => {
            warn!(
                kind = %FaultKind::Resolution,
                name = %config.name,
                role = %config.role,
                mac = %config.mac,
                "Device not found in network scan"
            );
            None
        }
    }
}

/// Bounded TCP connect.
pub fn tcp_alive(addr: SocketAddr, timeout: Duration) -> bool {
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSession, Frame};
    use crate::device::DeviceRole;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticScanner(Vec<ArpEntry>);

    impl NetworkScanner for StaticScanner {
        fn scan(&self) -> anyhow::Result<Vec<ArpEntry>> {
            Ok(self.0.clone())
        }
    }

    struct FailingScanner;

    impl NetworkScanner for FailingScanner {
        fn scan(&self) -> anyhow::Result<Vec<ArpEntry>> {
            anyhow::bail!("arp-scan not installed")
        }
    }

    /// Fails `failures` opens before delivering frames.
    struct FlakyBackend {
        failures: u32,
        opens: AtomicU32,
    }

    struct OneFrame;

    impl CaptureSession for OneFrame {
        fn read_frame(&mut self) -> anyhow::Result<Frame> {
            Ok(Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9]))
        }
    }

    impl CaptureBackend for FlakyBackend {
        fn open(
            &self,
            _device: &ResolvedDevice,
            _settings: &CaptureSettings,
        ) -> anyhow::Result<Box<dyn CaptureSession>> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("connection refused");
            }
            Ok(Box::new(OneFrame))
        }
    }

    fn camera(name: &str, mac: &str) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            mac: mac.to_string(),
            role: DeviceRole::Camera,
            port: 81,
            stream_path: "/stream".to_string(),
        }
    }

    #[test]
    fn arp_entry_parse_normalizes_mac() {
        let entry = ArpEntry::parse("192.168.2.5", "a8:42:a1:b9:53:23").unwrap();
        assert_eq!(entry.mac, "A842A1B95323");
        assert!(ArpEntry::parse("not-an-ip", "a8:42:a1:b9:53:23").is_none());
    }

    #[test]
    fn failed_scan_degrades_to_empty() {
        let registry = DeviceRegistry::new(vec![camera("cam", "aa:aa:aa:aa:aa:01")]);
        let prober = DeviceProber::new(
            Arc::new(FailingScanner),
            Arc::new(FlakyBackend { failures: 0, opens: AtomicU32::new(0) }),
            ProbeSettings::default(),
        );
        assert!(prober.resolve_devices(&registry).is_empty());
    }

    #[test]
    fn stream_verification_retries_up_to_limit() {
        let registry = DeviceRegistry::new(vec![camera("cam", "aa:aa:aa:aa:aa:01")]);
        let scanner = Arc::new(StaticScanner(vec![
            ArpEntry::parse("10.0.0.5", "AA-AA-AA-AA-AA-01").unwrap(),
        ]));

        let recovers = Arc::new(FlakyBackend { failures: 2, opens: AtomicU32::new(0) });
        let prober = DeviceProber::new(scanner.clone(), recovers.clone(), ProbeSettings::default());
        let resolved = prober.resolve_devices(&registry);
        assert_eq!(resolved.cameras.len(), 1);
        assert_eq!(resolved.cameras[0].id, 1);
        assert_eq!(recovers.opens.load(Ordering::SeqCst), 3);

        let dead = Arc::new(FlakyBackend { failures: 10, opens: AtomicU32::new(0) });
        let prober = DeviceProber::new(scanner, dead.clone(), ProbeSettings::default());
        assert!(prober.resolve_devices(&registry).cameras.is_empty());
        assert_eq!(dead.opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn sensor_requires_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let sensor = DeviceConfig {
            name: "ultrasonic".to_string(),
            mac: "cc:cc:cc:cc:cc:01".to_string(),
            role: DeviceRole::Sensor,
            port,
            stream_path: "/stream".to_string(),
        };
        let registry = DeviceRegistry::new(vec![sensor]);
        let prober = DeviceProber::new(
            Arc::new(StaticScanner(vec![ArpEntry::parse("127.0.0.1", "cc:cc:cc:cc:cc:01").unwrap()])),
            Arc::new(FlakyBackend { failures: 0, opens: AtomicU32::new(0) }),
            ProbeSettings::default(),
        );

        assert_eq!(prober.resolve_devices(&registry).sensors.len(), 1);

        drop(listener);
        assert!(prober.resolve_devices(&registry).sensors.is_empty());
    }
}
