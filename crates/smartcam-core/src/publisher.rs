/// Service publisher: advertises each live camera as a DNS-SD service and
/// periodically rediscovers the fleet.
///
/// Records are keyed by service name. Registering a name that is already
/// advertised withdraws the old record first, so repeated registration
/// always leaves exactly one record per camera. Rediscovery is debounced:
/// the loop wakes every `check_interval` but only scans once
/// `min_interval` has passed since the previous scan. Cameras that stop
/// answering keep their records until shutdown or replacement.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::{display_mac, CameraHandle, DeviceRole};
use crate::fault::FaultKind;
use crate::prober::{DeviceProber, ResolvedDevices};
use crate::registry::DeviceRegistry;
use crate::{DEFAULT_MIN_RESCAN_SECS, DEFAULT_RESCAN_CHECK_SECS, MDNS_SERVICE_TYPE};

/// A service advertisement as handed to the discovery backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_type: String,
    pub instance_name: String,
    /// Fully qualified `<instance>.<service type>`; the registration key
    pub service_name: String,
    pub host_name: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub properties: BTreeMap<String, String>,
}

/// Multicast service discovery backend.
pub trait ServiceAdvertiser: Send + Sync {
    fn register(&self, record: &ServiceRecord) -> anyhow::Result<()>;
    fn unregister(&self, service_name: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Port clients connect to (the live-view server, not the camera)
    pub service_port: u16,
    /// Addresses advertised for every record (the server's own)
    pub addresses: Vec<IpAddr>,
    pub host_name: String,
    pub min_interval: Duration,
    pub check_interval: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            service_port: crate::DEFAULT_HTTP_PORT,
            addresses: Vec::new(),
            host_name: "smartcam.local.".to_string(),
            min_interval: Duration::from_secs(DEFAULT_MIN_RESCAN_SECS),
            check_interval: Duration::from_secs(DEFAULT_RESCAN_CHECK_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescanOutcome {
    /// Minimum interval not yet elapsed; nothing scanned
    Skipped,
    Completed {
        snapshot: ResolvedDevices,
        registered: usize,
    },
}

pub struct ServicePublisher {
    registry: Arc<DeviceRegistry>,
    prober: Arc<DeviceProber>,
    advertiser: Arc<dyn ServiceAdvertiser>,
    settings: PublisherSettings,
    services: Mutex<HashMap<String, ServiceRecord>>,
    last_scan: Mutex<Option<Instant>>,
}

/// Relative live-view path for a camera id.
pub fn video_feed_path(camera_id: u32) -> String {
    format!("/video_feed/{}", camera_id)
}

impl ServicePublisher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        prober: Arc<DeviceProber>,
        advertiser: Arc<dyn ServiceAdvertiser>,
        settings: PublisherSettings,
    ) -> Self {
        Self {
            registry,
            prober,
            advertiser,
            settings,
            services: Mutex::new(HashMap::new()),
            last_scan: Mutex::new(None),
        }
    }

    /// Build the advertisement for a camera.
    pub fn build_record(&self, camera: &CameraHandle) -> ServiceRecord {
        let config = &camera.device.config;
        let instance_name = format!("camera-{}", config.name);

        let mut properties = BTreeMap::new();
        properties.insert("name".to_string(), config.name.clone());
        properties.insert("path".to_string(), video_feed_path(camera.id));
        properties.insert("id".to_string(), camera.id.to_string());
        properties.insert("mac".to_string(), display_mac(&config.mac));

        ServiceRecord {
            service_type: MDNS_SERVICE_TYPE.to_string(),
            service_name: format!("{}.{}", instance_name, MDNS_SERVICE_TYPE),
            instance_name,
            host_name: self.settings.host_name.clone(),
            port: self.settings.service_port,
            addresses: self.settings.addresses.clone(),
            properties,
        }
    }

    /// Advertise a camera, replacing any record with the same name.
    /// Returns false, with no side effects, for a MAC not configured as a
    /// camera or an id that does not match the registry.
    pub fn register_camera(&self, camera: &CameraHandle) -> bool {
        let mac = &camera.device.config.mac;
        if !self.registry.is_allowed(mac, DeviceRole::Camera)
            || self.registry.camera_id(mac) != Some(camera.id)
        {
            warn!(
                kind = %FaultKind::Configuration,
                camera_id = camera.id,
                mac = %mac,
                "Refusing to advertise device not registered as this camera"
            );
            return false;
        }

        let record = self.build_record(camera);
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);

        if services.remove(&record.service_name).is_some() {
            if let Err(e) = self.advertiser.unregister(&record.service_name) {
                warn!(
                    kind = %FaultKind::TransientIo,
                    service = %record.service_name,
                    error = %e,
                    "Failed to withdraw previous advertisement"
                );
            }
        }

        match self.advertiser.register(&record) {
            Ok(()) => {
                info!(
                    service = %record.service_name,
                    camera_id = camera.id,
                    port = record.port,
                    addresses = ?record.addresses,
                    "Camera service registered"
                );
                services.insert(record.service_name.clone(), record);
                true
            }
            Err(e) => {
                error!(
                    kind = %FaultKind::TransientIo,
                    service = %record.service_name,
                    error = %e,
                    "Failed to register camera service"
                );
                false
            }
        }
    }

    /// Register the cameras from the startup resolution. Counts as a scan
    /// for debounce purposes.
    pub fn publish_initial(&self, cameras: &[CameraHandle]) -> usize {
        *self.last_scan.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        cameras.iter().filter(|c| self.register_camera(c)).count()
    }

    /// Rediscover and re-register, unless the minimum interval has not
    /// elapsed since the last scan. Blocks on network I/O.
    pub fn rescan(&self) -> RescanOutcome {
        {
            let mut last = self.last_scan.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(at) = *last {
                if at.elapsed() < self.settings.min_interval {
                    return RescanOutcome::Skipped;
                }
            }
            *last = Some(Instant::now());
        }

        info!("Rescanning network for devices");
        let snapshot = self.prober.rediscover(&self.registry);
        let registered = snapshot
            .cameras
            .iter()
            .filter(|c| self.register_camera(c))
            .count();

        RescanOutcome::Completed { snapshot, registered }
    }

    /// Debounced rescan loop. Each completed scan replaces the published
    /// device snapshot wholesale.
    pub async fn run_rescan_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
        snapshots: watch::Sender<Arc<ResolvedDevices>>,
    ) {
        let mut interval = tokio::time::interval(self.settings.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let publisher = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || publisher.rescan()).await {
                Ok(RescanOutcome::Skipped) => debug!("Rescan debounced"),
                Ok(RescanOutcome::Completed { snapshot, registered }) => {
                    info!(
                        cameras = snapshot.cameras.len(),
                        sensors = snapshot.sensors.len(),
                        registered,
                        "Rescan complete"
                    );
                    snapshots.send_replace(Arc::new(snapshot));
                }
                Err(e) => error!(error = %e, "Rescan task panicked"),
            }
        }

        debug!("Rescan loop stopped");
    }

    /// Withdraw every advertisement. Individual failures are logged and do
    /// not stop the remaining withdrawals. Returns how many succeeded.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<String> = {
            let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
            services.drain().map(|(name, _)| name).collect()
        };

        let mut withdrawn = 0;
        for name in drained {
            match self.advertiser.unregister(&name) {
                Ok(()) => withdrawn += 1,
                Err(e) => warn!(
                    kind = %FaultKind::TransientIo,
                    service = %name,
                    error = %e,
                    "Failed to withdraw advertisement"
                ),
            }
        }

        info!(withdrawn, "Camera services withdrawn");
        withdrawn
    }

    /// Currently advertised records, sorted by service name.
    pub fn records(&self) -> Vec<ServiceRecord> {
        let services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<ServiceRecord> = services.values().cloned().collect();
        records.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        records
    }
}
