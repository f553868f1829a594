pub mod capture;
pub mod device;
pub mod faces;
pub mod fault;
pub mod frames;
pub mod ingest;
pub mod monitor;
pub mod prober;
pub mod publisher;
pub mod registry;
pub mod sensor;
pub mod supervisor;

/// mDNS service type under which cameras are advertised
pub const MDNS_SERVICE_TYPE: &str = "_smartcam._tcp.local.";

/// Frames held per camera for live viewing
pub const FRAME_BUFFER_CAPACITY: usize = 10;

/// Every Nth frame is a face-capture candidate
pub const DEFAULT_FRAME_SKIP: u64 = 5;

/// Stream verification attempts during resolution
pub const DEFAULT_VERIFY_ATTEMPTS: u32 = 3;

/// Capture / discovery defaults (milliseconds unless noted)
pub const DEFAULT_READ_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_SENSOR_POLL_MS: u64 = 100;
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_MIN_RESCAN_SECS: u64 = 30;
pub const DEFAULT_RESCAN_CHECK_SECS: u64 = 5;
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 10;

/// Default HTTP port of the live-view server
pub const DEFAULT_HTTP_PORT: u16 = 2003;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
