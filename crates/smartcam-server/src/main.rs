mod arp;
mod config;
mod face_service;
mod http_server;
mod mdns;
mod mjpeg;
mod sensor_poller;
mod uploader;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use smartcam_core::capture::CaptureBackend;
use smartcam_core::fault::FaultKind;
use smartcam_core::ingest::FacePipeline;
use smartcam_core::prober::DeviceProber;
use smartcam_core::publisher::ServicePublisher;
use smartcam_core::registry::DeviceRegistry;
use smartcam_core::supervisor::{Pipeline, Supervisor};

use crate::arp::ArpScanner;
use crate::face_service::HttpFaceService;
use crate::http_server::LiveState;
use crate::mdns::MdnsAdvertiser;
use crate::mjpeg::MjpegBackend;
use crate::sensor_poller::HttpPollerFactory;
use crate::uploader::HttpUploader;

#[derive(Parser, Debug)]
#[command(name = "smartcam-server", about = "SmartCam camera server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Operation mode reported by `/mode` (overrides `[server] mode`)
    #[arg(long, env = "OPERATION_MODE")]
    mode: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let config_str = tokio::fs::read_to_string(&args.config).await.map_err(|e| {
        error!(kind = %FaultKind::Configuration, "Failed to read config file {:?}: {}", args.config, e);
        e
    })?;

    let config = config::parse(&config_str).map_err(|e| {
        error!(kind = %FaultKind::Configuration, "Failed to parse config: {}", e);
        e
    })?;

    let registry = Arc::new(DeviceRegistry::new(config.device_entries()));
    info!(
        cameras = registry.cameras().len(),
        sensors = registry.sensors().len(),
        server = registry.server().is_some(),
        "SmartCam server starting"
    );
    if registry.cameras().is_empty() {
        warn!(kind = %FaultKind::Configuration, "No cameras configured");
    }

    std::fs::create_dir_all(&config.faces.capture_dir).with_context(|| {
        format!("failed to create capture directory {}", config.faces.capture_dir.display())
    })?;

    // ── Collaborators ──
    let runtime = tokio::runtime::Handle::current();
    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.faces.request_timeout_ms))
        .build()?;

    let capture: Arc<dyn CaptureBackend> = Arc::new(MjpegBackend::new(
        http.clone(),
        runtime.clone(),
        config.capture.control_port,
    ));
    let prober = Arc::new(DeviceProber::new(
        Arc::new(ArpScanner::new(&config.discovery)),
        Arc::clone(&capture),
        config.probe_settings(),
    ));

    let face_service = Arc::new(HttpFaceService::new(
        http.clone(),
        runtime.clone(),
        config.faces.detector_url.clone(),
        config.faces.classifier_url.clone(),
    ));
    let faces = FacePipeline {
        detector: face_service.clone(),
        classifier: face_service,
        uploader: Arc::new(HttpUploader::new(http, runtime, config.faces.upload_url.clone())),
        capture_dir: config.faces.capture_dir.clone(),
    };

    let mut pipeline = Pipeline::new(
        Arc::clone(&registry),
        Arc::clone(&prober),
        capture,
        faces,
        config.ingest_settings(),
    );
    pipeline.sensor_poll_interval = Duration::from_millis(config.sensor.poll_interval_ms);
    pipeline.join_timeout = Duration::from_secs(config.server.join_timeout_s);
    let pipeline = Arc::new(pipeline);

    // ── Service discovery ──
    let addresses: Vec<IpAddr> = config
        .server
        .advertise_ip
        .or_else(local_ipv4)
        .into_iter()
        .collect();
    if addresses.is_empty() {
        warn!("Could not determine server address, mDNS will advertise all interfaces");
    }

    let advertiser = Arc::new(MdnsAdvertiser::new()?);
    let publisher = Arc::new(ServicePublisher::new(
        Arc::clone(&registry),
        prober,
        advertiser.clone(),
        config.publisher_settings(addresses)?,
    ));

    let pollers = HttpPollerFactory::new(Duration::from_millis(config.sensor.request_timeout_ms))?;
    let mut supervisor = Supervisor::new(Arc::clone(&pipeline), publisher, pollers);

    // ── Live view ──
    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind live view server on {}", config.server.listen))?;
    let live_state = LiveState {
        frames: Arc::clone(&pipeline.frames),
        sensor: Arc::clone(&pipeline.sensor),
        registry,
        cancel: supervisor.cancel_token(),
        mode: Arc::from(args.mode.as_deref().unwrap_or(&config.server.mode)),
    };
    let http_handle = tokio::spawn(http_server::run(listener, live_state));

    let resolved = supervisor.start().await?;
    if let Some(server) = &resolved.server {
        info!(ip = %server.ip, name = %server.config.name, "Server entry resolved");
    }
    info!(cameras = ?supervisor.live_cameras(), "SmartCam server running");

    // Wait for shutdown signal
    supervisor
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await;
    info!("Shutting down...");

    let report = supervisor.shutdown().await;
    for camera in &report.cameras {
        info!(
            camera_id = camera.camera_id,
            frames = camera.frames,
            faces = camera.faces,
            uploads_failed = camera.uploads_failed,
            "Camera summary"
        );
    }

    if tokio::time::timeout(Duration::from_secs(2), http_handle).await.is_err() {
        warn!("Live view server did not stop in time");
    }
    advertiser.shutdown();

    if report.stragglers > 0 {
        warn!(stragglers = report.stragglers, "Exiting with workers still running");
    }
    if report.panicked > 0 {
        anyhow::bail!("{} worker(s) panicked during the run", report.panicked);
    }

    Ok(())
}

/// Address of the interface that routes off-host. No packets are sent.
fn local_ipv4() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}
