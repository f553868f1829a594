/// Supervisor: owns the cancellation token and every worker's lifecycle.
///
/// Startup resolves the fleet once, spawns one capture thread per live
/// camera and one monitor task per live sensor, registers the cameras and
/// starts the rescan loop. Each completed rescan publishes a fresh device
/// snapshot; cameras in it without a running worker (never started, or
/// exited after a failure) get a new one, which is the only way a failed
/// camera is retried.
///
/// Shutdown cancels the token, waits for each worker up to `join_timeout`,
/// logs the ones that overrun and moves on, then withdraws every service.
/// Worker panics are counted so the process can exit non-zero.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capture::CaptureBackend;
use crate::device::{CameraHandle, ResolvedDevice};
use crate::frames::FrameBuffers;
use crate::ingest::{CameraWorker, FacePipeline, IngestSettings, WorkerReport};
use crate::monitor::{self, MonitorReport, SensorPoller};
use crate::prober::{DeviceProber, ResolvedDevices};
use crate::publisher::ServicePublisher;
use crate::registry::DeviceRegistry;
use crate::sensor::SensorState;
use crate::{DEFAULT_JOIN_TIMEOUT_SECS, DEFAULT_SENSOR_POLL_MS};

/// Explicit context shared by reference with every worker.
pub struct Pipeline {
    pub registry: Arc<DeviceRegistry>,
    pub prober: Arc<DeviceProber>,
    pub capture: Arc<dyn CaptureBackend>,
    pub frames: Arc<FrameBuffers>,
    pub sensor: Arc<SensorState>,
    pub faces: FacePipeline,
    pub ingest: IngestSettings,
    pub sensor_poll_interval: Duration,
    pub join_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        prober: Arc<DeviceProber>,
        capture: Arc<dyn CaptureBackend>,
        faces: FacePipeline,
        ingest: IngestSettings,
    ) -> Self {
        Self {
            registry,
            prober,
            capture,
            frames: Arc::new(FrameBuffers::default()),
            sensor: Arc::new(SensorState::new()),
            faces,
            ingest,
            sensor_poll_interval: Duration::from_millis(DEFAULT_SENSOR_POLL_MS),
            join_timeout: Duration::from_secs(DEFAULT_JOIN_TIMEOUT_SECS),
        }
    }
}

/// Builds the poller for a resolved sensor.
pub trait SensorPollerFactory: Send + Sync {
    type Poller: SensorPoller + 'static;

    fn poller_for(&self, sensor: &ResolvedDevice) -> Self::Poller;
}

/// A capture thread. Its report arrives over `done`; a dropped sender
/// means the thread panicked.
struct CameraTask {
    thread: std::thread::JoinHandle<()>,
    done: oneshot::Receiver<WorkerReport>,
}

#[derive(Debug, Default, Serialize)]
pub struct ShutdownReport {
    pub cameras: Vec<WorkerReport>,
    pub sensors: Vec<MonitorReport>,
    /// Workers that did not stop within the join timeout
    pub stragglers: usize,
    /// Workers that panicked at any point during the run
    pub panicked: usize,
    pub withdrawn: usize,
}

pub struct Supervisor<F: SensorPollerFactory> {
    pipeline: Arc<Pipeline>,
    publisher: Arc<ServicePublisher>,
    pollers: F,
    cancel: CancellationToken,
    cameras: HashMap<u32, CameraTask>,
    sensors: HashMap<String, JoinHandle<MonitorReport>>,
    rescan: Option<JoinHandle<()>>,
    panicked: usize,
    snapshot_tx: watch::Sender<Arc<ResolvedDevices>>,
    snapshot_rx: watch::Receiver<Arc<ResolvedDevices>>,
}

impl<F: SensorPollerFactory> Supervisor<F> {
    pub fn new(pipeline: Arc<Pipeline>, publisher: Arc<ServicePublisher>, pollers: F) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(ResolvedDevices::default()));
        Self {
            pipeline,
            publisher,
            pollers,
            cancel: CancellationToken::new(),
            cameras: HashMap::new(),
            sensors: HashMap::new(),
            rescan: None,
            panicked: 0,
            snapshot_tx,
            snapshot_rx,
        }
    }

    /// Clone of the process-wide cancellation signal.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Latest device snapshot (startup resolution or last rescan).
    pub fn snapshot(&self) -> watch::Receiver<Arc<ResolvedDevices>> {
        self.snapshot_rx.clone()
    }

    /// Ids of cameras whose worker thread is still running.
    pub fn live_cameras(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .cameras
            .iter()
            .filter(|(_, task)| !task.thread.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// Resolve once, spawn workers, advertise, start rescanning.
    pub async fn start(&mut self) -> anyhow::Result<Arc<ResolvedDevices>> {
        let pipeline = Arc::clone(&self.pipeline);
        let resolved = tokio::task::spawn_blocking(move || {
            pipeline.prober.resolve_devices(&pipeline.registry)
        })
        .await?;
        let resolved = Arc::new(resolved);

        if resolved.cameras.is_empty() {
            warn!("No cameras resolved");
        }
        if resolved.sensors.is_empty() {
            warn!("No sensors resolved, face capture stays idle until motion is reported");
        }

        self.reconcile(&resolved).await;

        let registered = self.publisher.publish_initial(&resolved.cameras);
        info!(registered, "Initial service registration complete");

        self.snapshot_tx.send_replace(Arc::clone(&resolved));
        self.snapshot_rx.mark_unchanged();

        let publisher = Arc::clone(&self.publisher);
        let cancel = self.cancel.clone();
        let snapshot_tx = self.snapshot_tx.clone();
        self.rescan = Some(tokio::spawn(async move {
            publisher.run_rescan_loop(cancel, snapshot_tx).await;
        }));

        info!(
            cameras = self.cameras.len(),
            sensors = self.sensors.len(),
            "Supervisor started"
        );
        Ok(resolved)
    }

    /// Spawn workers for devices in `snapshot` that have none running.
    /// Returns `(cameras_spawned, sensors_spawned)`.
    pub async fn reconcile(&mut self, snapshot: &ResolvedDevices) -> (usize, usize) {
        let mut cameras_spawned = 0;
        for camera in &snapshot.cameras {
            if let Some(task) = self.cameras.get(&camera.id) {
                if !task.thread.is_finished() {
                    continue;
                }
            }
            if let Some(task) = self.cameras.remove(&camera.id) {
                match task.done.await {
                    Ok(report) => info!(
                        camera_id = report.camera_id,
                        state = ?report.state,
                        "Restarting camera worker after exit"
                    ),
                    Err(_) => {
                        self.panicked += 1;
                        error!(camera_id = camera.id, "Camera worker panicked, restarting");
                    }
                }
            }
            if self.spawn_camera(camera.clone()) {
                cameras_spawned += 1;
            }
        }

        let mut sensors_spawned = 0;
        for sensor in &snapshot.sensors {
            let mac = sensor.config.mac.clone();
            if self.sensors.get(&mac).is_some_and(|h| !h.is_finished()) {
                continue;
            }
            if let Some(handle) = self.sensors.remove(&mac) {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        self.panicked += 1;
                    }
                    error!(mac = %mac, error = %e, "Sensor monitor task failed, restarting");
                }
            }
            self.spawn_sensor(sensor.clone());
            sensors_spawned += 1;
        }

        (cameras_spawned, sensors_spawned)
    }

    fn spawn_camera(&mut self, camera: CameraHandle) -> bool {
        let camera_id = camera.id;
        let worker = CameraWorker {
            camera,
            backend: Arc::clone(&self.pipeline.capture),
            frames: Arc::clone(&self.pipeline.frames),
            sensor: Arc::clone(&self.pipeline.sensor),
            faces: self.pipeline.faces.clone(),
            settings: self.pipeline.ingest.clone(),
        };
        let cancel = self.cancel.clone();
        let (done_tx, done) = oneshot::channel();

        let spawned = std::thread::Builder::new()
            .name(format!("camera-{}", camera_id))
            .spawn(move || {
                let report = worker.run(cancel);
                let _ = done_tx.send(report);
            });

        match spawned {
            Ok(thread) => {
                self.cameras.insert(camera_id, CameraTask { thread, done });
                true
            }
            Err(e) => {
                error!(camera_id, error = %e, "Failed to spawn camera worker thread");
                false
            }
        }
    }

    fn spawn_sensor(&mut self, sensor: ResolvedDevice) {
        let poller = self.pollers.poller_for(&sensor);
        let state = Arc::clone(&self.pipeline.sensor);
        let interval = self.pipeline.sensor_poll_interval;
        let cancel = self.cancel.clone();
        let mac = sensor.config.mac.clone();

        let handle = tokio::spawn(monitor::run(sensor, poller, state, interval, cancel));
        self.sensors.insert(mac, handle);
    }

    /// Reconcile on every new snapshot until `shutdown` resolves.
    pub async fn run_until(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                changed = self.snapshot_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = Arc::clone(&self.snapshot_rx.borrow_and_update());
                    let (cameras, sensors) = self.reconcile(&snapshot).await;
                    if cameras > 0 || sensors > 0 {
                        info!(cameras, sensors, "Spawned workers for rediscovered devices");
                    }
                }
            }
        }
    }

    /// Cancel everything and wait (bounded) for workers to finish.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!("Supervisor shutting down");
        self.cancel.cancel();

        let timeout = self.pipeline.join_timeout;
        let mut report = ShutdownReport {
            panicked: self.panicked,
            ..ShutdownReport::default()
        };

        for (camera_id, task) in self.cameras.drain() {
            match tokio::time::timeout(timeout, task.done).await {
                Ok(Ok(worker)) => report.cameras.push(worker),
                Ok(Err(_)) => {
                    report.panicked += 1;
                    error!(camera_id, "Camera worker panicked");
                }
                Err(_) => {
                    report.stragglers += 1;
                    warn!(camera_id, timeout_s = timeout.as_secs(), "Camera worker did not stop in time");
                }
            }
        }

        for (mac, mut handle) in self.sensors.drain() {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(monitor)) => report.sensors.push(monitor),
                Ok(Err(e)) => {
                    if e.is_panic() {
                        report.panicked += 1;
                    }
                    error!(mac = %mac, error = %e, "Sensor monitor task failed");
                }
                Err(_) => {
                    report.stragglers += 1;
                    warn!(mac = %mac, "Sensor monitor did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        if let Some(mut rescan) = self.rescan.take() {
            if tokio::time::timeout(timeout, &mut rescan).await.is_err() {
                report.stragglers += 1;
                warn!("Rescan loop did not stop in time, aborting");
                rescan.abort();
            }
        }

        let publisher = Arc::clone(&self.publisher);
        report.withdrawn = tokio::task::spawn_blocking(move || publisher.shutdown())
            .await
            .unwrap_or_default();

        info!(
            cameras = report.cameras.len(),
            sensors = report.sensors.len(),
            stragglers = report.stragglers,
            panicked = report.panicked,
            "Supervisor stopped"
        );
        report
    }
}
