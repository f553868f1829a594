/// Sensor monitor worker.
///
/// Polls one sensor's reporting endpoint at a fixed interval and feeds the
/// payload into the shared `SensorState`. Only transitions are logged at
/// info. Every failure (timeout, refused connection, malformed payload) is
/// logged and the loop carries on; only cancellation ends it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::ResolvedDevice;
use crate::fault::FaultKind;
use crate::sensor::{parse_motion, SensorState};

/// Fetches one raw reading from a sensor. Implementations bound the
/// request with their own timeout.
pub trait SensorPoller: Send + Sync {
    fn poll(&self) -> impl Future<Output = anyhow::Result<String>> + Send;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub polls: u64,
    pub transitions: u64,
    pub errors: u64,
}

/// Run until `cancel` fires. The interval is applied after every poll
/// regardless of its outcome.
pub async fn run<P: SensorPoller>(
    sensor: ResolvedDevice,
    poller: P,
    state: Arc<SensorState>,
    interval: Duration,
    cancel: CancellationToken,
) -> MonitorReport {
    let name = sensor.config.name.as_str();
    let mac = sensor.config.mac.as_str();
    let mut report = MonitorReport::default();

    info!(sensor = %name, mac = %mac, ip = %sensor.ip, "Sensor monitor started");

    while !cancel.is_cancelled() {
        report.polls += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = poller.poll() => result,
        };

        match result {
            Ok(payload) => match parse_motion(&payload) {
                Some(value) => {
                    if state.store(value) {
                        report.transitions += 1;
                        info!(motion = value, sensor = %name, mac = %mac, "Motion state changed");
                    }
                }
                None => {
                    report.errors += 1;
                    debug!(sensor = %name, payload = %payload.trim(), "Unparseable sensor payload");
                }
            },
            Err(e) => {
                report.errors += 1;
                warn!(
                    kind = %FaultKind::TransientIo,
                    sensor = %name,
                    mac = %mac,
                    error = %e,
                    "Sensor poll failed"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!(
        sensor = %name,
        polls = report.polls,
        transitions = report.transitions,
        errors = report.errors,
        "Sensor monitor stopped"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConfig, DeviceRole};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted readings, then cancels once the script runs out.
    struct Scripted {
        readings: Mutex<VecDeque<anyhow::Result<String>>>,
        cancel: CancellationToken,
    }

    impl SensorPoller for Scripted {
        fn poll(&self) -> impl Future<Output = anyhow::Result<String>> + Send {
            let next = self.readings.lock().unwrap().pop_front();
            let cancel = self.cancel.clone();
            async move {
                match next {
                    Some(reading) => reading,
                    None => {
                        cancel.cancel();
                        Err(anyhow::anyhow!("script exhausted"))
                    }
                }
            }
        }
    }

    fn sensor() -> ResolvedDevice {
        ResolvedDevice::new(
            DeviceConfig {
                name: "ultrasonic".to_string(),
                mac: "CCCCCCCCCC01".to_string(),
                role: DeviceRole::Sensor,
                port: 81,
                stream_path: "/stream".to_string(),
            },
            "127.0.0.1".parse().unwrap(),
        )
    }

    async fn replay(readings: Vec<anyhow::Result<String>>) -> (MonitorReport, Arc<SensorState>) {
        let cancel = CancellationToken::new();
        let poller = Scripted {
            readings: Mutex::new(readings.into()),
            cancel: cancel.clone(),
        };
        let state = Arc::new(SensorState::new());
        let report = run(sensor(), poller, Arc::clone(&state), Duration::from_millis(1), cancel).await;
        (report, state)
    }

    #[tokio::test]
    async fn duplicate_readings_are_one_transition() {
        let (report, state) = replay(vec![
            Ok("1".to_string()),
            Ok("1".to_string()),
            Ok("0".to_string()),
        ])
        .await;

        assert_eq!(report.transitions, 2);
        assert!(!state.get_motion());
    }

    #[tokio::test]
    async fn errors_do_not_stop_the_loop() {
        let (report, state) = replay(vec![
            Err(anyhow::anyhow!("connection refused")),
            Ok("garbage".to_string()),
            Ok("1".to_string()),
        ])
        .await;

        assert_eq!(report.transitions, 1);
        // Two scripted failures plus the exhausted-script poll
        assert_eq!(report.errors, 3);
        assert!(state.get_motion());
    }

    #[tokio::test]
    async fn cancelled_monitor_exits_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let poller = Scripted {
            readings: Mutex::new(VecDeque::new()),
            cancel: cancel.clone(),
        };
        let report = run(
            sensor(),
            poller,
            Arc::new(SensorState::new()),
            Duration::from_secs(60),
            cancel,
        )
        .await;
        assert_eq!(report.polls, 0);
    }
}
