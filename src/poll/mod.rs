//! Fixed-cadence polling of every configured meter.
//!
//! One scheduler task drives the whole service: it sleeps until the next
//! multiple of the poll interval, fetches the current reading of each device
//! in turn (with per-device retries), updates watermarks, and hands devices
//! that may have a gap to a bounded queue of reconciliation workers. Workers
//! run concurrently with the scheduler's next tick, but never two for the
//! same device and never concurrently with that device's current-reading
//! poll.
//!
//! No failure on this path is fatal: retry exhaustion marks the device's
//! watermark as failed and moves on, and the loop runs until the process is
//! stopped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{Config, DeviceConfig};
use crate::meter::{self, FrameError, MeterSession, Reading, SessionError};
use crate::reconcile::{ReconcileJob, Reconciler};
use crate::sink::{self, ReadingSink};
use crate::watermark::WatermarkStore;

/// Devices waiting for a reconciliation worker. A full queue drops the
/// device for this cycle; the gap is still there next tick.
const RECONCILE_QUEUE_DEPTH: usize = 10;

/// Failures of one current-reading attempt.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// The scheduler. Owns the live configuration and the reconciliation queue.
pub struct PollScheduler {
    config_path: PathBuf,
    config: Config,
    config_mtime: Option<SystemTime>,
    store: WatermarkStore,
    sink: Arc<dyn ReadingSink>,
    queue: mpsc::Sender<ReconcileJob>,
}

impl PollScheduler {
    /// Build the scheduler and spawn the reconciliation worker pump. Must be
    /// called inside a Tokio runtime.
    pub fn new(
        config_path: PathBuf,
        config: Config,
        store: WatermarkStore,
        sink: Arc<dyn ReadingSink>,
    ) -> Self {
        let (queue, mut rx) = mpsc::channel::<ReconcileJob>(RECONCILE_QUEUE_DEPTH);
        let reconciler = Arc::new(Reconciler::new(store.clone(), sink.clone()));
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let reconciler = Arc::clone(&reconciler);
                tokio::spawn(async move { reconciler.run(job).await });
            }
        });
        let config_mtime = std::fs::metadata(&config_path)
            .ok()
            .and_then(|meta| meta.modified().ok());
        Self {
            config_path,
            config,
            config_mtime,
            store,
            sink,
            queue,
        }
    }

    /// Run forever: tick, poll, repeat.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            wait_for_tick(self.config.poll.interval()).await;
            self.reload_config_if_changed().await;
            info!("Started transfer data");
            self.run_cycle().await;
            info!("Ended transfer data");
        }
    }

    /// One polling cycle over the current device list.
    pub async fn run_cycle(&self) {
        let devices = self.config.devices.clone();
        for device in &devices {
            self.poll_device(device).await;
        }
    }

    async fn poll_device(&self, device: &DeviceConfig) {
        let device_id = &device.current_data;
        if self.store.is_reconciling(device_id) {
            debug!("Skipping {}: reconciliation in progress", device.name);
            return;
        }
        if self.fetch_current_with_retries(device).await {
            self.store.update_on_success(device_id);
            self.enqueue_reconciliation(device);
        } else {
            self.store.mark_failed(device_id);
        }
    }

    /// Claim the device and queue a walk. The claim is made here, at enqueue
    /// time, so a second enqueue for the same device is impossible while the
    /// first walk is queued or running.
    fn enqueue_reconciliation(&self, device: &DeviceConfig) {
        let device_id = &device.current_data;
        if !self.store.begin_reconcile(device_id) {
            return;
        }
        let job = ReconcileJob::new(&self.config, device.clone());
        if self.queue.try_send(job).is_err() {
            self.store.finish_reconcile(device_id);
            warn!(
                "Reconciliation queue full, {} waits for a later cycle",
                device.name
            );
        }
    }

    async fn fetch_current_with_retries(&self, device: &DeviceConfig) -> bool {
        let max = self.config.poll.max_read_retries;
        for attempt in 1..=max {
            match self.fetch_current(device).await {
                Ok(reading) => {
                    self.deliver(device, &reading).await;
                    return true;
                }
                Err(err) => warn!(
                    "Attempt {attempt}/{max} for {} failed: {err}",
                    device.name
                ),
            }
        }
        error!(
            "Reached maximum retries, unable to retrieve valid data from {}",
            device.name
        );
        false
    }

    /// One attempt: fresh session, current-reading command, decode.
    async fn fetch_current(&self, device: &DeviceConfig) -> Result<Reading, PollError> {
        let mut session =
            MeterSession::open(&self.config.connection.host, device.port).await?;
        let outcome = meter::exchange(
            &mut session,
            device,
            &device.current_data,
            self.config.poll.read_timeout(),
        )
        .await;
        session.close().await;
        let response = outcome?;
        Ok(meter::decode(&response, Utc::now())?)
    }

    /// Sink failures are logged and swallowed: acquisition succeeded, and
    /// delivery is at-least-attempted, not guaranteed. The insert runs on
    /// the blocking pool, keeping the synchronous database call off the
    /// runtime workers.
    async fn deliver(&self, device: &DeviceConfig, reading: &Reading) {
        match sink::insert_blocking(&self.sink, device, reading).await {
            Ok(()) => info!(
                "Date: {}, Device: {}, Q1: {}",
                reading.sink_timestamp(),
                device.name,
                reading.q1
            ),
            Err(err) => error!("Sink write for {} failed: {err}", device.name),
        }
    }

    /// Reload the config file when its mtime moved, tolerating the device
    /// list changing between ticks. A broken file keeps the previous
    /// configuration.
    async fn reload_config_if_changed(&mut self) {
        let mtime = Config::modified(&self.config_path).await;
        if mtime == self.config_mtime {
            return;
        }
        match Config::load(&self.config_path).await {
            Ok(config) => {
                info!(
                    "Configuration changed, now polling {} device(s)",
                    config.devices.len()
                );
                self.config = config;
            }
            Err(err) => warn!("Config reload failed, keeping previous configuration: {err}"),
        }
        self.config_mtime = mtime;
    }
}

/// Sleep until the next wall-clock multiple of `interval`.
async fn wait_for_tick(interval: Duration) {
    tokio::time::sleep(tick_delay(interval, Utc::now().timestamp_millis())).await;
}

/// Time until the next multiple of `interval` after `now_ms`. Saturating
/// throughout, so an absurdly large interval sleeps long instead of
/// overflowing.
fn tick_delay(interval: Duration, now_ms: i64) -> Duration {
    let interval_ms = i64::try_from(interval.as_millis())
        .unwrap_or(i64::MAX)
        .max(1);
    let next_ms = (now_ms / interval_ms)
        .saturating_add(1)
        .saturating_mul(interval_ms);
    Duration::from_millis(next_ms.saturating_sub(now_ms).max(0) as u64)
}
