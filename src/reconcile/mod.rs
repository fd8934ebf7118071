//! Gap reconciliation: walking a meter's hourly archive backwards to fill
//! missed hours.
//!
//! A walk is entered only after a successful current-reading cycle, for one
//! device at a time (the watermark store's in-progress set enforces this).
//! The shape of a walk for a gap of `n` hours:
//!
//! 1. **Seed**: one `last_hour_archive` request on a fresh session.
//! 2. **Step** × (n−1): `backwards_archive` requests on the same session,
//!    each moving one hour further into the past.
//!
//! The device occasionally answers a step with a frame that is not on an
//! hour boundary. The walk then re-requests at the same depth instead of
//! advancing, so no hour is skipped; a bounded number of consecutive
//! re-requests keeps a wedged device from pinning the walk forever. Any
//! transport or decode failure aborts the walk outright. Nothing is
//! persisted mid-walk: an aborted walk simply leaves the gap to be
//! recomputed and retried on a later cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{Config, DeviceConfig};
use crate::meter::{self, FrameError, MeterSession, SessionError};
use crate::sink::{self, ReadingSink};
use crate::watermark::WatermarkStore;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The device kept answering off the hour boundary.
    #[error("archive stuck off the hour boundary after {retries} re-request(s)")]
    MisalignedArchive { retries: u32 },
}

/// Everything one walk needs, snapshotted from the configuration at enqueue
/// time so a config reload mid-walk cannot change the rules underneath it.
#[derive(Debug, Clone)]
pub struct ReconcileJob {
    pub device: DeviceConfig,
    pub host: String,
    pub read_timeout: Duration,
    pub max_read_retries: u32,
    pub max_gap_hours: i64,
    pub gap_skip_threshold: i64,
}

impl ReconcileJob {
    pub fn new(config: &Config, device: DeviceConfig) -> Self {
        Self {
            device,
            host: config.connection.host.clone(),
            read_timeout: config.poll.read_timeout(),
            max_read_retries: config.poll.max_read_retries,
            max_gap_hours: config.poll.max_gap_hours,
            gap_skip_threshold: config.poll.gap_skip_threshold,
        }
    }
}

/// Drives archive walks. One instance serves all devices; per-device
/// exclusivity lives in the watermark store.
pub struct Reconciler {
    store: WatermarkStore,
    sink: Arc<dyn ReadingSink>,
}

impl Reconciler {
    pub fn new(store: WatermarkStore, sink: Arc<dyn ReadingSink>) -> Self {
        Self { store, sink }
    }

    /// Execute one reconciliation job. The device's in-progress claim is
    /// released on every exit path.
    pub async fn run(&self, job: ReconcileJob) {
        let device_id = job.device.current_data.clone();
        match self.attempt(&job).await {
            Ok(0) => {}
            Ok(hours) => info!("Backfilled {hours} hour(s) for {}", job.device.name),
            Err(err) => warn!(
                "Reconciliation for {} aborted: {err}; the gap is recomputed next cycle",
                job.device.name
            ),
        }
        self.store.finish_reconcile(&device_id);
    }

    async fn attempt(&self, job: &ReconcileJob) -> Result<i64, ReconcileError> {
        let device_id = &job.device.current_data;
        if !self.store.current_is_valid(device_id) {
            debug!("Skipping {}: last cycle failed", job.device.name);
            return Ok(0);
        }
        let gap = self.store.compute_gap(device_id, job.max_gap_hours);
        if gap <= job.gap_skip_threshold {
            debug!("Gap of {gap}h for {} needs no walk", job.device.name);
            return Ok(0);
        }
        info!("Gap of {gap} hour(s) for {}, walking archive", job.device.name);

        let mut session = MeterSession::open(&job.host, job.device.port).await?;
        let outcome = self.walk(&mut session, job, gap).await;
        session.close().await;
        outcome
    }

    async fn walk(
        &self,
        session: &mut MeterSession,
        job: &ReconcileJob,
        gap: i64,
    ) -> Result<i64, ReconcileError> {
        let device = &job.device;

        let seed =
            meter::exchange(session, device, &device.last_hour_archive, job.read_timeout).await?;
        let reading = meter::decode(&seed, Utc::now())?;
        self.write(device, &reading).await;

        // The seed covers the most recent missing hour; each accepted step
        // covers the next one backwards. A step is accepted only once its
        // frame sits on an hour boundary, so a mid-hour frame is never
        // written and never advances the depth.
        let mut filled: i64 = 1;
        let mut reasked = 0u32;
        while filled < gap {
            let response =
                meter::exchange(session, device, &device.backwards_archive, job.read_timeout)
                    .await?;
            if !meter::is_hour_aligned(&response) {
                reasked += 1;
                if reasked > job.max_read_retries {
                    return Err(ReconcileError::MisalignedArchive { retries: reasked });
                }
                debug!(
                    "Archive frame for {} off the hour boundary, re-requesting depth {filled}",
                    device.name
                );
                continue;
            }
            reasked = 0;
            let reading = meter::decode(&response, Utc::now())?;
            self.write(device, &reading).await;
            filled += 1;
        }
        Ok(filled)
    }

    /// Sink inserts run on the blocking pool so a slow database never stalls
    /// the runtime; failures are logged and swallowed.
    async fn write(&self, device: &DeviceConfig, reading: &crate::meter::Reading) {
        match sink::insert_blocking(&self.sink, device, reading).await {
            Ok(()) => info!(
                "Date: {}, Device: {}, Q1: {}",
                reading.sink_timestamp(),
                device.name,
                reading.q1
            ),
            Err(err) => warn!("Sink write for {} failed: {err}", device.name),
        }
    }
}
