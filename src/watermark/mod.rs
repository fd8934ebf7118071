//! Durable per-device retrieval watermarks.
//!
//! For every meter the store tracks two timestamps keyed by the device's
//! `current_data` command string:
//!
//! - `last_good`: the most recent hour for which data is confirmed recorded.
//!   Persisted to a JSON file so gaps survive restarts.
//! - `current`: set optimistically on every successful polling cycle, never
//!   persisted; rebuilt by re-polling after a restart. A sentinel far in the
//!   past means "this cycle failed, do not treat as real data".
//!
//! `last_good` is promoted from `current` only when the *prior* cycle also
//! succeeded, so one lucky poll after an outage does not hide the gap.
//!
//! The store also owns the in-progress set that keeps two reconciliation
//! walks for one device from running concurrently. One mutex guards both
//! maps and the set; it is never held across an await point. Saves are
//! fire-and-forget tasks that snapshot the map under the lock at write time,
//! so the file never lags behind the mutation that scheduled the write.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watermark file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// On-disk shape of the watermark file. Only `last_good` values are durable.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WatermarkFile {
    last_successful_retrieval: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    last_good: HashMap<String, DateTime<Utc>>,
    current: HashMap<String, DateTime<Utc>>,
    in_progress: HashSet<String>,
}

/// Sentinel marking a failed retrieval cycle. Year 1 cannot be produced by
/// the frame decoder, so it is unambiguous.
pub fn invalid_sentinel() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap()
}

fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Shared handle to the watermark state. Cloning is cheap; all clones see the
/// same maps.
#[derive(Clone)]
pub struct WatermarkStore {
    path: Arc<PathBuf>,
    inner: Arc<Mutex<Inner>>,
}

impl WatermarkStore {
    /// Load persisted `last_good` values. A missing file is not an error: the
    /// store starts empty and the file appears on the first save.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WatermarkError> {
        let path = path.as_ref().to_path_buf();
        let mut inner = Inner::default();
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let file: WatermarkFile = serde_json::from_str(&content)?;
                inner.last_good = file.last_successful_retrieval;
                info!(
                    "Loaded {} watermark(s) from {}",
                    inner.last_good.len(),
                    path.display()
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("Watermark file {} not found, starting empty", path.display());
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Self {
            path: Arc::new(path),
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Record a successful polling cycle: promote `current` to `last_good`
    /// when the prior cycle also succeeded, then stamp `current` with now.
    /// Schedules a save.
    pub fn update_on_success(&self, device_id: &str) {
        self.update_on_success_at(device_id, Utc::now());
    }

    /// Same as [`update_on_success`](Self::update_on_success) with an
    /// explicit clock, for tests.
    pub fn update_on_success_at(&self, device_id: &str, now: DateTime<Utc>) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let prior = inner.current.get(device_id).copied();
            if let Some(prior) = prior.filter(|ts| *ts != invalid_sentinel()) {
                inner.last_good.insert(device_id.to_string(), prior);
            }
            inner.current.insert(device_id.to_string(), now);
            debug!(
                "Watermarks for {device_id}: last_good={:?} current={now}",
                inner.last_good.get(device_id)
            );
        }
        self.schedule_save();
    }

    /// Record an exhausted polling cycle: `current` becomes the sentinel so
    /// gap computation skips the device until a future cycle succeeds.
    /// `last_good` is untouched.
    pub fn mark_failed(&self, device_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .current
            .insert(device_id.to_string(), invalid_sentinel());
    }

    /// Whether the device's latest cycle produced real data.
    pub fn current_is_valid(&self, device_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .current
            .get(device_id)
            .is_some_and(|ts| *ts != invalid_sentinel())
    }

    /// Integer hour gap between `last_good` and `current`, both truncated to
    /// the hour, clamped to `max_gap_hours`. A device that has never been
    /// seen defaults to one hour behind now, yielding no gap.
    pub fn compute_gap(&self, device_id: &str, max_gap_hours: i64) -> i64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let current = match inner.current.get(device_id) {
            Some(ts) if *ts != invalid_sentinel() => truncate_to_hour(*ts),
            _ => return 0,
        };
        let last_good = inner
            .last_good
            .get(device_id)
            .copied()
            .unwrap_or_else(|| Utc::now() - Duration::hours(1));
        let diff = (current - truncate_to_hour(last_good)).num_hours();
        diff.min(max_gap_hours)
    }

    /// Claim the device for reconciliation. Returns false when a walk is
    /// already running, in which case the caller must not start another.
    pub fn begin_reconcile(&self, device_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.in_progress.insert(device_id.to_string())
    }

    /// Release the device after a walk, whatever its outcome.
    pub fn finish_reconcile(&self, device_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.in_progress.remove(device_id);
    }

    pub fn is_reconciling(&self, device_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.in_progress.contains(device_id)
    }

    pub fn last_good(&self, device_id: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_good.get(device_id).copied()
    }

    /// Fire-and-forget persistence. The spawned task snapshots the map under
    /// the lock when it runs, so completed writes are at least as fresh as
    /// the update that scheduled them.
    fn schedule_save(&self) {
        let store = self.clone();
        tokio::spawn(async move {
            if let Err(err) = store.save().await {
                error!("Failed to persist watermarks: {err}");
            }
        });
    }

    async fn save(&self) -> Result<(), WatermarkError> {
        let data = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let file = WatermarkFile {
                last_successful_retrieval: inner.last_good.clone(),
            };
            serde_json::to_vec_pretty(&file)?
        };
        tokio::fs::write(self.path.as_ref(), data).await?;
        debug!("Watermarks saved to {}", self.path.display());
        Ok(())
    }

    /// Synchronous save used by tests and on shutdown paths where the runtime
    /// is about to go away.
    pub fn save_blocking(&self) -> Result<(), WatermarkError> {
        let data = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let file = WatermarkFile {
                last_successful_retrieval: inner.last_good.clone(),
            };
            serde_json::to_vec_pretty(&file)?
        };
        std::fs::write(self.path.as_ref(), data)?;
        Ok(())
    }
}
