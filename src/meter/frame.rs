//! Fixed-layout frame decoding for Energomer-125 responses.
//!
//! Every response the meter sends is a raw binary frame with the same leading
//! field layout:
//!
//!   `<sec><min><hour><day><month><year-2000> ... <error flag @9> ... <Q1 f32le @14 or @24> ...`
//!
//! Archive responses are 132 bytes, current-reading responses 336 bytes. A
//! frame shorter than 132 bytes (a timed-out or truncated read) is rejected
//! here rather than in the session layer, because the device legitimately
//! closes the stream early and the session cannot distinguish "short" from
//! "done".
use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use log::debug;
use thiserror::Error;

/// Length of an archive frame; also the minimum acceptable response length.
pub const ARCHIVE_FRAME_LEN: usize = 132;

/// Length of a current-reading frame.
pub const CURRENT_FRAME_LEN: usize = 336;

/// Offset of the device error flag byte.
const ERROR_FLAG_OFFSET: usize = 9;

/// Largest quantity the meter can plausibly report; anything outside
/// `[0, Q1_MAX]` is treated as "no reading" and stored as zero.
const Q1_MAX: f32 = 10_000.0;

/// Half-width of the timestamp plausibility window around UTC midnight.
const DATE_WINDOW_HOURS: i64 = 48;

/// Reasons a frame is rejected before reaching the sink.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// Fewer bytes arrived than the shortest valid frame.
    #[error("short frame: got {got} bytes, need at least {ARCHIVE_FRAME_LEN}")]
    ShortFrame { got: usize },

    /// The device set its error flag; the rest of the frame is unusable.
    #[error("device error flag set")]
    DeviceErrorFlag,

    /// The decoded timestamp is outside the ±48h plausibility window, or the
    /// date bytes do not form a calendar date at all (a garbled frame).
    #[error("implausible date in frame: {0}")]
    ImplausibleDate(String),
}

/// One decoded measurement, ready for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Normalized UTC timestamp. For hour-boundary archive frames this is one
    /// hour earlier than the raw frame timestamp (the device stamps the hour
    /// that just ended with the boundary itself).
    pub timestamp: DateTime<Utc>,
    /// Measured quantity Q1, zeroed when the raw value was out of range.
    pub q1: f32,
}

impl Reading {
    /// Timestamp in the sink's `YYYY-MM-DD HH:MM:SS` format.
    pub fn sink_timestamp(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

/// Decode and validate one response frame.
///
/// `now` anchors the timestamp plausibility window; production callers pass
/// `Utc::now()`. The decode is total: no byte pattern panics.
pub fn decode(frame: &[u8], now: DateTime<Utc>) -> Result<Reading, FrameError> {
    if frame.len() < ARCHIVE_FRAME_LEN {
        return Err(FrameError::ShortFrame { got: frame.len() });
    }

    if frame[ERROR_FLAG_OFFSET] == 1 {
        return Err(FrameError::DeviceErrorFlag);
    }

    let mut timestamp = decode_timestamp(frame)?;
    check_date_window(timestamp, now)?;

    let hour_boundary = timestamp.minute() == 0 && timestamp.second() == 0;

    // Current-reading frames carry Q1 at 24; archive frames and hour-boundary
    // frames carry it at 14.
    let offset = if frame.len() == ARCHIVE_FRAME_LEN || hour_boundary {
        14
    } else {
        24
    };
    let raw = [frame[offset], frame[offset + 1], frame[offset + 2], frame[offset + 3]];
    let mut q1 = f32::from_le_bytes(raw);
    if !(0.0..=Q1_MAX).contains(&q1) {
        debug!("Q1 out of range ({q1}), storing zero");
        q1 = 0.0;
    }

    // An hour-boundary stamp designates the hour that just ended.
    if hour_boundary {
        timestamp -= Duration::hours(1);
    }

    Ok(Reading { timestamp, q1 })
}

/// Whether the frame's raw timestamp lands exactly on an hour boundary
/// (minute and second bytes both zero). The reconciler uses this to confirm
/// a backwards-archive step actually returned an hourly sample.
pub fn is_hour_aligned(frame: &[u8]) -> bool {
    frame.len() >= 2 && frame[0] == 0 && frame[1] == 0
}

fn decode_timestamp(frame: &[u8]) -> Result<DateTime<Utc>, FrameError> {
    let (sec, min, hour) = (frame[0] as u32, frame[1] as u32, frame[2] as u32);
    let (day, month) = (frame[3] as u32, frame[4] as u32);
    let year = 2000 + frame[5] as i32;

    Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
        .single()
        .ok_or_else(|| {
            FrameError::ImplausibleDate(format!(
                "{year:04}-{month:02}-{day:02} {hour:02}:{min:02}:{sec:02}"
            ))
        })
}

/// The timestamp must fall strictly inside (today − 48h, today + 48h), with
/// "today" being the current UTC date at midnight.
fn check_date_window(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), FrameError> {
    let today = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now);
    let earliest = today - Duration::hours(DATE_WINDOW_HOURS);
    let latest = today + Duration::hours(DATE_WINDOW_HOURS);

    if timestamp > earliest && timestamp < latest {
        Ok(())
    } else {
        Err(FrameError::ImplausibleDate(format!(
            "{} outside ({}, {})",
            timestamp, earliest, latest
        )))
    }
}
