//! Meter protocol layer: session handling and frame decoding.
//!
//! The Energomer-125 speaks a bare command/response protocol over TCP:
//! plaintext ASCII command strings go out, fixed-layout binary frames come
//! back. [`session`] owns the transport exchange, [`frame`] owns bit-exact
//! decoding and validation. Neither knows about watermarks or scheduling;
//! the reconciler and poller drive them.

pub mod frame;
pub mod session;

use thiserror::Error;

pub use frame::{decode, is_hour_aligned, FrameError, Reading, ARCHIVE_FRAME_LEN, CURRENT_FRAME_LEN};
pub use session::MeterSession;

use crate::config::DeviceConfig;

/// Transport-level failures on a meter session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Address resolution or dial failure.
    #[error("connection to {peer} failed: {source}")]
    Connection {
        peer: String,
        source: std::io::Error,
    },

    /// Write failure; the session has been invalidated and must be reopened.
    #[error("write failed: {source}")]
    Write { source: std::io::Error },

    /// A socket error that is neither a timeout nor end-of-stream.
    #[error("read failed: {source}")]
    Read { source: std::io::Error },

    /// Operation on a session whose socket is already gone.
    #[error("session is not connected")]
    NotConnected,
}

/// Expected response length for a command, keyed off the command just sent:
/// the device's current-reading command yields a 336-byte frame, every
/// archive command a 132-byte frame.
pub fn expected_response_len(device: &DeviceConfig, command: &str) -> usize {
    if command == device.current_data {
        CURRENT_FRAME_LEN
    } else {
        ARCHIVE_FRAME_LEN
    }
}

/// One command/response exchange on an open session. The expected frame
/// length is selected from the command being sent, never from earlier
/// requests.
pub async fn exchange(
    session: &mut MeterSession,
    device: &DeviceConfig,
    command: &str,
    read_timeout: std::time::Duration,
) -> Result<Vec<u8>, SessionError> {
    session.send(command).await?;
    let expected = expected_response_len(device, command);
    session.receive(expected, read_timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_len_keyed_off_sent_command() {
        let device = DeviceConfig {
            name: "boiler-1".into(),
            port: 5001,
            id_measuring: 17,
            current_data: "CUR1".into(),
            last_hour_archive: "LHA1".into(),
            backwards_archive: "BWA1".into(),
            forward_archive: String::new(),
        };
        assert_eq!(expected_response_len(&device, "CUR1"), CURRENT_FRAME_LEN);
        assert_eq!(expected_response_len(&device, "LHA1"), ARCHIVE_FRAME_LEN);
        assert_eq!(expected_response_len(&device, "BWA1"), ARCHIVE_FRAME_LEN);
    }
}
