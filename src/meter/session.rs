//! TCP command/response session with one meter.
//!
//! The Energomer link is strictly half-duplex: write one plaintext ASCII
//! command, then read one binary frame. The device does not delimit frames;
//! the caller knows how many bytes to expect from the command it just sent
//! (see [`expected_response_len`](crate::meter::expected_response_len)) and
//! a short final read means "no more data coming", not a transport failure.
//! Short frames are therefore returned as data and rejected (or not) by the
//! frame decoder downstream.
use std::time::Duration;

use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

use super::SessionError;

const READ_CHUNK: usize = 4096;

/// One TCP connection to one meter. Sessions are cheap and short-lived: the
/// poller opens one per current-reading attempt, the reconciler one per walk.
#[derive(Debug)]
pub struct MeterSession {
    stream: Option<TcpStream>,
    peer: String,
}

impl MeterSession {
    /// Resolve and dial `host:port`. No retry here; callers retry whole
    /// attempts.
    pub async fn open(host: &str, port: u16) -> Result<Self, SessionError> {
        let peer = format!("{host}:{port}");
        let stream = TcpStream::connect(&peer)
            .await
            .map_err(|source| SessionError::Connection {
                peer: peer.clone(),
                source,
            })?;
        debug!("Connected to meter at {peer}");
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    /// Write a command's raw bytes. A write failure invalidates the session:
    /// the socket is dropped and the session must be reopened.
    pub async fn send(&mut self, command: &str) -> Result<(), SessionError> {
        let stream = self.stream.as_mut().ok_or(SessionError::NotConnected)?;
        if let Err(source) = stream.write_all(command.as_bytes()).await {
            self.stream = None;
            return Err(SessionError::Write { source });
        }
        info!("Command {command} sent to {}", self.peer);
        Ok(())
    }

    /// Read until `expected_len` bytes have accumulated, the deadline passes,
    /// or the peer closes the stream. The latter two return the bytes read so
    /// far: the device protocol treats a short final read as end of response,
    /// and validation happens in the decoder. Only a genuine socket error
    /// fails.
    pub async fn receive(
        &mut self,
        expected_len: usize,
        read_timeout: Duration,
    ) -> Result<Vec<u8>, SessionError> {
        let stream = self.stream.as_mut().ok_or(SessionError::NotConnected)?;
        let deadline = Instant::now() + read_timeout;
        let mut response = Vec::with_capacity(expected_len);
        let mut buf = [0u8; READ_CHUNK];

        while response.len() < expected_len {
            match timeout_at(deadline, stream.read(&mut buf)).await {
                Err(_) => {
                    debug!(
                        "Read deadline elapsed at {} of {expected_len} bytes from {}",
                        response.len(),
                        self.peer
                    );
                    break;
                }
                Ok(Ok(0)) => {
                    debug!(
                        "Peer {} closed the stream at {} of {expected_len} bytes",
                        self.peer,
                        response.len()
                    );
                    break;
                }
                Ok(Ok(n)) => {
                    debug!("Received {n} bytes from {}", self.peer);
                    response.extend_from_slice(&buf[..n]);
                }
                Ok(Err(source)) => return Err(SessionError::Read { source }),
            }
        }
        debug!("Frame from {}: {:?}", self.peer, response);
        Ok(response)
    }

    /// Close the socket if it is still open. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Closed session to {}", self.peer);
        }
    }
}
