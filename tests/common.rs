//! Test utilities: an in-process scripted meter and a recording sink.
#![allow(dead_code)] // not every test file uses every helper

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Timelike, Utc};
use energomer_reader::config::DeviceConfig;
use energomer_reader::meter::Reading;
use energomer_reader::sink::{ReadingSink, SinkError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Standard device fixture pointing at the given port.
pub fn device(port: u16) -> DeviceConfig {
    DeviceConfig {
        name: "boiler-1".into(),
        port,
        id_measuring: 17,
        current_data: "CUR1".into(),
        last_hour_archive: "LHA1".into(),
        backwards_archive: "BWA1".into(),
        forward_archive: String::new(),
    }
}

/// Build a frame of `len` bytes stamped with `ts`, carrying `q1` at both
/// candidate offsets so the decoder finds it wherever it looks.
pub fn frame(len: usize, ts: DateTime<Utc>, q1: f32) -> Vec<u8> {
    let mut f = vec![0u8; len];
    f[0] = ts.second() as u8;
    f[1] = ts.minute() as u8;
    f[2] = ts.hour() as u8;
    f[3] = ts.day() as u8;
    f[4] = ts.month() as u8;
    f[5] = (ts.year() - 2000) as u8;
    f[14..18].copy_from_slice(&q1.to_le_bytes());
    f[24..28].copy_from_slice(&q1.to_le_bytes());
    f
}

/// An in-process meter that replays scripted responses. Each command string
/// maps to a queue of frames, consumed in order across any number of
/// connections. A command with an exhausted (or missing) queue closes the
/// connection, which the session layer treats as end-of-stream.
pub struct ScriptedMeter {
    pub port: u16,
    commands: Arc<Mutex<Vec<String>>>,
}

impl ScriptedMeter {
    pub async fn start(script: HashMap<String, Vec<Vec<u8>>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(script));

        let seen = Arc::clone(&commands);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let script = Arc::clone(&script);
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    loop {
                        let Ok(n) = socket.read(&mut buf).await else {
                            break;
                        };
                        if n == 0 {
                            break;
                        }
                        let command = String::from_utf8_lossy(&buf[..n]).to_string();
                        seen.lock().unwrap().push(command.clone());
                        let response = {
                            let mut script = script.lock().unwrap();
                            match script.get_mut(&command) {
                                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                                _ => None,
                            }
                        };
                        match response {
                            Some(bytes) => {
                                if socket.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                });
            }
        });
        Self { port, commands }
    }

    /// How many times `command` has been received so far.
    pub fn count(&self, command: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    pub fn total(&self) -> usize {
        self.commands.lock().unwrap().len()
    }
}

/// Sink that remembers every insert.
#[derive(Default)]
pub struct RecordingSink {
    readings: Mutex<Vec<(String, Reading)>>,
}

impl RecordingSink {
    pub fn len(&self) -> usize {
        self.readings.lock().unwrap().len()
    }

    pub fn readings(&self) -> Vec<(String, Reading)> {
        self.readings.lock().unwrap().clone()
    }
}

impl ReadingSink for RecordingSink {
    fn insert(&self, device: &DeviceConfig, reading: &Reading) -> Result<(), SinkError> {
        self.readings
            .lock()
            .unwrap()
            .push((device.name.clone(), reading.clone()));
        Ok(())
    }
}

/// Sink that always fails, for exercising the log-and-swallow path.
pub struct FailingSink;

impl ReadingSink for FailingSink {
    fn insert(&self, _device: &DeviceConfig, _reading: &Reading) -> Result<(), SinkError> {
        Err(SinkError::Sql(rusqlite::Error::QueryReturnedNoRows))
    }
}

/// Write a watermark file seeding `last_good` for one device identity.
pub fn seed_watermark_file(path: &std::path::Path, device_id: &str, last_good: DateTime<Utc>) {
    let contents = serde_json::json!({
        "last_successful_retrieval": { device_id: last_good }
    });
    std::fs::write(path, serde_json::to_vec_pretty(&contents).unwrap()).unwrap();
}
