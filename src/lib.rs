//! # energomer-reader - Energomer-125 polling service
//!
//! Periodically polls Energomer-125 meters over a proprietary binary TCP
//! protocol, decodes their fixed-layout measurement frames, and walks each
//! device's hourly archive backwards to fill gaps left by outages.
//!
//! ## Features
//!
//! - **Wall-clock polling**: ticks align to multiples of the configured
//!   interval, so readings land on predictable boundaries.
//! - **Bit-exact frame decoding**: 132/336-byte frames with packed BCD-free
//!   byte timestamps, an error flag, and a little-endian `f32` quantity,
//!   validated before anything reaches the sink.
//! - **Gap reconciliation**: durable per-device watermarks detect missed
//!   hours across restarts; a bounded worker pool backfills them from the
//!   device archive without duplicating or skipping samples.
//! - **Hot-reloadable device list**: the TOML config is re-read between
//!   ticks when it changes on disk.
//! - **Async design**: built with Tokio; one scheduler task, one short-lived
//!   session per request, reconciliation workers in parallel.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! use energomer_reader::config::Config;
//! use energomer_reader::poll::PollScheduler;
//! use energomer_reader::sink::{ReadingSink, SqlSink};
//! use energomer_reader::watermark::WatermarkStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let store = WatermarkStore::load(&config.watermark_file)?;
//!     let sink: Arc<dyn ReadingSink> =
//!         Arc::new(SqlSink::open(&config.sink.database, config.sink.query_insert.clone())?);
//!     let scheduler = PollScheduler::new(PathBuf::from("config.toml"), config, store, sink);
//!     scheduler.run().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`meter`] - Session handling and frame decoding for the wire protocol
//! - [`watermark`] - Durable per-device retrieval watermarks
//! - [`reconcile`] - The backward archive walk that fills gaps
//! - [`poll`] - The fixed-cadence scheduler and worker pool
//! - [`sink`] - Delivery of accepted readings to the relational store
//! - [`config`] - Configuration management and validation

pub mod config;
pub mod meter;
pub mod poll;
pub mod reconcile;
pub mod sink;
pub mod watermark;
