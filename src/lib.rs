//! Streaming network throughput and latency measurement.
//!
//! [`speedtest::SpeedTest`] starts download, upload and probe sessions that
//! report live, rate-limited progress as a sequence of
//! [`speedtest::Event`]s, and cancels uploads through a shared
//! [`speedtest::registry::CancelRegistry`].

pub mod error;
pub mod settings;
pub mod speedtest;
