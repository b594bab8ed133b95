//! Logging setup for binaries embedding the broker.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application, or to [`init_tracing`] with the
//! `tracing-basic` feature.

#[cfg(feature = "tracing-basic")]
mod logging;

#[cfg(feature = "tracing-basic")]
pub use logging::init_tracing;
