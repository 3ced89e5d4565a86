pub mod config;
pub mod dsp;
pub mod error;
pub mod iiod;
pub mod metrics;
pub mod sdr;
pub mod telemetry;
pub mod tracker;

pub use config::Config;
pub use error::{Error, Result};
pub use metrics::Metrics;
