//! Broker configuration management.
//!
//! ## Architecture
//!
//! - `BrokerConfig`: output surface, discovery cadence, naming and caching
//!   settings, held in a global `parking_lot::RwLock` and loadable from JSON.
//! - `formats`: the output resolutions offered to clients.

pub mod broker;
pub mod formats;

pub use broker::{
    broker_config, load_config, set_broker_config, BrokerConfig, OutputFormat, ProducerSignature,
    BROKER_CONFIG,
};
