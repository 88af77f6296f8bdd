//! Broker configuration.
//!
//! The broker snapshots this at construction; changing it afterwards only
//! affects brokers created later.

use frame_manifest::{PixelFormat, ProtocolNames};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::formats;
use crate::error::{BrokerError, BrokerResult, ResultExt};

lazy_static! {
    /// Global broker configuration.
    pub static ref BROKER_CONFIG: RwLock<BrokerConfig> = RwLock::new(BrokerConfig::default());
}

pub const MIN_DISCOVERY_INTERVAL_MS: u64 = 100;
pub const MAX_DISCOVERY_INTERVAL_MS: u64 = 10_000;

/// Output surface format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum OutputFormat {
    #[default]
    Bgra8,
    Rgba8,
}

impl OutputFormat {
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            OutputFormat::Bgra8 => PixelFormat::Bgra8Unorm,
            OutputFormat::Rgba8 => PixelFormat::Rgba8Unorm,
        }
    }
}

/// Manifest prefix a family of producers publishes under, and the type tag
/// reported for streams found through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSignature {
    pub prefix: String,
    pub producer_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Composite output size.
    pub output_width: u32,
    pub output_height: u32,
    pub output_format: OutputFormat,
    /// How often discovery rescans the process list.
    pub discovery_interval_ms: u64,
    /// Prefix of the broker's own published objects.
    pub protocol_prefix: String,
    /// Tag completing the broker's well-known output names.
    pub output_tag: String,
    /// Manifest prefixes probed for every process, in order.
    pub producer_signatures: Vec<ProducerSignature>,
    /// Place objects in the host-global (cross-session) namespace.
    pub use_global_namespace: bool,
    /// Remember PIDs that failed the adapter check or could not be opened.
    pub negative_cache: bool,
    /// Optional color-controls block published by the controlling app.
    pub controls_block_name: Option<String>,
    /// Directory for log files. Logs go to stderr only when unset.
    pub log_directory: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            output_width: 1920,
            output_height: 1080,
            output_format: OutputFormat::Bgra8,
            discovery_interval_ms: 1000,
            protocol_prefix: "FrameBroker_".to_string(),
            output_tag: "Broker".to_string(),
            producer_signatures: vec![ProducerSignature {
                prefix: "FrameBroker_".to_string(),
                producer_type: "FrameBroker".to_string(),
            }],
            use_global_namespace: true,
            negative_cache: true,
            controls_block_name: Some("FrameBroker_Controls".to_string()),
            log_directory: None,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> BrokerResult<()> {
        if formats::find_resolution(self.output_width, self.output_height).is_none() {
            return Err(BrokerError::Config(format!(
                "unsupported output resolution {}x{}",
                self.output_width, self.output_height
            )));
        }
        if !(MIN_DISCOVERY_INTERVAL_MS..=MAX_DISCOVERY_INTERVAL_MS)
            .contains(&self.discovery_interval_ms)
        {
            return Err(BrokerError::Config(format!(
                "discovery interval {} ms outside {}..={} ms",
                self.discovery_interval_ms, MIN_DISCOVERY_INTERVAL_MS, MAX_DISCOVERY_INTERVAL_MS
            )));
        }
        if self.protocol_prefix.is_empty() {
            return Err(BrokerError::Config("protocol prefix is empty".into()));
        }
        if self.producer_signatures.is_empty() {
            return Err(BrokerError::Config("no producer signatures".into()));
        }
        if self.producer_signatures.iter().any(|s| s.prefix.is_empty()) {
            return Err(BrokerError::Config(
                "producer signature with empty prefix".into(),
            ));
        }
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    /// Names for the broker's own publications.
    pub fn protocol_names(&self) -> ProtocolNames {
        ProtocolNames::new(self.protocol_prefix.clone(), self.use_global_namespace)
    }

    /// Names derived for one producer signature.
    pub fn signature_names(&self, signature: &ProducerSignature) -> ProtocolNames {
        ProtocolNames::new(signature.prefix.clone(), self.use_global_namespace)
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Get a copy of the current configuration.
pub fn broker_config() -> BrokerConfig {
    BROKER_CONFIG.read().clone()
}

/// Validate and install a configuration.
pub fn set_broker_config(config: BrokerConfig) -> BrokerResult<()> {
    config.validate()?;
    log::debug!("[CONFIG] set_broker_config({:?})", config);
    *BROKER_CONFIG.write() = config;
    Ok(())
}

/// Read a JSON configuration file, validate it and install it.
pub fn load_config(path: &Path) -> BrokerResult<BrokerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: BrokerConfig = serde_json::from_str(&text)?;
    set_broker_config(config.clone())?;
    log::info!("[CONFIG] Loaded broker config from {}", path.display());
    Ok(config)
}
