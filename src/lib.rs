//! Cross-process GPU frame broker.
//!
//! Producer processes publish frames through a shared texture, a shared fence
//! and a small shared-memory manifest named after their PID. The broker finds
//! them, mirrors their frames on its own device, composites the routed ones
//! into one output and republishes that output under a well-known name. A
//! virtual-camera shim picks the output up with [`subscriber::BrokerSubscriber`].
//!
//! The controlling application drives everything through the C exports in
//! [`ffi`], or through [`broker::BrokerFacade`] when linked as a Rust library.

pub mod broker;
pub mod compositor;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod ffi;
pub mod gpu;
pub mod logging;
pub mod publisher;
pub mod routing;
pub mod subscriber;

pub use broker::{Broker, BrokerFacade, BrokerState, DEFAULT_PIP_CORNER};
pub use compositor::CompositeReport;
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use publisher::{FramePublisher, FrameSource, Producer, TestPatternSource};
pub use routing::{PipCorner, RoutingTable};
pub use subscriber::BrokerSubscriber;
