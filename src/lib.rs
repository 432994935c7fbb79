//! Device cloud-sync engine
//!
//! Keeps an embedded device connected to its cloud hub and its twin in sync.
//!
//! # Overview
//!
//! - [`engine`]: poll-driven connection lifecycle (WiFi, DNS, socket, broker
//!   session) with tick-based retry budgets and an idempotent reset
//! - [`twin`]: desired/reported property reconciliation with dirty tracking
//! - [`frame`]: byte-at-a-time decoder for length-prefixed serial frames
//! - [`session`]: hub and provisioning-service session flavours and topics
//! - [`telemetry`]: telemetry payloads and direct-method handling
//! - [`device`]: the [`CloudSync`] facade tying it all together
//!
//! # Quick Start
//!
//! ```rust
//! use cloudsync::{CloudSync, SyncConfig};
//! use cloudsync::testing::MockTransport;
//!
//! let config = SyncConfig::default_for("sensor-1");
//! let mut sync = CloudSync::new(MockTransport::simulated(), &config).unwrap();
//! for _ in 0..20 {
//!     sync.tick();
//! }
//! assert!(sync.is_connected());
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod frame;
pub mod observability;
pub mod session;
pub mod telemetry;
pub mod testing;
pub mod transport;
pub mod twin;

pub use config::{ConfigError, SyncConfig, TimingConfig};
pub use device::{CloudSync, DeviceEvent, DeviceStatus};
pub use engine::{ConnectionEngine, EngineEvent, EngineStatus, NetworkingFlags, SessionState};
pub use error::{SyncError, SyncResult};
pub use frame::{encode_frame, Frame, FrameDecoder, FrameError};
pub use twin::{ReportOutcome, TwinProperties, TwinReconciler};
