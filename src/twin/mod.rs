//! Device twin reconciliation
//!
//! - `properties`: per-pass value object and dirty flags
//! - `protocol`: plug-and-play vs plain hub reporting conventions
//! - `reconciler`: desired-document parsing and reported-patch building

pub mod properties;
pub mod protocol;
pub mod reconciler;

pub use properties::{DirtyFlags, LedColor, LedState, TwinProperties, APP_PROPERTY_SLOTS};
pub use protocol::{PlainHub, PlugAndPlay, TwinProtocol};
pub use reconciler::{DeviceTwin, ReportOutcome, TwinError, TwinReconciler};
