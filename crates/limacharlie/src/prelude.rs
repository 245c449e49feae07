//! Convenience re-exports for common `limacharlie` types.
//!
//! ```ignore
//! use limacharlie::prelude::*;
//! ```
//!
//! Covers the façade, configuration, credentials and error types. Lower-level
//! pieces (the registry, retry table, decoder) stay in their modules.

// ── Façade ──────────────────────────────────────────────────────────
pub use crate::manager::{Manager, ManagerConfig};
pub use crate::resources::{Incident, Job, Payloads};
pub use crate::sensor::{Platform, Sensor, SensorInfo};

// ── Client ──────────────────────────────────────────────────────────
pub use crate::api::params::Params;
pub use crate::{CallOptions, Client, Method};

// ── Configuration and credentials ───────────────────────────────────
pub use crate::api::retry::RetryPolicy;
pub use crate::config::{ClientConfig, FeedConfig};
pub use crate::credentials::{Credentials, FnRenewal, TokenRenewal};

// ── Event feed ──────────────────────────────────────────────────────
pub use crate::api::streaming::{ConnectionFilter, Feed, FeedStatus};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{ApiError, Result};
pub use crate::events::{CompositeObserver, ErrorEvent, ErrorObserver, FnObserver, LoggingObserver};

// ── Utilities ───────────────────────────────────────────────────────
pub use crate::compression::{decode_blob, decompress_and_parse};
pub use crate::webhook::Webhook;
