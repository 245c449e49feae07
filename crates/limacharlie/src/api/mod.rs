//! Wire layer: parameters, retry classification and the event feed.
//!
//! - [`params`]: ordered request parameters with repeated keys.
//! - [`retry`]: maps each failure to reauthenticate, back off or surface.
//! - [`registry`]: TTL-bounded one-shot handlers keyed by tracking id.
//! - [`tracking`]: tracking id generation and event correlation.
//! - [`streaming`]: the reconnecting event feed that routes into the registry.

pub mod params;
pub mod registry;
pub mod retry;
pub mod streaming;
pub mod tracking;

pub use params::Params;
pub use registry::CallbackRegistry;
pub use retry::{RetryAction, RetryPolicy};
pub use streaming::{ConnectionFilter, Feed, FeedBuilder, FeedStatus};
pub use tracking::{correlation_id, generate_tracking_id};
