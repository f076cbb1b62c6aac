//! Conduit Events - notification channel for the plugin execution engine.
//!
//! Components that change observable state (the plugin registry, the async
//! task tracker, the execution engine) are handed an [`EventBus`] at
//! construction time and publish [`ConduitEvent`]s to it. Publishing never
//! blocks and never fails: an event with no receivers is simply dropped.
//!
//! # Example
//!
//! ```rust
//! use conduit_events::{ConduitEvent, EventBus, EventMetadata};
//!
//! # async fn example() {
//! let bus = EventBus::new();
//! let mut receiver = bus.subscribe();
//!
//! bus.publish(ConduitEvent::PluginUnregistered {
//!     metadata: EventMetadata::new("registry"),
//!     unit_id: "echo".to_string(),
//! });
//!
//! let event = receiver.recv().await.unwrap();
//! assert_eq!(event.event_type(), "plugin_unregistered");
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod bus;
mod event;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};
pub use event::{ConduitEvent, EventMetadata};
