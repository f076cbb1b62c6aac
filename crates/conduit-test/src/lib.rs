//! Conduit Test - shared test utilities for the conduit crates.
//!
//! Add as a dev-dependency and use the mocks from integration tests:
//!
//! ```rust,ignore
//! use conduit_test::{MockUnit, init_test_logging};
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn runs_units() {
//!     init_test_logging();
//!     let unit = MockUnit::sync("greeter").returning(json!("hi"));
//!     engine.register_unit(unit.shared()).await.unwrap();
//!     // ...
//!     assert_eq!(unit.call_count(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod logging;
pub mod mocks;

pub use logging::init_test_logging;
pub use mocks::{FlakyCounterStore, MockCall, MockOutcome, MockTool, MockUnit};
