//! Fixtures shared by achgate integration tests.
//!
//! - [`FileBuilder`] and [`sample_file`]: valid single-batch ACH files
//! - [`incoming_payload`] and [`cancel_payload`]: encoded intake envelopes
//! - [`StagingRoot`]: a throwaway staging tree with inspection helpers
//!
//! ```rust,ignore
//! use achgate_test_utils::{StagingRoot, incoming_payload, sample_file};
//!
//! #[tokio::test]
//! async fn stages_one_file() {
//!     let staging = StagingRoot::new();
//!     let payload = incoming_payload("f1", "s1", sample_file(&["000000000000001"]));
//!     // dispatch `payload`, then inspect staging.active_files("testing", "s1")
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Fixtures panic on setup failure.
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;

pub use fixtures::*;

/// Routes `tracing` output to the test harness. Safe to call from every test.
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("achgate_core=debug,achgate_outbound=debug"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
