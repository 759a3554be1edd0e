//! Integration test infrastructure for Cadence.
//!
//! Every port is backed by the in-memory adapters from `cadence-store`, so
//! the whole scheduler runs inside one test process.
//!
//! # Usage
//!
//! ```ignore
//! use cadence_tests::{PipelineFixture, TestContext};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::with_pipelines(vec![PipelineFixture::simple("app")])
//!         .await
//!         .unwrap();
//!     // Use ctx.scheduler, ctx.clock, ctx.console, etc.
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,cadence_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
