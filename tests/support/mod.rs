#![allow(dead_code)]

pub mod fixture;

pub use fixture::PlaybackFixture;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
