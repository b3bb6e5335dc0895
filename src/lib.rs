// Library exports for the binary and integration tests

pub mod catalog;
pub mod config;
pub mod playback;
pub mod remote;

// Test doubles, available to unit tests and behind the test-utils feature
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
