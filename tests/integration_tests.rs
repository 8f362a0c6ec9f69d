//! Integration test suite entry point
//!
//! All test modules are organized under `tests/integration/`.
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

mod integration;
