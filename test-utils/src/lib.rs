//! Test doubles and fixtures for cellbox.

mod backend;
mod context;
mod resolver;

pub use backend::{FakeBackend, KILLED, TERMINATED};
pub use context::{TEST_GRACE_PERIOD, TestContext, collect_chunks};
pub use resolver::FakeResolver;
