//! Testing utilities for migration development

pub mod mock;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::MockProvider;
