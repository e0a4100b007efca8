//! Agent configuration: types, persistence, setup wizard.

pub mod persistence;
pub mod setup;
pub mod types;
pub mod validate;
