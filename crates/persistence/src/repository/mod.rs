//! Repository implementations for database operations

pub mod credentials;

pub use credentials::*;
