//! Common types, protocol definitions, and errors shared across `orders-api` crates.

pub mod error;
pub mod protocol;

pub use error::ServiceError;
