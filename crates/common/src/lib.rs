//! Shared error plumbing used across pagetap crates: the `FromMessage`
//! trait and the `impl_context!` macro that gives each crate's error type
//! `.context()` / `.with_context()` helpers.

pub mod error;

pub use error::FromMessage;
