//! Compose document rewriting.
//!
//! Environment-variable substitution on the raw text, then parsing into a
//! generic order-preserving mapping and injection of platform conventions:
//! resource-cap defaults, external network/volume/secret declarations, and
//! reverse-proxy routing labels.

pub mod substitute;
pub mod transform;

#[cfg(test)]
mod transform_tests;

pub use substitute::{scan_variables, substitute};
pub use transform::{parse, to_yaml, transform, RoutingConfig, Transformed};
