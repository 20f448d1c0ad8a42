//! HTTP API surface.

mod page;
mod server;

pub use server::router;
