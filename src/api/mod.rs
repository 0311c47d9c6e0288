//! HTTP API layer.

mod error;
mod rest;

pub use error::{ApiError, ErrorKind};
pub use rest::{authed_router, public_router};
