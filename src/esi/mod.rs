//! EVE Swagger Interface (ESI) client and the record types mirrored from it.

mod client;
mod error;
pub mod types;

pub use client::EsiClient;
pub use error::EsiError;
