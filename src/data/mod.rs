//! Data layer module
//!
//! Persisted federation records. Storage reads and writes these as JSON
//! files; the wire documents exchanged with remote servers live in
//! `federation::types`.

mod models;

pub use models::*;
