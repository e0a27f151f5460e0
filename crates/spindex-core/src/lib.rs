//! # spindex-core
//! Foundation types, codecs and storage contracts for the spindex index server.

pub mod coin;
pub mod encode;
pub mod error;
pub mod hash;
pub mod merkle;
pub mod store;
pub mod traits;
pub mod types;
