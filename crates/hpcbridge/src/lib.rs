#![deny(clippy::await_holding_refcell_ref)]

pub mod admission;
pub mod client;
pub mod common;
pub mod engine;
pub mod job;
pub mod jobfile;
pub mod recovery;
pub mod remote;
pub mod scheduler;
pub mod staging;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::HpcError;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::common::data_structures::{Map, Set};

/// Name of a Resource, used as the key of per-resource state.
pub type ResourceId = String;

pub const HPCB_VERSION: &str = {
    match option_env!("HPCB_BUILD_VERSION") {
        Some(version) => version,
        None => const_format::concatcp!(env!("CARGO_PKG_VERSION"), "-dev"),
    }
};
