pub mod data_structures;
pub mod error;
pub mod fsutils;
pub mod parser;
pub mod serialization;
pub mod setup;
pub mod strutils;
pub mod timeutils;
