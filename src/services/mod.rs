//! Background services

pub mod redsocks;

pub use redsocks::{RedsocksService, RedsocksUpstream};
