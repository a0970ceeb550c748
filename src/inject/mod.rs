//! Domain-Fronting Gateway
//!
//! This module provides:
//! - The Rule Engine classifying requested hosts
//! - Pluggable destination extraction (HTTP CONNECT / Host, TLS SNI)
//! - The gateway server that fronts matched hosts through the rotator

pub mod extract;
pub mod rules;
pub mod server;

pub use extract::{create_extractor, DestinationExtractor, ExtractorKind};
pub use rules::{RuleEngine, RuleMatch};
pub use server::{Gateway, RotatorLink};
