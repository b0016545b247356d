//! Core of the template service bot: the attachment pipeline and its domain.
//!
//! This crate does not know about Slack or HTTP. Chat platforms live behind
//! ports (traits) implemented in adapter crates.

pub mod archive;
pub mod audit;
pub mod config;
pub mod domain;
pub mod download;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod ports;
pub mod staging;
pub mod transform;
pub mod upload;
pub mod validate;

pub use errors::{Error, Result};
