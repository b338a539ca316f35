//! Core domain + application logic for the SFTP-to-Telegram backup relay.
//!
//! This crate is transport-agnostic. SSH/SFTP and the Telegram
//! Bot API live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod credential;
pub mod discovery;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod packager;
pub mod pipeline;
pub mod ports;
pub mod staging;

pub use errors::{Error, Result};
