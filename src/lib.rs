#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod assembler;
pub mod constants;
pub mod crypto;
pub mod db;
pub mod decoder;
pub mod health;
pub mod json_repair;
pub mod kernel;
pub mod logging;
pub mod main_helper;
pub mod normalizer;
pub mod realtime;
pub mod recovery;
pub mod redaction_layer;
pub mod server;
pub mod store;
pub mod str_utils;
pub mod streaming;
pub mod transport;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
