#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod config;
pub mod constants;
pub mod db;
pub mod engine;
pub mod extract;
pub mod hardening;
pub mod health;
pub mod ingress;
pub mod logging;
pub mod main_helper;
pub mod persistence;
pub mod reconciler;
pub mod relay;
pub mod server;
pub mod specs;
pub mod sse;
pub mod str_utils;
pub mod streaming;
pub mod token_counting;
pub mod transport;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
