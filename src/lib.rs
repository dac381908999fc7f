pub mod accumulator;
pub mod constants;
pub mod engine;
pub mod extraction;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod metrics;
pub mod sse;
pub mod store;
pub mod str_utils;
pub mod templates;
pub mod token_counting;
pub mod types;
pub mod validation;

pub use types::*;

pub use main_helper::{AppState, Args};
