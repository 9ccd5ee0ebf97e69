//! sortie-ai: Unified LLM provider abstraction layer
//!
//! This crate provides a common interface for streaming responses from
//! Anthropic and OpenAI-compatible endpoints.

pub mod error;
pub mod models;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use stream::{MessageEventStream, collect_response};
pub use types::*;
