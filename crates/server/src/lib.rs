//! BatchLoop Server
//!
//! HTTP front end for the batching core: a plain predict endpoint or an
//! OpenAI-compatible chat-completion endpoint, backed by a worker pool.

pub mod engine;
pub mod error;
pub mod handlers;
pub mod openai;
pub mod routines;
pub mod server;
pub mod streaming;

pub use engine::{ChatReply, Engine, EngineResponse};
pub use error::ApiError;
pub use server::{build_router, serve, CHAT_COMPLETIONS_PATH};
