/// Core library for the docpipe document understanding pipeline.
///
/// This crate contains the processing core: vision LLM provider
/// adapters and dispatch, deterministic business rules, the weighted
/// confidence model, the prompt registry, document and audit storage,
/// the event bus, and the pipeline orchestrator. The HTTP surface
/// lives in the companion server crate.
pub mod confidence;
pub mod config;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod events;
pub mod llm;
pub mod object_store;
pub mod pipeline;
pub mod prompts;
pub mod rules;
pub mod storage;

pub use error::*;

/// Returns the version of the docpipe-core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
