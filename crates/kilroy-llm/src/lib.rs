//! Provider-agnostic LLM completion contract for Kilroy.
//!
//! The engine invokes language models only through [`ProviderAdapter`]'s
//! `complete(request) -> response`. Concrete vendor adapters (API keys, wire
//! formats, retries against provider quirks) are external plug-ins; this
//! crate carries the shared request/response types, the adapter trait, and a
//! small dispatching [`Client`] with middleware hooks.

mod client;
mod provider;
mod types;

pub use client::{Client, LoggingMiddleware, Middleware};
pub use provider::{DynProvider, ProviderAdapter};
pub use types::{FinishReason, Message, Request, Response, ResponseFormat, Role, Usage};
