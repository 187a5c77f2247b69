//! HTTP client and msgpack payload encoder for the Kilroy turn database.
//!
//! The turn database is an append-only store of typed, versioned events
//! linked into per-run context chains. The engine treats it as best-effort
//! observability: append failures are logged by callers and never fail a run.

mod client;
mod msgpack;
mod registry;

pub use client::{
    AppendTurnRequest, AppendTurnResponse, Client, ContextInfo, ListTurnsOptions, Turn,
};
pub use msgpack::encode_turn_payload;
pub use registry::{field_tags, registry_bundle, BUNDLE_ID, BUNDLE_VERSION};
