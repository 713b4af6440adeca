//! nerede — live location relay.
//!
//! MQTT payloads are parsed, appended to a Redis timeline keyed by a
//! sortable timestamp, and fanned out to WebSocket viewers. New viewers
//! get the whole timeline replayed before live updates.
//!
//! Exposed as a library so integration tests can assemble the router
//! against in-memory collaborators. The binary entry point is in main.rs.

pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod parser;
pub mod routes;
pub mod state;
pub mod store;
pub mod tasks;
pub mod timestamp;
pub mod types;
pub mod ws;
