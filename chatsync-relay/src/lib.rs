//! `ChatSync` relay server library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! accepts one WebSocket connection per user, stores and routes direct
//! messages, answers history requests, and broadcasts presence.

pub mod config;
pub mod relay;
pub mod store;
