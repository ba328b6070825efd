//! `ChatSync`: real-time chat timeline synchronization engine.

pub mod cache;
pub mod chat;
pub mod config;
pub mod directory;
pub mod net;
pub mod presence;
pub mod transport;
