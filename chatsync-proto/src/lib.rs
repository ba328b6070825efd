//! Shared protocol definitions for the `ChatSync` wire format.

pub mod codec;
pub mod directory;
pub mod event;
pub mod message;
