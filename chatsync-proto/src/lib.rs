//! Shared data model for the chatsync message engine.

pub mod conversation;
pub mod message;
pub mod record;
