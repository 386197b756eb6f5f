//! `chatsync`: client-side message timeline synchronization engine.
//!
//! Merges a live subscription, backward pagination and optimistic sends
//! into one ordered, deduplicated timeline per open conversation, with
//! durable handling of failed sends and a notification differ for the
//! conversation list.

pub mod config;
pub mod failed;
pub mod notify;
pub mod pagination;
pub mod retry;
pub mod session;
pub mod source;
pub mod storage;
pub mod subscription;
pub mod timeline;
