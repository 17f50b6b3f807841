//! Websocket client for the point-prompted mask inference service.
//!
//! Provides typed wire messages, a single persistent connection with
//! reconnection, per-label latest-request-wins tracking, and the
//! channel events consumed by the session loop.

pub mod channel;
pub mod client;
pub mod events;
pub mod messages;
pub mod processor;
pub mod reconnect;
pub mod tracker;
