//! livesync - real-time document synchronization
//!
//! A DDP-style server that publishes live query results to WebSocket
//! clients, a matching client with a local document cache, and an entity
//! engine whose change streams feed publications.

pub mod cli;
pub mod client;
pub mod ddp;
pub mod engine;
pub mod realtime;
pub mod signal;
