//! Open Music audio engine: Lavalink node pool, per-guild players and queues
//! driven from the Discord voice gateway.

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;
pub mod node;
pub mod sources;
pub mod storage;
