//! # Audio Module
//!
//! Playback orchestration for Open Music. Audio itself is decoded and streamed
//! by remote nodes; this module decides what they play and reacts to what they
//! report back.
//!
//! ## Architecture
//!
//! ### [`manager`] - Audio Manager
//! - Owns the per-guild player registry
//! - Merges Discord voice events into node `voiceUpdate`s
//! - Routes node events to players and moves players off dead nodes
//!
//! ### [`player`] - Guild Player
//! - Connection state machine and playback commands
//! - Track-end, exception and stuck handling with error ceilings
//! - Autoplay and inactivity monitoring
//!
//! ### [`queue`] - Queue Management
//! - Ordered tracks with a current cursor and loop modes
//! - Range removal, skips, shuffle and fuzzy lookup
//!
//! ### [`track`], [`filters`], [`voice`], [`limiter`]
//! - Lazily resolved tracks, node audio filters, voice state buffering and
//!   per-guild error counting
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music_engine::audio::{track::Track, AudioManager};
//! use serenity::all::{ChannelId, GuildId};
//!
//! # async fn example(manager: &AudioManager) -> anyhow::Result<()> {
//! let guild_id = GuildId::new(123456789);
//! let player = manager.create_player(guild_id).await?;
//!
//! let mut player = player.lock().await;
//! player.connect(ChannelId::new(42)).await?;
//! player.queue_mut().add(vec![Track::unresolved("lofi hip hop", "", 0, "")], None)?;
//! player.play().await?;
//! # Ok(())
//! # }
//! ```

pub mod filters;
pub mod limiter;
pub mod manager;
pub mod player;
pub mod queue;
pub mod track;
pub mod voice;

pub use manager::{AudioManager, ManagerOptions};
