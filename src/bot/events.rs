use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::audio::{player::PlayerSignal, AudioManager};

/// Qué hacer con el player después de una señal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Nothing,
    Destroy,
}

/// Registra la señal y decide si el player debe liberarse
pub fn react(signal: &PlayerSignal) -> SignalAction {
    match signal {
        PlayerSignal::TrackStarted { guild_id, track } => {
            info!("▶️ Reproduciendo: {} en guild {}", track.display_title(), guild_id);
            SignalAction::Nothing
        }
        PlayerSignal::QueueEnded { guild_id } => {
            info!("📭 Cola terminada en guild {}", guild_id);
            SignalAction::Nothing
        }
        PlayerSignal::TrackErrored {
            guild_id,
            kind,
            message,
        } => {
            warn!("⚠️ Error de {} en guild {}: {}", kind, guild_id, message);
            SignalAction::Nothing
        }
        PlayerSignal::Inactivity { guild_id } => {
            info!("💤 Guild {} inactivo, liberando player", guild_id);
            SignalAction::Destroy
        }
        PlayerSignal::CriticalError { guild_id, kind } => {
            error!("❌ Demasiados errores de {} en guild {}", kind, guild_id);
            SignalAction::Destroy
        }
        PlayerSignal::Disconnected { guild_id } => {
            info!("🔌 Bot desconectado en guild {}", guild_id);
            SignalAction::Destroy
        }
        PlayerSignal::Moved { guild_id, from, to } => {
            debug!("🔀 Guild {}: canal {} -> {}", guild_id, from, to);
            SignalAction::Nothing
        }
        PlayerSignal::NodeReconnecting { node, attempt } => {
            warn!("🔄 Nodo '{}' reconectando (intento {})", node, attempt);
            SignalAction::Nothing
        }
        PlayerSignal::NodeLost { guild_id, node } => {
            error!("❌ Guild {} perdió el nodo '{}' sin reemplazo", guild_id, node);
            SignalAction::Nothing
        }
    }
}

fn signal_guild(signal: &PlayerSignal) -> Option<serenity::model::id::GuildId> {
    match signal {
        PlayerSignal::TrackStarted { guild_id, .. }
        | PlayerSignal::QueueEnded { guild_id }
        | PlayerSignal::TrackErrored { guild_id, .. }
        | PlayerSignal::Inactivity { guild_id }
        | PlayerSignal::CriticalError { guild_id, .. }
        | PlayerSignal::Disconnected { guild_id }
        | PlayerSignal::Moved { guild_id, .. }
        | PlayerSignal::NodeLost { guild_id, .. } => Some(*guild_id),
        PlayerSignal::NodeReconnecting { .. } => None,
    }
}

/// Consume las señales de todos los players
pub fn spawn_signal_loop(
    manager: Arc<AudioManager>,
    mut signals: mpsc::UnboundedReceiver<PlayerSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            if react(&signal) != SignalAction::Destroy {
                continue;
            }
            if let Some(guild_id) = signal_guild(&signal) {
                manager.destroy_player(guild_id).await;
            }
        }
        debug!("Canal de señales cerrado");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, GuildId};

    #[test]
    fn terminal_signals_release_the_player() {
        let guild_id = GuildId::new(3);

        for signal in [
            PlayerSignal::Inactivity { guild_id },
            PlayerSignal::Disconnected { guild_id },
            PlayerSignal::CriticalError {
                guild_id,
                kind: FaultKind::Stuck,
            },
        ] {
            assert_eq!(react(&signal), SignalAction::Destroy);
        }

        for signal in [
            PlayerSignal::QueueEnded { guild_id },
            PlayerSignal::Moved {
                guild_id,
                from: ChannelId::new(1),
                to: ChannelId::new(2),
            },
            PlayerSignal::NodeLost {
                guild_id,
                node: "main".to_string(),
            },
        ] {
            assert_eq!(react(&signal), SignalAction::Nothing);
        }
    }

    #[test]
    fn node_signals_have_no_guild() {
        let signal = PlayerSignal::NodeReconnecting {
            node: "main".to_string(),
            attempt: 2,
        };
        assert_eq!(signal_guild(&signal), None);
        assert_eq!(react(&signal), SignalAction::Nothing);
    }
}
