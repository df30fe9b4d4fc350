//! Fusión de los dos eventos de voz del gateway.
//!
//! Discord entrega la sesión de voz en dos mensajes independientes
//! (`VOICE_STATE_UPDATE` con el `session_id` y `VOICE_SERVER_UPDATE` con el
//! token y endpoint) en cualquier orden. El nodo necesita ambos en un solo
//! `voiceUpdate`.

use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use tracing::debug;

/// Datos del `VOICE_SERVER_UPDATE`, con la forma que espera el nodo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerEvent {
    pub token: String,
    pub guild_id: String,
    pub endpoint: Option<String>,
}

impl VoiceServerEvent {
    pub fn new(guild_id: GuildId, token: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            token: token.into(),
            guild_id: guild_id.to_string(),
            endpoint,
        }
    }
}

/// Actualización completa, lista para enviarse al nodo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceUpdate {
    pub session_id: String,
    pub event: VoiceServerEvent,
}

/// Buffer por servidor que acumula las dos mitades.
///
/// Los campos se conservan después de enviar: un nuevo token con la misma sesión
/// vuelve a producir una actualización completa. Una actualización sólo cuenta
/// como enviada cuando un player la aceptó ([`mark_delivered`](Self::mark_delivered)).
#[derive(Debug, Default)]
pub struct PendingVoice {
    channel_id: Option<ChannelId>,
    session_id: Option<String>,
    event: Option<VoiceServerEvent>,
    last_delivered: Option<VoiceUpdate>,
}

impl PendingVoice {
    pub fn set_session(&mut self, session_id: impl Into<String>) -> Option<VoiceUpdate> {
        self.session_id = Some(session_id.into());
        self.undelivered()
    }

    pub fn set_server(&mut self, event: VoiceServerEvent) -> Option<VoiceUpdate> {
        self.event = Some(event);
        self.undelivered()
    }

    /// Último canal informado para el bot, para un player creado después
    pub fn set_channel(&mut self, channel_id: ChannelId) {
        self.channel_id = Some(channel_id);
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.channel_id
    }

    /// El bot salió del canal; lo acumulado ya no sirve
    pub fn clear(&mut self) {
        self.channel_id = None;
        self.session_id = None;
        self.event = None;
        self.last_delivered = None;
    }

    /// Ambas mitades, hayan sido enviadas o no
    pub fn complete(&self) -> Option<VoiceUpdate> {
        Some(VoiceUpdate {
            session_id: self.session_id.clone()?,
            event: self.event.clone()?,
        })
    }

    /// Actualización completa que todavía no llegó a ningún nodo
    pub fn undelivered(&self) -> Option<VoiceUpdate> {
        let update = self.complete()?;
        if self.last_delivered.as_ref() == Some(&update) {
            debug!("🔁 voiceUpdate sin cambios, no se reenvía");
            return None;
        }
        Some(update)
    }

    pub fn mark_delivered(&mut self, update: VoiceUpdate) {
        self.last_delivered = Some(update);
    }
}

/// Cambio de canal del bot según dos estados de voz consecutivos
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTransition {
    Connect(ChannelId),
    Disconnect(ChannelId),
    Move { from: ChannelId, to: ChannelId },
}

impl ChannelTransition {
    pub fn detect(previous: Option<ChannelId>, next: Option<ChannelId>) -> Option<Self> {
        match (previous, next) {
            (None, Some(to)) => Some(Self::Connect(to)),
            (Some(from), None) => Some(Self::Disconnect(from)),
            (Some(from), Some(to)) if from != to => Some(Self::Move { from, to }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn server(token: &str) -> VoiceServerEvent {
        VoiceServerEvent::new(GuildId::new(1), token, Some("eu.discord.media".to_string()))
    }

    #[test]
    fn state_before_server_is_buffered() {
        let mut pending = PendingVoice::default();

        assert_eq!(pending.set_session("abc"), None);
        let update = pending.set_server(server("tok")).unwrap();

        assert_eq!(update.session_id, "abc");
        assert_eq!(update.event.token, "tok");
    }

    #[test]
    fn server_before_state_is_buffered() {
        let mut pending = PendingVoice::default();

        assert_eq!(pending.set_server(server("tok")), None);
        assert!(pending.set_session("abc").is_some());
    }

    #[test]
    fn unchanged_update_is_not_resent() {
        let mut pending = PendingVoice::default();
        pending.set_session("abc");
        let update = pending.set_server(server("tok")).unwrap();
        pending.mark_delivered(update);

        assert_eq!(pending.set_session("abc"), None);
        let refreshed = pending.set_server(server("tok2")).unwrap();
        assert_eq!(refreshed.event.token, "tok2");
    }

    #[test]
    fn clear_drops_both_halves() {
        let mut pending = PendingVoice::default();
        pending.set_channel(ChannelId::new(9));
        pending.set_session("abc");
        pending.set_server(server("tok"));
        pending.clear();

        assert_eq!(pending.complete(), None);
        assert_eq!(pending.channel_id(), None);
        assert_eq!(pending.set_session("def"), None);
    }

    #[test]
    fn undelivered_update_is_offered_again() {
        let mut pending = PendingVoice::default();
        pending.set_server(server("tok"));
        let first = pending.set_session("abc").unwrap();

        // nadie la aceptó: el mismo estado la vuelve a producir
        assert_eq!(pending.set_session("abc"), Some(first.clone()));
        assert_eq!(pending.undelivered(), Some(first));
    }

    #[test]
    fn detects_transitions() {
        let a = ChannelId::new(10);
        let b = ChannelId::new(20);

        assert_eq!(ChannelTransition::detect(None, Some(a)), Some(ChannelTransition::Connect(a)));
        assert_eq!(ChannelTransition::detect(Some(a), None), Some(ChannelTransition::Disconnect(a)));
        assert_eq!(
            ChannelTransition::detect(Some(a), Some(b)),
            Some(ChannelTransition::Move { from: a, to: b })
        );
        assert_eq!(ChannelTransition::detect(Some(a), Some(a)), None);
        assert_eq!(ChannelTransition::detect(None, None), None);
    }
}
