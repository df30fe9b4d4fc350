use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;

use crate::{audio::filters::Filters, audio::voice::VoiceServerEvent, sources::SearchResult};

/// Operaciones que el cliente envía al nodo por websocket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutgoingOp {
    #[serde(rename_all = "camelCase")]
    Play {
        guild_id: String,
        track: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        no_replace: bool,
    },
    #[serde(rename_all = "camelCase")]
    Pause { guild_id: String, pause: bool },
    #[serde(rename_all = "camelCase")]
    Stop { guild_id: String },
    #[serde(rename_all = "camelCase")]
    Seek { guild_id: String, position: u64 },
    #[serde(rename_all = "camelCase")]
    Volume { guild_id: String, volume: u16 },
    #[serde(rename_all = "camelCase")]
    Filters {
        guild_id: String,
        #[serde(flatten)]
        filters: Filters,
    },
    #[serde(rename_all = "camelCase")]
    Destroy { guild_id: String },
    #[serde(rename_all = "camelCase")]
    VoiceUpdate {
        guild_id: String,
        session_id: String,
        event: VoiceServerEvent,
    },
}

impl OutgoingOp {
    pub fn play(guild_id: GuildId, track: impl Into<String>, start_time: Option<u64>) -> Self {
        Self::Play {
            guild_id: guild_id.to_string(),
            track: track.into(),
            start_time: start_time.filter(|&ms| ms > 0),
            end_time: None,
            no_replace: false,
        }
    }

    pub fn pause(guild_id: GuildId, pause: bool) -> Self {
        Self::Pause {
            guild_id: guild_id.to_string(),
            pause,
        }
    }

    pub fn stop(guild_id: GuildId) -> Self {
        Self::Stop {
            guild_id: guild_id.to_string(),
        }
    }

    pub fn seek(guild_id: GuildId, position: u64) -> Self {
        Self::Seek {
            guild_id: guild_id.to_string(),
            position,
        }
    }

    pub fn volume(guild_id: GuildId, volume: u16) -> Self {
        Self::Volume {
            guild_id: guild_id.to_string(),
            volume,
        }
    }

    pub fn filters(guild_id: GuildId, filters: Filters) -> Self {
        Self::Filters {
            guild_id: guild_id.to_string(),
            filters,
        }
    }

    pub fn destroy(guild_id: GuildId) -> Self {
        Self::Destroy {
            guild_id: guild_id.to_string(),
        }
    }

    pub fn voice_update(guild_id: GuildId, session_id: impl Into<String>, event: VoiceServerEvent) -> Self {
        Self::VoiceUpdate {
            guild_id: guild_id.to_string(),
            session_id: session_id.into(),
            event,
        }
    }

    /// Nombre del op, para logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Play { .. } => "play",
            Self::Pause { .. } => "pause",
            Self::Stop { .. } => "stop",
            Self::Seek { .. } => "seek",
            Self::Volume { .. } => "volume",
            Self::Filters { .. } => "filters",
            Self::Destroy { .. } => "destroy",
            Self::VoiceUpdate { .. } => "voiceUpdate",
        }
    }
}

/// Mensajes que el nodo envía al cliente.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Stats(StatsPayload),
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        guild_id: String,
        state: PlayerState,
    },
    Event(EventPayload),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsPayload {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub cpu: Option<CpuStats>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlayerState {
    pub time: u64,
    pub position: u64,
    pub connected: bool,
}

/// Eventos de reproducción (`op: "event"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart {
        guild_id: String,
        #[serde(default)]
        track: Option<String>,
    },
    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: String,
        #[serde(default)]
        track: Option<String>,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: String,
        #[serde(default)]
        track: Option<String>,
        #[serde(default)]
        exception: Option<ExceptionInfo>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        guild_id: String,
        #[serde(default)]
        track: Option<String>,
        #[serde(default)]
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        guild_id: String,
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
    #[serde(other)]
    Unknown,
}

impl EventPayload {
    pub fn guild_id(&self) -> Option<&str> {
        match self {
            Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::TrackStuck { guild_id, .. }
            | Self::WebSocketClosed { guild_id, .. } => Some(guild_id),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExceptionInfo {
    pub message: Option<String>,
    pub severity: Option<String>,
    pub cause: Option<String>,
}

/// Respuesta de `GET /loadtracks`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub load_type: LoadType,
    #[serde(default)]
    pub playlist_info: Option<PlaylistInfo>,
    #[serde(default)]
    pub tracks: Vec<LoadedTrack>,
    #[serde(default)]
    pub exception: Option<ExceptionInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadType {
    TrackLoaded,
    PlaylistLoaded,
    SearchResult,
    NoMatches,
    LoadFailed,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlaylistInfo {
    pub name: Option<String>,
    pub selected_track: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadedTrack {
    pub track: String,
    pub info: TrackInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    pub length: u64,
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
}

impl From<LoadedTrack> for SearchResult {
    fn from(loaded: LoadedTrack) -> Self {
        let info = loaded.info;
        SearchResult {
            title: info.title,
            author: Some(info.author).filter(|a| !a.is_empty()),
            duration_ms: info.length,
            is_seekable: info.is_seekable,
            is_stream: info.is_stream,
            encoded: loaded.track,
            uri: info.uri,
            identifier: info.identifier,
            source_name: info.source_name.unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Convierte el id textual del protocolo; rechaza valores no numéricos y el 0
pub fn parse_guild_id(raw: &str) -> Option<GuildId> {
    raw.parse::<u64>()
        .ok()
        .filter(|&id| id != 0)
        .map(GuildId::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::filters::Timescale;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const GUILD: GuildId = GuildId::new(123);

    #[test]
    fn play_omits_missing_bounds() {
        let op = OutgoingOp::play(GUILD, "QAAA", None);
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({ "op": "play", "guildId": "123", "track": "QAAA", "noReplace": false })
        );

        let resumed = OutgoingOp::play(GUILD, "QAAA", Some(5_000));
        assert_eq!(serde_json::to_value(&resumed).unwrap()["startTime"], json!(5_000));
    }

    #[test]
    fn voice_update_and_filters_shapes() {
        let event = VoiceServerEvent::new(GUILD, "tok", Some("us-east.discord.media".into()));
        let op = OutgoingOp::voice_update(GUILD, "sess", event);
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({
                "op": "voiceUpdate",
                "guildId": "123",
                "sessionId": "sess",
                "event": { "token": "tok", "guild_id": "123", "endpoint": "us-east.discord.media" }
            })
        );

        let filters = Filters {
            timescale: Some(Timescale {
                speed: 1.5,
                pitch: 1.0,
                rate: 1.0,
            }),
            ..Filters::default()
        };
        let value = serde_json::to_value(OutgoingOp::filters(GUILD, filters)).unwrap();
        assert_eq!(value["op"], json!("filters"));
        assert_eq!(value["timescale"]["speed"], json!(1.5));
    }

    #[test]
    fn parses_inbound_messages() {
        let stats: IncomingMessage = serde_json::from_value(json!({
            "op": "stats",
            "players": 3,
            "playingPlayers": 1,
            "uptime": 1000,
            "cpu": { "cores": 4, "systemLoad": 0.5, "lavalinkLoad": 0.1 },
            "memory": { "free": 1, "used": 2 }
        }))
        .unwrap();
        assert!(matches!(stats, IncomingMessage::Stats(ref s) if s.players == 3 && s.cpu.unwrap().cores == 4));

        let update: IncomingMessage = serde_json::from_value(json!({
            "op": "playerUpdate",
            "guildId": "123",
            "state": { "time": 1, "position": 42000, "connected": true }
        }))
        .unwrap();
        assert!(matches!(update, IncomingMessage::PlayerUpdate { ref state, .. } if state.position == 42000));

        let end: IncomingMessage = serde_json::from_value(json!({
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "123",
            "track": "QAAA",
            "reason": "LOAD_FAILED"
        }))
        .unwrap();
        assert!(matches!(
            end,
            IncomingMessage::Event(EventPayload::TrackEnd { reason: TrackEndReason::LoadFailed, .. })
        ));
    }

    #[test]
    fn unknown_ops_and_events_do_not_fail() {
        let ready: IncomingMessage =
            serde_json::from_value(json!({ "op": "ready", "resumed": false })).unwrap();
        assert!(matches!(ready, IncomingMessage::Unknown));

        let lyrics: IncomingMessage = serde_json::from_value(json!({
            "op": "event",
            "type": "LyricsFoundEvent",
            "guildId": "123"
        }))
        .unwrap();
        assert!(matches!(lyrics, IncomingMessage::Event(EventPayload::Unknown)));
    }

    #[test]
    fn guild_ids_must_be_non_zero_numbers() {
        assert_eq!(parse_guild_id("123"), Some(GUILD));
        assert_eq!(parse_guild_id("0"), None);
        assert_eq!(parse_guild_id("abc"), None);
    }

    #[test]
    fn load_result_maps_into_search_results() {
        let result: LoadResult = serde_json::from_value(json!({
            "loadType": "SEARCH_RESULT",
            "playlistInfo": {},
            "tracks": [{
                "track": "QAAAjQIA",
                "info": {
                    "identifier": "dQw4w9WgXcQ",
                    "isSeekable": true,
                    "author": "Rick Astley",
                    "length": 212000,
                    "isStream": false,
                    "position": 0,
                    "title": "Never Gonna Give You Up",
                    "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                    "sourceName": "youtube"
                }
            }]
        }))
        .unwrap();

        assert_eq!(result.load_type, LoadType::SearchResult);
        let search: SearchResult = result.tracks.into_iter().next().unwrap().into();
        assert_eq!(search.encoded, "QAAAjQIA");
        assert_eq!(search.author.as_deref(), Some("Rick Astley"));
        assert_eq!(search.duration_ms, 212_000);
    }
}
