//! Wire protocol: a `serde`-tagged JSON envelope carried as WebSocket text
//! frames. [`ClientMessage`] is what the read loop decodes; [`ServerMessage`]
//! is what the write loop encodes. Shapes mirror the table in the design doc.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatus {
    pub filename: Option<String>,
    pub position: Option<u64>,
    pub paused: bool,
    pub speed: f64,
    pub file_loaded: bool,
    pub cache: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ReadyStatus {
    pub ready: bool,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Seek {
    pub filename: String,
    pub position: u64,
    pub speed: f64,
    pub paused: bool,
    pub desync: bool,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Select {
    pub filename: Option<String>,
    pub username: String,
    pub position: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Playlist {
    pub playlist: Vec<String>,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PlaybackSpeed {
    pub speed: f64,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UserMessage {
    pub message: String,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Join {
    pub password: String,
    pub room: String,
    pub username: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct PingPong {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    Ping(PingPong),
    Pong(PingPong),
    Join(Join),
    VideoStatus(VideoStatus),
    Status(ReadyStatus),
    Start,
    Pause,
    Seek(Seek),
    Select(Select),
    Playlist(Playlist),
    PlaybackSpeed(PlaybackSpeed),
    UserMessage(UserMessage),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserOverview {
    pub username: String,
    pub ready: bool,
    pub file_loaded: bool,
    pub position: Option<u64>,
    pub video: Option<String>,
    pub latency: f64,
    pub jitter: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoomOverview {
    pub name: String,
    pub users: Vec<UserOverview>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StatusList {
    pub rooms: Vec<RoomOverview>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Ping(PingPong),
    Pong(PingPong),
    Start,
    Pause,
    Seek(Seek),
    Select(Select),
    Playlist(Playlist),
    PlaybackSpeed(PlaybackSpeed),
    UserMessage(UserMessage),
    Status(StatusList),
}

/// Decode error surfaced to the worker's read loop; always fatal to the
/// connection (see `ProtocolError`).
#[derive(Debug, thiserror::Error)]
#[error("malformed message: {0}")]
pub struct DecodeError(#[from] pub serde_json::Error);

pub fn decode_client_message(text: &str) -> Result<ClientMessage, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_server_message(msg: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_join() {
        let text = r#"{"type":"Join","password":"hunter2","room":"movienight","username":"alice"}"#;
        let msg = decode_client_message(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join(Join {
                password: "hunter2".into(),
                room: "movienight".into(),
                username: "alice".into(),
            })
        );
    }

    #[test]
    fn decodes_video_status_camel_case() {
        let text = r#"{"type":"VideoStatus","filename":"a.mkv","position":1000,"paused":false,"speed":1.0,"fileLoaded":true,"cache":false}"#;
        let msg = decode_client_message(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::VideoStatus(VideoStatus {
                filename: Some("a.mkv".into()),
                position: Some(1000),
                paused: false,
                speed: 1.0,
                file_loaded: true,
                cache: false,
            })
        );
    }

    #[test]
    fn unit_variants_round_trip() {
        let encoded = encode_server_message(&ServerMessage::Start).unwrap();
        assert_eq!(encoded, r#"{"type":"Start"}"#);
        let decoded = decode_client_message(r#"{"type":"Pause"}"#).unwrap();
        assert_eq!(decoded, ClientMessage::Pause);
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(decode_client_message(r#"{"type":"Nonsense"}"#).is_err());
    }

    #[test]
    fn status_broadcast_serializes_rooms() {
        let status = ServerMessage::Status(StatusList {
            rooms: vec![RoomOverview {
                name: "movienight".into(),
                users: vec![UserOverview {
                    username: "alice".into(),
                    ready: true,
                    file_loaded: true,
                    position: Some(500),
                    video: Some("a.mkv".into()),
                    latency: 42.0,
                    jitter: 1.5,
                }],
            }],
        });
        let encoded = encode_server_message(&status).unwrap();
        assert!(encoded.contains("\"fileLoaded\":true"));
        assert!(encoded.contains("\"movienight\""));
    }
}
