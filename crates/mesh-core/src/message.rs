//! Message envelope — the closed set of messages carried inside frames.
//!
//! Type ids are a flat numeric namespace shared by every service. Bodies are
//! JSON objects; messages without fields travel with an empty body.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::wire::{encode_frame, WireError};

/// Error code in `ErrorNotice` that tells a client the serving side failed
/// and the session must be rebuilt.
pub const ERR_CODE_SYSTEM_ERROR: i32 = 1;

/// Message type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum MessageId {
    ClientPing = 1,
    ErrorNotice = 2,
    UserLoginC2S = 101,
    UserLoginS2C = 102,
    UserGetInfoC2S = 103,
    UserGetInfoS2C = 104,
    UserJoinChatC2S = 105,
    UserJoinChatS2C = 106,
    UserChatC2S = 107,
    UserChatNoticeS2C = 108,
}

impl TryFrom<u16> for MessageId {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ClientPing),
            2 => Ok(Self::ErrorNotice),
            101 => Ok(Self::UserLoginC2S),
            102 => Ok(Self::UserLoginS2C),
            103 => Ok(Self::UserGetInfoC2S),
            104 => Ok(Self::UserGetInfoS2C),
            105 => Ok(Self::UserJoinChatC2S),
            106 => Ok(Self::UserJoinChatS2C),
            107 => Ok(Self::UserChatC2S),
            108 => Ok(Self::UserChatNoticeS2C),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

impl From<MessageId> for u16 {
    fn from(id: MessageId) -> u16 {
        id as u16
    }
}

// ── Bodies ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub error_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl ErrorNotice {
    /// Whether the peer is telling us to drop and rebuild the session.
    pub fn is_system_error(&self) -> bool {
        self.error_code == ERR_CODE_SYSTEM_ERROR
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLogin {
    pub account: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLoginAck {
    pub token: String,
}

/// Token-bearing request used by get-info and join-chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserGetInfoAck {
    /// Opaque user record; its shape belongs to the login service.
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChat {
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChatNotice {
    pub user_name: String,
    pub msg: String,
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One message per `MessageId`. The mapping is closed: adding an id means
/// adding a variant here.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ClientPing,
    ErrorNotice(ErrorNotice),
    UserLogin(UserLogin),
    UserLoginAck(UserLoginAck),
    UserGetInfo(TokenRequest),
    UserGetInfoAck(UserGetInfoAck),
    UserJoinChat(TokenRequest),
    UserJoinChatAck,
    UserChat(UserChat),
    UserChatNotice(UserChatNotice),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::ClientPing => MessageId::ClientPing,
            Message::ErrorNotice(_) => MessageId::ErrorNotice,
            Message::UserLogin(_) => MessageId::UserLoginC2S,
            Message::UserLoginAck(_) => MessageId::UserLoginS2C,
            Message::UserGetInfo(_) => MessageId::UserGetInfoC2S,
            Message::UserGetInfoAck(_) => MessageId::UserGetInfoS2C,
            Message::UserJoinChat(_) => MessageId::UserJoinChatC2S,
            Message::UserJoinChatAck => MessageId::UserJoinChatS2C,
            Message::UserChat(_) => MessageId::UserChatC2S,
            Message::UserChatNotice(_) => MessageId::UserChatNoticeS2C,
        }
    }

    /// Serialize the body only (no frame header).
    pub fn body(&self) -> Result<Vec<u8>, WireError> {
        let body = match self {
            Message::ClientPing | Message::UserJoinChatAck => return Ok(Vec::new()),
            Message::ErrorNotice(b) => serde_json::to_vec(b),
            Message::UserLogin(b) => serde_json::to_vec(b),
            Message::UserLoginAck(b) => serde_json::to_vec(b),
            Message::UserGetInfo(b) | Message::UserJoinChat(b) => serde_json::to_vec(b),
            Message::UserGetInfoAck(b) => serde_json::to_vec(b),
            Message::UserChat(b) => serde_json::to_vec(b),
            Message::UserChatNotice(b) => serde_json::to_vec(b),
        };
        body.map_err(WireError::Encode)
    }

    /// Serialize into a complete frame ready to write to a stream.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        encode_frame(self.id().into(), &self.body()?)
    }

    /// Interpret a frame body received under `id`.
    pub fn decode(id: MessageId, body: &[u8]) -> Result<Self, WireError> {
        let msg = match id {
            MessageId::ClientPing => Message::ClientPing,
            MessageId::UserJoinChatS2C => Message::UserJoinChatAck,
            MessageId::ErrorNotice => Message::ErrorNotice(parse(id, body)?),
            MessageId::UserLoginC2S => Message::UserLogin(parse(id, body)?),
            MessageId::UserLoginS2C => Message::UserLoginAck(parse(id, body)?),
            MessageId::UserGetInfoC2S => Message::UserGetInfo(parse(id, body)?),
            MessageId::UserGetInfoS2C => Message::UserGetInfoAck(parse(id, body)?),
            MessageId::UserJoinChatC2S => Message::UserJoinChat(parse(id, body)?),
            MessageId::UserChatC2S => Message::UserChat(parse(id, body)?),
            MessageId::UserChatNoticeS2C => Message::UserChatNotice(parse(id, body)?),
        };
        Ok(msg)
    }

    /// The peer fatal signal: an `ErrorNotice` carrying the system error code.
    pub fn is_fatal_notice(&self) -> bool {
        matches!(self, Message::ErrorNotice(n) if n.is_system_error())
    }
}

fn parse<T: DeserializeOwned>(id: MessageId, body: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(body).map_err(|source| WireError::MalformedBody { id, source })
}
