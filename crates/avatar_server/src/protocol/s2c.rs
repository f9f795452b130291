use super::{
    finish, get_array, get_bool, get_string, get_u32, get_u64, get_u8, put_string, ProtocolError,
};
use crate::types::{AvatarVersion, ContentHash, PlayerIdentity};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

const TAG_AUTH: u8 = 0;
const TAG_PING: u8 = 1;
const TAG_AVATAR_CHUNK: u8 = 2;
const TAG_AVATAR_COMPLETE: u8 = 3;
const TAG_DISCARD: u8 = 4;
const TAG_TOAST: u8 = 5;
const TAG_AVATAR_UPDATED: u8 = 6;

/// Severity of a toast notice shown by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    #[default]
    Default = 0,
    Warning = 1,
    Error = 2,
}

impl ToastKind {
    fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::Warning),
            2 => Ok(Self::Error),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Messages the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Handshake accepted; the session is active.
    Auth,
    /// A ping relayed from a peer this client is viewing.
    Ping {
        owner: PlayerIdentity,
        id: u32,
        sync: bool,
        data: Bytes,
    },
    /// One slice of an avatar payload. `seq` counts from zero up to `total - 1`.
    AvatarChunk {
        owner: PlayerIdentity,
        version: AvatarVersion,
        seq: u32,
        total: u32,
        hash: ContentHash,
        data: Bytes,
    },
    /// Trailing integrity marker; the client verifies the reassembled payload
    /// against `hash` before activating it.
    AvatarComplete {
        owner: PlayerIdentity,
        version: AvatarVersion,
        hash: ContentHash,
        size: u64,
    },
    /// The client should drop the cached avatar of `owner`.
    Discard { owner: PlayerIdentity },
    /// Human readable notice.
    Toast {
        kind: ToastKind,
        title: String,
        body: Option<String>,
    },
    /// Sent to an owner after their own avatar changed in storage.
    AvatarUpdated { owner: PlayerIdentity },
}

impl ServerMessage {
    /// Encodes the message into one binary frame.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        match self {
            Self::Auth => buf.put_u8(TAG_AUTH),
            Self::Ping {
                owner,
                id,
                sync,
                data,
            } => {
                buf.put_u8(TAG_PING);
                put_string(&mut buf, owner.as_str())?;
                buf.put_u32(*id);
                buf.put_u8(u8::from(*sync));
                buf.put_slice(data);
            }
            Self::AvatarChunk {
                owner,
                version,
                seq,
                total,
                hash,
                data,
            } => {
                buf.reserve(51 + owner.as_str().len() + data.len());
                buf.put_u8(TAG_AVATAR_CHUNK);
                put_string(&mut buf, owner.as_str())?;
                buf.put_u64(version.0);
                buf.put_u32(*seq);
                buf.put_u32(*total);
                buf.put_slice(&hash.0);
                buf.put_slice(data);
            }
            Self::AvatarComplete {
                owner,
                version,
                hash,
                size,
            } => {
                buf.put_u8(TAG_AVATAR_COMPLETE);
                put_string(&mut buf, owner.as_str())?;
                buf.put_u64(version.0);
                buf.put_slice(&hash.0);
                buf.put_u64(*size);
            }
            Self::Discard { owner } => {
                buf.put_u8(TAG_DISCARD);
                put_string(&mut buf, owner.as_str())?;
            }
            Self::Toast { kind, title, body } => {
                buf.put_u8(TAG_TOAST);
                buf.put_u8(*kind as u8);
                put_string(&mut buf, title)?;
                match body {
                    Some(body) => {
                        buf.put_u8(1);
                        put_string(&mut buf, body)?;
                    }
                    None => buf.put_u8(0),
                }
            }
            Self::AvatarUpdated { owner } => {
                buf.put_u8(TAG_AVATAR_UPDATED);
                put_string(&mut buf, owner.as_str())?;
            }
        }
        Ok(buf.freeze())
    }

    /// Decodes one binary frame, as a client would.
    pub fn decode(frame: Bytes) -> Result<Self, ProtocolError> {
        let mut buf = frame;
        let tag = get_u8(&mut buf, "tag").map_err(|_| ProtocolError::Empty)?;
        let message = match tag {
            TAG_AUTH => Self::Auth,
            TAG_PING => {
                let owner = PlayerIdentity::new(get_string(&mut buf, "owner")?);
                let id = get_u32(&mut buf, "ping id")?;
                let sync = get_bool(&mut buf, "ping sync")?;
                let data = std::mem::take(&mut buf);
                Self::Ping {
                    owner,
                    id,
                    sync,
                    data,
                }
            }
            TAG_AVATAR_CHUNK => {
                let owner = PlayerIdentity::new(get_string(&mut buf, "owner")?);
                let version = AvatarVersion(get_u64(&mut buf, "version")?);
                let seq = get_u32(&mut buf, "seq")?;
                let total = get_u32(&mut buf, "total")?;
                let hash = ContentHash(get_array(&mut buf, "hash")?);
                let data = std::mem::take(&mut buf);
                Self::AvatarChunk {
                    owner,
                    version,
                    seq,
                    total,
                    hash,
                    data,
                }
            }
            TAG_AVATAR_COMPLETE => Self::AvatarComplete {
                owner: PlayerIdentity::new(get_string(&mut buf, "owner")?),
                version: AvatarVersion(get_u64(&mut buf, "version")?),
                hash: ContentHash(get_array(&mut buf, "hash")?),
                size: get_u64(&mut buf, "size")?,
            },
            TAG_DISCARD => Self::Discard {
                owner: PlayerIdentity::new(get_string(&mut buf, "owner")?),
            },
            TAG_TOAST => {
                let kind = ToastKind::from_u8(get_u8(&mut buf, "toast kind")?)?;
                let title = get_string(&mut buf, "toast title")?;
                let body = if get_bool(&mut buf, "toast body flag")? {
                    Some(get_string(&mut buf, "toast body")?)
                } else {
                    None
                };
                Self::Toast { kind, title, body }
            }
            TAG_AVATAR_UPDATED => Self::AvatarUpdated {
                owner: PlayerIdentity::new(get_string(&mut buf, "owner")?),
            },
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        finish(&buf)?;
        Ok(message)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Ping { .. } => "ping",
            Self::AvatarChunk { .. } => "avatar_chunk",
            Self::AvatarComplete { .. } => "avatar_complete",
            Self::Discard { .. } => "discard",
            Self::Toast { .. } => "toast",
            Self::AvatarUpdated { .. } => "avatar_updated",
        }
    }
}
