use super::{finish, get_bool, get_string, get_u32, get_u8, put_string, ProtocolError};
use bytes::{BufMut, Bytes, BytesMut};

const TAG_HANDSHAKE: u8 = 0;
const TAG_PING: u8 = 1;
const TAG_LOGOUT: u8 = 2;

/// Messages a client may send to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// First message of every connection, carrying the session token.
    Handshake { token: String },
    /// Liveness ping, relayed to every peer currently viewing the sender.
    Ping { id: u32, sync: bool, data: Bytes },
    /// Explicit logout; the server closes the session normally.
    Logout,
}

impl ClientMessage {
    /// Decodes one binary frame.
    pub fn decode(frame: Bytes) -> Result<Self, ProtocolError> {
        let mut buf = frame;
        let tag = get_u8(&mut buf, "tag").map_err(|_| ProtocolError::Empty)?;
        let message = match tag {
            TAG_HANDSHAKE => Self::Handshake {
                token: get_string(&mut buf, "token")?,
            },
            TAG_PING => {
                let id = get_u32(&mut buf, "ping id")?;
                let sync = get_bool(&mut buf, "ping sync")?;
                // Ping data runs to the end of the frame.
                let data = std::mem::take(&mut buf);
                Self::Ping { id, sync, data }
            }
            TAG_LOGOUT => Self::Logout,
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        finish(&buf)?;
        Ok(message)
    }

    /// Encodes the message into one binary frame.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        match self {
            Self::Handshake { token } => {
                buf.put_u8(TAG_HANDSHAKE);
                put_string(&mut buf, token)?;
            }
            Self::Ping { id, sync, data } => {
                buf.reserve(6 + data.len());
                buf.put_u8(TAG_PING);
                buf.put_u32(*id);
                buf.put_u8(u8::from(*sync));
                buf.put_slice(data);
            }
            Self::Logout => buf.put_u8(TAG_LOGOUT),
        }
        Ok(buf.freeze())
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Ping { .. } => "ping",
            Self::Logout => "logout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_payload_runs_to_end_of_frame() {
        let frame = Bytes::from_static(&[1, 0, 0, 0, 9, 1, b'h', b'i']);
        let decoded = ClientMessage::decode(frame).unwrap();
        assert_eq!(
            decoded,
            ClientMessage::Ping {
                id: 9,
                sync: true,
                data: Bytes::from_static(b"hi"),
            }
        );
    }

    #[test]
    fn handshake_encodes_length_prefixed_token() {
        let frame = ClientMessage::Handshake {
            token: "tok-A".to_string(),
        }
        .encode()
        .unwrap();
        assert_eq!(&frame[..], &[0, 0, 5, b't', b'o', b'k', b'-', b'A']);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(ClientMessage::decode(Bytes::new()), Err(ProtocolError::Empty));
        assert_eq!(
            ClientMessage::decode(Bytes::from_static(&[7])),
            Err(ProtocolError::UnknownTag(7))
        );
        assert!(matches!(
            ClientMessage::decode(Bytes::from_static(&[0, 0, 10, b'x'])),
            Err(ProtocolError::Truncated { field: "token", .. })
        ));
        assert_eq!(
            ClientMessage::decode(Bytes::from_static(&[2, 0])),
            Err(ProtocolError::TrailingBytes(1))
        );
        assert_eq!(
            ClientMessage::decode(Bytes::from_static(&[0, 0, 1, 0xff])),
            Err(ProtocolError::InvalidUtf8("token"))
        );
    }
}
