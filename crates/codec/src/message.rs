use crate::Error;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Control messages exchanged between a client and the server.
///
/// Messages are msgpack maps with a `type` field. Relay frames between two
/// clients never reach this type, the server forwards them without decoding.
///
/// # Test
///
/// ```
/// use salty_server_codec::message::Message;
///
/// let message = Message::NewResponder { id: 0x02 };
/// let decoded = Message::decode(&message.encode().unwrap()).unwrap();
///
/// assert_eq!(decoded, Message::NewResponder { id: 0x02 });
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    ServerHello {
        key: ByteBuf,
    },
    ClientHello {
        key: ByteBuf,
    },
    ClientAuth {
        your_cookie: ByteBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        your_key: Option<ByteBuf>,
        #[serde(default)]
        subprotocols: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ping_interval: Option<u32>,
    },
    ServerAuth {
        your_cookie: ByteBuf,
        signed_keys: ByteBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiator_connected: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        responders: Option<Vec<u8>>,
    },
    NewInitiator,
    NewResponder {
        id: u8,
    },
    DropResponder {
        id: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<u16>,
    },
    SendError {
        id: ByteBuf,
    },
    Disconnected {
        id: u8,
    },
}

impl Message {
    /// The `type` field value, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServerHello { .. } => "server-hello",
            Self::ClientHello { .. } => "client-hello",
            Self::ClientAuth { .. } => "client-auth",
            Self::ServerAuth { .. } => "server-auth",
            Self::NewInitiator => "new-initiator",
            Self::NewResponder { .. } => "new-responder",
            Self::DropResponder { .. } => "drop-responder",
            Self::SendError { .. } => "send-error",
            Self::Disconnected { .. } => "disconnected",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        rmp_serde::to_vec_named(self).map_err(|_| Error::EncodeFailed)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        rmp_serde::from_slice(bytes).map_err(|_| Error::DecodeFailed)
    }
}
