//! ## SaltyRTC signaling wire format
//!
//! [SaltyRTC]: https://github.com/saltyrtc/saltyrtc-meta
//!
//! SaltyRTC is an end-to-end encrypted signaling protocol. Peers meet on a
//! signaling path provided by a server and negotiate a task (for example a
//! WebRTC handover) through NaCl-boxed messages the server cannot read.
//!
//! Every binary WebSocket frame starts with a 24 byte nonce followed by the
//! payload. The nonce carries the routing information (source and destination
//! address), the combined sequence number and the sender's cookie, and is at
//! the same time the NaCl box nonce of the payload. Pre-authentication frames
//! are plain msgpack records, everything after the handshake is encrypted.

pub mod crypto;
pub mod message;
pub mod nonce;

use self::nonce::{NONCE_LENGTH, Nonce};

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    InvalidInput,
    EncodeFailed,
    DecodeFailed,
    EncryptFailed,
    DecryptFailed,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// WebSocket close codes of the signaling protocol.
///
/// The numeric values are an external contract, normal WebSocket codes below
/// 3000 are passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    PathFull = 3000,
    ProtocolError = 3001,
    InternalError = 3002,
    Handover = 3003,
    DroppedByInitiator = 3004,
    InitiatorCouldNotDecrypt = 3005,
    NoSharedTask = 3006,
    InvalidKey = 3007,
    Timeout = 3008,
}

/// A signaling frame split into its nonce and payload.
///
/// # Test
///
/// ```
/// use salty_server_codec::Frame;
/// use salty_server_codec::nonce::{Address, Cookie, Nonce};
///
/// let nonce = Nonce {
///     source: Address::SERVER,
///     destination: Address::INITIATOR,
///     combined_sequence: 1,
///     cookie: Cookie::from([7u8; 16]),
/// };
///
/// let bytes = Frame::encode(&nonce, b"payload");
/// let frame = Frame::decode(&bytes).unwrap();
///
/// assert_eq!(frame.nonce, nonce);
/// assert_eq!(frame.payload, b"payload");
/// ```
pub struct Frame<'a> {
    pub nonce: Nonce,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < NONCE_LENGTH {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            nonce: Nonce::decode(&bytes[..NONCE_LENGTH])?,
            payload: &bytes[NONCE_LENGTH..],
        })
    }

    pub fn encode(nonce: &Nonce, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(NONCE_LENGTH + payload.len());
        bytes.extend_from_slice(&nonce.encode());
        bytes.extend_from_slice(payload);
        bytes
    }
}
