use crate::Error;

/// Length of the frame nonce in bytes.
pub const NONCE_LENGTH: usize = 24;

/// Length of a cookie in bytes.
pub const COOKIE_LENGTH: usize = 16;

/// Largest value a combined sequence number can take (48 bits).
pub const COMBINED_SEQUENCE_MAX: u64 = 0xFFFF_FFFF_FFFF;

/// The 1 byte slot address of a signaling frame.
///
/// `0x00` is the server, `0x01` the initiator and `0x02..=0xfe` the responder
/// slots. `0xff` is reserved by the protocol and never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u8);

impl Address {
    pub const SERVER: Address = Address(0x00);
    pub const INITIATOR: Address = Address(0x01);
    pub const RESPONDER_MIN: Address = Address(0x02);
    pub const RESPONDER_MAX: Address = Address(0xfe);

    /// # Test
    ///
    /// ```
    /// use salty_server_codec::nonce::{Address, AddressType};
    ///
    /// assert_eq!(Address::SERVER.kind(), Some(AddressType::Server));
    /// assert_eq!(Address::INITIATOR.kind(), Some(AddressType::Initiator));
    /// assert_eq!(Address(0x02).kind(), Some(AddressType::Responder));
    /// assert_eq!(Address(0xfe).kind(), Some(AddressType::Responder));
    /// assert_eq!(Address(0xff).kind(), None);
    /// ```
    pub fn kind(&self) -> Option<AddressType> {
        Some(match self.0 {
            0x00 => AddressType::Server,
            0x01 => AddressType::Initiator,
            0x02..=0xfe => AddressType::Responder,
            _ => return None,
        })
    }

    pub fn is_server(&self) -> bool {
        self.0 == 0x00
    }

    pub fn is_initiator(&self) -> bool {
        self.0 == 0x01
    }

    pub fn is_responder(&self) -> bool {
        (0x02..=0xfe).contains(&self.0)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Classification of an address into the three peer roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Server,
    Initiator,
    Responder,
}

/// The 16 byte cookie a peer picks once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie([u8; COOKIE_LENGTH]);

impl Cookie {
    pub fn as_bytes(&self) -> &[u8; COOKIE_LENGTH] {
        &self.0
    }
}

impl From<[u8; COOKIE_LENGTH]> for Cookie {
    fn from(bytes: [u8; COOKIE_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Cookie {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(bytes.try_into().map_err(|_| Error::InvalidInput)?))
    }
}

/// The frame nonce.
///
/// Layout: `source (1) | destination (1) | overflow (2, BE) | sequence
/// (4, BE) | cookie (16)`. The overflow and sequence fields together form the
/// 48 bit combined sequence number.
///
/// # Test
///
/// ```
/// use salty_server_codec::nonce::{Address, Cookie, Nonce};
///
/// let nonce = Nonce {
///     source: Address(0x02),
///     destination: Address::SERVER,
///     combined_sequence: (1 << 32) | 42,
///     cookie: Cookie::from([1u8; 16]),
/// };
///
/// assert_eq!(nonce.overflow_number(), 1);
/// assert_eq!(nonce.sequence_number(), 42);
/// assert_eq!(Nonce::decode(&nonce.encode()).unwrap(), nonce);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce {
    pub source: Address,
    pub destination: Address,
    pub combined_sequence: u64,
    pub cookie: Cookie,
}

impl Nonce {
    pub fn overflow_number(&self) -> u16 {
        (self.combined_sequence >> 32) as u16
    }

    pub fn sequence_number(&self) -> u32 {
        self.combined_sequence as u32
    }

    /// The first 8 nonce bytes, used as the frame reference of a
    /// `send-error` message.
    pub fn short_id(&self) -> [u8; 8] {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.encode()[..8]);
        id
    }

    pub fn encode(&self) -> [u8; NONCE_LENGTH] {
        let mut bytes = [0u8; NONCE_LENGTH];
        bytes[0] = self.source.0;
        bytes[1] = self.destination.0;
        bytes[2..4].copy_from_slice(&self.overflow_number().to_be_bytes());
        bytes[4..8].copy_from_slice(&self.sequence_number().to_be_bytes());
        bytes[8..].copy_from_slice(self.cookie.as_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != NONCE_LENGTH {
            return Err(Error::InvalidInput);
        }

        let overflow = u16::from_be_bytes(bytes[2..4].try_into().unwrap());
        let sequence = u32::from_be_bytes(bytes[4..8].try_into().unwrap());

        Ok(Self {
            source: Address(bytes[0]),
            destination: Address(bytes[1]),
            combined_sequence: ((overflow as u64) << 32) | sequence as u64,
            cookie: Cookie::try_from(&bytes[8..])?,
        })
    }
}
