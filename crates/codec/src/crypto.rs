//! NaCl box primitives.
//!
//! Thin safe wrappers around libsodium's `crypto_box`
//! (Curve25519-XSalsa20-Poly1305). All unsafe code of the crate lives here.

use crate::{Error, nonce::NONCE_LENGTH};

use std::sync::Once;

use libsodium_sys as sodium;

pub const PUBLIC_KEY_LENGTH: usize = sodium::crypto_box_PUBLICKEYBYTES as usize;
pub const SECRET_KEY_LENGTH: usize = sodium::crypto_box_SECRETKEYBYTES as usize;
pub const SHARED_KEY_LENGTH: usize = sodium::crypto_box_BEFORENMBYTES as usize;
pub const MAC_LENGTH: usize = sodium::crypto_box_MACBYTES as usize;

// The frame nonce doubles as the box nonce.
const _: () = assert!(NONCE_LENGTH == sodium::crypto_box_NONCEBYTES as usize);

/// libsodium must be initialized once before any other call.
fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        if unsafe { sodium::sodium_init() } < 0 {
            panic!("libsodium initialization failed");
        }
    });
}

/// A Curve25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }
}

impl From<[u8; PUBLIC_KEY_LENGTH]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(bytes.try_into().map_err(|_| Error::InvalidInput)?))
    }
}

/// A Curve25519 keypair.
#[derive(Clone)]
pub struct SecretKey {
    public: PublicKey,
    secret: [u8; SECRET_KEY_LENGTH],
}

impl SecretKey {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        init();

        let mut public = [0u8; PUBLIC_KEY_LENGTH];
        let mut secret = [0u8; SECRET_KEY_LENGTH];
        unsafe {
            sodium::crypto_box_keypair(public.as_mut_ptr(), secret.as_mut_ptr());
        }

        Self {
            public: PublicKey(public),
            secret,
        }
    }

    /// Restore a keypair from its secret half.
    pub fn from_bytes(secret: [u8; SECRET_KEY_LENGTH]) -> Self {
        init();

        let mut public = [0u8; PUBLIC_KEY_LENGTH];
        unsafe {
            sodium::crypto_scalarmult_base(public.as_mut_ptr(), secret.as_ptr());
        }

        Self {
            public: PublicKey(public),
            secret,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }
}

// The secret half must not end up in logs.
impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretKey").field(&self.public).finish()
    }
}

/// A precomputed box between one secret and one public key.
///
/// Precomputing the shared key once makes sealing and opening per frame a
/// symmetric operation.
///
/// # Test
///
/// ```
/// use salty_server_codec::crypto::{SecretKey, SharedBox};
///
/// let server = SecretKey::generate();
/// let client = SecretKey::generate();
/// let nonce = [3u8; 24];
///
/// let sealed = SharedBox::new(&client.public_key(), &server)
///     .seal(b"hello", &nonce)
///     .unwrap();
///
/// let opened = SharedBox::new(&server.public_key(), &client)
///     .open(&sealed, &nonce)
///     .unwrap();
///
/// assert_eq!(opened, b"hello");
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SharedBox([u8; SHARED_KEY_LENGTH]);

impl SharedBox {
    pub fn new(public: &PublicKey, secret: &SecretKey) -> Self {
        init();

        let mut shared = [0u8; SHARED_KEY_LENGTH];
        unsafe {
            sodium::crypto_box_beforenm(
                shared.as_mut_ptr(),
                public.0.as_ptr(),
                secret.secret.as_ptr(),
            );
        }

        Self(shared)
    }

    /// Encrypt `plain` under the given nonce. The result is `MAC_LENGTH`
    /// bytes longer than the input.
    pub fn seal(&self, plain: &[u8], nonce: &[u8; NONCE_LENGTH]) -> Result<Vec<u8>, Error> {
        let mut cipher = vec![0u8; plain.len() + MAC_LENGTH];

        let result = unsafe {
            sodium::crypto_box_easy_afternm(
                cipher.as_mut_ptr(),
                plain.as_ptr(),
                plain.len() as u64,
                nonce.as_ptr(),
                self.0.as_ptr(),
            )
        };

        if result != 0 {
            return Err(Error::EncryptFailed);
        }

        Ok(cipher)
    }

    /// Decrypt `cipher` under the given nonce. Fails if the ciphertext is too
    /// short or its authentication tag does not verify.
    pub fn open(&self, cipher: &[u8], nonce: &[u8; NONCE_LENGTH]) -> Result<Vec<u8>, Error> {
        if cipher.len() < MAC_LENGTH {
            return Err(Error::DecryptFailed);
        }

        let mut plain = vec![0u8; cipher.len() - MAC_LENGTH];

        let result = unsafe {
            sodium::crypto_box_open_easy_afternm(
                plain.as_mut_ptr(),
                cipher.as_ptr(),
                cipher.len() as u64,
                nonce.as_ptr(),
                self.0.as_ptr(),
            )
        };

        if result != 0 {
            return Err(Error::DecryptFailed);
        }

        Ok(plain)
    }
}

impl std::fmt::Debug for SharedBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedBox").finish()
    }
}
