use anyhow::Result;
use rand::Rng;
use serde_bytes::ByteBuf;

use salty_server_codec::{
    CloseCode, Error, Frame,
    crypto::{SecretKey, SharedBox},
    message::Message,
    nonce::{Address, COOKIE_LENGTH, Cookie, NONCE_LENGTH, Nonce},
};

fn random_cookie() -> Cookie {
    let mut bytes = [0u8; COOKIE_LENGTH];
    rand::rng().fill(&mut bytes[..]);
    Cookie::from(bytes)
}

#[test]
fn test_nonce_round_trip() -> Result<()> {
    let nonce = Nonce {
        source: Address(0x02),
        destination: Address::INITIATOR,
        combined_sequence: (0x1234u64 << 32) | 0xdead_beef,
        cookie: random_cookie(),
    };

    let bytes = nonce.encode();
    assert_eq!(bytes.len(), NONCE_LENGTH);
    assert_eq!(bytes[0], 0x02);
    assert_eq!(bytes[1], 0x01);
    assert_eq!(&bytes[2..4], &[0x12, 0x34]);
    assert_eq!(&bytes[4..8], &[0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(&bytes[8..], nonce.cookie.as_bytes());

    assert_eq!(Nonce::decode(&bytes)?, nonce);
    assert_eq!(nonce.overflow_number(), 0x1234);
    assert_eq!(nonce.sequence_number(), 0xdead_beef);
    assert_eq!(&nonce.short_id(), &bytes[..8]);

    Ok(())
}

#[test]
fn test_frame_split() -> Result<()> {
    let nonce = Nonce {
        source: Address::SERVER,
        destination: Address(0x05),
        combined_sequence: 7,
        cookie: random_cookie(),
    };

    let bytes = Frame::encode(&nonce, b"opaque payload");
    let frame = Frame::decode(&bytes)?;

    assert_eq!(frame.nonce, nonce);
    assert_eq!(frame.payload, b"opaque payload");

    // Too short for a nonce.
    assert_eq!(
        Frame::decode(&bytes[..NONCE_LENGTH - 1]).err(),
        Some(Error::InvalidInput)
    );

    Ok(())
}

#[test]
fn test_message_round_trip() -> Result<()> {
    let messages = [
        Message::ServerHello {
            key: ByteBuf::from(vec![1u8; 32]),
        },
        Message::ClientHello {
            key: ByteBuf::from(vec![2u8; 32]),
        },
        Message::ClientAuth {
            your_cookie: ByteBuf::from(vec![3u8; 16]),
            your_key: Some(ByteBuf::from(vec![4u8; 32])),
            subprotocols: vec!["v1.saltyrtc.org".to_string()],
            ping_interval: Some(60),
        },
        Message::ServerAuth {
            your_cookie: ByteBuf::from(vec![5u8; 16]),
            signed_keys: ByteBuf::from(vec![6u8; 80]),
            initiator_connected: Some(true),
            responders: None,
        },
        Message::NewInitiator,
        Message::NewResponder { id: 0x02 },
        Message::DropResponder {
            id: 0x03,
            reason: Some(3004),
        },
        Message::SendError {
            id: ByteBuf::from(vec![7u8; 8]),
        },
        Message::Disconnected { id: 0x01 },
    ];

    for message in messages {
        assert_eq!(Message::decode(&message.encode()?)?, message);
    }

    Ok(())
}

#[test]
fn test_message_optional_fields() -> Result<()> {
    // client-auth without a server key selection and without a ping
    // interval.
    let message = Message::ClientAuth {
        your_cookie: ByteBuf::from(vec![1u8; 16]),
        your_key: None,
        subprotocols: Vec::new(),
        ping_interval: None,
    };

    let decoded = Message::decode(&message.encode()?)?;
    assert_eq!(decoded, message);

    // Garbage is not a message.
    assert!(Message::decode(&[0xc1, 0x00, 0xff]).is_err());

    Ok(())
}

#[test]
fn test_box_round_trip() -> Result<()> {
    let server = SecretKey::generate();
    let client = SecretKey::generate();

    let nonce = Nonce {
        source: Address::SERVER,
        destination: Address::INITIATOR,
        combined_sequence: 1,
        cookie: random_cookie(),
    };

    // The two precomputed directions are the same box.
    let sealing = SharedBox::new(&client.public_key(), &server);
    let opening = SharedBox::new(&server.public_key(), &client);

    let cipher = sealing.seal(b"signaling", &nonce.encode())?;
    assert_ne!(&cipher, b"signaling");
    assert_eq!(opening.open(&cipher, &nonce.encode())?, b"signaling");

    // A flipped ciphertext byte fails authentication.
    let mut forged = cipher.clone();
    forged[0] ^= 1;
    assert_eq!(
        opening.open(&forged, &nonce.encode()).err(),
        Some(Error::DecryptFailed)
    );

    // The wrong nonce fails as well.
    let mut wrong = nonce;
    wrong.combined_sequence += 1;
    assert_eq!(
        opening.open(&cipher, &wrong.encode()).err(),
        Some(Error::DecryptFailed)
    );

    Ok(())
}

#[test]
fn test_secret_key_restore() {
    let restored = SecretKey::from_bytes([7u8; 32]);

    // The same seed always derives the same public key.
    assert_eq!(
        SecretKey::from_bytes([7u8; 32]).public_key(),
        restored.public_key()
    );
    assert_ne!(SecretKey::generate().public_key(), restored.public_key());
}

#[test]
fn test_close_codes() {
    assert_eq!(u16::from(CloseCode::Normal), 1000);
    assert_eq!(u16::from(CloseCode::PathFull), 3000);
    assert_eq!(u16::from(CloseCode::ProtocolError), 3001);
    assert_eq!(u16::from(CloseCode::InternalError), 3002);
    assert_eq!(u16::from(CloseCode::DroppedByInitiator), 3004);
    assert_eq!(u16::from(CloseCode::InitiatorCouldNotDecrypt), 3005);
    assert_eq!(u16::from(CloseCode::NoSharedTask), 3006);
    assert_eq!(u16::from(CloseCode::InvalidKey), 3007);
    assert_eq!(u16::from(CloseCode::Timeout), 3008);

    assert_eq!(
        CloseCode::try_from(3004).unwrap(),
        CloseCode::DroppedByInitiator
    );
    assert!(CloseCode::try_from(3100).is_err());

    let address = Address(0xff);
    assert_eq!(address.kind(), None);
}
