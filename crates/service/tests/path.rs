use std::sync::Arc;

use anyhow::Result;

use codec::{crypto::PublicKey, nonce::Address};
use salty_server_service::{
    Error,
    client::{Client, ClientState},
    path::PathRegistry,
};

fn key(byte: u8) -> PublicKey {
    PublicKey::from([byte; 32])
}

#[test]
fn test_registry_returns_one_path_per_key() {
    let registry = PathRegistry::new();

    let a = registry.get_or_create(key(1));
    let b = registry.get_or_create(key(1));
    let c = registry.get_or_create(key(2));

    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_initiator_slot() -> Result<()> {
    let registry = PathRegistry::new();
    let path = registry.get_or_create(key(1));

    let first = Arc::new(Client::new(key(1)));
    assert!(path.set_initiator(&first)?.is_none());
    assert_eq!(first.state(), ClientState::Authenticated);
    assert_eq!(first.id(), Address::INITIATOR);
    assert!(path.has_client(&first));

    // A second initiator displaces the first one wholesale.
    let second = Arc::new(Client::new(key(1)));
    let previous = path.set_initiator(&second)?.unwrap();
    assert!(Arc::ptr_eq(&previous, &first));
    assert!(path.has_client(&second));
    assert!(!path.has_client(&first));

    // The displaced initiator's removal leaves the current occupant alone.
    assert!(!path.remove_client(&first));
    assert!(path.has_client(&second));

    assert!(path.remove_client(&second));
    assert!(!path.remove_client(&second));
    assert!(path.empty());

    Ok(())
}

#[test]
fn test_restore_initiator() -> Result<()> {
    let registry = PathRegistry::new();
    let path = registry.get_or_create(key(1));

    let first = Arc::new(Client::new(key(1)));
    path.set_initiator(&first)?;

    // A takeover that fails mid-handshake puts the predecessor back.
    let second = Arc::new(Client::new(key(1)));
    let previous = path.set_initiator(&second)?.unwrap();
    assert!(Arc::ptr_eq(&previous, &first));
    assert!(path.restore_initiator(previous, &second));
    assert!(path.has_client(&first));
    assert!(!path.has_client(&second));

    // With a newer occupant in place the restore is refused.
    let third = Arc::new(Client::new(key(1)));
    path.set_initiator(&third)?;
    assert!(!path.restore_initiator(first.clone(), &second));
    assert!(path.has_client(&third));
    assert!(!path.has_client(&first));

    Ok(())
}

#[test]
fn test_responder_slot_assignment() -> Result<()> {
    let registry = PathRegistry::new();
    let path = registry.get_or_create(key(1));

    let a = Arc::new(Client::new(key(1)));
    let b = Arc::new(Client::new(key(1)));
    let c = Arc::new(Client::new(key(1)));

    // Ascending assignment, starting at 0x02.
    assert_eq!(path.add_responder(&a)?, Address(0x02));
    assert_eq!(path.add_responder(&b)?, Address(0x03));
    assert_eq!(path.add_responder(&c)?, Address(0x04));
    assert_eq!(a.state(), ClientState::Authenticated);
    assert_eq!(
        path.responder_ids(),
        vec![Address(0x02), Address(0x03), Address(0x04)]
    );

    // A freed slot is the smallest unused one again.
    assert!(path.remove_client(&b));
    let d = Arc::new(Client::new(key(1)));
    assert_eq!(path.add_responder(&d)?, Address(0x03));

    // The old occupant of the slot is gone for good.
    assert!(!path.has_client(&b));
    assert!(!path.remove_client(&b));
    assert!(path.has_client(&d));

    Ok(())
}

#[test]
fn test_slots_full() -> Result<()> {
    let registry = PathRegistry::new();
    let path = registry.get_or_create(key(1));

    let mut responders = Vec::with_capacity(253);
    for _ in 0..253 {
        let responder = Arc::new(Client::new(key(1)));
        path.add_responder(&responder)?;
        responders.push(responder);
    }

    assert_eq!(responders.first().unwrap().id(), Address(0x02));
    assert_eq!(responders.last().unwrap().id(), Address(0xfe));

    // The 254th responder has no slot left.
    let overflow = Arc::new(Client::new(key(1)));
    assert!(matches!(path.add_responder(&overflow), Err(Error::SlotsFull)));
    assert_eq!(overflow.state(), ClientState::Restricted);

    Ok(())
}

#[test]
fn test_remove_restricted_is_a_no_op() {
    let registry = PathRegistry::new();
    let path = registry.get_or_create(key(1));

    let restricted = Arc::new(Client::new(key(1)));
    assert!(!path.remove_client(&restricted));
    assert!(!path.has_client(&restricted));
}

#[test]
fn test_garbage_collection() -> Result<()> {
    let registry = PathRegistry::new();
    let path = registry.get_or_create(key(1));

    let initiator = Arc::new(Client::new(key(1)));
    path.set_initiator(&initiator)?;

    // Occupied paths survive.
    registry.drop_if_empty(&path);
    assert_eq!(registry.len(), 1);
    assert!(Arc::ptr_eq(&registry.get_or_create(key(1)), &path));

    // Empty paths are destroyed, a later attach gets a fresh one.
    path.remove_client(&initiator);
    registry.drop_if_empty(&path);
    assert!(registry.is_empty());

    let fresh = registry.get_or_create(key(1));
    assert!(!Arc::ptr_eq(&fresh, &path));

    // Attaching to the collected path is refused.
    let late = Arc::new(Client::new(key(1)));
    assert!(matches!(
        path.set_initiator(&late),
        Err(Error::PathDetached)
    ));
    assert!(matches!(path.add_responder(&late), Err(Error::PathDetached)));

    Ok(())
}
