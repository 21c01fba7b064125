use crate::{Error, client::Client};

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use ahash::{HashMap, HashMapExt};
use codec::{crypto::PublicKey, nonce::Address};
use parking_lot::Mutex;

struct Slots {
    // Cleared when the registry garbage collects the path; attach attempts
    // racing the collection fail and fetch a fresh path.
    attached: bool,
    initiator: Option<Arc<Client>>,
    responders: HashMap<Address, Arc<Client>>,
}

/// The rendezvous of one initiator and its responders, keyed by the
/// initiator's public permanent key.
///
/// Slot `0x01` belongs to the initiator, `0x02..=0xfe` to responders. A path
/// only ever references authenticated (or dropped) clients; it holds them by
/// reference and never tears a connection down itself.
pub struct Path {
    initiator_key: PublicKey,
    number: u64,
    slots: Mutex<Slots>,
}

impl Path {
    fn new(initiator_key: PublicKey, number: u64) -> Self {
        Self {
            initiator_key,
            number,
            slots: Mutex::new(Slots {
                attached: true,
                initiator: None,
                responders: HashMap::with_capacity(8),
            }),
        }
    }

    pub fn initiator_key(&self) -> PublicKey {
        self.initiator_key
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Whether the path holds no client at all.
    pub fn empty(&self) -> bool {
        let slots = self.slots.lock();
        slots.initiator.is_none() && slots.responders.is_empty()
    }

    /// Install `initiator` at slot `0x01`, authenticating it, and return the
    /// displaced predecessor if any.
    ///
    /// The caller is responsible for dropping the returned previous
    /// initiator with `DroppedByInitiator`; the displacement only becomes
    /// observable to the old initiator after the new one is installed.
    pub fn set_initiator(&self, initiator: &Arc<Client>) -> Result<Option<Arc<Client>>, Error> {
        let mut slots = self.slots.lock();
        if !slots.attached {
            return Err(Error::PathDetached);
        }

        initiator.authenticate(Address::INITIATOR)?;
        let previous = slots.initiator.replace(initiator.clone());

        log::debug!("path {}: set initiator {:?}", self.number, initiator);
        Ok(previous)
    }

    /// Install `responder` at the smallest unused responder slot,
    /// authenticating it. Fails with `SlotsFull` when all 253 slots are
    /// taken.
    pub fn add_responder(&self, responder: &Arc<Client>) -> Result<Address, Error> {
        let mut slots = self.slots.lock();
        if !slots.attached {
            return Err(Error::PathDetached);
        }

        let address = (Address::RESPONDER_MIN.0..=Address::RESPONDER_MAX.0)
            .map(Address)
            .find(|address| !slots.responders.contains_key(address))
            .ok_or(Error::SlotsFull)?;

        responder.authenticate(address)?;
        slots.responders.insert(address, responder.clone());

        log::debug!("path {}: added responder {:?}", self.number, responder);
        Ok(address)
    }

    /// Put a displaced initiator back into slot `0x01`, used when the
    /// displacing handshake fails after the swap. The restore only happens
    /// while `failed` still occupies the slot; if an even newer initiator
    /// has taken over meanwhile, nothing changes and `false` is returned.
    pub fn restore_initiator(&self, previous: Arc<Client>, failed: &Arc<Client>) -> bool {
        let mut slots = self.slots.lock();
        if slots
            .initiator
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, failed))
        {
            slots.initiator = Some(previous);
            log::debug!("path {}: restored previous initiator", self.number);
            return true;
        }

        false
    }

    pub fn get_initiator(&self) -> Option<Arc<Client>> {
        self.slots.lock().initiator.clone()
    }

    pub fn get_responder(&self, address: Address) -> Option<Arc<Client>> {
        self.slots.lock().responders.get(&address).cloned()
    }

    /// The currently taken responder slots, in ascending order.
    pub fn responder_ids(&self) -> Vec<Address> {
        let mut ids: Vec<Address> = self.slots.lock().responders.keys().copied().collect();
        ids.sort();
        ids
    }

    /// All currently connected responders.
    pub fn responders(&self) -> Vec<Arc<Client>> {
        self.slots.lock().responders.values().cloned().collect()
    }

    /// Whether this exact client instance still occupies its slot. A client
    /// whose slot has since been taken over by somebody else reports
    /// `false`.
    pub fn has_client(&self, client: &Arc<Client>) -> bool {
        let id = client.id();
        let slots = self.slots.lock();

        if id.is_initiator() {
            return slots
                .initiator
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, client));
        }

        if id.is_responder() {
            return slots
                .responders
                .get(&id)
                .is_some_and(|current| Arc::ptr_eq(current, client));
        }

        false
    }

    /// Remove a client from the path. Returns whether it was removed.
    ///
    /// Restricted clients were never installed, and a slot that has since
    /// been taken over by a later client is left intact, so double removes
    /// and removes after displacement are no-ops.
    pub fn remove_client(&self, client: &Arc<Client>) -> bool {
        use crate::client::ClientState;

        if client.state() == ClientState::Restricted {
            return false;
        }

        let id = client.id();
        let mut slots = self.slots.lock();

        if id.is_initiator() {
            if slots
                .initiator
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, client))
            {
                slots.initiator = None;
                log::debug!("path {}: removed initiator", self.number);
                return true;
            }

            return false;
        }

        if id.is_responder()
            && slots
                .responders
                .get(&id)
                .is_some_and(|current| Arc::ptr_eq(current, client))
        {
            slots.responders.remove(&id);
            log::debug!("path {}: removed responder {}", self.number, id);
            return true;
        }

        false
    }

    fn detach(&self) -> bool {
        let mut slots = self.slots.lock();
        if slots.initiator.is_some() || !slots.responders.is_empty() {
            return false;
        }

        slots.attached = false;
        true
    }
}

/// Owner of all living paths.
///
/// Paths are created lazily on first authenticated attach and garbage
/// collected once they hold no client any more.
#[derive(Default)]
pub struct PathRegistry {
    paths: Mutex<HashMap<PublicKey, Arc<Path>>>,
    number: AtomicU64,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The path for an initiator key. Concurrent calls with the same key
    /// return the same path.
    pub fn get_or_create(&self, initiator_key: PublicKey) -> Arc<Path> {
        self.paths
            .lock()
            .entry(initiator_key)
            .or_insert_with(|| {
                let number = self.number.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("created path {}", number);
                Arc::new(Path::new(initiator_key, number))
            })
            .clone()
    }

    /// Destroy the path if it no longer holds any client.
    pub fn drop_if_empty(&self, path: &Arc<Path>) {
        let mut paths = self.paths.lock();

        // The detach marker is flipped under both locks, attaches racing the
        // collection observe it and retry against a fresh path.
        if !path.detach() {
            return;
        }

        if paths
            .get(&path.initiator_key)
            .is_some_and(|current| Arc::ptr_eq(current, path))
        {
            paths.remove(&path.initiator_key);
            log::debug!("destroyed path {}", path.number);
        }
    }

    /// Number of living paths.
    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }
}
