pub mod queue;
pub mod tasks;

use crate::Error;

use self::{
    queue::{Task, TaskQueue, TaskQueueState},
    tasks::ClientTasks,
};

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use codec::{
    CloseCode, Frame,
    crypto::{PUBLIC_KEY_LENGTH, PublicKey, SecretKey, SharedBox},
    message::Message,
    nonce::{Address, AddressType, COMBINED_SEQUENCE_MAX, COOKIE_LENGTH, Cookie, Nonce},
};
use parking_lot::Mutex;
use rand::Rng;

/// Keep alive intervals below this floor are ignored.
pub const KEEP_ALIVE_INTERVAL_MIN: Duration = Duration::from_secs(1);

/// Default keep alive interval, can be lowered by the client during the
/// handshake.
pub const KEEP_ALIVE_INTERVAL_DEFAULT: Duration = Duration::from_secs(3600);

/// How long a pong may take before the client is considered gone.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection state of a client. Transitions are strictly monotonic:
/// `Restricted -> Authenticated -> Dropped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    Restricted,
    Authenticated,
    Dropped,
}

impl ClientState {
    fn next(self) -> Option<ClientState> {
        match self {
            Self::Restricted => Some(Self::Authenticated),
            Self::Authenticated => Some(Self::Dropped),
            Self::Dropped => None,
        }
    }
}

/// A 48 bit combined sequence number (16 bit overflow number, 32 bit
/// sequence number) with a terminal overflow state.
///
/// # Test
///
/// ```
/// use salty_server_service::client::CombinedSequence;
///
/// let csn = CombinedSequence::Live(0xFFFF_FFFF_FFFE);
///
/// assert_eq!(csn.increment(), CombinedSequence::Live(0xFFFF_FFFF_FFFF));
/// assert_eq!(csn.increment().increment(), CombinedSequence::Overflow);
/// assert_eq!(CombinedSequence::Overflow.increment(), CombinedSequence::Overflow);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinedSequence {
    Live(u64),
    Overflow,
}

impl CombinedSequence {
    /// A fresh outgoing sequence number: overflow number zero, sequence
    /// number random.
    pub fn random() -> Self {
        Self::Live(rand::rng().random::<u32>() as u64)
    }

    /// The next sequence number, or `Overflow` once the value would no
    /// longer fit into 48 bits. `Overflow` is terminal.
    pub fn increment(self) -> Self {
        match self {
            Self::Live(value) if value < COMBINED_SEQUENCE_MAX => Self::Live(value + 1),
            _ => Self::Overflow,
        }
    }
}

/// All key material and per-direction frame validation state of a client.
///
/// Keys are created lazily so a connection that dies during the handshake
/// does not draw entropy it never needed.
#[derive(Default)]
struct CryptoState {
    client_key: Option<PublicKey>,
    server_permanent_key: Option<SecretKey>,
    server_session_key: Option<SecretKey>,
    cookie_out: Option<Cookie>,
    cookie_in: Option<Cookie>,
    csn_out: Option<CombinedSequence>,
    csn_in: Option<CombinedSequence>,
    message_box: Option<SharedBox>,
    sign_box: Option<SharedBox>,
}

impl CryptoState {
    fn cookie_out(&mut self) -> Cookie {
        *self.cookie_out.get_or_insert_with(|| {
            let mut bytes = [0u8; COOKIE_LENGTH];
            rand::rng().fill(&mut bytes[..]);
            Cookie::from(bytes)
        })
    }

    fn session_key(&mut self) -> &SecretKey {
        self.server_session_key.get_or_insert_with(SecretKey::generate)
    }

    fn client_key(&self) -> Result<PublicKey, Error> {
        self.client_key.ok_or(Error::Internal("client's public key not set"))
    }

    fn message_box(&mut self) -> Result<SharedBox, Error> {
        if let Some(message_box) = self.message_box {
            return Ok(message_box);
        }

        let client_key = self.client_key()?;
        let message_box = SharedBox::new(&client_key, self.session_key());
        self.message_box = Some(message_box);
        Ok(message_box)
    }

    fn sign_box(&mut self) -> Result<SharedBox, Error> {
        if let Some(sign_box) = self.sign_box {
            return Ok(sign_box);
        }

        let client_key = self.client_key()?;
        let permanent = self
            .server_permanent_key
            .as_ref()
            .ok_or(Error::Internal("server's permanent secret key not set"))?;

        let sign_box = SharedBox::new(&client_key, permanent);
        self.sign_box = Some(sign_box);
        Ok(sign_box)
    }
}

/// Per-connection protocol actor.
///
/// A client is created on accept in the `Restricted` state, authenticated by
/// its path (which assigns the slot address) and eventually dropped. It is
/// shared between its own three loops and any peer that relays frames
/// towards it; peers only ever touch the task queue and the address.
pub struct Client {
    state: Mutex<ClientState>,
    id: Mutex<Address>,
    role: Mutex<Option<AddressType>>,
    crypto: Mutex<CryptoState>,
    keep_alive_interval: Mutex<Duration>,
    keep_alive_timeout: Mutex<Duration>,
    keep_alive_pings: AtomicU64,
    queue: TaskQueue,
    tasks: ClientTasks,
}

impl Client {
    /// Create a restricted client.
    ///
    /// The initiator's public permanent key doubles as the client key until a
    /// responder replaces it with its session key during the handshake.
    pub fn new(initiator_key: PublicKey) -> Self {
        Self {
            state: Mutex::new(ClientState::Restricted),
            id: Mutex::new(Address::SERVER),
            role: Mutex::new(None),
            crypto: Mutex::new(CryptoState {
                client_key: Some(initiator_key),
                ..Default::default()
            }),
            keep_alive_interval: Mutex::new(KEEP_ALIVE_INTERVAL_DEFAULT),
            keep_alive_timeout: Mutex::new(KEEP_ALIVE_TIMEOUT),
            keep_alive_pings: AtomicU64::new(0),
            queue: TaskQueue::default(),
            tasks: ClientTasks::default(),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    fn set_state(&self, state: ClientState) -> Result<(), Error> {
        let mut current = self.state.lock();
        if Some(state) != current.next() {
            return Err(Error::Internal("invalid client state transition"));
        }

        log::debug!("client state {:?} -> {:?}", *current, state);
        *current = state;
        Ok(())
    }

    /// The slot address assigned by the path, `0x00` while restricted.
    pub fn id(&self) -> Address {
        *self.id.lock()
    }

    /// The peer role, known once the handshake determined it.
    pub fn role(&self) -> Option<AddressType> {
        *self.role.lock()
    }

    pub fn set_role(&self, role: AddressType) {
        *self.role.lock() = Some(role);
    }

    /// Authenticate the client and assign its slot address.
    ///
    /// Only the path may call this.
    pub fn authenticate(&self, id: Address) -> Result<(), Error> {
        self.set_state(ClientState::Authenticated)?;
        *self.id.lock() = id;
        log::debug!("client assigned id {}", id);
        Ok(())
    }

    pub fn keep_alive_interval(&self) -> Duration {
        *self.keep_alive_interval.lock()
    }

    /// Assign a new keep alive interval. Values below
    /// `KEEP_ALIVE_INTERVAL_MIN` are ignored.
    pub fn set_keep_alive_interval(&self, interval: Duration) {
        if interval >= KEEP_ALIVE_INTERVAL_MIN {
            *self.keep_alive_interval.lock() = interval;
        }
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        *self.keep_alive_timeout.lock()
    }

    pub fn set_keep_alive_timeout(&self, timeout: Duration) {
        *self.keep_alive_timeout.lock() = timeout;
    }

    /// Successful keep alive round trips so far.
    pub fn keep_alive_pings(&self) -> u64 {
        self.keep_alive_pings.load(Ordering::Relaxed)
    }

    pub fn record_keep_alive_ping(&self) -> u64 {
        self.keep_alive_pings.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The client's current public key.
    pub fn client_key(&self) -> Result<PublicKey, Error> {
        self.crypto.lock().client_key()
    }

    /// Replace the client's public key (responder session key switch) and
    /// invalidate the memoized message box.
    pub fn set_client_key(&self, key: PublicKey) {
        let mut crypto = self.crypto.lock();
        crypto.client_key = Some(key);
        crypto.message_box = None;
        log::debug!("client key updated");
    }

    /// The server's per-connection session public key, generated on first
    /// access.
    pub fn server_session_key(&self) -> PublicKey {
        self.crypto.lock().session_key().public_key()
    }

    /// Set the server permanent key the client selected from the advertised
    /// set.
    pub fn set_server_permanent_key(&self, key: SecretKey) {
        self.crypto.lock().server_permanent_key = Some(key);
    }

    /// The cookie used for outgoing frames, generated on first access.
    pub fn cookie_out(&self) -> Cookie {
        self.crypto.lock().cookie_out()
    }

    /// The cookie of the client, recorded from its first frame.
    pub fn cookie_in(&self) -> Result<Cookie, Error> {
        self.crypto
            .lock()
            .cookie_in
            .ok_or(Error::Internal("client's cookie not set"))
    }

    /// Validate the cookie of an incoming frame.
    ///
    /// The first cookie seen is recorded for the lifetime of the connection,
    /// after rejecting a collision with the server's own cookie. Every later
    /// frame must repeat it.
    pub fn validate_cookie_in(&self, cookie: Cookie) -> Result<(), Error> {
        let mut crypto = self.crypto.lock();
        match crypto.cookie_in {
            None => {
                if cookie == crypto.cookie_out() {
                    return Err(Error::Message(
                        "server and client cookies are the same".to_string(),
                    ));
                }

                crypto.cookie_in = Some(cookie);
                Ok(())
            }
            Some(expected) => {
                if cookie != expected {
                    return Err(Error::Message("client sent wrong cookie".to_string()));
                }

                Ok(())
            }
        }
    }

    /// Validate the combined sequence number of an incoming frame.
    ///
    /// The first frame must carry a zero overflow number and pins the
    /// counter; every later frame must be exactly the previous value plus
    /// one. Once the counter has overflowed, nothing can be received on this
    /// connection any more.
    pub fn validate_csn_in(&self, csn: u64) -> Result<(), Error> {
        let mut crypto = self.crypto.lock();

        match crypto.csn_in {
            None => {
                if csn & 0xFFFF_0000_0000 != 0 {
                    return Err(Error::Message(
                        "invalid sequence number, leading 16 bits are not 0".to_string(),
                    ));
                }

                crypto.csn_in = Some(CombinedSequence::Live(csn));
                Ok(())
            }
            Some(CombinedSequence::Overflow) => Err(Error::MessageFlow(
                "cannot receive any more messages, due to a sequence number counter overflow",
            )),
            Some(CombinedSequence::Live(expected)) => {
                if csn != expected {
                    return Err(Error::Message(format!(
                        "invalid sequence number, expected {}, got {}",
                        expected, csn
                    )));
                }

                Ok(())
            }
        }
    }

    /// Advance the incoming sequence number, once the frame has been fully
    /// processed.
    pub fn increment_csn_in(&self) -> Result<(), Error> {
        let mut crypto = self.crypto.lock();
        match crypto.csn_in {
            Some(csn) => {
                crypto.csn_in = Some(csn.increment());
                Ok(())
            }
            None => Err(Error::Internal("client's combined sequence number not set")),
        }
    }

    /// The nonce of the next outgoing frame. Initializes the outgoing cookie
    /// and sequence number on first use and advances the sequence number.
    pub fn next_nonce(&self) -> Result<Nonce, Error> {
        let destination = self.id();
        let mut crypto = self.crypto.lock();

        let csn = *crypto.csn_out.get_or_insert_with(CombinedSequence::random);
        let combined_sequence = match csn {
            CombinedSequence::Live(value) => value,
            CombinedSequence::Overflow => {
                return Err(Error::MessageFlow(
                    "cannot send any more messages, due to a sequence number counter overflow",
                ));
            }
        };

        crypto.csn_out = Some(csn.increment());
        let cookie = crypto.cookie_out();

        Ok(Nonce {
            source: Address::SERVER,
            destination,
            combined_sequence,
            cookie,
        })
    }

    /// Pack a server message for this client.
    pub fn pack(&self, message: &Message, encrypt: bool) -> Result<Vec<u8>, Error> {
        let nonce = self.next_nonce()?;
        self.pack_with_nonce(&nonce, message, encrypt)
    }

    /// Pack a server message against an already drawn nonce. Needed for
    /// `server-auth`, whose signed keys commit to the message nonce.
    pub fn pack_with_nonce(
        &self,
        nonce: &Nonce,
        message: &Message,
        encrypt: bool,
    ) -> Result<Vec<u8>, Error> {
        log::debug!("packing message: {}", message.kind());
        let payload = message
            .encode()
            .map_err(|_| Error::Internal("message encoding failed"))?;

        let payload = if encrypt {
            self.crypto
                .lock()
                .message_box()?
                .seal(&payload, &nonce.encode())
                .map_err(|_| Error::Internal("message encryption failed"))?
        } else {
            payload
        };

        Ok(Frame::encode(nonce, &payload))
    }

    /// Decrypt the payload of an incoming frame with the message box.
    pub fn unseal(&self, nonce: &Nonce, payload: &[u8]) -> Result<Vec<u8>, Error> {
        self.crypto
            .lock()
            .message_box()?
            .open(payload, &nonce.encode())
            .map_err(|_| Error::Message("could not decrypt payload".to_string()))
    }

    /// The keys disclosed in `server-auth`, signed with the sign box: the
    /// server's session public key followed by the client's public key,
    /// sealed against the message nonce.
    pub fn signed_keys(&self, nonce: &Nonce) -> Result<Vec<u8>, Error> {
        let mut crypto = self.crypto.lock();

        let mut plain = Vec::with_capacity(PUBLIC_KEY_LENGTH * 2);
        plain.extend_from_slice(crypto.session_key().public_key().as_bytes());
        plain.extend_from_slice(crypto.client_key()?.as_bytes());

        crypto
            .sign_box()?
            .seal(&plain, &nonce.encode())
            .map_err(|_| Error::Internal("signing the server-auth keys failed"))
    }

    /// Whether this client may relay frames to the given destination type:
    /// it must be authenticated and the destination must be the opposite
    /// peer role.
    pub fn p2p_allowed(&self, destination: AddressType) -> bool {
        self.state() == ClientState::Authenticated && self.role() != Some(destination)
    }

    pub fn enqueue_task(&self, task: Task, ignore_closed: bool) -> Result<(), Task> {
        self.queue.enqueue(task, ignore_closed)
    }

    pub async fn dequeue_task(&self) -> Option<Task> {
        self.queue.dequeue().await
    }

    pub fn task_done(&self) -> Result<(), Error> {
        self.queue.task_done()
    }

    pub fn task_queue_state(&self) -> TaskQueueState {
        self.queue.state()
    }

    pub fn close_task_queue(&self) {
        self.queue.close();
    }

    pub fn cancel_task_queue(&self) {
        self.queue.cancel();
    }

    pub async fn join_task_queue(&self) {
        self.queue.join().await;
    }

    pub fn tasks(&self) -> &ClientTasks {
        &self.tasks
    }

    /// Drop this client: queue the delayed close behind any pending work,
    /// freeze the queue, cancel the receive and keep alive loops and advance
    /// the state.
    ///
    /// The task loop is spared so frames already relayed towards this client
    /// still drain before the close frame is written. Should only be called
    /// for clients dropping another client or by the server on a policy
    /// violation; dropping an already dropped client does nothing.
    pub fn drop(&self, code: CloseCode) -> Result<(), Error> {
        if self.state() == ClientState::Dropped {
            return Ok(());
        }

        log::debug!("scheduling delayed closing procedure, code: {:?}", code);
        self.queue.close();
        if let Err(task) = self.queue.enqueue(Task::Close(code), true) {
            // Queue already cancelled, the connection is going away anyway.
            drop(task);
        }

        self.tasks.cancel_all_but_task_loop();
        self.set_state(ClientState::Dropped)?;
        log::debug!("client dropped, close code: {:?}", code);
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("id", &self.id())
            .field("role", &self.role())
            .finish()
    }
}
