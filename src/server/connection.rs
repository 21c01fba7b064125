use super::Server;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_bytes::ByteBuf;
use tokio::{
    net::TcpStream,
    sync::{Notify, oneshot},
    time::timeout,
};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
    protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode as WsCloseCode},
};

use codec::{
    CloseCode, Frame,
    crypto::PublicKey,
    message::Message,
    nonce::{Address, AddressType, Nonce},
};
use service::{
    Error,
    client::{Client, ClientState, queue::Task},
    path::Path,
};

type Reader = SplitStream<WebSocketStream<TcpStream>>;
type Writer = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Write half of the WebSocket.
///
/// Shared by the task loop (protocol frames, close) and the keep alive loop
/// (pings). Protocol frames are only ever written by the task loop, so their
/// order on the wire is the task queue order.
struct Connection {
    writer: tokio::sync::Mutex<Writer>,
}

impl Connection {
    fn new(writer: Writer) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), Error> {
        self.writer
            .lock()
            .await
            .send(WsMessage::Binary(frame))
            .await
            .map_err(|_| Error::Disconnected(None))
    }

    async fn ping(&self) -> Result<(), Error> {
        self.writer
            .lock()
            .await
            .send(WsMessage::Ping(Vec::new()))
            .await
            .map_err(|_| Error::Disconnected(None))
    }

    /// Close the connection. No close reason is sent, only the code.
    async fn close(&self, code: CloseCode) {
        let frame = CloseFrame {
            code: WsCloseCode::from(u16::from(code)),
            reason: "".into(),
        };

        // Sending the close frame fails if the connection is already gone,
        // which is fine either way.
        let _ = self
            .writer
            .lock()
            .await
            .send(WsMessage::Close(Some(frame)))
            .await;
    }
}

/// A connection failure paired with the close code to answer it with.
#[derive(Debug)]
struct Abort {
    code: CloseCode,
    reason: Error,
}

impl From<Error> for Abort {
    fn from(reason: Error) -> Self {
        Self {
            code: close_code_for(&reason),
            reason,
        }
    }
}

fn close_code_for(error: &Error) -> CloseCode {
    match error {
        Error::Message(_) | Error::MessageFlow(_) => CloseCode::ProtocolError,
        Error::Disconnected(_) => CloseCode::Normal,
        Error::SlotsFull => CloseCode::PathFull,
        Error::PathDetached | Error::Internal(_) => CloseCode::InternalError,
    }
}

/// The upgrade request path names the initiator's public permanent key as 64
/// hex characters.
fn parse_path_key(path: &str) -> Option<PublicKey> {
    let hex = path.strip_prefix('/')?.as_bytes();
    if hex.len() != 64 {
        return None;
    }

    let mut bytes = [0u8; 32];
    for (index, chunk) in hex.chunks(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16)?;
        let low = (chunk[1] as char).to_digit(16)?;
        bytes[index] = ((high << 4) | low) as u8;
    }

    Some(PublicKey::from(bytes))
}

pub async fn launch(server: Arc<Server>, stream: TcpStream, addr: SocketAddr) {
    if let Err(error) = serve(server, stream, addr).await {
        log::warn!("websocket connection error: addr={:?}, error={}", addr, error);
    }
}

async fn serve(server: Arc<Server>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    // Take the initiator key out of the upgrade request.
    let mut initiator_key = None;
    let websocket = accept_hdr_async(stream, |request: &Request, response: Response| {
        match parse_path_key(request.uri().path()) {
            Some(key) => {
                initiator_key = Some(key);
                Ok(response)
            }
            None => {
                let mut response = ErrorResponse::new(Some("invalid signaling path".to_string()));
                *response.status_mut() = StatusCode::BAD_REQUEST;
                Err(response)
            }
        }
    })
    .await?;

    let Some(initiator_key) = initiator_key else {
        return Ok(());
    };

    let (writer, mut reader) = websocket.split();
    let connection = Arc::new(Connection::new(writer));
    let client = Arc::new(Client::new(initiator_key));
    client.set_keep_alive_interval(Duration::from_secs(server.config.signaling.ping_interval));
    client.set_keep_alive_timeout(Duration::from_secs(server.config.signaling.ping_timeout));

    // The whole handshake runs under a bounded timeout.
    let handshake_timeout = Duration::from_secs(server.config.signaling.handshake_timeout);
    let path = match timeout(
        handshake_timeout,
        handshake(&server, initiator_key, &client, &connection, &mut reader),
    )
    .await
    {
        Err(_) => {
            log::info!("handshake timed out: addr={:?}", addr);
            connection.close(CloseCode::Timeout).await;
            unwind_partial_attach(&server, initiator_key, &client);
            return Ok(());
        }
        Ok(Err(abort)) => {
            if !matches!(abort.reason, Error::Disconnected(_)) {
                log::warn!("handshake failed: addr={:?}, error={}", addr, abort.reason);
                connection.close(abort.code).await;
            }

            unwind_partial_attach(&server, initiator_key, &client);
            return Ok(());
        }
        Ok(Ok(path)) => path,
    };

    log::info!(
        "client authenticated: addr={:?}, path={}, id={}",
        addr,
        path.number(),
        client.id()
    );

    // Spawn the activity triad.
    let pong = Arc::new(Notify::new());
    let task_handle = tokio::spawn(task_loop(client.clone(), connection.clone()));
    let receive_handle = tokio::spawn(receive_loop(
        client.clone(),
        path.clone(),
        reader,
        pong.clone(),
    ));
    let keep_alive_handle = tokio::spawn(keep_alive_loop(
        client.clone(),
        connection.clone(),
        pong.clone(),
    ));

    if let Err(error) = client.tasks().set(
        task_handle.abort_handle(),
        Some(receive_handle.abort_handle()),
        Some(keep_alive_handle.abort_handle()),
    ) {
        log::warn!("{}", error);
    }

    // The receive loop ends on transport loss, a protocol violation or a
    // drop. Let the task loop drain the remaining writes, then cancel
    // whatever is left.
    let _ = receive_handle.await;
    client.tasks().cancel_all_but_task_loop();
    client.close_task_queue();
    let _ = task_handle.await;
    client.cancel_task_queue();
    client.join_task_queue().await;
    let _ = keep_alive_handle.await;

    // Unregister from the path and let the surviving side know, unless the
    // client was dropped on purpose.
    let was_dropped = client.state() == ClientState::Dropped;
    let removed = path.remove_client(&client);
    if removed && !was_dropped {
        notify_disconnected(&client, &path);
    }

    server.registry.drop_if_empty(&path);
    connection.close(CloseCode::Normal).await;

    log::info!("client disconnected: addr={:?}", addr);
    Ok(())
}

/// Take a client that failed between path attach and handshake completion
/// off its path again.
fn unwind_partial_attach(server: &Arc<Server>, initiator_key: PublicKey, client: &Arc<Client>) {
    if client.state() == ClientState::Restricted {
        return;
    }

    let path = server.registry.get_or_create(initiator_key);
    path.remove_client(client);
    server.registry.drop_if_empty(&path);
}

/// Run the protocol handshake: `server-hello`, `client-hello` (responders
/// only), `client-auth`, `server-auth`, then attach the client to its path
/// and notify the peers.
async fn handshake(
    server: &Arc<Server>,
    initiator_key: PublicKey,
    client: &Arc<Client>,
    connection: &Arc<Connection>,
    reader: &mut Reader,
) -> Result<Arc<Path>, Abort> {
    // server-hello, unencrypted, with the fresh session public key.
    let session_key = client.server_session_key();
    let frame = client.pack(
        &Message::ServerHello {
            key: ByteBuf::from(session_key.as_bytes().to_vec()),
        },
        false,
    )?;
    connection.send(frame).await?;

    // Responders introduce themselves with an unencrypted client-hello
    // carrying their session public key; initiators are already known by
    // their permanent key and start encrypted right away.
    let (nonce, payload) = recv_frame(client, reader, None).await?;
    if !nonce.destination.is_server() {
        return Err(Error::Message("handshake message not addressed to the server".to_string()).into());
    }

    let auth = match Message::decode(&payload) {
        Ok(Message::ClientHello { key }) => {
            client.set_role(AddressType::Responder);
            let key = PublicKey::try_from(&key[..])
                .map_err(|_| Error::Message("invalid client session key".to_string()))?;
            client.set_client_key(key);
            client.increment_csn_in()?;

            let (nonce, payload) = recv_frame(client, reader, None).await?;
            if !nonce.destination.is_server() {
                return Err(
                    Error::Message("handshake message not addressed to the server".to_string())
                        .into(),
                );
            }

            let plain = client.unseal(&nonce, &payload)?;
            Message::decode(&plain)
                .map_err(|_| Error::Message("invalid client-auth message".to_string()))?
        }
        _ => {
            client.set_role(AddressType::Initiator);
            let plain = client.unseal(&nonce, &payload)?;
            Message::decode(&plain)
                .map_err(|_| Error::Message("invalid client-auth message".to_string()))?
        }
    };

    let Message::ClientAuth {
        your_cookie,
        your_key,
        subprotocols: _,
        ping_interval,
    } = auth
    else {
        return Err(Error::Message("expected client-auth".to_string()).into());
    };

    // The client has to repeat the cookie we used for server-hello.
    if your_cookie[..] != client.cookie_out().as_bytes()[..] {
        return Err(Error::Message("client did not repeat the server cookie".to_string()).into());
    }

    // The client may select one of the advertised permanent keys.
    let permanent_key = match your_key {
        Some(key) => {
            let key = PublicKey::try_from(&key[..])
                .map_err(|_| Error::Message("invalid server key selection".to_string()))?;

            server
                .keys
                .iter()
                .find(|candidate| candidate.public_key() == key)
                .cloned()
                .ok_or(Abort {
                    code: CloseCode::InvalidKey,
                    reason: Error::Message("client selected an unknown server key".to_string()),
                })?
        }
        None => server.keys[0].clone(),
    };
    client.set_server_permanent_key(permanent_key);

    if let Some(interval) = ping_interval {
        client.set_keep_alive_interval(Duration::from_secs(interval as u64));
    }

    client.increment_csn_in()?;

    // Attach to the path and answer with server-auth. Attaching may race
    // the garbage collection of an emptied path, in which case a fresh path
    // is fetched and the attach retried.
    loop {
        let path = server.registry.get_or_create(initiator_key);

        match client.role() {
            Some(AddressType::Initiator) => {
                let previous = match path.set_initiator(client) {
                    Err(Error::PathDetached) => continue,
                    Err(error) => return Err(error.into()),
                    Ok(previous) => previous,
                };

                let responders = path.responder_ids();
                let sent = send_server_auth(
                    client,
                    connection,
                    Message::ServerAuth {
                        your_cookie: ByteBuf::from(client.cookie_in()?.as_bytes().to_vec()),
                        signed_keys: ByteBuf::new(),
                        initiator_connected: None,
                        responders: Some(responders.iter().map(|address| address.0).collect()),
                    },
                )
                .await;

                // The predecessor is only evicted once the newcomer's
                // handshake has completed; a path with responders must not
                // end up without any initiator over a failed takeover.
                if let Err(error) = sent {
                    if let Some(previous) = previous {
                        if !path.restore_initiator(previous.clone(), client) {
                            // An even newer initiator holds the slot now.
                            let _ = Client::drop(&previous, CloseCode::DroppedByInitiator);
                        }
                    }

                    return Err(error.into());
                }

                if let Some(previous) = previous {
                    Client::drop(&previous, CloseCode::DroppedByInitiator)?;
                }

                for responder in path.responders() {
                    notify(&responder, &Message::NewInitiator);
                }

                return Ok(path);
            }
            Some(AddressType::Responder) => {
                let address = match path.add_responder(client) {
                    Err(Error::PathDetached) => continue,
                    Err(error) => return Err(error.into()),
                    Ok(address) => address,
                };

                let initiator = path.get_initiator();
                send_server_auth(
                    client,
                    connection,
                    Message::ServerAuth {
                        your_cookie: ByteBuf::from(client.cookie_in()?.as_bytes().to_vec()),
                        signed_keys: ByteBuf::new(),
                        initiator_connected: Some(initiator.is_some()),
                        responders: None,
                    },
                )
                .await?;

                if let Some(initiator) = initiator {
                    notify(&initiator, &Message::NewResponder { id: address.0 });
                }

                return Ok(path);
            }
            _ => return Err(Error::Internal("client role not determined").into()),
        }
    }
}

/// Fill in the signed keys and send the `server-auth` reply. The signature
/// commits to this very message's nonce, so the nonce has to be drawn before
/// the message can be completed.
async fn send_server_auth(
    client: &Arc<Client>,
    connection: &Arc<Connection>,
    mut message: Message,
) -> Result<(), Error> {
    let nonce = client.next_nonce()?;

    if let Message::ServerAuth { signed_keys, .. } = &mut message {
        *signed_keys = ByteBuf::from(client.signed_keys(&nonce)?);
    }

    let frame = client.pack_with_nonce(&nonce, &message, true)?;
    connection.send(frame).await
}

/// Pack a server message for a peer and put it on the peer's task queue.
/// Peers that cannot take the message any more are skipped.
fn notify(peer: &Arc<Client>, message: &Message) {
    match peer.pack(message, true) {
        Ok(frame) => {
            let _ = peer.enqueue_task(Task::Send(frame), false);
        }
        Err(error) => {
            log::warn!("failed to pack {} for peer: {}", message.kind(), error);
        }
    }
}

/// Tell the surviving side of the path that this client is gone.
fn notify_disconnected(client: &Arc<Client>, path: &Arc<Path>) {
    match client.role() {
        Some(AddressType::Initiator) => {
            for responder in path.responders() {
                notify(
                    &responder,
                    &Message::Disconnected {
                        id: Address::INITIATOR.0,
                    },
                );
            }
        }
        Some(AddressType::Responder) => {
            if let Some(initiator) = path.get_initiator() {
                notify(
                    &initiator,
                    &Message::Disconnected {
                        id: client.id().0,
                    },
                );
            }
        }
        _ => {}
    }
}

/// Read the next binary frame and validate its nonce against the sender's
/// connection state: the source must be the sender's assigned address and
/// cookie and sequence number must follow their per-connection discipline.
async fn recv_frame(
    client: &Arc<Client>,
    reader: &mut Reader,
    pong: Option<&Notify>,
) -> Result<(Nonce, Vec<u8>), Error> {
    loop {
        let message = match reader.next().await {
            Some(Ok(message)) => message,
            Some(Err(_)) | None => {
                log::debug!("connection closed while receiving");
                client.close_task_queue();
                return Err(Error::Disconnected(None));
            }
        };

        match message {
            WsMessage::Binary(data) => {
                let frame = Frame::decode(&data)
                    .map_err(|_| Error::Message("invalid frame".to_string()))?;

                if frame.nonce.source != client.id() {
                    return Err(Error::Message(format!(
                        "invalid source address {}",
                        frame.nonce.source
                    )));
                }

                client.validate_cookie_in(frame.nonce.cookie)?;
                client.validate_csn_in(frame.nonce.combined_sequence)?;

                return Ok((frame.nonce, frame.payload.to_vec()));
            }
            WsMessage::Text(_) => {
                return Err(Error::Message("data must be bytes".to_string()));
            }
            WsMessage::Close(frame) => {
                client.close_task_queue();
                return Err(Error::Disconnected(frame.map(|frame| frame.code.into())));
            }
            WsMessage::Pong(_) => {
                if let Some(pong) = pong {
                    pong.notify_one();
                }
            }
            // Pings are answered by the protocol layer, raw frames never
            // surface on read.
            WsMessage::Ping(_) | WsMessage::Frame(_) => {}
        }
    }
}

/// Consume a validated frame: control messages addressed to the server are
/// handled here, everything else is relayed opaquely to the addressed peer.
fn process_frame(
    client: &Arc<Client>,
    path: &Arc<Path>,
    nonce: Nonce,
    payload: Vec<u8>,
) -> Result<(), Error> {
    if nonce.destination.is_server() {
        let plain = client.unseal(&nonce, &payload)?;
        let message = Message::decode(&plain)
            .map_err(|_| Error::Message("invalid message".to_string()))?;

        log::debug!("client {} >> {}", client.id(), message.kind());

        return match message {
            Message::DropResponder { id, reason } => {
                if client.role() != Some(AddressType::Initiator) {
                    return Err(Error::MessageFlow("only the initiator may drop a responder"));
                }

                let code = match reason {
                    Some(value) => CloseCode::try_from(value)
                        .map_err(|_| Error::Message("invalid drop reason".to_string()))?,
                    None => CloseCode::DroppedByInitiator,
                };

                let responder = path
                    .get_responder(Address(id))
                    .ok_or(Error::MessageFlow("drop of an unknown responder"))?;

                Client::drop(&responder, code)
            }
            _ => Err(Error::Message(format!(
                "unexpected message: {}",
                message.kind()
            ))),
        };
    }

    // Relay admission: only authenticated clients may relay, and only to the
    // opposite peer role.
    let kind = nonce
        .destination
        .kind()
        .ok_or_else(|| Error::Message("invalid destination address".to_string()))?;

    if !client.p2p_allowed(kind) {
        return Err(Error::MessageFlow("relay to this destination is not allowed"));
    }

    let destination = match kind {
        AddressType::Initiator => path.get_initiator(),
        AddressType::Responder => path.get_responder(nonce.destination),
        AddressType::Server => None,
    }
    .ok_or(Error::MessageFlow("destination is not connected"))?;

    let (done, outcome) = oneshot::channel();
    let frame = Frame::encode(&nonce, &payload);
    if destination.enqueue_task(Task::Relay(frame, done), false).is_err() {
        return Err(Error::MessageFlow("destination is not connected"));
    }

    // Delivery is best-effort: if the destination goes away before the
    // frame was written, the sender gets a send-error.
    let sender = client.clone();
    let id = nonce.short_id();
    tokio::spawn(async move {
        if outcome.await.is_err() {
            send_error(&sender, id);
        }
    });

    Ok(())
}

/// Report a failed relay back to its sender. The frame is referenced by the
/// first 8 bytes of its nonce.
fn send_error(client: &Arc<Client>, id: [u8; 8]) {
    log::debug!("relay towards {} failed, sending send-error", client.id());

    match client.pack(
        &Message::SendError {
            id: ByteBuf::from(id.to_vec()),
        },
        true,
    ) {
        Ok(frame) => {
            let _ = client.enqueue_task(Task::Send(frame), false);
        }
        Err(error) => {
            log::warn!("failed to pack send-error: {}", error);
        }
    }
}

/// Drop a client over a protocol violation.
fn protocol_violation(client: &Arc<Client>, error: Error) {
    log::warn!("client {} violation: {}", client.id(), error);

    if let Err(error) = Client::drop(&client, close_code_for(&error)) {
        log::warn!("{}", error);
    }
}

/// Read, validate and dispatch inbound frames one at a time.
async fn receive_loop(
    client: Arc<Client>,
    path: Arc<Path>,
    mut reader: Reader,
    pong: Arc<Notify>,
) {
    loop {
        let (nonce, payload) = match recv_frame(&client, &mut reader, Some(&pong)).await {
            Ok(frame) => frame,
            Err(Error::Disconnected(code)) => {
                log::debug!("client {} disconnected: code={:?}", client.id(), code);
                return;
            }
            Err(error) => {
                protocol_violation(&client, error);
                return;
            }
        };

        match process_frame(&client, &path, nonce, payload) {
            Ok(()) => {}
            Err(Error::MessageFlow(reason)) => {
                // Dynamic relay failures are answered, not punished.
                log::debug!("client {} relay refused: {}", client.id(), reason);
                send_error(&client, nonce.short_id());
            }
            Err(error) => {
                protocol_violation(&client, error);
                return;
            }
        }

        // The frame is fully processed, advance the expected sequence
        // number.
        if let Err(error) = client.increment_csn_in() {
            protocol_violation(&client, error);
            return;
        }
    }
}

/// Drain the task queue. All outbound protocol frames of a client flow
/// through here, including the delayed close of a drop.
async fn task_loop(client: Arc<Client>, connection: Arc<Connection>) {
    while let Some(task) = client.dequeue_task().await {
        let result = match task {
            Task::Send(frame) => connection.send(frame).await,
            Task::Relay(frame, done) => match connection.send(frame).await {
                Ok(()) => {
                    let _ = done.send(());
                    Ok(())
                }
                Err(error) => {
                    drop(done);
                    Err(error)
                }
            },
            Task::Close(code) => {
                connection.close(code).await;
                Ok(())
            }
        };

        if let Err(error) = client.task_done() {
            log::warn!("{}", error);
            return;
        }

        if result.is_err() {
            // Transport gone; freeze the queue and let the teardown cancel
            // what is left.
            log::debug!("connection closed while sending");
            client.close_task_queue();
            return;
        }
    }
}

/// Ping the client periodically and drop it when a pong stays out.
async fn keep_alive_loop(client: Arc<Client>, connection: Arc<Connection>, pong: Arc<Notify>) {
    loop {
        tokio::time::sleep(client.keep_alive_interval()).await;

        log::debug!("pinging client {}", client.id());
        if connection.ping().await.is_err() {
            log::debug!("connection closed while pinging");
            client.close_task_queue();
            return;
        }

        match timeout(client.keep_alive_timeout(), pong.notified()).await {
            Ok(()) => {
                client.record_keep_alive_ping();
            }
            Err(_) => {
                log::info!("client {} missed the pong, dropping", client.id());
                if let Err(error) = Client::drop(&client, CloseCode::Timeout) {
                    log::warn!("{}", error);
                }

                return;
            }
        }
    }
}
