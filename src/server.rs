// src/server.rs - Server assembly
//
// Three moving parts, same split as the reactor pattern this grew from:
// - an accept thread feeding new connections over a bounded channel (full
//   channel = at capacity, the connection is rejected immediately)
// - the socket engine doing all byte IO and handing decoded events inward
// - one server thread owning the stream directory, every FlashStream and
//   the publish action queue; nothing else touches them
//
// The server handle is a typestate: Initialization -> Running -> Ended.

use crate::error::NetError;
use crate::flash::{FlashStream, FlashWriter, TcpFlashWriter};
use crate::media::{Action, PeerInfo, Publish, RecorderFactory, StreamHub};
use crate::net::{ShutdownKind, Socket, SocketAddress, SocketEngine, SocketOwner, Token};
use crate::rendezvous::RendezVous;
use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashSet;
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const STATUS_INIT: usize = 0;
const STATUS_RUN: usize = 1;
const STATUS_END: usize = 2;

const ACCEPT_RETRY_MS: u64 = 100;
const TICK_MS: u64 = 100;
const CONNECTION_TIMEOUT_SECS: u64 = 60;
const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 5;
const MAX_READ_PER_DISPATCH: usize = 512 * 1024;
const READ_BUFFER_SIZE: usize = 8192;
/// Extra bounded-channel capacity to absorb connection bursts.
const CHANNEL_HEADROOM: usize = 256;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

#[derive(Clone)]
pub struct Initialization;
#[derive(Clone)]
pub struct Running;
#[derive(Clone)]
pub struct Ended;

enum ServerEvent {
    Data { id: usize, data: Bytes },
    Closed { id: usize },
    Error { id: usize, error: NetError },
}

/// Reads connection bytes on an engine worker and forwards them inward.
struct ConnectionOwner {
    id: usize,
    events: crossbeam_channel::Sender<ServerEvent>,
}

impl SocketOwner for ConnectionOwner {
    fn on_readable(&self, socket: &Arc<Socket>) {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        let mut total = 0usize;
        loop {
            if total >= MAX_READ_PER_DISPATCH {
                return; // keep the worker fair, the edge stays pending
            }
            match socket.receive(&mut buffer, 0, None) {
                Ok(0) => {
                    let _ = self.events.send(ServerEvent::Closed { id: self.id });
                    return;
                }
                Ok(read) => {
                    total += read;
                    let _ = self.events.send(ServerEvent::Data {
                        id: self.id,
                        data: Bytes::copy_from_slice(&buffer[..read]),
                    });
                }
                Err(NetError::WouldBlock) => return,
                Err(error) => {
                    let _ = self.events.send(ServerEvent::Error { id: self.id, error });
                    return;
                }
            }
        }
    }

    fn on_error(&self, _socket: &Arc<Socket>, error: NetError) {
        let _ = self.events.send(ServerEvent::Error { id: self.id, error });
    }

    fn on_close(&self, _socket: &Arc<Socket>) {
        let _ = self.events.send(ServerEvent::Closed { id: self.id });
    }
}

/// One client connection as the server thread sees it.
struct Session {
    socket: Arc<Socket>,
    token: Token,
    peer: PeerInfo,
    buffer: BytesMut,
    streams: HashMap<u16, (FlashStream, Rc<RefCell<dyn FlashWriter>>)>,
}

impl Session {
    fn new(socket: Arc<Socket>, token: Token) -> Session {
        let peer = PeerInfo {
            address: socket.peer_address().unwrap_or(SocketAddress::wildcard()),
            ping: 0,
        };
        Session {
            socket,
            token,
            peer,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            streams: HashMap::new(),
        }
    }

    /// Parse buffered frames and dispatch them; false closes the connection.
    /// Framing mirrors the writer side: [stream u16][type u8][time u32]
    /// [length u32][body].
    fn dispatch(&mut self, hub: &mut StreamHub) -> bool {
        loop {
            if self.buffer.len() < 11 {
                return true;
            }
            let length = u32::from_be_bytes([
                self.buffer[7],
                self.buffer[8],
                self.buffer[9],
                self.buffer[10],
            ]) as usize;
            if self.buffer.len() < 11 + length {
                return true;
            }
            let stream_id = u16::from_be_bytes([self.buffer[0], self.buffer[1]]);
            let ty = self.buffer[2];
            let time = u32::from_be_bytes([
                self.buffer[3],
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
            ]);
            self.buffer.advance(11);
            let payload = self.buffer.split_to(length).freeze();

            let (stream, writer) = self.streams.entry(stream_id).or_insert_with(|| {
                let writer: Rc<RefCell<dyn FlashWriter>> = Rc::new(RefCell::new(
                    TcpFlashWriter::new(self.socket.clone(), stream_id),
                ));
                (FlashStream::new(stream_id), writer)
            });
            if !stream.process(ty, time, payload, writer, hub, &self.peer) {
                return false;
            }
        }
    }

    fn flush(&mut self, hub: &mut StreamHub) {
        for (stream, writer) in self.streams.values_mut() {
            stream.flush(writer, hub, &self.peer);
        }
        if let Err(error) = self.socket.flush() {
            if !error.is_transient() {
                debug!("session flush: {error}");
            }
        }
    }

    fn idle(&self) -> bool {
        let last = self
            .socket
            .recv_time_ms()
            .max(self.socket.send_time_ms());
        crate::net::uptime_ms().saturating_sub(last) > CONNECTION_TIMEOUT_SECS * 1000
    }

    fn disengage_all(&mut self, hub: &mut StreamHub) {
        for (mut stream, _writer) in std::mem::take(&mut self.streams).into_values() {
            stream.disengage(None, hub, &self.peer);
        }
    }
}

pub struct MediaServer<S = Initialization> {
    address: String,
    bound_address: Option<SocketAddress>,
    status: Arc<AtomicUsize>,
    names: Arc<DashSet<String>>,
    actions: Option<crossbeam_channel::Sender<Action>>,
    recorder_factory: Option<RecorderFactory>,
    rendezvous: Arc<RendezVous<Bytes>>,
    workers: usize,
    max_connections: usize,
    server_thread: Option<std::thread::JoinHandle<()>>,
    state: PhantomData<S>,
}

impl<S: 'static> MediaServer<S> {
    fn into_state<T>(self) -> MediaServer<T> {
        MediaServer {
            address: self.address,
            bound_address: self.bound_address,
            status: self.status,
            names: self.names,
            actions: self.actions,
            recorder_factory: self.recorder_factory,
            rendezvous: self.rendezvous,
            workers: self.workers,
            max_connections: self.max_connections,
            server_thread: self.server_thread,
            state: PhantomData,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_END
    }

    /// The P2P introduction directory served alongside the streams.
    pub fn rendezvous(&self) -> Arc<RendezVous<Bytes>> {
        self.rendezvous.clone()
    }
}

impl MediaServer<Initialization> {
    pub fn new(address: impl Into<String>) -> MediaServer<Initialization> {
        MediaServer {
            address: address.into(),
            bound_address: None,
            status: Arc::new(AtomicUsize::new(STATUS_INIT)),
            names: Arc::new(DashSet::new()),
            actions: None,
            recorder_factory: None,
            rendezvous: Arc::new(RendezVous::new()),
            workers: 2,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            server_thread: None,
            state: PhantomData,
        }
    }

    /// Engine worker threads handling socket IO.
    pub fn set_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn set_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Recorder builder used when a publish name requests recording.
    pub fn set_recorder_factory(mut self, factory: RecorderFactory) -> Self {
        self.recorder_factory = Some(factory);
        self
    }

    pub fn start(mut self) -> crate::error::Result<MediaServer<Running>> {
        let listener = Arc::new(Socket::new(crate::net::SocketType::Stream));
        let bind_address: SocketAddress = self
            .address
            .parse::<std::net::SocketAddr>()
            .map_err(|_| NetError::Other {
                code: 0,
                context: format!(" (bad address {})", self.address),
            })?
            .into();
        listener.bind(bind_address)?;
        listener.listen(128)?;
        listener.set_nonblocking(true)?;
        self.bound_address = listener.address();

        self.status.store(STATUS_RUN, Ordering::Release);

        let capacity = self.max_connections.saturating_add(CHANNEL_HEADROOM);
        let (connection_sender, connection_receiver) =
            crossbeam_channel::bounded::<Socket>(capacity);
        let (action_sender, action_receiver) = crossbeam_channel::unbounded::<Action>();
        self.actions = Some(action_sender.clone());

        // accept thread: blocking-ish loop, backpressure via the channel
        let status = self.status.clone();
        let accept_listener = listener.clone();
        std::thread::Builder::new()
            .name("server-accept".to_string())
            .spawn(move || loop {
                match accept_listener.accept() {
                    Ok(accepted) => match connection_sender.try_send(accepted) {
                        Ok(()) => debug!("new connection accepted"),
                        Err(crossbeam_channel::TrySendError::Full(socket)) => {
                            // at capacity, reject immediately
                            let _ = socket.shutdown(ShutdownKind::Both);
                            debug!("connection rejected: server at capacity");
                        }
                        Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                            status.store(STATUS_END, Ordering::Release);
                            return;
                        }
                    },
                    Err(NetError::WouldBlock) => {
                        if status.load(Ordering::Acquire) == STATUS_END {
                            info!("media server stopped accepting");
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(ACCEPT_RETRY_MS));
                    }
                    Err(error) => debug!("accept error: {error}"),
                }
            })
            .map_err(|e| NetError::from_io(&e, " (accept thread)".into()))?;

        // server thread: directory + sessions + action queue
        let status = self.status.clone();
        let names = self.names.clone();
        let recorder_factory = self.recorder_factory.take();
        let workers = self.workers;
        let max_connections = self.max_connections;
        let server_thread = std::thread::Builder::new()
            .name("server-worker".to_string())
            .spawn(move || {
                server_loop(
                    status,
                    names,
                    recorder_factory,
                    action_sender,
                    action_receiver,
                    connection_receiver,
                    workers,
                    max_connections,
                );
            })
            .map_err(|e| NetError::from_io(&e, " (server thread)".into()))?;
        self.server_thread = Some(server_thread);

        info!(
            "media server listening on {} (actual: {:?})",
            self.address, self.bound_address
        );
        Ok(self.into_state())
    }
}

impl MediaServer<Running> {
    /// Actual bound address (useful with port 0).
    pub fn local_address(&self) -> Option<SocketAddress> {
        self.bound_address
    }

    /// Live publication names, readable from any thread.
    pub fn names(&self) -> Arc<DashSet<String>> {
        self.names.clone()
    }

    /// Create a producer handle publishing `name` from any thread.
    pub fn publish(&self, name: impl Into<String>) -> crate::error::Result<Publish> {
        let name = name.into();
        if self.names.contains(&name) {
            return Err(NetError::Other {
                code: 0,
                context: format!(" ({name} already published)"),
            });
        }
        let sender = self.actions.as_ref().expect("running server").clone();
        Ok(Publish::open(&name, sender))
    }

    pub fn stop(self) -> MediaServer<Ended> {
        self.status.store(STATUS_END, Ordering::Release);
        let mut server = self.into_state::<Ended>();
        if let Some(thread) = server.server_thread.take() {
            let _ = thread.join();
        }
        server
    }
}

#[allow(clippy::too_many_arguments)]
fn server_loop(
    status: Arc<AtomicUsize>,
    names: Arc<DashSet<String>>,
    recorder_factory: Option<RecorderFactory>,
    action_sender: crossbeam_channel::Sender<Action>,
    action_receiver: crossbeam_channel::Receiver<Action>,
    connection_receiver: crossbeam_channel::Receiver<Socket>,
    workers: usize,
    max_connections: usize,
) {
    let engine = match SocketEngine::start(workers) {
        Ok(engine) => engine,
        Err(err) => {
            error!("failed to start socket engine: {err:?}");
            status.store(STATUS_END, Ordering::Release);
            return;
        }
    };
    let (event_sender, event_receiver) = crossbeam_channel::unbounded::<ServerEvent>();

    let mut hub = StreamHub::new();
    hub.set_action_queue(action_sender);
    if let Some(factory) = recorder_factory {
        hub.set_recorder_factory(factory);
    }
    // the server-wide names set mirrors the hub's
    let hub_names = hub.names();

    let mut sessions: slab::Slab<Session> = slab::Slab::with_capacity(256);
    let mut last_tick = Instant::now();
    info!("server thread started");

    loop {
        if status.load(Ordering::Acquire) == STATUS_END {
            break;
        }

        // new connections
        while let Ok(socket) = connection_receiver.try_recv() {
            if sessions.len() >= max_connections {
                let _ = socket.shutdown(ShutdownKind::Both);
                warn!("connection limit reached ({max_connections})");
                continue;
            }
            let socket = Arc::new(socket);
            let entry = sessions.vacant_entry();
            let id = entry.key();
            let owner = Arc::new(ConnectionOwner {
                id,
                events: event_sender.clone(),
            });
            match engine.register(socket.clone(), owner) {
                Ok(token) => {
                    entry.insert(Session::new(socket, token));
                }
                Err(err) => warn!("failed to register connection: {err}"),
            }
        }

        // queued producer actions
        while let Ok(action) = action_receiver.try_recv() {
            hub.run_action(action);
        }

        // socket events, bounded by the tick
        match event_receiver.recv_timeout(Duration::from_millis(TICK_MS)) {
            Ok(event) => {
                let mut pending = Some(event);
                while let Some(event) = pending.take() {
                    handle_event(event, &mut sessions, &mut hub, &engine);
                    pending = event_receiver.try_recv().ok();
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }

        // periodic: stream flush, eject polling, idle reaping
        if last_tick.elapsed() >= Duration::from_millis(TICK_MS) {
            last_tick = Instant::now();
            let mut idle = Vec::new();
            for (id, session) in sessions.iter_mut() {
                session.flush(&mut hub);
                if session.idle() {
                    debug!("connection {id} timed out");
                    idle.push(id);
                }
            }
            for id in idle {
                close_session(&mut sessions, id, &mut hub, &engine);
            }
            // keep the shared snapshot in sync with the directory
            names.clear();
            for name in hub_names.iter() {
                names.insert(name.key().clone());
            }
        }
    }

    // graceful shutdown: flush what we can under a deadline, then close
    let deadline = Instant::now() + Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS);
    while Instant::now() < deadline {
        let mut all_flushed = true;
        for (_, session) in sessions.iter_mut() {
            if session.socket.queueing() > 0 {
                all_flushed = false;
                let _ = session.socket.flush();
            }
        }
        if all_flushed {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    for (_, session) in sessions.iter_mut() {
        session.disengage_all(&mut hub);
        let _ = session.socket.shutdown(ShutdownKind::Both);
    }
    info!("server thread stopped");
}

fn handle_event(
    event: ServerEvent,
    sessions: &mut slab::Slab<Session>,
    hub: &mut StreamHub,
    engine: &SocketEngine,
) {
    match event {
        ServerEvent::Data { id, data } => {
            let alive = match sessions.get_mut(id) {
                Some(session) => {
                    session.buffer.extend_from_slice(&data);
                    session.dispatch(hub)
                }
                None => return, // already closed
            };
            if !alive {
                close_session(sessions, id, hub, engine);
            }
        }
        ServerEvent::Closed { id } => close_session(sessions, id, hub, engine),
        ServerEvent::Error { id, error } => {
            if !error.is_transient() {
                debug!("connection {id} error: {error}");
                close_session(sessions, id, hub, engine);
            }
        }
    }
}

fn close_session(
    sessions: &mut slab::Slab<Session>,
    id: usize,
    hub: &mut StreamHub,
    engine: &SocketEngine,
) {
    if let Some(mut session) = sessions.try_remove(id) {
        session.disengage_all(hub);
        engine.deregister(session.token);
        debug!("connection {id} closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::{AmfReader, AmfWriter, MessageType};
    use crate::flash::encode_tcp_message;
    use crate::media::{VideoFrame, VideoTag};
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn start_server() -> MediaServer<Running> {
        let _ = env_logger::builder().is_test(true).try_init();
        MediaServer::new("127.0.0.1:0").start().expect("start")
    }

    fn connect(server: &MediaServer<Running>) -> TcpStream {
        let addr = server.local_address().expect("bound").to_std();
        let client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        client
    }

    fn send_invocation(client: &mut TcpStream, stream_id: u16, name: &str, argument: &str) {
        let mut amf = AmfWriter::new();
        amf.write_string(name);
        amf.write_number(1.0);
        amf.write_null();
        amf.write_string(argument);
        let frame = encode_tcp_message(stream_id, MessageType::Invocation, 0, &amf.finish());
        client.write_all(&frame).expect("send");
    }

    /// Read one framed message: (stream, type, time, payload).
    fn read_frame(client: &mut TcpStream) -> (u16, u8, u32, Vec<u8>) {
        let mut header = [0u8; 11];
        client.read_exact(&mut header).expect("frame header");
        let stream = u16::from_be_bytes([header[0], header[1]]);
        let ty = header[2];
        let time = u32::from_be_bytes([header[3], header[4], header[5], header[6]]);
        let length = u32::from_be_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let mut payload = vec![0u8; length];
        client.read_exact(&mut payload).expect("frame payload");
        (stream, ty, time, payload)
    }

    fn read_status(client: &mut TcpStream) -> String {
        loop {
            let (_, ty, _, payload) = read_frame(client);
            if ty != MessageType::Invocation as u8 {
                continue;
            }
            let mut reader = AmfReader::new(&payload);
            assert_eq!(reader.read_string().unwrap(), "onStatus");
            reader.read_number().unwrap();
            reader.read_null();
            // code property lives inside the status object
            if let Some((code, _)) = crate::flash::status_code(&payload) {
                return code;
            }
        }
    }

    #[test]
    fn test_play_unknown_stream_over_tcp() {
        let server = start_server();
        let mut client = connect(&server);
        send_invocation(&mut client, 1, "play", "ghost");
        assert_eq!(read_status(&mut client), "NetStream.Play.StreamNotFound");
        server.stop();
    }

    #[test]
    fn test_publish_facade_to_tcp_player() {
        let server = start_server();
        let publish = server.publish("feed").expect("publish handle");

        // wait until the server thread created the publication
        let names = server.names();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !names.contains("feed") {
            assert!(Instant::now() < deadline, "publication never appeared");
            std::thread::sleep(Duration::from_millis(10));
        }

        let mut client = connect(&server);
        send_invocation(&mut client, 1, "play", "feed");
        assert_eq!(read_status(&mut client), "NetStream.Play.Reset");
        assert_eq!(read_status(&mut client), "NetStream.Play.Start");

        publish.video(
            0,
            VideoTag {
                frame: VideoFrame::Key,
                time: 40,
                ..VideoTag::default()
            },
            Bytes::from_static(b"keyframe"),
        );
        publish.flush(0);

        // skip the |RtmpSampleAccess data message, then expect the frame
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline);
            let (_, ty, time, payload) = read_frame(&mut client);
            if ty == MessageType::Video as u8 {
                assert_eq!(time, 40);
                assert_eq!(payload, b"keyframe");
                break;
            }
        }

        drop(publish);
        server.stop();
    }

    #[test]
    fn test_duplicate_publish_handle_is_rejected() {
        let server = start_server();
        let _publish = server.publish("feed").expect("first");
        let names = server.names();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !names.contains("feed") {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(server.publish("feed").is_err());
        server.stop();
    }

    #[test]
    fn test_stop_is_observable() {
        let server = start_server();
        let stopped = server.stop();
        assert!(stopped.is_stopped());
    }
}
