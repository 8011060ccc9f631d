use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::net::isaac::IsaacCipher;
use crate::net::login::{
    build_handshake_response, build_login_success, check_revision, handle_service_handshake,
    parse_login_block, RevisionCheck, LOGIN_RESPONSE_ALREADY_ONLINE, LOGIN_RESPONSE_INVALID,
    LOGIN_RESPONSE_OUTDATED, LOGIN_RESPONSE_WORLD_FULL, REVISION_CHECK_OPCODE, REVISION_OK,
    REVISION_OUTDATED, SERVICE_HANDSHAKE_OPCODE,
};
use crate::net::packet::PacketReader;
use crate::net::session::{
    decode_payload, encode_frame, inbound_payload_len, LogicCommand, OutboundFrame, PayloadLen,
    ProtocolError, SessionHandle, SessionStage,
};
use crate::telemetry::logging;
use crate::world::state::WorldState;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_POLL: Duration = Duration::from_millis(250);
const WRITER_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    Shutdown,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerSignal {
    Running = 0,
    Shutdown = 1,
    Restart = 2,
}

#[derive(Debug, Default)]
pub struct ServerControl {
    signal: AtomicU8,
}

impl ServerControl {
    pub fn new() -> Self {
        Self {
            signal: AtomicU8::new(ServerSignal::Running as u8),
        }
    }

    pub fn request_shutdown(&self) {
        self.signal
            .store(ServerSignal::Shutdown as u8, Ordering::SeqCst);
    }

    pub fn request_restart(&self) {
        self.signal
            .store(ServerSignal::Restart as u8, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        matches!(self.current_signal(), ServerSignal::Running)
    }

    pub fn exit_reason(&self) -> ServerExit {
        match self.current_signal() {
            ServerSignal::Restart => ServerExit::Restart,
            _ => ServerExit::Shutdown,
        }
    }

    fn current_signal(&self) -> ServerSignal {
        match self.signal.load(Ordering::SeqCst) {
            2 => ServerSignal::Restart,
            1 => ServerSignal::Shutdown,
            _ => ServerSignal::Running,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GameServerConfig {
    pub bind_addr: String,
}

/// Bind and serve until shutdown or restart is requested.
pub fn run_game_server(
    config: GameServerConfig,
    world: Arc<Mutex<WorldState>>,
    control: Arc<ServerControl>,
) -> Result<ServerExit, String> {
    let listener = TcpListener::bind(&config.bind_addr)
        .map_err(|err| format!("bind {} failed: {}", config.bind_addr, err))?;
    logging::log_game(&format!("game server listening on {}", config.bind_addr));
    serve(listener, world, control)
}

/// Accept loop plus the tick thread. Split from the bind so tests can pass
/// a pre-bound listener.
pub fn serve(
    listener: TcpListener,
    world: Arc<Mutex<WorldState>>,
    control: Arc<ServerControl>,
) -> Result<ServerExit, String> {
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("listener nonblocking failed: {}", err))?;
    let tick_handle = spawn_tick_loop(Arc::clone(&world), Arc::clone(&control));

    while control.is_running() {
        match listener.accept() {
            Ok((stream, addr)) => {
                logging::log_netload(&format!("connection from {}", addr));
                let world = Arc::clone(&world);
                let control = Arc::clone(&control);
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, world, control) {
                        logging::log_netload(&format!("session from {} closed: {}", addr, err));
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => return Err(format!("accept failed: {}", err)),
        }
    }

    if tick_handle.join().is_err() {
        logging::log_error("tick thread panicked");
    }
    Ok(control.exit_reason())
}

/// The single thread that owns all world mutation. Network threads only
/// ever enqueue commands for it.
fn spawn_tick_loop(
    world: Arc<Mutex<WorldState>>,
    control: Arc<ServerControl>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let tick_length = world
            .lock()
            .map(|world| world.clock.tick_length())
            .unwrap_or_else(|_| Duration::from_millis(600));
        let mut next_tick = Instant::now() + tick_length;
        while control.is_running() {
            let now = Instant::now();
            if now < next_tick {
                thread::sleep((next_tick - now).min(ACCEPT_POLL));
                continue;
            }
            match world.lock() {
                Ok(mut world) => {
                    let started = Instant::now();
                    world.tick();
                    if started.elapsed() > tick_length {
                        logging::log_error(&format!(
                            "tick overran the tick length: {:?}",
                            started.elapsed()
                        ));
                    }
                }
                Err(_) => {
                    logging::log_error("world lock poisoned, stopping tick thread");
                    control.request_shutdown();
                    return;
                }
            }
            next_tick += tick_length;
            if next_tick < Instant::now() {
                // Fell behind; drop the missed cadence rather than bursting.
                next_tick = Instant::now() + tick_length;
            }
        }
    })
}

/// Read `len` bytes, polling so shutdown and session teardown are observed.
fn read_exact_polled(
    stream: &mut TcpStream,
    len: usize,
    control: &ServerControl,
    closed: Option<&AtomicBool>,
) -> Result<Vec<u8>, String> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        if !control.is_running() {
            return Err("server stopping".to_string());
        }
        if closed.map(|flag| flag.load(Ordering::SeqCst)).unwrap_or(false) {
            return Err("session closed".to_string());
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err("peer disconnected".to_string()),
            Ok(read) => filled += read,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(format!("read failed: {}", err)),
        }
    }
    Ok(buf)
}

fn write_all(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), String> {
    stream
        .write_all(bytes)
        .and_then(|_| stream.flush())
        .map_err(|err| format!("write failed: {}", err))
}

fn spawn_writer(
    mut stream: TcpStream,
    receiver: Receiver<OutboundFrame>,
    seed: [u32; 4],
    closed: Arc<AtomicBool>,
    control: Arc<ServerControl>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut cipher = IsaacCipher::new(&IsaacCipher::outbound_seed(&seed));
        loop {
            match receiver.recv_timeout(WRITER_POLL) {
                Ok(frame) => {
                    let encoded = match encode_frame(&frame, Some(&mut cipher)) {
                        Ok(encoded) => encoded,
                        Err(err) => {
                            logging::log_error(&format!("frame encode failed: {}", err));
                            continue;
                        }
                    };
                    if write_all(&mut stream, &encoded).is_err() {
                        break;
                    }
                }
                // Drained; only now is teardown honoured, so frames queued
                // before a close still reach the wire.
                Err(RecvTimeoutError::Timeout) => {
                    if !control.is_running() || closed.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        closed.store(true, Ordering::SeqCst);
        let _ = stream.shutdown(std::net::Shutdown::Both);
    })
}

/// Per-connection byte-stream state machine:
/// Handshake -> Authenticating -> Streaming -> Closed.
fn handle_connection(
    mut stream: TcpStream,
    world: Arc<Mutex<WorldState>>,
    control: Arc<ServerControl>,
) -> Result<(), String> {
    stream
        .set_nonblocking(false)
        .map_err(|err| format!("socket mode failed: {}", err))?;
    stream
        .set_read_timeout(Some(READ_POLL))
        .map_err(|err| format!("socket timeout failed: {}", err))?;
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let expected_revision = world
        .lock()
        .map_err(|_| "world lock poisoned".to_string())?
        .config
        .client_revision;

    // Handshake stage: raw opcodes, no cipher yet.
    loop {
        let opcode = read_exact_polled(&mut stream, 1, &control, None)?[0];
        match opcode {
            SERVICE_HANDSHAKE_OPCODE => {
                handle_service_handshake(0).map_err(|err| err.to_string())?;
                let server_seed = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                write_all(&mut stream, &build_handshake_response(server_seed))?;
                logging::log_netload(&format!(
                    "{} -> {:?}",
                    peer,
                    SessionStage::Authenticating
                ));
                break;
            }
            REVISION_CHECK_OPCODE => {
                let payload = read_exact_polled(&mut stream, 4, &control, None)?;
                match check_revision(&payload, expected_revision)
                    .map_err(|err| err.to_string())?
                {
                    RevisionCheck::Accepted => {
                        write_all(&mut stream, &[REVISION_OK])?;
                    }
                    RevisionCheck::Rejected { client } => {
                        write_all(&mut stream, &[REVISION_OUTDATED])?;
                        return Err(format!(
                            "rejected outdated client revision {} (expected {})",
                            client, expected_revision
                        ));
                    }
                }
            }
            other => {
                return Err(ProtocolError::UnknownOpcode(other).to_string());
            }
        }
    }

    // Authenticating stage: one length-framed login block.
    let header = read_exact_polled(&mut stream, 2, &control, None)?;
    let block_len = {
        let mut reader = PacketReader::new(&header);
        reader
            .read_u16()
            .ok_or_else(|| "login header truncated".to_string())? as usize
    };
    let block = read_exact_polled(&mut stream, block_len, &control, None)?;
    let request = parse_login_block(&block).map_err(|err| err.to_string())?;
    if request.revision != expected_revision {
        write_all(&mut stream, &[LOGIN_RESPONSE_OUTDATED])?;
        return Err(ProtocolError::RevisionMismatch {
            client: request.revision,
            server: expected_revision,
        }
        .to_string());
    }
    if request.username.trim().is_empty() {
        write_all(&mut stream, &[LOGIN_RESPONSE_INVALID])?;
        return Err("empty username".to_string());
    }

    let (handle, receiver) = SessionHandle::channel();
    let (entity_id, rights) = {
        let mut world = world.lock().map_err(|_| "world lock poisoned".to_string())?;
        if world.player_count() >= world.config.max_players {
            drop(world);
            write_all(&mut stream, &[LOGIN_RESPONSE_WORLD_FULL])?;
            return Err("world full".to_string());
        }
        if world.player_by_name(&request.username).is_some() {
            drop(world);
            write_all(&mut stream, &[LOGIN_RESPONSE_ALREADY_ONLINE])?;
            return Err(format!("{} is already online", request.username));
        }
        let id = world.register_player(request.username.clone(), Some(handle.clone()));
        let rights = world
            .entity(id)
            .and_then(|entity| entity.as_player())
            .map(|player| player.rights)
            .unwrap_or(0);
        (id, rights)
    };
    write_all(&mut stream, &build_login_success(rights, entity_id.0))?;
    logging::log_netload(&format!(
        "{} -> {:?} as {} (entity {})",
        peer,
        SessionStage::Streaming,
        request.username,
        entity_id.0
    ));

    let closed = handle.closed_flag();
    let commands = handle.command_queue();
    let writer_stream = stream
        .try_clone()
        .map_err(|err| format!("socket clone failed: {}", err))?;
    let writer = spawn_writer(
        writer_stream,
        receiver,
        request.seed,
        Arc::clone(&closed),
        Arc::clone(&control),
    );

    // Streaming stage: ciphered opcode, table-driven payload, enqueue.
    let mut inbound = IsaacCipher::new(&request.seed);
    let result = loop {
        let raw = match read_exact_polled(&mut stream, 1, &control, Some(closed.as_ref())) {
            Ok(bytes) => bytes[0],
            Err(err) => break Err(err),
        };
        let opcode = inbound.decode_opcode(raw);
        let payload_len = match inbound_payload_len(opcode) {
            Some(PayloadLen::Fixed(len)) => len,
            Some(PayloadLen::VariableByte) => {
                match read_exact_polled(&mut stream, 1, &control, Some(closed.as_ref())) {
                    Ok(bytes) => bytes[0] as usize,
                    Err(err) => break Err(err),
                }
            }
            None => break Err(ProtocolError::UnknownOpcode(opcode).to_string()),
        };
        let payload = match read_exact_polled(&mut stream, payload_len, &control, Some(closed.as_ref())) {
            Ok(bytes) => bytes,
            Err(err) => break Err(err),
        };
        match decode_payload(opcode, &payload) {
            Ok(command) => {
                let was_logout = command == LogicCommand::Logout;
                commands.push(command);
                if was_logout {
                    break Ok(());
                }
            }
            Err(err) => break Err(err.to_string()),
        }
    };

    // Teardown. A clean logout leaves the closed flag to the tick thread,
    // which flips it after acknowledging; a dropped connection queues the
    // logout itself so the entity is still unregistered.
    if result.is_err() {
        commands.push(LogicCommand::Logout);
        closed.store(true, Ordering::SeqCst);
    }
    let _ = writer.join();
    logging::log_netload(&format!("{} -> {:?}", peer, SessionStage::Closed));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::net::encoders::OPCODE_LOGOUT;
    use crate::net::login::build_login_block;
    use crate::net::login::LoginRequest;
    use crate::net::packet::PacketWriter;
    use crate::net::session::OPCODE_LOGOUT as INBOUND_LOGOUT;

    fn test_world() -> Arc<Mutex<WorldState>> {
        let config = WorldConfig {
            tick_millis: 25,
            ..WorldConfig::default()
        };
        Arc::new(Mutex::new(WorldState::new(config)))
    }

    fn start_server() -> (std::net::SocketAddr, Arc<Mutex<WorldState>>, Arc<ServerControl>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let world = test_world();
        let control = Arc::new(ServerControl::new());
        let serve_world = Arc::clone(&world);
        let serve_control = Arc::clone(&control);
        thread::spawn(move || {
            let _ = serve(listener, serve_world, serve_control);
        });
        (addr, world, control)
    }

    fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).expect("read");
        buf
    }

    #[test]
    fn revision_mismatch_closes_the_connection() {
        let (addr, _world, control) = start_server();
        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");

        let mut writer = PacketWriter::new();
        writer.write_u8(REVISION_CHECK_OPCODE);
        writer.write_u32(100);
        client.write_all(writer.as_slice()).expect("send");

        let response = read_n(&mut client, 1);
        assert_eq!(response[0], REVISION_OUTDATED);

        // No further decoding: the stream is closed.
        let mut probe = [0u8; 1];
        let outcome = client.read(&mut probe).expect("probe");
        assert_eq!(outcome, 0);

        control.request_shutdown();
    }

    #[test]
    fn matching_revision_is_acknowledged() {
        let (addr, _world, control) = start_server();
        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");

        let mut writer = PacketWriter::new();
        writer.write_u8(REVISION_CHECK_OPCODE);
        writer.write_u32(WorldConfig::default().client_revision);
        client.write_all(writer.as_slice()).expect("send");
        assert_eq!(read_n(&mut client, 1)[0], REVISION_OK);

        control.request_shutdown();
    }

    #[test]
    fn login_streams_and_logout_round_trip() {
        let (addr, world, control) = start_server();
        let mut client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");

        // Handshake.
        client.write_all(&[SERVICE_HANDSHAKE_OPCODE]).expect("send");
        let handshake = read_n(&mut client, 9);
        assert_eq!(handshake[0], 0);

        // Login block.
        let request = LoginRequest {
            revision: WorldConfig::default().client_revision,
            seed: [7, 11, 13, 17],
            username: "ada".to_string(),
            password: "hunter2".to_string(),
        };
        let block = build_login_block(&request);
        let mut framed = PacketWriter::new();
        framed.write_u16(block.len() as u16);
        framed.write_bytes(&block);
        client.write_all(framed.as_slice()).expect("send");

        let success = read_n(&mut client, 6);
        assert_eq!(success[0], crate::net::login::LOGIN_RESPONSE_OK);
        let entity_id = u32::from_be_bytes([success[2], success[3], success[4], success[5]]);
        assert!(entity_id > 0);
        // The world registered the player.
        for _ in 0..50 {
            if world.lock().expect("world").player_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(world.lock().expect("world").player_count(), 1);

        // Ciphered logout command.
        let mut client_out = IsaacCipher::new(&request.seed);
        client
            .write_all(&[client_out.encode_opcode(INBOUND_LOGOUT)])
            .expect("send");

        // Scan outbound frames until the logout acknowledgement arrives.
        let mut client_in = IsaacCipher::new(&IsaacCipher::outbound_seed(&request.seed));
        let mut saw_logout = false;
        for _ in 0..64 {
            let mut opcode_byte = [0u8; 1];
            match client.read(&mut opcode_byte) {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            }
            let opcode = client_in.decode_opcode(opcode_byte[0]);
            let payload_len = match opcode {
                OPCODE_LOGOUT => {
                    saw_logout = true;
                    break;
                }
                crate::net::encoders::OPCODE_SCENE_RELOAD => 5,
                crate::net::encoders::OPCODE_ENTITY_REMOVED => 4,
                crate::net::encoders::OPCODE_ENTITY_MOVED => 10,
                crate::net::encoders::OPCODE_HIT_SPLAT => 8,
                crate::net::encoders::OPCODE_ENTITY_ADDED
                | crate::net::encoders::OPCODE_GAME_MESSAGE => {
                    read_n(&mut client, 1)[0] as usize
                }
                other => panic!("unexpected outbound opcode {}", other),
            };
            let _ = read_n(&mut client, payload_len);
        }
        assert!(saw_logout);

        // The tick thread unregistered the entity.
        for _ in 0..50 {
            if world.lock().expect("world").player_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(world.lock().expect("world").player_count(), 0);

        control.request_shutdown();
    }
}
