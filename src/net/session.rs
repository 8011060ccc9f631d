use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::net::isaac::IsaacCipher;
use crate::net::packet::{PacketReader, PacketWriter};

pub const OPCODE_KEEPALIVE: u8 = 0;
pub const OPCODE_WALK: u8 = 11;
pub const OPCODE_ATTACK: u8 = 26;
pub const OPCODE_COMMAND: u8 = 28;
pub const OPCODE_ITEM_PICKUP: u8 = 30;
pub const OPCODE_CHAT: u8 = 43;
pub const OPCODE_LOGOUT: u8 = 54;

/// Violations close the connection immediately; there is no partial
/// recovery on a corrupted stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    UnknownOpcode(u8),
    BadLength {
        opcode: u8,
        expected: usize,
        actual: usize,
    },
    RevisionMismatch {
        client: u32,
        server: u32,
    },
    Malformed(&'static str),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::UnknownOpcode(opcode) => write!(f, "unknown opcode {}", opcode),
            ProtocolError::BadLength {
                opcode,
                expected,
                actual,
            } => write!(
                f,
                "opcode {} payload length {} (expected {})",
                opcode, actual, expected
            ),
            ProtocolError::RevisionMismatch { client, server } => {
                write!(f, "client revision {} (server {})", client, server)
            }
            ProtocolError::Malformed(what) => write!(f, "malformed {}", what),
        }
    }
}

/// Connection lifecycle. Decoding rules differ per stage; `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Handshake,
    Authenticating,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLen {
    Fixed(usize),
    VariableByte,
}

/// Inbound opcode table for the streaming stage. Anything absent here is a
/// protocol violation.
pub fn inbound_payload_len(opcode: u8) -> Option<PayloadLen> {
    match opcode {
        OPCODE_KEEPALIVE => Some(PayloadLen::Fixed(0)),
        OPCODE_WALK => Some(PayloadLen::Fixed(5)),
        OPCODE_ATTACK => Some(PayloadLen::Fixed(2)),
        OPCODE_COMMAND => Some(PayloadLen::VariableByte),
        OPCODE_ITEM_PICKUP => Some(PayloadLen::Fixed(7)),
        OPCODE_CHAT => Some(PayloadLen::VariableByte),
        OPCODE_LOGOUT => Some(PayloadLen::Fixed(0)),
        _ => None,
    }
}

/// A decoded inbound message. Network threads produce these; the tick
/// pipeline is the single consumer per entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicCommand {
    KeepAlive,
    Walk { x: u16, y: u16, run: bool },
    Attack { target_index: u16 },
    PickupItem { x: u16, y: u16, item_id: u16, run: bool },
    Chat { text: String },
    Command { text: String, console: bool },
    Logout,
}

pub fn decode_payload(opcode: u8, payload: &[u8]) -> Result<LogicCommand, ProtocolError> {
    let mut reader = PacketReader::new(payload);
    let command = match opcode {
        OPCODE_KEEPALIVE => LogicCommand::KeepAlive,
        OPCODE_WALK => {
            let x = reader
                .read_u16()
                .ok_or(ProtocolError::Malformed("walk x"))?;
            let y = reader
                .read_u16()
                .ok_or(ProtocolError::Malformed("walk y"))?;
            let run = reader
                .read_u8()
                .ok_or(ProtocolError::Malformed("walk run flag"))?
                == 1;
            LogicCommand::Walk { x, y, run }
        }
        OPCODE_ATTACK => {
            let target_index = reader
                .read_u16()
                .ok_or(ProtocolError::Malformed("attack target"))?;
            LogicCommand::Attack { target_index }
        }
        OPCODE_ITEM_PICKUP => {
            let x = reader
                .read_u16_add()
                .ok_or(ProtocolError::Malformed("pickup x"))?;
            let item_id = reader
                .read_u16()
                .ok_or(ProtocolError::Malformed("pickup item"))?;
            let y = reader
                .read_u16_le_add()
                .ok_or(ProtocolError::Malformed("pickup y"))?;
            let run = reader
                .read_u8()
                .ok_or(ProtocolError::Malformed("pickup run flag"))?
                == 1;
            LogicCommand::PickupItem { x, y, item_id, run }
        }
        OPCODE_CHAT => {
            let text = reader
                .read_string()
                .ok_or(ProtocolError::Malformed("chat text"))?;
            LogicCommand::Chat { text }
        }
        OPCODE_COMMAND => {
            // Client-origin flag is decoded and discarded; only the console
            // flag changes routing.
            let _client = reader
                .read_u8()
                .ok_or(ProtocolError::Malformed("command flags"))?;
            let console = reader
                .read_u8()
                .ok_or(ProtocolError::Malformed("command flags"))?
                == 1;
            let text = reader
                .read_string()
                .ok_or(ProtocolError::Malformed("command text"))?;
            LogicCommand::Command { text, console }
        }
        OPCODE_LOGOUT => LogicCommand::Logout,
        other => return Err(ProtocolError::UnknownOpcode(other)),
    };
    if reader.remaining() != 0 {
        return Err(ProtocolError::BadLength {
            opcode,
            expected: payload.len() - reader.remaining(),
            actual: payload.len(),
        });
    }
    Ok(command)
}

/// Multi-producer/single-consumer command queue. Any number of I/O threads
/// push; only the tick pipeline drains.
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<LogicCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: LogicCommand) {
        if let Ok(mut queue) = self.inner.lock() {
            queue.push_back(command);
        }
    }

    pub fn drain(&self) -> Vec<LogicCommand> {
        match self.inner.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Fixed,
    VariableByte,
    VariableShort,
}

/// An outgoing opcode-tagged message, framed and ciphered by the writer
/// thread that owns the outbound keystream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub opcode: u8,
    pub framing: Framing,
    pub payload: Vec<u8>,
}

impl OutboundFrame {
    pub fn fixed(opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            framing: Framing::Fixed,
            payload,
        }
    }

    pub fn variable_byte(opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            framing: Framing::VariableByte,
            payload,
        }
    }

    pub fn variable_short(opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            framing: Framing::VariableShort,
            payload,
        }
    }
}

pub fn encode_frame(
    frame: &OutboundFrame,
    cipher: Option<&mut IsaacCipher>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut writer = PacketWriter::with_capacity(frame.payload.len() + 3);
    let opcode = match cipher {
        Some(cipher) => cipher.encode_opcode(frame.opcode),
        None => frame.opcode,
    };
    writer.write_u8(opcode);
    match frame.framing {
        Framing::Fixed => {}
        Framing::VariableByte => {
            if frame.payload.len() > u8::MAX as usize {
                return Err(ProtocolError::Malformed("variable-byte frame overflow"));
            }
            writer.write_u8(frame.payload.len() as u8);
        }
        Framing::VariableShort => {
            if frame.payload.len() > u16::MAX as usize {
                return Err(ProtocolError::Malformed("variable-short frame overflow"));
            }
            writer.write_u16(frame.payload.len() as u16);
        }
    }
    writer.write_bytes(&frame.payload);
    Ok(writer.into_vec())
}

/// The world-side handle onto a live connection: where deltas go out and
/// where decoded commands come in.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    outbound: Sender<OutboundFrame>,
    pub commands: Arc<CommandQueue>,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn channel() -> (Self, Receiver<OutboundFrame>) {
        let (sender, receiver) = std::sync::mpsc::channel();
        (
            Self {
                outbound: sender,
                commands: Arc::new(CommandQueue::new()),
                closed: Arc::new(AtomicBool::new(false)),
            },
            receiver,
        )
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn command_queue(&self) -> Arc<CommandQueue> {
        Arc::clone(&self.commands)
    }

    /// Queue a frame for the writer thread. A torn-down connection flips
    /// the closed flag instead of erroring.
    pub fn send(&self, frame: OutboundFrame) {
        if self.is_closed() {
            return;
        }
        if self.outbound.send(frame).is_err() {
            self.close();
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pickup_payload_roundtrip() {
        let mut writer = PacketWriter::new();
        writer.write_u16_add(3205);
        writer.write_u16(995);
        writer.write_u16_le_add(3428);
        writer.write_u8(1);
        let payload = writer.into_vec();
        assert_eq!(payload.len(), 7);

        let command = decode_payload(OPCODE_ITEM_PICKUP, &payload).expect("decode");
        assert_eq!(
            command,
            LogicCommand::PickupItem {
                x: 3205,
                y: 3428,
                item_id: 995,
                run: true,
            }
        );
    }

    #[test]
    fn unknown_opcode_is_a_violation() {
        assert_eq!(inbound_payload_len(0xfe), None);
        assert_eq!(
            decode_payload(0xfe, &[]),
            Err(ProtocolError::UnknownOpcode(0xfe))
        );
    }

    #[test]
    fn trailing_bytes_are_a_violation() {
        let mut writer = PacketWriter::new();
        writer.write_u16(10);
        writer.write_u16(20);
        writer.write_u8(0);
        writer.write_u8(0x99);
        let err = decode_payload(OPCODE_WALK, writer.as_slice()).unwrap_err();
        assert!(matches!(err, ProtocolError::BadLength { opcode, .. } if opcode == OPCODE_WALK));
    }

    #[test]
    fn short_payload_is_a_violation() {
        let err = decode_payload(OPCODE_ATTACK, &[0x01]).unwrap_err();
        assert_eq!(err, ProtocolError::Malformed("attack target"));
    }

    #[test]
    fn command_payload_parses_console_flag() {
        let mut writer = PacketWriter::new();
        writer.write_u8(0);
        writer.write_u8(1);
        writer.write_string("players");
        let command = decode_payload(OPCODE_COMMAND, writer.as_slice()).expect("decode");
        assert_eq!(
            command,
            LogicCommand::Command {
                text: "players".to_string(),
                console: true,
            }
        );
    }

    #[test]
    fn frame_encoding_per_framing_mode() {
        let fixed = OutboundFrame::fixed(7, vec![1, 2, 3]);
        assert_eq!(encode_frame(&fixed, None).expect("fixed"), vec![7, 1, 2, 3]);

        let var_byte = OutboundFrame::variable_byte(8, vec![9, 9]);
        assert_eq!(
            encode_frame(&var_byte, None).expect("var byte"),
            vec![8, 2, 9, 9]
        );

        let var_short = OutboundFrame::variable_short(9, vec![5; 300]);
        let encoded = encode_frame(&var_short, None).expect("var short");
        assert_eq!(&encoded[..3], &[9, 0x01, 0x2c]);
        assert_eq!(encoded.len(), 303);
    }

    #[test]
    fn frame_opcode_is_ciphered_when_key_present() {
        let seed = [4, 3, 2, 1];
        let mut out = IsaacCipher::new(&seed);
        let mut client_in = IsaacCipher::new(&seed);
        let frame = OutboundFrame::fixed(86, Vec::new());
        let encoded = encode_frame(&frame, Some(&mut out)).expect("encode");
        assert_eq!(client_in.decode_opcode(encoded[0]), 86);
    }

    #[test]
    fn variable_byte_overflow_is_rejected() {
        let frame = OutboundFrame::variable_byte(8, vec![0; 300]);
        assert!(encode_frame(&frame, None).is_err());
    }

    #[test]
    fn command_queue_is_fifo_across_producers() {
        let queue = Arc::new(CommandQueue::new());
        let mut handles = Vec::new();
        for worker in 0..4u16 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                for step in 0..8u16 {
                    queue.push(LogicCommand::Attack {
                        target_index: worker * 100 + step,
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().expect("producer");
        }
        let drained = queue.drain();
        assert_eq!(drained.len(), 32);
        assert!(queue.is_empty());

        // Per-producer order is preserved even though interleaving is not.
        for worker in 0..4u16 {
            let steps: Vec<u16> = drained
                .iter()
                .filter_map(|command| match command {
                    LogicCommand::Attack { target_index }
                        if target_index / 100 == worker =>
                    {
                        Some(target_index % 100)
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(steps, (0..8).collect::<Vec<u16>>());
        }
    }

    #[test]
    fn session_handle_closes_on_dropped_receiver() {
        let (handle, receiver) = SessionHandle::channel();
        drop(receiver);
        assert!(!handle.is_closed());
        handle.send(OutboundFrame::fixed(1, Vec::new()));
        assert!(handle.is_closed());
    }
}
