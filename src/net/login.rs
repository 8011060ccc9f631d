use crate::net::packet::{PacketReader, PacketWriter};
use crate::net::session::ProtocolError;

/// Raw, pre-cipher opcodes accepted while a connection is in the handshake
/// stage. Anything else closes the connection.
pub const SERVICE_HANDSHAKE_OPCODE: u8 = 14;
pub const REVISION_CHECK_OPCODE: u8 = 15;

pub const HANDSHAKE_PROCEED: u8 = 0;
pub const REVISION_OK: u8 = 0;
pub const REVISION_OUTDATED: u8 = 6;

pub const LOGIN_RESPONSE_OK: u8 = 2;
pub const LOGIN_RESPONSE_INVALID: u8 = 3;
pub const LOGIN_RESPONSE_ALREADY_ONLINE: u8 = 5;
pub const LOGIN_RESPONSE_OUTDATED: u8 = 6;
pub const LOGIN_RESPONSE_WORLD_FULL: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub revision: u32,
    pub seed: [u32; 4],
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionCheck {
    Accepted,
    Rejected { client: u32 },
}

/// The service handshake carries no payload; anything trailing the opcode
/// is a corrupted stream.
pub fn handle_service_handshake(remaining: usize) -> Result<(), ProtocolError> {
    if remaining != 0 {
        return Err(ProtocolError::BadLength {
            opcode: SERVICE_HANDSHAKE_OPCODE,
            expected: 0,
            actual: remaining,
        });
    }
    Ok(())
}

pub fn build_handshake_response(server_seed: u64) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(9);
    writer.write_u8(HANDSHAKE_PROCEED);
    writer.write_u64(server_seed);
    writer.into_vec()
}

/// Exactly four bytes of client revision. A mismatch is a protocol-visible
/// rejection, not an internal error.
pub fn check_revision(payload: &[u8], expected: u32) -> Result<RevisionCheck, ProtocolError> {
    if payload.len() != 4 {
        return Err(ProtocolError::BadLength {
            opcode: REVISION_CHECK_OPCODE,
            expected: 4,
            actual: payload.len(),
        });
    }
    let mut reader = PacketReader::new(payload);
    let client = reader
        .read_u32()
        .ok_or(ProtocolError::Malformed("revision"))?;
    if client != expected {
        return Ok(RevisionCheck::Rejected { client });
    }
    Ok(RevisionCheck::Accepted)
}

pub fn parse_login_block(payload: &[u8]) -> Result<LoginRequest, ProtocolError> {
    let mut reader = PacketReader::new(payload);
    let revision = reader
        .read_u32()
        .ok_or(ProtocolError::Malformed("login revision"))?;
    let mut seed = [0u32; 4];
    for word in &mut seed {
        *word = reader
            .read_u32()
            .ok_or(ProtocolError::Malformed("login cipher seed"))?;
    }
    let username = reader
        .read_string()
        .ok_or(ProtocolError::Malformed("login username"))?;
    let password = reader
        .read_string()
        .ok_or(ProtocolError::Malformed("login password"))?;
    if reader.remaining() != 0 {
        return Err(ProtocolError::Malformed("login block trailer"));
    }
    Ok(LoginRequest {
        revision,
        seed,
        username,
        password,
    })
}

pub fn build_login_block(request: &LoginRequest) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u32(request.revision);
    for word in request.seed {
        writer.write_u32(word);
    }
    writer.write_string(&request.username);
    writer.write_string(&request.password);
    writer.into_vec()
}

/// Init payload sent on a successful login: response code, rights, and the
/// world-assigned entity id.
pub fn build_login_success(rights: u8, entity_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(6);
    writer.write_u8(LOGIN_RESPONSE_OK);
    writer.write_u8(rights);
    writer.write_u32(entity_id);
    writer.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LoginRequest {
        LoginRequest {
            revision: 633,
            seed: [10, 20, 30, 40],
            username: "ada".to_string(),
            password: "hunter2".to_string(),
        }
    }

    #[test]
    fn service_handshake_requires_empty_payload() {
        assert!(handle_service_handshake(0).is_ok());
        let err = handle_service_handshake(3).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BadLength {
                opcode: SERVICE_HANDSHAKE_OPCODE,
                ..
            }
        ));
    }

    #[test]
    fn revision_check_accepts_match_and_rejects_mismatch() {
        let mut writer = PacketWriter::new();
        writer.write_u32(633);
        assert_eq!(
            check_revision(writer.as_slice(), 633),
            Ok(RevisionCheck::Accepted)
        );

        let mut writer = PacketWriter::new();
        writer.write_u32(618);
        assert_eq!(
            check_revision(writer.as_slice(), 633),
            Ok(RevisionCheck::Rejected { client: 618 })
        );
    }

    #[test]
    fn revision_check_rejects_wrong_length() {
        assert!(check_revision(&[1, 2, 3], 633).is_err());
        assert!(check_revision(&[1, 2, 3, 4, 5], 633).is_err());
    }

    #[test]
    fn login_block_roundtrip() {
        let request = request();
        let block = build_login_block(&request);
        let parsed = parse_login_block(&block).expect("parse");
        assert_eq!(parsed, request);
    }

    #[test]
    fn login_block_rejects_truncation_and_trailer() {
        let block = build_login_block(&request());
        assert!(parse_login_block(&block[..block.len() - 4]).is_err());

        let mut padded = block;
        padded.push(0x7f);
        assert_eq!(
            parse_login_block(&padded),
            Err(ProtocolError::Malformed("login block trailer"))
        );
    }

    #[test]
    fn handshake_response_carries_seed() {
        let response = build_handshake_response(0x1122_3344_5566_7788);
        assert_eq!(response.len(), 9);
        assert_eq!(response[0], HANDSHAKE_PROCEED);
        let mut reader = PacketReader::new(&response[1..]);
        assert_eq!(reader.read_u64(), Some(0x1122_3344_5566_7788));
    }

    #[test]
    fn login_success_layout() {
        let payload = build_login_success(2, 77);
        let mut reader = PacketReader::new(&payload);
        assert_eq!(reader.read_u8(), Some(LOGIN_RESPONSE_OK));
        assert_eq!(reader.read_u8(), Some(2));
        assert_eq!(reader.read_u32(), Some(77));
    }
}
