//! RMAP (Remote Memory Access Protocol, ECSS-E-ST-50-52C) packet types and
//! wire codec.
//!
//! This plays the role `drv-sprot-api`'s `Header`/`Msg` pack-unpack plays: a
//! small set of plain structs with `serialize`/`parse` methods and a CRC
//! checked at the parser boundary, rather than a derive- or macro-generated
//! wire format.

use growth_crc8::crc8;

pub const PROTOCOL_ID: u8 = 0x01;
pub const DEFAULT_TARGET_LOGICAL_ADDRESS: u8 = 0xFE;
pub const DEFAULT_KEY: u8 = 0x20;

/// Path-address bytes are routing hops, not part of the RMAP header; by
/// convention every hop byte is `< 0x20` so a parser can tell where the
/// path ends and the logical-address byte begins.
const MAX_PATH_BYTE: u8 = 0x20;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RmapError {
    #[error("expected RMAP protocol id 0x01")]
    ProtocolMismatch,
    #[error("header CRC did not verify")]
    InvalidHeaderCrc,
    #[error("data CRC did not verify")]
    InvalidDataCrc,
    #[error("packet buffer ended before the field it should have held")]
    TruncatedPacket,
}

/// The instruction byte: command/reply, read/write, verify, reply-required,
/// address-increment, and reply-path length (in 4-byte units).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub is_command: bool,
    pub write: bool,
    pub verify: bool,
    pub reply: bool,
    pub increment: bool,
    pub reply_path_length: u8,
}

impl Instruction {
    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.is_command {
            b |= 1 << 6;
        }
        if self.write {
            b |= 1 << 5;
        }
        if self.verify {
            b |= 1 << 4;
        }
        if self.reply {
            b |= 1 << 3;
        }
        if self.increment {
            b |= 1 << 2;
        }
        b |= self.reply_path_length & 0b11;
        b
    }

    pub fn from_byte(b: u8) -> Self {
        Instruction {
            is_command: b & (1 << 6) != 0,
            write: b & (1 << 5) != 0,
            verify: b & (1 << 4) != 0,
            reply: b & (1 << 3) != 0,
            increment: b & (1 << 2) != 0,
            reply_path_length: b & 0b11,
        }
    }

    /// Defaults used by this design for reads: command, read, no verify,
    /// reply required.
    pub fn read_command(reply_path_length: u8) -> Self {
        Instruction {
            is_command: true,
            write: false,
            verify: false,
            reply: true,
            increment: true,
            reply_path_length,
        }
    }

    /// Defaults used by this design for writes: verify, reply and
    /// address-increment all on, matching the register-access façade's
    /// expectations.
    pub fn write_command(reply_path_length: u8) -> Self {
        Instruction {
            is_command: true,
            write: true,
            verify: true,
            reply: true,
            increment: true,
            reply_path_length,
        }
    }
}

/// RMAP reply status byte. 0x00 is success; the rest name the standard
/// ECSS-E-ST-50-52C error kinds. `Reserved` carries any code this design
/// does not assign meaning to, rather than failing to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmapStatus {
    Success,
    GeneralError,
    UnusedPacketType,
    InvalidKey,
    InvalidDataCrc,
    EarlyEop,
    CargoTooLarge,
    Eep,
    VerifyBufferOverrun,
    NotAuthorised,
    RmwLengthError,
    InvalidTargetLogicalAddress,
    Reserved(u8),
}

impl RmapStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => RmapStatus::Success,
            0x01 => RmapStatus::GeneralError,
            0x02 => RmapStatus::UnusedPacketType,
            0x03 => RmapStatus::InvalidKey,
            0x04 => RmapStatus::InvalidDataCrc,
            0x05 => RmapStatus::EarlyEop,
            0x06 => RmapStatus::CargoTooLarge,
            0x07 => RmapStatus::Eep,
            0x09 => RmapStatus::VerifyBufferOverrun,
            0x0a => RmapStatus::NotAuthorised,
            0x0b => RmapStatus::RmwLengthError,
            0x0c => RmapStatus::InvalidTargetLogicalAddress,
            other => RmapStatus::Reserved(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            RmapStatus::Success => 0x00,
            RmapStatus::GeneralError => 0x01,
            RmapStatus::UnusedPacketType => 0x02,
            RmapStatus::InvalidKey => 0x03,
            RmapStatus::InvalidDataCrc => 0x04,
            RmapStatus::EarlyEop => 0x05,
            RmapStatus::CargoTooLarge => 0x06,
            RmapStatus::Eep => 0x07,
            RmapStatus::VerifyBufferOverrun => 0x09,
            RmapStatus::NotAuthorised => 0x0a,
            RmapStatus::RmwLengthError => 0x0b,
            RmapStatus::InvalidTargetLogicalAddress => 0x0c,
            RmapStatus::Reserved(other) => other,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, RmapStatus::Success)
    }
}

/// Identifies the node an initiator is talking to: routing path, logical
/// addresses, and the shared key RMAP targets authenticate writes with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmapTarget {
    pub target_path: Vec<u8>,
    pub target_logical_address: u8,
    pub initiator_logical_address: u8,
    pub key: u8,
    pub reply_path: Vec<u8>,
}

impl Default for RmapTarget {
    fn default() -> Self {
        RmapTarget {
            target_path: Vec::new(),
            target_logical_address: DEFAULT_TARGET_LOGICAL_ADDRESS,
            initiator_logical_address: DEFAULT_TARGET_LOGICAL_ADDRESS,
            key: DEFAULT_KEY,
            reply_path: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub target_path: Vec<u8>,
    pub target_logical_address: u8,
    pub instruction: Instruction,
    pub key: u8,
    pub reply_path: Vec<u8>,
    pub initiator_logical_address: u8,
    pub transaction_id: u16,
    pub extended_address: u8,
    pub address: u32,
    /// `Some` for a write command (the bytes to write); `None` for a read
    /// command, in which case `read_length` is the requested byte count.
    pub payload: Option<Vec<u8>>,
    pub read_length: u32,
}

impl CommandPacket {
    pub fn read(target: &RmapTarget, transaction_id: u16, address: u32, read_length: u32) -> Self {
        CommandPacket {
            target_path: target.target_path.clone(),
            target_logical_address: target.target_logical_address,
            instruction: Instruction::read_command(padded_reply_path_units(&target.reply_path)),
            key: target.key,
            reply_path: target.reply_path.clone(),
            initiator_logical_address: target.initiator_logical_address,
            transaction_id,
            extended_address: 0,
            address,
            payload: None,
            read_length,
        }
    }

    pub fn write(
        target: &RmapTarget,
        transaction_id: u16,
        address: u32,
        data: &[u8],
        instruction: Instruction,
    ) -> Self {
        CommandPacket {
            target_path: target.target_path.clone(),
            target_logical_address: target.target_logical_address,
            instruction,
            key: target.key,
            reply_path: target.reply_path.clone(),
            initiator_logical_address: target.initiator_logical_address,
            transaction_id,
            extended_address: 0,
            address,
            payload: Some(data.to_vec()),
            read_length: data.len() as u32,
        }
    }

    fn data_length(&self) -> u32 {
        match &self.payload {
            Some(p) => p.len() as u32,
            None => self.read_length,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let reply_path = pad_to_multiple_of_4(&self.reply_path);
        let mut header = Vec::with_capacity(16 + reply_path.len());
        header.push(self.target_logical_address);
        header.push(PROTOCOL_ID);
        header.push(self.instruction.to_byte());
        header.push(self.key);
        header.extend_from_slice(&reply_path);
        header.push(self.initiator_logical_address);
        header.extend_from_slice(&self.transaction_id.to_be_bytes());
        header.push(self.extended_address);
        header.extend_from_slice(&self.address.to_be_bytes());
        header.extend_from_slice(&be24(self.data_length()));

        let mut out = Vec::with_capacity(self.target_path.len() + header.len() + 1);
        out.extend_from_slice(&self.target_path);
        out.extend_from_slice(&header);
        out.push(crc8(&header));
        if let Some(payload) = &self.payload {
            out.extend_from_slice(payload);
            out.push(crc8(payload));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPacket {
    pub initiator_logical_address: u8,
    pub instruction: Instruction,
    pub status: RmapStatus,
    pub target_logical_address: u8,
    pub transaction_id: u16,
    pub payload: Option<Vec<u8>>,
}

impl ReplyPacket {
    pub fn write_reply(target: &RmapTarget, transaction_id: u16, status: RmapStatus) -> Self {
        ReplyPacket {
            initiator_logical_address: target.initiator_logical_address,
            instruction: Instruction {
                is_command: false,
                write: true,
                verify: false,
                reply: true,
                increment: false,
                reply_path_length: 0,
            },
            status,
            target_logical_address: target.target_logical_address,
            transaction_id,
            payload: None,
        }
    }

    pub fn read_reply(
        target: &RmapTarget,
        transaction_id: u16,
        status: RmapStatus,
        payload: Vec<u8>,
    ) -> Self {
        ReplyPacket {
            initiator_logical_address: target.initiator_logical_address,
            instruction: Instruction {
                is_command: false,
                write: false,
                verify: false,
                reply: true,
                increment: false,
                reply_path_length: 0,
            },
            status,
            target_logical_address: target.target_logical_address,
            transaction_id,
            payload: Some(payload),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut header = vec![
            self.initiator_logical_address,
            PROTOCOL_ID,
            self.instruction.to_byte(),
            self.status.code(),
            self.target_logical_address,
        ];
        header.extend_from_slice(&self.transaction_id.to_be_bytes());

        let mut out;
        if self.instruction.write {
            out = Vec::with_capacity(header.len() + 1);
            out.extend_from_slice(&header);
            out.push(crc8(&header));
        } else {
            let payload = self.payload.as_deref().unwrap_or(&[]);
            header.push(0x00);
            header.extend_from_slice(&be24(payload.len() as u32));
            out = Vec::with_capacity(header.len() + 1 + payload.len() + 1);
            out.extend_from_slice(&header);
            out.push(crc8(&header));
            out.extend_from_slice(payload);
            out.push(crc8(payload));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPacket {
    Command(CommandPacket),
    Reply(ReplyPacket),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RmapError> {
        let end = self.pos.checked_add(n).ok_or(RmapError::TruncatedPacket)?;
        let slice = self.buf.get(self.pos..end).ok_or(RmapError::TruncatedPacket)?;
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, RmapError> {
        Ok(self.take(1)?[0])
    }
}

/// Strips leading SpaceWire path-address bytes (`< 0x20`) and parses the
/// RMAP header/payload that follows, verifying the header CRC and, when a
/// payload is present, the data CRC.
pub fn parse(buf: &[u8]) -> Result<ParsedPacket, RmapError> {
    let mut path_len = 0;
    while path_len < buf.len() && buf[path_len] < MAX_PATH_BYTE {
        path_len += 1;
    }
    let target_path = buf[..path_len].to_vec();
    let mut cur = Cursor::new(&buf[path_len..]);
    let header_start = cur.pos;

    let logical_address_byte = cur.byte()?;
    let protocol = cur.byte()?;
    if protocol != PROTOCOL_ID {
        return Err(RmapError::ProtocolMismatch);
    }
    let instruction = Instruction::from_byte(cur.byte()?);

    if instruction.is_command {
        let key = cur.byte()?;
        let reply_path = cur.take(instruction.reply_path_length as usize * 4)?.to_vec();
        let initiator_logical_address = cur.byte()?;
        let transaction_id = u16::from_be_bytes(cur.take(2)?.try_into().unwrap());
        let extended_address = cur.byte()?;
        let address = u32::from_be_bytes(cur.take(4)?.try_into().unwrap());
        let data_length = from_be24(cur.take(3)?);
        let header_end = cur.pos;
        let header_crc = cur.byte()?;
        if crc8(&cur.buf[header_start..header_end]) != header_crc {
            return Err(RmapError::InvalidHeaderCrc);
        }

        let payload = if instruction.write {
            let body = cur.take(data_length as usize)?.to_vec();
            let data_crc = cur.byte()?;
            if crc8(&body) != data_crc {
                return Err(RmapError::InvalidDataCrc);
            }
            Some(body)
        } else {
            None
        };

        Ok(ParsedPacket::Command(CommandPacket {
            target_path,
            target_logical_address: logical_address_byte,
            instruction,
            key,
            reply_path,
            initiator_logical_address,
            transaction_id,
            extended_address,
            address,
            payload,
            read_length: data_length,
        }))
    } else {
        let status = RmapStatus::from_code(cur.byte()?);
        let target_logical_address = cur.byte()?;
        let transaction_id = u16::from_be_bytes(cur.take(2)?.try_into().unwrap());

        if instruction.write {
            let header_end = cur.pos;
            let header_crc = cur.byte()?;
            if crc8(&cur.buf[header_start..header_end]) != header_crc {
                return Err(RmapError::InvalidHeaderCrc);
            }
            Ok(ParsedPacket::Reply(ReplyPacket {
                initiator_logical_address: logical_address_byte,
                instruction,
                status,
                target_logical_address,
                transaction_id,
                payload: None,
            }))
        } else {
            let _reserved = cur.byte()?;
            let data_length = from_be24(cur.take(3)?);
            let header_end = cur.pos;
            let header_crc = cur.byte()?;
            if crc8(&cur.buf[header_start..header_end]) != header_crc {
                return Err(RmapError::InvalidHeaderCrc);
            }
            let body = cur.take(data_length as usize)?.to_vec();
            let data_crc = cur.byte()?;
            if crc8(&body) != data_crc {
                return Err(RmapError::InvalidDataCrc);
            }
            Ok(ParsedPacket::Reply(ReplyPacket {
                initiator_logical_address: logical_address_byte,
                instruction,
                status,
                target_logical_address,
                transaction_id,
                payload: Some(body),
            }))
        }
    }
}

fn pad_to_multiple_of_4(path: &[u8]) -> Vec<u8> {
    let mut padded = path.to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0);
    }
    padded
}

fn padded_reply_path_units(path: &[u8]) -> u8 {
    (pad_to_multiple_of_4(path).len() / 4) as u8
}

fn be24(value: u32) -> [u8; 3] {
    let b = value.to_be_bytes();
    [b[1], b[2], b[3]]
}

fn from_be24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_command_round_trips() {
        let target = RmapTarget::default();
        let cmd = CommandPacket::write(&target, 0x1234, 0x0101_0116, &[0x03, 0xE8], Instruction::write_command(0));
        let wire = cmd.serialize();
        match parse(&wire).unwrap() {
            ParsedPacket::Command(parsed) => assert_eq!(parsed, cmd),
            _ => panic!("expected a command"),
        }
    }

    #[test]
    fn read_command_round_trips() {
        let target = RmapTarget::default();
        let cmd = CommandPacket::read(&target, 7, 0x2000_0000, 2);
        let wire = cmd.serialize();
        match parse(&wire).unwrap() {
            ParsedPacket::Command(parsed) => assert_eq!(parsed, cmd),
            _ => panic!("expected a command"),
        }
    }

    #[test]
    fn write_reply_round_trips() {
        let target = RmapTarget::default();
        let reply = ReplyPacket::write_reply(&target, 99, RmapStatus::Success);
        let wire = reply.serialize();
        assert_eq!(wire.len(), 8);
        match parse(&wire).unwrap() {
            ParsedPacket::Reply(parsed) => assert_eq!(parsed, reply),
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn read_reply_round_trips() {
        let target = RmapTarget::default();
        let reply = ReplyPacket::read_reply(&target, 99, RmapStatus::Success, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        let wire = reply.serialize();
        assert_eq!(wire.len(), 12 + 4 + 1);
        match parse(&wire).unwrap() {
            ParsedPacket::Reply(parsed) => assert_eq!(parsed, reply),
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn header_crc_is_last_byte_of_serialised_header() {
        let target = RmapTarget::default();
        let cmd = CommandPacket::read(&target, 1, 0x1000_0000, 16);
        let wire = cmd.serialize();
        // header occupies bytes [0..15], CRC at byte 15 (no path bytes here).
        let crc = crc8(&wire[..15]);
        assert_eq!(wire[15], crc);
        assert_eq!(wire.len(), 16);
    }

    #[test]
    fn corrupted_header_crc_is_rejected() {
        let target = RmapTarget::default();
        let cmd = CommandPacket::read(&target, 1, 0x1000_0000, 16);
        let mut wire = cmd.serialize();
        wire[2] ^= 0xFF;
        assert_eq!(parse(&wire).unwrap_err(), RmapError::InvalidHeaderCrc);
    }

    #[test]
    fn corrupted_data_crc_is_rejected() {
        let target = RmapTarget::default();
        let cmd = CommandPacket::write(&target, 1, 0x1000_0000, &[1, 2, 3, 4], Instruction::write_command(0));
        let mut wire = cmd.serialize();
        let last = wire.len() - 2;
        wire[last] ^= 0xFF;
        assert_eq!(parse(&wire).unwrap_err(), RmapError::InvalidDataCrc);
    }

    #[test]
    fn bad_protocol_id_is_rejected() {
        let target = RmapTarget::default();
        let cmd = CommandPacket::read(&target, 1, 0x1000_0000, 16);
        let mut wire = cmd.serialize();
        wire[1] = 0x02;
        assert_eq!(parse(&wire).unwrap_err(), RmapError::ProtocolMismatch);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let target = RmapTarget::default();
        let cmd = CommandPacket::read(&target, 1, 0x1000_0000, 16);
        let wire = cmd.serialize();
        assert_eq!(parse(&wire[..5]).unwrap_err(), RmapError::TruncatedPacket);
    }

    #[test]
    fn leading_path_bytes_are_stripped_before_parsing() {
        let target = RmapTarget::default();
        let cmd = CommandPacket::read(&target, 1, 0x1000_0000, 16);
        let mut wire = vec![0x05, 0x0a];
        wire.extend(cmd.serialize());
        match parse(&wire).unwrap() {
            ParsedPacket::Command(parsed) => {
                assert_eq!(parsed.target_path, vec![0x05, 0x0a]);
                assert_eq!(parsed.transaction_id, 1);
            }
            _ => panic!("expected a command"),
        }
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_write_payload_round_trips(data in proptest::collection::vec(0u8..=255, 0..300), tid: u16, addr: u32) {
            let target = RmapTarget::default();
            let cmd = CommandPacket::write(&target, tid, addr, &data, Instruction::write_command(0));
            let wire = cmd.serialize();
            match parse(&wire).unwrap() {
                ParsedPacket::Command(parsed) => proptest::prop_assert_eq!(parsed, cmd),
                _ => proptest::prop_assert!(false, "expected a command"),
            }
        }
    }
}
