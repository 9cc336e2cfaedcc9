// Copyright 2026 Joyent, Inc.

//! Single packet codec.
//!
//! ```text
//! 0      2     3      4            12    13      14        16
//! +------+-----+------+------------+-----+-------+---------+---------
//! | CRC  | SZ  | FLG  | DEVICE ID  | LEN | SRVIX | SRV CMD | PAYLOAD
//! +------+-----+------+------------+-----+-------+---------+---------
//! ```
//!
//! All multi-byte fields are little-endian. The CRC covers everything from
//! byte 2 to the end of the payload.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use crc16::{State, CCITT_FALSE};
use slog::{warn, Logger};

use crate::constants::*;
use crate::device::DeviceId;
use crate::error::PacketError;
use crate::pack::{self, Value};

const JD_OFF_CRC: usize = 0x0;
const JD_OFF_SIZE: usize = 0x2;
const JD_OFF_FLAGS: usize = 0x3;
const JD_OFF_DEVICE_ID: usize = 0x4;
const JD_OFF_PAYLOAD_LEN: usize = 0xc;
const JD_OFF_SERVICE_INDEX: usize = 0xd;
const JD_OFF_SERVICE_CMD: usize = 0xe;

/// Running 16-bit CRC seeded with `0xffff`.
///
/// This is the CCITT recurrence `x = (crc >> 8) ^ b; x ^= x >> 4;
/// crc = (crc << 8) ^ (x << 12) ^ (x << 5) ^ x`.
pub fn crc16(data: &[u8]) -> u16 {
    State::<CCITT_FALSE>::calculate(data)
}

/// Round up to the next multiple of four.
pub fn align(n: usize) -> usize {
    (n + 3) & !3
}

/// Finalize a synthetic frame: pad to 4 bytes, fill in the size byte and
/// the CRC. A buffer whose CRC field is already set is returned untouched.
pub fn patch_binary(buf: &[u8]) -> Vec<u8> {
    if buf.len() < JD_FRAME_PREFIX_SIZE || buf[0] != 0 || buf[1] != 0 {
        return buf.to_vec();
    }
    let mut res = buf.to_vec();
    res.resize(align(buf.len()), 0);
    res[JD_OFF_SIZE] = (res.len() - JD_FRAME_PREFIX_SIZE) as u8;
    let crc = crc16(&res[JD_OFF_SIZE..]);
    LittleEndian::write_u16(&mut res[JD_OFF_CRC..JD_OFF_CRC + 2], crc);
    res
}

/// A logical Jacdac packet: a 16 byte header and up to 236 payload bytes.
///
/// The `device` of a packet is never stored here; resolve
/// [`Packet::device_id`] against a [`crate::device::DeviceRegistry`].
#[derive(Clone, Debug)]
pub struct Packet {
    header: [u8; JD_SERIAL_HEADER_SIZE],
    payload: Bytes,
    /// Reception time in bus milliseconds; `None` for packets pending send.
    pub timestamp: Option<u64>,
    /// Tag of the bus that produced the packet, used by bridges.
    pub sender: Option<String>,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Packet) -> bool {
        self.header[JD_OFF_FLAGS..] == other.header[JD_OFF_FLAGS..]
            && self.payload == other.payload
    }
}

impl Eq for Packet {}

impl Packet {
    /// Build a packet from a service command and a payload.
    pub fn from_cmd(service_command: u16, payload: &[u8]) -> Result<Packet, PacketError> {
        let mut p = Packet {
            header: [0; JD_SERIAL_HEADER_SIZE],
            payload: Bytes::new(),
            timestamp: None,
            sender: None,
        };
        p.set_payload(payload)?;
        p.set_service_command(service_command);
        Ok(p)
    }

    pub fn only_header(service_command: u16) -> Packet {
        let mut p = Packet {
            header: [0; JD_SERIAL_HEADER_SIZE],
            payload: Bytes::new(),
            timestamp: None,
            sender: None,
        };
        p.set_service_command(service_command);
        p
    }

    /// Build a fully addressed packet.
    pub fn encode(
        service_command: u16,
        frame_flags: u8,
        device_id: DeviceId,
        service_index: u8,
        payload: &[u8],
    ) -> Result<Packet, PacketError> {
        let mut p = Packet::from_cmd(service_command, payload)?;
        p.header[JD_OFF_FLAGS] = frame_flags;
        p.header[JD_OFF_DEVICE_ID..JD_OFF_DEVICE_ID + 8]
            .copy_from_slice(device_id.as_bytes());
        p.set_service_index(service_index);
        Ok(p)
    }

    /// Pack `values` with `fmt` into the payload of a new packet.
    pub fn packed(service_command: u16, fmt: &str, values: &[Value]) -> crate::error::Result<Packet> {
        let payload = pack::pack(fmt, values)?;
        Ok(Packet::from_cmd(service_command, &payload)?)
    }

    /// Parse one packet (header plus payload) out of `buf`.
    pub fn from_binary(buf: &[u8], timestamp: Option<u64>) -> Result<Packet, PacketError> {
        Packet::check_buffer_size(buf)?;
        let mut header = [0; JD_SERIAL_HEADER_SIZE];
        header.copy_from_slice(&buf[..JD_SERIAL_HEADER_SIZE]);
        let len = header[JD_OFF_PAYLOAD_LEN] as usize;
        Packet::validate_payload_length(buf, len)?;
        let payload = Bytes::copy_from_slice(
            &buf[JD_SERIAL_HEADER_SIZE..JD_SERIAL_HEADER_SIZE + len],
        );

        Ok(Packet {
            header,
            payload,
            timestamp,
            sender: None,
        })
    }

    /// Like [`Packet::from_binary`], but checks the CRC. A mismatch is
    /// logged and the packet is still returned; the frame layer decides
    /// whether to drop it.
    pub fn decode(buf: &[u8], timestamp: Option<u64>, log: &Logger) -> Result<Packet, PacketError> {
        let p = Packet::from_binary(buf, timestamp)?;
        if !p.crc_ok() {
            warn!(log, "packet crc mismatch";
                  "got" => p.crc(), "expected" => p.computed_crc());
        }
        Ok(p)
    }

    fn check_buffer_size(buf: &[u8]) -> Result<(), PacketError> {
        if buf.len() < JD_SERIAL_HEADER_SIZE {
            Err(PacketError::NotEnoughBytes(buf.len()))
        } else if buf.len() > JD_SERIAL_MAX_FRAME_SIZE {
            Err(PacketError::FrameTooLarge(buf.len()))
        } else {
            Ok(())
        }
    }

    fn validate_payload_length(buf: &[u8], len: usize) -> Result<(), PacketError> {
        if len > JD_SERIAL_MAX_PAYLOAD_SIZE {
            Err(PacketError::PayloadTooLarge(len))
        } else if buf.len() < JD_SERIAL_HEADER_SIZE + len {
            Err(PacketError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    /// Serialize as a single-packet frame with a fresh size byte and CRC.
    pub fn to_buffer(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(JD_SERIAL_HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header);
        buf.put_slice(&self.payload);
        buf[JD_OFF_SIZE] = (self.payload.len() + 4) as u8;
        let crc = crc16(&buf[JD_OFF_SIZE..]);
        LittleEndian::write_u16(&mut buf[JD_OFF_CRC..JD_OFF_CRC + 2], crc);
        buf.freeze()
    }

    /// Compute size and CRC and store them in the header, as done right
    /// before the packet goes out alone in a frame.
    pub fn finalize(&mut self) {
        let buf = self.to_buffer();
        self.header[..JD_OFF_FLAGS].copy_from_slice(&buf[..JD_OFF_FLAGS]);
    }

    fn computed_crc(&self) -> u16 {
        let mut buf = BytesMut::with_capacity(
            JD_SERIAL_HEADER_SIZE - JD_OFF_SIZE + self.payload.len(),
        );
        buf.put_slice(&self.header[JD_OFF_SIZE..]);
        buf.put_slice(&self.payload);
        crc16(&buf)
    }

    pub fn crc_ok(&self) -> bool {
        self.crc() == self.computed_crc()
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn crc(&self) -> u16 {
        LittleEndian::read_u16(&self.header[JD_OFF_CRC..JD_OFF_CRC + 2])
    }

    pub fn device_id(&self) -> DeviceId {
        DeviceId::from_slice(&self.header[JD_OFF_DEVICE_ID..JD_OFF_DEVICE_ID + 8])
    }

    pub fn set_device_id(&mut self, id: DeviceId) -> Result<(), PacketError> {
        if id == self.device_id() {
            return Ok(());
        }
        if self.is_multi_command() {
            return Err(PacketError::InvalidDeviceId(String::from(
                "cannot address a multi command",
            )));
        }
        self.header[JD_OFF_DEVICE_ID..JD_OFF_DEVICE_ID + 8]
            .copy_from_slice(id.as_bytes());
        Ok(())
    }

    pub fn frame_flags(&self) -> u8 {
        self.header[JD_OFF_FLAGS]
    }

    pub fn set_frame_flags(&mut self, flags: u8) {
        self.header[JD_OFF_FLAGS] = flags;
    }

    pub fn is_multi_command(&self) -> bool {
        self.frame_flags() & JD_FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS != 0
    }

    /// Service class targeted by a multi command.
    pub fn multicommand_class(&self) -> Option<u32> {
        if self.is_multi_command() {
            Some(LittleEndian::read_u32(
                &self.header[JD_OFF_DEVICE_ID..JD_OFF_DEVICE_ID + 4],
            ))
        } else {
            None
        }
    }

    pub fn size(&self) -> usize {
        self.header[JD_OFF_PAYLOAD_LEN] as usize
    }

    pub fn requires_ack(&self) -> bool {
        self.frame_flags() & JD_FRAME_FLAG_ACK_REQUESTED != 0
    }

    pub fn set_requires_ack(&mut self, ack: bool) {
        if ack {
            self.header[JD_OFF_FLAGS] |= JD_FRAME_FLAG_ACK_REQUESTED;
        } else {
            self.header[JD_OFF_FLAGS] &= !JD_FRAME_FLAG_ACK_REQUESTED;
        }
    }

    pub fn is_command(&self) -> bool {
        self.frame_flags() & JD_FRAME_FLAG_COMMAND != 0
    }

    pub fn set_is_command(&mut self, value: bool) {
        if value {
            self.header[JD_OFF_FLAGS] |= JD_FRAME_FLAG_COMMAND;
        } else {
            self.header[JD_OFF_FLAGS] &= !JD_FRAME_FLAG_COMMAND;
        }
    }

    pub fn is_report(&self) -> bool {
        !self.is_command()
    }

    pub fn service_index(&self) -> u8 {
        self.header[JD_OFF_SERVICE_INDEX] & JD_SERVICE_INDEX_MASK
    }

    pub fn set_service_index(&mut self, value: u8) {
        self.header[JD_OFF_SERVICE_INDEX] = (self.header[JD_OFF_SERVICE_INDEX]
            & JD_SERVICE_INDEX_INV_MASK)
            | (value & JD_SERVICE_INDEX_MASK);
    }

    pub fn service_command(&self) -> u16 {
        LittleEndian::read_u16(&self.header[JD_OFF_SERVICE_CMD..JD_OFF_SERVICE_CMD + 2])
    }

    pub fn set_service_command(&mut self, cmd: u16) {
        LittleEndian::write_u16(
            &mut self.header[JD_OFF_SERVICE_CMD..JD_OFF_SERVICE_CMD + 2],
            cmd,
        );
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: &[u8]) -> Result<(), PacketError> {
        if payload.len() > JD_SERIAL_MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        self.header[JD_OFF_PAYLOAD_LEN] = payload.len() as u8;
        self.payload = Bytes::copy_from_slice(payload);
        Ok(())
    }

    pub fn unpack(&self, fmt: &str) -> Result<Vec<Value>, crate::error::PackError> {
        pack::unpack(&self.payload, fmt)
    }

    fn is_normal_service(&self) -> bool {
        self.service_index() <= JD_SERVICE_INDEX_MAX_NORMAL
    }

    pub fn is_register_set(&self) -> bool {
        self.is_normal_service()
            && self.service_command() >> 12 == CMD_SET_REG >> 12
    }

    pub fn is_register_get(&self) -> bool {
        self.is_normal_service()
            && self.service_command() >> 12 == CMD_GET_REG >> 12
    }

    pub fn register_code(&self) -> Option<u16> {
        if self.is_register_get() || self.is_register_set() {
            Some(self.service_command() & CMD_REG_MASK)
        } else {
            None
        }
    }

    pub fn is_event(&self) -> bool {
        self.is_normal_service() && self.service_command() & CMD_EVENT_MASK != 0
    }

    pub fn event_code(&self) -> Option<u8> {
        if self.is_event() {
            Some((self.service_command() & CMD_EVENT_CODE_MASK) as u8)
        } else {
            None
        }
    }

    pub fn event_counter(&self) -> Option<u8> {
        if self.is_event() {
            Some(
                ((self.service_command() >> CMD_EVENT_COUNTER_POS)
                    & CMD_EVENT_COUNTER_MASK) as u8,
            )
        } else {
            None
        }
    }

    pub fn is_crc_ack(&self) -> bool {
        self.service_index() == JD_SERVICE_INDEX_CRC_ACK
    }

    pub fn is_pipe(&self) -> bool {
        self.service_index() == JD_SERVICE_INDEX_PIPE
    }

    pub fn pipe_port(&self) -> Option<u16> {
        if self.is_pipe() {
            Some(self.service_command() >> PIPE_PORT_SHIFT)
        } else {
            None
        }
    }

    pub fn pipe_count(&self) -> Option<u16> {
        if self.is_pipe() {
            Some(self.service_command() & PIPE_COUNTER_MASK)
        } else {
            None
        }
    }

    pub fn is_announce(&self) -> bool {
        self.service_index() == JD_SERVICE_INDEX_CTRL
            && self.is_report()
            && self.service_command() == CMD_ADVERTISEMENT_DATA
    }

    /// Payload as an unsigned number: 64 bits for 8 byte payloads, otherwise
    /// the first (zero extended) 32 bits.
    pub fn uint_data(&self) -> Option<u64> {
        let data = &self.payload;
        if data.is_empty() {
            return None;
        }
        if data.len() == 8 {
            return Some(LittleEndian::read_u64(data));
        }
        let mut buf = [0u8; 4];
        let n = data.len().min(4);
        buf[..n].copy_from_slice(&data[..n]);
        Some(LittleEndian::read_u32(&buf) as u64)
    }

    pub fn int_data(&self) -> Option<i32> {
        let data = &self.payload;
        match data.len() {
            0 => None,
            1 => Some(data[0] as i8 as i32),
            2 | 3 => Some(LittleEndian::read_i16(data) as i32),
            _ => Some(LittleEndian::read_i32(data)),
        }
    }

    pub fn string_data(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Turn this packet into a broadcast command for every service of
    /// class `service_class`.
    pub fn set_multi_command(&mut self, service_class: u32) {
        self.header[JD_OFF_FLAGS] |=
            JD_FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS | JD_FRAME_FLAG_COMMAND;
        LittleEndian::write_u32(
            &mut self.header[JD_OFF_DEVICE_ID..JD_OFF_DEVICE_ID + 4],
            service_class,
        );
        LittleEndian::write_u32(
            &mut self.header[JD_OFF_DEVICE_ID + 4..JD_OFF_DEVICE_ID + 8],
            JD_DEVICE_IDENTIFIER_BROADCAST_HIGH_MARK,
        );
        self.set_service_index(JD_SERVICE_INDEX_BROADCAST);
    }

    /// Copy of a multi command, addressed directly to one service.
    pub fn clone_for_device(&self, device_id: DeviceId, service_index: u8) -> Result<Packet, PacketError> {
        if !self.is_multi_command() {
            return Err(PacketError::NotMultiCommand);
        }
        let mut pkt = self.clone();
        pkt.header[JD_OFF_FLAGS] &= !JD_FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS;
        pkt.header[JD_OFF_DEVICE_ID..JD_OFF_DEVICE_ID + 8]
            .copy_from_slice(device_id.as_bytes());
        pkt.sender = None;
        pkt.set_service_index(service_index);
        Ok(pkt)
    }

    /// Shared frame prefix plus this packet's compressed block.
    pub(crate) fn from_frame_parts(prefix: &[u8], block: &[u8]) -> Result<Packet, PacketError> {
        let mut buf = Vec::with_capacity(prefix.len() + block.len());
        buf.extend_from_slice(prefix);
        buf.extend_from_slice(block);
        Packet::from_binary(&buf, None)
    }

    /// Size, service index and command followed by the payload.
    pub(crate) fn with_frame_stripped(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.extend_from_slice(&self.header[JD_OFF_PAYLOAD_LEN..]);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let target = if self.is_multi_command() {
            String::from("*")
        } else {
            self.device_id().short_id()
        };
        write!(
            f,
            "{}/{}[{}]: 0x{:x} sz={}: ",
            target,
            self.service_index(),
            self.frame_flags(),
            self.service_command(),
            self.size()
        )?;
        let shown = self.payload.len().min(20);
        for b in &self.payload[..shown] {
            write!(f, "{:02x}", b)?;
        }
        if self.payload.len() > shown {
            write!(f, "...")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck::{quickcheck, TestResult};

    fn reference_crc(data: &[u8]) -> u16 {
        let mut crc: u32 = 0xffff;
        for &b in data {
            let mut x = (crc >> 8) ^ b as u32;
            x ^= x >> 4;
            crc = ((crc << 8) ^ (x << 12) ^ (x << 5) ^ x) & 0xffff;
        }
        crc as u16
    }

    fn test_id() -> DeviceId {
        DeviceId::new([0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef])
    }

    #[test]
    fn crc_matches_recurrence() {
        assert_eq!(crc16(b"123456789"), 0x29b1);
        assert_eq!(crc16(&[]), 0xffff);
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(crc16(&data), reference_crc(&data));
    }

    #[test]
    fn crc_is_order_sensitive() {
        assert_ne!(crc16(&[1, 2, 3]), crc16(&[3, 2, 1]));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; 237];
        assert_eq!(
            Packet::from_cmd(0x80, &payload).unwrap_err(),
            PacketError::PayloadTooLarge(237)
        );
        assert!(Packet::from_cmd(0x80, &payload[..236]).is_ok());
    }

    #[test]
    fn header_fields() {
        let mut p = Packet::encode(
            CMD_GET_REG | system_reg::READING,
            JD_FRAME_FLAG_COMMAND | JD_FRAME_FLAG_ACK_REQUESTED,
            test_id(),
            3,
            &[1, 2, 3],
        )
        .unwrap();
        assert!(p.is_command());
        assert!(p.requires_ack());
        assert!(p.is_register_get());
        assert_eq!(p.register_code(), Some(system_reg::READING));
        assert_eq!(p.service_index(), 3);
        assert_eq!(p.device_id(), test_id());
        p.set_requires_ack(false);
        assert!(!p.requires_ack());
        assert!(p.is_command());

        let buf = p.to_buffer();
        assert_eq!(buf.len(), 19);
        assert_eq!(buf[2], 7);
        assert_eq!(buf[12], 3);
    }

    #[test]
    fn service_index_keeps_reserved_bits() {
        let mut p = Packet::only_header(0);
        p.header[JD_OFF_SERVICE_INDEX] = 0xc0;
        p.set_service_index(5);
        assert_eq!(p.header[JD_OFF_SERVICE_INDEX], 0xc5);
        assert_eq!(p.service_index(), 5);
    }

    #[test]
    fn event_fields() {
        let cmd = CMD_EVENT_MASK | (5 << CMD_EVENT_COUNTER_POS) | 0x02;
        let p = Packet::from_cmd(cmd, &[]).unwrap();
        assert!(p.is_event());
        assert_eq!(p.event_code(), Some(2));
        assert_eq!(p.event_counter(), Some(5));
    }

    #[test]
    fn mutation_invalidates_crc() {
        let mut p = Packet::encode(0x80, 0, test_id(), 1, &[9]).unwrap();
        p.finalize();
        assert!(p.crc_ok());
        p.set_service_command(0x81);
        assert!(!p.crc_ok());
        let p2 = Packet::from_binary(&p.to_buffer(), Some(1)).unwrap();
        assert!(p2.crc_ok());
    }

    #[test]
    fn multi_command_round_trip() {
        let mut p = Packet::from_cmd(CMD_SET_REG | 1, &[0xff]).unwrap();
        p.set_multi_command(SRV_BUTTON);
        assert!(p.is_multi_command());
        assert!(p.is_command());
        assert_eq!(p.multicommand_class(), Some(SRV_BUTTON));
        assert_eq!(p.service_index(), JD_SERVICE_INDEX_BROADCAST);

        let direct = p.clone_for_device(test_id(), 2).unwrap();
        assert!(!direct.is_multi_command());
        assert_eq!(direct.device_id(), test_id());
        assert_eq!(direct.service_index(), 2);
        assert_eq!(direct.payload(), &[0xff]);
    }

    #[test]
    fn number_views() {
        let p = Packet::from_cmd(0, &[0xfe]).unwrap();
        assert_eq!(p.int_data(), Some(-2));
        assert_eq!(p.uint_data(), Some(0xfe));
        let p = Packet::from_cmd(0, &[1, 0, 0, 0, 1, 0, 0, 0]).unwrap();
        assert_eq!(p.uint_data(), Some(0x1_0000_0001));
        assert_eq!(Packet::only_header(0).uint_data(), None);
    }

    #[test]
    fn patch_binary_fills_crc_and_size() {
        let raw = [0u8, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 0x80, 0, 7];
        let patched = patch_binary(&raw);
        assert_eq!(patched.len(), 20);
        assert_eq!(patched[2], 8);
        let crc = LittleEndian::read_u16(&patched[..2]);
        assert_eq!(crc, crc16(&patched[2..]));
        // already finalized buffers pass through
        assert_eq!(patch_binary(&patched), patched);
    }

    #[test]
    fn display_is_compact() {
        let p = Packet::encode(0x80, 0, test_id(), 1, &[0xab]).unwrap();
        let s = p.to_string();
        assert!(s.ends_with("/1[0]: 0x80 sz=1: ab"), "{}", s);
    }

    #[test]
    fn round_trip_property() {
        fn prop(cmd: u16, flags: u8, id: u64, index: u8, payload: Vec<u8>) -> TestResult {
            if payload.len() > JD_SERIAL_MAX_PAYLOAD_SIZE {
                return TestResult::discard();
            }
            let id = DeviceId::new(id.to_le_bytes());
            let p = match Packet::encode(cmd, flags & 0x07, id, index & 0x3f, &payload) {
                Ok(p) => p,
                Err(_) => return TestResult::failed(),
            };
            let decoded = Packet::from_binary(&p.to_buffer(), None).unwrap();
            TestResult::from_bool(
                decoded == p && decoded.crc_ok() && decoded.payload() == &payload[..],
            )
        }
        quickcheck(prop as fn(u16, u8, u64, u8, Vec<u8>) -> TestResult);
    }

    #[test]
    fn single_bit_flip_changes_crc() {
        fn prop(payload: Vec<u8>, bit: usize) -> TestResult {
            if payload.is_empty() {
                return TestResult::discard();
            }
            let bit = bit % (payload.len() * 8);
            let mut flipped = payload.clone();
            flipped[bit / 8] ^= 1 << (bit % 8);
            TestResult::from_bool(crc16(&payload) != crc16(&flipped))
        }
        quickcheck(prop as fn(Vec<u8>, usize) -> TestResult);
    }
}
