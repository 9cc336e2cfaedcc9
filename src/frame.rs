// Copyright 2026 Joyent, Inc.

//! Frame compression.
//!
//! A frame carries one or more packets from or to the same device. The first
//! 12 bytes are shared; every packet then contributes its own 4 byte
//! sub-header (payload length, service index, service command) and payload,
//! padded to a multiple of four.
//!
//! ```text
//! 0      2     3      4            12                              12+SZ
//! +------+-----+------+------------+-----+-----+-----+------+-----+
//! | CRC  | SZ  | FLG  | DEVICE ID  | LEN | IDX | CMD | DATA | ... |
//! +------+-----+------+------------+-----+-----+-----+------+-----+
//! ```
//!
//! The CRC covers bytes 2 through `12 + SZ`.

use byteorder::{ByteOrder, LittleEndian};
use slog::{debug, warn, Logger};

use crate::constants::{JD_FRAME_PREFIX_SIZE, JD_SERIAL_MAX_FRAME_SIZE};
use crate::error::PacketError;
use crate::packet::{align, crc16, Packet};

const FR_OFF_CRC: usize = 0x0;
const FR_OFF_SIZE: usize = 0x2;
const FR_OFF_FLAGS: usize = 0x3;

/// Size byte value marking a frame that carries one oversized command
/// instead of packets.
pub const JD_LARGE_FRAME_SIZE: u8 = 0xff;

/// Largest compressed region that fits in a frame.
const MAX_REGION: usize = JD_SERIAL_MAX_FRAME_SIZE - JD_FRAME_PREFIX_SIZE;

pub fn is_large_frame(frame: &[u8]) -> bool {
    frame.len() > FR_OFF_SIZE && frame[FR_OFF_SIZE] == JD_LARGE_FRAME_SIZE
}

/// Pack `packets` into a single frame. All packets must share the device
/// identifier and the frame flags of the first one.
pub fn compress(packets: &[Packet]) -> Result<Vec<u8>, PacketError> {
    let first = packets.first().ok_or(PacketError::EmptyFrame)?;
    let prefix = &first.header()[..JD_FRAME_PREFIX_SIZE];

    let mut frame = Vec::with_capacity(JD_SERIAL_MAX_FRAME_SIZE);
    frame.extend_from_slice(prefix);
    for p in packets {
        if p.header()[FR_OFF_FLAGS..JD_FRAME_PREFIX_SIZE]
            != prefix[FR_OFF_FLAGS..]
        {
            return Err(PacketError::MixedFrame);
        }
        frame.extend_from_slice(&p.with_frame_stripped());
        frame.resize(align(frame.len()), 0);
    }

    let region = frame.len() - JD_FRAME_PREFIX_SIZE;
    if region > MAX_REGION {
        return Err(PacketError::FrameTooLarge(frame.len()));
    }
    frame[FR_OFF_SIZE] = region as u8;
    let crc = crc16(&frame[FR_OFF_SIZE..]);
    LittleEndian::write_u16(&mut frame[FR_OFF_CRC..FR_OFF_CRC + 2], crc);
    Ok(frame)
}

/// Greedily group consecutive packets that can share a frame.
pub fn compress_all(packets: &[Packet]) -> Result<Vec<Vec<u8>>, PacketError> {
    let mut frames = Vec::new();
    let mut start = 0;
    while start < packets.len() {
        let mut end = start + 1;
        while end < packets.len()
            && packets[end].header()[FR_OFF_FLAGS..JD_FRAME_PREFIX_SIZE]
                == packets[start].header()[FR_OFF_FLAGS..JD_FRAME_PREFIX_SIZE]
            && region_len(&packets[start..=end]) <= MAX_REGION
        {
            end += 1;
        }
        frames.push(compress(&packets[start..end])?);
        start = end;
    }
    Ok(frames)
}

fn region_len(packets: &[Packet]) -> usize {
    packets.iter().map(|p| align(p.payload().len() + 4)).sum()
}

/// Split a received frame into its packets.
///
/// Decoding is lenient: a truncated frame, an empty one or one failing the
/// CRC check is dropped with a warning, trailing bytes beyond the declared
/// size are ignored, and a sub-block overrunning the declared region ends
/// decoding with whatever packets were parsed before it. Only the first
/// packet keeps the ack request of the frame.
pub fn frame_to_packets(
    frame: &[u8],
    timestamp: u64,
    sender: Option<&str>,
    skip_crc: bool,
    log: &Logger,
) -> Vec<Packet> {
    let size = if frame.len() < JD_FRAME_PREFIX_SIZE {
        0
    } else {
        frame[FR_OFF_SIZE] as usize
    };
    let end = JD_FRAME_PREFIX_SIZE + size;

    if frame.len() < end {
        warn!(log, "truncated frame";
              "ts" => timestamp, "got" => frame.len(), "expected" => end);
        return Vec::new();
    }
    if size < 4 {
        warn!(log, "empty frame"; "ts" => timestamp);
        return Vec::new();
    }
    if frame.len() != end {
        debug!(log, "unexpected frame length";
               "ts" => timestamp, "got" => frame.len(), "expected" => end);
    }
    if !skip_crc {
        let computed = crc16(&frame[FR_OFF_SIZE..end]);
        let actual = LittleEndian::read_u16(&frame[FR_OFF_CRC..FR_OFF_CRC + 2]);
        if actual != computed {
            warn!(log, "frame crc mismatch";
                  "ts" => timestamp, "size" => size,
                  "got" => actual, "expected" => computed);
            return Vec::new();
        }
    }

    let prefix = &frame[..JD_FRAME_PREFIX_SIZE];
    let mut res: Vec<Packet> = Vec::new();
    let mut ptr = JD_FRAME_PREFIX_SIZE;
    while ptr < end {
        let psz = frame[ptr] as usize + 4;
        if ptr + psz > end {
            warn!(log, "invalid frame compression";
                  "ts" => timestamp, "decoded" => res.len());
            break;
        }
        let mut p = match Packet::from_frame_parts(prefix, &frame[ptr..ptr + psz]) {
            Ok(p) => p,
            Err(e) => {
                warn!(log, "invalid packet in frame";
                      "ts" => timestamp, "error" => %e);
                break;
            }
        };
        p.timestamp = Some(timestamp);
        p.sender = sender.map(String::from);
        // one ack covers the whole frame
        if !res.is_empty() {
            p.set_requires_ack(false);
        }
        res.push(p);
        ptr += align(psz);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck::{quickcheck, TestResult};
    use slog::o;

    use crate::constants::{JD_FRAME_FLAG_ACK_REQUESTED, JD_FRAME_FLAG_COMMAND};
    use crate::device::DeviceId;

    fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn id() -> DeviceId {
        DeviceId::new([8, 7, 6, 5, 4, 3, 2, 1])
    }

    fn pkt(cmd: u16, index: u8, payload: &[u8]) -> Packet {
        Packet::encode(cmd, JD_FRAME_FLAG_COMMAND, id(), index, payload).unwrap()
    }

    #[test]
    fn single_packet_frame_matches_to_buffer() {
        let p = pkt(0x80, 2, &[1, 2, 3, 4]);
        let frame = compress(&[p.clone()]).unwrap();
        assert_eq!(&frame[..], &p.to_buffer()[..]);
        let back = frame_to_packets(&frame, 10, None, false, &discard());
        assert_eq!(back, vec![p]);
        assert_eq!(back[0].timestamp, Some(10));
    }

    #[test]
    fn blocks_are_aligned() {
        let frame = compress(&[pkt(1, 1, &[1]), pkt(2, 2, &[])]).unwrap();
        // 4 + 1 padded to 8, then 4
        assert_eq!(frame[2], 12);
        assert_eq!(frame.len(), 24);
        assert_eq!(frame[12 + 8 + 1], 2);
    }

    #[test]
    fn only_first_packet_keeps_ack() {
        let mut a = pkt(1, 1, &[]);
        let mut b = pkt(2, 1, &[]);
        a.set_requires_ack(true);
        b.set_requires_ack(true);
        let frame = compress(&[a, b]).unwrap();
        assert_eq!(frame[3] & JD_FRAME_FLAG_ACK_REQUESTED, JD_FRAME_FLAG_ACK_REQUESTED);
        let pkts = frame_to_packets(&frame, 0, Some("bridge"), false, &discard());
        assert_eq!(pkts.len(), 2);
        assert!(pkts[0].requires_ack());
        assert!(!pkts[1].requires_ack());
        assert_eq!(pkts[1].sender.as_deref(), Some("bridge"));
    }

    #[test]
    fn mixed_devices_are_rejected() {
        let other = Packet::encode(1, JD_FRAME_FLAG_COMMAND, DeviceId::default(), 1, &[]).unwrap();
        assert_eq!(
            compress(&[pkt(1, 1, &[]), other]).unwrap_err(),
            PacketError::MixedFrame
        );
        assert_eq!(compress(&[]).unwrap_err(), PacketError::EmptyFrame);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let big = vec![0u8; 200];
        let res = compress(&[pkt(1, 1, &big), pkt(2, 1, &big)]);
        assert!(matches!(res, Err(PacketError::FrameTooLarge(_))));
    }

    #[test]
    fn compress_all_splits_on_device_and_size() {
        let big = vec![0u8; 150];
        let other = Packet::encode(3, JD_FRAME_FLAG_COMMAND, DeviceId::default(), 1, &[]).unwrap();
        let pkts = vec![pkt(1, 1, &[]), pkt(2, 1, &big), pkt(4, 1, &big), other];
        let frames = compress_all(&pkts).unwrap();
        assert_eq!(frames.len(), 3);
        let mut decoded = Vec::new();
        for f in &frames {
            decoded.extend(frame_to_packets(f, 0, None, false, &discard()));
        }
        assert_eq!(decoded, pkts);
    }

    #[test]
    fn malformed_frames_degrade() {
        let log = discard();
        let frame = compress(&[pkt(1, 1, &[9; 8]), pkt(2, 2, &[7; 4])]).unwrap();

        // truncated
        assert!(frame_to_packets(&frame[..frame.len() - 1], 0, None, false, &log).is_empty());
        assert!(frame_to_packets(&frame[..5], 0, None, false, &log).is_empty());

        // crc
        let mut bad = frame.clone();
        bad[20] ^= 1;
        assert!(frame_to_packets(&bad, 0, None, false, &log).is_empty());
        assert_eq!(frame_to_packets(&bad, 0, None, true, &log).len(), 2);

        // declared size < 4
        let mut empty = frame.clone();
        empty[2] = 0;
        assert!(frame_to_packets(&empty, 0, None, true, &log).is_empty());

        // trailing garbage after the declared region is ignored
        let mut long = frame.clone();
        long.extend_from_slice(&[0xee; 4]);
        assert_eq!(frame_to_packets(&long, 0, None, false, &log).len(), 2);

        // second block claims more than what is left
        let mut overrun = frame.clone();
        overrun[12 + 12] = 40;
        let pkts = frame_to_packets(&overrun, 0, None, true, &log);
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].payload(), &[9; 8]);
    }

    #[test]
    fn large_frame_detection() {
        let mut frame = vec![0u8; 16];
        assert!(!is_large_frame(&frame));
        frame[2] = JD_LARGE_FRAME_SIZE;
        assert!(is_large_frame(&frame));
        assert!(!is_large_frame(&[0, 0]));
    }

    #[test]
    fn decompress_compress_property() {
        fn prop(payloads: Vec<(u16, u8, Vec<u8>)>) -> TestResult {
            if payloads.is_empty() {
                return TestResult::discard();
            }
            let pkts: Vec<Packet> = payloads
                .iter()
                .map(|(cmd, idx, data)| {
                    let data = &data[..data.len().min(40)];
                    pkt(*cmd, idx & 0x3f, data)
                })
                .collect();
            let frames = match compress_all(&pkts) {
                Ok(f) => f,
                Err(_) => return TestResult::failed(),
            };
            let log = discard();
            let decoded: Vec<Packet> = frames
                .iter()
                .flat_map(|f| frame_to_packets(f, 0, None, false, &log))
                .collect();
            TestResult::from_bool(decoded == pkts)
        }
        quickcheck(prop as fn(Vec<(u16, u8, Vec<u8>)>) -> TestResult);
    }
}
