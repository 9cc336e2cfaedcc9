// Copyright 2026 Joyent, Inc.

//! Error types. The unit of failure is always one packet, one frame or one
//! pending request; none of these errors are fatal to the bus.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::sync::BufferError;

/// Failures building or parsing a single packet or frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    PayloadTooLarge(usize),
    NotEnoughBytes(usize),
    FrameTooLarge(usize),
    InvalidDeviceId(String),
    NotMultiCommand,
    InvalidEventCode(u16),
    MixedFrame,
    EmptyFrame,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::PayloadTooLarge(n) => write!(
                f,
                "jacdac packet length too large, {} > 236 bytes",
                n
            ),
            PacketError::NotEnoughBytes(n) => {
                write!(f, "unable to parse packet: only {} bytes", n)
            }
            PacketError::FrameTooLarge(n) => {
                write!(f, "frame of {} bytes does not fit on the wire", n)
            }
            PacketError::InvalidDeviceId(id) => {
                write!(f, "invalid device identifier: {}", id)
            }
            PacketError::NotMultiCommand => write!(f, "must be multi command"),
            PacketError::InvalidEventCode(c) => {
                write!(f, "invalid event code 0x{:x}", c)
            }
            PacketError::MixedFrame => {
                write!(f, "frame packets must share device and flags")
            }
            PacketError::EmptyFrame => write!(f, "no packets to compress"),
        }
    }
}

impl StdError for PacketError {}

/// Failures packing or unpacking register field formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    InvalidFormat(String),
    TypeMismatch(String),
    NotEnoughBytes { needed: usize, available: usize },
    FormatTooShort,
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PackError::InvalidFormat(w) => write!(f, "invalid format: {}", w),
            PackError::TypeMismatch(m) => write!(f, "{}", m),
            PackError::NotEnoughBytes { needed, available } => write!(
                f,
                "not enough bytes to unpack: needed {}, have {}",
                needed, available
            ),
            PackError::FormatTooShort => write!(f, "format too short"),
        }
    }
}

impl StdError for PackError {}

/// Failures of the HF2 transport and of individual HF2 requests.
#[derive(Debug)]
pub enum Hf2Error {
    Io(io::Error),
    Timeout,
    ConnectionReset,
    Disconnected,
    Desync { expected: u16, got: u16 },
    InvalidCommand { info: u8 },
    ExecutionError { info: u8 },
    Status { status: u8, info: u8 },
    Bootloader,
    UnknownMode(u32),
    InvalidEventId(u32),
    NotSupported(String),
}

fn info_suffix(info: u8) -> String {
    if info != 0 {
        format!("; info={}", info)
    } else {
        String::new()
    }
}

impl fmt::Display for Hf2Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Hf2Error::Io(e) => write!(f, "usb error: {}", e),
            Hf2Error::Timeout => write!(f, "timeout"),
            Hf2Error::ConnectionReset => write!(f, "connection reset"),
            Hf2Error::Disconnected => write!(f, "disconnected"),
            Hf2Error::Desync { expected, got } => {
                write!(f, "out of sync ({} vs {})", expected, got)
            }
            Hf2Error::InvalidCommand { info } => {
                write!(f, "invalid command{}", info_suffix(*info))
            }
            Hf2Error::ExecutionError { info } => {
                write!(f, "execution error{}", info_suffix(*info))
            }
            Hf2Error::Status { status, info } => {
                write!(f, "error {}{}", status, info_suffix(*info))
            }
            Hf2Error::Bootloader => write!(f, "device in bootloader mode"),
            Hf2Error::UnknownMode(m) => {
                write!(f, "unknown device operation mode {}", m)
            }
            Hf2Error::InvalidEventId(id) => {
                write!(f, "invalid event id 0x{:x}", id)
            }
            Hf2Error::NotSupported(m) => {
                write!(f, "device does not support HF2: {}", m)
            }
        }
    }
}

impl StdError for Hf2Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Hf2Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Hf2Error {
    fn from(error: io::Error) -> Self {
        Hf2Error::Io(error)
    }
}

impl From<BufferError> for Hf2Error {
    fn from(error: BufferError) -> Self {
        match error {
            BufferError::Timeout => Hf2Error::Timeout,
            BufferError::Reset => Hf2Error::ConnectionReset,
        }
    }
}

/// Crate level error for callers that mix layers.
#[derive(Debug)]
pub enum Error {
    Packet(PacketError),
    Pack(PackError),
    Hf2(Hf2Error),
    Io(io::Error),
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Packet(e) => write!(f, "packet error: {}", e),
            Error::Pack(e) => write!(f, "pack error: {}", e),
            Error::Hf2(e) => write!(f, "hf2 error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Config(m) => write!(f, "configuration error: {}", m),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Packet(e) => Some(e),
            Error::Pack(e) => Some(e),
            Error::Hf2(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Config(_) => None,
        }
    }
}

impl From<PacketError> for Error {
    fn from(error: PacketError) -> Self {
        Error::Packet(error)
    }
}

impl From<PackError> for Error {
    fn from(error: PackError) -> Self {
        Error::Pack(error)
    }
}

impl From<Hf2Error> for Error {
    fn from(error: Hf2Error) -> Self {
        Error::Hf2(error)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
