// Copyright 2026 Joyent, Inc.

//! Wire-level constants shared by the packet codec, the frame layer and the
//! hosted services.

// Registers 0x001-0x07f - r/w common to all services
// Registers 0x080-0x0ff - r/w defined per-service
// Registers 0x100-0x17f - r/o common to all services
// Registers 0x180-0x1ff - r/o defined per-service
// Registers 0x200-0xeff - custom, defined per-service
// Registers 0xf00-0xfff - reserved for implementation
pub const CMD_GET_REG: u16 = 0x1000;
pub const CMD_SET_REG: u16 = 0x2000;
pub const CMD_TOP_MASK: u16 = 0xf000;
pub const CMD_REG_MASK: u16 = 0x0fff;

pub const CMD_EVENT_MASK: u16 = 0x8000;
pub const CMD_EVENT_CODE_MASK: u16 = 0xff;
pub const CMD_EVENT_COUNTER_MASK: u16 = 0x7f;
pub const CMD_EVENT_COUNTER_POS: u16 = 8;

/// Announcement for the control service, advertisement data for the others.
pub const CMD_ADVERTISEMENT_DATA: u16 = 0x00;

pub const PIPE_PORT_SHIFT: u16 = 7;
pub const PIPE_COUNTER_MASK: u16 = 0x001f;
pub const PIPE_CLOSE_MASK: u16 = 0x0020;
pub const PIPE_METADATA_MASK: u16 = 0x0040;

pub const JD_SERIAL_HEADER_SIZE: usize = 16;
pub const JD_SERIAL_MAX_PAYLOAD_SIZE: usize = 236;
/// Largest frame a peer may put on the wire: 12 byte prefix + 240 bytes.
pub const JD_SERIAL_MAX_FRAME_SIZE: usize = 252;
/// CRC, size, flags and device identifier.
pub const JD_FRAME_PREFIX_SIZE: usize = 12;

pub const JD_SERVICE_INDEX_MASK: u8 = 0x3f;
pub const JD_SERVICE_INDEX_INV_MASK: u8 = 0xc0;
pub const JD_SERVICE_INDEX_CRC_ACK: u8 = 0x3f;
pub const JD_SERVICE_INDEX_PIPE: u8 = 0x3e;
pub const JD_SERVICE_INDEX_BROADCAST: u8 = 0x3d;
pub const JD_SERVICE_INDEX_MAX_NORMAL: u8 = 0x30;
pub const JD_SERVICE_INDEX_CTRL: u8 = 0x00;

/// Device identifier is the recipient; cleared means it is the source.
pub const JD_FRAME_FLAG_COMMAND: u8 = 0x01;
/// Receiver must answer with a CRC-ack carrying this frame's CRC.
pub const JD_FRAME_FLAG_ACK_REQUESTED: u8 = 0x02;
/// The device identifier field holds a service class.
pub const JD_FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS: u8 = 0x04;

pub const JD_DEVICE_IDENTIFIER_BROADCAST_HIGH_MARK: u32 = 0xaaaa_aaaa;

pub const JD_ADVERTISEMENT_0_COUNTER_MASK: u32 = 0x0000_000f;
pub const JD_ADVERTISEMENT_0_ACK_SUPPORTED: u32 = 0x0000_0100;

/// Time without a packet before a device is lost, about 2x announce interval.
pub const JD_DEVICE_LOST_DELAY: u64 = 1500;
/// Time without a packet before a device is disconnected.
pub const JD_DEVICE_DISCONNECTED_DELAY: u64 = 5000;
pub const JD_ANNOUNCE_INTERVAL: u64 = 499;

pub const SRV_CONTROL: u32 = 0x0000_0000;
pub const SRV_BUTTON: u32 = 0x1473_a263;

/// Services per device, control service included.
pub const JD_MAX_SERVICES: usize = 32;

pub mod control_cmd {
    pub const SERVICES: u16 = 0x00;
    pub const NOOP: u16 = 0x80;
    pub const IDENTIFY: u16 = 0x81;
    pub const RESET: u16 = 0x82;
    pub const SET_STATUS_LIGHT: u16 = 0x84;
}

pub mod control_reg {
    pub const RESET_IN: u16 = 0x80;
    pub const DEVICE_DESCRIPTION: u16 = 0x180;
    pub const PRODUCT_IDENTIFIER: u16 = 0x181;
    pub const MCU_TEMPERATURE: u16 = 0x182;
    pub const FIRMWARE_VERSION: u16 = 0x185;
    pub const UPTIME: u16 = 0x186;
}

pub mod announce_flags {
    pub const RESTART_COUNTER_STEADY: u16 = 0x000f;
    pub const STATUS_LIGHT_RGB_NO_FADE: u16 = 0x0020;
    pub const SUPPORTS_ACK: u16 = 0x0100;
}

pub mod system_reg {
    pub const INTENSITY: u16 = 0x01;
    pub const VALUE: u16 = 0x02;
    pub const READING: u16 = 0x101;
    pub const STATUS_CODE: u16 = 0x103;
}

pub mod system_event {
    pub const ACTIVE: u8 = 0x01;
    pub const INACTIVE: u8 = 0x02;
    pub const STATUS_CODE_CHANGED: u8 = 0x04;
}
