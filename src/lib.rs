// Copyright 2026 Joyent, Inc.

//! Jacdac: a packet bus for small sensors and actuators, plus HF2, the USB
//! report protocol used to reach a bus through a connected device.
//!
//! Protocol definition
//!
//! Jacdac frames have the following structure:
//!
//! ```text
//! 0       2       3       4                               12
//! +-------+-------+-------+-------------------------------+
//! | CRC   | SIZE  | FLAGS | DEVICE IDENTIFIER             |
//! +-------+-------+-------+-------------------------------+
//! | SZ | IDX | CMD  | PAYLOAD ...  (repeated, 4 byte aligned)
//! +----+-----+------+----------------------------------------
//! ```
//!
//! * CRC       2-byte little-endian CRC16 of everything from SIZE to the end
//!             of the frame.
//!
//! * SIZE      1-byte length of the packet area that follows the 12 byte
//!             prefix.
//!
//! * FLAGS     1-byte frame flags: `0x01` command, `0x02` ack requested,
//!             `0x04` the identifier is a service class (multi command).
//!
//! * DEVICE IDENTIFIER   8 bytes; the sender of a report or the target of a
//!             command.
//!
//! * SZ        1-byte payload length of one packet.
//!
//! * IDX       1-byte service index (low six bits).
//!
//! * CMD       2-byte little-endian service command. The top nibble
//!             distinguishes register gets (`0x1`) and sets (`0x2`); event
//!             reports set bit 15 and carry a 7 bit counter.
//!
//! A frame holding a single packet is exactly that packet's 16 byte header
//! followed by its payload.
//!
//! Every device announces itself about twice per second with the list of
//! service classes it implements. Devices that stay quiet are first lost and
//! later disconnected. Hosted devices are built from
//! [`server::ServiceServer`]s collected into a [`server::ServiceProvider`]
//! and attached to a [`bus::Bus`].
//!
//! HF2 carries commands, responses, events and debug text in 64 byte
//! reports; see [`hf2`]. [`simulator`] stands in for a USB device.

#![allow(missing_docs)]

pub mod bus;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod frame;
pub mod hf2;
pub mod pack;
pub mod packet;
pub mod server;
pub mod simulator;
pub mod sync;
pub mod transport;
