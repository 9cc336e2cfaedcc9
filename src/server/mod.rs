// Copyright 2026 Joyent, Inc.

//! Hosted services.
//!
//! A [`ServiceProvider`] makes a set of [`ServiceServer`]s look like one
//! device on the bus. It answers register gets and sets, runs command
//! handlers, numbers and resends events, acknowledges packets that ask for
//! it and announces itself. Nothing here does I/O: packets to send pile up
//! in an outbox that the bus drains, and anything the host application
//! should know about is queued as a [`Notification`].

mod control;
mod provider;
mod register;
mod service;

pub use self::control::ControlServer;
pub use self::provider::{ProviderOptions, ServiceProvider};
pub use self::register::{FieldBounds, RegisterServer};
pub use self::service::{CommandHandler, Outgoing, ServiceServer};

use crate::packet::Packet;

/// Host facing side effects of handling packets.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// A register got a new value, from the bus or from the host.
    RegisterChanged { service_index: u8, code: u16 },
    /// A command without a registered handler.
    Command { service_index: u8, packet: Packet },
    /// Someone asked the device to blink.
    Identify,
    /// The device was reset, by command or because `reset_in` expired.
    Reset,
    /// Raw status light animation payload.
    StatusLight(Vec<u8>),
}
