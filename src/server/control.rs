// Copyright 2026 Joyent, Inc.

use slog::Logger;

use crate::constants::{announce_flags, control_cmd, control_reg, SRV_CONTROL};
use crate::error::Result;
use crate::pack::Value;
use crate::packet::Packet;
use crate::server::register::RegisterServer;
use crate::server::service::ServiceServer;
use crate::server::Notification;

const ANNOUNCE_FORMAT: &str = "u16 u8 x[1] u32[]";

/// What the control service needs the provider to do for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ControlRequest {
    Announce,
    Reset,
}

/// Service 0 of every hosted device.
#[derive(Debug)]
pub struct ControlServer {
    service: ServiceServer,
    start_time: u64,
    reset_in: bool,
}

impl ControlServer {
    pub fn new(description: &str, reset_in: bool) -> ControlServer {
        let mut service = ServiceServer::new(SRV_CONTROL);
        let registers = [
            (control_reg::DEVICE_DESCRIPTION, "s", Some(vec![Value::from(description)])),
            (control_reg::MCU_TEMPERATURE, "i16", Some(vec![Value::from(25u32)])),
            (control_reg::UPTIME, "u64", None),
            (control_reg::FIRMWARE_VERSION, "s", Some(vec![Value::from("0.0.0")])),
            (control_reg::PRODUCT_IDENTIFIER, "u32", Some(vec![Value::from(0u32)])),
        ];
        for (code, fmt, default) in registers.iter() {
            if let Ok(reg) = RegisterServer::new(*code, fmt, default.as_deref()) {
                service.add_register(reg);
            }
        }
        if reset_in {
            if let Ok(reg) =
                RegisterServer::new(control_reg::RESET_IN, "u32", Some(&[Value::from(0u32)]))
            {
                service.add_register(reg);
            }
        }
        ControlServer {
            service,
            start_time: 0,
            reset_in,
        }
    }

    pub fn service(&self) -> &ServiceServer {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut ServiceServer {
        &mut self.service
    }

    pub(crate) fn attach(&mut self, log: &Logger, now: u64) {
        self.service.attach(0, log);
        self.start_time = now;
    }

    /// Dispatch a packet addressed to service 0.
    pub(crate) fn handle_packet(&mut self, pkt: &Packet, now: u64) -> Option<ControlRequest> {
        if pkt.register_code().is_some() || !pkt.is_command() {
            self.service.handle_packet(pkt, now);
            return None;
        }
        match pkt.service_command() {
            control_cmd::SERVICES => Some(ControlRequest::Announce),
            control_cmd::RESET => {
                self.start_time = now;
                Some(ControlRequest::Reset)
            }
            control_cmd::IDENTIFY => {
                self.service.notify(Notification::Identify);
                None
            }
            control_cmd::SET_STATUS_LIGHT => {
                self.service
                    .notify(Notification::StatusLight(pkt.payload().to_vec()));
                None
            }
            control_cmd::NOOP => None,
            _ => {
                self.service.handle_packet(pkt, now);
                None
            }
        }
    }

    /// Build the announcement for a device and refresh the uptime register.
    pub(crate) fn announce(
        &mut self,
        restart_counter: u8,
        packet_count: u32,
        service_classes: &[u32],
        now: u64,
    ) -> Result<Packet> {
        let flags = restart_counter as u32
            | announce_flags::STATUS_LIGHT_RGB_NO_FADE as u32
            | announce_flags::SUPPORTS_ACK as u32;
        let classes = service_classes.iter().map(|c| Value::from(*c)).collect();
        let pkt = Packet::packed(
            control_cmd::SERVICES,
            ANNOUNCE_FORMAT,
            &[
                Value::from(flags),
                Value::from(packet_count.saturating_add(1)),
                Value::List(classes),
            ],
        )?;

        // microseconds
        let uptime = now.saturating_sub(self.start_time) * 1000;
        self.service
            .set_register(control_reg::UPTIME, &[Value::Num(uptime as f64)], true)?;
        Ok(pkt)
    }

    /// Whether a `reset_in` deadline set by a peer has passed.
    pub(crate) fn reset_in_expired(&self, now: u64) -> bool {
        if !self.reset_in {
            return false;
        }
        let reg = match self.service.register(control_reg::RESET_IN) {
            Some(reg) => reg,
            None => return false,
        };
        let micros = match reg.values().ok().and_then(|v| v.first().and_then(Value::as_f64)) {
            Some(v) if v > 0.0 => v as u64,
            _ => return false,
        };
        match reg.last_set_time {
            Some(set) => set + micros / 1000 < now,
            None => false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.service.reset();
    }
}
