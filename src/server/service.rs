// Copyright 2026 Joyent, Inc.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use slog::{debug, o, warn, Logger};

use crate::constants::{system_event, system_reg};
use crate::error::{PackError, PacketError};
use crate::pack::Value;
use crate::packet::Packet;
use crate::server::register::RegisterServer;
use crate::server::Notification;

/// Handler for a service specific command. It gets the service itself so
/// it can update registers and queue reports.
pub type CommandHandler = Box<dyn FnMut(&mut ServiceServer, &Packet) + Send>;

/// Something a service wants to put on the bus. Reports go out as they are;
/// events need a device wide counter and are resent, so the provider turns
/// them into packets.
#[derive(Clone, Debug, PartialEq)]
pub enum Outgoing {
    Report(Packet),
    Event { code: u8, data: Vec<u8> },
}

/// One hosted service: a class, its registers and its command handlers.
pub struct ServiceServer {
    service_class: u32,
    service_index: u8,
    instance_name: Option<String>,
    registers: Vec<RegisterServer>,
    commands: HashMap<u16, Option<CommandHandler>>,
    outbox: VecDeque<Outgoing>,
    notifications: VecDeque<Notification>,
    log: Logger,
}

impl fmt::Debug for ServiceServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServiceServer")
            .field("service_class", &self.service_class)
            .field("service_index", &self.service_index)
            .field("registers", &self.registers.len())
            .finish()
    }
}

impl ServiceServer {
    pub fn new(service_class: u32) -> ServiceServer {
        let mut srv = ServiceServer {
            service_class,
            service_index: 0,
            instance_name: None,
            registers: Vec::new(),
            commands: HashMap::new(),
            outbox: VecDeque::new(),
            notifications: VecDeque::new(),
            log: Logger::root(slog::Discard, o!()),
        };
        // ready, no vendor code
        if let Ok(reg) = RegisterServer::new(
            system_reg::STATUS_CODE,
            "u16 u16",
            Some(&[Value::Num(0.0), Value::Num(0.0)]),
        ) {
            srv.registers.push(reg);
        }
        srv
    }

    pub fn with_instance_name(mut self, name: &str) -> ServiceServer {
        self.instance_name = Some(String::from(name));
        self
    }

    pub fn service_class(&self) -> u32 {
        self.service_class
    }

    pub fn service_index(&self) -> u8 {
        self.service_index
    }

    pub fn instance_name(&self) -> Option<&str> {
        self.instance_name.as_deref()
    }

    pub(crate) fn attach(&mut self, service_index: u8, log: &Logger) {
        self.service_index = service_index;
        self.log = log.new(o!("service" => service_index));
    }

    /// Add a register, replacing any existing one with the same code.
    pub fn add_register(&mut self, reg: RegisterServer) {
        self.registers.retain(|r| r.code() != reg.code());
        self.registers.push(reg);
    }

    pub fn register(&self, code: u16) -> Option<&RegisterServer> {
        self.registers.iter().find(|r| r.code() == code)
    }

    pub fn register_mut(&mut self, code: u16) -> Option<&mut RegisterServer> {
        self.registers.iter_mut().find(|r| r.code() == code)
    }

    pub fn registers(&self) -> &[RegisterServer] {
        &self.registers
    }

    /// Register a command handler. `None` acknowledges a command that needs
    /// no action.
    pub fn add_command(&mut self, cmd: u16, handler: Option<CommandHandler>) {
        self.commands.insert(cmd, handler);
    }

    /// Set register `code` from the host side. A change is signalled like a
    /// set from the bus unless `skip_change` is given.
    pub fn set_register(&mut self, code: u16, values: &[Value], skip_change: bool) -> Result<bool, PackError> {
        let changed = match self.register_mut(code) {
            Some(reg) => reg.set_values(values, skip_change)?,
            None => {
                return Err(PackError::InvalidFormat(format!(
                    "no register 0x{:x}",
                    code
                )))
            }
        };
        if changed {
            self.register_changed(code);
        }
        Ok(changed)
    }

    pub fn status_code(&self) -> Option<(u16, u16)> {
        let values = self.register(system_reg::STATUS_CODE)?.values().ok()?;
        match (values.first(), values.get(1)) {
            (Some(Value::Num(a)), Some(Value::Num(b))) => Some((*a as u16, *b as u16)),
            _ => None,
        }
    }

    pub fn set_status_code(&mut self, code: u16, vendor: u16) -> Result<bool, PackError> {
        self.set_register(
            system_reg::STATUS_CODE,
            &[Value::from(code as u32), Value::from(vendor as u32)],
            false,
        )
    }

    fn register_changed(&mut self, code: u16) {
        self.notifications.push_back(Notification::RegisterChanged {
            service_index: self.service_index,
            code,
        });
        if code == system_reg::STATUS_CODE {
            let data = self
                .register(code)
                .and_then(|r| r.data())
                .map(|d| d.to_vec())
                .unwrap_or_default();
            self.send_event(system_event::STATUS_CODE_CHANGED, &data);
        }
    }

    /// Queue the current value of register `code` as a report.
    pub fn send_register(&mut self, code: u16) -> Result<(), PacketError> {
        let report = match self.register(code) {
            Some(reg) => reg.get_report()?,
            None => None,
        };
        if let Some(p) = report {
            self.send_report(p);
        }
        Ok(())
    }

    pub fn send_report(&mut self, pkt: Packet) {
        self.outbox.push_back(Outgoing::Report(pkt));
    }

    pub fn send_event(&mut self, code: u8, data: &[u8]) {
        self.outbox.push_back(Outgoing::Event {
            code,
            data: data.to_vec(),
        });
    }

    pub(crate) fn notify(&mut self, n: Notification) {
        self.notifications.push_back(n);
    }

    /// Handle a packet addressed to this service.
    pub fn handle_packet(&mut self, pkt: &Packet, now: u64) {
        if let Some(code) = pkt.register_code() {
            self.handle_register(pkt, code, now);
        } else if pkt.is_command() {
            let cmd = pkt.service_command();
            match self.commands.remove(&cmd) {
                Some(Some(mut handler)) => {
                    handler(self, pkt);
                    // the handler may have replaced itself
                    self.commands.entry(cmd).or_insert(Some(handler));
                }
                Some(None) => {
                    self.commands.insert(cmd, None);
                }
                None => {
                    debug!(self.log, "ignored command"; "cmd" => cmd);
                    self.notifications.push_back(Notification::Command {
                        service_index: self.service_index,
                        packet: pkt.clone(),
                    });
                }
            }
        }
    }

    fn handle_register(&mut self, pkt: &Packet, code: u16, now: u64) {
        let reg = match self.registers.iter_mut().find(|r| r.code() == code) {
            Some(reg) => reg,
            None => {
                debug!(self.log, "unknown register"; "code" => code);
                return;
            }
        };
        if pkt.is_register_get() {
            match reg.get_report() {
                Ok(Some(report)) => self.send_report(report),
                Ok(None) => (),
                Err(e) => warn!(self.log, "register report failed";
                                "code" => code, "error" => %e),
            }
            return;
        }
        match reg.apply_set(pkt.payload(), now) {
            Ok(true) => self.register_changed(code),
            Ok(false) => (),
            Err(e) => {
                warn!(self.log, "invalid register data";
                      "code" => code, "error" => %e);
            }
        }
    }

    pub fn reset(&mut self) {
        for reg in self.registers.iter_mut() {
            reg.reset();
        }
    }

    pub(crate) fn take_outgoing(&mut self) -> Vec<Outgoing> {
        self.outbox.drain(..).collect()
    }

    pub(crate) fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::constants::{CMD_GET_REG, CMD_SET_REG, JD_FRAME_FLAG_COMMAND, SRV_BUTTON};
    use crate::device::DeviceId;
    use crate::server::register::FieldBounds;

    fn command(cmd: u16, payload: &[u8]) -> Packet {
        Packet::encode(cmd, JD_FRAME_FLAG_COMMAND, DeviceId::default(), 1, payload).unwrap()
    }

    fn service() -> ServiceServer {
        let mut srv = ServiceServer::new(SRV_BUTTON);
        srv.add_register(
            RegisterServer::new(system_reg::INTENSITY, "u8", Some(&[Value::Num(0.0)]))
                .unwrap()
                .with_bounds(0, FieldBounds::new(0.0, 10.0)),
        );
        srv
    }

    #[test]
    fn get_queues_report() {
        let mut srv = service();
        srv.handle_packet(&command(CMD_GET_REG | system_reg::INTENSITY, &[]), 0);
        match srv.take_outgoing().as_slice() {
            [Outgoing::Report(p)] => {
                assert_eq!(p.service_command(), CMD_GET_REG | system_reg::INTENSITY);
                assert_eq!(p.payload(), &[0]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn clamped_set_without_change_is_silent() {
        let mut srv = service();
        srv.handle_packet(&command(CMD_SET_REG | system_reg::INTENSITY, &[50]), 1);
        assert_eq!(
            srv.take_notifications(),
            vec![Notification::RegisterChanged {
                service_index: 0,
                code: system_reg::INTENSITY
            }]
        );
        assert_eq!(srv.register(system_reg::INTENSITY).unwrap().data(), Some(&[10u8][..]));

        srv.handle_packet(&command(CMD_SET_REG | system_reg::INTENSITY, &[99]), 2);
        assert!(srv.take_notifications().is_empty());
    }

    #[test]
    fn status_code_change_sends_event() {
        let mut srv = service();
        assert_eq!(srv.status_code(), Some((0, 0)));
        assert!(srv.set_status_code(100, 0).unwrap());
        assert_eq!(
            srv.take_outgoing(),
            vec![Outgoing::Event {
                code: system_event::STATUS_CODE_CHANGED,
                data: vec![100, 0, 0, 0],
            }]
        );
        assert!(!srv.set_status_code(100, 0).unwrap());
    }

    #[test]
    fn command_handlers_run() {
        let mut srv = service();
        srv.add_command(
            0x80,
            Some(Box::new(|srv: &mut ServiceServer, pkt: &Packet| {
                srv.send_event(1, pkt.payload());
            })),
        );
        srv.add_command(0x81, None);
        srv.handle_packet(&command(0x80, &[7]), 0);
        srv.handle_packet(&command(0x80, &[8]), 0);
        srv.handle_packet(&command(0x81, &[]), 0);
        assert_eq!(srv.take_outgoing().len(), 2);
        assert!(srv.take_notifications().is_empty());

        srv.handle_packet(&command(0x90, &[]), 0);
        assert!(matches!(
            srv.take_notifications().as_slice(),
            [Notification::Command { .. }]
        ));
    }

    #[test]
    fn reports_are_not_commands() {
        let mut srv = service();
        let mut p = command(0x80, &[]);
        p.set_is_command(false);
        srv.handle_packet(&p, 0);
        assert!(srv.take_notifications().is_empty());
    }
}
