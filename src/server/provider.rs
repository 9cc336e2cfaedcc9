// Copyright 2026 Joyent, Inc.

use std::collections::VecDeque;

use slog::{debug, o, warn, Drain, Logger};

use crate::constants::{
    CMD_EVENT_COUNTER_MASK, CMD_EVENT_COUNTER_POS, CMD_EVENT_MASK,
    JD_MAX_SERVICES, JD_SERVICE_INDEX_CRC_ACK, system_reg,
};
use crate::device::DeviceId;
use crate::error::{PacketError, Result};
use crate::packet::Packet;
use crate::server::control::{ControlRequest, ControlServer};
use crate::server::service::{Outgoing, ServiceServer};
use crate::server::Notification;

#[derive(Clone, Debug)]
pub struct ProviderOptions {
    /// Random when not given.
    pub device_id: Option<DeviceId>,
    pub description: String,
    /// Expose the control service `reset_in` watchdog register.
    pub reset_in: bool,
    /// Extra sends of every event, relative to the first one.
    pub event_resend_delays_ms: Vec<u64>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        ProviderOptions {
            device_id: None,
            description: String::from("Simulated"),
            reset_in: false,
            event_resend_delays_ms: vec![20, 100],
        }
    }
}

#[derive(Debug)]
struct DelayedPacket {
    due: u64,
    pkt: Packet,
}

/// A device made of hosted services.
#[derive(Debug)]
pub struct ServiceProvider {
    device_id: DeviceId,
    control: ControlServer,
    services: Vec<ServiceServer>,
    restart_counter: u8,
    packet_count: u32,
    event_counter: Option<u8>,
    resend_delays: Vec<u64>,
    delayed: VecDeque<DelayedPacket>,
    outbox: VecDeque<Packet>,
    notifications: VecDeque<Notification>,
    log: Logger,
}

impl ServiceProvider {
    pub fn new(
        services: Vec<ServiceServer>,
        options: ProviderOptions,
        log: Option<&Logger>,
    ) -> ServiceProvider {
        let device_id = options.device_id.unwrap_or_else(DeviceId::random);
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("host" => device_id.short_id()));

        let mut services = services;
        if services.len() + 1 > JD_MAX_SERVICES {
            warn!(log, "dropping services";
                  "count" => services.len() + 1, "max" => JD_MAX_SERVICES);
            services.truncate(JD_MAX_SERVICES - 1);
        }
        let mut control = ControlServer::new(&options.description, options.reset_in);
        control.attach(&log, 0);
        for (i, srv) in services.iter_mut().enumerate() {
            srv.attach((i + 1) as u8, &log);
        }

        ServiceProvider {
            device_id,
            control,
            services,
            restart_counter: 0,
            packet_count: 0,
            event_counter: None,
            resend_delays: options.event_resend_delays_ms,
            delayed: VecDeque::new(),
            outbox: VecDeque::new(),
            notifications: VecDeque::new(),
            log,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn short_id(&self) -> String {
        self.device_id.short_id()
    }

    pub fn control(&self) -> &ControlServer {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut ControlServer {
        &mut self.control
    }

    /// Service at `index`, the control service being index 0.
    pub fn service(&self, index: u8) -> Option<&ServiceServer> {
        match index {
            0 => Some(self.control.service()),
            i => self.services.get(i as usize - 1),
        }
    }

    pub fn service_mut(&mut self, index: u8) -> Option<&mut ServiceServer> {
        match index {
            0 => Some(self.control.service_mut()),
            i => self.services.get_mut(i as usize - 1),
        }
    }

    /// Hosted services, without the control service.
    pub fn services(&self) -> &[ServiceServer] {
        &self.services
    }

    pub fn service_classes(&self) -> Vec<u32> {
        self.services.iter().map(|s| s.service_class()).collect()
    }

    pub fn restart_counter(&self) -> u8 {
        self.restart_counter
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn event_counter(&self) -> Option<u8> {
        self.event_counter
    }

    /// Next event command id for `event_code`. The counter is shared by all
    /// services of the device and wraps at 128.
    pub fn create_event_cmd(&mut self, event_code: u16) -> std::result::Result<u16, PacketError> {
        if event_code >> 8 != 0 {
            return Err(PacketError::InvalidEventCode(event_code));
        }
        let counter = (self.event_counter.unwrap_or(0) as u16 + 1) & CMD_EVENT_COUNTER_MASK;
        self.event_counter = Some(counter as u8);
        Ok(CMD_EVENT_MASK | (counter << CMD_EVENT_COUNTER_POS) | event_code)
    }

    /// Address `pkt` from this device and queue it.
    pub fn send_packet(&mut self, mut pkt: Packet) -> Result<()> {
        self.packet_count = self.packet_count.wrapping_add(1);
        pkt.set_device_id(self.device_id)?;
        self.outbox.push_back(pkt);
        Ok(())
    }

    /// Send an event now, and again after each configured resend delay.
    pub fn send_event(&mut self, service_index: u8, event_code: u8, data: &[u8], now: u64) -> Result<()> {
        let cmd = self.create_event_cmd(event_code as u16)?;
        let mut pkt = Packet::from_cmd(cmd, data)?;
        pkt.set_service_index(service_index);
        self.send_packet(pkt.clone())?;
        let delays = self.resend_delays.clone();
        for delay in delays {
            self.delayed_send(pkt.clone(), now + delay);
        }
        Ok(())
    }

    /// Queue `pkt` to be sent once the bus clock reaches `due`.
    pub fn delayed_send(&mut self, pkt: Packet, due: u64) {
        let pos = self
            .delayed
            .iter()
            .position(|d| d.due > due)
            .unwrap_or(self.delayed.len());
        self.delayed.insert(pos, DelayedPacket { due, pkt });
    }

    pub fn next_delayed_due(&self) -> Option<u64> {
        self.delayed.front().map(|d| d.due)
    }

    /// Send every delayed packet that is due. On failure the remaining
    /// queue is dropped.
    pub fn process_delayed(&mut self, now: u64) -> Result<()> {
        while self.delayed.front().map_or(false, |d| d.due <= now) {
            if let Some(d) = self.delayed.pop_front() {
                if let Err(e) = self.send_packet(d.pkt) {
                    self.delayed.clear();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Route a packet seen on the bus. An ack request addressed to this
    /// device is answered and then cleared on `pkt`.
    pub fn handle_packet(&mut self, pkt: &mut Packet, now: u64) {
        let for_me = !pkt.is_multi_command() && pkt.device_id() == self.device_id;
        if pkt.requires_ack() && for_me {
            pkt.set_requires_ack(false);
            let mut ack = Packet::only_header(pkt.crc());
            ack.set_service_index(JD_SERVICE_INDEX_CRC_ACK);
            if let Err(e) = self.send_packet(ack) {
                warn!(self.log, "unable to ack"; "error" => %e);
            }
        }

        if let Some(class) = pkt.multicommand_class() {
            if !pkt.is_command() {
                return;
            }
            let indices: Vec<u8> = (0..=self.services.len() as u8)
                .filter(|i| self.service(*i).map(|s| s.service_class()) == Some(class))
                .collect();
            for index in indices {
                match pkt.clone_for_device(self.device_id, index) {
                    Ok(direct) => self.dispatch(&direct, now),
                    Err(e) => warn!(self.log, "bad multi command"; "error" => %e),
                }
            }
        } else if for_me {
            // reports with our id come from ourselves, or an impostor
            if pkt.is_command() {
                self.dispatch(pkt, now);
            }
        }
    }

    fn dispatch(&mut self, pkt: &Packet, now: u64) {
        let index = pkt.service_index();
        if index == 0 {
            match self.control.handle_packet(pkt, now) {
                Some(ControlRequest::Announce) => self.announce(now),
                Some(ControlRequest::Reset) => self.reset(),
                None => (),
            }
        } else if let Some(srv) = self.services.get_mut(index as usize - 1) {
            srv.handle_packet(pkt, now);
        } else {
            debug!(self.log, "no such service"; "index" => index);
        }
    }

    fn announce(&mut self, now: u64) {
        let classes = self.service_classes();
        match self
            .control
            .announce(self.restart_counter, self.packet_count, &classes, now)
        {
            Ok(pkt) => {
                if let Err(e) = self.send_packet(pkt) {
                    warn!(self.log, "announce failed"; "error" => %e);
                }
            }
            Err(e) => warn!(self.log, "announce failed"; "error" => %e),
        }
    }

    /// Periodic announcement: bump the restart counter (it saturates at
    /// 15), announce, report non zero status codes and start counting
    /// packets again.
    pub fn handle_self_announce(&mut self, now: u64) {
        if self.restart_counter < 0xf {
            self.restart_counter += 1;
        }
        self.announce(now);
        for srv in self.services.iter_mut() {
            if srv.status_code().map_or(false, |c| c != (0, 0)) {
                if let Err(e) = srv.send_register(system_reg::STATUS_CODE) {
                    warn!(self.log, "status report failed"; "error" => %e);
                }
            }
        }
        self.packet_count = 0;

        if self.control.reset_in_expired(now) {
            debug!(self.log, "reset_in expired");
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.restart_counter = 0;
        self.packet_count = 0;
        self.control.reset();
        for srv in self.services.iter_mut() {
            srv.reset();
        }
        self.notifications.push_back(Notification::Reset);
    }

    fn flush_services(&mut self, now: u64) {
        let mut pending = Vec::new();
        for index in 0..=self.services.len() as u8 {
            if let Some(srv) = self.service_mut(index) {
                pending.push((index, srv.take_outgoing()));
                let notes = srv.take_notifications();
                self.notifications.extend(notes);
            }
        }
        for (index, outgoing) in pending {
            for out in outgoing {
                let res = match out {
                    Outgoing::Report(mut pkt) => {
                        pkt.set_service_index(index);
                        self.send_packet(pkt)
                    }
                    Outgoing::Event { code, data } => self.send_event(index, code, &data, now),
                };
                if let Err(e) = res {
                    warn!(self.log, "dropping packet"; "service" => index, "error" => %e);
                }
            }
        }
    }

    /// Packets ready for the bus, in send order.
    pub fn take_outgoing(&mut self, now: u64) -> Vec<Packet> {
        self.flush_services(now);
        self.outbox.drain(..).collect()
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        for index in 0..=self.services.len() as u8 {
            if let Some(srv) = self.service_mut(index) {
                let notes = srv.take_notifications();
                self.notifications.extend(notes);
            }
        }
        self.notifications.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use slog::o;

    use crate::constants::*;
    use crate::pack::Value;
    use crate::server::register::{FieldBounds, RegisterServer};

    const ME: DeviceId = DeviceId::new([1, 2, 3, 4, 5, 6, 7, 8]);

    fn provider() -> ServiceProvider {
        let mut button = ServiceServer::new(SRV_BUTTON);
        button.add_register(
            RegisterServer::new(system_reg::READING, "u16", Some(&[Value::Num(0.0)])).unwrap(),
        );
        button.add_register(
            RegisterServer::new(system_reg::INTENSITY, "u8", Some(&[Value::Num(0.0)]))
                .unwrap()
                .with_bounds(0, FieldBounds::new(0.0, 100.0)),
        );
        let log = Logger::root(slog::Discard, o!());
        ServiceProvider::new(
            vec![button],
            ProviderOptions {
                device_id: Some(ME),
                ..ProviderOptions::default()
            },
            Some(&log),
        )
    }

    fn command(cmd: u16, index: u8, payload: &[u8]) -> Packet {
        Packet::encode(cmd, JD_FRAME_FLAG_COMMAND, ME, index, payload).unwrap()
    }

    #[test]
    fn event_counters_increment_and_wrap() {
        let mut p = provider();
        for i in 1..=130u16 {
            let cmd = p.create_event_cmd(2).unwrap();
            assert_eq!(cmd & 0xff, 2);
            assert_eq!((cmd >> 8) & 0x7f, i % 128);
            assert_ne!(cmd & 0x8000, 0);
        }
        assert_eq!(
            p.create_event_cmd(0x100).unwrap_err(),
            PacketError::InvalidEventCode(0x100)
        );
    }

    #[test]
    fn events_are_sent_three_times() {
        let mut p = provider();
        p.send_event(1, system_event::ACTIVE, &[], 1000).unwrap();
        let first = p.take_outgoing(1000);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].event_counter(), Some(1));
        assert_eq!(first[0].device_id(), ME);

        p.process_delayed(1019).unwrap();
        assert!(p.take_outgoing(1019).is_empty());
        p.process_delayed(1020).unwrap();
        let second = p.take_outgoing(1020);
        assert_eq!(second, first);
        assert_eq!(p.next_delayed_due(), Some(1100));
        p.process_delayed(2000).unwrap();
        assert_eq!(p.take_outgoing(2000), first);
        assert_eq!(p.next_delayed_due(), None);
    }

    #[test]
    fn delayed_queue_is_sorted() {
        let mut p = provider();
        p.delayed_send(Packet::only_header(3), 30);
        p.delayed_send(Packet::only_header(1), 10);
        p.delayed_send(Packet::only_header(2), 20);
        p.process_delayed(100).unwrap();
        let cmds: Vec<u16> = p.take_outgoing(100).iter().map(|p| p.service_command()).collect();
        assert_eq!(cmds, vec![1, 2, 3]);
    }

    #[test]
    fn ack_is_sent_once() {
        let mut p = provider();
        let mut pkt = command(CMD_GET_REG | system_reg::READING, 1, &[]);
        pkt.set_requires_ack(true);
        pkt.finalize();
        let crc = pkt.crc();
        p.handle_packet(&mut pkt, 0);
        assert!(!pkt.requires_ack());
        p.handle_packet(&mut pkt, 0);

        let out = p.take_outgoing(0);
        let acks: Vec<&Packet> = out.iter().filter(|p| p.is_crc_ack()).collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].service_command(), crc);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn multi_command_reaches_matching_services() {
        let mut p = provider();
        let mut pkt = Packet::from_cmd(CMD_SET_REG | system_reg::INTENSITY, &[250]).unwrap();
        pkt.set_multi_command(SRV_BUTTON);
        p.handle_packet(&mut pkt, 5);
        let srv = p.service(1).unwrap();
        assert_eq!(srv.register(system_reg::INTENSITY).unwrap().data(), Some(&[100u8][..]));
        assert_eq!(
            p.take_notifications(),
            vec![Notification::RegisterChanged {
                service_index: 1,
                code: system_reg::INTENSITY
            }]
        );
    }

    #[test]
    fn foreign_and_report_packets_are_ignored() {
        let mut p = provider();
        let mut other = Packet::encode(
            CMD_SET_REG | system_reg::INTENSITY,
            JD_FRAME_FLAG_COMMAND,
            DeviceId::default(),
            1,
            &[5],
        )
        .unwrap();
        p.handle_packet(&mut other, 0);
        let mut report = command(CMD_SET_REG | system_reg::INTENSITY, 1, &[5]);
        report.set_is_command(false);
        p.handle_packet(&mut report, 0);
        assert!(p.take_notifications().is_empty());
        assert!(p.take_outgoing(0).is_empty());
    }

    #[test]
    fn self_announce() {
        let mut p = provider();
        p.send_packet(Packet::only_header(0x80)).unwrap();
        p.send_packet(Packet::only_header(0x80)).unwrap();
        p.take_outgoing(0);
        for _ in 0..20 {
            p.handle_self_announce(0);
        }
        assert_eq!(p.restart_counter(), 0xf);
        assert_eq!(p.packet_count(), 0);

        let mut q = provider();
        q.send_packet(Packet::only_header(0x80)).unwrap();
        q.handle_self_announce(0);
        let out = q.take_outgoing(0);
        let ann = out.last().unwrap();
        assert_eq!(ann.service_command(), control_cmd::SERVICES);
        assert_eq!(ann.service_index(), 0);
        let values = ann.unpack("u16 u8 x[1] u32[]").unwrap();
        assert_eq!(values[0], Value::Num((1 | 0x20 | 0x100) as f64));
        // one packet before plus the announcement itself
        assert_eq!(values[1], Value::Num(2.0));
        assert_eq!(values[2], Value::List(vec![Value::Num(SRV_BUTTON as f64)]));
    }

    #[test]
    fn status_code_change_goes_out_as_event() {
        let mut p = provider();
        p.service_mut(1).unwrap().set_status_code(3, 0).unwrap();
        let out = p.take_outgoing(0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_code(), Some(system_event::STATUS_CODE_CHANGED));
        assert_eq!(out[0].service_index(), 1);
        assert_eq!(p.next_delayed_due(), Some(20));
    }

    #[test]
    fn reset_command() {
        let mut p = provider();
        p.handle_self_announce(0);
        let mut pkt = command(CMD_SET_REG | system_reg::INTENSITY, 1, &[42]);
        p.handle_packet(&mut pkt, 0);
        let mut reset = command(control_cmd::RESET, 0, &[]);
        p.handle_packet(&mut reset, 0);
        assert_eq!(p.restart_counter(), 0);
        let srv = p.service(1).unwrap();
        assert_eq!(srv.register(system_reg::INTENSITY).unwrap().data(), Some(&[0u8][..]));
        assert!(p.take_notifications().contains(&Notification::Reset));
    }
}
