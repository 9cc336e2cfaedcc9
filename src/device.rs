// Copyright 2026 Joyent, Inc.

//! Device registry and announcement lifecycle.
//!
//! Devices are created lazily by [`DeviceRegistry::get_or_insert`] the first
//! time a packet names them and are never removed. Whether a device is lost
//! or disconnected is derived from the time since it was last seen, so it
//! can be asked at any moment without a background timer.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use rand::RngCore;
use slog::{debug, info, o, Drain, Logger};

use crate::config::BusConfig;
use crate::constants::{
    CMD_EVENT_COUNTER_MASK, JD_ADVERTISEMENT_0_COUNTER_MASK, SRV_CONTROL,
};
use crate::error::PacketError;
use crate::packet::Packet;

/// 8 byte device identifier, displayed as 16 lowercase hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceId([u8; 8]);

impl DeviceId {
    pub const fn new(bytes: [u8; 8]) -> DeviceId {
        DeviceId(bytes)
    }

    pub fn random() -> DeviceId {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        DeviceId(bytes)
    }

    pub(crate) fn from_slice(slice: &[u8]) -> DeviceId {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&slice[..8]);
        DeviceId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Four character human readable name: two letters and two digits
    /// derived from a 30 bit FNV-1 hash of the identifier. Different
    /// devices may share a short id.
    pub fn short_id(&self) -> String {
        let h = hash30(&self.0);
        let mut s = String::with_capacity(4);
        s.push((b'A' + (h % 26) as u8) as char);
        s.push((b'A' + ((h / 26) % 26) as u8) as char);
        s.push((b'0' + ((h / (26 * 26)) % 10) as u8) as char);
        s.push((b'0' + ((h / (26 * 26 * 10)) % 10) as u8) as char);
        s
    }
}

fn fnv1(data: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in data {
        h = h.wrapping_mul(0x0100_0193) ^ b as u32;
    }
    h
}

fn hash30(data: &[u8]) -> u32 {
    let h = fnv1(data);
    (h ^ (h >> 30)) & ((1 << 30) - 1)
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceId({})", self)
    }
}

impl FromStr for DeviceId {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<DeviceId, PacketError> {
        let invalid = || PacketError::InvalidDeviceId(String::from(s));
        if s.len() != 16 || !s.is_ascii() {
            return Err(invalid());
        }
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| invalid())?;
        }
        Ok(DeviceId(bytes))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceStatus {
    Seen,
    Lost,
    Disconnected,
}

/// What changed in the registry because of one packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub created: bool,
    pub announced: bool,
    pub restarted: bool,
}

#[derive(Clone, Debug)]
pub struct Device {
    id: DeviceId,
    short_id: String,
    services: Option<Bytes>,
    pub last_seen: u64,
    pub last_service_update: Option<u64>,
    pub packet_count: u64,
    event_counter: Option<u8>,
    reported: DeviceStatus,
}

impl Device {
    fn new(id: DeviceId, now: u64) -> Device {
        Device {
            id,
            short_id: id.short_id(),
            services: None,
            last_seen: now,
            last_service_update: None,
            packet_count: 0,
            event_counter: None,
            reported: DeviceStatus::Seen,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.id
    }

    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    /// Raw advertised service table, `None` until the first announcement.
    pub fn services(&self) -> Option<&[u8]> {
        self.services.as_deref()
    }

    pub fn announced(&self) -> bool {
        self.services.as_ref().map_or(false, |s| !s.is_empty())
    }

    fn word0(&self) -> u32 {
        match &self.services {
            Some(s) if s.len() >= 4 => LittleEndian::read_u32(&s[..4]),
            _ => 0,
        }
    }

    pub fn restart_counter(&self) -> u8 {
        (self.word0() & JD_ADVERTISEMENT_0_COUNTER_MASK) as u8
    }

    pub fn announce_flags(&self) -> u16 {
        (self.word0() & 0xffff) as u16
    }

    pub fn service_count(&self) -> usize {
        self.services.as_ref().map_or(0, |s| s.len() >> 2)
    }

    /// Service class at `index`; index 0 is always the control service.
    pub fn service_class_at(&self, index: usize) -> Option<u32> {
        if index == 0 {
            return Some(SRV_CONTROL);
        }
        let services = self.services.as_ref()?;
        let off = index * 4;
        if off + 4 > services.len() {
            return None;
        }
        Some(LittleEndian::read_u32(&services[off..off + 4]))
    }

    pub fn service_classes(&self) -> Vec<u32> {
        (0..self.service_count().max(1))
            .filter_map(|i| self.service_class_at(i))
            .collect()
    }

    pub fn has_service(&self, service_class: u32) -> bool {
        if !self.announced() {
            return false;
        }
        service_class == SRV_CONTROL
            || self.service_classes().contains(&service_class)
    }

    pub fn status(&self, now: u64, cfg: &BusConfig) -> DeviceStatus {
        let elapsed = now.saturating_sub(self.last_seen);
        if elapsed > cfg.device_disconnected_delay_ms {
            DeviceStatus::Disconnected
        } else if elapsed > cfg.device_lost_delay_ms {
            DeviceStatus::Lost
        } else {
            DeviceStatus::Seen
        }
    }

    pub fn lost(&self, now: u64, cfg: &BusConfig) -> bool {
        now.saturating_sub(self.last_seen) > cfg.device_lost_delay_ms
    }

    pub fn disconnected(&self, now: u64, cfg: &BusConfig) -> bool {
        now.saturating_sub(self.last_seen) > cfg.device_disconnected_delay_ms
    }

    pub fn event_counter(&self) -> Option<u8> {
        self.event_counter
    }

    /// Decide whether an event carrying `counter` is new. Returns false for
    /// retransmissions of events that were already accepted and for events
    /// slightly ahead of the expected counter, which will arrive again once
    /// the missing ones have been retransmitted.
    pub fn accept_event(&mut self, counter: u8) -> bool {
        let mask = CMD_EVENT_COUNTER_MASK as u8;
        let expected = self.event_counter.unwrap_or(0).wrapping_add(1) & mask;
        let ahead = counter.wrapping_sub(expected) & mask;
        let behind = expected.wrapping_sub(counter) & mask;
        let old = behind < 60;
        let missed5 = ahead < 5;
        if ahead > 0 && (old || missed5) {
            return false;
        }
        self.event_counter = Some(counter);
        true
    }

    fn process_announcement(&mut self, pkt: &Packet, now: u64) -> DeviceUpdate {
        let mut update = DeviceUpdate::default();
        let data = pkt.payload();
        let w0 = self.word0();
        let w1 = if data.len() >= 4 {
            LittleEndian::read_u32(&data[..4])
        } else {
            0
        };

        let changed = match &self.services {
            Some(old) => !tail_eq(old, data, 4),
            None => true,
        };
        self.services = Some(Bytes::copy_from_slice(data));

        if w1 != 0
            && (w1 & JD_ADVERTISEMENT_0_COUNTER_MASK)
                < (w0 & JD_ADVERTISEMENT_0_COUNTER_MASK)
        {
            update.restarted = true;
        }
        if changed || update.restarted {
            self.last_service_update = Some(now);
        }
        update.announced = changed;
        update
    }
}

fn tail_eq(a: &[u8], b: &[u8], offset: usize) -> bool {
    a.len() == b.len() && a.get(offset..) == b.get(offset..)
}

/// All devices seen on one bus, keyed by identifier.
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Device>,
    log: Logger,
}

impl DeviceRegistry {
    pub fn new(log: Option<&Logger>) -> DeviceRegistry {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        DeviceRegistry {
            devices: HashMap::new(),
            log,
        }
    }

    /// The only way a device enters the registry.
    pub fn get_or_insert(&mut self, id: DeviceId, now: u64) -> (&mut Device, bool) {
        let mut created = false;
        let log = &self.log;
        let dev = self.devices.entry(id).or_insert_with(|| {
            created = true;
            debug!(log, "new device"; "device" => id.short_id(), "id" => %id);
            Device::new(id, now)
        });
        (dev, created)
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    /// Resolve the device a packet refers to.
    pub fn device_of(&self, pkt: &Packet) -> Option<&Device> {
        if pkt.is_multi_command() {
            None
        } else {
            self.devices.get(&pkt.device_id())
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Record a received packet. Multi commands name no device and are
    /// ignored.
    pub fn process_packet(&mut self, pkt: &Packet, now: u64) -> Option<DeviceUpdate> {
        if pkt.is_multi_command() {
            return None;
        }
        let ts = pkt.timestamp.unwrap_or(now);
        let (dev, created) = self.get_or_insert(pkt.device_id(), ts);
        dev.packet_count += 1;
        let mut update = DeviceUpdate {
            created,
            ..DeviceUpdate::default()
        };
        let mut service_count = 0;
        if pkt.is_report() {
            dev.last_seen = ts;
            dev.reported = DeviceStatus::Seen;
            if pkt.is_announce() {
                let ann = dev.process_announcement(pkt, ts);
                update.announced = ann.announced;
                update.restarted = ann.restarted;
                service_count = dev.service_count();
            }
        }
        if update.announced {
            info!(self.log, "device announced";
                  "device" => pkt.device_id().short_id(),
                  "services" => service_count);
        }
        Some(update)
    }

    /// Devices whose derived status got worse since the last poll.
    pub fn poll_status(&mut self, now: u64, cfg: &BusConfig) -> Vec<(DeviceId, DeviceStatus)> {
        let mut changes = Vec::new();
        for dev in self.devices.values_mut() {
            let status = dev.status(now, cfg);
            if status != dev.reported {
                if status != DeviceStatus::Seen {
                    changes.push((dev.id, status));
                }
                dev.reported = status;
            }
        }
        changes.sort();
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::constants::{CMD_ADVERTISEMENT_DATA, SRV_BUTTON};

    fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn id() -> DeviceId {
        "0123456789abcdef".parse().unwrap()
    }

    fn announce(restart: u32, classes: &[u32]) -> Packet {
        let mut data = Vec::new();
        data.extend_from_slice(&(restart | 0x100).to_le_bytes());
        for c in classes {
            data.extend_from_slice(&c.to_le_bytes());
        }
        Packet::encode(CMD_ADVERTISEMENT_DATA, 0, id(), 0, &data).unwrap()
    }

    #[test]
    fn device_id_hex_round_trip() {
        let id = id();
        assert_eq!(id.to_string(), "0123456789abcdef");
        assert!("0123".parse::<DeviceId>().is_err());
        assert!("zz23456789abcdef".parse::<DeviceId>().is_err());
    }

    #[test]
    fn short_id_shape() {
        let s = id().short_id();
        assert_eq!(s.len(), 4);
        let c: Vec<char> = s.chars().collect();
        assert!(c[0].is_ascii_uppercase() && c[1].is_ascii_uppercase());
        assert!(c[2].is_ascii_digit() && c[3].is_ascii_digit());
        assert_eq!(s, id().short_id());
    }

    #[test]
    fn unchanged_announce_keeps_service_update_time() {
        let mut reg = DeviceRegistry::new(Some(&discard()));
        let u = reg.process_packet(&announce(1, &[SRV_BUTTON]), 100).unwrap();
        assert!(u.created && u.announced);
        assert_eq!(reg.get(&id()).unwrap().last_service_update, Some(100));

        // restart counter moves forward, service table is the same
        let u = reg.process_packet(&announce(2, &[SRV_BUTTON]), 600).unwrap();
        assert!(!u.announced && !u.restarted);
        let dev = reg.get(&id()).unwrap();
        assert_eq!(dev.last_service_update, Some(100));
        assert_eq!(dev.last_seen, 600);

        let u = reg
            .process_packet(&announce(3, &[SRV_BUTTON, SRV_BUTTON]), 1100)
            .unwrap();
        assert!(u.announced);
        let dev = reg.get(&id()).unwrap();
        assert_eq!(dev.last_service_update, Some(1100));
        assert_eq!(dev.service_classes(), vec![SRV_CONTROL, SRV_BUTTON, SRV_BUTTON]);
        assert!(dev.has_service(SRV_BUTTON));
    }

    #[test]
    fn restart_is_detected() {
        let mut reg = DeviceRegistry::new(Some(&discard()));
        reg.process_packet(&announce(5, &[SRV_BUTTON]), 0);
        let u = reg.process_packet(&announce(1, &[SRV_BUTTON]), 10).unwrap();
        assert!(u.restarted);
        assert_eq!(reg.get(&id()).unwrap().restart_counter(), 1);
    }

    #[test]
    fn commands_do_not_refresh_last_seen() {
        let mut reg = DeviceRegistry::new(Some(&discard()));
        reg.process_packet(&announce(1, &[]), 0);
        let mut cmd = Packet::encode(0x80, 0, id(), 1, &[]).unwrap();
        cmd.set_is_command(true);
        reg.process_packet(&cmd, 1000);
        assert_eq!(reg.get(&id()).unwrap().last_seen, 0);
        assert_eq!(reg.get(&id()).unwrap().packet_count, 2);
    }

    #[test]
    fn lost_and_disconnected_are_derived() {
        let cfg = BusConfig::default();
        let mut reg = DeviceRegistry::new(Some(&discard()));
        reg.process_packet(&announce(1, &[]), 1000);
        let dev = reg.get(&id()).unwrap();
        assert!(dev.lost(3000, &cfg));
        assert!(!dev.disconnected(3000, &cfg));
        assert_eq!(dev.status(3000, &cfg), DeviceStatus::Lost);
        assert_eq!(dev.status(7000, &cfg), DeviceStatus::Disconnected);

        assert_eq!(reg.poll_status(2000, &cfg), vec![]);
        assert_eq!(reg.poll_status(3000, &cfg), vec![(id(), DeviceStatus::Lost)]);
        assert_eq!(reg.poll_status(3100, &cfg), vec![]);
        assert_eq!(
            reg.poll_status(7000, &cfg),
            vec![(id(), DeviceStatus::Disconnected)]
        );
        // still there, just derived as disconnected
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_events_are_rejected() {
        let mut dev = Device::new(id(), 0);
        assert!(dev.accept_event(1));
        assert!(!dev.accept_event(1));
        assert!(dev.accept_event(2));
        assert!(!dev.accept_event(2));
        // one missed event: wait for the retransmission of 3
        assert!(!dev.accept_event(4));
        assert!(dev.accept_event(3));
        assert!(dev.accept_event(4));
    }

    #[test]
    fn event_counter_wraps() {
        let mut dev = Device::new(id(), 0);
        dev.event_counter = Some(127);
        assert!(dev.accept_event(0));
        assert!(!dev.accept_event(0));
    }
}
