// Copyright 2026 Joyent, Inc.

//! The bus: one owner for the device registry and the hosted providers.
//!
//! Frames come in through [`Bus::process_frame`], are split into packets,
//! recorded in the registry, reported to listeners and offered to every
//! provider. Whatever the providers answer is queued as outgoing frames and
//! also dispatched locally, so hosted devices see each other. Time only
//! moves when the caller passes `now`; [`Bus::run`] does that from a tokio
//! interval.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use slog::{debug, info, o, trace, warn, Drain, Logger};
use tokio::sync::watch;

use crate::config::BusConfig;
use crate::device::{Device, DeviceId, DeviceRegistry, DeviceStatus};
use crate::error::Result;
use crate::frame::{frame_to_packets, is_large_frame};
use crate::packet::Packet;
use crate::server::{Notification, ServiceProvider};
use crate::transport::FrameTransport;

#[derive(Clone, Debug)]
pub enum BusEvent {
    /// Any packet but announcements.
    Packet(Packet),
    /// A device announced a new service table.
    DeviceAnnounce(Device),
    DeviceRestart(Device),
    DeviceLost(Device),
    DeviceDisconnected(Device),
    /// An event report, once per event counter.
    Event(Packet),
    /// Something a hosted device wants its host to know.
    Notification {
        device_id: DeviceId,
        notification: Notification,
    },
}

pub type Listener = Box<dyn FnMut(&BusEvent) + Send>;

pub struct Bus {
    cfg: BusConfig,
    tag: String,
    registry: DeviceRegistry,
    providers: Vec<ServiceProvider>,
    pending: VecDeque<Packet>,
    outgoing: VecDeque<Vec<u8>>,
    listeners: Vec<Listener>,
    last_announce: Option<u64>,
    log: Logger,
}

impl Bus {
    pub fn new(cfg: BusConfig, log: Option<&Logger>) -> Bus {
        let tag = format!("bus-{:08x}", rand::random::<u32>());
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("bus" => tag.clone()));
        Bus {
            registry: DeviceRegistry::new(Some(&log)),
            cfg,
            tag,
            providers: Vec::new(),
            pending: VecDeque::new(),
            outgoing: VecDeque::new(),
            listeners: Vec::new(),
            last_announce: None,
            log,
        }
    }

    /// Sender tag put on frames this bus produces.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn config(&self) -> &BusConfig {
        &self.cfg
    }

    /// Host a device on this bus. Returns its position for
    /// [`Bus::provider_mut`].
    pub fn add_provider(&mut self, provider: ServiceProvider) -> usize {
        info!(self.log, "hosting device";
              "device" => provider.short_id(),
              "services" => provider.services().len());
        self.providers.push(provider);
        self.providers.len() - 1
    }

    pub fn providers(&self) -> &[ServiceProvider] {
        &self.providers
    }

    pub fn provider_mut(&mut self, index: usize) -> Option<&mut ServiceProvider> {
        self.providers.get_mut(index)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.registry.devices()
    }

    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.registry.get(id)
    }

    pub fn device_of(&self, pkt: &Packet) -> Option<&Device> {
        self.registry.device_of(pkt)
    }

    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&BusEvent) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn on_packet<F>(&mut self, mut f: F)
    where
        F: FnMut(&Packet) + Send + 'static,
    {
        self.subscribe(move |ev| {
            if let BusEvent::Packet(p) = ev {
                f(p)
            }
        });
    }

    pub fn on_event<F>(&mut self, mut f: F)
    where
        F: FnMut(&Packet) + Send + 'static,
    {
        self.subscribe(move |ev| {
            if let BusEvent::Event(p) = ev {
                f(p)
            }
        });
    }

    pub fn on_device_announce<F>(&mut self, mut f: F)
    where
        F: FnMut(&Device) + Send + 'static,
    {
        self.subscribe(move |ev| {
            if let BusEvent::DeviceAnnounce(d) = ev {
                f(d)
            }
        });
    }

    pub fn on_device_restart<F>(&mut self, mut f: F)
    where
        F: FnMut(&Device) + Send + 'static,
    {
        self.subscribe(move |ev| {
            if let BusEvent::DeviceRestart(d) = ev {
                f(d)
            }
        });
    }

    pub fn on_device_lost<F>(&mut self, mut f: F)
    where
        F: FnMut(&Device) + Send + 'static,
    {
        self.subscribe(move |ev| {
            if let BusEvent::DeviceLost(d) = ev {
                f(d)
            }
        });
    }

    pub fn on_device_disconnected<F>(&mut self, mut f: F)
    where
        F: FnMut(&Device) + Send + 'static,
    {
        self.subscribe(move |ev| {
            if let BusEvent::DeviceDisconnected(d) = ev {
                f(d)
            }
        });
    }

    fn emit(&mut self, ev: BusEvent) {
        for l in self.listeners.iter_mut() {
            l(&ev);
        }
    }

    /// Ingest a frame from a transport. Frames tagged with our own sender
    /// tag and large frames are skipped. Returns the number of packets
    /// processed.
    pub fn process_frame(&mut self, frame: &[u8], sender: Option<&str>, now: u64) -> usize {
        if sender == Some(self.tag.as_str()) {
            trace!(self.log, "skipping own frame");
            return 0;
        }
        if is_large_frame(frame) {
            debug!(self.log, "skipping large frame"; "len" => frame.len());
            return 0;
        }
        let packets = frame_to_packets(frame, now, sender, false, &self.log);
        let n = packets.len();
        for pkt in packets {
            self.ingest(pkt, now);
        }
        self.pump(now);
        n
    }

    pub fn process_packet(&mut self, pkt: Packet, now: u64) {
        self.ingest(pkt, now);
        self.pump(now);
    }

    fn ingest(&mut self, mut pkt: Packet, now: u64) {
        if pkt.timestamp.is_none() {
            pkt.timestamp = Some(now);
        }
        trace!(self.log, "packet"; "pkt" => %pkt);

        if let Some(update) = self.registry.process_packet(&pkt, now) {
            let dev = self.registry.get(&pkt.device_id()).cloned();
            if let Some(dev) = dev {
                if update.restarted {
                    info!(self.log, "device restarted"; "device" => dev.short_id());
                    self.emit(BusEvent::DeviceRestart(dev.clone()));
                }
                if update.announced {
                    self.emit(BusEvent::DeviceAnnounce(dev));
                }
            }
        }

        if !pkt.is_announce() {
            self.emit(BusEvent::Packet(pkt.clone()));
        }
        if pkt.is_event() && !pkt.is_multi_command() {
            let accepted = match (pkt.event_counter(), self.registry.get_mut(&pkt.device_id())) {
                (Some(counter), Some(dev)) => dev.accept_event(counter),
                _ => false,
            };
            if accepted {
                self.emit(BusEvent::Event(pkt.clone()));
            } else {
                trace!(self.log, "duplicate event"; "pkt" => %pkt);
            }
        }

        for provider in self.providers.iter_mut() {
            provider.handle_packet(&mut pkt, now);
        }
    }

    /// Queue a packet from the host. It goes out on the next pump, which
    /// this call runs.
    pub fn send_packet(&mut self, pkt: Packet, now: u64) {
        self.pending.push_back(pkt);
        self.pump(now);
    }

    /// Move everything the providers produced into the outgoing queue and
    /// through local dispatch, until nothing new comes out.
    fn pump(&mut self, now: u64) {
        loop {
            let mut batch: Vec<Packet> = self.pending.drain(..).collect();
            let mut notes = Vec::new();
            for provider in self.providers.iter_mut() {
                batch.extend(provider.take_outgoing(now));
                let id = provider.device_id();
                notes.extend(provider.take_notifications().into_iter().map(|n| (id, n)));
            }
            for (device_id, notification) in notes {
                self.emit(BusEvent::Notification {
                    device_id,
                    notification,
                });
            }
            if batch.is_empty() {
                break;
            }

            for mut pkt in batch {
                pkt.finalize();
                let frame = pkt.to_buffer().to_vec();
                let local = frame_to_packets(&frame, now, Some(self.tag.as_str()), true, &self.log);
                self.outgoing.push_back(frame);
                for p in local {
                    self.ingest(p, now);
                }
            }
        }
    }

    /// Periodic work: self announcements, event resends and device status
    /// transitions.
    pub fn tick(&mut self, now: u64) {
        let due = self
            .last_announce
            .map_or(true, |t| now.saturating_sub(t) >= self.cfg.announce_interval_ms);
        if due {
            self.last_announce = Some(now);
            for provider in self.providers.iter_mut() {
                provider.handle_self_announce(now);
            }
        }

        for provider in self.providers.iter_mut() {
            if let Err(e) = provider.process_delayed(now) {
                warn!(self.log, "delayed send failed";
                      "device" => provider.short_id(), "error" => %e);
            }
        }

        for (id, status) in self.registry.poll_status(now, &self.cfg) {
            let dev = match self.registry.get(&id) {
                Some(d) => d.clone(),
                None => continue,
            };
            match status {
                DeviceStatus::Lost => {
                    debug!(self.log, "device lost"; "device" => dev.short_id());
                    self.emit(BusEvent::DeviceLost(dev));
                }
                DeviceStatus::Disconnected => {
                    info!(self.log, "device disconnected"; "device" => dev.short_id());
                    self.emit(BusEvent::DeviceDisconnected(dev));
                }
                DeviceStatus::Seen => (),
            }
        }

        self.pump(now);
    }

    /// Frames waiting for a transport, oldest first.
    pub fn take_outgoing_frames(&mut self) -> Vec<Vec<u8>> {
        self.outgoing.drain(..).collect()
    }

    /// Drive the bus over `transport` until `shutdown` flips or the peer
    /// goes away. Bus time starts at zero when this is called.
    pub async fn run(
        &mut self,
        transport: &dyn FrameTransport,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let start = Instant::now();
        let now = || start.elapsed().as_millis() as u64;
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.cfg.delayed_send_poll_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            for frame in self.take_outgoing_frames() {
                if let Err(e) = transport.send_frame(frame).await {
                    warn!(self.log, "send failed"; "error" => %e);
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => self.tick(now()),
                res = transport.recv_frame() => match res {
                    Ok(Some(frame)) => {
                        self.process_frame(&frame, None, now());
                    }
                    Ok(None) => {
                        info!(self.log, "transport closed");
                        break;
                    }
                    Err(e) => warn!(self.log, "receive failed"; "error" => %e),
                },
            }
        }

        for frame in self.take_outgoing_frames() {
            if transport.send_frame(frame).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
