// Copyright 2026 Joyent, Inc.

//! An in-process HF2 device. It answers the commands a host sends over any
//! [`ReportTransport`] and forwards Jacdac frames both ways, so the HF2
//! stack can be exercised without hardware.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use slog::{debug, o, warn, Drain, Logger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Hf2Error;
use crate::hf2::{
    encode_event, encode_response, message_reports, parse_command, serial_reports, Hf2Report,
    Hf2ReportKind, Hf2Status, HF2_CMD_BININFO, HF2_CMD_DMESG, HF2_CMD_INFO,
    HF2_CMD_JDS_CONFIG, HF2_CMD_JDS_SEND, HF2_CMD_RESET_INTO_APP,
    HF2_CMD_RESET_INTO_BOOTLOADER, HF2_EV_JDS_PACKET, HF2_MODE_BOOTLOADER, HF2_MODE_USERSPACE,
};
use crate::sync::lock;
use crate::transport::ReportTransport;

#[derive(Clone, Debug)]
pub struct SimulatorOptions {
    /// Answer to BININFO.
    pub mode: u32,
    pub info: String,
    pub dmesg: String,
    /// Printed on the serial channel before answering INFO.
    pub banner: Option<String>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        SimulatorOptions {
            mode: HF2_MODE_USERSPACE,
            info: String::from("Simulated HF2 device"),
            dmesg: String::new(),
            banner: None,
        }
    }
}

pub struct SimulatorHandle {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    sent: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    commands: Arc<Mutex<Vec<u32>>>,
    task: JoinHandle<()>,
}

impl SimulatorHandle {
    /// Hand a frame to the host as if it came off the bus. Dropped unless
    /// the host enabled forwarding with JDS_CONFIG.
    pub fn push_frame(&self, frame: Vec<u8>) {
        let _ = self.frames.send(frame);
    }

    /// Next frame the host sent with JDS_SEND.
    pub async fn next_sent_frame(&self) -> Option<Vec<u8>> {
        self.sent.lock().await.recv().await
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<u32> {
        lock(&self.commands).clone()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

struct Simulator {
    io: Arc<dyn ReportTransport>,
    opts: SimulatorOptions,
    forwarding: bool,
    sent: mpsc::UnboundedSender<Vec<u8>>,
    commands: Arc<Mutex<Vec<u32>>>,
    log: Logger,
}

impl Simulator {
    async fn send(&self, reports: Vec<Bytes>) -> Result<(), Hf2Error> {
        for r in reports {
            self.io.send_report(r).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: &[u8]) -> Result<(), Hf2Error> {
        let (cmd, seq, body) = match parse_command(msg) {
            Some(c) => c,
            None => {
                warn!(self.log, "short command"; "len" => msg.len());
                return Ok(());
            }
        };
        debug!(self.log, "command"; "cmd" => cmd, "seq" => seq);
        lock(&self.commands).push(cmd);

        let ok = Hf2Status::Ok as u8;
        let res = match cmd {
            HF2_CMD_BININFO => encode_response(seq, ok, 0, &self.opts.mode.to_le_bytes()),
            HF2_CMD_INFO => {
                if let Some(banner) = &self.opts.banner {
                    self.send(serial_reports(banner.as_bytes(), false)).await?;
                }
                encode_response(seq, ok, 0, self.opts.info.as_bytes())
            }
            HF2_CMD_DMESG => encode_response(seq, ok, 0, self.opts.dmesg.as_bytes()),
            HF2_CMD_RESET_INTO_APP => {
                self.opts.mode = HF2_MODE_USERSPACE;
                encode_response(seq, ok, 0, &[])
            }
            HF2_CMD_RESET_INTO_BOOTLOADER => {
                self.opts.mode = HF2_MODE_BOOTLOADER;
                encode_response(seq, ok, 0, &[])
            }
            HF2_CMD_JDS_CONFIG => {
                self.forwarding = body.first().map_or(false, |b| *b != 0);
                encode_response(seq, ok, 0, &[])
            }
            HF2_CMD_JDS_SEND => {
                let _ = self.sent.send(body.to_vec());
                encode_response(seq, ok, 0, &[])
            }
            _ => encode_response(seq, Hf2Status::InvalidCommand as u8, 0, &[]),
        };
        self.send(message_reports(&res)).await
    }

    async fn serve(mut self, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut buf = BytesMut::new();
        loop {
            let res = tokio::select! {
                res = self.io.recv_report() => match res {
                    Ok(report) => match Hf2Report::parse(&report) {
                        Some(r) if r.kind == Hf2ReportKind::Body => {
                            buf.extend_from_slice(&r.payload);
                            Ok(())
                        }
                        Some(r) if r.kind == Hf2ReportKind::Last => {
                            buf.extend_from_slice(&r.payload);
                            let msg = buf.split().freeze();
                            self.handle_message(&msg).await
                        }
                        _ => Ok(()),
                    },
                    Err(e) => Err(e),
                },
                frame = frames.recv() => match frame {
                    Some(f) if self.forwarding => {
                        self.send(message_reports(&encode_event(HF2_EV_JDS_PACKET, &f))).await
                    }
                    Some(_) => Ok(()),
                    None => break,
                },
            };
            if let Err(e) = res {
                debug!(self.log, "simulator done"; "error" => %e);
                break;
            }
        }
    }
}

/// Serve `io` from a new task until the host goes away.
pub fn spawn(io: Arc<dyn ReportTransport>, opts: SimulatorOptions, log: Option<&Logger>) -> SimulatorHandle {
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
        .new(o!("simulator" => opts.info.clone()));
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let commands = Arc::new(Mutex::new(Vec::new()));
    let sim = Simulator {
        io,
        opts,
        forwarding: false,
        sent: sent_tx,
        commands: Arc::clone(&commands),
        log,
    };
    let task = tokio::spawn(sim.serve(frames_rx));
    SimulatorHandle {
        frames: frames_tx,
        sent: tokio::sync::Mutex::new(sent_rx),
        commands,
        task,
    }
}
