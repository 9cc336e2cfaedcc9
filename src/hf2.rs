// Copyright 2026 Joyent, Inc.

//! HF2: commands and Jacdac frames over 64 byte USB reports.
//!
//! Every report starts with a byte holding the report kind in its top two
//! bits and the number of payload bytes that follow in the low six:
//!
//! ```text
//! 0             1                                                   64
//! +-------------+---------------------------------------------------+
//! | KIND | LEN  | LEN payload bytes, zero padded                    |
//! +-------------+---------------------------------------------------+
//! ```
//!
//! Body reports accumulate until a last report completes a message. Serial
//! reports carry debug text and never take part in reassembly.
//!
//! A command message is `u32 command, u16 sequence, u16 reserved, body`.
//! A response is `u16 sequence, u8 status, u8 info, body`. When the status
//! has the event bit set, the first four bytes are instead an event
//! identifier and the message is unsolicited.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::Hf2Config;
use crate::error::{Error, Hf2Error};
use crate::sync::{lock, OperationSerializer, ValueBuffer};
use crate::transport::{DeviceEnumerator, FrameTransport, ReportTransport};

pub const HF2_REPORT_SIZE: usize = 64;
pub const HF2_REPORT_PAYLOAD_SIZE: usize = HF2_REPORT_SIZE - 1;

pub const HF2_CMD_BININFO: u32 = 0x0001;
pub const HF2_CMD_INFO: u32 = 0x0002;
pub const HF2_CMD_RESET_INTO_APP: u32 = 0x0003;
pub const HF2_CMD_RESET_INTO_BOOTLOADER: u32 = 0x0004;
pub const HF2_CMD_DMESG: u32 = 0x0010;
pub const HF2_CMD_JDS_CONFIG: u32 = 0x0020;
pub const HF2_CMD_JDS_SEND: u32 = 0x0021;
pub const HF2_EV_JDS_PACKET: u32 = 0x0080_0020;

pub const HF2_MODE_BOOTLOADER: u32 = 0x01;
pub const HF2_MODE_USERSPACE: u32 = 0x02;

pub const HF2_FLAG_MASK: u8 = 0xc0;
pub const HF2_SIZE_MASK: u8 = 0x3f;

pub const HF2_STATUS_EVENT: u8 = 0x80;
/// Event identifiers overlay sequence and status, so they carry the event
/// status bit.
pub const HF2_EV_MASK: u32 = 0x0080_0000;

const HF2_OFF_CMD: usize = 0x0;
const HF2_OFF_CMD_SEQ: usize = 0x4;
const HF2_CMD_HEADER_SIZE: usize = 0x8;
const HF2_OFF_RESP_SEQ: usize = 0x0;
const HF2_OFF_RESP_STATUS: usize = 0x2;
const HF2_OFF_RESP_INFO: usize = 0x3;
const HF2_RESP_HEADER_SIZE: usize = 0x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Hf2ReportKind {
    Body = 0x00,
    Last = 0x40,
    SerialOut = 0x80,
    SerialErr = 0xc0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Hf2Status {
    Ok = 0x00,
    InvalidCommand = 0x01,
    ExecutionError = 0x02,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hf2Report {
    pub kind: Hf2ReportKind,
    pub payload: Bytes,
}

impl Hf2Report {
    /// `None` for an empty read.
    pub fn parse(buf: &[u8]) -> Option<Hf2Report> {
        let first = *buf.first()?;
        let kind = Hf2ReportKind::from_u8(first & HF2_FLAG_MASK)?;
        let len = ((first & HF2_SIZE_MASK) as usize).min(buf.len() - 1);
        Some(Hf2Report {
            kind,
            payload: Bytes::copy_from_slice(&buf[1..1 + len]),
        })
    }

    fn encode(kind: Hf2ReportKind, chunk: &[u8]) -> Bytes {
        let mut report = BytesMut::with_capacity(HF2_REPORT_SIZE);
        report.put_u8(kind as u8 | chunk.len() as u8);
        report.put_slice(chunk);
        report.resize(HF2_REPORT_SIZE, 0);
        report.freeze()
    }
}

/// Split a message into body reports and a final last report.
pub fn message_reports(msg: &[u8]) -> Vec<Bytes> {
    let chunks: Vec<&[u8]> = msg.chunks(HF2_REPORT_PAYLOAD_SIZE).collect();
    let n = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let kind = if i + 1 == n {
                Hf2ReportKind::Last
            } else {
                Hf2ReportKind::Body
            };
            Hf2Report::encode(kind, c)
        })
        .collect()
}

/// Debug text as serial reports.
pub fn serial_reports(text: &[u8], is_err: bool) -> Vec<Bytes> {
    let kind = if is_err {
        Hf2ReportKind::SerialErr
    } else {
        Hf2ReportKind::SerialOut
    };
    text.chunks(HF2_REPORT_PAYLOAD_SIZE)
        .map(|c| Hf2Report::encode(kind, c))
        .collect()
}

pub fn encode_command(cmd: u32, seq: u16, data: &[u8]) -> Bytes {
    let mut msg = BytesMut::with_capacity(HF2_CMD_HEADER_SIZE + data.len());
    msg.put_u32_le(cmd);
    msg.put_u16_le(seq);
    msg.put_u16_le(0);
    msg.put_slice(data);
    msg.freeze()
}

/// Command id, sequence number and body of a command message.
pub fn parse_command(msg: &[u8]) -> Option<(u32, u16, &[u8])> {
    if msg.len() < HF2_CMD_HEADER_SIZE {
        return None;
    }
    Some((
        LittleEndian::read_u32(&msg[HF2_OFF_CMD..HF2_OFF_CMD + 4]),
        LittleEndian::read_u16(&msg[HF2_OFF_CMD_SEQ..HF2_OFF_CMD_SEQ + 2]),
        &msg[HF2_CMD_HEADER_SIZE..],
    ))
}

pub fn encode_response(seq: u16, status: u8, info: u8, body: &[u8]) -> Bytes {
    let mut msg = BytesMut::with_capacity(HF2_RESP_HEADER_SIZE + body.len());
    msg.put_u16_le(seq);
    msg.put_u8(status);
    msg.put_u8(info);
    msg.put_slice(body);
    msg.freeze()
}

pub fn encode_event(id: u32, body: &[u8]) -> Bytes {
    let mut msg = BytesMut::with_capacity(4 + body.len());
    msg.put_u32_le(id);
    msg.put_slice(body);
    msg.freeze()
}

/// Splits a byte stream into 64 byte reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hf2ReportCodec;

impl Decoder for Hf2ReportCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HF2_REPORT_SIZE {
            buf.reserve(HF2_REPORT_SIZE - buf.len());
            return Ok(None);
        }
        Ok(Some(buf.split_to(HF2_REPORT_SIZE).freeze()))
    }
}

impl Encoder<Bytes> for Hf2ReportCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, buf: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > HF2_REPORT_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("report of {} bytes", item.len()),
            ));
        }
        buf.reserve(HF2_REPORT_SIZE);
        buf.put_slice(&item);
        buf.put_bytes(0, HF2_REPORT_SIZE - item.len());
        Ok(())
    }
}

pub type EventHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type SerialHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&Hf2Error) + Send + Sync>;

struct Shared {
    io: Arc<dyn ReportTransport>,
    cfg: Hf2Config,
    seq: AtomicU16,
    responses: ValueBuffer<Bytes, Hf2Error>,
    serializer: OperationSerializer<&'static str>,
    event_handlers: Mutex<HashMap<u32, EventHandler>>,
    serial_handler: Mutex<Option<SerialHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    log: Logger,
}

impl Shared {
    async fn send_message(&self, msg: &[u8]) -> Result<(), Hf2Error> {
        for report in message_reports(msg) {
            if self.is_closed() {
                return Err(Hf2Error::Disconnected);
            }
            self.io.send_report(report).await?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn await_response(&self, seq: u16) -> Result<Bytes, Hf2Error> {
        let mut skipped = 0;
        loop {
            let res = self
                .responses
                .take(Some(self.cfg.response_timeout()))
                .await?;
            let got = LittleEndian::read_u16(&res[HF2_OFF_RESP_SEQ..HF2_OFF_RESP_SEQ + 2]);
            if got != seq {
                skipped += 1;
                if skipped >= self.cfg.max_desync_retries {
                    error!(self.log, "out of sync"; "expected" => seq, "got" => got);
                    return Err(Hf2Error::Desync { expected: seq, got });
                }
                warn!(self.log, "message out of sync, will re-try";
                      "expected" => seq, "got" => got);
                continue;
            }

            let status = res[HF2_OFF_RESP_STATUS];
            let info = res[HF2_OFF_RESP_INFO];
            return match Hf2Status::from_u8(status) {
                Some(Hf2Status::Ok) => Ok(res.slice(HF2_RESP_HEADER_SIZE..)),
                Some(Hf2Status::InvalidCommand) => Err(Hf2Error::InvalidCommand { info }),
                Some(Hf2Status::ExecutionError) => Err(Hf2Error::ExecutionError { info }),
                None => Err(Hf2Error::Status { status, info }),
            };
        }
    }

    fn handle_report(&self, buf: &[u8], frames: &mut BytesMut) {
        let report = match Hf2Report::parse(buf) {
            Some(r) => r,
            None => return,
        };
        match report.kind {
            Hf2ReportKind::SerialOut => self.handle_serial(&report.payload, false),
            Hf2ReportKind::SerialErr => self.handle_serial(&report.payload, true),
            Hf2ReportKind::Body => frames.extend_from_slice(&report.payload),
            Hf2ReportKind::Last => {
                frames.extend_from_slice(&report.payload);
                let msg = frames.split().freeze();
                self.handle_message(msg);
            }
        }
    }

    fn handle_message(&self, msg: Bytes) {
        if msg.len() < HF2_RESP_HEADER_SIZE {
            warn!(self.log, "short message dropped"; "len" => msg.len());
            return;
        }
        if msg[HF2_OFF_RESP_STATUS] & HF2_STATUS_EVENT != 0 {
            self.handle_event(&msg);
        } else {
            self.responses.push(msg);
        }
    }

    fn handle_event(&self, msg: &[u8]) {
        let id = LittleEndian::read_u32(&msg[..4]);
        let handler = lock(&self.event_handlers).get(&id).cloned();
        match handler {
            Some(f) => f(&msg[4..]),
            None => debug!(self.log, "unhandled event"; "id" => format!("0x{:x}", id)),
        }
    }

    fn handle_serial(&self, data: &[u8], is_err: bool) {
        let text = String::from_utf8_lossy(data);
        let line = text.trim_end_matches(&['\r', '\n'][..]);
        if is_err {
            warn!(self.log, "serial"; "line" => line);
        } else {
            info!(self.log, "serial"; "line" => line);
        }
        let handler = lock(&self.serial_handler).clone();
        if let Some(f) = handler {
            f(line, is_err);
        }
    }

    fn report_error(&self, e: &Hf2Error) {
        let handler = lock(&self.error_handler).clone();
        if let Some(f) = handler {
            f(e);
        }
    }

    fn teardown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(true);
            self.responses.drain();
            lock(&self.event_handlers).clear();
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut frames = BytesMut::new();
    loop {
        if shared.is_closed() {
            break;
        }
        let res = tokio::select! {
            _ = shutdown.changed() => break,
            res = shared.io.recv_report() => res,
        };
        match res {
            Ok(buf) if buf.is_empty() || buf[0] == 0 => {
                tokio::time::sleep(shared.cfg.empty_read_backoff()).await;
            }
            Ok(buf) => shared.handle_report(&buf, &mut frames),
            Err(e) => {
                if !shared.io.is_attached() {
                    warn!(shared.log, "device gone"; "error" => %e);
                    shared.teardown();
                    shared.report_error(&e);
                    break;
                }
                error!(shared.log, "read failed"; "error" => %e);
                shared.report_error(&e);
                tokio::time::sleep(shared.cfg.error_backoff()).await;
            }
        }
    }
    debug!(shared.log, "read loop done");
}

/// One HF2 connection: a reader task feeding responses and events, plus
/// strictly sequential command/response exchanges.
#[derive(Clone)]
pub struct Hf2Proto {
    shared: Arc<Shared>,
}

impl Hf2Proto {
    /// Start reading from `io`. Must be called within a tokio runtime.
    pub fn new(io: Arc<dyn ReportTransport>, cfg: Hf2Config, log: Option<&Logger>) -> Hf2Proto {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("transport" => "hf2"));
        let (tx, rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            io,
            cfg,
            seq: AtomicU16::new(rand::random()),
            responses: ValueBuffer::new(),
            serializer: OperationSerializer::new(),
            event_handlers: Mutex::new(HashMap::new()),
            serial_handler: Mutex::new(None),
            error_handler: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: tx,
            log,
        });
        tokio::spawn(read_loop(Arc::clone(&shared), rx));
        Hf2Proto { shared }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Send command `cmd` and wait for its response body. Only one exchange
    /// is in flight at a time; later callers queue up behind it.
    pub async fn talk(&self, cmd: u32, data: &[u8]) -> Result<Bytes, Hf2Error> {
        let shared = &self.shared;
        shared
            .serializer
            .enqueue("talk", async move {
                if shared.is_closed() {
                    return Err(Hf2Error::Disconnected);
                }
                let seq = shared.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
                let msg = encode_command(cmd, seq, data);
                shared.send_message(&msg).await?;
                let res = shared.await_response(seq).await;
                if let Err(e) = &res {
                    debug!(shared.log, "hf2 error"; "cmd" => cmd, "error" => %e);
                }
                res
            })
            .await
    }

    /// Route event `id` to `handler`, replacing any previous handler.
    pub fn on_event<F>(&self, id: u32, handler: F) -> Result<(), Hf2Error>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        if id & HF2_EV_MASK == 0 {
            return Err(Hf2Error::InvalidEventId(id));
        }
        lock(&self.shared.event_handlers).insert(id, Arc::new(handler));
        Ok(())
    }

    pub fn on_serial<F>(&self, handler: F)
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        *lock(&self.shared.serial_handler) = Some(Arc::new(handler));
    }

    /// Called with read errors; they do not end the connection unless the
    /// device is gone.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Hf2Error) + Send + Sync + 'static,
    {
        *lock(&self.shared.error_handler) = Some(Arc::new(handler));
    }

    /// Receive Jacdac frames from the device.
    pub async fn on_jd_message<F>(&self, handler: F) -> Result<(), Hf2Error>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.on_event(HF2_EV_JDS_PACKET, handler)?;
        self.talk(HF2_CMD_JDS_CONFIG, &1u32.to_le_bytes()).await?;
        Ok(())
    }

    pub async fn send_jd_message(&self, frame: &[u8]) -> Result<(), Hf2Error> {
        self.talk(HF2_CMD_JDS_SEND, frame).await.map(|_| ())
    }

    /// Device log buffer.
    pub async fn dmesg(&self) -> Result<String, Hf2Error> {
        let buf = self.talk(HF2_CMD_DMESG, &[]).await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub async fn info(&self) -> Result<String, Hf2Error> {
        let buf = self.talk(HF2_CMD_INFO, &[]).await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Make sure the device runs its application, then log what it is.
    pub async fn post_connect(&self) -> Result<String, Hf2Error> {
        self.check_mode().await?;
        let info = self.info().await?;
        info!(self.shared.log, "connected"; "info" => &info);
        Ok(info)
    }

    async fn check_mode(&self) -> Result<(), Hf2Error> {
        let bininfo = self.talk(HF2_CMD_BININFO, &[]).await?;
        let mut word = [0u8; 4];
        let n = bininfo.len().min(4);
        word[..n].copy_from_slice(&bininfo[..n]);
        let mode = LittleEndian::read_u32(&word);
        debug!(self.shared.log, "device mode"; "mode" => mode);
        match mode {
            HF2_MODE_USERSPACE => Ok(()),
            HF2_MODE_BOOTLOADER => {
                info!(self.shared.log, "device in bootloader mode, resetting into application");
                if let Err(e) = self.talk(HF2_CMD_RESET_INTO_APP, &[]).await {
                    debug!(self.shared.log, "reset into app"; "error" => %e);
                }
                Err(Hf2Error::Bootloader)
            }
            m => Err(Hf2Error::UnknownMode(m)),
        }
    }

    /// Stop reading and fail every pending request with a connection
    /// reset. Calling it again does nothing.
    pub async fn disconnect(&self) {
        if self.shared.is_closed() {
            return;
        }
        self.shared.teardown();
        self.shared.io.close().await;
        debug!(self.shared.log, "disconnected");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Error,
}

/// Connection lifecycle on top of a device enumerator.
pub struct Hf2Transport {
    enumerator: Arc<dyn DeviceEnumerator>,
    cfg: Hf2Config,
    state: Mutex<ConnectionState>,
    proto: tokio::sync::Mutex<Option<Hf2Proto>>,
    log: Logger,
}

impl Hf2Transport {
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>, cfg: Hf2Config, log: Option<&Logger>) -> Hf2Transport {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Hf2Transport {
            enumerator,
            cfg,
            state: Mutex::new(ConnectionState::Disconnected),
            proto: tokio::sync::Mutex::new(None),
            log,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!(self.log, "connection state"; "from" => ?*current, "to" => ?state);
            *current = state;
        }
    }

    /// Connect, or return the live connection.
    pub async fn connect(&self) -> Result<Hf2Proto, Hf2Error> {
        let mut slot = self.proto.lock().await;
        if let Some(p) = slot.as_ref() {
            if !p.is_closed() {
                return Ok(p.clone());
            }
            *slot = None;
        }

        self.set_state(ConnectionState::Connecting);
        let io = match self.enumerator.request_device().await {
            Ok(io) => io,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };
        let proto = Hf2Proto::new(io, self.cfg.clone(), Some(&self.log));
        match proto.post_connect().await {
            Ok(_) => {
                self.set_state(ConnectionState::Ready);
                *slot = Some(proto.clone());
                Ok(proto)
            }
            Err(e) => {
                proto.disconnect().await;
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn fail(&self, e: &Hf2Error) {
        warn!(self.log, "connection failed"; "error" => %e);
        self.set_state(ConnectionState::Error);
        self.set_state(ConnectionState::Disconnected);
    }

    pub async fn disconnect(&self) {
        let proto = self.proto.lock().await.take();
        if let Some(p) = proto {
            p.disconnect().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Whether a connection is up, noticing a device that went away.
    pub async fn is_connected(&self) -> bool {
        let alive = matches!(self.proto.lock().await.as_ref(), Some(p) if !p.is_closed());
        if !alive && self.state() == ConnectionState::Ready {
            self.set_state(ConnectionState::Disconnected);
        }
        alive
    }
}

/// Jacdac frames over an HF2 connection.
pub struct Hf2FrameTransport {
    proto: Hf2Proto,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Hf2FrameTransport {
    pub async fn new(proto: Hf2Proto) -> Result<Hf2FrameTransport, Hf2Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        proto
            .on_jd_message(move |frame: &[u8]| {
                let _ = tx.send(frame.to_vec());
            })
            .await?;
        Ok(Hf2FrameTransport {
            proto,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn proto(&self) -> &Hf2Proto {
        &self.proto
    }
}

impl FrameTransport for Hf2FrameTransport {
    fn send_frame(&self, frame: Vec<u8>) -> BoxFuture<'_, Result<(), Error>> {
        async move { self.proto.send_jd_message(&frame).await.map_err(Error::from) }.boxed()
    }

    fn recv_frame(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, Error>> {
        async move { Ok(self.rx.lock().await.recv().await) }.boxed()
    }
}
