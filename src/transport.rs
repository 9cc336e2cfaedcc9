// Copyright 2026 Joyent, Inc.

//! Byte transports the engine runs on.
//!
//! The engine never touches a USB stack or a socket directly. HF2 needs
//! something that moves fixed size reports ([`ReportTransport`]) and a way to
//! find one ([`DeviceEnumerator`]); the bus needs something that moves whole
//! frames ([`FrameTransport`]).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{Error, Hf2Error};
use crate::hf2::Hf2ReportCodec;

/// Moves 64 byte HF2 reports to and from a device.
pub trait ReportTransport: Send + Sync {
    fn send_report(&self, report: Bytes) -> BoxFuture<'_, Result<(), Hf2Error>>;

    /// Next report from the device. An empty report means nothing was
    /// available yet.
    fn recv_report(&self) -> BoxFuture<'_, Result<Bytes, Hf2Error>>;

    /// Whether the underlying device still exists. A transport error on a
    /// detached device ends the connection; otherwise it is retried.
    fn is_attached(&self) -> bool;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Finds a device and opens a report transport to it.
pub trait DeviceEnumerator: Send + Sync {
    fn request_device(&self) -> BoxFuture<'_, Result<Arc<dyn ReportTransport>, Hf2Error>>;
}

/// Moves whole Jacdac frames.
pub trait FrameTransport: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>) -> BoxFuture<'_, Result<(), Error>>;

    /// Next frame, `None` once the peer is gone.
    fn recv_frame(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, Error>>;
}

/// One end of an in-memory frame link.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl LoopbackTransport {
    /// Two connected ends: frames sent on one are received on the other.
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let (atx, arx) = mpsc::unbounded_channel();
        let (btx, brx) = mpsc::unbounded_channel();
        (
            LoopbackTransport {
                tx: atx,
                rx: Mutex::new(brx),
            },
            LoopbackTransport {
                tx: btx,
                rx: Mutex::new(arx),
            },
        )
    }
}

impl FrameTransport for LoopbackTransport {
    fn send_frame(&self, frame: Vec<u8>) -> BoxFuture<'_, Result<(), Error>> {
        let res = self.tx.send(frame).map_err(|_| {
            Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer gone"))
        });
        futures::future::ready(res).boxed()
    }

    fn recv_frame(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, Error>> {
        async move { Ok(self.rx.lock().await.recv().await) }.boxed()
    }
}

/// Reports carried over any byte stream, framed with [`Hf2ReportCodec`].
pub struct StreamReportTransport<S> {
    reader: Mutex<FramedRead<ReadHalf<S>, Hf2ReportCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<S>, Hf2ReportCodec>>,
    attached: AtomicBool,
}

impl<S> StreamReportTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> StreamReportTransport<S> {
        let (r, w) = tokio::io::split(stream);
        StreamReportTransport {
            reader: Mutex::new(FramedRead::new(r, Hf2ReportCodec)),
            writer: Mutex::new(FramedWrite::new(w, Hf2ReportCodec)),
            attached: AtomicBool::new(true),
        }
    }
}

impl<S> ReportTransport for StreamReportTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn send_report(&self, report: Bytes) -> BoxFuture<'_, Result<(), Hf2Error>> {
        async move {
            let mut writer = self.writer.lock().await;
            writer.send(report).await.map_err(Hf2Error::from)
        }
        .boxed()
    }

    fn recv_report(&self) -> BoxFuture<'_, Result<Bytes, Hf2Error>> {
        async move {
            let mut reader = self.reader.lock().await;
            match reader.next().await {
                Some(res) => res.map_err(Hf2Error::from),
                None => {
                    self.attached.store(false, Ordering::SeqCst);
                    Err(Hf2Error::Disconnected)
                }
            }
        }
        .boxed()
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            self.attached.store(false, Ordering::SeqCst);
            let mut writer = self.writer.lock().await;
            let _ = writer.close().await;
        }
        .boxed()
    }
}

/// Hands out one pre-opened transport, once.
pub struct SingleDevice {
    device: std::sync::Mutex<Option<Arc<dyn ReportTransport>>>,
}

impl SingleDevice {
    pub fn new(device: Arc<dyn ReportTransport>) -> SingleDevice {
        SingleDevice {
            device: std::sync::Mutex::new(Some(device)),
        }
    }
}

impl DeviceEnumerator for SingleDevice {
    fn request_device(&self) -> BoxFuture<'_, Result<Arc<dyn ReportTransport>, Hf2Error>> {
        let device = crate::sync::lock(&self.device).take();
        futures::future::ready(device.ok_or(Hf2Error::Disconnected)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::block_on;

    use crate::hf2::HF2_REPORT_SIZE;

    #[tokio::test]
    async fn loopback_pair_delivers_both_ways() {
        let (a, b) = LoopbackTransport::pair();
        a.send_frame(vec![1, 2, 3]).await.unwrap();
        b.send_frame(vec![4]).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(a.recv_frame().await.unwrap(), Some(vec![4]));
        drop(b);
        assert_eq!(a.recv_frame().await.unwrap(), None);
        assert!(a.send_frame(vec![5]).await.is_err());
    }

    #[tokio::test]
    async fn stream_transport_pads_reports() {
        let (host, device) = tokio::io::duplex(1024);
        let host = StreamReportTransport::new(host);
        let device = StreamReportTransport::new(device);

        host.send_report(Bytes::from_static(&[0x42, 1, 2])).await.unwrap();
        let report = device.recv_report().await.unwrap();
        assert_eq!(report.len(), HF2_REPORT_SIZE);
        assert_eq!(&report[..3], &[0x42, 1, 2]);
        assert!(report[3..].iter().all(|b| *b == 0));

        device.close().await;
        drop(device);
        assert!(host.recv_report().await.is_err());
        assert!(!host.is_attached());
    }

    #[test]
    fn single_device_is_handed_out_once() {
        let (host, _device) = tokio::io::duplex(64);
        let enumerator = SingleDevice::new(Arc::new(StreamReportTransport::new(host)));
        assert!(block_on(enumerator.request_device()).is_ok());
        assert!(matches!(
            block_on(enumerator.request_device()),
            Err(Hf2Error::Disconnected)
        ));
    }
}
