//! In-process transport over tokio channels.
//!
//! `MemoryTransport::pair()` returns two connected ends. Each message sent
//! on one end is received whole on the other; dropping or closing an end
//! reads as a clean end of stream on its peer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportError};

static NEXT_PAIR_ID: AtomicU64 = AtomicU64::new(1);

pub struct MemoryTransport {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    /// Bytes already pulled off `rx` but not yet handed out by `read_chunk`.
    pending: Mutex<BytesMut>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let id = NEXT_PAIR_ID.fetch_add(1, Ordering::Relaxed);
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport::new(format!("memory-{}a", id), a_tx, a_rx),
            MemoryTransport::new(format!("memory-{}b", id), b_tx, b_rx),
        )
    }

    fn new(
        name: String,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        MemoryTransport {
            name,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            pending: Mutex::new(BytesMut::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether `close` has been called on this end.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn receive(&self) -> Result<Option<Bytes>, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            msg = rx.recv() => Ok(msg),
        }
    }

    async fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            match self.receive().await? {
                Some(msg) => pending.extend_from_slice(&msg),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(pending.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.advance(n);
        Ok(n)
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => tx
                .send(Bytes::copy_from_slice(data))
                .map_err(|_| TransportError::Eof),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.tx.lock().await.take();
        self.rx.lock().await.close();
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_arrive_whole_and_in_order() {
        let (a, b) = MemoryTransport::pair();
        a.send(b"one").await.unwrap();
        a.send(b"two").await.unwrap();
        assert_eq!(&b.receive().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&b.receive().await.unwrap().unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn closing_one_end_is_eof_for_the_other() {
        let (a, b) = MemoryTransport::pair();
        a.close().await;
        assert!(b.receive().await.unwrap().is_none());
        assert!(b.send(b"late").await.unwrap_err().is_eof());
        assert!(matches!(a.send(b"x").await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn read_chunk_splits_messages() {
        let (a, b) = MemoryTransport::pair();
        a.send(b"abcdef").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(b.read_chunk(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(b.read_chunk(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");

        drop(a);
        assert_eq!(b.read_chunk(&mut buf).await.unwrap(), 0);
    }
}
