//! TCP transport.
//!
//! TCP is a byte stream, so each message unit is length-prefixed:
//!
//! ```text
//! [0..4] : length (u32 BE)
//! [4..]  : message bytes (one muxchat frame)
//! ```
//!
//! Reads and writes both run under a deadline and race the close signal,
//! so a peer that stops reading cannot pin a sender or block `close`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Transport, TransportError};

/// Upper bound on the buffer reserved before a message body arrives.
const INITIAL_BODY_CAPACITY: usize = 64 * 1024;

pub struct TcpTransport {
    peer: String,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    max_payload: usize,
    read_deadline: Option<Duration>,
    write_deadline: Option<Duration>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Wrap `stream`. The write deadline starts out equal to the read
    /// deadline; see `with_write_deadline`.
    pub fn new(stream: TcpStream, max_payload: usize, read_deadline: Option<Duration>) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        TcpTransport {
            peer,
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            max_payload,
            read_deadline,
            write_deadline: read_deadline,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bound each write (`None` disables the bound).
    pub fn with_write_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.write_deadline = deadline;
        self
    }

    /// Run an I/O future under `deadline` and the close signal.
    async fn guarded<F, T>(&self, deadline: Option<Duration>, fut: F) -> Result<T, TransportError>
    where
        F: std::future::Future<Output = Result<T, TransportError>>,
    {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            res = async {
                match deadline {
                    Some(d) => match tokio::time::timeout(d, fut).await {
                        Ok(res) => res,
                        Err(_) => Err(TransportError::DeadlineExceeded(d)),
                    },
                    None => fut.await,
                }
            } => res,
        }
    }
}

/// Read one length-prefixed message. `Ok(None)` on EOF before a prefix.
pub(crate) async fn read_message<R>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(TransportError::PayloadTooLarge { len, max: max_payload });
    }

    // Grow with the bytes that actually arrive rather than trusting the
    // prefix for the allocation.
    let mut body = Vec::with_capacity(len.min(INITIAL_BODY_CAPACITY));
    let n = (&mut *reader).take(len as u64).read_to_end(&mut body).await?;
    if n < len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(Some(Bytes::from(body)))
}

async fn write_message(
    writer: &mut OwnedWriteHalf,
    len: u32,
    data: &[u8],
) -> Result<(), TransportError> {
    writer.write_all(&len.to_be_bytes()).await.map_err(map_write_error)?;
    writer.write_all(data).await.map_err(map_write_error)?;
    writer.flush().await.map_err(map_write_error)
}

/// Only an orderly end of stream is `Eof`. Resets, aborts and broken
/// pipes are real failures and stay `Io`.
fn map_write_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => TransportError::Eof,
        _ => TransportError::Io(e),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn receive(&self) -> Result<Option<Bytes>, TransportError> {
        let mut reader = self.reader.lock().await;
        let max_payload = self.max_payload;
        self.guarded(self.read_deadline, read_message(&mut *reader, max_payload))
            .await
    }

    async fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut reader = self.reader.lock().await;
        let read = async { reader.read(buf).await.map_err(TransportError::from) };
        self.guarded(self.read_deadline, read).await
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let len = u32::try_from(data.len()).map_err(|_| TransportError::PayloadTooLarge {
            len: data.len(),
            max: u32::MAX as usize,
        })?;

        let result = {
            let mut writer = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(TransportError::Closed),
                writer = self.writer.lock() => writer,
            };
            self.guarded(self.write_deadline, write_message(&mut *writer, len, data))
                .await
        };

        // A failed write may have left half a message on the wire.
        if let Err(e) = &result {
            if !matches!(e, TransportError::Closed) {
                debug!(peer = %self.peer, error = %e, "write failed, closing");
                self.close().await;
            }
        }
        result
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        // A send holding the writer sees the cancellation and lets go; the
        // half is shut down when the transport is dropped.
        match self.writer.try_lock() {
            Ok(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    debug!(peer = %self.peer, error = %e, "tcp shutdown failed");
                }
            }
            Err(_) => debug!(peer = %self.peer, "writer busy, skipping tcp shutdown"),
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair(max_payload: usize) -> (TcpTransport, TcpStream) {
        connected_pair_with(max_payload, None).await
    }

    async fn connected_pair_with(
        max_payload: usize,
        deadline: Option<Duration>,
    ) -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TcpTransport::new(server, max_payload, deadline), client)
    }

    /// Larger than any loopback socket buffer, so a write to a peer that
    /// never reads cannot complete.
    fn flood() -> Vec<u8> {
        vec![0u8; 64 << 20]
    }

    #[tokio::test]
    async fn length_prefixed_round_trip() {
        let (transport, mut client) = connected_pair(1024).await;

        client.write_all(&5u32.to_be_bytes()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let got = transport.receive().await.unwrap().unwrap();
        assert_eq!(&got[..], b"hello");

        transport.send(b"world").await.unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..4], &5u32.to_be_bytes());
        assert_eq!(&buf[4..], b"world");
    }

    #[tokio::test]
    async fn clean_close_is_eof() {
        let (transport, client) = connected_pair(1024).await;
        drop(client);
        assert!(transport.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected() {
        let (transport, mut client) = connected_pair(8).await;
        client.write_all(&9u32.to_be_bytes()).await.unwrap();
        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { len: 9, max: 8 }));
    }

    #[tokio::test]
    async fn close_interrupts_a_blocked_receive() {
        let (transport, _client) = connected_pair(1024).await;
        let transport = std::sync::Arc::new(transport);

        let reader = transport.clone();
        let pending = tokio::spawn(async move { reader.receive().await });
        tokio::task::yield_now().await;

        transport.close().await;
        transport.close().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(matches!(transport.send(b"x").await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let (transport, mut client) = connected_pair(1 << 20).await;
        client.write_all(&1000u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1u8; 10]).await.unwrap();
        drop(client);

        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn large_message_arrives_whole() {
        let (transport, mut client) = connected_pair(1 << 20).await;
        let body: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let writer = tokio::spawn(async move {
            client.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
            client.write_all(&body).await.unwrap();
            (client, body)
        });

        let got = transport.receive().await.unwrap().unwrap();
        let (_client, body) = writer.await.unwrap();
        assert_eq!(&got[..], &body[..]);
    }

    #[tokio::test]
    async fn write_to_stalled_peer_hits_deadline() {
        let (transport, _client) =
            connected_pair_with(1024, Some(Duration::from_millis(200))).await;

        let err = tokio::time::timeout(Duration::from_secs(5), transport.send(&flood()))
            .await
            .expect("send must be bounded by the deadline")
            .unwrap_err();
        assert!(matches!(err, TransportError::DeadlineExceeded(_)));

        // Half a message may be on the wire, so the transport is closed.
        assert!(matches!(transport.send(b"x").await, Err(TransportError::Closed)));
        assert!(matches!(transport.receive().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn close_is_not_blocked_by_a_stalled_send() {
        let (transport, _client) = connected_pair(1024).await;
        let transport = std::sync::Arc::new(transport);

        let sender = transport.clone();
        let pending = tokio::spawn(async move { sender.send(&flood()).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(1), transport.close())
            .await
            .expect("close must not wait for the writer");
        let err = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("stalled send must observe the close")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn reset_by_peer_is_not_eof() {
        let (transport, client) = connected_pair(1024).await;
        // Linger 0 makes the drop send RST instead of FIN.
        client.set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut first_err = None;
        for _ in 0..10 {
            if let Err(e) = transport.send(&[7u8; 1024]).await {
                first_err = Some(e);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let err = first_err.expect("writes to a reset peer must fail");
        assert!(matches!(err, TransportError::Io(_)), "got {:?}", err);
        assert!(!err.is_eof());
    }

    #[test]
    fn write_error_mapping() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
        ] {
            assert!(matches!(map_write_error(kind.into()), TransportError::Io(_)));
        }
        assert!(map_write_error(io::ErrorKind::UnexpectedEof.into()).is_eof());
    }
}
