use std::{
    io::IoSlice,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{
    TaskSupervisor,
    error::{Error, ErrorKind, Result},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Write side of one long-lived TCP connection.
///
/// Frames handed to [`send`](Self::send) are queued and written in issue order
/// by a dedicated send loop, so callers never touch the socket directly.
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    sender: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl Connection {
    /// Splits `stream`, starts its send loop under `supervisor` and returns the
    /// connection together with a reader for the inbound half.
    pub(crate) fn open(
        stream: TcpStream,
        peer: SocketAddr,
        supervisor: &TaskSupervisor,
        channel_capacity: usize,
        max_frame_size: usize,
    ) -> (Arc<Self>, FrameReader) {
        let _ = stream.set_nodelay(true);
        let (recv_stream, send_stream) = stream.into_split();
        let (sender, receiver) = mpsc::channel(channel_capacity.max(1));

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            sender,
            closed: supervisor.child_token(),
        });

        supervisor.spawn({
            let conn = conn.clone();
            async move {
                tokio::select! {
                    () = conn.closed() => {}
                    r = Self::start_send_loop(send_stream, receiver) => {
                        if let Err(e) = r {
                            tracing::error!("send loop for {} failed: {e}", conn.peer);
                        }
                        conn.close();
                    }
                }
            }
        });

        let reader = FrameReader {
            recv_stream,
            buffer: BytesMut::with_capacity(64 << 10),
            scanned: 0,
            max_frame_size,
        };
        (conn, reader)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Queues one encoded frame for writing.
    ///
    /// # Errors
    ///
    /// Fails with `TcpSendMsgFailed` once the connection is closed.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::new(
                ErrorKind::TcpSendMsgFailed,
                format!("connection to {} is closed", self.peer),
            ));
        }
        self.sender
            .send(bytes)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpSendMsgFailed, e.to_string()))
    }

    pub(crate) async fn send_ping(&self) -> Result<()> {
        self.send(super::ping_frame()).await
    }

    /// Closes both loops of this connection. Queued frames may be dropped.
    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    async fn start_send_loop(
        mut send_stream: OwnedWriteHalf,
        mut receiver: mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        const LIMIT: usize = 64;
        let mut msgs = Vec::with_capacity(LIMIT);
        loop {
            let mut bufs = [IoSlice::new(&[]); LIMIT];

            let n = receiver.recv_many(&mut msgs, LIMIT).await;
            if n == 0 {
                return Ok(());
            }

            for (msg, io_slice) in msgs.iter().zip(&mut bufs) {
                *io_slice = IoSlice::new(msg);
            }

            let mut slices = &mut bufs[..msgs.len()];
            while !slices.is_empty() {
                match send_stream.write_vectored(slices).await {
                    Ok(0) => {
                        return Err(Error::new(
                            ErrorKind::TcpSendMsgFailed,
                            "socket closed while writing".to_string(),
                        ));
                    }
                    Ok(n) => IoSlice::advance_slices(&mut slices, n),
                    Err(e) => {
                        return Err(Error::new(ErrorKind::TcpSendMsgFailed, e.to_string()));
                    }
                }
            }
            msgs.clear();
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read side of a connection: turns the byte stream into delimited frames.
pub(crate) struct FrameReader {
    recv_stream: OwnedReadHalf,
    buffer: BytesMut,
    scanned: usize,
    max_frame_size: usize,
}

impl FrameReader {
    /// Waits for the next complete frame. End of stream is an error.
    pub(crate) async fn next_frame(&mut self) -> Result<Bytes> {
        loop {
            let max = self.max_frame_size;
            if let Some(frame) = super::parse_frame(&mut self.buffer, &mut self.scanned, max)? {
                return Ok(frame);
            }
            let n = self
                .recv_stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| Error::new(ErrorKind::TcpRecvMsgFailed, e.to_string()))?;
            if n == 0 {
                return Err(Error::new(
                    ErrorKind::TcpRecvMsgFailed,
                    "socket eof".to_string(),
                ));
            }
        }
    }
}
