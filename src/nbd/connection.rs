//! NBD request loop
//!
//! Serves requests from the kernel one at a time over the user-space end of
//! the socket pair: read a header, dispatch it to the backend, write the reply.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use super::{NbdCommand, NbdReply, NbdRequest};
use crate::backend::BlockBackend;
use crate::error::{BlockError, BlockResult, NbdError};

/// Largest payload accepted for a single request (32 MB)
pub const MAX_REQUEST_LENGTH: u32 = 32 * 1024 * 1024;

/// Request loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the next request header
    Reading,
    /// Running a handler against the backend
    Dispatching,
    /// Writing the reply back to the kernel
    Replying,
    /// Loop has exited
    Stopped,
}

/// Why the request loop stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The kernel closed its end of the socket
    ChannelClosed,
    /// The kernel sent a DISCONNECT request
    Disconnect,
}

/// Per-connection request counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// Total read operations
    pub read_ops: u64,
    /// Total write operations
    pub write_ops: u64,
    /// Total bytes read
    pub bytes_read: u64,
    /// Total bytes written
    pub bytes_written: u64,
    /// Total flush operations
    pub flush_ops: u64,
    /// Total trim operations
    pub trim_ops: u64,
    /// Requests answered with an error
    pub backend_errors: u64,
    /// Headers received with a bad magic
    pub malformed: u64,
}

enum Flow {
    Continue,
    Stop,
}

/// NBD request loop over one socket
pub struct NbdConnection<S> {
    stream: S,
    state: ConnectionState,
    read_only: bool,
    stats: RequestStats,
}

impl<S> NbdConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a new request loop
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ConnectionState::Reading,
            read_only: false,
            stats: RequestStats::default(),
        }
    }

    /// Reject writes and trims with an error reply
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Get connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Request counters so far
    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    /// Serve requests until the kernel hangs up or asks to disconnect.
    ///
    /// A failed header read is the normal way for the kernel to end the
    /// session and yields [`LoopExit::ChannelClosed`]. Errors are returned
    /// only when the stream can no longer be kept in sync.
    pub async fn run<B>(&mut self, backend: &B) -> BlockResult<LoopExit>
    where
        B: BlockBackend + ?Sized,
    {
        let mut header = [0u8; NbdRequest::SIZE];

        let result = loop {
            self.state = ConnectionState::Reading;
            if let Err(e) = self.stream.read_exact(&mut header).await {
                info!("NBD server stopped: {}", e);
                break Ok(LoopExit::ChannelClosed);
            }

            let request = match NbdRequest::parse(&header) {
                Ok(request) => request,
                Err(e) => break Err(e),
            };
            if !request.has_valid_magic() {
                self.stats.malformed += 1;
                warn!(
                    "Received invalid NBD request: magic {:08x}",
                    request.magic
                );
            }
            trace!(
                "Request: type={:08x} from={} len={}",
                request.kind,
                request.from,
                request.length
            );

            self.state = ConnectionState::Dispatching;
            match self.dispatch(&request, backend).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break Ok(LoopExit::Disconnect),
                Err(e) => break Err(e),
            }
        };

        self.state = ConnectionState::Stopped;
        result
    }

    async fn dispatch<B>(&mut self, request: &NbdRequest, backend: &B) -> BlockResult<Flow>
    where
        B: BlockBackend + ?Sized,
    {
        let command = request.command()?;
        if request.length > MAX_REQUEST_LENGTH
            && matches!(command, NbdCommand::Read | NbdCommand::Write)
        {
            return Err(BlockError::Protocol(format!(
                "Request length {} exceeds {}",
                request.length, MAX_REQUEST_LENGTH
            )));
        }

        let mut reply = NbdReply::for_request(request);
        match command {
            NbdCommand::Read => self.handle_read(request, &mut reply, backend).await,
            NbdCommand::Write => self.handle_write(request, &mut reply, backend).await?,
            NbdCommand::Disc => {
                debug!("Calling backend disconnect");
                backend.disconnect().await;
                return Ok(Flow::Stop);
            }
            NbdCommand::Flush => {
                self.stats.flush_ops += 1;
                if let Err(e) = backend.flush().await {
                    self.record_failure(&mut reply, "flush", &e);
                }
                self.send_reply(&reply, None).await;
            }
            NbdCommand::Trim => {
                self.stats.trim_ops += 1;
                let result = if self.read_only {
                    Err(BlockError::ReadOnly)
                } else {
                    backend.trim(request.from, request.length).await
                };
                if let Err(e) = result {
                    self.record_failure(&mut reply, "trim", &e);
                }
                self.send_reply(&reply, None).await;
            }
        }
        Ok(Flow::Continue)
    }

    /// Handle read command
    async fn handle_read<B>(&mut self, request: &NbdRequest, reply: &mut NbdReply, backend: &B)
    where
        B: BlockBackend + ?Sized,
    {
        let mut chunk = vec![0u8; request.length as usize];
        self.stats.read_ops += 1;
        match backend.read_at(&mut chunk, request.from).await {
            Ok(()) => self.stats.bytes_read += chunk.len() as u64,
            Err(e) => self.record_failure(reply, "read_at", &e),
        }
        // The payload goes out even on failure so the kernel gets the
        // reply shape it expects.
        self.send_reply(reply, Some(&chunk)).await;
    }

    /// Handle write command
    async fn handle_write<B>(
        &mut self,
        request: &NbdRequest,
        reply: &mut NbdReply,
        backend: &B,
    ) -> BlockResult<()>
    where
        B: BlockBackend + ?Sized,
    {
        let mut chunk = vec![0u8; request.length as usize];
        self.stream.read_exact(&mut chunk).await.map_err(|e| {
            BlockError::Protocol(format!("cannot read write payload: {}", e))
        })?;

        self.stats.write_ops += 1;
        let mut result = if self.read_only {
            Err(BlockError::ReadOnly)
        } else {
            backend.write_at(&chunk, request.from).await
        };
        if result.is_ok() && request.flags().has_fua() {
            result = backend.flush().await;
        }
        match result {
            Ok(()) => self.stats.bytes_written += chunk.len() as u64,
            Err(e) => self.record_failure(reply, "write_at", &e),
        }

        self.send_reply(reply, None).await;
        Ok(())
    }

    fn record_failure(&mut self, reply: &mut NbdReply, op: &str, err: &BlockError) {
        // The kernel only ever sees the generic code; the mapped one is for the log.
        warn!(code = %err.to_nbd_error(), "Backend {} returned an error: {}", op, err);
        self.stats.backend_errors += 1;
        reply.fail(NbdError::BACKEND_FAILURE);
    }

    /// Send a reply, followed by `payload` for reads.
    ///
    /// Write failures are logged only; a broken socket shows up on the next
    /// header read.
    async fn send_reply(&mut self, reply: &NbdReply, payload: Option<&[u8]>) {
        self.state = ConnectionState::Replying;
        let payload = payload.unwrap_or_default();
        let mut buf = BytesMut::with_capacity(NbdReply::SIZE + payload.len());
        reply.encode(&mut buf);
        buf.put_slice(payload);

        if let Err(e) = self.stream.write_all(&buf).await {
            warn!("Write error when sending reply: {}", e);
        }
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::nbd::CommandFlags;
    use proptest::prelude::*;
    use tokio::io::duplex;

    const DEVICE_SIZE: u64 = 64 * 1024;

    fn arb_command() -> impl Strategy<Value = NbdCommand> {
        prop_oneof![
            Just(NbdCommand::Read),
            Just(NbdCommand::Write),
            Just(NbdCommand::Flush),
            Just(NbdCommand::Trim),
        ]
    }

    /// Push one request through a live loop and return the reply header
    fn serve_one(request: NbdRequest) -> NbdReply {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let backend = MemoryBackend::new(DEVICE_SIZE);
            let (mut kernel, user) = duplex(1 << 16);
            let mut conn = NbdConnection::new(user);

            let client = async {
                let mut buf = BytesMut::new();
                request.encode(&mut buf);
                if matches!(request.command(), Ok(NbdCommand::Write)) {
                    buf.put_bytes(0xA5, request.length as usize);
                }
                kernel.write_all(&buf).await.unwrap();

                let mut header = [0u8; NbdReply::SIZE];
                kernel.read_exact(&mut header).await.unwrap();
                if matches!(request.command(), Ok(NbdCommand::Read)) {
                    let mut payload = vec![0u8; request.length as usize];
                    kernel.read_exact(&mut payload).await.unwrap();
                }
                drop(kernel);
                NbdReply::parse(&header).unwrap()
            };

            let (exit, reply) = tokio::join!(conn.run(&backend), client);
            assert_eq!(exit.unwrap(), LoopExit::ChannelClosed);
            reply
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: every reply echoes the handle of its request, whether or
        /// not the backend accepted it
        #[test]
        fn reply_echoes_handle(
            command in arb_command(),
            handle in any::<[u8; 8]>(),
            from in 0u64..DEVICE_SIZE * 2,
            length in 0u32..4096,
            fua in any::<bool>(),
        ) {
            let mut request = NbdRequest::new(command, handle, from, length);
            if fua {
                request = request.with_flags(CommandFlags::new(CommandFlags::FUA));
            }

            let reply = serve_one(request);
            prop_assert_eq!(reply.handle, handle);

            let in_range = from + length as u64 <= DEVICE_SIZE;
            let expect_ok = command == NbdCommand::Flush || in_range;
            prop_assert_eq!(reply.error == 0, expect_ok);
        }
    }
}
