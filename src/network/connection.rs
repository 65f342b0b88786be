use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio::select;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::TransportConf;
use crate::network::channel_handler::TransportChannelHandler;
use crate::network::client::{ConnectionChannel, TransportClient};
use crate::network::protocol::{Encodable, Frame, WireError};
use crate::network::request_handler::{RpcHandler, StreamManager, TransportRequestHandler};
use crate::network::response_handler::TransportResponseHandler;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};


const LENGTH_PREFIX_LEN: usize = size_of::<u32>();
const INITIAL_READ_BUFFER: usize = 8*1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Frames that the protocol does not interpret, together with the connection they arrived on
pub type UnrecognizedFrameSink = mpsc::UnboundedSender<(SocketAddr, Frame)>;


/// Splits length-prefixed frames off the front of a read buffer
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> FrameDecoder {
        FrameDecoder { max_frame_size }
    }

    /// Returns `None` if the buffer does not hold a complete frame yet. A frame that announces
    ///  more than the maximum frame size is an error as soon as its length prefix is read.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let len: usize = (&buf[..LENGTH_PREFIX_LEN]).get_u32().safe_cast();
        if len > self.max_frame_size {
            return Err(WireError::FrameTooLarge { len, max: self.max_frame_size });
        }
        if buf.len() < LENGTH_PREFIX_LEN + len {
            buf.reserve(LENGTH_PREFIX_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_LEN);
        let mut body = buf.split_to(len).freeze();
        let frame = Frame::decode(&mut body)?;
        if body.has_remaining() {
            return Err(WireError::InvalidLength("frame"));
        }
        Ok(Some(frame))
    }
}

pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) {
    let len: u32 = frame.encoded_length().prechecked_cast();
    buf.reserve(LENGTH_PREFIX_LEN + frame.encoded_length());
    buf.put_u32(len);
    frame.encode(buf);
}


/// Time of the most recent read or write on a connection, shared between reader and writer
struct LastIo {
    base: Instant,
    nanos_since_base: AtomicU64,
}

impl LastIo {
    fn new() -> LastIo {
        LastIo {
            base: Instant::now(),
            nanos_since_base: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let nanos = u64::try_from(self.base.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.nanos_since_base.fetch_max(nanos, Ordering::AcqRel);
    }

    fn get(&self) -> Instant {
        self.base + Duration::from_nanos(self.nanos_since_base.load(Ordering::Acquire))
    }
}


/// Everything that is needed to set up the handler stack for a new connection
struct ConnectionSetup {
    conf: TransportConf,
    rpc_handler: Arc<dyn RpcHandler>,
    stream_manager: Arc<dyn StreamManager>,
    unrecognized_frames: Option<UnrecognizedFrameSink>,
}

impl ConnectionSetup {
    /// Wires up the handlers for a connected socket and spawns the connection's tasks. The
    ///  returned client is the connection's sending side.
    fn spawn_connection(&self, stream: TcpStream, remote: SocketAddr) -> Arc<TransportClient> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY for connection to {}: {}", remote, e);
        }
        let (reader, writer) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(ConnectionChannel::new(remote));
        let response_handler = Arc::new(TransportResponseHandler::new(remote));
        let client = Arc::new(TransportClient::new(channel.clone(), outbound_tx, response_handler.clone(), self.conf.max_frame_size));
        let request_handler = Arc::new(TransportRequestHandler::new(client.clone(), self.rpc_handler.clone(), self.stream_manager.clone()));
        let handler = TransportChannelHandler::new(client.clone(), request_handler, response_handler, &self.conf);

        let last_io = Arc::new(LastIo::new());
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, last_io.clone(), fault_tx));

        let driver = ConnectionDriver {
            remote,
            handler,
            channel,
            decoder: FrameDecoder::new(self.conf.max_frame_size),
            idle_timeout: self.conf.request_timeout,
            unrecognized_frames: self.unrecognized_frames.clone(),
            last_io,
        };
        tokio::spawn(driver.run(reader, writer_task, fault_rx));

        client
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    last_io: Arc<LastIo>,
    faults: mpsc::UnboundedSender<anyhow::Error>,
) {
    let mut buf = BytesMut::new();
    while let Some(frame) = outbound.recv().await {
        buf.clear();
        encode_frame(&frame, &mut buf);
        if let Err(e) = writer.write_all(&buf).await {
            let _ = faults.send(anyhow!(e).context("error writing to connection"));
            return;
        }
        last_io.touch();
    }
}


struct ConnectionDriver {
    remote: SocketAddr,
    handler: TransportChannelHandler,
    channel: Arc<ConnectionChannel>,
    decoder: FrameDecoder,
    idle_timeout: Duration,
    unrecognized_frames: Option<UnrecognizedFrameSink>,
    last_io: Arc<LastIo>,
}

impl ConnectionDriver {
    #[instrument(name = "connection", skip_all, fields(remote = %self.remote))]
    async fn run(self, mut reader: OwnedReadHalf, writer_task: JoinHandle<()>, mut faults: mpsc::UnboundedReceiver<anyhow::Error>) {
        debug!("connection active");
        self.handler.on_active().await;

        let mut closed = self.channel.subscribe();
        let mut read_buf = BytesMut::with_capacity(INITIAL_READ_BUFFER);
        let mut last_idle_signal = Instant::now();

        loop {
            if !self.channel.is_open() {
                break;
            }

            match self.decoder.decode(&mut read_buf) {
                Ok(Some(frame)) => {
                    if !self.dispatch(frame).await {
                        break;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    self.handler.on_fault(&e.into()).await;
                    break;
                }
            }

            let idle_deadline = self.last_io.get().max(last_idle_signal) + self.idle_timeout;
            select! {
                read = reader.read_buf(&mut read_buf) => {
                    match read {
                        Ok(0) => {
                            debug!("connection closed by peer");
                            break;
                        }
                        Ok(n) => {
                            trace!("read {} bytes", n);
                            self.last_io.touch();
                        }
                        Err(e) => {
                            self.handler.on_fault(&anyhow!(e).context("error reading from connection")).await;
                            break;
                        }
                    }
                }
                Some(e) = faults.recv() => {
                    self.handler.on_fault(&e).await;
                    break;
                }
                _ = sleep_until(idle_deadline) => {
                    // a write may have happened while we were waiting
                    let now = Instant::now();
                    if now >= self.last_io.get().max(last_idle_signal) + self.idle_timeout {
                        last_idle_signal = now;
                        let outcome = self.handler.on_idle().await;
                        trace!("idle signal: {:?}", outcome);
                    }
                }
                _ = closed.changed() => {}
            }
        }

        self.channel.close();
        writer_task.abort();
        self.handler.on_inactive().await;
        debug!("connection inactive");
    }

    /// returns `false` if the connection must be closed
    async fn dispatch(&self, frame: Frame) -> bool {
        match self.handler.on_frame_received(frame).await {
            Ok(None) => true,
            Ok(Some(unrecognized)) => {
                match &self.unrecognized_frames {
                    Some(sink) => {
                        if sink.send((self.remote, unrecognized)).is_err() {
                            debug!("receiver for unrecognized frames is gone, dropping frame");
                        }
                    }
                    None => debug!("dropping frame with unrecognized tag {}", unrecognized.tag()),
                }
                true
            }
            Err(e) => {
                self.handler.on_fault(&e).await;
                false
            }
        }
    }
}


/// Accepts connections and runs each of them with its own handler stack
pub struct TransportServer {
    local_addr: SocketAddr,
    accept_loop: JoinHandle<()>,
    connections: Arc<Mutex<Vec<Weak<TransportClient>>>>,
}

impl TransportServer {
    pub async fn bind(
        conf: TransportConf,
        addr: SocketAddr,
        rpc_handler: Arc<dyn RpcHandler>,
        stream_manager: Arc<dyn StreamManager>,
    ) -> anyhow::Result<TransportServer> {
        let listener = TcpListener::bind(addr).await?;
        Self::from_listener(conf, listener, rpc_handler, stream_manager)
    }

    /// Serves connections on a listener that is already bound, e.g. because the caller needs to
    ///  know the actual port before setting up its handlers
    pub fn from_listener(
        conf: TransportConf,
        listener: TcpListener,
        rpc_handler: Arc<dyn RpcHandler>,
        stream_manager: Arc<dyn StreamManager>,
    ) -> anyhow::Result<TransportServer> {
        Self::serve(listener, ConnectionSetup {
            conf,
            rpc_handler,
            stream_manager,
            unrecognized_frames: None,
        })
    }

    /// Like [TransportServer::bind], but frames with an unrecognized tag are forwarded to
    ///  `unrecognized_frames` instead of being dropped
    pub async fn bind_with_passthrough(
        conf: TransportConf,
        addr: SocketAddr,
        rpc_handler: Arc<dyn RpcHandler>,
        stream_manager: Arc<dyn StreamManager>,
        unrecognized_frames: UnrecognizedFrameSink,
    ) -> anyhow::Result<TransportServer> {
        let listener = TcpListener::bind(addr).await?;
        Self::serve(listener, ConnectionSetup {
            conf,
            rpc_handler,
            stream_manager,
            unrecognized_frames: Some(unrecognized_frames),
        })
    }

    fn serve(listener: TcpListener, setup: ConnectionSetup) -> anyhow::Result<TransportServer> {
        let local_addr = listener.local_addr()?;
        info!("transport server listening on {}", local_addr);

        let connections: Arc<Mutex<Vec<Weak<TransportClient>>>> = Default::default();
        let accepted = connections.clone();
        let accept_loop = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!("accepted connection from {}", remote);
                        let client = setup.spawn_connection(stream, remote);

                        let mut accepted = accepted.lock().await;
                        accepted.retain(|c| c.strong_count() > 0);
                        accepted.push(Arc::downgrade(&client));
                    }
                    Err(e) => {
                        warn!("error accepting connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        });

        Ok(TransportServer {
            local_addr,
            accept_loop,
            connections,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections and closes the ones that were accepted
    pub async fn shutdown(&self) {
        self.accept_loop.abort();
        for connection in self.connections.lock().await.drain(..) {
            if let Some(client) = connection.upgrade() {
                client.close();
            }
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}


/// The cache entry for one remote address. Its lock is held while connecting, so there is at most
///  one connection attempt per address, and attempts to different addresses do not wait for each
///  other.
type ClientSlot = Arc<Mutex<Option<Arc<TransportClient>>>>;

/// Creates outgoing connections. Clients are cached per remote address and reused as long as they
///  are active.
pub struct TransportClientFactory {
    setup: ConnectionSetup,
    clients: Mutex<FxHashMap<SocketAddr, ClientSlot>>,
}

impl TransportClientFactory {
    pub fn new(conf: TransportConf, rpc_handler: Arc<dyn RpcHandler>, stream_manager: Arc<dyn StreamManager>) -> TransportClientFactory {
        TransportClientFactory {
            setup: ConnectionSetup {
                conf,
                rpc_handler,
                stream_manager,
                unrecognized_frames: None,
            },
            clients: Default::default(),
        }
    }

    pub fn with_unrecognized_frames(mut self, sink: UnrecognizedFrameSink) -> TransportClientFactory {
        self.setup.unrecognized_frames = Some(sink);
        self
    }

    async fn slot(&self, remote: SocketAddr) -> ClientSlot {
        self.clients.lock().await
            .entry(remote)
            .or_default()
            .clone()
    }

    pub async fn create_client(&self, remote: SocketAddr) -> anyhow::Result<Arc<TransportClient>> {
        let slot = self.slot(remote).await;
        let mut cached = slot.lock().await;
        if let Some(client) = cached.as_ref() {
            if client.is_active() {
                trace!("returning cached connection to {}", remote);
                return Ok(client.clone());
            }
            debug!("cached connection to {} is no longer active, replacing it", remote);
        }

        let client = self.create_unmanaged_client(remote).await?;
        *cached = Some(client.clone());
        Ok(client)
    }

    /// Creates a new connection that is not cached
    pub async fn create_unmanaged_client(&self, remote: SocketAddr) -> anyhow::Result<Arc<TransportClient>> {
        let connect_timeout = self.setup.conf.connect_timeout;
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(remote)).await
            .map_err(|_| anyhow!("connecting to {} timed out after {:?}", remote, connect_timeout))??;
        debug!("connected to {}", remote);
        Ok(self.setup.spawn_connection(stream, remote))
    }

    pub async fn close(&self) {
        let slots = self.clients.lock().await
            .drain()
            .map(|(_, slot)| slot)
            .collect::<Vec<_>>();
        for slot in slots {
            if let Some(client) = slot.lock().await.take() {
                client.close();
            }
        }
    }
}
