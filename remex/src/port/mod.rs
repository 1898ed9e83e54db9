use crate::warn;
use bytes::{Bytes, BytesMut};
use color_eyre::eyre::{Report, WrapErr};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

// Sized for request/response traffic; delta blobs can exceed this and the
// codec grows frames as needed.
const BUFFER_SIZE: usize = 8 * 1024;

// Frames carry whole compressed directory deltas, so the codec's default
// frame cap is far too small.
const MAX_FRAME_LENGTH: usize = 1 << 30;

pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Delimits frames using a u32 big-endian length header and encodes each
/// payload with bincode.
#[derive(Debug)]
pub struct Rw<S> {
    rw: Framed<BufStream<S>, LengthDelimitedCodec>,
}

impl<S> Rw<S>
where
    S: AsyncWrite + AsyncRead + Unpin,
{
    pub fn from(reader_capacity: usize, writer_capacity: usize, rw: S) -> Self {
        // buffer rw
        let rw = BufStream::with_capacity(reader_capacity, writer_capacity, rw);
        // frame rw
        let rw = Framed::new(rw, frame_codec());
        Self { rw }
    }

    /// Receives the next frame. `None` on a closed peer or a broken frame.
    pub async fn recv<V>(&mut self) -> Option<V>
    where
        V: DeserializeOwned,
    {
        use futures::stream::StreamExt;
        match self.rw.next().await {
            Some(Ok(bytes)) => deserialize(bytes),
            Some(Err(e)) => {
                warn!("[rw] error while reading from stream: {:?}", e);
                None
            }
            None => None,
        }
    }

    /// Encodes and sends one frame, flushing the stream.
    pub async fn send<V>(&mut self, value: &V) -> Result<(), Report>
    where
        V: Serialize,
    {
        use futures::sink::SinkExt;
        let bytes = serialize(value)?;
        self.rw
            .send(bytes)
            .await
            .wrap_err("error while sending to sink")
    }

    fn into_inner(self) -> S {
        self.rw.into_inner().into_inner()
    }
}

pub(crate) fn deserialize<V>(bytes: BytesMut) -> Option<V>
where
    V: DeserializeOwned,
{
    match bincode::deserialize(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("[rw] error while decoding frame: {:?}", e);
            None
        }
    }
}

pub(crate) fn serialize<V>(value: &V) -> Result<Bytes, Report>
where
    V: Serialize,
{
    let bytes =
        bincode::serialize(value).wrap_err("error while encoding frame")?;
    Ok(Bytes::from(bytes))
}

/// One framed connection to a peer, with enough memory of the peer address
/// to re-establish itself during the handshake retry window.
#[derive(Debug)]
pub struct Port {
    rw: Rw<TcpStream>,
    peer: SocketAddr,
}

impl Port {
    /// Connects to `addr`, retrying `retries` times with `interval` spacing.
    pub async fn connect(
        addr: SocketAddr,
        retries: usize,
        interval: Duration,
    ) -> Result<Self, Report> {
        let mut tries = 0;
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => {
                    tries += 1;
                    if tries >= retries {
                        return Err(Report::new(e)).wrap_err_with(|| {
                            format!(
                                "failed to connect to {} after {} attempts",
                                addr, retries
                            )
                        });
                    }
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    fn from_stream(stream: TcpStream) -> Result<Self, Report> {
        let peer = stream
            .peer_addr()
            .wrap_err("peer address should be available")?;
        Ok(Self {
            rw: Rw::from(BUFFER_SIZE, BUFFER_SIZE, stream),
            peer,
        })
    }

    /// Re-establishes the connection to the cached peer address.
    pub async fn reconnect(&mut self) -> Result<(), Report> {
        let stream = TcpStream::connect(self.peer)
            .await
            .wrap_err_with(|| format!("failed to reconnect to {}", self.peer))?;
        self.rw = Rw::from(BUFFER_SIZE, BUFFER_SIZE, stream);
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn recv<V>(&mut self) -> Option<V>
    where
        V: DeserializeOwned,
    {
        self.rw.recv().await
    }

    pub async fn send<V>(&mut self, value: &V) -> Result<(), Report>
    where
        V: Serialize,
    {
        self.rw.send(value).await
    }

    /// Shuts the connection down. Errors are ignored so this is idempotent
    /// even when the peer is already gone.
    pub async fn close(self) {
        let mut stream = self.rw.into_inner();
        let _ = stream.shutdown().await;
    }
}

/// Listening socket handing out one `Port` per accepted connection.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Binds on `0.0.0.0:port`. Port 0 asks the OS for a free port.
    pub async fn bind(port: u16) -> Result<Self, Report> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .wrap_err_with(|| format!("failed to bind on port {}", port))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Report> {
        self.listener
            .local_addr()
            .wrap_err("local address should be available")
    }

    pub async fn accept(&self) -> Result<Port, Report> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .wrap_err("error while accepting connection")?;
        Port::from_stream(stream)
    }
}
