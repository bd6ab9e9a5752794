//! One peer connection: the socket task pair behind every remote peer.
//!
//! A connection moves through `connecting -> handshaking -> operational ->
//! closed`. Once operational it is a `Framed` stream of wire messages; a
//! dedicated task owns the socket and talks to its swarm exclusively through
//! channels (events up, commands down), so no component ever holds a
//! reference back into the swarm.
//!
//! Transfer pacing: after receiving a `piece` the task settles its byte cost
//! with the download limiter before reading the next frame; before sending a
//! `piece` it settles with the upload limiter. Partial grants loop until the
//! cost is covered, which is what makes a throttled connection progress
//! smoothly instead of bursting.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use harbor_primitives::info_hash::InfoHash;
use harbor_primitives::peer;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::protocol::handshake::{Handshake, HANDSHAKE_LEN};
use crate::protocol::message::{self, Message, MessageCodec};
use crate::throttle::RateLimiter;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Why a connection ended. Protocol violations additionally ban the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// TCP connect failed.
    Unreachable,
    /// The peer did not complete the handshake within the deadline.
    HandshakeTimeout,
    /// The handshake did not carry the `BitTorrent protocol` label.
    LabelMismatch,
    /// The handshake carried a different info-hash than expected.
    IdentityMismatch,
    /// The peer closed the stream.
    Eof,
    /// A frame exceeded the size limit.
    OversizeMessage,
    /// A malformed frame (unknown type, bad payload length).
    FramingViolation,
    /// Some other socket error.
    Io,
    /// We closed it on purpose.
    Requested,
}

impl CloseReason {
    /// Violations that indicate a hostile or broken peer; the manager bans
    /// the address for a back-off window.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::LabelMismatch | Self::IdentityMismatch | Self::OversizeMessage | Self::FramingViolation
        )
    }
}

/// Events a connection task reports to its swarm.
#[derive(Debug)]
pub enum PeerEvent {
    /// The handshake completed; the connection is operational.
    Connected {
        address: SocketAddr,
        peer_id: peer::Id,
        supports_extensions: bool,
    },
    /// A wire message arrived.
    Message { address: SocketAddr, message: Message },
    /// The connection ended; the task is gone.
    Closed { address: SocketAddr, reason: CloseReason },
}

/// Commands a swarm sends down to a connection task.
#[derive(Debug)]
pub enum PeerCommand {
    Send(Message),
    Close,
}

/// The swarm-side handle to one connection task.
#[derive(Debug, Clone)]
pub struct PeerLink {
    address: SocketAddr,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerLink {
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Queues a message for sending. Errors are ignored: a closed task has
    /// already emitted its `Closed` event and the swarm will drop this link.
    pub fn send(&self, message: Message) {
        let _ = self.commands.send(PeerCommand::Send(message));
    }

    pub fn close(&self) {
        let _ = self.commands.send(PeerCommand::Close);
    }
}

/// Rate limiters a connection settles its transfers with.
#[derive(Clone)]
pub struct TransferLimits {
    pub download: Arc<RateLimiter>,
    pub upload: Arc<RateLimiter>,
}

/// Dials `address` and runs the connection. Returns immediately; progress is
/// reported through `events`.
pub fn spawn_outbound(
    address: SocketAddr,
    info_hash: InfoHash,
    our_id: peer::Id,
    events: mpsc::Sender<PeerEvent>,
    limits: TransferLimits,
) -> PeerLink {
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let reason = run_outbound(address, info_hash, our_id, &events, command_rx, limits).await;
        let _ = events.send(PeerEvent::Closed { address, reason }).await;
    });

    PeerLink {
        address,
        commands: command_tx,
    }
}

/// Adopts an accepted socket whose handshake was already read by the
/// listener. Sends our handshake back and runs the connection.
pub fn spawn_inbound(
    stream: TcpStream,
    address: SocketAddr,
    their_handshake: Handshake,
    info_hash: InfoHash,
    our_id: peer::Id,
    events: mpsc::Sender<PeerEvent>,
    limits: TransferLimits,
) -> PeerLink {
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let reason = run_inbound(
            stream,
            address,
            their_handshake,
            info_hash,
            our_id,
            &events,
            command_rx,
            limits,
        )
        .await;
        let _ = events.send(PeerEvent::Closed { address, reason }).await;
    });

    PeerLink {
        address,
        commands: command_tx,
    }
}

async fn run_outbound(
    address: SocketAddr,
    info_hash: InfoHash,
    our_id: peer::Id,
    events: &mpsc::Sender<PeerEvent>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    limits: TransferLimits,
) -> CloseReason {
    debug!(%address, "connecting");

    let Ok(Ok(mut stream)) = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(address)).await else {
        return CloseReason::Unreachable;
    };

    // We speak first on outbound connections.
    let ours = Handshake::new(info_hash, our_id);
    if write_handshake(&mut stream, &ours).await.is_err() {
        return CloseReason::Io;
    }

    let theirs = match read_handshake(&mut stream).await {
        Ok(handshake) => handshake,
        Err(reason) => return reason,
    };

    if theirs.info_hash != info_hash {
        return CloseReason::IdentityMismatch;
    }

    operational(stream, address, &theirs, events, commands, limits).await
}

#[allow(clippy::too_many_arguments)]
async fn run_inbound(
    mut stream: TcpStream,
    address: SocketAddr,
    their_handshake: Handshake,
    info_hash: InfoHash,
    our_id: peer::Id,
    events: &mpsc::Sender<PeerEvent>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    limits: TransferLimits,
) -> CloseReason {
    debug!(%address, "adopting inbound connection");

    let ours = Handshake::new(info_hash, our_id);
    if write_handshake(&mut stream, &ours).await.is_err() {
        return CloseReason::Io;
    }

    operational(stream, address, &their_handshake, events, commands, limits).await
}

async fn operational(
    stream: TcpStream,
    address: SocketAddr,
    theirs: &Handshake,
    events: &mpsc::Sender<PeerEvent>,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    limits: TransferLimits,
) -> CloseReason {
    let connected = PeerEvent::Connected {
        address,
        peer_id: theirs.peer_id,
        supports_extensions: theirs.supports_extension_protocol(),
    };
    if events.send(connected).await.is_err() {
        return CloseReason::Requested;
    }

    let mut framed = Framed::new(stream, MessageCodec);
    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    keep_alive.reset();

    loop {
        tokio::select! {
            frame = framed.next() => {
                match frame {
                    None => return CloseReason::Eof,
                    Some(Err(message::Error::Oversize { .. })) => return CloseReason::OversizeMessage,
                    Some(Err(message::Error::Io(_))) => return CloseReason::Io,
                    Some(Err(_)) => return CloseReason::FramingViolation,
                    Some(Ok(message)) => {
                        // Settle the download cost of a block before reading on.
                        if let Message::Piece { data, .. } = &message {
                            settle(&limits.download, data.len() as u64).await;
                        }

                        trace!(%address, ?message, "received");
                        if events.send(PeerEvent::Message { address, message }).await.is_err() {
                            return CloseReason::Requested;
                        }
                    }
                }
            }

            command = commands.recv() => {
                match command {
                    None | Some(PeerCommand::Close) => return CloseReason::Requested,
                    Some(PeerCommand::Send(message)) => {
                        if let Message::Piece { data, .. } = &message {
                            settle(&limits.upload, data.len() as u64).await;
                        }

                        if framed.send(message).await.is_err() {
                            return CloseReason::Io;
                        }
                    }
                }
            }

            _ = keep_alive.tick() => {
                if framed.send(Message::KeepAlive).await.is_err() {
                    return CloseReason::Io;
                }
            }
        }
    }
}

/// Acquires `cost` bytes from the limiter, looping over partial grants. A
/// zero grant means the limiter shut down; stop paying, the connection is
/// about to be torn down anyway.
async fn settle(limiter: &RateLimiter, cost: u64) {
    let mut remaining = cost;

    while remaining > 0 {
        let granted = limiter.acquire(remaining).await;
        if granted == 0 {
            return;
        }
        remaining -= granted.min(remaining);
    }
}

async fn write_handshake(stream: &mut TcpStream, handshake: &Handshake) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    stream.write_all(&handshake.to_bytes()).await
}

/// Reads and parses the remote handshake under the handshake deadline.
pub async fn read_handshake(stream: &mut TcpStream) -> Result<Handshake, CloseReason> {
    use tokio::io::AsyncReadExt;

    let mut bytes = [0u8; HANDSHAKE_LEN];

    match timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut bytes)).await {
        Err(_elapsed) => Err(CloseReason::HandshakeTimeout),
        Ok(Err(_io)) => Err(CloseReason::Eof),
        Ok(Ok(_)) => Handshake::parse(&bytes).map_err(|_| CloseReason::LabelMismatch),
    }
}
