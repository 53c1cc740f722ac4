//! Framing of coordinator messages.
//!
//! Each frame is a tag byte, a big-endian `u32` payload length, and the
//! payload itself. Which tags are valid depends on the direction of
//! travel; the serving loops enforce that.
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{deserialize, Decode, Encode, Error, MAX_PAYLOAD_SIZE};
use crate::id::PeerId;
use crate::node::Node;
use crate::PROTOCOL_VERSION;

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// A peer announcing its own node.
    SelfUpdate = 0x01,
    /// A client requesting updates for an agent.
    Subscribe = 0x02,
    /// A client retracting its interest in an agent.
    Unsubscribe = 0x03,
    /// A subscribed peer's node changed.
    NodeUpdate = 0x10,
    /// A subscribed peer is no longer reachable through the coordinator.
    PeerGone = 0x11,
    /// An update tagged with its subscription, for multi-agent streams.
    MultiAgentUpdate = 0x20,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x01 => Ok(Self::SelfUpdate),
            0x02 => Ok(Self::Subscribe),
            0x03 => Ok(Self::Unsubscribe),
            0x10 => Ok(Self::NodeUpdate),
            0x11 => Ok(Self::PeerGone),
            0x20 => Ok(Self::MultiAgentUpdate),
            unknown => Err(Error::UnknownFrameType(unknown)),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A peer announcing its own node.
    SelfUpdate(Node),
    /// A client requesting updates for the given agent.
    Subscribe(PeerId),
    /// A client retracting its interest in the given agent.
    Unsubscribe(PeerId),
    /// A subscribed peer announced a new node.
    NodeUpdate { peer: PeerId, node: Node },
    /// A subscribed peer is gone.
    PeerGone { peer: PeerId },
    /// Update on a multi-agent stream. `None` means the agent is gone.
    MultiAgentUpdate { agent: PeerId, node: Option<Node> },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::SelfUpdate(_) => FrameType::SelfUpdate,
            Self::Subscribe(_) => FrameType::Subscribe,
            Self::Unsubscribe(_) => FrameType::Unsubscribe,
            Self::NodeUpdate { .. } => FrameType::NodeUpdate,
            Self::PeerGone { .. } => FrameType::PeerGone,
            Self::MultiAgentUpdate { .. } => FrameType::MultiAgentUpdate,
        }
    }

    /// Serialize the frame: tag, length prefix, payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let payload = self.payload()?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::FrameTooLarge(payload.len()));
        }
        let mut buf = Vec::with_capacity(payload.len() + 5);
        (self.frame_type() as u8).encode(&mut buf)?;
        (payload.len() as u32).encode(&mut buf)?;
        io::Write::write_all(&mut buf, &payload)?;

        Ok(buf)
    }

    fn payload(&self) -> Result<Vec<u8>, io::Error> {
        let mut buf = Vec::new();
        match self {
            Self::SelfUpdate(node) => {
                node.encode(&mut buf)?;
            }
            Self::Subscribe(agent) | Self::Unsubscribe(agent) => {
                agent.encode(&mut buf)?;
            }
            Self::NodeUpdate { peer, node } => {
                peer.encode(&mut buf)?;
                node.encode(&mut buf)?;
            }
            Self::PeerGone { peer } => {
                peer.encode(&mut buf)?;
            }
            Self::MultiAgentUpdate { agent, node } => {
                agent.encode(&mut buf)?;
                if let Some(node) = node {
                    node.encode(&mut buf)?;
                }
            }
        }
        Ok(buf)
    }

    fn from_payload(frame_type: FrameType, payload: &[u8]) -> Result<Self, Error> {
        match frame_type {
            FrameType::SelfUpdate => Ok(Self::SelfUpdate(deserialize(payload)?)),
            FrameType::Subscribe => Ok(Self::Subscribe(deserialize(payload)?)),
            FrameType::Unsubscribe => Ok(Self::Unsubscribe(deserialize(payload)?)),
            FrameType::NodeUpdate => {
                let (peer, node) = deserialize_pair(payload)?;
                Ok(Self::NodeUpdate { peer, node })
            }
            FrameType::PeerGone => Ok(Self::PeerGone {
                peer: deserialize(payload)?,
            }),
            FrameType::MultiAgentUpdate => {
                let mut cursor = io::Cursor::new(payload);
                let agent = PeerId::decode(&mut cursor)?;
                // An empty remainder is the gone sentinel.
                let node = if (cursor.position() as usize) < payload.len() {
                    Some(Node::decode(&mut cursor)?)
                } else {
                    None
                };
                if (cursor.position() as usize) != payload.len() {
                    return Err(Error::UnexpectedBytes);
                }
                Ok(Self::MultiAgentUpdate { agent, node })
            }
        }
    }
}

fn deserialize_pair<A: Decode, B: Decode>(payload: &[u8]) -> Result<(A, B), Error> {
    let mut cursor = io::Cursor::new(payload);
    let a = A::decode(&mut cursor)?;
    let b = B::decode(&mut cursor)?;

    if cursor.position() as usize != payload.len() {
        return Err(Error::UnexpectedBytes);
    }
    Ok((a, b))
}

/// Read one frame off the transport.
pub async fn read<R>(reader: &mut R) -> Result<Frame, Error>
where
    R: AsyncRead + Unpin,
{
    let tag = reader.read_u8().await?;
    let frame_type = FrameType::try_from(tag)?;
    let len = reader.read_u32().await? as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(Error::FrameTooLarge(len));
    }
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).await?;

    Frame::from_payload(frame_type, &payload)
}

/// Write one frame to the transport and flush it.
pub async fn write<W>(writer: &mut W, frame: &Frame) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;

    Ok(())
}

/// Server half of the stream handshake: verify the version byte and id the
/// peer announces against the authenticated id, then echo them back.
pub async fn accept<T>(transport: &mut T, id: PeerId) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let version = transport.read_u8().await?;
    if version != PROTOCOL_VERSION {
        return Err(Error::InvalidProtocolVersion(version));
    }
    let mut bytes = [0u8; 16];
    transport.read_exact(&mut bytes).await?;
    let actual = PeerId::from_bytes(bytes);
    if actual != id {
        return Err(Error::PeerIdMismatch {
            expected: id,
            actual,
        });
    }
    transport.write_u8(PROTOCOL_VERSION).await?;
    transport.write_all(id.as_bytes()).await?;
    transport.flush().await?;

    Ok(())
}

/// Peer half of the stream handshake: announce the version and our id,
/// then check the coordinator's echo.
pub async fn handshake<T>(transport: &mut T, id: PeerId) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    transport.write_u8(PROTOCOL_VERSION).await?;
    transport.write_all(id.as_bytes()).await?;
    transport.flush().await?;

    let version = transport.read_u8().await?;
    if version != PROTOCOL_VERSION {
        return Err(Error::InvalidProtocolVersion(version));
    }
    let mut bytes = [0u8; 16];
    transport.read_exact(&mut bytes).await?;
    let actual = PeerId::from_bytes(bytes);
    if actual != id {
        return Err(Error::PeerIdMismatch {
            expected: id,
            actual,
        });
    }
    Ok(())
}
