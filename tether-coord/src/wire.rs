pub mod frame;

use std::{io, mem};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use crate::id::PeerId;
use crate::node::Node;
use crate::PROTOCOL_VERSION;

/// Maximum size of a frame payload, in bytes. Anything larger is a
/// protocol violation; node blobs are small.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("invalid node encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown frame type `{0:#04x}`")]
    UnknownFrameType(u8),
    #[error("frame type `{0:#04x}` is not valid in this direction")]
    WrongDirection(u8),
    #[error("frame payload of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),
    #[error("invalid protocol version `{0}`, expected `{PROTOCOL_VERSION}`")]
    InvalidProtocolVersion(u8),
    #[error("handshake id `{actual}` does not match the authenticated id `{expected}`")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    #[error("unexpected bytes at end of frame")]
    UnexpectedBytes,
}

impl Error {
    /// Whether we've reached the end of the stream. This is the normal way
    /// for a peer to disconnect.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Things that can be encoded as binary.
pub trait Encode {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error>;
}

/// Things that can be decoded from binary.
pub trait Decode: Sized {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error>;
}

/// Encode an object into a byte vector.
pub fn serialize<T: Encode + ?Sized>(data: &T) -> Result<Vec<u8>, io::Error> {
    let mut buffer = Vec::new();
    let len = data.encode(&mut buffer)?;

    debug_assert_eq!(len, buffer.len());

    Ok(buffer)
}

/// Decode an object from a byte slice, rejecting trailing garbage.
pub fn deserialize<T: Decode>(data: &[u8]) -> Result<T, Error> {
    let mut cursor = io::Cursor::new(data);
    let obj = T::decode(&mut cursor)?;

    if cursor.position() as usize != cursor.get_ref().len() {
        return Err(Error::UnexpectedBytes);
    }
    Ok(obj)
}

impl Encode for u8 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u8(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u32 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u32::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_all(self)?;

        Ok(N)
    }
}

impl Encode for PeerId {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_bytes().encode(writer)
    }
}

impl Encode for Node {
    /// Nodes travel as a length-prefixed JSON blob, so that receivers that
    /// only route them never have to understand their layout.
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let blob = serde_json::to_vec(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut n = (blob.len() as u32).encode(writer)?;

        writer.write_all(&blob)?;
        n += blob.len();

        Ok(n)
    }
}

////////////////////////////////////////////////////////////////////////////////

impl Decode for u8 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u8()?)
    }
}

impl Decode for u32 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u32::<NetworkEndian>()?)
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let mut buf = [0; N];
        reader.read_exact(&mut buf)?;

        Ok(buf)
    }
}

impl Decode for PeerId {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let buf: [u8; 16] = Decode::decode(reader)?;

        Ok(PeerId::from_bytes(buf))
    }
}

impl Decode for Node {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = u32::decode(reader)? as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(Error::FrameTooLarge(len));
        }
        let mut blob = vec![0; len];
        reader.read_exact(&mut blob)?;

        Ok(serde_json::from_slice(&blob)?)
    }
}
