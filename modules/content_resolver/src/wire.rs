//! Swarm wire protocol: length-prefixed CBOR frames over TCP.
//!
//! Each side opens with `Hello` carrying its peer identity; after that the
//! exchange is a want/have protocol where `Want` asks for a block and the
//! peer answers with `Block` or `DontHave`.

use minicbor::{bytes::ByteVec, Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dag::CHUNK_SIZE;

/// Upper bound on a frame: one chunk plus framing slack
pub const MAX_FRAME: usize = CHUNK_SIZE + 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the frame limit")]
    Oversized(usize),

    #[error("undecodable frame: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, Encode, Decode)]
pub enum Frame {
    /// Identity exchange, the first frame in each direction
    #[n(0)]
    Hello {
        #[n(0)]
        peer_id: String,
    },

    /// Request for a block by address
    #[n(1)]
    Want {
        #[n(0)]
        cid: ByteVec,
    },

    /// A served block
    #[n(2)]
    Block {
        #[n(0)]
        cid: ByteVec,
        #[n(1)]
        data: ByteVec,
    },

    /// The peer cannot serve the requested block
    #[n(3)]
    DontHave {
        #[n(0)]
        cid: ByteVec,
    },
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, WireError> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(WireError::Oversized(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    minicbor::decode(&buf).map_err(|e| WireError::Codec(e.to_string()))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), WireError> {
    let buf = minicbor::to_vec(frame).map_err(|e| WireError::Codec(e.to_string()))?;
    if buf.len() > MAX_FRAME {
        return Err(WireError::Oversized(buf.len()));
    }
    writer.write_u32(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
