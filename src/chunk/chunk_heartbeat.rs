use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::chunk_header::*;
use super::chunk_type::*;
use super::*;

///ChunkHeartbeat represents an SCTP Chunk of type HEARTBEAT
///
///An endpoint should send this chunk to its peer endpoint to probe the
///reachability of a particular destination transport address defined in
///the present association.
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|   Type = 4    | Chunk  Flags  |      Heartbeat Length         |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                                                               |
///|            Heartbeat Information TLV (Variable-Length)        |
///|                                                               |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
///Defined as a variable-length parameter using the format described
///in Section 3.2.1, i.e.:
///
///Variable Parameters                  Status     Type Value
///-------------------------------------------------------------
///heartbeat Info                       Mandatory   1
#[derive(Default, Debug, Clone)]
pub struct ChunkHeartbeat {
    /// Sender-specific info, echoed back verbatim in the HEARTBEAT ACK.
    pub heartbeat_info: Bytes,
}

pub(crate) const HEARTBEAT_INFO_PARAM_TYPE: u16 = 1;
pub(crate) const HEARTBEAT_INFO_HEADER_SIZE: usize = 4;

/// makes ChunkHeartbeat printable
impl fmt::Display for ChunkHeartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header())
    }
}

impl Chunk for ChunkHeartbeat {
    fn header(&self) -> ChunkHeader {
        ChunkHeader {
            typ: CT_HEARTBEAT,
            flags: 0,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;

        if header.typ != CT_HEARTBEAT {
            return Err(Error::ErrChunkTypeNotHeartbeat);
        }

        if header.value_length() < HEARTBEAT_INFO_HEADER_SIZE {
            return Err(Error::ErrHeartbeatNotLongEnoughInfo);
        }

        let reader = &mut raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());

        let param_type = reader.get_u16();
        if param_type != HEARTBEAT_INFO_PARAM_TYPE {
            return Err(Error::ErrHeartbeatParam);
        }

        let param_length = reader.get_u16() as usize;
        if param_length < HEARTBEAT_INFO_HEADER_SIZE || param_length > header.value_length() {
            return Err(Error::ErrHeartbeatNotLongEnoughInfo);
        }

        let heartbeat_info = raw.slice(
            CHUNK_HEADER_SIZE + HEARTBEAT_INFO_HEADER_SIZE..CHUNK_HEADER_SIZE + param_length,
        );

        Ok(ChunkHeartbeat { heartbeat_info })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(writer)?;

        writer.put_u16(HEARTBEAT_INFO_PARAM_TYPE);
        writer.put_u16((HEARTBEAT_INFO_HEADER_SIZE + self.heartbeat_info.len()) as u16);
        writer.extend_from_slice(&self.heartbeat_info);

        Ok(writer.len())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn value_length(&self) -> usize {
        HEARTBEAT_INFO_HEADER_SIZE + self.heartbeat_info.len()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
