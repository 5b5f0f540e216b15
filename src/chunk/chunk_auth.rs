use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::chunk_header::*;
use super::chunk_type::*;
use super::*;
use crate::auth::HmacAlgorithm;

/// ChunkAuth represents an SCTP Chunk of type AUTH, defined in
/// https://tools.ietf.org/html/rfc4895#section-4.1
///
/// The HMAC covers the AUTH chunk itself, with the HMAC field set to zero,
/// followed by every chunk placed after it in the same packet. Because of
/// that, the `hmac` field of this struct always stays zeroed; the serializer
/// fills the MAC in place once the packet bytes after the chunk are known.
///
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Type = 15   |  Flags = 0    |          Chunk Length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Shared Key Identifier     |       HMAC Identifier         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// \                             HMAC                              /
/// /                                                               \
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, Clone)]
pub struct ChunkAuth {
    pub shared_key_id: u16,
    pub algorithm: HmacAlgorithm,
    pub hmac: Bytes,
}

pub(crate) const AUTH_HEADER_SIZE: usize = 4;

/// Offset of the HMAC field from the start of the serialized chunk.
pub(crate) const AUTH_HMAC_OFFSET: usize = CHUNK_HEADER_SIZE + AUTH_HEADER_SIZE;

/// makes ChunkAuth printable
impl fmt::Display for ChunkAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} keyId={} hmacId={}",
            self.header(),
            self.shared_key_id,
            self.algorithm.id()
        )
    }
}

impl Chunk for ChunkAuth {
    fn header(&self) -> ChunkHeader {
        ChunkHeader {
            typ: CT_AUTH,
            flags: 0,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;

        if header.typ != CT_AUTH {
            return Err(Error::ErrChunkTypeNotAuth);
        }

        if header.value_length() < AUTH_HEADER_SIZE {
            return Err(Error::ErrAuthChunkTooSmall);
        }

        let reader = &mut raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + header.value_length());

        let shared_key_id = reader.get_u16();
        let algorithm = HmacAlgorithm::from_id(reader.get_u16())?;
        let hmac = raw.slice(AUTH_HMAC_OFFSET..CHUNK_HEADER_SIZE + header.value_length());

        Ok(ChunkAuth {
            shared_key_id,
            algorithm,
            hmac,
        })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(writer)?;

        writer.put_u16(self.shared_key_id);
        writer.put_u16(self.algorithm.id());
        writer.extend_from_slice(&self.hmac);

        Ok(writer.len())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn value_length(&self) -> usize {
        AUTH_HEADER_SIZE + self.hmac.len()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
