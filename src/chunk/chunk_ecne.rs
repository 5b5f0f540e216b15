use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::chunk_header::*;
use super::chunk_type::*;
use super::*;

/// ChunkEcne represents an SCTP Chunk of type ECNE, the ECN-Echo defined in
/// https://tools.ietf.org/html/rfc4960#appendix-A
///
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Type = 12   |  Flags = 0    |        Length = 8             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Lowest TSN Number                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Default, Debug, Clone)]
pub struct ChunkEcne {
    pub lowest_tsn: u32,
}

/// makes ChunkEcne printable
impl fmt::Display for ChunkEcne {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lowestTsn={}", self.header(), self.lowest_tsn)
    }
}

impl Chunk for ChunkEcne {
    fn header(&self) -> ChunkHeader {
        ChunkHeader {
            typ: CT_ECNE,
            flags: 0,
            value_length: self.value_length() as u16,
        }
    }

    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;

        if header.typ != CT_ECNE {
            return Err(Error::ErrChunkTypeNotEcne);
        }

        if header.value_length() < 4 {
            return Err(Error::ErrEcneChunkTooSmall);
        }

        let reader = &mut raw.slice(CHUNK_HEADER_SIZE..);
        let lowest_tsn = reader.get_u32();

        Ok(ChunkEcne { lowest_tsn })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        self.header().marshal_to(writer)?;
        writer.put_u32(self.lowest_tsn);
        Ok(writer.len())
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn value_length(&self) -> usize {
        4
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
