use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("raw is too small for a SCTP chunk")]
    ErrChunkHeaderTooSmall,
    #[error("not enough data left in SCTP packet to satisfy requested length")]
    ErrChunkHeaderNotEnoughSpace,
    #[error("chunk PADDING is non-zero at offset")]
    ErrChunkHeaderPaddingNonZero,
    #[error("chunk has invalid length")]
    ErrChunkHeaderInvalidLength,

    #[error("ChunkType is not of type PayloadData")]
    ErrChunkTypeNotPayloadData,
    #[error("packet is smaller than the header size")]
    ErrChunkPayloadSmall,
    #[error("ChunkType is not of type SACK")]
    ErrChunkTypeNotSack,
    #[error("SACK Chunk size is not large enough to contain header")]
    ErrSackSizeNotLargeEnoughInfo,
    #[error("ChunkType is not of type COOKIEECHO")]
    ErrChunkTypeNotCookieEcho,
    #[error("ChunkType is not of type COOKIEACK")]
    ErrChunkTypeNotCookieAck,
    #[error("ChunkType is not of type AUTH")]
    ErrChunkTypeNotAuth,
    #[error("AUTH chunk is not long enough to contain its HMAC parameters")]
    ErrAuthChunkTooSmall,
    #[error("invalid algorithm type")]
    ErrInvalidAlgorithmType,
    #[error("HMAC key has an invalid length")]
    ErrAuthKeyInvalid,
    #[error("ChunkType is not of type HEARTBEAT")]
    ErrChunkTypeNotHeartbeat,
    #[error("heartbeat is not long enough to contain Heartbeat Info")]
    ErrHeartbeatNotLongEnoughInfo,
    #[error("heartbeat should only have HEARTBEAT param")]
    ErrHeartbeatParam,
    #[error("ChunkType is not of type ECNE")]
    ErrChunkTypeNotEcne,
    #[error("ECNE chunk is not long enough to contain the lowest TSN")]
    ErrEcneChunkTooSmall,

    #[error("raw is too small to be a SCTP packet")]
    ErrPacketRawTooSmall,
    #[error("packet checksum mismatch")]
    ErrChecksumMismatch,
    #[error("not enough data left in SCTP packet to parse chunk")]
    ErrParseSctpChunkNotEnoughData,
    #[error("unmarshalling a chunk of unknown type")]
    ErrUnmarshalUnknownChunkType,
    #[error("source port must not be 0")]
    ErrSctpPacketSourcePortZero,
    #[error("destination port must not be 0")]
    ErrSctpPacketDestinationPortZero,

    #[error("host is unreachable")]
    ErrHostUnreachable,
}
