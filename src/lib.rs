//! Outbound packet assembly for the SCTP protocol.
//!
//! [SCTP](https://en.wikipedia.org/wiki/Stream_Control_Transmission_Protocol),
//! defined in RFC 4960, carries control information and user data in chunks
//! bundled into packets. This crate implements the sender-side packetization
//! core: deciding which chunks may share a packet under the path MTU,
//! congestion window, receiver window, and bundling rules, opportunistically
//! bundling SACK and AUTH chunks, serializing the result (common header,
//! 4-byte chunk padding, CRC32-C checksum, RFC 4895 HMAC coverage), and
//! handing the buffer to an address-family specific transmit hook. When the
//! contents outgrow the path MTU and the route's device can segment, a single
//! oversized envelope is built instead and the device splits it later.

#![warn(rust_2018_idioms)]

mod association;
mod auth;
mod chunk;
mod error;
mod output;
mod packet;
mod queue;
mod transport;
mod util;

pub use crate::association::{
    Association, AssociationState, AssociationStats, AuthInfo, OutQueue, Peer, Socket, Timers,
};
pub use crate::auth::HmacAlgorithm;
pub use crate::chunk::chunk_auth::ChunkAuth;
pub use crate::chunk::chunk_cookie_ack::ChunkCookieAck;
pub use crate::chunk::chunk_cookie_echo::ChunkCookieEcho;
pub use crate::chunk::chunk_ecne::ChunkEcne;
pub use crate::chunk::chunk_header::{ChunkHeader, CHUNK_HEADER_SIZE};
pub use crate::chunk::chunk_heartbeat::ChunkHeartbeat;
pub use crate::chunk::chunk_payload_data::{
    ChunkPayloadData, FastRetransmit, PayloadProtocolIdentifier, DATA_CHUNK_HEADER_SIZE,
};
pub use crate::chunk::chunk_selective_ack::{ChunkSelectiveAck, GapAckBlock};
pub use crate::chunk::chunk_type::*;
pub use crate::chunk::Chunk;
pub use crate::error::{Error, Result};
pub use crate::output::{
    ChecksumState, ControlChunk, Envelope, OutboundChunk, OutboundPacket, RejectReason, Rejection,
};
pub use crate::packet::{CommonHeader, Packet, PACKET_HEADER_SIZE};
pub use crate::queue::payload_queue::PayloadQueue;
pub use crate::transport::{AfSpecific, Dst, NetDevice, Transport, GSO_BY_FRAGS};
