use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fxhash::FxHashMap;
use rand::random;
use tinyvec::TinyVec;

use crate::auth::HmacAlgorithm;
use crate::chunk::chunk_auth::ChunkAuth;
use crate::chunk::chunk_ecne::ChunkEcne;
use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::chunk::chunk_selective_ack::{ChunkSelectiveAck, GapAckBlock};
use crate::error::Error;
use crate::queue::payload_queue::PayloadQueue;
use crate::transport::Dst;

/// Association state, RFC 4960 sec 4.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssociationState {
    Closed,
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownPending,
    ShutdownSent,
    ShutdownReceived,
    ShutdownAckSent,
}

impl Default for AssociationState {
    fn default() -> Self {
        AssociationState::Closed
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AssociationState::Closed => "Closed",
            AssociationState::CookieWait => "CookieWait",
            AssociationState::CookieEchoed => "CookieEchoed",
            AssociationState::Established => "Established",
            AssociationState::ShutdownPending => "ShutdownPending",
            AssociationState::ShutdownSent => "ShutdownSent",
            AssociationState::ShutdownReceived => "ShutdownReceived",
            AssociationState::ShutdownAckSent => "ShutdownAckSent",
        };
        write!(f, "{}", s)
    }
}

/// Counters updated while the socket lock is held; no atomics needed.
#[derive(Default, Debug, Clone, Copy)]
pub struct AssociationStats {
    /// Packets handed to the IP layer, segments counted individually.
    pub opackets: u64,
    /// SACK chunks sent.
    pub osacks: u64,
    /// Transmissions dropped for want of a route.
    pub out_no_routes: u64,
}

/// The slice of socket state the packet builder reads and maintains.
#[derive(Default, Debug)]
pub struct Socket {
    /// Nagle disabled; small DATA chunks are never delayed.
    pub nodelay: bool,
    /// Skip checksumming outgoing packets entirely.
    pub checksum_disable: bool,
    /// Last transmit error, recorded instead of failing the association.
    pub last_error: Option<Error>,
    pub(crate) dst_cache: Option<Arc<Dst>>,
    gso: bool,
}

impl Socket {
    /// Cache the route and adopt its device capabilities.
    pub(crate) fn setup_caps(&mut self, dst: &Arc<Dst>) {
        self.gso = dst.dev.gso;
        self.dst_cache = Some(dst.clone());
    }

    pub(crate) fn can_gso(&self) -> bool {
        self.gso
    }
}

/// Flow-control state advertised by or learned about the peer.
#[derive(Debug)]
pub struct Peer {
    /// The peer's receiver window as we currently estimate it.
    pub rwnd: u32,
    pub sack_generation: u32,
    /// A SACK is owed to the peer.
    pub sack_needed: bool,
    pub prsctp_capable: bool,
    /// Destination the last packet went to, for SACK steering.
    pub last_sent_to: Option<SocketAddr>,
}

impl Default for Peer {
    fn default() -> Self {
        Peer {
            rwnd: 0,
            sack_generation: 0,
            sack_needed: false,
            prsctp_capable: false,
            last_sent_to: None,
        }
    }
}

/// Accounting of the outbound queue shared with the retransmit machinery.
#[derive(Default, Debug)]
pub struct OutQueue {
    /// Bytes of DATA sent and not yet acknowledged, across all paths.
    pub outstanding_bytes: u32,
    /// Bytes of user data still waiting in the pending queue.
    pub out_qlen: usize,
    /// DATA chunks in flight, owned here; packets borrow them by TSN.
    pub inflight: PayloadQueue,
}

/// Deadlines owned by subsystems outside this crate. The packet builder only
/// cancels the SACK timer when it bundles a SACK and restarts autoclose when
/// it sends DATA.
#[derive(Default, Debug)]
pub struct Timers {
    pub sack: Option<Instant>,
    pub autoclose: Option<Instant>,
}

/// Key material negotiated for the AUTH extension (RFC 4895).
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub shared_key_id: u16,
    pub algorithm: HmacAlgorithm,
    /// The association shared key the MACs are computed with.
    pub active_key: Bytes,
}

/// The association as seen from the packet builder: flow control inputs,
/// sequence number generators, the chunk factories used for bundling, and the
/// counters the builder maintains.
#[derive(Debug)]
pub struct Association {
    pub state: AssociationState,
    pub pathmtu: u32,
    pub pmtud_enabled: bool,
    pub my_verification_tag: u32,
    pub peer_verification_tag: u32,

    pub peer: Peer,
    pub outqueue: OutQueue,
    pub stats: AssociationStats,
    pub timers: Timers,
    pub autoclose: Option<Duration>,
    pub sk: Socket,

    /// Our receive window; the SACK factory freezes it into `a_rwnd`.
    pub rwnd: u32,
    pub a_rwnd: u32,
    /// Cumulative TSN received in order from the peer.
    pub peer_last_tsn: u32,
    /// Receive-side gaps and duplicates, maintained by the reception
    /// machinery and consumed when a SACK is built.
    pub gap_ack_blocks: TinyVec<[GapAckBlock; 4]>,
    pub dup_tsns: Vec<u32>,

    /// A congestion notification echo is owed to the peer.
    pub need_ecne: bool,
    pub last_ecne_tsn: u32,

    pub auth: Option<AuthInfo>,

    pub(crate) my_next_tsn: u32,
    ssn_streams: FxHashMap<u16, u16>,
}

impl Association {
    pub fn new(pathmtu: u32) -> Self {
        Association {
            state: AssociationState::default(),
            pathmtu,
            pmtud_enabled: true,
            my_verification_tag: random::<u32>(),
            peer_verification_tag: 0,
            peer: Peer::default(),
            outqueue: OutQueue::default(),
            stats: AssociationStats::default(),
            timers: Timers::default(),
            autoclose: None,
            sk: Socket::default(),
            rwnd: 0,
            a_rwnd: 0,
            peer_last_tsn: 0,
            gap_ack_blocks: TinyVec::new(),
            dup_tsns: vec![],
            need_ecne: false,
            last_ecne_tsn: 0,
            auth: None,
            my_next_tsn: random::<u32>(),
            ssn_streams: FxHashMap::default(),
        }
    }

    /// generate_next_tsn returns my_next_tsn and increases it. The caller
    /// should hold the lock.
    pub(crate) fn generate_next_tsn(&mut self) -> u32 {
        let tsn = self.my_next_tsn;
        self.my_next_tsn = self.my_next_tsn.wrapping_add(1);
        tsn
    }

    /// Assigns a TSN to a DATA chunk that does not have one yet.
    pub(crate) fn assign_tsn(&mut self, chunk: &mut ChunkPayloadData) {
        if chunk.has_tsn {
            return;
        }
        chunk.tsn = self.generate_next_tsn();
        chunk.has_tsn = true;
    }

    /// Assigns a stream sequence number to a DATA chunk that does not have
    /// one yet. Every fragment of one message shares the SSN, so the per
    /// stream counter only advances past the ending fragment. Unordered
    /// chunks carry zero.
    pub(crate) fn assign_ssn(&mut self, chunk: &mut ChunkPayloadData) {
        if chunk.has_ssn {
            return;
        }
        if chunk.unordered {
            chunk.stream_sequence_number = 0;
        } else {
            let ssn = self
                .ssn_streams
                .entry(chunk.stream_identifier)
                .or_insert(0);
            chunk.stream_sequence_number = *ssn;
            if chunk.ending_fragment {
                *ssn = ssn.wrapping_add(1);
            }
        }
        chunk.has_ssn = true;
    }

    /// Builds a SACK from the current reception state, consuming the queued
    /// duplicate reports. `a_rwnd` must have been frozen by the caller.
    pub(crate) fn make_sack(&mut self) -> Option<ChunkSelectiveAck> {
        Some(ChunkSelectiveAck {
            cumulative_tsn_ack: self.peer_last_tsn,
            advertised_receiver_window_credit: self.a_rwnd,
            gap_ack_blocks: self.gap_ack_blocks.clone(),
            duplicate_tsn: self.dup_tsns.drain(..).collect(),
        })
    }

    /// Builds an AUTH chunk with a zeroed MAC from the active key, or `None`
    /// when authentication was not negotiated.
    pub(crate) fn make_auth(&self) -> Option<ChunkAuth> {
        let info = self.auth.as_ref()?;
        Some(ChunkAuth {
            shared_key_id: info.shared_key_id,
            algorithm: info.algorithm,
            hmac: Bytes::from(vec![0u8; info.algorithm.digest_len()]),
        })
    }

    /// The ECNE chunk to stick at the front of the next packet, when one is
    /// owed. The flag stays up until the peer answers with a CWR.
    pub(crate) fn get_ecne_prepend(&self) -> Option<ChunkEcne> {
        if self.need_ecne {
            Some(ChunkEcne {
                lowest_tsn: self.last_ecne_tsn,
            })
        } else {
            None
        }
    }
}
