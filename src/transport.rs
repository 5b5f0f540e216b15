use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::association::Association;
use crate::error::Result;
use crate::output::Envelope;

/// Marker stored in `Envelope::gso_size` when the buffer carries several
/// packets that the device splits at segment boundaries rather than at a
/// fixed size.
pub const GSO_BY_FRAGS: u16 = 0xffff;

/// Initial congestion window, RFC 4960 sec 7.2.1 with a 1500 byte MTU.
pub(crate) const INITIAL_CWND: u32 = 4380;

/// Offload capabilities of the device behind a route.
#[derive(Debug, Clone)]
pub struct NetDevice {
    /// The device segments oversized SCTP buffers on its own.
    pub gso: bool,
    pub gso_max_size: u32,
    pub gso_max_segs: u16,
    /// The device computes the CRC32-C checksum on transmit.
    pub sctp_crc_offload: bool,
}

impl Default for NetDevice {
    fn default() -> Self {
        NetDevice {
            gso: false,
            gso_max_size: 65536,
            gso_max_segs: 65535,
            sctp_crc_offload: false,
        }
    }
}

/// A resolved route to the remote transport address.
#[derive(Debug, Clone, Default)]
pub struct Dst {
    pub dev: NetDevice,
    /// A transform is attached; the checksum cannot be offloaded.
    pub xfrm: bool,
    /// The cached entry is no longer valid and must be re-resolved.
    pub obsolete: bool,
}

/// Address-family specific hooks the embedding IP layer provides.
pub trait AfSpecific: fmt::Debug + Send {
    /// Hand a fully built envelope to the IP layer. The returned error
    /// propagates to the caller of `OutboundPacket::transmit`.
    fn sctp_xmit(&mut self, envelope: Envelope) -> Result<()>;

    /// Mark the owning socket ECN capable so outgoing IP headers carry the
    /// ECT bit.
    fn ecn_capable(&mut self);

    /// Resolve a route to the remote address, or `None` when unreachable.
    fn get_dst(&mut self) -> Option<Arc<Dst>>;
}

/// One path to the peer. The packet builder reads the flow-control state and
/// updates `flight_size`, `rto_pending` and the cached route.
#[derive(Debug)]
pub struct Transport {
    pub remote_addr: SocketAddr,
    pub pathmtu: u32,
    pub cwnd: u32,
    /// Bytes sent on this path and not yet acknowledged.
    pub flight_size: u32,
    /// Non-zero when max-burst clamped cwnd; holds the pre-clamp value.
    pub burst_limited: u32,
    pub sack_generation: u32,
    /// An RTT measurement is already in progress on this path.
    pub rto_pending: bool,
    pub dst: Option<Arc<Dst>>,
    pub asoc: Option<Association>,
    pub af_specific: Box<dyn AfSpecific>,
}

impl Transport {
    pub fn new(remote_addr: SocketAddr, af_specific: Box<dyn AfSpecific>) -> Self {
        Transport {
            remote_addr,
            pathmtu: 1500,
            cwnd: INITIAL_CWND,
            flight_size: 0,
            burst_limited: 0,
            sack_generation: 0,
            rto_pending: false,
            dst: None,
            asoc: None,
            af_specific,
        }
    }

    /// Returns whether the cached route is still usable, dropping it when the
    /// entry went stale.
    pub(crate) fn dst_check(&mut self) -> bool {
        match &self.dst {
            Some(dst) if !dst.obsolete => true,
            Some(_) => {
                self.dst = None;
                false
            }
            None => false,
        }
    }

    /// Re-resolve the route and, when path MTU discovery is enabled, bring
    /// the association's view of the path MTU back in sync.
    pub(crate) fn route(&mut self) {
        self.dst = self.af_specific.get_dst();
        if let Some(asoc) = &mut self.asoc {
            if asoc.pmtud_enabled {
                asoc.pathmtu = self.pathmtu;
            }
        }
    }
}
