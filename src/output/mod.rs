use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, error, trace, warn};

use crate::association::AssociationState;
use crate::auth::calculate_hmac;
use crate::chunk::chunk_auth::{ChunkAuth, AUTH_HMAC_OFFSET};
use crate::chunk::chunk_header::CHUNK_HEADER_SIZE;
use crate::chunk::chunk_payload_data::{
    ChunkPayloadData, FastRetransmit, DATA_CHUNK_HEADER_SIZE,
};
use crate::chunk::chunk_type::*;
use crate::chunk::Chunk;
use crate::error::Result;
use crate::packet::PACKET_HEADER_SIZE;
use crate::transport::{Transport, GSO_BY_FRAGS};
use crate::util::{pad4, ISCSI_CRC, PADDING_MULTIPLE};

#[cfg(test)]
mod output_test;

/// Headroom accounted for lower-layer headers when sizing buffers.
const MAX_HEADER: usize = 128;

const IPV4_HEADER_SIZE: usize = 20;
const IPV6_HEADER_SIZE: usize = 40;

/// Flow-control outcomes of an admission attempt that did not accept the
/// chunk. `RwndFull` stands in for receiver-window and congestion-window
/// exhaustion alike; callers treat both as "stop sending on this transport".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Wait for a fuller packet before sending this small chunk.
    Delay,
    /// No window for this chunk right now.
    RwndFull,
    /// The packet must be transmitted before this chunk can be appended.
    PmtuFull,
}

/// A chunk the packet did not take, handed back with no state touched.
#[derive(Debug)]
pub struct Rejection {
    pub reason: RejectReason,
    pub chunk: OutboundChunk,
}

/// A control chunk offered for transmission together with the policy bit the
/// peer negotiated for its type.
#[derive(Debug)]
pub struct ControlChunk {
    pub chunk: Box<dyn Chunk + Send + Sync>,
    /// The peer asked for this chunk type to be carried under an AUTH chunk.
    pub auth: bool,
}

impl ControlChunk {
    pub fn new(chunk: Box<dyn Chunk + Send + Sync>) -> Self {
        ControlChunk { chunk, auth: false }
    }
}

/// A chunk offered to the packet. The variants tag ownership: control chunks
/// become property of the packet and are dropped once serialized, DATA moves
/// on to the retransmit queue and is only borrowed for serialization, and an
/// AUTH chunk is kept aside by the serializer so its MAC can be computed and
/// the chunk re-covered on every segment of an offloaded envelope.
#[derive(Debug)]
pub enum OutboundChunk {
    Control(ControlChunk),
    Auth(ChunkAuth),
    Data(ChunkPayloadData),
}

impl OutboundChunk {
    /// Wraps a control chunk that needs no authentication cover.
    pub fn control(chunk: Box<dyn Chunk + Send + Sync>) -> Self {
        OutboundChunk::Control(ControlChunk::new(chunk))
    }

    fn typ(&self) -> ChunkType {
        match self {
            OutboundChunk::Control(control) => control.chunk.header().typ,
            OutboundChunk::Auth(_) => CT_AUTH,
            OutboundChunk::Data(_) => CT_PAYLOAD_DATA,
        }
    }

    fn is_data(&self) -> bool {
        matches!(self, OutboundChunk::Data(_))
    }

    fn auth_required(&self) -> bool {
        match self {
            OutboundChunk::Control(control) => control.auth,
            OutboundChunk::Auth(_) => false,
            OutboundChunk::Data(data) => data.auth,
        }
    }

    /// Length of the serialized chunk, header included, padding excluded.
    fn wire_len(&self) -> usize {
        CHUNK_HEADER_SIZE
            + match self {
                OutboundChunk::Control(control) => control.chunk.value_length(),
                OutboundChunk::Auth(auth) => auth.value_length(),
                OutboundChunk::Data(data) => data.value_length(),
            }
    }
}

/// A queued chunk, tagged the same way as `OutboundChunk` but with the
/// control wrapper peeled off; the bundling policy was consumed at admission.
#[derive(Debug)]
enum BundledChunk {
    Control(Box<dyn Chunk + Send + Sync>),
    Auth(ChunkAuth),
    Data(ChunkPayloadData),
}

impl BundledChunk {
    fn wire_len(&self) -> usize {
        CHUNK_HEADER_SIZE
            + match self {
                BundledChunk::Control(chunk) => chunk.value_length(),
                BundledChunk::Auth(auth) => auth.value_length(),
                BundledChunk::Data(data) => data.value_length(),
            }
    }
}

/// Checksum treatment of a built envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumState {
    /// CRC32-C computed in software and written into the common header.
    Filled,
    /// Left to the device; `offset` locates the checksum field inside the
    /// head buffer. Envelopes carrying several segments get per-packet
    /// checksums at segmentation time.
    Offloaded { offset: usize },
    /// Checksumming disabled; the field stays zero.
    Disabled,
}

/// One fully built buffer ready for the IP transmit hook.
#[derive(Debug)]
pub struct Envelope {
    pub remote: SocketAddr,
    /// SCTP common header followed by the chunks of a plain packet. When the
    /// envelope is segmented the head carries the header alone.
    pub head: Bytes,
    /// Chunk regions of the individual packets of a segmented envelope, in
    /// wire order. The device completes each with a copy of the header.
    pub frag_list: Vec<Bytes>,
    /// Number of packets the device will produce; zero for a plain packet.
    pub gso_segs: u16,
    /// `GSO_BY_FRAGS` when segmented, zero otherwise.
    pub gso_size: u16,
    pub checksum: ChecksumState,
    /// Permit IP-level fragmentation of this envelope.
    pub ignore_df: bool,
}

/// The assembly buffer for one outbound packet toward a single transport.
///
/// Chunks are admitted one at a time under the flow-control, bundling, and
/// MTU rules of RFC 4960 sec 6.1 and 6.10; AUTH coverage follows RFC 4895.
/// `transmit` serializes whatever was accepted and hands it to the transport's
/// address-family send hook, splitting oversized contents into a segmented
/// envelope when the device offloads segmentation.
#[derive(Debug)]
pub struct OutboundPacket {
    source_port: u16,
    destination_port: u16,
    vtag: u32,
    /// Append order is wire order.
    chunk_list: VecDeque<BundledChunk>,
    /// IP header plus SCTP common header cost of every packet sent from here.
    overhead: usize,
    /// Serialized size of the current contents, `overhead` included.
    size: usize,
    /// Envelope ceiling: the path MTU, or the device limit when the route
    /// supports segmentation offload.
    max_size: usize,
    has_cookie_echo: bool,
    has_sack: bool,
    has_data: bool,
    has_auth: bool,
    ipfragok: bool,
}

impl OutboundPacket {
    /// Binds a packet to a transport. The IP overhead is taken from the
    /// association's address family; without one the larger IPv6 header is
    /// assumed.
    pub fn new(transport: &Transport, source_port: u16, destination_port: u16) -> Self {
        let net_header_len = if transport.asoc.is_some() {
            match transport.remote_addr {
                SocketAddr::V4(_) => IPV4_HEADER_SIZE,
                SocketAddr::V6(_) => IPV6_HEADER_SIZE,
            }
        } else {
            IPV6_HEADER_SIZE
        };

        let mut packet = OutboundPacket {
            source_port,
            destination_port,
            vtag: 0,
            chunk_list: VecDeque::new(),
            overhead: net_header_len + PACKET_HEADER_SIZE,
            size: 0,
            max_size: transport.pathmtu as usize,
            has_cookie_echo: false,
            has_sack: false,
            has_data: false,
            has_auth: false,
            ipfragok: false,
        };
        packet.reset();
        packet
    }

    /// Prepares the packet for the next assembly; the chunk list and the
    /// verification tag survive.
    pub fn reset(&mut self) {
        self.size = self.overhead;
        self.has_cookie_echo = false;
        self.has_sack = false;
        self.has_data = false;
        self.has_auth = false;
        self.ipfragok = false;
    }

    /// Drops every queued chunk. Control chunks die here; DATA chunks are
    /// owned by the retransmit queue and unaffected.
    pub fn clear(&mut self) {
        self.chunk_list.clear();
    }

    /// Per-transmission configuration: verification tag, envelope ceiling,
    /// and the optional ECNE prepend.
    pub fn config(&mut self, vtag: u32, ecn_capable: bool, transport: &mut Transport, now: Instant) {
        trace!("config: vtag=0x{:x}", vtag);

        self.vtag = vtag;

        match (transport.asoc.as_mut(), transport.dst.as_ref()) {
            (Some(asoc), Some(dst)) => {
                let cached = match &asoc.sk.dst_cache {
                    Some(cached) => Arc::ptr_eq(cached, dst),
                    None => false,
                };
                if !cached {
                    asoc.sk.setup_caps(dst);
                }

                self.max_size = if asoc.sk.can_gso() {
                    dst.dev.gso_max_size as usize
                } else {
                    asoc.pathmtu as usize
                };
            }
            _ => {
                self.max_size = transport.pathmtu as usize;
            }
        }

        if ecn_capable && self.is_empty() {
            // If there is a prepend chunk, stick it on the list before any
            // other chunks get appended.
            let ecne = transport.asoc.as_ref().and_then(|asoc| asoc.get_ecne_prepend());
            if let Some(ecne) = ecne {
                let _ = self.append_chunk(OutboundChunk::control(Box::new(ecne)), transport, now);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == self.overhead
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overhead(&self) -> usize {
        self.overhead
    }

    pub fn vtag(&self) -> u32 {
        self.vtag
    }

    pub fn has_cookie_echo(&self) -> bool {
        self.has_cookie_echo
    }

    pub fn has_sack(&self) -> bool {
        self.has_sack
    }

    pub fn has_data(&self) -> bool {
        self.has_data
    }

    pub fn has_auth(&self) -> bool {
        self.has_auth
    }

    pub fn ipfragok(&self) -> bool {
        self.ipfragok
    }

    /// Tries to append the chunk to the offered packet, transmitting first
    /// when the packet is full. If adding the chunk reports `PmtuFull` and no
    /// COOKIE-ECHO chunk is present, the packet is sent out and the append
    /// retried on the emptied packet. Data can be bundled with a packet
    /// containing a COOKIE-ECHO as long as it fits; any more data has to wait
    /// for the COOKIE-ACK.
    pub fn transmit_chunk(
        &mut self,
        chunk: OutboundChunk,
        one_packet: bool,
        transport: &mut Transport,
        now: Instant,
    ) -> std::result::Result<(), Rejection> {
        match self.append_chunk(chunk, transport, now) {
            Err(Rejection {
                reason: RejectReason::PmtuFull,
                chunk,
            }) if !self.has_cookie_echo => {
                if let Err(err) = self.transmit(transport, now) {
                    match transport.asoc.as_mut() {
                        Some(asoc) => asoc.sk.last_error = Some(err),
                        None => warn!("transmit failed without an association: {}", err),
                    }
                }

                // If we have an empty packet, then we can NOT ever return
                // PmtuFull.
                if !one_packet {
                    self.append_chunk(chunk, transport, now)
                } else {
                    Err(Rejection {
                        reason: RejectReason::PmtuFull,
                        chunk,
                    })
                }
            }
            other => other,
        }
    }

    /// Admits a chunk into the packet, bundling an AUTH and/or SACK chunk in
    /// front of it when called for. On rejection the chunk comes back with no
    /// state mutated.
    pub fn append_chunk(
        &mut self,
        chunk: OutboundChunk,
        transport: &mut Transport,
        now: Instant,
    ) -> std::result::Result<(), Rejection> {
        trace!("append_chunk: type={} len={}", chunk.typ(), chunk.wire_len());

        // Data chunks are special. Before seeing what else we can bundle
        // into this packet, check to see if we are allowed to send this DATA.
        if let OutboundChunk::Data(data) = &chunk {
            if let Some(reason) = self.can_append_data(data, transport) {
                return Err(Rejection { reason, chunk });
            }
        }

        // Try to bundle an AUTH chunk
        if let Err(reason) = self.bundle_auth(&chunk, transport, now) {
            return Err(Rejection { reason, chunk });
        }

        // Try to bundle a SACK chunk
        if let Err(reason) = self.bundle_sack(&chunk, transport, now) {
            return Err(Rejection { reason, chunk });
        }

        self.append_inner(chunk, transport, now)
    }

    /// Whether a DATA chunk may be sent right now.
    fn can_append_data(
        &self,
        chunk: &ChunkPayloadData,
        transport: &Transport,
    ) -> Option<RejectReason> {
        let asoc = match &transport.asoc {
            Some(asoc) => asoc,
            None => return None,
        };

        // RFC 4960 sec 6.1 Transmission of DATA Chunks
        //
        //   A) At any given time, the data sender MUST NOT transmit new data
        //      to any destination transport address if its peer's rwnd
        //      indicates that the peer has no buffer space. However,
        //      regardless of the value of rwnd (including if it is 0), the
        //      data sender can always have one DATA chunk in flight to the
        //      receiver if allowed by cwnd. This rule allows the sender to
        //      probe for a change in rwnd that the sender missed.
        let rwnd = asoc.peer.rwnd;
        let inflight = asoc.outqueue.outstanding_bytes;
        let flight_size = transport.flight_size;
        let datasize = chunk.data_size();

        if datasize > rwnd && inflight > 0 {
            // We have (at least) one data chunk in flight, so we can't fall
            // back to the zero window probe.
            return Some(RejectReason::RwndFull);
        }

        // RFC 4960 sec 6.1
        //
        //   B) At any given time, the sender MUST NOT transmit new data to a
        //      given transport address if it has cwnd or more bytes of data
        //      outstanding to that transport address.
        //
        // RFC 4960 sec 7.2.4: when a Fast Retransmit is being performed the
        // sender SHOULD ignore the value of cwnd and SHOULD NOT delay
        // retransmission.
        if chunk.fast_retransmit != FastRetransmit::Needed && flight_size >= transport.cwnd {
            return Some(RejectReason::RwndFull);
        }

        // Nagle's algorithm to solve the small-packet problem: inhibit new
        // chunks while previously transmitted data remains unacknowledged.
        if asoc.sk.nodelay {
            // Nagle disabled
            return None;
        }

        if !self.is_empty() {
            // Append to the packet we already have
            return None;
        }

        if inflight == 0 {
            // Nothing unacked
            return None;
        }

        if asoc.state != AssociationState::Established {
            return None;
        }

        // Check whether this chunk and all the rest of the pending data will
        // fit, or delay in hopes of bundling a full sized packet.
        let headroom = (transport.pathmtu as usize)
            .saturating_sub(self.overhead + DATA_CHUNK_HEADER_SIZE + 4);
        if chunk.user_data.len() + asoc.outqueue.out_qlen > headroom {
            // Enough data queued to fill a packet
            return None;
        }

        // Don't delay large message writes that may have been fragmented
        if !chunk.can_delay {
            return None;
        }

        // Defer until all data is acked or the packet is full
        Some(RejectReason::Delay)
    }

    /// Whether the chunk fits the packet under the MTU and envelope limits.
    fn will_fit(
        &mut self,
        chunk: &OutboundChunk,
        chunk_len: usize,
        transport: &Transport,
    ) -> Option<RejectReason> {
        let psize = self.size;
        let pmtu = transport
            .asoc
            .as_ref()
            .map_or(transport.pathmtu, |asoc| asoc.pathmtu) as usize;

        let mut retval = None;

        // Decide if we need to fragment or resubmit later.
        if psize + chunk_len > pmtu {
            // It's OK to fragment at the IP level if any one of the following
            // is true:
            //   1. The packet is empty (meaning this chunk is greater than
            //      the MTU)
            //   2. The packet doesn't have any data in it yet and data
            //      requires authentication.
            if self.is_empty() || (!self.has_data && chunk.auth_required()) {
                // We no longer do re-fragmentation. Just fragment at the IP
                // layer if we actually hit this condition.
                self.ipfragok = true;
                return None;
            }

            // Similarly, if this chunk was built before a PMTU reduction, we
            // have to fragment it at the IP level now. So if the packet
            // already contains something, we need to flush.
            let mut maxsize = pmtu - self.overhead;
            if self.has_auth {
                maxsize = maxsize.saturating_sub(self.auth_padded_len());
            }
            if chunk_len > maxsize {
                retval = Some(RejectReason::PmtuFull);
            }

            // It is also okay to fragment if the chunk we are adding is a
            // control chunk, but only if the current packet is not an
            // offloaded one. Force it into a new packet instead.
            if !chunk.is_data() && self.has_data {
                retval = Some(RejectReason::PmtuFull);
            }

            if psize + chunk_len > self.max_size {
                // Hit the offload/PMTU envelope ceiling, gotta flush
                retval = Some(RejectReason::PmtuFull);
            }

            if transport.burst_limited == 0 && psize + chunk_len > (transport.cwnd >> 1) as usize {
                // Do not allow a single offloaded envelope to use more than
                // half of cwnd.
                retval = Some(RejectReason::PmtuFull);
            }

            if transport.burst_limited != 0
                && psize + chunk_len > (transport.burst_limited >> 1) as usize
            {
                // Do not allow a single offloaded envelope to use more than
                // half of the original cwnd.
                retval = Some(RejectReason::PmtuFull);
            }
            // Otherwise it will fit in the offloaded envelope
        }

        retval
    }

    /// Padded length of the AUTH chunk already on the list, if any.
    fn auth_padded_len(&self) -> usize {
        self.chunk_list
            .iter()
            .find_map(|chunk| match chunk {
                BundledChunk::Auth(_) => Some(pad4(chunk.wire_len())),
                _ => None,
            })
            .unwrap_or(0)
    }

    /// Management things for adding a DATA chunk: flow-control accounting,
    /// sequence number assignment, and the handover to the retransmit queue.
    fn append_data(&mut self, chunk: &mut ChunkPayloadData, transport: &mut Transport, now: Instant) {
        let datasize = chunk.data_size();

        // Keep track of how many bytes are in flight over this transport.
        transport.flight_size += datasize;

        // timestamp the chunk for rtx purposes
        chunk.sent_at = Some(now);
        chunk.nsent += 1;

        if let Some(asoc) = transport.asoc.as_mut() {
            // Keep track of how many bytes are in flight to the receiver.
            asoc.outqueue.outstanding_bytes += datasize;

            // Update our view of the receiver's rwnd.
            asoc.peer.rwnd = asoc.peer.rwnd.saturating_sub(datasize);

            // Has been accepted for transmission.
            if !asoc.peer.prsctp_capable {
                chunk.can_abandon = false;
            }
            asoc.assign_tsn(chunk);
            asoc.assign_ssn(chunk);

            // The retransmit queue owns the chunk from here on; the packet
            // keeps a working copy for serialization.
            asoc.outqueue.inflight.push(chunk.clone());
        }
    }

    /// Appends a chunk to the offered packet, reporting back any inability
    /// to do so.
    fn append_inner(
        &mut self,
        chunk: OutboundChunk,
        transport: &mut Transport,
        now: Instant,
    ) -> std::result::Result<(), Rejection> {
        let chunk_len = pad4(chunk.wire_len());

        // Check to see if this chunk will fit into the packet
        if let Some(reason) = self.will_fit(&chunk, chunk_len, transport) {
            return Err(Rejection { reason, chunk });
        }

        // We believe that this chunk is OK to add to the packet
        let entry = match chunk {
            OutboundChunk::Data(mut data) => {
                // Account for the data being in the packet
                self.append_data(&mut data, transport, now);
                // Disallow SACK bundling after DATA.
                self.has_sack = true;
                // Disallow AUTH bundling after DATA
                self.has_auth = true;
                // Let it be known that the packet has DATA in it
                self.has_data = true;
                BundledChunk::Data(data)
            }
            OutboundChunk::Auth(auth) => {
                self.has_auth = true;
                BundledChunk::Auth(auth)
            }
            OutboundChunk::Control(control) => {
                match control.chunk.header().typ {
                    CT_COOKIE_ECHO => {
                        self.has_cookie_echo = true;
                    }
                    CT_SACK => {
                        self.has_sack = true;
                        if let Some(asoc) = transport.asoc.as_mut() {
                            asoc.stats.osacks += 1;
                        }
                    }
                    _ => {}
                }
                BundledChunk::Control(control.chunk)
            }
        };

        // It is OK to send this chunk.
        self.chunk_list.push_back(entry);
        self.size += chunk_len;

        Ok(())
    }

    /// Try to bundle an AUTH chunk into the packet.
    fn bundle_auth(
        &mut self,
        chunk: &OutboundChunk,
        transport: &mut Transport,
        now: Instant,
    ) -> std::result::Result<(), RejectReason> {
        // if we don't have an association, we can't do authentication
        if transport.asoc.is_none() {
            return Ok(());
        }

        // See if this is an auth chunk we are bundling, or if auth is
        // already bundled.
        if chunk.typ() == CT_AUTH || self.has_auth {
            return Ok(());
        }

        // if the peer did not request this chunk to be authenticated, don't
        // do it
        if !chunk.auth_required() {
            return Ok(());
        }

        let auth = match transport.asoc.as_ref().and_then(|asoc| asoc.make_auth()) {
            Some(auth) => auth,
            None => return Ok(()),
        };

        // A rejected AUTH chunk dies with the rejection.
        self.append_inner(OutboundChunk::Auth(auth), transport, now)
            .map_err(|rejection| rejection.reason)
    }

    /// Try to bundle a SACK with the packet.
    fn bundle_sack(
        &mut self,
        chunk: &OutboundChunk,
        transport: &mut Transport,
        now: Instant,
    ) -> std::result::Result<(), RejectReason> {
        // If sending DATA, and there hasn't already been a SACK bundled, try
        // to bundle one into the packet.
        if !chunk.is_data() || self.has_sack || self.has_cookie_echo {
            return Ok(());
        }

        let sack = {
            let asoc = match transport.asoc.as_mut() {
                Some(asoc) => asoc,
                None => return Ok(()),
            };

            // If the SACK timer is running, we have a pending SACK
            if asoc.timers.sack.is_none() {
                return Ok(());
            }

            // A stale SACK request is left for its own transport.
            if transport.sack_generation != asoc.peer.sack_generation {
                return Ok(());
            }

            // Freeze the advertised window into the SACK.
            asoc.a_rwnd = asoc.rwnd;
            match asoc.make_sack() {
                Some(sack) => sack,
                None => return Ok(()),
            }
        };

        self.append_inner(OutboundChunk::control(Box::new(sack)), transport, now)
            .map_err(|rejection| rejection.reason)?;

        if let Some(asoc) = transport.asoc.as_mut() {
            asoc.peer.sack_needed = false;
            // Cancel the pending SACK timer.
            asoc.timers.sack = None;
        }

        Ok(())
    }

    /// Serializes the queued chunks into one or more envelopes and hands
    /// them to the IP layer.
    ///
    /// Resource problems (no route, offload mismatch, a chunk that cannot
    /// share a segment with its AUTH cover) release the control chunks and
    /// report success; DATA remains in the retransmit queue for a later
    /// attempt, so a transient condition on one path does not fail the
    /// association. Errors from the transmit hook do propagate.
    pub fn transmit(&mut self, transport: &mut Transport, now: Instant) -> Result<()> {
        // Do NOT generate a chunkless packet.
        if self.chunk_list.is_empty() {
            return Ok(());
        }

        match self.build_and_send(transport, now) {
            Some(result) => {
                self.reset();
                result
            }
            None => {
                // Control chunks die here; DATA chunks are still owned by the
                // retransmit queue and will be picked up again.
                self.chunk_list.clear();
                self.reset();
                Ok(())
            }
        }
    }

    /// The body of `transmit`. `None` reports a swallowed resource failure;
    /// the caller releases the remaining chunks and resets.
    fn build_and_send(&mut self, transport: &mut Transport, now: Instant) -> Option<Result<()>> {
        let can_gso = transport
            .asoc
            .as_ref()
            .map_or(false, |asoc| asoc.sk.can_gso());

        let mut gso = false;
        if self.size > transport.pathmtu as usize && !self.ipfragok {
            if can_gso {
                gso = true;
            } else {
                // If this happens, we trash this packet and try to build a
                // new one, hopefully correct this time. The application may
                // notice the error.
                static GSO_UNSUPPORTED: Once = Once::new();
                GSO_UNSUPPORTED.call_once(|| {
                    error!("trying to segment an oversized packet on a socket that cannot offload");
                });
                return None;
            }
        }

        let mut pkt_size = if gso { self.overhead } else { self.size };
        let mut head = BytesMut::with_capacity(pkt_size + MAX_HEADER);

        // Refresh a stale route before using it.
        if !transport.dst_check() {
            transport.route();
        }
        let dst = match transport.dst.clone() {
            Some(dst) => dst,
            None => {
                if let Some(asoc) = transport.asoc.as_mut() {
                    asoc.stats.out_no_routes += 1;
                }
                return None;
            }
        };

        // Build the SCTP header.
        //
        // From 6.8 Checksum Calculation: after the packet is constructed,
        // fill in the proper Verification Tag in the SCTP common header and
        // initialize the checksum field to 0's.
        head.put_u16(self.source_port);
        head.put_u16(self.destination_port);
        head.put_u32(self.vtag);
        head.put_u32(0);

        let mut frag_list: Vec<Bytes> = vec![];
        let mut pktcount: u16 = 0;
        let mut has_data = false;

        loop {
            pktcount += 1;

            // Calculate the segment size so it fits in the PMTU. Leave other
            // chunks for the next segments.
            if gso {
                pkt_size = self.overhead;
                let mut auth_len = 0;
                for chunk in &self.chunk_list {
                    let padded = pad4(chunk.wire_len());

                    if let BundledChunk::Auth(_) = chunk {
                        auth_len = padded;
                    } else if auth_len + padded + self.overhead > transport.pathmtu as usize {
                        // This chunk can never share a segment with its AUTH
                        // cover.
                        return None;
                    } else if pkt_size + padded > transport.pathmtu as usize {
                        break;
                    }
                    pkt_size += padded;
                }
            }

            let mut segment = BytesMut::with_capacity(pkt_size + MAX_HEADER);
            let mut remaining = pkt_size - self.overhead;
            let mut auth_offset: Option<usize> = None;
            let mut auth_chunk: Option<ChunkAuth> = None;

            // 3.2 Chunk Field Descriptions
            //
            // The total length of a chunk (including Type, Length and Value
            // fields) MUST be a multiple of 4 bytes. If the length of the
            // chunk is not a multiple of 4 bytes, the sender MUST pad the
            // chunk with all zero bytes, and this padding is not included in
            // the chunk length field. The sender should never pad with more
            // than 3 bytes.
            while let Some(chunk) = self.chunk_list.pop_front() {
                let wire_len = chunk.wire_len();
                let padded = pad4(wire_len);

                match chunk {
                    BundledChunk::Data(mut data) => {
                        // 6.3.1 C4: when data is in flight, a new RTT
                        // measurement MUST be made each round trip, and
                        // SHOULD be made no more than once per round trip per
                        // destination transport address.
                        if !data.resent && !transport.rto_pending {
                            data.rtt_in_progress = true;
                            transport.rto_pending = true;
                            if let Some(asoc) = transport.asoc.as_mut() {
                                if let Some(owned) = asoc.outqueue.inflight.get_mut(data.tsn) {
                                    owned.rtt_in_progress = true;
                                }
                            }
                        }
                        has_data = true;

                        trace!(
                            "serializing DATA: tsn={} len={} rtt_in_progress={}",
                            data.tsn,
                            wire_len,
                            data.rtt_in_progress
                        );

                        if data.marshal_to(&mut segment).is_err() {
                            return None;
                        }
                        // the retransmit queue keeps the canonical chunk
                    }
                    BundledChunk::Auth(auth) => {
                        // Remember where the AUTH chunk starts so the MAC can
                        // be filled in once the segment is complete.
                        auth_offset = Some(segment.len());
                        if auth.marshal_to(&mut segment).is_err() {
                            return None;
                        }
                        auth_chunk = Some(auth);
                    }
                    BundledChunk::Control(control) => {
                        if control.marshal_to(&mut segment).is_err() {
                            return None;
                        }
                        // this was our last reference, the chunk drops here
                    }
                }

                let padding = padded - wire_len;
                if padding != 0 {
                    segment.extend_from_slice(&[0u8; PADDING_MULTIPLE][..padding]);
                }

                remaining = match remaining.checked_sub(padded) {
                    Some(remaining) => remaining,
                    None => {
                        static ACCOUNTING: Once = Once::new();
                        ACCOUNTING.call_once(|| {
                            warn!("segment accounting disagreed with the chunk list");
                        });
                        return None;
                    }
                };
                if remaining == 0 {
                    break;
                }
            }

            // SCTP-AUTH, Section 6.2
            //
            //   The sender MUST calculate the MAC using the hash function
            //   described by the MAC Identifier and the shared association
            //   key. The 'data' used for the computation is the AUTH chunk
            //   with its HMAC field set to zero followed by all chunks that
            //   are placed after the AUTH chunk in the SCTP packet.
            if let Some(offset) = auth_offset {
                if let Some(info) = transport.asoc.as_ref().and_then(|asoc| asoc.auth.as_ref()) {
                    match calculate_hmac(info.algorithm, &info.active_key, &segment[offset..]) {
                        Ok(mac) => {
                            let start = offset + AUTH_HMAC_OFFSET;
                            segment[start..start + mac.len()].copy_from_slice(&mac);
                        }
                        Err(err) => warn!("failed to compute the AUTH chunk MAC: {}", err),
                    }
                }
            }

            // Re-queue the AUTH chunk when more segments follow; it has to
            // cover each of them in turn.
            if let Some(auth) = auth_chunk.take() {
                if !self.chunk_list.is_empty() {
                    self.chunk_list.push_front(BundledChunk::Auth(auth));
                }
            }

            if !gso {
                head.extend_from_slice(&segment);
                break;
            }

            frag_list.push(segment.freeze());
            if pktcount >= dst.dev.gso_max_segs {
                static SEGS_OVERFLOW: Once = Once::new();
                SEGS_OVERFLOW.call_once(|| {
                    warn!("segmented envelope exceeded the device segment limit");
                });
                return None;
            }

            if self.chunk_list.is_empty() {
                break;
            }
        }

        // Calculate the CRC32-C checksum of the whole packet, including the
        // SCTP common header and all the chunks. For a segmented envelope it
        // is postponed to the segmentation step.
        let checksum_disable = transport
            .asoc
            .as_ref()
            .map_or(false, |asoc| asoc.sk.checksum_disable);
        let checksum = if !checksum_disable || gso {
            if !gso && (!dst.dev.sctp_crc_offload || dst.xfrm || self.ipfragok) {
                let mut digest = ISCSI_CRC.digest();
                digest.update(&head);
                let crc = digest.finalize();
                head[8..12].copy_from_slice(&crc.to_le_bytes());
                ChecksumState::Filled
            } else {
                // no need to seed a pseudo checksum for SCTP
                ChecksumState::Offloaded { offset: 8 }
            }
        } else {
            ChecksumState::Disabled
        };

        // IP layer ECN support, RFC 2481: the ECT bit is set by the data
        // sender to indicate that the endpoints of the transport protocol
        // are ECN-capable. Setting it all the time causes no problems
        // protocol-wise even if our peer ignores it.
        transport.af_specific.ecn_capable();

        // Dump that on IP!
        if let Some(asoc) = transport.asoc.as_mut() {
            asoc.stats.opackets += u64::from(pktcount);
            if asoc.peer.last_sent_to != Some(transport.remote_addr) {
                asoc.peer.last_sent_to = Some(transport.remote_addr);
            }
        }

        if has_data {
            // Restart the AUTOCLOSE timer when sending data.
            if let Some(asoc) = transport.asoc.as_mut() {
                if asoc.state == AssociationState::Established {
                    if let Some(timeout) = asoc.autoclose {
                        asoc.timers.autoclose = Some(now + timeout);
                    }
                }
            }
        }

        let (gso_segs, gso_size) = if gso {
            // We have to refresh the cached capabilities in case we are
            // transmitting to more than one transport at a time.
            if let Some(asoc) = transport.asoc.as_mut() {
                let cached = asoc
                    .sk
                    .dst_cache
                    .as_ref()
                    .map_or(false, |cached| Arc::ptr_eq(cached, &dst));
                if !cached {
                    asoc.sk.setup_caps(&dst);
                }
            }
            (pktcount, GSO_BY_FRAGS)
        } else {
            (0, 0)
        };

        debug!(
            "transmitting packet: head_len={} segments={}",
            head.len(),
            pktcount
        );

        let envelope = Envelope {
            remote: transport.remote_addr,
            head: head.freeze(),
            frag_list,
            gso_segs,
            gso_size,
            checksum,
            ignore_df: self.ipfragok,
        };

        Some(transport.af_specific.sctp_xmit(envelope))
    }
}
