use super::*;

use crate::association::{Association, AuthInfo};
use crate::auth::HmacAlgorithm;
use crate::chunk::chunk_cookie_ack::ChunkCookieAck;
use crate::chunk::chunk_cookie_echo::ChunkCookieEcho;
use crate::chunk::chunk_heartbeat::ChunkHeartbeat;
use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
use crate::error::Error;
use crate::packet::Packet;
use crate::transport::{AfSpecific, Dst, NetDevice};

use assert_matches::assert_matches;
use bytes::Bytes;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
struct MockAf {
    sent: Arc<Mutex<Vec<Envelope>>>,
    ecn_calls: Arc<Mutex<usize>>,
    dst: Option<Arc<Dst>>,
    fail_with: Option<Error>,
}

impl AfSpecific for MockAf {
    fn sctp_xmit(&mut self, envelope: Envelope) -> Result<()> {
        if let Some(err) = self.fail_with.clone() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }

    fn ecn_capable(&mut self) {
        *self.ecn_calls.lock().unwrap() += 1;
    }

    fn get_dst(&mut self) -> Option<Arc<Dst>> {
        self.dst.clone()
    }
}

fn remote_v4() -> SocketAddr {
    SocketAddr::from_str("192.0.2.1:5000").unwrap()
}

fn new_transport_with_dst(dst: Arc<Dst>) -> (Transport, MockAf) {
    let af = MockAf {
        dst: Some(dst.clone()),
        ..Default::default()
    };
    let mut transport = Transport::new(remote_v4(), Box::new(af.clone()));
    transport.dst = Some(dst);
    (transport, af)
}

fn new_transport() -> (Transport, MockAf) {
    new_transport_with_dst(Arc::new(Dst::default()))
}

fn gso_dst() -> Arc<Dst> {
    Arc::new(Dst {
        dev: NetDevice {
            gso: true,
            gso_max_size: 65536,
            gso_max_segs: 64,
            sctp_crc_offload: false,
        },
        xfrm: false,
        obsolete: false,
    })
}

fn established_association() -> Association {
    let mut asoc = Association::new(1500);
    asoc.state = AssociationState::Established;
    asoc.peer.rwnd = 1024 * 1024;
    asoc
}

/// A DATA chunk carrying `payload_len` bytes of user data.
fn make_data(payload_len: usize) -> ChunkPayloadData {
    ChunkPayloadData {
        beginning_fragment: true,
        ending_fragment: true,
        user_data: Bytes::from(vec![0xabu8; payload_len]),
        ..Default::default()
    }
}

#[test]
fn test_append_data_without_association() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport();

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(0x0102_0304, false, &mut transport, now);

    // no association to learn a family from, so the IPv6 header is assumed
    assert_eq!(packet.overhead(), 40 + PACKET_HEADER_SIZE);
    assert!(packet.is_empty());

    // a 100 byte DATA chunk (header included), already 4 byte aligned
    let chunk = make_data(100 - DATA_CHUNK_HEADER_SIZE);
    packet
        .append_chunk(OutboundChunk::Data(chunk), &mut transport, now)
        .unwrap();
    assert_eq!(packet.size(), packet.overhead() + 100);
    assert!(!packet.is_empty());

    packet.transmit(&mut transport, now)?;
    assert!(packet.is_empty());

    let sent = af.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let envelope = &sent[0];
    assert_eq!(envelope.gso_segs, 0);
    assert_eq!(envelope.checksum, ChecksumState::Filled);
    assert!(!envelope.ignore_df);
    assert_eq!(envelope.head.len(), PACKET_HEADER_SIZE + 100);

    // the wire bytes parse back, which also validates the checksum
    let parsed = Packet::unmarshal(&envelope.head)?;
    assert_eq!(parsed.common_header.source_port, 5000);
    assert_eq!(parsed.common_header.destination_port, 5000);
    assert_eq!(parsed.common_header.verification_tag, 0x0102_0304);
    assert_eq!(parsed.chunks.len(), 1);
    assert_eq!(parsed.chunks[0].header().typ, CT_PAYLOAD_DATA);

    assert_eq!(*af.ecn_calls.lock().unwrap(), 1);

    Ok(())
}

#[test]
fn test_second_large_chunk_needs_a_flush() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport();

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    packet
        .append_chunk(
            OutboundChunk::Data(make_data(800 - DATA_CHUNK_HEADER_SIZE)),
            &mut transport,
            now,
        )
        .unwrap();
    assert_eq!(transport.flight_size, 800 - DATA_CHUNK_HEADER_SIZE as u32);

    let rejection = packet
        .append_chunk(
            OutboundChunk::Data(make_data(800 - DATA_CHUNK_HEADER_SIZE)),
            &mut transport,
            now,
        )
        .unwrap_err();
    assert_eq!(rejection.reason, RejectReason::PmtuFull);
    // the refused chunk mutated nothing
    assert_eq!(transport.flight_size, 800 - DATA_CHUNK_HEADER_SIZE as u32);
    assert_eq!(packet.size(), packet.overhead() + 800);

    // flush, then the refused chunk fits the emptied packet
    packet.transmit(&mut transport, now)?;
    packet
        .append_chunk(rejection.chunk, &mut transport, now)
        .unwrap();
    assert_eq!(packet.size(), packet.overhead() + 800);
    assert_eq!(af.sent.lock().unwrap().len(), 1);

    Ok(())
}

#[test]
fn test_rwnd_full_rejects_and_mutates_nothing() {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut asoc = established_association();
    asoc.peer.rwnd = 0;
    asoc.outqueue.outstanding_bytes = 1200;
    transport.asoc = Some(asoc);
    transport.flight_size = 1200;

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    let rejection = packet
        .append_chunk(OutboundChunk::Data(make_data(500)), &mut transport, now)
        .unwrap_err();
    assert_eq!(rejection.reason, RejectReason::RwndFull);

    let asoc = transport.asoc.as_ref().unwrap();
    assert_eq!(transport.flight_size, 1200);
    assert_eq!(asoc.outqueue.outstanding_bytes, 1200);
    assert_eq!(asoc.peer.rwnd, 0);
    assert!(asoc.outqueue.inflight.is_empty());
    assert!(packet.is_empty());

    match rejection.chunk {
        OutboundChunk::Data(data) => {
            assert_eq!(data.nsent, 0);
            assert!(data.sent_at.is_none());
            assert!(!data.has_tsn);
        }
        other => panic!("expected the DATA chunk back, got {:?}", other),
    }
}

#[test]
fn test_cwnd_gate_is_bypassed_for_fast_retransmit() {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    asoc.outqueue.outstanding_bytes = 5000;
    transport.asoc = Some(asoc);
    transport.cwnd = 4000;
    transport.flight_size = 5000;

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    let rejection = packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap_err();
    assert_eq!(rejection.reason, RejectReason::RwndFull);

    let mut chunk = make_data(100);
    chunk.fast_retransmit = FastRetransmit::Needed;
    packet
        .append_chunk(OutboundChunk::Data(chunk), &mut transport, now)
        .unwrap();
}

#[test]
fn test_zero_window_probe() {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut asoc = established_association();
    asoc.peer.rwnd = 0;
    asoc.outqueue.outstanding_bytes = 0;
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    // nothing is in flight, so one chunk may probe the closed window
    packet
        .append_chunk(OutboundChunk::Data(make_data(500)), &mut transport, now)
        .unwrap();

    let asoc = transport.asoc.as_ref().unwrap();
    assert_eq!(transport.flight_size, 500);
    assert_eq!(asoc.outqueue.outstanding_bytes, 500);
    assert_eq!(asoc.peer.rwnd, 0);
    assert_eq!(asoc.outqueue.inflight.len(), 1);
}

#[test]
fn test_nagle_delays_small_chunk() {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut asoc = established_association();
    asoc.peer.rwnd = 65536;
    asoc.outqueue.outstanding_bytes = 400;
    asoc.outqueue.out_qlen = 0;
    transport.asoc = Some(asoc);
    transport.flight_size = 400;

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    let rejection = packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap_err();
    assert_eq!(rejection.reason, RejectReason::Delay);
    assert!(packet.is_empty());

    // a chunk from a message that must not be delayed goes out regardless
    let mut urgent = make_data(100);
    urgent.can_delay = false;
    packet
        .append_chunk(OutboundChunk::Data(urgent), &mut transport, now)
        .unwrap();
}

#[test]
fn test_nagle_disabled_sends_immediately() {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    asoc.peer.rwnd = 65536;
    asoc.outqueue.outstanding_bytes = 400;
    transport.asoc = Some(asoc);
    transport.flight_size = 400;

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap();
}

#[test]
fn test_auth_is_bundled_before_data() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport();

    let key: &[u8] = b"sctp auth test key";
    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    asoc.auth = Some(AuthInfo {
        shared_key_id: 1,
        algorithm: HmacAlgorithm::Sha256,
        active_key: Bytes::from_static(key),
    });
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(7, false, &mut transport, now);

    let mut data = make_data(100);
    data.auth = true;
    packet
        .append_chunk(OutboundChunk::Data(data), &mut transport, now)
        .unwrap();
    assert!(packet.has_auth());

    packet.transmit(&mut transport, now)?;

    let sent = af.sent.lock().unwrap();
    let envelope = &sent[0];
    let parsed = Packet::unmarshal(&envelope.head)?;
    assert_eq!(parsed.chunks.len(), 2);
    assert_eq!(parsed.chunks[0].header().typ, CT_AUTH);
    assert_eq!(parsed.chunks[1].header().typ, CT_PAYLOAD_DATA);

    // the MAC covers the AUTH chunk with a zeroed HMAC field followed by
    // every chunk after it
    let mac_len = HmacAlgorithm::Sha256.digest_len();
    let mut coverage = envelope.head[PACKET_HEADER_SIZE..].to_vec();
    let mac_in_packet = coverage[AUTH_HMAC_OFFSET..AUTH_HMAC_OFFSET + mac_len].to_vec();
    for b in &mut coverage[AUTH_HMAC_OFFSET..AUTH_HMAC_OFFSET + mac_len] {
        *b = 0;
    }
    let expected = calculate_hmac(HmacAlgorithm::Sha256, key, &coverage)?;
    assert_eq!(mac_in_packet, expected);

    Ok(())
}

#[test]
fn test_auth_bundled_once_per_packet() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport();

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    asoc.auth = Some(AuthInfo {
        shared_key_id: 0,
        algorithm: HmacAlgorithm::Sha1,
        active_key: Bytes::from_static(b"key"),
    });
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(7, false, &mut transport, now);

    for _ in 0..2 {
        let mut data = make_data(100);
        data.auth = true;
        packet
            .append_chunk(OutboundChunk::Data(data), &mut transport, now)
            .unwrap();
    }

    packet.transmit(&mut transport, now)?;

    let sent = af.sent.lock().unwrap();
    let parsed = Packet::unmarshal(&sent[0].head)?;
    assert_eq!(parsed.chunks.len(), 3);
    assert_eq!(parsed.chunks[0].header().typ, CT_AUTH);
    assert_eq!(parsed.chunks[1].header().typ, CT_PAYLOAD_DATA);
    assert_eq!(parsed.chunks[2].header().typ, CT_PAYLOAD_DATA);

    Ok(())
}

#[test]
fn test_gso_segments_oversized_contents() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport_with_dst(gso_dst());
    transport.cwnd = 1_000_000;

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(9, false, &mut transport, now);

    for _ in 0..10 {
        packet
            .append_chunk(
                OutboundChunk::Data(make_data(1000 - DATA_CHUNK_HEADER_SIZE)),
                &mut transport,
                now,
            )
            .unwrap();
    }
    assert_eq!(packet.size(), packet.overhead() + 10_000);

    packet.transmit(&mut transport, now)?;

    let sent = af.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let envelope = &sent[0];

    // chunks are never split, so each 1500 byte segment carries one whole
    // 1000 byte chunk
    assert_eq!(envelope.gso_segs, 10);
    assert_eq!(envelope.gso_size, GSO_BY_FRAGS);
    assert_eq!(envelope.head.len(), PACKET_HEADER_SIZE);
    assert_eq!(envelope.frag_list.len(), 10);
    for frag in &envelope.frag_list {
        assert!(frag.len() + packet.overhead() <= 1500);
    }
    assert_eq!(
        envelope.frag_list.iter().map(|f| f.len()).sum::<usize>(),
        10_000
    );
    assert_matches!(envelope.checksum, ChecksumState::Offloaded { .. });

    let asoc = transport.asoc.as_ref().unwrap();
    assert_eq!(asoc.stats.opackets, 10);

    Ok(())
}

#[test]
fn test_gso_requeues_auth_for_every_segment() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport_with_dst(gso_dst());
    transport.cwnd = 1_000_000;

    let key: &[u8] = b"segmented auth key";
    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    asoc.auth = Some(AuthInfo {
        shared_key_id: 2,
        algorithm: HmacAlgorithm::Sha256,
        active_key: Bytes::from_static(key),
    });
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(9, false, &mut transport, now);

    for _ in 0..3 {
        let mut data = make_data(1000 - DATA_CHUNK_HEADER_SIZE);
        data.auth = true;
        packet
            .append_chunk(OutboundChunk::Data(data), &mut transport, now)
            .unwrap();
    }

    packet.transmit(&mut transport, now)?;

    let sent = af.sent.lock().unwrap();
    let envelope = &sent[0];
    assert_eq!(envelope.gso_segs, 3);
    assert_eq!(envelope.frag_list.len(), 3);

    let mac_len = HmacAlgorithm::Sha256.digest_len();
    for frag in &envelope.frag_list {
        // every segment restarts its coverage with its own AUTH chunk
        assert_eq!(frag[0], 0x0f);

        let mut coverage = frag.to_vec();
        let mac_in_packet = coverage[AUTH_HMAC_OFFSET..AUTH_HMAC_OFFSET + mac_len].to_vec();
        for b in &mut coverage[AUTH_HMAC_OFFSET..AUTH_HMAC_OFFSET + mac_len] {
            *b = 0;
        }
        let expected = calculate_hmac(HmacAlgorithm::Sha256, key, &coverage)?;
        assert_eq!(mac_in_packet, expected);
    }

    Ok(())
}

#[test]
fn test_sack_is_bundled_with_data() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport();
    transport.sack_generation = 5;

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    asoc.peer.sack_needed = true;
    asoc.peer.sack_generation = 5;
    asoc.timers.sack = Some(now + Duration::from_millis(200));
    asoc.rwnd = 9000;
    asoc.peer_last_tsn = 123;
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(3, false, &mut transport, now);

    packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap();

    {
        let asoc = transport.asoc.as_ref().unwrap();
        assert!(!asoc.peer.sack_needed);
        assert!(asoc.timers.sack.is_none());
        assert_eq!(asoc.a_rwnd, 9000);
        assert_eq!(asoc.stats.osacks, 1);
    }

    packet.transmit(&mut transport, now)?;

    let sent = af.sent.lock().unwrap();
    let parsed = Packet::unmarshal(&sent[0].head)?;
    assert_eq!(parsed.chunks.len(), 2);
    assert_eq!(parsed.chunks[0].header().typ, CT_SACK);
    assert_eq!(parsed.chunks[1].header().typ, CT_PAYLOAD_DATA);

    let sack = parsed.chunks[0]
        .as_any()
        .downcast_ref::<ChunkSelectiveAck>()
        .unwrap();
    assert_eq!(sack.cumulative_tsn_ack, 123);
    assert_eq!(sack.advertised_receiver_window_credit, 9000);

    Ok(())
}

#[test]
fn test_stale_sack_generation_is_skipped() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport();
    transport.sack_generation = 4;

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    asoc.peer.sack_needed = true;
    asoc.peer.sack_generation = 5;
    asoc.timers.sack = Some(now + Duration::from_millis(200));
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(3, false, &mut transport, now);
    packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap();

    // the pending SACK belongs to another transport's generation
    let asoc = transport.asoc.as_ref().unwrap();
    assert!(asoc.peer.sack_needed);
    assert!(asoc.timers.sack.is_some());

    packet.transmit(&mut transport, now)?;
    let sent = af.sent.lock().unwrap();
    let parsed = Packet::unmarshal(&sent[0].head)?;
    assert_eq!(parsed.chunks.len(), 1);
    assert_eq!(parsed.chunks[0].header().typ, CT_PAYLOAD_DATA);

    Ok(())
}

#[test]
fn test_cookie_echo_blocks_sack_bundling() -> Result<()> {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();
    transport.sack_generation = 1;

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    asoc.peer.sack_needed = true;
    asoc.peer.sack_generation = 1;
    asoc.timers.sack = Some(now + Duration::from_millis(200));
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(3, false, &mut transport, now);

    packet
        .append_chunk(
            OutboundChunk::control(Box::new(ChunkCookieEcho {
                cookie: Bytes::from_static(b"cookie"),
            })),
            &mut transport,
            now,
        )
        .unwrap();
    assert!(packet.has_cookie_echo());

    packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap();

    // DATA may ride along with the COOKIE-ECHO, but no SACK joins it
    let asoc = transport.asoc.as_ref().unwrap();
    assert!(asoc.peer.sack_needed);
    assert!(asoc.timers.sack.is_some());
    assert_eq!(asoc.stats.osacks, 0);

    Ok(())
}

#[test]
fn test_transmit_chunk_flushes_and_retries() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport();

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    packet
        .append_chunk(
            OutboundChunk::Data(make_data(800 - DATA_CHUNK_HEADER_SIZE)),
            &mut transport,
            now,
        )
        .unwrap();

    packet
        .transmit_chunk(
            OutboundChunk::Data(make_data(800 - DATA_CHUNK_HEADER_SIZE)),
            false,
            &mut transport,
            now,
        )
        .unwrap();

    // the full packet went to the wire and the retried chunk sits in the
    // fresh one
    assert_eq!(af.sent.lock().unwrap().len(), 1);
    assert_eq!(packet.size(), packet.overhead() + 800);

    Ok(())
}

#[test]
fn test_transmit_chunk_one_packet_does_not_retry() {
    let now = Instant::now();
    let (mut transport, af) = new_transport();

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    packet
        .append_chunk(
            OutboundChunk::Data(make_data(800 - DATA_CHUNK_HEADER_SIZE)),
            &mut transport,
            now,
        )
        .unwrap();

    let rejection = packet
        .transmit_chunk(
            OutboundChunk::Data(make_data(800 - DATA_CHUNK_HEADER_SIZE)),
            true,
            &mut transport,
            now,
        )
        .unwrap_err();
    assert_eq!(rejection.reason, RejectReason::PmtuFull);

    // the old contents were still flushed
    assert_eq!(af.sent.lock().unwrap().len(), 1);
    assert!(packet.is_empty());
}

#[test]
fn test_transmit_chunk_never_flushes_a_cookie_echo_packet() {
    let now = Instant::now();
    let (mut transport, af) = new_transport();

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    packet
        .append_chunk(
            OutboundChunk::control(Box::new(ChunkCookieEcho {
                cookie: Bytes::from(vec![0u8; 1400]),
            })),
            &mut transport,
            now,
        )
        .unwrap();

    let rejection = packet
        .transmit_chunk(OutboundChunk::Data(make_data(100)), false, &mut transport, now)
        .unwrap_err();
    assert_eq!(rejection.reason, RejectReason::PmtuFull);
    assert!(af.sent.lock().unwrap().is_empty());
    assert!(packet.has_cookie_echo());
}

#[test]
fn test_control_chunk_after_data_must_flush() {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    // fill the packet up to exactly the path MTU
    packet
        .append_chunk(
            OutboundChunk::Data(make_data(1448 - DATA_CHUNK_HEADER_SIZE)),
            &mut transport,
            now,
        )
        .unwrap();
    assert_eq!(packet.size(), 1500);

    let rejection = packet
        .append_chunk(
            OutboundChunk::control(Box::new(ChunkCookieAck {})),
            &mut transport,
            now,
        )
        .unwrap_err();
    assert_eq!(rejection.reason, RejectReason::PmtuFull);
}

#[test]
fn test_oversized_chunk_in_empty_packet_uses_ip_fragmentation() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport();

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    // larger than the path MTU on its own
    packet
        .append_chunk(
            OutboundChunk::Data(make_data(2000 - DATA_CHUNK_HEADER_SIZE)),
            &mut transport,
            now,
        )
        .unwrap();
    assert!(packet.ipfragok());

    packet.transmit(&mut transport, now)?;

    let sent = af.sent.lock().unwrap();
    let envelope = &sent[0];
    assert!(envelope.ignore_df);
    assert_eq!(envelope.gso_segs, 0);
    assert_eq!(envelope.head.len(), PACKET_HEADER_SIZE + 2000);
    // fragmented packets keep the software checksum
    assert_eq!(envelope.checksum, ChecksumState::Filled);
    Packet::unmarshal(&envelope.head)?;

    Ok(())
}

#[test]
fn test_rtt_measurement_rides_on_first_fresh_chunk() -> Result<()> {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    transport.asoc = Some(asoc);

    let first_tsn = transport.asoc.as_ref().unwrap().my_next_tsn;

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap();
    packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap();
    packet.transmit(&mut transport, now)?;

    assert!(transport.rto_pending);
    let asoc = transport.asoc.as_ref().unwrap();
    let first = asoc.outqueue.inflight.get(first_tsn).unwrap();
    let second = asoc
        .outqueue
        .inflight
        .get(first_tsn.wrapping_add(1))
        .unwrap();

    // only one measurement per round trip
    assert!(first.rtt_in_progress);
    assert!(!second.rtt_in_progress);
    assert_eq!(first.nsent, 1);
    assert!(first.sent_at.is_some());

    Ok(())
}

#[test]
fn test_retransmitted_chunk_does_not_restart_rtt() -> Result<()> {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    transport.asoc = Some(asoc);

    let tsn = transport.asoc.as_ref().unwrap().my_next_tsn;

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    let mut data = make_data(100);
    data.resent = true;
    packet
        .append_chunk(OutboundChunk::Data(data), &mut transport, now)
        .unwrap();
    packet.transmit(&mut transport, now)?;

    assert!(!transport.rto_pending);
    let asoc = transport.asoc.as_ref().unwrap();
    assert!(!asoc.outqueue.inflight.get(tsn).unwrap().rtt_in_progress);

    Ok(())
}

#[test]
fn test_autoclose_restarts_on_data() -> Result<()> {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    asoc.autoclose = Some(Duration::from_secs(30));
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    // control-only packets leave the timer alone
    packet
        .append_chunk(
            OutboundChunk::control(Box::new(ChunkCookieAck {})),
            &mut transport,
            now,
        )
        .unwrap();
    packet.transmit(&mut transport, now)?;
    assert!(transport.asoc.as_ref().unwrap().timers.autoclose.is_none());

    packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap();
    packet.transmit(&mut transport, now)?;
    assert_eq!(
        transport.asoc.as_ref().unwrap().timers.autoclose,
        Some(now + Duration::from_secs(30))
    );

    Ok(())
}

#[test]
fn test_post_send_bookkeeping() -> Result<()> {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap();
    packet.transmit(&mut transport, now)?;

    let asoc = transport.asoc.as_ref().unwrap();
    assert_eq!(asoc.stats.opackets, 1);
    assert_eq!(asoc.peer.last_sent_to, Some(remote_v4()));

    Ok(())
}

#[test]
fn test_missing_route_swallows_the_send() -> Result<()> {
    let now = Instant::now();
    let af = MockAf::default();
    let mut transport = Transport::new(remote_v4(), Box::new(af.clone()));

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap();
    packet
        .append_chunk(
            OutboundChunk::control(Box::new(ChunkCookieAck {})),
            &mut transport,
            now,
        )
        .unwrap();

    // the missing route is not an association error
    packet.transmit(&mut transport, now)?;

    assert!(af.sent.lock().unwrap().is_empty());
    assert!(packet.is_empty());

    let asoc = transport.asoc.as_ref().unwrap();
    assert_eq!(asoc.stats.out_no_routes, 1);
    // the DATA chunk survives in the retransmit queue for a later attempt
    assert_eq!(asoc.outqueue.inflight.len(), 1);

    Ok(())
}

#[test]
fn test_xmit_error_propagates() {
    let now = Instant::now();
    let dst = Arc::new(Dst::default());
    let af = MockAf {
        dst: Some(dst.clone()),
        fail_with: Some(Error::ErrHostUnreachable),
        ..Default::default()
    };
    let mut transport = Transport::new(remote_v4(), Box::new(af.clone()));
    transport.dst = Some(dst);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap();

    assert_eq!(
        packet.transmit(&mut transport, now).unwrap_err(),
        Error::ErrHostUnreachable
    );
    // the packet is reset regardless of the outcome
    assert!(packet.is_empty());
}

#[test]
fn test_gso_mismatch_drops_the_packet() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport_with_dst(gso_dst());
    transport.cwnd = 1_000_000;

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    for _ in 0..3 {
        packet
            .append_chunk(
                OutboundChunk::Data(make_data(1000 - DATA_CHUNK_HEADER_SIZE)),
                &mut transport,
                now,
            )
            .unwrap();
    }

    // the route lost its offload capability after the chunks were admitted
    let plain = Arc::new(Dst::default());
    transport.dst = Some(plain.clone());
    if let Some(asoc) = transport.asoc.as_mut() {
        asoc.sk.setup_caps(&plain);
    }

    // dropped, not an error; a rebuilt packet will do better
    packet.transmit(&mut transport, now)?;
    assert!(af.sent.lock().unwrap().is_empty());
    assert!(packet.is_empty());

    Ok(())
}

#[test]
fn test_ecne_prepend_on_config() -> Result<()> {
    let now = Instant::now();
    let (mut transport, af) = new_transport();

    let mut asoc = established_association();
    asoc.sk.nodelay = true;
    asoc.need_ecne = true;
    asoc.last_ecne_tsn = 42;
    transport.asoc = Some(asoc);

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, true, &mut transport, now);
    assert_eq!(packet.size(), packet.overhead() + 8);

    // a second config on the non-empty packet must not prepend again
    packet.config(1, true, &mut transport, now);
    assert_eq!(packet.size(), packet.overhead() + 8);

    packet
        .append_chunk(OutboundChunk::Data(make_data(100)), &mut transport, now)
        .unwrap();
    packet.transmit(&mut transport, now)?;

    let sent = af.sent.lock().unwrap();
    let parsed = Packet::unmarshal(&sent[0].head)?;
    assert_eq!(parsed.chunks[0].header().typ, CT_ECNE);
    assert_eq!(
        parsed.chunks.last().unwrap().header().typ,
        CT_PAYLOAD_DATA
    );

    Ok(())
}

#[test]
fn test_size_accounting_includes_padding() {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(1, false, &mut transport, now);

    // 21 byte chunk rounds up to 24 on the wire
    packet
        .append_chunk(OutboundChunk::Data(make_data(5)), &mut transport, now)
        .unwrap();
    assert_eq!(packet.size(), packet.overhead() + 24);

    packet
        .append_chunk(
            OutboundChunk::control(Box::new(ChunkCookieAck {})),
            &mut transport,
            now,
        )
        .unwrap();
    assert_eq!(packet.size(), packet.overhead() + 24 + 4);

    // 14 byte HEARTBEAT (6 bytes of info) rounds up to 16 on the wire
    packet
        .append_chunk(
            OutboundChunk::control(Box::new(ChunkHeartbeat {
                heartbeat_info: Bytes::from_static(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]),
            })),
            &mut transport,
            now,
        )
        .unwrap();
    assert_eq!(packet.size(), packet.overhead() + 24 + 4 + 16);
}

#[test]
fn test_reset_is_idempotent_after_clear() {
    let now = Instant::now();
    let (mut transport, _af) = new_transport();

    let mut packet = OutboundPacket::new(&transport, 5000, 5000);
    packet.config(11, false, &mut transport, now);

    packet
        .append_chunk(
            OutboundChunk::control(Box::new(ChunkCookieEcho {
                cookie: Bytes::from_static(b"cookie"),
            })),
            &mut transport,
            now,
        )
        .unwrap();
    assert!(packet.has_cookie_echo());

    packet.clear();
    packet.reset();
    assert!(packet.is_empty());
    assert!(!packet.has_cookie_echo());
    assert_eq!(packet.size(), packet.overhead());
    assert_eq!(packet.vtag(), 11);

    packet.reset();
    assert!(packet.is_empty());
    assert_eq!(packet.size(), packet.overhead());

    // the emptied packet transmits nothing
    packet.transmit(&mut transport, now).unwrap();
}
