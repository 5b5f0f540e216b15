use crate::chunk::chunk_payload_data::ChunkPayloadData;

use fxhash::FxHashMap;

/// The retransmit queue's view of DATA chunks in flight, keyed by TSN.
///
/// The packet builder pushes a chunk here when it accepts it for transmission
/// and touches it again during serialization (RTT measurement flags). Chunks
/// leave the queue when the acknowledgement machinery pops them.
#[derive(Default, Debug)]
pub struct PayloadQueue {
    chunk_map: FxHashMap<u32, ChunkPayloadData>,
    n_bytes: usize,
}

impl PayloadQueue {
    pub fn new() -> Self {
        PayloadQueue::default()
    }

    /// push stores a payload data keyed by its TSN. Pushing a TSN that is
    /// already queued replaces the stored bookkeeping without double counting
    /// its bytes (the retransmission case).
    pub fn push(&mut self, p: ChunkPayloadData) {
        let n_bytes = p.user_data.len();
        if self.chunk_map.insert(p.tsn, p).is_none() {
            self.n_bytes += n_bytes;
        }
    }

    /// pop removes and returns the chunk with the given TSN value.
    pub fn pop(&mut self, tsn: u32) -> Option<ChunkPayloadData> {
        let c = self.chunk_map.remove(&tsn)?;
        self.n_bytes -= c.user_data.len();
        Some(c)
    }

    /// get returns a reference to the ChunkPayloadData with the given TSN value.
    pub fn get(&self, tsn: u32) -> Option<&ChunkPayloadData> {
        self.chunk_map.get(&tsn)
    }

    pub fn get_mut(&mut self, tsn: u32) -> Option<&mut ChunkPayloadData> {
        self.chunk_map.get_mut(&tsn)
    }

    pub fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }

    pub fn len(&self) -> usize {
        self.chunk_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn make_data_chunk(tsn: u32, n_bytes: usize) -> ChunkPayloadData {
        ChunkPayloadData {
            tsn,
            user_data: Bytes::from(vec![0u8; n_bytes]),
            ..Default::default()
        }
    }

    #[test]
    fn test_push_and_pop() {
        let mut q = PayloadQueue::new();
        assert!(q.is_empty());

        q.push(make_data_chunk(1, 10));
        q.push(make_data_chunk(2, 20));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get_num_bytes(), 30);

        assert!(q.get(1).is_some());
        assert!(q.get(3).is_none());

        let c = q.pop(1).expect("tsn 1 should be queued");
        assert_eq!(c.tsn, 1);
        assert_eq!(q.get_num_bytes(), 20);
        assert!(q.pop(1).is_none());
    }

    #[test]
    fn test_push_same_tsn_does_not_double_count() {
        let mut q = PayloadQueue::new();

        let mut c = make_data_chunk(7, 100);
        q.push(c.clone());

        c.nsent = 2;
        q.push(c);

        assert_eq!(q.len(), 1);
        assert_eq!(q.get_num_bytes(), 100);
        assert_eq!(q.get(7).unwrap().nsent, 2);
    }
}
