//! Order-independent reassembly with a bounded timeout per packet

use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::chunk::{assemble, Chunk};
use crate::codec::{EncodedPacket, PacketHeader};
use crate::error::ChunkError;

/// How many completed packet ids are remembered to discard late duplicates
const COMPLETED_HISTORY: usize = 64;

struct PartialPacket {
    header: PacketHeader,
    parts: Vec<Option<Bytes>>,
    received: usize,
    first_seen: Instant,
}

/// Buffers chunks per packet id until every index is present
pub struct Reassembler {
    pending: HashMap<u32, PartialPacket>,
    completed: VecDeque<u32>,
    timeout: Duration,
    stats: ReassemblerStats,
}

/// Reassembly counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblerStats {
    pub chunks_received: u64,
    pub packets_completed: u64,
    pub packets_timed_out: u64,
    pub duplicate_chunks: u64,
    pub rejected_chunks: u64,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            completed: VecDeque::with_capacity(COMPLETED_HISTORY),
            timeout,
            stats: ReassemblerStats::default(),
        }
    }

    /// Add a chunk; returns the packet the instant its last index arrives
    pub fn insert(&mut self, chunk: Chunk, now: Instant) -> Result<Option<EncodedPacket>, ChunkError> {
        self.stats.chunks_received += 1;

        if chunk.chunk_index >= chunk.chunk_count {
            self.stats.rejected_chunks += 1;
            return Err(ChunkError::IndexOutOfRange {
                index: chunk.chunk_index,
                count: chunk.chunk_count,
            });
        }
        if self.completed.contains(&chunk.packet_id) {
            self.stats.duplicate_chunks += 1;
            return Ok(None);
        }

        let packet_id = chunk.packet_id;
        let partial = self.pending.entry(packet_id).or_insert_with(|| PartialPacket {
            header: chunk.packet_header(),
            parts: vec![None; chunk.chunk_count as usize],
            received: 0,
            first_seen: now,
        });

        if partial.parts.len() != chunk.chunk_count as usize {
            self.stats.rejected_chunks += 1;
            return Err(ChunkError::ChunkCountMismatch {
                packet_id,
                expected: partial.parts.len() as u16,
                actual: chunk.chunk_count,
            });
        }

        let slot = &mut partial.parts[chunk.chunk_index as usize];
        if slot.is_some() {
            self.stats.duplicate_chunks += 1;
            return Ok(None);
        }
        *slot = Some(chunk.bytes);
        partial.received += 1;

        if partial.received < partial.parts.len() {
            return Ok(None);
        }

        let Some(partial) = self.pending.remove(&packet_id) else {
            return Ok(None);
        };
        self.remember_completed(packet_id);
        self.stats.packets_completed += 1;

        Ok(Some(assemble(partial.header, partial.parts.into_iter().flatten())))
    }

    /// Drop partial packets older than the timeout, returning their ids
    pub fn expire(&mut self, now: Instant) -> Vec<u32> {
        let timeout = self.timeout;
        let mut expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.first_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for id in &expired {
            self.pending.remove(id);
            self.remember_completed(*id);
            tracing::debug!(packet_id = id, "partial packet timed out");
        }
        self.stats.packets_timed_out += expired.len() as u64;
        expired
    }

    /// When the oldest partial packet will time out
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.first_seen + self.timeout)
            .min()
    }

    /// Number of packets waiting for chunks
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.completed.clear();
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.stats.clone()
    }

    fn remember_completed(&mut self, packet_id: u32) {
        if self.completed.len() == COMPLETED_HISTORY {
            self.completed.pop_front();
        }
        self.completed.push_back(packet_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionProfile;
    use crate::protocol::split;

    fn packet(id: u32, len: usize) -> EncodedPacket {
        EncodedPacket {
            header: PacketHeader {
                packet_id: id,
                profile: CompressionProfile::Medium,
                original_sample_count: len as u32,
            },
            payload: Bytes::from(vec![id as u8; len]),
        }
    }

    #[test]
    fn test_completes_on_last_chunk_in_any_order() {
        let mut reassembler = Reassembler::new(Duration::from_millis(500));
        let now = Instant::now();
        let original = packet(3, 1500);
        let mut chunks = split(&original, 512).unwrap();
        chunks.reverse();

        let last = chunks.pop().unwrap();
        for chunk in chunks {
            assert_eq!(reassembler.insert(chunk, now).unwrap(), None);
        }
        assert_eq!(reassembler.pending(), 1);
        assert_eq!(reassembler.insert(last, now).unwrap(), Some(original));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_interleaved_packets() {
        let mut reassembler = Reassembler::new(Duration::from_millis(500));
        let now = Instant::now();
        let a = split(&packet(1, 1024), 512).unwrap();
        let b = split(&packet(2, 1024), 512).unwrap();

        assert!(reassembler.insert(a[0].clone(), now).unwrap().is_none());
        assert!(reassembler.insert(b[1].clone(), now).unwrap().is_none());
        assert_eq!(reassembler.insert(b[0].clone(), now).unwrap().unwrap().packet_id(), 2);
        assert_eq!(reassembler.insert(a[1].clone(), now).unwrap().unwrap().packet_id(), 1);
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let mut reassembler = Reassembler::new(Duration::from_millis(500));
        let now = Instant::now();
        let chunks = split(&packet(5, 600), 512).unwrap();

        reassembler.insert(chunks[0].clone(), now).unwrap();
        assert!(reassembler.insert(chunks[0].clone(), now).unwrap().is_none());
        assert!(reassembler.insert(chunks[1].clone(), now).unwrap().is_some());
        // Retransmission after completion
        assert!(reassembler.insert(chunks[1].clone(), now).unwrap().is_none());
        assert_eq!(reassembler.stats().duplicate_chunks, 2);
        assert_eq!(reassembler.stats().packets_completed, 1);
    }

    #[test]
    fn test_count_mismatch_is_rejected() {
        let mut reassembler = Reassembler::new(Duration::from_millis(500));
        let now = Instant::now();
        let chunks = split(&packet(5, 1024), 512).unwrap();
        reassembler.insert(chunks[0].clone(), now).unwrap();

        let mut forged = chunks[1].clone();
        forged.chunk_count = 3;
        assert!(matches!(
            reassembler.insert(forged, now),
            Err(ChunkError::ChunkCountMismatch { packet_id: 5, expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_expire_drops_stale_partials() {
        let mut reassembler = Reassembler::new(Duration::from_millis(500));
        let start = Instant::now();
        let chunks = split(&packet(9, 1024), 512).unwrap();
        reassembler.insert(chunks[0].clone(), start).unwrap();

        assert_eq!(reassembler.next_deadline(), Some(start + Duration::from_millis(500)));
        assert!(reassembler.expire(start + Duration::from_millis(499)).is_empty());
        assert_eq!(reassembler.expire(start + Duration::from_millis(500)), vec![9]);
        assert_eq!(reassembler.pending(), 0);
        assert_eq!(reassembler.stats().packets_timed_out, 1);

        // The straggler of a dropped packet does not reopen it
        assert!(reassembler
            .insert(chunks[1].clone(), start + Duration::from_millis(600))
            .unwrap()
            .is_none());
        assert_eq!(reassembler.pending(), 0);
    }
}
