//! MTU-bounded fragmentation

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::codec::{CompressionProfile, EncodedPacket, PacketHeader};
use crate::error::ChunkError;

/// packetId + chunkIndex + chunkCount
pub const CHUNK_HEADER_LEN: usize = 8;

/// Fixed header plus the packet descriptor
pub const CHUNK_OVERHEAD: usize = CHUNK_HEADER_LEN + 5;

/// One MTU-bounded fragment of a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub packet_id: u32,
    pub chunk_index: u16,
    pub chunk_count: u16,
    pub profile: CompressionProfile,
    pub original_sample_count: u32,
    pub bytes: Bytes,
}

impl Chunk {
    pub fn packet_header(&self) -> PacketHeader {
        PacketHeader {
            packet_id: self.packet_id,
            profile: self.profile,
            original_sample_count: self.original_sample_count,
        }
    }

    /// Serialize for a transport write
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_OVERHEAD + self.bytes.len());
        buf.put_u32(self.packet_id);
        buf.put_u16(self.chunk_index);
        buf.put_u16(self.chunk_count);
        buf.put_u8(self.profile.as_u8());
        buf.put_u32(self.original_sample_count);
        buf.put_slice(&self.bytes);
        buf.freeze()
    }

    /// Parse a received datagram
    pub fn decode(mut data: Bytes) -> Result<Self, ChunkError> {
        if data.len() < CHUNK_OVERHEAD {
            return Err(ChunkError::TooShort(data.len()));
        }

        let packet_id = data.get_u32();
        let chunk_index = data.get_u16();
        let chunk_count = data.get_u16();
        let profile_byte = data.get_u8();
        let original_sample_count = data.get_u32();

        if chunk_count == 0 {
            return Err(ChunkError::InvalidHeader("chunk count is zero".into()));
        }
        if chunk_index >= chunk_count {
            return Err(ChunkError::IndexOutOfRange {
                index: chunk_index,
                count: chunk_count,
            });
        }
        let profile = CompressionProfile::from_u8(profile_byte).ok_or_else(|| {
            ChunkError::InvalidHeader(format!("unknown profile {}", profile_byte))
        })?;

        Ok(Self {
            packet_id,
            chunk_index,
            chunk_count,
            profile,
            original_sample_count,
            bytes: data,
        })
    }
}

/// Slice a packet's payload into ⌈len/mtu⌉ chunks of at most `mtu` bytes.
///
/// An empty payload still yields one (empty) chunk so the packet arrives.
pub fn split(packet: &EncodedPacket, mtu: usize) -> Result<Vec<Chunk>, ChunkError> {
    if mtu == 0 {
        return Err(ChunkError::InvalidMtu(mtu));
    }

    let count = packet.payload.len().div_ceil(mtu).max(1);
    let chunk_count = u16::try_from(count).map_err(|_| ChunkError::PacketTooLarge(count))?;
    let header = packet.header;

    let chunks = (0..count)
        .map(|index| {
            let start = (index * mtu).min(packet.payload.len());
            let end = (start + mtu).min(packet.payload.len());
            Chunk {
                packet_id: header.packet_id,
                chunk_index: index as u16,
                chunk_count,
                profile: header.profile,
                original_sample_count: header.original_sample_count,
                bytes: packet.payload.slice(start..end),
            }
        })
        .collect();

    Ok(chunks)
}

/// Result of merging a set of chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Complete(EncodedPacket),
    Incomplete { received: usize, expected: usize },
}

/// Merge the chunks of one packet, in any order.
///
/// Duplicate indices are ignored; completion depends only on which indices
/// are present.
pub fn merge<I>(chunks: I) -> Result<MergeOutcome, ChunkError>
where
    I: IntoIterator<Item = Chunk>,
{
    let mut parts: BTreeMap<u16, Bytes> = BTreeMap::new();
    let mut first: Option<(PacketHeader, u16)> = None;

    for chunk in chunks {
        match first {
            None => first = Some((chunk.packet_header(), chunk.chunk_count)),
            Some((header, count)) => {
                if chunk.packet_id != header.packet_id {
                    return Err(ChunkError::InvalidHeader(format!(
                        "chunk of packet {} mixed into packet {}",
                        chunk.packet_id, header.packet_id
                    )));
                }
                if chunk.chunk_count != count {
                    return Err(ChunkError::ChunkCountMismatch {
                        packet_id: header.packet_id,
                        expected: count,
                        actual: chunk.chunk_count,
                    });
                }
            }
        }
        if chunk.chunk_index >= chunk.chunk_count {
            return Err(ChunkError::IndexOutOfRange {
                index: chunk.chunk_index,
                count: chunk.chunk_count,
            });
        }
        parts.entry(chunk.chunk_index).or_insert(chunk.bytes);
    }

    let Some((header, count)) = first else {
        return Ok(MergeOutcome::Incomplete {
            received: 0,
            expected: 0,
        });
    };

    if parts.len() < count as usize {
        return Ok(MergeOutcome::Incomplete {
            received: parts.len(),
            expected: count as usize,
        });
    }

    Ok(MergeOutcome::Complete(assemble(header, parts.into_values())))
}

/// Concatenate parts already ordered by index
pub(crate) fn assemble<I>(header: PacketHeader, parts: I) -> EncodedPacket
where
    I: IntoIterator<Item = Bytes>,
{
    let mut payload = BytesMut::new();
    for part in parts {
        payload.put_slice(&part);
    }
    EncodedPacket {
        header,
        payload: payload.freeze(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn packet(id: u32, len: usize) -> EncodedPacket {
        EncodedPacket {
            header: PacketHeader {
                packet_id: id,
                profile: CompressionProfile::None,
                original_sample_count: (len / 2) as u32,
            },
            payload: Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>()),
        }
    }

    #[test]
    fn test_split_sizes() {
        let chunks = split(&packet(1, 1300), 512).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.bytes.len()).collect();
        assert_eq!(sizes, vec![512, 512, 276]);
        assert!(chunks.iter().all(|c| c.chunk_count == 3));
        assert_eq!(
            chunks.iter().map(|c| c.chunk_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_split_exact_multiple() {
        let chunks = split(&packet(1, 4096), 512).unwrap();
        assert_eq!(chunks.len(), 8);
        assert!(chunks.iter().all(|c| c.bytes.len() == 512));
    }

    #[test]
    fn test_split_empty_payload() {
        let chunks = split(&packet(4, 0), 512).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_count, 1);
        assert!(chunks[0].bytes.is_empty());
    }

    #[test]
    fn test_split_rejects_zero_mtu() {
        assert_eq!(split(&packet(1, 10), 0), Err(ChunkError::InvalidMtu(0)));
    }

    #[test]
    fn test_wire_header_layout() {
        let chunk = Chunk {
            packet_id: 0x01020304,
            chunk_index: 2,
            chunk_count: 8,
            profile: CompressionProfile::Medium,
            original_sample_count: 4096,
            bytes: Bytes::from_static(&[0xAA, 0xBB]),
        };
        let wire = chunk.encode();
        assert_eq!(
            &wire[..],
            &[1, 2, 3, 4, 0, 2, 0, 8, 2, 0, 0, 0x10, 0, 0xAA, 0xBB]
        );
        assert_eq!(Chunk::decode(wire).unwrap(), chunk);
    }

    #[test]
    fn test_decode_rejects_bad_headers() {
        assert_eq!(
            Chunk::decode(Bytes::from_static(&[0; 4])),
            Err(ChunkError::TooShort(4))
        );

        let mut bad_index = split(&packet(1, 10), 512).unwrap()[0].clone();
        bad_index.chunk_index = 3;
        assert!(matches!(
            Chunk::decode(bad_index.encode()),
            Err(ChunkError::IndexOutOfRange { index: 3, count: 1 })
        ));

        let mut wire = split(&packet(1, 10), 512).unwrap()[0].encode().to_vec();
        wire[8] = 9;
        assert!(matches!(
            Chunk::decode(Bytes::from(wire)),
            Err(ChunkError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_merge_incomplete() {
        let mut chunks = split(&packet(1, 2000), 512).unwrap();
        chunks.remove(1);
        assert_eq!(
            merge(chunks).unwrap(),
            MergeOutcome::Incomplete {
                received: 3,
                expected: 4
            }
        );
    }

    #[test]
    fn test_merge_rejects_mixed_packets() {
        let mut chunks = split(&packet(1, 1000), 512).unwrap();
        chunks.extend(split(&packet(2, 1000), 512).unwrap());
        assert!(merge(chunks).is_err());
    }

    proptest! {
        #[test]
        fn prop_any_permutation_reassembles(
            (original, chunks) in (0usize..6000).prop_flat_map(|len| {
                let original = packet(7, len);
                let chunks = split(&original, 512).unwrap();
                (Just(original), Just(chunks).prop_shuffle())
            }),
        ) {
            let len = original.len();
            prop_assert_eq!(chunks.len(), len.div_ceil(512).max(1));
            prop_assert!(chunks.iter().all(|c| c.bytes.len() <= 512));

            prop_assert_eq!(merge(chunks).unwrap(), MergeOutcome::Complete(original));
        }
    }
}
