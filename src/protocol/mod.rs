//! Chunk framing shared by sender and receiver
//!
//! The wire layout of a chunk is:
//!
//! ```text
//!  0               4       6       8      9               13
//! ┌───────────────┬───────┬───────┬──────┬───────────────┬──────────────┐
//! │ packetId u32  │ index │ count │ prof │ origSamples   │ payload      │
//! │ (BE)          │ u16   │ u16   │ u8   │ u32 (BE)      │ (<= MTU)     │
//! └───────────────┴───────┴───────┴──────┴───────────────┴──────────────┘
//! ```
//!
//! The first eight bytes are the fixed chunk header; the packet descriptor
//! after it is repeated on every chunk so any chunk can open a reassembly slot.

pub mod chunk;
pub mod reassembly;

pub use chunk::{merge, split, Chunk, MergeOutcome, CHUNK_HEADER_LEN, CHUNK_OVERHEAD};
pub use reassembly::{Reassembler, ReassemblerStats};
