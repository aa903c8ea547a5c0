//! reelshare core: manifest model, integrity hashing, chunk diffing, beacon codec, range math.
//! No sockets; the node crate drives I/O and uses these as building blocks.

pub mod address;
pub mod chunk;
pub mod integrity;
pub mod manifest;
pub mod protocol;
pub mod range;

pub use address::{select_local_ip, InterfaceAddr, DIRECT_LINK_GATEWAY};
pub use chunk::{chunk_spans, is_satisfied, missing_chunks, ChunkSpan, LocalChunk};
pub use integrity::{hash_bytes, hash_reader, verify_hex};
pub use manifest::{ChunkDescriptor, Manifest, ManifestError};
pub use protocol::{Announce, ANNOUNCE_PREFIX, DEFAULT_BEACON_PORT};
pub use range::{ByteRange, RangeRequest, Unsatisfiable};
