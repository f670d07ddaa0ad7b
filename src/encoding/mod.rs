//! # Encoding Module
//!
//! Key encodings used by the B+tree:
//!
//! - [`groupvarint`]: group-varint delta compression for ascending u32 key
//!   sequences, the codec behind the compressed block key list
//! - [`keys`]: key type definitions, fixed widths and the typed comparator

pub mod groupvarint;
pub mod keys;
