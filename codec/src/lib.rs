//! Serialize structured data.
//!
//! # Overview
//!
//! A small binary serialization library used to move shard envelopes between
//! servers. It is designed to:
//! - Serialize structured data into a compact, architecture-independent format
//! - Deserialize untrusted input with explicit bounds on every allocation
//!
//! # Supported Types
//!
//! - Primitives: `u8`, `u16`, `bool`, and `usize` (as a bounded varint)
//! - Collections: `Vec<T>`, [bytes::Bytes], and fixed-size arrays `[u8; N]`
//!
//! User-defined types implement [Write], [EncodeSize] (or [FixedSize]), and [Read].
//! [Encode], [Decode], and [Codec] are then provided automatically.
//!
//! # Example
//!
//! ```
//! use bytes::{Buf, BufMut, Bytes};
//! use shardline_codec::{Decode, Encode, EncodeSize, Error, RangeCfg, Read, ReadExt, Write};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Slot {
//!     index: u16,
//!     payload: Bytes,
//! }
//!
//! impl Write for Slot {
//!     fn write(&self, buf: &mut impl BufMut) {
//!         self.index.write(buf);
//!         self.payload.write(buf);
//!     }
//! }
//!
//! impl EncodeSize for Slot {
//!     fn encode_size(&self) -> usize {
//!         self.index.encode_size() + self.payload.encode_size()
//!     }
//! }
//!
//! impl Read for Slot {
//!     type Cfg = RangeCfg;
//!
//!     fn read_cfg(buf: &mut impl Buf, cfg: &Self::Cfg) -> Result<Self, Error> {
//!         let index = u16::read(buf)?;
//!         let payload = Bytes::read_cfg(buf, cfg)?;
//!         Ok(Self { index, payload })
//!     }
//! }
//!
//! let slot = Slot { index: 3, payload: Bytes::from_static(b"shard") };
//! let encoded = slot.encode();
//! let decoded = Slot::decode_cfg(encoded, &RangeCfg::new(..=1024)).unwrap();
//! assert_eq!(slot, decoded);
//! ```

pub mod codec;
pub use codec::{Codec, Decode, DecodeExt, Encode, EncodeSize, FixedSize, Read, ReadExt, Write};
pub mod config;
pub use config::RangeCfg;
pub mod error;
pub use error::Error;
pub mod varint;

mod types {
    mod bytes;
    mod primitives;
    mod vec;
}

/// Returns an error if the buffer holds fewer than `len` bytes.
#[inline]
pub(crate) fn at_least(buf: &impl bytes::Buf, len: usize) -> Result<(), Error> {
    if buf.remaining() < len {
        return Err(Error::EndOfBuffer);
    }
    Ok(())
}
