//! Traits implemented by every encodable type.

use crate::error::Error;
use bytes::{Buf, BufMut, BytesMut};

/// Writes a value into a buffer.
pub trait Write {
    /// Appends the encoding of `self` to `buf`.
    fn write(&self, buf: &mut impl BufMut);
}

/// Reports the encoded length of a value before it is written.
pub trait EncodeSize {
    /// Must equal the number of bytes [Write::write] appends.
    fn encode_size(&self) -> usize;
}

/// Marks types whose encoding always has the same length.
pub trait FixedSize {
    const SIZE: usize;
}

impl<T: FixedSize> EncodeSize for T {
    #[inline]
    fn encode_size(&self) -> usize {
        T::SIZE
    }
}

/// Reads a value from a buffer.
///
/// `Cfg` carries whatever bounds are needed to read untrusted input safely (for example, the
/// largest length prefix to accept). Types with nothing to bound use `()`.
pub trait Read: Sized {
    type Cfg: Clone + Send + Sync + 'static;

    /// Consumes the encoding of one value from the front of `buf`.
    fn read_cfg(buf: &mut impl Buf, cfg: &Self::Cfg) -> Result<Self, Error>;
}

/// [Read] without a configuration.
pub trait ReadExt: Read<Cfg = ()> {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        Self::read_cfg(buf, &())
    }
}

impl<T: Read<Cfg = ()>> ReadExt for T {}

/// Encodes a value into a freshly allocated buffer of exactly [EncodeSize::encode_size] bytes.
pub trait Encode: Write + EncodeSize {
    /// # Panics
    ///
    /// Panics if [Write::write] and [EncodeSize::encode_size] disagree.
    fn encode(&self) -> BytesMut {
        let len = self.encode_size();
        let mut buffer = BytesMut::with_capacity(len);
        self.write(&mut buffer);
        assert_eq!(buffer.len(), len, "encode_size does not match write");
        buffer
    }
}

impl<T: Write + EncodeSize> Encode for T {}

/// Decodes a value that must span the whole buffer.
pub trait Decode: Read {
    /// Fails with [Error::ExtraData] if any bytes remain after the value.
    fn decode_cfg(mut buf: impl Buf, cfg: &Self::Cfg) -> Result<Self, Error> {
        let value = Self::read_cfg(&mut buf, cfg)?;
        match buf.remaining() {
            0 => Ok(value),
            left => Err(Error::ExtraData(left)),
        }
    }
}

impl<T: Read> Decode for T {}

/// [Decode] without a configuration.
pub trait DecodeExt: Decode<Cfg = ()> {
    fn decode(buf: impl Buf) -> Result<Self, Error> {
        Self::decode_cfg(buf, &())
    }
}

impl<T: Decode<Cfg = ()>> DecodeExt for T {}

/// Types that can be both encoded and decoded.
pub trait Codec: Encode + Decode {}

impl<T: Encode + Decode> Codec for T {}
