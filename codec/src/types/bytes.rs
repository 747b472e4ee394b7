//! [Bytes] is written as a varint length followed by its contents.

use crate::{at_least, EncodeSize, Error, RangeCfg, Read, Write};
use bytes::{Buf, BufMut, Bytes};

impl Write for Bytes {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        self.len().write(buf);
        buf.put_slice(self);
    }
}

impl EncodeSize for Bytes {
    #[inline]
    fn encode_size(&self) -> usize {
        self.len().encode_size() + self.len()
    }
}

impl Read for Bytes {
    /// Allowed lengths.
    type Cfg = RangeCfg;

    #[inline]
    fn read_cfg(buf: &mut impl Buf, lengths: &RangeCfg) -> Result<Self, Error> {
        let len = usize::read_cfg(buf, lengths)?;
        at_least(buf, len)?;
        Ok(buf.copy_to_bytes(len))
    }
}
