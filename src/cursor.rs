// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::{BigEndian, ByteOrder};

use crate::{Error, Result};

/// Bounds-checked big-endian reader over a borrowed byte slice.
///
/// Every read either returns the requested bytes or fails with
/// [`Error::TruncatedInput`]; the position never moves past the end.
#[derive(Clone, Debug)]
pub(crate) struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub(crate) const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) const fn position(&self) -> usize {
        self.pos
    }

    pub(crate) const fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn seek(&mut self, offset: usize) -> Result<()> {
        if offset > self.data.len() {
            return Err(Error::TruncatedInput);
        }
        self.pos = offset;
        Ok(())
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(Error::TruncatedInput)?;
        let bytes = self.data.get(self.pos..end).ok_or(Error::TruncatedInput)?;
        self.pos = end;
        Ok(bytes)
    }

    /// Everything from the current position to the end.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.data[self.pos..];
        self.pos = self.data.len();
        bytes
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        self.read_bytes(2).map(BigEndian::read_u16)
    }

    pub(crate) fn read_u24(&mut self) -> Result<u32> {
        self.read_bytes(3).map(BigEndian::read_u24)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        self.read_bytes(4).map(BigEndian::read_u32)
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32> {
        self.read_bytes(4).map(BigEndian::read_i32)
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        self.read_bytes(8).map(BigEndian::read_u64)
    }

    /// Read a 16- or 32-bit unsigned integer, depending on `wide`.
    pub(crate) fn read_u16_or_u32(&mut self, wide: bool) -> Result<u32> {
        if wide {
            self.read_u32()
        } else {
            self.read_u16().map(u32::from)
        }
    }

    /// Parse the version and flags of a full box.
    pub(crate) fn read_fullbox_extra(&mut self) -> Result<(u8, u32)> {
        let version = self.read_u8()?;
        let flags = self.read_u24()?;
        Ok((version, flags))
    }
}

#[test]
fn cursor_reads_big_endian() {
    let mut c = ByteCursor::new(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09]);
    assert_eq!(c.read_u8().unwrap(), 0x01);
    assert_eq!(c.read_u16().unwrap(), 0x0203);
    assert_eq!(c.read_u24().unwrap(), 0x04_0506);
    assert_eq!(c.remaining(), 3);
    c.seek(1).unwrap();
    assert_eq!(c.read_u64().unwrap(), 0x0203_0405_0607_0809);
    assert_eq!(c.remaining(), 0);
}

#[test]
fn cursor_never_reads_past_end() {
    let mut c = ByteCursor::new(&[0xff, 0xff, 0xff]);
    assert!(matches!(c.read_u32(), Err(Error::TruncatedInput)));
    // a failed read leaves the position untouched
    assert_eq!(c.position(), 0);
    assert!(matches!(c.seek(4), Err(Error::TruncatedInput)));
    assert!(matches!(c.read_bytes(usize::MAX), Err(Error::TruncatedInput)));
    assert_eq!(c.read_u16_or_u32(false).unwrap(), 0xffff);
    assert!(matches!(c.skip(2), Err(Error::TruncatedInput)));
    assert_eq!(c.rest(), &[0xff]);
}
