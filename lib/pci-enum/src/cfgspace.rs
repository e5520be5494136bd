// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to device configuration space.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::bits::*;
use crate::cap::CapabilityRecord;
use crate::{Bdf, Error, Result};

/// Width of a single config space access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Width {
    U8,
    U16,
    U32,
}
impl Width {
    pub const fn bytes(self) -> u16 {
        match self {
            Width::U8 => 1,
            Width::U16 => 2,
            Width::U32 => 4,
        }
    }
    pub const fn mask(self) -> u32 {
        match self {
            Width::U8 => 0xff,
            Width::U16 => 0xffff,
            Width::U32 => 0xffff_ffff,
        }
    }
}

/// Platform mechanism for reaching configuration space (port I/O, ECAM,
/// a controller-specific window, ...).
///
/// Implementations are expected to be called by a single writer at a time;
/// the enumeration driver arbitrates access, not this crate.
pub trait ConfigSpaceAccessor {
    /// Read `width` bytes at `offset`. The result is zero-extended.
    fn read(&self, bdf: Bdf, offset: u16, width: Width) -> Result<u32>;

    /// Write the low `width` bytes of `val` at `offset`.
    fn write(
        &mut self,
        bdf: Bdf,
        offset: u16,
        width: Width,
        val: u32,
    ) -> Result<()>;

    fn read_u8(&self, bdf: Bdf, offset: u16) -> Result<u8> {
        Ok(self.read(bdf, offset, Width::U8)? as u8)
    }
    fn read_u16(&self, bdf: Bdf, offset: u16) -> Result<u16> {
        Ok(self.read(bdf, offset, Width::U16)? as u16)
    }
    fn read_u32(&self, bdf: Bdf, offset: u16) -> Result<u32> {
        self.read(bdf, offset, Width::U32)
    }
    fn write_u8(&mut self, bdf: Bdf, offset: u16, val: u8) -> Result<()> {
        self.write(bdf, offset, Width::U8, u32::from(val))
    }
    fn write_u16(&mut self, bdf: Bdf, offset: u16, val: u16) -> Result<()> {
        self.write(bdf, offset, Width::U16, u32::from(val))
    }
    fn write_u32(&mut self, bdf: Bdf, offset: u16, val: u32) -> Result<()> {
        self.write(bdf, offset, Width::U32, val)
    }
}

/// Configuration space held in memory.
///
/// Functions which were never inserted behave like an empty slot on a real
/// bus: reads return all-ones and writes are dropped.
#[derive(Clone, Debug, Default)]
pub struct MemCfgSpace {
    devices: BTreeMap<Bdf, Vec<u8>>,
}

impl MemCfgSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the config image for `bdf`, replacing any previous one.
    ///
    /// # Panics
    ///
    /// If `image` is not exactly [`LEN_CFG`] or [`LEN_CFG_ECAM`] bytes long.
    pub fn insert(&mut self, bdf: Bdf, image: Vec<u8>) {
        assert!(
            image.len() == usize::from(LEN_CFG)
                || image.len() == usize::from(LEN_CFG_ECAM),
            "config image for {} has unexpected length {}",
            bdf,
            image.len()
        );
        self.devices.insert(bdf, image);
    }

    pub fn image(&self, bdf: Bdf) -> Option<&[u8]> {
        self.devices.get(&bdf).map(Vec::as_slice)
    }

    fn span(
        &self,
        bdf: Bdf,
        offset: u16,
        width: Width,
    ) -> Result<Option<std::ops::Range<usize>>> {
        let Some(image) = self.devices.get(&bdf) else {
            return Ok(None);
        };
        let len = width.bytes();
        let end = usize::from(offset) + usize::from(len);
        if offset % len != 0 || end > image.len() {
            return Err(Error::InvalidAccess { bdf, offset, width: len });
        }
        Ok(Some(usize::from(offset)..end))
    }
}

impl ConfigSpaceAccessor for MemCfgSpace {
    fn read(&self, bdf: Bdf, offset: u16, width: Width) -> Result<u32> {
        let Some(span) = self.span(bdf, offset, width)? else {
            return Ok(width.mask());
        };
        let buf = &self.devices[&bdf][span];
        Ok(match width {
            Width::U8 => u32::from(buf[0]),
            Width::U16 => u32::from(LittleEndian::read_u16(buf)),
            Width::U32 => LittleEndian::read_u32(buf),
        })
    }

    fn write(
        &mut self,
        bdf: Bdf,
        offset: u16,
        width: Width,
        val: u32,
    ) -> Result<()> {
        let Some(span) = self.span(bdf, offset, width)? else {
            return Ok(());
        };
        let Some(image) = self.devices.get_mut(&bdf) else {
            return Ok(());
        };
        let buf = &mut image[span];
        match width {
            Width::U8 => buf[0] = val as u8,
            Width::U16 => LittleEndian::write_u16(buf, val as u16),
            Width::U32 => LittleEndian::write_u32(buf, val),
        }
        Ok(())
    }
}

/// A helper for building config space images, with a capability list laid
/// out the way hardware would present it.
pub struct CfgBuilder {
    image: Vec<u8>,
    caps: Vec<CapabilityRecord>,
    cap_next_alloc: u16,
}

impl CfgBuilder {
    /// Creates a zeroed image of `len` bytes ([`LEN_CFG`] or
    /// [`LEN_CFG_ECAM`]).
    pub fn new(len: u16) -> Self {
        assert!(len == LEN_CFG || len == LEN_CFG_ECAM);
        Self {
            image: vec![0; usize::from(len)],
            caps: Vec::new(),
            cap_next_alloc: LEN_CFG_STD,
        }
    }

    pub fn ident(&mut self, vendor: u16, device: u16) -> &mut Self {
        self.put_u16(PCI_VENDOR_ID, vendor);
        self.put_u16(PCI_DEVICE_ID, device);
        self
    }

    pub fn header_type(&mut self, header_type: u8) -> &mut Self {
        self.put_u8(PCI_HEADER_TYPE, header_type);
        self
    }

    pub fn put_u8(&mut self, offset: u16, val: u8) -> &mut Self {
        self.image[usize::from(offset)] = val;
        self
    }

    pub fn put_u16(&mut self, offset: u16, val: u16) -> &mut Self {
        LittleEndian::write_u16(&mut self.image[usize::from(offset)..], val);
        self
    }

    pub fn put_u32(&mut self, offset: u16, val: u32) -> &mut Self {
        LittleEndian::write_u32(&mut self.image[usize::from(offset)..], val);
        self
    }

    /// Appends a capability with `len` bytes of body (exclusive of the ID
    /// and next-pointer bytes) and links it onto the end of the list.
    /// Returns the offset of the new capability header.
    ///
    /// # Panics
    ///
    /// Panics if the capability's total size is not a multiple of 4 bytes,
    /// or if it would not fit below [`LEN_CFG`].
    pub fn add_capability(&mut self, id: u8, len: u8) -> u16 {
        let offset = self.cap_next_alloc;
        let end = offset + 2 + u16::from(len);
        assert!(end % PCI_CAP_SIZEOF == 0);
        assert!(end <= LEN_CFG);

        match self.caps.last().map(|prev| prev.offset) {
            Some(prev) => {
                self.put_u8(prev + PCI_CAP_LIST_NEXT, offset as u8);
            }
            None => {
                let status =
                    LittleEndian::read_u16(&self.image[usize::from(PCI_STATUS)..]);
                self.put_u16(PCI_STATUS, status | PCI_STATUS_CAP_LIST);
                self.put_u8(PCI_CAPABILITY_LIST, offset as u8);
            }
        }
        self.put_u8(offset + PCI_CAP_LIST_ID, id);
        self.put_u8(offset + PCI_CAP_LIST_NEXT, 0);
        self.caps.push(CapabilityRecord { id, offset });
        self.cap_next_alloc = end;
        offset
    }

    /// Constructs the image and a description of its capabilities.
    pub fn finish(self) -> (Vec<u8>, Vec<CapabilityRecord>) {
        (self.image, self.caps)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BDF: Bdf = Bdf::new_unchecked(0, 3, 0);

    #[test]
    fn absent_function_reads_ones() {
        let mut cfg = MemCfgSpace::new();
        assert_eq!(cfg.read_u16(BDF, PCI_VENDOR_ID).unwrap(), 0xffff);
        assert_eq!(cfg.read_u32(BDF, PCI_BASE_ADDRESS_0).unwrap(), !0);
        cfg.write_u32(BDF, PCI_BASE_ADDRESS_0, 0).unwrap();
        assert!(cfg.image(BDF).is_none());
    }

    #[test]
    fn widths_are_little_endian() {
        let mut cfg = MemCfgSpace::new();
        cfg.insert(BDF, vec![0; usize::from(LEN_CFG)]);
        cfg.write_u32(BDF, 0x10, 0x1234_5678).unwrap();
        assert_eq!(cfg.read_u8(BDF, 0x10).unwrap(), 0x78);
        assert_eq!(cfg.read_u16(BDF, 0x12).unwrap(), 0x1234);
        assert_eq!(cfg.read_u32(BDF, 0x10).unwrap(), 0x1234_5678);
    }

    #[test]
    fn misaligned_or_oversized_access_rejected() {
        let mut cfg = MemCfgSpace::new();
        cfg.insert(BDF, vec![0; usize::from(LEN_CFG)]);
        assert_eq!(
            cfg.read_u16(BDF, 0x11),
            Err(Error::InvalidAccess { bdf: BDF, offset: 0x11, width: 2 })
        );
        assert!(cfg.read_u32(BDF, 0x100).is_err());
        assert!(cfg.write_u8(BDF, 0xff, 1).is_ok());
        assert!(cfg.write_u32(BDF, 0xfe, 1).is_err());
    }

    #[test]
    fn builder_links_capabilities() {
        let mut builder = CfgBuilder::new(LEN_CFG);
        builder.ident(0x1de1, 0x0001);
        assert_eq!(builder.add_capability(PCI_CAP_ID_PM, 6), 0x40);
        assert_eq!(builder.add_capability(PCI_CAP_ID_EXP, 0x3a), 0x48);
        let (image, caps) = builder.finish();

        assert_eq!(caps.len(), 2);
        assert_eq!(image[usize::from(PCI_CAPABILITY_LIST)], 0x40);
        assert_eq!(image[0x41], 0x48);
        assert_eq!(image[0x48], PCI_CAP_ID_EXP);
        assert_eq!(image[0x49], 0);
        assert_ne!(
            LittleEndian::read_u16(&image[usize::from(PCI_STATUS)..])
                & PCI_STATUS_CAP_LIST,
            0
        );
    }

    #[test]
    #[should_panic]
    fn builder_rejects_unaligned_capability() {
        let mut builder = CfgBuilder::new(LEN_CFG);
        builder.add_capability(PCI_CAP_ID_VNDR, 3);
    }
}
