// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BAR requests, their placements, and writing placements to a device.

use slog::{debug, Logger};

use crate::bits::*;
use crate::cfgspace::ConfigSpaceAccessor;
use crate::{Bdf, Error, Result};

/// Number of base address registers in a type-0 header. Region indices past
/// this address the expansion ROM.
pub const BAR_COUNT: usize = 6;

/// Largest region a 32-bit BAR can describe.
pub const MAX_BAR32_SIZE: u64 = 1 << 31;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BarKind {
    Io,
    Memory32,
    Memory64,
    Prefetchable32,
    Prefetchable64,
}
impl BarKind {
    pub fn is_io(&self) -> bool {
        matches!(self, BarKind::Io)
    }
    pub fn is_prefetchable(&self) -> bool {
        matches!(self, BarKind::Prefetchable32 | BarKind::Prefetchable64)
    }
    /// BAR occupies two consecutive registers.
    pub fn is_64bit(&self) -> bool {
        matches!(self, BarKind::Memory64 | BarKind::Prefetchable64)
    }

    /// Type bits held in the low nibble of the BAR register.
    fn reg_bits(&self) -> u32 {
        match self {
            BarKind::Io => BAR_TYPE_IO,
            BarKind::Memory32 => BAR_TYPE_MEM,
            BarKind::Memory64 => BAR_TYPE_MEM64,
            BarKind::Prefetchable32 => BAR_TYPE_MEM | BAR_PREFETCH,
            BarKind::Prefetchable64 => BAR_TYPE_MEM64 | BAR_PREFETCH,
        }
    }
}

/// A region a device wants mapped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BarRequest {
    /// `0..MAX_PCI_REGIONS`
    pub region_index: usize,
    /// Power of two; the region must be naturally aligned.
    pub size: u64,
    pub kind: BarKind,
}

impl BarRequest {
    pub const fn new(region_index: usize, size: u64, kind: BarKind) -> Self {
        Self { region_index, size, kind }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let invalid = |reason| {
            Err(Error::InvalidBarRequest { region: self.region_index, reason })
        };
        if self.region_index >= MAX_PCI_REGIONS {
            return invalid("region index out of range");
        }
        if !self.size.is_power_of_two() {
            return invalid("size is not a non-zero power of two");
        }
        if !self.kind.is_64bit() && self.size > MAX_BAR32_SIZE {
            return invalid("size exceeds what a 32-bit BAR can decode");
        }
        Ok(())
    }
}

/// A [`BarRequest`] together with the base address it was given.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BarAssignment {
    pub region_index: usize,
    pub size: u64,
    pub kind: BarKind,
    pub base: u64,
}

impl BarAssignment {
    pub(crate) fn new(req: &BarRequest, base: u64) -> Self {
        debug_assert_eq!(base % req.size, 0);
        Self {
            region_index: req.region_index,
            size: req.size,
            kind: req.kind,
            base,
        }
    }

    /// Last address covered, inclusive.
    pub fn last(&self) -> u64 {
        self.base + (self.size - 1)
    }

    pub fn overlaps(&self, other: &BarAssignment) -> bool {
        self.base <= other.last() && other.base <= self.last()
    }
}

/// Write a device's assignments into its BARs (and expansion ROM register,
/// for the final region) and enable decode for the address spaces in use.
///
/// Each 64-bit BAR claims the register following it, which must therefore
/// not be assigned separately.
pub fn program_bars<A: ConfigSpaceAccessor + ?Sized>(
    log: &Logger,
    acc: &mut A,
    bdf: Bdf,
    assignments: &[BarAssignment],
) -> Result<()> {
    let mut claimed = [false; MAX_PCI_REGIONS];
    for asn in assignments {
        let idx = asn.region_index;
        let invalid = |reason| Error::InvalidBarRequest { region: idx, reason };
        if idx >= MAX_PCI_REGIONS {
            return Err(invalid("region index out of range"));
        }
        let span = if asn.kind.is_64bit() { 2 } else { 1 };
        if idx == BAR_COUNT && (asn.kind.is_io() || span == 2) {
            return Err(invalid("expansion ROM must be a 32-bit memory region"));
        }
        if span == 2 && idx + 1 >= BAR_COUNT {
            return Err(invalid("64-bit BAR needs a following register"));
        }
        for slot in &mut claimed[idx..idx + span] {
            if *slot {
                return Err(invalid("register claimed by another region"));
            }
            *slot = true;
        }
    }

    let mut cmd = RegCmd::from_bits_truncate(acc.read_u16(bdf, PCI_COMMAND)?);
    for asn in assignments {
        if asn.region_index == BAR_COUNT {
            acc.write_u32(bdf, PCI_ROM_ADDRESS, asn.base as u32)?;
        } else {
            let reg = PCI_BASE_ADDRESS_0 + 4 * asn.region_index as u16;
            acc.write_u32(bdf, reg, asn.base as u32 | asn.kind.reg_bits())?;
            if asn.kind.is_64bit() {
                acc.write_u32(bdf, reg + 4, (asn.base >> 32) as u32)?;
            }
        }
        cmd |= if asn.kind.is_io() { RegCmd::IO_EN } else { RegCmd::MMIO_EN };
        debug!(log, "programmed region";
            "bdf" => %bdf,
            "region" => asn.region_index,
            "base" => format!("{:#x}", asn.base),
            "size" => format!("{:#x}", asn.size),
        );
    }
    acc.write_u16(bdf, PCI_COMMAND, cmd.bits())
}
