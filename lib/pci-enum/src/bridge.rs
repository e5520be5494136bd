// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus numbers and forwarding windows of a PCI-PCI bridge.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use slog::{info, Logger};

use crate::alloc::{align_up, WindowClass};
use crate::bits::*;
use crate::cfgspace::{ConfigSpaceAccessor, Width};
use crate::{Bdf, Error, Result};

// Bridge configuration space header registers touched during enumeration.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
enum BridgeReg {
    PrimaryBus,
    SecondaryBus,
    SubordinateBus,
    IoBase,
    IoLimit,
    MemoryBase,
    MemoryLimit,
    PrefetchableMemoryBase,
    PrefetchableMemoryLimit,
    PrefetchableMemoryBaseUpper,
    PrefetchableMemoryLimitUpper,
    IoBaseUpper,
    IoLimitUpper,
}

lazy_static! {
    static ref BRIDGE_REG_LAYOUT: BTreeMap<BridgeReg, (u16, Width)> = {
        let layout = [
            (BridgeReg::PrimaryBus, PCI_PRIMARY_BUS, Width::U8),
            (BridgeReg::SecondaryBus, PCI_SECONDARY_BUS, Width::U8),
            (BridgeReg::SubordinateBus, PCI_SUBORDINATE_BUS, Width::U8),
            (BridgeReg::IoBase, PCI_IO_BASE, Width::U8),
            (BridgeReg::IoLimit, PCI_IO_LIMIT, Width::U8),
            (BridgeReg::MemoryBase, PCI_MEMORY_BASE, Width::U16),
            (BridgeReg::MemoryLimit, PCI_MEMORY_LIMIT, Width::U16),
            (BridgeReg::PrefetchableMemoryBase, PCI_PREF_MEMORY_BASE, Width::U16),
            (BridgeReg::PrefetchableMemoryLimit, PCI_PREF_MEMORY_LIMIT, Width::U16),
            (
                BridgeReg::PrefetchableMemoryBaseUpper,
                PCI_PREF_BASE_UPPER32,
                Width::U32,
            ),
            (
                BridgeReg::PrefetchableMemoryLimitUpper,
                PCI_PREF_LIMIT_UPPER32,
                Width::U32,
            ),
            (BridgeReg::IoBaseUpper, PCI_IO_BASE_UPPER16, Width::U16),
            (BridgeReg::IoLimitUpper, PCI_IO_LIMIT_UPPER16, Width::U16),
        ];
        layout.into_iter().map(|(reg, off, width)| (reg, (off, width))).collect()
    };
}

fn reg_read<A: ConfigSpaceAccessor + ?Sized>(
    acc: &A,
    bdf: Bdf,
    reg: BridgeReg,
) -> Result<u32> {
    let (offset, width) = BRIDGE_REG_LAYOUT[&reg];
    acc.read(bdf, offset, width)
}

fn reg_write<A: ConfigSpaceAccessor + ?Sized>(
    acc: &mut A,
    bdf: Bdf,
    reg: BridgeReg,
    val: u32,
) -> Result<()> {
    let (offset, width) = BRIDGE_REG_LAYOUT[&reg];
    acc.write(bdf, offset, width, val)
}

const IO_CLOSED_BASE: u32 = 0xffff_f000;
const MEM_CLOSED_BASE: u32 = 0xfff0_0000;
const PREF_CLOSED_BASE: u64 = 0xffff_ffff_fff0_0000;

/// Bus numbers and window bounds of one bridge.
///
/// Limits are inclusive. A window whose base lies above its limit is closed:
/// the bridge forwards nothing of that class downstream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BridgeWindowSpec {
    pub primary_bus: u8,
    pub secondary_bus: u8,
    pub subordinate_bus: u8,
    pub io_base: u32,
    pub io_limit: u32,
    pub mem_base: u32,
    pub mem_limit: u32,
    pub pref_base: u64,
    pub pref_limit: u64,
    /// The prefetchable window uses the upper-32 registers.
    pub pref_64bit: bool,
}

impl BridgeWindowSpec {
    /// A bridge with the given bus range and all windows closed.
    pub fn new(primary: u8, secondary: u8, subordinate: u8) -> Result<Self> {
        let mut spec = Self {
            primary_bus: primary,
            secondary_bus: secondary,
            subordinate_bus: subordinate,
            io_base: 0,
            io_limit: 0,
            mem_base: 0,
            mem_limit: 0,
            pref_base: 0,
            pref_limit: 0,
            pref_64bit: false,
        };
        spec.validate_buses()?;
        spec.reset();
        Ok(spec)
    }

    /// Checks `primary < secondary <= subordinate`.
    pub fn validate_buses(&self) -> Result<()> {
        if self.primary_bus < self.secondary_bus
            && self.secondary_bus <= self.subordinate_bus
        {
            Ok(())
        } else {
            Err(Error::InvalidBusRange {
                primary: self.primary_bus,
                secondary: self.secondary_bus,
                subordinate: self.subordinate_bus,
            })
        }
    }

    /// Close every window, leaving the bus numbers alone.
    pub fn reset(&mut self) {
        for class in WindowClass::ALL {
            self.set_window(class, None);
        }
    }

    /// `(base, limit)` of an open window.
    pub fn window(&self, class: WindowClass) -> Option<(u64, u64)> {
        let (base, limit) = match class {
            WindowClass::Io => {
                (u64::from(self.io_base), u64::from(self.io_limit))
            }
            WindowClass::Memory => {
                (u64::from(self.mem_base), u64::from(self.mem_limit))
            }
            WindowClass::Prefetchable => (self.pref_base, self.pref_limit),
        };
        (base <= limit).then_some((base, limit))
    }

    pub fn is_open(&self, class: WindowClass) -> bool {
        self.window(class).is_some()
    }

    /// First address past this window once it is rounded out to the
    /// register granularity. Sibling bridges allocated from the same parent
    /// budget should start here.
    pub fn next_free(&self, class: WindowClass) -> Option<u64> {
        let (_, limit) = self.window(class)?;
        align_up(limit.checked_add(1)?, class.granularity())
    }

    /// # Panics
    ///
    /// If an I/O or memory window does not fit in 32 bits; the allocator
    /// never produces one.
    pub(crate) fn set_window(
        &mut self,
        class: WindowClass,
        span: Option<(u64, u64)>,
    ) {
        let narrow = |v: u64| u32::try_from(v).expect("32-bit window");
        match (class, span) {
            (WindowClass::Io, Some((base, limit))) => {
                self.io_base = narrow(base);
                self.io_limit = narrow(limit);
            }
            (WindowClass::Io, None) => {
                self.io_base = IO_CLOSED_BASE;
                self.io_limit = 0;
            }
            (WindowClass::Memory, Some((base, limit))) => {
                self.mem_base = narrow(base);
                self.mem_limit = narrow(limit);
            }
            (WindowClass::Memory, None) => {
                self.mem_base = MEM_CLOSED_BASE;
                self.mem_limit = 0;
            }
            (WindowClass::Prefetchable, Some((base, limit))) => {
                self.pref_base = base;
                self.pref_limit = limit;
            }
            (WindowClass::Prefetchable, None) => {
                self.pref_base = PREF_CLOSED_BASE;
                self.pref_limit = 0;
                self.pref_64bit = false;
            }
        }
    }

    fn encode(&self, io32: bool, pref64: bool) -> Vec<(BridgeReg, u32)> {
        let io_type = if io32 { PCI_IO_RANGE_TYPE_32 } else { 0 };
        let pref_type = if pref64 { PCI_PREF_RANGE_TYPE_64 } else { 0 };
        let io_reg = |addr: u32| {
            u32::from(((addr >> 8) as u8 & PCI_IO_RANGE_MASK) | io_type)
        };
        let mem_reg =
            |addr: u64| u32::from((addr >> 16) as u16 & PCI_MEMORY_RANGE_MASK);

        let mut regs = vec![
            (BridgeReg::PrimaryBus, u32::from(self.primary_bus)),
            (BridgeReg::SecondaryBus, u32::from(self.secondary_bus)),
            (BridgeReg::SubordinateBus, u32::from(self.subordinate_bus)),
            (BridgeReg::IoBase, io_reg(self.io_base)),
            (BridgeReg::IoLimit, io_reg(self.io_limit)),
            (BridgeReg::MemoryBase, mem_reg(u64::from(self.mem_base))),
            (BridgeReg::MemoryLimit, mem_reg(u64::from(self.mem_limit))),
            (
                BridgeReg::PrefetchableMemoryBase,
                mem_reg(self.pref_base) | u32::from(pref_type),
            ),
            (
                BridgeReg::PrefetchableMemoryLimit,
                mem_reg(self.pref_limit) | u32::from(pref_type),
            ),
        ];
        if io32 {
            regs.push((BridgeReg::IoBaseUpper, self.io_base >> 16));
            regs.push((BridgeReg::IoLimitUpper, self.io_limit >> 16));
        }
        if pref64 {
            regs.push((
                BridgeReg::PrefetchableMemoryBaseUpper,
                (self.pref_base >> 32) as u32,
            ));
            regs.push((
                BridgeReg::PrefetchableMemoryLimitUpper,
                (self.pref_limit >> 32) as u32,
            ));
        }
        regs
    }

    /// Write bus numbers and windows into the bridge's type-1 header, then
    /// enable forwarding for the open windows.
    ///
    /// The decode capabilities (32-bit I/O, 64-bit prefetchable) are taken
    /// from the read-only type bits of the bridge. A window the bridge cannot
    /// decode is reported as [`Error::AddressSpaceExhausted`] before anything
    /// is written.
    pub fn program<A: ConfigSpaceAccessor + ?Sized>(
        &self,
        log: &Logger,
        acc: &mut A,
        bdf: Bdf,
    ) -> Result<()> {
        self.validate_buses()?;
        let (io32, pref64) = decode_caps(acc, bdf)?;

        if let Some((_, limit)) = self.window(WindowClass::Io) {
            let reach: u64 = if io32 { 1 << 32 } else { 1 << 16 };
            if limit >= reach {
                return Err(Error::AddressSpaceExhausted {
                    class: WindowClass::Io,
                    required: limit + 1,
                    available: reach,
                });
            }
        }
        if let Some((_, limit)) = self.window(WindowClass::Prefetchable) {
            if !pref64 && limit >> 32 != 0 {
                return Err(Error::AddressSpaceExhausted {
                    class: WindowClass::Prefetchable,
                    required: limit + 1,
                    available: 1 << 32,
                });
            }
        }

        for (reg, val) in self.encode(io32, pref64) {
            reg_write(acc, bdf, reg, val)?;
        }

        let mut cmd =
            RegCmd::from_bits_truncate(acc.read_u16(bdf, PCI_COMMAND)?);
        cmd.set(RegCmd::IO_EN, self.is_open(WindowClass::Io));
        cmd.set(
            RegCmd::MMIO_EN,
            self.is_open(WindowClass::Memory)
                || self.is_open(WindowClass::Prefetchable),
        );
        cmd |= RegCmd::BUSMSTR_EN;
        acc.write_u16(bdf, PCI_COMMAND, cmd.bits())?;

        info!(log, "programmed bridge";
            "bdf" => %bdf,
            "buses" => format!("{}/{}/{}",
                self.primary_bus, self.secondary_bus, self.subordinate_bus),
            "io" => fmt_window(self.window(WindowClass::Io)),
            "mem" => fmt_window(self.window(WindowClass::Memory)),
            "pref" => fmt_window(self.window(WindowClass::Prefetchable)),
        );
        Ok(())
    }

    /// Decode the bus numbers and windows currently programmed into a bridge.
    ///
    /// Windows come back at register granularity, so a spec which was
    /// programmed and read back describes a superset of what was allocated.
    pub fn read_back<A: ConfigSpaceAccessor + ?Sized>(
        acc: &A,
        bdf: Bdf,
    ) -> Result<Self> {
        let (io32, pref64) = decode_caps(acc, bdf)?;
        let read = |reg| reg_read(acc, bdf, reg);

        let io_addr = |low: u32, upper: u32| {
            let low = (low & u32::from(PCI_IO_RANGE_MASK)) << 8;
            if io32 {
                low | upper << 16
            } else {
                low
            }
        };
        let mem_addr =
            |reg: u32| u64::from(reg & u32::from(PCI_MEMORY_RANGE_MASK)) << 16;
        let (io_base_upper, io_limit_upper) = if io32 {
            (read(BridgeReg::IoBaseUpper)?, read(BridgeReg::IoLimitUpper)?)
        } else {
            (0, 0)
        };
        let (pref_base_upper, pref_limit_upper) = if pref64 {
            (
                u64::from(read(BridgeReg::PrefetchableMemoryBaseUpper)?),
                u64::from(read(BridgeReg::PrefetchableMemoryLimitUpper)?),
            )
        } else {
            (0, 0)
        };

        let mut spec = Self {
            primary_bus: read(BridgeReg::PrimaryBus)? as u8,
            secondary_bus: read(BridgeReg::SecondaryBus)? as u8,
            subordinate_bus: read(BridgeReg::SubordinateBus)? as u8,
            io_base: io_addr(read(BridgeReg::IoBase)?, io_base_upper),
            io_limit: io_addr(read(BridgeReg::IoLimit)?, io_limit_upper)
                | 0xfff,
            mem_base: mem_addr(read(BridgeReg::MemoryBase)?) as u32,
            mem_limit: mem_addr(read(BridgeReg::MemoryLimit)?) as u32 | 0xf_ffff,
            pref_base: mem_addr(read(BridgeReg::PrefetchableMemoryBase)?)
                | pref_base_upper << 32,
            pref_limit: mem_addr(read(BridgeReg::PrefetchableMemoryLimit)?)
                | pref_limit_upper << 32
                | 0xf_ffff,
            pref_64bit: false,
        };
        spec.validate_buses()?;

        for class in WindowClass::ALL {
            if !spec.is_open(class) {
                spec.set_window(class, None);
            }
        }
        spec.pref_64bit = spec
            .window(WindowClass::Prefetchable)
            .map_or(false, |(_, limit)| limit >> 32 != 0);
        Ok(spec)
    }
}

/// Whether the bridge decodes 32-bit I/O and 64-bit prefetchable addresses.
fn decode_caps<A: ConfigSpaceAccessor + ?Sized>(
    acc: &A,
    bdf: Bdf,
) -> Result<(bool, bool)> {
    let io = reg_read(acc, bdf, BridgeReg::IoBase)? as u8;
    let pref = reg_read(acc, bdf, BridgeReg::PrefetchableMemoryBase)? as u16;
    Ok((
        io & PCI_IO_RANGE_TYPE_MASK == PCI_IO_RANGE_TYPE_32,
        pref & PCI_PREF_RANGE_TYPE_MASK == PCI_PREF_RANGE_TYPE_64,
    ))
}

fn fmt_window(window: Option<(u64, u64)>) -> String {
    match window {
        Some((base, limit)) => format!("{base:#x}-{limit:#x}"),
        None => "closed".to_string(),
    }
}
