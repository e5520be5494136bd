// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI and PCI Express config registers.
//!
//! Offsets and masks in this module are fixed by the hardware and must be used
//! as-is.

#![allow(unused)]

pub const LEN_CFG: u16 = 0x100;
pub const LEN_CFG_STD: u16 = 0x40;
pub const LEN_CFG_ECAM: u16 = 0x1000;

pub const MAX_PCI_REGIONS: usize = 7;

// Capability lists
pub const PCI_CAP_LIST_ID: u16 = 0;
pub const PCI_CAP_ID_PM: u8 = 0x01;
pub const PCI_CAP_ID_AGP: u8 = 0x02;
pub const PCI_CAP_ID_VPD: u8 = 0x03;
pub const PCI_CAP_ID_SLOTID: u8 = 0x04;
pub const PCI_CAP_ID_MSI: u8 = 0x05;
pub const PCI_CAP_ID_CHSWP: u8 = 0x06;
pub const PCI_CAP_ID_PCIX: u8 = 0x07;
pub const PCI_CAP_ID_HT: u8 = 0x08;
pub const PCI_CAP_ID_VNDR: u8 = 0x09;
pub const PCI_CAP_ID_DBG: u8 = 0x0A;
pub const PCI_CAP_ID_CCRC: u8 = 0x0B;
pub const PCI_CAP_ID_SHPC: u8 = 0x0C;
pub const PCI_CAP_ID_SSVID: u8 = 0x0D;
pub const PCI_CAP_ID_AGP3: u8 = 0x0E;
pub const PCI_CAP_ID_SECDEV: u8 = 0x0F;
pub const PCI_CAP_ID_EXP: u8 = 0x10;
pub const PCI_CAP_ID_MSIX: u8 = 0x11;
pub const PCI_CAP_ID_SATA: u8 = 0x12;
pub const PCI_CAP_ID_AF: u8 = 0x13;
pub const PCI_CAP_ID_EA: u8 = 0x14;
pub const PCI_CAP_ID_MAX: u8 = PCI_CAP_ID_EA;
pub const PCI_CAP_LIST_NEXT: u16 = 1;
pub const PCI_CAP_FLAGS: u16 = 2;
pub const PCI_CAP_SIZEOF: u16 = 4;

/// The bottom two bits of every capability pointer are reserved.
pub const PCI_CAP_PTR_MASK: u8 = 0xfc;

// Common header
pub const PCI_VENDOR_ID: u16 = 0x00;
pub const PCI_DEVICE_ID: u16 = 0x02;
pub const PCI_COMMAND: u16 = 0x04;
pub const PCI_COMMAND_IO: u16 = 0x1;
pub const PCI_COMMAND_MEMORY: u16 = 0x2;
pub const PCI_COMMAND_MASTER: u16 = 0x4;
pub const PCI_COMMAND_SPECIAL: u16 = 0x8;
pub const PCI_COMMAND_INVALIDATE: u16 = 0x10;
pub const PCI_COMMAND_VGA_PALETTE: u16 = 0x20;
pub const PCI_COMMAND_PARITY: u16 = 0x40;
pub const PCI_COMMAND_WAIT: u16 = 0x80;
pub const PCI_COMMAND_SERR: u16 = 0x100;
pub const PCI_COMMAND_FAST_BACK: u16 = 0x200;
pub const PCI_COMMAND_INTX_DISABLE: u16 = 0x400;
pub const PCI_STATUS: u16 = 0x06;
pub const PCI_STATUS_CAP_LIST: u16 = 0x10;
pub const PCI_CLASS_REVISION: u16 = 0x08;
pub const PCI_CLASS_MSC: u32 = 0x01 << 24;
pub const PCI_SUBCLASS_NVME: u32 = 0x08 << 16;
pub const PCI_HEADER_TYPE: u16 = 0x0e;
pub const PCI_BASE_ADDRESS_0: u16 = 0x10;
pub const PCI_BASE_ADDRESS_1: u16 = 0x14;
pub const PCI_CAPABILITY_LIST: u16 = 0x34;

// Type-0 header
pub const PCI_ROM_ADDRESS: u16 = 0x30;

pub const HEADER_TYPE_DEVICE: u8 = 0b0;
pub const HEADER_TYPE_BRIDGE: u8 = 0b1;
pub const HEADER_TYPE_MULTIFUNC: u8 = 0b1000_0000;

pub const BAR_TYPE_IO: u32 = 0b01;
pub const BAR_TYPE_MEM: u32 = 0b000;
pub const BAR_TYPE_MEM64: u32 = 0b100;
pub const BAR_PREFETCH: u32 = 0b1000;

// Type-1 (bridge) header
pub const PCI_PRIMARY_BUS: u16 = 0x18;
pub const PCI_SECONDARY_BUS: u16 = 0x19;
pub const PCI_SUBORDINATE_BUS: u16 = 0x1a;
pub const PCI_IO_BASE: u16 = 0x1c;
pub const PCI_IO_LIMIT: u16 = 0x1d;
pub const PCI_MEMORY_BASE: u16 = 0x20;
pub const PCI_MEMORY_LIMIT: u16 = 0x22;
pub const PCI_PREF_MEMORY_BASE: u16 = 0x24;
pub const PCI_PREF_MEMORY_LIMIT: u16 = 0x26;
pub const PCI_PREF_BASE_UPPER32: u16 = 0x28;
pub const PCI_PREF_LIMIT_UPPER32: u16 = 0x2c;
pub const PCI_IO_BASE_UPPER16: u16 = 0x30;
pub const PCI_IO_LIMIT_UPPER16: u16 = 0x32;
pub const PCI_BRIDGE_CONTROL: u16 = 0x3e;

/// Address-decode type held in the low nibble of the I/O base/limit registers.
pub const PCI_IO_RANGE_TYPE_MASK: u8 = 0x0f;
pub const PCI_IO_RANGE_TYPE_32: u8 = 0x01;
pub const PCI_IO_RANGE_MASK: u8 = 0xf0;

/// Mask for the reserved bottom bits of the memory base and memory limit
/// registers.
pub const PCI_MEMORY_RANGE_MASK: u16 = 0xfff0;
pub const PCI_PREF_RANGE_TYPE_MASK: u16 = 0x000f;
pub const PCI_PREF_RANGE_TYPE_64: u16 = 0x0001;

/// Native decode granularity of the bridge I/O window.
pub const IO_WINDOW_GRANULARITY: u64 = 0x1000;
/// Native decode granularity of both bridge memory windows.
pub const MEM_WINDOW_GRANULARITY: u64 = 0x10_0000;

// Fixed root-port registers on controllers which place the PCI Express
// capability at 0xc0.
pub const PCI_LNKCTL: u16 = 0xd0;
pub const PCI_RC_CTRL_CAP: u16 = 0xdc;

// Offsets within the PCI Express capability
pub const PCI_EXP_FLAGS: u16 = 0x02;
pub const PCI_EXP_LNKCAP: u16 = 0x0c;
pub const PCI_EXP_LNKCTL: u16 = 0x10;
pub const PCI_EXP_LNKCTL_RL: u16 = 0x0020;
pub const PCI_EXP_LNKCTL_CCC: u16 = 0x0040;
pub const PCI_EXP_LNKSTA: u16 = 0x12;
pub const PCI_EXP_LNKSTA_CLS: u16 = 0x000f;
pub const PCI_EXP_LNKSTA_NLW: u16 = 0x03f0;
pub const PCI_EXP_LNKSTA_NLW_SHIFT: u16 = 4;
pub const PCI_EXP_LNKSTA_LT: u16 = 0x0800;
pub const PCI_EXP_LNKSTA_SLC: u16 = 0x1000;

pub(crate) const MASK_FUNC: u8 = 0x07;
pub(crate) const MASK_DEV: u8 = 0x1f;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct RegCmd: u16 {
        const IO_EN = PCI_COMMAND_IO;
        const MMIO_EN = PCI_COMMAND_MEMORY;
        const BUSMSTR_EN = PCI_COMMAND_MASTER;
        const SPECIAL = PCI_COMMAND_SPECIAL;
        const INVALIDATE = PCI_COMMAND_INVALIDATE;
        const VGA_PALETTE = PCI_COMMAND_VGA_PALETTE;
        const PARITY = PCI_COMMAND_PARITY;
        const WAIT = PCI_COMMAND_WAIT;
        const SERR = PCI_COMMAND_SERR;
        const FAST_BACK = PCI_COMMAND_FAST_BACK;
        const INTX_DIS = PCI_COMMAND_INTX_DISABLE;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct RegStatus: u16 {
        const INTR_STATUS = 1 << 3;
        const CAP_LIST = PCI_STATUS_CAP_LIST;
    }
}

bitflags! {
    /// PCI Express link control register.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct LinkCtl: u16 {
        const ASPM_L0S = 1 << 0;
        const ASPM_L1 = 1 << 1;
        const RETRAIN = PCI_EXP_LNKCTL_RL;
        const COMMON_CLOCK = PCI_EXP_LNKCTL_CCC;
        const EXT_SYNCH = 1 << 7;
    }
}

bitflags! {
    /// PCI Express link status register.
    ///
    /// The speed and width fields are multi-bit and decoded by
    /// [`crate::link::LinkStatus`]; only the single-bit flags are named here.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct LinkSta: u16 {
        const TRAINING = PCI_EXP_LNKSTA_LT;
        const SLOT_CLOCK = PCI_EXP_LNKSTA_SLC;

        const _ = !0;
    }
}
