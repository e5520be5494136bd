// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Walking the capability list of a device.
//!
//! The list lives in config space, which is under the control of the device
//! (and whatever firmware or hot-plug event last touched it). Nothing about it
//! can be trusted: a pointer may land outside config space, point back at an
//! earlier entry, or simply never end. The walk here is iterative and bounded
//! three ways: every header must fit inside the supplied limit, no offset may
//! be visited twice, and no more than `limit / PCI_CAP_SIZEOF` entries are
//! accepted.

use std::collections::BTreeSet;

use slog::{debug, warn, Logger};
use strum::FromRepr;

use crate::bits::*;
use crate::cfgspace::ConfigSpaceAccessor;
use crate::{Bdf, Error, MalformedReason, Result};

/// Capability IDs defined for the standard (non-extended) list.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromRepr)]
#[repr(u8)]
pub enum CapabilityId {
    PowerManagement = PCI_CAP_ID_PM,
    Agp = PCI_CAP_ID_AGP,
    Vpd = PCI_CAP_ID_VPD,
    SlotId = PCI_CAP_ID_SLOTID,
    Msi = PCI_CAP_ID_MSI,
    HotSwap = PCI_CAP_ID_CHSWP,
    PciX = PCI_CAP_ID_PCIX,
    HyperTransport = PCI_CAP_ID_HT,
    Vendor = PCI_CAP_ID_VNDR,
    DebugPort = PCI_CAP_ID_DBG,
    CentralResource = PCI_CAP_ID_CCRC,
    HotPlug = PCI_CAP_ID_SHPC,
    BridgeSubsystem = PCI_CAP_ID_SSVID,
    Agp3 = PCI_CAP_ID_AGP3,
    Secure = PCI_CAP_ID_SECDEV,
    Express = PCI_CAP_ID_EXP,
    MsiX = PCI_CAP_ID_MSIX,
    Sata = PCI_CAP_ID_SATA,
    AdvancedFeatures = PCI_CAP_ID_AF,
    EnhancedAllocation = PCI_CAP_ID_EA,
}

/// One entry of a capability list.
///
/// Records are only meaningful for the enumeration pass which produced them:
/// hot-plug may rewrite config space underneath, so they must not be kept
/// across a re-scan.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CapabilityRecord {
    pub id: u8,
    /// Offset of the capability header in config space.
    pub offset: u16,
}

impl CapabilityRecord {
    /// Known capability type, if the ID is one the PCI spec defines.
    pub fn kind(&self) -> Option<CapabilityId> {
        CapabilityId::from_repr(self.id)
    }
}

/// Capabilities of a device, in the order the list links them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CapabilityList(Vec<CapabilityRecord>);

impl CapabilityList {
    /// First capability with the given ID. No entry takes priority over
    /// another beyond its position in the list.
    pub fn find(&self, id: u8) -> Option<CapabilityRecord> {
        self.0.iter().find(|cap| cap.id == id).copied()
    }

    pub fn find_kind(&self, kind: CapabilityId) -> Option<CapabilityRecord> {
        self.find(kind as u8)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityRecord> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<CapabilityRecord> {
        self.0
    }
}

impl IntoIterator for CapabilityList {
    type Item = CapabilityRecord;
    type IntoIter = std::vec::IntoIter<CapabilityRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Upper bound on the number of list entries that fit in `limit` bytes.
pub const fn max_entries(limit: u16) -> usize {
    (limit / PCI_CAP_SIZEOF) as usize
}

/// Walk the capability list whose head pointer sits at `ptr_offset`.
///
/// A zero head pointer is an empty (and valid) list. Any entry whose header
/// would fall outside `[0, limit)`, any repeated offset, and any list longer
/// than [`max_entries`] ends the walk with
/// [`Error::MalformedCapabilityList`]. Accessor failures are passed through.
pub fn walk<A: ConfigSpaceAccessor + ?Sized>(
    acc: &A,
    bdf: Bdf,
    ptr_offset: u16,
    limit: u16,
) -> Result<CapabilityList> {
    if u32::from(ptr_offset) >= u32::from(limit) {
        return Err(Error::MalformedCapabilityList {
            offset: ptr_offset,
            reason: MalformedReason::OutOfBounds,
        });
    }

    let max = max_entries(limit);
    let mut visited = BTreeSet::new();
    let mut caps = Vec::new();
    let mut next = acc.read_u8(bdf, ptr_offset)? & PCI_CAP_PTR_MASK;

    while next != 0 {
        let offset = u16::from(next);
        let malformed =
            |reason| Error::MalformedCapabilityList { offset, reason };

        if caps.len() >= max {
            return Err(malformed(MalformedReason::TooManyEntries));
        }
        if u32::from(offset) + u32::from(PCI_CAP_LIST_NEXT) >= u32::from(limit)
        {
            return Err(malformed(MalformedReason::OutOfBounds));
        }
        if !visited.insert(offset) {
            return Err(malformed(MalformedReason::Cycle));
        }

        let id = acc.read_u8(bdf, offset + PCI_CAP_LIST_ID)?;
        caps.push(CapabilityRecord { id, offset });
        next = acc.read_u8(bdf, offset + PCI_CAP_LIST_NEXT)? & PCI_CAP_PTR_MASK;
    }

    Ok(CapabilityList(caps))
}

/// Enumerate the capabilities of a device through its standard header.
///
/// Devices which do not advertise a list in their status register yield an
/// empty list. A malformed list is logged and also treated as empty, so the
/// caller can keep the device (without its optional features) and carry on
/// with the rest of the scan. Only accessor failures are returned.
pub fn walk_device<A: ConfigSpaceAccessor + ?Sized>(
    log: &Logger,
    acc: &A,
    bdf: Bdf,
    limit: u16,
) -> Result<CapabilityList> {
    let status = RegStatus::from_bits_truncate(acc.read_u16(bdf, PCI_STATUS)?);
    if !status.contains(RegStatus::CAP_LIST) {
        return Ok(CapabilityList::default());
    }

    match walk(acc, bdf, PCI_CAPABILITY_LIST, limit) {
        Ok(caps) => {
            debug!(log, "walked capability list";
                "bdf" => %bdf, "count" => caps.len());
            Ok(caps)
        }
        Err(e @ Error::MalformedCapabilityList { .. }) => {
            warn!(log, "ignoring capabilities of device";
                "bdf" => %bdf, "error" => %e);
            Ok(CapabilityList::default())
        }
        Err(e) => Err(e),
    }
}

/// Find a single capability of a device, or [`Error::NoCapability`].
pub fn find_device_cap<A: ConfigSpaceAccessor + ?Sized>(
    log: &Logger,
    acc: &A,
    bdf: Bdf,
    limit: u16,
    kind: CapabilityId,
) -> Result<CapabilityRecord> {
    walk_device(log, acc, bdf, limit)?
        .find_kind(kind)
        .ok_or(Error::NoCapability { bdf, id: kind as u8 })
}
