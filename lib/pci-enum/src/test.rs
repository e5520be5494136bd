// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Common test prep setup

use slog::{o, Drain, Logger};

use crate::bits::*;
use crate::cfgspace::{ConfigSpaceAccessor, MemCfgSpace};
use crate::Bdf;

pub(crate) const BDF: Bdf = Bdf::new_unchecked(0, 4, 0);

/// Logger for tests. Output is only produced when `PCI_ENUM_TEST_LOG` is set,
/// to keep the default test run quiet.
pub(crate) fn test_logger() -> Logger {
    if std::env::var_os("PCI_ENUM_TEST_LOG").is_some() {
        let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, o!())
    } else {
        Logger::root(slog::Discard, o!())
    }
}

/// Device at [`BDF`] whose capability list links the given `(offset, id)`
/// entries in order. Offsets must be distinct and dword aligned.
pub(crate) fn chained_device(chain: &[(u16, u8)]) -> MemCfgSpace {
    let mut cfg = MemCfgSpace::new();
    cfg.insert(BDF, vec![0; usize::from(LEN_CFG)]);
    cfg.write_u16(BDF, PCI_STATUS, PCI_STATUS_CAP_LIST).unwrap();

    let head = chain.first().map(|(off, _)| *off as u8).unwrap_or(0);
    cfg.write_u8(BDF, PCI_CAPABILITY_LIST, head).unwrap();
    for (idx, (off, id)) in chain.iter().enumerate() {
        let next = chain.get(idx + 1).map(|(n, _)| *n as u8).unwrap_or(0);
        cfg.write_u8(BDF, off + PCI_CAP_LIST_ID, *id).unwrap();
        cfg.write_u8(BDF, off + PCI_CAP_LIST_NEXT, next).unwrap();
    }
    cfg
}

/// Bridge at [`BDF`] with a type-1 header and the given decode capability
/// bits in its I/O and prefetchable base/limit registers.
pub(crate) fn bridge_device(io32: bool, pref64: bool) -> MemCfgSpace {
    let mut cfg = MemCfgSpace::new();
    cfg.insert(BDF, vec![0; usize::from(LEN_CFG)]);
    cfg.write_u8(BDF, PCI_HEADER_TYPE, HEADER_TYPE_BRIDGE).unwrap();
    if io32 {
        cfg.write_u8(BDF, PCI_IO_BASE, PCI_IO_RANGE_TYPE_32).unwrap();
        cfg.write_u8(BDF, PCI_IO_LIMIT, PCI_IO_RANGE_TYPE_32).unwrap();
    }
    if pref64 {
        cfg.write_u16(BDF, PCI_PREF_MEMORY_BASE, PCI_PREF_RANGE_TYPE_64)
            .unwrap();
        cfg.write_u16(BDF, PCI_PREF_MEMORY_LIMIT, PCI_PREF_RANGE_TYPE_64)
            .unwrap();
    }
    cfg
}
