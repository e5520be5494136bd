// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packing BARs behind a bridge into its forwarding windows.
//!
//! A bridge forwards three independent classes of transaction downstream:
//! I/O, non-prefetchable memory and prefetchable memory. Each class gets its
//! own window, so the requests of each class are packed on their own, into
//! their own slice of the parent's address budget.
//!
//! Within a class the requests are placed largest first (ties going to the
//! lower region index) by a bump cursor. Each base is the cursor rounded up
//! to the request's size, which keeps every region naturally aligned while
//! wasting as little as possible on alignment padding. The cursor tracks the
//! last address consumed, and the first address of a budget counts as
//! consumed from the start.

use slog::{info, o, warn, Logger};

use crate::bar::{BarAssignment, BarKind, BarRequest};
use crate::bits::*;
use crate::bridge::BridgeWindowSpec;
use crate::{Error, Result};

/// Round `val` up to a power-of-two `align`, or `None` on overflow.
pub(crate) fn align_up(val: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    Some(val.checked_add(align - 1)? & !(align - 1))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, strum::Display)]
pub enum WindowClass {
    #[strum(to_string = "I/O")]
    Io,
    #[strum(to_string = "memory")]
    Memory,
    #[strum(to_string = "prefetchable memory")]
    Prefetchable,
}

impl WindowClass {
    pub const ALL: [WindowClass; 3] =
        [WindowClass::Io, WindowClass::Memory, WindowClass::Prefetchable];

    pub fn of(kind: BarKind) -> Self {
        match kind {
            BarKind::Io => WindowClass::Io,
            BarKind::Memory32 | BarKind::Memory64 => WindowClass::Memory,
            BarKind::Prefetchable32 | BarKind::Prefetchable64 => {
                WindowClass::Prefetchable
            }
        }
    }

    /// Decode granularity of the bridge's base/limit registers.
    pub fn granularity(&self) -> u64 {
        match self {
            WindowClass::Io => IO_WINDOW_GRANULARITY,
            WindowClass::Memory | WindowClass::Prefetchable => {
                MEM_WINDOW_GRANULARITY
            }
        }
    }
}

/// A contiguous span of address space handed down by the parent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressRange {
    pub start: u64,
    pub size: u64,
}

impl AddressRange {
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Last usable address, capped at `ceiling`.
    fn last_below(&self, ceiling: u64) -> Option<u64> {
        if self.size == 0 || self.start > ceiling {
            return None;
        }
        let last = self.start.saturating_add(self.size - 1);
        Some(last.min(ceiling))
    }

    /// Consume everything below `free`.
    fn advance_to(&self, free: u64) -> Self {
        if free <= self.start {
            return *self;
        }
        let used = free - self.start;
        Self { start: free, size: self.size.saturating_sub(used) }
    }
}

/// Address space the parent enumerator makes available to one bridge.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WindowBudget {
    pub io: AddressRange,
    pub mem: AddressRange,
    /// Prefetchable space below 4 GiB.
    pub pref: AddressRange,
    /// Prefetchable space above 4 GiB, if the platform has any.
    pub pref64: Option<AddressRange>,
}

impl WindowBudget {
    /// The budget left for the next sibling once `bridge` has been
    /// allocated from this one.
    pub fn after(&self, bridge: &BridgeWindowSpec) -> Self {
        let mut next = *self;
        if let Some(free) = bridge.next_free(WindowClass::Io) {
            next.io = self.io.advance_to(free);
        }
        if let Some(free) = bridge.next_free(WindowClass::Memory) {
            next.mem = self.mem.advance_to(free);
        }
        if let Some(free) = bridge.next_free(WindowClass::Prefetchable) {
            if bridge.pref_64bit {
                next.pref64 = self.pref64.map(|r| r.advance_to(free));
            } else {
                next.pref = self.pref.advance_to(free);
            }
        }
        next
    }
}

fn of_class(requests: &[BarRequest], class: WindowClass) -> Vec<&BarRequest> {
    requests.iter().filter(|req| WindowClass::of(req.kind) == class).collect()
}

/// Result of packing one class.
struct Packed {
    assignments: Vec<BarAssignment>,
    /// Inclusive `(first, last)` address occupied, if any request was placed.
    span: Option<(u64, u64)>,
}

fn pack(
    class: WindowClass,
    reqs: &[&BarRequest],
    range: AddressRange,
    ceiling: u64,
) -> Result<Packed> {
    let mut sorted = reqs.to_vec();
    sorted.sort_by(|a, b| {
        b.size.cmp(&a.size).then(a.region_index.cmp(&b.region_index))
    });

    let available = range
        .last_below(ceiling)
        .map_or(0, |last| last - range.start + 1);
    let exhausted = |required| Error::AddressSpaceExhausted {
        class,
        required,
        available,
    };

    let mut cursor = range.start;
    let mut assignments = Vec::with_capacity(sorted.len());
    for req in sorted {
        let mask = req.size - 1;
        let placed = (cursor | mask)
            .checked_add(1)
            .and_then(|base| Some((base, base.checked_add(mask)?)));
        let Some((base, last)) = placed else {
            return Err(exhausted(u64::MAX));
        };
        assignments.push(BarAssignment::new(req, base));
        cursor = last;
    }

    let Some(first) = assignments.first().map(|asn| asn.base) else {
        return Ok(Packed { assignments, span: None });
    };
    match range.last_below(ceiling) {
        Some(last) if cursor <= last => {
            Ok(Packed { assignments, span: Some((first, cursor)) })
        }
        _ => Err(exhausted((cursor - range.start).saturating_add(1))),
    }
}

/// Sizes and places the windows of PCI-PCI bridges.
pub struct BridgeAllocator {
    log: Logger,
}

impl BridgeAllocator {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.new(o!("component" => "bridge-alloc")) }
    }

    /// Place every request behind `bridge` within `budget` and record the
    /// resulting windows in `bridge`.
    ///
    /// Assignments come back grouped by class (I/O, memory, prefetchable),
    /// each group in placement order. Allocation is all-or-nothing: on error
    /// `bridge` is left untouched. Identical inputs always produce identical
    /// placements.
    pub fn allocate(
        &self,
        bridge: &mut BridgeWindowSpec,
        requests: &[BarRequest],
        budget: &WindowBudget,
    ) -> Result<Vec<BarAssignment>> {
        if requests.len() > MAX_PCI_REGIONS {
            return Err(Error::RegionBudgetExceeded {
                requested: requests.len(),
                max: MAX_PCI_REGIONS,
            });
        }
        bridge.validate_buses()?;
        let mut seen = [false; MAX_PCI_REGIONS];
        for req in requests {
            req.validate()?;
            if std::mem::replace(&mut seen[req.region_index], true) {
                return Err(Error::InvalidBarRequest {
                    region: req.region_index,
                    reason: "duplicate region index",
                });
            }
        }

        let below_4g = u64::from(u32::MAX);
        let io = pack(
            WindowClass::Io,
            &of_class(requests, WindowClass::Io),
            budget.io,
            below_4g,
        )?;
        let mem = pack(
            WindowClass::Memory,
            &of_class(requests, WindowClass::Memory),
            budget.mem,
            below_4g,
        )?;
        let (pref, pref_64bit) = self.pack_prefetchable(
            &of_class(requests, WindowClass::Prefetchable),
            budget,
        )?;

        let mut next = *bridge;
        next.set_window(WindowClass::Io, io.span);
        next.set_window(WindowClass::Memory, mem.span);
        next.set_window(WindowClass::Prefetchable, pref.span);
        next.pref_64bit = pref_64bit && pref.span.is_some();
        *bridge = next;

        info!(self.log, "allocated bridge windows";
            "secondary_bus" => bridge.secondary_bus,
            "regions" => requests.len(),
            "io" => ?io.span,
            "mem" => ?mem.span,
            "pref" => ?pref.span,
            "pref_64bit" => bridge.pref_64bit,
        );

        let mut assignments = io.assignments;
        assignments.extend(mem.assignments);
        assignments.extend(pref.assignments);
        Ok(assignments)
    }

    /// The prefetchable class stays below 4 GiB unless a request is too large
    /// for 32-bit space or the low budget cannot hold it; it then moves above
    /// 4 GiB as a whole, which requires every request in it to be 64-bit.
    fn pack_prefetchable(
        &self,
        reqs: &[&BarRequest],
        budget: &WindowBudget,
    ) -> Result<(Packed, bool)> {
        let needs_high = reqs.iter().any(|req| req.size >> 32 != 0);
        let high = budget.pref64.filter(|_| {
            !reqs.is_empty()
                && reqs.iter().all(|req| req.kind == BarKind::Prefetchable64)
        });

        if !needs_high || high.is_none() {
            let low = pack(
                WindowClass::Prefetchable,
                reqs,
                budget.pref,
                u64::from(u32::MAX),
            );
            match (low, high) {
                (Ok(packed), _) => return Ok((packed, false)),
                (Err(e), None) => return Err(e),
                (Err(e), Some(_)) => {
                    warn!(self.log, "moving prefetchable window above 4 GiB";
                        "reason" => %e);
                }
            }
        }

        // `high` is populated whenever we get here.
        let range = high.unwrap_or(AddressRange::new(0, 0));
        let packed = pack(WindowClass::Prefetchable, reqs, range, u64::MAX)?;
        Ok((packed, true))
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;
    use crate::test::test_logger;

    const MIB: u64 = 1024 * 1024;

    fn budget() -> WindowBudget {
        WindowBudget {
            io: AddressRange::new(0x1000, 0xf000),
            mem: AddressRange::new(0x4000_0000, 8 * MIB),
            pref: AddressRange::new(0x8000_0000, 256 * MIB),
            pref64: Some(AddressRange::new(0x80_0000_0000, 64 << 30)),
        }
    }

    fn bridge() -> BridgeWindowSpec {
        BridgeWindowSpec::new(0, 1, 1).unwrap()
    }

    fn mem(idx: usize, size: u64) -> BarRequest {
        BarRequest::new(idx, size, BarKind::Memory32)
    }

    fn bases(asns: &[BarAssignment]) -> Vec<(usize, u64)> {
        asns.iter().map(|a| (a.region_index, a.base)).collect()
    }

    #[test]
    fn descending_size_packing() {
        let alloc = BridgeAllocator::new(&test_logger());
        let mut br = bridge();
        let asns = alloc
            .allocate(
                &mut br,
                &[mem(0, 4096), mem(1, 65536), mem(2, 16384)],
                &budget(),
            )
            .unwrap();

        assert_eq!(
            bases(&asns),
            vec![(1, 0x4001_0000), (2, 0x4002_0000), (0, 0x4002_4000)]
        );
        assert_eq!(br.mem_base, 0x4001_0000);
        assert_eq!(u64::from(br.mem_limit) + 1, 0x4002_5000);
        assert!(!br.is_open(WindowClass::Io));
        assert!(!br.is_open(WindowClass::Prefetchable));
        assert_eq!(br.next_free(WindowClass::Memory), Some(0x4010_0000));
    }

    #[test]
    fn equal_sizes_ordered_by_region() {
        let alloc = BridgeAllocator::new(&test_logger());
        let mut br = bridge();
        let asns = alloc
            .allocate(
                &mut br,
                &[mem(4, 0x1000), mem(1, 0x1000), mem(3, 0x2000)],
                &budget(),
            )
            .unwrap();
        assert_eq!(
            bases(&asns),
            vec![(3, 0x4000_2000), (1, 0x4000_4000), (4, 0x4000_5000)]
        );
    }

    #[test]
    fn classes_packed_independently() {
        let alloc = BridgeAllocator::new(&test_logger());
        let mut br = bridge();
        let asns = alloc
            .allocate(
                &mut br,
                &[
                    BarRequest::new(0, 0x100, BarKind::Io),
                    BarRequest::new(1, 0x20, BarKind::Io),
                    BarRequest::new(2, 0x4000, BarKind::Memory64),
                    BarRequest::new(4, MIB, BarKind::Prefetchable64),
                    BarRequest::new(6, 0x1_0000, BarKind::Memory32),
                ],
                &budget(),
            )
            .unwrap();

        assert_eq!(
            bases(&asns),
            vec![
                (0, 0x1100),
                (1, 0x1200),
                (6, 0x4001_0000),
                (2, 0x4002_0000),
                (4, 0x8010_0000),
            ]
        );
        assert_eq!(br.window(WindowClass::Io), Some((0x1100, 0x121f)));
        assert_eq!(
            br.window(WindowClass::Memory),
            Some((0x4001_0000, 0x4002_3fff))
        );
        assert_eq!(
            br.window(WindowClass::Prefetchable),
            Some((0x8010_0000, 0x801f_ffff))
        );
        assert!(!br.pref_64bit);
    }

    #[test]
    fn too_many_regions() {
        let alloc = BridgeAllocator::new(&test_logger());
        let mut br = bridge();
        let reqs: Vec<BarRequest> =
            (0..8).map(|i| mem(i % MAX_PCI_REGIONS, 0x1000)).collect();
        let before = br;
        assert_eq!(
            alloc.allocate(&mut br, &reqs, &budget()),
            Err(Error::RegionBudgetExceeded { requested: 8, max: 7 })
        );
        assert_eq!(br, before);
    }

    #[test]
    fn invalid_requests() {
        let alloc = BridgeAllocator::new(&test_logger());
        let mut br = bridge();
        assert!(matches!(
            alloc.allocate(&mut br, &[mem(0, 0x1000), mem(0, 0x2000)], &budget()),
            Err(Error::InvalidBarRequest { region: 0, .. })
        ));
        assert!(matches!(
            alloc.allocate(&mut br, &[mem(1, 0x1800)], &budget()),
            Err(Error::InvalidBarRequest { region: 1, .. })
        ));
        assert!(matches!(
            alloc.allocate(&mut br, &[mem(7, 0x1000)], &budget()),
            Err(Error::InvalidBarRequest { region: 7, .. })
        ));
    }

    #[test]
    fn exhaustion_reports_sizes_and_keeps_bridge() {
        let alloc = BridgeAllocator::new(&test_logger());
        let mut br = bridge();
        alloc.allocate(&mut br, &[mem(0, 0x1000)], &budget()).unwrap();
        let before = br;

        let res = alloc.allocate(
            &mut br,
            &[mem(0, 4 * MIB), mem(1, 4 * MIB), mem(2, 0x1000)],
            &budget(),
        );
        assert_eq!(
            res,
            Err(Error::AddressSpaceExhausted {
                class: WindowClass::Memory,
                required: 12 * MIB + 0x1000,
                available: 8 * MIB,
            })
        );
        assert_eq!(br, before);
    }

    #[test]
    fn io_window_stays_in_its_budget() {
        let alloc = BridgeAllocator::new(&test_logger());
        let mut br = bridge();
        let mut budget = budget();
        budget.io = AddressRange::new(0x1000, 0x200);
        assert!(matches!(
            alloc.allocate(
                &mut br,
                &[BarRequest::new(0, 0x200, BarKind::Io)],
                &budget
            ),
            Err(Error::AddressSpaceExhausted { class: WindowClass::Io, .. })
        ));
    }

    #[test]
    fn prefetchable_moves_high_under_pressure() {
        let alloc = BridgeAllocator::new(&test_logger());
        let mut br = bridge();
        let asns = alloc
            .allocate(
                &mut br,
                &[
                    BarRequest::new(0, 256 * MIB, BarKind::Prefetchable64),
                    BarRequest::new(2, 16 * MIB, BarKind::Prefetchable64),
                ],
                &budget(),
            )
            .unwrap();
        assert_eq!(
            bases(&asns),
            vec![(0, 0x80_1000_0000), (2, 0x80_2000_0000)]
        );
        assert!(br.pref_64bit);
        assert_eq!(br.pref_base, 0x80_1000_0000);
        assert_eq!(br.pref_limit, 0x80_20ff_ffff);
    }

    #[test]
    fn huge_prefetchable_region_goes_high() {
        let alloc = BridgeAllocator::new(&test_logger());
        let mut br = bridge();
        let asns = alloc
            .allocate(
                &mut br,
                &[BarRequest::new(0, 8 << 30, BarKind::Prefetchable64)],
                &budget(),
            )
            .unwrap();
        assert_eq!(bases(&asns), vec![(0, 0x82_0000_0000)]);
        assert!(br.pref_64bit);
    }

    #[test]
    fn prefetchable_with_32bit_member_stays_low() {
        let alloc = BridgeAllocator::new(&test_logger());
        let mut br = bridge();
        let res = alloc.allocate(
            &mut br,
            &[
                BarRequest::new(0, 256 * MIB, BarKind::Prefetchable64),
                BarRequest::new(2, MIB, BarKind::Prefetchable32),
            ],
            &budget(),
        );
        assert!(matches!(
            res,
            Err(Error::AddressSpaceExhausted {
                class: WindowClass::Prefetchable,
                available,
                ..
            }) if available == 256 * MIB
        ));

        let mut no_high = budget();
        no_high.pref64 = None;
        assert!(alloc
            .allocate(
                &mut br,
                &[BarRequest::new(0, 8 << 30, BarKind::Prefetchable64)],
                &no_high,
            )
            .is_err());
    }

    #[test]
    fn rerun_on_reset_bridge_is_identical() {
        let alloc = BridgeAllocator::new(&test_logger());
        let reqs = [
            BarRequest::new(0, 0x40, BarKind::Io),
            mem(1, 0x8000),
            mem(2, 0x8000),
            BarRequest::new(3, 2 * MIB, BarKind::Prefetchable32),
        ];
        let mut br = bridge();
        let first = alloc.allocate(&mut br, &reqs, &budget()).unwrap();
        let windows = br;

        br.reset();
        let second = alloc.allocate(&mut br, &reqs, &budget()).unwrap();
        assert_eq!(first, second);
        assert_eq!(br, windows);
    }

    #[test]
    fn siblings_do_not_share_granules() {
        let alloc = BridgeAllocator::new(&test_logger());
        let parent = budget();

        let mut first = BridgeWindowSpec::new(0, 1, 1).unwrap();
        alloc
            .allocate(
                &mut first,
                &[mem(0, 0x1000), BarRequest::new(1, 0x10, BarKind::Io)],
                &parent,
            )
            .unwrap();

        let rest = parent.after(&first);
        assert_eq!(rest.mem, AddressRange::new(0x4010_0000, 7 * MIB));
        assert_eq!(rest.io, AddressRange::new(0x2000, 0xe000));
        assert_eq!(rest.pref, parent.pref);

        let mut second = BridgeWindowSpec::new(0, 2, 2).unwrap();
        alloc.allocate(&mut second, &[mem(0, 0x1000)], &rest).unwrap();
        let (_, first_last) = first.window(WindowClass::Memory).unwrap();
        let (second_base, _) = second.window(WindowClass::Memory).unwrap();
        assert!(second_base / MIB > first_last / MIB);
    }

    #[test]
    fn empty_request_set_closes_windows() {
        let alloc = BridgeAllocator::new(&test_logger());
        let mut br = bridge();
        alloc.allocate(&mut br, &[mem(0, 0x1000)], &budget()).unwrap();
        assert!(alloc.allocate(&mut br, &[], &budget()).unwrap().is_empty());
        for class in WindowClass::ALL {
            assert!(!br.is_open(class));
        }
    }

    fn request_set() -> impl Strategy<Value = Vec<BarRequest>> {
        let kind = prop_oneof![
            Just(BarKind::Io),
            Just(BarKind::Memory32),
            Just(BarKind::Memory64),
            Just(BarKind::Prefetchable32),
            Just(BarKind::Prefetchable64),
        ];
        (
            Just((0..MAX_PCI_REGIONS).collect::<Vec<_>>()).prop_shuffle(),
            proptest::collection::vec((kind, 4u32..=24), MAX_PCI_REGIONS),
            0..=MAX_PCI_REGIONS,
        )
            .prop_map(|(indices, shapes, count)| {
                indices
                    .into_iter()
                    .zip(shapes)
                    .take(count)
                    .map(|(idx, (kind, exp))| {
                        let exp = if kind.is_io() { 2 + exp % 7 } else { exp };
                        BarRequest::new(idx, 1 << exp, kind)
                    })
                    .collect()
            })
    }

    proptest! {
        #[test]
        fn placements_aligned_and_disjoint(reqs in request_set()) {
            let alloc = BridgeAllocator::new(&test_logger());
            let mut budget = budget();
            budget.mem = AddressRange::new(0x4000_0000, 1 << 30);

            let mut br = bridge();
            let asns = alloc.allocate(&mut br, &reqs, &budget).unwrap();
            prop_assert_eq!(asns.len(), reqs.len());

            for (i, a) in asns.iter().enumerate() {
                prop_assert_eq!(a.base % a.size, 0);
                let class = WindowClass::of(a.kind);
                let (lo, hi) = br.window(class).unwrap();
                prop_assert!(lo <= a.base && a.last() <= hi);
                for b in &asns[i + 1..] {
                    if WindowClass::of(b.kind) == class {
                        prop_assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
                    }
                }
            }

            // Deterministic on a freshly reset bridge.
            let mut again = bridge();
            prop_assert_eq!(alloc.allocate(&mut again, &reqs, &budget).unwrap(), asns);
            prop_assert_eq!(again, br);
        }

        #[test]
        fn over_budget_count_is_all_or_nothing(
            reqs in request_set(),
            extra in 1usize..4,
        ) {
            let alloc = BridgeAllocator::new(&test_logger());
            let mut padded = reqs.clone();
            while padded.len() <= MAX_PCI_REGIONS + extra - 1 {
                padded.push(mem(0, 0x1000));
            }
            let mut br = bridge();
            let before = br;
            prop_assert_eq!(
                alloc.allocate(&mut br, &padded, &budget()),
                Err(Error::RegionBudgetExceeded {
                    requested: padded.len(),
                    max: MAX_PCI_REGIONS,
                })
            );
            prop_assert_eq!(br, before);
        }
    }
}
