// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Enumeration-time helpers for PCI and PCI Express.
//!
//! This crate does not scan buses itself. The caller discovers devices and
//! hands each one to the pieces here:
//!
//! - [`cap`] walks the capability list of a device,
//! - [`alloc`] packs the BARs behind a bridge into its forwarding windows,
//! - [`link`] retrains a PCI Express link.
//!
//! All config space traffic flows through a caller-supplied
//! [`ConfigSpaceAccessor`].

#![allow(clippy::style)]

#[macro_use]
extern crate bitflags;

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

pub mod alloc;
pub mod bar;
pub mod bits;
pub mod bridge;
pub mod cap;
pub mod cfgspace;
mod error;
pub mod link;

#[cfg(test)]
pub(crate) mod test;

pub use alloc::{AddressRange, BridgeAllocator, WindowBudget, WindowClass};
pub use bar::{BarAssignment, BarKind, BarRequest};
pub use bridge::BridgeWindowSpec;
pub use cap::{CapabilityId, CapabilityList, CapabilityRecord};
pub use cfgspace::{ConfigSpaceAccessor, MemCfgSpace, Width};
pub use error::{Error, MalformedReason, Result};
pub use link::{
    Clock, LinkState, LinkStatus, LinkTrainer, LinkTrainingOpts, MockClock,
    SystemClock,
};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct BusNum(u8);
impl BusNum {
    pub const fn new(n: u8) -> Self {
        Self(n)
    }
    pub const fn get(&self) -> u8 {
        self.0
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct DevNum(u8);
impl DevNum {
    /// Returns [`Option::None`] if `n` is not a valid PCI device number.
    pub const fn new(n: u8) -> Option<Self> {
        if n <= bits::MASK_DEV {
            Some(Self(n))
        } else {
            None
        }
    }
    pub const fn get(&self) -> u8 {
        self.0
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct FuncNum(u8);
impl FuncNum {
    /// Returns [`Option::None`] if `n` is not a valid PCI function number.
    pub const fn new(n: u8) -> Option<Self> {
        if n <= bits::MASK_FUNC {
            Some(Self(n))
        } else {
            None
        }
    }
    pub const fn get(&self) -> u8 {
        self.0
    }
}

/// Bus, Device, Function.
///
/// Identifies one instance of configuration space. Values are handed out by
/// the bus scanner and never change afterwards.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct Bdf {
    pub bus: BusNum,
    pub dev: DevNum,
    pub func: FuncNum,
}

impl Bdf {
    /// Returns [`Option::None`] if `dev` or `func` are out of range.
    pub const fn new(bus: u8, dev: u8, func: u8) -> Option<Self> {
        match (DevNum::new(dev), FuncNum::new(func)) {
            (Some(dev), Some(func)) => {
                Some(Self { bus: BusNum::new(bus), dev, func })
            }
            _ => None,
        }
    }

    /// # Panics
    ///
    /// If `dev` or `func` are outside their respective valid ranges
    pub const fn new_unchecked(bus: u8, dev: u8, func: u8) -> Self {
        match Self::new(bus, dev, func) {
            Some(bdf) => bdf,
            None => panic!("device or function number exceeds max"),
        }
    }
}

impl Display for Bdf {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}.{}.{}", self.bus.0, self.dev.0, self.func.0)
    }
}

impl FromStr for Bdf {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields = s
            .split('.')
            .map(|f| {
                f.parse::<u8>()
                    .map_err(|e| Error::InvalidBdf(format!("{s:?}: {e}")))
            })
            .collect::<Result<Vec<u8>>>()?;

        match fields[..] {
            [bus, dev, func] => Bdf::new(bus, dev, func).ok_or_else(|| {
                Error::InvalidBdf(format!("{s:?}: device or function too large"))
            }),
            _ => Err(Error::InvalidBdf(format!(
                "{s:?}: expected three fields, got {}",
                fields.len()
            ))),
        }
    }
}
