// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use thiserror::Error;

use crate::alloc::WindowClass;
use crate::Bdf;

/// Why a capability walk was abandoned.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub enum MalformedReason {
    #[strum(to_string = "capability header lies outside config space")]
    OutOfBounds,
    #[strum(to_string = "capability list loops back on itself")]
    Cycle,
    #[strum(to_string = "capability list exceeds the maximum entry count")]
    TooManyEntries,
}

/// Errors are always scoped to the single device (or bridge subtree) being
/// processed; none of them should stop enumeration of its siblings.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("malformed capability list at offset {offset:#x}: {reason}")]
    MalformedCapabilityList { offset: u16, reason: MalformedReason },

    #[error("{requested} BAR requests exceed the limit of {max} per device")]
    RegionBudgetExceeded { requested: usize, max: usize },

    #[error(
        "{class} window needs {required:#x} bytes but only {available:#x} \
         are available"
    )]
    AddressSpaceExhausted { class: WindowClass, required: u64, available: u64 },

    #[error("link training did not complete within {elapsed:?}")]
    LinkTrainingTimeout { elapsed: Duration },

    #[error("invalid BAR request for region {region}: {reason}")]
    InvalidBarRequest { region: usize, reason: &'static str },

    #[error(
        "invalid bus range: primary {primary}, secondary {secondary}, \
         subordinate {subordinate}"
    )]
    InvalidBusRange { primary: u8, secondary: u8, subordinate: u8 },

    #[error("invalid {width}-byte config access to {bdf} at offset {offset:#x}")]
    InvalidAccess { bdf: Bdf, offset: u16, width: u16 },

    #[error("{bdf} has no capability with ID {id:#x}")]
    NoCapability { bdf: Bdf, id: u8 },

    #[error("invalid device address: {0}")]
    InvalidBdf(String),
}

pub type Result<T> = std::result::Result<T, Error>;
