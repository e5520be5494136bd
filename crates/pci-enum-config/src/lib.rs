// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TOML configuration for PCI enumeration: the address space handed to the
//! root bridge and the link training parameters.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use pci_enum::bits::{LEN_CFG, LEN_CFG_ECAM};
use pci_enum::{AddressRange, LinkTrainingOpts, WindowBudget};

const FOUR_GIB: u64 = 1 << 32;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Size of each device's config space: 256 for conventional PCI, 4096
    /// when extended (ECAM) access is available.
    #[serde(default = "default_config_space_limit", rename = "config-space-limit")]
    pub config_space_limit: u16,

    #[serde(default)]
    pub window: Windows,

    #[serde(default)]
    pub link: Link,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            config_space_limit: default_config_space_limit(),
            window: Windows::default(),
            link: Link::default(),
        }
    }
}

fn default_config_space_limit() -> u16 {
    LEN_CFG_ECAM
}

#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Window {
    pub start: u64,
    pub size: u64,
}
impl Window {
    fn end(&self) -> Option<u64> {
        self.start.checked_add(self.size)
    }
}
impl From<Window> for AddressRange {
    fn from(w: Window) -> Self {
        AddressRange::new(w.start, w.size)
    }
}

/// Address space available below the root bridge, per window class.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Windows {
    #[serde(default = "Windows::default_io")]
    pub io: Window,
    #[serde(default = "Windows::default_mem")]
    pub mem: Window,
    #[serde(default = "Windows::default_pref")]
    pub pref: Window,
    /// Prefetchable space above 4 GiB. Without it, every prefetchable
    /// window must fit below 4 GiB.
    #[serde(default)]
    pub pref64: Option<Window>,
}
impl Windows {
    fn default_io() -> Window {
        Window { start: 0x1000, size: 0xf000 }
    }
    fn default_mem() -> Window {
        Window { start: 0xc000_0000, size: 0x2000_0000 }
    }
    fn default_pref() -> Window {
        Window { start: 0xe000_0000, size: 0x1000_0000 }
    }
}
impl Default for Windows {
    fn default() -> Self {
        Self {
            io: Self::default_io(),
            mem: Self::default_mem(),
            pref: Self::default_pref(),
            pref64: None,
        }
    }
}

#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Link {
    #[serde(default = "Link::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "Link::default_poll_interval_us")]
    pub poll_interval_us: u64,
    #[serde(default)]
    pub common_clock: bool,
}
impl Link {
    fn default_timeout_ms() -> u64 {
        1000
    }
    fn default_poll_interval_us() -> u64 {
        1000
    }
}
impl Default for Link {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            poll_interval_us: Self::default_poll_interval_us(),
            common_clock: false,
        }
    }
}

/// Errors which may be returned when parsing the enumeration configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Check the values are usable as-is.
    pub fn validate(&self) -> Result<(), ParseError> {
        let invalid = |msg: String| Err(ParseError::Invalid(msg));

        if self.config_space_limit != LEN_CFG
            && self.config_space_limit != LEN_CFG_ECAM
        {
            return invalid(format!(
                "config-space-limit must be {} or {}, not {}",
                LEN_CFG, LEN_CFG_ECAM, self.config_space_limit
            ));
        }
        if self.link.poll_interval_us == 0 {
            return invalid("link.poll-interval-us must be non-zero".into());
        }

        let w = &self.window;
        for (name, win) in [("io", w.io), ("mem", w.mem), ("pref", w.pref)] {
            match win.end() {
                Some(end) if end <= FOUR_GIB => {}
                _ => {
                    return invalid(format!(
                        "window.{name} must lie below 4 GiB"
                    ))
                }
            }
        }
        if let Some(pref64) = w.pref64 {
            if pref64.start < FOUR_GIB || pref64.end().is_none() {
                return invalid(
                    "window.pref64 must lie above 4 GiB".to_string(),
                );
            }
        }
        let overlaps = |a: Window, b: Window| {
            a.size != 0
                && b.size != 0
                && a.start < b.start + b.size
                && b.start < a.start + a.size
        };
        if overlaps(w.mem, w.pref) {
            return invalid("window.mem and window.pref overlap".into());
        }
        Ok(())
    }

    /// Address space for the root bridge's allocator.
    pub fn budget(&self) -> WindowBudget {
        WindowBudget {
            io: self.window.io.into(),
            mem: self.window.mem.into(),
            pref: self.window.pref.into(),
            pref64: self.window.pref64.map(AddressRange::from),
        }
    }

    pub fn link_opts(&self) -> LinkTrainingOpts {
        LinkTrainingOpts {
            common_clock: self.link.common_clock,
            poll_interval: Duration::from_micros(self.link.poll_interval_us),
        }
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link.timeout_ms)
    }
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg = toml::from_str::<Config>(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    contents.parse()
}
