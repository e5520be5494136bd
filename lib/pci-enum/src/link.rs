// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI Express link retraining.

use std::cell::Cell;
use std::time::{Duration, Instant};

use slog::{debug, info, o, warn, Logger};

use crate::bits::*;
use crate::cap::{find_device_cap, CapabilityId};
use crate::cfgspace::ConfigSpaceAccessor;
use crate::{Bdf, Error, Result};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::Display)]
pub enum LinkState {
    #[default]
    Untrained,
    TrainingRequested,
    Trained,
    Failed,
}

/// Time source for the training poll loop.
pub trait Clock {
    /// Time elapsed since an arbitrary, fixed epoch.
    fn now(&self) -> Duration;
    fn sleep(&self, dur: Duration);
}

pub struct SystemClock {
    epoch: Instant,
}
impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}
impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur)
    }
}

/// A clock which only moves when slept on.
#[derive(Debug, Default)]
pub struct MockClock {
    now: Cell<Duration>,
    sleeps: Cell<usize>,
}
impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn advance(&self, dur: Duration) {
        self.now.set(self.now.get() + dur);
    }
    /// Number of times [`Clock::sleep`] was called.
    pub fn sleeps(&self) -> usize {
        self.sleeps.get()
    }
}
impl Clock for MockClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
    fn sleep(&self, dur: Duration) {
        self.sleeps.set(self.sleeps.get() + 1);
        self.advance(dur);
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinkTrainingOpts {
    /// Both ends of the link run off a common reference clock, so the
    /// common-clock configuration bit is set along with the retrain request.
    pub common_clock: bool,
    pub poll_interval: Duration,
}
impl Default for LinkTrainingOpts {
    fn default() -> Self {
        Self { common_clock: false, poll_interval: Duration::from_millis(1) }
    }
}

/// Decoded link status register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinkStatus {
    /// Current link speed, as an index into the supported link speeds vector.
    pub speed: u8,
    /// Negotiated lane count.
    pub width: u8,
    pub training: bool,
    pub slot_clock: bool,
}
impl From<u16> for LinkStatus {
    fn from(raw: u16) -> Self {
        let flags = LinkSta::from_bits_retain(raw);
        Self {
            speed: (raw & PCI_EXP_LNKSTA_CLS) as u8,
            width: ((raw & PCI_EXP_LNKSTA_NLW) >> PCI_EXP_LNKSTA_NLW_SHIFT)
                as u8,
            training: flags.contains(LinkSta::TRAINING),
            slot_clock: flags.contains(LinkSta::SLOT_CLOCK),
        }
    }
}

/// Drives the retrain handshake of one link.
///
/// Each call to [`LinkTrainer::train`] makes a single retrain attempt; a link
/// which fails to train keeps running at whatever width and speed it had
/// negotiated before, which is reported by [`LinkTrainer::last_status`].
pub struct LinkTrainer<C: Clock = SystemClock> {
    log: Logger,
    clock: C,
    opts: LinkTrainingOpts,
    state: LinkState,
    last_status: Option<LinkStatus>,
}

impl LinkTrainer<SystemClock> {
    pub fn new(log: &Logger, opts: LinkTrainingOpts) -> Self {
        Self::with_clock(log, opts, SystemClock::new())
    }
}

impl<C: Clock> LinkTrainer<C> {
    pub fn with_clock(log: &Logger, opts: LinkTrainingOpts, clock: C) -> Self {
        Self {
            log: log.new(o!("component" => "link-trainer")),
            clock,
            opts,
            state: LinkState::Untrained,
            last_status: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Link status as of the last poll.
    pub fn last_status(&self) -> Option<LinkStatus> {
        self.last_status
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Retrain the link whose control register sits at `link_control_offset`
    /// and wait up to `timeout` for training to finish.
    ///
    /// Failure of any kind leaves the trainer in [`LinkState::Failed`]; it is
    /// logged but never returned, so a bad link does not stop the scan.
    pub fn train<A: ConfigSpaceAccessor + ?Sized>(
        &mut self,
        acc: &mut A,
        bdf: Bdf,
        link_control_offset: u16,
        timeout: Duration,
    ) -> LinkState {
        if let Err(e) = self.train_checked(acc, bdf, link_control_offset, timeout)
        {
            warn!(self.log, "link training failed";
                "bdf" => %bdf,
                "error" => %e,
                "status" => ?self.last_status,
            );
        }
        self.state
    }

    /// Like [`LinkTrainer::train`], but a link that is still training at the
    /// deadline is reported as [`Error::LinkTrainingTimeout`] and accessor
    /// failures are passed through.
    pub fn train_checked<A: ConfigSpaceAccessor + ?Sized>(
        &mut self,
        acc: &mut A,
        bdf: Bdf,
        link_control_offset: u16,
        timeout: Duration,
    ) -> Result<LinkStatus> {
        self.state = LinkState::Untrained;
        self.last_status = None;
        let res = self.attempt(acc, bdf, link_control_offset, timeout);
        self.state = match res {
            Ok(_) => LinkState::Trained,
            Err(_) => LinkState::Failed,
        };
        res
    }

    fn attempt<A: ConfigSpaceAccessor + ?Sized>(
        &mut self,
        acc: &mut A,
        bdf: Bdf,
        ctl_off: u16,
        timeout: Duration,
    ) -> Result<LinkStatus> {
        let sta_off = ctl_off + (PCI_EXP_LNKSTA - PCI_EXP_LNKCTL);

        let mut ctl = LinkCtl::from_bits_retain(acc.read_u16(bdf, ctl_off)?);
        ctl.insert(LinkCtl::RETRAIN);
        if self.opts.common_clock {
            ctl.insert(LinkCtl::COMMON_CLOCK);
        }
        acc.write_u16(bdf, ctl_off, ctl.bits())?;
        self.state = LinkState::TrainingRequested;
        debug!(self.log, "requested retrain";
            "bdf" => %bdf, "lnkctl" => format!("{:#06x}", ctl.bits()));

        let start = self.clock.now();
        loop {
            let status = LinkStatus::from(acc.read_u16(bdf, sta_off)?);
            self.last_status = Some(status);
            let elapsed = self.clock.now().saturating_sub(start);
            if !status.training {
                info!(self.log, "link trained";
                    "bdf" => %bdf,
                    "speed" => status.speed,
                    "width" => status.width,
                    "elapsed_us" => elapsed.as_micros() as u64,
                );
                return Ok(status);
            }
            if elapsed >= timeout {
                return Err(Error::LinkTrainingTimeout { elapsed });
            }
            self.clock.sleep(self.opts.poll_interval.min(timeout - elapsed));
        }
    }

    /// Train the link of a device, finding its link control register through
    /// the PCI Express capability.
    ///
    /// Returns [`Error::NoCapability`] for devices without one. Training
    /// failures are reported through the returned [`LinkState`].
    pub fn train_device<A: ConfigSpaceAccessor + ?Sized>(
        &mut self,
        acc: &mut A,
        bdf: Bdf,
        limit: u16,
        timeout: Duration,
    ) -> Result<LinkState> {
        let cap =
            find_device_cap(&self.log, &*acc, bdf, limit, CapabilityId::Express)?;
        Ok(self.train(acc, bdf, cap.offset + PCI_EXP_LNKCTL, timeout))
    }
}
