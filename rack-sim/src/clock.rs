// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated time
//!
//! Racks never look at a wall clock. They ask a [`SimClock`] for the current
//! logical tick when they start processing a message, and hand it timer
//! requests that come back later as ordinary `TimerExpiry` envelopes on the
//! rack's inbound queue.

use crate::envelope::Envelope;
use crate::rack::RackRequest;
use serde::{Deserialize, Serialize};
use slog::{debug, o, warn, Logger};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A number of simulated clock ticks since the simulation started
pub type Tick = u64;

/// Identifies one armed timer within a blade
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// A timer requested by a simulated element while handling a message
///
/// `envelope` is delivered to the element's rack once the clock reaches
/// `due`.
#[derive(Debug)]
pub struct TimerRequest {
    pub due: Tick,
    pub envelope: Envelope,
}

/// A timer bound to the inbound queue of the rack that asked for it
///
/// The queue is held weakly so that outstanding timers do not keep a stopped
/// rack's queue open.
#[derive(Debug)]
pub struct TimerDelivery {
    queue: mpsc::WeakSender<RackRequest>,
    envelope: Envelope,
}

impl TimerDelivery {
    pub(crate) fn new(
        queue: mpsc::WeakSender<RackRequest>,
        envelope: Envelope,
    ) -> Self {
        TimerDelivery { queue, envelope }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Enqueue the expiry on the owning rack
    ///
    /// If the queue is full, a task is spawned on the current tokio runtime
    /// to wait for space. Fails only if the rack is gone, or if the queue is
    /// full and there is no runtime to wait on.
    pub fn deliver(self) -> Result<(), TimerDeliveryError> {
        let Some(queue) = self.queue.upgrade() else {
            return Err(TimerDeliveryError::RackGone);
        };
        match queue.try_send(RackRequest::Deliver(self.envelope)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(TimerDeliveryError::RackGone),
            Err(TrySendError::Full(req)) => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|_| TimerDeliveryError::QueueFull)?;
                // A rack that stops first answers nothing; the expiry is
                // moot by then.
                runtime.spawn(async move {
                    let _ = queue.send(req).await;
                });
                Ok(())
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TimerDeliveryError {
    #[error("rack no longer accepts messages")]
    RackGone,
    #[error("rack inbound queue is full and no runtime can wait for space")]
    QueueFull,
}

/// The simulated-time facility consumed by racks
pub trait SimClock: Send + Sync + 'static {
    /// The current logical tick
    fn now(&self) -> Tick;

    /// Deliver `delivery` once the clock reaches `due`
    ///
    /// A timer that is already due is delivered on the next advance.
    fn schedule(&self, due: Tick, delivery: TimerDelivery);
}

/// A manually driven [`SimClock`]
///
/// Time only moves when [`Stepper::advance`] is called. Timers due at the
/// same tick are delivered in the order they were scheduled, which keeps
/// tests deterministic.
pub struct Stepper {
    log: Logger,
    inner: Mutex<StepperInner>,
}

struct StepperInner {
    now: Tick,
    // Tie-breaker so that timers due at the same tick keep their order
    seq: u64,
    pending: BTreeMap<(Tick, u64), TimerDelivery>,
}

impl Stepper {
    pub fn new(log: &Logger) -> Stepper {
        Stepper::starting_at(log, 0)
    }

    pub fn starting_at(log: &Logger, now: Tick) -> Stepper {
        Stepper {
            log: log.new(o!("component" => "stepper")),
            inner: Mutex::new(StepperInner {
                now,
                seq: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Move time forward by `ticks` and deliver every timer now due
    ///
    /// Returns the number of timers handed to their racks.
    pub fn advance(&self, ticks: Tick) -> usize {
        let (now, due) = {
            let mut inner = self.inner.lock().unwrap();
            inner.now = inner.now.saturating_add(ticks);
            let now = inner.now;
            let later = match now.checked_add(1) {
                Some(next) => inner.pending.split_off(&(next, 0)),
                None => BTreeMap::new(),
            };
            let due = std::mem::replace(&mut inner.pending, later);
            (now, due)
        };

        let mut delivered = 0;
        for ((at, _), delivery) in due {
            let target = delivery.envelope().target.clone();
            match delivery.deliver() {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(self.log, "dropping timer expiry";
                        "due" => at,
                        "now" => now,
                        "target" => &target,
                        "reason" => %err,
                    );
                }
            }
        }
        if delivered > 0 {
            debug!(self.log, "delivered timers";
                "now" => now,
                "count" => delivered,
            );
        }
        delivered
    }

    /// Number of timers scheduled but not yet due
    pub fn pending_timers(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

impl SimClock for Stepper {
    fn now(&self) -> Tick {
        self.inner.lock().unwrap().now
    }

    fn schedule(&self, due: Tick, delivery: TimerDelivery) {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.seq;
        inner.seq += 1;
        inner.pending.insert((due, seq), delivery);
    }
}
