// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated compute blade
//!
//! A blade only reacts to what its PDU and TOR tell it: power notices move
//! it between `off` and the powered states, network notices are recorded.
//! Booting and stopping take simulated time, modeled with timers armed on
//! entry to those states and cancelled on exit.
//!
//! ```text
//!  off --power on--> booting --boot timer--> working
//!   ^                                          | shutdown
//!   |                                          v
//!   +--shutdown timer-- stopping <--drained-- workload-stopping
//! ```
//!
//! A power-off notice in any powered state goes straight to `off`.

use crate::clock::{Tick, TimerId};
use crate::config::Timings;
use crate::envelope::{Envelope, Response};
use crate::errors::SimError;
use crate::fsm::{self, Ctx, Element, Entry, Machine, StateDef};
use crate::messages::{BladeStatus, Capacity, MessageTag, Payload, Status};
use crate::target::{BladeId, MessageTarget};
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BladeState {
    Off,
    Booting,
    Working,
    WorkloadStopping,
    Stopping,
}

impl fmt::Display for BladeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BladeState::Off => "off",
            BladeState::Booting => "booting",
            BladeState::Working => "working",
            BladeState::WorkloadStopping => "workload-stopping",
            BladeState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

pub struct Blade {
    id: BladeId,
    rack: String,
    log: Logger,
    sm: Machine<Blade>,
    timings: Timings,
    capacity: Capacity,
    used: Capacity,
    workloads: BTreeMap<Uuid, Capacity>,
    connected: bool,
    // The only timer whose expiry this blade will act on
    pending_timer: Option<TimerId>,
    next_timer: u64,
}

impl Element for Blade {
    type State = BladeState;
    type Msg = Envelope;

    fn machine(&self) -> &Machine<Self> {
        &self.sm
    }

    fn machine_mut(&mut self) -> &mut Machine<Self> {
        &mut self.sm
    }

    fn log(&self) -> &Logger {
        &self.log
    }
}

impl Blade {
    /// Create a blade
    ///
    /// A blade whose power cable starts out on is taken to be already
    /// running.
    pub fn new(
        rack: &str,
        id: BladeId,
        capacity: Capacity,
        timings: Timings,
        powered: bool,
        connected: bool,
        log: &Logger,
    ) -> Blade {
        let initial =
            if powered { BladeState::Working } else { BladeState::Off };
        Blade {
            id,
            rack: rack.to_string(),
            log: log.new(o!("blade" => id)),
            sm: Machine::new(BLADE_STATES, initial),
            timings,
            capacity,
            used: Capacity::ZERO,
            workloads: BTreeMap::new(),
            connected,
            pending_timer: None,
            next_timer: 0,
        }
    }

    pub fn id(&self) -> BladeId {
        self.id
    }

    pub fn state(&self) -> BladeState {
        self.sm.current()
    }

    pub fn status(&self) -> BladeStatus {
        BladeStatus {
            id: self.id,
            state: self.sm.current(),
            guard: self.sm.guard(),
            capacity: self.capacity,
            used: self.used,
            workloads: self.workloads.keys().copied().collect(),
            connected: self.connected,
        }
    }

    fn target(&self) -> MessageTarget {
        MessageTarget::blade(self.rack.clone(), self.id)
    }

    fn arm_timer(&mut self, ctx: &mut Ctx<'_>, delay: Tick) {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.pending_timer = Some(id);
        let due = ctx.now.saturating_add(delay);
        debug!(self.log, "arming timer"; "timer" => %id, "due" => due);
        ctx.arm_timer(
            due,
            Envelope::internal(self.target(), due, Payload::TimerExpiry { id }),
        );
    }

    // Consume the pending timer if `msg` is its expiry
    fn take_timer(&mut self, msg: &Envelope) -> bool {
        match msg.payload {
            Payload::TimerExpiry { id } if self.pending_timer == Some(id) => {
                self.pending_timer = None;
                true
            }
            _ => false,
        }
    }
}

fn power_request(msg: &Envelope) -> Option<bool> {
    match msg.payload {
        Payload::SetPower { on } => Some(on),
        _ => None,
    }
}

// off: SetPower
fn power_on(blade: &mut Blade, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    match power_request(&msg) {
        Some(true) => {
            info!(blade.log, "powered on");
            msg.respond(Response::ok(ctx.now));
            true
        }
        Some(false) => {
            let target = blade.target();
            msg.respond(Response::failed(
                ctx.now,
                SimError::NoOperation { target },
            ));
            false
        }
        None => {
            fsm::unexpected_message(blade, ctx, msg);
            false
        }
    }
}

// booting, working, workload-stopping, stopping: SetPower
fn power_off(blade: &mut Blade, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    match power_request(&msg) {
        Some(false) => {
            info!(blade.log, "lost power";
                "state" => %blade.sm.current(),
                "workloads" => blade.workloads.len(),
            );
            msg.respond(Response::ok(ctx.now));
            true
        }
        Some(true) => {
            let target = blade.target();
            msg.respond(Response::failed(
                ctx.now,
                SimError::NoOperation { target },
            ));
            false
        }
        None => {
            fsm::unexpected_message(blade, ctx, msg);
            false
        }
    }
}

// any state: SetConnection
fn note_connection(
    blade: &mut Blade,
    ctx: &mut Ctx<'_>,
    msg: Envelope,
) -> bool {
    let Payload::SetConnection { enabled } = msg.payload else {
        fsm::unexpected_message(blade, ctx, msg);
        return false;
    };
    debug!(blade.log, "network connection changed"; "enabled" => enabled);
    blade.connected = enabled;
    msg.respond(Response::ok(ctx.now));
    true
}

// any state: GetStatus
fn report(blade: &mut Blade, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    msg.respond(Response::status(ctx.now, Status::Blade(blade.status())));
    true
}

// booting: TimerExpiry
fn boot_complete(blade: &mut Blade, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
    if !blade.take_timer(&msg) {
        fsm::unexpected_message(blade, ctx, msg);
        return false;
    }
    info!(blade.log, "boot complete");
    msg.respond(Response::ok(ctx.now));
    true
}

// working: PlaceWorkload
fn place_workload(
    blade: &mut Blade,
    ctx: &mut Ctx<'_>,
    msg: Envelope,
) -> bool {
    let Payload::PlaceWorkload { id, size } = msg.payload else {
        fsm::unexpected_message(blade, ctx, msg);
        return false;
    };
    if blade.workloads.contains_key(&id) {
        msg.respond(Response::failed(
            ctx.now,
            SimError::DuplicateWorkload(id),
        ));
        return false;
    }
    let used = match blade.used.checked_add(&size) {
        Some(used) if blade.capacity.contains(&used) => used,
        _ => {
            let available = blade.capacity.saturating_sub(&blade.used);
            msg.respond(Response::failed(
                ctx.now,
                SimError::CapacityExceeded { requested: size, available },
            ));
            return false;
        }
    };
    debug!(blade.log, "placed workload"; "workload" => %id);
    blade.used = used;
    blade.workloads.insert(id, size);
    msg.respond(Response::ok(ctx.now));
    true
}

// working, workload-stopping: RemoveWorkload
//
// Returns whether the blade has no workloads left.
fn remove_workload(
    blade: &mut Blade,
    ctx: &mut Ctx<'_>,
    msg: Envelope,
) -> bool {
    let Payload::RemoveWorkload { id } = msg.payload else {
        fsm::unexpected_message(blade, ctx, msg);
        return false;
    };
    let Some(size) = blade.workloads.remove(&id) else {
        msg.respond(Response::failed(ctx.now, SimError::NoSuchWorkload(id)));
        return false;
    };
    debug!(blade.log, "workload stopped"; "workload" => %id);
    blade.used = blade.used.saturating_sub(&size);
    msg.respond(Response::ok(ctx.now));
    blade.workloads.is_empty()
}

// working: Shutdown
fn begin_shutdown(
    blade: &mut Blade,
    ctx: &mut Ctx<'_>,
    msg: Envelope,
) -> bool {
    info!(blade.log, "planned shutdown requested");
    msg.respond(Response::ok(ctx.now));
    true
}

// workload-stopping: TimerExpiry
fn workload_stop_timeout(
    blade: &mut Blade,
    ctx: &mut Ctx<'_>,
    msg: Envelope,
) -> bool {
    if !blade.take_timer(&msg) {
        fsm::unexpected_message(blade, ctx, msg);
        return false;
    }
    warn!(blade.log, "workloads did not stop in time, abandoning them";
        "remaining" => blade.workloads.len(),
    );
    blade.workloads.clear();
    blade.used = Capacity::ZERO;
    msg.respond(Response::ok(ctx.now));
    true
}

// stopping: TimerExpiry
fn shutdown_complete(
    blade: &mut Blade,
    ctx: &mut Ctx<'_>,
    msg: Envelope,
) -> bool {
    if !blade.take_timer(&msg) {
        fsm::unexpected_message(blade, ctx, msg);
        return false;
    }
    info!(blade.log, "shutdown complete");
    msg.respond(Response::ok(ctx.now));
    true
}

fn enter_off(blade: &mut Blade, _ctx: &mut Ctx<'_>) -> Result<(), SimError> {
    blade.workloads.clear();
    blade.used = Capacity::ZERO;
    blade.pending_timer = None;
    Ok(())
}

fn enter_booting(
    blade: &mut Blade,
    ctx: &mut Ctx<'_>,
) -> Result<(), SimError> {
    let delay = blade.timings.boot_delay;
    blade.arm_timer(ctx, delay);
    Ok(())
}

fn enter_workload_stopping(
    blade: &mut Blade,
    ctx: &mut Ctx<'_>,
) -> Result<(), SimError> {
    if blade.workloads.is_empty() {
        let now = ctx.now;
        return fsm::change_state(blade, ctx, BladeState::Stopping, now);
    }
    for id in blade.workloads.keys() {
        info!(blade.log, "asking workload to stop"; "workload" => %id);
    }
    let delay = blade.timings.workload_stop_timeout;
    blade.arm_timer(ctx, delay);
    Ok(())
}

fn enter_stopping(
    blade: &mut Blade,
    ctx: &mut Ctx<'_>,
) -> Result<(), SimError> {
    let delay = blade.timings.shutdown_delay;
    blade.arm_timer(ctx, delay);
    Ok(())
}

// Leaving a timed state cancels its timer; a late expiry is then answered
// as an unexpected message.
fn cancel_timer(blade: &mut Blade, _ctx: &mut Ctx<'_>) {
    if let Some(id) = blade.pending_timer.take() {
        debug!(blade.log, "cancelled timer"; "timer" => %id);
    }
}

static BLADE_STATES: &[StateDef<Blade>] = &[
    StateDef {
        enter: Some(enter_off),
        ..StateDef::new(
            BladeState::Off,
            &[
                Entry::to(MessageTag::SetPower, power_on, BladeState::Booting),
                Entry::stay(MessageTag::SetConnection, note_connection),
                Entry::stay(MessageTag::GetStatus, report),
            ],
        )
    },
    StateDef {
        enter: Some(enter_booting),
        leave: Some(cancel_timer),
        ..StateDef::new(
            BladeState::Booting,
            &[
                Entry::to(
                    MessageTag::TimerExpiry,
                    boot_complete,
                    BladeState::Working,
                ),
                Entry::to(MessageTag::SetPower, power_off, BladeState::Off),
                Entry::stay(MessageTag::SetConnection, note_connection),
                Entry::stay(MessageTag::GetStatus, report),
            ],
        )
    },
    StateDef::new(
        BladeState::Working,
        &[
            Entry::to(MessageTag::SetPower, power_off, BladeState::Off),
            Entry::stay(MessageTag::PlaceWorkload, place_workload),
            Entry::stay(MessageTag::RemoveWorkload, remove_workload),
            Entry::to(
                MessageTag::Shutdown,
                begin_shutdown,
                BladeState::WorkloadStopping,
            ),
            Entry::stay(MessageTag::SetConnection, note_connection),
            Entry::stay(MessageTag::GetStatus, report),
        ],
    ),
    StateDef {
        enter: Some(enter_workload_stopping),
        leave: Some(cancel_timer),
        ..StateDef::new(
            BladeState::WorkloadStopping,
            &[
                Entry::to(
                    MessageTag::RemoveWorkload,
                    remove_workload,
                    BladeState::Stopping,
                ),
                Entry::to(
                    MessageTag::TimerExpiry,
                    workload_stop_timeout,
                    BladeState::Stopping,
                ),
                Entry::to(MessageTag::SetPower, power_off, BladeState::Off),
                Entry::stay(MessageTag::SetConnection, note_connection),
                Entry::stay(MessageTag::GetStatus, report),
            ],
        )
    },
    StateDef {
        enter: Some(enter_stopping),
        leave: Some(cancel_timer),
        ..StateDef::new(
            BladeState::Stopping,
            &[
                Entry::to(
                    MessageTag::TimerExpiry,
                    shutdown_complete,
                    BladeState::Off,
                ),
                Entry::to(MessageTag::SetPower, power_off, BladeState::Off),
                Entry::stay(MessageTag::SetConnection, note_connection),
                Entry::stay(MessageTag::GetStatus, report),
            ],
        )
    },
];
