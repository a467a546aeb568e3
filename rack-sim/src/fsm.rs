// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Table-driven state machine runtime shared by every simulated element
//!
//! An [`Element`] owns a [`Machine`], which records the current state, the
//! guard tick and whether a terminal state has been reached. Behavior lives
//! in a static table of [`StateDef`]s, one per state. Each state maps a
//! message tag to an action plus the states to move to when the action
//! returns `true` or `false`, and may carry a default action and enter/leave
//! hooks.
//!
//! The runtime is entirely synchronous. Actions record side effects that
//! must happen outside the element (forwarding a message to another element,
//! arming a timer) in [`Effects`], and the owner of the element carries them
//! out once the action returns.

use crate::clock::{Tick, TimerRequest};
use crate::envelope::{Envelope, Response};
use crate::errors::SimError;
use slog::{debug, warn, Logger};
use std::fmt;

/// A message that a state machine can dispatch on
pub trait Message: Send + 'static {
    /// Closed set of message kinds used as the dispatch key
    type Tag: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    fn tag(&self) -> Self::Tag;

    /// The logical time at which this message was issued
    fn guard(&self) -> Tick;

    /// Complete the message; a no-op for fire-and-forget messages
    fn respond(self, response: Response);
}

/// Identifies a state in an element's state table
pub trait StateId:
    Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

impl<T> StateId for T where
    T: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

/// Something driven by a [`Machine`]
pub trait Element: Sized + 'static {
    type State: StateId;
    type Msg: Message;

    fn machine(&self) -> &Machine<Self>;
    fn machine_mut(&mut self) -> &mut Machine<Self>;
    fn log(&self) -> &Logger;
}

/// Side effects produced while handling a message
#[derive(Debug, Default)]
pub struct Effects {
    /// Messages to deliver to other elements of the same rack, in order
    pub forwards: Vec<Envelope>,
    /// Timers to hand to the simulated-time facility
    pub timers: Vec<TimerRequest>,
}

/// Per-message context handed to actions and hooks
pub struct Ctx<'a> {
    /// Logical time at which the message is being processed
    pub now: Tick,
    pub effects: &'a mut Effects,
}

impl<'a> Ctx<'a> {
    pub fn new(now: Tick, effects: &'a mut Effects) -> Ctx<'a> {
        Ctx { now, effects }
    }

    pub fn forward(&mut self, envelope: Envelope) {
        self.effects.forwards.push(envelope);
    }

    pub fn arm_timer(&mut self, due: Tick, envelope: Envelope) {
        self.effects.timers.push(TimerRequest { due, envelope });
    }
}

/// Handles a message; the return value selects the next state
pub type ActionFn<E> =
    fn(&mut E, &mut Ctx<'_>, <E as Element>::Msg) -> bool;

/// Handles a message that has no matching entry in the current state
pub type DefaultFn<E> = fn(&mut E, &mut Ctx<'_>, <E as Element>::Msg);

/// Runs after the state has changed; an error aborts the transition
pub type EnterFn<E> = fn(&mut E, &mut Ctx<'_>) -> Result<(), SimError>;

/// Runs before the state changes
pub type LeaveFn<E> = fn(&mut E, &mut Ctx<'_>);

/// Where to go after an action runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next<S> {
    Stay,
    To(S),
}

/// One row of a state's dispatch table
pub struct Entry<E: Element> {
    pub tag: <E::Msg as Message>::Tag,
    pub action: ActionFn<E>,
    pub on_true: Next<E::State>,
    pub on_false: Next<E::State>,
}

impl<E: Element> Entry<E> {
    /// An entry whose action never changes state
    pub const fn stay(
        tag: <E::Msg as Message>::Tag,
        action: ActionFn<E>,
    ) -> Entry<E> {
        Entry { tag, action, on_true: Next::Stay, on_false: Next::Stay }
    }

    /// An entry that moves to `state` when its action returns `true`
    pub const fn to(
        tag: <E::Msg as Message>::Tag,
        action: ActionFn<E>,
        state: E::State,
    ) -> Entry<E> {
        Entry { tag, action, on_true: Next::To(state), on_false: Next::Stay }
    }
}

/// Behavior of a single state
pub struct StateDef<E: Element> {
    pub state: E::State,
    pub entries: &'static [Entry<E>],
    /// Used when no entry matches; `None` answers `UnexpectedMessage`
    pub default: Option<DefaultFn<E>>,
    pub enter: Option<EnterFn<E>>,
    pub leave: Option<LeaveFn<E>>,
    /// Entering this state terminates the machine
    pub terminal: bool,
}

impl<E: Element> StateDef<E> {
    /// A state with only dispatch entries
    pub const fn new(
        state: E::State,
        entries: &'static [Entry<E>],
    ) -> StateDef<E> {
        StateDef {
            state,
            entries,
            default: None,
            enter: None,
            leave: None,
            terminal: false,
        }
    }
}

/// Runtime state of an element's state machine
pub struct Machine<E: Element> {
    current: E::State,
    guard: Tick,
    terminated: bool,
    table: &'static [StateDef<E>],
}

impl<E: Element> fmt::Debug for Machine<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("current", &self.current)
            .field("guard", &self.guard)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl<E: Element> Machine<E> {
    /// Create a machine in `initial` with a guard of zero
    ///
    /// Enter hooks are not run for the initial state.
    ///
    /// # Panics
    ///
    /// Panics if `initial` is not in `table`.
    pub fn new(table: &'static [StateDef<E>], initial: E::State) -> Self {
        let m =
            Machine { current: initial, guard: 0, terminated: false, table };
        let terminated = m.def(initial).terminal;
        Machine { terminated, ..m }
    }

    pub fn current(&self) -> E::State {
        self.current
    }

    /// The latest logical time at which this machine changed state or
    /// accepted a command
    pub fn guard(&self) -> Tick {
        self.guard
    }

    /// Move the guard forward to `at`; it never moves backward
    pub fn advance_guard(&mut self, at: Tick) {
        self.guard = self.guard.max(at);
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    // Every state an element can reach must have a row in its table; a
    // missing row is a defect in the element, not a runtime condition.
    fn def(&self, state: E::State) -> &'static StateDef<E> {
        match self.table.iter().find(|def| def.state == state) {
            Some(def) => def,
            None => panic!("state {state} is missing from its state table"),
        }
    }
}

/// Dispatch `msg` to the current state of `elem`
///
/// Errors come from a failed enter hook on the resulting transition; the
/// message itself has already been consumed by its action by then.
pub fn receive<E: Element>(
    elem: &mut E,
    ctx: &mut Ctx<'_>,
    msg: E::Msg,
) -> Result<(), SimError> {
    let def = elem.machine().def(elem.machine().current());
    let tag = msg.tag();

    let Some(entry) = def.entries.iter().find(|entry| entry.tag == tag) else {
        match def.default {
            Some(default) => default(elem, ctx, msg),
            None => unexpected_message(elem, ctx, msg),
        }
        return Ok(());
    };

    let guard = msg.guard();
    let next = if (entry.action)(elem, ctx, msg) {
        entry.on_true
    } else {
        entry.on_false
    };
    match next {
        Next::Stay => Ok(()),
        Next::To(state) => change_state(elem, ctx, state, guard),
    }
}

/// Move `elem` to `next`, running leave and enter hooks
///
/// The guard advances to at least `at`. Changing to the current state does
/// nothing. If the enter hook fails, the element is put back in its prior
/// state and the error is returned.
pub fn change_state<E: Element>(
    elem: &mut E,
    ctx: &mut Ctx<'_>,
    next: E::State,
    at: Tick,
) -> Result<(), SimError> {
    let prior = elem.machine().current();
    if prior == next {
        return Ok(());
    }

    let old = elem.machine().def(prior);
    let new = elem.machine().def(next);

    if let Some(leave) = old.leave {
        leave(elem, ctx);
    }

    let machine = elem.machine_mut();
    machine.current = next;
    machine.advance_guard(at);
    debug!(elem.log(), "state change";
        "from" => %prior,
        "to" => %next,
        "guard" => elem.machine().guard(),
        "now" => ctx.now,
    );

    if let Some(enter) = new.enter {
        if let Err(err) = enter(elem, ctx) {
            warn!(elem.log(), "enter hook failed, reverting state change";
                "from" => %prior,
                "to" => %next,
                "error" => %err,
            );
            elem.machine_mut().current = prior;
            return Err(err);
        }
    }

    // An enter hook may itself have moved on to another state.
    let current = elem.machine().current();
    let terminal = elem.machine().def(current).terminal;
    elem.machine_mut().terminated = terminal;
    Ok(())
}

/// The standard reply to a message the current state does not accept
///
/// Used whenever a state has no default action. Callers that raced a state
/// change (a timer cancelled by a power-off, say) should treat this as a
/// harmless no-op.
pub fn unexpected_message<E: Element>(
    elem: &mut E,
    ctx: &mut Ctx<'_>,
    msg: E::Msg,
) {
    let state = elem.machine().current();
    let tag = msg.tag();
    debug!(elem.log(), "unexpected message";
        "state" => %state,
        "message" => ?tag,
    );
    msg.respond(Response::failed(
        ctx.now,
        SimError::UnexpectedMessage {
            state: state.to_string(),
            message: format!("{tag:?}"),
        },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Payload;
    use crate::target::MessageTarget;
    use rack_sim_test_utils::dev::test_setup_log;

    // A lamp: turns on and off with `SetPower`, reports with `GetStatus`, and
    // burns out (terminally) on `Shutdown`. Entering `On` fails while
    // `broken` is set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum LampState {
        Off,
        On,
        BurntOut,
    }

    impl fmt::Display for LampState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(self, f)
        }
    }

    struct Lamp {
        sm: Machine<Lamp>,
        log: Logger,
        broken: bool,
        enters: usize,
        leaves: usize,
    }

    impl Element for Lamp {
        type State = LampState;
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

    fn wants_on(_: &mut Lamp, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
        let on = matches!(msg.payload, Payload::SetPower { on: true });
        msg.respond(Response::ok(ctx.now));
        on
    }

    fn wants_off(_: &mut Lamp, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
        let off = matches!(msg.payload, Payload::SetPower { on: false });
        msg.respond(Response::ok(ctx.now));
        off
    }

    fn burn_out(_: &mut Lamp, ctx: &mut Ctx<'_>, msg: Envelope) -> bool {
        msg.respond(Response::ok(ctx.now));
        true
    }

    fn enter_on(lamp: &mut Lamp, _: &mut Ctx<'_>) -> Result<(), SimError> {
        lamp.enters += 1;
        if lamp.broken {
            return Err(SimError::CableStuck);
        }
        Ok(())
    }

    fn leave_on(lamp: &mut Lamp, _: &mut Ctx<'_>) {
        lamp.leaves += 1;
    }

    fn ignore(_: &mut Lamp, _: &mut Ctx<'_>, _: Envelope) {}

    static LAMP_STATES: &[StateDef<Lamp>] = &[
        StateDef {
            enter: None,
            leave: None,
            default: Some(ignore),
            ..StateDef::new(
                LampState::Off,
                &[Entry::to(
                    crate::messages::MessageTag::SetPower,
                    wants_on,
                    LampState::On,
                )],
            )
        },
        StateDef {
            enter: Some(enter_on),
            leave: Some(leave_on),
            ..StateDef::new(
                LampState::On,
                &[
                    Entry::to(
                        crate::messages::MessageTag::SetPower,
                        wants_off,
                        LampState::Off,
                    ),
                    Entry::to(
                        crate::messages::MessageTag::Shutdown,
                        burn_out,
                        LampState::BurntOut,
                    ),
                ],
            )
        },
        StateDef {
            terminal: true,
            ..StateDef::new(LampState::BurntOut, &[])
        },
    ];

    fn lamp(log: &Logger) -> Lamp {
        Lamp {
            sm: Machine::new(LAMP_STATES, LampState::Off),
            log: log.clone(),
            broken: false,
            enters: 0,
            leaves: 0,
        }
    }

    fn send(
        lamp: &mut Lamp,
        now: Tick,
        guard: Tick,
        payload: Payload,
    ) -> (Result<(), SimError>, Option<Response>) {
        let (env, mut rx) =
            Envelope::request(MessageTarget::pdu("lamp"), guard, payload);
        let mut effects = Effects::default();
        let mut ctx = Ctx::new(now, &mut effects);
        let res = receive(lamp, &mut ctx, env);
        (res, rx.try_recv().ok())
    }

    #[test]
    fn transitions_follow_action_result() {
        let logctx = test_setup_log("transitions_follow_action_result");
        let mut lamp = lamp(&logctx.log);

        // `false` from the action keeps the current state.
        let (res, rsp) = send(&mut lamp, 1, 1, Payload::SetPower { on: false });
        res.unwrap();
        assert!(rsp.unwrap().is_ok());
        assert_eq!(lamp.sm.current(), LampState::Off);
        assert_eq!(lamp.sm.guard(), 0);

        let (res, _) = send(&mut lamp, 5, 3, Payload::SetPower { on: true });
        res.unwrap();
        assert_eq!(lamp.sm.current(), LampState::On);
        assert_eq!(lamp.sm.guard(), 3);
        assert_eq!(lamp.enters, 1);

        // The guard never moves backward even if an older message causes a
        // transition.
        let (res, _) = send(&mut lamp, 6, 2, Payload::SetPower { on: false });
        res.unwrap();
        assert_eq!(lamp.sm.current(), LampState::Off);
        assert_eq!(lamp.sm.guard(), 3);
        assert_eq!(lamp.leaves, 1);
        logctx.cleanup_successful();
    }

    #[test]
    fn unmatched_messages_use_default_or_builtin() {
        let logctx =
            test_setup_log("unmatched_messages_use_default_or_builtin");
        let mut lamp = lamp(&logctx.log);

        // `Off` has a default action that swallows the message.
        let (res, rsp) = send(&mut lamp, 1, 1, Payload::GetStatus);
        res.unwrap();
        assert_eq!(rsp, None);

        // `On` has no default, so the runtime answers for it.
        send(&mut lamp, 2, 2, Payload::SetPower { on: true }).0.unwrap();
        let (res, rsp) = send(&mut lamp, 3, 3, Payload::GetStatus);
        res.unwrap();
        let rsp = rsp.unwrap();
        assert_eq!(rsp.at, 3);
        assert_eq!(
            rsp.result,
            Err(SimError::UnexpectedMessage {
                state: "On".to_string(),
                message: "GetStatus".to_string(),
            })
        );
        assert_eq!(lamp.sm.current(), LampState::On);
        logctx.cleanup_successful();
    }

    #[test]
    fn failed_enter_aborts_transition() {
        let logctx = test_setup_log("failed_enter_aborts_transition");
        let mut lamp = lamp(&logctx.log);
        lamp.broken = true;

        let (res, _) = send(&mut lamp, 1, 1, Payload::SetPower { on: true });
        assert_eq!(res, Err(SimError::CableStuck));
        assert_eq!(lamp.sm.current(), LampState::Off);
        assert_eq!(lamp.enters, 1);
        logctx.cleanup_successful();
    }

    #[test]
    fn terminal_state_sets_terminated() {
        let logctx = test_setup_log("terminal_state_sets_terminated");
        let mut lamp = lamp(&logctx.log);
        send(&mut lamp, 1, 1, Payload::SetPower { on: true }).0.unwrap();
        assert!(!lamp.sm.terminated());

        send(&mut lamp, 2, 2, Payload::Shutdown).0.unwrap();
        assert_eq!(lamp.sm.current(), LampState::BurntOut);
        assert!(lamp.sm.terminated());
        logctx.cleanup_successful();
    }

    #[test]
    fn direct_change_state_runs_hooks() {
        let logctx = test_setup_log("direct_change_state_runs_hooks");
        let mut lamp = lamp(&logctx.log);
        let mut effects = Effects::default();
        let mut ctx = Ctx::new(10, &mut effects);

        change_state(&mut lamp, &mut ctx, LampState::On, 10).unwrap();
        change_state(&mut lamp, &mut ctx, LampState::On, 11).unwrap();
        assert_eq!(lamp.enters, 1);
        assert_eq!(lamp.sm.guard(), 10);

        change_state(&mut lamp, &mut ctx, LampState::Off, 12).unwrap();
        assert_eq!(lamp.leaves, 1);
        assert_eq!(lamp.sm.guard(), 12);
        logctx.cleanup_successful();
    }
}
