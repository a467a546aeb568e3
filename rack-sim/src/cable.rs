// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A guarded power or network cable
//!
//! PDUs and TORs hold one [`Cable`] per blade slot. Every mutator applies the
//! same admission rule: a change issued at a logical time older than the
//! cable's guard is rejected with [`SimError::ChangeTooLate`]. Accepted
//! changes move the guard to the time they were applied.

use crate::clock::Tick;
use crate::errors::SimError;
use crate::target::{BladeId, MessageTarget};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Cable {
    on: bool,
    faulted: bool,
    guard: Tick,
}

impl Cable {
    pub fn new(on: bool, faulted: bool) -> Cable {
        Cable { on, faulted, guard: 0 }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn guard(&self) -> Tick {
        self.guard
    }

    /// Turn the cable on or off
    ///
    /// Returns whether the value changed. A faulted cable cannot be changed.
    pub fn set(
        &mut self,
        on: bool,
        guard: Tick,
        now: Tick,
    ) -> Result<bool, SimError> {
        if self.faulted {
            return Err(SimError::CableStuck);
        }
        self.admit(guard)?;
        let changed = self.on != on;
        self.on = on;
        self.advance(now);
        Ok(changed)
    }

    /// Mark the cable faulted, stuck in `on`
    pub fn fault(
        &mut self,
        on: bool,
        guard: Tick,
        now: Tick,
    ) -> Result<(), SimError> {
        self.admit(guard)?;
        self.faulted = true;
        self.on = on;
        self.advance(now);
        Ok(())
    }

    /// Clear a fault, leaving the cable in whatever state it was stuck in
    pub fn fix(&mut self, guard: Tick, now: Tick) -> Result<(), SimError> {
        self.admit(guard)?;
        self.faulted = false;
        self.advance(now);
        Ok(())
    }

    /// Change the cable even if it is faulted
    ///
    /// Models physically forcing the connector, e.g. when the whole PDU
    /// loses power. The fault flag is left alone. Returns whether the value
    /// changed.
    pub fn force(
        &mut self,
        on: bool,
        guard: Tick,
        now: Tick,
    ) -> Result<bool, SimError> {
        self.admit(guard)?;
        let changed = self.on != on;
        self.on = on;
        self.advance(now);
        Ok(changed)
    }

    fn admit(&self, guard: Tick) -> Result<(), SimError> {
        if guard < self.guard {
            return Err(SimError::ChangeTooLate { guard, current: self.guard });
        }
        Ok(())
    }

    fn advance(&mut self, now: Tick) {
        self.guard = self.guard.max(now);
    }
}

/// One cable per blade slot, as held by a PDU or a TOR
///
/// Slot commands name the blade through `target`, which is also what any
/// resulting error reports.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CableBank(BTreeMap<BladeId, Cable>);

impl CableBank {
    pub fn new(cables: impl IntoIterator<Item = (BladeId, Cable)>) -> Self {
        CableBank(cables.into_iter().collect())
    }

    pub fn get(&self, slot: BladeId) -> Option<&Cable> {
        self.0.get(&slot)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<BladeId, Cable> {
        self.0.clone()
    }

    /// Apply a repair command to one slot
    ///
    /// A command based on information older than the cable's last change is
    /// dropped. A command that would not change anything is rejected with
    /// `NoOperation` and leaves the cable, guard included, as it was.
    pub fn command(
        &mut self,
        target: &MessageTarget,
        slot: BladeId,
        on: bool,
        guard: Tick,
        now: Tick,
    ) -> Result<(), SimError> {
        let cable = self.slot_mut(target, slot)?;
        if guard < cable.guard() {
            return Err(SimError::RepairMessageDropped {
                target: target.clone(),
            });
        }
        if cable.is_faulted() {
            return Err(SimError::CableStuck);
        }
        if cable.is_on() == on {
            return Err(SimError::NoOperation { target: target.clone() });
        }
        cable.set(on, guard, now)?;
        Ok(())
    }

    pub fn fault(
        &mut self,
        target: &MessageTarget,
        slot: BladeId,
        on: bool,
        now: Tick,
    ) -> Result<(), SimError> {
        self.slot_mut(target, slot)?.fault(on, now, now)
    }

    pub fn fix(
        &mut self,
        target: &MessageTarget,
        slot: BladeId,
        now: Tick,
    ) -> Result<(), SimError> {
        self.slot_mut(target, slot)?.fix(now, now)
    }

    /// Force every cable that is on to off, faulted or not
    ///
    /// Returns the slots that changed.
    pub fn cut_all(&mut self, now: Tick) -> Vec<BladeId> {
        let mut cut = Vec::new();
        for (slot, cable) in self.0.iter_mut() {
            if cable.is_on() && matches!(cable.force(false, now, now), Ok(true))
            {
                cut.push(*slot);
            }
        }
        cut
    }

    fn slot_mut(
        &mut self,
        target: &MessageTarget,
        slot: BladeId,
    ) -> Result<&mut Cable, SimError> {
        self.0.get_mut(&slot).ok_or_else(|| SimError::InvalidTarget {
            target: target.clone(),
            reason: "no cable for this blade slot",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn set_reports_change() {
        let mut cable = Cable::new(false, false);
        assert_eq!(cable.set(true, 0, 1), Ok(true));
        assert!(cable.is_on());
        assert_eq!(cable.guard(), 1);

        // Same value is accepted but reported as unchanged.
        assert_eq!(cable.set(true, 1, 2), Ok(false));
        assert_eq!(cable.guard(), 2);
    }

    #[test]
    fn stale_changes_are_rejected() {
        let mut cable = Cable::new(false, false);
        cable.set(true, 5, 5).unwrap();

        assert_eq!(
            cable.set(false, 4, 6),
            Err(SimError::ChangeTooLate { guard: 4, current: 5 })
        );
        assert_eq!(
            cable.fault(false, 4, 6),
            Err(SimError::ChangeTooLate { guard: 4, current: 5 })
        );
        assert!(cable.force(false, 4, 6).is_err());
        assert!(cable.fix(4, 6).is_err());
        assert!(cable.is_on());
        assert!(!cable.is_faulted());
        assert_eq!(cable.guard(), 5);
    }

    #[test]
    fn faulted_cable_is_stuck_until_fixed() {
        let mut cable = Cable::new(false, false);
        cable.fault(false, 3, 3).unwrap();
        assert!(cable.is_faulted());

        assert_eq!(cable.set(true, 100, 4), Err(SimError::CableStuck));
        assert!(!cable.is_on());

        // Fixing still respects ordering.
        assert!(cable.fix(2, 4).is_err());
        cable.fix(3, 4).unwrap();
        assert!(!cable.is_faulted());
        assert!(!cable.is_on());
        assert_eq!(cable.set(true, 4, 5), Ok(true));
    }

    #[test]
    fn force_bypasses_fault() {
        let mut cable = Cable::new(true, false);
        cable.fault(true, 0, 1).unwrap();
        assert_eq!(cable.force(false, 1, 2), Ok(true));
        assert!(!cable.is_on());
        assert!(cable.is_faulted());
    }

    #[test]
    fn bank_command_outcomes() {
        let target = MessageTarget::blade("r1", 0);
        let mut bank = CableBank::new([
            (0, Cable::new(false, false)),
            (1, Cable::new(true, false)),
        ]);

        assert_eq!(bank.command(&target, 0, true, 0, 2), Ok(()));
        assert_eq!(
            bank.command(&target, 0, true, 2, 3),
            Err(SimError::NoOperation { target: target.clone() })
        );
        assert_eq!(
            bank.command(&target, 0, false, 1, 4),
            Err(SimError::RepairMessageDropped { target: target.clone() })
        );
        assert_eq!(bank.get(0).unwrap().guard(), 2);

        let missing = MessageTarget::blade("r1", 9);
        assert!(matches!(
            bank.command(&missing, 9, true, 5, 5),
            Err(SimError::InvalidTarget { .. })
        ));

        bank.fault(&target, 1, true, 5).unwrap();
        assert_eq!(
            bank.command(&target, 1, false, 6, 6),
            Err(SimError::CableStuck)
        );
    }

    #[test]
    fn unchanged_command_keeps_the_guard() {
        let target = MessageTarget::blade("r1", 0);
        let mut bank = CableBank::new([(0, Cable::new(false, false))]);
        assert_eq!(bank.command(&target, 0, true, 2, 2), Ok(()));

        // Nothing to do at tick 8, so the cable still dates from tick 2.
        assert_eq!(
            bank.command(&target, 0, true, 8, 8),
            Err(SimError::NoOperation { target: target.clone() })
        );
        assert_eq!(bank.get(0).unwrap().guard(), 2);

        // A command issued after the real change but before the rejected
        // one is still current.
        assert_eq!(bank.command(&target, 0, false, 5, 9), Ok(()));
        assert!(!bank.get(0).unwrap().is_on());
        assert_eq!(bank.get(0).unwrap().guard(), 9);
    }

    #[test]
    fn cut_all_reports_changed_slots() {
        let mut bank = CableBank::new([
            (0, Cable::new(true, false)),
            (1, Cable::new(false, false)),
            (2, Cable::new(true, true)),
        ]);
        assert_eq!(bank.cut_all(7), vec![0, 2]);
        assert!(bank.snapshot().values().all(|c| !c.is_on()));
        assert!(bank.get(2).unwrap().is_faulted());
        assert_eq!(bank.get(1).unwrap().guard(), 0);
        assert!(bank.cut_all(8).is_empty());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Set(bool),
        Fault(bool),
        Fix,
        Force(bool),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(Op::Set),
            any::<bool>().prop_map(Op::Fault),
            Just(Op::Fix),
            any::<bool>().prop_map(Op::Force),
        ]
    }

    proptest! {
        // Apply arbitrary operations with arbitrary guards at a monotonic
        // `now`, and check the admission rules after every step.
        #[test]
        fn guard_rules_hold(
            steps in prop::collection::vec((arb_op(), 0u64..50, 0u64..3), 1..64)
        ) {
            let mut cable = Cable::new(false, false);
            let mut now = 0;
            for (op, guard, dt) in steps {
                now += dt;
                let before = cable;
                let res = match op {
                    Op::Set(on) => cable.set(on, guard, now).map(|_| ()),
                    Op::Fault(on) => cable.fault(on, guard, now),
                    Op::Fix => cable.fix(guard, now),
                    Op::Force(on) => cable.force(on, guard, now).map(|_| ()),
                };

                // The guard never moves backward.
                prop_assert!(cable.guard() >= before.guard());

                match res {
                    Ok(()) => {
                        prop_assert!(guard >= before.guard());
                        if matches!(op, Op::Set(_)) {
                            prop_assert!(!before.is_faulted());
                        }
                    }
                    Err(err) => {
                        // Rejected changes leave the cable untouched.
                        prop_assert_eq!(cable, before);
                        match err {
                            SimError::CableStuck => {
                                prop_assert!(before.is_faulted());
                            }
                            SimError::ChangeTooLate { .. } => {
                                prop_assert!(guard < before.guard());
                            }
                            other => prop_assert!(false, "unexpected {other}"),
                        }
                    }
                }
            }
        }
    }
}
