use serde::{Deserialize, Serialize};

use crate::{clock::TimeReading, command::Command, config::ScheduleDefaults, types::OutputState};

/// The persisted schedule singleton. Field names double as the store keys,
/// so a serialized schedule is exactly the on-disk/NVS record.
///
/// All time fields share one unit, seconds, but their base depends on the
/// clock mode at the instant they were written: seconds since boot before
/// synchronization, epoch seconds after. `next_on_time == 0` means
/// "uninitialized, compute from now on the next tick"; `off_time == 0`
/// means "no timed cycle running".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "default_duration")]
    pub duration: u64,
    #[serde(rename = "next_on", default = "default_next_on")]
    pub next_on_time: u64,
    #[serde(default)]
    pub off_time: u64,
    #[serde(default)]
    pub is_on: bool,
}

fn default_interval() -> u64 {
    ScheduleDefaults::default().interval_secs
}

fn default_duration() -> u64 {
    ScheduleDefaults::default().duration_secs
}

fn default_next_on() -> u64 {
    ScheduleDefaults::default().turn_on_epoch
}

impl Schedule {
    /// Schedule used when the store holds nothing: compiled-in cadence and
    /// the factory-provisioned first activation epoch.
    pub fn first_boot(defaults: &ScheduleDefaults) -> Self {
        Self {
            interval: defaults.interval_secs,
            duration: defaults.duration_secs,
            next_on_time: defaults.turn_on_epoch,
            off_time: 0,
            is_on: false,
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::first_boot(&ScheduleDefaults::default())
    }
}

/// Side effects the runtime must carry out after an engine call, in order.
/// `Persist` appears at most once, last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    EnergizeRelay,
    DeenergizeRelay,
    /// Publish the literal `"ON"`/`"OFF"` acknowledgment, best-effort.
    Ack(OutputState),
    /// Write the schedule to the persistent store, best-effort.
    Persist,
}

/// The scheduling state machine. Owns the [`Schedule`]; every mutation goes
/// through this API, and every mutating call ends with a `Persist` action.
///
/// None of these operations can fail: inputs are pre-validated integers and
/// persistence failures are absorbed by the runtime, so the in-memory state
/// stays authoritative until the next successful write.
#[derive(Debug, Clone)]
pub struct ScheduleEngine {
    schedule: Schedule,
    defaults: ScheduleDefaults,
}

impl ScheduleEngine {
    pub fn new(schedule: Schedule, defaults: ScheduleDefaults) -> Self {
        Self { schedule, defaults }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn is_on(&self) -> bool {
        self.schedule.is_on
    }

    /// Startup reconciliation, run once before the first tick.
    ///
    /// Converts the factory sentinel activation epoch into a usable time for
    /// the current clock mode, recovers from activations missed while
    /// powered off, and restores the physical output to match the persisted
    /// state (hardware always comes up de-energized).
    pub fn boot(&mut self, now: TimeReading) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let mut dirty = false;

        self.convert_sentinel(now);
        dirty |= self.reconcile_inner(now, &mut actions);

        if self.schedule.is_on && self.schedule.off_time > 0 {
            if now.seconds() < self.schedule.off_time {
                // Cycle still running; re-energize to match software state.
                actions.push(EngineAction::EnergizeRelay);
            } else {
                // Cycle ended while powered off.
                self.schedule.is_on = false;
                self.schedule.off_time = 0;
                actions.push(EngineAction::DeenergizeRelay);
                dirty = true;
            }
        }

        if dirty {
            actions.push(EngineAction::Persist);
        }
        actions
    }

    /// One control tick: lazy initialization, missed-schedule recovery,
    /// then the timed transitions.
    pub fn tick(&mut self, now: TimeReading) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let mut dirty = false;
        let now_secs = now.seconds();

        // A schedule configured while the clock was unsynchronized has
        // next_on_time == 0; anchor it to the first tick that sees a clock
        // reading. Never energizes on its own.
        if self.schedule.interval > 0 && self.schedule.next_on_time == 0 {
            self.schedule.next_on_time = now_secs + self.schedule.interval;
        }

        dirty |= self.reconcile_inner(now, &mut actions);

        if !self.schedule.is_on
            && self.schedule.next_on_time > 0
            && now_secs >= self.schedule.next_on_time
        {
            // Chain the next cycle after this one ends, not after it starts.
            self.schedule.is_on = true;
            self.schedule.off_time = now_secs + self.schedule.duration;
            self.schedule.next_on_time = now_secs + self.schedule.duration + self.schedule.interval;
            actions.push(EngineAction::EnergizeRelay);
            actions.push(EngineAction::Ack(OutputState::On));
            dirty = true;
        }

        if self.schedule.is_on && self.schedule.off_time > 0 && now_secs >= self.schedule.off_time {
            self.schedule.is_on = false;
            self.schedule.off_time = 0;
            actions.push(EngineAction::DeenergizeRelay);
            actions.push(EngineAction::Ack(OutputState::Off));
            dirty = true;
        }

        if dirty {
            actions.push(EngineAction::Persist);
        }
        actions
    }

    /// Recover from a scheduled activation whose window has already passed.
    ///
    /// Idle schedules are re-anchored to `now + interval` rather than
    /// retroactively energized, so a long outage never causes a surprise
    /// activation at the wrong time of day. An active cycle whose off-time
    /// was also missed is forced off and re-anchored. Idempotent for a
    /// fixed `now`.
    pub fn reconcile_missed(&mut self, now: TimeReading) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        if self.reconcile_inner(now, &mut actions) {
            actions.push(EngineAction::Persist);
        }
        actions
    }

    /// Apply a decoded command intent (the dispatcher path).
    pub fn apply(&mut self, command: Command, now: TimeReading) -> Vec<EngineAction> {
        match command {
            Command::Reconfigure {
                interval,
                duration,
                turn_on_at,
            } => self.reconfigure(interval, duration, turn_on_at, now),
            Command::SetOutput { on } => self.set_output(on),
        }
    }

    fn reconcile_inner(&mut self, now: TimeReading, actions: &mut Vec<EngineAction>) -> bool {
        if self.schedule.interval == 0 || self.schedule.next_on_time == 0 {
            return false;
        }

        let now_secs = now.seconds();
        if now_secs <= self.schedule.next_on_time {
            return false;
        }

        if !self.schedule.is_on {
            self.schedule.next_on_time = now_secs + self.schedule.interval;
            return true;
        }

        if self.schedule.off_time > 0 && now_secs >= self.schedule.off_time {
            self.schedule.is_on = false;
            self.schedule.off_time = 0;
            self.schedule.next_on_time = now_secs + self.schedule.interval;
            actions.push(EngineAction::DeenergizeRelay);
            return true;
        }

        false
    }

    // Boot-time only: a stored next_on_time equal to the factory sentinel
    // epoch is meaningless before synchronization and stale once the epoch
    // has passed; both cases re-anchor to now + interval. A synchronized
    // clock still short of the sentinel leaves it in place so the schedule
    // fires when the clock catches up.
    fn convert_sentinel(&mut self, now: TimeReading) {
        if self.schedule.next_on_time != self.defaults.turn_on_epoch {
            return;
        }

        match now {
            TimeReading::Relative(secs) => {
                self.schedule.next_on_time = secs + self.schedule.interval;
            }
            TimeReading::Absolute(epoch) if epoch > self.defaults.turn_on_epoch => {
                self.schedule.next_on_time = epoch + self.schedule.interval;
            }
            TimeReading::Absolute(_) => {}
        }
    }

    // Manual override: forced transition outside the timer path. Clearing
    // off_time on manual ON means it never auto-expires; the recurring
    // schedule itself is left untouched.
    fn set_output(&mut self, on: bool) -> Vec<EngineAction> {
        self.schedule.is_on = on;
        self.schedule.off_time = 0;

        let relay = if on {
            EngineAction::EnergizeRelay
        } else {
            EngineAction::DeenergizeRelay
        };
        vec![
            relay,
            EngineAction::Ack(OutputState::from_bool(on)),
            EngineAction::Persist,
        ]
    }

    fn reconfigure(
        &mut self,
        interval: u64,
        duration: u64,
        turn_on_at: Option<u64>,
        now: TimeReading,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        self.schedule.interval = interval;
        self.schedule.duration = duration;
        self.schedule.next_on_time = match now {
            // Defer scheduling until a synchronized clock tick is observed.
            TimeReading::Relative(_) => 0,
            TimeReading::Absolute(epoch) => turn_on_at
                .filter(|&at| at > 0)
                .unwrap_or(epoch + interval),
        };

        if self.schedule.is_on {
            actions.push(EngineAction::DeenergizeRelay);
        }
        self.schedule.is_on = false;
        self.schedule.off_time = 0;

        actions.push(EngineAction::Persist);
        actions
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn engine(schedule: Schedule) -> ScheduleEngine {
        ScheduleEngine::new(schedule, ScheduleDefaults::default())
    }

    fn idle_schedule(interval: u64, duration: u64, next_on_time: u64) -> Schedule {
        Schedule {
            interval,
            duration,
            next_on_time,
            off_time: 0,
            is_on: false,
        }
    }

    #[test]
    fn activation_chains_next_cycle_after_this_one_ends() {
        let mut engine = engine(idle_schedule(3_600, 30, 1_000));

        let actions = engine.tick(TimeReading::Absolute(1_000));

        assert_eq!(
            actions,
            vec![
                EngineAction::EnergizeRelay,
                EngineAction::Ack(OutputState::On),
                EngineAction::Persist,
            ]
        );
        assert!(engine.is_on());
        assert_eq!(engine.schedule().off_time, 1_030);
        assert_eq!(engine.schedule().next_on_time, 1_000 + 30 + 3_600);
    }

    #[test]
    fn deactivation_fires_at_off_time() {
        let mut engine = engine(idle_schedule(3_600, 30, 1_000));
        let _ = engine.tick(TimeReading::Absolute(1_000));

        let actions = engine.tick(TimeReading::Absolute(1_030));

        assert_eq!(
            actions,
            vec![
                EngineAction::DeenergizeRelay,
                EngineAction::Ack(OutputState::Off),
                EngineAction::Persist,
            ]
        );
        assert!(!engine.is_on());
        assert_eq!(engine.schedule().off_time, 0);
        assert_eq!(engine.schedule().next_on_time, 4_630);
    }

    #[test]
    fn missed_activation_reanchors_without_energizing() {
        let mut engine = engine(idle_schedule(3_600, 30, 1_000));

        let actions = engine.reconcile_missed(TimeReading::Absolute(5_000));

        assert_eq!(actions, vec![EngineAction::Persist]);
        assert!(!engine.is_on());
        assert_eq!(engine.schedule().next_on_time, 8_600);
    }

    #[test]
    fn missed_off_time_forces_idle_and_reanchors() {
        let mut engine = engine(Schedule {
            interval: 3_600,
            duration: 30,
            next_on_time: 4_600,
            off_time: 1_000,
            is_on: true,
        });

        let actions = engine.reconcile_missed(TimeReading::Absolute(5_000));

        assert_eq!(
            actions,
            vec![EngineAction::DeenergizeRelay, EngineAction::Persist]
        );
        assert!(!engine.is_on());
        assert_eq!(engine.schedule().off_time, 0);
        assert_eq!(engine.schedule().next_on_time, 8_600);
    }

    #[test]
    fn reconciliation_is_idempotent_for_a_fixed_now() {
        let mut engine = engine(idle_schedule(3_600, 30, 1_000));
        let now = TimeReading::Absolute(5_000);

        let first = engine.reconcile_missed(now);
        let state_after_first = engine.schedule().clone();
        let second = engine.reconcile_missed(now);

        assert_eq!(first, vec![EngineAction::Persist]);
        assert_eq!(second, Vec::new());
        assert_eq!(engine.schedule(), &state_after_first);
    }

    #[test]
    fn uninitialized_schedule_self_anchors_without_energizing() {
        let mut engine = engine(idle_schedule(3_600, 30, 0));

        let actions = engine.tick(TimeReading::Relative(50));

        assert_eq!(actions, Vec::new());
        assert!(!engine.is_on());
        assert_eq!(engine.schedule().next_on_time, 3_650);
    }

    #[test]
    fn clock_mode_flip_reanchors_relative_schedule() {
        // next_on_time was written in relative seconds; synchronization
        // makes the reading jump to epoch scale.
        let mut engine = engine(idle_schedule(3_600, 30, 3_650));

        let actions = engine.tick(TimeReading::Absolute(1_800_000_000));

        assert_eq!(actions, vec![EngineAction::Persist]);
        assert!(!engine.is_on());
        assert_eq!(engine.schedule().next_on_time, 1_800_003_600);
    }

    #[test]
    fn manual_on_never_auto_expires() {
        let mut engine = engine(idle_schedule(3_600, 30, 10_000));

        let actions = engine.apply(Command::SetOutput { on: true }, TimeReading::Absolute(1_000));

        assert_eq!(
            actions,
            vec![
                EngineAction::EnergizeRelay,
                EngineAction::Ack(OutputState::On),
                EngineAction::Persist,
            ]
        );
        assert!(engine.is_on());
        assert_eq!(engine.schedule().off_time, 0);

        // No off_time, so ticks inside the schedule window change nothing.
        let actions = engine.tick(TimeReading::Absolute(2_000));
        assert_eq!(actions, Vec::new());
        assert!(engine.is_on());
    }

    #[test]
    fn manual_off_clears_running_cycle() {
        let mut engine = engine(idle_schedule(3_600, 30, 1_000));
        let _ = engine.tick(TimeReading::Absolute(1_000));

        let actions = engine.apply(Command::SetOutput { on: false }, TimeReading::Absolute(1_010));

        assert_eq!(
            actions,
            vec![
                EngineAction::DeenergizeRelay,
                EngineAction::Ack(OutputState::Off),
                EngineAction::Persist,
            ]
        );
        assert!(!engine.is_on());
        assert_eq!(engine.schedule().off_time, 0);
    }

    #[test]
    fn reconfigure_with_synced_clock_schedules_now_plus_interval() {
        let mut engine = engine(idle_schedule(3_600, 30, 9_999));

        let command = Command::Reconfigure {
            interval: 7_200,
            duration: 60,
            turn_on_at: None,
        };
        let actions = engine.apply(command, TimeReading::Absolute(100_000));

        assert_eq!(actions, vec![EngineAction::Persist]);
        assert_eq!(engine.schedule().interval, 7_200);
        assert_eq!(engine.schedule().duration, 60);
        assert_eq!(engine.schedule().next_on_time, 107_200);
        assert_eq!(engine.schedule().off_time, 0);
        assert!(!engine.is_on());
    }

    #[test]
    fn reconfigure_honors_explicit_turn_on_epoch() {
        let mut engine = engine(idle_schedule(3_600, 30, 0));

        let command = Command::Reconfigure {
            interval: 3_600,
            duration: 30,
            turn_on_at: Some(1_708_532_400),
        };
        let _ = engine.apply(command, TimeReading::Absolute(1_700_000_000));

        assert_eq!(engine.schedule().next_on_time, 1_708_532_400);
    }

    #[test]
    fn reconfigure_before_sync_defers_scheduling() {
        let mut engine = engine(idle_schedule(3_600, 30, 4_242));

        let command = Command::Reconfigure {
            interval: 1_800,
            duration: 45,
            turn_on_at: Some(1_708_532_400),
        };
        let actions = engine.apply(command, TimeReading::Relative(120));

        assert_eq!(actions, vec![EngineAction::Persist]);
        assert_eq!(engine.schedule().next_on_time, 0);

        // The next tick anchors the deferred schedule.
        let _ = engine.tick(TimeReading::Relative(130));
        assert_eq!(engine.schedule().next_on_time, 130 + 1_800);
    }

    #[test]
    fn reconfigure_while_energized_turns_output_off() {
        let mut engine = engine(idle_schedule(3_600, 30, 1_000));
        let _ = engine.apply(Command::SetOutput { on: true }, TimeReading::Absolute(500));

        let command = Command::Reconfigure {
            interval: 3_600,
            duration: 30,
            turn_on_at: None,
        };
        let actions = engine.apply(command, TimeReading::Absolute(600));

        assert_eq!(
            actions,
            vec![EngineAction::DeenergizeRelay, EngineAction::Persist]
        );
        assert!(!engine.is_on());
    }

    #[test]
    fn boot_converts_sentinel_for_unsynchronized_clock() {
        let defaults = ScheduleDefaults::default();
        let mut engine = ScheduleEngine::new(Schedule::first_boot(&defaults), defaults);

        let actions = engine.boot(TimeReading::Relative(12));

        assert_eq!(actions, Vec::new());
        assert_eq!(engine.schedule().next_on_time, 12 + defaults.interval_secs);
    }

    #[test]
    fn boot_reanchors_sentinel_once_its_epoch_has_passed() {
        let defaults = ScheduleDefaults::default();
        let mut engine = ScheduleEngine::new(Schedule::first_boot(&defaults), defaults);
        let now = defaults.turn_on_epoch + 500;

        let _ = engine.boot(TimeReading::Absolute(now));

        assert_eq!(
            engine.schedule().next_on_time,
            now + defaults.interval_secs
        );
    }

    #[test]
    fn boot_keeps_future_sentinel_for_synchronized_clock() {
        let defaults = ScheduleDefaults::default();
        let mut engine = ScheduleEngine::new(Schedule::first_boot(&defaults), defaults);

        let actions = engine.boot(TimeReading::Absolute(defaults.turn_on_epoch - 500));

        assert_eq!(actions, Vec::new());
        assert_eq!(engine.schedule().next_on_time, defaults.turn_on_epoch);
    }

    #[test]
    fn boot_restores_output_mid_cycle() {
        let mut engine = engine(Schedule {
            interval: 3_600,
            duration: 300,
            next_on_time: 10_000,
            off_time: 2_000,
            is_on: true,
        });

        let actions = engine.boot(TimeReading::Absolute(1_500));

        assert_eq!(actions, vec![EngineAction::EnergizeRelay]);
        assert!(engine.is_on());
        assert_eq!(engine.schedule().off_time, 2_000);
    }

    #[test]
    fn boot_forces_idle_when_cycle_ended_while_powered_off() {
        let mut engine = engine(Schedule {
            interval: 3_600,
            duration: 300,
            next_on_time: 10_000,
            off_time: 2_000,
            is_on: true,
        });

        let actions = engine.boot(TimeReading::Absolute(2_500));

        assert_eq!(
            actions,
            vec![EngineAction::DeenergizeRelay, EngineAction::Persist]
        );
        assert!(!engine.is_on());
        assert_eq!(engine.schedule().off_time, 0);
        // Not yet past next_on_time, so the anchor is untouched.
        assert_eq!(engine.schedule().next_on_time, 10_000);
    }

    #[test]
    fn schedule_round_trips_through_store_format() {
        let schedule = Schedule {
            interval: 7_200,
            duration: 90,
            next_on_time: 1_708_532_400,
            off_time: 1_708_532_490,
            is_on: true,
        };

        let raw = serde_json::to_string(&schedule).unwrap();
        assert!(raw.contains("\"next_on\""));

        let restored: Schedule = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored, schedule);
    }

    #[test]
    fn missing_store_keys_fall_back_to_compiled_defaults() {
        let defaults = ScheduleDefaults::default();

        let restored: Schedule = serde_json::from_str("{}").unwrap();

        assert_eq!(restored.interval, defaults.interval_secs);
        assert_eq!(restored.duration, defaults.duration_secs);
        assert_eq!(restored.next_on_time, defaults.turn_on_epoch);
        assert_eq!(restored.off_time, 0);
        assert!(!restored.is_on);
    }
}
