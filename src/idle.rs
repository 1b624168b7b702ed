//! The inactivity ladder: Awake, Drowsy, Asleep.
//!
//! A recurring timer armed at half the configured threshold walks the
//! ladder one stage per tick, so the full threshold elapses before the
//! panel blanks. Any genuine input activity restarts the ladder from
//! Awake; remote screen commands jump straight to either end. The machine
//! itself only decides; the requested side effects are returned as
//! [`Effect`]s and applied by the caller, which keeps every transition
//! checkable without hardware or a running timer.

use std::time::Duration;

use serde::Serialize;

use crate::remote::ScreenCommand;

pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    Awake,
    Drowsy,
    Asleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// The state changed; report it.
    Announce(IdleState),
    PowerOn,
    PowerOff,
    /// Stop forwarding input; sources keep reporting their last state.
    RouteAllIdle,
    RouteAllNormal,
    /// Restore forwarding, but keep swallowing the waking touch until it
    /// is released.
    RouteWakerOnRelease,
    RearmTimer,
    CancelTimer,
}

#[derive(Debug)]
pub struct IdleMachine {
    state: IdleState,
    timeout: Duration,
}

impl IdleMachine {
    pub fn new(timeout: Duration) -> Self {
        let timeout = timeout.clamp(MIN_IDLE_TIMEOUT, MAX_IDLE_TIMEOUT);
        Self {
            state: IdleState::Awake,
            timeout,
        }
    }

    pub fn state(&self) -> IdleState {
        self.state
    }

    /// The ladder advances one stage per tick of this interval.
    pub fn tick_interval(&self) -> Duration {
        self.timeout / 2
    }

    pub fn on_tick(&mut self) -> Vec<Effect> {
        match self.state {
            IdleState::Awake => {
                self.state = IdleState::Drowsy;
                vec![Effect::Announce(IdleState::Drowsy), Effect::RearmTimer]
            }
            IdleState::Drowsy => {
                self.state = IdleState::Asleep;
                vec![
                    Effect::Announce(IdleState::Asleep),
                    Effect::PowerOff,
                    Effect::RouteAllIdle,
                ]
            }
            // The timer is not re-armed past Asleep; a stray tick is a
            // no-op.
            IdleState::Asleep => Vec::new(),
        }
    }

    /// A genuine input event arrived. `touch` selects the deferred
    /// wake-release path so the waking tap cannot activate a widget.
    pub fn on_activity(&mut self, touch: bool) -> Vec<Effect> {
        match self.state {
            IdleState::Awake => vec![Effect::RearmTimer],
            IdleState::Drowsy => {
                self.state = IdleState::Awake;
                vec![Effect::Announce(IdleState::Awake), Effect::RearmTimer]
            }
            IdleState::Asleep => {
                self.state = IdleState::Awake;
                let routing = if touch {
                    Effect::RouteWakerOnRelease
                } else {
                    Effect::RouteAllNormal
                };
                vec![
                    Effect::Announce(IdleState::Awake),
                    Effect::PowerOn,
                    routing,
                    Effect::RearmTimer,
                ]
            }
        }
    }

    /// An external screen command bypasses the ladder entirely.
    pub fn on_command(&mut self, command: ScreenCommand) -> Vec<Effect> {
        let wake = match command {
            ScreenCommand::On => true,
            ScreenCommand::Off => false,
            ScreenCommand::Toggle => self.state == IdleState::Asleep,
        };

        if wake {
            match self.state {
                IdleState::Awake => vec![Effect::RearmTimer],
                IdleState::Drowsy => {
                    self.state = IdleState::Awake;
                    vec![Effect::Announce(IdleState::Awake), Effect::RearmTimer]
                }
                IdleState::Asleep => {
                    self.state = IdleState::Awake;
                    vec![
                        Effect::Announce(IdleState::Awake),
                        Effect::PowerOn,
                        Effect::RouteAllNormal,
                        Effect::RearmTimer,
                    ]
                }
            }
        } else {
            match self.state {
                IdleState::Asleep => Vec::new(),
                _ => {
                    self.state = IdleState::Asleep;
                    vec![
                        Effect::Announce(IdleState::Asleep),
                        Effect::CancelTimer,
                        Effect::PowerOff,
                        Effect::RouteAllIdle,
                    ]
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;
    use proptest::prelude::*;

    use super::{Effect, IdleMachine, IdleState, MAX_IDLE_TIMEOUT, MIN_IDLE_TIMEOUT};
    use crate::remote::ScreenCommand;
    use std::time::Duration;

    fn machine() -> IdleMachine {
        IdleMachine::new(Duration::from_secs(300))
    }

    #[test]
    fn timeout_is_clamped() {
        assert_eq!(
            IdleMachine::new(Duration::from_secs(1)).tick_interval(),
            MIN_IDLE_TIMEOUT / 2,
        );
        assert_eq!(
            IdleMachine::new(Duration::from_secs(1_000_000)).tick_interval(),
            MAX_IDLE_TIMEOUT / 2,
        );
        assert_eq!(machine().tick_interval(), Duration::from_secs(150));
    }

    #[test]
    fn two_ticks_to_asleep() {
        let mut idle = machine();

        assert_debug_snapshot!(idle.on_tick(), @r"
        [
            Announce(
                Drowsy,
            ),
            RearmTimer,
        ]
        ");
        assert_eq!(idle.state(), IdleState::Drowsy);

        assert_debug_snapshot!(idle.on_tick(), @r"
        [
            Announce(
                Asleep,
            ),
            PowerOff,
            RouteAllIdle,
        ]
        ");
        assert_eq!(idle.state(), IdleState::Asleep);

        // A stray third tick changes nothing.
        assert!(idle.on_tick().is_empty());
    }

    #[test]
    fn activity_rearms_without_transition_while_awake() {
        let mut idle = machine();
        assert_eq!(idle.on_activity(false), vec![Effect::RearmTimer]);
        assert_eq!(idle.state(), IdleState::Awake);
    }

    #[test]
    fn activity_resets_from_drowsy() {
        let mut idle = machine();
        idle.on_tick();

        assert_eq!(
            idle.on_activity(false),
            vec![Effect::Announce(IdleState::Awake), Effect::RearmTimer],
        );
        assert_eq!(idle.state(), IdleState::Awake);
    }

    #[test]
    fn pointer_wake_restores_routing_immediately() {
        let mut idle = machine();
        idle.on_tick();
        idle.on_tick();

        assert_debug_snapshot!(idle.on_activity(false), @r"
        [
            Announce(
                Awake,
            ),
            PowerOn,
            RouteAllNormal,
            RearmTimer,
        ]
        ");
    }

    #[test]
    fn touch_wake_defers_routing_until_release() {
        let mut idle = machine();
        idle.on_tick();
        idle.on_tick();

        let effects = idle.on_activity(true);
        assert!(effects.contains(&Effect::PowerOn));
        assert!(effects.contains(&Effect::RouteWakerOnRelease));
        assert!(!effects.contains(&Effect::RouteAllNormal));
    }

    #[test]
    fn screen_off_cancels_the_timer() {
        let mut idle = machine();

        assert_debug_snapshot!(idle.on_command(ScreenCommand::Off), @r"
        [
            Announce(
                Asleep,
            ),
            CancelTimer,
            PowerOff,
            RouteAllIdle,
        ]
        ");
        assert_eq!(idle.state(), IdleState::Asleep);

        // Already asleep; a second off is a no-op.
        assert!(idle.on_command(ScreenCommand::Off).is_empty());
    }

    #[test]
    fn screen_toggle_flips_both_ways() {
        let mut idle = machine();

        idle.on_command(ScreenCommand::Toggle);
        assert_eq!(idle.state(), IdleState::Asleep);

        let effects = idle.on_command(ScreenCommand::Toggle);
        assert_eq!(idle.state(), IdleState::Awake);
        assert!(effects.contains(&Effect::PowerOn));
        assert!(effects.contains(&Effect::RouteAllNormal));
    }

    #[derive(Debug, Clone, Copy)]
    enum Input {
        Tick,
        Activity(bool),
        Command(ScreenCommand),
    }

    fn input() -> impl Strategy<Value = Input> {
        prop_oneof![
            Just(Input::Tick),
            any::<bool>().prop_map(Input::Activity),
            prop_oneof![
                Just(ScreenCommand::On),
                Just(ScreenCommand::Off),
                Just(ScreenCommand::Toggle),
            ]
            .prop_map(Input::Command),
        ]
    }

    proptest! {
        /// After any history, activity lands in Awake, and reaching Asleep
        /// from there takes exactly two ticks.
        #[test]
        fn activity_always_restarts_the_ladder(
            history in proptest::collection::vec(input(), 0..32),
            touch in any::<bool>(),
        ) {
            let mut idle = IdleMachine::new(Duration::from_secs(300));
            for input in history {
                match input {
                    Input::Tick => drop(idle.on_tick()),
                    Input::Activity(t) => drop(idle.on_activity(t)),
                    Input::Command(cmd) => drop(idle.on_command(cmd)),
                }
            }

            idle.on_activity(touch);
            prop_assert_eq!(idle.state(), IdleState::Awake);

            idle.on_tick();
            prop_assert_eq!(idle.state(), IdleState::Drowsy);
            idle.on_tick();
            prop_assert_eq!(idle.state(), IdleState::Asleep);
        }
    }
}
