//! Ordering rules for atomic submissions.
//!
//! `PresentState` is the bookkeeping behind the transaction engine: at most
//! one atomic commit may be outstanding per output, the very first
//! successful commit must carry the modeset, and nothing is submitted while
//! the output is powered off. The hardware-facing request building lives in
//! the parent module; everything here is plain state so the rules can be
//! exercised without a device.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommitError {
    /// A transaction is already outstanding; its completion has to be
    /// observed before the next submission.
    #[error("a transaction is already outstanding")]
    Busy,
    /// The hardware does not expose a property the request needs.
    #[error("required property {0} is missing")]
    MissingProperty(&'static str),
    /// The kernel rejected the commit; the frame is dropped.
    #[error("atomic commit rejected")]
    Rejected(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum PowerError {
    /// The connector has no power-state property. Not an error condition;
    /// the output simply never blanks.
    #[error("power control is not supported by this output")]
    Unsupported,
    #[error("error setting the power property")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPlan {
    /// Build and submit an atomic request.
    Submit { modeset: bool },
    /// The output is powered off; record the frame and release the
    /// producer without touching the hardware.
    SkipPoweredOff,
}

#[derive(Debug)]
pub struct PresentState {
    in_flight: Option<usize>,
    needs_modeset: bool,
    powered: bool,
    last_presented: Option<usize>,
}

impl PresentState {
    pub fn new() -> Self {
        Self {
            in_flight: None,
            needs_modeset: true,
            powered: true,
            last_presented: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn powered(&self) -> bool {
        self.powered
    }

    /// The buffer the producer should draw into next. While a transaction
    /// is outstanding this is always the other buffer of the pair.
    pub fn back_buffer(&self) -> usize {
        match self.last_presented {
            Some(index) => index ^ 1,
            None => 0,
        }
    }

    /// Starts a flush of `index`. The frame becomes the current content
    /// even when the output is off, so that powering back on shows it.
    pub fn begin_flush(&mut self, index: usize) -> Result<FlushPlan, CommitError> {
        if self.in_flight.is_some() {
            return Err(CommitError::Busy);
        }

        self.last_presented = Some(index);

        if !self.powered {
            return Ok(FlushPlan::SkipPoweredOff);
        }

        Ok(FlushPlan::Submit {
            modeset: self.needs_modeset,
        })
    }

    /// The commit was accepted; exactly one transaction is now in flight.
    /// Only now is the first-submission modeset consumed.
    pub fn submitted(&mut self, index: usize) {
        debug_assert!(self.in_flight.is_none());
        self.in_flight = Some(index);
        self.needs_modeset = false;
    }

    /// The commit was rejected. Nothing is outstanding and the next attempt
    /// retries the modeset if it was still pending.
    pub fn submit_failed(&mut self) {
        self.in_flight = None;
    }

    /// A completion event arrived; frees the one outstanding transaction.
    pub fn completed(&mut self) -> Option<usize> {
        self.in_flight.take()
    }

    pub fn power_off(&mut self) {
        self.powered = false;
    }

    /// Returns the buffer to resubmit so the output shows current content
    /// instead of whatever the hardware last scanned out.
    pub fn power_on(&mut self) -> Option<usize> {
        self.powered = true;
        self.last_presented
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{CommitError, FlushPlan, PresentState};

    #[test]
    fn first_submission_carries_modeset() {
        let mut state = PresentState::new();

        let plan = state.begin_flush(0).unwrap();
        assert_eq!(plan, FlushPlan::Submit { modeset: true });
        state.submitted(0);
        assert_eq!(state.completed(), Some(0));

        let plan = state.begin_flush(1).unwrap();
        assert_eq!(plan, FlushPlan::Submit { modeset: false });
    }

    #[test]
    fn rejected_commit_retries_modeset() {
        let mut state = PresentState::new();

        assert_eq!(
            state.begin_flush(0).unwrap(),
            FlushPlan::Submit { modeset: true }
        );
        state.submit_failed();

        // The flag was not consumed; the next attempt modesets again.
        assert_eq!(
            state.begin_flush(1).unwrap(),
            FlushPlan::Submit { modeset: true }
        );
        assert!(!state.is_busy());
    }

    #[test]
    fn refuses_second_submission_while_outstanding() {
        let mut state = PresentState::new();

        state.begin_flush(0).unwrap();
        state.submitted(0);
        assert!(matches!(state.begin_flush(1), Err(CommitError::Busy)));

        state.completed();
        assert!(state.begin_flush(1).is_ok());
    }

    #[test]
    fn completion_frees_exactly_one_transaction() {
        let mut state = PresentState::new();

        state.begin_flush(0).unwrap();
        state.submitted(0);
        assert_eq!(state.completed(), Some(0));
        assert_eq!(state.completed(), None);
    }

    #[test]
    fn back_buffer_alternates() {
        let mut state = PresentState::new();
        assert_eq!(state.back_buffer(), 0);

        state.begin_flush(0).unwrap();
        state.submitted(0);
        // Buffer 0 is in flight; the producer gets the other one.
        assert_eq!(state.back_buffer(), 1);

        state.completed();
        state.begin_flush(1).unwrap();
        state.submitted(1);
        assert_eq!(state.back_buffer(), 0);
    }

    #[test]
    fn power_off_does_not_cancel_outstanding_transaction() {
        let mut state = PresentState::new();

        state.begin_flush(0).unwrap();
        state.submitted(0);
        state.power_off();

        // The flip completes normally.
        assert_eq!(state.completed(), Some(0));

        // Flushes are recorded but nothing is submitted while off.
        assert_eq!(state.begin_flush(1).unwrap(), FlushPlan::SkipPoweredOff);
        assert_eq!(state.begin_flush(0).unwrap(), FlushPlan::SkipPoweredOff);

        // Powering back on resubmits the latest content exactly once.
        assert_eq!(state.power_on(), Some(0));
        assert_eq!(
            state.begin_flush(0).unwrap(),
            FlushPlan::Submit { modeset: false }
        );
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Flush(usize),
        CommitOk,
        CommitFail,
        Complete,
        PowerOff,
        PowerOn,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..2).prop_map(Op::Flush),
            Just(Op::CommitOk),
            Just(Op::CommitFail),
            Just(Op::Complete),
            Just(Op::PowerOff),
            Just(Op::PowerOn),
        ]
    }

    proptest! {
        /// Drives arbitrary interleavings through the state machine and
        /// checks the ordering rules the hardware path relies on: never two
        /// outstanding transactions, the modeset appears on the first
        /// accepted commit and never again, and nothing is submitted while
        /// powered off.
        #[test]
        fn interleavings_preserve_invariants(ops in proptest::collection::vec(op(), 1..64)) {
            let mut state = PresentState::new();
            let mut pending_plan = None;
            let mut outstanding = 0usize;
            let mut modesets_accepted = 0usize;

            for op in ops {
                match op {
                    Op::Flush(index) => match state.begin_flush(index) {
                        Ok(plan) => {
                            prop_assert_eq!(outstanding, 0);
                            if let FlushPlan::Submit { .. } = plan {
                                prop_assert!(state.powered());
                                pending_plan = Some(plan);
                            }
                        }
                        Err(CommitError::Busy) => prop_assert_eq!(outstanding, 1),
                        Err(_) => prop_assert!(false),
                    },
                    Op::CommitOk => {
                        if let Some(FlushPlan::Submit { modeset }) = pending_plan.take() {
                            if modeset {
                                modesets_accepted += 1;
                            }
                            state.submitted(0);
                            outstanding += 1;
                        }
                    }
                    Op::CommitFail => {
                        if pending_plan.take().is_some() {
                            state.submit_failed();
                        }
                    }
                    Op::Complete => {
                        if state.completed().is_some() {
                            outstanding -= 1;
                        }
                    }
                    Op::PowerOff => state.power_off(),
                    Op::PowerOn => {
                        state.power_on();
                    }
                }

                prop_assert!(outstanding <= 1);
                prop_assert_eq!(state.is_busy(), outstanding == 1);
                prop_assert!(modesets_accepted <= 1);
            }
        }
    }
}
