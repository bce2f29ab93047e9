//! Critique-refine loop as an explicit state machine.
//!
//! `Draft → Critique → Refine → Critique … → Done | MaxRoundsReached`.
//! The machine only tracks state; the synthesizer performs the generator calls
//! and feeds the results back as events.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefineState {
    Draft,
    Critique,
    Refine,
    Done,
    MaxRoundsReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefineEvent {
    Drafted,
    Critiqued { issues: Vec<String> },
    Refined,
    /// The pending step failed; the latest good draft stands.
    Failed,
}

#[derive(Debug, Clone)]
pub struct RefineMachine {
    state: RefineState,
    round: u32,
    max_rounds: u32,
    issues: Vec<String>,
    aborted: bool,
}

impl RefineMachine {
    pub fn new(max_rounds: u32) -> Self {
        Self {
            state: RefineState::Draft,
            round: 0,
            max_rounds,
            issues: Vec::new(),
            aborted: false,
        }
    }

    pub fn state(&self) -> RefineState {
        self.state
    }

    /// Completed refine rounds.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Issues from the latest critique, to be addressed by the next refine.
    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    /// True when the loop ended because a step failed.
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RefineState::Done | RefineState::MaxRoundsReached)
    }

    /// Apply one event. Events that do not fit the current state are ignored.
    pub fn handle(&mut self, event: RefineEvent) -> RefineState {
        use RefineEvent as E;
        use RefineState as S;

        self.state = match (self.state, event) {
            (S::Done | S::MaxRoundsReached, _) => self.state,
            (_, E::Failed) => {
                self.aborted = true;
                S::Done
            }
            (S::Draft, E::Drafted) if self.max_rounds == 0 => S::Done,
            (S::Draft, E::Drafted) => S::Critique,
            (S::Critique, E::Critiqued { issues }) if issues.is_empty() => {
                self.issues.clear();
                S::Done
            }
            (S::Critique, E::Critiqued { issues }) => {
                self.issues = issues;
                if self.round >= self.max_rounds {
                    S::MaxRoundsReached
                } else {
                    S::Refine
                }
            }
            (S::Refine, E::Refined) => {
                self.round += 1;
                S::Critique
            }
            (state, _) => state,
        };
        self.state
    }
}
