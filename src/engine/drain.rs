//! End-of-input drain sequencing
//!
//! Decoders, filters and encoders are flushed strictly in that order and each
//! stage is pulled dry before the next one learns that input has ended.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TranscodeError, TranscodeResult};

/// Position of the drain sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    None,
    DecoderDraining,
    DecoderDrained,
    FilterDraining,
    FilterDrained,
    EncoderDraining,
    EncoderDrained,
}

impl DrainState {
    /// All states in the only order they may be visited
    pub const SEQUENCE: [DrainState; 7] = [
        DrainState::None,
        DrainState::DecoderDraining,
        DrainState::DecoderDrained,
        DrainState::FilterDraining,
        DrainState::FilterDrained,
        DrainState::EncoderDraining,
        DrainState::EncoderDrained,
    ];

    /// The only state that may follow this one
    pub fn successor(self) -> Option<DrainState> {
        match self {
            DrainState::None => Some(DrainState::DecoderDraining),
            DrainState::DecoderDraining => Some(DrainState::DecoderDrained),
            DrainState::DecoderDrained => Some(DrainState::FilterDraining),
            DrainState::FilterDraining => Some(DrainState::FilterDrained),
            DrainState::FilterDrained => Some(DrainState::EncoderDraining),
            DrainState::EncoderDraining => Some(DrainState::EncoderDrained),
            DrainState::EncoderDrained => None,
        }
    }

    pub fn can_transition_to(self, next: DrainState) -> bool {
        self.successor() == Some(next)
    }

    pub fn is_terminal(self) -> bool {
        self == DrainState::EncoderDrained
    }

    /// True once `phase` has been flushed and pulled dry
    pub fn has_drained(self, phase: DrainPhase) -> bool {
        self >= phase.drained()
    }

    /// True once `phase` has been told that input ended
    pub fn has_started(self, phase: DrainPhase) -> bool {
        self >= phase.draining()
    }
}

impl fmt::Display for DrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DrainState::None => "none",
            DrainState::DecoderDraining => "decoder_draining",
            DrainState::DecoderDrained => "decoder_drained",
            DrainState::FilterDraining => "filter_draining",
            DrainState::FilterDrained => "filter_drained",
            DrainState::EncoderDraining => "encoder_draining",
            DrainState::EncoderDrained => "encoder_drained",
        };
        f.write_str(name)
    }
}

/// Pipeline stage being drained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrainPhase {
    Decoder,
    Filter,
    Encoder,
}

impl DrainPhase {
    pub fn draining(self) -> DrainState {
        match self {
            DrainPhase::Decoder => DrainState::DecoderDraining,
            DrainPhase::Filter => DrainState::FilterDraining,
            DrainPhase::Encoder => DrainState::EncoderDraining,
        }
    }

    pub fn drained(self) -> DrainState {
        match self {
            DrainPhase::Decoder => DrainState::DecoderDrained,
            DrainPhase::Filter => DrainState::FilterDrained,
            DrainPhase::Encoder => DrainState::EncoderDrained,
        }
    }
}

/// When the decoder phase counts as exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecoderDrainPolicy {
    /// Poll until every decoder reports end of file
    #[default]
    FixedPoint,
    /// Stop after the first pass in which no decoder yields a frame
    SinglePass,
}

impl FromStr for DecoderDrainPolicy {
    type Err = TranscodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed-point" | "fixed_point" | "fixedpoint" => Ok(DecoderDrainPolicy::FixedPoint),
            "single-pass" | "single_pass" | "singlepass" => Ok(DecoderDrainPolicy::SinglePass),
            other => Err(TranscodeError::ConfigError {
                message: format!("Unknown decoder drain policy: {}", other),
            }),
        }
    }
}

/// Result of one pass over the endpoints of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Something came out; the caller processed it
    Yielded,
    /// No output, but some endpoint answered "try again"
    Pending,
    /// Every endpoint reported end of file
    Exhausted,
}

/// Drain state plus per-phase bookkeeping
#[derive(Debug, Clone)]
pub struct DrainMachine {
    state: DrainState,
    exhausted: BTreeSet<usize>,
    flushed: BTreeSet<usize>,
    idle_passes: u32,
    max_idle_passes: u32,
    policy: DecoderDrainPolicy,
}

impl DrainMachine {
    pub fn new(policy: DecoderDrainPolicy, max_idle_passes: u32) -> Self {
        Self {
            state: DrainState::None,
            exhausted: BTreeSet::new(),
            flushed: BTreeSet::new(),
            idle_passes: 0,
            max_idle_passes: max_idle_passes.max(1),
            policy,
        }
    }

    pub fn state(&self) -> DrainState {
        self.state
    }

    pub fn policy(&self) -> DecoderDrainPolicy {
        self.policy
    }

    /// Move to `next`, which must be the immediate successor
    pub fn advance(&mut self, next: DrainState) -> TranscodeResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(TranscodeError::InvalidDrainTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Drain state {} -> {}", self.state, next);
        self.state = next;
        self.exhausted.clear();
        self.flushed.clear();
        self.idle_passes = 0;
        Ok(())
    }

    /// Remember that an endpoint of the current phase reported end of file
    pub fn mark_exhausted(&mut self, endpoint: usize) {
        self.exhausted.insert(endpoint);
    }

    pub fn is_exhausted(&self, endpoint: usize) -> bool {
        self.exhausted.contains(&endpoint)
    }

    /// Remember that an endpoint accepted the end-of-stream signal
    pub fn mark_flushed(&mut self, endpoint: usize) {
        self.flushed.insert(endpoint);
    }

    pub fn is_flushed(&self, endpoint: usize) -> bool {
        self.flushed.contains(&endpoint)
    }

    /// Decide whether the current phase is over after a pass.
    ///
    /// Returns true when the phase should end: every endpoint is exhausted,
    /// the single-pass decoder policy applies, or too many consecutive
    /// passes produced nothing.
    pub fn phase_complete(&mut self, outcome: PassOutcome) -> bool {
        match outcome {
            PassOutcome::Yielded => {
                self.idle_passes = 0;
                false
            }
            PassOutcome::Exhausted => true,
            PassOutcome::Pending => {
                if self.state == DrainState::DecoderDraining && self.policy == DecoderDrainPolicy::SinglePass {
                    return true;
                }
                self.idle_passes += 1;
                self.idle_passes >= self.max_idle_passes
            }
        }
    }

    /// Consecutive passes without output in the current phase
    pub fn idle_passes(&self) -> u32 {
        self.idle_passes
    }

    pub fn reset(&mut self) {
        self.state = DrainState::None;
        self.exhausted.clear();
        self.flushed.clear();
        self.idle_passes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_follows_successors() {
        for pair in DrainState::SEQUENCE.windows(2) {
            assert_eq!(pair[0].successor(), Some(pair[1]));
            assert!(pair[0] < pair[1]);
        }
        assert!(DrainState::EncoderDrained.is_terminal());
        assert_eq!(DrainState::EncoderDrained.successor(), None);
    }

    #[test]
    fn test_only_immediate_successor_is_allowed() {
        let mut machine = DrainMachine::new(DecoderDrainPolicy::FixedPoint, 4);
        let skip = machine.advance(DrainState::FilterDraining);
        assert!(matches!(skip, Err(TranscodeError::InvalidDrainTransition { .. })));

        machine.advance(DrainState::DecoderDraining).unwrap();
        assert!(machine.advance(DrainState::DecoderDraining).is_err());
        assert!(machine.advance(DrainState::None).is_err());
        assert_eq!(machine.state(), DrainState::DecoderDraining);
    }

    #[test]
    fn test_later_phase_never_drained_before_earlier() {
        for state in DrainState::SEQUENCE {
            if state.has_started(DrainPhase::Filter) {
                assert!(state.has_drained(DrainPhase::Decoder));
            }
            if state.has_started(DrainPhase::Encoder) {
                assert!(state.has_drained(DrainPhase::Filter));
            }
        }
    }

    #[test]
    fn test_advance_clears_exhausted_endpoints() {
        let mut machine = DrainMachine::new(DecoderDrainPolicy::FixedPoint, 4);
        machine.advance(DrainState::DecoderDraining).unwrap();
        machine.mark_exhausted(2);
        assert!(machine.is_exhausted(2));
        machine.advance(DrainState::DecoderDrained).unwrap();
        assert!(!machine.is_exhausted(2));
    }

    #[test]
    fn test_flushed_endpoints_are_per_phase() {
        let mut machine = DrainMachine::new(DecoderDrainPolicy::FixedPoint, 4);
        machine.advance(DrainState::DecoderDraining).unwrap();
        machine.advance(DrainState::DecoderDrained).unwrap();
        machine.mark_flushed(1);
        assert!(machine.is_flushed(1));
        assert!(!machine.is_flushed(0));
        machine.advance(DrainState::FilterDraining).unwrap();
        assert!(!machine.is_flushed(1));
    }

    #[test]
    fn test_single_pass_policy_ends_decoder_phase_on_first_idle_pass() {
        let mut machine = DrainMachine::new(DecoderDrainPolicy::SinglePass, 8);
        machine.advance(DrainState::DecoderDraining).unwrap();
        assert!(!machine.phase_complete(PassOutcome::Yielded));
        assert!(machine.phase_complete(PassOutcome::Pending));
    }

    #[test]
    fn test_idle_bound_ends_a_stuck_phase() {
        let mut machine = DrainMachine::new(DecoderDrainPolicy::FixedPoint, 3);
        machine.advance(DrainState::DecoderDraining).unwrap();
        assert!(!machine.phase_complete(PassOutcome::Pending));
        assert!(!machine.phase_complete(PassOutcome::Pending));
        assert!(!machine.phase_complete(PassOutcome::Yielded));
        assert_eq!(machine.idle_passes(), 0);
        assert!(!machine.phase_complete(PassOutcome::Pending));
        assert!(!machine.phase_complete(PassOutcome::Pending));
        assert!(machine.phase_complete(PassOutcome::Pending));
        assert!(machine.phase_complete(PassOutcome::Exhausted));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("single-pass".parse::<DecoderDrainPolicy>().unwrap(), DecoderDrainPolicy::SinglePass);
        assert_eq!("FIXED_POINT".parse::<DecoderDrainPolicy>().unwrap(), DecoderDrainPolicy::FixedPoint);
        assert!("sometimes".parse::<DecoderDrainPolicy>().is_err());
    }
}
