//! Stop conditions evaluated after every generated token.

use crate::decoder::DecodedToken;

/// Stateless predicate over the tokens generated so far, newest last.
pub trait StopCondition: Send + Sync {
    fn should_stop(&self, history: &[DecodedToken]) -> bool;
}

/// Stops once the newest token is the end-of-sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EosTokenStop {
    pub eos_token_id: u32,
}

impl EosTokenStop {
    pub fn new(eos_token_id: u32) -> Self {
        Self { eos_token_id }
    }
}

impl StopCondition for EosTokenStop {
    fn should_stop(&self, history: &[DecodedToken]) -> bool {
        history
            .last()
            .and_then(|token| token.id)
            .map(|id| id == self.eos_token_id)
            .unwrap_or(false)
    }
}

/// Never fires; generation ends only on the token cap or decoder exhaustion.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl StopCondition for NeverStop {
    fn should_stop(&self, _history: &[DecodedToken]) -> bool {
        false
    }
}
