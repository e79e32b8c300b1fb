//! Host callbacks.
//!
//! The interpreter calls these at fixed points: choices, randomness and
//! offers while computing a step it submits, `on_timeout` whenever a timeout
//! step is observed, `on_outcome` once when the protocol halts.

use tandem_digest::Value;

/// A host could not or would not answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The host refuses; the participant does not submit this step.
    #[error("declined: {0}")]
    Declined(String),
    /// The host has no answer for this request.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Participant-supplied behaviour.
pub trait Interact {
    /// A named choice (wager, hand, …).
    fn get_local_choice(&mut self, name: &str) -> Result<Value, HostError>;

    /// 32 fresh random bytes.
    fn get_randomness(&mut self) -> Result<[u8; 32], HostError>;

    /// Shown an offer; `Err` declines it.
    fn accept_or_reject_offer(&mut self, offer: &Value) -> Result<(), HostError>;

    /// A counterpart's deadline lapsed and the timeout step ran.
    fn on_timeout(&mut self) {}

    /// The protocol halted with `outcome`.
    fn on_outcome(&mut self, _outcome: Option<&Value>) {}
}

impl<T: Interact + ?Sized> Interact for Box<T> {
    fn get_local_choice(&mut self, name: &str) -> Result<Value, HostError> {
        (**self).get_local_choice(name)
    }

    fn get_randomness(&mut self) -> Result<[u8; 32], HostError> {
        (**self).get_randomness()
    }

    fn accept_or_reject_offer(&mut self, offer: &Value) -> Result<(), HostError> {
        (**self).accept_or_reject_offer(offer)
    }

    fn on_timeout(&mut self) {
        (**self).on_timeout();
    }

    fn on_outcome(&mut self, outcome: Option<&Value>) {
        (**self).on_outcome(outcome);
    }
}
