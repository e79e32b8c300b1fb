//! Scripted hosts for tests, benches and demos.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use tandem_client::{HostError, Interact};
use tandem_digest::Value;
use tracing::debug;

/// Answers choices from per-name queues and draws randomness from a seeded RNG.
///
/// A name whose queue runs dry is [`HostError::Unavailable`]. A name listed
/// in `decline` is [`HostError::Declined`], which leaves the step to its
/// deadline.
#[derive(Debug)]
pub struct ScriptedHost {
    label: String,
    choices: BTreeMap<String, VecDeque<Value>>,
    decline: Vec<String>,
    accept_offers: bool,
    rng: StdRng,
    /// Offers seen, in order.
    pub offers: Vec<Value>,
    /// Timeout notifications received.
    pub timeouts: usize,
    /// Outcome reported at halt (`Some(None)` for an outcome-less halt).
    pub outcome: Option<Option<Value>>,
}

impl ScriptedHost {
    /// A host that accepts every offer, seeded with `seed`.
    #[must_use]
    pub fn new(label: &str, seed: u64) -> Self {
        Self {
            label: label.to_owned(),
            choices: BTreeMap::new(),
            decline: Vec::new(),
            accept_offers: true,
            rng: StdRng::seed_from_u64(seed),
            offers: Vec::new(),
            timeouts: 0,
            outcome: None,
        }
    }

    /// Queue `values` as the answers to choice `name`.
    #[must_use]
    pub fn choose<I: IntoIterator<Item = u64>>(mut self, name: &str, values: I) -> Self {
        self.choices
            .entry(name.to_owned())
            .or_default()
            .extend(values.into_iter().map(Value::UInt));
        self
    }

    /// Decline whenever asked for `name`.
    #[must_use]
    pub fn declining(mut self, name: &str) -> Self {
        self.decline.push(name.to_owned());
        self
    }

    /// Reject every offer.
    #[must_use]
    pub const fn rejecting_offers(mut self) -> Self {
        self.accept_offers = false;
        self
    }

    /// Answers still queued for `name`.
    #[must_use]
    pub fn remaining(&self, name: &str) -> usize {
        self.choices.get(name).map_or(0, VecDeque::len)
    }
}

impl Interact for ScriptedHost {
    fn get_local_choice(&mut self, name: &str) -> Result<Value, HostError> {
        if self.decline.iter().any(|d| d == name) {
            return Err(HostError::Declined(format!("{} will not choose {name}", self.label)));
        }
        let v = self
            .choices
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| HostError::Unavailable(format!("{} has no {name} left", self.label)))?;
        debug!(host = %self.label, name, ?v, "choice");
        Ok(v)
    }

    fn get_randomness(&mut self) -> Result<[u8; 32], HostError> {
        let mut b = [0u8; 32];
        self.rng.fill_bytes(&mut b);
        Ok(b)
    }

    fn accept_or_reject_offer(&mut self, offer: &Value) -> Result<(), HostError> {
        self.offers.push(offer.clone());
        if self.accept_offers {
            Ok(())
        } else {
            Err(HostError::Declined(format!("{} rejects {offer:?}", self.label)))
        }
    }

    fn on_timeout(&mut self) {
        debug!(host = %self.label, "timeout observed");
        self.timeouts += 1;
    }

    fn on_outcome(&mut self, outcome: Option<&Value>) {
        self.outcome = Some(outcome.cloned());
    }
}
