//! In-memory account ledger.
//!
//! [`AccountLedger`] runs the creation code of an artifact produced by
//! [`crate::AccountContract`], keeps the returned runtime, and executes each
//! submission as one payable call. Storage, escrow and balances are updated
//! only when the call stops normally; a revert leaves everything as it was.

use crate::abi::{self, decode_event};
use crate::lower::{DEPLOYER, STATE_SLOT};
use crate::vm::{self, low_u64, Env, Exit, Outcome, VmError};
use revm_primitives::U256;
use std::collections::BTreeMap;
use tandem_core::template::{self, Bindings, TemplateError};
use tandem_core::{BackendArtifact, BackendKind, Ledger, Observed, Protocol, Reason, Rejection, StepCall, StepId};
use tandem_digest::{keccak256, Address, Digest};
use tracing::{debug, info, warn};

/// Deployment failed.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// The artifact targets another backend.
    #[error("artifact targets {0:?}, not an account contract")]
    Backend(BackendKind),
    /// A required program is missing.
    #[error("artifact has no program `{0}`")]
    Missing(String),
    /// A placeholder could not be resolved.
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// Resolved code is not hex.
    #[error("creation code: {0}")]
    Hex(#[from] hex::FromHexError),
    /// The deployer has no 20-byte form.
    #[error("deployer {0} is not a 20-byte account")]
    Deployer(Address),
    /// The constructor reverted.
    #[error("constructor reverted: {0}")]
    Reverted(String),
    /// The constructor faulted.
    #[error("constructor faulted: {0}")]
    Vm(#[from] VmError),
}

/// A deployed protocol contract on an in-memory account ledger.
#[derive(Debug, Clone)]
pub struct AccountLedger {
    protocol: Protocol,
    number: u64,
    deployed_at: u64,
    contract: Address,
    runtime: Vec<u8>,
    storage: BTreeMap<U256, U256>,
    escrow: u64,
    balances: BTreeMap<Address, u64>,
    reasons: Vec<String>,
    topics: BTreeMap<[u8; 32], StepId>,
    log: Vec<Observed>,
}

/// Contract account created by `deployer` at block `number`.
#[must_use]
pub fn contract_address(deployer: &Address, number: u64) -> Address {
    let mut buf = deployer.0.to_vec();
    buf.extend_from_slice(&number.to_be_bytes());
    let h = keccak256(&buf);
    let mut short = [0u8; 20];
    short.copy_from_slice(&h[12..]);
    Address::from_short(short)
}

/// Hex form of `a` for the `{{Deployer}}` slot: 64 digits, no prefix.
#[must_use]
pub fn deployer_binding(a: &Address) -> String {
    hex::encode(a.0)
}

fn revert_note(reasons: &[String], data: &[u8]) -> Option<String> {
    if data.len() != 32 {
        return None;
    }
    let code = low_u64(&U256::from_be_slice(data))?;
    let idx = usize::try_from(code).ok()?.checked_sub(1)?;
    reasons.get(idx).cloned()
}

impl AccountLedger {
    /// Deploy `artifact` for `protocol` from `deployer` at block `number`.
    pub fn deploy(
        protocol: Protocol,
        artifact: &BackendArtifact,
        deployer: Address,
        number: u64,
    ) -> Result<Self, DeployError> {
        if artifact.backend() != BackendKind::AccountContract {
            return Err(DeployError::Backend(artifact.backend()));
        }
        if !deployer.is_short() {
            return Err(DeployError::Deployer(deployer));
        }
        let reasons: Vec<String> = artifact.manifest["reasons"]
            .as_array()
            .map(|rs| rs.iter().filter_map(|r| r.as_str().map(str::to_owned)).collect())
            .unwrap_or_default();

        let text = artifact
            .program("contract")
            .ok_or_else(|| DeployError::Missing("contract".into()))?;
        let b = Bindings::new().with(DEPLOYER, deployer_binding(&deployer));
        let code = hex::decode(template::resolve(text, &b)?)?;

        let mut storage = BTreeMap::new();
        let env = Env {
            caller: deployer,
            value: 0,
            number,
            calldata: &[],
            balance: 0,
        };
        let runtime = match vm::run(&code, env, &mut storage)?.exit {
            Exit::Return(rt) => rt,
            Exit::Revert(data) => {
                let note = revert_note(&reasons, &data).unwrap_or_else(|| hex::encode(&data));
                return Err(DeployError::Reverted(note));
            }
            Exit::Stop => return Err(DeployError::Reverted("no runtime returned".into())),
        };

        let mut topics = BTreeMap::new();
        for s in &protocol.steps {
            if let Ok(sig) = abi::event_signature(&protocol, s) {
                topics.insert(abi::topic(&sig), s.id);
            }
        }
        let contract = contract_address(&deployer, number);
        info!(protocol = %protocol.name, contract = %contract, number, runtime = runtime.len(), "deployed");
        Ok(Self {
            protocol,
            number,
            deployed_at: number,
            contract,
            runtime,
            storage,
            escrow: 0,
            balances: BTreeMap::new(),
            reasons,
            topics,
            log: Vec::new(),
        })
    }

    /// Credit `who` with `amount`.
    pub fn fund(&mut self, who: Address, amount: u64) {
        let bal = self.balances.entry(who).or_default();
        *bal = bal.saturating_add(amount);
    }

    /// The contract's account.
    #[must_use]
    pub const fn contract(&self) -> Address {
        self.contract
    }

    /// Deployed runtime code.
    #[must_use]
    pub fn runtime(&self) -> &[u8] {
        &self.runtime
    }

    /// Raw storage word.
    #[must_use]
    pub fn storage(&self, slot: u64) -> [u8; 32] {
        self.storage
            .get(&U256::from(slot))
            .map_or([0; 32], |v| v.to_be_bytes::<32>())
    }

    /// Call the contract with raw `calldata`, attempting step `step`.
    pub fn submit_calldata(
        &mut self,
        step: StepId,
        from: &Address,
        pay: u64,
        calldata: &[u8],
    ) -> Result<Observed, Rejection> {
        if !from.is_short() {
            return Err(Rejection::new(step, Reason::Shape, format!("{from} is not a 20-byte account")));
        }
        let funds = self.balance(from);
        let remaining = funds
            .checked_sub(pay)
            .ok_or_else(|| Rejection::new(step, Reason::Funds, format!("{from} cannot pay {pay}")))?;
        let balance = self
            .escrow
            .checked_add(pay)
            .ok_or_else(|| Rejection::new(step, Reason::Arithmetic, "escrow overflow"))?;

        let mut storage = self.storage.clone();
        let env = Env {
            caller: *from,
            value: pay,
            number: self.number,
            calldata,
            balance,
        };
        let out = vm::run(&self.runtime, env, &mut storage)
            .map_err(|e| Rejection::new(step, Reason::Other(format!("vm: {e}")), e.to_string()))?;
        if let Exit::Revert(data) = &out.exit {
            let reason = revert_note(&self.reasons, data)
                .map_or_else(|| Reason::Other("revert".into()), |n| Reason::from_note(&n));
            return Err(Rejection::new(step, reason, format!("revert 0x{}", hex::encode(data))));
        }

        let observed = self.observe(step, from, pay, &out)?;
        let mut balances = self.balances.clone();
        balances.insert(*from, remaining);
        let mut escrow = balance;
        for t in &out.transfers {
            escrow -= t.amount;
            let to = balances.entry(t.to).or_default();
            *to = to
                .checked_add(t.amount)
                .ok_or_else(|| Rejection::new(step, Reason::Arithmetic, "balance overflow"))?;
        }
        debug!(step, steps = out.steps, transfers = out.transfers.len(), "call accepted");
        self.balances = balances;
        self.escrow = escrow;
        self.storage = storage;
        self.log.push(observed.clone());
        if self.state_digest() == tandem_digest::empty_digest() {
            info!(step, number = self.number, "protocol halted");
        }
        Ok(observed)
    }

    /// Recover the step's public data from its event.
    fn observe(&self, step: StepId, from: &Address, pay: u64, out: &Outcome) -> Result<Observed, Rejection> {
        let bad = |what: String| Rejection::new(step, Reason::Shape, format!("undecodable call: {what}"));
        let [log] = out.logs.as_slice() else {
            return Err(bad(format!("{} events", out.logs.len())));
        };
        let id = *self.topics.get(&log.topic).ok_or_else(|| bad("unknown event".into()))?;
        if id != step {
            return Err(bad(format!("event of step {id}")));
        }
        let s = self.protocol.step(id).ok_or_else(|| bad("step".into()))?;
        let ev = decode_event(&self.protocol, s, &log.data).map_err(|e| bad(e.to_string()))?;
        Ok(Observed {
            seq: self.log.len() as u64,
            step,
            sender: *from,
            value: pay,
            time: self.number,
            svs: ev.svs,
            prev_time: ev.prev_time,
            msg: ev.msg,
        })
    }
}

impl Ledger for AccountLedger {
    fn backend(&self) -> BackendKind {
        BackendKind::AccountContract
    }

    fn now(&self) -> u64 {
        self.number
    }

    fn deployed_at(&self) -> u64 {
        self.deployed_at
    }

    fn advance(&mut self, by: u64) {
        self.number = self.number.saturating_add(by);
    }

    fn state_digest(&self) -> Digest {
        Digest(self.storage(STATE_SLOT))
    }

    fn balance(&self, who: &Address) -> u64 {
        if *who == self.contract {
            return self.escrow;
        }
        self.balances.get(who).copied().unwrap_or(0)
    }

    fn escrow_balance(&self) -> u64 {
        self.escrow
    }

    fn submit(&mut self, from: &Address, call: &StepCall) -> Result<Observed, Rejection> {
        let id = call.step;
        let step = self
            .protocol
            .step(id)
            .ok_or_else(|| Rejection::new(id, Reason::Shape, "unknown step"))?;
        let data = abi::encode_call(&self.protocol, step, &call.svs, call.prev_time, &call.msg)
            .map_err(|e| Rejection::new(id, Reason::Shape, e.to_string()))?;
        self.submit_calldata(id, from, call.pay, &data).map_err(|r| {
            warn!(step = id, reason = %r.reason, detail = %r.detail, "rejected");
            r
        })
    }

    fn observed(&self) -> &[Observed] {
        &self.log
    }
}
