//! In-memory stack-machine ledger.
//!
//! [`StackLedger`] deploys a [`BackendArtifact`] produced by
//! [`crate::StackMachine`] and executes transaction groups against it:
//! logic signatures first, then every transaction in order on a scratch copy
//! of balances and application globals. The copy is committed only if the
//! whole group succeeds.
//!
//! Logic-signature accounts are `keccak256("Program" ‖ resolved text)`.

use crate::asm::{AsmError, Program, ON_CLEAR, ON_NOOP, ON_UPDATE};
use crate::lower::{
    handler_name, APP_ID, ARG_BASE, ARG_LAST, CONTRACT_ADDR, DEPLOYER, GLOBAL_HALTED,
    GLOBAL_STATE, GTXN_APP, GTXN_PAY,
};
use crate::vm::{self, Ctx, Fault, FaultKind, GroupTxn, StackValue, TxnBody};
use std::collections::BTreeMap;
use tandem_core::template::{self, Bindings, TemplateError};
use tandem_core::{
    verify, BackendArtifact, BackendKind, Ledger, Observed, Protocol, Reason, Rejection, StepCall,
    StepId, Submission,
};
use tandem_digest::{empty_digest, keccak256, state_digest, Address, Digest, Value};
use tracing::{debug, info, warn};

/// Application id assigned at deployment.
pub const APPLICATION_ID: u64 = 1;

/// Account of a logic signature over `text`.
#[must_use]
pub fn program_address(text: &str) -> Address {
    let mut buf = b"Program".to_vec();
    buf.extend_from_slice(text.as_bytes());
    Address(keccak256(&buf))
}

/// Deployment failed.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// The artifact targets another backend.
    #[error("artifact targets {0:?}, not the stack machine")]
    Backend(BackendKind),
    /// A required program is missing.
    #[error("artifact has no program `{0}`")]
    Missing(String),
    /// A placeholder could not be resolved.
    #[error("program `{program}`: {source}")]
    Template {
        /// Program name.
        program: String,
        /// Cause.
        #[source]
        source: TemplateError,
    },
    /// Resolved text does not assemble.
    #[error("program `{program}`: {source}")]
    Asm {
        /// Program name.
        program: String,
        /// Cause.
        #[source]
        source: AsmError,
    },
    /// A deployment call was rejected.
    #[error("deployment call to `{program}` rejected: {fault}")]
    Rejected {
        /// Program name.
        program: String,
        /// Failing instruction.
        fault: Fault,
    },
}

/// Who authorizes a group transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    /// The sender's own key.
    Account,
    /// Logic signature of a step handler.
    Handler(StepId),
    /// Logic signature of the escrow.
    Escrow,
}

/// A group transaction with its authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTxn {
    /// Transaction.
    pub txn: GroupTxn,
    /// Authorization.
    pub auth: Auth,
}

/// A deployed protocol on an in-memory stack-machine ledger.
#[derive(Debug, Clone)]
pub struct StackLedger {
    protocol: Protocol,
    round: u64,
    deployed_at: u64,
    max_group: usize,
    approval: Program,
    clear: Program,
    escrow: (Address, Program),
    handlers: Vec<(Address, Program)>,
    globals: BTreeMap<Vec<u8>, StackValue>,
    balances: BTreeMap<Address, u64>,
    log: Vec<Observed>,
}

fn load(artifact: &BackendArtifact, name: &str, b: &Bindings) -> Result<(String, Program), DeployError> {
    let text = artifact
        .program(name)
        .ok_or_else(|| DeployError::Missing(name.to_owned()))?;
    let text = template::resolve(text, b).map_err(|source| DeployError::Template {
        program: name.to_owned(),
        source,
    })?;
    let prog = Program::parse(&text).map_err(|source| DeployError::Asm {
        program: name.to_owned(),
        source,
    })?;
    Ok((text, prog))
}

fn run_call(prog: &Program, name: &str, group: &[GroupTxn], round: u64, globals: &mut BTreeMap<Vec<u8>, StackValue>) -> Result<(), DeployError> {
    vm::run(
        prog,
        &mut Ctx {
            group,
            index: 0,
            round,
            globals: Some(globals),
        },
    )
    .map_err(|fault| DeployError::Rejected {
        program: name.to_owned(),
        fault,
    })
}

/// Classify a program fault by the note on its failing line.
fn classify(step: StepId, program: &str, f: &Fault) -> Rejection {
    let reason = match (f.kind, &f.note) {
        (FaultKind::Arithmetic, _) => Reason::Arithmetic,
        (_, Some(note)) => Reason::from_note(note),
        (FaultKind::Budget, None) => Reason::Other("budget exhausted".into()),
        _ => Reason::Shape,
    };
    Rejection::new(step, reason, format!("{program}: {f}"))
}

fn arg_bytes(step: StepId, v: &Value) -> Result<Vec<u8>, Rejection> {
    v.to_arg_bytes()
        .ok_or_else(|| Rejection::new(step, Reason::Shape, format!("{} is not a ledger scalar", v.kind())))
}

impl StackLedger {
    /// Deploy `artifact` for `protocol` from `deployer` at `round`.
    ///
    /// Creates the application with the bootstrap program, derives the escrow
    /// and handler accounts from their resolved text, then installs the
    /// approval program that names those handlers.
    pub fn deploy(
        protocol: Protocol,
        artifact: &BackendArtifact,
        deployer: Address,
        round: u64,
    ) -> Result<Self, DeployError> {
        if artifact.backend() != BackendKind::StackMachine {
            return Err(DeployError::Backend(artifact.backend()));
        }
        let max_group = artifact.manifest["group"]["max_size"]
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(16);
        let mut b = Bindings::new().with(DEPLOYER, deployer.to_hex());
        let mut globals = BTreeMap::new();

        let (_, init) = load(artifact, "init", &b)?;
        let create = [GroupTxn {
            sender: deployer,
            body: TxnBody::AppCall {
                app_id: 0,
                on_completion: ON_NOOP,
                args: Vec::new(),
            },
        }];
        run_call(&init, "init", &create, round, &mut globals)?;

        b.insert(APP_ID, APPLICATION_ID.to_string());
        let (text, escrow) = load(artifact, "escrow", &b)?;
        let escrow_addr = program_address(&text);
        b.insert(CONTRACT_ADDR, escrow_addr.to_hex());

        let mut handlers = Vec::with_capacity(protocol.steps.len());
        for s in &protocol.steps {
            let name = handler_name(s.id);
            let (text, prog) = load(artifact, &name, &b)?;
            let addr = program_address(&text);
            debug!(step = s.id, account = %addr, "handler derived");
            b.insert(&name, addr.to_hex());
            handlers.push((addr, prog));
        }

        let (_, approval) = load(artifact, "approval", &b)?;
        let update = [GroupTxn {
            sender: deployer,
            body: TxnBody::AppCall {
                app_id: APPLICATION_ID,
                on_completion: ON_UPDATE,
                args: Vec::new(),
            },
        }];
        run_call(&init, "init", &update, round, &mut globals)?;
        let (_, clear) = load(artifact, "clear", &b)?;

        info!(protocol = %protocol.name, escrow = %escrow_addr, round, "deployed");
        Ok(Self {
            protocol,
            round,
            deployed_at: round,
            max_group,
            approval,
            clear,
            escrow: (escrow_addr, escrow),
            handlers,
            globals,
            balances: BTreeMap::new(),
            log: Vec::new(),
        })
    }

    /// Credit `who` with `amount`.
    pub fn fund(&mut self, who: Address, amount: u64) {
        let bal = self.balances.entry(who).or_default();
        *bal = bal.saturating_add(amount);
    }

    /// Escrow account.
    #[must_use]
    pub const fn escrow_address(&self) -> Address {
        self.escrow.0
    }

    /// Handler account of step `id`.
    #[must_use]
    pub fn handler_address(&self, id: StepId) -> Option<Address> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.handlers.get(idx).map(|(a, _)| *a)
    }

    /// Whether `who` is a logic-signature account, which has no key.
    fn is_program_account(&self, who: &Address) -> bool {
        *who == self.escrow.0 || self.handlers.iter().any(|(a, _)| a == who)
    }

    /// Opt `from` out of the application with a lone clear-state call.
    ///
    /// Refused while the protocol is running.
    pub fn clear_state(&mut self, from: &Address) -> Result<(), Rejection> {
        let group = [GroupTxn {
            sender: *from,
            body: TxnBody::AppCall {
                app_id: APPLICATION_ID,
                on_completion: ON_CLEAR,
                args: Vec::new(),
            },
        }];
        let mut globals = self.globals.clone();
        let mut ctx = Ctx {
            group: &group,
            index: 0,
            round: self.round,
            globals: Some(&mut globals),
        };
        vm::run(&self.clear, &mut ctx).map_err(|f| classify(0, "clear", &f))?;
        debug!(account = %from, "cleared");
        Ok(())
    }

    /// Raw application global.
    #[must_use]
    pub fn global(&self, key: &str) -> Option<&StackValue> {
        self.globals.get(key.as_bytes())
    }

    /// Build the group for `call` as the client would.
    ///
    /// The next digest, halt flag and payouts are precomputed with the
    /// reference semantics; a claim they reject still yields a group (with
    /// zeroed commitments) so the programs decide the outcome.
    pub fn assemble(&self, from: &Address, call: &StepCall) -> Result<Vec<SignedTxn>, Rejection> {
        let id = call.step;
        let step = self
            .protocol
            .step(id)
            .ok_or_else(|| Rejection::new(id, Reason::Shape, "unknown step"))?;
        let handler = self
            .handler_address(id)
            .ok_or_else(|| Rejection::new(id, Reason::Shape, "no handler"))?;
        let label = self.protocol.states.get(step.from).map_or(0, |s| s.label);
        let prev = state_digest(label, &self.protocol.state_kinds(step.from), &call.svs, 0)
            .map_or(Digest::ZERO, |d| d.no_time);

        let sub = Submission {
            sender: *from,
            value: call.pay,
            time: self.round,
            svs: call.svs.clone(),
            prev_time: call.prev_time,
            msg: call.msg.clone(),
        };
        let (next, halt, payouts) = match verify(&self.protocol, id, None, &sub) {
            Ok(fx) => (fx.next_digest.no_time, u64::from(fx.halted()), fx.payouts),
            Err(e) => {
                debug!(step = id, error = %e, "claim fails reference check; submitting anyway");
                (Digest::ZERO, 0, Vec::new())
            }
        };

        let mut args = vec![
            prev.0.to_vec(),
            next.0.to_vec(),
            halt.to_be_bytes().to_vec(),
            call.prev_time.to_be_bytes().to_vec(),
        ];
        for v in call.svs.iter().chain(&call.msg) {
            args.push(arg_bytes(id, v)?);
        }

        let account = |sender, body| SignedTxn {
            txn: GroupTxn { sender, body },
            auth: Auth::Account,
        };
        let mut group = vec![
            account(
                *from,
                TxnBody::AppCall {
                    app_id: APPLICATION_ID,
                    on_completion: ON_NOOP,
                    args,
                },
            ),
            account(
                *from,
                TxnBody::Pay {
                    receiver: self.escrow.0,
                    amount: call.pay,
                },
            ),
            SignedTxn {
                txn: GroupTxn {
                    sender: handler,
                    body: TxnBody::Pay {
                        receiver: handler,
                        amount: 0,
                    },
                },
                auth: Auth::Handler(id),
            },
        ];
        group.extend(payouts.into_iter().map(|po| SignedTxn {
            txn: GroupTxn {
                sender: self.escrow.0,
                body: TxnBody::Pay {
                    receiver: po.to,
                    amount: po.amount,
                },
            },
            auth: Auth::Escrow,
        }));
        Ok(group)
    }

    /// Execute a signed group attempting step `step`, atomically.
    pub fn submit_group(&mut self, step: StepId, group: &[SignedTxn]) -> Result<Observed, Rejection> {
        if group.is_empty() || group.len() > self.max_group {
            return Err(Rejection::new(step, Reason::Shape, format!("group of {}", group.len())));
        }
        let txns: Vec<GroupTxn> = group.iter().map(|s| s.txn.clone()).collect();
        if let Some((index, s)) = group
            .iter()
            .enumerate()
            .find(|(_, s)| s.auth == Auth::Account && self.is_program_account(&s.txn.sender))
        {
            return Err(Rejection::new(
                step,
                Reason::Shape,
                format!("txn {index}: program account {} has no key", s.txn.sender),
            ));
        }

        for (index, s) in group.iter().enumerate() {
            let (name, prog) = match s.auth {
                Auth::Account => continue,
                Auth::Escrow => ("escrow".to_owned(), &self.escrow.1),
                Auth::Handler(id) => {
                    let idx = usize::try_from(id).ok().and_then(|i| i.checked_sub(1));
                    let (addr, prog) = idx
                        .and_then(|i| self.handlers.get(i))
                        .ok_or_else(|| Rejection::new(step, Reason::Shape, "unknown handler"))?;
                    if *addr != s.txn.sender {
                        return Err(Rejection::new(step, Reason::Shape, "handler signs for another account"));
                    }
                    (handler_name(id), prog)
                }
            };
            if matches!(s.auth, Auth::Escrow) && s.txn.sender != self.escrow.0 {
                return Err(Rejection::new(step, Reason::Shape, "escrow signs for another account"));
            }
            let mut ctx = Ctx {
                group: &txns,
                index,
                round: self.round,
                globals: None,
            };
            vm::run(prog, &mut ctx).map_err(|f| classify(step, &name, &f))?;
        }

        let mut balances = self.balances.clone();
        let mut globals = self.globals.clone();
        for (index, t) in txns.iter().enumerate() {
            match &t.body {
                TxnBody::Pay { receiver, amount } => {
                    let from = balances.entry(t.sender).or_default();
                    *from = from.checked_sub(*amount).ok_or_else(|| {
                        Rejection::new(step, Reason::Funds, format!("txn {index}: {} cannot pay {amount}", t.sender))
                    })?;
                    let to = balances.entry(*receiver).or_default();
                    *to = to
                        .checked_add(*amount)
                        .ok_or_else(|| Rejection::new(step, Reason::Arithmetic, format!("txn {index}: balance overflow")))?;
                }
                TxnBody::AppCall { app_id, .. } => {
                    if *app_id != APPLICATION_ID {
                        return Err(Rejection::new(step, Reason::Shape, format!("txn {index}: unknown application {app_id}")));
                    }
                    let mut ctx = Ctx {
                        group: &txns,
                        index,
                        round: self.round,
                        globals: Some(&mut globals),
                    };
                    vm::run(&self.approval, &mut ctx).map_err(|f| classify(step, "approval", &f))?;
                }
            }
        }

        let observed = self.observe(step, &txns)?;
        self.balances = balances;
        self.globals = globals;
        self.log.push(observed.clone());
        if self.halted() {
            info!(step, round = self.round, "protocol halted");
        }
        Ok(observed)
    }

    fn halted(&self) -> bool {
        matches!(self.globals.get(GLOBAL_HALTED.as_bytes()), Some(StackValue::Uint(n)) if *n != 0)
    }

    /// Recover the step's public data from an accepted group.
    fn observe(&self, step: StepId, txns: &[GroupTxn]) -> Result<Observed, Rejection> {
        let bad = |what: &str| Rejection::new(step, Reason::Shape, format!("undecodable group: {what}"));
        let s = self.protocol.step(step).ok_or_else(|| bad("step"))?;
        let app = txns.get(usize::from(GTXN_APP)).ok_or_else(|| bad("app call"))?;
        let TxnBody::AppCall { args, .. } = &app.body else {
            return Err(bad("app call"));
        };
        let value = match txns.get(usize::from(GTXN_PAY)).map(|t| &t.body) {
            Some(TxnBody::Pay { amount, .. }) => *amount,
            _ => return Err(bad("payment")),
        };
        let prev_time = args
            .get(usize::from(ARG_LAST))
            .and_then(|b| <[u8; 8]>::try_from(b.as_slice()).ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| bad("lastTime"))?;

        let svs_kinds = self.protocol.state_kinds(s.from);
        let msg_kinds = self.protocol.msg_kinds(s);
        let mut rest = args.iter().skip(usize::from(ARG_BASE));
        let mut decode = |kinds: &[tandem_digest::Kind]| {
            kinds
                .iter()
                .map(|k| rest.next().and_then(|b| Value::from_arg_bytes(k, b)))
                .collect::<Option<Vec<_>>>()
        };
        let svs = decode(&svs_kinds).ok_or_else(|| bad("state variables"))?;
        let msg = decode(&msg_kinds).ok_or_else(|| bad("message"))?;

        Ok(Observed {
            seq: self.log.len() as u64,
            step,
            sender: app.sender,
            value,
            time: self.round,
            svs,
            prev_time,
            msg,
        })
    }
}

impl Ledger for StackLedger {
    fn backend(&self) -> BackendKind {
        BackendKind::StackMachine
    }

    fn now(&self) -> u64 {
        self.round
    }

    fn deployed_at(&self) -> u64 {
        self.deployed_at
    }

    fn advance(&mut self, by: u64) {
        self.round = self.round.saturating_add(by);
    }

    fn state_digest(&self) -> Digest {
        if self.halted() {
            return empty_digest();
        }
        match self.globals.get(GLOBAL_STATE.as_bytes()) {
            Some(StackValue::Bytes(b)) => Digest::from_slice(b).unwrap_or(Digest::ZERO),
            _ => Digest::ZERO,
        }
    }

    fn balance(&self, who: &Address) -> u64 {
        self.balances.get(who).copied().unwrap_or(0)
    }

    fn escrow_balance(&self) -> u64 {
        self.balance(&self.escrow.0)
    }

    fn submit(&mut self, from: &Address, call: &StepCall) -> Result<Observed, Rejection> {
        let group = self.assemble(from, call)?;
        self.submit_group(call.step, &group).map_err(|r| {
            warn!(step = call.step, reason = %r.reason, detail = %r.detail, "rejected");
            r
        })
    }

    fn observed(&self) -> &[Observed] {
        &self.log
    }
}
