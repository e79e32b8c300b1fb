//! Full matches between two scripted clients on both generated backends.

#![allow(clippy::unwrap_used)]

mod utils;

use tandem_core::Ledger;
use tandem_digest::{empty_digest, Value};
use tandem_protocols::rps::{self, hand, result};
use tandem_protocols::{play, ScriptedHost};
use utils::*;

fn draw_then_alice_wins<L: Ledger>(mut l: L) {
    let p = rps::rock_paper_scissors(DEADLINE);
    let (report, parts) = play(
        p,
        &mut l,
        alice_host(&[hand::ROCK, hand::PAPER]),
        bob_host(&[hand::ROCK, hand::ROCK]),
        &opts(),
    )
    .unwrap();

    assert_eq!(report.outcome, Some(Value::UInt(result::A_WINS)));
    assert_eq!(report.submitted, 8);
    assert_eq!(report.timeouts, 0);
    assert_eq!(l.balance(&alice()), FUNDS + WAGER);
    assert_eq!(l.balance(&bob()), FUNDS - WAGER);
    assert_eq!(l.escrow_balance(), 0);
    assert_eq!(l.state_digest(), empty_digest());

    for part in &parts {
        assert_eq!(part.state().rounds, 1);
        assert_eq!(part.host().outcome, Some(Some(Value::UInt(result::A_WINS))));
        assert_eq!(part.host().timeouts, 0);
    }
    assert_eq!(parts[1].host().offers, vec![Value::UInt(WAGER)]);
    assert_eq!(parts[0].host().remaining("hand"), 0);
}

#[test]
fn stack_machine_draw_then_alice_wins() {
    draw_then_alice_wins(teal());
}

#[test]
fn account_contract_draw_then_alice_wins() {
    draw_then_alice_wins(evm());
}

fn bob_wins_after_two_draws<L: Ledger>(mut l: L) {
    let p = rps::rock_paper_scissors(DEADLINE);
    let (report, parts) = play(
        p,
        &mut l,
        alice_host(&[hand::PAPER, hand::SCISSORS, hand::ROCK]),
        bob_host(&[hand::PAPER, hand::SCISSORS, hand::PAPER]),
        &opts(),
    )
    .unwrap();

    assert_eq!(report.outcome, Some(Value::UInt(result::B_WINS)));
    assert_eq!(report.submitted, 2 + 3 * 3);
    assert_eq!(l.balance(&bob()), FUNDS + WAGER);
    assert_eq!(l.state_digest(), empty_digest());
    assert_eq!(parts[0].state().rounds, 2);
}

#[test]
fn stack_machine_bob_wins_after_two_draws() {
    bob_wins_after_two_draws(teal());
}

#[test]
fn account_contract_bob_wins_after_two_draws() {
    bob_wins_after_two_draws(evm());
}

fn silent_bob_forfeits<L: Ledger>(mut l: L) {
    let p = rps::rock_paper_scissors(DEADLINE);
    let bob_side = (bob(), ScriptedHost::new("bob", 11).declining("hand"));
    let (report, parts) = play(p, &mut l, alice_host(&[hand::ROCK]), bob_side, &opts()).unwrap();

    assert_eq!(report.outcome, None);
    assert_eq!(report.timeouts, 1);
    assert_eq!(report.ticks, DEADLINE + 1);
    assert_eq!(l.balance(&alice()), FUNDS + WAGER);
    assert_eq!(l.balance(&bob()), FUNDS - WAGER);
    assert_eq!(l.observed().last().unwrap().step, rps::steps::PLAY_TIMEOUT);
    for part in &parts {
        assert_eq!(part.host().timeouts, 1);
        assert_eq!(part.host().outcome, Some(None));
    }
}

#[test]
fn stack_machine_silent_bob_forfeits() {
    silent_bob_forfeits(teal());
}

#[test]
fn account_contract_silent_bob_forfeits() {
    silent_bob_forfeits(evm());
}

fn refused_wager_is_refunded<L: Ledger>(mut l: L) {
    let p = rps::rock_paper_scissors(DEADLINE);
    let bob_side = (bob(), ScriptedHost::new("bob", 11).rejecting_offers());
    let (report, _) = play(p, &mut l, alice_host(&[]), bob_side, &opts()).unwrap();

    assert_eq!(report.submitted, 2);
    assert_eq!(report.timeouts, 1);
    assert_eq!(l.balance(&alice()), FUNDS);
    assert_eq!(l.balance(&bob()), FUNDS);
    assert_eq!(l.state_digest(), empty_digest());
}

#[test]
fn stack_machine_refused_wager_is_refunded() {
    refused_wager_is_refunded(teal());
}

#[test]
fn account_contract_refused_wager_is_refunded() {
    refused_wager_is_refunded(evm());
}

#[test]
fn alice_without_a_hand_forfeits_to_bob() {
    let mut l = evm();
    let alice_side = (alice(), ScriptedHost::new("alice", 7).choose("wager", [WAGER]).declining("hand"));
    let (report, _) = play(rps::rock_paper_scissors(DEADLINE), &mut l, alice_side, bob_host(&[]), &opts()).unwrap();
    assert_eq!(l.observed().last().unwrap().step, rps::steps::COMMIT_TIMEOUT);
    assert_eq!(report.timeouts, 1);
    assert_eq!(l.balance(&bob()), FUNDS + WAGER);
}
