use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tandem_client::DriverOptions;
use tandem_core::{compile, Ledger};
use tandem_digest::Address;
use tandem_evm::{AccountContract, AccountLedger};
use tandem_protocols::rps::{self, hand};
use tandem_protocols::{play, ScriptedHost};
use tandem_teal::{StackLedger, StackMachine};

fn hosts(rounds: usize) -> ((Address, ScriptedHost), (Address, ScriptedHost)) {
    // `rounds - 1` draws, then paper beats rock.
    let mut a = vec![hand::ROCK; rounds.saturating_sub(1)];
    let mut b = a.clone();
    a.push(hand::PAPER);
    b.push(hand::ROCK);
    (
        (
            Address::from_short([0xa1; 20]),
            ScriptedHost::new("alice", 1).choose("wager", [10]).choose("hand", a),
        ),
        (Address::from_short([0xb0; 20]), ScriptedHost::new("bob", 2).choose("hand", b)),
    )
}

fn bench_compile(c: &mut Criterion) {
    let p = rps::rock_paper_scissors(rps::DEADLINE);
    let mut group = c.benchmark_group("compile_rps");
    group.bench_function("stack_machine", |b| {
        b.iter(|| black_box(compile::<StackMachine>(black_box(&p)).ok()));
    });
    group.bench_function("account_contract", |b| {
        b.iter(|| black_box(compile::<AccountContract>(black_box(&p)).ok()));
    });
    group.finish();
}

fn bench_match(c: &mut Criterion) {
    let p = rps::rock_paper_scissors(rps::DEADLINE);
    let deployer = Address::from_short([0xde; 20]);
    let (Ok(teal), Ok(evm)) = (compile::<StackMachine>(&p), compile::<AccountContract>(&p)) else {
        return;
    };
    let opts = DriverOptions::default();

    let mut group = c.benchmark_group("play_rps");
    for rounds in [1usize, 4] {
        group.bench_function(BenchmarkId::new("stack_machine", rounds), |b| {
            b.iter(|| {
                let Ok(mut l) = StackLedger::deploy(p.clone(), &teal, deployer, 1) else { return };
                let (x, y) = hosts(rounds);
                l.fund(x.0, 100);
                l.fund(y.0, 100);
                black_box(play(p.clone(), &mut l, x, y, &opts).ok());
                black_box(l.state_digest());
            });
        });
        group.bench_function(BenchmarkId::new("account_contract", rounds), |b| {
            b.iter(|| {
                let Ok(mut l) = AccountLedger::deploy(p.clone(), &evm, deployer, 1) else { return };
                let (x, y) = hosts(rounds);
                l.fund(x.0, 100);
                l.fund(y.0, 100);
                black_box(play(p.clone(), &mut l, x, y, &opts).ok());
                black_box(l.state_digest());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile, bench_match);
criterion_main!(benches);
