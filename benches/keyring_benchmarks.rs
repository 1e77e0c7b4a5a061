//! Benchmarks for the key window on the simulator backend
//!
//! Cached lookups should stay orders of magnitude below cold regeneration,
//! which pays for a root flush and two primary creations.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use keyring_core::{decode_signature, encode_public_key, encode_signature, KeyWindowManager};
use keyring_hardware_hal::{EccPoint, RawSignature, SimulatedHsm};
use tpm_keyring::protocol::{OP_GET_PUBLIC_KEY, OP_SIGN_ECDSA};
use tpm_keyring::Dispatcher;

fn initialized_manager() -> KeyWindowManager<SimulatedHsm> {
    let mut manager = KeyWindowManager::new(SimulatedHsm::new([0x5A; 32]));
    manager.initialize(1).expect("initialize");
    manager
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("asn");
    let point = EccPoint::new([0x81; 32], [0x7F; 32]);
    let signature = RawSignature {
        r: [0x80; 32],
        s: [0x01; 32],
    };
    let encoded = encode_signature(&signature);

    group.bench_function("encode_public_key", |b| {
        b.iter(|| encode_public_key(black_box(&point)))
    });
    group.bench_function("encode_signature", |b| {
        b.iter(|| encode_signature(black_box(&signature)))
    });
    group.bench_function("decode_signature", |b| {
        b.iter(|| decode_signature(black_box(encoded.as_bytes())))
    });
    group.finish();
}

fn bench_public_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_public_key");
    let mut manager = initialized_manager();

    for (label, index) in [("root", 0u16), ("next", 2), ("cold", 1000)] {
        group.bench_with_input(BenchmarkId::new(label, index), &index, |b, &index| {
            b.iter(|| manager.get_public_key(black_box(index)).expect("public key"))
        });
    }
    group.finish();
}

fn bench_signing(c: &mut Criterion) {
    let mut group = c.benchmark_group("sign_ecdsa");
    let digest = [0x3C; 32];

    let mut manager = initialized_manager();
    group.bench_function("previous_without_advance", |b| {
        b.iter(|| manager.sign_ecdsa(1, black_box(&digest), false).expect("sign"))
    });

    group.bench_function("previous_with_advance", |b| {
        b.iter_batched(
            initialized_manager,
            |mut manager| manager.sign_ecdsa(1, black_box(&digest), true).expect("sign"),
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let dispatcher = Dispatcher::new(keyring_core::SharedKeyring::from_manager(
        initialized_manager(),
    ));

    let get_key = [0, 0, 0, 1, OP_GET_PUBLIC_KEY, 0x00, 0x02];
    let mut sign = vec![0, 0, 0, 2, OP_SIGN_ECDSA, 0x00, 0x01];
    sign.extend_from_slice(&[0x3C; 32]);

    group.bench_function("get_public_key", |b| {
        b.iter(|| dispatcher.handle(black_box(&get_key)).expect("dispatch"))
    });
    group.bench_function("sign_ecdsa", |b| {
        b.iter(|| dispatcher.handle(black_box(&sign)).expect("dispatch"))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_encoding,
    bench_public_key,
    bench_signing,
    bench_dispatch
);
criterion_main!(benches);
