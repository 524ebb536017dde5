use a2a_crypto::{aead, AgentSecretKey, Blake3Hash, SessionKeys};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

fn key_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_operations");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("keygen", |b| {
        b.iter(|| {
            let key = AgentSecretKey::generate();
            black_box(key);
        });
    });

    let alice = AgentSecretKey::generate();
    let bob = AgentSecretKey::generate().public_key();

    group.bench_function("diffie_hellman", |b| {
        b.iter(|| {
            let raw = alice.diffie_hellman(&bob).unwrap();
            black_box(raw);
        });
    });

    let raw = alice.diffie_hellman(&bob).unwrap();
    let salt = b"a2a-keyx/v1 bench salt";

    group.bench_function("derive_session_keys", |b| {
        b.iter(|| {
            let keys = SessionKeys::derive(&raw, salt).unwrap();
            black_box(keys);
        });
    });

    group.finish();
}

fn signature_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature_operations");
    group.measurement_time(Duration::from_secs(10));

    let key = AgentSecretKey::generate();
    let public_key = key.public_key();
    let message = b"test message for signing";

    group.bench_function("sign", |b| {
        b.iter(|| {
            let signature = key.sign(message);
            black_box(signature);
        });
    });

    let signature = key.sign(message);

    group.bench_function("verify", |b| {
        b.iter(|| {
            let result = public_key.verify(message, &signature);
            black_box(result);
        });
    });

    group.finish();
}

fn hash_and_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_and_seal");
    let seal_key = aead::generate_key();

    for size in [64usize, 1024, 16 * 1024].iter() {
        let data = vec![0x42u8; *size];

        group.bench_with_input(BenchmarkId::new("blake3", size), &data, |b, data| {
            b.iter(|| black_box(Blake3Hash::hash(data)));
        });

        group.bench_with_input(BenchmarkId::new("seal", size), &data, |b, data| {
            b.iter(|| black_box(aead::seal(&seal_key, data, b"aad").unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, key_operations, signature_operations, hash_and_seal);
criterion_main!(benches);
