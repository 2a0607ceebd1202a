use criterion::{black_box, criterion_group, criterion_main, Criterion};
use elliptic_curve::ff::Field;
use k256::Secp256k1;
use keyshare_custody::{
    cipher::ShareCipher,
    compat::Ed25519,
    sss::{combine, split},
};
use rand_core::OsRng;

fn criterion_benchmark(c: &mut Criterion) {
    let (t, n) = (3, 5);

    let secret = k256::Scalar::random(&mut OsRng);
    c.bench_function("split secp256k1 (3,5)", |b| {
        b.iter(|| split::<Secp256k1>(&mut OsRng, black_box(&secret), t, n, 0).unwrap())
    });

    let shares = split::<Secp256k1>(&mut OsRng, &secret, t, n, 0).unwrap();
    c.bench_function("combine secp256k1 (3,5)", |b| {
        b.iter(|| combine::<Secp256k1>(black_box(&shares[..t]), t).unwrap())
    });

    let secret = curve25519_dalek::Scalar::random(&mut OsRng);
    let shares = split::<Ed25519>(&mut OsRng, &secret, t, n, 0).unwrap();
    c.bench_function("combine ed25519 (3,5)", |b| {
        b.iter(|| combine::<Ed25519>(black_box(&shares[..t]), t).unwrap())
    });

    let cipher = ShareCipher::new([7u8; 32]);
    let public_key = [2u8; 33];
    c.bench_function("seal and open share", |b| {
        b.iter(|| {
            let sealed = cipher.seal_share(black_box(&shares[0]), &public_key);
            cipher.open_share(&sealed, &public_key).unwrap()
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
