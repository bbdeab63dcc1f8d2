use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use squall::crypto::{decrypt_data, encrypt_data, file_key};

pub fn sector_cipher_benchmark(c: &mut Criterion) {
    let key = file_key("units\\human\\footman.mdx");
    let sector: Vec<u8> = (0..4096u32).map(|i| (i * 7) as u8).collect();

    let mut group = c.benchmark_group("sector_cipher");
    group.throughput(Throughput::Bytes(sector.len() as u64));

    group.bench_function("encrypt_4k", |b| {
        b.iter(|| {
            let mut data = sector.clone();
            encrypt_data(&mut data, black_box(key));
            data
        })
    });

    group.bench_function("decrypt_4k", |b| {
        let mut encrypted = sector.clone();
        encrypt_data(&mut encrypted, key);

        b.iter(|| {
            let mut data = encrypted.clone();
            decrypt_data(&mut data, black_box(key));
            data
        })
    });

    group.finish();
}

pub fn key_derivation_benchmark(c: &mut Criterion) {
    c.bench_function("file_key", |b| {
        b.iter(|| file_key(black_box("units\\human\\footman.mdx")))
    });
}

criterion_group!(benches, sector_cipher_benchmark, key_derivation_benchmark);
criterion_main!(benches);
