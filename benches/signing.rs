//! Signing and Cache Benchmarks
//!
//! Cost of forging a leaf versus serving it from the certificate caches, plus
//! header stripping on the plain HTTP path.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use http::HeaderMap;
use interpose::http1;
use interpose::mitm::{
    sign_host, CertStorage, CertificateAuthority, CounterRng, ExpiringCertStore, LruCertStore,
    SigningRequest,
};

/// Benchmark leaf signing for a few host set shapes
fn bench_sign_host(c: &mut Criterion) {
    let mut group = c.benchmark_group("sign_host");
    let ca = CertificateAuthority::bundled().unwrap();

    let single = SigningRequest::new(["example.com"]).unwrap();
    group.bench_function("single_domain", |b| {
        b.iter(|| sign_host(&ca, black_box(&single)).unwrap())
    });

    let mixed = SigningRequest::new(["example.com", "1.1.1.1", "www.example.com"]).unwrap();
    group.bench_function("domain_and_ip", |b| {
        b.iter(|| sign_host(&ca, black_box(&mixed)).unwrap())
    });

    group.finish();
}

/// Benchmark keystream throughput
fn bench_keystream(c: &mut Criterion) {
    let ca = CertificateAuthority::bundled().unwrap();
    let mut rng = CounterRng::new(ca.key_der(), b"bench").unwrap();
    let mut buf = vec![0u8; 4096];

    c.bench_function("keystream_4kb", |b| {
        b.iter(|| rng.fill(black_box(&mut buf)).unwrap())
    });
}

/// Benchmark cache hits against both store backends
fn bench_cached_fetch(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let ca = Arc::new(CertificateAuthority::bundled().unwrap());
    let request = SigningRequest::new(["cached.example"]).unwrap();
    let key = request.cache_key();
    let generate = || sign_host(&ca, &request).map(Arc::new);

    let stores: Vec<(&str, Arc<dyn CertStorage>)> = vec![
        (
            "expiring",
            Arc::new(ExpiringCertStore::new(Duration::from_secs(3600))),
        ),
        ("lru", Arc::new(LruCertStore::new(1024, None))),
    ];

    let mut group = c.benchmark_group("cached_fetch");
    for (name, store) in stores {
        // warm the entry so every iteration is a hit
        runtime.block_on(store.fetch(&key, &generate)).unwrap();

        group.bench_function(name, |b| {
            b.to_async(&runtime)
                .iter(|| async { store.fetch(black_box(&key), &generate).await.unwrap() })
        });
    }
    group.finish();
}

/// Benchmark hop-by-hop header stripping
fn bench_strip_headers(c: &mut Criterion) {
    let mut headers = HeaderMap::new();
    headers.insert("host", "example.com".parse().unwrap());
    headers.insert("user-agent", "bench".parse().unwrap());
    headers.insert("accept", "*/*".parse().unwrap());
    headers.insert("accept-encoding", "gzip, br".parse().unwrap());
    headers.insert("proxy-connection", "keep-alive".parse().unwrap());
    headers.insert("proxy-authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
    headers.insert("connection", "keep-alive, x-trace".parse().unwrap());
    headers.insert("x-trace", "1".parse().unwrap());

    c.bench_function("remove_proxy_headers", |b| {
        b.iter(|| {
            let mut copy = headers.clone();
            http1::remove_proxy_headers(black_box(&mut copy), false);
            copy
        })
    });
}

criterion_group!(
    benches,
    bench_sign_host,
    bench_keystream,
    bench_cached_fetch,
    bench_strip_headers
);
criterion_main!(benches);
