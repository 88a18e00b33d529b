//! # Storefront Gateway Hot-Path Benchmarks
//!
//! | Component | Operation | Target |
//! |-----------|-----------|--------|
//! | Route table | resolve (12 rules, admin dispatch) | < 1µs |
//! | Circuit breaker | acquire + settle | < 1µs |
//! | Rate limiter | fixed-window check, 10k keys | < 1µs |
//! | Auth gate | HS256 verify | < 20µs |

use axum::http::Method;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use jsonwebtoken::{encode, EncodingKey, Header};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use storefront_gateway::domain::config::{AuthConfig, BreakerSettings};
use storefront_gateway::middleware::{AuthGate, CircuitBreaker, Claims, FixedWindowLimiter};
use storefront_gateway::router::{default_rules, RouteTable};
use storefront_gateway::{Principal, Role};

fn bench_route_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("route-table");
    let table = RouteTable::new("/api", default_rules());

    for path in ["/api/auth/login", "/api/shipping/rates/42", "/api/admin/reviews/9"] {
        group.bench_with_input(BenchmarkId::new("resolve", path), path, |b, path| {
            b.iter(|| black_box(table.resolve(&Method::GET, black_box(path)).is_ok()))
        });
    }
    group.bench_function("resolve_miss", |b| {
        b.iter(|| black_box(table.resolve(&Method::GET, "/api/nowhere").is_err()))
    });
    group.finish();
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit-breaker");
    let breaker = CircuitBreaker::new("order", BreakerSettings::default());

    group.bench_function("acquire_success", |b| {
        b.iter(|| {
            if let Some(permit) = breaker.try_acquire() {
                permit.success();
            }
        })
    });

    let contended = Arc::new(CircuitBreaker::new("payment", BreakerSettings::default()));
    group.throughput(Throughput::Elements(4 * 1_000));
    group.bench_function("acquire_success_4_threads", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let breaker = Arc::clone(&contended);
                    std::thread::spawn(move || {
                        for _ in 0..1_000 {
                            if let Some(permit) = breaker.try_acquire() {
                                permit.success();
                            }
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        })
    });
    group.finish();
}

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate-limiter");
    let limiter = FixedWindowLimiter::new(Duration::from_secs(900), u32::MAX);
    let keys: Vec<String> = (0..10_000).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();
    let mut rng = rand::thread_rng();

    group.bench_function("check_random_key", |b| {
        b.iter(|| {
            let key = &keys[rng.gen_range(0..keys.len())];
            black_box(limiter.check(key))
        })
    });
    group.bench_function("check_hot_key", |b| {
        b.iter(|| black_box(limiter.check("10.0.0.1")))
    });
    group.finish();
}

fn bench_auth_gate(c: &mut Criterion) {
    let mut group = c.benchmark_group("auth-gate");
    let config = AuthConfig {
        jwt_secret: "bench-secret".into(),
        leeway_secs: 0,
    };
    let gate = AuthGate::new(&config);
    let principal = Principal {
        id: "u-1".into(),
        email: "bench@example.com".into(),
        role: Role::Customer,
    };
    let token = encode(
        &Header::default(),
        &Claims::for_principal(&principal, 3600),
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .unwrap();

    group.bench_function("verify_hs256", |b| {
        b.iter(|| black_box(gate.verify(black_box(&token)).is_ok()))
    });
    group.bench_function("verify_bad_signature", |b| {
        let forged = format!("{}x", token);
        b.iter(|| black_box(gate.verify(&forged).is_err()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_route_resolution,
    bench_circuit_breaker,
    bench_rate_limiter,
    bench_auth_gate
);
criterion_main!(benches);
