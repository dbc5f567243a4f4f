//! Benchmarks for the rate limiting hot path
//!
//! This benchmark measures:
//! - Raw token bucket consume/refill cost
//! - Limiter consume under lock
//! - Adaptation from quota headers
//! - Error classification over message text

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dashboard_resilience::error_kind::ErrorKind;
use dashboard_resilience::resilience::rate_limiter::{
    RateLimitSignal, RateLimiter, RateLimiterConfig,
};
use dashboard_resilience::resilience::token_bucket::TokenBucket;
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;
use tokio::time::Instant;

fn bench_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_bucket");

    group.bench_function("try_consume", |b| {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(100.0, 2.0, start);
        let mut now = start;
        b.iter(|| {
            now += Duration::from_millis(10);
            black_box(bucket.try_consume(black_box(1.0), now))
        })
    });

    group.bench_function("estimated_wait_ms", |b| {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(50.0, 1.0, now);
        bucket.drain(now);
        b.iter(|| black_box(bucket.estimated_wait_ms(black_box(7.0), now)))
    });

    group.finish();
}

fn bench_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");

    for cost in [1u32, 5, 25] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("consume_token", cost), &cost, |b, &cost| {
            let limiter = RateLimiter::new(
                RateLimiterConfig::new()
                    .with_capacity(100)
                    .with_refill_rate(2.0),
            );
            b.iter(|| {
                if !limiter.consume_token(cost) {
                    limiter.reset_tokens();
                }
            })
        });
    }

    let mut headers = HeaderMap::new();
    headers.insert("x-ratelimit-remaining", HeaderValue::from_static("50"));
    headers.insert("x-ratelimit-limit", HeaderValue::from_static("100"));
    group.bench_function("adapt_from_headers", |b| {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        b.iter(|| {
            let signal = RateLimitSignal::from_headers(200, black_box(&headers));
            limiter.adapt_rate_limit(&signal);
        })
    });

    group.finish();
}

fn bench_classification(c: &mut Criterion) {
    let messages = [
        "read ECONNRESET",
        "JWT expired",
        "new row violates row-level security policy for table \"projects\"",
        "TypeError: Cannot read properties of undefined (reading 'map')",
    ];
    c.bench_function("error_kind_from_message", |b| {
        b.iter(|| {
            for m in &messages {
                black_box(ErrorKind::from_message(black_box(m)));
            }
        })
    });
}

criterion_group!(benches, bench_bucket, bench_limiter, bench_classification);
criterion_main!(benches);
