//! Tests for the retry backoff schedule.

use kindred::outbox::backoff;

#[test]
fn backoff_grows_exponentially() {
    let base = 1_000;
    let cap = 300_000;
    for n in 0..4 {
        let shorter = backoff(n, base, cap);
        let longer = backoff(n + 2, base, cap);
        assert!(
            longer >= shorter,
            "attempt {} should wait at least as long as attempt {n}",
            n + 2
        );
    }
}

#[test]
fn backoff_respects_the_cap() {
    let capped = backoff(30, 1_000, 5_000);
    assert!(capped.num_milliseconds() <= 5_000);
}

#[test]
fn backoff_includes_the_exponential_floor() {
    // base * 2^3 = 8s; jitter only adds.
    let delay = backoff(3, 1_000, 300_000);
    assert!(delay.num_milliseconds() >= 8_000);
}

#[test]
fn zero_base_means_immediate_retry() {
    assert_eq!(backoff(5, 0, 1_000).num_milliseconds(), 0);
}
