use rand::Rng;
use std::time::Duration;

/// Draws the next election timeout uniformly from `[base, base + jitter]`.
pub fn random_election_timeout(base: Duration, jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    let extra_ms = rand::thread_rng().gen_range(0..=jitter_ms);
    base + Duration::from_millis(extra_ms)
}
