use std::{collections::HashMap, net::SocketAddr};
use rand::Rng;
use crate::ID;

// Smoothing factors for the rolling averages.
const THROUGHPUT_ALPHA: f64 = 0.1;
const RELIABILITY_ALPHA: f64 = 0.05;
const RESPONSE_ALPHA: f64 = 0.1;

// Composite score weights.
const WEIGHT_THROUGHPUT: f64 = 0.4;
const WEIGHT_RELIABILITY: f64 = 0.3;
const WEIGHT_SUCCESS: f64 = 0.2;
const WEIGHT_LATENCY: f64 = 0.1;

// A peer this far gone is not worth reconnecting to.
const BLACKLIST_FAILURES: u32 = 10;
const BLACKLIST_RELIABILITY: f64 = 0.3;

// Random jitter added to scores during selection so the same peers are
// not picked forever.
const SELECTION_JITTER: f64 = 0.05;

// Peers are scored by peer id when one is known, otherwise by endpoint,
// so a peer that reappears under a new port keeps its record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SwarmKey {
    Id(ID),
    Addr(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct PeerScore {

    // Rolling average of observed block throughput, bytes per second.
    throughput: f64,

    // Fed by piece verification outcomes.
    reliability: f64,

    // Verified and failed pieces this peer contributed to.
    successes: u32,
    failures: u32,

    // Rolling average response time in seconds.
    response_time: f64,

}

impl Default for PeerScore {
    fn default() -> Self {
        Self {
            throughput: 0.0,
            // New peers start trusted; the average decays on bad pieces.
            reliability: 1.0,
            successes: 0,
            failures: 0,
            response_time: 0.0,
        }
    }
}

// Tracks per-peer quality across the swarm and picks which candidates to
// connect when more peers are known than the session budget allows.
#[derive(Debug, Default)]
pub struct SwarmSelector {
    scores: HashMap<SwarmKey, PeerScore>,
}

impl SwarmSelector {

    // Feed a one second throughput sample, in bytes.
    pub fn record_throughput(&mut self, key: SwarmKey, sample: u64) {
        let score = self.scores.entry(key).or_default();
        score.throughput =
            score.throughput * (1.0 - THROUGHPUT_ALPHA) + sample as f64 * THROUGHPUT_ALPHA;
    }

    // A piece this peer contributed to passed or failed verification.
    pub fn record_verification(&mut self, key: SwarmKey, ok: bool) {
        let score = self.scores.entry(key).or_default();
        let outcome = if ok { 1.0 } else { 0.0 };
        score.reliability =
            score.reliability * (1.0 - RELIABILITY_ALPHA) + outcome * RELIABILITY_ALPHA;
        if ok {
            score.successes += 1;
        } else {
            score.failures += 1;
        }
    }

    // Connect errors, protocol violations, timeouts.
    pub fn record_failure(&mut self, key: SwarmKey) {
        self.scores.entry(key).or_default().failures += 1;
    }

    pub fn record_response_time(&mut self, key: SwarmKey, seconds: f64) {
        let score = self.scores.entry(key).or_default();
        score.response_time =
            score.response_time * (1.0 - RESPONSE_ALPHA) + seconds * RESPONSE_ALPHA;
    }

    pub fn is_blacklisted(&self, key: &SwarmKey) -> bool {
        match self.scores.get(key) {
            Some(score) => {
                score.failures > BLACKLIST_FAILURES && score.reliability < BLACKLIST_RELIABILITY
            },
            None => false,
        }
    }

    // Composite score in [0, 1] plus jitter. Throughput is normalized
    // against the best peer currently known.
    fn score(&self, key: &SwarmKey, max_throughput: f64) -> f64 {
        let Some(score) = self.scores.get(key) else {
            // Unknown peers sit in the middle of the field.
            return 0.5;
        };

        let throughput = if max_throughput > 0.0 {
            score.throughput / max_throughput
        } else {
            0.0
        };
        let attempts = score.successes + score.failures;
        let success_ratio = if attempts > 0 {
            score.successes as f64 / attempts as f64
        } else {
            // Unproven, assume average.
            0.5
        };
        let latency = 1.0 / (1.0 + score.response_time);

        WEIGHT_THROUGHPUT * throughput
            + WEIGHT_RELIABILITY * score.reliability
            + WEIGHT_SUCCESS * success_ratio
            + WEIGHT_LATENCY * latency
    }

    // Picks up to `budget` candidates, best first. Blacklisted peers are
    // dropped; a small uniform jitter keeps the ordering from converging.
    pub fn select(&self, candidates: Vec<(SocketAddr, SwarmKey)>, budget: usize) -> Vec<SocketAddr> {

        let max_throughput = self
            .scores
            .values()
            .map(|s| s.throughput)
            .fold(0.0, f64::max);

        let mut rng = rand::thread_rng();
        let mut scored: Vec<(f64, SocketAddr)> = candidates
            .into_iter()
            .filter(|(_, key)| !self.is_blacklisted(key))
            .map(|(addr, key)| {
                let jitter = rng.gen_range(0.0..SELECTION_JITTER);
                (self.score(&key, max_throughput) + jitter, addr)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(budget).map(|(_, addr)| addr).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", n).parse().unwrap()
    }

    #[test]
    fn test_blacklist() {
        let mut swarm = SwarmSelector::default();
        let key = SwarmKey::Addr(addr(1));

        for _ in 0..11 {
            swarm.record_failure(key.clone());
        }
        // Failures alone don't blacklist while reliability holds up.
        assert!(!swarm.is_blacklisted(&key));

        for _ in 0..40 {
            swarm.record_verification(key.clone(), false);
        }
        assert!(swarm.is_blacklisted(&key));
    }

    #[test]
    fn test_reliability_drops_on_bad_piece() {
        let mut swarm = SwarmSelector::default();
        let key = SwarmKey::Id([7; 20]);
        swarm.record_verification(key.clone(), false);
        let after_one = swarm.scores[&key].reliability;
        assert!(after_one < 1.0);
        swarm.record_verification(key.clone(), false);
        assert!(swarm.scores[&key].reliability < after_one);
    }

    #[test]
    fn test_selection_prefers_throughput() {
        let mut swarm = SwarmSelector::default();
        let fast = SwarmKey::Addr(addr(1));
        let slow = SwarmKey::Addr(addr(2));
        for _ in 0..20 {
            swarm.record_throughput(fast.clone(), 100_000);
            swarm.record_throughput(slow.clone(), 100);
        }

        let picked = swarm.select(
            vec![(addr(2), slow.clone()), (addr(1), fast.clone())],
            1,
        );
        assert_eq!(picked, vec![addr(1)]);
    }

    #[test]
    fn test_selection_drops_blacklisted_and_respects_budget() {
        let mut swarm = SwarmSelector::default();
        let bad = SwarmKey::Addr(addr(9));
        for _ in 0..11 {
            swarm.record_failure(bad.clone());
        }
        for _ in 0..60 {
            swarm.record_verification(bad.clone(), false);
        }

        let candidates = (1..=9)
            .map(|n| (addr(n), SwarmKey::Addr(addr(n))))
            .collect();
        let picked = swarm.select(candidates, 4);
        assert_eq!(picked.len(), 4);
        assert!(!picked.contains(&addr(9)));
    }
}
