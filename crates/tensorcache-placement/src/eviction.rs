//! Victim selection for watermark eviction.

use std::time::Instant;

/// An evictable object as seen by the strategy.
///
/// The master pre-filters candidates: only entries with an expired lease
/// and all replicas complete are offered.
#[derive(Clone, Debug)]
pub struct EvictionCandidate {
    /// Object key
    pub key: String,
    /// Total object size in bytes
    pub size: u64,
    /// When the object's lease expired (or would have)
    pub lease_deadline: Instant,
}

/// Chooses victims among eviction candidates.
pub trait EvictionStrategy: Send + Sync {
    /// Select victim keys whose combined size reaches `target_bytes`, or
    /// as close as the candidate set allows. Selection order is up to the
    /// strategy.
    fn select_victims(&self, candidates: &[EvictionCandidate], target_bytes: u64) -> Vec<String>;
}

/// Evict the least-recently-leased objects first.
///
/// The lease deadline doubles as a last-read timestamp: every successful
/// read pushes it forward, so the oldest deadline belongs to the coldest
/// object.
#[derive(Debug, Default, Clone, Copy)]
pub struct LruEviction;

impl EvictionStrategy for LruEviction {
    fn select_victims(&self, candidates: &[EvictionCandidate], target_bytes: u64) -> Vec<String> {
        if target_bytes == 0 || candidates.is_empty() {
            return Vec::new();
        }
        let mut ordered: Vec<&EvictionCandidate> = candidates.iter().collect();
        ordered.sort_by_key(|c| c.lease_deadline);

        let mut victims = Vec::new();
        let mut freed = 0u64;
        for candidate in ordered {
            if freed >= target_bytes {
                break;
            }
            freed += candidate.size;
            victims.push(candidate.key.clone());
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn create_test_candidates() -> Vec<EvictionCandidate> {
        let now = Instant::now();
        vec![
            EvictionCandidate {
                key: "warm".into(),
                size: 100,
                lease_deadline: now + Duration::from_millis(10),
            },
            EvictionCandidate {
                key: "cold".into(),
                size: 100,
                lease_deadline: now,
            },
            EvictionCandidate {
                key: "hot".into(),
                size: 100,
                lease_deadline: now + Duration::from_secs(60),
            },
        ]
    }

    #[test]
    fn test_oldest_lease_first() {
        let candidates = create_test_candidates();
        let victims = LruEviction.select_victims(&candidates, 1);
        assert_eq!(victims, vec!["cold".to_string()]);
    }

    #[test]
    fn test_stops_at_target() {
        let candidates = create_test_candidates();
        let victims = LruEviction.select_victims(&candidates, 150);
        assert_eq!(victims, vec!["cold".to_string(), "warm".to_string()]);
    }

    #[test]
    fn test_target_beyond_candidates_takes_all() {
        let candidates = create_test_candidates();
        let victims = LruEviction.select_victims(&candidates, 10_000);
        assert_eq!(victims.len(), 3);
    }

    #[test]
    fn test_zero_target_selects_nothing() {
        let candidates = create_test_candidates();
        assert!(LruEviction.select_victims(&candidates, 0).is_empty());
        assert!(LruEviction.select_victims(&[], 100).is_empty());
    }
}
