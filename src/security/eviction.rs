//! Memory bounds for identity-keyed maps.
//!
//! Every component keeps one entry per identity ever seen. Two mechanisms keep
//! that bounded: a TTL sweep run by the background sweeper, and a hard cap
//! enforced on insert that evicts the least recently seen identity.

use dashmap::DashMap;

/// Drop entries whose last activity is older than `ttl_millis`.
/// Returns the number of removed entries.
pub fn sweep_idle<V>(
    map: &DashMap<String, V>,
    now: u64,
    ttl_millis: u64,
    last_seen: impl Fn(&V) -> u64,
) -> usize {
    let before = map.len();
    map.retain(|_, v| now.saturating_sub(last_seen(v)) < ttl_millis);
    before.saturating_sub(map.len())
}

/// Make room for `incoming` if the map is at capacity.
///
/// Must be called while holding no guard into `map`.
pub fn make_room<V>(
    map: &DashMap<String, V>,
    incoming: &str,
    capacity: usize,
    last_seen: impl Fn(&V) -> u64,
) -> Option<String> {
    if map.len() < capacity || map.contains_key(incoming) {
        return None;
    }

    let oldest = map
        .iter()
        .min_by_key(|entry| last_seen(entry.value()))
        .map(|entry| entry.key().clone())?;

    map.remove(&oldest);
    tracing::debug!(evicted = %oldest, capacity, "Identity map full, evicted least recently seen");
    Some(oldest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_idle() {
        let map: DashMap<String, u64> = DashMap::new();
        map.insert("old".into(), 0);
        map.insert("fresh".into(), 9_000);

        let removed = sweep_idle(&map, 10_000, 5_000, |v| *v);
        assert_eq!(removed, 1);
        assert!(map.contains_key("fresh"));
        assert!(!map.contains_key("old"));
    }

    #[test]
    fn test_make_room_evicts_oldest() {
        let map: DashMap<String, u64> = DashMap::new();
        map.insert("a".into(), 10);
        map.insert("b".into(), 5);

        assert_eq!(make_room(&map, "a", 2, |v| *v), None);
        assert_eq!(make_room(&map, "c", 2, |v| *v), Some("b".to_string()));
        assert_eq!(map.len(), 1);
        assert_eq!(make_room(&map, "c", 2, |v| *v), None);
    }
}
