//! Connection identity generation.
//!
//! A hash is a short numeric string identifying a logical session,
//! independent of the physical transport underneath it. Hashes are built
//! from random two-digit groups and checked for uniqueness against every
//! identifier the registry currently knows — live connections, queues, and
//! remembered disconnected hashes.

use rand::Rng;

/// Length of a connection hash in characters.
pub const HASH_LEN: usize = 8;

/// Generate one candidate hash: random two-digit groups concatenated until
/// the string reaches [`HASH_LEN`].
pub fn generate_hash() -> String {
    let mut rng = rand::rng();
    let mut hash = String::with_capacity(HASH_LEN);
    while hash.len() < HASH_LEN {
        let group: u8 = rng.random_range(0..100);
        hash.push_str(&format!("{group:02}"));
    }
    hash
}

/// Generate a hash that `is_taken` rejects for every identifier currently
/// in use.
///
/// Collisions are resolved by regenerating in a loop. There is no retry
/// cap; with an 8-digit space a collision streak long enough to matter
/// would mean the registry is tracking an implausible number of sessions.
/// The attempt count is logged for diagnostics.
pub fn unique_hash<F>(is_taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    let mut attempts: u32 = 0;
    loop {
        let hash = generate_hash();
        if !is_taken(&hash) {
            if attempts > 0 {
                tracing::debug!(attempts, "hash collision resolved by regeneration");
            }
            return hash;
        }
        attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_hash_is_eight_digits() {
        for _ in 0..100 {
            let hash = generate_hash();
            assert_eq!(hash.len(), HASH_LEN);
            assert!(hash.chars().all(|c| c.is_ascii_digit()), "non-digit in {hash}");
        }
    }

    #[test]
    fn test_unique_hash_avoids_known_set() {
        let mut used = HashSet::new();
        for _ in 0..1000 {
            let hash = unique_hash(|h| used.contains(h));
            assert!(used.insert(hash), "generator produced a duplicate");
        }
    }

    #[test]
    fn test_unique_hash_regenerates_on_collision() {
        // Reject the first candidate the generator would settle on by
        // rejecting everything below a prefix; the loop must still finish.
        let hash = unique_hash(|h| h.starts_with('0'));
        assert!(!hash.starts_with('0'));
        assert_eq!(hash.len(), HASH_LEN);
    }
}
