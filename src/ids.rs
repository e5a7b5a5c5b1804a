//! Request ids and short random tokens.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Shared monotonically increasing counter.
#[derive(Debug, Default)]
pub struct RequestCounter {
    value: AtomicU64,
}

impl RequestCounter {
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    /// Add `num` and return the new value.
    pub fn increment(&self, num: u64) -> u64 {
        self.value.fetch_add(num, Ordering::SeqCst) + num
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Random lowercase ASCII string, used for session and download names.
pub fn random_string(length: usize) -> String {
    random_string_with(&mut rand::rng(), length)
}

pub fn random_string_with<R: Rng + ?Sized>(rng: &mut R, length: usize) -> String {
    (0..length)
        .map(|_| char::from(TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_increments_are_not_lost() {
        let counter = Arc::new(RequestCounter::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..250 {
                        counter.increment(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 1000);
        assert_eq!(counter.increment(5), 1005);
    }

    #[test]
    fn random_strings_are_lowercase() {
        let mut rng = StdRng::seed_from_u64(7);
        let token = random_string_with(&mut rng, 12);
        assert_eq!(token.len(), 12);
        assert!(token.chars().all(|c| c.is_ascii_lowercase()));
        assert_eq!(random_string(0), "");
    }
}
