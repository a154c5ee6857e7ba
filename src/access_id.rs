//! Derives stable 8-character tunnel identifiers from a client's
//! remote address, caching by IP for 12 hours so repeat connections
//! from the same peer keep their subdomain.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 8;
const CACHE_TTL: Duration = Duration::from_secs(12 * 60 * 60);

pub struct AccessIdAllocator {
    cache: Mutex<HashMap<IpAddr, (String, Instant)>>,
}

impl AccessIdAllocator {
    pub fn new() -> Self {
        AccessIdAllocator {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates an access id for `remote`, consulting the IP cache
    /// first. The caller is still responsible for checking the id is
    /// free in the session registry and retrying on collision.
    pub fn allocate(&self, remote: &SocketAddr) -> String {
        let ip = remote.ip();
        let now = Instant::now();
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some((id, expires_at)) = cache.get(&ip) {
                if *expires_at > now {
                    return id.clone();
                }
            }
            let fresh = Self::generate();
            cache.insert(ip, (fresh.clone(), now + CACHE_TTL));
            fresh
        }
    }

    /// Generates a fresh id, bypassing the cache entirely.
    pub fn generate() -> String {
        let mut rng = rand::thread_rng();
        (0..ID_LEN)
            .map(|_| ALPHANUMERIC[rng.gen_range(0, ALPHANUMERIC.len())] as char)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_eight_lowercase_alphanumeric_chars() {
        for _ in 0..50 {
            let id = AccessIdAllocator::generate();
            assert_eq!(id.len(), ID_LEN);
            assert!(id.bytes().all(|b| ALPHANUMERIC.contains(&b)));
        }
    }

    #[test]
    fn same_ip_reuses_cached_id_within_ttl() {
        let allocator = AccessIdAllocator::new();
        let addr: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        let first = allocator.allocate(&addr);
        let second = allocator.allocate(&addr);
        assert_eq!(first, second);
    }

    #[test]
    fn different_ips_are_independent() {
        let allocator = AccessIdAllocator::new();
        let a: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        let b: SocketAddr = "203.0.113.10:4000".parse().unwrap();
        // Not guaranteed distinct by construction, but the cache entries are.
        allocator.allocate(&a);
        allocator.allocate(&b);
        let cache = allocator.cache.lock().unwrap();
        assert_eq!(cache.len(), 2);
    }
}
