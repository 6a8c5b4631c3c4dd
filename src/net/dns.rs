//! Process-wide DNS cache.
//!
//! Resolution itself is the blocking system resolver; results are cached
//! for 60 seconds per host so reconnect storms do not hammer it.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use log::trace;

const CACHE_TTL: Duration = Duration::from_secs(60);

struct CacheEntry {
    ip: IpAddr,
    created: Instant,
}

fn cache() -> &'static Mutex<HashMap<String, CacheEntry>> {
    static CACHE: OnceLock<Mutex<HashMap<String, CacheEntry>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Resolve `host` to one address, consulting the cache first.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    // Literal addresses skip both cache and resolver.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    {
        let cache = cache().lock().unwrap();
        if let Some(entry) = cache.get(host) {
            if entry.created.elapsed() < CACHE_TTL {
                return Ok(SocketAddr::new(entry.ip, port));
            }
        }
    }

    let resolved = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for host"))?;

    trace!("resolved {} -> {}", host, resolved.ip());
    cache().lock().unwrap().insert(
        host.to_string(),
        CacheEntry {
            ip: resolved.ip(),
            created: Instant::now(),
        },
    );
    Ok(SocketAddr::new(resolved.ip(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_addresses_bypass_resolver() {
        let addr = resolve("127.0.0.1", 80).unwrap();
        assert_eq!(addr, "127.0.0.1:80".parse().unwrap());

        let addr = resolve("::1", 80).unwrap();
        assert_eq!(addr, "[::1]:80".parse().unwrap());
    }

    #[test]
    fn localhost_resolves_and_is_cached() {
        let first = resolve("localhost", 1234).unwrap();
        assert_eq!(first.port(), 1234);
        let again = resolve("localhost", 5678).unwrap();
        assert_eq!(first.ip(), again.ip());
        assert!(cache().lock().unwrap().contains_key("localhost"));
    }
}
