//! Server-wide table of outstanding Digest challenges.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::md5::md5_hex;

/// How long an issued nonce stays valid if nobody answers it.
pub const NONCE_LIFETIME: Duration = Duration::from_secs(60 * 5);

#[derive(Debug, Default)]
struct Table {
    counter: u64,
    issued: HashMap<String, SystemTime>,
}

/// Single-use nonces. Insert and remove happen under one lock, so two connections can never
/// consume the same challenge.
#[derive(Debug, Default)]
pub struct NonceTable {
    table: Mutex<Table>,
}

impl NonceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue and register a fresh nonce.
    pub fn generate(&self, peer: Option<IpAddr>, now: SystemTime) -> String {
        let mut table = self.lock();
        table.counter += 1;
        let stamp = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let peer = peer.map(|ip| ip.to_string()).unwrap_or_default();
        let nonce = md5_hex(&[
            table.counter.to_string().as_bytes(),
            b":",
            stamp.to_string().as_bytes(),
            b":",
            peer.as_bytes(),
        ]);
        table.issued.insert(nonce.clone(), now);
        tracing::trace!("issued nonce {} ({} outstanding)", nonce, table.issued.len());
        nonce
    }

    /// Consume a nonce. Returns false if it was never issued or has already been used.
    pub fn remove(&self, nonce: &[u8]) -> bool {
        let nonce = match std::str::from_utf8(nonce) {
            Ok(nonce) => nonce,
            Err(_) => return false,
        };
        self.lock().issued.remove(nonce).is_some()
    }

    /// Forget challenges issued more than `lifetime` before `now`.
    pub fn purge(&self, now: SystemTime, lifetime: Duration) -> usize {
        let mut table = self.lock();
        let before = table.issued.len();
        table.issued.retain(|_, issued| {
            now.duration_since(*issued)
                .map(|age| age < lifetime)
                .unwrap_or(true)
        });
        before - table.issued.len()
    }

    pub fn len(&self) -> usize {
        self.lock().issued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nonces_are_single_use() {
        let table = NonceTable::new();
        let now = SystemTime::now();
        let nonce = table.generate(Some(IpAddr::from([127, 0, 0, 1])), now);
        assert_eq!(nonce.len(), 32);
        assert!(table.remove(nonce.as_bytes()));
        assert!(!table.remove(nonce.as_bytes()));
        assert!(!table.remove(b"not-a-nonce"));
    }

    #[test]
    fn nonces_are_unique() {
        let table = NonceTable::new();
        let now = SystemTime::now();
        let a = table.generate(None, now);
        let b = table.generate(None, now);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn purge_drops_expired() {
        let table = NonceTable::new();
        let then = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let old = table.generate(None, then);
        let fresh = table.generate(None, then + Duration::from_secs(100));
        assert_eq!(table.purge(then + Duration::from_secs(120), Duration::from_secs(60)), 1);
        assert!(!table.remove(old.as_bytes()));
        assert!(table.remove(fresh.as_bytes()));
    }
}
