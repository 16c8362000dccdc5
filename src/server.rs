//! Remote ioserver registry and health-aware random selection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};

use rand::Rng;

/// Secrets longer than this are truncated at load time (spec.md §3, §9).
pub const MAX_SECRET_LEN: usize = 256;

/// One configured remote ioserver. Resolved once at startup and immutable
/// apart from the health counter.
pub struct ServerEntry {
    pub addr: SocketAddr,
    pub secret: Vec<u8>,
    health: AtomicI32,
}

impl ServerEntry {
    pub fn new(addr: SocketAddr, secret: &[u8]) -> Self {
        let truncated = if secret.len() > MAX_SECRET_LEN {
            &secret[..MAX_SECRET_LEN]
        } else {
            secret
        };
        ServerEntry {
            addr,
            secret: truncated.to_vec(),
            health: AtomicI32::new(0),
        }
    }

    pub fn health(&self) -> i32 {
        self.health.load(Ordering::Relaxed)
    }

    /// Penalize this entry after a failed connect attempt.
    pub fn mark_unhealthy(&self) {
        self.health.store(-10, Ordering::Relaxed);
    }

    fn bump_health(&self) {
        self.health.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixed-size table of remote servers, indexed by plain integer. The only
/// state shared across query tasks.
pub struct Registry {
    servers: Vec<ServerEntry>,
}

impl Registry {
    pub fn new(servers: Vec<ServerEntry>) -> Self {
        assert!(!servers.is_empty(), "registry must have at least one server");
        Registry { servers }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn get(&self, id: usize) -> &ServerEntry {
        &self.servers[id]
    }

    /// Draw a random healthy server index. Loops, incrementing the health
    /// of each rejected candidate, until one with `health >= 0` is found.
    /// Bounded at `len * 16` total rejections, after which the last
    /// candidate drawn is force-picked — the original's selector loop has no
    /// such bound and can spin forever if every entry is unavailable; this
    /// cap is the redesign's fix (spec.md §9 Open Questions).
    pub fn select_server(&self, rng: &mut impl Rng) -> usize {
        let len = self.servers.len();
        let max_rejections = len.saturating_mul(16);
        let mut rejections = 0usize;
        loop {
            let id = rng.gen_range(0..len);
            if self.servers[id].health() >= 0 {
                return id;
            }
            self.servers[id].bump_health();
            rejections += 1;
            if rejections >= max_rejections {
                return id;
            }
        }
    }
}
