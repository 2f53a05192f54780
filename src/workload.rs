use rand::Rng;
use rand_mt::Mt64;

pub const KEY_PREFIX: &str = "key";
pub const VALUE_PREFIX: &str = "value";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Get,
    Scan,
}

/// Seed for the private RNG stream of one worker thread. The primary of
/// group `c` draws from `seed + c`; its siblings draw from
/// `seed + c + sibling + 1` so no two threads share a stream.
pub fn thread_seed(seed: u64, group: usize, sibling: Option<usize>) -> u64 {
    let base = seed.wrapping_add(group as u64);
    match sibling {
        Some(s) => base.wrapping_add(s as u64 + 1),
        None => base,
    }
}

/// Deterministic per-thread workload stream: key/value text construction
/// plus the GET-vs-SCAN draw. Two generators built from the same seed yield
/// byte-identical sequences, which is what makes runs reproducible.
pub struct WorkloadGenerator {
    rng: Mt64,
    get_ratio: f64,
    key_width: usize,
    value_width: usize,
}

impl WorkloadGenerator {
    /// `key_size`/`value_size` must exceed their prefix lengths; the config
    /// layer rejects anything smaller before a generator is built.
    pub fn new(seed: u64, get_ratio: f64, key_size: usize, value_size: usize) -> Self {
        assert!(key_size > KEY_PREFIX.len());
        assert!(value_size > VALUE_PREFIX.len());
        WorkloadGenerator {
            rng: Mt64::new(seed),
            get_ratio,
            key_width: key_size - KEY_PREFIX.len(),
            value_width: value_size - VALUE_PREFIX.len(),
        }
    }

    /// One uniform draw in [0,1) per request, GET when below the ratio.
    pub fn classify(&mut self) -> RequestKind {
        if self.rng.gen::<f64>() < self.get_ratio {
            RequestKind::Get
        } else {
            RequestKind::Scan
        }
    }

    pub fn key(&self, index: usize) -> String {
        format!("{}{:0width$}", KEY_PREFIX, index, width = self.key_width)
    }

    pub fn value(&self, index: usize) -> String {
        format!("{}{:0width$}", VALUE_PREFIX, index, width = self.value_width)
    }
}
