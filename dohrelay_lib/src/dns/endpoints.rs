use std::sync::atomic::{AtomicUsize, Ordering};

/// Immutable upstream endpoint list with a rotating cursor. `next()` is
/// strict round-robin and safe to call from any number of tasks; a
/// single-endpoint ring never touches the counter.
#[derive(Debug)]
pub struct EndpointRing {
    endpoints: Vec<String>,
    cursor: AtomicUsize,
}

impl EndpointRing {
    /// `endpoints` must be non-empty; the caller validates this at
    /// configuration time.
    pub fn new(endpoints: Vec<String>) -> Self {
        debug_assert!(!endpoints.is_empty());
        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn next(&self) -> &str {
        if self.endpoints.len() == 1 {
            return &self.endpoints[0];
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[i]
    }
}
