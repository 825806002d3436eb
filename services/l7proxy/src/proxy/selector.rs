//! Backend selection: sticky cookie first, then a random-start walk.

use rand::Rng;

use super::store::{BackendRecord, ServiceRecord};

/// Backends already attempted during the current request. Expected to stay
/// tiny (bounded by the attempt cap), so membership is a linear scan.
#[derive(Debug, Clone, Default)]
pub struct SkipSet(Vec<String>);

impl SkipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|entry| entry == id)
    }

    pub fn insert(&mut self, id: String) {
        self.0.push(id);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pick one backend for a request.
///
/// The sticky id is honored when it names a known backend that has not been
/// skipped. Otherwise the walk starts at a uniformly random position and
/// takes the first backend not in `skip`; a full wrap means every backend is
/// excluded and the request cannot proceed.
pub fn pick_backend(
    service: &ServiceRecord,
    sticky_id: &str,
    skip: &SkipSet,
) -> Option<BackendRecord> {
    let count = service.backends.len();
    if count == 0 {
        return None;
    }

    if !sticky_id.is_empty() && !skip.contains(sticky_id) {
        if let Some(backend) = service.backends_by_id.get(sticky_id) {
            return Some(backend.clone());
        }
    }

    let start = rand::rng().random_range(0..count);
    for offset in 0..count {
        let backend = &service.backends[(start + offset) % count];
        if !skip.contains(&backend.id) {
            return Some(backend.clone());
        }
    }
    None
}
