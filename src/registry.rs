//! Process-wide mapping from access id to its [`Forwarder`], the single
//! source of truth for which tunnels are currently live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::forwarder::Forwarder;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Forwarder>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts `forwarder` under `id` only if the id is not already
    /// taken. Returns whether the insert happened.
    pub fn try_insert(&self, id: String, forwarder: Arc<Forwarder>) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&id) {
            false
        } else {
            sessions.insert(id, forwarder);
            true
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Forwarder>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::events::ExchangeSink;

    fn dummy_forwarder() -> Arc<Forwarder> {
        let (sink, _rx) = ExchangeSink::new(2);
        Arc::new(Forwarder::new_for_test(
            "127.0.0.1".to_string(),
            0,
            CancelToken::new(),
            sink,
        ))
    }

    #[test]
    fn try_insert_rejects_duplicate_key() {
        let registry = SessionRegistry::new();
        assert!(registry.try_insert("abc12345".into(), dummy_forwarder()));
        assert!(!registry.try_insert("abc12345".into(), dummy_forwarder()));
    }

    #[test]
    fn get_returns_same_forwarder_until_removed() {
        let registry = SessionRegistry::new();
        let fwd = dummy_forwarder();
        registry.try_insert("abc12345".into(), fwd.clone());
        assert!(Arc::ptr_eq(&registry.get("abc12345").unwrap(), &fwd));
        registry.remove("abc12345");
        assert!(registry.get("abc12345").is_none());
    }
}
