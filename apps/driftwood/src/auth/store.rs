use parking_lot::Mutex;
use std::collections::HashMap;

/// Injected key-value capability for the persisted participation token.
///
/// The browser build backs this with session storage; the in-memory
/// implementation below is session-scoped in the same sense: it lives as
/// long as the process and is never written to disk.
pub trait TokenStore: Send + Sync {
    fn get(&self, discussion_id: &str) -> Option<String>;
    fn set(&self, discussion_id: &str, token: &str);
    fn delete(&self, discussion_id: &str);
}

fn storage_key(discussion_id: &str) -> String {
    format!("driftwood.participation.{discussion_id}")
}

#[derive(Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, discussion_id: &str) -> Option<String> {
        self.entries.lock().get(&storage_key(discussion_id)).cloned()
    }

    fn set(&self, discussion_id: &str, token: &str) {
        self.entries
            .lock()
            .insert(storage_key(discussion_id), token.to_string());
    }

    fn delete(&self, discussion_id: &str) {
        self.entries.lock().remove(&storage_key(discussion_id));
    }
}
