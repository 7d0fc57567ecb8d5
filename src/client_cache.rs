//! Client cache: authority → lazily-constructed upstream client, first
//! writer wins (spec §3 "Client cache", §5 "Shared-resource policy").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A cache mapping an authority (`host:port`) to a lazily-constructed
/// client `T`. Entries live for the job's lifetime; insertion is
/// first-writer-wins so concurrent lazy-initialization attempts never
/// produce duplicate pools for the same authority.
#[derive(Debug)]
pub struct ClientCache<T> {
    entries: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> Default for ClientCache<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> ClientCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached client for `authority`, constructing it with
    /// `build` if absent. If two callers race to construct for the same
    /// authority, the first insertion wins and the other's freshly built
    /// client is dropped in favor of the cached one.
    pub fn get_or_create(&self, authority: &str, build: impl FnOnce() -> T) -> Arc<T> {
        let mut entries = self.entries.lock().expect("client cache poisoned");
        if let Some(existing) = entries.get(authority) {
            return Arc::clone(existing);
        }
        let client = Arc::new(build());
        entries
            .entry(authority.to_string())
            .or_insert_with(|| Arc::clone(&client));
        Arc::clone(entries.get(authority).expect("just inserted"))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("client cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extract the `host:port` authority from a URL, suitable for keying a
/// [`ClientCache`]. Falls back to the whole string if it doesn't parse as a
/// URL with a host.
pub fn authority_of(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}
