use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;

use rime_types::PackageName;

/// A set of locks used to serialize mutations of the same cache entry.
#[derive(Debug, Default)]
pub struct Locks(Mutex<FxHashMap<String, Arc<Mutex<()>>>>);

impl Locks {
    /// Acquire the lock guarding the entry for `name`.
    pub async fn acquire(&self, name: &PackageName) -> Arc<Mutex<()>> {
        let mut map = self.0.lock().await;
        map.entry(name.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
