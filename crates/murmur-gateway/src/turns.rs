use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

type Turn = Arc<tokio::sync::Mutex<()>>;

/// One async lock per key, created on demand and dropped once idle.
/// Work under different keys never waits on each other.
#[derive(Clone, Default)]
pub(crate) struct Turns {
    held: Arc<Mutex<HashMap<Uuid, Turn>>>,
}

impl Turns {
    /// Run `work` while holding the turn for `key`.
    pub async fn take<F: Future>(&self, key: Uuid, work: F) -> F::Output {
        let turn = {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            held.entry(key).or_default().clone()
        };

        let output = {
            let _guard = turn.lock().await;
            work.await
        };

        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&turn) <= 2 {
            held.remove(&key);
        }
        output
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.held.lock().unwrap().is_empty()
    }
}
