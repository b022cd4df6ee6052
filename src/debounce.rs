//! Keyed debounce: collapses a burst of events for the same key into a
//! single firing once the key has been quiet for `window` (spec.md §4.5,
//! §5, §8 property 7 — "keyed-debounce FIFO per appName").

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Debounces values keyed by `K`. Calling [`fire`](KeyedDebouncer::fire)
/// repeatedly for the same key within `window` only ever schedules the
/// latest value; once `window` passes with no further calls for that key,
/// the value is sent on the receiver returned by [`new`](KeyedDebouncer::new).
pub struct KeyedDebouncer<K, V> {
    window: Duration,
    generations: Arc<Mutex<HashMap<K, u64>>>,
    tx: mpsc::Sender<(K, V)>,
    shutdown: CancellationToken,
}

impl<K, V> Clone for KeyedDebouncer<K, V> {
    fn clone(&self) -> Self {
        Self {
            window: self.window,
            generations: self.generations.clone(),
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<K, V> KeyedDebouncer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn new(window: Duration, shutdown: CancellationToken) -> (Self, mpsc::Receiver<(K, V)>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                window,
                generations: Arc::new(Mutex::new(HashMap::new())),
                tx,
                shutdown,
            },
            rx,
        )
    }

    /// Record an occurrence for `key` carrying `value`, (re)starting the
    /// debounce window. Only the most recent `value` for a key survives to
    /// be delivered.
    pub async fn fire(&self, key: K, value: V) {
        let my_generation = {
            let mut generations = self.generations.lock().await;
            let counter = generations.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let generations = self.generations.clone();
        let tx = self.tx.clone();
        let window = self.window;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {}
                _ = shutdown.cancelled() => return,
            }

            let mut generations = generations.lock().await;
            if generations.get(&key) == Some(&my_generation) {
                generations.remove(&key);
                drop(generations);
                let _ = tx.send((key, value)).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collapses_a_burst_into_a_single_firing() {
        let (debouncer, mut rx) = KeyedDebouncer::new(Duration::from_millis(50), CancellationToken::new());

        debouncer.fire("web".to_string(), 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        debouncer.fire("web".to_string(), 2).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        debouncer.fire("web".to_string(), 3).await;

        let (key, value) = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "web");
        assert_eq!(value, 3);

        let nothing = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(nothing.is_err(), "expected exactly one firing per burst");
    }

    #[tokio::test]
    async fn independent_keys_fire_independently() {
        let (debouncer, mut rx) = KeyedDebouncer::new(Duration::from_millis(30), CancellationToken::new());
        debouncer.fire("a".to_string(), 1).await;
        debouncer.fire("b".to_string(), 2).await;

        let mut seen = std::collections::HashSet::new();
        for _ in 0..2 {
            let (key, _) = tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.insert(key);
        }
        assert!(seen.contains("a"));
        assert!(seen.contains("b"));
    }
}
