//! Named mutual exclusion.
//!
//! Holders of the same name serialize; holders of different names never block each
//! other. A lock is released when its guard is dropped, on every exit path.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

pub trait NamedLock: Send + Sync {
    /// Blocks until `name` is free, then holds it until the returned guard drops.
    ///
    /// # Errors
    /// Returns an error when the lock backend cannot grant the lock.
    fn acquire(&self, name: &str) -> anyhow::Result<NamedLockGuard<'_>>;
}

impl<T: NamedLock + ?Sized> NamedLock for Arc<T> {
    fn acquire(&self, name: &str) -> anyhow::Result<NamedLockGuard<'_>> {
        (**self).acquire(name)
    }
}

/// Holds a named lock; dropping it releases the name.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct NamedLockGuard<'a> {
    name: String,
    release: Option<Box<dyn FnOnce() + Send + 'a>>,
}

impl<'a> NamedLockGuard<'a> {
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + 'a) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for NamedLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLockGuard")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// In-process [`NamedLock`] keyed by name.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl KeyedLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_held(&self, name: &str) -> bool {
        self.held.lock().contains(name)
    }

    fn release(&self, name: &str) {
        let mut held = self.held.lock();
        held.remove(name);
        drop(held);
        self.released.notify_all();
    }
}

impl NamedLock for KeyedLocks {
    fn acquire(&self, name: &str) -> anyhow::Result<NamedLockGuard<'_>> {
        let mut held = self.held.lock();
        while held.contains(name) {
            self.released.wait(&mut held);
        }
        held.insert(name.to_string());
        drop(held);

        let key = name.to_string();
        Ok(NamedLockGuard::new(name, move || self.release(&key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn guard_drop_releases_the_name() {
        let locks = KeyedLocks::new();
        {
            let guard = must(locks.acquire("run:a"));
            assert_eq!(guard.name(), "run:a");
            assert!(locks.is_held("run:a"));
        }
        assert!(!locks.is_held("run:a"));
    }

    #[test]
    fn different_names_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = must(locks.acquire("run:a"));
        let _b = must(locks.acquire("run:b"));
        assert!(locks.is_held("run:a"));
        assert!(locks.is_held("run:b"));
    }

    #[test]
    fn same_name_waits_for_release() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = must(locks.acquire("run:a"));
        let (tx, rx) = mpsc::channel();

        let contender = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let _guard = must(locks.acquire("run:a"));
                let _ = tx.send(());
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(contender.join().is_ok());
    }

    #[test]
    fn critical_sections_never_overlap() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let overlaps = Arc::clone(&overlaps);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = must(locks.acquire("run:shared"));
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for worker in workers {
            assert!(worker.join().is_ok());
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
