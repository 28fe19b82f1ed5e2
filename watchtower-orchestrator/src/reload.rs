// SPDX-License-Identifier: Apache-2.0

//! Configuration reload (design note: "Global configuration singleton").
//!
//! The source mutates a process-wide config object and fires post-update
//! hooks against that same global. This workspace instead holds an
//! immutable [`ConfigSnapshot`] and exposes one `reload` entry point that
//! produces a *new* snapshot and invokes every registered observer, in
//! registration order, with the new snapshot. There is no ambient mutable
//! global: whoever owns the [`ConfigReloader`] is responsible for swapping
//! their own reference to the current snapshot.

use std::sync::{Arc, Mutex};

use watchtower_common::ConfigSnapshot;

type Observer = Box<dyn Fn(&ConfigSnapshot) + Send + Sync>;

/// Holds the current snapshot and the list of observers to notify on
/// reload. Cloning shares the same underlying state.
#[derive(Clone)]
pub struct ConfigReloader {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    current: ConfigSnapshot,
    observers: Vec<Observer>,
}

impl ConfigReloader {
    pub fn new(initial: ConfigSnapshot) -> Self {
        ConfigReloader {
            inner: Arc::new(Mutex::new(Inner {
                current: initial,
                observers: Vec::new(),
            })),
        }
    }

    /// Registers an observer, called after every future `reload`. Observers
    /// already registered are never re-ordered; a newly registered observer
    /// is appended and thus runs after every observer registered before it.
    pub fn on_reload(&self, observer: impl Fn(&ConfigSnapshot) + Send + Sync + 'static) {
        #[allow(clippy::unwrap_used)]
        self.inner.lock().unwrap().observers.push(Box::new(observer));
    }

    pub fn current(&self) -> ConfigSnapshot {
        #[allow(clippy::unwrap_used)]
        self.inner.lock().unwrap().current.clone()
    }

    /// Produces a new snapshot via `build` (given the current one) and
    /// invokes every registered observer, in registration order, with the
    /// new snapshot before returning it.
    pub fn reload(
        &self,
        build: impl FnOnce(&ConfigSnapshot) -> ConfigSnapshot,
    ) -> ConfigSnapshot {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();
        let next = build(&inner.current);
        inner.current = next.clone();
        for observer in &inner.observers {
            observer(&next);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn observers_fire_in_registration_order_with_the_new_snapshot() {
        let reloader = ConfigReloader::new(ConfigSnapshot::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = order.clone();
            reloader.on_reload(move |_snapshot| {
                #[allow(clippy::unwrap_used)]
                order.lock().unwrap().push(label);
            });
        }
        reloader.reload(|current| {
            let mut next = current.clone();
            next.max_requests = 777;
            next
        });
        #[allow(clippy::unwrap_used)]
        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["first", "second", "third"]);
        assert_eq!(reloader.current().max_requests, 777);
    }

    #[test]
    fn reload_count_matches_number_of_calls() {
        let reloader = ConfigReloader::new(ConfigSnapshot::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        reloader.on_reload(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        reloader.reload(|c| c.clone());
        reloader.reload(|c| c.clone());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
