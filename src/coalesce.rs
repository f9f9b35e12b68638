// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Keyed single-flight.
//!
//! Concurrent callers asking for the same key share one execution of the
//! work. The first caller becomes the leader and runs it; everyone arriving
//! while it runs parks on a `watch` channel and receives a clone of the
//! leader's result, success or failure alike.
//!
//! ```text
//!  caller A ──► entry vacant ──► insert rx ──► run f ──► send ──► remove
//!  caller B ──► entry occupied ──► wait_for(Some) ─────────┘
//! ```
//!
//! Entries live only while their flight is airborne, so the map stays as
//! small as the number of distinct keys currently being fetched.
//!
//! If a leader is dropped before publishing (its request was cancelled),
//! the sender goes away with it; parked followers see the channel close and
//! race for leadership again, so one of them re-runs the work.

use std::future::Future;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

/// Result of one [`InFlightGroup::run`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flight<V> {
    pub value: V,
    /// True when this caller joined someone else's execution.
    pub joined: bool,
}

enum Role<V> {
    Leader(watch::Sender<Option<V>>, watch::Receiver<Option<V>>),
    Follower(watch::Receiver<Option<V>>),
}

/// Removes the leader's entry when the flight lands or is abandoned.
struct Landing<'a, K: Eq + Hash, V> {
    calls: &'a DashMap<K, watch::Receiver<Option<V>>>,
    key: &'a K,
    own: watch::Receiver<Option<V>>,
}

impl<K: Eq + Hash, V> Drop for Landing<'_, K, V> {
    fn drop(&mut self) {
        self.calls
            .remove_if(self.key, |_, rx| rx.same_channel(&self.own));
    }
}

pub struct InFlightGroup<K, V> {
    calls: DashMap<K, watch::Receiver<Option<V>>>,
}

impl<K, V> Default for InFlightGroup<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> InFlightGroup<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Number of keys with a flight currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    /// Run `work` for `key`, or join the execution already running for it.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Flight<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        loop {
            // Shard lock is released before any await
            let role = match self.calls.entry(key.clone()) {
                Entry::Occupied(e) => Role::Follower(e.get().clone()),
                Entry::Vacant(e) => {
                    let (tx, rx) = watch::channel(None);
                    e.insert(rx.clone());
                    Role::Leader(tx, rx)
                }
            };

            match role {
                Role::Leader(tx, own) => {
                    let _landing = Landing {
                        calls: &self.calls,
                        key: &key,
                        own,
                    };
                    let value = work().await;
                    tx.send_replace(Some(value.clone()));
                    return Flight {
                        value,
                        joined: false,
                    };
                }
                Role::Follower(mut rx) => {
                    let published = match rx.wait_for(Option::is_some).await {
                        Ok(slot) => slot.clone(),
                        // Leader abandoned the flight
                        Err(_) => None,
                    };
                    if let Some(value) = published {
                        return Flight {
                            value,
                            joined: true,
                        };
                    }
                }
            }
        }
    }
}
