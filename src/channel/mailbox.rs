//! Tagged mailbox of a session.
//!
//! See the [channel module] documentation since this is a private module anyways.
//!
//! [channel module]: crate::channel

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::Notify, time::sleep};

use crate::channel::{ChannelError, PartyId};

/// Holds the payloads received from one peer until they are taken, keyed by tag.
///
/// A tag holds at most one payload: a second payload under the same tag replaces the first one.
/// Taking a payload removes it.
pub struct Mailbox {
    peer: PartyId,
    slots: Mutex<HashMap<String, Bytes>>,
    arrived: Notify,
    closed: AtomicBool,
}

impl Mailbox {
    /// Creates an empty mailbox for payloads from `peer`.
    pub fn new(peer: PartyId) -> Self {
        Self {
            peer,
            slots: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Bytes>> {
        // the map is consistent after every operation, so a poisoned lock is still usable
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a payload under `tag` and wakes up the waiting receivers.
    pub fn put(&self, tag: String, payload: Bytes) {
        if self.slots().insert(tag.clone(), payload).is_some() {
            warn!(
                "payload from {} under tag {} replaced before it was taken",
                self.peer, tag
            );
        }
        self.arrived.notify_waiters();
    }

    /// Takes the payload stored under `tag`, if any.
    pub fn try_take(&self, tag: &str) -> Option<Bytes> {
        self.slots().remove(tag)
    }

    /// Waits until a payload is stored under `tag` and takes it.
    ///
    /// # Errors
    /// Fails if the mailbox is closed and no payload is stored under `tag`.
    pub async fn take(&self, tag: &str) -> Result<Bytes, ChannelError> {
        loop {
            // registered before checking, so a concurrent `put()` can't be missed
            let arrived = self.arrived.notified();
            if let Some(payload) = self.try_take(tag) {
                return Ok(payload);
            }
            if self.is_closed() {
                return Err(ChannelError::Closed(self.peer));
            }
            arrived.await;
        }
    }

    /// Polls the mailbox for the first of `tags` holding a payload.
    ///
    /// The mailbox is polled `retries` times, sleeping `interval` between two polls which found
    /// nothing. Returns the position of the tag in `tags` together with its payload, or `None` if
    /// all the polls came up empty.
    ///
    /// # Errors
    /// Fails if the mailbox is closed and none of `tags` holds a payload.
    pub async fn poll(
        &self,
        tags: &[&str],
        retries: u32,
        interval: Duration,
    ) -> Result<Option<(usize, Bytes)>, ChannelError> {
        for poll in 1..=retries {
            {
                let mut slots = self.slots();
                let hit = tags
                    .iter()
                    .enumerate()
                    .find_map(|(position, tag)| slots.remove(*tag).map(|p| (position, p)));
                if hit.is_some() {
                    return Ok(hit);
                }
            }
            if self.is_closed() {
                return Err(ChannelError::Closed(self.peer));
            }
            if poll < retries {
                sleep(interval).await;
            }
        }
        Ok(None)
    }

    /// Gets the number of payloads which have not been taken yet.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all payloads which have not been taken yet.
    pub fn clear(&self) {
        let dropped = {
            let mut slots = self.slots();
            let dropped = slots.len();
            slots.clear();
            dropped
        };
        if dropped > 0 {
            debug!("dropped {} untaken payloads from {}", dropped, self.peer);
        }
    }

    /// Closes the mailbox: no more payloads will arrive.
    ///
    /// Payloads stored before closing can still be taken.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.arrived.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
