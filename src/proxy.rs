//! Typed access to the session with one remote party.
//!
//! A [`PartyProxy`] encodes and decodes [`Value`]s on top of a [`Session`]. Sends either block the
//! caller until the peer acknowledged them ([`PartyProxy::remote()`]) or run in the background on
//! a bounded pool of send workers ([`PartyProxy::remote_async()`]), so that the caller can overlap
//! computation with transmission.
//!
//! Waiting for values is bounded: [`PartyProxy::get()`] polls the mailbox a fixed number of times
//! and returns `None` if the value did not arrive in time. The caller decides whether that aborts
//! the run.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing_futures::Instrument;

use crate::{
    channel::{ChannelError, PartyId, Session},
    message::{FromBytes, ToBytes, Value},
    settings::ChannelSettings,
};

/// The handle of a send running in the background.
pub struct SendHandle {
    remote: PartyId,
    tag: String,
    inner: JoinHandle<Result<(), ChannelError>>,
}

impl SendHandle {
    pub fn remote(&self) -> PartyId {
        self.remote
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Waits until the send has completed.
    ///
    /// # Errors
    /// Fails if the send failed, see [`PartyProxy::remote()`].
    pub async fn result(self) -> Result<(), ChannelError> {
        match self.inner.await {
            Ok(result) => result,
            Err(err) => Err(ChannelError::Worker(err.to_string())),
        }
    }
}

/// Sends values to and receives values from one remote party.
pub struct PartyProxy {
    session: Arc<Session>,
    workers: Arc<Semaphore>,
    poll_interval: Duration,
}

impl PartyProxy {
    /// Creates a proxy for the `session` whose background sends share the `workers`.
    pub fn new(session: Session, workers: Arc<Semaphore>, settings: &ChannelSettings) -> Self {
        Self {
            session: Arc::new(session),
            workers,
            poll_interval: settings.poll_interval(),
        }
    }

    /// Gets the identity of the remote party.
    pub fn party(&self) -> PartyId {
        self.session.remote()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Sends a value under `tag` and waits until the remote party has received it.
    ///
    /// # Errors
    /// Fails if the session is closed or the value is rejected.
    pub async fn remote(&self, value: &Value, tag: &str) -> Result<(), ChannelError> {
        debug!("sending {:?} to {} under {}", value.kind(), self.party(), tag);
        self.session.send(tag, Bytes::from(value.to_vec())).await
    }

    /// Sends a value under `tag` in the background.
    ///
    /// The send waits for a free worker before it starts. The returned handle resolves once the
    /// remote party has received the value.
    pub fn remote_async(&self, value: Value, tag: impl Into<String>) -> SendHandle {
        let tag = tag.into();
        let session = self.session.clone();
        let workers = self.workers.clone();
        let span = debug_span!("remote_async", remote = %self.party(), tag = %tag);
        let task_tag = tag.clone();
        let inner = tokio::spawn(
            async move {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .map_err(|_| ChannelError::Worker("the send workers are gone".to_string()))?;
                let payload = Bytes::from(value.to_vec());
                session.send(&task_tag, payload).await
            }
            .instrument(span),
        );
        SendHandle {
            remote: self.party(),
            tag,
            inner,
        }
    }

    /// Polls for the value under `tag` up to `retries` times.
    ///
    /// Returns `None` if the value did not arrive in time.
    ///
    /// # Errors
    /// Fails if the session is closed before the value arrived or the value can't be decoded.
    pub async fn get(&self, tag: &str, retries: u32) -> Result<Option<Value>, ChannelError> {
        Ok(self
            .get_first(&[tag], retries)
            .await?
            .map(|(_, value)| value))
    }

    /// Polls for the first of `tags` holding a value, up to `retries` times.
    ///
    /// Returns the position of the tag in `tags` together with the value, or `None` if none of the
    /// values arrived in time.
    ///
    /// # Errors
    /// Fails if the session is closed before a value arrived or the value can't be decoded.
    pub async fn get_first(
        &self,
        tags: &[&str],
        retries: u32,
    ) -> Result<Option<(usize, Value)>, ChannelError> {
        match self.session.poll(tags, retries, self.poll_interval).await? {
            Some((position, payload)) => {
                let value = Value::from_bytes(&payload).map_err(ChannelError::Decode)?;
                Ok(Some((position, value)))
            }
            None => {
                warn!(
                    "no value under {:?} from {} after {} polls",
                    tags,
                    self.party(),
                    retries
                );
                Ok(None)
            }
        }
    }

    /// Waits for the value under `tag` without a time limit.
    ///
    /// # Errors
    /// Fails if the session is closed before the value arrived or the value can't be decoded.
    pub async fn recv(&self, tag: &str) -> Result<Value, ChannelError> {
        let payload = self.session.recv(tag).await?;
        Value::from_bytes(&payload).map_err(ChannelError::Decode)
    }

    /// Stops the session with the remote party.
    pub async fn stop(&self) {
        self.session.stop().await
    }
}
