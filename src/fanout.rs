//! Sessions with all the other parties of a run.
//!
//! A [`FanoutClient`] holds one [`PartyProxy`] per remote party, ordered by [`PartyId`]. This is
//! the registration order: every operation which touches several parties visits them in that order,
//! independently of when their values arrive.
//!
//! Values are sent and received under logical keys. Sends use the tag `<local role>_<key>`, and
//! values from a party are expected under `<remote role>_<key>`, see [`tag()`].
//!
//! Sends to several parties are not atomic. A failing send ends the fanout and leaves the remaining
//! parties without the value, it is up to the caller to abort the run.

use std::sync::Arc;

use futures::future;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::{
    channel::{ChannelError, Endpoint, PartyId, Session, SessionListener, TaskContext},
    message::{tag, Value},
    proxy::PartyProxy,
    settings::ChannelSettings,
};

/// The key under which a party announces that it aborts the run.
pub const ABORT_KEY: &str = "abort";

#[derive(Debug, Error)]
/// Errors related to the communication with several parties.
pub enum FanoutError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("expected one value for each of the {expected} parties, got {actual}")]
    DistinctLength { expected: usize, actual: usize },

    #[error("{0} is not a party of this run")]
    UnknownParty(PartyId),

    #[error("no value under {tag} from {party} in time")]
    Timeout { party: PartyId, tag: String },

    #[error("{party} aborted the run: {reason}")]
    Aborted { party: PartyId, reason: String },
}

/// The proxies to all the other parties of a run.
pub struct FanoutClient {
    local: PartyId,
    proxies: Vec<PartyProxy>,
    get_retries: u32,
}

impl FanoutClient {
    /// Opens sessions with all `peers`.
    ///
    /// The `local` endpoint is bound if the local party has to accept any of the peers.
    ///
    /// # Errors
    /// Fails if binding the local endpoint or opening any of the sessions fails.
    pub async fn connect(
        local: &Endpoint,
        peers: &[Endpoint],
        context: TaskContext,
        settings: &ChannelSettings,
    ) -> Result<Self, ChannelError> {
        let party = local.party();
        let listener = if peers.iter().any(|peer| party.accepts(&peer.party())) {
            Some(SessionListener::bind(local, context.clone(), settings).await?)
        } else {
            None
        };
        Self::connect_with(party, listener, peers, context, settings).await
    }

    /// Opens sessions with all `peers`, accepting the ones which order after the `local` party on
    /// the given `listener`.
    ///
    /// Accepting and connecting run concurrently. An endpoint of the local party among the `peers`
    /// is skipped.
    ///
    /// # Errors
    /// Fails if opening any of the sessions fails, or if sessions must be accepted without a
    /// `listener`.
    pub async fn connect_with(
        local: PartyId,
        listener: Option<SessionListener>,
        peers: &[Endpoint],
        context: TaskContext,
        settings: &ChannelSettings,
    ) -> Result<Self, ChannelError> {
        let (to_accept, to_connect): (Vec<&Endpoint>, Vec<&Endpoint>) = peers
            .iter()
            .filter(|peer| peer.party() != local)
            .partition(|peer| local.accepts(&peer.party()));
        let expected: Vec<PartyId> = to_accept.iter().map(|peer| peer.party()).collect();

        let accepting = async {
            match &listener {
                _ if expected.is_empty() => Ok(Vec::new()),
                Some(listener) => listener.accept_all(&expected).await,
                None => Err(ChannelError::NoListener(local)),
            }
        };
        let connecting = future::try_join_all(
            to_connect
                .iter()
                .map(|peer| Session::connect(local, peer, context.clone(), settings)),
        );
        let (accepted, connected) = future::try_join(accepting, connecting).await?;

        let workers = Arc::new(Semaphore::new(settings.send_workers as usize));
        let mut proxies: Vec<PartyProxy> = accepted
            .into_iter()
            .chain(connected)
            .map(|session| PartyProxy::new(session, workers.clone(), settings))
            .collect();
        proxies.sort_by_key(PartyProxy::party);
        info!(
            "{} connected to {} parties for {}",
            local,
            proxies.len(),
            context
        );

        Ok(Self {
            local,
            proxies,
            get_retries: settings.get_retries,
        })
    }

    pub fn local(&self) -> PartyId {
        self.local
    }

    /// Gets the remote parties in registration order.
    pub fn parties(&self) -> Vec<PartyId> {
        self.proxies.iter().map(PartyProxy::party).collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn proxies(&self) -> &[PartyProxy] {
        &self.proxies
    }

    /// Gets the proxy of a remote party.
    ///
    /// # Errors
    /// Fails if there is no session with the party.
    pub fn proxy(&self, party: PartyId) -> Result<&PartyProxy, FanoutError> {
        self.proxies
            .iter()
            .find(|proxy| proxy.party() == party)
            .ok_or(FanoutError::UnknownParty(party))
    }

    /// Sends the `value` under `key` to every party, one after the other.
    ///
    /// # Errors
    /// Fails on the first failing send. The remaining parties don't get the value.
    pub async fn send_all(&self, key: &str, value: &Value) -> Result<(), FanoutError> {
        let tag = tag(self.local.role, key);
        for proxy in &self.proxies {
            proxy.remote(value, &tag).await?;
        }
        Ok(())
    }

    /// Sends the `value` under `key` to the parties in `subset`, one after the other.
    ///
    /// # Errors
    /// Fails without sending anything if a party of the `subset` is unknown. Fails on the first
    /// failing send otherwise.
    pub async fn send_selected(
        &self,
        key: &str,
        value: &Value,
        subset: &[PartyId],
    ) -> Result<(), FanoutError> {
        let proxies = subset
            .iter()
            .map(|party| self.proxy(*party))
            .collect::<Result<Vec<_>, _>>()?;
        let tag = tag(self.local.role, key);
        for proxy in proxies {
            proxy.remote(value, &tag).await?;
        }
        Ok(())
    }

    /// Sends one of the `values` under `key` to each party, in registration order.
    ///
    /// # Errors
    /// Fails without sending anything if there is not exactly one value per party. Fails on the
    /// first failing send otherwise.
    pub async fn send_distinct(&self, key: &str, values: Vec<Value>) -> Result<(), FanoutError> {
        if values.len() != self.proxies.len() {
            return Err(FanoutError::DistinctLength {
                expected: self.proxies.len(),
                actual: values.len(),
            });
        }
        let tag = tag(self.local.role, key);
        for (proxy, value) in self.proxies.iter().zip(values) {
            proxy.remote(&value, &tag).await?;
        }
        Ok(())
    }

    /// Waits for the value under `key` from the `party`.
    ///
    /// # Errors
    /// Fails if the value does not arrive in time, if the party aborts the run meanwhile or if the
    /// session fails.
    pub async fn recv_from(&self, party: PartyId, key: &str) -> Result<Value, FanoutError> {
        let proxy = self.proxy(party)?;
        let expected = tag(party.role, key);
        let abort = tag(party.role, ABORT_KEY);
        match proxy
            .get_first(&[expected.as_str(), abort.as_str()], self.get_retries)
            .await?
        {
            Some((0, value)) => Ok(value),
            Some((_, Value::Abort(reason))) => Err(FanoutError::Aborted { party, reason }),
            Some((_, value)) => Err(FanoutError::Aborted {
                party,
                reason: format!("{:?}", value),
            }),
            None => Err(FanoutError::Timeout {
                party,
                tag: expected,
            }),
        }
    }

    /// Waits for the value under `key` from every party.
    ///
    /// The values are gathered and returned in registration order.
    ///
    /// # Errors
    /// Fails on the first party whose value does not arrive, see [`recv_from()`].
    ///
    /// [`recv_from()`]: FanoutClient::recv_from
    pub async fn recv_all(&self, key: &str) -> Result<Vec<(PartyId, Value)>, FanoutError> {
        let mut values = Vec::with_capacity(self.proxies.len());
        for party in self.parties() {
            values.push((party, self.recv_from(party, key).await?));
        }
        Ok(values)
    }

    /// Tells every party which can still be reached that the run is aborted.
    pub async fn broadcast_abort(&self, reason: &str) {
        let tag = tag(self.local.role, ABORT_KEY);
        let value = Value::Abort(reason.to_string());
        for proxy in self.proxies.iter().filter(|p| p.session().is_open()) {
            if let Err(err) = proxy.remote(&value, &tag).await {
                warn!("failed to notify {} of the abort: {}", proxy.party(), err);
            }
        }
    }

    /// Stops all the sessions.
    pub async fn shutdown(&self) {
        future::join_all(self.proxies.iter().map(|proxy| proxy.stop())).await;
        debug!("{} shut down all sessions", self.local);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::Role;

    pub(crate) fn context() -> TaskContext {
        TaskContext::new("task", "job", "request")
    }

    /// Connects the `parties` with each other over loopback.
    pub(crate) async fn connect_parties(
        parties: &[PartyId],
        settings: &ChannelSettings,
    ) -> Vec<FanoutClient> {
        let mut listeners = Vec::new();
        let mut endpoints = Vec::new();
        for party in parties {
            let listener = if parties.iter().any(|remote| party.accepts(remote)) {
                let endpoint = Endpoint::new(*party, "127.0.0.1", 0);
                Some(
                    SessionListener::bind(&endpoint, context(), settings)
                        .await
                        .unwrap(),
                )
            } else {
                None
            };
            let port = listener
                .as_ref()
                .map(|listener| listener.local_addr().unwrap().port())
                .unwrap_or_default();
            endpoints.push(Endpoint::new(*party, "127.0.0.1", port));
            listeners.push(listener);
        }
        let clients = parties
            .iter()
            .zip(listeners)
            .map(|(party, listener)| {
                FanoutClient::connect_with(*party, listener, &endpoints, context(), settings)
            });
        future::try_join_all(clients).await.unwrap()
    }

    pub(crate) fn settings() -> ChannelSettings {
        ChannelSettings {
            poll_interval: 20,
            get_retries: 500,
            connect_retries: 50,
            send_workers: 2,
        }
    }

    fn parties() -> [PartyId; 3] {
        [
            PartyId::new(Role::Arbiter, 0),
            PartyId::new(Role::Guest, 0),
            PartyId::new(Role::Host, 0),
        ]
    }

    #[tokio::test]
    async fn test_connect() {
        let [arbiter, guest, host] = parties();
        let clients = connect_parties(&[host, arbiter, guest], &settings()).await;
        assert_eq!(clients[0].local(), host);
        assert_eq!(clients[0].parties(), vec![arbiter, guest]);
        assert_eq!(clients[1].parties(), vec![guest, host]);
        assert_eq!(clients[2].parties(), vec![arbiter, host]);
        assert!(matches!(
            clients[1].proxy(PartyId::new(Role::Host, 1)),
            Err(FanoutError::UnknownParty(_))
        ));
    }

    #[tokio::test]
    async fn test_send_all() {
        let [arbiter, guest, host] = parties();
        let clients = connect_parties(&[arbiter, guest, host], &settings()).await;
        clients[0]
            .send_all("public_key", &Value::Scalar(42.0))
            .await
            .unwrap();
        for client in &clients[1..] {
            assert_eq!(
                client.recv_from(arbiter, "public_key").await.unwrap(),
                Value::Scalar(42.0)
            );
        }
    }

    #[tokio::test]
    async fn test_send_selected() {
        let [arbiter, guest, host] = parties();
        let clients = connect_parties(&[arbiter, guest, host], &settings()).await;
        let indices = Value::Indices(vec![3, 1, 4]);
        clients[1]
            .send_selected("batch_index", &indices, &[host])
            .await
            .unwrap();
        assert_eq!(
            clients[2].recv_from(guest, "batch_index").await.unwrap(),
            indices
        );
        assert!(clients[0]
            .proxy(guest)
            .unwrap()
            .get("guest_batch_index", 1)
            .await
            .unwrap()
            .is_none());

        assert!(matches!(
            clients[1]
                .send_selected("batch_index", &indices, &[host, PartyId::new(Role::Host, 1)])
                .await,
            Err(FanoutError::UnknownParty(party)) if party == PartyId::new(Role::Host, 1)
        ));
    }

    #[tokio::test]
    async fn test_send_distinct() {
        let [arbiter, guest, host] = parties();
        let clients = connect_parties(&[arbiter, guest, host], &settings()).await;
        assert!(matches!(
            clients[0]
                .send_distinct("decrypted", vec![Value::Scalar(1.0)])
                .await,
            Err(FanoutError::DistinctLength {
                expected: 2,
                actual: 1
            })
        ));

        clients[0]
            .send_distinct("decrypted", vec![Value::Scalar(1.0), Value::Scalar(2.0)])
            .await
            .unwrap();
        assert_eq!(
            clients[1].recv_from(arbiter, "decrypted").await.unwrap(),
            Value::Scalar(1.0)
        );
        assert_eq!(
            clients[2].recv_from(arbiter, "decrypted").await.unwrap(),
            Value::Scalar(2.0)
        );
    }

    #[tokio::test]
    async fn test_recv_all_in_registration_order() {
        let [arbiter, guest, host] = parties();
        let clients = connect_parties(&[arbiter, guest, host], &settings()).await;
        clients[2]
            .send_selected("loss", &Value::Scalar(2.0), &[arbiter])
            .await
            .unwrap();
        let gathered = tokio::join!(clients[0].recv_all("loss"), async {
            tokio::time::sleep(settings().poll_interval() * 3).await;
            clients[1]
                .send_selected("loss", &Value::Scalar(1.0), &[arbiter])
                .await
                .unwrap();
        })
        .0
        .unwrap();
        assert_eq!(
            gathered,
            vec![(guest, Value::Scalar(1.0)), (host, Value::Scalar(2.0))]
        );
    }

    #[tokio::test]
    async fn test_recv_all_timeout() {
        let [arbiter, guest, host] = parties();
        let settings = ChannelSettings {
            get_retries: 3,
            ..settings()
        };
        let clients = connect_parties(&[arbiter, guest, host], &settings).await;
        clients[1]
            .send_selected("loss", &Value::Scalar(1.0), &[arbiter])
            .await
            .unwrap();
        assert!(matches!(
            clients[0].recv_all("loss").await,
            Err(FanoutError::Timeout { party, tag }) if party == host && tag == "host_loss"
        ));
    }

    #[tokio::test]
    async fn test_abort() {
        let [arbiter, guest, host] = parties();
        let clients = connect_parties(&[arbiter, guest, host], &settings()).await;
        clients[0].broadcast_abort("decryption failed").await;
        for client in &clients[1..] {
            assert!(matches!(
                client.recv_from(arbiter, "convergence").await,
                Err(FanoutError::Aborted { party, reason })
                    if party == arbiter && reason == "decryption failed"
            ));
        }

        clients[2].broadcast_abort("out of memory").await;
        assert!(matches!(
            clients[0].recv_from(host, "loss").await,
            Err(FanoutError::Aborted { party, .. }) if party == host
        ));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let [arbiter, guest, host] = parties();
        let clients = connect_parties(&[arbiter, guest, host], &settings()).await;
        clients[0].shutdown().await;
        assert!(clients[0].proxies().iter().all(|p| !p.session().is_open()));
        assert!(matches!(
            clients[1].recv_from(arbiter, "convergence").await,
            Err(FanoutError::Channel(ChannelError::Closed(_)))
        ));
        // the other sessions are still open
        clients[1]
            .send_selected("batch_index", &Value::Indices(vec![0]), &[host])
            .await
            .unwrap();
    }
}
