//! Listener for incoming sessions.
//!
//! See the [channel module] documentation since this is a private module anyways.
//!
//! [channel module]: crate::channel

use std::{collections::HashMap, io, net::SocketAddr};

use tokio::net::{TcpListener, TcpStream};

use crate::{
    channel::{
        session::{framed, read_frame, write_frame},
        ChannelError,
        Endpoint,
        PartyId,
        Session,
        SessionRole,
        TaskContext,
    },
    message::{AckStatus, Frame},
    settings::ChannelSettings,
};

/// Accepts the sessions of the parties which connect to the local party.
pub struct SessionListener {
    local: PartyId,
    context: TaskContext,
    settings: ChannelSettings,
    listener: TcpListener,
}

impl SessionListener {
    /// Binds to the address of the `local` endpoint.
    ///
    /// # Errors
    /// Fails if the endpoint requires TLS or if the address can't be bound.
    pub async fn bind(
        local: &Endpoint,
        context: TaskContext,
        settings: &ChannelSettings,
    ) -> Result<Self, ChannelError> {
        local.check_transport()?;
        let listener = TcpListener::bind((local.host.as_str(), local.port)).await?;
        info!(
            "{} listening on {} for {}",
            local.party(),
            listener.local_addr()?,
            context
        );
        Ok(Self {
            local: local.party(),
            context,
            settings: *settings,
            listener,
        })
    }

    pub fn local(&self) -> PartyId {
        self.local
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one session from each of the `expected` parties.
    ///
    /// Connections which fail the handshake are answered with the reason and dropped, without
    /// interrupting the listener. The sessions are returned in the order of `expected`.
    ///
    /// # Errors
    /// Fails if accepting connections fails.
    pub async fn accept_all(&self, expected: &[PartyId]) -> Result<Vec<Session>, ChannelError> {
        let mut sessions = HashMap::with_capacity(expected.len());
        while sessions.len() < expected.len() {
            let (stream, addr) = self.listener.accept().await?;
            match self.handshake(stream, expected, &sessions).await {
                Ok(session) => {
                    info!("accepted session with {} from {}", session.remote(), addr);
                    sessions.insert(session.remote(), session);
                }
                Err(err) => warn!("refused connection from {}: {}", addr, err),
            }
        }
        Ok(expected
            .iter()
            .filter_map(|party| sessions.remove(party))
            .collect())
    }

    /// Accepts a session from the `remote` party.
    pub async fn accept(&self, remote: PartyId) -> Result<Session, ChannelError> {
        let mut sessions = self.accept_all(&[remote]).await?;
        sessions.pop().ok_or(ChannelError::Closed(remote))
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        expected: &[PartyId],
        accepted: &HashMap<PartyId, Session>,
    ) -> Result<Session, ChannelError> {
        let (mut reader, mut writer) = framed(stream)?;
        let (party, context) =
            match read_frame(&mut reader, self.settings.handshake_timeout(), "unknown party")
                .await?
            {
                Frame::Hello { party, context } => (party, context),
                frame => {
                    return Err(ChannelError::Handshake {
                        party: "unknown party".to_string(),
                        reason: format!("expected hello, got {:?}", frame),
                    })
                }
            };

        let status = if context != self.context {
            AckStatus::ContextMismatch
        } else if !expected.contains(&party) || accepted.contains_key(&party) {
            AckStatus::UnexpectedParty
        } else {
            AckStatus::Accepted
        };
        write_frame(&mut writer, &Frame::HelloAck(status)).await?;
        if status != AckStatus::Accepted {
            return Err(ChannelError::Handshake {
                party: party.to_string(),
                reason: format!("{} ({})", status, context),
            });
        }

        Ok(Session::spawn(
            self.local,
            party,
            context,
            SessionRole::Server,
            reader,
            writer,
            self.settings.poll_interval(),
        ))
    }
}
