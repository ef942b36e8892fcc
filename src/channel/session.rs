//! Point-to-point session between two parties.
//!
//! See the [channel module] documentation since this is a private module anyways.
//!
//! [channel module]: crate::channel

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use derive_more::Display;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{oneshot, Mutex as AsyncMutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing_futures::Instrument;

use crate::{
    channel::{ChannelError, Endpoint, Mailbox, PartyId, TaskContext},
    message::{AckStatus, Frame, FromBytes, ToBytes},
    settings::ChannelSettings,
};

/// The largest frame accepted on a session.
pub(crate) const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Splits a connected stream into framed halves.
pub(crate) fn framed(stream: TcpStream) -> Result<(FrameReader, FrameWriter), ChannelError> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    Ok((
        FramedRead::new(read_half, codec()),
        FramedWrite::new(write_half, codec()),
    ))
}

/// Reads the next frame, giving up after `patience`.
pub(crate) async fn read_frame(
    reader: &mut FrameReader,
    patience: Duration,
    party: &str,
) -> Result<Frame, ChannelError> {
    let handshake_error = |reason: String| ChannelError::Handshake {
        party: party.to_string(),
        reason,
    };
    let bytes = timeout(patience, reader.next())
        .await
        .map_err(|_| handshake_error("no answer".to_string()))?
        .ok_or_else(|| handshake_error("connection closed".to_string()))??;
    Frame::from_bytes(&bytes).map_err(ChannelError::Decode)
}

pub(crate) async fn write_frame(
    writer: &mut FrameWriter,
    frame: &Frame,
) -> Result<(), ChannelError> {
    writer.send(Bytes::from(frame.to_vec())).await?;
    Ok(())
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
/// The side a session was established from.
pub enum SessionRole {
    /// The session was accepted by a listener.
    #[display(fmt = "server")]
    Server,
    /// The session was opened by connecting to a listener.
    #[display(fmt = "client")]
    Client,
}

type PendingAcks = HashMap<u64, oneshot::Sender<AckStatus>>;

/// The state shared between a session and its receive loop.
struct Shared {
    remote: PartyId,
    mailbox: Mailbox,
    writer: AsyncMutex<FrameWriter>,
    /// `None` once the receive loop has ended.
    pending: Mutex<Option<PendingAcks>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Option<PendingAcks>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn write(&self, frame: &Frame) -> Result<(), ChannelError> {
        write_frame(&mut *self.writer.lock().await, frame).await
    }

    /// Registers the acknowledgment of the data frame `seq`.
    fn expect_ack(&self, seq: u64) -> Result<oneshot::Receiver<AckStatus>, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.pending()
            .as_mut()
            .ok_or(ChannelError::Closed(self.remote))?
            .insert(seq, tx);
        Ok(rx)
    }

    fn resolve_ack(&self, seq: u64, status: AckStatus) {
        let sender = self.pending().as_mut().and_then(|pending| pending.remove(&seq));
        match sender {
            Some(sender) => {
                // the sender may have given up waiting already
                let _ = sender.send(status);
            }
            None => warn!("unexpected ack {} from {}", seq, self.remote),
        }
    }

    fn forget_ack(&self, seq: u64) {
        if let Some(pending) = self.pending().as_mut() {
            pending.remove(&seq);
        }
    }

    /// Fails all pending and future sends and closes the mailbox.
    fn close(&self) {
        if let Some(pending) = self.pending().take() {
            if !pending.is_empty() {
                debug!("{} sends to {} left unacknowledged", pending.len(), self.remote);
            }
        }
        self.mailbox.close();
    }
}

/// A session between the local party and one remote party of a run.
///
/// Payloads are sent under tags with [`send()`] and received from the session's [`Mailbox`] with
/// [`recv()`], [`try_recv()`] or [`poll()`]. All of them can be called concurrently.
///
/// [`send()`]: Session::send
/// [`recv()`]: Session::recv
/// [`try_recv()`]: Session::try_recv
/// [`poll()`]: Session::poll
pub struct Session {
    local: PartyId,
    context: TaskContext,
    role: SessionRole,
    shared: Arc<Shared>,
    next_seq: AtomicU64,
    stop: Arc<AtomicBool>,
    receiver: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connects to the listener of the `remote` party and opens a session.
    ///
    /// Connecting is attempted up to `connect_retries` times, sleeping `poll_interval` in between.
    ///
    /// # Errors
    /// Fails if the remote party is unreachable, if it requires TLS or if it rejects the hello.
    pub async fn connect(
        local: PartyId,
        remote: &Endpoint,
        context: TaskContext,
        settings: &ChannelSettings,
    ) -> Result<Self, ChannelError> {
        remote.check_transport()?;
        let party = remote.party();

        let mut attempts = 0;
        let stream = loop {
            attempts += 1;
            match TcpStream::connect((remote.host.as_str(), remote.port)).await {
                Ok(stream) => break stream,
                Err(err) if attempts < settings.connect_retries => {
                    debug!(
                        "connecting to {} at {}:{} failed (attempt {}): {}",
                        party, remote.host, remote.port, attempts, err
                    );
                    sleep(settings.poll_interval()).await;
                }
                Err(err) => {
                    warn!("giving up connecting to {}: {}", party, err);
                    return Err(ChannelError::Unreachable { party, attempts });
                }
            }
        };

        let (mut reader, mut writer) = framed(stream)?;
        let hello = Frame::Hello {
            party: local,
            context: context.clone(),
        };
        write_frame(&mut writer, &hello).await?;
        match read_frame(&mut reader, settings.handshake_timeout(), &party.to_string()).await? {
            Frame::HelloAck(AckStatus::Accepted) => {}
            Frame::HelloAck(status) => {
                return Err(ChannelError::Handshake {
                    party: party.to_string(),
                    reason: status.to_string(),
                })
            }
            frame => {
                return Err(ChannelError::Handshake {
                    party: party.to_string(),
                    reason: format!("unexpected answer {:?}", frame),
                })
            }
        }

        info!("opened session with {} for {}", party, context);
        Ok(Self::spawn(
            local,
            party,
            context,
            SessionRole::Client,
            reader,
            writer,
            settings.poll_interval(),
        ))
    }

    /// Starts the receive loop of an established session.
    pub(crate) fn spawn(
        local: PartyId,
        remote: PartyId,
        context: TaskContext,
        role: SessionRole,
        reader: FrameReader,
        writer: FrameWriter,
        poll_interval: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            remote,
            mailbox: Mailbox::new(remote),
            writer: AsyncMutex::new(writer),
            pending: Mutex::new(Some(HashMap::new())),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let span = error_span!("session", local = %local, remote = %remote, role = %role);
        let receiver = tokio::spawn(
            receive_loop(reader, shared.clone(), stop.clone(), poll_interval).instrument(span),
        );
        Self {
            local,
            context,
            role,
            shared,
            next_seq: AtomicU64::new(0),
            stop,
            receiver: AsyncMutex::new(Some(receiver)),
        }
    }

    pub fn local(&self) -> PartyId {
        self.local
    }

    pub fn remote(&self) -> PartyId {
        self.shared.remote
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.shared.mailbox
    }

    /// Whether the receive loop is still running.
    pub fn is_open(&self) -> bool {
        !self.shared.mailbox.is_closed()
    }

    /// Sends a payload under `tag` and waits until the peer has stored it.
    ///
    /// # Errors
    /// Fails if the session is closed before the peer acknowledged the payload, or if the peer
    /// rejected it. The payload is not resent.
    pub async fn send(&self, tag: &str, payload: Bytes) -> Result<(), ChannelError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let ack = self.shared.expect_ack(seq)?;
        let frame = Frame::Data {
            seq,
            tag: tag.to_string(),
            payload,
        };
        if let Err(err) = self.shared.write(&frame).await {
            self.shared.forget_ack(seq);
            return Err(err);
        }
        match ack.await {
            Ok(AckStatus::Accepted) => Ok(()),
            Ok(status) => Err(ChannelError::Rejected {
                party: self.remote(),
                status,
            }),
            Err(_) => Err(ChannelError::Closed(self.remote())),
        }
    }

    /// Waits for the payload under `tag` and takes it.
    pub async fn recv(&self, tag: &str) -> Result<Bytes, ChannelError> {
        self.shared.mailbox.take(tag).await
    }

    /// Takes the payload under `tag` if it has arrived already.
    pub fn try_recv(&self, tag: &str) -> Option<Bytes> {
        self.shared.mailbox.try_take(tag)
    }

    /// Polls for the first of `tags` holding a payload, see [`Mailbox::poll()`].
    pub async fn poll(
        &self,
        tags: &[&str],
        retries: u32,
        interval: Duration,
    ) -> Result<Option<(usize, Bytes)>, ChannelError> {
        self.shared.mailbox.poll(tags, retries, interval).await
    }

    /// Stops the receive loop, clears the mailbox and closes the connection.
    ///
    /// Returns once the receive loop has ended. Stopping a stopped session does nothing.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let receiver = self.receiver.lock().await.take();
        if let Some(receiver) = receiver {
            if let Err(err) = receiver.await {
                warn!("receive loop for {} failed: {}", self.remote(), err);
            }
            self.shared.mailbox.clear();
            let mut writer = self.shared.writer.lock().await;
            if let Err(err) = SinkExt::<Bytes>::close(&mut *writer).await {
                debug!("closing the connection to {} failed: {}", self.remote(), err);
            }
            info!("stopped session with {}", self.remote());
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

async fn receive_loop(
    mut reader: FrameReader,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    debug!("receive loop started");
    loop {
        if stop.load(Ordering::Acquire) {
            debug!("receive loop stopped");
            break;
        }
        let bytes = match timeout(poll_interval, reader.next()).await {
            Err(_) => continue,
            Ok(None) => {
                debug!("connection closed by peer");
                break;
            }
            Ok(Some(Err(err))) => {
                warn!("transport error: {}", err);
                break;
            }
            Ok(Some(Ok(bytes))) => bytes,
        };
        match Frame::from_bytes(&bytes) {
            Ok(Frame::Data { seq, tag, payload }) => {
                trace!("received {} bytes under tag {}", payload.len(), tag);
                shared.mailbox.put(tag, payload);
                let ack = Frame::Ack {
                    seq,
                    status: AckStatus::Accepted,
                };
                if let Err(err) = shared.write(&ack).await {
                    warn!("failed to acknowledge frame {}: {}", seq, err);
                    break;
                }
            }
            Ok(Frame::Ack { seq, status }) => shared.resolve_ack(seq, status),
            Ok(frame) => warn!("ignoring unexpected frame {:?}", frame),
            Err(err) => {
                warn!("invalid frame: {:#}", err);
                break;
            }
        }
    }
    shared.close();
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::{channel::Role, message::Value};

    fn settings() -> ChannelSettings {
        ChannelSettings {
            poll_interval: 20,
            ..ChannelSettings::default()
        }
    }

    /// Opens a session pair without handshake.
    async fn session_pair() -> (Session, Session) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        let arbiter = PartyId::new(Role::Arbiter, 0);
        let guest = PartyId::new(Role::Guest, 0);
        let context = TaskContext::new("task", "job", "request");
        let interval = settings().poll_interval();

        let (reader, writer) = framed(accepted.unwrap().0).unwrap();
        let server = Session::spawn(
            arbiter,
            guest,
            context.clone(),
            SessionRole::Server,
            reader,
            writer,
            interval,
        );
        let (reader, writer) = framed(connected.unwrap()).unwrap();
        let client = Session::spawn(
            guest,
            arbiter,
            context,
            SessionRole::Client,
            reader,
            writer,
            interval,
        );
        (server, client)
    }

    #[tokio::test]
    async fn test_send_recv() {
        let (arbiter, guest) = session_pair().await;
        let payload = Value::Scalar(0.25).to_vec();
        guest
            .send("guest_loss", Bytes::from(payload.clone()))
            .await
            .unwrap();
        // acknowledged, hence stored already
        assert_eq!(arbiter.try_recv("guest_loss").unwrap(), payload);

        arbiter
            .send("arbiter_convergence", Bytes::from_static(b"status"))
            .await
            .unwrap();
        assert_eq!(guest.recv("arbiter_convergence").await.unwrap(), "status");
        assert!(guest.try_recv("arbiter_convergence").is_none());

        guest.stop().await;
        arbiter.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_sends() {
        let (arbiter, guest) = session_pair().await;
        let tags: Vec<String> = (0..16).map(|i| format!("guest_part_{}", i)).collect();
        let sends = tags.iter().enumerate().map(|(i, tag)| {
            let value = Value::Indices(vec![i as u64]);
            guest.send(tag, Bytes::from(value.to_vec()))
        });
        for result in futures::future::join_all(sends).await {
            result.unwrap();
        }
        for (i, tag) in tags.iter().enumerate() {
            let value = Value::from_bytes(&arbiter.recv(tag).await.unwrap()).unwrap();
            assert_eq!(value, Value::Indices(vec![i as u64]));
        }
    }

    #[tokio::test]
    async fn test_peer_stop_closes_session() {
        let (arbiter, guest) = session_pair().await;
        guest
            .send("guest_loss", Bytes::from_static(b"loss"))
            .await
            .unwrap();
        guest.stop().await;

        // the connection is shut down, so the arbiter's receive loop ends
        assert!(matches!(
            arbiter.recv("guest_never").await,
            Err(ChannelError::Closed(party)) if party == guest.local()
        ));
        assert!(!arbiter.is_open());
        assert_eq!(arbiter.recv("guest_loss").await.unwrap(), "loss");
        assert!(matches!(
            arbiter.send("arbiter_late", Bytes::new()).await,
            Err(ChannelError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (arbiter, guest) = session_pair().await;
        arbiter
            .send("arbiter_public_key", Bytes::from_static(b"key"))
            .await
            .unwrap();
        guest.stop().await;
        guest.stop().await;
        // untaken payloads are dropped on stop
        assert!(guest.try_recv("arbiter_public_key").is_none());
        assert!(!guest.is_open());
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        // bind and drop a listener to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let settings = ChannelSettings {
            poll_interval: 1,
            connect_retries: 3,
            ..ChannelSettings::default()
        };
        let remote = Endpoint::new(PartyId::new(Role::Arbiter, 0), "127.0.0.1", port);
        let result = Session::connect(
            PartyId::new(Role::Guest, 0),
            &remote,
            TaskContext::new("task", "job", "request"),
            &settings,
        )
        .await;
        assert!(matches!(
            result,
            Err(ChannelError::Unreachable { attempts: 3, .. })
        ));
    }
}
