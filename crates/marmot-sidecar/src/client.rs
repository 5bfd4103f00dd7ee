//! Host side of one sidecar connection
//!
//! Requests are written by a writer task and answered out of band: the reader
//! task routes each [`Frame::Response`] to the caller waiting on its correlation
//! id and forwards every [`Frame::Event`] to the event channel. When the
//! connection drops, every waiting caller fails with
//! [`Error::SidecarUnavailable`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nostr::PublicKey;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::FrameCodec;
use crate::error::Error;
use crate::protocol::{Frame, Notification, Op, Outcome, PROTOCOL_VERSION, Reply};

/// Something the sidecar side reported without being asked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarEvent {
    /// Engine notification
    Notification(Notification),
    /// The connection to the sidecar dropped
    Disconnected,
    /// A replacement sidecar is up; state since its last checkpoint must be replayed
    Restarted,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    closed: AtomicBool,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // dropping the senders wakes every waiter with an error
        self.pending.lock().clear();
    }
}

struct Inner {
    identity: PublicKey,
    request_timeout: Duration,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Frame>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A handshaken connection to a sidecar
#[derive(Clone)]
pub struct SidecarClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SidecarClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarClient")
            .field("identity", &self.inner.identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SidecarClient {
    /// Perform the handshake over `reader`/`writer` and start routing frames
    pub async fn connect<R, W>(
        reader: R,
        writer: W,
        events: mpsc::UnboundedSender<SidecarEvent>,
        handshake_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, Error>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut frames = FramedRead::new(reader, FrameCodec::new());
        let mut sink = FramedWrite::new(writer, FrameCodec::new());

        let handshake = async {
            sink.send(Frame::Hello {
                protocol_version: PROTOCOL_VERSION,
            })
            .await
            .map_err(|_| Error::SidecarUnavailable)?;
            match frames.next().await {
                Some(Ok(Frame::Ready {
                    protocol_version,
                    identity,
                })) => Ok((protocol_version, identity)),
                Some(Ok(other)) => {
                    tracing::warn!(target: "marmot_sidecar::client", "Expected ready, got {other:?}");
                    Err(Error::SidecarUnavailable)
                }
                Some(Err(e)) => {
                    tracing::warn!(target: "marmot_sidecar::client", "Handshake read failed: {e}");
                    Err(Error::SidecarUnavailable)
                }
                None => Err(Error::SidecarUnavailable),
            }
        };
        let (protocol_version, identity) = tokio::time::timeout(handshake_timeout, handshake)
            .await
            .map_err(|_| Error::HandshakeTimeout(handshake_timeout))??;
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::IncompatibleSidecar {
                expected: PROTOCOL_VERSION,
                found: protocol_version,
            });
        }

        let shared = Arc::new(Shared::default());
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Frame>();

        let writer_shared = Arc::clone(&shared);
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(target: "marmot_sidecar::client", "Write to sidecar failed: {e}");
                    break;
                }
            }
            writer_shared.close();
        });

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(Frame::Response { id, outcome }) => {
                        let waiter = reader_shared.pending.lock().remove(&id);
                        match waiter {
                            // the caller may have given up; its result is discarded
                            Some(tx) => {
                                let _ = tx.send(outcome);
                            }
                            None => {
                                tracing::debug!(target: "marmot_sidecar::client", id, "Response without waiter")
                            }
                        }
                    }
                    Ok(Frame::Event(notification)) => {
                        let _ = events.send(SidecarEvent::Notification(notification));
                    }
                    Ok(other) => {
                        tracing::warn!(target: "marmot_sidecar::client", "Unexpected frame from sidecar: {other:?}");
                    }
                    Err(e) => {
                        tracing::warn!(target: "marmot_sidecar::client", "Read from sidecar failed: {e}");
                        break;
                    }
                }
            }
            reader_shared.close();
            let _ = events.send(SidecarEvent::Disconnected);
        });

        tracing::debug!(target: "marmot_sidecar::client", %identity, "Sidecar connected");
        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                request_timeout,
                next_id: AtomicU64::new(1),
                shared,
                outgoing,
                tasks: vec![writer_task, reader_task],
            }),
        })
    }

    /// Identity the sidecar announced
    pub fn identity(&self) -> PublicKey {
        self.inner.identity
    }

    /// Whether the connection has dropped
    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::SeqCst)
    }

    /// Send `op` and wait for its response
    pub async fn request(&self, op: Op) -> Result<Reply, Error> {
        let name = op.name();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.inner.shared.pending.lock().insert(id, tx);
        // a close racing the insert would never drain this entry
        if self.is_closed() {
            self.inner.shared.pending.lock().remove(&id);
            return Err(Error::SidecarUnavailable);
        }
        if self.inner.outgoing.send(Frame::Request { id, op }).is_err() {
            self.inner.shared.pending.lock().remove(&id);
            return Err(Error::SidecarUnavailable);
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(Outcome::Ok(reply))) => Ok(reply),
            Ok(Ok(Outcome::Error(e))) => Err(Error::Engine(e)),
            Ok(Err(_)) => Err(Error::SidecarUnavailable),
            Err(_) => {
                self.inner.shared.pending.lock().remove(&id);
                Err(Error::RequestTimeout {
                    op: name,
                    timeout: self.inner.request_timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, split};

    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    /// A fake sidecar that answers the handshake with `version` and then hands
    /// its stream halves back to the test
    async fn fake_sidecar(
        version: u32,
    ) -> (
        Result<SidecarClient, Error>,
        FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, FrameCodec>,
        FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, FrameCodec>,
        mpsc::UnboundedReceiver<SidecarEvent>,
    ) {
        let (host, sidecar) = duplex(64 * 1024);
        let (r, w) = split(sidecar);
        let mut frames = FramedRead::new(r, FrameCodec::new());
        let mut sink = FramedWrite::new(w, FrameCodec::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let (r, w) = split(host);
        let connecting = tokio::spawn(SidecarClient::connect(r, w, events_tx, SECOND, SECOND));
        assert!(matches!(frames.next().await, Some(Ok(Frame::Hello { .. }))));
        sink.send(Frame::Ready {
            protocol_version: version,
            identity: nostr::Keys::generate().public_key(),
        })
        .await
        .unwrap();
        (connecting.await.unwrap(), frames, sink, events_rx)
    }

    #[tokio::test]
    async fn test_responses_routed_by_id() {
        let (client, mut frames, mut sink, _events) = fake_sidecar(PROTOCOL_VERSION).await;
        let client = client.unwrap();

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.request(Op::ListGroups).await }
        });
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.request(Op::CreateKeyPackage).await }
        });

        let mut ids = Vec::new();
        for _ in 0..2 {
            let Some(Ok(Frame::Request { id, op })) = frames.next().await else {
                panic!("expected request");
            };
            ids.push((id, op));
        }
        // answer in reverse order
        for (id, op) in ids.into_iter().rev() {
            let reply = match op {
                Op::ListGroups => Reply::Groups(Vec::new()),
                _ => Reply::Done,
            };
            sink.send(Frame::Response {
                id,
                outcome: Outcome::Ok(reply),
            })
            .await
            .unwrap();
        }

        assert_eq!(first.await.unwrap().unwrap(), Reply::Groups(Vec::new()));
        assert_eq!(second.await.unwrap().unwrap(), Reply::Done);
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (client, _frames, _sink, _events) = fake_sidecar(PROTOCOL_VERSION + 1).await;
        assert_eq!(
            client.unwrap_err(),
            Error::IncompatibleSidecar {
                expected: PROTOCOL_VERSION,
                found: PROTOCOL_VERSION + 1
            }
        );
    }

    #[tokio::test]
    async fn test_in_flight_requests_fail_when_sidecar_dies() {
        let (client, mut frames, sink, mut events) = fake_sidecar(PROTOCOL_VERSION).await;
        let client = client.unwrap();

        let waiting = tokio::spawn({
            let client = client.clone();
            async move { client.request(Op::ListGroups).await }
        });
        assert!(matches!(frames.next().await, Some(Ok(Frame::Request { .. }))));
        drop(sink);
        drop(frames);

        assert_eq!(waiting.await.unwrap(), Err(Error::SidecarUnavailable));
        assert_eq!(events.recv().await, Some(SidecarEvent::Disconnected));
        assert!(client.is_closed());
        assert_eq!(
            client.request(Op::ListGroups).await,
            Err(Error::SidecarUnavailable)
        );
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (host, _sidecar) = duplex(1024);
        let (r, w) = split(host);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let timeout = Duration::from_millis(20);
        let result = SidecarClient::connect(r, w, events_tx, timeout, SECOND).await;
        assert_eq!(result.unwrap_err(), Error::HandshakeTimeout(timeout));
    }

    #[tokio::test]
    async fn test_events_forwarded() {
        let (client, _frames, mut sink, mut events) = fake_sidecar(PROTOCOL_VERSION).await;
        let _client = client.unwrap();
        let notification = Notification::GroupClosed {
            group_id: marmot_group::GroupId::from_bytes([9; 32]),
            epoch: 1,
        };
        sink.send(Frame::Event(notification.clone())).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(SidecarEvent::Notification(notification))
        );
    }
}
