use crate::error::{ErrorKind, Result, SyncError};
use crate::proto::realtime::{self, Ack, Frame, frame::Body};
use crate::proto::{patch_to_proto, proto_to_patch};
use crate::realtime::frame::{read_frame, write_frame};
use crate::types::{Patch, Scope, VersionStamp};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Something the server pushed to this subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// Another peer's patch and the version it produced
    Patch { patch: Patch, stamp: VersionStamp },
    VersionBumped(VersionStamp),
}

/// Ack waiters by request id; None once the reader has stopped
type PendingAcks = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Ack>>>>>;

/// Peer side of the realtime channel
///
/// Connecting, the subscribe handshake and every ack wait are bounded by
/// `request_timeout`; running out of time is a transient failure.
#[derive(Debug)]
pub struct RealtimeClient {
    scope: Scope,
    writer: OwnedWriteHalf,
    events: mpsc::Receiver<RealtimeEvent>,
    pending: PendingAcks,
    next_request: u64,
    subscribed_at: VersionStamp,
    request_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl RealtimeClient {
    /// Connect and subscribe; fails if the server refuses the subscription
    pub async fn connect(
        addr: &str,
        scope: &Scope,
        token: Option<&str>,
        max_frame_bytes: usize,
        request_timeout: Duration,
    ) -> Result<Self> {
        let (reader, writer, subscribed_at) = timeout(
            request_timeout,
            subscribe(addr, scope, token, max_frame_bytes),
        )
        .await??;
        debug!("Subscribed to {} at v{}", scope, subscribed_at.version);

        let (event_tx, events) = mpsc::channel(256);
        let pending: PendingAcks = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            event_tx,
            max_frame_bytes,
        ));

        Ok(Self {
            scope: scope.clone(),
            writer,
            events,
            pending,
            next_request: 1,
            subscribed_at,
            request_timeout,
            reader_task,
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Server version when the subscription was accepted
    pub fn subscribed_at(&self) -> VersionStamp {
        self.subscribed_at
    }

    /// Submit a patch to the subscribed scope and wait for its ack
    pub async fn submit(&mut self, patch: &Patch) -> Result<VersionStamp> {
        let request_id = self.next_request;
        self.next_request += 1;

        let frame = Frame::new(Body::SubmitPatch(realtime::SubmitPatch {
            request_id,
            scope: String::new(),
            patch: Some(patch_to_proto(patch)?),
        }));

        let (tx, rx) = oneshot::channel();
        match self.pending.lock().await.as_mut() {
            Some(waiters) => {
                waiters.insert(request_id, tx);
            }
            None => return Err(SyncError::TransientIo("realtime connection closed".into())),
        }

        let exchange = async {
            write_frame(&mut self.writer, &frame).await?;
            rx.await
                .map_err(|_| SyncError::TransientIo("connection closed before ack".into()))
        };
        let ack = match timeout(self.request_timeout, exchange).await {
            Ok(ack) => ack,
            Err(elapsed) => {
                warn!("No ack for request {} on {}", request_id, self.scope);
                Err(elapsed.into())
            }
        };
        if ack.is_err() {
            if let Some(waiters) = self.pending.lock().await.as_mut() {
                waiters.remove(&request_id);
            }
        }
        ack_result(ack?)
    }

    /// Next pushed event, or None once the connection is gone
    pub async fn next_event(&mut self) -> Option<RealtimeEvent> {
        self.events.recv().await
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn subscribe(
    addr: &str,
    scope: &Scope,
    token: Option<&str>,
    max_frame_bytes: usize,
) -> Result<(OwnedReadHalf, OwnedWriteHalf, VersionStamp)> {
    let socket = TcpStream::connect(addr).await?;
    let (mut reader, mut writer) = socket.into_split();

    let subscribe = Frame::new(Body::Subscribe(realtime::Subscribe {
        scope: scope.to_string(),
        token: token.map(str::to_string),
    }));
    write_frame(&mut writer, &subscribe).await?;

    let ack = match read_frame(&mut reader, max_frame_bytes).await? {
        Some(Frame {
            body: Some(Body::Ack(ack)),
        }) => ack,
        _ => {
            return Err(SyncError::TransientIo(
                "server did not acknowledge subscription".into(),
            ));
        }
    };
    Ok((reader, writer, ack_result(ack)?))
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    pending: PendingAcks,
    events: mpsc::Sender<RealtimeEvent>,
    max_bytes: usize,
) {
    loop {
        let frame = match read_frame(&mut reader, max_bytes).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("Realtime connection failed: {}", e);
                break;
            }
        };

        let event = match frame.body {
            Some(Body::Ack(ack)) => {
                let waiter = pending
                    .lock()
                    .await
                    .as_mut()
                    .and_then(|waiters| waiters.remove(&ack.request_id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(ack);
                    }
                    None => warn!("Ack for unknown request {}", ack.request_id),
                }
                continue;
            }
            Some(Body::PatchEvent(event)) => {
                match event.patch.as_ref().map(proto_to_patch) {
                    Some(Ok(patch)) => RealtimeEvent::Patch {
                        patch,
                        stamp: VersionStamp {
                            version: event.version,
                            updated_at: event.updated_at,
                        },
                    },
                    _ => {
                        warn!("Dropping malformed patch event for {}", event.scope);
                        continue;
                    }
                }
            }
            Some(Body::VersionBumped(bumped)) => RealtimeEvent::VersionBumped(VersionStamp {
                version: bumped.version,
                updated_at: bumped.updated_at,
            }),
            _ => {
                warn!("Unexpected frame from server");
                continue;
            }
        };

        if events.send(event).await.is_err() {
            break;
        }
    }

    // Fail every waiter still expecting an ack and refuse new ones
    pending.lock().await.take();
}

fn ack_result(ack: Ack) -> Result<VersionStamp> {
    if ack.ok {
        return Ok(VersionStamp {
            version: ack.version,
            updated_at: ack.updated_at,
        });
    }
    let kind = ErrorKind::parse(&ack.error_kind).unwrap_or(ErrorKind::TransientIo);
    Err(SyncError::from_remote(kind, ack.message))
}
