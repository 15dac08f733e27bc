use crate::auth::Caller;
use crate::error::{Result, SyncError};
use crate::fanout::{BusEvent, SessionId, Subscription};
use crate::proto::realtime::{self, Ack, Frame, frame::Body};
use crate::proto::{patch_to_proto, proto_to_patch};
use crate::realtime::frame::{FrameError, read_frame, write_frame};
use crate::storage::Storage;
use crate::types::{Scope, VersionStamp};
use crate::wrapper::ServerWrapper;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Acks waiting for the writer task
const ACK_QUEUE: usize = 32;

/// TCP endpoint for realtime subscribers
///
/// A connection starts with a Subscribe frame naming its scope. After that
/// the peer may submit patches, each answered with an Ack carrying the same
/// request id, while a writer task streams the scope's bus events to it.
pub struct RealtimeListener<S: Storage> {
    wrapper: Arc<ServerWrapper<S>>,
    max_frame_bytes: usize,
}

impl<S: Storage + 'static> RealtimeListener<S> {
    pub fn new(wrapper: Arc<ServerWrapper<S>>, max_frame_bytes: usize) -> Self {
        Self {
            wrapper,
            max_frame_bytes,
        }
    }

    pub async fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Realtime server listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (socket, peer_addr) = listener.accept().await?;
            debug!("Realtime connection from {}", peer_addr);

            let wrapper = Arc::clone(&self.wrapper);
            let max_bytes = self.max_frame_bytes;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, wrapper, max_bytes).await {
                    error!("Realtime connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection<S: Storage>(
    socket: TcpStream,
    wrapper: Arc<ServerWrapper<S>>,
    max_bytes: usize,
) -> std::result::Result<(), FrameError> {
    let (mut reader, mut writer) = socket.into_split();

    let subscribe = match read_frame(&mut reader, max_bytes).await? {
        Some(Frame {
            body: Some(Body::Subscribe(subscribe)),
        }) => subscribe,
        Some(_) => {
            let err = SyncError::Validation("first frame must be Subscribe".into());
            return write_frame(&mut writer, &ack_error(0, &err)).await;
        }
        None => return Ok(()),
    };

    let (caller, scope) = match open_session(&wrapper, &subscribe) {
        Ok(session) => session,
        Err(e) => {
            warn!("Rejected subscription to {}: {}", subscribe.scope, e);
            return write_frame(&mut writer, &ack_error(0, &e)).await;
        }
    };

    // Subscribe before reading the stamp so no event after it is missed
    let subscription = wrapper.bus().subscribe(&scope);
    let session = subscription.session_id();
    let stamp = match wrapper.fetch(&caller, &scope).await {
        Ok(snapshot) => snapshot.map_or(
            VersionStamp {
                version: 0,
                updated_at: 0,
            },
            |snapshot| snapshot.stamp(),
        ),
        Err(e) => {
            warn!("{} could not read {}: {}", session, scope, e);
            return write_frame(&mut writer, &ack_error(0, &e)).await;
        }
    };
    write_frame(&mut writer, &ack_ok(0, stamp)).await?;
    info!("{} subscribed to {}", session, scope);

    let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, subscription, ack_rx));

    let result = read_loop(&mut reader, &wrapper, session, &caller, &scope, &ack_tx, max_bytes).await;

    drop(ack_tx);
    match writer_task.await {
        Ok(Err(e)) => debug!("{} writer stopped: {}", session, e),
        Err(e) => error!("{} writer task failed: {}", session, e),
        Ok(Ok(())) => {}
    }
    debug!("{} disconnected", session);
    result
}

fn open_session<S: Storage>(
    wrapper: &ServerWrapper<S>,
    subscribe: &realtime::Subscribe,
) -> Result<(Caller, Scope)> {
    let scope: Scope = subscribe.scope.parse()?;
    let caller = wrapper.authenticate(subscribe.token.as_deref())?;
    caller.authorize(&scope)?;
    Ok((caller, scope))
}

async fn read_loop<S: Storage>(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    wrapper: &ServerWrapper<S>,
    session: SessionId,
    caller: &Caller,
    scope: &Scope,
    acks: &mpsc::Sender<Frame>,
    max_bytes: usize,
) -> std::result::Result<(), FrameError> {
    while let Some(frame) = read_frame(reader, max_bytes).await? {
        let ack = match frame.body {
            Some(Body::SubmitPatch(submit)) => {
                match submit_patch(wrapper, session, caller, scope, &submit).await {
                    Ok(stamp) => ack_ok(submit.request_id, stamp),
                    Err(e) => {
                        debug!("{} patch {} rejected: {}", session, submit.request_id, e);
                        ack_error(submit.request_id, &e)
                    }
                }
            }
            _ => {
                warn!("{} sent an unexpected frame", session);
                ack_error(0, &SyncError::Validation("expected SubmitPatch".into()))
            }
        };

        if acks.send(ack).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// An empty scope means the subscribed one. Patches for another scope are
/// allowed; this session is not subscribed there and sees no event for them.
async fn submit_patch<S: Storage>(
    wrapper: &ServerWrapper<S>,
    session: SessionId,
    caller: &Caller,
    subscribed: &Scope,
    submit: &realtime::SubmitPatch,
) -> Result<VersionStamp> {
    let proto = submit
        .patch
        .as_ref()
        .ok_or_else(|| SyncError::Validation("SubmitPatch has no patch".into()))?;
    let patch = proto_to_patch(proto)?;

    let scope = if submit.scope.is_empty() {
        subscribed.clone()
    } else {
        submit.scope.parse()?
    };
    let origin = (scope == *subscribed).then_some(session);
    wrapper.submit_patch(origin, caller, &scope, &patch).await
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut subscription: Subscription,
    mut acks: mpsc::Receiver<Frame>,
) -> std::result::Result<(), FrameError> {
    loop {
        let frame = tokio::select! {
            ack = acks.recv() => match ack {
                Some(frame) => frame,
                None => return Ok(()),
            },
            event = subscription.recv() => match event {
                Some(event) => match event_frame(&event) {
                    Some(frame) => frame,
                    None => continue,
                },
                None => return Ok(()),
            },
        };
        write_frame(&mut writer, &frame).await?;
    }
}

fn event_frame(event: &BusEvent) -> Option<Frame> {
    match event {
        BusEvent::Patch {
            scope,
            patch,
            stamp,
        } => match patch_to_proto(patch) {
            Ok(proto) => Some(Frame::new(Body::PatchEvent(realtime::PatchEvent {
                scope: scope.to_string(),
                patch: Some(proto),
                version: stamp.version,
                updated_at: stamp.updated_at,
            }))),
            Err(e) => {
                error!("Failed to encode patch for {}: {}", scope, e);
                None
            }
        },
        BusEvent::VersionBumped { scope, stamp } => {
            Some(Frame::new(Body::VersionBumped(realtime::VersionBumped {
                scope: scope.to_string(),
                version: stamp.version,
                updated_at: stamp.updated_at,
            })))
        }
    }
}

fn ack_ok(request_id: u64, stamp: VersionStamp) -> Frame {
    Frame::new(Body::Ack(Ack {
        request_id,
        ok: true,
        version: stamp.version,
        updated_at: stamp.updated_at,
        ..Default::default()
    }))
}

fn ack_error(request_id: u64, err: &SyncError) -> Frame {
    Frame::new(Body::Ack(Ack {
        request_id,
        ok: false,
        error_kind: err.kind().as_str().to_string(),
        message: err.to_string(),
        ..Default::default()
    }))
}
