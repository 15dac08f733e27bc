use crate::api::parse_error_reply;
use crate::auth::Caller;
use crate::error::{Result, SyncError};
use crate::resp::{RespError, RespReader, RespValue, write_value};
use crate::server::WriteOutcome;
use crate::storage::Storage;
use crate::types::{Document, Scope, Snapshot, VersionStamp};
use crate::wrapper::ServerWrapper;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Whole-document fetch/replace as seen by a sync agent
#[async_trait]
pub trait SettingsTransport: Send + Sync {
    /// Current server document, or None if the scope was never written
    async fn fetch(&self, scope: &Scope) -> Result<Option<Snapshot>>;

    /// Replace the server document under the version/timestamp guard
    async fn replace(
        &self,
        scope: &Scope,
        document: &Document,
        known_version: Option<u64>,
        updated_at: Option<i64>,
    ) -> Result<WriteOutcome>;
}

/// Talks to a server in the same process, for embedding and tests
pub struct InProcessTransport<S: Storage> {
    wrapper: Arc<ServerWrapper<S>>,
    caller: Caller,
}

impl<S: Storage> InProcessTransport<S> {
    pub fn new(wrapper: Arc<ServerWrapper<S>>, caller: Caller) -> Self {
        Self { wrapper, caller }
    }
}

#[async_trait]
impl<S: Storage + 'static> SettingsTransport for InProcessTransport<S> {
    async fn fetch(&self, scope: &Scope) -> Result<Option<Snapshot>> {
        self.wrapper.fetch(&self.caller, scope).await
    }

    async fn replace(
        &self,
        scope: &Scope,
        document: &Document,
        known_version: Option<u64>,
        updated_at: Option<i64>,
    ) -> Result<WriteOutcome> {
        self.wrapper
            .replace(&self.caller, scope, document, known_version, updated_at)
            .await
    }
}

struct Connection {
    socket: TcpStream,
    reader: RespReader,
}

/// RESP client for the settings API
///
/// Holds one lazily opened connection. Any I/O or protocol failure drops
/// it so the next call reconnects.
pub struct RespTransport {
    addr: String,
    token: Option<String>,
    max_reply_bytes: usize,
    conn: Mutex<Option<Connection>>,
}

impl RespTransport {
    pub fn new(addr: impl Into<String>, token: Option<String>, max_reply_bytes: usize) -> Self {
        Self {
            addr: addr.into(),
            token,
            max_reply_bytes,
            conn: Mutex::new(None),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self.call(RespValue::command(["PING"])).await? {
            RespValue::SimpleString(s) if s == "PONG" => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// The connection is taken out of its slot for the duration of the call
    /// and only returned after a complete reply, so a call abandoned midway
    /// never leaves unread bytes for the next one.
    async fn call(&self, request: RespValue) -> Result<RespValue> {
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!("Connecting to {}", self.addr);
                Connection {
                    socket: TcpStream::connect(&self.addr).await?,
                    reader: RespReader::new(self.max_reply_bytes),
                }
            }
        };

        let result = async {
            write_value(&mut conn.socket, &request).await?;
            conn.reader
                .read(&mut conn.socket)
                .await?
                .ok_or(RespError::Io(std::io::ErrorKind::UnexpectedEof.into()))
        }
        .await;

        match result {
            Ok(reply) => {
                *slot = Some(conn);
                match reply {
                    RespValue::Error(reply) => Err(parse_error_reply(&reply)),
                    reply => Ok(reply),
                }
            }
            Err(e) => Err(SyncError::TransientIo(e.to_string())),
        }
    }

    fn with_options(&self, mut parts: Vec<String>) -> RespValue {
        if let Some(token) = &self.token {
            parts.push("AUTH".into());
            parts.push(token.clone());
        }
        RespValue::command(parts)
    }
}

#[async_trait]
impl SettingsTransport for RespTransport {
    async fn fetch(&self, scope: &Scope) -> Result<Option<Snapshot>> {
        let request = self.with_options(vec!["GET".into(), scope.to_string()]);
        match self.call(request).await? {
            RespValue::Null => Ok(None),
            RespValue::Array(items) => match items.as_slice() {
                [version, updated_at, document] => Ok(Some(snapshot(version, updated_at, document)?)),
                _ => Err(SyncError::TransientIo("malformed GET reply".into())),
            },
            other => Err(unexpected(&other)),
        }
    }

    async fn replace(
        &self,
        scope: &Scope,
        document: &Document,
        known_version: Option<u64>,
        updated_at: Option<i64>,
    ) -> Result<WriteOutcome> {
        let json = String::from_utf8(document.to_json()?)
            .map_err(|e| SyncError::Validation(e.to_string()))?;
        let mut parts = vec!["PUT".to_string(), scope.to_string(), json];
        if let Some(version) = known_version {
            parts.push("VERSION".into());
            parts.push(version.to_string());
        }
        if let Some(updated_at) = updated_at {
            parts.push("UPDATEDAT".into());
            parts.push(updated_at.to_string());
        }

        let reply = self.call(self.with_options(parts)).await?;
        let RespValue::Array(items) = &reply else {
            return Err(unexpected(&reply));
        };
        match items.as_slice() {
            [RespValue::SimpleString(status), version, updated_at] if status == "OK" => {
                Ok(WriteOutcome::Accepted(stamp(version, updated_at)?))
            }
            [RespValue::SimpleString(status), version, updated_at, document]
                if status == "CONFLICT" =>
            {
                Ok(WriteOutcome::Conflict(snapshot(version, updated_at, document)?))
            }
            _ => Err(unexpected(&reply)),
        }
    }
}

fn stamp(version: &RespValue, updated_at: &RespValue) -> Result<VersionStamp> {
    match (version.as_integer(), updated_at.as_integer()) {
        (Some(version), Some(updated_at)) if version >= 0 => Ok(VersionStamp {
            version: version as u64,
            updated_at,
        }),
        _ => Err(SyncError::TransientIo("malformed version in reply".into())),
    }
}

fn snapshot(version: &RespValue, updated_at: &RespValue, document: &RespValue) -> Result<Snapshot> {
    let stamp = stamp(version, updated_at)?;
    let RespValue::BulkString(json) = document else {
        return Err(unexpected(document));
    };
    Ok(Snapshot {
        document: Document::from_json(json)?,
        version: stamp.version,
        updated_at: stamp.updated_at,
    })
}

fn unexpected(reply: &RespValue) -> SyncError {
    SyncError::TransientIo(format!("unexpected reply: {:?}", reply))
}
