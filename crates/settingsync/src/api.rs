use crate::error::{ErrorKind, SyncError};
use crate::resp::{RespError, RespReader, RespValue, write_value};
use crate::server::WriteOutcome;
use crate::storage::Storage;
use crate::types::{Document, Scope, Snapshot};
use crate::wrapper::ServerWrapper;
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// RESP request/response surface for whole-document fetch and replace
pub struct ApiServer<S: Storage> {
    wrapper: Arc<ServerWrapper<S>>,
    max_request_bytes: usize,
}

impl<S: Storage + 'static> ApiServer<S> {
    pub fn new(wrapper: Arc<ServerWrapper<S>>, max_request_bytes: usize) -> Self {
        Self {
            wrapper,
            max_request_bytes,
        }
    }

    pub async fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("API server listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (socket, addr) = listener.accept().await?;
            debug!("New connection from {}", addr);

            let wrapper = Arc::clone(&self.wrapper);
            let max_bytes = self.max_request_bytes;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, wrapper, max_bytes).await {
                    error!("Connection error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection<S: Storage>(
    mut socket: TcpStream,
    wrapper: Arc<ServerWrapper<S>>,
    max_bytes: usize,
) -> Result<(), RespError> {
    let mut reader = RespReader::new(max_bytes);

    loop {
        match reader.read(&mut socket).await {
            Ok(Some(value)) => {
                let response = process_command(&wrapper, value).await;
                write_value(&mut socket, &response).await?;
            }
            Ok(None) => {
                debug!("Connection closed");
                return Ok(());
            }
            Err(RespError::Io(e)) => return Err(RespError::Io(e)),
            Err(e) => {
                error!("Protocol error: {}", e);
                let response = error_reply(&SyncError::Validation(e.to_string()));
                write_value(&mut socket, &response).await?;
                return Ok(());
            }
        }
    }
}

async fn process_command<S: Storage>(wrapper: &ServerWrapper<S>, value: RespValue) -> RespValue {
    // Extract command array
    let parts = match value.as_bulk_string_array() {
        Some(parts) if !parts.is_empty() => parts,
        _ => return validation_error("invalid command format"),
    };

    // Get command name (case-insensitive)
    let cmd = String::from_utf8_lossy(&parts[0]).to_uppercase();

    let result = match cmd.as_str() {
        "GET" => cmd_get(wrapper, &parts).await,
        "PUT" => cmd_put(wrapper, &parts).await,
        "PING" => Ok(RespValue::simple("PONG")),
        _ => Err(SyncError::Validation(format!("unknown command '{}'", cmd))),
    };

    result.unwrap_or_else(|e| error_reply(&e))
}

async fn cmd_get<S: Storage>(
    wrapper: &ServerWrapper<S>,
    parts: &[Bytes],
) -> Result<RespValue, SyncError> {
    if parts.len() < 2 {
        return Err(wrong_arity("get"));
    }
    let scope = parse_scope(&parts[1])?;
    let options = Options::parse(&parts[2..])?;
    if options.version.is_some() || options.updated_at.is_some() {
        return Err(SyncError::Validation(
            "GET accepts only the AUTH option".into(),
        ));
    }

    let caller = wrapper.authenticate(options.auth.as_deref())?;
    match wrapper.fetch(&caller, &scope).await? {
        Some(snapshot) => snapshot_reply(None, &snapshot),
        None => Ok(RespValue::Null),
    }
}

async fn cmd_put<S: Storage>(
    wrapper: &ServerWrapper<S>,
    parts: &[Bytes],
) -> Result<RespValue, SyncError> {
    if parts.len() < 3 {
        return Err(wrong_arity("put"));
    }
    let scope = parse_scope(&parts[1])?;
    let document = Document::from_json(&parts[2])?;
    let options = Options::parse(&parts[3..])?;

    let caller = wrapper.authenticate(options.auth.as_deref())?;
    let outcome = wrapper
        .replace(&caller, &scope, &document, options.version, options.updated_at)
        .await?;

    match outcome {
        WriteOutcome::Accepted(stamp) => {
            debug!("PUT {} accepted at v{}", scope, stamp.version);
            Ok(RespValue::Array(vec![
                RespValue::simple("OK"),
                RespValue::Integer(stamp.version as i64),
                RespValue::Integer(stamp.updated_at),
            ]))
        }
        WriteOutcome::Conflict(snapshot) => snapshot_reply(Some("CONFLICT"), &snapshot),
    }
}

/// Trailing `VERSION n`, `UPDATEDAT ms` and `AUTH token` pairs
#[derive(Debug, Default)]
struct Options {
    version: Option<u64>,
    updated_at: Option<i64>,
    auth: Option<String>,
}

impl Options {
    fn parse(parts: &[Bytes]) -> Result<Self, SyncError> {
        if parts.len() % 2 != 0 {
            return Err(SyncError::Validation("options must be key/value pairs".into()));
        }

        let mut options = Options::default();
        for pair in parts.chunks(2) {
            let key = String::from_utf8_lossy(&pair[0]).to_uppercase();
            let value = String::from_utf8_lossy(&pair[1]).to_string();
            match key.as_str() {
                "VERSION" => {
                    options.version = Some(value.parse().map_err(|_| {
                        SyncError::Validation(format!("invalid VERSION '{}'", value))
                    })?)
                }
                "UPDATEDAT" => {
                    options.updated_at = Some(value.parse().map_err(|_| {
                        SyncError::Validation(format!("invalid UPDATEDAT '{}'", value))
                    })?)
                }
                "AUTH" => options.auth = Some(value),
                _ => {
                    return Err(SyncError::Validation(format!(
                        "unknown option '{}'",
                        key
                    )));
                }
            }
        }
        Ok(options)
    }
}

fn parse_scope(raw: &Bytes) -> Result<Scope, SyncError> {
    Ok(String::from_utf8_lossy(raw).parse::<Scope>()?)
}

fn snapshot_reply(status: Option<&str>, snapshot: &Snapshot) -> Result<RespValue, SyncError> {
    let mut reply = Vec::with_capacity(4);
    if let Some(status) = status {
        reply.push(RespValue::simple(status));
    }
    reply.push(RespValue::Integer(snapshot.version as i64));
    reply.push(RespValue::Integer(snapshot.updated_at));
    reply.push(RespValue::bulk(snapshot.document.to_json()?));
    Ok(RespValue::Array(reply))
}

fn wrong_arity(cmd: &str) -> SyncError {
    SyncError::Validation(format!("wrong number of arguments for '{}' command", cmd))
}

fn validation_error(msg: &str) -> RespValue {
    error_reply(&SyncError::Validation(msg.to_string()))
}

/// `-<KIND> message` with the upper-cased error kind
pub fn error_reply(err: &SyncError) -> RespValue {
    let message = match err {
        SyncError::Validation(m)
        | SyncError::Authorization(m)
        | SyncError::TransientIo(m)
        | SyncError::FatalConfiguration(m) => m.clone(),
        SyncError::Conflict(snapshot) => format!("server is at version {}", snapshot.version),
    };
    RespValue::Error(format!(
        "{} {}",
        err.kind().as_str().to_uppercase(),
        message
    ))
}

/// Inverse of `error_reply`, for clients
pub fn parse_error_reply(reply: &str) -> SyncError {
    let (kind, message) = reply.split_once(' ').unwrap_or((reply, ""));
    match ErrorKind::parse(kind) {
        Some(kind) => SyncError::from_remote(kind, message),
        None => SyncError::TransientIo(format!("unexpected error reply: {}", reply)),
    }
}
