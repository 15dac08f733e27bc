// Architecture modules
pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fanout;
pub mod merge;
pub mod node;
pub mod proto;
pub mod realtime;
pub mod resp;
pub mod server;
pub mod storage;
pub mod types;
pub mod wrapper;

// Public exports
pub use api::ApiServer;
pub use auth::{Authenticator, Caller};
pub use client::{SyncAgent, SyncStatus};
pub use config::Config;
pub use crypto::SettingsCipher;
pub use error::{ErrorKind, Result, SyncError};
pub use fanout::{BusEvent, FanoutBus, SessionId, Subscription};
pub use realtime::{RealtimeClient, RealtimeEvent, RealtimeListener};
pub use server::{PatchOutcome, Server, WriteOutcome};
pub use storage::SqliteStorage;
pub use types::{
    ClientId, CollectionState, Document, Item, LogicalClock, Patch, PatchAction, Scope,
    SettingsRecord, Snapshot, VersionStamp,
};
pub use wrapper::ServerWrapper;
