//! Peer-side sync: a cached document, a durable pending slot and the
//! transport used to reach the server.

mod agent;
mod pending;
mod transport;

pub use agent::{AgentCommand, ConflictInfo, FlushOutcome, SyncAgent, SyncStatus};
pub use pending::{FilePendingStore, MemoryPendingStore, PendingStore, PendingWrite};
pub use transport::{InProcessTransport, RespTransport, SettingsTransport};
