use crate::auth::{Authenticator, Caller};
use crate::error::Result;
use crate::fanout::{FanoutBus, SessionId};
use crate::server::{PatchOutcome, Server, WriteOutcome};
use crate::storage::Storage;
use crate::types::{Document, Patch, Scope, Snapshot, VersionStamp, now_millis};
use std::sync::Arc;
use tracing::{debug, info};

/// Wrapper that coordinates Server, the fan-out bus and authentication
///
/// This is the glue layer that:
/// - Authorizes the caller for the scope before touching storage
/// - Calls Server methods for the store semantics
/// - Publishes resulting events on the bus
/// - Returns clean results to the API and realtime layers
///
/// Reads pass through to Server once authorized.
pub struct ServerWrapper<S: Storage> {
    server: Arc<Server<S>>,
    bus: FanoutBus,
    auth: Arc<Authenticator>,
}

impl<S: Storage> ServerWrapper<S> {
    pub fn new(server: Arc<Server<S>>, bus: FanoutBus, auth: Arc<Authenticator>) -> Self {
        Self { server, bus, auth }
    }

    pub fn bus(&self) -> &FanoutBus {
        &self.bus
    }

    pub fn authenticate(&self, token: Option<&str>) -> Result<Caller> {
        self.auth.authenticate(token)
    }

    /// Current document for a scope
    pub async fn fetch(&self, caller: &Caller, scope: &Scope) -> Result<Option<Snapshot>> {
        caller.authorize(scope)?;
        self.server.read(scope).await
    }

    /// Replace the whole document
    ///
    /// Without a client timestamp the server wall clock is used. An accepted
    /// replace tells every realtime subscriber to refetch.
    pub async fn replace(
        &self,
        caller: &Caller,
        scope: &Scope,
        document: &Document,
        client_version: Option<u64>,
        client_updated_at: Option<i64>,
    ) -> Result<WriteOutcome> {
        caller.authorize(scope)?;
        let updated_at = client_updated_at.unwrap_or_else(now_millis);

        self.server
            .write_and_notify(scope, document, client_version, updated_at, |stamp| {
                self.bus.publish_version(scope, stamp)
            })
            .await
    }

    /// Apply a patch submitted by a realtime session
    ///
    /// Malformed patches fail validation before authorization is checked, and
    /// neither failure reaches other subscribers. A patch that changes the
    /// document is forwarded to every other session, tagged with the version
    /// it produced, and followed by a version bump for all of them. Events
    /// are published before the scope is unlocked so they leave in version
    /// order.
    pub async fn submit_patch(
        &self,
        session: Option<SessionId>,
        caller: &Caller,
        scope: &Scope,
        patch: &Patch,
    ) -> Result<VersionStamp> {
        patch.validate()?;
        caller.authorize(scope)?;

        let outcome = self
            .server
            .apply_patch_and_notify(scope, patch, |stamp| {
                self.bus.publish_patch(scope, session, patch, stamp);
                self.bus.publish_version(scope, stamp);
            })
            .await?;
        match outcome {
            PatchOutcome::Applied(stamp) => {
                info!(
                    "Applied {} {}/{} on {} at v{}",
                    patch.action.name(),
                    patch.collection,
                    patch.item_id,
                    scope,
                    stamp.version
                );
                Ok(stamp)
            }
            PatchOutcome::Unchanged(stamp) => {
                debug!("No-op patch on {}, not broadcast", scope);
                Ok(stamp)
            }
        }
    }
}
