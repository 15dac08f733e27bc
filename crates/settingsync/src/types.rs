use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved item field. Its clock records when the item was first created.
pub const ITEM_ID_FIELD: &str = "id";

/// Wall clock in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Identifier of one peer (a browser tab, a CLI, a test client)
///
/// Generated from 122 random bits (UUID v4), never from a counter, so ids
/// minted independently by different peers do not collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logical timestamp used for last-writer-wins decisions
///
/// Total order: `timestamp` first, then `origin` lexicographically. An absent
/// clock (`Option::None`) sorts before every present clock, and two absent
/// clocks are equal, which is exactly how `Option<LogicalClock>` orders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalClock {
    pub timestamp: i64,
    pub origin: String,
}

impl LogicalClock {
    pub fn new(timestamp: i64, origin: impl Into<String>) -> Self {
        Self {
            timestamp,
            origin: origin.into(),
        }
    }

    pub fn now(origin: &ClientId) -> Self {
        Self::new(now_millis(), origin.as_str())
    }
}

impl Ord for LogicalClock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for LogicalClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two possibly-absent clocks
pub fn compare_clocks(a: Option<&LogicalClock>, b: Option<&LogicalClock>) -> Ordering {
    a.cmp(&b)
}

/// An isolated document namespace
///
/// Human-readable format: "public" or "owner:<id>"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    Public,
    Owner(String),
}

impl Scope {
    pub fn owner(id: impl Into<String>) -> Self {
        Scope::Owner(id.into())
    }

    pub fn requires_auth(&self) -> bool {
        matches!(self, Scope::Owner(_))
    }

    pub fn owner_id(&self) -> Option<&str> {
        match self {
            Scope::Public => None,
            Scope::Owner(id) => Some(id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Public => write!(f, "public"),
            Scope::Owner(id) => write!(f, "owner:{}", id),
        }
    }
}

impl FromStr for Scope {
    type Err = ScopeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "public" {
            return Ok(Scope::Public);
        }
        match s.strip_prefix("owner:") {
            Some("") => Err(ScopeError::EmptyOwner),
            Some(id) => Ok(Scope::Owner(id.to_string())),
            None => Err(ScopeError::InvalidFormat(s.to_string())),
        }
    }
}

impl TryFrom<String> for Scope {
    type Error = ScopeError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

/// Errors that can occur when parsing a Scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    InvalidFormat(String),
    EmptyOwner,
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeError::InvalidFormat(s) => {
                write!(f, "Invalid scope '{}' (expected 'public' or 'owner:<id>')", s)
            }
            ScopeError::EmptyOwner => write!(f, "Owner scope requires a non-empty id"),
        }
    }
}

impl std::error::Error for ScopeError {}

impl From<ScopeError> for SyncError {
    fn from(e: ScopeError) -> Self {
        SyncError::Validation(e.to_string())
    }
}

/// An addressable element of an ordered collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Item {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Per-collection merge state: the ordered items plus the clock bookkeeping
/// that makes concurrent edits converge.
///
/// Mutated only by the merge engine so clocks cannot be bypassed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionState {
    #[serde(default)]
    pub(crate) items: Vec<Item>,
    #[serde(default)]
    pub(crate) field_clocks: BTreeMap<String, BTreeMap<String, LogicalClock>>,
    #[serde(default)]
    pub(crate) tombstones: BTreeMap<String, LogicalClock>,
}

impl CollectionState {
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn item(&self, id: &str) -> Option<&Item> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    pub fn field_clock(&self, id: &str, field: &str) -> Option<&LogicalClock> {
        self.field_clocks.get(id).and_then(|clocks| clocks.get(field))
    }

    /// Clock of the add that created the item
    pub fn creation_clock(&self, id: &str) -> Option<&LogicalClock> {
        self.field_clock(id, ITEM_ID_FIELD)
    }

    pub fn tombstone(&self, id: &str) -> Option<&LogicalClock> {
        self.tombstones.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.field_clocks.is_empty() && self.tombstones.is_empty()
    }
}

/// The full settings object stored per scope
///
/// `collections` are merged field-by-field; everything else under `settings`
/// (theme, copy text, ...) is only ever replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) collections: BTreeMap<String, CollectionState>,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            return Err(SyncError::Validation(
                "document must be a JSON object".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| SyncError::TransientIo(format!("serialize document: {}", e)))
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionState> {
        self.collections.get(name)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Replace a scalar setting. The `collections` key is reserved.
    pub fn set_setting(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if key == "collections" {
            return false;
        }
        self.settings.insert(key, value);
        true
    }
}

/// The action carried by a patch, with the fields each action requires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PatchAction {
    Add { item: Map<String, Value> },
    Update { field: String, value: Value },
    Remove,
}

impl PatchAction {
    pub fn name(&self) -> &'static str {
        match self {
            PatchAction::Add { .. } => "add",
            PatchAction::Update { .. } => "update",
            PatchAction::Remove => "remove",
        }
    }
}

/// A single incremental operation against one item of one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub collection: String,
    pub item_id: String,
    pub clock: LogicalClock,
    #[serde(flatten)]
    pub action: PatchAction,
}

impl Patch {
    pub fn add(
        collection: impl Into<String>,
        item_id: impl Into<String>,
        item: Map<String, Value>,
        clock: LogicalClock,
    ) -> Self {
        Self {
            collection: collection.into(),
            item_id: item_id.into(),
            clock,
            action: PatchAction::Add { item },
        }
    }

    pub fn update(
        collection: impl Into<String>,
        item_id: impl Into<String>,
        field: impl Into<String>,
        value: Value,
        clock: LogicalClock,
    ) -> Self {
        Self {
            collection: collection.into(),
            item_id: item_id.into(),
            clock,
            action: PatchAction::Update {
                field: field.into(),
                value,
            },
        }
    }

    pub fn remove(
        collection: impl Into<String>,
        item_id: impl Into<String>,
        clock: LogicalClock,
    ) -> Self {
        Self {
            collection: collection.into(),
            item_id: item_id.into(),
            clock,
            action: PatchAction::Remove,
        }
    }

    /// Boundary check run before a patch may enter the merge engine
    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(SyncError::Validation("patch collection is empty".into()));
        }
        if self.item_id.is_empty() {
            return Err(SyncError::Validation("patch itemId is empty".into()));
        }
        if self.clock.origin.is_empty() {
            return Err(SyncError::Validation("patch clock origin is empty".into()));
        }
        if self.clock.timestamp < 0 {
            return Err(SyncError::Validation(
                "patch clock timestamp is negative".into(),
            ));
        }
        match &self.action {
            PatchAction::Add { item } => match item.get(ITEM_ID_FIELD) {
                None => Ok(()),
                Some(Value::String(id)) if *id == self.item_id => Ok(()),
                Some(_) => Err(SyncError::Validation(
                    "add payload id does not match itemId".into(),
                )),
            },
            PatchAction::Update { field, .. } if field.is_empty() => {
                Err(SyncError::Validation("update field is empty".into()))
            }
            PatchAction::Update { field, .. } if field == ITEM_ID_FIELD => Err(
                SyncError::Validation("item id cannot be updated".into()),
            ),
            PatchAction::Update { .. } | PatchAction::Remove => Ok(()),
        }
    }
}

/// Version and wall-clock timestamp of a scope's record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionStamp {
    pub version: u64,
    pub updated_at: i64,
}

/// A decrypted document with its version metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub document: Document,
    pub version: u64,
    pub updated_at: i64,
}

impl Snapshot {
    pub fn stamp(&self) -> VersionStamp {
        VersionStamp {
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

/// The encrypted form of a scope's document as persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsRecord {
    pub version: u64,
    pub updated_at: i64,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

impl SettingsRecord {
    pub fn stamp(&self) -> VersionStamp {
        VersionStamp {
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}
