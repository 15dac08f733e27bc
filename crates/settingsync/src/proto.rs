/// Protobuf messages for the realtime channel
///
/// Written out with prost derives so no protoc step is needed. Field tags
/// are the wire contract; only ever add new ones.
pub mod realtime {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Clock {
        #[prost(int64, tag = "1")]
        pub timestamp: i64,
        #[prost(string, tag = "2")]
        pub origin: ::prost::alloc::string::String,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Action {
        Unspecified = 0,
        Add = 1,
        Update = 2,
        Remove = 3,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Patch {
        #[prost(string, tag = "1")]
        pub collection: ::prost::alloc::string::String,
        #[prost(enumeration = "Action", tag = "2")]
        pub action: i32,
        #[prost(string, tag = "3")]
        pub item_id: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "4")]
        pub clock: ::core::option::Option<Clock>,
        /// Update only
        #[prost(string, tag = "5")]
        pub field: ::prost::alloc::string::String,
        /// Update only: the new value as JSON text
        #[prost(string, tag = "6")]
        pub value_json: ::prost::alloc::string::String,
        /// Add only: the item payload as a JSON object
        #[prost(string, tag = "7")]
        pub item_json: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Subscribe {
        #[prost(string, tag = "1")]
        pub scope: ::prost::alloc::string::String,
        #[prost(string, optional, tag = "2")]
        pub token: ::core::option::Option<::prost::alloc::string::String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SubmitPatch {
        #[prost(uint64, tag = "1")]
        pub request_id: u64,
        #[prost(string, tag = "2")]
        pub scope: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "3")]
        pub patch: ::core::option::Option<Patch>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Ack {
        #[prost(uint64, tag = "1")]
        pub request_id: u64,
        #[prost(bool, tag = "2")]
        pub ok: bool,
        #[prost(uint64, tag = "3")]
        pub version: u64,
        #[prost(int64, tag = "4")]
        pub updated_at: i64,
        /// Lower-case error kind when `ok` is false
        #[prost(string, tag = "5")]
        pub error_kind: ::prost::alloc::string::String,
        #[prost(string, tag = "6")]
        pub message: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PatchEvent {
        #[prost(string, tag = "1")]
        pub scope: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub patch: ::core::option::Option<Patch>,
        /// Version the patch produced on the server
        #[prost(uint64, tag = "3")]
        pub version: u64,
        #[prost(int64, tag = "4")]
        pub updated_at: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VersionBumped {
        #[prost(string, tag = "1")]
        pub scope: ::prost::alloc::string::String,
        #[prost(uint64, tag = "2")]
        pub version: u64,
        #[prost(int64, tag = "3")]
        pub updated_at: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Frame {
        #[prost(oneof = "frame::Body", tags = "1, 2, 3, 4, 5")]
        pub body: ::core::option::Option<frame::Body>,
    }

    pub mod frame {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Body {
            #[prost(message, tag = "1")]
            Subscribe(super::Subscribe),
            #[prost(message, tag = "2")]
            SubmitPatch(super::SubmitPatch),
            #[prost(message, tag = "3")]
            Ack(super::Ack),
            #[prost(message, tag = "4")]
            PatchEvent(super::PatchEvent),
            #[prost(message, tag = "5")]
            VersionBumped(super::VersionBumped),
        }
    }

    impl Frame {
        pub fn new(body: frame::Body) -> Self {
            Frame { body: Some(body) }
        }
    }
}

// Don't glob re-export to avoid naming conflicts with crate::types
// Users should access protobuf types via proto::realtime::*

use crate::error::{Result, SyncError};
use crate::types::{LogicalClock, Patch, PatchAction};
use serde_json::{Map, Value};

/// Convert internal Patch to protobuf Patch
pub fn patch_to_proto(patch: &Patch) -> Result<realtime::Patch> {
    let mut proto = realtime::Patch {
        collection: patch.collection.clone(),
        item_id: patch.item_id.clone(),
        clock: Some(clock_to_proto(&patch.clock)),
        ..Default::default()
    };

    match &patch.action {
        PatchAction::Add { item } => {
            proto.action = realtime::Action::Add as i32;
            proto.item_json = serde_json::to_string(item)?;
        }
        PatchAction::Update { field, value } => {
            proto.action = realtime::Action::Update as i32;
            proto.field = field.clone();
            proto.value_json = serde_json::to_string(value)?;
        }
        PatchAction::Remove => {
            proto.action = realtime::Action::Remove as i32;
        }
    }
    Ok(proto)
}

/// Convert protobuf Patch to internal Patch, validating its shape
pub fn proto_to_patch(proto: &realtime::Patch) -> Result<Patch> {
    let clock = proto
        .clock
        .as_ref()
        .ok_or_else(|| SyncError::Validation("patch has no clock".into()))?;
    let clock = LogicalClock::new(clock.timestamp, clock.origin.clone());

    let action = match realtime::Action::try_from(proto.action) {
        Ok(realtime::Action::Add) => {
            let item: Map<String, Value> = serde_json::from_str(&proto.item_json)
                .map_err(|e| SyncError::Validation(format!("add item is not an object: {}", e)))?;
            PatchAction::Add { item }
        }
        Ok(realtime::Action::Update) => {
            let value: Value = serde_json::from_str(&proto.value_json)
                .map_err(|e| SyncError::Validation(format!("update value is not JSON: {}", e)))?;
            PatchAction::Update {
                field: proto.field.clone(),
                value,
            }
        }
        Ok(realtime::Action::Remove) => PatchAction::Remove,
        Ok(realtime::Action::Unspecified) | Err(_) => {
            return Err(SyncError::Validation(format!(
                "unknown patch action {}",
                proto.action
            )));
        }
    };

    let patch = Patch {
        collection: proto.collection.clone(),
        item_id: proto.item_id.clone(),
        clock,
        action,
    };
    patch.validate()?;
    Ok(patch)
}

fn clock_to_proto(clock: &LogicalClock) -> realtime::Clock {
    realtime::Clock {
        timestamp: clock.timestamp,
        origin: clock.origin.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use serde_json::json;

    fn clock() -> LogicalClock {
        LogicalClock::new(1000, "X")
    }

    #[test]
    fn test_add_survives_the_wire() {
        let mut item = Map::new();
        item.insert("src".into(), json!("a.jpg"));
        item.insert("tags".into(), json!(["x", 1]));
        let patch = Patch::add("gallery", "p1", item, clock());

        let frame = realtime::Frame::new(realtime::frame::Body::PatchEvent(realtime::PatchEvent {
            scope: "public".into(),
            patch: Some(patch_to_proto(&patch).unwrap()),
            version: 7,
            updated_at: 1000,
        }));
        let bytes = frame.encode_to_vec();
        let decoded = realtime::Frame::decode(&bytes[..]).unwrap();

        let Some(realtime::frame::Body::PatchEvent(event)) = decoded.body else {
            panic!("wrong frame body");
        };
        assert_eq!(proto_to_patch(event.patch.as_ref().unwrap()).unwrap(), patch);
        assert_eq!((event.version, event.updated_at), (7, 1000));
    }

    #[test]
    fn test_update_value_keeps_json_type() {
        let patch = Patch::update("story", "s1", "year", json!(2019), clock());
        let proto = patch_to_proto(&patch).unwrap();
        assert_eq!(proto.value_json, "2019");
        assert_eq!(proto_to_patch(&proto).unwrap(), patch);
    }

    #[test]
    fn test_missing_clock_rejected() {
        let mut proto = patch_to_proto(&Patch::remove("g", "p1", clock())).unwrap();
        proto.clock = None;
        assert!(matches!(
            proto_to_patch(&proto),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let mut proto = patch_to_proto(&Patch::remove("g", "p1", clock())).unwrap();
        proto.action = 0;
        assert!(proto_to_patch(&proto).is_err());
        proto.action = 42;
        assert!(proto_to_patch(&proto).is_err());
    }

    #[test]
    fn test_empty_origin_rejected() {
        let mut proto = patch_to_proto(&Patch::remove("g", "p1", clock())).unwrap();
        proto.clock = Some(realtime::Clock {
            timestamp: 5,
            origin: String::new(),
        });
        assert!(matches!(
            proto_to_patch(&proto),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_add_payload_must_be_object() {
        let mut proto = patch_to_proto(&Patch::add("g", "p1", Map::new(), clock())).unwrap();
        proto.item_json = "[1,2]".into();
        assert!(proto_to_patch(&proto).is_err());
    }
}
