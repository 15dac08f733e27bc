//! Field-level last-writer-wins merge for ordered collections.
//!
//! Every item field carries the clock of the last accepted write; removals
//! leave a tombstone that dominates every operation with a clock at or below
//! it. Applying the same set of patches in any delivery order, any number of
//! times, converges to the same state (given that an item's creating add is
//! delivered before the operations that build on it).

use crate::types::{
    CollectionState, Document, ITEM_ID_FIELD, Item, LogicalClock, Patch, PatchAction,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::trace;

/// Apply one patch to a collection and return the resulting collection.
///
/// The input is never mutated; callers propagate the returned value.
pub fn apply_patch(state: &CollectionState, patch: &Patch) -> CollectionState {
    let mut next = state.clone();
    apply_in_place(&mut next, patch);
    next
}

fn apply_in_place(state: &mut CollectionState, patch: &Patch) {
    if let Some(tombstone) = state.tombstones.get(&patch.item_id) {
        if *tombstone >= patch.clock {
            trace!(
                "{} on {} dominated by tombstone {:?}",
                patch.action.name(),
                patch.item_id,
                tombstone
            );
            return;
        }
    }

    match &patch.action {
        PatchAction::Remove => remove_item(state, &patch.item_id, &patch.clock),
        PatchAction::Add { item } => add_item(state, &patch.item_id, item, &patch.clock),
        PatchAction::Update { field, value } => {
            let Some(index) = state.position(&patch.item_id) else {
                trace!("update for unknown item {} dropped", patch.item_id);
                return;
            };
            write_field(state, index, field, value, &patch.clock);
        }
    }
}

fn remove_item(state: &mut CollectionState, id: &str, clock: &LogicalClock) {
    state.tombstones.insert(id.to_string(), clock.clone());
    state.items.retain(|item| item.id != id);
    state.field_clocks.remove(id);
}

fn add_item(state: &mut CollectionState, id: &str, payload: &Map<String, Value>, clock: &LogicalClock) {
    let fields = payload
        .iter()
        .filter(|(name, _)| name.as_str() != ITEM_ID_FIELD);

    let Some(index) = state.position(id) else {
        let mut clocks = BTreeMap::new();
        clocks.insert(ITEM_ID_FIELD.to_string(), clock.clone());
        let mut values = Map::new();
        for (name, value) in fields {
            clocks.insert(name.clone(), clock.clone());
            values.insert(name.clone(), value.clone());
        }
        state.field_clocks.insert(id.to_string(), clocks);

        let at = insertion_index(state, id, Some(clock));
        state.items.insert(
            at,
            Item {
                id: id.to_string(),
                fields: values,
            },
        );
        return;
    };

    // Concurrent creation under the same id: merge field by field.
    for (name, value) in fields {
        write_field(state, index, name, value, clock);
    }

    // The item sits where its earliest add puts it.
    let earlier = state
        .creation_clock(id)
        .is_none_or(|created| clock < created);
    if earlier {
        state
            .field_clocks
            .entry(id.to_string())
            .or_default()
            .insert(ITEM_ID_FIELD.to_string(), clock.clone());
        let item = state.items.remove(index);
        let at = insertion_index(state, id, Some(clock));
        state.items.insert(at, item);
    }
}

/// Overwrite one field if `clock` is strictly newer than the stored one
fn write_field(
    state: &mut CollectionState,
    index: usize,
    field: &str,
    value: &Value,
    clock: &LogicalClock,
) -> bool {
    let id = state.items[index].id.clone();
    let clocks = state.field_clocks.entry(id).or_default();
    if clocks.get(field).is_some_and(|stored| clock <= stored) {
        return false;
    }
    clocks.insert(field.to_string(), clock.clone());
    state.items[index]
        .fields
        .insert(field.to_string(), value.clone());
    true
}

/// First position whose (creation clock, id) sorts after the given key.
/// Items without a creation clock (written wholesale) sort first.
fn insertion_index(state: &CollectionState, id: &str, clock: Option<&LogicalClock>) -> usize {
    let key = (clock, id);
    state
        .items
        .iter()
        .position(|item| (state.creation_clock(&item.id), item.id.as_str()) > key)
        .unwrap_or(state.items.len())
}

impl Document {
    /// Apply a patch to the named collection, creating it only if the patch
    /// changes something.
    pub fn apply_patch(&self, patch: &Patch) -> Document {
        let base = self
            .collections
            .get(&patch.collection)
            .cloned()
            .unwrap_or_default();
        let merged = apply_patch(&base, patch);
        if merged == base {
            return self.clone();
        }
        let mut next = self.clone();
        next.collections.insert(patch.collection.clone(), merged);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clock(ts: i64, origin: &str) -> LogicalClock {
        LogicalClock::new(ts, origin)
    }

    fn photo(src: &str) -> Map<String, Value> {
        let mut item = Map::new();
        item.insert("src".into(), json!(src));
        item.insert("caption".into(), json!(""));
        item
    }

    fn apply_all(patches: &[&Patch]) -> CollectionState {
        patches
            .iter()
            .fold(CollectionState::default(), |state, p| apply_patch(&state, p))
    }

    #[test]
    fn test_add_appends_and_stamps_fields() {
        let add = Patch::add("gallery", "p1", photo("a.jpg"), clock(1000, "X"));
        let state = apply_all(&[&add]);

        assert_eq!(state.items().len(), 1);
        assert_eq!(state.item("p1").unwrap().get("src"), Some(&json!("a.jpg")));
        assert_eq!(state.field_clock("p1", "src"), Some(&clock(1000, "X")));
        assert_eq!(state.field_clock("p1", "caption"), Some(&clock(1000, "X")));
        assert_eq!(state.creation_clock("p1"), Some(&clock(1000, "X")));
    }

    #[test]
    fn test_apply_does_not_mutate_input() {
        let add = Patch::add("gallery", "p1", photo("a.jpg"), clock(1, "X"));
        let before = CollectionState::default();
        let after = apply_patch(&before, &add);
        assert!(before.is_empty());
        assert!(!after.is_empty());
    }

    #[test]
    fn test_idempotence() {
        let add = Patch::add("gallery", "p1", photo("a.jpg"), clock(1, "X"));
        let upd = Patch::update("gallery", "p1", "caption", json!("hi"), clock(2, "Y"));
        let rem = Patch::remove("gallery", "p2", clock(3, "Z"));

        for p in [&add, &upd, &rem] {
            let once = apply_all(&[&add, p]);
            let twice = apply_all(&[&add, p, p]);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_lww_field_update() {
        let add = Patch::add("gallery", "p1", photo("a.jpg"), clock(1, "X"));
        let at5 = Patch::update("gallery", "p1", "caption", json!("five"), clock(5, "X"));
        let at3 = Patch::update("gallery", "p1", "caption", json!("three"), clock(3, "X"));
        let at7 = Patch::update("gallery", "p1", "caption", json!("seven"), clock(7, "X"));

        let state = apply_all(&[&add, &at5, &at3]);
        assert_eq!(state.item("p1").unwrap().get("caption"), Some(&json!("five")));

        let state = apply_patch(&state, &at7);
        assert_eq!(state.item("p1").unwrap().get("caption"), Some(&json!("seven")));
        assert_eq!(state.field_clock("p1", "caption"), Some(&clock(7, "X")));
    }

    #[test]
    fn test_equal_clock_update_is_noop() {
        let add = Patch::add("gallery", "p1", photo("a.jpg"), clock(5, "X"));
        let same = Patch::update("gallery", "p1", "src", json!("b.jpg"), clock(5, "X"));
        let state = apply_all(&[&add, &same]);
        assert_eq!(state.item("p1").unwrap().get("src"), Some(&json!("a.jpg")));
    }

    #[test]
    fn test_update_unknown_item_dropped() {
        let upd = Patch::update("gallery", "ghost", "src", json!("x"), clock(9, "Y"));
        let state = apply_all(&[&upd]);
        assert!(state.is_empty());
    }

    #[test]
    fn test_remove_dominates_older_update_in_either_order() {
        let add = Patch::add("gallery", "I", photo("a.jpg"), clock(1, "X"));
        let p1 = Patch::update("gallery", "I", "caption", json!("F"), clock(10, "X"));
        let p2 = Patch::remove("gallery", "I", clock(20, "X"));

        let a = apply_all(&[&add, &p1, &p2]);
        let b = apply_all(&[&add, &p2, &p1]);
        assert!(a.item("I").is_none());
        assert!(b.item("I").is_none());
        assert_eq!(a, b);
    }

    #[test]
    fn test_stale_remove_redelivery_is_noop() {
        let add = Patch::add("gallery", "p1", photo("a.jpg"), clock(1000, "Z"));
        let upd = Patch::update("gallery", "p1", "caption", json!("c"), clock(2000, "Z"));
        let rem = Patch::remove("gallery", "p1", clock(3000, "Z"));
        let older_rem = Patch::remove("gallery", "p1", clock(2500, "Z"));

        let state = apply_all(&[&add, &upd, &rem]);
        assert!(state.item("p1").is_none());
        assert_eq!(apply_patch(&state, &rem), state);
        assert_eq!(apply_patch(&state, &older_rem), state);
        assert_eq!(state.tombstone("p1"), Some(&clock(3000, "Z")));
    }

    #[test]
    fn test_add_older_than_tombstone_cannot_resurrect() {
        let rem = Patch::remove("gallery", "p1", clock(50, "Z"));
        let add = Patch::add("gallery", "p1", photo("a.jpg"), clock(40, "X"));
        let state = apply_all(&[&rem, &add]);
        assert!(state.item("p1").is_none());
    }

    #[test]
    fn test_concurrent_add_same_id_merges_fields() {
        let mut left = Map::new();
        left.insert("src".into(), json!("left.jpg"));
        left.insert("caption".into(), json!("left"));
        let mut right = Map::new();
        right.insert("src".into(), json!("right.jpg"));
        right.insert("date".into(), json!("2024-05-01"));

        let a = Patch::add("gallery", "p1", left, clock(10, "A"));
        let b = Patch::add("gallery", "p1", right, clock(10, "B"));

        let ab = apply_all(&[&a, &b]);
        let ba = apply_all(&[&b, &a]);
        assert_eq!(ab, ba);
        assert_eq!(ab.items().len(), 1);
        let item = ab.item("p1").unwrap();
        assert_eq!(item.get("src"), Some(&json!("right.jpg")));
        assert_eq!(item.get("caption"), Some(&json!("left")));
        assert_eq!(item.get("date"), Some(&json!("2024-05-01")));
        assert_eq!(ab.creation_clock("p1"), Some(&clock(10, "A")));
    }

    #[test]
    fn test_sequence_order_independent_of_delivery() {
        let first = Patch::add("story", "a", photo("1"), clock(1, "X"));
        let second = Patch::add("story", "b", photo("2"), clock(2, "Y"));
        let third = Patch::add("story", "c", photo("3"), clock(3, "X"));

        let in_order = apply_all(&[&first, &second, &third]);
        let shuffled = apply_all(&[&third, &first, &second]);
        assert_eq!(in_order, shuffled);
        let ids: Vec<_> = in_order.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_scenario_add_beats_earlier_update() {
        let add = Patch::add("gallery", "p1", photo("a.jpg"), clock(1000, "X"));
        let upd = Patch::update("gallery", "p1", "src", json!("y.jpg"), clock(999, "Y"));

        for state in [apply_all(&[&add, &upd]), apply_all(&[&upd, &add])] {
            assert_eq!(state.item("p1").unwrap().get("src"), Some(&json!("a.jpg")));
        }
    }

    #[test]
    fn test_document_collection_created_lazily() {
        let doc = Document::new();
        let noop = Patch::update("gallery", "p1", "src", json!("x"), clock(1, "X"));
        let unchanged = doc.apply_patch(&noop);
        assert_eq!(unchanged, doc);
        assert!(unchanged.collection("gallery").is_none());

        let add = Patch::add("gallery", "p1", photo("a.jpg"), clock(1, "X"));
        let changed = doc.apply_patch(&add);
        assert!(changed.collection("gallery").is_some());
        assert!(doc.collection("gallery").is_none());
    }

    #[test]
    fn test_legacy_items_without_clocks_stay_first() {
        let doc = Document::from_json(
            br#"{"collections":{"gallery":{"items":[{"id":"old","src":"o.jpg"}]}}}"#,
        )
        .unwrap();
        let add = Patch::add("gallery", "new", photo("n.jpg"), clock(1, "X"));
        let upd = Patch::update("gallery", "old", "src", json!("o2.jpg"), clock(1, "X"));
        let doc = doc.apply_patch(&add).apply_patch(&upd);
        let gallery = doc.collection("gallery").unwrap();
        let ids: Vec<_> = gallery.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["old", "new"]);
        assert_eq!(gallery.item("old").unwrap().get("src"), Some(&json!("o2.jpg")));
    }
}
