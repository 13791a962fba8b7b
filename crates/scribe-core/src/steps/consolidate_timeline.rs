//! Version 10: fold message-like timeline events into the messages collection.
//!
//! Before the per-row pass, rows already living in the messages and edits
//! collections under a legacy type label are relabeled in bulk. Each
//! allow-listed timeline entry is then projected sparsely, upserted into
//! messages by `eventId`, and removed from the timeline. Entries that have no
//! usable key are left in the timeline and logged.

use serde_json::{Value, json};

use super::{MigrationStep, RowOutcome, StepContext, StepError, StepStats};
use crate::adapter::{Filter, Insert, Remove, Select, Update};
use crate::record::{self, EVENT_ID, Record, TimelineEntry, collections, event_types};

/// Legacy type label rewritten to its canonical event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeRelabel {
    pub from: &'static str,
    pub to: &'static str,
}

const MESSAGE_TYPES: [&str; 4] = [
    event_types::ROOM_CREATE,
    event_types::ROOM_MESSAGE,
    event_types::PINNED_EVENTS,
    event_types::STICKER,
];

const LEGACY_LABELS: [TypeRelabel; 4] = [
    TypeRelabel {
        from: "create",
        to: event_types::ROOM_CREATE,
    },
    TypeRelabel {
        from: "message",
        to: event_types::ROOM_MESSAGE,
    },
    TypeRelabel {
        from: "pinned_events",
        to: event_types::PINNED_EVENTS,
    },
    TypeRelabel {
        from: "sticker",
        to: event_types::STICKER,
    },
];

/// Timeline → messages consolidation.
#[derive(Debug, Clone)]
pub struct ConsolidateTimeline {
    pub message_types: Vec<&'static str>,
    pub relabels: Vec<TypeRelabel>,
}

impl Default for ConsolidateTimeline {
    fn default() -> Self {
        Self {
            message_types: MESSAGE_TYPES.to_vec(),
            relabels: LEGACY_LABELS.to_vec(),
        }
    }
}

impl ConsolidateTimeline {
    fn relabel(&self, ctx: &StepContext<'_>) -> Result<usize, StepError> {
        let mut updated = 0;
        for collection in [collections::MESSAGES, collections::MESSAGE_EDITS] {
            for relabel in &self.relabels {
                let mut set = Record::new();
                set.insert("type".into(), json!(relabel.to));
                updated += ctx.adapter.update(&Update {
                    collection,
                    set,
                    filter: Filter::where_eq("type", relabel.from),
                })?;
            }
        }
        Ok(updated)
    }

    fn consolidate_type(&self, ctx: &StepContext<'_>, kind: &str) -> Result<StepStats, StepError> {
        let rows = ctx.adapter.select(
            &Select::new(collections::TIMELINE).filter(Filter::where_eq("type", kind)),
        )?;
        tracing::debug!(version = ctx.version, kind, rows = rows.len(), "timeline rows selected");

        ctx.for_each_row(
            rows,
            |row| row.get(EVENT_ID).and_then(Value::as_str).map(str::to_owned),
            |row| {
                let entry: TimelineEntry = match record::decode(row.clone()) {
                    Ok(entry) => entry,
                    Err(error) => {
                        tracing::warn!(version = ctx.version, kind, %error, "skipping malformed timeline entry");
                        return Ok(RowOutcome::Skipped);
                    }
                };
                let Some(event_id) = entry.event_id.clone() else {
                    tracing::warn!(version = ctx.version, kind, "skipping timeline entry without eventId");
                    return Ok(RowOutcome::Skipped);
                };

                let projected = record::encode(&entry)?;
                ctx.adapter
                    .insert(Insert::upsert(collections::MESSAGES, vec![projected]))?;
                ctx.adapter.remove(&Remove {
                    from: collections::TIMELINE,
                    filter: Filter::key(&event_id).and("type", kind),
                })?;
                Ok(RowOutcome::Written)
            },
        )
    }
}

impl MigrationStep for ConsolidateTimeline {
    fn name(&self) -> &'static str {
        "consolidate-timeline"
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<StepStats, StepError> {
        let mut stats = StepStats {
            bulk_updated: self.relabel(ctx)?,
            ..StepStats::default()
        };

        for kind in &self.message_types {
            stats.merge(self.consolidate_type(ctx, kind)?);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryStore;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    fn ctx(store: &MemoryStore) -> StepContext<'_> {
        StepContext {
            adapter: store,
            version: 10,
            batch_size: 2,
        }
    }

    #[test]
    fn moves_allow_listed_entries_and_keeps_the_rest() {
        let store = MemoryStore::new();
        store
            .seed(
                collections::TIMELINE,
                vec![
                    record(json!({"eventId": "$a", "type": "m.room.message", "content": {"body": "hi"}, "originServerTs": 5})),
                    record(json!({"eventId": "$m", "type": "m.room.member", "content": {}})),
                    record(json!({"eventId": "$s", "type": "m.sticker", "roomId": "!r", "unsigned": null})),
                    record(json!({"eventId": "$c", "type": "m.room.create", "sender": "@u"})),
                ],
            )
            .expect("seed");

        let stats = ConsolidateTimeline::default()
            .apply(&ctx(&store))
            .expect("apply");
        assert_eq!(stats.written, 3);
        assert_eq!(stats.skipped, 0);

        let timeline = store.rows(collections::TIMELINE).expect("rows");
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0]["eventId"], json!("$m"));

        let messages = store.rows(collections::MESSAGES).expect("rows");
        assert_eq!(messages.len(), 3);
        let sticker = messages
            .iter()
            .find(|m| m["eventId"] == json!("$s"))
            .expect("sticker migrated");
        assert_eq!(
            Value::Object(sticker.clone()),
            json!({"eventId": "$s", "type": "m.sticker", "roomId": "!r"})
        );
    }

    #[test]
    fn keyless_entry_stays_in_timeline() {
        let store = MemoryStore::new();
        store
            .seed(
                collections::TIMELINE,
                vec![record(json!({"type": "m.room.message", "content": {"body": "lost?"}}))],
            )
            .expect("seed");

        let stats = ConsolidateTimeline::default()
            .apply(&ctx(&store))
            .expect("apply");
        assert_eq!(stats.skipped, 1);
        assert_eq!(store.rows(collections::TIMELINE).expect("rows").len(), 1);
        assert!(store.rows(collections::MESSAGES).expect("rows").is_empty());
    }

    #[test]
    fn oddly_typed_fields_do_not_block_the_move() {
        let store = MemoryStore::new();
        store
            .seed(
                collections::TIMELINE,
                vec![record(json!({"eventId": "$a", "type": "m.room.message", "sender": 42, "threadId": false}))],
            )
            .expect("seed");

        let stats = ConsolidateTimeline::default()
            .apply(&ctx(&store))
            .expect("apply");
        assert_eq!(stats.written, 1);
        assert!(store.rows(collections::TIMELINE).expect("rows").is_empty());
        assert_eq!(
            store.rows(collections::MESSAGES).expect("rows"),
            vec![record(json!({"eventId": "$a", "type": "m.room.message", "sender": 42, "threadId": false}))]
        );
    }

    #[test]
    fn relabels_legacy_types_in_messages_and_edits() {
        let store = MemoryStore::new();
        store
            .seed(
                collections::MESSAGES,
                vec![record(json!({"eventId": "$1", "type": "message"}))],
            )
            .expect("seed");
        store
            .seed(
                collections::MESSAGE_EDITS,
                vec![record(json!({"eventId": "$2", "type": "sticker"}))],
            )
            .expect("seed");

        let stats = ConsolidateTimeline::default()
            .apply(&ctx(&store))
            .expect("apply");
        assert_eq!(stats.bulk_updated, 2);
        assert_eq!(
            store.rows(collections::MESSAGES).expect("rows")[0]["type"],
            json!("m.room.message")
        );
        assert_eq!(
            store.rows(collections::MESSAGE_EDITS).expect("rows")[0]["type"],
            json!("m.sticker")
        );
    }

    #[test]
    fn existing_message_is_overwritten_not_duplicated() {
        let store = MemoryStore::new();
        store
            .seed(
                collections::MESSAGES,
                vec![record(json!({"eventId": "$a", "type": "m.room.message", "content": {"body": "old"}}))],
            )
            .expect("seed");
        store
            .seed(
                collections::TIMELINE,
                vec![record(json!({"eventId": "$a", "type": "m.room.message", "content": {"body": "new"}}))],
            )
            .expect("seed");

        ConsolidateTimeline::default()
            .apply(&ctx(&store))
            .expect("apply");
        let messages = store.rows(collections::MESSAGES).expect("rows");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"], json!({"body": "new"}));
    }
}
