//! Version 15: backfill the search index from messages.
//!
//! Purely derivative; messages are read, never written.

use serde_json::Value;

use super::{MigrationStep, RowOutcome, StepContext, StepError, StepStats};
use crate::adapter::{Insert, Select};
use crate::record::{self, EVENT_ID, Message, SearchIndexEntry, collections};

/// Messages → search index projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackfillSearchIndex;

impl MigrationStep for BackfillSearchIndex {
    fn name(&self) -> &'static str {
        "backfill-search-index"
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<StepStats, StepError> {
        let messages = ctx.adapter.select(&Select::new(collections::MESSAGES))?;

        ctx.for_each_row(
            messages,
            |row| row.get(EVENT_ID).and_then(Value::as_str).map(str::to_owned),
            |row| {
                let message: Message = match record::decode(row.clone()) {
                    Ok(message) => message,
                    Err(error) => {
                        tracing::warn!(version = ctx.version, %error, "skipping malformed message");
                        return Ok(RowOutcome::Skipped);
                    }
                };
                if message.event.event_id.is_none() {
                    return Ok(RowOutcome::Skipped);
                }

                let entry = record::encode(&SearchIndexEntry::from_message(&message))?;
                ctx.adapter
                    .insert(Insert::upsert(collections::SEARCH_INDEX, vec![entry]))?;
                Ok(RowOutcome::Written)
            },
        )
    }
}
