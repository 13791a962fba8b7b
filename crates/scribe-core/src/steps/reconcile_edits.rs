//! Version 16: re-apply recorded edits to their target messages.
//!
//! Conflicts resolve last-writer-wins on the edit's `originServerTs`, not on
//! the order edits are stored in. A message whose `replaceToTs` is missing or
//! not a positive finite number accepts any timestamped edit; otherwise the
//! edit must be at least as recent as the stored one.
//!
//! An edit without a valid `originServerTs` is skipped outright, even when
//! its target has no valid `replaceToTs` either. Such an edit could never be
//! ordered against later ones, and applying it would pin `replaceToTs` to a
//! value that every future edit compares against.

use serde_json::{Value, json};

use super::{MigrationStep, RowOutcome, StepContext, StepError, StepStats};
use crate::adapter::{Filter, Select, StorageError, Update};
use crate::record::{self, EVENT_ID, Message, MessageEdit, Record, collections, valid_timestamp};

/// Edit reconciliation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileEdits;

/// Returns `true` when an edit at `candidate` may replace the stored edit.
#[must_use]
pub fn supersedes(candidate: f64, stored: Option<&Value>) -> bool {
    valid_timestamp(stored).is_none_or(|current| candidate >= current)
}

fn apply_edit(ctx: &StepContext<'_>, row: &Record) -> Result<RowOutcome, StorageError> {
    let edit: MessageEdit = match record::decode(row.clone()) {
        Ok(edit) => edit,
        Err(error) => {
            tracing::warn!(version = ctx.version, %error, "skipping malformed message edit");
            return Ok(RowOutcome::Skipped);
        }
    };
    let Some(target_id) = edit.target_event_id() else {
        tracing::warn!(version = ctx.version, "skipping message edit without a target");
        return Ok(RowOutcome::Skipped);
    };
    let Some(candidate) = valid_timestamp(edit.origin_server_ts.as_ref()) else {
        tracing::warn!(version = ctx.version, target = target_id, "skipping message edit without a valid timestamp");
        return Ok(RowOutcome::Skipped);
    };

    let Some(found) = ctx
        .adapter
        .select(
            &Select::new(collections::MESSAGES)
                .filter(Filter::key(target_id))
                .limit(1),
        )?
        .into_iter()
        .next()
    else {
        return Ok(RowOutcome::Skipped);
    };
    let target: Message = match record::decode(found) {
        Ok(target) => target,
        Err(error) => {
            tracing::warn!(version = ctx.version, target = target_id, %error, "skipping edit of malformed message");
            return Ok(RowOutcome::Skipped);
        }
    };
    let Some(target_key) = target.event.event_id.as_deref() else {
        return Ok(RowOutcome::Skipped);
    };

    if !supersedes(candidate, target.replace_to_ts.as_ref()) {
        return Ok(RowOutcome::Skipped);
    }

    let mut set = Record::new();
    if let Some(ts) = edit.origin_server_ts.clone() {
        set.insert("replaceToTs".into(), ts);
    }
    if let Some(edit_id) = edit.event_id.as_deref() {
        set.insert("replaceToId".into(), json!(edit_id));
    }
    if let Some(content) = edit.content.clone() {
        set.insert("replaceTo".into(), content);
    }

    ctx.adapter.update(&Update {
        collection: collections::MESSAGES,
        set,
        filter: Filter::key(target_key),
    })?;
    Ok(RowOutcome::Written)
}

impl MigrationStep for ReconcileEdits {
    fn name(&self) -> &'static str {
        "reconcile-edits"
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<StepStats, StepError> {
        let edits = ctx.adapter.select(&Select::new(collections::MESSAGE_EDITS))?;
        ctx.for_each_row(
            edits,
            |row| row.get(EVENT_ID).and_then(Value::as_str).map(str::to_owned),
            |row| apply_edit(ctx, row),
        )
    }
}
