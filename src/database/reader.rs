//! Row -> [`ActionRecord`] conversion.
//!
//! All knowledge of which columns may be absent on older schemas, and what
//! they default to, lives in [`ACTION_COLUMNS`]. Required columns that are
//! missing or NULL fail the read instead of being papered over.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeSet;

use crate::actions::{ActionKind, ActionRecord, Metadata, Payload, ProofStatus};
use crate::error::{PipelineError, Result};

/// Separator used by `group_concat` when collecting tags.
pub(crate) const TAG_SEPARATOR: char = '\u{1f}';

/// Projection shared by every action query. Alias `a` refers to `actions`.
pub(crate) const SELECT_ACTIONS: &str = r#"
    SELECT a.seq, a.id, a.actor_id, a.kind, a.payload, a.timestamp, a.signature,
           a.proof_status, a.tx_ref, a.proof_ref, a.batch_ref, a.metadata, a.created_at,
           (SELECT group_concat(t.tag, char(31)) FROM action_tags t WHERE t.action_id = a.id) AS tags
    FROM actions a
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    /// Present since v1, never NULL
    Required,
    /// May be NULL or absent; absent means `None`
    Optional,
    /// May be NULL or absent; falls back to the given literal
    Defaulted(&'static str),
}

/// `(name, rule)`, grouped by the schema version that introduced the column
const ACTION_COLUMNS: &[(&str, Column)] = &[
    // v1
    ("seq", Column::Required),
    ("id", Column::Required),
    ("actor_id", Column::Required),
    ("kind", Column::Required),
    ("payload", Column::Required),
    ("timestamp", Column::Required),
    ("signature", Column::Required),
    ("proof_status", Column::Defaulted("pending")),
    ("tx_ref", Column::Optional),
    ("created_at", Column::Defaulted("0")),
    // v2
    ("proof_ref", Column::Optional),
    ("batch_ref", Column::Optional),
    // v3
    ("metadata", Column::Defaulted("{}")),
    ("tags", Column::Defaulted("")),
];

fn rule(name: &str) -> Column {
    ACTION_COLUMNS
        .iter()
        .find(|(column, _)| *column == name)
        .map(|(_, rule)| *rule)
        .unwrap_or(Column::Required)
}

fn decode_error(column: &str, reason: impl std::fmt::Display) -> PipelineError {
    PipelineError::Persistence(sqlx::Error::Decode(
        format!("column {}: {}", column, reason).into(),
    ))
}

/// Raw text value of `name` after applying the column rule.
fn text(row: &SqliteRow, name: &str) -> Result<Option<String>> {
    let rule = rule(name);
    let value = match row.try_get::<Option<String>, _>(name) {
        Ok(value) => value,
        Err(sqlx::Error::ColumnNotFound(_)) if rule != Column::Required => None,
        Err(e) => return Err(e.into()),
    };

    match (value, rule) {
        (Some(value), _) => Ok(Some(value)),
        (None, Column::Required) => Err(decode_error(name, "unexpected NULL")),
        (None, Column::Optional) => Ok(None),
        (None, Column::Defaulted(default)) => Ok(Some(default.to_string())),
    }
}

fn required_text(row: &SqliteRow, name: &str) -> Result<String> {
    text(row, name)?.ok_or_else(|| decode_error(name, "missing value"))
}

fn integer(row: &SqliteRow, name: &str) -> Result<i64> {
    let rule = rule(name);
    let value = match row.try_get::<Option<i64>, _>(name) {
        Ok(value) => value,
        Err(sqlx::Error::ColumnNotFound(_)) if rule != Column::Required => None,
        Err(e) => return Err(e.into()),
    };

    match (value, rule) {
        (Some(value), _) => Ok(value),
        (None, Column::Defaulted(default)) => default
            .parse()
            .map_err(|e| decode_error(name, e)),
        (None, _) => Err(decode_error(name, "unexpected NULL")),
    }
}

/// Insertion sequence of the row, used as the scan cursor tiebreaker.
pub(crate) fn read_seq(row: &SqliteRow) -> Result<i64> {
    integer(row, "seq")
}

pub(crate) fn read_action(row: &SqliteRow) -> Result<ActionRecord> {
    let kind_code = required_text(row, "kind")?;
    let kind = ActionKind::from_code(&kind_code)
        .ok_or_else(|| decode_error("kind", format!("unknown action kind {}", kind_code)))?;

    let status_text = required_text(row, "proof_status")?;
    let status: ProofStatus = status_text
        .parse()
        .map_err(|_| decode_error("proof_status", format!("unknown status {}", status_text)))?;

    let payload: Payload = serde_json::from_str(&required_text(row, "payload")?)?;
    let metadata: Metadata = serde_json::from_str(&required_text(row, "metadata")?)?;

    let tags: BTreeSet<String> = required_text(row, "tags")?
        .split(TAG_SEPARATOR)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect();

    let created_millis = integer(row, "created_at")?;
    let created_at = DateTime::<Utc>::from_timestamp_millis(created_millis)
        .ok_or_else(|| decode_error("created_at", "out of range"))?;

    Ok(ActionRecord {
        id: required_text(row, "id")?,
        actor_id: required_text(row, "actor_id")?,
        kind,
        payload,
        timestamp: integer(row, "timestamp")?,
        signature: required_text(row, "signature")?,
        status,
        tx_ref: text(row, "tx_ref")?,
        proof_ref: text(row, "proof_ref")?,
        batch_ref: text(row, "batch_ref")?,
        tags,
        metadata,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::{Connection, SqliteConnection};

    #[tokio::test]
    async fn test_v1_row_gets_defaults() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let row = sqlx::query(
            r#"SELECT 1 AS seq, 'act_1' AS id, 'did:worklog:x' AS actor_id, 'HEARTBEAT' AS kind,
                      '{"k":1}' AS payload, 1000 AS timestamp, 'ab' AS signature,
                      NULL AS proof_status, NULL AS tx_ref, 0 AS created_at"#,
        )
        .fetch_one(&mut conn)
        .await
        .unwrap();

        let record = read_action(&row).unwrap();
        assert_eq!(record.kind, ActionKind::Heartbeat);
        assert_eq!(record.status, ProofStatus::Pending);
        assert!(record.proof_ref.is_none());
        assert!(record.batch_ref.is_none());
        assert!(record.metadata.is_empty());
        assert!(record.tags.is_empty());
    }

    #[test]
    fn test_every_projected_column_has_a_rule() {
        for (name, _) in ACTION_COLUMNS {
            assert!(SELECT_ACTIONS.contains(name), "{} not projected", name);
        }
        assert_eq!(rule("metadata"), Column::Defaulted("{}"));
        assert_eq!(rule("proof_ref"), Column::Optional);
        assert_eq!(rule("unlisted"), Column::Required);
    }

    #[tokio::test]
    async fn test_missing_required_column_fails() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let row = sqlx::query("SELECT 1 AS seq, 'act_1' AS id, 'HEARTBEAT' AS kind")
            .fetch_one(&mut conn)
            .await
            .unwrap();

        assert!(matches!(
            read_action(&row),
            Err(PipelineError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_loudly() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let row = sqlx::query(
            r#"SELECT 1 AS seq, 'act_1' AS id, 'did:worklog:x' AS actor_id, 'WARP_DRIVE' AS kind,
                      '{}' AS payload, 1000 AS timestamp, 'ab' AS signature"#,
        )
        .fetch_one(&mut conn)
        .await
        .unwrap();

        assert!(read_action(&row).is_err());
    }
}
