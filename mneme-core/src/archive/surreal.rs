//! Embedded SurrealDB cold store
//!
//! Every archive record is one row in the `archive` table, keyed by its
//! stable record id. The record body is kept as a JSON payload next to the
//! few columns the read paths filter and sort on.

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::local::{Db, Mem};

use super::store::ColdStore;
use crate::error::{MnemeError, Result};
use crate::memory::records::{
    ArchiveRecord, ConversationTurn, RelationshipSnapshot, SalientMemory, SessionSummary,
};

const TABLE: &str = "archive";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    record_id: String,
    kind: String,
    agent_id: String,
    counterpart_id: String,
    recorded_at: String,
    payload: String,
}

impl StoredRecord {
    fn from_record(record: &ArchiveRecord) -> Result<Self> {
        Ok(Self {
            record_id: record.record_id(),
            kind: record.kind().to_string(),
            agent_id: record.agent_id().to_string(),
            counterpart_id: record.counterpart_id().to_string(),
            recorded_at: record
                .recorded_at()
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            payload: serde_json::to_string(record)?,
        })
    }

    fn into_record(self) -> Result<ArchiveRecord> {
        serde_json::from_str(&self.payload).map_err(|e| {
            MnemeError::StorageUnavailable(format!(
                "archive row '{}' is corrupt: {}",
                self.record_id, e
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

fn storage_error(context: &str, err: surrealdb::Error) -> MnemeError {
    MnemeError::StorageUnavailable(format!("{}: {}", context, err))
}

/// Cold store on an embedded in-memory SurrealDB engine
#[derive(Debug, Clone)]
pub struct SurrealColdStore {
    db: Surreal<Db>,
}

impl SurrealColdStore {
    /// Start an embedded engine and select the namespace and database
    pub async fn in_memory(namespace: &str, database: &str) -> Result<Self> {
        let db = Surreal::new::<Mem>(())
            .await
            .map_err(|e| storage_error("failed to start embedded SurrealDB", e))?;
        db.use_ns(namespace)
            .use_db(database)
            .await
            .map_err(|e| storage_error("failed to select namespace", e))?;

        db.query(format!(
            "DEFINE INDEX IF NOT EXISTS archive_agent_idx ON {} FIELDS agent_id, kind",
            TABLE
        ))
        .await
        .map_err(|e| storage_error("failed to define archive index", e))?;

        Ok(Self { db })
    }

    async fn select_kind(&self, agent_id: &str, kind: &'static str) -> Result<Vec<ArchiveRecord>> {
        let mut response = self
            .db
            .query(format!(
                "SELECT * FROM {} WHERE agent_id = $agent AND kind = $kind ORDER BY recorded_at ASC",
                TABLE
            ))
            .bind(("agent", agent_id.to_string()))
            .bind(("kind", kind))
            .await
            .map_err(|e| storage_error("archive query failed", e))?;

        let rows: Vec<StoredRecord> = response
            .take(0)
            .map_err(|e| storage_error("archive query returned unexpected rows", e))?;
        rows.into_iter().map(StoredRecord::into_record).collect()
    }
}

#[async_trait]
impl ColdStore for SurrealColdStore {
    async fn write_batch(&self, records: &[ArchiveRecord]) -> Result<()> {
        for record in records {
            let row = StoredRecord::from_record(record)?;
            let id = row.record_id.clone();
            let _: Option<StoredRecord> = self
                .db
                .upsert((TABLE, id))
                .content(row)
                .await
                .map_err(|e| storage_error("archive write failed", e))?;
        }
        Ok(())
    }

    async fn load_turns(&self, agent_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let mut turns: Vec<ConversationTurn> = self
            .select_kind(agent_id, "turn")
            .await?
            .into_iter()
            .filter_map(|r| match r {
                ArchiveRecord::Turn(t) => Some(t),
                _ => None,
            })
            .collect();
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.split_off(skip))
    }

    async fn load_summaries(&self, agent_id: &str) -> Result<Vec<SessionSummary>> {
        Ok(self
            .select_kind(agent_id, "summary")
            .await?
            .into_iter()
            .filter_map(|r| match r {
                ArchiveRecord::Summary(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    async fn load_salient(&self, agent_id: &str) -> Result<Vec<SalientMemory>> {
        Ok(self
            .select_kind(agent_id, "salient")
            .await?
            .into_iter()
            .filter_map(|r| match r {
                ArchiveRecord::Salient(m) => Some(m),
                _ => None,
            })
            .collect())
    }

    async fn load_relationship(
        &self,
        agent_id: &str,
        counterpart_id: &str,
    ) -> Result<Option<RelationshipSnapshot>> {
        Ok(self
            .select_kind(agent_id, "relationship")
            .await?
            .into_iter()
            .filter_map(|r| match r {
                ArchiveRecord::Relationship(rel) if rel.counterpart_id == counterpart_id => {
                    Some(rel)
                }
                _ => None,
            })
            .max_by_key(|rel| rel.updated_at))
    }

    async fn last_ordinal(&self, agent_id: &str, counterpart_id: &str) -> Result<Option<u64>> {
        Ok(self
            .select_kind(agent_id, "turn")
            .await?
            .into_iter()
            .filter_map(|r| match r {
                ArchiveRecord::Turn(t) if t.counterpart_id == counterpart_id => Some(t.ordinal),
                _ => None,
            })
            .max())
    }

    async fn count(&self) -> Result<usize> {
        let mut response = self
            .db
            .query(format!("SELECT count() FROM {} GROUP ALL", TABLE))
            .await
            .map_err(|e| storage_error("archive count failed", e))?;
        let rows: Vec<CountRow> = response
            .take(0)
            .map_err(|e| storage_error("archive count returned unexpected rows", e))?;
        Ok(rows.first().map(|r| r.count.max(0) as usize).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_through_embedded_engine() {
        let store = SurrealColdStore::in_memory("mneme", "archive").await.unwrap();

        let turn = ConversationTurn::new("npc-1", "player-1", 1, "hail", "well met");
        let salient = SalientMemory::new("npc-1", "player-1", "gift", "a silver ring", 0.7);
        let batch = vec![
            ArchiveRecord::Turn(turn.clone()),
            ArchiveRecord::Salient(salient.clone()),
        ];
        store.write_batch(&batch).await.unwrap();
        // Replaying the batch is harmless
        store.write_batch(&batch).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.load_turns("npc-1", 10).await.unwrap(), vec![turn]);
        assert_eq!(store.load_salient("npc-1").await.unwrap(), vec![salient]);
        assert!(store.load_summaries("npc-1").await.unwrap().is_empty());
        assert_eq!(store.last_ordinal("npc-1", "player-1").await.unwrap(), Some(1));
        assert_eq!(store.last_ordinal("npc-1", "player-2").await.unwrap(), None);
        assert!(store
            .load_relationship("npc-1", "player-1")
            .await
            .unwrap()
            .is_none());
    }
}
