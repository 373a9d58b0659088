//! SQLite storage backend for Surveyor
//!
//! A single database file holds flows, source records, derived records, and
//! per-phase artifacts. Thread-safe via internal mutex on the connection.
//!
//! Every write helper below takes the caller's active `Transaction`
//! explicitly. Nothing in this module opens a second connection or a nested
//! transaction, so a phase commit is exactly one `BEGIN ... COMMIT`.

use super::traits::{CommitBundle, FlowStore, OpenStore, StorageError, StorageResult};
use crate::flow::{
    DerivedId, DerivedRecord, DiscoveryFlow, FlowId, PhaseId, SourceId, SourceRecord, TenantId,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed flow store
pub struct SqliteFlowStore {
    conn: Mutex<Connection>,
}

impl SqliteFlowStore {
    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            -- Flows table
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                client TEXT NOT NULL,
                engagement TEXT NOT NULL,
                current_phase TEXT,
                phase_statuses_json TEXT NOT NULL,
                phase_errors_json TEXT NOT NULL,
                config_json TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                cancelled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Raw imported rows
            CREATE TABLE IF NOT EXISTS source_records (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                row_index INTEGER NOT NULL,
                payload_json TEXT NOT NULL,
                derived_ref TEXT,
                processed INTEGER NOT NULL DEFAULT 0,
                processed_at TEXT,
                FOREIGN KEY (flow_id) REFERENCES flows(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_source_flow
                ON source_records(flow_id, row_index);

            -- Derived records (assets)
            CREATE TABLE IF NOT EXISTS derived_records (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                source_ref TEXT NOT NULL,
                fields_json TEXT NOT NULL,
                confidence REAL NOT NULL,
                applied_patterns_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (flow_id) REFERENCES flows(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_derived_flow
                ON derived_records(flow_id);

            -- Per-phase artifacts
            CREATE TABLE IF NOT EXISTS phase_artifacts (
                flow_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                artifact_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (flow_id, phase),
                FOREIGN KEY (flow_id) REFERENCES flows(id) ON DELETE CASCADE
            );

            -- Enable foreign keys
            PRAGMA foreign_keys = ON;

            -- WAL mode for concurrent reads during writes
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn parse_date(s: &str) -> StorageResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| StorageError::DateParse(e.to_string()))
    }

    /// Upsert the flow row. Takes `&Connection` so it works both inside a
    /// commit transaction (via deref) and for standalone status updates.
    fn write_flow_row(conn: &Connection, flow: &DiscoveryFlow) -> StorageResult<()> {
        conn.execute(
            r#"
            INSERT INTO flows (id, client, engagement, current_phase, phase_statuses_json,
                               phase_errors_json, config_json, fingerprint, cancelled,
                               created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                current_phase = excluded.current_phase,
                phase_statuses_json = excluded.phase_statuses_json,
                phase_errors_json = excluded.phase_errors_json,
                cancelled = excluded.cancelled,
                updated_at = excluded.updated_at
            "#,
            params![
                flow.id.to_string(),
                flow.tenant.client,
                flow.tenant.engagement,
                flow.current_phase.map(|p| p.as_str()),
                serde_json::to_string(&flow.phase_statuses)?,
                serde_json::to_string(&flow.phase_errors)?,
                serde_json::to_string(&flow.config)?,
                flow.fingerprint.to_string(),
                flow.cancelled as i64,
                flow.created_at.to_rfc3339(),
                flow.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn insert_source_row(tx: &Transaction, rec: &SourceRecord) -> StorageResult<()> {
        tx.execute(
            r#"
            INSERT INTO source_records (id, flow_id, row_index, payload_json, derived_ref,
                                        processed, processed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                rec.id.to_string(),
                rec.flow_id.to_string(),
                rec.row_index as i64,
                serde_json::to_string(&rec.payload)?,
                rec.derived_ref.map(|d| d.to_string()),
                rec.processed as i64,
                rec.processed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn insert_derived_row(tx: &Transaction, rec: &DerivedRecord) -> StorageResult<()> {
        tx.execute(
            r#"
            INSERT INTO derived_records (id, flow_id, source_ref, fields_json, confidence,
                                         applied_patterns_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                fields_json = excluded.fields_json,
                confidence = excluded.confidence,
                applied_patterns_json = excluded.applied_patterns_json
            "#,
            params![
                rec.id.to_string(),
                rec.flow_id.to_string(),
                rec.source_ref.to_string(),
                serde_json::to_string(&rec.fields)?,
                rec.confidence as f64,
                serde_json::to_string(&rec.applied_patterns)?,
                rec.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Set a source row's back-reference and processed flag.
    ///
    /// Rejects the commit when the source row does not exist in this flow,
    /// or is already linked to a different derived record. Re-linking the
    /// same pair is a no-op, which keeps resumed phases idempotent.
    fn link_source_row(
        tx: &Transaction,
        flow_id: &FlowId,
        source: &SourceId,
        derived: &DerivedId,
    ) -> StorageResult<()> {
        let existing: Option<Option<String>> = tx
            .query_row(
                "SELECT derived_ref FROM source_records WHERE id = ?1 AND flow_id = ?2",
                params![source.to_string(), flow_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                return Err(StorageError::Integrity(format!(
                    "source record {} does not exist in flow {}",
                    source, flow_id
                )));
            }
            Some(Some(current)) if current != derived.to_string() => {
                return Err(StorageError::Integrity(format!(
                    "source record {} is already linked to derived record {}",
                    source, current
                )));
            }
            _ => {}
        }

        tx.execute(
            r#"
            UPDATE source_records
            SET derived_ref = ?1, processed = 1, processed_at = ?2
            WHERE id = ?3 AND flow_id = ?4
            "#,
            params![
                derived.to_string(),
                Utc::now().to_rfc3339(),
                source.to_string(),
                flow_id.to_string(),
            ],
        )?;
        Ok(())
    }

    fn upsert_artifact_row(
        tx: &Transaction,
        flow_id: &FlowId,
        phase: PhaseId,
        artifact: &serde_json::Value,
    ) -> StorageResult<()> {
        tx.execute(
            r#"
            INSERT INTO phase_artifacts (flow_id, phase, artifact_json, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(flow_id, phase) DO UPDATE SET
                artifact_json = excluded.artifact_json,
                created_at = excluded.created_at
            "#,
            params![
                flow_id.to_string(),
                phase.as_str(),
                serde_json::to_string(artifact)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn row_to_flow(
        id: String,
        client: String,
        engagement: String,
        current_phase: Option<String>,
        statuses_json: String,
        errors_json: String,
        config_json: String,
        fingerprint: String,
        cancelled: i64,
        created_at: String,
        updated_at: String,
    ) -> StorageResult<DiscoveryFlow> {
        Ok(DiscoveryFlow {
            id: FlowId::parse(&id)
                .ok_or_else(|| StorageError::Integrity(format!("bad flow id {}", id)))?,
            tenant: TenantId::new(client, engagement),
            current_phase: current_phase.as_deref().and_then(PhaseId::parse),
            phase_statuses: serde_json::from_str(&statuses_json)?,
            phase_errors: serde_json::from_str(&errors_json)?,
            config: serde_json::from_str(&config_json)?,
            fingerprint: uuid::Uuid::parse_str(&fingerprint)
                .map_err(|e| StorageError::Integrity(e.to_string()))?,
            cancelled: cancelled != 0,
            created_at: Self::parse_date(&created_at)?,
            updated_at: Self::parse_date(&updated_at)?,
        })
    }

    /// Translate SQLite busy/locked failures into `Conflict` so callers can
    /// retry the whole commit.
    fn busy_to_conflict(err: StorageError) -> StorageError {
        if let StorageError::Database(rusqlite::Error::SqliteFailure(e, ref msg)) = err {
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return StorageError::Conflict(
                    msg.clone().unwrap_or_else(|| "database busy".to_string()),
                );
            }
        }
        err
    }
}

impl OpenStore for SqliteFlowStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl FlowStore for SqliteFlowStore {
    fn create_flow(&self, flow: &DiscoveryFlow, sources: &[SourceRecord]) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        Self::write_flow_row(&tx, flow)?;
        for rec in sources {
            Self::insert_source_row(&tx, rec)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_flow(&self, id: &FlowId) -> StorageResult<Option<DiscoveryFlow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT id, client, engagement, current_phase, phase_statuses_json,
                       phase_errors_json, config_json, fingerprint, cancelled,
                       created_at, updated_at
                FROM flows WHERE id = ?1
                "#,
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, client, eng, cur, st, er, cfg, fp, can, ca, ua)) => Ok(Some(
                Self::row_to_flow(id, client, eng, cur, st, er, cfg, fp, can, ca, ua)?,
            )),
            None => Ok(None),
        }
    }

    fn update_flow(&self, flow: &DiscoveryFlow) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::write_flow_row(&conn, flow)
    }

    fn list_flows(&self) -> StorageResult<Vec<FlowId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM flows ORDER BY created_at")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.iter().filter_map(|s| FlowId::parse(s)).collect())
    }

    fn delete_flow(&self, id: &FlowId) -> StorageResult<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        // Cascades are declared but foreign_keys may be off for older files;
        // delete children explicitly.
        tx.execute(
            "DELETE FROM phase_artifacts WHERE flow_id = ?1",
            params![id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM derived_records WHERE flow_id = ?1",
            params![id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM source_records WHERE flow_id = ?1",
            params![id.to_string()],
        )?;
        let deleted = tx.execute("DELETE FROM flows WHERE id = ?1", params![id.to_string()])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn source_records(&self, flow_id: &FlowId) -> StorageResult<Vec<SourceRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, row_index, payload_json, derived_ref, processed, processed_at
            FROM source_records WHERE flow_id = ?1 ORDER BY row_index
            "#,
        )?;
        let rows = stmt.query_map(params![flow_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, row_index, payload, derived_ref, processed, processed_at) = row?;
            records.push(SourceRecord {
                id: SourceId::parse(&id)
                    .ok_or_else(|| StorageError::Integrity(format!("bad source id {}", id)))?,
                flow_id: *flow_id,
                row_index: row_index as usize,
                payload: serde_json::from_str(&payload)?,
                derived_ref: derived_ref.as_deref().and_then(DerivedId::parse),
                processed: processed != 0,
                processed_at: processed_at
                    .as_deref()
                    .map(Self::parse_date)
                    .transpose()?,
            });
        }
        Ok(records)
    }

    fn derived_records(&self, flow_id: &FlowId) -> StorageResult<Vec<DerivedRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, source_ref, fields_json, confidence, applied_patterns_json, created_at
            FROM derived_records WHERE flow_id = ?1 ORDER BY created_at, id
            "#,
        )?;
        let rows = stmt.query_map(params![flow_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, source_ref, fields, confidence, patterns, created_at) = row?;
            records.push(DerivedRecord {
                id: DerivedId::parse(&id)
                    .ok_or_else(|| StorageError::Integrity(format!("bad derived id {}", id)))?,
                flow_id: *flow_id,
                source_ref: SourceId::parse(&source_ref).ok_or_else(|| {
                    StorageError::Integrity(format!("bad source ref {}", source_ref))
                })?,
                fields: serde_json::from_str(&fields)?,
                confidence: confidence as f32,
                applied_patterns: serde_json::from_str(&patterns)?,
                created_at: Self::parse_date(&created_at)?,
            });
        }
        Ok(records)
    }

    fn artifacts(&self, flow_id: &FlowId) -> StorageResult<BTreeMap<PhaseId, serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT phase, artifact_json FROM phase_artifacts WHERE flow_id = ?1")?;
        let rows = stmt.query_map(params![flow_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut artifacts = BTreeMap::new();
        for row in rows {
            let (phase, json) = row?;
            if let Some(phase) = PhaseId::parse(&phase) {
                artifacts.insert(phase, serde_json::from_str(&json)?);
            }
        }
        Ok(artifacts)
    }

    fn commit_phase(&self, bundle: &CommitBundle) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let result = (|| -> StorageResult<()> {
            let tx = conn.transaction()?;

            // (1) derived records
            for rec in &bundle.derived {
                Self::insert_derived_row(&tx, rec)?;
            }

            // (2) source back-references
            for (source, derived) in &bundle.links {
                Self::link_source_row(&tx, &bundle.flow.id, source, derived)?;
            }

            // (3) artifact + flow phase-status map
            Self::upsert_artifact_row(&tx, &bundle.flow.id, bundle.phase, &bundle.artifact)?;
            Self::write_flow_row(&tx, &bundle.flow)?;

            tx.commit()?;
            Ok(())
        })();
        result.map_err(Self::busy_to_conflict)
    }

    fn clear_flow_outputs(&self, flow_id: &FlowId) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM derived_records WHERE flow_id = ?1",
            params![flow_id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM phase_artifacts WHERE flow_id = ?1",
            params![flow_id.to_string()],
        )?;
        tx.execute(
            "UPDATE source_records SET derived_ref = NULL, processed = 0, processed_at = NULL
             WHERE flow_id = ?1",
            params![flow_id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{fingerprint, FlowConfig, PhaseStatus};
    use chrono::Utc;

    fn sample_flow() -> (DiscoveryFlow, Vec<SourceRecord>) {
        let rows = vec![
            serde_json::json!({"host": "web-01", "DR_TIER": "1"}),
            serde_json::json!({"host": "db-01", "DR_TIER": "2"}),
        ];
        let config = FlowConfig::default();
        let fp = fingerprint(&rows, &config);
        let flow = DiscoveryFlow::new(TenantId::new("acme", "wave-1"), config, fp);
        let sources = rows
            .into_iter()
            .enumerate()
            .map(|(i, payload)| SourceRecord::new(flow.id, i, payload))
            .collect();
        (flow, sources)
    }

    fn derived_for(flow: &DiscoveryFlow, source: &SourceRecord) -> DerivedRecord {
        DerivedRecord {
            id: DerivedId::new(),
            flow_id: flow.id,
            source_ref: source.id,
            fields: [(
                "name".to_string(),
                serde_json::json!(source.payload["host"]),
            )]
            .into_iter()
            .collect(),
            confidence: 0.9,
            applied_patterns: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn create_and_load_roundtrip() {
        let store = SqliteFlowStore::open_in_memory().unwrap();
        let (flow, sources) = sample_flow();
        store.create_flow(&flow, &sources).unwrap();

        let loaded = store.load_flow(&flow.id).unwrap().expect("flow exists");
        assert_eq!(loaded.id, flow.id);
        assert_eq!(loaded.tenant, flow.tenant);
        assert_eq!(loaded.fingerprint, flow.fingerprint);
        assert_eq!(loaded.status(PhaseId::FieldMapping), PhaseStatus::Pending);

        let rows = store.source_records(&flow.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_index, 0);
        assert!(!rows[0].processed);
    }

    #[test]
    fn load_missing_flow_returns_none() {
        let store = SqliteFlowStore::open_in_memory().unwrap();
        assert!(store.load_flow(&FlowId::new()).unwrap().is_none());
    }

    #[test]
    fn update_flow_persists_status_changes() {
        let store = SqliteFlowStore::open_in_memory().unwrap();
        let (mut flow, sources) = sample_flow();
        store.create_flow(&flow, &sources).unwrap();

        flow.transition(PhaseId::FieldMapping, PhaseStatus::Running).unwrap();
        flow.fail(PhaseId::FieldMapping, "bad input").unwrap();
        store.update_flow(&flow).unwrap();

        let loaded = store.load_flow(&flow.id).unwrap().unwrap();
        assert_eq!(loaded.status(PhaseId::FieldMapping), PhaseStatus::Failed);
        assert_eq!(
            loaded.phase_errors.get(&PhaseId::FieldMapping).map(String::as_str),
            Some("bad input")
        );
    }

    #[test]
    fn commit_phase_writes_all_three_classes() {
        let store = SqliteFlowStore::open_in_memory().unwrap();
        let (mut flow, sources) = sample_flow();
        store.create_flow(&flow, &sources).unwrap();

        flow.transition(PhaseId::FieldMapping, PhaseStatus::Running).unwrap();
        flow.transition(PhaseId::FieldMapping, PhaseStatus::Completed).unwrap();

        let derived: Vec<_> = sources.iter().map(|s| derived_for(&flow, s)).collect();
        let links = sources
            .iter()
            .zip(&derived)
            .map(|(s, d)| (s.id, d.id))
            .collect();

        store
            .commit_phase(&CommitBundle {
                flow: flow.clone(),
                phase: PhaseId::FieldMapping,
                artifact: serde_json::json!({"mappings": []}),
                derived,
                links,
            })
            .unwrap();

        let loaded = store.load_flow(&flow.id).unwrap().unwrap();
        assert_eq!(loaded.status(PhaseId::FieldMapping), PhaseStatus::Completed);

        let rows = store.source_records(&flow.id).unwrap();
        assert!(rows.iter().all(|r| r.processed && r.derived_ref.is_some()));

        let derived = store.derived_records(&flow.id).unwrap();
        assert_eq!(derived.len(), 2);

        let artifacts = store.artifacts(&flow.id).unwrap();
        assert!(artifacts.contains_key(&PhaseId::FieldMapping));
    }

    // === Scenario: failure mid-commit rolls back every write ===

    #[test]
    fn commit_phase_rolls_back_on_missing_source() {
        let store = SqliteFlowStore::open_in_memory().unwrap();
        let (mut flow, sources) = sample_flow();
        store.create_flow(&flow, &sources).unwrap();

        flow.transition(PhaseId::FieldMapping, PhaseStatus::Running).unwrap();
        flow.transition(PhaseId::FieldMapping, PhaseStatus::Completed).unwrap();

        let mut derived: Vec<_> = sources.iter().map(|s| derived_for(&flow, s)).collect();
        // Second link references a source row that does not exist, which
        // fails after the derived inserts have already executed.
        derived[1].source_ref = SourceId::new();
        let links: Vec<_> = derived.iter().map(|d| (d.source_ref, d.id)).collect();

        let err = store
            .commit_phase(&CommitBundle {
                flow: flow.clone(),
                phase: PhaseId::FieldMapping,
                artifact: serde_json::json!({}),
                derived,
                links,
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Integrity(_)));

        // Nothing persisted: no derived rows, no back-refs, phase still pending
        assert!(store.derived_records(&flow.id).unwrap().is_empty());
        let rows = store.source_records(&flow.id).unwrap();
        assert!(rows.iter().all(|r| !r.processed && r.derived_ref.is_none()));
        let reloaded = store.load_flow(&flow.id).unwrap().unwrap();
        assert_eq!(reloaded.status(PhaseId::FieldMapping), PhaseStatus::Pending);
        assert!(store.artifacts(&flow.id).unwrap().is_empty());
    }

    #[test]
    fn relinking_same_pair_is_idempotent() {
        let store = SqliteFlowStore::open_in_memory().unwrap();
        let (mut flow, sources) = sample_flow();
        store.create_flow(&flow, &sources).unwrap();

        flow.transition(PhaseId::FieldMapping, PhaseStatus::Running).unwrap();
        flow.transition(PhaseId::FieldMapping, PhaseStatus::Completed).unwrap();

        let derived: Vec<_> = sources.iter().map(|s| derived_for(&flow, s)).collect();
        let links: Vec<(SourceId, DerivedId)> = sources
            .iter()
            .zip(&derived)
            .map(|(s, d)| (s.id, d.id))
            .collect();
        let bundle = CommitBundle {
            flow: flow.clone(),
            phase: PhaseId::FieldMapping,
            artifact: serde_json::json!({}),
            derived,
            links,
        };

        store.commit_phase(&bundle).unwrap();
        // Second commit of the same bundle (resume after crash) succeeds
        store.commit_phase(&bundle).unwrap();
        assert_eq!(store.derived_records(&flow.id).unwrap().len(), 2);
    }

    #[test]
    fn linking_source_to_second_derived_is_integrity_violation() {
        let store = SqliteFlowStore::open_in_memory().unwrap();
        let (mut flow, sources) = sample_flow();
        store.create_flow(&flow, &sources).unwrap();

        flow.transition(PhaseId::FieldMapping, PhaseStatus::Running).unwrap();
        flow.transition(PhaseId::FieldMapping, PhaseStatus::Completed).unwrap();

        let first = derived_for(&flow, &sources[0]);
        store
            .commit_phase(&CommitBundle {
                flow: flow.clone(),
                phase: PhaseId::FieldMapping,
                artifact: serde_json::json!({}),
                derived: vec![first.clone()],
                links: vec![(sources[0].id, first.id)],
            })
            .unwrap();

        let second = derived_for(&flow, &sources[0]);
        let err = store
            .commit_phase(&CommitBundle {
                flow: flow.clone(),
                phase: PhaseId::FieldMapping,
                artifact: serde_json::json!({}),
                derived: vec![second.clone()],
                links: vec![(sources[0].id, second.id)],
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Integrity(_)));
    }

    #[test]
    fn clear_flow_outputs_resets_linkage() {
        let store = SqliteFlowStore::open_in_memory().unwrap();
        let (mut flow, sources) = sample_flow();
        store.create_flow(&flow, &sources).unwrap();

        flow.transition(PhaseId::FieldMapping, PhaseStatus::Running).unwrap();
        flow.transition(PhaseId::FieldMapping, PhaseStatus::Completed).unwrap();
        let derived: Vec<_> = sources.iter().map(|s| derived_for(&flow, s)).collect();
        let links = sources.iter().zip(&derived).map(|(s, d)| (s.id, d.id)).collect();
        store
            .commit_phase(&CommitBundle {
                flow: flow.clone(),
                phase: PhaseId::FieldMapping,
                artifact: serde_json::json!({}),
                derived,
                links,
            })
            .unwrap();

        store.clear_flow_outputs(&flow.id).unwrap();
        assert!(store.derived_records(&flow.id).unwrap().is_empty());
        let rows = store.source_records(&flow.id).unwrap();
        assert!(rows.iter().all(|r| !r.processed && r.derived_ref.is_none()));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("surveyor.db");
        let (flow, sources) = sample_flow();
        {
            let store = SqliteFlowStore::open(&path).unwrap();
            store.create_flow(&flow, &sources).unwrap();
        }
        let store = SqliteFlowStore::open(&path).unwrap();
        assert!(store.load_flow(&flow.id).unwrap().is_some());
        assert_eq!(store.list_flows().unwrap(), vec![flow.id]);
    }

    #[test]
    fn delete_flow_removes_children() {
        let store = SqliteFlowStore::open_in_memory().unwrap();
        let (flow, sources) = sample_flow();
        store.create_flow(&flow, &sources).unwrap();
        assert!(store.delete_flow(&flow.id).unwrap());
        assert!(store.load_flow(&flow.id).unwrap().is_none());
        assert!(store.source_records(&flow.id).unwrap().is_empty());
        assert!(!store.delete_flow(&flow.id).unwrap());
    }
}
