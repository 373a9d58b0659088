//! SQLite-backed pattern store with similarity retrieval
//!
//! Patterns are scoped per tenant with a global fallback. Retrieval filters
//! by scope in SQL and scores cosine distances in process; candidate sets
//! are small enough that an ANN index buys nothing here.
//!
//! Concurrent updates to the same pattern are serialized with an optimistic
//! `version` check; the losing writer reloads and merges counters instead of
//! overwriting blindly.

use super::embedder::combined_distance;
use super::pattern::{Pattern, PatternId, PatternScope};
use super::{LearnError, LearnResult};
use crate::flow::TenantId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Mutex;

/// Combined distance below which `store` merges instead of inserting.
const MERGE_DISTANCE: f32 = 0.15;

/// Bounded attempts for optimistic-version retries.
const VERSION_RETRIES: u32 = 3;

/// Confidence nudges applied on reuse outcomes.
const SUCCESS_BONUS: f32 = 0.05;
const FAILURE_PENALTY: f32 = 0.10;
const CONFIDENCE_FLOOR: f32 = 0.05;
const CONFIDENCE_CEIL: f32 = 0.99;

/// A retrieval hit: the pattern plus its combined distance to the query.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pattern: Pattern,
    pub distance: f32,
}

/// SQLite-backed pattern store
pub struct PatternStore {
    conn: Mutex<Connection>,
}

impl PatternStore {
    pub fn open(path: impl AsRef<Path>) -> LearnResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> LearnResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> LearnResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS patterns (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                source_signature TEXT NOT NULL,
                target TEXT NOT NULL,
                signature_embedding_json TEXT NOT NULL,
                content_embedding_json TEXT NOT NULL,
                confidence REAL NOT NULL,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                synthetic INTEGER NOT NULL DEFAULT 0,
                retired INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_patterns_scope
                ON patterns(scope, retired);

            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn parse_date(s: &str) -> LearnResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| LearnError::Corrupt(format!("bad timestamp: {}", e)))
    }

    fn row_to_pattern(
        id: String,
        scope: String,
        source_signature: String,
        target: String,
        sig_json: String,
        content_json: String,
        confidence: f64,
        success_count: i64,
        failure_count: i64,
        synthetic: i64,
        retired: i64,
        version: i64,
        created_at: String,
        updated_at: String,
    ) -> LearnResult<Pattern> {
        Ok(Pattern {
            id: PatternId::parse(&id)
                .ok_or_else(|| LearnError::Corrupt(format!("bad pattern id {}", id)))?,
            scope: PatternScope::from_key(&scope)
                .ok_or_else(|| LearnError::Corrupt(format!("bad scope {}", scope)))?,
            source_signature,
            target,
            signature_embedding: serde_json::from_str(&sig_json)?,
            content_embedding: serde_json::from_str(&content_json)?,
            confidence: confidence as f32,
            success_count: success_count as u32,
            failure_count: failure_count as u32,
            synthetic: synthetic != 0,
            retired: retired != 0,
            version,
            created_at: Self::parse_date(&created_at)?,
            updated_at: Self::parse_date(&updated_at)?,
        })
    }

    const SELECT_COLS: &'static str = "id, scope, source_signature, target, \
         signature_embedding_json, content_embedding_json, confidence, \
         success_count, failure_count, synthetic, retired, version, \
         created_at, updated_at";

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(
        String, String, String, String, String, String, f64,
        i64, i64, i64, i64, i64, String, String,
    )> {
        Ok((
            row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?,
            row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?,
            row.get(8)?, row.get(9)?, row.get(10)?, row.get(11)?,
            row.get(12)?, row.get(13)?,
        ))
    }

    fn insert_row(conn: &Connection, p: &Pattern) -> LearnResult<()> {
        conn.execute(
            r#"
            INSERT INTO patterns (id, scope, source_signature, target,
                signature_embedding_json, content_embedding_json, confidence,
                success_count, failure_count, synthetic, retired, version,
                created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                p.id.to_string(),
                p.scope.key(),
                p.source_signature,
                p.target,
                serde_json::to_string(&p.signature_embedding)?,
                serde_json::to_string(&p.content_embedding)?,
                p.confidence as f64,
                p.success_count as i64,
                p.failure_count as i64,
                p.synthetic as i64,
                p.retired as i64,
                p.version,
                p.created_at.to_rfc3339(),
                p.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Write back an updated pattern iff the version still matches
    /// `expected_version`. Returns false when another writer got there first.
    fn update_row_versioned(
        conn: &Connection,
        p: &Pattern,
        expected_version: i64,
    ) -> LearnResult<bool> {
        let affected = conn.execute(
            r#"
            UPDATE patterns SET
                source_signature = ?1, target = ?2,
                signature_embedding_json = ?3, content_embedding_json = ?4,
                confidence = ?5, success_count = ?6, failure_count = ?7,
                synthetic = ?8, retired = ?9, version = version + 1,
                updated_at = ?10
            WHERE id = ?11 AND version = ?12
            "#,
            params![
                p.source_signature,
                p.target,
                serde_json::to_string(&p.signature_embedding)?,
                serde_json::to_string(&p.content_embedding)?,
                p.confidence as f64,
                p.success_count as i64,
                p.failure_count as i64,
                p.synthetic as i64,
                p.retired as i64,
                Utc::now().to_rfc3339(),
                p.id.to_string(),
                expected_version,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Load a pattern by id.
    pub fn get(&self, id: &PatternId) -> LearnResult<Option<Pattern>> {
        let conn = self.conn.lock().unwrap();
        Self::get_locked(&conn, id)
    }

    fn get_locked(conn: &Connection, id: &PatternId) -> LearnResult<Option<Pattern>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM patterns WHERE id = ?1", Self::SELECT_COLS),
                params![id.to_string()],
                Self::map_row,
            )
            .optional()?;
        match row {
            Some((id, sc, ss, t, se, ce, c, s, f, sy, r, v, ca, ua)) => Ok(Some(
                Self::row_to_pattern(id, sc, ss, t, se, ce, c, s, f, sy, r, v, ca, ua)?,
            )),
            None => Ok(None),
        }
    }

    /// Insert a pattern, or merge it into an existing same-scope pattern
    /// whose combined distance is below the merge threshold.
    ///
    /// Merging sums counters, keeps the higher confidence, and refreshes the
    /// embeddings from the newer observation. A real (non-synthetic) pattern
    /// merging into a synthetic one clears the synthetic flag.
    pub fn store(&self, pattern: Pattern) -> LearnResult<PatternId> {
        let conn = self.conn.lock().unwrap();

        let existing = Self::scope_rows(&conn, &pattern.scope.key())?;
        let nearest = existing
            .into_iter()
            .map(|p| {
                let d = combined_distance(
                    &pattern.signature_embedding,
                    &p.signature_embedding,
                    &pattern.content_embedding,
                    &p.content_embedding,
                );
                (p, d)
            })
            .filter(|(_, d)| *d < MERGE_DISTANCE)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let Some((target, _)) = nearest else {
            Self::insert_row(&conn, &pattern)?;
            return Ok(pattern.id);
        };

        // Same neighborhood but a different decision is a new pattern, not a
        // merge; both survive and retrieval ranks them by confidence history.
        if target.target != pattern.target {
            Self::insert_row(&conn, &pattern)?;
            return Ok(pattern.id);
        }

        let id = target.id;
        for _ in 0..VERSION_RETRIES {
            let Some(current) = Self::get_locked(&conn, &id)? else {
                return Err(LearnError::PatternNotFound(id.to_string()));
            };
            let expected = current.version;
            let mut merged = current;
            merged.success_count += pattern.success_count;
            merged.failure_count += pattern.failure_count;
            merged.confidence = merged.confidence.max(pattern.confidence);
            merged.signature_embedding = pattern.signature_embedding.clone();
            merged.content_embedding = pattern.content_embedding.clone();
            if !pattern.synthetic {
                merged.synthetic = false;
            }
            if Self::update_row_versioned(&conn, &merged, expected)? {
                return Ok(id);
            }
        }
        Err(LearnError::Conflict(format!(
            "pattern {} kept changing during merge",
            id
        )))
    }

    fn scope_rows(conn: &Connection, scope_key: &str) -> LearnResult<Vec<Pattern>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM patterns WHERE scope = ?1 AND retired = 0",
            Self::SELECT_COLS
        ))?;
        let rows = stmt.query_map(params![scope_key], Self::map_row)?;
        let mut patterns = Vec::new();
        for row in rows {
            let (id, sc, ss, t, se, ce, c, s, f, sy, r, v, ca, ua) = row?;
            patterns.push(Self::row_to_pattern(
                id, sc, ss, t, se, ce, c, s, f, sy, r, v, ca, ua,
            )?);
        }
        Ok(patterns)
    }

    /// Nearest patterns for a query, tenant scope first.
    ///
    /// When fewer than `min_tenant_matches` tenant-scope hits exist, global
    /// patterns are appended. Ranking: lower combined distance first, ties
    /// broken by higher success count, then id (deterministic).
    pub fn find_candidates(
        &self,
        tenant: &TenantId,
        query_signature: &[f32],
        query_content: &[f32],
        top_k: usize,
        min_tenant_matches: usize,
    ) -> LearnResult<Vec<Candidate>> {
        let conn = self.conn.lock().unwrap();

        let score = |patterns: Vec<Pattern>| -> Vec<Candidate> {
            let mut cands: Vec<Candidate> = patterns
                .into_iter()
                .map(|p| {
                    let distance = combined_distance(
                        query_signature,
                        &p.signature_embedding,
                        query_content,
                        &p.content_embedding,
                    );
                    Candidate { pattern: p, distance }
                })
                .collect();
            cands.sort_by(|a, b| {
                a.distance
                    .partial_cmp(&b.distance)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.pattern.success_count.cmp(&a.pattern.success_count))
                    .then_with(|| a.pattern.id.to_string().cmp(&b.pattern.id.to_string()))
            });
            cands
        };

        let tenant_key = PatternScope::Tenant(tenant.clone()).key();
        let mut results = score(Self::scope_rows(&conn, &tenant_key)?);

        if results.len() < min_tenant_matches {
            let global = score(Self::scope_rows(&conn, "global")?);
            results.extend(global);
        }

        results.truncate(top_k);
        Ok(results)
    }

    /// Record a successful reuse: bump the counter and nudge confidence up.
    pub fn record_success(&self, id: &PatternId) -> LearnResult<()> {
        self.record_outcome(id, true)
    }

    /// Record a corrected/failed reuse: bump the counter, nudge confidence
    /// down, and retire the pattern once the failure share crosses the
    /// cutoff. Retired patterns stay in the table for audit.
    pub fn record_failure(&self, id: &PatternId) -> LearnResult<()> {
        self.record_outcome(id, false)
    }

    fn record_outcome(&self, id: &PatternId, success: bool) -> LearnResult<()> {
        let conn = self.conn.lock().unwrap();
        for _ in 0..VERSION_RETRIES {
            let Some(mut p) = Self::get_locked(&conn, id)? else {
                return Err(LearnError::PatternNotFound(id.to_string()));
            };
            let expected = p.version;
            if success {
                p.success_count += 1;
                p.confidence = (p.confidence + SUCCESS_BONUS).min(CONFIDENCE_CEIL);
            } else {
                p.failure_count += 1;
                p.confidence = (p.confidence - FAILURE_PENALTY).max(CONFIDENCE_FLOOR);
                if p.is_retirement_candidate() {
                    p.retired = true;
                    tracing::info!(pattern = %p.id, "retiring pattern after repeated failures");
                }
            }
            if Self::update_row_versioned(&conn, &p, expected)? {
                return Ok(());
            }
        }
        Err(LearnError::Conflict(format!(
            "pattern {} kept changing during outcome update",
            id
        )))
    }

    /// All patterns in a tenant's scope, including retired ones (audit view).
    pub fn audit_view(&self, tenant: &TenantId) -> LearnResult<Vec<Pattern>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM patterns WHERE scope = ?1",
            Self::SELECT_COLS
        ))?;
        let rows = stmt.query_map(
            params![PatternScope::Tenant(tenant.clone()).key()],
            Self::map_row,
        )?;
        let mut patterns = Vec::new();
        for row in rows {
            let (id, sc, ss, t, se, ce, c, s, f, sy, r, v, ca, ua) = row?;
            patterns.push(Self::row_to_pattern(
                id, sc, ss, t, se, ce, c, s, f, sy, r, v, ca, ua,
            )?);
        }
        Ok(patterns)
    }
}
