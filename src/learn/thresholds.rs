//! Per-tenant, per-operation confidence thresholds
//!
//! Thresholds decide auto-apply vs. suggest vs. reject for each operation
//! type, seeded with conservative defaults and nudged from observed
//! correction rates. Every adjustment is appended to a history table so a
//! threshold value is always explainable.

use super::{LearnError, LearnResult};
use crate::flow::TenantId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// Operation types that carry their own thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    FieldMapping,
    Classification,
    DebtScoring,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::FieldMapping => "field_mapping",
            OperationType::Classification => "classification",
            OperationType::DebtScoring => "debt_scoring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "field_mapping" => Some(Self::FieldMapping),
            "classification" => Some(Self::Classification),
            "debt_scoring" => Some(Self::DebtScoring),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three cutoffs for one tenant/operation pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub auto_apply: f32,
    pub suggest: f32,
    pub reject: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto_apply: 0.90,
            suggest: 0.60,
            reject: 0.30,
        }
    }
}

/// One appended history entry explaining an adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adjustment {
    pub tenant: String,
    pub operation: OperationType,
    pub field: String,
    pub old_value: f32,
    pub new_value: f32,
    pub correction_rate: f32,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// EWMA weight for the rolling correction rate.
const EWMA_ALPHA: f32 = 0.2;
/// Correction rate above which thresholds move up (more conservative).
const RATE_CEILING: f32 = 0.2;
/// Correction rate below which thresholds may move down.
const RATE_FLOOR: f32 = 0.02;
/// Observations required before a downward (permissive) move.
const OBSERVATION_WINDOW: u32 = 20;
/// Step size per adjustment.
const STEP: f32 = 0.02;

const AUTO_APPLY_CEIL: f32 = 0.99;
const AUTO_APPLY_FLOOR: f32 = 0.70;
const SUGGEST_FLOOR: f32 = 0.40;

/// SQLite-backed threshold manager.
///
/// Thresholds are keyed by tenant and operation, never shared across
/// tenants. Callers always pass the tenant explicitly.
pub struct ThresholdManager {
    conn: Mutex<Connection>,
}

impl ThresholdManager {
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
            CREATE TABLE IF NOT EXISTS thresholds (
                tenant_key TEXT NOT NULL,
                operation TEXT NOT NULL,
                auto_apply REAL NOT NULL,
                suggest REAL NOT NULL,
                reject REAL NOT NULL,
                correction_rate REAL NOT NULL DEFAULT 0,
                observations INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_key, operation)
            );

            CREATE TABLE IF NOT EXISTS threshold_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_key TEXT NOT NULL,
                operation TEXT NOT NULL,
                field TEXT NOT NULL,
                old_value REAL NOT NULL,
                new_value REAL NOT NULL,
                correction_rate REAL NOT NULL,
                reason TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    /// Current thresholds for a tenant/operation, seeding the conservative
    /// defaults on first touch.
    pub fn get(&self, tenant: &TenantId, op: OperationType) -> LearnResult<Thresholds> {
        let conn = self.conn.lock().unwrap();
        let (t, _, _) = Self::load_or_seed(&conn, tenant, op)?;
        Ok(t)
    }

    fn load_or_seed(
        conn: &Connection,
        tenant: &TenantId,
        op: OperationType,
    ) -> LearnResult<(Thresholds, f32, u32)> {
        let row: Option<(f64, f64, f64, f64, i64)> = conn
            .query_row(
                "SELECT auto_apply, suggest, reject, correction_rate, observations
                 FROM thresholds WHERE tenant_key = ?1 AND operation = ?2",
                params![tenant.key(), op.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;

        if let Some((a, s, r, rate, obs)) = row {
            return Ok((
                Thresholds {
                    auto_apply: a as f32,
                    suggest: s as f32,
                    reject: r as f32,
                },
                rate as f32,
                obs as u32,
            ));
        }

        let defaults = Thresholds::default();
        conn.execute(
            "INSERT INTO thresholds (tenant_key, operation, auto_apply, suggest, reject,
                                     correction_rate, observations)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0)",
            params![
                tenant.key(),
                op.as_str(),
                defaults.auto_apply as f64,
                defaults.suggest as f64,
                defaults.reject as f64,
            ],
        )?;
        Ok((defaults, 0.0, 0))
    }

    fn append_history(
        conn: &Connection,
        tenant: &TenantId,
        op: OperationType,
        field: &str,
        old: f32,
        new: f32,
        rate: f32,
        reason: &str,
    ) -> LearnResult<()> {
        conn.execute(
            "INSERT INTO threshold_history (tenant_key, operation, field, old_value,
                                            new_value, correction_rate, reason, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tenant.key(),
                op.as_str(),
                field,
                old as f64,
                new as f64,
                rate as f64,
                reason,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fold one accepted/corrected outcome into the rolling rate and adjust
    /// thresholds when it crosses the configured bands.
    ///
    /// Corrections push thresholds up (more conservative); a sustained
    /// near-zero rate over the observation window lets them drift back down.
    /// `auto_apply` never decreases while corrections are occurring.
    pub fn record_outcome(
        &self,
        tenant: &TenantId,
        op: OperationType,
        was_corrected: bool,
    ) -> LearnResult<Thresholds> {
        let conn = self.conn.lock().unwrap();
        let (mut t, mut rate, mut obs) = Self::load_or_seed(&conn, tenant, op)?;

        let sample = if was_corrected { 1.0 } else { 0.0 };
        rate = (1.0 - EWMA_ALPHA) * rate + EWMA_ALPHA * sample;
        obs += 1;

        if was_corrected && rate > RATE_CEILING {
            let old = t.auto_apply;
            t.auto_apply = (t.auto_apply + STEP).min(AUTO_APPLY_CEIL);
            if t.auto_apply != old {
                Self::append_history(
                    &conn, tenant, op, "auto_apply", old, t.auto_apply, rate,
                    "correction rate above ceiling",
                )?;
                tracing::debug!(
                    tenant = %tenant, operation = %op, old, new = t.auto_apply,
                    "raising auto_apply threshold"
                );
            }
            let old = t.suggest;
            t.suggest = (t.suggest + STEP / 2.0).min(t.auto_apply - 0.05);
            if t.suggest != old {
                Self::append_history(
                    &conn, tenant, op, "suggest", old, t.suggest, rate,
                    "correction rate above ceiling",
                )?;
            }
        } else if !was_corrected && obs >= OBSERVATION_WINDOW && rate < RATE_FLOOR {
            let old = t.auto_apply;
            t.auto_apply = (t.auto_apply - STEP).max(AUTO_APPLY_FLOOR);
            if t.auto_apply != old {
                Self::append_history(
                    &conn, tenant, op, "auto_apply", old, t.auto_apply, rate,
                    "correction rate near zero over window",
                )?;
            }
            let old = t.suggest;
            t.suggest = (t.suggest - STEP / 2.0).max(SUGGEST_FLOOR);
            if t.suggest != old {
                Self::append_history(
                    &conn, tenant, op, "suggest", old, t.suggest, rate,
                    "correction rate near zero over window",
                )?;
            }
        }

        conn.execute(
            "UPDATE thresholds SET auto_apply = ?1, suggest = ?2, reject = ?3,
                    correction_rate = ?4, observations = ?5
             WHERE tenant_key = ?6 AND operation = ?7",
            params![
                t.auto_apply as f64,
                t.suggest as f64,
                t.reject as f64,
                rate as f64,
                obs as i64,
                tenant.key(),
                op.as_str(),
            ],
        )?;
        Ok(t)
    }

    /// Append-only adjustment history for a tenant/operation, oldest first.
    pub fn history(&self, tenant: &TenantId, op: OperationType) -> LearnResult<Vec<Adjustment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT tenant_key, operation, field, old_value, new_value, correction_rate,
                    reason, recorded_at
             FROM threshold_history WHERE tenant_key = ?1 AND operation = ?2
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![tenant.key(), op.as_str()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, f64>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (tenant, operation, field, old, new, rate, reason, at) = row?;
            entries.push(Adjustment {
                tenant,
                operation: OperationType::parse(&operation)
                    .ok_or_else(|| LearnError::Corrupt(format!("bad operation {}", operation)))?,
                field,
                old_value: old as f32,
                new_value: new as f32,
                correction_rate: rate as f32,
                reason,
                recorded_at: DateTime::parse_from_rfc3339(&at)
                    .map_err(|e| LearnError::Corrupt(e.to_string()))?
                    .with_timezone(&Utc),
            });
        }
        Ok(entries)
    }
}
