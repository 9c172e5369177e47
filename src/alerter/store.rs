use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{MonitorError, Result};
use crate::storage::{from_micros, open_database, to_micros};
use crate::types::{AlertLevel, AlertRecord, AlertState, DeliveryRecord, Direction};

/// Persistence for alert records and their delivery attempts.
/// A store without a database keeps nothing beyond the manager's memory.
#[derive(Clone, Default)]
pub struct AlertStore {
    db: Option<Arc<Mutex<Connection>>>,
}

impl AlertStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn open(config: &StorageConfig) -> Result<Self> {
        match config.sqlite_path.as_deref() {
            Some(path) => Ok(Self { db: Some(Arc::new(Mutex::new(open_database(path)?))) }),
            None => Ok(Self::in_memory()),
        }
    }

    fn conn(&self) -> Result<Option<std::sync::MutexGuard<'_, Connection>>> {
        match &self.db {
            Some(db) => db
                .lock()
                .map(Some)
                .map_err(|_| MonitorError::Storage("alert database lock poisoned".into())),
            None => Ok(None),
        }
    }

    /// Insert or update a record in place.
    pub fn upsert(&self, alert: &AlertRecord) -> Result<()> {
        let Some(conn) = self.conn()? else { return Ok(()) };
        conn.execute(
            "INSERT INTO alerts (id, level, metric, direction, dedup_key, message, observed_value,
                                 hostname, created_at, last_fired_at, resolved_at, state,
                                 fire_count, repeat_count, critical_fires)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
                level = excluded.level,
                message = excluded.message,
                observed_value = excluded.observed_value,
                last_fired_at = excluded.last_fired_at,
                resolved_at = excluded.resolved_at,
                state = excluded.state,
                fire_count = excluded.fire_count,
                repeat_count = excluded.repeat_count,
                critical_fires = excluded.critical_fires",
            params![
                alert.id.to_string(),
                level_str(alert.level),
                alert.metric,
                alert.direction.as_str(),
                alert.dedup_key,
                alert.message,
                alert.observed_value,
                alert.hostname,
                to_micros(alert.created_at),
                to_micros(alert.last_fired_at),
                alert.resolved_at.map(to_micros),
                alert.state.as_str(),
                alert.fire_count,
                alert.repeat_count,
                alert.critical_fires,
            ],
        )?;
        Ok(())
    }

    pub fn insert_deliveries(&self, alert_id: Uuid, deliveries: &[DeliveryRecord]) -> Result<()> {
        let Some(mut conn) = self.conn()? else { return Ok(()) };
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO alert_deliveries (alert_id, channel, attempted_at, success, error)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for d in deliveries {
                stmt.execute(params![
                    alert_id.to_string(),
                    d.channel,
                    to_micros(d.attempted_at),
                    d.success,
                    d.error,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Every stored alert, oldest first, with its delivery history.
    pub fn load(&self) -> Result<Vec<AlertRecord>> {
        let Some(conn) = self.conn()? else { return Ok(Vec::new()) };

        let mut stmt = conn.prepare(
            "SELECT id, level, metric, direction, dedup_key, message, observed_value, hostname,
                    created_at, last_fired_at, resolved_at, state, fire_count, repeat_count,
                    critical_fires
             FROM alerts ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RawAlert {
                id: row.get(0)?,
                level: row.get(1)?,
                metric: row.get(2)?,
                direction: row.get(3)?,
                dedup_key: row.get(4)?,
                message: row.get(5)?,
                observed_value: row.get(6)?,
                hostname: row.get(7)?,
                created_at: row.get(8)?,
                last_fired_at: row.get(9)?,
                resolved_at: row.get(10)?,
                state: row.get(11)?,
                fire_count: row.get(12)?,
                repeat_count: row.get(13)?,
                critical_fires: row.get(14)?,
            })
        })?;

        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row?.into_record()?);
        }

        let mut stmt = conn.prepare(
            "SELECT alert_id, channel, attempted_at, success, error
             FROM alert_deliveries ORDER BY attempted_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        for row in rows {
            let (alert_id, channel, attempted_at, success, error) = row?;
            if let Some(alert) = alerts.iter_mut().find(|a| a.id.to_string() == alert_id) {
                alert.deliveries.push(DeliveryRecord {
                    channel,
                    attempted_at: from_micros(attempted_at)?,
                    success,
                    error,
                });
            }
        }

        Ok(alerts)
    }
}

fn level_str(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Info => "info",
        AlertLevel::Warning => "warning",
        AlertLevel::Error => "error",
        AlertLevel::Critical => "critical",
    }
}

struct RawAlert {
    id: String,
    level: String,
    metric: String,
    direction: String,
    dedup_key: String,
    message: String,
    observed_value: f64,
    hostname: String,
    created_at: i64,
    last_fired_at: i64,
    resolved_at: Option<i64>,
    state: String,
    fire_count: u32,
    repeat_count: u32,
    critical_fires: u32,
}

impl RawAlert {
    fn into_record(self) -> Result<AlertRecord> {
        let corrupt = |what: &str, value: &str| MonitorError::Storage(format!("stored alert has bad {}: {}", what, value));

        Ok(AlertRecord {
            id: Uuid::parse_str(&self.id).map_err(|_| corrupt("id", &self.id))?,
            level: AlertLevel::parse(&self.level).ok_or_else(|| corrupt("level", &self.level))?,
            direction: Direction::parse(&self.direction).ok_or_else(|| corrupt("direction", &self.direction))?,
            state: AlertState::parse(&self.state).ok_or_else(|| corrupt("state", &self.state))?,
            metric: self.metric,
            dedup_key: self.dedup_key,
            message: self.message,
            observed_value: self.observed_value,
            hostname: self.hostname,
            created_at: from_micros(self.created_at)?,
            last_fired_at: from_micros(self.last_fired_at)?,
            resolved_at: self.resolved_at.map(from_micros).transpose()?,
            fire_count: self.fire_count,
            repeat_count: self.repeat_count,
            critical_fires: self.critical_fires,
            deliveries: Vec::new(),
        })
    }
}
