//! User rows and per-user monthly cost aggregates.

use chrono::{DateTime, Datelike, Utc};
use maestro_core::UserId;
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{StoreError, StoreResult};
use crate::records::{UserQuotas, UserRecord, UserRole};
use crate::store::{parse_opt_ts, parse_ts, uuid_col, Store};

const USER_SELECT: &str = r#"
    SELECT id, email, password_hash, role, max_concurrent_sessions,
           monthly_budget_usd, created_at, deleted_at
    FROM users
"#;

/// Month key used by the cost aggregate table, e.g. `"2026-08"`.
#[must_use]
pub fn month_key(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

impl Store {
    /// Insert a user.
    pub fn insert_user(&self, user: &UserRecord) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO users (
                    id, email, password_hash, role, max_concurrent_sessions,
                    monthly_budget_usd, created_at, deleted_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    user.id.to_string(),
                    user.email,
                    user.password_hash,
                    user.role.as_str(),
                    i64::from(user.quotas.max_concurrent_sessions),
                    user.quotas.monthly_budget_usd,
                    crate::store::ts(user.created_at),
                    user.deleted_at.map(crate::store::ts),
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch a live user.
    pub fn get_user(&self, id: UserId) -> StoreResult<UserRecord> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{USER_SELECT} WHERE id = ?1 AND deleted_at IS NULL"),
                [id.to_string()],
                row_to_user,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("user", id))
        })
    }

    /// Soft-delete a user.
    pub fn soft_delete_user(&self, id: UserId) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE users SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![id.to_string(), crate::store::ts(Utc::now())],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("user", id));
            }
            Ok(())
        })
    }

    /// Replace a user's quotas.
    pub fn update_user_quotas(&self, id: UserId, quotas: UserQuotas) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE users SET max_concurrent_sessions = ?2, monthly_budget_usd = ?3
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![
                    id.to_string(),
                    i64::from(quotas.max_concurrent_sessions),
                    quotas.monthly_budget_usd,
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("user", id));
            }
            Ok(())
        })
    }

    /// Atomically add spend to a user's monthly aggregate.
    pub fn add_user_cost(&self, id: UserId, at: DateTime<Utc>, cost_usd: f64) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO user_costs (user_id, month, cost_usd)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(user_id, month) DO UPDATE SET cost_usd = cost_usd + ?3
                "#,
                params![id.to_string(), month_key(at), cost_usd],
            )?;
            Ok(())
        })
    }

    /// Month-to-date spend for a user.
    pub fn month_to_date_cost(&self, id: UserId, at: DateTime<Utc>) -> StoreResult<f64> {
        self.with_conn(|conn| {
            let cost: Option<f64> = conn
                .query_row(
                    "SELECT cost_usd FROM user_costs WHERE user_id = ?1 AND month = ?2",
                    params![id.to_string(), month_key(at)],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(cost.unwrap_or(0.0))
        })
    }
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    let role: String = row.get(3)?;
    let max_concurrent: i64 = row.get(4)?;
    Ok(UserRecord {
        id: uuid_col(&row.get::<_, String>(0)?)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        role: UserRole::parse(&role).map_err(crate::store::de)?,
        quotas: UserQuotas {
            max_concurrent_sessions: u32::try_from(max_concurrent).unwrap_or(0),
            monthly_budget_usd: row.get(5)?,
        },
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
        deleted_at: parse_opt_ts(row.get(7)?)?,
    })
}
