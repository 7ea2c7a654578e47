//! # Display Repository
//!
//! Kiosk displays and the calendars attached to them.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use roomsign_core::Display;

#[derive(Debug, sqlx::FromRow)]
struct DisplayRow {
    id: String,
    name: String,
    room_calendar_id: Option<String>,
    config: String,
}

/// Repository for displays.
#[derive(Debug, Clone)]
pub struct DisplayRepository {
    pool: SqlitePool,
}

impl DisplayRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DisplayRepository { pool }
    }

    /// Inserts a display. Used for seeding and tests.
    pub async fn insert(
        &self,
        id: &str,
        name: &str,
        room_calendar_id: Option<&str>,
        config: &serde_json::Value,
    ) -> DbResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO displays (id, name, room_calendar_id, config, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(room_calendar_id)
        .bind(config.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attaches an extra calendar to a display at `position`.
    pub async fn attach_calendar(&self, display_id: &str, calendar_id: &str, position: i64) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO display_calendars (display_id, calendar_id, position)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (display_id, calendar_id) DO UPDATE SET position = excluded.position
            "#,
        )
        .bind(display_id)
        .bind(calendar_id)
        .bind(position)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Gets a display with its ordered calendar ids.
    pub async fn get(&self, id: &str) -> DbResult<Option<Display>> {
        let row = sqlx::query_as::<_, DisplayRow>(
            "SELECT id, name, room_calendar_id, config FROM displays WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let attached: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT calendar_id FROM display_calendars
            WHERE display_id = ?1
            ORDER BY position, calendar_id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let config = serde_json::from_str(&row.config)
            .map_err(|e| DbError::corrupt("display config", format!("{}: {e}", row.id)))?;

        Ok(Some(Display {
            calendar_ids: Display::merge_calendar_ids(row.room_calendar_id.as_deref(), &attached),
            id: row.id,
            name: row.name,
            room_calendar_id: row.room_calendar_id,
            config,
        }))
    }

    /// Replaces a display's configuration.
    ///
    /// ## Errors
    /// `DbError::NotFound` when the display does not exist.
    pub async fn update_config(&self, id: &str, config: &serde_json::Value) -> DbResult<()> {
        let result = sqlx::query("UPDATE displays SET config = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(config.to_string())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Display", id));
        }

        debug!(display_id = %id, "Display config updated");
        Ok(())
    }
}
