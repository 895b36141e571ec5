//! Usage accounting database operations

use chrono::NaiveDate;
use rusqlite::{OptionalExtension, Result as SqliteResult};

use crate::models::{LeaderboardEntry, UsageRecord};
use super::super::Database;

impl Database {
    /// Accumulate one request into the (user, model, day) bucket.
    ///
    /// A `None` cost leaves the bucket's cost untouched rather than counting
    /// the request as free.
    pub fn record_usage(
        &self,
        user_id: i64,
        model_id: i64,
        day: NaiveDate,
        input_tokens: i64,
        output_tokens: i64,
        estimated_cost: Option<f64>,
    ) -> SqliteResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO usage_records (user_id, model_id, day, input_tokens, output_tokens, total_tokens, estimated_cost, request_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
             ON CONFLICT(user_id, model_id, day) DO UPDATE SET
                input_tokens = input_tokens + excluded.input_tokens,
                output_tokens = output_tokens + excluded.output_tokens,
                total_tokens = total_tokens + excluded.total_tokens,
                estimated_cost = CASE
                    WHEN excluded.estimated_cost IS NULL THEN estimated_cost
                    ELSE COALESCE(estimated_cost, 0) + excluded.estimated_cost
                END,
                request_count = request_count + 1",
            rusqlite::params![
                user_id,
                model_id,
                day,
                input_tokens,
                output_tokens,
                input_tokens + output_tokens,
                estimated_cost
            ],
        )?;
        Ok(())
    }

    pub fn get_usage_record(
        &self,
        user_id: i64,
        model_id: i64,
        day: NaiveDate,
    ) -> SqliteResult<Option<UsageRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, model_id, day, input_tokens, output_tokens, total_tokens, estimated_cost, request_count
             FROM usage_records WHERE user_id = ?1 AND model_id = ?2 AND day = ?3",
            rusqlite::params![user_id, model_id, day],
            |row| {
                Ok(UsageRecord {
                    user_id: row.get(0)?,
                    model_id: row.get(1)?,
                    day: row.get(2)?,
                    input_tokens: row.get(3)?,
                    output_tokens: row.get(4)?,
                    total_tokens: row.get(5)?,
                    estimated_cost: row.get(6)?,
                    request_count: row.get(7)?,
                })
            },
        )
        .optional()
    }

    /// Users ranked by total tokens since `since` (inclusive)
    pub fn usage_leaderboard(&self, since: NaiveDate, limit: i64) -> SqliteResult<Vec<LeaderboardEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT u.id, u.email, SUM(r.total_tokens), SUM(r.estimated_cost), SUM(r.request_count)
             FROM usage_records r JOIN users u ON u.id = r.user_id
             WHERE r.day >= ?1
             GROUP BY u.id, u.email
             ORDER BY SUM(r.total_tokens) DESC
             LIMIT ?2",
        )?;

        let entries = stmt
            .query_map(rusqlite::params![since, limit], |row| {
                Ok(LeaderboardEntry {
                    user_id: row.get(0)?,
                    email: row.get(1)?,
                    total_tokens: row.get(2)?,
                    estimated_cost: row.get(3)?,
                    request_count: row.get(4)?,
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(entries)
    }
}
