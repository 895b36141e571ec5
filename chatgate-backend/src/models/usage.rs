use chrono::NaiveDate;
use serde::Serialize;

/// Per-user, per-model, per-day usage bucket
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub user_id: i64,
    pub model_id: i64,
    pub day: NaiveDate,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    /// None when the model has no pricing configured
    pub estimated_cost: Option<f64>,
    pub request_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub user_id: i64,
    pub email: String,
    pub total_tokens: i64,
    pub estimated_cost: Option<f64>,
    pub request_count: i64,
}
