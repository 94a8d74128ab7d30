use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// One row per batch run. Also the only record daily quotas are derived from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchGenerationLog {
    pub id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub target_count: i32,
    pub success_count: i32,
    pub failure_count: i32,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub count: usize,
    /// Account debited `cost` credits per item.
    pub user_id: Uuid,
    pub cost: i64,
    pub specific_image_ids: Option<Vec<Uuid>>,
    pub max_retries: u32,
    pub delay_between: Duration,
}

/// Parameters of one quota-bound scheduled run.
#[derive(Debug, Clone)]
pub struct ScheduledRun {
    pub scheduled_at: DateTime<Utc>,
    pub batch_size: usize,
    pub daily_limit: u32,
    pub user_id: Uuid,
    pub cost: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemResult {
    pub item_id: Uuid,
    pub character_id: Option<Uuid>,
    pub success: bool,
    pub attempts: u32,
    pub images: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub failure_count: usize,
    pub total_duration_ms: u64,
    pub average_duration_ms: u64,
    pub results: Vec<ItemResult>,
}

impl BatchOutcome {
    pub fn from_results(results: Vec<ItemResult>) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        let total_duration_ms: u64 = results.iter().map(|r| r.duration_ms).sum();
        let average_duration_ms = if results.is_empty() {
            0
        } else {
            total_duration_ms / results.len() as u64
        };
        Self {
            success_count,
            failure_count: results.len() - success_count,
            total_duration_ms,
            average_duration_ms,
            results,
        }
    }
}

/// Result of an hourly, quota-bound batch. Both variants serialize the
/// batch counts at the top level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScheduledBatchOutcome {
    /// Daily cap already met; only a no-op marker log was written.
    Skipped {
        log_id: Uuid,
        daily_limit: u32,
        generated_today: u32,
        #[serde(flatten)]
        outcome: BatchOutcome,
    },
    Ran {
        log_id: Uuid,
        target_count: usize,
        #[serde(flatten)]
        outcome: BatchOutcome,
    },
}

impl ScheduledBatchOutcome {
    pub fn skipped(log_id: Uuid, daily_limit: u32, generated_today: u32) -> Self {
        ScheduledBatchOutcome::Skipped {
            log_id,
            daily_limit,
            generated_today,
            outcome: BatchOutcome::default(),
        }
    }

    pub fn outcome(&self) -> &BatchOutcome {
        match self {
            ScheduledBatchOutcome::Skipped { outcome, .. } | ScheduledBatchOutcome::Ran { outcome, .. } => outcome,
        }
    }

    pub fn log_id(&self) -> Uuid {
        match self {
            ScheduledBatchOutcome::Skipped { log_id, .. } | ScheduledBatchOutcome::Ran { log_id, .. } => *log_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(success: bool, duration_ms: u64) -> ItemResult {
        ItemResult {
            item_id: Uuid::new_v4(),
            character_id: None,
            success,
            attempts: 1,
            images: 0,
            duration_ms,
            error: None,
        }
    }

    #[test]
    fn aggregates_durations() {
        let outcome = BatchOutcome::from_results(vec![
            result(true, 100),
            result(false, 300),
            result(true, 200),
        ]);
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.failure_count, 1);
        assert_eq!(outcome.total_duration_ms, 600);
        assert_eq!(outcome.average_duration_ms, 200);
    }

    #[test]
    fn empty_batch_has_zero_average() {
        let outcome = BatchOutcome::from_results(vec![]);
        assert_eq!(outcome.average_duration_ms, 0);
        assert_eq!(outcome.failure_count, 0);
    }

    #[test]
    fn skipped_run_reports_zero_counts() {
        let skipped = ScheduledBatchOutcome::skipped(Uuid::new_v4(), 24, 24);
        let value = serde_json::to_value(&skipped).unwrap();

        assert_eq!(value["status"], "skipped");
        assert_eq!(value["success_count"], 0);
        assert_eq!(value["failure_count"], 0);
        assert_eq!(value["generated_today"], 24);

        let back: ScheduledBatchOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(back, skipped);
    }
}
