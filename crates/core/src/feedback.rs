//! Daily feedback cadence per user.
//!
//! Each user is asked for a rating at most once per calendar day. A record
//! from an earlier day is treated as absent, so the cadence resets at the day
//! boundary without any explicit reset step. State is process-local and is
//! lost on restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::{Clock, SystemClock};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FeedbackRecord {
    pub user_id: String,
    pub date: NaiveDate,
    pub feedback_prompted: bool,
    pub feedback_given: bool,
    pub rating: Option<u8>,
    pub first_interaction_at: Option<DateTime<Utc>>,
    pub prompted_at: Option<DateTime<Utc>>,
    pub given_at: Option<DateTime<Utc>>,
}

impl FeedbackRecord {
    fn fresh(user_id: &str, date: NaiveDate) -> Self {
        Self {
            user_id: user_id.to_owned(),
            date,
            feedback_prompted: false,
            feedback_given: false,
            rating: None,
            first_interaction_at: None,
            prompted_at: None,
            given_at: None,
        }
    }
}

pub struct FeedbackTracker {
    clock: Arc<dyn Clock>,
    records: RwLock<HashMap<String, FeedbackRecord>>,
}

impl Default for FeedbackTracker {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl FeedbackTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, records: RwLock::new(HashMap::new()) }
    }

    pub async fn should_prompt(&self, user_id: &str) -> bool {
        let Some(user_id) = normalize_user_id(user_id) else {
            return false;
        };

        let today = self.clock.today();
        let records = self.records.read().await;
        match records.get(user_id) {
            None => true,
            Some(record) if record.date != today => true,
            Some(record) => !record.feedback_prompted && !record.feedback_given,
        }
    }

    pub async fn mark_prompted(&self, user_id: &str) {
        let Some(user_id) = normalize_user_id(user_id) else {
            return;
        };

        let today = self.clock.today();
        let now = self.clock.now();
        let mut records = self.records.write().await;
        let record = records
            .entry(user_id.to_owned())
            .and_modify(|record| {
                if record.date != today {
                    *record = FeedbackRecord::fresh(user_id, today);
                }
            })
            .or_insert_with(|| FeedbackRecord::fresh(user_id, today));
        record.feedback_prompted = true;
        record.prompted_at = Some(now);
    }

    /// Records a submitted rating; `None` means the prompt was dismissed.
    pub async fn mark_given(&self, user_id: &str, rating: Option<u8>) {
        let Some(user_id) = normalize_user_id(user_id) else {
            return;
        };

        let now = self.clock.now();
        let record = FeedbackRecord {
            user_id: user_id.to_owned(),
            date: self.clock.today(),
            feedback_prompted: true,
            feedback_given: true,
            rating,
            first_interaction_at: None,
            prompted_at: Some(now),
            given_at: Some(now),
        };
        self.records.write().await.insert(user_id.to_owned(), record);
    }

    /// Notes that the user talked to the bot today without touching prompt flags.
    pub async fn mark_interaction(&self, user_id: &str) {
        let Some(user_id) = normalize_user_id(user_id) else {
            return;
        };

        let today = self.clock.today();
        let now = self.clock.now();
        let mut records = self.records.write().await;
        let is_current = records.get(user_id).is_some_and(|record| record.date == today);
        if !is_current {
            let mut record = FeedbackRecord::fresh(user_id, today);
            record.first_interaction_at = Some(now);
            records.insert(user_id.to_owned(), record);
        }
    }

    pub async fn status(&self, user_id: &str) -> Option<FeedbackRecord> {
        let user_id = normalize_user_id(user_id)?;
        self.records.read().await.get(user_id).cloned()
    }

    /// Drops every record not dated today or yesterday. Returns the purge count.
    pub async fn sweep(&self) -> usize {
        let today = self.clock.today();
        let yesterday = today.pred_opt().unwrap_or(today);

        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.date == today || record.date == yesterday);
        before - records.len()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

/// Runs [`FeedbackTracker::sweep`] every `period` for the life of the runtime.
pub fn spawn_sweeper(tracker: Arc<FeedbackTracker>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let purged = tracker.sweep().await;
            let remaining = tracker.len().await;
            debug!(
                event_name = "feedback.sweep.completed",
                purged,
                remaining,
                "feedback records swept"
            );
        }
    })
}

fn normalize_user_id(user_id: &str) -> Option<&str> {
    let trimmed = user_id.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{Duration, TimeZone, Utc};

    use super::{spawn_sweeper, FeedbackTracker};
    use crate::clock::ManualClock;

    fn tracker_at(day: u32) -> (Arc<ManualClock>, FeedbackTracker) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, day, 9, 0, 0).unwrap()));
        let tracker = FeedbackTracker::new(clock.clone());
        (clock, tracker)
    }

    #[tokio::test]
    async fn prompts_fresh_user_once_per_day() {
        let (clock, tracker) = tracker_at(4);

        assert!(tracker.should_prompt("user-1").await);
        tracker.mark_prompted("user-1").await;
        assert!(!tracker.should_prompt("user-1").await);

        clock.advance(Duration::days(1));
        assert!(tracker.should_prompt("user-1").await);
    }

    #[tokio::test]
    async fn blank_user_id_never_prompts_and_is_not_recorded() {
        let (_, tracker) = tracker_at(4);

        assert!(!tracker.should_prompt("").await);
        assert!(!tracker.should_prompt("   ").await);
        tracker.mark_prompted(" ").await;
        tracker.mark_given("", Some(5)).await;

        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn given_feedback_is_reflected_in_status() {
        let (_, tracker) = tracker_at(4);

        tracker.mark_given("user-2", Some(3)).await;
        let record = tracker.status("user-2").await.expect("record should exist");

        assert!(record.feedback_given);
        assert!(record.feedback_prompted);
        assert_eq!(record.rating, Some(3));
        assert!(record.given_at.is_some());
        assert!(!tracker.should_prompt("user-2").await);
    }

    #[tokio::test]
    async fn interaction_alone_keeps_user_promptable() {
        let (_, tracker) = tracker_at(4);

        tracker.mark_interaction("user-3").await;

        assert!(tracker.should_prompt("user-3").await);
        let record = tracker.status("user-3").await.expect("record should exist");
        assert!(record.first_interaction_at.is_some());
        assert!(!record.feedback_prompted);
    }

    #[tokio::test]
    async fn interaction_does_not_reset_todays_prompt() {
        let (_, tracker) = tracker_at(4);

        tracker.mark_prompted("user-4").await;
        tracker.mark_interaction("user-4").await;

        assert!(!tracker.should_prompt("user-4").await);
    }

    #[tokio::test]
    async fn prompting_on_a_new_day_replaces_stale_record() {
        let (clock, tracker) = tracker_at(4);

        tracker.mark_given("user-5", Some(1)).await;
        clock.advance(Duration::days(1));
        tracker.mark_prompted("user-5").await;

        let record = tracker.status("user-5").await.expect("record should exist");
        assert_eq!(record.date, clock_today(&clock));
        assert!(record.feedback_prompted);
        assert!(!record.feedback_given);
        assert_eq!(record.rating, None);
    }

    #[tokio::test]
    async fn sweep_keeps_today_and_yesterday_only() {
        let (clock, tracker) = tracker_at(4);

        tracker.mark_prompted("two-days-old").await;
        clock.advance(Duration::days(1));
        tracker.mark_prompted("yesterday").await;
        clock.advance(Duration::days(1));
        tracker.mark_prompted("today").await;

        let purged = tracker.sweep().await;

        assert_eq!(purged, 1);
        assert!(tracker.status("two-days-old").await.is_none());
        assert!(tracker.status("yesterday").await.is_some());
        assert!(tracker.status("today").await.is_some());
    }

    #[tokio::test]
    async fn status_has_no_side_effects() {
        let (_, tracker) = tracker_at(4);

        assert!(tracker.status("ghost").await.is_none());
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn background_sweeper_purges_on_each_period() {
        let (clock, tracker) = tracker_at(4);
        let tracker = Arc::new(tracker);

        tracker.mark_prompted("old").await;
        clock.advance(Duration::days(3));

        let handle = spawn_sweeper(tracker.clone(), StdDuration::from_millis(10));
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        assert!(tracker.is_empty().await);
        handle.abort();
    }

    fn clock_today(clock: &ManualClock) -> chrono::NaiveDate {
        use crate::clock::Clock;
        clock.today()
    }
}
