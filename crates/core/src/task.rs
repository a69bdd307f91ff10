//! Task entity and its state machine.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::id::TaskId;
use crate::jitter;

/// Task execution state.
///
/// Transitions:
/// - `Pending -> Running` (claimed by a queue)
/// - `Running -> Completed | Failed` (after the runner returns)
/// - `Running | Completed | Failed -> Pending` (runner asked to repeat)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be claimed once `available_time` has passed.
    Pending,
    /// Claimed by a queue and handed to a worker.
    Running,
    /// The last run failed and nothing rescheduled it.
    Failed,
    /// The last run succeeded and nothing rescheduled it.
    Completed,
    /// A stored value this build does not recognise.
    #[serde(other)]
    Unknown,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Failed => "failed",
            TaskState::Completed => "completed",
            TaskState::Unknown => "unknown",
        }
    }

    /// Parses a stored state; anything unrecognised becomes [`TaskState::Unknown`].
    pub fn from_stored(value: &str) -> Self {
        match value {
            "pending" => TaskState::Pending,
            "running" => TaskState::Running,
            "failed" => TaskState::Failed,
            "completed" => TaskState::Completed,
            _ => TaskState::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Completed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Optional unique name; singleton recurring jobs are created by name.
    pub name: Option<String>,
    /// Selects the runner that executes this task.
    pub task_type: String,
    /// Higher values are claimed first.
    pub priority: i32,
    pub state: TaskState,
    /// Runner-owned key/value data, persisted across runs.
    pub data: Map<String, JsonValue>,
    /// Earliest time the task may be claimed (`None` = immediately).
    pub available_time: Option<DateTime<Utc>>,
    /// After this time the task is no longer scheduled.
    pub expiration_time: Option<DateTime<Utc>>,
    /// Past this time a Running task is presumed orphaned and gets unstuck.
    pub deadline_time: Option<DateTime<Utc>>,
    /// When the task was last dispatched.
    pub run_time: Option<DateTime<Utc>>,
    /// Wall-clock seconds of the last run.
    pub duration: Option<f64>,
    /// Failure(s) captured during the last run.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTask {
    pub name: Option<String>,
    pub task_type: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub data: Map<String, JsonValue>,
    pub available_time: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
}

impl CreateTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, data: Map<String, JsonValue>) -> Self {
        self.data = data;
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_time = Some(at);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_time = Some(at);
        self
    }
}

/// Operator-facing partial update. `None` leaves a field untouched; the
/// nested options on nullable fields allow clearing them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateTask {
    pub name: Option<Option<String>>,
    pub priority: Option<i32>,
    pub state: Option<TaskState>,
    pub data: Option<Map<String, JsonValue>>,
    pub available_time: Option<Option<DateTime<Utc>>>,
    pub expiration_time: Option<Option<DateTime<Utc>>>,
}

impl UpdateTask {
    /// Applies the update in place.
    pub fn apply(self, task: &mut Task) {
        if let Some(name) = self.name {
            task.name = name;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(state) = self.state {
            task.state = state;
        }
        if let Some(data) = self.data {
            task.data = data;
        }
        if let Some(available_time) = self.available_time {
            task.available_time = available_time;
        }
        if let Some(expiration_time) = self.expiration_time {
            task.expiration_time = expiration_time;
        }
        task.updated_at = Utc::now();
    }
}

impl Task {
    /// Build a new Pending task from a create request.
    pub fn from_create(create: CreateTask) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            name: create.name,
            task_type: create.task_type,
            priority: create.priority,
            state: TaskState::Pending,
            data: create.data,
            available_time: create.available_time,
            expiration_time: create.expiration_time,
            deadline_time: None,
            run_time: None,
            duration: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once `expiration_time` has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|at| at <= now)
    }

    /// Pending, available and not expired.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Pending
            && self.available_time.is_none_or(|at| at <= now)
            && !self.is_expired(now)
    }

    /// Move the task to Running for a dispatch at `now`.
    ///
    /// The error of the previous run is cleared so that the outcome of this
    /// run is judged only by what the runner records.
    pub fn claim(&mut self, now: DateTime<Utc>, deadline: DateTime<Utc>) {
        self.state = TaskState::Running;
        self.available_time = None;
        self.run_time = Some(now);
        self.deadline_time = Some(deadline);
        self.error = None;
        self.updated_at = now;
    }

    /// Record a failure without changing state.
    pub fn append_error(&mut self, err: impl fmt::Display) {
        let err = err.to_string();
        self.error = Some(match self.error.take() {
            Some(prev) if !prev.is_empty() => format!("{prev}; {err}"),
            _ => err,
        });
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self) {
        self.state = TaskState::Completed;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, err: impl fmt::Display) {
        self.append_error(err);
        self.state = TaskState::Failed;
    }

    /// Reschedule to run again after `delay`.
    ///
    /// Returns `false` (and completes the task) when the new time falls past
    /// `expiration_time`. Delays past the representable range saturate.
    pub fn repeat_after(&mut self, delay: Duration) -> bool {
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.repeat_at(at)
    }

    /// [`repeat_after`](Self::repeat_after) with a random spread of `fraction`.
    pub fn repeat_after_jittered(&mut self, delay: Duration, fraction: f64) -> bool {
        self.repeat_after(jitter::jittered(delay, fraction))
    }

    /// Reschedule to run again at `at`.
    pub fn repeat_at(&mut self, at: DateTime<Utc>) -> bool {
        self.deadline_time = None;
        if self.expiration_time.is_some_and(|exp| at > exp) {
            self.available_time = None;
            self.state = TaskState::Completed;
            self.updated_at = Utc::now();
            return false;
        }
        self.available_time = Some(at);
        self.state = TaskState::Pending;
        self.updated_at = Utc::now();
        true
    }

    /// Settle the state after a run returned.
    ///
    /// - Pending: the runner rescheduled; the new `available_time` must not
    ///   precede `run_time`, otherwise the task is failed.
    /// - Running: completed, or failed when an error was recorded.
    /// - Completed / Failed: left as is.
    /// - Unknown: failed.
    pub fn resolve_outcome(&mut self) {
        match self.state {
            TaskState::Pending => match self.available_time {
                Some(at) if self.run_time.is_none_or(|origin| at >= origin) => {}
                Some(at) => {
                    let origin = self.run_time.unwrap_or(at);
                    self.mark_failed(format!(
                        "rescheduled to {at}, before its dispatch at {origin}"
                    ));
                }
                None => self.mark_failed("rescheduled without an available time"),
            },
            TaskState::Running => {
                if self.error.is_some() {
                    self.state = TaskState::Failed;
                } else {
                    self.state = TaskState::Completed;
                }
                self.updated_at = Utc::now();
            }
            TaskState::Completed | TaskState::Failed => {}
            TaskState::Unknown => self.mark_failed("run finished in an unrecognised state"),
        }
    }

    /// Typed read of a `data` entry.
    pub fn data_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.data
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    /// Typed write of a `data` entry.
    pub fn set_data(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<(), serde_json::Error> {
        self.data.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn running_task() -> Task {
        let mut task = Task::from_create(CreateTask::new("echo"));
        let now = Utc::now();
        task.claim(now, now + chrono::Duration::minutes(5));
        task
    }

    #[test]
    fn new_task_is_pending_and_claimable() {
        let task = Task::from_create(CreateTask::new("echo").with_priority(3));
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.priority, 3);
        assert!(task.is_claimable(Utc::now()));
    }

    #[test]
    fn future_or_expired_task_is_not_claimable() {
        let now = Utc::now();
        let later = Task::from_create(
            CreateTask::new("echo").available_at(now + chrono::Duration::hours(1)),
        );
        assert!(!later.is_claimable(now));

        let expired = Task::from_create(
            CreateTask::new("echo").expires_at(now - chrono::Duration::seconds(1)),
        );
        assert!(!expired.is_claimable(now));
    }

    #[test]
    fn claim_stamps_dispatch_fields_and_clears_previous_error() {
        let mut task = Task::from_create(
            CreateTask::new("echo").available_at(Utc::now() - chrono::Duration::seconds(1)),
        );
        task.append_error("previous run");
        let now = Utc::now();
        let deadline = now + chrono::Duration::minutes(1);
        task.claim(now, deadline);

        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.available_time, None);
        assert_eq!(task.run_time, Some(now));
        assert_eq!(task.deadline_time, Some(deadline));
        assert_eq!(task.error, None);
    }

    #[test]
    fn running_without_error_completes() {
        let mut task = running_task();
        task.resolve_outcome();
        assert_eq!(task.state, TaskState::Completed);
    }

    #[test]
    fn running_with_error_fails() {
        let mut task = running_task();
        task.append_error("boom");
        task.resolve_outcome();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[test]
    fn valid_reschedule_stays_pending() {
        let mut task = running_task();
        assert!(task.repeat_after(Duration::from_secs(60)));
        task.resolve_outcome();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.available_time.unwrap() > task.run_time.unwrap());
        assert_eq!(task.deadline_time, None);
    }

    #[test]
    fn reschedule_into_the_past_is_failed() {
        let mut task = running_task();
        let origin = task.run_time.unwrap();
        task.repeat_at(origin - chrono::Duration::seconds(30));
        task.resolve_outcome();
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.unwrap().contains("before its dispatch"));
    }

    #[test]
    fn pending_without_available_time_is_failed() {
        let mut task = running_task();
        task.state = TaskState::Pending;
        task.resolve_outcome();
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.unwrap().contains("without an available time"));
    }

    #[test]
    fn terminal_states_are_left_alone() {
        let mut done = running_task();
        done.mark_completed();
        done.resolve_outcome();
        assert_eq!(done.state, TaskState::Completed);

        let mut failed = running_task();
        failed.mark_failed("nope");
        failed.resolve_outcome();
        assert_eq!(failed.state, TaskState::Failed);
    }

    #[test]
    fn unknown_state_is_force_failed() {
        let mut task = running_task();
        task.state = TaskState::Unknown;
        task.resolve_outcome();
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.is_some());
    }

    #[test]
    fn repeat_past_expiration_completes_instead() {
        let mut task = running_task();
        task.expiration_time = Some(Utc::now() + chrono::Duration::seconds(10));
        assert!(!task.repeat_after(Duration::from_secs(3600)));
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.available_time, None);
    }

    #[test]
    fn repeat_after_huge_delay_saturates() {
        let mut task = running_task();
        assert!(task.repeat_after(Duration::MAX));
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.available_time, Some(DateTime::<Utc>::MAX_UTC));

        let mut task = running_task();
        task.expiration_time = Some(Utc::now() + chrono::Duration::days(365));
        assert!(!task.repeat_after(Duration::MAX));
        assert_eq!(task.state, TaskState::Completed);
    }

    #[test]
    fn repeat_clears_terminal_status() {
        let mut task = running_task();
        task.mark_failed("transient");
        assert!(task.repeat_after(Duration::from_secs(5)));
        assert_eq!(task.state, TaskState::Pending);
        // The error stays visible until the next claim.
        assert_eq!(task.error.as_deref(), Some("transient"));
    }

    #[test]
    fn errors_accumulate() {
        let mut task = running_task();
        task.append_error("first");
        task.append_error("second");
        assert_eq!(task.error.as_deref(), Some("first; second"));
    }

    #[test]
    fn data_helpers_round_trip_typed_values() {
        let mut task = running_task();
        task.set_data("batch_size", 250u32).unwrap();
        assert_eq!(task.data_value::<u32>("batch_size").unwrap(), Some(250));
        assert_eq!(task.data_value::<u32>("missing").unwrap(), None);
        assert!(task.data_value::<String>("batch_size").is_err());
    }

    #[test]
    fn unrecognised_state_deserializes_to_unknown() {
        let state: TaskState = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(state, TaskState::Unknown);
        assert_eq!(TaskState::from_stored("paused"), TaskState::Unknown);
        assert_eq!(TaskState::from_stored("running"), TaskState::Running);
        assert_eq!(serde_json::to_string(&TaskState::Completed).unwrap(), "\"completed\"");
    }

    #[test]
    fn update_applies_only_present_fields() {
        let mut task = running_task();
        task.name = Some("nightly".into());
        UpdateTask {
            priority: Some(9),
            name: Some(None),
            ..Default::default()
        }
        .apply(&mut task);
        assert_eq!(task.priority, 9);
        assert_eq!(task.name, None);
        assert_eq!(task.task_type, "echo");
    }

    fn any_state() -> impl Strategy<Value = TaskState> {
        prop_oneof![
            Just(TaskState::Pending),
            Just(TaskState::Running),
            Just(TaskState::Failed),
            Just(TaskState::Completed),
            Just(TaskState::Unknown),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever a runner leaves behind, resolving the outcome
        /// never leaves a task Running or Unknown, and a surviving Pending
        /// task is never scheduled before its dispatch.
        #[test]
        fn resolve_outcome_always_settles(
            state in any_state(),
            offset_secs in proptest::option::of(-3600i64..3600),
            errored in any::<bool>(),
        ) {
            let mut task = running_task();
            let origin = task.run_time.unwrap();
            task.state = state;
            task.available_time = offset_secs.map(|s| origin + chrono::Duration::seconds(s));
            if errored {
                task.append_error("runner error");
            }

            task.resolve_outcome();

            prop_assert!(matches!(
                task.state,
                TaskState::Pending | TaskState::Completed | TaskState::Failed
            ));
            if task.state == TaskState::Pending {
                prop_assert!(task.available_time.unwrap() >= origin);
            }
        }
    }
}
