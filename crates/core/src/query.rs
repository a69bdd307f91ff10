//! Operator-facing listing types.

use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskState};

/// Pagination parameters for task listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of tasks to return.
    pub limit: u32,
    /// Offset (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(Self::DEFAULT_LIMIT).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for task listings. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub task_type: Option<String>,
    pub state: Option<TaskState>,
    pub name: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.task_type.as_ref().is_none_or(|t| *t == task.task_type)
            && self.state.is_none_or(|s| s == task.state)
            && self
                .name
                .as_ref()
                .is_none_or(|n| task.name.as_ref() == Some(n))
    }
}

/// One page of a task listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    /// Number of tasks matching the filter across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl TaskPage {
    pub fn new(tasks: Vec<Task>, total: u64, pagination: Pagination) -> Self {
        let has_more = u64::from(pagination.offset) + (tasks.len() as u64) < total;
        Self {
            tasks,
            total,
            pagination,
            has_more,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CreateTask;

    #[test]
    fn pagination_is_capped() {
        assert_eq!(Pagination::new(Some(5000), None).limit, Pagination::MAX_LIMIT);
        assert_eq!(Pagination::new(None, Some(7)), Pagination { limit: 50, offset: 7 });
    }

    #[test]
    fn filter_matches_on_every_set_field() {
        let task = Task::from_create(CreateTask::new("report").with_name("nightly"));
        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter {
            task_type: Some("report".into()),
            state: Some(TaskState::Pending),
            name: Some("nightly".into()),
        }
        .matches(&task));
        assert!(!TaskFilter {
            state: Some(TaskState::Running),
            ..Default::default()
        }
        .matches(&task));
    }

    #[test]
    fn page_reports_more_when_total_exceeds_window() {
        let tasks = vec![Task::from_create(CreateTask::new("a"))];
        let page = TaskPage::new(tasks.clone(), 3, Pagination::new(Some(1), Some(1)));
        assert!(page.has_more);
        let last = TaskPage::new(tasks, 3, Pagination::new(Some(1), Some(2)));
        assert!(!last.has_more);
    }
}
