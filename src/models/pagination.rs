//! Paging over the security event log.
//!
//! The audit trail uses page numbers; bulk readers such as the dashboard walk
//! the log with an [`EventCursor`] so no window is ever cut short.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Page-number query parameters for the audit trail.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pagination {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl Pagination {
    const MAX_PER_PAGE: i64 = 200;
    const DEFAULT_PER_PAGE: i64 = 50;

    pub fn limit(&self) -> i64 {
        self.per_page
            .unwrap_or(Self::DEFAULT_PER_PAGE)
            .clamp(1, Self::MAX_PER_PAGE)
    }

    pub fn offset(&self) -> i64 {
        (self.current_page() - 1) * self.limit()
    }

    pub fn current_page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }
}

/// One page of audit trail events with the total match count.
#[derive(Debug, Clone, Serialize)]
pub struct PagedResult<T: Serialize> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

impl<T: Serialize> PagedResult<T> {
    pub fn new(items: Vec<T>, total: i64, pagination: &Pagination) -> Self {
        let per_page = pagination.limit();
        Self {
            items,
            total,
            page: pagination.current_page(),
            per_page,
            total_pages: (total + per_page - 1) / per_page,
        }
    }
}

/// Position in the log, which is ordered newest first with ties broken by
/// `event_id` descending. A scan resumes strictly after the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCursor {
    pub timestamp: DateTime<Utc>,
    pub event_id: Uuid,
}

impl EventCursor {
    /// Whether `(timestamp, event_id)` sorts after this cursor.
    pub fn precedes(&self, timestamp: DateTime<Utc>, event_id: Uuid) -> bool {
        (timestamp, event_id) < (self.timestamp, self.event_id)
    }
}

/// A keyset page; `next` is `None` once the log is exhausted.
#[derive(Debug, Clone)]
pub struct CursorPage<T> {
    pub items: Vec<T>,
    pub next: Option<EventCursor>,
}
