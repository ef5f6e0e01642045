//! Task context shared by every stage of a harvesting run.
//!
//! A [`TaskContext`] bundles everything a subtask needs from its surroundings:
//! the database, the dynamic-table [`Dal`], the [`Shutdown`] signal, settings,
//! the sync policy, and progress reporting.
//!
//! # Example
//!
//! ```ignore
//! use tributary::context::TaskContext;
//!
//! let ctx = TaskContext::builder()
//!     .database(db)
//!     .plugin("github")
//!     .settings(HarvestSettings::load()?)
//!     .build()?;
//!
//! let collect_ctx = ctx.for_subtask("collect_issues");
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use tokio::sync::Notify;

use crate::dal::Dal;
use crate::error::{HarvestError, Result};
use crate::progress::{self, HarvestProgress, ProgressCallback, ProgressCounter};
use crate::settings::HarvestSettings;

// ─── Shutdown ───────────────────────────────────────────────────────────────

/// Cooperative cancellation signal threaded through every stage.
///
/// Cloning shares the same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake everything waiting on [`Shutdown::requested`].
    pub fn request(&self) {
        if !self.inner.flag.swap(true, Ordering::SeqCst) {
            tracing::info!("Shutdown requested");
        }
        self.inner.notify.notify_waiters();
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Return [`HarvestError::Cancelled`] once shutdown has been requested.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_requested() {
            Err(HarvestError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once shutdown has been requested.
    pub async fn requested(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

// ─── Sync policy ────────────────────────────────────────────────────────────

/// Caller-supplied policy deciding how far back a run should reach.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Only collect data created or updated after this instant.
    pub time_after: Option<DateTime<Utc>>,
    /// Ignore prior state and collect everything again.
    pub full_sync: bool,
}

// ─── Task context ───────────────────────────────────────────────────────────

/// Context for a plugin task and its subtasks.
///
/// Cheap to clone: all state is reference counted.
#[derive(Clone)]
pub struct TaskContext {
    db: Arc<DatabaseConnection>,
    dal: Dal,
    shutdown: Shutdown,
    settings: Arc<HarvestSettings>,
    sync_policy: Option<SyncPolicy>,
    plugin: Arc<str>,
    subtask: Arc<str>,
    progress: Arc<ProgressCounter>,
    on_progress: Option<Arc<ProgressCallback>>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("plugin", &self.plugin)
            .field("subtask", &self.subtask)
            .field("sync_policy", &self.sync_policy)
            .field("progress", &self.progress.get())
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    pub fn builder() -> TaskContextBuilder {
        TaskContextBuilder::default()
    }

    /// Derive a context for a named subtask with its own progress counter.
    pub fn for_subtask(&self, subtask: &str) -> Self {
        Self {
            subtask: Arc::from(subtask),
            progress: Arc::new(ProgressCounter::default()),
            ..self.clone()
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn dal(&self) -> &Dal {
        &self.dal
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn settings(&self) -> &HarvestSettings {
        &self.settings
    }

    pub fn sync_policy(&self) -> Option<&SyncPolicy> {
        self.sync_policy.as_ref()
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn subtask(&self) -> &str {
        &self.subtask
    }

    pub fn progress(&self) -> (i64, i64) {
        self.progress.get()
    }

    pub fn progress_callback(&self) -> Option<Arc<ProgressCallback>> {
        self.on_progress.clone()
    }

    /// Emit a progress event to the registered callback, if any.
    pub fn emit(&self, event: HarvestProgress) {
        progress::emit(self.on_progress.as_deref(), event);
    }

    /// Reset progress, e.g. `set_progress(0, -1)` for an unknown total.
    pub fn set_progress(&self, current: i64, total: i64) {
        self.progress.set(current, total);
        self.report_progress(current, total);
    }

    pub fn set_progress_total(&self, total: i64) {
        self.progress.set_total(total);
        let (current, _) = self.progress.get();
        self.report_progress(current, total);
    }

    pub fn inc_progress(&self, delta: i64) {
        let current = self.progress.inc(delta);
        let (_, total) = self.progress.get();
        self.report_progress(current, total);
    }

    fn report_progress(&self, current: i64, total: i64) {
        self.emit(HarvestProgress::Progress {
            subtask: self.subtask.to_string(),
            current,
            total,
        });
    }
}

/// Builder for [`TaskContext`].
#[derive(Default)]
pub struct TaskContextBuilder {
    db: Option<Arc<DatabaseConnection>>,
    shutdown: Option<Shutdown>,
    settings: Option<HarvestSettings>,
    sync_policy: Option<SyncPolicy>,
    plugin: Option<String>,
    on_progress: Option<Arc<ProgressCallback>>,
}

impl TaskContextBuilder {
    /// Set the database connection (required).
    pub fn database(mut self, db: impl Into<Arc<DatabaseConnection>>) -> Self {
        self.db = Some(db.into());
        self
    }

    /// Share an existing shutdown signal.
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn settings(mut self, settings: HarvestSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = Some(policy);
        self
    }

    /// Name of the plugin owning this task.
    pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Finish the context.
    ///
    /// # Errors
    /// Returns [`HarvestError::MissingField`] if no database was set.
    pub fn build(self) -> Result<TaskContext> {
        let db = self.db.ok_or(HarvestError::MissingField("database"))?;
        Ok(TaskContext {
            dal: Dal::new(Arc::clone(&db)),
            db,
            shutdown: self.shutdown.unwrap_or_default(),
            settings: Arc::new(self.settings.unwrap_or_default()),
            sync_policy: self.sync_policy,
            plugin: Arc::from(self.plugin.unwrap_or_default()),
            subtask: Arc::from(""),
            progress: Arc::new(ProgressCounter::default()),
            on_progress: self.on_progress,
        })
    }
}
