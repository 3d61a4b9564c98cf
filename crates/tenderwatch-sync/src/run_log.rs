//! Run-log lifecycle: every opened log is closed exactly once, even on panic or cancellation.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tenderwatch_core::{RunOutcome, ScrapeRunLog};
use tenderwatch_storage::{NewRunLog, Store, StoreError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Counts a run reports when it completes normally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunTally {
    pub records_found: i64,
    pub records_inserted: i64,
    pub details: Option<String>,
}

impl RunTally {
    pub fn absorb(&mut self, other: &RunTally) {
        self.records_found += other.records_found;
        self.records_inserted += other.records_inserted;
    }
}

/// A closed run: its log id and what the body returned.
#[derive(Debug)]
pub struct LoggedRun {
    pub log_id: Uuid,
    pub result: anyhow::Result<RunTally>,
}

/// Closes the log as `error` if the owning future is dropped before closing it.
struct CloseOnDrop {
    store: Arc<dyn Store>,
    log_id: Uuid,
    armed: bool,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(log_id = %self.log_id, "run dropped outside a runtime; log left open");
            return;
        };
        let store = Arc::clone(&self.store);
        let log_id = self.log_id;
        handle.spawn(async move {
            let outcome = RunOutcome::Error {
                message: "run cancelled before completion".to_string(),
            };
            if let Err(err) = store.close_run_log(log_id, &outcome).await {
                warn!(%log_id, error = %err, "could not close cancelled run log");
            }
        });
    }
}

#[derive(Clone)]
pub struct RunLogger {
    store: Arc<dyn Store>,
}

impl RunLogger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Opens a log, runs `body` with its id, and applies the single terminal update.
    /// Fails only if the log cannot be created.
    pub async fn run_logged<F, Fut>(&self, new: NewRunLog, body: F) -> Result<LoggedRun, StoreError>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = anyhow::Result<RunTally>>,
    {
        let source_name = new.source_name.clone();
        let log = self.store.create_run_log(new).await?;
        let mut guard = CloseOnDrop {
            store: Arc::clone(&self.store),
            log_id: log.id,
            armed: true,
        };

        let result = match AssertUnwindSafe(body(log.id)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(anyhow::anyhow!("run panicked: {message}"))
            }
        };

        let outcome = match &result {
            Ok(tally) => RunOutcome::Success {
                records_found: tally.records_found,
                records_inserted: tally.records_inserted,
                details: tally.details.clone(),
            },
            Err(err) => RunOutcome::Error {
                message: format!("{err:#}"),
            },
        };
        match self.store.close_run_log(log.id, &outcome).await {
            Ok(true) => debug!(log_id = %log.id, source_name = %source_name, status = outcome.status().as_str(), "run log closed"),
            Ok(false) => warn!(log_id = %log.id, source_name = %source_name, "run log was already closed"),
            Err(err) => warn!(log_id = %log.id, source_name = %source_name, error = %err, "failed to close run log"),
        }
        guard.armed = false;

        Ok(LoggedRun {
            log_id: log.id,
            result,
        })
    }
}

/// A run log with its descendants, rebuilt from parent links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunLogNode {
    #[serde(flatten)]
    pub log: ScrapeRunLog,
    pub children: Vec<RunLogNode>,
}

pub async fn run_log_tree(store: &dyn Store, root_id: Uuid) -> Result<Option<RunLogNode>, StoreError> {
    let Some(root) = store.run_log(root_id).await? else {
        return Ok(None);
    };

    let mut by_parent: HashMap<Uuid, Vec<ScrapeRunLog>> = HashMap::new();
    let mut queue = VecDeque::from([root_id]);
    while let Some(parent) = queue.pop_front() {
        let mut children = store.run_log_children(parent).await?;
        children.sort_by_key(|c| c.created_at);
        queue.extend(children.iter().map(|c| c.id));
        by_parent.insert(parent, children);
    }

    fn build(log: ScrapeRunLog, by_parent: &mut HashMap<Uuid, Vec<ScrapeRunLog>>) -> RunLogNode {
        let children = by_parent
            .remove(&log.id)
            .unwrap_or_default()
            .into_iter()
            .map(|child| build(child, by_parent))
            .collect();
        RunLogNode { log, children }
    }
    Ok(Some(build(root, &mut by_parent)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tenderwatch_core::RunStatus;
    use tenderwatch_storage::MemoryStore;

    #[tokio::test]
    async fn every_kind_of_run_closes_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let logger = RunLogger::new(store.clone());

        let ok = logger
            .run_logged(NewRunLog::new("ok", None), |_| async {
                Ok(RunTally {
                    records_found: 3,
                    records_inserted: 2,
                    details: None,
                })
            })
            .await
            .unwrap();
        let empty = logger
            .run_logged(NewRunLog::new("empty", None), |_| async { Ok(RunTally::default()) })
            .await
            .unwrap();
        let failed = logger
            .run_logged(NewRunLog::new("failed", None), |_| async {
                Err(anyhow::anyhow!("fetch exhausted"))
            })
            .await
            .unwrap();
        let panicked = logger
            .run_logged(NewRunLog::new("panicked", None), |_| async {
                if true {
                    panic!("extractor blew up");
                }
                Ok(RunTally::default())
            })
            .await
            .unwrap();

        assert!(ok.result.is_ok() && empty.result.is_ok());
        assert!(failed.result.is_err() && panicked.result.is_err());

        let logs = store.run_logs().await;
        assert_eq!(logs.len(), 4);
        assert!(logs.iter().all(|l| l.status != RunStatus::InProgress));
        assert!(logs.iter().all(|l| l.completed_at.is_some()));
        let by_name = |n: &str| logs.iter().find(|l| l.source_name == n).unwrap().clone();
        assert_eq!(by_name("ok").records_inserted, 2);
        assert_eq!(by_name("empty").status, RunStatus::Success);
        assert_eq!(by_name("failed").error_message.as_deref(), Some("fetch exhausted"));
        assert!(by_name("panicked")
            .error_message
            .unwrap()
            .contains("extractor blew up"));
    }

    #[tokio::test]
    async fn dropped_run_is_closed_as_error() {
        let store = Arc::new(MemoryStore::new());
        let logger = RunLogger::new(store.clone());

        let run = logger.run_logged(NewRunLog::new("slow", None), |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(RunTally::default())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(20), run).await;
        assert!(timed_out.is_err());

        for _ in 0..50 {
            tokio::task::yield_now().await;
            if store.run_logs().await[0].status != RunStatus::InProgress {
                break;
            }
        }
        let log = store.run_logs().await.remove(0);
        assert_eq!(log.status, RunStatus::Error);
        assert_eq!(log.error_message.as_deref(), Some("run cancelled before completion"));
    }

    #[tokio::test]
    async fn tree_follows_parent_links() {
        let store = Arc::new(MemoryStore::new());
        let root = store.create_run_log(NewRunLog::new("pipeline", None)).await.unwrap();
        let ppip = store
            .create_run_log(NewRunLog::new("ppip", Some(root.id)))
            .await
            .unwrap();
        store
            .create_run_log(NewRunLog::new("ppip-agpo", Some(ppip.id)))
            .await
            .unwrap();
        store
            .create_run_log(NewRunLog::new("mygov", Some(root.id)))
            .await
            .unwrap();

        let tree = run_log_tree(store.as_ref(), root.id).await.unwrap().unwrap();
        assert_eq!(tree.children.len(), 2);
        let ppip_node = tree
            .children
            .iter()
            .find(|c| c.log.source_name == "ppip")
            .unwrap();
        assert_eq!(ppip_node.children[0].log.source_name, "ppip-agpo");
        assert!(run_log_tree(store.as_ref(), Uuid::new_v4()).await.unwrap().is_none());
    }
}
