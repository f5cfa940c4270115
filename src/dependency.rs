use std::sync::Arc;

use tracing::debug;

use crate::{Task, TaskId, TaskRepository, TaskStatus};

/// Why a task may or may not run right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// A dependency is unregistered (`status: None`) or has not completed yet.
    Waiting {
        dependency: TaskId,
        status: Option<TaskStatus>,
    },
    /// A dependency ended in `error` or `cancelled`; the task can never run.
    Blocked {
        dependency: TaskId,
        status: TaskStatus,
        error: Option<String>,
    },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Read-only view over the repository that answers "can this task run?".
#[derive(Clone)]
pub struct DependencyChecker {
    repo: Arc<dyn TaskRepository>,
}

impl DependencyChecker {
    pub fn new(repo: Arc<dyn TaskRepository>) -> Self {
        Self { repo }
    }

    pub async fn can_execute(&self, task: &Task) -> bool {
        self.readiness(task).await.is_ready()
    }

    /// Inspects every dependency. A permanently failed dependency wins over
    /// one that is merely still waiting.
    pub async fn readiness(&self, task: &Task) -> Readiness {
        let mut waiting = None;

        for dep in &task.dependencies {
            let Some(handle) = self.repo.get(dep).await else {
                debug!(task_id = %task.id, dependency = %dep, "dependency not registered yet");
                waiting.get_or_insert(Readiness::Waiting {
                    dependency: dep.clone(),
                    status: None,
                });
                continue;
            };

            let (status, error) = {
                let dependency = handle.read().await;
                (dependency.status, dependency.error.clone())
            };

            match status {
                TaskStatus::Completed => {}
                TaskStatus::Error | TaskStatus::Cancelled => {
                    debug!(task_id = %task.id, dependency = %dep, %status, "dependency failed");
                    return Readiness::Blocked {
                        dependency: dep.clone(),
                        status,
                        error,
                    };
                }
                other => {
                    debug!(task_id = %task.id, dependency = %dep, status = %other, "dependency not completed");
                    waiting.get_or_insert(Readiness::Waiting {
                        dependency: dep.clone(),
                        status: Some(other),
                    });
                }
            }
        }

        waiting.unwrap_or(Readiness::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryTaskGraph;
    use serde_json::json;

    fn tool(id: &str) -> Task {
        Task::tool(id, "noop", json!({}))
    }

    fn with_status(id: &str, status: TaskStatus) -> Task {
        let mut task = tool(id);
        task.status = status;
        task
    }

    async fn checker_with(tasks: Vec<Task>) -> DependencyChecker {
        let graph = Arc::new(InMemoryTaskGraph::new());
        for task in tasks {
            graph.register(task).await;
        }
        DependencyChecker::new(graph)
    }

    #[tokio::test]
    async fn no_dependencies_is_ready() {
        let checker = checker_with(vec![]).await;
        assert!(checker.can_execute(&tool("t1")).await);
    }

    #[tokio::test]
    async fn unregistered_dependency_waits() {
        let checker = checker_with(vec![]).await;
        let task = tool("t2").with_dependencies(["t1"]);
        assert_eq!(
            checker.readiness(&task).await,
            Readiness::Waiting {
                dependency: "t1".into(),
                status: None
            }
        );
        assert!(!checker.can_execute(&task).await);
    }

    #[tokio::test]
    async fn all_completed_is_ready() {
        let checker = checker_with(vec![
            with_status("a", TaskStatus::Completed),
            with_status("b", TaskStatus::Completed),
        ])
        .await;
        assert!(checker.can_execute(&tool("c").with_dependencies(["a", "b"])).await);
    }

    #[tokio::test]
    async fn failed_dependency_blocks_even_after_a_waiting_one() {
        let mut failed = with_status("b", TaskStatus::Error);
        failed.error = Some("boom".to_string());
        let checker = checker_with(vec![with_status("a", TaskStatus::Running), failed]).await;

        let readiness = checker
            .readiness(&tool("c").with_dependencies(["a", "b"]))
            .await;
        assert_eq!(
            readiness,
            Readiness::Blocked {
                dependency: "b".into(),
                status: TaskStatus::Error,
                error: Some("boom".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn pending_dependency_waits() {
        let checker = checker_with(vec![with_status("a", TaskStatus::Pending)]).await;
        assert!(!checker.can_execute(&tool("b").with_dependencies(["a"])).await);
    }
}
