use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Task, TaskHandle, TaskId};

/// Storage for the tasks a processor knows about.
///
/// Handles returned here are shared: re-registering an id replaces the task
/// inside the existing handle rather than swapping the handle out.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Inserts `task`, or overwrites the registered task with the same id in place.
    async fn register(&self, task: Task) -> TaskHandle;

    async fn get(&self, id: &TaskId) -> Option<TaskHandle>;

    /// Registered ids in first-registration order.
    async fn ids(&self) -> Vec<TaskId>;

    /// Ids of registered tasks whose `dependencies` contain `id`.
    async fn dependents_of(&self, id: &TaskId) -> Vec<TaskId>;

    async fn snapshot(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        for id in self.ids().await {
            if let Some(handle) = self.get(&id).await {
                tasks.push(handle.read().await.clone());
            }
        }
        tasks
    }
}

#[derive(Default)]
struct GraphInner {
    nodes: HashMap<TaskId, TaskHandle>,
    insertion_order: Vec<TaskId>,
}

/// Process-local dependency graph.
#[derive(Default)]
pub struct InMemoryTaskGraph {
    inner: RwLock<GraphInner>,
}

impl InMemoryTaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.nodes.is_empty()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskGraph {
    async fn register(&self, task: Task) -> TaskHandle {
        let existing = {
            let mut inner = self.inner.write().await;
            match inner.nodes.get(&task.id).cloned() {
                Some(handle) => handle,
                None => {
                    let id = task.id.clone();
                    let handle = Arc::new(RwLock::new(task));
                    inner.insertion_order.push(id.clone());
                    inner.nodes.insert(id, Arc::clone(&handle));
                    return handle;
                }
            }
        };

        // graph lock is released before touching the task lock
        *existing.write().await = task;
        existing
    }

    async fn get(&self, id: &TaskId) -> Option<TaskHandle> {
        self.inner.read().await.nodes.get(id).cloned()
    }

    async fn ids(&self) -> Vec<TaskId> {
        self.inner.read().await.insertion_order.clone()
    }

    async fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        let handles: Vec<TaskHandle> = {
            let inner = self.inner.read().await;
            inner
                .insertion_order
                .iter()
                .filter_map(|key| inner.nodes.get(key).cloned())
                .collect()
        };

        let mut dependents = Vec::new();
        for handle in handles {
            let task = handle.read().await;
            if task.dependencies.contains(id) {
                dependents.push(task.id.clone());
            }
        }
        dependents
    }
}
