use std::collections::{HashMap, HashSet};
use crate::{Task, TaskId};

/// Returns the first dependency cycle found among `tasks`, as the path of ids
/// that closes on itself (`a -> b -> a`). Dependencies pointing outside the
/// set are ignored.
pub fn find_cycle(tasks: &[Task]) -> Option<Vec<TaskId>> {
    let edges: HashMap<&TaskId, &[TaskId]> = tasks
        .iter()
        .map(|task| (&task.id, task.dependencies.as_slice()))
        .collect();

    let mut visited = HashSet::new();
    let mut stack = Vec::new();

    fn dfs<'a>(
        id: &'a TaskId,
        edges: &HashMap<&'a TaskId, &'a [TaskId]>,
        visited: &mut HashSet<&'a TaskId>,
        stack: &mut Vec<&'a TaskId>,
    ) -> Option<Vec<TaskId>> {
        if let Some(pos) = stack.iter().position(|seen| *seen == id) {
            // back edge: the cycle is the tail of the stack plus `id`
            let mut cycle: Vec<TaskId> = stack[pos..].iter().map(|t| (*t).clone()).collect();
            cycle.push(id.clone());
            return Some(cycle);
        }
        if !visited.insert(id) {
            return None;
        }

        stack.push(id);
        if let Some(deps) = edges.get(id) {
            for dep in deps.iter() {
                if !edges.contains_key(dep) {
                    continue;
                }
                if let Some(cycle) = dfs(dep, edges, visited, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        None
    }

    for task in tasks {
        if let Some(cycle) = dfs(&task.id, &edges, &mut visited, &mut stack) {
            return Some(cycle);
        }
    }

    None
}

pub fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
