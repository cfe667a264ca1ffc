use std::collections::{HashMap, VecDeque};
use testcycle_executor::{TaskDescriptor, TaskStatus};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(String),

    #[error("Unknown task id: {0}")]
    UnknownTaskId(String),

    #[error("Task {0} would be inserted at the head with dependencies")]
    DependentHeadTask(String),

    #[error("Dependency cycle through task {0}")]
    DependencyCycle(String),
}

/// Ordered, mutable list of tasks with dependency edges.
///
/// Tasks are never removed, only marked completed or blocked. Synthesized
/// tasks enter at the head and must be dependency-free, so the graph stays
/// acyclic once the seed passes validation.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    tasks: VecDeque<TaskDescriptor>,
}

impl TaskQueue {
    /// Seed a queue with the planned tasks.
    ///
    /// Rejects duplicate ids and dependency cycles. A dependency on an id that
    /// is not in the queue is accepted but can never be satisfied; the
    /// controller reports it as a deadlock.
    pub fn new(tasks: Vec<TaskDescriptor>) -> Result<Self, QueueError> {
        let mut queue = Self {
            tasks: VecDeque::with_capacity(tasks.len()),
        };
        for task in tasks {
            if queue.contains(&task.id) {
                return Err(QueueError::DuplicateTaskId(task.id));
            }
            queue.tasks.push_back(task);
        }
        if let Some(id) = queue.find_cycle() {
            return Err(QueueError::DependencyCycle(id));
        }
        Ok(queue)
    }

    /// Prepend a task so it runs before everything already queued
    pub fn insert_at_head(&mut self, task: TaskDescriptor) -> Result<(), QueueError> {
        if self.contains(&task.id) {
            return Err(QueueError::DuplicateTaskId(task.id));
        }
        if !task.depends_on.is_empty() {
            return Err(QueueError::DependentHeadTask(task.id));
        }
        debug!(task_id = %task.id, kind = %task.kind, "Inserted task at queue head");
        self.tasks.push_front(task);
        Ok(())
    }

    /// First pending task whose dependencies are all completed.
    ///
    /// `None` means either done or deadlocked; [`has_pending`](Self::has_pending)
    /// tells them apart.
    pub fn next_runnable(&self) -> Option<&TaskDescriptor> {
        self.tasks
            .iter()
            .find(|task| task.status == TaskStatus::Pending && self.dependencies_met(task))
    }

    pub fn has_pending(&self) -> bool {
        self.tasks.iter().any(|t| t.status == TaskStatus::Pending)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.ids_with(TaskStatus::Pending)
    }

    pub fn get(&self, id: &str) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Tasks in queue order
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn mark_in_progress(&mut self, id: &str) -> Result<(), QueueError> {
        self.set_status(id, TaskStatus::InProgress)
    }

    pub fn mark_completed(&mut self, id: &str) -> Result<(), QueueError> {
        self.set_status(id, TaskStatus::Completed)
    }

    pub fn mark_blocked(&mut self, id: &str) -> Result<(), QueueError> {
        self.set_status(id, TaskStatus::Blocked)
    }

    /// Return a task to the runnable pool, e.g. a test run that must repeat
    /// after a fix
    pub fn mark_pending(&mut self, id: &str) -> Result<(), QueueError> {
        self.set_status(id, TaskStatus::Pending)
    }

    /// Put tasks abandoned mid-dispatch back to pending
    pub fn reset_in_progress(&mut self) {
        for task in self
            .tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::InProgress)
        {
            task.status = TaskStatus::Pending;
        }
    }

    pub fn is_acyclic(&self) -> bool {
        self.find_cycle().is_none()
    }

    fn set_status(&mut self, id: &str, status: TaskStatus) -> Result<(), QueueError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| QueueError::UnknownTaskId(id.to_string()))?;
        debug!(task_id = %id, from = ?task.status, to = ?status, "Task status change");
        task.status = status;
        Ok(())
    }

    fn dependencies_met(&self, task: &TaskDescriptor) -> bool {
        task.depends_on.iter().all(|dep| {
            self.get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    fn ids_with(&self, status: TaskStatus) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Id of a task on a dependency cycle, if any
    fn find_cycle(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let edges: HashMap<&str, &[String]> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.depends_on.as_slice()))
            .collect();
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for start in self.tasks.iter().map(|t| t.id.as_str()) {
            if marks.contains_key(start) {
                continue;
            }
            // Iterative DFS: (node, index of next dependency to visit)
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            marks.insert(start, Mark::Visiting);

            while let Some((node, next)) = stack.pop() {
                let deps = edges.get(node).copied().unwrap_or_default();
                let Some(dep) = deps.get(next) else {
                    marks.insert(node, Mark::Done);
                    continue;
                };
                stack.push((node, next + 1));

                let dep = dep.as_str();
                if !edges.contains_key(dep) {
                    continue;
                }
                match marks.get(dep) {
                    Some(Mark::Visiting) => return Some(dep.to_string()),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(dep, Mark::Visiting);
                        stack.push((dep, 0));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testcycle_executor::TaskKind;

    fn seeded() -> TaskQueue {
        TaskQueue::new(vec![
            TaskDescriptor::test_gen("gen"),
            TaskDescriptor::test_run("run").with_depends_on(["gen"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_next_runnable_respects_dependencies() {
        let mut queue = seeded();
        assert_eq!(queue.next_runnable().unwrap().id, "gen");

        queue.mark_in_progress("gen").unwrap();
        assert!(queue.next_runnable().is_none());
        assert!(queue.has_pending());

        queue.mark_completed("gen").unwrap();
        assert_eq!(queue.next_runnable().unwrap().id, "run");
    }

    #[test]
    fn test_insert_at_head_runs_first() {
        let mut queue = seeded();
        queue.mark_completed("gen").unwrap();
        queue.insert_at_head(TaskDescriptor::fix("fix-1")).unwrap();

        assert_eq!(queue.tasks().next().unwrap().id, "fix-1");
        assert_eq!(queue.next_runnable().unwrap().id, "fix-1");
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_insert_duplicate_id_fails() {
        let mut queue = seeded();
        let err = queue.insert_at_head(TaskDescriptor::fix("run")).unwrap_err();
        assert_eq!(err, QueueError::DuplicateTaskId("run".into()));
    }

    #[test]
    fn test_insert_with_dependencies_fails() {
        let mut queue = seeded();
        let task = TaskDescriptor::fix("fix-1").with_depends_on(["run"]);
        assert!(matches!(
            queue.insert_at_head(task),
            Err(QueueError::DependentHeadTask(_))
        ));
        assert!(!queue.contains("fix-1"));
    }

    #[test]
    fn test_mark_unknown_task_fails() {
        let mut queue = seeded();
        assert_eq!(
            queue.mark_completed("nope").unwrap_err(),
            QueueError::UnknownTaskId("nope".into())
        );
        assert!(queue.mark_blocked("nope").is_err());
    }

    #[test]
    fn test_new_rejects_duplicates_and_cycles() {
        let dup = TaskQueue::new(vec![
            TaskDescriptor::test_run("a"),
            TaskDescriptor::test_run("a"),
        ]);
        assert!(matches!(dup, Err(QueueError::DuplicateTaskId(_))));

        let cycle = TaskQueue::new(vec![
            TaskDescriptor::test_run("a").with_depends_on(["c"]),
            TaskDescriptor::test_run("b").with_depends_on(["a"]),
            TaskDescriptor::test_run("c").with_depends_on(["b"]),
        ]);
        assert!(matches!(cycle, Err(QueueError::DependencyCycle(_))));

        let self_loop = TaskQueue::new(vec![TaskDescriptor::test_run("a").with_depends_on(["a"])]);
        assert!(matches!(self_loop, Err(QueueError::DependencyCycle(_))));
    }

    #[test]
    fn test_dangling_dependency_is_never_runnable() {
        let queue =
            TaskQueue::new(vec![TaskDescriptor::test_run("run").with_depends_on(["missing"])])
                .unwrap();
        assert!(queue.next_runnable().is_none());
        assert_eq!(queue.pending_ids(), vec!["run".to_string()]);
    }

    #[test]
    fn test_stays_acyclic_under_head_insertion() {
        let mut queue = TaskQueue::new(vec![
            TaskDescriptor::test_gen("gen"),
            TaskDescriptor::test_run("run").with_depends_on(["gen"]),
            TaskDescriptor::new("report", TaskKind::TestRun).with_depends_on(["run", "gen"]),
        ])
        .unwrap();

        for i in 0..20 {
            queue
                .insert_at_head(TaskDescriptor::fix(format!("fix-{}", i)))
                .unwrap();
            assert!(queue.is_acyclic());
        }
        assert_eq!(queue.len(), 23);
        assert!(queue
            .tasks()
            .take(20)
            .all(|t| t.depends_on.is_empty()));
    }

    #[test]
    fn test_reset_in_progress() {
        let mut queue = seeded();
        queue.mark_in_progress("gen").unwrap();
        queue.reset_in_progress();
        assert_eq!(queue.get("gen").unwrap().status, TaskStatus::Pending);
    }
}
