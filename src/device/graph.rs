//! Per-row task graph for a device.
//!
//! ```text
//! UploadCorpus ──┬──────────────► Launch(0) ──► ReadBack(0)
//! UploadRow(0) ──┘               ...
//! UploadRow(n) ─────────────────► Launch(n) ──► ReadBack(n)   (also waits on UploadCorpus)
//! ```
//!
//! A launch waits on the corpus upload and its own row upload only, so row `n`
//! can compute while row `n + 1` is still being transferred.

use crate::error::{MosaicError, Result};

/// Device queue a task is submitted to. Each lane executes in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    TransferIn,
    Compute,
    TransferOut,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::TransferIn, Lane::Compute, Lane::TransferOut];

    pub fn index(self) -> usize {
        match self {
            Lane::TransferIn => 0,
            Lane::Compute => 1,
            Lane::TransferOut => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    UploadCorpus,
    UploadRow(usize),
    Launch(usize),
    ReadBack(usize),
}

impl TaskKind {
    pub fn lane(&self) -> Lane {
        match self {
            TaskKind::UploadCorpus | TaskKind::UploadRow(_) => Lane::TransferIn,
            TaskKind::Launch(_) => Lane::Compute,
            TaskKind::ReadBack(_) => Lane::TransferOut,
        }
    }
}

pub type TaskId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub deps: Vec<TaskId>,
}

/// Tasks in submission order; a task's id is its position.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    rows: usize,
    tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn for_rows(rows: usize) -> Self {
        let corpus = 0;
        let upload = |row: usize| 1 + row;
        let launch = |row: usize| 1 + rows + row;

        let mut tasks = Vec::with_capacity(1 + 3 * rows);
        tasks.push(Task {
            id: corpus,
            kind: TaskKind::UploadCorpus,
            deps: Vec::new(),
        });
        tasks.extend((0..rows).map(|row| Task {
            id: upload(row),
            kind: TaskKind::UploadRow(row),
            deps: Vec::new(),
        }));
        tasks.extend((0..rows).map(|row| Task {
            id: launch(row),
            kind: TaskKind::Launch(row),
            deps: vec![corpus, upload(row)],
        }));
        tasks.extend((0..rows).map(|row| Task {
            id: 1 + 2 * rows + row,
            kind: TaskKind::ReadBack(row),
            deps: vec![launch(row)],
        }));
        Self { rows, tasks }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn find(&self, kind: TaskKind) -> Option<TaskId> {
        self.tasks.iter().position(|task| task.kind == kind)
    }

    pub fn on_lane(&self, lane: Lane) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |task| task.kind.lane() == lane)
    }

    /// Every dependency must be submitted before its dependant (which also rules out
    /// cycles), and every id must match its position.
    pub fn validate(&self) -> Result<()> {
        for (position, task) in self.tasks.iter().enumerate() {
            if task.id != position {
                return Err(MosaicError::TaskGraph(format!(
                    "task {:?} has id {} at position {}",
                    task.kind, task.id, position
                )));
            }
            if let Some(&dep) = task.deps.iter().find(|&&dep| dep >= task.id) {
                return Err(MosaicError::TaskGraph(format!(
                    "task {} ({:?}) depends on later task {}",
                    task.id, task.kind, dep
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_shape_for_rows() {
        let graph = TaskGraph::for_rows(4);
        assert_eq!(graph.len(), 13);
        graph.validate().unwrap();
        assert_eq!(graph.on_lane(Lane::TransferIn).count(), 5);
        assert_eq!(graph.on_lane(Lane::Compute).count(), 4);
        assert_eq!(graph.on_lane(Lane::TransferOut).count(), 4);
    }

    #[test]
    fn launches_wait_on_corpus_and_own_row_only() {
        let graph = TaskGraph::for_rows(3);
        let corpus = graph.find(TaskKind::UploadCorpus).unwrap();
        for row in 0..3 {
            let launch = graph.task(graph.find(TaskKind::Launch(row)).unwrap()).unwrap();
            let upload = graph.find(TaskKind::UploadRow(row)).unwrap();
            assert_eq!(launch.deps, vec![corpus, upload]);

            let read = graph.task(graph.find(TaskKind::ReadBack(row)).unwrap()).unwrap();
            assert_eq!(read.deps, vec![launch.id]);
        }
    }

    #[test]
    fn uploads_have_no_dependencies() {
        let graph = TaskGraph::for_rows(2);
        assert!(graph.on_lane(Lane::TransferIn).all(|task| task.deps.is_empty()));
    }

    #[test]
    fn empty_image_only_uploads_the_corpus() {
        let graph = TaskGraph::for_rows(0);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.tasks()[0].kind, TaskKind::UploadCorpus);
    }

    #[test]
    fn forward_dependencies_are_rejected() {
        let mut graph = TaskGraph::for_rows(1);
        graph.tasks[1].deps.push(3);
        assert!(matches!(graph.validate(), Err(MosaicError::TaskGraph(_))));
    }
}
