//! Progress aggregation.
//!
//! A task's progress is the unweighted mean over its direct steps and child
//! tasks; a project's is the mean over its root tasks. Changes cascade
//! strictly upward with an explicit worklist, one row at a time, and a row
//! whose value did not move is neither written nor reported.

use chrono::Utc;
use rusqlite::params;
use std::collections::HashSet;

use super::{ChangeEvent, ChangeKind, EntityKind, Queries, StoreTx, MAX_TASK_DEPTH};
use crate::{Error, Result};

/// Tolerance when comparing stored and recomputed progress.
pub const EPSILON: f64 = 1e-9;

impl StoreTx<'_> {
    /// Mean progress of a task's direct children, 0 when it has none.
    pub fn task_progress(&self, task_id: &str) -> Result<f64> {
        let mean: Option<f64> = self.tx.query_row(
            "SELECT AVG(progress) FROM ( \
                 SELECT progress FROM steps WHERE task_id = ?1 \
                 UNION ALL \
                 SELECT progress FROM tasks WHERE parent_task_id = ?1 \
             )",
            [task_id],
            |row| row.get(0),
        )?;
        Ok(mean.unwrap_or(0.0))
    }

    /// Mean progress of a project's root tasks, 0 when it has none.
    pub fn project_progress(&self, project_id: &str) -> Result<f64> {
        let mean: Option<f64> = self.tx.query_row(
            "SELECT AVG(progress) FROM tasks WHERE project_id = ?1 AND parent_task_id IS NULL",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(mean.unwrap_or(0.0))
    }

    /// Recompute `task_id`, then each ancestor, then the project.
    pub fn cascade_from_task(&mut self, task_id: &str) -> Result<()> {
        let mut visited = HashSet::new();
        let mut current = Some(task_id.to_string());
        let mut project_id = None;

        while let Some(id) = current.take() {
            if !visited.insert(id.clone()) || visited.len() > MAX_TASK_DEPTH {
                return Err(Error::StructuralViolation(format!(
                    "task hierarchy above {} contains a cycle",
                    task_id
                )));
            }

            let task = self.get_task(&id)?;
            let progress = self.task_progress(&id)?;
            if (progress - task.progress).abs() > EPSILON {
                self.write_task_progress(&task.id, progress)?;
                self.emit(
                    ChangeEvent::new(EntityKind::Task, &task.id, ChangeKind::ProgressChanged)
                        .in_project(&task.project_id)
                        .with_detail(format!("{:.3}", progress)),
                );
            }

            project_id = Some(task.project_id);
            current = task.parent_task_id;
        }

        match project_id {
            Some(project_id) => self.refresh_project_progress(&project_id),
            None => Ok(()),
        }
    }

    /// Recompute after a task was added under, moved from or removed from
    /// `parent` (or the project's root level when `None`).
    pub(crate) fn cascade_after_task_change(
        &mut self,
        project_id: &str,
        parent: Option<&str>,
    ) -> Result<()> {
        match parent {
            Some(parent_id) => self.cascade_from_task(parent_id),
            None => self.refresh_project_progress(project_id),
        }
    }

    /// Recompute a project's progress from its root tasks.
    pub fn refresh_project_progress(&mut self, project_id: &str) -> Result<()> {
        let project = self.get_project(project_id)?;
        let progress = self.project_progress(project_id)?;
        if (progress - project.progress).abs() > EPSILON {
            self.tx.execute(
                "UPDATE projects SET progress = ?1, updated_at = ?2, version = version + 1 \
                 WHERE id = ?3",
                params![progress, Utc::now(), project_id],
            )?;
            self.emit(
                ChangeEvent::new(EntityKind::Project, project_id, ChangeKind::ProgressChanged)
                    .in_project(project_id)
                    .with_detail(format!("{:.3}", progress)),
            );
        }
        Ok(())
    }

    fn write_task_progress(&mut self, task_id: &str, progress: f64) -> Result<()> {
        self.tx.execute(
            "UPDATE tasks SET progress = ?1, updated_at = ?2, version = version + 1 WHERE id = ?3",
            params![progress, Utc::now(), task_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Project, Step, StepStatus, Task};
    use crate::storage::Storage;

    fn agree(storage: &mut Storage, step: &Step) {
        let mut step = storage.get_step(&step.id).unwrap();
        step.status = StepStatus::Agreed;
        step.final_content = Some("done".to_string());
        storage.transaction(|tx| tx.update_step(&mut step)).unwrap();
    }

    fn setup() -> (Storage, Project, Task) {
        let mut storage = Storage::open_in_memory().unwrap();
        let (project, task) = storage
            .transaction(|tx| {
                let project =
                    tx.insert_project(Project::new("P".to_string(), "Progress demo".to_string()))?;
                let task = tx.insert_task(Task::new(
                    project.id.clone(),
                    "Root".to_string(),
                    "Do it".to_string(),
                ))?;
                Ok((project, task))
            })
            .unwrap();
        (storage, project, task)
    }

    #[test]
    fn test_task_without_children_is_zero() {
        let (storage, project, task) = setup();
        assert_eq!(storage.get_task(&task.id).unwrap().progress, 0.0);
        assert_eq!(storage.get_project(&project.id).unwrap().progress, 0.0);
    }

    #[test]
    fn test_half_done_task() {
        let (mut storage, project, task) = setup();
        let a = storage
            .transaction(|tx| tx.insert_step(Step::new(task.id.clone(), "A".to_string())))
            .unwrap();
        storage
            .transaction(|tx| tx.insert_step(Step::new(task.id.clone(), "B".to_string())))
            .unwrap();
        agree(&mut storage, &a);

        assert_eq!(storage.get_task(&task.id).unwrap().progress, 0.5);
        assert_eq!(storage.get_project(&project.id).unwrap().progress, 0.5);
    }

    #[test]
    fn test_nested_cascade_reaches_project() {
        let (mut storage, project, root) = setup();
        let child = storage
            .transaction(|tx| {
                let mut child =
                    Task::new(project.id.clone(), "Child".to_string(), "Nested".to_string());
                child.parent_task_id = Some(root.id.clone());
                tx.insert_task(child)
            })
            .unwrap();
        let step = storage
            .transaction(|tx| tx.insert_step(Step::new(child.id.clone(), "Leaf".to_string())))
            .unwrap();
        storage
            .transaction(|tx| tx.insert_step(Step::new(root.id.clone(), "Sibling".to_string())))
            .unwrap();

        agree(&mut storage, &step);

        assert_eq!(storage.get_task(&child.id).unwrap().progress, 1.0);
        // Root: mean(sibling 0.0, child 1.0)
        assert_eq!(storage.get_task(&root.id).unwrap().progress, 0.5);
        assert_eq!(storage.get_project(&project.id).unwrap().progress, 0.5);
    }

    #[test]
    fn test_adding_a_step_dilutes_progress() {
        let (mut storage, _, task) = setup();
        let a = storage
            .transaction(|tx| tx.insert_step(Step::new(task.id.clone(), "A".to_string())))
            .unwrap();
        agree(&mut storage, &a);
        assert_eq!(storage.get_task(&task.id).unwrap().progress, 1.0);

        storage
            .transaction(|tx| tx.insert_step(Step::new(task.id.clone(), "B".to_string())))
            .unwrap();
        assert_eq!(storage.get_task(&task.id).unwrap().progress, 0.5);
    }

    #[test]
    fn test_recompute_without_change_emits_nothing() {
        let (mut storage, _, task) = setup();
        let events = storage
            .transaction(|tx| {
                tx.cascade_from_task(&task.id)?;
                Ok(tx.events.len())
            })
            .unwrap();
        assert_eq!(events, 0);
    }
}
