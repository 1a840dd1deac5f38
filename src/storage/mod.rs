//! Storage layer for Duet data.
//!
//! Everything lives in a single SQLite database (`duet.db`) inside the data
//! directory. The data directory is `DUET_DATA_DIR` when set, otherwise
//! `~/.local/share/duet/<workspace-hash>/`.
//!
//! Reads go through the [`Queries`] trait, implemented both by [`Storage`]
//! and by the transaction handle [`StoreTx`]. Every mutation runs inside
//! [`Storage::transaction`]: rows carry a `version` column that updates
//! compare-and-swap on, and the change events a transaction buffers are only
//! delivered to [`EventSink`]s once it has committed. Concurrent callers
//! borrow connections from a [`StoragePool`].

pub mod chain;
pub mod events;
pub mod pool;
pub mod progress;
mod sql;

pub use events::{ChangeEvent, ChangeKind, EntityKind, EventSink};
pub use pool::{PooledStorage, StoragePool};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::models::complexity::ComplexityAssessment;
use crate::models::{
    Agent, Dispute, DisputeStatus, IterationRecord, NodeKind, NodeRef, Project, Step, StepStatus,
    Task, WorkItem, non_empty,
};
use crate::{Error, Result};
use sql::{
    ASSESSMENT_COLUMNS, DISPUTE_COLUMNS, ITERATION_COLUMNS, PROJECT_COLUMNS, STEP_COLUMNS,
    TASK_COLUMNS,
};

/// Database file name inside the data directory.
pub const DB_FILE: &str = "duet.db";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "DUET_DATA_DIR";

/// Deepest allowed task nesting.
pub const MAX_TASK_DEPTH: usize = 64;

/// Storage manager for one data directory.
pub struct Storage {
    /// Data directory, `None` for in-memory stores
    root: Option<PathBuf>,
    conn: Connection,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Storage {
    /// Open (or create) the database inside `dir`.
    pub fn open_in_dir(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(DB_FILE))?;
        // Readers keep going while another connection writes.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::from_connection(conn, Some(dir.to_path_buf()))
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    /// Check if a database exists inside `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join(DB_FILE).exists()
    }

    fn from_connection(conn: Connection, root: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init_schema(&conn)?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            root,
            conn,
            sinks: Vec::new(),
        })
    }

    /// Initialize the SQLite schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                complexity_threshold REAL NOT NULL,
                max_iterations INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                parent_task_id TEXT,
                title TEXT NOT NULL,
                objective TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                prev_ref TEXT,
                next_ref TEXT,
                position INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
                FOREIGN KEY (parent_task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                title TEXT NOT NULL,
                prev_ref TEXT,
                next_ref TEXT,
                position INTEGER NOT NULL DEFAULT 0,
                progress REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                iteration_count INTEGER NOT NULL DEFAULT 0,
                producer_content TEXT,
                producer_reasoning TEXT,
                reviewer_content TEXT,
                reviewer_feedback TEXT,
                final_content TEXT,
                producer_complexity TEXT,
                reviewer_complexity TEXT,
                reconciled_complexity TEXT,
                complexity_score REAL,
                should_promote INTEGER,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS step_iterations (
                step_id TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                producer_content TEXT,
                producer_reasoning TEXT,
                reviewer_content TEXT,
                reviewer_feedback TEXT,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (step_id, iteration),
                FOREIGN KEY (step_id) REFERENCES steps(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS complexity_assessments (
                step_id TEXT NOT NULL,
                agent TEXT NOT NULL,
                level TEXT NOT NULL,
                score REAL NOT NULL,
                should_promote INTEGER NOT NULL,
                confidence REAL NOT NULL,
                reasons TEXT NOT NULL DEFAULT '[]',
                assessed_at TEXT NOT NULL,
                PRIMARY KEY (step_id, agent),
                FOREIGN KEY (step_id) REFERENCES steps(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS disputes (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                producer_content TEXT,
                producer_reasoning TEXT,
                reviewer_content TEXT,
                reviewer_reasoning TEXT,
                history TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'pending',
                resolution_kind TEXT,
                resolved_content TEXT,
                resolved_at TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
                FOREIGN KEY (step_id) REFERENCES steps(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id, parent_task_id, position);
            CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id);
            CREATE INDEX IF NOT EXISTS idx_steps_task ON steps(task_id, position);
            CREATE INDEX IF NOT EXISTS idx_disputes_project ON disputes(project_id, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_disputes_one_pending
                ON disputes(step_id) WHERE status = 'pending';
            "#,
        )?;
        Ok(())
    }

    /// Run database migrations for schema changes.
    fn run_migrations(conn: &Connection) -> Result<()> {
        // focus_hint arrived after the first schema; ALTER TABLE has no IF NOT EXISTS.
        let has_focus_hint: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('steps') WHERE name = 'focus_hint'",
            [],
            |row| row.get(0),
        )?;

        if !has_focus_hint {
            conn.execute("ALTER TABLE steps ADD COLUMN focus_hint TEXT", [])?;
        }

        Ok(())
    }

    /// Data directory backing this store.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Register a consumer for committed change events.
    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Run `f` inside one SQLite transaction.
    ///
    /// If `f` fails nothing it did is kept. Buffered events reach the sinks
    /// only after a successful commit.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreTx<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut store = StoreTx {
            tx,
            events: Vec::new(),
        };

        let value = f(&mut store)?;

        let StoreTx { tx, events } = store;
        tx.commit()?;

        for event in &events {
            debug!(
                entity = %event.entity,
                id = %event.id,
                change = ?event.change,
                detail = event.detail.as_deref().unwrap_or(""),
                "change committed"
            );
            for sink in &self.sinks {
                sink.on_change(event);
            }
        }

        Ok(value)
    }
}

impl Queries for Storage {
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Point lookups and ordered traversals shared by [`Storage`] and [`StoreTx`].
pub trait Queries {
    fn conn(&self) -> &Connection;

    fn get_project(&self, id: &str) -> Result<Project> {
        query_one(
            self.conn(),
            &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
            [id],
            sql::project_from_row,
        )?
        .ok_or_else(|| Error::NotFound(format!("Project not found: {}", id)))
    }

    fn list_projects(&self) -> Result<Vec<Project>> {
        query_all(
            self.conn(),
            &format!("SELECT {} FROM projects ORDER BY created_at, id", PROJECT_COLUMNS),
            [],
            sql::project_from_row,
        )
    }

    fn get_task(&self, id: &str) -> Result<Task> {
        query_one(
            self.conn(),
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            [id],
            sql::task_from_row,
        )?
        .ok_or_else(|| Error::NotFound(format!("Task not found: {}", id)))
    }

    /// Root tasks of a project in position order.
    fn list_root_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        query_all(
            self.conn(),
            &format!(
                "SELECT {} FROM tasks WHERE project_id = ?1 AND parent_task_id IS NULL \
                 ORDER BY position, created_at",
                TASK_COLUMNS
            ),
            [project_id],
            sql::task_from_row,
        )
    }

    /// Direct child tasks in position order.
    fn list_child_tasks(&self, task_id: &str) -> Result<Vec<Task>> {
        query_all(
            self.conn(),
            &format!(
                "SELECT {} FROM tasks WHERE parent_task_id = ?1 ORDER BY position, created_at",
                TASK_COLUMNS
            ),
            [task_id],
            sql::task_from_row,
        )
    }

    /// Every task of a project, unordered across levels.
    fn list_project_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        query_all(
            self.conn(),
            &format!(
                "SELECT {} FROM tasks WHERE project_id = ?1 ORDER BY created_at, id",
                TASK_COLUMNS
            ),
            [project_id],
            sql::task_from_row,
        )
    }

    fn get_step(&self, id: &str) -> Result<Step> {
        query_one(
            self.conn(),
            &format!("SELECT {} FROM steps WHERE id = ?1", STEP_COLUMNS),
            [id],
            sql::step_from_row,
        )?
        .ok_or_else(|| Error::NotFound(format!("Step not found: {}", id)))
    }

    /// Steps of a task in position order.
    fn list_steps(&self, task_id: &str) -> Result<Vec<Step>> {
        query_all(
            self.conn(),
            &format!(
                "SELECT {} FROM steps WHERE task_id = ?1 ORDER BY position, created_at",
                STEP_COLUMNS
            ),
            [task_id],
            sql::step_from_row,
        )
    }

    /// Every step of a project.
    fn list_project_steps(&self, project_id: &str) -> Result<Vec<Step>> {
        query_all(
            self.conn(),
            &format!(
                "SELECT {} FROM steps WHERE task_id IN (SELECT id FROM tasks WHERE project_id = ?1) \
                 ORDER BY created_at, id",
                STEP_COLUMNS
            ),
            [project_id],
            sql::step_from_row,
        )
    }

    /// Project owning a task or step.
    fn project_of(&self, node: &NodeRef) -> Result<String> {
        let found: Option<String> = match node {
            NodeRef::Task(id) => self
                .conn()
                .query_row("SELECT project_id FROM tasks WHERE id = ?1", [id], |row| row.get(0))
                .optional()?,
            NodeRef::Step(id) => self
                .conn()
                .query_row(
                    "SELECT t.project_id FROM steps s JOIN tasks t ON s.task_id = t.id \
                     WHERE s.id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .optional()?,
        };
        found.ok_or_else(|| not_found(node))
    }

    /// Load whatever a reference points at.
    fn get_item(&self, node: &NodeRef) -> Result<WorkItem> {
        match node {
            NodeRef::Task(id) => self.get_task(id).map(WorkItem::Task),
            NodeRef::Step(id) => self.get_step(id).map(WorkItem::Step),
        }
    }

    fn item_exists(&self, node: &NodeRef) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", table_for(node.kind())),
            [node.id()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Revision rounds of a step, oldest first.
    fn list_iterations(&self, step_id: &str) -> Result<Vec<IterationRecord>> {
        query_all(
            self.conn(),
            &format!(
                "SELECT {} FROM step_iterations WHERE step_id = ?1 ORDER BY iteration",
                ITERATION_COLUMNS
            ),
            [step_id],
            sql::iteration_from_row,
        )
    }

    /// Stored per-agent complexity opinions for a step.
    fn list_assessments(&self, step_id: &str) -> Result<Vec<ComplexityAssessment>> {
        query_all(
            self.conn(),
            &format!(
                "SELECT {} FROM complexity_assessments WHERE step_id = ?1 ORDER BY agent",
                ASSESSMENT_COLUMNS
            ),
            [step_id],
            sql::assessment_from_row,
        )
    }

    fn get_assessment(&self, step_id: &str, agent: Agent) -> Result<Option<ComplexityAssessment>> {
        query_one(
            self.conn(),
            &format!(
                "SELECT {} FROM complexity_assessments WHERE step_id = ?1 AND agent = ?2",
                ASSESSMENT_COLUMNS
            ),
            params![step_id, agent],
            sql::assessment_from_row,
        )
    }

    fn get_dispute(&self, id: &str) -> Result<Dispute> {
        query_one(
            self.conn(),
            &format!("SELECT {} FROM disputes WHERE id = ?1", DISPUTE_COLUMNS),
            [id],
            sql::dispute_from_row,
        )?
        .ok_or_else(|| Error::NotFound(format!("Dispute not found: {}", id)))
    }

    fn pending_dispute_for_step(&self, step_id: &str) -> Result<Option<Dispute>> {
        query_one(
            self.conn(),
            &format!(
                "SELECT {} FROM disputes WHERE step_id = ?1 AND status = 'pending'",
                DISPUTE_COLUMNS
            ),
            [step_id],
            sql::dispute_from_row,
        )
    }

    /// Disputes, oldest first, optionally filtered by project and status.
    fn list_disputes(
        &self,
        project_id: Option<&str>,
        status: Option<DisputeStatus>,
    ) -> Result<Vec<Dispute>> {
        query_all(
            self.conn(),
            &format!(
                "SELECT {} FROM disputes \
                 WHERE (?1 IS NULL OR project_id = ?1) AND (?2 IS NULL OR status = ?2) \
                 ORDER BY created_at, id",
                DISPUTE_COLUMNS
            ),
            params![project_id, status],
            sql::dispute_from_row,
        )
    }
}

/// An open transaction. Obtained from [`Storage::transaction`].
pub struct StoreTx<'conn> {
    tx: Transaction<'conn>,
    events: Vec<ChangeEvent>,
}

impl Queries for StoreTx<'_> {
    fn conn(&self) -> &Connection {
        &self.tx
    }
}

impl StoreTx<'_> {
    /// Buffer an event for delivery after commit.
    pub fn emit(&mut self, event: ChangeEvent) {
        self.events.push(event);
    }

    // === Projects ===

    pub fn insert_project(&mut self, mut project: Project) -> Result<Project> {
        project.validate()?;
        project.version = 1;
        project.progress = 0.0;
        self.tx.execute(
            &format!(
                "INSERT INTO projects ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                PROJECT_COLUMNS
            ),
            params![
                project.id,
                project.name,
                project.description,
                project.progress,
                project.complexity_threshold,
                project.max_iterations,
                project.version,
                project.created_at,
                project.updated_at,
            ],
        )?;
        self.emit(
            ChangeEvent::new(EntityKind::Project, &project.id, ChangeKind::Created)
                .in_project(&project.id)
                .with_detail(project.name.clone()),
        );
        Ok(project)
    }

    /// Compare-and-swap update of a project's editable fields.
    pub fn update_project(&mut self, project: &mut Project) -> Result<()> {
        project.validate()?;
        project.updated_at = Utc::now();
        let changed = self.tx.execute(
            "UPDATE projects SET name = ?1, description = ?2, complexity_threshold = ?3, \
             max_iterations = ?4, updated_at = ?5, version = version + 1 \
             WHERE id = ?6 AND version = ?7",
            params![
                project.name,
                project.description,
                project.complexity_threshold,
                project.max_iterations,
                project.updated_at,
                project.id,
                project.version,
            ],
        )?;
        self.check_swapped(changed, &NodeOrProject::Project(&project.id))?;
        project.version += 1;
        self.emit(
            ChangeEvent::new(EntityKind::Project, &project.id, ChangeKind::Updated)
                .in_project(&project.id),
        );
        Ok(())
    }

    /// Delete a project with everything it owns.
    pub fn delete_project(&mut self, id: &str) -> Result<()> {
        let changed = self.tx.execute("DELETE FROM projects WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Project not found: {}", id)));
        }
        self.emit(ChangeEvent::new(EntityKind::Project, id, ChangeKind::Deleted).in_project(id));
        Ok(())
    }

    // === Tasks ===

    /// Insert a task, appending it after its siblings and threading it into
    /// the chain between `task.prev_ref` and `task.next_ref`.
    pub fn insert_task(&mut self, mut task: Task) -> Result<Task> {
        validate_text("Task title", &task.title)?;
        validate_text("Task objective", &task.objective)?;
        self.get_project(&task.project_id)?;
        if let Some(parent_id) = task.parent_task_id.clone() {
            self.check_parent(&task.id, &task.project_id, &parent_id)?;
        }

        let prev = task.prev_ref.take();
        let next = task.next_ref.take();
        task.position = self.next_task_position(&task.project_id, task.parent_task_id.as_deref())?;
        task.version = 1;
        task.progress = 0.0;

        self.tx.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.project_id,
                task.parent_task_id,
                task.title,
                task.objective,
                task.progress,
                Option::<NodeRef>::None,
                Option::<NodeRef>::None,
                task.position,
                task.version,
                task.created_at,
                task.updated_at,
            ],
        )?;
        self.emit(
            ChangeEvent::new(EntityKind::Task, &task.id, ChangeKind::Created)
                .in_project(&task.project_id)
                .with_detail(task.title.clone()),
        );

        if prev.is_some() || next.is_some() {
            self.thread(&task.node_ref(), prev, next)?;
        }
        self.cascade_after_task_change(&task.project_id, task.parent_task_id.as_deref())?;
        self.get_task(&task.id)
    }

    /// Compare-and-swap update of a task's title and objective.
    pub fn update_task(&mut self, task: &mut Task) -> Result<()> {
        validate_text("Task title", &task.title)?;
        validate_text("Task objective", &task.objective)?;
        task.updated_at = Utc::now();
        let changed = self.tx.execute(
            "UPDATE tasks SET title = ?1, objective = ?2, updated_at = ?3, version = version + 1 \
             WHERE id = ?4 AND version = ?5",
            params![task.title, task.objective, task.updated_at, task.id, task.version],
        )?;
        self.check_swapped(changed, &NodeOrProject::Node(&task.node_ref()))?;
        task.version += 1;
        self.emit(
            ChangeEvent::new(EntityKind::Task, &task.id, ChangeKind::Updated)
                .in_project(&task.project_id),
        );
        Ok(())
    }

    /// Re-parent a task (`None` makes it a root task).
    pub fn move_task(&mut self, task_id: &str, new_parent: Option<&str>) -> Result<Task> {
        let task = self.get_task(task_id)?;
        if task.parent_task_id.as_deref() == new_parent {
            return Ok(task);
        }
        if let Some(parent_id) = new_parent {
            self.check_parent(&task.id, &task.project_id, parent_id)?;
            let height = self.subtree_height(&task.id)?;
            let parent_depth = self.depth_of(parent_id)?;
            if parent_depth + height > MAX_TASK_DEPTH {
                return Err(Error::StructuralViolation(format!(
                    "moving task {} under {} would nest tasks deeper than {} levels",
                    task.id, parent_id, MAX_TASK_DEPTH
                )));
            }
        }

        // The old sibling chain closes over the gap; the task arrives unlinked.
        self.unthread(&task.node_ref())?;
        let position = self.next_task_position(&task.project_id, new_parent)?;
        let now = Utc::now();
        self.tx.execute(
            "UPDATE tasks SET parent_task_id = ?1, position = ?2, updated_at = ?3, \
             version = version + 1 WHERE id = ?4",
            params![new_parent, position, now, task.id],
        )?;
        self.emit(
            ChangeEvent::new(EntityKind::Task, &task.id, ChangeKind::Updated)
                .in_project(&task.project_id)
                .with_detail(format!("parent: {}", new_parent.unwrap_or("none"))),
        );

        self.cascade_after_task_change(&task.project_id, task.parent_task_id.as_deref())?;
        self.cascade_after_task_change(&task.project_id, new_parent)?;
        self.get_task(&task.id)
    }

    /// Delete a task and its whole subtree, splicing it out of the chain.
    pub fn delete_task(&mut self, task_id: &str) -> Result<()> {
        let task = self.get_task(task_id)?;

        let (subtree_tasks, subtree_steps) = self.collect_subtree(&task.id)?;
        let doomed: HashSet<NodeRef> = subtree_tasks
            .iter()
            .map(|id| NodeRef::task(id.clone()))
            .chain(subtree_steps.iter().map(|id| NodeRef::step(id.clone())))
            .collect();

        self.unthread(&task.node_ref())?;
        for node in &doomed {
            if *node != task.node_ref() {
                self.clear_references_to(node)?;
            }
        }

        self.tx.execute("DELETE FROM tasks WHERE id = ?1", [&task.id])?;
        for node in &doomed {
            let entity = match node.kind() {
                NodeKind::Task => EntityKind::Task,
                NodeKind::Step => EntityKind::Step,
            };
            self.emit(
                ChangeEvent::new(entity, node.id(), ChangeKind::Deleted).in_project(&task.project_id),
            );
        }

        self.cascade_after_task_change(&task.project_id, task.parent_task_id.as_deref())
    }

    fn next_task_position(&self, project_id: &str, parent: Option<&str>) -> Result<i64> {
        let max: Option<i64> = self.tx.query_row(
            "SELECT MAX(position) FROM tasks WHERE project_id = ?1 AND parent_task_id IS ?2",
            params![project_id, parent],
            |row| row.get(0),
        )?;
        Ok(max.map_or(0, |p| p + 1))
    }

    /// Validate that `parent_id` may become the parent of `task_id`.
    fn check_parent(&self, task_id: &str, project_id: &str, parent_id: &str) -> Result<()> {
        if parent_id == task_id {
            return Err(Error::StructuralViolation(format!(
                "task {} cannot be its own parent",
                task_id
            )));
        }
        let parent = self.get_task(parent_id)?;
        if parent.project_id != project_id {
            return Err(Error::StructuralViolation(format!(
                "parent task {} belongs to another project",
                parent_id
            )));
        }

        let mut visited = HashSet::from([parent.id.clone()]);
        let mut current = parent.parent_task_id;
        while let Some(id) = current {
            if id == task_id || !visited.insert(id.clone()) {
                return Err(Error::StructuralViolation(format!(
                    "making {} the parent of {} would create a cycle",
                    parent_id, task_id
                )));
            }
            if visited.len() >= MAX_TASK_DEPTH {
                return Err(Error::StructuralViolation(format!(
                    "task nesting deeper than {} levels",
                    MAX_TASK_DEPTH
                )));
            }
            current = self.get_task(&id)?.parent_task_id;
        }
        Ok(())
    }

    /// Number of tasks on the path from a root task down to `task_id`.
    fn depth_of(&self, task_id: &str) -> Result<usize> {
        let mut depth = 0;
        let mut current = Some(task_id.to_string());
        while let Some(id) = current {
            depth += 1;
            if depth > MAX_TASK_DEPTH {
                return Err(Error::StructuralViolation(format!(
                    "task {} sits deeper than {} levels",
                    task_id, MAX_TASK_DEPTH
                )));
            }
            current = self.get_task(&id)?.parent_task_id;
        }
        Ok(depth)
    }

    /// Levels in the subtree rooted at `task_id`, counting the task itself.
    fn subtree_height(&self, task_id: &str) -> Result<usize> {
        let mut height = 0;
        let mut level = vec![task_id.to_string()];
        let mut seen = HashSet::new();
        while !level.is_empty() {
            height += 1;
            let mut next_level = Vec::new();
            for id in level {
                if !seen.insert(id.clone()) {
                    return Err(Error::StructuralViolation(format!(
                        "task hierarchy below {} contains a cycle",
                        task_id
                    )));
                }
                next_level.extend(self.list_child_tasks(&id)?.into_iter().map(|t| t.id));
            }
            level = next_level;
        }
        Ok(height)
    }

    /// All task and step IDs in the subtree rooted at `task_id`.
    fn collect_subtree(&self, task_id: &str) -> Result<(Vec<String>, Vec<String>)> {
        let mut tasks = Vec::new();
        let mut steps = Vec::new();
        let mut stack = vec![task_id.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            steps.extend(self.list_steps(&id)?.into_iter().map(|s| s.id));
            stack.extend(self.list_child_tasks(&id)?.into_iter().map(|t| t.id));
            tasks.push(id);
        }
        Ok((tasks, steps))
    }

    // === Steps ===

    /// Insert a step under its task.
    ///
    /// With explicit links the step is threaded between them. Without any,
    /// it is appended after the task's last step in the chain.
    pub fn insert_step(&mut self, mut step: Step) -> Result<Step> {
        validate_text("Step title", &step.title)?;
        let task = self.get_task(&step.task_id)?;

        let mut prev = step.prev_ref.take();
        let next = step.next_ref.take();
        if prev.is_none() && next.is_none() {
            prev = self.list_steps(&task.id)?.last().map(Step::node_ref);
        }

        step.position = {
            let max: Option<i64> = self.tx.query_row(
                "SELECT MAX(position) FROM steps WHERE task_id = ?1",
                [&task.id],
                |row| row.get(0),
            )?;
            max.map_or(0, |p| p + 1)
        };
        step.version = 1;
        step.progress = step.derived_progress();

        self.tx.execute(
            &format!(
                "INSERT INTO steps ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
                 ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                STEP_COLUMNS
            ),
            params![
                step.id,
                step.task_id,
                step.title,
                Option::<NodeRef>::None,
                Option::<NodeRef>::None,
                step.position,
                step.progress,
                step.status,
                step.iteration_count,
                step.producer_content,
                step.producer_reasoning,
                step.focus_hint,
                step.reviewer_content,
                step.reviewer_feedback,
                step.final_content,
                step.producer_complexity,
                step.reviewer_complexity,
                step.reconciled_complexity,
                step.complexity_score,
                step.should_promote,
                step.version,
                step.created_at,
                step.updated_at,
            ],
        )?;
        self.emit(
            ChangeEvent::new(EntityKind::Step, &step.id, ChangeKind::Created)
                .in_project(&task.project_id)
                .with_detail(step.title.clone()),
        );

        if prev.is_some() || next.is_some() {
            self.thread(&step.node_ref(), prev, next)?;
        }
        self.cascade_from_task(&task.id)?;
        self.get_step(&step.id)
    }

    /// Compare-and-swap update of every mutable step field except links.
    ///
    /// Progress is re-derived from status and final content, and a change
    /// cascades up the hierarchy.
    pub fn update_step(&mut self, step: &mut Step) -> Result<()> {
        if step.status == StepStatus::Agreed && non_empty(step.final_content.as_deref()).is_none() {
            return Err(Error::InvalidTransition(format!(
                "step {} cannot be agreed without final content",
                step.id
            )));
        }
        let previous_progress: Option<f64> = self
            .tx
            .query_row("SELECT progress FROM steps WHERE id = ?1", [&step.id], |row| row.get(0))
            .optional()?;

        step.progress = step.derived_progress();
        step.updated_at = Utc::now();
        let changed = self.tx.execute(
            "UPDATE steps SET title = ?1, progress = ?2, status = ?3, iteration_count = ?4, \
             producer_content = ?5, producer_reasoning = ?6, focus_hint = ?7, \
             reviewer_content = ?8, reviewer_feedback = ?9, final_content = ?10, \
             producer_complexity = ?11, reviewer_complexity = ?12, reconciled_complexity = ?13, \
             complexity_score = ?14, should_promote = ?15, updated_at = ?16, \
             version = version + 1 WHERE id = ?17 AND version = ?18",
            params![
                step.title,
                step.progress,
                step.status,
                step.iteration_count,
                step.producer_content,
                step.producer_reasoning,
                step.focus_hint,
                step.reviewer_content,
                step.reviewer_feedback,
                step.final_content,
                step.producer_complexity,
                step.reviewer_complexity,
                step.reconciled_complexity,
                step.complexity_score,
                step.should_promote,
                step.updated_at,
                step.id,
                step.version,
            ],
        )?;
        self.check_swapped(changed, &NodeOrProject::Node(&step.node_ref()))?;
        step.version += 1;

        let project_id = self.project_of(&step.node_ref())?;
        self.emit(
            ChangeEvent::new(EntityKind::Step, &step.id, ChangeKind::Updated)
                .in_project(project_id)
                .with_detail(step.status.to_string()),
        );

        if previous_progress.is_some_and(|p| (p - step.progress).abs() > progress::EPSILON) {
            self.cascade_from_task(&step.task_id)?;
        }
        Ok(())
    }

    /// Delete a step, splicing it out of the chain.
    pub fn delete_step(&mut self, step_id: &str) -> Result<()> {
        let step = self.get_step(step_id)?;
        let project_id = self.project_of(&step.node_ref())?;
        self.unthread(&step.node_ref())?;
        self.tx.execute("DELETE FROM steps WHERE id = ?1", [&step.id])?;
        self.emit(
            ChangeEvent::new(EntityKind::Step, &step.id, ChangeKind::Deleted).in_project(project_id),
        );
        self.cascade_from_task(&step.task_id)
    }

    /// Persist one revision round.
    pub fn record_iteration(&mut self, record: &IterationRecord) -> Result<()> {
        self.tx.execute(
            &format!(
                "INSERT OR REPLACE INTO step_iterations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                ITERATION_COLUMNS
            ),
            params![
                record.step_id,
                record.iteration,
                record.producer_content,
                record.producer_reasoning,
                record.reviewer_content,
                record.reviewer_feedback,
                record.recorded_at,
            ],
        )?;
        Ok(())
    }

    /// Store (or replace) one agent's complexity opinion on a step.
    pub fn save_assessment(&mut self, step_id: &str, assessment: &ComplexityAssessment) -> Result<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO complexity_assessments \
             (step_id, agent, level, score, should_promote, confidence, reasons, assessed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                step_id,
                assessment.agent,
                assessment.level,
                assessment.score,
                assessment.should_promote,
                assessment.confidence,
                serde_json::to_string(&assessment.reasons)?,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    // === Disputes ===

    /// Insert a dispute; a second pending dispute for the same step is refused.
    pub fn insert_dispute(&mut self, mut dispute: Dispute) -> Result<Dispute> {
        if let Some(existing) = self.pending_dispute_for_step(&dispute.step_id)? {
            return Err(Error::PendingDisputeExists(Box::new(existing)));
        }
        dispute.version = 1;
        let resolution = dispute.resolution.as_ref();
        self.tx.execute(
            &format!(
                "INSERT INTO disputes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, \
                 ?12, ?13, ?14, ?15)",
                DISPUTE_COLUMNS
            ),
            params![
                dispute.id,
                dispute.project_id,
                dispute.step_id,
                dispute.producer_content,
                dispute.producer_reasoning,
                dispute.reviewer_content,
                dispute.reviewer_reasoning,
                serde_json::to_string(&dispute.history)?,
                dispute.status,
                resolution.map(|r| r.kind),
                resolution.map(|r| r.content.clone()),
                resolution.map(|r| r.resolved_at),
                dispute.version,
                dispute.created_at,
                dispute.updated_at,
            ],
        )?;
        self.emit(
            ChangeEvent::new(EntityKind::Dispute, &dispute.id, ChangeKind::Created)
                .in_project(&dispute.project_id)
                .with_detail(format!("step {}", dispute.step_id)),
        );
        Ok(dispute)
    }

    /// Compare-and-swap update of a dispute's status and resolution.
    pub fn update_dispute(&mut self, dispute: &mut Dispute) -> Result<()> {
        let resolution = dispute.resolution.as_ref();
        if (dispute.status == DisputeStatus::Resolved) != resolution.is_some() {
            return Err(Error::Validation(format!(
                "dispute {} resolution must be present exactly when resolved",
                dispute.id
            )));
        }
        dispute.updated_at = Utc::now();
        let changed = self.tx.execute(
            "UPDATE disputes SET status = ?1, resolution_kind = ?2, resolved_content = ?3, \
             resolved_at = ?4, updated_at = ?5, version = version + 1 \
             WHERE id = ?6 AND version = ?7",
            params![
                dispute.status,
                resolution.map(|r| r.kind),
                resolution.map(|r| r.content.clone()),
                resolution.map(|r| r.resolved_at),
                dispute.updated_at,
                dispute.id,
                dispute.version,
            ],
        )?;
        if changed == 0 {
            self.get_dispute(&dispute.id)?;
            return Err(Error::Conflict(format!(
                "dispute {} was modified concurrently",
                dispute.id
            )));
        }
        dispute.version += 1;
        self.emit(
            ChangeEvent::new(EntityKind::Dispute, &dispute.id, ChangeKind::Updated)
                .in_project(&dispute.project_id)
                .with_detail(dispute.status.to_string()),
        );
        Ok(())
    }

    /// Turn a zero-row compare-and-swap into `NotFound` or `Conflict`.
    fn check_swapped(&self, changed: usize, target: &NodeOrProject<'_>) -> Result<()> {
        if changed > 0 {
            return Ok(());
        }
        match target {
            NodeOrProject::Project(id) => {
                self.get_project(id)?;
                Err(Error::Conflict(format!("project {} was modified concurrently", id)))
            }
            NodeOrProject::Node(node) => {
                if !self.item_exists(node)? {
                    return Err(not_found(node));
                }
                Err(Error::Conflict(format!("{} was modified concurrently", node)))
            }
        }
    }
}

enum NodeOrProject<'a> {
    Project(&'a str),
    Node(&'a NodeRef),
}

pub(crate) fn table_for(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Task => "tasks",
        NodeKind::Step => "steps",
    }
}

pub(crate) fn not_found(node: &NodeRef) -> Error {
    match node.kind() {
        NodeKind::Task => Error::NotFound(format!("Task not found: {}", node.id())),
        NodeKind::Step => Error::NotFound(format!("Step not found: {}", node.id())),
    }
}

fn validate_text(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn query_one<T, P, F>(conn: &Connection, sql: &str, params: P, f: F) -> Result<Option<T>>
where
    P: Params,
    F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
{
    Ok(conn.query_row(sql, params, f).optional()?)
}

fn query_all<T, P, F>(conn: &Connection, sql: &str, params: P, f: F) -> Result<Vec<T>>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, f)?;
    Ok(rows.collect::<rusqlite::Result<Vec<T>>>()?)
}

/// Get the data directory for a workspace.
///
/// `DUET_DATA_DIR` wins when set. Otherwise a hash of the canonical
/// workspace path picks a directory under `~/.local/share/duet/`.
pub fn get_storage_dir(workspace: &Path) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let data_dir = dirs::data_dir()
        .ok_or_else(|| Error::Other("Could not determine data directory".to_string()))?;

    let canonical = workspace
        .canonicalize()
        .map_err(|e| Error::Other(format!("Could not canonicalize workspace path: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let hash_hex = format!("{:x}", hasher.finalize());

    Ok(data_dir.join("duet").join(&hash_hex[..12]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskSpec;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn create_test_storage() -> (TempDir, Storage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open_in_dir(temp_dir.path()).unwrap();
        (temp_dir, storage)
    }

    fn seed(storage: &mut Storage) -> (Project, Task) {
        storage
            .transaction(|tx| {
                let project = tx.insert_project(Project::new(
                    "Demo".to_string(),
                    "Build a demo".to_string(),
                ))?;
                let spec = TaskSpec {
                    title: "Setup".to_string(),
                    objective: "Prepare the ground".to_string(),
                };
                let task = tx.insert_task(Task::new(project.id.clone(), spec.title, spec.objective))?;
                Ok((project, task))
            })
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ChangeEvent>>);

    impl EventSink for Recorder {
        fn on_change(&self, event: &ChangeEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_open_creates_database() {
        let (temp_dir, storage) = create_test_storage();
        assert!(Storage::exists(temp_dir.path()));
        assert_eq!(storage.root(), Some(temp_dir.path()));
    }

    #[test]
    fn test_reopen_keeps_data_and_migrations_are_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let project_id = {
            let mut storage = Storage::open_in_dir(temp_dir.path()).unwrap();
            seed(&mut storage).0.id
        };
        let storage = Storage::open_in_dir(temp_dir.path()).unwrap();
        assert_eq!(storage.get_project(&project_id).unwrap().name, "Demo");
    }

    #[test]
    fn test_insert_sets_version_one() {
        let mut storage = Storage::open_in_memory().unwrap();
        let (project, task) = seed(&mut storage);
        assert_eq!(project.version, 1);
        assert_eq!(storage.get_task(&task.id).unwrap().position, 0);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let storage = Storage::open_in_memory().unwrap();
        let err = storage.get_step("nope").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn test_stale_version_conflicts() {
        let mut storage = Storage::open_in_memory().unwrap();
        let (_, task) = seed(&mut storage);
        let step = storage
            .transaction(|tx| tx.insert_step(Step::new(task.id.clone(), "Write".to_string())))
            .unwrap();

        let mut first = step.clone();
        first.title = "Write docs".to_string();
        storage.transaction(|tx| tx.update_step(&mut first)).unwrap();
        assert_eq!(first.version, step.version + 1);

        let mut stale = step.clone();
        stale.title = "Write tests".to_string();
        let err = storage.transaction(|tx| tx.update_step(&mut stale)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConflictError);
        assert_eq!(storage.get_step(&step.id).unwrap().title, "Write docs");
    }

    #[test]
    fn test_failed_transaction_rolls_back_and_emits_nothing() {
        let mut storage = Storage::open_in_memory().unwrap();
        let recorder = Arc::new(Recorder::default());
        storage.add_sink(recorder.clone());

        let result: Result<()> = storage.transaction(|tx| {
            tx.insert_project(Project::new("A".to_string(), "B".to_string()))?;
            Err(Error::Other("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(storage.list_projects().unwrap().is_empty());
        assert!(recorder.0.lock().unwrap().is_empty());

        seed(&mut storage);
        let events = recorder.0.lock().unwrap();
        assert!(events.iter().any(|e| e.entity == EntityKind::Project
            && e.change == ChangeKind::Created));
    }

    #[test]
    fn test_parent_must_share_project() {
        let mut storage = Storage::open_in_memory().unwrap();
        let (_, task) = seed(&mut storage);
        let (other, _) = seed(&mut storage);

        let mut child = Task::new(other.id.clone(), "Child".to_string(), "Nested".to_string());
        child.parent_task_id = Some(task.id.clone());
        let err = storage.transaction(|tx| tx.insert_task(child)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::StructuralViolation);
    }

    #[test]
    fn test_move_task_leaves_old_chain() {
        let mut storage = Storage::open_in_memory().unwrap();
        let (project, first) = seed(&mut storage);
        let (second, third) = storage
            .transaction(|tx| {
                let mut second =
                    Task::new(project.id.clone(), "Second".to_string(), "Middle".to_string());
                second.prev_ref = Some(first.node_ref());
                let second = tx.insert_task(second)?;
                let mut third =
                    Task::new(project.id.clone(), "Third".to_string(), "Last".to_string());
                third.prev_ref = Some(second.node_ref());
                let third = tx.insert_task(third)?;
                Ok((second, third))
            })
            .unwrap();

        let moved = storage
            .transaction(|tx| tx.move_task(&second.id, Some(&first.id)))
            .unwrap();
        assert_eq!((moved.prev_ref, moved.next_ref), (None, None));
        assert_eq!(storage.get_task(&first.id).unwrap().next_ref, Some(third.node_ref()));
        assert_eq!(storage.get_task(&third.id).unwrap().prev_ref, Some(first.node_ref()));
    }

    #[test]
    fn test_move_task_rejects_cycles() {
        let mut storage = Storage::open_in_memory().unwrap();
        let (project, root) = seed(&mut storage);
        let child = storage
            .transaction(|tx| {
                let mut child =
                    Task::new(project.id.clone(), "Child".to_string(), "Nested".to_string());
                child.parent_task_id = Some(root.id.clone());
                tx.insert_task(child)
            })
            .unwrap();

        let err = storage
            .transaction(|tx| tx.move_task(&root.id, Some(&child.id)))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::StructuralViolation);

        let err = storage
            .transaction(|tx| tx.move_task(&root.id, Some(&root.id)))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::StructuralViolation);

        let moved = storage
            .transaction(|tx| tx.move_task(&child.id, None))
            .unwrap();
        assert!(moved.parent_task_id.is_none());
        assert_eq!(storage.list_root_tasks(&project.id).unwrap().len(), 2);
    }

    #[test]
    fn test_one_pending_dispute_per_step() {
        let mut storage = Storage::open_in_memory().unwrap();
        let (project, task) = seed(&mut storage);
        let step = storage
            .transaction(|tx| tx.insert_step(Step::new(task.id.clone(), "Argue".to_string())))
            .unwrap();

        let first = storage
            .transaction(|tx| tx.insert_dispute(Dispute::open(project.id.clone(), &step, Vec::new())))
            .unwrap();
        let err = storage
            .transaction(|tx| tx.insert_dispute(Dispute::open(project.id.clone(), &step, Vec::new())))
            .unwrap_err();
        match err {
            Error::PendingDisputeExists(existing) => assert_eq!(existing.id, first.id),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(
            storage
                .list_disputes(Some(&project.id), Some(DisputeStatus::Pending))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_dispute_round_trips_history_and_resolution() {
        let mut storage = Storage::open_in_memory().unwrap();
        let (project, task) = seed(&mut storage);
        let step = storage
            .transaction(|tx| tx.insert_step(Step::new(task.id.clone(), "Argue".to_string())))
            .unwrap();
        let record = IterationRecord {
            step_id: step.id.clone(),
            iteration: 1,
            producer_content: Some("A".to_string()),
            producer_reasoning: None,
            reviewer_content: None,
            reviewer_feedback: Some("B".to_string()),
            recorded_at: Utc::now(),
        };

        let mut dispute = storage
            .transaction(|tx| {
                tx.insert_dispute(Dispute::open(project.id.clone(), &step, vec![record.clone()]))
            })
            .unwrap();
        dispute
            .resolve(crate::models::ResolutionKind::Custom, "C".to_string())
            .unwrap();
        storage.transaction(|tx| tx.update_dispute(&mut dispute)).unwrap();

        let loaded = storage.get_dispute(&dispute.id).unwrap();
        assert_eq!(loaded.history, vec![record]);
        assert_eq!(loaded.status, DisputeStatus::Resolved);
        assert_eq!(loaded.resolution.unwrap().content, "C");
    }

    #[test]
    fn test_delete_project_cascades() {
        let mut storage = Storage::open_in_memory().unwrap();
        let (project, task) = seed(&mut storage);
        let step = storage
            .transaction(|tx| tx.insert_step(Step::new(task.id.clone(), "Gone".to_string())))
            .unwrap();
        storage.transaction(|tx| tx.delete_project(&project.id)).unwrap();
        assert!(storage.get_task(&task.id).is_err());
        assert!(storage.get_step(&step.id).is_err());
    }

    #[test]
    fn test_assessments_replace_per_agent() {
        let mut storage = Storage::open_in_memory().unwrap();
        let (_, task) = seed(&mut storage);
        let step_id = storage
            .transaction(|tx| tx.insert_step(Step::new(task.id.clone(), "Score".to_string())))
            .unwrap()
            .id;
        let found = crate::models::complexity::inspect_step("Score", None);
        let mut opinion = ComplexityAssessment::from_score(Agent::Producer, &found, 0.7);
        storage
            .transaction(|tx| tx.save_assessment(&step_id, &opinion))
            .unwrap();
        opinion.score = 0.9;
        storage
            .transaction(|tx| tx.save_assessment(&step_id, &opinion))
            .unwrap();

        let stored = storage.list_assessments(&step_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].score, 0.9);
        assert!(storage.get_assessment(&step_id, Agent::Reviewer).unwrap().is_none());
    }

    #[test]
    #[serial_test::serial]
    fn test_storage_dir_is_stable_per_workspace() {
        let temp_dir = TempDir::new().unwrap();
        let dir = get_storage_dir(temp_dir.path()).unwrap();
        assert_eq!(dir, get_storage_dir(temp_dir.path()).unwrap());
        if std::env::var(DATA_DIR_ENV).is_err() {
            assert!(dir.to_string_lossy().contains("duet"));
        }
    }
}
