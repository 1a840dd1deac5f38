//! Next-actionable-item resolution and explicit chain traversal.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Engine;
use crate::models::{NodeRef, Task, WorkItem};
use crate::storage::Queries;
use crate::{Error, ErrorKind, Result};

/// Which links a chain walk follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
    Both,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
            Direction::Both => "both",
        }
    }

    fn forward(&self) -> bool {
        matches!(self, Direction::Forward | Direction::Both)
    }

    fn backward(&self) -> bool {
        matches!(self, Direction::Backward | Direction::Both)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "forward" | "next" => Ok(Direction::Forward),
            "backward" | "prev" => Ok(Direction::Backward),
            "both" => Ok(Direction::Both),
            _ => Err(Error::Validation(format!("Invalid direction: {}", s))),
        }
    }
}

/// The items reached from a starting point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainWalk {
    pub start: WorkItem,
    /// Items before `start`, nearest first
    pub backward: Vec<WorkItem>,
    /// Items after `start`, nearest first
    pub forward: Vec<WorkItem>,
    /// The depth limit stopped the walk while links remained
    pub truncated: bool,
}

impl ChainWalk {
    /// The start itself when incomplete, else the nearest incomplete item ahead.
    pub fn first_incomplete(&self) -> Option<&WorkItem> {
        std::iter::once(&self.start)
            .chain(self.forward.iter())
            .find(|item| !item.is_complete())
    }
}

impl Engine {
    /// The next unit of work in a project.
    ///
    /// Root tasks, and inside each task its steps and child tasks, are
    /// visited in chain order: from each chain head along `next_ref`, then
    /// any unlinked members by position. The first incomplete step wins,
    /// descending into incomplete child tasks as they are met; an incomplete
    /// task with nothing left below it is returned itself. `NotFound` when
    /// the whole project is complete.
    pub async fn get_next_actionable_item(&self, project_id: &str) -> Result<WorkItem> {
        self.read(|s| {
            s.get_project(project_id)?;
            let roots = s.list_root_tasks(project_id)?.into_iter().map(WorkItem::Task).collect();
            next_among(s, roots)?.ok_or_else(|| {
                Error::NotFound(format!("No actionable item left in project {}", project_id))
            })
        })
        .await
    }

    /// Follow `next_ref`/`prev_ref` links from `start`, at most `max_depth`
    /// items in each direction.
    pub async fn traverse_chain(
        &self,
        start: &NodeRef,
        direction: Direction,
        max_depth: usize,
    ) -> Result<ChainWalk> {
        self.read(|s| {
            let start_item = s.get_item(start)?;
            let mut seen = HashSet::from([start.clone()]);
            let mut truncated = false;

            let mut walk = |first: Option<&NodeRef>, forward: bool| -> Result<Vec<WorkItem>> {
                let mut items = Vec::new();
                let mut cursor = first.cloned();
                while let Some(node) = cursor {
                    if items.len() >= max_depth {
                        truncated = true;
                        break;
                    }
                    if !seen.insert(node.clone()) {
                        return Err(Error::StructuralViolation(format!(
                            "Cycle in chain: {} is reached twice from {}",
                            node, start
                        )));
                    }
                    let item = s.get_item(&node).map_err(|e| match e.kind() {
                        ErrorKind::NotFound => Error::StructuralViolation(format!(
                            "Dangling chain reference to {}",
                            node
                        )),
                        _ => e,
                    })?;
                    let link = if forward { item.next_ref() } else { item.prev_ref() };
                    cursor = link.cloned();
                    items.push(item);
                }
                Ok(items)
            };

            let backward = if direction.backward() {
                walk(start_item.prev_ref(), false)?
            } else {
                Vec::new()
            };
            let forward = if direction.forward() {
                walk(start_item.next_ref(), true)?
            } else {
                Vec::new()
            };

            Ok(ChainWalk {
                start: start_item,
                backward,
                forward,
                truncated,
            })
        })
        .await
    }
}

/// First actionable item among siblings, taken in chain order.
fn next_among(s: &impl Queries, siblings: Vec<WorkItem>) -> Result<Option<WorkItem>> {
    for item in chain_order(siblings) {
        match item {
            WorkItem::Step(step) if !step.is_complete() => return Ok(Some(WorkItem::Step(step))),
            WorkItem::Task(task) if task.progress < 1.0 => {
                if let Some(found) = next_in_task(s, task)? {
                    return Ok(Some(found));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

fn next_in_task(s: &impl Queries, task: Task) -> Result<Option<WorkItem>> {
    let members: Vec<WorkItem> = s
        .list_steps(&task.id)?
        .into_iter()
        .map(WorkItem::Step)
        .chain(s.list_child_tasks(&task.id)?.into_iter().map(WorkItem::Task))
        .collect();
    if let Some(found) = next_among(s, members)? {
        return Ok(Some(found));
    }
    Ok((task.progress < 1.0).then_some(WorkItem::Task(task)))
}

/// Order `items` by their `next_ref` links.
///
/// Heads (items whose predecessor is not in the group) are followed in
/// input order; members no walk reaches keep their input order at the end.
fn chain_order(items: Vec<WorkItem>) -> Vec<WorkItem> {
    let index: HashMap<NodeRef, usize> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.node_ref(), i))
        .collect();
    let heads: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.prev_ref().is_none_or(|prev| !index.contains_key(prev)))
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(items.len());
    let mut placed = vec![false; items.len()];
    for head in heads {
        let mut cursor = Some(head);
        while let Some(i) = cursor.filter(|&i| !placed[i]) {
            placed[i] = true;
            order.push(i);
            cursor = items[i].next_ref().and_then(|next| index.get(next).copied());
        }
    }
    order.extend((0..items.len()).filter(|&i| !placed[i]));

    let mut slots: Vec<Option<WorkItem>> = items.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskSpec;
    use crate::test_utils::TestEnv;
    use crate::workflow::ReviewerDecision;

    fn spec(title: &str) -> TaskSpec {
        TaskSpec {
            title: title.to_string(),
            objective: format!("{} objective", title),
        }
    }

    async fn agree(engine: &Engine, step_id: &str) {
        engine
            .submit_producer_content(step_id, "done", "", None)
            .await
            .unwrap();
        engine
            .submit_reviewer_decision(step_id, &ReviewerDecision::approve(None))
            .await
            .unwrap();
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("forward".parse::<Direction>().unwrap(), Direction::Forward);
        assert_eq!("PREV".parse::<Direction>().unwrap(), Direction::Backward);
        assert_eq!("both".parse::<Direction>().unwrap(), Direction::Both);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[tokio::test]
    async fn test_next_item_walks_steps_then_tasks() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let project = engine.create_project("P", "D", None, None).await.unwrap();
        let tasks = engine
            .define_root_tasks(&project.id, &[spec("First"), spec("Second")])
            .await
            .unwrap();
        let a = engine.create_step(&tasks[0].id, "A", None, None).await.unwrap();
        let b = engine.create_step(&tasks[0].id, "B", None, None).await.unwrap();

        let next = engine.get_next_actionable_item(&project.id).await.unwrap();
        assert_eq!(next.node_ref(), a.node_ref());

        agree(&engine, &a.id).await;
        let next = engine.get_next_actionable_item(&project.id).await.unwrap();
        assert_eq!(next.node_ref(), b.node_ref());

        // Second has no steps yet, so the task itself is the work.
        agree(&engine, &b.id).await;
        let next = engine.get_next_actionable_item(&project.id).await.unwrap();
        assert_eq!(next.node_ref(), tasks[1].node_ref());
    }

    #[tokio::test]
    async fn test_next_item_follows_relinked_chain() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let project = engine.create_project("P", "D", None, None).await.unwrap();
        let task = engine
            .define_root_tasks(&project.id, &[spec("T")])
            .await
            .unwrap()
            .remove(0);
        let a = engine.create_step(&task.id, "A", None, None).await.unwrap();
        let b = engine.create_step(&task.id, "B", None, None).await.unwrap();
        let c = engine.create_step(&task.id, "C", None, None).await.unwrap();

        // A B C  ->  B C A, positions unchanged.
        engine
            .set_links(&a.node_ref(), Some(c.node_ref()), None)
            .await
            .unwrap();

        let next = engine.get_next_actionable_item(&project.id).await.unwrap();
        assert_eq!(next.node_ref(), b.node_ref());

        agree(&engine, &b.id).await;
        agree(&engine, &c.id).await;
        let next = engine.get_next_actionable_item(&project.id).await.unwrap();
        assert_eq!(next.node_ref(), a.node_ref());
    }

    #[tokio::test]
    async fn test_next_item_enters_promoted_task_in_place() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let project = engine.create_project("P", "D", None, None).await.unwrap();
        let task = engine
            .define_root_tasks(&project.id, &[spec("T")])
            .await
            .unwrap()
            .remove(0);
        let first = engine.create_step(&task.id, "First", None, None).await.unwrap();
        let middle = engine.create_step(&task.id, "Middle", None, None).await.unwrap();
        engine.create_step(&task.id, "Last", None, None).await.unwrap();
        agree(&engine, &first.id).await;
        engine
            .submit_producer_content(&middle.id, "1. Parse input\n2. Emit output", "", None)
            .await
            .unwrap();
        let record = engine.promote_step(&middle.id, None).await.unwrap();

        // The promoted task sits between First and Last, so its children come first.
        let next = engine.get_next_actionable_item(&project.id).await.unwrap();
        assert_eq!(next.node_ref().id(), record.child_step_ids[0].as_str());
    }

    #[tokio::test]
    async fn test_next_item_descends_into_child_tasks() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let project = engine.create_project("P", "D", None, None).await.unwrap();
        let root = engine
            .define_root_tasks(&project.id, &[spec("Root")])
            .await
            .unwrap()
            .remove(0);
        let child = engine
            .define_root_tasks(&project.id, &[spec("Child")])
            .await
            .unwrap()
            .remove(0);
        engine.move_task(&child.id, Some(&root.id)).await.unwrap();
        let step = engine.create_step(&child.id, "Deep", None, None).await.unwrap();

        let next = engine.get_next_actionable_item(&project.id).await.unwrap();
        assert_eq!(next.node_ref(), step.node_ref());
    }

    #[tokio::test]
    async fn test_next_item_not_found_when_complete() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let project = engine.create_project("P", "D", None, None).await.unwrap();
        let task = engine
            .define_root_tasks(&project.id, &[spec("Only")])
            .await
            .unwrap()
            .remove(0);
        let step = engine.create_step(&task.id, "S", None, None).await.unwrap();
        agree(&engine, &step.id).await;

        let err = engine.get_next_actionable_item(&project.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_traverse_chain_both_directions() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let project = engine.create_project("P", "D", None, None).await.unwrap();
        let task = engine
            .define_root_tasks(&project.id, &[spec("T")])
            .await
            .unwrap()
            .remove(0);
        let mut steps = Vec::new();
        for title in ["S1", "S2", "S3", "S4"] {
            steps.push(engine.create_step(&task.id, title, None, None).await.unwrap());
        }
        agree(&engine, &steps[1].id).await;

        let walk = engine
            .traverse_chain(&steps[1].node_ref(), Direction::Both, 10)
            .await
            .unwrap();
        assert_eq!(walk.backward.len(), 1);
        assert_eq!(walk.backward[0].node_ref(), steps[0].node_ref());
        let forward: Vec<_> = walk.forward.iter().map(|i| i.title().to_string()).collect();
        assert_eq!(forward, vec!["S3", "S4"]);
        assert!(!walk.truncated);
        assert_eq!(walk.first_incomplete().unwrap().node_ref(), steps[2].node_ref());

        let short = engine
            .traverse_chain(&steps[0].node_ref(), Direction::Forward, 2)
            .await
            .unwrap();
        assert_eq!(short.forward.len(), 2);
        assert!(short.truncated);
        assert!(short.backward.is_empty());
    }

    #[tokio::test]
    async fn test_traverse_chain_detects_cycle() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let project = engine.create_project("P", "D", None, None).await.unwrap();
        let task = engine
            .define_root_tasks(&project.id, &[spec("T")])
            .await
            .unwrap()
            .remove(0);
        let a = engine.create_step(&task.id, "A", None, None).await.unwrap();
        let b = engine.create_step(&task.id, "B", None, None).await.unwrap();

        // Corrupt the chain behind the store's back: B points forward at A.
        engine
            .read(|s| {
                s.conn().execute(
                    "UPDATE steps SET next_ref = ?1 WHERE id = ?2",
                    [a.node_ref().to_string(), b.id.clone()],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = engine
            .traverse_chain(&a.node_ref(), Direction::Forward, 10)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StructuralViolation);
    }

    #[tokio::test]
    async fn test_traverse_chain_unknown_start() {
        let env = TestEnv::new();
        let engine = env.heuristic_engine();
        let err = engine
            .traverse_chain(&NodeRef::step("missing"), Direction::Both, 5)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
