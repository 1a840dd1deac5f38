//! Execution-chain maintenance.
//!
//! Tasks and steps are threaded into one doubly linked chain through their
//! `prev_ref`/`next_ref` columns. These helpers keep both directions in step
//! when nodes are inserted, re-threaded, replaced or removed.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::params;

use super::{not_found, table_for, ChangeEvent, ChangeKind, EntityKind, Queries, StoreTx};
use crate::models::{NodeKind, NodeRef};
use crate::{Error, Result};

/// A node's `(prev, next)` links.
pub type Links = (Option<NodeRef>, Option<NodeRef>);

impl StoreTx<'_> {
    /// Current links of a node.
    pub fn links_of(&self, node: &NodeRef) -> Result<Links> {
        use rusqlite::OptionalExtension;
        self.tx
            .query_row(
                &format!(
                    "SELECT prev_ref, next_ref FROM {} WHERE id = ?1",
                    table_for(node.kind())
                ),
                [node.id()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| not_found(node))
    }

    /// Move an existing node to a new place in the chain.
    pub fn set_links(
        &mut self,
        node: &NodeRef,
        prev: Option<NodeRef>,
        next: Option<NodeRef>,
    ) -> Result<()> {
        self.unthread(node)?;
        self.thread(node, prev, next)
    }

    /// Thread an unlinked node between `prev` and `next`.
    ///
    /// When only one neighbour is given the other is inherited from it, so
    /// `prev` alone means "insert right after prev".
    pub(crate) fn thread(
        &mut self,
        node: &NodeRef,
        prev: Option<NodeRef>,
        next: Option<NodeRef>,
    ) -> Result<()> {
        let project_id = self.project_of(node)?;
        for link in prev.iter().chain(next.iter()) {
            self.check_link(node, &project_id, link)?;
        }

        let (prev, next) = match (prev, next) {
            (Some(p), None) => {
                let after = self.links_of(&p)?.1;
                (Some(p), after)
            }
            (None, Some(n)) => {
                let before = self.links_of(&n)?.0;
                (before, Some(n))
            }
            both => both,
        };

        if let (Some(p), Some(n)) = (&prev, &next) {
            if p == n {
                return Err(Error::StructuralViolation(format!(
                    "{} cannot be both the previous and next item",
                    p
                )));
            }
            let (_, after_prev) = self.links_of(p)?;
            let (before_next, _) = self.links_of(n)?;
            if after_prev.as_ref().is_some_and(|current| current != n)
                || before_next.as_ref().is_some_and(|current| current != p)
            {
                return Err(Error::StructuralViolation(format!(
                    "{} and {} are not adjacent in the chain",
                    p, n
                )));
            }
            if after_prev.is_none() && self.precedes(n, p)? {
                return Err(Error::StructuralViolation(format!(
                    "linking {} after {} would close a cycle",
                    n, p
                )));
            }
        }

        self.write_link(node, Side::Prev, prev.as_ref())?;
        self.write_link(node, Side::Next, next.as_ref())?;
        if let Some(p) = &prev {
            self.write_link(p, Side::Next, Some(node))?;
        }
        if let Some(n) = &next {
            self.write_link(n, Side::Prev, Some(node))?;
        }
        Ok(())
    }

    /// Whether `target` is reached by walking `prev_ref` links back from `from`.
    fn precedes(&self, target: &NodeRef, from: &NodeRef) -> Result<bool> {
        let mut seen = HashSet::from([from.clone()]);
        let mut cursor = self.links_of(from)?.0;
        while let Some(node) = cursor {
            if &node == target {
                return Ok(true);
            }
            if !seen.insert(node.clone()) || !self.item_exists(&node)? {
                return Ok(false);
            }
            cursor = self.links_of(&node)?.0;
        }
        Ok(false)
    }

    /// Splice a node out of the chain, re-linking its neighbours to each
    /// other and dropping every other reference to it.
    pub(crate) fn unthread(&mut self, node: &NodeRef) -> Result<()> {
        let (prev, next) = self.links_of(node)?;

        if let Some(p) = &prev {
            if self.item_exists(p)? && self.links_of(p)?.1.as_ref() == Some(node) {
                self.write_link(p, Side::Next, next.as_ref())?;
            }
        }
        if let Some(n) = &next {
            if self.item_exists(n)? && self.links_of(n)?.0.as_ref() == Some(node) {
                self.write_link(n, Side::Prev, prev.as_ref())?;
            }
        }

        self.clear_references_to(node)?;
        if prev.is_some() {
            self.write_link(node, Side::Prev, None)?;
        }
        if next.is_some() {
            self.write_link(node, Side::Next, None)?;
        }
        Ok(())
    }

    /// Put the unlinked node `new` where `old` sits in the chain, leaving
    /// `old` unlinked and unreferenced.
    pub(crate) fn take_place(&mut self, old: &NodeRef, new: &NodeRef) -> Result<()> {
        let (prev, next) = self.links_of(old)?;
        if self.links_of(new)? != (None, None) {
            return Err(Error::StructuralViolation(format!(
                "{} is already linked into the chain",
                new
            )));
        }

        self.replace_references(old, new)?;
        self.write_link(new, Side::Prev, prev.as_ref())?;
        self.write_link(new, Side::Next, next.as_ref())?;
        if prev.is_some() {
            self.write_link(old, Side::Prev, None)?;
        }
        if next.is_some() {
            self.write_link(old, Side::Next, None)?;
        }
        Ok(())
    }

    /// Point every reference to `old` at `new` instead.
    pub(crate) fn replace_references(&mut self, old: &NodeRef, new: &NodeRef) -> Result<usize> {
        self.rewrite_references(old, Some(new))
    }

    /// Null out every reference to `node`.
    pub(crate) fn clear_references_to(&mut self, node: &NodeRef) -> Result<usize> {
        self.rewrite_references(node, None)
    }

    fn rewrite_references(&mut self, old: &NodeRef, new: Option<&NodeRef>) -> Result<usize> {
        let now = Utc::now();
        let mut changed = 0;
        for table in ["tasks", "steps"] {
            for column in ["prev_ref", "next_ref"] {
                changed += self.tx.execute(
                    &format!(
                        "UPDATE {table} SET {column} = ?1, updated_at = ?2, version = version + 1 \
                         WHERE {column} = ?3"
                    ),
                    params![new, now, old],
                )?;
            }
        }
        Ok(changed)
    }

    fn check_link(&self, node: &NodeRef, project_id: &str, link: &NodeRef) -> Result<()> {
        if link == node {
            return Err(Error::StructuralViolation(format!(
                "{} cannot reference itself",
                node
            )));
        }
        let link_project = self.project_of(link)?;
        if link_project != project_id {
            return Err(Error::StructuralViolation(format!(
                "{} belongs to another project than {}",
                link, node
            )));
        }
        Ok(())
    }

    fn write_link(&mut self, node: &NodeRef, side: Side, target: Option<&NodeRef>) -> Result<()> {
        let column = match side {
            Side::Prev => "prev_ref",
            Side::Next => "next_ref",
        };
        let changed = self.tx.execute(
            &format!(
                "UPDATE {} SET {} = ?1, updated_at = ?2, version = version + 1 WHERE id = ?3",
                table_for(node.kind()),
                column
            ),
            params![target, Utc::now(), node.id()],
        )?;
        if changed == 0 {
            return Err(not_found(node));
        }

        let entity = match node.kind() {
            NodeKind::Task => EntityKind::Task,
            NodeKind::Step => EntityKind::Step,
        };
        let detail = match target {
            Some(t) => format!("{} -> {}", column, t),
            None => format!("{} cleared", column),
        };
        self.emit(ChangeEvent::new(entity, node.id(), ChangeKind::Updated).with_detail(detail));
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Side {
    Prev,
    Next,
}
