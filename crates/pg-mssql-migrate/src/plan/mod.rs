//! Table ordering from the foreign-key graph.
//!
//! Tables are grouped into waves: every table's parents are in earlier waves.
//! Self references are deferred up front. When the remaining graph has no
//! table without pending parents, one edge inside a strongly connected
//! component is deferred and the extraction continues. Deferred foreign keys
//! are created after all data is copied.

mod scc;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::schema::SchemaSnapshot;
use crate::error::{MigrateError, Result};

/// Why a foreign key is created only after all data is copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    SelfReference,
    CycleBreak,
}

/// A foreign key that does not constrain copy order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredForeignKey {
    /// Qualified name of the owning table.
    pub table: String,
    pub constraint: String,
    /// Qualified name of the referenced table.
    pub references: String,
    pub reason: DeferReason,
}

/// A foreign key to a table outside the migrated set. Never created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalForeignKey {
    pub table: String,
    pub constraint: String,
    pub references: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Edge {
    table: String,
    constraint: String,
    parent: String,
}

/// Ordered copy plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    waves: Vec<Vec<String>>,
    deferred: Vec<DeferredForeignKey>,
    /// Members of each cycle that was broken, sorted.
    cycles: Vec<Vec<String>>,
    external: Vec<ExternalForeignKey>,
    /// Non-deferred internal parents per table.
    parents: BTreeMap<String, BTreeSet<String>>,
}

impl MigrationPlan {
    /// Build the plan for a snapshot.
    pub fn resolve(snapshot: &SchemaSnapshot) -> Result<Self> {
        let mut plan = MigrationPlan::default();
        let mut active: BTreeSet<Edge> = BTreeSet::new();

        for table in snapshot.tables() {
            let name = table.qualified_name();
            plan.parents.insert(name.clone(), BTreeSet::new());
            for fk in &table.foreign_keys {
                let parent = fk.referenced();
                if fk.is_external() || !snapshot.contains(&parent) {
                    plan.external.push(ExternalForeignKey {
                        table: name.clone(),
                        constraint: fk.name.clone(),
                        references: parent,
                    });
                } else if parent == name {
                    plan.deferred.push(DeferredForeignKey {
                        table: name.clone(),
                        constraint: fk.name.clone(),
                        references: parent,
                        reason: DeferReason::SelfReference,
                    });
                } else {
                    active.insert(Edge {
                        table: name.clone(),
                        constraint: fk.name.clone(),
                        parent,
                    });
                }
            }
        }

        let mut remaining: BTreeSet<String> = snapshot.table_names().cloned().collect();
        while !remaining.is_empty() {
            let blocked: BTreeSet<&String> = active
                .iter()
                .filter(|e| remaining.contains(&e.parent))
                .map(|e| &e.table)
                .collect();
            let wave: Vec<String> = remaining
                .iter()
                .filter(|t| !blocked.contains(t))
                .cloned()
                .collect();

            if !wave.is_empty() {
                debug!("Wave {}: {:?}", plan.waves.len(), wave);
                for t in &wave {
                    remaining.remove(t);
                }
                plan.waves.push(wave);
                continue;
            }

            let edge = plan.break_cycle(&remaining, &active)?;
            active.remove(&edge);
        }

        for edge in &active {
            if let Some(parents) = plan.parents.get_mut(&edge.table) {
                parents.insert(edge.parent.clone());
            }
        }

        plan.validate()?;
        info!(
            "Plan: {} tables in {} waves, {} deferred foreign keys, {} external",
            snapshot.len(),
            plan.waves.len(),
            plan.deferred.len(),
            plan.external.len()
        );
        Ok(plan)
    }

    /// Pick and record the edge to defer among the remaining tables.
    fn break_cycle(&mut self, remaining: &BTreeSet<String>, active: &BTreeSet<Edge>) -> Result<Edge> {
        let live: Vec<&Edge> = active
            .iter()
            .filter(|e| remaining.contains(&e.table) && remaining.contains(&e.parent))
            .collect();

        let nodes: Vec<&String> = remaining.iter().collect();
        let components = scc::strongly_connected(&nodes, &live);
        let component_of: BTreeMap<&String, usize> = components
            .iter()
            .enumerate()
            .filter(|(_, c)| c.len() > 1)
            .flat_map(|(i, c)| c.iter().map(move |n| (*n, i)))
            .collect();

        // `live` is sorted by (table, constraint), so the first match is the
        // lowest identifier.
        let edge = live
            .iter()
            .find(|e| {
                matches!(
                    (component_of.get(&e.table), component_of.get(&e.parent)),
                    (Some(a), Some(b)) if a == b
                )
            })
            .map(|e| (*e).clone())
            .ok_or_else(|| {
                MigrateError::UnresolvableDependency(format!(
                    "no cycle edge found among {:?}",
                    remaining
                ))
            })?;

        let mut members: Vec<String> = component_of
            .iter()
            .filter(|(_, c)| Some(*c) == component_of.get(&edge.table))
            .map(|(n, _)| (*n).clone())
            .collect();
        members.sort();

        warn!(
            "Breaking cycle {:?}: deferring {} on {} -> {}",
            members, edge.constraint, edge.table, edge.parent
        );
        if !self.cycles.contains(&members) {
            self.cycles.push(members);
        }
        self.deferred.push(DeferredForeignKey {
            table: edge.table.clone(),
            constraint: edge.constraint.clone(),
            references: edge.parent.clone(),
            reason: DeferReason::CycleBreak,
        });
        Ok(edge)
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    /// Tables in plan order.
    pub fn tables(&self) -> impl Iterator<Item = &String> {
        self.waves.iter().flatten()
    }

    pub fn deferred(&self) -> &[DeferredForeignKey] {
        &self.deferred
    }

    pub fn is_deferred(&self, table: &str, constraint: &str) -> bool {
        self.deferred
            .iter()
            .any(|d| d.table == table && d.constraint == constraint)
    }

    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    pub fn external(&self) -> &[ExternalForeignKey] {
        &self.external
    }

    /// Non-deferred internal parents of `table`.
    pub fn dependencies(&self, table: &str) -> impl Iterator<Item = &String> {
        self.parents.get(table).into_iter().flatten()
    }

    pub fn wave_of(&self, table: &str) -> Option<usize> {
        self.waves.iter().position(|w| w.iter().any(|t| t == table))
    }

    /// Check that each table is in exactly one wave and every parent is in a
    /// strictly earlier wave.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for table in self.tables() {
            if !seen.insert(table) {
                return Err(MigrateError::UnresolvableDependency(format!(
                    "{} appears in more than one wave",
                    table
                )));
            }
        }
        for table in self.parents.keys() {
            if !seen.contains(table) {
                return Err(MigrateError::UnresolvableDependency(format!(
                    "{} is not scheduled",
                    table
                )));
            }
        }

        for (table, parents) in &self.parents {
            let wave = self.wave_of(table);
            for parent in parents {
                if self.wave_of(parent) >= wave {
                    return Err(MigrateError::UnresolvableDependency(format!(
                        "{} is scheduled no later than its parent {}",
                        table, parent
                    )));
                }
            }
        }
        Ok(())
    }
}
