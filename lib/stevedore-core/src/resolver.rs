//! Dependency resolution.
//!
//! Turns a set of target services into an ordered plan: dependencies before dependents when starting, dependents
//! before dependencies when stopping.

use std::{collections::HashMap, fmt};

use indexmap::{IndexMap, IndexSet};
use snafu::Snafu;

use crate::topology::ServiceId;

/// A dependency cycle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CycleError {
    path: Vec<ServiceId>,
}

impl CycleError {
    /// Returns the services forming the cycle.
    ///
    /// The path starts and ends with the service where the cycle was closed, and each service depends on the one
    /// following it.
    pub fn path(&self) -> &[ServiceId] {
        &self.path
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.path.iter().map(|id| id.as_str()).collect::<Vec<_>>();
        write!(f, "cycle detected: {}", path.join(" -> "))
    }
}

impl std::error::Error for CycleError {}

/// Plan errors.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PlanError {
    /// The dependencies reachable from the targets form a cycle.
    #[snafu(display("{}", source))]
    Cycle {
        /// The detected cycle.
        source: CycleError,
    },

    /// A target service does not exist.
    #[snafu(display("nonexistent service '{}'", service))]
    UnknownService {
        /// The missing service, as given.
        service: String,
    },

    /// A service depends on a service that does not exist.
    #[snafu(display("service '{}' depends on nonexistent service '{}'", dependent, service))]
    UnknownDependency {
        /// The missing service.
        service: ServiceId,

        /// The service that depends on it.
        dependent: ServiceId,
    },
}

/// A graph of services and their dependencies.
pub trait DependencyGraph {
    /// Returns every service in the graph, in declaration order.
    fn service_ids(&self) -> Vec<&ServiceId>;

    /// Returns the direct dependencies of the given service, in declaration order.
    ///
    /// Returns `None` if the service is not part of the graph.
    fn dependencies(&self, id: &ServiceId) -> Option<&[ServiceId]>;
}

impl DependencyGraph for IndexMap<ServiceId, Vec<ServiceId>> {
    fn service_ids(&self) -> Vec<&ServiceId> {
        self.keys().collect()
    }

    fn dependencies(&self, id: &ServiceId) -> Option<&[ServiceId]> {
        self.get(id).map(Vec::as_slice)
    }
}

/// Direction of a plan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Dependencies first, for bringing services up.
    Forward,

    /// Dependents first, for bringing services down.
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Reverse => f.write_str("reverse"),
        }
    }
}

/// An ordered list of services to act on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Plan {
    direction: Direction,
    entries: Vec<ServiceId>,
    ranks: Vec<usize>,
}

impl Plan {
    /// Creates a plan made of a single service, ignoring its dependencies.
    pub fn isolated(direction: Direction, service: ServiceId) -> Self {
        Self {
            direction,
            entries: vec![service],
            ranks: vec![0],
        }
    }

    /// Returns the plan direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the services in execution order.
    pub fn entries(&self) -> &[ServiceId] {
        &self.entries
    }

    /// Returns `true` if the plan contains the given service.
    pub fn contains(&self, id: &ServiceId) -> bool {
        self.entries.contains(id)
    }

    /// Returns the number of services in the plan.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Groups the plan entries into topological ranks.
    ///
    /// A service with no predecessor in the plan has rank 0; any other service is ranked one above its highest-ranked
    /// predecessor. Predecessors are dependencies for forward plans and dependents for reverse plans. Services in the
    /// same rank never depend on each other and keep their relative plan order.
    pub fn ranks(&self) -> Vec<Vec<ServiceId>> {
        let mut ranks: Vec<Vec<ServiceId>> = Vec::new();
        for (entry, rank) in self.entries.iter().zip(self.ranks.iter().copied()) {
            if ranks.len() <= rank {
                ranks.resize_with(rank + 1, Vec::new);
            }
            ranks[rank].push(entry.clone());
        }
        ranks
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.iter().map(|id| id.as_str()).collect::<Vec<_>>();
        write!(f, "[{}]", entries.join(", "))
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Mark {
    InProgress,
    Done,
}

/// Computes the plan for the given targets.
///
/// Forward plans contain the targets and all of their transitive dependencies, with every service placed after all of
/// its dependencies. Reverse plans contain the targets and all of their transitive dependents, with every service
/// placed before all of its dependencies. Each service appears exactly once. For identical inputs, the output is
/// identical.
///
/// # Errors
///
/// If a target does not exist, a dependency does not exist, or a cycle is reachable from the targets, an error is
/// returned. A partial order is never returned.
pub fn plan<G>(graph: &G, targets: &[ServiceId], direction: Direction) -> Result<Plan, PlanError>
where
    G: DependencyGraph + ?Sized,
{
    for target in targets {
        if graph.dependencies(target).is_none() {
            return Err(PlanError::UnknownService {
                service: target.to_string(),
            });
        }
    }

    match direction {
        Direction::Forward => {
            let entries = post_order(graph, targets.iter(), None)?;
            let ranks = rank_entries(&entries, |id| graph.dependencies(id).unwrap_or_default().iter());
            Ok(Plan {
                direction,
                entries,
                ranks,
            })
        }
        Direction::Reverse => {
            let dependents = dependents_of(graph);

            // Targets first, then everything depending on them in breadth-first discovery order.
            let mut affected = targets.iter().cloned().collect::<IndexSet<_>>();
            let mut idx = 0;
            while let Some(current) = affected.get_index(idx).cloned() {
                if let Some(direct) = dependents.get(&current) {
                    affected.extend(direct.iter().cloned());
                }
                idx += 1;
            }

            let mut entries = post_order(graph, affected.iter(), Some(&affected))?;
            entries.reverse();

            let ranks = rank_entries(&entries, |id| dependents.get(id).map(Vec::as_slice).unwrap_or_default().iter());
            Ok(Plan {
                direction,
                entries,
                ranks,
            })
        }
    }
}

/// Iterative depth-first traversal emitting services in post-order, following dependencies in declaration order.
///
/// When `within` is given, dependencies outside of it are not followed.
fn post_order<'a, G, I>(graph: &G, roots: I, within: Option<&IndexSet<ServiceId>>) -> Result<Vec<ServiceId>, PlanError>
where
    G: DependencyGraph + ?Sized,
    I: Iterator<Item = &'a ServiceId>,
{
    let mut marks = HashMap::new();
    let mut order = Vec::new();

    for root in roots {
        if marks.contains_key(root) {
            continue;
        }

        // Each frame is a service along with the index of the next dependency to visit.
        let mut stack = vec![(root.clone(), 0usize)];
        marks.insert(root.clone(), Mark::InProgress);

        while let Some(frame) = stack.last_mut() {
            let dependencies = graph.dependencies(&frame.0).unwrap_or_default();
            let next = dependencies.get(frame.1).cloned();
            frame.1 += 1;

            let Some(dependency) = next else {
                if let Some((id, _)) = stack.pop() {
                    marks.insert(id.clone(), Mark::Done);
                    order.push(id);
                }
                continue;
            };

            if within.is_some_and(|within| !within.contains(&dependency)) {
                continue;
            }

            match marks.get(&dependency) {
                Some(Mark::Done) => {}
                Some(Mark::InProgress) => {
                    // We reached a service that is still on the current stack: it's a cycle.
                    let start = stack.iter().position(|(id, _)| *id == dependency).unwrap_or_default();
                    let mut path = stack[start..].iter().map(|(id, _)| id.clone()).collect::<Vec<_>>();
                    path.push(dependency);
                    return Err(PlanError::Cycle {
                        source: CycleError { path },
                    });
                }
                None => {
                    if graph.dependencies(&dependency).is_none() {
                        let dependent = stack.last().map(|(id, _)| id.clone()).unwrap_or_else(|| root.clone());
                        return Err(PlanError::UnknownDependency {
                            service: dependency,
                            dependent,
                        });
                    }
                    marks.insert(dependency.clone(), Mark::InProgress);
                    stack.push((dependency, 0));
                }
            }
        }
    }

    Ok(order)
}

fn dependents_of<G>(graph: &G) -> HashMap<ServiceId, Vec<ServiceId>>
where
    G: DependencyGraph + ?Sized,
{
    let mut dependents: HashMap<ServiceId, Vec<ServiceId>> = HashMap::new();
    for id in graph.service_ids() {
        for dependency in graph.dependencies(id).unwrap_or_default() {
            dependents.entry(dependency.clone()).or_default().push(id.clone());
        }
    }
    dependents
}

fn rank_entries<'a, F, I>(entries: &[ServiceId], predecessors: F) -> Vec<usize>
where
    F: Fn(&ServiceId) -> I,
    I: Iterator<Item = &'a ServiceId>,
{
    let mut ranks = HashMap::with_capacity(entries.len());
    let mut ordered = Vec::with_capacity(entries.len());
    for entry in entries {
        let rank = predecessors(entry)
            .filter_map(|predecessor| ranks.get(predecessor).map(|rank| rank + 1))
            .max()
            .unwrap_or(0);
        ranks.insert(entry.clone(), rank);
        ordered.push(rank);
    }
    ordered
}
