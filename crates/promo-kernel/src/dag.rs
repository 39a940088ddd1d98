use crate::error::GraphError;
use crate::types::StepId;
use parking_lot::RwLock;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

/// Dependency graph between the steps of a wave.
///
/// An edge `a -> b` means `b` may only start once `a` has finished.
#[derive(Debug, Default)]
pub struct StepGraph {
    inner: RwLock<DiGraphMap<StepId, ()>>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step(&self, step: StepId) {
        self.inner.write().add_node(step);
    }

    /// Declare that `dependent` waits for `dependency`.
    pub fn add_dependency(&self, dependency: StepId, dependent: StepId) -> Result<(), GraphError> {
        if dependency == dependent {
            return Err(GraphError::SelfLoop(dependency));
        }

        let mut g = self.inner.write();
        g.add_node(dependency);
        g.add_node(dependent);
        g.add_edge(dependency, dependent, ());

        if petgraph::algo::is_cyclic_directed(&*g) {
            g.remove_edge(dependency, dependent);
            return Err(GraphError::CycleDetected);
        }

        Ok(())
    }

    pub fn contains(&self, step: StepId) -> bool {
        self.inner.read().contains_node(step)
    }

    pub fn step_count(&self) -> usize {
        self.inner.read().node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().edge_count()
    }

    /// Steps `step` waits for
    pub fn dependencies_of(&self, step: StepId) -> Result<Vec<StepId>, GraphError> {
        let g = self.inner.read();
        if !g.contains_node(step) {
            return Err(GraphError::StepNotFound(step));
        }
        Ok(g.neighbors_directed(step, Direction::Incoming).collect())
    }

    /// Steps waiting for `step`
    pub fn dependents_of(&self, step: StepId) -> Result<Vec<StepId>, GraphError> {
        let g = self.inner.read();
        if !g.contains_node(step) {
            return Err(GraphError::StepNotFound(step));
        }
        Ok(g.neighbors_directed(step, Direction::Outgoing).collect())
    }

    /// Get topological sort of steps (for scheduling)
    pub fn topological_order(&self) -> Result<Vec<StepId>, GraphError> {
        let g = self.inner.read();
        toposort(&*g, None).map_err(|_| GraphError::CycleDetected)
    }

    /// Get steps with no dependencies (entry points)
    pub fn entry_steps(&self) -> Vec<StepId> {
        let g = self.inner.read();
        g.nodes()
            .filter(|n| g.neighbors_directed(*n, Direction::Incoming).next().is_none())
            .collect()
    }

    /// Get steps nothing depends on (exit points)
    pub fn exit_steps(&self) -> Vec<StepId> {
        let g = self.inner.read();
        g.nodes()
            .filter(|n| g.neighbors_directed(*n, Direction::Outgoing).next().is_none())
            .collect()
    }
}
