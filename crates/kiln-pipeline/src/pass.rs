//! Passes: named, tier-tagged rewrites with an optional node predicate.

use kiln_common::HardwareTier;
use kiln_graph::{Graph, NodeId, NodeView};
use std::fmt;
use std::sync::Arc;

/// Per-node applicability check supplied when a stage is built.
pub type NodePredicate = Arc<dyn Fn(&NodeView<'_>) -> bool + Send + Sync>;

/// The graph mutation a pass performs.
///
/// Implementations must consult [`Scope::admits`] before rewriting a node so
/// the pass's predicate is honoured.
pub trait Rewrite: Send + Sync {
    /// Rewrite `graph`; returns whether anything changed.
    fn apply(&self, graph: &mut Graph, scope: &Scope<'_>) -> kiln_graph::Result<bool>;
}

impl<F> Rewrite for F
where
    F: Fn(&mut Graph, &Scope<'_>) -> kiln_graph::Result<bool> + Send + Sync,
{
    fn apply(&self, graph: &mut Graph, scope: &Scope<'_>) -> kiln_graph::Result<bool> {
        self(graph, scope)
    }
}

/// The predicate a rewrite runs under.
#[derive(Clone, Copy, Default)]
pub struct Scope<'p> {
    predicate: Option<&'p NodePredicate>,
}

impl<'p> Scope<'p> {
    /// A scope admitting every node.
    pub const fn all() -> Self {
        Self { predicate: None }
    }

    pub const fn new(predicate: Option<&'p NodePredicate>) -> Self {
        Self { predicate }
    }

    /// Whether the rewrite may touch `id`. Removed nodes are never admitted.
    pub fn admits(&self, graph: &Graph, id: NodeId) -> bool {
        let Some(view) = NodeView::new(graph, id) else {
            return false;
        };
        self.predicate.is_none_or(|p| p(&view))
    }

    /// Nodes in topological order that match `pattern` and are admitted.
    ///
    /// Collected up front; rewrites should skip ids that stop resolving.
    pub fn candidates(
        &self,
        graph: &Graph,
        pattern: impl Fn(&NodeView<'_>) -> bool,
    ) -> kiln_graph::Result<Vec<NodeId>> {
        Ok(graph
            .topological_order()?
            .into_iter()
            .filter(|id| {
                NodeView::new(graph, *id)
                    .is_some_and(|view| pattern(&view) && self.predicate.is_none_or(|p| p(&view)))
            })
            .collect())
    }
}

impl fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").field("predicate", &self.predicate.is_some()).finish()
    }
}

/// One registered pass.
///
/// A stage that runs the same rewrite more than once registers each later
/// copy with [`Pass::with_instance`] so every entry has a distinct label.
pub struct Pass {
    name: String,
    label: String,
    tier: HardwareTier,
    rewrite: Box<dyn Rewrite>,
    predicate: Option<NodePredicate>,
}

impl Pass {
    pub fn new(name: impl Into<String>, rewrite: impl Rewrite + 'static) -> Self {
        let name = name.into();
        Self { label: name.clone(), name, tier: HardwareTier::Common, rewrite: Box::new(rewrite), predicate: None }
    }

    /// A pass whose rewrite is a plain closure.
    pub fn from_fn<F>(name: impl Into<String>, rewrite: F) -> Self
    where
        F: Fn(&mut Graph, &Scope<'_>) -> kiln_graph::Result<bool> + Send + Sync + 'static,
    {
        Self::new(name, rewrite)
    }

    /// Mark this as the `instance`-th registration of the pass in its stage.
    #[must_use]
    pub fn with_instance(mut self, instance: u32) -> Self {
        self.label = if instance <= 1 { self.name.clone() } else { format!("{}#{instance}", self.name) };
        self
    }

    #[must_use]
    pub fn with_tier(mut self, tier: HardwareTier) -> Self {
        self.tier = tier;
        self
    }

    /// Restrict the rewrite to nodes for which `predicate` holds.
    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&NodeView<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Like [`Pass::with_predicate`], but `None` leaves the pass unrestricted.
    #[must_use]
    pub fn with_optional_predicate(mut self, predicate: Option<NodePredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name plus instance number; unique within a stage.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub const fn tier(&self) -> HardwareTier {
        self.tier
    }

    pub const fn has_predicate(&self) -> bool {
        self.predicate.is_some()
    }

    /// Run the rewrite under this pass's predicate.
    pub fn apply(&self, graph: &mut Graph) -> kiln_graph::Result<bool> {
        self.rewrite.apply(graph, &Scope::new(self.predicate.as_ref()))
    }
}

impl fmt::Debug for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pass")
            .field("label", &self.label)
            .field("tier", &self.tier)
            .field("predicate", &self.predicate.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_graph::{ElementType, OpKind, PartialShape};

    fn graph() -> Graph {
        let mut g = Graph::new("scope");
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[2]));
        let a = g.add_node("a", OpKind::Relu, vec![x.into()]).unwrap();
        let b = g.add_node("b", OpKind::Abs, vec![a.into()]).unwrap();
        g.add_result("out", b.into()).unwrap();
        g
    }

    #[test]
    fn candidates_respect_pattern_and_predicate() {
        let g = graph();
        let all = Scope::all().candidates(&g, |v| v.op().is_unary_elementwise()).unwrap();
        assert_eq!(all.len(), 2);

        let only_abs: NodePredicate = Arc::new(|v: &NodeView<'_>| matches!(v.op(), OpKind::Abs));
        let scoped = Scope::new(Some(&only_abs)).candidates(&g, |v| v.op().is_unary_elementwise()).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(g.node(scoped[0]).unwrap().name, "b");
    }

    #[test]
    fn closures_are_rewrites() {
        let pass = Pass::new("Noop", |_: &mut Graph, _: &Scope<'_>| Ok::<_, kiln_graph::GraphError>(false))
            .with_tier(HardwareTier::X64)
            .with_predicate(|_| true);
        assert_eq!(pass.name(), "Noop");
        assert_eq!(pass.tier(), HardwareTier::X64);
        assert!(pass.has_predicate());
        let mut g = graph();
        assert!(!pass.apply(&mut g).unwrap());
    }

    #[test]
    fn later_instances_get_numbered_labels() {
        let first = Pass::from_fn("Fold", |_, _| Ok(false));
        let second = Pass::from_fn("Fold", |_, _| Ok(false)).with_instance(2);
        assert_eq!(first.label(), "Fold");
        assert_eq!(second.label(), "Fold#2");
        assert_eq!(second.name(), "Fold");
    }
}
