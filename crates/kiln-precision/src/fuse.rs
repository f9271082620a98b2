//! Node kinds whose conversion needs more than a retag.

use kiln_common::ElementType;
use kiln_graph::{Graph, InputRef, Node, NodeId, OpKind, OutputRef, Result};
use tracing::debug;

/// Wrap a FakeQuantize so its thresholds keep computing in `from` while its
/// consumers see `to`.
///
/// A `Convert(from)` is inserted before every input, unless that input is
/// already such a convert. A `Convert(to)` is inserted after the node for
/// every consumer that is neither a `Result` nor a `Convert`, and for which
/// `stays_in_from` is false. Consumers that stay in `from` read the node's
/// output as is. The node and every inserted guard are marked
/// `keep_precision`.
///
/// Returns the number of inserted converts.
pub fn fuse_fake_quantize(
    graph: &mut Graph,
    fq: NodeId,
    from: ElementType,
    to: ElementType,
    stays_in_from: impl Fn(&Node) -> bool,
) -> Result<usize> {
    let Some(node) = graph.node(fq) else {
        return Err(kiln_graph::GraphError::NodeNotFound(fq));
    };
    let name = node.name.clone();
    let inputs = node.inputs.clone();
    let mut inserted = 0;

    for (port, src) in inputs.iter().enumerate() {
        let already_guarded = graph
            .node(src.node)
            .is_some_and(|p| p.op == OpKind::Convert { destination: from });
        if already_guarded {
            continue;
        }
        let guard = graph.insert_before(
            InputRef::new(fq, port),
            format!("{name}/convert_in{port}"),
            OpKind::Convert { destination: from },
        )?;
        mark_kept(graph, guard);
        inserted += 1;
    }

    let consumers: Vec<InputRef> = graph
        .consumers(OutputRef::new(fq, 0))
        .into_iter()
        .filter(|input| {
            graph
                .node(input.node)
                .is_some_and(|c| {
                    !matches!(c.op, OpKind::Result | OpKind::Convert { .. }) && !stays_in_from(c)
                })
        })
        .collect();
    for (i, input) in consumers.into_iter().enumerate() {
        let guard = graph.insert_before(input, format!("{name}/convert_out{i}"), OpKind::Convert {
            destination: to,
        })?;
        mark_kept(graph, guard);
        inserted += 1;
    }

    mark_kept(graph, fq);
    debug!(node = %fq, %from, %to, inserted, "wrapped FakeQuantize in converts");
    Ok(inserted)
}

fn mark_kept(graph: &mut Graph, id: NodeId) {
    if let Some(node) = graph.node_mut(id) {
        node.rt.keep_precision = true;
    }
}

/// Whether a `Convert` to `boolean` lowered to unsigned integral `to` needs
/// the saturating rewrite of [`fuse_boolean_cast`]. Signed targets are
/// retagged.
pub fn needs_boolean_rewrite(input: ElementType, destination: ElementType, to: ElementType) -> bool {
    input.is_real() && destination == ElementType::Boolean && to.is_integral() && !to.is_signed()
}

/// Replace a real-to-boolean `Convert` by a cast that cannot wrap.
///
/// A truncating cast to a byte maps `0.01` to 0 and `256.0` to 0. The
/// replacement computes
/// `Convert(to)(Ceiling(Minimum(Abs(x), max(to))))`, first converting `x`
/// through `input_map` when its type is mapped. The final convert takes the
/// original friendly name and every consumer of the original node.
///
/// Returns the id of the final convert and the number of nodes added.
pub fn fuse_boolean_cast(
    graph: &mut Graph,
    convert: NodeId,
    to: ElementType,
    input_map: impl Fn(ElementType) -> Option<ElementType>,
) -> Result<(NodeId, usize)> {
    let Some(node) = graph.node(convert) else {
        return Err(kiln_graph::GraphError::NodeNotFound(convert));
    };
    let name = node.name.clone();
    let mut data = *node.inputs.first().ok_or(kiln_graph::GraphError::PortOutOfRange {
        node: convert,
        port: 0,
    })?;
    let mut added = 0;

    let in_type = graph
        .output_desc(data)
        .map(|d| d.element_type)
        .ok_or(kiln_graph::GraphError::NodeNotFound(data.node))?;
    if let Some(mapped) = input_map(in_type) {
        let cvt = graph.add_node(format!("{name}/convert_input"), OpKind::Convert { destination: mapped }, vec![
            data,
        ])?;
        data = cvt.into();
        added += 1;
    }
    let abs = graph.add_node(format!("{name}/abs"), OpKind::Abs, vec![data])?;
    let abs_type = graph
        .node(abs)
        .and_then(|n| n.output_type())
        .ok_or(kiln_graph::GraphError::NodeNotFound(abs))?;
    let max = graph.add_scalar(format!("{name}/max"), to, to.max_value())?;
    let max_cvt =
        graph.add_node(format!("{name}/max_convert"), OpKind::Convert { destination: abs_type }, vec![
            max.into(),
        ])?;
    let min = graph.add_node(format!("{name}/min"), OpKind::Minimum, vec![abs.into(), max_cvt.into()])?;
    let ceil = graph.add_node(format!("{name}/ceil"), OpKind::Ceiling, vec![min.into()])?;
    let replacement = graph.add_node(name, OpKind::Convert { destination: to }, vec![ceil.into()])?;
    added += 6;

    graph.replace_node(convert, replacement)?;
    debug!(old = %convert, new = %replacement, %to, "rewrote boolean cast");
    Ok((replacement, added))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_graph::PartialShape;

    #[test]
    fn boolean_rewrite_condition() {
        assert!(needs_boolean_rewrite(ElementType::F32, ElementType::Boolean, ElementType::U8));
        assert!(!needs_boolean_rewrite(ElementType::I32, ElementType::Boolean, ElementType::U8));
        assert!(!needs_boolean_rewrite(ElementType::F32, ElementType::I64, ElementType::I32));
        assert!(!needs_boolean_rewrite(ElementType::F32, ElementType::Boolean, ElementType::F32));
        assert!(needs_boolean_rewrite(ElementType::F16, ElementType::Boolean, ElementType::U32));
        assert!(!needs_boolean_rewrite(ElementType::F32, ElementType::Boolean, ElementType::I8));
    }

    #[test]
    fn fake_quantize_guards_skip_results_and_converts() {
        let mut g = Graph::new("fq");
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[4]));
        let lo = g.add_scalar("lo", ElementType::F32, 0.0).unwrap();
        let hi = g.add_scalar("hi", ElementType::F32, 1.0).unwrap();
        let fq = g
            .add_node("fq", OpKind::FakeQuantize { levels: 256 }, vec![
                x.into(),
                lo.into(),
                hi.into(),
                lo.into(),
                hi.into(),
            ])
            .unwrap();
        g.add_result("out", fq.into()).unwrap();
        let relu = g.add_node("relu", OpKind::Relu, vec![fq.into()]).unwrap();
        g.add_node("cvt", OpKind::Convert { destination: ElementType::F16 }, vec![fq.into()]).unwrap();

        let inserted = fuse_fake_quantize(&mut g, fq, ElementType::F32, ElementType::F16, |_| false).unwrap();
        // five input guards plus one output guard for the Relu
        assert_eq!(inserted, 6);
        let relu_src = g.producer(InputRef::new(relu, 0)).unwrap();
        assert_eq!(g.node(relu_src.node).unwrap().op, OpKind::Convert { destination: ElementType::F16 });
        assert!(g.node(fq).unwrap().rt.keep_precision);
    }

    #[test]
    fn consumers_staying_in_source_type_get_no_output_guard() {
        let mut g = Graph::new("fq");
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[4]));
        let lo = g.add_scalar("lo", ElementType::F32, 0.0).unwrap();
        let hi = g.add_scalar("hi", ElementType::F32, 1.0).unwrap();
        let fq = g
            .add_node("fq", OpKind::FakeQuantize { levels: 256 }, vec![
                x.into(),
                lo.into(),
                hi.into(),
                lo.into(),
                hi.into(),
            ])
            .unwrap();
        let sm = g.add_node("sm", OpKind::Softmax { axis: -1 }, vec![fq.into()]).unwrap();
        let relu = g.add_node("relu", OpKind::Relu, vec![fq.into()]).unwrap();

        let inserted = fuse_fake_quantize(&mut g, fq, ElementType::F32, ElementType::F16, |n| {
            matches!(n.op, OpKind::Softmax { .. })
        })
        .unwrap();
        assert_eq!(inserted, 6);
        assert_eq!(g.producer(InputRef::new(sm, 0)).unwrap().node, fq);
        assert_ne!(g.producer(InputRef::new(relu, 0)).unwrap().node, fq);
    }
}
