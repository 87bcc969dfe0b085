//! Diagnostic dump of a framework's current node/edge set in GraphViz DOT
//! form. Renders whatever is present at call time, including dynamically
//! spawned nodes left over from the latest run. Read-only and deterministic:
//! dumping an unmodified graph twice yields identical output. Must not race
//! an active run against the same graph (read-without-synchronization
//! contract on the counters it ignores).

use std::fmt::Write as FmtWrite;

use petgraph::Direction;

use crate::flow::framework::Framework;
use crate::flow::node::Work;

impl Framework {
    /// Render the current graph as a DOT digraph.
    pub fn dump(&self) -> String {
        let graph = self.graph_arc();
        let nodes = graph.read();

        let mut dot = String::from("digraph taskflow {\n");
        dot.push_str("  graph [rankdir=LR, nodesep=0.5];\n");
        dot.push_str("  node [shape=box, style=rounded, fontname=\"Helvetica\"];\n");
        if let Some(name) = graph.name() {
            dot.push_str(&format!("  label=\"{}\";\n", escape(&name)));
        }
        dot.push('\n');

        let mut indices: Vec<_> = nodes.node_indices().collect();
        indices.sort();

        for &idx in &indices {
            let slot = &nodes[idx];
            let label = escape(&slot.label(idx));
            let attrs = match &slot.work {
                Work::Placeholder => format!("label=\"{label}\", style=\"rounded,dashed\""),
                Work::Static(_) => format!("label=\"{label}\""),
                Work::Subflow(_) => format!("label=\"{label}\", shape=component"),
                Work::Module(target) => format!(
                    "label=\"{label} [{}]\", shape=box3d",
                    escape(&target.label())
                ),
            };
            dot.push_str(&format!("  n{} [{}];\n", idx.index(), attrs));
        }

        dot.push('\n');
        for &idx in &indices {
            let mut successors: Vec<_> = nodes
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            successors.sort();
            for succ in successors {
                dot.push_str(&format!("  n{} -> n{};\n", idx.index(), succ.index()));
            }
        }

        dot.push_str("}\n");
        dot
    }

    /// Render the current graph into `sink`.
    pub fn dump_into<W: FmtWrite>(&self, sink: &mut W) -> std::fmt::Result {
        sink.write_str(&self.dump())
    }
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}
