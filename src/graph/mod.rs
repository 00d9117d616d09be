//! Interface topology graph
//!
//! Links OUT interfaces to the IN interfaces that consume them, flags OUT
//! interfaces that bind the same resource, and renders the topology in
//! Graphviz DOT. The graph is a snapshot: it is built from the inventory on
//! demand and does not track later changes.

use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::module::interface::{BindKey, Interface, Transport};
use crate::module::inventory::{Instance, InstanceId, Inventory};
use crate::module::traits::ModuleError;

/// Position of an interface within the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfcRef {
    /// Index of the node
    pub node: usize,
    /// Index within the node's inputs or outputs
    pub index: usize,
}

/// One interface of a graph node
#[derive(Debug, Clone)]
pub struct GraphInterface {
    pub name: String,
    pub transport: Transport,
    /// Messages reported by the instance at snapshot time
    pub messages: u64,
    /// Consumers fed by this interface (outputs only)
    pub children: Vec<IfcRef>,
    /// Producers feeding this interface (inputs only)
    pub producers: Vec<IfcRef>,
}

impl GraphInterface {
    fn from_interface(ifc: &Interface, producer: bool) -> Self {
        Self {
            name: ifc.name.clone(),
            transport: ifc.transport.clone(),
            messages: ifc.stats.messages,
            children: if producer {
                Vec::with_capacity(ifc.children_capacity())
            } else {
                Vec::new()
            },
            producers: Vec::new(),
        }
    }
}

/// One instance in the graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub instance: InstanceId,
    pub name: String,
    pub module: String,
    pub running: bool,
    pub inputs: Vec<GraphInterface>,
    pub outputs: Vec<GraphInterface>,
}

/// Two OUT interfaces binding the same port or socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateBind {
    pub key: BindKey,
    pub first: IfcRef,
    pub second: IfcRef,
}

/// Producer/consumer graph over instance interfaces
#[derive(Debug, Clone, Default)]
pub struct InterfaceGraph {
    nodes: Vec<GraphNode>,
}

impl InterfaceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph of every instance in inventory order
    pub fn build(inv: &Inventory) -> Self {
        let mut graph = Self::new();
        for instance in inv.instances() {
            graph.insert(instance);
        }
        for dup in graph.duplicate_binds() {
            warn!(
                "Instances {} and {} both bind {}",
                graph.nodes[dup.first.node].name, graph.nodes[dup.second.node].name, dup.key
            );
        }
        debug!(
            "Interface graph: {} nodes, {} links",
            graph.nodes.len(),
            graph.link_count()
        );
        graph
    }

    /// Add an instance and link it with the nodes already present
    ///
    /// Returns the index of the new node.
    pub fn insert(&mut self, instance: &Instance) -> usize {
        let node = GraphNode {
            instance: instance.id(),
            name: instance.name.clone(),
            module: instance.module.clone(),
            running: instance.running,
            inputs: instance
                .inputs
                .iter()
                .map(|i| GraphInterface::from_interface(i, false))
                .collect(),
            outputs: instance
                .outputs
                .iter()
                .map(|i| GraphInterface::from_interface(i, true))
                .collect(),
        };
        let new = self.nodes.len();
        self.nodes.push(node);

        let mut links = Vec::new();
        for existing in 0..new {
            // Existing producers feeding the new node
            for (out_idx, out) in self.nodes[existing].outputs.iter().enumerate() {
                for (in_idx, input) in self.nodes[new].inputs.iter().enumerate() {
                    if connects(&out.transport, &input.transport) {
                        links.push((
                            IfcRef { node: existing, index: out_idx },
                            IfcRef { node: new, index: in_idx },
                        ));
                    }
                }
            }
            // The new node feeding existing consumers
            for (out_idx, out) in self.nodes[new].outputs.iter().enumerate() {
                for (in_idx, input) in self.nodes[existing].inputs.iter().enumerate() {
                    if connects(&out.transport, &input.transport) {
                        links.push((
                            IfcRef { node: new, index: out_idx },
                            IfcRef { node: existing, index: in_idx },
                        ));
                    }
                }
            }
        }

        for (producer, consumer) in links {
            self.nodes[producer.node].outputs[producer.index]
                .children
                .push(consumer);
            self.nodes[consumer.node].inputs[consumer.index]
                .producers
                .push(producer);
        }
        new
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node_by_name(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn output(&self, at: IfcRef) -> Option<&GraphInterface> {
        self.nodes.get(at.node)?.outputs.get(at.index)
    }

    pub fn input(&self, at: IfcRef) -> Option<&GraphInterface> {
        self.nodes.get(at.node)?.inputs.get(at.index)
    }

    /// Number of producer to consumer links
    pub fn link_count(&self) -> usize {
        self.nodes
            .iter()
            .flat_map(|n| n.outputs.iter())
            .map(|o| o.children.len())
            .sum()
    }

    /// Every pair of distinct OUT interfaces binding the same resource
    pub fn duplicate_binds(&self) -> Vec<DuplicateBind> {
        let outputs: Vec<(IfcRef, BindKey)> = self
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(node, n)| {
                n.outputs.iter().enumerate().filter_map(move |(index, o)| {
                    o.transport
                        .bind_key()
                        .map(|key| (IfcRef { node, index }, key))
                })
            })
            .collect();

        let mut duplicates = Vec::new();
        for (i, (first, key)) in outputs.iter().enumerate() {
            for (second, other) in &outputs[i + 1..] {
                if key == other {
                    duplicates.push(DuplicateBind {
                        key: key.clone(),
                        first: *first,
                        second: *second,
                    });
                }
            }
        }
        duplicates
    }

    /// Graphviz DOT rendering: one cluster per instance, edges labelled with counters
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph G {\n\trankdir=LR;\n");
        for (n, node) in self.nodes.iter().enumerate() {
            let _ = writeln!(dot, "\tsubgraph cluster_{} {{", n);
            let _ = writeln!(
                dot,
                "\t\tlabel=\"{} ({})\";\n\t\tstyle=filled;\n\t\tcolor={};\n\t\tnode[style=filled,color=white];",
                escape(&node.name),
                escape(&node.module),
                if node.running { "grey" } else { "lightpink" }
            );
            for (i, ifc) in node.inputs.iter().enumerate() {
                let _ = writeln!(
                    dot,
                    "\t\t{} [label=\"IN {}\\n{}\"];",
                    input_id(n, i),
                    escape(&ifc.name),
                    escape(&ifc.transport.cli_arg())
                );
            }
            for (i, ifc) in node.outputs.iter().enumerate() {
                let _ = writeln!(
                    dot,
                    "\t\t{} [label=\"OUT {}\\n{}\"];",
                    output_id(n, i),
                    escape(&ifc.name),
                    escape(&ifc.transport.cli_arg())
                );
            }
            dot.push_str("\t}\n");
        }

        for (n, node) in self.nodes.iter().enumerate() {
            for (o, out) in node.outputs.iter().enumerate() {
                for child in &out.children {
                    let recv = self.input(*child).map_or(0, |i| i.messages);
                    let _ = writeln!(
                        dot,
                        "\t{} -> {} [color=red, label=\"send:{}\\nrecv:{}\"];",
                        output_id(n, o),
                        input_id(child.node, child.index),
                        out.messages,
                        recv
                    );
                }
            }
        }
        dot.push_str("}\n");
        dot
    }

    /// Write the DOT rendering to a file
    pub fn write_dot(&self, path: &Path) -> Result<(), ModuleError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_dot())?;
        info!("Interface graph written to {}", path.display());
        Ok(())
    }
}

fn connects(output: &Transport, input: &Transport) -> bool {
    match (output.link_key(), input.link_key()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn input_id(node: usize, index: usize) -> String {
    format!("n{}_in{}", node, index)
}

fn output_id(node: usize, index: usize) -> String {
    format!("n{}_out{}", node, index)
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
