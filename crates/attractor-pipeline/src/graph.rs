use std::collections::HashMap;
use std::time::Duration;

use attractor_dot::{AttributeValue, DotGraph, EdgeDef, NodeDef};

#[derive(Debug, Clone)]
pub struct PipelineGraph {
    pub name: String,
    pub goal: String,
    pub attrs: HashMap<String, AttributeValue>,
    nodes: HashMap<String, PipelineNode>,
    edges: Vec<PipelineEdge>,
    /// Maps node_id to a range (start, count) into the sorted `edges` vec.
    /// Edges are sorted by `from` so each node's outgoing edges are contiguous.
    adjacency: HashMap<String, (usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct PipelineNode {
    pub id: String,
    pub label: String,
    pub shape: String,
    pub node_type: Option<String>,
    pub prompt: Option<String>,
    pub max_retries: usize,
    pub goal_gate: bool,
    pub retry_target: Option<String>,
    pub fallback_retry_target: Option<String>,
    pub fidelity: Option<String>,
    pub thread_id: Option<String>,
    pub classes: Vec<String>,
    pub timeout: Option<Duration>,
    pub llm_model: Option<String>,
    pub llm_provider: Option<String>,
    pub reasoning_effort: Option<String>,
    pub auto_status: bool,
    pub allow_partial: bool,
    pub raw_attrs: HashMap<String, AttributeValue>,
}

#[derive(Debug, Clone)]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub condition: Option<String>,
    pub weight: i32,
    pub fidelity: Option<String>,
    pub thread_id: Option<String>,
    pub loop_restart: bool,
}

// --- Attribute extraction helpers ---

fn get_string_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<String> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::String(s) => Some(s.clone()),
        _ => None,
    })
}

fn get_bool_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<bool> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::Boolean(b) => Some(*b),
        AttributeValue::String(s) => Some(s == "true"),
        _ => None,
    })
}

fn get_int_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::Integer(i) => Some(*i),
        _ => None,
    })
}

fn get_duration_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<Duration> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::Duration(d) => Some(*d),
        _ => None,
    })
}

// --- Conversions ---

fn node_def_to_pipeline_node(
    id: &str,
    node_def: &NodeDef,
    graph_defaults: &HashMap<String, AttributeValue>,
    subgraph_defaults: Option<&HashMap<String, AttributeValue>>,
) -> PipelineNode {
    // Layer defaults: graph-level, then subgraph-level, then explicit node attrs
    let mut attrs = graph_defaults.clone();
    if let Some(sg_defaults) = subgraph_defaults {
        attrs.extend(sg_defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    attrs.extend(node_def.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    let shape = get_string_attr(&attrs, "shape").unwrap_or_else(|| "box".to_string());
    let label = get_string_attr(&attrs, "label").unwrap_or_else(|| id.to_string());
    let node_type = get_string_attr(&attrs, "type");
    let prompt = get_string_attr(&attrs, "prompt");
    let max_retries = get_int_attr(&attrs, "max_retries")
        .map(|v| v as usize)
        .unwrap_or(0);
    let goal_gate = get_bool_attr(&attrs, "goal_gate").unwrap_or(false);
    let retry_target = get_string_attr(&attrs, "retry_target");
    let fallback_retry_target = get_string_attr(&attrs, "fallback_retry_target");
    let fidelity = get_string_attr(&attrs, "fidelity");
    let thread_id = get_string_attr(&attrs, "thread_id");
    let classes = get_string_attr(&attrs, "class")
        .map(|s| s.split_whitespace().map(String::from).collect())
        .unwrap_or_default();
    let timeout = get_duration_attr(&attrs, "timeout");
    let llm_model = get_string_attr(&attrs, "llm_model");
    let llm_provider = get_string_attr(&attrs, "llm_provider");
    let reasoning_effort = get_string_attr(&attrs, "reasoning_effort");
    let auto_status = get_bool_attr(&attrs, "auto_status").unwrap_or(true);
    let allow_partial = get_bool_attr(&attrs, "allow_partial").unwrap_or(false);

    PipelineNode {
        id: id.to_string(),
        label,
        shape,
        node_type,
        prompt,
        max_retries,
        goal_gate,
        retry_target,
        fallback_retry_target,
        fidelity,
        thread_id,
        classes,
        timeout,
        llm_model,
        llm_provider,
        reasoning_effort,
        auto_status,
        allow_partial,
        raw_attrs: attrs,
    }
}

fn edge_def_to_pipeline_edge(
    edge_def: &EdgeDef,
    edge_defaults: &HashMap<String, AttributeValue>,
) -> PipelineEdge {
    let mut attrs = edge_defaults.clone();
    attrs.extend(edge_def.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    PipelineEdge {
        from: edge_def.from.clone(),
        to: edge_def.to.clone(),
        label: get_string_attr(&attrs, "label"),
        condition: get_string_attr(&attrs, "condition"),
        weight: get_int_attr(&attrs, "weight").map(|v| v as i32).unwrap_or(0),
        fidelity: get_string_attr(&attrs, "fidelity"),
        thread_id: get_string_attr(&attrs, "thread_id"),
        loop_restart: get_bool_attr(&attrs, "loop_restart").unwrap_or(false),
    }
}

/// Sort edges by `from` and build the (start, count) adjacency index used by
/// [`PipelineGraph::outgoing_edges`].
fn build_adjacency(edges: &mut Vec<PipelineEdge>) -> HashMap<String, (usize, usize)> {
    edges.sort_by(|a, b| a.from.cmp(&b.from));
    let mut adjacency: HashMap<String, (usize, usize)> = HashMap::new();
    let mut i = 0;
    while i < edges.len() {
        let start = i;
        let from = &edges[i].from;
        while i < edges.len() && edges[i].from == *from {
            i += 1;
        }
        adjacency.insert(from.clone(), (start, i - start));
    }
    adjacency
}

impl PipelineGraph {
    pub fn from_dot(graph: DotGraph) -> attractor_types::Result<Self> {
        let mut nodes = HashMap::new();
        let mut all_edges = Vec::new();

        // Collect top-level nodes with graph-level defaults
        for (id, node_def) in &graph.nodes {
            let pn = node_def_to_pipeline_node(id, node_def, &graph.node_defaults, None);
            nodes.insert(id.clone(), pn);
        }

        // Collect subgraph nodes (with subgraph-level defaults layered on top)
        for sg in &graph.subgraphs {
            for (id, node_def) in &sg.nodes {
                let pn = node_def_to_pipeline_node(
                    id,
                    node_def,
                    &graph.node_defaults,
                    Some(&sg.node_defaults),
                );
                nodes.insert(id.clone(), pn);
            }
        }

        // Collect top-level edges
        for edge_def in &graph.edges {
            all_edges.push(edge_def_to_pipeline_edge(edge_def, &graph.edge_defaults));
        }

        // Collect subgraph edges
        for sg in &graph.subgraphs {
            let mut sg_edge_defaults = graph.edge_defaults.clone();
            sg_edge_defaults.extend(sg.edge_defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
            for edge_def in &sg.edges {
                all_edges.push(edge_def_to_pipeline_edge(edge_def, &sg_edge_defaults));
            }
        }

        let adjacency = build_adjacency(&mut all_edges);
        let goal = get_string_attr(&graph.attrs, "goal").unwrap_or_default();

        Ok(PipelineGraph {
            name: graph.name,
            goal,
            attrs: graph.attrs,
            nodes,
            edges: all_edges,
            adjacency,
        })
    }

    /// Build a graph directly from already-constructed nodes and edges,
    /// bypassing the DOT front-end. Used by the declarative workflow loader.
    pub fn from_parts(
        name: String,
        goal: String,
        attrs: HashMap<String, AttributeValue>,
        nodes: Vec<PipelineNode>,
        mut edges: Vec<PipelineEdge>,
    ) -> Self {
        let adjacency = build_adjacency(&mut edges);
        let nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        PipelineGraph {
            name,
            goal,
            attrs,
            nodes,
            edges,
            adjacency,
        }
    }

    /// Find the start node: shape == "Mdiamond" or id is "start"/"Start".
    pub fn start_node(&self) -> Option<&PipelineNode> {
        self.nodes
            .values()
            .find(|n| n.shape == "Mdiamond")
            .or_else(|| {
                self.nodes
                    .get("start")
                    .or_else(|| self.nodes.get("Start"))
            })
    }

    /// Find the exit node: shape == "Msquare".
    pub fn exit_node(&self) -> Option<&PipelineNode> {
        self.nodes.values().find(|n| n.shape == "Msquare")
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    pub fn outgoing_edges(&self, node_id: &str) -> &[PipelineEdge] {
        match self.adjacency.get(node_id) {
            Some(&(start, count)) => &self.edges[start..start + count],
            None => &[],
        }
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.values()
    }

    pub fn all_nodes_mut(&mut self) -> impl Iterator<Item = &mut PipelineNode> {
        self.nodes.values_mut()
    }

    pub fn all_edges(&self) -> &[PipelineEdge] {
        &self.edges
    }
}
