//! Workflow graph: job nodes and the dependencies between them.
//!
//! Nodes are numbered in insertion order. An edge may only point from an
//! earlier node to a later one, so the graph is acyclic by construction;
//! `validate` re-checks that before anything is written out.

pub mod file;
pub mod jobs;
pub mod postproc;
pub mod split;

use crate::Result;
use crate::config::Config;
use crate::diagnostics;
use crate::segment::Segment;

use anyhow::{Context, bail};
use file::AnalysisFile;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID{:06}", self.0)
    }
}

/// One invocation of an external executable.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    /// Job name, e.g. `trig_combiner`.
    pub job: String,
    pub executable: String,
    pub args: Vec<String>,
    /// `--name value` pairs; `None` values are bare flags.
    pub options: Vec<(String, Option<String>)>,
    pub inputs: Vec<AnalysisFile>,
    pub outputs: Vec<AnalysisFile>,
    pub tags: Vec<String>,
}

impl Node {
    pub fn new(job: &str, executable: &str) -> Self {
        Node {
            job: job.to_string(),
            executable: executable.to_string(),
            args: Vec::new(),
            options: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn add_opt(&mut self, name: &str, value: impl Into<String>) {
        self.options.push((name.to_string(), Some(value.into())));
    }

    pub fn add_flag(&mut self, name: &str) {
        self.options.push((name.to_string(), None));
    }

    pub fn add_input_opt(&mut self, name: &str, file: &AnalysisFile) {
        self.add_opt(name, file.path.display().to_string());
        self.inputs.push(file.clone());
    }

    pub fn add_output(&mut self, file: AnalysisFile) {
        self.outputs.push(file);
    }

    /// Arguments after the executable, options following positional args.
    pub fn argument_list(&self) -> Vec<String> {
        let mut out = self.args.clone();
        for (name, value) in &self.options {
            out.push(format!("--{}", name));
            if let Some(v) = value {
                if !v.is_empty() {
                    out.push(v.clone());
                }
            }
        }
        out
    }

    /// Human-readable node label.
    pub fn label(&self) -> String {
        if self.tags.is_empty() {
            self.job.clone()
        } else {
            format!("{}_{}", self.job, self.tags.join("_"))
        }
    }
}

/// The graph under construction plus the context every job needs.
#[derive(Debug)]
pub struct Workflow {
    pub cp: Config,
    pub analysis_time: Segment,
    pub ifos: String,
    nodes: Vec<Node>,
    edges: BTreeSet<(NodeId, NodeId)>,
    producers: BTreeMap<PathBuf, NodeId>,
}

impl Workflow {
    pub fn new(cp: Config, analysis_time: Segment, ifos: &str) -> Self {
        Workflow {
            cp,
            analysis_time,
            ifos: ifos.to_string(),
            nodes: Vec::new(),
            edges: BTreeSet::new(),
            producers: BTreeMap::new(),
        }
    }

    /// Register a node. Edges from the producers of its inputs are added.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        let id = NodeId(self.nodes.len() as u32);

        for out in &node.outputs {
            if let Some(prev) = self.producers.get(&out.path) {
                bail!(
                    "{}",
                    diagnostics::error_message(format!(
                        "{} is produced by both {} and {}",
                        out.path.display(),
                        prev,
                        id
                    ))
                );
            }
        }

        let parents: BTreeSet<NodeId> = node
            .inputs
            .iter()
            .filter_map(|f| self.producers.get(&f.path).copied())
            .collect();
        for out in &node.outputs {
            self.producers.insert(out.path.clone(), id);
        }

        log::debug!("add node {} {}", id, node.label());
        self.nodes.push(node);
        for p in parents {
            self.add_dependency(p, id)?;
        }
        Ok(id)
    }

    /// Declare that `child` must run after `parent`.
    pub fn add_dependency(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let n = self.nodes.len() as u32;
        if parent.0 >= n || child.0 >= n {
            bail!(
                "{}",
                diagnostics::error_message(format!(
                    "dependency {} -> {} references a node not in the workflow",
                    parent, child
                ))
            );
        }
        if parent >= child {
            bail!(
                "{}",
                diagnostics::error_message(format!(
                    "dependency {} -> {} points backwards; parents must be added first",
                    parent, child
                ))
            );
        }
        self.edges.insert((parent, child));
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = &(NodeId, NodeId)> {
        self.edges.iter()
    }

    pub fn has_edge(&self, parent: NodeId, child: NodeId) -> bool {
        self.edges.contains(&(parent, child))
    }

    pub fn parents(&self, child: NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|(_, c)| *c == child)
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|(p, _)| *p == parent)
            .map(|(_, c)| *c)
            .collect()
    }

    /// Nodes with no parents.
    pub fn roots(&self) -> Vec<NodeId> {
        let with_parents: BTreeSet<NodeId> = self.edges.iter().map(|(_, c)| *c).collect();
        self.nodes()
            .map(|(id, _)| id)
            .filter(|id| !with_parents.contains(id))
            .collect()
    }

    pub fn nodes_for_job<'a>(&'a self, job: &'a str) -> impl Iterator<Item = (NodeId, &'a Node)> + 'a {
        self.nodes().filter(move |(_, n)| n.job == job)
    }

    /// Check the graph is acyclic (DFS colouring from every root).
    pub fn validate(&self) -> Result<()> {
        #[derive(Copy, Clone, PartialEq, Eq)]
        enum Mark {
            Temp,
            Perm,
        }

        fn dfs(
            v: NodeId,
            wf: &Workflow,
            marks: &mut BTreeMap<NodeId, Mark>,
            stack: &mut Vec<NodeId>,
        ) -> Result<()> {
            if let Some(Mark::Perm) = marks.get(&v) {
                return Ok(());
            }
            if let Some(Mark::Temp) = marks.get(&v) {
                stack.push(v);
                let path: Vec<String> = stack.iter().map(|id| id.to_string()).collect();
                bail!(
                    "{}",
                    diagnostics::error_message(format!("cycle detected: {}", path.join(" -> ")))
                );
            }

            marks.insert(v, Mark::Temp);
            stack.push(v);
            for k in wf.children(v) {
                dfs(k, wf, marks, stack)?;
            }
            stack.pop();
            marks.insert(v, Mark::Perm);
            Ok(())
        }

        let roots = self.roots();
        if roots.is_empty() && !self.nodes.is_empty() {
            bail!(
                "{}",
                diagnostics::error_message("no roots found (graph may contain a cycle)")
            );
        }

        let mut marks = BTreeMap::<NodeId, Mark>::new();
        let mut stack = Vec::<NodeId>::new();
        for r in roots {
            stack.clear();
            dfs(r, self, &mut marks, &mut stack)
                .with_context(|| diagnostics::error_message(format!("cycle check failed starting at {}", r)))?;
        }
        if marks.len() != self.nodes.len() {
            bail!(
                "{}",
                diagnostics::error_message("some nodes are unreachable from any root")
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn wf() -> Workflow {
        Workflow::new(Config::default(), Segment::new(0.0, 100.0).unwrap(), "H1L1")
    }

    fn out(name: &str) -> AnalysisFile {
        AnalysisFile::new(
            "H1L1",
            name,
            Segment::new(0.0, 100.0).unwrap(),
            vec![],
            Path::new("/out"),
            "xml",
        )
    }

    #[test]
    fn inputs_link_to_their_producers() {
        let mut wf = wf();
        let mut a = Node::new("a", "/bin/a");
        a.add_output(out("first"));
        let a = wf.add_node(a).unwrap();

        let mut b = Node::new("b", "/bin/b");
        b.add_input_opt("input", &out("first"));
        b.add_input_opt("other", &out("external"));
        let b = wf.add_node(b).unwrap();

        assert!(wf.has_edge(a, b));
        assert_eq!(wf.parents(b), vec![a]);
        assert_eq!(wf.roots(), vec![a]);
        wf.validate().unwrap();
    }

    #[test]
    fn backwards_and_dangling_edges_are_rejected() {
        let mut wf = wf();
        let a = wf.add_node(Node::new("a", "/bin/a")).unwrap();
        let b = wf.add_node(Node::new("b", "/bin/b")).unwrap();
        assert!(wf.add_dependency(b, a).is_err());
        assert!(wf.add_dependency(a, a).is_err());
        assert!(wf.add_dependency(a, NodeId(9)).is_err());
        wf.add_dependency(a, b).unwrap();
        wf.add_dependency(a, b).unwrap();
        assert_eq!(wf.edges().count(), 1);
    }

    #[test]
    fn duplicate_outputs_are_rejected() {
        let mut wf = wf();
        let mut a = Node::new("a", "/bin/a");
        a.add_output(out("same"));
        wf.add_node(a.clone()).unwrap();
        assert!(wf.add_node(a).is_err());
    }

    #[test]
    fn argument_list_puts_flags_after_positionals() {
        let mut n = Node::new("x", "/bin/x");
        n.args.push("pos".into());
        n.add_opt("alpha", "1");
        n.add_flag("verbose");
        n.add_opt("empty", "");
        assert_eq!(
            n.argument_list(),
            vec!["pos", "--alpha", "1", "--verbose", "--empty"]
        );
    }
}
