pub mod dax;
pub mod html;

use crate::workflow::{NodeId, Workflow};
use crate::workflow::file::FileList;

use serde::Serialize;
use std::collections::BTreeMap;

pub use html::render_workflow_report;

#[derive(Debug, Clone, Serialize)]
pub struct ReportTotals {
    pub nodes: usize,
    pub edges: usize,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportNode {
    pub label: String,
    pub job: String,
    pub executable: String,
    pub args: Vec<String>,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportFile {
    pub name: String,
    pub tags: String,
    pub path: String,
}

/// Everything the workflow report page shows, keyed by node name.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub title: String,
    pub totals: ReportTotals,
    pub roots: Vec<String>,
    pub nodes: BTreeMap<String, ReportNode>,
    pub files: Vec<ReportFile>,
}

pub fn build_workflow_report(title: &str, wf: &Workflow, files: &FileList) -> WorkflowReport {
    let names = |ids: Vec<NodeId>| -> Vec<String> { ids.iter().map(|id| id.to_string()).collect() };

    let nodes = wf
        .nodes()
        .map(|(id, n)| {
            (
                id.to_string(),
                ReportNode {
                    label: n.label(),
                    job: n.job.clone(),
                    executable: n.executable.clone(),
                    args: n.argument_list(),
                    parents: names(wf.parents(id)),
                    children: names(wf.children(id)),
                    inputs: n.inputs.iter().map(|f| f.name()).collect(),
                    outputs: n.outputs.iter().map(|f| f.name()).collect(),
                },
            )
        })
        .collect();

    WorkflowReport {
        title: title.to_string(),
        totals: ReportTotals {
            nodes: wf.len(),
            edges: wf.edges().count(),
            files: files.len(),
        },
        roots: names(wf.roots()),
        nodes,
        files: files
            .iter()
            .map(|f| ReportFile {
                name: f.name(),
                tags: f.tag_str(),
                path: f.path.display().to_string(),
            })
            .collect(),
    }
}
