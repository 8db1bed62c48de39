//! Workflow serialisation: Pegasus DAX (abstract DAG in XML) and a plain
//! JSON dump of the same graph.

use crate::Result;
use crate::diagnostics;
use crate::workflow::Workflow;

use anyhow::Context;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

const DAX_VERSION: &str = "3.6";

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render the workflow as a DAX document.
///
/// Jobs appear in insertion order; each `<child>` lists its parents.
pub fn render_dax(name: &str, wf: &Workflow) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        out,
        "<adag xmlns=\"http://pegasus.isi.edu/schema/DAX\" version=\"{}\" name=\"{}\">",
        DAX_VERSION,
        xml_escape(name)
    );

    for (id, node) in wf.nodes() {
        let _ = writeln!(
            out,
            "  <job id=\"{}\" name=\"{}\" node-label=\"{}\">",
            id,
            xml_escape(&node.job),
            xml_escape(&node.label())
        );
        let _ = writeln!(
            out,
            "    <argument>{}</argument>",
            xml_escape(&node.argument_list().join(" "))
        );
        for f in &node.inputs {
            let _ = writeln!(
                out,
                "    <uses name=\"{}\" link=\"input\"/>",
                xml_escape(&f.name())
            );
        }
        for f in &node.outputs {
            let _ = writeln!(
                out,
                "    <uses name=\"{}\" link=\"output\" transfer=\"true\"/>",
                xml_escape(&f.name())
            );
        }
        out.push_str("  </job>\n");
    }

    for (id, _) in wf.nodes() {
        let parents = wf.parents(id);
        if parents.is_empty() {
            continue;
        }
        let _ = writeln!(out, "  <child ref=\"{}\">", id);
        for p in parents {
            let _ = writeln!(out, "    <parent ref=\"{}\"/>", p);
        }
        out.push_str("  </child>\n");
    }

    out.push_str("</adag>\n");
    out
}

#[derive(Debug, Serialize)]
struct JsonJob {
    id: String,
    job: String,
    executable: String,
    arguments: Vec<String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct JsonWorkflow {
    name: String,
    ifos: String,
    analysis_time: [f64; 2],
    jobs: Vec<JsonJob>,
    edges: Vec<[String; 2]>,
}

pub fn render_workflow_json(name: &str, wf: &Workflow) -> Result<String> {
    let doc = JsonWorkflow {
        name: name.to_string(),
        ifos: wf.ifos.clone(),
        analysis_time: [wf.analysis_time.start(), wf.analysis_time.end()],
        jobs: wf
            .nodes()
            .map(|(id, n)| JsonJob {
                id: id.to_string(),
                job: n.job.clone(),
                executable: n.executable.clone(),
                arguments: n.argument_list(),
                inputs: n.inputs.iter().map(|f| f.path.display().to_string()).collect(),
                outputs: n.outputs.iter().map(|f| f.path.display().to_string()).collect(),
            })
            .collect(),
        edges: wf
            .edges()
            .map(|(p, c)| [p.to_string(), c.to_string()])
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Validate the graph, then write `<name>.dax` and `<name>.json` into `dir`.
pub fn write_workflow(dir: &Path, name: &str, wf: &Workflow) -> Result<()> {
    wf.validate()?;
    let dax = dir.join(format!("{}.dax", name));
    fs::write(&dax, render_dax(name, wf))
        .with_context(|| diagnostics::error_message(format!("write {}", dax.display())))?;
    let json = dir.join(format!("{}.json", name));
    fs::write(&json, render_workflow_json(name, wf)?)
        .with_context(|| diagnostics::error_message(format!("write {}", json.display())))?;
    log::info!("wrote {} and {}", dax.display(), json.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::segment::Segment;
    use crate::workflow::Node;
    use crate::workflow::file::AnalysisFile;
    use regex::Regex;
    use std::collections::BTreeSet;

    fn sample() -> Workflow {
        let seg = Segment::new(0.0, 10.0).unwrap();
        let mut wf = Workflow::new(Config::default(), seg, "H1L1");
        let file = AnalysisFile::new("H1L1", "a&b", seg, vec![], Path::new("/o"), "xml");

        let mut a = Node::new("combine", "/bin/combine");
        a.add_output(file.clone());
        wf.add_node(a).unwrap();

        let mut b = Node::new("cluster", "/bin/cluster");
        b.add_input_opt("trig-file", &file);
        wf.add_node(b).unwrap();
        wf.add_node(Node::new("lone", "/bin/lone")).unwrap();
        wf
    }

    #[test]
    fn edges_reference_existing_jobs() {
        let dax = render_dax("pp", &sample());
        let jobs: BTreeSet<String> = Regex::new(r#"<job id="(ID\d+)""#)
            .unwrap()
            .captures_iter(&dax)
            .map(|c| c[1].to_string())
            .collect();
        let refs: Vec<String> = Regex::new(r#"(?:child|parent) ref="(ID\d+)""#)
            .unwrap()
            .captures_iter(&dax)
            .map(|c| c[1].to_string())
            .collect();
        assert_eq!(jobs.len(), 3);
        assert_eq!(refs, vec!["ID000001", "ID000000"]);
        assert!(refs.iter().all(|r| jobs.contains(r)));
    }

    #[test]
    fn names_are_escaped() {
        let dax = render_dax("pp", &sample());
        assert!(dax.contains("A&amp;B"));
        assert!(!dax.contains("A&B"));
    }

    #[test]
    fn writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        write_workflow(dir.path(), "pp", &sample()).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("pp.json")).unwrap()).unwrap();
        assert_eq!(json["jobs"].as_array().unwrap().len(), 3);
        assert_eq!(json["edges"][0][0], "ID000000");
        assert!(dir.path().join("pp.dax").exists());
    }
}
