//! Job classes: one per post-processing executable.
//!
//! Each job resolves its executable from the `[executables]` section and
//! its common options from the section named after the job (plus
//! `<job>-<tag>` sections). `create_node` builds a node bound to concrete
//! input files and returns it together with its declared outputs. Nodes are
//! not added to the workflow here; the assembler does that.

use crate::Result;
use crate::config::Config;
use crate::diagnostics;
use crate::segment::Segment;
use crate::workflow::Node;
use crate::workflow::file::{AnalysisFile, Category, FileList};

use anyhow::bail;
use std::path::{Path, PathBuf};

const TRIGGER_EXT: &str = "xml.gz";

/// Resolved executable plus the options every node of the job carries.
#[derive(Debug, Clone)]
pub struct Executable {
    /// Job name; also the config section holding common options.
    pub name: String,
    pub path: String,
    pub ifos: String,
    pub out_dir: PathBuf,
    pub tags: Vec<String>,
    common_options: Vec<(String, String)>,
}

impl Executable {
    /// `exe_name` is the key under `[executables]`; several jobs may share
    /// one executable (`efficiency` and `inj_efficiency`).
    pub fn new(
        cp: &Config,
        exe_name: &str,
        name: &str,
        ifos: &str,
        out_dir: &Path,
        tags: &[String],
    ) -> Result<Self> {
        let path = cp.get("executables", exe_name)?.to_string();
        if path.is_empty() {
            bail!(
                "{}",
                diagnostics::error_message(format!("executable for {} is empty", exe_name))
            );
        }

        let mut common_options: Vec<(String, String)> = cp
            .items(name)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for tag in tags {
            let section = format!("{}-{}", name, tag.to_lowercase());
            for (k, v) in cp.items(&section) {
                common_options.retain(|(ek, _)| ek != k);
                common_options.push((k.to_string(), v.to_string()));
            }
        }

        Ok(Executable {
            name: name.to_string(),
            path,
            ifos: ifos.to_string(),
            out_dir: out_dir.to_path_buf(),
            tags: tags.to_vec(),
            common_options,
        })
    }

    /// True when the executable is fetched from a remote site at run time.
    pub fn is_remote(&self) -> bool {
        self.path.starts_with("http://") || self.path.starts_with("https://")
    }

    fn base_node(&self, node_tags: &[String]) -> Node {
        let mut node = Node::new(&self.name, &self.path);
        node.tags = self.tags.iter().chain(node_tags).cloned().collect();
        for (k, v) in &self.common_options {
            if v.is_empty() {
                node.add_flag(k);
            } else {
                node.add_opt(k, v.clone());
            }
        }
        node
    }

    /// Output description: base name followed by the job's user tags.
    fn description(&self, base: &str) -> String {
        std::iter::once(base.to_string())
            .chain(self.tags.iter().cloned())
            .collect::<Vec<_>>()
            .join("_")
    }

    fn plot_dir(&self, node: &Node) -> String {
        self.out_dir.join(node.label()).display().to_string()
    }
}

/// Combines per-segment trigger files into one file per category.
#[derive(Debug, Clone)]
pub struct TrigCombinerJob {
    pub exe: Executable,
    pub trigger_name: String,
    pub num_trials: u32,
}

impl TrigCombinerJob {
    pub fn new(cp: &Config, ifos: &str, out_dir: &Path, tags: &[String]) -> Result<Self> {
        Ok(TrigCombinerJob {
            exe: Executable::new(cp, "trig_combiner", "trig_combiner", ifos, out_dir, tags)?,
            trigger_name: cp.get("workflow", "trigger-name")?.to_string(),
            num_trials: cp.get_parsed("trig_combiner", "num-trials")?,
        })
    }

    /// One output per category; zero-lag runs that include OFFSOURCE also
    /// emit the `OFFTRIAL_<n>` files.
    pub fn create_node(
        &self,
        trig_files: &FileList,
        segment_dir: &Path,
        analysis_time: Segment,
        out_tags: &[Category],
        slide_tag: Option<&str>,
        node_tags: &[String],
    ) -> Result<(Node, FileList)> {
        if trig_files.is_empty() {
            bail!(
                "{}",
                diagnostics::error_message("trig_combiner needs at least one input file")
            );
        }

        let mut node = self.exe.base_node(node_tags);
        node.add_opt("ifo-tag", self.exe.ifos.clone());
        node.add_opt("grb-name", self.trigger_name.clone());
        node.add_opt("segment-dir", segment_dir.display().to_string());
        node.add_opt("output-dir", self.exe.out_dir.display().to_string());
        node.add_opt("trig-start-time", format!("{}", analysis_time.start()));
        node.add_opt("trig-end-time", format!("{}", analysis_time.end()));
        if let Some(slide) = slide_tag {
            node.add_opt("slide-tag", slide);
        }
        for f in trig_files {
            node.add_input_opt("input-file", f);
        }

        let mut categories: Vec<Category> = out_tags.to_vec();
        if slide_tag.is_none() && out_tags.contains(&Category::OffSource) {
            categories.extend((1..=self.num_trials).map(Category::OffTrial));
        }

        let description = self.exe.description("INSPIRAL");
        let mut outs = FileList::new();
        for cat in categories {
            let mut tags = vec![format!("GRB{}", self.trigger_name)];
            if let Some(slide) = slide_tag {
                tags.push(slide.to_string());
            }
            tags.extend(node_tags.iter().cloned());
            tags.push(cat.tag());
            let f = AnalysisFile::new(
                &self.exe.ifos,
                &description,
                analysis_time,
                tags,
                &self.exe.out_dir,
                TRIGGER_EXT,
            );
            node.add_output(f.clone());
            outs.push(f);
        }
        Ok((node, outs))
    }
}

/// Clusters one combined trigger file.
#[derive(Debug, Clone)]
pub struct TrigClusterJob {
    pub exe: Executable,
}

impl TrigClusterJob {
    pub fn new(cp: &Config, ifos: &str, out_dir: &Path, tags: &[String]) -> Result<Self> {
        Ok(TrigClusterJob {
            exe: Executable::new(cp, "trig_cluster", "trig_cluster", ifos, out_dir, tags)?,
        })
    }

    /// The clustered file keeps the input's tags.
    pub fn create_node(&self, input: &AnalysisFile) -> (Node, AnalysisFile) {
        let mut node = self.exe.base_node(&[]);
        node.add_input_opt("trig-file", input);
        node.add_opt("output-dir", self.exe.out_dir.display().to_string());

        let out = AnalysisFile::new(
            &input.ifos,
            &format!("{}_CLUSTERED", input.description),
            input.segment,
            input.tags.clone(),
            &self.exe.out_dir,
            TRIGGER_EXT,
        );
        node.add_output(out.clone());
        (node, out)
    }
}

/// Matches injection definitions against injection-run triggers.
#[derive(Debug, Clone)]
pub struct InjFinderJob {
    pub exe: Executable,
}

impl InjFinderJob {
    pub fn new(cp: &Config, ifos: &str, out_dir: &Path, tags: &[String]) -> Result<Self> {
        Ok(InjFinderJob {
            exe: Executable::new(cp, "injfinder", "injfinder", ifos, out_dir, tags)?,
        })
    }

    /// Outputs `<inj_tag>_FOUND` then `<inj_tag>_MISSED`.
    pub fn create_node(
        &self,
        triggers: &FileList,
        injections: &FileList,
        segment_dir: &Path,
        inj_tag: &str,
        segment: Segment,
    ) -> Result<(Node, FileList)> {
        if triggers.is_empty() || injections.is_empty() {
            bail!(
                "{}",
                diagnostics::error_message(format!(
                    "injection set {} needs trigger and injection files ({} and {} found)",
                    inj_tag,
                    triggers.len(),
                    injections.len()
                ))
            );
        }

        let mut node = self.exe.base_node(&[inj_tag.to_string()]);
        node.add_opt("segment-dir", segment_dir.display().to_string());
        node.add_opt("output-dir", self.exe.out_dir.display().to_string());
        node.add_opt("inj-tag", inj_tag);
        for f in triggers {
            node.add_input_opt("trig-file", f);
        }
        for f in injections {
            node.add_input_opt("inj-file", f);
        }

        let description = self.exe.description("INJFINDER");
        let mut outs = FileList::new();
        for kind in ["FOUND", "MISSED"] {
            let f = AnalysisFile::new(
                &self.exe.ifos,
                &description,
                segment,
                vec![inj_tag.to_string(), kind.to_string()],
                &self.exe.out_dir,
                TRIGGER_EXT,
            );
            node.add_output(f.clone());
            outs.push(f);
        }
        Ok((node, outs))
    }
}

/// Merges found/missed injections of one set, filtering by inclination.
#[derive(Debug, Clone)]
pub struct InjCombinerJob {
    pub exe: Executable,
}

impl InjCombinerJob {
    pub fn new(cp: &Config, ifos: &str, out_dir: &Path, tags: &[String]) -> Result<Self> {
        Ok(InjCombinerJob {
            exe: Executable::new(cp, "injcombiner", "injcombiner", ifos, out_dir, tags)?,
        })
    }

    /// Tag carried by this combiner's outputs: the injection string up to
    /// the first occurrence of `max_inc`, then `_FILTERED_<max_inc>`.
    pub fn out_tag(inj_str: &str, max_inc: &str) -> Result<String> {
        if max_inc.is_empty() {
            bail!(
                "{}",
                diagnostics::error_message(format!("empty max-inc for injection set {}", inj_str))
            );
        }
        let prefix = inj_str.split(max_inc).next().unwrap_or(inj_str);
        Ok(format!("{}_FILTERED_{}", prefix, max_inc))
    }

    pub fn create_node(
        &self,
        fm_cache: &AnalysisFile,
        inputs: &FileList,
        inj_str: &str,
        max_inc: &str,
        analysis_time: Segment,
    ) -> Result<(Node, FileList)> {
        let out_tag = Self::out_tag(inj_str, max_inc)?;

        let mut node = self.exe.base_node(&[out_tag.clone()]);
        node.add_input_opt("inj-cache", fm_cache);
        node.add_opt("inj-string", inj_str);
        node.add_opt("max-inclination", max_inc);
        node.add_opt("output-dir", self.exe.out_dir.display().to_string());
        for f in inputs {
            node.inputs.push(f.clone());
        }

        let description = self.exe.description("INJCOMBINER");
        let mut outs = FileList::new();
        for kind in ["FOUND", "MISSED"] {
            let f = AnalysisFile::new(
                &self.exe.ifos,
                &description,
                analysis_time,
                vec![out_tag.clone(), kind.to_string()],
                &self.exe.out_dir,
                TRIGGER_EXT,
            );
            node.add_output(f.clone());
            outs.push(f);
        }
        Ok((node, outs))
    }
}

/// On-source vs off-source efficiency; with found/missed files it becomes
/// the injection efficiency job.
#[derive(Debug, Clone)]
pub struct EfficiencyJob {
    pub exe: Executable,
}

impl EfficiencyJob {
    pub fn new(cp: &Config, name: &str, ifos: &str, out_dir: &Path, tags: &[String]) -> Result<Self> {
        Ok(EfficiencyJob {
            exe: Executable::new(cp, "efficiency", name, ifos, out_dir, tags)?,
        })
    }

    pub fn create_node(
        &self,
        onsource: &AnalysisFile,
        offsource: &AnalysisFile,
        segment_dir: &Path,
        tags: &[String],
    ) -> Node {
        let mut node = self.exe.base_node(tags);
        node.add_input_opt("onsource-file", onsource);
        node.add_input_opt("offsource-file", offsource);
        node.add_opt("segment-dir", segment_dir.display().to_string());
        let out = self.exe.plot_dir(&node);
        node.add_opt("output-path", out);
        node
    }

    pub fn create_inj_node(
        &self,
        onsource: &AnalysisFile,
        offsource: &AnalysisFile,
        segment_dir: &Path,
        found: &AnalysisFile,
        missed: &AnalysisFile,
        tags: &[String],
    ) -> Node {
        let mut node = self.create_node(onsource, offsource, segment_dir, tags);
        node.add_input_opt("found-file", found);
        node.add_input_opt("missed-file", missed);
        node
    }
}

/// Signal-based-veto plots for one clustered trigger file.
#[derive(Debug, Clone)]
pub struct SbvPlotterJob {
    pub exe: Executable,
}

impl SbvPlotterJob {
    pub fn new(cp: &Config, ifos: &str, out_dir: &Path, tags: &[String]) -> Result<Self> {
        Ok(SbvPlotterJob {
            exe: Executable::new(cp, "sbv_plotter", "sbv_plotter", ifos, out_dir, tags)?,
        })
    }

    pub fn create_node(
        &self,
        trig_file: &AnalysisFile,
        segment_dir: &Path,
        inj_file: Option<&AnalysisFile>,
        tags: &[String],
    ) -> Node {
        let mut node = self.exe.base_node(tags);
        node.add_input_opt("trig-file", trig_file);
        node.add_opt("segment-dir", segment_dir.display().to_string());
        if let Some(inj) = inj_file {
            node.add_input_opt("found-file", inj);
        }
        let out = self.exe.plot_dir(&node);
        node.add_opt("output-path", out);
        node
    }
}

/// Arguments of the terminal summary-page job.
#[derive(Debug, Clone, Default)]
pub struct SummaryInputs<'a> {
    pub config_file: Option<&'a Path>,
    pub tuning_tags: Vec<String>,
    pub exclusion_tags: Vec<String>,
    pub segments_plot: Option<&'a Path>,
    pub html_dir: Option<&'a Path>,
    pub time_slides: bool,
}

/// Builds the results web page from every other job's output.
#[derive(Debug, Clone)]
pub struct HtmlSummaryJob {
    pub exe: Executable,
    pub trigger_name: String,
}

impl HtmlSummaryJob {
    pub fn new(cp: &Config, ifos: &str, out_dir: &Path, tags: &[String]) -> Result<Self> {
        Ok(HtmlSummaryJob {
            exe: Executable::new(cp, "html_summary", "html_summary", ifos, out_dir, tags)?,
            trigger_name: cp.get("workflow", "trigger-name")?.to_string(),
        })
    }

    pub fn create_node(&self, inputs: &SummaryInputs<'_>) -> Node {
        let mut node = self.exe.base_node(&[]);
        node.add_opt("grb-name", self.trigger_name.clone());
        node.add_opt("ifo-tag", self.exe.ifos.clone());
        node.add_opt("output-path", self.exe.out_dir.display().to_string());
        if let Some(c) = inputs.config_file {
            node.add_opt("config-file", c.display().to_string());
        }
        if !inputs.tuning_tags.is_empty() {
            node.add_opt("tuning-injection-tags", inputs.tuning_tags.join(" "));
        }
        if !inputs.exclusion_tags.is_empty() {
            node.add_opt("exclusion-injection-tags", inputs.exclusion_tags.join(" "));
        }
        if let Some(p) = inputs.segments_plot {
            node.add_opt("segment-plot-file", p.display().to_string());
        }
        if let Some(h) = inputs.html_dir {
            node.add_opt("html-dir", h.display().to_string());
        }
        if inputs.time_slides {
            node.add_flag("time-slides");
        }
        node
    }
}
