//! Coherent post-processing stage.
//!
//! Builds the combine -> cluster -> plot/efficiency graph for one
//! gravitational-wave trigger, with optional two-stage clustering, short
//! time slides and injection sets, and ends in a single summary-page node.

use crate::Result;
use crate::cache::entry::{CacheEntry, write_cache_file};
use crate::diagnostics;
use crate::manifest::Manifest;
use crate::workflow::file::{AnalysisFile, Category, FileList};
use crate::workflow::jobs::{
    EfficiencyJob, Executable, HtmlSummaryJob, InjCombinerJob, InjFinderJob, SbvPlotterJob,
    SummaryInputs, TrigClusterJob, TrigCombinerJob,
};
use crate::workflow::split::balanced_chunks;
use crate::workflow::{Node, NodeId, Workflow};

use anyhow::{Context, anyhow, bail};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const METHODS: [&str; 3] = ["COH_PTF_WORKFLOW", "COH_PTF_OFFLINE", "COH_PTF_ONLINE"];

const OPEN_BOX_SCRIPT: &str = "open_the_box.sh";

#[derive(Debug)]
pub struct PostProcOutput {
    /// Combiner, injection and clustered outputs, plus the found/missed cache.
    pub files: FileList,
    /// Off-source file every efficiency job compares against.
    pub reference: AnalysisFile,
    pub summary_node: NodeId,
    pub open_box_script: PathBuf,
}

/// Dispatch on `[workflow-postproc] postproc-method`.
pub fn setup_post_processing(wf: &mut Workflow, inputs: &Manifest) -> Result<PostProcOutput> {
    log::info!("entering post-processing stage");
    let method = wf
        .cp
        .get_opt_tags("workflow-postproc", "postproc-method", &inputs.tags)?
        .to_string();

    let out = match method.as_str() {
        "COH_PTF_WORKFLOW" | "COH_PTF_OFFLINE" => setup_postproc_offline(wf, inputs)?,
        "COH_PTF_ONLINE" => bail!(
            "{}",
            diagnostics::error_message("post-processing method COH_PTF_ONLINE is unsupported")
        ),
        other => bail!(
            "{}",
            diagnostics::error_message(format!(
                "post-processing method {:?} not recognized; must be one of {}",
                other,
                METHODS.join(", ")
            ))
        ),
    };

    log::info!("leaving post-processing stage ({} nodes)", wf.len());
    Ok(out)
}

/// Offline coherent post-processing.
pub fn setup_postproc_offline(wf: &mut Workflow, inputs: &Manifest) -> Result<PostProcOutput> {
    fs::create_dir_all(&inputs.output_dir).with_context(|| {
        diagnostics::error_message(format!("create {}", inputs.output_dir.display()))
    })?;

    let cp = &wf.cp;
    let ifos = wf.ifos.clone();
    let out_dir = inputs.output_dir.as_path();
    let tags = &inputs.tags;

    let slides = inputs
        .trigger_files
        .iter()
        .all(|f| f.name().contains("COHERENT_NO_INJECTIONS"))
        && cp.has_option_tag("inspiral", "do-short-slides", "coherent_no_injections");
    let mut out_tags = vec![Category::OffSource, Category::OnSource, Category::AllTimes];
    if slides {
        out_tags.extend([Category::ZeroLagOff, Category::ZeroLagAll]);
    }

    let stage_one = if cp.has_option("workflow-postproc", "do-two-stage-clustering") {
        let num_jobs: usize = cp.get_parsed("workflow-postproc", "num-stage-one-cluster-jobs")?;
        if num_jobs == 0 {
            bail!(
                "{}",
                diagnostics::error_message("num-stage-one-cluster-jobs must be at least 1")
            );
        }
        log::info!("two-stage clustering over {} stage-one jobs", num_jobs);
        let mut s1_tags = tags.clone();
        s1_tags.push("INTERMEDIATE".to_string());
        Some(StageOne {
            combiner: TrigCombinerJob::new(cp, &ifos, out_dir, &s1_tags)?,
            cluster: TrigClusterJob::new(cp, &ifos, out_dir, &s1_tags)?,
            num_jobs,
        })
    } else {
        None
    };

    let jobs = Jobs {
        combiner: TrigCombinerJob::new(cp, &ifos, out_dir, tags)?,
        cluster: TrigClusterJob::new(cp, &ifos, out_dir, tags)?,
        stage_one,
        sbv: SbvPlotterJob::new(cp, &ifos, out_dir, tags)?,
        efficiency: EfficiencyJob::new(cp, "efficiency", &ifos, out_dir, tags)?,
        html: HtmlSummaryJob::new(cp, &ifos, out_dir, tags)?,
    };
    let inj_efficiency = if cp.has_section("workflow-injections") {
        Some(EfficiencyJob::new(cp, "inj_efficiency", &ifos, out_dir, tags)?)
    } else {
        None
    };

    let mut asm = Assembler {
        g: Graph {
            wf,
            pp_nodes: Vec::new(),
            pp_outs: FileList::new(),
        },
        jobs,
        inputs,
        inj: None,
    };
    if let Some(efficiency) = inj_efficiency {
        asm.inj = Some(asm.setup_injections(efficiency)?);
    }
    asm.run(&out_tags, slides)
}

struct StageOne {
    combiner: TrigCombinerJob,
    cluster: TrigClusterJob,
    num_jobs: usize,
}

struct Jobs {
    combiner: TrigCombinerJob,
    cluster: TrigClusterJob,
    stage_one: Option<StageOne>,
    sbv: SbvPlotterJob,
    efficiency: EfficiencyJob,
    html: HtmlSummaryJob,
}

/// State carried from the injection sub-stage into the plotting jobs.
struct Injections {
    efficiency: EfficiencyJob,
    finder_nodes: Vec<NodeId>,
    combiner_nodes: Vec<NodeId>,
    /// Finder nodes of DETECTION sets; their outputs skip the combiner.
    detection_finder_nodes: Vec<NodeId>,
    /// DETECTION finder outputs followed by every combiner output.
    outs: FileList,
    out_tags: Vec<String>,
    set_tags: Vec<String>,
}

impl Injections {
    /// The injection set an output tag was derived from.
    fn set_tag(&self, out_tag: &str) -> Result<String> {
        if !out_tag.contains("_FILTERED_") {
            return Ok(out_tag.to_string());
        }
        let needle = out_tag.replace("_FILTERED_", "");
        self.set_tags
            .iter()
            .find(|t| t.contains(&needle))
            .cloned()
            .ok_or_else(|| {
                anyhow!(diagnostics::error_message(format!(
                    "no injection set matches {}",
                    out_tag
                )))
            })
    }
}

/// Nodes added by this stage, in insertion order.
struct Graph<'a> {
    wf: &'a mut Workflow,
    pp_nodes: Vec<NodeId>,
    pp_outs: FileList,
}

impl Graph<'_> {
    fn add(&mut self, node: Node) -> Result<NodeId> {
        let id = self.wf.add_node(node)?;
        self.pp_nodes.push(id);
        Ok(id)
    }

    fn depend(&mut self, parents: impl IntoIterator<Item = NodeId>, child: NodeId) -> Result<()> {
        for p in parents {
            self.wf.add_dependency(p, child)?;
        }
        Ok(())
    }
}

struct Assembler<'a> {
    g: Graph<'a>,
    jobs: Jobs,
    inputs: &'a Manifest,
    inj: Option<Injections>,
}

impl Assembler<'_> {
    fn run(mut self, out_tags: &[Category], slides: bool) -> Result<PostProcOutput> {
        let inputs = self.inputs;

        let (main_id, main_outs) = self.combine(&inputs.trigger_files, out_tags, None)?;

        let mut cluster_outs = FileList::new();
        let mut clustered = Vec::new();
        for &cat in out_tags {
            let unclust = main_outs.first_of(cat)?.clone();
            let (id, clust) = self.cluster(&unclust, main_id)?;
            cluster_outs.push(clust.clone());
            clustered.push((cat, id, clust));
        }

        let (off_node, reference) = match inputs.timeslides() {
            None => {
                let (_, off_node, reference) = clustered
                    .iter()
                    .find(|(cat, _, _)| *cat == Category::OffSource)
                    .cloned()
                    .ok_or_else(|| anyhow!(diagnostics::error_message("no OFFSOURCE category")))?;
                for (cat, id, clust) in &clustered {
                    self.plotting_jobs(clust, *cat, off_node, *id, &reference)?;
                }
                (off_node, reference)
            }
            Some(ts_files) => {
                let (all_id, reference) = self.time_slides(ts_files, &mut cluster_outs)?;
                for &cat in out_tags {
                    let clust = cluster_outs.first_of(cat)?.clone();
                    self.plotting_jobs(&clust, cat, all_id, all_id, &reference)?;
                }
                (all_id, reference)
            }
        };
        log::info!("off-source reference is {}", reference.name());

        for n in 1..=self.jobs.combiner.num_trials {
            let trial = Category::OffTrial(n);
            let unclust = main_outs.first_of(trial)?.clone();
            let (cid, clust) = self.cluster(&unclust, main_id)?;
            cluster_outs.push(clust.clone());

            let node = self.jobs.efficiency.create_node(
                &clust,
                &reference,
                &inputs.segment_dir,
                &[trial.tag()],
            );
            let eid = self.g.add(node)?;
            self.g.depend([off_node, cid], eid)?;
            self.inj_efficiencies(&clust, &reference, &trial.tag(), off_node)?;
        }

        let (tuning_tags, exclusion_tags): (Vec<String>, Vec<String>) = match &self.inj {
            Some(inj) => inj
                .out_tags
                .iter()
                .cloned()
                .partition(|t| t.contains("DETECTION")),
            None => (Vec::new(), Vec::new()),
        };
        let summary = SummaryInputs {
            config_file: inputs.config_file.as_deref(),
            tuning_tags,
            exclusion_tags,
            segments_plot: inputs.segments_plot.as_deref(),
            html_dir: Some(&inputs.html_dir),
            time_slides: slides,
        };
        let node = self.jobs.html.create_node(&summary);
        let command = open_box_command(&self.jobs.html.exe, &node);
        let summary_node = self.g.wf.add_node(node)?;
        let parents = self.g.pp_nodes.clone();
        self.g.depend(parents, summary_node)?;

        let open_box_script = write_open_box_script(&inputs.output_dir, &command)?;

        self.g.pp_outs.extend(cluster_outs);
        Ok(PostProcOutput {
            files: self.g.pp_outs,
            reference,
            summary_node,
            open_box_script,
        })
    }

    /// Combine `files` into one output per category, going through a layer
    /// of stage-one combine + cluster jobs when two-stage clustering is on.
    fn combine(
        &mut self,
        files: &FileList,
        out_tags: &[Category],
        slide_tag: Option<&str>,
    ) -> Result<(NodeId, FileList)> {
        let inputs = self.inputs;
        let analysis_time = self.g.wf.analysis_time;
        let mut s1_cluster_nodes = Vec::new();

        let final_inputs = match &self.jobs.stage_one {
            None => files.clone(),
            Some(s1) => {
                let mut clustered = FileList::new();
                let chunks = balanced_chunks(files.as_slice(), s1.num_jobs);
                for (j, chunk) in chunks.into_iter().enumerate() {
                    if chunk.is_empty() {
                        continue;
                    }
                    let (node, outs) = s1.combiner.create_node(
                        &FileList::from(chunk.to_vec()),
                        &inputs.segment_dir,
                        analysis_time,
                        out_tags,
                        slide_tag,
                        &[j.to_string()],
                    )?;
                    let combine_id = self.g.add(node)?;

                    let all_times = outs.first_of(Category::AllTimes)?;
                    let (node, out) = s1.cluster.create_node(all_times);
                    let cluster_id = self.g.add(node)?;
                    self.g.depend([combine_id], cluster_id)?;
                    s1_cluster_nodes.push(cluster_id);
                    clustered.push(out);
                }
                clustered
            }
        };

        let (node, outs) = self.jobs.combiner.create_node(
            &final_inputs,
            &inputs.segment_dir,
            analysis_time,
            out_tags,
            slide_tag,
            &[],
        )?;
        let id = self.g.add(node)?;
        self.g.depend(s1_cluster_nodes, id)?;
        self.g.pp_outs.extend(outs.iter().cloned());
        Ok((id, outs))
    }

    fn cluster(&mut self, file: &AnalysisFile, parent: NodeId) -> Result<(NodeId, AnalysisFile)> {
        let (node, out) = self.jobs.cluster.create_node(file);
        let id = self.g.add(node)?;
        self.g.depend([parent], id)?;
        Ok((id, out))
    }

    /// Per-slide combine + cluster, then one `ALL_SLIDES` combine over every
    /// clustered ALL_TIMES file. The aggregate outputs replace the OFFSOURCE
    /// and ALL_TIMES entries of `cluster_outs`.
    fn time_slides(
        &mut self,
        ts_files: &FileList,
        cluster_outs: &mut FileList,
    ) -> Result<(NodeId, AnalysisFile)> {
        let inputs = self.inputs;
        let ts_out_tags = [Category::AllTimes, Category::OffSource];

        let mut slide_tags = BTreeSet::new();
        for f in ts_files {
            let tag = f.tags.iter().find(|t| t.contains("SLIDE")).ok_or_else(|| {
                anyhow!(diagnostics::error_message(format!(
                    "time-slide file {} has no SLIDE tag",
                    f.name()
                )))
            })?;
            slide_tags.insert(tag.clone());
        }
        log::info!("{} time slides", slide_tags.len());

        let mut all_times = cluster_outs.tagged(&Category::AllTimes.tag());
        let mut all_times_nodes = Vec::new();
        for slide in &slide_tags {
            let trigs = ts_files.tagged(slide);
            let (ts_id, ts_outs) = self.combine(&trigs, &ts_out_tags, Some(slide))?;
            for cat in ts_out_tags {
                let unclust = ts_outs.first_of(cat)?.clone();
                let (id, clust) = self.cluster(&unclust, ts_id)?;
                cluster_outs.push(clust.clone());
                if cat == Category::AllTimes {
                    all_times_nodes.push(id);
                    all_times.push(clust);
                }
            }
        }

        let (node, all_outs) = self.jobs.combiner.create_node(
            &all_times,
            &inputs.segment_dir,
            self.g.wf.analysis_time,
            &ts_out_tags,
            Some("ALL_SLIDES"),
            &[],
        )?;
        let all_id = self.g.add(node)?;
        self.g.depend(all_times_nodes, all_id)?;

        let mut kept = cluster_outs.filter(|f| !ts_out_tags.iter().any(|c| f.has_tag(&c.tag())));
        kept.extend(all_outs);
        *cluster_outs = kept;

        let reference = cluster_outs
            .filter(|f| !f.has_tag("ZERO_LAG"))
            .first_of(Category::OffSource)?
            .clone();
        Ok((all_id, reference))
    }

    /// Veto plots for every category but ONSOURCE; efficiency for ONSOURCE.
    fn plotting_jobs(
        &mut self,
        clust: &AnalysisFile,
        cat: Category,
        off_node: NodeId,
        dep_node: NodeId,
        reference: &AnalysisFile,
    ) -> Result<()> {
        let seg_dir = self.inputs.segment_dir.as_path();

        if cat == Category::OnSource {
            let node = self.jobs.efficiency.create_node(clust, reference, seg_dir, &[cat.tag()]);
            let id = self.g.add(node)?;
            self.g.depend([dep_node], id)?;
            return self.inj_efficiencies(clust, reference, &cat.tag(), dep_node);
        }

        let node = self
            .jobs
            .sbv
            .create_node(clust, seg_dir, None, &[cat.tag(), "clustered".to_string()]);
        let id = self.g.add(node)?;
        self.g.depend([off_node, dep_node], id)?;

        if cat != Category::OffSource {
            return Ok(());
        }
        let Some(inj) = &self.inj else {
            return Ok(());
        };
        for found in inj.outs.iter().filter(|f| f.tag_str().contains("FOUND")) {
            let name = found.name();
            let mut tags: Vec<String> = inj
                .out_tags
                .iter()
                .filter(|t| name.contains(t.as_str()))
                .cloned()
                .collect();
            tags.push("clustered".to_string());

            let node = self.jobs.sbv.create_node(clust, seg_dir, Some(found), &tags);
            let id = self.g.add(node)?;
            self.g.depend([dep_node], id)?;
            let parents = if found.tagged_description().contains("DETECTION") {
                &inj.detection_finder_nodes
            } else {
                &inj.combiner_nodes
            };
            self.g.depend(parents.iter().copied(), id)?;
        }
        Ok(())
    }

    /// One injection-efficiency job per injection output tag.
    fn inj_efficiencies(
        &mut self,
        clust: &AnalysisFile,
        reference: &AnalysisFile,
        lead_tag: &str,
        parent: NodeId,
    ) -> Result<()> {
        let seg_dir = self.inputs.segment_dir.as_path();
        let Some(inj) = &self.inj else {
            return Ok(());
        };
        for tag in &inj.out_tags {
            let set_tag = inj.set_tag(tag)?;
            let found = inj.outs.first_containing(&format!("{}_FOUND", tag))?;
            let missed = inj.outs.first_containing(&format!("{}_MISSED", tag))?;
            let node = inj.efficiency.create_inj_node(
                clust,
                reference,
                seg_dir,
                found,
                missed,
                &[lead_tag.to_string(), tag.clone(), set_tag],
            );
            let id = self.g.add(node)?;
            self.g.depend([parent], id)?;
            self.g.depend(
                inj.combiner_nodes.iter().chain(&inj.finder_nodes).copied(),
                id,
            )?;
        }
        Ok(())
    }

    /// Injection finding per set, the found/missed cache, and inclination
    /// filtering for every non-DETECTION set.
    fn setup_injections(&mut self, efficiency: EfficiencyJob) -> Result<Injections> {
        let inputs = self.inputs;
        let ifos = self.g.wf.ifos.clone();
        let out_dir = inputs.output_dir.as_path();

        let full_segment = inputs
            .injection_trigger_files
            .iter()
            .next()
            .map(|f| f.segment)
            .ok_or_else(|| {
                anyhow!(diagnostics::error_message(
                    "injections are enabled but no injection trigger files were given"
                ))
            })?;
        let finder = InjFinderJob::new(&self.g.wf.cp, &ifos, out_dir, &inputs.tags)?;
        let combiner = InjCombinerJob::new(&self.g.wf.cp, &ifos, out_dir, &inputs.tags)?;

        let mut finder_nodes = Vec::new();
        let mut combiner_parents = Vec::new();
        let mut detection_finder_nodes = Vec::new();
        let mut finder_outs = FileList::new();
        for inj_tag in &inputs.injection_tags {
            let triggers = inputs.injection_trigger_files.tag_str_contains(inj_tag);
            let injections = inputs.injection_files.tag_str_contains(inj_tag);
            let (node, outs) =
                finder.create_node(&triggers, &injections, &inputs.segment_dir, inj_tag, full_segment)?;
            let id = self.g.add(node)?;
            finder_nodes.push(id);
            let detection = outs
                .iter()
                .next()
                .is_some_and(|f| f.tagged_description().contains("DETECTION"));
            if detection {
                detection_finder_nodes.push(id);
            } else {
                combiner_parents.push(id);
            }
            finder_outs.extend(outs);
        }
        self.g.pp_outs.extend(finder_outs.iter().cloned());

        let fm_cache = AnalysisFile::new(&ifos, "FOUNDMISSED", full_segment, Vec::new(), out_dir, "lcf");
        let entries: Vec<CacheEntry> = finder_outs.iter().map(AnalysisFile::cache_entry).collect();
        write_cache_file(&fm_cache.path, &entries)?;
        self.g.pp_outs.push(fm_cache.clone());

        let mut outs = finder_outs.tag_str_contains("DETECTION");
        let mut out_tags: Vec<String> = outs
            .iter()
            .filter(|f| f.tag_str().contains("FOUND"))
            .map(|f| {
                let s = f.tag_str();
                match s.rsplit_once('_') {
                    Some((head, _)) => head.to_string(),
                    None => s,
                }
            })
            .collect();

        let mut combiner_nodes = Vec::new();
        for tag in inputs.injection_tags.iter().filter(|t| !t.contains("DETECTION")) {
            let max_inc = self
                .g
                .wf
                .cp
                .get_opt_tags("injections", "max-inc", std::slice::from_ref(tag))?
                .to_string();
            let inj_str = tag.replace("INJ", "");
            let node_inputs = finder_outs.filter(|f| f.tagged_description().contains(tag.as_str()));
            let (node, curr) = combiner.create_node(
                &fm_cache,
                &node_inputs,
                &inj_str,
                &max_inc,
                self.g.wf.analysis_time,
            )?;
            let id = self.g.add(node)?;
            self.g.depend(combiner_parents.iter().copied(), id)?;
            combiner_nodes.push(id);
            out_tags.push(InjCombinerJob::out_tag(&inj_str, &max_inc)?);
            self.g.pp_outs.extend(curr.iter().cloned());
            outs.extend(curr);
        }
        log::info!(
            "{} injection sets, output tags {}",
            inputs.injection_tags.len(),
            out_tags.join(" ")
        );

        Ok(Injections {
            efficiency,
            finder_nodes,
            combiner_nodes,
            detection_finder_nodes,
            outs,
            out_tags,
            set_tags: inputs.injection_tags.clone(),
        })
    }
}

/// Shell command re-running the summary job with `--open-box`. Remote
/// executables are fetched first.
fn open_box_command(exe: &Executable, node: &Node) -> String {
    let mut cmd = if exe.is_remote() {
        let url = exe.path.replace("https", "http");
        let name = url.rsplit('/').next().unwrap_or(&url).to_string();
        format!("wget {}\nchmod 500 ./{}\n./{} ", url, name, name)
    } else {
        format!("{} ", exe.path)
    };
    cmd.push_str(&node.argument_list().join(" "));
    cmd.push_str(" --open-box");
    cmd
}

fn write_open_box_script(dir: &Path, command: &str) -> Result<PathBuf> {
    let path = dir.join(OPEN_BOX_SCRIPT);
    // a previous run leaves it read-only
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| diagnostics::error_message(format!("remove {}", path.display())))?;
    }
    fs::write(&path, format!("#!/bin/sh\n{}", command))
        .with_context(|| diagnostics::error_message(format!("write {}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o500))
            .with_context(|| diagnostics::error_message(format!("chmod {}", path.display())))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::read_cache_file;
    use crate::config::Config;
    use crate::segment::Segment;
    use pretty_assertions::assert_eq;

    const BASE_CONFIG: &str = r#"{
        "workflow": { "trigger-name": "090802" },
        "workflow-postproc": { "postproc-method": "COH_PTF_OFFLINE" },
        "executables": {
            "trig_combiner": "/opt/bin/trig_combiner",
            "trig_cluster": "/opt/bin/trig_cluster",
            "injfinder": "/opt/bin/injfinder",
            "injcombiner": "/opt/bin/injcombiner",
            "efficiency": "/opt/bin/efficiency",
            "sbv_plotter": "/opt/bin/sbv_plotter",
            "html_summary": "/opt/bin/html_summary"
        },
        "trig_combiner": { "num-trials": 2 },
        "injections": { "max-inc": "30" },
        "injections-nsbh400inj": { "max-inc": "400" }
    }"#;

    fn config(extra: &[(&str, &str, &str)]) -> Config {
        let mut cp: Config = serde_json::from_str(BASE_CONFIG).unwrap();
        for (section, option, value) in extra {
            cp.set(section, option, *value);
        }
        cp
    }

    fn seg() -> Segment {
        Segment::new(1000.0, 2000.0).unwrap()
    }

    fn data_file(tags: &[&str], start: f64) -> AnalysisFile {
        AnalysisFile::new(
            "H1L1",
            "INSPIRAL",
            Segment::new(start, start + 100.0).unwrap(),
            tags.iter().map(|t| t.to_string()).collect(),
            Path::new("/data"),
            "xml.gz",
        )
    }

    fn triggers(n: usize, tags: &[&str]) -> FileList {
        (0..n)
            .map(|i| data_file(tags, 1000.0 + 100.0 * i as f64))
            .collect::<Vec<_>>()
            .into()
    }

    fn manifest(out: &Path) -> Manifest {
        Manifest {
            ifos: "H1L1".to_string(),
            analysis_time: seg(),
            trigger_files: triggers(3, &["COHERENT_NO_INJECTIONS"]),
            timeslide_trigger_files: None,
            injection_trigger_files: FileList::new(),
            injection_files: FileList::new(),
            injection_tags: Vec::new(),
            config_file: Some(PathBuf::from("/run/config.json")),
            output_dir: out.to_path_buf(),
            html_dir: PathBuf::from("/www/GRB090802"),
            segment_dir: PathBuf::from("/run/segments"),
            segments_plot: None,
            tags: Vec::new(),
        }
    }

    fn count(wf: &Workflow, job: &str) -> usize {
        wf.nodes_for_job(job).count()
    }

    fn opt<'a>(node: &'a Node, name: &str) -> Option<&'a str> {
        node.options
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    fn assert_reference_everywhere(wf: &Workflow, reference: &AnalysisFile) {
        let want = reference.path.display().to_string();
        let mut seen = 0;
        for (_, node) in wf.nodes().filter(|(_, n)| n.job.ends_with("efficiency")) {
            assert_eq!(opt(node, "offsource-file"), Some(want.as_str()), "{}", node.label());
            seen += 1;
        }
        assert!(seen > 0);
    }

    #[test]
    fn single_pass_graph() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(dir.path());
        let mut wf = Workflow::new(config(&[]), seg(), "H1L1");
        let out = setup_post_processing(&mut wf, &m).unwrap();

        assert_eq!(count(&wf, "trig_combiner"), 1);
        // three categories plus two trials
        assert_eq!(count(&wf, "trig_cluster"), 5);
        assert_eq!(count(&wf, "sbv_plotter"), 2);
        assert_eq!(count(&wf, "efficiency"), 3);
        assert_eq!(count(&wf, "html_summary"), 1);
        assert_eq!(wf.len(), 12);
        wf.validate().unwrap();

        assert!(out.reference.has_tag("OFFSOURCE"));
        assert_eq!(out.reference.description, "INSPIRAL_CLUSTERED");
        assert_reference_everywhere(&wf, &out.reference);

        assert_eq!(wf.parents(out.summary_node).len(), wf.len() - 1);
        assert_eq!(wf.children(out.summary_node), vec![]);
        assert_eq!(out.files.len(), 10);
    }

    #[test]
    fn open_box_script_reruns_the_summary_job() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(dir.path());
        let mut wf = Workflow::new(config(&[]), seg(), "H1L1");
        let out = setup_post_processing(&mut wf, &m).unwrap();

        let text = fs::read_to_string(&out.open_box_script).unwrap();
        assert!(text.starts_with("#!/bin/sh\n/opt/bin/html_summary --grb-name 090802"));
        assert!(text.contains("--html-dir /www/GRB090802"));
        assert!(text.ends_with(" --open-box"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&out.open_box_script).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o500);
        }

        // regenerating over the read-only script works
        let mut wf = Workflow::new(config(&[]), seg(), "H1L1");
        setup_post_processing(&mut wf, &m).unwrap();
    }

    #[test]
    fn remote_summary_executable_is_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(dir.path());
        let cp = config(&[("executables", "html_summary", "https://example.org/bin/html_summary")]);
        let mut wf = Workflow::new(cp, seg(), "H1L1");
        let out = setup_post_processing(&mut wf, &m).unwrap();
        let text = fs::read_to_string(&out.open_box_script).unwrap();
        assert!(text.starts_with(
            "#!/bin/sh\nwget http://example.org/bin/html_summary\nchmod 500 ./html_summary\n./html_summary --grb-name"
        ));
    }

    #[test]
    fn two_stage_clustering_feeds_the_final_combiner() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(dir.path());
        let cp = config(&[
            ("workflow-postproc", "do-two-stage-clustering", ""),
            ("workflow-postproc", "num-stage-one-cluster-jobs", "2"),
        ]);
        let mut wf = Workflow::new(cp, seg(), "H1L1");
        setup_post_processing(&mut wf, &m).unwrap();
        wf.validate().unwrap();

        let combiners: Vec<NodeId> = wf.nodes_for_job("trig_combiner").map(|(id, _)| id).collect();
        assert_eq!(combiners.len(), 3);
        let stage_one: Vec<&Node> = combiners[..2].iter().map(|id| wf.node(*id)).collect();
        assert_eq!(stage_one[0].inputs.len(), 2);
        assert_eq!(stage_one[1].inputs.len(), 1);

        let main = wf.node(combiners[2]);
        assert_eq!(main.inputs.len(), 2);
        assert!(main.inputs.iter().all(|f| f.description == "INSPIRAL_INTERMEDIATE_CLUSTERED"));
        let parents = wf.parents(combiners[2]);
        assert_eq!(parents.len(), 2);
        assert!(parents.iter().all(|p| wf.node(*p).job == "trig_cluster"));
    }

    #[test]
    fn empty_stage_one_chunks_make_no_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(dir.path());
        let cp = config(&[
            ("workflow-postproc", "do-two-stage-clustering", ""),
            ("workflow-postproc", "num-stage-one-cluster-jobs", "5"),
        ]);
        let mut wf = Workflow::new(cp, seg(), "H1L1");
        setup_post_processing(&mut wf, &m).unwrap();
        assert_eq!(count(&wf, "trig_combiner"), 4);
    }

    #[test]
    fn time_slides_aggregate_into_all_slides() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        let mut ts = triggers(2, &["COHERENT_NO_INJECTIONS", "SLIDE1"]);
        ts.extend(triggers(2, &["COHERENT_NO_INJECTIONS", "SLIDE2"]));
        m.timeslide_trigger_files = Some(ts);
        let cp = config(&[("inspiral", "do-short-slides", "")]);
        let mut wf = Workflow::new(cp, seg(), "H1L1");
        let out = setup_post_processing(&mut wf, &m).unwrap();
        wf.validate().unwrap();

        // main, two slides, aggregate
        assert_eq!(count(&wf, "trig_combiner"), 4);
        // five categories, two per slide, two trials
        assert_eq!(count(&wf, "trig_cluster"), 11);
        assert_eq!(count(&wf, "sbv_plotter"), 4);
        assert_eq!(count(&wf, "efficiency"), 3);

        assert!(out.reference.has_tag("ALL_SLIDES"));
        assert!(out.reference.has_tag("OFFSOURCE"));
        assert_reference_everywhere(&wf, &out.reference);

        let (all_id, _) = wf
            .nodes_for_job("trig_combiner")
            .find(|(_, n)| opt(n, "slide-tag") == Some("ALL_SLIDES"))
            .unwrap();
        // zero-lag ALL_TIMES plus one per slide
        assert_eq!(wf.node(all_id).inputs.len(), 3);
        assert_eq!(wf.parents(all_id).len(), 3);

        let summary = wf.node(out.summary_node);
        assert!(summary.argument_list().contains(&"--time-slides".to_string()));
    }

    #[test]
    fn two_stage_clustering_with_time_slides() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        let mut ts = triggers(2, &["COHERENT_NO_INJECTIONS", "SLIDE1"]);
        ts.extend(triggers(2, &["COHERENT_NO_INJECTIONS", "SLIDE2"]));
        m.timeslide_trigger_files = Some(ts);
        let cp = config(&[
            ("inspiral", "do-short-slides", ""),
            ("workflow-postproc", "do-two-stage-clustering", ""),
            ("workflow-postproc", "num-stage-one-cluster-jobs", "2"),
        ]);
        let mut wf = Workflow::new(cp, seg(), "H1L1");
        let out = setup_post_processing(&mut wf, &m).unwrap();
        wf.validate().unwrap();

        // main: 2 stage-one + final; per slide: 2 stage-one + final; aggregate
        assert_eq!(count(&wf, "trig_combiner"), 10);
        // stage one 2 + 2 + 2, five categories, two per slide, two trials
        assert_eq!(count(&wf, "trig_cluster"), 17);

        let outputs: Vec<&PathBuf> = wf
            .nodes()
            .flat_map(|(_, n)| n.outputs.iter().map(|f| &f.path))
            .collect();
        let unique: BTreeSet<&PathBuf> = outputs.iter().copied().collect();
        assert_eq!(unique.len(), outputs.len());

        // each slide's final combiner waits on its own stage-one clusters
        for slide in ["SLIDE1", "SLIDE2"] {
            let (id, node) = wf
                .nodes_for_job("trig_combiner")
                .find(|(_, n)| {
                    opt(n, "slide-tag") == Some(slide)
                        && n.inputs.iter().all(|f| f.description == "INSPIRAL_INTERMEDIATE_CLUSTERED")
                })
                .unwrap();
            assert_eq!(node.inputs.len(), 2);
            let parents = wf.parents(id);
            assert_eq!(parents.len(), 2);
            for p in parents {
                let parent = wf.node(p);
                assert_eq!(parent.job, "trig_cluster");
                assert!(parent.outputs[0].has_tag(slide));
            }
        }

        let (all_id, all) = wf
            .nodes_for_job("trig_combiner")
            .find(|(_, n)| opt(n, "slide-tag") == Some("ALL_SLIDES"))
            .unwrap();
        let inputs: BTreeSet<&PathBuf> = all.inputs.iter().map(|f| &f.path).collect();
        let parents = wf.parents(all_id);
        assert_eq!(parents.len(), 3);
        for p in &parents {
            let parent = wf.node(*p);
            assert_eq!(parent.job, "trig_cluster");
            let clust = &parent.outputs[0];
            assert_eq!(clust.description, "INSPIRAL_CLUSTERED");
            assert!(clust.has_tag("ALL_TIMES"));
            assert!(inputs.contains(&clust.path));
        }

        assert!(out.reference.has_tag("ALL_SLIDES"));
        assert_reference_everywhere(&wf, &out.reference);
    }

    #[test]
    fn injection_sets_feed_efficiency_and_veto_plots() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.injection_tags = vec!["NSBH400INJ".to_string(), "BNSDETECTION".to_string()];
        for tag in &m.injection_tags {
            m.injection_trigger_files.push(data_file(&[tag.as_str()], 1000.0));
            let mut inj = data_file(&[tag.as_str()], 1000.0);
            inj.path = PathBuf::from(format!("/data/HL-INJECTIONS_{}.xml", tag));
            m.injection_files.push(inj);
        }
        let cp = config(&[("workflow-injections", "injections-method", "IN_WORKFLOW")]);
        let mut wf = Workflow::new(cp, seg(), "H1L1");
        let out = setup_post_processing(&mut wf, &m).unwrap();
        wf.validate().unwrap();

        assert_eq!(count(&wf, "injfinder"), 2);
        assert_eq!(count(&wf, "injcombiner"), 1);
        // ONSOURCE and two trials, times two output tags
        assert_eq!(count(&wf, "inj_efficiency"), 6);
        assert_eq!(count(&wf, "sbv_plotter"), 4);
        assert_reference_everywhere(&wf, &out.reference);

        let finders: Vec<NodeId> = wf.nodes_for_job("injfinder").map(|(id, _)| id).collect();
        let (combiner, node) = wf.nodes_for_job("injcombiner").next().unwrap();
        assert_eq!(opt(node, "inj-string"), Some("NSBH400"));
        assert_eq!(opt(node, "max-inclination"), Some("400"));
        assert!(wf.has_edge(finders[0], combiner));
        assert!(!wf.has_edge(finders[1], combiner));

        let cache = out
            .files
            .iter()
            .find(|f| f.description == "FOUNDMISSED")
            .unwrap();
        assert_eq!(read_cache_file(&cache.path).unwrap().len(), 4);

        let summary = wf.node(out.summary_node);
        assert_eq!(opt(summary, "tuning-injection-tags"), Some("BNSDETECTION"));
        assert_eq!(opt(summary, "exclusion-injection-tags"), Some("NSBH_FILTERED_400"));

        let tags: BTreeSet<String> = wf
            .nodes_for_job("inj_efficiency")
            .map(|(_, n)| n.tags.join(" "))
            .collect();
        assert!(tags.contains("ONSOURCE NSBH_FILTERED_400 NSBH400INJ"));
        assert!(tags.contains("OFFTRIAL_2 BNSDETECTION BNSDETECTION"));

        // detection veto plot waits on its finder
        let det_sbv = wf
            .nodes_for_job("sbv_plotter")
            .find(|(_, n)| n.tags.first().map(String::as_str) == Some("BNSDETECTION"))
            .map(|(id, _)| id)
            .unwrap();
        assert!(wf.has_edge(finders[1], det_sbv));
    }

    #[test]
    fn unknown_and_online_methods_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(dir.path());

        let cp = config(&[("workflow-postproc", "postproc-method", "COH_PTF_ONLINE")]);
        let err = setup_post_processing(&mut Workflow::new(cp, seg(), "H1L1"), &m).unwrap_err();
        assert!(err.to_string().contains("unsupported"));

        let cp = config(&[("workflow-postproc", "postproc-method", "IHOPE")]);
        let err = setup_post_processing(&mut Workflow::new(cp, seg(), "H1L1"), &m).unwrap_err();
        assert!(err.to_string().contains("COH_PTF_WORKFLOW, COH_PTF_OFFLINE, COH_PTF_ONLINE"));
    }

    #[test]
    fn missing_trigger_name_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(dir.path());
        let base = config(&[]);
        let mut cp = Config::default();
        for section in ["workflow-postproc", "executables", "trig_combiner"] {
            for (k, v) in base.items(section) {
                cp.set(section, k, v);
            }
        }
        cp.set("workflow", "trigger-time", "933200215");
        let mut wf = Workflow::new(cp, seg(), "H1L1");
        let err = setup_post_processing(&mut wf, &m).unwrap_err().to_string();
        assert!(err.contains("trigger-name"));
        assert!(wf.is_empty());
    }
}
