use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

mod cache;
mod config;
mod diagnostics;
mod manifest;
mod plot;
mod pp;
mod render;
mod segment;
mod workflow;

pub type Result<T> = anyhow::Result<T>;

#[derive(Parser)]
#[command(name = "pylal")]
#[command(about = "Gravitational-wave post-processing toolkit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble the coherent post-processing workflow (DAX, JSON, HTML report).
    Postproc {
        /// Workflow configuration (JSON sections of string options).
        #[arg(long)]
        config: PathBuf,

        /// Input manifest listing trigger and injection files.
        #[arg(long)]
        manifest: PathBuf,

        /// Base name of the written workflow files.
        #[arg(long, default_value = "post_processing")]
        name: String,
    },

    /// Index trigger files into LAL cache files.
    Cache {
        /// Directory scanned for types without a configured path.
        #[arg(long, default_value = ".")]
        trigger_dir: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(short = 'o', long, default_value = ".")]
        out: PathBuf,
    },

    /// List cache entries covering the given times or overlapping a segment.
    Coverage {
        /// Cache file to search; the trigger files are scanned without it.
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Directory scanned when no cache file is given.
        #[arg(long, default_value = ".")]
        trigger_dir: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Trigger type scanned, e.g. `INSPIRAL-` or `THINCA_`.
        #[arg(long = "type", default_value = "INSPIRAL-")]
        pattern: String,

        /// Detector combination and GPS time, e.g. `H1L1=873247900`.
        #[arg(long = "time", value_parser = parse_ifo_time)]
        times: Vec<(cache::IfoCombo, f64)>,

        /// GPS segment `START,END`; urls intersecting it are listed.
        #[arg(long)]
        segment: Option<String>,
    },

    /// Choose candidates to follow up and write their summary pages.
    Followup {
        /// JSON file of coincidences and search summaries.
        #[arg(long)]
        candidates: PathBuf,

        #[arg(short = 'n', long, default_value_t = 10)]
        num: usize,

        /// Web address the pages will be published under.
        #[arg(long)]
        page: String,

        /// Follow-up modules, one summary-table row each.
        #[arg(long = "module")]
        modules: Vec<String>,

        #[arg(short = 'o', long, default_value = ".")]
        out: PathBuf,
    },

    /// P-P plot statistics for a set of injections and their posteriors.
    Pp {
        /// JSON list of injection records.
        #[arg(long)]
        injections: PathBuf,

        /// Posterior sample files, in injection order.
        #[arg(long = "posterior", required = true)]
        posteriors: Vec<PathBuf>,

        /// Parameters to test; all of them when omitted.
        #[arg(long = "parameter")]
        parameters: Vec<pp::Parameter>,

        #[arg(short = 'o', long)]
        out: PathBuf,
    },

    /// Parameters of the trigger jobs that analysed the given times.
    ProcessParams {
        /// Detector combination and JSON list of trigger documents, e.g. `H1=h1.json`.
        #[arg(long = "documents", value_parser = parse_ifo_path, required = true)]
        documents: Vec<(cache::IfoCombo, PathBuf)>,

        /// Value of `--ifo-tag` the documents must have been run with.
        #[arg(long)]
        ifo_tag: String,

        /// Detector combination and GPS time, e.g. `H1L1=873247900`.
        #[arg(long = "time", value_parser = parse_ifo_time, required = true)]
        times: Vec<(cache::IfoCombo, f64)>,
    },

    /// Plotting helpers.
    Plot {
        #[command(subcommand)]
        cmd: PlotCommands,
    },

    /// Print the time-axis unit for a plot spanning DURATION seconds.
    TimeUnit { duration: f64 },
}

#[derive(Subcommand)]
enum PlotCommands {
    /// LaTeX axis label for a trigger column.
    Label { column: String },

    /// A number in LaTeX scientific notation.
    Latex {
        value: f64,

        #[arg(short = 'p', long, default_value_t = 2)]
        precision: usize,
    },

    /// Log-scale ticks for a linear axis range.
    LogTicks { low: f64, high: f64 },

    /// Typed plotting options of one configuration section, as JSON.
    Options {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        section: String,
    },

    /// Cumulative foreground counts against the background band, as JSON.
    Cumulative {
        /// JSON list of statistic values; one curve per file.
        #[arg(long = "foreground")]
        foreground: Vec<PathBuf>,

        /// JSON list of background instances, each a list of values.
        #[arg(long)]
        background: Option<PathBuf>,

        #[arg(long, default_value_t = 20)]
        num_bins: usize,

        #[arg(long, default_value_t = 1.0)]
        normalization: f64,
    },
}

fn parse_ifo_time(s: &str) -> Result<(cache::IfoCombo, f64)> {
    let (ifo, t) = s.split_once('=').ok_or_else(|| {
        anyhow::anyhow!(diagnostics::error_message(format!("expected IFO=GPS, got {}", s)))
    })?;
    Ok((ifo.parse()?, t.parse()?))
}

fn parse_ifo_path(s: &str) -> Result<(cache::IfoCombo, PathBuf)> {
    let (ifo, path) = s.split_once('=').ok_or_else(|| {
        anyhow::anyhow!(diagnostics::error_message(format!("expected IFO=PATH, got {}", s)))
    })?;
    Ok((ifo.parse()?, PathBuf::from(path)))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| diagnostics::error_message(format!("read {}", path.display())))?;
    serde_json::from_str(&text)
        .with_context(|| diagnostics::error_message(format!("parse {}", path.display())))
}

fn parse_segment(s: &str) -> Result<segment::Segment> {
    let (a, b) = s.split_once(',').ok_or_else(|| {
        anyhow::anyhow!(diagnostics::error_message(format!("expected START,END, got {}", s)))
    })?;
    segment::Segment::new(a.trim().parse()?, b.trim().parse()?)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Postproc { config, manifest, name } => {
            // 1) Inputs.
            let cp = config::Config::load(&config)?;
            let inputs = manifest::Manifest::load(&manifest)?;

            // 2) Assemble.
            let mut wf = workflow::Workflow::new(cp, inputs.analysis_time, &inputs.ifos);
            let out = workflow::postproc::setup_post_processing(&mut wf, &inputs)?;

            // 3) Write the graph and its report.
            render::dax::write_workflow(&inputs.output_dir, &name, &wf)?;
            let report = render::build_workflow_report(&name, &wf, &out.files);
            let html_path = inputs.output_dir.join(format!("{}.html", name));
            std::fs::write(&html_path, render::render_workflow_report(&report)?)?;

            println!("Wrote {}", html_path.display());
            println!("Reference off-source file: {}", out.reference.name());
            println!("Open-box script: {}", out.open_box_script.display());
        }

        Commands::Cache { trigger_dir, config, out } => {
            let cp = config.as_deref().map(config::Config::load).transpose()?;
            let mut fc = cache::FileCache::new(trigger_dir);
            fc.collect_all(cp.as_ref())?;
            std::fs::create_dir_all(&out)?;
            for path in fc.write_all(&out)? {
                println!("Wrote {}", path.display());
            }
        }

        Commands::Coverage { cache: cache_path, trigger_dir, config, pattern, times, segment } => {
            let times: BTreeMap<cache::IfoCombo, f64> = times.into_iter().collect();
            let segment = segment.as_deref().map(parse_segment).transpose()?;

            let (lists, urls) = match cache_path {
                Some(path) => {
                    let urls = match &segment {
                        Some(seg) => cache::urls_intersecting(&path, seg)?,
                        None => Vec::new(),
                    };
                    (cache::files_matching_gps_in_cache(&times, &path)?, urls)
                }
                None => {
                    let Some(ty) = cache::index::TRIGGER_TYPES.iter().find(|t| t.pattern == pattern) else {
                        bail!("{}", diagnostics::error_message(format!("unknown trigger type {}", pattern)));
                    };
                    let cp = config.as_deref().map(config::Config::load).transpose()?;
                    let mut fc = cache::FileCache::new(trigger_dir);
                    fc.collect_type(ty, cp.as_ref())?;
                    let urls = match &segment {
                        Some(seg) => fc
                            .entries(ty.pattern)
                            .iter()
                            .filter(|e| e.segment.intersects(seg))
                            .map(|e| e.url.clone())
                            .collect(),
                        None => Vec::new(),
                    };
                    (fc.files_matching_gps(&times, ty.pattern), urls)
                }
            };

            for (ifo, entries) in lists {
                for e in entries {
                    println!("{} {}", ifo, e.url);
                }
            }
            for url in urls {
                println!("{}", url);
            }
        }

        Commands::Followup { candidates, num, page, modules, out } => {
            use cache::followup;

            let file = followup::CandidateFile::load(&candidates)?;
            let chosen = followup::followup_triggers(num, &page, &file.coincs, &file.search_summary);
            followup::prepare_dirs(&out)?;

            let mut tables = Vec::with_capacity(chosen.len());
            for trig in chosen {
                let mut table = followup::SummaryTable::new(trig);
                for m in &modules {
                    table
                        .containers
                        .push(followup::HtmlContainer::new(&out, &table.trig, m, None)?);
                }
                tables.push(table);
            }
            followup::write_summary_tables(&out, &tables)?;
            let index = followup::write_index(&out, &page)?;
            println!("Wrote {} summary pages and {}", tables.len(), index.display());
        }

        Commands::Pp { injections, posteriors, parameters, out } => {
            let injections = pp::load_injections(&injections)?;
            let parameters = if parameters.is_empty() {
                pp::Parameter::ALL.to_vec()
            } else {
                parameters
            };
            let summary = pp::run_pp_analysis(&injections, &posteriors, &parameters, &out)?;
            for r in &summary.results {
                println!("{:<10} K-S p-value {:.4}", r.name, r.ks_pvalue);
            }
        }

        Commands::ProcessParams { documents, ifo_tag, times } => {
            use cache::followup::TriggerDocument;

            let mut docs: BTreeMap<cache::IfoCombo, Vec<TriggerDocument>> = BTreeMap::new();
            for (ifo, path) in documents {
                docs.entry(ifo).or_default().extend(TriggerDocument::load_all(&path)?);
            }
            let times: BTreeMap<cache::IfoCombo, f64> = times.into_iter().collect();
            for (ifo, params) in cache::followup::process_params_for_time(&docs, &ifo_tag, &times) {
                for p in params {
                    println!("{} {} {}", ifo, p.param, p.value);
                }
            }
        }

        Commands::Plot { cmd } => match cmd {
            PlotCommands::Label { column } => println!("{}", plot::display_name(&column)),

            PlotCommands::Latex { value, precision } => {
                println!("{}", plot::float_to_latex(value, precision))
            }

            PlotCommands::LogTicks { low, high } => {
                let ticks = plot::log_transform((low, high))?;
                println!("{}", serde_json::to_string_pretty(&ticks)?);
            }

            PlotCommands::Options { config, section } => {
                let cp = config::Config::load(&config)?;
                let params = plot::parse_plot_config(&cp, &section)?;
                println!("{}", serde_json::to_string_pretty(&params)?);
            }

            PlotCommands::Cumulative { foreground, background, num_bins, normalization } => {
                let mut hist = plot::CumulativeHistogram::new();
                for path in &foreground {
                    hist.add_content(read_json(path)?);
                }
                if let Some(path) = &background {
                    hist.add_background(read_json::<Vec<Vec<f64>>>(path)?);
                }
                let stats = hist.finalize(num_bins, normalization)?;
                let styles: Vec<(&str, &str)> = plot::default_colors()
                    .zip(plot::default_symbols())
                    .take(foreground.len())
                    .collect();
                let out = serde_json::json!({ "styles": styles, "histogram": stats });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
        },

        Commands::TimeUnit { duration } => {
            let (unit, name) = plot::time_axis_unit(duration);
            println!("{} {}", unit, name);
        }
    }

    Ok(())
}
