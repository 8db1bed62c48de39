//! Follow-up bookkeeping: which candidates to follow up, where their pages go.
//!
//! Candidate and search-summary records are read from JSON:
//!
//! {
//!   "coincs": [
//!     { "event_id": "ev1", "stat": 11.2, "injection": false,
//!       "triggers": { "H1": { "end_time": 873247860, "end_time_ns": 500000000 } } }
//!   ],
//!   "search_summary": [
//!     { "ifos": "H1L1", "out_start_time": 873247000, "out_start_time_ns": 0,
//!       "out_end_time": 873249000, "out_end_time_ns": 0 }
//!   ]
//! }

use crate::Result;
use crate::cache::index::IfoCombo;
use crate::diagnostics;
use crate::render;
use crate::segment::Segment;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Detectors a follow-up records times for, in report order.
pub const FOLLOWUP_IFOS: [&str; 6] = ["H1", "H2", "L1", "G1", "V1", "T1"];

/// Working directories created under the follow-up root.
pub const WORK_DIRS: [&str; 8] = [
    "clustered",
    "found",
    "missed",
    "followuptrigs",
    "followupfound",
    "followupmissed",
    "logs",
    "datafind_cache",
];

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TriggerTime {
    pub end_time: i64,
    #[serde(default)]
    pub end_time_ns: i64,
}

impl TriggerTime {
    pub fn gps(&self) -> f64 {
        self.end_time as f64 + self.end_time_ns as f64 / 1e9
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Coinc {
    pub event_id: String,
    pub stat: f64,
    /// True when the coincidence was matched to a simulated signal.
    #[serde(default)]
    pub injection: bool,
    #[serde(default)]
    pub triggers: BTreeMap<String, TriggerTime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchSummary {
    pub ifos: String,
    pub out_start_time: i64,
    #[serde(default)]
    pub out_start_time_ns: i64,
    pub out_end_time: i64,
    #[serde(default)]
    pub out_end_time_ns: i64,
}

impl SearchSummary {
    pub fn out_segment(&self) -> Result<Segment> {
        Segment::new(
            self.out_start_time as f64 + self.out_start_time_ns as f64 / 1e9,
            self.out_end_time as f64 + self.out_end_time_ns as f64 / 1e9,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandidateFile {
    #[serde(default)]
    pub coincs: Vec<Coinc>,
    #[serde(default)]
    pub search_summary: Vec<SearchSummary>,
}

impl CandidateFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| {
            diagnostics::error_message(format!("read candidate file {}", path.display()))
        })?;
        serde_json::from_str(&text).with_context(|| {
            diagnostics::error_message(format!("parse candidate file {}", path.display()))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FollowUpKind {
    Trigs,
    Found,
}

impl FollowUpKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            FollowUpKind::Trigs => "followuptrigs",
            FollowUpKind::Found => "followupfound",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FollowUp {
    pub event_id: String,
    pub stat: f64,
    pub kind: FollowUpKind,
    pub page: String,
    /// GPS time per detector; `None` when the detector did not trigger.
    pub gps_time: BTreeMap<String, Option<f64>>,
    /// Concatenated names of the detectors that triggered, in report order.
    pub ifo_list: String,
    /// Detectors of the analysis chunk holding the first trigger.
    pub ifo_tag: String,
}

impl FollowUp {
    fn from_coinc(coinc: &Coinc, page: &str, search: &[SearchSummary]) -> Self {
        let mut gps_time = BTreeMap::new();
        let mut ifo_list = String::new();
        for ifo in FOLLOWUP_IFOS {
            let t = coinc.triggers.get(ifo).map(TriggerTime::gps);
            if t.is_some() {
                ifo_list.push_str(ifo);
            }
            gps_time.insert(ifo.to_string(), t);
        }

        let ifo_tag = FOLLOWUP_IFOS
            .iter()
            .find_map(|ifo| gps_time.get(*ifo).copied().flatten())
            .and_then(|t| {
                search.iter().find(|chunk| {
                    chunk
                        .out_segment()
                        .map(|seg| seg.covers(t))
                        .unwrap_or(false)
                })
            })
            .map(|chunk| chunk.ifos.clone())
            .unwrap_or_default();

        FollowUp {
            event_id: coinc.event_id.clone(),
            stat: coinc.stat,
            kind: if coinc.injection {
                FollowUpKind::Found
            } else {
                FollowUpKind::Trigs
            },
            page: page.to_string(),
            gps_time,
            ifo_list,
            ifo_tag,
        }
    }

    /// File-name stem shared by all of this candidate's pages.
    pub fn stem(&self) -> String {
        format!("{}_{}", stat_label(self.stat), self.event_id)
    }
}

/// A statistic as it appears in page names: always with a fractional part
/// (`9.0`, `8.5`), and in exponent form (`1e+20`, `5e-05`) outside
/// `[1e-4, 1e16)`.
pub fn stat_label(stat: f64) -> String {
    if stat == 0.0 {
        return "0.0".to_string();
    }
    if !stat.is_finite() {
        return stat.to_string();
    }
    if (1e-4..1e16).contains(&stat.abs()) {
        let s = stat.to_string();
        if s.contains('.') { s } else { format!("{}.0", s) }
    } else {
        let s = format!("{:e}", stat);
        let (mantissa, exp) = s.split_once('e').unwrap_or((s.as_str(), "0"));
        let exp: i32 = exp.parse().unwrap_or(0);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    }
}

/// Pick the `num` candidates to follow up.
///
/// Background triggers are ranked loudest first; found injections quietest
/// first. The choice is made from the first candidate.
pub fn followup_triggers(
    num: usize,
    page: &str,
    coincs: &[Coinc],
    search: &[SearchSummary],
) -> Vec<FollowUp> {
    let mut sorted: Vec<&Coinc> = coincs.iter().collect();
    let ascending = coincs.first().map(|c| c.injection).unwrap_or(false);
    sorted.sort_by(|a, b| {
        let ord = a.stat.partial_cmp(&b.stat).unwrap_or(std::cmp::Ordering::Equal);
        if ascending { ord } else { ord.reverse() }
    });

    sorted
        .into_iter()
        .take(num)
        .map(|c| FollowUp::from_coinc(c, page, search))
        .collect()
}

/// Create the follow-up working directories under `root`.
pub fn prepare_dirs(root: &Path) -> Result<()> {
    for d in WORK_DIRS {
        let p = root.join(d);
        fs::create_dir_all(&p)
            .with_context(|| diagnostics::error_message(format!("create directory {}", p.display())))?;
    }
    Ok(())
}

/// Locations of one follow-up module's image and detail page.
#[derive(Debug, Clone, Serialize)]
pub struct HtmlContainer {
    pub name: String,
    pub image: String,
    pub local_image: PathBuf,
    pub link: String,
    pub local_link: PathBuf,
    pub text: String,
}

impl HtmlContainer {
    /// `name` may be dotted (`pkg.module`); only its last component is used.
    /// The module directory is created under `root`.
    pub fn new(root: &Path, trig: &FollowUp, name: &str, alt_web: Option<&str>) -> Result<Self> {
        let name = name.rsplit('.').next().unwrap_or(name).to_string();
        let kind_dir = trig.kind.dir_name();

        let local_dir = root.join(kind_dir).join(&name);
        fs::create_dir_all(&local_dir).with_context(|| {
            diagnostics::error_message(format!("create directory {}", local_dir.display()))
        })?;

        let detail = format!("{}/{}/{}/", trig.page, kind_dir, name);
        let image_file = format!("{}_{}.png", trig.stem(), name);
        let page_file = format!("{}_{}.html", trig.stem(), alt_web.unwrap_or(&name));

        Ok(HtmlContainer {
            image: format!("{}{}", detail, image_file),
            local_image: local_dir.join(&image_file),
            link: format!("{}{}", detail, page_file),
            local_link: local_dir.join(&page_file),
            text: "click here".to_string(),
            name,
        })
    }
}

/// Per-candidate summary table: one row per module container.
#[derive(Debug, Clone)]
pub struct SummaryTable {
    pub trig: FollowUp,
    pub containers: Vec<HtmlContainer>,
}

impl SummaryTable {
    pub fn new(trig: FollowUp) -> Self {
        Self {
            trig,
            containers: Vec::new(),
        }
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(self.trig.kind.dir_name())
            .join(format!("{}_summary.html", self.trig.stem()))
    }
}

pub fn write_summary_tables(root: &Path, tables: &[SummaryTable]) -> Result<()> {
    for table in tables {
        let path = table.path(root);
        fs::write(&path, render::html::render_summary_table(table))
            .with_context(|| diagnostics::error_message(format!("write {}", path.display())))?;
    }
    Ok(())
}

/// One row of the follow-up index: a summary page found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub stat: f64,
    pub event_id: String,
}

/// Scan a follow-up directory for `<stat>_<id>_summary.html` pages,
/// quietest first. Names that do not parse are skipped.
pub fn scan_summaries(dir: &Path) -> Result<Vec<IndexRow>> {
    let re = Regex::new(r#"^(.*)_summary\.html$"#)?;
    let mut rows = Vec::new();
    if !dir.is_dir() {
        return Ok(rows);
    }
    for entry in fs::read_dir(dir)
        .with_context(|| diagnostics::error_message(format!("list directory {}", dir.display())))?
    {
        let name = entry?.file_name().to_string_lossy().to_string();
        let Some(caps) = re.captures(&name) else {
            continue;
        };
        // The statistic never contains `_`; the id may.
        let Some((stat, id)) = caps[1].split_once('_') else {
            diagnostics::skipped(&name, "missing stat or id");
            continue;
        };
        match stat.parse::<f64>() {
            Ok(stat) => rows.push(IndexRow {
                stat,
                event_id: id.to_string(),
            }),
            Err(e) => diagnostics::skipped(&name, e),
        }
    }
    rows.sort_by(|a, b| a.stat.partial_cmp(&b.stat).unwrap_or(std::cmp::Ordering::Equal));
    Ok(rows)
}

/// Write `index.html` under `root` linking every summary page.
pub fn write_index(root: &Path, page: &str) -> Result<PathBuf> {
    let found = scan_summaries(&root.join(FollowUpKind::Found.dir_name()))?;
    let trigs = scan_summaries(&root.join(FollowUpKind::Trigs.dir_name()))?;
    let html = render::html::render_followup_index(page, &found, &trigs);
    let path = root.join("index.html");
    fs::write(&path, html)
        .with_context(|| diagnostics::error_message(format!("write {}", path.display())))?;
    Ok(path)
}

/// Process parameters and search summary of one trigger document.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerDocument {
    #[serde(default)]
    pub process_params: Vec<ProcessParam>,
    #[serde(default)]
    pub search_summary: Vec<SearchSummary>,
}

impl TriggerDocument {
    /// Read a JSON list of trigger documents.
    pub fn load_all(path: &Path) -> Result<Vec<Self>> {
        let text = fs::read_to_string(path).with_context(|| {
            diagnostics::error_message(format!("read trigger documents {}", path.display()))
        })?;
        serde_json::from_str(&text).with_context(|| {
            diagnostics::error_message(format!("parse trigger documents {}", path.display()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProcessParam {
    pub param: String,
    #[serde(default)]
    pub value: String,
}

/// Rewrite the legacy `-userTag` spelling.
pub fn normalize_params(params: &[ProcessParam]) -> Vec<ProcessParam> {
    params
        .iter()
        .map(|p| {
            if p.param.contains("-userTag") {
                ProcessParam {
                    param: "--user-tag".to_string(),
                    value: p.value.clone(),
                }
            } else {
                p.clone()
            }
        })
        .collect()
}

/// For each combination, the parameters of the document run with `--ifo-tag
/// <tag>` whose analysed segment holds the requested time.
pub fn process_params_for_time(
    docs: &BTreeMap<IfoCombo, Vec<TriggerDocument>>,
    tag: &str,
    times: &BTreeMap<IfoCombo, f64>,
) -> BTreeMap<IfoCombo, Vec<ProcessParam>> {
    let mut out = BTreeMap::new();
    for (combo, docs) in docs {
        let Some(t) = times.get(combo) else {
            continue;
        };
        for doc in docs {
            let ifo_tag = doc
                .process_params
                .iter()
                .find(|p| p.param.contains("--ifo-tag"))
                .map(|p| p.value.as_str());
            if ifo_tag != Some(tag) {
                continue;
            }
            let covered = doc.search_summary.iter().any(|row| {
                row.out_segment().map(|s| s.covers(*t)).unwrap_or(false)
            });
            if covered {
                out.insert(*combo, normalize_params(&doc.process_params));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn coinc(id: &str, stat: f64, injection: bool, h1: Option<(i64, i64)>) -> Coinc {
        let mut triggers = BTreeMap::new();
        if let Some((s, ns)) = h1 {
            triggers.insert("H1".to_string(), TriggerTime { end_time: s, end_time_ns: ns });
        }
        triggers.insert("L1".to_string(), TriggerTime { end_time: 1005, end_time_ns: 0 });
        Coinc {
            event_id: id.to_string(),
            stat,
            injection,
            triggers,
        }
    }

    fn chunk(ifos: &str, start: i64, end: i64) -> SearchSummary {
        SearchSummary {
            ifos: ifos.to_string(),
            out_start_time: start,
            out_start_time_ns: 0,
            out_end_time: end,
            out_end_time_ns: 0,
        }
    }

    #[test]
    fn triggers_are_ranked_loudest_first() {
        let coincs = vec![
            coinc("a", 5.0, false, Some((1000, 0))),
            coinc("b", 9.0, false, Some((1000, 0))),
            coinc("c", 7.0, false, None),
        ];
        let fu = followup_triggers(2, "http://page", &coincs, &[]);
        let ids: Vec<&str> = fu.iter().map(|f| f.event_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(fu[0].kind, FollowUpKind::Trigs);
    }

    #[test]
    fn found_injections_are_ranked_quietest_first() {
        let coincs = vec![
            coinc("a", 5.0, true, Some((1000, 0))),
            coinc("b", 3.0, true, Some((1000, 0))),
        ];
        let fu = followup_triggers(10, "p", &coincs, &[]);
        assert_eq!(fu[0].event_id, "b");
        assert_eq!(fu[0].kind, FollowUpKind::Found);
    }

    #[test]
    fn times_and_ifo_tag_come_from_the_first_trigger() {
        let coincs = vec![coinc("a", 5.0, false, Some((1000, 500_000_000)))];
        let search = vec![chunk("H1H2L1", 0, 999), chunk("H1L1", 999, 2000)];
        let fu = followup_triggers(1, "p", &coincs, &search);
        assert_eq!(fu[0].gps_time["H1"], Some(1000.5));
        assert_eq!(fu[0].gps_time["V1"], None);
        assert_eq!(fu[0].ifo_list, "H1L1");
        assert_eq!(fu[0].ifo_tag, "H1L1");
    }

    #[test]
    fn containers_build_paths_and_directories() {
        let root = tempfile::tempdir().unwrap();
        let coincs = vec![coinc("ev7", 8.5, false, Some((1000, 0)))];
        let fu = followup_triggers(1, "http://web", &coincs, &[]);
        let c = HtmlContainer::new(root.path(), &fu[0], "pylal.qscan", None).unwrap();
        assert_eq!(c.name, "qscan");
        assert_eq!(c.image, "http://web/followuptrigs/qscan/8.5_ev7_qscan.png");
        assert_eq!(c.link, "http://web/followuptrigs/qscan/8.5_ev7_qscan.html");
        assert!(root.path().join("followuptrigs/qscan").is_dir());

        let alt = HtmlContainer::new(root.path(), &fu[0], "qscan", Some("alt")).unwrap();
        assert_eq!(alt.link, "http://web/followuptrigs/qscan/8.5_ev7_alt.html");
    }

    #[test]
    fn index_lists_written_summaries() {
        let root = tempfile::tempdir().unwrap();
        prepare_dirs(root.path()).unwrap();
        let coincs = vec![
            coinc("ev1", 8.5, false, Some((1000, 0))),
            coinc("ev2", 6.0, false, Some((1000, 0))),
        ];
        let tables: Vec<SummaryTable> = followup_triggers(2, "web", &coincs, &[])
            .into_iter()
            .map(SummaryTable::new)
            .collect();
        write_summary_tables(root.path(), &tables).unwrap();
        fs::write(root.path().join("followuptrigs/garbage_summary.html"), "").unwrap();

        let rows = scan_summaries(&root.path().join("followuptrigs")).unwrap();
        assert_eq!(
            rows,
            vec![
                IndexRow { stat: 6.0, event_id: "ev2".into() },
                IndexRow { stat: 8.5, event_id: "ev1".into() },
            ]
        );

        let index = write_index(root.path(), "web").unwrap();
        let html = fs::read_to_string(index).unwrap();
        assert!(html.contains("web/followuptrigs/8.5_ev1_summary.html"));
    }

    #[test]
    fn stats_keep_a_fractional_part() {
        assert_eq!(stat_label(9.0), "9.0");
        assert_eq!(stat_label(8.5), "8.5");
        assert_eq!(stat_label(0.0), "0.0");
        assert_eq!(stat_label(-3.0), "-3.0");
        assert_eq!(stat_label(1e20), "1e+20");
        assert_eq!(stat_label(5e-5), "5e-05");

        let fu = followup_triggers(1, "p", &[coinc("b", 9.0, false, None)], &[]);
        assert_eq!(fu[0].stem(), "9.0_b");
    }

    #[test]
    fn ids_with_underscores_survive_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("9.0_sngl_inspiral_7_summary.html"), "").unwrap();
        let rows = scan_summaries(dir.path()).unwrap();
        assert_eq!(
            rows,
            vec![IndexRow { stat: 9.0, event_id: "sngl_inspiral_7".into() }]
        );
    }

    #[test]
    fn process_params_need_matching_tag_and_time() {
        let doc = |tag: &str, start: i64, end: i64| TriggerDocument {
            process_params: vec![
                ProcessParam { param: "--ifo-tag".into(), value: tag.into() },
                ProcessParam { param: "-userTag".into(), value: "FULL".into() },
            ],
            search_summary: vec![chunk(tag, start, end)],
        };
        let docs = BTreeMap::from([(
            IfoCombo::H1,
            vec![doc("H1L1", 0, 100), doc("H1", 0, 100), doc("H1", 200, 300)],
        )]);
        let times = BTreeMap::from([(IfoCombo::H1, 250.0)]);
        let got = process_params_for_time(&docs, "H1", &times);
        assert_eq!(got[&IfoCombo::H1][1].param, "--user-tag");
        assert_eq!(got.len(), 1);

        let none = process_params_for_time(&docs, "H1", &BTreeMap::from([(IfoCombo::H1, 150.0)]));
        assert!(none.is_empty());
    }

    #[test]
    fn trigger_documents_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h1.json");
        fs::write(
            &path,
            r#"[{"process_params": [{"param": "--ifo-tag", "value": "H1"}, {"param": "--verbose"}],
                "search_summary": [{"ifos": "H1", "out_start_time": 10, "out_end_time": 20}]}]"#,
        )
        .unwrap();

        let docs = TriggerDocument::load_all(&path).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].process_params[1].value, "");

        let got = process_params_for_time(
            &BTreeMap::from([(IfoCombo::H1, docs)]),
            "H1",
            &BTreeMap::from([(IfoCombo::H1, 15.0)]),
        );
        assert_eq!(got[&IfoCombo::H1].len(), 2);

        fs::write(&path, "not json").unwrap();
        assert!(TriggerDocument::load_all(&path).is_err());
    }
}
