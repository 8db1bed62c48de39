//! Numerical helpers for plot preparation: axis units, LaTeX labels,
//! binning, log ticks and cumulative-histogram statistics. Nothing here
//! draws; callers hand the numbers to whatever renders the figure.

use crate::Result;
use crate::config::Config;
use crate::diagnostics;

use anyhow::{anyhow, bail};
use serde::Serialize;
use std::collections::BTreeMap;

/// Unit (in seconds) and its name for a time axis spanning `duration`.
pub fn time_axis_unit(duration: f64) -> (u32, &'static str) {
    if duration < 1000.0 {
        (1, "seconds")
    } else if duration < 20000.0 {
        (60, "minutes")
    } else if duration < 604800.0 {
        (3600, "hours")
    } else if duration < 8640000.0 {
        (86400, "days")
    } else {
        (2592000, "months")
    }
}

/// C-style `%.<precision>g` formatting.
fn format_general(x: f64, precision: usize) -> String {
    if !x.is_finite() {
        return x.to_string();
    }
    if x == 0.0 {
        return "0".to_string();
    }
    let p = precision.max(1);
    let sci = format!("{:.*e}", p - 1, x);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);

    if exp < -4 || exp >= p as i32 {
        // Negative exponents keep two digits (`e-05`); positive ones are bare.
        if exp < 0 {
            format!("{}e-{:02}", trim_zeros(mantissa), -exp)
        } else {
            format!("{}e{}", trim_zeros(mantissa), exp)
        }
    } else {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        trim_zeros(&format!("{:.*}", decimals, x)).to_string()
    }
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// LaTeX rendering of `x` with `precision` significant digits;
/// scientific notation becomes `m\times 10^{e}`.
pub fn float_to_latex(x: f64, precision: usize) -> String {
    let base = format_general(x, precision);
    let Some((mantissa, exponent)) = base.split_once('e') else {
        return base;
    };
    if mantissa == "1" {
        format!("10^{{{}}}", exponent)
    } else {
        format!("{}\\times 10^{{{}}}", mantissa, exponent)
    }
}

const ACRONYMS: &[&str] = &["snr", "ra", "dof", "id", "ms", "far"];
const GREEK: &[&str] = &[
    "alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta", "iota", "kappa", "lamda",
    "mu", "nu", "xi", "pi", "rho", "sigma", "tau", "upsilon", "phi", "chi", "psi", "omega",
];
const UNITS: &[(&str, &str)] = &[("ns", "ns"), ("hz", "Hz")];
const SUBSCRIPTED: &[&str] = &["flow", "fhigh", "hrss", "mtotal", "mchirp"];
const MISC: &[(&str, &str)] = &[("hoft", "$h(t)$")];

/// True when every cased character is upper case and there is at least one.
fn is_upper(s: &str) -> bool {
    s.chars().any(|c| c.is_alphabetic()) && !s.chars().any(|c| c.is_lowercase())
}

fn title_case(w: &str) -> String {
    let mut out = String::with_capacity(w.len());
    let mut prev_alpha = false;
    for c in w.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

fn all_but_last(w: &str) -> &str {
    match w.char_indices().last() {
        Some((i, _)) => &w[..i],
        None => w,
    }
}

/// Format a column name (e.g. `bank_chisq_dof`) as a LaTeX axis label
/// (`Bank $\chi^2$ DOF`).
pub fn display_name(column: &str) -> String {
    if column.chars().count() == 1 {
        return column.to_string();
    }

    let mut words: Vec<String> = Vec::new();
    for w in column.split_whitespace() {
        if is_upper(all_but_last(w)) {
            words.push(w.to_string());
        } else {
            words.extend(w.split('_').map(str::to_string));
        }
    }

    words
        .iter()
        .map(|w| {
            let wl = w.to_lowercase();
            if let Some((_, v)) = MISC.iter().find(|(k, _)| *k == wl) {
                v.to_string()
            } else if ACRONYMS.contains(&wl.as_str()) {
                w.to_uppercase()
            } else if let Some((_, u)) = UNITS.iter().find(|(k, _)| *k == wl) {
                format!("({})", u)
            } else if SUBSCRIPTED.contains(&wl.as_str()) {
                let mut chars = w.chars();
                let first = chars.next().map(String::from).unwrap_or_default();
                format!("{}$_{{\\mbox{{\\small {}}}}}$", first, chars.as_str())
            } else if GREEK.contains(&wl.as_str()) {
                format!("$\\{}$", w)
            } else if let Some(g) = GREEK.iter().find(|g| w.starts_with(**g)) {
                greek_word(w, g)
            } else {
                let t = if is_upper(all_but_last(w)) {
                    w.clone()
                } else {
                    title_case(w)
                };
                escape_underscores(&t)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Words that start with a Greek letter: `psi0` -> `$\psi_{0}$`,
/// `chisq` -> `$\chi^2$`; anything else is left alone.
fn greek_word(w: &str, greek: &str) -> String {
    if w.ends_with(|c: char| c.is_ascii_digit()) {
        let letters: String = w.chars().take_while(|c| c.is_alphabetic()).collect();
        let digits: String = w
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let letters = if letters.is_empty() { greek.to_string() } else { letters };
        format!("$\\{}_{{{}}}$", letters, digits)
    } else if w.to_lowercase().ends_with("sq") {
        format!("$\\{}^2$", &w[..w.len() - 2])
    } else {
        w.to_string()
    }
}

fn escape_underscores(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev = None;
    for c in s.chars() {
        if c == '_' && prev != Some('\\') {
            out.push('\\');
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

/// Smallest and largest value over all data sets; the defaults stand in
/// when there is no data.
pub fn determine_common_bin_limits(data_sets: &[Vec<f64>], default_min: f64, default_max: f64) -> (f64, f64) {
    let values = data_sets.iter().flatten().copied().filter(|v| !v.is_nan());
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    (
        if min.is_infinite() { default_min } else { min },
        if max.is_infinite() { default_max } else { max },
    )
}

/// Log-scale ticks for a linear axis range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogTicks {
    pub ticks: Vec<f64>,
    pub labels: Vec<String>,
    pub minor: Vec<f64>,
}

/// Major ticks at integer decades inside `lin_range`, with eight minor
/// ticks between neighbouring majors.
pub fn log_transform(lin_range: (f64, f64)) -> Result<LogTicks> {
    let (lo, hi) = lin_range;
    if !(lo > 0.0 && hi > lo) {
        bail!(
            "{}",
            diagnostics::error_message(format!("log axis range must be positive and increasing: ({}, {})", lo, hi))
        );
    }
    let (log_lo, log_hi) = (lo.log10(), hi.log10());
    let slope = (hi - lo) / (log_hi - log_lo);
    let inter = lo - slope * log_lo;

    let first = (log_lo - 1.0).trunc() as i64;
    let last = (log_hi + 1.0).trunc() as i64;
    let decades: Vec<i64> = (first..last)
        .filter(|&t| t as f64 >= log_lo && t as f64 <= log_hi)
        .collect();

    let ticks: Vec<f64> = decades.iter().map(|&t| inter + slope * t as f64).collect();
    let labels = decades.iter().map(|t| format!("${{10^{{{}}}}}$", t)).collect();

    let mut minor = Vec::new();
    for w in ticks.windows(2) {
        let (a, b) = (w[0].log10(), w[1].log10());
        let step = (b - a) / 9.0;
        minor.extend((1..9).map(|i| 10f64.powf(a + step * i as f64)));
    }

    Ok(LogTicks { ticks, labels, minor })
}

/// A typed plot option.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PlotParam {
    Pair(Vec<f64>),
    Bins(Vec<Vec<f64>>),
    Bool(bool),
    Float(f64),
    Int(i64),
    Text(String),
}

const PAIRS: &[&str] = &["xlim", "ylim", "zlim", "colorlim"];
const PAIR_LISTS: &[&str] = &["bins", "color-bins"];
const BOOLEANS: &[&str] = &[
    "logx",
    "logy",
    "logz",
    "cumulative",
    "rate",
    "detchar-style",
    "greyscale",
    "zero-indicator",
    "normalized",
    "fill",
    "calendar-time",
    "bar",
];
const FLOATS: &[&str] = &["detchar-style-threshold", "dcthreshold"];
const INTS: &[&str] = &["num-bins"];

fn parse_floats(s: &str, what: &str) -> Result<Vec<f64>> {
    s.split(',')
        .map(|p| {
            p.trim().parse::<f64>().map_err(|e| {
                anyhow!(diagnostics::error_message(format!("bad number {:?} in {}: {}", p, what, e)))
            })
        })
        .collect()
}

fn parse_bool(s: &str, what: &str) -> Result<bool> {
    match s.to_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        _ => bail!("{}", diagnostics::error_message(format!("{} is not a boolean: {:?}", what, s))),
    }
}

/// Read plotting options from `section`. Keys come back with `_` in
/// place of `-`; values are typed by key. Valueless options are skipped.
pub fn parse_plot_config(cp: &Config, section: &str) -> Result<BTreeMap<String, PlotParam>> {
    let mut params = BTreeMap::new();
    for (key, raw) in cp.items(section) {
        let val = raw.trim_matches('"');
        if val.is_empty() {
            continue;
        }
        let hkey = key.replace('_', "-");
        let ukey = key.replace('-', "_");
        let what = format!("[{}] {}", section, key);

        let param = if PAIRS.contains(&hkey.as_str()) {
            PlotParam::Pair(parse_floats(val, &what)?)
        } else if PAIR_LISTS.contains(&hkey.as_str()) {
            PlotParam::Bins(val.split(';').map(|p| parse_floats(p, &what)).collect::<Result<_>>()?)
        } else if BOOLEANS.contains(&hkey.as_str()) {
            PlotParam::Bool(parse_bool(val, &what)?)
        } else if FLOATS.contains(&hkey.as_str()) {
            PlotParam::Float(cp.get_parsed(section, key)?)
        } else if INTS.contains(&hkey.as_str()) {
            PlotParam::Int(cp.get_parsed(section, key)?)
        } else {
            PlotParam::Text(val.to_string())
        };
        params.insert(ukey, param);
    }
    Ok(params)
}

pub fn default_colors() -> impl Iterator<Item = &'static str> {
    ["b", "g", "r", "c", "m", "y", "k"].into_iter().cycle()
}

pub fn default_symbols() -> impl Iterator<Item = &'static str> {
    ["x", "^", "D", "H", "o", "1", "+"].into_iter().cycle()
}

const EPSILON: f64 = 1e-8;

/// Counts per bin; bins are half-open except the last, which is closed.
fn histogram(data: &[f64], edges: &[f64]) -> Vec<f64> {
    let n = edges.len().saturating_sub(1);
    let mut counts = vec![0.0; n];
    let (Some(&lo), Some(&hi)) = (edges.first(), edges.last()) else {
        return counts;
    };
    for &v in data {
        if v.is_nan() || v < lo || v > hi {
            continue;
        }
        let i = edges.partition_point(|&e| e <= v).saturating_sub(1).min(n - 1);
        counts[i] += 1.0;
    }
    counts
}

/// Reverse cumulative sum: entry i counts everything in bins >= i.
fn reverse_cumsum(counts: &[f64]) -> Vec<f64> {
    let mut out = counts.to_vec();
    for i in (0..out.len().saturating_sub(1)).rev() {
        out[i] += out[i + 1];
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackgroundBand {
    /// Mean cumulative count per bin, floored at a small epsilon.
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    /// `means - stds`, floored like `means`.
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CumulativeHistogramStats {
    pub edges: Vec<f64>,
    /// Bin centres for the foreground curves.
    pub centers: Vec<f64>,
    /// One cumulative curve per foreground set (scaled by normalization).
    pub foreground: Vec<Vec<f64>>,
    /// Background statistics at every bin edge (the last bin runs to infinity).
    pub background: Option<BackgroundBand>,
    pub xlim: (f64, f64),
    pub ymin: f64,
}

/// Foreground cumulative counts against the mean and spread of a set of
/// background instances.
#[derive(Debug, Clone, Default)]
pub struct CumulativeHistogram {
    foreground: Vec<Vec<f64>>,
    background: Vec<Vec<f64>>,
}

impl CumulativeHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_content(&mut self, data: Vec<f64>) {
        self.foreground.push(data);
    }

    pub fn add_background(&mut self, instances: impl IntoIterator<Item = Vec<f64>>) {
        self.background.extend(instances);
    }

    pub fn finalize(self, num_bins: usize, normalization: f64) -> Result<CumulativeHistogramStats> {
        if num_bins == 0 {
            bail!("{}", diagnostics::error_message("cumulative histogram needs at least one bin"));
        }
        let all: Vec<Vec<f64>> = self.foreground.iter().chain(&self.background).cloned().collect();
        let (min, max) = determine_common_bin_limits(&all, 0.0, 0.0);

        let dx = (max - min) / num_bins as f64;
        let edges: Vec<f64> = (0..=num_bins).map(|i| min + dx * i as f64).collect();
        let centers: Vec<f64> = edges[..num_bins].iter().map(|x| x + dx / 2.0).collect();

        let foreground = self
            .foreground
            .iter()
            .map(|d| {
                reverse_cumsum(&histogram(d, &edges))
                    .into_iter()
                    .map(|y| y.max(EPSILON) * normalization)
                    .collect()
            })
            .collect();

        let n = self.background.len();
        let background = if n == 0 {
            None
        } else {
            let mut bg_edges = edges.clone();
            bg_edges.push(f64::INFINITY);
            let mut sum = vec![0.0; edges.len()];
            let mut sq = vec![0.0; edges.len()];
            for inst in &self.background {
                for (i, y) in reverse_cumsum(&histogram(inst, &bg_edges)).into_iter().enumerate() {
                    sum[i] += y;
                    sq[i] += y * y;
                }
            }
            let raw_means: Vec<f64> = sum.iter().map(|s| s / n as f64).collect();
            let stds: Vec<f64> = if n < 2 {
                vec![0.0; edges.len()]
            } else {
                (0..edges.len())
                    .map(|i| ((sq[i] - sum[i] * raw_means[i]) / (n - 1) as f64).max(0.0).sqrt())
                    .collect()
            };
            let upper = raw_means.iter().zip(&stds).map(|(m, s)| (m + s) * normalization).collect();
            let lower = raw_means
                .iter()
                .zip(&stds)
                .map(|(m, s)| (m - s).max(EPSILON) * normalization)
                .collect();
            let means = raw_means.iter().map(|m| m.max(EPSILON) * normalization).collect();
            Some(BackgroundBand { means, stds, lower, upper })
        };

        let ymin = if n > 0 { 0.6f64.min(0.6 / n as f64) } else { 0.6f64.min(0.6 * normalization) };

        Ok(CumulativeHistogramStats {
            edges,
            centers,
            foreground,
            background,
            xlim: (0.9 * min, 1.1 * max),
            ymin,
        })
    }
}
