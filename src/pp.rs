//! P-P validation of parameter-estimation runs.
//!
//! For every injection, the fractional rank of the true parameter value
//! among its posterior samples is a p-value; over many injections those
//! p-values should be uniform on [0, 1]. The per-parameter p-values, their
//! cumulative curve and a Kolmogorov-Smirnov p-value go into `<par>-ps.dat`
//! files and an `index.html` summary.

use crate::Result;
use crate::diagnostics;
use crate::render;

use anyhow::{Context, anyhow, bail};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Greyed-out uniform draws drawn behind each measured curve.
pub const SYNTHETIC_CURVES: usize = 10;

/// Injected signal parameters, as stored in a sim_inspiral row.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SimInspiral {
    pub mass1: f64,
    pub mass2: f64,
    pub eta: f64,
    pub mchirp: f64,
    pub distance: f64,
    pub geocent_end_time: i64,
    pub geocent_end_time_ns: i64,
    pub longitude: f64,
    pub latitude: f64,
    pub coa_phase: f64,
    pub polarization: f64,
    pub inclination: f64,
    pub spin1x: f64,
    pub spin1y: f64,
    pub spin1z: f64,
    pub spin2x: f64,
    pub spin2y: f64,
    pub spin2z: f64,
}

/// Load a JSON array of injections.
pub fn load_injections(path: &Path) -> Result<Vec<SimInspiral>> {
    let text = fs::read_to_string(path)
        .with_context(|| diagnostics::error_message(format!("read injections {}", path.display())))?;
    serde_json::from_str(&text)
        .with_context(|| diagnostics::error_message(format!("parse injections {}", path.display())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Parameter {
    M1,
    M2,
    Mc,
    Eta,
    Q,
    Iota,
    A1,
    A2,
    Theta1,
    Theta2,
    Phi1,
    Phi2,
    Ra,
    Dec,
    Dist,
    Time,
    PhiOrb,
    Psi,
}

impl Parameter {
    /// Default parameter set, in report order.
    pub const ALL: [Parameter; 18] = [
        Parameter::M1,
        Parameter::M2,
        Parameter::Mc,
        Parameter::Eta,
        Parameter::Q,
        Parameter::Iota,
        Parameter::A1,
        Parameter::A2,
        Parameter::Theta1,
        Parameter::Theta2,
        Parameter::Phi1,
        Parameter::Phi2,
        Parameter::Ra,
        Parameter::Dec,
        Parameter::Dist,
        Parameter::Time,
        Parameter::PhiOrb,
        Parameter::Psi,
    ];

    /// Column name in the posterior-sample table.
    pub fn name(&self) -> &'static str {
        match self {
            Parameter::M1 => "m1",
            Parameter::M2 => "m2",
            Parameter::Mc => "mc",
            Parameter::Eta => "eta",
            Parameter::Q => "q",
            Parameter::Iota => "iota",
            Parameter::A1 => "a1",
            Parameter::A2 => "a2",
            Parameter::Theta1 => "theta1",
            Parameter::Theta2 => "theta2",
            Parameter::Phi1 => "phi1",
            Parameter::Phi2 => "phi2",
            Parameter::Ra => "ra",
            Parameter::Dec => "dec",
            Parameter::Dist => "dist",
            Parameter::Time => "time",
            Parameter::PhiOrb => "phi_orb",
            Parameter::Psi => "psi",
        }
    }

    pub fn latex(&self) -> &'static str {
        match self {
            Parameter::M1 => r"$m_1$",
            Parameter::M2 => r"$m_2$",
            Parameter::Mc => r"$\mathcal{M}$",
            Parameter::Eta => r"$\eta$",
            Parameter::Q => r"$q$",
            Parameter::Iota => r"$\iota$",
            Parameter::A1 => r"$a_1$",
            Parameter::A2 => r"$a_2$",
            Parameter::Theta1 => r"$\theta_1$",
            Parameter::Theta2 => r"$\theta_2$",
            Parameter::Phi1 => r"$\phi_1$",
            Parameter::Phi2 => r"$\phi_2$",
            Parameter::Ra => r"$\alpha$",
            Parameter::Dec => r"$\delta$",
            Parameter::Dist => r"$d$",
            Parameter::Time => r"$t$",
            Parameter::PhiOrb => r"$\phi_\mathrm{orb}$",
            Parameter::Psi => r"$\psi$",
        }
    }

    /// True value of this parameter for one injection.
    pub fn extract(&self, si: &SimInspiral) -> f64 {
        match self {
            Parameter::M1 => si.mass1,
            Parameter::M2 => si.mass2,
            Parameter::Mc => si.mchirp,
            Parameter::Eta => si.eta,
            Parameter::Q => si.mass2 / si.mass1,
            Parameter::Iota => si.inclination,
            Parameter::A1 => norm(si.spin1x, si.spin1y, si.spin1z),
            Parameter::A2 => norm(si.spin2x, si.spin2y, si.spin2z),
            Parameter::Theta1 => (si.spin1z / norm(si.spin1x, si.spin1y, si.spin1z)).acos(),
            Parameter::Theta2 => (si.spin2z / norm(si.spin2x, si.spin2y, si.spin2z)).acos(),
            Parameter::Phi1 => azimuth(si.spin1x, si.spin1y),
            Parameter::Phi2 => azimuth(si.spin2x, si.spin2y),
            Parameter::Ra => si.longitude,
            Parameter::Dec => si.latitude,
            Parameter::Dist => si.distance,
            Parameter::Time => si.geocent_end_time as f64 + 1e-9 * si.geocent_end_time_ns as f64,
            Parameter::PhiOrb => si.coa_phase,
            Parameter::Psi => si.polarization,
        }
    }
}

fn norm(x: f64, y: f64, z: f64) -> f64 {
    (x * x + y * y + z * z).sqrt()
}

/// Azimuth in [0, 2pi).
fn azimuth(x: f64, y: f64) -> f64 {
    let phi = y.atan2(x);
    if phi < 0.0 { phi + 2.0 * PI } else { phi }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Parameter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Parameter::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| anyhow!(diagnostics::error_message(format!("unknown parameter '{}'", s))))
    }
}

/// Columns of a posterior-sample table.
#[derive(Debug, Clone, Default)]
pub struct PosteriorSamples {
    columns: BTreeMap<String, Vec<f64>>,
}

impl PosteriorSamples {
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.columns.values().next().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read a whitespace-separated table whose first line names the columns.
/// Blank and `#` lines are ignored; a short or non-numeric row is an error.
pub fn read_posterior_samples(path: &Path) -> Result<PosteriorSamples> {
    let text = fs::read_to_string(path)
        .with_context(|| diagnostics::error_message(format!("read posterior samples {}", path.display())))?;
    let mut lines = text.lines();
    let header: Vec<String> = lines
        .next()
        .map(|l| l.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    if header.is_empty() {
        bail!(
            "{}",
            diagnostics::error_message(format!("{} has no header row", path.display()))
        );
    }

    let mut data: Vec<Vec<f64>> = vec![Vec::new(); header.len()];
    for (lineno, line) in lines.enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| {
                diagnostics::error_message(format!("{}:{}: bad number", path.display(), lineno + 2))
            })?;
        if row.len() != header.len() {
            bail!(
                "{}",
                diagnostics::error_message(format!(
                    "{}:{}: expected {} columns, found {}",
                    path.display(),
                    lineno + 2,
                    header.len(),
                    row.len()
                ))
            );
        }
        for (col, v) in data.iter_mut().zip(row) {
            col.push(v);
        }
    }

    Ok(PosteriorSamples {
        columns: header.into_iter().zip(data).collect(),
    })
}

/// Fraction of `xs` strictly below `x`; `None` for an empty sample set.
pub fn fractional_rank(x: f64, xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let below = xs.iter().filter(|&&s| s < x).count();
    Some(below as f64 / xs.len() as f64)
}

/// Empirical CDF of `ps` as plot points, from (0, 0) to (1, 1).
pub fn pp_curve(ps: &[f64]) -> Vec<(f64, f64)> {
    let mut sorted = ps.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();

    let mut points = Vec::with_capacity(n + 2);
    points.push((0.0, 0.0));
    for (i, p) in sorted.into_iter().enumerate() {
        points.push((p, (i + 1) as f64 / n as f64));
    }
    points.push((1.0, 1.0));
    points
}

/// `count` curves of `n` uniform draws each, for visual comparison.
pub fn synthetic_curves(n: usize, count: usize, seed: u64) -> Vec<Vec<(f64, f64)>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let draws: Vec<f64> = (0..n).map(|_| rng.random::<f64>()).collect();
            pp_curve(&draws)
        })
        .collect()
}

/// Kolmogorov-Smirnov distance between the empirical CDF of `ps` and U(0, 1).
pub fn ks_statistic(ps: &[f64]) -> f64 {
    let mut sorted = ps.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    sorted
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let cdf = p.clamp(0.0, 1.0);
            let above = (i + 1) as f64 / n - cdf;
            let below = cdf - i as f64 / n;
            above.max(below)
        })
        .fold(0.0, f64::max)
}

/// One-sample K-S p-value against U(0, 1), from the asymptotic Kolmogorov
/// distribution with the small-sample correction of Stephens.
pub fn ks_pvalue(ps: &[f64]) -> f64 {
    if ps.is_empty() {
        return 1.0;
    }
    let d = ks_statistic(ps);
    let sqrt_n = (ps.len() as f64).sqrt();
    kolmogorov_q((sqrt_n + 0.12 + 0.11 / sqrt_n) * d)
}

/// Q_KS(lambda) = 2 sum_{j>=1} (-1)^{j-1} exp(-2 j^2 lambda^2).
fn kolmogorov_q(lambda: f64) -> f64 {
    if lambda < 0.2 {
        return 1.0;
    }
    let a = -2.0 * lambda * lambda;
    let mut sum = 0.0;
    let mut sign = 1.0;
    for j in 1..=100 {
        let jf = j as f64;
        let term = sign * (a * jf * jf).exp();
        sum += term;
        if term.abs() < 1e-12 * sum.abs().max(1e-300) {
            break;
        }
        sign = -sign;
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

/// Result for one parameter.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterResult {
    pub name: String,
    pub latex: String,
    pub ks_pvalue: f64,
    pub ps: Vec<f64>,
    pub curve: Vec<(f64, f64)>,
    pub synthetic: Vec<Vec<(f64, f64)>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PpSummary {
    /// Posterior files that were read and paired with an injection.
    pub injections: usize,
    /// Sub-directory links (prior samples, per-injection posteriors).
    pub links: Vec<(String, String)>,
    pub results: Vec<ParameterResult>,
}

/// Run the p-p analysis. `posteriors[i]` belongs to `injections[i]`;
/// unreadable files and missing columns are skipped.
pub fn run_pp_analysis(
    injections: &[SimInspiral],
    posteriors: &[PathBuf],
    parameters: &[Parameter],
    out_dir: &Path,
) -> Result<PpSummary> {
    fs::create_dir_all(out_dir)
        .with_context(|| diagnostics::error_message(format!("create {}", out_dir.display())))?;

    let mut pvalues: BTreeMap<Parameter, Vec<f64>> = BTreeMap::new();
    let mut used = 0;
    for (index, path) in posteriors.iter().enumerate() {
        let Some(truth) = injections.get(index) else {
            diagnostics::skipped(path.display(), format!("no injection #{}", index));
            continue;
        };
        let samples = match read_posterior_samples(path) {
            Ok(s) => s,
            Err(e) => {
                diagnostics::skipped(path.display(), e);
                continue;
            }
        };
        used += 1;

        for par in parameters {
            let Some(column) = samples.column(par.name()) else {
                diagnostics::skipped(format!("{} in {}", par, path.display()), "no such column");
                continue;
            };
            let true_value = par.extract(truth);
            if !true_value.is_finite() {
                diagnostics::skipped(format!("{} of injection #{}", par, index), "true value undefined");
                continue;
            }
            if let Some(p) = fractional_rank(true_value, column) {
                pvalues.entry(*par).or_default().push(p);
            }
        }
    }
    log::info!("p-p analysis over {} of {} posterior files", used, posteriors.len());

    let mut results = Vec::new();
    for par in parameters {
        let Some(ps) = pvalues.remove(par) else {
            continue;
        };
        write_pvalues(&out_dir.join(format!("{}-ps.dat", par)), &ps)?;
        results.push(ParameterResult {
            name: par.name().to_string(),
            latex: par.latex().to_string(),
            ks_pvalue: ks_pvalue(&ps),
            curve: pp_curve(&ps),
            synthetic: synthetic_curves(ps.len(), SYNTHETIC_CURVES, results.len() as u64),
            ps,
        });
    }

    let links = [("prior", "Prior samples used in this test"), ("injections", "Posteriors for each injection")]
        .into_iter()
        .filter(|(dir, _)| out_dir.join(dir).is_dir())
        .map(|(dir, text)| (format!("{}/", dir), text.to_string()))
        .collect();

    let summary = PpSummary {
        injections: used,
        links,
        results,
    };
    let index = out_dir.join("index.html");
    fs::write(&index, render::html::render_pp_index(&summary)?)
        .with_context(|| diagnostics::error_message(format!("write {}", index.display())))?;
    Ok(summary)
}

fn write_pvalues(path: &Path, ps: &[f64]) -> Result<()> {
    let mut text = String::new();
    for p in ps {
        text.push_str(&format!("{:.18e}\n", p));
    }
    fs::write(path, text).with_context(|| diagnostics::error_message(format!("write {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fractional_rank_counts_strictly_below() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(fractional_rank(2.5, &xs), Some(0.5));
        assert_eq!(fractional_rank(2.0, &xs), Some(0.25));
        assert_eq!(fractional_rank(0.0, &xs), Some(0.0));
        assert_eq!(fractional_rank(9.0, &xs), Some(1.0));
        assert_eq!(fractional_rank(1.0, &[]), None);
    }

    #[test]
    fn curve_runs_corner_to_corner() {
        let c = pp_curve(&[0.75, 0.25]);
        assert_eq!(c, vec![(0.0, 0.0), (0.25, 0.5), (0.75, 1.0), (1.0, 1.0)]);
        let s = synthetic_curves(5, 3, 7);
        assert_eq!(s.len(), 3);
        assert!(s.iter().all(|c| c.len() == 7 && c.windows(2).all(|w| w[0].0 <= w[1].0)));
    }

    #[test]
    fn ks_rejects_clumped_pvalues_only() {
        let uniform: Vec<f64> = (0..200).map(|i| (i as f64 + 0.5) / 200.0).collect();
        assert!(ks_statistic(&uniform) <= 0.0025 + 1e-12);
        assert!(ks_pvalue(&uniform) > 0.99);

        let clumped = vec![0.01; 50];
        assert!(ks_statistic(&clumped) > 0.98);
        assert!(ks_pvalue(&clumped) < 1e-6);
    }

    #[test]
    fn kolmogorov_tail_matches_known_value() {
        // Q(1.36) is the classic 5% point
        assert!((kolmogorov_q(1.36) - 0.0494).abs() < 1e-3);
        assert_eq!(kolmogorov_q(0.1), 1.0);
    }

    #[test]
    fn extractors_derive_spin_angles() {
        let si = SimInspiral {
            mass1: 2.0,
            mass2: 1.0,
            spin1x: 0.0,
            spin1y: -0.5,
            spin1z: 0.0,
            geocent_end_time: 1000,
            geocent_end_time_ns: 500_000_000,
            ..Default::default()
        };
        assert_eq!(Parameter::Q.extract(&si), 0.5);
        assert_eq!(Parameter::A1.extract(&si), 0.5);
        assert!((Parameter::Theta1.extract(&si) - PI / 2.0).abs() < 1e-12);
        assert!((Parameter::Phi1.extract(&si) - 1.5 * PI).abs() < 1e-12);
        assert_eq!(Parameter::Time.extract(&si), 1000.5);
        assert!(Parameter::Theta2.extract(&si).is_nan());
        assert_eq!("phi_orb".parse::<Parameter>().unwrap(), Parameter::PhiOrb);
        assert!("chi".parse::<Parameter>().is_err());
    }

    #[test]
    fn posterior_tables_need_full_rows() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.dat");
        fs::write(&good, "m1 m2\n1.0 2.0\n\n# note\n3.0 4.0\n").unwrap();
        let s = read_posterior_samples(&good).unwrap();
        assert_eq!(s.column("m2"), Some(&[2.0, 4.0][..]));
        assert_eq!(s.len(), 2);

        let short = dir.path().join("short.dat");
        fs::write(&short, "m1 m2\n1.0\n").unwrap();
        assert!(read_posterior_samples(&short).is_err());
    }

    #[test]
    fn analysis_skips_bad_files_and_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let inj = vec![
            SimInspiral { mass1: 1.5, ..Default::default() },
            SimInspiral { mass1: 0.5, ..Default::default() },
        ];
        let a = dir.path().join("a.dat");
        fs::write(&a, "m1 dist\n1.0 10\n2.0 20\n").unwrap();
        let b = dir.path().join("b.dat");
        fs::write(&b, "m1\n1.0\n2.0\n3.0\n4.0\n").unwrap();
        let missing = dir.path().join("missing.dat");

        let out = dir.path().join("pp");
        fs::create_dir_all(out.join("prior")).unwrap();
        let summary = run_pp_analysis(
            &inj,
            &[a, missing, b],
            &[Parameter::M1, Parameter::Dist, Parameter::Psi],
            &out,
        )
        .unwrap();

        // a pairs with injection 0, b has no injection
        assert_eq!(summary.injections, 1);
        let names: Vec<&str> = summary.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["m1", "dist"]);
        assert_eq!(summary.results[0].ps, vec![0.5]);
        assert_eq!(summary.results[1].ps, vec![0.0]);
        assert_eq!(summary.links, vec![("prior/".to_string(), "Prior samples used in this test".to_string())]);

        let dat = fs::read_to_string(out.join("m1-ps.dat")).unwrap();
        assert_eq!(dat.trim().parse::<f64>().unwrap(), 0.5);
        let html = fs::read_to_string(out.join("index.html")).unwrap();
        assert!(html.contains("m1-ps.dat"));
    }
}
