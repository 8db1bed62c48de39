//! Index of pipeline output files by trigger type and detector combination.

use crate::Result;
use crate::cache::entry::{CacheEntry, read_cache_file, write_cache_file};
use crate::config::Config;
use crate::diagnostics;

use anyhow::{Context, bail};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The detector combinations a follow-up can ask about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IfoCombo {
    H1,
    H2,
    L1,
    H1H2,
    H1L1,
    H2L1,
    H1H2L1,
}

impl IfoCombo {
    pub const ALL: [IfoCombo; 7] = [
        IfoCombo::H1,
        IfoCombo::H2,
        IfoCombo::L1,
        IfoCombo::H1H2,
        IfoCombo::H1L1,
        IfoCombo::H2L1,
        IfoCombo::H1H2L1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IfoCombo::H1 => "H1",
            IfoCombo::H2 => "H2",
            IfoCombo::L1 => "L1",
            IfoCombo::H1H2 => "H1H2",
            IfoCombo::H1L1 => "H1L1",
            IfoCombo::H2L1 => "H2L1",
            IfoCombo::H1H2L1 => "H1H2L1",
        }
    }
}

impl fmt::Display for IfoCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IfoCombo {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        IfoCombo::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!(diagnostics::error_message(format!("unknown ifo combination {}", s))))
    }
}

/// One (initially empty) list per detector combination.
pub type IfoLists = BTreeMap<IfoCombo, Vec<CacheEntry>>;

pub fn empty_ifo_lists() -> IfoLists {
    IfoCombo::ALL.iter().map(|c| (*c, Vec::new())).collect()
}

/// A pipeline trigger type: the file-name pattern, the config option naming
/// its directory and the cache file it is written to.
#[derive(Debug, Clone, Copy)]
pub struct TriggerType {
    pub pattern: &'static str,
    pub path_option: &'static str,
    pub cache_name: &'static str,
}

pub const TRIGGER_TYPES: [TriggerType; 6] = [
    TriggerType { pattern: "TMPLTBANK", path_option: "tmpltbank-path", cache_name: "bank.cache" },
    TriggerType { pattern: "TRIGBANK", path_option: "trigbank-path", cache_name: "trigbank.cache" },
    TriggerType { pattern: "INSPIRAL-", path_option: "first-inspiral-path", cache_name: "first_inspiral.cache" },
    TriggerType { pattern: "INSPIRAL_", path_option: "second-inspiral-path", cache_name: "second_inspiral.cache" },
    TriggerType { pattern: "THINCA-", path_option: "first-coinc-path", cache_name: "first_thinca.cache" },
    TriggerType { pattern: "THINCA_", path_option: "second-coinc-path", cache_name: "second_thinca.cache" },
];

const CACHE_SECTION: &str = "hipe-cache";
const SKIP_MARKER: &str = "FOLLOWUP";

/// Cache entries per trigger type, built from directory listings.
#[derive(Debug, Default)]
pub struct FileCache {
    fallback_dir: PathBuf,
    entries: BTreeMap<&'static str, Vec<CacheEntry>>,
}

impl FileCache {
    /// `fallback_dir` is scanned for types whose directory is not configured.
    pub fn new(fallback_dir: impl Into<PathBuf>) -> Self {
        Self {
            fallback_dir: fallback_dir.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn entries(&self, pattern: &str) -> &[CacheEntry] {
        self.entries.get(pattern).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Scan the directory for one trigger type.
    ///
    /// Names that do not parse are skipped. Without a `science-run` option
    /// no entry can be built and the type stays empty.
    pub fn collect_type(&mut self, ty: &TriggerType, cp: Option<&Config>) -> Result<usize> {
        let configured = cp
            .and_then(|cp| cp.get(CACHE_SECTION, ty.path_option).ok())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let dir = match configured {
            Some(dir) if dir.is_dir() => dir,
            Some(dir) => {
                diagnostics::warn(format!(
                    "[{}] {} is not a directory: {}; scanning {}",
                    CACHE_SECTION,
                    ty.path_option,
                    dir.display(),
                    self.fallback_dir.display()
                ));
                self.fallback_dir.clone()
            }
            None => self.fallback_dir.clone(),
        };
        if !dir.is_dir() {
            diagnostics::warn(format!("no {} files cached: {} is not a directory", ty.pattern, dir.display()));
            self.entries.insert(ty.pattern, Vec::new());
            return Ok(0);
        }
        let dir = std::path::absolute(&dir).with_context(|| {
            diagnostics::error_message(format!("resolve cache directory {}", dir.display()))
        })?;

        let pattern = Regex::new(&regex::escape(ty.pattern))?;
        let science_run = cp.and_then(|cp| cp.get(CACHE_SECTION, "science-run").ok());
        if science_run.is_none() {
            diagnostics::warn(format!("no [{}] science-run; {} files cannot be cached", CACHE_SECTION, ty.pattern));
        }

        let mut found = Vec::new();
        for name in list_dir(&dir)? {
            if name.contains(SKIP_MARKER) || !pattern.is_match(&name) {
                continue;
            }
            let Some(run) = science_run else {
                diagnostics::skipped(&name, "no science-run configured");
                continue;
            };
            match CacheEntry::from_filename(&dir, &name, run) {
                Ok(e) => found.push(e),
                Err(e) => diagnostics::skipped(&name, e),
            }
        }
        found.sort_by(|a, b| a.url.cmp(&b.url));

        log::debug!("{} entries of type {} in {}", found.len(), ty.pattern, dir.display());
        let n = found.len();
        self.entries.insert(ty.pattern, found);
        Ok(n)
    }

    pub fn collect_all(&mut self, cp: Option<&Config>) -> Result<()> {
        for ty in &TRIGGER_TYPES {
            self.collect_type(ty, cp)?;
        }
        Ok(())
    }

    pub fn write_type(&self, ty: &TriggerType, out_dir: &Path) -> Result<PathBuf> {
        let path = out_dir.join(ty.cache_name);
        write_cache_file(&path, self.entries(ty.pattern))?;
        Ok(path)
    }

    pub fn write_all(&self, out_dir: &Path) -> Result<Vec<PathBuf>> {
        TRIGGER_TYPES
            .iter()
            .map(|ty| self.write_type(ty, out_dir))
            .collect()
    }

    /// Entries of one trigger type covering the requested time per combination.
    pub fn files_matching_gps(&self, times: &BTreeMap<IfoCombo, f64>, pattern: &str) -> IfoLists {
        match_entries(self.entries(pattern).iter().cloned(), times)
    }
}

/// Entries of a cache file covering the requested time per combination.
pub fn files_matching_gps_in_cache(times: &BTreeMap<IfoCombo, f64>, cache: &Path) -> Result<IfoLists> {
    Ok(match_entries(read_cache_file(cache)?, times))
}

/// An entry matches a combination when its observatory is exactly that
/// combination and `start <= t <= end`.
fn match_entries(
    entries: impl IntoIterator<Item = CacheEntry>,
    times: &BTreeMap<IfoCombo, f64>,
) -> IfoLists {
    let mut out = empty_ifo_lists();
    for entry in entries {
        let Ok(combo) = entry.observatory.parse::<IfoCombo>() else {
            continue;
        };
        let Some(t) = times.get(&combo) else {
            continue;
        };
        if entry.segment.covers(*t) {
            out.entry(combo).or_default().push(entry);
        }
    }
    out
}

fn list_dir(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        bail!(
            "{}",
            diagnostics::error_message(format!("not a directory: {}", dir.display()))
        );
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| diagnostics::error_message(format!("list directory {}", dir.display())))?
    {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "").unwrap();
    }

    fn config_for(dir: &Path) -> Config {
        let mut cp = Config::default();
        cp.set(CACHE_SECTION, "science-run", "S5");
        cp.set(CACHE_SECTION, "first-inspiral-path", dir.display().to_string());
        cp
    }

    #[test]
    fn collects_matching_files_and_skips_followups() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "H1-INSPIRAL-100-50.xml");
        touch(dir.path(), "L1-INSPIRAL-100-50.xml");
        touch(dir.path(), "H1-INSPIRAL_FOLLOWUP-100-50.xml");
        touch(dir.path(), "H1-INSPIRAL-bad-50.xml");
        touch(dir.path(), "H1-TMPLTBANK-100-50.xml");

        let cp = config_for(dir.path());
        let mut cache = FileCache::new(dir.path());
        let n = cache.collect_type(&TRIGGER_TYPES[2], Some(&cp)).unwrap();
        assert_eq!(n, 2);
        let obs: Vec<&str> = cache
            .entries("INSPIRAL-")
            .iter()
            .map(|e| e.observatory.as_str())
            .collect();
        assert_eq!(obs, vec!["H1", "L1"]);
    }

    #[test]
    fn no_science_run_means_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "H1-TMPLTBANK-100-50.xml");
        let mut cache = FileCache::new(dir.path());
        cache.collect_all(None).unwrap();
        assert!(cache.entries("TMPLTBANK").is_empty());
    }

    #[test]
    fn missing_configured_directory_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "H1-INSPIRAL-100-50.xml");
        touch(dir.path(), "H1-THINCA-100-50.xml");

        let mut cp = config_for(Path::new("/nonexistent/dir"));
        cp.set(CACHE_SECTION, "tmpltbank-path", "/nonexistent/other");
        let mut cache = FileCache::new(dir.path());
        cache.collect_all(Some(&cp)).unwrap();
        assert_eq!(cache.entries("INSPIRAL-").len(), 1);
        assert_eq!(cache.entries("THINCA-").len(), 1);
        assert!(cache.entries("TMPLTBANK").is_empty());
    }

    #[test]
    fn missing_fallback_directory_caches_nothing() {
        let mut cache = FileCache::new("/nonexistent/fallback");
        cache.collect_all(None).unwrap();
        assert!(cache.entries("INSPIRAL_").is_empty());
    }

    #[test]
    fn gps_query_groups_by_combination() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "H1-THINCA_SECOND-100-50.xml");
        touch(dir.path(), "H1L1-THINCA_SECOND-100-50.xml");
        touch(dir.path(), "H1L1-THINCA_SECOND-200-50.xml");

        let mut cp = config_for(dir.path());
        cp.set(CACHE_SECTION, "second-coinc-path", dir.path().display().to_string());
        let mut cache = FileCache::new(dir.path());
        cache.collect_all(Some(&cp)).unwrap();

        let times = BTreeMap::from([(IfoCombo::H1, 150.0), (IfoCombo::H1L1, 210.0)]);
        let hits = cache.files_matching_gps(&times, "THINCA_");
        assert_eq!(hits.len(), 7);
        assert_eq!(hits[&IfoCombo::H1].len(), 1);
        assert_eq!(hits[&IfoCombo::H1L1].len(), 1);
        assert_eq!(hits[&IfoCombo::H1L1][0].segment.start(), 200.0);
        assert!(hits[&IfoCombo::L1].is_empty());
    }

    #[test]
    fn writes_and_queries_cache_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "H2-INSPIRAL-1000-100.xml");
        let cp = config_for(dir.path());
        let mut cache = FileCache::new(dir.path());
        cache.collect_all(Some(&cp)).unwrap();

        let out = tempfile::tempdir().unwrap();
        let written = cache.write_all(out.path()).unwrap();
        assert_eq!(written.len(), TRIGGER_TYPES.len());

        let times = BTreeMap::from([(IfoCombo::H2, 1100.0)]);
        let hits =
            files_matching_gps_in_cache(&times, &out.path().join("first_inspiral.cache")).unwrap();
        assert_eq!(hits[&IfoCombo::H2].len(), 1);
    }

    #[test]
    fn combination_names_round_trip() {
        for c in IfoCombo::ALL {
            assert_eq!(c.as_str().parse::<IfoCombo>().unwrap(), c);
        }
        assert!("V1".parse::<IfoCombo>().is_err());
    }
}
