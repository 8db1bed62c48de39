//! LAL cache entries.
//!
//! A cache line has five whitespace-separated fields:
//! observatory  description  gps_start  duration  url
//!
//! Example:
//! H1 S5_FIRST_INSPIRAL 847555570 2048 file://localhost/data/H1-INSPIRAL-847555570-2048.xml

use crate::Result;
use crate::diagnostics;
use crate::segment::Segment;

use anyhow::{Context, anyhow, bail};
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const FILE_URL_PREFIXES: [&str; 2] = ["file://localhost", "file://"];

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub observatory: String,
    pub description: String,
    pub segment: Segment,
    pub url: String,
}

// Fields beyond the fifth are ignored.
const LINE_RE: &str = r#"^\s*(\S+)\s+(\S+)\s+([-+0-9.eE]+)\s+([-+0-9.eE]+)\s+(\S+)"#;

impl CacheEntry {
    /// Parse one cache line.
    pub fn parse(line: &str) -> Result<Self> {
        let re = Regex::new(LINE_RE)?;
        let caps = re.captures(line).ok_or_else(|| {
            anyhow!(diagnostics::error_message(format!(
                "cannot parse cache line: {:?}",
                line
            )))
        })?;

        let start: f64 = caps[3]
            .parse()
            .with_context(|| diagnostics::error_message(format!("bad gps start {}", &caps[3])))?;
        let duration: f64 = caps[4]
            .parse()
            .with_context(|| diagnostics::error_message(format!("bad duration {}", &caps[4])))?;

        Ok(CacheEntry {
            observatory: caps[1].to_string(),
            description: caps[2].to_string(),
            segment: Segment::from_duration(start, duration)?,
            url: caps[5].to_string(),
        })
    }

    /// Build an entry from a file named `IFO-TAG-START-DURATION.ext`.
    ///
    /// The observatory is the first `-` field, the start the second to last
    /// and the duration the last one up to its extension.
    pub fn from_filename(dir: &Path, name: &str, description: &str) -> Result<Self> {
        let fields: Vec<&str> = name.split('-').collect();
        if fields.len() < 3 {
            bail!(
                "{}",
                diagnostics::error_message(format!("file name has too few '-' fields: {}", name))
            );
        }
        let ifo = fields[0];
        let start_str = fields[fields.len() - 2];
        let last = fields[fields.len() - 1];
        let dur_str = last.split('.').next().unwrap_or(last);

        if ifo.is_empty() {
            bail!(
                "{}",
                diagnostics::error_message(format!("file name has empty ifo field: {}", name))
            );
        }
        let start: f64 = start_str.parse().with_context(|| {
            diagnostics::error_message(format!("bad gps start in file name {}", name))
        })?;
        let duration: f64 = dur_str.parse().with_context(|| {
            diagnostics::error_message(format!("bad duration in file name {}", name))
        })?;

        Ok(CacheEntry {
            observatory: ifo.to_string(),
            description: description.to_string(),
            segment: Segment::from_duration(start, duration)?,
            url: file_url(&dir.join(name)),
        })
    }

    /// Local path of the entry, if its url points at a file.
    pub fn path(&self) -> Option<PathBuf> {
        FILE_URL_PREFIXES
            .iter()
            .find_map(|p| self.url.strip_prefix(p))
            .map(PathBuf::from)
    }
}

impl fmt::Display for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.observatory,
            self.description,
            self.segment.start(),
            self.segment.duration(),
            self.url
        )
    }
}

pub fn file_url(path: &Path) -> String {
    format!("file://localhost{}", path.display())
}

/// Read every well-formed entry of a cache file. Malformed lines are skipped.
pub fn read_cache_file(path: &Path) -> Result<Vec<CacheEntry>> {
    let text = fs::read_to_string(path)
        .with_context(|| diagnostics::error_message(format!("read cache file {}", path.display())))?;

    let mut out = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match CacheEntry::parse(line) {
            Ok(entry) => out.push(entry),
            Err(e) => diagnostics::skipped(format!("{}:{}", path.display(), lineno + 1), e),
        }
    }
    Ok(out)
}

pub fn write_cache_file(path: &Path, entries: &[CacheEntry]) -> Result<()> {
    let mut text = String::new();
    for e in entries {
        text.push_str(&e.to_string());
        text.push('\n');
    }
    fs::write(path, text)
        .with_context(|| diagnostics::error_message(format!("write cache file {}", path.display())))
}

/// Urls of the entries in `path` whose segment intersects `seg`.
pub fn urls_intersecting(path: &Path, seg: &Segment) -> Result<Vec<String>> {
    Ok(read_cache_file(path)?
        .into_iter()
        .filter(|e| e.segment.intersects(seg))
        .map(|e| e.url)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_and_prints_a_line() {
        let line = "H1 S5 847555570 2048 file://localhost/data/H1-INSPIRAL-847555570-2048.xml";
        let e = CacheEntry::parse(line).unwrap();
        assert_eq!(e.observatory, "H1");
        assert_eq!(e.segment.end(), 847557618.0);
        assert_eq!(e.to_string(), line);
        assert_eq!(
            e.path().unwrap(),
            PathBuf::from("/data/H1-INSPIRAL-847555570-2048.xml")
        );
    }

    #[test]
    fn rejects_short_lines() {
        assert!(CacheEntry::parse("H1 S5 100").is_err());
        assert!(CacheEntry::parse("H1 S5 abc 10 file:///x").is_err());
    }

    #[test]
    fn filename_maps_to_ifo_and_time_range() {
        let e = CacheEntry::from_filename(
            Path::new("/triggers"),
            "H1L1-THINCA_SECOND-873247860-2000.xml",
            "S6",
        )
        .unwrap();
        assert_eq!(e.observatory, "H1L1");
        assert_eq!(e.segment, Segment::new(873247860.0, 873249860.0).unwrap());
        assert!(e.segment.contains(873247860.0));
        assert!(!e.segment.contains(873249860.0));
        assert_eq!(
            e.url,
            "file://localhost/triggers/H1L1-THINCA_SECOND-873247860-2000.xml"
        );
    }

    #[test]
    fn compressed_extension_is_stripped_from_duration() {
        let e = CacheEntry::from_filename(Path::new("/d"), "L1-INSPIRAL-10-20.xml.gz", "S6").unwrap();
        assert_eq!(e.segment.duration(), 20.0);
    }

    #[test]
    fn malformed_names_are_errors() {
        assert!(CacheEntry::from_filename(Path::new("/d"), "README.txt", "S6").is_err());
        assert!(CacheEntry::from_filename(Path::new("/d"), "H1-X-start-20.xml", "S6").is_err());
    }

    #[test]
    fn reading_a_cache_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cache");
        fs::write(
            &path,
            "H1 A 0 10 file://localhost/a\nnot a cache line\n\nL1 B 5 10 file://localhost/b\n",
        )
        .unwrap();
        let entries = read_cache_file(&path).unwrap();
        assert_eq!(entries.len(), 2);

        let urls = urls_intersecting(&path, &Segment::new(12.0, 13.0).unwrap()).unwrap();
        assert_eq!(urls, vec!["file://localhost/b".to_string()]);
    }
}
