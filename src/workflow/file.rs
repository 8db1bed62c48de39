//! Analysis files and the tag vocabulary used to select them.

use crate::Result;
use crate::cache::entry::{CacheEntry, file_url};
use crate::diagnostics;
use crate::segment::Segment;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Output categories of the trigger combiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    OffSource,
    OnSource,
    AllTimes,
    ZeroLagOff,
    ZeroLagAll,
    /// One of the numbered off-source trial segments, counted from 1.
    OffTrial(u32),
}

impl Category {
    pub fn tag(&self) -> String {
        match self {
            Category::OffSource => "OFFSOURCE".to_string(),
            Category::OnSource => "ONSOURCE".to_string(),
            Category::AllTimes => "ALL_TIMES".to_string(),
            Category::ZeroLagOff => "ZEROLAG_OFF".to_string(),
            Category::ZeroLagAll => "ZEROLAG_ALL".to_string(),
            Category::OffTrial(n) => format!("OFFTRIAL_{}", n),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFile {
    /// Detector set, e.g. `H1L1V1`.
    pub ifos: String,
    pub segment: Segment,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub path: PathBuf,
}

impl AnalysisFile {
    /// A file named `{IFOS}-{DESCRIPTION}[_{TAGS}]-{START}-{DURATION}.{ext}`
    /// under `dir`.
    pub fn new(
        ifos: &str,
        description: &str,
        segment: Segment,
        tags: Vec<String>,
        dir: &Path,
        extension: &str,
    ) -> Self {
        let mut file = AnalysisFile {
            ifos: ifos.to_string(),
            segment,
            description: description.to_uppercase(),
            tags,
            path: PathBuf::new(),
        };
        let name = format!(
            "{}-{}-{}-{}.{}",
            file.ifos,
            file.tagged_description(),
            segment.start().floor() as i64,
            segment.duration().ceil() as i64,
            extension
        );
        file.path = dir.join(name);
        file
    }

    pub fn tag_str(&self) -> String {
        self.tags.join("_")
    }

    pub fn tagged_description(&self) -> String {
        if self.tags.is_empty() {
            self.description.clone()
        } else {
            format!("{}_{}", self.description, self.tag_str())
        }
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn cache_entry(&self) -> CacheEntry {
        CacheEntry {
            observatory: self.ifos.clone(),
            description: self.tagged_description(),
            segment: self.segment,
            url: file_url(&self.path),
        }
    }
}

/// Ordered list of files with the selection helpers the assembler uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileList(Vec<AnalysisFile>);

impl FileList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, f: AnalysisFile) {
        self.0.push(f);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = AnalysisFile>) {
        self.0.extend(other);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AnalysisFile> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[AnalysisFile] {
        &self.0
    }

    pub fn filter(&self, pred: impl Fn(&AnalysisFile) -> bool) -> FileList {
        FileList(self.0.iter().filter(|f| pred(f)).cloned().collect())
    }

    /// Files carrying exactly this tag.
    pub fn tagged(&self, tag: &str) -> FileList {
        self.filter(|f| f.has_tag(tag))
    }

    /// Files whose joined tag string contains `needle`.
    pub fn tag_str_contains(&self, needle: &str) -> FileList {
        self.filter(|f| f.tag_str().contains(needle))
    }

    /// First file of a category; missing categories are errors.
    ///
    /// If several files match, the first wins.
    pub fn first_of(&self, category: Category) -> Result<&AnalysisFile> {
        let tag = category.tag();
        self.0.iter().find(|f| f.has_tag(&tag)).ok_or_else(|| {
            anyhow!(diagnostics::error_message(format!(
                "no file tagged {} among {} candidates",
                tag,
                self.0.len()
            )))
        })
    }

    /// First file whose tag string contains `needle`; none is an error.
    pub fn first_containing(&self, needle: &str) -> Result<&AnalysisFile> {
        self.0
            .iter()
            .find(|f| f.tag_str().contains(needle))
            .ok_or_else(|| {
                anyhow!(diagnostics::error_message(format!(
                    "no file with '{}' in its tags among {} candidates",
                    needle,
                    self.0.len()
                )))
            })
    }
}

impl From<Vec<AnalysisFile>> for FileList {
    fn from(v: Vec<AnalysisFile>) -> Self {
        Self(v)
    }
}

impl IntoIterator for FileList {
    type Item = AnalysisFile;
    type IntoIter = std::vec::IntoIter<AnalysisFile>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a FileList {
    type Item = &'a AnalysisFile;
    type IntoIter = std::slice::Iter<'a, AnalysisFile>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn file(tags: &[&str]) -> AnalysisFile {
        AnalysisFile::new(
            "H1L1",
            "inspiral",
            Segment::new(100.0, 164.5).unwrap(),
            tags.iter().map(|s| s.to_string()).collect(),
            Path::new("/out"),
            "xml.gz",
        )
    }

    #[test]
    fn names_follow_the_ifo_description_time_convention() {
        let f = file(&["GRB090802", "ALL_TIMES"]);
        assert_eq!(f.name(), "H1L1-INSPIRAL_GRB090802_ALL_TIMES-100-65.xml.gz");
        assert_eq!(f.tag_str(), "GRB090802_ALL_TIMES");
        assert_eq!(
            f.cache_entry().to_string(),
            "H1L1 INSPIRAL_GRB090802_ALL_TIMES 100 64.5 file://localhost/out/H1L1-INSPIRAL_GRB090802_ALL_TIMES-100-65.xml.gz"
        );
    }

    #[test]
    fn exact_tags_do_not_confuse_numbered_trials() {
        let files = FileList::from(vec![file(&["OFFTRIAL_10"]), file(&["OFFTRIAL_1"])]);
        assert_eq!(
            files.first_of(Category::OffTrial(1)).unwrap().tags,
            vec!["OFFTRIAL_1".to_string()]
        );
        // substring matching would pick the first file
        assert_eq!(
            files.first_containing("OFFTRIAL_1").unwrap().tags,
            vec!["OFFTRIAL_10".to_string()]
        );
    }

    #[test]
    fn missing_category_is_an_error() {
        let files = FileList::from(vec![file(&["ONSOURCE"])]);
        let err = files.first_of(Category::OffSource).unwrap_err().to_string();
        assert!(err.contains("OFFSOURCE"));
        assert!(files.first_containing("FOUND").is_err());
    }

    #[test]
    fn filters_keep_order() {
        let files = FileList::from(vec![
            file(&["NSBHINJ", "FOUND"]),
            file(&["NSBHINJ", "MISSED"]),
            file(&["BNSINJ", "FOUND"]),
        ]);
        assert_eq!(files.tag_str_contains("NSBH").len(), 2);
        assert_eq!(files.tagged("FOUND").len(), 2);
    }
}
