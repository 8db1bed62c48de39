//! Input manifest for the post-processing assembler.
//!
//! Everything the upstream analysis stage hands over: trigger files,
//! injection runs, directories and the analysis segment. Loaded from JSON:
//!
//! {
//!   "ifos": "H1L1",
//!   "analysis_time": [969675608, 969677820],
//!   "trigger_files": [ { "ifos": "H1L1", "segment": [..], "description": "INSPIRAL",
//!                        "tags": ["COHERENT_NO_INJECTIONS"], "path": "/data/..." } ],
//!   "output_dir": "post_processing",
//!   "html_dir": "/home/user/public_html/GRB090802",
//!   "segment_dir": "segments"
//! }

use crate::Result;
use crate::diagnostics;
use crate::segment::Segment;
use crate::workflow::file::FileList;

use anyhow::{Context, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub ifos: String,
    pub analysis_time: Segment,
    pub trigger_files: FileList,
    /// Present only for runs with short time slides.
    #[serde(default)]
    pub timeslide_trigger_files: Option<FileList>,
    #[serde(default)]
    pub injection_trigger_files: FileList,
    #[serde(default)]
    pub injection_files: FileList,
    #[serde(default)]
    pub injection_tags: Vec<String>,
    #[serde(default)]
    pub config_file: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub html_dir: PathBuf,
    pub segment_dir: PathBuf,
    #[serde(default)]
    pub segments_plot: Option<PathBuf>,
    /// User tags carried by every job, e.g. `POSTPROC1`.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| {
            diagnostics::error_message(format!("read manifest {}", path.display()))
        })?;
        let m: Manifest = serde_json::from_str(&text).with_context(|| {
            diagnostics::error_message(format!("parse manifest {}", path.display()))
        })?;
        m.check()?;
        Ok(m)
    }

    fn check(&self) -> Result<()> {
        if self.trigger_files.is_empty() {
            bail!("{}", diagnostics::error_message("manifest lists no trigger files"));
        }
        if self.ifos.is_empty() {
            bail!("{}", diagnostics::error_message("manifest has an empty ifos field"));
        }
        Ok(())
    }

    /// Time-slide trigger files, treating an empty list as absent.
    pub fn timeslides(&self) -> Option<&FileList> {
        self.timeslide_trigger_files.as_ref().filter(|l| !l.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
        "ifos": "H1L1",
        "analysis_time": [1000, 2000],
        "trigger_files": [
            { "ifos": "H1L1", "segment": [1000, 2000], "description": "INSPIRAL",
              "tags": ["COHERENT_NO_INJECTIONS"], "path": "/data/a.xml.gz" }
        ],
        "timeslide_trigger_files": [],
        "output_dir": "out",
        "html_dir": "html",
        "segment_dir": "segs"
    }"#;

    #[test]
    fn loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("manifest.json");
        fs::write(&p, SAMPLE).unwrap();
        let m = Manifest::load(&p).unwrap();
        assert_eq!(m.analysis_time, Segment::new(1000.0, 2000.0).unwrap());
        assert_eq!(m.trigger_files.len(), 1);
        assert!(m.injection_tags.is_empty());
        assert!(m.timeslides().is_none());
    }

    #[test]
    fn empty_trigger_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("manifest.json");
        let text = SAMPLE.replace(
            r#"{ "ifos": "H1L1", "segment": [1000, 2000], "description": "INSPIRAL",
              "tags": ["COHERENT_NO_INJECTIONS"], "path": "/data/a.xml.gz" }"#,
            "",
        );
        fs::write(&p, text).unwrap();
        let err = Manifest::load(&p).unwrap_err().to_string();
        assert!(err.contains("no trigger files"));
    }
}
