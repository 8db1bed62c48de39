//! GPS time segments.
//!
//! A segment is the half-open interval `[start, end)` in GPS seconds.

use crate::Result;
use crate::diagnostics;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "[f64; 2]", into = "[f64; 2]")]
pub struct Segment {
    start: f64,
    end: f64,
}

impl Segment {
    pub fn new(start: f64, end: f64) -> Result<Self> {
        if !(start.is_finite() && end.is_finite()) {
            bail!(
                "{}",
                diagnostics::error_message(format!("segment bounds must be finite: [{}, {})", start, end))
            );
        }
        if end < start {
            bail!(
                "{}",
                diagnostics::error_message(format!("segment ends before it starts: [{}, {})", start, end))
            );
        }
        Ok(Self { start, end })
    }

    pub fn from_duration(start: f64, duration: f64) -> Result<Self> {
        Self::new(start, start + duration)
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t < self.end
    }

    /// Closed-interval test, `start <= t <= end`.
    pub fn covers(&self, t: f64) -> bool {
        self.start <= t && t <= self.end
    }

    pub fn intersects(&self, other: &Segment) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl TryFrom<[f64; 2]> for Segment {
    type Error = anyhow::Error;

    fn try_from(v: [f64; 2]) -> Result<Self> {
        Segment::new(v[0], v[1])
    }
}

impl From<Segment> for [f64; 2] {
    fn from(s: Segment) -> Self {
        [s.start, s.end]
    }
}
