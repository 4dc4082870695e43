use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Two embeddings of different dimensionality were compared.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("embedding dimension mismatch: {expected} vs {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Face embedding vector. The dimensionality is fixed by the extraction model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean (L2) norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// True for an all-zero vector, whose direction is undefined.
    pub fn is_zero(&self) -> bool {
        self.norm() == 0.0
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero-norm operand
    /// yields 0.0. Vectors of different length are an error.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, DimensionMismatch> {
        if self.values.len() != other.values.len() {
            return Err(DimensionMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom == 0.0 {
            return Ok(0.0);
        }
        // Rounding can push |dot / denom| just past 1. NaN input stays NaN.
        Ok((dot / denom).clamp(-1.0, 1.0))
    }

    /// Return a unit-length copy. A zero vector is returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        if norm > 0.0 {
            Embedding::new(self.values.iter().map(|v| v / norm).collect())
        } else {
            self.clone()
        }
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// One enrolled face: a student and one of their stored embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub student_id: String,
    pub display_name: String,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::Excused => "excused",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown attendance status: {0} (expected present, absent, late or excused)")]
pub struct UnknownStatus(pub String);

impl FromStr for AttendanceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(Self::Present),
            "absent" => Ok(Self::Absent),
            "late" => Ok(Self::Late),
            "excused" => Ok(Self::Excused),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Who produced an attendance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkSource {
    /// Written by the face recognition pipeline.
    Recognition,
    /// Entered by hand.
    Manual,
}

impl MarkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recognition => "recognition",
            Self::Manual => "manual",
        }
    }

    /// Parse the stored column value. Unknown values are treated as manual.
    pub fn from_column(value: &str) -> Self {
        if value == "recognition" {
            Self::Recognition
        } else {
            Self::Manual
        }
    }
}

/// One attendance row. At most one exists per (student_id, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub student_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub remarks: String,
    pub source: MarkSource,
}

impl AttendanceRecord {
    /// Presence record written after a successful recognition.
    pub fn presence(student_id: impl Into<String>, date: NaiveDate, confidence: f32) -> Self {
        Self {
            student_id: student_id.into(),
            date,
            status: AttendanceStatus::Present,
            remarks: recognition_remarks(confidence),
            source: MarkSource::Recognition,
        }
    }
}

/// Remarks attached to an automatically marked record, e.g.
/// `Auto-marked via facial recognition (93.4% match)`.
pub fn recognition_remarks(confidence: f32) -> String {
    format!(
        "Auto-marked via facial recognition ({:.1}% match)",
        confidence * 100.0
    )
}
