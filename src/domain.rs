use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConvertError;

/// One record per acquired series, in the canonical column order used by
/// the persisted `dicominfo.tsv`.
#[derive(Debug, Clone, PartialEq)]
pub struct SeqInfo {
    pub total_files_till_now: usize,
    pub example_dcm_file: String,
    pub series_id: String,
    pub dcm_dir_name: String,
    pub unspecified2: String,
    pub unspecified3: String,
    pub dim1: u32,
    pub dim2: u32,
    pub dim3: u32,
    pub dim4: u32,
    pub tr: f64,
    pub te: f64,
    pub protocol_name: String,
    pub is_motion_corrected: bool,
    pub is_derived: bool,
    pub patient_id: String,
    pub study_description: String,
    pub referring_physician_name: String,
    pub series_description: String,
    pub image_type: Vec<String>,
    pub accession_number: String,
    pub patient_age: String,
    pub patient_sex: String,
    pub date: String,
    pub series_uid: String,
    pub time: String,
}

pub const SEQINFO_COLUMNS: [&str; 26] = [
    "total_files_till_now",
    "example_dcm_file",
    "series_id",
    "dcm_dir_name",
    "unspecified2",
    "unspecified3",
    "dim1",
    "dim2",
    "dim3",
    "dim4",
    "TR",
    "TE",
    "protocol_name",
    "is_motion_corrected",
    "is_derived",
    "patient_id",
    "study_description",
    "referring_physician_name",
    "series_description",
    "image_type",
    "accession_number",
    "patient_age",
    "patient_sex",
    "date",
    "series_uid",
    "time",
];

impl SeqInfo {
    /// Series number encoded as the leading component of `series_id`.
    pub fn series_number(&self) -> i64 {
        self.series_id
            .split('-')
            .next()
            .and_then(|value| value.parse().ok())
            .unwrap_or(-1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Nii,
    #[serde(rename = "nii.gz")]
    NiiGz,
    Dicom,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Nii => write!(f, "nii"),
            OutputKind::NiiGz => write!(f, "nii.gz"),
            OutputKind::Dicom => write!(f, "dicom"),
        }
    }
}

impl FromStr for OutputKind {
    type Err = ConvertError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "nii" => Ok(OutputKind::Nii),
            "nii.gz" => Ok(OutputKind::NiiGz),
            "dicom" => Ok(OutputKind::Dicom),
            other => Err(ConvertError::Heuristic(format!(
                "unknown output kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GroupingMode {
    #[value(name = "accession_number")]
    AccessionNumber,
    #[value(name = "studyUID")]
    StudyUid,
    All,
    Custom,
}

impl Default for GroupingMode {
    fn default() -> Self {
        GroupingMode::AccessionNumber
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Converter {
    Dcm2niix,
    None,
}

/// The heuristic's decision for where a series group ends up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionTarget {
    pub template: String,
    pub outtypes: Vec<OutputKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

impl ConversionTarget {
    pub fn new(
        template: &str,
        outtypes: &[OutputKind],
        annotation: Option<String>,
    ) -> Result<Self, ConvertError> {
        if template.trim().is_empty() {
            return Err(ConvertError::Heuristic(
                "target template must be a non-empty string".to_string(),
            ));
        }
        let outtypes = if outtypes.is_empty() {
            vec![OutputKind::NiiGz]
        } else {
            outtypes.to_vec()
        };
        Ok(Self {
            template: template.to_string(),
            outtypes,
            annotation,
        })
    }
}

/// A series assigned to a target, possibly binding extra template slots.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesBinding {
    pub series_id: String,
    pub bindings: BTreeMap<String, String>,
}

impl SeriesBinding {
    pub fn plain(series_id: &str) -> Self {
        Self {
            series_id: series_id.to_string(),
            bindings: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetDecision {
    pub target: ConversionTarget,
    pub series: Vec<SeriesBinding>,
}

/// Identifies the study session one group of DICOMs belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StudySession {
    pub locator: Option<String>,
    pub session: Option<String>,
    pub subject: Option<String>,
}

impl fmt::Display for StudySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "locator={} session={} subject={}",
            self.locator.as_deref().unwrap_or("-"),
            self.session.as_deref().unwrap_or("-"),
            self.subject.as_deref().unwrap_or("-"),
        )
    }
}

/// Strip non-alphanumeric characters from a subject or session label.
pub fn sanitize_label(label: &str) -> Result<String, ConvertError> {
    let clean: String = label.chars().filter(|ch| ch.is_alphanumeric()).collect();
    if clean.is_empty() {
        return Err(ConvertError::InvalidLabel(format!(
            "label {label:?} became empty after cleanup"
        )));
    }
    if clean != label {
        tracing::warn!("label {:?} was cleaned to {:?}", label, clean);
    }
    Ok(clean)
}

/// Substitute `{name}` and `{name:0Nd}` placeholders in a target template.
pub fn fill_template(
    template: &str,
    bindings: &BTreeMap<String, String>,
) -> Result<String, ConvertError> {
    let placeholder = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(?::0?(\d+)d)?\}")
        .expect("placeholder pattern is valid");
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder.captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        let value = bindings.get(name).ok_or_else(|| {
            ConvertError::Heuristic(format!("template references unknown slot {{{name}}}"))
        })?;
        out.push_str(&template[last..whole.start()]);
        match caps.get(2) {
            Some(width) => {
                let width: usize = width.as_str().parse().unwrap_or(0);
                let number: i64 = value.parse().map_err(|_| {
                    ConvertError::Heuristic(format!(
                        "slot {{{name}}} requires a numeric value, got {value:?}"
                    ))
                })?;
                out.push_str(&format!("{number:0width$}"));
            }
            None => out.push_str(value),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_slots() {
        let mut bindings = BTreeMap::new();
        bindings.insert("subject".to_string(), "219".to_string());
        bindings.insert("item".to_string(), "3".to_string());
        let filled = fill_template("sub-{subject}/run{item:03d}", &bindings).unwrap();
        assert_eq!(filled, "sub-219/run003");

        assert!(fill_template("{nosuch}", &bindings).is_err());
    }

    #[test]
    fn labels_are_sanitized() {
        assert_eq!(sanitize_label("sid 01-a").unwrap(), "sid01a");
        assert!(sanitize_label("--").is_err());
    }
}
