use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dicom::DicomHeader;
use crate::domain::{
    sanitize_label, ConversionTarget, OutputKind, SeqInfo, SeriesBinding, TargetDecision,
};
use crate::error::ConvertError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchingParameter {
    Shims,
    ImagingVolume,
    ModalityAcquisitionLabel,
    CustomAcquisitionLabel,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Criterion {
    First,
    Closest,
}

impl Default for Criterion {
    fn default() -> Self {
        Criterion::Closest
    }
}

/// Heuristic-provided options for the fieldmap associator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntendedForOpts {
    pub matching: Vec<MatchingParameter>,
    #[serde(default)]
    pub criterion: Criterion,
}

#[derive(Debug, Clone, Default)]
pub struct StudyIds {
    pub locator: Option<String>,
    pub session: Option<String>,
    pub subject: Option<String>,
}

/// The heuristic contract. Only `infotodict` is required; the remaining
/// entry points default to no-ops.
pub trait Heuristic: std::fmt::Debug {
    fn name(&self) -> &str;

    /// Verbatim form frozen into the provenance store for drift detection.
    fn frozen_form(&self) -> String;

    fn infotodict(&self, seqinfos: &[SeqInfo]) -> Result<Vec<TargetDecision>, ConvertError>;

    fn infotoids(&self, _seqinfos: &[SeqInfo], _outdir: &Utf8Path) -> Option<StudyIds> {
        None
    }

    /// Return true to exclude the path from consideration.
    fn filter_file(&self, _path: &Utf8Path) -> bool {
        false
    }

    /// Return true to exclude the DICOM from consideration.
    fn filter_dicom(&self, _header: &DicomHeader) -> bool {
        false
    }

    /// DICOM attribute to group by; only consulted under `custom` grouping.
    fn grouping_attribute(&self) -> Option<String> {
        None
    }

    /// Ordered (group key, header indices) mapping; overrides the attribute
    /// form under `custom` grouping when implemented.
    fn group_custom(&self, _headers: &[DicomHeader]) -> Option<Vec<(String, Vec<usize>)>> {
        None
    }

    fn split_echo_series(&self) -> bool {
        false
    }

    fn intended_for(&self) -> Option<IntendedForOpts> {
        None
    }

    /// Defaults merged into `dataset_description.json`.
    fn default_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }
}

/// Default `create_key` helper offered to heuristics.
pub fn create_key(
    template: &str,
    outtypes: &[OutputKind],
    annotation: Option<String>,
) -> Result<ConversionTarget, ConvertError> {
    ConversionTarget::new(template, outtypes, annotation)
}

/// Host-side validation of whatever a heuristic returned.
pub fn validate_decisions(
    decisions: &[TargetDecision],
    seqinfos: &[SeqInfo],
) -> Result<(), ConvertError> {
    for decision in decisions {
        if decision.target.template.trim().is_empty() {
            return Err(ConvertError::Heuristic(
                "heuristic returned an empty target template".to_string(),
            ));
        }
        if decision.target.outtypes.is_empty() {
            return Err(ConvertError::Heuristic(format!(
                "target {:?} declares no output kinds",
                decision.target.template
            )));
        }
        for series in &decision.series {
            if !seqinfos.iter().any(|s| s.series_id == series.series_id) {
                return Err(ConvertError::Heuristic(format!(
                    "heuristic references unknown series_id {:?}",
                    series.series_id
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct MatchSpec {
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    series_description: Option<String>,
    #[serde(default)]
    image_type: Option<String>,
    #[serde(default)]
    min_dim3: Option<u32>,
    #[serde(default)]
    max_dim3: Option<u32>,
    #[serde(default)]
    min_dim4: Option<u32>,
    #[serde(default)]
    max_dim4: Option<u32>,
    #[serde(default)]
    is_derived: Option<bool>,
    #[serde(default)]
    is_motion_corrected: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Rule {
    template: String,
    #[serde(default)]
    outtypes: Vec<OutputKind>,
    #[serde(default, rename = "match")]
    matches: MatchSpec,
    /// Extra template slots bound for every series this rule claims.
    #[serde(default)]
    set: BTreeMap<String, String>,
    #[serde(default)]
    annotation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum IdSource {
    From { from: String },
    Fixed { fixed: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    description: Option<String>,
    rules: Vec<Rule>,
    #[serde(default)]
    subject: Option<IdSource>,
    #[serde(default)]
    session: Option<IdSource>,
    #[serde(default)]
    locator: Option<String>,
    #[serde(default)]
    grouping: Option<String>,
    #[serde(default)]
    split_echo_series: bool,
    #[serde(default)]
    exclude_files: Vec<String>,
    #[serde(default)]
    exclude_protocols: Vec<String>,
    #[serde(default)]
    populate_intended_for: Option<IntendedForOpts>,
    #[serde(default)]
    default_fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
struct CompiledRule {
    protocol: Option<Regex>,
    series_description: Option<Regex>,
}

/// Declarative heuristic: an ordered rule list evaluated against each
/// `SeqInfo`; a series lands in every rule that matches it.
#[derive(Debug)]
pub struct RuleHeuristic {
    name: String,
    source_text: String,
    spec: RuleFile,
    compiled: Vec<CompiledRule>,
    exclude_files: Vec<Regex>,
    exclude_protocols: Vec<Regex>,
}

impl RuleHeuristic {
    fn parse(name: &str, origin: &str, text: String) -> Result<Self, ConvertError> {
        let spec: RuleFile =
            serde_json::from_str(&text).map_err(|err| ConvertError::HeuristicParse {
                path: origin.to_string(),
                message: err.to_string(),
            })?;
        if spec.rules.is_empty() {
            return Err(ConvertError::HeuristicParse {
                path: origin.to_string(),
                message: "heuristic declares no rules".to_string(),
            });
        }
        let compile = |pattern: &Option<String>, what: &str| -> Result<Option<Regex>, ConvertError> {
            pattern
                .as_deref()
                .map(|p| {
                    Regex::new(p).map_err(|err| ConvertError::HeuristicParse {
                        path: origin.to_string(),
                        message: format!("bad {what} pattern {p:?}: {err}"),
                    })
                })
                .transpose()
        };
        let mut compiled = Vec::with_capacity(spec.rules.len());
        for rule in &spec.rules {
            if rule.template.trim().is_empty() {
                return Err(ConvertError::HeuristicParse {
                    path: origin.to_string(),
                    message: "rule template must be a non-empty string".to_string(),
                });
            }
            compiled.push(CompiledRule {
                protocol: compile(&rule.matches.protocol, "protocol")?,
                series_description: compile(&rule.matches.series_description, "series_description")?,
            });
        }
        let compile_list = |patterns: &[String], what: &str| -> Result<Vec<Regex>, ConvertError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|err| ConvertError::HeuristicParse {
                        path: origin.to_string(),
                        message: format!("bad {what} pattern {p:?}: {err}"),
                    })
                })
                .collect()
        };
        let exclude_files = compile_list(&spec.exclude_files, "exclude_files")?;
        let exclude_protocols = compile_list(&spec.exclude_protocols, "exclude_protocols")?;
        Ok(Self {
            name: name.to_string(),
            source_text: text,
            spec,
            compiled,
            exclude_files,
            exclude_protocols,
        })
    }

    fn rule_matches(
        &self,
        rule: &Rule,
        compiled: &CompiledRule,
        seqinfo: &SeqInfo,
    ) -> Option<BTreeMap<String, String>> {
        let mut bindings = rule.set.clone();
        if let Some(regex) = &compiled.protocol {
            let caps = regex.captures(&seqinfo.protocol_name)?;
            for name in regex.capture_names().flatten() {
                if let Some(value) = caps.name(name) {
                    bindings.insert(name.to_string(), value.as_str().to_string());
                }
            }
        }
        if let Some(regex) = &compiled.series_description {
            regex.captures(&seqinfo.series_description)?;
        }
        if let Some(value) = &rule.matches.image_type {
            if !seqinfo.image_type.iter().any(|t| t == value) {
                return None;
            }
        }
        let m = &rule.matches;
        let dim_ok = m.min_dim3.map_or(true, |v| seqinfo.dim3 >= v)
            && m.max_dim3.map_or(true, |v| seqinfo.dim3 <= v)
            && m.min_dim4.map_or(true, |v| seqinfo.dim4 >= v)
            && m.max_dim4.map_or(true, |v| seqinfo.dim4 <= v);
        if !dim_ok {
            return None;
        }
        if m.is_derived.map_or(false, |v| seqinfo.is_derived != v) {
            return None;
        }
        if m.is_motion_corrected
            .map_or(false, |v| seqinfo.is_motion_corrected != v)
        {
            return None;
        }
        Some(bindings)
    }

    fn derive_id(&self, source: &IdSource, seqinfos: &[SeqInfo]) -> Option<String> {
        let raw = match source {
            IdSource::Fixed { fixed } => fixed.clone(),
            IdSource::From { from } => {
                let first = seqinfos.first()?;
                match from.as_str() {
                    "patient_id" => first.patient_id.clone(),
                    "accession_number" => first.accession_number.clone(),
                    "study_description" => first.study_description.clone(),
                    _ => return None,
                }
            }
        };
        if raw.is_empty() {
            return None;
        }
        sanitize_label(&raw).ok()
    }
}

impl Heuristic for RuleHeuristic {
    fn name(&self) -> &str {
        &self.name
    }

    fn frozen_form(&self) -> String {
        self.source_text.clone()
    }

    fn infotodict(&self, seqinfos: &[SeqInfo]) -> Result<Vec<TargetDecision>, ConvertError> {
        let mut decisions: Vec<TargetDecision> = Vec::new();
        let mut slots: Vec<Option<usize>> = vec![None; self.spec.rules.len()];
        for seqinfo in seqinfos {
            for (idx, rule) in self.spec.rules.iter().enumerate() {
                let Some(bindings) = self.rule_matches(rule, &self.compiled[idx], seqinfo) else {
                    continue;
                };
                let at = match slots[idx] {
                    Some(at) => at,
                    None => {
                        let target =
                            ConversionTarget::new(&rule.template, &rule.outtypes, rule.annotation.clone())?;
                        decisions.push(TargetDecision {
                            target,
                            series: Vec::new(),
                        });
                        slots[idx] = Some(decisions.len() - 1);
                        decisions.len() - 1
                    }
                };
                decisions[at].series.push(SeriesBinding {
                    series_id: seqinfo.series_id.clone(),
                    bindings,
                });
            }
        }
        Ok(decisions)
    }

    fn infotoids(&self, seqinfos: &[SeqInfo], _outdir: &Utf8Path) -> Option<StudyIds> {
        if self.spec.subject.is_none() && self.spec.session.is_none() && self.spec.locator.is_none()
        {
            return None;
        }
        Some(StudyIds {
            locator: self.spec.locator.clone(),
            session: self
                .spec
                .session
                .as_ref()
                .and_then(|source| self.derive_id(source, seqinfos)),
            subject: self
                .spec
                .subject
                .as_ref()
                .and_then(|source| self.derive_id(source, seqinfos)),
        })
    }

    fn filter_file(&self, path: &Utf8Path) -> bool {
        self.exclude_files
            .iter()
            .any(|regex| regex.is_match(path.as_str()))
    }

    fn filter_dicom(&self, header: &DicomHeader) -> bool {
        self.exclude_protocols
            .iter()
            .any(|regex| regex.is_match(&header.protocol_name))
    }

    fn grouping_attribute(&self) -> Option<String> {
        self.spec.grouping.clone()
    }

    fn split_echo_series(&self) -> bool {
        self.spec.split_echo_series
    }

    fn intended_for(&self) -> Option<IntendedForOpts> {
        self.spec.populate_intended_for.clone()
    }

    fn default_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        self.spec.default_fields.clone()
    }
}

const CONVERTALL: &str = r#"{
  "description": "Convert every series, named run{item:03d} under the subject directory",
  "subject": {"from": "patient_id"},
  "rules": [
    {"template": "run{item:03d}", "outtypes": ["nii.gz"]}
  ]
}
"#;

const BIDS_MINIMAL: &str = r#"{
  "description": "Reference BIDS heuristic covering anat, dwi, fieldmaps and resting-state BOLD",
  "subject": {"from": "patient_id"},
  "rules": [
    {
      "template": "{bids_subject_session_dir}/anat/{bids_subject_session_prefix}_T1w",
      "outtypes": ["nii.gz"],
      "match": {"protocol": "(?i)mprage|t1w?", "is_derived": false}
    },
    {
      "template": "{bids_subject_session_dir}/dwi/{bids_subject_session_prefix}_dir-{dir}_dwi",
      "outtypes": ["nii.gz"],
      "match": {"protocol": "(?i)(?:dti|dwi).*_(?P<dir>AP|PA|LR|RL)", "is_derived": false}
    },
    {
      "template": "{bids_subject_session_dir}/fmap/{bids_subject_session_prefix}_dir-{dir}_epi",
      "outtypes": ["nii.gz"],
      "match": {"protocol": "(?i)verify.*_(?P<dir>AP|PA|LR|RL)"}
    },
    {
      "template": "{bids_subject_session_dir}/fmap/{bids_subject_session_prefix}_magnitude",
      "outtypes": ["nii.gz"],
      "match": {"protocol": "(?i)field_?map", "image_type": "M"}
    },
    {
      "template": "{bids_subject_session_dir}/fmap/{bids_subject_session_prefix}_phasediff",
      "outtypes": ["nii.gz"],
      "match": {"protocol": "(?i)field_?map", "image_type": "P"}
    },
    {
      "template": "{bids_subject_session_dir}/func/{bids_subject_session_prefix}_task-rest_run-{item:02d}_bold",
      "outtypes": ["nii.gz"],
      "match": {"protocol": "(?i)rest", "is_motion_corrected": false}
    }
  ]
}
"#;

const BUNDLED: [(&str, &str); 2] = [("convertall", CONVERTALL), ("bids-minimal", BIDS_MINIMAL)];

/// Resolve a heuristic by filesystem path first, then by bundled name.
pub fn load_heuristic(spec: &str) -> Result<Box<dyn Heuristic>, ConvertError> {
    let path = Utf8Path::new(spec);
    if spec.contains('/') || path.as_std_path().exists() {
        let text = fs::read_to_string(path.as_std_path())
            .map_err(|err| ConvertError::Filesystem(format!("read heuristic {spec}: {err}")))?;
        let name = path.file_stem().unwrap_or("heuristic").to_string();
        return Ok(Box::new(RuleHeuristic::parse(&name, spec, text)?));
    }
    for (name, text) in BUNDLED {
        if name == spec {
            return Ok(Box::new(RuleHeuristic::parse(
                name,
                name,
                text.to_string(),
            )?));
        }
    }
    Err(ConvertError::HeuristicNotFound(format!(
        "{spec} (known: {})",
        BUNDLED
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

pub fn known_heuristics() -> Vec<(String, String)> {
    BUNDLED
        .iter()
        .map(|(name, text)| {
            let description = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|value| {
                    value
                        .get("description")
                        .and_then(|d| d.as_str())
                        .map(|d| d.to_string())
                })
                .unwrap_or_default();
            (name.to_string(), description)
        })
        .collect()
}
