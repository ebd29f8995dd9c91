use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde_json::Value;

use crate::dicom::DicomHeader;
use crate::error::ConvertError;

pub const BIDS_VERSION: &str = "1.8.0";
pub const HEUDICONV_VERSION_JSON_KEY: &str = "HeudiconvVersion";

/// Canonical BIDS entity order; filename components are always emitted in
/// this sequence regardless of the heuristic's intra-template order.
pub const KNOWN_ENTITIES: [&str; 15] = [
    "sub", "ses", "task", "acq", "ce", "rec", "dir", "run", "mod", "echo", "flip", "inv", "mt",
    "part", "recording",
];

pub const SCANS_FILE_COLUMNS: [&str; 4] = ["filename", "acq_time", "operator", "randstr"];

/// Sidecar keys retained under `minmeta`.
pub const BIDS_SIDECAR_FIELDS: [&str; 70] = [
    "AcquisitionMatrixPE",
    "AcquisitionNumber",
    "B0FieldIdentifier",
    "B0FieldSource",
    "BandwidthPerPixelPhaseEncode",
    "BaseResolution",
    "BodyPartExamined",
    "CogAtlasID",
    "CoilString",
    "ConversionSoftware",
    "ConversionSoftwareVersion",
    "DelayTime",
    "DerivedVendorReportedEchoSpacing",
    "DeviceSerialNumber",
    "DwellTime",
    "EchoNumber",
    "EchoTime",
    "EchoTime1",
    "EchoTime2",
    "EffectiveEchoSpacing",
    "FlipAngle",
    "HeudiconvVersion",
    "ImageOrientationPatientDICOM",
    "ImageType",
    "ImagingFrequency",
    "InPlanePhaseEncodingDirectionDICOM",
    "InstitutionAddress",
    "InstitutionName",
    "InstitutionalDepartmentName",
    "Instructions",
    "IntendedFor",
    "InversionTime",
    "MRAcquisitionType",
    "MagneticFieldStrength",
    "Manufacturer",
    "ManufacturersModelName",
    "Modality",
    "MultibandAccelerationFactor",
    "ParallelReductionFactorInPlane",
    "PartialFourier",
    "PatientPosition",
    "PercentPhaseFOV",
    "PercentSampling",
    "PhaseEncodingDirection",
    "PhaseEncodingSteps",
    "PhaseResolution",
    "PixelBandwidth",
    "ProcedureStepDescription",
    "ProtocolName",
    "PulseSequenceDetails",
    "ReceiveCoilActiveElements",
    "ReceiveCoilName",
    "ReconMatrixPE",
    "RepetitionTime",
    "SAR",
    "ScanOptions",
    "ScanningSequence",
    "SequenceName",
    "SequenceVariant",
    "SeriesDescription",
    "SeriesNumber",
    "ShimSetting",
    "SliceThickness",
    "SliceTiming",
    "SoftwareVersions",
    "SpacingBetweenSlices",
    "StationName",
    "TaskName",
    "TotalReadoutTime",
    "TxRefAmp",
];

/// A BIDS filename decomposed into entities, loose trailing segments, an
/// optional `__dup-NN` marker, suffix and extension.
#[derive(Debug, Clone, PartialEq)]
pub struct BidsFile {
    entities: BTreeMap<String, String>,
    trailing: Vec<String>,
    dup: Option<String>,
    suffix: String,
    extension: Option<String>,
}

impl BidsFile {
    pub fn parse(filename: &str) -> Self {
        let (stem, extension) = match filename.find('.') {
            Some(idx) => (&filename[..idx], Some(filename[idx + 1..].to_string())),
            None => (filename, None),
        };

        let dup_regex = Regex::new(r"__dup-\d+").expect("dup pattern is valid");
        let mut dup = None;
        let stem = match dup_regex.find(stem) {
            Some(found) => {
                dup = Some(found.as_str().to_string());
                format!("{}{}", &stem[..found.start()], &stem[found.end()..])
            }
            None => stem.to_string(),
        };

        let mut entities = BTreeMap::new();
        let mut trailing = Vec::new();
        let mut suffix = String::new();
        let segments: Vec<&str> = stem.split('_').filter(|s| !s.is_empty()).collect();
        let last = segments.len().saturating_sub(1);
        for (idx, segment) in segments.iter().enumerate() {
            match segment.split_once('-') {
                Some((key, value))
                    if KNOWN_ENTITIES.contains(&key) && !value.is_empty() =>
                {
                    entities.entry(key.to_string()).or_insert(value.to_string());
                }
                _ if idx == last => suffix = segment.to_string(),
                _ => trailing.push(segment.to_string()),
            }
        }

        Self {
            entities,
            trailing,
            dup,
            suffix,
            extension,
        }
    }

    pub fn get(&self, entity: &str) -> Option<&str> {
        self.entities.get(entity).map(|value| value.as_str())
    }

    pub fn set(&mut self, entity: &str, value: &str) {
        self.entities.insert(entity.to_string(), value.to_string());
    }

    pub fn remove(&mut self, entity: &str) -> Option<String> {
        self.entities.remove(entity)
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn set_suffix(&mut self, suffix: &str) {
        self.suffix = suffix.to_string();
    }

    pub fn set_dup(&mut self, index: u32) {
        self.dup = Some(format!("__dup-{index:02}"));
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }
}

impl std::fmt::Display for BidsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = KNOWN_ENTITIES
            .iter()
            .filter_map(|key| {
                self.entities
                    .get(*key)
                    .map(|value| format!("{key}-{value}"))
            })
            .collect();
        parts.extend(self.trailing.iter().cloned());
        let mut out = parts.join("_");
        if let Some(dup) = &self.dup {
            out.push_str(dup);
        }
        if !self.suffix.is_empty() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push_str(&self.suffix);
        }
        if let Some(ext) = &self.extension {
            out.push('.');
            out.push_str(ext);
        }
        write!(f, "{out}")
    }
}

/// Reorder the filename component of a resolved target into canonical
/// entity order, applying the modality default suffix when absent.
pub fn normalize_prefix(prefix: &Utf8Path) -> Utf8PathBuf {
    let Some(name) = prefix.file_name() else {
        return prefix.to_path_buf();
    };
    let mut bids = BidsFile::parse(name);
    if bids.get("sub").is_none() {
        // not a BIDS-shaped name; leave it as the heuristic wrote it
        return prefix.to_path_buf();
    }
    if bids.suffix().is_empty() {
        let modality = prefix
            .parent()
            .and_then(|dir| dir.file_name())
            .unwrap_or_default();
        let default = match modality {
            "anat" => Some("T1w"),
            "fmap" => Some("epi"),
            "func" => Some("bold"),
            _ => None,
        };
        if let Some(suffix) = default {
            bids.set_suffix(suffix);
        }
    }
    rewrite_legacy_rec(&mut bids);
    match prefix.parent() {
        Some(dir) => dir.join(bids.to_string()),
        None => Utf8PathBuf::from(bids.to_string()),
    }
}

/// `rec-magnitude|rec-phase` is a legacy shape for complex reconstructions.
pub fn rewrite_legacy_rec(bids: &mut BidsFile) {
    match bids.get("rec") {
        Some("magnitude") => {
            bids.remove("rec");
            bids.set("part", "mag");
        }
        Some("phase") => {
            bids.remove("rec");
            bids.set("part", "phase");
        }
        _ => {}
    }
}

/// Disambiguate a colliding final prefix; the marker lands right before the
/// suffix so multi-file series stay associated.
pub fn insert_dup(prefix: &Utf8Path, index: u32) -> Utf8PathBuf {
    let Some(name) = prefix.file_name() else {
        return Utf8PathBuf::from(format!("{prefix}__dup-{index:02}"));
    };
    let mut bids = BidsFile::parse(name);
    if bids.get("sub").is_none() {
        return Utf8PathBuf::from(format!("{prefix}__dup-{index:02}"));
    }
    bids.set_dup(index);
    match prefix.parent() {
        Some(dir) => dir.join(bids.to_string()),
        None => Utf8PathBuf::from(bids.to_string()),
    }
}

/// Sidecar facts about one produced image, used to pick its final name.
#[derive(Debug, Clone)]
pub struct ProducedImage {
    pub stem: String,
    pub echo_number: Option<i64>,
    pub echo_time: Option<f64>,
    pub is_phase: bool,
}

/// Map each produced stem to its final prefix under `final_prefix`.
///
/// Multi-file magnitude outputs become `magnitude1`/`magnitude2` in sorted
/// order; multi-echo sets get `echo-N` (from `EchoNumbers` when present,
/// otherwise by ascending echo time); phase reconstructions get
/// `part-mag`/`part-phase`.
pub fn assign_final_prefixes(
    final_prefix: &Utf8Path,
    produced: &[ProducedImage],
) -> Result<BTreeMap<String, Utf8PathBuf>, ConvertError> {
    let mut out = BTreeMap::new();
    if produced.len() <= 1 {
        if let Some(image) = produced.first() {
            out.insert(image.stem.clone(), final_prefix.to_path_buf());
        }
        return Ok(out);
    }

    let name = final_prefix.file_name().unwrap_or_default().to_string();
    let parent = final_prefix
        .parent()
        .map(|dir| dir.to_path_buf())
        .unwrap_or_default();
    let bids = BidsFile::parse(&name);

    if bids.suffix() == "magnitude" {
        let mut stems: Vec<&str> = produced.iter().map(|image| image.stem.as_str()).collect();
        stems.sort_unstable();
        for (idx, stem) in stems.iter().enumerate() {
            let mut named = bids.clone();
            named.set_suffix(&format!("magnitude{}", idx + 1));
            out.insert(stem.to_string(), parent.join(named.to_string()));
        }
        return Ok(out);
    }

    let echo_indices = echo_index_by_image(produced);
    let has_mag = produced.iter().any(|image| !image.is_phase);
    let has_phase = produced.iter().any(|image| image.is_phase);
    let split_parts = has_mag && has_phase;

    let mut seen: BTreeMap<String, u32> = BTreeMap::new();
    for (idx, image) in produced.iter().enumerate() {
        let mut named = bids.clone();
        if let Some(echo) = echo_indices[idx] {
            named.set("echo", &echo.to_string());
        }
        if split_parts {
            named.set("part", if image.is_phase { "phase" } else { "mag" });
        }
        let mut full = named.to_string();
        let repeat = seen.entry(full.clone()).or_insert(0);
        if *repeat > 0 {
            named.set_dup(*repeat);
            full = named.to_string();
        }
        *repeat += 1;
        out.insert(image.stem.clone(), parent.join(full));
    }
    Ok(out)
}

/// 1-based echo labels: `EchoNumbers` when any file carries it, otherwise
/// ranks of ascending `EchoTimes` (echo 1 = shortest TE). `None` when the
/// set is not multi-echo.
fn echo_index_by_image(produced: &[ProducedImage]) -> Vec<Option<i64>> {
    let numbers: Vec<Option<i64>> = produced.iter().map(|image| image.echo_number).collect();
    let distinct: std::collections::BTreeSet<i64> = numbers.iter().flatten().copied().collect();
    if distinct.len() > 1 {
        return numbers;
    }

    let mut times: Vec<f64> = produced
        .iter()
        .filter_map(|image| image.echo_time)
        .collect();
    times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    times.dedup();
    if times.len() < 2 {
        return vec![None; produced.len()];
    }
    produced
        .iter()
        .map(|image| {
            image.echo_time.map(|te| {
                times
                    .iter()
                    .position(|&t| (t - te).abs() < f64::EPSILON)
                    .map(|rank| rank as i64 + 1)
                    .unwrap_or(1)
            })
        })
        .collect()
}

pub fn maybe_na(value: Option<&str>) -> String {
    match value {
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() || trimmed == "N/A" || trimmed == "NA" {
                "n/a".to_string()
            } else {
                trimmed.to_string()
            }
        }
        None => "n/a".to_string(),
    }
}

/// DICOM ages may carry `Y`/`M` suffixes; months become fractional years
/// with two decimals.
pub fn treat_age(age: &str) -> Option<String> {
    let age = age.trim();
    if age.is_empty() {
        return None;
    }
    if let Some(months) = age.strip_suffix('M') {
        let months: f64 = months.trim().parse().ok()?;
        let years = months / 12.0;
        return Some(if years == years.trunc() {
            format!("{}", years as i64)
        } else {
            format!("{years:.2}")
        });
    }
    let years = age.strip_suffix('Y').unwrap_or(age).trim();
    if years.is_empty() {
        return None;
    }
    let stripped = years.trim_start_matches('0');
    let mut out = if stripped.is_empty() {
        "0".to_string()
    } else {
        stripped.to_string()
    };
    if out.starts_with('.') {
        out.insert(0, '0');
    }
    Some(out)
}

/// Combine DICOM date and time into an ISO timestamp, preserving whatever
/// sub-second precision the time value carried.
pub fn get_datetime(date: &str, time: &str) -> Option<String> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y%m%d").ok()?;
    let time = time.trim();
    let (main, frac) = match time.split_once('.') {
        Some((main, frac)) => (main, Some(frac)),
        None => (time, None),
    };
    let parsed = NaiveTime::parse_from_str(main, "%H%M%S").ok()?;
    let mut out = format!(
        "{}T{}",
        date.format("%Y-%m-%d"),
        parsed.format("%H:%M:%S")
    );
    if let Some(frac) = frac {
        if !frac.is_empty() {
            out.push('.');
            out.push_str(frac);
        }
    }
    Some(out)
}

pub fn parse_bids_datetime(value: &str) -> Option<NaiveDateTime> {
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(parsed);
        }
    }
    None
}

pub fn load_json(path: &Utf8Path) -> Result<Value, ConvertError> {
    let content = fs::read_to_string(path.as_std_path()).map_err(|err| ConvertError::Sidecar {
        path: path.to_string(),
        message: err.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|err| ConvertError::Sidecar {
        path: path.to_string(),
        message: err.to_string(),
    })
}

/// Write a JSON document with two-space indentation, atomically.
pub fn save_json(path: &Utf8Path, value: &Value, pretty: bool) -> Result<(), ConvertError> {
    let mut text = if pretty {
        json_dumps_pretty(value).unwrap_or_else(|| {
            tracing::warn!(
                "prettyfication failed for {}; keeping plain formatting",
                path
            );
            json_dumps(value)
        })
    } else {
        json_dumps(value)
    };
    text.push('\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    }
    if path.as_std_path().exists() {
        set_readonly(path, false)?;
        fs::remove_file(path.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    }
    let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));
    fs::write(tmp_path.as_std_path(), text.as_bytes())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn json_dumps(value: &Value) -> String {
    let mut out = String::new();
    write_json(value, 0, false, &mut out);
    out
}

/// Pretty form collapsing all-numeric arrays onto one line. Returns `None`
/// when the result fails to parse back to the same document.
pub fn json_dumps_pretty(value: &Value) -> Option<String> {
    let mut out = String::new();
    write_json(value, 0, true, &mut out);
    match serde_json::from_str::<Value>(&out) {
        Ok(reparsed) if &reparsed == value => Some(out),
        _ => None,
    }
}

fn write_json(value: &Value, indent: usize, collapse_numeric: bool, out: &mut String) {
    match value {
        Value::Array(items) if items.is_empty() => out.push_str("[]"),
        Value::Array(items) => {
            if collapse_numeric && items.iter().all(|item| item.is_number()) {
                out.push('[');
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&item.to_string());
                }
                out.push(']');
                return;
            }
            out.push_str("[\n");
            for (idx, item) in items.iter().enumerate() {
                out.push_str(&"  ".repeat(indent + 1));
                write_json(item, indent + 1, collapse_numeric, out);
                if idx + 1 < items.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&"  ".repeat(indent));
            out.push(']');
        }
        Value::Object(map) if map.is_empty() => out.push_str("{}"),
        Value::Object(map) => {
            out.push_str("{\n");
            for (idx, (key, item)) in map.iter().enumerate() {
                out.push_str(&"  ".repeat(indent + 1));
                out.push_str(&Value::String(key.clone()).to_string());
                out.push_str(": ");
                write_json(item, indent + 1, collapse_numeric, out);
                if idx + 1 < map.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&"  ".repeat(indent));
            out.push('}');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Merge the given fields into an existing JSON file.
pub fn update_json(
    path: &Utf8Path,
    new_data: &serde_json::Map<String, Value>,
    pretty: bool,
) -> Result<(), ConvertError> {
    let mut value = load_json(path)?;
    let Some(object) = value.as_object_mut() else {
        return Err(ConvertError::Sidecar {
            path: path.to_string(),
            message: "sidecar root is not an object".to_string(),
        });
    };
    for (key, item) in new_data {
        object.insert(key.clone(), item.clone());
    }
    save_json(path, &value, pretty)
}

pub fn set_readonly(path: &Utf8Path, read_only: bool) -> Result<(), ConvertError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    let mut perms = metadata.permissions();
    let mode = perms.mode();
    let new_mode = if read_only {
        mode & !0o222
    } else {
        // grant write only at levels that can already read
        mode | ((mode & 0o444) >> 1)
    };
    perms.set_mode(new_mode);
    fs::set_permissions(path.as_std_path(), perms)
        .map_err(|err| ConvertError::Filesystem(err.to_string()))
}

/// Post-transcoder sidecar tune-up: drop absolute dates, restrict keys under
/// `minmeta`, and stamp the converter version. Failures keep the original
/// transcoder sidecar and are logged at the offending location.
pub fn tuneup_sidecar(path: &Utf8Path, minmeta: bool, version: &str) -> Result<(), ConvertError> {
    let mut value = load_json(path)?;
    let Some(object) = value.as_object_mut() else {
        return Err(ConvertError::Sidecar {
            path: path.to_string(),
            message: "sidecar root is not an object".to_string(),
        });
    };
    for prefix in ["Acquisition", "Study", "Series", "Content"] {
        for field in ["DateTime", "Date"] {
            object.remove(&format!("{prefix}{field}"));
        }
    }
    if object.keys().any(|key| key.contains("Date")) {
        return Err(ConvertError::Sidecar {
            path: path.to_string(),
            message: "there must be no dates in .json sidecar".to_string(),
        });
    }
    if minmeta {
        object.retain(|key, _| BIDS_SIDECAR_FIELDS.contains(&key.as_str()));
    }
    object.insert(
        HEUDICONV_VERSION_JSON_KEY.to_string(),
        Value::String(version.to_string()),
    );
    save_json(path, &value, true)
}

/// For any `func/*_task-X_*_bold` sidecar, make sure `TaskName` matches the
/// filename's task entity.
pub fn ensure_task_name(json_path: &Utf8Path) -> Result<(), ConvertError> {
    let Some(name) = json_path.file_name() else {
        return Ok(());
    };
    let bids = BidsFile::parse(name);
    let (Some(task), "bold") = (bids.get("task"), bids.suffix()) else {
        return Ok(());
    };
    let mut value = load_json(json_path)?;
    let Some(object) = value.as_object_mut() else {
        return Ok(());
    };
    if object.get("TaskName").and_then(|v| v.as_str()) == Some(task) {
        return Ok(());
    }
    object.insert("TaskName".to_string(), Value::String(task.to_string()));
    save_json(json_path, &value, true)
}

/// Copy `EchoTime` out of the magnitude sidecars into the phasediff one.
pub fn enrich_phasediff_sidecar(fmap_dir: &Utf8Path, basename: &str) -> Result<(), ConvertError> {
    let phasediff = fmap_dir.join(format!("{basename}_phasediff.json"));
    if !phasediff.as_std_path().exists() {
        return Ok(());
    }
    let mut fields = serde_json::Map::new();
    for idx in 1..=2 {
        let magnitude = fmap_dir.join(format!("{basename}_magnitude{idx}.json"));
        if !magnitude.as_std_path().exists() {
            continue;
        }
        if let Some(te) = load_json(&magnitude)?.get("EchoTime").cloned() {
            fields.insert(format!("EchoTime{idx}"), te);
        }
    }
    if fields.is_empty() {
        return Ok(());
    }
    let was_readonly = is_readonly(&phasediff);
    if was_readonly {
        set_readonly(&phasediff, false)?;
    }
    update_json(&phasediff, &fields, true)?;
    if was_readonly {
        set_readonly(&phasediff, true)?;
    }
    Ok(())
}

pub fn is_readonly(path: &Utf8Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path.as_std_path())
        .map(|metadata| metadata.permissions().mode() & 0o222 == 0)
        .unwrap_or(false)
}

/// One row for the scans table: acquisition time (with fallback to content
/// date/time), operator, and a digest-derived random string.
pub fn scans_key_row(header: &DicomHeader) -> Vec<String> {
    let acq_time = get_datetime(&header.acquisition_date, &header.acquisition_time)
        .or_else(|| get_datetime(&header.content_date, &header.content_time));
    vec![
        maybe_na(acq_time.as_deref()),
        maybe_na(Some(header.performing_physician.as_str())),
        header.uid_digest(),
    ]
}

/// Derive subject/session from converted filenames and append their rows to
/// the right `_scans.tsv`.
pub fn save_scans_key(
    converted: &[Utf8PathBuf],
    header: &DicomHeader,
) -> Result<(), ConvertError> {
    let mut rows: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut subject: Option<String> = None;
    let mut session: Option<Option<String>> = None;
    let mut output_dir: Option<Utf8PathBuf> = None;
    for path in converted {
        let Some(name) = path.file_name() else {
            continue;
        };
        let bids = BidsFile::parse(name);
        let Some(subj) = bids.get("sub") else {
            tracing::warn!(
                "no BIDS layout detected, not producing scans.tsv rows for {}",
                path
            );
            return Ok(());
        };
        if let Some(previous) = &subject {
            if previous != subj {
                return Err(ConvertError::StudyConsistency(format!(
                    "deduced subject {subj} conflicts with {previous} in {path}"
                )));
            }
        }
        subject = Some(subj.to_string());
        let ses = bids.get("ses").map(|value| value.to_string());
        if let Some(previous) = &session {
            if previous != &ses {
                return Err(ConvertError::StudyConsistency(format!(
                    "deduced session conflicts for {path}"
                )));
            }
        }
        session = Some(ses);

        let modality_dir = path.parent();
        let relative = match modality_dir.and_then(|dir| dir.file_name()) {
            Some(modality) => format!("{modality}/{name}"),
            None => name.to_string(),
        };
        rows.insert(relative, scans_key_row(header));
        output_dir = modality_dir.and_then(|dir| dir.parent().map(|d| d.to_path_buf()));
    }
    let (Some(subject), Some(output_dir)) = (subject, output_dir) else {
        return Ok(());
    };
    let ses_part = session
        .flatten()
        .map(|ses| format!("_ses-{ses}"))
        .unwrap_or_default();
    let scans_file = output_dir.join(format!("sub-{subject}{ses_part}_scans.tsv"));
    add_rows_to_scans_file(&scans_file, rows)
}

/// Merge rows into a `_scans.tsv`, keeping it sorted by acquisition time
/// ascending with missing times last, then by filename.
pub fn add_rows_to_scans_file(
    path: &Utf8Path,
    newrows: BTreeMap<String, Vec<String>>,
) -> Result<(), ConvertError> {
    let mut rows: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if path.as_std_path().exists() {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        for line in content.lines().skip(1) {
            let mut fields = line.split('\t').map(|f| f.to_string());
            if let Some(filename) = fields.next() {
                rows.insert(filename, fields.collect());
            }
        }
    }
    for (filename, row) in newrows {
        rows.entry(filename).or_insert(row);
    }

    let mut sorted: Vec<(String, Vec<String>)> = rows.into_iter().collect();
    sorted.sort_by(|a, b| {
        let a_na = a.1.first().map(|t| t == "n/a").unwrap_or(true);
        let b_na = b.1.first().map(|t| t == "n/a").unwrap_or(true);
        (a_na, a.1.first(), &a.0).cmp(&(b_na, b.1.first(), &b.0))
    });

    let mut out = SCANS_FILE_COLUMNS.join("\t");
    out.push('\n');
    for (filename, row) in sorted {
        out.push_str(&filename);
        for field in row {
            out.push('\t');
            out.push_str(&field);
        }
        out.push('\n');
    }
    write_text_atomic(path, &out)
}

/// Append one row per subject to `participants.tsv`, creating it (and its
/// column descriptions) on first use. Existing rows are never rewritten.
pub fn add_participant_record(
    studydir: &Utf8Path,
    subject: &str,
    age: &str,
    sex: &str,
) -> Result<(), ConvertError> {
    let participants_tsv = studydir.join("participants.tsv");
    let participant_id = format!("sub-{subject}");

    if participants_tsv.as_std_path().exists() {
        let content = fs::read_to_string(participants_tsv.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        let known = content
            .lines()
            .skip(1)
            .filter_map(|line| line.split('\t').next())
            .any(|id| id == participant_id);
        if known {
            return Ok(());
        }
    } else {
        write_text_atomic(
            &participants_tsv,
            "participant_id\tage\tsex\tgroup\n",
        )?;
        let participants_json = studydir.join("participants.json");
        if !participants_json.as_std_path().exists() {
            let description: Value = serde_json::json!({
                "participant_id": {"Description": "Participant identifier"},
                "age": {"Description":
                    "Age in years (TODO - verify) as in the initial session, might not be correct for other sessions"},
                "sex": {"Description":
                    "self-rated by participant, M for male/F for female (TODO: verify)"},
                "group": {"Description":
                    "(TODO: adjust - by default everyone is in control group)"},
            });
            save_json(&participants_json, &description, false)?;
        }
    }

    let age = treat_age(age);
    let row = format!(
        "{participant_id}\t{}\t{}\tcontrol\n",
        maybe_na(age.as_deref()),
        maybe_na(Some(sex)),
    );
    let mut content = fs::read_to_string(participants_tsv.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    content.push_str(&row);
    write_text_atomic(&participants_tsv, &content)
}

pub fn write_text_atomic(path: &Utf8Path, content: &str) -> Result<(), ConvertError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    }
    let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));
    fs::write(tmp_path.as_std_path(), content.as_bytes())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))
}
