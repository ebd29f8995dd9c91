use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde_json::Value;

use crate::bids::{load_json, parse_bids_datetime, update_json, BidsFile};
use crate::error::ConvertError;
use crate::heuristic::{Criterion, IntendedForOpts, MatchingParameter};

/// Sidecar geometry fields compared under `ImagingVolume` matching.
const VOLUME_KEYS: [&str; 2] = ["ImageOrientationPatientDICOM", "SliceThickness"];

#[derive(Debug, Clone, PartialEq)]
enum KeyInfo {
    Json(Value),
    Strings(Vec<String>),
    Numeric(Vec<Vec<f64>>),
    Missing,
}

/// Group the fieldmap sidecars as they live together: a phasediff with its
/// magnitudes, a phase pair with its magnitudes, or a pepolar set sharing
/// everything but `dir-`.
pub fn find_fmap_groups(fmap_dir: &Utf8Path) -> Result<BTreeMap<String, Vec<Utf8PathBuf>>, ConvertError> {
    let strip = Regex::new(
        "(_dir-[0-9a-zA-Z]+)|(_phase[12])|(_phasediff)|(_magnitude[12])|(_fieldmap)",
    )
    .expect("fmap pattern is valid");

    let mut jsons: Vec<Utf8PathBuf> = fs::read_dir(fmap_dir.as_std_path())
        .map_err(|err| ConvertError::Filesystem(format!("read dir {fmap_dir}: {err}")))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .filter(|path| path.extension() == Some("json"))
        .collect();
    jsons.sort();

    let mut groups: BTreeMap<String, Vec<Utf8PathBuf>> = BTreeMap::new();
    for json in jsons {
        let name = json.file_name().unwrap_or_default();
        let stem = name.strip_suffix(".json").unwrap_or(name);
        let prefix = strip.replace_all(stem, "").to_string();
        groups.entry(prefix).or_default().push(json);
    }
    Ok(groups)
}

fn modality_of(json_file: &Utf8Path) -> String {
    json_file
        .parent()
        .and_then(|dir| dir.file_name())
        .unwrap_or_default()
        .to_string()
}

fn key_info(json_file: &Utf8Path, param: MatchingParameter) -> Result<KeyInfo, ConvertError> {
    Ok(match param {
        MatchingParameter::Shims => match load_json(json_file)?.get("ShimSetting") {
            Some(shims) => KeyInfo::Json(shims.clone()),
            None => {
                tracing::error!(
                    "file {} does not have ShimSetting; use a different matching_parameter",
                    json_file
                );
                KeyInfo::Missing
            }
        },
        MatchingParameter::ImagingVolume => {
            let sidecar = load_json(json_file)?;
            let mut arrays = Vec::new();
            for key in VOLUME_KEYS {
                match sidecar.get(key) {
                    Some(Value::Array(items)) => {
                        arrays.push(items.iter().filter_map(|v| v.as_f64()).collect())
                    }
                    Some(Value::Number(n)) => arrays.push(vec![n.as_f64().unwrap_or(f64::NAN)]),
                    _ => return Ok(KeyInfo::Missing),
                }
            }
            KeyInfo::Numeric(arrays)
        }
        MatchingParameter::ModalityAcquisitionLabel => {
            let modality = modality_of(json_file);
            if modality == "fmap" {
                let name = json_file.file_name().unwrap_or_default();
                let acq = BidsFile::parse(name)
                    .get("acq")
                    .map(|value| value.to_lowercase());
                match acq {
                    Some(acq) if ["fmri", "bold", "func"].iter().any(|s| acq.contains(s)) => {
                        KeyInfo::Strings(vec!["func".to_string()])
                    }
                    Some(acq) if ["diff", "dwi"].iter().any(|s| acq.contains(s)) => {
                        KeyInfo::Strings(vec!["dwi".to_string()])
                    }
                    Some(acq) if ["anat", "struct"].iter().any(|s| acq.contains(s)) => {
                        KeyInfo::Strings(vec!["anat".to_string()])
                    }
                    _ => KeyInfo::Missing,
                }
            } else {
                KeyInfo::Strings(vec![modality])
            }
        }
        MatchingParameter::CustomAcquisitionLabel => {
            let name = json_file.file_name().unwrap_or_default();
            let bids = BidsFile::parse(name);
            let label = if modality_of(json_file) == "func" {
                bids.get("task")
            } else {
                bids.get("acq")
            };
            match label {
                Some(label) => KeyInfo::Strings(vec![label.to_string()]),
                None => KeyInfo::Missing,
            }
        }
        MatchingParameter::Force => KeyInfo::Strings(vec!["Forced".to_string()]),
    })
}

fn info_matches(a: &KeyInfo, b: &KeyInfo) -> bool {
    match (a, b) {
        (KeyInfo::Missing, _) | (_, KeyInfo::Missing) => false,
        (KeyInfo::Numeric(a), KeyInfo::Numeric(b)) => {
            a.len() == b.len()
                && a.iter().zip(b).all(|(x, y)| {
                    x.len() == y.len()
                        && x.iter().zip(y).all(|(p, q)| (p - q).abs() <= 1e-6)
                })
        }
        (a, b) => a == b,
    }
}

/// The fmap groups compatible with one non-fmap run, per the configured
/// matching parameters.
fn compatible_groups(
    json_file: &Utf8Path,
    fmap_groups: &BTreeMap<String, Vec<Utf8PathBuf>>,
    matching: &[MatchingParameter],
) -> Result<Vec<String>, ConvertError> {
    tracing::debug!("looking for fmaps for {}", json_file);
    let mut own: Vec<KeyInfo> = Vec::new();
    for &param in matching {
        own.push(key_info(json_file, param)?);
    }

    let mut compatible = Vec::new();
    for (key, group) in fmap_groups {
        let representative = &group[0];
        let mut all_match = true;
        for (idx, &param) in matching.iter().enumerate() {
            let fm_info = key_info(representative, param)?;
            if !info_matches(&own[idx], &fm_info) {
                all_match = false;
                break;
            }
        }
        if all_match {
            compatible.push(key.clone());
        }
    }
    Ok(compatible)
}

fn scans_acq_times(session_path: &Utf8Path) -> Result<BTreeMap<String, String>, ConvertError> {
    let mut scans_tsv = None;
    for entry in fs::read_dir(session_path.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?
        .flatten()
    {
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|path| ConvertError::Filesystem(format!("non-utf8 path {path:?}")))?;
        if path
            .file_name()
            .map(|name| name.ends_with("_scans.tsv"))
            .unwrap_or(false)
        {
            scans_tsv = Some(path);
            break;
        }
    }
    let scans_tsv = scans_tsv.ok_or_else(|| {
        ConvertError::Filesystem(format!("no *_scans.tsv file found for {session_path}"))
    })?;

    let content = fs::read_to_string(scans_tsv.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    let mut lines = content.lines();
    let header: Vec<&str> = lines.next().unwrap_or_default().split('\t').collect();
    let fname_idx = header.iter().position(|c| *c == "filename").unwrap_or(0);
    let time_idx = header.iter().position(|c| *c == "acq_time").unwrap_or(1);

    let mut times = BTreeMap::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if let (Some(name), Some(time)) = (fields.get(fname_idx), fields.get(time_idx)) {
            times.insert(name.to_string(), time.to_string());
        }
    }
    Ok(times)
}

fn image_relpath(json_file: &Utf8Path, base: &Utf8Path) -> String {
    let relative = json_file.strip_prefix(base).unwrap_or(json_file);
    let as_str = relative.as_str();
    format!("{}.nii.gz", as_str.strip_suffix(".json").unwrap_or(as_str))
}

fn group_series_number(group: &[Utf8PathBuf]) -> i64 {
    group
        .first()
        .and_then(|json| load_json(json).ok())
        .and_then(|sidecar| sidecar.get("SeriesNumber").and_then(|v| v.as_i64()))
        .unwrap_or(i64::MAX)
}

/// Pick one fmap group for a run. `First` prefers the lowest series number;
/// `Closest` the smallest acquisition-time distance, ties resolved by lower
/// series number and then by group key.
fn select_group(
    json_file: &Utf8Path,
    compatible: &[String],
    fmap_groups: &BTreeMap<String, Vec<Utf8PathBuf>>,
    session_path: &Utf8Path,
    criterion: Criterion,
) -> Result<Option<String>, ConvertError> {
    match compatible.len() {
        0 => return Ok(None),
        1 => return Ok(Some(compatible[0].clone())),
        _ => {}
    }

    // `First` needs only series numbers; acquisition times come into play
    // under `Closest`
    let acq_times = match criterion {
        Criterion::Closest => Some(scans_acq_times(session_path)?),
        Criterion::First => None,
    };
    let time_of = |json: &Utf8Path| -> Option<chrono::NaiveDateTime> {
        acq_times
            .as_ref()?
            .get(&image_relpath(json, session_path))
            .and_then(|value| parse_bids_datetime(value))
    };

    let mut ranked: Vec<(i64, i64, String)> = Vec::new();
    for key in compatible {
        let group = &fmap_groups[key];
        let series_number = group_series_number(group);
        let distance = match criterion {
            Criterion::First => 0,
            Criterion::Closest => {
                let own = time_of(json_file);
                let fmap = group.first().and_then(|json| time_of(json));
                match (own, fmap) {
                    (Some(own), Some(fmap)) => (own - fmap).num_milliseconds().abs(),
                    _ => i64::MAX,
                }
            }
        };
        ranked.push((distance, series_number, key.clone()));
    }
    ranked.sort();
    Ok(ranked.into_iter().next().map(|(_, _, key)| key))
}

/// Write `IntendedFor` into every fieldmap sidecar of a session, listing the
/// non-fmap images each group should correct, relative to the subject root.
pub fn populate_intended_for(
    session_path: &Utf8Path,
    opts: &IntendedForOpts,
) -> Result<(), ConvertError> {
    if opts.matching.is_empty() {
        return Err(ConvertError::Usage(
            "populate_intended_for requires at least one matching parameter".to_string(),
        ));
    }
    tracing::info!("adding IntendedFor to the fieldmaps in {}", session_path);

    let fmap_dir = session_path.join("fmap");
    if !fmap_dir.as_std_path().exists() {
        tracing::warn!("cannot add IntendedFor: no fmap/ in {}", session_path);
        return Ok(());
    }
    let subject_root = if session_path
        .file_name()
        .map(|name| name.starts_with("ses-"))
        .unwrap_or(false)
    {
        session_path
            .parent()
            .map(|dir| dir.to_path_buf())
            .unwrap_or_else(|| session_path.to_path_buf())
    } else {
        session_path.to_path_buf()
    };

    let fmap_groups = find_fmap_groups(&fmap_dir)?;

    // all non-fmap, non-sbref sidecars in the session
    let mut run_jsons: Vec<Utf8PathBuf> = Vec::new();
    for entry in fs::read_dir(session_path.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?
        .flatten()
    {
        let dir = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|path| ConvertError::Filesystem(format!("non-utf8 path {path:?}")))?;
        if !dir.is_dir() || dir.file_name() == Some("fmap") {
            continue;
        }
        for file in fs::read_dir(dir.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?
            .flatten()
        {
            let path = Utf8PathBuf::from_path_buf(file.path())
                .map_err(|path| ConvertError::Filesystem(format!("non-utf8 path {path:?}")))?;
            let name = path.file_name().unwrap_or_default();
            if name.ends_with(".json") && !name.ends_with("_sbref.json") {
                run_jsons.push(path);
            }
        }
    }
    run_jsons.sort();

    let mut selected: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for json_file in &run_jsons {
        let compatible = compatible_groups(json_file, &fmap_groups, &opts.matching)?;
        if let Some(key) = select_group(
            json_file,
            &compatible,
            &fmap_groups,
            session_path,
            opts.criterion,
        )? {
            selected
                .entry(key)
                .or_default()
                .push(image_relpath(json_file, &subject_root));
        }
    }

    for (key, mut intended) in selected {
        intended.sort();
        let fields: serde_json::Map<String, Value> = [(
            "IntendedFor".to_string(),
            Value::Array(intended.into_iter().map(Value::String).collect()),
        )]
        .into_iter()
        .collect();
        for fmap_json in &fmap_groups[&key] {
            update_json(fmap_json, &fields, true)?;
        }
    }
    Ok(())
}
