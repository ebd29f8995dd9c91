use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::rngs::StdRng;
use rand::Rng;

use crate::bids::{
    assign_final_prefixes, ensure_task_name, load_json, normalize_prefix, save_scans_key,
    set_readonly, tuneup_sidecar, BidsFile, ProducedImage,
};
use crate::config::EngineConfig;
use crate::dicom::{DicomHeader, StudyGroup};
use crate::domain::{fill_template, OutputKind, SeqInfo, StudySession, TargetDecision};
use crate::error::ConvertError;
use crate::store::ProvenanceStore;
use crate::transcoder::Transcoder;

const WORKING_MARKER: &str = "_heudiconv";

/// One resolved (target prefix, series) pair awaiting transcoding.
#[derive(Debug, Clone)]
pub struct ConversionItem {
    pub prefix: Utf8PathBuf,
    pub outtypes: Vec<OutputKind>,
    pub series_id: String,
    pub files: Vec<Utf8PathBuf>,
    pub seqinfo: SeqInfo,
    pub example: DicomHeader,
}

#[derive(Debug, Default)]
pub struct ConversionOutcome {
    pub converted: Vec<Utf8PathBuf>,
    pub failed: Vec<(String, ConvertError)>,
    pub skipped: usize,
}

/// Expand heuristic decisions into concrete conversion items: substitute
/// template slots, normalize BIDS names, and disambiguate colliding final
/// prefixes with a per-sequence `__dup-NN`.
pub fn plan_conversion(
    decisions: &[TargetDecision],
    study: &StudyGroup,
    ids: &StudySession,
    study_outdir: &Utf8Path,
    bids: bool,
) -> Result<Vec<ConversionItem>, ConvertError> {
    let subject = ids
        .subject
        .as_deref()
        .ok_or_else(|| ConvertError::Usage("cannot convert without a subject id".to_string()))?;

    let mut base: BTreeMap<String, String> = BTreeMap::new();
    base.insert("subject".to_string(), subject.to_string());
    let (prefix, dir) = match ids.session.as_deref() {
        Some(session) => {
            base.insert("session".to_string(), session.to_string());
            (
                format!("sub-{subject}_ses-{session}"),
                format!("sub-{subject}/ses-{session}"),
            )
        }
        None => (format!("sub-{subject}"), format!("sub-{subject}")),
    };
    base.insert("bids_subject_session_prefix".to_string(), prefix);
    base.insert("bids_subject_session_dir".to_string(), dir);

    let series_index: BTreeMap<&str, usize> = study
        .series
        .iter()
        .enumerate()
        .map(|(idx, series)| (series.seqinfo.series_id.as_str(), idx))
        .collect();

    let mut items = Vec::new();
    for decision in decisions {
        for (item_idx, series_binding) in decision.series.iter().enumerate() {
            let series = study
                .series
                .iter()
                .find(|s| s.seqinfo.series_id == series_binding.series_id)
                .ok_or_else(|| {
                    ConvertError::Heuristic(format!(
                        "heuristic references unknown series_id {:?}",
                        series_binding.series_id
                    ))
                })?;

            let mut bindings = base.clone();
            bindings.insert("item".to_string(), (item_idx + 1).to_string());
            bindings.insert(
                "seqitem".to_string(),
                (series_index[series.seqinfo.series_id.as_str()] + 1).to_string(),
            );
            bindings.insert("subindex".to_string(), (item_idx + 1).to_string());
            for (key, value) in &series_binding.bindings {
                bindings.insert(key.clone(), value.clone());
            }

            let expanded = fill_template(&decision.target.template, &bindings)?;
            let mut prefix = study_outdir.join(expanded);
            if bids {
                prefix = normalize_prefix(&prefix);
            }
            items.push(ConversionItem {
                prefix,
                outtypes: decision.target.outtypes.clone(),
                series_id: series.seqinfo.series_id.clone(),
                files: series.files.clone(),
                seqinfo: series.seqinfo.clone(),
                example: series.example.clone(),
            });
        }
    }

    // later collisions get __dup-NN, keeping each series' files together
    let mut seen: BTreeMap<Utf8PathBuf, u32> = BTreeMap::new();
    for item in &mut items {
        let count = seen.entry(item.prefix.clone()).or_insert(0);
        if *count > 0 {
            item.prefix = crate::bids::insert_dup(&item.prefix, *count);
        }
        *count += 1;
    }

    items.sort_by_key(|item| (item.seqinfo.series_number(), item.prefix.clone()));
    Ok(items)
}

/// True for preparatory acquisitions whose NIfTI output is suppressed while
/// the DICOMs are kept.
pub fn is_scout(seqinfo: &SeqInfo) -> bool {
    let looks_like_scout = |text: &str| {
        let lower = text.to_lowercase();
        lower.contains("scout") || lower.contains("localizer")
    };
    (seqinfo.is_motion_corrected || seqinfo.is_derived)
        && (looks_like_scout(&seqinfo.protocol_name)
            || looks_like_scout(&seqinfo.series_description)
            || seqinfo.image_type.iter().any(|t| t == "LOCALIZER"))
}

/// Drive the transcoder over planned items, in ascending series order.
/// Per-series failures are isolated: the working files are removed, the
/// failure is logged to the provenance store, and the run continues.
#[allow(clippy::too_many_arguments)]
pub fn convert_items(
    items: &[ConversionItem],
    transcoder: Option<&dyn Transcoder>,
    config: &EngineConfig,
    store: &ProvenanceStore,
    dataset_root: &Utf8Path,
    force: bool,
    rng: &mut StdRng,
) -> ConversionOutcome {
    let mut outcome = ConversionOutcome::default();
    for item in items {
        match convert_one(item, transcoder, config, dataset_root, force, rng) {
            Ok(Some(converted)) => outcome.converted.extend(converted),
            Ok(None) => outcome.skipped += 1,
            Err(err) => {
                tracing::error!("series {} failed: {}", item.series_id, err);
                let _ = store.append_log(&format!("series {} failed: {}", item.series_id, err));
                cleanup_working_files(&item.prefix);
                outcome.failed.push((item.series_id.clone(), err));
            }
        }
    }
    outcome
}

fn convert_one(
    item: &ConversionItem,
    transcoder: Option<&dyn Transcoder>,
    config: &EngineConfig,
    dataset_root: &Utf8Path,
    force: bool,
    rng: &mut StdRng,
) -> Result<Option<Vec<Utf8PathBuf>>, ConvertError> {
    // leftovers of an interrupted run must not survive into this one
    cleanup_working_files(&item.prefix);

    let existing = existing_outputs(&item.prefix);
    if !existing.is_empty() && !config.overwrite && !force {
        tracing::info!("{} already exists, skipping", item.prefix);
        return Ok(None);
    }

    let mut converted = Vec::new();
    for outtype in &item.outtypes {
        match outtype {
            OutputKind::Dicom => archive_dicoms(item, dataset_root)?,
            OutputKind::Nii | OutputKind::NiiGz => {
                if is_scout(&item.seqinfo) {
                    tracing::info!(
                        "suppressing NIfTI for scout series {}; DICOMs are kept",
                        item.series_id
                    );
                    continue;
                }
                let Some(transcoder) = transcoder else {
                    continue;
                };
                converted.extend(transcode_item(
                    item,
                    transcoder,
                    *outtype == OutputKind::NiiGz,
                    config,
                    rng,
                )?);
            }
        }
    }
    Ok(Some(converted))
}

fn transcode_item(
    item: &ConversionItem,
    transcoder: &dyn Transcoder,
    compress: bool,
    config: &EngineConfig,
    rng: &mut StdRng,
) -> Result<Vec<Utf8PathBuf>, ConvertError> {
    let out_dir = item
        .prefix
        .parent()
        .ok_or_else(|| ConvertError::Filesystem(format!("no parent for {}", item.prefix)))?;
    fs::create_dir_all(out_dir.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    let basename = item
        .prefix
        .file_name()
        .ok_or_else(|| ConvertError::Filesystem(format!("no basename for {}", item.prefix)))?;

    let staged = stage_dicoms(&item.files)?;
    let staged_dir = Utf8PathBuf::from_path_buf(staged.path().to_path_buf())
        .map_err(|_| ConvertError::Filesystem("invalid staging dir".to_string()))?;

    // working names land directly under the final directory; renaming on
    // success is atomic and failures clean up by prefix
    let token: u32 = rng.gen_range(0..0xff_ffff);
    let working = format!("{basename}{WORKING_MARKER}{token:06x}");
    let produced = transcoder.convert(&staged_dir, out_dir, &working, compress)?;

    let mut images: Vec<ProducedImage> = Vec::new();
    let mut by_stem: BTreeMap<String, Vec<Utf8PathBuf>> = BTreeMap::new();
    for path in &produced {
        let stem = output_stem(path);
        by_stem.entry(stem).or_default().push(path.clone());
    }
    for (stem, paths) in &by_stem {
        let sidecar = paths
            .iter()
            .find(|path| path.extension() == Some("json"))
            .map(|path| load_json(path))
            .transpose()?;
        let (echo_number, echo_time, is_phase) = match &sidecar {
            Some(sidecar) => (
                sidecar.get("EchoNumber").and_then(|v| v.as_i64()),
                sidecar.get("EchoTime").and_then(|v| v.as_f64()),
                sidecar
                    .get("ImageType")
                    .and_then(|v| v.as_array())
                    .map(|types| {
                        types
                            .iter()
                            .filter_map(|t| t.as_str())
                            .any(|t| t == "P" || t == "PHASE")
                    })
                    .unwrap_or(false),
            ),
            None => (None, None, false),
        };
        images.push(ProducedImage {
            stem: stem.clone(),
            echo_number,
            echo_time,
            is_phase,
        });
    }

    let final_prefixes = assign_final_prefixes(&item.prefix, &images)?;
    let final_suffix = item
        .prefix
        .file_name()
        .map(|name| BidsFile::parse(name).suffix().to_string())
        .unwrap_or_default();

    let mut converted = Vec::new();
    let mut sidecars = Vec::new();
    for (stem, paths) in by_stem {
        let final_prefix = final_prefixes
            .get(&stem)
            .cloned()
            .unwrap_or_else(|| item.prefix.clone());
        for path in paths {
            let extension = output_extension(&path);
            if (extension == "bval" || extension == "bvec") && final_suffix != "dwi" {
                fs::remove_file(path.as_std_path())
                    .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
                continue;
            }
            let dest = Utf8PathBuf::from(format!("{final_prefix}.{extension}"));
            safe_move(&path, &dest, config.overwrite)?;
            match extension.as_str() {
                "json" => sidecars.push(dest),
                "bval" | "bvec" => {}
                _ => converted.push(dest),
            }
        }
    }

    for sidecar in &sidecars {
        match tuneup_sidecar(sidecar, config.minmeta, crate::VERSION) {
            Ok(()) => {}
            Err(err) => {
                // the transcoder's sidecar stays as-is
                tracing::error!("failed to tune up {sidecar}: {err}");
                continue;
            }
        }
        ensure_task_name(sidecar)?;
        set_readonly(sidecar, true)?;
    }

    if config.bids_enabled() && !converted.is_empty() {
        save_scans_key(&converted, &item.example)?;
    }
    Ok(converted)
}

/// Hardlink (or copy) one series' DICOMs into a scratch dir for the
/// transcoder, preserving file names.
fn stage_dicoms(files: &[Utf8PathBuf]) -> Result<tempfile::TempDir, ConvertError> {
    let staged = tempfile::Builder::new()
        .prefix("heudiconvDCM")
        .tempdir()
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    for file in files {
        let name = file
            .file_name()
            .ok_or_else(|| ConvertError::Filesystem(format!("no file name in {file}")))?;
        let dest = staged.path().join(name);
        if fs::hard_link(file.as_std_path(), &dest).is_err() {
            fs::copy(file.as_std_path(), &dest)
                .map_err(|err| ConvertError::Filesystem(format!("stage {file}: {err}")))?;
        }
    }
    Ok(staged)
}

/// Archive the source DICOMs under `sourcedata/`, mirroring the target's
/// place in the dataset.
fn archive_dicoms(item: &ConversionItem, dataset_root: &Utf8Path) -> Result<(), ConvertError> {
    let relative = item
        .prefix
        .strip_prefix(dataset_root)
        .unwrap_or(item.prefix.as_path());
    let archive_path = dataset_root
        .join("sourcedata")
        .join(format!("{relative}.dicom.tgz"));
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    }
    let file = fs::File::create(archive_path.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for dicom in &item.files {
        let name = dicom
            .file_name()
            .ok_or_else(|| ConvertError::Filesystem(format!("no file name in {dicom}")))?;
        builder
            .append_path_with_name(dicom.as_std_path(), name)
            .map_err(|err| ConvertError::Filesystem(format!("archive {dicom}: {err}")))?;
    }
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    Ok(())
}

fn existing_outputs(prefix: &Utf8Path) -> Vec<Utf8PathBuf> {
    ["nii.gz", "nii"]
        .iter()
        .map(|ext| Utf8PathBuf::from(format!("{prefix}.{ext}")))
        .filter(|path| path.as_std_path().exists())
        .collect()
}

fn cleanup_working_files(prefix: &Utf8Path) {
    let (Some(parent), Some(basename)) = (prefix.parent(), prefix.file_name()) else {
        return;
    };
    let marker = format!("{basename}{WORKING_MARKER}");
    let Ok(entries) = fs::read_dir(parent.as_std_path()) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(&marker) {
            let _ = fs::remove_file(entry.path());
        }
    }
}

fn safe_move(src: &Utf8Path, dest: &Utf8Path, overwrite: bool) -> Result<(), ConvertError> {
    if dest.as_std_path().exists() {
        if !overwrite {
            return Err(ConvertError::Filesystem(format!(
                "was asked to move {src} but destination already exists: {dest}"
            )));
        }
        set_readonly(dest, false)?;
        fs::remove_file(dest.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    }
    fs::rename(src.as_std_path(), dest.as_std_path())
        .map_err(|err| ConvertError::Filesystem(format!("rename {src} -> {dest}: {err}")))
}

/// Stem shared by the files of one produced image (basename without the
/// transcoder output extension).
fn output_stem(path: &Utf8Path) -> String {
    let name = path.file_name().unwrap_or_default();
    for ext in [".nii.gz", ".nii", ".json", ".bval", ".bvec"] {
        if let Some(stem) = name.strip_suffix(ext) {
            return stem.to_string();
        }
    }
    name.to_string()
}

fn output_extension(path: &Utf8Path) -> String {
    let name = path.file_name().unwrap_or_default();
    if name.ends_with(".nii.gz") {
        "nii.gz".to_string()
    } else {
        path.extension().unwrap_or_default().to_string()
    }
}
