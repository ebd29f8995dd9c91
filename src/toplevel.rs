use std::fs;
use std::io::Write;
use std::thread::sleep;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde_json::{Map, Value};

use crate::bids::{load_json, save_json, BIDS_VERSION};
use crate::config::{filelock_timeout, TOPLEVEL_WRITE_ATTEMPTS};
use crate::discover::find_files;
use crate::error::ConvertError;

const LOCK_FILE: &str = ".heudiconv.lock";

/// Fields never hoisted out of per-run sidecars by the aggregation pass.
const AGGREGATION_KEEP: [&str; 2] = ["TaskName", "HeudiconvVersion"];

/// Advisory lock guarding read-modify-write of the dataset's top-level
/// files. Multiple engine processes converting different subjects contend
/// on this.
pub struct DatasetLock {
    path: Utf8PathBuf,
}

impl DatasetLock {
    pub fn acquire(root: &Utf8Path, timeout: Duration) -> Result<Self, ConvertError> {
        fs::create_dir_all(root.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        let path = root.join(LOCK_FILE);
        let started = Instant::now();
        let mut delay = Duration::from_millis(100);
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path.as_std_path())
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= timeout {
                        return Err(ConvertError::LockTimeout(path.to_string()));
                    }
                    sleep(delay);
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
                Err(err) => {
                    return Err(ConvertError::Filesystem(format!(
                        "cannot create lock {path}: {err}"
                    )));
                }
            }
        }
    }
}

impl Drop for DatasetLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.as_std_path());
    }
}

/// Run a top-level read-modify-write under the dataset lock, retrying
/// transient filesystem failures with exponential backoff.
pub fn with_toplevel_lock<T>(
    root: &Utf8Path,
    mut operation: impl FnMut() -> Result<T, ConvertError>,
) -> Result<T, ConvertError> {
    let _lock = DatasetLock::acquire(root, filelock_timeout())?;
    let mut delay = Duration::from_millis(100);
    let mut attempt = 1;
    loop {
        match operation() {
            Err(ConvertError::Filesystem(message)) if attempt < TOPLEVEL_WRITE_ATTEMPTS => {
                tracing::warn!(
                    "top-level write failed ({message}), retry {attempt}/{TOPLEVEL_WRITE_ATTEMPTS}"
                );
                attempt += 1;
                sleep(delay);
                delay *= 2;
            }
            other => return other,
        }
    }
}

/// Create a file only when absent, so user edits are never clobbered.
pub fn create_file_if_missing(path: &Utf8Path, content: &str) -> Result<bool, ConvertError> {
    if path.as_std_path().exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    }
    fs::write(path.as_std_path(), content.as_bytes())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    Ok(true)
}

fn scans_file_fields() -> Value {
    serde_json::json!({
        "filename": {"Description": "Name of the nifti file"},
        "acq_time": {
            "LongName": "Acquisition time",
            "Description": "Acquisition time of the particular scan"
        },
        "operator": {"Description": "Name of the operator"},
        "randstr": {"LongName": "Random string", "Description": "hash of UIDs"},
    })
}

/// Premake the dataset-level text files and refresh the aggregated task
/// sidecars. `defaults` (typically the heuristic's `DEFAULT_FIELDS`)
/// overrides the placeholder values of `dataset_description.json`.
pub fn populate_bids_templates(
    path: &Utf8Path,
    defaults: &Map<String, Value>,
) -> Result<(), ConvertError> {
    tracing::info!("populating template files under {}", path);

    let descriptor = path.join("dataset_description.json");
    if !descriptor.as_std_path().exists() {
        let mut description = Map::new();
        description.insert(
            "Name".to_string(),
            Value::String("TODO: name of the dataset".to_string()),
        );
        description.insert(
            "BIDSVersion".to_string(),
            Value::String(BIDS_VERSION.to_string()),
        );
        description.insert(
            "License".to_string(),
            Value::String(
                "TODO: choose a license, e.g. PDDL (http://opendatacommons.org/licenses/pddl/)"
                    .to_string(),
            ),
        );
        description.insert(
            "Authors".to_string(),
            serde_json::json!(["TODO:", "First1 Last1", "First2 Last2", "..."]),
        );
        description.insert(
            "Acknowledgements".to_string(),
            Value::String("TODO: whom you want to acknowledge".to_string()),
        );
        description.insert(
            "HowToAcknowledge".to_string(),
            Value::String(
                "TODO: describe how to acknowledge -- either cite a corresponding paper, or \
                 just in acknowledgement section"
                    .to_string(),
            ),
        );
        description.insert(
            "Funding".to_string(),
            serde_json::json!(["TODO", "GRANT #1", "GRANT #2"]),
        );
        description.insert(
            "ReferencesAndLinks".to_string(),
            serde_json::json!(["TODO", "List of papers or websites"]),
        );
        description.insert(
            "DatasetDOI".to_string(),
            Value::String("TODO: eventually a DOI for the dataset".to_string()),
        );
        for (key, value) in defaults {
            description.insert(key.clone(), value.clone());
        }
        save_json(&descriptor, &Value::Object(description), false)?;
    }

    let sourcedata_readme = path.join("sourcedata").join("README");
    if sourcedata_readme
        .parent()
        .map(|dir| dir.as_std_path().exists())
        .unwrap_or(false)
    {
        create_file_if_missing(
            &sourcedata_readme,
            "TODO: Provide description about source data, e.g. \n\
             Directory below contains DICOMS compressed into tarballs per each sequence, \
             replicating directory hierarchy of the BIDS dataset itself.",
        )?;
    }
    create_file_if_missing(
        &path.join("CHANGES"),
        "0.0.1  Initial data acquired\n\
         TODOs:\n\t- verify and possibly extend information in participants.tsv\n\
         \t- fill out dataset_description.json, README, sourcedata/README (if present)\n\
         \t- provide _events.tsv file for each _bold.nii.gz with onsets of events\n",
    )?;
    create_file_if_missing(
        &path.join("README"),
        "TODO: Provide description for the dataset -- basic details about the study, \
         possibly pointing to pre-registration (if public or embargoed)",
    )?;
    create_file_if_missing(
        &path.join("scans.json"),
        &(crate::bids::json_dumps(&scans_file_fields()) + "\n"),
    )?;
    create_file_if_missing(&path.join(".bidsignore"), ".duecredit.p")?;

    populate_aggregated_jsons(path)
}

/// Hoist the sidecar fields shared by every run of a task into the
/// top-level `task-<X>_bold.json`, drop them from the per-run sidecars, and
/// stub out `_events.tsv` files. Recomputed on every run.
pub fn populate_aggregated_jsons(path: &Utf8Path) -> Result<(), ConvertError> {
    let task_regex =
        Regex::new(r".*_(task-[^_/.]+(?:_acq-[^_/.]+)?)_.*").expect("task pattern is valid");
    let bold_regex = Regex::new(r".*_task-.*_bold\.json$").expect("bold pattern is valid");

    let mut bold_jsons: Vec<Utf8PathBuf> = Vec::new();
    for entry in fs::read_dir(path.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?
        .flatten()
    {
        let subdir = match Utf8PathBuf::from_path_buf(entry.path()) {
            Ok(subdir) => subdir,
            Err(_) => continue,
        };
        let name = subdir.file_name().unwrap_or_default();
        if !subdir.is_dir() || !name.starts_with("sub-") {
            continue;
        }
        for file in find_files(&subdir)? {
            if bold_regex.is_match(file.as_str()) && !file.as_str().contains("/.heudiconv/") {
                bold_jsons.push(file);
            }
        }
    }
    bold_jsons.sort();

    let mut tasks: std::collections::BTreeMap<String, Map<String, Value>> = Default::default();
    let mut members: std::collections::BTreeMap<String, Vec<Utf8PathBuf>> = Default::default();
    for fpath in &bold_jsons {
        let Some(caps) = task_regex.captures(fpath.as_str()) else {
            continue;
        };
        let task = caps[1].to_string();
        let sidecar = load_json(fpath)?;
        let Some(sidecar) = sidecar.as_object() else {
            continue;
        };
        members.entry(task.clone()).or_default().push(fpath.clone());
        match tasks.get_mut(&task) {
            None => {
                // seed with the existing aggregate so fields hoisted by an
                // earlier run survive recomputation
                let task_file = path.join(format!("{task}_bold.json"));
                let mut seed = if task_file.as_std_path().exists() {
                    load_json(&task_file)?
                        .as_object()
                        .cloned()
                        .unwrap_or_default()
                } else {
                    Map::new()
                };
                for (key, value) in sidecar {
                    seed.insert(key.clone(), value.clone());
                }
                seed.retain(|key, _| !AGGREGATION_KEEP.contains(&key.as_str()));
                tasks.insert(task, seed);
            }
            Some(record) => {
                // keep only fields with an identical value everywhere
                record.retain(|key, value| match sidecar.get(key) {
                    Some(other) => other == &*value,
                    None => true,
                });
            }
        }

        // one events stub per multi-echo set, named without the echo entity
        let mut events_base = fpath.as_str().to_string();
        if let Some(echo_at) = events_base.find("_echo-") {
            let echo_end = events_base[echo_at + 6..]
                .find('_')
                .map(|idx| echo_at + 6 + idx);
            let Some(echo_end) = echo_end else {
                continue;
            };
            let echo_no = &events_base[echo_at + 6..echo_end];
            if echo_no != "1" {
                continue;
            }
            events_base = format!("{}{}", &events_base[..echo_at], &events_base[echo_end..]);
        }
        let events_file = Utf8PathBuf::from(
            events_base
                .strip_suffix("_bold.json")
                .map(|base| format!("{base}_events.tsv"))
                .unwrap_or(events_base),
        );
        create_file_if_missing(
            &events_file,
            "onset\tduration\ttrial_type\tresponse_time\tstim_file\
             \tTODO -- fill in rows and add more tab-separated columns if desired",
        )?;
    }

    for (task, mut fields) in tasks {
        let task_file = path.join(format!("{task}_bold.json"));
        let task_label = task
            .split('_')
            .next()
            .and_then(|part| part.strip_prefix("task-"))
            .unwrap_or(&task);
        let mut placeholders = Map::new();
        placeholders.insert(
            "TaskName".to_string(),
            Value::String(format!("TODO: full task name for {task_label}")),
        );
        placeholders.insert(
            "CogAtlasID".to_string(),
            Value::String("http://www.cognitiveatlas.org/task/id/TODO".to_string()),
        );
        if task_file.as_std_path().exists() {
            let existing = load_json(&task_file)?;
            for key in ["TaskName", "CogAtlasID"] {
                if let Some(value) = existing.get(key) {
                    placeholders.insert(key.to_string(), value.clone());
                }
            }
            tracing::debug!("regenerating {}", task_file);
        } else {
            tracing::debug!("generating {}", task_file);
        }
        for (key, value) in placeholders {
            fields.insert(key, value);
        }
        save_json(&task_file, &Value::Object(fields.clone()), true)?;

        // drop the hoisted fields from the per-run sidecars
        fields.retain(|key, _| !AGGREGATION_KEEP.contains(&key.as_str()));
        fields.remove("CogAtlasID");
        if fields.is_empty() {
            continue;
        }
        for fpath in members.get(&task).into_iter().flatten() {
            let mut sidecar = load_json(fpath)?;
            let Some(object) = sidecar.as_object_mut() else {
                continue;
            };
            let before = object.len();
            object.retain(|key, value| match fields.get(key) {
                Some(hoisted) => hoisted != &*value,
                None => true,
            });
            if object.len() != before {
                save_json(fpath, &sidecar, true)?;
            }
        }
    }
    Ok(())
}

/// Write `participants.tsv` and friends under the dataset lock; used by the
/// conversion path so concurrent per-subject runs do not lose rows.
pub fn write_participant_record(
    root: &Utf8Path,
    subject: &str,
    age: &str,
    sex: &str,
) -> Result<(), ConvertError> {
    with_toplevel_lock(root, || {
        crate::bids::add_participant_record(root, subject, age, sex)
    })
}
