use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::bids::write_text_atomic;
use crate::domain::{ConversionTarget, SeqInfo, SEQINFO_COLUMNS};
use crate::error::ConvertError;

/// Subject-scoped provenance under `<outdir>/.heudiconv/`: the effective
/// heuristic, the seqinfo table, file groups, and per-rerun records that
/// make reruns idempotent.
#[derive(Debug, Clone)]
pub struct ProvenanceStore {
    info_dir: Utf8PathBuf,
}

/// One target-to-series assignment as persisted in `auto/` and `edit/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingEntry {
    pub target: ConversionTarget,
    pub series: Vec<String>,
}

impl ProvenanceStore {
    pub fn new(outdir: &Utf8Path, subject: &str, session: Option<&str>) -> Self {
        let mut dir = outdir.join(".heudiconv").join(subject);
        if let Some(session) = session {
            dir = dir.join(format!("ses-{session}"));
        }
        Self {
            info_dir: dir.join("info"),
        }
    }

    pub fn info_dir(&self) -> &Utf8Path {
        &self.info_dir
    }

    pub fn heuristic_path(&self) -> Utf8PathBuf {
        self.info_dir.join("heuristic.py")
    }

    pub fn dicominfo_path(&self) -> Utf8PathBuf {
        self.info_dir.join("dicominfo.tsv")
    }

    pub fn filegroup_path(&self) -> Utf8PathBuf {
        self.info_dir.join("filegroup.json")
    }

    pub fn auto_mapping_path(&self) -> Utf8PathBuf {
        self.info_dir.join("auto").join("mapping.json")
    }

    pub fn edit_mapping_path(&self) -> Utf8PathBuf {
        self.info_dir.join("edit").join("mapping.json")
    }

    pub fn log_path(&self) -> Utf8PathBuf {
        self.info_dir.join("run.log")
    }

    pub fn ensure(&self) -> Result<(), ConvertError> {
        fs::create_dir_all(self.info_dir.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))
    }

    /// True when a heuristic was frozen on a previous run and its form
    /// differs from the current one; `None` on the first run.
    pub fn heuristic_differs(&self, current: &str) -> Result<Option<bool>, ConvertError> {
        let path = self.heuristic_path();
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let stored = fs::read_to_string(path.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        Ok(Some(stored != current))
    }

    /// Store the effective heuristic verbatim. A differing previous copy is
    /// kept as a timestamped snapshot, together with its seqinfo table, so
    /// drift stays reconstructible.
    pub fn freeze_heuristic(&self, current: &str) -> Result<(), ConvertError> {
        self.ensure()?;
        let path = self.heuristic_path();
        if let Some(true) = self.heuristic_differs(current)? {
            let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
            let snapshot = self.info_dir.join(format!("heuristic.{stamp}.py"));
            fs::rename(path.as_std_path(), snapshot.as_std_path())
                .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
            let dicominfo = self.dicominfo_path();
            if dicominfo.as_std_path().exists() {
                let snapshot = self.info_dir.join(format!("dicominfo.{stamp}.tsv"));
                fs::copy(dicominfo.as_std_path(), snapshot.as_std_path())
                    .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
            }
        }
        write_text_atomic(&path, current)
    }

    pub fn write_dicominfo(&self, seqinfos: &[SeqInfo]) -> Result<(), ConvertError> {
        self.ensure()?;
        let mut out = SEQINFO_COLUMNS.join("\t");
        out.push('\n');
        for seqinfo in seqinfos {
            out.push_str(&seqinfo_to_row(seqinfo).join("\t"));
            out.push('\n');
        }
        write_text_atomic(&self.dicominfo_path(), &out)
    }

    pub fn read_dicominfo(&self) -> Result<Vec<SeqInfo>, ConvertError> {
        let content = fs::read_to_string(self.dicominfo_path().as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        let mut out = Vec::new();
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split('\t').collect();
            out.push(seqinfo_from_row(&fields)?);
        }
        Ok(out)
    }

    pub fn write_filegroup(
        &self,
        groups: &BTreeMap<String, Vec<Utf8PathBuf>>,
    ) -> Result<(), ConvertError> {
        self.ensure()?;
        let value = serde_json::to_value(groups)
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        crate::bids::save_json(&self.filegroup_path(), &value, false)
    }

    pub fn write_auto_mapping(&self, entries: &[MappingEntry]) -> Result<(), ConvertError> {
        self.ensure()?;
        let value = serde_json::to_value(entries)
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        crate::bids::save_json(&self.auto_mapping_path(), &value, false)
    }

    /// Operator-provided override for the next rerun, if any.
    pub fn read_edit_mapping(&self) -> Result<Option<Vec<MappingEntry>>, ConvertError> {
        let path = self.edit_mapping_path();
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        let entries: Vec<MappingEntry> =
            serde_json::from_str(&content).map_err(|err| ConvertError::Filesystem(format!(
                "invalid edit mapping {path}: {err}"
            )))?;
        Ok(Some(entries))
    }

    /// Append-only run log with one timestamped line per event.
    pub fn append_log(&self, message: &str) -> Result<(), ConvertError> {
        self.ensure()?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path().as_std_path())
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        writeln!(
            file,
            "{}\t{}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f"),
            message
        )
        .map_err(|err| ConvertError::Filesystem(err.to_string()))
    }
}

/// Writes a partial-run marker unless the run was marked complete.
pub struct RunLogGuard<'a> {
    store: &'a ProvenanceStore,
    completed: bool,
}

impl<'a> RunLogGuard<'a> {
    pub fn start(store: &'a ProvenanceStore) -> Result<Self, ConvertError> {
        store.append_log("run started")?;
        Ok(Self {
            store,
            completed: false,
        })
    }

    pub fn complete(mut self) {
        self.completed = true;
        let _ = self.store.append_log("run completed");
    }
}

impl Drop for RunLogGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.store.append_log("partial run");
        }
    }
}

pub fn seqinfo_to_row(s: &SeqInfo) -> Vec<String> {
    vec![
        s.total_files_till_now.to_string(),
        s.example_dcm_file.clone(),
        s.series_id.clone(),
        s.dcm_dir_name.clone(),
        s.unspecified2.clone(),
        s.unspecified3.clone(),
        s.dim1.to_string(),
        s.dim2.to_string(),
        s.dim3.to_string(),
        s.dim4.to_string(),
        s.tr.to_string(),
        s.te.to_string(),
        s.protocol_name.clone(),
        s.is_motion_corrected.to_string(),
        s.is_derived.to_string(),
        s.patient_id.clone(),
        s.study_description.clone(),
        s.referring_physician_name.clone(),
        s.series_description.clone(),
        s.image_type.join("\\"),
        s.accession_number.clone(),
        s.patient_age.clone(),
        s.patient_sex.clone(),
        s.date.clone(),
        s.series_uid.clone(),
        s.time.clone(),
    ]
}

pub fn seqinfo_from_row(fields: &[&str]) -> Result<SeqInfo, ConvertError> {
    if fields.len() != SEQINFO_COLUMNS.len() {
        return Err(ConvertError::Filesystem(format!(
            "dicominfo row has {} columns, expected {}",
            fields.len(),
            SEQINFO_COLUMNS.len()
        )));
    }
    let parse_int = |idx: usize| -> Result<u32, ConvertError> {
        fields[idx].parse().map_err(|_| {
            ConvertError::Filesystem(format!(
                "bad {} value {:?} in dicominfo row",
                SEQINFO_COLUMNS[idx], fields[idx]
            ))
        })
    };
    let parse_float = |idx: usize| -> Result<f64, ConvertError> {
        fields[idx].parse().map_err(|_| {
            ConvertError::Filesystem(format!(
                "bad {} value {:?} in dicominfo row",
                SEQINFO_COLUMNS[idx], fields[idx]
            ))
        })
    };
    Ok(SeqInfo {
        total_files_till_now: parse_int(0)? as usize,
        example_dcm_file: fields[1].to_string(),
        series_id: fields[2].to_string(),
        dcm_dir_name: fields[3].to_string(),
        unspecified2: fields[4].to_string(),
        unspecified3: fields[5].to_string(),
        dim1: parse_int(6)?,
        dim2: parse_int(7)?,
        dim3: parse_int(8)?,
        dim4: parse_int(9)?,
        tr: parse_float(10)?,
        te: parse_float(11)?,
        protocol_name: fields[12].to_string(),
        is_motion_corrected: fields[13] == "true",
        is_derived: fields[14] == "true",
        patient_id: fields[15].to_string(),
        study_description: fields[16].to_string(),
        referring_physician_name: fields[17].to_string(),
        series_description: fields[18].to_string(),
        image_type: if fields[19].is_empty() {
            Vec::new()
        } else {
            fields[19].split('\\').map(|s| s.to_string()).collect()
        },
        accession_number: fields[20].to_string(),
        patient_age: fields[21].to_string(),
        patient_sex: fields[22].to_string(),
        date: fields[23].to_string(),
        series_uid: fields[24].to_string(),
        time: fields[25].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = ProvenanceStore::new(Utf8Path::new("/data/bids"), "219", Some("itbs"));
        assert_eq!(
            store.heuristic_path().as_str(),
            "/data/bids/.heudiconv/219/ses-itbs/info/heuristic.py"
        );
        assert!(store.dicominfo_path().ends_with("info/dicominfo.tsv"));

        let no_ses = ProvenanceStore::new(Utf8Path::new("/data/bids"), "219", None);
        assert_eq!(
            no_ses.filegroup_path().as_str(),
            "/data/bids/.heudiconv/219/info/filegroup.json"
        );
    }
}
