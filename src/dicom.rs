use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use dicom::core::Tag;
use dicom::object::{FileDicomObject, InMemDicomObject, OpenFileOptions};
use dicom_dictionary_std::tags;
use sha2::{Digest, Sha256};

use crate::domain::{GroupingMode, SeqInfo};
use crate::error::ConvertError;

/// GE/Siemens private pulse-sequence name, consulted when ProtocolName is absent.
const PRIVATE_PROTOCOL_TAG: Tag = Tag(0x0019, 0x109C);

const EXCLUDED_SOP_CLASSES: [&str; 2] = [
    // Raw Data Storage
    "1.2.840.10008.5.1.4.1.1.66",
    // Grayscale Softcopy Presentation State Storage
    "1.2.840.10008.5.1.4.1.1.11.1",
];

type DicomObject = FileDicomObject<InMemDicomObject>;

/// The header subset the engine needs downstream; pixel data is never read.
#[derive(Debug, Clone, PartialEq)]
pub struct DicomHeader {
    pub path: Utf8PathBuf,
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
    pub frame_of_reference_uid: String,
    pub series_number: i64,
    pub protocol_name: String,
    pub series_description: String,
    pub study_description: String,
    pub image_type: Vec<String>,
    pub accession_number: String,
    pub patient_id: String,
    pub patient_age: String,
    pub patient_sex: String,
    pub referring_physician: String,
    pub performing_physician: String,
    pub tr_ms: f64,
    pub te_ms: f64,
    pub echo_number: Option<i64>,
    pub rows: u32,
    pub columns: u32,
    pub temporal_positions: Option<u32>,
    pub acquisition_date: String,
    pub acquisition_time: String,
    pub content_date: String,
    pub content_time: String,
    pub sop_class_uid: String,
}

impl DicomHeader {
    pub fn is_motion_corrected(&self) -> bool {
        self.series_description.contains("MoCo") || self.image_type.iter().any(|t| t == "MOCO")
    }

    pub fn is_derived(&self) -> bool {
        self.image_type
            .iter()
            .any(|t| t.eq_ignore_ascii_case("derived"))
    }

    /// Reproducible short digest over the header UIDs, used for the scans
    /// table `randstr` column.
    pub fn uid_digest(&self) -> String {
        let mut uids = [
            self.frame_of_reference_uid.as_str(),
            self.series_uid.as_str(),
            self.sop_class_uid.as_str(),
            self.sop_uid.as_str(),
            self.study_uid.as_str(),
        ];
        uids.sort_unstable();
        let mut hasher = Sha256::new();
        for uid in uids {
            hasher.update(uid.as_bytes());
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(8);
        for byte in digest.iter().take(4) {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

/// Read one DICOM header, stopping before pixel data and tolerating missing
/// optional tags.
pub fn read_header(path: &Utf8Path) -> Result<DicomHeader, ConvertError> {
    let obj = OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path.as_std_path())
        .map_err(|err| ConvertError::DicomRead {
            path: path.to_string(),
            message: err.to_string(),
        })?;

    let series_number = int_of(&obj, tags::SERIES_NUMBER).ok_or_else(|| {
        ConvertError::DicomRead {
            path: path.to_string(),
            message: "missing SeriesNumber".to_string(),
        }
    })?;
    let study_uid =
        str_of(&obj, tags::STUDY_INSTANCE_UID).ok_or_else(|| ConvertError::DicomRead {
            path: path.to_string(),
            message: "missing StudyInstanceUID".to_string(),
        })?;

    let protocol_name = str_of(&obj, tags::PROTOCOL_NAME)
        .or_else(|| str_of(&obj, PRIVATE_PROTOCOL_TAG))
        .unwrap_or_default();

    Ok(DicomHeader {
        path: path.to_path_buf(),
        study_uid,
        series_uid: str_of(&obj, tags::SERIES_INSTANCE_UID).unwrap_or_default(),
        sop_uid: str_of(&obj, tags::SOP_INSTANCE_UID).unwrap_or_default(),
        frame_of_reference_uid: str_of(&obj, tags::FRAME_OF_REFERENCE_UID).unwrap_or_default(),
        series_number,
        protocol_name,
        series_description: str_of(&obj, tags::SERIES_DESCRIPTION).unwrap_or_default(),
        study_description: str_of(&obj, tags::STUDY_DESCRIPTION).unwrap_or_default(),
        image_type: multi_str_of(&obj, tags::IMAGE_TYPE),
        accession_number: str_of(&obj, tags::ACCESSION_NUMBER).unwrap_or_default(),
        patient_id: str_of(&obj, tags::PATIENT_ID).unwrap_or_default(),
        patient_age: str_of(&obj, tags::PATIENT_AGE).unwrap_or_default(),
        patient_sex: str_of(&obj, tags::PATIENT_SEX).unwrap_or_default(),
        referring_physician: str_of(&obj, tags::REFERRING_PHYSICIAN_NAME)
            .unwrap_or_else(|| "-".to_string()),
        performing_physician: str_of(&obj, tags::PERFORMING_PHYSICIAN_NAME).unwrap_or_default(),
        tr_ms: float_of(&obj, tags::REPETITION_TIME).unwrap_or(f64::NAN),
        te_ms: float_of(&obj, tags::ECHO_TIME).unwrap_or(f64::NAN),
        echo_number: int_of(&obj, tags::ECHO_NUMBERS),
        rows: int_of(&obj, tags::ROWS).unwrap_or(0) as u32,
        columns: int_of(&obj, tags::COLUMNS).unwrap_or(0) as u32,
        temporal_positions: int_of(&obj, tags::NUMBER_OF_TEMPORAL_POSITIONS).map(|n| n as u32),
        acquisition_date: str_of(&obj, tags::ACQUISITION_DATE).unwrap_or_default(),
        acquisition_time: str_of(&obj, tags::ACQUISITION_TIME).unwrap_or_default(),
        content_date: str_of(&obj, tags::CONTENT_DATE).unwrap_or_default(),
        content_time: str_of(&obj, tags::CONTENT_TIME).unwrap_or_default(),
        sop_class_uid: str_of(&obj, tags::SOP_CLASS_UID).unwrap_or_default(),
    })
}

fn str_of(obj: &DicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn multi_str_of(obj: &DicomObject, tag: Tag) -> Vec<String> {
    str_of(obj, tag)
        .map(|joined| joined.split('\\').map(|part| part.to_string()).collect())
        .unwrap_or_default()
}

fn float_of(obj: &DicomObject, tag: Tag) -> Option<f64> {
    obj.element(tag)
        .ok()
        .and_then(|element| element.to_float64().ok())
}

fn int_of(obj: &DicomObject, tag: Tag) -> Option<i64> {
    obj.element(tag)
        .ok()
        .and_then(|element| element.to_int::<i64>().ok())
}

/// One coherent acquisition within a study group.
#[derive(Debug, Clone)]
pub struct SeriesGroup {
    pub seqinfo: SeqInfo,
    pub files: Vec<Utf8PathBuf>,
    pub example: DicomHeader,
}

/// All series sharing one grouping key, ordered by series number.
#[derive(Debug, Clone)]
pub struct StudyGroup {
    pub key: String,
    pub series: Vec<SeriesGroup>,
}

/// Heuristic-supplied grouping callback: ordered (group key, header
/// indices) pairs, or `None` to fall back to the attribute form.
pub type CustomGroupsFn<'a> = &'a dyn Fn(&[DicomHeader]) -> Option<Vec<(String, Vec<usize>)>>;

pub struct GroupingOptions<'a> {
    pub mode: GroupingMode,
    pub file_filter: Option<&'a dyn Fn(&Utf8Path) -> bool>,
    pub dicom_filter: Option<&'a dyn Fn(&DicomHeader) -> bool>,
    pub custom_attribute: Option<String>,
    pub custom_groups: Option<CustomGroupsFn<'a>>,
    pub split_echo_series: bool,
}

impl<'a> Default for GroupingOptions<'a> {
    fn default() -> Self {
        Self {
            mode: GroupingMode::default(),
            file_filter: None,
            dicom_filter: None,
            custom_attribute: None,
            custom_groups: None,
            split_echo_series: false,
        }
    }
}

/// Read candidate files and group them into per-study series with one
/// `SeqInfo` per series. Unreadable or filtered files are excluded silently.
pub fn group_dicoms(
    files: &[Utf8PathBuf],
    opts: &GroupingOptions<'_>,
) -> Result<Vec<StudyGroup>, ConvertError> {
    tracing::info!("analyzing {} dicoms", files.len());

    let mut headers = Vec::new();
    for path in files {
        if let Some(filter) = opts.file_filter {
            if filter(path) {
                continue;
            }
        }
        let header = match read_header(path) {
            Ok(header) => header,
            Err(err) => {
                tracing::debug!("ignoring {}: {}", path, err);
                continue;
            }
        };
        if EXCLUDED_SOP_CLASSES.contains(&header.sop_class_uid.as_str()) {
            continue;
        }
        if let Some(filter) = opts.dicom_filter {
            if filter(&header) {
                continue;
            }
        }
        headers.push(header);
    }

    if opts.mode == GroupingMode::Custom {
        if let Some(callback) = opts.custom_groups {
            if let Some(mapping) = callback(&headers) {
                let mut out = Vec::new();
                for (key, indices) in mapping {
                    out.push(build_study_group(key, &headers, &indices, opts)?);
                }
                return Ok(out);
            }
        }
    }

    // group key -> header indices, in first-seen order
    let mut group_order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, header) in headers.iter().enumerate() {
        let key = group_key(header, opts)?;
        if !groups.contains_key(&key) {
            group_order.push(key.clone());
        }
        groups.entry(key).or_default().push(idx);
    }

    let mut out = Vec::new();
    for key in group_order {
        let indices = groups.remove(&key).expect("key recorded when inserted");
        out.push(build_study_group(key, &headers, &indices, opts)?);
    }
    Ok(out)
}

fn group_key(header: &DicomHeader, opts: &GroupingOptions<'_>) -> Result<String, ConvertError> {
    Ok(match opts.mode {
        GroupingMode::AccessionNumber => {
            format!("{}\u{1f}{}", header.study_uid, header.accession_number)
        }
        GroupingMode::StudyUid => header.study_uid.clone(),
        GroupingMode::All => String::new(),
        GroupingMode::Custom => {
            let attribute = opts.custom_attribute.as_deref().ok_or_else(|| {
                ConvertError::Usage(
                    "custom grouping requires the heuristic to declare a grouping attribute"
                        .to_string(),
                )
            })?;
            attribute_value(header, attribute).ok_or_else(|| {
                ConvertError::StudyConsistency(format!(
                    "file {} has no value for grouping attribute {attribute}",
                    header.path
                ))
            })?
        }
    })
}

fn attribute_value(header: &DicomHeader, attribute: &str) -> Option<String> {
    let value = match attribute {
        "StudyInstanceUID" => header.study_uid.clone(),
        "SeriesInstanceUID" => header.series_uid.clone(),
        "AccessionNumber" => header.accession_number.clone(),
        "PatientID" => header.patient_id.clone(),
        "StudyDescription" => header.study_description.clone(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

fn build_study_group(
    key: String,
    headers: &[DicomHeader],
    indices: &[usize],
    opts: &GroupingOptions<'_>,
) -> Result<StudyGroup, ConvertError> {
    // series identity: SeriesInstanceUID, optionally split per echo
    let mut series_order: Vec<(String, Option<i64>)> = Vec::new();
    let mut by_series: BTreeMap<(String, Option<i64>), Vec<usize>> = BTreeMap::new();
    for &idx in indices {
        let header = &headers[idx];
        let echo = if opts.split_echo_series {
            header.echo_number
        } else {
            None
        };
        let id = (header.series_uid.clone(), echo);
        if !by_series.contains_key(&id) {
            series_order.push(id.clone());
        }
        by_series.entry(id).or_default().push(idx);
    }

    series_order.sort_by_key(|id| {
        let first = by_series[id][0];
        (headers[first].series_number, id.clone())
    });

    // `all` and heuristic-driven grouping may intentionally span studies
    if matches!(
        opts.mode,
        GroupingMode::AccessionNumber | GroupingMode::StudyUid
    ) {
        ensure_single_study(headers, indices)?;
    }

    let mut series = Vec::new();
    let mut seen_ids: BTreeMap<String, usize> = BTreeMap::new();
    let mut total = 0usize;
    for id in series_order {
        let mut file_indices = by_series.remove(&id).expect("series recorded");
        file_indices.sort_by(|&a, &b| headers[a].path.cmp(&headers[b].path));
        let example = headers[file_indices[0]].clone();

        let mut series_id = format!("{}-{}", example.series_number, example.protocol_name);
        if let (true, Some(echo)) = (opts.split_echo_series, id.1) {
            series_id.push_str(&format!("-echo{echo}"));
        }
        let repeat = seen_ids.entry(series_id.clone()).or_insert(0);
        *repeat += 1;
        if *repeat > 1 {
            series_id.push_str(&format!("-{repeat}"));
        }

        let files: Vec<Utf8PathBuf> = file_indices
            .iter()
            .map(|&idx| headers[idx].path.clone())
            .collect();
        total += files.len();

        let seqinfo = SeqInfo {
            total_files_till_now: total,
            example_dcm_file: example
                .path
                .file_name()
                .unwrap_or_default()
                .to_string(),
            series_id,
            dcm_dir_name: example
                .path
                .parent()
                .and_then(|dir| dir.file_name())
                .unwrap_or_default()
                .to_string(),
            unspecified2: "-".to_string(),
            unspecified3: "-".to_string(),
            dim1: example.rows,
            dim2: example.columns,
            dim3: files.len() as u32,
            dim4: example.temporal_positions.unwrap_or(1).max(1),
            tr: example.tr_ms / 1000.0,
            te: example.te_ms,
            protocol_name: example.protocol_name.clone(),
            is_motion_corrected: example.is_motion_corrected(),
            is_derived: example.is_derived(),
            patient_id: example.patient_id.clone(),
            study_description: example.study_description.clone(),
            referring_physician_name: example.referring_physician.clone(),
            series_description: example.series_description.clone(),
            image_type: example.image_type.clone(),
            accession_number: example.accession_number.clone(),
            patient_age: example.patient_age.clone(),
            patient_sex: example.patient_sex.clone(),
            date: example.acquisition_date.clone(),
            series_uid: example.series_uid.clone(),
            time: example.acquisition_time.clone(),
        };
        tracing::debug!(
            "{:>12} {:>30} {:>27} derived={} {:?}",
            key,
            seqinfo.series_id,
            seqinfo.series_description,
            seqinfo.is_derived,
            seqinfo.image_type,
        );
        series.push(SeriesGroup {
            seqinfo,
            files,
            example,
        });
    }

    let display_key = match opts.mode {
        GroupingMode::AccessionNumber => key
            .split('\u{1f}')
            .nth(1)
            .unwrap_or_default()
            .to_string(),
        _ => key,
    };
    Ok(StudyGroup {
        key: display_key,
        series,
    })
}

fn ensure_single_study(headers: &[DicomHeader], indices: &[usize]) -> Result<(), ConvertError> {
    let first = &headers[indices[0]];
    for &idx in indices {
        let header = &headers[idx];
        if header.study_uid != first.study_uid {
            return Err(ConvertError::StudyConsistency(format!(
                "conflicting StudyInstanceUID within one session: {} vs {}",
                first.study_uid, header.study_uid
            )));
        }
        if header.patient_id != first.patient_id {
            return Err(ConvertError::StudyConsistency(format!(
                "subject identifier mismatch within one study: {:?} vs {:?}",
                first.patient_id, header.patient_id
            )));
        }
    }
    Ok(())
}
