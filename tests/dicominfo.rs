use heudiconv::domain::{SeqInfo, SEQINFO_COLUMNS};
use heudiconv::store::{seqinfo_from_row, seqinfo_to_row};

fn sample_seqinfo() -> SeqInfo {
    SeqInfo {
        total_files_till_now: 176,
        example_dcm_file: "IM-0001-0001.dcm".to_string(),
        series_id: "2-MPRAGE".to_string(),
        dcm_dir_name: "MPRAGE".to_string(),
        unspecified2: "-".to_string(),
        unspecified3: "-".to_string(),
        dim1: 256,
        dim2: 256,
        dim3: 176,
        dim4: 1,
        tr: 2.3,
        te: 2.96,
        protocol_name: "MPRAGE".to_string(),
        is_motion_corrected: false,
        is_derived: false,
        patient_id: "219".to_string(),
        study_description: "dbic^QA".to_string(),
        referring_physician_name: "-".to_string(),
        series_description: "MPRAGE 1mm iso".to_string(),
        image_type: vec![
            "ORIGINAL".to_string(),
            "PRIMARY".to_string(),
            "M".to_string(),
        ],
        accession_number: "A001".to_string(),
        patient_age: "031Y".to_string(),
        patient_sex: "F".to_string(),
        date: "20230405".to_string(),
        series_uid: "1.2.840.1.1".to_string(),
        time: "121530.75".to_string(),
    }
}

#[test]
fn roundtrips_through_tsv_row() {
    let seqinfo = sample_seqinfo();
    let row = seqinfo_to_row(&seqinfo);
    assert_eq!(row.len(), SEQINFO_COLUMNS.len());
    let fields: Vec<&str> = row.iter().map(|field| field.as_str()).collect();
    let parsed = seqinfo_from_row(&fields).unwrap();
    assert_eq!(parsed, seqinfo);
}

#[test]
fn nan_echo_values_roundtrip() {
    let mut seqinfo = sample_seqinfo();
    seqinfo.tr = f64::NAN;
    seqinfo.te = f64::NAN;
    let row = seqinfo_to_row(&seqinfo);
    let fields: Vec<&str> = row.iter().map(|field| field.as_str()).collect();
    let parsed = seqinfo_from_row(&fields).unwrap();
    assert!(parsed.tr.is_nan());
    assert!(parsed.te.is_nan());
}

#[test]
fn short_rows_are_rejected() {
    assert!(seqinfo_from_row(&["1", "a"]).is_err());
}

#[test]
fn store_roundtrip_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let store = heudiconv::store::ProvenanceStore::new(&root, "219", None);

    let mut second = sample_seqinfo();
    second.series_id = "3-restingstate".to_string();
    second.te = f64::NAN;
    let seqinfos = vec![sample_seqinfo(), second];

    store.write_dicominfo(&seqinfos).unwrap();
    let first_pass = std::fs::read_to_string(store.dicominfo_path().as_std_path()).unwrap();

    let reread = store.read_dicominfo().unwrap();
    store.write_dicominfo(&reread).unwrap();
    let second_pass = std::fs::read_to_string(store.dicominfo_path().as_std_path()).unwrap();
    assert_eq!(first_pass, second_pass);
}
