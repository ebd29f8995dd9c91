use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use heudiconv::domain::{OutputKind, SeqInfo, SeriesBinding, TargetDecision};
use heudiconv::error::ConvertError;
use heudiconv::heuristic::{create_key, load_heuristic, validate_decisions};

fn seqinfo(series_id: &str, protocol: &str) -> SeqInfo {
    SeqInfo {
        total_files_till_now: 1,
        example_dcm_file: "IM-0001.dcm".to_string(),
        series_id: series_id.to_string(),
        dcm_dir_name: protocol.to_string(),
        unspecified2: "-".to_string(),
        unspecified3: "-".to_string(),
        dim1: 64,
        dim2: 64,
        dim3: 32,
        dim4: 1,
        tr: 2.0,
        te: 30.0,
        protocol_name: protocol.to_string(),
        is_motion_corrected: false,
        is_derived: false,
        patient_id: "219".to_string(),
        study_description: "study".to_string(),
        referring_physician_name: "-".to_string(),
        series_description: protocol.to_string(),
        image_type: vec!["ORIGINAL".to_string(), "PRIMARY".to_string(), "M".to_string()],
        accession_number: "A1".to_string(),
        patient_age: "031Y".to_string(),
        patient_sex: "F".to_string(),
        date: "20230405".to_string(),
        series_uid: format!("1.2.3.{series_id}"),
        time: "120000".to_string(),
    }
}

#[test]
fn bundled_names_resolve() {
    let heuristic = load_heuristic("convertall").unwrap();
    assert_eq!(heuristic.name(), "convertall");

    assert_matches!(
        load_heuristic("nosuchheuristic"),
        Err(ConvertError::HeuristicNotFound(_))
    );
}

#[test]
fn a_local_file_shadows_a_bundled_name() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let path = root.join("convertall");
    std::fs::write(
        path.as_std_path(),
        r#"{"description": "local override", "rules": [{"template": "local{item:02d}"}]}"#,
    )
    .unwrap();

    let heuristic = load_heuristic(path.as_str()).unwrap();
    let decisions = heuristic.infotodict(&[seqinfo("2-anything", "anything")]).unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].target.template, "local{item:02d}");
    assert_eq!(heuristic.frozen_form(), std::fs::read_to_string(path.as_std_path()).unwrap());
}

#[test]
fn convertall_claims_every_series() {
    let heuristic = load_heuristic("convertall").unwrap();
    let seqinfos = vec![seqinfo("2-a", "a"), seqinfo("3-b", "b")];
    let decisions = heuristic.infotodict(&seqinfos).unwrap();
    assert_eq!(decisions.len(), 1);
    let series: Vec<&str> = decisions[0]
        .series
        .iter()
        .map(|binding| binding.series_id.as_str())
        .collect();
    assert_eq!(series, vec!["2-a", "3-b"]);
}

#[test]
fn bids_minimal_covers_the_reference_study() {
    let heuristic = load_heuristic("bids-minimal").unwrap();
    let mut fieldmap_phase = seqinfo("5-field_mapping", "field_mapping");
    fieldmap_phase.image_type = vec!["ORIGINAL".to_string(), "PRIMARY".to_string(), "P".to_string()];
    let seqinfos = vec![
        seqinfo("2-MPRAGE", "MPRAGE"),
        seqinfo("3-DTI_30dirs_AP", "DTI_30dirs_AP"),
        seqinfo("4-verify_PA", "verify_PA"),
        seqinfo("5-field_mapping", "field_mapping"),
        fieldmap_phase.clone(),
        seqinfo("6-restingstate", "restingstate"),
        seqinfo("7-restingstate", "restingstate"),
    ];
    // the phase series replaces the magnitude duplicate of series 5
    let mut seqinfos = seqinfos;
    seqinfos[4].series_id = "5-field_mapping-2".to_string();

    let decisions = heuristic.infotodict(&seqinfos).unwrap();
    let templates: Vec<&str> = decisions
        .iter()
        .map(|decision| decision.target.template.as_str())
        .collect();
    assert_eq!(
        templates,
        vec![
            "{bids_subject_session_dir}/anat/{bids_subject_session_prefix}_T1w",
            "{bids_subject_session_dir}/dwi/{bids_subject_session_prefix}_dir-{dir}_dwi",
            "{bids_subject_session_dir}/fmap/{bids_subject_session_prefix}_dir-{dir}_epi",
            "{bids_subject_session_dir}/fmap/{bids_subject_session_prefix}_magnitude",
            "{bids_subject_session_dir}/fmap/{bids_subject_session_prefix}_phasediff",
            "{bids_subject_session_dir}/func/{bids_subject_session_prefix}_task-rest_run-{item:02d}_bold",
        ]
    );

    // named capture groups become template bindings
    let dwi = &decisions[1].series[0];
    assert_eq!(dwi.bindings.get("dir").map(String::as_str), Some("AP"));
    let epi = &decisions[2].series[0];
    assert_eq!(epi.bindings.get("dir").map(String::as_str), Some("PA"));

    // both restingstate series land under the same key, in order
    assert_eq!(decisions[5].series.len(), 2);
}

#[test]
fn invalid_targets_are_rejected() {
    assert_matches!(
        create_key("", &[OutputKind::NiiGz], None),
        Err(ConvertError::Heuristic(_))
    );

    let target = create_key("run{item:03d}", &[], None).unwrap();
    // empty outtypes fall back to nii.gz
    assert_eq!(target.outtypes, vec![OutputKind::NiiGz]);

    let decision = TargetDecision {
        target,
        series: vec![SeriesBinding::plain("99-missing")],
    };
    assert_matches!(
        validate_decisions(&[decision], &[seqinfo("2-a", "a")]),
        Err(ConvertError::Heuristic(_))
    );
}

#[test]
fn malformed_rule_files_error_with_location() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let path = root.join("broken.json");
    std::fs::write(path.as_std_path(), "{\"rules\": []}").unwrap();
    assert_matches!(
        load_heuristic(path.as_str()),
        Err(ConvertError::HeuristicParse { .. })
    );

    std::fs::write(
        path.as_std_path(),
        r#"{"rules": [{"template": "x", "match": {"protocol": "("}}]}"#,
    )
    .unwrap();
    assert_matches!(
        load_heuristic(path.as_str()),
        Err(ConvertError::HeuristicParse { .. })
    );
}

#[test]
fn filters_come_from_the_rule_file() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let path = root.join("filtering.json");
    std::fs::write(
        path.as_std_path(),
        r#"{
          "rules": [{"template": "run{item:03d}"}],
          "exclude_files": ["\\.txt$"],
          "exclude_protocols": ["(?i)localizer"]
        }"#,
    )
    .unwrap();
    let heuristic = load_heuristic(path.as_str()).unwrap();
    assert!(heuristic.filter_file(camino::Utf8Path::new("/x/notes.txt")));
    assert!(!heuristic.filter_file(camino::Utf8Path::new("/x/im.dcm")));
}
