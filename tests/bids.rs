use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::json;

use heudiconv::bids::{
    add_rows_to_scans_file, assign_final_prefixes, ensure_task_name, insert_dup, json_dumps,
    json_dumps_pretty, load_json, normalize_prefix, rewrite_legacy_rec, save_json, treat_age,
    BidsFile, ProducedImage,
};

fn tempdir_path(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

#[test]
fn entities_are_reordered_canonically() {
    let bids = BidsFile::parse("sub-01_echo-2_run-03_task-rest_acq-highres_bold.nii.gz");
    assert_eq!(
        bids.to_string(),
        "sub-01_task-rest_acq-highres_run-03_echo-2_bold.nii.gz"
    );
}

#[test]
fn unknown_trailing_segments_are_preserved() {
    let bids = BidsFile::parse("sub-01_run-01_myextra-x_bold.nii.gz");
    assert_eq!(bids.to_string(), "sub-01_run-01_myextra-x_bold.nii.gz");
}

#[test]
fn dup_marker_lands_before_the_suffix() {
    let prefix = Utf8Path::new("/out/sub-219/func/sub-219_task-rest_run-01_bold");
    let dup = insert_dup(prefix, 1);
    assert_eq!(
        dup.as_str(),
        "/out/sub-219/func/sub-219_task-rest_run-01__dup-01_bold"
    );

    // non-BIDS prefixes get a plain suffix
    let plain = insert_dup(Utf8Path::new("/out/run001"), 2);
    assert_eq!(plain.as_str(), "/out/run001__dup-02");
}

#[test]
fn modality_defaults_fill_missing_suffixes() {
    let anat = normalize_prefix(Utf8Path::new("/out/sub-01/anat/sub-01"));
    assert_eq!(anat.as_str(), "/out/sub-01/anat/sub-01_T1w");

    let fmap = normalize_prefix(Utf8Path::new("/out/sub-01/fmap/sub-01_dir-PA"));
    assert_eq!(fmap.as_str(), "/out/sub-01/fmap/sub-01_dir-PA_epi");

    let func = normalize_prefix(Utf8Path::new("/out/sub-01/func/sub-01_task-rest"));
    assert_eq!(func.as_str(), "/out/sub-01/func/sub-01_task-rest_bold");

    // explicit suffixes are left alone
    let kept = normalize_prefix(Utf8Path::new("/out/sub-01/anat/sub-01_T2w"));
    assert_eq!(kept.as_str(), "/out/sub-01/anat/sub-01_T2w");
}

#[test]
fn legacy_rec_becomes_part() {
    let mut bids = BidsFile::parse("sub-01_rec-magnitude_bold.nii.gz");
    rewrite_legacy_rec(&mut bids);
    assert_eq!(bids.to_string(), "sub-01_part-mag_bold.nii.gz");

    let mut bids = BidsFile::parse("sub-01_rec-phase_bold.nii.gz");
    rewrite_legacy_rec(&mut bids);
    assert_eq!(bids.to_string(), "sub-01_part-phase_bold.nii.gz");
}

#[test]
fn magnitude_pairs_are_numbered_in_sorted_order() {
    let prefix = Utf8Path::new("/out/sub-01/fmap/sub-01_magnitude");
    let produced = vec![
        ProducedImage {
            stem: "work_e2".to_string(),
            echo_number: None,
            echo_time: None,
            is_phase: false,
        },
        ProducedImage {
            stem: "work_e1".to_string(),
            echo_number: None,
            echo_time: None,
            is_phase: false,
        },
    ];
    let assigned = assign_final_prefixes(prefix, &produced).unwrap();
    assert_eq!(
        assigned["work_e1"].as_str(),
        "/out/sub-01/fmap/sub-01_magnitude1"
    );
    assert_eq!(
        assigned["work_e2"].as_str(),
        "/out/sub-01/fmap/sub-01_magnitude2"
    );
}

#[test]
fn echo_labels_follow_ascending_echo_times() {
    let prefix = Utf8Path::new("/out/sub-01/func/sub-01_task-x_bold");
    let produced = vec![
        ProducedImage {
            stem: "w_a".to_string(),
            echo_number: None,
            echo_time: Some(0.030),
            is_phase: false,
        },
        ProducedImage {
            stem: "w_b".to_string(),
            echo_number: None,
            echo_time: Some(0.0132),
            is_phase: false,
        },
        ProducedImage {
            stem: "w_c".to_string(),
            echo_number: None,
            echo_time: Some(0.045),
            is_phase: false,
        },
    ];
    let assigned = assign_final_prefixes(prefix, &produced).unwrap();
    assert_eq!(
        assigned["w_b"].as_str(),
        "/out/sub-01/func/sub-01_task-x_echo-1_bold"
    );
    assert_eq!(
        assigned["w_a"].as_str(),
        "/out/sub-01/func/sub-01_task-x_echo-2_bold"
    );
    assert_eq!(
        assigned["w_c"].as_str(),
        "/out/sub-01/func/sub-01_task-x_echo-3_bold"
    );
}

#[test]
fn phase_reconstructions_get_part_entities() {
    let prefix = Utf8Path::new("/out/sub-01/func/sub-01_task-x_bold");
    let produced = vec![
        ProducedImage {
            stem: "w".to_string(),
            echo_number: None,
            echo_time: None,
            is_phase: false,
        },
        ProducedImage {
            stem: "w_ph".to_string(),
            echo_number: None,
            echo_time: None,
            is_phase: true,
        },
    ];
    let assigned = assign_final_prefixes(prefix, &produced).unwrap();
    assert_eq!(
        assigned["w"].as_str(),
        "/out/sub-01/func/sub-01_task-x_part-mag_bold"
    );
    assert_eq!(
        assigned["w_ph"].as_str(),
        "/out/sub-01/func/sub-01_task-x_part-phase_bold"
    );
}

#[test]
fn pretty_json_collapses_numeric_arrays_only() {
    let value = json!({
        "ShimSetting": [1, -2, 3],
        "Names": ["a", "b"],
        "Nested": {"SliceTiming": [0.0, 0.5]},
    });
    let pretty = json_dumps_pretty(&value).unwrap();
    assert!(pretty.contains("[1, -2, 3]"));
    assert!(pretty.contains("\"Names\": [\n"));
    assert_eq!(serde_json::from_str::<serde_json::Value>(&pretty).unwrap(), value);
}

#[test]
fn emitted_sidecars_reread_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);
    let path = root.join("sidecar.json");
    let value = json!({
        "TaskName": "rest",
        "SliceTiming": [0.0, 0.25, 0.5],
        "Quoted": "[1, 2]",
    });
    save_json(&path, &value, true).unwrap();
    let first = std::fs::read(path.as_std_path()).unwrap();

    let reread = load_json(&path).unwrap();
    save_json(&path, &reread, true).unwrap();
    let second = std::fs::read(path.as_std_path()).unwrap();
    assert_eq!(first, second);
    // quoted-string contents survive untouched
    assert!(String::from_utf8(second).unwrap().contains("\"[1, 2]\""));
}

#[test]
fn plain_dump_is_two_space_indented() {
    let value = json!({"a": {"b": 1}});
    assert_eq!(json_dumps(&value), "{\n  \"a\": {\n    \"b\": 1\n  }\n}");
}

#[test]
fn scans_rows_sort_missing_times_last() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);
    let path = root.join("sub-01_scans.tsv");

    let mut rows = BTreeMap::new();
    rows.insert(
        "func/sub-01_task-rest_bold.nii.gz".to_string(),
        vec!["2023-04-05T12:15:30".to_string(), "n/a".to_string(), "abcd1234".to_string()],
    );
    rows.insert(
        "anat/sub-01_T1w.nii.gz".to_string(),
        vec!["n/a".to_string(), "n/a".to_string(), "ffff0000".to_string()],
    );
    rows.insert(
        "dwi/sub-01_dwi.nii.gz".to_string(),
        vec!["2023-04-05T11:00:00".to_string(), "n/a".to_string(), "00001111".to_string()],
    );
    add_rows_to_scans_file(&path, rows).unwrap();

    let content = std::fs::read_to_string(path.as_std_path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[0], "filename\tacq_time\toperator\trandstr");
    assert!(lines[1].starts_with("dwi/"));
    assert!(lines[2].starts_with("func/"));
    assert!(lines[3].starts_with("anat/"));

    // merging again keeps existing rows and stays sorted
    let mut more = BTreeMap::new();
    more.insert(
        "anat/sub-01_T2w.nii.gz".to_string(),
        vec!["n/a".to_string(), "n/a".to_string(), "12341234".to_string()],
    );
    add_rows_to_scans_file(&path, more).unwrap();
    let content = std::fs::read_to_string(path.as_std_path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[3].starts_with("anat/sub-01_T1w"));
    assert!(lines[4].starts_with("anat/sub-01_T2w"));
}

#[test]
fn participants_rows_are_not_duplicated() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);

    heudiconv::bids::add_participant_record(&root, "219", "18M", "F").unwrap();
    heudiconv::bids::add_participant_record(&root, "219", "18M", "F").unwrap();
    heudiconv::bids::add_participant_record(&root, "220", "", "").unwrap();

    let content =
        std::fs::read_to_string(root.join("participants.tsv").as_std_path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[0], "participant_id\tage\tsex\tgroup");
    assert_eq!(lines[1], "sub-219\t1.50\tF\tcontrol");
    assert_eq!(lines[2], "sub-220\tn/a\tn/a\tcontrol");
    assert_eq!(lines.len(), 3);

    assert!(root.join("participants.json").as_std_path().exists());
}

#[test]
fn month_ages_become_fractional_years() {
    assert_eq!(treat_age("18M").unwrap(), "1.50");
    assert_eq!(treat_age("36M").unwrap(), "3");
    assert_eq!(treat_age("031Y").unwrap(), "31");
    assert!(treat_age("").is_none());
}

#[test]
fn minmeta_restricts_sidecars_to_bids_vocabulary() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);
    let path = root.join("sub-01_task-rest_bold.json");
    save_json(
        &path,
        &json!({
            "RepetitionTime": 2.0,
            "CsaSeriesHeader": "vendor blob",
            "SourceImageSequence": [1, 2],
            "AcquisitionDateTime": "2023-04-05T12:00:00",
        }),
        true,
    )
    .unwrap();

    heudiconv::bids::tuneup_sidecar(&path, true, "1.0.2").unwrap();
    let value = load_json(&path).unwrap();
    let keys: Vec<&str> = value
        .as_object()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(keys, vec!["HeudiconvVersion", "RepetitionTime"]);
    assert!(keys
        .iter()
        .all(|key| heudiconv::bids::BIDS_SIDECAR_FIELDS.contains(key)));
}

#[test]
fn task_name_is_injected_into_bold_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);
    let path = root.join("sub-01_task-rest_run-01_bold.json");
    save_json(&path, &json!({"RepetitionTime": 2.0}), true).unwrap();

    ensure_task_name(&path).unwrap();
    let value = load_json(&path).unwrap();
    assert_eq!(value["TaskName"], json!("rest"));

    // non-bold sidecars are untouched
    let anat = root.join("sub-01_T1w.json");
    save_json(&anat, &json!({}), true).unwrap();
    ensure_task_name(&anat).unwrap();
    assert!(load_json(&anat).unwrap().get("TaskName").is_none());
}
