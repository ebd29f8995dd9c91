use camino::{Utf8Path, Utf8PathBuf};
use serde_json::json;

use heudiconv::bids::{load_json, save_json};
use heudiconv::heuristic::{Criterion, IntendedForOpts, MatchingParameter};
use heudiconv::intended_for::{find_fmap_groups, populate_intended_for};

fn tempdir_path(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

fn write_sidecar(path: &Utf8Path, value: serde_json::Value) {
    save_json(path, &value, true).unwrap();
    let image = Utf8PathBuf::from(format!(
        "{}.nii.gz",
        path.as_str().strip_suffix(".json").unwrap()
    ));
    std::fs::write(image.as_std_path(), b"nifti").unwrap();
}

fn write_scans(subject_dir: &Utf8Path, rows: &[(&str, &str)]) {
    let mut content = "filename\tacq_time\toperator\trandstr\n".to_string();
    for (filename, time) in rows {
        content.push_str(&format!("{filename}\t{time}\tn/a\tdeadbeef\n"));
    }
    std::fs::write(
        subject_dir.join("sub-01_scans.tsv").as_std_path(),
        content,
    )
    .unwrap();
}

#[test]
fn fmap_groups_keep_their_companions_together() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);
    let fmap = root.join("fmap");
    write_sidecar(&fmap.join("sub-01_magnitude1.json"), json!({}));
    write_sidecar(&fmap.join("sub-01_magnitude2.json"), json!({}));
    write_sidecar(&fmap.join("sub-01_phasediff.json"), json!({}));
    write_sidecar(&fmap.join("sub-01_acq-pep_dir-AP_epi.json"), json!({}));
    write_sidecar(&fmap.join("sub-01_acq-pep_dir-PA_epi.json"), json!({}));

    let groups = find_fmap_groups(&fmap).unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups["sub-01"].len(), 3);
    assert_eq!(groups["sub-01_acq-pep_epi"].len(), 2);
}

#[test]
fn shim_settings_select_the_matching_fieldmap() {
    let dir = tempfile::tempdir().unwrap();
    let subject = tempdir_path(&dir).join("sub-01");
    let fmap = subject.join("fmap");
    let func = subject.join("func");

    write_sidecar(
        &fmap.join("sub-01_acq-a_phasediff.json"),
        json!({"ShimSetting": [1, 2, 3], "SeriesNumber": 4}),
    );
    write_sidecar(
        &fmap.join("sub-01_acq-b_phasediff.json"),
        json!({"ShimSetting": [9, 9, 9], "SeriesNumber": 5}),
    );
    write_sidecar(
        &func.join("sub-01_task-rest_bold.json"),
        json!({"ShimSetting": [1, 2, 3], "TaskName": "rest"}),
    );
    write_scans(
        &subject,
        &[
            ("fmap/sub-01_acq-a_phasediff.nii.gz", "2023-04-05T10:00:00"),
            ("fmap/sub-01_acq-b_phasediff.nii.gz", "2023-04-05T10:05:00"),
            ("func/sub-01_task-rest_bold.nii.gz", "2023-04-05T10:10:00"),
        ],
    );

    populate_intended_for(
        &subject,
        &IntendedForOpts {
            matching: vec![MatchingParameter::Shims],
            criterion: Criterion::Closest,
        },
    )
    .unwrap();

    let matched = load_json(&fmap.join("sub-01_acq-a_phasediff.json")).unwrap();
    assert_eq!(
        matched["IntendedFor"],
        json!(["func/sub-01_task-rest_bold.nii.gz"])
    );
    let unmatched = load_json(&fmap.join("sub-01_acq-b_phasediff.json")).unwrap();
    assert!(unmatched.get("IntendedFor").is_none());

    // every listed path resolves under the subject and is not an fmap
    for value in matched["IntendedFor"].as_array().unwrap() {
        let listed = subject.join(value.as_str().unwrap());
        assert!(listed.as_std_path().exists());
        assert!(!value.as_str().unwrap().starts_with("fmap/"));
    }
}

#[test]
fn closest_criterion_picks_the_nearest_acquisition() {
    let dir = tempfile::tempdir().unwrap();
    let subject = tempdir_path(&dir).join("sub-01");
    let fmap = subject.join("fmap");
    let func = subject.join("func");

    write_sidecar(
        &fmap.join("sub-01_acq-first_dir-PA_epi.json"),
        json!({"SeriesNumber": 2}),
    );
    write_sidecar(
        &fmap.join("sub-01_acq-second_dir-PA_epi.json"),
        json!({"SeriesNumber": 8}),
    );
    write_sidecar(
        &func.join("sub-01_task-rest_bold.json"),
        json!({"TaskName": "rest"}),
    );
    write_scans(
        &subject,
        &[
            (
                "fmap/sub-01_acq-first_dir-PA_epi.nii.gz",
                "2023-04-05T09:00:00",
            ),
            (
                "fmap/sub-01_acq-second_dir-PA_epi.nii.gz",
                "2023-04-05T10:08:00",
            ),
            ("func/sub-01_task-rest_bold.nii.gz", "2023-04-05T10:10:00"),
        ],
    );

    populate_intended_for(
        &subject,
        &IntendedForOpts {
            matching: vec![MatchingParameter::Force],
            criterion: Criterion::Closest,
        },
    )
    .unwrap();

    let second = load_json(&fmap.join("sub-01_acq-second_dir-PA_epi.json")).unwrap();
    assert_eq!(
        second["IntendedFor"],
        json!(["func/sub-01_task-rest_bold.nii.gz"])
    );
    let first = load_json(&fmap.join("sub-01_acq-first_dir-PA_epi.json")).unwrap();
    assert!(first.get("IntendedFor").is_none());
}

#[test]
fn first_criterion_prefers_the_lowest_series_number() {
    let dir = tempfile::tempdir().unwrap();
    let subject = tempdir_path(&dir).join("sub-01");
    let fmap = subject.join("fmap");
    let dwi = subject.join("dwi");

    write_sidecar(
        &fmap.join("sub-01_acq-late_dir-PA_epi.json"),
        json!({"SeriesNumber": 9}),
    );
    write_sidecar(
        &fmap.join("sub-01_acq-early_dir-PA_epi.json"),
        json!({"SeriesNumber": 3}),
    );
    write_sidecar(&dwi.join("sub-01_dir-AP_dwi.json"), json!({}));
    write_scans(
        &subject,
        &[
            ("fmap/sub-01_acq-late_dir-PA_epi.nii.gz", "2023-04-05T09:00:00"),
            ("fmap/sub-01_acq-early_dir-PA_epi.nii.gz", "2023-04-05T09:30:00"),
            ("dwi/sub-01_dir-AP_dwi.nii.gz", "2023-04-05T09:01:00"),
        ],
    );

    populate_intended_for(
        &subject,
        &IntendedForOpts {
            matching: vec![MatchingParameter::Force],
            criterion: Criterion::First,
        },
    )
    .unwrap();

    let early = load_json(&fmap.join("sub-01_acq-early_dir-PA_epi.json")).unwrap();
    assert_eq!(
        early["IntendedFor"],
        json!(["dwi/sub-01_dir-AP_dwi.nii.gz"])
    );
    let late = load_json(&fmap.join("sub-01_acq-late_dir-PA_epi.json")).unwrap();
    assert!(late.get("IntendedFor").is_none());
}

#[test]
fn modality_labels_route_fieldmaps_by_target_kind() {
    let dir = tempfile::tempdir().unwrap();
    let subject = tempdir_path(&dir).join("sub-01");
    let fmap = subject.join("fmap");
    let func = subject.join("func");
    let dwi = subject.join("dwi");

    write_sidecar(
        &fmap.join("sub-01_acq-fmri_dir-PA_epi.json"),
        json!({"SeriesNumber": 2}),
    );
    write_sidecar(
        &fmap.join("sub-01_acq-diff_dir-PA_epi.json"),
        json!({"SeriesNumber": 3}),
    );
    write_sidecar(
        &func.join("sub-01_task-rest_bold.json"),
        json!({"TaskName": "rest"}),
    );
    write_sidecar(&dwi.join("sub-01_dir-AP_dwi.json"), json!({}));
    write_scans(
        &subject,
        &[
            ("fmap/sub-01_acq-fmri_dir-PA_epi.nii.gz", "2023-04-05T09:00:00"),
            ("fmap/sub-01_acq-diff_dir-PA_epi.nii.gz", "2023-04-05T09:05:00"),
            ("func/sub-01_task-rest_bold.nii.gz", "2023-04-05T09:10:00"),
            ("dwi/sub-01_dir-AP_dwi.nii.gz", "2023-04-05T09:15:00"),
        ],
    );

    populate_intended_for(
        &subject,
        &IntendedForOpts {
            matching: vec![MatchingParameter::ModalityAcquisitionLabel],
            criterion: Criterion::Closest,
        },
    )
    .unwrap();

    let fmri = load_json(&fmap.join("sub-01_acq-fmri_dir-PA_epi.json")).unwrap();
    assert_eq!(
        fmri["IntendedFor"],
        json!(["func/sub-01_task-rest_bold.nii.gz"])
    );
    let diff = load_json(&fmap.join("sub-01_acq-diff_dir-PA_epi.json")).unwrap();
    assert_eq!(diff["IntendedFor"], json!(["dwi/sub-01_dir-AP_dwi.nii.gz"]));
}
