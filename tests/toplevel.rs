use camino::Utf8PathBuf;
use serde_json::json;

use heudiconv::bids::{load_json, save_json};
use heudiconv::toplevel::{
    create_file_if_missing, populate_aggregated_jsons, populate_bids_templates, with_toplevel_lock,
    DatasetLock,
};

fn tempdir_path(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

#[test]
fn existing_files_are_never_clobbered() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);
    let changes = root.join("CHANGES");

    assert!(create_file_if_missing(&changes, "original\n").unwrap());
    assert!(!create_file_if_missing(&changes, "replacement\n").unwrap());
    assert_eq!(
        std::fs::read_to_string(changes.as_std_path()).unwrap(),
        "original\n"
    );
}

#[test]
fn templates_are_created_with_heuristic_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);

    let mut defaults = serde_json::Map::new();
    defaults.insert("Name".to_string(), json!("QA study"));
    populate_bids_templates(&root, &defaults).unwrap();

    let description = load_json(&root.join("dataset_description.json")).unwrap();
    assert_eq!(description["Name"], json!("QA study"));
    assert_eq!(description["BIDSVersion"], json!("1.8.0"));
    assert!(root.join("CHANGES").as_std_path().exists());
    assert!(root.join("README").as_std_path().exists());
    assert!(root.join("scans.json").as_std_path().exists());

    // a rerun leaves the user-owned files alone
    std::fs::write(root.join("README").as_std_path(), "my readme").unwrap();
    populate_bids_templates(&root, &serde_json::Map::new()).unwrap();
    assert_eq!(
        std::fs::read_to_string(root.join("README").as_std_path()).unwrap(),
        "my readme"
    );
    assert_eq!(
        load_json(&root.join("dataset_description.json")).unwrap()["Name"],
        json!("QA study")
    );
}

#[test]
fn identical_fields_move_up_into_the_task_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);
    let func = root.join("sub-219/func");

    save_json(
        &func.join("sub-219_task-rest_run-01_bold.json"),
        &json!({"TaskName": "rest", "RepetitionTime": 2.0, "FlipAngle": 90, "EchoTime": 0.03}),
        true,
    )
    .unwrap();
    save_json(
        &func.join("sub-219_task-rest_run-02_bold.json"),
        &json!({"TaskName": "rest", "RepetitionTime": 2.0, "FlipAngle": 75, "EchoTime": 0.03}),
        true,
    )
    .unwrap();

    populate_aggregated_jsons(&root).unwrap();

    let task = load_json(&root.join("task-rest_bold.json")).unwrap();
    assert_eq!(task["RepetitionTime"], json!(2.0));
    assert_eq!(task["EchoTime"], json!(0.03));
    assert!(task.get("FlipAngle").is_none());
    assert_eq!(task["TaskName"], json!("TODO: full task name for rest"));

    // hoisted fields disappear from the runs; differing and kept fields stay
    let run1 = load_json(&func.join("sub-219_task-rest_run-01_bold.json")).unwrap();
    assert!(run1.get("RepetitionTime").is_none());
    assert!(run1.get("EchoTime").is_none());
    assert_eq!(run1["FlipAngle"], json!(90));
    assert_eq!(run1["TaskName"], json!("rest"));

    // events stubs appear next to the runs
    assert!(func
        .join("sub-219_task-rest_run-01_events.tsv")
        .as_std_path()
        .exists());

    // a manually edited task name survives regeneration
    let mut task = load_json(&root.join("task-rest_bold.json")).unwrap();
    task["TaskName"] = json!("Resting state");
    save_json(&root.join("task-rest_bold.json"), &task, true).unwrap();
    populate_aggregated_jsons(&root).unwrap();
    let task = load_json(&root.join("task-rest_bold.json")).unwrap();
    assert_eq!(task["TaskName"], json!("Resting state"));
    // fields hoisted earlier survive recomputation from stripped sidecars
    assert_eq!(task["RepetitionTime"], json!(2.0));
}

#[test]
fn events_stubs_are_shared_across_echoes() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);
    let func = root.join("sub-01/func");
    for echo in 1..=3 {
        save_json(
            &func.join(format!("sub-01_task-x_echo-{echo}_bold.json")),
            &json!({"TaskName": "x", "EchoTime": 0.01 * echo as f64}),
            true,
        )
        .unwrap();
    }

    populate_aggregated_jsons(&root).unwrap();
    assert!(func.join("sub-01_task-x_events.tsv").as_std_path().exists());
    assert!(!func
        .join("sub-01_task-x_echo-2_events.tsv")
        .as_std_path()
        .exists());
}

#[test]
fn the_lock_excludes_concurrent_writers() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);

    let lock = DatasetLock::acquire(&root, std::time::Duration::from_secs(5)).unwrap();
    let contender = DatasetLock::acquire(&root, std::time::Duration::from_millis(200));
    assert!(matches!(
        contender,
        Err(heudiconv::error::ConvertError::LockTimeout(_))
    ));
    drop(lock);
    DatasetLock::acquire(&root, std::time::Duration::from_secs(5)).unwrap();
}

#[test]
fn concurrent_participant_updates_lose_no_rows() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempdir_path(&dir);

    let mut handles = Vec::new();
    for subject in ["101", "102", "103", "104"] {
        let root = root.clone();
        handles.push(std::thread::spawn(move || {
            with_toplevel_lock(&root, || {
                heudiconv::bids::add_participant_record(&root, subject, "031Y", "F")
            })
            .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let content =
        std::fs::read_to_string(root.join("participants.tsv").as_std_path()).unwrap();
    let mut subjects: Vec<&str> = content
        .lines()
        .skip(1)
        .filter_map(|line| line.split('\t').next())
        .collect();
    subjects.sort_unstable();
    assert_eq!(subjects, vec!["sub-101", "sub-102", "sub-103", "sub-104"]);
}
