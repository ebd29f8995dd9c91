use camino::Utf8PathBuf;

use heudiconv::domain::{ConversionTarget, OutputKind};
use heudiconv::store::{MappingEntry, ProvenanceStore, RunLogGuard};

fn store_in(dir: &tempfile::TempDir) -> ProvenanceStore {
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    ProvenanceStore::new(&root, "219", Some("itbs"))
}

#[test]
fn heuristic_drift_is_detected_and_snapshotted() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);

    assert_eq!(store.heuristic_differs("v1").unwrap(), None);
    store.freeze_heuristic("v1").unwrap();
    assert_eq!(store.heuristic_differs("v1").unwrap(), Some(false));
    assert_eq!(store.heuristic_differs("v2").unwrap(), Some(true));

    store.freeze_heuristic("v2").unwrap();
    let stored = std::fs::read_to_string(store.heuristic_path().as_std_path()).unwrap();
    assert_eq!(stored, "v2");

    // the previous heuristic survives as a timestamped snapshot
    let snapshots: Vec<String> = std::fs::read_dir(store.info_dir().as_std_path())
        .unwrap()
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("heuristic.") && name != "heuristic.py")
        .collect();
    assert_eq!(snapshots.len(), 1);
    let snapshot_path = store.info_dir().join(&snapshots[0]);
    assert_eq!(
        std::fs::read_to_string(snapshot_path.as_std_path()).unwrap(),
        "v1"
    );
}

#[test]
fn edit_mapping_overrides_auto() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);

    let auto = vec![MappingEntry {
        target: ConversionTarget::new("run{item:03d}", &[OutputKind::NiiGz], None).unwrap(),
        series: vec!["2-MPRAGE".to_string()],
    }];
    store.write_auto_mapping(&auto).unwrap();
    assert_eq!(store.read_edit_mapping().unwrap(), None);

    let edited = vec![MappingEntry {
        target: ConversionTarget::new("anat/sub-{subject}_T1w", &[OutputKind::NiiGz], None)
            .unwrap(),
        series: vec!["2-MPRAGE".to_string()],
    }];
    std::fs::create_dir_all(store.edit_mapping_path().parent().unwrap().as_std_path()).unwrap();
    std::fs::write(
        store.edit_mapping_path().as_std_path(),
        serde_json::to_string(&edited).unwrap(),
    )
    .unwrap();
    assert_eq!(store.read_edit_mapping().unwrap(), Some(edited));
}

#[test]
fn interrupted_runs_leave_a_partial_marker() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir);

    {
        let _guard = RunLogGuard::start(&store).unwrap();
        // dropped without complete()
    }
    let log = std::fs::read_to_string(store.log_path().as_std_path()).unwrap();
    assert!(log.contains("run started"));
    assert!(log.contains("partial run"));

    let guard = RunLogGuard::start(&store).unwrap();
    guard.complete();
    let log = std::fs::read_to_string(store.log_path().as_std_path()).unwrap();
    assert!(log.contains("run completed"));
}
