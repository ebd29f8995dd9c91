use std::path::PathBuf;
use std::process::Command;
use std::thread::sleep;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::discover::find_files;
use crate::error::ConvertError;

/// External DICOM-to-volume transcoder contract: given a DICOM directory it
/// produces files sharing the output base name with extensions drawn from
/// `.nii`, `.nii.gz`, `.json`, `.bval`, `.bvec`.
pub trait Transcoder {
    fn convert(
        &self,
        dicom_dir: &Utf8Path,
        out_dir: &Utf8Path,
        basename: &str,
        compress: bool,
    ) -> Result<Vec<Utf8PathBuf>, ConvertError>;

    fn version(&self) -> Option<String>;
}

pub struct Dcm2niix {
    program: PathBuf,
}

impl Dcm2niix {
    pub fn find() -> Result<Self, ConvertError> {
        let program = find_in_path("dcm2niix")
            .ok_or_else(|| ConvertError::MissingTool("dcm2niix".to_string()))?;
        Ok(Self { program })
    }

    fn run(&self, args: &[String]) -> Result<(), ConvertError> {
        // transient spawn failures are retried; transcoder errors are not
        let mut attempt = 0;
        let output = loop {
            match Command::new(&self.program).args(args).output() {
                Ok(output) => break output,
                Err(err) if attempt < 2 => {
                    attempt += 1;
                    tracing::warn!("spawning dcm2niix failed ({err}), retrying");
                    sleep(Duration::from_millis(100 << attempt));
                }
                Err(err) => {
                    return Err(ConvertError::Filesystem(format!(
                        "failed to run {}: {err}",
                        self.program.display()
                    )));
                }
            }
        };
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("dcm2niix exited with {}", output.status)
        } else {
            stderr
        };
        Err(ConvertError::Transcoder {
            series: args.last().cloned().unwrap_or_default(),
            message,
        })
    }
}

impl Transcoder for Dcm2niix {
    fn convert(
        &self,
        dicom_dir: &Utf8Path,
        out_dir: &Utf8Path,
        basename: &str,
        compress: bool,
    ) -> Result<Vec<Utf8PathBuf>, ConvertError> {
        // full output path, not just the directory, so logs identify the target
        tracing::info!("converting {} -> {}", dicom_dir, out_dir.join(basename));
        let args = vec![
            "-b".to_string(),
            "y".to_string(),
            "-z".to_string(),
            if compress { "y" } else { "n" }.to_string(),
            "-f".to_string(),
            basename.to_string(),
            "-o".to_string(),
            out_dir.to_string(),
            dicom_dir.to_string(),
        ];
        self.run(&args)?;

        let mut produced: Vec<Utf8PathBuf> = find_files(out_dir)?
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .map(|name| name.starts_with(basename))
                    .unwrap_or(false)
            })
            .filter(|path| has_output_extension(path))
            .collect();
        produced.sort();
        if produced.is_empty() {
            return Err(ConvertError::Transcoder {
                series: basename.to_string(),
                message: "transcoder produced no output files".to_string(),
            });
        }
        Ok(produced)
    }

    fn version(&self) -> Option<String> {
        let output = Command::new(&self.program).arg("--version").output().ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!stdout.is_empty()).then_some(stdout)
    }
}

pub fn has_output_extension(path: &Utf8Path) -> bool {
    let name = path.file_name().unwrap_or_default();
    name.ends_with(".nii")
        || name.ends_with(".nii.gz")
        || name.ends_with(".json")
        || name.ends_with(".bval")
        || name.ends_with(".bvec")
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let candidate = path.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}
