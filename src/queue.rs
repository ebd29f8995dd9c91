use std::fs;
use std::process::Command;

use camino::Utf8Path;

use crate::error::ConvertError;

/// Serialize each (subject, session) into its own batch job re-entering the
/// engine, instead of converting inline. The engine itself never
/// parallelizes; the scheduler provides the concurrency.
pub fn queue_conversion(
    queue: &str,
    queue_args: Option<&str>,
    subjects: &[String],
    passthrough: &[String],
    outdir: &Utf8Path,
) -> Result<(), ConvertError> {
    if queue != "SLURM" {
        return Err(ConvertError::Usage(format!(
            "unsupported queue system {queue:?} (only SLURM)"
        )));
    }
    let program = std::env::current_exe()
        .map_err(|err| ConvertError::Queue(format!("cannot resolve engine binary: {err}")))?;
    fs::create_dir_all(outdir.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;

    for subject in subjects {
        let mut convertcmd = vec![program.to_string_lossy().to_string()];
        convertcmd.extend(passthrough.iter().cloned());
        convertcmd.push("--subjects".to_string());
        convertcmd.push(subject.clone());

        let script_path = outdir.join(format!("dicom-{subject}.sh"));
        let script = format!(
            "#!/bin/bash\n{}\n",
            convertcmd
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" ")
        );
        fs::write(script_path.as_std_path(), script)
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;

        let mut cmd = Command::new("sbatch");
        cmd.arg("-J").arg(format!("heudiconv-{subject}"));
        if let Some(extra) = queue_args {
            for arg in extra.split_whitespace() {
                cmd.arg(arg);
            }
        }
        cmd.arg(script_path.as_std_path());
        let output = cmd
            .output()
            .map_err(|err| ConvertError::Queue(format!("failed to run sbatch: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ConvertError::Queue(format!(
                "sbatch failed for subject {subject}: {stderr}"
            )));
        }
        tracing::info!("queued conversion for subject {}", subject);
    }
    Ok(())
}

fn shell_quote(arg: &str) -> String {
    if arg
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || "-_./=:{}".contains(ch))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
