use std::time::Duration;

use camino::Utf8PathBuf;

use crate::domain::{Converter, GroupingMode};
use crate::error::ConvertError;

pub const FILELOCK_TIMEOUT_ENV: &str = "HEUDICONV_FILELOCK_TIMEOUT";
pub const DEFAULT_FILELOCK_TIMEOUT: Duration = Duration::from_secs(300);
pub const TOPLEVEL_WRITE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidsMode {
    Full,
    /// BIDS layout, but suppress all top-level file writes for this run.
    NoTop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Ls,
    PopulateTemplates,
    PopulateIntendedFor,
    SanitizeJsons,
    Heuristics,
}

impl EngineCommand {
    pub fn parse(value: &str) -> Result<Self, ConvertError> {
        match value {
            "ls" => Ok(EngineCommand::Ls),
            "populate-templates" => Ok(EngineCommand::PopulateTemplates),
            "populate-intended-for" => Ok(EngineCommand::PopulateIntendedFor),
            "sanitize-jsons" => Ok(EngineCommand::SanitizeJsons),
            "heuristics" => Ok(EngineCommand::Heuristics),
            other => Err(ConvertError::Usage(format!("unknown command {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub outdir: Utf8PathBuf,
    pub dicom_dir_template: Option<String>,
    pub files: Vec<Utf8PathBuf>,
    pub subjects: Vec<String>,
    pub session: Option<String>,
    pub locator: Option<String>,
    pub heuristic: Option<String>,
    pub converter: Converter,
    pub bids: Option<BidsMode>,
    pub overwrite: bool,
    pub minmeta: bool,
    pub grouping: GroupingMode,
    pub random_seed: Option<u64>,
    pub queue: Option<String>,
    pub queue_args: Option<String>,
    pub command: Option<EngineCommand>,
}

impl EngineConfig {
    pub fn new(outdir: Utf8PathBuf) -> Self {
        Self {
            outdir,
            dicom_dir_template: None,
            files: Vec::new(),
            subjects: Vec::new(),
            session: None,
            locator: None,
            heuristic: None,
            converter: Converter::Dcm2niix,
            bids: None,
            overwrite: false,
            minmeta: false,
            grouping: GroupingMode::default(),
            random_seed: None,
            queue: None,
            queue_args: None,
            command: None,
        }
    }

    pub fn bids_enabled(&self) -> bool {
        self.bids.is_some()
    }

    pub fn toplevel_enabled(&self) -> bool {
        matches!(self.bids, Some(BidsMode::Full))
    }

    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.dicom_dir_template.is_some() && !self.files.is_empty() {
            return Err(ConvertError::Usage(
                "dicom dir template and explicit files are mutually exclusive".to_string(),
            ));
        }
        if self.command.is_none() && self.heuristic.is_none() {
            return Err(ConvertError::Usage(
                "no heuristic specified - add to arguments and rerun".to_string(),
            ));
        }
        if self.dicom_dir_template.is_some() && self.subjects.is_empty() {
            return Err(ConvertError::Usage(
                "dicom dir template requires explicit subject ids".to_string(),
            ));
        }
        if !self.files.is_empty() && self.subjects.len() > 1 {
            return Err(ConvertError::Usage(
                "unable to process multiple subjects with explicit files".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lock timeout for top-level file updates, overridable via the environment.
pub fn filelock_timeout() -> Duration {
    std::env::var(FILELOCK_TIMEOUT_ENV)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_FILELOCK_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_inputs_are_rejected() {
        let mut config = EngineConfig::new(Utf8PathBuf::from("/out"));
        config.heuristic = Some("convertall".to_string());
        config.dicom_dir_template = Some("/in/{subject}/*".to_string());
        config.files = vec![Utf8PathBuf::from("/in/file.dcm")];
        assert!(config.validate().is_err());

        config.files.clear();
        assert!(config.validate().is_err());
        config.subjects = vec!["219".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn heuristic_is_required_for_conversions() {
        let mut config = EngineConfig::new(Utf8PathBuf::from("/out"));
        config.files = vec![Utf8PathBuf::from("/in")];
        assert!(config.validate().is_err());

        config.command = Some(EngineCommand::Heuristics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn commands_parse_by_name() {
        assert!(EngineCommand::parse("populate-intended-for").is_ok());
        assert!(EngineCommand::parse("unknown").is_err());
    }
}
