use camino::{Utf8Path, Utf8PathBuf};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::bids::enrich_phasediff_sidecar;
use crate::config::{EngineCommand, EngineConfig};
use crate::convert::{convert_items, plan_conversion, ConversionItem};
use crate::dicom::{group_dicoms, GroupingOptions, StudyGroup};
use crate::discover::Discovery;
use crate::domain::{
    sanitize_label, Converter, GroupingMode, SeqInfo, SeriesBinding, StudySession, TargetDecision,
};
use crate::error::ConvertError;
use crate::heuristic::{
    load_heuristic, validate_decisions, Criterion, Heuristic, IntendedForOpts, MatchingParameter,
};
use crate::intended_for::populate_intended_for;
use crate::queue::queue_conversion;
use crate::store::{MappingEntry, ProvenanceStore, RunLogGuard};
use crate::toplevel::{populate_bids_templates, with_toplevel_lock, write_participant_record};
use crate::transcoder::{Dcm2niix, Transcoder};

#[derive(Debug, Default)]
pub struct RunSummary {
    pub processed: usize,
    pub failed_subjects: Vec<(String, String)>,
    pub failed_series: usize,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed_subjects.is_empty() && self.failed_series == 0
    }
}

pub struct Workflow {
    config: EngineConfig,
}

impl Workflow {
    pub fn new(config: EngineConfig) -> Result<Self, ConvertError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn run(&self) -> Result<RunSummary, ConvertError> {
        if let Some(command) = self.config.command {
            self.run_command(command)?;
            return Ok(RunSummary::default());
        }

        if let Some(queue) = self.config.queue.as_deref() {
            tracing::info!("queuing {} conversion", queue);
            let subjects = if self.config.subjects.is_empty() {
                return Err(ConvertError::Usage(
                    "queue mode requires explicit subjects".to_string(),
                ));
            } else {
                self.config.subjects.clone()
            };
            queue_conversion(
                queue,
                self.config.queue_args.as_deref(),
                &subjects,
                &self.passthrough_args(),
                &self.config.outdir,
            )?;
            return Ok(RunSummary::default());
        }

        let heuristic = load_heuristic(self.config.heuristic.as_deref().ok_or_else(|| {
            ConvertError::Usage("no heuristic specified - add to arguments and rerun".to_string())
        })?)?;

        let mut discovery = Discovery::new();
        let study_sessions = self.study_sessions(&mut discovery, heuristic.as_ref())?;
        tracing::info!("need to process {} study sessions", study_sessions.len());

        let mut summary = RunSummary::default();
        for (ids, group) in study_sessions {
            let label = ids
                .subject
                .clone()
                .unwrap_or_else(|| "<unknown>".to_string());
            tracing::info!("PROCESSING STARTS: {}", ids);
            match self.process_study_session(&ids, group, heuristic.as_ref()) {
                Ok(failed_series) => {
                    summary.processed += 1;
                    summary.failed_series += failed_series;
                }
                Err(err) => {
                    tracing::error!("subject {} failed: {}", label, err);
                    summary.failed_subjects.push((label, err.to_string()));
                }
            }
            tracing::info!("PROCESSING DONE: {}", ids);
        }
        Ok(summary)
    }

    /// Arguments a queued job needs to re-enter the engine for one subject.
    fn passthrough_args(&self) -> Vec<String> {
        let mut args = vec!["-o".to_string(), self.config.outdir.to_string()];
        if let Some(heuristic) = &self.config.heuristic {
            args.push("-f".to_string());
            args.push(heuristic.clone());
        }
        if let Some(template) = &self.config.dicom_dir_template {
            args.push("-d".to_string());
            args.push(template.clone());
        }
        for file in &self.config.files {
            args.push("--files".to_string());
            args.push(file.to_string());
        }
        if let Some(session) = &self.config.session {
            args.push("--ses".to_string());
            args.push(session.clone());
        }
        args.push("-c".to_string());
        args.push(
            match self.config.converter {
                Converter::Dcm2niix => "dcm2niix",
                Converter::None => "none",
            }
            .to_string(),
        );
        if self.config.bids_enabled() {
            args.push("--bids".to_string());
            args.push("notop".to_string());
        }
        if self.config.overwrite {
            args.push("--overwrite".to_string());
        }
        if self.config.minmeta {
            args.push("--minmeta".to_string());
        }
        args
    }

    /// Sort the inputs into (study session, series groups) pairs, either by
    /// expanding the subject template or by grouping explicit files.
    fn study_sessions(
        &self,
        discovery: &mut Discovery,
        heuristic: &dyn Heuristic,
    ) -> Result<Vec<(StudySession, StudyGroup)>, ConvertError> {
        let mut out: Vec<(StudySession, StudyGroup)> = Vec::new();

        if let Some(template) = &self.config.dicom_dir_template {
            for sid in &self.config.subjects {
                let extracted =
                    discovery.from_template(template, sid, self.config.session.as_deref())?;
                for session_files in extracted {
                    if session_files.files.is_empty() {
                        continue;
                    }
                    let session = match (&session_files.session, &self.config.session) {
                        (Some(derived), Some(given)) => {
                            tracing::warn!(
                                "session {given} was specified but analysis found {derived:?}, using it instead"
                            );
                            Some(derived.clone())
                        }
                        (Some(derived), None) => Some(derived.clone()),
                        (None, given) => given.clone(),
                    };
                    // the template names one subject-session; the whole
                    // input is a single group
                    let groups = self.group_files(&session_files.files, heuristic, true)?;
                    for group in groups {
                        out.push((
                            StudySession {
                                locator: self.config.locator.clone(),
                                session: session.clone(),
                                subject: Some(sanitize_label(sid)?),
                            },
                            group,
                        ));
                    }
                }
            }
            return Ok(out);
        }

        let files = discovery.from_files(&self.config.files)?;
        let groups = self.group_files(&files, heuristic, false)?;
        for group in groups {
            let seqinfos: Vec<SeqInfo> = group.series.iter().map(|s| s.seqinfo.clone()).collect();
            let ids = heuristic
                .infotoids(&seqinfos, &self.config.outdir)
                .unwrap_or_default();
            let subject = match self.config.subjects.first() {
                Some(sid) => Some(sanitize_label(sid)?),
                None => ids.subject,
            };
            if subject.is_none() {
                return Err(ConvertError::Usage(
                    "cannot guarantee subject id - add subject derivation to the heuristic or \
                     provide --subjects"
                        .to_string(),
                ));
            }
            let ids = StudySession {
                locator: self.config.locator.clone().or(ids.locator),
                session: self.config.session.clone().or(ids.session),
                subject,
            };
            if self.config.grouping != GroupingMode::All
                && out.iter().any(|(existing, _)| existing == &ids)
            {
                return Err(ConvertError::StudyConsistency(format!(
                    "study session {ids} already in analyzed sessions"
                )));
            }
            tracing::info!("study session {}", ids);
            out.push((ids, group));
        }
        Ok(out)
    }

    fn group_files(
        &self,
        files: &[Utf8PathBuf],
        heuristic: &dyn Heuristic,
        single_session: bool,
    ) -> Result<Vec<StudyGroup>, ConvertError> {
        let file_filter = |path: &Utf8Path| heuristic.filter_file(path);
        let dicom_filter = |header: &crate::dicom::DicomHeader| heuristic.filter_dicom(header);
        let custom_groups =
            |headers: &[crate::dicom::DicomHeader]| heuristic.group_custom(headers);
        let opts = GroupingOptions {
            mode: if single_session {
                GroupingMode::All
            } else {
                self.config.grouping
            },
            file_filter: Some(&file_filter),
            dicom_filter: Some(&dicom_filter),
            custom_attribute: heuristic.grouping_attribute(),
            custom_groups: Some(&custom_groups),
            split_echo_series: heuristic.split_echo_series(),
        };
        group_dicoms(files, &opts)
    }

    fn process_study_session(
        &self,
        ids: &StudySession,
        group: StudyGroup,
        heuristic: &dyn Heuristic,
    ) -> Result<usize, ConvertError> {
        let subject = ids
            .subject
            .as_deref()
            .ok_or_else(|| ConvertError::Usage("no subject id for study session".to_string()))?;
        if group.series.is_empty() {
            return Err(ConvertError::Usage("nothing to process?".to_string()));
        }
        let study_outdir = match ids.locator.as_deref() {
            Some(locator) => self.config.outdir.join(locator),
            None => self.config.outdir.clone(),
        };

        let store = ProvenanceStore::new(&study_outdir, subject, ids.session.as_deref());
        let guard = RunLogGuard::start(&store)?;

        let frozen = heuristic.frozen_form();
        let force = match store.heuristic_differs(&frozen)? {
            Some(true) => {
                tracing::info!(
                    "heuristic for subject {} changed since the last run, forcing reconversion",
                    subject
                );
                store.append_log("heuristic changed, forcing reconversion")?;
                true
            }
            _ => false,
        };
        store.freeze_heuristic(&frozen)?;

        let seqinfos: Vec<SeqInfo> = group.series.iter().map(|s| s.seqinfo.clone()).collect();
        store.write_dicominfo(&seqinfos)?;
        let filegroup = group
            .series
            .iter()
            .map(|s| (s.seqinfo.series_id.clone(), s.files.clone()))
            .collect();
        store.write_filegroup(&filegroup)?;

        let mut decisions = heuristic.infotodict(&seqinfos)?;
        validate_decisions(&decisions, &seqinfos)?;

        let auto: Vec<MappingEntry> = decisions
            .iter()
            .map(|decision| MappingEntry {
                target: decision.target.clone(),
                series: decision
                    .series
                    .iter()
                    .map(|series| series.series_id.clone())
                    .collect(),
            })
            .collect();
        store.write_auto_mapping(&auto)?;
        if let Some(edit) = store.read_edit_mapping()? {
            if edit != auto {
                tracing::info!("using edited key/series mapping from the provenance store");
                store.append_log("using edit mapping override")?;
                decisions = edit
                    .into_iter()
                    .map(|entry| TargetDecision {
                        target: entry.target,
                        series: entry
                            .series
                            .iter()
                            .map(|series_id| SeriesBinding::plain(series_id))
                            .collect(),
                    })
                    .collect();
                validate_decisions(&decisions, &seqinfos)?;
            }
        }

        let items = plan_conversion(
            &decisions,
            &group,
            ids,
            &study_outdir,
            self.config.bids_enabled(),
        )?;

        let dcm2niix;
        let transcoder: Option<&dyn Transcoder> = match self.config.converter {
            Converter::Dcm2niix => {
                dcm2niix = Dcm2niix::find()?;
                Some(&dcm2niix)
            }
            Converter::None => None,
        };
        let mut rng = match self.config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let outcome = convert_items(
            &items,
            transcoder,
            &self.config,
            &store,
            &study_outdir,
            force,
            &mut rng,
        );
        store.append_log(&format!(
            "converted {} series, skipped {}, failed {}",
            outcome.converted.len(),
            outcome.skipped,
            outcome.failed.len()
        ))?;

        if self.config.bids_enabled() {
            self.finalize_bids(ids, subject, &study_outdir, &items, heuristic)?;
        }

        guard.complete();
        Ok(outcome.failed.len())
    }

    fn finalize_bids(
        &self,
        ids: &StudySession,
        subject: &str,
        study_outdir: &Utf8Path,
        items: &[ConversionItem],
        heuristic: &dyn Heuristic,
    ) -> Result<(), ConvertError> {
        let session_dir = match ids.session.as_deref() {
            Some(session) => study_outdir
                .join(format!("sub-{subject}"))
                .join(format!("ses-{session}")),
            None => study_outdir.join(format!("sub-{subject}")),
        };
        let prefix = match ids.session.as_deref() {
            Some(session) => format!("sub-{subject}_ses-{session}"),
            None => format!("sub-{subject}"),
        };

        let fmap_dir = session_dir.join("fmap");
        if fmap_dir.as_std_path().exists() {
            enrich_phasediff_sidecar(&fmap_dir, &prefix)?;
        }

        if let Some(first) = items.first() {
            write_participant_record(
                study_outdir,
                subject,
                &first.seqinfo.patient_age,
                &first.seqinfo.patient_sex,
            )?;
        }

        if self.config.toplevel_enabled() {
            let defaults = heuristic.default_fields();
            with_toplevel_lock(study_outdir, || {
                populate_bids_templates(study_outdir, &defaults)
            })?;
        }

        if let Some(opts) = heuristic.intended_for() {
            if session_dir.as_std_path().exists() {
                populate_intended_for(&session_dir, &opts)?;
            }
        }
        Ok(())
    }

    fn run_command(&self, command: EngineCommand) -> Result<(), ConvertError> {
        match command {
            EngineCommand::Heuristics => {
                for (name, description) in crate::heuristic::known_heuristics() {
                    println!("- {name}: {description}");
                }
                Ok(())
            }
            EngineCommand::Ls => {
                let heuristic = load_heuristic(self.config.heuristic.as_deref().ok_or_else(
                    || ConvertError::Usage("ls requires a heuristic".to_string()),
                )?)?;
                let mut discovery = Discovery::new();
                let study_sessions = self.study_sessions(&mut discovery, heuristic.as_ref())?;
                for (ids, group) in study_sessions {
                    println!("\t{} {} sequences", ids, group.series.len());
                }
                Ok(())
            }
            EngineCommand::SanitizeJsons => {
                for file in &self.config.files {
                    crate::bids::tuneup_sidecar(file, self.config.minmeta, crate::VERSION)?;
                }
                Ok(())
            }
            EngineCommand::PopulateTemplates => {
                let defaults = match self.config.heuristic.as_deref() {
                    Some(spec) => load_heuristic(spec)?.default_fields(),
                    None => Default::default(),
                };
                let roots: Vec<Utf8PathBuf> = if self.config.files.is_empty() {
                    vec![self.config.outdir.clone()]
                } else {
                    self.config.files.clone()
                };
                for root in roots {
                    with_toplevel_lock(&root, || populate_bids_templates(&root, &defaults))?;
                }
                Ok(())
            }
            EngineCommand::PopulateIntendedFor => {
                let opts = self
                    .config
                    .heuristic
                    .as_deref()
                    .map(load_heuristic)
                    .transpose()?
                    .and_then(|heuristic| heuristic.intended_for())
                    .unwrap_or(IntendedForOpts {
                        matching: vec![MatchingParameter::Shims],
                        criterion: Criterion::Closest,
                    });
                for session_path in self.intended_for_sessions()? {
                    populate_intended_for(&session_path, &opts)?;
                }
                Ok(())
            }
        }
    }

    fn intended_for_sessions(&self) -> Result<Vec<Utf8PathBuf>, ConvertError> {
        let mut subjects = Vec::new();
        if self.config.subjects.is_empty() {
            for entry in std::fs::read_dir(self.config.outdir.as_std_path())
                .map_err(|err| ConvertError::Filesystem(err.to_string()))?
                .flatten()
            {
                let path = Utf8PathBuf::from_path_buf(entry.path())
                    .map_err(|path| ConvertError::Filesystem(format!("non-utf8 path {path:?}")))?;
                if path.is_dir()
                    && path
                        .file_name()
                        .map(|name| name.starts_with("sub-"))
                        .unwrap_or(false)
                {
                    subjects.push(path);
                }
            }
        } else {
            for sid in &self.config.subjects {
                subjects.push(self.config.outdir.join(format!("sub-{sid}")));
            }
        }
        subjects.sort();

        let mut sessions = Vec::new();
        for subject_path in subjects {
            match &self.config.session {
                Some(session) => sessions.push(subject_path.join(format!("ses-{session}"))),
                None => {
                    let mut ses_dirs: Vec<Utf8PathBuf> = std::fs::read_dir(
                        subject_path.as_std_path(),
                    )
                    .map_err(|err| ConvertError::Filesystem(err.to_string()))?
                    .flatten()
                    .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
                    .filter(|path| {
                        path.is_dir()
                            && path
                                .file_name()
                                .map(|name| name.starts_with("ses-"))
                                .unwrap_or(false)
                    })
                    .collect();
                    ses_dirs.sort();
                    if ses_dirs.is_empty() {
                        sessions.push(subject_path);
                    } else {
                        sessions.extend(ses_dirs);
                    }
                }
            }
        }
        Ok(sessions)
    }
}
