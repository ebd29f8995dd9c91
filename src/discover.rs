use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use regex::Regex;
use tempfile::TempDir;
use zip::ZipArchive;

use crate::error::ConvertError;

const VCS_DIRS: [&str; 5] = [".git", ".gitattributes", ".svn", ".bzr", ".hg"];
const UNPACK_SUFFIXES: [&str; 4] = [".tar", ".tar.gz", ".tgz", ".zip"];

pub fn is_archive(path: &Utf8Path) -> bool {
    let name = path.file_name().unwrap_or_default();
    UNPACK_SUFFIXES.iter().any(|suf| name.ends_with(suf))
}

/// Recursively list files under `topdir`, skipping VCS bookkeeping.
pub fn find_files(topdir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, ConvertError> {
    let mut out = Vec::new();
    let mut stack = vec![topdir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| ConvertError::Filesystem(format!("read dir {dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| ConvertError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|path| ConvertError::Filesystem(format!("non-utf8 path {path:?}")))?;
            let name = path.file_name().unwrap_or_default();
            if VCS_DIRS.contains(&name) || name == ".datalad" {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Expand a path pattern with `*` and `?` wildcards into matching paths.
pub fn glob_paths(pattern: &str) -> Result<Vec<Utf8PathBuf>, ConvertError> {
    let wildcard = match pattern.find(['*', '?']) {
        Some(idx) => idx,
        None => {
            let path = Utf8PathBuf::from(pattern);
            return Ok(if path.as_std_path().exists() {
                vec![path]
            } else {
                Vec::new()
            });
        }
    };
    let root = match pattern[..wildcard].rfind('/') {
        Some(idx) if idx > 0 => Utf8PathBuf::from(&pattern[..idx]),
        Some(_) => Utf8PathBuf::from("/"),
        None => Utf8PathBuf::from("."),
    };
    if !root.as_std_path().is_dir() {
        return Ok(Vec::new());
    }
    let matcher = glob_regex(pattern)?;
    let mut matches = Vec::new();
    let mut stack = vec![root];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| ConvertError::Filesystem(format!("read dir {dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| ConvertError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|path| ConvertError::Filesystem(format!("non-utf8 path {path:?}")))?;
            if matcher.is_match(path.as_str()) {
                matches.push(path.clone());
            }
            if path.is_dir() {
                stack.push(path);
            }
        }
    }
    matches.sort();
    Ok(matches)
}

fn glob_regex(pattern: &str) -> Result<Regex, ConvertError> {
    let mut expr = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push_str("[^/]"),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|err| ConvertError::Usage(format!("bad path pattern: {err}")))
}

/// Candidate files for one (possibly archive-derived) session.
#[derive(Debug)]
pub struct ExtractedSession {
    pub session: Option<String>,
    pub files: Vec<Utf8PathBuf>,
}

/// Discovery owns the scratch directories archives get unpacked into; the
/// extracted paths stay valid for as long as the value lives.
#[derive(Debug, Default)]
pub struct Discovery {
    scratch: Vec<TempDir>,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand `{subject}`/`{session}` template matches for one subject and
    /// unpack whatever they point at.
    pub fn from_template(
        &mut self,
        template: &str,
        subject: &str,
        session: Option<&str>,
    ) -> Result<Vec<ExtractedSession>, ConvertError> {
        if !template.contains("{subject}") {
            return Err(ConvertError::Usage(format!(
                "dicom dir template must have {{subject}} as a placeholder, got {template:?}"
            )));
        }
        let expanded = template
            .replace("{subject}", subject)
            .replace("{session}", session.unwrap_or(""));
        let mut inputs = Vec::new();
        for path in glob_paths(&expanded)? {
            if path.is_dir() {
                inputs.extend(find_files(&path)?);
            } else {
                inputs.push(path);
            }
        }
        self.extract(inputs)
    }

    /// Flatten explicit files/directories into candidates, unpacking archives.
    pub fn from_files(&mut self, paths: &[Utf8PathBuf]) -> Result<Vec<Utf8PathBuf>, ConvertError> {
        let mut inputs = Vec::new();
        for path in paths {
            if path.is_dir() {
                inputs.extend(find_files(path)?);
            } else {
                inputs.push(path.clone());
            }
        }
        let mut files = Vec::new();
        for extracted in self.extract(inputs)? {
            files.extend(extracted.files);
        }
        Ok(files)
    }

    /// Group inputs into sessions: plain files share the unnamed session;
    /// each archive becomes its own numbered session unless it is the only
    /// one, in which case its content joins the unnamed session.
    fn extract(&mut self, inputs: Vec<Utf8PathBuf>) -> Result<Vec<ExtractedSession>, ConvertError> {
        let mut inputs = inputs;
        inputs.sort();

        let mut plain = Vec::new();
        let mut archived: Vec<Vec<Utf8PathBuf>> = Vec::new();
        for input in inputs {
            if !is_archive(&input) {
                plain.push(input);
                continue;
            }
            match self.unpack_archive(&input) {
                Ok(content) => archived.push(content),
                Err(err) => {
                    tracing::error!("failed to unpack {}: {}", input, err);
                }
            }
        }

        let mut sessions = Vec::new();
        if archived.len() == 1 {
            plain.extend(archived.pop().expect("single archive checked"));
        }
        if !plain.is_empty() || archived.is_empty() {
            sessions.push(ExtractedSession {
                session: None,
                files: plain,
            });
        }
        for (idx, files) in archived.into_iter().enumerate() {
            sessions.push(ExtractedSession {
                session: Some(idx.to_string()),
                files,
            });
        }
        Ok(sessions)
    }

    fn unpack_archive(&mut self, archive: &Utf8Path) -> Result<Vec<Utf8PathBuf>, ConvertError> {
        let tmpdir = tempfile::Builder::new()
            .prefix("heudiconvDCM")
            .tempdir()
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        let target = Utf8PathBuf::from_path_buf(tmpdir.path().to_path_buf())
            .map_err(|_| ConvertError::Filesystem("invalid temp dir".to_string()))?;

        let name = archive.file_name().unwrap_or_default();
        if name.ends_with(".zip") {
            extract_zip(archive, &target)?;
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            let file = fs::File::open(archive.as_std_path())
                .map_err(|err| ConvertError::Filesystem(format!("open {archive}: {err}")))?;
            extract_tar(tar::Archive::new(GzDecoder::new(file)), &target)?;
        } else if name.ends_with(".tar") {
            let file = fs::File::open(archive.as_std_path())
                .map_err(|err| ConvertError::Filesystem(format!("open {archive}: {err}")))?;
            extract_tar(tar::Archive::new(file), &target)?;
        } else {
            return Err(ConvertError::Filesystem(format!(
                "unrecognized archive format: {archive}"
            )));
        }

        let files = find_files(&target)?;
        self.scratch.push(tmpdir);
        Ok(files)
    }
}

fn extract_zip(zip_path: &Utf8Path, target_dir: &Utf8Path) -> Result<(), ConvertError> {
    let file = fs::File::open(zip_path.as_std_path())
        .map_err(|err| ConvertError::Filesystem(format!("open zip {zip_path}: {err}")))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| ConvertError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.as_std_path().join(path),
            None => {
                return Err(ConvertError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

fn extract_tar<R: io::Read>(
    mut archive: tar::Archive<R>,
    target_dir: &Utf8Path,
) -> Result<(), ConvertError> {
    archive
        .unpack(target_dir.as_std_path())
        .map_err(|err| ConvertError::Filesystem(format!("unpack tar: {err}")))
}
