//! Package the finished snapshot for hand-off

use std::{
    collections::HashMap,
    fmt::Debug,
    fs::File,
    io,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};
use zip::{CompressionMethod, ZipWriter, result::ZipError, write::SimpleFileOptions};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write archive: {0}")]
    Zip(#[from] ZipError),

    #[error("'{}' has no file name to store in the archive", path.display())]
    MissingFileName { path: PathBuf },

    #[error(
        "'{}' and '{}' would both be stored as '{name}' in the archive",
        first.display(),
        second.display()
    )]
    DuplicateName {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

/// Something that bundles the files of a finished snapshot into a single artifact
pub trait ArchiveSink: Debug + Send + Sync + 'static {
    /// Bundle `paths` and return the location of the produced artifact
    fn archive(&self, paths: &[PathBuf]) -> Result<PathBuf, ArchiveError>;
}

/// Writes a deflate-compressed zip file, replacing any existing file at the same path
#[derive(Debug, Clone)]
pub struct ZipArchiver {
    output: PathBuf,
}

impl ZipArchiver {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

impl ArchiveSink for ZipArchiver {
    fn archive(&self, paths: &[PathBuf]) -> Result<PathBuf, ArchiveError> {
        let names = entry_names(paths)?;
        remove_if_exists(&self.output)?;
        let file = File::create(&self.output).map_err(|source| ArchiveError::Io {
            path: self.output.clone(),
            source,
        })?;

        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (path, name) in paths.iter().zip(names) {
            let io_err = |source| ArchiveError::Io {
                path: path.clone(),
                source,
            };

            zip.start_file(name, options)?;
            let mut input = File::open(path).map_err(io_err)?;
            let bytes = io::copy(&mut input, &mut zip).map_err(io_err)?;
            debug!(file = name, bytes, "added file to archive");
        }
        zip.finish()?;

        info!(path = %self.output.display(), files = paths.len(), "archive written");
        Ok(self.output.clone())
    }
}

/// The archive entry name of every path, its file name
///
/// Fails if a path has no file name or two paths share one, before anything is written.
pub fn entry_names(paths: &[PathBuf]) -> Result<Vec<&str>, ArchiveError> {
    let mut seen: HashMap<&str, &PathBuf> = HashMap::with_capacity(paths.len());
    let mut names = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArchiveError::MissingFileName { path: path.clone() })?;
        if let Some(first) = seen.insert(name, path) {
            return Err(ArchiveError::DuplicateName {
                name: name.to_owned(),
                first: first.clone(),
                second: path.clone(),
            });
        }
        names.push(name);
    }
    Ok(names)
}

/// Best-effort removal of intermediate files once they have been archived
pub fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed intermediate file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<(), ArchiveError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
