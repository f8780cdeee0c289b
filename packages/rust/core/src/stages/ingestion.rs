//! Ingestion: fetch the source archive and unpack it into the dataset root.
//!
//! The download is streamed to a `.part` file and renamed into place;
//! extraction happens in a hidden staging directory which is renamed onto
//! the unpacked-data directory only once every entry has been written.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use tracing::{debug, info, instrument, warn};
use url::Url;

use imgflow_shared::{PipelineError, Result, StageName};

use crate::schema::{IngestionConfig, dir_is_non_empty};
use crate::stages::{StageContext, StageOutcome, StageRunner};

const USER_AGENT: &str = concat!("imgflow/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Copies a remote or local source archive to a local path.
pub trait Fetcher: Send + Sync {
    /// Fetch `source` into `dest`, returning the number of bytes written.
    /// Failures are [`PipelineError::Download`].
    fn fetch(&self, source: &Url, dest: &Path) -> Result<u64>;
}

/// Default fetcher: `http(s)://` through a blocking client, `file://` by copy.
pub struct SourceFetcher {
    client: reqwest::blocking::Client,
}

impl SourceFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| PipelineError::Download(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn fetch_http(&self, source: &Url, part: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(source.as_str())
            .send()
            .map_err(|e| PipelineError::Download(format!("{source}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Download(format!("{source}: HTTP {status}")));
        }

        let mut file = File::create(part).map_err(|e| PipelineError::io(part, e))?;
        response
            .copy_to(&mut file)
            .map_err(|e| PipelineError::Download(format!("{source}: {e}")))
    }

    fn fetch_file(source: &Url, part: &Path) -> Result<u64> {
        let path = source
            .to_file_path()
            .map_err(|()| PipelineError::Download(format!("{source}: not a local file path")))?;
        std::fs::copy(&path, part)
            .map_err(|e| PipelineError::Download(format!("{}: {e}", path.display())))
    }
}

impl Fetcher for SourceFetcher {
    #[instrument(skip_all, fields(source = %source))]
    fn fetch(&self, source: &Url, dest: &Path) -> Result<u64> {
        let part = sibling(dest, "part");

        let result = match source.scheme() {
            "http" | "https" => self.fetch_http(source, &part),
            "file" => Self::fetch_file(source, &part),
            other => Err(PipelineError::Download(format!(
                "{source}: unsupported scheme `{other}`"
            ))),
        };

        match result {
            Ok(bytes) => {
                std::fs::rename(&part, dest).map_err(|e| PipelineError::io(dest, e))?;
                info!(bytes, dest = %dest.display(), "archive downloaded");
                Ok(bytes)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&part);
                Err(e)
            }
        }
    }
}

/// `dir/name` → `dir/.name.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".into());
    path.with_file_name(format!(".{name}.{suffix}"))
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    TarGz,
    Tar,
}

fn detect_format(archive: &Path) -> Result<ArchiveFormat> {
    let mut magic = [0u8; 4];
    let mut file = File::open(archive).map_err(|e| PipelineError::io(archive, e))?;
    let n = file.read(&mut magic).map_err(|e| PipelineError::io(archive, e))?;

    match &magic[..n] {
        [0x1f, 0x8b, ..] => Ok(ArchiveFormat::TarGz),
        [b'P', b'K', ..] => Err(PipelineError::Extraction(format!(
            "{}: zip archives are not supported, repackage as .tar.gz",
            archive.display()
        ))),
        [] => Err(PipelineError::Extraction(format!(
            "{}: archive is empty",
            archive.display()
        ))),
        _ => Ok(ArchiveFormat::Tar),
    }
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Unpack a tar or tar.gz archive into `target`.
///
/// The archive is first unpacked into a staging directory next to `target`;
/// on success any existing `target` is replaced by it. Returns the number of
/// regular files extracted.
#[instrument(skip_all, fields(archive = %archive.display(), target = %target.display()))]
pub fn extract_archive(archive: &Path, target: &Path) -> Result<usize> {
    let format = detect_format(archive)?;
    let staging = sibling(target, "partial");

    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(|e| PipelineError::io(&staging, e))?;
    }
    std::fs::create_dir_all(&staging).map_err(|e| PipelineError::io(&staging, e))?;

    match unpack_into(archive, format, &staging) {
        Ok(files) => {
            if target.exists() {
                std::fs::remove_dir_all(target).map_err(|e| PipelineError::io(target, e))?;
            }
            std::fs::rename(&staging, target).map_err(|e| PipelineError::io(target, e))?;
            info!(files, ?format, "archive extracted");
            Ok(files)
        }
        Err(e) => {
            let _ = std::fs::remove_dir_all(&staging);
            Err(e)
        }
    }
}

fn unpack_into(archive_path: &Path, format: ArchiveFormat, dest: &Path) -> Result<usize> {
    let corrupt =
        |e: std::io::Error| PipelineError::Extraction(format!("{}: {e}", archive_path.display()));

    let file = File::open(archive_path).map_err(|e| PipelineError::io(archive_path, e))?;
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(BufReader::new(file))),
        ArchiveFormat::Tar => Box::new(BufReader::new(file)),
    };

    let mut archive = tar::Archive::new(reader);
    let mut files = 0usize;

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let path = entry.path().map_err(corrupt)?.into_owned();

        if !is_contained(&path) {
            warn!(entry = %path.display(), "skipping archive entry outside the target directory");
            continue;
        }

        let is_file = entry.header().entry_type().is_file();
        if !entry.unpack_in(dest).map_err(corrupt)? {
            warn!(entry = %path.display(), "archive entry was not unpacked");
            continue;
        }
        if is_file {
            files += 1;
        }
    }

    if files == 0 {
        return Err(PipelineError::Extraction(format!(
            "{}: archive contains no files",
            archive_path.display()
        )));
    }
    debug!(files, "entries unpacked");
    Ok(files)
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Downloads and unpacks the dataset unless it is already in place.
pub struct IngestionRunner {
    config: IngestionConfig,
    fetcher: Arc<dyn Fetcher>,
}

impl IngestionRunner {
    pub fn new(config: IngestionConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { config, fetcher }
    }
}

impl StageRunner for IngestionRunner {
    fn stage(&self) -> StageName {
        StageName::Ingestion
    }

    #[instrument(skip_all, fields(stage = "ingestion", source = %self.config.source_url))]
    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let unzip_dir = &self.config.unzip_dir;
        let interrupted = ctx.previous.is_some_and(|r| r.status.is_interrupted());

        if dir_is_non_empty(unzip_dir) {
            if !interrupted {
                info!(dir = %unzip_dir.display(), "dataset already present, skipping download");
                return Ok(StageOutcome::Skipped {
                    reason: format!("{} is already populated", unzip_dir.display()),
                });
            }
            warn!(
                dir = %unzip_dir.display(),
                "previous ingestion did not finish, discarding partial dataset"
            );
            std::fs::remove_dir_all(unzip_dir).map_err(|e| PipelineError::io(unzip_dir, e))?;
        }

        self.fetcher
            .fetch(&self.config.source_url, &self.config.local_data_file)?;
        extract_archive(&self.config.local_data_file, unzip_dir)?;
        Ok(StageOutcome::Completed)
    }
}
