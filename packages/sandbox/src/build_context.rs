// ABOUTME: In-memory tar build contexts for image builds
// ABOUTME: Generated Dockerfile plus named input files, with deterministic entry order and headers

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const DOCKERFILE_NAME: &str = "Dockerfile";
pub const DOCKERIGNORE_NAME: &str = ".dockerignore";

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// Builder for a build-context archive
///
/// Entries are keyed by archive-relative destination, so adding two sources
/// for the same destination keeps the last one. The Dockerfile always sits at
/// the archive root; the optional prefix applies to every other entry.
#[derive(Debug, Clone)]
pub struct BuildContext {
    dockerfile: String,
    prefix: Option<String>,
    entries: BTreeMap<String, Source>,
}

impl BuildContext {
    pub fn new(dockerfile: impl Into<String>) -> Self {
        Self {
            dockerfile: dockerfile.into(),
            prefix: None,
            entries: BTreeMap::new(),
        }
    }

    /// Nest every input file under `prefix` inside the archive
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let trimmed = prefix.trim_matches('/');
        self.prefix = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    /// Add a file from disk at `dest`
    pub fn file(mut self, source: impl Into<PathBuf>, dest: impl Into<String>) -> Self {
        self.entries
            .insert(dest.into(), Source::File(source.into()));
        self
    }

    /// Add in-memory contents at `dest`
    pub fn contents(mut self, dest: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(dest.into(), Source::Bytes(data.into()));
        self
    }

    /// Add every regular file under `root`, placed under `dest` in the archive
    pub fn directory(mut self, root: &Path, dest: &str) -> io::Result<Self> {
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", root.display()),
            ));
        }

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(io::Error::other)?;
            let relative = relative.to_string_lossy().replace('\\', "/");
            let name = if dest.trim_matches('/').is_empty() {
                relative
            } else {
                format!("{}/{}", dest.trim_matches('/'), relative)
            };
            self.entries
                .insert(name, Source::File(entry.path().to_path_buf()));
        }

        Ok(self)
    }

    /// Archive paths of the input files, in the order they are written
    pub fn paths(&self) -> Vec<String> {
        self.entries.keys().map(|dest| self.archive_path(dest)).collect()
    }

    pub fn dockerfile(&self) -> &str {
        &self.dockerfile
    }

    fn archive_path(&self, dest: &str) -> String {
        let dest = dest.trim_start_matches('/');
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, dest),
            None => dest.to_string(),
        }
    }

    /// Serialize to a tar archive
    ///
    /// Headers carry fixed timestamps and zeroed ownership, so the same inputs
    /// always give the same bytes. Files from disk keep their execute bit.
    pub fn into_archive(self) -> io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        append_entry(&mut builder, DOCKERFILE_NAME, self.dockerfile.as_bytes())?;

        for (dest, source) in &self.entries {
            let path = self.archive_path(dest);
            check_relative(&path)?;
            match source {
                Source::File(file) => append_file(&mut builder, &path, file)?,
                Source::Bytes(data) => append_entry(&mut builder, &path, data)?,
            }
        }

        builder.into_inner()
    }
}

/// Exclusion rules read from a `.dockerignore` file
///
/// Rules apply in order and the last match wins; `!` marks an exception. A
/// rule matching a directory excludes everything below it.
#[derive(Debug, Default)]
pub struct IgnoreRules {
    rules: Vec<(glob::Pattern, bool)>,
}

impl IgnoreRules {
    /// Rules from `<dir>/.dockerignore`; empty when the file is absent
    pub fn load(dir: &Path) -> io::Result<Self> {
        match fs::read_to_string(dir.join(DOCKERIGNORE_NAME)) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn parse(contents: &str) -> Self {
        let mut rules = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (exception, raw) = match line.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, line),
            };
            let cleaned = raw
                .trim_start_matches("./")
                .trim_start_matches('/')
                .trim_end_matches('/');
            if cleaned.is_empty() {
                continue;
            }

            match glob::Pattern::new(cleaned) {
                Ok(pattern) => rules.push((pattern, exception)),
                Err(e) => warn!("Ignoring invalid {} pattern {:?}: {}", DOCKERIGNORE_NAME, raw, e),
            }
        }
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether a context-relative, `/`-separated path is excluded
    pub fn is_ignored(&self, relative: &str) -> bool {
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let mut ignored = false;
        for (pattern, exception) in &self.rules {
            let hit = self_and_parents(relative).any(|p| pattern.matches_with(p, options));
            if hit {
                ignored = !exception;
            }
        }
        ignored
    }
}

/// `a/b/c`, then `a/b`, then `a`
fn self_and_parents(relative: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(relative), |path| {
        let path: &str = *path;
        path.rfind('/').map(|i| &path[..i])
    })
}

/// Archive an existing directory as a build context, Dockerfile included
///
/// Paths excluded by the directory's `.dockerignore` are left out, except the
/// Dockerfile and the ignore file themselves, which the daemon always needs.
pub fn archive_directory(dir: &Path) -> io::Result<Vec<u8>> {
    let dockerfile = dir.join(DOCKERFILE_NAME);
    if !dockerfile.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("No Dockerfile found in {}", dir.display()),
        ));
    }

    let ignore = IgnoreRules::load(dir)?;
    let mut builder = tar::Builder::new(Vec::new());
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .replace('\\', "/");

        let always_sent = relative == DOCKERFILE_NAME || relative == DOCKERIGNORE_NAME;
        if !always_sent && ignore.is_ignored(&relative) {
            debug!("Leaving {} out of the build context", relative);
            continue;
        }
        append_file(&mut builder, &relative, entry.path())?;
    }

    builder.into_inner()
}

fn append_entry(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    builder.append_data(&mut header, path, data)
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, file: &Path) -> io::Result<()> {
    let with_name = |e: io::Error| io::Error::new(e.kind(), format!("{}: {}", file.display(), e));
    let metadata = fs::metadata(file).map_err(with_name)?;
    let data = fs::read(file).map_err(with_name)?;

    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&metadata, tar::HeaderMode::Deterministic);
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder.append_data(&mut header, path, data.as_slice())
}

fn check_relative(path: &str) -> io::Result<()> {
    let escapes = Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid archive path: {:?}", path),
        ));
    }
    Ok(())
}

/// Two-line Dockerfile that layers a directory of the context onto a base image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerfileTemplate {
    pub base_image: String,
    pub source_dir: String,
    pub dest_dir: String,
}

impl DockerfileTemplate {
    pub fn new(
        base_image: impl Into<String>,
        source_dir: impl Into<String>,
        dest_dir: impl Into<String>,
    ) -> Self {
        Self {
            base_image: base_image.into(),
            source_dir: source_dir.into(),
            dest_dir: dest_dir.into(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "FROM {}\nADD {} {}\n",
            self.base_image, self.source_dir, self.dest_dir
        )
    }
}
