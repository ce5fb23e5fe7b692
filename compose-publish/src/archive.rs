//! Compose the App directory as a deterministic tar.gz
//!
//! Equal directory contents must yield byte-identical archives across runs
//! and machines. The walk is sorted and every timestamp is zeroed; the
//! pinned Compose document replaces whatever `docker-compose.yml` holds on
//! disk.

use crate::error::*;
use flate2::{write::GzEncoder, Compression};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::{
    fs,
    path::Path,
};
use walkdir::WalkDir;

pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub const IGNORE_FILE: &str = ".composeappignores";

/// Exclusion rules loaded from `.composeappignores`
///
/// Follows the dockerignore syntax: one pattern per line, blank lines and
/// `#` comments skipped. A matched directory excludes its whole subtree,
/// and the ignore file never ships with the archive.
pub struct IgnoreRules {
    globs: GlobSet,
}

impl IgnoreRules {
    pub fn load(app_dir: &Path) -> Result<Self> {
        let path = app_dir.join(IGNORE_FILE);
        let mut patterns = Vec::new();
        if path.is_file() {
            let contents = fs::read_to_string(&path)?;
            patterns = contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect();
            patterns.push(IGNORE_FILE.to_string());
        }
        Self::from_patterns(&patterns)
    }

    pub fn from_patterns(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.trim_end_matches('/');
            builder.add(Glob::new(pattern)?);
            builder.add(Glob::new(&format!("{}/**", pattern))?);
        }
        Ok(Self {
            globs: builder.build()?,
        })
    }

    pub fn is_excluded(&self, rel: &Path) -> bool {
        self.globs.is_match(rel)
    }
}

/// Pack the App directory, substituting the pinned Compose document
///
/// Only regular files and symlinks are encoded; directories are traversed
/// but carry no entry of their own. The gzip stream is fully flushed and
/// closed before the bytes are returned.
pub fn pack_app_dir(app_dir: &Path, compose_content: &[u8]) -> Result<Vec<u8>> {
    let ignores = IgnoreRules::load(app_dir)?;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut compose_found = false;

    for entry in WalkDir::new(app_dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(app_dir)
            .expect("walkdir yields paths under its root");
        if rel.as_os_str().is_empty() || ignores.is_excluded(rel) {
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        } else if file_type.is_file() {
            let metadata = entry.metadata()?;
            if rel == Path::new(COMPOSE_FILE) {
                compose_found = true;
                let mut header = file_header(&metadata, compose_content.len() as u64);
                builder.append_data(&mut header, rel, compose_content)?;
            } else {
                let contents = fs::read(path)?;
                let mut header = file_header(&metadata, contents.len() as u64);
                builder.append_data(&mut header, rel, contents.as_slice())?;
            }
        } else if file_type.is_symlink() {
            let target = fs::read_link(path)?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            zero_times(&mut header);
            header.set_cksum();
            builder.append_link(&mut header, rel, &target)?;
        } else {
            return Err(Error::UnsupportedFileKind(path.to_path_buf()));
        }
    }

    if !compose_found {
        return Err(Error::ComposeExcluded);
    }

    Ok(builder.into_inner()?.finish()?)
}

fn file_header(metadata: &fs::Metadata, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(file_mode(metadata));
    zero_times(&mut header);
    header.set_cksum();
    header
}

/// Reset every timestamp field so equal contents hash equal
fn zero_times(header: &mut tar::Header) {
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    if let Some(gnu) = header.as_gnu_mut() {
        gnu.set_atime(0);
        gnu.set_ctime(0);
    }
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}
