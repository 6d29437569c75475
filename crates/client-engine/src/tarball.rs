use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;
use glob::Pattern;

use crate::api::Compression;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ArchiveError {
    #[error("run directory missing: {0}")]
    SourceMissing(PathBuf),
    #[error("tar subpath escapes the run directory: {0}")]
    SubpathEscape(String),
    #[error("tar subpath not found: {0}")]
    SubpathMissing(PathBuf),
    #[error("duplicate filename in flattened archive: {0}")]
    DuplicateInFlatten(String),
    #[error("invalid archive pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
    #[error("archive write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// File-system-in, file-system-out archive producer. The pipeline supplies
/// all policy inputs; implementations own the format.
pub(crate) trait Archiver: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn create_archive(
        &self,
        source_dir: &Path,
        output_path: &Path,
        use_absolute_paths: bool,
        include_patterns: &[String],
        exclude_patterns: &[String],
        flatten: bool,
        compression: Compression,
    ) -> Result<(), ArchiveError>;
}

pub(crate) struct TarArchiver;

impl Archiver for TarArchiver {
    fn create_archive(
        &self,
        source_dir: &Path,
        output_path: &Path,
        use_absolute_paths: bool,
        include_patterns: &[String],
        exclude_patterns: &[String],
        flatten: bool,
        compression: Compression,
    ) -> Result<(), ArchiveError> {
        if !source_dir.is_dir() {
            return Err(ArchiveError::SourceMissing(source_dir.to_path_buf()));
        }

        let include = compile_patterns(include_patterns)?;
        let exclude = compile_patterns(exclude_patterns)?;

        let mut files = Vec::new();
        collect_files(source_dir, &mut files)?;

        let res = write_archive(
            source_dir,
            output_path,
            use_absolute_paths,
            &include,
            &exclude,
            flatten,
            compression,
            &files,
        );
        if res.is_err() {
            let _ = std::fs::remove_file(output_path);
        }
        res
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>, ArchiveError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|source| ArchiveError::Pattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

/// Recursive walk, sorted per directory so archive entry order is stable.
fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ArchiveError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let ty = entry.file_type()?;
        if ty.is_symlink() {
            continue;
        }
        let path = entry.path();
        if ty.is_dir() {
            collect_files(&path, out)?;
        } else if ty.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Include-only overrides exclude when both are supplied.
fn selected(rel: &Path, include: &[Pattern], exclude: &[Pattern]) -> bool {
    if !include.is_empty() {
        return include.iter().any(|p| p.matches_path(rel));
    }
    !exclude.iter().any(|p| p.matches_path(rel))
}

#[allow(clippy::too_many_arguments)]
fn write_archive(
    source_dir: &Path,
    output_path: &Path,
    use_absolute_paths: bool,
    include: &[Pattern],
    exclude: &[Pattern],
    flatten: bool,
    compression: Compression,
    files: &[PathBuf],
) -> Result<(), ArchiveError> {
    let out = BufWriter::new(File::create(output_path)?);
    match compression {
        Compression::Gzip => {
            let mut builder = tar::Builder::new(GzEncoder::new(out, GzLevel::default()));
            append_entries(
                &mut builder,
                source_dir,
                use_absolute_paths,
                include,
                exclude,
                flatten,
                files,
            )?;
            let gz = builder.into_inner()?;
            let mut out = gz.finish()?;
            out.flush()?;
        }
        Compression::None => {
            let mut builder = tar::Builder::new(out);
            append_entries(
                &mut builder,
                source_dir,
                use_absolute_paths,
                include,
                exclude,
                flatten,
                files,
            )?;
            let mut out = builder.into_inner()?;
            out.flush()?;
        }
    }
    Ok(())
}

fn append_entries<W: Write>(
    builder: &mut tar::Builder<W>,
    source_dir: &Path,
    use_absolute_paths: bool,
    include: &[Pattern],
    exclude: &[Pattern],
    flatten: bool,
    files: &[PathBuf],
) -> Result<(), ArchiveError> {
    let mut seen_names: HashSet<std::ffi::OsString> = HashSet::new();

    for path in files {
        let rel = path.strip_prefix(source_dir).unwrap_or(path);
        if !selected(rel, include, exclude) {
            continue;
        }

        let entry_name: PathBuf = if flatten {
            let name = path
                .file_name()
                .ok_or_else(|| ArchiveError::SourceMissing(path.clone()))?;
            if !seen_names.insert(name.to_os_string()) {
                return Err(ArchiveError::DuplicateInFlatten(
                    name.to_string_lossy().into_owned(),
                ));
            }
            PathBuf::from(name)
        } else if use_absolute_paths {
            // Tar entry names carry no leading separator.
            path.components()
                .filter(|c| {
                    !matches!(
                        c,
                        std::path::Component::RootDir | std::path::Component::Prefix(_)
                    )
                })
                .collect()
        } else {
            rel.to_path_buf()
        };

        builder.append_path_with_name(path, entry_name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tree(root: &Path) {
        std::fs::create_dir_all(root.join("a")).unwrap();
        std::fs::create_dir_all(root.join("b")).unwrap();
        std::fs::write(root.join("a/x.dat"), b"aaa").unwrap();
        std::fs::write(root.join("b/x.dat"), b"bbb").unwrap();
        std::fs::write(root.join("top.txt"), b"top").unwrap();
    }

    fn entry_names(path: &Path, gz: bool) -> Vec<String> {
        let file = File::open(path).unwrap();
        let names = |mut ar: tar::Archive<Box<dyn std::io::Read>>| {
            ar.entries()
                .unwrap()
                .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
        };
        if gz {
            names(tar::Archive::new(Box::new(flate2::read::GzDecoder::new(
                file,
            ))))
        } else {
            names(tar::Archive::new(Box::new(file)))
        }
    }

    #[test]
    fn gzip_archive_contains_relative_entries() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("run");
        make_tree(&src);
        let out = dir.path().join("run.tar.gz");

        TarArchiver
            .create_archive(&src, &out, false, &[], &[], false, Compression::Gzip)
            .unwrap();

        let raw = std::fs::read(&out).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);
        let names = entry_names(&out, true);
        assert_eq!(names, vec!["a/x.dat", "b/x.dat", "top.txt"]);
    }

    #[test]
    fn flatten_detects_duplicate_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("run");
        make_tree(&src);
        let out = dir.path().join("run.tar");

        let err = TarArchiver
            .create_archive(&src, &out, false, &[], &[], true, Compression::None)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::DuplicateInFlatten(name) if name == "x.dat"));
        assert!(!out.exists());
    }

    #[test]
    fn include_patterns_override_exclude_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("run");
        make_tree(&src);
        let out = dir.path().join("run.tar");

        TarArchiver
            .create_archive(
                &src,
                &out,
                false,
                &["*.txt".to_string()],
                &["*.txt".to_string()],
                false,
                Compression::None,
            )
            .unwrap();

        let names = entry_names(&out, false);
        assert_eq!(names, vec!["top.txt"]);
    }

    #[test]
    fn exclude_patterns_drop_matches() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("run");
        make_tree(&src);
        let out = dir.path().join("run.tar");

        TarArchiver
            .create_archive(
                &src,
                &out,
                false,
                &[],
                &["*.dat".to_string()],
                false,
                Compression::None,
            )
            .unwrap();

        let names = entry_names(&out, false);
        assert_eq!(names, vec!["top.txt"]);
    }

    #[test]
    fn missing_source_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("nope");
        let out = dir.path().join("run.tar");

        let err = TarArchiver
            .create_archive(&src, &out, false, &[], &[], false, Compression::None)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::SourceMissing(_)));
    }
}
