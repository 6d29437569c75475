use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::api::{Compression, LogLevel, StageKind};
use crate::pipeline::{PipelineCtx, SharedRx, WorkItem, fail_job, forward, next_item};
use crate::state::StageStatus;
use crate::tarball::ArchiveError;

/// Common absolute parent of all job directories; batch archives land here.
pub(crate) fn common_parent(dirs: &[PathBuf]) -> PathBuf {
    let mut iter = dirs.iter();
    let Some(first) = iter.next() else {
        return PathBuf::from("/");
    };

    let mut prefix: Vec<Component<'_>> = first
        .parent()
        .unwrap_or(first.as_path())
        .components()
        .collect();
    for dir in iter {
        let comps: Vec<Component<'_>> = dir
            .parent()
            .unwrap_or(dir.as_path())
            .components()
            .collect();
        let shared = prefix
            .iter()
            .zip(comps.iter())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(shared);
    }

    if prefix.is_empty() {
        PathBuf::from("/")
    } else {
        prefix.iter().collect()
    }
}

/// Deterministic archive location: the cleaned source path with separators
/// replaced by underscores, suffixed per compression, in the batch base dir.
pub(crate) fn archive_output_path(
    base: &Path,
    directory: &Path,
    compression: Compression,
) -> PathBuf {
    let mut name = String::new();
    for comp in directory.components() {
        if let Component::Normal(part) = comp {
            if !name.is_empty() {
                name.push('_');
            }
            name.push_str(&part.to_string_lossy());
        }
    }
    if name.is_empty() {
        name.push_str("archive");
    }
    name.push_str(compression.suffix());
    base.join(name)
}

/// Join `sub` onto the run directory and verify the result stays inside it.
pub(crate) fn resolve_subpath(source: &Path, sub: &str) -> Result<PathBuf, ArchiveError> {
    let joined = source.join(sub);
    let mut normalized = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(ArchiveError::SubpathEscape(sub.to_string()));
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    if !normalized.starts_with(source) {
        return Err(ArchiveError::SubpathEscape(sub.to_string()));
    }
    Ok(normalized)
}

pub(crate) fn file_is_nonempty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

pub(crate) async fn run_archive_worker(
    ctx: Arc<PipelineCtx>,
    rx: SharedRx,
    upload_tx: mpsc::Sender<WorkItem>,
) {
    while let Some(item) = next_item(&rx, &ctx.cancel).await {
        ctx.reporter.gauges.enter(StageKind::Archive);
        process_item(&ctx, item, &upload_tx).await;
        ctx.reporter.gauges.leave(StageKind::Archive);
    }
    // Dropping upload_tx here participates in closing the upload queue once
    // the feeder and every archive worker are done.
}

async fn process_item(ctx: &PipelineCtx, item: WorkItem, upload_tx: &mpsc::Sender<WorkItem>) {
    let Some(mut row) = ctx.store.get(item.index) else {
        return;
    };

    // Resume: a prior run already produced this archive.
    if row.tar_status == StageStatus::Success
        && row.tar_path.as_deref().is_some_and(file_is_nonempty)
    {
        forward(upload_tx, item, &ctx.cancel).await;
        return;
    }

    row.tar_status = StageStatus::InProgress;
    row.error_message = None;
    ctx.store.update(row.clone()).await;
    ctx.reporter.state_changed(&row, StageKind::Archive, None);

    let spec = &item.spec;
    let source = match &spec.tar_subpath {
        Some(sub) => match resolve_subpath(&spec.directory, sub) {
            Ok(path) => path,
            Err(err) => {
                fail_job(ctx, row, StageKind::Archive, &err.to_string()).await;
                return;
            }
        },
        None => spec.directory.clone(),
    };

    if !source.is_dir() {
        let err = if spec.tar_subpath.is_some() {
            ArchiveError::SubpathMissing(source.clone())
        } else {
            ArchiveError::SourceMissing(source.clone())
        };
        fail_job(ctx, row, StageKind::Archive, &err.to_string()).await;
        return;
    }

    let output = archive_output_path(&ctx.archive_base, &spec.directory, ctx.cfg.compression);

    let archiver = ctx.archiver.clone();
    let cfg = ctx.cfg.clone();
    let source_for_task = source.clone();
    let output_for_task = output.clone();
    let res = tokio::task::spawn_blocking(move || {
        archiver.create_archive(
            &source_for_task,
            &output_for_task,
            cfg.absolute_paths,
            &cfg.include_patterns,
            &cfg.exclude_patterns,
            cfg.flatten,
            cfg.compression,
        )
    })
    .await;

    match res {
        Ok(Ok(())) => {
            row.tar_status = StageStatus::Success;
            row.tar_path = Some(output);
            ctx.store.update(row.clone()).await;
            ctx.reporter.state_changed(&row, StageKind::Archive, None);
            ctx.reporter.log(
                LogLevel::Info,
                "archive created",
                StageKind::Archive,
                &row.job_name,
            );
            forward(upload_tx, item, &ctx.cancel).await;
        }
        Ok(Err(err)) => {
            fail_job(ctx, row, StageKind::Archive, &err.to_string()).await;
        }
        Err(err) => {
            fail_job(
                ctx,
                row,
                StageKind::Archive,
                &format!("archive task join error: {err}"),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_names_are_deterministic() {
        let base = Path::new("/work");
        let a = archive_output_path(base, Path::new("/work/Run_1"), Compression::Gzip);
        let b = archive_output_path(base, Path::new("/work/Run_1"), Compression::Gzip);
        assert_eq!(a, b);
        assert_eq!(a, PathBuf::from("/work/work_Run_1.tar.gz"));

        let plain = archive_output_path(base, Path::new("/work/Run_1"), Compression::None);
        assert_eq!(plain, PathBuf::from("/work/work_Run_1.tar"));
    }

    #[test]
    fn common_parent_of_sibling_runs() {
        let dirs = vec![
            PathBuf::from("/work/batch/Run_1"),
            PathBuf::from("/work/batch/Run_2"),
        ];
        assert_eq!(common_parent(&dirs), PathBuf::from("/work/batch"));
    }

    #[test]
    fn common_parent_of_disjoint_trees_walks_up() {
        let dirs = vec![
            PathBuf::from("/work/a/Run_1"),
            PathBuf::from("/data/b/Run_2"),
        ];
        assert_eq!(common_parent(&dirs), PathBuf::from("/"));
    }

    #[test]
    fn common_parent_of_single_run_is_its_parent() {
        let dirs = vec![PathBuf::from("/work/Run_1")];
        assert_eq!(common_parent(&dirs), PathBuf::from("/work"));
    }

    #[test]
    fn subpath_inside_the_run_directory_resolves() {
        let got = resolve_subpath(Path::new("/work/Run_1"), "case/mesh").unwrap();
        assert_eq!(got, PathBuf::from("/work/Run_1/case/mesh"));
    }

    #[test]
    fn parent_subpath_is_an_escape() {
        let err = resolve_subpath(Path::new("/work/Run_1"), "..").unwrap_err();
        assert!(matches!(err, ArchiveError::SubpathEscape(_)));
    }

    #[test]
    fn sneaky_relative_escape_is_caught() {
        let err = resolve_subpath(Path::new("/work/Run_1"), "case/../../Run_2").unwrap_err();
        assert!(matches!(err, ArchiveError::SubpathEscape(_)));
    }
}
