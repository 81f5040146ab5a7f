//! Startup sweep of every allowed root.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::authorizer::PathAuthorizer;
use crate::recorder::EpisodeRecorder;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub files: usize,
    pub directories: usize,
    pub failures: usize,
    pub skipped_roots: usize,
}

/// Record one episode per file and directory below each root.
///
/// Roots themselves are not recorded. A root that cannot be read is logged
/// and skipped; per-entity failures are logged and counted.
pub fn scan(roots: &[PathBuf], authorizer: &PathAuthorizer, recorder: &EpisodeRecorder) -> ScanReport {
    let mut report = ScanReport::default();
    for root in roots {
        if let Err(err) = std::fs::read_dir(root) {
            warn!(root = %root.display(), error = %err, "skipping inaccessible root");
            report.skipped_roots += 1;
            continue;
        }
        scan_root(root, authorizer, recorder, &mut report);
    }
    info!(
        files = report.files,
        directories = report.directories,
        failures = report.failures,
        skipped_roots = report.skipped_roots,
        "initial scan finished"
    );
    report
}

fn scan_root(root: &Path, authorizer: &PathAuthorizer, recorder: &EpisodeRecorder, report: &mut ScanReport) {
    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "walk error");
                report.failures += 1;
                continue;
            }
        };
        let path = entry.path();
        let parent = path.parent().unwrap_or(root);

        let file_type = entry.file_type();
        let (is_file, is_dir) = if file_type.is_symlink() {
            // Links are recorded by target type, and only if the target stays inside the allow-list.
            if !authorizer.is_allowed(path) {
                debug!(path = %path.display(), "symlink target outside allowed roots");
                continue;
            }
            match std::fs::metadata(path) {
                Ok(meta) => (meta.is_file(), meta.is_dir()),
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "dangling symlink");
                    continue;
                }
            }
        } else {
            (file_type.is_file(), file_type.is_dir())
        };

        if is_file {
            match EpisodeRecorder::log_outcome(recorder.record_file(path, parent)) {
                Some(_) => report.files += 1,
                None => report.failures += 1,
            }
        } else if is_dir {
            match EpisodeRecorder::log_outcome(recorder.record_directory(path, Some(parent))) {
                Some(_) => report.directories += 1,
                None => report.failures += 1,
            }
        }
    }
}
