//! On-disk artifacts: run directories, evidence images, and the JSON export.

use crate::model::{AuditConfig, ControlResult, RunOutcome, RunPhase};
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;

const RESULTS_FILE: &str = "results.json";

/// Local wall-clock time, falling back to UTC when the offset can't be determined.
pub fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// `YYYYmmdd_HHMMSS`, the stamp used in every artifact name.
pub fn timestamp_slug(at: OffsetDateTime) -> String {
    at.format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))
    .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Create a fresh `audit_results_<stamp>` directory under `root`.
///
/// Two runs in the same second get `_1`, `_2`, ... suffixes instead of sharing a directory.
pub fn create_run_dir(root: &Path, at: OffsetDateTime) -> Result<PathBuf> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("create output root {}", root.display()))?;
    let base = format!("audit_results_{}", timestamp_slug(at));
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            base.clone()
        } else {
            format!("{base}_{attempt}")
        };
        let dir = root.join(name);
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => {
                return Err(e).with_context(|| format!("create run directory {}", dir.display()))
            }
        }
    }
}

/// Replace anything that is not safe in a file name.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "control".to_string()
    } else {
        cleaned
    }
}

pub fn evidence_path(dir: &Path, control_id: &str, at: OffsetDateTime) -> PathBuf {
    dir.join(format!(
        "screenshot_{}_{}.png",
        sanitize_component(control_id),
        timestamp_slug(at)
    ))
}

/// Write a screenshot without replacing an existing file.
///
/// Control ids that sanitize to the same name within one second get `_1`, `_2`, ...
/// before the extension. Returns the path actually written.
pub fn save_evidence(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "screenshot".into());
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".into());
    let mut attempt = 0u32;
    loop {
        let candidate = if attempt == 0 {
            path.to_path_buf()
        } else {
            path.with_file_name(format!("{stem}_{attempt}.{ext}"))
        };
        let opened = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate);
        match opened {
            Ok(mut file) => {
                file.write_all(bytes)
                    .with_context(|| format!("write evidence {}", candidate.display()))?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => {
                return Err(e).with_context(|| format!("create evidence {}", candidate.display()))
            }
        }
    }
}

/// Shape of `results.json`.
#[derive(Debug, Serialize)]
struct ExportedRun<'a> {
    run_id: &'a str,
    phase: RunPhase,
    resource_name: &'a str,
    generated_at: String,
    config: &'a AuditConfig,
    report_path: Option<&'a Path>,
    results: &'a [ControlResult],
}

pub fn export_json(path: &Path, cfg: &AuditConfig, outcome: &RunOutcome) -> Result<()> {
    let generated_at = now_local()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into());
    let doc = ExportedRun {
        run_id: &outcome.run_id,
        phase: outcome.phase,
        resource_name: &outcome.resource_name,
        generated_at,
        config: cfg,
        report_path: outcome.report_path.as_deref(),
        results: &outcome.results,
    };
    let json = serde_json::to_string_pretty(&doc).context("serialize results")?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))
}

pub fn results_path(output_dir: &Path) -> PathBuf {
    output_dir.join(RESULTS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn slug_is_compact_local_stamp() {
        assert_eq!(
            timestamp_slug(datetime!(2024-03-05 07:08:09 UTC)),
            "20240305_070809"
        );
    }

    #[test]
    fn run_dirs_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let at = datetime!(2024-03-05 07:08:09 UTC);
        let a = create_run_dir(tmp.path(), at).unwrap();
        let b = create_run_dir(tmp.path(), at).unwrap();
        assert_ne!(a, b);
        assert!(a.ends_with("audit_results_20240305_070809"));
        assert!(b.ends_with("audit_results_20240305_070809_1"));
    }

    #[test]
    fn evidence_names_embed_control_and_time() {
        let p = evidence_path(
            Path::new("/tmp/run"),
            "NS-1/a b",
            datetime!(2024-03-05 07:08:09 UTC),
        );
        assert_eq!(
            p,
            PathBuf::from("/tmp/run/screenshot_NS-1_a_b_20240305_070809.png")
        );
        assert_eq!(sanitize_component(".."), "control");
    }

    #[test]
    fn colliding_evidence_names_keep_both_screenshots() {
        let tmp = tempfile::tempdir().unwrap();
        let at = datetime!(2024-03-05 07:08:09 UTC);
        let first = evidence_path(tmp.path(), "NS/1", at);
        let second = evidence_path(tmp.path(), "NS_1", at);
        assert_eq!(first, second);

        let a = save_evidence(&first, b"first").unwrap();
        let b = save_evidence(&second, b"second").unwrap();
        assert_ne!(a, b);
        assert!(b.ends_with("screenshot_NS_1_20240305_070809_1.png"));
        assert_eq!(std::fs::read(&a).unwrap(), b"first");
        assert_eq!(std::fs::read(&b).unwrap(), b"second");

        let missing = tmp.path().join("gone").join("x.png");
        assert!(save_evidence(&missing, b"png").is_err());
    }
}
