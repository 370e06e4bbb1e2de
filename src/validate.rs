//! Validation mode (spec §2 item 9, §6 `PUT|POST` with
//! `x-zerovm-validate` / `content-type: application/x-nexe`, and the
//! `GET ?x-zerovm-valid` pre-check).
//!
//! No direct teacher analog; reuses `executor::run_oneshot` and
//! `manifest::Manifest` exactly as the execute path does, running the
//! staged nexe with no channels and the sandbox's own validator enabled
//! (`pre_validated = false`). Success records a `Validated` tag on the
//! object's metadata via `ObjectHandle::mark_validated`.

use crate::error::NodeError;
use crate::executor::{run_oneshot, ExecRc};
use crate::manifest::Manifest;
use crate::objecthandle::ObjectHandle;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MANIFEST_VERSION: &str = "20130611";

/// Stages `url`'s current content at `scratch_nexe_path`, runs it through
/// the sandbox validator, and marks the object validated at its current
/// etag if it passes. Returns whether validation succeeded.
pub async fn validate_stored_object(
    objects: &dyn ObjectHandle,
    exename: &Path,
    scratch_nexe_path: &Path,
    timeout: Duration,
    kill_timeout: Duration,
    max_stdout: usize,
    max_stderr: usize,
    url: &str,
) -> Result<bool, NodeError> {
    let meta = objects
        .open(url, scratch_nexe_path)
        .await
        .map_err(NodeError::internal)?;

    let manifest = Manifest {
        version: MANIFEST_VERSION.to_string(),
        program: scratch_nexe_path.to_path_buf(),
        timeout: timeout.as_secs(),
        memory: 0,
        channels: Vec::new(),
        job: None,
        node: None,
        name_server: None,
    };
    let manifest_path = write_temp_manifest(&manifest.render()).map_err(NodeError::internal)?;

    let outcome = run_oneshot(
        exename,
        &manifest_path,
        false,
        timeout,
        kill_timeout,
        max_stdout,
        max_stderr,
        None,
    )
    .await
    .map_err(NodeError::internal)?;

    let _ = tokio::fs::remove_file(scratch_nexe_path).await;

    let validated = matches!(outcome.rc, ExecRc::Ok);
    if validated {
        objects
            .mark_validated(url, meta.etag())
            .await
            .map_err(NodeError::internal)?;
    }
    Ok(validated)
}

/// Whether the stored object at `url` is currently validated: its
/// metadata's `Validated` tag equals its current `ETag` (spec §6
/// `GET ?x-zerovm-valid`).
pub async fn is_validated(objects: &dyn ObjectHandle, url: &str) -> Result<bool, NodeError> {
    let meta = objects
        .read_metadata(url)
        .await
        .map_err(NodeError::internal)?;
    Ok(meta.validated().as_deref() == Some(meta.etag()))
}

fn write_temp_manifest(text: &str) -> std::io::Result<PathBuf> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(text.as_bytes())?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objecthandle::MemoryObjectHandle;
    use std::os::unix::fs::PermissionsExt;

    fn script(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "#!/bin/sh\n{}", contents).unwrap();
        let mut perms = std::fs::metadata(f.path()).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(f.path(), perms).unwrap();
        f
    }

    #[tokio::test]
    async fn successful_validator_marks_object_validated() {
        let store = MemoryObjectHandle::new();
        store.seed("swift://a/c/nexe", b"binary bytes".to_vec(), "application/x-nexe", "abc123");

        let exe = script("exit 0");
        let scratch = tempfile::NamedTempFile::new().unwrap();

        let validated = validate_stored_object(
            &store,
            exe.path(),
            scratch.path(),
            Duration::from_secs(5),
            Duration::from_secs(1),
            1024,
            1024,
            "swift://a/c/nexe",
        )
        .await
        .unwrap();

        assert!(validated);
        let meta = store.read_metadata("swift://a/c/nexe").await.unwrap();
        assert_eq!(meta.validated().as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn failing_validator_leaves_object_unvalidated() {
        let store = MemoryObjectHandle::new();
        store.seed("swift://a/c/nexe", b"binary bytes".to_vec(), "application/x-nexe", "abc123");

        let exe = script("exit 1");
        let scratch = tempfile::NamedTempFile::new().unwrap();

        let validated = validate_stored_object(
            &store,
            exe.path(),
            scratch.path(),
            Duration::from_secs(5),
            Duration::from_secs(1),
            1024,
            1024,
            "swift://a/c/nexe",
        )
        .await
        .unwrap();

        assert!(!validated);
        let meta = store.read_metadata("swift://a/c/nexe").await.unwrap();
        assert_eq!(meta.validated(), &None);
    }

    #[tokio::test]
    async fn is_validated_true_when_tag_matches_current_etag() {
        let store = MemoryObjectHandle::new();
        store.seed("swift://a/c/o", b"x".to_vec(), "text/plain", "etag1");
        store.mark_validated("swift://a/c/o", "etag1").await.unwrap();

        assert!(is_validated(&store, "swift://a/c/o").await.unwrap());
    }

    #[tokio::test]
    async fn is_validated_false_after_content_changes_etag() {
        let store = MemoryObjectHandle::new();
        store.seed("swift://a/c/o", b"x".to_vec(), "text/plain", "etag1");
        store.mark_validated("swift://a/c/o", "etag1").await.unwrap();
        store.seed("swift://a/c/o", b"y".to_vec(), "text/plain", "etag2");

        assert!(!is_validated(&store, "swift://a/c/o").await.unwrap());
    }
}
