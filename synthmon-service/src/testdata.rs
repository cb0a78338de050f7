//! Pre-generated random payload files for scripted upload steps.
//!
//! Scripts read their upload payloads from a local scratch directory keyed
//! by `(test, size)`. Files are generated once at startup and reused across
//! runs; a file of the wrong size is regenerated.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytesize::ByteSize as DisplayBytes;
use rand::RngCore;

use crate::catalog::{Action, ExecutorKind, Test};

/// Scratch directory for generated payloads.
pub const DATA_DIR: &str = "/tmp/test-data";

const CHUNK_SIZE: usize = 1024 * 1024;

/// Generates payload files for every native upload step in the catalogue.
/// Individual file failures are logged and skipped; only an unusable scratch
/// directory is an error.
pub fn ensure_test_data_files(tests: &[Test]) -> Result<()> {
    ensure_in_dir(tests, Path::new(DATA_DIR))
}

fn ensure_in_dir(tests: &[Test], dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create test data directory {}", dir.display()))?;

    let wanted = collect_file_sizes(tests);
    if wanted.is_empty() {
        tracing::info!("no scripted upload steps in catalogue, skipping test data generation");
        return Ok(());
    }

    tracing::info!("ensuring {} test data file(s) in {}", wanted.len(), dir.display());
    for (key, size) in wanted {
        let path = dir.join(format!("{key}.bin"));
        if let Err(err) = ensure_file(&path, size) {
            tracing::warn!("failed to generate {}: {err:#}", path.display());
        }
    }

    Ok(())
}

/// Unique `(test, size)` pairs over the native upload steps.
fn collect_file_sizes(tests: &[Test]) -> HashMap<String, u64> {
    let mut sizes = HashMap::new();
    for test in tests {
        if test.executor != ExecutorKind::Native {
            continue;
        }
        for step in &test.steps {
            if !matches!(step.action(), Ok(Action::Upload)) {
                continue;
            }
            let Some(size) = step.file_size.filter(|s| s.bytes() > 0) else {
                continue;
            };
            sizes.insert(format!("{}-{}", test.name, size.bytes()), size.bytes());
        }
    }
    sizes
}

fn ensure_file(path: &Path, size: u64) -> Result<()> {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() == size {
            tracing::debug!("using existing {}", path.display());
            return Ok(());
        }
        tracing::debug!(
            "regenerating {} (wrong size: {} vs {})",
            path.display(),
            meta.len(),
            size
        );
        fs::remove_file(path).ok();
    }

    tracing::info!("generating {} ({})", path.display(), DisplayBytes::b(size));

    let mut file = fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    let mut rng = rand::rng();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let take = remaining.min(CHUNK_SIZE as u64) as usize;
        rng.fill_bytes(&mut buf[..take]);
        file.write_all(&buf[..take])
            .with_context(|| format!("failed to write {}", path.display()))?;
        remaining -= take as u64;
    }

    Ok(())
}

/// Path of the payload file for one `(test, size)` pair.
pub fn payload_path(test_name: &str, size: u64) -> PathBuf {
    Path::new(DATA_DIR).join(format!("{test_name}-{size}.bin"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ByteSize, TestStep};

    fn upload_test(name: &str, executor: ExecutorKind, size: u64) -> Test {
        Test {
            name: name.into(),
            schedule: "*/5 * * * *".into(),
            enabled: true,
            executor,
            bucket: None,
            filename: None,
            jitter: None,
            steps: vec![TestStep {
                name: "upload".into(),
                file_size: Some(ByteSize::new(size)),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn generates_files_of_the_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let tests = [upload_test("t1", ExecutorKind::Native, 4096)];

        ensure_in_dir(&tests, dir.path()).unwrap();

        let meta = fs::metadata(dir.path().join("t1-4096.bin")).unwrap();
        assert_eq!(meta.len(), 4096);
    }

    #[test]
    fn regenerates_wrong_sized_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1-4096.bin");
        fs::write(&path, b"stale").unwrap();

        let tests = [upload_test("t1", ExecutorKind::Native, 4096)];
        ensure_in_dir(&tests, dir.path()).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn ignores_non_native_and_non_upload_steps() {
        let mut sweep = upload_test("t2", ExecutorKind::Native, 1024);
        sweep.steps[0].name = "delete".into();

        let tests = [
            upload_test("t1", ExecutorKind::RawHttp, 4096),
            sweep,
        ];
        assert!(collect_file_sizes(&tests).is_empty());
    }

    #[test]
    fn deduplicates_by_test_and_size() {
        let mut test = upload_test("t1", ExecutorKind::Native, 2048);
        test.steps.push(test.steps[0].clone());

        let sizes = collect_file_sizes(&[test]);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes["t1-2048"], 2048);
    }
}
