//! A worker pool around the `tesseract` CLI tool.
//!
//! Tesseract is used only for orientation-and-script detection (`--psm 0`);
//! all real OCR goes through a vision model. The pool bounds how many
//! `tesseract` subprocesses run at once: it starts small and adds permits
//! lazily as demand appears, up to one worker per image.

use std::{
    fs::File,
    io::Write as _,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::{process::Command, sync::Semaphore};

use crate::{async_utils::check_for_command_failure, prelude::*};

/// Pool size floor when sizing automatically.
const MIN_WORKERS: usize = 3;

/// A dynamically-sized pool of Tesseract workers.
pub struct TesseractPool {
    semaphore: Arc<Semaphore>,
    /// Permits issued so far, including the initial ones.
    spawned: AtomicUsize,
    /// Never issue more than this many permits.
    limit: usize,
    /// Passed to every invocation so Tesseract never warns about missing
    /// resolution metadata.
    dpi: u32,
}

impl TesseractPool {
    /// Create a pool for a run over `num_images` images.
    ///
    /// `max_workers < 0` sizes the pool automatically: start at
    /// `min(3, num_images)` and grow lazily up to `num_images`. An explicit
    /// `max_workers` caps both numbers.
    pub fn new(max_workers: i32, num_images: usize, dpi: u32) -> Self {
        let cap = if max_workers < 0 {
            usize::MAX
        } else {
            (max_workers as usize).max(1)
        };
        let limit = num_images.max(1).min(cap);
        let initial = limit.min(MIN_WORKERS);
        Self {
            semaphore: Arc::new(Semaphore::new(initial)),
            spawned: AtomicUsize::new(initial),
            limit,
            dpi,
        }
    }

    /// How many workers the pool has issued so far.
    pub fn capacity(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// The maximum number of workers this pool may grow to.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `work` while holding a worker permit, growing the pool first if
    /// every worker is busy and the limit allows another.
    pub async fn with_worker<T, Fut>(&self, work: impl FnOnce() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if self.semaphore.available_permits() == 0 {
            let spawned = self.spawned.load(Ordering::SeqCst);
            if spawned < self.limit
                && self
                    .spawned
                    .compare_exchange(
                        spawned,
                        spawned + 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
            {
                self.semaphore.add_permits(1);
            }
        }
        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("tesseract pool has been shut down")?;
        work().await
    }

    /// Detect the rotation of an image via Tesseract's OSD mode.
    ///
    /// Returns the clockwise correction angle Tesseract reports, or `None`
    /// when the page is already upright.
    #[instrument(level = "debug", skip_all)]
    pub async fn detect_rotation(&self, image: &[u8]) -> Result<Option<u32>> {
        let dpi = self.dpi;
        self.with_worker(|| async move {
            // Write our input to a temporary file.
            let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
            let input_path = tmpdir.path().join("input.png");
            let mut input_file = File::create(&input_path)
                .context("cannot create tesseract input file")?;
            input_file
                .write_all(image)
                .context("cannot write tesseract input file")?;
            input_file
                .flush()
                .context("cannot flush tesseract input file")?;

            // Run tesseract in OSD-only mode. `--dpi` keeps it from
            // complaining about invalid resolution metadata.
            let output = Command::new("tesseract")
                .arg(&input_path)
                .arg("stdout")
                .arg("--psm")
                .arg("0")
                .arg("--dpi")
                .arg(dpi.to_string())
                .output()
                .await
                .context("cannot run tesseract")?;
            check_for_command_failure("tesseract", &output)?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(parse_rotation(&stdout))
        })
        .await
    }

    /// Stop issuing workers. In-flight invocations finish; new requests
    /// fail.
    pub fn shutdown(&self) {
        self.semaphore.close();
    }
}

/// Pull the `Rotate:` line out of Tesseract's OSD output.
fn parse_rotation(osd_output: &str) -> Option<u32> {
    for line in osd_output.lines() {
        if let Some(value) = line.trim().strip_prefix("Rotate:") {
            let degrees = value.trim().parse::<u32>().ok()?;
            if matches!(degrees, 90 | 180 | 270) {
                return Some(degrees);
            }
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_sizing_starts_small_and_caps_at_image_count() {
        let pool = TesseractPool::new(-1, 20, 300);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.limit(), 20);

        let pool = TesseractPool::new(-1, 2, 300);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.limit(), 2);
    }

    #[test]
    fn explicit_worker_cap_wins_when_lower() {
        let pool = TesseractPool::new(2, 20, 300);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.limit(), 2);
    }

    #[test]
    fn parses_osd_rotation() {
        let osd = "Page number: 0\nOrientation in degrees: 270\nRotate: 90\nOrientation confidence: 12.74\n";
        assert_eq!(parse_rotation(osd), Some(90));
        assert_eq!(parse_rotation("Rotate: 0\n"), None);
        assert_eq!(parse_rotation("no rotation line"), None);
    }

    #[tokio::test]
    async fn pool_grows_under_contention() {
        let pool = TesseractPool::new(-1, 10, 300);
        // Hold all three initial permits, then ask for a fourth.
        let permits = (0..3)
            .map(|_| pool.semaphore.clone().try_acquire_owned().unwrap())
            .collect::<Vec<_>>();
        let value = pool.with_worker(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(pool.capacity(), 4);
        drop(permits);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let pool = TesseractPool::new(-1, 1, 300);
        pool.shutdown();
        let result: Result<()> = pool.with_worker(|| async { Ok(()) }).await;
        assert!(result.is_err());
    }
}
