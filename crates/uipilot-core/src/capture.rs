//! Screen state capture with stabilization.
//!
//! UIs are often mid-transition when a step begins. Every capture primitive is
//! polled until two consecutive observations agree, or until the timeout
//! elapses, in which case the last observation wins.

use anyhow::Result;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uipilot_config::StabilizationConfig;
use uipilot_driver::Driver;
use uipilot_oracle::ImageContent;

use crate::error::PilotError;
use crate::fingerprint::{hierarchy_fingerprint, ImageFingerprint, SnapshotComparator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilizeOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for StabilizeOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_millis(5000),
        }
    }
}

impl From<&StabilizationConfig> for StabilizeOptions {
    fn from(config: &StabilizationConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

/// Poll `capture` until two consecutive values are `equal`.
///
/// - An absent first value returns `None` without polling again.
/// - The deadline is checked after each sleep, before capturing again; on
///   expiry the last value captured before the deadline is returned.
/// - An absent value after the first ends the wait with the last observed value.
pub async fn wait_for_stable<T, C, Fut, E>(
    mut capture: C,
    mut equal: E,
    options: &StabilizeOptions,
) -> Result<Option<T>>
where
    C: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
    E: FnMut(&T, &T) -> bool,
{
    let started = Instant::now();
    let mut last = match capture().await? {
        Some(value) => value,
        None => {
            debug!("Nothing to capture, skipping stabilization");
            return Ok(None);
        }
    };

    let mut polls = 1;
    loop {
        tokio::time::sleep(options.poll_interval).await;
        if started.elapsed() >= options.timeout {
            warn!(
                "Screen did not stabilize within {:?} ({} polls), using last capture",
                options.timeout, polls
            );
            return Ok(Some(last));
        }
        polls += 1;

        let current = match capture().await? {
            Some(value) => value,
            None => return Ok(Some(last)),
        };

        if equal(&last, &current) {
            debug!("Stable after {} polls", polls);
            return Ok(Some(current));
        }
        last = current;
    }
}

/// One observation of the screen
#[derive(Debug, Clone, Default)]
pub struct ScreenCapture {
    pub image: Option<Vec<u8>>,
    pub hierarchy_text: String,
    pub image_attached: bool,
}

impl ScreenCapture {
    pub fn hierarchy_fingerprint(&self) -> String {
        hierarchy_fingerprint(&self.hierarchy_text)
    }

    /// Perceptual fingerprint of the screenshot, if one was captured and decodes
    pub fn image_fingerprint(&self, comparator: &SnapshotComparator) -> Option<ImageFingerprint> {
        let bytes = self.image.as_ref()?;
        match comparator.fingerprint(bytes) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!("Could not fingerprint screenshot: {:#}", e);
                None
            }
        }
    }

    /// Screenshot payload for the oracle, when attached
    pub fn image_content(&self) -> Option<ImageContent> {
        if !self.image_attached {
            return None;
        }
        self.image.as_deref().map(ImageContent::from_bytes)
    }
}

/// Captures stabilized screen state from a backend
pub struct ScreenCapturer {
    driver: Arc<dyn Driver>,
    comparator: SnapshotComparator,
    options: StabilizeOptions,
    captures: AtomicUsize,
}

impl ScreenCapturer {
    pub fn new(
        driver: Arc<dyn Driver>,
        comparator: SnapshotComparator,
        options: StabilizeOptions,
    ) -> Self {
        Self {
            driver,
            comparator,
            options,
            captures: AtomicUsize::new(0),
        }
    }

    /// Number of completed `capture` calls
    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Capture the screen, skipping the screenshot unless `include_image`
    pub async fn capture(&self, include_image: bool) -> Result<ScreenCapture> {
        let image = if include_image {
            self.stable_image().await?
        } else {
            None
        };
        let hierarchy_text = self.stable_hierarchy().await?.unwrap_or_default();
        self.captures.fetch_add(1, Ordering::SeqCst);

        debug!(
            "Captured screen: image={} hierarchy={} chars",
            image.is_some(),
            hierarchy_text.len()
        );
        Ok(ScreenCapture {
            image_attached: image.is_some(),
            image,
            hierarchy_text,
        })
    }

    async fn stable_image(&self) -> Result<Option<Vec<u8>>> {
        let driver = self.driver.clone();
        let comparator = self.comparator;
        wait_for_stable(
            || {
                let driver = driver.clone();
                async move { driver.capture_image().await }
            },
            |a: &Vec<u8>, b: &Vec<u8>| comparator.images_equal(a, b),
            &self.options,
        )
        .await
        .map_err(|e| PilotError::Capture(format!("screenshot: {:#}", e)).into())
    }

    async fn stable_hierarchy(&self) -> Result<Option<String>> {
        let driver = self.driver.clone();
        wait_for_stable(
            || {
                let driver = driver.clone();
                async move {
                    let text = driver.capture_hierarchy_text().await?;
                    Ok::<_, anyhow::Error>(if text.trim().is_empty() {
                        None
                    } else {
                        Some(text)
                    })
                }
            },
            |a: &String, b: &String| hierarchy_fingerprint(a) == hierarchy_fingerprint(b),
            &self.options,
        )
        .await
        .map_err(|e| PilotError::Capture(format!("view hierarchy: {:#}", e)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn options(poll_ms: u64, timeout_ms: u64) -> StabilizeOptions {
        StabilizeOptions {
            poll_interval: Duration::from_millis(poll_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_after_two_equal_captures() {
        let sequence = Mutex::new(VecDeque::from(vec!["A", "B", "B"]));
        let captures = Cell::new(0);
        let comparisons = Cell::new(0);

        let value = wait_for_stable(
            || {
                captures.set(captures.get() + 1);
                let next = sequence.lock().unwrap().pop_front();
                async move { Ok(next) }
            },
            |a: &&str, b: &&str| {
                comparisons.set(comparisons.get() + 1);
                a == b
            },
            &options(500, 5000),
        )
        .await
        .unwrap();

        assert_eq!(value, Some("B"));
        assert_eq!(captures.get(), 3);
        assert_eq!(comparisons.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_last_value() {
        let counter = Cell::new(0u32);

        let value = wait_for_stable(
            || {
                let current = counter.get();
                counter.set(current + 1);
                async move { Ok(Some(current)) }
            },
            |a: &u32, b: &u32| a == b,
            &options(100, 250),
        )
        .await
        .unwrap();

        // captures at t=0, 100, 200; the deadline passes during the next sleep
        assert_eq!(value, Some(2));
        assert_eq!(counter.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_capture_after_deadline() {
        let started = Instant::now();
        let timeout = Duration::from_millis(250);
        let taken = Mutex::new(Vec::new());

        let value = wait_for_stable(
            || {
                let mut taken = taken.lock().unwrap();
                taken.push(started.elapsed());
                let index = taken.len();
                async move { Ok(Some(index)) }
            },
            |a: &usize, b: &usize| a == b,
            &options(100, 250),
        )
        .await
        .unwrap();

        let taken = taken.into_inner().unwrap();
        assert!(taken.iter().all(|at| *at < timeout), "captured at {:?}", taken);
        assert_eq!(value, Some(taken.len()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_first_value_does_not_poll() {
        let captures = Cell::new(0);

        let value: Option<u32> = wait_for_stable(
            || {
                captures.set(captures.get() + 1);
                async { Ok(None) }
            },
            |_: &u32, _: &u32| panic!("nothing to compare"),
            &options(100, 1000),
        )
        .await
        .unwrap();

        assert_eq!(value, None);
        assert_eq!(captures.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_later_value_keeps_last() {
        let sequence = Mutex::new(VecDeque::from(vec![Some(1), Some(2), None]));

        let value = wait_for_stable(
            || {
                let next = sequence.lock().unwrap().pop_front().flatten();
                async move { Ok(next) }
            },
            |a: &i32, b: &i32| a == b,
            &options(100, 5000),
        )
        .await
        .unwrap();

        assert_eq!(value, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_error_propagates() {
        let result: Result<Option<u32>> = wait_for_stable(
            || async { Err(anyhow::anyhow!("device disconnected")) },
            |a: &u32, b: &u32| a == b,
            &options(100, 1000),
        )
        .await;

        assert!(result.unwrap_err().to_string().contains("device disconnected"));
    }
}
