use anyhow::anyhow;
use futures_util::future;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::{Modality, RawDetection, RecognitionCache, Recognizer};
use crate::retry::{Backoff, wait_with_backoff};
use crate::tiling::{TileImage, TileSpec};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Upper bound on in-flight backend calls; further tiles wait their turn.
    pub concurrency: usize,
    pub max_retries: usize,
    pub backoff: Backoff,
    pub tile_timeout: Option<Duration>,
    /// Tiles still pending when this elapses are abandoned.
    pub batch_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            max_retries: 2,
            backoff: Backoff {
                base: Duration::from_millis(500),
                max: Duration::from_secs(8),
            },
            tile_timeout: Some(Duration::from_secs(120)),
            batch_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TileStatus {
    Succeeded { cached: bool },
    Failed { error: String },
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct TileOutcome {
    pub tile: TileSpec,
    pub modality: Modality,
    pub recognizer: String,
    pub attempts: usize,
    pub status: TileStatus,
    pub detections: Vec<RawDetection>,
}

impl TileOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, TileStatus::Succeeded { .. })
    }

    fn new<R: Recognizer + ?Sized>(
        tile: &TileImage,
        recognizer: &R,
        attempts: usize,
        status: TileStatus,
        detections: Vec<RawDetection>,
    ) -> Self {
        Self {
            tile: tile.spec.clone(),
            modality: recognizer.modality(),
            recognizer: recognizer.name().to_string(),
            attempts,
            status,
            detections,
        }
    }
}

/// Runs `recognizer` over every tile through a bounded worker pool.
///
/// Returns one outcome per tile in input order. Completion order does not
/// matter. A tile that fails, times out or is still pending when `stop`
/// resolves (or the batch deadline passes) contributes no detections.
pub async fn recognize_tiles<R, S>(
    tiles: &[TileImage],
    recognizer: &R,
    policy: &RetryPolicy,
    cache: &RecognitionCache,
    stop: S,
) -> Vec<TileOutcome>
where
    R: Recognizer + ?Sized,
    S: Future<Output = ()>,
{
    let concurrency = policy.concurrency.max(1);
    let deadline = async move {
        match policy.batch_timeout {
            Some(limit) => sleep(limit).await,
            None => future::pending::<()>().await,
        }
    };
    let halt = future::select(Box::pin(stop), Box::pin(deadline));

    let mut results = std::pin::pin!(
        stream::iter(tiles.iter().enumerate())
            .map(move |(idx, tile)| async move {
                (idx, recognize_one(tile, recognizer, policy, cache).await)
            })
            .buffer_unordered(concurrency)
            .take_until(halt)
    );

    let mut slots: Vec<Option<TileOutcome>> = tiles.iter().map(|_| None).collect();
    while let Some((idx, outcome)) = results.next().await {
        slots[idx] = Some(outcome);
    }

    slots
        .into_iter()
        .zip(tiles)
        .map(|(slot, tile)| {
            slot.unwrap_or_else(|| {
                warn!(
                    "{} abandoned tile {} before it finished",
                    recognizer.name(),
                    tile.spec.index
                );
                TileOutcome::new(tile, recognizer, 0, TileStatus::Abandoned, Vec::new())
            })
        })
        .collect()
}

async fn recognize_one<R: Recognizer + ?Sized>(
    tile: &TileImage,
    recognizer: &R,
    policy: &RetryPolicy,
    cache: &RecognitionCache,
) -> TileOutcome {
    let key = RecognitionCache::key(recognizer.modality(), recognizer.name(), tile);
    if let Some(detections) = cache.get(&key) {
        debug!(
            "{} tile {} served from cache ({} detections)",
            recognizer.name(),
            tile.spec.index,
            detections.len()
        );
        return TileOutcome::new(
            tile,
            recognizer,
            0,
            TileStatus::Succeeded { cached: true },
            detections,
        );
    }

    let max_attempts = policy.max_retries + 1;
    let mut attempt = 0usize;
    let mut delay = policy.backoff.base;
    loop {
        attempt += 1;
        let result = match policy.tile_timeout {
            Some(limit) => match timeout(limit, recognizer.recognize(tile)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("timed out after {:.1}s", limit.as_secs_f32())),
            },
            None => recognizer.recognize(tile).await,
        };

        match result {
            Ok(detections) => {
                debug!(
                    "{} tile {}: {} detections (attempt {})",
                    recognizer.name(),
                    tile.spec.index,
                    detections.len(),
                    attempt
                );
                cache.insert(key, detections.clone());
                return TileOutcome::new(
                    tile,
                    recognizer,
                    attempt,
                    TileStatus::Succeeded { cached: false },
                    detections,
                );
            }
            Err(err) if attempt < max_attempts => {
                let label = format!(
                    "{} tile {} failed ({:#});",
                    recognizer.name(),
                    tile.spec.index,
                    err
                );
                delay =
                    wait_with_backoff(&label, attempt, max_attempts, delay, None, policy.backoff)
                        .await;
            }
            Err(err) => {
                warn!(
                    "{} gave up on tile {} after {} attempt(s): {:#}",
                    recognizer.name(),
                    tile.spec.index,
                    attempt,
                    err
                );
                return TileOutcome::new(
                    tile,
                    recognizer,
                    attempt,
                    TileStatus::Failed {
                        error: format!("{:#}", err),
                    },
                    Vec::new(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::RecognizeFuture;
    use crate::tiling::{Margins, TileIndex};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tiles(count: u32) -> Vec<TileImage> {
        (0..count)
            .map(|col| TileImage {
                spec: TileSpec {
                    index: TileIndex { row: 0, col },
                    x: col * 100,
                    y: 0,
                    width: 100,
                    height: 100,
                    margins: Margins::default(),
                },
                bytes: vec![col as u8, 7, 7],
                mime: "image/png".to_string(),
            })
            .collect()
    }

    fn fast_policy(concurrency: usize) -> RetryPolicy {
        RetryPolicy {
            concurrency,
            max_retries: 2,
            backoff: Backoff {
                base: Duration::from_millis(1),
                max: Duration::from_millis(2),
            },
            tile_timeout: Some(Duration::from_secs(5)),
            batch_timeout: None,
        }
    }

    fn detection(text: &str) -> RawDetection {
        RawDetection {
            text: Some(text.to_string()),
            bbox: vec![0.0, 0.0, 10.0, 10.0],
            confidence: Some(0.9),
            ..RawDetection::default()
        }
    }

    /// Fails the first `failures` calls per column, optionally forever for one column.
    struct ScriptedRecognizer {
        failures: usize,
        broken_col: Option<u32>,
        delay: Duration,
        calls: Mutex<HashMap<u32, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedRecognizer {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                broken_col: None,
                delay: Duration::from_millis(1),
                calls: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    impl Recognizer for ScriptedRecognizer {
        fn name(&self) -> &str {
            "scripted"
        }

        fn modality(&self) -> Modality {
            Modality::Ocr
        }

        fn recognize<'a>(&'a self, tile: &'a TileImage) -> RecognizeFuture<'a> {
            Box::pin(async move {
                let col = tile.spec.index.col;
                let call = {
                    let mut calls = self.calls.lock().unwrap();
                    let entry = calls.entry(col).or_insert(0);
                    *entry += 1;
                    *entry
                };
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if self.broken_col == Some(col) {
                    return Err(anyhow!("backend rejected tile"));
                }
                if call <= self.failures {
                    return Err(anyhow!("transient failure"));
                }
                Ok(vec![detection(&format!("T{}", col))])
            })
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let recognizer = ScriptedRecognizer::new(1);
        let cache = RecognitionCache::new();
        let outcomes = recognize_tiles(
            &tiles(3),
            &recognizer,
            &fast_policy(2),
            &cache,
            future::pending(),
        )
        .await;
        assert_eq!(outcomes.len(), 3);
        for (col, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.tile.index.col, col as u32);
            assert_eq!(outcome.status, TileStatus::Succeeded { cached: false });
            assert_eq!(outcome.attempts, 2);
            assert_eq!(outcome.detections.len(), 1);
        }
    }

    #[tokio::test]
    async fn persistent_failure_is_isolated_to_its_tile() {
        let mut recognizer = ScriptedRecognizer::new(0);
        recognizer.broken_col = Some(1);
        let cache = RecognitionCache::new();
        let outcomes = recognize_tiles(
            &tiles(3),
            &recognizer,
            &fast_policy(3),
            &cache,
            future::pending(),
        )
        .await;
        assert!(outcomes[0].succeeded());
        assert!(outcomes[2].succeeded());
        let failed = &outcomes[1];
        assert_eq!(failed.attempts, 3);
        assert!(failed.detections.is_empty());
        match &failed.status {
            TileStatus::Failed { error } => assert!(error.contains("rejected")),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn concurrency_is_capped() {
        let mut recognizer = ScriptedRecognizer::new(0);
        recognizer.delay = Duration::from_millis(15);
        let cache = RecognitionCache::new();
        let outcomes = recognize_tiles(
            &tiles(8),
            &recognizer,
            &fast_policy(2),
            &cache,
            future::pending(),
        )
        .await;
        assert!(outcomes.iter().all(TileOutcome::succeeded));
        assert!(recognizer.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn stop_signal_abandons_pending_tiles() {
        let recognizer = ScriptedRecognizer::new(0);
        let cache = RecognitionCache::new();
        let outcomes = recognize_tiles(
            &tiles(4),
            &recognizer,
            &fast_policy(1),
            &cache,
            future::ready(()),
        )
        .await;
        assert_eq!(outcomes.len(), 4);
        assert!(
            outcomes
                .iter()
                .all(|outcome| outcome.status == TileStatus::Abandoned
                    && outcome.detections.is_empty())
        );
    }

    #[tokio::test]
    async fn slow_tiles_time_out() {
        let mut recognizer = ScriptedRecognizer::new(0);
        recognizer.delay = Duration::from_millis(200);
        let mut policy = fast_policy(2);
        policy.max_retries = 0;
        policy.tile_timeout = Some(Duration::from_millis(5));
        let cache = RecognitionCache::new();
        let outcomes =
            recognize_tiles(&tiles(2), &recognizer, &policy, &cache, future::pending()).await;
        for outcome in outcomes {
            match outcome.status {
                TileStatus::Failed { error } => assert!(error.contains("timed out")),
                other => panic!("unexpected status {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn cached_tiles_skip_the_backend() {
        let recognizer = ScriptedRecognizer::new(0);
        let cache = RecognitionCache::new();
        let policy = fast_policy(2);
        let batch = tiles(3);
        recognize_tiles(&batch, &recognizer, &policy, &cache, future::pending()).await;
        assert_eq!(recognizer.total_calls(), 3);
        assert_eq!(cache.len(), 3);

        let again = recognize_tiles(&batch, &recognizer, &policy, &cache, future::pending()).await;
        assert_eq!(recognizer.total_calls(), 3);
        assert_eq!(cache.hits(), 3);
        assert!(
            again
                .iter()
                .all(|outcome| outcome.status == TileStatus::Succeeded { cached: true })
        );
    }
}
