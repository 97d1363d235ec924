//! Offset/limit pagination as an explicit state machine.
//!
//! ```text
//! Start -> Requesting -> PageReceived -> Requesting ...
//!                     \              \-> Exhausted -> Done
//!                      \-> Failed
//! ```
//!
//! One page is in flight at a time and offsets only move forward. Retries
//! re-enter `Requesting` with the same offset.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{LayerClient, QuerySpec};
use super::response::RequestError;
use super::Page;
use crate::error::{FetchError, FetchResult};
use crate::models::ResultSet;

/// Fixed retry policy for page requests
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Throttled attempts tolerated per offset
    pub max_throttle_retries: u32,
    /// Used when the service sends no Retry-After
    pub throttle_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            max_throttle_retries: 5,
            throttle_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_delay: Duration::ZERO,
            max_throttle_retries: max_retries,
            throttle_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PagerConfig {
    pub page_size: u32,
    pub retry: RetryPolicy,
    /// Pause between consecutive page requests
    pub page_delay: Duration,
    /// When false a single unpaged request is made
    pub paginate: bool,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            retry: RetryPolicy::default(),
            page_delay: Duration::from_millis(500),
            paginate: true,
        }
    }
}

/// Something that can produce the page at a given window
#[allow(async_fn_in_trait)]
pub trait PageSource {
    /// `window` is `(offset, record_count)`, `None` for an unpaged request
    async fn fetch_page(&self, window: Option<(u64, u32)>) -> Result<Page, RequestError>;
}

/// A layer client paired with a fixed query
pub struct LayerQuery<'a> {
    pub client: &'a LayerClient,
    pub spec: &'a QuerySpec,
}

impl PageSource for LayerQuery<'_> {
    async fn fetch_page(&self, window: Option<(u64, u32)>) -> Result<Page, RequestError> {
        self.client.query_page(self.spec, window).await
    }
}

/// Running totals reported after every page
#[derive(Debug, Clone, Default)]
pub struct QueryProgress {
    pub records: usize,
    pub pages: usize,
    pub retries: u32,
    pub estimated_total: Option<u64>,
}

/// Receives progress updates from a run
pub trait ProgressSink: Send + Sync {
    fn on_page(&self, job: &str, progress: &QueryProgress);
}

impl ProgressSink for () {
    fn on_page(&self, _job: &str, _progress: &QueryProgress) {}
}

/// Outcome counters of a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagerStats {
    pub pages: usize,
    pub retries: u32,
    pub throttled: u32,
    pub duplicates: usize,
}

enum State {
    Start,
    Requesting {
        offset: u64,
        attempt: u32,
        throttles: u32,
    },
    PageReceived(Page),
    Exhausted,
    Failed(FetchError),
}

pub struct Pager<'a, S> {
    source: &'a S,
    config: PagerConfig,
    cancel: CancellationToken,
    estimated_total: Option<u64>,
    job: String,
}

impl<'a, S: PageSource> Pager<'a, S> {
    pub fn new(source: &'a S, config: PagerConfig) -> Self {
        Self {
            source,
            config,
            cancel: CancellationToken::new(),
            estimated_total: None,
            job: String::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Total from a count query; lets a full final page end the run
    pub fn with_estimated_total(mut self, total: Option<u64>) -> Self {
        self.estimated_total = total;
        self
    }

    /// Label passed to the progress sink
    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.job = job.into();
        self
    }

    /// Drive the state machine to completion
    pub async fn run(self, progress: &dyn ProgressSink) -> FetchResult<(ResultSet, PagerStats)> {
        let page_size = self.config.page_size.max(1);
        let retry = &self.config.retry;

        let mut results = ResultSet::new();
        let mut stats = PagerStats::default();
        let mut state = State::Start;

        loop {
            state = match state {
                State::Start => State::Requesting {
                    offset: 0,
                    attempt: 0,
                    throttles: 0,
                },

                State::Requesting {
                    offset,
                    attempt,
                    throttles,
                } => {
                    if self.cancel.is_cancelled() {
                        State::Failed(FetchError::Cancelled {
                            offset,
                            retrieved: results.len(),
                        })
                    } else {
                        let window = self.config.paginate.then_some((offset, page_size));
                        debug!("Requesting page {} at offset {}", stats.pages, offset);

                        match self.source.fetch_page(window).await {
                            Ok(mut page) => {
                                page.offset = offset;
                                State::PageReceived(page)
                            }
                            Err(RequestError::Permanent(cause)) => {
                                State::Failed(FetchError::PermanentRequest {
                                    offset,
                                    page: stats.pages,
                                    cause,
                                })
                            }
                            Err(RequestError::Transient(cause)) => {
                                if attempt < retry.max_retries {
                                    stats.retries += 1;
                                    warn!(
                                        "Page at offset {} failed (attempt {}/{}): {}",
                                        offset,
                                        attempt + 1,
                                        retry.max_retries + 1,
                                        cause
                                    );
                                    self.pause(retry.retry_delay).await;
                                    State::Requesting {
                                        offset,
                                        attempt: attempt + 1,
                                        throttles,
                                    }
                                } else {
                                    State::Failed(FetchError::TransientRequest {
                                        offset,
                                        page: stats.pages,
                                        attempts: attempt + 1,
                                        cause,
                                    })
                                }
                            }
                            Err(RequestError::Throttled {
                                retry_after,
                                message,
                            }) => {
                                if throttles < retry.max_throttle_retries {
                                    stats.throttled += 1;
                                    let wait = retry_after.unwrap_or(retry.throttle_delay);
                                    warn!(
                                        "Throttled at offset {}, backing off {:?}: {}",
                                        offset, wait, message
                                    );
                                    self.pause(wait).await;
                                    State::Requesting {
                                        offset,
                                        attempt,
                                        throttles: throttles + 1,
                                    }
                                } else {
                                    State::Failed(FetchError::TransientRequest {
                                        offset,
                                        page: stats.pages,
                                        attempts: attempt + throttles + 1,
                                        cause: message,
                                    })
                                }
                            }
                        }
                    }
                }

                State::PageReceived(page) => {
                    let offset = page.offset;
                    let received = page.records.len();
                    let exceeded = page.exceeded_transfer_limit;

                    stats.pages += 1;
                    let added = results.extend(page.records);

                    progress.on_page(
                        &self.job,
                        &QueryProgress {
                            records: results.len(),
                            pages: stats.pages,
                            retries: stats.retries,
                            estimated_total: self.estimated_total,
                        },
                    );
                    debug!(
                        "Page {} at offset {}: {} records (exceeded limit: {})",
                        stats.pages, offset, received, exceeded
                    );

                    let next = offset + received as u64;
                    let total_reached = self.estimated_total.is_some_and(|total| next >= total);

                    if self.config.paginate && received > 0 && added == 0 {
                        // Offsets only move forward, so an all-duplicate page
                        // means the service is not honouring resultOffset
                        State::Failed(FetchError::PermanentRequest {
                            offset,
                            page: stats.pages - 1,
                            cause: format!(
                                "service ignored resultOffset: page at offset {} returned only \
                                 {} already retrieved records",
                                offset, received
                            ),
                        })
                    } else if !self.config.paginate {
                        if exceeded {
                            warn!(
                                "Layer does not paginate and reported the transfer limit; \
                                 {} records may be missing",
                                self.estimated_total
                                    .map(|t| t.saturating_sub(received as u64).to_string())
                                    .unwrap_or_else(|| "some".to_string())
                            );
                        }
                        State::Exhausted
                    } else if received == 0 {
                        if exceeded {
                            warn!("Empty page at offset {} still flagged exceededTransferLimit", offset);
                        }
                        State::Exhausted
                    } else if exceeded {
                        self.pause(self.config.page_delay).await;
                        State::Requesting {
                            offset: next,
                            attempt: 0,
                            throttles: 0,
                        }
                    } else if (received as u64) < page_size as u64 || total_reached {
                        State::Exhausted
                    } else {
                        self.pause(self.config.page_delay).await;
                        State::Requesting {
                            offset: next,
                            attempt: 0,
                            throttles: 0,
                        }
                    }
                }

                State::Exhausted => {
                    stats.duplicates = results.duplicates();
                    info!(
                        "Retrieved {} records in {} pages ({} retries, {} duplicates)",
                        results.len(),
                        stats.pages,
                        stats.retries,
                        stats.duplicates
                    );
                    return Ok((results, stats));
                }

                State::Failed(err) => {
                    warn!("Query failed, discarding {} records: {}", results.len(), err);
                    return Err(err);
                }
            };
        }
    }

    /// Sleep unless cancelled first
    async fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureId, FeatureRecord};
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn record(id: i64) -> FeatureRecord {
        FeatureRecord {
            id: FeatureId::Int(id),
            attributes: BTreeMap::new(),
            geometry: None,
        }
    }

    /// In-memory layer with `total` records and an optional server cap
    struct FakeLayer {
        total: u64,
        server_max: Option<u32>,
        flag_full_pages: bool,
        failures: Mutex<VecDeque<RequestError>>,
        requests: Mutex<Vec<Option<(u64, u32)>>>,
        calls: AtomicUsize,
    }

    impl FakeLayer {
        fn new(total: u64) -> Self {
            Self {
                total,
                server_max: None,
                flag_full_pages: false,
                failures: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing_with(self, errors: Vec<RequestError>) -> Self {
            *self.failures.lock().unwrap() = errors.into();
            self
        }

        fn successful_pages(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl PageSource for FakeLayer {
        async fn fetch_page(&self, window: Option<(u64, u32)>) -> Result<Page, RequestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.requests.lock().unwrap().push(window);

            let (offset, count) = window.unwrap_or((0, u32::MAX));
            let count = self.server_max.map_or(count, |max| count.min(max));
            let end = (offset + count as u64).min(self.total);
            let records: Vec<_> = (offset..end).map(|i| record(i as i64)).collect();
            let more = end < self.total;

            Ok(Page {
                offset,
                exceeded_transfer_limit: more
                    && (self.server_max.is_some() || self.flag_full_pages),
                records,
            })
        }
    }

    fn config(page_size: u32) -> PagerConfig {
        PagerConfig {
            page_size,
            retry: RetryPolicy::immediate(3),
            page_delay: Duration::ZERO,
            paginate: true,
        }
    }

    #[tokio::test]
    async fn test_page_count_is_ceil_with_known_total() {
        for (total, page_size) in [(5u64, 2u32), (6, 2), (1, 10), (10, 10), (1000, 7)] {
            let layer = FakeLayer::new(total);
            let (results, stats) = Pager::new(&layer, config(page_size))
                .with_estimated_total(Some(total))
                .run(&())
                .await
                .unwrap();

            let expected_pages = total.div_ceil(page_size as u64) as usize;
            assert_eq!(stats.pages, expected_pages, "N={} P={}", total, page_size);
            assert_eq!(results.len() as u64, total);
            for id in 0..total {
                assert!(results.contains(&FeatureId::Int(id as i64)));
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_total_stops_on_short_page() {
        let layer = FakeLayer::new(5);
        let (results, stats) = Pager::new(&layer, config(2)).run(&()).await.unwrap();
        assert_eq!(stats.pages, 3);
        assert_eq!(results.len(), 5);

        let windows = layer.requests.lock().unwrap().clone();
        assert_eq!(windows, vec![Some((0, 2)), Some((2, 2)), Some((4, 2))]);
    }

    #[tokio::test]
    async fn test_unknown_total_full_last_page_needs_empty_page() {
        let layer = FakeLayer::new(4);
        let (results, stats) = Pager::new(&layer, config(2)).run(&()).await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(stats.pages, 3);
    }

    #[tokio::test]
    async fn test_exceeded_flag_forces_next_request() {
        let mut layer = FakeLayer::new(4);
        layer.flag_full_pages = true;
        // A total that would otherwise stop after the first page
        let (results, stats) = Pager::new(&layer, config(2))
            .with_estimated_total(Some(2))
            .run(&())
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(stats.pages, 2);
    }

    #[tokio::test]
    async fn test_server_cap_below_page_size_skips_nothing() {
        let mut layer = FakeLayer::new(7);
        layer.server_max = Some(3);
        let (results, _) = Pager::new(&layer, config(5)).run(&()).await.unwrap();
        assert_eq!(results.len(), 7);

        let offsets: Vec<u64> = layer
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|w| w.unwrap().0)
            .collect();
        assert_eq!(offsets, vec![0, 3, 6]);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_at_same_offset() {
        let layer = FakeLayer::new(5).failing_with(vec![
            RequestError::Transient("HTTP 503".into()),
            RequestError::Transient("HTTP 503".into()),
        ]);
        let (results, stats) = Pager::new(&layer, config(2)).run(&()).await.unwrap();

        assert_eq!(stats.retries, 2);
        assert_eq!(stats.pages, 3);
        assert_eq!(results.len(), 5);
        assert_eq!(results.duplicates(), 0);
        assert_eq!(layer.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_bound_exceeded_fails() {
        let layer = FakeLayer::new(5).failing_with(vec![
            RequestError::Transient("timeout".into());
            4
        ]);
        let err = Pager::new(&layer, config(2)).run(&()).await.unwrap_err();
        match err {
            FetchError::TransientRequest {
                offset, attempts, ..
            } => {
                assert_eq!(offset, 0);
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(layer.successful_pages(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let layer =
            FakeLayer::new(5).failing_with(vec![RequestError::Permanent("HTTP 400".into())]);
        let err = Pager::new(&layer, config(2)).run(&()).await.unwrap_err();
        assert!(matches!(err, FetchError::PermanentRequest { offset: 0, .. }));
        assert_eq!(layer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_throttling_backs_off_without_consuming_retries() {
        let throttled = RequestError::Throttled {
            retry_after: Some(Duration::ZERO),
            message: "HTTP 429".into(),
        };
        let layer = FakeLayer::new(3).failing_with(vec![throttled.clone(), throttled]);
        let mut cfg = config(2);
        cfg.retry.max_retries = 0;

        let (results, stats) = Pager::new(&layer, cfg).run(&()).await.unwrap();
        assert_eq!(stats.throttled, 2);
        assert_eq!(stats.retries, 0);
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_request() {
        let layer = FakeLayer::new(5);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Pager::new(&layer, config(2))
            .with_cancel(cancel)
            .run(&())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled { offset: 0, retrieved: 0 }));
        assert_eq!(layer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unpaged_single_request() {
        let layer = FakeLayer::new(3);
        let mut cfg = config(2);
        cfg.paginate = false;

        let (results, stats) = Pager::new(&layer, cfg).run(&()).await.unwrap();
        assert_eq!(stats.pages, 1);
        assert_eq!(results.len(), 3);
        assert_eq!(*layer.requests.lock().unwrap(), vec![None]);
    }

    /// Returns the first records for every window
    struct OffsetBlindLayer {
        exceeded: bool,
        calls: AtomicUsize,
    }

    impl PageSource for OffsetBlindLayer {
        async fn fetch_page(&self, _window: Option<(u64, u32)>) -> Result<Page, RequestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Page {
                offset: 0,
                records: vec![record(0), record(1)],
                exceeded_transfer_limit: self.exceeded,
            })
        }
    }

    #[tokio::test]
    async fn test_offset_ignoring_service_fails_instead_of_looping() {
        for exceeded in [true, false] {
            let layer = OffsetBlindLayer {
                exceeded,
                calls: AtomicUsize::new(0),
            };
            let err = tokio::time::timeout(
                Duration::from_secs(5),
                Pager::new(&layer, config(2)).run(&()),
            )
            .await
            .expect("pager must terminate")
            .unwrap_err();

            match err {
                FetchError::PermanentRequest { offset, page, cause } => {
                    assert_eq!(offset, 2);
                    assert_eq!(page, 1);
                    assert!(cause.contains("resultOffset"));
                }
                other => panic!("unexpected error {:?}", other),
            }
            assert_eq!(layer.calls.load(Ordering::SeqCst), 2);
        }
    }

    struct Recorder(Mutex<Vec<usize>>);

    impl ProgressSink for Recorder {
        fn on_page(&self, _job: &str, progress: &QueryProgress) {
            self.0.lock().unwrap().push(progress.records);
        }
    }

    #[tokio::test]
    async fn test_progress_reports_running_totals() {
        let layer = FakeLayer::new(5);
        let recorder = Recorder(Mutex::new(Vec::new()));
        Pager::new(&layer, config(2)).run(&recorder).await.unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![2, 4, 5]);
    }
}
