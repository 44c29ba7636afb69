//! Segmented upload dispatcher.
//!
//! One input stream is cut into fixed-size segments that are handed out,
//! one at a time, to a fixed number of concurrent workers. At most
//! `worker_count * segment_size` bytes are resident at once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// A numbered chunk of the input stream.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Zero-based, contiguous across the whole stream
    pub number: u32,
    pub data: Bytes,
}

/// Confirmation returned by the remote side for one uploaded segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentResult {
    #[serde(rename = "PartNumber")]
    pub segment_number: u32,
    #[serde(rename = "ETag")]
    pub confirmation_token: String,
}

struct DispatchState<R> {
    reader: R,
    next_number: u32,
    exhausted: bool,
}

/// Hands out segments of a shared reader under a single mutex.
pub struct SegmentDispatcher<R> {
    state: Mutex<DispatchState<R>>,
    segment_size: usize,
    aborted: AtomicBool,
}

impl<R> SegmentDispatcher<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, segment_size: usize) -> Self {
        Self {
            state: Mutex::new(DispatchState {
                reader,
                next_number: 0,
                exhausted: false,
            }),
            segment_size: segment_size.max(1),
            aborted: AtomicBool::new(false),
        }
    }

    /// Read the next segment, or `None` once the stream is exhausted or the
    /// dispatcher was aborted.
    ///
    /// Reads until the segment is full or the stream ends; the final segment
    /// is trimmed to the bytes actually read.
    pub async fn next_segment(&self) -> StorageResult<Option<Segment>> {
        if self.is_aborted() {
            return Ok(None);
        }

        let mut state = self.state.lock().await;
        if state.exhausted || self.is_aborted() {
            return Ok(None);
        }

        let number = state.next_number;
        let mut buf = vec![0u8; self.segment_size];
        let mut total = 0;
        while total < buf.len() {
            let n = state.reader.read(&mut buf[total..]).await.map_err(|e| {
                StorageError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to read the data for segment {}: {}", number, e),
                ))
            })?;
            if n == 0 {
                state.exhausted = true;
                break;
            }
            total += n;
        }

        if total == 0 {
            return Ok(None);
        }
        buf.truncate(total);
        state.next_number += 1;
        debug!(segment = number, bytes = total, "Dispatching segment");

        Ok(Some(Segment {
            number,
            data: Bytes::from(buf),
        }))
    }

    /// Stop handing out segments. Segments already dispatched still finish.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Run `worker_count` workers that upload segments until the stream ends.
///
/// Every worker runs to completion. After the first failure no new segments
/// are dispensed, and all failures are returned together. On success the
/// results are sorted by segment number.
pub async fn run_workers<R, F, Fut>(
    dispatcher: &SegmentDispatcher<R>,
    worker_count: usize,
    upload: F,
) -> Result<Vec<SegmentResult>, Vec<StorageError>>
where
    R: AsyncRead + Unpin + Send,
    F: Fn(Segment) -> Fut,
    Fut: Future<Output = StorageResult<SegmentResult>>,
{
    let upload = &upload;
    let workers = (0..worker_count.max(1)).map(|worker_id| async move {
        let mut results = Vec::new();
        loop {
            let segment = match dispatcher.next_segment().await {
                Ok(Some(segment)) => segment,
                Ok(None) => return (results, None),
                Err(e) => {
                    dispatcher.abort();
                    return (results, Some(e));
                }
            };

            let number = segment.number;
            match upload(segment).await {
                Ok(result) => {
                    debug!(worker = worker_id, segment = number, "Segment uploaded");
                    results.push(result);
                }
                Err(e) => {
                    dispatcher.abort();
                    return (results, Some(e));
                }
            }
        }
    });

    let mut results = Vec::new();
    let mut failures = Vec::new();
    for (worker_results, failure) in join_all(workers).await {
        results.extend(worker_results);
        failures.extend(failure);
    }

    if !failures.is_empty() {
        return Err(failures);
    }

    results.sort_by_key(|r| r.segment_number);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::io::Cursor;
    use std::time::Duration;

    fn input(len: usize) -> Cursor<Vec<u8>> {
        Cursor::new((0..len).map(|i| (i % 251) as u8).collect())
    }

    #[tokio::test]
    async fn test_segments_are_contiguous_and_trimmed() {
        let dispatcher = SegmentDispatcher::new(input(2400), 1000);

        let mut sizes = Vec::new();
        while let Some(segment) = dispatcher.next_segment().await.unwrap() {
            assert_eq!(segment.number as usize, sizes.len());
            sizes.push(segment.data.len());
        }
        assert_eq!(sizes, vec![1000, 1000, 400]);
        assert!(dispatcher.next_segment().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_stream_yields_nothing() {
        let dispatcher = SegmentDispatcher::new(input(0), 1000);
        assert!(dispatcher.next_segment().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_tail() {
        let dispatcher = SegmentDispatcher::new(input(2000), 1000);
        let mut count = 0;
        while dispatcher.next_segment().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_results_sorted_despite_random_latency() {
        let data = input(10_500).into_inner();
        let dispatcher = SegmentDispatcher::new(Cursor::new(data.clone()), 1000);

        let results = run_workers(&dispatcher, 4, |segment| async move {
            let delay = rand::rng().random_range(0..20);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(SegmentResult {
                segment_number: segment.number,
                confirmation_token: format!("etag-{}-{}", segment.number, segment.data.len()),
            })
        })
        .await
        .unwrap();

        let numbers: Vec<u32> = results.iter().map(|r| r.segment_number).collect();
        assert_eq!(numbers, (0..11).collect::<Vec<_>>());
        assert_eq!(results[10].confirmation_token, "etag-10-500");
    }

    #[tokio::test]
    async fn test_failure_stops_dispensing_and_is_reported() {
        let dispatcher = SegmentDispatcher::new(input(50_000), 100);

        let outcome = run_workers(&dispatcher, 3, |segment| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if segment.number == 2 {
                Err(StorageError::transport("upload part", 1, "part 2 rejected"))
            } else {
                Ok(SegmentResult {
                    segment_number: segment.number,
                    confirmation_token: "t".to_string(),
                })
            }
        })
        .await;

        let failures = outcome.unwrap_err();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].to_string().contains("part 2 rejected"));
        assert!(dispatcher.is_aborted());
        assert!(dispatcher.next_segment().await.unwrap().is_none());
    }
}
