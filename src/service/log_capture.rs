//! Output capture for spawned processes.
//!
//! stdout and stderr are read line by line into a bounded ring buffer.
//! Each line is also broadcast so followers can stream output live.

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default maximum number of log lines kept in memory per service.
pub const DEFAULT_MAX_LOG_LINES: usize = 10_000;

/// Live lines buffered per follower before it starts losing lines.
const FOLLOW_CAPACITY: usize = 1024;

pub struct LogCapture {
    service_name: String,
    lines: Arc<Mutex<VecDeque<String>>>,
    max_lines: usize,
    dropped_count: Arc<AtomicUsize>,
    live: broadcast::Sender<String>,
    active_readers: Arc<AtomicUsize>,
    /// Cancelled once the last reader reaches end of input
    finished: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LogCapture {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self::with_max_lines(service_name, DEFAULT_MAX_LOG_LINES)
    }

    pub fn with_max_lines(service_name: impl Into<String>, max_lines: usize) -> Self {
        let (live, _) = broadcast::channel(FOLLOW_CAPACITY);
        Self {
            service_name: service_name.into(),
            lines: Arc::new(Mutex::new(VecDeque::new())),
            max_lines: max_lines.max(1),
            dropped_count: Arc::new(AtomicUsize::new(0)),
            live,
            active_readers: Arc::new(AtomicUsize::new(0)),
            finished: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Lines evicted because the buffer was full.
    pub fn dropped_count(&self) -> usize {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Start reading `reader` in the background. stderr lines are prefixed.
    pub fn capture<R>(&self, reader: R, stderr: bool)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let lines = Arc::clone(&self.lines);
        let dropped = Arc::clone(&self.dropped_count);
        let live = self.live.clone();
        let max_lines = self.max_lines;
        let service_name = self.service_name.clone();
        let active_readers = Arc::clone(&self.active_readers);
        let finished = self.finished.clone();
        active_readers.fetch_add(1, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(reader).lines();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        let line = if stderr {
                            format!("[stderr] {}", line)
                        } else {
                            line
                        };
                        let mut buffer = lines.lock();
                        buffer.push_back(line.clone());
                        if buffer.len() > max_lines {
                            buffer.pop_front();
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        // Sent under the buffer lock so followers see each line once
                        let _ = live.send(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("Log capture for '{}' ended: {}", service_name, e);
                        break;
                    }
                }
            }
            if active_readers.fetch_sub(1, Ordering::SeqCst) == 1 {
                finished.cancel();
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Last `tail` lines, or everything when `None`.
    pub fn snapshot(&self, tail: Option<usize>) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = tail.map_or(0, |n| lines.len().saturating_sub(n));
        lines.iter().skip(skip).cloned().collect()
    }

    /// True once every captured reader hit end of input.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Buffered lines followed by live output until every reader has closed.
    pub fn stream(&self) -> BoxStream<'static, String> {
        let (rx, buffered) = {
            let lines = self.lines.lock();
            (self.live.subscribe(), lines.iter().cloned().collect::<Vec<_>>())
        };
        let finished = self.finished.clone();

        let live = stream::unfold((rx, finished), |(mut rx, finished)| async move {
            loop {
                let received = tokio::select! {
                    biased;
                    received = rx.recv() => received,
                    _ = finished.cancelled() => match rx.try_recv() {
                        Ok(line) => Ok(line),
                        Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                            Err(broadcast::error::RecvError::Lagged(skipped))
                        }
                        Err(_) => return None,
                    },
                };
                match received {
                    Ok(line) => return Some((line, (rx, finished))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Log follower lagged, skipped {} lines", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(buffered).chain(live).boxed()
    }

    /// Stop the reader tasks. Buffered lines stay readable.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.finished.cancel();
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest() {
        let capture = LogCapture::with_max_lines("api", 2);
        capture.capture(&b"one\ntwo\nthree\n"[..], false);

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while capture.dropped_count() < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(capture.snapshot(None), vec!["two", "three"]);
        assert_eq!(capture.snapshot(Some(1)), vec!["three"]);
    }

    #[tokio::test]
    async fn test_stream_starts_with_buffered_lines() {
        let capture = LogCapture::new("api");
        capture.capture(&b"ready\n"[..], true);

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while capture.snapshot(None).is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let mut stream = capture.stream();
        assert_eq!(stream.next().await.as_deref(), Some("[stderr] ready"));
    }

    #[tokio::test]
    async fn test_stream_ends_when_input_closes() {
        let capture = LogCapture::new("job");
        capture.capture(&b"a\nb\n"[..], false);

        let lines: Vec<String> =
            tokio::time::timeout(std::time::Duration::from_secs(2), capture.stream().collect())
                .await
                .unwrap();
        assert_eq!(lines, vec!["a", "b"]);
        assert!(capture.is_finished());
    }
}
