use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest diagnostic line kept before it is split
const MAX_LINE_BYTES: usize = 8 * 1024;

/// Bounded, shareable buffer of the most recent diagnostic lines of a service
#[derive(Clone, Debug)]
pub struct DiagnosticLog {
    inner: Arc<Mutex<LogInner>>,
}

#[derive(Debug)]
struct LogInner {
    lines: VecDeque<String>,
    capacity: usize,
    evicted: usize,
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                evicted: 0,
            })),
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.lines.len() == inner.capacity {
            inner.lines.pop_front();
            inner.evicted += 1;
        }
        inner.lines.push_back(line.into());
    }

    /// All retained lines, oldest first
    pub fn lines(&self) -> Vec<String> {
        self.tail(usize::MAX)
    }

    /// The last `n` retained lines, oldest first
    pub fn tail(&self, n: usize) -> Vec<String> {
        match self.inner.lock() {
            Ok(inner) => {
                let skip = inner.lines.len().saturating_sub(n);
                inner.lines.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Number of lines dropped to stay within capacity
    pub fn evicted(&self) -> usize {
        self.inner.lock().map(|inner| inner.evicted).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.lines.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Newline framing that tolerates invalid UTF-8 and unterminated output
struct LossyLineCodec {
    max_len: usize,
}

impl Decoder for LossyLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(pos) = src.iter().position(|b| *b == b'\n') {
            let line = src.split_to(pos + 1);
            return Ok(Some(to_line(&line)));
        }
        if src.len() >= self.max_len {
            let line = src.split_to(self.max_len);
            return Ok(Some(to_line(&line)));
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let line = to_line(src);
        src.advance(src.len());
        Ok(Some(line))
    }
}

fn to_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\r', '\n'])
        .to_owned()
}

/// Background reader that moves one output stream of a service into a [`DiagnosticLog`]
pub struct DrainTask {
    source: &'static str,
    token: CancellationToken,
    join: JoinHandle<usize>,
}

impl DrainTask {
    /// Start draining `reader`; lines are prefixed with `source` in the log
    pub fn spawn<R>(reader: R, source: &'static str, log: DiagnosticLog) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let join = tokio::spawn(async move {
            let codec = LossyLineCodec {
                max_len: MAX_LINE_BYTES,
            };
            let mut frames = FramedRead::with_capacity(reader, codec, 1024);
            let mut count = 0usize;
            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    frame = frames.next() => match frame {
                        Some(Ok(line)) => {
                            debug!(target: "mcp_smoke::service", source, "{line}");
                            log.push(format!("[{source}] {line}"));
                            count += 1;
                        }
                        Some(Err(e)) => {
                            debug!(source, error = %e, "Diagnostic stream read failed");
                            break;
                        }
                        None => break,
                    }
                }
            }
            count
        });
        Self {
            source,
            token,
            join,
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    /// Stop reading without waiting
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Let the reader reach end of stream within `bound`, then cancel it.
    ///
    /// Returns the number of lines drained. Never blocks longer than roughly `bound`.
    pub async fn shutdown(mut self, bound: Duration) -> usize {
        if let Ok(joined) = tokio::time::timeout(bound, &mut self.join).await {
            return joined.unwrap_or(0);
        }
        self.token.cancel();
        match tokio::time::timeout(bound, &mut self.join).await {
            Ok(joined) => joined.unwrap_or(0),
            Err(_) => {
                warn!(source = self.source, "Diagnostic drain did not stop, aborting");
                self.join.abort();
                0
            }
        }
    }
}

impl Drop for DrainTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
