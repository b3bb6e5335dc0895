use parking_lot::Mutex;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Bytes pulled from the source on every buffering tick
pub const DEFAULT_BUFFERING_CHUNK: usize = 4 * 1024;
/// Pre-fetch watermark: background buffering stops once this many bytes are held
pub const DEFAULT_PREFETCH_WATERMARK: usize = 64 * 1024;
/// Interval between buffering ticks
pub const DEFAULT_BUFFERING_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Position {requested} is out of data size {total}")]
    OutOfBounds { requested: i128, total: u64 },
    #[error("Live source error: {0}")]
    Source(#[from] io::Error),
}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::OutOfBounds { .. } => io::Error::new(io::ErrorKind::InvalidInput, e),
            StreamError::Source(inner) => inner,
        }
    }
}

/// A forward-only byte source whose total length is known up front,
/// typically the body of an HTTP response that is still arriving.
pub trait LiveSource: Send {
    /// Read the next bytes of the body. `Ok(0)` means the source is exhausted.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Release the underlying connection. Called at most once.
    fn close(&mut self) -> io::Result<()>;
}

/// Background pre-fetch tuning
#[derive(Debug, Clone)]
pub struct BufferingConfig {
    pub chunk_size: usize,
    pub watermark: usize,
    pub period: Duration,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_BUFFERING_CHUNK,
            watermark: DEFAULT_PREFETCH_WATERMARK,
            period: DEFAULT_BUFFERING_PERIOD,
        }
    }
}

struct StreamState {
    source: Option<Box<dyn LiveSource>>,
    buffer: Vec<u8>,
    cursor: u64,
    buffered: bool,
    done: bool,
    closed: bool,
}

impl StreamState {
    /// Pull up to `want` bytes from the source with a single read and append them.
    /// Returns the number of bytes appended; 0 means the source is exhausted.
    fn pull_once(&mut self, want: usize) -> io::Result<usize> {
        let Some(source) = self.source.as_mut() else {
            return Ok(0);
        };

        let mut chunk = vec![0u8; want];
        let n = loop {
            match source.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            self.release_source();
        } else {
            self.buffer.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }

    /// Keep pulling until `want` bytes were appended or the source ends.
    fn pull_full(&mut self, want: usize) -> io::Result<()> {
        let mut remaining = want;
        while remaining > 0 {
            let n = self.pull_once(remaining)?;
            if n == 0 {
                break;
            }
            remaining -= n;
        }
        Ok(())
    }

    fn release_source(&mut self) {
        self.buffered = true;
        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.close() {
                warn!("Failed to release live source: {}", e);
            }
        }
    }
}

struct Shared {
    total_len: u64,
    state: Mutex<StreamState>,
    closed: AtomicBool,
    cancel: Mutex<Option<mpsc::Sender<()>>>,
}

impl Shared {
    /// One background buffering step. Returns false once buffering should stop.
    fn buffer_tick(&self, config: &BufferingConfig) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.buffered {
            return false;
        }

        let target = (config.watermark as u64).min(self.total_len) as usize;
        if state.buffer.len() >= target {
            state.buffered = true;
            return false;
        }

        let want = config.chunk_size.min(target - state.buffer.len());
        match state.pull_once(want) {
            Ok(0) => {
                debug!("Live source exhausted after {} bytes", state.buffer.len());
                return false;
            }
            Ok(n) => trace!("Buffered {} bytes ({} total)", n, state.buffer.len()),
            Err(e) => {
                if self.closed.load(Ordering::SeqCst) {
                    return false;
                }
                warn!("Buffering tick failed: {}", e);
            }
        }

        if state.buffer.len() >= target {
            state.buffered = true;
            return false;
        }
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.closed {
            state.release_source();
        }
    }
}

/// Buffered, seekable view over a live byte source.
///
/// Bytes pulled from the source are kept for the lifetime of the handle so
/// that any position already seen can be read again. A seek past the buffered
/// region is pure bookkeeping; the gap is pulled on the next read.
///
/// Clones share the same cursor and buffer.
#[derive(Clone)]
pub struct BufferedStream {
    shared: Arc<Shared>,
}

impl BufferedStream {
    /// Wrap a live source and start background buffering
    pub fn new(source: Box<dyn LiveSource>, total_len: u64, config: BufferingConfig) -> Self {
        let (cancel_tx, cancel_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            total_len,
            state: Mutex::new(StreamState {
                source: Some(source),
                buffer: Vec::with_capacity(config.watermark.min(total_len as usize)),
                cursor: 0,
                buffered: false,
                done: total_len == 0,
                closed: false,
            }),
            closed: AtomicBool::new(false),
            cancel: Mutex::new(Some(cancel_tx)),
        });

        let weak = Arc::downgrade(&shared);
        std::thread::spawn(move || run_buffering(weak, config, cancel_rx));

        Self { shared }
    }

    /// Declared total length of the stream
    pub fn len(&self) -> u64 {
        self.shared.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.shared.total_len == 0
    }

    /// Current cursor position
    pub fn position(&self) -> u64 {
        self.shared.state.lock().cursor
    }

    /// Cursor position as a fraction of the total length
    pub fn progress(&self) -> f64 {
        if self.shared.total_len == 0 {
            return 0.0;
        }
        let cursor = self.shared.state.lock().cursor;
        (cursor as f64 / self.shared.total_len as f64).clamp(0.0, 1.0)
    }

    /// Buffered bytes as a fraction of the total length
    pub fn buffering_progress(&self) -> f64 {
        if self.shared.total_len == 0 {
            return 0.0;
        }
        let buffered = self.shared.state.lock().buffer.len();
        (buffered as f64 / self.shared.total_len as f64).clamp(0.0, 1.0)
    }

    /// Whether background buffering has stopped (watermark reached or source exhausted)
    pub fn is_buffered(&self) -> bool {
        self.shared.state.lock().buffered
    }

    /// Whether the cursor sits at the end of the stream or the handle is closed
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Read from the cursor, pulling from the live source as needed
    pub fn read_at_cursor(&self, dest: &mut [u8]) -> Result<usize, StreamError> {
        if dest.is_empty() || self.is_closed() {
            return Ok(0);
        }

        let total = self.shared.total_len;
        let mut state = self.shared.state.lock();
        if state.closed {
            return Ok(0);
        }
        if state.cursor >= total {
            state.done = true;
            return Ok(0);
        }

        let cursor = state.cursor;
        let want = (dest.len() as u64).min(total - cursor) as usize;
        let buffered_len = state.buffer.len() as u64;

        let pulled = if cursor >= buffered_len {
            // Forward of the buffered region: pull the gap and the request in one go
            let gap = (cursor - buffered_len) as usize;
            state.pull_full(gap + want)
        } else {
            let available = (buffered_len - cursor) as usize;
            if available < want {
                state.pull_once(want - available).map(|_| ())
            } else {
                Ok(())
            }
        };

        let start = cursor as usize;
        let end = state.buffer.len().min(start + want);
        let n = end.saturating_sub(start);
        dest[..n].copy_from_slice(&state.buffer[start..end]);
        state.cursor += n as u64;
        state.done = state.cursor == total;

        if let Err(e) = pulled {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(n);
            }
            if n == 0 {
                return Err(StreamError::Source(e));
            }
            debug!("Source read failed after serving {} bytes: {}", n, e);
        }

        if n == 0 {
            return Err(StreamError::Source(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "live source ended at {} of {} bytes",
                    state.buffer.len(),
                    total
                ),
            )));
        }

        Ok(n)
    }

    /// Move the cursor. Out-of-range targets are rejected and leave the cursor unchanged.
    pub fn seek_to(&self, pos: SeekFrom) -> Result<u64, StreamError> {
        let total = self.shared.total_len;
        let mut state = self.shared.state.lock();

        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(offset) => state.cursor as i128 + offset as i128,
            SeekFrom::End(offset) => total as i128 + offset as i128,
        };

        if target < 0 || target > total as i128 {
            return Err(StreamError::OutOfBounds {
                requested: target,
                total,
            });
        }

        state.cursor = target as u64;
        state.done = state.closed || state.cursor == total;
        Ok(state.cursor)
    }

    /// Stop buffering, drop the buffer and release the source. Idempotent.
    pub fn close(&self) -> Result<(), StreamError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the sender wakes and ends the buffering thread
        drop(self.shared.cancel.lock().take());

        let mut state = self.shared.state.lock();
        state.closed = true;
        state.done = true;
        state.buffered = true;
        state.buffer = Vec::new();

        if let Some(mut source) = state.source.take() {
            source.close()?;
        }
        debug!("Closed buffered stream of {} bytes", self.shared.total_len);
        Ok(())
    }
}

fn run_buffering(shared: Weak<Shared>, config: BufferingConfig, cancel_rx: mpsc::Receiver<()>) {
    loop {
        {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if !shared.buffer_tick(&config) {
                return;
            }
        }

        match cancel_rx.recv_timeout(config.period) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => return,
        }
    }
}

impl Read for BufferedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_at_cursor(buf)?)
    }
}

impl Seek for BufferedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.seek_to(pos)?)
    }
}

impl symphonia::core::io::MediaSource for BufferedStream {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.shared.total_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pattern, MemorySource};

    fn idle_config() -> BufferingConfig {
        BufferingConfig {
            chunk_size: 256,
            watermark: 0,
            period: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_linear_read_returns_source_bytes() {
        let data = pattern(10_000);
        let source = MemorySource::new(data.clone());
        let mut stream = BufferedStream::new(Box::new(source), data.len() as u64, idle_config());

        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();

        assert_eq!(out, data);
        assert!(stream.is_done());
        assert_eq!(stream.progress(), 1.0);
    }

    #[test]
    fn test_forward_seek_pulls_gap_on_read() {
        let data = pattern(4096);
        let source = MemorySource::new(data.clone()).with_max_read(100);
        let mut stream = BufferedStream::new(Box::new(source), 4096, idle_config());

        stream.seek(SeekFrom::Start(3000)).unwrap();
        let mut buf = [0u8; 64];
        stream.read_exact(&mut buf).unwrap();

        assert_eq!(&buf[..], &data[3000..3064]);
        assert_eq!(stream.position(), 3064);

        // The gap is now buffered and can be re-read
        stream.seek(SeekFrom::Start(10)).unwrap();
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[10..74]);
    }

    #[test]
    fn test_seek_out_of_range_keeps_cursor() {
        let source = MemorySource::new(pattern(100));
        let mut stream = BufferedStream::new(Box::new(source), 100, idle_config());
        stream.seek(SeekFrom::Start(40)).unwrap();

        let err = stream.seek(SeekFrom::Start(101)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = stream.seek(SeekFrom::Current(-41)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        assert_eq!(stream.position(), 40);
    }

    #[test]
    fn test_seek_to_end_marks_done() {
        let source = MemorySource::new(pattern(100));
        let mut stream = BufferedStream::new(Box::new(source), 100, idle_config());

        assert_eq!(stream.seek(SeekFrom::End(0)).unwrap(), 100);
        assert!(stream.is_done());

        stream.seek(SeekFrom::Current(-1)).unwrap();
        assert!(!stream.is_done());
    }

    #[test]
    fn test_premature_source_end_is_unexpected_eof() {
        let source = MemorySource::new(pattern(50));
        let mut stream = BufferedStream::new(Box::new(source), 100, idle_config());

        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(out.len(), 50);
    }

    #[test]
    fn test_close_is_idempotent_and_reads_end() {
        let source = MemorySource::new(pattern(1000));
        let releases = source.release_counter();
        let mut stream = BufferedStream::new(Box::new(source), 1000, idle_config());

        stream.close().unwrap();
        stream.close().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert!(stream.is_done());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_source_released_once_after_exhaustion_and_close() {
        let data = pattern(300);
        let source = MemorySource::new(data);
        let releases = source.release_counter();
        let mut stream = BufferedStream::new(Box::new(source), 300, idle_config());

        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        stream.close().unwrap();

        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_last_handle_releases_source() {
        let source = MemorySource::new(pattern(300));
        let releases = source.release_counter();
        let stream = BufferedStream::new(Box::new(source), 300, idle_config());
        let clone = stream.clone();

        drop(stream);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        drop(clone);

        // The buffering thread may hold the last reference for a moment
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while releases.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
