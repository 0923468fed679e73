//! Multi-destination log broadcaster.
//!
//! A [`LogSink`] owns one durable destination (the build's log file) and any
//! number of ephemeral subscribers. Every [`LogSink::write`] fans the chunk
//! out to all destinations in registration order while holding one lock, so
//! concurrent writers never interleave inside a chunk.
//!
//! Failure policy is fail-fast: the first destination that errors fails the
//! call and the remaining destinations do not receive that chunk. A failing
//! subscriber is detached afterwards; a failing log file is not.
//!
//! Subscribers only see bytes written after they attached. Full history has
//! to be read from the log file.

use bytes::Bytes;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("log sink is closed")]
    Closed,

    #[error("could not create log file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("log file write failed: {0}")]
    Durable(#[source] io::Error),

    #[error("log subscriber {id} failed: {source}")]
    Subscriber {
        id: u64,
        #[source]
        source: io::Error,
    },
}

impl SinkError {
    /// True when only an ephemeral subscriber failed; the log file is intact.
    pub fn is_subscriber(&self) -> bool {
        matches!(self, SinkError::Subscriber { .. })
    }
}

/// An append-only byte destination.
pub trait LogDestination: Send {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FileDestination {
    file: File,
}

impl LogDestination for FileDestination {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

struct ChannelDestination {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl LogDestination for ChannelDestination {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "subscriber went away"))
    }
}

struct Slot {
    id: u64,
    durable: bool,
    destination: Box<dyn LogDestination>,
}

struct SinkState {
    slots: Vec<Slot>,
    next_id: u64,
    closed: bool,
}

/// Live byte stream from a [`LogSink`]. Ends when the sink closes.
#[derive(Debug)]
pub struct LogSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl LogSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next chunk, or `None` once the sink has closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn into_inner(self) -> mpsc::UnboundedReceiver<Bytes> {
        self.rx
    }
}

pub struct LogSink {
    path: PathBuf,
    state: Mutex<SinkState>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LogSink {
    /// Create the log file (and its parent directories) as the durable
    /// destination. An existing file is truncated.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let create_err = |source| SinkError::Create {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(create_err)?;
        }
        let file = File::create(&path).map_err(create_err)?;

        Ok(Self {
            state: Mutex::new(SinkState {
                slots: vec![Slot {
                    id: 0,
                    durable: true,
                    destination: Box::new(FileDestination { file }),
                }],
                next_id: 1,
                closed: false,
            }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an extra ephemeral destination. Returns its id.
    pub fn attach(&self, destination: Box<dyn LogDestination>) -> Result<u64, SinkError> {
        let mut state = self.lock();
        if state.closed {
            return Err(SinkError::Closed);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.slots.push(Slot {
            id,
            durable: false,
            destination,
        });
        Ok(id)
    }

    /// Attach a channel subscriber receiving every chunk written from now on.
    pub fn subscribe(&self) -> Result<LogSubscription, SinkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.attach(Box::new(ChannelDestination { tx }))?;
        debug!(path = %self.path.display(), subscriber = id, "Log subscriber attached");
        Ok(LogSubscription { id, rx })
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| !s.durable).count()
    }

    /// Fan `chunk` out to every destination, stopping at the first failure.
    pub fn write(&self, chunk: &[u8]) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.closed {
            return Err(SinkError::Closed);
        }

        let failure = state
            .slots
            .iter_mut()
            .enumerate()
            .find_map(|(idx, slot)| slot.destination.write_chunk(chunk).err().map(|e| (idx, e)));

        match failure {
            None => Ok(()),
            Some((idx, source)) if state.slots[idx].durable => Err(SinkError::Durable(source)),
            Some((idx, source)) => {
                let slot = state.slots.remove(idx);
                debug!(subscriber = slot.id, error = %source, "Detached failing log subscriber");
                Err(SinkError::Subscriber {
                    id: slot.id,
                    source,
                })
            }
        }
    }

    /// Write `line` followed by a newline.
    pub fn write_line(&self, line: &str) -> Result<(), SinkError> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.write(buf.as_bytes())
    }

    /// Flush and release every destination. Subscribers see end of stream.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let mut result = Ok(());
        for mut slot in state.slots.drain(..) {
            if let Err(e) = slot.destination.flush() {
                if slot.durable {
                    result = Err(SinkError::Durable(e));
                }
            }
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Recording(Arc<Mutex<Vec<u8>>>);

    impl LogDestination for Recording {
        fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
            self.0.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        }
    }

    struct Broken;

    impl LogDestination for Broken {
        fn write_chunk(&mut self, _chunk: &[u8]) -> io::Result<()> {
            Err(io::Error::other("broken destination"))
        }
    }

    fn temp_sink() -> (tempfile::TempDir, LogSink) {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::create(dir.path().join("nested/project_1/build_1.log")).unwrap();
        (dir, sink)
    }

    #[test]
    fn test_create_makes_parent_directories() {
        let (_dir, sink) = temp_sink();
        assert!(sink.path().exists());
    }

    #[test]
    fn test_writes_reach_file_in_order() {
        let (_dir, sink) = temp_sink();
        sink.write(b"first\n").unwrap();
        sink.write_line("second").unwrap();
        sink.close().unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_later_writes() {
        let (_dir, sink) = temp_sink();
        sink.write_line("before").unwrap();

        let mut sub = sink.subscribe().unwrap();
        sink.write_line("after").unwrap();
        sink.close().unwrap();

        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"after\n"));
        assert!(sub.recv().await.is_none(), "stream ends on close");

        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content, "before\nafter\n");
    }

    #[test]
    fn test_failure_skips_remaining_destinations() {
        let (_dir, sink) = temp_sink();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let broken = sink.attach(Box::new(Broken)).unwrap();
        sink.attach(Box::new(Recording(seen.clone()))).unwrap();

        let err = sink.write(b"chunk-1\n").unwrap_err();
        assert!(matches!(err, SinkError::Subscriber { id, .. } if id == broken));
        assert!(seen.lock().unwrap().is_empty(), "later destination skipped");

        // The failing subscriber is gone; the next write reaches everyone left.
        sink.write(b"chunk-2\n").unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), b"chunk-2\n");
        assert_eq!(sink.subscriber_count(), 1);

        sink.close().unwrap();
        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content, "chunk-1\nchunk-2\n");
    }

    #[test]
    fn test_dropped_subscriber_fails_one_write() {
        let (_dir, sink) = temp_sink();
        let sub = sink.subscribe().unwrap();
        drop(sub);

        let err = sink.write_line("lost").unwrap_err();
        assert!(err.is_subscriber());
        sink.write_line("kept").unwrap();
    }

    #[test]
    fn test_write_after_close_fails() {
        let (_dir, sink) = temp_sink();
        sink.close().unwrap();
        assert!(sink.is_closed());
        assert!(matches!(sink.write(b"late"), Err(SinkError::Closed)));
        assert!(matches!(sink.subscribe(), Err(SinkError::Closed)));
        sink.close().unwrap();
    }

    #[test]
    fn test_create_fails_for_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let result = LogSink::create(blocker.join("build.log"));
        assert!(matches!(result, Err(SinkError::Create { .. })));
    }

    #[test]
    fn test_concurrent_writers_do_not_interleave() {
        let (_dir, sink) = temp_sink();
        let sink = Arc::new(sink);
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        sink.write_line(&format!("writer-{}-line-{}", n, i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        sink.close().unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 200);
        assert!(lines.iter().all(|l| l.starts_with("writer-") && l.contains("-line-")));
    }
}
