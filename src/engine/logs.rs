//! Serialising log sinks for step output.
//!
//! Each step log (script, after-script, container, service) is owned by a
//! single writer task fed through a channel: chunks arrive from however
//! many stream readers exist, and ordering is by arrival at the sink.
//! Secrets are masked before anything reaches the terminal or disk.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::variables::mask_secrets;

enum SinkEvent {
    Out(String),
    Err(String),
}

/// A per-file log sink. Clones share the same writer task.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

/// Handle used to flush and close the sink once all writers are done.
pub struct LogSinkGuard {
    task: JoinHandle<()>,
}

impl LogSink {
    /// Opens the sink, creating the log file. When `echo` is set, chunks
    /// are mirrored to the terminal.
    pub async fn create(
        path: PathBuf,
        secrets: Vec<String>,
        echo: bool,
    ) -> std::io::Result<(Self, LogSinkGuard)> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&path).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<SinkEvent>();

        let task = tokio::spawn(async move {
            use std::io::Write;

            while let Some(event) = rx.recv().await {
                let (chunk, is_err) = match event {
                    SinkEvent::Out(chunk) => (chunk, false),
                    SinkEvent::Err(chunk) => (chunk, true),
                };

                let masked = mask_secrets(&chunk, &secrets);

                if let Err(e) = file.write_all(masked.as_bytes()).await {
                    warn!(path = %path.display(), "failed to write log: {e}");
                }

                if echo {
                    if is_err {
                        let mut stderr = std::io::stderr().lock();
                        let _ = stderr.write_all(masked.as_bytes());
                        let _ = stderr.flush();
                    } else {
                        let mut stdout = std::io::stdout().lock();
                        let _ = stdout.write_all(masked.as_bytes());
                        let _ = stdout.flush();
                    }
                }
            }

            let _ = file.flush().await;
        });

        Ok((Self { tx }, LogSinkGuard { task }))
    }

    /// Writes a stdout chunk. Order is the order of calls.
    pub fn out(&self, chunk: impl Into<String>) {
        let _ = self.tx.send(SinkEvent::Out(chunk.into()));
    }

    /// Writes a stderr chunk.
    pub fn err(&self, chunk: impl Into<String>) {
        let _ = self.tx.send(SinkEvent::Err(chunk.into()));
    }
}

impl LogSinkGuard {
    /// Waits for every pending chunk to hit the file. All sink clones
    /// must be dropped first or this waits forever.
    pub async fn close(self) {
        let _ = self.task.await;
    }
}

/// Closes a sink pair: drops the sender, then drains the writer.
pub async fn close_sink(sink: LogSink, guard: LogSinkGuard) {
    drop(sink);
    guard.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_writes_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step.log");

        let (sink, guard) = LogSink::create(path.clone(), Vec::new(), false)
            .await
            .unwrap();

        sink.out("line one\n");
        sink.err("line two\n");
        sink.out("line three\n");

        close_sink(sink, guard).await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "line one\nline two\nline three\n");
    }

    #[tokio::test]
    async fn test_sink_masks_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step.log");

        let (sink, guard) = LogSink::create(path.clone(), vec!["hunter2".to_string()], false)
            .await
            .unwrap();

        sink.out("the password is hunter2\n");
        close_sink(sink, guard).await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("hunter2"));
        assert!(content.contains("****"));
    }

    #[tokio::test]
    async fn test_sink_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/step.log");

        let (sink, guard) = LogSink::create(path.clone(), Vec::new(), false)
            .await
            .unwrap();
        sink.out("hello");
        close_sink(sink, guard).await;

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }
}
