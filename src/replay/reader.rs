//! Catch-up reader: replays every captured stream from the beginning, then
//! keeps following it with long polls.

use crate::delivery::counters::DeliveryCounters;
use crate::delivery::error::{DeliveryError, DeliveryResult, ErrorClass};
use crate::delivery::traits::{EventLog, StreamSlice};
use crate::replay::config::ReplayConfig;
use crate::replay::gate::ReplayGate;
use crate::replay::handler::EventHandler;
use crate::replay::progress::{ProgressSnapshot, ReplayProgress};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Capture {
    stream: String,
    handler: Arc<dyn EventHandler>,
}

/// Registers streams and spawns one reader task per stream
pub struct ReplayReader {
    log: Arc<dyn EventLog>,
    config: ReplayConfig,
    counters: Arc<DeliveryCounters>,
    captures: Vec<Capture>,
}

impl ReplayReader {
    pub fn new(log: Arc<dyn EventLog>, config: ReplayConfig, counters: Arc<DeliveryCounters>) -> Self {
        Self {
            log,
            config,
            counters,
            captures: Vec::new(),
        }
    }

    /// Replay `stream` from version 0 into `handler`
    pub fn capture(&mut self, stream: impl Into<String>, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.captures.push(Capture {
            stream: stream.into(),
            handler,
        });
        self
    }

    pub fn streams(&self) -> Vec<&str> {
        self.captures.iter().map(|c| c.stream.as_str()).collect()
    }

    /// Spawn the reader tasks. The returned gate fires once every stream has
    /// been read to its end.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> ReplayHandle {
        let gate = Arc::new(ReplayGate::new(self.captures.len()));
        let started_at = Instant::now();
        let mut progress = Vec::with_capacity(self.captures.len());
        let mut tasks = Vec::with_capacity(self.captures.len());

        info!(
            event_log = %self.log.name(),
            streams = self.captures.len(),
            "Starting event replay"
        );

        for capture in self.captures {
            let stream_progress = Arc::new(ReplayProgress::new(capture.stream.clone()));
            progress.push(stream_progress.clone());

            let task = StreamTask {
                log: self.log.clone(),
                config: self.config.clone(),
                counters: self.counters.clone(),
                gate: gate.clone(),
                progress: stream_progress,
                stream: capture.stream,
                handler: capture.handler,
                started_at,
                shutdown: shutdown.clone(),
            };

            tasks.push(tokio::spawn(task.run()));
        }

        ReplayHandle { gate, progress, tasks }
    }
}

/// Running replay
pub struct ReplayHandle {
    pub gate: Arc<ReplayGate>,
    pub progress: Vec<Arc<ReplayProgress>>,
    pub tasks: Vec<JoinHandle<DeliveryResult<()>>>,
}

impl ReplayHandle {
    pub fn snapshot(&self) -> Vec<ProgressSnapshot> {
        self.progress.iter().map(|p| p.snapshot()).collect()
    }

    /// Wait for the reader tasks, returning as soon as one of them fails
    pub async fn join(self) -> DeliveryResult<()> {
        let mut pending: FuturesUnordered<_> = self.tasks.into_iter().collect();

        while let Some(joined) = pending.next().await {
            joined.unwrap_or_else(|e| Err(DeliveryError::Fatal(format!("Replay task failed: {}", e))))?;
        }

        Ok(())
    }
}

struct StreamTask {
    log: Arc<dyn EventLog>,
    config: ReplayConfig,
    counters: Arc<DeliveryCounters>,
    gate: Arc<ReplayGate>,
    progress: Arc<ReplayProgress>,
    stream: String,
    handler: Arc<dyn EventHandler>,
    started_at: Instant,
    shutdown: watch::Receiver<bool>,
}

impl StreamTask {
    async fn run(mut self) -> DeliveryResult<()> {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let position = self.progress.position();
            let long_poll = self
                .progress
                .has_reached_end()
                .then(|| self.config.long_poll());

            let read = self
                .log
                .read_forward(&self.stream, position, self.config.page_size, long_poll);

            let result = tokio::select! {
                result = read => result,
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match result {
                Ok(StreamSlice::Events(events)) if !events.is_empty() => {
                    for event in events {
                        self.progress.advance_to(event.version + 1);

                        if event.is_placeholder() {
                            self.progress.record_skipped();
                            debug!(stream = %self.stream, version = event.version, "Skipping empty event");
                            continue;
                        }

                        self.counters.record_received();
                        self.progress.record_forwarded();

                        if let Err(e) = self.handler.handle(&event).await {
                            self.progress.record_handler_failure();
                            warn!(
                                stream = %self.stream,
                                version = event.version,
                                error = %e,
                                "Handler failed to process replayed event"
                            );
                        }
                    }
                }
                Ok(_) => self.reached_end(),
                Err(e) => {
                    if self.handle_read_error(e).await? {
                        break;
                    }
                }
            }
        }

        debug!(stream = %self.stream, "Replay reader stopped");
        Ok(())
    }

    fn reached_end(&self) {
        if !self.progress.mark_reached_end() {
            return;
        }

        info!(
            stream = %self.stream,
            events = self.progress.forwarded(),
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "All events in stream replayed"
        );
        self.gate.arrive();
    }

    /// Returns Ok(true) when shutdown was requested while backing off
    async fn handle_read_error(&mut self, err: DeliveryError) -> DeliveryResult<bool> {
        match err.class() {
            ErrorClass::NotFound => match self.log.create_stream(&self.stream).await {
                Ok(()) => {
                    info!(stream = %self.stream, "Created empty stream");
                    Ok(false)
                }
                Err(e) if e.class() == ErrorClass::Fatal => {
                    error!(stream = %self.stream, error = %e, "Cannot create empty stream");
                    Err(e)
                }
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "Cannot create empty stream, will retry");
                    Ok(self.pause(self.config.unavailable_backoff()).await)
                }
            },
            ErrorClass::Transient => {
                warn!(
                    stream = %self.stream,
                    error = %err,
                    "Cannot connect to the event log, retrying in {:?}",
                    self.config.unavailable_backoff()
                );
                Ok(self.pause(self.config.unavailable_backoff()).await)
            }
            ErrorClass::Permanent | ErrorClass::Fatal => {
                // Undecodable events never reach here, the log client skips
                // them; a refused read is retried from the same position
                warn!(
                    stream = %self.stream,
                    version = self.progress.position(),
                    error = %err,
                    "Event log refused the read, retrying in {:?}",
                    self.config.unavailable_backoff()
                );
                Ok(self.pause(self.config.unavailable_backoff()).await)
            }
        }
    }

    /// Sleep unless shutdown comes first; true means shut down
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => *self.shutdown.borrow(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }
}
