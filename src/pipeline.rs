//! Threads and wiring: source -> detector -> aggregator -> queue -> sink.
//!
//! - processing thread: pulls frames, runs the detector and aggregator, pushes
//!   sealed events and applies persistence acks;
//! - persistence thread: pops the queue and calls the sink, one event at a time;
//! - retention thread (optional): periodic sweeps over the event store.
//!
//! Shutdown seals every open event with `SealReason::Shutdown`, closes the queue
//! and gives the persistence thread a grace period to drain. Events still queued
//! after that are abandoned and logged. Acks that arrive after the processing
//! thread has stopped are applied once the persistence thread is joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::config::FallwatchConfig;
use crate::event::{
    AggregatorSettings, AggregatorStats, EventAck, EventAggregator, SealReason, SealedEvent,
};
use crate::fsm::{DetectorSettings, FallDetector, FrameDisposition};
use crate::history::{PoseHistory, MAX_HISTORY_FRAMES};
use crate::queue::{EventQueue, PushOutcome, QueueStats};
use crate::retention::{RetentionHandle, RetentionManager};
use crate::sink::PersistenceSink;
use crate::source::PoseSource;

const POP_INTERVAL: Duration = Duration::from_millis(100);
/// Stream time between idle-subject scans.
const EXPIRY_SCAN_MS: u64 = 1_000;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub camera_id: String,
    pub fps: u32,
    pub detector: DetectorSettings,
    pub aggregator: AggregatorSettings,
    pub queue_capacity: usize,
    pub shutdown_grace: Duration,
    pub sweep_interval: Duration,
    pub health_interval: Duration,
    /// Sequence number of the first event id minted by this run.
    pub first_event_seq: u64,
}

impl PipelineConfig {
    pub fn from_config(cfg: &FallwatchConfig) -> Self {
        Self {
            camera_id: cfg.camera.camera_id.clone(),
            fps: cfg.camera.fps,
            detector: cfg.detector_settings(),
            aggregator: cfg.aggregator_settings(),
            queue_capacity: cfg.events.queue_capacity,
            shutdown_grace: cfg.events.shutdown_grace,
            sweep_interval: cfg.sweep_interval,
            health_interval: Duration::from_secs(30),
            first_event_seq: 1,
        }
    }

    /// Per-subject pre-roll history sized for the configured frame rate.
    fn history(&self) -> PoseHistory {
        let frames = (self.aggregator.pre_roll_ms * self.fps.max(1) as u64 / 1_000 + 1) as usize;
        PoseHistory::new(self.aggregator.pre_roll_ms, frames.min(MAX_HISTORY_FRAMES))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub low_confidence: u64,
    pub out_of_order: u64,
    pub subjects_expired: u64,
    pub events: AggregatorStats,
    pub queue: QueueStats,
    pub persisted: u64,
    pub failed: u64,
    pub abandoned: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct ProcessingSummary {
    frames: u64,
    low_confidence: u64,
    out_of_order: u64,
    subjects_expired: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct PersistSummary {
    persisted: u64,
    failed: u64,
}

pub struct Pipeline;

impl Pipeline {
    pub fn start(
        config: PipelineConfig,
        source: Box<dyn PoseSource>,
        sink: Box<dyn PersistenceSink>,
        retention: Option<RetentionManager>,
    ) -> Result<PipelineHandle> {
        config.detector.validate()?;
        crate::validate_camera_id(&config.camera_id)?;

        let queue = Arc::new(EventQueue::new(config.queue_capacity));
        let shutdown = Arc::new(AtomicBool::new(false));
        let grace_deadline = Arc::new(Mutex::new(None));
        let (ack_tx, ack_rx) = mpsc::channel();

        let processor = Processor {
            detector: FallDetector::new(config.detector)?,
            aggregator: EventAggregator::new(&config.camera_id, config.aggregator, config.detector)
                .with_first_seq(config.first_event_seq),
            history: config.history(),
            queue: queue.clone(),
            acks: ack_rx,
            shutdown: shutdown.clone(),
            health_interval: config.health_interval,
            summary: ProcessingSummary::default(),
        };
        let processing = std::thread::Builder::new()
            .name("fall-detect".into())
            .spawn(move || processor.run(source))?;

        let worker = PersistWorker {
            queue: queue.clone(),
            acks: ack_tx,
            grace_deadline: grace_deadline.clone(),
        };
        let persistence = std::thread::Builder::new()
            .name("fall-persist".into())
            .spawn(move || worker.run(sink))?;

        let retention = match retention {
            Some(manager) => Some(manager.spawn(config.sweep_interval)?),
            None => None,
        };

        log::info!(
            "pipeline started: camera={} queue_capacity={} pre_roll_ms={}",
            config.camera_id,
            queue.capacity(),
            config.aggregator.pre_roll_ms
        );
        Ok(PipelineHandle {
            shutdown,
            grace: config.shutdown_grace,
            grace_deadline,
            queue,
            processing: Some(processing),
            persistence: Some(persistence),
            retention,
        })
    }
}

pub struct PipelineHandle {
    shutdown: Arc<AtomicBool>,
    grace: Duration,
    grace_deadline: Arc<Mutex<Option<Instant>>>,
    queue: Arc<EventQueue>,
    processing: Option<JoinHandle<(Processor, Result<()>)>>,
    persistence: Option<JoinHandle<PersistSummary>>,
    retention: Option<RetentionHandle>,
}

impl PipelineHandle {
    /// True once the source has ended (or failed) and the processing thread exited.
    pub fn source_finished(&self) -> bool {
        self.processing
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    /// Request shutdown and drain within the grace period.
    pub fn stop(self) -> Result<PipelineStats> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.finish()
    }

    /// Run until the source ends, then drain within the grace period.
    pub fn wait(self) -> Result<PipelineStats> {
        self.finish()
    }

    fn finish(mut self) -> Result<PipelineStats> {
        let mut processing = match self.processing.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("processing thread panicked")),
            None => Err(anyhow!("pipeline already finished")),
        };
        if processing.is_err() {
            // Nothing will close the queue otherwise.
            self.queue.close();
        }
        // Processing has sealed and closed the queue; start the grace clock.
        if let Ok(mut deadline) = self.grace_deadline.lock() {
            *deadline = Some(Instant::now() + self.grace);
        }
        // A worker that panicked has persisted nothing we can count.
        let persisted = match self.persistence.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                log::error!("persistence thread panicked");
                PersistSummary::default()
            }),
            None => PersistSummary::default(),
        };
        if let Ok((processor, _)) = processing.as_mut() {
            processor.apply_acks();
        }

        let abandoned = self.queue.drain_remaining();
        for sealed in &abandoned {
            log::warn!(
                "event {} abandoned at shutdown (not persisted within {:?})",
                sealed.id(),
                self.grace
            );
        }

        if let Some(retention) = self.retention.take() {
            retention.stop()?;
        }

        let (processor, outcome) = processing?;
        outcome?;
        let summary = processor.summary;
        let stats = PipelineStats {
            frames: summary.frames,
            low_confidence: summary.low_confidence,
            out_of_order: summary.out_of_order,
            subjects_expired: summary.subjects_expired,
            events: processor.aggregator.stats(),
            queue: self.queue.stats(),
            persisted: persisted.persisted,
            failed: persisted.failed,
            abandoned: abandoned.len() as u64,
        };
        log::info!(
            "pipeline stopped: frames={} events={} persisted={} failed={} lost={} dropped={} abandoned={}",
            stats.frames,
            stats.events.sealed,
            stats.persisted,
            stats.failed,
            stats.events.lost,
            stats.queue.dropped,
            stats.abandoned
        );
        Ok(stats)
    }
}

struct Processor {
    detector: FallDetector,
    aggregator: EventAggregator,
    history: PoseHistory,
    queue: Arc<EventQueue>,
    acks: Receiver<EventAck>,
    shutdown: Arc<AtomicBool>,
    health_interval: Duration,
    summary: ProcessingSummary,
}

impl Processor {
    /// Hands itself back so late acks can still reach the aggregator.
    fn run(mut self, mut source: Box<dyn PoseSource>) -> (Self, Result<()>) {
        let mut last_health = Instant::now();
        let mut last_expiry_scan: Option<u64> = None;
        let mut outcome = Ok(());

        while !self.shutdown.load(Ordering::SeqCst) {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => Arc::new(frame),
                Ok(None) => break,
                Err(e) => {
                    log::error!("pose source failed: {:#}", e);
                    outcome = Err(e);
                    break;
                }
            };
            self.summary.frames += 1;

            let verdict = self.detector.process(&frame);
            match verdict.disposition {
                FrameDisposition::Scored => {}
                FrameDisposition::LowConfidence => self.summary.low_confidence += 1,
                FrameDisposition::OutOfOrder => self.summary.out_of_order += 1,
            }
            if let Some(sealed) = self.aggregator.ingest(&verdict, &frame, &self.history) {
                self.enqueue(sealed);
            }
            if verdict.disposition != FrameDisposition::OutOfOrder {
                self.history.push(frame.clone());
            }

            let now_ms = frame.ts_ms;
            for sealed in self.aggregator.release_post_roll(now_ms) {
                self.enqueue(sealed);
            }
            if last_expiry_scan.map_or(true, |t| now_ms.saturating_sub(t) >= EXPIRY_SCAN_MS) {
                last_expiry_scan = Some(now_ms);
                self.expire_subjects(now_ms);
            }
            self.apply_acks();

            if last_health.elapsed() >= self.health_interval {
                last_health = Instant::now();
                self.log_health();
            }
        }

        for sealed in self.aggregator.seal_all(SealReason::Shutdown) {
            self.enqueue(sealed);
        }
        self.queue.close();
        self.apply_acks();
        log::info!("processing stopped after {} frames", self.summary.frames);
        (self, outcome)
    }

    fn expire_subjects(&mut self, now_ms: u64) {
        for subject in self.detector.expire_idle(now_ms) {
            self.summary.subjects_expired += 1;
            self.history.forget(&subject);
            if let Some(sealed) = self.aggregator.seal_subject(&subject, SealReason::SubjectLost) {
                self.enqueue(sealed);
            }
        }
    }

    fn enqueue(&mut self, sealed: SealedEvent) {
        match self.queue.push(sealed) {
            PushOutcome::Queued => {}
            PushOutcome::QueuedDroppedOldest(dropped) => {
                log::error!("event {} lost: persistence queue overflow", dropped.id());
            }
            PushOutcome::Closed(rejected) => {
                log::error!("event {} lost: queue already closed", rejected.id());
            }
        }
    }

    fn apply_acks(&mut self) {
        while let Ok(ack) = self.acks.try_recv() {
            self.aggregator.acknowledge(&ack);
        }
    }

    fn log_health(&self) {
        let queue = self.queue.stats();
        let events = self.aggregator.stats();
        log::info!(
            "health: frames={} subjects={} open_events={} post_roll={} sealed={} persisted={} lost={} queue_depth={} dropped={}",
            self.summary.frames,
            self.detector.tracked_subjects(),
            self.aggregator.open_count(),
            self.aggregator.post_roll_count(),
            events.sealed,
            events.persisted,
            events.lost,
            queue.depth,
            queue.dropped
        );
    }
}

struct PersistWorker {
    queue: Arc<EventQueue>,
    acks: Sender<EventAck>,
    grace_deadline: Arc<Mutex<Option<Instant>>>,
}

impl PersistWorker {
    fn run(self, mut sink: Box<dyn PersistenceSink>) -> PersistSummary {
        let mut summary = PersistSummary::default();
        loop {
            if self.grace_expired() {
                if !self.queue.is_empty() {
                    log::warn!(
                        "shutdown grace period elapsed with {} events queued",
                        self.queue.len()
                    );
                }
                break;
            }
            let Some(sealed) = self.queue.pop_timeout(POP_INTERVAL) else {
                if self.queue.is_closed() && self.queue.is_empty() {
                    break;
                }
                continue;
            };
            let ack = sink.persist(&sealed);
            if ack.is_success() {
                summary.persisted += 1;
            } else {
                summary.failed += 1;
            }
            // The receiver lives until the handle has applied the final acks.
            let _ = self.acks.send(ack);
        }
        summary
    }

    fn grace_expired(&self) -> bool {
        self.grace_deadline
            .lock()
            .ok()
            .and_then(|deadline| *deadline)
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}
