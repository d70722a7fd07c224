use crate::context::RelayContext;
use crate::debug::{trace_apply, trace_send};
use crate::error::{RelayError, Result};
use crate::frame::{frame_len, inspect};
use crate::interest::{Backpressure, InterestConfig};
use crate::muscles::Quality;
use crate::participant::{Participant, ParticipantRegistry};
use crate::pool::Pool;
use crate::protocol::{write_participant_notice, write_pose_envelope, MessageType, ParticipantId};
use crate::repack::{repack_all, QualityFrames};
use crate::transport::{DeliveryMethod, Peer};
use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const BATCH_POOL: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_period_ms: u64,
    pub backpressure_limit: usize,
    pub pose_channel: u8,
    pub pose_delivery: DeliveryMethod,
    /// Delivery for join/leave notices.
    pub control_delivery: DeliveryMethod,
    pub interest: InterestConfig,
    pub quaternion_tolerance: f32,
    /// 0 lets rayon pick.
    pub worker_threads: usize,
    pub notify_leave: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 5,
            backpressure_limit: 2048,
            pose_channel: 1,
            pose_delivery: DeliveryMethod::Sequenced,
            control_delivery: DeliveryMethod::ReliableOrdered,
            interest: InterestConfig::default(),
            quaternion_tolerance: 0.02,
            worker_threads: 0,
            notify_leave: true,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON document. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_backpressure_limit(mut self, limit: usize) -> Self {
        self.backpressure_limit = limit;
        self
    }

    pub fn with_pose_channel(mut self, channel: u8, delivery: DeliveryMethod) -> Self {
        self.pose_channel = channel;
        self.pose_delivery = delivery;
        self
    }

    pub fn with_interest(mut self, interest: InterestConfig) -> Self {
        self.interest = interest;
        self
    }

    pub fn with_quaternion_tolerance(mut self, tolerance: f32) -> Self {
        self.quaternion_tolerance = tolerance;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_leave_notices(mut self, enabled: bool) -> Self {
        self.notify_leave = enabled;
        self
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn backpressure(&self) -> Backpressure {
        Backpressure::new(self.backpressure_limit)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_period_ms == 0 {
            return Err(RelayError::InvalidConfig("tick period must be non-zero".to_string()));
        }
        if !(self.quaternion_tolerance.is_finite() && self.quaternion_tolerance >= 0.0) {
            return Err(RelayError::InvalidConfig(format!(
                "quaternion tolerance must be a non-negative number, got {}",
                self.quaternion_tolerance
            )));
        }
        self.interest.validate()
    }
}

/// Latest undrained update from one sender.
struct InboundPose<P> {
    peer: Arc<P>,
    data: Bytes,
}

type InboundMap<P> = AHashMap<ParticipantId, InboundPose<P>>;
type InboundBatch<P> = Vec<(ParticipantId, InboundPose<P>)>;
type ParticipantList<P> = Vec<Arc<Participant<P>>>;

/// Counts for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub applied: u64,
    pub rejected: u64,
    /// Applied, but every quality serves the source frame.
    pub degraded: u64,
    pub removed: u64,
    pub sent: u64,
    pub skipped_backpressure: u64,
    pub skipped_disconnected: u64,
    pub skipped_interval: u64,
    pub send_failures: u64,
    pub duration: Duration,
}

impl TickReport {
    fn merge(mut self, other: Self) -> Self {
        self.applied += other.applied;
        self.rejected += other.rejected;
        self.degraded += other.degraded;
        self.removed += other.removed;
        self.sent += other.sent;
        self.skipped_backpressure += other.skipped_backpressure;
        self.skipped_disconnected += other.skipped_disconnected;
        self.skipped_interval += other.skipped_interval;
        self.send_failures += other.send_failures;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub overruns: u64,
    pub applied: u64,
    pub rejected: u64,
    pub degraded: u64,
    pub removed: u64,
    pub sent: u64,
    pub skipped_backpressure: u64,
    pub send_failures: u64,
    pub active: usize,
}

#[derive(Default)]
struct Totals {
    ticks: AtomicU64,
    overruns: AtomicU64,
    applied: AtomicU64,
    rejected: AtomicU64,
    degraded: AtomicU64,
    removed: AtomicU64,
    sent: AtomicU64,
    skipped_backpressure: AtomicU64,
    send_failures: AtomicU64,
}

impl Totals {
    fn add(&self, report: &TickReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.applied.fetch_add(report.applied, Ordering::Relaxed);
        self.rejected.fetch_add(report.rejected, Ordering::Relaxed);
        self.degraded.fetch_add(report.degraded, Ordering::Relaxed);
        self.removed.fetch_add(report.removed, Ordering::Relaxed);
        self.sent.fetch_add(report.sent, Ordering::Relaxed);
        self.skipped_backpressure.fetch_add(report.skipped_backpressure, Ordering::Relaxed);
        self.send_failures.fetch_add(report.send_failures, Ordering::Relaxed);
    }
}

/// Drives the drain, apply, removal and fan-out phases once per tick.
///
/// `submit` and `remove` may be called from any thread. `tick` must only be
/// driven by one loop at a time.
pub struct Scheduler<P: Peer + 'static> {
    config: SchedulerConfig,
    backpressure: Backpressure,
    context: Arc<RelayContext>,
    registry: ParticipantRegistry<P>,
    inbound: Mutex<InboundMap<P>>,
    inbound_maps: Pool<InboundMap<P>>,
    batches: Pool<InboundBatch<P>>,
    participant_lists: Pool<ParticipantList<P>>,
    removals: Mutex<VecDeque<ParticipantId>>,
    workers: rayon::ThreadPool,
    started: Instant,
    totals: Totals,
}

impl<P: Peer + 'static> Scheduler<P> {
    pub fn new(config: SchedulerConfig, context: Arc<RelayContext>) -> Result<Self> {
        config.validate()?;

        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("pose-relay-{}", i))
            .build()
            .map_err(|e| RelayError::InvalidConfig(format!("worker pool: {}", e)))?;

        Ok(Self {
            backpressure: config.backpressure(),
            config,
            context,
            registry: ParticipantRegistry::new(),
            inbound: Mutex::new(AHashMap::new()),
            inbound_maps: Pool::new(BATCH_POOL, AHashMap::new, |m: &mut InboundMap<P>| m.clear()),
            batches: Pool::new(BATCH_POOL, Vec::new, |b: &mut InboundBatch<P>| b.clear()),
            participant_lists: Pool::new(BATCH_POOL, Vec::new, |l: &mut ParticipantList<P>| l.clear()),
            removals: Mutex::new(VecDeque::new()),
            workers,
            started: Instant::now(),
            totals: Totals::default(),
        })
    }

    /// Queues a `High` pose frame from `sender`. A later submit from the same
    /// sender before the next tick replaces this one. Returns true if it did.
    pub fn submit(&self, sender: ParticipantId, peer: &Arc<P>, data: Bytes) -> bool {
        self.context
            .stats
            .record_inbound(MessageType::PoseUpdate.index(), data.len());

        let pose = InboundPose {
            peer: Arc::clone(peer),
            data,
        };
        self.inbound.lock().insert(sender, pose).is_some()
    }

    /// Queues a participant for removal at the next tick.
    pub fn remove(&self, id: ParticipantId) {
        self.removals.lock().push_back(id);
    }

    /// Milliseconds since this scheduler was created.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn tick(&self, now_ms: u64) -> TickReport {
        let tick_started = Instant::now();

        // Drain
        let mut batch = self.batches.get();
        {
            let mut drained = self.inbound_maps.take();
            std::mem::swap(&mut *self.inbound.lock(), &mut drained);
            batch.extend(drained.drain());
            self.inbound_maps.give(drained);
        }

        // Apply
        let inbound = batch.as_slice();
        let mut report = self.workers.install(|| {
            inbound
                .par_iter()
                .map(|(sender, pose)| self.apply(*sender, pose, now_ms))
                .reduce(TickReport::default, TickReport::merge)
        });
        drop(batch);

        // Removals
        let removals = std::mem::take(&mut *self.removals.lock());
        for id in removals {
            if self.registry.remove(id).is_some() {
                report.removed += 1;
                if self.config.notify_leave {
                    report = report.merge(self.notify_left(id));
                }
            }
        }

        // Fan-out
        let mut participants = self.participant_lists.get();
        self.registry.snapshot_into(&mut participants);
        let active = participants.as_slice();
        let fan_out = self.workers.install(|| {
            active
                .par_iter()
                .map(|receiver| self.fan_out_to(receiver, active, now_ms))
                .reduce(TickReport::default, TickReport::merge)
        });
        report = report.merge(fan_out);
        drop(participants);

        report.duration = tick_started.elapsed();
        self.totals.add(&report);

        if report.duration > self.config.tick_period() {
            self.totals.overruns.fetch_add(1, Ordering::Relaxed);
            debug!(
                duration_us = report.duration.as_micros() as u64,
                period_ms = self.config.tick_period_ms,
                "tick overran its period"
            );
        }

        trace!(
            applied = report.applied,
            rejected = report.rejected,
            sent = report.sent,
            skipped_backpressure = report.skipped_backpressure,
            duration_us = report.duration.as_micros() as u64,
            "tick"
        );

        report
    }

    fn apply(&self, sender: ParticipantId, pose: &InboundPose<P>, now_ms: u64) -> TickReport {
        let mut report = TickReport::default();

        let position = match inspect(&pose.data, Quality::High, self.config.quaternion_tolerance) {
            Ok(position) => position,
            Err(error) => {
                warn!(sender, %error, "rejected pose update");
                report.rejected = 1;
                return report;
            }
        };

        let frames = match repack_all(&pose.data) {
            Ok(frames) => frames,
            Err(error) => {
                warn!(sender, %error, "repack failed, serving source frame at every quality");
                report.degraded = 1;
                QualityFrames::uniform(pose.data.slice(..frame_len(Quality::High)), Quality::High)
            }
        };

        let participant = self.registry.get_or_join(sender, &pose.peer);
        participant.update(position, frames, now_ms);
        self.registry.mark_updated(sender);
        trace_apply(sender, &pose.data);

        report.applied = 1;
        report
    }

    fn notify_left(&self, id: ParticipantId) -> TickReport {
        let mut report = TickReport::default();
        let mut participants = self.participant_lists.get();
        self.registry.snapshot_into(&mut participants);

        for receiver in participants.iter() {
            let mut writer = self.context.writers.get();
            write_participant_notice(&mut writer, MessageType::ParticipantLeft, id);
            let packet = writer.split().freeze();
            let len = packet.len();

            match receiver
                .peer()
                .send(packet, self.config.pose_channel, self.config.control_delivery)
            {
                Ok(()) => {
                    self.context
                        .stats
                        .record_outbound(MessageType::ParticipantLeft.index(), len);
                    report.sent += 1;
                }
                Err(error) => {
                    debug!(receiver = receiver.id(), participant = id, %error, "leave notice not delivered");
                    report.send_failures += 1;
                }
            }
        }
        report
    }

    fn fan_out_to(&self, receiver: &Participant<P>, active: &[Arc<Participant<P>>], now_ms: u64) -> TickReport {
        let mut report = TickReport::default();
        let peer = receiver.peer();
        let channel = self.config.pose_channel;
        let delivery = self.config.pose_delivery;

        if !peer.is_connected() {
            report.skipped_disconnected = 1;
            return report;
        }
        if self.backpressure.is_congested(peer.pending_count(channel, delivery)) {
            report.skipped_backpressure = 1;
            return report;
        }

        let interest = &self.config.interest;
        let here = receiver.position();

        for sender in active {
            let sender_id = sender.id();
            if sender_id == receiver.id() || !receiver.needs(sender_id) {
                continue;
            }

            let distance_sq = here.distance_squared(&sender.position());
            let interval_ms = interest.send_interval_ms(distance_sq);
            if !receiver.interval_elapsed(sender_id, now_ms, interval_ms) {
                report.skipped_interval += 1;
                continue;
            }
            if !receiver.take_dirty(sender_id) {
                continue;
            }

            let (quality, frame) = sender.frame(interest.quality_for(distance_sq));
            let mut writer = self.context.writers.get();
            write_pose_envelope(&mut writer, sender_id, interval_ms, quality, &frame);
            let packet = writer.split().freeze();
            let len = packet.len();

            match peer.send(packet, channel, delivery) {
                Ok(()) => {
                    receiver.record_sent(sender_id, now_ms);
                    self.context
                        .stats
                        .record_outbound(MessageType::PoseUpdate.index(), len);
                    trace_send(receiver.id(), sender_id, quality, interval_ms, len);
                    report.sent += 1;
                }
                Err(error) => {
                    // Retry next tick.
                    receiver.mark_dirty(sender_id);
                    debug!(receiver = receiver.id(), sender = sender_id, %error, "pose send failed");
                    report.send_failures += 1;
                }
            }
        }
        report
    }

    /// Ticks every period until `cancel` is set. A tick in progress always
    /// finishes.
    pub fn run(&self, cancel: &AtomicBool) {
        let period = self.config.tick_period();
        info!(period_ms = self.config.tick_period_ms, "scheduler started");

        while !cancel.load(Ordering::Acquire) {
            let tick_started = Instant::now();
            self.tick(self.now_ms());
            if let Some(rest) = period.checked_sub(tick_started.elapsed()) {
                std::thread::sleep(rest);
            }
        }

        info!(ticks = self.totals.ticks.load(Ordering::Relaxed), "scheduler stopped");
    }

    /// Runs the loop on a dedicated thread.
    pub fn spawn(self: &Arc<Self>) -> Result<SchedulerHandle> {
        let cancel = Arc::new(AtomicBool::new(false));
        let scheduler = Arc::clone(self);
        let flag = Arc::clone(&cancel);

        let thread = std::thread::Builder::new()
            .name("pose-relay-scheduler".to_string())
            .spawn(move || scheduler.run(&flag))?;

        Ok(SchedulerHandle {
            cancel,
            thread: Some(thread),
        })
    }

    /// Async variant of `run`, stopping once `shutdown` turns true or its
    /// sender is dropped. Ticks run on the blocking pool.
    #[cfg(feature = "async")]
    pub async fn run_async(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        use tokio::time::{interval, MissedTickBehavior};

        let mut ticker = interval(self.config.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = self.config.tick_period_ms, "async scheduler started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    let scheduler = Arc::clone(&self);
                    tokio::task::spawn_blocking(move || {
                        let now = scheduler.now_ms();
                        scheduler.tick(now)
                    })
                    .await
                    .map_err(|e| RelayError::WorkerFailed(e.to_string()))?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(ticks = self.totals.ticks.load(Ordering::Relaxed), "async scheduler stopped");
        Ok(())
    }

    pub fn stats(&self) -> SchedulerStats {
        let t = &self.totals;
        SchedulerStats {
            ticks: t.ticks.load(Ordering::Relaxed),
            overruns: t.overruns.load(Ordering::Relaxed),
            applied: t.applied.load(Ordering::Relaxed),
            rejected: t.rejected.load(Ordering::Relaxed),
            degraded: t.degraded.load(Ordering::Relaxed),
            removed: t.removed.load(Ordering::Relaxed),
            sent: t.sent.load(Ordering::Relaxed),
            skipped_backpressure: t.skipped_backpressure.load(Ordering::Relaxed),
            send_failures: t.send_failures.load(Ordering::Relaxed),
            active: self.registry.len(),
        }
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.lock().len()
    }

    pub fn registry(&self) -> &ParticipantRegistry<P> {
        &self.registry
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.context
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

/// Owns the background scheduler thread. Dropping the handle signals the loop
/// to stop without waiting for it.
pub struct SchedulerHandle {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Signals the loop and waits for the current tick to finish.
    pub fn shutdown(mut self) -> Result<()> {
        self.cancel.store(true, Ordering::Release);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| RelayError::WorkerFailed("scheduler thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
    }
}
