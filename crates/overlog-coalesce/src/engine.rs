//! Record coalescing engine
//!
//! Batches small appends to a dedicated stream into full-size records.
//!
//! # Request flow
//!
//! Every append or flush takes a turn on a FIFO async mutex, so exactly
//! one request mutates the open buffer at a time, in arrival order. An
//! append copies its payload into the open [`CoalesceBuffer`], sealing it
//! when it is full, when the caller forces a flush, or when the engine is
//! under memory pressure and little room is left. A sealed buffer becomes
//! an in-flight record and is queued to the flush worker, which issues the
//! reserved writes strictly in seal order.
//!
//! The request then gives up its turn and waits for the buffers it wrote
//! into to become durable. A forced append that finds no open buffer skips
//! coalescing and is queued as a direct write of its own.
//!
//! # Reservation
//!
//! A request moves its reservation into the engine's running total when it
//! gets its turn. A seal keeps `round_up_4k(bytes still to copy)` for the
//! next buffer and hands the rest to the write. A failed write returns its
//! share to the total; close releases whatever is still held.
//!
//! # Read-back
//!
//! Until a record is durable it can be served from memory: the open
//! buffer, then records being flushed (including failed ones kept until
//! close), then direct writes, then requests still waiting for a turn.

use crate::allocator::{Allocation, PressureSource, ThrottledAllocator};
use crate::record::{FoundRecord, ReadType, Record};
use crate::stream::DedicatedStream;
use bytes::{Bytes, BytesMut};
use overlog_common::{CoalesceConfig, Error, Result, round_up_4k};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Completion of an in-flight write; `None` while it is outstanding
type Completion = watch::Sender<Option<Result<()>>>;
type CompletionWaiter = watch::Receiver<Option<Result<()>>>;

/// Engine counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoalesceStats {
    pub appends: u64,
    pub flush_requests: u64,
    /// Sealed buffers written successfully
    pub coalesced_writes: u64,
    pub direct_writes: u64,
    pub flushes_failed: u64,
    pub bytes_coalesced: u64,
    pub reservation_held: u64,
    pub buffered_bytes: u64,
    pub flushing_records: usize,
    pub memory_in_use: u64,
}

/// The destination buffer being filled
struct CoalesceBuffer {
    start_offset: u64,
    highest_version: u64,
    head_truncation_point: u64,
    record_marker: Option<u32>,
    data: BytesMut,
    allocations: Vec<Allocation>,
    allocated: u64,
    done: Completion,
}

impl CoalesceBuffer {
    fn new(start_offset: u64, version: u64, capacity: usize) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            start_offset,
            highest_version: version,
            head_truncation_point: 0,
            record_marker: None,
            data: BytesMut::with_capacity(capacity),
            allocations: Vec::new(),
            allocated: 0,
            done,
        }
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn end_offset(&self) -> u64 {
        self.start_offset + self.data.len() as u64
    }

    /// The record starts where the buffer ends and carries the next operation id
    fn accepts(&self, record: &Record) -> bool {
        record.stream_offset == self.end_offset() && record.version == self.highest_version + 1
    }

    /// Budget still to allocate before `additional` more bytes fit
    fn shortfall(&self, additional: usize) -> u64 {
        round_up_4k((self.len() + additional) as u64).saturating_sub(self.allocated)
    }

    fn add_allocation(&mut self, allocation: Allocation) {
        self.allocated += allocation.bytes();
        self.allocations.push(allocation);
    }

    fn push(&mut self, record: &Record, range: Range<usize>, completes_record: bool) {
        self.data.extend_from_slice(&record.data[range]);
        self.highest_version = record.version;
        self.head_truncation_point = record.head_truncation_point;
        if completes_record && record.is_record_end {
            // Bounded by max_record_size
            self.record_marker = Some(u32::try_from(self.len()).unwrap_or(u32::MAX));
        }
    }

    fn snapshot(&self) -> FoundRecord {
        FoundRecord::build(
            self.start_offset,
            self.highest_version,
            self.head_truncation_point,
            self.record_marker,
            Bytes::copy_from_slice(&self.data),
        )
    }

    /// Every request waiting on this buffer fails with `err`
    fn fail(self, err: Error) {
        self.done.send_replace(Some(Err(err)));
    }

    fn seal(self) -> InFlight {
        InFlight {
            record: FoundRecord::build(
                self.start_offset,
                self.highest_version,
                self.head_truncation_point,
                self.record_marker,
                self.data.freeze(),
            ),
            kind: WriteKind::Coalesced,
            failed: AtomicBool::new(false),
            done: self.done,
            allocations: Mutex::new(self.allocations),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteKind {
    Coalesced,
    Direct,
}

/// A record handed to the flush worker and not yet durable
struct InFlight {
    record: FoundRecord,
    kind: WriteKind,
    failed: AtomicBool,
    done: Completion,
    /// Budget held until the write completes; the data stays readable
    allocations: Mutex<Vec<Allocation>>,
}

impl InFlight {
    fn direct(record: &Record) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            record: FoundRecord::from_record(record),
            kind: WriteKind::Direct,
            failed: AtomicBool::new(false),
            done,
            allocations: Mutex::new(Vec::new()),
        }
    }
}

/// Counts a write from queueing until its completion is published
struct PendingWrite(Arc<watch::Sender<usize>>);

impl PendingWrite {
    fn start(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct FlushJob {
    write: Arc<InFlight>,
    reserve: u64,
    _pending: PendingWrite,
}

#[derive(Default)]
struct State {
    buffer: Option<CoalesceBuffer>,
    flushing: VecDeque<Arc<InFlight>>,
    direct: Vec<Arc<InFlight>>,
    /// Appends admitted but not yet holding the turn
    waiting: Vec<(u64, Record)>,
    next_ticket: u64,
    reservation: u64,
    closing: bool,
    /// The final flush has been sealed; nothing may be buffered after it
    final_flush_sealed: bool,
    stats: CoalesceStats,
}

struct Inner {
    stream: Arc<dyn DedicatedStream>,
    allocator: ThrottledAllocator,
    config: CoalesceConfig,
    /// Single-flight turn; tokio's mutex is granted in FIFO order
    turn: tokio::sync::Mutex<()>,
    state: Mutex<State>,
    jobs: mpsc::UnboundedSender<FlushJob>,
    pending: Arc<watch::Sender<usize>>,
    timer_armed: AtomicBool,
    timer_elapsed_ms: AtomicU64,
}

/// An admitted append; leaves the waiting list when dropped
struct Admission<'a> {
    inner: &'a Inner,
    ticket: u64,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        let ticket = self.ticket;
        self.inner
            .state
            .lock()
            .waiting
            .retain(|(queued, _)| *queued != ticket);
    }
}

impl Inner {
    fn check_open(state: &State) -> Result<()> {
        if state.closing {
            return Err(Error::shutdown_pending("record coalescing engine is closing"));
        }
        Ok(())
    }

    fn admit(&self, record: &Record) -> Result<Admission<'_>> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiting.push((ticket, record.clone()));
        Ok(Admission {
            inner: self,
            ticket,
        })
    }

    fn arm_timer(&self) {
        self.timer_elapsed_ms.store(0, Ordering::Release);
        self.timer_armed.store(true, Ordering::Release);
    }

    /// Hand a write to the flush worker; the caller holds the state lock
    fn enqueue(&self, state: &mut State, write: Arc<InFlight>, reserve: u64) {
        let job = FlushJob {
            write: Arc::clone(&write),
            reserve,
            _pending: PendingWrite::start(&self.pending),
        };
        if self.jobs.send(job).is_err() {
            // Worker gone; only possible while the engine is being dropped
            write.failed.store(true, Ordering::Release);
            state.reservation += reserve;
            write.done.send_replace(Some(Err(Error::shutdown_pending(
                "flush worker stopped",
            ))));
        }
    }

    /// Seal the open buffer, keeping `reserve_to_save` for the next one
    fn seal(&self, state: &mut State, reserve_to_save: u64) -> Option<CompletionWaiter> {
        let buffer = state.buffer.take()?;
        let reserve = state.reservation.saturating_sub(reserve_to_save);
        state.reservation -= reserve;

        let write = Arc::new(buffer.seal());
        debug!(
            "Sealed record at {} ({} bytes, version {}, reserve {})",
            write.record.stream_offset,
            write.record.data.len(),
            write.record.version,
            reserve
        );
        let waiter = write.done.subscribe();
        state.flushing.push_back(Arc::clone(&write));
        self.enqueue(state, write, reserve);
        Some(waiter)
    }

    /// Copy one append into the open buffer, or queue it as a direct write
    async fn coalesce(
        &self,
        record: Record,
        reserve: u64,
        force: bool,
    ) -> Result<Vec<CompletionWaiter>> {
        let max = self.config.max_record_size as usize;
        let padding = self.config.padding_under_pressure as usize;
        let total = record.data.len();

        {
            let mut state = self.state.lock();
            if state.final_flush_sealed {
                return Err(Error::shutdown_pending("record coalescing engine is closing"));
            }
            state.reservation += reserve;
            state.stats.appends += 1;

            if force && state.buffer.is_none() && total <= max {
                let write = Arc::new(InFlight::direct(&record));
                let waiter = write.done.subscribe();
                let reserve = std::mem::take(&mut state.reservation);
                debug!(
                    "Direct write at {} ({} bytes, version {}, reserve {})",
                    record.stream_offset, total, record.version, reserve
                );
                state.direct.push(Arc::clone(&write));
                self.enqueue(&mut state, write, reserve);
                return Ok(vec![waiter]);
            }
        }

        let mut waiters = Vec::new();
        let mut waiting_on_open_buffer = false;
        let mut copied = 0;
        loop {
            let (chunk, shortfall) = {
                let mut state = self.state.lock();
                let violation = match &state.buffer {
                    Some(buffer) if copied == 0 && !buffer.accepts(&record) => Some(format!(
                        "record at {} version {} does not continue buffer ending at {} version {}",
                        record.stream_offset,
                        record.version,
                        buffer.end_offset(),
                        buffer.highest_version
                    )),
                    _ => None,
                };
                if let Some(message) = violation {
                    let err = Error::invalid_argument(message);
                    if let Some(buffer) = state.buffer.take() {
                        warn!("Discarding coalesce buffer: {}", err);
                        buffer.fail(err.clone());
                    }
                    return Err(err);
                }

                let buffer = state.buffer.get_or_insert_with(|| {
                    CoalesceBuffer::new(record.stream_offset + copied as u64, record.version, max)
                });
                let chunk = (max - buffer.len()).min(total - copied);
                (chunk, buffer.shortfall(chunk))
            };

            let allocation = if shortfall > 0 {
                match self.allocator.allocate(shortfall).await {
                    Ok(allocation) => Some(allocation),
                    Err(e) => {
                        let mut state = self.state.lock();
                        if state.buffer.as_ref().is_some_and(|b| b.data.is_empty()) {
                            state.buffer = None;
                        }
                        return Err(e);
                    }
                }
            } else {
                None
            };

            let mut state = self.state.lock();
            let Some(buffer) = state.buffer.as_mut() else {
                return Err(Error::internal("coalesce buffer disappeared mid-append"));
            };
            if let Some(allocation) = allocation {
                buffer.add_allocation(allocation);
            }
            if !waiting_on_open_buffer {
                waiters.push(buffer.done.subscribe());
                waiting_on_open_buffer = true;
            }

            let completes_record = copied + chunk == total;
            buffer.push(&record, copied..copied + chunk, completes_record);
            copied += chunk;

            let full = buffer.len() >= max;
            let squeezed = self.allocator.is_under_pressure() && max - buffer.len() < padding;
            if full || squeezed || (force && completes_record) {
                let reserve_to_save = round_up_4k((total - copied) as u64);
                self.seal(&mut state, reserve_to_save);
                waiting_on_open_buffer = false;
            }

            if copied >= total {
                state.stats.bytes_coalesced += total as u64;
                if state.buffer.is_some() {
                    self.arm_timer();
                }
                return Ok(waiters);
            }
        }
    }

    /// Issue one queued write and publish its outcome
    async fn complete(&self, job: FlushJob) {
        let FlushJob {
            write,
            reserve,
            _pending,
        } = job;
        let result = self
            .stream
            .reserved_write(write.record.to_write(reserve))
            .await;
        write.allocations.lock().clear();

        {
            let mut state = self.state.lock();
            match (&result, write.kind) {
                (Ok(()), WriteKind::Coalesced) => {
                    state.flushing.retain(|w| !Arc::ptr_eq(w, &write));
                    state.stats.coalesced_writes += 1;
                }
                (Ok(()), WriteKind::Direct) => {
                    state.direct.retain(|w| !Arc::ptr_eq(w, &write));
                    state.stats.direct_writes += 1;
                }
                (Err(_), kind) => {
                    // Failed coalesced records stay readable until close
                    write.failed.store(true, Ordering::Release);
                    if kind == WriteKind::Direct {
                        state.direct.retain(|w| !Arc::ptr_eq(w, &write));
                    }
                    state.reservation += reserve;
                    state.stats.flushes_failed += 1;
                }
            }
        }

        match &result {
            Ok(()) => {
                debug!(
                    "Wrote record at {} ({} bytes, version {})",
                    write.record.stream_offset,
                    write.record.data.len(),
                    write.record.version
                );
                if write.kind == WriteKind::Coalesced {
                    self.arm_timer();
                }
            }
            Err(e) => warn!(
                "Write of record at {} failed: {}",
                write.record.stream_offset, e
            ),
        }
        write.done.send_replace(Some(result));
    }

    /// One tick of the periodic timer
    async fn on_timer_tick(&self) {
        if !self.timer_armed.load(Ordering::Acquire) {
            return;
        }
        let period = self.config.periodic_timer_interval_ms;
        let elapsed = self.timer_elapsed_ms.fetch_add(period, Ordering::AcqRel) + period;
        let under_pressure = self.allocator.is_under_pressure();
        if elapsed < self.config.periodic_flush_time_ms && !under_pressure {
            return;
        }
        self.timer_armed.store(false, Ordering::Release);

        let _turn = self.turn.lock().await;
        let mut state = self.state.lock();
        if state.final_flush_sealed {
            return;
        }
        if self.seal(&mut state, 0).is_some() {
            debug!(
                "Periodic flush after {} ms (under pressure: {})",
                elapsed, under_pressure
            );
        }
    }
}

/// Wait for every write a request contributed to
async fn await_completions(waiters: Vec<CompletionWaiter>) -> Result<()> {
    for mut waiter in waiters {
        let outcome = waiter
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone())
            .map_err(|_| Error::Cancelled)?;
        if let Some(Err(e)) = outcome {
            return Err(e);
        }
    }
    Ok(())
}

/// Issues queued writes in order; exits when the engine is dropped
async fn run_flush_worker(inner: Weak<Inner>, mut jobs: mpsc::UnboundedReceiver<FlushJob>) {
    while let Some(job) = jobs.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.complete(job).await;
    }
}

fn spawn_periodic_timer(inner: &Arc<Inner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let period = inner.config.periodic_timer_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.on_timer_tick().await;
        }
    })
}

/// Coalesces appends to one dedicated stream into full-size records
pub struct RecordCoalescingEngine {
    inner: Arc<Inner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RecordCoalescingEngine {
    /// Create an engine writing to `stream`
    ///
    /// Must be called within a tokio runtime: the flush worker and the
    /// periodic timer are spawned here.
    pub fn new(stream: Arc<dyn DedicatedStream>, config: CoalesceConfig) -> Result<Self> {
        Self::build(stream, config, None)
    }

    /// Like [`new`](Self::new), flushing early whenever `source` reports pressure
    pub fn with_pressure_source(
        stream: Arc<dyn DedicatedStream>,
        config: CoalesceConfig,
        source: Arc<dyn PressureSource>,
    ) -> Result<Self> {
        Self::build(stream, config, Some(source))
    }

    fn build(
        stream: Arc<dyn DedicatedStream>,
        config: CoalesceConfig,
        source: Option<Arc<dyn PressureSource>>,
    ) -> Result<Self> {
        config.validate()?;
        let mut allocator = ThrottledAllocator::new(config.memory_limit, config.pressure_percent)?;
        if let Some(source) = source {
            allocator = allocator.with_pressure_source(source);
        }

        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            stream,
            allocator,
            config,
            turn: tokio::sync::Mutex::new(()),
            state: Mutex::new(State::default()),
            jobs,
            pending: Arc::new(pending),
            timer_armed: AtomicBool::new(false),
            timer_elapsed_ms: AtomicU64::new(0),
        });

        tokio::spawn(run_flush_worker(Arc::downgrade(&inner), jobs_rx));
        let timer = spawn_periodic_timer(&inner);

        Ok(Self {
            inner,
            timer: Mutex::new(Some(timer)),
        })
    }

    /// Append a record, transferring `reserve` bytes of reservation
    ///
    /// Resolves once every byte of the record is durable, or with the
    /// error of the write that carried it. With `force` the record's
    /// buffer is flushed immediately.
    pub async fn append(&self, record: Record, reserve: u64, force: bool) -> Result<()> {
        let admission = self.inner.admit(&record)?;
        let turn = self.inner.turn.lock().await;

        let waiters = self.inner.coalesce(record, reserve, force).await;
        drop(admission);
        drop(turn);
        await_completions(waiters?).await
    }

    /// Flush the open buffer with all reservation held, and wait for it
    ///
    /// Completes immediately when nothing is buffered.
    pub async fn flush(&self) -> Result<()> {
        Inner::check_open(&self.inner.state.lock())?;
        let turn = self.inner.turn.lock().await;

        let waiter = {
            let mut state = self.inner.state.lock();
            if state.final_flush_sealed {
                return Err(Error::shutdown_pending("record coalescing engine is closing"));
            }
            state.stats.flush_requests += 1;
            self.inner.seal(&mut state, 0)
        };
        drop(turn);

        match waiter {
            Some(waiter) => await_completions(vec![waiter]).await,
            None => Ok(()),
        }
    }

    /// Serve a record that is not yet durable
    pub fn find_data_in_flushing_records(
        &self,
        stream_offset: u64,
        read_type: ReadType,
    ) -> Result<FoundRecord> {
        let state = self.inner.state.lock();
        let hit = |start: u64, len: usize| read_type.matches(start, len as u64, stream_offset);

        if let Some(buffer) = &state.buffer
            && hit(buffer.start_offset, buffer.len())
        {
            return Ok(buffer.snapshot());
        }

        let in_flight = state
            .flushing
            .iter()
            .chain(state.direct.iter())
            .map(|write| &write.record)
            .find(|record| hit(record.stream_offset, record.data.len()));
        if let Some(record) = in_flight {
            return Ok(record.clone());
        }

        if let Some((_, record)) = state
            .waiting
            .iter()
            .find(|(_, record)| hit(record.stream_offset, record.data.len()))
        {
            return Ok(FoundRecord::from_record(record));
        }

        Err(Error::not_found(format!(
            "no in-flight record at stream offset {stream_offset}"
        )))
    }

    #[must_use]
    pub fn stats(&self) -> CoalesceStats {
        let state = self.inner.state.lock();
        CoalesceStats {
            reservation_held: state.reservation,
            buffered_bytes: state.buffer.as_ref().map_or(0, |b| b.len() as u64),
            flushing_records: state.flushing.len(),
            memory_in_use: self.inner.allocator.bytes_in_use(),
            ..state.stats
        }
    }

    /// Stop accepting requests, flush what is buffered and wait for every
    /// outstanding write
    ///
    /// Requests admitted before close still run. Failed records are purged
    /// and the reservation still held is released to the stream.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            Inner::check_open(&state)?;
            state.closing = true;
        }
        info!("Closing record coalescing engine");

        let waiter = {
            let _turn = self.inner.turn.lock().await;
            let mut state = self.inner.state.lock();
            state.final_flush_sealed = true;
            self.inner.seal(&mut state, 0)
        };
        let flushed = match waiter {
            Some(waiter) => await_completions(vec![waiter]).await,
            None => Ok(()),
        };

        let mut pending = self.inner.pending.subscribe();
        if let Err(e) = pending.wait_for(|n| *n == 0).await {
            debug!("Pending write counter closed before draining: {}", e);
        }

        let (purged, held) = {
            let mut state = self.inner.state.lock();
            let before = state.flushing.len();
            state
                .flushing
                .retain(|write| !write.failed.load(Ordering::Acquire));
            (
                before - state.flushing.len(),
                std::mem::take(&mut state.reservation),
            )
        };
        if purged > 0 {
            warn!("Purged {} failed records on close", purged);
        }

        let released = if held > 0 {
            let delta = i64::try_from(held).unwrap_or(i64::MAX);
            self.inner.stream.update_reservation(-delta).await
        } else {
            Ok(())
        };

        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        self.inner.allocator.close();

        info!(
            "Closed record coalescing engine (released {} bytes of reservation)",
            held
        );
        flushed.and(released)
    }
}

impl Drop for RecordCoalescingEngine {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StreamBlockHeader;
    use async_trait::async_trait;
    use futures::future::join_all;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Records every write; writes block while the gate is closed
    struct RecordingStream {
        writes: Mutex<Vec<crate::record::RecordWrite>>,
        reservation_updates: Mutex<Vec<i64>>,
        fail_writes: AtomicBool,
        gate: Semaphore,
    }

    impl RecordingStream {
        fn new() -> Arc<Self> {
            Self::with_gate(Semaphore::MAX_PERMITS)
        }

        fn gated() -> Arc<Self> {
            Self::with_gate(0)
        }

        fn with_gate(permits: usize) -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
                reservation_updates: Mutex::new(Vec::new()),
                fail_writes: AtomicBool::new(false),
                gate: Semaphore::new(permits),
            })
        }

        fn open_gate(&self) {
            self.gate.add_permits(1);
        }

        fn write_count(&self) -> usize {
            self.writes.lock().len()
        }
    }

    #[async_trait]
    impl DedicatedStream for RecordingStream {
        async fn reserved_write(&self, write: crate::record::RecordWrite) -> Result<()> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| Error::Cancelled)?;
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::internal("disk full"));
            }
            self.writes.lock().push(write);
            Ok(())
        }

        async fn update_reservation(&self, delta: i64) -> Result<()> {
            self.reservation_updates.lock().push(delta);
            Ok(())
        }
    }

    fn test_config() -> CoalesceConfig {
        CoalesceConfig {
            max_record_size: 64 * 1024,
            padding_under_pressure: 16 * 1024,
            // Keep the timer out of the way unless a test wants it
            periodic_timer_interval_ms: 3_600_000,
            periodic_flush_time_ms: 3_600_000,
            memory_limit: 1024 * 1024,
            pressure_percent: 100,
        }
    }

    fn engine_with(
        stream: &Arc<RecordingStream>,
        config: CoalesceConfig,
    ) -> Arc<RecordCoalescingEngine> {
        Arc::new(
            RecordCoalescingEngine::new(Arc::clone(stream) as Arc<dyn DedicatedStream>, config)
                .unwrap(),
        )
    }

    fn payload(len: usize, seed: u8) -> Bytes {
        Bytes::from((0..len).map(|i| seed.wrapping_add(i as u8)).collect::<Vec<_>>())
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    fn spawn_append(
        engine: &Arc<RecordCoalescingEngine>,
        record: Record,
        reserve: u64,
        force: bool,
    ) -> JoinHandle<Result<()>> {
        let engine = Arc::clone(engine);
        tokio::spawn(async move { engine.append(record, reserve, force).await })
    }

    #[tokio::test]
    async fn test_fill_flush_then_direct_write() {
        let stream = RecordingStream::new();
        let engine = engine_with(&stream, test_config());
        const CHUNK: usize = 8 * 1024;

        let mut handles = Vec::new();
        for i in 0..10u64 {
            let record = Record::new(i * CHUNK as u64, i + 1, payload(CHUNK, i as u8));
            handles.push(spawn_append(&engine, record, CHUNK as u64, false));
            let expected = (i + 1) * CHUNK as u64;
            eventually(|| engine.stats().bytes_coalesced == expected).await;
        }

        // Eight appends filled one record; the last two sit in the next buffer
        eventually(|| stream.write_count() == 1).await;
        for handle in handles.drain(..8) {
            handle.await.unwrap().unwrap();
        }
        {
            let writes = stream.writes.lock();
            assert_eq!(writes[0].stream_offset, 0);
            assert_eq!(writes[0].data.len(), 64 * 1024);
            assert_eq!(writes[0].reserve, 64 * 1024);
            assert_eq!(writes[0].version, 8);
        }
        assert!(handles.iter().all(|h| !h.is_finished()));
        assert_eq!(engine.stats().buffered_bytes, 2 * CHUNK as u64);

        engine.flush().await.unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        {
            let writes = stream.writes.lock();
            assert_eq!(writes.len(), 2);
            assert_eq!(writes[1].stream_offset, 64 * 1024);
            assert_eq!(writes[1].data.len(), 2 * CHUNK);
            assert_eq!(writes[1].reserve, 2 * CHUNK as u64);
            assert_eq!(writes[1].version, 10);
        }

        // Forced append into an empty buffer goes straight to the stream
        let record = Record::new(10 * CHUNK as u64, 11, payload(CHUNK, 7));
        engine.append(record, CHUNK as u64, true).await.unwrap();
        assert_eq!(stream.write_count(), 3);
        let stats = engine.stats();
        assert_eq!(stats.coalesced_writes, 2);
        assert_eq!(stats.direct_writes, 1);
        assert_eq!(stats.reservation_held, 0);
        assert_eq!(stats.memory_in_use, 0);
    }

    #[tokio::test]
    async fn test_record_spanning_two_buffers() {
        let stream = RecordingStream::new();
        let engine = engine_with(&stream, test_config());

        let data = payload(72 * 1024, 3);
        let handle = spawn_append(&engine, Record::new(0, 1, data.clone()), 72 * 1024, false);
        eventually(|| stream.write_count() == 1).await;
        assert!(!handle.is_finished());

        engine.flush().await.unwrap();
        handle.await.unwrap().unwrap();

        let writes = stream.writes.lock();
        assert_eq!(writes.len(), 2);
        // The sealed record keeps exactly what the leftover needs
        assert_eq!(writes[0].reserve, 64 * 1024);
        assert_eq!(writes[1].reserve, 8 * 1024);
        assert_eq!(writes[1].stream_offset, 64 * 1024);
        assert_eq!(writes[1].version, 1);

        let first = StreamBlockHeader::decode(&writes[0].metadata).unwrap();
        let second = StreamBlockHeader::decode(&writes[1].metadata).unwrap();
        assert_eq!(first.record_marker, None);
        assert_eq!(second.record_marker, Some(8 * 1024));
        first.verify_data(&writes[0].data).unwrap();

        let mut joined = writes[0].data.to_vec();
        joined.extend_from_slice(&writes[1].data);
        assert_eq!(joined, data.to_vec());
    }

    #[tokio::test]
    async fn test_requests_run_in_arrival_order() {
        let stream = RecordingStream::new();
        let engine = engine_with(&stream, test_config());

        let mut expected = Vec::new();
        let mut appends = Vec::new();
        let mut offset = 0u64;
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..24u64 {
            let data = payload(rng.gen_range(1..9000), i as u8);
            expected.extend_from_slice(&data);
            let record = Record::new(offset, i + 1, data.clone());
            offset += data.len() as u64;
            appends.push(engine.append(record, round_up_4k(data.len() as u64), i == 23));
        }

        for result in join_all(appends).await {
            result.unwrap();
        }

        let writes = stream.writes.lock();
        let mut joined = Vec::new();
        let mut next_offset = 0;
        for write in writes.iter() {
            assert_eq!(write.stream_offset, next_offset);
            assert!(write.data.len() <= 64 * 1024);
            StreamBlockHeader::decode(&write.metadata)
                .unwrap()
                .verify_data(&write.data)
                .unwrap();
            next_offset += write.data.len() as u64;
            joined.extend_from_slice(&write.data);
        }
        assert_eq!(joined, expected);
        assert!(writes.len() >= 2);
        assert_eq!(engine.stats().reservation_held, 0);
    }

    #[tokio::test]
    async fn test_reservation_is_fully_accounted() {
        let stream = RecordingStream::new();
        let engine = engine_with(&stream, test_config());

        let mut granted = 0;
        let mut appends = Vec::new();
        let mut offset = 0u64;
        for i in 0..20u64 {
            let data = payload(10_000, i as u8);
            let reserve = round_up_4k(data.len() as u64);
            granted += reserve;
            appends.push(engine.append(Record::new(offset, i + 1, data.clone()), reserve, false));
            offset += data.len() as u64;
        }
        let flush = engine.flush();
        let (results, flushed) = tokio::join!(join_all(appends), flush);
        flushed.unwrap();
        for result in results {
            result.unwrap();
        }

        let writes = stream.writes.lock();
        let used: u64 = writes.iter().map(|w| w.reserve).sum();
        assert_eq!(used, granted);
        for write in writes.iter().filter(|w| w.data.len() == 64 * 1024) {
            assert!(write.reserve >= round_up_4k(write.data.len() as u64));
        }
    }

    #[tokio::test]
    async fn test_contiguity_violation_fails_buffer() {
        let stream = RecordingStream::new();
        let engine = engine_with(&stream, test_config());

        let first = spawn_append(&engine, Record::new(0, 1, payload(4096, 1)), 4096, false);
        eventually(|| engine.stats().bytes_coalesced == 4096).await;

        // Starts past the end of the buffer
        let err = engine
            .append(Record::new(8192, 2, payload(4096, 2)), 4096, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(matches!(
            first.await.unwrap(),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(engine.stats().buffered_bytes, 0);

        // Wrong operation id
        let second = spawn_append(&engine, Record::new(0, 1, payload(4096, 1)), 4096, false);
        eventually(|| engine.stats().bytes_coalesced == 8192).await;
        let err = engine
            .append(Record::new(4096, 5, payload(4096, 2)), 4096, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(second.await.unwrap().is_err());
        assert_eq!(stream.write_count(), 0);
        assert_eq!(engine.stats().memory_in_use, 0);
    }

    #[tokio::test]
    async fn test_read_back_before_durable() {
        let stream = RecordingStream::gated();
        let engine = engine_with(&stream, test_config());

        let data = payload(6000, 9);
        let append = spawn_append(&engine, Record::new(100, 1, data.clone()), 8192, false);
        eventually(|| engine.stats().bytes_coalesced == 6000).await;

        // From the open buffer
        let found = engine
            .find_data_in_flushing_records(100, ReadType::Exact)
            .unwrap();
        assert_eq!(found.data, data);
        assert!(
            engine
                .find_data_in_flushing_records(200, ReadType::Exact)
                .unwrap_err()
                .is_not_found()
        );

        // From the record being flushed
        let flush = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.flush().await })
        };
        eventually(|| engine.stats().flushing_records == 1).await;
        let in_flight = engine
            .find_data_in_flushing_records(3000, ReadType::Containing)
            .unwrap();
        assert_eq!(in_flight.stream_offset, 100);
        assert_eq!(in_flight.data, data);

        stream.open_gate();
        flush.await.unwrap().unwrap();
        append.await.unwrap().unwrap();

        // Byte-identical to what reached the stream
        let writes = stream.writes.lock();
        assert_eq!(writes[0].data, in_flight.data);
        assert_eq!(writes[0].metadata, in_flight.metadata);
        drop(writes);

        assert!(
            engine
                .find_data_in_flushing_records(100, ReadType::Exact)
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_read_back_from_waiting_request() {
        let stream = RecordingStream::gated();
        let engine = engine_with(&stream, test_config());

        // Holds the turn while its direct write is blocked
        let first = spawn_append(&engine, Record::new(0, 1, payload(4096, 1)), 4096, true);
        eventually(|| engine.stats().appends == 1).await;
        let found = engine
            .find_data_in_flushing_records(0, ReadType::Exact)
            .unwrap();
        assert_eq!(found.data, payload(4096, 1));

        let turn = engine.inner.turn.lock().await;
        let second = spawn_append(&engine, Record::new(4096, 2, payload(100, 2)), 4096, false);
        eventually(|| engine.inner.state.lock().waiting.len() == 1).await;
        let waiting = engine
            .find_data_in_flushing_records(4150, ReadType::Containing)
            .unwrap();
        assert_eq!(waiting.stream_offset, 4096);
        assert_eq!(waiting.data, payload(100, 2));
        drop(turn);

        stream.open_gate();
        first.await.unwrap().unwrap();
        engine.flush().await.unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_flush_fans_out_and_close_purges() {
        let stream = RecordingStream::new();
        stream.fail_writes.store(true, Ordering::SeqCst);
        let engine = engine_with(&stream, test_config());

        let a = spawn_append(&engine, Record::new(0, 1, payload(4096, 1)), 4096, false);
        eventually(|| engine.stats().bytes_coalesced == 4096).await;
        let b = spawn_append(&engine, Record::new(4096, 2, payload(4096, 2)), 4096, false);
        eventually(|| engine.stats().bytes_coalesced == 8192).await;

        let err = engine.flush().await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(matches!(a.await.unwrap(), Err(Error::Internal(_))));
        assert!(matches!(b.await.unwrap(), Err(Error::Internal(_))));

        let stats = engine.stats();
        assert_eq!(stats.flushes_failed, 1);
        assert_eq!(stats.flushing_records, 1);
        assert_eq!(stats.reservation_held, 8192);
        // Still readable until close
        assert!(
            engine
                .find_data_in_flushing_records(4096, ReadType::Exact)
                .is_err()
        );
        assert!(
            engine
                .find_data_in_flushing_records(4096, ReadType::Containing)
                .is_ok()
        );

        engine.close().await.unwrap();
        assert_eq!(engine.stats().flushing_records, 0);
        assert_eq!(*stream.reservation_updates.lock(), vec![-8192]);
    }

    #[tokio::test]
    async fn test_close_flushes_and_rejects() {
        let stream = RecordingStream::new();
        let engine = engine_with(&stream, test_config());

        let append = spawn_append(&engine, Record::new(0, 1, payload(5000, 1)), 8192, false);
        eventually(|| engine.stats().bytes_coalesced == 5000).await;

        engine.close().await.unwrap();
        append.await.unwrap().unwrap();
        {
            let writes = stream.writes.lock();
            assert_eq!(writes.len(), 1);
            assert_eq!(writes[0].reserve, 8192);
        }
        assert!(stream.reservation_updates.lock().is_empty());

        let err = engine
            .append(Record::new(5000, 2, payload(10, 2)), 4096, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShutdownPending(_)));
        assert!(matches!(
            engine.flush().await.unwrap_err(),
            Error::ShutdownPending(_)
        ));
        assert!(matches!(
            engine.close().await.unwrap_err(),
            Error::ShutdownPending(_)
        ));
    }

    #[tokio::test]
    async fn test_close_waits_for_stalled_write() {
        let stream = RecordingStream::gated();
        let engine = engine_with(&stream, test_config());

        let append = spawn_append(&engine, Record::new(0, 1, payload(3000, 4)), 4096, false);
        eventually(|| engine.stats().bytes_coalesced == 3000).await;

        let close = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.close().await })
        };
        eventually(|| engine.stats().flushing_records == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!close.is_finished());

        stream.open_gate();
        close.await.unwrap().unwrap();
        append.await.unwrap().unwrap();
        assert_eq!(stream.write_count(), 1);
        assert_eq!(engine.stats().flushing_records, 0);
        assert_eq!(engine.stats().memory_in_use, 0);
    }

    #[tokio::test]
    async fn test_direct_write_waits_behind_flush() {
        let stream = RecordingStream::gated();
        let engine = engine_with(&stream, test_config());

        let append = spawn_append(&engine, Record::new(0, 1, payload(4096, 1)), 4096, false);
        eventually(|| engine.stats().bytes_coalesced == 4096).await;
        let flush = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.flush().await })
        };
        eventually(|| engine.stats().flushing_records == 1).await;

        let direct = spawn_append(&engine, Record::new(4096, 2, payload(4096, 2)), 4096, true);
        eventually(|| engine.stats().appends == 2).await;

        stream.open_gate();
        direct.await.unwrap().unwrap();
        flush.await.unwrap().unwrap();
        append.await.unwrap().unwrap();

        let offsets: Vec<u64> = stream.writes.lock().iter().map(|w| w.stream_offset).collect();
        assert_eq!(offsets, vec![0, 4096]);
        assert_eq!(engine.stats().direct_writes, 1);
    }

    #[tokio::test]
    async fn test_periodic_timer_flushes_idle_buffer() {
        let stream = RecordingStream::new();
        let config = CoalesceConfig {
            periodic_timer_interval_ms: 10,
            periodic_flush_time_ms: 30,
            ..test_config()
        };
        let engine = engine_with(&stream, config);

        engine
            .append(Record::new(0, 1, payload(2048, 1)), 4096, false)
            .await
            .unwrap();
        assert_eq!(stream.write_count(), 1);
        assert_eq!(engine.stats().coalesced_writes, 1);
    }

    struct AlwaysPressured;

    impl PressureSource for AlwaysPressured {
        fn under_pressure(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_pressure_seals_early() {
        let stream = RecordingStream::new();
        let engine = Arc::new(
            RecordCoalescingEngine::with_pressure_source(
                Arc::clone(&stream) as Arc<dyn DedicatedStream>,
                test_config(),
                Arc::new(AlwaysPressured),
            )
            .unwrap(),
        );

        // 12 KiB of room left is under the 16 KiB padding
        engine
            .append(Record::new(0, 1, payload(52 * 1024, 1)), 52 * 1024, false)
            .await
            .unwrap();
        assert_eq!(stream.write_count(), 1);

        // Plenty of room left: stays buffered until the timer or a flush
        let small = spawn_append(&engine, Record::new(52 * 1024, 2, payload(1024, 2)), 4096, false);
        eventually(|| engine.stats().bytes_coalesced == 53 * 1024).await;
        assert_eq!(stream.write_count(), 1);
        engine.flush().await.unwrap();
        small.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pressure_triggers_periodic_flush() {
        let stream = RecordingStream::new();
        let config = CoalesceConfig {
            periodic_timer_interval_ms: 10,
            ..test_config()
        };
        let engine = RecordCoalescingEngine::with_pressure_source(
            Arc::clone(&stream) as Arc<dyn DedicatedStream>,
            config,
            Arc::new(AlwaysPressured),
        )
        .unwrap();

        // Completes on the first tick despite the hour-long flush time
        tokio::time::timeout(
            Duration::from_secs(5),
            engine.append(Record::new(0, 1, payload(1024, 1)), 4096, false),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(stream.write_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_flush_completes_immediately() {
        let stream = RecordingStream::gated();
        let engine = engine_with(&stream, test_config());
        engine.flush().await.unwrap();
        assert_eq!(engine.stats().flush_requests, 1);
        assert_eq!(stream.write_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let stream = RecordingStream::new();
        let config = CoalesceConfig {
            max_record_size: 5000,
            ..test_config()
        };
        let result =
            RecordCoalescingEngine::new(Arc::clone(&stream) as Arc<dyn DedicatedStream>, config);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
