//! VpuScheduler — admits instructions and drives readiness-based dispatch.
//!
//! The scheduler works in passes. Each pass looks at the head of every
//! stream that is neither halted nor parked, in stream-registration order:
//!
//! - a ready head is dispatched (at most one instruction per stream per pass)
//! - a head waiting on a binding or on outstanding references is parked
//!   under that dependency until a completion touches it
//! - a head that can never become ready halts its stream
//!
//! Control instructions of a pass run one after another; compute
//! instructions of a pass may run in parallel. Completions are applied in
//! registration order, so identical submissions replay identically.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use svm_core::{
    CONTROL_STREAM_TYPE_ID, InstructionId, LogicalObjectId, LogicalObjectIdAllocator,
    SchedulerSettings, StreamId, StreamTypeId, TopologyConfig,
};

use crate::arena::{InstructionArena, InstructionState};
use crate::compute::{ComputeJob, ComputeStreamType};
use crate::control::{ControlEffect, ControlStreamType};
use crate::error::{SchedulerError, SchedulerResult};
use crate::instruction::{Access, InstructionBody, VmInstructionMsg};
use crate::pending::{HoldReason, PendingIndex};
use crate::registry::{RegistrySnapshot, SymbolRegistry};
use crate::report::{Completion, DrainReport, HaltedStream, Outcome, PassSummary};
use crate::stream::{Stream, StreamFault};
use crate::stream_type::{StreamType, StreamTypeTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Poisoned,
    ShutDown,
}

enum Dispatch {
    Control(ControlStreamType),
    Compute(ComputeJob),
}

enum Readiness {
    Ready(Dispatch),
    Held(HoldReason),
    Violation(SchedulerError),
}

enum Executed {
    Control(SchedulerResult<ControlEffect>),
    Compute(Result<(), String>),
}

/// The instruction scheduler. One instance per runtime, passed explicitly to
/// everything that needs it.
pub struct VpuScheduler {
    settings: SchedulerSettings,
    /// Registered stream types, control type included.
    stream_types: StreamTypeTable,
    /// Streams in registration order; `StreamId` indexes this.
    streams: Vec<Stream>,
    /// Live symbol bindings, keyed by object and owning stream.
    pub(crate) registry: SymbolRegistry,
    /// Admitted instructions that are queued or still held by the caller.
    pub(crate) arena: InstructionArena,
    /// Outstanding creations, deletions, and references of queued work.
    pending: PendingIndex,
    ids: LogicalObjectIdAllocator,
    /// Extra references the caller took on completed instructions.
    caller_holds: BTreeMap<InstructionId, u32>,
    /// Every dispatched instruction, in dispatch order.
    dispatch_log: Vec<InstructionId>,
    /// Completion signals not yet taken by the caller.
    completions: Vec<Completion>,
    phase: Phase,
}

impl VpuScheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self::with_stream_types(settings, StreamTypeTable::new())
    }

    pub fn with_stream_types(settings: SchedulerSettings, stream_types: StreamTypeTable) -> Self {
        info!(
            parallel_compute = settings.parallel_compute,
            max_passes = ?settings.max_passes,
            "scheduler initialized"
        );
        Self {
            settings,
            stream_types,
            streams: Vec::new(),
            registry: SymbolRegistry::new(),
            arena: InstructionArena::new(),
            pending: PendingIndex::default(),
            ids: LogicalObjectIdAllocator::new(),
            caller_holds: BTreeMap::new(),
            dispatch_log: Vec::new(),
            completions: Vec::new(),
            phase: Phase::Running,
        }
    }

    /// Build a scheduler from a resolved topology: register every stream in
    /// declaration order and admit the creation of every initial object.
    pub fn from_topology(topology: &TopologyConfig) -> SchedulerResult<Self> {
        topology
            .validate()
            .map_err(|e| SchedulerError::Topology(format!("{e:#}")))?;

        let mut scheduler = Self::new(topology.scheduler.clone());
        for stream in &topology.streams {
            let stream_type = if stream.is_control() {
                CONTROL_STREAM_TYPE_ID
            } else {
                scheduler.stream_types.register_compute(&stream.stream_type)
            };
            scheduler.register_stream(&stream.name, stream_type)?;
        }
        for object in &topology.objects {
            let stream = scheduler
                .stream_id(&object.stream)
                .ok_or_else(|| SchedulerError::StreamNameNotFound(object.stream.clone()))?;
            let msg = ControlStreamType.new_mirrored_object_symbol(
                object.id,
                object.is_remote,
                object.parallel_num,
            );
            scheduler.submit(stream, msg)?;
        }
        info!(
            streams = scheduler.streams.len(),
            objects = topology.objects.len(),
            "scheduler built from topology"
        );
        Ok(scheduler)
    }

    // ── Setup ───────────────────────────────────────────────────────

    pub fn register_compute_stream_type(&mut self, device: &str) -> StreamTypeId {
        self.stream_types.register_compute(device)
    }

    pub fn register_stream_type(&mut self, stream_type: StreamType) -> StreamTypeId {
        self.stream_types.register(stream_type)
    }

    /// Register a stream. Streams are ordered by registration, which is the
    /// dispatch tie-break.
    pub fn register_stream(&mut self, name: &str, stream_type: StreamTypeId) -> SchedulerResult<StreamId> {
        self.ensure_running()?;
        if self.stream_types.get(stream_type).is_none() {
            return Err(SchedulerError::StreamTypeNotFound(stream_type));
        }
        if self.stream_id(name).is_some() {
            return Err(SchedulerError::DuplicateStreamName(name.to_string()));
        }
        let id = StreamId::new(self.streams.len() as u32);
        self.streams.push(Stream::new(id, name.to_string(), stream_type));
        info!(stream = %id, %name, %stream_type, "stream registered");
        Ok(id)
    }

    /// Hand out a logical object id that no configured or admitted object
    /// uses.
    pub fn allocate_logical_object_id(&self) -> SchedulerResult<LogicalObjectId> {
        self.ids.allocate().ok_or(SchedulerError::LogicalIdsExhausted)
    }

    // ── Caller API ──────────────────────────────────────────────────

    /// Admit an instruction to the back of `stream`'s queue.
    pub fn submit(&mut self, stream: StreamId, msg: VmInstructionMsg) -> SchedulerResult<InstructionId> {
        self.ensure_running()?;
        let target = self
            .streams
            .get(stream.index())
            .ok_or(SchedulerError::StreamNotFound(stream))?;
        let type_id = target.stream_type();
        let stream_type = self
            .stream_types
            .get(type_id)
            .ok_or(SchedulerError::StreamTypeNotFound(type_id))?;

        let opcode = msg.opcode();
        if !stream_type.accepts(opcode) {
            return Err(SchedulerError::UnsupportedOpcode {
                opcode,
                stream,
                stream_type: type_id,
            });
        }
        for operand in msg.operands() {
            if let Some(pinned) = operand.pinned_stream() {
                if pinned.index() >= self.streams.len() {
                    return Err(SchedulerError::StreamNotFound(pinned));
                }
            }
        }
        self.pending.check_admission(&msg)?;

        if let Some(created) = msg.creates() {
            self.ids.reserve(created);
        }
        self.pending.admit(stream, &msg);
        let id = self.arena.insert(stream, msg);
        self.streams[stream.index()].push(id);
        debug!(instruction = %id, %stream, %opcode, "instruction admitted");
        Ok(id)
    }

    /// Run passes until every admitted instruction has completed or its
    /// stream has halted.
    ///
    /// Streams stalled only behind a halted stream are left queued and the
    /// report is returned; they resume once the fault is acknowledged or
    /// retried. Returns `Deadlock` when parked streams wait on each other
    /// in a cycle that nothing can wake.
    pub fn drain_all(&mut self) -> SchedulerResult<DrainReport> {
        self.ensure_running()?;
        let mut report = DrainReport::default();
        if self.queued_instructions() == 0 {
            debug!("nothing to drain");
            return Ok(report);
        }

        loop {
            if let Some(max) = self.settings.max_passes {
                if report.passes >= max {
                    error!(max, "drain pass limit exceeded");
                    return Err(SchedulerError::PassLimitExceeded(max));
                }
            }
            let summary = self.step()?;
            report.passes += 1;
            let progressed = summary.made_progress();
            report.dispatched.extend(summary.dispatched);
            report.completions.extend(summary.completions);

            if progressed {
                if self.queued_instructions() == 0 {
                    break;
                }
            } else {
                let cyclic = self.cyclically_stalled_streams();
                if !cyclic.is_empty() {
                    error!(streams = ?cyclic, "no stream can make progress");
                    report.halted = self.halted_streams();
                    return Err(SchedulerError::Deadlock {
                        streams: cyclic,
                        report: Box::new(report),
                    });
                }
                break;
            }
        }

        report.halted = self.halted_streams();
        info!(
            passes = report.passes,
            dispatched = report.dispatched.len(),
            failures = report.failures().count(),
            halted = report.halted.len(),
            "drain finished"
        );
        Ok(report)
    }

    /// Stalled streams whose wait does not trace back to a halted stream.
    ///
    /// A stream blocked on instructions queued behind a fault resumes once
    /// the fault is cleared, so only the rest are deadlocked.
    fn cyclically_stalled_streams(&self) -> Vec<StreamId> {
        let stalled: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|s| !s.is_empty() && !s.is_halted())
            .map(Stream::id)
            .collect();

        let mut behind_fault: BTreeSet<StreamId> = self
            .streams
            .iter()
            .filter(|s| s.is_halted())
            .map(Stream::id)
            .collect();
        loop {
            let before = behind_fault.len();
            for &stream in &stalled {
                if behind_fault.contains(&stream) {
                    continue;
                }
                let Some(reason) = self.pending.hold_reason(stream) else {
                    continue;
                };
                if self
                    .pending
                    .blockers(reason)
                    .iter()
                    .any(|blocker| behind_fault.contains(blocker))
                {
                    behind_fault.insert(stream);
                }
            }
            if behind_fault.len() == before {
                break;
            }
        }

        let waiting = stalled.len();
        let cyclic: Vec<StreamId> = stalled
            .into_iter()
            .filter(|stream| !behind_fault.contains(stream))
            .collect();
        if cyclic.is_empty() && waiting > 0 {
            warn!(streams = ?behind_fault, "streams stalled behind a halted stream");
        }
        cyclic
    }

    /// Run a single scheduling pass.
    pub fn step(&mut self) -> SchedulerResult<PassSummary> {
        self.ensure_running()?;
        let mut summary = PassSummary::default();

        let candidates: Vec<(StreamId, InstructionId)> = self
            .streams
            .iter()
            .filter(|s| !s.is_halted() && !self.pending.is_parked(s.id()))
            .filter_map(|s| s.head().map(|head| (s.id(), head)))
            .collect();

        let mut batch = Vec::new();
        for (stream, head) in candidates {
            match self.check_ready(stream, head)? {
                Readiness::Ready(dispatch) => batch.push((stream, head, dispatch)),
                Readiness::Held(reason) => {
                    debug!(%stream, instruction = %head, %reason, "instruction held");
                    self.pending.park(stream, reason);
                    summary.parked.push(stream);
                }
                Readiness::Violation(error) => {
                    error!(%stream, instruction = %head, %error, "readiness violation, stream halted");
                    self.streams[stream.index()].set_fault(StreamFault {
                        instruction: head,
                        error,
                        consumed: false,
                    });
                    summary.halted.push(stream);
                }
            }
        }
        if batch.is_empty() {
            return Ok(summary);
        }

        let mut order = Vec::with_capacity(batch.len());
        let mut executed: Vec<Option<Executed>> = Vec::with_capacity(batch.len());
        let mut jobs = Vec::new();
        for (slot, (stream, head, dispatch)) in batch.into_iter().enumerate() {
            order.push((stream, head));
            match dispatch {
                Dispatch::Control(control) => {
                    let result = control.run(self, head);
                    if let Err(e) = &result {
                        self.check_invariant(e)?;
                    }
                    executed.push(Some(Executed::Control(result)));
                }
                Dispatch::Compute(job) => {
                    if let Err(e) = self.arena.begin_run(head) {
                        self.check_invariant(&e)?;
                        return Err(e);
                    }
                    jobs.push((slot, job));
                    executed.push(None);
                }
            }
        }

        let results = self.execute_compute(&jobs);
        for ((slot, _), result) in jobs.iter().zip(results) {
            executed[*slot] = Some(Executed::Compute(result));
        }

        for ((stream, head), outcome) in order.into_iter().zip(executed) {
            if let Some(outcome) = outcome {
                self.complete(stream, head, outcome, &mut summary)?;
            }
        }
        Ok(summary)
    }

    /// Tear the runtime down. Rejected while any stream still has queued
    /// instructions; on success returns the final registry state.
    pub fn shutdown(&mut self) -> SchedulerResult<RegistrySnapshot> {
        self.ensure_running()?;
        let busy: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|s| !s.is_empty())
            .map(Stream::id)
            .collect();
        if !busy.is_empty() {
            warn!(streams = ?busy, "shutdown rejected, streams not drained");
            return Err(SchedulerError::ShutdownWithPendingWork { streams: busy });
        }

        let snapshot = self.registry.snapshot();
        self.registry.clear();
        self.pending.clear();
        self.streams.clear();
        self.phase = Phase::ShutDown;
        info!(bindings = snapshot.bindings.len(), "scheduler shut down");
        Ok(snapshot)
    }

    /// Clear a stream's fault and let it continue. A control instruction
    /// that failed is already gone; an instruction that failed readiness is
    /// dropped from the head of the queue without running.
    pub fn acknowledge(&mut self, stream: StreamId) -> SchedulerResult<StreamFault> {
        self.ensure_running()?;
        let fault = self
            .streams
            .get_mut(stream.index())
            .ok_or(SchedulerError::StreamNotFound(stream))?
            .take_fault()
            .ok_or(SchedulerError::NotFaulted(stream))?;

        if !fault.consumed {
            let head = fault.instruction;
            self.streams[stream.index()].pop_head(head);
            let (events, opcode) = match self.arena.get(head) {
                Some(msg) => (self.pending.retire(stream, msg), msg.opcode()),
                None => return Err(SchedulerError::InstructionNotFound(head)),
            };
            self.arena.mark_dropped(head)?;
            self.arena.release(head)?;
            self.completions.push(Completion {
                instruction: head,
                stream,
                opcode,
                outcome: Outcome::Skipped,
            });
            self.wake_all(events);
        }
        info!(%stream, instruction = %fault.instruction, error = %fault.error, "fault acknowledged");
        Ok(fault)
    }

    /// Clear a readiness fault and re-evaluate the same head on the next
    /// pass, e.g. after the caller submitted the missing creation.
    pub fn retry(&mut self, stream: StreamId) -> SchedulerResult<()> {
        self.ensure_running()?;
        let target = self
            .streams
            .get_mut(stream.index())
            .ok_or(SchedulerError::StreamNotFound(stream))?;
        match target.fault() {
            None => return Err(SchedulerError::NotFaulted(stream)),
            Some(fault) if fault.consumed => return Err(SchedulerError::NotRetryable(stream)),
            Some(_) => {}
        }
        target.take_fault();
        info!(%stream, "stream resumed for retry");
        Ok(())
    }

    /// Add a caller hold so the instruction stays inspectable after it
    /// completes.
    pub fn retain(&mut self, id: InstructionId) -> SchedulerResult<()> {
        self.arena.retain(id)?;
        *self.caller_holds.entry(id).or_default() += 1;
        Ok(())
    }

    /// Drop a hold taken with `retain`.
    pub fn release(&mut self, id: InstructionId) -> SchedulerResult<()> {
        let Some(count) = self.caller_holds.get_mut(&id) else {
            return Err(SchedulerError::InstructionNotFound(id));
        };
        *count -= 1;
        if *count == 0 {
            self.caller_holds.remove(&id);
        }
        self.arena.release(id)?;
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn stream_types(&self) -> &StreamTypeTable {
        &self.stream_types
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(id.index())
    }

    pub fn stream_id(&self, name: &str) -> Option<StreamId> {
        self.streams.iter().find(|s| s.name() == name).map(Stream::id)
    }

    pub fn registry(&self) -> &SymbolRegistry {
        &self.registry
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    pub fn instruction(&self, id: InstructionId) -> Option<&VmInstructionMsg> {
        self.arena.get(id)
    }

    /// State of an instruction that is still held by a queue, a run, or a
    /// caller.
    pub fn instruction_state(&self, id: InstructionId) -> Option<InstructionState> {
        self.arena.state(id)
    }

    /// Why a stream's head is parked, if it is.
    pub fn hold_reason(&self, stream: StreamId) -> Option<HoldReason> {
        self.pending.hold_reason(stream)
    }

    /// Queued instructions across all streams.
    pub fn queued_instructions(&self) -> usize {
        self.streams.iter().map(Stream::len).sum()
    }

    /// Every dispatched instruction, in dispatch order.
    pub fn dispatch_log(&self) -> &[InstructionId] {
        &self.dispatch_log
    }

    /// Drain the completion signals recorded so far.
    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    pub fn halted_streams(&self) -> Vec<HaltedStream> {
        self.streams
            .iter()
            .filter_map(|s| {
                s.fault().map(|fault| HaltedStream {
                    stream: s.id(),
                    instruction: fault.instruction,
                    error: fault.error.to_string(),
                })
            })
            .collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.phase == Phase::ShutDown
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn ensure_running(&self) -> SchedulerResult<()> {
        match self.phase {
            Phase::Running => Ok(()),
            Phase::Poisoned => Err(SchedulerError::Poisoned),
            Phase::ShutDown => Err(SchedulerError::ShutDown),
        }
    }

    /// Poison the scheduler on invariant violations and surface them.
    fn check_invariant(&mut self, e: &SchedulerError) -> SchedulerResult<()> {
        if e.is_invariant_violation() {
            error!(error = %e, "scheduler invariant violated, poisoning");
            self.phase = Phase::Poisoned;
            return Err(e.clone());
        }
        Ok(())
    }

    fn check_ready(&self, stream: StreamId, head: InstructionId) -> SchedulerResult<Readiness> {
        let msg = self
            .arena
            .get(head)
            .ok_or(SchedulerError::InstructionNotFound(head))?;
        let type_id = self.streams[stream.index()].stream_type();
        let stream_type = self
            .stream_types
            .get(type_id)
            .ok_or(SchedulerError::StreamTypeNotFound(type_id))?;

        if let Some(id) = msg.deletes() {
            if self.pending.references(id) > 0 {
                return Ok(Readiness::Held(HoldReason::PrematureDeletion(id)));
            }
        }

        let mut operands = Vec::with_capacity(msg.operands().len());
        for operand in msg.references() {
            match ComputeStreamType::resolve(&self.registry, stream, operand) {
                Some(resolved) => operands.push(resolved),
                None => {
                    let id = operand.logical_object_id();
                    if self.pending.has_pending_creation(id, operand.pinned_stream()) {
                        return Ok(Readiness::Held(HoldReason::AwaitingBinding(id)));
                    }
                    return Ok(Readiness::Violation(SchedulerError::UnboundSymbolReference {
                        instruction: head,
                        stream,
                        logical_object_id: id,
                    }));
                }
            }
        }

        let dispatch = match (stream_type, msg.body()) {
            (StreamType::Control(control), _) => Dispatch::Control(*control),
            (StreamType::Compute(compute), InstructionBody::Compute(op)) => {
                Dispatch::Compute(ComputeJob {
                    instruction: head,
                    stream,
                    stream_type: compute.clone(),
                    op: op.clone(),
                    operands,
                })
            }
            (StreamType::Compute(_), _) => {
                return Err(SchedulerError::UnsupportedOpcode {
                    opcode: msg.opcode(),
                    stream,
                    stream_type: type_id,
                });
            }
        };
        Ok(Readiness::Ready(dispatch))
    }

    /// Run a pass's compute jobs. Jobs only run in parallel when none of
    /// them writes a binding another one touches; otherwise they run in
    /// registration order.
    fn execute_compute(&self, jobs: &[(usize, ComputeJob)]) -> Vec<Result<(), String>> {
        if !self.settings.parallel_compute || jobs.len() < 2 || has_write_conflict(jobs) {
            return jobs.iter().map(|(_, job)| job.execute()).collect();
        }
        jobs.par_iter().map(|(_, job)| job.execute()).collect()
    }

    fn complete(
        &mut self,
        stream: StreamId,
        head: InstructionId,
        executed: Executed,
        summary: &mut PassSummary,
    ) -> SchedulerResult<()> {
        let (mut events, opcode) = match self.arena.get(head) {
            Some(msg) => (self.pending.retire(stream, msg), msg.opcode()),
            None => return Err(SchedulerError::InstructionNotFound(head)),
        };

        let target = &mut self.streams[stream.index()];
        if !target.pop_head(head) {
            error!(%stream, instruction = %head, "completed instruction was not the stream head");
        }
        target.mark_completed(head);

        let outcome = match executed {
            Executed::Control(Ok(effect)) => {
                if let ControlEffect::Bound(id) = effect {
                    events.push(HoldReason::AwaitingBinding(id));
                }
                Outcome::Completed
            }
            Executed::Control(Err(error)) => {
                let message = error.to_string();
                target.set_fault(StreamFault {
                    instruction: head,
                    error,
                    consumed: true,
                });
                summary.halted.push(stream);
                Outcome::Failed { error: message }
            }
            Executed::Compute(Ok(())) => {
                self.arena.finish(head, true)?;
                Outcome::Completed
            }
            Executed::Compute(Err(error)) => {
                self.arena.finish(head, false)?;
                Outcome::Failed { error }
            }
        };

        // Queue hold, then execution hold.
        self.arena.release(head)?;
        self.arena.release(head)?;
        self.wake_all(events);

        let completion = Completion {
            instruction: head,
            stream,
            opcode,
            outcome,
        };
        debug!(%stream, instruction = %head, %opcode, outcome = ?completion.outcome, "instruction completed");
        self.dispatch_log.push(head);
        summary.dispatched.push(head);
        summary.completions.push(completion.clone());
        self.completions.push(completion);
        Ok(())
    }

    fn wake_all(&mut self, events: Vec<HoldReason>) {
        let reasons: BTreeSet<HoldReason> = events.into_iter().collect();
        for reason in reasons {
            for stream in self.pending.wake(reason) {
                debug!(%stream, %reason, "stream woken");
            }
        }
    }
}

fn has_write_conflict(jobs: &[(usize, ComputeJob)]) -> bool {
    let mut writers: BTreeMap<(StreamId, LogicalObjectId), usize> = BTreeMap::new();
    for (slot, job) in jobs {
        for operand in job.operands.iter().filter(|o| o.access() == Access::Write) {
            writers.insert((operand.owner(), operand.logical_object_id()), *slot);
        }
    }
    jobs.iter().any(|(slot, job)| {
        job.operands.iter().any(|operand| {
            writers
                .get(&(operand.owner(), operand.logical_object_id()))
                .is_some_and(|writer| writer != slot)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{ComputeOp, Operand};

    const X: LogicalObjectId = LogicalObjectId::new(42);

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            parallel_compute: false,
            max_passes: None,
        }
    }

    fn setup() -> (VpuScheduler, StreamId, StreamId) {
        let mut scheduler = VpuScheduler::new(settings());
        let control = scheduler.register_stream("control", CONTROL_STREAM_TYPE_ID).unwrap();
        let cpu = scheduler.register_compute_stream_type("cpu");
        let compute = scheduler.register_stream("cpu0", cpu).unwrap();
        (scheduler, control, compute)
    }

    fn noop(operands: Vec<Operand>) -> VmInstructionMsg {
        VmInstructionMsg::compute(ComputeOp::new("noop", |_| Ok(())), operands)
    }

    #[test]
    fn scheduler_starts_empty() {
        let (scheduler, _, _) = setup();
        assert_eq!(scheduler.streams().len(), 2);
        assert_eq!(scheduler.queued_instructions(), 0);
        assert!(scheduler.registry().is_empty());
        assert!(scheduler.dispatch_log().is_empty());
    }

    #[test]
    fn duplicate_stream_names_are_rejected() {
        let (mut scheduler, _, _) = setup();
        let err = scheduler.register_stream("cpu0", CONTROL_STREAM_TYPE_ID).unwrap_err();
        assert_eq!(err, SchedulerError::DuplicateStreamName("cpu0".to_string()));
    }

    #[test]
    fn unknown_stream_type_is_rejected() {
        let (mut scheduler, _, _) = setup();
        let err = scheduler.register_stream("gpu0", StreamTypeId::new(77)).unwrap_err();
        assert!(matches!(err, SchedulerError::StreamTypeNotFound(_)));
    }

    #[test]
    fn control_opcodes_only_enter_control_streams() {
        let (mut scheduler, control, compute) = setup();
        let err = scheduler
            .submit(compute, ControlStreamType.new_mirrored_object_symbol(X, false, 1))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnsupportedOpcode { .. }));

        let err = scheduler.submit(control, noop(vec![])).unwrap_err();
        assert!(matches!(err, SchedulerError::UnsupportedOpcode { .. }));
        assert_eq!(scheduler.queued_instructions(), 0);
    }

    #[test]
    fn pinned_operand_on_unknown_stream_is_rejected() {
        let (mut scheduler, _, compute) = setup();
        let bogus = StreamId::new(9);
        let err = scheduler
            .submit(compute, noop(vec![Operand::read_symbol(bogus, X)]))
            .unwrap_err();
        assert_eq!(err, SchedulerError::StreamNotFound(bogus));
    }

    #[test]
    fn running_a_control_instruction_twice_is_double_run() {
        let (mut scheduler, control, _) = setup();
        let id = scheduler
            .submit(control, ControlStreamType.new_mirrored_object_symbol(X, false, 1))
            .unwrap();
        scheduler.retain(id).unwrap();

        ControlStreamType.run(&mut scheduler, id).unwrap();
        let err = ControlStreamType.run(&mut scheduler, id).unwrap_err();
        assert_eq!(err, SchedulerError::DoubleRun(id));
        assert_eq!(scheduler.registry().len(), 1);
    }

    #[test]
    fn double_run_during_dispatch_poisons_scheduler() {
        let (mut scheduler, control, _) = setup();
        let id = scheduler
            .submit(control, ControlStreamType.new_mirrored_object_symbol(X, false, 1))
            .unwrap();
        // Simulate a scheduler bug: the head already ran but is still queued.
        ControlStreamType.run(&mut scheduler, id).unwrap();

        let err = scheduler.drain_all().unwrap_err();
        assert_eq!(err, SchedulerError::DoubleRun(id));
        assert_eq!(scheduler.drain_all().unwrap_err(), SchedulerError::Poisoned);
        assert_eq!(
            scheduler.submit(control, ControlStreamType.delete_mirrored_object_symbol(X)),
            Err(SchedulerError::Poisoned)
        );
    }

    #[test]
    fn instructions_are_freed_after_completion() {
        let (mut scheduler, control, _) = setup();
        let id = scheduler
            .submit(control, ControlStreamType.new_mirrored_object_symbol(X, false, 1))
            .unwrap();
        scheduler.drain_all().unwrap();
        assert_eq!(scheduler.instruction_state(id), None);
        assert!(scheduler.instruction(id).is_none());
    }

    #[test]
    fn caller_hold_keeps_state_visible() {
        let (mut scheduler, control, _) = setup();
        let id = scheduler
            .submit(control, ControlStreamType.new_mirrored_object_symbol(X, false, 1))
            .unwrap();
        scheduler.retain(id).unwrap();
        scheduler.drain_all().unwrap();
        assert_eq!(scheduler.instruction_state(id), Some(InstructionState::Completed));

        scheduler.release(id).unwrap();
        assert_eq!(scheduler.instruction_state(id), None);
        assert!(scheduler.release(id).is_err());
    }

    #[test]
    fn release_without_retain_is_rejected() {
        let (mut scheduler, control, _) = setup();
        let id = scheduler
            .submit(control, ControlStreamType.new_mirrored_object_symbol(X, false, 1))
            .unwrap();
        assert_eq!(scheduler.release(id), Err(SchedulerError::InstructionNotFound(id)));
        assert_eq!(scheduler.instruction_state(id), Some(InstructionState::Queued));
    }

    #[test]
    fn allocated_ids_skip_admitted_objects() {
        let (mut scheduler, control, _) = setup();
        scheduler
            .submit(control, ControlStreamType.new_mirrored_object_symbol(X, false, 1))
            .unwrap();
        assert_eq!(scheduler.allocate_logical_object_id(), Ok(LogicalObjectId::new(43)));
    }

    #[test]
    fn creating_the_largest_id_exhausts_allocation() {
        let (mut scheduler, control, _) = setup();
        let last = LogicalObjectId::new(u64::MAX);
        scheduler
            .submit(control, ControlStreamType.new_mirrored_object_symbol(last, false, 1))
            .unwrap();
        assert_eq!(
            scheduler.allocate_logical_object_id(),
            Err(SchedulerError::LogicalIdsExhausted)
        );
        scheduler.drain_all().unwrap();
        assert!(scheduler.registry().get(last, control).is_some());
    }

    #[test]
    fn write_conflicts_are_detected() {
        let (mut scheduler, control, compute) = setup();
        scheduler
            .submit(control, ControlStreamType.new_mirrored_object_symbol(X, false, 1))
            .unwrap();
        scheduler.drain_all().unwrap();

        let resolve = |operand: Operand| {
            ComputeStreamType::resolve(scheduler.registry(), compute, &operand).unwrap()
        };
        let job = |slot: usize, operands| {
            (
                slot,
                ComputeJob {
                    instruction: InstructionId::new(slot as u64),
                    stream: compute,
                    stream_type: ComputeStreamType::new("cpu"),
                    op: ComputeOp::new("noop", |_| Ok(())),
                    operands,
                },
            )
        };

        let readers = [job(0, vec![resolve(Operand::read(X))]), job(1, vec![resolve(Operand::read(X))])];
        assert!(!has_write_conflict(&readers));

        let mixed = [job(0, vec![resolve(Operand::write(X))]), job(1, vec![resolve(Operand::read(X))])];
        assert!(has_write_conflict(&mixed));
    }
}
