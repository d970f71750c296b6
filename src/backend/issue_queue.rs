use std::cell::RefCell;
use std::fmt;
use std::fmt::Display;
use std::rc::Rc;

use log::{debug, trace, warn};
use serde::Deserialize;

use crate::backend::execution_unit::{AluRoundRobin, FU_CNT, FuId, FuReadyBitmap};
use crate::backend::reorder_buffer::RobView;
use crate::backend::reservation_station::{RS, RSTable};
use crate::cpu::{CPUConfig, PerfCounters, Trace};
use crate::instructions::instructions::{Classified, DecodedInstr, RegisterType, WordType};

// The number of issue channels leaving the queue every tick.
pub const ISSUE_WIDTH: usize = 3;

/// What the allocator does with an instruction whose decoder fields did not
/// classify to a known operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize)]
pub enum UnclassifiedPolicy {
    /// Allocate it like any other ALU-class instruction; it executes as a no-op.
    PassThrough,
    /// Consume it without allocating a slot.
    #[default]
    Reject,
}

/// The single result broadcast of the functional-unit write-back path.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CDBBroadcast {
    pub tag: RegisterType,
    pub value: WordType,
}

/// The payload of one granted issue channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IssueChannel {
    // the slot the instruction was issued from (already free again)
    pub rs_index: u16,
    pub operation: Classified,
    pub src1: RegisterType,
    pub src2: RegisterType,
    pub dest: RegisterType,
    pub src1_value: WordType,
    pub src2_value: WordType,
    pub imm: WordType,
    pub fu: FuId,
}

impl Display for IssueChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x{} <- x{}={:#x} x{}={:#x} imm={:#x} [RS {} on {}]",
               self.operation,
               self.dest,
               self.src1,
               self.src1_value,
               self.src2,
               self.src2_value,
               self.imm,
               self.rs_index,
               self.fu)
    }
}

/// Backpressure, split by cause.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StallSignals {
    /// No free slot in the queue; a pending instruction was not accepted.
    pub queue_full: bool,
    /// At least one slot is occupied but nothing could be issued.
    pub no_progress: bool,
}

impl StallSignals {
    /// The combined stall line.
    pub fn any(&self) -> bool {
        self.queue_full || self.no_progress
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocOutcome {
    /// Nothing was presented.
    Idle,
    Allocated { rs_index: u16, fu: FuId },
    /// The instruction was not accepted and has to be presented again.
    QueueFull,
    /// The instruction was consumed without being allocated.
    Rejected,
}

impl AllocOutcome {
    /// True when the presented instruction was consumed this tick.
    pub fn consumed(&self) -> bool {
        matches!(self, AllocOutcome::Allocated { .. } | AllocOutcome::Rejected)
    }
}

/// Signals sampled at the start of a tick.
#[derive(Clone, Copy, Debug)]
pub struct TickInputs<'a> {
    pub reset: bool,
    pub pending: Option<DecodedInstr>,
    pub rob: &'a RobView,
    pub fu_ready: FuReadyBitmap,
    pub broadcast: Option<CDBBroadcast>,
}

impl<'a> TickInputs<'a> {
    /// A tick with no pending instruction, no broadcast and no ready unit.
    pub fn idle(rob: &'a RobView) -> Self {
        TickInputs {
            reset: false,
            pending: None,
            rob,
            fu_ready: FuReadyBitmap::none(),
            broadcast: None,
        }
    }
}

/// Signals produced by a tick.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TickOutputs {
    pub channels: [Option<IssueChannel>; ISSUE_WIDTH],
    pub stall: StallSignals,
    pub alloc: AllocOutcome,
}

impl TickOutputs {
    fn quiet() -> Self {
        TickOutputs {
            channels: [None; ISSUE_WIDTH],
            stall: StallSignals::default(),
            alloc: AllocOutcome::Idle,
        }
    }

    /// The granted channels, in channel order.
    pub fn granted(&self) -> impl Iterator<Item = &IssueChannel> + '_ {
        self.channels.iter().flatten()
    }

    pub fn grant_count(&self) -> usize {
        self.granted().count()
    }
}

/// The committed state of the queue: everything that survives a clock edge.
#[derive(Clone, Debug, PartialEq, Eq)]
struct QueueState {
    rs_table: RSTable,
    alu_cursor: AluRoundRobin,
}

impl QueueState {
    fn new(capacity: u16) -> Self {
        QueueState {
            rs_table: RSTable::new(capacity),
            alu_cursor: AluRoundRobin::default(),
        }
    }

    fn flush(&mut self) {
        self.rs_table.flush();
        self.alu_cursor = AluRoundRobin::default();
    }
}

struct AllocationPlan {
    outcome: AllocOutcome,
    entry: Option<(u16, RS)>,
    alu_cursor: AluRoundRobin,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Source {
    Src1,
    Src2,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Wakeup {
    rs_index: u16,
    source: Source,
    value: WordType,
}

struct Selection {
    channels: [Option<IssueChannel>; ISSUE_WIDTH],
    grant_cnt: usize,
}

fn plan_allocation(state: &QueueState,
                   pending: Option<&DecodedInstr>,
                   rob: &RobView,
                   policy: UnclassifiedPolicy) -> AllocationPlan {
    let mut plan = AllocationPlan {
        outcome: AllocOutcome::Idle,
        entry: None,
        alu_cursor: state.alu_cursor,
    };

    let instr = match pending {
        None => return plan,
        Some(instr) => instr,
    };

    if instr.classified == Classified::Unclassified && policy == UnclassifiedPolicy::Reject {
        plan.outcome = AllocOutcome::Rejected;
        return plan;
    }

    let rs_index = match state.rs_table.first_free() {
        None => {
            plan.outcome = AllocOutcome::QueueFull;
            return plan;
        }
        Some(rs_index) => rs_index,
    };

    let fu = if instr.classified.is_memory() {
        FuId::MEM
    } else {
        plan.alu_cursor = state.alu_cursor.advanced();
        state.alu_cursor.current()
    };

    let src1_ready = rob.is_ready(instr.src1);
    let src2_ready = rob.is_ready(instr.src2);

    let rs = RS {
        occupied: true,
        operation: instr.classified,
        dest: instr.dest,
        src1: instr.src1,
        src2: instr.src2,
        src1_ready,
        src2_ready,
        // a value that is not ready yet is undefined until wakeup
        src1_value: if src1_ready { instr.src1_value } else { 0 },
        src2_value: if src2_ready { instr.src2_value } else { 0 },
        imm: instr.imm,
        fu,
    };

    plan.outcome = AllocOutcome::Allocated { rs_index, fu };
    plan.entry = Some((rs_index, rs));
    plan
}

fn wake_source(tag: RegisterType, broadcast: Option<CDBBroadcast>, rob: &RobView) -> Option<WordType> {
    match broadcast {
        Some(cdb) if cdb.tag == tag => Some(cdb.value),
        _ if rob.is_ready(tag) => Some(rob.get_value(tag)),
        _ => None,
    }
}

fn plan_wakeup(state: &QueueState, broadcast: Option<CDBBroadcast>, rob: &RobView) -> Vec<Wakeup> {
    let mut wakeups = Vec::new();

    for (rs_index, rs) in state.rs_table.occupied() {
        if !rs.src1_ready {
            if let Some(value) = wake_source(rs.src1, broadcast, rob) {
                wakeups.push(Wakeup { rs_index, source: Source::Src1, value });
            }
        }

        if !rs.src2_ready {
            if let Some(value) = wake_source(rs.src2, broadcast, rob) {
                wakeups.push(Wakeup { rs_index, source: Source::Src2, value });
            }
        }
    }

    wakeups
}

fn plan_select(state: &QueueState, fu_ready: FuReadyBitmap) -> Selection {
    let mut selection = Selection {
        channels: [None; ISSUE_WIDTH],
        grant_cnt: 0,
    };
    let mut taken = [false; FU_CNT];

    for (rs_index, rs) in state.rs_table.occupied() {
        if selection.grant_cnt == ISSUE_WIDTH {
            break;
        }

        if !rs.is_ready() || !fu_ready.is_ready(rs.fu) || taken[rs.fu.index()] {
            continue;
        }

        taken[rs.fu.index()] = true;
        selection.channels[selection.grant_cnt] = Some(IssueChannel {
            rs_index,
            operation: rs.operation,
            src1: rs.src1,
            src2: rs.src2,
            dest: rs.dest,
            src1_value: rs.src1_value,
            src2_value: rs.src2_value,
            imm: rs.imm,
            fu: rs.fu,
        });
        selection.grant_cnt += 1;
    }

    selection
}

/// The issue queue: a fixed array of reservation stations advanced one
/// clock tick at a time.
///
/// Allocation, wakeup and selection are each planned from the same committed
/// snapshot; the plans are merged into a back buffer which becomes the new
/// committed state at the end of the tick. No rule observes another rule's
/// same-tick effect.
pub struct IssueQueue {
    current: QueueState,
    next: QueueState,
    policy: UnclassifiedPolicy,
    trace: Trace,
    perf_counters: Rc<RefCell<PerfCounters>>,
}

impl IssueQueue {
    pub fn new(cpu_config: &CPUConfig, perf_counters: Rc<RefCell<PerfCounters>>) -> IssueQueue {
        IssueQueue {
            current: QueueState::new(cpu_config.rs_count),
            next: QueueState::new(cpu_config.rs_count),
            policy: cpu_config.unclassified_policy,
            trace: cpu_config.trace.clone(),
            perf_counters,
        }
    }

    /// A queue with its own performance counters and no tracing.
    pub fn with_capacity(capacity: u16, policy: UnclassifiedPolicy) -> IssueQueue {
        let mut cpu_config = CPUConfig::default();
        cpu_config.rs_count = capacity;
        cpu_config.unclassified_policy = policy;
        IssueQueue::new(&cpu_config, Rc::new(RefCell::new(PerfCounters::new())))
    }

    pub fn capacity(&self) -> u16 {
        self.current.rs_table.capacity()
    }

    pub fn slot(&self, rs_index: u16) -> &RS {
        self.current.rs_table.get(rs_index)
    }

    pub fn occupied_count(&self) -> u16 {
        self.current.rs_table.occupied_count()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied_count() == 0
    }

    /// The ALU the next ALU-class instruction will be assigned to.
    pub fn alu_cursor(&self) -> FuId {
        self.current.alu_cursor.current()
    }

    pub fn perf_counters(&self) -> Rc<RefCell<PerfCounters>> {
        Rc::clone(&self.perf_counters)
    }

    /// Advances the queue by one clock tick.
    pub fn tick(&mut self, inputs: &TickInputs) -> TickOutputs {
        if inputs.reset {
            self.reset();
            return TickOutputs::quiet();
        }

        let snapshot = &self.current;

        let allocation = plan_allocation(snapshot, inputs.pending.as_ref(), inputs.rob, self.policy);
        let wakeups = plan_wakeup(snapshot, inputs.broadcast, inputs.rob);
        let selection = plan_select(snapshot, inputs.fu_ready);

        let stall = StallSignals {
            queue_full: !snapshot.rs_table.has_free(),
            no_progress: selection.grant_cnt == 0 && snapshot.rs_table.occupied_count() > 0,
        };

        self.trace_plans(inputs, &allocation, &wakeups, &selection, &stall);
        self.count(&allocation, &wakeups, &selection, &stall);

        self.commit(allocation.entry, allocation.alu_cursor, &wakeups, &selection);

        TickOutputs {
            channels: selection.channels,
            stall,
            alloc: allocation.outcome,
        }
    }

    fn commit(&mut self,
              entry: Option<(u16, RS)>,
              alu_cursor: AluRoundRobin,
              wakeups: &[Wakeup],
              selection: &Selection) {
        self.next.clone_from(&self.current);
        let rs_table = &mut self.next.rs_table;

        for wakeup in wakeups {
            let rs = rs_table.get_mut(wakeup.rs_index);
            debug_assert!(rs.occupied);
            match wakeup.source {
                Source::Src1 => {
                    rs.src1_ready = true;
                    rs.src1_value = wakeup.value;
                }
                Source::Src2 => {
                    rs.src2_ready = true;
                    rs.src2_value = wakeup.value;
                }
            }
        }

        for channel in selection.channels.iter().flatten() {
            rs_table.deallocate(channel.rs_index);
        }

        if let Some((rs_index, rs)) = entry {
            let slot = rs_table.get_mut(rs_index);
            debug_assert!(!slot.occupied, "RS {} allocated while occupied", rs_index);
            *slot = rs;
        }

        self.next.alu_cursor = alu_cursor;
        std::mem::swap(&mut self.current, &mut self.next);
    }

    fn reset(&mut self) {
        debug!("Issue queue reset");
        self.current.flush();
        self.next.flush();
        *self.perf_counters.borrow_mut() = PerfCounters::new();
    }

    fn count(&self, allocation: &AllocationPlan, wakeups: &[Wakeup], selection: &Selection, stall: &StallSignals) {
        let mut perf_counters = self.perf_counters.borrow_mut();
        match allocation.outcome {
            AllocOutcome::Allocated { .. } => perf_counters.allocate_cnt += 1,
            AllocOutcome::Rejected => perf_counters.reject_cnt += 1,
            AllocOutcome::Idle | AllocOutcome::QueueFull => {}
        }
        perf_counters.wakeup_cnt += wakeups.len() as u64;
        perf_counters.issue_cnt += selection.grant_cnt as u64;
        if stall.queue_full {
            perf_counters.queue_full_stall_cnt += 1;
        }
        if stall.no_progress {
            perf_counters.no_progress_stall_cnt += 1;
        }
    }

    fn trace_plans(&self,
                   inputs: &TickInputs,
                   allocation: &AllocationPlan,
                   wakeups: &[Wakeup],
                   selection: &Selection,
                   stall: &StallSignals) {
        match (allocation.outcome, inputs.pending) {
            (AllocOutcome::Allocated { rs_index, fu }, Some(instr)) => {
                if self.trace.allocate {
                    debug!("Allocate RS {} [{} x{} <- x{} x{}] on {}", rs_index, instr.classified, instr.dest, instr.src1, instr.src2, fu);
                }
            }
            (AllocOutcome::Rejected, Some(instr)) => {
                warn!("Rejected unclassified instruction [x{} <- x{} x{}]", instr.dest, instr.src1, instr.src2);
            }
            (AllocOutcome::QueueFull, _) => debug!("Allocation stalled: queue full"),
            _ => {}
        }

        if self.trace.wakeup {
            if let Some(cdb) = inputs.broadcast {
                debug!("CDB broadcast x{}={:#x}", cdb.tag, cdb.value);
            }
            for wakeup in wakeups {
                debug!("Wakeup RS {} {:?}={:#x}", wakeup.rs_index, wakeup.source, wakeup.value);
            }
        }

        if self.trace.select {
            for channel in selection.channels.iter().flatten() {
                debug!("Issued [{}]", channel);
            }
        }

        if stall.no_progress {
            trace!("No issuable candidate among {} occupied RS", self.occupied_count());
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::instructions::instructions::Opcode;

    const ADD: Classified = Classified::Recognized(Opcode::ADD);
    const LW: Classified = Classified::Recognized(Opcode::LW);
    const SW: Classified = Classified::Recognized(Opcode::SW);

    fn queue() -> IssueQueue {
        IssueQueue::with_capacity(16, UnclassifiedPolicy::Reject)
    }

    fn dispatch(queue: &mut IssueQueue, instr: DecodedInstr, rob: &RobView) -> TickOutputs {
        let mut inputs = TickInputs::idle(rob);
        inputs.pending = Some(instr);
        queue.tick(&inputs)
    }

    fn select(queue: &mut IssueQueue, fu_ready: FuReadyBitmap, rob: &RobView) -> TickOutputs {
        let mut inputs = TickInputs::idle(rob);
        inputs.fu_ready = fu_ready;
        queue.tick(&inputs)
    }

    fn ready_rob(regs: &[(RegisterType, WordType)]) -> RobView {
        let mut rob = RobView::new();
        for &(reg, value) in regs {
            rob.resolve(reg, value);
        }
        rob
    }

    #[test]
    fn test_add_is_allocated_then_issued() {
        let mut queue = queue();
        let rob = ready_rob(&[(5, 1), (2, 1)]);
        let add = DecodedInstr::new(ADD, 4, 5, 2).with_values(1, 1);

        // tick T
        let mut inputs = TickInputs::idle(&rob);
        inputs.pending = Some(add);
        inputs.fu_ready = FuReadyBitmap::from_units(&[FuId::ALU0]);
        let out = queue.tick(&inputs);
        assert_eq!(out.alloc, AllocOutcome::Allocated { rs_index: 0, fu: FuId::ALU0 });
        assert_eq!(out.grant_count(), 0);
        assert!(!out.stall.any());
        assert!(queue.slot(0).occupied);

        // tick T+1
        let out = select(&mut queue, FuReadyBitmap::from_units(&[FuId::ALU0]), &rob);
        let channel = out.channels[0].expect("first channel should be granted");
        assert_eq!(channel.src1_value, 1);
        assert_eq!(channel.src2_value, 1);
        assert_eq!(channel.dest, 4);
        assert_eq!(channel.fu, FuId::ALU0);
        assert_eq!(channel.rs_index, 0);
        assert_eq!(out.channels[1], None);
        assert_eq!(out.channels[2], None);

        // tick T+2
        assert!(!queue.slot(0).occupied);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_stalls_and_leaves_slots_unchanged() {
        let mut queue = IssueQueue::with_capacity(4, UnclassifiedPolicy::Reject);
        let rob = RobView::new();

        for k in 0..4 {
            let out = dispatch(&mut queue, DecodedInstr::new(ADD, k + 10, 1, 2), &rob);
            assert_eq!(out.alloc, AllocOutcome::Allocated { rs_index: k, fu: if k % 2 == 0 { FuId::ALU0 } else { FuId::ALU1 } });
        }
        assert_eq!(queue.occupied_count(), 4);

        let before: Vec<RS> = (0..4).map(|k| *queue.slot(k)).collect();
        let cursor_before = queue.alu_cursor();

        let out = dispatch(&mut queue, DecodedInstr::new(ADD, 20, 1, 2), &rob);
        assert_eq!(out.alloc, AllocOutcome::QueueFull);
        assert!(!out.alloc.consumed());
        assert!(out.stall.queue_full);
        let after: Vec<RS> = (0..4).map(|k| *queue.slot(k)).collect();
        assert_eq!(before, after);
        assert_eq!(queue.alu_cursor(), cursor_before);
    }

    #[test]
    fn test_same_unit_contention_grants_one_per_tick() {
        let mut queue = queue();
        let rob = RobView::all_ready();

        dispatch(&mut queue, DecodedInstr::new(LW, 3, 1, 0), &rob);
        dispatch(&mut queue, DecodedInstr::new(LW, 4, 1, 0), &rob);
        assert_eq!(queue.slot(0).fu, FuId::MEM);
        assert_eq!(queue.slot(1).fu, FuId::MEM);

        let out = select(&mut queue, FuReadyBitmap::all(), &rob);
        assert_eq!(out.grant_count(), 1);
        assert_eq!(out.channels[0].map(|c| c.rs_index), Some(0));
        assert!(queue.slot(1).occupied);

        let out = select(&mut queue, FuReadyBitmap::all(), &rob);
        assert_eq!(out.channels[0].map(|c| c.rs_index), Some(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut queue = queue();
        let rob = RobView::new();
        for k in 0..5 {
            dispatch(&mut queue, DecodedInstr::new(ADD, k, 1, 2), &rob);
        }
        assert_eq!(queue.occupied_count(), 5);
        assert_eq!(queue.alu_cursor(), FuId::ALU1);

        let mut inputs = TickInputs::idle(&rob);
        inputs.reset = true;
        // a reset tick ignores whatever is pending
        inputs.pending = Some(DecodedInstr::new(ADD, 9, 1, 2));
        let out = queue.tick(&inputs);
        assert_eq!(out.alloc, AllocOutcome::Idle);
        assert_eq!(out.grant_count(), 0);
        assert!(!out.stall.any());
        assert!(queue.is_empty());
        assert_eq!(queue.alu_cursor(), FuId::ALU0);
        assert_eq!(queue.perf_counters().borrow().allocate_cnt, 0);

        let out = dispatch(&mut queue, DecodedInstr::new(ADD, 9, 1, 2), &rob);
        assert_eq!(out.alloc, AllocOutcome::Allocated { rs_index: 0, fu: FuId::ALU0 });
        assert!(!out.stall.any());
    }

    #[test]
    fn test_round_robin_is_periodic_over_alus() {
        let mut queue = queue();
        let rob = RobView::new();
        let mut units = Vec::new();
        for k in 0..8 {
            if let AllocOutcome::Allocated { fu, .. } = dispatch(&mut queue, DecodedInstr::new(ADD, k, 1, 2), &rob).alloc {
                units.push(fu);
            }
        }
        assert_eq!(units, vec![FuId::ALU0, FuId::ALU1, FuId::ALU0, FuId::ALU1,
                               FuId::ALU0, FuId::ALU1, FuId::ALU0, FuId::ALU1]);
    }

    #[test]
    fn test_alu_instruction_is_never_assigned_the_memory_unit() {
        // A raw modulus over the total unit count would hand every third
        // ALU-class instruction to MEM.
        let mut queue = queue();
        let rob = RobView::new();
        for k in 0..16 {
            let out = dispatch(&mut queue, DecodedInstr::new(ADD, k, 1, 2), &rob);
            match out.alloc {
                AllocOutcome::Allocated { fu, .. } => assert_ne!(fu, FuId::MEM),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[test]
    fn test_memory_ops_do_not_advance_cursor() {
        let mut queue = queue();
        let rob = RobView::new();
        dispatch(&mut queue, DecodedInstr::new(ADD, 3, 1, 2), &rob);
        assert_eq!(queue.alu_cursor(), FuId::ALU1);

        let out = dispatch(&mut queue, DecodedInstr::new(SW, 0, 1, 2), &rob);
        assert_eq!(out.alloc, AllocOutcome::Allocated { rs_index: 1, fu: FuId::MEM });
        assert_eq!(queue.alu_cursor(), FuId::ALU1);

        let out = dispatch(&mut queue, DecodedInstr::new(ADD, 4, 1, 2), &rob);
        assert_eq!(out.alloc, AllocOutcome::Allocated { rs_index: 2, fu: FuId::ALU1 });
    }

    #[test]
    fn test_allocation_captures_ready_values_only() {
        let mut queue = queue();
        let rob = ready_rob(&[(5, 7)]);
        dispatch(&mut queue, DecodedInstr::new(ADD, 4, 5, 6).with_values(7, 99), &rob);

        let rs = queue.slot(0);
        assert!(rs.src1_ready);
        assert_eq!(rs.src1_value, 7);
        assert!(!rs.src2_ready);
    }

    #[test]
    fn test_broadcast_wakes_every_matching_source() {
        let mut queue = queue();
        let rob = RobView::new();
        dispatch(&mut queue, DecodedInstr::new(ADD, 10, 3, 3), &rob);
        dispatch(&mut queue, DecodedInstr::new(ADD, 11, 4, 3), &rob);
        dispatch(&mut queue, DecodedInstr::new(ADD, 12, 4, 4), &rob);

        let mut inputs = TickInputs::idle(&rob);
        inputs.broadcast = Some(CDBBroadcast { tag: 3, value: 0x33 });
        queue.tick(&inputs);

        let rs = queue.slot(0);
        assert!(rs.src1_ready && rs.src2_ready);
        assert_eq!((rs.src1_value, rs.src2_value), (0x33, 0x33));

        let rs = queue.slot(1);
        assert!(!rs.src1_ready);
        assert!(rs.src2_ready);
        assert_eq!(rs.src2_value, 0x33);

        let rs = queue.slot(2);
        assert!(!rs.src1_ready && !rs.src2_ready);
    }

    #[test]
    fn test_rob_bitmap_wakes_waiting_source() {
        let mut queue = queue();
        let rob = RobView::new();
        dispatch(&mut queue, DecodedInstr::new(ADD, 10, 3, 0), &rob);
        assert!(!queue.slot(0).src1_ready);

        let rob = ready_rob(&[(3, 21), (0, 0)]);
        queue.tick(&TickInputs::idle(&rob));
        let rs = queue.slot(0);
        assert!(rs.src1_ready && rs.src2_ready);
        assert_eq!(rs.src1_value, 21);
    }

    #[test]
    fn test_duplicate_wakeup_keeps_first_value() {
        let mut queue = queue();
        let rob = RobView::new();
        dispatch(&mut queue, DecodedInstr::new(ADD, 10, 3, 4), &rob);

        let mut inputs = TickInputs::idle(&rob);
        inputs.broadcast = Some(CDBBroadcast { tag: 3, value: 1 });
        queue.tick(&inputs);
        inputs.broadcast = Some(CDBBroadcast { tag: 3, value: 2 });
        queue.tick(&inputs);

        let rs = queue.slot(0);
        assert!(rs.src1_ready);
        assert_eq!(rs.src1_value, 1);
        assert!(!rs.src2_ready);
    }

    #[test]
    fn test_same_tick_broadcast_is_not_visible_to_select() {
        let mut queue = queue();
        let rob = ready_rob(&[(1, 1)]);
        dispatch(&mut queue, DecodedInstr::new(ADD, 10, 1, 3).with_values(1, 0), &rob);

        let mut inputs = TickInputs::idle(&rob);
        inputs.fu_ready = FuReadyBitmap::all();
        inputs.broadcast = Some(CDBBroadcast { tag: 3, value: 5 });
        let out = queue.tick(&inputs);
        assert_eq!(out.grant_count(), 0);
        assert!(out.stall.no_progress);
        assert!(queue.slot(0).src2_ready);

        inputs.broadcast = None;
        let out = queue.tick(&inputs);
        assert_eq!(out.channels[0].map(|c| c.src2_value), Some(5));
    }

    #[test]
    fn test_same_tick_broadcast_misses_new_allocation() {
        let mut queue = queue();
        let rob = RobView::new();
        let mut inputs = TickInputs::idle(&rob);
        inputs.pending = Some(DecodedInstr::new(ADD, 10, 3, 3));
        inputs.broadcast = Some(CDBBroadcast { tag: 3, value: 5 });
        queue.tick(&inputs);

        let rs = queue.slot(0);
        assert!(!rs.src1_ready && !rs.src2_ready);
    }

    #[test]
    fn test_allocation_does_not_use_slot_freed_in_same_tick() {
        let mut queue = IssueQueue::with_capacity(2, UnclassifiedPolicy::Reject);
        let rob = RobView::all_ready();
        dispatch(&mut queue, DecodedInstr::new(ADD, 10, 1, 2), &rob);
        dispatch(&mut queue, DecodedInstr::new(ADD, 11, 1, 2), &rob);

        let mut inputs = TickInputs::idle(&rob);
        inputs.fu_ready = FuReadyBitmap::all();
        inputs.pending = Some(DecodedInstr::new(ADD, 12, 1, 2));
        let out = queue.tick(&inputs);
        assert_eq!(out.grant_count(), 2);
        assert_eq!(out.alloc, AllocOutcome::QueueFull);
        assert!(out.stall.queue_full);
        assert!(!out.stall.no_progress);
        assert!(queue.is_empty());

        let out = queue.tick(&inputs);
        assert_eq!(out.alloc, AllocOutcome::Allocated { rs_index: 0, fu: FuId::ALU0 });
    }

    #[test]
    fn test_no_progress_when_nothing_is_issuable() {
        let mut queue = queue();
        let rob = RobView::all_ready();
        dispatch(&mut queue, DecodedInstr::new(ADD, 10, 1, 2), &rob);

        // ready operands but its unit is busy
        let out = select(&mut queue, FuReadyBitmap::from_units(&[FuId::ALU1, FuId::MEM]), &rob);
        assert!(out.stall.no_progress);
        assert!(!out.stall.queue_full);
        assert!(out.channels.iter().all(|c| c.is_none()));
        assert_eq!(queue.occupied_count(), 1);
    }

    #[test]
    fn test_empty_queue_is_not_a_stall() {
        let mut queue = queue();
        let rob = RobView::new();
        let out = select(&mut queue, FuReadyBitmap::all(), &rob);
        assert!(!out.stall.any());
    }

    #[test]
    fn test_three_distinct_units_issue_together() {
        let mut queue = queue();
        let rob = RobView::all_ready();
        dispatch(&mut queue, DecodedInstr::new(ADD, 10, 1, 2), &rob);
        dispatch(&mut queue, DecodedInstr::new(ADD, 11, 1, 2), &rob);
        dispatch(&mut queue, DecodedInstr::new(ADD, 12, 1, 2), &rob);
        dispatch(&mut queue, DecodedInstr::new(LW, 13, 1, 0), &rob);

        let out = select(&mut queue, FuReadyBitmap::all(), &rob);
        let granted: Vec<(u16, FuId)> = out.granted().map(|c| (c.rs_index, c.fu)).collect();
        // slot 2 targets ALU0 again and has to wait
        assert_eq!(granted, vec![(0, FuId::ALU0), (1, FuId::ALU1), (3, FuId::MEM)]);
        assert_eq!(queue.occupied_count(), 1);
        assert!(queue.slot(2).occupied);
    }

    #[test]
    fn test_lower_index_wins_over_older_instruction() {
        let mut queue = queue();
        let rob = RobView::all_ready();
        let mem_only = FuReadyBitmap::from_units(&[FuId::MEM]);

        dispatch(&mut queue, DecodedInstr::new(LW, 20, 1, 0), &rob);
        dispatch(&mut queue, DecodedInstr::new(LW, 21, 1, 0), &rob);
        // the first load leaves slot 0
        assert_eq!(select(&mut queue, mem_only, &rob).channels[0].map(|c| c.dest), Some(20));
        // a younger load reuses slot 0
        dispatch(&mut queue, DecodedInstr::new(LW, 22, 1, 0), &rob);

        let out = select(&mut queue, mem_only, &rob);
        assert_eq!(out.channels[0].map(|c| (c.rs_index, c.dest)), Some((0, 22)));
        assert_eq!(queue.slot(1).dest, 21);
    }

    #[test]
    fn test_reject_policy_consumes_unclassified() {
        let mut queue = queue();
        let rob = RobView::new();
        let out = dispatch(&mut queue, DecodedInstr::new(Classified::Unclassified, 1, 2, 3), &rob);
        assert_eq!(out.alloc, AllocOutcome::Rejected);
        assert!(out.alloc.consumed());
        assert!(queue.is_empty());
        assert_eq!(queue.perf_counters().borrow().reject_cnt, 1);
    }

    #[test]
    fn test_pass_through_policy_allocates_unclassified_to_alu() {
        let mut queue = IssueQueue::with_capacity(16, UnclassifiedPolicy::PassThrough);
        let rob = RobView::all_ready();
        let out = dispatch(&mut queue, DecodedInstr::new(Classified::Unclassified, 1, 2, 3), &rob);
        assert_eq!(out.alloc, AllocOutcome::Allocated { rs_index: 0, fu: FuId::ALU0 });
        assert_eq!(queue.slot(0).operation, Classified::Unclassified);

        let out = select(&mut queue, FuReadyBitmap::all(), &rob);
        assert_eq!(out.channels[0].map(|c| c.operation), Some(Classified::Unclassified));
    }

    #[test]
    fn test_perf_counters() {
        let mut queue = IssueQueue::with_capacity(1, UnclassifiedPolicy::Reject);
        let rob = RobView::all_ready();
        dispatch(&mut queue, DecodedInstr::new(ADD, 10, 1, 2), &rob);
        dispatch(&mut queue, DecodedInstr::new(ADD, 11, 1, 2), &rob);
        select(&mut queue, FuReadyBitmap::all(), &rob);

        let perf_counters = queue.perf_counters();
        let perf_counters = perf_counters.borrow();
        assert_eq!(perf_counters.allocate_cnt, 1);
        assert_eq!(perf_counters.issue_cnt, 1);
        // the second dispatch and the select both saw a full queue
        assert_eq!(perf_counters.queue_full_stall_cnt, 2);
        // the second dispatch had a ready slot but no ready unit
        assert_eq!(perf_counters.no_progress_stall_cnt, 1);
    }

    const TAGS: u16 = 8;

    #[derive(Clone, Debug)]
    struct Stimulus {
        pending: Option<(u8, u16, u16, u16)>,
        rob_bits: u8,
        fu_bits: u8,
        broadcast: Option<(u16, u32)>,
    }

    fn stimulus() -> impl Strategy<Value = Stimulus> {
        (
            proptest::option::of((0u8..4, 0..TAGS, 0..TAGS, 0..TAGS)),
            any::<u8>(),
            0u8..8,
            proptest::option::of((0..TAGS, any::<u32>())),
        ).prop_map(|(pending, rob_bits, fu_bits, broadcast)| Stimulus { pending, rob_bits, fu_bits, broadcast })
    }

    fn classified(kind: u8) -> Classified {
        match kind {
            0 => ADD,
            1 => LW,
            2 => SW,
            _ => Classified::Unclassified,
        }
    }

    proptest! {
        #[test]
        fn prop_tick_invariants(ticks in proptest::collection::vec(stimulus(), 1..64)) {
            let mut queue = IssueQueue::with_capacity(6, UnclassifiedPolicy::PassThrough);

            for stimulus in ticks {
                let rob = RobView::from_bitmap(stimulus.rob_bits as u128);
                let fu_ready = FuReadyBitmap::from_units(
                    &crate::backend::execution_unit::ALL_UNITS.iter()
                        .copied()
                        .filter(|unit| stimulus.fu_bits & (1 << unit.index()) != 0)
                        .collect::<Vec<FuId>>());
                let inputs = TickInputs {
                    reset: false,
                    pending: stimulus.pending.map(|(kind, dest, src1, src2)| DecodedInstr::new(classified(kind), dest, src1, src2)),
                    rob: &rob,
                    fu_ready,
                    broadcast: stimulus.broadcast.map(|(tag, value)| CDBBroadcast { tag, value }),
                };

                let before: Vec<RS> = (0..queue.capacity()).map(|k| *queue.slot(k)).collect();
                let occupied_before = before.iter().filter(|rs| rs.occupied).count();
                let out = queue.tick(&inputs);
                let after: Vec<RS> = (0..queue.capacity()).map(|k| *queue.slot(k)).collect();

                let filled = (0..before.len()).filter(|&k| !before[k].occupied && after[k].occupied).count();
                let freed: Vec<u16> = (0..before.len()).filter(|&k| before[k].occupied && !after[k].occupied).map(|k| k as u16).collect();
                prop_assert!(filled <= 1);
                prop_assert!(freed.len() <= ISSUE_WIDTH);

                let mut granted: Vec<u16> = out.granted().map(|c| c.rs_index).collect();
                granted.sort();
                prop_assert_eq!(&granted, &freed);

                let mut units: Vec<FuId> = out.granted().map(|c| c.fu).collect();
                units.sort();
                units.dedup();
                prop_assert_eq!(units.len(), out.grant_count());
                for channel in out.granted() {
                    prop_assert!(before[channel.rs_index as usize].is_ready());
                    prop_assert!(fu_ready.is_ready(channel.fu));
                }

                // granted channels are packed from the first channel on
                let packed = out.channels.iter().skip_while(|c| c.is_some()).all(|c| c.is_none());
                prop_assert!(packed);

                for k in 0..before.len() {
                    if before[k].occupied && after[k].occupied {
                        prop_assert!(!before[k].src1_ready || after[k].src1_ready);
                        prop_assert!(!before[k].src2_ready || after[k].src2_ready);
                        if before[k].src1_ready {
                            prop_assert_eq!(before[k].src1_value, after[k].src1_value);
                        }
                    }
                }

                prop_assert_eq!(out.stall.queue_full, occupied_before == before.len());
                prop_assert_eq!(out.stall.no_progress, occupied_before > 0 && out.grant_count() == 0);
                if out.stall.queue_full {
                    prop_assert_eq!(filled, 0);
                }
            }
        }
    }
}
