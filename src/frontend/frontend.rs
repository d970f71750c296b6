use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace};

use crate::backend::reorder_buffer::RobView;
use crate::cpu::{CPUConfig, PerfCounters, Trace};
use crate::instructions::instructions::DecodedInstr;
use crate::loader::loader::Scenario;

/// Presents the program to the issue queue, one instruction per cycle.
///
/// An instruction stays pending until the issue queue consumes it, so a
/// stalled queue sees the same instruction again on the next cycle.
pub(crate) struct Frontend {
    scenario_option: Option<Rc<Scenario>>,
    ip_next_fetch: usize,
    trace: Trace,
    perf_counters: Rc<RefCell<PerfCounters>>,
}

impl Frontend {
    pub(crate) fn new(cpu_config: &CPUConfig, perf_counters: Rc<RefCell<PerfCounters>>) -> Frontend {
        Frontend {
            scenario_option: None,
            ip_next_fetch: 0,
            trace: cpu_config.trace.clone(),
            perf_counters,
        }
    }

    pub(crate) fn init(&mut self, scenario: &Rc<Scenario>) {
        self.scenario_option = Some(Rc::clone(scenario));
        self.ip_next_fetch = 0;
    }

    pub(crate) fn is_done(&self) -> bool {
        match &self.scenario_option {
            None => true,
            Some(scenario) => self.ip_next_fetch >= scenario.program.len(),
        }
    }

    /// The instruction to present this cycle with its operand values read
    /// from the register file.
    ///
    /// Without renaming a second in-flight write to the same register would
    /// be lost, so an instruction whose destination is still awaiting a
    /// value is held back.
    pub(crate) fn pending(&self, rob: &RobView) -> Option<DecodedInstr> {
        let scenario = self.scenario_option.as_ref()?;
        let instr = scenario.program.get(self.ip_next_fetch)?;

        let writes_dest = instr.classified.opcode().map_or(false, |opcode| opcode.writes_dest());
        if writes_dest && !rob.is_ready(instr.dest) {
            trace!("Frontend: holding [{}] until x{} is written", instr, instr.dest);
            return None;
        }

        Some(DecodedInstr {
            classified: instr.classified,
            dest: instr.dest,
            src1: instr.src1,
            src1_value: rob.get_value(instr.src1),
            src2: instr.src2,
            src2_value: rob.get_value(instr.src2),
            imm: instr.imm,
        })
    }

    /// Moves past the pending instruction once the issue queue consumed it.
    pub(crate) fn advance(&mut self) {
        if let Some(scenario) = &self.scenario_option {
            if self.trace.allocate {
                if let Some(instr) = scenario.program.get(self.ip_next_fetch) {
                    debug!("Frontend: consumed {}", instr);
                }
            }
        }

        self.ip_next_fetch += 1;
        self.perf_counters.borrow_mut().decode_cnt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::instructions::{Classified, Instr, Opcode};

    fn instr(opcode: Opcode, dest: u16, src1: u16, src2: u16) -> Instr {
        Instr { classified: Classified::Recognized(opcode), dest, src1, src2, imm: 0, pos: 0 }
    }

    fn frontend(program: Vec<Instr>) -> Frontend {
        let mut frontend = Frontend::new(&CPUConfig::default(), Rc::new(RefCell::new(PerfCounters::new())));
        frontend.init(&Rc::new(Scenario { registers: Vec::new(), memory: Vec::new(), program }));
        frontend
    }

    #[test]
    fn test_pending_is_presented_until_consumed() {
        let mut frontend = frontend(vec![instr(Opcode::ADD, 3, 1, 2), instr(Opcode::XOR, 4, 3, 3)]);
        let mut rob = RobView::all_ready();
        rob.resolve(1, 10);
        rob.resolve(2, 20);

        let first = frontend.pending(&rob).unwrap();
        assert_eq!(frontend.pending(&rob), Some(first));
        assert_eq!((first.src1_value, first.src2_value), (10, 20));

        frontend.advance();
        assert_eq!(frontend.pending(&rob).map(|d| d.dest), Some(4));
        frontend.advance();
        assert!(frontend.is_done());
        assert_eq!(frontend.pending(&rob), None);
        assert_eq!(frontend.perf_counters.borrow().decode_cnt, 2);
    }

    #[test]
    fn test_holds_instruction_with_inflight_destination() {
        let frontend = frontend(vec![instr(Opcode::ADD, 3, 1, 2)]);
        let mut rob = RobView::all_ready();
        rob.invalidate(3);
        assert_eq!(frontend.pending(&rob), None);
        assert!(!frontend.is_done());

        rob.resolve(3, 0);
        assert!(frontend.pending(&rob).is_some());
    }

    #[test]
    fn test_store_is_not_held_by_its_dest_field() {
        let frontend = frontend(vec![instr(Opcode::SW, 3, 1, 2)]);
        let mut rob = RobView::all_ready();
        rob.invalidate(3);
        assert!(frontend.pending(&rob).is_some());
    }
}
