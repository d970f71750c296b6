use std::cell::RefCell;
use std::error::Error;
use std::fs::File;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use log::{debug, info, trace};
use serde::Deserialize;
use thiserror::Error;

use crate::backend::execution_unit::{Completion, EUTable};
use crate::backend::issue_queue::{AllocOutcome, CDBBroadcast, IssueQueue, TickInputs, UnclassifiedPolicy};
use crate::backend::reorder_buffer::RobView;
use crate::frontend::frontend::Frontend;
use crate::instructions::instructions::{RegisterType, WordType};
use crate::loader::loader::Scenario;
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PerfCounters {
    pub cycle_cnt: u64,
    pub decode_cnt: u64,
    pub allocate_cnt: u64,
    pub reject_cnt: u64,
    pub wakeup_cnt: u64,
    pub issue_cnt: u64,
    pub execute_cnt: u64,
    pub broadcast_cnt: u64,
    pub retire_cnt: u64,
    pub queue_full_stall_cnt: u64,
    pub no_progress_stall_cnt: u64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Deserialize, Debug, Default)]
#[serde(default)]
pub struct Trace {
    pub allocate: bool,
    pub wakeup: bool,
    pub select: bool,
    pub execute: bool,
    pub retire: bool,
    pub cycle: bool,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct CPUConfig {
    // the number of reservation stations in the issue queue
    pub rs_count: u16,
    // what the allocator does with instructions that did not classify
    pub unclassified_policy: UnclassifiedPolicy,
    // the number of cycles an ALU needs for an operation
    pub alu_latency: u8,
    // the number of cycles the memory unit needs for a load or store
    pub mem_latency: u8,
    // the size of the data memory in bytes
    pub memory_size: u32,
    // the frequency of the CPU in Hz; 0 runs unthrottled
    pub frequency_hz: u64,
    // the simulation fails when the program hasn't drained after this many cycles; 0 disables the limit
    pub max_cycles: u64,
    // which stages should be traced
    pub trace: Trace,
}

impl Default for CPUConfig {
    fn default() -> Self {
        CPUConfig {
            rs_count: 16,
            unclassified_policy: UnclassifiedPolicy::Reject,
            alu_latency: 1,
            mem_latency: 2,
            memory_size: 4096,
            frequency_hz: 0,
            max_cycles: 100_000,
            trace: Trace::default(),
        }
    }
}

pub fn load_cpu_config(file_path: &str) -> Result<CPUConfig, Box<dyn Error>> {
    let file = File::open(file_path)?;
    let config: CPUConfig = serde_yaml::from_reader(file)?;
    if config.rs_count == 0 {
        return Err(format!("{}: rs_count must be at least 1", file_path).into());
    }
    Ok(config)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("memory access at address {addr:#x} is outside the data memory of {size} bytes")]
    MemoryOutOfBounds { addr: WordType, size: usize },
    #[error("program did not complete within {cycles} cycles")]
    CycleLimitExceeded { cycles: u64 },
}

pub struct CPU {
    issue_queue: IssueQueue,
    eu_table: EUTable,
    frontend: Frontend,
    memory_subsystem: MemorySubsystem,
    // architectural register values plus the resolved bitmap
    rob: RobView,
    cycle_period: Option<Duration>,
    max_cycles: u64,
    trace: Trace,
    perf_counters: Rc<RefCell<PerfCounters>>,
}

impl CPU {
    pub fn new(cpu_config: &CPUConfig) -> CPU {
        let perf_counters = Rc::new(RefCell::new(PerfCounters::new()));

        let issue_queue = IssueQueue::new(cpu_config, Rc::clone(&perf_counters));
        let frontend = Frontend::new(cpu_config, Rc::clone(&perf_counters));

        let cycle_period = if cpu_config.frequency_hz == 0 {
            None
        } else {
            Some(Duration::from_nanos(1_000_000_000 / cpu_config.frequency_hz))
        };

        CPU {
            issue_queue,
            eu_table: EUTable::new(cpu_config),
            frontend,
            memory_subsystem: MemorySubsystem::new(cpu_config),
            rob: RobView::all_ready(),
            cycle_period,
            max_cycles: cpu_config.max_cycles,
            trace: cpu_config.trace.clone(),
            perf_counters,
        }
    }

    /// Runs the scenario until every instruction has been consumed and
    /// the issue queue and the functional units have drained.
    pub fn run(&mut self, scenario: &Rc<Scenario>) -> Result<(), SimError> {
        self.init(scenario)?;

        while !self.is_drained() {
            if self.max_cycles > 0 && self.perf_counters.borrow().cycle_cnt >= self.max_cycles {
                return Err(SimError::CycleLimitExceeded { cycles: self.max_cycles });
            }

            self.do_cycle()?;

            if let Some(cycle_period) = self.cycle_period {
                thread::sleep(cycle_period);
            }
        }

        info!("Program complete after {} cycles", self.perf_counters.borrow().cycle_cnt);
        Ok(())
    }

    fn init(&mut self, scenario: &Rc<Scenario>) -> Result<(), SimError> {
        self.eu_table.flush();
        self.memory_subsystem.init(&scenario.memory)?;

        self.rob = RobView::all_ready();
        for &(reg, value) in &scenario.registers {
            self.rob.resolve(reg, value);
        }
        // x0 is hardwired to zero
        self.rob.resolve(0, 0);

        // power-on reset of the issue queue; clears the counters as well
        let mut inputs = TickInputs::idle(&self.rob);
        inputs.reset = true;
        self.issue_queue.tick(&inputs);

        self.frontend.init(scenario);
        Ok(())
    }

    fn is_drained(&self) -> bool {
        self.frontend.is_done() && self.issue_queue.is_empty() && self.eu_table.is_idle()
    }

    fn do_cycle(&mut self) -> Result<(), SimError> {
        self.perf_counters.borrow_mut().cycle_cnt += 1;

        // results leaving the functional units are written back before the
        // issue queue samples its inputs
        let completions = self.eu_table.cycle(&mut self.memory_subsystem)?;
        let broadcast = self.write_back(&completions);

        let pending = self.frontend.pending(&self.rob);
        let inputs = TickInputs {
            reset: false,
            pending,
            rob: &self.rob,
            fu_ready: self.eu_table.fu_ready(),
            broadcast,
        };
        let outputs = self.issue_queue.tick(&inputs);

        for channel in outputs.granted() {
            self.eu_table.dispatch(*channel);
        }

        match outputs.alloc {
            AllocOutcome::Allocated { .. } => {
                if let Some(instr) = pending {
                    let writes_dest = instr.classified.opcode().map_or(false, |opcode| opcode.writes_dest());
                    if writes_dest && instr.dest != 0 {
                        self.rob.invalidate(instr.dest);
                    }
                }
                self.frontend.advance();
            }
            AllocOutcome::Rejected => self.frontend.advance(),
            AllocOutcome::QueueFull | AllocOutcome::Idle => {}
        }

        if self.trace.cycle {
            let perf_counters = self.perf_counters.borrow();
            debug!("[Cycles:{}][Decoded={}][Allocated={}][Issued={}][Executed={}][Retired={}][IPC={:.2}]",
                   perf_counters.cycle_cnt,
                   perf_counters.decode_cnt,
                   perf_counters.allocate_cnt,
                   perf_counters.issue_cnt,
                   perf_counters.execute_cnt,
                   perf_counters.retire_cnt,
                   perf_counters.retire_cnt as f32 / perf_counters.cycle_cnt as f32);
        }
        Ok(())
    }

    // Updates the register file with every completion and returns the one
    // result that is broadcast this cycle.
    fn write_back(&mut self, completions: &[Completion]) -> Option<CDBBroadcast> {
        let mut perf_counters = self.perf_counters.borrow_mut();
        let mut broadcast = None;

        for completion in completions {
            perf_counters.execute_cnt += 1;

            let dest = match completion.dest {
                // x0 writes are discarded
                Some(dest) if dest != 0 => dest,
                _ => continue,
            };

            self.rob.resolve(dest, completion.value);
            perf_counters.retire_cnt += 1;
            if self.trace.retire {
                debug!("Retired x{}={:#x} from {}", dest, completion.value, completion.fu);
            }

            if broadcast.is_none() {
                broadcast = Some(CDBBroadcast { tag: dest, value: completion.value });
                perf_counters.broadcast_cnt += 1;
            } else {
                trace!("x{} not broadcast; consumers pick it up from the register file", dest);
            }
        }

        broadcast
    }

    pub fn reg_value(&self, reg: RegisterType) -> WordType {
        self.rob.get_value(reg)
    }

    pub fn load_word(&self, addr: WordType) -> Result<WordType, SimError> {
        self.memory_subsystem.load_word(addr)
    }

    pub fn perf_counters(&self) -> PerfCounters {
        self.perf_counters.borrow().clone()
    }
}
