use std::path::PathBuf;
use std::process::exit;
use std::rc::Rc;

use structopt::StructOpt;

use issue_queue_sim::cpu::{CPU, load_cpu_config};
use issue_queue_sim::loader::loader::{load, LoadError};

#[derive(StructOpt, Debug)]
#[structopt(name = "Issue Queue Simulator")]
struct Opt {
    /// Path of the scenario to run
    #[structopt(short, long, parse(from_os_str))]
    file: PathBuf,

    /// Sets a custom config file
    #[structopt(short, long, parse(from_os_str), default_value = "cpu.yaml")]
    config: PathBuf,
}

fn main() {
    env_logger::init();

    let opt = Opt::from_args();

    let cpu_config_path = opt.config.to_string_lossy();
    let cpu_config = match load_cpu_config(&cpu_config_path) {
        Ok(config) => config,
        Err(error) => {
            println!("Failed to load {}. Cause: {}", cpu_config_path, error);
            exit(1);
        }
    };

    let path = opt.file.to_string_lossy();
    println!("Loading {}", path);
    let scenario = match load(&path) {
        Ok(scenario) => Rc::new(scenario),
        Err(err) => {
            println!("Loading scenario '{}' failed.", path);
            match err {
                LoadError::AnalysisError(msg_vec) => {
                    for msg in msg_vec {
                        println!("{}", msg);
                    }
                }
                LoadError::IOError(msg) | LoadError::ParseError(msg) | LoadError::NotFoundError(msg) => {
                    println!("{}", msg);
                }
            }
            exit(1);
        }
    };

    let mut cpu = CPU::new(&cpu_config);
    if let Err(err) = cpu.run(&scenario) {
        println!("Simulation failed: {}", err);
        exit(1);
    }

    println!("Registers:");
    let mut written: Vec<_> = scenario.program.iter()
        .filter(|instr| instr.classified.opcode().map_or(false, |opcode| opcode.writes_dest()))
        .map(|instr| instr.dest)
        .chain(scenario.registers.iter().map(|(reg, _)| *reg))
        .collect();
    written.sort();
    written.dedup();
    for reg in written {
        println!("  x{:<3} = {:#010x} ({})", reg, cpu.reg_value(reg), cpu.reg_value(reg) as i32);
    }

    let perf_counters = cpu.perf_counters();
    println!("Cycles:          {}", perf_counters.cycle_cnt);
    println!("Allocated:       {}", perf_counters.allocate_cnt);
    println!("Rejected:        {}", perf_counters.reject_cnt);
    println!("Issued:          {}", perf_counters.issue_cnt);
    println!("Wakeups:         {}", perf_counters.wakeup_cnt);
    println!("Broadcasts:      {}", perf_counters.broadcast_cnt);
    println!("Retired:         {}", perf_counters.retire_cnt);
    println!("Queue full:      {}", perf_counters.queue_full_stall_cnt);
    println!("No progress:     {}", perf_counters.no_progress_stall_cnt);
    if perf_counters.cycle_cnt > 0 {
        println!("IPC:             {:.2}", perf_counters.issue_cnt as f32 / perf_counters.cycle_cnt as f32);
    }
}
