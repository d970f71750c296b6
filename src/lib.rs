pub mod backend;
pub mod cpu;
pub mod instructions;
pub mod loader;
mod frontend;
mod memory_subsystem;
