//! The run loop: ties a `Cpu` to a trace sink and an optional cycle
//! cap, the way the teacher's `Emulator::emulate` ties its `Cpu` to a
//! `Bus` and debugger channel.

use std::sync::Arc;

use tracing::info;

use crate::core::cpu::Cpu;
use crate::core::error::HostError;
use crate::core::loader;
use crate::core::spi::BackingStore;
use crate::core::trace::TraceSink;
use crate::core::uart::Uart;

pub const EMU_NAME: &str = "wut4-emu";
pub const EMU_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EMU_BUILD_DATE_TIME: &str = build_time::build_time_utc!();

/// Why the run loop stopped, used by `main` to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Halted,
    DoubleFault,
    CycleCapReached,
}

pub struct Emulator {
    cpu: Cpu,
    uart: Arc<Uart>,
    max_cycles: Option<u64>,
}

impl Emulator {
    pub fn new(max_cycles: Option<u64>) -> Self {
        let uart = Arc::new(Uart::new());
        let mut cpu = Cpu::new(uart.clone());
        cpu.reset();
        Emulator { cpu, uart, max_cycles }
    }

    pub fn uart(&self) -> Arc<Uart> {
        self.uart.clone()
    }

    /// Read-only access to CPU state, for host tooling and tests that
    /// want to inspect final memory/register contents after a run.
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn load_image(&mut self, bytes: &[u8]) -> Result<(), HostError> {
        loader::load_image(&mut self.cpu.memory, bytes)
    }

    pub fn attach_disk(&mut self, backing: Box<dyn BackingStore>) {
        self.cpu.spi.attach(backing);
    }

    /// Runs until halt, double fault, or the cycle cap, whichever
    /// comes first. Returns the stop reason and the number of cycles
    /// actually executed.
    pub fn run(&mut self, trace: &mut dyn TraceSink) -> (StopReason, u64) {
        info!("{EMU_NAME} {EMU_VERSION} starting");
        let mut cycles: u64 = 0;
        loop {
            if let Some(cap) = self.max_cycles {
                if cycles >= cap {
                    info!(cycles, "cycle cap reached");
                    return (StopReason::CycleCapReached, cycles);
                }
            }
            self.cpu.tick(trace);
            cycles += 1;
            if !self.cpu.running {
                let reason = if self.cpu.double_fault { StopReason::DoubleFault } else { StopReason::Halted };
                info!(cycles, pc = self.cpu.pc, ?reason, "run loop stopped");
                return (reason, cycles);
            }
        }
    }
}
