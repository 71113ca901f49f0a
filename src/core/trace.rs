//! Trace sink: the core's only window to the outside world for
//! diagnostics. Events are read-only views; nothing here can feed back
//! into execution, so tracing can never perturb the machine it
//! observes.

use std::io::Write;

#[derive(Clone, Copy, Debug)]
pub struct RegisterSnapshot {
    pub gpr: [u16; 8],
    pub link: u16,
}

#[derive(Clone, Copy, Debug)]
pub struct FlagSnapshot {
    pub carry: bool,
    pub zero: bool,
    pub negative: bool,
    pub overflow: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct PreInstruction<'a> {
    pub cycle: u64,
    pub pc: u16,
    pub kernel: bool,
    pub context: u16,
    pub word: u16,
    pub disassembly: &'a str,
    pub registers: RegisterSnapshot,
    pub flags: FlagSnapshot,
}

#[derive(Clone, Copy, Debug)]
pub struct PostInstruction {
    pub registers: RegisterSnapshot,
    pub flags: FlagSnapshot,
}

#[derive(Clone, Copy, Debug)]
pub enum AccessWidth {
    Byte,
    Word,
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryAccess {
    pub vaddr: u16,
    pub paddr: u32,
    pub value: u16,
    pub width: AccessWidth,
}

#[derive(Clone, Copy, Debug)]
pub struct SprAccess<'a> {
    pub index: u16,
    pub name: &'a str,
    pub value: u16,
}

#[derive(Clone, Copy, Debug)]
pub struct ExceptionEvent {
    pub vector: u16,
    pub data: u16,
    pub saved_pc: u16,
    pub saved_mode_kernel: bool,
}

/// Collaborator interface the core reports structured events to. All
/// methods default to a no-op so implementors only override what they
/// care about.
pub trait TraceSink {
    fn on_pre_instruction(&mut self, _event: PreInstruction) {}
    fn on_post_instruction(&mut self, _event: PostInstruction) {}
    fn on_memory_read(&mut self, _event: MemoryAccess) {}
    fn on_memory_write(&mut self, _event: MemoryAccess) {}
    fn on_spr_read(&mut self, _event: SprAccess) {}
    fn on_spr_write(&mut self, _event: SprAccess) {}
    fn on_exception(&mut self, _event: ExceptionEvent) {}
    fn on_mode_switch(&mut self, _to_kernel: bool) {}
    fn on_console_in(&mut self, _byte: u8) {}
    fn on_console_out(&mut self, _byte: u8) {}
    fn on_double_fault(&mut self, _pc: u16) {}
    fn on_break(&mut self, _pc: u16) {}
}

/// Discards every event; used when `-trace` is not given.
pub struct NullSink;

impl TraceSink for NullSink {}

/// Renders every event as one line of text to any `io::Write`.
pub struct LineSink<W: Write> {
    out: W,
}

impl<W: Write> LineSink<W> {
    pub fn new(out: W) -> Self {
        LineSink { out }
    }
}

impl<W: Write> TraceSink for LineSink<W> {
    fn on_pre_instruction(&mut self, event: PreInstruction) {
        let _ = writeln!(
            self.out,
            "{:>8} pc={:#06x} {} ctx={} word={:#06x} {}",
            event.cycle,
            event.pc,
            if event.kernel { "kernel" } else { "user" },
            event.context,
            event.word,
            event.disassembly
        );
    }

    fn on_memory_read(&mut self, event: MemoryAccess) {
        let _ = writeln!(self.out, "  read  vaddr={:#06x} paddr={:#08x} value={:#06x}", event.vaddr, event.paddr, event.value);
    }

    fn on_memory_write(&mut self, event: MemoryAccess) {
        let _ = writeln!(self.out, "  write vaddr={:#06x} paddr={:#08x} value={:#06x}", event.vaddr, event.paddr, event.value);
    }

    fn on_spr_read(&mut self, event: SprAccess) {
        let _ = writeln!(self.out, "  spr-read  {} ({}) = {:#06x}", event.index, event.name, event.value);
    }

    fn on_spr_write(&mut self, event: SprAccess) {
        let _ = writeln!(self.out, "  spr-write {} ({}) = {:#06x}", event.index, event.name, event.value);
    }

    fn on_exception(&mut self, event: ExceptionEvent) {
        let _ = writeln!(
            self.out,
            "  exception vector={:#06x} data={:#06x} saved_pc={:#06x} saved_kernel={}",
            event.vector, event.data, event.saved_pc, event.saved_mode_kernel
        );
    }

    fn on_mode_switch(&mut self, to_kernel: bool) {
        let _ = writeln!(self.out, "  mode -> {}", if to_kernel { "kernel" } else { "user" });
    }

    fn on_console_in(&mut self, byte: u8) {
        let _ = writeln!(self.out, "  console-in  {byte:#04x}");
    }

    fn on_console_out(&mut self, byte: u8) {
        let _ = writeln!(self.out, "  console-out {byte:#04x}");
    }

    fn on_double_fault(&mut self, pc: u16) {
        let _ = writeln!(self.out, "  DOUBLE FAULT at pc={pc:#06x}");
    }

    fn on_break(&mut self, pc: u16) {
        let _ = writeln!(self.out, "  BRK at pc={pc:#06x}");
    }
}

/// Maps a fixed SPR index to its architectural name, for trace events.
pub fn spr_name(index: u16) -> &'static str {
    use crate::core::regfile::*;
    match index {
        SPR_LINK => "LINK",
        SPR_FLAGS => "FLAGS",
        SPR_CYCLO => "CYCLO",
        SPR_CYCHI => "CYCHI",
        SPR_IRR => "IRR",
        SPR_ICR => "ICR",
        SPR_IDR => "IDR",
        SPR_ISR => "ISR",
        SPR_CONTEXT => "CONTEXT",
        i if (SPR_USERGEN_BASE..SPR_USERGEN_BASE + 8).contains(&i) => "USERGEN",
        SPR_USER_LINK => "USER_LINK",
        i if (SPR_USER_CODE_MMU_BASE..SPR_USER_CODE_MMU_BASE + 16).contains(&i) => "USER_CODE_MMU",
        i if (SPR_USER_DATA_MMU_BASE..SPR_USER_DATA_MMU_BASE + 16).contains(&i) => "USER_DATA_MMU",
        i if (SPR_KERN_CODE_MMU_BASE..SPR_KERN_CODE_MMU_BASE + 16).contains(&i) => "KERN_CODE_MMU",
        i if (SPR_KERN_DATA_MMU_BASE..SPR_KERN_DATA_MMU_BASE + 16).contains(&i) => "KERN_DATA_MMU",
        96 => "UART_TX",
        97 => "UART_RX",
        98 => "UART_TX_STATUS",
        99 => "UART_RX_STATUS",
        100 => "SPI_DATA",
        101 => "SPI_SELECT",
        _ => "RESERVED",
    }
}
