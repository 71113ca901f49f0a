//! End-to-end scenarios assembling tiny byte programs and driving
//! `Emulator` to completion, the way the unit tests drive individual
//! instructions.

use wut4_emu::core::cpu::Cpu;
use wut4_emu::core::emu::{Emulator, StopReason};
use wut4_emu::core::instruction::{encode, BranchCond, Instruction, Vop, XopOp, YopOp};
use wut4_emu::core::memory::Memory;
use wut4_emu::core::spi::{BackingStore, SpiCard};
use wut4_emu::core::trace::NullSink;
use wut4_emu::core::uart::Uart;

fn assemble(words: &[Instruction]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for w in words {
        bytes.extend_from_slice(&encode(*w).to_le_bytes());
    }
    bytes
}

fn run_program(words: &[Instruction]) -> Emulator {
    let mut emu = Emulator::new(Some(10_000));
    emu.load_image(&assemble(words)).unwrap();
    let mut sink = NullSink;
    let (reason, _cycles) = emu.run(&mut sink);
    assert_eq!(reason, StopReason::Halted);
    emu
}

#[test]
fn add_flag_test() {
    // r1 = 0x7FFF, r4 = 0x7FFE, r2 = 1, r3 = r1 + r2, stw r3 at (r4), hlt
    let program = [
        Instruction::Lui { ra: 1, imm10: 0x1FF },
        Instruction::Adi { ra: 1, rb: 1, imm7: 63 },
        Instruction::Lui { ra: 4, imm10: 0x1FF },
        Instruction::Adi { ra: 4, rb: 4, imm7: 62 },
        Instruction::Adi { ra: 2, rb: 0, imm7: 1 },
        Instruction::Xop { op: XopOp::Add, ra: 3, rb: 1, rc: 2 },
        Instruction::Stw { ra: 3, rb: 4, imm7: 0 },
        Instruction::Vop(Vop::Hlt),
    ];
    let emu = run_program(&program);
    assert_eq!(emu.cpu().memory.read::<16>(0x7FFE), Some(0x8000));
    assert!(emu.cpu().regs.overflow());
    assert!(emu.cpu().regs.negative());
    assert!(!emu.cpu().regs.zero());
    assert!(!emu.cpu().regs.carry());
}

#[test]
fn branch_taken_skips_the_failure_path() {
    // r1 = 5, r2 = 5; xor r0,r1,r2 (equality test via discarded XOR,
    // Z set when equal); bne fail only taken when they differ
    let program = [
        Instruction::Adi { ra: 1, rb: 0, imm7: 5 },
        Instruction::Adi { ra: 2, rb: 0, imm7: 5 },
        Instruction::Xop { op: XopOp::Xor, ra: 0, rb: 1, rc: 2 },
        Instruction::Brx { cond: BranchCond::NotZero, imm10: 8 }, // -> fail
        Instruction::Adi { ra: 1, rb: 0, imm7: 0 },
        Instruction::Lui { ra: 5, imm10: 0x1FF },
        Instruction::Adi { ra: 5, rb: 5, imm7: 62 },
        Instruction::Stw { ra: 1, rb: 5, imm7: 0 },
        Instruction::Vop(Vop::Hlt),
        // fail:
        Instruction::Adi { ra: 1, rb: 0, imm7: 1 },
        Instruction::Lui { ra: 5, imm10: 0x1FF },
        Instruction::Adi { ra: 5, rb: 5, imm7: 62 },
        Instruction::Stw { ra: 1, rb: 5, imm7: 0 },
        Instruction::Vop(Vop::Hlt),
    ];
    let emu = run_program(&program);
    assert_eq!(emu.cpu().memory.read::<16>(0x7FFE), Some(0x0000));
}

#[test]
fn alignment_fault_leaves_destination_register_untouched() {
    let mut cpu = Cpu::new(std::sync::Arc::new(Uart::new()));
    cpu.reset();
    let program = [Instruction::Ldw { ra: 1, rb: 0, imm7: 1 }, Instruction::Vop(Vop::Hlt)];
    let bytes = assemble(&program);
    cpu.memory.load_bytes(&bytes, 0).unwrap();
    // Illegal/alignment delivery while already kernel+disabled is a
    // double fault by construction; enable interrupts first so the
    // fault is actually vectored and observable.
    cpu.regs.set_interrupt_enable(true);

    let mut sink = NullSink;
    cpu.tick(&mut sink);

    assert_eq!(cpu.regs.irr, 0); // faulting PC, unmodified
    assert_eq!(cpu.regs.idr, 1); // faulting vaddr
    assert_eq!(cpu.regs.icr, 0x14);
    assert_eq!(cpu.pc, 0x14);
    assert!(cpu.kernel);
    assert_eq!(cpu.regs.gpr_read(true, 1), 0);
}

#[test]
fn sys_round_trip_resumes_after_the_sys_instruction() {
    let mut cpu = Cpu::new(std::sync::Arc::new(Uart::new()));
    cpu.reset();
    cpu.kernel = false;
    cpu.regs.context = 1;
    cpu.regs.set_interrupt_enable(true);
    let program = [Instruction::Yop { op: YopOp::Sys, ra: 3, rb: 0 }];
    let bytes = assemble(&program);
    cpu.memory.load_bytes(&bytes, 0).unwrap();

    let mut sink = NullSink;
    cpu.tick(&mut sink);

    assert_eq!(cpu.regs.icr, 0x26);
    assert_eq!(cpu.regs.isr, 1);
    assert_eq!(cpu.regs.irr, 2); // PC of the instruction after SYS
    assert!(cpu.kernel);
}

struct MemBacking {
    blocks: std::collections::HashMap<u64, [u8; 512]>,
    count: u64,
}

impl BackingStore for MemBacking {
    fn block_count(&self) -> u64 {
        self.count
    }
    fn read_block(&mut self, byte_offset: u64, buf: &mut [u8; 512]) -> std::io::Result<()> {
        *buf = *self.blocks.get(&byte_offset).unwrap_or(&[0u8; 512]);
        Ok(())
    }
    fn write_block(&mut self, byte_offset: u64, buf: &[u8; 512]) -> std::io::Result<()> {
        self.blocks.insert(byte_offset, *buf);
        Ok(())
    }
}

fn drive_init(card: &mut SpiCard) {
    for _ in 0..12 {
        card.exchange(0xFF);
    }
    card.set_select(0);
}

fn send_command(card: &mut SpiCard, index: u8, arg: u32) -> Vec<u8> {
    let mut cmd = [0u8; 6];
    cmd[0] = 0x40 | (index & 0x3F);
    cmd[1..5].copy_from_slice(&arg.to_be_bytes());
    cmd[5] = 0x01;
    for b in cmd {
        card.exchange(b);
    }
    let mut out = Vec::new();
    loop {
        out.push(card.exchange(0xFF));
        if card.is_sending_response() {
            continue;
        }
        break;
    }
    out
}

#[test]
fn spi_init_sequence_reaches_ready() {
    let mut card = SpiCard::new();
    drive_init(&mut card);
    let r1 = send_command(&mut card, 0, 0);
    assert_eq!(r1[0], 0x01);
    let r7 = send_command(&mut card, 8, 0x1AA);
    assert_eq!(r7[0], 0x01);
    assert_eq!(r7[4], 0xAA);
    send_command(&mut card, 58, 0);
    send_command(&mut card, 55, 0);
    let r1_final = send_command(&mut card, 41, 0);
    assert_eq!(r1_final[0], 0x00);
    assert!(card.is_ready());
}

#[test]
fn spi_write_then_read_round_trips_512_bytes() {
    let mut card = SpiCard::new();
    card.attach(Box::new(MemBacking { blocks: std::collections::HashMap::new(), count: 8 }));
    drive_init(&mut card);
    send_command(&mut card, 0, 0);
    send_command(&mut card, 55, 0);
    send_command(&mut card, 41, 0);
    assert!(card.is_ready());

    send_command(&mut card, 24, 512);
    card.exchange(0xFE);
    let payload: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
    for b in &payload {
        card.exchange(*b);
    }
    card.exchange(0x00);
    let ack = card.exchange(0x00);
    assert_eq!(ack, 0x05);

    send_command(&mut card, 17, 512);
    let token = card.exchange(0xFF);
    assert_eq!(token, 0xFE);
    let mut read_back = Vec::new();
    for _ in 0..512 {
        read_back.push(card.exchange(0xFF));
    }
    assert_eq!(read_back, payload);
}
