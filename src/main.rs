use std::fs::File;
use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::thread;

use clap::Parser;
use tracing::error;

use wut4_emu::core::emu::{Emulator, StopReason, EMU_BUILD_DATE_TIME, EMU_NAME, EMU_VERSION};
use wut4_emu::core::error::HostError;
use wut4_emu::core::memory::PhysicalMemory;
use wut4_emu::core::spi::BlockFile;
use wut4_emu::core::trace::{LineSink, NullSink, TraceSink};
use wut4_emu::log::Logger;

/// Functional emulator for the WUT-4 core: CPU, MMU, UART, and an
/// optional SPI-backed block device.
#[derive(Parser, Debug)]
#[command(name = EMU_NAME, version = EMU_VERSION)]
struct Cli {
    /// Path to the binary image to load at physical address 0.
    image: String,

    /// Write structured trace events to this file.
    #[arg(long = "trace")]
    trace: Option<String>,

    /// Stop after this many cycles even if the guest never halts.
    #[arg(long = "max-cycles")]
    max_cycles: Option<u64>,

    /// Initial tracing filter level (error, warn, info, debug, trace).
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Backing file for the SPI/SD-card emulation.
    #[arg(long = "disk")]
    disk: Option<String>,
}

fn run(cli: Cli) -> Result<StopReason, HostError> {
    let logger = Logger::new(&cli.log_level);
    let _ = &logger;
    tracing::info!("Welcome to {EMU_NAME} v{EMU_VERSION} compiled on {EMU_BUILD_DATE_TIME}");

    let image = PhysicalMemory::load_from_file(&cli.image).map_err(HostError::Io)?;
    let mut emu = Emulator::new(cli.max_cycles);
    emu.load_image(&image)?;

    if let Some(disk) = &cli.disk {
        let backing = BlockFile::open(disk).map_err(HostError::Io)?;
        emu.attach_disk(Box::new(backing));
    }

    let uart = emu.uart();
    let stdout_uart = uart.clone();
    thread::spawn(move || loop {
        let byte = stdout_uart.host_take_tx();
        let mut stdout = io::stdout();
        let _ = stdout.write_all(&[byte]);
        let _ = stdout.flush();
    });

    let stdin_uart = uart.clone();
    thread::spawn(move || {
        let mut byte = [0u8; 1];
        loop {
            match io::stdin().read_exact(&mut byte) {
                Ok(()) => stdin_uart.host_push_rx(byte[0]),
                Err(_) => break,
            }
        }
    });

    let mut file_sink;
    let mut null_sink = NullSink;
    let sink: &mut dyn TraceSink = match &cli.trace {
        Some(path) => {
            let file = File::create(path).map_err(HostError::Io)?;
            file_sink = LineSink::new(file);
            &mut file_sink
        }
        None => &mut null_sink,
    };

    let (reason, cycles) = emu.run(sink);
    tracing::info!(cycles, ?reason, "emulation finished");
    Ok(reason)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(StopReason::Halted) => ExitCode::from(0),
        Ok(StopReason::CycleCapReached) => ExitCode::from(0),
        Ok(StopReason::DoubleFault) => ExitCode::from(0),
        Err(e) => {
            error!("{e}");
            eprintln!("{EMU_NAME}: {e}");
            ExitCode::from(1)
        }
    }
}
