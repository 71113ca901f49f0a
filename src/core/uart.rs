//! Memory-mapped UART: two bounded 64-byte FIFOs bridging the CPU's
//! SPR-mapped transmit/receive registers to a host byte stream. The
//! CPU side never blocks — enqueue/dequeue always return immediately,
//! setting a sticky status bit on overflow/underflow. The host side
//! (two collaborator threads, see `crate::main`) blocks on a condvar.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use tracing::warn;

pub const FIFO_CAPACITY: usize = 64;

struct Fifo {
    queue: VecDeque<u8>,
    sticky: bool,
}

impl Fifo {
    fn new() -> Self {
        Fifo {
            queue: VecDeque::with_capacity(FIFO_CAPACITY),
            sticky: false,
        }
    }
}

struct UartState {
    tx: Fifo,
    rx: Fifo,
}

/// Shared UART state, serialised by a single mutex per `SPEC_FULL.md`
/// §5 ("The UART FIFOs are the only shared mutable state").
pub struct Uart {
    state: Mutex<UartState>,
    tx_ready: Condvar,
    rx_ready: Condvar,
}

impl Uart {
    pub fn new() -> Self {
        Uart {
            state: Mutex::new(UartState {
                tx: Fifo::new(),
                rx: Fifo::new(),
            }),
            tx_ready: Condvar::new(),
            rx_ready: Condvar::new(),
        }
    }

    /// SPR 96 write: enqueue a transmit byte.
    pub fn cpu_write_tx(&self, byte: u8) {
        let mut state = self.state.lock().unwrap();
        if state.tx.queue.len() >= FIFO_CAPACITY {
            state.tx.sticky = true;
            warn!("UART tx FIFO overflow, dropping byte {byte:#04x}");
        } else {
            state.tx.queue.push_back(byte);
            self.tx_ready.notify_one();
        }
    }

    /// SPR 97 read: dequeue a receive byte, 0 on empty.
    pub fn cpu_read_rx(&self) -> u8 {
        let mut state = self.state.lock().unwrap();
        match state.rx.queue.pop_front() {
            Some(byte) => {
                self.rx_ready.notify_one();
                byte
            }
            None => {
                state.rx.sticky = true;
                0
            }
        }
    }

    /// SPR 98 read: bit 0 tx-overflow (clear-on-read), bit 15 tx-fifo-empty.
    pub fn tx_status(&self) -> u16 {
        let mut state = self.state.lock().unwrap();
        let overflow = state.tx.sticky;
        state.tx.sticky = false;
        let empty = state.tx.queue.is_empty();
        (overflow as u16) | ((empty as u16) << 15)
    }

    /// SPR 99 read: bit 0 rx-underflow (clear-on-read), bit 15 rx-has-data.
    pub fn rx_status(&self) -> u16 {
        let mut state = self.state.lock().unwrap();
        let underflow = state.rx.sticky;
        state.rx.sticky = false;
        let has_data = !state.rx.queue.is_empty();
        (underflow as u16) | ((has_data as u16) << 15)
    }

    /// Host writer side: blocks until a transmit byte is available.
    pub fn host_take_tx(&self) -> u8 {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(byte) = state.tx.queue.pop_front() {
                return byte;
            }
            state = self.tx_ready.wait(state).unwrap();
        }
    }

    /// Host reader side: blocks until there is room, then enqueues a
    /// byte read from stdin.
    pub fn host_push_rx(&self, byte: u8) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.rx.queue.len() < FIFO_CAPACITY {
                state.rx.queue.push_back(byte);
                self.rx_ready.notify_one();
                return;
            }
            state = self.rx_ready.wait(state).unwrap();
        }
    }
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}
