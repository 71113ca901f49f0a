//! SPI / block-device emulation: an SD-style card reachable through
//! two SPR-mapped registers (data exchange, chip select), backed by a
//! host file. See `SPEC_FULL.md` §4.6 for the full state diagram.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::{info, warn};

const BLOCK_LEN: usize = 512;
const DATA_ERROR_TOKEN: u8 = 0x0D;
const INIT_CLOCKS_REQUIRED: u32 = 10;
const CHECK_PATTERN: u8 = 0xAA;
const VOLTAGE_2V7_3V6: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CardState {
    Uninit,
    InitClockCounting,
    Idle,
    Ready,
    Error,
    ReceivingCommand,
    SendingResponse,
    ReadingData,
    WritingData,
}

/// Host-file-shaped backing store for a block device. The file must
/// be at least one block, at most 2 GiB, and a multiple of 512 bytes.
pub trait BackingStore: Send {
    fn block_count(&self) -> u64;
    fn read_block(&mut self, byte_offset: u64, buf: &mut [u8; BLOCK_LEN]) -> io::Result<()>;
    fn write_block(&mut self, byte_offset: u64, buf: &[u8; BLOCK_LEN]) -> io::Result<()>;
}

pub struct BlockFile {
    file: File,
    len: u64,
}

const MAX_FILE_LEN: u64 = 2 * 1024 * 1024 * 1024;

impl BlockFile {
    pub fn open(path: &str) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < BLOCK_LEN as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("backing file {path} is smaller than one 512-byte block"),
            ));
        }
        if len > MAX_FILE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("backing file {path} exceeds the 2 GiB limit"),
            ));
        }
        if len % BLOCK_LEN as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("backing file {path} is not a multiple of 512 bytes"),
            ));
        }
        Ok(BlockFile { file, len })
    }
}

impl BackingStore for BlockFile {
    fn block_count(&self) -> u64 {
        self.len / BLOCK_LEN as u64
    }

    fn read_block(&mut self, byte_offset: u64, buf: &mut [u8; BLOCK_LEN]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(byte_offset))?;
        self.file.read_exact(buf)
    }

    fn write_block(&mut self, byte_offset: u64, buf: &[u8; BLOCK_LEN]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(byte_offset))?;
        self.file.write_all(buf)
    }
}

struct Response {
    bytes: Vec<u8>,
    pos: usize,
}

/// State to transition to once a pending response buffer has been
/// fully shifted out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AfterResponse {
    Ready,
    Idle,
    Error,
    StartRead { byte_offset: u64 },
    StartWrite { byte_offset: u64 },
}

pub struct SpiCard {
    state: CardState,
    selected: bool,
    init_clock_count: u32,
    cmd_buf: [u8; 6],
    cmd_pos: usize,
    app_cmd_pending: bool,
    response: Option<Response>,
    after_response: AfterResponse,
    data_buf: [u8; BLOCK_LEN + 2],
    data_pos: usize,
    pending_write_offset: u64,
    write_token_seen: bool,
    backing: Option<Box<dyn BackingStore>>,
}

impl SpiCard {
    pub fn new() -> Self {
        SpiCard {
            state: CardState::Uninit,
            selected: false,
            init_clock_count: 0,
            cmd_buf: [0; 6],
            cmd_pos: 0,
            app_cmd_pending: false,
            response: None,
            after_response: AfterResponse::Ready,
            data_buf: [0; BLOCK_LEN + 2],
            data_pos: 0,
            pending_write_offset: 0,
            write_token_seen: false,
            backing: None,
        }
    }

    pub fn attach(&mut self, backing: Box<dyn BackingStore>) {
        self.backing = Some(backing);
    }

    pub fn is_ready(&self) -> bool {
        self.state == CardState::Ready
    }

    /// True while a multi-byte response is still being shifted out, so
    /// a host-side test/driver knows when to stop clocking for a reply.
    pub fn is_sending_response(&self) -> bool {
        self.state == CardState::SendingResponse
    }

    /// SPR 101 write: bit 0 is active-low chip select.
    pub fn set_select(&mut self, select_word: u16) {
        let selected = select_word & 1 == 0;
        if selected && !self.selected {
            self.cmd_pos = 0;
            if self.state == CardState::Uninit {
                warn!("SPI card selected before init clocking completed");
                self.state = CardState::Error;
            }
        }
        self.selected = selected;
    }

    /// SPR 100 access: one byte-exchange per read or write. A write
    /// sends `byte` and discards what comes back; a read sends 0xFF
    /// and returns what the card shifts out.
    pub fn exchange(&mut self, byte: u8) -> u8 {
        if !self.selected {
            if self.state == CardState::Uninit {
                if byte == 0xFF {
                    self.init_clock_count += 1;
                    if self.init_clock_count >= INIT_CLOCKS_REQUIRED {
                        self.state = CardState::InitClockCounting;
                    }
                } else {
                    self.init_clock_count = 0;
                }
            }
            return 0xFF;
        }

        match self.state {
            CardState::Uninit => 0xFF,
            CardState::Error => 0xFF,
            CardState::InitClockCounting | CardState::Idle | CardState::Ready | CardState::ReceivingCommand => {
                self.feed_command_byte(byte)
            }
            CardState::SendingResponse => self.shift_response(),
            CardState::ReadingData => self.shift_read_data(),
            CardState::WritingData => self.feed_write_data(byte),
        }
    }

    fn feed_command_byte(&mut self, byte: u8) -> u8 {
        if self.cmd_pos == 0 {
            if byte & 0xC0 != 0x40 {
                // not a command start: treat as idle clocking.
                return 0xFF;
            }
            self.state = CardState::ReceivingCommand;
        }
        self.cmd_buf[self.cmd_pos] = byte;
        self.cmd_pos += 1;
        if self.cmd_pos < 6 {
            return 0xFF;
        }
        self.cmd_pos = 0;
        self.execute_command();
        self.state = CardState::SendingResponse;
        self.shift_response()
    }

    fn execute_command(&mut self) {
        let index = self.cmd_buf[0] & 0x3F;
        let arg = u32::from_be_bytes([self.cmd_buf[1], self.cmd_buf[2], self.cmd_buf[3], self.cmd_buf[4]]);
        let was_app_cmd = self.app_cmd_pending;
        self.app_cmd_pending = false;

        match (was_app_cmd, index) {
            (_, 0) => {
                info!("SPI CMD0 (go idle)");
                self.set_response(vec![0x01], AfterResponse::Idle);
            }
            (_, 8) => {
                let check_pattern = (arg & 0xFF) as u8;
                let voltage = ((arg >> 8) & 0xF) as u8;
                let r1 = if voltage == VOLTAGE_2V7_3V6 { 0x01 } else { 0x05 };
                info!("SPI CMD8 (send-if-cond)");
                self.set_response(
                    vec![r1, 0x00, 0x00, VOLTAGE_2V7_3V6, if check_pattern == CHECK_PATTERN { CHECK_PATTERN } else { check_pattern }],
                    AfterResponse::Idle,
                );
            }
            (_, 55) => {
                self.app_cmd_pending = true;
                self.set_response(vec![0x01], AfterResponse::Idle);
            }
            (_, 58) => {
                info!("SPI CMD58 (read OCR)");
                self.set_response(vec![0x01, 0x80, 0xFF, 0x80, 0x00], AfterResponse::Idle);
            }
            (true, 41) => {
                info!("SPI ACMD41 (send-op-cond) -> ready");
                self.set_response(vec![0x00], AfterResponse::Ready);
            }
            (false, 17) => {
                let offset = arg as u64;
                self.set_response(vec![0x00], AfterResponse::StartRead { byte_offset: offset });
            }
            (false, 24) => {
                let offset = arg as u64;
                self.set_response(vec![0x00], AfterResponse::StartWrite { byte_offset: offset });
            }
            _ => {
                warn!("SPI unknown command {index}");
                self.set_response(vec![0x04], AfterResponse::Ready);
            }
        }
    }

    fn set_response(&mut self, bytes: Vec<u8>, after: AfterResponse) {
        self.response = Some(Response { bytes, pos: 0 });
        self.after_response = after;
    }

    fn shift_response(&mut self) -> u8 {
        let Some(resp) = self.response.as_mut() else {
            self.state = CardState::Ready;
            return 0xFF;
        };
        if resp.pos >= resp.bytes.len() {
            self.response = None;
            return self.begin_after_response();
        }
        let byte = resp.bytes[resp.pos];
        resp.pos += 1;
        if resp.pos >= resp.bytes.len() {
            self.response = None;
            self.begin_after_response();
        }
        byte
    }

    fn begin_after_response(&mut self) -> u8 {
        match self.after_response {
            AfterResponse::Ready => {
                self.state = CardState::Ready;
                0xFF
            }
            AfterResponse::Idle => {
                self.state = CardState::Idle;
                0xFF
            }
            AfterResponse::Error => {
                self.state = CardState::Error;
                0xFF
            }
            AfterResponse::StartRead { byte_offset } => {
                self.begin_read(byte_offset);
                0xFF
            }
            AfterResponse::StartWrite { byte_offset } => {
                self.pending_write_offset = byte_offset;
                self.write_token_seen = false;
                self.data_pos = 0;
                self.state = CardState::WritingData;
                0xFF
            }
        }
    }

    fn begin_read(&mut self, byte_offset: u64) {
        let mut buf = [0u8; BLOCK_LEN];
        let ok = match &mut self.backing {
            Some(store) => {
                let in_range = byte_offset + BLOCK_LEN as u64 <= store.block_count() * BLOCK_LEN as u64;
                in_range && store.read_block(byte_offset, &mut buf).is_ok()
            }
            None => false,
        };
        self.data_buf[0] = if ok { 0xFE } else { DATA_ERROR_TOKEN };
        if ok {
            self.data_buf[1..1 + BLOCK_LEN].copy_from_slice(&buf);
        }
        self.data_pos = 0;
        self.state = CardState::ReadingData;
    }

    fn shift_read_data(&mut self) -> u8 {
        let total = if self.data_buf[0] == 0xFE { 1 + BLOCK_LEN + 2 } else { 1 };
        let byte = self.data_buf.get(self.data_pos).copied().unwrap_or(0xFF);
        self.data_pos += 1;
        if self.data_pos >= total {
            self.state = CardState::Ready;
        }
        byte
    }

    fn feed_write_data(&mut self, byte: u8) -> u8 {
        if !self.write_token_seen {
            if byte == 0xFE {
                self.write_token_seen = true;
                self.data_pos = 0;
            }
            return 0xFF;
        }
        if self.data_pos < BLOCK_LEN {
            self.data_buf[self.data_pos] = byte;
            self.data_pos += 1;
            return 0xFF;
        }
        if self.data_pos < BLOCK_LEN + 2 {
            // CRC bytes from the host: accepted and discarded.
            self.data_pos += 1;
            if self.data_pos < BLOCK_LEN + 2 {
                return 0xFF;
            }
            let mut block = [0u8; BLOCK_LEN];
            block.copy_from_slice(&self.data_buf[..BLOCK_LEN]);
            let ok = match &mut self.backing {
                Some(store) => {
                    let in_range =
                        self.pending_write_offset + BLOCK_LEN as u64 <= store.block_count() * BLOCK_LEN as u64;
                    in_range && store.write_block(self.pending_write_offset, &block).is_ok()
                }
                None => false,
            };
            self.state = CardState::Ready;
            return if ok { 0x05 } else { DATA_ERROR_TOKEN };
        }
        self.state = CardState::Ready;
        0xFF
    }
}

impl Default for SpiCard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MemBacking {
        blocks: HashMap<u64, [u8; BLOCK_LEN]>,
        count: u64,
    }

    impl MemBacking {
        fn new(blocks: u64) -> Self {
            MemBacking { blocks: HashMap::new(), count: blocks }
        }
    }

    impl BackingStore for MemBacking {
        fn block_count(&self) -> u64 {
            self.count
        }
        fn read_block(&mut self, byte_offset: u64, buf: &mut [u8; BLOCK_LEN]) -> io::Result<()> {
            *buf = *self.blocks.get(&byte_offset).unwrap_or(&[0u8; BLOCK_LEN]);
            Ok(())
        }
        fn write_block(&mut self, byte_offset: u64, buf: &[u8; BLOCK_LEN]) -> io::Result<()> {
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
        let mut out = Vec::new();
        for b in cmd {
            card.exchange(b);
        }
        loop {
            let byte = card.exchange(0xFF);
            out.push(byte);
            if card.state != CardState::SendingResponse {
                break;
            }
        }
        out
    }

    #[test]
    fn init_sequence_reaches_ready() {
        let mut card = SpiCard::new();
        drive_init(&mut card);
        let r1 = send_command(&mut card, 0, 0);
        assert_eq!(r1[0], 0x01);
        let r7 = send_command(&mut card, 8, 0x1AA);
        assert_eq!(r7[0], 0x01);
        assert_eq!(r7[4], 0xAA);
        let _r3 = send_command(&mut card, 58, 0);
        let _ = send_command(&mut card, 55, 0);
        let r1_final = send_command(&mut card, 41, 0);
        assert_eq!(r1_final[0], 0x00);
        assert!(card.is_ready());
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut card = SpiCard::new();
        card.attach(Box::new(MemBacking::new(8)));
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
        card.exchange(0xFF);
        card.exchange(0xFF);
        assert_eq!(read_back, payload);
    }
}
