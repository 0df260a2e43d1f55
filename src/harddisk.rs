/*!
harddisk.rs - XT-class fixed hard-disk controller (`spec.md` §4.5),
grounded on `original_source/xthdc.c`. Fixed CHS geometry: 615 cylinders
x 4 heads x 17 sectors x 512 bytes = 20,910,080 bytes.

Protocol: host selects the drive (status goes REQ|XBSY|CD), writes a
6-byte command (opcode + 5 parameters), then either streams sectors via
PIO reads/writes or triggers DMA channel 3. Completion sets the IO bit,
writes the status byte, and raises IRQ 5 if the mask register enables it.
*/

use crate::error::EmuError;
use crate::syschip::{self, SystemChip};
use crate::trace::TraceRing;

const PORT_DATA: u16 = 0x320;
const PORT_STATUS: u16 = 0x321;
const PORT_SELECT: u16 = 0x322;
const PORT_MASK: u16 = 0x323;

const ST_REQ: u8 = 0x01;
const ST_IO: u8 = 0x02;
const ST_CD: u8 = 0x04;
const ST_BUSY: u8 = 0x08;
const ST_XBSY: u8 = 0x40;

const CMD_TEST_DRIVE: u8 = 0x00;
const CMD_RECALIBRATE: u8 = 0x01;
const CMD_REQUEST_SENSE: u8 = 0x03;
const CMD_READ: u8 = 0x08;
const CMD_WRITE: u8 = 0x0A;
const CMD_READY_VERIFY: u8 = 0x05;
const CMD_INITIALIZE_DRIVE: u8 = 0x0C;
const CMD_CONTROLLER_DIAGNOSTIC: u8 = 0x0E;

pub const CYLINDERS: u32 = 615;
pub const HEADS: u32 = 4;
pub const SECTORS_PER_TRACK: u32 = 17;
pub const SECTOR_SIZE: usize = 512;
pub const DISK_BYTES: usize = CYLINDERS as usize * HEADS as usize * SECTORS_PER_TRACK as usize * SECTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    SelectedAwaitingCommand,
    CollectingCommand { bytes: [u8; 6], len: usize },
    PioTransfer { write: bool, lba: u32, sector_in_transfer: u32, count: u32, byte_in_sector: u16 },
    CompletionPending { status: u8 },
}

pub struct HardDisk {
    image: Option<Vec<u8>>,
    phase: Phase,
    mask: u8,
    sense: [u8; 4],
    result_status: u8,
    trace: TraceRing<&'static str>,
}

impl HardDisk {
    pub fn new() -> Self {
        Self {
            image: None,
            phase: Phase::Idle,
            mask: 0,
            sense: [0; 4],
            result_status: 0,
            trace: TraceRing::new(64),
        }
    }

    pub fn trace(&self) -> &TraceRing<&'static str> {
        &self.trace
    }

    pub fn load_image(&mut self, mut data: Vec<u8>) -> Result<(), EmuError> {
        if data.len() > DISK_BYTES {
            return Err(EmuError::HardDiskImageTooLarge { path: "hard disk image".into(), size: data.len() });
        }
        data.resize(DISK_BYTES, 0);
        self.image = Some(data);
        Ok(())
    }

    pub fn io_read(&mut self, port: u16, syschip: &mut SystemChip, mem: &mut crate::memory::Memory) -> u8 {
        match port {
            PORT_STATUS => self.status_byte(),
            PORT_DATA => self.read_data(syschip, mem),
            _ => 0xFF,
        }
    }

    pub fn io_write(&mut self, port: u16, value: u8, syschip: &mut SystemChip, mem: &mut crate::memory::Memory) {
        match port {
            PORT_SELECT => {
                self.phase = Phase::SelectedAwaitingCommand;
            }
            PORT_MASK => self.mask = value,
            PORT_DATA => self.write_data(value, syschip, mem),
            _ => {}
        }
    }

    fn status_byte(&self) -> u8 {
        match self.phase {
            Phase::SelectedAwaitingCommand | Phase::CollectingCommand { .. } => ST_REQ | ST_XBSY | ST_CD,
            Phase::PioTransfer { write: false, .. } => ST_REQ | ST_IO,
            Phase::PioTransfer { write: true, .. } => ST_REQ,
            Phase::CompletionPending { status } => status,
            Phase::Idle => 0,
        }
    }

    fn write_data(&mut self, value: u8, syschip: &mut SystemChip, mem: &mut crate::memory::Memory) {
        match &mut self.phase {
            Phase::SelectedAwaitingCommand => {
                let mut bytes = [0u8; 6];
                bytes[0] = value;
                self.phase = Phase::CollectingCommand { bytes, len: 1 };
            }
            Phase::CollectingCommand { bytes, len } => {
                bytes[*len] = value;
                *len += 1;
                if *len == 6 {
                    let cmd = *bytes;
                    self.phase = Phase::Idle;
                    self.execute_command(cmd, syschip, mem);
                }
            }
            Phase::PioTransfer { write: true, lba, sector_in_transfer, count, byte_in_sector } => {
                if let Some(image) = &mut self.image {
                    let offset = (*lba as usize + *sector_in_transfer as usize) * SECTOR_SIZE + *byte_in_sector as usize;
                    if offset >= image.len() {
                        log::error!("hard disk PIO write overran the disk image");
                        return;
                    }
                    image[offset] = value;
                }
                *byte_in_sector += 1;
                if *byte_in_sector as usize == SECTOR_SIZE {
                    *byte_in_sector = 0;
                    *sector_in_transfer += 1;
                    if *sector_in_transfer == *count {
                        self.finish_transfer(syschip);
                    }
                }
            }
            _ => log::error!("hard disk data register written outside command/PIO-write phase"),
        }
    }

    fn read_data(&mut self, syschip: &mut SystemChip, _mem: &mut crate::memory::Memory) -> u8 {
        match &mut self.phase {
            Phase::PioTransfer { write: false, lba, sector_in_transfer, count, byte_in_sector } => {
                let byte = self
                    .image
                    .as_ref()
                    .map(|img| {
                        let offset = (*lba as usize + *sector_in_transfer as usize) * SECTOR_SIZE + *byte_in_sector as usize;
                        img.get(offset).copied().unwrap_or(0)
                    })
                    .unwrap_or(0);
                *byte_in_sector += 1;
                if *byte_in_sector as usize == SECTOR_SIZE {
                    *byte_in_sector = 0;
                    *sector_in_transfer += 1;
                    if *sector_in_transfer == *count {
                        self.finish_transfer(syschip);
                    }
                }
                byte
            }
            Phase::CompletionPending { .. } => self.result_status,
            _ => {
                log::error!("hard disk data register read outside PIO-read/completion phase");
                0
            }
        }
    }

    fn finish_transfer(&mut self, syschip: &mut SystemChip) {
        self.result_status = 0;
        self.phase = Phase::CompletionPending { status: 0 };
        if self.mask & 1 != 0 {
            syschip.raise_irq(syschip::IRQ_HARD_DISK);
        }
    }

    fn chs_to_lba(cyl: u16, head: u8, sector: u8) -> u32 {
        (cyl as u32 * HEADS + head as u32) * SECTORS_PER_TRACK + (sector as u32 - 1)
    }

    fn execute_command(&mut self, cmd: [u8; 6], syschip: &mut SystemChip, mem: &mut crate::memory::Memory) {
        let opcode = cmd[0] & 0x1F;
        match opcode {
            CMD_TEST_DRIVE | CMD_READY_VERIFY | CMD_RECALIBRATE | CMD_CONTROLLER_DIAGNOSTIC => {
                self.trace.push("status-only command");
                self.finish_transfer(syschip);
            }
            CMD_REQUEST_SENSE => {
                self.result_status = 0;
                self.phase = Phase::CompletionPending { status: 0 };
                self.trace.push("request-sense");
            }
            CMD_INITIALIZE_DRIVE => {
                self.trace.push("initialize-drive (configuration bytes ignored)");
                self.finish_transfer(syschip);
            }
            CMD_READ | CMD_WRITE => {
                let head = cmd[1] & 0x1F;
                let cyl = ((cmd[1] as u16 & 0xC0) << 2) | cmd[2] as u16;
                let sector = cmd[3] & 0x1F;
                let count = cmd[4].max(1) as u32;
                let lba = Self::chs_to_lba(cyl, head, sector);
                let use_dma = cmd[1] & 0x20 != 0;
                let write = opcode == CMD_WRITE;

                if use_dma {
                    self.dma_transfer(write, lba, count, syschip, mem);
                    self.finish_transfer(syschip);
                } else {
                    self.phase = Phase::PioTransfer { write, lba, sector_in_transfer: 0, count, byte_in_sector: 0 };
                }
                self.trace.push(if write { "write" } else { "read" });
            }
            _ => {
                self.trace.push("unhandled command, generic success");
                self.finish_transfer(syschip);
            }
        }
    }

    fn dma_transfer(&mut self, write: bool, lba: u32, count: u32, syschip: &mut SystemChip, mem: &mut crate::memory::Memory) {
        let Some(image) = &mut self.image else { return };
        let byte_offset = lba as usize * SECTOR_SIZE;
        let byte_len = count as usize * SECTOR_SIZE;
        if byte_offset + byte_len > image.len() {
            log::error!("hard disk DMA transfer would overrun the disk image");
            return;
        }
        let channel = syschip::DMA_HARD_DISK;
        let dma = syschip.dma();
        if write {
            let slice = &mut image[byte_offset..byte_offset + byte_len];
            let mut i = 0usize;
            dma.gather_from_memory(channel, |addr| mem.read(addr as usize), |byte| {
                if i < slice.len() {
                    slice[i] = byte;
                    i += 1;
                }
            });
        } else {
            let slice = &image[byte_offset..byte_offset + byte_len];
            let mut i = 0usize;
            dma.scatter_to_memory(channel, || {
                let b = slice.get(i).copied().unwrap_or(0);
                i += 1;
                b
            }, |addr, byte| mem.write(addr as usize, byte));
        }
    }
}

impl Default for HardDisk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use crate::syschip::SystemChip;

    #[test]
    fn pio_read_then_write_round_trips_one_sector() {
        let mut hdc = HardDisk::new();
        let mut image = vec![0u8; DISK_BYTES];
        image[0] = 0x42;
        hdc.load_image(image).unwrap();
        let mut syschip = SystemChip::new();
        let mut mem = Memory::new();

        hdc.io_write(PORT_SELECT, 0, &mut syschip, &mut mem);
        for b in [CMD_READ, 0x00, 0x00, 0x01, 0x01, 0x00] {
            hdc.io_write(PORT_DATA, b, &mut syschip, &mut mem);
        }
        let first = hdc.io_read(PORT_DATA, &mut syschip, &mut mem);
        assert_eq!(first, 0x42);
    }
}
