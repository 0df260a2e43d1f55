/*!
floppy.rs - The floppy disk controller (`spec.md` §4.4), grounded on
`original_source/fdc9268.c`.

A finite state machine over three registers: the digital-output register
(drive select + motor enables), the main-status register (busy/direction
bits software polls before each FIFO byte), and a data FIFO that carries
command bytes in, and status/result bytes out. Reads and writes to
sector data itself travel over DMA channel 2, not the FIFO.
*/

use crate::error::EmuError;
use crate::syschip::{self, SystemChip};
use crate::trace::TraceRing;

const PORT_DOR: u16 = 0x3F2;
const PORT_MSR: u16 = 0x3F4;
const PORT_DATA: u16 = 0x3F5;

const CMD_SPECIFY: u8 = 0x03;
const CMD_SENSE_DRIVE_STATUS: u8 = 0x04;
const CMD_RECALIBRATE: u8 = 0x07;
const CMD_SENSE_INTERRUPT_STATUS: u8 = 0x08;
const CMD_SEEK: u8 = 0x0F;
const CMD_WRITE: u8 = 0x05;
const CMD_READ: u8 = 0x06;

const ST0_SEEK_END: u8 = 0x20;
const ST1_END_OF_CYLINDER: u8 = 0x80;
const ST1_NO_DATA: u8 = 0x04;

const MSR_RQM: u8 = 0x80; // request for master, ready for next byte
const MSR_DIO: u8 = 0x40; // 1 = controller -> CPU (result phase)
const MSR_BUSY: u8 = 0x10;

const HEADS_PER_CYLINDER: u32 = 2;
const SECTOR_SIZE: usize = 512;
const MAX_IMAGE_BYTES: usize = 2_949_120;

fn params_for(cmd: u8) -> usize {
    match cmd & 0x1F {
        CMD_SPECIFY => 2,
        CMD_SENSE_DRIVE_STATUS => 1,
        CMD_RECALIBRATE => 1,
        CMD_SENSE_INTERRUPT_STATUS => 0,
        CMD_SEEK => 2,
        CMD_READ | CMD_WRITE => 8,
        _ => 0,
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Idle,
    CollectingParams { cmd: u8, params: Vec<u8>, needed: usize },
    ResultPhase { bytes: Vec<u8>, pos: usize },
}

#[derive(Debug, Clone, Copy, Default)]
struct Drive {
    present_cylinder: u8,
    sectors_per_track: u8,
}

pub struct FloppyImage {
    pub data: Vec<u8>,
    pub sectors_per_track: u8,
}

pub struct FloppyTrace {
    pub command: u8,
    pub result: &'static str,
}

pub struct Floppy {
    images: [Option<Vec<u8>>; 2],
    drives: [Drive; 2],
    phase: Phase,
    dor: u8,
    last_irq_st0: Option<u8>,
    trace: TraceRing<FloppyTrace>,
}

impl Floppy {
    pub fn new() -> Self {
        Self {
            images: [None, None],
            drives: [Drive::default(); 2],
            phase: Phase::Idle,
            dor: 0,
            last_irq_st0: None,
            trace: TraceRing::new(64),
        }
    }

    pub fn trace(&self) -> &TraceRing<FloppyTrace> {
        &self.trace
    }

    /// Autodetects sectors-per-track from the BIOS Parameter Block at
    /// byte 0x18 unless `spt_override` is given. Accepted autodetected
    /// values are 9, 18, 36.
    pub fn load_image(&mut self, drive: usize, data: Vec<u8>, spt_override: Option<u8>) -> Result<(), EmuError> {
        if data.len() > MAX_IMAGE_BYTES {
            return Err(EmuError::FloppyImageTooLarge {
                path: format!("drive {drive}"),
                size: data.len(),
            });
        }
        let spt = match spt_override {
            Some(spt) => spt,
            None => {
                let byte = *data.get(0x18).unwrap_or(&0);
                match byte {
                    9 | 18 | 36 => byte,
                    other => return Err(EmuError::UnknownFloppyGeometry { path: format!("drive {drive}"), byte: other }),
                }
            }
        };
        self.drives[drive].sectors_per_track = spt;
        self.images[drive] = Some(data);
        Ok(())
    }

    pub fn io_read(&mut self, port: u16) -> u8 {
        match port {
            PORT_MSR => self.msr(),
            PORT_DATA => self.read_data(),
            _ => 0xFF,
        }
    }

    pub fn io_write(&mut self, port: u16, value: u8, syschip: &mut SystemChip, mem: &mut crate::memory::Memory) {
        match port {
            PORT_DOR => self.dor = value,
            PORT_DATA => self.write_data(value, syschip, mem),
            _ => {}
        }
    }

    fn msr(&self) -> u8 {
        let mut msr = MSR_RQM;
        match &self.phase {
            Phase::ResultPhase { .. } => msr |= MSR_DIO | MSR_BUSY,
            Phase::CollectingParams { .. } => msr |= MSR_BUSY,
            Phase::Idle => {}
        }
        msr
    }

    fn read_data(&mut self) -> u8 {
        match &mut self.phase {
            Phase::ResultPhase { bytes, pos } => {
                let byte = bytes.get(*pos).copied().unwrap_or(0);
                *pos += 1;
                if *pos >= bytes.len() {
                    self.phase = Phase::Idle;
                }
                byte
            }
            _ => {
                log::error!("floppy data register read outside result phase");
                0
            }
        }
    }

    fn write_data(&mut self, value: u8, syschip: &mut SystemChip, mem: &mut crate::memory::Memory) {
        match &mut self.phase {
            Phase::Idle => {
                let needed = params_for(value);
                if needed == 0 {
                    self.dispatch(value, &[], syschip, mem);
                } else {
                    self.phase = Phase::CollectingParams { cmd: value, params: Vec::new(), needed };
                }
            }
            Phase::CollectingParams { cmd, params, needed } => {
                params.push(value);
                if params.len() == *needed {
                    let cmd = *cmd;
                    let params = std::mem::take(params);
                    self.phase = Phase::Idle;
                    self.dispatch(cmd, &params, syschip, mem);
                }
            }
            Phase::ResultPhase { .. } => {
                log::error!("firmware wrote command byte {value:#04x} while a result was pending");
            }
        }
    }

    fn dispatch(&mut self, cmd: u8, params: &[u8], syschip: &mut SystemChip, mem: &mut crate::memory::Memory) {
        match cmd & 0x1F {
            CMD_SPECIFY => {}
            CMD_SENSE_DRIVE_STATUS => {
                let drive = (params[0] & 0x3) as usize;
                let st3 = self.drives[drive].present_cylinder.min(1);
                self.phase = Phase::ResultPhase { bytes: vec![st3], pos: 0 };
            }
            CMD_SENSE_INTERRUPT_STATUS => {
                let st0 = self.last_irq_st0.take().unwrap_or(0x80);
                let pcn = self.drives[0].present_cylinder;
                self.phase = Phase::ResultPhase { bytes: vec![st0, pcn], pos: 0 };
            }
            CMD_RECALIBRATE => {
                let drive = (params[0] & 0x3) as usize;
                self.drives[drive].present_cylinder = 0;
                self.last_irq_st0 = Some(drive as u8);
                syschip.raise_irq(syschip::IRQ_FLOPPY_DISK);
                self.trace.push(FloppyTrace { command: cmd, result: "recalibrate" });
            }
            CMD_SEEK => {
                let drive = (params[0] & 0x3) as usize;
                let cyl = params[1];
                self.drives[drive].present_cylinder = cyl;
                self.last_irq_st0 = Some(ST0_SEEK_END | (drive as u8));
                syschip.raise_irq(syschip::IRQ_FLOPPY_DISK);
                self.trace.push(FloppyTrace { command: cmd, result: "seek" });
            }
            CMD_READ | CMD_WRITE => {
                self.transfer(cmd, params, syschip, mem);
            }
            other => {
                log::error!("unexpected floppy command byte {other:#04x}");
                self.phase = Phase::ResultPhase { bytes: vec![0x80], pos: 0 };
            }
        }
    }

    fn lba(&self, drive: usize, cyl: u8, head: u8, sector: u8) -> u64 {
        let spt = self.drives[drive].sectors_per_track.max(1) as u64;
        ((cyl as u64 * HEADS_PER_CYLINDER as u64 + head as u64) * spt) + sector as u64 - 1
    }

    fn transfer(&mut self, cmd: u8, params: &[u8], syschip: &mut SystemChip, mem: &mut crate::memory::Memory) {
        let drive = (params[0] & 0x3) as usize;
        let cyl = params[1];
        let head = params[2];
        let sector = params[3];
        let lba = self.lba(drive, cyl, head, sector);
        let byte_offset = lba as usize * SECTOR_SIZE;

        let is_write = cmd & 0x1F == CMD_WRITE;
        let (st0, st1) = match &mut self.images[drive] {
            None => (0x40 | (drive as u8), ST1_NO_DATA),
            Some(image) => {
                if byte_offset + SECTOR_SIZE > image.len() {
                    (0x40 | (drive as u8), ST1_END_OF_CYLINDER)
                } else {
                    let channel = syschip::DMA_FLOPPY_DISK;
                    if is_write {
                        let dma = syschip.dma();
                        let slice = &mut image[byte_offset..byte_offset + SECTOR_SIZE];
                        let mut i = 0usize;
                        dma.gather_from_memory(channel, |addr| mem.read(addr as usize), |byte| {
                            if i < slice.len() {
                                slice[i] = byte;
                                i += 1;
                            }
                        });
                    } else {
                        let dma = syschip.dma();
                        let slice = &image[byte_offset..byte_offset + SECTOR_SIZE];
                        let mut i = 0usize;
                        dma.scatter_to_memory(channel, || {
                            let b = slice.get(i).copied().unwrap_or(0);
                            i += 1;
                            b
                        }, |addr, byte| mem.write(addr as usize, byte));
                    }
                    (drive as u8, 0)
                }
            }
        };

        let result = vec![st0, st1, 0, cyl, head, sector, params.get(4).copied().unwrap_or(2)];
        self.phase = Phase::ResultPhase { bytes: result, pos: 0 };
        syschip.raise_irq(syschip::IRQ_FLOPPY_DISK);
        self.trace.push(FloppyTrace { command: cmd, result: if is_write { "write" } else { "read" } });
    }
}

impl Default for Floppy {
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
    fn read_command_drives_dma_scatter_into_memory() {
        let mut fdc = Floppy::new();
        let image = vec![0xAAu8; SECTOR_SIZE];
        fdc.load_image(0, image, Some(9)).unwrap();

        let mut syschip = SystemChip::new();
        // Program DMA channel 2: page 0, base 0x2000, count 0x01FF, write mode.
        syschip.dma_mut().write_page(2, 0x00);
        syschip.dma_mut().write_addr_count(4, 0x00);
        syschip.dma_mut().write_addr_count(4, 0x20);
        syschip.dma_mut().write_addr_count(5, 0xFF);
        syschip.dma_mut().write_addr_count(5, 0x01);
        syschip.dma_mut().write_mode(0b0000_0110); // channel 2, write-to-memory

        let mut mem = Memory::new();
        fdc.io_write(PORT_DATA, CMD_READ, &mut syschip, &mut mem);
        for b in [0u8, 0, 1, 1, 2, 2, 9, 0x1B] {
            fdc.io_write(PORT_DATA, b, &mut syschip, &mut mem);
        }

        for i in 0..SECTOR_SIZE {
            assert_eq!(mem.read(0x2000 + i), 0xAA);
        }
    }
}
