/*!
uart.rs - 8250-class UART (`spec.md` §4.6), grounded on
`original_source/i8250.c`. Chip-selected by an external glue-chip mode
byte: unless that mode is one of the recognized "enabled" values, reads
return 0 and writes are dropped, matching `mos5720_uart_chip_select`.
*/

use std::collections::VecDeque;
use std::io::{Read, Write};

use crate::error::EmuError;
use crate::syschip::{self, SystemChip};

const PORT_BASE: u16 = 0x3F8;

const REG_DATA: u16 = 0; // RBR/THR/DLL
const REG_IER_DLM: u16 = 1;
const REG_IIR_FCR: u16 = 2;
const REG_LCR: u16 = 3;
const REG_MCR: u16 = 4;
const REG_LSR: u16 = 5;
const REG_MSR: u16 = 6;
const REG_SCRATCH: u16 = 7;

const LCR_DLAB: u8 = 0x80;
const IER_RX_AVAILABLE: u8 = 0x01;
const IER_THR_EMPTY: u8 = 0x02;
const IIR_THR_EMPTY: u8 = 0x02;
const IIR_RX_AVAILABLE: u8 = 0x04;
const IIR_NO_INTERRUPT: u8 = 0x01;
const LSR_DATA_READY: u8 = 0x01;
const LSR_THR_EMPTY: u8 = 0x20;

const FIFO_CAPACITY: usize = 1024;

pub struct Uart {
    rx: VecDeque<u8>,
    tx: VecDeque<u8>,
    ier: u8,
    iir_thr_pending: bool,
    lcr: u8,
    mcr: u8,
    scratch: u8,
    divisor: u16,
    chip_select_mode: u8,
    tty: Option<std::fs::File>,
}

impl Uart {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            ier: 0,
            iir_thr_pending: false,
            lcr: 0,
            mcr: 0,
            scratch: 0,
            divisor: 0x0C, // 9600 baud at the emulator's reference clock
            chip_select_mode: 0,
            tty: None,
        }
    }

    pub fn attach_tty(&mut self, path: &str) -> Result<(), EmuError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| EmuError::Io { path: path.into(), source })?;
        self.tty = Some(file);
        Ok(())
    }

    pub fn set_chip_select_mode(&mut self, mode: u8) {
        self.chip_select_mode = mode;
    }

    fn chip_selected(&self) -> bool {
        matches!(self.chip_select_mode, 0x01 | 0x03)
    }

    fn dlab(&self) -> bool {
        self.lcr & LCR_DLAB != 0
    }

    pub fn io_read(&mut self, port: u16) -> u8 {
        if !self.chip_selected() {
            return 0;
        }
        match port - PORT_BASE {
            REG_DATA if self.dlab() => (self.divisor & 0xFF) as u8,
            REG_DATA => self.rx.pop_front().unwrap_or(0),
            REG_IER_DLM if self.dlab() => (self.divisor >> 8) as u8,
            REG_IER_DLM => self.ier,
            REG_IIR_FCR => {
                let iir = if self.iir_thr_pending {
                    IIR_THR_EMPTY
                } else if !self.rx.is_empty() && self.ier & IER_RX_AVAILABLE != 0 {
                    IIR_RX_AVAILABLE
                } else {
                    IIR_NO_INTERRUPT
                };
                self.iir_thr_pending = false;
                iir
            }
            REG_LCR => self.lcr,
            REG_MCR => self.mcr,
            REG_LSR => {
                let mut lsr = LSR_THR_EMPTY;
                if !self.rx.is_empty() {
                    lsr |= LSR_DATA_READY;
                }
                lsr
            }
            REG_MSR => 0,
            REG_SCRATCH => self.scratch,
            _ => 0,
        }
    }

    pub fn io_write(&mut self, port: u16, value: u8, syschip: &mut SystemChip) {
        if !self.chip_selected() {
            return;
        }
        match port - PORT_BASE {
            REG_DATA if self.dlab() => self.divisor = (self.divisor & 0xFF00) | value as u16,
            REG_DATA => {
                if self.tx.len() < FIFO_CAPACITY {
                    self.tx.push_back(value);
                }
                if self.ier & IER_THR_EMPTY != 0 {
                    self.iir_thr_pending = true;
                    syschip.raise_irq(syschip::IRQ_COM1);
                }
            }
            REG_IER_DLM if self.dlab() => self.divisor = (self.divisor & 0xFF) | ((value as u16) << 8),
            REG_IER_DLM => self.ier = value,
            REG_IIR_FCR => {}
            REG_LCR => self.lcr = value,
            REG_MCR => self.mcr = value,
            REG_SCRATCH => self.scratch = value,
            _ => {}
        }
    }

    /// One scheduler tick: poll the TTY for up to one byte, enqueue it on
    /// the RX FIFO; then flush at most one TX byte out.
    pub fn tick(&mut self, syschip: &mut SystemChip) {
        let Some(tty) = &mut self.tty else { return };
        let mut byte = [0u8; 1];
        if let Ok(1) = tty.read(&mut byte) {
            if self.rx.len() < FIFO_CAPACITY {
                self.rx.push_back(byte[0]);
            }
            if self.ier & IER_RX_AVAILABLE != 0 {
                syschip.raise_irq(syschip::IRQ_COM1);
            }
        }
        if let Some(out) = self.tx.pop_front() {
            let _ = tty.write_all(&[out]);
        }
    }
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syschip::SystemChip;

    #[test]
    fn divisor_latch_shadows_the_data_register() {
        let mut uart = Uart::new();
        uart.set_chip_select_mode(0x01);
        let mut syschip = SystemChip::new();
        uart.io_write(PORT_BASE + REG_LCR, LCR_DLAB, &mut syschip);
        uart.io_write(PORT_BASE + REG_DATA, 0x0C, &mut syschip);
        assert_eq!(uart.io_read(PORT_BASE + REG_DATA), 0x0C);
        uart.io_write(PORT_BASE + REG_LCR, 0, &mut syschip);
        assert_eq!(uart.io_read(PORT_BASE + REG_DATA), 0);
    }

    #[test]
    fn unselected_chip_ignores_writes_and_reads_zero() {
        let mut uart = Uart::new();
        let mut syschip = SystemChip::new();
        uart.io_write(PORT_BASE + REG_DATA, 0xFF, &mut syschip);
        assert_eq!(uart.io_read(PORT_BASE + REG_LSR), 0);
    }
}
