/*!
syschip::mod - The integrated system chip: interrupt controller, DMA
controller, PIT, and keyboard interface combined on one device, matching
`spec.md` §4.3 and grounded on `original_source/fe2010.c` (a single chip
covering all four roles on the real hardware this emulator models).

Submodules
- pic       - IRQ mask/pending state.
- dma       - 4-channel address/count/page/mode register file.
- pit       - 3-counter interval timer.
- keyboard  - scancode and switch/configuration registers.

Port map (`spec.md` §4.3, `original_source/fe2010.c`):
  0x00-0x07  DMA channel address/count (paired, flip-flop latched)
  0x0B       DMA mode register
  0x60       keyboard scancode (read) / n/a
  0x61       keyboard+system control register
  0x62       DIP switch register
  0x63       configuration register
  0x81-0x83, 0x87  DMA page registers (channels 2,3,1,0)
  0x40-0x42  PIT counters 0-2
  0x43       PIT control register
  0x21       IRQ mask register
  0xA0       NMI mask register
*/

pub mod dma;
pub mod keyboard;
pub mod pic;
pub mod pit;

use dma::DmaController;
use keyboard::Keyboard;
use pic::Pic;
use pit::Pit;

pub const IRQ_TIMER: u8 = 0;
pub const IRQ_KEYBOARD: u8 = 1;
pub const IRQ_MOUSE: u8 = 2;
pub const IRQ_COM2: u8 = 3;
pub const IRQ_COM1: u8 = 4;
pub const IRQ_HARD_DISK: u8 = 5;
pub const IRQ_FLOPPY_DISK: u8 = 6;
pub const IRQ_LPT1: u8 = 7;
/// The NIC shares the secondary-UART line, matching period hardware where
/// a NIC card was commonly jumpered to IRQ 3 alongside COM2.
pub const IRQ_NIC: u8 = IRQ_COM2;

pub const DMA_FLOPPY_DISK: usize = 2;
pub const DMA_HARD_DISK: usize = 3;

const PORT_KEYBOARD_DATA: u16 = 0x60;
const PORT_CONTROL: u16 = 0x61;
const PORT_SWITCHES: u16 = 0x62;
const PORT_CONFIGURATION: u16 = 0x63;
const PORT_IRQ_MASK: u16 = 0x21;
const PORT_NMI_MASK: u16 = 0xA0;
const PORT_PIT_COUNTER_0: u16 = 0x40;
const PORT_PIT_COUNTER_2: u16 = 0x42;
const PORT_PIT_CONTROL: u16 = 0x43;
const PORT_DMA_REG_FIRST: u16 = 0x00;
const PORT_DMA_REG_LAST: u16 = 0x07;
const PORT_DMA_MODE: u16 = 0x0B;

/// Ticks once every 7th scheduler iteration (matches the cycle-based POST
/// timer-2 check in `original_source/fe2010.c`); counts down all three PIT
/// counters and raises any pending IRQ lines.
const TICK_DIVISOR: u32 = 7;

pub struct SystemChip {
    pic: Pic,
    dma: DmaController,
    pit: Pit,
    keyboard: Keyboard,
    conf: u8,
    tick_cycle: u32,
}

impl SystemChip {
    pub fn new() -> Self {
        Self {
            pic: Pic::new(),
            dma: DmaController::new(),
            pit: Pit::new(),
            keyboard: Keyboard::new(),
            conf: 0,
            tick_cycle: 0,
        }
    }

    pub fn io_read(&mut self, port: u16) -> u8 {
        match port {
            PORT_KEYBOARD_DATA => self.keyboard.scancode,
            PORT_CONTROL => self.keyboard.ctrl,
            PORT_SWITCHES => self.keyboard.read_switches(self.pit.timer_2_output),
            PORT_CONFIGURATION => self.conf,
            PORT_IRQ_MASK => self.pic.irq_mask,
            PORT_DMA_REG_FIRST..=PORT_DMA_REG_LAST => self.dma.read_addr_count(port as u8),
            PORT_PIT_COUNTER_0..=PORT_PIT_COUNTER_2 => self.pit.read_counter((port - PORT_PIT_COUNTER_0) as usize),
            _ => 0xFF,
        }
    }

    pub fn io_write(&mut self, port: u16, value: u8) {
        match port {
            PORT_CONTROL => {
                if let Some(scancode) = self.keyboard.write_ctrl(value) {
                    log::trace!("keyboard clock flank, posting scancode {scancode:#04x}");
                    self.pic.raise(IRQ_KEYBOARD);
                }
            }
            PORT_CONFIGURATION => self.conf = value,
            PORT_IRQ_MASK => self.pic.irq_mask = value,
            PORT_NMI_MASK => self.pic.nmi_mask = value,
            PORT_DMA_REG_FIRST..=PORT_DMA_REG_LAST => self.dma.write_addr_count(port as u8, value),
            PORT_DMA_MODE => self.dma.write_mode(value),
            0x87 => self.dma.write_page(0, value),
            0x83 => self.dma.write_page(1, value),
            0x81 => self.dma.write_page(2, value),
            0x82 => self.dma.write_page(3, value),
            PORT_PIT_COUNTER_0..=PORT_PIT_COUNTER_2 => self.pit.write_counter((port - PORT_PIT_COUNTER_0) as usize, value),
            PORT_PIT_CONTROL => self.pit.write_control(value),
            _ => {}
        }
    }

    pub fn keyboard_press(&mut self, scancode: u8) -> bool {
        let delivered = self.keyboard.press(scancode);
        if delivered {
            self.pic.raise(IRQ_KEYBOARD);
        }
        delivered
    }

    /// Raises an IRQ line from a peripheral device (floppy, HDC, UART, NIC).
    pub fn raise_irq(&mut self, irq_no: u8) {
        self.pic.raise(irq_no);
    }

    pub fn dma(&self) -> &DmaController {
        &self.dma
    }

    pub fn dma_mut(&mut self) -> &mut DmaController {
        &mut self.dma
    }

    /// Advances the PIT and returns the IRQ lines that became pending this
    /// tick (including any already-pending lines a peripheral raised
    /// earlier but the CPU had interrupts disabled for). The scheduler
    /// drains this list through `Cpu::irq`, re-raising any that the CPU
    /// declines (`clear_pending` is only called on successful delivery).
    pub fn tick(&mut self) -> Vec<u8> {
        self.tick_cycle += 1;
        if self.tick_cycle < TICK_DIVISOR {
            return Vec::new();
        }
        self.tick_cycle = 0;
        if self.pit.tick() {
            self.pic.raise(IRQ_TIMER);
        }
        self.pic.take_pending()
    }

    pub fn acknowledge_irq(&mut self, irq_no: u8) {
        self.pic.clear_pending(irq_no);
    }
}

impl Default for SystemChip {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_clock_flank_queues_keyboard_irq() {
        let mut chip = SystemChip::new();
        chip.io_write(PORT_CONTROL, 1 << 6);
        assert_eq!(chip.io_read(PORT_KEYBOARD_DATA), 0xAA);
        assert!(chip.pic.pending[IRQ_KEYBOARD as usize]);
    }

    #[test]
    fn dma_page_registers_route_by_port() {
        let mut chip = SystemChip::new();
        chip.io_write(0x87, 0x01);
        chip.io_write(0x83, 0x02);
        chip.io_write(0x81, 0x03);
        chip.io_write(0x82, 0x04);
        // indirectly verified via DmaController test coverage; here just
        // confirm no panic/route collision across the four page ports.
        let _ = chip.dma();
    }
}
