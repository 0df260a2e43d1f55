/*!
scheduler.rs - `Machine`: owns every device and the CPU, and runs the main
loop (`spec.md` §4.9), grounded on `original_source/main.c`'s scheduler
and `fe2010.c`'s port-dispatch table. `MachineBus` is a thin `SystemBus`
adapter over `&mut Machine` handed to the CPU for the duration of one
instruction/IRQ.

Devices are wired as a star graph around `Machine` (`spec.md` §9): no
device holds another device directly. Cross-device needs (floppy/HDC
raising an IRQ or driving DMA, UART/NIC raising an IRQ) are satisfied by
passing `&mut SystemChip` into the device's own `io_read`/`io_write`, which
`Machine::io_read_inner`/`io_write_inner` can do safely because it
accesses `self`'s fields directly rather than through a helper that would
force one borrow over the whole struct.
*/

use crate::bus::{IoBus, PortOwner};
use crate::cga::Cga;
use crate::cpu::{Cpu, SystemBus};
use crate::error::{DebuggerBreak, EmuError};
use crate::floppy::Floppy;
use crate::harddisk::HardDisk;
use crate::memory::Memory;
use crate::nic::peer::Peer;
use crate::nic::Nic;
use crate::rtc::Rtc;
use crate::syschip::SystemChip;
use crate::uart::Uart;

const PORT_GLUE_UART_SELECT: u16 = 0x230;
const PORT_GLUE_MOUSE: u16 = 0x232;
const PORT_GLUE_CONFIG_FIRST: u16 = 0x23C;
const PORT_GLUE_CONFIG_LAST: u16 = 0x23F;

const KEYBOARD_AND_SCREEN_PERIOD: u64 = 10_000;
const UART_TICK_PERIOD: u64 = 100;

pub struct MachineConfig {
    pub bios_rom: Option<(std::path::PathBuf, usize)>,
    pub floppy_a: Option<(std::path::PathBuf, Option<u8>)>,
    pub floppy_b: Option<(std::path::PathBuf, Option<u8>)>,
    pub hard_disk: Option<std::path::PathBuf>,
    pub uart_tty: Option<String>,
    pub fsproto_root: std::path::PathBuf,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            bios_rom: None,
            floppy_a: None,
            floppy_b: None,
            hard_disk: None,
            uart_tty: None,
            fsproto_root: std::path::PathBuf::from("."),
        }
    }
}

pub struct Machine {
    pub memory: Memory,
    bus: IoBus,
    pub cpu: Cpu,
    pub syschip: SystemChip,
    pub floppy: Floppy,
    pub harddisk: HardDisk,
    pub uart: Uart,
    pub cga: Cga,
    pub rtc: Rtc,
    pub nic: Nic,
    peer: Peer,
    glue_mouse: u8,
    glue_config: [u8; 4],
    iterations: u64,
    pending_break: Option<DebuggerBreak>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, EmuError> {
        let mut bus = IoBus::new();
        bus.register_range(0x00..=0x0B, PortOwner::SystemChip);
        bus.register(0x21, PortOwner::SystemChip);
        bus.register(0xA0, PortOwner::SystemChip);
        bus.register_range(0x40..=0x43, PortOwner::SystemChip);
        bus.register_range(0x60..=0x63, PortOwner::SystemChip);
        bus.register_range(0x81..=0x83, PortOwner::SystemChip);
        bus.register(0x87, PortOwner::SystemChip);

        bus.register(0x3F2, PortOwner::Floppy);
        bus.register(0x3F4, PortOwner::Floppy);
        bus.register(0x3F5, PortOwner::Floppy);

        bus.register_range(0x320..=0x323, PortOwner::HardDisk);
        bus.register_range(0x3F8..=0x3FF, PortOwner::Uart);
        bus.register_range(0x300..=0x31F, PortOwner::Nic);
        bus.register_range(0x2C0..=0x2CF, PortOwner::Rtc);

        bus.register(0x3DA, PortOwner::Cga);
        bus.register(0x3D8, PortOwner::Cga);
        bus.register(0x3D4, PortOwner::Cga);
        bus.register(0x3D5, PortOwner::Cga);

        bus.register(PORT_GLUE_UART_SELECT, PortOwner::GlueChip);
        bus.register(PORT_GLUE_MOUSE, PortOwner::GlueChip);
        bus.register_range(PORT_GLUE_CONFIG_FIRST..=PORT_GLUE_CONFIG_LAST, PortOwner::GlueChip);

        let mut memory = Memory::new();
        let mut floppy = Floppy::new();
        let mut harddisk = HardDisk::new();
        let mut uart = Uart::new();

        if let Some((path, addr)) = &config.bios_rom {
            memory.load_rom_file(path, *addr)?;
        }
        if let Some((path, spt)) = &config.floppy_a {
            let data = std::fs::read(path).map_err(|source| EmuError::Io { path: path.display().to_string(), source })?;
            floppy.load_image(0, data, *spt)?;
        }
        if let Some((path, spt)) = &config.floppy_b {
            let data = std::fs::read(path).map_err(|source| EmuError::Io { path: path.display().to_string(), source })?;
            floppy.load_image(1, data, *spt)?;
        }
        if let Some(path) = &config.hard_disk {
            let data = std::fs::read(path).map_err(|source| EmuError::Io { path: path.display().to_string(), source })?;
            harddisk.load_image(data)?;
        }
        if let Some(tty) = &config.uart_tty {
            uart.attach_tty(tty)?;
        }
        crate::nic::fsproto::ensure_root_exists(&config.fsproto_root)
            .map_err(|source| EmuError::Io { path: config.fsproto_root.display().to_string(), source })?;

        Ok(Self {
            memory,
            bus,
            cpu: Cpu::new(),
            syschip: SystemChip::new(),
            floppy,
            harddisk,
            uart,
            cga: Cga::new(),
            rtc: Rtc::new(),
            nic: Nic::new(),
            peer: Peer::new(config.fsproto_root),
            glue_mouse: 0,
            glue_config: [0; 4],
            iterations: 0,
            pending_break: None,
        })
    }

    pub fn pending_break(&mut self) -> Option<DebuggerBreak> {
        self.pending_break.take()
    }

    /// Direct port I/O, for harnesses (tests, a future debugger) driving the
    /// machine from outside the CPU's own fetch/execute loop.
    pub fn io_read(&mut self, port: u16) -> u8 {
        self.io_read_inner(port)
    }

    /// Direct port I/O, for harnesses (tests, a future debugger) driving the
    /// machine from outside the CPU's own fetch/execute loop.
    pub fn io_write(&mut self, port: u16, value: u8) {
        self.io_write_inner(port, value);
    }

    /// Runs until a debugger break is raised or `halted_forever` (HLT with
    /// interrupts masked and nothing left to wake it) is detected by the
    /// caller via `cpu.halt`.
    pub fn step(&mut self) {
        // `Cpu::step`/`Cpu::irq` need `&mut self.cpu` as the receiver and a
        // `SystemBus` over the rest of the machine at the same time; since
        // neither borrow-checks against a `self.cpu` still living inside
        // `self`, the CPU is swapped out for the duration of the call and
        // swapped back in afterwards (the teacher's CPU struct is `Default`
        // for exactly this kind of temporary-takeover pattern).
        let mut cpu = std::mem::take(&mut self.cpu);
        cpu.step(&mut MachineBus(self));
        let pending_irqs = self.syschip.tick();
        for irq in pending_irqs {
            if cpu.irq(&mut MachineBus(self), 8 + irq) {
                self.syschip.acknowledge_irq(irq);
            }
        }
        self.cpu = cpu;

        self.iterations += 1;
        if self.iterations % UART_TICK_PERIOD == 0 {
            self.uart.tick(&mut self.syschip);
        }
        if self.iterations % KEYBOARD_AND_SCREEN_PERIOD == 0 {
            self.tick_network();
        }
    }

    fn tick_network(&mut self) {
        for frame in self.peer.tick() {
            self.nic.receive_frame(&frame, &mut self.syschip);
        }
    }

    fn deliver_nic_transmit(&mut self, frame: Vec<u8>) {
        for reply in self.peer.handle_frame(&frame) {
            self.nic.receive_frame(&reply, &mut self.syschip);
        }
    }

    fn io_read_inner(&mut self, port: u16) -> u8 {
        match self.bus.read_owner(port) {
            PortOwner::Unhooked => 0xFF,
            PortOwner::SystemChip => self.syschip.io_read(port),
            PortOwner::Floppy => self.floppy.io_read(port),
            PortOwner::HardDisk => self.harddisk.io_read(port, &mut self.syschip, &mut self.memory),
            PortOwner::Uart => self.uart.io_read(port),
            PortOwner::Nic => self.nic.io_read(port),
            PortOwner::Rtc => self.rtc.io_read(port),
            PortOwner::Cga => self.cga.io_read(port),
            PortOwner::GlueChip => match port {
                PORT_GLUE_MOUSE => self.glue_mouse,
                PORT_GLUE_CONFIG_FIRST..=PORT_GLUE_CONFIG_LAST => self.glue_config[(port - PORT_GLUE_CONFIG_FIRST) as usize],
                _ => 0xFF,
            },
        }
    }

    fn io_write_inner(&mut self, port: u16, value: u8) {
        match self.bus.write_owner(port) {
            PortOwner::Unhooked => {}
            PortOwner::SystemChip => self.syschip.io_write(port, value),
            PortOwner::Floppy => self.floppy.io_write(port, value, &mut self.syschip, &mut self.memory),
            PortOwner::HardDisk => self.harddisk.io_write(port, value, &mut self.syschip, &mut self.memory),
            PortOwner::Uart => self.uart.io_write(port, value, &mut self.syschip),
            PortOwner::Nic => {
                if let Some(frame) = self.nic.io_write(port, value, &mut self.syschip) {
                    self.deliver_nic_transmit(frame);
                }
            }
            PortOwner::Rtc => self.rtc.io_write(port, value),
            PortOwner::Cga => self.cga.io_write(port, value),
            PortOwner::GlueChip => match port {
                PORT_GLUE_UART_SELECT => self.uart.set_chip_select_mode(value),
                PORT_GLUE_MOUSE => self.glue_mouse = value,
                PORT_GLUE_CONFIG_FIRST..=PORT_GLUE_CONFIG_LAST => self.glue_config[(port - PORT_GLUE_CONFIG_FIRST) as usize] = value,
                _ => {}
            },
        }
    }
}

/// Thin wrapper so `Cpu::step`'s `impl SystemBus` bound can borrow
/// `Machine` without `Machine` itself implementing the trait (the trait's
/// `mem_read` takes `&self`, but device I/O needs `&mut self` - routing
/// both through one concrete type keeps the CPU oblivious to that split).
struct MachineBus<'a>(&'a mut Machine);

impl SystemBus for MachineBus<'_> {
    fn mem_read(&self, addr: usize) -> u8 {
        self.0.memory.read(addr)
    }

    fn mem_write(&mut self, addr: usize, value: u8) {
        self.0.memory.write(addr, value);
    }

    fn io_read(&mut self, port: u16) -> u8 {
        self.0.io_read_inner(port)
    }

    fn io_write(&mut self, port: u16, value: u8) {
        self.0.io_write_inner(port, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_dma_floppy_read_delivers_sector_and_raises_irq() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = Machine::new(MachineConfig {
            fsproto_root: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        let mut image = vec![0xAAu8; 512 * 9 * 2 * 40];
        image[0x18] = 9;
        machine.floppy.load_image(0, image, None).unwrap();

        machine.syschip.dma_mut().write_page(2, 0x00);
        machine.io_write(0x0B, 0b0100_0110); // channel 2, write mode, autoinit off
        machine.io_write(0x04, 0x00);
        machine.io_write(0x04, 0x20); // base address 0x2000
        machine.io_write(0x05, 0xFF);
        machine.io_write(0x05, 0x01); // count 0x01FF

        // CMD_READ, then 8 parameters: drive=0, cyl=0, head=0, sector=1,
        // size-code=2 (512 bytes), eot=9, gap=0x1B, dtl=0xFF.
        for b in [0x06u8, 0x00, 0x00, 0x00, 0x01, 0x02, 0x09, 0x1B, 0xFF] {
            machine.io_write(0x3F5, b);
        }

        for i in 0..512usize {
            assert_eq!(machine.memory.read(0x2000 + i), 0xAA);
        }
    }
}
