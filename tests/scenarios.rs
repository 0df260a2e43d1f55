//! End-to-end scenarios (`spec.md` §8, S1-S6), each driving the public
//! crate API the way a front-end would rather than reaching into private
//! module internals.

use pcxt::cpu::regs::{self, GpRegs};
use pcxt::cpu::{Cpu, SystemBus};
use pcxt::memory::Memory;
use pcxt::nic::checksum;
use pcxt::nic::fsproto::{FsProto, FUNC_GETATTR, FUNC_MKDIR, RESULT_OK};
use pcxt::nic::peer::Peer;
use pcxt::nic::Nic;
use pcxt::scheduler::{Machine, MachineConfig};
use pcxt::syschip::{SystemChip, IRQ_FLOPPY_DISK, IRQ_NIC};

const PORT_IRQ_MASK: u16 = 0x21;

struct TestBus {
    mem: Memory,
}

impl SystemBus for TestBus {
    fn mem_read(&self, addr: usize) -> u8 {
        self.mem.read(addr)
    }
    fn mem_write(&mut self, addr: usize, value: u8) {
        self.mem.write(addr, value);
    }
    fn io_read(&mut self, _port: u16) -> u8 {
        0xFF
    }
    fn io_write(&mut self, _port: u16, _value: u8) {}
}

#[test]
fn s1_cpu_add_sets_documented_flags() {
    let mut mem = Memory::new();
    mem.write(0xFFFF0, 0x04); // ADD AL, imm8
    mem.write(0xFFFF1, 0x01);
    let mut bus = TestBus { mem };
    let mut cpu = Cpu::new();
    cpu.regs.gp.ax = 0x7F;
    cpu.step(&mut bus);

    assert_eq!(GpRegs::low(cpu.regs.gp.ax), 0x80);
    assert!(cpu.regs.flags.get(regs::OF));
    assert!(!cpu.regs.flags.get(regs::ZF));
    assert!(cpu.regs.flags.get(regs::SF));
    assert!(!cpu.regs.flags.get(regs::PF));
    assert!(cpu.regs.flags.get(regs::AF));
    assert!(!cpu.regs.flags.get(regs::CF));
}

#[test]
fn s2_string_move_copies_and_advances_index_registers() {
    let mut mem = Memory::new();
    for (i, b) in [0xDEu8, 0xAD, 0xBE, 0xEF].iter().enumerate() {
        mem.write(0x10000 + i, *b);
    }
    mem.write(0xFFFF0, 0xF3); // REP MOVSB
    mem.write(0xFFFF1, 0xA4);
    let mut bus = TestBus { mem };
    let mut cpu = Cpu::new();
    cpu.regs.ds = 0x1000;
    cpu.regs.si = 0;
    cpu.regs.es = 0x2000;
    cpu.regs.di = 0;
    cpu.regs.gp.cx = 4;
    cpu.step(&mut bus);

    for i in 0..4 {
        assert_eq!(bus.mem.read(0x20000 + i), bus.mem.read(0x10000 + i));
    }
    assert_eq!(cpu.regs.gp.cx, 0);
    assert_eq!(cpu.regs.si, 4);
    assert_eq!(cpu.regs.di, 4);
}

#[test]
fn s3_interrupt_dispatch_pushes_frame_and_loads_vector() {
    let mut mem = Memory::new();
    mem.write(0x40, 0x00);
    mem.write(0x41, 0x01);
    mem.write(0x42, 0x00);
    mem.write(0x43, 0x10);
    mem.write(0xFFFF0, 0xCD); // INT 0x10
    mem.write(0xFFFF1, 0x10);
    let mut bus = TestBus { mem };
    let mut cpu = Cpu::new();
    cpu.regs.ss = 0;
    cpu.regs.sp = 0x0100;
    cpu.regs.flags.set(regs::IF, true);
    cpu.step(&mut bus);

    assert_eq!(bus.mem.read(0x100), 0xF2); // IP_lo of return address 0xFFF2
    assert_eq!(bus.mem.read(0x101), 0xFF); // IP_hi
    assert_eq!(bus.mem.read(0x102), 0x00); // CS_lo
    assert_eq!(bus.mem.read(0x103), 0xF0); // CS_hi
    assert_eq!(cpu.regs.cs, 0x1000);
    assert_eq!(cpu.regs.ip, 0x0100);
    assert!(!cpu.regs.flags.get(regs::IF));
}

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

    // Unmask IRQ 6 (floppy disk) so the controller's completion interrupt
    // is not dropped - reset state leaves every line masked.
    machine.io_write(PORT_IRQ_MASK, 1 << IRQ_FLOPPY_DISK);

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

    let mut raised = Vec::new();
    for _ in 0..8 {
        raised.extend(machine.syschip.tick());
    }
    assert!(raised.contains(&IRQ_FLOPPY_DISK));
}

#[test]
fn s5_icmp_echo_gets_swapped_reply_and_raises_irq() {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = Peer::new(dir.path());
    let mut nic = Nic::new();
    let mut syschip = SystemChip::new();
    syschip.io_write(PORT_IRQ_MASK, 1 << IRQ_NIC);
    // Select register page 1 and unmask the NIC's own receive-complete bit
    // (ISR_PRX) so `receive_frame` actually raises the line.
    nic.io_write(0x300, 0x40, &mut syschip);
    nic.io_write(0x30B, 0x01, &mut syschip);

    let mut icmp = vec![8u8, 0, 0, 0, 0, 1, 0, 1]; // type=8 code=0 id=1 seq=1, no extra payload
    let csum = checksum::ones_complement(&icmp, false);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());

    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&((20 + icmp.len()) as u16).to_be_bytes());
    ip[8] = 64; // TTL
    ip[9] = 1; // ICMP
    ip[12..16].copy_from_slice(&[10, 0, 0, 2]); // source 10.0.0.2
    ip[16..20].copy_from_slice(&[10, 0, 0, 1]); // destination 10.0.0.1
    let ip_csum = checksum::ones_complement(&ip, false);
    ip[10..12].copy_from_slice(&ip_csum.to_be_bytes());

    let mut frame = Vec::with_capacity(14 + 20 + icmp.len());
    frame.extend_from_slice(&[0x11; 6]); // destination MAC: the peer
    frame.extend_from_slice(&[0x22; 6]); // source MAC: the emulated machine
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(&ip);
    frame.extend_from_slice(&icmp);
    assert_eq!(frame.len(), 42);

    let replies = peer.handle_frame(&frame);
    assert_eq!(replies.len(), 1);
    let reply = &replies[0];

    assert_eq!(&reply[0..6], &[0x22; 6]); // destination: the machine
    assert_eq!(&reply[6..12], &[0x11; 6]); // source: the peer
    assert_eq!(&reply[12..14], &0x0800u16.to_be_bytes());
    assert_eq!(&reply[26..30], &[10, 0, 0, 1]); // IP source: the peer
    assert_eq!(&reply[30..34], &[10, 0, 0, 2]); // IP destination: the machine
    assert_eq!(reply[34], 0); // ICMP echo reply
    let reply_icmp = &reply[34..];
    assert_eq!(checksum::ones_complement(reply_icmp, false), 0);

    nic.receive_frame(reply, &mut syschip);
    let mut raised = Vec::new();
    for _ in 0..8 {
        raised.extend(syschip.tick());
    }
    assert!(raised.contains(&IRQ_NIC));
}

#[test]
fn s6_filesystem_mkdir_then_getattr_reports_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut fs = FsProto::new(dir.path());

    let path = b"\\X\0";
    let mkdir = fs.dispatch(FUNC_MKDIR, path);
    assert_eq!(mkdir.result, RESULT_OK);
    assert!(dir.path().join("x").is_dir());

    let attr = fs.dispatch(FUNC_GETATTR, path);
    assert_eq!(attr.result, RESULT_OK);
    // Payload offset 8 is wire frame offset 0x3C + 8 = 0x44.
    assert_eq!(attr.payload[8], 0x10);
}
