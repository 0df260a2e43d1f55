/*!
main.rs - Executable front-end: command-line flags, `MachineConfig`
construction, and the scheduler loop (`spec.md` §6). The interactive
debugger, the screen/keyboard front-end, and a fully-featured argument
parser are all explicitly out-of-scope collaborators (`spec.md` §1); this
just does enough manual flag parsing to stand the machine up and hands
`DebuggerBreak`s to the log rather than an interactive console.
*/

use std::path::PathBuf;
use std::process::ExitCode;

use pcxt::error::EmuError;
use pcxt::scheduler::{Machine, MachineConfig};

const DEFAULT_ROM_ADDR: usize = 0xF8000;
const HELP: &str = "\
pcxt - early-1980s IBM PC/XT-class emulator core

USAGE:
    pcxt [OPTIONS]

OPTIONS:
    -h              Print this help and exit
    -a PATH         Load floppy drive 0 image
    -b PATH         Load floppy drive 1 image
    -w PATH         Load hard-disk image
    -s N            Override floppy sectors-per-track (9, 18, or 36)
    -r PATH         BIOS ROM file (default: none)
    -x HEX          BIOS ROM load address, e.g. 0xF8000 (default: 0xF8000)
    -t PATH         Pass-through primary UART to an external character device
";

struct Args {
    rom: Option<PathBuf>,
    rom_addr: usize,
    floppy_a: Option<PathBuf>,
    floppy_b: Option<PathBuf>,
    spt_override: Option<u8>,
    hard_disk: Option<PathBuf>,
    uart_tty: Option<String>,
}

fn parse_args() -> Result<Option<Args>, EmuError> {
    let mut args = Args {
        rom: None,
        rom_addr: DEFAULT_ROM_ADDR,
        floppy_a: None,
        floppy_b: None,
        spt_override: None,
        hard_disk: None,
        uart_tty: None,
    };

    let mut raw = std::env::args().skip(1);
    while let Some(flag) = raw.next() {
        let mut value = || raw.next().ok_or_else(|| EmuError::BadArgs(format!("{flag} requires an argument")));
        match flag.as_str() {
            "-h" | "--help" => {
                print!("{HELP}");
                return Ok(None);
            }
            "-a" => args.floppy_a = Some(PathBuf::from(value()?)),
            "-b" => args.floppy_b = Some(PathBuf::from(value()?)),
            "-w" => args.hard_disk = Some(PathBuf::from(value()?)),
            "-r" => args.rom = Some(PathBuf::from(value()?)),
            "-t" => args.uart_tty = Some(value()?),
            "-s" => {
                let raw_val = value()?;
                args.spt_override = Some(raw_val.parse().map_err(|_| EmuError::BadArgs(format!("invalid -s value: {raw_val}")))?);
            }
            "-x" => {
                let raw_val = value()?;
                let trimmed = raw_val.trim_start_matches("0x").trim_start_matches("0X");
                args.rom_addr = usize::from_str_radix(trimmed, 16).map_err(|_| EmuError::BadArgs(format!("invalid -x value: {raw_val}")))?;
            }
            other => return Err(EmuError::BadArgs(format!("unrecognized flag: {other}"))),
        }
    }
    Ok(Some(args))
}

fn run() -> Result<(), EmuError> {
    env_logger::init();

    let Some(args) = parse_args()? else {
        return Ok(());
    };

    let config = MachineConfig {
        bios_rom: args.rom.map(|path| (path, args.rom_addr)),
        floppy_a: args.floppy_a.map(|path| (path, args.spt_override)),
        floppy_b: args.floppy_b.map(|path| (path, args.spt_override)),
        hard_disk: args.hard_disk,
        uart_tty: args.uart_tty,
        fsproto_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    let mut machine = Machine::new(config)?;
    loop {
        machine.step();
        if let Some(brk) = machine.pending_break() {
            log::error!("{brk}");
            break;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("pcxt: {err}");
            ExitCode::FAILURE
        }
    }
}
