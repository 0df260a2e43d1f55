/*!
addressing.rs - ModR/M decode and effective-address computation (`spec.md`
§4.2 step 3).

The `mod` field selects register-direct or a displacement size (0/8/16
bits); the `r/m` field selects a base+index combination, or - the special
case `mod=00, r/m=110` - a 16-bit direct address. BP-based combinations
default to the stack segment; everything else defaults to the data
segment; a segment-override prefix replaces the default.
*/

use super::regs::SegOverride;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub raw: u8,
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub fn decode(byte: u8) -> Self {
        Self {
            raw: byte,
            md: (byte >> 6) & 0b11,
            reg: (byte >> 3) & 0b111,
            rm: byte & 0b111,
        }
    }

    pub fn is_register_direct(&self) -> bool {
        self.md == 0b11
    }
}

/// Resolved memory operand: default segment plus 16-bit offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub default_seg: DefaultSeg,
    pub offset: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultSeg {
    Ds,
    Ss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmOperand {
    Reg(u8),
    Mem(MemOperand),
}

/// Base+index table indexed by `r/m` for `mod` in {00,01,10}; the
/// `mod=00, r/m=110` direct-address exception is handled by the caller.
fn base_index(rm: u8, bx: u16, bp: u16, si: u16, di: u16) -> (u16, DefaultSeg) {
    match rm {
        0 => (bx.wrapping_add(si), DefaultSeg::Ds),
        1 => (bx.wrapping_add(di), DefaultSeg::Ds),
        2 => (bp.wrapping_add(si), DefaultSeg::Ss),
        3 => (bp.wrapping_add(di), DefaultSeg::Ss),
        4 => (si, DefaultSeg::Ds),
        5 => (di, DefaultSeg::Ds),
        6 => (bp, DefaultSeg::Ss),
        7 => (bx, DefaultSeg::Ds),
        _ => unreachable!("r/m is 3 bits"),
    }
}

/// A single fetch cursor for trailing displacement bytes: `word` selects
/// whether one or two bytes are consumed. Folded into one closure (rather
/// than separate `fetch_u8`/`fetch_u16` callbacks) so callers only need to
/// hand over one mutable borrow of the CPU's fetch state, not two at once.
pub trait DispFetch {
    fn fetch(&mut self, word: bool) -> u16;
}

impl<F: FnMut(bool) -> u16> DispFetch for F {
    fn fetch(&mut self, word: bool) -> u16 {
        self(word)
    }
}

/// Computes the `RmOperand` for a ModR/M byte given a fetch cursor for any
/// trailing displacement bytes. `fetch` is expected to advance IP as a side
/// effect (it wraps the CPU's own fetch helpers).
pub fn decode_rm(
    modrm: ModRm,
    bx: u16,
    bp: u16,
    si: u16,
    di: u16,
    mut fetch: impl DispFetch,
) -> RmOperand {
    if modrm.is_register_direct() {
        return RmOperand::Reg(modrm.rm);
    }
    if modrm.md == 0b00 && modrm.rm == 0b110 {
        let disp = fetch.fetch(true);
        return RmOperand::Mem(MemOperand {
            default_seg: DefaultSeg::Ds,
            offset: disp,
        });
    }
    let (base, default_seg) = base_index(modrm.rm, bx, bp, si, di);
    let offset = match modrm.md {
        0b00 => base,
        0b01 => {
            let disp = fetch.fetch(false) as u8 as i8 as i16;
            base.wrapping_add(disp as u16)
        }
        0b10 => {
            let disp = fetch.fetch(true) as i16;
            base.wrapping_add(disp as u16)
        }
        _ => unreachable!("register-direct handled above"),
    };
    RmOperand::Mem(MemOperand { default_seg, offset })
}

/// Resolves a `DefaultSeg` plus any active override prefix to the actual
/// segment register selector to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegSelector {
    Cs,
    Ds,
    Es,
    Ss,
}

pub fn resolve_segment(default_seg: DefaultSeg, override_: SegOverride) -> SegSelector {
    match override_ {
        SegOverride::Cs => SegSelector::Cs,
        SegOverride::Ds => SegSelector::Ds,
        SegOverride::Es => SegSelector::Es,
        SegOverride::Ss => SegSelector::Ss,
        SegOverride::None => match default_seg {
            DefaultSeg::Ds => SegSelector::Ds,
            DefaultSeg::Ss => SegSelector::Ss,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bp_based_rm_defaults_to_stack_segment() {
        let modrm = ModRm::decode(0b00_000_010); // mod=00 r/m=010 -> [BP+SI]
        let op = decode_rm(modrm, 0, 0x10, 0x20, 0, |_| 0);
        match op {
            RmOperand::Mem(m) => assert_eq!(m.default_seg, DefaultSeg::Ss),
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn non_bp_rm_defaults_to_data_segment() {
        let modrm = ModRm::decode(0b00_000_000); // [BX+SI]
        let op = decode_rm(modrm, 0x10, 0, 0x20, 0, |_| 0);
        match op {
            RmOperand::Mem(m) => assert_eq!(m.default_seg, DefaultSeg::Ds),
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn mod00_rm110_is_direct_address() {
        let modrm = ModRm::decode(0b00_000_110);
        let op = decode_rm(modrm, 0, 0, 0, 0, |_| 0x1234);
        match op {
            RmOperand::Mem(m) => assert_eq!(m.offset, 0x1234),
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn register_direct_mode_skips_displacement_fetch() {
        let modrm = ModRm::decode(0b11_000_011);
        let op = decode_rm(modrm, 0, 0, 0, 0, |_| panic!("should not fetch"));
        assert_eq!(op, RmOperand::Reg(3));
    }
}
