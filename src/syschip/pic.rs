/*!
pic.rs - The interrupt-mask/pending half of the system chip (`spec.md`
§4.3 "Interrupt controller").

Each of the 8 IRQ lines has one mask bit and one pending flag. A line
raised while masked stays pending rather than being dropped, so unmasking
it later still delivers the interrupt - this mirrors the combined
fe2010/i8088 retry behavior in the original source rather than a real
8259's in-service/priority logic, which this system chip does not model.

Mask polarity: bit N of `irq_mask` set means IRQ line N is *enabled*
(`fe2010_irq()`'s `if (fe2010->irq_mask >> irq_no)` test). A line is
masked/disabled when its bit is clear, which is also the zero-initialized
reset state - matching real hardware where a BIOS must explicitly set a
bit to enable that IRQ.
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pic {
    pub irq_mask: u8,
    pub nmi_mask: u8,
    pub pending: [bool; 8],
}

impl Pic {
    pub fn new() -> Self {
        Self {
            irq_mask: 0,
            nmi_mask: 0,
            pending: [false; 8],
        }
    }

    pub fn is_masked(&self, irq_no: u8) -> bool {
        (self.irq_mask >> irq_no) & 1 == 0
    }

    /// Marks a line pending. The scheduler drains pending lines into the
    /// CPU via `Cpu::irq`; a line stays pending until that call succeeds
    /// (CPU interrupts enabled).
    pub fn raise(&mut self, irq_no: u8) {
        if !self.is_masked(irq_no) {
            self.pending[irq_no as usize] = true;
        }
    }

    pub fn take_pending(&mut self) -> Vec<u8> {
        let mut lines = Vec::new();
        for (i, p) in self.pending.iter().enumerate() {
            if *p {
                lines.push(i as u8);
            }
        }
        lines
    }

    pub fn clear_pending(&mut self, irq_no: u8) {
        self.pending[irq_no as usize] = false;
    }
}

impl Default for Pic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_line_does_not_become_pending() {
        // reset state: irq_mask is all zero bits, i.e. every line masked.
        let mut pic = Pic::new();
        pic.raise(6);
        assert!(!pic.pending[6]);
    }

    #[test]
    fn unmasked_line_stays_pending_until_cleared() {
        let mut pic = Pic::new();
        pic.irq_mask = 1 << 0;
        pic.raise(0);
        assert_eq!(pic.take_pending(), vec![0]);
        pic.clear_pending(0);
        assert!(pic.take_pending().is_empty());
    }
}
