/*!
cga.rs - CGA video buffer ports (`spec.md` §4.1, §6). The actual screen
surface lives in main memory at 0xB8000 and is read directly by an
external front-end; this module only answers the small set of status/
mode/CRTC-index ports software polls. Retrace timing is not modeled:
the status port's retrace bits toggle every read so polling loops make
visible progress instead of spinning forever.
*/

const PORT_STATUS: u16 = 0x3DA;
const PORT_MODE: u16 = 0x3D8;
const PORT_CRTC_SELECT: u16 = 0x3D4;
const PORT_CRTC_DATA: u16 = 0x3D5;

const STATUS_VERTICAL_RETRACE: u8 = 0x08;
const STATUS_DISPLAY_ENABLE: u8 = 0x01;

const CRTC_CURSOR_HIGH: u8 = 0x0E;
const CRTC_CURSOR_LOW: u8 = 0x0F;
const CRTC_REGISTER_COUNT: usize = 18;

pub struct Cga {
    mode: u8,
    crtc_index: u8,
    crtc: [u8; CRTC_REGISTER_COUNT],
    retrace_phase: bool,
}

impl Cga {
    pub fn new() -> Self {
        Self {
            mode: 0,
            crtc_index: 0,
            crtc: [0; CRTC_REGISTER_COUNT],
            retrace_phase: false,
        }
    }

    pub fn columns(&self) -> u32 {
        if self.mode & 0x01 != 0 {
            80
        } else {
            40
        }
    }

    pub fn cursor_position(&self) -> u16 {
        ((self.crtc[CRTC_CURSOR_HIGH as usize] as u16) << 8) | self.crtc[CRTC_CURSOR_LOW as usize] as u16
    }

    pub fn io_read(&mut self, port: u16) -> u8 {
        match port {
            PORT_STATUS => {
                self.retrace_phase = !self.retrace_phase;
                if self.retrace_phase {
                    STATUS_VERTICAL_RETRACE
                } else {
                    STATUS_DISPLAY_ENABLE
                }
            }
            PORT_MODE => self.mode,
            PORT_CRTC_DATA => self.crtc.get(self.crtc_index as usize).copied().unwrap_or(0),
            _ => 0xFF,
        }
    }

    pub fn io_write(&mut self, port: u16, value: u8) {
        match port {
            PORT_MODE => self.mode = value,
            PORT_CRTC_SELECT => self.crtc_index = value,
            PORT_CRTC_DATA => {
                if let Some(slot) = self.crtc.get_mut(self.crtc_index as usize) {
                    *slot = value;
                }
            }
            _ => {}
        }
    }
}

impl Default for Cga {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_position_combines_crtc_high_low_registers() {
        let mut cga = Cga::new();
        cga.io_write(PORT_CRTC_SELECT, CRTC_CURSOR_HIGH);
        cga.io_write(PORT_CRTC_DATA, 0x01);
        cga.io_write(PORT_CRTC_SELECT, CRTC_CURSOR_LOW);
        cga.io_write(PORT_CRTC_DATA, 0x2C);
        assert_eq!(cga.cursor_position(), 0x012C);
    }

    #[test]
    fn status_port_toggles_retrace_bit_each_read() {
        let mut cga = Cga::new();
        let a = cga.io_read(PORT_STATUS);
        let b = cga.io_read(PORT_STATUS);
        assert_ne!(a, b);
    }
}
