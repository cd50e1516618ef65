//! The simulated device and its command set.

/// Opcode at payload byte 0 of a 0x73 command.
const OP_POWER: u8 = 0x0D;
const OP_BRIGHTNESS: u8 = 0x0E;
const OP_COLOR_TEMP: u8 = 0x0F;
const OP_RGB: u8 = 0x10;

/// What a simulated bulb remembers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceState {
    pub on: bool,
    pub brightness: u8,
    pub color_temp: u8,
    pub rgb: (u8, u8, u8),
    /// How many power transitions the device has seen.
    pub toggle_count: u64,
}

impl DeviceState {
    /// Apply one decoded 0x73 payload. Returns whether the opcode was
    /// recognized; unknown opcodes leave the state untouched.
    pub fn apply_command(&mut self, payload: &[u8]) -> bool {
        match payload {
            [OP_POWER, value, ..] => {
                let on = *value != 0;
                if on != self.on {
                    self.on = on;
                    self.toggle_count += 1;
                }
                true
            }
            [OP_BRIGHTNESS, value, ..] => {
                self.brightness = (*value).min(100);
                true
            }
            [OP_COLOR_TEMP, value, ..] => {
                self.color_temp = *value;
                true
            }
            [OP_RGB, r, g, b, ..] => {
                self.rgb = (*r, *g, *b);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_commands_toggle_and_count() {
        let mut state = DeviceState::default();
        assert!(state.apply_command(&[0x0D, 0x01, 0x00]));
        assert!(state.on);
        assert_eq!(state.toggle_count, 1);

        // same value again is not a transition
        state.apply_command(&[0x0D, 0x01, 0x00]);
        assert_eq!(state.toggle_count, 1);

        state.apply_command(&[0x0D, 0x00, 0x00]);
        assert!(!state.on);
        assert_eq!(state.toggle_count, 2);
    }

    #[test]
    fn brightness_saturates_at_one_hundred() {
        let mut state = DeviceState::default();
        state.apply_command(&[0x0E, 250]);
        assert_eq!(state.brightness, 100);
        state.apply_command(&[0x0E, 42]);
        assert_eq!(state.brightness, 42);
    }

    #[test]
    fn rgb_and_color_temp() {
        let mut state = DeviceState::default();
        assert!(state.apply_command(&[0x10, 10, 20, 30]));
        assert_eq!(state.rgb, (10, 20, 30));
        assert!(state.apply_command(&[0x0F, 77]));
        assert_eq!(state.color_temp, 77);
    }

    #[test]
    fn unknown_opcodes_are_ignored() {
        let mut state = DeviceState::default();
        assert!(!state.apply_command(&[0x99, 1, 2]));
        assert!(!state.apply_command(&[]));
        assert_eq!(state, DeviceState::default());
    }
}
