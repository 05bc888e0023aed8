//! Register map and decoding for the energy meter
//!
//! Every value is an IEEE-754 single-precision float spread over two consecutive
//! input registers. The first register of a pair holds the low 16 bits, the second
//! one the high 16 bits:
//!
//! ```text
//! word[offset]     -> bits 0..16
//! word[offset + 1] -> bits 16..32
//! ```

use crate::error::{AgentError, Result};
use serde::Serialize;

/// Number of words the meter map spans, starting at the configured base address.
pub const REGISTER_BLOCK_LEN: u16 = 64;

/// Raw words from one "read input registers" request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock {
    words: Vec<u16>,
}

impl RegisterBlock {
    pub fn new(words: Vec<u16>) -> Self {
        Self { words }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[cfg(test)]
    pub fn words(&self) -> &[u16] {
        &self.words
    }
}

/// Combine a (low, high) word pair into the float whose bits they carry.
pub fn pair_to_f32(low: u16, high: u16) -> f32 {
    f32::from_bits(((high as u32) << 16) | low as u32)
}

macro_rules! register_map {
    ($($field:ident => $offset:expr),+ $(,)?) => {
        /// One decoded meter poll
        #[derive(Debug, Clone, Copy, PartialEq, Serialize)]
        pub struct EnergyReading {
            $(pub $field: f32,)+
        }

        /// (field name, register-pair offset) in map order
        pub const REGISTER_MAP: &[(&str, usize)] = &[$((stringify!($field), $offset),)+];

        /// Decode a register block into named readings.
        pub fn decode(block: &RegisterBlock) -> Result<EnergyReading> {
            let required = REGISTER_MAP
                .iter()
                .map(|(_, offset)| offset + 2)
                .max()
                .unwrap_or(0);
            if block.len() < required {
                return Err(AgentError::Parse(format!(
                    "register block has {} words, map needs {}",
                    block.len(),
                    required
                )));
            }

            Ok(EnergyReading {
                $($field: pair_to_f32(block.words[$offset], block.words[$offset + 1]),)+
            })
        }
    };
}

register_map! {
    voltage_l1 => 0,
    voltage_l2 => 2,
    voltage_l3 => 4,
    current_l1 => 6,
    current_l2 => 8,
    current_l3 => 10,
    active_power_l1 => 24,
    active_power_l2 => 26,
    active_power_l3 => 28,
    active_power_total => 30,
    apparent_power_l1 => 32,
    apparent_power_l2 => 34,
    apparent_power_l3 => 36,
    apparent_power_total => 38,
    reactive_power_l1 => 40,
    reactive_power_l2 => 42,
    reactive_power_l3 => 44,
    reactive_power_total => 46,
    power_factor_l1 => 48,
    power_factor_l2 => 50,
    power_factor_l3 => 52,
    frequency => 56,
    import_active_energy => 58,
    export_active_energy => 60,
    reactive_energy_total => 62,
}
