//! Decoding of the 14 actuator bits into a plant-wide state.

use serde::Serialize;
use std::fmt;

pub const ACTUATOR_BIT_COUNT: usize = 14;
pub type ActuatorBits = [bool; ACTUATOR_BIT_COUNT];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActuatorSymbol {
    Automatic,
    ManualStop,
    ManualRun,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SystemState {
    ColdMode1,
    ColdMode2,
    HeatMode1,
    HeatMode2,
    AutomaticMode,
    Parada,
    Unknown,
}

impl SystemState {
    pub fn is_cold(self) -> bool {
        matches!(self, SystemState::ColdMode1 | SystemState::ColdMode2)
    }

    pub fn is_heat(self) -> bool {
        matches!(self, SystemState::HeatMode1 | SystemState::HeatMode2)
    }

    /// Simple operating mode; anything unrecognised reads as stopped.
    pub fn simple_mode(self) -> &'static str {
        match self {
            SystemState::HeatMode1 | SystemState::HeatMode2 => "hot",
            SystemState::ColdMode1 | SystemState::ColdMode2 => "cold",
            SystemState::AutomaticMode => "automatic",
            SystemState::Parada | SystemState::Unknown => "parada",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Symbols in actuator order: B1, B2, EV1, EV2, TH, TV.
pub type ActuatorSymbols = [ActuatorSymbol; 6];

fn two_bit(manual: bool, run: bool) -> ActuatorSymbol {
    match (manual, run) {
        (true, true) => ActuatorSymbol::ManualRun,
        (true, false) => ActuatorSymbol::ManualStop,
        (false, false) => ActuatorSymbol::Automatic,
        (false, true) => ActuatorSymbol::Undefined,
    }
}

fn three_bit(manual: bool, run: bool, stop: bool) -> ActuatorSymbol {
    match (manual, run, stop) {
        (true, true, false) => ActuatorSymbol::ManualRun,
        (true, false, true) => ActuatorSymbol::ManualStop,
        (false, false, false) => ActuatorSymbol::Automatic,
        _ => ActuatorSymbol::Undefined,
    }
}

use ActuatorSymbol::{Automatic as A, ManualRun as MM, ManualStop as MP};

const STATE_TABLE: [(ActuatorSymbols, SystemState); 8] = [
    ([A, MM, MM, MP, MM, MM], SystemState::ColdMode1),
    ([MM, MM, MM, MP, MM, MM], SystemState::ColdMode2),
    ([A, MM, MM, MP, MP, MP], SystemState::ColdMode1),
    ([MM, MM, MM, MP, MP, MP], SystemState::ColdMode2),
    ([A, MP, MP, MM, MP, MP], SystemState::HeatMode1),
    ([MM, MP, MP, MM, MP, MP], SystemState::HeatMode2),
    ([A, A, A, A, A, A], SystemState::AutomaticMode),
    ([MP, MP, MP, MM, MP, MP], SystemState::Parada),
];

pub fn symbols(bits: &ActuatorBits) -> ActuatorSymbols {
    [
        two_bit(bits[0], bits[1]),
        two_bit(bits[2], bits[3]),
        three_bit(bits[4], bits[5], bits[6]),
        three_bit(bits[7], bits[8], bits[9]),
        two_bit(bits[10], bits[11]),
        two_bit(bits[12], bits[13]),
    ]
}

pub fn lookup(symbols: &ActuatorSymbols) -> SystemState {
    STATE_TABLE
        .iter()
        .find(|(pattern, _)| pattern == symbols)
        .map(|(_, state)| *state)
        .unwrap_or(SystemState::Unknown)
}

/// Total over all 2^14 inputs.
pub fn decode(bits: &ActuatorBits) -> (SystemState, ActuatorSymbols) {
    let symbols = symbols(bits);
    (lookup(&symbols), symbols)
}

/// Builds the bit array from a slice read off the bus.
pub fn bits_from_slice(raw: &[bool]) -> Option<ActuatorBits> {
    raw.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bits_of(n: u16) -> ActuatorBits {
        std::array::from_fn(|i| n & (1 << i) != 0)
    }

    fn encode(sym: ActuatorSymbol, three: bool) -> Vec<bool> {
        match (sym, three) {
            (MM, false) => vec![true, true],
            (MP, false) => vec![true, false],
            (A, false) => vec![false, false],
            (MM, true) => vec![true, true, false],
            (MP, true) => vec![true, false, true],
            (A, true) => vec![false, false, false],
            _ => unreachable!(),
        }
    }

    fn encode_all(symbols: &ActuatorSymbols) -> ActuatorBits {
        let mut raw = vec![];
        for (i, s) in symbols.iter().enumerate() {
            raw.extend(encode(*s, i == 2 || i == 3));
        }
        bits_from_slice(&raw).unwrap()
    }

    #[test]
    fn every_table_entry_decodes_to_its_state() {
        for (pattern, state) in STATE_TABLE {
            let (decoded, syms) = decode(&encode_all(&pattern));
            assert_eq!(decoded, state);
            assert_eq!(syms, pattern);
        }
    }

    #[test]
    fn all_inputs_decode() {
        let mut matched = 0;
        for n in 0..(1u16 << 14) {
            let bits = bits_of(n);
            let (state, syms) = decode(&bits);
            let in_table = STATE_TABLE.iter().any(|(p, _)| *p == syms);
            if in_table {
                matched += 1;
            } else {
                assert_eq!(state, SystemState::Unknown);
            }
        }
        assert_eq!(matched, STATE_TABLE.len());
    }

    #[test]
    fn undefined_codes() {
        assert_eq!(two_bit(false, true), ActuatorSymbol::Undefined);
        assert_eq!(three_bit(true, true, true), ActuatorSymbol::Undefined);
        assert_eq!(three_bit(false, false, true), ActuatorSymbol::Undefined);
        assert_eq!(three_bit(false, true, false), ActuatorSymbol::Undefined);

        let mut bits = [false; ACTUATOR_BIT_COUNT];
        bits[1] = true;
        let (state, syms) = decode(&bits);
        assert_eq!(state, SystemState::Unknown);
        assert_eq!(syms[0], ActuatorSymbol::Undefined);
    }

    #[test]
    fn all_clear_is_automatic() {
        let (state, _) = decode(&[false; ACTUATOR_BIT_COUNT]);
        assert_eq!(state, SystemState::AutomaticMode);
        assert_eq!(state.simple_mode(), "automatic");
        assert_eq!(SystemState::Unknown.simple_mode(), "parada");
        assert_eq!(SystemState::HeatMode2.simple_mode(), "hot");
    }

    #[test]
    fn slice_length_must_match() {
        assert!(bits_from_slice(&[true; 13]).is_none());
        assert!(bits_from_slice(&[true; 14]).is_some());
    }

    proptest! {
        #[test]
        fn undefined_symbol_means_unknown(n in 0u16..(1 << 14)) {
            let (state, syms) = decode(&bits_of(n));
            if syms.contains(&ActuatorSymbol::Undefined) {
                prop_assert_eq!(state, SystemState::Unknown);
            }
        }
    }
}
