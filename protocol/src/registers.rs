use std::fmt;

/// A single bit inside a PLC data block (`DB<db>.DBX<byte>.<bit>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitAddress {
    pub db: u16,
    pub byte: u16,
    pub bit: u8,
}

impl BitAddress {
    pub const fn new(db: u16, byte: u16, bit: u8) -> Self {
        BitAddress { db, byte, bit }
    }
}

impl fmt::Display for BitAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DB{}.DBX{}.{}", self.db, self.byte, self.bit)
    }
}

/// A 32-bit word inside a PLC data block (`DB<db>.DBD<byte>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DwordAddress {
    pub db: u16,
    pub byte: u16,
}

impl DwordAddress {
    pub const fn new(db: u16, byte: u16) -> Self {
        DwordAddress { db, byte }
    }
}

impl fmt::Display for DwordAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DB{}.DBD{}", self.db, self.byte)
    }
}

// --- Actuator blocks ---
const DB_B1: u16 = 500;
const DB_B2: u16 = 501;
const DB_EV1: u16 = 300;
const DB_EV2: u16 = 301;
const DB_TH: u16 = 503;
const DB_TV: u16 = 504;

const PUMP_BYTE: u16 = 12;
const VALVE_BYTE: u16 = 10;
const DOOR_BYTE: u16 = 12;

/// Control bits of a door drive: manual, run, invert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorBits {
    pub manual: BitAddress,
    pub run: BitAddress,
    pub invert: BitAddress,
}

impl DoorBits {
    pub const fn at(db: u16) -> Self {
        DoorBits {
            manual: BitAddress::new(db, DOOR_BYTE, 0),
            run: BitAddress::new(db, DOOR_BYTE, 1),
            invert: BitAddress::new(db, DOOR_BYTE, 2),
        }
    }
}

pub const DOOR_HORIZONTAL: DoorBits = DoorBits::at(DB_TH);
pub const DOOR_VERTICAL: DoorBits = DoorBits::at(DB_TV);

/// The 14 actuator bits in decoding order:
/// B1 (manual, run), B2 (manual, run), EV1 (manual, run, stop),
/// EV2 (manual, run, stop), TH (manual, run), TV (manual, run).
pub const ACTUATOR_BITS: [BitAddress; 14] = [
    BitAddress::new(DB_B1, PUMP_BYTE, 0),
    BitAddress::new(DB_B1, PUMP_BYTE, 1),
    BitAddress::new(DB_B2, PUMP_BYTE, 0),
    BitAddress::new(DB_B2, PUMP_BYTE, 1),
    BitAddress::new(DB_EV1, VALVE_BYTE, 0),
    BitAddress::new(DB_EV1, VALVE_BYTE, 1),
    BitAddress::new(DB_EV1, VALVE_BYTE, 2),
    BitAddress::new(DB_EV2, VALVE_BYTE, 0),
    BitAddress::new(DB_EV2, VALVE_BYTE, 1),
    BitAddress::new(DB_EV2, VALVE_BYTE, 2),
    BitAddress::new(DB_TH, DOOR_BYTE, 0),
    BitAddress::new(DB_TH, DOOR_BYTE, 1),
    BitAddress::new(DB_TV, DOOR_BYTE, 0),
    BitAddress::new(DB_TV, DOOR_BYTE, 1),
];

// --- Horizontal door end-stops ---
pub const TH_OPEN_END_STOP: BitAddress = BitAddress::new(10, 0, 0);
pub const TH_CLOSED_END_STOP: BitAddress = BitAddress::new(10, 0, 1);

// --- Weather alarms ---
pub const RAIN_ALARM: BitAddress = BitAddress::new(808, 160, 2);
pub const WIND_ALARM: BitAddress = BitAddress::new(808, 42, 2);

// --- Weekly switch times (ms since midnight) ---
const DB_SWITCH_TIMES: u16 = 80;
const DB_REST_TIMES: u16 = 83;
const SWITCH_TIMES_BASE: u16 = 62;
const SWITCH_TIMES_STRIDE: u16 = 8;

/// Switch-time words for one working day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaySwitchAddresses {
    pub heat_from: DwordAddress,
    pub heat_until: DwordAddress,
    pub rest_until: DwordAddress,
}

/// Switch-time words for `weekday` (0 = Monday .. 4 = Friday).
/// Returns `None` for the weekend, which has no configured times.
pub fn day_switch_addresses(weekday: u32) -> Option<DaySwitchAddresses> {
    if weekday > 4 {
        return None;
    }
    let base = SWITCH_TIMES_BASE + SWITCH_TIMES_STRIDE * weekday as u16;
    Some(DaySwitchAddresses {
        heat_from: DwordAddress::new(DB_SWITCH_TIMES, base),
        heat_until: DwordAddress::new(DB_SWITCH_TIMES, base + 4),
        rest_until: DwordAddress::new(DB_REST_TIMES, base),
    })
}
