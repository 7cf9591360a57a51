use crate::bus::RegisterBus;
use crate::registers::{
    BitAddress, DwordAddress, DOOR_HORIZONTAL, TH_CLOSED_END_STOP, TH_OPEN_END_STOP,
};
use anyhow::{bail, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Writes kept for inspection; older ones are dropped first.
pub const WRITE_LOG_CAP: usize = 4096;

#[derive(Default)]
struct Memory {
    bits: HashMap<BitAddress, bool>,
    dwords: HashMap<DwordAddress, u32>,
    writes: VecDeque<(BitAddress, bool)>,
    offline: bool,
}

/// In-process PLC memory. Unset addresses read as zero.
///
/// With door mechanics enabled, driving the horizontal door moves it to
/// the matching end-stop immediately, which is enough for bench runs.
#[derive(Default)]
pub struct MemoryBus {
    memory: Mutex<Memory>,
    door_mechanics: bool,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }

    pub fn with_door_mechanics() -> MemoryBus {
        MemoryBus {
            door_mechanics: true,
            ..MemoryBus::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Memory> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_bit(&self, addr: BitAddress, value: bool) {
        self.lock().bits.insert(addr, value);
    }

    pub fn bit(&self, addr: BitAddress) -> bool {
        self.lock().bits.get(&addr).copied().unwrap_or(false)
    }

    pub fn set_dword(&self, addr: DwordAddress, value: u32) {
        self.lock().dwords.insert(addr, value);
    }

    /// The last [`WRITE_LOG_CAP`] writes, oldest first.
    pub fn writes(&self) -> Vec<(BitAddress, bool)> {
        self.lock().writes.iter().copied().collect()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Makes every access fail, as an unreachable CPU would.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    fn move_door(memory: &mut Memory) {
        let get = |a: BitAddress| memory.bits.get(&a).copied().unwrap_or(false);
        let (manual, run, invert) = (
            get(DOOR_HORIZONTAL.manual),
            get(DOOR_HORIZONTAL.run),
            get(DOOR_HORIZONTAL.invert),
        );
        let position = match (manual, run, invert) {
            (true, true, false) => Some((true, false)),
            (true, false, true) => Some((false, true)),
            _ => None,
        };
        if let Some((open, closed)) = position {
            memory.bits.insert(TH_OPEN_END_STOP, open);
            memory.bits.insert(TH_CLOSED_END_STOP, closed);
        }
    }
}

impl RegisterBus for MemoryBus {
    async fn read_bit(&self, addr: BitAddress) -> Result<bool> {
        let memory = self.lock();
        if memory.offline {
            bail!("PLC offline reading {addr}");
        }
        Ok(memory.bits.get(&addr).copied().unwrap_or(false))
    }

    async fn write_bit(&self, addr: BitAddress, value: bool) -> Result<()> {
        let mut memory = self.lock();
        if memory.offline {
            bail!("PLC offline writing {addr}");
        }
        memory.bits.insert(addr, value);
        if memory.writes.len() == WRITE_LOG_CAP {
            memory.writes.pop_front();
        }
        memory.writes.push_back((addr, value));
        if self.door_mechanics && addr.db == DOOR_HORIZONTAL.manual.db {
            Self::move_door(&mut memory);
        }
        Ok(())
    }

    async fn read_dword(&self, addr: DwordAddress) -> Result<u32> {
        let memory = self.lock();
        if memory.offline {
            bail!("PLC offline reading {addr}");
        }
        Ok(memory.dwords.get(&addr).copied().unwrap_or(0))
    }
}
