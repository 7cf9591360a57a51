//! PLC access for the thermal storage controller: S7 wire codec,
//! register map and the bus abstraction the controller talks through.

pub mod bus;
pub mod client;
pub mod memory;
pub mod registers;
pub mod s7;

pub use bus::RegisterBus;
pub use client::PlcClient;
pub use memory::MemoryBus;
