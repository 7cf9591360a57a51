use crate::registers::{BitAddress, DwordAddress};
use anyhow::Result;
use std::future::Future;

/// Bit/word access to the PLC memory, shared by every controller component.
///
/// Implemented by [`crate::client::PlcClient`] for the real CPU and by
/// [`crate::memory::MemoryBus`] for bench runs and tests.
pub trait RegisterBus: Send + Sync + 'static {
    fn read_bit(&self, addr: BitAddress) -> impl Future<Output = Result<bool>> + Send;

    fn write_bit(&self, addr: BitAddress, value: bool) -> impl Future<Output = Result<()>> + Send;

    fn read_dword(&self, addr: DwordAddress) -> impl Future<Output = Result<u32>> + Send;

    /// Reads `addrs` in order.
    fn read_bits(&self, addrs: &[BitAddress]) -> impl Future<Output = Result<Vec<bool>>> + Send {
        async move {
            let mut bits = Vec::with_capacity(addrs.len());
            for &addr in addrs {
                bits.push(self.read_bit(addr).await?);
            }
            Ok(bits)
        }
    }

    /// Writes `(address, value)` pairs in order, stopping at the first failure.
    fn write_bits(&self, writes: &[(BitAddress, bool)]) -> impl Future<Output = Result<()>> + Send {
        async move {
            for &(addr, value) in writes {
                self.write_bit(addr, value).await?;
            }
            Ok(())
        }
    }
}
