use crate::bus::RegisterBus;
use crate::registers::{BitAddress, DwordAddress};
use crate::s7::S7Connection;
use anyhow::{anyhow, Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Register client for the real CPU.
///
/// The connection is opened lazily and dropped after any failed
/// exchange, so the next access reconnects.
pub struct PlcClient {
    host: String,
    port: u16,
    rack: u8,
    slot: u8,
    conn: Mutex<Option<S7Connection>>,
}

impl PlcClient {
    pub fn new(host: impl Into<String>, port: u16, rack: u8, slot: u8) -> PlcClient {
        PlcClient {
            host: host.into(),
            port,
            rack,
            slot,
            conn: Mutex::new(None),
        }
    }

    /// Opens the session now instead of on first access.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        self.ensure(&mut guard).await.map(|_| ())
    }

    pub async fn disconnect(&self) {
        if self.conn.lock().await.take().is_some() {
            info!(host = %self.host, "disconnected from PLC");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn ensure<'a>(&self, slot: &'a mut Option<S7Connection>) -> Result<&'a mut S7Connection> {
        if slot.is_none() {
            let conn = S7Connection::connect(&self.host, self.port, self.rack, self.slot)
                .await
                .with_context(|| format!("PLC {}:{} unreachable", self.host, self.port))?;
            info!(
                host = %self.host,
                rack = self.rack,
                slot = self.slot,
                pdu = conn.pdu_size(),
                "connected to PLC"
            );
            *slot = Some(conn);
        }
        slot.as_mut().ok_or_else(|| anyhow!("PLC connection missing"))
    }

    fn on_failure<T>(slot: &mut Option<S7Connection>, res: &Result<T>) {
        if let Err(e) = res {
            warn!("dropping PLC connection: {:#}", e);
            *slot = None;
        }
    }
}

impl RegisterBus for PlcClient {
    async fn read_bit(&self, addr: BitAddress) -> Result<bool> {
        let mut guard = self.conn.lock().await;
        let res = self.ensure(&mut guard).await?.read_bit(addr).await;
        Self::on_failure(&mut guard, &res);
        debug!(%addr, value = ?res.as_ref().ok(), "read bit");
        res.with_context(|| format!("reading {addr}"))
    }

    async fn write_bit(&self, addr: BitAddress, value: bool) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let res = self.ensure(&mut guard).await?.write_bit(addr, value).await;
        Self::on_failure(&mut guard, &res);
        debug!(%addr, value, "write bit");
        res.with_context(|| format!("writing {addr}"))
    }

    async fn read_dword(&self, addr: DwordAddress) -> Result<u32> {
        let mut guard = self.conn.lock().await;
        let res = self.ensure(&mut guard).await?.read_dword(addr).await;
        Self::on_failure(&mut guard, &res);
        res.with_context(|| format!("reading {addr}"))
    }
}
