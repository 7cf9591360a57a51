//! Minimal S7comm client over ISO-on-TCP (RFC 1006).
//!
//! Frame layout of every message:
//! ```text
//! +-------------+---------------+----------------------------------+
//! | TPKT (4B)   | COTP (var.)   | S7 header | parameters | data    |
//! | 03 00 len   | len type ...  | 10B (job) / 12B (ack data)       |
//! +-------------+---------------+----------------------------------+
//! ```
//! Only what the controller needs is implemented: connection setup,
//! single-item bit reads/writes and 4-byte reads from data blocks.

use crate::registers::{BitAddress, DwordAddress};
use anyhow::{bail, Context, Result};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TPKT_VERSION: u8 = 0x03;
const TPKT_HEADER_SZ: usize = 4;
const MAX_FRAME_SIZE: usize = 4096;

const COTP_CONNECT_REQUEST: u8 = 0xE0;
const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const COTP_DATA: u8 = 0xF0;
const COTP_LAST_UNIT: u8 = 0x80;
const COTP_TPDU_SIZE_1024: u8 = 0x0A;

const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;
const S7_JOB_HEADER_SZ: usize = 10;
const S7_ACK_HEADER_SZ: usize = 12;

const FN_SETUP_COMMUNICATION: u8 = 0xF0;
const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;

const AREA_DB: u8 = 0x84;
const ITEM_SPEC: u8 = 0x12;
const ITEM_SPEC_LEN: u8 = 0x0A;
const ITEM_SYNTAX_ANY: u8 = 0x10;

// Transport sizes used in request items.
const REQ_BIT: u8 = 0x01;
const REQ_BYTE: u8 = 0x02;
// Transport sizes used in data sections.
const DATA_BIT: u8 = 0x03;
const DATA_BYTE: u8 = 0x04;
const DATA_INT: u8 = 0x05;

const ITEM_OK: u8 = 0xFF;
const LOCAL_TSAP: u16 = 0x0100;

pub const DEFAULT_PORT: u16 = 102;
pub const REQUESTED_PDU_SIZE: u16 = 480;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum S7Error {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),
    #[error("bad TPKT version {0:#04x}")]
    BadTpkt(u8),
    #[error("frame length {0} out of range")]
    BadLength(usize),
    #[error("unexpected COTP PDU type {0:#04x}")]
    UnexpectedCotp(u8),
    #[error("bad S7 protocol id {0:#04x}")]
    BadProtocolId(u8),
    #[error("unexpected S7 message type {0:#04x}")]
    UnexpectedMessage(u8),
    #[error("PLC rejected job: class {class:#04x} code {code:#04x}")]
    Rejected { class: u8, code: u8 },
    #[error("unexpected function {0:#04x} in response")]
    UnexpectedFunction(u8),
    #[error("item access failed with return code {0:#04x}")]
    ItemFailed(u8),
}

/// Remote TSAP for a PG connection to the CPU at `rack`/`slot`.
pub fn remote_tsap(rack: u8, slot: u8) -> u16 {
    LOCAL_TSAP | ((rack as u16 & 0x07) * 0x20) | (slot as u16 & 0x1F)
}

fn tpkt(payload: &[u8]) -> Vec<u8> {
    let len = (TPKT_HEADER_SZ + payload.len()) as u16;
    let mut frame = Vec::with_capacity(len as usize);
    frame.extend_from_slice(&[TPKT_VERSION, 0x00]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn connection_request(rack: u8, slot: u8) -> Vec<u8> {
    let local = LOCAL_TSAP.to_be_bytes();
    let remote = remote_tsap(rack, slot).to_be_bytes();
    let cotp = [
        17, // header length, excluding this byte
        COTP_CONNECT_REQUEST,
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00, // class 0
        0xC0, 0x01, COTP_TPDU_SIZE_1024,
        0xC1, 0x02, local[0], local[1],
        0xC2, 0x02, remote[0], remote[1],
    ];
    tpkt(&cotp)
}

fn job(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(3 + S7_JOB_HEADER_SZ + params.len() + data.len());
    payload.extend_from_slice(&[0x02, COTP_DATA, COTP_LAST_UNIT]);
    payload.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_JOB, 0x00, 0x00]);
    payload.extend_from_slice(&pdu_ref.to_be_bytes());
    payload.extend_from_slice(&(params.len() as u16).to_be_bytes());
    payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
    payload.extend_from_slice(params);
    payload.extend_from_slice(data);
    tpkt(&payload)
}

pub fn setup_communication(pdu_ref: u16, pdu_size: u16) -> Vec<u8> {
    let size = pdu_size.to_be_bytes();
    let params = [
        FN_SETUP_COMMUNICATION,
        0x00,
        0x00, 0x01, // max AmQ calling
        0x00, 0x01, // max AmQ called
        size[0], size[1],
    ];
    job(pdu_ref, &params, &[])
}

/// ANY-pointer item addressing `count` elements of `transport` in a DB.
fn item(transport: u8, count: u16, db: u16, byte: u16, bit: u8) -> [u8; 12] {
    let count = count.to_be_bytes();
    let db = db.to_be_bytes();
    let address = ((byte as u32) << 3) | (bit as u32 & 0x07);
    [
        ITEM_SPEC,
        ITEM_SPEC_LEN,
        ITEM_SYNTAX_ANY,
        transport,
        count[0],
        count[1],
        db[0],
        db[1],
        AREA_DB,
        (address >> 16) as u8,
        (address >> 8) as u8,
        address as u8,
    ]
}

fn read_var(pdu_ref: u16, item: [u8; 12]) -> Vec<u8> {
    let mut params = vec![FN_READ_VAR, 0x01];
    params.extend_from_slice(&item);
    job(pdu_ref, &params, &[])
}

pub fn read_bit_request(pdu_ref: u16, addr: BitAddress) -> Vec<u8> {
    read_var(pdu_ref, item(REQ_BIT, 1, addr.db, addr.byte, addr.bit))
}

pub fn read_dword_request(pdu_ref: u16, addr: DwordAddress) -> Vec<u8> {
    read_var(pdu_ref, item(REQ_BYTE, 4, addr.db, addr.byte, 0))
}

pub fn write_bit_request(pdu_ref: u16, addr: BitAddress, value: bool) -> Vec<u8> {
    let mut params = vec![FN_WRITE_VAR, 0x01];
    params.extend_from_slice(&item(REQ_BIT, 1, addr.db, addr.byte, addr.bit));
    let data = [0x00, DATA_BIT, 0x00, 0x01, value as u8];
    job(pdu_ref, &params, &data)
}

fn be16(buf: &[u8], at: usize) -> Result<u16, S7Error> {
    match buf.get(at..at + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(S7Error::Truncated(buf.len())),
    }
}

/// Validates the TPKT header and returns the COTP+S7 payload.
fn tpkt_payload(frame: &[u8]) -> Result<&[u8], S7Error> {
    if frame.len() < TPKT_HEADER_SZ {
        return Err(S7Error::Truncated(frame.len()));
    }
    if frame[0] != TPKT_VERSION {
        return Err(S7Error::BadTpkt(frame[0]));
    }
    let declared = be16(frame, 2)? as usize;
    if declared != frame.len() {
        return Err(S7Error::BadLength(declared));
    }
    Ok(&frame[TPKT_HEADER_SZ..])
}

pub fn parse_connection_confirm(frame: &[u8]) -> Result<(), S7Error> {
    let cotp = tpkt_payload(frame)?;
    if cotp.len() < 2 {
        return Err(S7Error::Truncated(frame.len()));
    }
    if cotp[1] & 0xF0 != COTP_CONNECT_CONFIRM {
        return Err(S7Error::UnexpectedCotp(cotp[1]));
    }
    Ok(())
}

/// Splits an ack-data frame into its parameter and data sections.
fn ack_sections(frame: &[u8]) -> Result<(&[u8], &[u8]), S7Error> {
    let payload = tpkt_payload(frame)?;
    if payload.len() < 2 {
        return Err(S7Error::Truncated(frame.len()));
    }
    if payload[1] != COTP_DATA {
        return Err(S7Error::UnexpectedCotp(payload[1]));
    }
    let s7 = payload
        .get(1 + payload[0] as usize..)
        .ok_or(S7Error::Truncated(frame.len()))?;
    if s7.len() < S7_ACK_HEADER_SZ {
        return Err(S7Error::Truncated(frame.len()));
    }
    if s7[0] != S7_PROTOCOL_ID {
        return Err(S7Error::BadProtocolId(s7[0]));
    }
    if s7[1] != ROSCTR_ACK_DATA {
        return Err(S7Error::UnexpectedMessage(s7[1]));
    }
    let (class, code) = (s7[10], s7[11]);
    if class != 0 || code != 0 {
        return Err(S7Error::Rejected { class, code });
    }
    let params_len = be16(s7, 6)? as usize;
    let data_len = be16(s7, 8)? as usize;
    let params_end = S7_ACK_HEADER_SZ + params_len;
    let data_end = params_end + data_len;
    if s7.len() < data_end {
        return Err(S7Error::Truncated(frame.len()));
    }
    Ok((&s7[S7_ACK_HEADER_SZ..params_end], &s7[params_end..data_end]))
}

fn expect_function(params: &[u8], function: u8) -> Result<(), S7Error> {
    match params.first() {
        Some(&f) if f == function => Ok(()),
        Some(&f) => Err(S7Error::UnexpectedFunction(f)),
        None => Err(S7Error::Truncated(0)),
    }
}

/// Returns the PDU size granted by the PLC.
pub fn parse_setup_response(frame: &[u8]) -> Result<u16, S7Error> {
    let (params, _) = ack_sections(frame)?;
    expect_function(params, FN_SETUP_COMMUNICATION)?;
    be16(params, 6)
}

fn read_payload(frame: &[u8]) -> Result<&[u8], S7Error> {
    let (params, data) = ack_sections(frame)?;
    expect_function(params, FN_READ_VAR)?;
    let code = *data.first().ok_or(S7Error::Truncated(frame.len()))?;
    if code != ITEM_OK {
        return Err(S7Error::ItemFailed(code));
    }
    if data.len() < 4 {
        return Err(S7Error::Truncated(frame.len()));
    }
    let len = be16(data, 2)? as usize;
    let byte_len = match data[1] {
        DATA_BYTE | DATA_INT => (len + 7) / 8,
        _ => len,
    };
    data.get(4..4 + byte_len).ok_or(S7Error::Truncated(frame.len()))
}

pub fn parse_read_bit(frame: &[u8]) -> Result<bool, S7Error> {
    let value = read_payload(frame)?;
    value
        .first()
        .map(|b| b & 0x01 != 0)
        .ok_or(S7Error::Truncated(frame.len()))
}

pub fn parse_read_dword(frame: &[u8]) -> Result<u32, S7Error> {
    let value = read_payload(frame)?;
    match value {
        [a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(S7Error::Truncated(frame.len())),
    }
}

pub fn parse_write_response(frame: &[u8]) -> Result<(), S7Error> {
    let (params, data) = ack_sections(frame)?;
    expect_function(params, FN_WRITE_VAR)?;
    match data.first() {
        Some(&ITEM_OK) => Ok(()),
        Some(&code) => Err(S7Error::ItemFailed(code)),
        None => Err(S7Error::Truncated(frame.len())),
    }
}

/// One established ISO-on-TCP session with a CPU.
pub struct S7Connection {
    stream: TcpStream,
    pdu_ref: u16,
    pdu_size: u16,
}

impl S7Connection {
    pub async fn connect(host: &str, port: u16, rack: u8, slot: u8) -> Result<S7Connection> {
        let stream = timeout(IO_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("timeout connecting to {host}:{port}"))?
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        stream.set_nodelay(true)?;

        let mut conn = S7Connection {
            stream,
            pdu_ref: 0,
            pdu_size: 0,
        };

        let confirm = conn.exchange(&connection_request(rack, slot)).await?;
        parse_connection_confirm(&confirm).context("COTP connection refused")?;

        let pdu_ref = conn.next_ref();
        let setup = conn
            .exchange(&setup_communication(pdu_ref, REQUESTED_PDU_SIZE))
            .await?;
        conn.pdu_size = parse_setup_response(&setup).context("setup communication failed")?;
        Ok(conn)
    }

    pub fn pdu_size(&self) -> u16 {
        self.pdu_size
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; TPKT_HEADER_SZ];
        self.stream.read_exact(&mut header).await?;
        if header[0] != TPKT_VERSION {
            bail!(S7Error::BadTpkt(header[0]));
        }
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        if len <= TPKT_HEADER_SZ || len > MAX_FRAME_SIZE {
            bail!(S7Error::BadLength(len));
        }
        let mut frame = vec![0u8; len];
        frame[..TPKT_HEADER_SZ].copy_from_slice(&header);
        self.stream.read_exact(&mut frame[TPKT_HEADER_SZ..]).await?;
        Ok(frame)
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let io = async move {
            self.stream.write_all(request).await?;
            self.read_frame().await
        };
        timeout(IO_TIMEOUT, io).await.context("PLC did not answer in time")?
    }

    pub async fn read_bit(&mut self, addr: BitAddress) -> Result<bool> {
        let pdu_ref = self.next_ref();
        let frame = self.exchange(&read_bit_request(pdu_ref, addr)).await?;
        Ok(parse_read_bit(&frame)?)
    }

    pub async fn write_bit(&mut self, addr: BitAddress, value: bool) -> Result<()> {
        let pdu_ref = self.next_ref();
        let frame = self.exchange(&write_bit_request(pdu_ref, addr, value)).await?;
        Ok(parse_write_response(&frame)?)
    }

    pub async fn read_dword(&mut self, addr: DwordAddress) -> Result<u32> {
        let pdu_ref = self.next_ref();
        let frame = self.exchange(&read_dword_request(pdu_ref, addr)).await?;
        Ok(parse_read_dword(&frame)?)
    }
}

/// Builds an ack-data frame the way a CPU answers a job.
#[cfg(test)]
pub(crate) fn ack_frame(params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut payload = vec![0x02, COTP_DATA, COTP_LAST_UNIT];
    payload.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_ACK_DATA, 0x00, 0x00, 0x00, 0x01]);
    payload.extend_from_slice(&(params.len() as u16).to_be_bytes());
    payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
    payload.extend_from_slice(&[0x00, 0x00]);
    payload.extend_from_slice(params);
    payload.extend_from_slice(data);
    tpkt(&payload)
}

#[cfg(test)]
pub(crate) fn connection_confirm_frame() -> Vec<u8> {
    tpkt(&[0x06, COTP_CONNECT_CONFIRM, 0x00, 0x01, 0x00, 0x01, 0x00])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_request_layout() {
        let frame = connection_request(0, 1);
        assert_eq!(
            frame,
            vec![
                0x03, 0x00, 0x00, 22, 17, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A,
                0xC1, 0x02, 0x01, 0x00, 0xC2, 0x02, 0x01, 0x01,
            ]
        );
        assert_eq!(remote_tsap(1, 2), 0x0122);
    }

    #[test]
    fn read_bit_request_addresses_db_bit() {
        let frame = read_bit_request(7, BitAddress::new(808, 160, 2));
        assert_eq!(frame.len(), 31);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 31);
        // S7 header: job, pdu ref 7, 14 bytes of parameters, no data.
        assert_eq!(&frame[7..17], &[0x32, 0x01, 0, 0, 0, 7, 0, 14, 0, 0]);
        let item = &frame[19..31];
        assert_eq!(item[3], REQ_BIT);
        assert_eq!(u16::from_be_bytes([item[6], item[7]]), 808);
        assert_eq!(item[8], AREA_DB);
        let address = u32::from_be_bytes([0, item[9], item[10], item[11]]);
        assert_eq!(address, 160 * 8 + 2);
    }

    #[test]
    fn write_bit_request_carries_value() {
        let frame = write_bit_request(1, BitAddress::new(504, 12, 1), true);
        assert_eq!(frame.len(), 36);
        assert_eq!(frame[17], FN_WRITE_VAR);
        assert_eq!(&frame[31..], &[0x00, DATA_BIT, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn parses_bit_and_dword_reads() {
        let bit = ack_frame(&[FN_READ_VAR, 1], &[ITEM_OK, DATA_BIT, 0x00, 0x01, 0x01]);
        assert_eq!(parse_read_bit(&bit), Ok(true));

        let ms: u32 = 7 * 3_600_000 + 30 * 60_000;
        let mut data = vec![ITEM_OK, DATA_BYTE, 0x00, 32];
        data.extend_from_slice(&ms.to_be_bytes());
        let dword = ack_frame(&[FN_READ_VAR, 1], &data);
        assert_eq!(parse_read_dword(&dword), Ok(ms));
    }

    #[test]
    fn parses_setup_and_write_acks() {
        let setup = ack_frame(&[FN_SETUP_COMMUNICATION, 0, 0, 1, 0, 1, 0x00, 0xF0], &[]);
        assert_eq!(parse_setup_response(&setup), Ok(240));

        let write = ack_frame(&[FN_WRITE_VAR, 1], &[ITEM_OK]);
        assert_eq!(parse_write_response(&write), Ok(()));
    }

    #[test]
    fn item_failure_is_reported() {
        let missing_db = ack_frame(&[FN_READ_VAR, 1], &[0x0A, 0x00, 0x00, 0x00]);
        assert_eq!(parse_read_bit(&missing_db), Err(S7Error::ItemFailed(0x0A)));

        let write = ack_frame(&[FN_WRITE_VAR, 1], &[0x05]);
        assert_eq!(parse_write_response(&write), Err(S7Error::ItemFailed(0x05)));
    }

    #[test]
    fn rejected_job() {
        let mut frame = ack_frame(&[FN_READ_VAR, 1], &[ITEM_OK, DATA_BIT, 0, 1, 1]);
        // error class / code live at the end of the 12-byte ack header
        frame[4 + 3 + 10] = 0x85;
        frame[4 + 3 + 11] = 0x00;
        assert_eq!(
            parse_read_bit(&frame),
            Err(S7Error::Rejected { class: 0x85, code: 0x00 })
        );
    }

    #[test]
    fn malformed_frames() {
        assert_eq!(parse_read_bit(&[0x03, 0x00]), Err(S7Error::Truncated(2)));

        let mut bad_version = ack_frame(&[FN_READ_VAR, 1], &[ITEM_OK, DATA_BIT, 0, 1, 1]);
        bad_version[0] = 0x04;
        assert_eq!(parse_read_bit(&bad_version), Err(S7Error::BadTpkt(0x04)));

        let mut bad_len = ack_frame(&[FN_READ_VAR, 1], &[ITEM_OK, DATA_BIT, 0, 1, 1]);
        bad_len.pop();
        assert!(matches!(parse_read_bit(&bad_len), Err(S7Error::BadLength(_))));

        let wrong_fn = ack_frame(&[FN_WRITE_VAR, 1], &[ITEM_OK]);
        assert_eq!(
            parse_read_bit(&wrong_fn),
            Err(S7Error::UnexpectedFunction(FN_WRITE_VAR))
        );

        assert_eq!(
            parse_connection_confirm(&connection_request(0, 1)),
            Err(S7Error::UnexpectedCotp(COTP_CONNECT_REQUEST))
        );
        assert_eq!(parse_connection_confirm(&connection_confirm_frame()), Ok(()));
    }

    #[test]
    fn cotp_length_past_the_payload() {
        // COTP header claims 255 bytes in a 3-byte payload.
        let frame = [0x03, 0x00, 0x00, 0x07, 0xFF, COTP_DATA, 0x80];
        assert_eq!(parse_read_bit(&frame), Err(S7Error::Truncated(7)));
        assert_eq!(parse_write_response(&frame), Err(S7Error::Truncated(7)));
        assert_eq!(parse_setup_response(&frame), Err(S7Error::Truncated(7)));

        // Exactly consumes the payload: no S7 header left.
        let frame = [0x03, 0x00, 0x00, 0x07, 0x02, COTP_DATA, 0x80];
        assert_eq!(parse_read_dword(&frame), Err(S7Error::Truncated(7)));
    }
}
