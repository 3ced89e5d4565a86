use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::iiod::framer::Framer;

pub const HEADER_LEN: usize = 8;

/// Binary transport opcodes. The response opcode is shared by every reply;
/// correlation is by order because a session keeps one request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Version = 0,
    Print = 1,
    Timeout = 2,
    ReadAttr = 3,
    WriteAttr = 4,
    ReadDbgAttr = 5,
    WriteDbgAttr = 6,
    ReadBufAttr = 7,
    WriteBufAttr = 8,
    ReadChnAttr = 9,
    WriteChnAttr = 10,
    GetTrig = 11,
    SetTrig = 12,
    CreateBuffer = 13,
    FreeBuffer = 14,
    EnableBuffer = 15,
    DisableBuffer = 16,
    CreateBlock = 17,
    FreeBlock = 18,
    TransferBlock = 19,
    EnqueueBlockCyclic = 20,
    RetryDequeueBlock = 21,
    CreateEvstream = 22,
    FreeEvstream = 23,
    ReadEvent = 24,
    Response = 25,
}

impl Opcode {
    pub fn from_u8(raw: u8) -> Option<Opcode> {
        if raw > Opcode::Response as u8 {
            return None;
        }
        // Contiguous discriminants starting at zero.
        Some(unsafe { std::mem::transmute::<u8, Opcode>(raw) })
    }
}

/// Fixed 8-byte header: client id, opcode, device handle, signed code.
/// All fields network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub client_id: u16,
    pub op: u8,
    pub dev: u8,
    pub code: i32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        BigEndian::write_u16(&mut buf[0..2], self.client_id);
        buf[2] = self.op;
        buf[3] = self.dev;
        BigEndian::write_i32(&mut buf[4..8], self.code);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Header {
        Header {
            client_id: BigEndian::read_u16(&buf[0..2]),
            op: buf[2],
            dev: buf[3],
            code: BigEndian::read_i32(&buf[4..8]),
        }
    }
}

/// `lpString`: 4-byte big-endian length followed by UTF-8 bytes.
pub fn put_lp_string(out: &mut Vec<u8>, value: &str) {
    out.write_u32::<BigEndian>(value.len() as u32).ok();
    out.extend_from_slice(value.as_bytes());
}

/// `nameValue`: two `lpString`s back to back.
pub fn put_name_value(out: &mut Vec<u8>, name: &str, value: &str) {
    put_lp_string(out, name);
    put_lp_string(out, value);
}

pub fn put_u64_le(out: &mut Vec<u8>, value: u64) {
    out.write_u64::<LittleEndian>(value).ok();
}

/// CREATE_BUFFER payload: little-endian word count, then the packed
/// channel-mask words (bit n of word n/32 set iff channel n is enabled).
pub fn put_channel_mask(out: &mut Vec<u8>, channels: &[u32]) {
    let words = match channels.iter().max() {
        Some(max) => (*max as usize / 32) + 1,
        None => 0,
    };
    let mut mask = vec![0u32; words];
    for &ch in channels {
        mask[ch as usize / 32] |= 1 << (ch % 32);
    }
    out.write_u32::<LittleEndian>(words as u32).ok();
    for word in mask {
        out.write_u32::<LittleEndian>(word).ok();
    }
}

pub fn read_lp_string_from(buf: &[u8]) -> Result<(String, usize)> {
    if buf.len() < 4 {
        return Err(Error::Framing("truncated lpString length".into()));
    }
    let len = BigEndian::read_u32(&buf[0..4]) as usize;
    if buf.len() < 4 + len {
        return Err(Error::Framing("truncated lpString payload".into()));
    }
    let s = std::str::from_utf8(&buf[4..4 + len])
        .map_err(|_| Error::Framing("lpString is not UTF-8".into()))?;
    Ok((s.to_string(), 4 + len))
}

/// Send one request and read back the response header. Returns the declared
/// payload length; negative response codes become [`Error::Status`]. The
/// payload bytes, if any, are left on the stream for the caller to consume.
async fn exchange(
    framer: &mut Framer,
    client_id: u16,
    op: Opcode,
    dev: u8,
    code: i32,
    payload: &[u8],
) -> Result<usize> {
    let header = Header {
        client_id,
        op: op as u8,
        dev,
        code,
    };
    let mut req = Vec::with_capacity(HEADER_LEN + payload.len());
    req.extend_from_slice(&header.encode());
    req.extend_from_slice(payload);
    framer.write_all(&req).await?;

    let mut raw = [0u8; HEADER_LEN];
    framer.read_exact(&mut raw).await?;
    let resp = Header::decode(&raw);
    if resp.op != Opcode::Response as u8 {
        framer.close();
        return Err(Error::Framing(format!(
            "expected response header, got opcode {}",
            resp.op
        )));
    }
    if resp.code < 0 {
        return Err(Error::Status {
            op: op as u8,
            dev,
            code: resp.code,
        });
    }
    Ok(resp.code as usize)
}

/// One binary round trip: copy up to `dst.len()` payload bytes and discard
/// the remainder so the stream stays aligned for the next request. Returns
/// the declared payload length; a status-only response is legal.
pub async fn roundtrip(
    framer: &mut Framer,
    client_id: u16,
    op: Opcode,
    dev: u8,
    code: i32,
    payload: &[u8],
    dst: &mut [u8],
) -> Result<usize> {
    let declared = exchange(framer, client_id, op, dev, code, payload).await?;
    let take = declared.min(dst.len());
    if take > 0 {
        framer.read_exact(&mut dst[..take]).await?;
    }
    if declared > take {
        framer.discard(declared - take).await?;
    }
    Ok(declared)
}

/// Same round trip, collecting the whole payload into a vector.
pub async fn roundtrip_vec(
    framer: &mut Framer,
    client_id: u16,
    op: Opcode,
    dev: u8,
    code: i32,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let declared = exchange(framer, client_id, op, dev, code, payload).await?;
    let mut out = vec![0u8; declared];
    if !out.is_empty() {
        framer.read_exact(&mut out).await?;
    }
    Ok(out)
}
