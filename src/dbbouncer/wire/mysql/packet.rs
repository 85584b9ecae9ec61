use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dbbouncer::common::{Error, Result};

pub const MAX_PACKET_LEN: usize = 1 << 24;

/// One MySQL protocol packet: a 3-byte little-endian length, a 1-byte sequence
/// number, then the payload. Multi-packet (>16MB) payloads are out of scope —
/// see the Non-goals list.
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Vec<u8>,
}

pub async fn read_packet<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Packet> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
    if len > MAX_PACKET_LEN {
        return Err(Error::protocol(format!("mysql packet too large: {} bytes", len)));
    }
    let sequence_id = header[3];
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Packet { sequence_id, payload })
}

pub async fn write_packet<S: AsyncWrite + Unpin>(stream: &mut S, sequence_id: u8, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PACKET_LEN {
        return Err(Error::protocol("mysql packet payload too large to send"));
    }
    let len = payload.len();
    let header = [(len & 0xff) as u8, ((len >> 8) & 0xff) as u8, ((len >> 16) & 0xff) as u8, sequence_id];
    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    Ok(())
}

/// Read a MySQL length-encoded integer starting at `pos`; returns (value, next_pos).
pub fn read_lenenc_int(buf: &[u8], pos: usize) -> Option<(u64, usize)> {
    let first = *buf.get(pos)?;
    match first {
        0xfb => None, // NULL marker, caller must handle separately
        0xfc => {
            let b = buf.get(pos + 1..pos + 3)?;
            Some((u16::from_le_bytes([b[0], b[1]]) as u64, pos + 3))
        }
        0xfd => {
            let b = buf.get(pos + 1..pos + 4)?;
            Some((u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64, pos + 4))
        }
        0xfe => {
            let b = buf.get(pos + 1..pos + 9)?;
            Some((u64::from_le_bytes(b.try_into().ok()?), pos + 9))
        }
        v => Some((v as u64, pos + 1)),
    }
}

pub fn write_lenenc_int(buf: &mut Vec<u8>, value: u64) {
    if value < 251 {
        buf.push(value as u8);
    } else if value < 0x10000 {
        buf.push(0xfc);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value < 0x1000000 {
        buf.push(0xfd);
        buf.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        buf.push(0xfe);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub fn read_nul_terminated(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let end = buf[pos..].iter().position(|&b| b == 0)?;
    Some((&buf[pos..pos + end], pos + end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_packet_roundtrip() {
        let mut buf = Vec::new();
        write_packet(&mut buf, 3, b"hello").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let pkt = read_packet(&mut cursor).await.unwrap();
        assert_eq!(pkt.sequence_id, 3);
        assert_eq!(pkt.payload, b"hello");
    }

    #[test]
    fn test_lenenc_int_small() {
        let mut buf = Vec::new();
        write_lenenc_int(&mut buf, 200);
        assert_eq!(read_lenenc_int(&buf, 0), Some((200, 1)));
    }

    #[test]
    fn test_lenenc_int_medium() {
        let mut buf = Vec::new();
        write_lenenc_int(&mut buf, 1000);
        assert_eq!(read_lenenc_int(&buf, 0), Some((1000, 3)));
    }
}
