//! Shard write packet
//!
//! ```text
//! [packet type u8][db len u8][db][rp len u8][rp][pt id u32][shard id u64][rows ...]
//! ```
//!
//! Integers are big-endian. The row payload is opaque to the storage engine and is
//! carried through unchanged.

use crate::{Result, TsspError};
use bytes::{Buf, BufMut, Bytes};

/// Packet type of rows written by the stream path
pub const PACKET_TYPE_FAST: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPacket {
    pub packet_type: u8,
    pub db: String,
    pub rp: String,
    pub pt_id: u32,
    pub shard_id: u64,
    pub rows: Bytes,
}

impl ShardPacket {
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let db = short_str(&self.db, "database")?;
        let rp = short_str(&self.rp, "retention policy")?;
        dst.reserve(1 + 2 + db.len() + rp.len() + 12 + self.rows.len());
        dst.put_u8(self.packet_type);
        dst.put_u8(db.len() as u8);
        dst.put_slice(db);
        dst.put_u8(rp.len() as u8);
        dst.put_slice(rp);
        dst.put_u32(self.pt_id);
        dst.put_u64(self.shard_id);
        dst.put_slice(&self.rows);
        Ok(())
    }

    pub fn decode(data: &Bytes) -> Result<Self> {
        let mut buf = data.clone();
        let packet_type = take_u8(&mut buf, "packet type")?;
        let db = take_str(&mut buf, "database")?;
        let rp = take_str(&mut buf, "retention policy")?;
        if buf.remaining() < 12 {
            return Err(truncated("shard address"));
        }
        let pt_id = buf.get_u32();
        let shard_id = buf.get_u64();
        Ok(Self {
            packet_type,
            db,
            rp,
            pt_id,
            shard_id,
            rows: buf,
        })
    }
}

fn short_str<'a>(s: &'a str, what: &str) -> Result<&'a [u8]> {
    if s.len() > u8::MAX as usize {
        return Err(TsspError::InvalidFormat(format!(
            "{} name of {} bytes exceeds 255",
            what,
            s.len()
        )));
    }
    Ok(s.as_bytes())
}

fn truncated(what: &str) -> TsspError {
    TsspError::InvalidFormat(format!("packet truncated in {}", what))
}

fn take_u8(buf: &mut Bytes, what: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated(what));
    }
    Ok(buf.get_u8())
}

fn take_str(buf: &mut Bytes, what: &str) -> Result<String> {
    let len = take_u8(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(truncated(what));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| TsspError::InvalidFormat(format!("{} is not utf-8: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet() -> ShardPacket {
        ShardPacket {
            packet_type: PACKET_TYPE_FAST,
            db: "db0".into(),
            rp: "autogen".into(),
            pt_id: 3,
            shard_id: 0x0102_0304_0506_0708,
            rows: Bytes::from_static(b"cpu,host=a value=1 100"),
        }
    }

    #[test]
    fn test_packet_layout() {
        let mut buf = Vec::new();
        packet().encode(&mut buf).unwrap();
        assert_eq!(buf[0], PACKET_TYPE_FAST);
        assert_eq!(&buf[1..5], b"\x03db0");
        assert_eq!(&buf[5..13], b"\x07autogen");
        assert_eq!(&buf[13..17], &[0, 0, 0, 3]);
        assert_eq!(&buf[17..25], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[25..], b"cpu,host=a value=1 100");

        let back = ShardPacket::decode(&Bytes::from(buf)).unwrap();
        assert_eq!(back, packet());
    }

    #[test]
    fn test_packet_errors() {
        let long = ShardPacket {
            db: "d".repeat(256),
            ..packet()
        };
        assert!(matches!(long.encode(&mut Vec::new()), Err(TsspError::InvalidFormat(_))));

        let mut buf = Vec::new();
        packet().encode(&mut buf).unwrap();
        for cut in [0, 1, 3, 6, 14, 24] {
            let res = ShardPacket::decode(&Bytes::copy_from_slice(&buf[..cut]));
            assert!(matches!(res, Err(TsspError::InvalidFormat(_))), "cut at {}", cut);
        }
        // empty row payload is valid
        let empty = ShardPacket::decode(&Bytes::copy_from_slice(&buf[..25])).unwrap();
        assert!(empty.rows.is_empty());
    }
}
