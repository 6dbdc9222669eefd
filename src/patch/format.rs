//! Wire framing shared by the diff and patch engines: `magic |
//! compression_header | container(target) | container(source) | for each
//! source file: { op ... op, sync } | EOF`.

use std::io::{Read, Write};

use crate::container::Container;
use crate::errors::{CoreError, Result};

pub const MAGIC: &[u8; 4] = b"CVPA";

const TAG_BLOCK_RANGE: u8 = 1;
const TAG_DATA: u8 = 2;
const TAG_SYNC: u8 = 3;
const TAG_EOF: u8 = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    BlockRange { file: usize, first: u64, count: u64 },
    Data(Vec<u8>),
}

pub fn write_header<W: Write>(mut out: W, compression_level: i32, target: &Container, source: &Container) -> Result<()> {
    out.write_all(MAGIC)?;
    out.write_all(&compression_level.to_le_bytes())?;
    write_container(&mut out, target)?;
    write_container(&mut out, source)?;
    Ok(())
}

pub struct PatchHeader {
    pub compression_level: i32,
    pub target: Container,
    pub source: Container,
}

pub fn read_header<R: Read>(mut input: R) -> Result<PatchHeader> {
    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CoreError::PatchCorrupt("bad magic".into()));
    }
    let mut level_buf = [0u8; 4];
    input.read_exact(&mut level_buf)?;
    let compression_level = i32::from_le_bytes(level_buf);
    let target = read_container(&mut input)?;
    let source = read_container(&mut input)?;
    Ok(PatchHeader { compression_level, target, source })
}

fn write_container<W: Write>(out: &mut W, container: &Container) -> Result<()> {
    let body = serde_json::to_vec(container)?;
    out.write_all(&(body.len() as u64).to_le_bytes())?;
    out.write_all(&body)?;
    Ok(())
}

fn read_container<R: Read>(input: &mut R) -> Result<Container> {
    let mut len_buf = [0u8; 8];
    input.read_exact(&mut len_buf)?;
    let len = u64::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    serde_json::from_slice(&buf).map_err(|err| CoreError::PatchCorrupt(err.to_string()))
}

pub fn write_op<W: Write>(out: &mut W, op: &Op) -> Result<()> {
    match op {
        Op::BlockRange { file, first, count } => {
            out.write_all(&[TAG_BLOCK_RANGE])?;
            out.write_all(&(*file as u64).to_le_bytes())?;
            out.write_all(&first.to_le_bytes())?;
            out.write_all(&count.to_le_bytes())?;
        }
        Op::Data(bytes) => {
            out.write_all(&[TAG_DATA])?;
            out.write_all(&(bytes.len() as u64).to_le_bytes())?;
            out.write_all(bytes)?;
        }
    }
    Ok(())
}

pub fn write_sync<W: Write>(out: &mut W) -> Result<()> {
    out.write_all(&[TAG_SYNC])?;
    Ok(())
}

pub fn write_eof<W: Write>(out: &mut W) -> Result<()> {
    out.write_all(&[TAG_EOF])?;
    out.flush()?;
    Ok(())
}

/// One frame read from the ops stream: either an `Op`, the per-file sync
/// marker, or the end-of-stream marker.
pub enum Frame {
    Op(Op),
    Sync,
    Eof,
}

pub fn read_frame<R: Read + ?Sized>(input: &mut R) -> Result<Frame> {
    let mut tag = [0u8; 1];
    input.read_exact(&mut tag)?;
    match tag[0] {
        TAG_BLOCK_RANGE => {
            let mut u64s = [0u8; 24];
            input.read_exact(&mut u64s)?;
            let file = u64::from_le_bytes(u64s[0..8].try_into().unwrap()) as usize;
            let first = u64::from_le_bytes(u64s[8..16].try_into().unwrap());
            let count = u64::from_le_bytes(u64s[16..24].try_into().unwrap());
            Ok(Frame::Op(Op::BlockRange { file, first, count }))
        }
        TAG_DATA => {
            let mut len_buf = [0u8; 8];
            input.read_exact(&mut len_buf)?;
            let len = u64::from_le_bytes(len_buf) as usize;
            let mut bytes = vec![0u8; len];
            input.read_exact(&mut bytes)?;
            Ok(Frame::Op(Op::Data(bytes)))
        }
        TAG_SYNC => Ok(Frame::Sync),
        TAG_EOF => Ok(Frame::Eof),
        other => Err(CoreError::PatchCorrupt(format!("unknown op tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::FileEntry;

    #[test]
    fn header_round_trips() {
        let mut target = Container::new();
        target.files.push(FileEntry { path: "a".into(), size: 10, mode: 0o644 });
        let source = target.clone();

        let mut buf = Vec::new();
        write_header(&mut buf, 0, &target, &source).unwrap();
        let header = read_header(&buf[..]).unwrap();
        assert_eq!(header.target.files[0].path, "a");
        assert_eq!(header.compression_level, 0);
    }

    #[test]
    fn ops_round_trip_through_frames() {
        let mut buf = Vec::new();
        write_op(&mut buf, &Op::BlockRange { file: 2, first: 3, count: 4 }).unwrap();
        write_op(&mut buf, &Op::Data(vec![1, 2, 3])).unwrap();
        write_sync(&mut buf).unwrap();
        write_eof(&mut buf).unwrap();

        let mut cursor = &buf[..];
        match read_frame(&mut cursor).unwrap() {
            Frame::Op(Op::BlockRange { file, first, count }) => {
                assert_eq!((file, first, count), (2, 3, 4));
            }
            _ => panic!("expected BlockRange"),
        }
        match read_frame(&mut cursor).unwrap() {
            Frame::Op(Op::Data(bytes)) => assert_eq!(bytes, vec![1, 2, 3]),
            _ => panic!("expected Data"),
        }
        assert!(matches!(read_frame(&mut cursor).unwrap(), Frame::Sync));
        assert!(matches!(read_frame(&mut cursor).unwrap(), Frame::Eof));
    }
}
