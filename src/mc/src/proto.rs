//! Checkpoint control words, big-endian u32 on the wire.

use std::io::{Read, Write};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Nack,
    Commit,
    Cancel,
    Ack,
}

impl Sentinel {
    pub fn to_wire(self) -> u32 {
        match self {
            Sentinel::Nack => -1i32 as u32,
            Sentinel::Commit => 1,
            Sentinel::Cancel => 2,
            Sentinel::Ack => 3,
        }
    }

    pub fn from_wire(raw: u32) -> Result<Self> {
        Ok(match raw as i32 {
            -1 => Sentinel::Nack,
            1 => Sentinel::Commit,
            2 => Sentinel::Cancel,
            3 => Sentinel::Ack,
            _ => return Err(Error::BadSentinel(raw)),
        })
    }
}

pub fn write_u32<W: Write>(w: &mut W, value: u32) -> Result<()> {
    w.write_all(&value.to_be_bytes())?;
    Ok(())
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn write_sentinel<W: Write>(w: &mut W, sentinel: Sentinel) -> Result<()> {
    write_u32(w, sentinel.to_wire())
}

pub fn read_sentinel<R: Read>(r: &mut R) -> Result<Sentinel> {
    Sentinel::from_wire(read_u32(r)?)
}
