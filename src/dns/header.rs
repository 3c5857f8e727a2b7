//! DNS message header (RFC 1035 §4.1.1), encoded bit-for-bit with `bitstream-io`.

use bitstream_io::{BitRead, BitWrite};

use crate::error::{AppError, Result};

use super::enums::{Opcode, Rcode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: Opcode,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub z: u8,
    pub rcode: Rcode,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            id: 0,
            qr: false,
            opcode: Opcode::Query,
            aa: false,
            tc: false,
            rd: false,
            ra: false,
            z: 0,
            rcode: Rcode::NoError,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }
}

impl Header {
    pub fn write<W: BitWrite>(&self, w: &mut W) -> Result<()> {
        w.write_var(16, self.id as u32)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_bit(self.qr)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_var(4, self.opcode.to_u8() as u32)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_bit(self.aa)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_bit(self.tc)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_bit(self.rd)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_bit(self.ra)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_var(3, self.z as u32)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_var(4, self.rcode.to_u8() as u32)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_var(16, self.qdcount as u32)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_var(16, self.ancount as u32)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_var(16, self.nscount as u32)
            .map_err(|e| AppError::decode(e.to_string()))?;
        w.write_var(16, self.arcount as u32)
            .map_err(|e| AppError::decode(e.to_string()))?;
        Ok(())
    }

    pub fn read<R: BitRead>(r: &mut R) -> Result<Self> {
        let id: u32 = r.read_var(16).map_err(|e| AppError::decode(e.to_string()))?;
        let qr = r.read_bit().map_err(|e| AppError::decode(e.to_string()))?;
        let opcode: u32 = r.read_var(4).map_err(|e| AppError::decode(e.to_string()))?;
        let aa = r.read_bit().map_err(|e| AppError::decode(e.to_string()))?;
        let tc = r.read_bit().map_err(|e| AppError::decode(e.to_string()))?;
        let rd = r.read_bit().map_err(|e| AppError::decode(e.to_string()))?;
        let ra = r.read_bit().map_err(|e| AppError::decode(e.to_string()))?;
        let z: u32 = r.read_var(3).map_err(|e| AppError::decode(e.to_string()))?;
        let rcode: u32 = r.read_var(4).map_err(|e| AppError::decode(e.to_string()))?;
        let qdcount: u32 = r
            .read_var(16)
            .map_err(|e| AppError::decode(e.to_string()))?;
        let ancount: u32 = r
            .read_var(16)
            .map_err(|e| AppError::decode(e.to_string()))?;
        let nscount: u32 = r
            .read_var(16)
            .map_err(|e| AppError::decode(e.to_string()))?;
        let arcount: u32 = r
            .read_var(16)
            .map_err(|e| AppError::decode(e.to_string()))?;

        Ok(Header {
            id: id as u16,
            qr,
            opcode: Opcode::from(opcode as u8),
            aa,
            tc,
            rd,
            ra,
            z: z as u8,
            rcode: Rcode::from(rcode as u8),
            qdcount: qdcount as u16,
            ancount: ancount as u16,
            nscount: nscount as u16,
            arcount: arcount as u16,
        })
    }
}
