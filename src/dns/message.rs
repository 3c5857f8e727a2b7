//! Full DNS message: header + four sections, wire decode/encode.
//!
//! Label compression on decode follows the reference implementation's
//! pointer-following algorithm (common.rs in the teacher repo): a two-byte
//! pointer (top bits `11`) redirects the cursor, with a jump-count ceiling to
//! reject pointer loops. Encode deliberately never emits compression pointers
//! — every label is written out in full. This keeps `decode(encode(m)) == m`
//! a trivial identity (the testable round-trip property in §8) without
//! needing a name-table pass on the write side.

use std::io::Cursor;
use std::net::{Ipv4Addr, Ipv6Addr};

use bitstream_io::{BigEndian, BitReader, BitWriter};

use crate::error::{AppError, Result};

use super::enums::{RecordClass, RecordType};
use super::header::Header;
use super::question::{Name, Question};
use super::record::{RData, Record};

const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_JUMPS: usize = 32;
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    pub fn decode(buf: &[u8]) -> Result<Message> {
        if buf.len() < 12 {
            return Err(AppError::decode("message shorter than header"));
        }
        let mut cursor = Cursor::new(&buf[..12]);
        let mut bitreader = BitReader::endian(&mut cursor, BigEndian);
        let header = Header::read(&mut bitreader)?;

        let mut pos = 12usize;
        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            let (name, new_pos) = read_name(buf, pos)?;
            pos = new_pos;
            let qtype = RecordType::from(read_u16(buf, &mut pos)?);
            let qclass = RecordClass::from(read_u16(buf, &mut pos)?);
            questions.push(Question { name, qtype, qclass });
        }

        let mut answers = Vec::with_capacity(header.ancount as usize);
        for _ in 0..header.ancount {
            let (rec, new_pos) = read_record(buf, pos)?;
            pos = new_pos;
            answers.push(rec);
        }

        let mut authorities = Vec::with_capacity(header.nscount as usize);
        for _ in 0..header.nscount {
            let (rec, new_pos) = read_record(buf, pos)?;
            pos = new_pos;
            authorities.push(rec);
        }

        let mut additionals = Vec::with_capacity(header.arcount as usize);
        for _ in 0..header.arcount {
            let (rec, new_pos) = read_record(buf, pos)?;
            pos = new_pos;
            additionals.push(rec);
        }

        Ok(Message {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(512);
        {
            let mut bitwriter = BitWriter::endian(&mut out, BigEndian);
            let mut header = self.header.clone();
            header.qdcount = self.questions.len() as u16;
            header.ancount = self.answers.len() as u16;
            header.nscount = self.authorities.len() as u16;
            header.arcount = self.additionals.len() as u16;
            header.write(&mut bitwriter)?;
        }
        for q in &self.questions {
            write_name(&mut out, &q.name);
            out.extend_from_slice(&q.qtype.to_u16().to_be_bytes());
            out.extend_from_slice(&q.qclass.to_u16().to_be_bytes());
        }
        for r in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
        {
            write_record(&mut out, r)?;
        }
        Ok(out)
    }

    /// Builds a request suitable for forwarding upstream: fresh single
    /// question, recursion desired, no extra sections.
    pub fn new_query(id: u16, name: &Name, qtype: RecordType) -> Message {
        Message {
            header: Header {
                id,
                rd: true,
                ..Header::default()
            },
            questions: vec![Question {
                name: name.clone(),
                qtype,
                qclass: RecordClass::In,
            }],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    /// Mutates self into a reply to `request`: copies id, sets QR/RA/AA.
    pub fn set_reply(&mut self, request: &Message) {
        self.header.id = request.header.id;
        self.header.qr = true;
        self.header.ra = true;
        self.header.aa = true;
        self.header.rd = request.header.rd;
        if self.questions.is_empty() {
            self.questions = request.questions.clone();
        }
    }

    fn bare_reply(request: &Message, rcode: crate::dns::enums::Rcode) -> Message {
        Message {
            header: Header {
                id: request.header.id,
                qr: true,
                ra: true,
                aa: true,
                rd: request.header.rd,
                rcode,
                ..Header::default()
            },
            questions: request.questions.clone(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn nxdomain(request: &Message) -> Message {
        Self::bare_reply(request, crate::dns::enums::Rcode::NxDomain)
    }

    pub fn servfail(request: &Message) -> Message {
        Self::bare_reply(request, crate::dns::enums::Rcode::ServFail)
    }

    /// NOTIMPLEMENTED carries an EDNS0 OPT advertising UDP payload 1452,
    /// ported from the reference's `NewMsgNOTIMPLEMENTED` helper.
    pub fn not_implemented(request: &Message) -> Message {
        let mut m = Self::bare_reply(request, crate::dns::enums::Rcode::NotImp);
        m.additionals.push(Record::opt_1452());
        m
    }

    pub fn servfail_empty(id: u16) -> Message {
        Message {
            header: Header {
                id,
                qr: true,
                ra: true,
                rcode: crate::dns::enums::Rcode::ServFail,
                ..Header::default()
            },
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    let b = *buf
        .get(*pos)
        .ok_or_else(|| AppError::decode("truncated message"))?;
    *pos += 1;
    Ok(b)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16> {
    let hi = read_u8(buf, pos)? as u16;
    let lo = read_u8(buf, pos)? as u16;
    Ok((hi << 8) | lo)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let a = read_u16(buf, pos)? as u32;
    let b = read_u16(buf, pos)? as u32;
    Ok((a << 16) | b)
}

fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(n)
        .ok_or_else(|| AppError::decode("length overflow"))?;
    let slice = buf
        .get(*pos..end)
        .ok_or_else(|| AppError::decode("truncated message"))?;
    *pos = end;
    Ok(slice)
}

/// Reads a (possibly compressed) domain name starting at `pos`, returning the
/// parsed name and the position immediately after it in the *original*
/// stream (i.e. after following a pointer, the returned position is where
/// parsing resumes after the pointer itself, not after the jumped-to data).
fn read_name(buf: &[u8], pos: usize) -> Result<(Name, usize)> {
    let mut labels = Vec::new();
    let mut cursor = pos;
    let mut jumps = 0usize;
    let mut post_pointer_pos: Option<usize> = None;
    let mut total_len = 0usize;

    loop {
        let len = *buf
            .get(cursor)
            .ok_or_else(|| AppError::decode("truncated name"))? as usize;

        if len == 0 {
            cursor += 1;
            if post_pointer_pos.is_none() {
                post_pointer_pos = Some(cursor);
            }
            break;
        }

        if len & 0xC0 == 0xC0 {
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(AppError::decode("too many compression pointer jumps"));
            }
            let b2 = *buf
                .get(cursor + 1)
                .ok_or_else(|| AppError::decode("truncated compression pointer"))?;
            let offset = (((len & 0x3F) as usize) << 8) | b2 as usize;
            if post_pointer_pos.is_none() {
                post_pointer_pos = Some(cursor + 2);
            }
            if offset >= cursor {
                return Err(AppError::decode("forward/self compression pointer"));
            }
            cursor = offset;
            continue;
        }

        if len > MAX_LABEL_LEN {
            return Err(AppError::decode("label exceeds 63 bytes"));
        }

        let start = cursor + 1;
        let end = start
            .checked_add(len)
            .ok_or_else(|| AppError::decode("label length overflow"))?;
        let label_bytes = buf
            .get(start..end)
            .ok_or_else(|| AppError::decode("truncated label"))?;
        let label = String::from_utf8_lossy(label_bytes).into_owned();
        total_len += label.len() + 1;
        if total_len > MAX_NAME_LEN {
            return Err(AppError::decode("name exceeds 255 bytes"));
        }
        labels.push(label);
        cursor = end;
    }

    let resume_at = post_pointer_pos.unwrap_or(cursor);
    Ok((Name(labels), resume_at))
}

fn write_name(out: &mut Vec<u8>, name: &Name) {
    for label in &name.0 {
        let bytes = label.as_bytes();
        let len = bytes.len().min(MAX_LABEL_LEN);
        out.push(len as u8);
        out.extend_from_slice(&bytes[..len]);
    }
    out.push(0);
}

fn read_record(buf: &[u8], pos: usize) -> Result<(Record, usize)> {
    let (name, mut pos) = read_name(buf, pos)?;
    let rtype = RecordType::from(read_u16(buf, &mut pos)?);
    let rclass_raw = read_u16(buf, &mut pos)?;
    let ttl = read_u32(buf, &mut pos)?;
    let rdlength = read_u16(buf, &mut pos)? as usize;
    let rdata_start = pos;
    let rdata_end = pos
        .checked_add(rdlength)
        .ok_or_else(|| AppError::decode("rdlength overflow"))?;
    if rdata_end > buf.len() {
        return Err(AppError::decode("truncated rdata"));
    }

    let rdata = match rtype {
        RecordType::A => {
            let b = read_bytes(buf, &mut pos, 4)?;
            RData::A(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        }
        RecordType::AAAA => {
            let b = read_bytes(buf, &mut pos, 16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            RData::Aaaa(Ipv6Addr::from(octets))
        }
        RecordType::NS => {
            let (n, new_pos) = read_name(buf, pos)?;
            pos = new_pos;
            RData::Ns(n)
        }
        RecordType::CNAME => {
            let (n, new_pos) = read_name(buf, pos)?;
            pos = new_pos;
            RData::Cname(n)
        }
        RecordType::PTR => {
            let (n, new_pos) = read_name(buf, pos)?;
            pos = new_pos;
            RData::Ptr(n)
        }
        RecordType::MX => {
            let preference = read_u16(buf, &mut pos)?;
            let (exchange, new_pos) = read_name(buf, pos)?;
            pos = new_pos;
            RData::Mx { preference, exchange }
        }
        RecordType::TXT => {
            let mut strings = Vec::new();
            while pos < rdata_end {
                let len = read_u8(buf, &mut pos)? as usize;
                let s = read_bytes(buf, &mut pos, len)?;
                strings.push(String::from_utf8_lossy(s).into_owned());
            }
            RData::Txt(strings)
        }
        RecordType::SOA => {
            let (mname, p1) = read_name(buf, pos)?;
            let (rname, p2) = read_name(buf, p1)?;
            pos = p2;
            let serial = read_u32(buf, &mut pos)?;
            let refresh = read_u32(buf, &mut pos)?;
            let retry = read_u32(buf, &mut pos)?;
            let expire = read_u32(buf, &mut pos)?;
            let minimum = read_u32(buf, &mut pos)?;
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            }
        }
        RecordType::SRV => {
            let priority = read_u16(buf, &mut pos)?;
            let weight = read_u16(buf, &mut pos)?;
            let port = read_u16(buf, &mut pos)?;
            let (target, new_pos) = read_name(buf, pos)?;
            pos = new_pos;
            RData::Srv {
                priority,
                weight,
                port,
                target,
            }
        }
        RecordType::OPT => {
            let mut options = Vec::new();
            if rdata_end > pos {
                options.extend_from_slice(&buf[pos..rdata_end]);
            }
            pos = rdata_end;
            RData::Opt {
                udp_payload_size: rclass_raw,
                extended_rcode: (ttl >> 24) as u8,
                version: ((ttl >> 16) & 0xFF) as u8,
                dnssec_ok: (ttl & 0x8000) != 0,
                options,
            }
        }
        _ => {
            let b = read_bytes(buf, &mut pos, rdlength)?;
            RData::Unknown(b.to_vec())
        }
    };

    // Names inside RDATA (NS/CNAME/PTR/MX/SOA/SRV) may use compression
    // pointers that jump outside [rdata_start, rdata_end), so don't trust the
    // parser's own cursor for resuming the outer record loop — always resume
    // right after the length-prefixed RDATA block.
    let _ = rdata_start;
    let pos = rdata_end;

    let rclass = if matches!(rtype, RecordType::OPT) {
        RecordClass::Other(rclass_raw)
    } else {
        RecordClass::from(rclass_raw)
    };

    Ok((
        Record {
            name,
            rclass,
            ttl,
            rdata,
        },
        pos,
    ))
}

fn write_record(out: &mut Vec<u8>, r: &Record) -> Result<()> {
    write_name(out, &r.name);
    out.extend_from_slice(&r.rtype().to_u16().to_be_bytes());

    match &r.rdata {
        RData::Opt {
            udp_payload_size,
            extended_rcode,
            version,
            dnssec_ok,
            options,
        } => {
            out.extend_from_slice(&udp_payload_size.to_be_bytes());
            let ttl = ((*extended_rcode as u32) << 24)
                | ((*version as u32) << 16)
                | if *dnssec_ok { 0x8000 } else { 0 };
            out.extend_from_slice(&ttl.to_be_bytes());
            out.extend_from_slice(&(options.len() as u16).to_be_bytes());
            out.extend_from_slice(options);
        }
        _ => {
            out.extend_from_slice(&r.rclass.to_u16().to_be_bytes());
            out.extend_from_slice(&r.ttl.to_be_bytes());
            let rdata_pos = out.len();
            out.extend_from_slice(&0u16.to_be_bytes());
            let rdata_start = out.len();
            write_rdata(out, &r.rdata);
            let rdlen = (out.len() - rdata_start) as u16;
            out[rdata_pos..rdata_pos + 2].copy_from_slice(&rdlen.to_be_bytes());
        }
    }
    Ok(())
}

fn write_rdata(out: &mut Vec<u8>, rdata: &RData) {
    match rdata {
        RData::A(ip) => out.extend_from_slice(&ip.octets()),
        RData::Aaaa(ip) => out.extend_from_slice(&ip.octets()),
        RData::Ns(n) | RData::Cname(n) | RData::Ptr(n) => write_name(out, n),
        RData::Mx { preference, exchange } => {
            out.extend_from_slice(&preference.to_be_bytes());
            write_name(out, exchange);
        }
        RData::Txt(strings) => {
            for s in strings {
                let bytes = s.as_bytes();
                let len = bytes.len().min(255);
                out.push(len as u8);
                out.extend_from_slice(&bytes[..len]);
            }
        }
        RData::Soa {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            write_name(out, mname);
            write_name(out, rname);
            out.extend_from_slice(&serial.to_be_bytes());
            out.extend_from_slice(&refresh.to_be_bytes());
            out.extend_from_slice(&retry.to_be_bytes());
            out.extend_from_slice(&expire.to_be_bytes());
            out.extend_from_slice(&minimum.to_be_bytes());
        }
        RData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            out.extend_from_slice(&priority.to_be_bytes());
            out.extend_from_slice(&weight.to_be_bytes());
            out.extend_from_slice(&port.to_be_bytes());
            write_name(out, target);
        }
        RData::Opt { .. } => unreachable!("OPT handled by write_record"),
        RData::Unknown(bytes) => out.extend_from_slice(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::enums::Rcode;

    fn multi_record_message() -> Message {
        let mut m = Message::new_query(0xBEEF, &Name::parse("www.example.com."), RecordType::A);
        m.header.qr = true;
        m.header.rcode = Rcode::NoError;
        m.answers.push(Record {
            name: Name::parse("www.example.com."),
            rclass: RecordClass::In,
            ttl: 300,
            rdata: RData::Cname(Name::parse("example.com.")),
        });
        m.answers.push(Record {
            name: Name::parse("example.com."),
            rclass: RecordClass::In,
            ttl: 300,
            rdata: RData::A(Ipv4Addr::new(93, 184, 216, 34)),
        });
        m.additionals.push(Record::opt_1452());
        m
    }

    #[test]
    fn decode_of_encode_is_identity() {
        let original = multi_record_message();
        let bytes = original.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn set_reply_preserves_id_and_question() {
        let request = Message::new_query(99, &Name::parse("foo.test."), RecordType::AAAA);
        let mut response = Message::nxdomain(&request);
        response.set_reply(&request);
        assert_eq!(response.header.id, request.header.id);
        assert_eq!(response.questions, request.questions);
    }

    #[test]
    fn not_implemented_carries_edns_1452() {
        let request = Message::new_query(1, &Name::parse("foo."), RecordType::Any);
        let response = Message::not_implemented(&request);
        assert_eq!(response.header.rcode, Rcode::NotImp);
        match &response.additionals[0].rdata {
            RData::Opt { udp_payload_size, .. } => assert_eq!(*udp_payload_size, 1452),
            other => panic!("expected OPT record, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(Message::decode(&[0u8; 4]).is_err());
    }
}
