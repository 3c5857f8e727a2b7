//! Resource records and their typed payloads.

use std::net::{Ipv4Addr, Ipv6Addr};

use super::enums::{RecordClass, RecordType};
use super::question::Name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(Name),
    Cname(Name),
    Ptr(Name),
    Mx { preference: u16, exchange: Name },
    Txt(Vec<String>),
    Soa {
        mname: Name,
        rname: Name,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    Opt {
        udp_payload_size: u16,
        extended_rcode: u8,
        version: u8,
        dnssec_ok: bool,
        options: Vec<u8>,
    },
    Unknown(Vec<u8>),
}

impl RData {
    pub fn record_type(&self) -> RecordType {
        match self {
            RData::A(_) => RecordType::A,
            RData::Aaaa(_) => RecordType::AAAA,
            RData::Ns(_) => RecordType::NS,
            RData::Cname(_) => RecordType::CNAME,
            RData::Ptr(_) => RecordType::PTR,
            RData::Mx { .. } => RecordType::MX,
            RData::Txt(_) => RecordType::TXT,
            RData::Soa { .. } => RecordType::SOA,
            RData::Srv { .. } => RecordType::SRV,
            RData::Opt { .. } => RecordType::OPT,
            RData::Unknown(_) => RecordType::Other(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: Name,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub rdata: RData,
}

impl Record {
    pub fn rtype(&self) -> RecordType {
        self.rdata.record_type()
    }

    /// Builds the EDNS0 OPT pseudo-record synthesized replies attach, with a
    /// fixed UDP payload size of 1452 bytes (matched exactly by a testable
    /// property; do not parameterize this per deployment).
    pub fn opt_1452() -> Record {
        Record {
            name: Name::root(),
            rclass: RecordClass::Other(1452),
            ttl: 0,
            rdata: RData::Opt {
                udp_payload_size: 1452,
                extended_rcode: 0,
                version: 0,
                dnssec_ok: false,
                options: Vec::new(),
            },
        }
    }
}
