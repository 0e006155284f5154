//! Stored DNS message model.
//!
//! This is the JSON shape shared by the REST API and the record store: one
//! [`StoredMessage`] is the canned answer for a `(resolver, qtype, qname)`
//! tuple. Record data is kept schemaless at rest and decoded against the
//! record type at response time, so one malformed record never poisons the
//! rest of a stored answer.

use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, PTR, SOA, SRV, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A persisted DNS message: header flags plus question/answer/ns/extra
/// sections, indexed under every resolver id in `resolvers`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Resolver ids this message is indexed under.
    #[serde(default)]
    pub resolvers: Vec<String>,

    /// Header flags applied to synthesized responses.
    #[serde(default)]
    pub header: StoredHeader,

    /// Question section; `question[0]` keys the document.
    #[serde(default)]
    pub question: Vec<DnsQuestion>,

    /// Answer section.
    #[serde(default)]
    pub answer: Vec<DnsRecord>,

    /// Authority section.
    #[serde(default)]
    pub ns: Vec<DnsRecord>,

    /// Additional section.
    #[serde(default)]
    pub extra: Vec<DnsRecord>,
}

impl StoredMessage {
    /// Rewrite a wildcard answer for a concrete query name.
    ///
    /// The question is renamed to `qname`, as is every answer record whose
    /// stored name is empty. Non-empty answer names and the ns/extra
    /// sections are preserved as stored.
    pub fn rewrite_for_wildcard(&mut self, qname: &str) {
        if let Some(question) = self.question.first_mut() {
            question.qname = qname.to_string();
        }
        for record in &mut self.answer {
            if record.name.is_empty() {
                record.name = qname.to_string();
            }
        }
    }
}

/// Header flags of a stored message.
///
/// `id`, `response`, `opcode` and `recursion_desired` are intentionally
/// absent: they are always echoed from the client request. The `zero` bit is
/// carried for API fidelity but the wire encoder keeps Z reserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredHeader {
    #[serde(default)]
    pub authoritative: bool,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub recursion_available: bool,
    #[serde(default)]
    pub zero: bool,
    #[serde(default)]
    pub authenticated_data: bool,
    #[serde(default)]
    pub checking_disabled: bool,
    /// Response code; 0 (NOERROR) when omitted.
    #[serde(default)]
    pub rcode: u16,
}

/// One entry of the question section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsQuestion {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// One stored resource record. `rdata` is decoded against `type` when the
/// record is encoded to wire form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub rr_type: u16,
    #[serde(default = "default_class")]
    pub class: u16,
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub rdata: Value,
}

fn default_class() -> u16 {
    1 // IN
}

/// Why a stored record could not be encoded to wire form.
#[derive(Debug, Error)]
pub enum RdataError {
    /// The record type has no supported rdata mapping.
    #[error("unsupported record type {0}")]
    UnsupportedType(u16),

    /// The stored rdata does not fit the shape its type requires.
    #[error("malformed rdata for type {rtype}: {reason}")]
    Malformed { rtype: u16, reason: String },
}

impl DnsRecord {
    /// Encode this stored record as a wire-format resource record.
    pub fn to_record(&self) -> Result<Record, RdataError> {
        let rdata = decode_rdata(self.rr_type, &self.rdata)?;
        let name = Name::from_ascii(&self.name)
            .map_err(|e| malformed(self.rr_type, e.to_string()))?;
        let mut record = Record::from_rdata(name, self.ttl, rdata);
        record.set_dns_class(dns_class(self.class));
        Ok(record)
    }
}

fn dns_class(class: u16) -> DNSClass {
    match class {
        3 => DNSClass::CH,
        4 => DNSClass::HS,
        254 => DNSClass::NONE,
        255 => DNSClass::ANY,
        _ => DNSClass::IN,
    }
}

/// Decode schemaless rdata against its record type.
fn decode_rdata(rtype: u16, rdata: &Value) -> Result<RData, RdataError> {
    match RecordType::from(rtype) {
        RecordType::A => {
            let ip = rdata
                .as_str()
                .ok_or_else(|| malformed(rtype, "expected IPv4 string"))?;
            let addr = ip
                .parse()
                .map_err(|_| malformed(rtype, "invalid IPv4 address"))?;
            Ok(RData::A(A(addr)))
        }
        RecordType::AAAA => {
            let ip = rdata
                .as_str()
                .ok_or_else(|| malformed(rtype, "expected IPv6 string"))?;
            let addr = ip
                .parse()
                .map_err(|_| malformed(rtype, "invalid IPv6 address"))?;
            Ok(RData::AAAA(AAAA(addr)))
        }
        RecordType::CNAME => Ok(RData::CNAME(CNAME(name_value(rtype, rdata)?))),
        RecordType::NS => Ok(RData::NS(NS(name_value(rtype, rdata)?))),
        RecordType::PTR => Ok(RData::PTR(PTR(name_value(rtype, rdata)?))),
        RecordType::MX => {
            let preference = field_u16(rtype, rdata, "preference")?;
            let mx = field_name(rtype, rdata, "mx")?;
            Ok(RData::MX(MX::new(preference, mx)))
        }
        RecordType::SOA => Ok(RData::SOA(SOA::new(
            field_name(rtype, rdata, "ns")?,
            field_name(rtype, rdata, "mbox")?,
            field_u32(rtype, rdata, "serial")?,
            field_u32(rtype, rdata, "refresh")? as i32,
            field_u32(rtype, rdata, "retry")? as i32,
            field_u32(rtype, rdata, "expire")? as i32,
            field_u32(rtype, rdata, "minttl")?,
        ))),
        RecordType::SRV => Ok(RData::SRV(SRV::new(
            field_u16(rtype, rdata, "priority")?,
            field_u16(rtype, rdata, "weight")?,
            field_u16(rtype, rdata, "port")?,
            field_name(rtype, rdata, "target")?,
        ))),
        RecordType::TXT => {
            let lines = rdata
                .as_array()
                .ok_or_else(|| malformed(rtype, "expected array of strings"))?;
            let texts: Vec<String> = lines
                .iter()
                .map(|line| {
                    line.as_str()
                        .map(String::from)
                        .ok_or_else(|| malformed(rtype, "expected array of strings"))
                })
                .collect::<Result<_, _>>()?;
            Ok(RData::TXT(TXT::new(texts)))
        }
        _ => Err(RdataError::UnsupportedType(rtype)),
    }
}

fn name_value(rtype: u16, value: &Value) -> Result<Name, RdataError> {
    let text = value
        .as_str()
        .ok_or_else(|| malformed(rtype, "expected name string"))?;
    Name::from_ascii(text).map_err(|e| malformed(rtype, e.to_string()))
}

fn field<'a>(rtype: u16, value: &'a Value, key: &str) -> Result<&'a Value, RdataError> {
    value
        .get(key)
        .ok_or_else(|| malformed(rtype, format!("missing field '{key}'")))
}

fn field_name(rtype: u16, value: &Value, key: &str) -> Result<Name, RdataError> {
    name_value(rtype, field(rtype, value, key)?)
}

fn field_u16(rtype: u16, value: &Value, key: &str) -> Result<u16, RdataError> {
    let number = field(rtype, value, key)?
        .as_u64()
        .ok_or_else(|| malformed(rtype, format!("field '{key}' is not an unsigned integer")))?;
    u16::try_from(number).map_err(|_| malformed(rtype, format!("field '{key}' out of range")))
}

fn field_u32(rtype: u16, value: &Value, key: &str) -> Result<u32, RdataError> {
    let number = field(rtype, value, key)?
        .as_u64()
        .ok_or_else(|| malformed(rtype, format!("field '{key}' is not an unsigned integer")))?;
    u32::try_from(number).map_err(|_| malformed(rtype, format!("field '{key}' out of range")))
}

fn malformed(rtype: u16, reason: impl Into<String>) -> RdataError {
    RdataError::Malformed {
        rtype,
        reason: reason.into(),
    }
}
