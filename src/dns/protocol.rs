//! implements the DNS protocol in a transport agnostic fashion

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
    #[display(fmt = "unsupported record type '{}'", _0)]
    #[from(ignore)]
    UnsupportedType(#[error(not(source))] String),
    #[display(fmt = "malformed record line '{}'", _0)]
    #[from(ignore)]
    MalformedRecord(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// `QueryType` represents the requested record type of a query.
///
/// Unknown types retain their numeric id so they survive a read/write
/// round trip unchanged.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueryType {
    Unknown(u16),
    A,     // 1
    Ns,    // 2
    Cname, // 5
    Soa,   // 6
    Mx,    // 15
    Txt,   // 16
    Aaaa,  // 28
    Opt,   // 41
    Tsig,  // 250
    Ixfr,  // 251
    Axfr,  // 252
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Opt => 41,
            QueryType::Tsig => 250,
            QueryType::Ixfr => 251,
            QueryType::Axfr => 252,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            41 => QueryType::Opt,
            250 => QueryType::Tsig,
            251 => QueryType::Ixfr,
            252 => QueryType::Axfr,
            _ => QueryType::Unknown(num),
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<QueryType> {
        match s {
            "A" => Some(QueryType::A),
            "NS" => Some(QueryType::Ns),
            "CNAME" => Some(QueryType::Cname),
            "SOA" => Some(QueryType::Soa),
            "MX" => Some(QueryType::Mx),
            "TXT" => Some(QueryType::Txt),
            "AAAA" => Some(QueryType::Aaaa),
            _ => None,
        }
    }

    pub fn mnemonic(&self) -> String {
        match *self {
            QueryType::A => "A".to_string(),
            QueryType::Ns => "NS".to_string(),
            QueryType::Cname => "CNAME".to_string(),
            QueryType::Soa => "SOA".to_string(),
            QueryType::Mx => "MX".to_string(),
            QueryType::Txt => "TXT".to_string(),
            QueryType::Aaaa => "AAAA".to_string(),
            QueryType::Opt => "OPT".to_string(),
            QueryType::Tsig => "TSIG".to_string(),
            QueryType::Ixfr => "IXFR".to_string(),
            QueryType::Axfr => "AXFR".to_string(),
            QueryType::Unknown(x) => format!("TYPE{}", x),
        }
    }
}

/// DNS opcodes; this control plane only ever originates queries and
/// answers notifies.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Opcode {
    Query,  // 0
    Notify, // 4
    Update, // 5
    Unknown(u8),
}

impl Opcode {
    pub fn from_num(num: u8) -> Opcode {
        match num {
            0 => Opcode::Query,
            4 => Opcode::Notify,
            5 => Opcode::Update,
            _ => Opcode::Unknown(num),
        }
    }

    pub fn to_num(&self) -> u8 {
        match *self {
            Opcode::Query => 0,
            Opcode::Notify => 4,
            Opcode::Update => 5,
            Opcode::Unknown(x) => x,
        }
    }
}

/// TTL wrapper that is transparent to equality, ordering and hashing, so
/// two records differing only in TTL collapse to the same set entry.
#[derive(Copy, Clone, Debug, Eq, Serialize, Deserialize)]
pub struct TransientTtl(pub u32);

impl PartialEq<TransientTtl> for TransientTtl {
    fn eq(&self, _: &TransientTtl) -> bool {
        true
    }
}

impl PartialOrd<TransientTtl> for TransientTtl {
    fn partial_cmp(&self, other: &TransientTtl) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransientTtl {
    fn cmp(&self, _: &TransientTtl) -> std::cmp::Ordering {
        std::cmp::Ordering::Equal
    }
}

impl Hash for TransientTtl {
    fn hash<H>(&self, _: &mut H)
    where
        H: Hasher,
    {
        // purposely left empty
    }
}

/// `DnsRecord` is the primary representation of a DNS record
///
/// This enumeration is used for reading and writing records, from the
/// network as well as from blob files (text presentation form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DnsRecord {
    Unknown {
        domain: String,
        qtype: u16,
        data_len: u16,
        ttl: TransientTtl,
    }, // 0
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: TransientTtl,
    }, // 1
    Ns {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 2
    Cname {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 5
    Soa {
        domain: String,
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: TransientTtl,
    }, // 6
    Mx {
        domain: String,
        priority: u16,
        host: String,
        ttl: TransientTtl,
    }, // 15
    Txt {
        domain: String,
        data: String,
        ttl: TransientTtl,
    }, // 16
    Aaaa {
        domain: String,
        addr: Ipv6Addr,
        ttl: TransientTtl,
    }, // 28
    Tsig {
        domain: String,
        algorithm: String,
        time_signed: u64,
        fudge: u16,
        mac: Vec<u8>,
        original_id: u16,
        error: u16,
    }, // 250
}

impl DnsRecord {
    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let _class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;

        match qtype {
            QueryType::A => {
                let raw_addr = buffer.read_u32()?;
                let addr = Ipv4Addr::new(
                    ((raw_addr >> 24) & 0xFF) as u8,
                    ((raw_addr >> 16) & 0xFF) as u8,
                    ((raw_addr >> 8) & 0xFF) as u8,
                    (raw_addr & 0xFF) as u8,
                );

                Ok(DnsRecord::A {
                    domain,
                    addr,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Aaaa => {
                let raw_addr1 = buffer.read_u32()?;
                let raw_addr2 = buffer.read_u32()?;
                let raw_addr3 = buffer.read_u32()?;
                let raw_addr4 = buffer.read_u32()?;
                let addr = Ipv6Addr::new(
                    ((raw_addr1 >> 16) & 0xFFFF) as u16,
                    (raw_addr1 & 0xFFFF) as u16,
                    ((raw_addr2 >> 16) & 0xFFFF) as u16,
                    (raw_addr2 & 0xFFFF) as u16,
                    ((raw_addr3 >> 16) & 0xFFFF) as u16,
                    (raw_addr3 & 0xFFFF) as u16,
                    ((raw_addr4 >> 16) & 0xFFFF) as u16,
                    (raw_addr4 & 0xFFFF) as u16,
                );

                Ok(DnsRecord::Aaaa {
                    domain,
                    addr,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Ns => {
                let mut ns = String::new();
                buffer.read_qname(&mut ns)?;

                Ok(DnsRecord::Ns {
                    domain,
                    host: ns,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Cname => {
                let mut cname = String::new();
                buffer.read_qname(&mut cname)?;

                Ok(DnsRecord::Cname {
                    domain,
                    host: cname,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Soa => {
                let mut m_name = String::new();
                buffer.read_qname(&mut m_name)?;

                let mut r_name = String::new();
                buffer.read_qname(&mut r_name)?;

                let serial = buffer.read_u32()?;
                let refresh = buffer.read_u32()?;
                let retry = buffer.read_u32()?;
                let expire = buffer.read_u32()?;
                let minimum = buffer.read_u32()?;

                Ok(DnsRecord::Soa {
                    domain,
                    m_name,
                    r_name,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Mx => {
                let priority = buffer.read_u16()?;
                let mut mx = String::new();
                buffer.read_qname(&mut mx)?;

                Ok(DnsRecord::Mx {
                    domain,
                    priority,
                    host: mx,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Txt => {
                let mut txt = String::new();

                let cur_pos = buffer.pos();
                txt.push_str(&String::from_utf8_lossy(
                    buffer.get_range(cur_pos, data_len as usize)?,
                ));

                buffer.step(data_len as usize)?;

                Ok(DnsRecord::Txt {
                    domain,
                    data: txt,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Tsig => {
                let mut algorithm = String::new();
                buffer.read_qname(&mut algorithm)?;

                let time_high = buffer.read_u16()? as u64;
                let time_low = buffer.read_u32()? as u64;
                let fudge = buffer.read_u16()?;

                let mac_len = buffer.read_u16()? as usize;
                let cur_pos = buffer.pos();
                let mac = buffer.get_range(cur_pos, mac_len)?.to_vec();
                buffer.step(mac_len)?;

                let original_id = buffer.read_u16()?;
                let error = buffer.read_u16()?;
                let other_len = buffer.read_u16()? as usize;
                buffer.step(other_len)?;

                Ok(DnsRecord::Tsig {
                    domain,
                    algorithm,
                    time_signed: (time_high << 32) | time_low,
                    fudge,
                    mac,
                    original_id,
                    error,
                })
            }
            _ => {
                buffer.step(data_len as usize)?;

                Ok(DnsRecord::Unknown {
                    domain,
                    qtype: qtype_num,
                    data_len,
                    ttl: TransientTtl(ttl),
                })
            }
        }
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        match *self {
            DnsRecord::A {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::A.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;
                buffer.write_u16(4)?;

                for octet in &addr.octets() {
                    buffer.write_u8(*octet)?;
                }
            }
            DnsRecord::Aaaa {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Aaaa.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;
                buffer.write_u16(16)?;

                for octet in &addr.segments() {
                    buffer.write_u16(*octet)?;
                }
            }
            DnsRecord::Ns {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Ns.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(host)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Cname {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Cname.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(host)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Soa {
                ref domain,
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Soa.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(m_name)?;
                buffer.write_qname(r_name)?;
                buffer.write_u32(serial)?;
                buffer.write_u32(refresh)?;
                buffer.write_u32(retry)?;
                buffer.write_u32(expire)?;
                buffer.write_u32(minimum)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Mx {
                ref domain,
                priority,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Mx.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_u16(priority)?;
                buffer.write_qname(host)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Txt {
                ref domain,
                ref data,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Txt.to_num())?;
                buffer.write_u16(1)?;
                buffer.write_u32(ttl)?;
                buffer.write_u16(data.len() as u16)?;

                for b in data.as_bytes() {
                    buffer.write_u8(*b)?;
                }
            }
            DnsRecord::Tsig {
                ref domain,
                ref algorithm,
                time_signed,
                fudge,
                ref mac,
                original_id,
                error,
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Tsig.to_num())?;
                // TSIG carries class ANY and zero TTL
                buffer.write_u16(255)?;
                buffer.write_u32(0)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(algorithm)?;
                buffer.write_u16((time_signed >> 32) as u16)?;
                buffer.write_u32((time_signed & 0xFFFF_FFFF) as u32)?;
                buffer.write_u16(fudge)?;
                buffer.write_u16(mac.len() as u16)?;
                for b in mac {
                    buffer.write_u8(*b)?;
                }
                buffer.write_u16(original_id)?;
                buffer.write_u16(error)?;
                buffer.write_u16(0)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Unknown { .. } => {
                log::debug!("skipping unknown record on write: {:?}", self);
            }
        }

        Ok(buffer.pos() - start_pos)
    }

    /// Parse a record from one line of text presentation form, as found in
    /// blob files and transferred zone text:
    ///
    /// ```text
    /// alpha.tt.example.net.  600  IN  A  10.0.0.1
    /// ```
    ///
    /// The class column is optional and the ttl defaults to zero when
    /// absent. Domain names are stored without the trailing dot.
    pub fn from_presentation(line: &str) -> Result<DnsRecord> {
        let mut tokens = line.split_whitespace().peekable();

        let domain = tokens
            .next()
            .ok_or_else(|| ProtocolError::MalformedRecord(line.to_string()))?
            .trim_end_matches('.')
            .to_lowercase();

        let mut ttl = 0;
        if let Some(tok) = tokens.peek() {
            if let Ok(parsed) = tok.parse::<u32>() {
                ttl = parsed;
                tokens.next();
            }
        }

        if let Some(tok) = tokens.peek() {
            if tok.eq_ignore_ascii_case("IN") {
                tokens.next();
            }
        }

        let qtype_str = tokens
            .next()
            .ok_or_else(|| ProtocolError::MalformedRecord(line.to_string()))?
            .to_uppercase();
        let qtype = QueryType::from_mnemonic(&qtype_str)
            .ok_or_else(|| ProtocolError::UnsupportedType(qtype_str.clone()))?;

        let mut next_field = || {
            tokens
                .next()
                .ok_or_else(|| ProtocolError::MalformedRecord(line.to_string()))
        };

        match qtype {
            QueryType::A => {
                let addr = next_field()?
                    .parse::<Ipv4Addr>()
                    .map_err(|_| ProtocolError::MalformedRecord(line.to_string()))?;
                Ok(DnsRecord::A {
                    domain,
                    addr,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Aaaa => {
                let addr = next_field()?
                    .parse::<Ipv6Addr>()
                    .map_err(|_| ProtocolError::MalformedRecord(line.to_string()))?;
                Ok(DnsRecord::Aaaa {
                    domain,
                    addr,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Ns => Ok(DnsRecord::Ns {
                domain,
                host: next_field()?.trim_end_matches('.').to_lowercase(),
                ttl: TransientTtl(ttl),
            }),
            QueryType::Cname => Ok(DnsRecord::Cname {
                domain,
                host: next_field()?.trim_end_matches('.').to_lowercase(),
                ttl: TransientTtl(ttl),
            }),
            QueryType::Mx => {
                let priority = next_field()?
                    .parse::<u16>()
                    .map_err(|_| ProtocolError::MalformedRecord(line.to_string()))?;
                Ok(DnsRecord::Mx {
                    domain,
                    priority,
                    host: next_field()?.trim_end_matches('.').to_lowercase(),
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Txt => Ok(DnsRecord::Txt {
                domain,
                data: next_field()?.trim_matches('"').to_string(),
                ttl: TransientTtl(ttl),
            }),
            QueryType::Soa => {
                let m_name = next_field()?.trim_end_matches('.').to_lowercase();
                let r_name = next_field()?.trim_end_matches('.').to_lowercase();
                let mut numbers = [0u32; 5];
                for slot in numbers.iter_mut() {
                    *slot = next_field()?
                        .parse::<u32>()
                        .map_err(|_| ProtocolError::MalformedRecord(line.to_string()))?;
                }
                Ok(DnsRecord::Soa {
                    domain,
                    m_name,
                    r_name,
                    serial: numbers[0],
                    refresh: numbers[1],
                    retry: numbers[2],
                    expire: numbers[3],
                    minimum: numbers[4],
                    ttl: TransientTtl(ttl),
                })
            }
            _ => Err(ProtocolError::UnsupportedType(qtype_str)),
        }
    }

    pub fn get_querytype(&self) -> QueryType {
        match *self {
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::Aaaa { .. } => QueryType::Aaaa,
            DnsRecord::Ns { .. } => QueryType::Ns,
            DnsRecord::Cname { .. } => QueryType::Cname,
            DnsRecord::Soa { .. } => QueryType::Soa,
            DnsRecord::Mx { .. } => QueryType::Mx,
            DnsRecord::Txt { .. } => QueryType::Txt,
            DnsRecord::Tsig { .. } => QueryType::Tsig,
            DnsRecord::Unknown { qtype, .. } => QueryType::Unknown(qtype),
        }
    }

    pub fn get_domain(&self) -> Option<String> {
        match *self {
            DnsRecord::A { ref domain, .. }
            | DnsRecord::Aaaa { ref domain, .. }
            | DnsRecord::Ns { ref domain, .. }
            | DnsRecord::Cname { ref domain, .. }
            | DnsRecord::Soa { ref domain, .. }
            | DnsRecord::Mx { ref domain, .. }
            | DnsRecord::Txt { ref domain, .. }
            | DnsRecord::Tsig { ref domain, .. }
            | DnsRecord::Unknown { ref domain, .. } => Some(domain.clone()),
        }
    }

    pub fn get_ttl(&self) -> u32 {
        match *self {
            DnsRecord::A {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Aaaa {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Ns {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Cname {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Soa {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Mx {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Txt {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Unknown {
                ttl: TransientTtl(ttl),
                ..
            } => ttl,
            DnsRecord::Tsig { .. } => 0,
        }
    }
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DnsRecord::A {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => write!(f, "{}.\t{}\tIN\tA\t{}", domain, ttl, addr),
            DnsRecord::Aaaa {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => write!(f, "{}.\t{}\tIN\tAAAA\t{}", domain, ttl, addr),
            DnsRecord::Ns {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => write!(f, "{}.\t{}\tIN\tNS\t{}.", domain, ttl, host),
            DnsRecord::Cname {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => write!(f, "{}.\t{}\tIN\tCNAME\t{}.", domain, ttl, host),
            DnsRecord::Mx {
                ref domain,
                priority,
                ref host,
                ttl: TransientTtl(ttl),
            } => write!(f, "{}.\t{}\tIN\tMX\t{} {}.", domain, ttl, priority, host),
            DnsRecord::Txt {
                ref domain,
                ref data,
                ttl: TransientTtl(ttl),
            } => write!(f, "{}.\t{}\tIN\tTXT\t\"{}\"", domain, ttl, data),
            DnsRecord::Soa {
                ref domain,
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ttl: TransientTtl(ttl),
            } => write!(
                f,
                "{}.\t{}\tIN\tSOA\t{}. {}. {} {} {} {} {}",
                domain, ttl, m_name, r_name, serial, refresh, retry, expire, minimum
            ),
            DnsRecord::Tsig {
                ref domain,
                ref algorithm,
                ..
            } => write!(f, "{}.\t0\tANY\tTSIG\t{}.", domain, algorithm),
            DnsRecord::Unknown {
                ref domain,
                qtype,
                ttl: TransientTtl(ttl),
                ..
            } => write!(f, "{}.\t{}\tIN\tTYPE{}\t\\# 0", domain, ttl, qtype),
        }
    }
}

/// The result code for a DNS response
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::NOERROR,
        }
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn binary_len(&self) -> usize {
        12
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | (self.opcode << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.rescode as u8)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

/// Representation of a DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion { name, qtype }
    }

    pub fn binary_len(&self) -> usize {
        self.name
            .split('.')
            .map(|x| x.len() + 1)
            .fold(1, |x, y| x + y)
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;

        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(1)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?); // qtype
        let _ = buffer.read_u16()?; // class

        Ok(())
    }
}

/// Representation of a complete DNS packet
///
/// Read and written in a single operation; used by the transfer client,
/// the SOA probe and the NOTIFY responder.
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new("".to_string(), QueryType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            let rec = DnsRecord::read(buffer)?;
            result.answers.push(rec);
        }
        for _ in 0..result.header.authoritative_entries {
            let rec = DnsRecord::read(buffer)?;
            result.authorities.push(rec);
        }
        for _ in 0..result.header.resource_entries {
            let rec = DnsRecord::read(buffer)?;
            result.resources.push(rec);
        }

        Ok(result)
    }

    pub fn soa_from_answer(&self) -> Option<&DnsRecord> {
        self.answers
            .iter()
            .find(|rec| matches!(rec, DnsRecord::Soa { .. }))
    }

    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();

        // counts are recomputed below; a packet may be rendered more
        // than once, e.g. for the TSIG digest and then for the wire
        self.header.answers = 0;
        self.header.authoritative_entries = 0;
        self.header.resource_entries = 0;

        let mut size = self.header.binary_len();
        for question in &self.questions {
            size += question.binary_len();
            question.write(&mut test_buffer)?;
        }

        let mut record_count = self.answers.len() + self.authorities.len() + self.resources.len();

        for (i, rec) in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .enumerate()
        {
            size += rec.write(&mut test_buffer)?;
            if size > max_size {
                record_count = i;
                self.header.truncated_message = true;
                break;
            } else if i < self.answers.len() {
                self.header.answers += 1;
            } else if i < self.answers.len() + self.authorities.len() {
                self.header.authoritative_entries += 1;
            } else {
                self.header.resource_entries += 1;
            }
        }

        self.header.questions = self.questions.len() as u16;

        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .take(record_count)
        {
            rec.write(buffer)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::buffer::PacketBuffer;
    use crate::dns::buffer::VectorPacketBuffer;

    #[test]
    fn test_packet_roundtrip() {
        let mut packet = DnsPacket::new();
        packet.header.id = 1337;
        packet.header.response = true;

        packet
            .questions
            .push(DnsQuestion::new("tt.example.net".to_string(), QueryType::Soa));
        packet.answers.push(DnsRecord::Soa {
            domain: "tt.example.net".to_string(),
            m_name: "ns3.example.net".to_string(),
            r_name: "sysadmin.example.net".to_string(),
            serial: 2017041755,
            refresh: 900,
            retry: 600,
            expire: 3600000,
            minimum: 300,
            ttl: TransientTtl(600),
        });
        packet.answers.push(DnsRecord::Aaaa {
            domain: "alpha.tt.example.net".to_string(),
            addr: "2a02:6b8:b010:a4fc::a00a".parse().unwrap(),
            ttl: TransientTtl(602),
        });

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, 0xFFFF).unwrap();

        buffer.seek(0).unwrap();

        let parsed = DnsPacket::from_buffer(&mut buffer).unwrap();

        assert_eq!(packet.questions[0], parsed.questions[0]);
        assert_eq!(packet.answers[0], parsed.answers[0]);
        assert_eq!(packet.answers[1], parsed.answers[1]);
    }

    #[test]
    fn test_presentation_roundtrip() {
        let lines = [
            "alpha.tt.example.net.\t600\tIN\tA\t10.0.0.1",
            "alpha-01v.lxd.tt.example.net.\t617\tIN\tAAAA\t2a02:6b8:c0e:125:0:433f:1:101",
            "tt.example.net.\t172801\tIN\tNS\tns3.example.net.",
            "tt.example.net.\t600\tIN\tSOA\tns3.example.net. sysadmin.example.net. 2017041755 900 600 3600000 300",
        ];

        for line in lines {
            let rec = DnsRecord::from_presentation(line).unwrap();
            assert_eq!(rec.to_string(), line);
        }
    }

    #[test]
    fn test_presentation_without_class() {
        let rec = DnsRecord::from_presentation("beta.tt.example.net 600 A 10.0.0.2").unwrap();
        match rec {
            DnsRecord::A {
                ref domain, addr, ..
            } => {
                assert_eq!(domain, "beta.tt.example.net");
                assert_eq!(addr, "10.0.0.2".parse::<std::net::Ipv4Addr>().unwrap());
            }
            _ => panic!("expected A record"),
        }
    }

    #[test]
    fn test_presentation_unsupported_type() {
        assert!(matches!(
            DnsRecord::from_presentation("x.tt.example.net. 600 IN SRV 0 5 443 y.example.net."),
            Err(ProtocolError::UnsupportedType(_))
        ));
    }
}
