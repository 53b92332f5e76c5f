//! client side of the transfer wire: SOA probe, AXFR/IXFR, HTTP fetch

use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::dns::buffer::{BytePacketBuffer, VectorPacketBuffer};
use crate::dns::protocol::{
    DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode, TransientTtl,
};
use crate::dns::tsig::TsigKey;

/// Dial and read bounds for transfer connections. These are the only retry
/// boundary: on timeout the caller decides whether the next tick retries.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_secs(20);

/// HTTP zone fetches are bounded much tighter, the endpoint is local.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(crate::dns::protocol::ProtocolError),
    Buffer(crate::dns::buffer::BufferError),
    Tsig(crate::dns::tsig::TsigError),
    Io(std::io::Error),
    Http(reqwest::Error),
    #[display(fmt = "no address resolved for '{}'", _0)]
    #[from(ignore)]
    NoAddress(#[error(not(source))] String),
    #[display(fmt = "response code {:?}", _0)]
    #[from(ignore)]
    ErrorResponse(#[error(not(source))] ResultCode),
    #[display(fmt = "answer section empty")]
    NoAnswer,
    #[display(fmt = "answer not authoritative")]
    NotAuthoritative,
    #[display(fmt = "malformed transfer: {}", _0)]
    #[from(ignore)]
    BadTransfer(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, ClientError>;

/// How zone content travels from the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Axfr,
    Ixfr,
    Http,
    None,
    Unknown,
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferMode::Axfr => "AXFR",
            TransferMode::Ixfr => "IXFR",
            TransferMode::Http => "HTTP",
            TransferMode::None => "NONE",
            TransferMode::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

/// Options for one transfer call. IXFR additionally carries the last
/// known SOA triple, which is sent in the authority section so the
/// primary can compute the delta.
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub mode: Option<TransferMode>,
    pub serial: u32,
    pub ns: String,
    pub mbox: String,

    /// optional TSIG key in `[algo:]name:base64secret` form
    pub key: Option<String>,
}

/// SOA fields a probe returns; fed back into IXFR requests.
#[derive(Debug, Clone)]
pub struct SoaInfo {
    pub serial: u32,
    pub ns: String,
    pub mbox: String,
}

fn server_addr(server: &str) -> Result<SocketAddr> {
    let candidate = if server.contains(':') && !server.contains("]:") && server.matches(':').count() > 1
    {
        // bare IPv6 literal
        format!("[{}]:53", server)
    } else if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:53", server)
    };

    candidate
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ClientError::NoAddress(server.to_string()))
}

/// Ask the primary for the current SOA of a zone. The probe goes over UDP
/// with RD unset and falls back to TCP when the answer comes back
/// truncated; a recursor answering non-authoritatively is rejected.
pub fn soa_probe(server: &str, zone: &str) -> Result<SoaInfo> {
    let id = "(client) (soa)";

    let addr = server_addr(server)?;

    let mut packet = DnsPacket::new();
    packet.header.id = rand::random::<u16>();
    packet
        .questions
        .push(DnsQuestion::new(zone.trim_end_matches('.').to_string(), QueryType::Soa));

    let mut req_buffer = BytePacketBuffer::new();
    packet.write(&mut req_buffer, 512)?;

    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_read_timeout(Some(DIAL_TIMEOUT))?;
    socket.send_to(&req_buffer.buf[0..req_buffer.pos], addr)?;

    let mut res_buffer = BytePacketBuffer::new();
    socket.recv_from(&mut res_buffer.buf)?;

    let mut response = DnsPacket::from_buffer(&mut res_buffer)?;

    if response.header.truncated_message {
        log::debug!("{} truncated response from '{}', retrying over tcp", id, server);
        response = exchange_tcp(addr, &packet)?;
    }

    if response.header.rescode != ResultCode::NOERROR {
        return Err(ClientError::ErrorResponse(response.header.rescode));
    }

    if !response.header.authoritative_answer {
        return Err(ClientError::NotAuthoritative);
    }

    match response.soa_from_answer() {
        Some(DnsRecord::Soa {
            serial, m_name, r_name, ..
        }) => Ok(SoaInfo {
            serial: *serial,
            ns: m_name.clone(),
            mbox: r_name.clone(),
        }),
        _ => Err(ClientError::NoAnswer),
    }
}

fn exchange_tcp(addr: SocketAddr, request: &DnsPacket) -> Result<DnsPacket> {
    let mut stream = TcpStream::connect_timeout(&addr, DIAL_TIMEOUT)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut packet = request.clone();
    write_message(&mut stream, &mut packet)?;

    let frame = read_frame(&mut stream)?;
    let mut buffer = VectorPacketBuffer::from_bytes(frame);
    Ok(DnsPacket::from_buffer(&mut buffer)?)
}

fn write_message(stream: &mut TcpStream, packet: &mut DnsPacket) -> Result<()> {
    let mut buffer = VectorPacketBuffer::new();
    packet.write(&mut buffer, 0xFFFF)?;

    let len = buffer.buffer.len() as u16;
    stream.write_all(&[(len >> 8) as u8, (len & 0xFF) as u8])?;
    stream.write_all(&buffer.buffer)?;
    stream.flush()?;

    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut len_bytes = [0u8; 2];
    stream.read_exact(&mut len_bytes)?;
    let len = (((len_bytes[0] as u16) << 8) | (len_bytes[1] as u16)) as usize;

    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame)?;

    Ok(frame)
}

/// Transfer a zone over TCP.
///
/// The answer streams of all received messages are concatenated; reading
/// stops when the record list closes with the bracketing SOA (serial equal
/// to the opening one) or the primary closes the connection. The caller
/// interprets the stream as AXFR or IXFR.
pub fn transfer(server: &str, zone: &str, options: &TransferOptions) -> Result<Vec<DnsRecord>> {
    let id = "(client) (transfer)";

    let addr = server_addr(server)?;

    let mode = options.mode.unwrap_or(TransferMode::Axfr);

    let mut packet = DnsPacket::new();
    packet.header.id = rand::random::<u16>();

    let qtype = match mode {
        TransferMode::Ixfr => QueryType::Ixfr,
        _ => QueryType::Axfr,
    };
    packet
        .questions
        .push(DnsQuestion::new(zone.trim_end_matches('.').to_string(), qtype));

    if mode == TransferMode::Ixfr {
        // the authority SOA tells the primary where our copy stands
        packet.authorities.push(DnsRecord::Soa {
            domain: zone.trim_end_matches('.').to_string(),
            m_name: options.ns.trim_end_matches('.').to_string(),
            r_name: options.mbox.trim_end_matches('.').to_string(),
            serial: options.serial,
            refresh: 0,
            retry: 0,
            expire: 0,
            minimum: 0,
            ttl: TransientTtl(0),
        });
    }

    if let Some(ref raw) = options.key {
        if !raw.is_empty() {
            let key = TsigKey::parse(raw)?;
            let now = chrono::Utc::now().timestamp() as u64;
            key.sign(&mut packet, now, 300)?;
            log::debug!("{} request signed with key:'{}'", id, key.name);
        }
    }

    log::debug!(
        "{} zone:'{}' mode:'{}' serial:'{}' via '{}'",
        id,
        zone,
        mode,
        options.serial,
        server
    );

    let mut stream = TcpStream::connect_timeout(&addr, DIAL_TIMEOUT)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    write_message(&mut stream, &mut packet)?;

    let mut out: Vec<DnsRecord> = Vec::new();
    let mut bracket_serial: Option<u32> = None;

    loop {
        let frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(ClientError::Io(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof && !out.is_empty() =>
            {
                // primary closed the stream after the final envelope
                break;
            }
            Err(e) => return Err(e),
        };

        let mut buffer = VectorPacketBuffer::from_bytes(frame);
        let response = DnsPacket::from_buffer(&mut buffer)?;

        if response.header.rescode != ResultCode::NOERROR {
            return Err(ClientError::ErrorResponse(response.header.rescode));
        }

        for rec in response.answers {
            if matches!(rec, DnsRecord::Tsig { .. }) {
                continue;
            }
            out.push(rec);
        }

        if bracket_serial.is_none() {
            match out.first() {
                Some(DnsRecord::Soa { serial, .. }) => bracket_serial = Some(*serial),
                Some(other) => {
                    return Err(ClientError::BadTransfer(format!(
                        "first record is not SOA: {}",
                        other
                    )))
                }
                None => continue,
            }
        }

        if out.len() > 1 {
            if let Some(DnsRecord::Soa { serial, .. }) = out.last() {
                if Some(*serial) == bracket_serial {
                    break;
                }
            }
        }
    }

    log::debug!("{} zone:'{}' received rr:'{}'", id, zone, out.len());

    Ok(out)
}

/// Fetch zone text from an HTTP endpoint (POST `{"zone": ...}`) or, for
/// `file:///` prefixed endpoints, straight from the filesystem.
pub fn fetch_zone_text(endpoint: &str, zone: &str) -> Result<String> {
    let id = "(client) (http)";

    if let Some(path) = endpoint.strip_prefix("file:///") {
        log::debug!("{} reading zone:'{}' from file:'/{}'", id, zone, path);
        return Ok(std::fs::read_to_string(format!("/{}", path))?);
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()?;

    let body = serde_json::json!({ "zone": zone });

    let response = client
        .post(endpoint)
        .json(&body)
        .header("User-Agent", concat!("xdpdns/", env!("CARGO_PKG_VERSION")))
        .send()?
        .error_for_status()?;

    let text = response.text()?;
    log::debug!(
        "{} received zone:'{}' bytes:'{}' via '{}'",
        id,
        zone,
        text.len(),
        endpoint
    );

    Ok(text)
}

/// Parse transferred or fetched zone text into records, tolerant of
/// comments and blank lines. Lines carrying record types outside the
/// supported set are skipped with a log entry.
pub fn parse_zone_text(data: &str) -> Result<Vec<DnsRecord>> {
    let mut records = Vec::new();

    for row in data.lines() {
        let row = row.trim();
        if row.is_empty() || row.starts_with(';') {
            continue;
        }

        match DnsRecord::from_presentation(row) {
            Ok(rec) => records.push(rec),
            Err(crate::dns::protocol::ProtocolError::UnsupportedType(t)) => {
                log::debug!("(client) (parse) skipping record of type '{}'", t);
            }
            Err(e) => return Err(ClientError::Protocol(e)),
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_zone_text_skips_comments_and_unknown() {
        let text = "\
; zone dump
tt.example.net.\t600\tIN\tSOA\tns3.example.net. sysadmin.example.net. 2017041755 900 600 3600000 300

alpha.tt.example.net.\t600\tIN\tA\t10.0.0.1
_sip._tcp.tt.example.net. 600 IN SRV 0 5 5060 sip.tt.example.net.
beta.tt.example.net.\t600\tIN\tA\t10.0.0.2
";
        let records = parse_zone_text(text).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], DnsRecord::Soa { .. }));
    }

    #[test]
    fn server_addr_appends_default_port() {
        assert_eq!(server_addr("127.0.0.1").unwrap().port(), 53);
        assert_eq!(server_addr("127.0.0.1:5353").unwrap().port(), 5353);
        assert_eq!(server_addr("2001:db8::1").unwrap().port(), 53);
    }
}
