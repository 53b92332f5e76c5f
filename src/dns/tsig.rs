//! TSIG transaction signatures for zone transfer requests (RFC 2845)

use base64::Engine;
use derive_more::{Display, Error, From};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::protocol::{DnsPacket, DnsRecord};

#[derive(Debug, Display, From, Error)]
pub enum TsigError {
    #[display(fmt = "incorrect TSIG string, expected [algo:]name:base64secret")]
    MalformedKey,
    #[display(fmt = "unsupported TSIG algorithm '{}'", _0)]
    #[from(ignore)]
    UnsupportedAlgorithm(#[error(not(source))] String),
    #[display(fmt = "bad base64 secret")]
    BadSecret,
    Protocol(crate::dns::protocol::ProtocolError),
    Buffer(crate::dns::buffer::BufferError),
}

type Result<T> = std::result::Result<T, TsigError>;

/// HMAC algorithms transmitted as domain names. MD5 is long deprecated
/// but some legacy primaries still require it; SHA256 and SHA512 are the
/// preferred choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsigAlgorithm {
    HmacMd5,
    HmacSha1,
    HmacSha224,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl TsigAlgorithm {
    pub fn wire_name(&self) -> &'static str {
        match self {
            TsigAlgorithm::HmacMd5 => "hmac-md5.sig-alg.reg.int",
            TsigAlgorithm::HmacSha1 => "hmac-sha1",
            TsigAlgorithm::HmacSha224 => "hmac-sha224",
            TsigAlgorithm::HmacSha256 => "hmac-sha256",
            TsigAlgorithm::HmacSha384 => "hmac-sha384",
            TsigAlgorithm::HmacSha512 => "hmac-sha512",
        }
    }

    pub fn from_name(name: &str) -> Result<TsigAlgorithm> {
        let canonical = name.trim_end_matches('.').to_lowercase();
        match canonical.as_str() {
            "hmac-md5" | "hmac-md5.sig-alg.reg.int" => Ok(TsigAlgorithm::HmacMd5),
            "hmac-sha1" => Ok(TsigAlgorithm::HmacSha1),
            "hmac-sha224" => Ok(TsigAlgorithm::HmacSha224),
            "hmac-sha256" => Ok(TsigAlgorithm::HmacSha256),
            "hmac-sha384" => Ok(TsigAlgorithm::HmacSha384),
            "hmac-sha512" => Ok(TsigAlgorithm::HmacSha512),
            _ => Err(TsigError::UnsupportedAlgorithm(name.to_string())),
        }
    }

    fn hmac(&self, secret: &[u8], message: &[u8]) -> Vec<u8> {
        fn digest<D>(secret: &[u8], message: &[u8]) -> Vec<u8>
        where
            D: Mac + hmac::digest::KeyInit,
        {
            // hmac accepts keys of any length, new_from_slice cannot fail
            let mut mac =
                <D as hmac::digest::KeyInit>::new_from_slice(secret).unwrap_or_else(|_| unreachable!());
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }

        match self {
            TsigAlgorithm::HmacMd5 => digest::<Hmac<Md5>>(secret, message),
            TsigAlgorithm::HmacSha1 => digest::<Hmac<Sha1>>(secret, message),
            TsigAlgorithm::HmacSha224 => digest::<Hmac<Sha224>>(secret, message),
            TsigAlgorithm::HmacSha256 => digest::<Hmac<Sha256>>(secret, message),
            TsigAlgorithm::HmacSha384 => digest::<Hmac<Sha384>>(secret, message),
            TsigAlgorithm::HmacSha512 => digest::<Hmac<Sha512>>(secret, message),
        }
    }
}

/// A parsed TSIG key in `[algo:]name:base64secret` notation; the
/// algorithm defaults to HMAC-MD5 for interoperability with the legacy
/// primaries this was first deployed against.
#[derive(Debug, Clone)]
pub struct TsigKey {
    pub name: String,
    pub algorithm: TsigAlgorithm,
    pub secret: Vec<u8>,
}

impl TsigKey {
    pub fn parse(key: &str) -> Result<TsigKey> {
        let tags: Vec<&str> = key.split(':').collect();

        let (algorithm, name, secret) = match tags.len() {
            2 => (TsigAlgorithm::HmacMd5, tags[0], tags[1]),
            3 => (TsigAlgorithm::from_name(tags[0])?, tags[1], tags[2]),
            _ => return Err(TsigError::MalformedKey),
        };

        let secret = base64::engine::general_purpose::STANDARD
            .decode(secret)
            .map_err(|_| TsigError::BadSecret)?;

        Ok(TsigKey {
            name: name.trim_end_matches('.').to_lowercase(),
            algorithm,
            secret,
        })
    }

    /// Sign a request packet in place: compute the MAC over the rendered
    /// message followed by the TSIG variables and append the TSIG record
    /// to the additional section.
    pub fn sign(&self, packet: &mut DnsPacket, time_signed: u64, fudge: u16) -> Result<()> {
        let mut rendered = VectorPacketBuffer::new();
        packet.write(&mut rendered, 0xFFFF)?;

        let mut to_digest = rendered.buffer.clone();

        // TSIG variables: key name, class ANY, ttl 0, algorithm, time,
        // fudge, error, other-len. Names go in canonical uncompressed form.
        let mut vars = VectorPacketBuffer::new();
        vars.write_qname(&self.name)?;
        vars.write_u16(255)?;
        vars.write_u32(0)?;
        vars.write_qname(self.algorithm.wire_name())?;
        vars.write_u16((time_signed >> 32) as u16)?;
        vars.write_u32((time_signed & 0xFFFF_FFFF) as u32)?;
        vars.write_u16(fudge)?;
        vars.write_u16(0)?;
        vars.write_u16(0)?;

        to_digest.extend_from_slice(&vars.buffer);

        let mac = self.algorithm.hmac(&self.secret, &to_digest);

        packet.resources.push(DnsRecord::Tsig {
            domain: self.name.clone(),
            algorithm: self.algorithm.wire_name().to_string(),
            time_signed,
            fudge,
            mac,
            original_id: packet.header.id,
            error: 0,
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::{DnsQuestion, QueryType};

    #[test]
    fn parse_key_with_algorithm() {
        let key = TsigKey::parse("hmac-sha256:transfer:aGVsbG8=").unwrap();
        assert_eq!(key.algorithm, TsigAlgorithm::HmacSha256);
        assert_eq!(key.name, "transfer");
        assert_eq!(key.secret, b"hello");
    }

    #[test]
    fn parse_key_defaults_to_md5() {
        let key = TsigKey::parse("transfer:aGVsbG8=").unwrap();
        assert_eq!(key.algorithm, TsigAlgorithm::HmacMd5);
    }

    #[test]
    fn parse_key_rejects_garbage() {
        assert!(TsigKey::parse("justonefield").is_err());
        assert!(TsigKey::parse("a:b:c:d").is_err());
        assert!(TsigKey::parse("transfer:!!notbase64!!").is_err());
    }

    #[test]
    fn sign_appends_tsig_record() {
        let key = TsigKey::parse("hmac-sha256:transfer:aGVsbG8=").unwrap();

        let mut packet = DnsPacket::new();
        packet.header.id = 42;
        packet
            .questions
            .push(DnsQuestion::new("tt.example.net".to_string(), QueryType::Axfr));

        key.sign(&mut packet, 1700000000, 300).unwrap();

        assert_eq!(packet.resources.len(), 1);
        match &packet.resources[0] {
            DnsRecord::Tsig {
                domain,
                algorithm,
                time_signed,
                fudge,
                mac,
                original_id,
                ..
            } => {
                assert_eq!(domain, "transfer");
                assert_eq!(algorithm, "hmac-sha256");
                assert_eq!(*time_signed, 1700000000);
                assert_eq!(*fudge, 300);
                assert_eq!(mac.len(), 32);
                assert_eq!(*original_id, 42);
            }
            other => panic!("expected TSIG record, got {:?}", other),
        }
    }

    #[test]
    fn sign_is_deterministic() {
        let key = TsigKey::parse("hmac-sha512:transfer:aGVsbG8=").unwrap();

        let mac_of = |key: &TsigKey| {
            let mut packet = DnsPacket::new();
            packet.header.id = 7;
            packet
                .questions
                .push(DnsQuestion::new("tt.example.net".to_string(), QueryType::Ixfr));
            key.sign(&mut packet, 1700000000, 300).unwrap();
            match packet.resources.pop() {
                Some(DnsRecord::Tsig { mac, .. }) => mac,
                _ => unreachable!(),
            }
        };

        assert_eq!(mac_of(&key), mac_of(&key));
    }
}
