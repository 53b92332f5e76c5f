//! fixed width label form of DNS names used as kernel map keys

use std::fmt;

use derive_more::{Display, Error};

/// Width of the qname field inside the answer map key. Must stay in sync
/// with the eBPF program; candidates are 256, 128, 96, 64, 48, 32.
pub const PACKED_NAME_LENGTH: usize = 48;

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum PackedNameError {
    #[display(fmt = "illegal empty qname")]
    EmptyName,
    #[display(fmt = "qname too large: '{}', expected less than '{}'", _0, PACKED_NAME_LENGTH)]
    NameTooLong(#[error(not(source))] usize),
}

type Result<T> = std::result::Result<T, PackedNameError>;

/// A DNS name in RFC1035 label form, zero padded to a fixed 48 bytes:
/// each label preceded by its length octet, the sequence closed by a zero
/// octet. No compression. The layout is shared with the kernel program,
/// which compares queries against it bytewise.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PackedName(pub [u8; PACKED_NAME_LENGTH]);

impl Default for PackedName {
    fn default() -> Self {
        PackedName([0u8; PACKED_NAME_LENGTH])
    }
}

impl PackedName {
    /// Pack a text domain name, with or without trailing dot. The encoded
    /// form (length octets, labels and the terminating zero) must fit in
    /// 47 bytes so at least one padding zero remains.
    pub fn pack(qname: &str) -> Result<PackedName> {
        let name = qname.trim_end_matches('.');
        if name.is_empty() {
            return Err(PackedNameError::EmptyName);
        }

        let encoded_len = name.len() + 2;
        if encoded_len > PACKED_NAME_LENGTH - 1 {
            return Err(PackedNameError::NameTooLong(encoded_len));
        }

        let mut packed = PackedName::default();
        let mut pos = 0;
        for label in name.split('.') {
            packed.0[pos] = label.len() as u8;
            pos += 1;
            for b in label.bytes() {
                packed.0[pos] = b.to_ascii_lowercase();
                pos += 1;
            }
        }
        packed.0[pos] = 0;

        Ok(packed)
    }

    /// Inverse of [`PackedName::pack`]; the trailing dot is not restored.
    pub fn unpack(&self) -> Result<String> {
        let mut out = String::new();

        let mut pos = 0;
        loop {
            let len = self.0[pos] as usize;
            if len == 0 {
                break;
            }
            if pos + 1 + len > PACKED_NAME_LENGTH {
                return Err(PackedNameError::NameTooLong(pos + 1 + len));
            }

            if !out.is_empty() {
                out.push('.');
            }
            for b in &self.0[pos + 1..pos + 1 + len] {
                out.push(*b as char);
            }
            pos += 1 + len;
        }

        if out.is_empty() {
            return Err(PackedNameError::EmptyName);
        }

        Ok(out)
    }

    /// Name length in text form if the buffer is well formed, used by dump
    /// helpers only.
    pub fn display_bytes(&self) -> String {
        let mut b = String::new();
        for s in self.0.iter() {
            if *s == 0 {
                break;
            }
            if *s > 32 && *s < 127 {
                b.push(*s as char);
            } else {
                b.push('?');
            }
        }
        b
    }
}

impl fmt::Debug for PackedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackedName({})", self.display_bytes())
    }
}

impl fmt::Display for PackedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unpack() {
            Ok(name) => write!(f, "{}", name),
            Err(_) => write!(f, "<invalid>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrip() {
        let names = [
            "tt.example.net",
            "alpha.tt.example.net.",
            "alpha-01v.lxd.tt.example.net",
            "a.b",
        ];
        for name in names {
            let packed = PackedName::pack(name).unwrap();
            assert_eq!(packed.unpack().unwrap(), name.trim_end_matches('.'));
        }
    }

    #[test]
    fn pack_layout() {
        let packed = PackedName::pack("tt.example.net").unwrap();
        let mut expected = [0u8; PACKED_NAME_LENGTH];
        expected[..16].copy_from_slice(b"\x02tt\x07example\x03net\x00");
        assert_eq!(packed.0, expected);
    }

    #[test]
    fn pack_lowercases() {
        let packed = PackedName::pack("Alpha.TT.Example.NET").unwrap();
        assert_eq!(packed.unpack().unwrap(), "alpha.tt.example.net");
    }

    #[test]
    fn pack_rejects_empty() {
        assert_eq!(PackedName::pack(""), Err(PackedNameError::EmptyName));
        assert_eq!(PackedName::pack("."), Err(PackedNameError::EmptyName));
    }

    #[test]
    fn pack_rejects_long_names() {
        // 45 text chars encode to 47 bytes and still fit
        let fits = format!("{}.{}", "a".repeat(22), "b".repeat(22));
        assert!(PackedName::pack(&fits).is_ok());

        // one more character exceeds the 47 byte bound
        let too_long = format!("{}.{}", "a".repeat(22), "b".repeat(23));
        assert_eq!(
            PackedName::pack(&too_long),
            Err(PackedNameError::NameTooLong(48))
        );
    }
}
