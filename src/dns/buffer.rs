//! low level byte buffers for reading and writing DNS packets

use std::collections::HashMap;
use std::io::Read;

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    Io(std::io::Error),
    #[display(fmt = "end of buffer")]
    EndOfBuffer,
    #[display(fmt = "limit of {} jumps exceeded", _0)]
    #[from(ignore)]
    TooManyJumps(#[error(not(source))] usize),
    #[display(fmt = "single label exceeds 63 characters")]
    LabelTooLong,
}

type Result<T> = std::result::Result<T, BufferError>;

/// Transport agnostic view of a DNS packet under construction or
/// interpretation. Concrete implementations hold a fixed array, a growable
/// vector or a readable stream.
pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;

    fn find_label(&self, label: &str) -> Option<usize>;
    fn save_label(&mut self, label: &str, pos: usize);

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write_u16((val >> 16) as u16)?;
        self.write_u16((val & 0xFFFF) as u16)
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(((self.read()? as u16) << 8) | (self.read()? as u16))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(((self.read_u16()? as u32) << 16) | (self.read_u16()? as u32))
    }

    /// Write a domain name in label form. Compression is not attempted for
    /// labels that have not been seen; known labels are written as pointers
    /// when the implementation keeps a label cache.
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        let split: Vec<&str> = qname.split('.').filter(|l| !l.is_empty()).collect();

        let mut labels_remaining = &split[..];
        while !labels_remaining.is_empty() {
            let suffix = labels_remaining.join(".");
            if let Some(prev) = self.find_label(&suffix) {
                let jump = (prev as u16) | 0xC000;
                return self.write_u16(jump);
            }

            let pos = self.pos();
            let label = labels_remaining[0];
            if label.len() > 0x3F {
                return Err(BufferError::LabelTooLong);
            }

            self.save_label(&suffix, pos);

            self.write_u8(label.len() as u8)?;
            for b in label.as_bytes() {
                self.write_u8(*b)?;
            }

            labels_remaining = &labels_remaining[1..];
        }

        self.write_u8(0)
    }

    /// Read a domain name, following compression pointers with a bounded
    /// number of jumps.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;

        let max_jumps = 5;
        let mut jumps_performed = 0;

        let mut delim = "";
        loop {
            if jumps_performed > max_jumps {
                return Err(BufferError::TooManyJumps(max_jumps));
            }

            let len = self.get(pos)?;

            // two high bits set indicate a jump to an offset elsewhere
            // in the packet
            if (len & 0xC0) == 0xC0 {
                if !jumped {
                    self.seek(pos + 2)?;
                }

                let b2 = self.get(pos + 1)? as u16;
                let offset = (((len as u16) ^ 0xC0) << 8) | b2;
                pos = offset as usize;

                jumped = true;
                jumps_performed += 1;
                continue;
            }

            pos += 1;

            if len == 0 {
                break;
            }

            outstr.push_str(delim);

            let str_buffer = self.get_range(pos, len as usize)?;
            outstr.push_str(&String::from_utf8_lossy(str_buffer).to_lowercase());

            delim = ".";
            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }
}

/// Fixed size buffer used for UDP datagrams.
pub struct BytePacketBuffer {
    pub buf: [u8; 4096],
    pub pos: usize,
}

impl Default for BytePacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl BytePacketBuffer {
    pub fn new() -> BytePacketBuffer {
        BytePacketBuffer {
            buf: [0; 4096],
            pos: 0,
        }
    }
}

impl PacketBuffer for BytePacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buf[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buf[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buf[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[self.pos] = val;
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[pos] = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;
        Ok(())
    }

    fn find_label(&self, _label: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _label: &str, _pos: usize) {}
}

/// Growable buffer used when the final size is not known up front, such as
/// TCP responses and blob serialization. Keeps a label cache so repeated
/// names compress to pointers.
#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    label_lookup: HashMap<String, usize>,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
            label_lookup: HashMap::new(),
        }
    }

    /// Wrap an already received message, e.g. one length prefixed TCP frame.
    pub fn from_bytes(bytes: Vec<u8>) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: bytes,
            pos: 0,
            label_lookup: HashMap::new(),
        }
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buffer[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buffer[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buffer[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        self.buffer.push(val);
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.buffer[pos] = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;
        Ok(())
    }

    fn find_label(&self, label: &str) -> Option<usize> {
        self.label_lookup.get(label).copied()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        self.label_lookup.insert(label.to_string(), pos);
    }
}

/// Buffer over a readable stream, pulling bytes on demand. All consumed
/// bytes are retained so compression pointers into earlier parts of the
/// message keep working.
pub struct StreamPacketBuffer<'a, T>
where
    T: Read,
{
    pub stream: &'a mut T,
    pub buffer: Vec<u8>,
    pub pos: usize,
}

impl<'a, T> StreamPacketBuffer<'a, T>
where
    T: Read + 'a,
{
    pub fn new(stream: &'a mut T) -> StreamPacketBuffer<'a, T> {
        StreamPacketBuffer {
            stream,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    fn fill(&mut self, upto: usize) -> Result<()> {
        while upto > self.buffer.len() {
            let mut local_buffer = [0; 512];
            let num_read = self.stream.read(&mut local_buffer)?;
            if num_read == 0 {
                return Err(BufferError::EndOfBuffer);
            }
            self.buffer.extend_from_slice(&local_buffer[..num_read]);
        }
        Ok(())
    }
}

impl<'a, T> PacketBuffer for StreamPacketBuffer<'a, T>
where
    T: Read + 'a,
{
    fn read(&mut self) -> Result<u8> {
        self.fill(self.pos + 1)?;
        let res = self.buffer[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.fill(pos + 1)?;
        Ok(self.buffer[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        self.fill(start + len)?;
        Ok(&self.buffer[start..start + len])
    }

    fn write(&mut self, _val: u8) -> Result<()> {
        unimplemented!("writing to a stream buffer is not supported");
    }

    fn set(&mut self, _pos: usize, _val: u8) -> Result<()> {
        unimplemented!("writing to a stream buffer is not supported");
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.fill(self.pos + steps)?;
        self.pos += steps;
        Ok(())
    }

    fn find_label(&self, _label: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _label: &str, _pos: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qname_roundtrip() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("alpha.tt.example.net").unwrap();
        buffer.seek(0).unwrap();

        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!(name, "alpha.tt.example.net");
    }

    #[test]
    fn qname_compression_pointer() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("alpha.tt.example.net").unwrap();
        let first_len = buffer.pos();
        buffer.write_qname("beta.tt.example.net").unwrap();

        // second name shares the tt.example.net suffix and must compress
        assert!(buffer.pos() < first_len * 2);

        buffer.seek(first_len).unwrap();
        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!(name, "beta.tt.example.net");
    }

    #[test]
    fn stream_buffer_reads_on_demand() {
        let mut raw: Vec<u8> = vec![3, b'f', b'o', b'o', 0, 0x12, 0x34];
        let mut cursor = std::io::Cursor::new(&mut raw);
        let mut buffer = StreamPacketBuffer::new(&mut cursor);

        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!(name, "foo");
        assert_eq!(buffer.read_u16().unwrap(), 0x1234);
    }
}
