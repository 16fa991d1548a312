use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::Path,
    sync::{Mutex, MutexGuard},
};

use crate::{error::DbError, types::DbResult};

/// A file handle with typed read/write helpers. The inner `File` is
/// guarded by a mutex so that seek+read pairs stay atomic across
/// threads.
pub struct DbFile {
    file: Mutex<File>,
}

impl DbFile {
    pub fn open<P: AsRef<Path>>(file_path: P) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .open(file_path)?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn get_file(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap()
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> DbResult {
        let mut file = self.get_file();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
            .map_err(|e| DbError::storage(&format!("short read at {}: {}", offset, e)))?;
        Ok(())
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> DbResult {
        let mut file = self.get_file();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    pub fn get_size(&self) -> Result<u64, DbError> {
        let metadata = self.get_file().metadata()?;
        Ok(metadata.len())
    }

    pub fn set_len(&self, len: u64) -> DbResult {
        self.get_file().set_len(len)?;
        Ok(())
    }

    /// fsync: data and metadata to the platter.
    pub fn sync(&self) -> DbResult {
        self.get_file().sync_all()?;
        Ok(())
    }

    pub fn sync_data(&self) -> DbResult {
        self.get_file().sync_data()?;
        Ok(())
    }
}

pub fn read_exact<R: Read>(reader: &mut R, bytes_count: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .unwrap_or_else(|_| panic!("io error, expect {} bytes", bytes_count));
    buffer
}

pub struct SmallWriter {
    buf: Vec<u8>,
}

impl SmallWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable + ?Sized>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }
}

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable {
    fn decode_from<R: Read>(reader: &mut R) -> Self;
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        u8::decode_from(reader) == 1
    }
}

/// # Format
///
/// - 2 bytes: length (LE)
/// - n bytes: payload
impl Encodeable for [u8] {
    fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(2 + self.len());
        let len = self.len() as u16;
        buffer.extend_from_slice(&len.to_le_bytes());
        buffer.extend_from_slice(self);
        buffer
    }
}

impl Encodeable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.as_slice().encode()
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let len = u16::decode_from(reader);
        read_exact(reader, len as usize)
    }
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: Read>(reader: &mut R) -> Self {
                    let bytes = read_exact(reader, size_of::<Self>());
                    Self::from_le_bytes(bytes.try_into().unwrap())
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, i32, i64);

/// Read a little-endian value out of a byte slice at the given offset.
pub fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub fn get_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

pub fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let v: u64 = 0xdead_beef_0102_0304;
        let bytes = v.encode();
        let mut reader = std::io::Cursor::new(bytes);
        assert_eq!(u64::decode_from(&mut reader), v);
    }

    #[test]
    fn test_vec_round_trip() {
        let v: Vec<u8> = b"k00001".to_vec();
        let bytes = v.encode();
        let mut reader = std::io::Cursor::new(bytes);
        let back = Vec::<u8>::decode_from(&mut reader);
        assert_eq!(back, v);
    }
}
