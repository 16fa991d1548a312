use std::{fmt, io::Read};

use crate::io::{Decodeable, Encodeable};

/// A log sequence number: (file, offset) packed into 64 bits. Totally
/// ordered; `Lsn::NULL` sorts below every real LSN.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    pub const NULL: Lsn = Lsn(0);

    /// First LSN ever issued: partition 1, offset 0.
    pub const FIRST: Lsn = Lsn(1 << 32);

    pub fn new(file: u32, offset: u32) -> Self {
        Lsn(((file as u64) << 32) | offset as u64)
    }

    pub fn from_u64(raw: u64) -> Self {
        Lsn(raw)
    }

    pub fn to_u64(&self) -> u64 {
        self.0
    }

    pub fn file(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn offset(&self) -> u32 {
        self.0 as u32
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The LSN `len` bytes further into the same file.
    pub fn advance(&self, len: usize) -> Lsn {
        Lsn::new(self.file(), self.offset() + len as u32)
    }

    /// First valid LSN of the next log file.
    pub fn next_file(&self) -> Lsn {
        Lsn::new(self.file() + 1, 0)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.file(), self.offset())
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.file(), self.offset())
    }
}

impl Encodeable for Lsn {
    fn encode(&self) -> Vec<u8> {
        self.0.encode()
    }
}

impl Decodeable for Lsn {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        Lsn(u64::decode_from(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Lsn::NULL < Lsn::new(1, 0));
        assert!(Lsn::new(1, 100) < Lsn::new(1, 101));
        assert!(Lsn::new(1, 0xffff_ffff) < Lsn::new(2, 0));
    }

    #[test]
    fn test_advance() {
        let lsn = Lsn::new(2, 64);
        assert_eq!(lsn.advance(24), Lsn::new(2, 88));
    }
}
