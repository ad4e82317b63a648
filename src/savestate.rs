//! セーブステート機能
//!
//! 実行状態をバイナリ形式で保存・復元する。
//! 形式: ASCIIヘッダ → CPUレコード → メモリレコード → スロットレコード群。
//! 各レコードは同じマジックバイトで前後を挟む。

use std::io;

/// ファイル先頭のヘッダトークン
pub const STATE_HEADER: &[u8; 8] = b"A2SAVE01";

/// レコードのマジックバイト
pub mod magic {
    pub const CPU: u8 = 0xC5;
    pub const MEMORY: u8 = 0x3A;
    pub const SLOT: u8 = 0x51;
    pub const DRIVE: u8 = 0xD5;
    pub const END: u8 = 0xEE;
}

#[derive(Debug)]
pub enum SaveStateError {
    Io(io::Error),
    BadHeader {
        found: Vec<u8>,
    },
    BadMagic {
        record: &'static str,
        expected: u8,
        found: u8,
    },
    UnexpectedEof {
        context: &'static str,
    },
    InvalidValue {
        context: &'static str,
        value: u64,
    },
    SlotMismatch {
        slot: u8,
        detail: String,
    },
    Image(crate::image::DiskImageError),
}

impl SaveStateError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "SAV001",
            Self::BadHeader { .. } => "SAV002",
            Self::BadMagic { .. } => "SAV003",
            Self::UnexpectedEof { .. } => "SAV004",
            Self::InvalidValue { .. } => "SAV005",
            Self::SlotMismatch { .. } => "SAV006",
            Self::Image(_) => "SAV007",
        }
    }
}

impl std::fmt::Display for SaveStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "[{}] I/O error: {}", self.code(), err),
            Self::BadHeader { found } => {
                write!(f, "[{}] not a saved state (header {:02X?})", self.code(), found)
            }
            Self::BadMagic {
                record,
                expected,
                found,
            } => write!(
                f,
                "[{}] {} record: expected magic 0x{:02X}, found 0x{:02X}",
                self.code(),
                record,
                expected,
                found
            ),
            Self::UnexpectedEof { context } => {
                write!(f, "[{}] unexpected end of state: {}", self.code(), context)
            }
            Self::InvalidValue { context, value } => {
                write!(f, "[{}] invalid {}: {}", self.code(), context, value)
            }
            Self::SlotMismatch { slot, detail } => {
                write!(f, "[{}] slot {}: {}", self.code(), slot, detail)
            }
            Self::Image(err) => write!(f, "[{}] disk image: {}", self.code(), err),
        }
    }
}

impl std::error::Error for SaveStateError {}

impl From<io::Error> for SaveStateError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<crate::image::DiskImageError> for SaveStateError {
    fn from(value: crate::image::DiskImageError) -> Self {
        Self::Image(value)
    }
}

//--------------------------------------------------
// 書き込み
//--------------------------------------------------

/// リトルエンディアンの固定幅レコードを組み立てる
#[derive(Debug, Default)]
pub struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 長さ(u32) + 本体
    pub fn put_blob(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_blob(s.as_bytes());
    }
}

//--------------------------------------------------
// 読み込み
//--------------------------------------------------

pub struct StateReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining_len(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn read_exact(&mut self, len: usize, context: &'static str) -> Result<&'a [u8], SaveStateError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(SaveStateError::UnexpectedEof { context })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self, context: &'static str) -> Result<u8, SaveStateError> {
        Ok(self.read_exact(1, context)?[0])
    }

    pub fn read_bool(&mut self, context: &'static str) -> Result<bool, SaveStateError> {
        match self.read_u8(context)? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(SaveStateError::InvalidValue {
                context,
                value: v as u64,
            }),
        }
    }

    pub fn read_u16(&mut self, context: &'static str) -> Result<u16, SaveStateError> {
        let s = self.read_exact(2, context)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }

    pub fn read_u32(&mut self, context: &'static str) -> Result<u32, SaveStateError> {
        let s = self.read_exact(4, context)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn read_u64(&mut self, context: &'static str) -> Result<u64, SaveStateError> {
        let s = self.read_exact(8, context)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(s);
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_blob(&mut self, context: &'static str) -> Result<&'a [u8], SaveStateError> {
        let len = self.read_u32(context)? as usize;
        self.read_exact(len, context)
    }

    pub fn read_str(&mut self, context: &'static str) -> Result<String, SaveStateError> {
        let bytes = self.read_blob(context)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SaveStateError::InvalidValue {
            context,
            value: bytes.len() as u64,
        })
    }

    /// レコード境界のマジックを確認
    pub fn expect_magic(&mut self, record: &'static str, expected: u8) -> Result<(), SaveStateError> {
        let found = self.read_u8(record)?;
        if found != expected {
            return Err(SaveStateError::BadMagic {
                record,
                expected,
                found,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_fields() {
        let mut w = StateWriter::new();
        w.put_u8(magic::CPU);
        w.put_u16(0xBEEF);
        w.put_u64(123_456_789);
        w.put_bool(true);
        w.put_str("disk.woz");
        w.put_u8(magic::CPU);
        let bytes = w.into_bytes();

        let mut r = StateReader::new(&bytes);
        r.expect_magic("cpu", magic::CPU).unwrap();
        assert_eq!(r.read_u16("pc").unwrap(), 0xBEEF);
        assert_eq!(r.read_u64("cycles").unwrap(), 123_456_789);
        assert!(r.read_bool("flag").unwrap());
        assert_eq!(r.read_str("name").unwrap(), "disk.woz");
        r.expect_magic("cpu", magic::CPU).unwrap();
        assert_eq!(r.remaining_len(), 0);
    }

    #[test]
    fn test_bad_magic_and_eof() {
        let bytes = [0x00u8, 0x01];
        let mut r = StateReader::new(&bytes);
        assert!(matches!(
            r.expect_magic("memory", magic::MEMORY),
            Err(SaveStateError::BadMagic { found: 0x00, .. })
        ));
        assert!(matches!(r.read_u32("x"), Err(SaveStateError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_invalid_bool() {
        let bytes = [7u8];
        let mut r = StateReader::new(&bytes);
        assert!(matches!(r.read_bool("b"), Err(SaveStateError::InvalidValue { value: 7, .. })));
    }
}
