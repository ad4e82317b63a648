//! バイトI/O能力
//!
//! コアが直接ファイルシステムに触れないよう、ディスクイメージと
//! サスペンドファイルへのアクセスはすべてこのトレイト経由で行う。
//! ハンドルのcloseはDropで表現する。

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::rc::Rc;

/// 開かれたバイトストリーム（read/write/seek + 長さ変更）
pub trait ByteStream: Read + Write + Seek {
    /// ストリーム長を変更（縮小時は切り詰め）
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// 書き込み可能か
    fn is_writable(&self) -> bool;

    /// 先頭から全体を読み込む
    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        self.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        self.read_to_end(&mut data)?;
        Ok(data)
    }

    /// 指定位置に書き込む
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)?;
        self.flush()
    }

    /// 指定位置から読み込む
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }
}

/// 名前でストリームを開く能力
pub trait Storage {
    /// 既存のストリームを開く（書き込み不可なら読み取り専用で開く）
    fn open(&self, name: &str) -> io::Result<Box<dyn ByteStream>>;

    /// 新規作成（既存なら空にする）
    fn create(&self, name: &str) -> io::Result<Box<dyn ByteStream>>;
}

//--------------------------------------------------
// ファイル実装
//--------------------------------------------------

/// std::fs を使うストレージ
#[derive(Debug, Clone, Default)]
pub struct FileStorage {
    base: Option<PathBuf>,
}

impl FileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 相対名を解決するベースディレクトリを指定
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        FileStorage { base: Some(base.into()) }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        match &self.base {
            Some(base) => base.join(name),
            None => PathBuf::from(name),
        }
    }
}

struct FileStream {
    file: File,
    writable: bool,
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "stream is read-only"));
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ByteStream for FileStream {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Storage for FileStorage {
    fn open(&self, name: &str) -> io::Result<Box<dyn ByteStream>> {
        let path = self.resolve(name);
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => Ok(Box::new(FileStream { file, writable: true })),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                log::info!("{} opened read-only", path.display());
                let file = File::open(&path)?;
                Ok(Box::new(FileStream { file, writable: false }))
            }
            Err(e) => Err(e),
        }
    }

    fn create(&self, name: &str) -> io::Result<Box<dyn ByteStream>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.resolve(name))?;
        Ok(Box::new(FileStream { file, writable: true }))
    }
}

//--------------------------------------------------
// メモリ実装
//--------------------------------------------------

type SharedBytes = Rc<RefCell<Vec<u8>>>;

/// 名前 → バイト列のインメモリストレージ（テストやホスト埋め込み用）
#[derive(Default, Clone)]
pub struct MemoryStorage {
    files: Rc<RefCell<HashMap<String, SharedBytes>>>,
    read_only: Rc<RefCell<HashSet<String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内容を登録（既存は置き換え）
    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.files
            .borrow_mut()
            .insert(name.to_string(), Rc::new(RefCell::new(data)));
    }

    /// 読み取り専用として扱う名前を指定
    pub fn set_read_only(&self, name: &str, read_only: bool) {
        let mut set = self.read_only.borrow_mut();
        if read_only {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// 現在の内容のコピー
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(name).map(|d| d.borrow().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.borrow().contains_key(name)
    }
}

struct MemoryStream {
    data: SharedBytes,
    pos: u64,
    writable: bool,
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.borrow();
        let mut cursor = Cursor::new(data.as_slice());
        cursor.set_position(self.pos);
        let n = cursor.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "stream is read-only"));
        }
        let mut data = self.data.borrow_mut();
        let mut cursor = Cursor::new(&mut *data);
        cursor.set_position(self.pos);
        let n = cursor.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.borrow().len() as i64;
        let next = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => len + d,
        };
        if next < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.pos = next as u64;
        Ok(self.pos)
    }
}

impl ByteStream for MemoryStream {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.data.borrow_mut().resize(len as usize, 0);
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Storage for MemoryStorage {
    fn open(&self, name: &str) -> io::Result<Box<dyn ByteStream>> {
        let data = self
            .files
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{}: not found", name)))?;
        let writable = !self.read_only.borrow().contains(name);
        Ok(Box::new(MemoryStream { data, pos: 0, writable }))
    }

    fn create(&self, name: &str) -> io::Result<Box<dyn ByteStream>> {
        if self.read_only.borrow().contains(name) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, format!("{}: read-only", name)));
        }
        let data: SharedBytes = Rc::new(RefCell::new(Vec::new()));
        self.files.borrow_mut().insert(name.to_string(), data.clone());
        Ok(Box::new(MemoryStream { data, pos: 0, writable: true }))
    }
}
