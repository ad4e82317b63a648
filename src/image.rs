//! ディスクイメージ（DSK / PO / NIB / WOZ）
//!
//! どの形式もトラック単位のビットストリームとして扱う。
//! トラックは初回アクセス時に読み込み、書き込まれたトラックは
//! ダーティとして元の形式でイメージへ書き戻す。

use crate::gcr::{self, SectorOrder, BYTES_PER_TRACK, DSK_SIZE, NIB_SIZE, NIB_TRACK_SIZE, TRACKS};
use crate::storage::{ByteStream, Storage};
use crate::woz::{self, WozError, WozInfo, NO_TRACK, TMAP_SIZE};
use std::io::{self, Read, Seek, SeekFrom};

/// ディスクイメージ形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// DOS 3.3順のセクタイメージ
    Dsk,
    /// ProDOS順のセクタイメージ
    Po,
    /// 35トラック × 6656バイトの生ニブル
    Nib,
    /// WOZ 1/2
    Woz,
}

impl ImageFormat {
    /// 拡張子から判定
    pub fn from_name(name: &str) -> Option<Self> {
        let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "dsk" | "do" => Some(ImageFormat::Dsk),
            "po" => Some(ImageFormat::Po),
            "nib" => Some(ImageFormat::Nib),
            "woz" => Some(ImageFormat::Woz),
            _ => None,
        }
    }

    /// 内容（先頭4バイトとサイズ）から判定
    pub fn from_content(head: &[u8], size: u64) -> Option<Self> {
        if head.starts_with(woz::WOZ1_MAGIC) || head.starts_with(woz::WOZ2_MAGIC) {
            Some(ImageFormat::Woz)
        } else if size == DSK_SIZE as u64 {
            Some(ImageFormat::Dsk)
        } else if size == NIB_SIZE as u64 {
            Some(ImageFormat::Nib)
        } else {
            None
        }
    }

    fn sector_order(self) -> SectorOrder {
        match self {
            ImageFormat::Po => SectorOrder::ProDos,
            _ => SectorOrder::Dos,
        }
    }
}

#[derive(Debug)]
pub enum DiskImageError {
    Io(io::Error),
    UnknownFormat { name: String, size: u64 },
    Woz(WozError),
    Gcr(gcr::GcrError),
    NoSuchTrack { index: usize },
    /// ドライブにディスクがない
    NoDisk { drive: usize },
    /// 書き戻せなかったトラック（最初の原因つき）
    Unflushed {
        tracks: Vec<usize>,
        first: Box<DiskImageError>,
    },
}

impl std::fmt::Display for DiskImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::UnknownFormat { name, size } => {
                write!(f, "{}: unrecognised disk image ({} bytes)", name, size)
            }
            Self::Woz(err) => write!(f, "{}", err),
            Self::Gcr(err) => write!(f, "{}", err),
            Self::NoSuchTrack { index } => write!(f, "no track {}", index),
            Self::NoDisk { drive } => write!(f, "no disk in drive {}", drive + 1),
            Self::Unflushed { tracks, first } => {
                write!(f, "tracks {:?} not written back: {}", tracks, first)
            }
        }
    }
}

impl std::error::Error for DiskImageError {}

impl From<io::Error> for DiskImageError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<WozError> for DiskImageError {
    fn from(value: WozError) -> Self {
        Self::Woz(value)
    }
}

impl From<gcr::GcrError> for DiskImageError {
    fn from(value: gcr::GcrError) -> Self {
        Self::Gcr(value)
    }
}

/// 読み込み済みトラックのビット列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackBits {
    pub bits: Vec<u8>,
    pub bit_count: u32,
}

/// トラック記述子
#[derive(Debug, Clone)]
struct Track {
    /// イメージ内の位置と長さ
    offset: u64,
    byte_len: usize,
    /// WOZで既知のビット数（セクタイメージは読み込むまで不明）
    bit_count: u32,
    loaded: Option<TrackBits>,
    dirty: bool,
}

impl Track {
    fn at(offset: u64, byte_len: usize, bit_count: u32) -> Self {
        Track {
            offset,
            byte_len,
            bit_count,
            loaded: None,
            dirty: false,
        }
    }
}

pub struct DiskImage {
    name: String,
    format: ImageFormat,
    stream: Box<dyn ByteStream>,
    info: WozInfo,
    tmap: [u8; TMAP_SIZE],
    /// TRKインデックス順（セクタ/NIBはトラック番号順）
    tracks: Vec<Option<Track>>,
    meta: Option<String>,
}

/// セクタ/NIBイメージ用の標準的なクォータートラック対応
fn standard_tmap() -> [u8; TMAP_SIZE] {
    let mut tmap = [NO_TRACK; TMAP_SIZE];
    for (q, entry) in tmap.iter_mut().enumerate() {
        let track = (q + 1) / 4;
        if q % 4 != 2 && track < TRACKS {
            *entry = track as u8;
        }
    }
    tmap
}

impl DiskImage {
    /// ストレージから名前で開く
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self, DiskImageError> {
        let stream = storage.open(name)?;
        Self::from_stream(name, stream)
    }

    /// 開いたストリームから形式を判定して構築
    pub fn from_stream(name: &str, mut stream: Box<dyn ByteStream>) -> Result<Self, DiskImageError> {
        let size = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(0))?;
        let mut head = [0u8; 4];
        let got = stream.read(&mut head)?;

        let format = ImageFormat::from_content(&head[..got], size)
            .filter(|f| *f == ImageFormat::Woz || ImageFormat::from_name(name) != Some(ImageFormat::Woz))
            .map(|f| match (f, ImageFormat::from_name(name)) {
                // 拡張子で.poを区別する
                (ImageFormat::Dsk, Some(ImageFormat::Po)) => ImageFormat::Po,
                _ => f,
            })
            .ok_or_else(|| DiskImageError::UnknownFormat {
                name: name.to_string(),
                size,
            })?;

        let writable = stream.is_writable();
        let mut image = DiskImage {
            name: name.to_string(),
            format,
            stream,
            info: WozInfo::default(),
            tmap: standard_tmap(),
            tracks: Vec::new(),
            meta: None,
        };

        match format {
            ImageFormat::Dsk | ImageFormat::Po => {
                image.tracks = (0..TRACKS)
                    .map(|t| Some(Track::at((t * BYTES_PER_TRACK) as u64, BYTES_PER_TRACK, 0)))
                    .collect();
            }
            ImageFormat::Nib => {
                image.tracks = (0..TRACKS)
                    .map(|t| {
                        Some(Track::at(
                            (t * NIB_TRACK_SIZE) as u64,
                            NIB_TRACK_SIZE,
                            (NIB_TRACK_SIZE * 8) as u32,
                        ))
                    })
                    .collect();
            }
            ImageFormat::Woz => {
                let data = image.stream.read_all()?;
                let container = woz::parse(&data)?;
                image.info = container.info;
                image.tmap = container.tmap;
                image.meta = container.meta;
                image.tracks = container
                    .tracks
                    .iter()
                    .map(|loc| loc.map(|l| Track::at(l.offset as u64, l.byte_len, l.bit_count)))
                    .collect();
            }
        }
        if !writable {
            image.info.write_protected = true;
        }

        log::info!("Disk image {} opened as {:?}", name, format);
        Ok(image)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn info(&self) -> &WozInfo {
        &self.info
    }

    pub fn meta(&self) -> Option<&str> {
        self.meta.as_deref()
    }

    pub fn is_write_protected(&self) -> bool {
        self.info.write_protected
    }

    /// ビットセル長（125ns単位）
    pub fn bit_timing(&self) -> u64 {
        match self.info.optimal_bit_timing {
            0 => 32,
            t => t as u64,
        }
    }

    /// クォータートラック → トラックインデックス
    pub fn track_index(&self, quarter: usize) -> Option<usize> {
        match self.tmap.get(quarter) {
            Some(&NO_TRACK) | None => None,
            Some(&i) => Some(i as usize),
        }
    }

    /// トラックを必要なら読み込む
    pub fn load_track(&mut self, index: usize) -> Result<&TrackBits, DiskImageError> {
        let format = self.format;
        let order = format.sector_order();
        let track = self
            .tracks
            .get_mut(index)
            .and_then(|t| t.as_mut())
            .ok_or(DiskImageError::NoSuchTrack { index })?;

        if track.loaded.is_none() {
            let mut raw = vec![0u8; track.byte_len];
            self.stream.read_at(track.offset, &mut raw)?;
            let bits = match format {
                ImageFormat::Dsk | ImageFormat::Po => {
                    let (bits, bit_count) = gcr::encode_track(&raw, index as u8, gcr::DEFAULT_VOLUME, order);
                    TrackBits { bits, bit_count }
                }
                ImageFormat::Nib => {
                    let (bits, bit_count) = gcr::nibbles_to_bits(&raw);
                    TrackBits { bits, bit_count }
                }
                ImageFormat::Woz => TrackBits {
                    bits: raw,
                    bit_count: track.bit_count,
                },
            };
            track.bit_count = bits.bit_count;
            log::debug!("{}: loaded track {} ({} bits)", self.name, index, bits.bit_count);
            track.loaded = Some(bits);
        }

        track
            .loaded
            .as_ref()
            .ok_or(DiskImageError::NoSuchTrack { index })
    }

    /// 読み込み済みのトラック
    pub fn track(&self, index: usize) -> Option<&TrackBits> {
        self.tracks.get(index)?.as_ref()?.loaded.as_ref()
    }

    /// 書き込み用に借用し、ダーティにする
    pub fn track_mut(&mut self, index: usize) -> Option<&mut TrackBits> {
        let track = self.tracks.get_mut(index)?.as_mut()?;
        let bits = track.loaded.as_mut()?;
        track.dirty = true;
        Some(bits)
    }

    pub fn is_dirty(&self) -> bool {
        self.tracks.iter().flatten().any(|t| t.dirty)
    }

    /// 読み込み済みトラックを解放（ダーティなら先に書き戻す）
    pub fn evict(&mut self, index: usize) -> Result<(), DiskImageError> {
        let dirty = matches!(self.tracks.get(index), Some(Some(t)) if t.dirty);
        if dirty {
            self.flush()?;
        }
        if let Some(Some(track)) = self.tracks.get_mut(index) {
            track.loaded = None;
        }
        Ok(())
    }

    pub fn loaded_track_count(&self) -> usize {
        self.tracks.iter().flatten().filter(|t| t.loaded.is_some()).count()
    }

    /// ダーティなトラックを元の形式で書き戻す
    pub fn flush(&mut self) -> Result<(), DiskImageError> {
        if !self.is_dirty() {
            return Ok(());
        }
        match self.format {
            ImageFormat::Dsk | ImageFormat::Po => self.flush_sectors()?,
            ImageFormat::Nib => self.flush_nibbles()?,
            ImageFormat::Woz => self.flush_woz()?,
        }
        log::info!("{}: flushed", self.name);
        Ok(())
    }

    fn flush_sectors(&mut self) -> Result<(), DiskImageError> {
        let order = self.format.sector_order();
        let mut failed = Vec::new();
        let mut first = None;
        for (index, slot) in self.tracks.iter_mut().enumerate() {
            let Some(track) = slot.as_mut().filter(|t| t.dirty) else {
                continue;
            };
            // 失敗したトラックだけダーティのまま残す
            if let Some(bits) = &track.loaded {
                let written = match gcr::decode_track(&bits.bits, bits.bit_count as usize, index as u8, order) {
                    Ok(sectors) => self.stream.write_at(track.offset, &sectors).map_err(DiskImageError::from),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = written {
                    log::warn!("{}: track {}: {}", self.name, index, e);
                    failed.push(index);
                    first.get_or_insert(e);
                    continue;
                }
            }
            track.dirty = false;
        }
        match first {
            None => Ok(()),
            Some(first) => Err(DiskImageError::Unflushed {
                tracks: failed,
                first: Box::new(first),
            }),
        }
    }

    fn flush_nibbles(&mut self) -> Result<(), DiskImageError> {
        for slot in self.tracks.iter_mut() {
            let Some(track) = slot.as_mut().filter(|t| t.dirty) else {
                continue;
            };
            if let Some(bits) = &track.loaded {
                let mut nibbles = gcr::latch_nibbles(&bits.bits, bits.bit_count as usize, 1);
                nibbles.resize(NIB_TRACK_SIZE, 0xFF);
                self.stream.write_at(track.offset, &nibbles)?;
            }
            track.dirty = false;
        }
        Ok(())
    }

    fn flush_woz(&mut self) -> Result<(), DiskImageError> {
        let bytes = self.to_woz_bytes()?;
        // 書き込みが済んでから長さを合わせる
        self.stream.write_at(0, &bytes)?;
        self.stream.set_len(bytes.len() as u64)?;

        // 配置が変わるので位置を更新する
        let container = woz::parse(&bytes)?;
        for (slot, loc) in self.tracks.iter_mut().zip(container.tracks.iter()) {
            if let (Some(track), Some(loc)) = (slot.as_mut(), loc) {
                track.offset = loc.offset as u64;
                track.byte_len = loc.byte_len;
                track.bit_count = loc.bit_count;
                track.dirty = false;
            }
        }
        Ok(())
    }

    /// 全トラックを読み込んでWOZ2コンテナにする
    pub fn to_woz_bytes(&mut self) -> Result<Vec<u8>, DiskImageError> {
        for index in 0..self.tracks.len() {
            if self.tracks[index].is_some() {
                self.load_track(index)?;
            }
        }
        let tracks: Vec<Option<(&[u8], u32)>> = self
            .tracks
            .iter()
            .map(|t| {
                t.as_ref()
                    .and_then(|t| t.loaded.as_ref())
                    .map(|b| (b.bits.as_slice(), b.bit_count))
            })
            .collect();

        let meta = match (&self.meta, self.format) {
            (Some(meta), _) => meta.clone(),
            (None, ImageFormat::Woz) => String::new(),
            (None, _) => format!(
                "title\t{}\nimage_date\t{}",
                self.name,
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ")
            ),
        };
        let meta = (!meta.is_empty()).then_some(meta);
        Ok(woz::write(&self.info, &self.tmap, &tracks, meta.as_deref()))
    }

    /// 全トラックをデコードしてセクタイメージにする
    pub fn export_sectors(&mut self, order: SectorOrder) -> Result<Vec<u8>, DiskImageError> {
        let mut out = Vec::with_capacity(DSK_SIZE);
        for t in 0..TRACKS {
            let index = self
                .track_index(t * 4)
                .ok_or(DiskImageError::NoSuchTrack { index: t })?;
            let bits = self.load_track(index)?;
            out.extend(gcr::decode_track(&bits.bits, bits.bit_count as usize, t as u8, order)?);
        }
        Ok(out)
    }
}

impl Drop for DiskImage {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("{}: unable to write back changes: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::cell::RefCell;
    use std::io::{self, Read, Seek};
    use std::rc::Rc;

    pub(crate) fn sample_dsk() -> Vec<u8> {
        let mut data = vec![0u8; DSK_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = ((i / 256) as u8).wrapping_mul(7) ^ (i as u8);
        }
        data
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ImageFormat::from_name("game.DSK"), Some(ImageFormat::Dsk));
        assert_eq!(ImageFormat::from_name("prodos.po"), Some(ImageFormat::Po));
        assert_eq!(ImageFormat::from_name("noext"), None);
        assert_eq!(ImageFormat::from_content(b"WOZ2", 1000), Some(ImageFormat::Woz));
        assert_eq!(ImageFormat::from_content(&[0; 4], NIB_SIZE as u64), Some(ImageFormat::Nib));
        assert_eq!(ImageFormat::from_content(&[0; 4], 1234), None);
    }

    #[test]
    fn test_open_rejects_unknown() {
        let storage = MemoryStorage::new();
        storage.insert("junk.bin", vec![1, 2, 3]);
        assert!(matches!(
            DiskImage::open(&storage, "junk.bin"),
            Err(DiskImageError::UnknownFormat { size: 3, .. })
        ));
    }

    #[test]
    fn test_tmap_for_sector_image() {
        let storage = MemoryStorage::new();
        storage.insert("a.dsk", sample_dsk());
        let image = DiskImage::open(&storage, "a.dsk").unwrap();
        assert_eq!(image.track_index(0), Some(0));
        assert_eq!(image.track_index(1), Some(0));
        assert_eq!(image.track_index(2), None);
        assert_eq!(image.track_index(3), Some(1));
        assert_eq!(image.track_index(4 * 34), Some(34));
        assert_eq!(image.track_index(4 * 34 + 2), None);
        assert_eq!(image.track_index(4 * 35), None);
    }

    #[test]
    fn test_lazy_load_and_export() {
        let storage = MemoryStorage::new();
        let dsk = sample_dsk();
        storage.insert("a.po", dsk.clone());
        let mut image = DiskImage::open(&storage, "a.po").unwrap();
        assert_eq!(image.format(), ImageFormat::Po);
        assert_eq!(image.loaded_track_count(), 0);
        image.load_track(5).unwrap();
        assert_eq!(image.loaded_track_count(), 1);
        image.evict(5).unwrap();
        assert_eq!(image.loaded_track_count(), 0);

        assert_eq!(image.export_sectors(SectorOrder::ProDos).unwrap(), dsk);
    }

    #[test]
    fn test_dirty_track_written_back_to_dsk() {
        let storage = MemoryStorage::new();
        storage.insert("w.dsk", vec![0u8; DSK_SIZE]);
        let mut image = DiskImage::open(&storage, "w.dsk").unwrap();
        image.load_track(2).unwrap();

        let mut sectors = vec![0u8; BYTES_PER_TRACK];
        sectors[256..512].fill(0x5A);
        let (bits, bit_count) = gcr::encode_track(&sectors, 2, gcr::DEFAULT_VOLUME, SectorOrder::Dos);
        *image.track_mut(2).unwrap() = TrackBits { bits, bit_count };
        assert!(image.is_dirty());
        image.flush().unwrap();
        assert!(!image.is_dirty());

        let saved = storage.contents("w.dsk").unwrap();
        let base = 2 * BYTES_PER_TRACK;
        assert!(saved[base + 256..base + 512].iter().all(|b| *b == 0x5A));
        assert!(saved[base..base + 256].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_undecodable_track_keeps_image() {
        let storage = MemoryStorage::new();
        storage.insert("bad.dsk", vec![0x11u8; DSK_SIZE]);
        let mut image = DiskImage::open(&storage, "bad.dsk").unwrap();
        image.load_track(0).unwrap();
        image.track_mut(0).unwrap().bits.fill(0);
        match image.flush() {
            Err(DiskImageError::Unflushed { tracks, first }) => {
                assert_eq!(tracks, vec![0]);
                assert!(matches!(*first, DiskImageError::Gcr(gcr::GcrError::MissingSectors { .. })));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(image.is_dirty());
        assert!(storage.contents("bad.dsk").unwrap().iter().all(|b| *b == 0x11));
        // Dropでのフラッシュ失敗はログのみ
        drop(image);
    }

    #[test]
    fn test_bad_track_does_not_stop_other_tracks() {
        let storage = MemoryStorage::new();
        storage.insert("mix.dsk", vec![0u8; DSK_SIZE]);
        let mut image = DiskImage::open(&storage, "mix.dsk").unwrap();

        for t in [1usize, 3, 5] {
            image.load_track(t).unwrap();
            let sectors = vec![0x40 + t as u8; BYTES_PER_TRACK];
            let (bits, bit_count) = gcr::encode_track(&sectors, t as u8, gcr::DEFAULT_VOLUME, SectorOrder::Dos);
            *image.track_mut(t).unwrap() = TrackBits { bits, bit_count };
        }
        // トラック3だけ読めなくする
        image.track_mut(3).unwrap().bits.fill(0);

        match image.flush() {
            Err(DiskImageError::Unflushed { tracks, .. }) => assert_eq!(tracks, vec![3]),
            other => panic!("unexpected {:?}", other),
        }
        let saved = storage.contents("mix.dsk").unwrap();
        let track = |t: usize| &saved[t * BYTES_PER_TRACK..(t + 1) * BYTES_PER_TRACK];
        assert!(track(1).iter().all(|b| *b == 0x41));
        assert!(track(5).iter().all(|b| *b == 0x45));
        assert!(track(3).iter().all(|b| *b == 0));

        // 残るダーティはトラック3のみ
        assert!(image.is_dirty());
        assert_eq!(image.tracks[1].as_ref().map(|t| t.dirty), Some(false));
        assert_eq!(image.tracks[3].as_ref().map(|t| t.dirty), Some(true));
        assert_eq!(image.tracks[5].as_ref().map(|t| t.dirty), Some(false));
    }

    /// 書き込みだけ失敗するストリーム
    struct FailingWrites {
        data: Rc<RefCell<Vec<u8>>>,
        pos: u64,
    }

    impl Read for FailingWrites {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let data = self.data.borrow();
            let mut cursor = io::Cursor::new(data.as_slice());
            cursor.set_position(self.pos);
            let n = cursor.read(buf)?;
            self.pos += n as u64;
            Ok(n)
        }
    }

    impl io::Write for FailingWrites {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FailingWrites {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.pos = match pos {
                SeekFrom::Start(p) => p,
                SeekFrom::End(d) => (self.data.borrow().len() as i64 + d) as u64,
                SeekFrom::Current(d) => (self.pos as i64 + d) as u64,
            };
            Ok(self.pos)
        }
    }

    impl ByteStream for FailingWrites {
        fn set_len(&mut self, len: u64) -> io::Result<()> {
            self.data.borrow_mut().resize(len as usize, 0);
            Ok(())
        }

        fn is_writable(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_failed_woz_write_keeps_file() {
        let storage = MemoryStorage::new();
        storage.insert("a.dsk", sample_dsk());
        let original = DiskImage::open(&storage, "a.dsk").unwrap().to_woz_bytes().unwrap();
        let data = Rc::new(RefCell::new(original.clone()));
        let stream = FailingWrites { data: data.clone(), pos: 0 };

        let mut woz = DiskImage::from_stream("c.woz", Box::new(stream)).unwrap();
        woz.load_track(0).unwrap();
        woz.track_mut(0).unwrap().bit_count -= 8;
        assert!(matches!(woz.flush(), Err(DiskImageError::Io(_))));
        assert!(woz.is_dirty());
        assert_eq!(*data.borrow(), original);
    }

    #[test]
    fn test_dsk_to_woz_round_trip() {
        let storage = MemoryStorage::new();
        storage.insert("a.dsk", sample_dsk());
        let mut image = DiskImage::open(&storage, "a.dsk").unwrap();
        let bytes = image.to_woz_bytes().unwrap();
        storage.insert("a.woz", bytes);

        let mut woz = DiskImage::open(&storage, "a.woz").unwrap();
        assert_eq!(woz.format(), ImageFormat::Woz);
        assert!(woz.meta().unwrap().contains("image_date\t"));
        for t in [0usize, 17, 34] {
            let a = image.load_track(t).unwrap().clone();
            let b = woz.load_track(woz.track_index(t * 4).unwrap()).unwrap().clone();
            assert_eq!(a, b);
        }
        assert_eq!(woz.export_sectors(SectorOrder::Dos).unwrap(), sample_dsk());
    }

    #[test]
    fn test_woz_flush_rewrites_container() {
        let storage = MemoryStorage::new();
        storage.insert("a.dsk", sample_dsk());
        let bytes = DiskImage::open(&storage, "a.dsk").unwrap().to_woz_bytes().unwrap();
        storage.insert("b.woz", bytes);

        let mut woz = DiskImage::open(&storage, "b.woz").unwrap();
        woz.load_track(1).unwrap();
        let track = woz.track_mut(1).unwrap();
        track.bits.truncate(100);
        track.bit_count = 800;
        woz.flush().unwrap();
        drop(woz);

        let mut reopened = DiskImage::open(&storage, "b.woz").unwrap();
        assert_eq!(reopened.load_track(1).unwrap().bit_count, 800);
        let mut dsk = DiskImage::open(&storage, "a.dsk").unwrap();
        let expected = dsk.load_track(0).unwrap().bit_count;
        assert_eq!(reopened.load_track(0).unwrap().bit_count, expected);
    }

    #[test]
    fn test_read_only_stream_is_write_protected() {
        let storage = MemoryStorage::new();
        storage.insert("ro.nib", vec![0xFFu8; NIB_SIZE]);
        storage.set_read_only("ro.nib", true);
        let image = DiskImage::open(&storage, "ro.nib").unwrap();
        assert!(image.is_write_protected());
        assert_eq!(image.format(), ImageFormat::Nib);
    }
}
