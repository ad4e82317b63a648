//! WOZディスクイメージコンテナ（バージョン1/2）
//!
//! 読み込みは両バージョン対応、書き込みは常にバージョン2。
//! 構造: 12バイトヘッダ（マジック + マーカー + CRC32）→ チャンク列。
//! 必須チャンクはINFO / TMAP / TRKS、METAは任意。未知のチャンクは読み飛ばす。

use serde::Serialize;

pub const WOZ1_MAGIC: &[u8; 4] = b"WOZ1";
pub const WOZ2_MAGIC: &[u8; 4] = b"WOZ2";
pub const HEADER_MARKER: [u8; 4] = [0xFF, 0x0A, 0x0D, 0x0A];
pub const HEADER_SIZE: usize = 12;

pub const INFO_SIZE: usize = 60;
pub const TMAP_SIZE: usize = 160;
pub const BLOCK_SIZE: usize = 512;

/// WOZ1のトラック1本分の固定長
pub const WOZ1_TRACK_SIZE: usize = 6656;
const WOZ1_BITSTREAM_SIZE: usize = 6646;

/// WOZ2のTRK記述子（160 × 8バイト）
const TRK_ENTRY_SIZE: usize = 8;
const TRKS_TABLE_SIZE: usize = TMAP_SIZE * TRK_ENTRY_SIZE;
/// 最初のトラックデータのブロック番号（ヘッダ+INFO+TMAP+TRKS表の直後）
const FIRST_TRACK_BLOCK: usize = 3;

/// TMAPの「データなし」
pub const NO_TRACK: u8 = 0xFF;

/// 5.25インチディスク
pub const DISK_TYPE_525: u8 = 1;

//--------------------------------------------------
// CRC32
//--------------------------------------------------

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
};

/// CRC-32 (IEEE 802.3)
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &b in data {
        crc = CRC32_TABLE[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

//--------------------------------------------------
// エラー
//--------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WozError {
    InvalidMagic { found: [u8; 4] },
    InvalidMarker { found: [u8; 4] },
    CrcMismatch { stored: u32, computed: u32 },
    UnexpectedEof { context: &'static str },
    MissingRequiredChunk { chunk: &'static str },
    InvalidChunkSize { chunk: &'static str, expected: usize, found: usize },
    UnsupportedDiskType { found: u8 },
    TrackOutOfBounds { index: usize },
    InvalidTrackMap { quarter: usize, index: u8 },
}

impl WozError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMagic { .. } => "WOZ001",
            Self::InvalidMarker { .. } => "WOZ002",
            Self::CrcMismatch { .. } => "WOZ003",
            Self::UnexpectedEof { .. } => "WOZ004",
            Self::MissingRequiredChunk { .. } => "WOZ005",
            Self::InvalidChunkSize { .. } => "WOZ006",
            Self::UnsupportedDiskType { .. } => "WOZ007",
            Self::TrackOutOfBounds { .. } => "WOZ008",
            Self::InvalidTrackMap { .. } => "WOZ009",
        }
    }
}

impl std::fmt::Display for WozError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic { found } => {
                write!(f, "[{}] invalid magic: found {:02X?}", self.code(), found)
            }
            Self::InvalidMarker { found } => {
                write!(f, "[{}] invalid header marker: found {:02X?}", self.code(), found)
            }
            Self::CrcMismatch { stored, computed } => write!(
                f,
                "[{}] CRC mismatch (stored 0x{:08X}, computed 0x{:08X})",
                self.code(),
                stored,
                computed
            ),
            Self::UnexpectedEof { context } => {
                write!(f, "[{}] unexpected end of file: {}", self.code(), context)
            }
            Self::MissingRequiredChunk { chunk } => {
                write!(f, "[{}] missing required chunk '{}'", self.code(), chunk)
            }
            Self::InvalidChunkSize {
                chunk,
                expected,
                found,
            } => write!(
                f,
                "[{}] chunk '{}' has size {} (expected {})",
                self.code(),
                chunk,
                found,
                expected
            ),
            Self::UnsupportedDiskType { found } => {
                write!(f, "[{}] unsupported disk type {}", self.code(), found)
            }
            Self::TrackOutOfBounds { index } => {
                write!(f, "[{}] track {} lies outside the file", self.code(), index)
            }
            Self::InvalidTrackMap { quarter, index } => write!(
                f,
                "[{}] quarter-track {} maps to missing track {}",
                self.code(),
                quarter,
                index
            ),
        }
    }
}

impl std::error::Error for WozError {}

//--------------------------------------------------
// データ構造
//--------------------------------------------------

/// INFOチャンク
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WozInfo {
    pub version: u8,
    pub disk_type: u8,
    pub write_protected: bool,
    pub synchronized: bool,
    pub cleaned: bool,
    pub creator: String,
    pub disk_sides: u8,
    pub boot_sector_format: u8,
    /// ビットセル長（125ns単位、標準は32 = 4µs）
    pub optimal_bit_timing: u8,
    pub compatible_hardware: u16,
    pub required_ram: u16,
    /// 最大トラックのブロック数
    pub largest_track: u16,
}

impl Default for WozInfo {
    fn default() -> Self {
        WozInfo {
            version: 2,
            disk_type: DISK_TYPE_525,
            write_protected: false,
            synchronized: false,
            cleaned: false,
            creator: concat!("a2core ", env!("CARGO_PKG_VERSION")).to_string(),
            disk_sides: 1,
            boot_sector_format: 0,
            optimal_bit_timing: 32,
            compatible_hardware: 0,
            required_ram: 0,
            largest_track: 0,
        }
    }
}

/// ファイル内のトラックデータの位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackLocation {
    pub offset: usize,
    pub byte_len: usize,
    pub bit_count: u32,
}

/// 解析済みのコンテナ（トラックデータ本体は位置のみ保持）
#[derive(Debug, Clone)]
pub struct WozContainer {
    pub info: WozInfo,
    pub tmap: [u8; TMAP_SIZE],
    /// TRKインデックス順、データのないスロットはNone
    pub tracks: Vec<Option<TrackLocation>>,
    pub meta: Option<String>,
}

//--------------------------------------------------
// 解析
//--------------------------------------------------

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn parse_info(data: &[u8]) -> Result<WozInfo, WozError> {
    if data.len() != INFO_SIZE {
        return Err(WozError::InvalidChunkSize {
            chunk: "INFO",
            expected: INFO_SIZE,
            found: data.len(),
        });
    }
    let version = data[0];
    let disk_type = data[1];
    if disk_type != DISK_TYPE_525 {
        return Err(WozError::UnsupportedDiskType { found: disk_type });
    }
    let creator = String::from_utf8_lossy(&data[5..37])
        .trim_end_matches([' ', '\0'])
        .to_string();
    let mut info = WozInfo {
        version,
        disk_type,
        write_protected: data[2] == 1,
        synchronized: data[3] == 1,
        cleaned: data[4] == 1,
        creator,
        ..WozInfo::default()
    };
    if version >= 2 {
        info.disk_sides = data[37];
        info.boot_sector_format = data[38];
        if data[39] != 0 {
            info.optimal_bit_timing = data[39];
        }
        info.compatible_hardware = read_u16(data, 40);
        info.required_ram = read_u16(data, 42);
        info.largest_track = read_u16(data, 44);
    }
    Ok(info)
}

fn parse_trks_v1(file: &[u8], start: usize, len: usize) -> Result<Vec<Option<TrackLocation>>, WozError> {
    let count = len / WOZ1_TRACK_SIZE;
    let mut tracks = Vec::with_capacity(count);
    for i in 0..count {
        let base = start + i * WOZ1_TRACK_SIZE;
        let bytes_used = read_u16(file, base + WOZ1_BITSTREAM_SIZE) as usize;
        let bit_count = read_u16(file, base + WOZ1_BITSTREAM_SIZE + 2) as u32;
        if bit_count == 0 {
            tracks.push(None);
            continue;
        }
        let byte_len = bytes_used.max((bit_count as usize + 7) / 8);
        if byte_len > WOZ1_BITSTREAM_SIZE {
            return Err(WozError::TrackOutOfBounds { index: i });
        }
        tracks.push(Some(TrackLocation {
            offset: base,
            byte_len,
            bit_count,
        }));
    }
    Ok(tracks)
}

fn parse_trks_v2(file: &[u8], start: usize, len: usize) -> Result<Vec<Option<TrackLocation>>, WozError> {
    if len < TRKS_TABLE_SIZE {
        return Err(WozError::InvalidChunkSize {
            chunk: "TRKS",
            expected: TRKS_TABLE_SIZE,
            found: len,
        });
    }
    let mut tracks = Vec::with_capacity(TMAP_SIZE);
    for i in 0..TMAP_SIZE {
        let entry = start + i * TRK_ENTRY_SIZE;
        let start_block = read_u16(file, entry) as usize;
        let block_count = read_u16(file, entry + 2) as usize;
        let bit_count = read_u32(file, entry + 4);
        if start_block == 0 || block_count == 0 || bit_count == 0 {
            tracks.push(None);
            continue;
        }
        let offset = start_block * BLOCK_SIZE;
        let byte_len = (bit_count as usize + 7) / 8;
        if byte_len > block_count * BLOCK_SIZE || offset + byte_len > file.len() {
            return Err(WozError::TrackOutOfBounds { index: i });
        }
        tracks.push(Some(TrackLocation {
            offset,
            byte_len,
            bit_count,
        }));
    }
    Ok(tracks)
}

/// コンテナ全体を検証して解析する
pub fn parse(file: &[u8]) -> Result<WozContainer, WozError> {
    if file.len() < HEADER_SIZE {
        return Err(WozError::UnexpectedEof { context: "header" });
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&file[0..4]);
    let v2 = match &magic {
        m if m == WOZ1_MAGIC => false,
        m if m == WOZ2_MAGIC => true,
        _ => return Err(WozError::InvalidMagic { found: magic }),
    };
    let mut marker = [0u8; 4];
    marker.copy_from_slice(&file[4..8]);
    if marker != HEADER_MARKER {
        return Err(WozError::InvalidMarker { found: marker });
    }
    let stored = read_u32(file, 8);
    if stored != 0 {
        let computed = crc32(&file[HEADER_SIZE..]);
        if computed != stored {
            return Err(WozError::CrcMismatch { stored, computed });
        }
    }

    let mut info = None;
    let mut tmap = None;
    let mut tracks = None;
    let mut meta = None;

    let mut pos = HEADER_SIZE;
    while pos + 8 <= file.len() {
        let id = &file[pos..pos + 4];
        let size = read_u32(file, pos + 4) as usize;
        let start = pos + 8;
        let end = start
            .checked_add(size)
            .filter(|end| *end <= file.len())
            .ok_or(WozError::UnexpectedEof { context: "chunk body" })?;
        let data = &file[start..end];
        match id {
            b"INFO" => info = Some(parse_info(data)?),
            b"TMAP" => {
                if size != TMAP_SIZE {
                    return Err(WozError::InvalidChunkSize {
                        chunk: "TMAP",
                        expected: TMAP_SIZE,
                        found: size,
                    });
                }
                let mut map = [0u8; TMAP_SIZE];
                map.copy_from_slice(data);
                tmap = Some(map);
            }
            b"TRKS" => {
                tracks = Some(if v2 {
                    parse_trks_v2(file, start, size)?
                } else {
                    parse_trks_v1(file, start, size)?
                });
            }
            b"META" => meta = Some(String::from_utf8_lossy(data).into_owned()),
            other => log::debug!("skipping chunk {:?}", String::from_utf8_lossy(other)),
        }
        pos = end;
    }

    let info = info.ok_or(WozError::MissingRequiredChunk { chunk: "INFO" })?;
    let tmap = tmap.ok_or(WozError::MissingRequiredChunk { chunk: "TMAP" })?;
    let tracks = tracks.ok_or(WozError::MissingRequiredChunk { chunk: "TRKS" })?;

    for (quarter, &index) in tmap.iter().enumerate() {
        if index == NO_TRACK {
            continue;
        }
        if !matches!(tracks.get(index as usize), Some(Some(_))) {
            return Err(WozError::InvalidTrackMap { quarter, index });
        }
    }

    Ok(WozContainer {
        info,
        tmap,
        tracks,
        meta,
    })
}

//--------------------------------------------------
// 書き込み
//--------------------------------------------------

fn put_chunk_header(out: &mut Vec<u8>, id: &[u8; 4], size: usize) {
    out.extend_from_slice(id);
    out.extend_from_slice(&(size as u32).to_le_bytes());
}

/// 文字の途中で切らずに max バイト以内に収める
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn encode_info(info: &WozInfo, largest_track: u16) -> [u8; INFO_SIZE] {
    let mut data = [0u8; INFO_SIZE];
    data[0] = 2;
    data[1] = info.disk_type;
    data[2] = info.write_protected as u8;
    data[3] = info.synchronized as u8;
    data[4] = info.cleaned as u8;
    let mut creator = [b' '; 32];
    let name = truncate_utf8(&info.creator, creator.len());
    creator[..name.len()].copy_from_slice(name.as_bytes());
    data[5..37].copy_from_slice(&creator);
    data[37] = info.disk_sides.max(1);
    data[38] = info.boot_sector_format;
    data[39] = info.optimal_bit_timing;
    data[40..42].copy_from_slice(&info.compatible_hardware.to_le_bytes());
    data[42..44].copy_from_slice(&info.required_ram.to_le_bytes());
    data[44..46].copy_from_slice(&largest_track.to_le_bytes());
    data
}

/// バージョン2コンテナを組み立てる
///
/// `tracks[i]` はTRKインデックスiのビット列とビット数。配置は
/// 現在のビット数から計算し直し、ブロック境界までゼロで埋める。
pub fn write(info: &WozInfo, tmap: &[u8; TMAP_SIZE], tracks: &[Option<(&[u8], u32)>], meta: Option<&str>) -> Vec<u8> {
    let mut entries = [0u8; TRKS_TABLE_SIZE];
    let mut track_data = Vec::new();
    let mut next_block = FIRST_TRACK_BLOCK;
    let mut largest = 0usize;

    for (i, track) in tracks.iter().take(TMAP_SIZE).enumerate() {
        let Some((bits, bit_count)) = track else {
            continue;
        };
        let byte_len = (*bit_count as usize + 7) / 8;
        let blocks = (byte_len + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let entry = i * TRK_ENTRY_SIZE;
        entries[entry..entry + 2].copy_from_slice(&(next_block as u16).to_le_bytes());
        entries[entry + 2..entry + 4].copy_from_slice(&(blocks as u16).to_le_bytes());
        entries[entry + 4..entry + 8].copy_from_slice(&bit_count.to_le_bytes());

        let start = track_data.len();
        track_data.extend_from_slice(&bits[..byte_len.min(bits.len())]);
        track_data.resize(start + blocks * BLOCK_SIZE, 0);
        next_block += blocks;
        largest = largest.max(blocks);
    }

    let mut out = Vec::with_capacity(FIRST_TRACK_BLOCK * BLOCK_SIZE + track_data.len());
    out.extend_from_slice(WOZ2_MAGIC);
    out.extend_from_slice(&HEADER_MARKER);
    out.extend_from_slice(&[0; 4]);

    put_chunk_header(&mut out, b"INFO", INFO_SIZE);
    out.extend_from_slice(&encode_info(info, largest as u16));

    put_chunk_header(&mut out, b"TMAP", TMAP_SIZE);
    out.extend_from_slice(tmap);

    put_chunk_header(&mut out, b"TRKS", TRKS_TABLE_SIZE + track_data.len());
    out.extend_from_slice(&entries);
    debug_assert_eq!(out.len(), FIRST_TRACK_BLOCK * BLOCK_SIZE);
    out.extend_from_slice(&track_data);

    if let Some(text) = meta {
        put_chunk_header(&mut out, b"META", text.len());
        out.extend_from_slice(text.as_bytes());
    }

    let crc = crc32(&out[HEADER_SIZE..]);
    out[8..12].copy_from_slice(&crc.to_le_bytes());
    out
}

/// METAテキストのキーを取得（タブ区切り、改行区切り）
pub fn meta_value<'a>(meta: &'a str, key: &str) -> Option<&'a str> {
    meta.lines()
        .filter_map(|line| line.split_once('\t'))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcr::{self, SectorOrder};

    fn standard_tmap(tracks: usize) -> [u8; TMAP_SIZE] {
        let mut tmap = [NO_TRACK; TMAP_SIZE];
        for t in 0..tracks {
            for q in [t * 4, t * 4 + 1] {
                tmap[q] = t as u8;
            }
            if t > 0 {
                tmap[t * 4 - 1] = t as u8;
            }
        }
        tmap
    }

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_write_then_parse_reproduces_bits() {
        let mut streams = Vec::new();
        for t in 0..3u8 {
            let sectors = vec![t; gcr::BYTES_PER_TRACK];
            streams.push(gcr::encode_track(&sectors, t, gcr::DEFAULT_VOLUME, SectorOrder::Dos));
        }
        let refs: Vec<Option<(&[u8], u32)>> = streams.iter().map(|(b, n)| Some((b.as_slice(), *n))).collect();
        let info = WozInfo::default();
        let tmap = standard_tmap(3);
        let file = write(&info, &tmap, &refs, Some("title\tTest\nside\t1"));

        assert_eq!(&file[0..4], WOZ2_MAGIC);
        assert_eq!(file[256..258], [3, 0]); // track 0 at block 3

        let woz = parse(&file).unwrap();
        assert_eq!(woz.tmap, tmap);
        assert_eq!(woz.info.optimal_bit_timing, 32);
        assert_eq!(woz.meta.as_deref().and_then(|m| meta_value(m, "title")), Some("Test"));
        for (i, (bits, count)) in streams.iter().enumerate() {
            let loc = woz.tracks[i].unwrap();
            assert_eq!(loc.bit_count, *count);
            assert_eq!(&file[loc.offset..loc.offset + loc.byte_len], &bits[..]);
        }
        assert!(woz.tracks[3].is_none());
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let bits = vec![0xFFu8; 64];
        let file = write(&WozInfo::default(), &standard_tmap(1), &[Some((bits.as_slice(), 512))], None);
        let mut broken = file.clone();
        let last = broken.len() - 1;
        broken[last] ^= 0x01;
        assert!(matches!(parse(&broken), Err(WozError::CrcMismatch { .. })));

        // CRC 0 は検証しない
        broken[8..12].copy_from_slice(&[0; 4]);
        assert!(parse(&broken).is_ok());
    }

    #[test]
    fn test_bad_header() {
        let bits = vec![0xFFu8; 64];
        let file = write(&WozInfo::default(), &standard_tmap(1), &[Some((bits.as_slice(), 512))], None);
        let mut bad = file.clone();
        bad[0..4].copy_from_slice(b"WOZ9");
        assert!(matches!(parse(&bad), Err(WozError::InvalidMagic { .. })));
        let mut bad = file;
        bad[7] = 0x00;
        assert!(matches!(parse(&bad), Err(WozError::InvalidMarker { .. })));
        assert!(matches!(parse(b"WOZ2"), Err(WozError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_missing_and_short_chunks() {
        let mut file = Vec::new();
        file.extend_from_slice(WOZ2_MAGIC);
        file.extend_from_slice(&HEADER_MARKER);
        file.extend_from_slice(&[0; 4]);
        put_chunk_header(&mut file, b"INFO", INFO_SIZE);
        file.extend_from_slice(&encode_info(&WozInfo::default(), 0));
        assert_eq!(parse(&file).unwrap_err(), WozError::MissingRequiredChunk { chunk: "TMAP" });

        put_chunk_header(&mut file, b"TMAP", 10);
        file.extend_from_slice(&[0; 10]);
        assert!(matches!(
            parse(&file),
            Err(WozError::InvalidChunkSize { chunk: "TMAP", .. })
        ));
    }

    #[test]
    fn test_tmap_pointing_to_empty_track_rejected() {
        let bits = vec![0xFFu8; 64];
        let mut tmap = standard_tmap(1);
        tmap[8] = 5;
        let file = write(&WozInfo::default(), &tmap, &[Some((bits.as_slice(), 512))], None);
        assert_eq!(
            parse(&file).unwrap_err(),
            WozError::InvalidTrackMap { quarter: 8, index: 5 }
        );
    }

    #[test]
    fn test_parse_woz1() {
        let bits = vec![0xD5u8; 100];
        let mut file = Vec::new();
        file.extend_from_slice(WOZ1_MAGIC);
        file.extend_from_slice(&HEADER_MARKER);
        file.extend_from_slice(&[0; 4]);
        let mut info = [0u8; INFO_SIZE];
        info[0] = 1;
        info[1] = DISK_TYPE_525;
        info[2] = 1;
        put_chunk_header(&mut file, b"INFO", INFO_SIZE);
        file.extend_from_slice(&info);
        put_chunk_header(&mut file, b"TMAP", TMAP_SIZE);
        file.extend_from_slice(&standard_tmap(1));
        put_chunk_header(&mut file, b"TRKS", WOZ1_TRACK_SIZE);
        let base = file.len();
        file.resize(base + WOZ1_TRACK_SIZE, 0);
        file[base..base + 100].copy_from_slice(&bits);
        file[base + 6646..base + 6648].copy_from_slice(&100u16.to_le_bytes());
        file[base + 6648..base + 6650].copy_from_slice(&800u16.to_le_bytes());
        let crc = crc32(&file[HEADER_SIZE..]);
        file[8..12].copy_from_slice(&crc.to_le_bytes());

        let woz = parse(&file).unwrap();
        assert_eq!(woz.info.version, 1);
        assert!(woz.info.write_protected);
        assert_eq!(woz.info.optimal_bit_timing, 32);
        let loc = woz.tracks[0].unwrap();
        assert_eq!((loc.offset, loc.byte_len, loc.bit_count), (base, 100, 800));
    }

    #[test]
    fn test_long_creator_is_cut_on_char_boundary() {
        // 30バイト + 3バイト文字: 32バイト目は文字の途中
        let creator = format!("{}日本", "x".repeat(30));
        assert_eq!(truncate_utf8(&creator, 32), "x".repeat(30));
        assert_eq!(truncate_utf8("short", 32), "short");

        let info = WozInfo {
            creator: creator.clone(),
            ..WozInfo::default()
        };
        let file = write(&info, &[NO_TRACK; TMAP_SIZE], &[], None);
        let woz = parse(&file).unwrap();
        assert_eq!(woz.info.creator, "x".repeat(30));
    }
}
