//! GCRエンコーディング（6-and-2 / 4-and-4）
//!
//! Disk II hardware format based on "Beneath Apple DOS".
//! セクタイメージ ⇄ トラックのビットストリーム変換を行う。

/// ディスクの定数
pub const TRACKS: usize = 35;
pub const SECTORS_PER_TRACK: usize = 16;
pub const BYTES_PER_SECTOR: usize = 256;
pub const BYTES_PER_TRACK: usize = SECTORS_PER_TRACK * BYTES_PER_SECTOR;
pub const DSK_SIZE: usize = TRACKS * BYTES_PER_TRACK; // 143360 bytes

/// NIBフォーマットの定数
pub const NIB_TRACK_SIZE: usize = 6656;
pub const NIB_SIZE: usize = TRACKS * NIB_TRACK_SIZE;

/// 6-and-2でエンコードしたセクタのシンボル数（342 + チェックサム）
pub const NIBBLIZED_SIZE: usize = 343;

/// フォーマット時のボリューム番号
pub const DEFAULT_VOLUME: u8 = 254;

/// 同期ギャップ（10ビットの自己同期バイト数）
const GAP1: usize = 48;
const GAP2: usize = 6;
const GAP3: usize = 20;

pub const ADDRESS_PROLOG: [u8; 3] = [0xD5, 0xAA, 0x96];
pub const DATA_PROLOG: [u8; 3] = [0xD5, 0xAA, 0xAD];
pub const EPILOG: [u8; 3] = [0xDE, 0xAA, 0xEB];

/// 6-and-2エンコーディングテーブル
pub const WRITE_TABLE: [u8; 64] = [
    0x96, 0x97, 0x9A, 0x9B, 0x9D, 0x9E, 0x9F, 0xA6,
    0xA7, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, 0xB2, 0xB3,
    0xB4, 0xB5, 0xB6, 0xB7, 0xB9, 0xBA, 0xBB, 0xBC,
    0xBD, 0xBE, 0xBF, 0xCB, 0xCD, 0xCE, 0xCF, 0xD3,
    0xD6, 0xD7, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE,
    0xDF, 0xE5, 0xE6, 0xE7, 0xE9, 0xEA, 0xEB, 0xEC,
    0xED, 0xEE, 0xEF, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6,
    0xF7, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

/// 逆引きテーブル（0xFF = 不正なディスクバイト）
const READ_TABLE: [u8; 256] = {
    let mut table = [0xFFu8; 256];
    let mut i = 0;
    while i < 64 {
        table[WRITE_TABLE[i] as usize] = i as u8;
        i += 1;
    }
    table
};

/// セクタの並び（物理セクタ → イメージ内の論理セクタ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorOrder {
    /// DOS 3.3セクターインターリーブ (.dsk / .do)
    Dos,
    /// ProDOSセクターオーダー (.po)
    ProDos,
}

impl SectorOrder {
    const DOS: [usize; 16] = [0, 7, 14, 6, 13, 5, 12, 4, 11, 3, 10, 2, 9, 1, 8, 15];
    const PRODOS: [usize; 16] = [0, 8, 1, 9, 2, 10, 3, 11, 4, 12, 5, 13, 6, 14, 7, 15];

    pub fn table(self) -> &'static [usize; 16] {
        match self {
            SectorOrder::Dos => &Self::DOS,
            SectorOrder::ProDos => &Self::PRODOS,
        }
    }

    /// 物理セクタ番号に対応するイメージ内セクタ
    pub fn logical(self, physical: usize) -> usize {
        self.table()[physical & 0x0F]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcrError {
    InvalidNibble { value: u8 },
    DataChecksum { expected: u8, found: u8 },
    ShortField { needed: usize, found: usize },
    MissingSectors { track: u8, found_mask: u16 },
}

impl std::fmt::Display for GcrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidNibble { value } => write!(f, "invalid disk byte 0x{:02X}", value),
            Self::DataChecksum { expected, found } => write!(
                f,
                "data field checksum mismatch (expected 0x{:02X}, found 0x{:02X})",
                expected, found
            ),
            Self::ShortField { needed, found } => {
                write!(f, "field truncated: need {} nibbles, found {}", needed, found)
            }
            Self::MissingSectors { track, found_mask } => write!(
                f,
                "track {}: only {} of 16 sectors decoded (mask 0x{:04X})",
                track,
                found_mask.count_ones(),
                found_mask
            ),
        }
    }
}

impl std::error::Error for GcrError {}

//--------------------------------------------------
// 4-and-4
//--------------------------------------------------

/// byte1 = 奇数ビット (D7,D5,D3,D1) | 0xAA, byte2 = 偶数ビット (D6,D4,D2,D0) | 0xAA
pub fn encode_4and4(value: u8) -> [u8; 2] {
    [(value >> 1) | 0xAA, value | 0xAA]
}

pub fn decode_4and4(odd: u8, even: u8) -> u8 {
    ((odd << 1) | 0x01) & even
}

//--------------------------------------------------
// 6-and-2
//--------------------------------------------------

#[inline]
fn swap_low_bits(b: u8) -> u8 {
    ((b & 0x01) << 1) | ((b & 0x02) >> 1)
}

/// 256バイトを343個のディスクバイトに変換
///
/// 先頭86個は下位2ビットを3バイトずつ詰めた補助値（P5 PROMの
/// デコード順に合わせてD0/D1を入れ替える）、続く256個が上位6ビット。
/// 各値は直前の値とXORしてから変換し、最後にチェックサムを置く。
pub fn nibblize(data: &[u8; 256]) -> [u8; NIBBLIZED_SIZE] {
    let mut values = [0u8; 342];
    for i in 0..86 {
        let mut aux = swap_low_bits(data[i]);
        aux |= swap_low_bits(data[i + 86]) << 2;
        if i + 172 < 256 {
            aux |= swap_low_bits(data[i + 172]) << 4;
        }
        values[i] = aux;
    }
    for i in 0..256 {
        values[86 + i] = data[i] >> 2;
    }

    let mut out = [0u8; NIBBLIZED_SIZE];
    let mut prev = 0u8;
    for (i, &v) in values.iter().enumerate() {
        out[i] = WRITE_TABLE[((v ^ prev) & 0x3F) as usize];
        prev = v;
    }
    out[342] = WRITE_TABLE[(prev & 0x3F) as usize];
    out
}

/// 343個のディスクバイトから256バイトを復元
pub fn denibblize(encoded: &[u8]) -> Result<[u8; 256], GcrError> {
    if encoded.len() < NIBBLIZED_SIZE {
        return Err(GcrError::ShortField {
            needed: NIBBLIZED_SIZE,
            found: encoded.len(),
        });
    }

    let mut values = [0u8; 342];
    let mut prev = 0u8;
    for i in 0..342 {
        let sym = READ_TABLE[encoded[i] as usize];
        if sym == 0xFF {
            return Err(GcrError::InvalidNibble { value: encoded[i] });
        }
        prev ^= sym;
        values[i] = prev;
    }
    let check = READ_TABLE[encoded[342] as usize];
    if check == 0xFF {
        return Err(GcrError::InvalidNibble { value: encoded[342] });
    }
    if check != prev {
        return Err(GcrError::DataChecksum {
            expected: prev,
            found: check,
        });
    }

    let mut data = [0u8; 256];
    for (i, byte) in data.iter_mut().enumerate() {
        let low = (values[i % 86] >> (2 * (i / 86))) & 0x03;
        *byte = (values[86 + i] << 2) | swap_low_bits(low);
    }
    Ok(data)
}

//--------------------------------------------------
// ビットストリーム
//--------------------------------------------------

/// MSBファーストでビットを詰めるバッファ
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    len: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bit(&mut self, bit: bool) {
        if self.len % 8 == 0 {
            self.bytes.push(0);
        }
        if bit {
            self.bytes[self.len / 8] |= 0x80 >> (self.len % 8);
        }
        self.len += 1;
    }

    pub fn push_byte(&mut self, value: u8) {
        for i in 0..8 {
            self.push_bit(value & (0x80 >> i) != 0);
        }
    }

    pub fn push_bytes(&mut self, values: &[u8]) {
        for &v in values {
            self.push_byte(v);
        }
    }

    /// 自己同期バイト（0xFF + 0ビット2個）
    pub fn push_sync(&mut self, count: usize) {
        for _ in 0..count {
            self.push_byte(0xFF);
            self.push_bit(false);
            self.push_bit(false);
        }
    }

    pub fn bit_len(&self) -> usize {
        self.len
    }

    pub fn finish(self) -> (Vec<u8>, u32) {
        (self.bytes, self.len as u32)
    }
}

#[inline]
pub fn bit_at(bits: &[u8], index: usize) -> bool {
    bits[index / 8] & (0x80 >> (index % 8)) != 0
}

#[inline]
pub fn set_bit(bits: &mut [u8], index: usize, value: bool) {
    let mask = 0x80 >> (index % 8);
    if value {
        bits[index / 8] |= mask;
    } else {
        bits[index / 8] &= !mask;
    }
}

/// ビットストリームをシーケンサと同じ規則でラッチしてニブル列にする
///
/// `revolutions` 周分読むので、トラック末尾をまたぐフィールドも拾える。
pub fn latch_nibbles(bits: &[u8], bit_count: usize, revolutions: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(bit_count * revolutions / 8);
    if bit_count == 0 {
        return out;
    }
    let mut shift = 0u8;
    for i in 0..bit_count * revolutions {
        shift = (shift << 1) | bit_at(bits, i % bit_count) as u8;
        if shift & 0x80 != 0 {
            out.push(shift);
            shift = 0;
        }
    }
    out
}

/// ニブル列をそのままビットストリームにする（NIBイメージ用）
pub fn nibbles_to_bits(nibbles: &[u8]) -> (Vec<u8>, u32) {
    (nibbles.to_vec(), (nibbles.len() * 8) as u32)
}

//--------------------------------------------------
// トラック
//--------------------------------------------------

/// 1トラック分のセクタデータ(4096バイト)をビットストリームへ
pub fn encode_track(sectors: &[u8], track: u8, volume: u8, order: SectorOrder) -> (Vec<u8>, u32) {
    let mut w = BitWriter::new();
    w.push_sync(GAP1);

    for physical in 0..SECTORS_PER_TRACK {
        let logical = order.logical(physical);
        let offset = logical * BYTES_PER_SECTOR;
        let mut data = [0u8; 256];
        if let Some(src) = sectors.get(offset..offset + BYTES_PER_SECTOR) {
            data.copy_from_slice(src);
        }

        // アドレスフィールド
        let s = physical as u8;
        w.push_bytes(&ADDRESS_PROLOG);
        w.push_bytes(&encode_4and4(volume));
        w.push_bytes(&encode_4and4(track));
        w.push_bytes(&encode_4and4(s));
        w.push_bytes(&encode_4and4(volume ^ track ^ s));
        w.push_bytes(&EPILOG);
        w.push_sync(GAP2);

        // データフィールド
        w.push_bytes(&DATA_PROLOG);
        w.push_bytes(&nibblize(&data));
        w.push_bytes(&EPILOG);
        w.push_sync(GAP3);
    }

    w.finish()
}

/// アドレスフィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressField {
    pub volume: u8,
    pub track: u8,
    pub sector: u8,
}

fn parse_address(nibbles: &[u8]) -> Option<AddressField> {
    if nibbles.len() < 10 {
        return None;
    }
    let volume = decode_4and4(nibbles[0], nibbles[1]);
    let track = decode_4and4(nibbles[2], nibbles[3]);
    let sector = decode_4and4(nibbles[4], nibbles[5]);
    let checksum = decode_4and4(nibbles[6], nibbles[7]);
    if volume ^ track ^ sector != checksum || nibbles[8] != EPILOG[0] || nibbles[9] != EPILOG[1] {
        return None;
    }
    Some(AddressField { volume, track, sector })
}

fn find(haystack: &[u8], needle: &[u8], from: usize, limit: usize) -> Option<usize> {
    let end = haystack.len().min(from.saturating_add(limit));
    (from..end).find(|&i| haystack[i..].starts_with(needle))
}

/// トラックのビットストリームから16セクタを復元（イメージ内の並びで返す）
pub fn decode_track(bits: &[u8], bit_count: usize, track: u8, order: SectorOrder) -> Result<Vec<u8>, GcrError> {
    let nibbles = latch_nibbles(bits, bit_count, 2);
    let mut out = vec![0u8; BYTES_PER_TRACK];
    let mut found: u16 = 0;
    let mut pos = 0;

    while found != 0xFFFF {
        let Some(at) = find(&nibbles, &ADDRESS_PROLOG, pos, usize::MAX) else {
            break;
        };
        pos = at + 3;
        let Some(addr) = parse_address(&nibbles[pos..]) else {
            continue;
        };
        if addr.sector as usize >= SECTORS_PER_TRACK || found & (1 << addr.sector) != 0 {
            continue;
        }
        let Some(data_at) = find(&nibbles, &DATA_PROLOG, pos + 10, 64) else {
            continue;
        };
        let body = data_at + 3;
        let Some(field) = nibbles.get(body..body + NIBBLIZED_SIZE + 2) else {
            break;
        };
        if field[NIBBLIZED_SIZE] != EPILOG[0] || field[NIBBLIZED_SIZE + 1] != EPILOG[1] {
            log::debug!("T{} S{}: bad data epilog", track, addr.sector);
            continue;
        }
        match denibblize(&field[..NIBBLIZED_SIZE]) {
            Ok(data) => {
                let logical = order.logical(addr.sector as usize);
                out[logical * BYTES_PER_SECTOR..(logical + 1) * BYTES_PER_SECTOR].copy_from_slice(&data);
                found |= 1 << addr.sector;
                pos = body + NIBBLIZED_SIZE;
            }
            Err(e) => log::debug!("T{} S{}: {}", track, addr.sector, e),
        }
    }

    if found == 0xFFFF {
        Ok(out)
    } else {
        Err(GcrError::MissingSectors {
            track,
            found_mask: found,
        })
    }
}
