//! Apple II Disk II ドライブエミュレーション
//!
//! Disk II hardware emulation based on "Beneath Apple DOS" documentation.
//! ヘッドはトラックのビットストリームをビットセル単位で読み書きする。
//! タイミングはCPUのサイクルカウンタとの比較だけで決まる（ポーリング方式）。

use crate::disk_log::{
    is_enabled, log_backlog_discarded, log_drive_select, log_eject, log_flush, log_insert,
    log_mode_change, log_motor_off, log_motor_on, log_spin_down, log_track_change,
    log_write_ignored, DiskLogLevel, NibbleRing,
};
use crate::gcr::{self, SectorOrder};
use crate::image::{DiskImage, DiskImageError};
use crate::memory::FLOATING_BUS;
use crate::savestate::{magic, SaveStateError, StateReader, StateWriter};
use crate::slot::{Slot, SLOT_ROM_SIZE};
use crate::storage::Storage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::any::Any;

/// ヘッド位置の上限（ハーフトラック）
pub const MAX_HALF_TRACK: u8 = 69;

/// 1秒あたりのCPUサイクル
pub const CYCLES_PER_SECOND: u64 = 1_020_484;

/// モーターOFF後の惰性回転（約1秒）
pub const SPIN_DOWN_CYCLES: u64 = CYCLES_PER_SECOND;

/// 選択解除/モーターOFFからダーティトラックを書き戻すまでの猶予
pub const FLUSH_DELAY_CYCLES: u64 = 2 * CYCLES_PER_SECOND;

/// これを超える読み遅れは1バイト分を残して読み捨てる
pub const BACKLOG_BITS: u64 = 16;

/// 連続する0ビットがこれを超えるとMC3470がランダムビットを出す
const MAX_ZERO_RUN: u8 = 3;

/// ステッパーの移動量（ハーフトラック）[直前のフェーズ][新しくONにしたフェーズ]
const STEP_TABLE: [[i8; 4]; 4] = [
    [0, 1, 0, -1],
    [-1, 0, 1, 0],
    [0, -1, 0, 1],
    [1, 0, -1, 0],
];

/// ブートROMの先頭（LDX #$20）
const BOOT_ROM_SIGNATURE: [u8; 2] = [0xA2, 0x20];

/// シーケンサの動作（Q7, Q6）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencerFunction {
    ReadSequencing,
    CheckWriteProtAndInitWrite,
    DataShiftWrite,
    DataLoadWrite,
}

/// ディスクの回転状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpinState {
    NotSpinning,
    /// モーターOFF後、期限まで惰性で回っている
    SpinningTransient { until: u64 },
    SpinningIndefinite,
}

impl SpinState {
    pub fn is_spinning(self) -> bool {
        self != SpinState::NotSpinning
    }
}

/// ドライブの状態（ホスト向け）
#[derive(Debug, Clone, Serialize)]
pub struct DriveStatus {
    pub disk: Option<String>,
    pub half_track: u8,
    pub spin: SpinState,
    pub write_protected: bool,
    pub dirty: bool,
}

/// フロッピードライブ
pub struct DiskDrive {
    image: Option<DiskImage>,
    /// ヘッド位置（0-69、ハーフトラック）
    half_track: u8,
    /// 最後にONにしたフェーズ
    last_phase: u8,
    /// 現在のトラックインデックス（データなしならNone）
    track: Option<usize>,
    write_protected: bool,
    spin: SpinState,
    /// 回転開始サイクル
    spin_up: u64,
    /// 回転開始以降に渡したビット数
    delivered: u64,
    /// トラック内のビット位置
    bit_pos: usize,
    zero_run: u8,
    flush_at: Option<u64>,
}

impl Default for DiskDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskDrive {
    pub fn new() -> Self {
        DiskDrive {
            image: None,
            half_track: 0,
            last_phase: 0,
            track: None,
            write_protected: false,
            spin: SpinState::NotSpinning,
            spin_up: 0,
            delivered: 0,
            bit_pos: 0,
            zero_run: 0,
            flush_at: None,
        }
    }

    pub fn half_track(&self) -> u8 {
        self.half_track
    }

    pub fn spin_state(&self) -> SpinState {
        self.spin
    }

    pub fn image(&self) -> Option<&DiskImage> {
        self.image.as_ref()
    }

    pub fn image_mut(&mut self) -> Option<&mut DiskImage> {
        self.image.as_mut()
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn status(&self) -> DriveStatus {
        DriveStatus {
            disk: self.image.as_ref().map(|i| i.name().to_string()),
            half_track: self.half_track,
            spin: self.spin,
            write_protected: self.write_protected,
            dirty: self.image.as_ref().map_or(false, |i| i.is_dirty()),
        }
    }

    /// 回転開始からの経過ビット数
    fn elapsed_bits(&self, cycles: u64) -> u64 {
        let timing = self.image.as_ref().map_or(32, |i| i.bit_timing());
        cycles.saturating_sub(self.spin_up) * 8 / timing
    }

    fn start_spinning(&mut self, cycles: u64) {
        if self.spin == SpinState::NotSpinning {
            self.spin_up = cycles;
            self.delivered = 0;
        }
        self.spin = SpinState::SpinningIndefinite;
    }

    /// ヘッド位置からトラックを引き直す
    fn update_track(&mut self) {
        let Some(image) = self.image.as_mut() else {
            self.track = None;
            return;
        };
        let new_track = image.track_index(self.half_track as usize * 2);
        if new_track == self.track {
            return;
        }

        let old_len = self
            .track
            .and_then(|i| image.track(i))
            .map_or(0, |t| t.bit_count as usize);
        if let Some(old) = self.track {
            if !image.is_dirty() {
                if let Err(e) = image.evict(old) {
                    log::warn!("{}: {}", image.name(), e);
                }
            }
        }
        self.track = new_track;

        // 新しいトラック長に合わせて位置を比例換算する
        if let Some(index) = new_track {
            match image.load_track(index) {
                Ok(bits) if old_len > 0 => {
                    self.bit_pos = self.bit_pos * bits.bit_count as usize / old_len;
                }
                Ok(_) => {}
                Err(e) => log::warn!("{}: track {}: {}", image.name(), index, e),
            }
        }
    }

    /// 現在のトラックのビット列（読み込み済みなら）
    fn loaded_track(&mut self) -> Option<(&[u8], usize)> {
        let index = self.track?;
        let image = self.image.as_mut()?;
        let bits = image.load_track(index).ok()?;
        if bits.bit_count == 0 {
            return None;
        }
        Some((bits.bits.as_slice(), bits.bit_count as usize))
    }

    /// ヘッドの下の1ビットを読む
    fn next_bit(&mut self, rng: &mut StdRng) -> u8 {
        let mut pos = self.bit_pos;
        let bit = match self.loaded_track() {
            Some((bits, count)) => {
                pos %= count;
                let b = gcr::bit_at(bits, pos);
                pos = (pos + 1) % count;
                Some(b)
            }
            None => None,
        };
        self.bit_pos = pos;

        match bit {
            Some(true) => {
                self.zero_run = 0;
                1
            }
            Some(false) => {
                self.zero_run = self.zero_run.saturating_add(1);
                if self.zero_run > MAX_ZERO_RUN {
                    rng.gen_bool(0.3) as u8
                } else {
                    0
                }
            }
            // データのない領域はノイズ
            None => rng.gen_bool(0.5) as u8,
        }
    }

    /// 読まずにビット位置だけ進める
    fn skip_bits(&mut self, count: u64) {
        if let Some((_, len)) = self.loaded_track() {
            self.bit_pos = (self.bit_pos + (count % len as u64) as usize) % len;
        }
        self.zero_run = 0;
    }

    /// ヘッドの下に1ビット書く
    fn write_bit(&mut self, bit: bool) {
        let (Some(index), Some(image)) = (self.track, self.image.as_mut()) else {
            return;
        };
        if image.load_track(index).is_err() {
            return;
        }
        if let Some(track) = image.track_mut(index) {
            let count = track.bit_count as usize;
            if count == 0 {
                return;
            }
            let pos = self.bit_pos % count;
            gcr::set_bit(&mut track.bits, pos, bit);
            self.bit_pos = (pos + 1) % count;
        }
    }

    fn flush(&mut self, drive: usize) -> Result<(), DiskImageError> {
        self.flush_at = None;
        let Some(image) = self.image.as_mut() else {
            return Ok(());
        };
        if !image.is_dirty() {
            return Ok(());
        }
        let result = image.flush();
        log_flush(drive, result.is_ok());
        result
    }
}

type ActivityCallback = Box<dyn FnMut(usize, bool)>;

/// Disk II インターフェースカード
pub struct DiskController {
    drives: [DiskDrive; 2],
    curr_drive: usize,
    /// ステッパーの4つのマグネット
    magnet_states: u8,
    motor_on: bool,
    q6: bool,
    q7: bool,
    /// データレジスタ（CPUから見えるラッチ）
    latch: u8,
    shift_reg: u8,
    boot_rom: [u8; SLOT_ROM_SIZE],
    rng: StdRng,
    /// 読み捨てたビットの累計
    discarded_bits: u64,
    nibbles: NibbleRing,
    activity: Option<ActivityCallback>,
}

impl Default for DiskController {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskController {
    pub fn new() -> Self {
        DiskController {
            drives: [DiskDrive::new(), DiskDrive::new()],
            curr_drive: 0,
            magnet_states: 0,
            motor_on: false,
            q6: false,
            q7: false,
            latch: 0,
            shift_reg: 0,
            boot_rom: [0; SLOT_ROM_SIZE],
            rng: StdRng::seed_from_u64(0x3470),
            discarded_bits: 0,
            nibbles: NibbleRing::default(),
            activity: None,
        }
    }

    /// 外部ファイルからブートROMをロード
    pub fn load_boot_rom(&mut self, data: &[u8]) -> Result<(), &'static str> {
        if data.len() != SLOT_ROM_SIZE {
            return Err("Boot ROM must be exactly 256 bytes");
        }
        if data[..2] != BOOT_ROM_SIGNATURE {
            return Err("Invalid Disk II ROM signature");
        }
        self.boot_rom.copy_from_slice(data);
        Ok(())
    }

    /// ROMがロードされているかチェック
    pub fn is_rom_loaded(&self) -> bool {
        self.boot_rom[..2] == BOOT_ROM_SIGNATURE
    }

    /// ドライブのモーター状態が変わったときに呼ばれる (drive, spinning)
    pub fn set_activity_callback(&mut self, callback: ActivityCallback) {
        self.activity = Some(callback);
    }

    fn notify(&mut self, drive: usize, spinning: bool) {
        if let Some(cb) = self.activity.as_mut() {
            cb(drive, spinning);
        }
    }

    pub fn drive(&self, drive: usize) -> &DiskDrive {
        &self.drives[drive & 1]
    }

    pub fn drive_mut(&mut self, drive: usize) -> &mut DiskDrive {
        &mut self.drives[drive & 1]
    }

    pub fn current_drive(&self) -> usize {
        self.curr_drive
    }

    pub fn latch(&self) -> u8 {
        self.latch
    }

    pub fn discarded_bits(&self) -> u64 {
        self.discarded_bits
    }

    pub fn sequencer_function(&self) -> SequencerFunction {
        match (self.q7, self.q6) {
            (false, false) => SequencerFunction::ReadSequencing,
            (false, true) => SequencerFunction::CheckWriteProtAndInitWrite,
            (true, false) => SequencerFunction::DataShiftWrite,
            (true, true) => SequencerFunction::DataLoadWrite,
        }
    }

    /// 最近ラッチしたニブルをログに出す
    pub fn dump_recent_nibbles(&self, n: usize) {
        self.nibbles.dump(n);
    }

    //--------------------------------------------------
    // ディスクの出し入れ
    //--------------------------------------------------

    /// ディスクを挿入。失敗時はドライブの状態を変えない
    pub fn insert_disk(
        &mut self,
        drive: usize,
        storage: &dyn Storage,
        name: &str,
        write_protect: bool,
    ) -> Result<(), DiskImageError> {
        let image = DiskImage::open(storage, name)?;
        self.eject_disk(drive);

        let d = &mut self.drives[drive & 1];
        d.write_protected = write_protect || image.is_write_protected();
        d.image = Some(image);
        d.track = None;
        d.bit_pos = 0;
        d.zero_run = 0;
        d.update_track();
        log_insert(drive & 1, name);
        Ok(())
    }

    /// ディスクを排出（変更は書き戻す）
    pub fn eject_disk(&mut self, drive: usize) {
        let d = &mut self.drives[drive & 1];
        if d.image.is_none() {
            return;
        }
        if let Err(e) = d.flush(drive & 1) {
            log::error!("Drive {}: {}", (drive & 1) + 1, e);
        }
        d.image = None;
        d.track = None;
        log_eject(drive & 1);
    }

    /// ディスク1と2を入れ替え
    pub fn swap_disks(&mut self) {
        let [a, b] = &mut self.drives;
        std::mem::swap(&mut a.image, &mut b.image);
        std::mem::swap(&mut a.write_protected, &mut b.write_protected);
        for d in self.drives.iter_mut() {
            d.track = None;
            d.update_track();
        }
        log::info!("Disks swapped: Drive1 <-> Drive2");
    }

    /// ディスクの内容をセクタイメージで取り出す
    pub fn export_sectors(&mut self, drive: usize, order: SectorOrder) -> Result<Vec<u8>, DiskImageError> {
        match self.drives[drive & 1].image.as_mut() {
            Some(image) => image.export_sectors(order),
            None => Err(DiskImageError::NoDisk { drive: drive & 1 }),
        }
    }

    /// すべてのダーティトラックを書き戻す
    pub fn flush_all(&mut self) -> Result<(), DiskImageError> {
        for (i, d) in self.drives.iter_mut().enumerate() {
            d.flush(i)?;
        }
        Ok(())
    }

    //--------------------------------------------------
    // ソフトスイッチ
    //--------------------------------------------------

    fn handle_switch(&mut self, reg: u8, cycles: u64) {
        match reg {
            0x00..=0x07 => self.control_stepper(reg),
            0x08 => self.control_motor(false, cycles),
            0x09 => self.control_motor(true, cycles),
            0x0A => self.enable_drive(0, cycles),
            0x0B => self.enable_drive(1, cycles),
            0x0C => self.q6 = false,
            0x0D => self.q6 = true,
            0x0E => self.set_write_mode(false, cycles),
            0x0F => self.set_write_mode(true, cycles),
            _ => {}
        }
    }

    /// モーター制御
    fn control_motor(&mut self, on: bool, cycles: u64) {
        let drive = self.curr_drive;
        let d = &mut self.drives[drive];
        if on {
            let was_spinning = d.spin.is_spinning();
            d.start_spinning(cycles);
            if !self.motor_on {
                self.motor_on = true;
                log_motor_on(drive);
            }
            if !was_spinning {
                self.notify(drive, true);
            }
        } else {
            if d.spin == SpinState::SpinningIndefinite {
                d.spin = SpinState::SpinningTransient {
                    until: cycles + SPIN_DOWN_CYCLES,
                };
                d.flush_at = Some(cycles + FLUSH_DELAY_CYCLES);
            }
            if self.motor_on {
                self.motor_on = false;
                log_motor_off(drive);
            }
        }
    }

    /// ドライブ選択
    fn enable_drive(&mut self, drive: usize, cycles: u64) {
        if drive == self.curr_drive {
            return;
        }
        let old = self.curr_drive;
        self.curr_drive = drive;
        log_drive_select(drive);
        self.drives[old].flush_at = Some(cycles + FLUSH_DELAY_CYCLES);

        // モーターONのまま切り替えると旧ドライブは即停止
        if self.drives[old].spin == SpinState::SpinningIndefinite {
            self.drives[old].spin = SpinState::NotSpinning;
            self.notify(old, false);
            let was_spinning = self.drives[drive].spin.is_spinning();
            self.drives[drive].start_spinning(cycles);
            if !was_spinning {
                self.notify(drive, true);
            }
        }
    }

    /// ステッパーモーター制御
    fn control_stepper(&mut self, reg: u8) {
        let phase = (reg >> 1) & 3;
        let phase_bit = 1u8 << phase;
        if reg & 1 == 0 {
            self.magnet_states &= !phase_bit;
            return;
        }
        self.magnet_states |= phase_bit;

        let d = &mut self.drives[self.curr_drive];
        if !d.spin.is_spinning() {
            return;
        }
        let delta = STEP_TABLE[d.last_phase as usize][phase as usize];
        d.last_phase = phase;
        let new_half = (d.half_track as i16 + delta as i16).clamp(0, MAX_HALF_TRACK as i16) as u8;
        if new_half != d.half_track {
            log_track_change(d.half_track, new_half);
            d.half_track = new_half;
            d.update_track();
        }
    }

    fn set_write_mode(&mut self, on: bool, cycles: u64) {
        if on == self.q7 {
            return;
        }
        self.q7 = on;
        log_mode_change(on);
        if on {
            // 読み残したビットを飛ばして書き込み位置を現在時刻に合わせる
            let d = &mut self.drives[self.curr_drive];
            let target = d.elapsed_bits(cycles);
            if target > d.delivered {
                d.skip_bits(target - d.delivered);
                d.delivered = target;
            }
        }
    }

    //--------------------------------------------------
    // シーケンサ
    //--------------------------------------------------

    /// 読み取り: 経過時間分のビットをシフトレジスタに入れる
    fn shift_read(&mut self, cycles: u64) {
        let Self {
            drives,
            curr_drive,
            rng,
            shift_reg,
            latch,
            discarded_bits,
            nibbles,
            ..
        } = self;
        let d = &mut drives[*curr_drive];
        if d.image.is_none() || !d.spin.is_spinning() {
            return;
        }

        let mut deficit = d.elapsed_bits(cycles).saturating_sub(d.delivered);
        if deficit > BACKLOG_BITS {
            let skip = deficit - 8;
            d.skip_bits(skip);
            d.delivered += skip;
            *discarded_bits += skip;
            *shift_reg = 0;
            deficit = 8;
            log_backlog_discarded(skip);
        }

        while deficit > 0 {
            if *shift_reg & 0x80 != 0 {
                *shift_reg = 0;
            }
            let bit = d.next_bit(rng);
            d.delivered += 1;
            deficit -= 1;
            *shift_reg = (*shift_reg << 1) | bit;
            if *shift_reg & 0x80 != 0 {
                if is_enabled(DiskLogLevel::NIBBLE) {
                    nibbles.push(*shift_reg);
                }
                break;
            }
        }
        *latch = *shift_reg;
    }

    /// 書き込み: 空き時間分の0ビットを補ってからラッチの8ビットを書く
    fn shift_write(&mut self, cycles: u64) {
        let drive = self.curr_drive;
        let value = self.latch;
        let d = &mut self.drives[drive];
        if d.image.is_none() || !d.spin.is_spinning() {
            return;
        }
        if d.write_protected {
            log_write_ignored(drive);
            return;
        }

        // 前のバイトの8ビットを超えた経過分はシーケンサが0を送り出している
        let target = d.elapsed_bits(cycles);
        let track_len = d.loaded_track().map_or(0, |(_, n)| n as u64);
        let filler = target.saturating_sub(d.delivered).min(track_len);
        for _ in 0..filler {
            d.write_bit(false);
        }
        for i in 0..8 {
            d.write_bit(value & (0x80 >> i) != 0);
        }
        d.delivered = d.delivered.max(target) + 8;
        d.zero_run = 0;
    }

    /// 書き込み禁止センス（Q6H + Q7L）
    fn sense_write_protect(&mut self) {
        let wp = self.drives[self.curr_drive].write_protected;
        self.latch = if wp { self.latch | 0x80 } else { self.latch & 0x7F };
    }

    //--------------------------------------------------
    // 保守
    //--------------------------------------------------

    /// サイクル更新（惰性回転の終了と書き戻し期限）
    pub fn update(&mut self, cycles: u64) {
        for i in 0..self.drives.len() {
            if let SpinState::SpinningTransient { until } = self.drives[i].spin {
                if cycles >= until {
                    self.drives[i].spin = SpinState::NotSpinning;
                    log_spin_down(i);
                    self.notify(i, false);
                }
            }
            let d = &mut self.drives[i];
            if matches!(d.flush_at, Some(t) if cycles >= t) {
                if let Err(e) = d.flush(i) {
                    log::error!("Drive {}: {}", i + 1, e);
                }
            }
        }
    }

    //--------------------------------------------------
    // セーブステート
    //--------------------------------------------------

    fn write_drive(w: &mut StateWriter, d: &DiskDrive) {
        w.put_u8(magic::DRIVE);
        w.put_u8(d.half_track);
        w.put_u8(d.last_phase);
        match d.spin {
            SpinState::NotSpinning => {
                w.put_u8(0);
                w.put_u64(0);
            }
            SpinState::SpinningTransient { until } => {
                w.put_u8(1);
                w.put_u64(until);
            }
            SpinState::SpinningIndefinite => {
                w.put_u8(2);
                w.put_u64(0);
            }
        }
        w.put_u64(d.spin_up);
        w.put_u64(d.delivered);
        w.put_u32(d.bit_pos as u32);
        w.put_u8(d.zero_run);
        w.put_bool(d.flush_at.is_some());
        w.put_u64(d.flush_at.unwrap_or(0));
        w.put_bool(d.write_protected);
        w.put_str(d.image.as_ref().map_or("", |i| i.name()));
        w.put_u8(magic::DRIVE);
    }
}

/// 復元前に読み込んだドライブの状態
struct DriveRecord {
    half_track: u8,
    last_phase: u8,
    spin: SpinState,
    spin_up: u64,
    delivered: u64,
    bit_pos: usize,
    zero_run: u8,
    flush_at: Option<u64>,
    write_protected: bool,
    image_name: String,
}

/// 検証済みで、まだ反映していないコントローラの状態
struct StagedState {
    curr_drive: usize,
    magnet_states: u8,
    motor_on: bool,
    q6: bool,
    q7: bool,
    latch: u8,
    shift_reg: u8,
    discarded_bits: u64,
    records: [DriveRecord; 2],
    images: Vec<Option<DiskImage>>,
}

impl DriveRecord {
    fn read(r: &mut StateReader) -> Result<Self, SaveStateError> {
        r.expect_magic("drive", magic::DRIVE)?;
        let half_track = r.read_u8("half track")?;
        if half_track > MAX_HALF_TRACK {
            return Err(SaveStateError::InvalidValue {
                context: "half track",
                value: half_track as u64,
            });
        }
        let last_phase = r.read_u8("phase")? & 3;
        let tag = r.read_u8("spin state")?;
        let until = r.read_u64("spin deadline")?;
        let spin = match tag {
            0 => SpinState::NotSpinning,
            1 => SpinState::SpinningTransient { until },
            2 => SpinState::SpinningIndefinite,
            v => {
                return Err(SaveStateError::InvalidValue {
                    context: "spin state",
                    value: v as u64,
                })
            }
        };
        let spin_up = r.read_u64("spin up")?;
        let delivered = r.read_u64("delivered bits")?;
        let bit_pos = r.read_u32("bit position")? as usize;
        let zero_run = r.read_u8("zero run")?;
        let has_flush = r.read_bool("flush pending")?;
        let flush_at = r.read_u64("flush deadline")?;
        let write_protected = r.read_bool("write protect")?;
        let image_name = r.read_str("image name")?;
        r.expect_magic("drive", magic::DRIVE)?;
        Ok(DriveRecord {
            half_track,
            last_phase,
            spin,
            spin_up,
            delivered,
            bit_pos,
            zero_run,
            flush_at: has_flush.then_some(flush_at),
            write_protected,
            image_name,
        })
    }
}

impl Slot for DiskController {
    fn name(&self) -> &'static str {
        "Disk II"
    }

    /// I/O読み込み ($C0n0-$C0nF)
    fn io_read(&mut self, reg: u8, cycles: u64) -> u8 {
        let reg = reg & 0x0F;
        self.handle_switch(reg, cycles);
        match reg {
            0x0C if self.q7 => self.shift_write(cycles),
            0x0C => self.shift_read(cycles),
            0x0D if !self.q7 => self.sense_write_protect(),
            _ => {}
        }
        // 偶数アドレスのみラッチを返す
        if reg & 1 == 0 {
            self.latch
        } else {
            FLOATING_BUS
        }
    }

    /// I/O書き込み ($C0n0-$C0nF)
    fn io_write(&mut self, reg: u8, value: u8, cycles: u64) {
        let reg = reg & 0x0F;
        self.handle_switch(reg, cycles);
        match reg {
            0x0C if self.q7 => self.shift_write(cycles),
            0x0C => self.shift_read(cycles),
            _ => {}
        }
        // データロード書き込みモードならラッチに値を設定
        if self.sequencer_function() == SequencerFunction::DataLoadWrite {
            self.latch = value;
        }
    }

    fn load_rom(&self, rom: &mut [u8; SLOT_ROM_SIZE]) {
        rom.copy_from_slice(&self.boot_rom);
    }

    /// リセット（ヘッド位置とディスクはそのまま）
    fn reset(&mut self) {
        self.latch = 0;
        self.shift_reg = 0;
        self.magnet_states = 0;
        self.motor_on = false;
        self.q6 = false;
        self.q7 = false;
        self.curr_drive = 0;
        for i in 0..self.drives.len() {
            let was_spinning = self.drives[i].spin.is_spinning();
            self.drives[i].spin = SpinState::NotSpinning;
            if was_spinning {
                self.notify(i, false);
            }
        }
    }

    fn update(&mut self, cycles: u64) {
        DiskController::update(self, cycles);
    }

    fn save_state(&mut self) -> Result<Option<Vec<u8>>, SaveStateError> {
        self.flush_all()?;
        let mut w = StateWriter::new();
        w.put_u8(self.curr_drive as u8);
        w.put_u8(self.magnet_states);
        w.put_bool(self.motor_on);
        w.put_bool(self.q6);
        w.put_bool(self.q7);
        w.put_u8(self.latch);
        w.put_u8(self.shift_reg);
        w.put_u64(self.discarded_bits);
        for d in &self.drives {
            Self::write_drive(&mut w, d);
        }
        Ok(Some(w.into_bytes()))
    }

    fn prepare_state(
        &self,
        data: &[u8],
        storage: &dyn Storage,
    ) -> Result<Box<dyn Any>, SaveStateError> {
        let mut r = StateReader::new(data);
        let curr_drive = r.read_u8("current drive")? as usize & 1;
        let magnet_states = r.read_u8("magnets")? & 0x0F;
        let motor_on = r.read_bool("motor")?;
        let q6 = r.read_bool("q6")?;
        let q7 = r.read_bool("q7")?;
        let latch = r.read_u8("latch")?;
        let shift_reg = r.read_u8("shift register")?;
        let discarded_bits = r.read_u64("discarded bits")?;
        let records = [DriveRecord::read(&mut r)?, DriveRecord::read(&mut r)?];

        // イメージはここで開いておく
        let mut images = Vec::with_capacity(2);
        for rec in &records {
            images.push(if rec.image_name.is_empty() {
                None
            } else {
                Some(DiskImage::open(storage, &rec.image_name)?)
            });
        }

        Ok(Box::new(StagedState {
            curr_drive,
            magnet_states,
            motor_on,
            q6,
            q7,
            latch,
            shift_reg,
            discarded_bits,
            records,
            images,
        }))
    }

    fn commit_state(&mut self, staged: Box<dyn Any>) {
        let Ok(state) = staged.downcast::<StagedState>() else {
            log::error!("Disk II: staged state of another card ignored");
            return;
        };
        let state = *state;

        for i in 0..2 {
            self.eject_disk(i);
        }
        self.curr_drive = state.curr_drive;
        self.magnet_states = state.magnet_states;
        self.motor_on = state.motor_on;
        self.q6 = state.q6;
        self.q7 = state.q7;
        self.latch = state.latch;
        self.shift_reg = state.shift_reg;
        self.discarded_bits = state.discarded_bits;
        for ((d, rec), image) in self.drives.iter_mut().zip(state.records).zip(state.images) {
            d.image = image;
            d.half_track = rec.half_track;
            d.last_phase = rec.last_phase;
            d.spin = rec.spin;
            d.spin_up = rec.spin_up;
            d.delivered = rec.delivered;
            d.zero_run = rec.zero_run;
            d.flush_at = rec.flush_at;
            d.write_protected = rec.write_protected;
            d.track = None;
            d.update_track();
            d.bit_pos = rec.bit_pos;
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcr::{BYTES_PER_TRACK, DSK_SIZE};
    use crate::storage::MemoryStorage;
    use std::cell::RefCell;
    use std::rc::Rc;

    const BIT_CYCLES: u64 = 4;

    fn storage_with_dsk(name: &str) -> MemoryStorage {
        let storage = MemoryStorage::new();
        let mut data = vec![0u8; DSK_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i / BYTES_PER_TRACK) as u8;
        }
        storage.insert(name, data);
        storage
    }

    /// 1ビットセルごとにポーリングし、ラッチの最上位が立った瞬間のバイトを集める
    fn poll_nibbles(disk: &mut DiskController, start: u64, count: usize) -> (Vec<u8>, u64) {
        let mut out = Vec::new();
        let mut cycles = start;
        let mut prev = 0u8;
        while out.len() < count {
            cycles += BIT_CYCLES;
            let v = disk.io_read(0x0C, cycles);
            if v & 0x80 != 0 && prev & 0x80 == 0 {
                out.push(v);
            }
            prev = v;
        }
        (out, cycles)
    }

    #[test]
    fn test_read_address_prolog_from_flat_image() {
        let storage = storage_with_dsk("boot.dsk");
        let mut disk = DiskController::new();
        disk.insert_disk(0, &storage, "boot.dsk", false).unwrap();

        disk.io_read(0x0A, 0); // drive 1
        disk.io_read(0x09, 0); // motor on
        disk.io_read(0x0E, 0); // read mode
        assert_eq!(disk.drive(0).half_track(), 0);

        let (nibbles, _) = poll_nibbles(&mut disk, 0, 60);
        let at = nibbles
            .windows(3)
            .position(|w| w == [0xD5, 0xAA, 0x96])
            .expect("address prolog");
        // 自己同期バイトのあと
        assert!(nibbles[..at].iter().all(|b| *b == 0xFF));
        assert_eq!(at, 48);
        // ボリューム254, トラック0
        assert_eq!(&nibbles[at + 3..at + 7], &[0xFF, 0xFE, 0xAA, 0xAA]);
        assert_eq!(disk.discarded_bits(), 0);
    }

    #[test]
    fn test_latch_holds_until_next_bit() {
        let storage = storage_with_dsk("a.dsk");
        let mut disk = DiskController::new();
        disk.insert_disk(0, &storage, "a.dsk", false).unwrap();
        disk.io_read(0x09, 0);
        // 最初の同期バイトFFは8ビット目で完成
        assert_eq!(disk.io_read(0x0C, 8 * BIT_CYCLES), 0xFF);
        assert_eq!(disk.io_read(0x0C, 8 * BIT_CYCLES), 0xFF);
        assert_eq!(disk.io_read(0x0C, 9 * BIT_CYCLES), 0x00);
    }

    #[test]
    fn test_backlog_is_discarded() {
        let storage = storage_with_dsk("a.dsk");
        let mut disk = DiskController::new();
        disk.insert_disk(0, &storage, "a.dsk", false).unwrap();
        disk.io_read(0x09, 0);
        disk.io_read(0x0C, 1000 * BIT_CYCLES);
        assert_eq!(disk.discarded_bits(), 1000 - 8);
    }

    #[test]
    fn test_stepper_sequence() {
        let storage = storage_with_dsk("a.dsk");
        let mut disk = DiskController::new();
        disk.insert_disk(0, &storage, "a.dsk", false).unwrap();
        disk.io_read(0x09, 0);

        // 内側へ: 1,2,3,0 を順にON/OFF
        let mut positions = Vec::new();
        for phase in [1u8, 2, 3, 0, 1, 2] {
            disk.io_read(phase * 2 + 1, 0);
            disk.io_read(phase * 2, 0);
            positions.push(disk.drive(0).half_track());
        }
        assert_eq!(positions, vec![1, 2, 3, 4, 5, 6]);

        // 外側へ: 1→0→3→2 は単調に減少し0未満にならない
        let mut positions = Vec::new();
        for _ in 0..3 {
            for phase in [1u8, 0, 3, 2] {
                disk.io_read(phase * 2 + 1, 0);
                disk.io_read(phase * 2, 0);
                positions.push(disk.drive(0).half_track());
            }
        }
        assert!(positions.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*positions.last().unwrap(), 0);
    }

    /// フェーズを順にON/OFFし、各ステップ後のハーフトラックを返す
    fn step_phases(disk: &mut DiskController, phases: &[u8]) -> Vec<u8> {
        phases
            .iter()
            .map(|&phase| {
                disk.io_read(phase * 2 + 1, 0);
                disk.io_read(phase * 2, 0);
                disk.drive(0).half_track()
            })
            .collect()
    }

    #[test]
    fn test_stepper_from_fresh_drive_clamps_at_zero() {
        let storage = storage_with_dsk("a.dsk");
        let mut disk = DiskController::new();
        disk.insert_disk(0, &storage, "a.dsk", false).unwrap();
        disk.io_read(0x09, 0);
        assert_eq!(disk.drive(0).half_track(), 0);

        // 直前のフェーズは0: 1で内側へ1つ、以降は0で止まる
        assert_eq!(step_phases(&mut disk, &[1, 0, 3, 2]), vec![1, 0, 0, 0]);
        assert_eq!(step_phases(&mut disk, &[1, 0, 3, 2]), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_stepper_clamps_at_outer_limit_then_returns() {
        let storage = storage_with_dsk("a.dsk");
        let mut disk = DiskController::new();
        disk.insert_disk(0, &storage, "a.dsk", false).unwrap();
        disk.io_read(0x09, 0);
        let phases: Vec<u8> = (0..100u8).map(|i| (i + 1) & 3).collect();
        step_phases(&mut disk, &phases);
        assert_eq!(disk.drive(0).half_track(), MAX_HALF_TRACK);

        // さらに内側へは動かず、外側へは1つずつ戻る
        assert_eq!(step_phases(&mut disk, &[1]), vec![MAX_HALF_TRACK]);
        assert_eq!(step_phases(&mut disk, &[0, 3]), vec![MAX_HALF_TRACK - 1, MAX_HALF_TRACK - 2]);
    }

    #[test]
    fn test_stepper_needs_spinning_drive() {
        let mut disk = DiskController::new();
        disk.io_read(0x03, 0);
        assert_eq!(disk.drive(0).half_track(), 0);

        // モーターを回す前はディスクがあっても動かない
        let storage = storage_with_dsk("a.dsk");
        disk.insert_disk(0, &storage, "a.dsk", false).unwrap();
        assert_eq!(step_phases(&mut disk, &[1, 2, 3]), vec![0, 0, 0]);

        disk.io_read(0x09, 0);
        assert_eq!(step_phases(&mut disk, &[0, 1, 2]), vec![0, 1, 2]);

        // モーターOFFから停止するまでは回っている
        disk.io_read(0x08, 100);
        assert_eq!(step_phases(&mut disk, &[3]), vec![3]);
        disk.update(100 + SPIN_DOWN_CYCLES);
        assert_eq!(disk.drive(0).spin_state(), SpinState::NotSpinning);
        assert_eq!(step_phases(&mut disk, &[0, 1, 2]), vec![3, 3, 3]);
    }

    #[test]
    fn test_export_without_disk() {
        let mut disk = DiskController::new();
        assert!(matches!(
            disk.export_sectors(1, SectorOrder::Dos),
            Err(DiskImageError::NoDisk { drive: 1 })
        ));
    }

    #[test]
    fn test_spin_states_and_activity() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        let mut disk = DiskController::new();
        disk.set_activity_callback(Box::new(move |d, on| sink.borrow_mut().push((d, on))));

        disk.io_read(0x09, 10);
        assert_eq!(disk.drive(0).spin_state(), SpinState::SpinningIndefinite);
        disk.io_read(0x08, 100);
        assert_eq!(
            disk.drive(0).spin_state(),
            SpinState::SpinningTransient {
                until: 100 + SPIN_DOWN_CYCLES
            }
        );
        disk.update(100 + SPIN_DOWN_CYCLES - 1);
        assert!(disk.drive(0).spin_state().is_spinning());
        disk.update(100 + SPIN_DOWN_CYCLES);
        assert_eq!(disk.drive(0).spin_state(), SpinState::NotSpinning);
        assert_eq!(*events.borrow(), vec![(0, true), (0, false)]);
    }

    #[test]
    fn test_drive_switch_while_motor_on() {
        let mut disk = DiskController::new();
        disk.io_read(0x09, 0);
        disk.io_read(0x0B, 50);
        assert_eq!(disk.current_drive(), 1);
        assert_eq!(disk.drive(0).spin_state(), SpinState::NotSpinning);
        assert_eq!(disk.drive(1).spin_state(), SpinState::SpinningIndefinite);
    }

    #[test]
    fn test_write_protect_sense() {
        let storage = storage_with_dsk("a.dsk");
        let mut disk = DiskController::new();
        disk.insert_disk(0, &storage, "a.dsk", true).unwrap();
        disk.io_read(0x0D, 0);
        assert_eq!(disk.io_read(0x0E, 0) & 0x80, 0x80);

        disk.insert_disk(0, &storage, "a.dsk", false).unwrap();
        disk.io_read(0x0D, 0);
        assert_eq!(disk.io_read(0x0E, 0) & 0x80, 0);
    }

    /// ビット列をラッチ単位に分け、各ニブルの先頭の0を含めたビット幅を返す
    fn nibble_widths(bits: &[u8], bit_count: usize) -> Vec<(u8, u64)> {
        let mut out = Vec::new();
        let mut shift = 0u8;
        let mut width = 0u64;
        for i in 0..bit_count {
            shift = (shift << 1) | gcr::bit_at(bits, i) as u8;
            width += 1;
            if shift & 0x80 != 0 {
                out.push((shift, width));
                shift = 0;
                width = 0;
            }
        }
        out
    }

    #[test]
    fn test_write_then_flush_on_deadline() {
        let storage = storage_with_dsk("w.dsk");
        let mut disk = DiskController::new();
        disk.insert_disk(0, &storage, "w.dsk", false).unwrap();
        disk.io_read(0x09, 0);

        // トラック0全体を0x42で書き直す（自己同期バイトは10ビット間隔）
        let sectors = vec![0x42u8; BYTES_PER_TRACK];
        let (bits, bit_count) = gcr::encode_track(&sectors, 0, gcr::DEFAULT_VOLUME, SectorOrder::Dos);

        disk.io_write(0x0F, 0xFF, 0);
        let mut written = 0u64;
        let mut cycles = 0;
        for (nib, width) in nibble_widths(&bits, bit_count as usize) {
            written += width;
            cycles = (written - 8) * BIT_CYCLES;
            disk.io_write(0x0D, nib, cycles);
            disk.io_read(0x0C, cycles);
        }
        disk.io_read(0x0E, cycles);
        assert!(disk.drive(0).status().dirty);

        disk.io_read(0x08, cycles);
        disk.update(cycles + FLUSH_DELAY_CYCLES);
        assert!(!disk.drive(0).status().dirty);
        assert_eq!(disk.drive(0).spin_state(), SpinState::NotSpinning);
        let saved = storage.contents("w.dsk").unwrap();
        assert!(saved[..BYTES_PER_TRACK].iter().all(|b| *b == 0x42));
        assert!(saved[BYTES_PER_TRACK..2 * BYTES_PER_TRACK].iter().all(|b| *b == 1));
    }

    #[test]
    fn test_write_protected_disk_is_not_modified() {
        let storage = storage_with_dsk("ro.dsk");
        let mut disk = DiskController::new();
        disk.insert_disk(0, &storage, "ro.dsk", true).unwrap();
        disk.io_read(0x09, 0);
        disk.io_write(0x0F, 0x00, 0);
        disk.io_write(0x0D, 0x96, 0);
        disk.io_read(0x0C, 32);
        assert!(!disk.drive(0).status().dirty);
    }

    #[test]
    fn test_insert_failure_keeps_drive() {
        let storage = storage_with_dsk("a.dsk");
        storage.insert("bad.bin", vec![0; 10]);
        let mut disk = DiskController::new();
        disk.insert_disk(0, &storage, "a.dsk", false).unwrap();
        assert!(disk.insert_disk(0, &storage, "bad.bin", false).is_err());
        assert_eq!(disk.drive(0).status().disk.as_deref(), Some("a.dsk"));
        assert!(disk.insert_disk(1, &storage, "missing.dsk", false).is_err());
        assert!(disk.drive(1).image().is_none());
    }

    #[test]
    fn test_swap_and_export() {
        let storage = storage_with_dsk("a.dsk");
        let mut disk = DiskController::new();
        disk.insert_disk(0, &storage, "a.dsk", false).unwrap();
        disk.swap_disks();
        assert!(disk.drive(0).image().is_none());
        let data = disk.export_sectors(1, SectorOrder::Dos).unwrap();
        assert_eq!(data, storage.contents("a.dsk").unwrap());
    }

    #[test]
    fn test_boot_rom_signature() {
        let mut disk = DiskController::new();
        assert!(!disk.is_rom_loaded());
        assert!(disk.load_boot_rom(&[0u8; 256]).is_err());
        assert!(disk.load_boot_rom(&[0xA2; 10]).is_err());
        let mut rom = [0u8; 256];
        rom[0] = 0xA2;
        rom[1] = 0x20;
        disk.load_boot_rom(&rom).unwrap();
        let mut window = [0u8; SLOT_ROM_SIZE];
        disk.load_rom(&mut window);
        assert_eq!(window[..2], [0xA2, 0x20]);
    }

    #[test]
    fn test_save_and_load_state() {
        let storage = storage_with_dsk("s.dsk");
        let mut disk = DiskController::new();
        disk.insert_disk(1, &storage, "s.dsk", false).unwrap();
        disk.io_read(0x0B, 0);
        disk.io_read(0x09, 0);
        for reg in [0x03, 0x02, 0x05, 0x04] {
            disk.io_read(reg, 0);
        }
        poll_nibbles(&mut disk, 0, 20);

        let blob = disk.save_state().unwrap().unwrap();
        let mut restored = DiskController::new();
        restored.load_state(&blob, &storage).unwrap();
        assert_eq!(restored.current_drive(), 1);
        assert_eq!(restored.drive(1).half_track(), 2);
        assert_eq!(restored.drive(1).spin_state(), SpinState::SpinningIndefinite);
        assert_eq!(restored.drive(1).status().disk.as_deref(), Some("s.dsk"));
        assert_eq!(restored.drive(1).bit_pos, disk.drive(1).bit_pos);
        assert_eq!(restored.latch(), disk.latch());

        // 壊れたレコードは何も変えない
        let mut broken = blob.clone();
        // 先頭15バイトはコントローラ、その次がドライブ1のレコード
        broken[15] = 0x00;
        let mut other = DiskController::new();
        assert!(other.load_state(&broken, &storage).is_err());
        assert!(other.drive(1).image().is_none());
    }
}
