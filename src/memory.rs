//! Apple II メモリサブシステム
//!
//! Apple IIのメモリマップとソフトスイッチを実装。
//! 64KBのアドレス空間を256ページに分け、ページごとに読み込み元と
//! 書き込み先の物理オフセットを持つ。ソフトスイッチが変わるたびに
//! 全ページを決まった優先順位で引き直す。

use crate::cpu::MemoryBus;
use crate::savestate::{magic, SaveStateError, StateReader, StateWriter};
use crate::slot::{Slot, EXPANSION_ROM_SIZE, SLOT_ROM_SIZE};
use serde::{Deserialize, Serialize};

/// 何もつながっていないI/Oの読み値
pub const FLOATING_BUS: u8 = 0xA0;

/// スロット数（スロット0は未使用）
pub const NUM_SLOTS: usize = 8;

// 物理アリーナ内のオフセット
const MAIN_RAM: usize = 0x0_0000;
const AUX_RAM: usize = 0x1_0000;
const MAIN_LC_BANK2: usize = 0x2_0000;
const AUX_LC_BANK2: usize = 0x2_1000;
const ROM: usize = 0x2_2000;
const SLOT_ROMS: usize = 0x2_6000;
const EXPANSION_ROMS: usize = SLOT_ROMS + NUM_SLOTS * SLOT_ROM_SIZE;
const EMPTY_PAGE: usize = EXPANSION_ROMS + NUM_SLOTS * EXPANSION_ROM_SIZE;
/// 書き込み禁止ページの書き込み先（読み出されることはない）
const SINK_PAGE: usize = EMPTY_PAGE + 0x100;
const ARENA_SIZE: usize = SINK_PAGE + 0x100;

const ROM_SIZE: usize = 0x4000;

/// Apple IIのモデル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppleModel {
    AppleIIPlus,
    AppleIIe,
    AppleIIeEnhanced,
}

impl AppleModel {
    pub fn is_iie(self) -> bool {
        matches!(self, AppleModel::AppleIIe | AppleModel::AppleIIeEnhanced)
    }

    /// 65C02を載せているか
    pub fn has_65c02(self) -> bool {
        self == AppleModel::AppleIIeEnhanced
    }
}

/// `read_direct` で指定する物理バンク
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    Main,
    Aux,
    /// $D000-$DFFF の第2バンク
    MainLcBank2,
    AuxLcBank2,
    /// $C000-$FFFF の内蔵ROM
    Rom,
}

/// ビデオメモリへの書き込み通知先
pub trait VideoSink {
    fn memory_written(&mut self, address: u16, aux: bool, value: u8);
}

/// ソフトスイッチの状態
#[derive(Debug, Clone, PartialEq)]
pub struct SoftSwitches {
    pub keyboard_latch: u8,
    pub text_mode: bool,
    pub mixed_mode: bool,
    pub page2: bool,
    pub hires: bool,
    pub store_80: bool,
    pub col_80: bool,
    pub alt_char: bool,
    pub dhires: bool,         // ダブルHi-Resモード
    pub ioudis: bool,         // IOU disable (DHIRESアクセス制御)
    pub lc_bank2: bool,
    pub lc_read_enable: bool,
    pub lc_write_enable: bool,
    pub lc_prewrite: bool,
    pub ramrd: bool,
    pub ramwrt: bool,
    pub altzp: bool,
    pub intcxrom: bool,       // $C100-$CFFF を内蔵ROMに
    pub slotc3rom: bool,      // $C300 をスロットROMに
    pub intc8rom: bool,       // $C3xx アクセス後の内蔵 $C800 ROM
    pub annunciator: [bool; 4],

    // ゲームコントローラ
    pub buttons: [bool; 3],   // $C061-$C063
    pub paddles: [u8; 4],     // $C064-$C067 (0-255)
    pub paddle_trigger_cycle: u64,
}

impl Default for SoftSwitches {
    fn default() -> Self {
        SoftSwitches {
            keyboard_latch: 0,
            text_mode: true,      // 起動時はテキストモード
            mixed_mode: false,
            page2: false,
            hires: false,
            store_80: false,
            col_80: false,
            alt_char: false,
            dhires: false,
            ioudis: true,
            // バンク1選択、ROM読み込み、RAM書き込み可
            lc_bank2: false,
            lc_read_enable: false,
            lc_write_enable: true,
            lc_prewrite: false,
            ramrd: false,
            ramwrt: false,
            altzp: false,
            intcxrom: false,
            slotc3rom: false,
            intc8rom: false,
            annunciator: [false; 4],
            buttons: [false; 3],
            paddles: [128; 4],    // 中央位置
            paddle_trigger_cycle: 0,
        }
    }
}

/// Apple IIメモリシステム
pub struct Memory {
    model: AppleModel,
    arena: Box<[u8]>,
    read_pages: [usize; 256],
    write_pages: [usize; 256],
    /// ロードしたROMイメージ（リセット時に再展開）
    rom_image: Vec<u8>,
    pub switches: SoftSwitches,
    slots: [Option<Box<dyn Slot>>; NUM_SLOTS],
    /// $C800-$CFFF を占有しているスロット
    active_expansion: Option<usize>,
    video: Option<Box<dyn VideoSink>>,
    /// 現在のCPUサイクル（CPUから設定）
    cycles: u64,
    /// $C030 アクセス回数
    speaker_toggles: u64,
}

impl Memory {
    pub fn new(model: AppleModel) -> Self {
        let mut arena = vec![0u8; ARENA_SIZE].into_boxed_slice();
        arena[ROM..ROM + ROM_SIZE].fill(0xFF);
        arena[SLOT_ROMS..SINK_PAGE].fill(FLOATING_BUS);
        let mut mem = Memory {
            model,
            arena,
            read_pages: [MAIN_RAM; 256],
            write_pages: [MAIN_RAM; 256],
            rom_image: Vec::new(),
            switches: SoftSwitches::default(),
            slots: std::array::from_fn(|_| None),
            active_expansion: None,
            video: None,
            cycles: 0,
            speaker_toggles: 0,
        };
        mem.update_pages();
        mem
    }

    pub fn model(&self) -> AppleModel {
        self.model
    }

    pub fn is_iie(&self) -> bool {
        self.model.is_iie()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn speaker_toggles(&self) -> u64 {
        self.speaker_toggles
    }

    pub fn set_video_sink(&mut self, sink: Box<dyn VideoSink>) {
        self.video = Some(sink);
    }

    /// ROMを読み込む
    ///
    /// 12KB: $D000-$FFFF (Apple II+)、16KB: $C000-$FFFF、
    /// 20KB: II+ パッケージ（後半12KBがモニタ）、32KB: Apple IIe（後半16KB）
    pub fn load_rom(&mut self, rom_data: &[u8]) -> Result<(), &'static str> {
        let mut image = vec![0xFF; ROM_SIZE];
        match rom_data.len() {
            12288 => image[0x1000..].copy_from_slice(rom_data),
            16384 => image.copy_from_slice(rom_data),
            20480 => image[0x1000..].copy_from_slice(&rom_data[0x2000..]),
            32768 => image.copy_from_slice(&rom_data[0x4000..]),
            _ => return Err("ROM must be 12KB, 16KB, 20KB or 32KB"),
        }
        log::info!(
            "Loaded {}KB ROM, reset vector ${:02X}{:02X}",
            rom_data.len() / 1024,
            image[0x3FFD],
            image[0x3FFC]
        );
        self.rom_image = image;
        self.reload_rom();
        Ok(())
    }

    fn reload_rom(&mut self) {
        if self.rom_image.len() == ROM_SIZE {
            self.arena[ROM..ROM + ROM_SIZE].copy_from_slice(&self.rom_image);
        }
    }

    //--------------------------------------------------
    // スロット
    //--------------------------------------------------

    /// スロット1-7にカードを挿し、ファームウェアをすぐにロードする
    pub fn set_slot(&mut self, n: usize, card: Box<dyn Slot>) {
        if !(1..NUM_SLOTS).contains(&n) {
            log::warn!("Invalid slot number {}", n);
            return;
        }
        log::info!("Slot {}: {}", n, card.name());
        self.slots[n] = Some(card);
        self.load_slot_rom(n);
        self.update_pages();
    }

    pub fn remove_slot(&mut self, n: usize) -> Option<Box<dyn Slot>> {
        let card = self.slots.get_mut(n)?.take();
        if self.active_expansion == Some(n) {
            self.active_expansion = None;
        }
        self.load_slot_rom(n);
        self.update_pages();
        card
    }

    fn load_slot_rom(&mut self, n: usize) {
        let rom_at = SLOT_ROMS + n * SLOT_ROM_SIZE;
        let exp_at = EXPANSION_ROMS + n * EXPANSION_ROM_SIZE;
        self.arena[exp_at..exp_at + EXPANSION_ROM_SIZE].fill(FLOATING_BUS);
        match self.slots[n].as_ref() {
            Some(card) => {
                let mut rom = [0u8; SLOT_ROM_SIZE];
                card.load_rom(&mut rom);
                self.arena[rom_at..rom_at + SLOT_ROM_SIZE].copy_from_slice(&rom);
                if let Some(exp) = card.expansion_rom() {
                    let len = exp.len().min(EXPANSION_ROM_SIZE);
                    self.arena[exp_at..exp_at + len].copy_from_slice(&exp[..len]);
                }
            }
            None => self.arena[rom_at..rom_at + SLOT_ROM_SIZE].fill(FLOATING_BUS),
        }
    }

    pub fn slot(&self, n: usize) -> Option<&dyn Slot> {
        self.slots.get(n)?.as_deref()
    }

    /// スロットのカードを具体型で取り出す
    pub fn slot_ref<T: Slot>(&self, n: usize) -> Option<&T> {
        self.slots.get(n)?.as_ref()?.as_any().downcast_ref::<T>()
    }

    pub fn slot_mut<T: Slot>(&mut self, n: usize) -> Option<&mut T> {
        self.slots.get_mut(n)?.as_mut()?.as_any_mut().downcast_mut::<T>()
    }

    pub(crate) fn slot_dyn_mut(&mut self, n: usize) -> Option<&mut (dyn Slot + 'static)> {
        self.slots.get_mut(n)?.as_deref_mut()
    }

    /// 全スロットの定期処理
    pub fn update_slots(&mut self) {
        let cycles = self.cycles;
        for card in self.slots.iter_mut().flatten() {
            card.update(cycles);
        }
    }

    //--------------------------------------------------
    // リセット
    //--------------------------------------------------

    /// 電源投入状態: RAMクリア、ROM再展開、カードのリセット、スイッチ初期化
    pub fn reset(&mut self) {
        self.reset_ram();
        self.reload_rom();
        for n in 1..NUM_SLOTS {
            if let Some(card) = self.slots[n].as_mut() {
                card.reset();
            }
            self.load_slot_rom(n);
        }
        self.reset_switches();
    }

    /// RAMバンクをすべてゼロにする
    pub fn reset_ram(&mut self) {
        self.arena[MAIN_RAM..ROM].fill(0);
    }

    /// ソフトスイッチだけを初期状態に戻す（ウォームリセット）
    pub fn reset_switches(&mut self) {
        let keyboard_latch = self.switches.keyboard_latch;
        self.switches = SoftSwitches {
            keyboard_latch,
            ..SoftSwitches::default()
        };
        self.active_expansion = None;
        self.update_pages();
    }

    //--------------------------------------------------
    // ページテーブル
    //--------------------------------------------------

    /// 全ページの読み書き先を引き直す
    pub fn update_pages(&mut self) {
        let sw = &self.switches;
        let iie = self.model.is_iie();

        for page in 0..256usize {
            let mut read = MAIN_RAM + (page << 8);
            let mut write = read;

            // (1) 補助メモリの読み書き選択
            if (0x02..=0xBF).contains(&page) {
                if sw.ramrd {
                    read = AUX_RAM + (page << 8);
                }
                if sw.ramwrt {
                    write = AUX_RAM + (page << 8);
                }
            }

            // (2) 80STORE: テキストページ（HIRESならHi-Resページも）はPAGE2で選ぶ
            if sw.store_80
                && ((0x04..=0x07).contains(&page) || (sw.hires && (0x20..=0x3F).contains(&page)))
            {
                let bank = if sw.page2 { AUX_RAM } else { MAIN_RAM };
                read = bank + (page << 8);
                write = read;
            }

            // (3) $C100-$CFFF: 内蔵ROMかカードROMか
            if (0xC0..=0xCF).contains(&page) {
                read = self.io_page_source(page, iie);
                write = SINK_PAGE;
            }

            // (4) ゼロページとスタック
            if page <= 0x01 && sw.altzp {
                read = AUX_RAM + (page << 8);
                write = read;
            }

            // (5) ランゲージカード
            if page >= 0xD0 {
                let ram = if sw.altzp { AUX_RAM } else { MAIN_RAM };
                let lc = if page < 0xE0 && sw.lc_bank2 {
                    let bank2 = if sw.altzp { AUX_LC_BANK2 } else { MAIN_LC_BANK2 };
                    bank2 + ((page - 0xD0) << 8)
                } else {
                    ram + (page << 8)
                };
                read = if sw.lc_read_enable { lc } else { ROM + ((page - 0xC0) << 8) };
                write = if sw.lc_write_enable { lc } else { SINK_PAGE };
            }

            self.read_pages[page] = read;
            self.write_pages[page] = write;
        }
    }

    fn io_page_source(&self, page: usize, iie: bool) -> usize {
        let sw = &self.switches;
        let internal = ROM + ((page - 0xC0) << 8);
        match page {
            // $C0xx はI/O処理が先に取るので読み出されない
            0xC0 => EMPTY_PAGE,
            0xC1..=0xC7 => {
                let slot = page - 0xC0;
                if iie && (sw.intcxrom || (slot == 3 && !sw.slotc3rom)) {
                    internal
                } else {
                    SLOT_ROMS + slot * SLOT_ROM_SIZE
                }
            }
            _ => {
                if iie && (sw.intcxrom || sw.intc8rom) {
                    internal
                } else if let Some(slot) = self.active_expansion {
                    EXPANSION_ROMS + slot * EXPANSION_ROM_SIZE + ((page - 0xC8) << 8)
                } else {
                    EMPTY_PAGE
                }
            }
        }
    }

    /// $C100-$CFFF アクセスによる拡張ROMの切り替え
    fn select_expansion(&mut self, address: u16) {
        let page = (address >> 8) as usize;
        let before = (self.active_expansion, self.switches.intc8rom);
        if address == 0xCFFF {
            self.active_expansion = None;
            self.switches.intc8rom = false;
        } else if (0xC1..=0xC7).contains(&page) {
            let slot = page - 0xC0;
            if self.is_iie() && slot == 3 && !self.switches.slotc3rom {
                self.switches.intc8rom = true;
            } else if !(self.is_iie() && self.switches.intcxrom) {
                let has_rom = self.slots[slot].as_ref().map_or(false, |c| c.expansion_rom().is_some());
                if has_rom {
                    self.active_expansion = Some(slot);
                }
            }
        }
        if before != (self.active_expansion, self.switches.intc8rom) {
            self.update_pages();
        }
    }

    pub fn read_page(&self, page: u8) -> usize {
        self.read_pages[page as usize]
    }

    pub fn write_page(&self, page: u8) -> usize {
        self.write_pages[page as usize]
    }

    /// ソフトスイッチを通さず物理バンクを直接読む
    pub fn read_direct(&self, address: u16, bank: Bank) -> u8 {
        let a = address as usize;
        let offset = match bank {
            Bank::Main => MAIN_RAM + a,
            Bank::Aux => AUX_RAM + a,
            Bank::MainLcBank2 | Bank::AuxLcBank2 if !(0xD000..0xE000).contains(&a) => return FLOATING_BUS,
            Bank::MainLcBank2 => MAIN_LC_BANK2 + a - 0xD000,
            Bank::AuxLcBank2 => AUX_LC_BANK2 + a - 0xD000,
            Bank::Rom if a < 0xC000 => return FLOATING_BUS,
            Bank::Rom => ROM + a - 0xC000,
        };
        self.arena[offset]
    }

    //--------------------------------------------------
    // 入力
    //--------------------------------------------------

    pub fn set_key(&mut self, key: u8) {
        self.switches.keyboard_latch = key | 0x80;
    }

    /// キーストローブが有効か（bit7がセットされているか）
    pub fn has_key_strobe(&self) -> bool {
        (self.switches.keyboard_latch & 0x80) != 0
    }

    /// ジョイスティックボタンを設定
    pub fn set_button(&mut self, button: usize, pressed: bool) {
        if let Some(b) = self.switches.buttons.get_mut(button) {
            *b = pressed;
        }
    }

    /// パドル値を設定 (0-255, 128が中央)
    pub fn set_paddle(&mut self, paddle: usize, value: u8) {
        if let Some(p) = self.switches.paddles.get_mut(paddle) {
            *p = value;
        }
    }

    //--------------------------------------------------
    // I/O ($C000-$C0FF)
    //--------------------------------------------------

    fn status(flag: bool, low: u8) -> u8 {
        if flag {
            0x80 | (low & 0x7F)
        } else {
            low & 0x7F
        }
    }

    fn read_io(&mut self, address: u16) -> u8 {
        let addr = (address & 0xFF) as u8;
        let kbd = self.switches.keyboard_latch;
        let iie = self.is_iie();
        let sw = &self.switches;
        match addr {
            0x00..=0x0F => kbd,
            0x10 => {
                // $C010: ANY KEY DOWN (キーストローブクリア)
                self.switches.keyboard_latch &= 0x7F;
                kbd
            }
            0x11 if iie => Self::status(sw.lc_bank2, kbd),
            0x12 if iie => Self::status(sw.lc_read_enable, kbd),
            0x13 if iie => Self::status(sw.ramrd, kbd),
            0x14 if iie => Self::status(sw.ramwrt, kbd),
            0x15 if iie => Self::status(sw.intcxrom, kbd),
            0x16 if iie => Self::status(sw.altzp, kbd),
            0x17 if iie => Self::status(sw.slotc3rom, kbd),
            0x18 if iie => Self::status(sw.store_80, kbd),
            0x19 if iie => {
                // 65サイクル×262ライン、192ライン以降が垂直帰線
                let scanline = (self.cycles / 65) % 262;
                Self::status(scanline < 192, kbd)
            }
            0x1A if iie => Self::status(sw.text_mode, kbd),
            0x1B if iie => Self::status(sw.mixed_mode, kbd),
            0x1C if iie => Self::status(sw.page2, kbd),
            0x1D if iie => Self::status(sw.hires, kbd),
            0x1E if iie => Self::status(sw.alt_char, kbd),
            0x1F if iie => Self::status(sw.col_80, kbd),
            0x11..=0x1F => {
                self.switches.keyboard_latch &= 0x7F;
                kbd
            }
            0x30..=0x3F => {
                self.speaker_toggles += 1;
                FLOATING_BUS
            }
            0x50..=0x5F => {
                self.display_switch(addr);
                FLOATING_BUS
            }
            // ゲームポート: ボタン
            0x61..=0x63 => Self::status(sw.buttons[(addr - 0x61) as usize], FLOATING_BUS),
            // ゲームポート: パドル（タイマー方式）
            // $C070でトリガー後、パドル値×11サイクル経過するまでHighを返す
            0x64..=0x67 => {
                let value = sw.paddles[(addr - 0x64) as usize] as u64;
                let elapsed = self.cycles.saturating_sub(sw.paddle_trigger_cycle);
                Self::status(elapsed < value * 11, FLOATING_BUS)
            }
            0x7E if iie => Self::status(sw.ioudis, FLOATING_BUS),
            0x7F if iie => Self::status(sw.dhires, FLOATING_BUS),
            0x70..=0x7F => {
                self.switches.paddle_trigger_cycle = self.cycles;
                FLOATING_BUS
            }
            0x80..=0x8F => {
                self.handle_language_card(addr, false);
                FLOATING_BUS
            }
            0x90..=0xFF => {
                let slot = ((addr >> 4) & 7) as usize;
                let cycles = self.cycles;
                match self.slots[slot].as_mut() {
                    Some(card) => card.io_read(addr & 0x0F, cycles),
                    None => FLOATING_BUS,
                }
            }
            _ => FLOATING_BUS,
        }
    }

    fn write_io(&mut self, address: u16, value: u8) {
        let addr = (address & 0xFF) as u8;
        let iie = self.is_iie();
        match addr {
            // Apple IIe 80列カードスイッチ（書き込みで動作）
            0x00..=0x0F if iie => {
                let on = addr & 1 != 0;
                let sw = &mut self.switches;
                match addr >> 1 {
                    0 => sw.store_80 = on,
                    1 => sw.ramrd = on,
                    2 => sw.ramwrt = on,
                    3 => sw.intcxrom = on,
                    4 => sw.altzp = on,
                    5 => sw.slotc3rom = on,
                    6 => sw.col_80 = on,
                    _ => sw.alt_char = on,
                }
                self.update_pages();
            }
            // $C010-$C01F: キーストローブクリア（書き込みでも）
            0x10..=0x1F => self.switches.keyboard_latch &= 0x7F,
            0x30..=0x3F => self.speaker_toggles += 1,
            0x50..=0x5F => self.display_switch(addr),
            // IOUDIS制御
            0x7E if iie => self.switches.ioudis = true,
            0x7F if iie => self.switches.ioudis = false,
            0x70..=0x7F => self.switches.paddle_trigger_cycle = self.cycles,
            0x80..=0x8F => self.handle_language_card(addr, true),
            0x90..=0xFF => {
                let slot = ((addr >> 4) & 7) as usize;
                let cycles = self.cycles;
                if let Some(card) = self.slots[slot].as_mut() {
                    card.io_write(addr & 0x0F, value, cycles);
                }
            }
            _ => {}
        }
    }

    /// $C050-$C05F 表示とアナンシエータ
    fn display_switch(&mut self, addr: u8) {
        let on = addr & 1 != 0;
        let iie = self.is_iie();
        let sw = &mut self.switches;
        match addr {
            0x50 | 0x51 => sw.text_mode = on,
            0x52 | 0x53 => sw.mixed_mode = on,
            0x54 | 0x55 => sw.page2 = on,
            0x56 | 0x57 => sw.hires = on,
            // $C05E/$C05F: Apple IIeではDHIRES制御
            0x5E | 0x5F if iie && !sw.ioudis => sw.dhires = !on,
            _ => sw.annunciator[((addr - 0x58) >> 1) as usize & 3] = on,
        }
        // PAGE2とHIRESは80STOREのマッピングに影響する
        if matches!(addr, 0x54..=0x57) {
            self.update_pages();
        }
    }

    /// $C080-$C08F ランゲージカード
    ///
    /// bit3でバンク（0=バンク2）、bit0とbit1が等しければRAM読み込み。
    /// 奇数アドレスを2回続けて読むと書き込み可能になる。
    fn handle_language_card(&mut self, addr: u8, is_write: bool) {
        let sw = &mut self.switches;
        sw.lc_bank2 = addr & 0x08 == 0;
        sw.lc_read_enable = ((addr & 0x02) >> 1) == (addr & 0x01);
        if addr & 0x01 == 0 {
            sw.lc_write_enable = false;
            sw.lc_prewrite = false;
        } else if is_write {
            sw.lc_prewrite = false;
        } else {
            if sw.lc_prewrite {
                sw.lc_write_enable = true;
            }
            sw.lc_prewrite = true;
        }
        self.update_pages();
    }

    //--------------------------------------------------
    // 読み書き
    //--------------------------------------------------

    pub fn read(&mut self, address: u16) -> u8 {
        let page = (address >> 8) as usize;
        if page == 0xC0 {
            return self.read_io(address);
        }
        if (0xC1..=0xCF).contains(&page) {
            self.select_expansion(address);
        }
        self.arena[self.read_pages[page] + (address & 0xFF) as usize]
    }

    pub fn write(&mut self, address: u16, value: u8) {
        let page = (address >> 8) as usize;
        if page == 0xC0 {
            self.write_io(address, value);
            return;
        }
        if (0xC1..=0xCF).contains(&page) {
            self.select_expansion(address);
        }
        let base = self.write_pages[page];
        if base == SINK_PAGE {
            return;
        }
        self.arena[base + (address & 0xFF) as usize] = value;

        // テキスト/Lo-Res ($0400-$0BFF) と Hi-Res ($2000-$5FFF)
        if matches!(page, 0x04..=0x0B | 0x20..=0x5F) {
            if let Some(video) = self.video.as_mut() {
                video.memory_written(address, base >= AUX_RAM, value);
            }
        }
    }

    //--------------------------------------------------
    // セーブステート
    //--------------------------------------------------

    pub fn save_state(&self, w: &mut StateWriter) {
        let sw = &self.switches;
        w.put_u8(magic::MEMORY);
        w.put_u8(sw.keyboard_latch);
        for flag in [
            sw.text_mode, sw.mixed_mode, sw.page2, sw.hires, sw.store_80, sw.col_80,
            sw.alt_char, sw.dhires, sw.ioudis, sw.lc_bank2, sw.lc_read_enable,
            sw.lc_write_enable, sw.lc_prewrite, sw.ramrd, sw.ramwrt, sw.altzp,
            sw.intcxrom, sw.slotc3rom, sw.intc8rom,
        ] {
            w.put_bool(flag);
        }
        for a in sw.annunciator {
            w.put_bool(a);
        }
        w.put_u64(sw.paddle_trigger_cycle);
        w.put_u8(self.active_expansion.map_or(0, |n| n as u8));
        w.put_u64(self.speaker_toggles);
        w.put_bytes(&self.arena[MAIN_RAM..ROM]);
        w.put_u8(magic::MEMORY);
    }

    /// 状態を読み込む。途中で失敗したら何も変更しない
    pub fn load_state(&mut self, r: &mut StateReader) -> Result<(), SaveStateError> {
        r.expect_magic("memory", magic::MEMORY)?;
        let mut sw = self.switches.clone();
        sw.keyboard_latch = r.read_u8("keyboard")?;
        for flag in [
            &mut sw.text_mode, &mut sw.mixed_mode, &mut sw.page2, &mut sw.hires,
            &mut sw.store_80, &mut sw.col_80, &mut sw.alt_char, &mut sw.dhires,
            &mut sw.ioudis, &mut sw.lc_bank2, &mut sw.lc_read_enable,
            &mut sw.lc_write_enable, &mut sw.lc_prewrite, &mut sw.ramrd, &mut sw.ramwrt,
            &mut sw.altzp, &mut sw.intcxrom, &mut sw.slotc3rom, &mut sw.intc8rom,
        ] {
            *flag = r.read_bool("soft switch")?;
        }
        for a in sw.annunciator.iter_mut() {
            *a = r.read_bool("annunciator")?;
        }
        sw.paddle_trigger_cycle = r.read_u64("paddle trigger")?;
        let active = r.read_u8("expansion slot")? as usize;
        if active >= NUM_SLOTS {
            return Err(SaveStateError::InvalidValue {
                context: "expansion slot",
                value: active as u64,
            });
        }
        let speaker_toggles = r.read_u64("speaker")?;
        let ram = r.read_exact(ROM - MAIN_RAM, "ram")?;
        r.expect_magic("memory", magic::MEMORY)?;

        self.switches = sw;
        self.active_expansion = (active != 0).then_some(active);
        self.speaker_toggles = speaker_toggles;
        self.arena[MAIN_RAM..ROM].copy_from_slice(ram);
        self.update_pages();
        Ok(())
    }
}

impl MemoryBus for Memory {
    fn read(&mut self, address: u16) -> u8 {
        Memory::read(self, address)
    }

    fn write(&mut self, address: u16, value: u8) {
        Memory::write(self, address, value)
    }

    fn set_cycle(&mut self, cycles: u64) {
        self.cycles = cycles;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct TestCard {
        last_reg: Option<u8>,
        written: Vec<(u8, u8)>,
        expansion: Vec<u8>,
        resets: u32,
    }

    impl TestCard {
        fn new() -> Self {
            TestCard {
                last_reg: None,
                written: Vec::new(),
                expansion: vec![0xE5; EXPANSION_ROM_SIZE],
                resets: 0,
            }
        }
    }

    impl Slot for TestCard {
        fn name(&self) -> &'static str {
            "Test Card"
        }

        fn io_read(&mut self, reg: u8, _cycles: u64) -> u8 {
            self.last_reg = Some(reg);
            0x40 | reg
        }

        fn io_write(&mut self, reg: u8, value: u8, _cycles: u64) {
            self.written.push((reg, value));
        }

        fn load_rom(&self, rom: &mut [u8; SLOT_ROM_SIZE]) {
            for (i, b) in rom.iter_mut().enumerate() {
                *b = i as u8;
            }
        }

        fn expansion_rom(&self) -> Option<&[u8]> {
            Some(&self.expansion)
        }

        fn reset(&mut self) {
            self.resets += 1;
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Recorder(Rc<RefCell<Vec<(u16, bool, u8)>>>);

    impl VideoSink for Recorder {
        fn memory_written(&mut self, address: u16, aux: bool, value: u8) {
            self.0.borrow_mut().push((address, aux, value));
        }
    }

    fn test_rom() -> Vec<u8> {
        let mut rom = vec![0u8; 16384];
        rom[0x1000] = 0x11; // $D000
        rom[0x2000] = 0x33; // $E000
        rom[0x0300] = 0xC3; // 内蔵 $C300
        rom[0x0800] = 0xC8; // 内蔵 $C800
        rom
    }

    fn iie() -> Memory {
        let mut mem = Memory::new(AppleModel::AppleIIe);
        mem.load_rom(&test_rom()).unwrap();
        mem
    }

    fn page_tables(mem: &Memory) -> (Vec<usize>, Vec<usize>) {
        (mem.read_pages.to_vec(), mem.write_pages.to_vec())
    }

    #[test]
    fn test_rom_sizes() {
        let mut mem = Memory::new(AppleModel::AppleIIPlus);
        let mut rom = vec![0u8; 12288];
        rom[0] = 0x4C;
        mem.load_rom(&rom).unwrap();
        assert_eq!(mem.read(0xD000), 0x4C);
        assert!(mem.load_rom(&[0u8; 1000]).is_err());
        assert_eq!(mem.read(0xD000), 0x4C);

        let mut rom = vec![0u8; 32768];
        rom[0x7FFC] = 0x62;
        mem.load_rom(&rom).unwrap();
        assert_eq!(mem.read(0xFFFC), 0x62);
    }

    #[test]
    fn test_lc_bank1_vs_rom_at_d000() {
        let mut mem = iie();
        // リセット直後: ROM読み込み、RAM書き込み可
        assert_eq!(mem.read(0xD000), 0x11);
        mem.write(0xD000, 0x22);
        assert_eq!(mem.read(0xD000), 0x11);

        // $C088: バンク1 RAM読み込み
        mem.read(0xC088);
        assert_eq!(mem.read(0xD000), 0x22);

        // $C080: バンク2 RAM読み込み（未書き込み）
        mem.read(0xC080);
        assert_eq!(mem.read(0xD000), 0x00);
        assert_eq!(mem.read_direct(0xD000, Bank::Main), 0x22);

        // $C08A: ROM
        mem.read(0xC08A);
        assert_eq!(mem.read(0xD000), 0x11);
    }

    #[test]
    fn test_lc_write_needs_two_reads() {
        let mut mem = iie();
        mem.read(0xC08A); // 書き込み禁止
        mem.write(0xE000, 0x55);
        mem.read(0xC08B);
        mem.write(0xE000, 0x55);
        assert_eq!(mem.read(0xE000), 0x00);

        mem.read(0xC08B);
        mem.write(0xE000, 0x55);
        assert_eq!(mem.read(0xE000), 0x55);

        // 奇数アドレスへの書き込みはプリライトを解除する
        mem.read(0xC08A);
        mem.read(0xC08B);
        mem.write(0xC08B, 0);
        mem.read(0xC08B);
        assert!(!mem.switches.lc_write_enable);
        // ROMは書き換わらない
        assert_eq!(mem.read_direct(0xE000, Bank::Rom), 0x33);
    }

    #[test]
    fn test_soft_switch_idempotence() {
        let mut mem = iie();
        mem.write(0xC001, 0);
        mem.read(0xC055);
        mem.read(0xC057);
        mem.write(0xC003, 0);
        mem.read(0xC083);
        let before = page_tables(&mem);
        mem.write(0xC001, 0);
        mem.read(0xC055);
        mem.write(0xC003, 0);
        mem.update_pages();
        assert_eq!(page_tables(&mem), before);
        // すべてのページがアリーナ内を指す
        assert!(mem.read_pages.iter().all(|&p| p + 0x100 <= ARENA_SIZE));
        assert!(mem.write_pages.iter().all(|&p| p + 0x100 <= ARENA_SIZE));
        // ROMは書き込み先にならない
        assert!(mem.write_pages.iter().all(|&p| !(ROM..ROM + ROM_SIZE).contains(&p)));
    }

    #[test]
    fn test_aux_ramrd_ramwrt() {
        let mut mem = iie();
        mem.write(0xC005, 0); // RAMWRT
        mem.write(0x1234, 0x77);
        assert_eq!(mem.read(0x1234), 0x00);
        mem.write(0xC003, 0); // RAMRD
        assert_eq!(mem.read(0x1234), 0x77);
        assert_eq!(mem.read(0xC013) & 0x80, 0x80);
        assert_eq!(mem.read(0xC014) & 0x80, 0x80);
        mem.write(0xC002, 0);
        mem.write(0xC004, 0);
        assert_eq!(mem.read(0x1234), 0x00);
        assert_eq!(mem.read_direct(0x1234, Bank::Aux), 0x77);
    }

    #[test]
    fn test_80store_overrides_ramwrt() {
        let mut mem = iie();
        mem.write(0xC001, 0); // 80STORE
        mem.read(0xC055); // PAGE2
        mem.write(0x0400, 0x41);
        assert_eq!(mem.read_direct(0x0400, Bank::Aux), 0x41);
        assert_eq!(mem.read_direct(0x0400, Bank::Main), 0x00);

        // HIRESがなければ $2000 は通常のRAMWRTに従う
        mem.write(0x2000, 0x42);
        assert_eq!(mem.read_direct(0x2000, Bank::Main), 0x42);
        mem.read(0xC057);
        mem.write(0x2000, 0x43);
        assert_eq!(mem.read_direct(0x2000, Bank::Aux), 0x43);

        // RAMWRTが立っていてもPAGE1ならメイン
        mem.write(0xC005, 0);
        mem.read(0xC054);
        mem.write(0x0401, 0x44);
        assert_eq!(mem.read_direct(0x0401, Bank::Main), 0x44);
    }

    #[test]
    fn test_altzp() {
        let mut mem = iie();
        mem.write(0x00FF, 1);
        mem.write(0xC009, 0);
        assert_eq!(mem.read(0x00FF), 0);
        mem.write(0x01FF, 2);
        mem.write(0xC008, 0);
        assert_eq!(mem.read(0x00FF), 1);
        assert_eq!(mem.read_direct(0x01FF, Bank::Aux), 2);
    }

    #[test]
    fn test_iie_switches_ignored_on_ii_plus() {
        let mut mem = Memory::new(AppleModel::AppleIIPlus);
        mem.write(0xC005, 0);
        mem.write(0x1000, 9);
        assert_eq!(mem.read_direct(0x1000, Bank::Main), 9);
        assert!(!mem.switches.ramwrt);
    }

    #[test]
    fn test_slot_dispatch_and_rom() {
        let mut mem = Memory::new(AppleModel::AppleIIPlus);
        mem.set_slot(5, Box::new(TestCard::new()));
        assert_eq!(mem.read(0xC0D3), 0x43);
        mem.write(0xC0DA, 0x99);
        let card = mem.slot_mut::<TestCard>(5).unwrap();
        assert_eq!(card.last_reg, Some(3));
        assert_eq!(card.written, vec![(0x0A, 0x99)]);

        assert_eq!(mem.read(0xC510), 0x10);
        assert_eq!(mem.read(0xC800), 0xE5);
        // $CFFF で解放
        mem.read(0xCFFF);
        assert_eq!(mem.read(0xC800), FLOATING_BUS);

        // スロットROMへの書き込みは無視
        mem.write(0xC510, 0);
        assert_eq!(mem.read(0xC510), 0x10);
        assert!(mem.slot_ref::<TestCard>(4).is_none());
    }

    #[test]
    fn test_intcxrom_and_slot3() {
        let mut mem = iie();
        mem.set_slot(3, Box::new(TestCard::new()));
        // SLOTC3ROMがOFFなら内蔵ROM
        assert_eq!(mem.read(0xC300), 0xC3);
        assert_eq!(mem.read(0xC800), 0xC8);
        mem.read(0xCFFF);
        mem.write(0xC00B, 0);
        assert_eq!(mem.read(0xC300), 0x00);
        assert_eq!(mem.read(0xC800), 0xE5);
        mem.write(0xC007, 0);
        assert_eq!(mem.read(0xC300), 0xC3);
        assert_eq!(mem.read(0xC015) & 0x80, 0x80);
    }

    #[test]
    fn test_floating_bus() {
        let mut mem = Memory::new(AppleModel::AppleIIPlus);
        assert_eq!(mem.read(0xC0E0), FLOATING_BUS);
        assert_eq!(mem.read(0xC020), FLOATING_BUS);
        assert_eq!(mem.read(0xC600), FLOATING_BUS);
    }

    #[test]
    fn test_keyboard_strobe() {
        let mut mem = Memory::new(AppleModel::AppleIIPlus);
        mem.set_key(b'A');
        assert_eq!(mem.read(0xC000), 0xC1);
        assert_eq!(mem.read(0xC010), 0xC1);
        assert_eq!(mem.read(0xC000), 0x41);
        assert!(!mem.has_key_strobe());
    }

    #[test]
    fn test_paddle_timer() {
        let mut mem = Memory::new(AppleModel::AppleIIPlus);
        mem.set_paddle(0, 10);
        mem.set_cycle(1000);
        mem.read(0xC070);
        mem.set_cycle(1000 + 109);
        assert_eq!(mem.read(0xC064) & 0x80, 0x80);
        mem.set_cycle(1000 + 110);
        assert_eq!(mem.read(0xC064) & 0x80, 0);
    }

    #[test]
    fn test_video_sink_notified() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut mem = iie();
        mem.set_video_sink(Box::new(Recorder(events.clone())));
        mem.write(0x0400, 0xA0);
        mem.write(0x2001, 0x7F);
        mem.write(0x6000, 0x01);
        mem.write(0xC005, 0);
        mem.write(0x0800, 0x02);
        assert_eq!(
            *events.borrow(),
            vec![(0x0400, false, 0xA0), (0x2001, false, 0x7F), (0x0800, true, 0x02)]
        );
    }

    #[test]
    fn test_reset_defaults() {
        let mut mem = iie();
        mem.set_slot(6, Box::new(TestCard::new()));
        mem.read(0xC050);
        mem.write(0xC003, 0);
        mem.write(0x0300, 0x12);
        mem.reset();
        assert!(mem.switches.text_mode);
        assert!(!mem.switches.ramrd);
        assert!(!mem.switches.lc_bank2);
        assert!(!mem.switches.lc_read_enable);
        assert!(mem.switches.lc_write_enable);
        assert_eq!(mem.read(0x0300), 0);
        assert_eq!(mem.read(0xD000), 0x11);
        assert_eq!(mem.slot_ref::<TestCard>(6).unwrap().resets, 1);
    }

    #[test]
    fn test_save_and_load_state() {
        let mut mem = iie();
        mem.write(0xC009, 0);
        mem.write(0x0010, 0x5A);
        mem.read(0xC08B);
        mem.read(0xC08B);
        mem.write(0xD123, 0x6B);

        let mut w = StateWriter::new();
        mem.save_state(&mut w);
        let bytes = w.into_bytes();

        let mut restored = iie();
        restored.load_state(&mut StateReader::new(&bytes)).unwrap();
        assert_eq!(restored.switches, mem.switches);
        assert_eq!(restored.read(0x0010), 0x5A);
        assert_eq!(restored.read(0xD123), 0x6B);
        assert_eq!(page_tables(&restored), page_tables(&mem));

        let mut other = iie();
        let short = &bytes[..bytes.len() - 10];
        assert!(other.load_state(&mut StateReader::new(short)).is_err());
        assert_eq!(other.switches, SoftSwitches::default());
    }
}
