//! MOS 6502/65C02 CPU Emulator
//!
//! Apple IIで使用される6502プロセッサのエミュレーション実装。
//! 命令は256エントリのデコード表で引き、アドレッシングモードで
//! オペランドを解決してから実行する。

pub mod addressing;
pub mod opcodes;

use crate::savestate::{magic, SaveStateError, StateReader, StateWriter};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// CPUのステータスレジスタのフラグビット
pub mod flags {
    pub const CARRY: u8 = 0b0000_0001;      // C: キャリーフラグ
    pub const ZERO: u8 = 0b0000_0010;       // Z: ゼロフラグ
    pub const IRQ_DISABLE: u8 = 0b0000_0100; // I: 割り込み禁止フラグ
    pub const DECIMAL: u8 = 0b0000_1000;    // D: BCDモードフラグ
    pub const BREAK: u8 = 0b0001_0000;      // B: ブレークフラグ
    pub const UNUSED: u8 = 0b0010_0000;     // 未使用（常に1）
    pub const OVERFLOW: u8 = 0b0100_0000;   // V: オーバーフローフラグ
    pub const NEGATIVE: u8 = 0b1000_0000;   // N: 負数フラグ
}

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

/// リセットと割り込み処理のサイクル数
const INTERRUPT_CYCLES: u32 = 7;

/// CPUの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CpuType {
    /// オリジナルのNMOS 6502 (Apple II+, IIe)
    Cpu6502,
    /// CMOS 65C02 (Apple IIe Enhanced)
    Cpu65C02,
}

/// CPUレジスタの状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registers {
    /// アキュムレータ（A）
    pub a: u8,
    /// Xインデックスレジスタ
    pub x: u8,
    /// Yインデックスレジスタ
    pub y: u8,
    /// スタックポインタ
    pub sp: u8,
    /// プログラムカウンタ
    pub pc: u16,
    /// ステータスレジスタ（プロセッサフラグ）
    pub status: u8,
}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFD,
            pc: 0,
            status: flags::ZERO | flags::UNUSED,
        }
    }
}

impl Registers {
    /// フラグをセット
    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.status |= flag;
        } else {
            self.status &= !flag;
        }
    }

    /// フラグを取得
    pub fn get_flag(&self, flag: u8) -> bool {
        (self.status & flag) != 0
    }

    /// ゼロフラグと負数フラグを値に基づいて更新
    pub fn update_zero_negative_flags(&mut self, value: u8) {
        self.set_flag(flags::ZERO, value == 0);
        self.set_flag(flags::NEGATIVE, (value & 0x80) != 0);
    }
}

/// メモリバスインターフェース
/// CPUがメモリにアクセスするために必要なトレイト
pub trait MemoryBus {
    /// メモリから1バイト読み取り
    fn read(&mut self, address: u16) -> u8;
    /// メモリに1バイト書き込み
    fn write(&mut self, address: u16, value: u8);
    /// 命令の開始時に現在のサイクル数を通知する
    fn set_cycle(&mut self, _cycles: u64) {}
}

/// 6502 CPUエミュレータ
#[derive(Debug, Clone)]
pub struct Cpu {
    /// CPUレジスタ
    pub regs: Registers,
    /// CPUの種類（6502 or 65C02）
    pub cpu_type: CpuType,
    /// 累積サイクル数
    pub total_cycles: u64,
    /// 実行したステップ数（割り込みの受け付けとWAI待機を含む）
    pub steps: u64,
    irq_pending: bool,
    nmi_pending: bool,
    /// WAIで割り込み待ち
    waiting: bool,
    /// 他スレッドからの実行中断要求
    yield_flag: Arc<AtomicBool>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new(CpuType::Cpu6502)
    }
}

impl Cpu {
    /// 新しいCPUインスタンスを作成
    pub fn new(cpu_type: CpuType) -> Self {
        Cpu {
            regs: Registers::default(),
            cpu_type,
            total_cycles: 0,
            steps: 0,
            irq_pending: false,
            nmi_pending: false,
            waiting: false,
            yield_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn read_vector<M: MemoryBus>(memory: &mut M, vector: u16) -> u16 {
        let low = memory.read(vector) as u16;
        let high = memory.read(vector.wrapping_add(1)) as u16;
        (high << 8) | low
    }

    /// CPUをリセット
    pub fn reset<M: MemoryBus>(&mut self, memory: &mut M) {
        self.regs = Registers::default();
        self.regs.pc = Self::read_vector(memory, RESET_VECTOR);
        self.irq_pending = false;
        self.nmi_pending = false;
        self.waiting = false;
        self.total_cycles = INTERRUPT_CYCLES as u64;
        log::debug!("CPU reset: PC=${:04X} ({:?})", self.regs.pc, self.cpu_type);
    }

    /// IRQを要求する（次の命令境界で、Iフラグがクリアなら受け付ける）
    pub fn stage_interrupt(&mut self) {
        self.irq_pending = true;
    }

    /// NMIを要求する（Iフラグに関係なく受け付ける）
    pub fn stage_nmi(&mut self) {
        self.nmi_pending = true;
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// 実行ループを中断させるためのフラグ
    pub fn yield_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.yield_flag)
    }

    pub fn request_yield(&self) {
        self.yield_flag.store(true, Ordering::Release);
    }

    /// 割り込みシーケンス（NMI/IRQ共通）
    fn interrupt<M: MemoryBus>(&mut self, memory: &mut M, vector: u16) -> u32 {
        self.push_word(memory, self.regs.pc);
        // ハードウェア割り込みではBフラグはクリア
        self.push_byte(memory, (self.regs.status | flags::UNUSED) & !flags::BREAK);
        self.regs.set_flag(flags::IRQ_DISABLE, true);
        if self.cpu_type == CpuType::Cpu65C02 {
            self.regs.set_flag(flags::DECIMAL, false);
        }
        self.regs.pc = Self::read_vector(memory, vector);
        INTERRUPT_CYCLES
    }

    /// 1命令（または割り込みの受け付け）を実行し、消費サイクル数を返す
    pub fn step<M: MemoryBus>(&mut self, memory: &mut M) -> u32 {
        memory.set_cycle(self.total_cycles);

        let cycles = if self.nmi_pending {
            self.nmi_pending = false;
            self.waiting = false;
            self.interrupt(memory, NMI_VECTOR)
        } else if self.irq_pending && !self.regs.get_flag(flags::IRQ_DISABLE) {
            self.irq_pending = false;
            self.waiting = false;
            self.interrupt(memory, IRQ_VECTOR)
        } else if self.waiting {
            // Iフラグがセットでも割り込み要求でWAIから復帰する
            if self.irq_pending {
                self.waiting = false;
            }
            1
        } else {
            let opcode = memory.read(self.regs.pc);
            self.regs.pc = self.regs.pc.wrapping_add(1);
            let ins = self.opcode_table()[opcode as usize];
            let (operand, page_crossed) = self.resolve(ins.mode, memory);
            self.execute(memory, ins, operand, page_crossed)
        };

        self.total_cycles += cycles as u64;
        self.steps += 1;
        cycles
    }

    /// 最大 `max_instructions` 命令を実行し、消費サイクル数を返す。
    /// 中断フラグが立っていれば次の命令境界で止まり、フラグを下ろす。
    pub fn run<M: MemoryBus>(&mut self, memory: &mut M, max_instructions: u64) -> u64 {
        let mut cycles = 0u64;
        for _ in 0..max_instructions {
            if self.yield_flag.swap(false, Ordering::AcqRel) {
                break;
            }
            cycles += self.step(memory) as u64;
        }
        cycles
    }

    //--------------------------------------------------
    // セーブステート
    //--------------------------------------------------

    pub fn save_state(&self, w: &mut StateWriter) {
        w.put_u8(magic::CPU);
        w.put_u8(self.regs.a);
        w.put_u8(self.regs.x);
        w.put_u8(self.regs.y);
        w.put_u8(self.regs.sp);
        w.put_u16(self.regs.pc);
        w.put_u8(self.regs.status);
        w.put_u64(self.total_cycles);
        w.put_bool(self.irq_pending);
        w.put_bool(self.nmi_pending);
        w.put_bool(self.waiting);
        w.put_u8(match self.cpu_type {
            CpuType::Cpu6502 => 0,
            CpuType::Cpu65C02 => 1,
        });
        w.put_u8(magic::CPU);
    }

    /// 状態を復元する。全フィールドの検証が済むまで自身は変更しない
    pub fn load_state(&mut self, r: &mut StateReader) -> Result<(), SaveStateError> {
        r.expect_magic("cpu", magic::CPU)?;
        let regs = Registers {
            a: r.read_u8("cpu.a")?,
            x: r.read_u8("cpu.x")?,
            y: r.read_u8("cpu.y")?,
            sp: r.read_u8("cpu.sp")?,
            pc: r.read_u16("cpu.pc")?,
            status: r.read_u8("cpu.status")?,
        };
        let total_cycles = r.read_u64("cpu.cycles")?;
        let irq_pending = r.read_bool("cpu.irq")?;
        let nmi_pending = r.read_bool("cpu.nmi")?;
        let waiting = r.read_bool("cpu.wait")?;
        let cpu_type = match r.read_u8("cpu.type")? {
            0 => CpuType::Cpu6502,
            1 => CpuType::Cpu65C02,
            other => {
                return Err(SaveStateError::InvalidValue {
                    context: "cpu.type",
                    value: other as u64,
                })
            }
        };
        r.expect_magic("cpu", magic::CPU)?;

        self.regs = regs;
        self.total_cycles = total_cycles;
        self.irq_pending = irq_pending;
        self.nmi_pending = nmi_pending;
        self.waiting = waiting;
        self.cpu_type = cpu_type;
        Ok(())
    }
}
