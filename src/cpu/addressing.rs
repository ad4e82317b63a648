//! アドレッシングモードの実装
//!
//! 6502/65C02のアドレッシングモードを定義し、オペランドを実効アドレスに解決する

use super::{Cpu, CpuType, MemoryBus};

/// アドレッシングモードの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    /// 暗黙的
    Implied,
    /// アキュムレータ
    Accumulator,
    /// 即値（Immediate） - #$nn
    Immediate,
    /// ゼロページ - $nn
    ZeroPage,
    /// ゼロページ,X - $nn,X
    ZeroPageX,
    /// ゼロページ,Y - $nn,Y
    ZeroPageY,
    /// 絶対 - $nnnn
    Absolute,
    /// 絶対,X - $nnnn,X
    AbsoluteX,
    /// 絶対,Y - $nnnn,Y
    AbsoluteY,
    /// 間接 - ($nnnn)（JMPのみ）
    Indirect,
    /// 間接,X（プリインデックス） - ($nn,X)
    IndirectX,
    /// 間接,Y（ポストインデックス） - ($nn),Y
    IndirectY,
    /// 間接（ゼロページ、65C02のみ） - ($nn)
    IndirectZeroPage,
    /// 絶対間接,X（65C02 JMPのみ） - ($nnnn,X)
    AbsoluteIndirectX,
    /// 相対（ブランチ命令用） - $nn
    Relative,
    /// ゼロページ+相対（BBR/BBS） - $nn,$rr
    ZeroPageRelative,
}

impl AddressingMode {
    /// オペコードに続くバイト数
    pub const fn operand_len(self) -> u16 {
        match self {
            AddressingMode::Implied | AddressingMode::Accumulator => 0,
            AddressingMode::Immediate
            | AddressingMode::ZeroPage
            | AddressingMode::ZeroPageX
            | AddressingMode::ZeroPageY
            | AddressingMode::IndirectX
            | AddressingMode::IndirectY
            | AddressingMode::IndirectZeroPage
            | AddressingMode::Relative => 1,
            AddressingMode::Absolute
            | AddressingMode::AbsoluteX
            | AddressingMode::AbsoluteY
            | AddressingMode::Indirect
            | AddressingMode::AbsoluteIndirectX
            | AddressingMode::ZeroPageRelative => 2,
        }
    }
}

/// 解決済みオペランド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Operand {
    None,
    Accumulator,
    Immediate(u8),
    Address(u16),
    /// ブランチ先
    Branch(u16),
    /// BBR/BBS: 検査するゼロページアドレスとブランチ先
    BitBranch { address: u16, target: u16 },
}

fn crosses_page(a: u16, b: u16) -> bool {
    (a & 0xFF00) != (b & 0xFF00)
}

impl Cpu {
    //--------------------------------------------------
    // アドレッシングモードのヘルパー関数
    //--------------------------------------------------

    /// PCから1バイト読んで進める
    fn next_byte<M: MemoryBus>(&mut self, memory: &mut M) -> u8 {
        let value = memory.read(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    fn next_word<M: MemoryBus>(&mut self, memory: &mut M) -> u16 {
        let low = self.next_byte(memory) as u16;
        let high = self.next_byte(memory) as u16;
        (high << 8) | low
    }

    /// ゼロページ内でラップするポインタ読み込み
    fn read_zp_pointer<M: MemoryBus>(memory: &mut M, ptr: u8) -> u16 {
        let low = memory.read(ptr as u16) as u16;
        let high = memory.read(ptr.wrapping_add(1) as u16) as u16;
        (high << 8) | low
    }

    /// 相対オフセットを読んでブランチ先を求める
    fn relative_target<M: MemoryBus>(&mut self, memory: &mut M) -> u16 {
        let offset = self.next_byte(memory) as i8;
        self.regs.pc.wrapping_add(offset as u16)
    }

    /// オペランドを解決する。2番目の値はインデックスでページを跨いだか
    pub(super) fn resolve<M: MemoryBus>(&mut self, mode: AddressingMode, memory: &mut M) -> (Operand, bool) {
        match mode {
            AddressingMode::Implied => (Operand::None, false),
            AddressingMode::Accumulator => (Operand::Accumulator, false),
            AddressingMode::Immediate => (Operand::Immediate(self.next_byte(memory)), false),
            AddressingMode::ZeroPage => (Operand::Address(self.next_byte(memory) as u16), false),
            AddressingMode::ZeroPageX => {
                let base = self.next_byte(memory);
                (Operand::Address(base.wrapping_add(self.regs.x) as u16), false)
            }
            AddressingMode::ZeroPageY => {
                let base = self.next_byte(memory);
                (Operand::Address(base.wrapping_add(self.regs.y) as u16), false)
            }
            AddressingMode::Absolute => (Operand::Address(self.next_word(memory)), false),
            AddressingMode::AbsoluteX => {
                let base = self.next_word(memory);
                let addr = base.wrapping_add(self.regs.x as u16);
                (Operand::Address(addr), crosses_page(base, addr))
            }
            AddressingMode::AbsoluteY => {
                let base = self.next_word(memory);
                let addr = base.wrapping_add(self.regs.y as u16);
                (Operand::Address(addr), crosses_page(base, addr))
            }
            AddressingMode::Indirect => {
                let ptr = self.next_word(memory);
                let low = memory.read(ptr) as u16;
                let high = if self.cpu_type == CpuType::Cpu65C02 {
                    // 65C02: ページ境界バグが修正されている
                    memory.read(ptr.wrapping_add(1)) as u16
                } else {
                    // 6502バグ：ページ境界でのラップアラウンド
                    memory.read((ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF)) as u16
                };
                (Operand::Address((high << 8) | low), false)
            }
            AddressingMode::IndirectX => {
                let ptr = self.next_byte(memory).wrapping_add(self.regs.x);
                (Operand::Address(Self::read_zp_pointer(memory, ptr)), false)
            }
            AddressingMode::IndirectY => {
                let ptr = self.next_byte(memory);
                let base = Self::read_zp_pointer(memory, ptr);
                let addr = base.wrapping_add(self.regs.y as u16);
                (Operand::Address(addr), crosses_page(base, addr))
            }
            AddressingMode::IndirectZeroPage => {
                let ptr = self.next_byte(memory);
                (Operand::Address(Self::read_zp_pointer(memory, ptr)), false)
            }
            AddressingMode::AbsoluteIndirectX => {
                let ptr = self.next_word(memory).wrapping_add(self.regs.x as u16);
                let low = memory.read(ptr) as u16;
                let high = memory.read(ptr.wrapping_add(1)) as u16;
                (Operand::Address((high << 8) | low), false)
            }
            AddressingMode::Relative => (Operand::Branch(self.relative_target(memory)), false),
            AddressingMode::ZeroPageRelative => {
                let address = self.next_byte(memory) as u16;
                let target = self.relative_target(memory);
                (Operand::BitBranch { address, target }, false)
            }
        }
    }

    /// ブランチを実行し、追加サイクルを返す
    pub(super) fn branch_to(&mut self, target: u16, condition: bool) -> u32 {
        if !condition {
            return 0;
        }
        let old_pc = self.regs.pc;
        self.regs.pc = target;
        // ページ境界を越えた場合、追加サイクル
        if crosses_page(old_pc, target) {
            2
        } else {
            1
        }
    }
}
