//! オペコードの実装
//!
//! 256エントリのデコード表（6502/65C02）と命令の実行

use super::addressing::{AddressingMode, Operand};
use super::{flags, Cpu, CpuType, MemoryBus, Registers};

/// 命令の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Bra, Brk, Bvc, Bvs,
    Clc, Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny,
    Jmp, Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Phx, Phy, Pla, Plp,
    Plx, Ply, Rol, Ror, Rti, Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Stz,
    Tax, Tay, Trb, Tsb, Tsx, Txa, Txs, Tya, Wai,
    /// 65C02 BBRn
    Bbr(u8),
    /// 65C02 BBSn
    Bbs(u8),
    /// 65C02 RMBn
    Rmb(u8),
    /// 65C02 SMBn
    Smb(u8),
}

/// デコード済み命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Operation,
    pub mode: AddressingMode,
    /// 基本サイクル数（ページ跨ぎ・分岐・BCDの追加分は含まない）
    pub cycles: u8,
}

impl Instruction {
    /// オペコードを含む命令長
    pub const fn len(&self) -> u16 {
        1 + self.mode.operand_len()
    }
}

/// 65C02 (Apple IIe Enhanced)
pub static OPCODES_65C02: [Instruction; 256] = build_table(CpuType::Cpu65C02);
/// NMOS 6502 (Apple II+, IIe)
pub static OPCODES_6502: [Instruction; 256] = build_table(CpuType::Cpu6502);

const fn build_table(cpu_type: CpuType) -> [Instruction; 256] {
    let mut table = [Instruction {
        op: Operation::Nop,
        mode: AddressingMode::Implied,
        cycles: 2,
    }; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = match cpu_type {
            CpuType::Cpu65C02 => decode_65c02(i as u8),
            CpuType::Cpu6502 => decode_6502(i as u8),
        };
        i += 1;
    }
    table
}

const fn decode_65c02(opcode: u8) -> Instruction {
    use AddressingMode::*;
    use Operation::*;
    let (op, mode, cycles) = match opcode {
        0x00 => (Brk, Implied, 7),
        0x01 => (Ora, IndirectX, 6),
        0x04 => (Tsb, ZeroPage, 5),
        0x05 => (Ora, ZeroPage, 3),
        0x06 => (Asl, ZeroPage, 5),
        0x08 => (Php, Implied, 3),
        0x09 => (Ora, Immediate, 2),
        0x0A => (Asl, Accumulator, 2),
        0x0C => (Tsb, Absolute, 6),
        0x0D => (Ora, Absolute, 4),
        0x0E => (Asl, Absolute, 6),
        0x10 => (Bpl, Relative, 2),
        0x11 => (Ora, IndirectY, 5),
        0x12 => (Ora, IndirectZeroPage, 5),
        0x14 => (Trb, ZeroPage, 5),
        0x15 => (Ora, ZeroPageX, 4),
        0x16 => (Asl, ZeroPageX, 6),
        0x18 => (Clc, Implied, 2),
        0x19 => (Ora, AbsoluteY, 4),
        0x1A => (Inc, Accumulator, 2),
        0x1C => (Trb, Absolute, 6),
        0x1D => (Ora, AbsoluteX, 4),
        0x1E => (Asl, AbsoluteX, 6),
        0x20 => (Jsr, Absolute, 6),
        0x21 => (And, IndirectX, 6),
        0x24 => (Bit, ZeroPage, 3),
        0x25 => (And, ZeroPage, 3),
        0x26 => (Rol, ZeroPage, 5),
        0x28 => (Plp, Implied, 4),
        0x29 => (And, Immediate, 2),
        0x2A => (Rol, Accumulator, 2),
        0x2C => (Bit, Absolute, 4),
        0x2D => (And, Absolute, 4),
        0x2E => (Rol, Absolute, 6),
        0x30 => (Bmi, Relative, 2),
        0x31 => (And, IndirectY, 5),
        0x32 => (And, IndirectZeroPage, 5),
        0x34 => (Bit, ZeroPageX, 4),
        0x35 => (And, ZeroPageX, 4),
        0x36 => (Rol, ZeroPageX, 6),
        0x38 => (Sec, Implied, 2),
        0x39 => (And, AbsoluteY, 4),
        0x3A => (Dec, Accumulator, 2),
        0x3C => (Bit, AbsoluteX, 4),
        0x3D => (And, AbsoluteX, 4),
        0x3E => (Rol, AbsoluteX, 6),
        0x40 => (Rti, Implied, 6),
        0x41 => (Eor, IndirectX, 6),
        0x44 => (Nop, ZeroPage, 3),
        0x45 => (Eor, ZeroPage, 3),
        0x46 => (Lsr, ZeroPage, 5),
        0x48 => (Pha, Implied, 3),
        0x49 => (Eor, Immediate, 2),
        0x4A => (Lsr, Accumulator, 2),
        0x4C => (Jmp, Absolute, 3),
        0x4D => (Eor, Absolute, 4),
        0x4E => (Lsr, Absolute, 6),
        0x50 => (Bvc, Relative, 2),
        0x51 => (Eor, IndirectY, 5),
        0x52 => (Eor, IndirectZeroPage, 5),
        0x54 => (Nop, ZeroPageX, 4),
        0x55 => (Eor, ZeroPageX, 4),
        0x56 => (Lsr, ZeroPageX, 6),
        0x58 => (Cli, Implied, 2),
        0x59 => (Eor, AbsoluteY, 4),
        0x5A => (Phy, Implied, 3),
        0x5C => (Nop, Absolute, 8),
        0x5D => (Eor, AbsoluteX, 4),
        0x5E => (Lsr, AbsoluteX, 6),
        0x60 => (Rts, Implied, 6),
        0x61 => (Adc, IndirectX, 6),
        0x64 => (Stz, ZeroPage, 3),
        0x65 => (Adc, ZeroPage, 3),
        0x66 => (Ror, ZeroPage, 5),
        0x68 => (Pla, Implied, 4),
        0x69 => (Adc, Immediate, 2),
        0x6A => (Ror, Accumulator, 2),
        0x6C => (Jmp, Indirect, 6),
        0x6D => (Adc, Absolute, 4),
        0x6E => (Ror, Absolute, 6),
        0x70 => (Bvs, Relative, 2),
        0x71 => (Adc, IndirectY, 5),
        0x72 => (Adc, IndirectZeroPage, 5),
        0x74 => (Stz, ZeroPageX, 4),
        0x75 => (Adc, ZeroPageX, 4),
        0x76 => (Ror, ZeroPageX, 6),
        0x78 => (Sei, Implied, 2),
        0x79 => (Adc, AbsoluteY, 4),
        0x7A => (Ply, Implied, 4),
        0x7C => (Jmp, AbsoluteIndirectX, 6),
        0x7D => (Adc, AbsoluteX, 4),
        0x7E => (Ror, AbsoluteX, 6),
        0x80 => (Bra, Relative, 2),
        0x81 => (Sta, IndirectX, 6),
        0x84 => (Sty, ZeroPage, 3),
        0x85 => (Sta, ZeroPage, 3),
        0x86 => (Stx, ZeroPage, 3),
        0x88 => (Dey, Implied, 2),
        0x89 => (Bit, Immediate, 2),
        0x8A => (Txa, Implied, 2),
        0x8C => (Sty, Absolute, 4),
        0x8D => (Sta, Absolute, 4),
        0x8E => (Stx, Absolute, 4),
        0x90 => (Bcc, Relative, 2),
        0x91 => (Sta, IndirectY, 6),
        0x92 => (Sta, IndirectZeroPage, 5),
        0x94 => (Sty, ZeroPageX, 4),
        0x95 => (Sta, ZeroPageX, 4),
        0x96 => (Stx, ZeroPageY, 4),
        0x98 => (Tya, Implied, 2),
        0x99 => (Sta, AbsoluteY, 5),
        0x9A => (Txs, Implied, 2),
        0x9C => (Stz, Absolute, 4),
        0x9D => (Sta, AbsoluteX, 5),
        0x9E => (Stz, AbsoluteX, 5),
        0xA0 => (Ldy, Immediate, 2),
        0xA1 => (Lda, IndirectX, 6),
        0xA2 => (Ldx, Immediate, 2),
        0xA4 => (Ldy, ZeroPage, 3),
        0xA5 => (Lda, ZeroPage, 3),
        0xA6 => (Ldx, ZeroPage, 3),
        0xA8 => (Tay, Implied, 2),
        0xA9 => (Lda, Immediate, 2),
        0xAA => (Tax, Implied, 2),
        0xAC => (Ldy, Absolute, 4),
        0xAD => (Lda, Absolute, 4),
        0xAE => (Ldx, Absolute, 4),
        0xB0 => (Bcs, Relative, 2),
        0xB1 => (Lda, IndirectY, 5),
        0xB2 => (Lda, IndirectZeroPage, 5),
        0xB4 => (Ldy, ZeroPageX, 4),
        0xB5 => (Lda, ZeroPageX, 4),
        0xB6 => (Ldx, ZeroPageY, 4),
        0xB8 => (Clv, Implied, 2),
        0xB9 => (Lda, AbsoluteY, 4),
        0xBA => (Tsx, Implied, 2),
        0xBC => (Ldy, AbsoluteX, 4),
        0xBD => (Lda, AbsoluteX, 4),
        0xBE => (Ldx, AbsoluteY, 4),
        0xC0 => (Cpy, Immediate, 2),
        0xC1 => (Cmp, IndirectX, 6),
        0xC4 => (Cpy, ZeroPage, 3),
        0xC5 => (Cmp, ZeroPage, 3),
        0xC6 => (Dec, ZeroPage, 5),
        0xC8 => (Iny, Implied, 2),
        0xC9 => (Cmp, Immediate, 2),
        0xCA => (Dex, Implied, 2),
        0xCB => (Wai, Implied, 3),
        0xCC => (Cpy, Absolute, 4),
        0xCD => (Cmp, Absolute, 4),
        0xCE => (Dec, Absolute, 6),
        0xD0 => (Bne, Relative, 2),
        0xD1 => (Cmp, IndirectY, 5),
        0xD2 => (Cmp, IndirectZeroPage, 5),
        0xD4 => (Nop, ZeroPageX, 4),
        0xD5 => (Cmp, ZeroPageX, 4),
        0xD6 => (Dec, ZeroPageX, 6),
        0xD8 => (Cld, Implied, 2),
        0xD9 => (Cmp, AbsoluteY, 4),
        0xDA => (Phx, Implied, 3),
        0xDC => (Nop, Absolute, 4),
        0xDD => (Cmp, AbsoluteX, 4),
        0xDE => (Dec, AbsoluteX, 7),
        0xE0 => (Cpx, Immediate, 2),
        0xE1 => (Sbc, IndirectX, 6),
        0xE4 => (Cpx, ZeroPage, 3),
        0xE5 => (Sbc, ZeroPage, 3),
        0xE6 => (Inc, ZeroPage, 5),
        0xE8 => (Inx, Implied, 2),
        0xE9 => (Sbc, Immediate, 2),
        0xEA => (Nop, Implied, 2),
        0xEC => (Cpx, Absolute, 4),
        0xED => (Sbc, Absolute, 4),
        0xEE => (Inc, Absolute, 6),
        0xF0 => (Beq, Relative, 2),
        0xF1 => (Sbc, IndirectY, 5),
        0xF2 => (Sbc, IndirectZeroPage, 5),
        0xF4 => (Nop, ZeroPageX, 4),
        0xF5 => (Sbc, ZeroPageX, 4),
        0xF6 => (Inc, ZeroPageX, 6),
        0xF8 => (Sed, Implied, 2),
        0xF9 => (Sbc, AbsoluteY, 4),
        0xFA => (Plx, Implied, 4),
        0xFC => (Nop, Absolute, 4),
        0xFD => (Sbc, AbsoluteX, 4),
        0xFE => (Inc, AbsoluteX, 7),
        // RMB0-7 ($07-$77) / SMB0-7 ($87-$F7)
        op if op & 0x0F == 0x07 => {
            let bit = (op >> 4) & 7;
            (if op < 0x80 { Rmb(bit) } else { Smb(bit) }, ZeroPage, 5)
        }
        // BBR0-7 ($0F-$7F) / BBS0-7 ($8F-$FF)
        op if op & 0x0F == 0x0F => {
            let bit = (op >> 4) & 7;
            (if op < 0x80 { Bbr(bit) } else { Bbs(bit) }, ZeroPageRelative, 5)
        }
        // 2バイトNOP
        op if op & 0x0F == 0x02 => (Nop, Immediate, 2),
        // $x3, $xB と STP ($DB) は1バイトNOP
        _ => (Nop, Implied, 1),
    };
    Instruction { op, mode, cycles }
}

/// 65C02で追加された命令・アドレッシング
const fn is_65c02_only(opcode: u8) -> bool {
    matches!(
        opcode,
        0x04 | 0x0C | 0x12 | 0x14 | 0x1A | 0x1C | 0x32 | 0x34 | 0x3A | 0x3C
            | 0x52 | 0x5A | 0x64 | 0x72 | 0x74 | 0x7A | 0x7C | 0x80 | 0x89
            | 0x92 | 0x9C | 0x9E | 0xB2 | 0xCB | 0xD2 | 0xDA | 0xF2 | 0xFA
    ) || opcode & 0x0F == 0x07
        || opcode & 0x0F == 0x0F
}

const fn decode_6502(opcode: u8) -> Instruction {
    let ins = decode_65c02(opcode);
    let undocumented = is_65c02_only(opcode) || (matches!(ins.op, Operation::Nop) && opcode != 0xEA);
    if !undocumented {
        return match opcode {
            // JMP ($xxxx) は1サイクル少ない
            0x6C => Instruction { cycles: 5, ..ins },
            // シフト/ローテート abs,X は常に7サイクル
            0x1E | 0x3E | 0x5E | 0x7E => Instruction { cycles: 7, ..ins },
            _ => ins,
        };
    }

    // 未定義命令は同じ長さのNOPにする
    let high_odd = (opcode >> 4) & 1 == 1;
    let mode = match opcode & 0x0F {
        0x00 | 0x09 => AddressingMode::Immediate,
        0x02 => match opcode {
            0x82 | 0xC2 | 0xE2 => AddressingMode::Immediate,
            // KIL: 停止させずに1バイトNOP
            _ => AddressingMode::Implied,
        },
        0x03 => if high_odd { AddressingMode::IndirectY } else { AddressingMode::IndirectX },
        0x04 | 0x07 => if high_odd { AddressingMode::ZeroPageX } else { AddressingMode::ZeroPage },
        0x0B => if high_odd { AddressingMode::AbsoluteY } else { AddressingMode::Immediate },
        0x0C => if high_odd { AddressingMode::AbsoluteX } else { AddressingMode::Absolute },
        0x0E => AddressingMode::AbsoluteY,
        0x0F => if high_odd { AddressingMode::AbsoluteX } else { AddressingMode::Absolute },
        _ => AddressingMode::Implied,
    };
    let cycles = match mode {
        AddressingMode::ZeroPage => 3,
        AddressingMode::ZeroPageX | AddressingMode::Absolute | AddressingMode::AbsoluteX | AddressingMode::AbsoluteY => 4,
        AddressingMode::IndirectY => 5,
        AddressingMode::IndirectX => 6,
        _ => 2,
    };
    Instruction { op: Operation::Nop, mode, cycles }
}

//--------------------------------------------------
// フラグ計算のヘルパー
//--------------------------------------------------

fn asl(regs: &mut Registers, value: u8) -> u8 {
    regs.set_flag(flags::CARRY, value & 0x80 != 0);
    let result = value << 1;
    regs.update_zero_negative_flags(result);
    result
}

fn lsr(regs: &mut Registers, value: u8) -> u8 {
    regs.set_flag(flags::CARRY, value & 0x01 != 0);
    let result = value >> 1;
    regs.update_zero_negative_flags(result);
    result
}

fn rol(regs: &mut Registers, value: u8) -> u8 {
    let carry_in = regs.get_flag(flags::CARRY) as u8;
    regs.set_flag(flags::CARRY, value & 0x80 != 0);
    let result = (value << 1) | carry_in;
    regs.update_zero_negative_flags(result);
    result
}

fn ror(regs: &mut Registers, value: u8) -> u8 {
    let carry_in = if regs.get_flag(flags::CARRY) { 0x80 } else { 0 };
    regs.set_flag(flags::CARRY, value & 0x01 != 0);
    let result = (value >> 1) | carry_in;
    regs.update_zero_negative_flags(result);
    result
}

fn inc(regs: &mut Registers, value: u8) -> u8 {
    let result = value.wrapping_add(1);
    regs.update_zero_negative_flags(result);
    result
}

fn dec(regs: &mut Registers, value: u8) -> u8 {
    let result = value.wrapping_sub(1);
    regs.update_zero_negative_flags(result);
    result
}

impl Cpu {
    /// 現在のCPU種別のデコード表
    pub fn opcode_table(&self) -> &'static [Instruction; 256] {
        match self.cpu_type {
            CpuType::Cpu6502 => &OPCODES_6502,
            CpuType::Cpu65C02 => &OPCODES_65C02,
        }
    }

    fn is_cmos(&self) -> bool {
        self.cpu_type == CpuType::Cpu65C02
    }

    /// インデックスでページを跨いだときに1サイクル追加される命令か
    fn has_page_penalty(&self, ins: Instruction) -> bool {
        use Operation::*;
        match ins.op {
            Lda | Ldx | Ldy | Eor | And | Ora | Adc | Sbc | Cmp | Bit | Nop => true,
            // 65C02のシフト abs,X は6サイクル+ページ跨ぎ
            Asl | Lsr | Rol | Ror => self.is_cmos() && ins.mode == AddressingMode::AbsoluteX,
            _ => false,
        }
    }

    fn load<M: MemoryBus>(&mut self, memory: &mut M, operand: Operand) -> u8 {
        match operand {
            Operand::Immediate(v) => v,
            Operand::Address(addr) => memory.read(addr),
            Operand::Accumulator => self.regs.a,
            _ => 0,
        }
    }

    fn store<M: MemoryBus>(&mut self, memory: &mut M, operand: Operand, value: u8) {
        if let Operand::Address(addr) = operand {
            memory.write(addr, value);
        }
    }

    /// リードモディファイライト（アキュムレータまたはメモリ）
    fn modify<M: MemoryBus>(&mut self, memory: &mut M, operand: Operand, f: fn(&mut Registers, u8) -> u8) {
        match operand {
            Operand::Accumulator => {
                let a = self.regs.a;
                self.regs.a = f(&mut self.regs, a);
            }
            Operand::Address(addr) => {
                let value = memory.read(addr);
                let result = f(&mut self.regs, value);
                memory.write(addr, result);
            }
            _ => {}
        }
    }

    //--------------------------------------------------
    // Compare Instructions
    //--------------------------------------------------
    fn do_compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.regs.set_flag(flags::CARRY, register >= value);
        self.regs.update_zero_negative_flags(result);
    }

    //--------------------------------------------------
    // ADC - Add with Carry
    //--------------------------------------------------
    fn do_adc(&mut self, value: u8) {
        let a = self.regs.a;
        let carry = self.regs.get_flag(flags::CARRY) as u16;

        if !self.regs.get_flag(flags::DECIMAL) {
            let result = a as u16 + value as u16 + carry;
            let result8 = result as u8;
            self.regs.set_flag(flags::CARRY, result > 0xFF);
            self.regs.set_flag(flags::OVERFLOW, ((a ^ result8) & (value ^ result8) & 0x80) != 0);
            self.regs.update_zero_negative_flags(result8);
            self.regs.a = result8;
            return;
        }

        // BCDモード
        let binary = (a as u16 + value as u16 + carry) as u8;
        let mut low = (a & 0x0F) as u16 + (value & 0x0F) as u16 + carry;
        if low > 9 {
            low += 6;
        }
        let mut high = (a >> 4) as u16 + (value >> 4) as u16 + (low > 0x0F) as u16;
        // N/Vは上位桁補正前の中間値から
        let intermediate = ((high << 4) | (low & 0x0F)) as u8;
        self.regs.set_flag(flags::OVERFLOW, ((a ^ intermediate) & (value ^ intermediate) & 0x80) != 0);
        if high > 9 {
            high += 6;
        }
        self.regs.set_flag(flags::CARRY, high > 0x0F);
        let result = ((high << 4) | (low & 0x0F)) as u8;

        if self.is_cmos() {
            self.regs.update_zero_negative_flags(result);
        } else {
            self.regs.set_flag(flags::ZERO, binary == 0);
            self.regs.set_flag(flags::NEGATIVE, intermediate & 0x80 != 0);
        }
        self.regs.a = result;
    }

    //--------------------------------------------------
    // SBC - Subtract with Carry
    //--------------------------------------------------
    fn do_sbc(&mut self, value: u8) {
        if !self.regs.get_flag(flags::DECIMAL) {
            // SBCはADCの補数として実装
            self.do_adc(!value);
            return;
        }

        // フラグは2進の結果から（NMOS）
        let a = self.regs.a;
        let borrow = (!self.regs.get_flag(flags::CARRY)) as i16;
        self.regs.set_flag(flags::DECIMAL, false);
        self.do_adc(!value);
        self.regs.set_flag(flags::DECIMAL, true);

        let mut low = (a & 0x0F) as i16 - (value & 0x0F) as i16 - borrow;
        let mut high = (a >> 4) as i16 - (value >> 4) as i16;
        if low < 0 {
            low += 10;
            high -= 1;
        }
        if high < 0 {
            high += 10;
        }
        let result = (((high as u8) & 0x0F) << 4) | ((low as u8) & 0x0F);

        if self.is_cmos() {
            self.regs.update_zero_negative_flags(result);
        }
        self.regs.a = result;
    }

    //--------------------------------------------------
    // Stack
    //--------------------------------------------------
    pub(super) fn push_byte<M: MemoryBus>(&mut self, memory: &mut M, value: u8) {
        memory.write(0x0100 | self.regs.sp as u16, value);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
    }

    pub(super) fn pop_byte<M: MemoryBus>(&mut self, memory: &mut M) -> u8 {
        self.regs.sp = self.regs.sp.wrapping_add(1);
        memory.read(0x0100 | self.regs.sp as u16)
    }

    /// スタックに2バイトプッシュ（上位バイト先）
    pub(super) fn push_word<M: MemoryBus>(&mut self, memory: &mut M, value: u16) {
        self.push_byte(memory, (value >> 8) as u8);
        self.push_byte(memory, value as u8);
    }

    pub(super) fn pop_word<M: MemoryBus>(&mut self, memory: &mut M) -> u16 {
        let low = self.pop_byte(memory) as u16;
        let high = self.pop_byte(memory) as u16;
        (high << 8) | low
    }

    /// 命令を実行し、消費したサイクル数を返す
    pub(super) fn execute<M: MemoryBus>(
        &mut self,
        memory: &mut M,
        ins: Instruction,
        operand: Operand,
        page_crossed: bool,
    ) -> u32 {
        use Operation::*;
        let mut cycles = ins.cycles as u32;
        if page_crossed && self.has_page_penalty(ins) {
            cycles += 1;
        }
        let target = match operand {
            Operand::Branch(t) => t,
            _ => self.regs.pc,
        };

        match ins.op {
            // Load / Store
            Lda => {
                self.regs.a = self.load(memory, operand);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Ldx => {
                self.regs.x = self.load(memory, operand);
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Ldy => {
                self.regs.y = self.load(memory, operand);
                self.regs.update_zero_negative_flags(self.regs.y);
            }
            Sta => self.store(memory, operand, self.regs.a),
            Stx => self.store(memory, operand, self.regs.x),
            Sty => self.store(memory, operand, self.regs.y),
            Stz => self.store(memory, operand, 0),

            // Transfer
            Tax => {
                self.regs.x = self.regs.a;
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Tay => {
                self.regs.y = self.regs.a;
                self.regs.update_zero_negative_flags(self.regs.y);
            }
            Txa => {
                self.regs.a = self.regs.x;
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Tya => {
                self.regs.a = self.regs.y;
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Tsx => {
                self.regs.x = self.regs.sp;
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Txs => self.regs.sp = self.regs.x,

            // Stack
            Pha => self.push_byte(memory, self.regs.a),
            Phx => self.push_byte(memory, self.regs.x),
            Phy => self.push_byte(memory, self.regs.y),
            Php => self.push_byte(memory, self.regs.status | flags::BREAK | flags::UNUSED),
            Pla => {
                self.regs.a = self.pop_byte(memory);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Plx => {
                self.regs.x = self.pop_byte(memory);
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Ply => {
                self.regs.y = self.pop_byte(memory);
                self.regs.update_zero_negative_flags(self.regs.y);
            }
            Plp => {
                self.regs.status = (self.pop_byte(memory) | flags::UNUSED) & !flags::BREAK;
            }

            // Arithmetic
            Adc => {
                let value = self.load(memory, operand);
                if self.is_cmos() && self.regs.get_flag(flags::DECIMAL) {
                    cycles += 1;
                }
                self.do_adc(value);
            }
            Sbc => {
                let value = self.load(memory, operand);
                if self.is_cmos() && self.regs.get_flag(flags::DECIMAL) {
                    cycles += 1;
                }
                self.do_sbc(value);
            }
            Cmp => {
                let value = self.load(memory, operand);
                self.do_compare(self.regs.a, value);
            }
            Cpx => {
                let value = self.load(memory, operand);
                self.do_compare(self.regs.x, value);
            }
            Cpy => {
                let value = self.load(memory, operand);
                self.do_compare(self.regs.y, value);
            }

            // Logical
            And => {
                self.regs.a &= self.load(memory, operand);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Ora => {
                self.regs.a |= self.load(memory, operand);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Eor => {
                self.regs.a ^= self.load(memory, operand);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Bit => {
                let value = self.load(memory, operand);
                self.regs.set_flag(flags::ZERO, self.regs.a & value == 0);
                // BIT #imm はZのみ
                if ins.mode != AddressingMode::Immediate {
                    self.regs.set_flag(flags::NEGATIVE, value & 0x80 != 0);
                    self.regs.set_flag(flags::OVERFLOW, value & 0x40 != 0);
                }
            }
            Tsb | Trb => {
                let value = self.load(memory, operand);
                self.regs.set_flag(flags::ZERO, self.regs.a & value == 0);
                let result = if ins.op == Tsb { value | self.regs.a } else { value & !self.regs.a };
                self.store(memory, operand, result);
            }

            // Shift / Increment
            Asl => self.modify(memory, operand, asl),
            Lsr => self.modify(memory, operand, lsr),
            Rol => self.modify(memory, operand, rol),
            Ror => self.modify(memory, operand, ror),
            Inc => self.modify(memory, operand, inc),
            Dec => self.modify(memory, operand, dec),
            Inx => {
                let x = self.regs.x;
                self.regs.x = inc(&mut self.regs, x);
            }
            Iny => {
                let y = self.regs.y;
                self.regs.y = inc(&mut self.regs, y);
            }
            Dex => {
                let x = self.regs.x;
                self.regs.x = dec(&mut self.regs, x);
            }
            Dey => {
                let y = self.regs.y;
                self.regs.y = dec(&mut self.regs, y);
            }

            // Branch
            Bpl => cycles += self.branch_to(target, !self.regs.get_flag(flags::NEGATIVE)),
            Bmi => cycles += self.branch_to(target, self.regs.get_flag(flags::NEGATIVE)),
            Bvc => cycles += self.branch_to(target, !self.regs.get_flag(flags::OVERFLOW)),
            Bvs => cycles += self.branch_to(target, self.regs.get_flag(flags::OVERFLOW)),
            Bcc => cycles += self.branch_to(target, !self.regs.get_flag(flags::CARRY)),
            Bcs => cycles += self.branch_to(target, self.regs.get_flag(flags::CARRY)),
            Bne => cycles += self.branch_to(target, !self.regs.get_flag(flags::ZERO)),
            Beq => cycles += self.branch_to(target, self.regs.get_flag(flags::ZERO)),
            Bra => cycles += self.branch_to(target, true),
            Bbr(bit) | Bbs(bit) => {
                if let Operand::BitBranch { address, target } = operand {
                    let set = memory.read(address) & (1 << bit) != 0;
                    cycles += self.branch_to(target, set == matches!(ins.op, Bbs(_)));
                }
            }
            Rmb(bit) | Smb(bit) => {
                let value = self.load(memory, operand);
                let result = if matches!(ins.op, Smb(_)) {
                    value | (1 << bit)
                } else {
                    value & !(1 << bit)
                };
                self.store(memory, operand, result);
            }

            // Jump and Call
            Jmp => {
                if let Operand::Address(addr) = operand {
                    self.regs.pc = addr;
                }
            }
            Jsr => {
                if let Operand::Address(addr) = operand {
                    let return_addr = self.regs.pc.wrapping_sub(1);
                    self.push_word(memory, return_addr);
                    self.regs.pc = addr;
                }
            }
            Rts => self.regs.pc = self.pop_word(memory).wrapping_add(1),

            // Interrupts
            Brk => {
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.push_word(memory, self.regs.pc);
                self.push_byte(memory, self.regs.status | flags::BREAK | flags::UNUSED);
                self.regs.set_flag(flags::IRQ_DISABLE, true);
                // 65C02: BRK後にDフラグをクリア
                if self.is_cmos() {
                    self.regs.set_flag(flags::DECIMAL, false);
                }
                self.regs.pc = Self::read_vector(memory, super::IRQ_VECTOR);
            }
            Rti => {
                self.regs.status = (self.pop_byte(memory) | flags::UNUSED) & !flags::BREAK;
                self.regs.pc = self.pop_word(memory);
            }
            Wai => self.waiting = true,

            // Flag Instructions
            Clc => self.regs.set_flag(flags::CARRY, false),
            Sec => self.regs.set_flag(flags::CARRY, true),
            Cli => self.regs.set_flag(flags::IRQ_DISABLE, false),
            Sei => self.regs.set_flag(flags::IRQ_DISABLE, true),
            Clv => self.regs.set_flag(flags::OVERFLOW, false),
            Cld => self.regs.set_flag(flags::DECIMAL, false),
            Sed => self.regs.set_flag(flags::DECIMAL, true),

            Nop => {
                // オペランドを持つNOPは読み込みを行う
                if let Operand::Address(addr) = operand {
                    memory.read(addr);
                }
            }
        }
        cycles
    }
}
