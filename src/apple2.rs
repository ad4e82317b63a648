//! Apple II エミュレータ
//!
//! CPUとメモリ（スロットを含む）を1つのマシンとしてまとめる。
//! 電源投入、実行、サスペンド/レジュームを提供する。

use crate::cpu::{Cpu, CpuType, Registers};
use crate::disk::{DiskController, DriveStatus};
use crate::image::DiskImageError;
use crate::memory::{AppleModel, Memory};
use crate::savestate::{magic, SaveStateError, StateReader, StateWriter, STATE_HEADER};
use crate::storage::Storage;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Disk IIカードを挿すスロット
pub const DISK_SLOT: usize = 6;

/// スロットの定期処理を呼ぶ間隔（命令数）
const SLICE_INSTRUCTIONS: u64 = 1000;

/// マシン状態のスナップショット（--status-json用）
#[derive(Debug, Clone, Serialize)]
pub struct MachineStatus {
    pub model: AppleModel,
    pub cpu_type: CpuType,
    pub registers: Registers,
    pub cycles: u64,
    pub steps: u64,
    pub speaker_toggles: u64,
    pub drives: Vec<DriveStatus>,
    pub discarded_bits: u64,
}

/// スロットレコード（適用前にすべて読み込む）
struct SlotRecord<'a> {
    slot: u8,
    name: String,
    payload: &'a [u8],
}

/// Apple IIエミュレータのメイン構造体
pub struct Apple2 {
    /// 6502/65C02 CPU
    pub cpu: Cpu,
    /// メモリシステム（スロットカードを所有）
    pub memory: Memory,
    model: AppleModel,
}

impl Apple2 {
    /// 新しいマシンを作成。スロット6にDisk IIを挿す
    pub fn new(model: AppleModel) -> Self {
        let cpu_type = if model.has_65c02() {
            CpuType::Cpu65C02
        } else {
            CpuType::Cpu6502
        };
        let mut memory = Memory::new(model);
        memory.set_slot(DISK_SLOT, Box::new(DiskController::new()));
        log::info!("Machine: {:?} ({:?})", model, cpu_type);
        Apple2 {
            cpu: Cpu::new(cpu_type),
            memory,
            model,
        }
    }

    pub fn model(&self) -> AppleModel {
        self.model
    }

    /// システムROMをロード
    pub fn load_rom(&mut self, data: &[u8]) -> Result<(), &'static str> {
        self.memory.load_rom(data)
    }

    /// Disk IIのブートROM (P5) をロードし、$C600に反映する
    pub fn load_disk_rom(&mut self, data: &[u8]) -> Result<(), &'static str> {
        let Some(mut card) = self.memory.remove_slot(DISK_SLOT) else {
            return Err("no disk controller installed");
        };
        let result = match card.as_any_mut().downcast_mut::<DiskController>() {
            Some(disk) => disk.load_boot_rom(data),
            None => Err("slot 6 is not a disk controller"),
        };
        self.memory.set_slot(DISK_SLOT, card);
        result
    }

    pub fn disk(&self) -> Option<&DiskController> {
        self.memory.slot_ref::<DiskController>(DISK_SLOT)
    }

    pub fn disk_mut(&mut self) -> Option<&mut DiskController> {
        self.memory.slot_mut::<DiskController>(DISK_SLOT)
    }

    /// ディスクを挿入する。失敗してもマシンは動き続ける
    pub fn insert_disk(
        &mut self,
        drive: usize,
        storage: &dyn Storage,
        name: &str,
        write_protect: bool,
    ) -> Result<(), DiskImageError> {
        match self.disk_mut() {
            Some(disk) => disk.insert_disk(drive, storage, name, write_protect),
            None => Err(DiskImageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no disk controller installed",
            ))),
        }
    }

    pub fn eject_disk(&mut self, drive: usize) {
        if let Some(disk) = self.disk_mut() {
            disk.eject_disk(drive);
        }
    }

    //--------------------------------------------------
    // リセットと実行
    //--------------------------------------------------

    /// 電源投入（コールドスタート）
    pub fn power_on(&mut self) {
        // タイムラインが巻き戻る前に書き戻しを済ませる
        if let Some(disk) = self.disk_mut() {
            if let Err(e) = disk.flush_all() {
                log::error!("Flush before power on failed: {}", e);
            }
        }
        self.memory.reset();
        self.cpu.reset(&mut self.memory);
        self.cpu.steps = 0;
    }

    /// Ctrl-Reset（RAMは保持、サイクルカウンタは単調増加のまま）
    pub fn reset(&mut self) {
        let cycles = self.cpu.total_cycles;
        self.memory.reset_switches();
        self.cpu.reset(&mut self.memory);
        self.cpu.total_cycles = self.cpu.total_cycles.max(cycles);
    }

    /// 1命令実行
    pub fn step(&mut self) -> u32 {
        let cycles = self.cpu.step(&mut self.memory);
        self.memory.update_slots();
        cycles
    }

    /// 最大 `max_instructions` 命令を実行し、消費サイクル数を返す
    pub fn run(&mut self, max_instructions: u64) -> u64 {
        let start = self.cpu.steps;
        let mut cycles = 0;
        loop {
            let done = self.cpu.steps - start;
            if done >= max_instructions {
                break;
            }
            let slice = (max_instructions - done).min(SLICE_INSTRUCTIONS);
            let before = self.cpu.steps;
            cycles += self.cpu.run(&mut self.memory, slice);
            self.memory.update_slots();
            // 中断要求で途中終了した
            if self.cpu.steps - before < slice {
                break;
            }
        }
        cycles
    }

    /// 他スレッドから実行を中断させるためのフラグ
    pub fn yield_handle(&self) -> Arc<AtomicBool> {
        self.cpu.yield_handle()
    }

    pub fn status(&self) -> MachineStatus {
        let (drives, discarded_bits) = match self.disk() {
            Some(disk) => (
                (0..2).map(|i| disk.drive(i).status()).collect(),
                disk.discarded_bits(),
            ),
            None => (Vec::new(), 0),
        };
        MachineStatus {
            model: self.model,
            cpu_type: self.cpu.cpu_type,
            registers: self.cpu.regs.clone(),
            cycles: self.cpu.total_cycles,
            steps: self.cpu.steps,
            speaker_toggles: self.memory.speaker_toggles(),
            drives,
            discarded_bits,
        }
    }

    //--------------------------------------------------
    // サスペンド/レジューム
    //--------------------------------------------------

    /// 状態をバイト列にする（ダーティトラックは先に書き戻される）
    pub fn save_state(&mut self) -> Result<Vec<u8>, SaveStateError> {
        let mut w = StateWriter::new();
        w.put_bytes(STATE_HEADER);
        self.cpu.save_state(&mut w);
        self.memory.save_state(&mut w);
        for n in 1..8 {
            let Some(card) = self.memory.slot_dyn_mut(n) else {
                continue;
            };
            let Some(payload) = card.save_state()? else {
                continue;
            };
            w.put_u8(magic::SLOT);
            w.put_u8(n as u8);
            w.put_str(card.name());
            w.put_blob(&payload);
            w.put_u8(magic::SLOT);
        }
        w.put_u8(magic::END);
        Ok(w.into_bytes())
    }

    /// 状態をストレージに保存する
    pub fn suspend(&mut self, storage: &dyn Storage, name: &str) -> Result<(), SaveStateError> {
        let data = self.save_state()?;
        let mut stream = storage.create(name)?;
        stream.write_at(0, &data)?;
        log::info!("State saved: {} ({} bytes)", name, data.len());
        Ok(())
    }

    /// 保存された状態を復元する。ファイル全体を検証してから適用する
    pub fn load_state(&mut self, data: &[u8], storage: &dyn Storage) -> Result<(), SaveStateError> {
        let mut r = StateReader::new(data);
        let header = r.read_exact(STATE_HEADER.len(), "header")?;
        if header != STATE_HEADER {
            return Err(SaveStateError::BadHeader {
                found: header.to_vec(),
            });
        }

        // 検証パス: 作業用のコピーに読み込む
        let mut cpu = self.cpu.clone();
        cpu.load_state(&mut r)?;
        if (cpu.cpu_type == CpuType::Cpu65C02) != self.model.has_65c02() {
            return Err(SaveStateError::InvalidValue {
                context: "cpu type for this model",
                value: cpu.cpu_type as u64,
            });
        }
        let memory_at = data.len() - r.remaining_len();
        Memory::new(self.model).load_state(&mut r)?;

        let mut records = Vec::new();
        loop {
            match r.read_u8("record")? {
                magic::END => break,
                magic::SLOT => {
                    let slot = r.read_u8("slot number")?;
                    let name = r.read_str("slot name")?;
                    let payload = r.read_blob("slot payload")?;
                    r.expect_magic("slot", magic::SLOT)?;
                    records.push(SlotRecord { slot, name, payload });
                }
                found => {
                    return Err(SaveStateError::BadMagic {
                        record: "slot",
                        expected: magic::SLOT,
                        found,
                    })
                }
            }
        }
        let mut staged = Vec::with_capacity(records.len());
        for rec in &records {
            match self.memory.slot(rec.slot as usize) {
                Some(card) if card.name() == rec.name => {
                    staged.push((rec.slot, card.prepare_state(rec.payload, storage)?));
                }
                Some(card) => {
                    return Err(SaveStateError::SlotMismatch {
                        slot: rec.slot,
                        detail: format!("saved {}, installed {}", rec.name, card.name()),
                    })
                }
                None => {
                    return Err(SaveStateError::SlotMismatch {
                        slot: rec.slot,
                        detail: format!("saved {}, slot is empty", rec.name),
                    })
                }
            }
        }

        // 適用パス
        self.memory.load_state(&mut StateReader::new(&data[memory_at..]))?;
        self.cpu = cpu;
        for (slot, state) in staged {
            if let Some(card) = self.memory.slot_dyn_mut(slot as usize) {
                card.commit_state(state);
            }
        }
        Ok(())
    }

    /// ストレージから状態を読み込んで復元する
    pub fn resume(&mut self, storage: &dyn Storage, name: &str) -> Result<(), SaveStateError> {
        let data = storage.open(name)?.read_all()?;
        self.load_state(&data, storage)?;
        log::info!("State loaded: {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcr::DSK_SIZE;
    use crate::memory::Bank;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::Ordering;

    /// $D000 から始まる12KのROM
    fn test_rom(program: &[u8]) -> Vec<u8> {
        let mut rom = vec![0xEA; 0x3000];
        rom[..program.len()].copy_from_slice(program);
        // リセットベクタ → $D000
        rom[0x2FFC] = 0x00;
        rom[0x2FFD] = 0xD0;
        rom
    }

    /// LDA #$42 / STA $0300 / INC $0301 / JMP $D005
    fn counting_machine() -> Apple2 {
        let mut machine = Apple2::new(AppleModel::AppleIIPlus);
        let rom = test_rom(&[0xA9, 0x42, 0x8D, 0x00, 0x03, 0xEE, 0x01, 0x03, 0x4C, 0x05, 0xD0]);
        machine.load_rom(&rom).unwrap();
        machine.power_on();
        machine
    }

    #[test]
    fn test_power_on_and_run() {
        let mut machine = counting_machine();
        assert_eq!(machine.cpu.regs.pc, 0xD000);
        let cycles = machine.run(2500);
        assert!(cycles > 0);
        assert_eq!(machine.cpu.steps, 2500);
        assert_eq!(machine.memory.read_direct(0x0300, Bank::Main), 0x42);
        assert_ne!(machine.memory.read_direct(0x0301, Bank::Main), 0);
    }

    #[test]
    fn test_cpu_type_follows_model() {
        assert_eq!(Apple2::new(AppleModel::AppleIIPlus).cpu.cpu_type, CpuType::Cpu6502);
        assert_eq!(Apple2::new(AppleModel::AppleIIe).cpu.cpu_type, CpuType::Cpu6502);
        assert_eq!(Apple2::new(AppleModel::AppleIIeEnhanced).cpu.cpu_type, CpuType::Cpu65C02);
    }

    #[test]
    fn test_run_stops_on_yield() {
        let mut machine = counting_machine();
        let handle = machine.yield_handle();
        handle.store(true, Ordering::Release);
        assert_eq!(machine.run(100), 0);
        assert_eq!(machine.cpu.steps, 0);
        assert_eq!(machine.run(10), machine.status().cycles - 7);
    }

    #[test]
    fn test_warm_reset_keeps_ram_and_time() {
        let mut machine = counting_machine();
        machine.run(50);
        let cycles = machine.cpu.total_cycles;
        machine.reset();
        assert_eq!(machine.cpu.regs.pc, 0xD000);
        assert_eq!(machine.cpu.total_cycles, cycles);
        assert_eq!(machine.memory.read_direct(0x0300, Bank::Main), 0x42);
    }

    #[test]
    fn test_disk_rom_appears_in_slot_space() {
        let mut machine = counting_machine();
        let mut rom = vec![0u8; 256];
        rom[0x00] = 0xA2;
        rom[0x01] = 0x20;
        rom[0xFF] = 0x5A;
        machine.load_disk_rom(&rom).unwrap();
        assert_eq!(machine.memory.read(0xC6FF), 0x5A);
        assert!(machine.load_disk_rom(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_insert_disk_failure_is_reported() {
        let mut machine = counting_machine();
        let storage = MemoryStorage::new();
        assert!(machine.insert_disk(0, &storage, "missing.dsk", false).is_err());
        assert!(machine.disk().unwrap().drive(0).image().is_none());
    }

    #[test]
    fn test_suspend_and_resume() {
        let storage = MemoryStorage::new();
        storage.insert("boot.dsk", vec![0u8; DSK_SIZE]);

        let mut machine = counting_machine();
        machine.insert_disk(0, &storage, "boot.dsk", true).unwrap();
        machine.run(300);
        let saved_regs = machine.cpu.regs.clone();
        let saved_cycles = machine.cpu.total_cycles;
        let counter = machine.memory.read_direct(0x0301, Bank::Main);
        machine.suspend(&storage, "state.a2s").unwrap();

        machine.run(300);
        machine.eject_disk(0);
        assert_ne!(machine.cpu.total_cycles, saved_cycles);

        machine.resume(&storage, "state.a2s").unwrap();
        assert_eq!(machine.cpu.regs, saved_regs);
        assert_eq!(machine.cpu.total_cycles, saved_cycles);
        assert_eq!(machine.memory.read_direct(0x0301, Bank::Main), counter);
        let drive = machine.disk().unwrap().drive(0);
        assert_eq!(drive.image().map(|i| i.name()), Some("boot.dsk"));
        assert!(drive.is_write_protected());
    }

    #[test]
    fn test_resume_without_disk_image_changes_nothing() {
        let storage = MemoryStorage::new();
        storage.insert("boot.dsk", vec![0u8; DSK_SIZE]);

        let mut machine = counting_machine();
        machine.insert_disk(0, &storage, "boot.dsk", false).unwrap();
        machine.run(300);
        let data = machine.save_state().unwrap();

        machine.run(300);
        let regs = machine.cpu.regs.clone();
        let cycles = machine.cpu.total_cycles;
        let counter = machine.memory.read_direct(0x0301, Bank::Main);

        // boot.dsk のないストレージからは復元できない
        let err = machine.load_state(&data, &MemoryStorage::new()).unwrap_err();
        assert!(matches!(err, SaveStateError::Image(_)), "{:?}", err);
        assert_eq!(machine.cpu.regs, regs);
        assert_eq!(machine.cpu.total_cycles, cycles);
        assert_eq!(machine.memory.read_direct(0x0301, Bank::Main), counter);
        let drive = machine.disk().unwrap().drive(0);
        assert_eq!(drive.image().map(|i| i.name()), Some("boot.dsk"));
    }

    #[test]
    fn test_resume_rejects_bad_state() {
        let storage = MemoryStorage::new();
        storage.insert("junk.a2s", b"NOTASAVEFILE".to_vec());
        let mut machine = counting_machine();
        machine.run(20);
        let regs = machine.cpu.regs.clone();

        let err = machine.resume(&storage, "junk.a2s").unwrap_err();
        assert!(matches!(err, SaveStateError::BadHeader { .. }));
        assert_eq!(machine.cpu.regs, regs);

        // 末尾を切り詰めたファイル
        let mut data = machine.save_state().unwrap();
        data.truncate(data.len() - 3);
        machine.run(20);
        let regs = machine.cpu.regs.clone();
        assert!(machine.load_state(&data, &storage).is_err());
        assert_eq!(machine.cpu.regs, regs);
    }

    #[test]
    fn test_resume_rejects_other_model() {
        let storage = MemoryStorage::new();
        let mut plus = counting_machine();
        let data = plus.save_state().unwrap();
        let mut enhanced = Apple2::new(AppleModel::AppleIIeEnhanced);
        assert!(matches!(
            enhanced.load_state(&data, &storage),
            Err(SaveStateError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_status_serializes() {
        let machine = counting_machine();
        let json = serde_json::to_string(&machine.status()).unwrap();
        assert!(json.contains("\"model\":\"AppleIIPlus\""));
        assert!(json.contains("\"drives\""));
    }
}
