//! 拡張スロットのインターフェース
//!
//! スロット1-7に挿す周辺カードは `Slot` を実装する。
//! I/O ($C0n0-$C0nF)、ファームウェアROM ($Cn00-$CnFF)、
//! 任意の拡張ROM ($C800-$CFFF) とシリアライズを持つ。

use crate::savestate::SaveStateError;
use crate::storage::Storage;
use std::any::Any;

/// スロットROMウィンドウのサイズ
pub const SLOT_ROM_SIZE: usize = 256;
/// 拡張ROMウィンドウのサイズ
pub const EXPANSION_ROM_SIZE: usize = 2048;

pub trait Slot: Any {
    /// カード名（ログ用）
    fn name(&self) -> &'static str;

    /// ソフトスイッチ読み込み（reg = 0-15）
    fn io_read(&mut self, reg: u8, cycles: u64) -> u8;

    /// ソフトスイッチ書き込み
    fn io_write(&mut self, reg: u8, value: u8, cycles: u64);

    /// $Cn00-$CnFF に見えるファームウェアを書き込む
    fn load_rom(&self, rom: &mut [u8; SLOT_ROM_SIZE]);

    /// $C800-$CFFF に見える拡張ROM
    fn expansion_rom(&self) -> Option<&[u8]> {
        None
    }

    /// 電源投入/リセット
    fn reset(&mut self) {}

    /// 定期的な保守処理（タイマー期限の確認など）
    fn update(&mut self, _cycles: u64) {}

    /// 状態を保存する。保存対象がなければ None
    fn save_state(&mut self) -> Result<Option<Vec<u8>>, SaveStateError> {
        Ok(None)
    }

    /// 保存した状態を読み込み、適用できる形に準備する。
    /// カード自身は変更しない
    fn prepare_state(
        &self,
        _data: &[u8],
        _storage: &dyn Storage,
    ) -> Result<Box<dyn Any>, SaveStateError> {
        Ok(Box::new(()))
    }

    /// `prepare_state` で準備した状態を反映する
    fn commit_state(&mut self, _staged: Box<dyn Any>) {}

    /// 保存した状態を復元する
    fn load_state(&mut self, data: &[u8], storage: &dyn Storage) -> Result<(), SaveStateError> {
        let staged = self.prepare_state(data, storage)?;
        self.commit_state(staged);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
