//! Disk II ログシステム
//!
//! 原則:
//! 1. ログは「現象」ではなく「判断」を記録
//! 2. 状態遷移のみ記録（毎回のI/Oは記録しない）
//! 3. レベル分離: FLOW / STATE / DECIDE / NIBBLE
//!
//! 出力は `log` クレート経由（target = "disk"）。

use std::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// ログカテゴリ
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DiskLogLevel: u32 {
        /// L1: 何が起きているか（人間向け）
        const FLOW   = 0b0001;
        /// L2: 状態遷移（開発者向け）
        const STATE  = 0b0010;
        /// L2: 判断（バックログ破棄など）
        const DECIDE = 0b0100;
        /// L3: 生データ（短時間のみ）
        const NIBBLE = 0b1000;
    }
}

/// グローバルログレベル
static LOG_LEVEL: AtomicU32 = AtomicU32::new(0);

/// ログレベルを設定
pub fn set_log_level(level: DiskLogLevel) {
    LOG_LEVEL.store(level.bits(), Ordering::Relaxed);
}

/// 現在のログレベルを取得
pub fn get_log_level() -> DiskLogLevel {
    DiskLogLevel::from_bits_truncate(LOG_LEVEL.load(Ordering::Relaxed))
}

/// ログレベルが有効かチェック
#[inline]
pub fn is_enabled(flag: DiskLogLevel) -> bool {
    (LOG_LEVEL.load(Ordering::Relaxed) & flag.bits()) != 0
}

/// "flow+state" 形式の文字列を解釈
pub fn parse_level(s: &str) -> DiskLogLevel {
    let mut level = DiskLogLevel::empty();
    for part in s.to_lowercase().split(['+', ',']) {
        match part.trim() {
            "flow" => level |= DiskLogLevel::FLOW,
            "state" => level |= DiskLogLevel::STATE,
            "decide" => level |= DiskLogLevel::DECIDE,
            "nibble" => level |= DiskLogLevel::NIBBLE,
            "all" => level = DiskLogLevel::all(),
            _ => {}
        }
    }
    level
}

/// ニブルリングバッファ（最後のN個を保持）
pub struct NibbleRing {
    buf: Vec<u8>,
    pos: usize,
    capacity: usize,
}

impl NibbleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            pos: 0,
            capacity,
        }
    }

    pub fn push(&mut self, nibble: u8) {
        self.buf[self.pos % self.capacity] = nibble;
        self.pos += 1;
    }

    /// 最新からN個を取得（古い順）
    pub fn last_n(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.capacity).min(self.pos);
        (0..n)
            .map(|i| self.buf[(self.pos - n + i) % self.capacity])
            .collect()
    }

    /// ダンプ出力
    pub fn dump(&self, n: usize) {
        if !is_enabled(DiskLogLevel::NIBBLE) {
            return;
        }
        let data = self.last_n(n);
        log::debug!(target: "disk", "[DUMP] Last {} nibbles:", data.len());
        for row in data.chunks(16) {
            let line: Vec<String> = row.iter().map(|b| format!("{:02X}", b)).collect();
            log::debug!(target: "disk", "{}", line.join(" "));
        }
    }
}

impl Default for NibbleRing {
    fn default() -> Self {
        Self::new(256)
    }
}

// ============================================================
// ログ出力関数
// ============================================================

/// [FLOW] ディスク挿入
pub fn log_insert(drive: usize, name: &str) {
    if is_enabled(DiskLogLevel::FLOW) {
        log::info!(target: "disk", "[DISK] D{} inserted {}", drive + 1, name);
    }
}

/// [FLOW] ディスク排出
pub fn log_eject(drive: usize) {
    if is_enabled(DiskLogLevel::FLOW) {
        log::info!(target: "disk", "[DISK] D{} ejected", drive + 1);
    }
}

/// [FLOW] モーターON
pub fn log_motor_on(drive: usize) {
    if is_enabled(DiskLogLevel::FLOW) {
        log::info!(target: "disk", "[DISK] D{} motor ON", drive + 1);
    }
}

/// [FLOW] モーターOFF要求（惰性回転開始）
pub fn log_motor_off(drive: usize) {
    if is_enabled(DiskLogLevel::FLOW) {
        log::info!(target: "disk", "[DISK] D{} motor OFF", drive + 1);
    }
}

/// [STATE] 惰性回転の終了
pub fn log_spin_down(drive: usize) {
    if is_enabled(DiskLogLevel::STATE) {
        log::debug!(target: "disk", "[STATE] D{} stopped spinning", drive + 1);
    }
}

/// [STATE] ドライブ選択
pub fn log_drive_select(drive: usize) {
    if is_enabled(DiskLogLevel::STATE) {
        log::debug!(target: "disk", "[STATE] Drive {} selected", drive + 1);
    }
}

/// [STATE] ヘッド移動（ハーフトラック単位）
pub fn log_track_change(from: u8, to: u8) {
    if is_enabled(DiskLogLevel::STATE) {
        log::debug!(
            target: "disk",
            "[STATE] Track {}.{} -> {}.{}",
            from / 2,
            if from & 1 != 0 { 5 } else { 0 },
            to / 2,
            if to & 1 != 0 { 5 } else { 0 }
        );
    }
}

/// [STATE] 読み書きモード切り替え
pub fn log_mode_change(write_mode: bool) {
    if is_enabled(DiskLogLevel::STATE) {
        log::debug!(target: "disk", "[STATE] {} mode", if write_mode { "Write" } else { "Read" });
    }
}

/// [DECIDE] 読み遅れたビットの破棄
pub fn log_backlog_discarded(bits: u64) {
    if is_enabled(DiskLogLevel::DECIDE) {
        log::debug!(target: "disk", "[DECIDE] Backlog of {} bits skipped", bits);
    }
}

/// [DECIDE] 書き込み禁止で破棄
pub fn log_write_ignored(drive: usize) {
    if is_enabled(DiskLogLevel::DECIDE) {
        log::debug!(target: "disk", "[DECIDE] D{} write-protected, write ignored", drive + 1);
    }
}

/// [FLOW] ダーティトラックの書き戻し
pub fn log_flush(drive: usize, ok: bool) {
    if is_enabled(DiskLogLevel::FLOW) {
        log::info!(
            target: "disk",
            "[DISK] D{} flush {}",
            drive + 1,
            if ok { "OK" } else { "FAILED" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nibble_ring() {
        let mut ring = NibbleRing::new(8);
        for i in 0..10 {
            ring.push(i as u8);
        }
        let last4 = ring.last_n(4);
        assert_eq!(last4, vec![6, 7, 8, 9]);
        assert_eq!(ring.last_n(20).len(), 8);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("flow+state"), DiskLogLevel::FLOW | DiskLogLevel::STATE);
        assert_eq!(parse_level("Decide,nibble"), DiskLogLevel::DECIDE | DiskLogLevel::NIBBLE);
        assert_eq!(parse_level("all"), DiskLogLevel::all());
        assert_eq!(parse_level("none"), DiskLogLevel::empty());
    }

    #[test]
    fn test_log_level() {
        set_log_level(DiskLogLevel::FLOW | DiskLogLevel::STATE);
        assert!(is_enabled(DiskLogLevel::FLOW));
        assert!(is_enabled(DiskLogLevel::STATE));
        assert!(!is_enabled(DiskLogLevel::DECIDE));
        assert!(!is_enabled(DiskLogLevel::NIBBLE));
        assert_eq!(get_log_level(), DiskLogLevel::FLOW | DiskLogLevel::STATE);
        set_log_level(DiskLogLevel::empty());
    }
}
