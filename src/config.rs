//! 設定ファイル管理モジュール
//!
//! エミュレータの設定をJSON形式で永続化

use crate::memory::AppleModel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 設定ファイルのデフォルトファイル名
const CONFIG_FILENAME: &str = "a2core_config.json";

/// 実行ファイルのディレクトリを取得
pub fn get_exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// 設定ファイルのパスを取得
pub fn get_config_path() -> PathBuf {
    get_exe_dir().join(CONFIG_FILENAME)
}

/// エミュレータ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 機種
    pub model: AppleModel,
    /// システムROMのパス
    pub rom: Option<String>,
    /// Disk IIブートROM (P5) のパス
    pub disk_rom: Option<String>,
    /// ドライブ1のディスク
    pub disk1: Option<String>,
    /// ドライブ2のディスク
    pub disk2: Option<String>,
    /// ドライブごとの書き込み禁止
    pub write_protect: [bool; 2],
    /// 実行する命令数
    pub instructions: u64,
    /// サスペンドファイル
    pub state_file: Option<String>,
    /// ディスクログのカテゴリ（"flow,state" など）
    pub disk_log: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            model: AppleModel::AppleIIeEnhanced,
            rom: None,
            disk_rom: None,
            disk1: None,
            disk2: None,
            write_protect: [false; 2],
            instructions: 1_000_000,
            state_file: None,
            disk_log: String::new(),
        }
    }
}

impl Config {
    /// 指定したパスから設定を読み込む
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read config {:?}: {}", path.as_ref(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config {:?}: {}", path.as_ref(), e))
    }

    /// 読み込めなければデフォルト設定を使う
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        if !path.as_ref().exists() {
            return Config::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("{}, using defaults", e);
                Config::default()
            }
        }
    }

    /// 指定したパスに設定を保存する
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, json)
            .map_err(|e| format!("Failed to write config: {}", e))?;
        Ok(())
    }

    /// ドライブ番号（0/1）のディスクパス
    pub fn disk(&self, drive: usize) -> Option<&str> {
        match drive {
            0 => self.disk1.as_deref(),
            1 => self.disk2.as_deref(),
            _ => None,
        }
    }
}
