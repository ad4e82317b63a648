//! a2core - ヘッドレス Apple II ランナー
//!
//! ROMとディスクを読み込み、指定命令数だけ実行して状態を表示する。
//! サスペンド/レジュームとセクタイメージの書き出しにも対応。

use a2core::apple2::Apple2;
use a2core::config::{get_config_path, Config};
use a2core::disk_log;
use a2core::gcr::SectorOrder;
use a2core::memory::AppleModel;
use a2core::storage::FileStorage;
use clap::Parser;
use std::fs;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "a2core")]
#[command(version = "0.1.0")]
#[command(about = "Apple IIe-class emulation core (headless runner)", long_about = None)]
struct Args {
    /// ディスクイメージファイル（ドライブ1）
    #[arg(short = '1', long)]
    disk1: Option<String>,

    /// ディスクイメージファイル（ドライブ2）
    #[arg(short = '2', long)]
    disk2: Option<String>,

    /// Apple IIモデル (ii+, iie, iie-enhanced)
    #[arg(short, long)]
    model: Option<String>,

    /// ROMファイル (12K/16K/20K/32K)
    #[arg(short, long)]
    rom: Option<String>,

    /// Disk II Boot ROM (256 bytes)
    #[arg(long)]
    disk_rom: Option<String>,

    /// 実行する命令数
    #[arg(long)]
    instructions: Option<u64>,

    /// 実行後に状態を保存するファイル
    #[arg(long)]
    suspend: Option<String>,

    /// 起動時に状態を復元するファイル
    #[arg(long)]
    resume: Option<String>,

    /// 設定ファイル（JSON）
    #[arg(long)]
    config: Option<String>,

    /// ディスクログレベル: none, flow, state, decide, nibble, all
    /// 複数指定可: flow,state,decide
    #[arg(long)]
    disk_log: Option<String>,

    /// 実行後の状態をJSONで出力
    #[arg(long)]
    status_json: bool,

    /// 実行後にドライブ1の内容をセクタイメージとして書き出す (.dsk / .po)
    #[arg(long)]
    export: Option<String>,
}

/// モデル名を解釈
fn parse_model(name: &str) -> Option<AppleModel> {
    match name.to_lowercase().as_str() {
        "ii+" | "iip" | "apple2+" | "apple2plus" => Some(AppleModel::AppleIIPlus),
        "iie" | "apple2e" => Some(AppleModel::AppleIIe),
        "iie-enhanced" | "enhanced" | "apple2ee" => Some(AppleModel::AppleIIeEnhanced),
        _ => None,
    }
}

/// コマンドライン指定で設定を上書き
fn merge_args(mut config: Config, args: &Args) -> Result<Config, String> {
    if let Some(name) = &args.model {
        config.model = parse_model(name).ok_or_else(|| format!("Unknown model: {}", name))?;
    }
    if args.rom.is_some() {
        config.rom = args.rom.clone();
    }
    if args.disk_rom.is_some() {
        config.disk_rom = args.disk_rom.clone();
    }
    if args.disk1.is_some() {
        config.disk1 = args.disk1.clone();
    }
    if args.disk2.is_some() {
        config.disk2 = args.disk2.clone();
    }
    if let Some(n) = args.instructions {
        config.instructions = n;
    }
    if let Some(level) = &args.disk_log {
        config.disk_log = level.clone();
    }
    Ok(config)
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Ok(Config::load_or_default(get_config_path())),
    };
    let config = match config.and_then(|c| merge_args(c, &args)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    disk_log::set_log_level(disk_log::parse_level(&config.disk_log));

    println!("a2core ({:?})", config.model);
    let mut emu = Apple2::new(config.model);

    match &config.rom {
        Some(path) => match fs::read(path) {
            Ok(data) => {
                if let Err(e) = emu.load_rom(&data) {
                    eprintln!("Failed to load ROM {}: {}", path, e);
                    return ExitCode::FAILURE;
                }
                log::info!("ROM loaded: {} ({} bytes)", path, data.len());
            }
            Err(e) => {
                eprintln!("Failed to read ROM {}: {}", path, e);
                return ExitCode::FAILURE;
            }
        },
        None => log::warn!("No ROM specified; the reset vector reads the floating bus"),
    }

    if let Some(path) = &config.disk_rom {
        match fs::read(path).map_err(|e| e.to_string()) {
            Ok(data) => match emu.load_disk_rom(&data) {
                Ok(()) => log::info!("Disk II boot ROM loaded: {}", path),
                Err(e) => log::error!("Disk II boot ROM {}: {}", path, e),
            },
            Err(e) => log::error!("Failed to read Disk II boot ROM {}: {}", path, e),
        }
    }

    let storage = FileStorage::new();
    for drive in 0..2 {
        if let Some(path) = config.disk(drive) {
            // 失敗してもマシンは起動する
            if let Err(e) = emu.insert_disk(drive, &storage, path, config.write_protect[drive]) {
                log::error!("Drive {}: {}: {}", drive + 1, path, e);
            }
        }
    }

    emu.power_on();

    let resume = args.resume.as_ref().or(config.state_file.as_ref());
    if let Some(path) = resume {
        if let Err(e) = emu.resume(&storage, path) {
            log::error!("Resume from {} failed: {}", path, e);
        }
    }

    let cycles = emu.run(config.instructions);
    println!(
        "Executed {} instructions, {} cycles (PC=${:04X})",
        emu.cpu.steps, cycles, emu.cpu.regs.pc
    );

    if let Some(path) = &args.export {
        let order = if path.to_lowercase().ends_with(".po") {
            SectorOrder::ProDos
        } else {
            SectorOrder::Dos
        };
        let exported = match emu.disk_mut() {
            Some(disk) => disk.export_sectors(0, order).map_err(|e| e.to_string()),
            None => Err("no disk controller".to_string()),
        };
        match exported.and_then(|data| fs::write(path, data).map_err(|e| e.to_string())) {
            Ok(()) => log::info!("Drive 1 exported to {}", path),
            Err(e) => log::error!("Export to {} failed: {}", path, e),
        }
    }

    if let Some(path) = &args.suspend {
        if let Err(e) = emu.suspend(&storage, path) {
            log::error!("Suspend to {} failed: {}", path, e);
        }
    }

    if args.status_json {
        match serde_json::to_string_pretty(&emu.status()) {
            Ok(json) => println!("{}", json),
            Err(e) => log::error!("Status serialization failed: {}", e),
        }
    }

    for drive in 0..2 {
        emu.eject_disk(drive);
    }
    ExitCode::SUCCESS
}
