use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub smoothing: SmoothingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// 接続先 (リモートピアのTCPアドレス)
    #[serde(default = "default_addr")]
    pub addr: String,
    /// サイクル間隔（ミリ秒）
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    /// フィットに必要な最小対応点数（3未満は3に切り上げ）
    #[serde(default = "default_min_correspondences")]
    pub min_correspondences: usize,
    /// 許容する最大フィット残差（メートル）
    #[serde(default = "default_max_residual")]
    pub max_residual: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SmoothingConfig {
    /// 移動平均ウィンドウ長（サンプル数）
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_smoothing_enabled")]
    pub enabled: bool,
}

fn default_addr() -> String { "127.0.0.1:13456".to_string() }
fn default_cycle_interval_ms() -> u64 { 200 }
fn default_min_correspondences() -> usize { 3 }
fn default_max_residual() -> f64 { 0.01 }
fn default_window_size() -> usize { 5 }
fn default_smoothing_enabled() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            cycle_interval_ms: default_cycle_interval_ms(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_correspondences: default_min_correspondences(),
            max_residual: default_max_residual(),
        }
    }
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            enabled: default_smoothing_enabled(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// 設定ファイルがなければデフォルトで起動する
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "Config {} not loaded ({}), using defaults",
                    path.as_ref().display(),
                    e
                );
                Self::default()
            }
        }
    }
}
