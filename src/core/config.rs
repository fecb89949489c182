use std::{env, fs, io, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 覆寫日期快取容量的環境變數。
pub const DATE_CACHE_SIZE_ENV: &str = "BLUR_H1_DATE_CACHE_SIZE";

pub const DEFAULT_DATE_CACHE_CAPACITY: usize = 1000;
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// HTTP 日期快取的設定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateCacheConfig {
    /// 格式化與解析兩個方向各自的容量上限，超過時整個快取會被清空。
    pub capacity: usize,
}

impl Default for DateCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_DATE_CACHE_CAPACITY,
        }
    }
}

impl DateCacheConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity }
    }
}

/// 標頭解析器的設定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// 單一行（請求行、標頭行或折行）允許的最大位元組數，不含行結尾。
    pub max_line_length: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub date_cache: DateCacheConfig,
    pub tokenizer: TokenizerConfig,
}

impl Config {
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// 套用環境變數覆寫，目前只有日期快取容量。
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(raw) = env::var(DATE_CACHE_SIZE_ENV) {
            self.date_cache.capacity = parse_capacity(&raw)?;
            self.validate()?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.date_cache.capacity == 0 {
            return Err(ConfigError::Invalid(
                "date_cache.capacity must be greater than 0".to_string(),
            ));
        }
        if self.tokenizer.max_line_length == 0 {
            return Err(ConfigError::Invalid(
                "tokenizer.max_line_length must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_capacity(raw: &str) -> Result<usize, ConfigError> {
    raw.trim().parse::<usize>().map_err(|e| {
        ConfigError::Invalid(format!("{DATE_CACHE_SIZE_ENV}={raw:?} is not a valid size: {e}"))
    })
}
