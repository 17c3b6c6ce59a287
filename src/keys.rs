//! 键选择模块
//! Zipf（zeta）分布采样与定宽键名编码

use crate::config::{WorkloadConfig, ZipfConfig, defaults};
use crate::error::{AppError, Result};
use rand::Rng;
use rand_distr::{Distribution, Zeta};

/// 重尾分布键采样器
///
/// 从无界 zeta 分布抽样，超过 `max_keys` 的样本丢弃重抽，
/// 保留被接受区间内的分布形状。
#[derive(Debug, Clone)]
pub struct KeyDistribution {
    zeta: Zeta<f64>,
    max_keys: u64,
    max_attempts: u32,
}

impl KeyDistribution {
    pub fn new(zipf: &ZipfConfig) -> Result<Self> {
        let zeta = Zeta::new(zipf.shape).map_err(|e| AppError::ZetaCreate(e.to_string()))?;
        if zipf.max_keys == 0 {
            return Err(AppError::Config("zipf max keys must be at least 1".into()));
        }
        Ok(Self {
            zeta,
            max_keys: zipf.max_keys,
            max_attempts: defaults::MAX_SAMPLE_ATTEMPTS,
        })
    }

    /// 修改单次采样的重试上限
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// 返回 `1..=max_keys` 内的原始索引
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<u64> {
        let bound = self.max_keys as f64;
        for _ in 0..self.max_attempts {
            let draw = self.zeta.sample(rng);
            if draw <= bound {
                return Ok(draw as u64);
            }
        }
        Err(AppError::KeySpace(format!(
            "{} consecutive zeta draws exceeded max keys {}",
            self.max_attempts, self.max_keys
        )))
    }
}

/// 键名编码器：前缀 + 按宽度补零的十进制
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEncoder {
    prefix: String,
    width: usize,
}

impl KeyEncoder {
    pub fn new(prefix: impl Into<String>, width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            width,
        }
    }

    /// 负数的符号占一位宽度，例如宽度 4 时 `-5` 编码为 `-005`
    pub fn encode(&self, transformed: i64) -> String {
        format!("{}{:0width$}", self.prefix, transformed, width = self.width)
    }
}

/// 一次选键的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedKey {
    /// 变换前的采样值
    pub raw: u64,
    /// `offset + direction * raw`
    pub transformed: i64,
    pub name: String,
}

/// 采样 + 变换 + 编码
#[derive(Debug, Clone)]
pub struct KeySelector {
    distribution: KeyDistribution,
    encoder: KeyEncoder,
    zipf: ZipfConfig,
}

impl KeySelector {
    pub fn new(config: &WorkloadConfig) -> Result<Self> {
        Ok(Self {
            distribution: KeyDistribution::new(&config.zipf)?,
            encoder: KeyEncoder::new(config.key_prefix.clone(), config.key_width),
            zipf: config.zipf.clone(),
        })
    }

    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<SelectedKey> {
        let raw = self.distribution.sample(rng)?;
        Ok(self.key_for(raw))
    }

    /// 已知原始索引时直接构造
    pub fn key_for(&self, raw: u64) -> SelectedKey {
        let transformed = self.zipf.transform(raw);
        SelectedKey {
            raw,
            transformed,
            name: self.encoder.encode(transformed),
        }
    }

    pub fn encoder(&self) -> &KeyEncoder {
        &self.encoder
    }
}
