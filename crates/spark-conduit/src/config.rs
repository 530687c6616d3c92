//! 引擎配置。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 读预取深度、零字节探测、出站字节上限决定了每条连接的内存占用与吞吐，需要可声明、可校验；
//! - 同时支持 TOML 文本与构建器两种入口：部署时读配置文件，测试与嵌入场景直接以代码构造。
//!
//! ## 契约（What）
//! - `read_ahead` ∈ [1, 16]，默认 4；
//! - `zero_byte_probe` 默认开启；
//! - `outgoing_byte_ceiling` ∈ [8192, 262144]，默认 65536；
//! - `pool` 三个自由链表上限均需大于 0；
//! - 缺省字段取默认值，未知字段视为错误。

use serde::Deserialize;
use spark_buffer::PoolLimits;

use crate::error::ConduitError;

pub const READ_AHEAD_RANGE: (usize, usize) = (1, 16);
pub const OUTGOING_CEILING_RANGE: (usize, usize) = (8 * 1024, 256 * 1024);

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub read_ahead: usize,
    pub zero_byte_probe: bool,
    pub outgoing_byte_ceiling: usize,
    pub pool: PoolConfig,
}

/// Packet 池自由链表上限。
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub small_free_cap: usize,
    pub large_free_cap: usize,
    pub local_free_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_ahead: 4,
            zero_byte_probe: true,
            outgoing_byte_ceiling: 64 * 1024,
            pool: PoolConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let limits = PoolLimits::default();
        Self {
            small_free_cap: limits.small_free_cap,
            large_free_cap: limits.large_free_cap,
            local_free_cap: limits.local_free_cap,
        }
    }
}

impl From<PoolConfig> for PoolLimits {
    fn from(config: PoolConfig) -> Self {
        PoolLimits {
            small_free_cap: config.small_free_cap,
            large_free_cap: config.large_free_cap,
            local_free_cap: config.local_free_cap,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConduitError> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|err| ConduitError::InvalidConfig {
                field: "toml",
                detail: err.message().to_owned(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConduitError> {
        check_range("read_ahead", self.read_ahead, READ_AHEAD_RANGE)?;
        check_range(
            "outgoing_byte_ceiling",
            self.outgoing_byte_ceiling,
            OUTGOING_CEILING_RANGE,
        )?;
        for (field, value) in [
            ("pool.small_free_cap", self.pool.small_free_cap),
            ("pool.large_free_cap", self.pool.large_free_cap),
            ("pool.local_free_cap", self.pool.local_free_cap),
        ] {
            if value == 0 {
                return Err(ConduitError::InvalidConfig {
                    field,
                    detail: "must be greater than zero".to_owned(),
                });
            }
        }
        Ok(())
    }
}

fn check_range(
    field: &'static str,
    value: usize,
    (min, max): (usize, usize),
) -> Result<(), ConduitError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConduitError::InvalidConfig {
            field,
            detail: format!("{value} is outside [{min}, {max}]"),
        })
    }
}

/// [`EngineConfig`] 的流式构建器；`build` 时统一校验。
#[derive(Clone, Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn read_ahead(mut self, depth: usize) -> Self {
        self.config.read_ahead = depth;
        self
    }

    pub fn zero_byte_probe(mut self, enabled: bool) -> Self {
        self.config.zero_byte_probe = enabled;
        self
    }

    pub fn outgoing_byte_ceiling(mut self, bytes: usize) -> Self {
        self.config.outgoing_byte_ceiling = bytes;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn build(self) -> Result<EngineConfig, ConduitError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
