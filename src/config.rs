//! 运行时配置
//!
//! ```toml
//! [channel]
//! chunk_size = 65536
//! delimiter = ["\r\n", "\n"]
//!
//! [rpc]
//! secret = "abc"
//! retry_interval_ms = 500
//! ```

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::error::{Error, Result};

pub(crate) const MIB: usize = 1024 * 1024;

const fn default_chunk_size() -> usize {
    MIB
}

const fn default_queue_size() -> usize {
    MIB
}

const fn default_preauth_chunk_size() -> usize {
    1024
}

const fn default_preauth_buffer_limit() -> usize {
    1024
}

/// `readline`的分隔符：一个字符串，或者其中任意一个
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Delimiter {
    Literal(String),
    AnyOf(Vec<String>),
}

impl Default for Delimiter {
    fn default() -> Self {
        Delimiter::Literal("\n".into())
    }
}

impl Delimiter {
    /// 在`buf[start..]`中查找第一个分隔符，返回分隔符结束的位置
    pub fn find(&self, buf: &[u8], start: usize) -> Option<usize> {
        let hay = buf.get(start..)?;
        let found = match self {
            Delimiter::Literal(delim) => find_bytes(hay, delim.as_bytes()).map(|i| i + delim.len()),
            // earliest match wins, longest on a tie
            Delimiter::AnyOf(delims) => delims
                .iter()
                .filter_map(|d| find_bytes(hay, d.as_bytes()).map(|i| (i, i + d.len())))
                .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
                .map(|(_, end)| end),
        };
        found.map(|end| start + end)
    }
}

fn find_bytes(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// 每次从描述符读取的最大字节数
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 读写队列各自的上限
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub delimiter: Delimiter,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            queue_size: default_queue_size(),
            delimiter: Delimiter::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// 双方共享的认证密钥
    #[serde(default)]
    pub secret: String,
    /// 认证完成前每次读取的字节数
    #[serde(default = "default_preauth_chunk_size")]
    pub preauth_chunk_size: usize,
    /// 认证完成前允许缓冲的字节数，超过即断开
    #[serde(default = "default_preauth_buffer_limit")]
    pub preauth_buffer_limit: usize,
    /// 认证完成后的读取块大小
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 客户端断线重连的间隔；不设置则不重连
    #[serde(default)]
    pub retry_interval_ms: Option<u64>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            preauth_chunk_size: default_preauth_chunk_size(),
            preauth_buffer_limit: default_preauth_buffer_limit(),
            chunk_size: default_chunk_size(),
            retry_interval_ms: None,
        }
    }
}

impl RpcConfig {
    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval_ms.map(Duration::from_millis)
    }

    /// 超过`u64`毫秒的间隔按`u64::MAX`保存
    pub fn set_retry_interval(&mut self, interval: Duration) {
        self.retry_interval_ms = Some(u64::try_from(interval.as_millis()).unwrap_or(u64::MAX));
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Config {
            path: "<string>".into(),
            message: err.to_string(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| Error::Config {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        toml::from_str(&text).map_err(|err| Error::Config {
            path: path.display().to_string(),
            message: err.to_string(),
        })
    }
}
