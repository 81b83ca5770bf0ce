//! CALL / RETN / EXCP 的payload编码
//!
//! 编码方式可以替换，但两端必须事先约定一致。默认是JSON。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

pub type Args = Vec<Value>;
pub type Kwargs = Map<String, Value>;

/// CALL: 函数名、位置参数、关键字参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub name: String,
    #[serde(default)]
    pub args: Args,
    #[serde(default)]
    pub kwargs: Kwargs,
}

/// EXCP: 错误描述和远端调用栈
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub error: String,
    #[serde(default)]
    pub stack: Vec<String>,
}

pub trait Codec {
    fn name(&self) -> &'static str;

    fn encode_call(&self, call: &CallPayload) -> Result<Vec<u8>>;
    fn decode_call(&self, payload: &[u8]) -> Result<CallPayload>;

    fn encode_return(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode_return(&self, payload: &[u8]) -> Result<Value>;

    fn encode_exception(&self, exception: &ExceptionPayload) -> Result<Vec<u8>>;
    fn decode_exception(&self, payload: &[u8]) -> Result<ExceptionPayload>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_call(&self, call: &CallPayload) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(call)?)
    }

    fn decode_call(&self, payload: &[u8]) -> Result<CallPayload> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn encode_return(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode_return(&self, payload: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn encode_exception(&self, exception: &ExceptionPayload) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(exception)?)
    }

    fn decode_exception(&self, payload: &[u8]) -> Result<ExceptionPayload> {
        Ok(serde_json::from_slice(payload)?)
    }
}
