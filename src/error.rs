//! 运行时的错误类型
//!
//! 所有失败最终都会落到某个`InProgress`上，所以`Error`必须可以`Clone`：
//! 同一个错误可能要同时交给多个回调。

use std::{io, sync::Arc};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// 描述符出错（I/O fault），对应的`IoChannel`已经关闭
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// 通道在操作完成之前被关闭
    #[error("{0}")]
    Closed(String),

    /// 协议错误：header不合法、认证前收到非认证包、认证前缓冲过大
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 认证失败
    #[error("authentication error: {0}")]
    Auth(String),

    /// 远端调用抛出的异常，附带远端的调用栈
    #[error("exception during RPC call '{call}': {error}\nremote traceback:\n{}", stack.join("\n"))]
    Remote {
        call: String,
        error: String,
        stack: Vec<String>,
    },

    /// `InProgress`被`abort()`
    #[error("aborted: {0}")]
    Aborted(String),

    /// 对同一个`InProgress`重复finish/fail/abort，属于本地编程错误
    #[error("InProgress already resolved")]
    DoubleResolution,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// 序列化或反序列化payload失败
    #[error("codec error: {0}")]
    Codec(String),

    /// 在没有运行事件循环的线程上调用了`wait()`等接口
    #[error("no event loop is running on this thread")]
    NoEventLoop,

    #[error("invalid mode: {0}")]
    InvalidMode(&'static str),

    #[error("data would exceed write queue limit ({limit} bytes)")]
    QueueFull { limit: usize },

    /// 配置文件读取或解析失败
    #[error("config error in {path}: {message}")]
    Config { path: String, message: String },

    /// 用户代码（coroutine、RPC handler、线程）返回的普通错误
    #[error("{0}")]
    Message(String),
}

impl Error {
    pub fn aborted() -> Self {
        Error::Aborted("InProgress task aborted by abort()".into())
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Error::Message(message.into())
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_shared_on_clone() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        let copy = err.clone();
        match (err, copy) {
            (Error::Io(a), Error::Io(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("expected Io variants"),
        }
    }

    #[test]
    fn remote_error_includes_stack() {
        let err = Error::Remote {
            call: "echo".into(),
            error: "boom".into(),
            stack: vec!["frame 1".into(), "frame 2".into()],
        };
        let text = err.to_string();
        assert!(text.contains("'echo'"));
        assert!(text.contains("boom"));
        assert!(text.contains("frame 2"));
    }
}
