//! RPC客户端，可以选择在断线后按固定间隔重连

use std::{cell::Cell, ops::Deref, rc::Rc, time::Duration};

use crate::{
    config::Config,
    coroutine::Coroutine,
    in_progress::InProgress,
    rpc::{
        channel::RpcChannel,
        codec::{Codec, JsonCodec},
    },
    timer::delay,
};

/// 客户端的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
pub struct Client {
    channel: RpcChannel,
    address: String,
    status: Rc<Cell<Status>>,
    /// 重连循环
    monitor: Option<InProgress<()>>,
}

impl Deref for Client {
    type Target = RpcChannel;

    fn deref(&self) -> &RpcChannel {
        &self.channel
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            if monitor.is_pending() {
                let _ = monitor.abort();
            }
        }
    }
}

impl Client {
    /// 连接到`address`，不重连
    pub fn connect(address: &str, secret: &str) -> Self {
        let mut config = Config::default();
        config.rpc.secret = secret.to_string();
        Self::with_config(address, &config)
    }

    /// 连接到`address`，断线后每隔`interval`重连
    pub fn with_retry(address: &str, secret: &str, interval: Duration) -> Self {
        let mut config = Config::default();
        config.rpc.secret = secret.to_string();
        config.rpc.set_retry_interval(interval);
        Self::with_config(address, &config)
    }

    /// 是否重连由`config.rpc.retry_interval_ms`决定
    pub fn with_config(address: &str, config: &Config) -> Self {
        Self::with_codec(address, config, Rc::new(JsonCodec))
    }

    pub fn with_codec(address: &str, config: &Config, codec: Rc<dyn Codec>) -> Self {
        let channel = RpcChannel::connect(address, config, codec);
        let status = Rc::new(Cell::new(Status::Connecting));
        let monitor = match config.rpc.retry_interval() {
            Some(interval) => Some(Self::monitor(channel.clone(), address.to_string(), status.clone(), interval)),
            None => {
                let connected = status.clone();
                let closed = status.clone();
                channel
                    .connected()
                    .on_success(move |_| connected.set(Status::Connected));
                channel
                    .closed_signal()
                    .connect(move |_| closed.set(Status::Disconnected));
                None
            }
        };
        Self {
            channel,
            address: address.to_string(),
            status,
            monitor,
        }
    }

    fn monitor(channel: RpcChannel, address: String, status: Rc<Cell<Status>>, interval: Duration) -> InProgress<()> {
        Coroutine::<()>::new().call(move |_ctx| async move {
            loop {
                status.set(Status::Connecting);
                match channel.connected().await {
                    Ok(()) => {
                        status.set(Status::Connected);
                        if !channel.is_closed() {
                            channel.closed_signal().next().await?;
                        }
                    }
                    Err(err) if err.is_aborted() => return Err(err),
                    Err(err) => tracing::debug!(%address, "rpc connection attempt failed: {err}"),
                }
                status.set(Status::Disconnected);
                delay(interval).await?;
                tracing::info!(%address, "reconnecting");
                channel.reconnect(&address);
            }
        })
    }

    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// 关闭连接并停止重连
    pub fn close(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            if monitor.is_pending() {
                let _ = monitor.abort();
            }
        }
        self.channel.close();
        self.status.set(Status::Disconnected);
    }
}
