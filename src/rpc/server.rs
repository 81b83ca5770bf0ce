//! RPC服务端：监听地址，为每个新连接创建`RpcChannel`并复制登记的函数

use std::{cell::RefCell, fmt, net::SocketAddr, rc::Rc};

use crate::{
    config::Config,
    error::Result,
    rpc::{
        channel::{Registry, Reply, RpcChannel},
        codec::{Args, Codec, JsonCodec, Kwargs},
    },
    signal::Signal,
    tcp::Socket,
};

struct Inner {
    socket: Socket,
    config: Config,
    codec: Rc<dyn Codec>,
    registry: RefCell<Registry>,
    client_connected: Signal<RpcChannel>,
}

pub struct Server {
    inner: Rc<Inner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("socket", &self.inner.socket)
            .field("registry", &*self.inner.registry.borrow())
            .finish()
    }
}

impl Server {
    /// 在`address`上监听，使用默认配置和`secret`
    pub fn bind(address: &str, secret: &str) -> Result<Self> {
        let mut config = Config::default();
        config.rpc.secret = secret.to_string();
        Self::with_config(address, &config)
    }

    pub fn with_config(address: &str, config: &Config) -> Result<Self> {
        Self::with_codec(address, config, Rc::new(JsonCodec))
    }

    pub fn with_codec(address: &str, config: &Config, codec: Rc<dyn Codec>) -> Result<Self> {
        let socket = Socket::with_config(&config.channel);
        let inner = Rc::new(Inner {
            socket: socket.clone(),
            config: config.clone(),
            codec,
            registry: RefCell::new(Registry::new()),
            client_connected: Signal::new(),
        });
        let weak = Rc::downgrade(&inner);
        socket.new_client().connect(move |client: &Socket| {
            if let Some(inner) = weak.upgrade() {
                Inner::accept(&inner, client.clone());
            }
        });
        socket.listen(address)?;
        tracing::info!(address, "rpc server listening");
        Ok(Self { inner })
    }

    /// 登记一组函数。只影响之后建立的连接。
    pub fn register(&self, registry: &Registry) {
        self.inner.registry.borrow_mut().merge(registry);
    }

    pub fn expose<F, R>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&RpcChannel, Args, Kwargs) -> R + 'static,
        R: Into<Reply>,
    {
        self.inner.registry.borrow_mut().expose(name, handler);
    }

    /// 每个完成认证的客户端触发一次
    pub fn client_connected(&self) -> &Signal<RpcChannel> {
        &self.inner.client_connected
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// 停止监听，已经建立的连接不受影响
    pub fn close(&self) {
        self.inner.socket.close(true);
    }
}

impl Inner {
    fn accept(this: &Rc<Self>, socket: Socket) {
        let registry = this.registry.borrow().clone();
        let channel = RpcChannel::accepted(socket, &this.config, this.codec.clone(), registry);
        let signal = this.client_connected.clone();
        let authenticated = channel.clone();
        channel
            .connected()
            .on_success(move |_| {
                tracing::debug!(?authenticated, "rpc client connected");
                signal.emit(&authenticated);
            })
            .on_error(|err| tracing::info!("rpc client rejected: {err}"));
    }
}
