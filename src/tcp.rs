//! `Socket`: 建立在`IoChannel`上的TCP / Unix domain socket
//!
//! 地址`"host:port"`表示TCP，其他任何字符串都被当作Unix domain socket的路径。
//! `connect`是非阻塞的：在socket可写之前，写入的数据留在`IoChannel`的写队列里。

use std::{
    cell::RefCell,
    fmt, io,
    net::{SocketAddr, ToSocketAddrs},
    ops::Deref,
    os::unix::io::AsRawFd,
    path::PathBuf,
    rc::{Rc, Weak},
    str::FromStr,
};

use socket2::{Domain, Protocol, SockAddr, Socket as RawSocket, Type};

use crate::{
    config::ChannelConfig,
    error::{Error, Result},
    executor::EX,
    in_progress::InProgress,
    io::{IoChannel, Mode},
    reactor::Interest,
    signal::Signal,
};

const LISTEN_BACKLOG: i32 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `host:port`，连接时才解析
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::msg("empty address"));
        }
        if let Some((host, port)) = s.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                return Ok(Address::Tcp {
                    host: host.to_string(),
                    port,
                });
            }
        }
        Ok(Address::Unix(PathBuf::from(s)))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Address::Tcp { host, port } => write!(f, "{host}:{port}"),
            Address::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl Address {
    fn resolve(&self) -> io::Result<(Domain, SockAddr)> {
        match self {
            Address::Tcp { host, port } => {
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))?;
                Ok((Domain::for_address(addr), SockAddr::from(addr)))
            }
            Address::Unix(path) => Ok((Domain::UNIX, SockAddr::unix(path)?)),
        }
    }

    fn socket(&self) -> io::Result<(RawSocket, SockAddr)> {
        let (domain, addr) = self.resolve()?;
        let protocol = match self {
            Address::Tcp { .. } => Some(Protocol::TCP),
            Address::Unix(_) => None,
        };
        let socket = RawSocket::new(domain, Type::STREAM, protocol)?;
        socket.set_nonblocking(true)?;
        Ok((socket, addr))
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}

struct Inner {
    channel: IoChannel,
    config: ChannelConfig,
    address: RefCell<Option<Address>>,
    /// 非阻塞connect进行中的socket
    connecting: RefCell<Option<(RawSocket, InProgress<()>)>>,
    listener: RefCell<Option<RawSocket>>,
    new_client: Signal<Socket>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let listener = self.listener.get_mut().as_ref().map(|s| s.as_raw_fd());
        let connecting = self.connecting.get_mut().as_ref().map(|(s, _)| s.as_raw_fd());
        for fd in listener.into_iter().chain(connecting) {
            forget_fd(fd);
        }
    }
}

/// 把即将关闭的fd从`Reactor`中移除
pub(crate) fn forget_fd(fd: std::os::unix::io::RawFd) {
    if EX.is_set() {
        EX.with(|ex| {
            if let Ok(mut reactor) = ex.reactor.try_borrow_mut() {
                reactor.remove(fd);
            }
        });
    }
}

/// TCP或Unix domain socket
#[derive(Clone)]
pub struct Socket {
    inner: Rc<Inner>,
}

impl Deref for Socket {
    type Target = IoChannel;

    fn deref(&self) -> &IoChannel {
        &self.inner.channel
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("address", &*self.inner.address.borrow())
            .field("connected", &self.connected())
            .field("listening", &self.listening())
            .finish()
    }
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    pub fn new() -> Self {
        Self::with_config(&ChannelConfig::default())
    }

    pub fn with_config(config: &ChannelConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                channel: IoChannel::with_config(Mode::ReadWrite, config),
                config: config.clone(),
                address: RefCell::new(None),
                connecting: RefCell::new(None),
                listener: RefCell::new(None),
                new_client: Signal::new(),
            }),
        }
    }

    fn accepted(socket: RawSocket, config: &ChannelConfig, peer: Option<Address>) -> io::Result<Self> {
        let client = Self::with_config(config);
        *client.inner.address.borrow_mut() = peer;
        client.inner.channel.wrap(socket, Mode::ReadWrite)?;
        Ok(client)
    }

    /// 监听端口上每接受一个连接触发一次
    pub fn new_client(&self) -> &Signal<Socket> {
        &self.inner.new_client
    }

    pub fn channel(&self) -> &IoChannel {
        &self.inner.channel
    }

    pub fn connected(&self) -> bool {
        self.inner.channel.alive()
    }

    pub fn listening(&self) -> bool {
        self.inner.listener.borrow().is_some()
    }

    pub fn address(&self) -> Option<Address> {
        self.inner.address.borrow().clone()
    }

    /// 实际绑定的本地地址（监听`port 0`时用来获得端口）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .borrow()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
    }

    /// 连接到`address`。返回的`InProgress`在连接建立后完成。
    pub fn connect(&self, address: &str) -> InProgress<()> {
        let address = match address.parse::<Address>() {
            Ok(address) => address,
            Err(err) => return InProgress::failed(err),
        };
        if !EX.is_set() {
            return InProgress::failed(Error::NoEventLoop);
        }
        if self.connected() || self.inner.connecting.borrow().is_some() {
            return InProgress::failed(Error::InvalidMode("socket is already connected"));
        }
        *self.inner.address.borrow_mut() = Some(address.clone());

        let (socket, addr) = match address.socket() {
            Ok(pair) => pair,
            Err(err) => return InProgress::failed(err.into()),
        };
        match socket.connect(&addr) {
            Ok(()) => {
                return match self.inner.channel.wrap(socket, Mode::ReadWrite) {
                    Ok(()) => InProgress::finished(()),
                    Err(err) => InProgress::failed(err.into()),
                };
            }
            Err(err) if connect_in_progress(&err) => {}
            Err(err) => return InProgress::failed(err.into()),
        }

        let fd = socket.as_raw_fd();
        let ip = InProgress::new();
        let weak = Rc::downgrade(&self.inner);
        let registered = EX.with(|ex| {
            ex.reactor.borrow_mut().register(
                fd,
                Interest::Write,
                Rc::new(move || Self::finish_connect(&weak)),
            )
        });
        if let Err(err) = registered {
            return InProgress::failed(err.into());
        }
        *self.inner.connecting.borrow_mut() = Some((socket, ip.clone()));
        tracing::debug!(%address, "connecting");

        let weak = Rc::downgrade(&self.inner);
        ip.on_abort(move |_| {
            if let Some(inner) = weak.upgrade() {
                if inner.connecting.borrow_mut().take().is_some() && EX.is_set() {
                    EX.with(|ex| ex.reactor.borrow_mut().remove(fd));
                }
            }
        });
        ip
    }

    fn finish_connect(weak: &Weak<Inner>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let Some((socket, ip)) = inner.connecting.borrow_mut().take() else {
            return;
        };
        EX.with(|ex| ex.reactor.borrow_mut().remove(socket.as_raw_fd()));
        let result = match socket.take_error() {
            Ok(Some(err)) | Err(err) => Err(err),
            Ok(None) => inner.channel.wrap(socket, Mode::ReadWrite),
        };
        match result {
            Ok(()) => {
                tracing::debug!("connected");
                let _ = ip.finish(());
            }
            Err(err) => {
                tracing::debug!("connect failed: {err}");
                let _ = ip.fail(err.into());
            }
        }
    }

    /// 在`address`上监听，新连接通过`new_client` signal交付
    pub fn listen(&self, address: &str) -> Result<()> {
        let address = address.parse::<Address>()?;
        if !EX.is_set() {
            return Err(Error::NoEventLoop);
        }
        if let Address::Unix(path) = &address {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        let (socket, addr) = address.socket()?;
        if let Address::Tcp { .. } = address {
            socket.set_reuse_address(true)?;
        }
        socket.bind(&addr)?;
        socket.listen(LISTEN_BACKLOG)?;

        let fd = socket.as_raw_fd();
        let weak = Rc::downgrade(&self.inner);
        EX.with(|ex| {
            ex.reactor.borrow_mut().register(
                fd,
                Interest::Read,
                Rc::new(move || Self::accept_pending(&weak)),
            )
        })?;
        tracing::debug!(%address, "listening");
        *self.inner.listener.borrow_mut() = Some(socket);
        *self.inner.address.borrow_mut() = Some(address);
        Ok(())
    }

    fn accept_pending(weak: &Weak<Inner>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let mut accepted = Vec::new();
        if let Some(listener) = inner.listener.borrow().as_ref() {
            loop {
                match listener.accept() {
                    Ok((socket, peer)) => accepted.push((socket, peer)),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        tracing::warn!("accept failed: {err}");
                        break;
                    }
                }
            }
        }
        for (socket, peer) in accepted {
            let peer = peer.as_socket().map(|addr| Address::Tcp {
                host: addr.ip().to_string(),
                port: addr.port(),
            });
            match Self::accepted(socket, &inner.config, peer) {
                Ok(client) => {
                    tracing::debug!(?client, "accepted connection");
                    inner.new_client.emit(&client);
                }
                Err(err) => tracing::warn!("failed to set up accepted socket: {err}"),
            }
        }
    }

    /// 关闭连接或停止监听
    pub fn close(&self, immediate: bool) {
        let listener = self.inner.listener.borrow_mut().take();
        if let Some(listener) = listener {
            if EX.is_set() {
                EX.with(|ex| ex.reactor.borrow_mut().remove(listener.as_raw_fd()));
            }
            if let Some(Address::Unix(path)) = self.address() {
                let _ = std::fs::remove_file(path);
            }
        }
        let connecting = self.inner.connecting.borrow_mut().take();
        if let Some((socket, ip)) = connecting {
            if EX.is_set() {
                EX.with(|ex| ex.reactor.borrow_mut().remove(socket.as_raw_fd()));
            }
            drop(socket);
            let _ = ip.fail(Error::Closed("socket closed while connecting".into()));
        }
        self.inner.channel.close(immediate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;

    #[test]
    fn parses_addresses() {
        assert_eq!(
            "localhost:8080".parse::<Address>().unwrap(),
            Address::Tcp {
                host: "localhost".into(),
                port: 8080
            }
        );
        assert_eq!(
            "[::1]:9".parse::<Address>().unwrap().to_string(),
            "[::1]:9"
        );
        assert_eq!(
            "/tmp/rpc.sock".parse::<Address>().unwrap(),
            Address::Unix("/tmp/rpc.sock".into())
        );
        assert!("".parse::<Address>().is_err());
    }

    #[test]
    fn tcp_round_trip() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let server = Socket::new();
            server.listen("127.0.0.1:0").unwrap();
            let port = server.local_addr().unwrap().port();

            let clients = Rc::new(RefCell::new(Vec::new()));
            let c = clients.clone();
            server.new_client().connect(move |client: &Socket| c.borrow_mut().push(client.clone()));

            let client = Socket::new();
            let early = client.write(&b"hello"[..]);
            client.connect(&format!("127.0.0.1:{port}")).await.unwrap();
            assert!(client.connected());
            assert_eq!(early.await.unwrap(), 5);

            while clients.borrow().is_empty() {
                crate::timer::delay(std::time::Duration::from_millis(1)).await.unwrap();
            }
            let accepted = clients.borrow()[0].clone();
            assert_eq!(accepted.read().await.unwrap(), b"hello");
            accepted.write(&b"world"[..]).await.unwrap();
            assert_eq!(client.read().await.unwrap(), b"world");
            server.close(true);
            assert!(!server.listening());
        });
    }

    #[test]
    fn unix_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.sock");
        let path = path.to_str().unwrap().to_string();
        let ex = Executor::new();
        ex.block_on(move || async move {
            let server = Socket::new();
            server.listen(&path).unwrap();
            let accepted = server.new_client().next();

            let client = Socket::new();
            client.connect(&path).await.unwrap();
            let peer = accepted.await.unwrap();
            client.write(&b"ping"[..]);
            assert_eq!(peer.read().await.unwrap(), b"ping");
        });
    }

    #[test]
    fn refused_connection_fails() {
        let ex = Executor::new();
        ex.block_on(|| async {
            // bind then drop to get a port nobody listens on
            let port = std::net::TcpListener::bind("127.0.0.1:0")
                .unwrap()
                .local_addr()
                .unwrap()
                .port();
            let client = Socket::new();
            let result = client.connect(&format!("127.0.0.1:{port}")).await;
            assert!(matches!(result, Err(Error::Io(_))));
            assert!(!client.connected());
        });
    }
}
