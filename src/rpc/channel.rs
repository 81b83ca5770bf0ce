//! `RpcChannel`: 一条经过双向认证的RPC连接
//!
//! 连接建立后先做4个包的握手（AUTH → RESP → RESP），认证完成前：
//! - 收到AUTH / RESP以外的包、payload长度不对、缓冲超过上限，都直接断开；
//! - 本地发出的CALL等包先放进deferred缓冲，认证完成后一起发送。
//!
//! 认证完成后，CALL交给登记的handler处理，结果以同一个seq的RETN / EXCP返回；
//! 本地发出的调用按seq等待对应的RETN / EXCP，多个调用可以乱序完成。

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
};

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::{
    config::{ChannelConfig, Config, RpcConfig},
    error::{Error, Result},
    executor::EX,
    in_progress::InProgress,
    rpc::{
        auth::{self, Digest, ZERO},
        codec::{Args, CallPayload, Codec, ExceptionPayload, Kwargs},
        packet::{self, AuthPayload, FrameBuffer, Header, PacketType},
    },
    signal::{Signal, Subscription},
    tcp::Socket,
    thread::LoopHandle,
};

/// handler的返回值
pub enum Reply {
    Value(Value),
    Error(Error),
    /// 结果稍后才有，`InProgress`结束时再回复
    Pending(InProgress<Value>),
}

impl From<Result<Value>> for Reply {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Reply::Value(value),
            Err(err) => Reply::Error(err),
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

impl From<InProgress<Value>> for Reply {
    fn from(ip: InProgress<Value>) -> Self {
        Reply::Pending(ip)
    }
}

type Handler = Rc<dyn Fn(&RpcChannel, Args, Kwargs) -> Reply>;

/// 名字到handler的映射
#[derive(Clone, Default)]
pub struct Registry {
    handlers: FxHashMap<String, Handler>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("names", &names).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个可以被远端调用的函数，同名的会被替换
    pub fn expose<F, R>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&RpcChannel, Args, Kwargs) -> R + 'static,
        R: Into<Reply>,
    {
        let handler: Handler = Rc::new(move |channel: &RpcChannel, args: Args, kwargs: Kwargs| {
            handler(channel, args, kwargs).into()
        });
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn merge(&mut self, other: &Registry) -> &mut Self {
        for (name, handler) in &other.handlers {
            self.handlers.insert(name.clone(), handler.clone());
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// 接受连接的一方，先发出challenge
    Server,
    Client,
}

struct State {
    socket: Socket,
    authenticated: bool,
    closed: bool,
    next_seq: u32,
    in_flight: FxHashMap<u32, (InProgress<Value>, String)>,
    /// 只在一轮握手进行中时存在
    pending_challenge: Option<Digest>,
    /// 认证完成前发出的包，按seq保存
    deferred: Vec<(u32, Vec<u8>)>,
    frames: FrameBuffer,
    connected: InProgress<()>,
    subscriptions: Vec<Subscription>,
}

struct Inner {
    role: Role,
    secret: Vec<u8>,
    rpc_config: RpcConfig,
    channel_config: ChannelConfig,
    codec: Rc<dyn Codec>,
    registry: RefCell<Registry>,
    state: RefCell<State>,
    open: Signal<()>,
    closed: Signal<()>,
    remote_id: Cell<Option<u64>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(id) = self.remote_id.get() {
            let _ = REMOTE_CHANNELS.try_with(|channels| channels.borrow_mut().remove(&id));
        }
    }
}

/// 一条RPC连接
#[derive(Clone)]
pub struct RpcChannel {
    inner: Rc<Inner>,
}

impl fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("RpcChannel")
            .field("role", &self.inner.role)
            .field("socket", &st.socket)
            .field("authenticated", &st.authenticated)
            .field("in_flight", &st.in_flight.len())
            .finish()
    }
}

impl RpcChannel {
    fn build(role: Role, config: &Config, codec: Rc<dyn Codec>, registry: Registry) -> Self {
        let socket = Socket::with_config(&config.channel);
        let inner = Rc::new(Inner {
            role,
            secret: config.rpc.secret.as_bytes().to_vec(),
            rpc_config: config.rpc.clone(),
            channel_config: config.channel.clone(),
            codec,
            registry: RefCell::new(registry),
            state: RefCell::new(State {
                socket,
                authenticated: false,
                closed: false,
                next_seq: 1,
                in_flight: FxHashMap::default(),
                pending_challenge: None,
                deferred: Vec::new(),
                frames: FrameBuffer::new(),
                connected: InProgress::new(),
                subscriptions: Vec::new(),
            }),
            open: Signal::new(),
            closed: Signal::new(),
            remote_id: Cell::new(None),
        });
        Self { inner }
    }

    /// 服务端：包装一个已经接受的连接并发出第一个challenge
    pub(crate) fn accepted(socket: Socket, config: &Config, codec: Rc<dyn Codec>, registry: Registry) -> Self {
        let channel = Self::build(Role::Server, config, codec, registry);
        Inner::attach(&channel.inner, socket);
        Inner::send_challenge(&channel.inner);
        channel
    }

    /// 客户端：连接到`address`，等待对方的challenge
    pub(crate) fn connect(address: &str, config: &Config, codec: Rc<dyn Codec>) -> Self {
        let channel = Self::build(Role::Client, config, codec, Registry::new());
        let socket = channel.socket();
        Inner::attach(&channel.inner, socket);
        channel.dial(address);
        channel
    }

    /// 断线后用一个新的socket重新连接
    pub(crate) fn reconnect(&self, address: &str) {
        let socket = Socket::with_config(&self.inner.channel_config);
        Inner::attach(&self.inner, socket);
        self.dial(address);
    }

    fn dial(&self, address: &str) {
        let socket = self.socket();
        let weak = Rc::downgrade(&self.inner);
        let target = address.to_string();
        socket.connect(address).on_error(move |err| {
            tracing::warn!(address = %target, "rpc connect failed: {err}");
            if let Some(inner) = weak.upgrade() {
                Inner::abandon(&inner, err.clone());
            }
        });
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn socket(&self) -> Socket {
        self.inner.state.borrow().socket.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().authenticated
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    /// 是否已经连接并完成认证
    pub fn is_connected(&self) -> bool {
        let st = self.inner.state.borrow();
        !st.closed && st.authenticated && st.socket.connected()
    }

    /// 当前连接认证完成时结束；认证失败或连接提前关闭时失败
    pub fn connected(&self) -> InProgress<()> {
        self.inner.state.borrow().connected.clone()
    }

    /// 认证完成时触发
    pub fn open_signal(&self) -> &Signal<()> {
        &self.inner.open
    }

    /// 连接关闭时触发一次
    pub fn closed_signal(&self) -> &Signal<()> {
        &self.inner.closed
    }

    /// 还没有收到回复的调用数量
    pub fn in_flight(&self) -> usize {
        self.inner.state.borrow().in_flight.len()
    }

    pub fn expose<F, R>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&RpcChannel, Args, Kwargs) -> R + 'static,
        R: Into<Reply>,
    {
        self.inner.registry.borrow_mut().expose(name, handler);
    }

    pub fn register(&self, registry: &Registry) {
        self.inner.registry.borrow_mut().merge(registry);
    }

    /// 远程调用`name`。认证完成前发出的调用会被缓存，认证后发送。
    ///
    /// 调用本身没有超时，需要时用`InProgress::timeout`；abort返回的`InProgress`
    /// 只是不再等待结果，远端仍然会执行。
    pub fn rpc(&self, name: &str, args: Args, kwargs: Kwargs) -> InProgress<Value> {
        let call = CallPayload {
            name: name.to_string(),
            args,
            kwargs,
        };
        let payload = match self.inner.codec.encode_call(&call) {
            Ok(payload) => payload,
            Err(err) => return InProgress::failed(err),
        };
        let (seq, ip) = {
            let mut st = self.inner.state.borrow_mut();
            if st.closed {
                return InProgress::failed(Error::Closed(format!(
                    "rpc channel closed, cannot call '{name}'"
                )));
            }
            let seq = st.next_seq;
            st.next_seq = st.next_seq.wrapping_add(1).max(1);
            let ip = InProgress::new();
            st.in_flight.insert(seq, (ip.clone(), call.name));
            (seq, ip)
        };

        let weak = Rc::downgrade(&self.inner);
        ip.on_abort(move |_| {
            if let Some(inner) = weak.upgrade() {
                if let Ok(mut st) = inner.state.try_borrow_mut() {
                    st.in_flight.remove(&seq);
                }
            }
        });
        tracing::debug!(seq, name, "rpc call");
        if let Err(err) = Inner::send(&self.inner, seq, PacketType::Call, &payload) {
            self.inner.state.borrow_mut().in_flight.remove(&seq);
            let _ = ip.fail(err);
        }
        ip
    }

    /// 只有位置参数的`rpc`
    pub fn call(&self, name: &str, args: Args) -> InProgress<Value> {
        self.rpc(name, args, Kwargs::new())
    }

    /// 关闭连接，所有未完成的调用以`Error::Closed`失败
    pub fn close(&self) {
        let socket = self.socket();
        socket.close(true);
        Inner::handle_close(&self.inner);
    }

    /// 返回一个可以交给其他线程的句柄
    pub fn remote(&self) -> Result<RemoteChannel> {
        if !EX.is_set() {
            return Err(Error::NoEventLoop);
        }
        let id = match self.inner.remote_id.get() {
            Some(id) => id,
            None => {
                let id = NEXT_REMOTE_ID.fetch_add(1, Ordering::Relaxed);
                REMOTE_CHANNELS.with(|channels| {
                    channels.borrow_mut().insert(id, Rc::downgrade(&self.inner));
                });
                self.inner.remote_id.set(Some(id));
                id
            }
        };
        Ok(RemoteChannel {
            id,
            handle: EX.with(|ex| ex.handle()),
        })
    }
}

impl Inner {
    /// 挂到一个新的socket上，重置认证状态
    fn attach(this: &Rc<Self>, socket: Socket) {
        socket.set_chunk_size(this.rpc_config.preauth_chunk_size);

        let reader = this.clone();
        let on_read = socket
            .signals()
            .read
            .subscribe(move |data: &Vec<u8>| Inner::handle_read(&reader, data));
        let closer = this.clone();
        let on_closed = socket.signals().closed.subscribe(move |expected: &bool| {
            tracing::debug!(expected, "rpc socket closed");
            Inner::handle_close(&closer);
        });

        let old = {
            let mut st = this.state.borrow_mut();
            st.socket = socket;
            st.authenticated = false;
            st.closed = false;
            st.pending_challenge = None;
            st.deferred.clear();
            st.frames.clear();
            if !st.connected.is_pending() {
                st.connected = InProgress::new();
            }
            std::mem::replace(&mut st.subscriptions, vec![on_read, on_closed])
        };
        drop(old);
    }

    fn send_challenge(this: &Rc<Self>) {
        let challenge = auth::random_value();
        this.state.borrow_mut().pending_challenge = Some(challenge);
        let payload = AuthPayload {
            challenge,
            ..Default::default()
        };
        let _ = Inner::send(this, 0, PacketType::Auth, &payload.encode());
    }

    /// 编码并发送一个包，认证完成前非认证包先缓存
    fn send(this: &Rc<Self>, seq: u32, kind: PacketType, payload: &[u8]) -> Result<()> {
        let frame = packet::encode(seq, kind, payload)?;
        let socket = {
            let mut st = this.state.borrow_mut();
            if st.closed {
                return Err(Error::Closed("rpc channel closed".into()));
            }
            if !st.authenticated && !kind.is_auth() {
                // deferred frames are flushed into the write queue at once, so they must fit in it
                let limit = st.socket.queue_size();
                let used: usize = st.deferred.iter().map(|(_, frame)| frame.len()).sum();
                if used + frame.len() > limit {
                    tracing::warn!(seq, used, limit, "too much deferred before authentication");
                    return Err(Error::QueueFull { limit });
                }
                tracing::debug!(seq, ?kind, "deferring packet until authenticated");
                st.deferred.push((seq, frame));
                return Ok(());
            }
            st.socket.clone()
        };
        Inner::write(this, &socket, frame);
        Ok(())
    }

    fn write(this: &Rc<Self>, socket: &Socket, data: Vec<u8>) {
        let weak = Rc::downgrade(this);
        socket.write(data).on_error(move |err| {
            tracing::debug!("rpc write failed: {err}");
            if let Some(inner) = weak.upgrade() {
                Inner::abandon(&inner, err.clone());
            }
        });
    }

    /// 写出一个认证前缓存的包；写队列放不下时只让这一个调用失败
    fn flush_deferred(this: &Rc<Self>, socket: &Socket, seq: u32, frame: Vec<u8>) {
        let written = socket.write(frame);
        if let Some(Err(err @ Error::QueueFull { .. })) = written.result() {
            let call = this.state.borrow_mut().in_flight.remove(&seq);
            if let Some((ip, name)) = call {
                tracing::warn!(seq, name = %name, "deferred call does not fit in the write queue");
                let _ = ip.fail(err);
            }
            return;
        }
        let weak = Rc::downgrade(this);
        written.on_error(move |err| {
            tracing::debug!("rpc write failed: {err}");
            if let Some(inner) = weak.upgrade() {
                Inner::abandon(&inner, err.clone());
            }
        });
    }

    fn handle_read(this: &Rc<Self>, data: &[u8]) {
        let overflow = {
            let mut st = this.state.borrow_mut();
            if st.closed {
                return;
            }
            st.frames.extend(data);
            (!st.authenticated && st.frames.len() > this.rpc_config.preauth_buffer_limit)
                .then(|| st.frames.len())
        };
        if let Some(buffered) = overflow {
            tracing::error!(buffered, "too much data before authentication, dropping connection");
            return Inner::abandon(
                this,
                Error::Protocol(format!("{buffered} bytes buffered before authentication")),
            );
        }

        loop {
            let (frame, authenticated) = {
                let mut st = this.state.borrow_mut();
                if st.closed {
                    return;
                }
                match st.frames.next_frame() {
                    Some(frame) => (frame, st.authenticated),
                    None => return,
                }
            };
            let (header, payload) = frame;
            tracing::trace!(seq = header.seq, tag = %header.tag_str(), len = header.len, "rpc packet");
            if authenticated {
                Inner::handle_packet(this, header, payload);
            } else {
                Inner::handle_auth_packet(this, header, &payload);
            }
        }
    }

    fn handle_auth_packet(this: &Rc<Self>, header: Header, payload: &[u8]) {
        let kind = match header.packet_type() {
            Some(kind) if kind.is_auth() => kind,
            _ => {
                tracing::error!(tag = %header.tag_str(), "packet received before authentication");
                return Inner::abandon(
                    this,
                    Error::Protocol(format!(
                        "got {} packet before authentication was complete",
                        header.tag_str()
                    )),
                );
            }
        };
        let received = match AuthPayload::decode(payload) {
            Ok(received) => received,
            Err(err) => {
                tracing::error!("{err}");
                return Inner::abandon(this, err);
            }
        };
        let pending = this.state.borrow_mut().pending_challenge.take();

        if kind == PacketType::Auth {
            if pending.is_some() {
                tracing::error!("AUTH received while a challenge was outstanding");
                return Inner::abandon(this, Error::Auth("unexpected challenge from peer".into()));
            }
            let (response, salt) = auth::respond(&this.secret, &received.challenge);
            let challenge = auth::random_value();
            this.state.borrow_mut().pending_challenge = Some(challenge);
            let reply = AuthPayload {
                challenge,
                response,
                salt,
            };
            let _ = Inner::send(this, header.seq, PacketType::Resp, &reply.encode());
            return;
        }

        let Some(challenge) = pending else {
            tracing::error!("RESP received without an outstanding challenge");
            return Inner::abandon(this, Error::Auth("response without a challenge".into()));
        };
        if !auth::verify(&this.secret, &challenge, &received.salt, &received.response) {
            tracing::error!(role = ?this.role, "peer failed authentication");
            return Inner::abandon(this, Error::Auth("peer sent an incorrect response".into()));
        }
        if received.challenge != ZERO {
            let (response, salt) = auth::respond(&this.secret, &received.challenge);
            let reply = AuthPayload {
                challenge: ZERO,
                response,
                salt,
            };
            let _ = Inner::send(this, header.seq, PacketType::Resp, &reply.encode());
        }
        Inner::handle_authenticated(this);
    }

    fn handle_authenticated(this: &Rc<Self>) {
        let (socket, deferred, connected) = {
            let mut st = this.state.borrow_mut();
            st.authenticated = true;
            (
                st.socket.clone(),
                std::mem::take(&mut st.deferred),
                st.connected.clone(),
            )
        };
        tracing::debug!(role = ?this.role, "rpc channel authenticated");
        socket.set_chunk_size(this.rpc_config.chunk_size);
        for (seq, frame) in deferred {
            Inner::flush_deferred(this, &socket, seq, frame);
        }
        if connected.is_pending() {
            let _ = connected.finish(());
        }
        this.open.emit(&());
    }

    fn handle_packet(this: &Rc<Self>, header: Header, payload: Vec<u8>) {
        let seq = header.seq;
        match header.packet_type() {
            Some(PacketType::Call) => Inner::handle_call(this, seq, &payload),
            Some(PacketType::Retn) => {
                let Some((ip, name)) = this.state.borrow_mut().in_flight.remove(&seq) else {
                    tracing::debug!(seq, "RETN for unknown call ignored");
                    return;
                };
                tracing::debug!(seq, name = %name, "rpc returned");
                let _ = match this.codec.decode_return(&payload) {
                    Ok(value) => ip.finish(value),
                    Err(err) => ip.fail(err),
                };
            }
            Some(PacketType::Excp) => {
                let Some((ip, name)) = this.state.borrow_mut().in_flight.remove(&seq) else {
                    tracing::debug!(seq, "EXCP for unknown call ignored");
                    return;
                };
                tracing::debug!(seq, name = %name, "rpc raised");
                let _ = match this.codec.decode_exception(&payload) {
                    Ok(ExceptionPayload { error, stack }) => ip.fail(Error::Remote {
                        call: name,
                        error,
                        stack,
                    }),
                    Err(err) => ip.fail(err),
                };
            }
            _ => {
                tracing::error!(seq, tag = %header.tag_str(), "unknown packet type, ignored");
            }
        }
    }

    fn handle_call(this: &Rc<Self>, seq: u32, payload: &[u8]) {
        let call = match this.codec.decode_call(payload) {
            Ok(call) => call,
            Err(err) => return Inner::reply_error(this, seq, "<undecodable>", &err),
        };
        let handler = this.registry.borrow().get(&call.name);
        let Some(handler) = handler else {
            tracing::warn!(name = %call.name, "call to unexposed name");
            let err = Error::msg(format!("no such callable '{}'", call.name));
            return Inner::reply_error(this, seq, &call.name, &err);
        };
        let channel = RpcChannel { inner: this.clone() };
        let name = call.name;
        match handler(&channel, call.args, call.kwargs) {
            Reply::Value(value) => Inner::reply_value(this, seq, &name, &value),
            Reply::Error(err) => Inner::reply_error(this, seq, &name, &err),
            Reply::Pending(ip) => {
                let weak = Rc::downgrade(this);
                ip.on_done(move |result| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    match result {
                        Ok(value) => Inner::reply_value(&inner, seq, &name, value),
                        Err(err) => Inner::reply_error(&inner, seq, &name, err),
                    }
                });
            }
        }
    }

    fn reply_value(this: &Rc<Self>, seq: u32, name: &str, value: &Value) {
        match this.codec.encode_return(value) {
            Ok(payload) => {
                if let Err(err) = Inner::send(this, seq, PacketType::Retn, &payload) {
                    tracing::debug!(seq, name, "could not send return value: {err}");
                }
            }
            Err(err) => Inner::reply_error(this, seq, name, &err),
        }
    }

    fn reply_error(this: &Rc<Self>, seq: u32, name: &str, err: &Error) {
        let mut stack = match err {
            Error::Remote { call, stack, .. } => {
                let mut stack = stack.clone();
                stack.push(format!("relayed from remote call '{call}'"));
                stack
            }
            _ => Vec::new(),
        };
        stack.push(format!("in rpc handler '{name}'"));
        let exception = ExceptionPayload {
            error: err.to_string(),
            stack,
        };
        let sent = this
            .codec
            .encode_exception(&exception)
            .and_then(|payload| Inner::send(this, seq, PacketType::Excp, &payload));
        if let Err(err) = sent {
            tracing::debug!(seq, name, "could not send exception: {err}");
        }
    }

    /// 协议错误或写失败：让`connected()`失败并断开
    fn abandon(this: &Rc<Self>, err: Error) {
        let (socket, connected) = {
            let st = this.state.borrow();
            (st.socket.clone(), st.connected.clone())
        };
        if connected.is_pending() {
            let _ = connected.fail(err);
        }
        socket.close(true);
        Inner::handle_close(this);
    }

    fn handle_close(this: &Rc<Self>) {
        let (in_flight, connected, subscriptions, authenticated) = {
            let mut st = this.state.borrow_mut();
            if st.closed {
                return;
            }
            st.closed = true;
            st.pending_challenge = None;
            st.deferred.clear();
            st.frames.clear();
            (
                std::mem::take(&mut st.in_flight),
                st.connected.clone(),
                std::mem::take(&mut st.subscriptions),
                st.authenticated,
            )
        };
        if authenticated {
            tracing::debug!(role = ?this.role, "rpc channel closed");
        } else {
            tracing::warn!(role = ?this.role, "connection closed before authentication completed");
        }
        if connected.is_pending() {
            let _ = connected.fail(Error::Closed(
                "connection closed before authentication completed".into(),
            ));
        }
        drop(subscriptions);

        let mut calls: Vec<_> = in_flight.into_iter().collect();
        calls.sort_by_key(|(seq, _)| *seq);
        for (seq, (ip, name)) in calls {
            if ip.is_pending() {
                tracing::debug!(seq, name = %name, "failing in-flight call");
                let _ = ip.fail(Error::Closed(format!("rpc channel closed before '{name}' returned")));
            }
        }
        this.closed.emit(&());
    }
}

thread_local! {
    static REMOTE_CHANNELS: RefCell<FxHashMap<u64, Weak<Inner>>> = RefCell::new(FxHashMap::default());
}

static NEXT_REMOTE_ID: AtomicU64 = AtomicU64::new(1);

/// `RpcChannel`的跨线程句柄，调用在事件循环线程上执行
#[derive(Debug, Clone)]
pub struct RemoteChannel {
    id: u64,
    handle: LoopHandle,
}

impl RemoteChannel {
    /// 把调用投递到事件循环线程，结果从返回的receiver取
    pub fn rpc(
        &self,
        name: &str,
        args: Args,
        kwargs: Kwargs,
    ) -> Result<crossbeam_channel::Receiver<Result<Value>>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let id = self.id;
        let name = name.to_string();
        self.handle.call(move || {
            let inner = REMOTE_CHANNELS.with(|channels| channels.borrow().get(&id).and_then(Weak::upgrade));
            let Some(inner) = inner else {
                let _ = tx.send(Err(Error::Closed("rpc channel no longer exists".into())));
                return;
            };
            RpcChannel { inner }.rpc(&name, args, kwargs).on_done(move |result| {
                let _ = tx.send(result.map(Value::clone).map_err(Error::clone));
            });
        })?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use serde_json::json;
    use std::os::unix::net::UnixStream;

    fn config(secret: &str) -> Config {
        let mut config = Config::default();
        config.rpc.secret = secret.into();
        config
    }

    #[test]
    fn calls_before_authentication_are_deferred() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let channel = RpcChannel::build(Role::Client, &config("s"), Rc::new(crate::rpc::JsonCodec), Registry::new());
            let (a, _b) = UnixStream::pair().unwrap();
            let socket = Socket::new();
            socket.channel().wrap(a, crate::io::Mode::ReadWrite).unwrap();
            Inner::attach(&channel.inner, socket.clone());

            let ip = channel.call("ping", vec![]);
            assert!(ip.is_pending());
            assert_eq!(channel.in_flight(), 1);
            assert_eq!(socket.write_queue_used(), 0);
            assert!(!channel.inner.state.borrow().deferred.is_empty());

            channel.close();
            assert!(matches!(ip.result(), Some(Err(Error::Closed(_)))));
            assert!(channel.call("late", vec![]).is_failed());
        });
    }

    #[test]
    fn deferred_calls_are_bounded_by_the_write_queue() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let channel = RpcChannel::build(Role::Client, &config("s"), Rc::new(crate::rpc::JsonCodec), Registry::new());
            let (a, _b) = UnixStream::pair().unwrap();
            let socket = Socket::new();
            socket.channel().wrap(a, crate::io::Mode::ReadWrite).unwrap();
            socket.set_queue_size(256);
            Inner::attach(&channel.inner, socket.clone());

            let small = channel.call("ping", vec![json!(1)]);
            assert!(small.is_pending());
            let big = channel.call("ping", vec![json!("x".repeat(300))]);
            assert!(matches!(big.result(), Some(Err(Error::QueueFull { limit: 256 }))));

            // the rejected call is forgotten, the channel stays usable
            assert_eq!(channel.in_flight(), 1);
            assert!(!channel.is_closed());
            assert_eq!(channel.inner.state.borrow().deferred.len(), 1);
            assert!(channel.call("ping", vec![json!(2)]).is_pending());
            assert_eq!(channel.in_flight(), 2);
        });
    }

    #[test]
    fn aborting_a_call_forgets_its_seq() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let channel = RpcChannel::build(Role::Client, &config(""), Rc::new(crate::rpc::JsonCodec), Registry::new());
            let ip = channel.rpc("slow", vec![json!(1)], Kwargs::new());
            assert_eq!(channel.in_flight(), 1);
            ip.abort().unwrap();
            assert_eq!(channel.in_flight(), 0);
        });
    }

    #[test]
    fn registry_merges_and_replaces() {
        let hits = Rc::new(Cell::new(0));
        let mut base = Registry::new();
        base.expose("a", |_: &RpcChannel, _, _| json!(1));
        let mut extra = Registry::new();
        let h = hits.clone();
        extra.expose("b", move |_: &RpcChannel, _, _| {
            h.set(h.get() + 1);
            Reply::Value(json!(2))
        });
        base.merge(&extra);
        assert!(base.contains("a") && base.contains("b"));
        assert_eq!(base.len(), 2);
        assert_eq!(hits.get(), 0);
    }
}
