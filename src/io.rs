//! 带流量控制的`IoChannel`
//!
//! `IoChannel`包装一个非阻塞的字节流描述符，对外只暴露返回`InProgress`的
//! `read`/`readline`/`write`和三个signal（`read`/`readline`/`closed`）。
//!
//! 只有在有人关心数据的时候才向`Reactor`登记可读事件：有未完成的`read()`/`readline()`，
//! 或者`read`/`readline` signal上有订阅者。没人读的时候数据留在内核里，
//! 对端会因此被阻塞，而不是让我们无限制地缓冲。
//!
//! 写可以在描述符接上之前进行，数据在队列里等到描述符可写时再发出。

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt, io,
    io::{Read, Write},
    os::unix::io::{AsRawFd, RawFd},
    rc::Rc,
};

use crate::{
    config::{ChannelConfig, Delimiter},
    error::Error,
    executor::EX,
    in_progress::InProgress,
    reactor::{set_nonblocking, Interest},
    signal::Signal,
};

/// 可以被`IoChannel`包装的描述符
pub trait Descriptor: Read + Write + AsRawFd {}

impl<T: Read + Write + AsRawFd> Descriptor for T {}

/// 读写方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    ReadWrite,
}

impl Mode {
    pub fn can_read(self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Mode::Write | Mode::ReadWrite)
    }
}

/// `IoChannel`的signal
pub struct ChannelSignals {
    /// 每读到一块数据触发一次。订阅者收到所有数据，但不会抢走`read()`/`readline()`的数据。
    pub read: Signal<Vec<u8>>,
    /// 每读到一行触发一次。有订阅者时不能再调用`readline()`。
    pub readline: Signal<Vec<u8>>,
    /// 通道关闭时触发一次，参数表示是否是调用`close()`导致的
    pub closed: Signal<bool>,
}

struct PendingWrite {
    data: Vec<u8>,
    /// 已经写出的字节数
    offset: usize,
    ip: InProgress<usize>,
}

struct State {
    descriptor: Option<Box<dyn Descriptor>>,
    fd: Option<RawFd>,
    mode: Mode,
    /// 描述符被关闭过（`wrap`会清除）
    closed: bool,
    write_queue: VecDeque<PendingWrite>,
    read_queue: Vec<u8>,
    pending_reads: VecDeque<InProgress<Vec<u8>>>,
    pending_readlines: VecDeque<InProgress<Vec<u8>>>,
    chunk_size: usize,
    queue_size: usize,
    delimiter: Delimiter,
    /// 写队列清空后关闭
    queue_close: bool,
    read_registered: bool,
    write_registered: bool,
}

impl State {
    fn write_queue_used(&self) -> usize {
        self.write_queue
            .iter()
            .map(|w| w.data.len() - w.offset)
            .sum()
    }

    fn pop_line(&mut self) -> Option<Vec<u8>> {
        let end = self.delimiter.find(&self.read_queue, 0)?;
        let rest = self.read_queue.split_off(end);
        Some(std::mem::replace(&mut self.read_queue, rest))
    }
}

struct Inner {
    state: RefCell<State>,
    signals: ChannelSignals,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if let (Some(fd), Some(_)) = (st.fd, st.descriptor.as_ref()) {
            crate::tcp::forget_fd(fd);
        }
    }
}

/// 带流量控制的异步字节流通道
#[derive(Clone)]
pub struct IoChannel {
    inner: Rc<Inner>,
}

impl fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fd() {
            Some(fd) => write!(f, "<IoChannel fd={fd}>"),
            None => write!(f, "<IoChannel - disconnected>"),
        }
    }
}

impl IoChannel {
    pub fn new(mode: Mode) -> Self {
        Self::with_config(mode, &ChannelConfig::default())
    }

    pub fn with_config(mode: Mode, config: &ChannelConfig) -> Self {
        let inner = Rc::new(Inner {
            state: RefCell::new(State {
                descriptor: None,
                fd: None,
                mode,
                closed: false,
                write_queue: VecDeque::new(),
                read_queue: Vec::new(),
                pending_reads: VecDeque::new(),
                pending_readlines: VecDeque::new(),
                chunk_size: config.chunk_size,
                queue_size: config.queue_size,
                delimiter: config.delimiter.clone(),
                queue_close: false,
                read_registered: false,
                write_registered: false,
            }),
            signals: ChannelSignals {
                read: Signal::new(),
                readline: Signal::new(),
                closed: Signal::new(),
            },
        });
        for signal in [&inner.signals.read, &inner.signals.readline] {
            let weak = Rc::downgrade(&inner);
            signal.set_changed_callback(move |_| {
                if let Some(inner) = weak.upgrade() {
                    Inner::update_read_monitor(&inner);
                }
            });
        }
        Self { inner }
    }

    /// 包装一个已经打开的描述符
    pub fn from_descriptor(descriptor: impl Descriptor + 'static, mode: Mode) -> io::Result<Self> {
        let channel = Self::new(mode);
        channel.wrap(descriptor, mode)?;
        Ok(channel)
    }

    /// 让通道包装一个新的描述符；已经包装的描述符会先被立即关闭
    pub fn wrap(&self, descriptor: impl Descriptor + 'static, mode: Mode) -> io::Result<()> {
        if self.alive() {
            self.close(true);
        }
        let fd = descriptor.as_raw_fd();
        set_nonblocking(fd)?;
        let has_writes = {
            let mut st = self.inner.state.borrow_mut();
            st.descriptor = Some(Box::new(descriptor));
            st.fd = Some(fd);
            st.mode = mode;
            st.closed = false;
            st.read_registered = false;
            st.write_registered = false;
            !st.write_queue.is_empty()
        };
        tracing::debug!(fd, ?mode, "IoChannel wrapped descriptor");
        Inner::update_read_monitor(&self.inner);
        if has_writes {
            Inner::update_write_monitor(&self.inner);
        }
        Ok(())
    }

    pub fn signals(&self) -> &ChannelSignals {
        &self.inner.signals
    }

    /// 描述符存在并且打开
    pub fn alive(&self) -> bool {
        self.inner.state.borrow().descriptor.is_some()
    }

    /// 通道打开，或者已经关闭但读队列里还有数据
    pub fn readable(&self) -> bool {
        let st = self.inner.state.borrow();
        st.descriptor.is_some() || !st.read_queue.is_empty()
    }

    /// 可以调用`write()`（写队列还没满）
    pub fn writable(&self) -> bool {
        let st = self.inner.state.borrow();
        st.mode.can_write() && !st.closed && st.write_queue_used() < st.queue_size
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.inner.state.borrow().fd
    }

    pub fn mode(&self) -> Mode {
        self.inner.state.borrow().mode
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.state.borrow().chunk_size
    }

    pub fn set_chunk_size(&self, size: usize) {
        self.inner.state.borrow_mut().chunk_size = size.max(1);
    }

    pub fn queue_size(&self) -> usize {
        self.inner.state.borrow().queue_size
    }

    /// 不影响已经在队列里的数据
    pub fn set_queue_size(&self, size: usize) {
        self.inner.state.borrow_mut().queue_size = size;
    }

    pub fn delimiter(&self) -> Delimiter {
        self.inner.state.borrow().delimiter.clone()
    }

    pub fn set_delimiter(&self, delimiter: Delimiter) {
        self.inner.state.borrow_mut().delimiter = delimiter;
    }

    pub fn write_queue_used(&self) -> usize {
        self.inner.state.borrow().write_queue_used()
    }

    pub fn read_queue_used(&self) -> usize {
        self.inner.state.borrow().read_queue.len()
    }

    /// 当前是否在`Reactor`中登记了可读事件
    pub fn is_reading(&self) -> bool {
        self.inner.state.borrow().read_registered
    }

    /// 读一块数据，最多`chunk_size`字节。以空数据结束表示通道已经关闭。
    pub fn read(&self) -> InProgress<Vec<u8>> {
        let ip = {
            let mut st = self.inner.state.borrow_mut();
            if !st.mode.can_read() {
                return InProgress::failed(Error::InvalidMode("cannot read on a write-only channel"));
            }
            if !st.read_queue.is_empty() {
                return InProgress::finished(std::mem::take(&mut st.read_queue));
            }
            if st.descriptor.is_none() {
                return InProgress::finished(Vec::new());
            }
            let ip = InProgress::new();
            st.pending_reads.push_back(ip.clone());
            ip
        };
        self.withdraw_on_abort(&ip, |st, ip| {
            st.pending_reads.retain(|p| !InProgress::ptr_eq(p, ip));
        });
        Inner::update_read_monitor(&self.inner);
        ip
    }

    /// 读一行（包含分隔符）。读队列超过`queue_size`或者通道关闭时，以已缓冲的数据提前结束。
    pub fn readline(&self) -> InProgress<Vec<u8>> {
        if !self.inner.signals.readline.is_empty() {
            return InProgress::failed(Error::InvalidMode(
                "callback currently connected to readline signal",
            ));
        }
        let ip = {
            let mut st = self.inner.state.borrow_mut();
            if !st.mode.can_read() {
                return InProgress::failed(Error::InvalidMode("cannot read on a write-only channel"));
            }
            if let Some(line) = st.pop_line() {
                return InProgress::finished(line);
            }
            if st.descriptor.is_none() {
                return InProgress::finished(std::mem::take(&mut st.read_queue));
            }
            let ip = InProgress::new();
            st.pending_readlines.push_back(ip.clone());
            ip
        };
        self.withdraw_on_abort(&ip, |st, ip| {
            st.pending_readlines.retain(|p| !InProgress::ptr_eq(p, ip));
        });
        Inner::update_read_monitor(&self.inner);
        ip
    }

    fn withdraw_on_abort(&self, ip: &InProgress<Vec<u8>>, remove: fn(&mut State, &InProgress<Vec<u8>>)) {
        let weak = Rc::downgrade(&self.inner);
        let me = ip.clone();
        ip.on_abort(move |_| {
            if let Some(inner) = weak.upgrade() {
                remove(&mut inner.state.borrow_mut(), &me);
                Inner::update_read_monitor(&inner);
            }
        });
    }

    /// 写数据。返回的`InProgress`在这次调用的数据全部写出后以字节数完成。
    pub fn write(&self, data: impl Into<Vec<u8>>) -> InProgress<usize> {
        let data = data.into();
        let ip = {
            let mut st = self.inner.state.borrow_mut();
            if !st.mode.can_write() {
                return InProgress::failed(Error::InvalidMode("cannot write to a read-only channel"));
            }
            if st.closed {
                return InProgress::failed(Error::Closed("channel is closed".into()));
            }
            if st.write_queue_used() + data.len() > st.queue_size {
                return InProgress::failed(Error::QueueFull { limit: st.queue_size });
            }
            if data.is_empty() {
                return InProgress::finished(0);
            }
            let ip = InProgress::new();
            st.write_queue.push_back(PendingWrite {
                data,
                offset: 0,
                ip: ip.clone(),
            });
            ip
        };

        let weak = Rc::downgrade(&self.inner);
        let me = ip.clone();
        ip.on_abort(move |_| {
            if let Some(inner) = weak.upgrade() {
                let mut st = inner.state.borrow_mut();
                // a partially written chunk stays so the stream is not corrupted
                st.write_queue
                    .retain(|w| w.offset > 0 || !InProgress::ptr_eq(&w.ip, &me));
            }
        });
        Inner::update_write_monitor(&self.inner);
        ip
    }

    /// 关闭通道。`immediate`为false并且写队列非空时，等写队列清空后再关闭。
    pub fn close(&self, immediate: bool) {
        Inner::close(&self.inner, immediate, true, None);
    }
}

impl Inner {
    fn wants_read(&self, st: &State) -> bool {
        !st.pending_reads.is_empty()
            || !st.pending_readlines.is_empty()
            || !self.signals.read.is_empty()
            || !self.signals.readline.is_empty()
    }

    /// 根据是否有人关心数据登记或注销可读事件。必须在读完一块之后立刻调用，
    /// 不能推迟到下一轮，否则两次`read()`之间可能漏掉数据。
    fn update_read_monitor(this: &Rc<Self>) {
        let Ok(st) = this.state.try_borrow() else {
            return;
        };
        let Some(fd) = st.fd.filter(|_| st.descriptor.is_some() && st.mode.can_read()) else {
            return;
        };
        let want = this.wants_read(&st);
        if want == st.read_registered {
            return;
        }
        drop(st);
        if !EX.is_set() {
            tracing::warn!(fd, "IoChannel used outside of an event loop");
            return;
        }
        let result = EX.with(|ex| {
            let mut reactor = ex.reactor.borrow_mut();
            if want {
                let weak = Rc::downgrade(this);
                reactor.register(
                    fd,
                    Interest::Read,
                    Rc::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            Inner::handle_read(&inner);
                        }
                    }),
                )
            } else {
                reactor.unregister(fd, Interest::Read)
            }
        });
        match result {
            Ok(()) => this.state.borrow_mut().read_registered = want,
            Err(err) => {
                tracing::error!(fd, "failed to update read monitor: {err}");
                Inner::close(this, true, false, Some(err.into()));
            }
        }
    }

    fn update_write_monitor(this: &Rc<Self>) {
        let (fd, want, registered) = {
            let st = this.state.borrow();
            let Some(fd) = st.fd.filter(|_| st.descriptor.is_some()) else {
                return;
            };
            (fd, !st.write_queue.is_empty(), st.write_registered)
        };
        if want == registered || !EX.is_set() {
            return;
        }
        let result = EX.with(|ex| {
            let mut reactor = ex.reactor.borrow_mut();
            if want {
                let weak = Rc::downgrade(this);
                reactor.register(
                    fd,
                    Interest::Write,
                    Rc::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            Inner::handle_write(&inner);
                        }
                    }),
                )
            } else {
                reactor.unregister(fd, Interest::Write)
            }
        });
        match result {
            Ok(()) => this.state.borrow_mut().write_registered = want,
            Err(err) => {
                tracing::error!(fd, "failed to update write monitor: {err}");
                Inner::close(this, true, false, Some(err.into()));
            }
        }
    }

    fn handle_read(this: &Rc<Self>) {
        let result = {
            let mut st = this.state.borrow_mut();
            let mut buf = vec![0; st.chunk_size];
            let Some(descriptor) = st.descriptor.as_mut() else {
                return;
            };
            descriptor.read(&mut buf).map(|n| {
                buf.truncate(n);
                buf
            })
        };
        let data = match result {
            Ok(data) if data.is_empty() => {
                tracing::debug!("IoChannel peer closed");
                return Inner::close(this, true, false, None);
            }
            Ok(data) => data,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                return;
            }
            Err(err) => {
                tracing::debug!("IoChannel read failed, closing: {err}");
                return Inner::close(this, true, false, Some(err.into()));
            }
        };
        tracing::trace!(len = data.len(), "IoChannel read data");

        let reader = this.state.borrow_mut().pending_reads.pop_front();
        if let Some(reader) = reader {
            let _ = reader.finish(data.clone());
        }
        this.signals.read.emit(&data);

        let (line_subscribers, lines) = {
            let mut st = this.state.borrow_mut();
            let line_subscribers = !this.signals.readline.is_empty();
            if line_subscribers || !st.pending_readlines.is_empty() {
                st.read_queue.extend_from_slice(&data);
            }
            let mut lines = Vec::new();
            if line_subscribers {
                while let Some(line) = st.pop_line() {
                    lines.push((None, line));
                }
            } else {
                while !st.pending_readlines.is_empty() {
                    let line = match st.pop_line() {
                        Some(line) => line,
                        None if st.read_queue.len() > st.queue_size => std::mem::take(&mut st.read_queue),
                        None => break,
                    };
                    let waiter = st.pending_readlines.pop_front();
                    lines.push((waiter, line));
                }
            }
            (line_subscribers, lines)
        };
        for (waiter, line) in lines {
            match waiter {
                Some(waiter) => {
                    let _ = waiter.finish(line);
                }
                None if line_subscribers => {
                    this.signals.readline.emit(&line);
                }
                None => {}
            }
        }

        Inner::update_read_monitor(this);
    }

    fn handle_write(this: &Rc<Self>) {
        let mut finished = Vec::new();
        let mut failure = None;
        {
            let mut st = this.state.borrow_mut();
            let State {
                descriptor,
                write_queue,
                ..
            } = &mut *st;
            let Some(descriptor) = descriptor.as_mut() else {
                return;
            };
            while let Some(front) = write_queue.front_mut() {
                match descriptor.write(&front.data[front.offset..]) {
                    Ok(n) => {
                        front.offset += n;
                        if front.offset < front.data.len() {
                            break;
                        }
                        if let Some(done) = write_queue.pop_front() {
                            finished.push(done);
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }
        for done in finished {
            if done.ip.is_pending() {
                let _ = done.ip.finish(done.data.len());
            }
        }
        if let Some(err) = failure {
            tracing::debug!("IoChannel write failed, closing: {err}");
            return Inner::close(this, true, false, Some(err.into()));
        }

        let (drained, queue_close) = {
            let st = this.state.borrow();
            (st.write_queue.is_empty(), st.queue_close)
        };
        if drained && queue_close {
            return Inner::close(this, true, true, None);
        }
        Inner::update_write_monitor(this);
    }

    /// `error`为`None`表示正常关闭（EOF或者`close()`）
    fn close(this: &Rc<Self>, immediate: bool, expected: bool, error: Option<Error>) {
        let (fd, rest, reads, readlines, writes, descriptor) = {
            let mut st = this.state.borrow_mut();
            if !immediate && !st.write_queue.is_empty() {
                st.queue_close = true;
                return;
            }
            let Some(descriptor) = st.descriptor.take() else {
                return;
            };
            st.closed = true;
            st.queue_close = false;
            st.read_registered = false;
            st.write_registered = false;
            let rest = if error.is_none() {
                std::mem::take(&mut st.read_queue)
            } else {
                Vec::new()
            };
            (
                st.fd,
                rest,
                std::mem::take(&mut st.pending_reads),
                std::mem::take(&mut st.pending_readlines),
                std::mem::take(&mut st.write_queue),
                descriptor,
            )
        };
        tracing::debug!(?fd, immediate, expected, "IoChannel closed");
        if let Some(fd) = fd {
            if EX.is_set() {
                EX.with(|ex| ex.reactor.borrow_mut().remove(fd));
            }
        }
        drop(descriptor);

        let mut rest = Some(rest).filter(|r| !r.is_empty());
        for waiter in readlines.into_iter().chain(reads) {
            if !waiter.is_pending() {
                continue;
            }
            let _ = match &error {
                Some(err) => waiter.fail(err.clone()),
                None => waiter.finish(rest.take().unwrap_or_default()),
            };
        }
        if let Some(rest) = rest {
            if !this.signals.readline.is_empty() {
                this.signals.readline.emit(&rest);
            }
        }
        for write in writes {
            if !write.ip.is_pending() {
                continue;
            }
            let err = error
                .clone()
                .unwrap_or_else(|| Error::Closed("channel closed prematurely".into()));
            let _ = write.ip.fail(err);
        }
        this.signals.closed.emit(&expected);
    }
}
