//! `Reactor`负责与操作系统的I/O多路复用打交道
//!
//! - 对每个fd分别登记"可读"/"可写"的处理函数（相当于`IOMonitor`），
//!   登记的interest决定了向`Poller`注册什么事件。
//! - 维护一组按到期时间排序的定时器。
//! - `wait()`陷入syscall，返回这一轮就绪的处理函数，由`Executor`在释放borrow之后调用。
//!
//! `polling` 2.x 在epoll上使用oneshot模式：一个fd触发一次之后必须重新`modify`才会再次触发，
//! 所以每一轮处理完之后要`rearm()`。

use std::{
    collections::BTreeMap,
    io,
    os::unix::io::RawFd,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use polling::{Event, Poller};
use rustc_hash::FxHashMap;

pub(crate) type Handler = Rc<dyn Fn()>;

/// 关心的事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

#[derive(Default)]
struct Monitor {
    read: Option<Handler>,
    write: Option<Handler>,
    added: bool,
    armed: bool,
}

pub struct Reactor {
    poller: Arc<Poller>,
    monitors: FxHashMap<RawFd, Monitor>,
    timers: BTreeMap<(Instant, u64), Handler>,
    timer_index: FxHashMap<u64, Instant>,
    next_timer: u64,
    buffer: Vec<Event>,
    disarmed: Vec<RawFd>,
}

/// 把fd设置成non-blocking
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(errno_to_io)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(errno_to_io)?;
    Ok(())
}

fn errno_to_io(err: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            monitors: FxHashMap::default(),
            timers: BTreeMap::new(),
            timer_index: FxHashMap::default(),
            next_timer: 1,
            buffer: Vec::with_capacity(256),
            disarmed: Vec::new(),
        })
    }

    /// 可以跨线程用来唤醒`wait()`的句柄
    pub(crate) fn notifier(&self) -> Arc<Poller> {
        self.poller.clone()
    }

    /// 为fd登记某种事件的处理函数；已经登记过的会被替换
    pub fn register(&mut self, fd: RawFd, interest: Interest, handler: Handler) -> io::Result<()> {
        tracing::trace!(fd, ?interest, "[reactor] register");
        let monitor = self.monitors.entry(fd).or_default();
        match interest {
            Interest::Read => monitor.read = Some(handler),
            Interest::Write => monitor.write = Some(handler),
        }
        self.sync(fd)
    }

    pub fn unregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let Some(monitor) = self.monitors.get_mut(&fd) else {
            return Ok(());
        };
        let had = match interest {
            Interest::Read => monitor.read.take().is_some(),
            Interest::Write => monitor.write.take().is_some(),
        };
        if had {
            tracing::trace!(fd, ?interest, "[reactor] unregister");
            self.sync(fd)?;
        }
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd, interest: Interest) -> bool {
        self.monitors.get(&fd).map_or(false, |m| match interest {
            Interest::Read => m.read.is_some(),
            Interest::Write => m.write.is_some(),
        })
    }

    /// 移除fd上的所有登记。必须在关闭fd之前调用。
    pub fn remove(&mut self, fd: RawFd) {
        if let Some(monitor) = self.monitors.remove(&fd) {
            if monitor.added {
                // the descriptor may already be gone
                let _ = self.poller.delete(fd);
            }
        }
    }

    /// 让`Poller`中的interest与登记的处理函数保持一致
    fn sync(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(monitor) = self.monitors.get_mut(&fd) else {
            return Ok(());
        };
        let event = Event {
            key: fd as usize,
            readable: monitor.read.is_some(),
            writable: monitor.write.is_some(),
        };
        if !event.readable && !event.writable {
            let added = monitor.added;
            self.monitors.remove(&fd);
            if added {
                let _ = self.poller.delete(fd);
            }
            return Ok(());
        }
        if monitor.added {
            self.poller.modify(fd, event)?;
        } else {
            self.poller.add(fd, event)?;
            monitor.added = true;
        }
        monitor.armed = true;
        Ok(())
    }

    /// 添加一个在`deadline`触发的定时器，返回定时器id
    pub fn add_timer(&mut self, deadline: Instant, handler: Handler) -> u64 {
        let id = self.next_timer;
        self.next_timer += 1;
        self.timers.insert((deadline, id), handler);
        self.timer_index.insert(id, deadline);
        id
    }

    pub fn cancel_timer(&mut self, id: u64) -> bool {
        match self.timer_index.remove(&id) {
            Some(deadline) => self.timers.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    pub fn has_timer(&self, id: u64) -> bool {
        self.timer_index.contains_key(&id)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    /// 等待至少一个fd就绪、定时器到期、或者被`notify()`唤醒，
    /// 返回这一轮需要调用的处理函数（I/O在前，定时器在后）
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Handler>> {
        let now = Instant::now();
        let timer_timeout = self
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        let timeout = match (timeout, timer_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        self.buffer.clear();
        match self.poller.wait(&mut self.buffer, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let mut fired = Vec::with_capacity(self.buffer.len());
        for event in &self.buffer {
            let fd = event.key as RawFd;
            let Some(monitor) = self.monitors.get_mut(&fd) else {
                continue;
            };
            monitor.armed = false;
            self.disarmed.push(fd);
            if event.readable {
                if let Some(handler) = &monitor.read {
                    fired.push(handler.clone());
                }
            }
            if event.writable {
                if let Some(handler) = &monitor.write {
                    fired.push(handler.clone());
                }
            }
        }

        let now = Instant::now();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), handler) = entry.remove_entry();
            self.timer_index.remove(&id);
            fired.push(handler);
        }
        Ok(fired)
    }

    /// 重新注册上一轮触发过、仍然有interest的fd
    pub fn rearm(&mut self) {
        for fd in std::mem::take(&mut self.disarmed) {
            let needs_rearm = self
                .monitors
                .get(&fd)
                .map_or(false, |m| !m.armed && (m.read.is_some() || m.write.is_some()));
            if needs_rearm {
                if let Err(err) = self.sync(fd) {
                    tracing::warn!(fd, "[reactor] failed to rearm descriptor: {err}");
                    self.monitors.remove(&fd);
                }
            }
        }
    }

    /// 是否还有任何fd或定时器登记着
    pub fn is_idle(&self) -> bool {
        self.monitors.is_empty() && self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, io::Write, os::unix::io::AsRawFd, os::unix::net::UnixStream};

    #[test]
    fn readable_handler_fires_only_when_registered() {
        let mut reactor = Reactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        set_nonblocking(a.as_raw_fd()).unwrap();
        b.write_all(b"x").unwrap();

        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        reactor
            .register(a.as_raw_fd(), Interest::Read, Rc::new(move || h.set(h.get() + 1)))
            .unwrap();
        let fired = reactor.wait(Some(Duration::from_millis(100))).unwrap();
        fired.iter().for_each(|f| f());
        assert_eq!(hits.get(), 1);

        reactor.rearm();
        reactor.unregister(a.as_raw_fd(), Interest::Read).unwrap();
        let fired = reactor.wait(Some(Duration::from_millis(10))).unwrap();
        assert!(fired.is_empty());
        assert!(reactor.is_idle());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let now = Instant::now();
        for (n, ms) in [(2, 4u64), (1, 1)] {
            let order = order.clone();
            reactor.add_timer(
                now + Duration::from_millis(ms),
                Rc::new(move || order.borrow_mut().push(n)),
            );
        }
        let cancelled = reactor.add_timer(now, Rc::new(|| panic!("cancelled timer fired")));
        assert!(reactor.cancel_timer(cancelled));

        while !reactor.is_idle() {
            for f in reactor.wait(None).unwrap() {
                f();
            }
        }
        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
