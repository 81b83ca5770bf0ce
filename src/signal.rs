//! `Signal`: 有序的多播回调列表
//!
//! `InProgress`的三组回调（成功/失败/abort）以及`IoChannel`的`read`/`readline`/`closed`
//! 事件都建立在`Signal`之上。
//!
//! 订阅者不靠弱引用自动断开，而是拿到一个显式的`SignalHandle`，需要时自己`disconnect`；
//! 或者用`subscribe`拿到一个`Subscription`，它被drop的时候自动断开（RAII）。

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use crate::in_progress::InProgress;

type Slot<T> = Rc<RefCell<Box<dyn FnMut(&T)>>>;

/// 某个回调在`Signal`中的标识，用来`disconnect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalHandle(u64);

/// 订阅者数量发生变化时通知`changed`回调
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalChange {
    Connected,
    Disconnected,
}

struct Entry<T> {
    id: u64,
    once: bool,
    callback: Slot<T>,
}

struct Inner<T> {
    entries: Vec<Entry<T>>,
    next_id: u64,
    changed: Option<Rc<dyn Fn(SignalChange)>>,
}

pub struct Signal<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("callbacks", &self.inner.borrow().entries.len())
            .finish()
    }
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                entries: Vec::new(),
                next_id: 1,
                changed: None,
            })),
        }
    }

    /// 设置订阅者数量变化时的回调。`IoChannel`用它来决定是否关心可读事件。
    pub fn set_changed_callback(&self, callback: impl Fn(SignalChange) + 'static) {
        self.inner.borrow_mut().changed = Some(Rc::new(callback));
    }

    fn insert(&self, callback: Box<dyn FnMut(&T)>, once: bool, first: bool) -> SignalHandle {
        let (id, changed) = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_id;
            inner.next_id += 1;
            let entry = Entry {
                id,
                once,
                callback: Rc::new(RefCell::new(callback)),
            };
            if first {
                inner.entries.insert(0, entry);
            } else {
                inner.entries.push(entry);
            }
            (id, inner.changed.clone())
        };
        if let Some(changed) = changed {
            changed(SignalChange::Connected);
        }
        SignalHandle(id)
    }

    /// 添加一个回调，每次`emit`都会被调用
    pub fn connect(&self, callback: impl FnMut(&T) + 'static) -> SignalHandle {
        self.insert(Box::new(callback), false, false)
    }

    /// 添加一个只会被调用一次的回调
    pub fn connect_once(&self, callback: impl FnOnce(&T) + 'static) -> SignalHandle {
        let mut callback = Some(callback);
        self.insert(
            Box::new(move |value: &T| {
                if let Some(callback) = callback.take() {
                    callback(value)
                }
            }),
            true,
            false,
        )
    }

    /// 添加一个回调，排在现有回调的前面
    pub fn connect_first(&self, callback: impl FnMut(&T) + 'static) -> SignalHandle {
        self.insert(Box::new(callback), false, true)
    }

    /// 添加一个回调，返回的`Subscription`被drop时自动断开
    pub fn subscribe(&self, callback: impl FnMut(&T) + 'static) -> Subscription {
        let handle = self.connect(callback);
        let weak: Weak<RefCell<Inner<T>>> = Rc::downgrade(&self.inner);
        Subscription {
            release: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Signal { inner }.disconnect(handle);
                }
            })),
        }
    }

    /// 断开一个回调。回调不存在时返回`false`。
    pub fn disconnect(&self, handle: SignalHandle) -> bool {
        let (removed, changed) = {
            let mut inner = self.inner.borrow_mut();
            let before = inner.entries.len();
            inner.entries.retain(|e| e.id != handle.0);
            (inner.entries.len() != before, inner.changed.clone())
        };
        if removed {
            if let Some(changed) = changed {
                changed(SignalChange::Disconnected);
            }
        }
        removed
    }

    pub fn disconnect_all(&self) {
        let (removed, changed) = {
            let mut inner = self.inner.borrow_mut();
            let removed = !inner.entries.is_empty();
            inner.entries.clear();
            (removed, inner.changed.clone())
        };
        if removed {
            if let Some(changed) = changed {
                changed(SignalChange::Disconnected);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按注册顺序调用所有回调，返回被调用的回调数量。
    ///
    /// 回调在调用时`Signal`本身没有被borrow，所以回调里可以再`connect`/`disconnect`。
    /// 在本次emit中被之前的回调断开的回调不会再被调用。
    pub fn emit(&self, value: &T) -> usize {
        let (snapshot, dropped_once, changed) = {
            let mut inner = self.inner.borrow_mut();
            let snapshot: Vec<(u64, bool, Slot<T>)> = inner
                .entries
                .iter()
                .map(|e| (e.id, e.once, e.callback.clone()))
                .collect();
            let before = inner.entries.len();
            inner.entries.retain(|e| !e.once);
            (snapshot, inner.entries.len() != before, inner.changed.clone())
        };
        if dropped_once {
            if let Some(changed) = changed {
                changed(SignalChange::Disconnected);
            }
        }

        let mut called = 0;
        for (id, once, slot) in snapshot {
            if !once && !self.inner.borrow().entries.iter().any(|e| e.id == id) {
                continue;
            }
            // a callback re-emitting its own signal is not re-entered
            if let Ok(mut callback) = slot.try_borrow_mut() {
                (callback)(value);
                called += 1;
            }
        }
        called
    }
}

impl<T: Clone + 'static> Signal<T> {
    /// 返回一个在下一次`emit`时完成的`InProgress`
    pub fn next(&self) -> InProgress<T> {
        let ip = InProgress::new();
        let finisher = ip.clone();
        let handle = self.connect_once(move |value: &T| {
            if finisher.is_pending() {
                let _ = finisher.finish(value.clone());
            }
        });
        let signal = self.clone();
        ip.on_abort(move |_| {
            signal.disconnect(handle);
        });
        ip
    }
}

/// `Signal::subscribe`返回的订阅凭证，drop时断开对应回调
#[must_use = "dropping a Subscription disconnects the callback"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// 显式断开
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// 保留回调直到`Signal`自身被销毁
    pub fn detach(mut self) {
        self.release = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}
