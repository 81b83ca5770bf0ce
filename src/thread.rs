//! 跨线程桥
//!
//! 事件循环里的所有状态都只能在事件循环线程上修改。其他线程通过`LoopHandle`
//! 把回调投递到一个线程安全的队列，再用`Poller::notify`唤醒正在`wait()`的事件循环，
//! 回调在事件循环线程的下一轮被执行。

use std::{
    any::Any,
    cell::{Cell, RefCell},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crossbeam_channel::{Receiver, Sender};
use polling::Poller;
use rustc_hash::FxHashMap;

use crate::{
    error::{Error, Result},
    executor::EX,
    in_progress::InProgress,
};

enum Message {
    Call(Box<dyn FnOnce() + Send>),
    /// 工作线程的结果，交给事件循环线程上登记的完成回调
    Complete(u64, Box<dyn Any + Send>),
}

type Completion = Box<dyn FnOnce(Box<dyn Any + Send>)>;

/// 事件循环一侧的队列
pub(crate) struct Bridge {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    poller: Arc<Poller>,
    completions: RefCell<FxHashMap<u64, Completion>>,
    next_completion: Cell<u64>,
}

impl Bridge {
    pub(crate) fn new(poller: Arc<Poller>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            poller,
            completions: RefCell::new(FxHashMap::default()),
            next_completion: Cell::new(1),
        }
    }

    pub(crate) fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.tx.clone(),
            poller: self.poller.clone(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub(crate) fn wake(&self) {
        if let Err(err) = self.poller.notify() {
            tracing::warn!("failed to wake event loop: {err}");
        }
    }

    fn expect_completion(&self, completion: Completion) -> u64 {
        let id = self.next_completion.get();
        self.next_completion.set(id + 1);
        self.completions.borrow_mut().insert(id, completion);
        id
    }

    /// 执行所有排队的回调，返回是否执行了任何回调
    pub(crate) fn drain(&self) -> bool {
        let mut did_work = false;
        while let Ok(message) = self.rx.try_recv() {
            did_work = true;
            match message {
                Message::Call(callback) => callback(),
                Message::Complete(id, value) => {
                    let completion = self.completions.borrow_mut().remove(&id);
                    match completion {
                        Some(completion) => completion(value),
                        None => tracing::warn!(id, "thread result without a waiting InProgress"),
                    }
                }
            }
        }
        did_work
    }
}

/// 可以跨线程传递的事件循环句柄
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<Message>,
    poller: Arc<Poller>,
}

impl LoopHandle {
    /// 在事件循环线程上执行`callback`
    pub fn call(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        self.send(Message::Call(Box::new(callback)))
    }

    fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::NoEventLoop)?;
        self.poller.notify()?;
        Ok(())
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("queued", &self.tx.len())
            .finish()
    }
}

/// 当前线程是否正在运行事件循环
pub fn is_loop_thread() -> bool {
    EX.is_set()
}

/// 在新线程上运行`f`，结果在事件循环线程上交给返回的`InProgress`
pub fn threaded<T, F>(f: F) -> InProgress<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    if !EX.is_set() {
        return InProgress::failed(Error::NoEventLoop);
    }
    let ip = InProgress::new();
    let done = ip.clone();
    let (id, handle) = EX.with(|ex| {
        let id = ex.bridge().expect_completion(Box::new(move |value| {
            let result = match value.downcast::<Result<T>>() {
                Ok(result) => *result,
                Err(_) => Err(Error::msg("thread produced a value of the wrong type")),
            };
            if done.is_pending() {
                let _ = match result {
                    Ok(value) => done.finish(value),
                    Err(err) => done.fail(err),
                };
            }
        }));
        (id, ex.handle())
    });

    let spawned = std::thread::Builder::new()
        .name("rpc-runtime-worker".into())
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|_| Err(Error::msg("thread panicked")));
            if handle.send(Message::Complete(id, Box::new(result))).is_err() {
                tracing::debug!("event loop went away before thread finished");
            }
        });
    if let Err(err) = spawned {
        EX.with(|ex| ex.bridge().completions.borrow_mut().remove(&id));
        let _ = ip.fail(err.into());
    }
    ip
}
