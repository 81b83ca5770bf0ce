use crate::{
    error::{Error, Result},
    in_progress::AbortHandle,
    reactor::Reactor,
    thread::{Bridge, LoopHandle},
};
use futures::{future::LocalBoxFuture, Future, FutureExt};
use rustc_hash::FxHashMap;
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    marker::PhantomData,
    mem,
    rc::Rc,
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
    time::{Duration, Instant},
};
scoped_tls::scoped_thread_local!(pub(crate) static EX: Executor);

/// `Task`在调度器中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    /// 请求在`interval`之后继续（`not_finished().await`）
    AwaitingTimer(Duration),
    /// 挂起在某个`InProgress`上
    AwaitingFuture,
    Done,
}

/// `Executor`负责`Task`的调度和执行，同时驱动`Reactor`和跨线程队列
pub struct Executor {
    /// 等待调度的`Task`队列
    local_queue: TaskQueue,
    /// 被唤醒时正在更外层被poll的`Task`（它自己调用了`wait()`），外层poll返回后再调度
    parked: RefCell<Vec<Rc<Task>>>,
    pub(crate) reactor: Rc<RefCell<Reactor>>,
    /// 所有还没有结束的`Task`。调用方丢掉了`InProgress`也不会让挂起的`Task`被回收。
    tasks: RefCell<FxHashMap<u64, Rc<Task>>>,
    /// 正在被poll的`Task`
    current: RefCell<Option<Rc<Task>>>,
    next_task_id: Cell<u64>,
    bridge: Bridge,
    stopped: Cell<bool>,

    /// Make sure the type is `!Send` and `!Sync`.
    _marker: PhantomData<Rc<()>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// 创建一个新的`Executor`
    ///
    /// 创建`Poller`失败（fd耗尽）时panic，需要处理这种情况请用`try_new`。
    pub fn new() -> Self {
        Self::try_new().unwrap_or_else(|err| panic!("failed to create poller: {err}"))
    }

    pub fn try_new() -> Result<Self> {
        let reactor = Reactor::new()?;
        let bridge = Bridge::new(reactor.notifier());
        Ok(Self {
            local_queue: TaskQueue::default(),
            parked: RefCell::new(Vec::new()),
            reactor: Rc::new(RefCell::new(reactor)),
            tasks: RefCell::new(FxHashMap::default()),
            current: RefCell::new(None),
            next_task_id: Cell::new(1),
            bridge,
            stopped: Cell::new(false),

            _marker: PhantomData,
        })
    }

    /// 一个`async fn`可以认为是一个`Future`
    /// `spawn`将`Future`作为一个`Task`启动：立刻执行到第一个挂起点，之后由调度器唤醒。
    pub fn spawn(fut: impl Future<Output = ()> + 'static) {
        EX.with(|ex| {
            ex.start_task(fut.boxed_local(), Duration::ZERO);
        });
    }

    /// 跨线程句柄，其他线程通过它把回调投递到事件循环线程
    pub fn handle(&self) -> LoopHandle {
        self.bridge.handle()
    }

    pub(crate) fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// 当前登记中的`Task`数量
    pub fn live_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// (in loop)poll 传入的 future，检查是否 ready，如果 ready 就返回，结束 block_on。
    /// (in loop)循环处理 TaskQueue 中的所有 Task 以及其他线程投递过来的回调。
    /// (in loop)这时已经没有待执行的任务了，可能主 future 已经 ready 了，也可能都在等待 IO。所以再次检查主 future，如果 ready 就返回。
    /// (in loop)既然所有人都在等待 IO，那就 reactor.wait()。这时 reactor 会陷入 syscall 等待至少一个 IO 可执行或者定时器到期，然后调用对应的处理函数。
    pub fn block_on<F, T, O>(&self, f: F) -> O
    where
        F: FnOnce() -> T,
        T: Future<Output = O> + 'static,
    {
        let _waker = waker_fn::waker_fn(|| {});
        let cx = &mut Context::from_waker(&_waker);

        EX.set(self, || {
            let fut = f();
            pin_utils::pin_mut!(fut);
            loop {
                // return if the outer future is ready
                if let Poll::Ready(t) = fut.as_mut().poll(cx) {
                    break t;
                }

                // consume all tasks
                while self.run_ready() {}

                // no task to execute now, it may ready
                if let Poll::Ready(t) = fut.as_mut().poll(cx) {
                    break t;
                }
                if self.has_ready_work() {
                    continue;
                }

                // block for io
                if let Err(err) = self.poll_reactor(None) {
                    tracing::error!("reactor wait failed: {err}");
                }
            }
        })
    }

    /// 运行事件循环直到`stop()`被调用
    pub fn run(&self) -> Result<()> {
        self.stopped.set(false);
        EX.set(self, || self.run_until(|| true, None))
    }

    /// 运行事件循环直到`condition`返回false、超时、或者`stop()`被调用
    pub(crate) fn run_until(
        &self,
        mut condition: impl FnMut() -> bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        while condition() && !self.stopped.get() {
            if self.run_ready() {
                continue;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.poll_reactor(wait)?;
        }
        Ok(())
    }

    /// 执行一轮就绪的工作，返回是否做了任何事情
    fn run_ready(&self) -> bool {
        let mut did_work = self.bridge.drain();
        self.unpark();
        while let Some(t) = self.local_queue.pop() {
            if t.future.try_borrow_mut().is_err() {
                // being polled further up the stack; stays queued until that poll returns
                self.parked.borrow_mut().push(t);
                continue;
            }
            t.queued.set(false);
            t.poll(self);
            did_work = true;
        }
        did_work
    }

    /// 外层poll已经返回的`Task`放回队列
    fn unpark(&self) {
        let mut parked = self.parked.borrow_mut();
        let mut i = 0;
        while i < parked.len() {
            if parked[i].future.try_borrow_mut().is_ok() {
                self.local_queue.push(parked.swap_remove(i));
            } else {
                i += 1;
            }
        }
    }

    /// parked的`Task`在外层poll返回前不算就绪，否则嵌套的`wait()`会空转
    fn has_ready_work(&self) -> bool {
        !self.local_queue.is_empty()
            || !self.bridge.is_empty()
            || self
                .parked
                .borrow()
                .iter()
                .any(|t| t.future.try_borrow_mut().is_ok())
    }

    /// 等待I/O或定时器，并调用就绪的处理函数
    fn poll_reactor(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = if self.has_ready_work() {
            Some(Duration::ZERO)
        } else {
            timeout
        };
        let fired = self.reactor.borrow_mut().wait(timeout)?;
        for handler in fired {
            handler();
        }
        self.reactor.borrow_mut().rearm();
        Ok(())
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        let id = self.next_task_id.get();
        self.next_task_id.set(id + 1);
        id
    }

    /// 登记并立刻执行`Task`直到第一个挂起点
    pub(crate) fn start_task(&self, fut: LocalBoxFuture<'static, ()>, interval: Duration) -> Rc<Task> {
        let task = Rc::new(Task {
            id: self.next_task_id(),
            future: RefCell::new(Some(fut)),
            state: Cell::new(TaskState::Runnable),
            waiting: RefCell::new(None),
            abort: RefCell::new(None),
            interval: Cell::new(interval),
            queued: Cell::new(false),
        });
        self.tasks.borrow_mut().insert(task.id, task.clone());
        task.poll(self);
        task
    }

    /// 把abort注入`Task`：它正在等待的`InProgress`也被abort，
    /// 然后立刻恢复执行，让它在挂起点收到`Error::Aborted`并完成清理
    pub(crate) fn abort_task(&self, task: &Rc<Task>, reason: Error) {
        if task.state.get() == TaskState::Done {
            return;
        }
        *task.abort.borrow_mut() = Some(reason.clone());
        let waiting = task.waiting.borrow_mut().take();
        if let Some(waiting) = waiting {
            if waiting.is_pending() {
                if let Err(err) = waiting.abort(reason) {
                    tracing::debug!(task = task.id, "awaited InProgress could not be aborted: {err}");
                }
            }
        }
        task.poll(self);
    }

    fn retire(&self, task: &Task) {
        task.state.set(TaskState::Done);
        task.waiting.borrow_mut().take();
        self.tasks.borrow_mut().remove(&task.id);
    }

    /// 让`run()`返回
    pub fn stop(&self) {
        self.stopped.set(true);
        self.bridge.wake();
    }
}

/// 在事件循环线程中请求`run()`退出
pub fn stop() {
    if EX.is_set() {
        EX.with(|ex| ex.stop());
    }
}

/// 当前正在执行的`Task`如果已被abort，返回abort原因
pub(crate) fn current_task_abort() -> Option<Error> {
    if !EX.is_set() {
        return None;
    }
    EX.with(|ex| {
        ex.current
            .borrow()
            .as_ref()
            .and_then(|t| t.abort.borrow().clone())
    })
}

/// 记录当前`Task`挂起在一个`InProgress`上
pub(crate) fn note_awaiting_future(handle: AbortHandle) {
    if !EX.is_set() {
        return;
    }
    EX.with(|ex| {
        if let Some(t) = ex.current.borrow().as_ref() {
            t.state.set(TaskState::AwaitingFuture);
            *t.waiting.borrow_mut() = Some(handle);
        }
    });
}

/// 当前`Task`的恢复间隔；不在`Task`中时为0
pub(crate) fn current_interval() -> Duration {
    if !EX.is_set() {
        return Duration::ZERO;
    }
    EX.with(|ex| {
        ex.current
            .borrow()
            .as_ref()
            .map_or(Duration::ZERO, |t| t.interval.get())
    })
}

pub(crate) fn set_current_interval(interval: Duration) {
    if !EX.is_set() {
        return;
    }
    EX.with(|ex| {
        if let Some(t) = ex.current.borrow().as_ref() {
            t.set_interval(interval);
        }
    });
}

/// 记录当前`Task`在等待定时器
pub(crate) fn note_awaiting_timer(interval: Duration) {
    if !EX.is_set() {
        return;
    }
    EX.with(|ex| {
        if let Some(t) = ex.current.borrow().as_ref() {
            t.state.set(TaskState::AwaitingTimer(interval));
        }
    });
}

/// 存储`Task`的队列
pub struct TaskQueue {
    queue: RefCell<VecDeque<Rc<Task>>>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// 创建一个新的`TaskQueue`
    pub fn new() -> Self {
        const DEFAULT_TASK_QUEUE_SIZE: usize = 4096;
        Self::new_with_capacity(DEFAULT_TASK_QUEUE_SIZE)
    }

    /// 创建一个新的`TaskQueue`
    pub fn new_with_capacity(capacity: usize) -> Self {
        Self {
            queue: RefCell::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// 添加一个`Task`
    pub(crate) fn push(&self, runnable: Rc<Task>) {
        tracing::trace!(task = runnable.id, "add task");
        self.queue.borrow_mut().push_back(runnable);
    }

    /// 删除第一个`Task`
    pub(crate) fn pop(&self) -> Option<Rc<Task>> {
        self.queue.borrow_mut().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

/// `Task`是对一个coroutine body的封装，外加它的恢复点信息
pub struct Task {
    id: u64,
    future: RefCell<Option<LocalBoxFuture<'static, ()>>>,
    state: Cell<TaskState>,
    /// 正在等待的`InProgress`
    waiting: RefCell<Option<AbortHandle>>,
    /// 被abort时的原因
    abort: RefCell<Option<Error>>,
    interval: Cell<Duration>,
    queued: Cell<bool>,
}

impl Task {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn interval(&self) -> Duration {
        self.interval.get()
    }

    pub(crate) fn set_interval(&self, interval: Duration) {
        self.interval.set(interval);
    }

    /// poll一次。已经结束或者正在被poll的`Task`什么也不做。
    fn poll(self: &Rc<Self>, ex: &Executor) {
        let Ok(mut slot) = self.future.try_borrow_mut() else {
            return;
        };
        let Some(fut) = slot.as_mut() else {
            return;
        };

        let prev = ex.current.replace(Some(self.clone()));
        self.state.set(TaskState::Runnable);
        self.waiting.borrow_mut().take();
        let w = waker(self.clone());
        let mut context = Context::from_waker(&w);
        let res = fut.as_mut().poll(&mut context);
        *ex.current.borrow_mut() = prev;

        match res {
            Poll::Ready(()) => {
                *slot = None;
                drop(slot);
                ex.retire(self);
            }
            Poll::Pending if self.abort.borrow().is_some() => {
                tracing::warn!(task = self.id, "coroutine ignored abort; dropping it");
                *slot = None;
                drop(slot);
                ex.retire(self);
            }
            Poll::Pending => {}
        }
    }
}

/// 创建一个和`Task`关联的`Waker`, 当`Task`准备好执行的时候, 调用`Waker`提供的`wake`和`wake_by_ref`方法
fn waker(wake: Rc<Task>) -> Waker {
    let ptr = Rc::into_raw(wake) as *const ();
    let vtable = &Helper::VTABLE;
    unsafe { Waker::from_raw(RawWaker::new(ptr, vtable)) }
}

impl Task {
    /// 唤醒`Task`, 添加到调度队列中等待调度
    fn wake_(self: Rc<Self>) {
        Self::wake_by_ref_(&self)
    }

    /// 唤醒`Task`, 添加到调度队列中等待调度
    fn wake_by_ref_(self: &Rc<Self>) {
        if self.queued.get() || self.state.get() == TaskState::Done || !EX.is_set() {
            return;
        }
        self.queued.set(true);
        EX.with(|ex| ex.local_queue.push(self.clone()));
    }
}

struct Helper;

impl Helper {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::clone_waker,
        Self::wake,
        Self::wake_by_ref,
        Self::drop_waker,
    );

    unsafe fn clone_waker(data: *const ()) -> RawWaker {
        increase_refcount(data);
        let vtable = &Self::VTABLE;
        RawWaker::new(data, vtable)
    }

    unsafe fn wake(ptr: *const ()) {
        let rc = Rc::from_raw(ptr as *const Task);
        rc.wake_();
    }

    unsafe fn wake_by_ref(ptr: *const ()) {
        let rc = mem::ManuallyDrop::new(Rc::from_raw(ptr as *const Task));
        rc.wake_by_ref_();
    }

    unsafe fn drop_waker(ptr: *const ()) {
        drop(Rc::from_raw(ptr as *const Task));
    }
}

#[allow(clippy::redundant_clone)] // The clone here isn't actually redundant.
unsafe fn increase_refcount(data: *const ()) {
    // Retain Rc, but don't touch refcount by wrapping in ManuallyDrop
    let rc = mem::ManuallyDrop::new(Rc::<Task>::from_raw(data as *const Task));
    // Now increase refcount, but don't drop new refcount either
    let _rc_clone: mem::ManuallyDrop<_> = rc.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{in_progress::InProgress, timer::delay};

    #[test]
    fn spawned_task_runs_to_first_suspension_synchronously() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let log = Rc::new(RefCell::new(Vec::new()));
            let gate = InProgress::<()>::new();
            let l = log.clone();
            let g = gate.clone();
            Executor::spawn(async move {
                l.borrow_mut().push("start");
                let _ = g.await;
                l.borrow_mut().push("resumed");
            });
            assert_eq!(*log.borrow(), vec!["start"]);
            EX.with(|ex| assert_eq!(ex.live_tasks(), 1));

            gate.finish(()).unwrap();
            delay(Duration::from_millis(1)).await.unwrap();
            assert_eq!(*log.borrow(), vec!["start", "resumed"]);
            EX.with(|ex| assert_eq!(ex.live_tasks(), 0));
        });
    }

    #[test]
    fn nested_wait_blocks_while_the_waiting_task_is_woken() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let busy = Rc::new(Cell::new(None));
            let b = busy.clone();
            Executor::spawn(async move {
                // woken while still being polled, then blocks in a nested loop
                futures::future::poll_fn(|cx| {
                    cx.waker().wake_by_ref();
                    Poll::Ready(())
                })
                .await;
                let seen = b.clone();
                delay(Duration::from_millis(5)).on_success(move |_| {
                    seen.set(Some(EX.with(|ex| ex.has_ready_work())));
                });
                delay(Duration::from_millis(10)).wait().unwrap();
            });
            delay(Duration::from_millis(20)).await.unwrap();
            assert_eq!(busy.get(), Some(false));
            EX.with(|ex| assert_eq!(ex.live_tasks(), 0));
        });
    }

    #[test]
    fn run_returns_after_stop() {
        let ex = Executor::new();
        EX.set(&ex, || {
            Executor::spawn(async {
                delay(Duration::from_millis(2)).await.unwrap();
                stop();
            })
        });
        ex.run().unwrap();
        assert_eq!(ex.live_tasks(), 0);
    }
}
