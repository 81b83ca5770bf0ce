//! Coroutine调度
//!
//! coroutine的body是一个普通的`async`块。在body里：
//! - `.await`一个`InProgress`：`Task`进入`AwaitingFuture`，结果就绪时被唤醒；
//! - `not_finished().await`：`Task`进入`AwaitingTimer`，在`interval`之后继续。
//!
//! 每次调用返回一个代表整个计算的`InProgress`。abort这个`InProgress`会把
//! `Error::Aborted`注入到body当前的挂起点，body清理完后`Task`从登记表中移除。
//!
//! ```ignore
//! let fetch = Coroutine::new().with_policy(Policy::Singleton);
//! let ip = fetch.call(|_ctx| async move {
//!     delay(Duration::from_millis(10)).await?;
//!     Ok(1)
//! });
//! ```

use std::{
    cell::{Cell, RefCell},
    future::Future,
    hash::Hash,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use rustc_hash::FxHashMap;

use crate::{
    error::{Error, Result},
    executor::{self, EX},
    in_progress::InProgress,
    timer::OneShotTimer,
};

/// 同一个coroutine被多次调用时的调度策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    /// 每次调用独立运行
    #[default]
    Unsynchronized,
    /// 同一个key的调用排队，一次只运行一个
    Synchronized,
    /// 上一次调用还没结束时，直接返回同一个`InProgress`
    Singleton,
    /// 每次调用都拿到上一次仍在运行的调用的`InProgress`
    PassLast,
}

/// 传给coroutine body的上下文
pub struct CoroutineContext<T> {
    last: Option<InProgress<T>>,
}

impl<T: 'static> CoroutineContext<T> {
    /// `Policy::PassLast`下，上一次仍在运行的调用
    pub fn last(&self) -> Option<&InProgress<T>> {
        self.last.as_ref()
    }

    pub fn take_last(&mut self) -> Option<InProgress<T>> {
        self.last.take()
    }

    /// 修改`not_finished()`之后的恢复间隔
    pub fn set_interval(&self, interval: Duration) {
        executor::set_current_interval(interval);
    }

    pub fn interval(&self) -> Duration {
        executor::current_interval()
    }
}

struct Shared<T, K> {
    policy: Policy,
    interval: Duration,
    /// 每个key最近一次仍在运行的调用
    last: RefCell<FxHashMap<K, InProgress<T>>>,
    /// `Synchronized`：每个key队尾那次调用的轮次
    turns: RefCell<FxHashMap<K, InProgress<()>>>,
}

/// `Synchronized`下一次调用占用的轮次。
///
/// body结束（或者`Task`被丢弃）时`done`才结束；排队时就被abort的调用
/// 要等前一个轮次结束后才交出自己的轮次，后面的调用因此不会插队。
struct Turn {
    previous: Option<InProgress<()>>,
    done: InProgress<()>,
}

impl Drop for Turn {
    fn drop(&mut self) {
        let done = self.done.clone();
        match self.previous.take().filter(|previous| previous.is_pending()) {
            Some(previous) => {
                previous.on_done(move |_| {
                    let _ = done.finish(());
                });
            }
            None => {
                let _ = done.finish(());
            }
        }
    }
}

/// 一个coroutine定义
pub struct Coroutine<T, K = ()> {
    shared: Rc<Shared<T, K>>,
}

impl<T, K> Clone for Coroutine<T, K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + 'static, K: Eq + Hash + Clone + 'static> Default for Coroutine<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static, K: Eq + Hash + Clone + 'static> Coroutine<T, K> {
    pub fn new() -> Self {
        Self::build(Policy::Unsynchronized, Duration::ZERO)
    }

    fn build(policy: Policy, interval: Duration) -> Self {
        Self {
            shared: Rc::new(Shared {
                policy,
                interval,
                last: RefCell::new(FxHashMap::default()),
                turns: RefCell::new(FxHashMap::default()),
            }),
        }
    }

    pub fn with_policy(self, policy: Policy) -> Self {
        Self::build(policy, self.shared.interval)
    }

    /// `not_finished()`之后恢复执行的间隔，默认0（下一轮事件循环）
    pub fn with_interval(self, interval: Duration) -> Self {
        Self::build(self.shared.policy, interval)
    }

    pub fn policy(&self) -> Policy {
        self.shared.policy
    }

    /// 按`key`调用。`Synchronized`/`Singleton`/`PassLast`都按key分组。
    pub fn call_keyed<F, Fut>(&self, key: K, body: F) -> InProgress<T>
    where
        F: FnOnce(CoroutineContext<T>) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        if !EX.is_set() {
            return InProgress::failed(Error::NoEventLoop);
        }
        let previous = self
            .shared
            .last
            .borrow()
            .get(&key)
            .filter(|ip| ip.is_pending())
            .cloned();

        let ip = match (self.shared.policy, previous) {
            (Policy::Singleton, Some(running)) => return running,
            (Policy::Synchronized, _) => {
                let turn = self.take_turn(&key);
                self.start(async move {
                    let mut turn = turn;
                    if let Some(previous) = turn.previous.clone() {
                        // wait on a private gate so aborting this call leaves the previous turn alone
                        let gate = InProgress::<()>::new();
                        let open = gate.clone();
                        previous.on_done(move |_| {
                            let _ = open.finish(());
                        });
                        gate.await?;
                        turn.previous = None;
                    }
                    body(CoroutineContext { last: None }).await
                })
            }
            (Policy::PassLast, last) => self.start(async move { body(CoroutineContext { last }).await }),
            _ => self.start(async move { body(CoroutineContext { last: None }).await }),
        };

        if self.shared.policy != Policy::Unsynchronized && ip.is_pending() {
            self.shared.last.borrow_mut().insert(key.clone(), ip.clone());
            let shared: Weak<Shared<T, K>> = Rc::downgrade(&self.shared);
            let finished = ip.clone();
            ip.on_done(move |_| {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let mut last = shared.last.borrow_mut();
                if last.get(&key).map_or(false, |ip| InProgress::ptr_eq(ip, &finished)) {
                    last.remove(&key);
                }
            });
        }
        ip
    }

    /// 排到`key`的队尾
    fn take_turn(&self, key: &K) -> Turn {
        let done = InProgress::<()>::new();
        let previous = self
            .shared
            .turns
            .borrow_mut()
            .insert(key.clone(), done.clone())
            .filter(|previous| previous.is_pending());

        let shared: Weak<Shared<T, K>> = Rc::downgrade(&self.shared);
        let key = key.clone();
        let finished = done.clone();
        done.on_done(move |_| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut turns = shared.turns.borrow_mut();
            if turns.get(&key).map_or(false, |turn| InProgress::ptr_eq(turn, &finished)) {
                turns.remove(&key);
            }
        });
        Turn { previous, done }
    }

    /// 启动一个`Task`，body立刻执行到第一个挂起点
    fn start(&self, body: impl Future<Output = Result<T>> + 'static) -> InProgress<T> {
        let owner = InProgress::new();
        let resolve = owner.clone();
        let fut = async move {
            let result = body.await;
            if resolve.is_pending() {
                let _ = match result {
                    Ok(value) => resolve.finish(value),
                    Err(err) if err.is_aborted() => resolve.abort_with(err),
                    Err(err) => resolve.fail(err),
                };
            }
        };
        let task = EX.with(|ex| ex.start_task(fut.boxed_local(), self.shared.interval));
        if owner.is_pending() {
            let task = Rc::downgrade(&task);
            owner.on_abort(move |reason| {
                let Some(task) = task.upgrade() else {
                    return;
                };
                if EX.is_set() {
                    EX.with(|ex| ex.abort_task(&task, reason.clone()));
                }
            });
        }
        owner
    }
}

impl<T: Clone + 'static> Coroutine<T, ()> {
    pub fn call<F, Fut>(&self, body: F) -> InProgress<T>
    where
        F: FnOnce(CoroutineContext<T>) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        self.call_keyed((), body)
    }
}

/// 请求在当前`Task`的`interval`之后继续执行
pub fn not_finished() -> NotFinished {
    NotFinished {
        timer: None,
        fired: Rc::new(Cell::new(false)),
    }
}

pub struct NotFinished {
    timer: Option<OneShotTimer>,
    fired: Rc<Cell<bool>>,
}

impl Future for NotFinished {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(reason) = executor::current_task_abort() {
            return Poll::Ready(Err(reason));
        }
        if self.fired.get() {
            return Poll::Ready(Ok(()));
        }
        if self.timer.is_none() {
            let interval = executor::current_interval();
            let fired = self.fired.clone();
            let waker = cx.waker().clone();
            let timer = OneShotTimer::new(move || {
                fired.set(true);
                waker.wake_by_ref();
            });
            timer.start(interval);
            executor::note_awaiting_timer(interval);
            self.timer = Some(timer);
        }
        Poll::Pending
    }
}

impl Drop for NotFinished {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{executor::Executor, timer::delay};

    #[test]
    fn body_runs_synchronously_until_first_suspension() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let co = Coroutine::<u32>::new();
            let ip = co.call(|_| async { Ok(7) });
            assert_eq!(ip.result().unwrap().unwrap(), 7);

            let started = Rc::new(Cell::new(false));
            let s = started.clone();
            let ip = co.call(move |_| async move {
                s.set(true);
                delay(Duration::from_millis(1)).await?;
                Ok(8)
            });
            assert!(started.get());
            assert!(ip.is_pending());
            assert_eq!(ip.await.unwrap(), 8);
        });
    }

    #[test]
    fn errors_fail_the_owning_future() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let co = Coroutine::<()>::new();
            let ip = co.call(|_| async {
                not_finished().await?;
                Err(Error::msg("broken"))
            });
            assert!(matches!(ip.await, Err(Error::Message(m)) if m == "broken"));
        });
    }

    #[test]
    fn not_finished_resumes_after_interval() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let co = Coroutine::<u32>::new().with_interval(Duration::from_millis(1));
            let ip = co.call(|ctx| async move {
                assert_eq!(ctx.interval(), Duration::from_millis(1));
                let mut steps = 0;
                while steps < 3 {
                    steps += 1;
                    not_finished().await?;
                }
                Ok(steps)
            });
            assert!(ip.is_pending());
            assert_eq!(ip.await.unwrap(), 3);
            EX.with(|ex| assert_eq!(ex.live_tasks(), 0));
        });
    }

    #[test]
    fn singleton_returns_the_same_future() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let co = Coroutine::<u32>::new().with_policy(Policy::Singleton);
            let first = co.call(|_| async {
                delay(Duration::from_millis(2)).await?;
                Ok(1)
            });
            let second = co.call(|_| async { Ok(2) });
            assert!(InProgress::ptr_eq(&first, &second));
            assert_eq!(second.await.unwrap(), 1);

            let third = co.call(|_| async { Ok(3) });
            assert!(!InProgress::ptr_eq(&first, &third));
            assert_eq!(third.result().unwrap().unwrap(), 3);
        });
    }

    #[test]
    fn synchronized_runs_one_at_a_time() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let co = Coroutine::<(), &'static str>::new().with_policy(Policy::Synchronized);
            let log = Rc::new(RefCell::new(Vec::new()));
            let mut calls = Vec::new();
            for n in 0..3 {
                let log = log.clone();
                calls.push(co.call_keyed("k", move |_| async move {
                    log.borrow_mut().push(format!("start{n}"));
                    delay(Duration::from_millis(1)).await?;
                    log.borrow_mut().push(format!("end{n}"));
                    Ok(())
                }));
            }
            let other = co.call_keyed("other", |_| async { Ok(()) });
            assert!(other.is_finished());

            for ip in calls {
                ip.await.unwrap();
            }
            assert_eq!(
                *log.borrow(),
                vec!["start0", "end0", "start1", "end1", "start2", "end2"]
            );
        });
    }

    #[test]
    fn synchronized_queue_survives_an_aborted_waiter() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let co = Coroutine::<()>::new().with_policy(Policy::Synchronized);
            let log = Rc::new(RefCell::new(Vec::new()));
            let mut calls = Vec::new();
            for n in 0..3 {
                let log = log.clone();
                calls.push(co.call(move |_| async move {
                    log.borrow_mut().push(format!("start{n}"));
                    delay(Duration::from_millis(20)).await?;
                    log.borrow_mut().push(format!("end{n}"));
                    Ok(())
                }));
            }
            calls[1].abort().unwrap();
            assert!(calls[1].is_aborted());

            let last = calls.pop().unwrap();
            last.await.unwrap();
            assert!(calls[0].is_finished());
            assert_eq!(*log.borrow(), vec!["start0", "end0", "start2", "end2"]);
        });
    }

    #[test]
    fn pass_last_receives_running_call() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let co = Coroutine::<u32>::new().with_policy(Policy::PassLast);
            let first = co.call(|ctx| async move {
                assert!(ctx.last().is_none());
                delay(Duration::from_millis(2)).await?;
                Ok(10)
            });
            let second = co.call(|mut ctx| async move {
                let previous = ctx.take_last().expect("first call still running");
                Ok(previous.await? + 1)
            });
            assert!(first.is_pending());
            assert_eq!(second.await.unwrap(), 11);
        });
    }

    #[test]
    fn abort_is_raised_at_the_suspension_point() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let cleaned = Rc::new(Cell::new(false));
            let c = cleaned.clone();
            let waiting_on = InProgress::<()>::new();
            let w = waiting_on.clone();
            let co = Coroutine::<()>::new();
            let ip = co.call(move |_| async move {
                let result = w.await;
                c.set(matches!(result, Err(Error::Aborted(_))));
                result
            });
            EX.with(|ex| assert_eq!(ex.live_tasks(), 1));

            ip.abort().unwrap();
            assert!(cleaned.get());
            assert!(ip.is_aborted());
            // the awaited future is aborted too
            assert!(waiting_on.is_aborted());
            EX.with(|ex| assert_eq!(ex.live_tasks(), 0));
        });
    }

    #[test]
    fn dropped_caller_future_keeps_task_alive() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let done = Rc::new(Cell::new(false));
            let d = done.clone();
            let co = Coroutine::<()>::new();
            drop(co.call(move |_| async move {
                delay(Duration::from_millis(1)).await?;
                d.set(true);
                Ok(())
            }));
            delay(Duration::from_millis(10)).await.unwrap();
            assert!(done.get());
        });
    }
}
