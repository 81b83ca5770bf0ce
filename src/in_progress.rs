//! `InProgress`: 单次赋值的异步结果
//!
//! 一个`InProgress`从`Pending`出发，只能经过`finish`/`fail`/`abort`中的一个到达终态。
//! 回调分三组（成功/失败/abort），按注册顺序触发；在终态之后注册的回调会立刻同步触发。
//!
//! `InProgress`同时实现了`std::future::Future`，coroutine中可以直接`.await`。

use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use crate::{
    error::{Error, Result},
    executor::{self, EX},
    signal::Signal,
    timer::OneShotTimer,
};

/// `InProgress`的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Finished,
    Failed,
    Aborted,
}

enum Outcome<T> {
    Pending,
    Finished(Rc<T>),
    Failed(Error),
    Aborted(Error),
}

struct Inner<T> {
    outcome: Outcome<T>,
    success: Signal<T>,
    error: Signal<Error>,
    abort: Signal<Error>,
    wakers: Vec<Waker>,
    /// 失败结果是否被任何人看到过
    observed: bool,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Outcome::Failed(err) = &self.outcome {
            if !self.observed {
                tracing::warn!("unhandled asynchronous error: {err}");
            }
        }
    }
}

pub struct InProgress<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for InProgress<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for InProgress<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for InProgress<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner.borrow().outcome {
            Outcome::Pending => State::Pending,
            Outcome::Finished(_) => State::Finished,
            Outcome::Failed(_) => State::Failed,
            Outcome::Aborted(_) => State::Aborted,
        };
        f.debug_struct("InProgress")
            .field("at", &Rc::as_ptr(&self.inner))
            .field("state", &state)
            .finish()
    }
}

impl<T: 'static> InProgress<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                outcome: Outcome::Pending,
                success: Signal::new(),
                error: Signal::new(),
                abort: Signal::new(),
                wakers: Vec::new(),
                observed: false,
            })),
        }
    }

    /// 创建一个已经完成的`InProgress`
    pub fn finished(value: T) -> Self {
        let ip = Self::new();
        let _ = ip.finish(value);
        ip
    }

    /// 创建一个已经失败的`InProgress`
    pub fn failed(err: Error) -> Self {
        let ip = Self::new();
        let _ = ip.fail(err);
        ip
    }

    /// 两个句柄是否指向同一个`InProgress`
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn state(&self) -> State {
        match &self.inner.borrow().outcome {
            Outcome::Pending => State::Pending,
            Outcome::Finished(_) => State::Finished,
            Outcome::Failed(_) => State::Failed,
            Outcome::Aborted(_) => State::Aborted,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    pub fn is_finished(&self) -> bool {
        self.state() == State::Finished
    }

    pub fn is_failed(&self) -> bool {
        self.state() == State::Failed
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == State::Aborted
    }

    /// 错误（包括abort原因），还没有结束或成功时返回`None`
    pub fn error(&self) -> Option<Error> {
        let mut inner = self.inner.borrow_mut();
        let err = match &inner.outcome {
            Outcome::Failed(err) | Outcome::Aborted(err) => Some(err.clone()),
            _ => None,
        };
        if err.is_some() {
            inner.observed = true;
        }
        err
    }

    /// 把`InProgress`移出`Pending`，取出需要通知的回调和waker
    #[allow(clippy::type_complexity)]
    fn resolve(
        &self,
        outcome: Outcome<T>,
    ) -> Result<(Signal<T>, Signal<Error>, Signal<Error>, Vec<Waker>)> {
        let mut inner = self.inner.borrow_mut();
        if !matches!(inner.outcome, Outcome::Pending) {
            tracing::error!("{:?} resolved twice", Rc::as_ptr(&self.inner));
            return Err(Error::DoubleResolution);
        }
        inner.outcome = outcome;
        let wakers = std::mem::take(&mut inner.wakers);
        if !wakers.is_empty() || !inner.error.is_empty() {
            inner.observed = true;
        }
        Ok((
            inner.success.clone(),
            inner.error.clone(),
            inner.abort.clone(),
            wakers,
        ))
    }

    /// 成功完成。已经到达终态时返回`Error::DoubleResolution`，状态不变。
    pub fn finish(&self, value: T) -> Result<()> {
        let value = Rc::new(value);
        let (success, error, abort, wakers) = self.resolve(Outcome::Finished(value.clone()))?;
        wakers.into_iter().for_each(Waker::wake);
        success.emit(&value);
        success.disconnect_all();
        error.disconnect_all();
        abort.disconnect_all();
        Ok(())
    }

    /// 以错误结束
    pub fn fail(&self, err: Error) -> Result<()> {
        let (success, error, abort, wakers) = self.resolve(Outcome::Failed(err.clone()))?;
        wakers.into_iter().for_each(Waker::wake);
        error.emit(&err);
        success.disconnect_all();
        error.disconnect_all();
        abort.disconnect_all();
        Ok(())
    }

    /// 中止。先触发abort回调，再以`Error::Aborted`触发失败回调；
    /// 正在等待它的coroutine会在挂起点收到这个错误。
    pub fn abort(&self) -> Result<()> {
        self.abort_with(Error::aborted())
    }

    pub fn abort_with(&self, reason: Error) -> Result<()> {
        let reason = match reason {
            err @ Error::Aborted(_) => err,
            other => Error::Aborted(other.to_string()),
        };
        let (success, error, abort, wakers) = self.resolve(Outcome::Aborted(reason.clone()))?;
        self.inner.borrow_mut().observed = true;
        abort.emit(&reason);
        wakers.into_iter().for_each(Waker::wake);
        error.emit(&reason);
        success.disconnect_all();
        error.disconnect_all();
        abort.disconnect_all();
        Ok(())
    }

    /// 成功回调；已经成功时立刻调用
    pub fn on_success(&self, callback: impl FnOnce(&T) + 'static) -> &Self {
        let (signal, done) = {
            let inner = self.inner.borrow();
            match &inner.outcome {
                Outcome::Pending => (Some(inner.success.clone()), None),
                Outcome::Finished(value) => (None, Some(value.clone())),
                _ => (None, None),
            }
        };
        if let Some(signal) = signal {
            signal.connect_once(callback);
        } else if let Some(value) = done {
            callback(&value);
        }
        self
    }

    /// 失败回调（abort也会触发）；已经失败时立刻调用
    pub fn on_error(&self, callback: impl FnOnce(&Error) + 'static) -> &Self {
        let (signal, done) = {
            let mut inner = self.inner.borrow_mut();
            match &inner.outcome {
                Outcome::Pending => (Some(inner.error.clone()), None),
                Outcome::Failed(err) | Outcome::Aborted(err) => {
                    let err = err.clone();
                    inner.observed = true;
                    (None, Some(err))
                }
                Outcome::Finished(_) => (None, None),
            }
        };
        if let Some(signal) = signal {
            signal.connect_once(callback);
        } else if let Some(err) = done {
            callback(&err);
        }
        self
    }

    /// abort回调；已经被abort时立刻调用
    pub fn on_abort(&self, callback: impl FnOnce(&Error) + 'static) -> &Self {
        let (signal, done) = {
            let inner = self.inner.borrow();
            match &inner.outcome {
                Outcome::Pending => (Some(inner.abort.clone()), None),
                Outcome::Aborted(err) => (None, Some(err.clone())),
                _ => (None, None),
            }
        };
        if let Some(signal) = signal {
            signal.connect_once(callback);
        } else if let Some(err) = done {
            callback(&err);
        }
        self
    }

    /// 无论成功失败都调用一次
    pub fn on_done(&self, callback: impl FnOnce(std::result::Result<&T, &Error>) + 'static) -> &Self {
        let callback = Rc::new(RefCell::new(Some(callback)));
        let on_ok = callback.clone();
        self.on_success(move |value| {
            if let Some(cb) = on_ok.borrow_mut().take() {
                cb(Ok(value));
            }
        });
        self.on_error(move |err| {
            if let Some(cb) = callback.borrow_mut().take() {
                cb(Err(err));
            }
        });
        self
    }

    /// 供调度器使用的、类型擦除的abort句柄
    pub(crate) fn abort_handle(&self) -> AbortHandle {
        let ip = self.clone();
        let pending = self.clone();
        AbortHandle {
            abort: Rc::new(move |reason| ip.abort_with(reason)),
            pending: Rc::new(move || pending.is_pending()),
        }
    }
}

impl<T: Clone + 'static> InProgress<T> {
    /// 结果；还没有结束时返回`None`
    pub fn result(&self) -> Option<Result<T>> {
        let mut inner = self.inner.borrow_mut();
        match &inner.outcome {
            Outcome::Pending => None,
            Outcome::Finished(value) => Some(Ok((**value).clone())),
            Outcome::Failed(err) | Outcome::Aborted(err) => {
                let err = err.clone();
                inner.observed = true;
                Some(Err(err))
            }
        }
    }

    /// 让`self`跟随`other`的结果
    pub fn waitfor(&self, other: &InProgress<T>) -> &Self {
        let ok = self.clone();
        let failed = self.clone();
        other.on_success(move |value| {
            if ok.is_pending() {
                let _ = ok.finish(value.clone());
            }
        });
        other.on_error(move |err| {
            if failed.is_pending() {
                let _ = if err.is_aborted() {
                    failed.abort_with(err.clone())
                } else {
                    failed.fail(err.clone())
                };
            }
        });
        self
    }

    /// 返回一个新的`InProgress`，`self`在`duration`内没有结束则以`Error::Timeout`失败。
    /// `self`本身不受影响。
    pub fn timeout(&self, duration: Duration) -> InProgress<T> {
        let derived = InProgress::new();
        derived.waitfor(self);
        let expired = derived.clone();
        let timer = OneShotTimer::new(move || {
            if expired.is_pending() {
                let _ = expired.fail(Error::Timeout(duration));
            }
        });
        timer.start(duration);
        derived.on_done(move |_| timer.stop());
        derived
    }

    /// 在事件循环线程上阻塞到结束：重新进入事件循环而不是阻塞OS线程
    pub fn wait(&self) -> Result<T> {
        if !EX.is_set() {
            return Err(Error::NoEventLoop);
        }
        let this = self.clone();
        EX.with(|ex| ex.run_until(move || !this.is_pending(), None))?;
        self.result().unwrap_or(Err(Error::NoEventLoop))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        if !EX.is_set() {
            return Err(Error::NoEventLoop);
        }
        let this = self.clone();
        EX.with(|ex| ex.run_until(move || !this.is_pending(), Some(timeout)))?;
        self.result().unwrap_or(Err(Error::Timeout(timeout)))
    }
}

impl<T: Clone + 'static> Future for InProgress<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // an aborted coroutine sees the abort at whatever it is awaiting
        if let Some(reason) = executor::current_task_abort() {
            return Poll::Ready(Err(reason));
        }
        let mut inner = self.inner.borrow_mut();
        match &inner.outcome {
            Outcome::Pending => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                drop(inner);
                executor::note_awaiting_future(self.abort_handle());
                Poll::Pending
            }
            Outcome::Finished(value) => Poll::Ready(Ok((**value).clone())),
            Outcome::Failed(err) | Outcome::Aborted(err) => {
                let err = err.clone();
                inner.observed = true;
                Poll::Ready(Err(err))
            }
        }
    }
}

/// 类型擦除的abort句柄，调度器用它把abort传播给coroutine正在等待的`InProgress`
#[derive(Clone)]
pub(crate) struct AbortHandle {
    abort: Rc<dyn Fn(Error) -> Result<()>>,
    pending: Rc<dyn Fn() -> bool>,
}

impl AbortHandle {
    pub(crate) fn is_pending(&self) -> bool {
        (self.pending)()
    }

    pub(crate) fn abort(&self, reason: Error) -> Result<()> {
        (self.abort)(reason)
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use std::cell::Cell;

    #[test]
    fn only_the_first_resolution_counts() {
        let ip = InProgress::<u32>::new();
        assert!(ip.finish(1).is_ok());
        assert!(matches!(ip.finish(2), Err(Error::DoubleResolution)));
        assert!(matches!(ip.fail(Error::msg("x")), Err(Error::DoubleResolution)));
        assert!(matches!(ip.abort(), Err(Error::DoubleResolution)));
        assert_eq!(ip.state(), State::Finished);
        assert_eq!(ip.result().unwrap().unwrap(), 1);

        let ip = InProgress::<u32>::new();
        ip.fail(Error::msg("first")).unwrap();
        assert!(ip.finish(3).is_err());
        assert!(matches!(ip.result(), Some(Err(Error::Message(m))) if m == "first"));

        let ip = InProgress::<u32>::new();
        ip.abort().unwrap();
        assert!(ip.fail(Error::msg("late")).is_err());
        assert!(ip.is_aborted());
    }

    #[test]
    fn late_subscription_fires_synchronously() {
        let before = Rc::new(Cell::new(0));
        let after = Rc::new(Cell::new(0));

        let ip = InProgress::<u32>::new();
        let b = before.clone();
        ip.on_success(move |v| b.set(*v));
        ip.finish(7).unwrap();
        let a = after.clone();
        ip.on_success(move |v| a.set(*v));

        assert_eq!(before.get(), 7);
        assert_eq!(after.get(), 7);
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let ip = InProgress::<()>::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for n in 0..4 {
            let log = log.clone();
            ip.on_success(move |_| log.borrow_mut().push(n));
        }
        ip.finish(()).unwrap();
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn abort_fires_abort_then_error_callbacks() {
        let ip = InProgress::<()>::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        ip.on_error(move |e| l.borrow_mut().push(format!("error:{}", e.is_aborted())));
        let l = log.clone();
        ip.on_abort(move |_| l.borrow_mut().push("abort".to_string()));
        let l = log.clone();
        ip.on_success(move |_| l.borrow_mut().push("success".to_string()));
        ip.abort().unwrap();
        assert_eq!(*log.borrow(), vec!["abort", "error:true"]);
    }

    #[test]
    fn on_done_sees_either_outcome() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let ok = InProgress::<u8>::new();
        let s = seen.clone();
        ok.on_done(move |r| s.borrow_mut().push(r.is_ok()));
        ok.finish(1).unwrap();
        let bad = InProgress::<u8>::failed(Error::msg("no"));
        let s = seen.clone();
        bad.on_done(move |r| s.borrow_mut().push(r.is_ok()));
        assert_eq!(*seen.borrow(), vec![true, false]);
    }

    #[test]
    fn waitfor_links_outcomes() {
        let source = InProgress::<String>::new();
        let linked = InProgress::<String>::new();
        linked.waitfor(&source);
        source.finish("done".into()).unwrap();
        assert_eq!(linked.result().unwrap().unwrap(), "done");

        let source = InProgress::<String>::new();
        let linked = InProgress::<String>::new();
        linked.waitfor(&source);
        source.abort().unwrap();
        assert!(linked.is_aborted());
    }

    #[test]
    fn wait_outside_loop_is_rejected() {
        let ip = InProgress::<u8>::new();
        assert!(matches!(ip.wait(), Err(Error::NoEventLoop)));
    }

    #[test]
    fn wait_drives_the_loop() {
        let ex = Executor::new();
        let value = ex.block_on(|| async {
            let ip = crate::timer::delay(Duration::from_millis(5));
            ip.wait().map(|_| 5u8)
        });
        assert_eq!(value.unwrap(), 5);
    }

    #[test]
    fn timeout_fails_derived_future_only() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let slow = InProgress::<u8>::new();
            let limited = slow.timeout(Duration::from_millis(5));
            let result = limited.await;
            assert!(matches!(result, Err(Error::Timeout(_))));
            assert!(slow.is_pending());
            slow.finish(1).unwrap();
        });
    }

    #[test]
    fn awaiting_a_finished_future_is_immediate() {
        let ex = Executor::new();
        let v = ex.block_on(|| async { InProgress::finished(42u32).await });
        assert_eq!(v.unwrap(), 42);
    }
}
