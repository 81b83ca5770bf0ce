//! 定时器
//!
//! 定时器活跃期间，`Reactor`里的处理函数持有它的强引用，所以丢掉`Timer`句柄并不会停止它。

use std::{
    cell::Cell,
    fmt,
    rc::Rc,
    time::{Duration, Instant},
};

use crate::{executor::EX, in_progress::InProgress};

struct TimerInner {
    callback: Box<dyn Fn() -> bool>,
    /// 在`Reactor`中登记的定时器id
    active: Cell<Option<u64>>,
    interval: Cell<Duration>,
    repeat: bool,
}

impl TimerInner {
    fn schedule(self: &Rc<Self>, interval: Duration) {
        if !EX.is_set() {
            tracing::error!("timer started outside of an event loop");
            return;
        }
        let this = self.clone();
        let id = EX.with(|ex| {
            ex.reactor.borrow_mut().add_timer(
                Instant::now() + interval,
                Rc::new(move || this.fire()),
            )
        });
        self.active.set(Some(id));
    }

    fn fire(self: &Rc<Self>) {
        self.active.set(None);
        let again = (self.callback)();
        // the callback may have restarted or stopped the timer itself
        if again && self.repeat && self.active.get().is_none() {
            self.schedule(self.interval.get());
        }
    }

    fn cancel(&self) {
        if let Some(id) = self.active.take() {
            if EX.is_set() {
                EX.with(|ex| ex.reactor.borrow_mut().cancel_timer(id));
            }
        }
    }
}

/// 重复触发的定时器。回调返回`false`时停止。
#[derive(Clone)]
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    pub fn new(callback: impl Fn() -> bool + 'static) -> Self {
        Self::build(Box::new(callback), true)
    }

    fn build(callback: Box<dyn Fn() -> bool>, repeat: bool) -> Self {
        Self {
            inner: Rc::new(TimerInner {
                callback,
                active: Cell::new(None),
                interval: Cell::new(Duration::ZERO),
                repeat,
            }),
        }
    }

    /// 启动定时器；已经启动的会按新的间隔重新开始
    pub fn start(&self, interval: Duration) {
        self.inner.cancel();
        self.inner.interval.set(interval);
        self.inner.schedule(interval);
    }

    pub fn stop(&self) {
        self.inner.cancel();
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.get().is_some()
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval.get()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("interval", &self.interval())
            .field("active", &self.is_active())
            .field("repeat", &self.inner.repeat)
            .finish()
    }
}

/// 只触发一次的定时器
#[derive(Clone, Debug)]
pub struct OneShotTimer(Timer);

impl OneShotTimer {
    pub fn new(callback: impl Fn() + 'static) -> Self {
        Self(Timer::build(
            Box::new(move || {
                callback();
                false
            }),
            false,
        ))
    }

    pub fn start(&self, interval: Duration) {
        self.0.start(interval)
    }

    pub fn stop(&self) {
        self.0.stop()
    }

    pub fn is_active(&self) -> bool {
        self.0.is_active()
    }

    pub fn interval(&self) -> Duration {
        self.0.interval()
    }
}

/// 返回一个在`duration`之后完成的`InProgress`；abort它会停止定时器
pub fn delay(duration: Duration) -> InProgress<()> {
    let ip = InProgress::new();
    let done = ip.clone();
    let timer = OneShotTimer::new(move || {
        if done.is_pending() {
            let _ = done.finish(());
        }
    });
    timer.start(duration);
    ip.on_abort(move |_| timer.stop());
    ip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use std::cell::RefCell;

    #[test]
    fn repeating_timer_stops_when_callback_returns_false() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let ticks = Rc::new(Cell::new(0));
            let t = ticks.clone();
            let timer = Timer::new(move || {
                t.set(t.get() + 1);
                t.get() < 3
            });
            timer.start(Duration::from_millis(1));
            assert!(timer.is_active());
            delay(Duration::from_millis(40)).await.unwrap();
            assert_eq!(ticks.get(), 3);
            assert!(!timer.is_active());
        });
    }

    #[test]
    fn stopped_timer_never_fires() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let fired = Rc::new(Cell::new(false));
            let f = fired.clone();
            let timer = OneShotTimer::new(move || f.set(true));
            timer.start(Duration::from_millis(2));
            timer.stop();
            delay(Duration::from_millis(10)).await.unwrap();
            assert!(!fired.get());
        });
    }

    #[test]
    fn delays_finish_in_deadline_order() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let order = Rc::new(RefCell::new(Vec::new()));
            let slow = delay(Duration::from_millis(6));
            let fast = delay(Duration::from_millis(1));
            for (name, ip) in [("slow", &slow), ("fast", &fast)] {
                let order = order.clone();
                ip.on_success(move |_| order.borrow_mut().push(name));
            }
            slow.clone().await.unwrap();
            assert_eq!(*order.borrow(), vec!["fast", "slow"]);
        });
    }

    #[test]
    fn aborting_a_delay_cancels_its_timer() {
        let ex = Executor::new();
        ex.block_on(|| async {
            let ip = delay(Duration::from_secs(60));
            ip.abort().unwrap();
            EX.with(|ex| assert!(ex.reactor.borrow().is_idle()));
        });
    }
}
