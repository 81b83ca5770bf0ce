//! 单线程异步运行时 + 带认证的RPC
//!
//! 和操作系统的调度器类比：
//! - Scheduler调度`Process` <=> 这里的`Executor`调度`Task`（coroutine）
//! - `Process`等待中断唤醒 <=> `Task`等待`InProgress`结束或者定时器到期
//! - 中断来自硬件 <=> 唤醒来自`Reactor`封装的`epoll`/`kqueue`（`polling` crate）
//!
//! 自底向上的模块：
//! - [`signal`]：有序的多播回调列表
//! - [`in_progress`]：单次赋值的异步结果`InProgress<T>`，同时是一个`Future`
//! - [`executor`] / [`coroutine`] / [`timer`]：事件循环、coroutine调度策略、定时器
//! - [`thread`]：其他线程把回调投递到事件循环线程的唯一途径
//! - [`io`] / [`tcp`]：带背压的字节流通道以及TCP / Unix socket
//! - [`rpc`]：定长包头分帧、challenge-response双向认证、按seq复用的调用
//!
//! ```ignore
//! let ex = Executor::new();
//! ex.block_on(|| async {
//!     let server = Server::bind("127.0.0.1:7000", "secret")?;
//!     server.expose("add", |_: &RpcChannel, args: Args, _| {
//!         json!(args.iter().filter_map(Value::as_i64).sum::<i64>())
//!     });
//!     let client = Client::connect("127.0.0.1:7000", "secret");
//!     client.connected().await?;
//!     let sum = client.call("add", vec![json!(1), json!(2)]).await?;
//!     Ok::<_, Error>(sum)
//! });
//! ```

pub mod config;
pub mod coroutine;
pub mod error;
pub mod executor;
pub mod in_progress;
pub mod io;
pub mod rpc;
pub mod signal;
pub mod tcp;
pub mod thread;
pub mod timer;

mod reactor;

pub use config::Config;
pub use coroutine::{not_finished, Coroutine, CoroutineContext, Policy};
pub use error::{Error, Result};
pub use executor::{Executor, TaskState};
pub use in_progress::{InProgress, State};
pub use io::{IoChannel, Mode};
pub use signal::{Signal, SignalHandle, Subscription};
pub use tcp::{Address, Socket};
pub use thread::{threaded, LoopHandle};
pub use timer::{delay, OneShotTimer, Timer};
