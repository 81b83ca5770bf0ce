//! `rpc-ping server <address> [config.toml]`
//! `rpc-ping client <address> [config.toml] [count]`
//!
//! 密钥来自配置文件的`[rpc] secret`，或者环境变量`RPC_SECRET`。

use std::{env, time::Duration, time::Instant};

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mini_rpc_runtime::{
    delay,
    rpc::{Args, Client, Kwargs, Registry, Reply, RpcChannel, Server},
    Config, Executor, InProgress,
};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();
}

fn load_config(path: Option<&String>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Ok(secret) = env::var("RPC_SECRET") {
        config.rpc.secret = secret;
    }
    Ok(config)
}

fn services() -> Registry {
    let mut registry = Registry::new();
    registry
        .expose("ping", |_: &RpcChannel, args: Args, _: Kwargs| json!(args))
        .expose("add", |_: &RpcChannel, args: Args, _: Kwargs| {
            json!(args.iter().filter_map(Value::as_i64).sum::<i64>())
        })
        .expose("sleep", |_: &RpcChannel, args: Args, _: Kwargs| {
            let ms = args.first().and_then(Value::as_u64).unwrap_or(100);
            let reply = InProgress::new();
            let done = reply.clone();
            delay(Duration::from_millis(ms)).on_success(move |_| {
                let _ = done.finish(json!(ms));
            });
            Reply::Pending(reply)
        });
    registry
}

fn serve(address: &str, config: Config) -> anyhow::Result<()> {
    let ex = Executor::try_new()?;
    let server = ex.block_on(|| {
        let address = address.to_string();
        async move {
            let server = Server::with_config(&address, &config)?;
            server.register(&services());
            server.client_connected().connect(|channel: &RpcChannel| {
                tracing::info!(?channel, "client authenticated");
            });
            Ok::<_, mini_rpc_runtime::Error>(server)
        }
    })?;
    tracing::info!(addr = ?server.local_addr(), "serving");
    ex.run()?;
    server.close();
    Ok(())
}

fn ping(address: &str, config: Config, count: usize) -> anyhow::Result<()> {
    let ex = Executor::try_new()?;
    let address = address.to_string();
    ex.block_on(move || async move {
        let client = Client::with_config(&address, &config);
        client
            .connected()
            .timeout(Duration::from_secs(5))
            .await
            .with_context(|| format!("could not connect to {address}"))?;
        for n in 0..count {
            let started = Instant::now();
            let reply = client.call("ping", vec![json!(n)]).await?;
            tracing::info!(seq = n, ?reply, elapsed = ?started.elapsed(), "pong");
        }
        let sum = client.call("add", vec![json!(20), json!(22)]).await?;
        tracing::info!(%sum, "add");
        Ok(())
    })
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args: Vec<String> = env::args().collect();
    let (Some(mode), Some(address)) = (args.get(1), args.get(2)) else {
        bail!("usage: rpc-ping <server|client> <address> [config.toml] [count]");
    };
    let config = load_config(args.get(3))?;
    match mode.as_str() {
        "server" => serve(address, config),
        "client" => {
            let count = match args.get(4) {
                Some(count) => count.parse().context("count must be a number")?,
                None => 3,
            };
            ping(address, config, count)
        }
        other => bail!("unknown mode {other:?}"),
    }
}
