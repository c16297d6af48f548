//! Supervisor: parse options, seed the pool registry, start the thread
//! roster (work I/O actor, long-poll, stratum, workers) and wait for a
//! signal or for the work I/O actor to die.

mod algo;
mod config;
mod ctx;
mod getwork;
mod hashlog;
mod kernels;
mod longpoll;
mod miner;
mod pools;
mod state;
mod stats;
mod stratum;
mod work;
mod workio;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use log::{debug, error, info};
use tokio::sync::mpsc;

use algo::Algorithm;
use config::ConfigFile;
use ctx::Ctx;
use pools::parse_url;
use state::{Options, SharedState, EXIT_USAGE};

#[derive(Parser, Debug)]
#[command(
    name = "multiminer",
    version,
    about = "Multi-algorithm proof-of-work miner for GPU scan kernels"
)]
struct Cli {
    /// Hash algorithm to use (x11, keccak, heavy, ...)
    #[arg(short, long)]
    algo: Option<String>,

    /// Mining server URL; repeat the flag for failover pools.
    /// Schemes: http://, https://, stratum+tcp://, stratum+tcps://
    #[arg(short = 'o', long = "url")]
    url: Vec<String>,

    /// Username for the mining server
    #[arg(short, long)]
    user: Option<String>,

    /// Password for the mining server
    #[arg(short, long)]
    pass: Option<String>,

    /// username:password pair for the mining server
    #[arg(short = 'O', long)]
    userpass: Option<String>,

    /// Number of miner threads (one per GPU)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Times to retry a failed network call (-1: retry forever)
    #[arg(short, long)]
    retries: Option<i32>,

    /// Pause between retries, in seconds
    #[arg(short = 'R', long)]
    retry_pause: Option<u64>,

    /// Upper bound on time spent scanning current work, in seconds
    #[arg(short, long)]
    scantime: Option<u64>,

    /// Network timeout, in seconds
    #[arg(short = 'T', long)]
    timeout: Option<u64>,

    /// Maximum time to mine before exiting, in seconds
    #[arg(long)]
    time_limit: Option<u64>,

    /// Samples used to compute the hashrate average
    #[arg(short = 'N', long)]
    statsavg: Option<usize>,

    /// Divide difficulty by this factor
    #[arg(short = 'f', long = "diff")]
    diff_factor: Option<f64>,

    /// Block reward vote (heavy family)
    #[arg(short = 'v', long)]
    vote: Option<u16>,

    /// Trust the max block reward vote sent by the pool
    #[arg(short = 'm', long)]
    trust_pool: bool,

    /// Only mine if the GPU temperature is below this value
    #[arg(long)]
    max_temp: Option<f64>,

    /// Only mine if the network difficulty is below this value
    #[arg(long)]
    max_diff: Option<f64>,

    /// Only mine if the network hashrate is below this value (K/M/G ok)
    #[arg(long)]
    max_rate: Option<String>,

    /// Disable getblocktemplate height checks
    #[arg(long)]
    no_gbt: bool,

    /// Disable X-Long-Polling support
    #[arg(long)]
    no_longpoll: bool,

    /// Do not subscribe to extranonce changes
    #[arg(long)]
    no_extranonce: bool,

    /// Run an offline benchmark instead of mining
    #[arg(long)]
    benchmark: bool,

    /// Disable the per-thread hashmeter output
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug output
    #[arg(short = 'D', long)]
    debug: bool,

    /// Load a JSON-format configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logger(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

struct Setup {
    algo: Algorithm,
    n_workers: usize,
    statsavg: usize,
    opts: Options,
    benchmark: bool,
    quiet: bool,
    no_longpoll: bool,
    no_gbt: bool,
    pools: Vec<(pools::ParsedUrl, Option<String>, Option<String>, Option<PoolConfigAttrs>)>,
    user: String,
    pass: String,
}

struct PoolConfigAttrs {
    name: Option<String>,
    scantime: Option<u64>,
    max_diff: Option<f64>,
    max_rate: Option<f64>,
    time_limit: Option<u64>,
    removed: bool,
}

fn resolve(cli: &Cli, file: &ConfigFile) -> Result<Setup> {
    let algo_name = cli
        .algo
        .clone()
        .or_else(|| file.algo.clone())
        .unwrap_or_else(|| "x11".to_string());
    let algo = Algorithm::from_str(&algo_name).ok_or_else(|| {
        anyhow!(
            "unknown algorithm '{}' (valid: {})",
            algo_name,
            Algorithm::ALL
                .iter()
                .map(|a| a.name())
                .collect::<Vec<_>>()
                .join(", ")
        )
    })?;

    let (mut user, mut pass) = (
        cli.user.clone().or_else(|| file.user.clone()),
        cli.pass.clone().or_else(|| file.pass.clone()),
    );
    if let Some(userpass) = &cli.userpass {
        let (u, p) = userpass
            .split_once(':')
            .ok_or_else(|| anyhow!("--userpass wants user:pass"))?;
        user = Some(u.to_string());
        pass = Some(p.to_string());
    }

    let max_rate = match cli.max_rate.as_deref().or(file.max_rate.as_deref()) {
        Some(s) => config::parse_rate(s).ok_or_else(|| anyhow!("bad rate '{}'", s))?,
        None => 0.0,
    };

    let defaults = Options::default();
    let mut opts = Options {
        scantime: cli.scantime.or(file.scantime).unwrap_or(defaults.scantime),
        max_diff: cli.max_diff.or(file.max_diff).unwrap_or(0.0),
        max_rate,
        max_temp: cli.max_temp.or(file.max_temp).unwrap_or(0.0),
        time_limit: cli.time_limit.or(file.time_limit).unwrap_or(0),
        difficulty: cli.diff_factor.or(file.diff).unwrap_or(1.0),
        retries: cli.retries.or(file.retries).unwrap_or(defaults.retries),
        fail_pause: cli
            .retry_pause
            .or(file.retry_pause)
            .unwrap_or(defaults.fail_pause),
        timeout: cli.timeout.or(file.timeout).unwrap_or(defaults.timeout),
        vote: cli.vote.or(file.vote).unwrap_or(0),
        trust_pool: cli.trust_pool || file.trust_pool,
        extranonce_subscribe: !(cli.no_extranonce || file.no_extranonce),
    };
    if opts.difficulty <= 0.0 {
        return Err(anyhow!("difficulty factor must be positive"));
    }

    // collect pool definitions: CLI urls first, then the config array
    let mut pool_defs = Vec::new();
    for url in cli
        .url
        .iter()
        .cloned()
        .chain(file.url.iter().cloned())
    {
        pool_defs.push((parse_url(&url)?, None, None, None));
    }
    for p in &file.pools {
        pool_defs.push((
            parse_url(&p.url)?,
            p.user.clone(),
            p.pass.clone(),
            Some(PoolConfigAttrs {
                name: p.name.clone(),
                scantime: p.scantime,
                max_diff: p.max_diff,
                max_rate: p.max_rate.as_deref().and_then(config::parse_rate),
                time_limit: p.time_limit,
                removed: p.removed,
            }),
        ));
    }

    let benchmark = cli.benchmark;
    if pool_defs.is_empty() && !benchmark {
        return Err(anyhow!("no pool URL supplied"));
    }

    // multiple pools tighten the default retry policy
    if pool_defs.len() > 1 {
        if cli.retries.or(file.retries).is_none() {
            opts.retries = 1;
        }
        if cli.retry_pause.or(file.retry_pause).is_none() {
            opts.fail_pause = 5;
        }
    }

    if algo.spec().has_vote && cli.vote.or(file.vote).is_none() && !benchmark {
        return Err(anyhow!(
            "the {} algorithm requires a block reward vote (see --vote)",
            algo.name()
        ));
    }

    Ok(Setup {
        algo,
        n_workers: cli.threads.or(file.threads).unwrap_or(1).max(1),
        statsavg: cli.statsavg.or(file.statsavg).unwrap_or(30).max(1),
        opts,
        benchmark,
        quiet: cli.quiet || file.quiet,
        no_longpoll: cli.no_longpoll || file.no_longpoll,
        no_gbt: cli.no_gbt || file.no_gbt,
        pools: pool_defs,
        user: user.unwrap_or_else(config::default_user),
        pass: pass.unwrap_or_else(|| "x".to_string()),
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => match ConfigFile::from_file(path) {
            Ok(file) => file,
            Err(e) => {
                eprintln!("{:#}", e);
                std::process::exit(EXIT_USAGE);
            }
        },
        None => ConfigFile::default(),
    };
    init_logger(cli.debug || file.debug);

    let setup = match resolve(&cli, &file) {
        Ok(setup) => setup,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(EXIT_USAGE);
        }
    };

    std::process::exit(run(setup).await);
}

async fn run(setup: Setup) -> i32 {
    if let Err(e) = kernels::require_kernel(setup.algo) {
        error!("{:#}", e);
        return state::EXIT_HARDWARE;
    }
    if setup.opts.trust_pool {
        // carried for CLI compatibility; any maxvote capping happens in
        // the scan kernels, not in the coordination core
        debug!("--trust-pool set");
    }

    let state = Arc::new(
        SharedState::new(setup.algo, setup.n_workers, setup.opts, setup.statsavg)
            .with_benchmark(setup.benchmark)
            .with_quiet(setup.quiet),
    );
    state
        .allow_gbt
        .store(!setup.no_gbt, Ordering::Relaxed);
    state
        .want_longpoll
        .store(!setup.no_longpoll && !setup.benchmark, Ordering::SeqCst);

    let (stratum_tx, stratum_rx) = mpsc::unbounded_channel();
    let (longpoll_tx, longpoll_rx) = mpsc::unbounded_channel();
    let (workio_tx, workio_rx) = mpsc::channel(workio::WORKIO_QUEUE);

    let ctx = Arc::new(Ctx::new(
        state.clone(),
        stratum_tx.clone(),
        longpoll_tx,
        workio_tx,
    ));

    if !setup.benchmark {
        for (parsed, user, pass, attrs) in setup.pools {
            let n = match ctx.pools.define(
                parsed,
                user.unwrap_or_else(|| setup.user.clone()),
                pass.unwrap_or_else(|| setup.pass.clone()),
            ) {
                Ok(n) => n,
                Err(e) => {
                    error!("{:#}", e);
                    return EXIT_USAGE;
                }
            };
            if let Some(attrs) = attrs {
                if let Some(name) = attrs.name {
                    ctx.pools.set_attr(n, "name", &name);
                }
                if let Some(v) = attrs.scantime {
                    ctx.pools.set_attr(n, "scantime", &v.to_string());
                }
                if let Some(v) = attrs.max_diff {
                    ctx.pools.set_attr(n, "max-diff", &v.to_string());
                }
                if let Some(v) = attrs.max_rate {
                    ctx.pools.set_attr(n, "max-rate", &v.to_string());
                }
                if let Some(v) = attrs.time_limit {
                    ctx.pools.set_attr(n, "time-limit", &v.to_string());
                }
                if attrs.removed {
                    ctx.pools.set_attr(n, "removed", "1");
                }
            }
        }
        ctx.pools.dump();

        let first = ctx.pools.first_valid(0);
        ctx.pools.switch(first);
        state.pool_is_switching.store(false, Ordering::SeqCst);
        state.stratum_need_reset.store(false, Ordering::SeqCst);
    } else {
        state.want_stratum.store(false, Ordering::SeqCst);
        state.have_stratum.store(false, Ordering::SeqCst);
    }

    // roster: work I/O actor, long-poll thread, stratum thread, workers
    let workio_handle = tokio::spawn(workio::workio_task(ctx.clone(), workio_rx));
    tokio::spawn(longpoll::longpoll_task(ctx.clone(), longpoll_rx));
    tokio::spawn(stratum::stratum_task(ctx.clone(), stratum_rx));

    if !setup.benchmark && state.want_stratum.load(Ordering::SeqCst) {
        // unblock the stratum thread with the initial URL; getwork pools
        // instead discover their long-poll endpoint from the first reply
        let url = state.creds.read().expect("creds poisoned").url.clone();
        let _ = stratum_tx.send(url);
    }

    let _workers = miner::spawn_workers(&ctx);
    info!(
        "{} miner thread{} started, using '{}' algorithm.",
        setup.n_workers,
        if setup.n_workers > 1 { "s" } else { "" },
        setup.algo.name()
    );

    wait_for_shutdown(workio_handle).await;

    // cooperative shutdown: flag every loop, give kernels a moment
    state.abort.store(true, Ordering::SeqCst);
    ctx.request_workio_abort();
    tokio::time::sleep(Duration::from_millis(200)).await;

    if state.check_dups.load(Ordering::Relaxed) {
        state.hashlog.lock().expect("hashlog poisoned").purge_all();
    }
    let (uptime, rate) = {
        let mut stats = state.stats.lock().expect("stats poisoned");
        let summary = (stats.uptime_secs(), stats.global_hashrate);
        stats.purge_all();
        summary
    };
    info!(
        "mined for {}s, last rate {}",
        uptime,
        stats::format_hashrate(rate as f64)
    );

    let code = state.app_exit_code.load(Ordering::SeqCst);
    info!("exiting with code {}", code);
    code
}

async fn wait_for_shutdown(workio: tokio::task::JoinHandle<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("signal handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, exiting"),
            _ = sigterm.recv() => info!("SIGTERM received, exiting"),
            _ = workio => debug!("work I/O thread dead, exiting."),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received, exiting"),
            _ = workio => debug!("work I/O thread dead, exiting."),
        }
    }
}
