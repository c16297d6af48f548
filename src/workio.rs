//! The work I/O actor: sole owner of the outbound HTTP client, serializing
//! every getwork fetch and submit behind a bounded command queue.
//!
//! The supervisor waits on this task; when the retry budget runs out the
//! actor exits and takes the whole process down with it.

use std::sync::Arc;

use log::{debug, error};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration};

use crate::ctx::Ctx;
use crate::getwork::{self, RpcClient};
use crate::state::EXIT_NET;
use crate::work::Work;

pub enum WorkIoCmd {
    GetWork {
        reply: oneshot::Sender<Option<Work>>,
    },
    Submit(Box<Work>),
    Abort,
}

/// Queue depth: a handful of outstanding commands is plenty, the actor
/// serializes anyway and backpressure keeps workers honest.
pub const WORKIO_QUEUE: usize = 64;

pub async fn workio_task(ctx: Arc<Ctx>, mut rx: mpsc::Receiver<WorkIoCmd>) {
    let timeout = ctx
        .state
        .opts
        .read()
        .expect("options poisoned")
        .timeout;
    let client = match RpcClient::new(timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("{:#}", e);
            ctx.state.request_exit(EXIT_NET);
            return;
        }
    };

    while let Some(cmd) = rx.recv().await {
        if ctx.state.aborted() {
            break;
        }
        let ok = match cmd {
            WorkIoCmd::GetWork { reply } => get_work_with_retry(&client, &ctx, reply).await,
            WorkIoCmd::Submit(work) => submit_with_retry(&client, &ctx, *work).await,
            WorkIoCmd::Abort => false,
        };
        if !ok {
            break;
        }
    }

    debug!("work I/O actor stopping");
}

/// Fetch work, retrying up to the configured budget. Exhausting the budget
/// is fatal for the whole program.
async fn get_work_with_retry(
    client: &RpcClient,
    ctx: &Ctx,
    reply: oneshot::Sender<Option<Work>>,
) -> bool {
    let mut failures: u32 = 0;
    loop {
        if ctx.state.aborted() {
            let _ = reply.send(None);
            return false;
        }
        match getwork::get_upstream_work(client, ctx).await {
            Ok(work) => {
                let _ = reply.send(Some(work));
                return true;
            }
            Err(e) => {
                failures += 1;
                let (retries, pause) = retry_policy(ctx);
                if retries >= 0 && failures > retries as u32 {
                    error!("json_rpc_call failed, terminating work I/O thread");
                    let _ = reply.send(None);
                    ctx.state.request_exit(EXIT_NET);
                    return false;
                }
                getwork::log_rpc_failure(&e, pause);
                sleep(Duration::from_secs(pause)).await;
            }
        }
    }
}

/// Submit with the same retry discipline, but only while the solution
/// still belongs to the active pool.
async fn submit_with_retry(client: &RpcClient, ctx: &Ctx, work: Work) -> bool {
    let mut failures: u32 = 0;
    loop {
        if work.pooln != ctx.state.cur_pool() {
            debug!("discarding work from pool {}", work.pooln);
            return true;
        }
        match getwork::submit_upstream_work(client, ctx, &work).await {
            Ok(()) => return true,
            Err(e) => {
                failures += 1;
                let (retries, pause) = retry_policy(ctx);
                if retries >= 0 && failures > retries as u32 {
                    error!("submit failed, terminating work I/O thread");
                    ctx.state.request_exit(EXIT_NET);
                    return false;
                }
                getwork::log_rpc_failure(&e, pause);
                sleep(Duration::from_secs(pause)).await;
            }
        }
    }
}

fn retry_policy(ctx: &Ctx) -> (i32, u64) {
    let opts = ctx.state.opts.read().expect("options poisoned");
    (opts.retries, opts.fail_pause)
}
