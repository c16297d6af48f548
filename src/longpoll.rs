//! Long-poll thread: blocks on the `X-Long-Polling` endpoint until the
//! server releases new work, then republishes it and restarts the workers.
//!
//! The task idles on its input queue until a getwork response (or a pool
//! switch) hands it an endpoint; a pool switch or a stratum takeover sends
//! it back to the queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::ctx::Ctx;
use crate::getwork::RpcClient;
use crate::state::now_secs;
use crate::work::{calc_network_diff, Work};

/// Scan-time the workers assume while long-polling paces the work feed.
pub const LP_SCANTIME: u64 = 60;

pub async fn longpoll_task(ctx: Arc<Ctx>, mut url_rx: mpsc::UnboundedReceiver<String>) {
    let state = &ctx.state;
    let client = match RpcClient::new_longpoll() {
        Ok(c) => c,
        Err(e) => {
            warn!("long-poll disabled: {:#}", e);
            return;
        }
    };

    'wait_url: while let Some(hdr_path) = url_rx.recv().await {
        let pooln = state.cur_pool();
        state.pool_is_switching.store(false, Ordering::SeqCst);

        if state.have_stratum.load(Ordering::SeqCst) {
            continue 'wait_url;
        }

        let lp_url = resolve_lp_url(ctx.as_ref(), &hdr_path);
        info!("Long-polling enabled on {}", lp_url);
        state.have_longpoll.store(true, Ordering::SeqCst);

        loop {
            if state.aborted() {
                return;
            }
            if pooln != state.cur_pool() {
                state.have_longpoll.store(false, Ordering::SeqCst);
                continue 'wait_url;
            }
            state.pool_is_switching.store(false, Ordering::SeqCst);

            let (user, pass, timeout) = {
                let creds = state.creds.read().expect("creds poisoned");
                let opts = state.opts.read().expect("options poisoned");
                (creds.user.clone(), creds.pass.clone(), opts.timeout)
            };

            let reply = client
                .call(
                    &lp_url,
                    &user,
                    &pass,
                    json!({ "method": "getwork", "params": [], "id": 0 }),
                    Some(Duration::from_secs(timeout.max(60))),
                )
                .await;

            if state.have_stratum.load(Ordering::SeqCst) || pooln != state.cur_pool() {
                state.have_longpoll.store(false, Ordering::SeqCst);
                continue 'wait_url;
            }

            match reply {
                Ok(reply) => {
                    let result = reply.body.get("result").cloned().unwrap_or(Value::Null);
                    let submit_old = result
                        .get("submitold")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    state.submit_old.store(submit_old, Ordering::SeqCst);

                    match Work::decode_getwork(&result, state.algo) {
                        Ok(mut work) => {
                            work.pooln = pooln;
                            let opts = state.opts.read().expect("options poisoned").clone();
                            if opts.max_diff > 0.0 {
                                state.net_diff.set(calc_network_diff(&work, state.algo));
                            }
                            {
                                let mut slot = state.lock_slot();
                                slot.work = work;
                                slot.time = now_secs().max(slot.time);
                            }
                            state.restart_all();
                            state.have_longpoll.store(true, Ordering::SeqCst);
                            if !state.quiet {
                                let net_diff = state.net_diff.get();
                                let short = state
                                    .creds
                                    .read()
                                    .expect("creds poisoned")
                                    .short_url
                                    .clone();
                                if net_diff > 0.0 {
                                    info!("{} detected new block, diff {:.2}", short, net_diff);
                                } else {
                                    info!("{} detected new block", short);
                                }
                            }
                        }
                        Err(e) => warn!("long-poll decode failed: {:#}", e),
                    }
                }
                Err(e) => {
                    // age the current job so workers refetch, then retry;
                    // a plain timeout is the server's pacing, not a fault
                    {
                        let mut slot = state.lock_slot();
                        slot.time = slot.time.saturating_sub(LP_SCANTIME);
                    }
                    state.restart_all();

                    let is_timeout = e
                        .downcast_ref::<reqwest::Error>()
                        .map(reqwest::Error::is_timeout)
                        .unwrap_or(false);
                    if !is_timeout {
                        let pause = state.opts.read().expect("options poisoned").fail_pause;
                        state.have_longpoll.store(false, Ordering::SeqCst);
                        warn!("long-poll failed: {:#}, retry after {}s", e, pause);
                        tokio::time::sleep(Duration::from_secs(pause)).await;
                        state.have_longpoll.store(true, Ordering::SeqCst);
                    } else {
                        debug!("long-poll timed out, re-issuing");
                    }
                }
            }
        }
    }
}

/// The endpoint may be a full URL or a path on the current pool server.
fn resolve_lp_url(ctx: &Ctx, hdr_path: &str) -> String {
    if hdr_path.contains("://") {
        return hdr_path.to_string();
    }
    let base = ctx
        .state
        .creds
        .read()
        .expect("creds poisoned")
        .url
        .clone();
    let path = hdr_path.strip_prefix('/').unwrap_or(hdr_path);
    if base.ends_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::Algorithm;
    use crate::state::{Options, SharedState};
    use crate::workio::WORKIO_QUEUE;

    fn ctx() -> Arc<Ctx> {
        let state = Arc::new(SharedState::new(Algorithm::X11, 1, Options::default(), 30));
        let (stx, _srx) = mpsc::unbounded_channel();
        let (ltx, _lrx) = mpsc::unbounded_channel();
        let (wtx, _wrx) = mpsc::channel(WORKIO_QUEUE);
        Arc::new(Ctx::new(state, stx, ltx, wtx))
    }

    #[test]
    fn lp_url_joins_relative_paths() {
        let ctx = ctx();
        {
            let mut creds = ctx.state.creds.write().unwrap();
            creds.url = "http://node.example.com:8332".to_string();
        }
        assert_eq!(
            resolve_lp_url(&ctx, "/lp"),
            "http://node.example.com:8332/lp"
        );
        assert_eq!(
            resolve_lp_url(&ctx, "lp"),
            "http://node.example.com:8332/lp"
        );
        assert_eq!(
            resolve_lp_url(&ctx, "http://other.example.com/lp"),
            "http://other.example.com/lp"
        );
    }
}
