//! HTTP JSON-RPC client for solo/getwork pools: `getwork`,
//! `getblocktemplate`, `getmininginfo` and the getwork-style submit.
//!
//! One instance lives in the work I/O actor and one in the long-poll task;
//! each owns its own HTTP connection pool.

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::ctx::Ctx;
use crate::work::{calc_network_diff, Work};

/// The `X-Long-Polling` response header advertising the push endpoint.
const LP_HEADER: &str = "X-Long-Polling";

pub struct RpcClient {
    http: reqwest::Client,
}

/// A JSON-RPC exchange: the parsed body plus the long-poll path when the
/// server advertised one.
pub struct RpcReply {
    pub body: Value,
    pub lp_path: Option<String>,
}

impl RpcClient {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::stratum::messages::USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs.max(5)))
            .build()
            .context("HTTP client initialization failed")?;
        Ok(Self { http })
    }

    /// Long-poll variant: no client-wide timeout, the caller bounds each
    /// request instead.
    pub fn new_longpoll() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::stratum::messages::USER_AGENT)
            .build()
            .context("HTTP client initialization failed")?;
        Ok(Self { http })
    }

    pub async fn call(
        &self,
        url: &str,
        user: &str,
        pass: &str,
        body: Value,
        timeout: Option<Duration>,
    ) -> Result<RpcReply> {
        let mut req = self
            .http
            .post(url)
            .basic_auth(user, Some(pass))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await.context("JSON-RPC request failed")?;
        let lp_path = resp
            .headers()
            .get(LP_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("JSON-RPC decode failed (HTTP {})", status))?;
        Ok(RpcReply { body, lp_path })
    }
}

fn creds(ctx: &Ctx) -> (String, String, String) {
    let creds = ctx.state.creds.read().expect("creds poisoned");
    (creds.url.clone(), creds.user.clone(), creds.pass.clone())
}

/// `getwork` with the opportunistic info calls behind it. The returned
/// record is stamped with the pool that served it.
pub async fn get_upstream_work(client: &RpcClient, ctx: &Ctx) -> Result<Work> {
    let state = &ctx.state;
    let pooln = state.cur_pool();
    let (url, user, pass) = creds(ctx);

    let reply = client
        .call(
            &url,
            &user,
            &pass,
            json!({ "method": "getwork", "params": [], "id": 0 }),
            None,
        )
        .await?;

    // advertise the long-poll endpoint exactly once
    if let Some(path) = reply.lp_path {
        if state.want_longpoll.load(Ordering::SeqCst) && !state.have_longpoll.load(Ordering::SeqCst)
        {
            let _ = ctx.longpoll_tx.send(path);
        }
    }

    let result = rpc_result(&reply.body)?;
    let mut work = Work::decode_getwork(result, state.algo)?;
    work.pooln = pooln;

    let opts = state.opts.read().expect("options poisoned").clone();
    if opts.max_diff > 0.0 && !state.allow_mininginfo.load(Ordering::Relaxed) {
        state.net_diff.set(calc_network_diff(&work, state.algo));
    }

    get_mininginfo(client, ctx).await;
    get_blocktemplate(client, ctx, &mut work).await;

    Ok(work)
}

/// Height (and its log line) via `getblocktemplate`; a server that errors
/// on it gets the call disabled for the rest of the pool session.
pub async fn get_blocktemplate(client: &RpcClient, ctx: &Ctx, work: &mut Work) {
    let state = &ctx.state;
    if !state.allow_gbt.load(Ordering::Relaxed) {
        return;
    }
    let (url, user, pass) = creds(ctx);
    let reply = match client
        .call(
            &url,
            &user,
            &pass,
            json!({ "method": "getblocktemplate", "params": [], "id": 9 }),
            None,
        )
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            // transient failure; the call stays enabled
            debug!("getblocktemplate failed: {:#}", e);
            return;
        }
    };

    let result = match rpc_result(&reply.body) {
        Ok(result) => result,
        Err(_) => {
            state.allow_gbt.store(false, Ordering::Relaxed);
            if !state.quiet {
                info!("gbt not supported, block height notices disabled");
            }
            return;
        }
    };

    if work.height == 0 {
        if let Some(height) = result.get("height").and_then(Value::as_u64) {
            work.height = height as u32;
            let old = {
                let slot = state.lock_slot();
                slot.work.height
            };
            if work.height > old && !state.quiet {
                let net_diff = state.net_diff.get();
                if net_diff > 0.0 {
                    info!(
                        "{} block {}, diff {:.2}",
                        state.algo.name(),
                        work.height,
                        net_diff
                    );
                } else {
                    info!("{} block {}", state.algo.name(), work.height);
                }
            }
        }
    }
}

/// Network difficulty/hashrate/height for the conditional-mining gates.
/// Disabled per pool on the first "method not supported" answer.
pub async fn get_mininginfo(client: &RpcClient, ctx: &Ctx) {
    let state = &ctx.state;
    if state.have_stratum.load(Ordering::SeqCst) || !state.allow_mininginfo.load(Ordering::Relaxed)
    {
        return;
    }
    let (url, user, pass) = creds(ctx);
    let reply = client
        .call(
            &url,
            &user,
            &pass,
            json!({ "method": "getmininginfo", "params": [], "id": 8 }),
            None,
        )
        .await;

    let result = match reply {
        Ok(r) => match rpc_result(&r.body) {
            Ok(result) => result.clone(),
            Err(_) => {
                // the method itself is refused: stop asking this pool
                state.allow_mininginfo.store(false, Ordering::Relaxed);
                debug!("getmininginfo not supported");
                return;
            }
        },
        Err(e) => {
            debug!("getmininginfo failed: {:#}", e);
            return;
        }
    };

    if let Some(diff) = result.get("difficulty").and_then(Value::as_f64) {
        state.net_diff.set(diff);
    }
    if let Some(rate) = result.get("networkhashps").and_then(Value::as_u64) {
        state.net_hashrate.store(rate, Ordering::Relaxed);
    }
    if let Some(blocks) = result.get("blocks").and_then(Value::as_u64) {
        state.net_blocks.store(blocks, Ordering::Relaxed);
    }
    debug!(
        "net diff {:.3}, {} H/s, {} blocks",
        state.net_diff.get(),
        state.net_hashrate.load(Ordering::Relaxed),
        state.net_blocks.load(Ordering::Relaxed)
    );
}

/// Getwork-style submit with the full stale-work predicate in front of the
/// network call. A dropped stale solution reports success: there is
/// nothing to retry.
pub async fn submit_upstream_work(client: &RpcClient, ctx: &Ctx, work: &Work) -> Result<()> {
    let state = &ctx.state;
    let algo = state.algo;
    let spec = algo.spec();

    // discard work sent for another pool
    if work.pooln != state.cur_pool() {
        return Ok(());
    }

    let (g_height, g_prefix) = {
        let slot = state.lock_slot();
        (slot.work.height, slot.work.data[1..17].to_vec())
    };

    let mut stale = work.height > 0 && work.height < g_height;

    // a freshly solved block invalidates our copy even before long-poll
    // gets around to telling us
    if !stale && state.allow_gbt.load(Ordering::Relaxed) {
        let mut probe = Work::default();
        get_blocktemplate(client, ctx, &mut probe).await;
        if work.height > 0 && probe.height > 0 && work.height < probe.height {
            debug!("block {} was already solved", work.height);
            return Ok(());
        }
    }

    if !stale && spec.stale_prefix_check {
        stale = work.data[1..17] != g_prefix[..];
    }

    if stale && !state.submit_old.load(Ordering::SeqCst) {
        debug!("stale work detected, discarding");
        return Ok(());
    }

    let mut work = work.clone();
    work.update_difficulty(algo, state.opts.read().expect("options poisoned").difficulty);

    let data = work.encode_submit_data(algo);
    let (url, user, pass) = creds(ctx);
    let reply = client
        .call(
            &url,
            &user,
            &pass,
            json!({ "method": "getwork", "params": [data], "id": 4 }),
            None,
        )
        .await?;

    let accepted = reply
        .body
        .get("result")
        .map(|v| v.as_bool() == Some(true))
        .unwrap_or(false);
    let reason = reply
        .body
        .get("reject-reason")
        .and_then(Value::as_str)
        .map(str::to_string);

    if !crate::miner::share_result(ctx, accepted, reason.as_deref())
        && state.check_dups.load(Ordering::Relaxed)
    {
        state
            .hashlog
            .lock()
            .expect("hashlog poisoned")
            .purge_job(&work.job_id);
    }

    Ok(())
}

fn rpc_result(body: &Value) -> Result<&Value> {
    if let Some(err) = body.get("error") {
        if !err.is_null() {
            return Err(anyhow!("JSON-RPC error: {}", err));
        }
    }
    body.get("result")
        .filter(|r| !r.is_null())
        .ok_or_else(|| anyhow!("JSON-RPC reply has no result"))
}

/// Log-and-classify helper for the actor's retry loop.
pub fn log_rpc_failure(err: &anyhow::Error, fail_pause: u64) {
    warn!("json_rpc_call failed: {:#}", err);
    warn!("...retry after {} seconds", fail_pause);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_result_rejects_error_bodies() {
        let body = json!({ "result": null, "error": {"code": -32601} });
        assert!(rpc_result(&body).is_err());
        let body = json!({ "result": {"height": 5}, "error": null });
        assert_eq!(rpc_result(&body).unwrap()["height"], 5);
        let body = json!({});
        assert!(rpc_result(&body).is_err());
    }
}
