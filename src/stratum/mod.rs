//! Stratum client: a line-oriented TCP (or TLS) session that subscribes,
//! authorizes, consumes server-pushed jobs and carries share submits.
//!
//! The connection's read half lives with the stratum task; the write half
//! and the session job state are shared so workers can submit directly on
//! the socket under the send lock. On pool switch the whole session is
//! parked in the outgoing pool's registry slot and restored on the way
//! back.

pub mod messages;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::algo::{Algorithm, MerkleHash};
use crate::ctx::Ctx;
use crate::kernels;
use crate::state::{now_secs, Options};
use crate::work::{calc_network_diff, diff_to_target, increment_xnonce2, Work};

use messages::{
    block_height, parse_notify, Notify, StratumLine, StratumRequest, ID_AUTHORIZE, ID_SUBMIT,
    ID_SUBSCRIBE, USER_AGENT,
};

/// Idle seconds on the socket before the connection is declared dead.
const SOCKET_IDLE_SECS: u64 = 120;

pub trait NetStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> NetStream for T {}

type Reader = Lines<BufReader<tokio::io::ReadHalf<Box<dyn NetStream>>>>;
type Writer = tokio::io::WriteHalf<Box<dyn NetStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Subscribed,
    Authorized,
    Ready,
}

/// Everything `mining.notify` and its companions feed into job assembly,
/// guarded by the session work lock.
#[derive(Debug, Clone)]
pub struct StratumJob {
    pub job_id: String,
    pub prevhash: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle: Vec<[u8; 32]>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean: bool,
    pub nreward: u16,
    pub height: u32,

    pub xnonce1: Vec<u8>,
    pub xnonce2_size: usize,
    pub xnonce2: Vec<u8>,

    /// Session difficulty; `mining.set_difficulty` stages the next value.
    pub diff: f64,
    pub next_diff: f64,

    /// Server ntime minus local clock, captured on the first notify.
    pub srvtime_diff: Option<i64>,
}

impl Default for StratumJob {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            prevhash: [0; 32],
            coinbase1: Vec::new(),
            coinbase2: Vec::new(),
            merkle: Vec::new(),
            version: 0,
            nbits: 0,
            ntime: 0,
            clean: false,
            nreward: 0,
            height: 0,
            xnonce1: Vec::new(),
            xnonce2_size: 0,
            xnonce2: Vec::new(),
            diff: 1.0,
            next_diff: 1.0,
            srvtime_diff: None,
        }
    }
}

/// A suspended connection, parked in a pool slot across a switch.
pub struct Session {
    reader: Reader,
    writer: Option<Writer>,
    job: StratumJob,
    phase: SessionPhase,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("phase", &self.phase).finish()
    }
}

/// What the server asked us to do, out of `handle_method`.
enum Action {
    None,
    /// Drop the connection; optionally move to a server-designated URL.
    Reconnect(Option<String>),
}

pub struct StratumClient {
    job: Mutex<StratumJob>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    phase: Mutex<SessionPhase>,
    tv_submit: Mutex<Option<Instant>>,
    /// Milliseconds the pool took to answer the last submit.
    pub answer_msec: AtomicU32,
}

impl StratumClient {
    pub fn new() -> Self {
        Self {
            job: Mutex::new(StratumJob::default()),
            writer: tokio::sync::Mutex::new(None),
            phase: Mutex::new(SessionPhase::Disconnected),
            tv_submit: Mutex::new(None),
            answer_msec: AtomicU32::new(0),
        }
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock().expect("phase poisoned") = phase;
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().expect("phase poisoned")
    }

    pub fn has_job(&self) -> bool {
        !self.job.lock().expect("job poisoned").job_id.is_empty()
    }

    pub fn job_id(&self) -> String {
        self.job.lock().expect("job poisoned").job_id.clone()
    }

    pub fn session_diff(&self) -> f64 {
        self.job.lock().expect("job poisoned").diff
    }

    // ---- server message application (pure state, shared with tests) ----

    /// `mining.subscribe` result: `[subscriptions, xnonce1, xnonce2_size]`.
    fn apply_subscribe_result(&self, result: &Value) -> Result<()> {
        let arr = result
            .as_array()
            .ok_or_else(|| anyhow!("subscribe result is not an array"))?;
        let xnonce1 = arr
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("subscribe result lacks extranonce1"))?;
        let x2size = arr
            .get(2)
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("subscribe result lacks extranonce2 size"))? as usize;
        if x2size == 0 || x2size > 16 {
            return Err(anyhow!("unreasonable extranonce2 size {}", x2size));
        }

        let mut job = self.job.lock().expect("job poisoned");
        job.xnonce1 = hex::decode(xnonce1).context("extranonce1 is not hex")?;
        job.xnonce2_size = x2size;
        job.xnonce2 = vec![0u8; x2size];
        Ok(())
    }

    fn apply_notify(&self, notify: Notify) {
        let mut job = self.job.lock().expect("job poisoned");
        if job.srvtime_diff.is_none() {
            job.srvtime_diff = Some(notify.ntime as i64 - now_secs() as i64);
        }
        job.height = block_height(&notify.coinbase1);
        job.job_id = notify.job_id;
        job.prevhash = notify.prevhash;
        job.coinbase1 = notify.coinbase1;
        job.coinbase2 = notify.coinbase2;
        job.merkle = notify.merkle;
        job.version = notify.version;
        job.nbits = notify.nbits;
        job.ntime = notify.ntime;
        job.clean = notify.clean;
        job.nreward = notify.nreward;
        job.diff = job.next_diff;
    }

    fn apply_set_difficulty(&self, params: &Value) -> Result<f64> {
        let diff = params
            .as_array()
            .and_then(|a| a.first())
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("set_difficulty params lack a number"))?;
        if diff <= 0.0 {
            return Err(anyhow!("nonsense difficulty {}", diff));
        }
        self.job.lock().expect("job poisoned").next_diff = diff;
        Ok(diff)
    }

    fn apply_set_extranonce(&self, params: &Value) -> Result<()> {
        let arr = params
            .as_array()
            .ok_or_else(|| anyhow!("set_extranonce params is not an array"))?;
        let xnonce1 = arr
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("set_extranonce lacks extranonce1"))?;
        let mut job = self.job.lock().expect("job poisoned");
        job.xnonce1 = hex::decode(xnonce1).context("extranonce1 is not hex")?;
        if let Some(size) = arr.get(1).and_then(Value::as_u64) {
            let size = size as usize;
            if size > 0 && size <= 16 {
                job.xnonce2_size = size;
                job.xnonce2 = vec![0u8; size];
            }
        }
        Ok(())
    }

    // ---- job assembly ----

    /// Assemble a fresh work unit from the stored notify parameters and
    /// advance the extranonce2 counter. None while no job is known (or
    /// after the extranonce2 space ran dry).
    pub fn gen_work(&self, algo: Algorithm, opts: &Options, pooln: usize) -> Option<Work> {
        let spec = algo.spec();
        let mut job = self.job.lock().expect("job poisoned");
        if job.job_id.is_empty() {
            return None;
        }

        let mut work = Work::default();
        work.pooln = pooln;
        work.job_id = format!("{:07x} {}", job.ntime & 0x0fff_ffff, job.job_id);
        work.xnonce2 = job.xnonce2.clone();
        work.height = job.height;

        // coinbase splice and merkle fold
        let mut coinbase = Vec::with_capacity(
            job.coinbase1.len() + job.xnonce1.len() + job.xnonce2.len() + job.coinbase2.len(),
        );
        coinbase.extend_from_slice(&job.coinbase1);
        coinbase.extend_from_slice(&job.xnonce1);
        coinbase.extend_from_slice(&job.xnonce2);
        coinbase.extend_from_slice(&job.coinbase2);

        let mut root = match merkle_hash(algo, &coinbase) {
            Some(root) => root,
            None => {
                error!("no {} merkle digest in this build", algo.name());
                return None;
            }
        };
        for branch in &job.merkle {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&root);
            buf[32..].copy_from_slice(branch);
            root = match merkle_hash(algo, &buf) {
                Some(root) => root,
                None => return None,
            };
        }

        if !increment_xnonce2(&mut job.xnonce2) {
            // exhausted the whole extranonce2 space on one notify; demand
            // fresh parameters rather than re-searching old space
            error!("extranonce2 space exhausted, waiting for a new job");
            job.job_id.clear();
        }

        // header words
        work.data[0] = job.version;
        for i in 0..8 {
            work.data[1 + i] =
                u32::from_le_bytes(job.prevhash[4 * i..4 * i + 4].try_into().unwrap());
        }
        for i in 0..8 {
            work.data[9 + i] = u32::from_be_bytes(root[4 * i..4 * i + 4].try_into().unwrap());
        }
        work.data[17] = job.ntime;
        work.data[18] = job.nbits;

        for w in work.data[..spec.be_words].iter_mut() {
            *w = w.swap_bytes();
        }

        work.data[20] = 0x8000_0000;
        work.data[31] = spec.word31;

        if spec.has_vote {
            work.maxvote = 2048;
            work.data[20] = (job.nreward as u32) << 16 | opts.vote as u32;
        }

        let divisor = spec.target_divisor * if opts.difficulty > 0.0 { opts.difficulty } else { 1.0 };
        diff_to_target(&mut work.target, job.diff / divisor);
        work.update_difficulty(algo, opts.difficulty);

        Some(work)
    }

    // ---- submit path ----

    /// Share submit, issued by any thread under the session send lock.
    /// Returns false when the share was suppressed as a duplicate.
    pub async fn submit(&self, ctx: &Ctx, work: &Work) -> Result<bool> {
        let algo = ctx.state.algo;
        let nonce = work.raw_word(19, algo);

        if ctx.state.check_dups.load(Ordering::Relaxed) {
            let mut log = ctx.state.hashlog.lock().expect("hashlog poisoned");
            if let Some(sent) = log.already_submitted(&work.job_id, nonce) {
                let ago = now_secs().saturating_sub(sent);
                if !ctx.state.quiet {
                    warn!("nonce {:08x} was already sent {} seconds ago", nonce, ago);
                    log.dump_job(&work.job_id);
                }
                drop(log);
                // prevent useless re-scans of the same space
                ctx.state.invalidate_work();
                ctx.state.restart_all();
                return Ok(false);
            }
        }

        let user = ctx.state.creds.read().expect("creds poisoned").user.clone();
        let params = submit_params(work, &user, algo);
        let line = StratumRequest::submit(params).to_line();

        *self.tv_submit.lock().expect("submit time poisoned") = Some(Instant::now());
        self.send_line(&line).await?;

        if ctx.state.check_dups.load(Ordering::Relaxed) {
            ctx.state
                .hashlog
                .lock()
                .expect("hashlog poisoned")
                .remember_submit(&work.job_id, nonce, now_secs());
        }
        Ok(true)
    }

    async fn send_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| anyhow!("stratum socket is not connected"))?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn send_json(&self, value: &Value) -> Result<()> {
        let mut line = value.to_string();
        line.push('\n');
        self.send_line(&line).await
    }

    // ---- connection lifecycle ----

    async fn open(&self, url: &str, opts: &Options, user: &str, pass: &str) -> Result<Reader> {
        self.set_phase(SessionPhase::Connecting);

        let (host, port, tls) = endpoint(url)?;
        let handshake_timeout = Duration::from_secs(opts.timeout.max(10));

        let tcp = timeout(handshake_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| anyhow!("connect to {}:{} timed out", host, port))?
            .with_context(|| format!("connect to {}:{} failed", host, port))?;

        let stream: Box<dyn NetStream> = if tls {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| anyhow!("invalid TLS server name '{}'", host))?;
            Box::new(
                timeout(handshake_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| anyhow!("TLS handshake with {} timed out", host))?
                    .context("TLS handshake failed")?,
            )
        } else {
            Box::new(tcp)
        };

        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        let mut reader = BufReader::new(read_half).lines();

        // subscribe
        self.send_line(&StratumRequest::subscribe().to_line()).await?;
        let result = self
            .await_response(&mut reader, ID_SUBSCRIBE, handshake_timeout)
            .await
            .context("mining.subscribe failed")?;
        self.apply_subscribe_result(&result)?;
        self.set_phase(SessionPhase::Subscribed);

        // authorize
        self.send_line(&StratumRequest::authorize(user, pass).to_line())
            .await?;
        let result = self
            .await_response(&mut reader, ID_AUTHORIZE, handshake_timeout)
            .await
            .context("mining.authorize failed")?;
        if result.as_bool() != Some(true) {
            return Err(anyhow!("pool refused worker authorization"));
        }
        self.set_phase(SessionPhase::Authorized);

        if opts.extranonce_subscribe {
            // best effort; late answers with id 3 are ignored by design
            let _ = self
                .send_line(&StratumRequest::extranonce_subscribe().to_line())
                .await;
        }

        self.set_phase(SessionPhase::Ready);
        Ok(reader)
    }

    /// Read lines until the response for `want_id` shows up, applying any
    /// server notifications that arrive first.
    async fn await_response(
        &self,
        reader: &mut Reader,
        want_id: u64,
        limit: Duration,
    ) -> Result<Value> {
        let deadline = Instant::now() + limit;
        loop {
            let remain = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| anyhow!("timed out waiting for response id {}", want_id))?;
            let line = timeout(remain, reader.next_line())
                .await
                .map_err(|_| anyhow!("timed out waiting for response id {}", want_id))?
                .context("socket error during handshake")?
                .ok_or_else(|| anyhow!("connection closed during handshake"))?;
            if line.trim().is_empty() {
                continue;
            }
            let msg = StratumLine::parse(&line)?;
            if let Some(method) = msg.method.clone() {
                self.apply_server_method(&method, msg.params.as_ref().unwrap_or(&Value::Null));
                continue;
            }
            if msg.id_u64() == Some(want_id) {
                if let Some(err) = msg.error.filter(|e| !e.is_null()) {
                    return Err(anyhow!("pool error: {}", err));
                }
                return Ok(msg.result.unwrap_or(Value::Null));
            }
            debug!("ignoring response id {:?} during handshake", msg.id);
        }
    }

    /// State-only part of server-method handling (no socket replies).
    fn apply_server_method(&self, method: &str, params: &Value) -> Action {
        match method {
            "mining.notify" => match parse_notify(params) {
                Ok(notify) => self.apply_notify(notify),
                Err(e) => warn!("bad mining.notify: {:#}", e),
            },
            "mining.set_difficulty" => match self.apply_set_difficulty(params) {
                Ok(diff) => info!("Stratum difficulty set to {}", diff),
                Err(e) => warn!("bad mining.set_difficulty: {:#}", e),
            },
            "mining.set_extranonce" => {
                if let Err(e) = self.apply_set_extranonce(params) {
                    warn!("bad mining.set_extranonce: {:#}", e);
                }
            }
            "client.reconnect" => {
                let host = params
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(Value::as_str);
                let port = params
                    .as_array()
                    .and_then(|a| a.get(1))
                    .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())));
                let url = match (host, port) {
                    (Some(h), Some(p)) if !h.is_empty() => {
                        Some(format!("stratum+tcp://{}:{}", h, p))
                    }
                    _ => None,
                };
                info!(
                    "Pool asked us to reconnect{}",
                    url.as_deref().map(|u| format!(" to {}", u)).unwrap_or_default()
                );
                return Action::Reconnect(url);
            }
            "client.show_message" => {
                if let Some(text) = params
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(Value::as_str)
                {
                    info!("MESSAGE FROM SERVER: {}", text);
                }
            }
            "client.get_version" => {
                // answered on the socket by the caller
            }
            other => debug!("unknown stratum notification '{}'", other),
        }
        Action::None
    }

    async fn handle_server_method(&self, method: &str, msg: &StratumLine) -> Action {
        let action = self.apply_server_method(method, msg.params.as_ref().unwrap_or(&Value::Null));
        if method == "client.get_version" {
            if let Some(id) = msg.id.clone() {
                let reply = json!({ "id": id, "result": USER_AGENT, "error": Value::Null });
                if let Err(e) = self.send_json(&reply).await {
                    debug!("get_version reply failed: {:#}", e);
                }
            }
        }
        action
    }

    /// Submit responses are matched by id; late subscribe/authorize
    /// answers (id < 4) are tolerated and dropped.
    fn handle_response(&self, ctx: &Ctx, msg: &StratumLine) {
        let Some(id) = msg.id_u64() else { return };
        if msg.result.is_none() && msg.error.is_none() {
            return;
        }
        if id < ID_SUBMIT {
            debug!("ignoring unsolicited response id {}", id);
            return;
        }
        if let Some(sent) = self.tv_submit.lock().expect("submit time poisoned").take() {
            let msec = sent.elapsed().as_millis() as u32;
            self.answer_msec.store(msec, Ordering::Relaxed);
            debug!("share answered in {} ms", msec);
        }
        let accepted = msg.result.as_ref().map(Value::as_bool) == Some(Some(true));
        crate::miner::share_result(ctx, accepted, msg.error_message().as_deref());
    }

    async fn disconnect(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(w) = writer.as_mut() {
            let _ = w.shutdown().await;
        }
        *writer = None;
        self.set_phase(SessionPhase::Disconnected);
    }

    /// Park the live connection for a later switch back to this pool.
    async fn suspend(&self, reader: Reader) -> Session {
        let writer = self.writer.lock().await.take();
        let job = std::mem::take(&mut *self.job.lock().expect("job poisoned"));
        let phase = self.phase();
        self.set_phase(SessionPhase::Disconnected);
        Session {
            reader,
            writer,
            job,
            phase,
        }
    }

    /// Reinstall a parked session; hands the read half back to the task.
    async fn restore(&self, session: Session) -> Option<Reader> {
        let has_writer = session.writer.is_some();
        *self.writer.lock().await = session.writer;
        *self.job.lock().expect("job poisoned") = session.job;
        self.set_phase(session.phase);
        has_writer.then_some(session.reader)
    }
}

/// Merkle fold digest for the family; SHA-256 variants are built in, the
/// heavy family resolves through the kernel registry.
fn merkle_hash(algo: Algorithm, data: &[u8]) -> Option<[u8; 32]> {
    match algo.spec().merkle {
        MerkleHash::Sha256d => {
            let first = Sha256::digest(data);
            Some(Sha256::digest(first).into())
        }
        MerkleHash::Sha256 => Some(Sha256::digest(data).into()),
        MerkleHash::Kernel => kernels::merkle_digest(algo, data),
    }
}

/// `mining.submit` positional params for a solved work unit.
pub fn submit_params(work: &Work, user: &str, algo: Algorithm) -> Vec<String> {
    let tail = work.job_id.get(8..).unwrap_or(&work.job_id).to_string();
    let mut params = vec![
        user.to_string(),
        tail,
        hex::encode(&work.xnonce2),
        format!("{:08x}", work.raw_word(17, algo)),
        format!("{:08x}", work.raw_word(19, algo)),
    ];
    if algo.spec().has_vote {
        params.push(format!("{:04x}", work.data[20] as u16));
    }
    params
}

fn endpoint(url: &str) -> Result<(String, u16, bool)> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| anyhow!("stratum URL '{}' has no scheme", url))?;
    let tls = match scheme {
        "stratum+tcp" => false,
        "stratum+tcps" => true,
        other => return Err(anyhow!("not a stratum scheme: '{}'", other)),
    };
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("stratum URL '{}' has no port", url))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("bad port in '{}'", url))?;
    Ok((host.to_string(), port, tls))
}

/// The stratum thread: blocks on its input queue while idle, runs a
/// session until a pool switch or a fatal error, and cleans up its
/// connection on every exit path.
pub async fn stratum_task(ctx: Arc<Ctx>, mut url_rx: mpsc::UnboundedReceiver<String>) {
    let state = &ctx.state;
    let client = &ctx.stratum;

    'wait_url: while let Some(mut url) = url_rx.recv().await {
        let pooln = state.cur_pool();

        if !state.pool_is_switching.load(Ordering::SeqCst) {
            info!("Starting on {}", url);
        }
        state.pool_is_switching.store(false, Ordering::SeqCst);

        let mut reader: Option<Reader> = None;
        if let Some(session) = ctx.pools.take_saved_session(pooln) {
            debug!("resuming stratum session of pool {}", pooln);
            reader = client.restore(session).await;
        }

        let mut failures: u32 = 0;
        loop {
            if state.aborted() {
                client.disconnect().await;
                return;
            }

            // a pool switch parks the session before anything else touches it
            if pooln != state.cur_pool() {
                park_session(&ctx, pooln, reader.take()).await;
                continue 'wait_url;
            }

            if state.stratum_need_reset.swap(false, Ordering::SeqCst) {
                let cur_url = state.creds.read().expect("creds poisoned").url.clone();
                if !cur_url.is_empty() && cur_url != url {
                    url = cur_url;
                    info!("Connection changed to {}", url);
                }
                client.disconnect().await;
                reader = None;
            }

            // (re)connect + subscribe + authorize
            while reader.is_none() {
                state.invalidate_work();
                state.restart_all();

                let (user, pass) = {
                    let creds = state.creds.read().expect("creds poisoned");
                    (creds.user.clone(), creds.pass.clone())
                };
                let opts = state.opts.read().expect("options poisoned").clone();

                match client.open(&url, &opts, &user, &pass).await {
                    Ok(r) => {
                        reader = Some(r);
                        failures = 0;
                    }
                    Err(e) => {
                        client.disconnect().await;
                        warn!("stratum: {:#}", e);
                        failures += 1;
                        if opts.retries >= 0 && failures > opts.retries as u32 {
                            if ctx.pools.num_pools() > 1 {
                                warn!("Stratum connect timeout, failover...");
                                ctx.pools.switch_next();
                            } else {
                                error!("stratum retries exhausted, terminating");
                                ctx.request_workio_abort();
                                return;
                            }
                        }
                        if pooln != state.cur_pool() {
                            continue 'wait_url;
                        }
                        if state.aborted() {
                            return;
                        }
                        info!("...retry after {} seconds", opts.fail_pause);
                        tokio::time::sleep(Duration::from_secs(opts.fail_pause)).await;
                    }
                }
            }

            if pooln != state.cur_pool() {
                park_session(&ctx, pooln, reader.take()).await;
                continue 'wait_url;
            }

            // publish the session job when it differs from the slot
            if client.has_job() {
                let job_id = client.job_id();
                let needs_publish = {
                    let slot = state.lock_slot();
                    slot.time == 0 || slot.work.job_id.get(8..) != Some(job_id.as_str())
                };
                if needs_publish {
                    let opts = state.opts.read().expect("options poisoned").clone();
                    if let Some(work) = client.gen_work(state.algo, &opts, pooln) {
                        let clean = {
                            let job = client.job.lock().expect("job poisoned");
                            job.clean
                        };
                        if opts.max_diff > 0.0 {
                            state.net_diff.set(calc_network_diff(&work, state.algo));
                        }
                        let height = work.height;
                        state.publish(work);
                        if clean {
                            if !state.quiet {
                                let net_diff = state.net_diff.get();
                                if net_diff > 0.0 {
                                    info!(
                                        "{} block {}, diff {:.2}",
                                        state.algo.name(),
                                        height,
                                        net_diff
                                    );
                                } else {
                                    info!("{} block {}", state.algo.name(), height);
                                }
                            }
                            state.restart_all();
                            if state.check_dups.load(Ordering::Relaxed) {
                                state
                                    .hashlog
                                    .lock()
                                    .expect("hashlog poisoned")
                                    .purge_old();
                            }
                            state.stats.lock().expect("stats poisoned").purge_old();
                        } else {
                            debug!(
                                "new stratum job {} for block {} (diff {})",
                                job_id,
                                height,
                                client.session_diff()
                            );
                        }
                    }
                    if pooln == state.cur_pool() {
                        state.pool_is_switching.store(false, Ordering::SeqCst);
                    }
                }
            }

            if pooln != state.cur_pool() {
                park_session(&ctx, pooln, reader.take()).await;
                continue 'wait_url;
            }

            // read one line, 120 s idle tolerance
            let line = {
                let r = reader.as_mut().expect("reader present");
                match timeout(Duration::from_secs(SOCKET_IDLE_SECS), r.next_line()).await {
                    Err(_) => {
                        error!("Stratum connection timed out");
                        None
                    }
                    Ok(Err(e)) => {
                        error!("stratum socket error: {}", e);
                        None
                    }
                    Ok(Ok(line)) => line,
                }
            };

            if pooln != state.cur_pool() {
                park_session(&ctx, pooln, reader.take()).await;
                continue 'wait_url;
            }

            let Some(line) = line else {
                client.disconnect().await;
                reader = None;
                error!("Stratum connection interrupted");
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }

            let msg = match StratumLine::parse(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("{:#}", e);
                    continue;
                }
            };

            if let Some(method) = msg.method.clone() {
                match client.handle_server_method(&method, &msg).await {
                    Action::Reconnect(new_url) => {
                        if let Some(new_url) = new_url {
                            url = new_url;
                        }
                        client.disconnect().await;
                        reader = None;
                    }
                    Action::None => {}
                }
            } else {
                client.handle_response(&ctx, &msg);
            }
        }
    }
}

async fn park_session(ctx: &Ctx, pooln: usize, reader: Option<Reader>) {
    if let Some(reader) = reader {
        let session = ctx.stratum.suspend(reader).await;
        ctx.pools.save_session(pooln, session);
        debug!("stratum session of pool {} suspended", pooln);
    } else {
        ctx.stratum.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Options;
    use serde_json::json;

    fn scenario_client() -> StratumClient {
        let client = StratumClient::new();
        client
            .apply_subscribe_result(&json!(["", "00000001", 4]))
            .unwrap();
        let notify = parse_notify(&json!([
            "job1",
            "00000000000000000000000000000000000000000000000000000000000000aa",
            "01000000",
            "ffffffff00",
            [],
            "00000002",
            "1d00ffff",
            "54a1b2c3",
            true
        ]))
        .unwrap();
        client.apply_notify(notify);
        client
            .apply_set_difficulty(&json!([1.0]))
            .unwrap();
        client
    }

    #[test]
    fn subscribe_result_sets_extranonce() {
        let client = scenario_client();
        let job = client.job.lock().unwrap();
        assert_eq!(job.xnonce1, vec![0x00, 0x00, 0x00, 0x01]);
        assert_eq!(job.xnonce2_size, 4);
        assert_eq!(job.xnonce2, vec![0, 0, 0, 0]);
    }

    #[test]
    fn notify_then_gen_work_builds_scenario_header() {
        let client = scenario_client();
        // the difficulty staged before the notify applies on the next one;
        // re-apply the same notify so diff 1.0 is live
        let notify = parse_notify(&json!([
            "job1",
            "00000000000000000000000000000000000000000000000000000000000000aa",
            "01000000",
            "ffffffff00",
            [],
            "00000002",
            "1d00ffff",
            "54a1b2c3",
            false
        ]))
        .unwrap();
        client.apply_notify(notify);

        let work = client
            .gen_work(Algorithm::X11, &Options::default(), 0)
            .unwrap();

        assert_eq!(work.data[17], 0x54a1b2c3);
        assert_eq!(work.data[18], 0x1d00ffff);
        assert_eq!(work.data[0], 0x00000002);
        assert_eq!(work.data[20], 0x8000_0000);
        assert_eq!(work.data[31], 0x280);
        // prevhash is stored as-is, little-endian words
        assert_eq!(work.data[8], u32::from_le_bytes([0, 0, 0, 0xaa]));
        // diff 1.0, divisor 1 target
        assert_eq!(work.target[6], 0xFFFF_0000);
        assert_eq!(work.job_id, format!("{:07x} job1", 0x4a1b2c3));
    }

    #[test]
    fn scenario_submit_params_are_golden() {
        let client = scenario_client();
        let mut work = client
            .gen_work(Algorithm::X11, &Options::default(), 0)
            .unwrap();
        work.data[19] = 0xdeadbeef;
        let params = submit_params(&work, "user", Algorithm::X11);
        assert_eq!(
            params,
            vec![
                "user".to_string(),
                "job1".to_string(),
                "00000000".to_string(),
                "54a1b2c3".to_string(),
                "deadbeef".to_string(),
            ]
        );
    }

    #[test]
    fn gen_work_advances_xnonce2() {
        let client = scenario_client();
        let opts = Options::default();
        let w1 = client.gen_work(Algorithm::X11, &opts, 0).unwrap();
        let w2 = client.gen_work(Algorithm::X11, &opts, 0).unwrap();
        assert_eq!(w1.xnonce2, vec![0, 0, 0, 0]);
        assert_eq!(w2.xnonce2, vec![1, 0, 0, 0]);
        // merkle root (and thus the header) changes with the extranonce
        assert_ne!(w1.data[9..17], w2.data[9..17]);
    }

    #[test]
    fn xnonce2_exhaustion_invalidates_job() {
        let client = scenario_client();
        {
            let mut job = client.job.lock().unwrap();
            job.xnonce2_size = 1;
            job.xnonce2 = vec![0xff];
        }
        let opts = Options::default();
        assert!(client.gen_work(Algorithm::X11, &opts, 0).is_some());
        // the counter wrapped: the job is gone until the next notify
        assert!(client.gen_work(Algorithm::X11, &opts, 0).is_none());
        assert!(!client.has_job());
    }

    #[test]
    fn set_difficulty_applies_on_next_notify() {
        let client = scenario_client();
        client.apply_set_difficulty(&json!([16.0])).unwrap();
        assert_eq!(client.session_diff(), 1.0);
        let notify = parse_notify(&json!([
            "job2",
            "00000000000000000000000000000000000000000000000000000000000000aa",
            "01000000",
            "ffffffff00",
            [],
            "00000002",
            "1d00ffff",
            "54a1b2c4",
            false
        ]))
        .unwrap();
        client.apply_notify(notify);
        assert_eq!(client.session_diff(), 16.0);

        let work = client
            .gen_work(Algorithm::X11, &Options::default(), 0)
            .unwrap();
        // diff 16 target: 0xFFFF0000 / 16 at word 6
        assert_eq!(work.target[6], 0x0FFF_F000);
    }

    #[test]
    fn set_extranonce_resets_counter() {
        let client = scenario_client();
        client
            .apply_set_extranonce(&json!(["0a0b", 2]))
            .unwrap();
        let job = client.job.lock().unwrap();
        assert_eq!(job.xnonce1, vec![0x0a, 0x0b]);
        assert_eq!(job.xnonce2_size, 2);
        assert_eq!(job.xnonce2, vec![0, 0]);
    }

    #[test]
    fn vote_word_rides_submit_for_heavy_family() {
        // the heavy family stores its header byte-swapped; submit hex must
        // come out unswapped, with the vote as a sixth parameter
        let mut work = Work::default();
        work.job_id = "0000000 jobh".to_string();
        work.xnonce2 = vec![0, 0];
        work.data[17] = 0x54a1b2c3_u32.swap_bytes();
        work.data[19] = 0xdeadbeef_u32.swap_bytes();
        work.data[20] = 0x1234_u32 << 16 | 0x0042;
        let params = submit_params(&work, "u", Algorithm::Heavy);
        assert_eq!(params.len(), 6);
        assert_eq!(params[1], "jobh");
        assert_eq!(params[3], "54a1b2c3");
        assert_eq!(params[4], "deadbeef");
        assert_eq!(params[5], "0042");

        // no vote parameter outside the family
        let mut plain = Work::default();
        plain.job_id = "0000000 job".to_string();
        plain.data[19] = 1;
        assert_eq!(submit_params(&plain, "u", Algorithm::Blake).len(), 5);
    }

    #[test]
    fn srvtime_diff_captured_once() {
        let client = scenario_client();
        let first = client.job.lock().unwrap().srvtime_diff;
        assert!(first.is_some());
        let notify = parse_notify(&json!([
            "job9",
            "00000000000000000000000000000000000000000000000000000000000000aa",
            "01000000",
            "ffffffff00",
            [],
            "00000002",
            "1d00ffff",
            "00000001",
            false
        ]))
        .unwrap();
        client.apply_notify(notify);
        assert_eq!(client.job.lock().unwrap().srvtime_diff, first);
    }

    #[test]
    fn endpoint_parses_schemes() {
        assert_eq!(
            endpoint("stratum+tcp://pool.example.com:3333").unwrap(),
            ("pool.example.com".to_string(), 3333, false)
        );
        assert_eq!(
            endpoint("stratum+tcps://pool.example.com:3443").unwrap(),
            ("pool.example.com".to_string(), 3443, true)
        );
        assert!(endpoint("http://x:1").is_err());
        assert!(endpoint("stratum+tcp://noport").is_err());
    }
}
