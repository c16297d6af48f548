//! Stratum line-protocol messages: newline-delimited JSON objects.
//!
//! Requests carry fixed ids so responses can be matched without a pending
//! map: subscribe=1, authorize=2, extranonce.subscribe=3, submit=4.
//! Anything below the submit id that arrives unsolicited is ignored.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const ID_SUBSCRIBE: u64 = 1;
pub const ID_AUTHORIZE: u64 = 2;
pub const ID_EXTRANONCE: u64 = 3;
pub const ID_SUBMIT: u64 = 4;

pub const USER_AGENT: &str = concat!("multiminer/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize)]
pub struct StratumRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl StratumRequest {
    pub fn subscribe() -> Self {
        Self {
            id: ID_SUBSCRIBE,
            method: "mining.subscribe".to_string(),
            params: json!([USER_AGENT]),
        }
    }

    pub fn authorize(user: &str, pass: &str) -> Self {
        Self {
            id: ID_AUTHORIZE,
            method: "mining.authorize".to_string(),
            params: json!([user, pass]),
        }
    }

    pub fn extranonce_subscribe() -> Self {
        Self {
            id: ID_EXTRANONCE,
            method: "mining.extranonce.subscribe".to_string(),
            params: json!([]),
        }
    }

    /// `mining.submit` with the positional share fields; `nvote` rides as a
    /// sixth parameter for the vote-carrying family.
    pub fn submit(params: Vec<String>) -> Self {
        Self {
            id: ID_SUBMIT,
            method: "mining.submit".to_string(),
            params: Value::Array(params.into_iter().map(Value::String).collect()),
        }
    }

    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).expect("request serializes");
        line.push('\n');
        line
    }
}

/// One incoming line, loosely typed: a server request when `method` is
/// present, otherwise a response matched by `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct StratumLine {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl StratumLine {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).with_context(|| format!("bad stratum line: {}", line.trim()))
    }

    pub fn id_u64(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Reject reason out of `error: [code, message, ...]`.
    pub fn error_message(&self) -> Option<String> {
        self.error
            .as_ref()
            .and_then(Value::as_array)
            .and_then(|arr| arr.get(1))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Parsed `mining.notify` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub job_id: String,
    pub prevhash: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle: Vec<[u8; 32]>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean: bool,
    /// Reward vote word some heavy-family pools append.
    pub nreward: u16,
}

fn hex_param(params: &[Value], idx: usize, what: &str) -> Result<Vec<u8>> {
    let s = params
        .get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("notify param {} ({}) missing", idx, what))?;
    hex::decode(s).with_context(|| format!("notify {} is not hex", what))
}

fn word_param(params: &[Value], idx: usize, what: &str) -> Result<u32> {
    let s = params
        .get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("notify param {} ({}) missing", idx, what))?;
    u32::from_str_radix(s, 16).with_context(|| format!("notify {} is not a hex word", what))
}

pub fn parse_notify(params: &Value) -> Result<Notify> {
    let params = params
        .as_array()
        .ok_or_else(|| anyhow!("notify params is not an array"))?;

    let job_id = params
        .get(0)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("notify job id missing"))?
        .to_string();

    let prev = hex_param(params, 1, "prevhash")?;
    let prevhash: [u8; 32] = prev
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("notify prevhash is {} bytes, want 32", prev.len()))?;

    let coinbase1 = hex_param(params, 2, "coinbase1")?;
    let coinbase2 = hex_param(params, 3, "coinbase2")?;

    let mut merkle = Vec::new();
    if let Some(branches) = params.get(4).and_then(Value::as_array) {
        for (i, b) in branches.iter().enumerate() {
            let bytes = b
                .as_str()
                .map(hex::decode)
                .transpose()
                .ok()
                .flatten()
                .ok_or_else(|| anyhow!("merkle branch {} is not hex", i))?;
            let hash: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("merkle branch {} is not 32 bytes", i))?;
            merkle.push(hash);
        }
    }

    let version = word_param(params, 5, "version")?;
    let nbits = word_param(params, 6, "nbits")?;
    let ntime = word_param(params, 7, "ntime")?;
    let clean = params.get(8).and_then(Value::as_bool).unwrap_or(false);
    let nreward = params
        .get(9)
        .and_then(Value::as_str)
        .and_then(|s| u16::from_str_radix(s, 16).ok())
        .unwrap_or(0);

    Ok(Notify {
        job_id,
        prevhash,
        coinbase1,
        coinbase2,
        merkle,
        version,
        nbits,
        ntime,
        clean,
        nreward,
    })
}

/// BIP34-style block height out of the coinbase script: skip to the end of
/// the 0xff run that terminates the input marker, then read the pushed
/// little-endian height.
pub fn block_height(coinbase: &[u8]) -> u32 {
    let start = 32.min(coinbase.len());
    let window = &coinbase[start..coinbase.len().min(start + 128)];

    let mut i = 0;
    while i < window.len() && window[i] != 0xff {
        i += 1;
    }
    let run_start = i;
    while i < window.len() && window[i] == 0xff {
        i += 1;
    }
    if i < run_start + 2 || i + 4 > window.len() {
        return 0;
    }

    // skip the script-length byte; the height push follows it
    let hlen = window[i + 1] as usize;
    let p = &window[i + 2..];
    if p.len() < 2 {
        return 0;
    }
    let mut height = u16::from_le_bytes([p[0], p[1]]) as u32;
    match hlen {
        4 if p.len() >= 4 => height += 0x10000 * u16::from_le_bytes([p[2], p[3]]) as u32,
        3 if p.len() >= 3 => height += 0x10000 * p[2] as u32,
        _ => {}
    }
    height
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lines_have_fixed_ids() {
        let line = StratumRequest::subscribe().to_line();
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["method"], "mining.subscribe");

        let line = StratumRequest::authorize("user", "x").to_line();
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["id"], 2);
        assert_eq!(parsed["params"][0], "user");

        let line = StratumRequest::submit(vec!["a".into(), "b".into()]).to_line();
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["id"], 4);
        assert_eq!(parsed["method"], "mining.submit");
    }

    #[test]
    fn notify_parses_scenario_fields() {
        let params = serde_json::json!([
            "job1",
            "00000000000000000000000000000000000000000000000000000000000000aa",
            "01000000",
            "ffffffff00",
            [],
            "00000002",
            "1d00ffff",
            "54a1b2c3",
            true
        ]);
        let notify = parse_notify(&params).unwrap();
        assert_eq!(notify.job_id, "job1");
        assert_eq!(notify.version, 2);
        assert_eq!(notify.nbits, 0x1d00ffff);
        assert_eq!(notify.ntime, 0x54a1b2c3);
        assert!(notify.clean);
        assert_eq!(notify.prevhash[31], 0xaa);
        assert!(notify.merkle.is_empty());
    }

    #[test]
    fn notify_rejects_short_prevhash() {
        let params = serde_json::json!([
            "job1", "0000", "00", "00", [], "00000002", "1d00ffff", "54a1b2c3", true
        ]);
        assert!(parse_notify(&params).is_err());
    }

    #[test]
    fn error_message_is_second_element() {
        let line =
            StratumLine::parse(r#"{"id":4,"result":false,"error":[23,"low difficulty share",null]}"#)
                .unwrap();
        assert_eq!(line.error_message().as_deref(), Some("low difficulty share"));
        assert_eq!(line.id_u64(), Some(4));
    }

    #[test]
    fn coinbase_height_parses_after_ff_run() {
        // 32 filler bytes, the 0xff input marker, a script length, then the
        // pushed height 0x0398 (3-byte push)
        let mut cb = vec![0u8; 32];
        cb.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        cb.push(0x2a); // script length
        cb.push(3); // push length
        cb.extend_from_slice(&[0x98, 0x03, 0x00]);
        assert_eq!(block_height(&cb), 0x0398);
    }

    #[test]
    fn coinbase_height_zero_without_marker() {
        assert_eq!(block_height(&[0u8; 64]), 0);
    }
}
