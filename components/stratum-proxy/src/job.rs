//! One pool broadcast and the per-job state the getwork translator mutates.

use crate::constants::GETWORK_DATA_PADDING;
use crate::errors::ProtocolError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use stratum_proxy_hashes::sha256d;

/// A mining job built from a `mining.notify` broadcast. The broadcast data is
/// immutable; only the extranonce2 counter and the merkle bookkeeping move.
pub struct Job {
    /// Opaque pool job id, echoed back on submit.
    pub job_id: String,
    /// Previous block hash in the pool's hex form (word-reversed relative to
    /// raw bytes); spliced verbatim into serialized headers.
    pub prevhash: String,
    /// Coinbase halves straddling the extranonce.
    pub coinb1: Vec<u8>,
    pub coinb2: Vec<u8>,
    /// Merkle authentication path from the coinbase leaf to the root.
    pub merkle_branch: Vec<[u8; 32]>,
    /// 4-byte header fields in the hex form the pool sent them.
    pub version: String,
    pub nbits: String,
    /// Pool ntime minus local wall clock at receipt; projects ntime forward.
    pub ntime_delta: i64,

    extranonce2_counter: Mutex<u32>,
    merkle_to_extranonce2: Mutex<HashMap<String, u32>>,
}

fn param_str<'a>(params: &'a [Value], idx: usize, what: &'static str) -> Result<&'a str, ProtocolError> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::malformed("mining.notify", format!("param {idx} ({what}) must be a string")))
}

fn decode_hex(what: &'static str, hex_str: &str) -> Result<Vec<u8>, ProtocolError> {
    hex::decode(hex_str).map_err(|_| ProtocolError::BadHex { what })
}

fn decode_hash32(what: &'static str, hex_str: &str) -> Result<[u8; 32], ProtocolError> {
    let bytes = decode_hex(what, hex_str)?;
    bytes
        .try_into()
        .map_err(|_| ProtocolError::malformed(what, "expected 32 bytes"))
}

pub fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

impl Job {
    /// Build a job from the `mining.notify` 9-tuple
    /// `[job_id, prevhash, coinb1, coinb2, merkle_branch, version, nbits,
    /// ntime, clean_jobs]`. Returns the job and the clean flag.
    pub fn from_notify(params: &[Value]) -> Result<(Job, bool), ProtocolError> {
        if params.len() < 9 {
            return Err(ProtocolError::malformed(
                "mining.notify",
                format!("expected 9 params, got {}", params.len()),
            ));
        }

        let job_id = param_str(params, 0, "job_id")?.to_string();
        let prevhash = param_str(params, 1, "prevhash")?.to_string();
        if prevhash.len() != 64 {
            return Err(ProtocolError::malformed("mining.notify", "prevhash must be 64 hex chars"));
        }
        decode_hex("prevhash", &prevhash)?;

        let coinb1 = decode_hex("coinb1", param_str(params, 2, "coinb1")?)?;
        let coinb2 = decode_hex("coinb2", param_str(params, 3, "coinb2")?)?;

        let branch_values = params
            .get(4)
            .and_then(Value::as_array)
            .ok_or_else(|| ProtocolError::malformed("mining.notify", "merkle_branch must be an array"))?;
        let mut merkle_branch = Vec::with_capacity(branch_values.len());
        for entry in branch_values {
            let entry = entry
                .as_str()
                .ok_or_else(|| ProtocolError::malformed("merkle_branch", "entries must be hex strings"))?;
            merkle_branch.push(decode_hash32("merkle_branch", entry)?);
        }

        let version = param_str(params, 5, "version")?.to_string();
        let nbits = param_str(params, 6, "nbits")?.to_string();
        if version.len() != 8 || nbits.len() != 8 {
            return Err(ProtocolError::malformed("mining.notify", "version/nbits must be 8 hex chars"));
        }

        let ntime_str = param_str(params, 7, "ntime")?;
        let ntime = i64::from_str_radix(ntime_str, 16)
            .map_err(|_| ProtocolError::BadHex { what: "ntime" })?;

        let clean_jobs = params
            .get(8)
            .and_then(Value::as_bool)
            .ok_or_else(|| ProtocolError::malformed("mining.notify", "clean_jobs must be a bool"))?;

        let job = Job {
            job_id,
            prevhash,
            coinb1,
            coinb2,
            merkle_branch,
            version,
            nbits,
            ntime_delta: ntime - now_unix(),
            extranonce2_counter: Mutex::new(0),
            merkle_to_extranonce2: Mutex::new(HashMap::new()),
        };
        Ok((job, clean_jobs))
    }

    /// Next extranonce2 for this job; the first issued value is 1.
    pub fn next_extranonce2(&self) -> u32 {
        let mut counter = self.extranonce2_counter.lock();
        *counter = counter.wrapping_add(1);
        *counter
    }

    /// Coinbase transaction with the full extranonce spliced in.
    pub fn build_coinbase(&self, extranonce: &[u8]) -> Vec<u8> {
        let mut coinbase = Vec::with_capacity(self.coinb1.len() + extranonce.len() + self.coinb2.len());
        coinbase.extend_from_slice(&self.coinb1);
        coinbase.extend_from_slice(extranonce);
        coinbase.extend_from_slice(&self.coinb2);
        coinbase
    }

    /// Walk the merkle branch from the coinbase leaf, left-combining with
    /// double SHA-256.
    pub fn merkle_root(&self, coinbase_hash: [u8; 32]) -> [u8; 32] {
        let mut root = coinbase_hash;
        for branch in &self.merkle_branch {
            let mut concat = [0u8; 64];
            concat[..32].copy_from_slice(&root);
            concat[32..].copy_from_slice(branch);
            root = sha256d(&concat);
        }
        root
    }

    /// Serialize the 80-byte header around a reversed merkle root and append
    /// the fixed getwork padding, yielding the 128-byte `data` hex.
    pub fn serialize_header(&self, merkle_root_hex: &str, ntime: u32, nonce: u32) -> String {
        let mut header = String::with_capacity(256);
        header.push_str(&self.version);
        header.push_str(&self.prevhash);
        header.push_str(merkle_root_hex);
        header.push_str(&hex::encode(ntime.to_be_bytes()));
        header.push_str(&self.nbits);
        header.push_str(&hex::encode(nonce.to_be_bytes()));
        header.push_str(GETWORK_DATA_PADDING);
        header
    }

    /// Remember which extranonce2 produced a merkle root.
    pub fn register_merkle(&self, merkle_hex: &str, extranonce2: u32) {
        self.merkle_to_extranonce2.lock().insert(merkle_hex.to_string(), extranonce2);
    }

    /// Extranonce2 that produced the given merkle root, if this job did.
    pub fn extranonce2_for_merkle(&self, merkle_hex: &str) -> Option<u32> {
        self.merkle_to_extranonce2.lock().get(merkle_hex).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notify_params() -> Vec<Value> {
        json!([
            "bf",
            "4d16b6f85af6e2198f44ae2a6de67f78487ae5611b77c6c0440b921e00000000",
            "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff20020862062f503253482f04b8864e5008",
            "072f736c7573682f000000000100f2052a010000001976a914d23fcdf86f7e756a64a7a9688ef9903327048ed988ac00000000",
            [],
            "00000002",
            "1c2ac4af",
            "504e86b9",
            false
        ])
        .as_array()
        .unwrap()
        .clone()
    }

    #[test]
    fn builds_from_well_formed_notify() {
        let (job, clean) = Job::from_notify(&notify_params()).unwrap();
        assert!(!clean);
        assert_eq!(job.job_id, "bf");
        assert_eq!(job.version, "00000002");
        assert_eq!(job.nbits, "1c2ac4af");
        assert!(job.merkle_branch.is_empty());
        // ntime 0x504e86b9 is long past; the delta must be hugely negative.
        assert!(job.ntime_delta < 0);
    }

    #[test]
    fn rejects_malformed_notifies() {
        let mut short = notify_params();
        short.truncate(5);
        assert!(Job::from_notify(&short).is_err());

        let mut bad_prevhash = notify_params();
        bad_prevhash[1] = json!("abcd");
        assert!(Job::from_notify(&bad_prevhash).is_err());

        let mut bad_branch = notify_params();
        bad_branch[4] = json!(["zz"]);
        assert!(Job::from_notify(&bad_branch).is_err());

        let mut bad_clean = notify_params();
        bad_clean[8] = json!("yes");
        assert!(Job::from_notify(&bad_clean).is_err());
    }

    #[test]
    fn extranonce2_counter_starts_at_one_and_increases() {
        let (job, _) = Job::from_notify(&notify_params()).unwrap();
        assert_eq!(job.next_extranonce2(), 1);
        assert_eq!(job.next_extranonce2(), 2);
        assert_eq!(job.next_extranonce2(), 3);
    }

    #[test]
    fn coinbase_splices_extranonce_between_halves() {
        let (job, _) = Job::from_notify(&notify_params()).unwrap();
        let coinbase = job.build_coinbase(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(coinbase.len(), job.coinb1.len() + 4 + job.coinb2.len());
        let splice = &coinbase[job.coinb1.len()..job.coinb1.len() + 4];
        assert_eq!(splice, &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn merkle_root_of_empty_branch_is_the_leaf() {
        let (job, _) = Job::from_notify(&notify_params()).unwrap();
        let leaf = [7u8; 32];
        assert_eq!(job.merkle_root(leaf), leaf);
    }

    #[test]
    fn merkle_root_left_combines() {
        let mut params = notify_params();
        let branch = [0x11u8; 32];
        params[4] = json!([hex::encode(branch)]);
        let (job, _) = Job::from_notify(&params).unwrap();

        let leaf = [7u8; 32];
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&leaf);
        concat[32..].copy_from_slice(&branch);
        assert_eq!(job.merkle_root(leaf), sha256d(&concat));
    }

    #[test]
    fn header_serialization_layout() {
        let (job, _) = Job::from_notify(&notify_params()).unwrap();
        let merkle = "aa".repeat(32);
        let header = job.serialize_header(&merkle, 0x504e86b9, 0);

        assert_eq!(header.len(), 256);
        assert_eq!(&header[..8], "00000002");
        assert_eq!(&header[8..72], job.prevhash);
        assert_eq!(&header[72..136], merkle);
        assert_eq!(&header[136..144], "504e86b9");
        assert_eq!(&header[144..152], "1c2ac4af");
        assert_eq!(&header[152..160], "00000000");
        assert_eq!(&header[160..], GETWORK_DATA_PADDING);
    }
}
