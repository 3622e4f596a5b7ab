//! The job registry: every in-flight pool job, the current difficulty and
//! target, the getwork translation, and the long-poll wakeup event.
//!
//! One mutex serializes `add_template`, `getwork` and submit decomposition,
//! so a getwork response always sees a coherent (job, extranonce1,
//! extranonce2_size, target) snapshot. Nothing awaits under the lock; the
//! upstream `mining.submit` call happens in the caller after the registry
//! has decomposed the share.

use crate::constants::{GETWORK_HASH1, GETWORK_OLD_TARGET};
use crate::errors::{GetworkError, ProtocolError};
use crate::extranonce::pad_extranonce2;
use crate::job::{now_unix, Job};
use num_bigint::BigUint;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use triggered::{trigger, Listener, Trigger};

use stratum_proxy_hashes::{
    difficulty_to_target, midstate, reverse_hash32, sha256d, swap_words, target_to_hex, uint256_le,
    DIFF1_SCRYPT, DIFF1_SHA256,
};

/// A getwork response body.
#[derive(Debug, Clone, Serialize)]
pub struct GetworkJob {
    pub data: String,
    pub hash1: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midstate: Option<String>,
}

/// What to do with a submitted getwork header.
#[derive(Debug)]
pub enum SubmitDecision {
    /// Hash above the local target: answer `true`, forward nothing. Classic
    /// behavior so diff-1 miners aren't punished when the pool difficulty is
    /// higher.
    BelowTarget,
    /// Unknown merkle root (job superseded or never ours): answer `false`.
    JobNotFound,
    /// Share passes the local check; forward these parts upstream.
    Forward(SubmitParts),
}

/// The `mining.submit` parameters recovered from a getwork header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParts {
    pub job_id: String,
    pub extranonce2_hex: String,
    pub ntime_hex: String,
    pub nonce_hex: String,
}

/// Behavior flags captured at startup.
#[derive(Debug, Clone, Default)]
pub struct RegistryFlags {
    pub scrypt_target: bool,
    pub no_midstate: bool,
    pub real_target: bool,
    pub use_old_target: bool,
    pub blocknotify_cmd: Option<String>,
}

struct RegistryState {
    jobs: Vec<Arc<Job>>,
    last_job: Option<Arc<Job>>,
    extranonce1: Vec<u8>,
    extranonce2_size: usize,
    difficulty: f64,
    target: BigUint,
    target_hex: String,
    merkle_to_job: HashMap<String, Weak<Job>>,
}

struct OnBlock {
    trigger: Trigger,
    listener: Listener,
}

pub struct JobRegistry {
    state: Mutex<RegistryState>,
    on_block: Mutex<OnBlock>,
    flags: RegistryFlags,
    /// Hex of the diff-1 target, the default getwork `target` field.
    target1_hex: &'static str,
}

impl JobRegistry {
    pub fn new(flags: RegistryFlags) -> Self {
        let scrypt = flags.scrypt_target;
        let target = difficulty_to_target(1.0, scrypt);
        let target_hex = target_to_hex(&target);
        let (t, l) = trigger();
        Self {
            state: Mutex::new(RegistryState {
                jobs: Vec::new(),
                last_job: None,
                extranonce1: Vec::new(),
                extranonce2_size: 0,
                difficulty: 1.0,
                target,
                target_hex,
                merkle_to_job: HashMap::new(),
            }),
            on_block: Mutex::new(OnBlock { trigger: t, listener: l }),
            target1_hex: if scrypt { DIFF1_SCRYPT } else { DIFF1_SHA256 },
            flags,
        }
    }

    /// Pool-assigned extranonce parameters, set on subscribe and on
    /// `mining.set_extranonce`.
    pub fn set_extranonce(&self, extranonce1_hex: &str, extranonce2_size: usize) -> Result<(), ProtocolError> {
        let extranonce1 =
            hex::decode(extranonce1_hex).map_err(|_| ProtocolError::BadHex { what: "extranonce1" })?;
        let mut state = self.state.lock();
        state.extranonce1 = extranonce1;
        state.extranonce2_size = extranonce2_size;
        Ok(())
    }

    /// `(extranonce1_hex, extranonce2_size)` once the pool assigned them.
    pub fn extranonce(&self) -> Option<(String, usize)> {
        let state = self.state.lock();
        if state.extranonce1.is_empty() && state.extranonce2_size == 0 {
            return None;
        }
        Some((hex::encode(&state.extranonce1), state.extranonce2_size))
    }

    pub fn set_difficulty(&self, difficulty: f64) {
        let target = difficulty_to_target(difficulty, self.flags.scrypt_target);
        let mut state = self.state.lock();
        state.target_hex = target_to_hex(&target);
        state.target = target;
        state.difficulty = difficulty;
    }

    pub fn difficulty(&self) -> f64 {
        self.state.lock().difficulty
    }

    pub fn target_hex(&self) -> String {
        self.state.lock().target_hex.clone()
    }

    pub fn has_job(&self) -> bool {
        self.state.lock().last_job.is_some()
    }

    /// Store a job from a pool broadcast. On `clean_jobs` the previous job
    /// set and its merkle bookkeeping are flushed first, then every parked
    /// long-poll caller is woken exactly once.
    pub fn add_template(&self, job: Job, clean_jobs: bool) {
        let prevhash = job.prevhash.clone();
        {
            let mut state = self.state.lock();
            if clean_jobs {
                // Outstanding getwork shares against the old jobs become
                // unresolvable and will be rejected as "job not found".
                state.jobs.clear();
                state.merkle_to_job.clear();
            }
            let job = Arc::new(job);
            state.jobs.push(Arc::clone(&job));
            state.last_job = Some(job);
        }

        if clean_jobs {
            self.rotate_and_fire();
            self.spawn_blocknotify(&prevhash);
        }
    }

    /// Listener for the next new-block event. Handed to long-poll parkers;
    /// each fire wakes exactly the listeners taken before it.
    pub fn on_block_listener(&self) -> Listener {
        self.on_block.lock().listener.clone()
    }

    /// Best-effort wake of all parked long polls (shutdown path).
    pub fn wake_long_polls(&self) {
        self.rotate_and_fire();
    }

    fn rotate_and_fire(&self) {
        let (t, l) = trigger();
        let old = {
            let mut on_block = self.on_block.lock();
            std::mem::replace(&mut *on_block, OnBlock { trigger: t, listener: l })
        };
        old.trigger.trigger();
    }

    fn spawn_blocknotify(&self, prevhash: &str) {
        if let Some(cmd) = &self.flags.blocknotify_cmd {
            let cmd = cmd.replace("%s", prevhash);
            debug!("spawning blocknotify command: {cmd}");
            match tokio::process::Command::new("sh").arg("-c").arg(&cmd).spawn() {
                Ok(_) => {}
                Err(err) => warn!("failed to spawn blocknotify command: {err}"),
            }
        }
    }

    /// Construct a getwork response for a legacy miner.
    pub fn getwork(&self, no_midstate: bool) -> Result<GetworkJob, GetworkError> {
        let mut state = self.state.lock();
        let job = state.last_job.as_ref().ok_or(GetworkError::NoJob)?.clone();
        if state.extranonce1.is_empty() && state.extranonce2_size == 0 {
            return Err(GetworkError::NoExtranonce);
        }

        let extranonce2 = job.next_extranonce2();
        let mut full_extranonce = state.extranonce1.clone();
        full_extranonce.extend_from_slice(&pad_extranonce2(extranonce2, state.extranonce2_size));

        let coinbase = job.build_coinbase(&full_extranonce);
        let merkle_root = job.merkle_root(sha256d(&coinbase));
        // The reversed form is what appears in the serialized header and is
        // the key submitted headers are looked up by.
        let merkle_hex = hex::encode(reverse_hash32(&merkle_root));

        let ntime = (now_unix() + job.ntime_delta) as u32;
        let data = job.serialize_header(&merkle_hex, ntime, 0);

        job.register_merkle(&merkle_hex, extranonce2);

        let target = if self.flags.use_old_target {
            GETWORK_OLD_TARGET.to_string()
        } else if self.flags.real_target {
            state.target_hex.clone()
        } else {
            self.target1_hex.to_string()
        };

        let midstate_hex = if no_midstate || self.flags.no_midstate {
            None
        } else {
            // First 64 bytes of the header, hex we serialized ourselves.
            let mut header64 = [0u8; 64];
            match hex::decode_to_slice(&data[..128], &mut header64) {
                Ok(()) => Some(hex::encode(midstate(&header64))),
                Err(_) => None,
            }
        };

        state.merkle_to_job.insert(merkle_hex, Arc::downgrade(&job));

        Ok(GetworkJob {
            data,
            hash1: GETWORK_HASH1.to_string(),
            target,
            midstate: midstate_hex,
        })
    }

    /// Check a submitted header against the local target and map it back to
    /// the job and extranonce2 that produced it.
    pub fn submit_parts(&self, header_hex: &str) -> Result<SubmitDecision, ProtocolError> {
        // Drop the getwork padding.
        let header_hex = header_hex.get(..160).ok_or_else(|| {
            ProtocolError::malformed("share header", "shorter than 160 hex chars")
        })?;
        let header = hex::decode(header_hex).map_err(|_| ProtocolError::BadHex { what: "share header" })?;

        let hash = sha256d(&swap_words(&header));
        let hash_int = uint256_le(&hash);

        let state = self.state.lock();
        if hash_int > state.target {
            debug!("share is below the local target, not forwarding");
            return Ok(SubmitDecision::BelowTarget);
        }

        let merkle_hex = header_hex[72..136].to_lowercase();
        let job = match state.merkle_to_job.get(&merkle_hex).and_then(Weak::upgrade) {
            Some(job) => job,
            None => {
                info!("share references an unknown or superseded job");
                return Ok(SubmitDecision::JobNotFound);
            }
        };
        let extranonce2 = match job.extranonce2_for_merkle(&merkle_hex) {
            Some(e2) => e2,
            None => return Ok(SubmitDecision::JobNotFound),
        };

        Ok(SubmitDecision::Forward(SubmitParts {
            job_id: job.job_id.clone(),
            extranonce2_hex: hex::encode(pad_extranonce2(extranonce2, state.extranonce2_size)),
            ntime_hex: header_hex[136..144].to_string(),
            nonce_hex: header_hex[152..160].to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notify_params(job_id: &str, clean: bool) -> Vec<serde_json::Value> {
        json!([
            job_id,
            "4d16b6f85af6e2198f44ae2a6de67f78487ae5611b77c6c0440b921e00000000",
            "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff20020862062f503253482f04b8864e5008",
            "072f736c7573682f000000000100f2052a010000001976a914d23fcdf86f7e756a64a7a9688ef9903327048ed988ac00000000",
            [],
            "00000002",
            "1c2ac4af",
            format!("{:08x}", crate::job::now_unix()),
            clean
        ])
        .as_array()
        .unwrap()
        .clone()
    }

    fn registry_with_job(flags: RegistryFlags) -> JobRegistry {
        let registry = JobRegistry::new(flags);
        registry.set_extranonce("a0014b", 4).unwrap();
        let (job, clean) = Job::from_notify(&notify_params("j1", true)).unwrap();
        registry.add_template(job, clean);
        registry
    }

    #[test]
    fn last_job_tracks_newest_and_clean_flushes() {
        let registry = JobRegistry::new(RegistryFlags::default());
        registry.set_extranonce("00", 4).unwrap();

        let (a, _) = Job::from_notify(&notify_params("a", false)).unwrap();
        registry.add_template(a, false);
        let (b, _) = Job::from_notify(&notify_params("b", false)).unwrap();
        registry.add_template(b, false);
        {
            let state = registry.state.lock();
            assert_eq!(state.jobs.len(), 2);
            assert_eq!(state.last_job.as_ref().unwrap().job_id, "b");
        }

        let (c, _) = Job::from_notify(&notify_params("c", true)).unwrap();
        registry.add_template(c, true);
        let state = registry.state.lock();
        assert_eq!(state.jobs.len(), 1);
        assert_eq!(state.last_job.as_ref().unwrap().job_id, "c");
    }

    #[test]
    fn getwork_yields_unique_increasing_extranonces_and_roots() {
        let registry = registry_with_job(RegistryFlags::default());
        let one = registry.getwork(true).unwrap();
        let two = registry.getwork(true).unwrap();

        assert_eq!(one.data.len(), 256);
        assert_eq!(one.hash1, GETWORK_HASH1);
        // Distinct extranonce2 values produce distinct merkle roots.
        assert_ne!(one.data[72..136], two.data[72..136]);

        let state = registry.state.lock();
        assert_eq!(state.merkle_to_job.len(), 2);
    }

    #[test]
    fn getwork_without_job_errors() {
        let registry = JobRegistry::new(RegistryFlags::default());
        registry.set_extranonce("00", 4).unwrap();
        assert!(matches!(registry.getwork(true), Err(GetworkError::NoJob)));
    }

    #[test]
    fn getwork_target_selection() {
        let default_target = registry_with_job(RegistryFlags::default());
        default_target.set_difficulty(512.0);
        assert_eq!(default_target.getwork(true).unwrap().target, DIFF1_SHA256);

        let real = registry_with_job(RegistryFlags { real_target: true, ..Default::default() });
        real.set_difficulty(16.0);
        let job = real.getwork(true).unwrap();
        assert_eq!(job.target, target_to_hex(&difficulty_to_target(16.0, false)));

        let old = registry_with_job(RegistryFlags { use_old_target: true, ..Default::default() });
        assert_eq!(old.getwork(true).unwrap().target, GETWORK_OLD_TARGET);
    }

    #[test]
    fn midstate_follows_flags_and_request() {
        let registry = registry_with_job(RegistryFlags::default());
        assert!(registry.getwork(false).unwrap().midstate.is_some());
        assert!(registry.getwork(true).unwrap().midstate.is_none());

        let disabled = registry_with_job(RegistryFlags { no_midstate: true, ..Default::default() });
        assert!(disabled.getwork(false).unwrap().midstate.is_none());
    }

    #[test]
    fn midstate_matches_first_header_block() {
        let registry = registry_with_job(RegistryFlags::default());
        let work = registry.getwork(false).unwrap();
        let mut header64 = [0u8; 64];
        hex::decode_to_slice(&work.data[..128], &mut header64).unwrap();
        assert_eq!(work.midstate.unwrap(), hex::encode(midstate(&header64)));
    }

    #[test]
    fn submit_roundtrip_recovers_extranonce2() {
        let registry = registry_with_job(RegistryFlags::default());
        // A difficulty low enough that every hash clears the local target.
        registry.set_difficulty(1e-12);

        let work = registry.getwork(true).unwrap();
        match registry.submit_parts(&work.data).unwrap() {
            SubmitDecision::Forward(parts) => {
                assert_eq!(parts.job_id, "j1");
                assert_eq!(parts.extranonce2_hex, "00000001");
                assert_eq!(parts.ntime_hex, work.data[136..144].to_string());
                assert_eq!(parts.nonce_hex, "00000000");
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[test]
    fn submit_under_local_difficulty_is_silently_accepted() {
        let registry = registry_with_job(RegistryFlags::default());
        // Keep the sha256 diff-1 target: a random header hash has 32 leading
        // zero bits with probability 2^-32, so this reliably lands above.
        let work = registry.getwork(true).unwrap();
        assert!(matches!(registry.submit_parts(&work.data).unwrap(), SubmitDecision::BelowTarget));
    }

    #[test]
    fn submit_after_clean_jobs_is_job_not_found() {
        let registry = registry_with_job(RegistryFlags::default());
        registry.set_difficulty(1e-12);
        let stale = registry.getwork(true).unwrap();

        let (fresh, clean) = Job::from_notify(&notify_params("j2", true)).unwrap();
        registry.add_template(fresh, clean);

        assert!(matches!(registry.submit_parts(&stale.data).unwrap(), SubmitDecision::JobNotFound));
    }

    #[test]
    fn submit_rejects_garbage_headers() {
        let registry = registry_with_job(RegistryFlags::default());
        assert!(registry.submit_parts("too-short").is_err());
        assert!(registry.submit_parts(&"zz".repeat(80)).is_err());
    }

    #[tokio::test]
    async fn clean_jobs_wakes_every_parked_listener_once() {
        let registry = std::sync::Arc::new(JobRegistry::new(RegistryFlags::default()));
        registry.set_extranonce("00", 4).unwrap();

        let mut parked = Vec::new();
        for _ in 0..8 {
            let listener = registry.on_block_listener();
            parked.push(tokio::spawn(async move { listener.await }));
        }

        let (job, _) = Job::from_notify(&notify_params("j1", true)).unwrap();
        registry.add_template(job, true);

        for handle in parked {
            tokio::time::timeout(std::time::Duration::from_secs(1), handle)
                .await
                .expect("parked long-poll caller was not woken")
                .unwrap();
        }

        // New parkers wait for the next event.
        let fresh = registry.on_block_listener();
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(50), async move { fresh.await })
                .await;
        assert!(waited.is_err(), "fresh listener must not be pre-fired");
    }
}
