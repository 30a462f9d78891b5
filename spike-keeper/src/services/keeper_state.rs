//! The Keeper state machine and its persisted state.
//!
//! A Keeper's lifecycle:
//!
//! * `NOT_READY` – no persisted shard; the broadcaster and collector run.
//! * `CONTRIBUTING` – shard derivation in progress.
//! * `READY` – the shard is persisted; only the shard endpoint is served.
//! * `ERROR` – unrecoverable (e.g. a crashed bootstrap left a state file
//!   without a shard, or more contributions arrived than peers exist).
//!
//! On disk the Keeper owns two files under `DATA_DIR`: the state file
//! `keeper-{id}.state` holding a status word and the shard file holding
//! the raw 32-byte share value. Absence of the state file means
//! `NOT_READY`. The in-memory contribution map is typed `KeeperId →
//! Contribution`, write-once per key, and erased as soon as the shard is
//! derived; the folded RMK never outlives the derivation.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore as _;

use spike_core::{rmk, shamir};
use spike_types::KeeperId;
use spike_types::crypto::{Contribution, KEY_LEN, Shard};
use spike_types::error::SpikeError;

use crate::metrics::{METRICS_ID_KEEPER_CONTRIBUTIONS, METRICS_ID_KEEPER_READY};

/// The status word persisted while bootstrap is in progress.
const STATE_STARTED: &str = "STARTED";
/// The status word persisted once the shard is on disk.
const STATE_READY: &str = "READY";

/// The lifecycle states of a Keeper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeeperStatus {
    /// No persisted shard found; waiting for contributions.
    NotReady,
    /// Shard derivation in progress.
    Contributing,
    /// Shard persisted and served.
    Ready,
    /// Unrecoverable.
    Error,
}

struct Inner {
    keeper_id: KeeperId,
    peers: BTreeMap<KeeperId, String>,
    threshold: usize,
    state_path: PathBuf,
    shard_path: PathBuf,
    contribution: Contribution,
    contributions: Mutex<HashMap<KeeperId, Contribution>>,
    shard: Mutex<Option<Shard>>,
    status: Mutex<KeeperStatus>,
}

/// Process-scoped Keeper state. Cloning shares the same state.
#[derive(Clone)]
pub struct KeeperState {
    inner: Arc<Inner>,
}

fn fs_write(path: &PathBuf, contents: &[u8]) -> Result<(), SpikeError> {
    std::fs::write(path, contents).map_err(|err| SpikeError::FsFileOpenFailed(err.to_string()))
}

impl KeeperState {
    /// Restores or initializes the Keeper state under `data_dir`.
    ///
    /// # Errors
    ///
    /// Filesystem failures map to the `Fs*` error kinds; a state file
    /// claiming `STARTED` without a shard leaves the Keeper in
    /// [`KeeperStatus::Error`] (reported by [`KeeperState::status`], not
    /// as an `Err`, so the caller decides whether that is fatal).
    pub fn init(
        keeper_id: KeeperId,
        peers: BTreeMap<KeeperId, String>,
        threshold: usize,
        data_dir: &PathBuf,
    ) -> Result<Self, SpikeError> {
        let mut contribution_bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut contribution_bytes);
        Self::init_with_contribution(
            keeper_id,
            peers,
            threshold,
            data_dir,
            Contribution::from_bytes(contribution_bytes),
        )
    }

    /// [`KeeperState::init`] with a caller-provided contribution instead of
    /// fresh process entropy.
    pub fn init_with_contribution(
        keeper_id: KeeperId,
        peers: BTreeMap<KeeperId, String>,
        threshold: usize,
        data_dir: &PathBuf,
        contribution: Contribution,
    ) -> Result<Self, SpikeError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|err| SpikeError::FsDirectoryCreationFailed(err.to_string()))?;
        let state_path = data_dir.join(format!("keeper-{keeper_id}.state"));
        let shard_path = data_dir.join(format!("keeper-{keeper_id}.shard"));

        let (status, shard) = match std::fs::read_to_string(&state_path) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                (KeeperStatus::NotReady, None)
            }
            Err(err) => return Err(SpikeError::FsFileOpenFailed(err.to_string())),
            Ok(word) if word.trim() == STATE_READY => match std::fs::read(&shard_path) {
                Ok(bytes) => match Shard::from_slice(&bytes) {
                    Ok(shard) => (KeeperStatus::Ready, Some(shard)),
                    Err(_) => (KeeperStatus::Error, None),
                },
                Err(_) => (KeeperStatus::Error, None),
            },
            // STARTED (or anything else) without a shard: a bootstrap
            // crashed mid-derivation and the peers have moved on
            Ok(_) => (KeeperStatus::Error, None),
        };

        let state = Self {
            inner: Arc::new(Inner {
                contributions: Mutex::new(HashMap::new()),
                shard: Mutex::new(shard),
                status: Mutex::new(status),
                keeper_id,
                peers,
                threshold,
                state_path,
                shard_path,
                contribution,
            }),
        };
        ::metrics::gauge!(METRICS_ID_KEEPER_READY)
            .set(if status == KeeperStatus::Ready { 1.0 } else { 0.0 });

        if status == KeeperStatus::NotReady {
            fs_write(&state.inner.state_path, STATE_STARTED.as_bytes())?;
            // self-receipt: our own contribution goes through the same map
            state.receive_contribution(
                state.inner.keeper_id.clone(),
                state.inner.contribution.clone(),
            )?;
        }
        Ok(state)
    }

    /// This Keeper's id.
    pub fn keeper_id(&self) -> &KeeperId {
        &self.inner.keeper_id
    }

    /// The peer map, including this Keeper.
    pub fn peers(&self) -> &BTreeMap<KeeperId, String> {
        &self.inner.peers
    }

    /// The cached contribution of this process.
    pub fn contribution(&self) -> Contribution {
        self.inner.contribution.clone()
    }

    /// The current lifecycle status.
    pub fn status(&self) -> KeeperStatus {
        *self.inner.status.lock()
    }

    fn set_status(&self, status: KeeperStatus) {
        *self.inner.status.lock() = status;
        ::metrics::gauge!(METRICS_ID_KEEPER_READY)
            .set(if status == KeeperStatus::Ready { 1.0 } else { 0.0 });
    }

    /// Marks the Keeper unrecoverable.
    pub fn fail(&self) {
        self.set_status(KeeperStatus::Error);
    }

    /// Accepts a peer contribution.
    ///
    /// Write-once per key: a repeated contribution for the same id is
    /// idempotent. An all-zero shard is rejected, as is any contribution
    /// once the Keeper is `READY`.
    pub fn receive_contribution(
        &self,
        keeper_id: KeeperId,
        contribution: Contribution,
    ) -> Result<(), SpikeError> {
        match self.status() {
            KeeperStatus::Ready => return Err(SpikeError::StateAlreadyInitialized),
            KeeperStatus::Error => {
                return Err(SpikeError::EntityInvalid("keeper is in error state".into()));
            }
            KeeperStatus::NotReady | KeeperStatus::Contributing => {}
        }
        if contribution.is_all_zero() {
            return Err(SpikeError::EntityInvalid("all-zero contribution".into()));
        }
        if !self.inner.peers.contains_key(&keeper_id) {
            return Err(SpikeError::EntityInvalid(format!(
                "unknown keeper id: {keeper_id}"
            )));
        }
        let mut contributions = self.inner.contributions.lock();
        contributions.entry(keeper_id).or_insert(contribution);
        ::metrics::gauge!(METRICS_ID_KEEPER_CONTRIBUTIONS).set(contributions.len() as f64);
        Ok(())
    }

    /// The number of distinct contributions received so far.
    pub fn contribution_count(&self) -> usize {
        self.inner.contributions.lock().len()
    }

    /// Folds the contributions into the RMK, derives this Keeper's indexed
    /// share, persists it, and erases the intermediate state.
    ///
    /// Every Keeper runs the split with the same deterministic randomness,
    /// so all of them compute the identical share tuple; each keeps only
    /// the share at its position in the sorted peer-id list.
    pub fn finalize(&self) -> Result<(), SpikeError> {
        self.set_status(KeeperStatus::Contributing);

        let shard = {
            let contributions = self.inner.contributions.lock();
            let root_key = rmk::fold_contributions(contributions.values());
            let shares = shamir::split(
                &root_key,
                self.inner.threshold,
                self.inner.peers.len(),
                &mut shamir::deterministic_rng(),
            )?;
            let index = self
                .inner
                .peers
                .keys()
                .position(|id| *id == self.inner.keeper_id)
                .ok_or_else(|| {
                    SpikeError::EntityInvalid(format!(
                        "keeper {} missing from its own peer map",
                        self.inner.keeper_id
                    ))
                })?;
            shares[index].to_shard()
        };

        self.persist_shard(&shard)?;

        // erase the contribution map; the buffers zeroize as they drop
        let mut contributions = self.inner.contributions.lock();
        contributions.clear();
        ::metrics::gauge!(METRICS_ID_KEEPER_CONTRIBUTIONS).set(0.0);
        drop(contributions);

        self.set_status(KeeperStatus::Ready);
        tracing::info!("keeper {} is READY", self.inner.keeper_id);
        Ok(())
    }

    /// Persists the shard and flips the state file to `READY`.
    ///
    /// Persisting an all-zero shard is a no-op: the guard keeps a buggy
    /// caller from clobbering a real share with zeros.
    pub fn persist_shard(&self, shard: &Shard) -> Result<(), SpikeError> {
        if shard.is_all_zero() {
            tracing::warn!("refusing to persist an all-zero shard");
            return Ok(());
        }
        let mut slot = self.inner.shard.lock();
        fs_write(&self.inner.shard_path, shard.as_bytes())?;
        fs_write(&self.inner.state_path, STATE_READY.as_bytes())?;
        *slot = Some(shard.clone());
        Ok(())
    }

    /// The persisted shard, if this Keeper is `READY`.
    pub fn shard(&self) -> Option<Shard> {
        self.inner.shard.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> BTreeMap<KeeperId, String> {
        [
            (KeeperId::new("a"), "https://a:8443".to_owned()),
            (KeeperId::new("b"), "https://b:8443".to_owned()),
            (KeeperId::new("c"), "https://c:8443".to_owned()),
        ]
        .into_iter()
        .collect()
    }

    /// The fixed contribution of each test keeper: every byte of `a`'s is
    /// 0x01, `b`'s 0x02, `c`'s 0x04, so the folded RMK is 0x07 everywhere.
    fn contribution_of(id: &str) -> Contribution {
        let byte = match id {
            "a" => 0x01,
            "b" => 0x02,
            _ => 0x04,
        };
        Contribution::from_bytes([byte; 32])
    }

    fn state_for(id: &str, dir: &std::path::Path) -> KeeperState {
        KeeperState::init_with_contribution(
            KeeperId::new(id),
            peers(),
            1,
            &dir.to_path_buf(),
            contribution_of(id),
        )
        .expect("init succeeds")
    }

    fn contribute_all(state: &KeeperState) {
        for id in ["a", "b", "c"] {
            // the keeper's own contribution is already present; repeats
            // are idempotent
            let _ = state.receive_contribution(KeeperId::new(id), contribution_of(id));
        }
    }

    #[test]
    fn fresh_start_is_not_ready_and_self_receives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_for("a", dir.path());
        assert_eq!(state.status(), KeeperStatus::NotReady);
        // own contribution is already in the map
        assert_eq!(state.contribution_count(), 1);
        assert!(state.shard().is_none());
    }

    #[test]
    fn contributions_are_write_once_and_validated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_for("a", dir.path());

        let err = state
            .receive_contribution(KeeperId::new("b"), Contribution::from_bytes([0; 32]))
            .expect_err("all-zero rejected");
        assert!(matches!(err, SpikeError::EntityInvalid(_)));

        let err = state
            .receive_contribution(KeeperId::new("zz"), Contribution::from_bytes([1; 32]))
            .expect_err("unknown peer rejected");
        assert!(matches!(err, SpikeError::EntityInvalid(_)));

        state
            .receive_contribution(KeeperId::new("b"), Contribution::from_bytes([0x02; 32]))
            .expect("first write accepted");
        state
            .receive_contribution(KeeperId::new("b"), Contribution::from_bytes([0x7F; 32]))
            .expect("repeat is idempotent");
        assert_eq!(state.contribution_count(), 2);
    }

    #[test]
    fn keepers_agree_on_the_share_tuple() {
        // three keepers with identical contributions and peer lists each
        // keep the share at their sorted index
        let dirs: Vec<_> = (0..3)
            .map(|_| tempfile::tempdir().expect("tempdir"))
            .collect();
        let ids = ["a", "b", "c"];
        let mut shards = Vec::new();
        for (id, dir) in ids.iter().zip(dirs.iter()) {
            let state = state_for(id, dir.path());
            contribute_all(&state);
            assert_eq!(state.contribution_count(), 3);
            state.finalize().expect("finalize succeeds");
            assert_eq!(state.status(), KeeperStatus::Ready);
            assert_eq!(state.contribution_count(), 0);
            shards.push(state.shard().expect("shard persisted"));
        }

        // any two of the three shards reconstruct the folded RMK 0x07..07
        let shares: Vec<_> = shards
            .iter()
            .enumerate()
            .map(|(index, shard)| {
                shamir::ShamirShare::from_indexed_shard(index, shard).expect("canonical")
            })
            .collect();
        let rmk = shamir::recover(&shares[1..], 1).expect("recover");
        assert_eq!(rmk.as_bytes(), &[0x07; 32]);
        let rmk = shamir::recover(&shares[..2], 1).expect("recover");
        assert_eq!(rmk.as_bytes(), &[0x07; 32]);
    }

    #[test]
    fn restart_with_persisted_shard_is_ready() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let state = state_for("a", dir.path());
            contribute_all(&state);
            state.finalize().expect("finalize succeeds");
        }
        let restarted = state_for("a", dir.path());
        assert_eq!(restarted.status(), KeeperStatus::Ready);
        assert!(restarted.shard().is_some());

        let err = restarted
            .receive_contribution(KeeperId::new("b"), Contribution::from_bytes([0x02; 32]))
            .expect_err("ready keepers refuse contributions");
        assert!(matches!(err, SpikeError::StateAlreadyInitialized));
    }

    #[test]
    fn crashed_bootstrap_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("keeper-a.state"), STATE_STARTED).expect("write");
        let state = state_for("a", dir.path());
        assert_eq!(state.status(), KeeperStatus::Error);
    }

    #[test]
    fn zero_shard_persist_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_for("a", dir.path());
        contribute_all(&state);
        state.finalize().expect("finalize succeeds");
        let before = state.shard().expect("shard persisted");

        state
            .persist_shard(&Shard::from_bytes([0; 32]))
            .expect("no-op");
        assert_eq!(state.shard().expect("still there").as_bytes(), before.as_bytes());
    }
}
