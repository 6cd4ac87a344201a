//! Proxying of distributed-transaction verbs onto the back-end XA resource,
//! with a per-datasource bound on concurrently active branches.

use crate::backend::XaResource;
use sqlrelay_impl::{xa_flags, RelayError, RelayResult, Xid};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Prepare vote: transaction committed normally.
pub const XA_OK: i32 = 0;
/// Prepare vote: branch was read-only and is already complete.
pub const XA_RDONLY: i32 = 3;

/// Caps the number of concurrently active XA branches of one datasource.
#[derive(Debug)]
pub struct TransactionLimiter {
    semaphore: Arc<Semaphore>,
    start_timeout: Duration,
    max: u32,
}

impl TransactionLimiter {
    pub fn new(max: u32, start_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max as usize)),
            start_timeout,
            max,
        }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Number of permits currently held by branches.
    #[allow(clippy::cast_possible_truncation)]
    pub fn in_use(&self) -> u32 {
        self.max - self.semaphore.available_permits() as u32
    }

    async fn acquire(&self) -> RelayResult<OwnedSemaphorePermit> {
        let started = Instant::now();
        tokio::time::timeout(
            self.start_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_elapsed| RelayError::XaLimitReached {
            waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })?
        .map_err(|_closed| RelayError::Impl("Transaction limiter is closed"))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BranchState {
    Active,
    Ended,
    Prepared,
}

#[derive(Debug)]
struct BranchEntry {
    session_id: Option<Uuid>,
    state: BranchState,
    // dropped exactly once, when the branch entry is removed on commit,
    // rollback, or a read-only vote
    _permit: OwnedSemaphorePermit,
}

/// Per-datasource XA branch bookkeeping.
///
/// Branches live at datasource level, not session level: a client that
/// disconnects with an in-doubt branch keeps its permit until a later
/// commit or rollback resolves the branch.
#[derive(Debug)]
pub struct XaControl {
    limiter: TransactionLimiter,
    branches: Mutex<HashMap<Xid, BranchEntry>>,
}

fn protocol_error(verb: &str, detail: &str) -> RelayError {
    RelayError::XaProtocol(format!("{verb}: {detail}"))
}

impl XaControl {
    pub fn new(max_transactions: u32, start_timeout: Duration) -> Self {
        Self {
            limiter: TransactionLimiter::new(max_transactions, start_timeout),
            branches: Mutex::new(HashMap::new()),
        }
    }

    pub fn limiter(&self) -> &TransactionLimiter {
        &self.limiter
    }

    pub async fn start(
        &self,
        session_id: Uuid,
        xid: &Xid,
        flags: u32,
        xa: &mut dyn XaResource,
    ) -> RelayResult<()> {
        debug!("XaControl::start({xid})");
        if flags & !(xa_flags::JOIN | xa_flags::RESUME) != 0 {
            return Err(protocol_error("start", "invalid transaction flags"));
        }
        if self.branches.lock()?.contains_key(xid) {
            return Err(protocol_error("start", "xid is already known"));
        }
        let permit = self.limiter.acquire().await?;
        xa.start(xid, flags).await?;
        self.branches.lock()?.insert(
            xid.clone(),
            BranchEntry {
                session_id: Some(session_id),
                state: BranchState::Active,
                _permit: permit,
            },
        );
        Ok(())
    }

    pub async fn end(
        &self,
        session_id: Uuid,
        xid: &Xid,
        flags: u32,
        xa: &mut dyn XaResource,
    ) -> RelayResult<()> {
        debug!("XaControl::end({xid})");
        if flags & !(xa_flags::SUCCESS | xa_flags::FAIL | xa_flags::SUSPEND) != 0 {
            return Err(protocol_error("end", "invalid transaction flags"));
        }
        {
            let branches = self.branches.lock()?;
            match branches.get(xid) {
                Some(branch) if branch.state == BranchState::Active => {
                    if branch.session_id != Some(session_id) {
                        return Err(protocol_error("end", "xid is bound to another session"));
                    }
                }
                Some(_) => return Err(protocol_error("end", "xid is not active")),
                None => return Err(protocol_error("end", "unbound xid")),
            }
        }
        xa.end(xid, flags).await?;
        if let Some(branch) = self.branches.lock()?.get_mut(xid) {
            branch.state = BranchState::Ended;
            branch.session_id = None;
        }
        Ok(())
    }

    /// Returns the back-end's vote. A read-only vote completes the branch
    /// and releases its permit.
    pub async fn prepare(&self, xid: &Xid, xa: &mut dyn XaResource) -> RelayResult<i32> {
        debug!("XaControl::prepare({xid})");
        match self.branches.lock()?.get(xid).map(|b| b.state) {
            Some(BranchState::Ended) => {}
            Some(_) => return Err(protocol_error("prepare", "xid is not ended")),
            None => return Err(protocol_error("prepare", "unbound xid")),
        }
        let vote = xa.prepare(xid).await?;
        let mut branches = self.branches.lock()?;
        if vote == XA_RDONLY {
            branches.remove(xid);
        } else if let Some(branch) = branches.get_mut(xid) {
            branch.state = BranchState::Prepared;
        }
        Ok(vote)
    }

    pub async fn commit(
        &self,
        xid: &Xid,
        one_phase: bool,
        xa: &mut dyn XaResource,
    ) -> RelayResult<()> {
        debug!("XaControl::commit({xid}, one_phase = {one_phase})");
        match self.branches.lock()?.get(xid).map(|b| b.state) {
            Some(BranchState::Prepared) if !one_phase => {}
            Some(BranchState::Ended) if one_phase => {}
            Some(_) => return Err(protocol_error("commit", "branch state does not allow commit")),
            None => return Err(protocol_error("commit", "unbound xid")),
        }
        xa.commit(xid, one_phase).await?;
        self.branches.lock()?.remove(xid);
        Ok(())
    }

    pub async fn rollback(&self, xid: &Xid, xa: &mut dyn XaResource) -> RelayResult<()> {
        debug!("XaControl::rollback({xid})");
        if !self.branches.lock()?.contains_key(xid) {
            return Err(protocol_error("rollback", "unbound xid"));
        }
        xa.rollback(xid).await?;
        self.branches.lock()?.remove(xid);
        Ok(())
    }

    pub async fn forget(&self, xid: &Xid, xa: &mut dyn XaResource) -> RelayResult<()> {
        debug!("XaControl::forget({xid})");
        xa.forget(xid).await?;
        self.branches.lock()?.remove(xid);
        Ok(())
    }

    pub async fn recover(&self, flags: u32, xa: &mut dyn XaResource) -> RelayResult<Vec<Xid>> {
        debug!("XaControl::recover()");
        if flags & !(xa_flags::START_RECOVERY_SCAN | xa_flags::END_RECOVERY_SCAN) != 0 {
            return Err(protocol_error("recover", "invalid transaction flags"));
        }
        xa.recover(flags).await
    }
}

#[cfg(test)]
mod tests {
    use super::{TransactionLimiter, XaControl};
    use crate::backend::{mock::MockProvider, BackendProvider};
    use sqlrelay_impl::{xa_flags, ErrorKind, Xid};
    use std::collections::HashMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn xid(tag: u8) -> Xid {
        Xid::try_new(7, vec![tag; 8], vec![1]).unwrap()
    }

    #[tokio::test]
    async fn limiter_times_out() {
        let limiter = TransactionLimiter::new(1, Duration::from_millis(100));
        let _p = limiter.acquire().await.unwrap();
        let e = limiter.acquire().await.unwrap_err();
        assert_eq!(ErrorKind::XaLimitReached, e.kind());
    }

    #[tokio::test]
    async fn two_phase_commit_and_permit_release() {
        let provider = MockProvider::new();
        let mut conn_a = provider
            .open_xa("mock://", "u", "p", &HashMap::new())
            .await
            .unwrap();
        let mut conn_b = provider
            .open_xa("mock://", "u", "p", &HashMap::new())
            .await
            .unwrap();

        let control = XaControl::new(1, Duration::from_millis(100));
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();

        let xid_a = xid(1);
        control
            .start(session_a, &xid_a, xa_flags::NONE, conn_a.xa_resource().unwrap())
            .await
            .unwrap();
        assert_eq!(1, control.limiter().in_use());

        // second branch exceeds the configured maximum
        let xid_b = xid(2);
        let e = control
            .start(session_b, &xid_b, xa_flags::NONE, conn_b.xa_resource().unwrap())
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::XaLimitReached, e.kind());

        // first branch completes, permit becomes free
        control
            .end(session_a, &xid_a, xa_flags::SUCCESS, conn_a.xa_resource().unwrap())
            .await
            .unwrap();
        let vote = control
            .prepare(&xid_a, conn_a.xa_resource().unwrap())
            .await
            .unwrap();
        assert_eq!(super::XA_OK, vote);
        assert_eq!(1, control.limiter().in_use()); // not released on prepare
        control
            .commit(&xid_a, false, conn_a.xa_resource().unwrap())
            .await
            .unwrap();
        assert_eq!(0, control.limiter().in_use());

        control
            .start(session_b, &xid_b, xa_flags::NONE, conn_b.xa_resource().unwrap())
            .await
            .unwrap();
        control
            .rollback(&xid_b, conn_b.xa_resource().unwrap())
            .await
            .unwrap();
        assert_eq!(0, control.limiter().in_use());
    }

    #[tokio::test]
    async fn illegal_sequences_are_protocol_errors() {
        let provider = MockProvider::new();
        let mut conn = provider
            .open_xa("mock://", "u", "p", &HashMap::new())
            .await
            .unwrap();
        let control = XaControl::new(4, Duration::from_millis(100));
        let session = Uuid::new_v4();
        let x = xid(9);

        // commit before start
        let e = control
            .commit(&x, false, conn.xa_resource().unwrap())
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::XaProtocol, e.kind());

        control
            .start(session, &x, xa_flags::NONE, conn.xa_resource().unwrap())
            .await
            .unwrap();
        // prepare before end
        let e = control
            .prepare(&x, conn.xa_resource().unwrap())
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::XaProtocol, e.kind());
        // end from a different session
        let e = control
            .end(Uuid::new_v4(), &x, xa_flags::SUCCESS, conn.xa_resource().unwrap())
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::XaProtocol, e.kind());
    }
}
