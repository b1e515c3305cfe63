//! FIFO pool of checked-in sessions
//!
//! The buffer is owned by a single actor task, together with the queue of
//! pending checkouts. The head of the buffer goes to the oldest checkout that
//! is still waiting; checkouts that gave up are pruned as new ones arrive.
//! Nothing else touches either queue, so no lock guards them.

use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::session::Session;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("No session available within {0:?}")]
    Timeout(Duration),

    #[error("Session pool is shut down")]
    Closed,
}

type Waiter = oneshot::Sender<Session>;

enum Query {
    Len(oneshot::Sender<usize>),
    Usernames(oneshot::Sender<Vec<String>>),
    Waiting(oneshot::Sender<usize>),
}

/// Handle to the pool actor. Cheap to clone.
#[derive(Clone)]
pub struct SessionPool {
    sessions_in: mpsc::UnboundedSender<Session>,
    waiters: mpsc::UnboundedSender<Waiter>,
    queries: mpsc::UnboundedSender<Query>,
}

impl SessionPool {
    /// Start the pool actor with an initial buffer
    pub fn new(initial: Vec<Session>) -> Self {
        let (sessions_in, sessions_rx) = mpsc::unbounded_channel();
        let (waiters, waiters_rx) = mpsc::unbounded_channel();
        let (queries, queries_rx) = mpsc::unbounded_channel();

        let buffer: VecDeque<Session> = initial
            .into_iter()
            .filter(|s| {
                let usable = !s.is_evictable();
                if !usable {
                    warn!(account = %s.username(), "Refusing unusable session at startup");
                }
                usable
            })
            .collect();

        tokio::spawn(run_pool(buffer, sessions_rx, waiters_rx, queries_rx));

        Self {
            sessions_in,
            waiters,
            queries,
        }
    }

    /// Take the oldest buffered session, waiting at most `timeout`
    pub async fn checkout(&self, timeout: Duration) -> Result<Session, PoolError> {
        let (tx, mut rx) = oneshot::channel();
        self.waiters.send(tx).map_err(|_| PoolError::Closed)?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                // The actor may have handed a session over just as the timer fired
                rx.close();
                match rx.try_recv() {
                    Ok(session) => Ok(session),
                    Err(_) => {
                        debug!(?timeout, "Session checkout timed out");
                        Err(PoolError::Timeout(timeout))
                    }
                }
            }
        }
    }

    /// Return a session after `cooldown`, or evict it.
    ///
    /// Sessions whose account is banned or flagged, or whose proxy is dead,
    /// are dropped instead of being re-queued. Returns whether the session was
    /// queued.
    pub fn check_in(&self, session: Session, cooldown: Duration) -> bool {
        if session.is_evictable() {
            warn!(
                account = %session.username(),
                proxy_id = session.proxy().id,
                banned = session.account().banned,
                flagged = session.account().captcha_flagged,
                proxy_dead = session.proxy().dead,
                "Evicting session instead of returning it"
            );
            return false;
        }

        if cooldown.is_zero() {
            self.add_new(session);
            return true;
        }

        let sessions_in = self.sessions_in.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            if let Err(mpsc::error::SendError(session)) = sessions_in.send(session) {
                warn!(account = %session.username(), "Pool closed before session cooled down");
            }
        });
        true
    }

    /// Queue a freshly provisioned session without delay
    pub fn add_new(&self, session: Session) {
        if let Err(mpsc::error::SendError(session)) = self.sessions_in.send(session) {
            warn!(account = %session.username(), "Pool closed, dropping session");
        }
    }

    /// Number of buffered sessions
    pub async fn len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.queries.send(Query::Len(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Usernames of buffered sessions in serving order
    pub async fn usernames(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.queries.send(Query::Usernames(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Checkouts currently blocked on an empty pool
    pub async fn waiting(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.queries.send(Query::Waiting(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Hand buffered sessions to waiting checkouts, oldest first
fn dispatch(buffer: &mut VecDeque<Session>, waiting: &mut VecDeque<Waiter>) {
    while !buffer.is_empty() {
        let Some(waiter) = waiting.pop_front() else {
            return;
        };
        if waiter.is_closed() {
            continue;
        }
        if let Some(session) = buffer.pop_front() {
            if let Err(session) = waiter.send(session) {
                // Waiter gave up; keep the session's place at the head
                buffer.push_front(session);
            }
        }
    }
}

async fn run_pool(
    mut buffer: VecDeque<Session>,
    mut sessions_rx: mpsc::UnboundedReceiver<Session>,
    mut waiters_rx: mpsc::UnboundedReceiver<Waiter>,
    mut queries_rx: mpsc::UnboundedReceiver<Query>,
) {
    let mut waiting: VecDeque<Waiter> = VecDeque::new();
    debug!(buffered = buffer.len(), "Session pool started");

    loop {
        tokio::select! {
            // Drain input first so queries and waiters see every queued session
            biased;

            Some(session) = sessions_rx.recv() => {
                trace!(account = %session.username(), "Session queued");
                buffer.push_back(session);
            }
            Some(waiter) = waiters_rx.recv() => {
                waiting.retain(|w| !w.is_closed());
                waiting.push_back(waiter);
            }
            Some(query) = queries_rx.recv() => match query {
                Query::Len(reply) => {
                    let _ = reply.send(buffer.len());
                }
                Query::Usernames(reply) => {
                    let _ = reply.send(buffer.iter().map(|s| s.username().to_string()).collect());
                }
                Query::Waiting(reply) => {
                    waiting.retain(|w| !w.is_closed());
                    let _ = reply.send(waiting.len());
                }
            },
            else => break,
        }

        dispatch(&mut buffer, &mut waiting);
    }

    debug!("Session pool stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{StaticUpstreamFactory, UpstreamFactory};
    use fleet_proto::{Account, Proxy};
    use std::collections::HashSet;
    use tokio::time::Instant;

    fn session(name: &str) -> Session {
        let account = Account::new(name, "pw", "ptc");
        let upstream = StaticUpstreamFactory::default().create(&account);
        Session::new(account, Proxy::new(1), upstream)
    }

    #[tokio::test]
    async fn test_checkout_is_fifo() {
        let pool = SessionPool::new(vec![session("a"), session("b")]);
        pool.add_new(session("c"));

        let mut order = Vec::new();
        for _ in 0..3 {
            let s = pool.checkout(Duration::from_secs(1)).await.unwrap();
            order.push(s.username().to_string());
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkout_times_out_on_empty_pool() {
        let pool = SessionPool::new(Vec::new());
        let start = Instant::now();

        let result = pool.checkout(Duration::from_secs(5)).await;

        assert_eq!(result.unwrap_err(), PoolError::Timeout(Duration::from_secs(5)));
        assert!(Instant::now() - start >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_checkout_receives_added_session() {
        let pool = SessionPool::new(Vec::new());
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        pool.add_new(session("late"));

        let s = waiter.await.unwrap().unwrap();
        assert_eq!(s.username(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_delays_return() {
        let pool = SessionPool::new(vec![session("a")]);
        let s = pool.checkout(Duration::from_secs(1)).await.unwrap();

        assert!(pool.check_in(s, Duration::from_secs(25)));
        assert!(pool.checkout(Duration::from_secs(10)).await.is_err());

        let start = Instant::now();
        let s = pool.checkout(Duration::from_secs(30)).await.unwrap();
        assert_eq!(s.username(), "a");
        assert!(Instant::now() - start >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_banned_session_is_evicted() {
        let pool = SessionPool::new(vec![session("a")]);
        let mut s = pool.checkout(Duration::from_secs(1)).await.unwrap();
        s.account_mut().banned = true;

        assert!(!pool.check_in(s, Duration::ZERO));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_dead_proxy_session_is_evicted() {
        let pool = SessionPool::new(Vec::new());
        let mut s = session("a");
        s.proxy_mut().dead = true;

        assert!(!pool.check_in(s, Duration::ZERO));
        assert!(pool.usernames().await.is_empty());
    }

    #[tokio::test]
    async fn test_unusable_initial_sessions_are_refused() {
        let mut flagged = session("flagged");
        flagged.account_mut().captcha_flagged = true;
        let pool = SessionPool::new(vec![flagged, session("ok")]);

        assert_eq!(pool.usernames().await, vec!["ok"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checkouts_never_share_a_session() {
        let names: Vec<String> = (0..8).map(|i| format!("acct-{}", i)).collect();
        let pool = SessionPool::new(names.iter().map(|n| session(n)).collect());
        let in_use = std::sync::Arc::new(tokio::sync::Mutex::new(HashSet::new()));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            let in_use = in_use.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let s = pool.checkout(Duration::from_secs(5)).await.unwrap();
                    let name = s.username().to_string();
                    assert!(in_use.lock().await.insert(name.clone()), "{} handed out twice", name);
                    tokio::task::yield_now().await;
                    in_use.lock().await.remove(&name);
                    pool.check_in(s, Duration::ZERO);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(pool.len().await, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_checkouts_are_pruned() {
        let pool = SessionPool::new(Vec::new());
        for _ in 0..50 {
            assert!(pool.checkout(Duration::from_millis(10)).await.is_err());
        }
        assert_eq!(pool.waiting().await, 0);

        let live = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(pool.waiting().await, 1);

        pool.add_new(session("a"));
        assert_eq!(live.await.unwrap().unwrap().username(), "a");
        assert_eq!(pool.waiting().await, 0);
        assert!(pool.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_waiter_does_not_swallow_session() {
        let pool = SessionPool::new(Vec::new());
        assert!(pool.checkout(Duration::from_millis(10)).await.is_err());

        pool.add_new(session("a"));
        let s = pool.checkout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(s.username(), "a");
    }
}
