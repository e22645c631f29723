//! Worker pool: owns the live set of interpreter subprocesses keyed by
//! `(client, environment)`.
//!
//! ## Design
//!
//! Each pooled worker is a dedicated tokio task (an actor) that:
//! 1. Spawns the interpreter subprocess bound to one environment and waits
//!    for its ready frame.
//! 2. Blocks on a bounded mailbox of [`WorkerJob`]s.
//! 3. On receiving a job: writes the request frame to the child, relays every
//!    response frame to the reply channel in order until `End`, then signals
//!    the dispatcher.
//!
//! The actor processes its mailbox serially, which is what serializes
//! requests per key: a second request for the same `(client, env)` simply
//! queues behind the first. The subprocess handle never leaves its actor.
//!
//! ## Admission
//!
//! The pool map and the per-client index live behind one mutex that is only
//! held for map mutation, never across I/O. Get-or-create is atomic: on a
//! miss the entry (mailbox plus termination signal) is inserted under the
//! lock and the actor does the slow subprocess spawn afterwards, failing any
//! queued jobs with `WorkerStartupFailed` if the handshake does not complete.
//! Quota refusals mutate nothing.
//!
//! ## Termination
//!
//! Deletion, client disconnect, and broker shutdown all send a termination
//! reason to the actor, which closes the child's stdin (the channel), waits
//! out the grace period, and escalates to kill. An in-flight request
//! surfaces the reason as a synthesized exception plus `End`; a subprocess
//! that dies on its own surfaces `WorkerDied` the same way and the next
//! request for that key spawns a fresh worker.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{ErrorKind, Exception};
use crate::protocol::{
    decode_frame, encode_request, read_frame_async, write_frame_async, Environment, Request,
    ResponseFrame,
};

/// Opaque socket-layer identity of a connected client.
pub type ClientId = Vec<u8>;

/// Channel that carries relayed frames back toward the router socket.
pub type ReplySender = mpsc::UnboundedSender<(ClientId, ResponseFrame)>;

/// The full identity under which interpreter workers are pooled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub client: ClientId,
    pub env: Environment,
}

/// One request handed to a worker actor, with everything needed to route its
/// responses back.
struct WorkerJob {
    request: Request,
    client: ClientId,
    reply: ReplySender,
    done: oneshot::Sender<()>,
}

struct WorkerEntry {
    mailbox: mpsc::Sender<WorkerJob>,
    term: watch::Sender<Option<ErrorKind>>,
    generation: u64,
    pid: Arc<AtomicU32>,
    created_at: Instant,
    last_used: Instant,
}

#[derive(Default)]
struct PoolInner {
    workers: HashMap<WorkerKey, WorkerEntry>,
    by_client: HashMap<ClientId, HashSet<Environment>>,
}

/// The pool itself. Cheap to share; actors hold a weak handle so a dying
/// worker can remove its own entry.
pub struct WorkerPool {
    inner: Mutex<PoolInner>,
    config: Arc<ServerConfig>,
    generations: AtomicU64,
}

impl WorkerPool {
    pub fn new(config: Arc<ServerConfig>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner::default()),
            config,
            generations: AtomicU64::new(0),
        })
    }

    /// Route one request to the worker for `(client, env)`, creating it if
    /// admission allows, and relay every response frame through `reply`
    /// until `End`. All failures are reported through `reply` as exception
    /// frames; this function never errors outward.
    pub async fn dispatch(
        self: &Arc<Self>,
        client: ClientId,
        env: Environment,
        request: Request,
        reply: ReplySender,
    ) {
        let key = WorkerKey {
            client: client.clone(),
            env,
        };

        // Two attempts: the worker can vanish between checkout and send
        // (delete or death); the second checkout then admits a fresh one.
        for _ in 0..2 {
            let mailbox = match self.checkout(&key) {
                Ok(mailbox) => mailbox,
                Err(exception) => {
                    send_exception(&reply, &client, exception);
                    return;
                }
            };

            let (done_tx, done_rx) = oneshot::channel();
            let job = WorkerJob {
                request: request.clone(),
                client: client.clone(),
                reply: reply.clone(),
                done: done_tx,
            };
            if mailbox.send(job).await.is_ok() {
                let _ = done_rx.await;
                return;
            }
        }

        send_exception(
            &reply,
            &client,
            Exception::new(ErrorKind::WorkerDied, "interpreter worker is gone"),
        );
    }

    /// Make sure a worker exists for `(client, env)` without sending it
    /// anything. Used for interpreter-switch hints.
    pub fn ensure(self: &Arc<Self>, client: ClientId, env: Environment) -> Result<(), Exception> {
        self.checkout(&WorkerKey { client, env }).map(|_| ())
    }

    /// Find the worker for the key or admit a new one. Only the map
    /// insertion happens under the lock; the subprocess spawn runs inside
    /// the new actor.
    fn checkout(self: &Arc<Self>, key: &WorkerKey) -> Result<mpsc::Sender<WorkerJob>, Exception> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");

        if let Some(entry) = inner.workers.get_mut(key) {
            entry.last_used = Instant::now();
            return Ok(entry.mailbox.clone());
        }

        let per_client = inner
            .by_client
            .get(&key.client)
            .map(|envs| envs.len())
            .unwrap_or(0);
        admission_check(inner.workers.len(), per_client, &self.config)?;

        let (mailbox_tx, mailbox_rx) = mpsc::channel(self.config.queue_size.max(1));
        let (term_tx, term_rx) = watch::channel(None);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let pid = Arc::new(AtomicU32::new(0));
        let entry = WorkerEntry {
            mailbox: mailbox_tx.clone(),
            term: term_tx,
            generation,
            pid: Arc::clone(&pid),
            created_at: Instant::now(),
            last_used: Instant::now(),
        };
        inner.workers.insert(key.clone(), entry);
        inner
            .by_client
            .entry(key.client.clone())
            .or_default()
            .insert(key.env.clone());
        drop(inner);

        info!(env = %key.env.as_wire(), "admitting new interpreter worker");
        tokio::spawn(worker_actor(
            key.clone(),
            Arc::clone(&self.config),
            Arc::downgrade(self),
            generation,
            mailbox_rx,
            term_rx,
            pid,
        ));
        Ok(mailbox_tx)
    }

    /// Terminate and remove the worker for `(client, env)`. Returns `false`
    /// if no such worker exists.
    pub fn delete(&self, client: &ClientId, env: &Environment, reason: ErrorKind) -> bool {
        let key = WorkerKey {
            client: client.clone(),
            env: env.clone(),
        };
        let entry = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            let entry = inner.workers.remove(&key);
            if entry.is_some() {
                if let Some(envs) = inner.by_client.get_mut(client) {
                    envs.remove(env);
                    if envs.is_empty() {
                        inner.by_client.remove(client);
                    }
                }
            }
            entry
        };
        match entry {
            Some(entry) => {
                debug!(
                    env = %env.as_wire(),
                    pid = entry.pid.load(Ordering::Relaxed),
                    age = ?entry.created_at.elapsed(),
                    idle = ?entry.last_used.elapsed(),
                    %reason,
                    "terminating interpreter worker"
                );
                let _ = entry.term.send(Some(reason));
                true
            }
            None => false,
        }
    }

    /// Terminate every worker belonging to `client`. The only mechanism
    /// that reclaims workers besides explicit deletion.
    pub fn remove_client(&self, client: &ClientId, reason: ErrorKind) -> usize {
        let envs: Vec<Environment> = {
            let inner = self.inner.lock().expect("pool lock poisoned");
            inner
                .by_client
                .get(client)
                .map(|envs| envs.iter().cloned().collect())
                .unwrap_or_default()
        };
        let mut removed = 0;
        for env in envs {
            if self.delete(client, &env, reason) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "reclaimed workers for disconnected client");
        }
        removed
    }

    /// Terminate every pooled worker (broker shutdown).
    pub fn shutdown_all(&self) {
        let keys: Vec<WorkerKey> = {
            let inner = self.inner.lock().expect("pool lock poisoned");
            inner.workers.keys().cloned().collect()
        };
        for key in keys {
            self.delete(&key.client, &key.env, ErrorKind::Shutdown);
        }
    }

    /// Remove an entry only if it still belongs to the calling actor's
    /// generation; a deleted-and-respawned key must not lose its successor.
    fn remove_if_generation(&self, key: &WorkerKey, generation: u64) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        let matches = inner
            .workers
            .get(key)
            .map(|entry| entry.generation == generation)
            .unwrap_or(false);
        if matches {
            inner.workers.remove(key);
            if let Some(envs) = inner.by_client.get_mut(&key.client) {
                envs.remove(&key.env);
                if envs.is_empty() {
                    inner.by_client.remove(&key.client);
                }
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").workers.len()
    }

    pub fn client_worker_count(&self, client: &ClientId) -> usize {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .by_client
            .get(client)
            .map(|envs| envs.len())
            .unwrap_or(0)
    }
}

/// Quota gate for admitting a new worker. Refusal mutates nothing: the
/// service rejects rather than evicting another session.
fn admission_check(
    global_count: usize,
    per_client_count: usize,
    config: &ServerConfig,
) -> Result<(), Exception> {
    if per_client_count >= config.interpreters_per_client {
        return Err(Exception::new(
            ErrorKind::PerClientQuotaExceeded,
            format!(
                "client already holds {per_client_count} of {} interpreter(s)",
                config.interpreters_per_client
            ),
        ));
    }
    if global_count >= config.max_interpreters {
        return Err(Exception::new(
            ErrorKind::GlobalQuotaExceeded,
            format!(
                "pool already holds {global_count} of {} interpreters",
                config.max_interpreters
            ),
        ));
    }
    Ok(())
}

fn send_exception(reply: &ReplySender, client: &ClientId, exception: Exception) {
    let _ = reply.send((client.clone(), ResponseFrame::Exception(exception)));
    let _ = reply.send((client.clone(), ResponseFrame::End));
}

// ── Worker actor ─────────────────────────────────────────────────────────────

struct WorkerChannel {
    child: Child,
    to_worker: ChildStdin,
    from_worker: BufReader<ChildStdout>,
}

enum JobOutcome {
    Completed,
    Terminated(ErrorKind),
    WorkerDied,
}

async fn worker_actor(
    key: WorkerKey,
    config: Arc<ServerConfig>,
    pool: Weak<WorkerPool>,
    generation: u64,
    mut mailbox: mpsc::Receiver<WorkerJob>,
    mut term: watch::Receiver<Option<ErrorKind>>,
    pid_slot: Arc<AtomicU32>,
) {
    let mut channel = match spawn_worker(&key.env, &config).await {
        Ok(channel) => channel,
        Err(err) => {
            warn!(env = %key.env.as_wire(), %err, "worker startup failed");
            remove_self(&pool, &key, generation);
            fail_pending(&mut mailbox, ErrorKind::WorkerStartupFailed, &err.to_string()).await;
            return;
        }
    };
    let pid = channel.child.id().unwrap_or(0);
    pid_slot.store(pid, Ordering::Relaxed);
    info!(env = %key.env.as_wire(), pid, "interpreter worker ready");

    let reason = loop {
        tokio::select! {
            changed = term.changed() => {
                let reason = if changed.is_ok() { *term.borrow() } else { None };
                break reason.unwrap_or(ErrorKind::Cancelled);
            }
            job = mailbox.recv() => {
                let Some(job) = job else {
                    // Entry dropped without a reason; treat as cancellation.
                    break ErrorKind::Cancelled;
                };
                match process_job(job, &mut channel, &mut term).await {
                    JobOutcome::Completed => continue,
                    JobOutcome::Terminated(reason) => break reason,
                    JobOutcome::WorkerDied => {
                        warn!(env = %key.env.as_wire(), pid, "interpreter worker died");
                        remove_self(&pool, &key, generation);
                        fail_pending(
                            &mut mailbox,
                            ErrorKind::WorkerDied,
                            "interpreter worker exited unexpectedly",
                        )
                        .await;
                        let _ = channel.child.wait().await;
                        return;
                    }
                }
            }
        }
    };

    remove_self(&pool, &key, generation);
    let message = match reason {
        ErrorKind::Shutdown => "broker is shutting down",
        _ => "interpreter was deleted",
    };
    fail_pending(&mut mailbox, reason, message).await;
    graceful_exit(channel, config.grace_period).await;
    debug!(env = %key.env.as_wire(), pid, %reason, "interpreter worker terminated");
}

/// Send one request to the child and relay its response stream until `End`.
async fn process_job(
    job: WorkerJob,
    channel: &mut WorkerChannel,
    term: &mut watch::Receiver<Option<ErrorKind>>,
) -> JobOutcome {
    let WorkerJob {
        request,
        client,
        reply,
        done,
    } = job;

    let payload = match encode_request(&request) {
        Ok(payload) => payload,
        Err(err) => {
            send_exception(
                &reply,
                &client,
                Exception::new(ErrorKind::MalformedRequest, err.to_string()),
            );
            let _ = done.send(());
            return JobOutcome::Completed;
        }
    };

    if write_frame_async(&mut channel.to_worker, &payload).await.is_err() {
        send_exception(
            &reply,
            &client,
            Exception::new(ErrorKind::WorkerDied, "interpreter worker closed its channel"),
        );
        let _ = done.send(());
        return JobOutcome::WorkerDied;
    }

    loop {
        tokio::select! {
            changed = term.changed() => {
                let reason = if changed.is_ok() { *term.borrow() } else { None };
                let reason = reason.unwrap_or(ErrorKind::Cancelled);
                let message = match reason {
                    ErrorKind::Shutdown => "broker is shutting down",
                    _ => "interpreter was deleted while the request was in flight",
                };
                send_exception(&reply, &client, Exception::new(reason, message));
                let _ = done.send(());
                return JobOutcome::Terminated(reason);
            }
            frame = read_frame_async(&mut channel.from_worker) => {
                let buf = match frame {
                    Ok(Some(buf)) => buf,
                    Ok(None) | Err(_) => {
                        send_exception(
                            &reply,
                            &client,
                            Exception::new(
                                ErrorKind::WorkerDied,
                                "interpreter worker exited mid-request",
                            ),
                        );
                        let _ = done.send(());
                        return JobOutcome::WorkerDied;
                    }
                };
                match decode_frame(&buf) {
                    Ok(ResponseFrame::Ready) => continue, // channel-internal, never relayed
                    Ok(frame) => {
                        let is_end = frame.is_end();
                        let _ = reply.send((client.clone(), frame));
                        if is_end {
                            let _ = done.send(());
                            return JobOutcome::Completed;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "undecodable frame from worker");
                        send_exception(
                            &reply,
                            &client,
                            Exception::new(ErrorKind::WorkerDied, "worker channel corrupted"),
                        );
                        let _ = done.send(());
                        return JobOutcome::WorkerDied;
                    }
                }
            }
        }
    }
}

/// Spawn the interpreter subprocess for `env` and complete the ready
/// handshake within the configured timeout.
async fn spawn_worker(env: &Environment, config: &ServerConfig) -> anyhow::Result<WorkerChannel> {
    let program = match &config.worker_program {
        Some(program) => program.clone(),
        None => std::env::current_exe().context("cannot locate the worker executable")?,
    };

    let mut command = tokio::process::Command::new(&program);
    command.arg("worker").arg("--env").arg(env.as_wire());
    if !config.hooks.is_empty() {
        command.arg("--hooks").arg(config.hooks.join(","));
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", program.display()))?;
    let to_worker = child.stdin.take().context("worker stdin unavailable")?;
    let mut from_worker = BufReader::new(child.stdout.take().context("worker stdout unavailable")?);

    match timeout(config.ready_timeout, read_frame_async(&mut from_worker)).await {
        Ok(Ok(Some(buf))) if matches!(decode_frame(&buf), Ok(ResponseFrame::Ready)) => {
            Ok(WorkerChannel {
                child,
                to_worker,
                from_worker,
            })
        }
        Ok(Ok(_)) => bail!("worker closed the channel before reporting ready"),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => bail!(
            "worker did not report ready within {:?}",
            config.ready_timeout
        ),
    }
}

/// Close the channel, give the worker the grace period to exit on its own,
/// then escalate to kill.
async fn graceful_exit(channel: WorkerChannel, grace: Duration) {
    let WorkerChannel {
        mut child,
        to_worker,
        from_worker,
    } = channel;
    drop(to_worker);
    drop(from_worker);
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(%status, "worker exited"),
        Ok(Err(err)) => warn!(%err, "could not reap worker"),
        Err(_) => {
            warn!("worker did not exit within the grace period; killing");
            let _ = child.kill().await;
        }
    }
}

/// Fail every queued job with `kind` and stop accepting new ones.
async fn fail_pending(mailbox: &mut mpsc::Receiver<WorkerJob>, kind: ErrorKind, message: &str) {
    mailbox.close();
    while let Some(job) = mailbox.recv().await {
        send_exception(&job.reply, &job.client, Exception::new(kind, message));
        let _ = job.done.send(());
    }
}

fn remove_self(pool: &Weak<WorkerPool>, key: &WorkerKey, generation: u64) {
    if let Some(pool) = pool.upgrade() {
        pool.remove_if_generation(key, generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            max_interpreters: 2,
            interpreters_per_client: 1,
            ..ServerConfig::default()
        })
    }

    fn client(tag: u8) -> ClientId {
        vec![tag; 4]
    }

    /// Insert a pool entry backed by no actor, returning its mailbox end and
    /// termination signal so tests can play the worker side.
    fn insert_stub(
        pool: &Arc<WorkerPool>,
        key: &WorkerKey,
    ) -> (
        mpsc::Receiver<WorkerJob>,
        watch::Receiver<Option<ErrorKind>>,
    ) {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(8);
        let (term_tx, term_rx) = watch::channel(None);
        let generation = pool.generations.fetch_add(1, Ordering::Relaxed);
        let mut inner = pool.inner.lock().unwrap();
        inner.workers.insert(
            key.clone(),
            WorkerEntry {
                mailbox: mailbox_tx,
                term: term_tx,
                generation,
                pid: Arc::new(AtomicU32::new(0)),
                created_at: Instant::now(),
                last_used: Instant::now(),
            },
        );
        inner
            .by_client
            .entry(key.client.clone())
            .or_default()
            .insert(key.env.clone());
        (mailbox_rx, term_rx)
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    // (1) Per-client quota refuses before the global quota is consulted.
    #[test]
    fn test_admission_per_client_quota() {
        let config = test_config();
        let err = admission_check(0, 1, &config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PerClientQuotaExceeded);
    }

    // (2) Global quota refuses once the pool is full.
    #[test]
    fn test_admission_global_quota() {
        let config = test_config();
        assert!(admission_check(1, 0, &config).is_ok());
        let err = admission_check(2, 0, &config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GlobalQuotaExceeded);
    }

    // (3) A quota refusal does not mutate the pool.
    #[test]
    fn test_quota_refusal_leaves_pool_unchanged() {
        let pool = WorkerPool::new(test_config());
        let key = WorkerKey {
            client: client(1),
            env: Environment::System,
        };
        insert_stub(&pool, &key);
        assert_eq!(pool.worker_count(), 1);

        // Same client, second env: per-client quota (Cmax = 1).
        let second = WorkerKey {
            client: client(1),
            env: Environment::parse("/opt/envs/other"),
        };
        let err = pool.checkout(&second).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PerClientQuotaExceeded);
        assert_eq!(pool.worker_count(), 1, "refusal must not mutate the pool");
        assert_eq!(pool.client_worker_count(&client(1)), 1);
    }

    // (4) Checkout of an existing key returns its mailbox without admission.
    #[tokio::test]
    async fn test_checkout_reuses_existing_worker() {
        let pool = WorkerPool::new(test_config());
        let key = WorkerKey {
            client: client(1),
            env: Environment::System,
        };
        let (mut mailbox_rx, _term) = insert_stub(&pool, &key);

        let mailbox = pool.checkout(&key).expect("existing worker");
        let (done_tx, _done_rx) = oneshot::channel();
        mailbox
            .send(WorkerJob {
                request: Request::ShutdownClient,
                client: client(1),
                reply: mpsc::unbounded_channel().0,
                done: done_tx,
            })
            .await
            .expect("mailbox send");
        assert!(mailbox_rx.recv().await.is_some());
        assert_eq!(pool.worker_count(), 1);
    }

    // ── Dispatch plumbing ─────────────────────────────────────────────────────

    // (5) Dispatch relays the actor's frames in order and completes on End.
    #[tokio::test]
    async fn test_dispatch_relays_frames_in_order() {
        let pool = WorkerPool::new(test_config());
        let key = WorkerKey {
            client: client(7),
            env: Environment::System,
        };
        let (mut mailbox_rx, _term) = insert_stub(&pool, &key);

        // Stub worker: answer one job with a stream, a result, and End.
        tokio::spawn(async move {
            let job = mailbox_rx.recv().await.expect("job");
            let _ = job.reply.send((
                job.client.clone(),
                ResponseFrame::stream("stdout", "hi\n"),
            ));
            let _ = job
                .reply
                .send((job.client.clone(), ResponseFrame::Result { value: serde_json::Value::Null }));
            let _ = job.reply.send((job.client.clone(), ResponseFrame::End));
            let _ = job.done.send(());
        });

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        pool.dispatch(
            client(7),
            Environment::System,
            Request::RunCode {
                env: Environment::System,
                source: "print('hi')".to_string(),
            },
            reply_tx,
        )
        .await;

        let mut frames = Vec::new();
        while let Ok((who, frame)) = reply_rx.try_recv() {
            assert_eq!(who, client(7));
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![
                ResponseFrame::stream("stdout", "hi\n"),
                ResponseFrame::Result { value: serde_json::Value::Null },
                ResponseFrame::End,
            ]
        );
    }

    // (6) Admission failure is synthesized directly as exception + End.
    #[tokio::test]
    async fn test_dispatch_synthesizes_quota_exception() {
        let pool = WorkerPool::new(test_config());
        let key = WorkerKey {
            client: client(2),
            env: Environment::System,
        };
        insert_stub(&pool, &key);

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        pool.dispatch(
            client(2),
            Environment::parse("/opt/envs/extra"),
            Request::RunCode {
                env: Environment::parse("/opt/envs/extra"),
                source: String::new(),
            },
            reply_tx,
        )
        .await;

        let (_, first) = reply_rx.try_recv().expect("exception frame");
        assert!(matches!(
            first,
            ResponseFrame::Exception(exc) if exc.kind == ErrorKind::PerClientQuotaExceeded
        ));
        let (_, second) = reply_rx.try_recv().expect("end frame");
        assert!(second.is_end());
        assert!(reply_rx.try_recv().is_err(), "exactly one End per request");
    }

    // ── Lifecycle bookkeeping ─────────────────────────────────────────────────

    // (7) Delete removes the entry and signals the actor with the reason.
    #[tokio::test]
    async fn test_delete_signals_termination() {
        let pool = WorkerPool::new(test_config());
        let key = WorkerKey {
            client: client(3),
            env: Environment::System,
        };
        let (_mailbox_rx, mut term_rx) = insert_stub(&pool, &key);

        assert!(pool.delete(&client(3), &Environment::System, ErrorKind::Cancelled));
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(pool.client_worker_count(&client(3)), 0);

        term_rx.changed().await.expect("termination signal");
        assert_eq!(*term_rx.borrow(), Some(ErrorKind::Cancelled));

        // A second delete for the same key reports UnknownEnvironment to the
        // caller by returning false.
        assert!(!pool.delete(&client(3), &Environment::System, ErrorKind::Cancelled));
    }

    // (8) Client removal reclaims every env the client held.
    #[tokio::test]
    async fn test_remove_client_reclaims_all_envs() {
        let config = Arc::new(ServerConfig {
            max_interpreters: 4,
            interpreters_per_client: 2,
            ..ServerConfig::default()
        });
        let pool = WorkerPool::new(config);
        let env_a = Environment::System;
        let env_b = Environment::parse("/opt/envs/b");
        insert_stub(
            &pool,
            &WorkerKey {
                client: client(4),
                env: env_a,
            },
        );
        insert_stub(
            &pool,
            &WorkerKey {
                client: client(4),
                env: env_b,
            },
        );
        insert_stub(
            &pool,
            &WorkerKey {
                client: client(5),
                env: Environment::System,
            },
        );

        assert_eq!(pool.remove_client(&client(4), ErrorKind::Cancelled), 2);
        assert_eq!(pool.worker_count(), 1, "other clients keep their workers");
        assert_eq!(pool.client_worker_count(&client(5)), 1);
    }

    // (9) A stale generation cannot remove its successor entry.
    #[test]
    fn test_generation_guard_protects_successor() {
        let pool = WorkerPool::new(test_config());
        let key = WorkerKey {
            client: client(6),
            env: Environment::System,
        };
        insert_stub(&pool, &key);
        let successor_generation = {
            let inner = pool.inner.lock().unwrap();
            inner.workers.get(&key).unwrap().generation
        };

        pool.remove_if_generation(&key, successor_generation.wrapping_sub(1));
        assert_eq!(pool.worker_count(), 1, "stale actor must not evict successor");

        pool.remove_if_generation(&key, successor_generation);
        assert_eq!(pool.worker_count(), 0);
    }
}
