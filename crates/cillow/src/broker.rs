//! Request broker: the network-facing endpoint.
//!
//! A ROUTER socket receives multipart messages of the form
//! `[identity, payload]` (a REQ-style empty delimiter between the two is
//! tolerated). Payloads parse into requests and land on a bounded job queue;
//! a pool of broker worker tasks pulls jobs, drives the worker pool, and
//! relays every response frame back as `[identity, payload]` in order.
//!
//! Refusals that never reach the queue — malformed payloads, a full queue —
//! are answered synchronously on the socket so the accept path never blocks
//! on a worker.
//!
//! Shutdown: stop accepting, fail queued jobs with `Shutdown`, terminate
//! every pooled worker through its grace period, join the worker tasks,
//! drop the socket.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::config::ServerConfig;
use crate::error::{ErrorKind, Exception};
use crate::pool::{ClientId, ReplySender, WorkerPool};
use crate::protocol::{decode_request, encode_frame, Request, ResponseFrame};

/// A request pulled off the socket together with its reply identity.
struct BrokerJob {
    client: ClientId,
    request: Request,
}

/// Run the broker until interrupted (ctrl-c).
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    serve(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Run the broker until `shutdown` completes. Split from [`run`] so tests
/// can drive the lifecycle.
pub async fn serve(config: ServerConfig, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let endpoint = config.endpoint();

    let mut socket = zeromq::RouterSocket::new();
    socket
        .bind(&endpoint)
        .await
        .map_err(|err| anyhow::anyhow!("failed to bind {endpoint}: {err}"))?;
    info!(%endpoint, workers = config.worker_tasks, queue = config.queue_size, "broker listening");

    let pool = WorkerPool::new(Arc::clone(&config));
    let (job_tx, job_rx) = mpsc::channel::<BrokerJob>(config.queue_size.max(1));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<(ClientId, ResponseFrame)>();
    let (drain_tx, _) = watch::channel(false);

    let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
    let mut tasks = JoinSet::new();
    for task_id in 0..config.worker_tasks.max(1) {
        tasks.spawn(worker_task(
            task_id,
            Arc::clone(&job_rx),
            drain_tx.subscribe(),
            Arc::clone(&pool),
            reply_tx.clone(),
        ));
    }

    let mut job_tx = Some(job_tx);
    let mut reply_tx = Some(reply_tx);
    let mut shutdown = std::pin::pin!(shutdown);
    let mut accepting = true;

    loop {
        tokio::select! {
            _ = &mut shutdown, if accepting => {
                info!("shutdown requested; draining");
                accepting = false;
                let _ = drain_tx.send(true);
                // Closing the queue lets worker tasks finish; terminating the
                // pool cancels in-flight requests with Shutdown frames.
                job_tx = None;
                drop(reply_tx.take());
                pool.shutdown_all();
            }
            incoming = socket.recv(), if accepting => {
                match incoming {
                    Ok(message) => {
                        handle_incoming(message, job_tx.as_ref(), &mut socket).await;
                    }
                    Err(err) => error!(%err, "socket receive failed"),
                }
            }
            relayed = reply_rx.recv() => {
                match relayed {
                    Some((client, frame)) => {
                        if !send_frames(&mut socket, &client, &[frame]).await {
                            // The transport reports this identity gone:
                            // reclaim every worker the client held.
                            pool.remove_client(&client, ErrorKind::Cancelled);
                        }
                    }
                    None => break, // queue drained and all tasks finished
                }
            }
        }
    }

    while tasks.join_next().await.is_some() {}
    info!("broker stopped");
    Ok(())
}

/// One broker worker task: pull jobs and drive the pool. During a drain,
/// queued jobs are answered with `Shutdown` instead of executing.
async fn worker_task(
    task_id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<BrokerJob>>>,
    draining: watch::Receiver<bool>,
    pool: Arc<WorkerPool>,
    reply: ReplySender,
) {
    loop {
        let job = { queue.lock().await.recv().await };
        let Some(job) = job else { break };

        if *draining.borrow() {
            reply_exception(
                &reply,
                &job.client,
                Exception::new(ErrorKind::Shutdown, "broker is shutting down"),
            );
            continue;
        }
        handle_job(job, &pool, &reply).await;
    }
    debug!(task_id, "broker worker task finished");
}

async fn handle_job(job: BrokerJob, pool: &Arc<WorkerPool>, reply: &ReplySender) {
    let BrokerJob { client, request } = job;
    match request {
        // Pool-level kinds are handled here so they never queue behind an
        // in-flight request on the same worker.
        Request::ShutdownClient => {
            pool.remove_client(&client, ErrorKind::Cancelled);
            reply_result(reply, &client);
        }
        Request::DeleteInterpreter { env } => {
            if pool.delete(&client, &env, ErrorKind::Cancelled) {
                reply_result(reply, &client);
            } else {
                reply_exception(
                    reply,
                    &client,
                    Exception::new(
                        ErrorKind::UnknownEnvironment,
                        format!("no interpreter bound to {}", env.as_wire()),
                    ),
                );
            }
        }
        Request::SwitchInterpreter { env } => {
            match pool.ensure(client.clone(), env) {
                Ok(()) => reply_result(reply, &client),
                Err(exception) => reply_exception(reply, &client, exception),
            }
        }
        request @ (Request::RunCode { .. }
        | Request::RunCommand { .. }
        | Request::InstallRequirements { .. }
        | Request::SetEnvVars { .. }) => {
            let env = request
                .env()
                .cloned()
                .unwrap_or(crate::protocol::Environment::System);
            pool.dispatch(client, env, request, reply.clone()).await;
        }
    }
}

fn reply_result(reply: &ReplySender, client: &ClientId) {
    let _ = reply.send((client.clone(), ResponseFrame::Result { value: serde_json::Value::Null }));
    let _ = reply.send((client.clone(), ResponseFrame::End));
}

fn reply_exception(reply: &ReplySender, client: &ClientId, exception: Exception) {
    let _ = reply.send((client.clone(), ResponseFrame::Exception(exception)));
    let _ = reply.send((client.clone(), ResponseFrame::End));
}

/// Parse and enqueue one incoming message, answering refusals directly on
/// the socket.
async fn handle_incoming(
    message: ZmqMessage,
    job_tx: Option<&mpsc::Sender<BrokerJob>>,
    socket: &mut zeromq::RouterSocket,
) {
    let frames: Vec<bytes::Bytes> = message.into_vec();
    let Some((client, payload)) = split_envelope(&frames) else {
        warn!(parts = frames.len(), "dropping message with unusable envelope");
        return;
    };

    let request = match decode_request(payload) {
        Ok(request) => request,
        Err(err) => {
            debug!(%err, "malformed request payload");
            refuse(
                socket,
                &client,
                Exception::new(ErrorKind::MalformedRequest, err.to_string()),
            )
            .await;
            return;
        }
    };

    let Some(job_tx) = job_tx else {
        refuse(
            socket,
            &client,
            Exception::new(ErrorKind::Shutdown, "broker is shutting down"),
        )
        .await;
        return;
    };

    match job_tx.try_send(BrokerJob {
        client: client.clone(),
        request,
    }) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            refuse(
                socket,
                &client,
                Exception::new(ErrorKind::ServerBusy, "request queue is full"),
            )
            .await;
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            refuse(
                socket,
                &client,
                Exception::new(ErrorKind::Shutdown, "broker is shutting down"),
            )
            .await;
        }
    }
}

/// `[identity, payload]` with an optional REQ-style empty delimiter between
/// the two.
fn split_envelope(frames: &[bytes::Bytes]) -> Option<(ClientId, &[u8])> {
    if frames.len() < 2 {
        return None;
    }
    let client = frames[0].to_vec();
    let payload: &[u8] = if frames.len() >= 3 && frames[1].is_empty() {
        &frames[2]
    } else {
        &frames[1]
    };
    Some((client, payload))
}

async fn refuse(socket: &mut zeromq::RouterSocket, client: &ClientId, exception: Exception) {
    send_frames(
        socket,
        client,
        &[ResponseFrame::Exception(exception), ResponseFrame::End],
    )
    .await;
}

/// Send frames to one client identity. Returns `false` when the transport
/// rejects the identity (the client is gone).
async fn send_frames(
    socket: &mut zeromq::RouterSocket,
    client: &ClientId,
    frames: &[ResponseFrame],
) -> bool {
    for frame in frames {
        let payload = match encode_frame(frame) {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, "failed to encode response frame");
                return false;
            }
        };
        let mut message = ZmqMessage::from(client.clone());
        message.push_back(payload.into());
        if let Err(err) = socket.send(message).await {
            debug!(%err, "reply relay failed; treating client as disconnected");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    // (1) Dealer-style envelope: [identity, payload].
    #[test]
    fn test_split_envelope_dealer() {
        let frames = vec![Bytes::from_static(b"id-1"), Bytes::from_static(b"payload")];
        let (client, payload) = split_envelope(&frames).expect("envelope");
        assert_eq!(client, b"id-1".to_vec());
        assert_eq!(payload, &b"payload"[..]);
    }

    // (2) REQ-style envelope: [identity, empty, payload].
    #[test]
    fn test_split_envelope_req_delimiter() {
        let frames = vec![
            Bytes::from_static(b"id-2"),
            Bytes::new(),
            Bytes::from_static(b"payload"),
        ];
        let (client, payload) = split_envelope(&frames).expect("envelope");
        assert_eq!(client, b"id-2".to_vec());
        assert_eq!(payload, &b"payload"[..]);
    }

    // (3) Anything shorter than [identity, payload] is unusable.
    #[test]
    fn test_split_envelope_too_short() {
        assert!(split_envelope(&[Bytes::from_static(b"id")]).is_none());
        assert!(split_envelope(&[]).is_none());
    }
}
