//! Client-side command batcher.
//!
//! Single-command invokes to a batching-capable peer are held briefly and
//! coalesced into one wire invoke request. Responses are routed back to
//! their callers by `commandRef`; sub-batches never repeat a command path,
//! mirroring the wire rule that batched invokes target distinct paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::client::{CommandRequest, CommandResponse};
use crate::error::InteractionError;

/// Wire-level executor for one coalesced invoke. Implemented by the
/// client's direct invoker; tests substitute their own.
#[async_trait::async_trait]
pub(crate) trait InvokeSink: Send + Sync {
    async fn invoke(
        &self,
        commands: Vec<CommandRequest>,
        refs: Vec<u16>,
    ) -> Result<Vec<CommandResponse>, InteractionError>;

    /// The peer's advertised batching limit, re-read at flush time because
    /// it is negotiated per session.
    fn max_paths_per_invoke(&self) -> u16;
}

struct Pending {
    request: CommandRequest,
    resolve: oneshot::Sender<Result<Option<CommandResponse>, InteractionError>>,
}

struct BatcherState {
    pending: HashMap<u16, Pending>,
    /// Enqueue order; partitioning walks this for determinism.
    order: Vec<u16>,
    next_ref: u16,
    flush_at: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    closed: bool,
}

#[derive(Clone)]
pub struct CommandBatcher {
    state: Arc<Mutex<BatcherState>>,
    /// Serializes flushes so snapshots never interleave.
    flush_lock: Arc<tokio::sync::Mutex<()>>,
    sink: Arc<dyn InvokeSink>,
}

impl CommandBatcher {
    pub(crate) fn new(sink: Arc<dyn InvokeSink>) -> Self {
        CommandBatcher {
            state: Arc::new(Mutex::new(BatcherState {
                pending: HashMap::new(),
                order: Vec::new(),
                next_ref: 1,
                flush_at: None,
                timer: None,
                closed: false,
            })),
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
            sink,
        }
    }

    /// Queue one command and wait for its routed response. `flush_after`
    /// is the coalescing window; zero means "next scheduler tick". A later
    /// enqueue with a shorter window pulls the flush earlier, never later.
    pub async fn enqueue(
        &self,
        request: CommandRequest,
        flush_after: Duration,
    ) -> Result<Option<CommandResponse>, InteractionError> {
        let rx = {
            let mut state = self.state.lock().expect("batcher state");
            if state.closed {
                return Err(InteractionError::BatcherClosed);
            }
            let command_ref = allocate_ref(&mut state);
            let (tx, rx) = oneshot::channel();
            trace!(command_ref, path = %request.path, "command enqueued");
            state.pending.insert(
                command_ref,
                Pending {
                    request,
                    resolve: tx,
                },
            );
            state.order.push(command_ref);

            let when = Instant::now() + flush_after;
            let restart = state.flush_at.is_none_or(|t| when < t);
            if restart {
                state.flush_at = Some(when);
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                let batcher = self.clone();
                state.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep_until(when).await;
                    batcher.flush().await;
                }));
            }
            rx
        };
        rx.await.map_err(|_| InteractionError::BatcherClosed)?
    }

    /// Snapshot the pending set and send it as path-distinct sub-batches.
    pub async fn flush(&self) {
        let _serial = self.flush_lock.lock().await;
        let (order, mut pending) = {
            let mut state = self.state.lock().expect("batcher state");
            state.flush_at = None;
            state.timer = None;
            (
                std::mem::take(&mut state.order),
                std::mem::take(&mut state.pending),
            )
        };
        if order.is_empty() {
            return;
        }

        // Greedy partition: a command joins the first sub-batch that does
        // not already target its path and still has room.
        let limit = usize::from(self.sink.max_paths_per_invoke().max(1));
        let mut batches: Vec<Vec<u16>> = Vec::new();
        for command_ref in &order {
            let Some(entry) = pending.get(command_ref) else {
                continue;
            };
            let path = entry.request.path;
            let slot = batches.iter_mut().find(|batch| {
                batch.len() < limit
                    && !batch
                        .iter()
                        .any(|r| pending.get(r).is_some_and(|p| p.request.path == path))
            });
            match slot {
                Some(batch) => batch.push(*command_ref),
                None => batches.push(vec![*command_ref]),
            }
        }
        debug!(
            commands = order.len(),
            sub_batches = batches.len(),
            "flushing batched invokes"
        );

        for refs in batches {
            let commands: Vec<CommandRequest> = refs
                .iter()
                .map(|r| pending[r].request.clone())
                .collect();
            match self.sink.invoke(commands, refs.clone()).await {
                Ok(responses) => {
                    for response in responses {
                        // A single-command sub-batch elides the wire ref;
                        // its one response belongs to its one caller.
                        let command_ref = response.command_ref.or_else(|| {
                            (refs.len() == 1).then(|| refs[0])
                        });
                        if let Some(owner) =
                            command_ref.and_then(|r| pending.remove(&r))
                        {
                            let _ = owner.resolve.send(Ok(Some(response)));
                        } else {
                            debug!(
                                command_ref = ?response.command_ref,
                                "response with no matching pending command"
                            );
                        }
                    }
                    // Callers whose response never arrived (suppressed)
                    // resolve empty rather than hanging.
                    for r in &refs {
                        if let Some(owner) = pending.remove(r) {
                            let _ = owner.resolve.send(Ok(None));
                        }
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    for r in &refs {
                        if let Some(owner) = pending.remove(r) {
                            let _ = owner
                                .resolve
                                .send(Err(InteractionError::BatchFailed(message.clone())));
                        }
                    }
                }
            }
        }
    }

    /// Reject everything still queued and refuse further enqueues.
    pub async fn close(&self) {
        let pending = {
            let mut state = self.state.lock().expect("batcher state");
            state.closed = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.order.clear();
            std::mem::take(&mut state.pending)
        };
        for (_, owner) in pending {
            let _ = owner.resolve.send(Err(InteractionError::BatcherClosed));
        }
        // Drain any in-flight flush before returning.
        let _serial = self.flush_lock.lock().await;
    }
}

/// Next free commandRef: wraps from 0xFFFF to 1 and skips refs still in
/// use; 0 is never issued.
fn allocate_ref(state: &mut BatcherState) -> u16 {
    loop {
        let candidate = state.next_ref;
        state.next_ref = if candidate >= 0xffff { 1 } else { candidate + 1 };
        if candidate != 0 && !state.pending.contains_key(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtr_proto::Status;
    use std::sync::Mutex as StdMutex;

    use crate::path::CommandPath;

    /// Records each wire invoke and answers with echoes.
    struct RecordingSink {
        calls: StdMutex<Vec<(Vec<CommandRequest>, Vec<u16>)>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl InvokeSink for RecordingSink {
        fn max_paths_per_invoke(&self) -> u16 {
            4
        }

        async fn invoke(
            &self,
            commands: Vec<CommandRequest>,
            refs: Vec<u16>,
        ) -> Result<Vec<CommandResponse>, InteractionError> {
            self.calls
                .lock()
                .unwrap()
                .push((commands.clone(), refs.clone()));
            if self.fail {
                return Err(InteractionError::Timeout);
            }
            Ok(commands
                .iter()
                .zip(&refs)
                .map(|(command, r)| CommandResponse {
                    path: command.path,
                    fields: command.fields.clone(),
                    status: Status::Success,
                    command_ref: if commands.len() > 1 { Some(*r) } else { None },
                })
                .collect())
        }
    }

    fn sink(fail: bool) -> Arc<RecordingSink> {
        Arc::new(RecordingSink {
            calls: StdMutex::new(Vec::new()),
            fail,
        })
    }

    fn command(endpoint: u16, cluster: u32, id: u32) -> CommandRequest {
        CommandRequest {
            path: CommandPath::new(endpoint, cluster, id),
            fields: None,
        }
    }

    #[tokio::test]
    async fn two_commands_in_one_tick_coalesce_into_one_wire_invoke() {
        let sink = sink(false);
        let batcher = CommandBatcher::new(sink.clone());

        let b1 = batcher.clone();
        let b2 = batcher.clone();
        let on = tokio::spawn(async move {
            b1.enqueue(command(1, 6, 1), Duration::ZERO).await
        });
        let off = tokio::spawn(async move {
            b2.enqueue(command(1, 6, 0), Duration::ZERO).await
        });

        let on = on.await.unwrap().unwrap().expect("response");
        let off = off.await.unwrap().unwrap().expect("response");

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1, "one wire invoke for both commands");
        assert_eq!(calls[0].0.len(), 2);
        let refs = &calls[0].1;
        assert_ne!(refs[0], refs[1], "distinct commandRefs");
        assert_eq!(on.path, CommandPath::new(1, 6, 1));
        assert_eq!(off.path, CommandPath::new(1, 6, 0));
    }

    #[tokio::test]
    async fn same_path_commands_partition_into_sequential_sub_batches() {
        let sink = sink(false);
        let batcher = CommandBatcher::new(sink.clone());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let b = batcher.clone();
            handles.push(tokio::spawn(async move {
                b.enqueue(command(1, 6, 2), Duration::ZERO).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap().expect("response");
        }

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 3, "duplicate paths never share a sub-batch");
        for (commands, _) in calls.iter() {
            assert_eq!(commands.len(), 1);
        }
    }

    #[tokio::test]
    async fn batch_failure_rejects_every_member() {
        let sink = sink(true);
        let batcher = CommandBatcher::new(sink);

        let b1 = batcher.clone();
        let b2 = batcher.clone();
        let first = tokio::spawn(async move {
            b1.enqueue(command(1, 6, 1), Duration::ZERO).await
        });
        let second = tokio::spawn(async move {
            b2.enqueue(command(1, 8, 0), Duration::ZERO).await
        });

        assert!(matches!(
            first.await.unwrap(),
            Err(InteractionError::BatchFailed(_))
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(InteractionError::BatchFailed(_))
        ));
    }

    #[tokio::test]
    async fn close_rejects_queued_commands() {
        let sink = sink(false);
        let batcher = CommandBatcher::new(sink);

        let b = batcher.clone();
        let queued = tokio::spawn(async move {
            b.enqueue(command(1, 6, 1), Duration::from_secs(60)).await
        });
        tokio::task::yield_now().await;
        batcher.close().await;

        assert!(matches!(
            queued.await.unwrap(),
            Err(InteractionError::BatcherClosed)
        ));
        assert!(matches!(
            batcher.enqueue(command(1, 6, 1), Duration::ZERO).await,
            Err(InteractionError::BatcherClosed)
        ));
    }

    #[test]
    fn command_refs_wrap_and_skip_in_use_slots() {
        let mut state = BatcherState {
            pending: HashMap::new(),
            order: Vec::new(),
            next_ref: 0xfffe,
            flush_at: None,
            timer: None,
            closed: false,
        };
        assert_eq!(allocate_ref(&mut state), 0xfffe);
        // Mark 1 as in use; the wrap must go 0xffff -> 1 (skipped) -> 2.
        let (tx, _rx) = oneshot::channel();
        state.pending.insert(
            1,
            Pending {
                request: CommandRequest {
                    path: CommandPath::new(1, 6, 0),
                    fields: None,
                },
                resolve: tx,
            },
        );
        assert_eq!(allocate_ref(&mut state), 0xffff);
        assert_eq!(allocate_ref(&mut state), 2);
    }
}
