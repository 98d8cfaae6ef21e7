//! Command execution pipeline (one mailbox per aggregate).
//!
//! ## Command Execution Flow
//!
//! ```text
//! Command
//!   ↓  routed by aggregate id (or by command id for creations)
//! 1. Command mailbox: a run takes up to `command_batch_size` commands, in order
//!   ↓
//! 2. Load aggregate: cache, else snapshot + replay (first command of the run)
//!   ↓
//! 3. Resolve the single registered handler, stage events through CommandContext
//!   ↓
//! 4. Build the EventStream at `version + 1`
//!   ↓
//! 5. Queue it on the aggregate's committing mailbox; the next command of the
//!    run is staged on the aggregate this stream produces
//!   ↓
//! 6. Wait for the commit outcomes in order
//!   ↓
//! CommandResult: Success | NothingChanged | Failed
//! ```
//!
//! ## Conflict Handling
//!
//! A commit that collides with an already stored version is re-executed from
//! step 2, this time loading the aggregate from storage (the cached copy is
//! stale by definition). Commands of the same run queued after it are
//! re-executed as well, since they were staged on its result. After
//! `max_conflict_retries` re-executions a command fails with
//! [`FailureKind::Conflict`].
//!
//! A stream whose id is already pending in the committing mailbox is rejected
//! there; its command waits for that batch to settle and then re-executes.
//!
//! ## Idempotence
//!
//! Terminal non-failed results are memoized by command id: re-submitting a
//! completed command returns the original result without running the handler
//! again. Memo entries expire with the reaper sweep.
//!
//! A handler that panics fails its command with [`FailureKind::Validation`];
//! the caller still gets a result.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use ordinal_core::{AggregateId, AggregateRoot, CommandId};
use ordinal_events::{Command, CommandContext, CommandHandlerRegistry, CommandPayload, EventStream};

use crate::aggregate_storage::{AggregateStorage, StoredAggregate, encode_events};
use crate::cache::MemoryCache;
use crate::committing::{CommitOutcome, CommittingMailboxes, EventCommittingContext, StreamChain};
use crate::error::EngineError;
use crate::mailbox::{Admission, DedupQueue, FifoQueue, MailboxHandler, MailboxRegistry, Worker, panic_message};
use crate::reaper::Reapable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    /// The handler ran but staged no events.
    NothingChanged,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Validation,
    Conflict,
    TransientIo,
    Reconstruction,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CommandFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<EngineError> for CommandFailure {
    fn from(value: EngineError) -> Self {
        let kind = match &value {
            EngineError::Validation(_) => FailureKind::Validation,
            EngineError::Conflict(_) => FailureKind::Conflict,
            EngineError::TransientIo(_) => FailureKind::TransientIo,
            EngineError::Reconstruction(_) => FailureKind::Reconstruction,
            EngineError::Duplicate(_) => FailureKind::Duplicate,
        };
        Self::new(kind, value.to_string())
    }
}

/// Terminal outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub aggregate_id: Option<AggregateId>,
    pub status: CommandStatus,
    /// Aggregate version after the command (0 when no aggregate is involved).
    pub version: u64,
    pub failure: Option<CommandFailure>,
}

impl CommandResult {
    pub fn success(command_id: CommandId, aggregate_id: AggregateId, version: u64) -> Self {
        Self {
            command_id,
            aggregate_id: Some(aggregate_id),
            status: CommandStatus::Success,
            version,
            failure: None,
        }
    }

    pub fn nothing_changed(command_id: CommandId, aggregate_id: Option<AggregateId>, version: u64) -> Self {
        Self {
            command_id,
            aggregate_id,
            status: CommandStatus::NothingChanged,
            version,
            failure: None,
        }
    }

    pub fn failed(command_id: CommandId, aggregate_id: Option<AggregateId>, failure: CommandFailure) -> Self {
        Self {
            command_id,
            aggregate_id,
            status: CommandStatus::Failed,
            version: 0,
            failure: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The caller stopped waiting; the command may still complete.
    #[error("command {command_id} did not complete within {timeout:?}")]
    Timeout { command_id: CommandId, timeout: Duration },

    /// The pipeline dropped the command without a result.
    #[error("command {0} was abandoned before completing")]
    Abandoned(CommandId),
}

/// A command plus the channel its result goes to.
#[derive(Debug)]
pub struct ProcessingCommand<P> {
    command: Command<P>,
    reply: oneshot::Sender<CommandResult>,
}

impl<P: CommandPayload> ProcessingCommand<P> {
    pub fn new(command: Command<P>) -> (Self, oneshot::Receiver<CommandResult>) {
        let (reply, rx) = oneshot::channel();
        (Self { command, reply }, rx)
    }

    pub fn command(&self) -> &Command<P> {
        &self.command
    }

    pub fn complete(self, result: CommandResult) {
        let _ = self.reply.send(result);
    }
}

pub type CommandMailboxes<P> = MailboxRegistry<FifoQueue<ProcessingCommand<P>>>;

/// Completed-command results by command id.
#[derive(Debug)]
pub struct CommandMemo {
    results: DashMap<CommandId, (CommandResult, Instant)>,
    timeout: Duration,
}

impl CommandMemo {
    pub fn new(timeout: Duration) -> Self {
        Self {
            results: DashMap::new(),
            timeout,
        }
    }

    pub fn get(&self, command_id: CommandId) -> Option<CommandResult> {
        self.results.get(&command_id).map(|entry| entry.0.clone())
    }

    /// Failed results are not kept so a failed command can be resubmitted.
    pub fn record(&self, result: &CommandResult) {
        if result.status != CommandStatus::Failed {
            self.results
                .insert(result.command_id, (result.clone(), Instant::now()));
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl Reapable for CommandMemo {
    fn name(&self) -> &str {
        "command-memo"
    }

    fn reap(&self) -> usize {
        let before = self.results.len();
        let timeout = self.timeout;
        self.results.retain(|_, (_, at)| at.elapsed() < timeout);
        before.saturating_sub(self.results.len())
    }
}

/// Where staging one command left it.
enum Staged<A: StoredAggregate> {
    Done(CommandResult),
    /// The stream is queued for commit. `head` is the aggregate as it will be
    /// once that stream is committed.
    Queued {
        aggregate_id: AggregateId,
        outcome: oneshot::Receiver<CommitOutcome>,
        head: Option<AggregateRoot<A>>,
    },
    /// A stream with the same id is already pending in the committing mailbox.
    Rejected {
        aggregate_id: AggregateId,
        settled: watch::Receiver<u64>,
    },
}

/// Why a command runs again, and on which aggregate.
struct Conflict {
    aggregate_id: AggregateId,
    detail: String,
    /// Fires once the committing batch holding the competing stream settled.
    settled: Option<watch::Receiver<u64>>,
}

impl Conflict {
    fn pending(aggregate_id: AggregateId, settled: watch::Receiver<u64>) -> Self {
        Self {
            aggregate_id,
            detail: format!("a stream for aggregate {aggregate_id} at this version is already pending"),
            settled: Some(settled),
        }
    }
}

/// One command of a run, in mailbox order.
enum Step<P> {
    /// Its stream is queued behind the streams of the steps before it.
    Committing {
        command: Command<P>,
        replies: Vec<oneshot::Sender<CommandResult>>,
        aggregate_id: AggregateId,
        outcome: oneshot::Receiver<CommitOutcome>,
    },
    /// Finished on the pipelined aggregate; only valid if every step before
    /// it commits.
    Finished {
        command: Command<P>,
        replies: Vec<oneshot::Sender<CommandResult>>,
        result: CommandResult,
    },
    /// Runs again from storage once the steps before it are settled.
    Rerun {
        command: Command<P>,
        replies: Vec<oneshot::Sender<CommandResult>>,
        conflict: Option<Conflict>,
    },
}

impl<P: CommandPayload> Step<P> {
    fn command_id(&self) -> CommandId {
        match self {
            Step::Committing { command, .. } | Step::Finished { command, .. } | Step::Rerun { command, .. } => {
                command.id()
            }
        }
    }

    fn replies(&mut self) -> &mut Vec<oneshot::Sender<CommandResult>> {
        match self {
            Step::Committing { replies, .. } | Step::Finished { replies, .. } | Step::Rerun { replies, .. } => replies,
        }
    }
}

/// Runs commands taken from command mailboxes.
///
/// The commands of one run are staged back to back: each one sees the
/// aggregate as the previous one left it, and its stream is queued for commit
/// right away. The run then waits for the outcomes in order. After the first
/// stream that does not commit, every later command of the run is executed
/// again on a reloaded aggregate.
pub struct CommandExecutor<A: StoredAggregate, P: CommandPayload> {
    handlers: Arc<CommandHandlerRegistry<A, P>>,
    cache: Arc<MemoryCache<A>>,
    storage: Arc<AggregateStorage<A>>,
    committing: Arc<CommittingMailboxes<A>>,
    memo: Arc<CommandMemo>,
    max_conflict_retries: u32,
}

impl<A: StoredAggregate, P: CommandPayload> CommandExecutor<A, P> {
    pub fn new(
        handlers: Arc<CommandHandlerRegistry<A, P>>,
        cache: Arc<MemoryCache<A>>,
        storage: Arc<AggregateStorage<A>>,
        committing: Arc<CommittingMailboxes<A>>,
        memo: Arc<CommandMemo>,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            handlers,
            cache,
            storage,
            committing,
            memo,
            max_conflict_retries,
        }
    }

    /// Execute one command on its own until it has a terminal result.
    async fn execute(&self, mut command: Command<P>, mut conflict: Option<Conflict>, worker: &mut Worker) -> CommandResult {
        loop {
            let mut conflicted = None;
            if let Some(Conflict {
                aggregate_id,
                detail,
                settled,
            }) = conflict.take()
            {
                if command.retry_count() >= self.max_conflict_retries {
                    warn!(
                        command_id = %command.id(),
                        aggregate_id = %aggregate_id,
                        retries = command.retry_count(),
                        "conflict retries exhausted"
                    );
                    return CommandResult::failed(
                        command.id(),
                        Some(aggregate_id),
                        CommandFailure::new(FailureKind::Conflict, detail),
                    );
                }
                if let Some(mut settled) = settled {
                    let _ = worker.suspend(settled.changed()).await;
                }
                command.record_retry();
                conflicted = Some(aggregate_id);
                info!(
                    command_id = %command.id(),
                    aggregate_id = %aggregate_id,
                    retry = command.retry_count(),
                    "re-executing command on a fresh aggregate"
                );
            }

            let chain = StreamChain::new();
            match self.stage(&command, None, conflicted, &chain, worker).await {
                Staged::Done(result) => return result,
                Staged::Rejected { aggregate_id, settled } => {
                    conflict = Some(Conflict::pending(aggregate_id, settled));
                }
                Staged::Queued {
                    aggregate_id, outcome, ..
                } => match worker.suspend(outcome).await {
                    Ok(CommitOutcome::Committed { version }) => {
                        return CommandResult::success(command.id(), aggregate_id, version);
                    }
                    Ok(CommitOutcome::Conflict { detail }) => {
                        conflict = Some(Conflict {
                            aggregate_id,
                            detail,
                            settled: None,
                        });
                    }
                    Ok(CommitOutcome::Failed(err)) => {
                        return CommandResult::failed(command.id(), Some(aggregate_id), err.into());
                    }
                    Err(_) => return abandoned(command.id(), aggregate_id),
                },
            }
        }
    }

    /// Load → handle → queue the stream for commit, without waiting for it.
    ///
    /// `head` is the pipelined aggregate left by the previous command of the
    /// run. `conflicted` is the aggregate a previous attempt collided on; it
    /// forces a storage reload and gives creations a target to load.
    async fn stage(
        &self,
        command: &Command<P>,
        head: Option<AggregateRoot<A>>,
        conflicted: Option<AggregateId>,
        chain: &StreamChain,
        worker: &mut Worker,
    ) -> Staged<A> {
        let command_id = command.id();
        let failed = |aggregate_id, err: EngineError| Staged::Done(CommandResult::failed(command_id, aggregate_id, err.into()));

        let handler = match self.handlers.resolve(command.command_type()) {
            Ok(handler) => handler,
            Err(err) => return failed(command.aggregate_id(), err.into()),
        };

        let target = command.aggregate_id().or(conflicted);
        let loaded = match (head, target) {
            (Some(head), Some(id)) if head.id() == id => Some(head),
            (_, Some(id)) => match self.load(id, conflicted.is_some(), worker).await {
                Ok(loaded) => loaded,
                Err(err) => return failed(Some(id), err),
            },
            (_, None) => None,
        };

        let mut ctx = CommandContext::new(command_id, loaded);
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&mut ctx, command))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let kind = if err.is_conflict() {
                    FailureKind::Conflict
                } else {
                    FailureKind::Validation
                };
                debug!(command_id = %command_id, error = %err, "command rejected by handler");
                return Staged::Done(CommandResult::failed(
                    command_id,
                    target,
                    CommandFailure::new(kind, err.to_string()),
                ));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    command_id = %command_id,
                    command_type = command.command_type(),
                    panic = message,
                    "command handler panicked"
                );
                return Staged::Done(CommandResult::failed(
                    command_id,
                    target,
                    CommandFailure::new(FailureKind::Validation, format!("command handler panicked: {message}")),
                ));
            }
        }

        let Some(root) = ctx.into_aggregate() else {
            return Staged::Done(CommandResult::nothing_changed(command_id, target, 0));
        };
        if let Some(expected) = command.aggregate_id() {
            if root.id() != expected {
                return failed(
                    Some(expected),
                    EngineError::Validation(format!(
                        "handler produced aggregate {} for a command targeting {expected}",
                        root.id()
                    )),
                );
            }
        }
        if !root.has_changes() {
            return Staged::Done(CommandResult::nothing_changed(command_id, Some(root.id()), root.version()));
        }

        let aggregate_id = root.id();
        let records = match encode_events::<A>(root.uncommitted()) {
            Ok(records) => records,
            Err(err) => return failed(Some(aggregate_id), err),
        };
        let stream = EventStream::new(aggregate_id, A::AGGREGATE_TYPE, root.next_version(), command_id, records);
        debug!(stream_id = %stream.stream_id(), command_id = %command_id, "stream staged for commit");

        let mut next = root.clone();
        let head = next.accept_changes(stream.version()).ok().map(|()| next);

        let (tx, outcome) = oneshot::channel();
        let ctx = EventCommittingContext::new(stream, root, tx).in_chain(chain);
        let (admission, settled) = self
            .committing
            .enqueue_watched(&aggregate_id.to_string(), ctx, DedupQueue::new);
        match admission {
            Admission::Rejected(ctx) => {
                debug!(stream_id = %ctx.stream().stream_id(), "same stream already pending, waiting for it to settle");
                Staged::Rejected { aggregate_id, settled }
            }
            Admission::Queued | Admission::Deferred => Staged::Queued {
                aggregate_id,
                outcome,
                head,
            },
        }
    }

    async fn load(&self, id: AggregateId, fresh: bool, worker: &mut Worker) -> Result<Option<AggregateRoot<A>>, EngineError> {
        if !fresh {
            if let Some(root) = self.cache.get(id) {
                return Ok(Some(root));
            }
        }
        let loaded = worker.suspend(self.storage.load(id)).await?;
        match &loaded {
            Some(root) => self.cache.update(root.clone()),
            None => {
                self.cache.evict(id);
            }
        }
        Ok(loaded)
    }

    fn finish(&self, result: CommandResult, replies: Vec<oneshot::Sender<CommandResult>>) {
        self.memo.record(&result);
        for reply in replies {
            let _ = reply.send(result.clone());
        }
    }
}

fn abandoned(command_id: CommandId, aggregate_id: AggregateId) -> CommandResult {
    CommandResult::failed(
        command_id,
        Some(aggregate_id),
        CommandFailure::new(FailureKind::TransientIo, "commit abandoned"),
    )
}

#[async_trait]
impl<A: StoredAggregate, P: CommandPayload> MailboxHandler<ProcessingCommand<P>> for CommandExecutor<A, P> {
    async fn handle(&self, key: &str, batch: Vec<ProcessingCommand<P>>, worker: &mut Worker) -> Result<(), EngineError> {
        let chain = StreamChain::new();
        let mut head: Option<AggregateRoot<A>> = None;
        let mut cut = false;
        let mut steps: Vec<Step<P>> = Vec::with_capacity(batch.len());

        for ProcessingCommand { command, reply } in batch {
            if let Some(result) = self.memo.get(command.id()) {
                debug!(command_id = %command.id(), mailbox = key, "command already completed");
                let _ = reply.send(result);
                continue;
            }
            if let Some(step) = steps.iter_mut().find(|step| step.command_id() == command.id()) {
                debug!(command_id = %command.id(), mailbox = key, "command already in this run");
                step.replies().push(reply);
                continue;
            }
            if cut {
                steps.push(Step::Rerun {
                    command,
                    replies: vec![reply],
                    conflict: None,
                });
                continue;
            }

            match self.stage(&command, head.clone(), None, &chain, worker).await {
                Staged::Done(result) => steps.push(Step::Finished {
                    command,
                    replies: vec![reply],
                    result,
                }),
                Staged::Queued {
                    aggregate_id,
                    outcome,
                    head: next,
                } => {
                    head = next;
                    steps.push(Step::Committing {
                        command,
                        replies: vec![reply],
                        aggregate_id,
                        outcome,
                    });
                }
                Staged::Rejected { aggregate_id, settled } => {
                    cut = true;
                    steps.push(Step::Rerun {
                        command,
                        replies: vec![reply],
                        conflict: Some(Conflict::pending(aggregate_id, settled)),
                    });
                }
            }
        }

        let mut broken = false;
        let mut reruns = Vec::new();
        for step in steps {
            match step {
                Step::Committing {
                    command,
                    replies,
                    aggregate_id,
                    outcome,
                } => match worker.suspend(outcome).await {
                    Ok(CommitOutcome::Committed { version }) => {
                        self.finish(CommandResult::success(command.id(), aggregate_id, version), replies);
                    }
                    _ if broken => reruns.push((command, replies, None)),
                    Ok(CommitOutcome::Conflict { detail }) => {
                        broken = true;
                        let conflict = Conflict {
                            aggregate_id,
                            detail,
                            settled: None,
                        };
                        reruns.push((command, replies, Some(conflict)));
                    }
                    Ok(CommitOutcome::Failed(err)) => {
                        broken = true;
                        self.finish(CommandResult::failed(command.id(), Some(aggregate_id), err.into()), replies);
                    }
                    Err(_) => {
                        broken = true;
                        self.finish(abandoned(command.id(), aggregate_id), replies);
                    }
                },
                Step::Finished { command, replies, .. } if broken => reruns.push((command, replies, None)),
                Step::Finished { replies, result, .. } => self.finish(result, replies),
                Step::Rerun {
                    command,
                    replies,
                    conflict,
                } => reruns.push((command, replies, conflict)),
            }
        }

        for (command, replies, conflict) in reruns {
            let result = self.execute(command, conflict, worker).await;
            self.finish(result, replies);
        }
        Ok(())
    }
}

/// Front door of the command pipeline.
pub struct CommandService<P: CommandPayload> {
    mailboxes: Arc<CommandMailboxes<P>>,
    memo: Arc<CommandMemo>,
    default_timeout: Duration,
}

impl<P: CommandPayload> CommandService<P> {
    pub fn new(mailboxes: Arc<CommandMailboxes<P>>, memo: Arc<CommandMemo>, default_timeout: Duration) -> Self {
        Self {
            mailboxes,
            memo,
            default_timeout,
        }
    }

    /// Enqueue `command`; the receiver yields its result.
    pub fn send(&self, command: Command<P>) -> oneshot::Receiver<CommandResult> {
        let (processing, rx) = ProcessingCommand::new(command);
        if let Some(result) = self.memo.get(processing.command().id()) {
            debug!(command_id = %result.command_id, "returning memoized result");
            processing.complete(result);
            return rx;
        }

        let key = processing.command().routing_key();
        debug!(
            command_id = %processing.command().id(),
            command_type = processing.command().command_type(),
            mailbox = %key,
            "command submitted"
        );
        self.mailboxes.enqueue(&key, processing, FifoQueue::new);
        rx
    }

    /// Send and wait up to `timeout`. A timeout does not cancel the command.
    pub async fn execute(&self, command: Command<P>, timeout: Duration) -> Result<CommandResult, CommandError> {
        let command_id = command.id();
        match tokio::time::timeout(timeout, self.send(command)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CommandError::Abandoned(command_id)),
            Err(_) => {
                warn!(command_id = %command_id, timeout = ?timeout, "command timed out");
                Err(CommandError::Timeout { command_id, timeout })
            }
        }
    }

    /// [`CommandService::execute`] with the configured `command_timeout`.
    pub async fn execute_default(&self, command: Command<P>) -> Result<CommandResult, CommandError> {
        self.execute(command, self.default_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_failure_kinds() {
        let failure = CommandFailure::from(EngineError::Reconstruction("gap".into()));
        assert_eq!(failure.kind, FailureKind::Reconstruction);
        assert!(failure.message.contains("gap"));
    }

    #[test]
    fn memo_keeps_only_non_failed_results() {
        let memo = CommandMemo::new(Duration::from_secs(60));
        let ok = CommandResult::success(CommandId::new(), AggregateId::new(), 1);
        let failed = CommandResult::failed(
            CommandId::new(),
            None,
            CommandFailure::new(FailureKind::Validation, "nope"),
        );

        memo.record(&ok);
        memo.record(&failed);

        assert_eq!(memo.get(ok.command_id), Some(ok));
        assert_eq!(memo.get(failed.command_id), None);
    }

    #[test]
    fn memo_entries_expire() {
        let memo = CommandMemo::new(Duration::ZERO);
        memo.record(&CommandResult::nothing_changed(CommandId::new(), None, 0));
        assert_eq!(memo.reap(), 1);
        assert!(memo.is_empty());
    }
}
