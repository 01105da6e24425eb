use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use super::handler::{run_command, HandleCommand};
use super::outcome::{
    CommandError, CommandOutcome, CommandState, DispatcherError, DispatcherStats, FireOptions,
    TimeoutKind,
};
use super::sender::CommandSender;
use crate::bus::{Bus, Subscription};
use crate::config::{DispatcherConfig, QueueConfig};
use crate::message::{
    AckCommand, AnyResponse, CancelCommand, CancellationToken, Command, CommandFault,
    CommandResponse, Fail, Message, MessageId, MessageType, SourceCommand, Success, TypeTag,
};
use crate::queued::{QueueStats, QueuedHandler};
use crate::recent::RecentIds;
use crate::sync::lock;

/// How many resolved command ids are remembered for duplicate detection.
const RESOLVED_CAPACITY: usize = 1024;

enum Signal {
    Acked,
    Responded(CommandResponse),
}

struct Pending {
    tx: Sender<Signal>,
    state: CommandState,
    command_type: &'static str,
}

/// Type-erased control over one command type's handler queue.
trait HandlerQueue: Send + Sync {
    fn request_stop(&self);
    fn stats(&self) -> QueueStats;
}

impl<T: ?Sized + Send + Sync + 'static> HandlerQueue for QueuedHandler<T> {
    fn request_stop(&self) {
        QueuedHandler::request_stop(self);
    }

    fn stats(&self) -> QueueStats {
        QueuedHandler::stats(self)
    }
}

struct RegisteredHandler {
    subscription: Subscription,
    queue: Box<dyn HandlerQueue>,
}

#[derive(Default)]
struct Counters {
    fired: AtomicU64,
    sent: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    not_handled: AtomicU64,
    ack_timeouts: AtomicU64,
    response_timeouts: AtomicU64,
    oversubscribed: AtomicU64,
    late_responses: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) struct DispatcherCore {
    bus: Bus,
    config: DispatcherConfig,
    pending: Mutex<HashMap<MessageId, Pending>>,
    /// Terminal states of recently finished commands. Guarded together with
    /// `pending`: always locked after it.
    resolved: Mutex<RecentIds<CommandState>>,
    handlers: Mutex<HashMap<TypeTag, RegisteredHandler>>,
    tokens: Mutex<HashMap<MessageId, CancellationToken>>,
    outbound: QueuedHandler<dyn Message>,
    listeners: Mutex<Vec<Subscription>>,
    counters: Counters,
    shut_down: AtomicBool,
}

impl DispatcherCore {
    pub(crate) fn register_token(&self, id: MessageId, token: CancellationToken) {
        lock(&self.tokens).insert(id, token);
    }

    pub(crate) fn release_token(&self, id: &MessageId) {
        lock(&self.tokens).remove(id);
    }

    fn timeouts(&self, options: &FireOptions) -> (Duration, Duration) {
        (
            options.ack_timeout.unwrap_or_else(|| self.config.ack_timeout()),
            options
                .response_timeout
                .unwrap_or_else(|| self.config.response_timeout()),
        )
    }

    /// A route on the command's own type, local handler or transport
    /// outbound alike. Family routes (`AnyCommand` and friends) do not
    /// count: they observe commands without answering them.
    fn has_handler(&self, command: &dyn Message) -> bool {
        match self.bus.registry().ensure(command.descriptor()) {
            Ok(tag) => self.bus.has_subscriber_for_tag(tag, false),
            Err(err) => {
                error!(command = command.type_name(), error = %err, "command type cannot be registered");
                false
            }
        }
    }

    fn transition(&self, id: MessageId, command_type: &str, from: CommandState, to: CommandState) {
        debug!(command_id = %id, command = command_type, ?from, ?to, "command state");
    }

    fn on_ack(&self, ack: &AckCommand) {
        let mut pending = lock(&self.pending);
        let Some(entry) = pending.get_mut(&ack.command_id()) else {
            return;
        };
        if entry.state == CommandState::Submitted {
            self.transition(ack.command_id(), entry.command_type, entry.state, CommandState::Acked);
            entry.state = CommandState::Acked;
            let _ = entry.tx.send(Signal::Acked);
        }
    }

    fn on_response(&self, message: &Arc<dyn Message>) {
        let Some(response) = CommandResponse::from_message(message) else {
            return;
        };
        let id = response.source().id();

        let mut pending = lock(&self.pending);
        match pending.remove(&id) {
            Some(entry) => {
                let state = match &response {
                    CommandResponse::Success(_) => CommandState::Succeeded,
                    CommandResponse::Fail(_) => CommandState::Failed,
                    CommandResponse::Canceled(_) => CommandState::Canceled,
                };
                lock(&self.resolved).insert(id, state);
                drop(pending);

                self.transition(id, entry.command_type, entry.state, state);
                let _ = entry.tx.send(Signal::Responded(response));
            }
            None => {
                let previous = lock(&self.resolved).get(&id).copied();
                drop(pending);

                match previous {
                    Some(state) if state.is_responded() => {
                        bump(&self.counters.oversubscribed);
                        error!(
                            command_id = %id,
                            command = response.source().type_name(),
                            first = ?state,
                            "oversubscription: command already resolved; response ignored"
                        );
                    }
                    Some(state) => {
                        bump(&self.counters.late_responses);
                        debug!(command_id = %id, ?state, "late response after timeout discarded");
                    }
                    None => {
                        trace!(command_id = %id, "response for a command not fired here");
                    }
                }
            }
        }
    }

    fn on_cancel(&self, cancel: &CancelCommand) {
        if let Some(token) = lock(&self.tokens).get(&cancel.command_id()) {
            token.cancel();
            debug!(command_id = %cancel.command_id(), command = cancel.command_type(), "cancellation requested");
        }
    }

    /// Remove a still-pending command on timeout. `false` means a response
    /// got there first.
    fn expire(&self, id: MessageId, kind: TimeoutKind) -> bool {
        let mut pending = lock(&self.pending);
        let Some(entry) = pending.remove(&id) else {
            return false;
        };
        let state = match kind {
            TimeoutKind::NoAck => CommandState::TimedOutNoAck,
            TimeoutKind::NoResponse => CommandState::TimedOutNoResponse,
        };
        lock(&self.resolved).insert(id, state);
        drop(pending);

        self.transition(id, entry.command_type, entry.state, state);
        true
    }

    fn execute(
        &self,
        command: Arc<dyn Message>,
        token: Option<CancellationToken>,
        options: &FireOptions,
    ) -> CommandOutcome {
        bump(&self.counters.fired);
        let (ack_timeout, response_timeout) = self.timeouts(options);
        let id = command.id();
        let command_type = command.type_name();

        if !self.has_handler(command.as_ref()) {
            bump(&self.counters.not_handled);
            warn!(command_id = %id, command = command_type, "no handler registered");
            return CommandOutcome::NotHandled;
        }

        let (tx, rx) = channel();
        lock(&self.pending).insert(
            id,
            Pending {
                tx,
                state: CommandState::Submitted,
                command_type,
            },
        );
        debug!(command_id = %id, command = command_type, "command submitted");

        if let Some(token) = token {
            self.register_token(id, token);
        }

        // Delivered from the outbound worker so this thread never runs the
        // handler itself.
        let outcome = if self.outbound.enqueue(Arc::clone(&command)) {
            self.await_outcome(&command, rx, ack_timeout, response_timeout)
        } else {
            lock(&self.pending).remove(&id);
            CommandOutcome::NotHandled
        };
        self.release_token(&id);

        let counter = match &outcome {
            CommandOutcome::Succeeded(_) => &self.counters.succeeded,
            CommandOutcome::Failed(_) => &self.counters.failed,
            CommandOutcome::Canceled(_) => &self.counters.canceled,
            CommandOutcome::TimedOut(TimeoutKind::NoAck) => &self.counters.ack_timeouts,
            CommandOutcome::TimedOut(TimeoutKind::NoResponse) => &self.counters.response_timeouts,
            CommandOutcome::NotHandled => &self.counters.not_handled,
        };
        bump(counter);
        outcome
    }

    fn await_outcome(
        &self,
        command: &Arc<dyn Message>,
        rx: Receiver<Signal>,
        ack_timeout: Duration,
        response_timeout: Duration,
    ) -> CommandOutcome {
        let id = command.id();
        let ack_deadline = Instant::now() + ack_timeout;
        // Starts when the ack is observed.
        let mut response_deadline: Option<Instant> = None;

        loop {
            let deadline = response_deadline.unwrap_or(ack_deadline);
            let kind = if response_deadline.is_some() {
                TimeoutKind::NoResponse
            } else {
                TimeoutKind::NoAck
            };

            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(Signal::Acked) => {
                    if response_deadline.is_none() {
                        response_deadline = Some(Instant::now() + response_timeout);
                    }
                }
                Ok(Signal::Responded(response)) => return response.into(),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.expire(id, kind) {
                        while let Ok(signal) = rx.try_recv() {
                            if let Signal::Responded(response) = signal {
                                return response.into();
                            }
                        }
                    } else if kind == TimeoutKind::NoResponse {
                        warn!(command_id = %id, command = command.type_name(), "no response; requesting cancellation");
                        self.bus.publish(CancelCommand::for_command(command.as_ref()));
                    } else {
                        warn!(command_id = %id, command = command.type_name(), "command was never acknowledged");
                    }
                    return CommandOutcome::TimedOut(kind);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(command_id = %id, "dispatcher shut down while waiting");
                    return CommandOutcome::TimedOut(kind);
                }
            }
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let listeners: Vec<Subscription> = lock(&self.listeners).drain(..).collect();
        for subscription in &listeners {
            self.bus.unsubscribe(subscription);
        }

        let handlers: Vec<RegisteredHandler> = lock(&self.handlers).drain().map(|(_, h)| h).collect();
        for handler in &handlers {
            self.bus.unsubscribe(&handler.subscription);
            handler.queue.request_stop();
        }

        self.outbound.request_stop();
        // Dropping the senders wakes every waiting caller.
        lock(&self.pending).clear();
        debug!(bus = %self.bus.name(), "dispatcher shut down");
    }
}

impl Drop for DispatcherCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Returned by [`Dispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSubscription {
    tag: TypeTag,
    command_type: &'static str,
}

impl CommandSubscription {
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn command_type(&self) -> &'static str {
        self.command_type
    }
}

/// Synchronous request/response over the asynchronous [`Bus`].
///
/// Each command type has at most one handler per dispatcher. The handler
/// runs on its own [`QueuedHandler`], which publishes an [`AckCommand`]
/// when it picks a command up and exactly one response when it is done.
/// [`fire`](Self::fire) blocks until that response arrives:
///
/// - up to the ack timeout for the ack (none: "never picked up");
/// - then up to the response timeout, counted from the ack, for the
///   response (none: "did not finish", and a [`CancelCommand`] is sent).
///
/// A response that arrives before its ack is accepted. The first response
/// wins; another one for the same command is an oversubscription, logged
/// and counted but never surfaced to the caller.
///
/// Dropping the last clone shuts the dispatcher down. Handlers that hold a
/// clone (to fire nested commands) keep it alive; call
/// [`shutdown`](Self::shutdown) explicitly in that case.
///
/// ## Example
///
/// ```ignore
/// let dispatcher = Dispatcher::new(bus.clone(), DispatcherConfig::default())?;
///
/// dispatcher.subscribe(|cmd: &Arc<PlaceOrder>| {
///     if cmd.quantity == 0 {
///         return Err(HandlerError::rejected("empty order"));
///     }
///     Ok(())
/// })?;
///
/// let success = dispatcher.fire(PlaceOrder::new("sku-1", 2))?;
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    core: Arc<DispatcherCore>,
}

impl Dispatcher {
    pub fn new(bus: Bus, config: DispatcherConfig) -> Result<Self, DispatcherError> {
        let delivery_bus = bus.clone();
        let outbound = QueuedHandler::<dyn Message>::spawn(
            format!("{}-dispatch", bus.name()),
            QueueConfig::default(),
            move |command: Arc<dyn Message>| {
                delivery_bus.publish_arc(command);
            },
        )?;

        let core = Arc::new(DispatcherCore {
            bus: bus.clone(),
            config,
            pending: Mutex::new(HashMap::new()),
            resolved: Mutex::new(RecentIds::with_capacity(RESOLVED_CAPACITY)),
            handlers: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            outbound,
            listeners: Mutex::new(Vec::new()),
            counters: Counters::default(),
            shut_down: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&core);
        let acks = bus.subscribe(move |ack: &AckCommand| {
            if let Some(core) = weak.upgrade() {
                core.on_ack(ack);
            }
        })?;

        let weak = Arc::downgrade(&core);
        let responses = bus.subscribe_family::<AnyResponse, _>(move |message| {
            if let Some(core) = weak.upgrade() {
                core.on_response(message);
            }
        })?;

        let weak = Arc::downgrade(&core);
        let cancels = bus.subscribe(move |cancel: &CancelCommand| {
            if let Some(core) = weak.upgrade() {
                core.on_cancel(cancel);
            }
        })?;

        lock(&core.listeners).extend([acks, responses, cancels]);
        Ok(Self { core })
    }

    pub fn bus(&self) -> &Bus {
        &self.core.bus
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.core.config
    }

    /// Register the sole handler for `C`.
    pub fn subscribe<C, H>(&self, handler: H) -> Result<CommandSubscription, DispatcherError>
    where
        C: Command + MessageType,
        H: HandleCommand<C>,
    {
        let bus = &self.core.bus;
        let tag = bus.register::<C>()?;

        let mut handlers = lock(&self.core.handlers);
        if handlers.contains_key(&tag) {
            return Err(DispatcherError::DuplicateHandler { command: C::NAME });
        }

        let worker_bus = bus.clone();
        let weak = Arc::downgrade(&self.core);
        let mut handler = handler;
        let queue = QueuedHandler::<C>::spawn(
            format!("{}-handler", C::NAME),
            self.core.config.handler_queue.clone(),
            move |command: Arc<C>| run_command(&worker_bus, &weak, &mut handler, command),
        )?;
        let subscription = bus.subscribe_queued(&queue)?;

        handlers.insert(
            tag,
            RegisteredHandler {
                subscription,
                queue: Box::new(queue),
            },
        );
        debug!(command = C::NAME, "command handler registered");

        Ok(CommandSubscription {
            tag,
            command_type: C::NAME,
        })
    }

    /// Remove the handler for `C`; commands already queued still run.
    pub fn unsubscribe<C: Command + MessageType>(&self) -> bool {
        let Some(tag) = self.core.bus.registry().tag_of::<C>() else {
            return false;
        };
        let Some(handler) = lock(&self.core.handlers).remove(&tag) else {
            return false;
        };
        self.core.bus.unsubscribe(&handler.subscription);
        handler.queue.request_stop();
        debug!(command = C::NAME, "command handler removed");
        true
    }

    pub fn has_handler<C: Command + MessageType>(&self) -> bool {
        self.core
            .bus
            .registry()
            .tag_of::<C>()
            .map(|tag| lock(&self.core.handlers).contains_key(&tag))
            .unwrap_or(false)
    }

    /// Fire and wait, returning the outcome as a value.
    pub fn execute<C>(&self, command: C, options: FireOptions) -> CommandOutcome
    where
        C: Command + MessageType,
    {
        self.execute_arc(Arc::new(command), options)
    }

    pub fn execute_arc<C>(&self, command: Arc<C>, options: FireOptions) -> CommandOutcome
    where
        C: Command + MessageType,
    {
        let token = command.cancel_token().cloned();
        self.core.execute(command, token, &options)
    }

    /// Fire with the configured timeouts. A `Fail` comes back as
    /// [`CommandError::Failed`] carrying its fault.
    pub fn fire<C>(&self, command: C) -> Result<Arc<Success>, CommandError>
    where
        C: Command + MessageType,
    {
        self.fire_with(command, FireOptions::default())
    }

    pub fn fire_with<C>(&self, command: C, options: FireOptions) -> Result<Arc<Success>, CommandError>
    where
        C: Command + MessageType,
    {
        let (ack_timeout, response_timeout) = self.core.timeouts(&options);
        let command_type = C::NAME.to_string();

        match self.execute(command, options) {
            CommandOutcome::Succeeded(success) => Ok(success),
            CommandOutcome::Failed(fail) => Err(CommandError::Failed(fail.fault().clone())),
            CommandOutcome::Canceled(_) => Err(CommandError::Canceled {
                command: command_type,
            }),
            CommandOutcome::TimedOut(TimeoutKind::NoAck) => Err(CommandError::AckTimeout {
                command: command_type,
                timeout: ack_timeout,
            }),
            CommandOutcome::TimedOut(TimeoutKind::NoResponse) => Err(CommandError::ResponseTimeout {
                command: command_type,
                timeout: response_timeout,
            }),
            CommandOutcome::NotHandled => Err(CommandError::NotHandled {
                command: command_type,
            }),
        }
    }

    /// Never errors: failures, timeouts and missing handlers come back as a
    /// `Fail` response. Check [`CommandResponse::is_success`].
    pub fn try_fire<C>(&self, command: C) -> CommandResponse
    where
        C: Command + MessageType,
    {
        self.try_fire_with(command, FireOptions::default())
    }

    pub fn try_fire_with<C>(&self, command: C, options: FireOptions) -> CommandResponse
    where
        C: Command + MessageType,
    {
        let (ack_timeout, response_timeout) = self.core.timeouts(&options);
        let command = Arc::new(command);

        let fault = match self.execute_arc(Arc::clone(&command), options) {
            CommandOutcome::Succeeded(r) => return CommandResponse::Success(r),
            CommandOutcome::Failed(r) => return CommandResponse::Fail(r),
            CommandOutcome::Canceled(r) => return CommandResponse::Canceled(r),
            CommandOutcome::TimedOut(TimeoutKind::NoAck) => CommandFault::AckTimeout {
                command: C::NAME.to_string(),
                timeout_ms: ack_timeout.as_millis() as u64,
            },
            CommandOutcome::TimedOut(TimeoutKind::NoResponse) => CommandFault::ResponseTimeout {
                command: C::NAME.to_string(),
                timeout_ms: response_timeout.as_millis() as u64,
            },
            CommandOutcome::NotHandled => CommandFault::NotHandled {
                command: C::NAME.to_string(),
            },
        };

        let source: Arc<dyn Message> = command;
        CommandResponse::Fail(Arc::new(Fail::new(SourceCommand::of(source), fault)))
    }

    /// Fire and forget: checks a handler exists, then returns without
    /// waiting for the ack or the response.
    pub fn send<C>(&self, command: C) -> Result<(), CommandError>
    where
        C: Command + MessageType,
    {
        let command: Arc<dyn Message> = Arc::new(command);
        if !self.core.has_handler(command.as_ref()) || !self.core.outbound.enqueue(command) {
            bump(&self.core.counters.not_handled);
            return Err(CommandError::NotHandled {
                command: C::NAME.to_string(),
            });
        }
        bump(&self.core.counters.sent);
        Ok(())
    }

    /// Broadcast a [`CancelCommand`] for `command`. Best effort.
    pub fn request_cancel<M: Message + ?Sized>(&self, command: &M) {
        debug!(command_id = %command.id(), command = command.type_name(), "publishing cancel request");
        self.core.bus.publish(CancelCommand::for_command(command));
    }

    /// Commands currently awaiting their outcome.
    pub fn pending_count(&self) -> usize {
        lock(&self.core.pending).len()
    }

    /// Current state of a pending command, or the final state of a
    /// recently finished one.
    pub fn state_of(&self, id: MessageId) -> Option<CommandState> {
        let pending = lock(&self.core.pending);
        if let Some(entry) = pending.get(&id) {
            return Some(entry.state);
        }
        let state = lock(&self.core.resolved).get(&id).copied();
        state
    }

    pub fn handler_stats<C: Command + MessageType>(&self) -> Option<QueueStats> {
        let tag = self.core.bus.registry().tag_of::<C>()?;
        lock(&self.core.handlers).get(&tag).map(|h| h.queue.stats())
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.core.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DispatcherStats {
            fired: load(&c.fired),
            sent: load(&c.sent),
            succeeded: load(&c.succeeded),
            failed: load(&c.failed),
            canceled: load(&c.canceled),
            not_handled: load(&c.not_handled),
            ack_timeouts: load(&c.ack_timeouts),
            response_timeouts: load(&c.response_timeouts),
            oversubscribed: load(&c.oversubscribed),
            late_responses: load(&c.late_responses),
        }
    }

    /// Unsubscribe everything, stop all queues, release waiting callers.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}

impl CommandSender for Dispatcher {
    fn fire_command<C>(&self, command: C) -> Result<Arc<Success>, CommandError>
    where
        C: Command + MessageType,
    {
        self.fire(command)
    }

    fn send_command<C>(&self, command: C) -> Result<(), CommandError>
    where
        C: Command + MessageType,
    {
        self.send(command)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("bus", &self.core.bus.name())
            .field("pending", &self.pending_count())
            .finish()
    }
}
