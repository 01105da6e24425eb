mod support;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use courier::{
    AnyCommand, Bus, CancelCommand, CommandError, CommandFault, CommandOutcome, CommandSender, CommandState,
    Dispatcher, DispatcherConfig, DispatcherError, FireOptions, HandlerError, Message,
    MessageRegistry, Success, TimeoutKind,
};
use support::{sleep_unless_canceled, wait_until, CloseAccount, Deposit, Recorder, Reconcile};

fn dispatcher(name: &str) -> Dispatcher {
    let bus = Bus::with_registry(name, Arc::new(MessageRegistry::new()));
    let config = DispatcherConfig::default()
        .with_ack_timeout(Duration::from_millis(500))
        .with_response_timeout(Duration::from_secs(5));
    Dispatcher::new(bus, config).unwrap()
}

/// Reconcile handler that works for `millis` unless canceled first.
fn handle_reconcile(dispatcher: &Dispatcher, started: Recorder<u64>, finished: Recorder<&'static str>) {
    dispatcher
        .subscribe::<Reconcile, _>(move |cmd: &Arc<Reconcile>| -> Result<(), HandlerError> {
            started.push(cmd.millis);
            if sleep_unless_canceled(&cmd.token, Duration::from_millis(cmd.millis)) {
                finished.push("done");
                Ok(())
            } else {
                finished.push("canceled");
                Err(HandlerError::Canceled)
            }
        })
        .unwrap();
}

// =============================================================================
// Success and failure
// =============================================================================

#[test]
fn fire_returns_the_correlated_success() {
    let dispatcher = dispatcher("fire");
    let balances = Recorder::<u64>::new();
    let sink = balances.clone();
    dispatcher
        .subscribe::<Deposit, _>(move |cmd: &Arc<Deposit>| -> Result<(), HandlerError> {
            sink.push(cmd.amount);
            Ok(())
        })
        .unwrap();

    let deposit = Deposit::new("acc-1", 25);
    let id = deposit.id();
    let correlation = deposit.correlation_id();

    let success = dispatcher.fire(deposit).unwrap();

    assert_eq!(success.source().id(), id);
    assert_eq!(success.correlation_id(), correlation);
    assert_eq!(success.causation_id(), Some(id));
    assert_eq!(success.source().downcast::<Deposit>().unwrap().amount, 25);
    assert_eq!(balances.items(), vec![25]);
    assert_eq!(dispatcher.state_of(id), Some(CommandState::Succeeded));
    assert_eq!(dispatcher.pending_count(), 0);
    assert_eq!(dispatcher.stats().succeeded, 1);
}

#[test]
fn rejected_and_failing_handlers_become_faults() {
    let dispatcher = dispatcher("faults");
    dispatcher
        .subscribe::<Deposit, _>(|cmd: &Arc<Deposit>| -> Result<(), HandlerError> {
            match cmd.amount {
                0 => Err(HandlerError::rejected("zero deposit")),
                1 => Err(HandlerError::failed("ledger unavailable")),
                _ => panic!("amount too large"),
            }
        })
        .unwrap();

    let err = dispatcher.fire(Deposit::new("a", 0)).unwrap_err();
    assert_eq!(
        err,
        CommandError::Failed(CommandFault::Rejected {
            command: "bank.Deposit".into(),
            reason: "zero deposit".into(),
        })
    );

    let err = dispatcher.fire(Deposit::new("a", 1)).unwrap_err();
    assert!(matches!(
        err,
        CommandError::Failed(CommandFault::HandlerFailed { message, .. }) if message == "ledger unavailable"
    ));

    let err = dispatcher.fire(Deposit::new("a", 2)).unwrap_err();
    assert!(matches!(
        err,
        CommandError::Failed(CommandFault::HandlerPanicked { message, .. }) if message == "amount too large"
    ));

    // The handler queue survives the panic.
    assert!(dispatcher.fire(Deposit::new("a", 0)).is_err());
    assert_eq!(dispatcher.stats().failed, 4);
}

#[test]
fn try_fire_reports_everything_as_a_response() {
    let dispatcher = dispatcher("try-fire");
    dispatcher
        .subscribe::<Deposit, _>(|cmd: &Arc<Deposit>| -> Result<(), HandlerError> {
            if cmd.amount == 0 {
                Err(HandlerError::rejected("zero"))
            } else {
                Ok(())
            }
        })
        .unwrap();

    assert!(dispatcher.try_fire(Deposit::new("a", 5)).is_success());

    let response = dispatcher.try_fire(Deposit::new("a", 0));
    assert!(matches!(response.fault(), Some(CommandFault::Rejected { .. })));

    let close = CloseAccount::new("a");
    let id = close.id();
    let response = dispatcher.try_fire(close);
    assert_eq!(response.source().id(), id);
    assert_eq!(
        response.fault(),
        Some(&CommandFault::NotHandled {
            command: "bank.CloseAccount".into()
        })
    );
}

#[test]
fn execute_exposes_the_outcome() {
    let dispatcher = dispatcher("execute");
    dispatcher
        .subscribe::<Deposit, _>(|_: &Arc<Deposit>| -> Result<(), HandlerError> { Ok(()) })
        .unwrap();

    let outcome = dispatcher.execute(Deposit::new("a", 1), FireOptions::new());
    assert!(outcome.is_success());

    let outcome = dispatcher.execute(CloseAccount::new("a"), FireOptions::new());
    assert!(matches!(outcome, CommandOutcome::NotHandled));
}

// =============================================================================
// Registration
// =============================================================================

#[test]
fn one_handler_per_command_type() {
    let dispatcher = dispatcher("duplicate");
    dispatcher
        .subscribe::<Deposit, _>(|_: &Arc<Deposit>| -> Result<(), HandlerError> { Ok(()) })
        .unwrap();

    let err = dispatcher
        .subscribe::<Deposit, _>(|_: &Arc<Deposit>| -> Result<(), HandlerError> { Ok(()) })
        .unwrap_err();
    assert!(matches!(err, DispatcherError::DuplicateHandler { command: "bank.Deposit" }));

    assert!(dispatcher.unsubscribe::<Deposit>());
    assert!(!dispatcher.has_handler::<Deposit>());
    assert!(matches!(
        dispatcher.fire(Deposit::new("a", 1)),
        Err(CommandError::NotHandled { .. })
    ));

    dispatcher
        .subscribe::<Deposit, _>(|_: &Arc<Deposit>| -> Result<(), HandlerError> { Ok(()) })
        .unwrap();
    assert!(dispatcher.fire(Deposit::new("a", 1)).is_ok());
}

// =============================================================================
// Timeouts
// =============================================================================

#[test]
fn unhandled_command_fails_fast() {
    let dispatcher = dispatcher("not-handled");

    let started = Instant::now();
    let err = dispatcher.fire(CloseAccount::new("acc-1")).unwrap_err();

    assert_eq!(
        err,
        CommandError::NotHandled {
            command: "bank.CloseAccount".into()
        }
    );
    assert!(started.elapsed() < dispatcher.config().ack_timeout());
    assert_eq!(dispatcher.stats().not_handled, 1);
}

#[test]
fn family_observers_do_not_count_as_a_handler() {
    let dispatcher = dispatcher("observed");
    let seen = Recorder::<&'static str>::new();
    let sink = seen.clone();
    dispatcher
        .bus()
        .subscribe_family::<AnyCommand, _>(move |m| sink.push(m.type_name()))
        .unwrap();

    let err = dispatcher.fire(CloseAccount::new("acc-1")).unwrap_err();
    assert!(matches!(err, CommandError::NotHandled { .. }));
    assert_eq!(seen.len(), 0);
}

#[test]
fn busy_handler_means_no_ack_within_the_timeout() {
    let dispatcher = dispatcher("no-ack");
    let started = Recorder::new();
    let finished = Recorder::new();
    handle_reconcile(&dispatcher, started.clone(), finished.clone());

    // Occupy the only worker.
    dispatcher.send(Reconcile::new(400)).unwrap();
    assert!(started.wait_for(1, Duration::from_secs(2)));

    let blocked = Reconcile::new(0);
    let id = blocked.id();
    let ack_timeout = Duration::from_millis(100);
    let err = dispatcher
        .fire_with(blocked, FireOptions::new().with_ack_timeout(ack_timeout))
        .unwrap_err();

    assert_eq!(
        err,
        CommandError::AckTimeout {
            command: "bank.Reconcile".into(),
            timeout: ack_timeout,
        }
    );
    assert_eq!(dispatcher.state_of(id), Some(CommandState::TimedOutNoAck));

    // It still runs eventually; its response is discarded as late.
    assert!(finished.wait_for(2, Duration::from_secs(2)));
    assert!(wait_until(Duration::from_secs(1), || dispatcher.stats().late_responses == 1));
    assert_eq!(dispatcher.stats().ack_timeouts, 1);
}

#[test]
fn response_timeout_requests_cancellation() {
    let dispatcher = dispatcher("no-response");
    let started = Recorder::new();
    let finished = Recorder::new();
    handle_reconcile(&dispatcher, started.clone(), finished.clone());

    let cancels = Recorder::new();
    let sink = cancels.clone();
    dispatcher
        .bus()
        .subscribe(move |cancel: &CancelCommand| sink.push(cancel.command_id()))
        .unwrap();

    let slow = Reconcile::new(5_000);
    let id = slow.id();
    let began = Instant::now();
    let outcome = dispatcher.execute(
        slow,
        FireOptions::new().with_response_timeout(Duration::from_millis(100)),
    );

    assert!(matches!(outcome, CommandOutcome::TimedOut(TimeoutKind::NoResponse)));
    assert!(began.elapsed() < Duration::from_secs(2));
    assert_eq!(cancels.items(), vec![id]);

    // The cooperative handler notices and stops early.
    assert!(finished.wait_for(1, Duration::from_secs(2)));
    assert_eq!(finished.items(), vec!["canceled"]);
    assert_eq!(dispatcher.state_of(id), Some(CommandState::TimedOutNoResponse));
    assert_eq!(dispatcher.stats().response_timeouts, 1);
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn request_cancel_stops_a_cooperative_handler() {
    let dispatcher = dispatcher("cancel");
    let started = Recorder::new();
    let finished = Recorder::new();
    handle_reconcile(&dispatcher, started.clone(), finished.clone());

    let command = Reconcile::new(5_000);
    let handle = command.clone();

    let caller = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || dispatcher.fire(command))
    };

    assert!(started.wait_for(1, Duration::from_secs(2)));
    dispatcher.request_cancel(&handle);

    let result = caller.join().unwrap();
    assert_eq!(
        result.unwrap_err(),
        CommandError::Canceled {
            command: "bank.Reconcile".into()
        }
    );
    assert_eq!(finished.items(), vec!["canceled"]);
    assert_eq!(dispatcher.state_of(handle.id()), Some(CommandState::Canceled));
}

#[test]
fn cancel_after_completion_changes_nothing() {
    let dispatcher = dispatcher("cancel-late");
    let started = Recorder::new();
    let finished = Recorder::new();
    handle_reconcile(&dispatcher, started, finished.clone());

    let command = Reconcile::new(0);
    let handle = command.clone();
    assert!(dispatcher.fire(command).is_ok());

    dispatcher.request_cancel(&handle);
    assert_eq!(finished.items(), vec!["done"]);
    assert_eq!(dispatcher.state_of(handle.id()), Some(CommandState::Succeeded));
}

#[test]
fn command_canceled_before_pickup_never_runs() {
    let dispatcher = dispatcher("precanceled");
    let started = Recorder::new();
    let finished = Recorder::new();
    handle_reconcile(&dispatcher, started.clone(), finished);

    let command = Reconcile::new(1_000);
    command.token.cancel();

    assert!(matches!(
        dispatcher.fire(command),
        Err(CommandError::Canceled { .. })
    ));
    assert_eq!(started.len(), 0);
}

#[test]
fn shared_token_cancels_nested_commands() {
    let dispatcher = dispatcher("nested");

    let child_started = Recorder::<u64>::new();
    let child_result = Recorder::<&'static str>::new();
    let (started, result) = (child_started.clone(), child_result.clone());
    dispatcher
        .subscribe::<Deposit, _>(move |cmd: &Arc<Deposit>| -> Result<(), HandlerError> {
            started.push(cmd.amount);
            let token = cmd.token.as_ref().ok_or_else(|| HandlerError::rejected("no token"))?;
            if sleep_unless_canceled(token, Duration::from_secs(5)) {
                result.push("done");
                Ok(())
            } else {
                result.push("canceled");
                Err(HandlerError::Canceled)
            }
        })
        .unwrap();

    let inner = dispatcher.clone();
    dispatcher
        .subscribe::<Reconcile, _>(move |cmd: &Arc<Reconcile>| -> Result<(), HandlerError> {
            let child = Deposit::new("acc-1", cmd.millis).with_token(cmd.token.clone());
            match inner.fire(child) {
                Ok(_) => Ok(()),
                Err(CommandError::Canceled { .. }) => Err(HandlerError::Canceled),
                Err(err) => Err(HandlerError::failed(err)),
            }
        })
        .unwrap();

    let parent = Reconcile::new(7);
    let handle = parent.clone();
    let caller = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || dispatcher.fire(parent))
    };

    assert!(child_started.wait_for(1, Duration::from_secs(2)));
    dispatcher.request_cancel(&handle);

    assert!(matches!(
        caller.join().unwrap(),
        Err(CommandError::Canceled { .. })
    ));
    assert_eq!(child_result.items(), vec!["canceled"]);

    // The Reconcile handler holds a clone; break the cycle.
    dispatcher.shutdown();
}

// =============================================================================
// At most one response
// =============================================================================

#[test]
fn extra_responses_are_reported_not_delivered() {
    let dispatcher = dispatcher("oversubscribed");
    let bus = dispatcher.bus().clone();
    dispatcher
        .subscribe::<Deposit, _>(move |cmd: &Arc<Deposit>| -> Result<(), HandlerError> {
            // A misbehaving handler answers for itself, then fails.
            bus.publish(Success::for_command(cmd));
            Err(HandlerError::rejected("second answer"))
        })
        .unwrap();

    let result = dispatcher.fire(Deposit::new("a", 1));

    assert!(result.is_ok());
    assert!(wait_until(Duration::from_secs(1), || dispatcher.stats().oversubscribed == 1));
    assert_eq!(dispatcher.stats().succeeded, 1);
    assert_eq!(dispatcher.stats().failed, 0);
}

#[test]
fn concurrent_callers_each_get_their_own_response() {
    let dispatcher = dispatcher("concurrent");
    dispatcher
        .subscribe::<Deposit, _>(|_: &Arc<Deposit>| -> Result<(), HandlerError> { Ok(()) })
        .unwrap();

    let callers: Vec<_> = (0..8u64)
        .map(|n| {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                (0..25u64)
                    .map(|i| {
                        let deposit = Deposit::new("a", n * 100 + i);
                        let id = deposit.id();
                        let success = dispatcher.fire(deposit).unwrap();
                        assert_eq!(success.source().id(), id);
                    })
                    .count()
            })
        })
        .collect();

    let total: usize = callers.into_iter().map(|c| c.join().unwrap()).sum();
    assert_eq!(total, 200);
    assert_eq!(dispatcher.stats().succeeded, 200);
    assert_eq!(dispatcher.stats().oversubscribed, 0);
    assert_eq!(dispatcher.pending_count(), 0);
}

// =============================================================================
// Fire and forget
// =============================================================================

#[test]
fn send_does_not_wait() {
    let dispatcher = dispatcher("send");
    let started = Recorder::new();
    let finished = Recorder::new();
    handle_reconcile(&dispatcher, started, finished.clone());

    let began = Instant::now();
    dispatcher.send(Reconcile::new(200)).unwrap();
    assert!(began.elapsed() < Duration::from_millis(150));

    assert!(finished.wait_for(1, Duration::from_secs(2)));
    assert!(matches!(
        dispatcher.send(CloseAccount::new("a")),
        Err(CommandError::NotHandled { .. })
    ));
}

#[test]
fn dispatcher_is_a_command_sender() {
    fn open_account(sender: &impl CommandSender) -> Result<(), CommandError> {
        sender.fire_command(Deposit::new("new", 1)).map(|_| ())
    }

    let dispatcher = dispatcher("sender");
    assert!(open_account(&dispatcher).is_err());

    dispatcher
        .subscribe::<Deposit, _>(|_: &Arc<Deposit>| -> Result<(), HandlerError> { Ok(()) })
        .unwrap();
    assert!(open_account(&dispatcher).is_ok());
    assert!(dispatcher.send_command(Deposit::new("new", 2)).is_ok());
}
