use ayumi::prelude::*;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Default)]
struct Order {
    attempts: u32,
    fail_until: u32,
    paid: bool,
    shipped: bool,
    refunded: bool,
    log: Vec<&'static str>,
}

/// pending -> shipping -> finish, with a flaky payment and a refund state.
fn order_definition() -> Arc<Definition<Order>> {
    let mut builder = Definition::<Order>::builder("order");
    let pending = builder.state("pending");
    let shipping = builder.state("shipping");
    let refund = builder.state("refund");
    builder
        .step(pending, "pay", |s| {
            s.act(|o| {
                o.attempts += 1;
                if o.attempts <= o.fail_until {
                    return Err(StepError::failed("gateway timeout"));
                }
                o.paid = true;
                o.log.push("paid");
                Ok(())
            })
            .on_error_retry(|o, _| o.attempts < 3)
        })
        .step(pending, "route", |s| {
            s.when(|o| o.paid).goto(shipping).otherwise().goto(refund)
        })
        .step(shipping, "ship", |s| {
            s.act(|o| {
                o.shipped = true;
                o.log.push("shipped");
                Ok(())
            })
        })
        .step(shipping, "done", |s| s.finish())
        .step(refund, "refund", |s| {
            s.act(|o| {
                o.refunded = true;
                o.log.push("refunded");
                Ok(())
            })
        })
        .step(refund, "done", |s| s.finish());
    builder.build().expect("valid definition")
}

fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[test]
fn test_complete_workflow() {
    let machine = Machine::new("order-1", order_definition(), Order::default());
    let mut rx = machine.subscribe();

    let handle = machine.run(&BlockingRunner::new()).expect("run");

    assert_eq!(handle.phase(), Some(Phase::Finished));
    assert_eq!(
        machine.lock_and_execute(|o| o.log.clone()),
        vec!["paid", "shipped"]
    );

    let events = drain(&mut rx);
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::WorkflowStarted,
            EventKind::StateTransition,
            EventKind::WorkflowFinished,
        ]
    );
    assert_eq!(events[1].payload.as_deref(), Some("shipping"));
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(events.iter().all(|e| &*e.machine == "order-1"));
}

#[test]
fn test_flaky_step_is_retried() {
    let order = Order {
        fail_until: 2,
        ..Order::default()
    };
    let machine = Machine::new("order-2", order_definition(), order);
    let mut rx = machine.subscribe();

    let handle = machine.run(&BlockingRunner::new()).expect("run");

    assert_eq!(handle.phase(), Some(Phase::Finished));
    assert_eq!(machine.lock_and_execute(|o| o.attempts), 3);
    assert!(machine.lock_and_execute(|o| o.shipped));
    let retries = drain(&mut rx)
        .into_iter()
        .filter(|e| e.kind == EventKind::ExceptionCaughtWithRetry)
        .count();
    assert_eq!(retries, 2);
}

#[test]
fn test_retries_exhausted_falls_through_to_refund() {
    let order = Order {
        fail_until: 10,
        ..Order::default()
    };
    let machine = Machine::new("order-3", order_definition(), order);

    let handle = machine.run(&BlockingRunner::new()).expect("run");

    assert_eq!(handle.phase(), Some(Phase::Finished));
    assert_eq!(
        machine.lock_and_execute(|o| (o.attempts, o.refunded, o.shipped)),
        (3, true, false)
    );
}

#[test]
fn test_fault_routing() {
    #[derive(Default)]
    struct Job {
        recovered: bool,
        continued: bool,
        errors: Vec<String>,
    }

    let mut builder = Definition::<Job>::builder("faults");
    let main = builder.state("main");
    let failed = builder.state("failed");
    builder
        .step(main, "recoverable", |s| {
            s.act(|_| Err(StepError::failed("first")))
                .on_error_recover(|j, e| {
                    j.recovered = true;
                    j.errors.push(e.to_string());
                    Ok(())
                })
        })
        .step(main, "uncaught", |s| s.act(|_| Err(StepError::failed("second"))))
        .step(main, "after handler", |s| {
            s.act(|j| {
                j.continued = true;
                Ok(())
            })
        })
        .step(main, "jump", |s| {
            s.act(|_| Err(StepError::failed("third")))
                .on_error_goto(failed)
        })
        .step(failed, "stop", |s| s.finish());
    builder.on_unhandled(|j, fault| {
        j.errors.push(format!("{} at {}", fault.error, fault.position));
        Disposition::Continue
    });
    let machine = Machine::new("faults-1", builder.build().expect("valid definition"), Job::default());
    let mut rx = machine.subscribe();

    let handle = machine.run(&BlockingRunner::new()).expect("run");

    assert_eq!(handle.phase(), Some(Phase::Finished));
    assert_eq!(machine.position().state, failed);
    let (recovered, continued, errors) =
        machine.lock_and_execute(|j| (j.recovered, j.continued, j.errors.clone()));
    assert!(recovered && continued);
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0], "step failed: first");
    assert!(errors[1].starts_with("step failed: second"));

    let exceptions: Vec<_> = drain(&mut rx)
        .into_iter()
        .map(|e| e.kind)
        .filter(|k| k.is_exception())
        .collect();
    assert_eq!(
        exceptions,
        vec![
            EventKind::ExceptionCaughtWithAction,
            EventKind::ExceptionNotCaught,
            EventKind::ExceptionCaughtWithTransition,
        ]
    );
}

#[test]
fn test_manual_steps_then_runner_resumes() {
    let machine = Machine::new("order-4", order_definition(), Order::default());

    assert_eq!(machine.execute_next_steps(2).expect("steps"), 2);
    assert_eq!(machine.phase(), Phase::Running);
    assert_eq!(machine.position().step, 0);
    assert!(machine.lock_and_execute(|o| o.paid && !o.shipped));

    let handle = machine.run(&BlockingRunner::new()).expect("run");
    assert_eq!(handle.phase(), Some(Phase::Finished));
    assert!(machine.lock_and_execute(|o| o.shipped));
    assert!(!machine.execute_next_step().expect("finished is not an error"));
}

#[test]
fn test_invalid_definitions_are_rejected() {
    let empty = Definition::<()>::builder("empty").build();
    assert!(matches!(empty, Err(WorkflowError::Configuration(_))));

    let mut builder = Definition::<()>::builder("double");
    let main = builder.state("main");
    builder.step(main, "two effects", |s| s.act(|_| Ok(())).finish());
    assert!(matches!(
        builder.build(),
        Err(WorkflowError::Configuration(_))
    ));

    let mut builder = Definition::<()>::builder("stub");
    let main = builder.state("main");
    builder.state("later");
    builder.step(main, "done", |s| s.finish());
    assert!(matches!(
        builder.build(),
        Err(WorkflowError::Configuration(msg)) if msg.contains("'later'")
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_spawning_runner_finishes() {
    let pooled = Machine::new("pooled", order_definition(), Order::default());
    let nonblocking = Machine::new("nonblocking", order_definition(), Order::default());
    let throttled = Machine::new("throttled", order_definition(), Order::default());

    let handles = vec![
        pooled.run(&PooledRunner::new()).expect("pooled"),
        nonblocking.run(&NonBlockingRunner::new()).expect("nonblocking"),
        throttled.run(&ThrottledRunner::default()).expect("throttled"),
    ];
    for handle in handles {
        assert_eq!(handle.join().await.ok(), Some(Phase::Finished));
    }
    for machine in [&pooled, &nonblocking, &throttled] {
        assert!(machine.lock_and_execute_async(|o| o.shipped).await);
    }
}

#[derive(Default)]
struct Gate {
    open: Signal,
    passed: bool,
}

fn gate(name: &str) -> Machine<Gate> {
    let mut builder = Definition::<Gate>::builder("gate");
    let main = builder.state("main");
    builder
        .step(main, "wait", |s| s.wait_for(|g| g.open.clone()))
        .step(main, "check", |s| {
            s.when_async(|g| async move { Ok(g.open.is_set()) }.boxed())
                .act_async(|g| {
                    async move {
                        tokio::task::yield_now().await;
                        g.passed = true;
                        Ok(())
                    }
                    .boxed()
                })
        })
        .step(main, "done", |s| s.finish());
    Machine::new(name, builder.build().expect("valid definition"), Gate::default())
}

#[tokio::test]
async fn test_shared_registry_fans_in_events() {
    let registry = Arc::new(Registry::new());
    let mut events = registry.events();
    let runner = NonBlockingRunner::with_registry(Arc::clone(&registry));
    let first = gate("first");
    let second = gate("second");

    let h1 = first.run(&runner).expect("first");
    let h2 = second.run(&runner).expect("second");

    let mut waiting = Vec::new();
    while waiting.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("bus open");
        if event.kind == EventKind::BeginWaiting {
            waiting.push(event.machine.to_string());
        }
    }
    waiting.sort();
    assert_eq!(waiting, vec!["first", "second"]);
    assert_eq!(registry.running(), vec!["first", "second"]);

    first.lock_and_execute_async(|g| g.open.set()).await;
    second.lock_and_execute_async(|g| g.open.set()).await;
    assert_eq!(h1.join().await.ok(), Some(Phase::Finished));
    assert_eq!(h2.join().await.ok(), Some(Phase::Finished));
    assert!(first.lock_and_execute_async(|g| g.passed).await);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_pause_cancels_wait_and_resumes_elsewhere() {
    let machine = gate("gate-1");
    let mut rx = machine.subscribe();
    let handle = machine.run(&NonBlockingRunner::new()).expect("run");

    while rx.recv().await.map(|e| e.kind).ok() != Some(EventKind::BeginWaiting) {}
    assert_eq!(machine.phase(), Phase::Waiting);

    machine.request_pause(true);
    assert_eq!(handle.join().await.ok(), Some(Phase::Paused));
    assert_eq!(machine.position().step, 0);

    let tail: Vec<_> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
    assert_eq!(tail, vec![EventKind::EndWaiting, EventKind::WorkflowPaused]);

    machine.request_info();
    let info = rx.recv().await.expect("info event");
    assert_eq!(info.kind, EventKind::InfoRequested);
    assert_eq!(info.payload.as_deref(), Some("state 'main' step 0 (wait)"));

    machine.lock_and_execute_async(|g| g.open.set()).await;
    let resumed = machine.run(&ThrottledRunner::default()).expect("resume");
    assert_eq!(resumed.join().await.ok(), Some(Phase::Finished));
    assert!(machine.lock_and_execute_async(|g| g.passed).await);
}

#[tokio::test]
async fn test_second_driver_is_rejected() {
    let machine = gate("gate-2");
    let runner = NonBlockingRunner::new();
    let handle = machine.run(&runner).expect("run");

    assert!(matches!(
        machine.run(&ThrottledRunner::default()),
        Err(WorkflowError::AlreadyRunning(_))
    ));

    machine.request_pause(true);
    assert_eq!(handle.join().await.ok(), Some(Phase::Paused));
}
