//! Pausing a waiting machine, inspecting it, and resuming it with another
//! runner.

use ayumi::prelude::*;
use std::time::Duration;

#[derive(Debug, Default)]
struct Approval {
    approved: Signal,
    reviews: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut builder = Definition::<Approval>::builder("approval");
    let review = builder.state("review");
    let publish = builder.state("publish");
    builder
        .step(review, "await approval", |s| {
            s.wait_for_within(|a| a.approved.clone(), |_| Duration::from_secs(30))
        })
        .step(review, "count", |s| {
            s.act(|a| {
                a.reviews += 1;
                Ok(())
            })
        })
        .step(review, "approved?", |s| {
            s.when(|a| a.approved.is_set())
                .goto(publish)
                .otherwise()
                .goto(review)
        })
        .step(publish, "done", |s| s.finish());
    let definition = builder.build()?;

    let machine = Machine::new("approval-1", definition, Approval::default());
    let mut events = machine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("event: {event}");
        }
    });

    let handle = machine.run(&NonBlockingRunner::new())?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    machine.request_pause(true);
    println!("Paused in phase {}", handle.join().await?);
    machine.request_info();

    machine.lock_and_execute_async(|a| a.approved.set()).await;
    let resumed = machine.run(&ThrottledRunner::default())?;
    println!("Resumed machine stopped: {}", resumed.join().await?);
    Ok(())
}
