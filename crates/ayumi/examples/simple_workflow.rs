//! Two-state workflow driven on the calling thread.

use ayumi::prelude::*;

#[derive(Debug, Default)]
struct Download {
    chunks: u32,
    bytes: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut builder = Definition::<Download>::builder("download");
    let fetching = builder.state("fetching");
    let verifying = builder.state("verifying");
    builder
        .step(fetching, "fetch chunk", |s| {
            s.repeat_while(|d| d.chunks < 4).act(|d| {
                d.chunks += 1;
                d.bytes += 4096;
                println!("Fetched chunk {}", d.chunks);
                Ok(())
            })
        })
        .step(fetching, "verify", |s| s.goto(verifying))
        .step(verifying, "checksum", |s| {
            s.act(|d| {
                if d.bytes != u64::from(d.chunks) * 4096 {
                    return Err(StepError::failed("size mismatch"));
                }
                Ok(())
            })
        })
        .step(verifying, "done", |s| s.finish());
    let definition = builder.build()?;

    let machine = Machine::new("download-1", definition, Download::default());
    let handle = machine.run(&BlockingRunner::new())?;

    println!("Machine stopped: {:?}", handle.phase());
    machine.lock_and_execute(|d| println!("Downloaded {} bytes", d.bytes));
    Ok(())
}
