//! The sample service: a `Calculator` owned by the server and a
//! `TickPrinter` the client hands over to receive ticker events.

use std::sync::Arc;
use std::time::Duration;

use remoting::Args;
use remoting::Fault;
use remoting::RemoteType;
use remoting::SurrogateRegistry;
use remoting::Value;
use remoting::WeakEvent;
use tracing::info;
use tracing::warn;

pub struct Calculator {
    ticks: WeakEvent<(i64,)>,
}

impl Calculator {
    pub fn new() -> Self {
        Self { ticks: WeakEvent::new("calculator-ticks") }
    }
}

/// Fires `count` queued tick events, `interval` milliseconds apart.
async fn start_ticker(calc: Arc<Calculator>, args: Args) -> Result<Value, Fault> {
    let count: i64 = args.get(0)?;
    let interval: u64 = args.get(1)?;
    let ticks = calc.ticks.clone();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(Duration::from_millis(interval.max(1)));
        for n in 1..=count {
            timer.tick().await;
            if let Err(e) = ticks.fire_queued((n,)) {
                warn!("earlier ticks failed: {}", e);
            }
        }
        ticks.flush(Duration::from_secs(5)).await;
    });
    Ok(Value::null())
}

fn calculator_type() -> RemoteType<Calculator> {
    RemoteType::<Calculator>::new("Calculator")
        .interface("ICalculator")
        .method_sync("AddValues", |_, args| {
            let a: i64 = args.get(0)?;
            let b: i64 = args.get(1)?;
            Ok(Value::new(a + b))
        })
        .method_sync("Subscribe", |calc, args| {
            calc.ticks.subscribe_remote(args.proxy(0)?, "OnTick");
            Ok(Value::null())
        })
        .method("StartTicker", start_ticker)
        .constructor(|_| Ok(Calculator::new()))
}

pub struct TickPrinter;

fn tick_printer_type() -> RemoteType<TickPrinter> {
    RemoteType::<TickPrinter>::new("TickPrinter").method_sync("OnTick", |_, args| {
        let n: i64 = args.get(0)?;
        info!("tick {}", n);
        Ok(Value::null())
    })
}

/// Types both sides agree on.
pub fn surrogates() -> SurrogateRegistry {
    let mut registry = SurrogateRegistry::new();
    registry.register_remote(calculator_type()).register_remote(tick_printer_type());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    use remoting::Config;
    use remoting::Connection;
    use remoting::transport::memory::duplex;

    #[tokio::test]
    async fn test_sample_types_serve_each_other() {
        let (a, b) = duplex();
        let surrogates = Arc::new(surrogates());
        let _server = Connection::new(Box::new(a), surrogates.clone(), Config::default().with_side_name("server"));
        let client = Connection::new(Box::new(b), surrogates, Config::default().with_side_name("client"));

        let calc = client.create_instance("Calculator", ()).await.expect("create calculator");
        assert!(calc.implements("ICalculator"));
        let sum: i64 = calc.call_as("AddValues", (40i64, 2i64)).await.expect("AddValues");
        assert_eq!(sum, 42);

        let printer = Value::shared(Arc::new(TickPrinter));
        calc.call("Subscribe", (printer,)).await.expect("Subscribe");
        calc.call("StartTicker", (2i64, 1u64)).await.expect("StartTicker");
    }
}
