//! One scripted iteration against a real broker:
//! connect, subscribe, publish, and end once the message comes back.
//!
//! ```text
//! cargo run --example hello -- mqtt://localhost:1883
//! ```

use std::{process, sync::Arc};

use loadmq::{
    config::Config,
    logger::LoggerManager,
    print_error,
    runtime::{Function, Value},
    EventLoop, Module, TracingSink,
};
use serde_json::json;
use tracing::info;

fn main() {
    let config = Config::new().unwrap_or_else(|e| {
        print_error!("{}", e);
        process::exit(1);
    });

    if let Err(e) = LoggerManager::new(config.logger.clone()).and_then(|logger| logger.init()) {
        print_error!("Failed to initialize logger: {}", e);
        process::exit(1);
    }

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "mqtt://localhost:1883".to_string());

    let event_loop = EventLoop::new();
    event_loop.set_tag("scenario", "hello");
    let module = Module::new(Arc::new(event_loop.clone()), Arc::new(TracingSink), config);

    let client = match module.client(Value::from(json!({"clientId": "loadmq-hello"}))) {
        Ok(client) => client,
        Err(e) => {
            print_error!("{}", e);
            process::exit(1);
        }
    };

    let ender = client.clone();
    client.on(
        "message",
        Function::from_fn(move |args: &[Value]| {
            let topic = args[0].as_str().unwrap_or_default();
            let size = match &args[1] {
                Value::Bytes(bytes) => bytes.len(),
                _ => 0,
            };
            info!(topic, size, "Message received, ending iteration");
            ender.end(Value::Undefined)?;
            Ok(())
        }),
    );
    client.on(
        "error",
        Function::from_fn(|args: &[Value]| {
            info!(error = ?args[0].get("message"), "MQTT error reported");
            Ok(())
        }),
    );
    client.on(
        "end",
        Function::from_fn(|_| {
            info!("Client ended");
            Ok(())
        }),
    );

    let script = client.clone();
    let result = event_loop.start(move || {
        script.connect(url.as_str(), Value::Undefined)?;
        if !script.is_connected() {
            // the error handler already reported why
            return Ok(());
        }
        script.subscribe("loadmq/hello", Value::from(json!({"qos": 1})))?;
        script.publish(
            "loadmq/hello",
            "hello from loadmq",
            Value::from(json!({"qos": 1, "tags": {"step": "greet"}})),
        )?;
        Ok(())
    });

    if let Err(e) = result {
        print_error!("Iteration failed: {}", e);
        process::exit(1);
    }
}
