use std::sync::Arc;

use color_eyre::eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mqttdeck::config::BrokerConfig;
use mqttdeck::logsink::{FileLogSink, LogSink};
use mqttdeck::notify::TracingNotifier;
use mqttdeck::persistence::{self, Settings};
use mqttdeck::session::{SessionEvents, SessionManager};
use mqttdeck::transport::WsConnector;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let settings = match Settings::load().await {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Falling back to default settings: {}", e);
            Settings::default()
        }
    };

    let logs: Arc<dyn LogSink> = Arc::new(FileLogSink::open(persistence::log_file_path()?).await);
    let (manager, events) =
        SessionManager::new(Arc::new(WsConnector), logs.clone(), Arc::new(TracingNotifier));
    manager.set_notifications_enabled(settings.notifications_enabled);

    tokio::spawn(observe(events));

    run_console(manager, logs, settings).await
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();
}

/// Prints state changes and inbound messages as they arrive.
async fn observe(mut events: SessionEvents) {
    loop {
        tokio::select! {
            changed = events.state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = events.state.borrow_and_update().clone();
                info!("Connection state: {}", state);
            }
            message = events.messages.recv() => match message {
                Some(message) => info!("[{}] {}", message.topic, message.payload_text()),
                None => break,
            }
        }
    }
}

async fn run_console(
    manager: SessionManager,
    logs: Arc<dyn LogSink>,
    mut settings: Settings,
) -> Result<()> {
    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else { continue };
        let args: Vec<&str> = parts.collect();

        match command {
            "connect" => match parse_connect(&args, &settings.broker) {
                Ok(config) => match manager.connect(config.clone()).await {
                    Ok(()) => {
                        settings.broker = config;
                        if let Err(e) = settings.save().await {
                            warn!("Could not save settings: {}", e);
                        }
                    }
                    Err(e) => println!("connect failed: {e}"),
                },
                Err(usage) => println!("{usage}"),
            },
            "disconnect" => manager.disconnect(),
            "pub" if args.len() >= 2 => {
                let payload = args[1..].join(" ");
                report(manager.publish(args[0], payload.as_bytes()));
            }
            "sub" if args.len() == 1 => report(manager.subscribe(args[0])),
            "unsub" if args.len() == 1 => report(manager.unsubscribe(args[0])),
            "topics" => {
                for sub in manager.subscriptions() {
                    let marker = if sub.active { " " } else { "!" };
                    println!("{} {}", marker, sub.topic);
                }
            }
            "logs" => {
                for record in logs.list() {
                    println!("{} [{}] {}", record.timestamp, record.severity, record.text);
                }
            }
            "clearlogs" => logs.clear(),
            "notify" => match args.first() {
                Some(&"on") | Some(&"off") => {
                    let enabled = args[0] == "on";
                    manager.set_notifications_enabled(enabled);
                    settings.notifications_enabled = enabled;
                    if let Err(e) = settings.save().await {
                        warn!("Could not save settings: {}", e);
                    }
                }
                _ => println!("usage: notify on|off"),
            },
            "state" => println!("{}", manager.state()),
            "help" => print_help(),
            "quit" | "exit" => {
                manager.disconnect();
                break;
            }
            _ => println!("unknown command, try 'help'"),
        }
    }
    Ok(())
}

/// Builds a [`BrokerConfig`] from console arguments, or reuses the saved
/// profile when called without arguments.
fn parse_connect(args: &[&str], saved: &BrokerConfig) -> Result<BrokerConfig, String> {
    if args.is_empty() {
        return if saved.validate().is_ok() {
            Ok(saved.clone())
        } else {
            Err("no saved broker profile; usage: connect <host> <port> [user] [pass] [--tls]"
                .to_string())
        };
    }

    let use_tls = args.contains(&"--tls");
    let positional: Vec<&str> = args.iter().copied().filter(|a| *a != "--tls").collect();
    let (Some(host), Some(port)) = (positional.first(), positional.get(1)) else {
        return Err("usage: connect <host> <port> [user] [pass] [--tls]".to_string());
    };
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port: {}", port))?;

    Ok(BrokerConfig {
        host: host.to_string(),
        port,
        username: positional.get(2).map(|s| s.to_string()),
        password: positional.get(3).map(|s| s.to_string()),
        use_tls,
    })
}

fn report<E: std::fmt::Display>(result: Result<(), E>) {
    if let Err(e) = result {
        println!("error: {e}");
    }
}

fn print_help() {
    println!("commands:");
    println!("  connect [host port [user pass]] [--tls]   open a broker connection");
    println!("  disconnect                                close the connection");
    println!("  pub <topic> <message>                     publish a message");
    println!("  sub <topic> / unsub <topic>               manage subscriptions");
    println!("  topics                                    list subscriptions (! = inactive)");
    println!("  logs / clearlogs                          show or clear the session log");
    println!("  notify on|off                             toggle message notifications");
    println!("  state                                     show the connection state");
    println!("  quit                                      disconnect and exit");
}
