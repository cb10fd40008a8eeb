//! Twitch Drops Agent
//!
//! A headless, long-running agent that mines timed drop rewards for one
//! authenticated account: it discovers campaigns, picks the best live
//! channel, emits watch heartbeats, and claims finished drops.

pub mod auth;
pub mod backoff;
pub mod constants;
pub mod cookies;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod http;
pub mod miner;
pub mod models;
pub mod settings;
pub mod websocket;

use auth::{generate_device_id, AuthState, Authenticator};
use cookies::CookieJar;
use error::{AgentError, Result};
use events::{control_channel, ControlAction, ControlRequest, Event, EventBus};
use http::HttpClient;
use miner::Miner;
use settings::{Environment, Settings};

/// Mirror bus traffic a human cares about onto stdout. The real control
/// surface subscribes to the same bus over its own transport.
fn spawn_console_printer(bus: &EventBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Event::StatusUpdate { status }) => println!("* {status}"),
                Ok(Event::ConsoleOutput { line }) => println!("  {line}"),
                Ok(Event::OauthCodeRequired { url, code }) => {
                    println!("! Login required: open {url} and enter code {code}");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn run() -> Result<()> {
    let env = Environment::detect();
    env.prepare()?;

    // Log to a rolling file under DATA_DIR; stdout stays clean for status.
    let log_file = std::fs::File::create(env.log_dir().join("agent.log"))
        .map_err(|e| AgentError::Config(format!("cannot open log file: {e}")))?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .init();
    tracing::info!(
        "data directory: {}, control surface port: {}",
        env.data_dir.display(),
        env.control_port
    );

    let settings = Settings::load(&env.data_dir)?;
    let jar = CookieJar::load(env.cookie_jar_path());
    let auth = AuthState::new(generate_device_id());
    let proxy = (!settings.proxy.is_empty()).then(|| settings.proxy.clone());
    let http = HttpClient::new(jar.clone(), auth.clone(), proxy)?;

    let bus = EventBus::new();
    spawn_console_printer(&bus);

    let authenticator = Authenticator::new(http.clone(), auth.clone(), jar.clone(), bus.clone());
    if !authenticator.restore_session().await? {
        authenticator.device_code_login().await?;
    }
    {
        let auth = auth.read().expect("auth lock poisoned");
        bus.console(format!(
            "Logged in as {}",
            auth.login.as_deref().unwrap_or("<unknown>")
        ));
    }

    let (control_tx, control_rx) = control_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let (request, _rx) = ControlRequest::new(ControlAction::Shutdown);
            let _ = control_tx.send(request).await;
        }
    });

    Miner::new(env, settings, bus, http, auth, jar)
        .run(control_rx)
        .await
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}
