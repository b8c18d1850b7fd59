use chat_relay::db::SqliteStore;
use chat_relay::ingress::{InboundChatRequest, InboundMessage};
use chat_relay::main_helper::gateway_key_from_env;
use chat_relay::reconciler::{drive, ClientSignal, DisplayMessage, Reconciler};
use chat_relay::relay::CompletionRelay;
use chat_relay::transport::HttpTransport;
use chat_relay::*;

use clap::Parser;
use colored::*;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let args = Arc::new(Args::parse());

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "chat_relay=debug".into(),
    };

    let _ = std::fs::create_dir_all(&args.log_dir);
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "chat_relay.log");
    let (non_blocking, log_guard) = tracing_appender::non_blocking(file_appender);

    // One-shot mode owns the terminal, so only the file gets logs there.
    let interactive = args.prompt.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(if interactive {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        })
        .with(tracing_error::ErrorLayer::default())
        .init();

    chat_relay::logging::setup_panic_hook();

    let store = match SqliteStore::open(&args.database).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let api_key = gateway_key_from_env();
    if api_key.is_none() {
        tracing::warn!(
            "GATEWAY_API_KEY is not set; only requests carrying their own key can be relayed."
        );
    }

    let client = match HttpTransport::build_client(
        Duration::from_secs(args.request_timeout_secs),
        Duration::from_secs(args.connect_timeout_secs),
    ) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let config = args.relay_config(api_key);
    let transport = Arc::new(HttpTransport::new(client, config.upstream_url.clone()));
    let relay = Arc::new(CompletionRelay::new(config, transport, store.clone()));

    if let Some(prompt) = args.prompt.clone() {
        let code = run_prompt(&args, relay, &prompt).await;
        drop(log_guard);
        std::process::exit(code);
    }

    let state = Arc::new(AppState {
        relay,
        store,
        args: args.clone(),
    });
    let app = chat_relay::server::build_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("chat-relay listening on {}", addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}

/// Streams one reply to the terminal through the reconciler. Returns the exit code.
async fn run_prompt(args: &Args, relay: Arc<CompletionRelay>, prompt: &str) -> i32 {
    let inbound = InboundChatRequest {
        messages: vec![InboundMessage::new("user", prompt)],
        conversation_id: args.conversation_id.clone(),
        stream: Some(true),
        ..Default::default()
    };
    let request = match inbound.validate() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return 2;
        }
    };

    let auth = AuthContext::new(args.user_id.clone());
    let mut handle = relay.submit(request, auth);
    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let history = vec![DisplayMessage::new("prompt", Role::User, prompt)];
    let (mut reconciler, mut signals) = Reconciler::new(history);
    let mut printed = 0usize;

    println!("{} {}", "you:".cyan().bold(), prompt);
    print!("{} ", "assistant:".green().bold());
    let _ = std::io::stdout().flush();

    drive(
        &mut reconciler,
        &mut handle.events,
        Duration::from_millis(args.frame_interval_ms),
        |messages| {
            let content = match messages.last() {
                Some(m) if m.role == Role::Assistant && !m.is_error => m.content.as_str(),
                _ => return,
            };
            if let Some(tail) = content.get(printed..) {
                print!("{}", tail);
                let _ = std::io::stdout().flush();
                printed = content.len();
            }
        },
    )
    .await;
    println!();

    if let Some(last) = reconciler.messages().last() {
        if last.is_error {
            println!("{}", last.content.yellow());
            return 1;
        }
    }

    match signals.try_recv() {
        Ok(ClientSignal::Paywall { message }) => {
            eprintln!("{} {}", "quota:".yellow().bold(), message);
            3
        }
        Ok(ClientSignal::Error {
            message,
            code,
            request_id,
            partial_content,
        }) => {
            if partial_content.is_some() {
                eprintln!("{}", "(reply above is incomplete)".dimmed());
            }
            eprintln!("{} {} ({}, {})", "error:".red().bold(), message, code, request_id);
            1
        }
        Err(_) if reconciler.messages().len() == 1 => {
            eprintln!("{}", "cancelled".dimmed());
            130
        }
        Err(_) => 0,
    }
}
