use chat_ws_adapter::cli::Args;
use chat_ws_adapter::console::ChatConsole;
use chat_ws_adapter::WebSocketAdapter;
use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.resolve_config()?;

    println!(
        "{} {} in {}",
        "chat-ws-adapter".bold(),
        config.username.cyan(),
        format!("#{}", config.room).bright_blue()
    );
    println!("{}", "type to chat, /quit to leave".dimmed());

    let adapter = WebSocketAdapter::new(config);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let console = ChatConsole::new(adapter.clone(), out_tx);
    console.attach();
    adapter.on(
        "reconnect_failed",
        chat_ws_adapter::handler(|_| eprintln!("{}", "gave up reconnecting; /quit to exit".red())),
    );

    adapter.connect()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !console.handle_line(&line).await {
                            break;
                        }
                    }
                    // stdin closed
                    Ok(None) => {
                        adapter.disconnect();
                        break;
                    }
                    Err(e) => {
                        adapter.disconnect();
                        return Err(e.into());
                    }
                }
            }
            Some(out) = out_rx.recv() => println!("{out}"),
        }
    }

    // Flush anything rendered while shutting down.
    while let Ok(out) = out_rx.try_recv() {
        println!("{out}");
    }
    Ok(())
}
