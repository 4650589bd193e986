use std::process::ExitCode;

use quorumvote::config::{Args, NodeConfig};
use quorumvote::{cli, node::Node, startup};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = <Args as clap::Parser>::parse();
    let config = match NodeConfig::from_args(args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if !config.gui_only {
        if let Err(e) = startup::run(&config.node_id, &config.seeds).await {
            eprintln!("fatal: {e}");
            tracing::error!(error = %e, "duplicate identity detected at startup, exiting");
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            return ExitCode::FAILURE;
        }
    }

    let (node, handle) = Node::new(config);

    let node_task = tokio::spawn(node.run());
    let cli_handle = handle;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    println!("{}", cli::HELP_TEXT);
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let Some((command, args)) = cli::split_line(&line) else {
                            continue;
                        };
                        match cli::parse(&command, &args) {
                            Ok(parsed) => {
                                let is_quit = parsed == cli::Command::Quit;
                                match cli_handle.command(parsed).await {
                                    Ok(response) => println!("{response}"),
                                    Err(e) => println!("error: {e}"),
                                }
                                if is_quit {
                                    break;
                                }
                            }
                            Err(e) => println!("error: {e}"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                cli_handle.shutdown();
                break;
            }
        }
    }

    cli_handle.shutdown();
    let _ = node_task.await;
    ExitCode::SUCCESS
}
