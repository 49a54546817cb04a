use anyhow::Context;
use live_voice_rs::{AlsaBackend, Config, session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 配置文件路径可由第一个参数指定
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let instruction = config.session.system_instruction.clone();
    let backend = AlsaBackend::new(config.audio.clone());
    let mut session = session::open(&config, backend, &instruction, None);
    log::info!("Session {} -> {}", session.id(), session.endpoint());
    println!("Commands: m = toggle mute, q = quit (Ctrl+C also quits)");

    let mut status_rx = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }

            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = session.status();
                println!(
                    "[{}] connected={} speaking={} muted={} volume={:.3}",
                    status.connection_label,
                    status.is_connected,
                    status.is_speaking,
                    status.is_muted,
                    status.volume,
                );
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(cmd)) => match cmd.trim() {
                        "m" => session.set_muted(!session.is_muted()),
                        "q" => break,
                        "" => {}
                        other => println!("Unknown command: {}", other),
                    },
                    // stdin closed: keep running until Ctrl+C
                    Ok(None) => {
                        signal::ctrl_c().await?;
                        break;
                    }
                    Err(e) => {
                        log::warn!("Failed to read stdin: {}", e);
                        signal::ctrl_c().await?;
                        break;
                    }
                }
            }
        }
    }

    session.close().await;
    println!("Final status: {}", session.status().connection_label);
    Ok(())
}
