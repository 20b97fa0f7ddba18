//! primus binary.
//!
//! As PID 1 this is the init process; otherwise it acts as a
//! telinit-style client that forwards runlevel and reload requests to
//! the running init over the control socket.

use clap::Parser;
use primus::{Command, ControlClient, Init, Reply, SystemState};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "primus",
    about = "Process-1 init and service supervisor",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    /// Ignored, SysV init compat
    #[arg(short = 'a', hide = true)]
    compat_a: bool,
    /// Ignored, SysV init compat
    #[arg(short = 'b', hide = true)]
    compat_b: bool,
    /// Ignored, SysV init compat
    #[arg(short = 'e', hide = true, value_name = "ARG")]
    compat_e: Option<String>,
    /// Ignored, SysV init compat
    #[arg(short = 's', hide = true)]
    compat_s: bool,
    /// Ignored, SysV init compat
    #[arg(short = 't', hide = true, value_name = "SEC")]
    compat_t: Option<u32>,
    /// Ignored, SysV init compat
    #[arg(short = 'z', hide = true, value_name = "XXX")]
    compat_z: Option<String>,

    /// This help text
    #[arg(short = 'h', long = "help")]
    help: bool,

    /// Show version
    #[arg(short = 'v')]
    version: bool,
    #[arg(short = 'V', hide = true)]
    version_upper: bool,

    /// 0-9, q/Q or s/S
    #[arg(value_name = "COMMAND")]
    command: Option<String>,
}

fn usage() {
    println!(
        "Usage: primus [OPTIONS] [q | Q | 0-9]\n\
         \n\
         Options:\n\
         \x20 -h       This help text\n\
         \x20 -v       Show version\n\
         \n\
         Commands:\n\
         \x20 0        Power off the system\n\
         \x20 6        Reboot the system\n\
         \x20 2-9      Change runlevel\n\
         \x20 q, Q     Reload configuration, same as SIGHUP to PID 1\n\
         \x20 1, s, S  Enter rescue mode, runlevel 1\n"
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if std::process::id() == 1 {
        let mut init = Init::new(SystemState::default());
        init.run().await?;
        return Ok(());
    }

    telinit().await
}

/// Old-style init/telinit compat: forward the request to PID 1.
async fn telinit() -> anyhow::Result<()> {
    // getopt compat: accept -? as an alias for -h
    let args = std::env::args().map(|a| if a == "-?" { "-h".to_string() } else { a });
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(_) => {
            usage();
            std::process::exit(1);
        }
    };

    if cli.help {
        usage();
        return Ok(());
    }
    if cli.version || cli.version_upper {
        println!("primus {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let Some(request) = cli.command else {
        usage();
        std::process::exit(1);
    };

    let command = match request.chars().next() {
        Some(c @ '0'..='9') => Command::Runlevel {
            level: c as u8 - b'0',
        },
        Some('q') | Some('Q') => Command::Reload,
        Some('s') | Some('S') => Command::Runlevel { level: 1 },
        _ => {
            usage();
            std::process::exit(1);
        }
    };

    let client = ControlClient::with_default_path();
    match client.send(command).await {
        Ok(Reply::Ok { message }) => {
            println!("{}", message);
            Ok(())
        }
        Ok(Reply::Err { message }) => {
            eprintln!("{}", message);
            std::process::exit(1);
        }
        Ok(Reply::Status { services }) => {
            for svc in services {
                println!(
                    "{:<24} {:<8} {:<8} {}",
                    svc.ident,
                    svc.kind,
                    svc.state,
                    svc.pid.map(|p| p.to_string()).unwrap_or_default()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
