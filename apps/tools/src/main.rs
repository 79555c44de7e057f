use std::{sync::Arc, thread, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, should_mark_complete, ClientCore, CompletionInputs, MembershipChange,
    MemoryJobQueue, RegistrationRequest,
};
use shared::domain::{Aci, GroupId, E164};
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `server_url` from client.toml / APP__SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a number against the server and register this device.
    Register {
        #[arg(long)]
        number: String,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        recovery_password: Option<String>,
        #[arg(long)]
        registration_lock: Option<String>,
        #[arg(long)]
        push_token: Option<String>,
    },
    /// Hold the group lock on one thread and contend for it from another.
    LockProbe {
        #[arg(long, default_value_t = 6000)]
        hold_ms: u64,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Evaluate the registration-complete decision for the given inputs.
    Completion {
        #[arg(long)]
        registered: bool,
        #[arg(long)]
        profile_name_set: bool,
        #[arg(long)]
        has_pin: bool,
        #[arg(long)]
        opted_out: bool,
        #[arg(long)]
        already_complete: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }

    match cli.command {
        Command::Register {
            number,
            session_id,
            recovery_password,
            registration_lock,
            push_token,
        } => {
            let e164 = E164::parse(&number)?;
            let core = ClientCore::connect(settings, Arc::new(MemoryJobQueue::new()))?;
            let outcome = core
                .registration()
                .register(RegistrationRequest {
                    session_id,
                    recovery_password,
                    registration_lock,
                    push_token,
                    ..RegistrationRequest::new(e164)
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::LockProbe {
            hold_ms,
            timeout_ms,
        } => {
            if let Some(timeout_ms) = timeout_ms {
                settings.group_lock_timeout_ms = timeout_ms;
            }
            let core = Arc::new(ClientCore::connect(
                settings,
                Arc::new(MemoryJobQueue::new()),
            )?);
            let report = tokio::task::spawn_blocking(move || lock_probe(&core, hold_ms))
                .await
                .context("lock probe panicked")??;
            println!("{report}");
        }
        Command::Completion {
            registered,
            profile_name_set,
            has_pin,
            opted_out,
            already_complete,
        } => {
            let inputs = CompletionInputs {
                is_account_registered: registered,
                profile_name_is_set: profile_name_set,
                has_pin,
                has_opted_out_of_pin: opted_out,
                already_marked_complete: already_complete,
            };
            println!("should_mark_complete={}", should_mark_complete(&inputs));
        }
    }

    Ok(())
}

fn lock_probe(core: &Arc<ClientCore>, hold_ms: u64) -> Result<String> {
    let (held_tx, held_rx) = std::sync::mpsc::channel();
    let holder_core = Arc::clone(core);
    let holder = thread::Builder::new()
        .name("probe-holder".into())
        .spawn(move || -> Result<()> {
            let _guard = holder_core.group_lock().acquire_group_processing_lock()?;
            held_tx.send(()).context("probe receiver gone")?;
            thread::sleep(Duration::from_millis(hold_ms));
            Ok(())
        })
        .context("spawning holder thread")?;
    held_rx.recv().context("holder never took the lock")?;
    info!(hold_ms, "lock probe: holder has the group lock");

    let change = MembershipChange::Add(vec![Aci(Uuid::new_v4())]);
    let report = match core.groups().apply(GroupId(1), &change) {
        Ok(record) => format!("acquired after holder released; revision={}", record.revision),
        Err(err) => format!("busy (retryable={}): {err}", err.is_retryable()),
    };

    holder
        .join()
        .map_err(|_| anyhow::anyhow!("holder thread panicked"))??;
    Ok(report)
}
