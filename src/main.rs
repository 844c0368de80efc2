//! tcpguard CLI entry point.
//!
//! One-shot subcommands for building, inspecting and checking descriptors,
//! plus `run`, a JSON-lines host adapter for long-running integrations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use tcpguard::config::GuardConfig;
use tcpguard::descriptor::{
    decode, encode, encode_extended, CommandId, DescriptorFields, SecurityFlags, SIGNATURE_LEN,
};
use tcpguard::gateway::{Authorization, EnforcementGateway};
use tcpguard::risk::{Caller, InvocationContext};

/// Exit code for any verdict other than allow.
const EXIT_DENIED: u8 = 2;

/// tcpguard: Tool Capability Protocol descriptor validation and enforcement.
#[derive(Parser)]
#[command(name = "tcpguard", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Encode a descriptor and print it as hex.
    Encode {
        /// Command name (hashed) or `0x`-prefixed hash.
        #[arg(long)]
        command: String,
        /// Comma-separated flag names, e.g. `destructive,file_delete`.
        #[arg(long, default_value = "")]
        flags: String,
        /// Opaque performance hint.
        #[arg(long, default_value_t = 0)]
        perf: u64,
        /// 8-byte signature as hex; selects the 32-byte layout.
        #[arg(long)]
        signature: Option<String>,
    },
    /// Decode a hex descriptor and print it as JSON.
    Inspect {
        /// Descriptor bytes as hex.
        hex: String,
    },
    /// Authorize one request and print the verdict. Exits 2 unless allowed.
    Check {
        /// Caller identifier.
        #[arg(long)]
        caller: String,
        /// Caller already holds elevated privilege.
        #[arg(long)]
        elevated: bool,
        /// Descriptor database to load.
        #[arg(long)]
        db: Option<PathBuf>,
        /// Command followed by its arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        argv: Vec<String>,
    },
    /// Release a quarantined caller.
    Release {
        /// Caller identifier.
        #[arg(long)]
        caller: String,
        /// Who is releasing it.
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Serve JSON-lines requests on stdin, answering on stdout.
    Run {
        /// Descriptor database to load.
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Encode {
            command,
            flags,
            perf,
            signature,
        } => {
            tcpguard::logging::init_cli();
            handle_encode(&command, &flags, perf, signature.as_deref())
        }
        Command::Inspect { hex } => {
            tcpguard::logging::init_cli();
            handle_inspect(&hex)
        }
        Command::Check {
            caller,
            elevated,
            db,
            argv,
        } => {
            tcpguard::logging::init_cli();
            handle_check(&caller, elevated, db, &argv).await
        }
        Command::Release { caller, by } => {
            tcpguard::logging::init_cli();
            handle_release(&caller, &by).await
        }
        Command::Run { db } => handle_run(db).await,
    }
}

/// `0x`-prefixed hex is a raw hash; anything else is a command name.
fn parse_command(raw: &str) -> CommandId {
    raw.strip_prefix("0x")
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .map_or_else(|| CommandId::from_name(raw), CommandId::new)
}

fn load_config(db: Option<PathBuf>) -> anyhow::Result<GuardConfig> {
    let mut config = GuardConfig::load().context("failed to load configuration")?;
    if db.is_some() {
        config.registry.descriptor_db = db;
    }
    Ok(config)
}

fn handle_encode(
    command: &str,
    flags: &str,
    perf: u64,
    signature: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let flags = SecurityFlags::parse_list(flags)
        .map_err(|name| anyhow::anyhow!("unknown flag: {name}"))?;
    let fields = DescriptorFields::new(parse_command(command), flags).with_performance_hint(perf);

    let bytes = match signature {
        None => encode(&fields)?.to_vec(),
        Some(sig) => {
            let raw = hex::decode(sig).context("signature is not valid hex")?;
            let sig: [u8; SIGNATURE_LEN] = raw.try_into().map_err(|raw: Vec<u8>| {
                anyhow::anyhow!("signature must be {SIGNATURE_LEN} bytes, got {}", raw.len())
            })?;
            encode_extended(&fields, sig)?.to_vec()
        }
    };
    println!("{}", hex::encode(bytes));
    Ok(ExitCode::SUCCESS)
}

fn handle_inspect(raw: &str) -> anyhow::Result<ExitCode> {
    let bytes = hex::decode(raw.trim()).context("input is not valid hex")?;
    let descriptor = decode(&bytes)?;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(ExitCode::SUCCESS)
}

async fn handle_check(
    caller: &str,
    elevated: bool,
    db: Option<PathBuf>,
    argv: &[String],
) -> anyhow::Result<ExitCode> {
    let config = load_config(db)?;
    let gateway = EnforcementGateway::from_config(&config).await?;

    let Some((command, args)) = argv.split_first() else {
        anyhow::bail!("missing command");
    };
    let caller = Caller {
        id: caller.to_owned(),
        elevated,
    };
    let command_id = parse_command(command);

    // A one-shot check has nobody to approve; a pending request is reported
    // as such and withdrawn.
    let verdict = match gateway.authorize_deferred(command_id, args, &caller).await {
        Authorization::Decided(verdict) => json!(verdict),
        Authorization::Pending(pending) => {
            json!({"verdict": "require_approval", "token": pending.token()})
        }
    };
    let allowed = verdict["verdict"] == "allow";

    println!(
        "{}",
        json!({
            "command": command,
            "command_hash": command_id,
            "result": verdict,
        })
    );
    Ok(if allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_DENIED)
    })
}

async fn handle_release(caller: &str, by: &str) -> anyhow::Result<ExitCode> {
    let config = load_config(None)?;
    let gateway = EnforcementGateway::from_config(&config).await?;
    let record = gateway.release(caller, by).await?;
    println!("{}", serde_json::to_string(&record)?);
    Ok(ExitCode::SUCCESS)
}

// ── run ─────────────────────────────────────────────────────────

/// One request line on stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Authorize {
        #[serde(default)]
        id: Option<String>,
        caller: String,
        #[serde(default)]
        elevated: bool,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    Resolve {
        token: Uuid,
        approved: bool,
        #[serde(default = "default_actor")]
        by: String,
    },
    Cancel {
        token: Uuid,
    },
    Release {
        caller: String,
        #[serde(default = "default_actor")]
        by: String,
    },
}

fn default_actor() -> String {
    "host".to_owned()
}

async fn handle_run(db: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = load_config(db)?;
    let _logging_guard = tcpguard::logging::init_production(&config.paths.logs_dir()?)?;
    let gateway = Arc::new(EnforcementGateway::from_config(&config).await?);
    info!("tcpguard host adapter started");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<serde_json::Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            let mut bytes = line.to_string().into_bytes();
            bytes.push(b'\n');
            if stdout.write_all(&bytes).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut waiters = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            Some(joined) = waiters.join_next(), if !waiters.is_empty() => {
                if let Err(error) = joined {
                    warn!(error = %error, "approval waiter failed");
                }
                continue;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                None
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                handle_request(&gateway, request, &out_tx, &mut waiters).await;
            }
            Err(error) => {
                warn!(error = %error, "malformed request");
                let _send = out_tx.send(json!({"error": format!("malformed request: {error}")}));
            }
        }
    }

    let cancelled = gateway.shutdown();
    if cancelled > 0 {
        info!(cancelled, "withdrew pending approvals");
    }
    while waiters.join_next().await.is_some() {}
    drop(out_tx);
    let _writer_result = writer.await;
    info!("tcpguard host adapter stopped");
    Ok(ExitCode::SUCCESS)
}

async fn handle_request(
    gateway: &Arc<EnforcementGateway>,
    request: Request,
    out: &mpsc::UnboundedSender<serde_json::Value>,
    waiters: &mut JoinSet<()>,
) {
    let reply = match request {
        Request::Authorize {
            id,
            caller,
            elevated,
            command,
            args,
            cwd,
        } => {
            let mut ctx =
                InvocationContext::new(Caller { id: caller, elevated }, parse_command(&command), args);
            ctx.working_dir = cwd;
            match gateway.authorize_invocation(ctx).await {
                Authorization::Decided(verdict) => json!({"id": id, "result": verdict}),
                Authorization::Pending(pending) => {
                    let token = pending.token();
                    let out = out.clone();
                    let final_id = id.clone();
                    waiters.spawn(async move {
                        let verdict = pending.wait().await;
                        let _send =
                            out.send(json!({"id": final_id, "token": token, "result": verdict}));
                    });
                    json!({"id": id, "status": "pending", "token": token})
                }
            }
        }
        Request::Resolve {
            token,
            approved,
            by,
        } => match gateway.resolve_approval(token, approved, &by) {
            Ok(_) => json!({"token": token, "resolved": true}),
            Err(error) => json!({"token": token, "error": error.to_string()}),
        },
        Request::Cancel { token } => match gateway.approvals().cancel(token) {
            Ok(_) => json!({"token": token, "cancelled": true}),
            Err(error) => json!({"token": token, "error": error.to_string()}),
        },
        Request::Release { caller, by } => match gateway.release(&caller, &by).await {
            Ok(record) => json!({"released": record}),
            Err(error) => json!({"caller": caller, "error": error.to_string()}),
        },
    };
    let _send = out.send(reply);
}
