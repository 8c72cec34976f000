//! Operator tool for the synchronization engine.
//!
//! # Responsibility
//! - Run the integrity audit and print its JSON report.
//! - Run maintenance passes: outbox drain, shard rebuild, aggregate recompute.
//!
//! Usage: `allocsync [--config FILE] [--log-level LEVEL] <command> [DB_PATH] [--top N] [--strict]`

use allocsync_core::{
    init_stderr_logging, open_db, open_db_read_only, Auditor, CacheLayer, KeyedLocks,
    ShutdownSignal, SqliteShardSink, SyncConfig, SyncService,
};
use log::info;
use rusqlite::Connection;
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

const USAGE: &str = "usage: allocsync [--config FILE] [--log-level LEVEL] <ping|audit|drain|rebuild|recompute> [DB_PATH] [--top N] [--strict]";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Ping,
    Audit { db_path: String, top_n: Option<u32>, strict: bool },
    Drain { db_path: String },
    Rebuild { db_path: String },
    Recompute { db_path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    config_path: Option<String>,
    log_level: String,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Invocation, String> {
    let mut config_path = None;
    let mut log_level = "warn".to_string();
    let mut top_n = None;
    let mut strict = false;
    let mut positional = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(iter.next().ok_or("--config needs a value")?.clone());
            }
            "--log-level" => {
                log_level = iter.next().ok_or("--log-level needs a value")?.clone();
            }
            "--top" => {
                let raw = iter.next().ok_or("--top needs a value")?;
                top_n = Some(
                    raw.parse::<u32>()
                        .map_err(|_| format!("--top expects a positive integer, got `{raw}`"))?,
                );
            }
            "--strict" => strict = true,
            flag if flag.starts_with("--") => return Err(format!("unknown option `{flag}`")),
            value => positional.push(value.to_string()),
        }
    }

    let mut positional = positional.into_iter();
    let name = positional.next().ok_or(USAGE)?;
    let mut db_path = || positional.next().ok_or_else(|| format!("`{name}` needs DB_PATH"));
    let command = match name.as_str() {
        "ping" => Command::Ping,
        "audit" => Command::Audit {
            db_path: db_path()?,
            top_n,
            strict,
        },
        "drain" => Command::Drain { db_path: db_path()? },
        "rebuild" => Command::Rebuild { db_path: db_path()? },
        "recompute" => Command::Recompute { db_path: db_path()? },
        other => return Err(format!("unknown command `{other}`\n{USAGE}")),
    };

    Ok(Invocation {
        config_path,
        log_level,
        command,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(invocation: Invocation) -> Result<ExitCode, Box<dyn Error>> {
    init_stderr_logging(&invocation.log_level)?;
    let config = match &invocation.config_path {
        Some(path) => SyncConfig::from_path(path)?,
        None => SyncConfig::default(),
    };

    match invocation.command {
        Command::Ping => {
            println!("allocsync_core ping={}", allocsync_core::ping());
            println!("allocsync_core version={}", allocsync_core::core_version());
            Ok(ExitCode::SUCCESS)
        }
        Command::Audit {
            db_path,
            top_n,
            strict,
        } => {
            let conn = open_db_read_only(&db_path)?;
            let report = Auditor::new(&conn)
                .with_top_n(top_n.unwrap_or(config.audit_top_n))
                .run_audit();
            print_json(&report)?;
            if strict && !report.is_clean() {
                return Ok(ExitCode::from(2));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Drain { db_path } => {
            let conn = open_db(&db_path)?;
            let service = maintenance_service(&conn, &config);
            let report = service.drain()?;
            info!(
                "event=cli_drain module=cli status=ok failures={}",
                report.failures.len()
            );
            print_json(&report)?;
            Ok(exit_for(report.failures.is_empty() && !report.aborted))
        }
        Command::Rebuild { db_path } => {
            let conn = open_db(&db_path)?;
            let report = maintenance_service(&conn, &config).rebuild_shards()?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Recompute { db_path } => {
            let conn = open_db(&db_path)?;
            let (aggregates, propagation) = maintenance_service(&conn, &config).recompute_all()?;
            let synced = aggregates.is_clean() && propagation.iter().all(|p| p.is_delivered());
            print_json(&serde_json::json!({
                "aggregates": aggregates,
                "propagation": propagation,
            }))?;
            Ok(exit_for(synced))
        }
    }
}

fn maintenance_service<'conn>(
    conn: &'conn Connection,
    config: &SyncConfig,
) -> SyncService<'conn, SqliteShardSink<'conn>> {
    SyncService::new(
        conn,
        SqliteShardSink::new(conn),
        CacheLayer::disabled(),
        Arc::new(KeyedLocks::new()),
        ShutdownSignal::new(),
        config,
    )
}

fn exit_for(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn main() -> ExitCode {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let invocation = match parse_args(&args) {
        Ok(invocation) => invocation,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(64);
        }
    };
    match run(invocation) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("allocsync: {err}");
            ExitCode::FAILURE
        }
    }
}
