use crate::bridge::queue::ContextEvent;
use crate::bridge::transport::Request;
use crate::config::config::HostConfig;
use crate::config::types::ContextId;
use crate::config::validator::validate_config;
use crate::memory::allocator::{AllocationHint, BufferAllocator};
use crate::observability::metrics::get_metrics;
use crate::pool::context::HeapValue;
use crate::pool::pool::ContextPool;
use crate::testing::mock_transport::{MockResponse, MockTransport};
use crate::testing::race_proof::{prove_abort_timeout, prove_dispose_finalize, RaceProofConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MIB: usize = 1024 * 1024;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to ./hostpool.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append audit events to this file as JSON lines
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lend and reset contexts against a loopback transport, then prove the
    /// release races
    Selfcheck {
        /// Lend/reset cycles to run
        #[arg(long, default_value_t = 100)]
        cycles: usize,
        /// Iterations for each race proof (0 skips them)
        #[arg(long, default_value_t = 50)]
        race_iterations: usize,
        /// Print Prometheus metrics after the report
        #[arg(long)]
        metrics: bool,
    },
    /// Allocate fixed-size buffers until the admission gate refuses one
    StressAlloc {
        /// Size of each allocation in MiB
        #[arg(long, default_value_t = 100)]
        size_mb: usize,
        /// Upper bound on attempts
        #[arg(long, default_value_t = 1024)]
        max_attempts: usize,
    },
    /// Print the effective configuration as JSON
    Config,
}

extern "C" fn signal_handler(sig: i32) {
    // Only async-signal-safe calls here: raw write and _exit
    let msg = b"hostpool: signal received, exiting\n";
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + sig);
    }
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<HostConfig> {
    let mut config = match path {
        Some(path) => HostConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HostConfig::load_default()?,
    };
    config.apply_env_overrides();
    Ok(config)
}

pub fn run() -> Result<()> {
    setup_signal_handlers();
    env_logger::init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    if cli.audit_log.is_some() {
        config.audit_log = cli.audit_log.clone();
    }

    crate::observability::audit::init_security_logger(config.audit_log.as_deref())
        .context("initializing audit log")?;

    match cli.command {
        Commands::Selfcheck {
            cycles,
            race_iterations,
            metrics,
        } => {
            let passed = selfcheck(&config, cycles, race_iterations)?;
            if metrics {
                print!("{}", get_metrics().export_prometheus());
            }
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::StressAlloc {
            size_mb,
            max_attempts,
        } => stress_alloc(&config, size_mb, max_attempts),
        Commands::Config => {
            let validation = validate_config(&config)?;
            let json_result = serde_json::json!({
                "config": config,
                "valid": validation.is_valid(),
                "errors": validation.errors,
                "warnings": validation.warnings,
            });
            println!("{}", serde_json::to_string_pretty(&json_result)?);
            Ok(())
        }
    }
}

fn selfcheck(config: &HostConfig, cycles: usize, race_iterations: usize) -> Result<bool> {
    let transport = MockTransport::new()
        .with_response("loopback://echo", MockResponse::ok(b"pong"))
        .with_response("loopback://stall", MockResponse::stalling(1));
    let counters = transport.counters();
    let pool = ContextPool::from_config(config, Arc::new(transport))?;

    let started = Instant::now();
    let mut failures = Vec::new();

    for cycle in 0..cycles {
        let result = pool.run(|ctx| {
            let buf = ctx.allocate_buffer(4096, AllocationHint::Auto)?;
            buf.write(0, b"selfcheck")?;
            let token = ctx.create_blob_from_buffer(&buf, "application/octet-stream")?;
            ctx.heap_mut().hold(HeapValue::Buffer(buf));
            ctx.heap_mut().hold(HeapValue::Blob(token));

            // One operation completes, one is left running for reset to cancel
            let echo = ctx.fetch(Request::get("loopback://echo"));
            ctx.fetch(Request::get("loopback://stall"));
            match ctx.next_event(Duration::from_secs(5)) {
                Some(ContextEvent::Completion(done)) if done.operation_id == echo.id() => {
                    done.outcome.into_result().map(|_| ())
                }
                other => Err(crate::config::types::HostError::TransportFailure(format!(
                    "unexpected event {:?}",
                    other
                ))),
            }
        });
        if let Err(e) = result {
            failures.push(format!("cycle {}: {}", cycle, e));
        }
    }

    let lend_time = started.elapsed();
    let outstanding_bytes = pool.factory().allocator().outstanding_bytes();
    let open_streams = counters.open_streams();
    let stats = pool.stats();

    let sample = pool.run(|ctx| Ok(ctx.info())).ok();

    let mut race_violations = Vec::new();
    if race_iterations > 0 {
        let race = RaceProofConfig {
            iterations: race_iterations,
            ..Default::default()
        };
        let dispose = prove_dispose_finalize(pool.factory().allocator(), &race)?;
        race_violations.extend(dispose.violations);

        let abort = prove_abort_timeout(pool.factory().bridge(), &counters, "loopback://stall", &race);
        race_violations.extend(abort.violations);
    }
    pool.shutdown();

    if outstanding_bytes != 0 {
        failures.push(format!("{} buffer bytes outstanding after reset", outstanding_bytes));
    }
    if open_streams != 0 {
        failures.push(format!("{} transport streams left open", open_streams));
    }

    let passed = failures.is_empty() && race_violations.is_empty();
    let report = serde_json::json!({
        "status": if passed { "OK" } else { "FAILED" },
        "cycles": cycles,
        "lend_time_ms": lend_time.as_millis() as u64,
        "pool": stats,
        "sample_context": sample,
        "failures": failures,
        "race_violations": race_violations,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(passed)
}

fn stress_alloc(config: &HostConfig, size_mb: usize, max_attempts: usize) -> Result<()> {
    let allocator = BufferAllocator::new(config.allocator.clone());
    let owner = ContextId::new();
    let size = size_mb * MIB;
    let mut held = Vec::new();
    let mut refusal = None;

    for _ in 0..max_attempts {
        match allocator.allocate(owner, size, AllocationHint::Auto) {
            Ok(buf) => held.push(buf),
            Err(e) => {
                refusal = Some(e.to_string());
                break;
            }
        }
    }

    let admitted = held.len();
    let peak = allocator.stats();
    drop(held);
    let after = allocator.stats();

    let json_result = serde_json::json!({
        "allocation_bytes": size,
        "budget_bytes": config.allocator.process_budget_bytes,
        "admitted": admitted,
        "refusal": refusal,
        "peak": peak,
        "after_release": after,
    });
    println!("{}", serde_json::to_string_pretty(&json_result)?);
    Ok(())
}
