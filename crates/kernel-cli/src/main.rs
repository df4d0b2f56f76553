use clap::Parser;
use kernel::{Kernel, KernelConfig};
use kernel_broker::RedisBroker;
use pyexec::{ExecutorConfig, DEFAULT_ALLOWED_MODULES};
use std::time::Duration;

/// Long-running remote code-execution kernel: fetches messages from a
/// broker, runs Python against an embedded interpreter, and streams
/// results back.
#[derive(Parser, Debug)]
#[command(name = "kernel-cli", about = "Remote code-execution kernel")]
struct Args {
    /// This kernel instance's id, used to address it on the broker and to
    /// validate incoming envelopes.
    #[arg(long)]
    kernel_id: String,

    /// Keep interpreter global scope across `code_execution` requests.
    /// Defaults to one-shot, stateless semantics; pass `--session-mode true`
    /// to persist global state across calls.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    session_mode: bool,

    /// Seconds between expected `ping_request`s. The kernel shuts itself
    /// down after twice this interval without one.
    #[arg(long, default_value_t = 15)]
    ping_interval: u64,

    /// Seconds to wait for an `input_response` before abandoning an
    /// `input()` call with an empty line.
    #[arg(long, default_value_t = 600)]
    input_timeout: u64,

    /// Maximum seconds a single `code_execution` may run before it is
    /// abandoned. Must be at most `2 * ping_interval`, so a stuck execution
    /// is never mistaken for a dead kernel.
    #[arg(long, default_value_t = 15)]
    max_code_execution_time: u64,

    /// Seconds one broker poll blocks before returning empty. Bounds how
    /// often deadlines (ping liveness, input timeout) are re-evaluated.
    #[arg(long, default_value_t = 2)]
    tick_timeout: u64,

    /// One or more `host:port` broker servers, comma-separated. The first
    /// reachable one is used.
    #[arg(long, value_delimiter = ',')]
    broker_servers: Vec<String>,

    /// Comma-separated list of importable modules, overriding the default
    /// allowlist.
    #[arg(long, value_delimiter = ',')]
    allowed_modules: Option<Vec<String>>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if args.max_code_execution_time > 2 * args.ping_interval {
        eprintln!(
            "max_code_execution_time ({}) must be at most 2 * ping_interval ({})",
            args.max_code_execution_time,
            2 * args.ping_interval
        );
        std::process::exit(1);
    }

    let broker = match RedisBroker::connect(&args.broker_servers) {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("failed to connect to broker: {e}");
            std::process::exit(1);
        }
    };

    let kernel_config = KernelConfig {
        kernel_id: args.kernel_id,
        session_mode: args.session_mode,
        ping_interval: Duration::from_secs(args.ping_interval),
        input_timeout: Duration::from_secs(args.input_timeout),
        max_code_execution_time: args.max_code_execution_time,
        tick_timeout: Duration::from_secs(args.tick_timeout),
    };

    let allowed_modules = args.allowed_modules.unwrap_or_else(|| {
        DEFAULT_ALLOWED_MODULES.iter().map(|s| s.to_string()).collect()
    });
    let module_config = ExecutorConfig {
        allowed_modules,
        ..ExecutorConfig::default()
    };

    let kernel = Kernel::new(Box::new(broker), kernel_config, module_config);
    std::process::exit(kernel.run());
}
