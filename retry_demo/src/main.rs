use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::sleep;
use tonic::Code;
use tracing::{info, warn, Level};

use observability::{logging, metrics};
use rpc_retry::{
    parse_code, parse_duration, RequestStrategy, RetryArgs, RetryOptions, RetryingOperation,
    StatsdInstrumentation, StreamingRead, TokioScheduler, Transport, Unary,
};

mod flaky;

use flaky::{FlakyTransport, ReadRequest};

/// Runs a read against an in-process server that fails the first few
/// attempts, to show how the retry options play out.
#[derive(Parser)]
struct Args {
    #[command(flatten)]
    retry: RetryArgs,

    /// How many attempts the server fails before answering.
    #[arg(long, default_value_t = 2)]
    failures: usize,

    /// The code the server fails attempts with.
    #[arg(long, default_value = "unavailable", value_parser = parse_code)]
    failure_code: Code,

    /// How long the server takes to answer each attempt.
    #[arg(long, default_value = "20ms", value_parser = parse_duration)]
    latency: Duration,

    /// Send the read as a non-idempotent request.
    #[arg(long)]
    non_idempotent: bool,

    /// Scan this many rows instead of reading a single value.
    #[arg(long, conflicts_with = "non_idempotent")]
    scan_rows: Option<usize>,

    /// Cancel the operation after this long.
    #[arg(long, value_parser = parse_duration)]
    cancel_after: Option<Duration>,

    /// Send metrics to the statsd agent at this `host:port`.
    #[arg(long)]
    metrics: Option<String>,

    /// Export spans to this OTLP/gRPC endpoint.
    #[arg(long)]
    otlp_endpoint: Option<String>,

    /// The key to read.
    #[arg(default_value = "user/42")]
    key: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = logging::configure_with_options(logging::Options {
        process_name: String::from("retry_demo"),
        default_log_level: Level::INFO,
        otlp_endpoint: args.otlp_endpoint.clone(),
        ..logging::Options::default()
    }) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }

    let result = run(args).await;
    logging::flush();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let metrics = match &args.metrics {
        Some(agent) => metrics::Client::new_with_tags("retry_demo", Some(agent.as_str()), [])
            .context("failed to create metrics client")?,
        None => metrics::Client::NONE,
    };

    let transport = FlakyTransport::new(
        flaky::Config {
            failures: args.failures,
            failure_code: args.failure_code,
            latency: args.latency,
            scan_rows: args.scan_rows,
        },
        Handle::current(),
    );
    let request = ReadRequest { key: args.key };
    let options = RetryOptions::from(args.retry);
    info!(
        method = transport.method_name(),
        failures = args.failures,
        failure_code = ?args.failure_code,
        ?options,
        "starting operation"
    );

    let demo = Demo {
        transport,
        request,
        options,
        instrumentation: Arc::new(StatsdInstrumentation::new(metrics, "retry_demo")),
        cancel_after: args.cancel_after,
    };

    if args.scan_rows.is_some() {
        let rows = demo.execute(StreamingRead::scan()).await?;
        info!(rows = rows.len(), first = ?rows.first(), "scan finished");
    } else if args.non_idempotent {
        let value = demo.execute(Unary::non_idempotent()).await?;
        info!(%value, "read finished");
    } else {
        let value = demo.execute(Unary::idempotent()).await?;
        info!(%value, "read finished");
    }
    Ok(())
}

struct Demo {
    transport: FlakyTransport,
    request: ReadRequest,
    options: RetryOptions,
    instrumentation: Arc<StatsdInstrumentation>,
    cancel_after: Option<Duration>,
}

impl Demo {
    async fn execute<S>(self, strategy: S) -> anyhow::Result<S::Output>
    where
        S: RequestStrategy<ReadRequest, String>,
    {
        let handle = RetryingOperation::new(
            self.transport,
            strategy,
            self.request,
            Arc::new(TokioScheduler::current()),
        )
        .with_retry_options(self.options)
        .with_instrumentation(self.instrumentation)
        .start();

        if let Some(after) = self.cancel_after {
            let handle = handle.clone();
            tokio::spawn(async move {
                sleep(after).await;
                if handle.cancel_with_reason("--cancel-after elapsed") {
                    warn!(?after, "cancelled operation");
                }
            });
        }

        handle.wait().await.context("operation failed")
    }
}
