use std::time::Duration;
use tonic::Code;

use super::backoff::ExponentialBackoff;

/// Settings that decide which failed attempts are retried and how long to
/// back off in between.
///
/// The defaults match what the Cloud Bigtable clients use: retries on, the
/// transient codes retryable, 5ms initial backoff doubling each time, and one
/// minute of total backoff.
#[derive(Clone, Debug)]
pub struct RetryOptions {
    /// If false, every failed attempt is surfaced to the caller as is.
    pub enable_retries: bool,
    /// Failed attempts with other codes are never retried.
    pub retryable_codes: Vec<Code>,

    // Backoff
    // -------
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Budget for the sum of all backoff intervals of one operation.
    pub max_elapsed_backoff: Duration,
}

pub const DEFAULT_RETRYABLE_CODES: [Code; 4] = [
    Code::DeadlineExceeded,
    Code::Unavailable,
    Code::Aborted,
    Code::Unauthenticated,
];

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            enable_retries: true,
            retryable_codes: DEFAULT_RETRYABLE_CODES.to_vec(),
            initial_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            max_elapsed_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryOptions {
    /// Overwrites any prior setting.
    pub fn with_retries_enabled(self, enable_retries: bool) -> Self {
        Self {
            enable_retries,
            ..self
        }
    }

    /// Overwrites the whole set of retryable codes.
    pub fn with_retryable_codes<I>(self, codes: I) -> Self
    where
        I: IntoIterator<Item = Code>,
    {
        Self {
            retryable_codes: codes.into_iter().collect(),
            ..self
        }
    }

    /// Sets how long to wait after a retryable failure. See
    /// [`ExponentialBackoff`] for how these combine.
    ///
    /// Overwrites any prior backoff settings.
    pub fn with_exponential_backoff(
        self,
        initial: Duration,
        multiplier: f64,
        max_elapsed: Duration,
    ) -> Self {
        Self {
            initial_backoff: initial,
            backoff_multiplier: multiplier,
            max_elapsed_backoff: max_elapsed,
            ..self
        }
    }

    /// Configures the options with the given function.
    ///
    /// This is helpful to centralize configuration of a category of
    /// operations while keeping the builder style.
    pub fn with<F>(self, f: F) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        f(self)
    }

    pub fn is_retryable(&self, code: Code) -> bool {
        self.retryable_codes.contains(&code)
    }

    /// Returns fresh backoff state for one operation.
    pub fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.initial_backoff,
            self.backoff_multiplier,
            self.max_elapsed_backoff,
        )
    }
}

/// Command-line flags for [`RetryOptions`], meant to be flattened into a
/// binary's arguments.
#[derive(clap::Args, Clone, Debug)]
pub struct RetryArgs {
    /// Don't retry failed RPCs.
    #[arg(long = "rpc-disable-retries")]
    pub disable_retries: bool,

    /// gRPC codes that may be retried, as names (like `unavailable`) or
    /// numbers, separated by commas.
    #[arg(
        long = "rpc-retryable-codes",
        value_delimiter = ',',
        value_parser = parse_code,
        default_values = ["deadline_exceeded", "unavailable", "aborted", "unauthenticated"],
    )]
    pub retryable_codes: Vec<Code>,

    /// How long to wait after the first retryable failure.
    #[arg(long = "rpc-initial-backoff",
            value_parser = parse_duration,
            default_value = format!("{:?}", RetryOptions::default().initial_backoff))]
    pub initial_backoff: Duration,

    /// Growth factor of the backoff interval (clamped >= 1.0).
    #[arg(long = "rpc-backoff-multiplier",
            default_value_t = RetryOptions::default().backoff_multiplier)]
    pub backoff_multiplier: f64,

    /// Total backoff an operation may accumulate before giving up.
    #[arg(long = "rpc-max-elapsed-backoff",
            value_parser = parse_duration,
            default_value = format!("{:?}", RetryOptions::default().max_elapsed_backoff))]
    pub max_elapsed_backoff: Duration,
}

impl From<RetryArgs> for RetryOptions {
    fn from(args: RetryArgs) -> Self {
        Self {
            enable_retries: !args.disable_retries,
            retryable_codes: args.retryable_codes,
            initial_backoff: args.initial_backoff,
            backoff_multiplier: args.backoff_multiplier,
            max_elapsed_backoff: args.max_elapsed_backoff,
        }
    }
}

/// Parses a gRPC code given by name (`UNAVAILABLE`, `unavailable`,
/// `Unavailable`, `deadline-exceeded`) or by number (`14`).
pub fn parse_code(input: &str) -> Result<Code, String> {
    let input = input.trim();
    if let Ok(n) = input.parse::<i32>() {
        return match n {
            0..=16 => Ok(Code::from(n)),
            _ => Err(format!("gRPC code {n} is out of range (0-16)")),
        };
    }
    let name: String = input
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    Ok(match name.as_str() {
        "ok" => Code::Ok,
        "cancelled" | "canceled" => Code::Cancelled,
        "unknown" => Code::Unknown,
        "invalidargument" => Code::InvalidArgument,
        "deadlineexceeded" => Code::DeadlineExceeded,
        "notfound" => Code::NotFound,
        "alreadyexists" => Code::AlreadyExists,
        "permissiondenied" => Code::PermissionDenied,
        "resourceexhausted" => Code::ResourceExhausted,
        "failedprecondition" => Code::FailedPrecondition,
        "aborted" => Code::Aborted,
        "outofrange" => Code::OutOfRange,
        "unimplemented" => Code::Unimplemented,
        "internal" => Code::Internal,
        "unavailable" => Code::Unavailable,
        "dataloss" => Code::DataLoss,
        "unauthenticated" => Code::Unauthenticated,
        _ => return Err(format!("unknown gRPC code {input:?}")),
    })
}

/// Accepts input like "5ms", "1.5 s" or "2m". A bare number is taken as
/// seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("couldn't parse number in duration {input:?}"))?;
    let nanos_per_unit = match unit.trim_start() {
        "ns" => 1.0,
        "µs" | "us" => 1e3,
        "ms" => 1e6,
        "" | "s" => 1e9,
        "m" | "min" => 60.0 * 1e9,
        "h" | "hr" => 60.0 * 60.0 * 1e9,
        other => {
            return Err(format!(
                "unknown unit {other:?} in duration (valid units are: ns, µs/us, ms, s, m/min, h/hr)"
            ))
        }
    };
    Ok(Duration::from_nanos((number * nanos_per_unit).round() as u64))
}
