use dogstatsd::DogstatsdResult;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Returns a stringified metrics [`Tag`] with a key and corresponding value.
///
/// Examples:
///
/// ```ignore
/// use crate::metrics_tag as tag;
/// tag!(?debugged);
/// tag!(displayed);
/// tag!(format: "for{}ted", "mat");
/// tag!("format": "literal");
/// ```
#[macro_export]
macro_rules! metrics_tag {
    ($k:ident) => {{
        $crate::metrics::Tag::from(format!("{}:{}", stringify!($k), $k))
    }};
    (?$k:ident) => {{
        $crate::metrics::Tag::from(format!("{}:{:?}", stringify!($k), $k))
    }};
    ($k:ident : $($arg:tt)*) => {{
        $crate::metrics::Tag::from(format!("{}:{}", stringify!($k), format_args!($($arg)*)))
    }};
    ($k:tt : $($arg:tt)*) => {{
        $crate::metrics::Tag::from(format!("{}:{}", $k, format_args!($($arg)*)))
    }};
}

#[derive(Debug)]
pub struct Tag(String);

impl From<String> for Tag {
    fn from(s: String) -> Self {
        Self(make_valid_tag(s))
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to create statsd client: {0}")]
pub struct MetricsError(#[from] dogstatsd::DogstatsdError);

/// Sends metrics to a statsd agent.
///
/// This wraps [`dogstatsd::Client`] so that:
/// - It is optional, so it can be excluded from tests.
/// - It is cheap to clone and can be shared by concurrent operations.
/// - It warns on errors instead of returning them to the caller.
/// - It sends durations with nanosecond rather than millisecond precision.
///   (They are sent through the `statsd` protocol as distribution.)
#[derive(Clone, Debug)]
pub struct Client {
    inner: Option<Arc<dogstatsd::Client>>,
}

impl Client {
    /// Does not record metrics.
    pub const NONE: Self = Self { inner: None };

    /// `agent` is the `host:port` of the statsd agent, or `None` for the
    /// default `127.0.0.1:8125`. Every metric is tagged with the service name
    /// and `tags`.
    pub fn new_with_tags<I>(
        service_name: &str,
        agent: Option<&str>,
        tags: I,
    ) -> Result<Self, MetricsError>
    where
        I: IntoIterator<Item = Tag>,
    {
        let mut options = dogstatsd::OptionsBuilder::new();
        if let Some(agent) = agent {
            options.to_addr(agent.to_owned());
        }
        options.default_tag(metrics_tag!(service: "{service_name}").0);
        for tag in tags {
            options.default_tag(tag.0);
        }
        let client = dogstatsd::Client::new(options.build())?;
        Ok(Self {
            inner: Some(Arc::new(client)),
        })
    }

    /// See [`dogstatsd::Client::incr`].
    pub fn incr<'a, I, S, T>(&self, stat: S, tags: I)
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        T: AsRef<str>,
    {
        if let Some(client) = &self.inner {
            client.incr(metric_name(stat), tags).warn_err();
        }
    }

    /// See [`dogstatsd::Client::timing`]. This version sends the duration as a
    /// distribution with nanosecond precision, under `{stat}.ns`.
    pub fn timing<'a, I, S, T>(&self, stat: S, duration: Duration, tags: I)
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        T: AsRef<str>,
    {
        if let Some(client) = &self.inner {
            client
                .distribution(
                    metric_name(format!("{}.ns", stat.into())),
                    duration.as_nanos().to_string(),
                    tags,
                )
                .warn_err();
        }
    }
}

fn metric_name<'a>(name: impl Into<Cow<'a, str>>) -> Cow<'a, str> {
    let output = make_valid_metric_name(name.into());
    debug_assert!(
        output.len() < 100,
        "metric name '{output}' is longer than recommended"
    );
    output
}

// https://docs.datadoghq.com/developers/guide/what-best-practices-are-recommended-for-naming-metrics-and-tags/
// Metric names must start with a letter and only contain ASCII alphanumerics,
// underscores and periods. Other characters are converted to underscores.
fn make_valid_metric_name(input: Cow<'_, str>) -> Cow<'_, str> {
    make_valid_string(
        input,
        "empty_metric",
        |c| c.is_ascii_alphabetic(),
        |c| matches!(c, b'a'..=b'z' | b'.' | b'_' | b'0'..=b'9' | b'A'..=b'Z'),
        |_c| b'_',
    )
}

// Tags are lowercased, and invalid characters are replaced with _.
fn make_valid_tag(tag: String) -> String {
    make_valid_string(
        Cow::Owned(tag),
        "empty_tag",
        |c| c.is_ascii_lowercase(),
        |c| matches!(c, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b':' | b'.' | b'/'),
        |c| {
            if c.is_ascii_alphabetic() {
                c.to_ascii_lowercase()
            } else {
                b'_'
            }
        },
    )
    .into_owned()
}

// Returns a version of the input that only contains the allowed characters by
// replacing them with a different character. If the input does not start with
// an alpha character one will be added to the start of the string. Does not
// support unicode.
fn make_valid_string<'a>(
    input: Cow<'a, str>,
    // If input is empty, this will be returned.
    empty_value: &'a str,
    first_char_valid_fn: fn(u8) -> bool,
    char_valid_fn: fn(u8) -> bool,
    replacement: fn(u8) -> u8,
) -> Cow<'a, str> {
    let mut bytes = input.bytes();
    let first_invalid = match bytes.next() {
        None => return Cow::Borrowed(empty_value),
        Some(c) if first_char_valid_fn(c) => bytes.position(|b| !char_valid_fn(b)).map(|p| p + 1),
        Some(_) => Some(0),
    };
    let Some(idx) = first_invalid else {
        return input;
    };
    let mut dest = input.into_owned().into_bytes();
    if idx == 0 {
        let r = replacement(dest[0]);
        if r.is_ascii_alphabetic() {
            dest[0] = r;
        } else {
            // Leave idx at 0 so the loop below checks what used to be the
            // first char.
            dest.insert(0, b'Z');
        }
    } else {
        dest[idx] = replacement(dest[idx]);
    }
    for c in &mut dest[idx + 1..] {
        if !char_valid_fn(*c) {
            *c = replacement(*c);
        }
    }
    // Every non-ASCII byte was replaced with an ASCII one.
    Cow::Owned(dest.into_iter().map(char::from).collect())
}

trait Warn {
    fn warn_err(&self);
}

impl Warn for DogstatsdResult {
    fn warn_err(&self) {
        if let Err(err) = self {
            warn!(?err, "failed to send metrics to statsd agent");
        }
    }
}
