use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Installs a JSON-lines subscriber that also forwards events to Sentry.
///
/// Every event is flattened into one object per line, with the current span attached, so the
/// `key` and `queue` fields recorded by the engine end up as top-level, searchable fields.
/// Fails if a global subscriber was already installed.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W) -> Result<(), TryInitError>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .try_init()
}
