//! Logging setup and configuration
//!
//! No global subscriber is installed. `main` builds one [`LogContext`] and
//! passes it down: futures run inside it via [`LogContext::instrument`], and
//! work that hops onto another task or thread goes through [`spawn`],
//! [`spawn_blocking`] or [`spawn_thread`], which carry the caller's
//! dispatcher across.

use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::Dispatch;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable single-line output
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// An explicitly constructed logging context
#[derive(Clone)]
pub struct LogContext {
    dispatch: Dispatch,
    filter: String,
}

impl std::fmt::Debug for LogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogContext")
            .field("filter", &self.filter)
            .finish()
    }
}

impl LogContext {
    /// Build a context for the application
    ///
    /// `RUST_LOG` wins over `default_level` when it is set and valid. Output
    /// goes to stderr so stdout stays clean for listings.
    pub fn new(default_level: &str, format: LogFormat) -> crate::Result<Self> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_level))
            .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;
        let description = filter.to_string();

        let json = format == LogFormat::Json;
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
            .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)));

        Ok(Self {
            dispatch: Dispatch::new(subscriber),
            filter: description,
        })
    }

    /// Wrap an existing dispatcher (tests, embedding)
    pub fn from_dispatch(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            filter: String::from("custom"),
        }
    }

    /// The effective filter directive
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Run a closure with this context as the current dispatcher
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Run a future with this context as the current dispatcher
    pub fn instrument<F: Future>(&self, future: F) -> WithDispatch<F> {
        future.with_subscriber(self.dispatch.clone())
    }
}

/// `tokio::spawn` that keeps the caller's dispatcher
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future.with_current_subscriber())
}

/// `tokio::task::spawn_blocking` that keeps the caller's dispatcher
pub fn spawn_blocking<F, R>(f: F) -> tokio::task::JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    tokio::task::spawn_blocking(move || tracing::dispatcher::with_default(&dispatch, f))
}

/// Named OS thread that keeps the caller's dispatcher
pub fn spawn_thread<F, T>(name: &str, f: F) -> std::io::Result<std::thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountEvents(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CountEvents {
        fn on_event(
            &self,
            _event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_context() -> (LogContext, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let dispatch =
            Dispatch::new(tracing_subscriber::registry().with(CountEvents(count.clone())));
        (LogContext::from_dispatch(dispatch), count)
    }

    #[test]
    fn test_new_context_builds() {
        assert!(LogContext::new("info", LogFormat::Text).is_ok());
        assert!(LogContext::new("debug", LogFormat::Json).is_ok());
    }

    #[test]
    fn test_events_outside_scope_are_not_captured() {
        let (ctx, count) = counting_context();
        tracing::info!("nobody listening");
        ctx.in_scope(|| tracing::info!("captured"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_thread_carries_dispatch() {
        let (ctx, count) = counting_context();
        ctx.in_scope(|| {
            spawn_thread("log-test", || tracing::warn!("from thread"))
                .unwrap()
                .join()
                .unwrap();
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawned_work_carries_dispatch() {
        let (ctx, count) = counting_context();
        ctx.instrument(async {
            spawn(async { tracing::info!("from task") }).await.unwrap();
            spawn_blocking(|| tracing::info!("from blocking")).await.unwrap();
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_log_format_serde() {
        use serde::de::IntoDeserializer;
        use serde::de::value::{Error as ValueError, StrDeserializer};

        let de: StrDeserializer<'_, ValueError> = "json".into_deserializer();
        assert_eq!(LogFormat::deserialize(de).unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }
}
