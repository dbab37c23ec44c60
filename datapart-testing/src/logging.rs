//! Per-test log capture.
//!
//! Tests run in parallel threads of one process, so a global `tracing` subscriber would
//! interleave the log output of every test.  Instead each test gets its own dispatcher and its own
//! tokio runtime whose worker threads all use that dispatcher, and the captured events are
//! printed in one piece when the test ends.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Used when `RUST_LOG` isn't set.  The HTTP stack is very chatty at `debug`.
const DEFAULT_FILTER: &str = "h2=warn,hyper=info,hyper_util=info,reqwest=info,tower=info,axum=info,debug";

/// How long to let spawned upload tasks wind down once the test future completes
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffers every formatted log event of one test
#[derive(Clone, Default)]
struct CapturedLog {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLog {
    /// Empty the buffer, returning what it held.  Invalid UTF-8 is replaced rather than lost.
    fn drain(&self) -> String {
        let bytes = std::mem::take(&mut *self.buffer.lock().unwrap());

        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for &CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLog {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn test_dispatch(log: CapturedLog) -> tracing::Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true)
        // Filters are written in terms of targets, so show them
        .with_target(true)
        // Upload jobs hop between worker threads; the IDs make that visible
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(log);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .unwrap();

    tracing::Dispatch::new(tracing_subscriber::registry().with(filter).with(format))
}

std::thread_local! {
    static WORKER_DISPATCH_GUARD: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
}

/// A multi-threaded runtime whose worker threads all log to `dispatch`
fn runtime_logging_to(dispatch: Arc<tracing::Dispatch>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    builder
        .enable_all()
        .on_thread_start(move || {
            let guard = tracing::dispatcher::set_default(&dispatch);
            WORKER_DISPATCH_GUARD.with(|cell| cell.replace(Some(guard)));
        })
        .on_thread_stop(|| {
            WORKER_DISPATCH_GUARD.with(|cell| cell.replace(None));
        });

    Ok(builder.build()?)
}

/// Run `test` on a dedicated runtime with its log events captured.
///
/// Use this in place of `#[tokio::test]`.  The captured events are printed when the test
/// finishes, whether it returned an error or panicked, so a failing test shows only its own log.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let log = CapturedLog::default();
    let dispatch = Arc::new(test_dispatch(log.clone()));

    tracing::dispatcher::with_default(&dispatch, || {
        let runtime = runtime_logging_to(dispatch.clone())?;

        // Neither the runtime nor arbitrary test futures are declared unwind safe, but nothing
        // observes them after a panic except to print the log
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
            result
        }));

        println!("Log events from this test: \n{}", log.drain());

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
