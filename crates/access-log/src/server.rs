use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use staged_shutdown::Coordinator;
use tracing::{debug, warn};

/// Append-only request log shared by all handlers.
#[derive(Clone)]
pub struct AccessLog {
    file: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl AccessLog {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(Some(BufWriter::new(file)))),
        })
    }

    pub fn append(&self, line: &str) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = file.as_mut() else {
            return Err(io::Error::other("access log is closed"));
        };
        writeln!(writer, "{line}")?;
        writer.flush()
    }

    /// Flush and close. Later appends fail.
    pub fn close(&self) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match file.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub log: AccessLog,
}

pub fn router(state: AppState) -> Router {
    Router::new().fallback(record).with_state(state)
}

async fn record(State(state): State<AppState>, uri: Uri) -> StatusCode {
    // While the guard is held the log cannot be closed.
    let Some(guard) = state.coordinator.lock() else {
        debug!(%uri, "rejecting request during shutdown");
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    let written = state.log.append(&uri.to_string());
    guard.unlock();

    match written {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            warn!(error = %err, %uri, "failed to write access log");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
