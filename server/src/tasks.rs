//! Background task supervision.
//!
//! The hub, ingest and broker loops run for the life of the process. None
//! of them is expected to return, so the first one that does (or panics)
//! is reported and the server shuts down instead of serving a relay that
//! silently stopped relaying.

use futures::future::select_all;
use tokio::task::JoinHandle;
use tracing::error;

/// A spawned loop plus the name it is logged under.
pub struct Supervised {
    pub name: &'static str,
    pub handle: JoinHandle<()>,
}

impl Supervised {
    pub fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }
}

/// Wait until any task ends and return its name. The others keep running.
/// With no tasks this never resolves.
pub async fn first_exit(tasks: Vec<Supervised>) -> &'static str {
    if tasks.is_empty() {
        return std::future::pending().await;
    }

    let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().map(|t| (t.name, t.handle)).unzip();
    let (result, index, _rest) = select_all(handles).await;
    let name = names[index];
    match result {
        Ok(()) => error!(task = name, "background task exited"),
        Err(e) if e.is_panic() => error!(task = name, "background task panicked: {e}"),
        Err(e) => error!(task = name, "background task cancelled: {e}"),
    }
    name
}
