// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Job History Writer
//!
//! Single background task that owns all writes to the [`JobHistoryStore`].
//! Terminal jobs are queued from the completion path, which never waits on
//! storage; a failed write is logged and the writer keeps going.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::history::{HistoryError, JobHistoryStore, JobRecord};

enum HistoryCommand {
    Append(JobRecord),
    Flush(oneshot::Sender<()>),
    Close,
}

/// Cloneable handle used to feed the writer task
#[derive(Clone)]
pub struct HistorySender {
    tx: mpsc::UnboundedSender<HistoryCommand>,
}

impl HistorySender {
    pub fn submit(&self, record: JobRecord) -> Result<(), HistoryError> {
        self.tx
            .send(HistoryCommand::Append(record))
            .map_err(|_| HistoryError::WriterClosed)
    }

    /// Resolve once every record submitted before this call is stored.
    pub async fn flush(&self) -> Result<(), HistoryError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(HistoryCommand::Flush(done_tx))
            .map_err(|_| HistoryError::WriterClosed)?;
        done_rx.await.map_err(|_| HistoryError::WriterClosed)
    }

    /// Ask the writer to drain its queue and stop.
    pub fn close(&self) {
        let _ = self.tx.send(HistoryCommand::Close);
    }
}

pub struct HistoryWriter {
    store: Arc<dyn JobHistoryStore>,
    rx: mpsc::UnboundedReceiver<HistoryCommand>,
}

impl HistoryWriter {
    pub fn new(store: Arc<dyn JobHistoryStore>) -> (Self, HistorySender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { store, rx }, HistorySender { tx })
    }

    /// Spawn the writer loop on `runtime`.
    ///
    /// The loop ends on [`HistorySender::close`] or once every sender is
    /// dropped.
    pub fn start(self, runtime: &tokio::runtime::Handle) -> JoinHandle<()> {
        debug!("Starting job history writer task");
        let Self { store, mut rx } = self;

        runtime.spawn(async move {
            let mut records_written = 0u64;
            let mut errors_encountered = 0u64;

            while let Some(command) = rx.recv().await {
                match command {
                    HistoryCommand::Append(record) => {
                        let job_id = record.job_id;
                        match store.append(record).await {
                            Ok(()) => records_written += 1,
                            Err(e) => {
                                errors_encountered += 1;
                                error!(job_id = %job_id, error = %e, "Failed to write job history record");
                                if errors_encountered % 10 == 0 {
                                    warn!(
                                        "Job history writes have failed {} times",
                                        errors_encountered
                                    );
                                }
                            }
                        }
                    }
                    HistoryCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                    HistoryCommand::Close => break,
                }
            }

            info!(
                "Job history writer stopped ({} records written, {} errors)",
                records_written, errors_encountered
            );
        })
    }
}
