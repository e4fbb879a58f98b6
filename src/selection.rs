//! Fire-and-forget feed of payee/category selections for the suggestion
//! engine. Runs on its own thread and connection, after the ledger has
//! committed, so a failure here never touches balances.

use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use crate::config::StorageConfig;
use crate::db::Database;
use crate::models::Selection;

pub(crate) struct SelectionRecorder {
    sender: Option<Sender<Selection>>,
    worker: Option<JoinHandle<usize>>,
}

impl SelectionRecorder {
    pub(crate) fn spawn(db_path: PathBuf, storage: StorageConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<Selection>();
        let worker = std::thread::spawn(move || {
            let db = match Database::open(&db_path, &storage) {
                Ok(db) => db,
                Err(e) => {
                    log::warn!("selection recorder disabled: {e:#}");
                    return 0;
                }
            };
            let mut recorded = 0;
            for selection in receiver {
                match db.insert_selection(&selection) {
                    Ok(_) => recorded += 1,
                    Err(e) => log::warn!(
                        "dropped selection for transaction {}: {e:#}",
                        selection.transaction_id
                    ),
                }
            }
            recorded
        });
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    pub(crate) fn record(&self, selection: Selection) {
        if let Some(sender) = &self.sender {
            if sender.send(selection).is_err() {
                log::warn!("selection recorder has stopped");
            }
        }
    }

    /// Flush pending selections and return how many were stored.
    pub(crate) fn finish(mut self) -> usize {
        self.sender.take();
        self.worker
            .take()
            .and_then(|worker| worker.join().ok())
            .unwrap_or(0)
    }
}

impl Drop for SelectionRecorder {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
