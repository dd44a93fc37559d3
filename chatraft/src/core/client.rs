use std::sync::Arc;

use anyhow::anyhow;

use crate::core::LeaderState;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::replication::RaftEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// A wrapper around a ClientRequest which has been transformed into an Entry, along with its response channel.
pub(super) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The Arc'd entry of the ClientRequest.
    ///
    /// This value is Arc'd so that it may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entry: Arc<Entry<D>>,
    /// The response channel for the request.
    pub tx: ClientWriteResponseTx<D, R>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Handle client write requests.
    #[tracing::instrument(level = "debug", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(&mut self, rpc: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) {
        let entry = match self.append_command_to_log(rpc.command).await {
            Ok(entry) => ClientRequestEntry {
                entry: Arc::new(entry),
                tx,
            },
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Transform the given command into an entry, assign an index and term, and append the entry to the log.
    #[tracing::instrument(level = "debug", skip(self, command))]
    async fn append_command_to_log(&mut self, command: D) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.last_log_id.index + 1,
                term: self.core.current_term,
            },
            command,
        };
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = entry.log_id;

        self.core.report_metrics();
        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely begins the process. Once the request is committed to the cluster, its response will
    /// be generated asynchronously.
    #[tracing::instrument(level = "debug", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry<D, R>) {
        let entry_arc = req.entry.clone();

        if self.nodes.is_empty() {
            // There are no voting peers, so the entry is committed the
            // moment it hits our own log.
            self.core.commit_index = entry_arc.log_id.index;
            if let Err(err) = self.core.storage.save_commit_index(self.core.commit_index).await {
                let err = self.core.map_fatal_storage_error(err);
                let _ = req.tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
            self.core.report_metrics();
            self.client_request_post_commit(req).await;
            return;
        }

        self.awaiting_committed.push(req);
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send(RaftEvent::Replicate {
                entry: entry_arc.clone(),
                commit_index: self.core.commit_index,
            });
        }
    }

    /// Handle the post-commit logic for a client request.
    #[tracing::instrument(level = "debug", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry<D, R>) {
        match self.apply_entry_to_state_machine(&req.entry).await {
            Ok(data) => {
                let _ = req.tx.send(Ok(ClientWriteResponse {
                    index: req.entry.log_id.index,
                    data,
                }));
            }
            Err(err) => {
                let _ = req.tx.send(Err(ClientWriteError::RaftError(err)));
            }
        }
    }

    /// Apply the given log entry to the state machine, returning its response data.
    ///
    /// Strict index order is preserved: any in-flight background application
    /// task is awaited first, then entries between `last_applied` and this
    /// entry are applied, then the entry itself.
    #[tracing::instrument(level = "debug", skip(self, entry))]
    async fn apply_entry_to_state_machine(&mut self, entry: &Entry<D>) -> RaftResult<R> {
        self.core.flush_replicate_to_sm().await?;

        let index = entry.log_id.index;
        let expected_next_index = self.core.last_applied + 1;
        if index > expected_next_index {
            // Outstanding committed entries from before this leader's term.
            let entries = self
                .core
                .storage
                .get_log_entries(expected_next_index..=index - 1)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;
            if !entries.is_empty() {
                let refs: Vec<_> = entries.iter().collect();
                self.core
                    .storage
                    .apply_to_state_machine(&refs)
                    .await
                    .map_err(|err| self.core.map_fatal_storage_error(err))?;
                if let Some(last) = entries.last() {
                    self.core.last_applied = last.log_id.index;
                }
            }
        }

        let res = self
            .core
            .storage
            .apply_to_state_machine(&[entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_applied = index;
        self.core.report_metrics();

        res.into_iter()
            .next()
            .ok_or_else(|| RaftError::RaftStorage(anyhow!("state machine returned no response for applied entry")))
    }
}
