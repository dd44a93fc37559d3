use crate::core::RaftCore;
use crate::core::State;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(level = "debug", skip(self, msg), fields(rpc=%msg.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: 0,
            });
        }

        // Any valid AppendEntries from the current-or-higher-term leader is
        // authoritative contact: re-arm the election timer.
        self.update_next_election_timeout(true);

        // Update current term if needed, and revert to follower if this node
        // was campaigning or leading under an older view of the cluster.
        let mut report_metrics = false;
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
            report_metrics = true;
        }

        // The sender of a valid AppendEntries is the leader of its term.
        if self.current_leader != Some(msg.leader_id) {
            self.current_leader = Some(msg.leader_id);
            report_metrics = true;
        }

        // The consistency check: the entry preceding the new entries must
        // exist here with a matching term. `prev_log_id.index == 0` is the
        // start of the log and passes unconditionally.
        if msg.prev_log_id.index > 0 {
            let prev = self
                .storage
                .try_get_log_entry(msg.prev_log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            let matches = prev.map(|entry| entry.log_id.term == msg.prev_log_id.term).unwrap_or(false);
            if !matches {
                tracing::debug!(prev_log_id=%msg.prev_log_id, "consistency check failed");
                if report_metrics {
                    self.report_metrics();
                }
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    match_index: 0,
                });
            }
        }

        if !msg.entries.is_empty() {
            self.append_log_entries(&msg.entries).await?;
        }

        // Update commit index from the leader's view, bounded by what is
        // actually in our log, persisting it before the success reply.
        if msg.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(msg.leader_commit, self.last_log_id.index);
            self.storage
                .save_commit_index(self.commit_index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.replicate_to_sm();
            report_metrics = true;
        }

        if report_metrics {
            self.report_metrics();
        }
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: self.last_log_id.index,
        })
    }

    /// Store leader-dictated entries, truncating our divergent tail first if needed.
    ///
    /// Entries already present with a matching term are left untouched, so
    /// receiving the same payload twice is a no-op. At the first index
    /// holding an entry from a different term, everything from that index
    /// onward is deleted and replaced with the leader's entries.
    #[tracing::instrument(level = "debug", skip(self, entries))]
    async fn append_log_entries(&mut self, entries: &[Entry<D>]) -> RaftResult<()> {
        let mut write_from = None;
        for (offset, entry) in entries.iter().enumerate() {
            let existing = self
                .storage
                .try_get_log_entry(entry.log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            match existing {
                Some(local) if local.log_id.term == entry.log_id.term => continue,
                Some(_) => {
                    tracing::info!(index = entry.log_id.index, "found conflicting entry, truncating local log");
                    self.storage
                        .delete_logs_from(entry.log_id.index)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    write_from = Some(offset);
                    break;
                }
                None => {
                    write_from = Some(offset);
                    break;
                }
            }
        }

        if let Some(offset) = write_from {
            let to_write: Vec<_> = entries[offset..].iter().collect();
            self.storage.overwrite_log(&to_write).await.map_err(|err| self.map_fatal_storage_error(err))?;
        }

        self.last_log_id = self.storage.get_last_log_id().await.map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(())
    }
}
