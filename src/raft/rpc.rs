use crate::config::NodeId;
use crate::error::{RaftError, Result};
use crate::raft::state::{LogEntry, RaftRole, RaftState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replication request. An empty `entries` is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
}

/// Handle RequestVote RPC
pub fn handle_request_vote(
    state: &mut RaftState,
    req: &VoteRequest,
    my_id: &str,
) -> Result<VoteResponse> {
    if req.candidate_id.is_empty() {
        return Err(RaftError::InvalidArgument(
            "candidate id must not be empty".to_string(),
        ));
    }

    // If request term is greater, update our term and become follower
    state.observe_term(req.term)?;

    let vote_granted = if req.term < state.current_term() {
        false
    } else if state
        .voted_for()
        .is_some_and(|voted| voted != req.candidate_id)
    {
        // Already voted for someone else in this term
        false
    } else {
        state.is_log_up_to_date(req.last_log_index, req.last_log_term)
    };

    if vote_granted && state.voted_for() != Some(req.candidate_id.as_str()) {
        state.store.set_voted_for(&req.candidate_id)?;
    }

    tracing::debug!(
        node_id = my_id,
        candidate = %req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    Ok(VoteResponse {
        term: state.current_term(),
        vote_granted,
    })
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut RaftState,
    req: AppendEntriesRequest,
    my_id: &str,
) -> Result<AppendEntriesResponse> {
    if req.leader_id.is_empty() {
        return Err(RaftError::InvalidArgument(
            "leader id must not be empty".to_string(),
        ));
    }

    state.observe_term(req.term)?;

    let reject = |state: &RaftState| -> Result<AppendEntriesResponse> {
        Ok(AppendEntriesResponse {
            term: state.current_term(),
            success: false,
        })
    };

    if req.term < state.current_term() {
        return reject(state);
    }

    // A current-term request can only come from the elected leader.
    if state.role == RaftRole::Candidate {
        state.become_follower();
    } else if state.role == RaftRole::Leader {
        tracing::warn!(
            node_id = my_id,
            other = %req.leader_id,
            term = req.term,
            "AppendEntries from another leader in our own term"
        );
    }
    if state.voted_for() != Some(req.leader_id.as_str()) {
        state.store.set_voted_for(&req.leader_id)?;
    }

    // Consistency check; index 0 always matches with term 0.
    if req.prev_log_index > state.last_log_index()
        || state.term_at(req.prev_log_index) != req.prev_log_term
    {
        tracing::trace!(
            node_id = my_id,
            prev_log_index = req.prev_log_index,
            prev_log_term = req.prev_log_term,
            last_log_index = state.last_log_index(),
            "AppendEntries consistency check failed"
        );
        return reject(state);
    }

    let count = req.entries.len() as u64;
    let last_new_index = req.prev_log_index + count;
    let truncated = state.merge_entries(req.prev_log_index, req.entries, req.term)?;
    if count > 0 || truncated {
        tracing::debug!(
            node_id = my_id,
            entries = count,
            truncated,
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    // Never move commit backwards on a delayed request.
    let commit = req.leader_commit.min(last_new_index);
    if commit > state.commit_index {
        state.commit_index = commit;
    }

    Ok(AppendEntriesResponse {
        term: state.current_term(),
        success: true,
    })
}
