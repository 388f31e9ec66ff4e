//! Conversions between wire messages and the core Raft types.
//!
//! Terms and indices are signed on the wire. Anything negative is rejected
//! here, before it can reach the state machine.

use tonic::Status;

use crate::proto;
use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::state::{Action, Command, LogEntry};

fn non_negative(field: &str, value: i64) -> Result<u64, Status> {
    u64::try_from(value)
        .map_err(|_| Status::invalid_argument(format!("{} must not be negative, got {}", field, value)))
}

/// Saturates instead of wrapping for values past `i64::MAX`.
pub(crate) fn wire(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub fn command_from_proto(cmd: proto::Command) -> Result<Command, Status> {
    let action = match cmd.action {
        Some(proto::command::Action::Put(put)) => {
            if put.key.is_empty() {
                return Err(Status::invalid_argument("put key must not be empty"));
            }
            Action::Put {
                key: put.key,
                value: put.value,
            }
        }
        Some(proto::command::Action::Delete(delete)) => {
            if delete.key.is_empty() {
                return Err(Status::invalid_argument("delete key must not be empty"));
            }
            Action::Delete { key: delete.key }
        }
        None => return Err(Status::invalid_argument("command has no action")),
    };
    Ok(Command {
        client_id: cmd.client_id,
        sequence: cmd.sequence,
        action,
    })
}

pub fn command_to_proto(cmd: &Command) -> proto::Command {
    let action = match &cmd.action {
        Action::Put { key, value } => proto::command::Action::Put(proto::PutAction {
            key: key.clone(),
            value: value.clone(),
        }),
        Action::Delete { key } => {
            proto::command::Action::Delete(proto::DeleteAction { key: key.clone() })
        }
    };
    proto::Command {
        client_id: cmd.client_id.clone(),
        sequence: cmd.sequence,
        action: Some(action),
    }
}

pub fn log_entry_from_proto(entry: proto::LogEntry) -> Result<LogEntry, Status> {
    let command = entry
        .command
        .ok_or_else(|| Status::invalid_argument("log entry has no command"))?;
    Ok(LogEntry {
        term: non_negative("entry term", entry.term)?,
        command: command_from_proto(command)?,
    })
}

pub fn log_entry_to_proto(entry: &LogEntry) -> proto::LogEntry {
    proto::LogEntry {
        term: wire(entry.term),
        command: Some(command_to_proto(&entry.command)),
    }
}

pub fn vote_request_from_proto(req: proto::VoteRequest) -> Result<VoteRequest, Status> {
    Ok(VoteRequest {
        term: non_negative("term", req.term)?,
        candidate_id: req.candidate_id,
        last_log_index: non_negative("last_log_index", req.last_log_index)?,
        last_log_term: non_negative("last_log_term", req.last_log_term)?,
    })
}

pub fn vote_request_to_proto(req: VoteRequest) -> proto::VoteRequest {
    proto::VoteRequest {
        term: wire(req.term),
        candidate_id: req.candidate_id,
        last_log_index: wire(req.last_log_index),
        last_log_term: wire(req.last_log_term),
    }
}

pub fn vote_response_from_proto(resp: proto::VoteResponse) -> Result<VoteResponse, Status> {
    Ok(VoteResponse {
        term: non_negative("term", resp.term)?,
        vote_granted: resp.vote_granted,
    })
}

pub fn vote_response_to_proto(resp: VoteResponse) -> proto::VoteResponse {
    proto::VoteResponse {
        term: wire(resp.term),
        vote_granted: resp.vote_granted,
    }
}

pub fn append_request_from_proto(
    req: proto::AppendEntriesRequest,
) -> Result<AppendEntriesRequest, Status> {
    Ok(AppendEntriesRequest {
        term: non_negative("term", req.term)?,
        leader_id: req.leader_id,
        prev_log_index: non_negative("prev_log_index", req.prev_log_index)?,
        prev_log_term: non_negative("prev_log_term", req.prev_log_term)?,
        entries: req
            .entries
            .into_iter()
            .map(log_entry_from_proto)
            .collect::<Result<_, _>>()?,
        leader_commit: non_negative("leader_commit", req.leader_commit)?,
    })
}

pub fn append_request_to_proto(req: AppendEntriesRequest) -> proto::AppendEntriesRequest {
    proto::AppendEntriesRequest {
        term: wire(req.term),
        leader_id: req.leader_id,
        prev_log_index: wire(req.prev_log_index),
        prev_log_term: wire(req.prev_log_term),
        entries: req.entries.iter().map(log_entry_to_proto).collect(),
        leader_commit: wire(req.leader_commit),
    }
}

pub fn append_response_from_proto(
    resp: proto::AppendEntriesResponse,
) -> Result<AppendEntriesResponse, Status> {
    Ok(AppendEntriesResponse {
        term: non_negative("term", resp.term)?,
        success: resp.success,
    })
}

pub fn append_response_to_proto(resp: AppendEntriesResponse) -> proto::AppendEntriesResponse {
    proto::AppendEntriesResponse {
        term: wire(resp.term),
        success: resp.success,
    }
}
