use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::NodeId;
use crate::storage::{LogStore, StorageError};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Mutation applied to the command store once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Put { key: String, value: String },
    Delete { key: String },
}

/// A client operation replicated through the log.
///
/// `(client_id, sequence)` identifies one client request, so a retransmission
/// compares equal to the entry already logged for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub client_id: String,
    pub sequence: u64,
    pub action: Action,
}

impl Command {
    pub fn new(client_id: impl Into<String>, sequence: u64, action: Action) -> Self {
        Self {
            client_id: client_id.into(),
            sequence,
            action,
        }
    }
}

/// A single entry in the Raft log. Its index is its 1-based position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: Command,
}

/// Per-follower replication cursor, only meaningful on a leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub next_index: u64,
    pub match_index: u64,
}

/// Everything guarded by the node's single lock.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term:
/// - Each node votes for at most one candidate per term (`voted_for`)
/// - Candidate must receive votes from a majority, itself included
///
/// ## Log Matching
/// If two logs contain an entry with the same index and term, the logs are
/// identical up to that index:
/// - `AppendEntries` consistency check on (prev_log_index, prev_log_term)
/// - A conflicting suffix is replaced by the leader's entries
///
/// ## Leader Completeness
/// A committed entry is present in the log of every later leader:
/// - Vote restriction: candidates must have up-to-date logs (`is_log_up_to_date`)
/// - Leaders only advance `commit_index` onto entries of their own term
///
/// ## State Machine Safety
/// - `last_applied <= commit_index <= last_log_index` at all times
/// - Entries are applied in index order, each exactly once
pub struct RaftState {
    /// Persistent state: term, vote and log.
    pub store: Box<dyn LogStore>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub cursors: HashMap<NodeId, Cursor>,

    pub role: RaftRole,
}

impl RaftState {
    pub fn new(store: Box<dyn LogStore>) -> Self {
        Self {
            store,
            commit_index: 0,
            last_applied: 0,
            cursors: HashMap::new(),
            role: RaftRole::Follower,
        }
    }

    pub fn current_term(&self) -> u64 {
        self.store.current_term()
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.store.voted_for()
    }

    pub fn last_log_index(&self) -> u64 {
        self.store.last_log_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.store.last_log_term()
    }

    pub fn term_at(&self, index: u64) -> u64 {
        self.store.term_at(index)
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.store.entry_at(index)
    }

    pub fn get_entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        self.store.entries_from(start_index)
    }

    /// Adopt `term` if it is newer than ours, clearing the vote and stepping
    /// down. Never lowers the term and never promotes.
    ///
    /// Returns whether the term changed.
    pub fn observe_term(&mut self, term: u64) -> Result<bool, StorageError> {
        if term <= self.current_term() {
            return Ok(false);
        }
        self.store.set_term_and_vote(term, None)?;
        if self.role != RaftRole::Follower {
            tracing::info!(term, role = %self.role, "Stepping down, newer term observed");
        }
        self.become_follower();
        Ok(true)
    }

    /// Transition to follower state
    pub fn become_follower(&mut self) {
        self.role = RaftRole::Follower;
        self.cursors.clear();
    }

    /// Transition to candidate state: new term, vote for self.
    pub fn become_candidate(&mut self, my_id: &str) -> Result<u64, StorageError> {
        let term = self.current_term() + 1;
        self.store.set_term_and_vote(term, Some(my_id))?;
        self.role = RaftRole::Candidate;
        self.cursors.clear();
        Ok(term)
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, peer_ids: &[NodeId]) {
        self.role = RaftRole::Leader;

        // Initialize a cursor for every peer
        let next_index = self.last_log_index() + 1;
        self.cursors = peer_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    Cursor {
                        next_index,
                        match_index: 0,
                    },
                )
            })
            .collect();
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Position of an already logged copy of `command`, with its term.
    pub fn find_command(&self, command: &Command) -> Option<(u64, u64)> {
        self.store
            .log()
            .iter()
            .position(|e| &e.command == command)
            .map(|pos| {
                let index = pos as u64 + 1;
                (index, self.term_at(index))
            })
    }

    /// Append a new entry under the current term
    pub fn append_command(&mut self, command: Command) -> Result<(u64, u64), StorageError> {
        let term = self.current_term();
        self.store.append_entry(LogEntry { term, command })?;
        Ok((self.last_log_index(), term))
    }

    /// Merge a leader's `entries`, which start right after `prev_log_index`.
    ///
    /// The first entry whose term disagrees with ours marks a conflict: our
    /// entry there and everything after it are deleted and the leader's
    /// entries take their place. Entries that already match are kept.
    ///
    /// Whatever lies past the leader's entries is kept only if it starts
    /// with an entry of `leader_term`: such a tail came from this same
    /// leader through a request that overtook this one. An older-term tail
    /// is absent from the leader's log and is deleted.
    ///
    /// The caller caps the follower's commit index at `prev_log_index +
    /// entries.len()`, not at the new last index, since a kept tail is not
    /// yet known to match the leader.
    ///
    /// Returns whether anything was deleted.
    pub fn merge_entries(
        &mut self,
        prev_log_index: u64,
        entries: Vec<LogEntry>,
        leader_term: u64,
    ) -> Result<bool, StorageError> {
        let end = prev_log_index + entries.len() as u64;
        let mut truncated = false;
        for (offset, entry) in entries.into_iter().enumerate() {
            let index = prev_log_index + 1 + offset as u64;
            if index <= self.last_log_index() {
                if self.term_at(index) == entry.term {
                    continue;
                }
                self.store.delete_from(index)?;
                truncated = true;
            }
            self.store.append_entry(entry)?;
        }

        if self.last_log_index() > end && self.term_at(end + 1) != leader_term {
            self.store.delete_from(end + 1)?;
            truncated = true;
        }
        Ok(truncated)
    }

    /// Advance `commit_index` as far as the leader's quorum rule allows.
    ///
    /// An index needs `majority_peers` followers with `match_index` at or
    /// beyond it. Entries from earlier terms are never committed on their
    /// own; they become committed once an entry of the current term after
    /// them is.
    pub fn advance_commit_index(&mut self, majority_peers: usize) -> u64 {
        if self.role != RaftRole::Leader {
            return self.commit_index;
        }

        let current_term = self.current_term();
        let mut candidate = self.commit_index;
        while candidate < self.last_log_index() {
            candidate += 1;
            let matched = self
                .cursors
                .values()
                .filter(|c| c.match_index >= candidate)
                .count();
            if matched < majority_peers {
                break;
            }
            if self.term_at(candidate) == current_term {
                self.commit_index = candidate;
            }
        }
        self.commit_index
    }

    /// Leader id as far as this node knows: the vote of the current term.
    pub fn leader_hint(&self) -> Option<NodeId> {
        self.voted_for().map(str::to_owned)
    }
}

impl fmt::Debug for RaftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftState")
            .field("current_term", &self.current_term())
            .field("voted_for", &self.voted_for())
            .field("last_log_index", &self.last_log_index())
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .field("role", &self.role)
            .finish()
    }
}

/// Votes (or matches) needed from peers, on top of the node itself, to form
/// a majority of `peer_count + 1` nodes.
pub fn majority_of_peers(peer_count: usize) -> usize {
    (peer_count + 1) / 2
}
