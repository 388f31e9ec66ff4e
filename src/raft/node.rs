use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{NodeConfig, NodeId};
use crate::error::{RaftError, Result};
use crate::raft::rpc::{
    self, AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse,
};
use crate::raft::state::{majority_of_peers, Command, Cursor, LogEntry, RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;
use crate::raft::transport::Transport;
use crate::storage::LogStore;
use crate::store::StateMachine;

/// Outcome of a client submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    /// The command was applied under the term it was appended in.
    pub success: bool,
    /// Best guess at who the leader is, for redirecting the client.
    pub leader_hint: Option<NodeId>,
}

/// Point-in-time view of a node, for status endpoints and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub server_id: NodeId,
    pub current_term: u64,
    pub leader_id: Option<NodeId>,
    pub role: RaftRole,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub connected: bool,
}

/// The main Raft node that coordinates consensus
///
/// All Raft state sits behind one lock. Network calls are always made from
/// spawned tasks with the lock released; responses re-acquire it and are
/// dropped if the leader's view changed while they were in flight.
pub struct RaftNode {
    pub id: NodeId,
    pub state: RwLock<RaftState>,
    config: NodeConfig,
    peers: Vec<NodeId>,
    transport: Arc<dyn Transport>,
    state_machine: Arc<dyn StateMachine>,
    /// Set by any sign of a live leader; test-and-cleared by the election timer.
    leader_seen: AtomicBool,
    connected: AtomicBool,
    /// Bumped whenever something a waiting submitter cares about changes.
    progress_tx: watch::Sender<u64>,
}

impl RaftNode {
    pub fn new(
        config: NodeConfig,
        store: Box<dyn LogStore>,
        transport: Arc<dyn Transport>,
        state_machine: Arc<dyn StateMachine>,
    ) -> Self {
        let (progress_tx, _) = watch::channel(0);
        let peers = config.peer_ids();

        Self {
            id: config.node_id.clone(),
            state: RwLock::new(RaftState::new(store)),
            config,
            peers,
            transport,
            state_machine,
            leader_seen: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            progress_tx,
        }
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Run the election, heartbeat and commit timers until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.heartbeat_interval();
        let mut heartbeat_timer = interval(period);
        heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commit_timer = interval(period);
        commit_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let election_timer = sleep(self.next_election_timeout());
        tokio::pin!(election_timer);

        tracing::info!(
            node_id = %self.id,
            peers = self.peers.len(),
            election_timeout_ms = self.config.election_timeout_ms,
            "Raft node started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = %self.id, "Raft node stopping");
                    break;
                }
                _ = &mut election_timer => {
                    self.on_election_timeout().await;
                    election_timer
                        .as_mut()
                        .reset(Instant::now() + self.next_election_timeout());
                }
                _ = heartbeat_timer.tick() => {
                    self.broadcast_heartbeats().await;
                }
                _ = commit_timer.tick() => {
                    if let Err(e) = self.commit_tick().await {
                        tracing::error!(node_id = %self.id, error = %e, "Commit tick failed");
                    }
                }
            }
        }
    }

    fn next_election_timeout(&self) -> std::time::Duration {
        random_election_timeout(
            self.config.election_timeout(),
            std::time::Duration::from_millis(self.config.election_jitter_ms),
        )
    }

    /// Election timer firing. Starts an election unless a leader was heard
    /// from since the previous firing.
    pub async fn on_election_timeout(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        if self.leader_seen.swap(false, Ordering::SeqCst) {
            return;
        }

        let req = {
            let mut state = self.state.write().await;
            if state.role == RaftRole::Leader {
                return;
            }
            let term = match state.become_candidate(&self.id) {
                Ok(term) => term,
                Err(e) => {
                    tracing::error!(node_id = %self.id, error = %e, "Failed to persist candidacy");
                    return;
                }
            };
            VoteRequest {
                term,
                candidate_id: self.id.clone(),
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            }
        };

        tracing::info!(node_id = %self.id, term = req.term, "Election timeout, starting election");

        let needed = majority_of_peers(self.peers.len());
        if needed == 0 {
            self.try_become_leader(req.term).await;
            return;
        }

        let votes = Arc::new(AtomicUsize::new(0));
        for peer in &self.peers {
            let node = Arc::clone(self);
            let peer = peer.clone();
            let req = req.clone();
            let votes = Arc::clone(&votes);
            tokio::spawn(async move {
                node.solicit_vote(peer, req, votes, needed).await;
            });
        }
    }

    async fn solicit_vote(
        &self,
        peer: NodeId,
        req: VoteRequest,
        votes: Arc<AtomicUsize>,
        needed: usize,
    ) {
        let term = req.term;
        let resp = match self.transport.request_vote(&peer, req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::trace!(node_id = %self.id, peer = %peer, error = %e, "Vote request failed");
                return;
            }
        };

        if resp.term != term || !resp.vote_granted {
            self.observe_response_term(resp.term).await;
            return;
        }

        let granted = votes.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(node_id = %self.id, peer = %peer, term, votes = granted, "Received vote");
        if granted == needed {
            self.try_become_leader(term).await;
        }
    }

    async fn try_become_leader(&self, term: u64) {
        let mut state = self.state.write().await;
        if state.current_term() != term || state.role != RaftRole::Candidate {
            return;
        }
        state.become_leader(&self.peers);
        tracing::info!(
            node_id = %self.id,
            term,
            last_log_index = state.last_log_index(),
            "Became leader"
        );
    }

    async fn observe_response_term(&self, term: u64) {
        let mut state = self.state.write().await;
        if let Err(e) = state.observe_term(term) {
            tracing::error!(node_id = %self.id, error = %e, "Failed to persist newer term");
        }
    }

    /// Heartbeat timer firing. A leader sends every follower the entries it
    /// is missing, or an empty heartbeat when it is caught up.
    pub async fn broadcast_heartbeats(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }

        let requests: Vec<(NodeId, AppendEntriesRequest, u64)> = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return;
            }
            // A leader counts as its own live leader.
            self.leader_seen.store(true, Ordering::SeqCst);

            let last_log_index = state.last_log_index();
            self.peers
                .iter()
                .filter_map(|peer| {
                    let cursor = state.cursors.get(peer)?;
                    let prev_log_index = cursor.next_index - 1;
                    let req = AppendEntriesRequest {
                        term: state.current_term(),
                        leader_id: self.id.clone(),
                        prev_log_index,
                        prev_log_term: state.term_at(prev_log_index),
                        entries: state.get_entries_from(prev_log_index + 1),
                        leader_commit: state.commit_index,
                    };
                    Some((peer.clone(), req, last_log_index))
                })
                .collect()
        };

        for (peer, req, last_log_index) in requests {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.replicate_to(peer, req, last_log_index).await;
            });
        }
    }

    async fn replicate_to(&self, peer: NodeId, req: AppendEntriesRequest, last_log_index: u64) {
        let term = req.term;
        let prev_log_index = req.prev_log_index;
        let prev_log_term = req.prev_log_term;
        let sent = req.entries.len();

        let resp = match self.transport.append_entries(&peer, req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::trace!(node_id = %self.id, peer = %peer, error = %e, "AppendEntries failed");
                return;
            }
        };

        let mut state = self.state.write().await;
        if resp.term > term {
            if let Err(e) = state.observe_term(resp.term) {
                tracing::error!(node_id = %self.id, error = %e, "Failed to persist newer term");
            }
            return;
        }

        // Drop the response if our view moved on while it was in flight.
        if state.role != RaftRole::Leader || state.current_term() != term || resp.term != term {
            return;
        }
        let Some(cursor) = state.cursors.get(&peer).copied() else {
            return;
        };
        if cursor.next_index - 1 != prev_log_index
            || state.term_at(prev_log_index) != prev_log_term
            || state.last_log_index() < last_log_index
        {
            return;
        }

        let updated = if resp.success {
            Cursor {
                next_index: last_log_index + 1,
                match_index: cursor.match_index.max(last_log_index),
            }
        } else {
            Cursor {
                next_index: (cursor.next_index - 1).max(1),
                match_index: cursor.match_index,
            }
        };
        if updated != cursor {
            tracing::trace!(
                node_id = %self.id,
                peer = %peer,
                success = resp.success,
                sent,
                next_index = updated.next_index,
                match_index = updated.match_index,
                "Updated replication cursor"
            );
        }
        state.cursors.insert(peer, updated);
    }

    /// Commit timer firing: advance `commit_index` on a leader, then apply
    /// everything committed to the state machine.
    pub async fn commit_tick(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        let mut state = self.state.write().await;
        let before = state.commit_index;
        let commit_index = state.advance_commit_index(majority_of_peers(self.peers.len()));
        if commit_index > before {
            tracing::debug!(node_id = %self.id, commit_index, "Advanced commit index");
        }

        let mut applied = 0;
        while state.last_applied < state.commit_index {
            let index = state.last_applied + 1;
            let entry = state.get_entry(index).cloned().ok_or_else(|| {
                RaftError::Internal(format!("committed entry {} missing from log", index))
            })?;
            self.state_machine.apply(index, &entry.command).await;
            state.last_applied = index;
            applied += 1;
        }
        drop(state);

        if applied > 0 {
            tracing::trace!(node_id = %self.id, applied, "Applied committed entries");
            self.notify_progress();
        }
        Ok(())
    }

    fn notify_progress(&self) {
        self.progress_tx.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        if !self.is_connected() {
            return Err(RaftError::Disconnected);
        }

        let mut state = self.state.write().await;
        let response = rpc::handle_request_vote(&mut state, &req, &self.id)?;
        if response.vote_granted {
            self.leader_seen.store(true, Ordering::SeqCst);
        }
        Ok(response)
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if !self.is_connected() {
            return Err(RaftError::Disconnected);
        }

        let term = req.term;

        let mut state = self.state.write().await;
        let response = rpc::handle_append_entries(&mut state, req, &self.id)?;
        drop(state);

        if response.term == term {
            self.leader_seen.store(true, Ordering::SeqCst);
        }
        // Submitters waiting on an overwritten entry must re-check its term.
        if response.success {
            self.notify_progress();
        }
        Ok(response)
    }

    /// Replicate `command` and wait until it is applied.
    ///
    /// A node that is not leader answers at once with a redirect hint. A
    /// command already present in the log is not appended again; the caller
    /// waits on the existing entry instead. The wait ends in success when
    /// the entry is applied with its original term, and in failure as soon
    /// as that index holds a different term.
    pub async fn submit(&self, command: Command) -> Result<SubmitResponse> {
        // Subscribe before looking at the log so no wakeup can be missed.
        let mut progress = self.progress_tx.subscribe();

        let (index, term) = {
            let mut state = self.state.write().await;
            if state.role != RaftRole::Leader {
                return Ok(SubmitResponse {
                    success: false,
                    leader_hint: self.leader_hint(&state),
                });
            }
            match state.find_command(&command) {
                Some(existing) => {
                    tracing::debug!(
                        node_id = %self.id,
                        index = existing.0,
                        client_id = %command.client_id,
                        sequence = command.sequence,
                        "Command already in log, waiting on existing entry"
                    );
                    existing
                }
                None => {
                    let (index, term) = state.append_command(command)?;
                    tracing::debug!(node_id = %self.id, index, term, "Appended command to log");
                    (index, term)
                }
            }
        };

        loop {
            {
                let state = self.state.read().await;
                if state.term_at(index) != term {
                    tracing::debug!(node_id = %self.id, index, term, "Submitted entry was superseded");
                    return Ok(SubmitResponse {
                        success: false,
                        leader_hint: self.leader_hint(&state),
                    });
                }
                if state.last_applied >= index {
                    return Ok(SubmitResponse {
                        success: true,
                        leader_hint: self.leader_hint(&state),
                    });
                }
            }
            if progress.changed().await.is_err() {
                return Err(RaftError::Internal("progress channel closed".to_string()));
            }
        }
    }

    /// The recorded vote is the best guess at the leader; with no vote, any
    /// peer is as good as another. A node that is not leading never names
    /// itself, which a candidate's self-vote would otherwise do.
    fn leader_hint(&self, state: &RaftState) -> Option<NodeId> {
        state
            .leader_hint()
            .filter(|hint| *hint != self.id || state.role == RaftRole::Leader)
            .or_else(|| self.peers.choose(&mut rand::thread_rng()).cloned())
    }

    /// Re-join the cluster. The next election firing is skipped so the
    /// node gives an existing leader a full period to reach it.
    pub fn connect(&self) {
        self.leader_seen.store(true, Ordering::SeqCst);
        if !self.connected.swap(true, Ordering::SeqCst) {
            tracing::info!(node_id = %self.id, "Node connected");
        }
    }

    /// Stop taking part in the cluster: inbound RPCs fail and timers idle.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::info!(node_id = %self.id, "Node disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn server_id(&self) -> &str {
        &self.id
    }

    pub async fn current_term(&self) -> u64 {
        self.state.read().await.current_term()
    }

    /// Last known leader, which is this node's vote in the current term.
    pub async fn leader_id(&self) -> Option<NodeId> {
        self.state.read().await.leader_hint()
    }

    pub async fn log(&self) -> Vec<LogEntry> {
        self.state.read().await.get_entries_from(1)
    }

    pub async fn role(&self) -> RaftRole {
        self.state.read().await.role
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == RaftRole::Leader
    }

    pub async fn commit_index(&self) -> u64 {
        self.state.read().await.commit_index
    }

    pub async fn last_applied(&self) -> u64 {
        self.state.read().await.last_applied
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.state.read().await;
        NodeStatus {
            server_id: self.id.clone(),
            current_term: state.current_term(),
            leader_id: state.leader_hint(),
            role: state.role,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: state.last_log_index(),
            connected: self.is_connected(),
        }
    }
}
