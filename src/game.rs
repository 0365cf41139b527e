use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{
    ANSWER_TIME, DEFAULT_EXTEND_SECONDS, LAST_LASH_ANSWER_TIME, LAST_LASH_RESULTS_HOLD,
    LAST_LASH_VOTE_TIME, MATCHUP_RESULT_HOLD, MAX_ANSWER_LENGTH, MAX_NAME_LENGTH, MAX_PLAYERS,
    MAX_THEME_LENGTH, MIN_PLAYERS, NO_ANSWER, PROMPTS_PER_PLAYER, REAPER_INTERVAL, ROOM_CODE_LENGTH,
    ROOM_MAX_AGE, ROUNDS_PER_GAME, ROUND_SCORES_HOLD, SKIPPED, VOTE_GRACE, VOTE_TIME,
};
use crate::pairing;
use crate::prompts::PromptSource;
use crate::scoring;
use crate::timer::{RoomTimer, TimerKind};
use crate::types::*;

/// Commands the WebSocket handler sends to a room task.
#[derive(Debug, Clone)]
pub enum RoomCommand {
    Join {
        conn_id: ConnId,
        player_name: String,
    },
    Rejoin {
        conn_id: ConnId,
        player_id: PlayerId,
    },
    RejoinHost {
        conn_id: ConnId,
        host_id: HostId,
    },
    StartGame {
        conn_id: ConnId,
        theme: Option<String>,
    },
    SubmitAnswer {
        conn_id: ConnId,
        prompt_id: Option<PromptId>,
        answer: String,
        is_last_lash: bool,
    },
    SubmitVote {
        conn_id: ConnId,
        prompt_id: PromptId,
        vote: u8,
    },
    SubmitFinaleVote {
        conn_id: ConnId,
        voted_for: PlayerId,
    },
    SkipPlayer {
        conn_id: ConnId,
        player_id: PlayerId,
    },
    KickPlayer {
        conn_id: ConnId,
        player_id: PlayerId,
    },
    PauseGame {
        conn_id: ConnId,
    },
    ResumeGame {
        conn_id: ConnId,
    },
    ExtendTime {
        conn_id: ConnId,
        seconds: Option<u64>,
    },
    EndGame {
        conn_id: ConnId,
    },
    ContinueLastWit {
        conn_id: ConnId,
    },
    PlayerDisconnected {
        conn_id: ConnId,
    },
    HostDisconnected {
        conn_id: ConnId,
    },
    /// A countdown armed under this epoch ran out.
    TimerExpired {
        epoch: u64,
    },
    /// A presentation hold armed under this epoch elapsed.
    Advance {
        epoch: u64,
    },
    /// The reaper decided this room is too old.
    Expire,
}

/// Events broadcast from the room to WebSocket connections.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Send a message to a specific connection.
    SendTo { conn_id: ConnId, msg: ServerMsg },
    /// Broadcast a message to every connection in the room.
    Broadcast { msg: ServerMsg },
    /// Remove a connection from the room after delivering the message.
    Kick { conn_id: ConnId, msg: ServerMsg },
}

/// Which side of a connection mapping a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Host,
    Player,
}

/// Registry holds all active rooms.
pub struct Registry {
    /// room code -> handle
    pub rooms: dashmap::DashMap<RoomCode, RoomHandle>,
    /// connection id -> room code (player sockets)
    pub player_conns: dashmap::DashMap<ConnId, RoomCode>,
    /// connection id -> room code (host sockets)
    pub host_conns: dashmap::DashMap<ConnId, RoomCode>,
}

#[derive(Clone)]
pub struct RoomHandle {
    pub code: RoomCode,
    pub host_id: HostId,
    pub created_at: Instant,
    pub cmd_tx: mpsc::Sender<RoomCommand>,
    pub event_tx: broadcast::Sender<RoomEvent>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: dashmap::DashMap::new(),
            player_conns: dashmap::DashMap::new(),
            host_conns: dashmap::DashMap::new(),
        })
    }

    /// Case-insensitive room lookup; codes are stored uppercase.
    pub fn get_room(&self, code: &str) -> Option<RoomHandle> {
        self.rooms
            .get(&code.to_ascii_uppercase())
            .map(|h| h.clone())
    }

    pub fn remove_room(&self, code: &str) {
        self.rooms.remove(code);
        self.player_conns.retain(|_, c| c != code);
        self.host_conns.retain(|_, c| c != code);
    }

    /// Resolve a connection back to its room and role.
    pub fn find_by_connection(&self, conn_id: &str) -> Option<(RoomHandle, ConnRole)> {
        if let Some(code) = self.host_conns.get(conn_id) {
            if let Some(handle) = self.get_room(code.value()) {
                return Some((handle, ConnRole::Host));
            }
        }
        if let Some(code) = self.player_conns.get(conn_id) {
            if let Some(handle) = self.get_room(code.value()) {
                return Some((handle, ConnRole::Player));
            }
        }
        None
    }
}

/// A fresh uppercase room code not currently in use.
fn fresh_code(registry: &Registry) -> RoomCode {
    let mut rng = rand::rng();
    loop {
        let code: String = (0..ROOM_CODE_LENGTH)
            .map(|_| char::from(b'A' + rng.random_range(0..26)))
            .collect();
        if !registry.rooms.contains_key(&code) {
            return code;
        }
    }
}

/// Create a new room and spawn its task. Returns the room handle.
pub fn create_room(
    registry: &Arc<Registry>,
    prompt_source: Arc<dyn PromptSource>,
    host_conn_id: ConnId,
) -> RoomHandle {
    let code = fresh_code(registry);
    let host_id = Uuid::new_v4().to_string();

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, _) = broadcast::channel(256);

    let handle = RoomHandle {
        code: code.clone(),
        host_id: host_id.clone(),
        created_at: Instant::now(),
        cmd_tx: cmd_tx.clone(),
        event_tx: event_tx.clone(),
    };

    registry.rooms.insert(code.clone(), handle.clone());
    registry.host_conns.insert(host_conn_id.clone(), code.clone());

    let room = Room {
        code: code.clone(),
        host_id,
        host_conn: host_conn_id,
        host_connected: true,
        state: RoomState::Lobby,
        stage: Stage::Idle,
        players: Vec::new(),
        current_round: 0,
        theme: None,
        matchups: Vec::new(),
        scores: HashMap::new(),
        current_matchup: 0,
        used_prompts: HashSet::new(),
        last_lash: None,
        paused: false,
        pause_remaining: None,
        paused_kind: None,
        paused_in: None,
        timer: RoomTimer::new(),
        prompt_source,
        event_tx,
        cmd_tx,
        registry: registry.clone(),
    };

    tokio::spawn(room_task(room, cmd_rx));

    tracing::info!("Room created: {}", code);
    handle
}

/// Periodically sweep the registry for rooms past their maximum age.
pub fn spawn_reaper(registry: Arc<Registry>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAPER_INTERVAL);
        loop {
            interval.tick().await;
            let expired: Vec<RoomHandle> = registry
                .rooms
                .iter()
                .filter(|entry| entry.created_at.elapsed() > ROOM_MAX_AGE)
                .map(|entry| entry.value().clone())
                .collect();
            for handle in expired {
                tracing::info!("Reaping room {}", handle.code);
                let _ = handle.cmd_tx.send(RoomCommand::Expire).await;
            }
        }
    });
}

/// Sub-position within a phase, for routing timer wake-ups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Nothing scheduled (lobby, awaiting the finale reveal, game over).
    Idle,
    /// The short beat between VOTING_PHASE and the first matchup.
    Grace,
    /// A countdown is running and submissions are accepted.
    Open,
    /// Results are on screen; a hold will advance.
    Result,
}

struct Room {
    code: RoomCode,
    host_id: HostId,
    host_conn: ConnId,
    host_connected: bool,
    state: RoomState,
    stage: Stage,
    players: Vec<Player>,
    current_round: u32,
    theme: Option<String>,
    matchups: Vec<Matchup>,
    scores: HashMap<PlayerId, u32>,
    current_matchup: usize,
    used_prompts: HashSet<String>,
    last_lash: Option<LastLash>,
    paused: bool,
    pause_remaining: Option<u64>,
    paused_kind: Option<TimerKind>,
    paused_in: Option<RoomState>,
    timer: RoomTimer,
    prompt_source: Arc<dyn PromptSource>,
    event_tx: broadcast::Sender<RoomEvent>,
    cmd_tx: mpsc::Sender<RoomCommand>,
    registry: Arc<Registry>,
}

async fn room_task(mut room: Room, mut cmd_rx: mpsc::Receiver<RoomCommand>) {
    while let Some(cmd) = cmd_rx.recv().await {
        if room.handle_command(cmd).await.is_break() {
            break;
        }
    }
    room.registry.remove_room(&room.code);
    tracing::info!("Room {} task ended", room.code);
}

impl Room {
    async fn handle_command(&mut self, cmd: RoomCommand) -> ControlFlow<()> {
        match cmd {
            RoomCommand::Join {
                conn_id,
                player_name,
            } => self.handle_join(conn_id, player_name),
            RoomCommand::Rejoin { conn_id, player_id } => self.handle_rejoin(conn_id, player_id),
            RoomCommand::RejoinHost { conn_id, host_id } => {
                self.handle_rejoin_host(conn_id, host_id)
            }
            RoomCommand::StartGame { conn_id, theme } => {
                self.handle_start_game(conn_id, theme).await
            }
            RoomCommand::SubmitAnswer {
                conn_id,
                prompt_id,
                answer,
                is_last_lash,
            } => {
                if is_last_lash {
                    self.handle_finale_answer(conn_id, answer)
                } else {
                    self.handle_answer(conn_id, prompt_id, answer)
                }
            }
            RoomCommand::SubmitVote {
                conn_id,
                prompt_id,
                vote,
            } => self.handle_vote(conn_id, prompt_id, vote),
            RoomCommand::SubmitFinaleVote { conn_id, voted_for } => {
                self.handle_finale_vote(conn_id, voted_for)
            }
            RoomCommand::SkipPlayer { conn_id, player_id } => {
                self.handle_skip_player(conn_id, player_id)
            }
            RoomCommand::KickPlayer { conn_id, player_id } => {
                self.handle_kick_player(conn_id, player_id)
            }
            RoomCommand::PauseGame { conn_id } => self.handle_pause(conn_id),
            RoomCommand::ResumeGame { conn_id } => self.handle_resume(conn_id).await,
            RoomCommand::ExtendTime { conn_id, seconds } => self.handle_extend(conn_id, seconds),
            RoomCommand::EndGame { conn_id } => self.handle_end_game(conn_id),
            RoomCommand::ContinueLastWit { conn_id } => self.handle_continue_last_wit(conn_id),
            RoomCommand::PlayerDisconnected { conn_id } => self.handle_player_disconnect(conn_id),
            RoomCommand::HostDisconnected { conn_id } => self.handle_host_disconnect(conn_id),
            RoomCommand::TimerExpired { epoch } => {
                if self.timer.is_current(epoch) {
                    self.fire_expiry().await;
                }
            }
            RoomCommand::Advance { epoch } => {
                if self.timer.is_current(epoch) {
                    self.fire_advance().await;
                }
            }
            RoomCommand::Expire => {
                self.broadcast(ServerMsg::Error {
                    message: "Room closed after an hour of play".to_string(),
                    code: Some(ErrorCode::RoomNotFound),
                });
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ─── Outbound helpers ─────────────────────────────────────────

    fn broadcast(&self, msg: ServerMsg) {
        let _ = self.event_tx.send(RoomEvent::Broadcast { msg });
    }

    fn send_to(&self, conn_id: &str, msg: ServerMsg) {
        let _ = self.event_tx.send(RoomEvent::SendTo {
            conn_id: conn_id.to_string(),
            msg,
        });
    }

    fn to_host(&self, msg: ServerMsg) {
        self.send_to(&self.host_conn, msg);
    }

    fn error_to(&self, conn_id: &str, code: ErrorCode, message: &str) {
        self.send_to(conn_id, ServerMsg::error(code, message));
    }

    fn player_views(&self) -> Vec<PlayerView> {
        self.players
            .iter()
            .map(|p| PlayerView {
                id: p.id.clone(),
                name: p.name.clone(),
                connected: p.connected,
                score: self.scores.get(&p.id).copied().unwrap_or(0),
            })
            .collect()
    }

    fn scoreboard(&self) -> Vec<ScoreRow> {
        let mut rows: Vec<ScoreRow> = self
            .players
            .iter()
            .map(|p| ScoreRow {
                player_id: p.id.clone(),
                name: p.name.clone(),
                score: self.scores.get(&p.id).copied().unwrap_or(0),
            })
            .collect();
        // Stable sort keeps join order among ties.
        rows.sort_by(|a, b| b.score.cmp(&a.score));
        rows
    }

    fn broadcast_room_update(&self) {
        self.broadcast(ServerMsg::RoomUpdate {
            state: self.state,
            players: self.player_views(),
            host_connected: self.host_connected,
        });
    }

    fn player_index_by_conn(&self, conn_id: &str) -> Option<usize> {
        self.players.iter().position(|p| p.connection_id == conn_id)
    }

    fn name_of(&self, player_id: &str) -> String {
        self.players
            .iter()
            .find(|p| p.id == player_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "(gone)".to_string())
    }

    fn require_host(&self, conn_id: &str) -> bool {
        if conn_id != self.host_conn {
            self.error_to(conn_id, ErrorCode::NotHost, "Only the host can do that");
            return false;
        }
        true
    }

    /// Players allowed to vote on a matchup: everyone but the two authors.
    fn eligible_voters(&self) -> usize {
        self.players.len().saturating_sub(2)
    }

    // ─── Lobby ────────────────────────────────────────────────────

    fn handle_join(&mut self, conn_id: ConnId, player_name: String) {
        if self.state != RoomState::Lobby {
            self.error_to(
                &conn_id,
                ErrorCode::GameInProgress,
                "Game already in progress",
            );
            return;
        }
        if self.players.len() >= MAX_PLAYERS {
            self.error_to(&conn_id, ErrorCode::RoomFull, "Room is full");
            return;
        }

        let name = player_name.trim().to_string();
        if name.is_empty() || name.chars().count() > MAX_NAME_LENGTH {
            self.send_to(
                &conn_id,
                ServerMsg::Error {
                    message: format!("Name must be 1-{} characters", MAX_NAME_LENGTH),
                    code: None,
                },
            );
            return;
        }
        let lowered = name.to_lowercase();
        if self.players.iter().any(|p| p.name.to_lowercase() == lowered) {
            self.error_to(&conn_id, ErrorCode::NameTaken, "That name is taken");
            return;
        }

        let player = Player::new(Uuid::new_v4().to_string(), conn_id.clone(), name.clone());
        let player_id = player.id.clone();
        self.scores.insert(player_id.clone(), 0);
        self.players.push(player);
        self.registry
            .player_conns
            .insert(conn_id.clone(), self.code.clone());

        self.send_to(
            &conn_id,
            ServerMsg::RoomJoined {
                room_code: self.code.clone(),
                player_id,
                name,
                players: self.player_views(),
            },
        );
        self.broadcast_room_update();
    }

    fn handle_rejoin(&mut self, conn_id: ConnId, player_id: PlayerId) {
        let Some(index) = self.players.iter().position(|p| p.id == player_id) else {
            self.error_to(&conn_id, ErrorCode::NotInRoom, "Unknown player");
            return;
        };

        let old_conn = self.players[index].connection_id.clone();
        self.registry.player_conns.remove(&old_conn);
        self.players[index].connection_id = conn_id.clone();
        self.players[index].connected = true;
        self.registry
            .player_conns
            .insert(conn_id.clone(), self.code.clone());

        let name = self.players[index].name.clone();
        let prompts = if self.state == RoomState::Prompt {
            Some(self.unanswered_cards_for(&player_id))
        } else {
            None
        };

        self.send_to(
            &conn_id,
            ServerMsg::RejoinSuccess {
                room_code: self.code.clone(),
                player_id: player_id.clone(),
                name,
                state: self.state,
                players: self.player_views(),
                prompts,
                remaining: self.timer.remaining(),
            },
        );

        // Re-deliver whatever the room is currently showing.
        match (self.state, self.stage) {
            (RoomState::Voting, Stage::Open) => {
                if let Some(msg) = self.current_matchup_msg() {
                    self.send_to(&conn_id, msg);
                }
            }
            (RoomState::LastLash, Stage::Open) => {
                if let Some(msg) = self.finale_prompt_msg() {
                    self.send_to(&conn_id, msg);
                }
            }
            (RoomState::LastLashVoting, Stage::Open) => {
                if let Some(msg) = self.finale_voting_msg() {
                    self.send_to(&conn_id, msg);
                }
            }
            _ => {}
        }

        self.broadcast_room_update();
    }

    fn handle_rejoin_host(&mut self, conn_id: ConnId, host_id: HostId) {
        if host_id != self.host_id {
            self.error_to(&conn_id, ErrorCode::InvalidHost, "Host identity mismatch");
            return;
        }

        self.registry.host_conns.remove(&self.host_conn);
        self.host_conn = conn_id.clone();
        self.host_connected = true;
        self.registry
            .host_conns
            .insert(conn_id.clone(), self.code.clone());

        self.send_to(
            &conn_id,
            ServerMsg::RejoinHostSuccess {
                room_code: self.code.clone(),
                state: self.state,
                round: self.current_round,
                players: self.player_views(),
                scoreboard: self.scoreboard(),
                remaining: self.timer.remaining(),
            },
        );
        self.broadcast_room_update();
    }

    fn handle_player_disconnect(&mut self, conn_id: ConnId) {
        self.registry.player_conns.remove(&conn_id);
        if let Some(player) = self
            .players
            .iter_mut()
            .find(|p| p.connection_id == conn_id)
        {
            player.connected = false;
            tracing::info!("Player {} disconnected from {}", player.name, self.code);
            self.broadcast_room_update();
        }
    }

    fn handle_host_disconnect(&mut self, conn_id: ConnId) {
        if conn_id != self.host_conn {
            return;
        }
        self.registry.host_conns.remove(&conn_id);
        self.host_connected = false;
        tracing::info!("Host disconnected from {}", self.code);
        self.broadcast_room_update();
    }

    fn handle_kick_player(&mut self, conn_id: ConnId, player_id: PlayerId) {
        if !self.require_host(&conn_id) {
            return;
        }
        let Some(index) = self.players.iter().position(|p| p.id == player_id) else {
            self.error_to(&conn_id, ErrorCode::InvalidTarget, "No such player");
            return;
        };

        let player = self.players.remove(index);
        self.scores.remove(&player.id);
        self.registry.player_conns.remove(&player.connection_id);

        let _ = self.event_tx.send(RoomEvent::Kick {
            conn_id: player.connection_id.clone(),
            msg: ServerMsg::PlayerKicked {
                player_id: player.id.clone(),
            },
        });
        self.broadcast(ServerMsg::PlayerKicked {
            player_id: player.id.clone(),
        });

        // Their outstanding matchup answers will never arrive.
        self.fill_matchup_answers(&player.id, SKIPPED);
        self.broadcast_room_update();
        self.check_phase_completion();
    }

    // ─── Game start & prompt phase ────────────────────────────────

    async fn handle_start_game(&mut self, conn_id: ConnId, theme: Option<String>) {
        if !self.require_host(&conn_id) {
            return;
        }
        if self.state != RoomState::Lobby {
            self.error_to(&conn_id, ErrorCode::GameInProgress, "Game already started");
            return;
        }
        if self.players.len() < MIN_PLAYERS {
            self.error_to(
                &conn_id,
                ErrorCode::NotEnoughPlayers,
                &format!("Need at least {} players", MIN_PLAYERS),
            );
            return;
        }

        self.theme = theme
            .map(|t| t.trim().chars().take(MAX_THEME_LENGTH).collect::<String>())
            .filter(|t| !t.is_empty());

        self.broadcast(ServerMsg::GameStarted {
            total_rounds: ROUNDS_PER_GAME,
            theme: self.theme.clone(),
        });

        self.begin_prompt_phase().await;
    }

    async fn begin_prompt_phase(&mut self) {
        self.current_round += 1;
        self.state = RoomState::Prompt;
        self.stage = Stage::Open;
        self.current_matchup = 0;

        let ids: Vec<PlayerId> = self.players.iter().map(|p| p.id.clone()).collect();
        let pair_count = (ids.len() * PROMPTS_PER_PLAYER).div_ceil(2);

        let texts = self
            .prompt_source
            .generate_prompts(pair_count, &mut self.used_prompts, self.theme.as_deref())
            .await;
        let pairs = pairing::assign_pairs(&ids, PROMPTS_PER_PLAYER);

        let round = self.current_round;
        self.matchups = pairs
            .into_iter()
            .zip(texts)
            .enumerate()
            .map(|(i, ((p1, p2), text))| {
                Matchup::new(format!("r{}_p{}", round, i), text, p1, p2)
            })
            .collect();

        for player in &mut self.players {
            player.answers_submitted = 0;
            player.has_voted.clear();
        }
        let assigned: Vec<(PlayerId, Vec<PromptId>)> = self
            .players
            .iter()
            .map(|p| {
                let ids = self
                    .matchups
                    .iter()
                    .filter(|m| m.side_of(&p.id).is_some())
                    .map(|m| m.id.clone())
                    .collect();
                (p.id.clone(), ids)
            })
            .collect();
        for (player_id, prompt_ids) in assigned {
            if let Some(p) = self.players.iter_mut().find(|p| p.id == player_id) {
                p.prompts_assigned = prompt_ids;
            }
        }

        self.to_host(ServerMsg::PromptPhase {
            round: self.current_round,
            total_rounds: ROUNDS_PER_GAME,
            player_count: self.players.len(),
        });
        for player in &self.players {
            self.send_to(
                &player.connection_id,
                ServerMsg::ReceivePrompts {
                    prompts: self.unanswered_cards_for(&player.id),
                    time_limit: ANSWER_TIME,
                },
            );
        }
        self.timer
            .arm_countdown(ANSWER_TIME, &self.event_tx, &self.cmd_tx);
    }

    fn unanswered_cards_for(&self, player_id: &str) -> Vec<PromptCard> {
        self.matchups
            .iter()
            .filter(|m| match m.side_of(player_id) {
                Some(1) => m.player1_answer.is_none(),
                Some(2) => m.player2_answer.is_none(),
                _ => false,
            })
            .map(|m| PromptCard {
                id: m.id.clone(),
                text: m.text.clone(),
            })
            .collect()
    }

    // ─── Answer collection ────────────────────────────────────────

    fn handle_answer(&mut self, conn_id: ConnId, prompt_id: Option<PromptId>, answer: String) {
        if self.state != RoomState::Prompt {
            self.error_to(&conn_id, ErrorCode::PromptNotFound, "Not accepting answers");
            return;
        }
        let Some(player_index) = self.player_index_by_conn(&conn_id) else {
            self.error_to(&conn_id, ErrorCode::NotInRoom, "You are not in this room");
            return;
        };
        let Some(prompt_id) = prompt_id else {
            self.error_to(&conn_id, ErrorCode::PromptNotFound, "Missing prompt id");
            return;
        };
        let Some(matchup_index) = self.matchups.iter().position(|m| m.id == prompt_id) else {
            self.error_to(&conn_id, ErrorCode::PromptNotFound, "No such prompt");
            return;
        };

        let player_id = self.players[player_index].id.clone();
        let matchup = &mut self.matchups[matchup_index];
        let side = match matchup.side_of(&player_id) {
            Some(side) => side,
            None => {
                self.error_to(&conn_id, ErrorCode::NotAssigned, "Not your prompt");
                return;
            }
        };

        let slot = if side == 1 {
            &mut matchup.player1_answer
        } else {
            &mut matchup.player2_answer
        };
        if slot.is_some() {
            self.error_to(&conn_id, ErrorCode::AlreadySubmitted, "Already answered");
            return;
        }
        *slot = Some(clean_answer(&answer));

        self.players[player_index].answers_submitted += 1;
        let name = self.players[player_index].name.clone();
        let submitted = self.answered_side_count();
        self.to_host(ServerMsg::PlayerSubmitted {
            player_id,
            name,
            submitted,
            expected: self.matchups.len() * 2,
        });

        self.check_phase_completion();
    }

    fn answered_side_count(&self) -> usize {
        self.matchups
            .iter()
            .map(|m| m.player1_answer.is_some() as usize + m.player2_answer.is_some() as usize)
            .sum()
    }

    /// Fill a player's unanswered matchup sides with a sentinel.
    fn fill_matchup_answers(&mut self, player_id: &str, sentinel: &str) {
        for matchup in &mut self.matchups {
            match matchup.side_of(player_id) {
                Some(1) if matchup.player1_answer.is_none() => {
                    matchup.player1_answer = Some(sentinel.to_string());
                }
                Some(2) if matchup.player2_answer.is_none() => {
                    matchup.player2_answer = Some(sentinel.to_string());
                }
                _ => {}
            }
        }
    }

    /// Record a sentinel finale entry for a player who has none yet.
    fn fill_finale_answer(&mut self, player_id: &str, sentinel: &str) {
        if let Some(ll) = self.last_lash.as_mut() {
            if !ll.answers.iter().any(|a| a.player_id == player_id) {
                ll.answers.push(FinaleAnswer {
                    player_id: player_id.to_string(),
                    answer: sentinel.to_string(),
                    points: 0,
                    votes: 0,
                    is_winner: false,
                    validation_warning: None,
                });
            }
        }
    }

    /// Advance out of an answering phase once every input is present.
    fn check_phase_completion(&mut self) {
        match self.state {
            RoomState::Prompt => {
                if !self.matchups.is_empty() && self.matchups.iter().all(|m| m.both_answered()) {
                    self.timer.cancel();
                    self.enter_voting();
                }
            }
            RoomState::LastLash if self.stage == Stage::Open => {
                let done = self
                    .last_lash
                    .as_ref()
                    .map(|ll| ll.answers.len() >= self.players.len())
                    .unwrap_or(false);
                if done {
                    self.timer.cancel();
                    self.enter_last_lash_voting();
                }
            }
            _ => {}
        }
    }

    fn handle_skip_player(&mut self, conn_id: ConnId, player_id: PlayerId) {
        if !self.require_host(&conn_id) {
            return;
        }
        if self.players.iter().all(|p| p.id != player_id) {
            self.error_to(&conn_id, ErrorCode::InvalidTarget, "No such player");
            return;
        }
        self.fill_matchup_answers(&player_id, SKIPPED);
        if self.state == RoomState::LastLash && self.stage == Stage::Open {
            self.fill_finale_answer(&player_id, SKIPPED);
        }
        self.check_phase_completion();
    }

    // ─── Voting ───────────────────────────────────────────────────

    fn enter_voting(&mut self) {
        for player in &mut self.players {
            player.has_voted.clear();
        }
        self.state = RoomState::Voting;
        self.stage = Stage::Grace;
        self.current_matchup = 0;

        self.broadcast(ServerMsg::VotingPhase {
            matchup_count: self.matchups.len(),
        });
        self.timer.arm_hold(VOTE_GRACE, &self.cmd_tx);
    }

    fn current_matchup_msg(&self) -> Option<ServerMsg> {
        let m = self.matchups.get(self.current_matchup)?;
        Some(ServerMsg::VoteMatchup {
            prompt_id: m.id.clone(),
            prompt_text: m.text.clone(),
            answer1: m.player1_answer.clone().unwrap_or_else(|| NO_ANSWER.into()),
            answer2: m.player2_answer.clone().unwrap_or_else(|| NO_ANSWER.into()),
            player1_id: m.player1_id.clone(),
            player2_id: m.player2_id.clone(),
            player1_name: self.name_of(&m.player1_id),
            player2_name: self.name_of(&m.player2_id),
            matchup_index: self.current_matchup,
            total_matchups: self.matchups.len(),
        })
    }

    fn present_matchup(&mut self) {
        let Some(msg) = self.current_matchup_msg() else {
            self.enter_scoring();
            return;
        };
        self.stage = Stage::Open;
        self.broadcast(msg);
        self.timer
            .arm_countdown(VOTE_TIME, &self.event_tx, &self.cmd_tx);
    }

    fn handle_vote(&mut self, conn_id: ConnId, prompt_id: PromptId, vote: u8) {
        if self.state != RoomState::Voting {
            self.error_to(&conn_id, ErrorCode::InvalidVote, "Voting is not open");
            return;
        }
        let Some(matchup_index) = self.matchups.iter().position(|m| m.id == prompt_id) else {
            self.error_to(&conn_id, ErrorCode::PromptNotFound, "No such matchup");
            return;
        };
        if self.stage != Stage::Open || matchup_index != self.current_matchup {
            self.error_to(
                &conn_id,
                ErrorCode::InvalidVote,
                "This matchup is not open for voting",
            );
            return;
        }
        let Some(player_index) = self.player_index_by_conn(&conn_id) else {
            self.error_to(&conn_id, ErrorCode::NotInRoom, "You are not in this room");
            return;
        };

        let voter_id = self.players[player_index].id.clone();
        if self.matchups[matchup_index].side_of(&voter_id).is_some() {
            self.error_to(
                &conn_id,
                ErrorCode::OwnMatchup,
                "You cannot vote on your own matchup",
            );
            return;
        }
        if self.players[player_index].has_voted.contains(&prompt_id) {
            self.error_to(&conn_id, ErrorCode::AlreadyVoted, "Already voted");
            return;
        }
        match vote {
            1 => self.matchups[matchup_index].player1_votes += 1,
            2 => self.matchups[matchup_index].player2_votes += 1,
            _ => {
                self.error_to(&conn_id, ErrorCode::InvalidVote, "Vote must be 1 or 2");
                return;
            }
        }
        self.players[player_index].has_voted.insert(prompt_id);

        let name = self.players[player_index].name.clone();
        let votes_in = (self.matchups[matchup_index].player1_votes
            + self.matchups[matchup_index].player2_votes) as usize;
        self.to_host(ServerMsg::PlayerVoted {
            player_id: voter_id,
            name,
            votes_in,
            expected: self.eligible_voters(),
        });

        if votes_in >= self.eligible_voters() {
            self.close_matchup_voting();
        }
    }

    fn close_matchup_voting(&mut self) {
        self.timer.cancel();
        let index = self.current_matchup;
        let Some(m) = self.matchups.get(index) else {
            return;
        };

        let answer1 = m.player1_answer.clone().unwrap_or_else(|| NO_ANSWER.into());
        let answer2 = m.player2_answer.clone().unwrap_or_else(|| NO_ANSWER.into());
        let outcome =
            scoring::score_matchup(&answer1, &answer2, m.player1_votes, m.player2_votes);
        scoring::apply_matchup_outcome(&mut self.matchups[index], &outcome, &mut self.scores);

        self.stage = Stage::Result;
        let m = &self.matchups[index];
        self.broadcast(ServerMsg::MatchupResult {
            prompt_id: m.id.clone(),
            prompt_text: m.text.clone(),
            player1_id: m.player1_id.clone(),
            player1_name: self.name_of(&m.player1_id),
            player1_answer: answer1,
            player1_votes: m.player1_votes,
            player1_points: outcome.player1_points,
            player2_id: m.player2_id.clone(),
            player2_name: self.name_of(&m.player2_id),
            player2_answer: answer2,
            player2_votes: m.player2_votes,
            player2_points: outcome.player2_points,
            is_jinx: outcome.is_jinx,
            quipwit: outcome.quipwit,
            scoreboard: self.scoreboard(),
        });
        self.timer.arm_hold(MATCHUP_RESULT_HOLD, &self.cmd_tx);
    }

    fn enter_scoring(&mut self) {
        self.state = RoomState::Scoring;
        self.stage = Stage::Result;
        self.broadcast(ServerMsg::RoundScores {
            round: self.current_round,
            scoreboard: self.scoreboard(),
        });
        self.timer.arm_hold(ROUND_SCORES_HOLD, &self.cmd_tx);
    }

    // ─── Finale ───────────────────────────────────────────────────

    async fn enter_last_lash(&mut self) {
        self.state = RoomState::LastLash;
        self.stage = Stage::Idle;

        let spec = self
            .prompt_source
            .generate_last_lash(&mut self.used_prompts, self.theme.as_deref())
            .await;
        self.last_lash = Some(LastLash {
            prompt: spec.prompt,
            mode: spec.mode,
            letters: spec.letters,
            instructions: spec.instructions,
            answers: Vec::new(),
            votes: HashMap::new(),
        });

        self.broadcast(ServerMsg::LastWitModeReveal { mode: spec.mode });
    }

    fn finale_prompt_msg(&self) -> Option<ServerMsg> {
        let ll = self.last_lash.as_ref()?;
        Some(ServerMsg::LastLashPrompt {
            prompt: ll.prompt.clone(),
            mode: ll.mode,
            letters: ll.letters.clone(),
            instructions: ll.instructions.clone(),
            time_limit: LAST_LASH_ANSWER_TIME,
        })
    }

    fn handle_continue_last_wit(&mut self, conn_id: ConnId) {
        if !self.require_host(&conn_id) {
            return;
        }
        if self.state != RoomState::LastLash || self.stage != Stage::Idle {
            return;
        }
        let Some(ll) = self.last_lash.as_ref() else {
            return;
        };

        self.stage = Stage::Open;
        self.to_host(ServerMsg::LastLashPhase {
            prompt: ll.prompt.clone(),
            mode: ll.mode,
            letters: ll.letters.clone(),
            instructions: ll.instructions.clone(),
            time_limit: LAST_LASH_ANSWER_TIME,
        });
        if let Some(msg) = self.finale_prompt_msg() {
            for player in &self.players {
                self.send_to(&player.connection_id, msg.clone());
            }
        }
        self.timer
            .arm_countdown(LAST_LASH_ANSWER_TIME, &self.event_tx, &self.cmd_tx);
    }

    fn handle_finale_answer(&mut self, conn_id: ConnId, answer: String) {
        if self.state != RoomState::LastLash || self.stage != Stage::Open {
            self.error_to(&conn_id, ErrorCode::PromptNotFound, "Finale is not open");
            return;
        }
        let Some(player_index) = self.player_index_by_conn(&conn_id) else {
            self.error_to(&conn_id, ErrorCode::NotInRoom, "You are not in this room");
            return;
        };
        let player_id = self.players[player_index].id.clone();
        let name = self.players[player_index].name.clone();

        let already = self
            .last_lash
            .as_ref()
            .map(|ll| ll.answers.iter().any(|a| a.player_id == player_id))
            .unwrap_or(true);
        if already {
            self.error_to(&conn_id, ErrorCode::AlreadySubmitted, "Already answered");
            return;
        }

        let text = clean_answer(&answer);
        let submitted = match self.last_lash.as_mut() {
            Some(ll) => {
                let validation_warning = finale_warning(ll.mode, ll.letters.as_deref(), &text);
                ll.answers.push(FinaleAnswer {
                    player_id: player_id.clone(),
                    answer: text,
                    points: 0,
                    votes: 0,
                    is_winner: false,
                    validation_warning,
                });
                ll.answers.len()
            }
            None => return,
        };

        self.to_host(ServerMsg::PlayerSubmitted {
            player_id,
            name,
            submitted,
            expected: self.players.len(),
        });
        self.check_phase_completion();
    }

    fn enter_last_lash_voting(&mut self) {
        self.state = RoomState::LastLashVoting;
        self.stage = Stage::Open;

        if let Some(ll) = self.last_lash.as_mut() {
            let mut rng = rand::rng();
            ll.answers.shuffle(&mut rng);
        }

        if let Some(msg) = self.finale_voting_msg() {
            self.broadcast(msg);
        }
        self.timer
            .arm_countdown(LAST_LASH_VOTE_TIME, &self.event_tx, &self.cmd_tx);
    }

    fn finale_voting_msg(&self) -> Option<ServerMsg> {
        let ll = self.last_lash.as_ref()?;
        Some(ServerMsg::LastLashVoting {
            answers: ll
                .answers
                .iter()
                .map(|a| AnonymousAnswer {
                    player_id: a.player_id.clone(),
                    answer: a.answer.clone(),
                })
                .collect(),
            time_limit: LAST_LASH_VOTE_TIME,
        })
    }

    fn handle_finale_vote(&mut self, conn_id: ConnId, voted_for: PlayerId) {
        if self.state != RoomState::LastLashVoting || self.stage != Stage::Open {
            self.error_to(&conn_id, ErrorCode::InvalidVote, "Finale voting is not open");
            return;
        }
        let Some(player_index) = self.player_index_by_conn(&conn_id) else {
            self.error_to(&conn_id, ErrorCode::NotInRoom, "You are not in this room");
            return;
        };
        let voter_id = self.players[player_index].id.clone();
        let name = self.players[player_index].name.clone();

        if voted_for == voter_id {
            self.error_to(
                &conn_id,
                ErrorCode::CannotVoteSelf,
                "You cannot vote for yourself",
            );
            return;
        }
        let Some(ll) = self.last_lash.as_mut() else {
            return;
        };
        if ll.votes.contains_key(&voter_id) {
            self.error_to(&conn_id, ErrorCode::AlreadyVoted, "Already voted");
            return;
        }
        if !ll.answers.iter().any(|a| a.player_id == voted_for) {
            self.error_to(&conn_id, ErrorCode::InvalidTarget, "No such answer");
            return;
        }
        ll.votes.insert(voter_id.clone(), voted_for);
        let votes_in = ll.votes.len();

        self.to_host(ServerMsg::PlayerVoted {
            player_id: voter_id,
            name,
            votes_in,
            expected: self.players.len(),
        });

        if votes_in >= self.players.len() {
            self.close_finale_voting();
        }
    }

    fn close_finale_voting(&mut self) {
        self.timer.cancel();

        let answers = if let Some(ll) = self.last_lash.as_mut() {
            scoring::score_finale(&mut ll.answers, &ll.votes, &mut self.scores);
            ll.answers.sort_by(|a, b| b.points.cmp(&a.points));
            ll.answers.clone()
        } else {
            Vec::new()
        };

        self.stage = Stage::Result;
        self.broadcast(ServerMsg::LastLashResults {
            answers,
            scoreboard: self.scoreboard(),
        });
        self.timer.arm_hold(LAST_LASH_RESULTS_HOLD, &self.cmd_tx);
    }

    // ─── Game end ─────────────────────────────────────────────────

    fn finish_game(&mut self) {
        self.timer.cancel();
        self.state = RoomState::GameOver;
        self.stage = Stage::Idle;

        let winner_ids = scoring::winners(self.players.iter().map(|p| &p.id), &self.scores);
        let scoreboard = self.scoreboard();
        let winners = scoreboard
            .iter()
            .filter(|row| winner_ids.contains(&row.player_id))
            .cloned()
            .collect();

        self.broadcast(ServerMsg::GameOver {
            winners,
            scoreboard,
        });
    }

    fn handle_end_game(&mut self, conn_id: ConnId) {
        if !self.require_host(&conn_id) {
            return;
        }
        if self.state == RoomState::GameOver {
            return;
        }
        self.finish_game();
    }

    // ─── Pause / resume / extend ──────────────────────────────────

    fn handle_pause(&mut self, conn_id: ConnId) {
        if !self.require_host(&conn_id) || self.paused {
            return;
        }
        self.paused = true;
        self.paused_in = Some(self.state);
        if let Some((remaining, kind)) = self.timer.pause() {
            self.pause_remaining = Some(remaining);
            self.paused_kind = Some(kind);
        }
        self.broadcast(ServerMsg::GamePaused {
            remaining: self.pause_remaining,
        });
    }

    async fn handle_resume(&mut self, conn_id: ConnId) {
        if !self.require_host(&conn_id) || !self.paused {
            return;
        }
        self.paused = false;
        self.paused_in = None;
        let remaining = self.pause_remaining.take();
        let kind = self.paused_kind.take();

        self.broadcast(ServerMsg::GameResumed { remaining });

        // A phase transition while paused may have armed a new schedule; the
        // frozen one is then obsolete.
        if self.timer.kind().is_some() {
            return;
        }
        match (kind, remaining) {
            (Some(TimerKind::Countdown), Some(0)) => self.fire_expiry().await,
            (Some(TimerKind::Countdown), Some(secs)) => {
                self.timer.arm_countdown(secs, &self.event_tx, &self.cmd_tx);
            }
            (Some(TimerKind::Hold), Some(0)) => self.fire_advance().await,
            (Some(TimerKind::Hold), Some(secs)) => {
                self.timer
                    .arm_hold(Duration::from_secs(secs), &self.cmd_tx);
            }
            _ => {}
        }
    }

    fn handle_extend(&mut self, conn_id: ConnId, seconds: Option<u64>) {
        if !self.require_host(&conn_id) {
            return;
        }
        let extra = seconds.unwrap_or(DEFAULT_EXTEND_SECONDS);
        if self.paused {
            if let Some(remaining) = self.pause_remaining.as_mut() {
                *remaining += extra;
            }
            return;
        }
        if self.timer.extend(extra, &self.event_tx, &self.cmd_tx).is_none() {
            self.send_to(
                &conn_id,
                ServerMsg::Error {
                    message: "No timer running".to_string(),
                    code: None,
                },
            );
        }
    }

    // ─── Timer dispatch ───────────────────────────────────────────

    /// What an expired countdown means, resolved from where the room is.
    async fn fire_expiry(&mut self) {
        match (self.state, self.stage) {
            (RoomState::Prompt, Stage::Open) => {
                self.sweep_unanswered();
                self.enter_voting();
            }
            (RoomState::Voting, Stage::Open) => self.close_matchup_voting(),
            (RoomState::LastLash, Stage::Open) => {
                self.sweep_missing_finale();
                self.enter_last_lash_voting();
            }
            (RoomState::LastLashVoting, Stage::Open) => self.close_finale_voting(),
            _ => {}
        }
    }

    /// What an elapsed hold means, resolved from where the room is.
    async fn fire_advance(&mut self) {
        match (self.state, self.stage) {
            (RoomState::Voting, Stage::Grace) => self.present_matchup(),
            (RoomState::Voting, Stage::Result) => {
                self.current_matchup += 1;
                if self.current_matchup < self.matchups.len() {
                    self.present_matchup();
                } else {
                    self.enter_scoring();
                }
            }
            (RoomState::Scoring, _) => {
                if self.current_round < ROUNDS_PER_GAME {
                    self.begin_prompt_phase().await;
                } else {
                    self.enter_last_lash().await;
                }
            }
            (RoomState::LastLashVoting, Stage::Result) => self.finish_game(),
            _ => {}
        }
    }

    fn sweep_unanswered(&mut self) {
        for matchup in &mut self.matchups {
            if matchup.player1_answer.is_none() {
                matchup.player1_answer = Some(NO_ANSWER.to_string());
            }
            if matchup.player2_answer.is_none() {
                matchup.player2_answer = Some(NO_ANSWER.to_string());
            }
        }
    }

    fn sweep_missing_finale(&mut self) {
        let missing: Vec<PlayerId> = {
            let answered: HashSet<&str> = self
                .last_lash
                .as_ref()
                .map(|ll| ll.answers.iter().map(|a| a.player_id.as_str()).collect())
                .unwrap_or_default();
            self.players
                .iter()
                .filter(|p| !answered.contains(p.id.as_str()))
                .map(|p| p.id.clone())
                .collect()
        };
        if let Some(ll) = self.last_lash.as_mut() {
            for player_id in missing {
                ll.answers.push(FinaleAnswer {
                    player_id,
                    answer: NO_ANSWER.to_string(),
                    points: 0,
                    votes: 0,
                    is_winner: false,
                    validation_warning: None,
                });
            }
        }
    }
}

/// Trim, cap, and sentinel-fill a submitted answer.
fn clean_answer(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return NO_ANSWER.to_string();
    }
    trimmed.chars().take(MAX_ANSWER_LENGTH).collect()
}

/// Soft validation of finale answers; a mismatch attaches a warning but the
/// answer is always accepted.
fn finale_warning(mode: FinaleMode, letters: Option<&[char]>, answer: &str) -> Option<String> {
    let letters = match (mode, letters) {
        (FinaleMode::Flashback, _) | (_, None) => return None,
        (_, Some(letters)) => letters,
    };
    let words: Vec<&str> = answer.split_whitespace().collect();

    if mode == FinaleMode::AcroLash && words.len() != letters.len() {
        return Some(format!(
            "Expected exactly {} words, one per letter",
            letters.len()
        ));
    }
    for (i, letter) in letters.iter().enumerate() {
        let starts = words
            .get(i)
            .and_then(|w| w.chars().next())
            .map(|c| c.eq_ignore_ascii_case(letter))
            .unwrap_or(false);
        if !starts {
            return Some(format!(
                "Word {} should start with {}",
                i + 1,
                letter
            ));
        }
    }
    None
}
