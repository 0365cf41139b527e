use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub type PlayerId = String;
pub type HostId = String;
pub type ConnId = String;
pub type PromptId = String;
pub type RoomCode = String;

/// A player in a room. Identity (`id`) is stable across reconnections;
/// the connection binding is replaced on rejoin.
#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub connection_id: ConnId,
    pub name: String,
    pub connected: bool,
    pub prompts_assigned: Vec<PromptId>,
    pub answers_submitted: usize,
    pub has_voted: HashSet<PromptId>,
}

impl Player {
    pub fn new(id: PlayerId, connection_id: ConnId, name: String) -> Self {
        Self {
            id,
            connection_id,
            name,
            connected: true,
            prompts_assigned: Vec::new(),
            answers_submitted: 0,
            has_voted: HashSet::new(),
        }
    }
}

/// Public view of a player, sent in ROOM_UPDATE and join snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub id: PlayerId,
    pub name: String,
    pub connected: bool,
    pub score: u32,
}

/// A prompt matched to two players for one round.
#[derive(Debug, Clone)]
pub struct Matchup {
    pub id: PromptId,
    pub text: String,
    pub player1_id: PlayerId,
    pub player2_id: PlayerId,
    pub player1_answer: Option<String>,
    pub player2_answer: Option<String>,
    pub player1_votes: u32,
    pub player2_votes: u32,
    pub is_jinx: bool,
    pub quipwit: Option<u8>,
}

impl Matchup {
    pub fn new(id: PromptId, text: String, player1_id: PlayerId, player2_id: PlayerId) -> Self {
        Self {
            id,
            text,
            player1_id,
            player2_id,
            player1_answer: None,
            player2_answer: None,
            player1_votes: 0,
            player2_votes: 0,
            is_jinx: false,
            quipwit: None,
        }
    }

    /// Which side of the matchup a player is on, if any.
    pub fn side_of(&self, player_id: &str) -> Option<u8> {
        if self.player1_id == player_id {
            Some(1)
        } else if self.player2_id == player_id {
            Some(2)
        } else {
            None
        }
    }

    pub fn both_answered(&self) -> bool {
        self.player1_answer.is_some() && self.player2_answer.is_some()
    }
}

/// Finale variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinaleMode {
    Flashback,
    WordLash,
    AcroLash,
}

/// One player's finale entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinaleAnswer {
    pub player_id: PlayerId,
    pub answer: String,
    pub points: u32,
    pub votes: u32,
    pub is_winner: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_warning: Option<String>,
}

/// The finale block attached to a room once LAST_LASH begins.
#[derive(Debug, Clone)]
pub struct LastLash {
    pub prompt: String,
    pub mode: FinaleMode,
    pub letters: Option<Vec<char>>,
    pub instructions: Option<String>,
    pub answers: Vec<FinaleAnswer>,
    /// voter -> voted-for, one vote each.
    pub votes: HashMap<PlayerId, PlayerId>,
}

/// Room phases, in wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    Lobby,
    Prompt,
    Voting,
    Scoring,
    LastLash,
    LastLashVoting,
    GameOver,
}

impl std::fmt::Display for RoomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lobby => write!(f, "LOBBY"),
            Self::Prompt => write!(f, "PROMPT"),
            Self::Voting => write!(f, "VOTING"),
            Self::Scoring => write!(f, "SCORING"),
            Self::LastLash => write!(f, "LAST_LASH"),
            Self::LastLashVoting => write!(f, "LAST_LASH_VOTING"),
            Self::GameOver => write!(f, "GAME_OVER"),
        }
    }
}

/// One row of the scoreboard; sorted descending, ties keep join order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRow {
    pub player_id: PlayerId,
    pub name: String,
    pub score: u32,
}

/// A prompt as delivered to the player who must answer it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptCard {
    pub id: PromptId,
    pub text: String,
}

/// A finale answer as shown during anonymous voting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousAnswer {
    pub player_id: PlayerId,
    pub answer: String,
}

/// Machine codes carried by the ERROR event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomNotFound,
    InvalidHost,
    NotHost,
    NotInRoom,
    NameTaken,
    RoomFull,
    GameInProgress,
    NotEnoughPlayers,
    PromptNotFound,
    NotAssigned,
    AlreadySubmitted,
    OwnMatchup,
    AlreadyVoted,
    InvalidVote,
    CannotVoteSelf,
    InvalidTarget,
}

/// Messages sent from server to clients via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMsg {
    RoomCreated {
        room_code: RoomCode,
        host_id: HostId,
        #[serde(skip_serializing_if = "Option::is_none")]
        join_url: Option<String>,
    },
    RoomJoined {
        room_code: RoomCode,
        player_id: PlayerId,
        name: String,
        players: Vec<PlayerView>,
    },
    RoomUpdate {
        state: RoomState,
        players: Vec<PlayerView>,
        host_connected: bool,
    },
    GameStarted {
        total_rounds: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        theme: Option<String>,
    },
    PromptPhase {
        round: u32,
        total_rounds: u32,
        player_count: usize,
    },
    ReceivePrompts {
        prompts: Vec<PromptCard>,
        time_limit: u64,
    },
    VotingPhase {
        matchup_count: usize,
    },
    VoteMatchup {
        prompt_id: PromptId,
        prompt_text: String,
        answer1: String,
        answer2: String,
        player1_id: PlayerId,
        player2_id: PlayerId,
        player1_name: String,
        player2_name: String,
        matchup_index: usize,
        total_matchups: usize,
    },
    MatchupResult {
        prompt_id: PromptId,
        prompt_text: String,
        player1_id: PlayerId,
        player1_name: String,
        player1_answer: String,
        player1_votes: u32,
        player1_points: u32,
        player2_id: PlayerId,
        player2_name: String,
        player2_answer: String,
        player2_votes: u32,
        player2_points: u32,
        is_jinx: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        quipwit: Option<u8>,
        scoreboard: Vec<ScoreRow>,
    },
    RoundScores {
        round: u32,
        scoreboard: Vec<ScoreRow>,
    },
    LastWitModeReveal {
        mode: FinaleMode,
    },
    LastLashPhase {
        prompt: String,
        mode: FinaleMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        letters: Option<Vec<char>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
        time_limit: u64,
    },
    LastLashPrompt {
        prompt: String,
        mode: FinaleMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        letters: Option<Vec<char>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
        time_limit: u64,
    },
    LastLashVoting {
        answers: Vec<AnonymousAnswer>,
        time_limit: u64,
    },
    LastLashResults {
        answers: Vec<FinaleAnswer>,
        scoreboard: Vec<ScoreRow>,
    },
    GameOver {
        winners: Vec<ScoreRow>,
        scoreboard: Vec<ScoreRow>,
    },
    PlayerSubmitted {
        player_id: PlayerId,
        name: String,
        submitted: usize,
        expected: usize,
    },
    PlayerVoted {
        player_id: PlayerId,
        name: String,
        votes_in: usize,
        expected: usize,
    },
    PlayerKicked {
        player_id: PlayerId,
    },
    GamePaused {
        #[serde(skip_serializing_if = "Option::is_none")]
        remaining: Option<u64>,
    },
    GameResumed {
        #[serde(skip_serializing_if = "Option::is_none")]
        remaining: Option<u64>,
    },
    TimerUpdate {
        remaining: u64,
    },
    RejoinSuccess {
        room_code: RoomCode,
        player_id: PlayerId,
        name: String,
        state: RoomState,
        players: Vec<PlayerView>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompts: Option<Vec<PromptCard>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        remaining: Option<u64>,
    },
    RejoinHostSuccess {
        room_code: RoomCode,
        state: RoomState,
        round: u32,
        players: Vec<PlayerView>,
        scoreboard: Vec<ScoreRow>,
        #[serde(skip_serializing_if = "Option::is_none")]
        remaining: Option<u64>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl ServerMsg {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code),
        }
    }
}

/// Messages sent from clients to server via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMsg {
    CreateRoom,
    JoinRoom {
        room_code: RoomCode,
        player_name: String,
    },
    Rejoin {
        room_code: RoomCode,
        player_id: PlayerId,
    },
    RejoinHost {
        room_code: RoomCode,
        host_id: HostId,
    },
    StartGame {
        room_code: RoomCode,
        #[serde(default)]
        theme: Option<String>,
    },
    SubmitAnswer {
        room_code: RoomCode,
        #[serde(default)]
        prompt_id: Option<PromptId>,
        answer: String,
        #[serde(default)]
        is_last_lash: bool,
    },
    SubmitVote {
        room_code: RoomCode,
        prompt_id: PromptId,
        vote: u8,
    },
    SubmitLastLashVotes {
        room_code: RoomCode,
        voted_for: PlayerId,
    },
    SkipPlayer {
        room_code: RoomCode,
        player_id: PlayerId,
    },
    KickPlayer {
        room_code: RoomCode,
        player_id: PlayerId,
    },
    PauseGame {
        room_code: RoomCode,
    },
    ResumeGame {
        room_code: RoomCode,
    },
    ExtendTime {
        room_code: RoomCode,
        #[serde(default)]
        seconds: Option<u64>,
    },
    EndGame {
        room_code: RoomCode,
    },
    ContinueLastWit {
        room_code: RoomCode,
    },
}

impl ClientMsg {
    /// The room code this message targets, if any.
    pub fn room_code(&self) -> Option<&str> {
        match self {
            Self::CreateRoom => None,
            Self::JoinRoom { room_code, .. }
            | Self::Rejoin { room_code, .. }
            | Self::RejoinHost { room_code, .. }
            | Self::StartGame { room_code, .. }
            | Self::SubmitAnswer { room_code, .. }
            | Self::SubmitVote { room_code, .. }
            | Self::SubmitLastLashVotes { room_code, .. }
            | Self::SkipPlayer { room_code, .. }
            | Self::KickPlayer { room_code, .. }
            | Self::PauseGame { room_code }
            | Self::ResumeGame { room_code }
            | Self::ExtendTime { room_code, .. }
            | Self::EndGame { room_code }
            | Self::ContinueLastWit { room_code } => Some(room_code.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_msg_wire_names_are_screaming_snake() {
        let msg = ServerMsg::RoomCreated {
            room_code: "ABCD".to_string(),
            host_id: "h1".to_string(),
            join_url: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ROOM_CREATED\""));

        let msg = ServerMsg::TimerUpdate { remaining: 10 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"TIMER_UPDATE\""));
    }

    #[test]
    fn client_msg_payload_keys_are_camel_case() {
        let msg: ClientMsg = serde_json::from_str(
            r#"{"type":"join_room","roomCode":"abcd","playerName":"Alice"}"#,
        )
        .unwrap();
        match msg {
            ClientMsg::JoinRoom {
                room_code,
                player_name,
            } => {
                assert_eq!(room_code, "abcd");
                assert_eq!(player_name, "Alice");
            }
            _ => panic!("expected join_room"),
        }
    }

    #[test]
    fn submit_answer_defaults_to_regular() {
        let msg: ClientMsg = serde_json::from_str(
            r#"{"type":"submit_answer","roomCode":"ABCD","promptId":"r1_p0","answer":"hi"}"#,
        )
        .unwrap();
        match msg {
            ClientMsg::SubmitAnswer { is_last_lash, .. } => assert!(!is_last_lash),
            _ => panic!("expected submit_answer"),
        }
    }

    #[test]
    fn server_msg_payload_keys_are_camel_case() {
        let msg = ServerMsg::RoomJoined {
            room_code: "ABCD".to_string(),
            player_id: "p1".to_string(),
            name: "Alice".to_string(),
            players: Vec::new(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"roomCode\":\"ABCD\""));
        assert!(json.contains("\"playerId\":\"p1\""));
    }

    #[test]
    fn room_state_wire_form() {
        assert_eq!(
            serde_json::to_string(&RoomState::LastLashVoting).unwrap(),
            "\"LAST_LASH_VOTING\""
        );
        assert_eq!(RoomState::LastLash.to_string(), "LAST_LASH");
    }
}
