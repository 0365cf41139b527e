use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

// ─── Game tunables ────────────────────────────────────────────────

pub const MIN_PLAYERS: usize = 3;
pub const MAX_PLAYERS: usize = 8;
pub const ROUNDS_PER_GAME: u32 = 2;
pub const PROMPTS_PER_PLAYER: usize = 2;

pub const ANSWER_TIME: u64 = 90;
pub const VOTE_TIME: u64 = 30;
pub const LAST_LASH_ANSWER_TIME: u64 = 90;
pub const LAST_LASH_VOTE_TIME: u64 = 45;

pub const MAX_ANSWER_LENGTH: usize = 100;
pub const MAX_NAME_LENGTH: usize = 15;
pub const MAX_THEME_LENGTH: usize = 120;
pub const ROOM_CODE_LENGTH: usize = 4;

pub const POINTS_PER_VOTE: u32 = 100;
pub const QUIPWIT_BONUS: u32 = 100;
pub const LAST_LASH_FIRST: u32 = 300;

/// Answer stored when a player submits nothing before the deadline.
pub const NO_ANSWER: &str = "[No answer]";
/// Answer stored when the host skips a player.
pub const SKIPPED: &str = "[Skipped]";

/// Rooms older than this are reaped regardless of activity.
pub const ROOM_MAX_AGE: Duration = Duration::from_secs(60 * 60);
/// How often the reaper sweeps the registry.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Pause between VOTING_PHASE and the first VOTE_MATCHUP.
pub const VOTE_GRACE: Duration = Duration::from_millis(1500);
/// How long a MATCHUP_RESULT stays on screen.
pub const MATCHUP_RESULT_HOLD: Duration = Duration::from_secs(4);
/// How long ROUND_SCORES stays on screen.
pub const ROUND_SCORES_HOLD: Duration = Duration::from_secs(5);
/// How long LAST_LASH_RESULTS stays on screen before GAME_OVER.
pub const LAST_LASH_RESULTS_HOLD: Duration = Duration::from_secs(8);

/// Default added by extend_time when the host sends no amount.
pub const DEFAULT_EXTEND_SECONDS: u64 = 30;

// ─── Persistent config ────────────────────────────────────────────

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

fn api_key_path() -> PathBuf {
    config_path("apikey")
}

/// Initialize the config directory if missing.
pub fn init() {
    let base = config_path("");
    if !base.exists() {
        if let Err(e) = fs::create_dir_all(&base) {
            tracing::warn!("Failed to create config directory: {}", e);
        }
    }
}

/// Process-wide Anthropic API key store.
///
/// Reads are cheap snapshots; `set` takes the lock and optionally persists
/// the key to disk. The `ANTHROPIC_API_KEY` environment variable overrides
/// any persisted value for the lifetime of the process.
pub struct ApiKeyStore {
    key: RwLock<Option<String>>,
}

impl ApiKeyStore {
    /// Load the store, preferring the environment over the persisted file.
    pub fn load() -> Self {
        let from_env = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        let key = from_env.or_else(|| {
            fs::read_to_string(api_key_path())
                .ok()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
        });

        Self {
            key: RwLock::new(key),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.key.read().expect("api key lock poisoned").clone()
    }

    pub fn has(&self) -> bool {
        self.key.read().expect("api key lock poisoned").is_some()
    }

    /// Store a key in memory, writing it through to disk when `persist`.
    pub fn set(&self, key: String, persist: bool) -> Result<(), std::io::Error> {
        let mut guard = self.key.write().expect("api key lock poisoned");
        if persist {
            init();
            fs::write(api_key_path(), &key)?;
        }
        *guard = Some(key);
        Ok(())
    }
}

/// Listening port, from the PORT environment variable (default 3000).
pub fn port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000)
}
