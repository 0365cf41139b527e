use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;

use crate::types::FinaleMode;

/// What the finale asks of every player.
#[derive(Debug, Clone)]
pub struct FinaleSpec {
    pub prompt: String,
    pub mode: FinaleMode,
    pub letters: Option<Vec<char>>,
    pub instructions: Option<String>,
}

/// Produces prompt text for rooms. Implementations must return exactly
/// `count` distinct strings not present in `seen`, and record what they
/// return into `seen`. The room engine treats this as infallible; error
/// handling lives behind the fallback wrapper.
#[async_trait]
pub trait PromptSource: Send + Sync {
    async fn generate_prompts(
        &self,
        count: usize,
        seen: &mut HashSet<String>,
        theme: Option<&str>,
    ) -> Vec<String>;

    async fn generate_last_lash(
        &self,
        seen: &mut HashSet<String>,
        theme: Option<&str>,
    ) -> FinaleSpec;
}

// ─── Local template generator ─────────────────────────────────────

const TEMPLATES: &[&str] = &[
    "The worst thing to say to {}",
    "The real reason {} is always late",
    "A terrible name for {}",
    "What {} is secretly thinking about",
    "The most embarrassing thing to find in {}",
    "A rejected slogan for {}",
    "The first rule of a club for {}",
    "What you should never bring to {}",
    "The surprising hobby of {}",
    "A bad gift for {}",
    "The worst possible mascot for {}",
    "What {} smells like",
    "A dealbreaker on a first date with {}",
    "The headline after {} wins the lottery",
    "Something you shouldn't whisper to {}",
    "The one thing {} cannot resist",
    "An unfortunate tattoo for {}",
    "The secret ingredient in {}",
    "A weird thing to collect instead of {}",
    "What {} dreams about at night",
    "The last words of {}",
    "A suspicious excuse from {}",
    "The best way to annoy {}",
    "What ruined the wedding of {}",
    "An unlikely superpower for {}",
];

const FILL_WORDS: &[&str] = &[
    "your dentist",
    "a pirate captain",
    "the school principal",
    "an overly friendly neighbor",
    "a retired wizard",
    "the world's strongest baby",
    "a conspiracy theorist",
    "your future in-laws",
    "a sleep-deprived astronaut",
    "the office printer",
    "a haunted vending machine",
    "your gym teacher",
    "a very small dog",
    "the royal family",
    "an undercover robot",
    "a mall Santa",
    "your barber",
    "a time traveler from 1875",
    "the neighborhood raccoon",
    "a motivational speaker",
    "an amateur ventriloquist",
    "the night-shift security guard",
    "a soup enthusiast",
    "your weird uncle",
    "a substitute teacher",
    "the last person on Earth",
    "a ghost with unfinished business",
    "an extremely polite viking",
    "the tooth fairy",
    "a llama farmer",
];

const THEMED_TEMPLATES: &[&str] = &[
    "The worst thing about {theme}: {}",
    "In the world of {theme}, the real reason {} is famous",
    "A {theme}-themed birthday party needs {}",
    "What {} thinks about {theme}",
];

const FLASHBACK_SETUPS: &[&str] = &[
    "The lights went out, the crowd gasped, and then...",
    "I opened the fridge at 3am and couldn't believe my eyes...",
    "The captain's voice crackled over the intercom one last time...",
    "Everything was going fine until the mayor grabbed the microphone...",
    "The fortune cookie was oddly specific. It said...",
    "Ten years after the town banned karaoke, someone finally...",
    "The instructions on the box were clear, and yet...",
    "My grandmother leaned in close and whispered...",
];

/// Offline prompt generator built from template and fill-word banks.
pub struct TemplatePromptSource;

impl TemplatePromptSource {
    fn compose(theme: Option<&str>) -> String {
        let mut rng = rand::rng();
        let word = FILL_WORDS.choose(&mut rng).expect("fill word bank empty");
        match theme {
            Some(theme) if rng.random_bool(0.5) => {
                let template = THEMED_TEMPLATES
                    .choose(&mut rng)
                    .expect("themed bank empty");
                template.replace("{theme}", theme).replace("{}", word)
            }
            _ => {
                let template = TEMPLATES.choose(&mut rng).expect("template bank empty");
                template.replace("{}", word)
            }
        }
    }

    fn fill(count: usize, seen: &mut HashSet<String>, theme: Option<&str>) -> Vec<String> {
        let mut out = Vec::with_capacity(count);
        // The bank product is far larger than any game consumes, so a
        // bounded rejection loop always terminates in practice.
        let mut attempts = 0;
        while out.len() < count && attempts < count * 200 {
            attempts += 1;
            let prompt = Self::compose(theme);
            if seen.insert(prompt.clone()) {
                out.push(prompt);
            }
        }
        // Exhausted bank: disambiguate with a counter rather than shorting
        // the caller.
        let mut n = 2;
        while out.len() < count {
            let prompt = format!("{} (part {})", Self::compose(theme), n);
            n += 1;
            if seen.insert(prompt.clone()) {
                out.push(prompt);
            }
        }
        out
    }

    fn finale(seen: &mut HashSet<String>) -> FinaleSpec {
        let mut rng = rand::rng();
        let mode = *[FinaleMode::Flashback, FinaleMode::WordLash, FinaleMode::AcroLash]
            .choose(&mut rng)
            .expect("finale mode bank empty");
        match mode {
            FinaleMode::Flashback => {
                let setup = FLASHBACK_SETUPS
                    .iter()
                    .find(|s| !seen.contains(**s))
                    .copied()
                    .unwrap_or(FLASHBACK_SETUPS[0]);
                seen.insert(setup.to_string());
                FinaleSpec {
                    prompt: setup.to_string(),
                    mode,
                    letters: None,
                    instructions: Some("Finish the story.".to_string()),
                }
            }
            FinaleMode::WordLash => {
                let letters = random_letters(&mut rng, 3);
                let prompt = format!(
                    "Write a phrase where the words start with {}",
                    spell_letters(&letters)
                );
                seen.insert(prompt.clone());
                FinaleSpec {
                    prompt,
                    mode,
                    letters: Some(letters),
                    instructions: Some(
                        "Each word must start with the matching letter, in order.".to_string(),
                    ),
                }
            }
            FinaleMode::AcroLash => {
                let len = rng.random_range(3..=5);
                let letters = random_letters(&mut rng, len);
                let prompt = format!(
                    "What does the acronym {} stand for?",
                    letters.iter().collect::<String>()
                );
                seen.insert(prompt.clone());
                FinaleSpec {
                    prompt,
                    mode,
                    letters: Some(letters),
                    instructions: Some(
                        "One word per letter, starting with that letter.".to_string(),
                    ),
                }
            }
        }
    }
}

#[async_trait]
impl PromptSource for TemplatePromptSource {
    async fn generate_prompts(
        &self,
        count: usize,
        seen: &mut HashSet<String>,
        theme: Option<&str>,
    ) -> Vec<String> {
        Self::fill(count, seen, theme)
    }

    async fn generate_last_lash(
        &self,
        seen: &mut HashSet<String>,
        _theme: Option<&str>,
    ) -> FinaleSpec {
        Self::finale(seen)
    }
}

/// Uppercase letters with no two consecutive repeats.
fn random_letters(rng: &mut impl Rng, len: usize) -> Vec<char> {
    let mut letters: Vec<char> = Vec::with_capacity(len);
    while letters.len() < len {
        let c = char::from(b'A' + rng.random_range(0..26));
        if letters.last() == Some(&c) {
            continue;
        }
        letters.push(c);
    }
    letters
}

fn spell_letters(letters: &[char]) -> String {
    letters
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ─── Remote generator (Anthropic) ─────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("API request failed: {0}")]
    Api(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Response parsing failed: {0}")]
    Parse(String),
}

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const REMOTE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Prompt generation via the Anthropic Messages API.
pub struct RemoteGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl RemoteGenerator {
    pub fn new(api_key: String) -> Self {
        let model = std::env::var("QUIPWIT_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        }
    }

    async fn complete(&self, prompt: String, max_tokens: u32) -> Result<String, RemoteError> {
        let body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let request = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send();

        let response = tokio::time::timeout(REMOTE_TIMEOUT, request)
            .await
            .map_err(|_| RemoteError::Timeout(REMOTE_TIMEOUT))?
            .map_err(|e| RemoteError::Api(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api(format!("{}: {}", status, detail)));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))?;

        parsed
            .content
            .first()
            .map(|c| c.text.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RemoteError::Parse("empty response content".to_string()))
    }

    /// Ask for a batch of prompts; may return fewer than requested.
    pub async fn generate_prompts(
        &self,
        count: usize,
        seen: &HashSet<String>,
        theme: Option<&str>,
    ) -> Result<Vec<String>, RemoteError> {
        let theme_clause = theme
            .map(|t| format!(" Theme them around: {}.", t))
            .unwrap_or_default();
        // Keep the avoid list short; the caller filters duplicates anyway.
        let avoid: Vec<&str> = seen.iter().map(String::as_str).take(30).collect();
        let avoid_clause = if avoid.is_empty() {
            String::new()
        } else {
            format!(" Avoid anything similar to: {}.", avoid.join(" | "))
        };

        let instruction = format!(
            "Write {count} short, funny fill-in-the-blank prompts for a party game \
             where two players write rival punchlines.{theme_clause}{avoid_clause} \
             Respond with a JSON array of strings and nothing else."
        );

        let text = self.complete(instruction, 1024).await?;
        let prompts = parse_string_array(&text)?;

        Ok(prompts
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty() && !seen.contains(p))
            .take(count)
            .collect())
    }

    /// Generate a finale prompt for the given mode.
    pub async fn generate_finale_prompt(
        &self,
        mode: FinaleMode,
        theme: Option<&str>,
    ) -> Result<String, RemoteError> {
        let theme_clause = theme
            .map(|t| format!(" Theme it around: {}.", t))
            .unwrap_or_default();
        let ask = match mode {
            FinaleMode::Flashback => {
                "Write one short story setup for a party game finale, ending on a \
                 cliffhanger with an ellipsis, that every player will finish."
            }
            FinaleMode::WordLash => {
                "Write one short, punchy premise for a party game finale where \
                 players must answer with a phrase built from given letters."
            }
            FinaleMode::AcroLash => {
                "Write one short, punchy premise for a party game finale where \
                 players must expand a mystery acronym."
            }
        };
        let instruction = format!("{ask}{theme_clause} Respond with the prompt text only.");
        self.complete(instruction, 256).await
    }

    /// Minimal live call used to validate an API key.
    pub async fn validate(&self) -> Result<(), RemoteError> {
        self.complete("Reply with the word ok.".to_string(), 8)
            .await
            .map(|_| ())
    }
}

/// Extract a JSON string array from model output, tolerating prose around it.
fn parse_string_array(text: &str) -> Result<Vec<String>, RemoteError> {
    if let Ok(arr) = serde_json::from_str::<Vec<String>>(text.trim()) {
        return Ok(arr);
    }
    let start = text.find('[');
    let end = text.rfind(']');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(arr) = serde_json::from_str::<Vec<String>>(&text[start..=end]) {
                return Ok(arr);
            }
        }
    }
    Err(RemoteError::Parse(format!(
        "no JSON string array in: {}",
        text.chars().take(120).collect::<String>()
    )))
}

// ─── Fallback composition ─────────────────────────────────────────

/// Remote generation shadowed by the local banks: any error or shortfall is
/// topped up locally, so rooms never see a short batch.
pub struct FallbackPromptSource {
    remote: Option<RemoteGenerator>,
}

impl FallbackPromptSource {
    pub fn new(remote: Option<RemoteGenerator>) -> Self {
        Self { remote }
    }

    pub fn local_only() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl PromptSource for FallbackPromptSource {
    async fn generate_prompts(
        &self,
        count: usize,
        seen: &mut HashSet<String>,
        theme: Option<&str>,
    ) -> Vec<String> {
        let mut out = Vec::with_capacity(count);

        if let Some(remote) = &self.remote {
            match remote.generate_prompts(count, seen, theme).await {
                Ok(prompts) => {
                    for prompt in prompts {
                        if seen.insert(prompt.clone()) {
                            out.push(prompt);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Remote prompt generation failed, using local bank: {}", e);
                }
            }
        }

        if out.len() < count {
            out.extend(TemplatePromptSource::fill(count - out.len(), seen, theme));
        }
        out
    }

    async fn generate_last_lash(
        &self,
        seen: &mut HashSet<String>,
        theme: Option<&str>,
    ) -> FinaleSpec {
        let mut spec = TemplatePromptSource::finale(seen);

        // Flashback is the only mode whose prompt text benefits from the
        // remote generator; letter modes are structural.
        if spec.mode == FinaleMode::Flashback {
            if let Some(remote) = &self.remote {
                match remote.generate_finale_prompt(spec.mode, theme).await {
                    Ok(prompt) if !seen.contains(&prompt) => {
                        seen.insert(prompt.clone());
                        spec.prompt = prompt;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Remote finale generation failed: {}", e);
                    }
                }
            }
        }
        spec
    }
}
