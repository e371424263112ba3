//! Task cards: the persistent artifact shared between the engine and a
//! stage worker.
//!
//! A card lives in the worker's private workspace. The engine never reads
//! it in place: every read first pulls a copy into the orchestrator inbox
//! through a [`CardMailbox`], then parses the copy. Cards are markdown with
//! YAML frontmatter:
//!
//! ```text
//! ---
//! card_id: "card-1a2b3c4d"
//! epic_id: "epic-1a2b3c4d"
//! stage: "BUILD"
//! objective: "add feature X"
//! requirement_count: 2
//! created: "2026-10-14T09:00:00+00:00"
//! started:
//! completed:
//! signals: []
//! ---
//! ## Requirements
//! - [x] Implementation complete
//! - [ ] Tests passing locally
//!
//! ## Notes
//! ```

use async_trait::async_trait;
use gray_matter::engine::YAML;
use gray_matter::{Matter, ParsedEntity};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;

use crate::devops::docker;
use crate::devops::error::{EngineError, EngineResult};
use crate::devops::pipeline::OutcomeSignal;
use crate::devops::stages::StageType;

/// Directory inside a workspace that holds task cards
pub const CARD_DIR: &str = ".handy/cards";

/// Mount point of the epic workspace inside a sandbox container
pub const CONTAINER_WORKSPACE: &str = "/workspace";

static CHECKBOX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[-*]\s+\[([ xX])\]\s?(.*)$").unwrap());

/// One checklist entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub text: String,
    pub done: bool,
}

/// Parsed task card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCard {
    /// Card identifier (e.g., "card-1a2b3c4d")
    pub card_id: String,
    /// Epic the card belongs to
    pub epic_id: String,
    /// Stage the card coordinates
    pub stage_type: StageType,
    /// Objective handed to the worker
    pub objective: String,
    /// Ordered checklist; its length is fixed at creation
    pub requirements: Vec<Requirement>,
    /// Set by the engine when the card is created
    pub created: Option<String>,
    /// Set by the worker when it starts
    pub started: Option<String>,
    /// Set by the worker when it declares the stage finished
    pub completed: Option<String>,
    /// Freeform notes section
    pub notes: String,
    /// Outcome signals declared by the worker
    pub signals: Vec<OutcomeSignal>,
}

/// Why a card could not be parsed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CardParseError {
    /// Looks like a partial write; worth retrying
    #[error("torn card: {0}")]
    Torn(String),
    /// Structurally wrong in a way a retry will not fix
    #[error("malformed card: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct CardFrontmatter {
    card_id: String,
    epic_id: String,
    stage: String,
    #[serde(default)]
    objective: String,
    requirement_count: usize,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    started: Option<String>,
    #[serde(default)]
    completed: Option<String>,
    #[serde(default)]
    signals: Vec<String>,
}

#[derive(PartialEq)]
enum Section {
    Preamble,
    Requirements,
    Notes,
    Other,
}

fn quoted(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value))
}

fn optional_field(name: &str, value: &Option<String>) -> String {
    match value {
        Some(v) => format!("{}: {}\n", name, quoted(v)),
        None => format!("{}:\n", name),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Opening `---` followed by a closing `---` line.
fn frontmatter_closed(content: &str) -> bool {
    let mut lines = content.lines();
    match lines.next() {
        Some(first) if first.trim_end() == "---" => lines.any(|l| l.trim_end() == "---"),
        _ => false,
    }
}

impl TaskCard {
    /// Render the card artifact.
    pub fn render(&self) -> String {
        let signals: Vec<String> = self.signals.iter().map(|s| quoted(s.as_str())).collect();

        let mut out = String::from("---\n");
        out.push_str(&format!("card_id: {}\n", quoted(&self.card_id)));
        out.push_str(&format!("epic_id: {}\n", quoted(&self.epic_id)));
        out.push_str(&format!("stage: {}\n", quoted(self.stage_type.as_str())));
        out.push_str(&format!("objective: {}\n", quoted(&self.objective)));
        out.push_str(&format!("requirement_count: {}\n", self.requirements.len()));
        out.push_str(&optional_field("created", &self.created));
        out.push_str(&optional_field("started", &self.started));
        out.push_str(&optional_field("completed", &self.completed));
        out.push_str(&format!("signals: [{}]\n", signals.join(", ")));
        out.push_str("---\n## Requirements\n");
        for req in &self.requirements {
            out.push_str(&format!(
                "- [{}] {}\n",
                if req.done { "x" } else { " " },
                req.text
            ));
        }
        out.push_str("\n## Notes\n");
        if !self.notes.is_empty() {
            out.push_str(self.notes.trim_end());
            out.push('\n');
        }
        out
    }

    /// Parse a card artifact.
    pub fn parse(content: &str) -> Result<TaskCard, CardParseError> {
        if !frontmatter_closed(content) {
            return Err(CardParseError::Torn("frontmatter is not closed".to_string()));
        }

        let matter = Matter::<YAML>::new();
        let result: ParsedEntity<CardFrontmatter> = matter
            .parse(content)
            .map_err(|e| CardParseError::Torn(format!("Failed to parse frontmatter: {}", e)))?;
        let front = result
            .data
            .ok_or_else(|| CardParseError::Torn("No frontmatter found".to_string()))?;

        let stage_type = StageType::new(&front.stage).map_err(CardParseError::Malformed)?;

        let mut requirements = Vec::new();
        let mut notes = Vec::new();
        let mut section = Section::Preamble;
        for line in result.content.lines() {
            if let Some(heading) = line.trim().strip_prefix("## ") {
                section = match heading.trim().to_ascii_lowercase().as_str() {
                    "requirements" => Section::Requirements,
                    "notes" => Section::Notes,
                    _ => Section::Other,
                };
                continue;
            }
            match section {
                Section::Requirements => {
                    if let Some(caps) = CHECKBOX.captures(line) {
                        requirements.push(Requirement {
                            done: &caps[1] != " ",
                            text: caps[2].trim().to_string(),
                        });
                    }
                }
                Section::Notes => notes.push(line),
                Section::Preamble | Section::Other => {}
            }
        }

        if requirements.len() < front.requirement_count {
            return Err(CardParseError::Torn(format!(
                "{} of {} requirement lines present",
                requirements.len(),
                front.requirement_count
            )));
        }
        if requirements.len() > front.requirement_count {
            return Err(CardParseError::Malformed(format!(
                "{} requirement lines but requirement_count is {}",
                requirements.len(),
                front.requirement_count
            )));
        }

        let mut signals: Vec<OutcomeSignal> = Vec::new();
        for raw in &front.signals {
            match raw.parse::<OutcomeSignal>() {
                Ok(signal) if !signals.contains(&signal) => signals.push(signal),
                Ok(_) => {}
                Err(e) => log::warn!("Card {}: ignoring signal: {}", front.card_id, e),
            }
        }

        Ok(TaskCard {
            card_id: front.card_id,
            epic_id: front.epic_id,
            stage_type,
            objective: front.objective,
            requirements,
            created: non_empty(front.created),
            started: non_empty(front.started),
            completed: non_empty(front.completed),
            notes: notes.join("\n").trim().to_string(),
            signals,
        })
    }

    pub fn checked(&self) -> usize {
        self.requirements.iter().filter(|r| r.done).count()
    }
}

/// Completion status derived from a card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardStatus {
    /// The card could not be read
    Unknown,
    /// The card has no requirements, so completion cannot be judged
    Ambiguous,
    InProgress,
    /// Every requirement is checked and the completed timestamp is set
    Complete,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Ambiguous => "AMBIGUOUS",
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
        }
    }

    pub fn of(card: &TaskCard) -> Self {
        if card.requirements.is_empty() {
            Self::Ambiguous
        } else if card.requirements.iter().all(|r| r.done) && card.completed.is_some() {
            Self::Complete
        } else {
            Self::InProgress
        }
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A card as seen by one successful pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardView {
    pub card: TaskCard,
    pub status: CardStatus,
    pub checked: usize,
    pub total: usize,
    /// Modification time of the worker's copy (nanoseconds since the epoch)
    pub modified: Option<u64>,
}

impl CardView {
    pub fn new(card: TaskCard, modified: Option<u64>) -> Self {
        Self {
            status: CardStatus::of(&card),
            checked: card.checked(),
            total: card.requirements.len(),
            card,
            modified,
        }
    }

    /// Fraction of requirements checked (0.0 for an empty list).
    pub fn progress_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.checked as f64 / self.total as f64
        }
    }

    /// One-line summary kept on the run for escalations.
    pub fn summary(&self) -> String {
        format!("{} {}/{}", self.status, self.checked, self.total)
    }
}

/// Where a card lives on the worker side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardLocation {
    /// Host path of the epic workspace
    pub workspace: PathBuf,
    /// Card path relative to the workspace
    pub relative_path: PathBuf,
    /// Sandbox container name, when the worker runs in Docker
    pub container: Option<String>,
}

impl CardLocation {
    pub fn in_workspace(workspace: &Path, card_id: &str) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            relative_path: PathBuf::from(CARD_DIR).join(format!("{}.md", card_id)),
            container: None,
        }
    }

    pub fn in_container(workspace: &Path, card_id: &str, container: &str) -> Self {
        Self {
            container: Some(container.to_string()),
            ..Self::in_workspace(workspace, card_id)
        }
    }

    pub fn host_path(&self) -> PathBuf {
        self.workspace.join(&self.relative_path)
    }

    /// Path the worker sees.
    pub fn worker_path(&self) -> PathBuf {
        match self.container {
            Some(_) => Path::new(CONTAINER_WORKSPACE).join(&self.relative_path),
            None => self.host_path(),
        }
    }
}

/// Result of copying a card into the inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledCard {
    pub local_path: PathBuf,
    /// Modification time of the worker's copy (nanoseconds since the epoch)
    pub modified: Option<u64>,
}

/// Transport between the worker workspace and the orchestrator inbox
#[async_trait]
pub trait CardMailbox: Send + Sync {
    /// Write the initial card into the worker's workspace.
    async fn deliver(&self, location: &CardLocation, content: &str) -> EngineResult<()>;

    /// Copy the worker's card to `inbox_path`.
    async fn pull(&self, location: &CardLocation, inbox_path: &Path) -> EngineResult<PulledCard>;
}

fn modified_nanos(metadata: &std::fs::Metadata) -> Option<u64> {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
}

async fn write_card(path: &Path, content: &str) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}

/// Cards in a git worktree on this host
#[derive(Debug, Default)]
pub struct WorktreeMailbox;

#[async_trait]
impl CardMailbox for WorktreeMailbox {
    async fn deliver(&self, location: &CardLocation, content: &str) -> EngineResult<()> {
        write_card(&location.host_path(), content).await
    }

    async fn pull(&self, location: &CardLocation, inbox_path: &Path) -> EngineResult<PulledCard> {
        let source = location.host_path();
        let metadata = tokio::fs::metadata(&source).await.map_err(|e| {
            EngineError::CardUnreachable(format!("{}: {}", source.display(), e))
        })?;
        if let Some(parent) = inbox_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, inbox_path).await?;
        Ok(PulledCard {
            local_path: inbox_path.to_path_buf(),
            modified: modified_nanos(&metadata),
        })
    }
}

/// Cards inside a sandbox container whose `/workspace` is the epic workspace
#[derive(Debug, Default)]
pub struct DockerMailbox;

#[async_trait]
impl CardMailbox for DockerMailbox {
    async fn deliver(&self, location: &CardLocation, content: &str) -> EngineResult<()> {
        // The workspace is bind-mounted, so the host copy is the container copy
        write_card(&location.host_path(), content).await
    }

    async fn pull(&self, location: &CardLocation, inbox_path: &Path) -> EngineResult<PulledCard> {
        let container = location.container.clone().ok_or_else(|| {
            EngineError::config("Docker card transport needs a container name")
        })?;
        if let Some(parent) = inbox_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let source = location.worker_path().to_string_lossy().to_string();
        let dest = inbox_path.to_path_buf();
        tokio::task::spawn_blocking(move || docker::copy_from_container(&container, &source, &dest))
            .await
            .map_err(|e| EngineError::worker(format!("docker cp task failed: {}", e)))?
            .map_err(EngineError::CardUnreachable)?;

        let metadata = tokio::fs::metadata(inbox_path).await?;
        Ok(PulledCard {
            local_path: inbox_path.to_path_buf(),
            modified: modified_nanos(&metadata),
        })
    }
}

struct CardEntry {
    card: TaskCard,
    location: Option<CardLocation>,
    last_view: Option<CardView>,
    /// The most recent pull gave up as unreachable
    unreachable: bool,
}

/// Creates cards and reads them back through the mailbox.
pub struct TaskCardStore {
    mailbox: Arc<dyn CardMailbox>,
    inbox_dir: PathBuf,
    parse_retries: u32,
    retry_backoff: Duration,
    cards: HashMap<String, CardEntry>,
}

impl TaskCardStore {
    pub fn new(
        mailbox: Arc<dyn CardMailbox>,
        inbox_dir: PathBuf,
        parse_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            mailbox,
            inbox_dir,
            parse_retries,
            retry_backoff,
            cards: HashMap::new(),
        }
    }

    /// Create a card with every requirement unchecked. Returns the card id.
    pub fn create_card(
        &mut self,
        epic_id: &str,
        stage_type: &StageType,
        objective: &str,
        requirements: &[String],
        notes: &str,
    ) -> String {
        let short = uuid::Uuid::new_v4().simple().to_string();
        let card_id = format!("card-{}", &short[..8]);
        let card = TaskCard {
            card_id: card_id.clone(),
            epic_id: epic_id.to_string(),
            stage_type: stage_type.clone(),
            objective: objective.to_string(),
            requirements: requirements
                .iter()
                .map(|text| Requirement {
                    text: text.trim().to_string(),
                    done: false,
                })
                .collect(),
            created: Some(chrono::Utc::now().to_rfc3339()),
            started: None,
            completed: None,
            notes: notes.trim().to_string(),
            signals: Vec::new(),
        };
        self.cards.insert(
            card_id.clone(),
            CardEntry {
                card,
                location: None,
                last_view: None,
                unreachable: false,
            },
        );
        card_id
    }

    pub fn card(&self, card_id: &str) -> Option<&TaskCard> {
        self.cards.get(card_id).map(|entry| &entry.card)
    }

    /// Deliver the initial card into the worker's workspace. Returns the path the worker sees.
    pub async fn publish(
        &mut self,
        card_id: &str,
        location: CardLocation,
    ) -> EngineResult<PathBuf> {
        let entry = self
            .cards
            .get_mut(card_id)
            .ok_or_else(|| EngineError::not_found(format!("card {}", card_id)))?;
        self.mailbox.deliver(&location, &entry.card.render()).await?;
        let worker_path = location.worker_path();
        entry.location = Some(location);
        log::debug!("Published card {} to {}", card_id, worker_path.display());
        Ok(worker_path)
    }

    /// Take over a card published by an earlier process. The worker's
    /// current copy becomes the baseline for later reads.
    pub async fn reattach(
        &mut self,
        card_id: &str,
        location: CardLocation,
    ) -> EngineResult<CardView> {
        let inbox_path = self.inbox_dir.join(format!("{}.md", card_id));
        let pulled = self.mailbox.pull(&location, &inbox_path).await?;
        let content = tokio::fs::read_to_string(&pulled.local_path).await?;
        let card = TaskCard::parse(&content)
            .map_err(|e| EngineError::CardCorruption(format!("{}: {}", card_id, e)))?;
        if card.card_id != card_id {
            return Err(EngineError::CardCorruption(format!(
                "{} holds card {}",
                location.host_path().display(),
                card.card_id
            )));
        }

        let view = CardView::new(card.clone(), pulled.modified);
        self.cards.insert(
            card_id.to_string(),
            CardEntry {
                card,
                location: Some(location),
                last_view: Some(view.clone()),
                unreachable: false,
            },
        );
        log::debug!("Reattached card {} ({})", card_id, view.summary());
        Ok(view)
    }

    /// Status from the last accepted view. `Unknown` before the first read
    /// and while the latest pull could not reach the card.
    pub fn card_status(&self, card_id: &str) -> CardStatus {
        match self.cards.get(card_id) {
            Some(entry) if !entry.unreachable => entry
                .last_view
                .as_ref()
                .map(|view| view.status)
                .unwrap_or(CardStatus::Unknown),
            _ => CardStatus::Unknown,
        }
    }

    pub fn forget(&mut self, card_id: &str) {
        self.cards.remove(card_id);
    }

    /// Pull the worker's card into the inbox, parse it and check it against
    /// the last accepted view.
    ///
    /// Torn reads and failed pulls are retried with exponential backoff, then
    /// surface as `CardUnreachable`. A field moving backwards is
    /// `CardCorruption` and is never retried.
    pub async fn pull_and_read(&mut self, card_id: &str) -> EngineResult<CardView> {
        let (created, location, previous) = {
            let entry = self
                .cards
                .get(card_id)
                .ok_or_else(|| EngineError::not_found(format!("card {}", card_id)))?;
            let location = entry.location.clone().ok_or_else(|| {
                EngineError::invalid_transition(format!("card {} was never published", card_id))
            })?;
            (entry.card.clone(), location, entry.last_view.clone())
        };
        let inbox_path = self.inbox_dir.join(format!("{}.md", card_id));

        let mut delay = self.retry_backoff;
        let mut last_error = String::new();
        let mut mismatch = false;

        for attempt in 0..=self.parse_retries {
            if attempt > 0 {
                log::debug!(
                    "Card {} read attempt {} failed ({}), retrying in {:?}",
                    card_id,
                    attempt,
                    last_error,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            let pulled = match self.mailbox.pull(&location, &inbox_path).await {
                Ok(pulled) => pulled,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            let content = match tokio::fs::read_to_string(&pulled.local_path).await {
                Ok(content) => content,
                Err(e) => {
                    last_error = format!("Failed to read inbox copy: {}", e);
                    continue;
                }
            };

            let card = match TaskCard::parse(&content) {
                Ok(card) => card,
                Err(CardParseError::Torn(reason)) => {
                    last_error = reason;
                    continue;
                }
                Err(CardParseError::Malformed(reason)) => {
                    return Err(EngineError::CardCorruption(format!("{}: {}", card_id, reason)));
                }
            };

            if let Err(reason) = same_requirements(&created, &card) {
                mismatch = true;
                last_error = reason;
                continue;
            }
            mismatch = false;

            let baseline = previous.as_ref().map(|v| &v.card).unwrap_or(&created);
            check_monotonic(baseline, &card)
                .map_err(|reason| EngineError::CardCorruption(format!("{}: {}", card_id, reason)))?;

            let view = CardView::new(card, pulled.modified);
            if let Some(entry) = self.cards.get_mut(card_id) {
                entry.last_view = Some(view.clone());
                entry.unreachable = false;
            }
            return Ok(view);
        }

        if mismatch {
            Err(EngineError::CardCorruption(format!("{}: {}", card_id, last_error)))
        } else {
            if let Some(entry) = self.cards.get_mut(card_id) {
                entry.unreachable = true;
            }
            Err(EngineError::CardUnreachable(format!(
                "{} unreadable after {} attempts: {}",
                card_id,
                self.parse_retries + 1,
                last_error
            )))
        }
    }
}

/// Identity fields and requirement texts must match the card as created.
fn same_requirements(created: &TaskCard, card: &TaskCard) -> Result<(), String> {
    if card.card_id != created.card_id
        || card.epic_id != created.epic_id
        || card.stage_type != created.stage_type
    {
        return Err(format!(
            "card identity changed to {}/{}/{}",
            card.card_id, card.epic_id, card.stage_type
        ));
    }
    if card.requirements.len() != created.requirements.len() {
        return Err(format!(
            "requirement list changed length from {} to {}",
            created.requirements.len(),
            card.requirements.len()
        ));
    }
    for (i, (a, b)) in created.requirements.iter().zip(&card.requirements).enumerate() {
        if a.text != b.text {
            return Err(format!("requirement {} text changed to '{}'", i + 1, b.text));
        }
    }
    Ok(())
}

/// Checked boxes stay checked, timestamps stay set, signals are never removed.
fn check_monotonic(before: &TaskCard, after: &TaskCard) -> Result<(), String> {
    for (i, (a, b)) in before.requirements.iter().zip(&after.requirements).enumerate() {
        if a.done && !b.done {
            return Err(format!("requirement {} was unchecked", i + 1));
        }
    }
    for (name, a, b) in [
        ("created", &before.created, &after.created),
        ("started", &before.started, &after.started),
        ("completed", &before.completed, &after.completed),
    ] {
        if let Some(prev) = a {
            match b {
                None => return Err(format!("{} timestamp was cleared", name)),
                Some(next) if next != prev => {
                    return Err(format!("{} timestamp changed from {} to {}", name, prev, next))
                }
                _ => {}
            }
        }
    }
    if let Some(missing) = before.signals.iter().find(|s| !after.signals.contains(s)) {
        return Err(format!("signal {} was removed", missing));
    }
    Ok(())
}
