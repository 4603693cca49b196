use async_trait::async_trait;
use dashmap::DashMap;
use scanhost_proto::wire::CorrelationId;
use std::sync::Mutex;
use tracing::debug;

/// One user-facing notice or question, keyed by the workflow it belongs to.
///
/// A prompt with choices waits for the user to pick an index; one without is
/// informational. Presenting a second prompt under the same id replaces the
/// first, so at most one prompt per workflow is ever visible.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub id: CorrelationId,
    pub title: String,
    pub message: String,
    pub choices: Vec<String>,
    /// Render as a failure.
    pub error: bool,
    /// Keep on screen until the user reacts.
    pub sticky: bool,
}

impl Prompt {
    pub fn notice(id: CorrelationId, title: impl Into<String>, message: impl Into<String>) -> Self {
        Prompt {
            id,
            title: title.into(),
            message: message.into(),
            choices: vec![],
            error: false,
            sticky: false,
        }
    }

    pub fn failure(id: CorrelationId, title: impl Into<String>, message: impl Into<String>) -> Self {
        Prompt {
            id,
            title: title.into(),
            message: message.into(),
            choices: vec![],
            error: true,
            sticky: true,
        }
    }

    pub fn ask(
        id: CorrelationId,
        title: impl Into<String>,
        message: impl Into<String>,
        choices: Vec<String>,
    ) -> Self {
        Prompt {
            id,
            title: title.into(),
            message: message.into(),
            choices,
            error: false,
            sticky: true,
        }
    }

    pub fn needs_choice(&self) -> bool {
        !self.choices.is_empty()
    }
}

/// Where prompts go. The presenter only displays; chosen indices come back
/// to the correlator as events from whoever drives the UI.
#[async_trait]
pub trait PromptPresenter: Send + Sync {
    /// Show `prompt`, replacing any visible prompt with the same id.
    async fn present(&self, prompt: Prompt);

    /// Remove the prompt for `id` if one is still visible.
    async fn dismiss(&self, id: &CorrelationId);

    /// Remove every visible prompt. Called once at startup so stale prompts
    /// from a previous run cannot collect choices nothing is waiting for.
    async fn dismiss_all(&self);
}

/// Terminal presenter. Questions get a short reply tag; the interactive
/// loop turns `"<tag> <number>"` lines back into choice events.
pub struct ConsolePresenter {
    tags: DashMap<String, CorrelationId>,
    ids: DashMap<CorrelationId, String>,
}

impl ConsolePresenter {
    pub fn new() -> Self {
        ConsolePresenter {
            tags: DashMap::new(),
            ids: DashMap::new(),
        }
    }

    /// Map a reply tag typed by the user back to its workflow.
    pub fn resolve_tag(&self, tag: &str) -> Option<CorrelationId> {
        self.tags.get(tag).map(|entry| entry.value().clone())
    }

    /// Parse a `"<tag> <number>"` input line. A bare number is accepted
    /// while exactly one question is open.
    pub fn parse_choice(&self, line: &str) -> Option<(CorrelationId, usize)> {
        let mut parts = line.split_whitespace();
        let first = parts.next()?;
        match parts.next() {
            Some(second) => {
                let choice = second.parse::<usize>().ok()?;
                let id = self.resolve_tag(first)?;
                Some((id, choice))
            }
            None => {
                let choice = first.parse::<usize>().ok()?;
                if self.tags.len() != 1 {
                    return None;
                }
                let id = self.tags.iter().next()?.value().clone();
                Some((id, choice))
            }
        }
    }

    fn register_tag(&self, id: &CorrelationId) -> String {
        // Short prefixes are unique enough; extend on the rare collision.
        let full = id.to_string();
        let mut end = 8.min(full.len());
        loop {
            let tag = full[..end].to_string();
            // Decide on the read guard, then let it go: inserting while it
            // is held would block on its own shard.
            let taken_by_other = self
                .tags
                .get(&tag)
                .map(|existing| existing.value() != id)
                .unwrap_or(false);
            if taken_by_other && end < full.len() {
                end += 1;
                continue;
            }
            self.tags.insert(tag.clone(), id.clone());
            self.ids.insert(id.clone(), tag.clone());
            return tag;
        }
    }

    fn drop_tag(&self, id: &CorrelationId) {
        if let Some((_, tag)) = self.ids.remove(id) {
            self.tags.remove(&tag);
        }
    }
}

impl Default for ConsolePresenter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PromptPresenter for ConsolePresenter {
    async fn present(&self, prompt: Prompt) {
        self.drop_tag(&prompt.id);
        let marker = if prompt.error {
            "[!]"
        } else if prompt.needs_choice() {
            "[?]"
        } else {
            "[i]"
        };
        println!("{} {}: {}", marker, prompt.title, prompt.message);
        if prompt.needs_choice() {
            for (i, choice) in prompt.choices.iter().enumerate() {
                println!("      {i}) {choice}");
            }
            let tag = self.register_tag(&prompt.id);
            println!("      reply with: {tag} <number>");
        }
    }

    async fn dismiss(&self, id: &CorrelationId) {
        self.drop_tag(id);
    }

    async fn dismiss_all(&self) {
        debug!("clearing {} stale prompt tag(s)", self.tags.len());
        self.tags.clear();
        self.ids.clear();
    }
}

/// Recording presenter for tests: keeps the full presentation history and
/// the currently visible prompt per id.
#[derive(Default)]
pub struct MemoryPresenter {
    visible: DashMap<CorrelationId, Prompt>,
    history: Mutex<Vec<Prompt>>,
    dismissed: Mutex<Vec<CorrelationId>>,
}

impl MemoryPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visible(&self, id: &CorrelationId) -> Option<Prompt> {
        self.visible.get(id).map(|entry| entry.value().clone())
    }

    pub fn visible_count(&self) -> usize {
        self.visible.len()
    }

    pub fn history(&self) -> Vec<Prompt> {
        self.history.lock().unwrap().clone()
    }

    pub fn history_for(&self, id: &CorrelationId) -> Vec<Prompt> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|p| &p.id == id)
            .cloned()
            .collect()
    }

    pub fn dismissed(&self) -> Vec<CorrelationId> {
        self.dismissed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PromptPresenter for MemoryPresenter {
    async fn present(&self, prompt: Prompt) {
        self.history.lock().unwrap().push(prompt.clone());
        self.visible.insert(prompt.id.clone(), prompt);
    }

    async fn dismiss(&self, id: &CorrelationId) {
        if self.visible.remove(id).is_some() {
            self.dismissed.lock().unwrap().push(id.clone());
        }
    }

    async fn dismiss_all(&self) {
        self.visible.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn represent_replaces_instead_of_stacking() {
        let presenter = MemoryPresenter::new();
        let id = CorrelationId::mint();

        presenter
            .present(Prompt::ask(id.clone(), "First", "pick", vec!["a".into(), "b".into()]))
            .await;
        presenter
            .present(Prompt::notice(id.clone(), "Second", "done"))
            .await;

        assert_eq!(presenter.visible_count(), 1);
        assert_eq!(presenter.visible(&id).unwrap().title, "Second");
        assert_eq!(presenter.history_for(&id).len(), 2);
    }

    #[tokio::test]
    async fn console_tags_map_back_to_ids() {
        let presenter = ConsolePresenter::new();
        let id = CorrelationId::mint();
        presenter
            .present(Prompt::ask(id.clone(), "Q", "pick", vec!["x".into()]))
            .await;

        let tag = id.to_string()[..8].to_string();
        assert_eq!(presenter.resolve_tag(&tag), Some(id.clone()));
        assert_eq!(presenter.parse_choice(&format!("{tag} 0")), Some((id.clone(), 0)));
        assert_eq!(presenter.parse_choice("bogus 0"), None);
        // With a single open question a bare number is enough.
        assert_eq!(presenter.parse_choice("1"), Some((id.clone(), 1)));

        presenter.dismiss(&id).await;
        assert_eq!(presenter.resolve_tag(&tag), None);
    }

    #[tokio::test]
    async fn colliding_tags_extend_until_unique() {
        let presenter = ConsolePresenter::new();
        let long = CorrelationId::from("abcdefgh-1111");
        let longer = CorrelationId::from("abcdefgh-2222");
        presenter
            .present(Prompt::ask(long.clone(), "Q", "pick", vec!["x".into()]))
            .await;
        presenter
            .present(Prompt::ask(longer.clone(), "Q", "pick", vec!["x".into()]))
            .await;

        assert_eq!(presenter.resolve_tag("abcdefgh"), Some(long.clone()));
        assert_eq!(presenter.resolve_tag("abcdefgh-"), Some(longer.clone()));

        // An id that is itself an already taken tag has no room to extend
        // and takes the tag over instead of spinning.
        let short = CorrelationId::from("abcdefgh");
        presenter
            .present(Prompt::ask(short.clone(), "Q", "pick", vec!["x".into()]))
            .await;
        assert_eq!(presenter.resolve_tag("abcdefgh"), Some(short));
    }
}
