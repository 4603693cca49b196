use scanhost_proto::wire::{
    self, CorrelationId, FileAction, HostRequest, ScanVerdict, ServiceReply,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, ChannelEvent, ChannelManager};
use crate::prompt::{Prompt, PromptPresenter};
use crate::settings::Settings;
use crate::workflow::store::{CandidateFile, CorrelationEntry, CorrelationStore, Stage};

/// Everything the correlator reacts to, from every source, in one queue.
/// One consumer task processes these strictly in order, which is the whole
/// concurrency story: no locks, no torn updates, no racing prompts.
#[derive(Debug)]
pub enum WorkflowEvent {
    /// The download watcher saw a finished file.
    Detected(CandidateFile),
    /// The user asked for a file to be analyzed directly, skipping the
    /// quarantine question.
    AnalyzeRequested(CandidateFile),
    /// The user picked a choice on a prompt.
    Choice { id: CorrelationId, choice: usize },
    /// The channel layer produced a reply or lost the link.
    Channel(ChannelEvent),
}

impl From<ChannelEvent> for WorkflowEvent {
    fn from(ev: ChannelEvent) -> Self {
        WorkflowEvent::Channel(ev)
    }
}

/// Choice labels offered for a verdict, in button order. `None` for
/// verdicts that never prompt.
pub fn choices_for(verdict: ScanVerdict) -> Option<&'static [&'static str]> {
    match verdict {
        ScanVerdict::Clean => Some(&["Keep isolated", "Restore to original location"]),
        ScanVerdict::Malicious => Some(&["Delete", "Keep isolated (risky)"]),
        ScanVerdict::Suspicious => Some(&["Delete", "Keep isolated"]),
        ScanVerdict::Error => None,
    }
}

/// The action a choice index stands for under a verdict. `None` when the
/// index is outside the offered set.
pub fn action_for(verdict: ScanVerdict, choice: usize) -> Option<FileAction> {
    match (verdict, choice) {
        (ScanVerdict::Clean, 0) => Some(FileAction::Isolate),
        (ScanVerdict::Clean, 1) => Some(FileAction::Restore),
        (ScanVerdict::Malicious, 0) | (ScanVerdict::Suspicious, 0) => Some(FileAction::Delete),
        (ScanVerdict::Malicious, 1) | (ScanVerdict::Suspicious, 1) => Some(FileAction::Isolate),
        _ => None,
    }
}

fn quarantine_prompt(id: &CorrelationId, file: &CandidateFile) -> Prompt {
    Prompt::ask(
        id.clone(),
        "File Downloaded",
        format!(
            "\"{}\" finished downloading. Quarantine and scan it?",
            file.filename
        ),
        vec!["Quarantine".to_string(), "Do not quarantine".to_string()],
    )
}

fn action_prompt(id: &CorrelationId, verdict: ScanVerdict, filename: &str, details: &str) -> Prompt {
    let advice = match verdict {
        ScanVerdict::Clean => "No threats were found. What should happen to the file?",
        ScanVerdict::Malicious => "Deleting the file is strongly recommended.",
        ScanVerdict::Suspicious => "Review carefully before keeping it.",
        ScanVerdict::Error => "",
    };
    let choices = choices_for(verdict)
        .unwrap_or_default()
        .iter()
        .map(|c| c.to_string())
        .collect();
    let mut prompt = Prompt::ask(
        id.clone(),
        format!("Scan Result: {verdict}"),
        format!("\"{filename}\": {details}. {advice}"),
        choices,
    );
    prompt.error = matches!(verdict, ScanVerdict::Malicious | ScanVerdict::Suspicious);
    prompt
}

fn with_retry_note(mut prompt: Prompt, err: &ChannelError) -> Prompt {
    prompt.message = format!("{} (scan host unreachable: {err}; pick again to retry)", prompt.message);
    prompt.error = true;
    prompt
}

/// The decision correlator: consumes one [`WorkflowEvent`] at a time,
/// advances per-file state in the [`CorrelationStore`], and emits prompts
/// and host requests. It owns the store outright; nothing else touches
/// workflow state.
pub struct Correlator {
    store: CorrelationStore,
    channel: Arc<ChannelManager>,
    presenter: Arc<dyn PromptPresenter>,
    settings: Settings,
}

impl Correlator {
    pub fn new(
        channel: Arc<ChannelManager>,
        presenter: Arc<dyn PromptPresenter>,
        settings: Settings,
    ) -> Self {
        Correlator {
            store: CorrelationStore::new(),
            channel,
            presenter,
            settings,
        }
    }

    pub fn store(&self) -> &CorrelationStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut CorrelationStore {
        &mut self.store
    }

    /// No workflows in flight.
    pub fn is_idle(&self) -> bool {
        self.store.is_empty()
    }

    /// Consume events until the queue closes. Daemon mode runs this task;
    /// one-shot commands call [`Correlator::handle`] in their own loop.
    pub fn spawn(mut self, mut rx: mpsc::Receiver<WorkflowEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                self.handle(ev).await;
            }
            debug!("workflow event queue closed");
        })
    }

    pub async fn handle(&mut self, ev: WorkflowEvent) {
        match ev {
            WorkflowEvent::Detected(file) => self.on_detected(file).await,
            WorkflowEvent::AnalyzeRequested(file) => self.on_analyze(file).await,
            WorkflowEvent::Choice { id, choice } => self.on_choice(id, choice).await,
            WorkflowEvent::Channel(ChannelEvent::Reply(reply)) => self.on_reply(reply).await,
            WorkflowEvent::Channel(ChannelEvent::Down { abnormal, reason }) => {
                self.on_down(abnormal, reason).await
            }
        }
    }

    async fn on_detected(&mut self, file: CandidateFile) {
        let id = CorrelationId::mint();
        info!(id = %id, file = %file.filename, "download detected, asking the user");
        let prompt = quarantine_prompt(&id, &file);
        let entry = CorrelationEntry::new(file, Stage::AwaitingQuarantineChoice);
        if let Err(e) = self.store.insert(id.clone(), entry) {
            error!(error = %e, "freshly minted id collided, dropping detection");
            return;
        }
        self.presenter.present(prompt).await;
    }

    async fn on_analyze(&mut self, file: CandidateFile) {
        let id = CorrelationId::mint();
        info!(id = %id, file = %file.filename, "manual analysis requested");
        match self.send_isolation(&id, &file).await {
            Ok(()) => {
                let entry = CorrelationEntry::new(file, Stage::Isolating);
                if let Err(e) = self.store.insert(id.clone(), entry) {
                    error!(error = %e, "freshly minted id collided, dropping analysis");
                }
            }
            Err(e) => {
                // No entry: the user retries by re-running the analysis.
                self.presenter
                    .present(Prompt::failure(
                        id,
                        "Connection Failed",
                        format!("Could not reach the scan host: {e}"),
                    ))
                    .await;
            }
        }
    }

    async fn on_choice(&mut self, id: CorrelationId, choice: usize) {
        let Some(entry) = self.store.get(&id) else {
            warn!(id = %id, choice, "choice for unknown or resolved workflow, ignoring");
            return;
        };
        let stage = entry.stage;
        let file = entry.file.clone();
        let verdict = entry.verdict;
        let details = entry.verdict_details.clone();

        match stage {
            Stage::AwaitingQuarantineChoice => match choice {
                0 => match self.send_isolation(&id, &file).await {
                    Ok(()) => {
                        self.presenter.dismiss(&id).await;
                        if let Err(e) = self.store.advance(&id, Stage::Isolating) {
                            error!(id = %id, error = %e, "cannot advance to Isolating");
                        }
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "isolation send failed, keeping choice open");
                        self.presenter
                            .present(with_retry_note(quarantine_prompt(&id, &file), &e))
                            .await;
                    }
                },
                1 => {
                    info!(id = %id, file = %file.filename, "user declined quarantine");
                    self.presenter
                        .present(Prompt::notice(
                            id.clone(),
                            "File Not Quarantined",
                            format!("\"{}\" was left untouched.", file.filename),
                        ))
                        .await;
                    self.store.resolve(&id);
                }
                _ => warn!(id = %id, choice, "choice outside the offered set, ignoring"),
            },
            Stage::AwaitingActionChoice => {
                let Some(verdict) = verdict else {
                    error!(id = %id, "entry awaits an action choice but has no verdict");
                    return;
                };
                let Some(action) = action_for(verdict, choice) else {
                    // The presenter offered something the action table does
                    // not know. That is an inconsistency, not a retry case.
                    warn!(id = %id, choice, %verdict, "choice has no action mapping, resolving");
                    self.presenter.dismiss(&id).await;
                    self.store.resolve(&id);
                    return;
                };
                let req = HostRequest::FileActionDecision {
                    action,
                    notification_id: id.clone(),
                };
                match self.channel.send(req).await {
                    Ok(()) => {
                        self.presenter.dismiss(&id).await;
                        if let Err(e) = self.store.advance(&id, Stage::ActionInProgress) {
                            error!(id = %id, error = %e, "cannot advance to ActionInProgress");
                        }
                        if let Some(entry) = self.store.get_mut(&id) {
                            entry.action = Some(action);
                        }
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "action send failed, keeping choice open");
                        let details = details.unwrap_or_default();
                        self.presenter
                            .present(with_retry_note(
                                action_prompt(&id, verdict, &file.filename, &details),
                                &e,
                            ))
                            .await;
                    }
                }
            }
            _ => warn!(id = %id, ?stage, choice, "choice arrived in a non-choice stage, ignoring"),
        }
    }

    async fn on_reply(&mut self, reply: ServiceReply) {
        match reply {
            ServiceReply::IsolationStatus {
                status,
                filename,
                details,
                notification_id: id,
            } => {
                let Some(entry) = self.store.get(&id) else {
                    warn!(id = %id, "isolation status for unknown workflow, dropping");
                    return;
                };
                if entry.stage != Stage::Isolating {
                    self.protocol_violation(&id, "isolation status outside Isolating").await;
                    return;
                }
                if status == wire::ISOLATION_OK {
                    if let Err(e) = self.store.advance(&id, Stage::AwaitingScanResult) {
                        error!(id = %id, error = %e, "cannot advance to AwaitingScanResult");
                        return;
                    }
                    let message = details.unwrap_or_else(|| {
                        format!("\"{filename}\" was moved to quarantine.")
                    });
                    self.presenter
                        .present(Prompt::notice(
                            id,
                            "File Isolated",
                            format!("{message} Scan in progress."),
                        ))
                        .await;
                } else {
                    // The host's own wording, verbatim.
                    let message = details
                        .unwrap_or_else(|| format!("The scan host could not isolate \"{filename}\"."));
                    self.presenter
                        .present(Prompt::failure(id.clone(), "Isolation Failed", message))
                        .await;
                    self.store.resolve(&id);
                }
            }

            ServiceReply::ScanResult {
                status: verdict,
                filename,
                details,
                notification_id: id,
            } => {
                let Some(entry) = self.store.get(&id) else {
                    warn!(id = %id, "scan result for unknown workflow, dropping");
                    return;
                };
                if entry.stage != Stage::AwaitingScanResult {
                    self.protocol_violation(&id, "scan result outside AwaitingScanResult").await;
                    return;
                }
                if let Some(entry) = self.store.get_mut(&id) {
                    entry.verdict = Some(verdict);
                    entry.verdict_details = Some(details.clone());
                }
                if verdict == ScanVerdict::Error {
                    info!(id = %id, "scan failed on the host, resolving");
                    self.presenter
                        .present(Prompt::failure(
                            id.clone(),
                            "Scan Error",
                            format!("\"{filename}\" could not be scanned: {details}"),
                        ))
                        .await;
                    self.store.resolve(&id);
                    return;
                }
                if let Err(e) = self.store.advance(&id, Stage::AwaitingActionChoice) {
                    error!(id = %id, error = %e, "cannot advance to AwaitingActionChoice");
                    return;
                }
                self.presenter
                    .present(action_prompt(&id, verdict, &filename, &details))
                    .await;
            }

            ServiceReply::ActionDecisionStatus {
                status,
                action_performed,
                details,
                notification_id: id,
                restored_path,
            } => {
                let Some(entry) = self.store.get(&id) else {
                    warn!(id = %id, "action status for unknown workflow, dropping");
                    return;
                };
                if entry.stage != Stage::ActionInProgress {
                    self.protocol_violation(&id, "action status outside ActionInProgress").await;
                    return;
                }
                info!(
                    id = %id,
                    chosen = ?entry.action,
                    performed = %action_performed,
                    %status,
                    "action outcome"
                );
                if status == wire::ACTION_OK {
                    let mut message = details;
                    if let Some(path) = restored_path {
                        message = format!("{message} Restored to {path}.");
                    }
                    self.presenter
                        .present(Prompt::notice(
                            id.clone(),
                            format!("File Action: {action_performed}"),
                            message,
                        ))
                        .await;
                } else {
                    self.presenter
                        .present(Prompt::failure(id.clone(), "Action Failed", details))
                        .await;
                }
                self.store.resolve(&id);
            }

            ServiceReply::UpdateIsolationPathStatus { .. } => {
                // The channel manager answers these to its pending update
                // call; one reaching the correlator means nothing asked.
                warn!("isolation path status reached the correlator, dropping");
            }
        }
    }

    async fn on_down(&mut self, abnormal: bool, reason: String) {
        // Losing the channel never touches live entries: their replies
        // resume after a later send reconnects, or the user re-triggers.
        info!(abnormal, %reason, in_flight = self.store.len(), "channel down");
        if abnormal {
            self.presenter
                .present(Prompt::failure(
                    CorrelationId::mint(),
                    "Service Disconnected",
                    format!("The scan host disconnected unexpectedly: {reason}"),
                ))
                .await;
        }
    }

    async fn send_isolation(&self, id: &CorrelationId, file: &CandidateFile) -> Result<(), ChannelError> {
        // The setting is read per decision, so a path update between two
        // downloads takes effect without a restart.
        let isolation_path = self.settings.isolation_path().await;
        self.channel
            .send(HostRequest::InitiateFileIsolation {
                download_path: file.path.to_string_lossy().into_owned(),
                filename: file.filename.clone(),
                isolation_path,
                notification_id: id.clone(),
            })
            .await
    }

    /// A reply arrived that contradicts the workflow's stage. Log it, drop
    /// the workflow, show and send nothing further.
    async fn protocol_violation(&mut self, id: &CorrelationId, what: &str) {
        warn!(id = %id, what, "protocol violation, force-resolving workflow");
        self.presenter.dismiss(id).await;
        self.store.resolve(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::transport::DuplexTransport;
    use crate::prompt::MemoryPresenter;
    use crate::settings::{MapSettingsStore, Settings};
    use scanhost_proto::codec;
    use scanhost_proto::runtime::serve;
    use scanhost_proto::testhost::MockScanHost;
    use std::path::PathBuf;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc::{Receiver, UnboundedReceiver};
    use tokio::time::{timeout, Duration};

    struct Harness {
        correlator: Correlator,
        presenter: Arc<MemoryPresenter>,
        chan_rx: Receiver<ChannelEvent>,
        host_rx: UnboundedReceiver<DuplexStream>,
    }

    fn harness() -> Harness {
        let (transport, host_rx) = DuplexTransport::new();
        let (events_tx, chan_rx) = mpsc::channel(32);
        let channel = ChannelManager::new(Arc::new(transport), events_tx);
        let presenter = Arc::new(MemoryPresenter::new());
        let settings = Settings(MapSettingsStore::new());
        let correlator = Correlator::new(channel, presenter.clone(), settings);
        Harness {
            correlator,
            presenter,
            chan_rx,
            host_rx,
        }
    }

    impl Harness {
        /// Serve every connection the manager opens with a fresh mock host.
        fn auto_serve(&mut self) {
            let mut host_rx = std::mem::replace(&mut self.host_rx, mpsc::unbounded_channel().1);
            tokio::spawn(async move {
                while let Some(stream) = host_rx.recv().await {
                    let (r, w) = tokio::io::split(stream);
                    tokio::spawn(serve(r, w, MockScanHost::default()));
                }
            });
        }

        /// Feed the next channel event into the correlator.
        async fn pump_one(&mut self) {
            let ev = timeout(Duration::from_secs(5), self.chan_rx.recv())
                .await
                .expect("timed out waiting for a channel event")
                .expect("channel event stream closed");
            self.correlator.handle(WorkflowEvent::Channel(ev)).await;
        }

        async fn detect(&mut self, path: &str) -> CorrelationId {
            self.correlator
                .handle(WorkflowEvent::Detected(CandidateFile::new(PathBuf::from(path))))
                .await;
            self.only_new_prompt_id()
        }

        fn only_new_prompt_id(&self) -> CorrelationId {
            self.presenter
                .history()
                .last()
                .expect("a prompt was presented")
                .id
                .clone()
        }

        async fn choose(&mut self, id: &CorrelationId, choice: usize) {
            self.correlator
                .handle(WorkflowEvent::Choice {
                    id: id.clone(),
                    choice,
                })
                .await;
        }
    }

    #[test]
    fn action_table_matches_the_contract() {
        assert_eq!(action_for(ScanVerdict::Clean, 0), Some(FileAction::Isolate));
        assert_eq!(action_for(ScanVerdict::Clean, 1), Some(FileAction::Restore));
        assert_eq!(action_for(ScanVerdict::Malicious, 0), Some(FileAction::Delete));
        assert_eq!(action_for(ScanVerdict::Malicious, 1), Some(FileAction::Isolate));
        assert_eq!(action_for(ScanVerdict::Suspicious, 0), Some(FileAction::Delete));
        assert_eq!(action_for(ScanVerdict::Suspicious, 1), Some(FileAction::Isolate));
        assert_eq!(action_for(ScanVerdict::Clean, 2), None);
        assert_eq!(action_for(ScanVerdict::Error, 0), None);
    }

    #[test]
    fn every_prompting_verdict_offers_two_choices() {
        for verdict in [ScanVerdict::Clean, ScanVerdict::Malicious, ScanVerdict::Suspicious] {
            let choices = choices_for(verdict).unwrap();
            assert_eq!(choices.len(), 2);
            for i in 0..choices.len() {
                assert!(action_for(verdict, i).is_some());
            }
        }
        assert!(choices_for(ScanVerdict::Error).is_none());
    }

    #[tokio::test]
    async fn clean_download_can_be_restored() {
        let mut h = harness();
        h.auto_serve();

        let id = h.detect("/dl/report.pdf").await;
        let ask = h.presenter.visible(&id).unwrap();
        assert_eq!(ask.choices, vec!["Quarantine", "Do not quarantine"]);

        h.choose(&id, 0).await;
        h.pump_one().await; // ISOLATION_STATUS
        assert_eq!(h.correlator.store().get(&id).unwrap().stage, Stage::AwaitingScanResult);
        let notice = h.presenter.visible(&id).unwrap();
        assert!(notice.message.contains("Scan in progress"));

        h.pump_one().await; // SCAN_RESULT clean
        assert_eq!(h.correlator.store().get(&id).unwrap().stage, Stage::AwaitingActionChoice);
        let ask = h.presenter.visible(&id).unwrap();
        assert_eq!(ask.choices, vec!["Keep isolated", "Restore to original location"]);

        h.choose(&id, 1).await; // restore
        assert_eq!(h.correlator.store().get(&id).unwrap().stage, Stage::ActionInProgress);

        h.pump_one().await; // ACTION_DECISION_STATUS
        assert!(h.correlator.is_idle());
        let done = h.presenter.visible(&id).unwrap();
        assert!(done.title.contains("restore"));
        assert!(done.message.contains("/dl/report.pdf"));
    }

    #[tokio::test]
    async fn malicious_download_can_be_deleted() {
        let mut h = harness();
        h.auto_serve();

        let id = h.detect("/dl/malware_dropper.exe").await;
        h.choose(&id, 0).await;
        h.pump_one().await; // isolation ack
        h.pump_one().await; // verdict

        let ask = h.presenter.visible(&id).unwrap();
        assert_eq!(ask.choices, vec!["Delete", "Keep isolated (risky)"]);
        assert!(ask.error);

        h.choose(&id, 0).await; // delete
        h.pump_one().await;
        assert!(h.correlator.is_idle());
        let done = h.presenter.visible(&id).unwrap();
        assert!(done.title.contains("delete"));
    }

    #[tokio::test]
    async fn declining_quarantine_sends_nothing() {
        let mut h = harness();

        let id = h.detect("/dl/notes.txt").await;
        h.choose(&id, 1).await;

        assert!(h.correlator.is_idle());
        let notice = h.presenter.visible(&id).expect("a confirmation notice");
        assert_eq!(notice.title, "File Not Quarantined");
        assert!(!notice.needs_choice());
        // No connection was ever opened.
        assert!(h.host_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn scan_error_resolves_without_an_action_prompt() {
        let mut h = harness();
        h.auto_serve();

        let id = h.detect("/dl/scanfail.bin").await;
        h.choose(&id, 0).await;
        h.pump_one().await; // isolation ack
        h.pump_one().await; // verdict: error

        assert!(h.correlator.is_idle());
        let notice = h.presenter.visible(&id).unwrap();
        assert!(notice.error);
        assert!(notice.choices.is_empty());
        assert!(notice.message.contains("could not be scanned"));
    }

    #[tokio::test]
    async fn isolation_failure_shows_host_details_verbatim() {
        let mut h = harness();
        h.auto_serve();

        let id = h.detect("/dl/locked.iso").await;
        h.choose(&id, 0).await;
        h.pump_one().await; // isolation failed

        assert!(h.correlator.is_idle());
        let notice = h.presenter.visible(&id).unwrap();
        assert_eq!(notice.title, "Isolation Failed");
        assert!(notice.message.contains("locked by another process"));
    }

    #[tokio::test]
    async fn manual_analysis_skips_the_quarantine_question() {
        let mut h = harness();
        h.auto_serve();

        h.correlator
            .handle(WorkflowEvent::AnalyzeRequested(CandidateFile::new(
                PathBuf::from("/dl/suspect_tool.exe"),
            )))
            .await;
        let ids = h.correlator.store().ids();
        assert_eq!(ids.len(), 1);
        let id = ids[0].clone();
        assert_eq!(h.correlator.store().get(&id).unwrap().stage, Stage::Isolating);
        // No quarantine prompt was shown.
        assert!(h.presenter.visible(&id).is_none());

        h.pump_one().await; // isolation ack
        h.pump_one().await; // verdict: suspicious
        let ask = h.presenter.visible(&id).unwrap();
        assert_eq!(ask.choices, vec!["Delete", "Keep isolated"]);
    }

    #[tokio::test]
    async fn replies_only_advance_their_own_workflow() {
        let mut h = harness();
        h.auto_serve();

        let a = h.detect("/dl/alpha.bin").await;
        let b = h.detect("/dl/beta.bin").await;
        assert_ne!(a, b);

        h.choose(&b, 0).await;
        h.pump_one().await; // beta isolation ack
        h.pump_one().await; // beta verdict

        assert_eq!(h.correlator.store().get(&a).unwrap().stage, Stage::AwaitingQuarantineChoice);
        assert_eq!(h.correlator.store().get(&b).unwrap().stage, Stage::AwaitingActionChoice);
        // Alpha's prompt is untouched, beta's moved on.
        assert!(h.presenter.visible(&a).unwrap().message.contains("alpha.bin"));
        assert!(h.presenter.visible(&b).unwrap().message.contains("beta.bin"));
    }

    #[tokio::test]
    async fn disconnect_keeps_entries_and_reconnect_does_not_resend() {
        let mut h = harness();

        let id = h.detect("/dl/waiting.bin").await;
        h.choose(&id, 0).await;

        // The host accepted the connection, read the isolation request,
        // then died before answering.
        let stream = h.host_rx.recv().await.expect("connection opened");
        let (mut r, _w) = tokio::io::split(stream);
        let frame = codec::read_frame(&mut r).await.unwrap().unwrap();
        let req = wire::parse_request(&frame).unwrap();
        assert_eq!(req.correlation_id(), Some(&id));
        drop(r);
        drop(_w);

        h.pump_one().await; // ChannelEvent::Down
        assert_eq!(h.correlator.store().get(&id).unwrap().stage, Stage::Isolating);

        // A new workflow reconnects; the stalled one is not re-sent.
        h.correlator
            .handle(WorkflowEvent::AnalyzeRequested(CandidateFile::new(
                PathBuf::from("/dl/fresh.bin"),
            )))
            .await;
        let stream = h.host_rx.recv().await.expect("second connection opened");
        let (mut r, _w) = tokio::io::split(stream);
        let frame = codec::read_frame(&mut r).await.unwrap().unwrap();
        let req = wire::parse_request(&frame).unwrap();
        match req {
            HostRequest::InitiateFileIsolation { filename, .. } => assert_eq!(filename, "fresh.bin"),
            other => panic!("unexpected request {other:?}"),
        }
        assert!(
            timeout(Duration::from_millis(200), codec::read_frame(&mut r))
                .await
                .is_err(),
            "nothing further was re-sent"
        );
        assert_eq!(h.correlator.store().get(&id).unwrap().stage, Stage::Isolating);
    }

    #[tokio::test]
    async fn abnormal_disconnect_warns_the_user() {
        let mut h = harness();

        let id = h.detect("/dl/anything.bin").await;
        h.correlator
            .handle(WorkflowEvent::Channel(ChannelEvent::Down {
                abnormal: true,
                reason: "boom".into(),
            }))
            .await;

        // Entry untouched, warning visible under its own id.
        assert_eq!(
            h.correlator.store().get(&id).unwrap().stage,
            Stage::AwaitingQuarantineChoice
        );
        let warning = h
            .presenter
            .history()
            .into_iter()
            .find(|p| p.title == "Service Disconnected")
            .expect("a disconnect warning");
        assert!(warning.error);
        assert_ne!(warning.id, id);
    }

    #[tokio::test]
    async fn stale_choices_are_ignored() {
        let mut h = harness();

        let id = h.detect("/dl/gone.bin").await;
        h.choose(&id, 1).await;
        assert!(h.correlator.is_idle());

        // A second click on the dead prompt changes nothing.
        h.choose(&id, 0).await;
        assert!(h.correlator.is_idle());
        assert!(h.host_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn out_of_table_choice_resolves_without_sending() {
        let mut h = harness();
        h.auto_serve();

        let id = h.detect("/dl/malware_x.exe").await;
        h.choose(&id, 0).await;
        h.pump_one().await;
        h.pump_one().await;
        assert_eq!(h.correlator.store().get(&id).unwrap().stage, Stage::AwaitingActionChoice);

        // A choice index the action table never offered: the prompt goes
        // away and the workflow ends without a request to the host.
        h.choose(&id, 7).await;
        assert!(h.correlator.is_idle());
        assert!(h.presenter.visible(&id).is_none());
        assert!(h.presenter.dismissed().contains(&id));
        assert!(
            timeout(Duration::from_millis(200), h.chan_rx.recv())
                .await
                .is_err(),
            "no reply should come back for a request that was never sent"
        );
    }

    #[tokio::test]
    async fn mismatched_reply_force_resolves_the_workflow() {
        let mut h = harness();

        let id = h.detect("/dl/odd.bin").await;
        // A scan result arrives while the entry still awaits the
        // quarantine choice: contract violation.
        h.correlator
            .handle(WorkflowEvent::Channel(ChannelEvent::Reply(
                ServiceReply::ScanResult {
                    status: ScanVerdict::Clean,
                    filename: "odd.bin".into(),
                    details: "".into(),
                    notification_id: id.clone(),
                },
            )))
            .await;

        assert!(h.correlator.is_idle());
        assert!(h.presenter.visible(&id).is_none());
        assert!(h.presenter.dismissed().contains(&id));
    }

    #[tokio::test]
    async fn reply_for_unknown_id_is_dropped() {
        let mut h = harness();
        let id = h.detect("/dl/known.bin").await;

        h.correlator
            .handle(WorkflowEvent::Channel(ChannelEvent::Reply(
                ServiceReply::IsolationStatus {
                    status: wire::ISOLATION_OK.into(),
                    filename: "ghost.bin".into(),
                    details: None,
                    notification_id: CorrelationId::mint(),
                },
            )))
            .await;

        // The known workflow is untouched.
        assert_eq!(
            h.correlator.store().get(&id).unwrap().stage,
            Stage::AwaitingQuarantineChoice
        );
        assert_eq!(h.correlator.store().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_keeps_the_choice_stage_and_reprompts() {
        let mut h = harness();
        // Nobody accepts connections.
        drop(std::mem::replace(&mut h.host_rx, mpsc::unbounded_channel().1));

        let id = h.detect("/dl/retry.bin").await;
        h.choose(&id, 0).await;

        assert_eq!(
            h.correlator.store().get(&id).unwrap().stage,
            Stage::AwaitingQuarantineChoice
        );
        let prompt = h.presenter.visible(&id).unwrap();
        assert!(prompt.error);
        assert!(prompt.message.contains("pick again to retry"));
        assert_eq!(prompt.choices.len(), 2);
        assert_eq!(h.presenter.history_for(&id).len(), 2);
    }
}
