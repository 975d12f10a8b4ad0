use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, FixedOffset, TimeZone};
use tempfile::TempDir;

use imap_migrate::checkpoint::{Checkpoint, CheckpointStore};
use imap_migrate::config::{Config, MappingEntry};
use imap_migrate::migrate::{CancelFlag, Migrator, Outcome};
use imap_migrate::stats::Statistics;
use imap_migrate::transport::{Result, SourceMessage, Transport, TransportError};

fn internal_date() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(0)
        .unwrap()
        .with_ymd_and_hms(2023, 10, 5, 12, 0, 0)
        .unwrap()
}

#[derive(Clone)]
struct TestMessage {
    body: Vec<u8>,
    flags: Vec<String>,
}

fn message(text: &str) -> TestMessage {
    TestMessage {
        body: format!(
            "From: Alice <alice@example.com>\r\nSubject: {text}\r\n\r\n{text}\r\n"
        )
        .into_bytes(),
        flags: vec!["\\Seen".to_string()],
    }
}

fn message_with_pdf(content: &[u8]) -> TestMessage {
    let body = format!(
        "From: Alice <alice@example.com>\r\n\
         Subject: report\r\n\
         Date: Thu, 05 Oct 2023 12:00:00 +0000\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"sep\"\r\n\r\n\
         --sep\r\nContent-Type: text/plain\r\n\r\nsee attachment\r\n\
         --sep\r\nContent-Type: application/pdf; name=\"report.pdf\"\r\n\
         Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
         Content-Transfer-Encoding: base64\r\n\r\n{}\r\n\
         --sep--\r\n",
        BASE64.encode(content)
    );
    TestMessage {
        body: body.into_bytes(),
        flags: vec![],
    }
}

struct MockSource {
    folders: Vec<(String, Vec<TestMessage>)>,
    selected: Option<usize>,
    transient_failures: u32,
    reconnects: u32,
    cancel_on_fetch: Option<(u32, CancelFlag)>,
}

impl MockSource {
    fn new(folders: &[(&str, Vec<TestMessage>)]) -> Self {
        MockSource {
            folders: folders
                .iter()
                .map(|(name, messages)| (name.to_string(), messages.clone()))
                .collect(),
            selected: None,
            transient_failures: 0,
            reconnects: 0,
            cancel_on_fetch: None,
        }
    }

    fn fail(&mut self) -> bool {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            true
        } else {
            false
        }
    }
}

impl Transport for MockSource {
    fn list_folders(&mut self) -> Result<Vec<String>> {
        if self.fail() {
            return Err(TransportError::Transient("connection reset".to_string()));
        }
        Ok(self.folders.iter().map(|(name, _)| name.clone()).collect())
    }

    fn select_folder(&mut self, folder: &str) -> Result<u32> {
        match self.folders.iter().position(|(name, _)| name == folder) {
            Some(position) => {
                self.selected = Some(position);
                Ok(self.folders[position].1.len() as u32)
            }
            None => Err(TransportError::Permanent(format!(
                "no such folder: {folder}"
            ))),
        }
    }

    fn fetch_message(&mut self, index: u32) -> Result<SourceMessage> {
        if self.fail() {
            return Err(TransportError::Transient("connection reset".to_string()));
        }
        if let Some((remaining, cancel)) = &mut self.cancel_on_fetch {
            if *remaining <= 1 {
                cancel.cancel();
            } else {
                *remaining -= 1;
            }
        }
        let position = self
            .selected
            .ok_or_else(|| TransportError::Permanent("no folder selected".to_string()))?;
        let (folder, messages) = &self.folders[position];
        let message = messages
            .get(index as usize)
            .ok_or_else(|| TransportError::Malformed(format!("no message at index {index}")))?;
        Ok(SourceMessage {
            index,
            body: message.body.clone(),
            flags: message.flags.clone(),
            internal_date: internal_date(),
            labels: vec![folder.clone()],
        })
    }

    fn create_folder(&mut self, _folder: &str) -> Result<()> {
        Err(TransportError::Permanent("source is read-only".to_string()))
    }

    fn append(
        &mut self,
        _folder: &str,
        _body: &[u8],
        _flags: &[String],
        _internal_date: DateTime<FixedOffset>,
    ) -> Result<()> {
        Err(TransportError::Permanent("source is read-only".to_string()))
    }

    fn reconnect(&mut self) -> Result<()> {
        self.reconnects += 1;
        Ok(())
    }
}

#[derive(Default)]
struct DestState {
    folders: BTreeMap<String, Vec<(Vec<u8>, Vec<String>)>>,
    created: Vec<String>,
}

#[derive(Clone, Default)]
struct MockDest(Arc<Mutex<DestState>>);

impl MockDest {
    fn new() -> Self {
        Self::default()
    }

    fn with_folder(self, folder: &str, messages: &[TestMessage]) -> Self {
        self.0.lock().unwrap().folders.insert(
            folder.to_string(),
            messages
                .iter()
                .map(|m| (m.body.clone(), m.flags.clone()))
                .collect(),
        );
        self
    }

    fn appended(&self, folder: &str) -> Vec<Vec<u8>> {
        self.0
            .lock()
            .unwrap()
            .folders
            .get(folder)
            .map(|messages| messages.iter().map(|(body, _)| body.clone()).collect())
            .unwrap_or_default()
    }

    fn flags(&self, folder: &str, index: usize) -> Vec<String> {
        self.0.lock().unwrap().folders[folder][index].1.clone()
    }

    fn created(&self) -> Vec<String> {
        self.0.lock().unwrap().created.clone()
    }

    fn folder_names(&self) -> Vec<String> {
        self.0.lock().unwrap().folders.keys().cloned().collect()
    }
}

impl Transport for MockDest {
    fn list_folders(&mut self) -> Result<Vec<String>> {
        Ok(self.folder_names())
    }

    fn select_folder(&mut self, folder: &str) -> Result<u32> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .folders
            .get(folder)
            .map(|m| m.len() as u32)
            .unwrap_or(0))
    }

    fn fetch_message(&mut self, _index: u32) -> Result<SourceMessage> {
        Err(TransportError::Permanent(
            "destination is append-only".to_string(),
        ))
    }

    fn create_folder(&mut self, folder: &str) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state.created.push(folder.to_string());
        state.folders.entry(folder.to_string()).or_default();
        Ok(())
    }

    fn append(
        &mut self,
        folder: &str,
        body: &[u8],
        flags: &[String],
        _internal_date: DateTime<FixedOffset>,
    ) -> Result<()> {
        self.0
            .lock()
            .unwrap()
            .folders
            .entry(folder.to_string())
            .or_default()
            .push((body.to_vec(), flags.to_vec()));
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.global.checkpoint_file = dir.path().join("checkpoint.json");
    config.global.statistics_file = dir.path().join("statistics.json");
    config.transport.base_delay_ms = 1;
    config.transport.max_delay_ms = 2;
    config
}

fn run(
    config: &Config,
    source: MockSource,
    dest: &MockDest,
    cancel: CancelFlag,
    simulation: bool,
) -> imap_migrate::migrate::Summary {
    Migrator::new(config, source, dest.clone(), cancel, simulation, true)
        .run()
        .unwrap()
}

#[test]
fn migrates_inbox_in_order() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let source = MockSource::new(&[(
        "INBOX",
        vec![message("one"), message("two"), message("three")],
    )]);
    let dest = MockDest::new();

    let summary = run(&config, source, &dest, CancelFlag::new(), false);

    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.skipped, 0);
    let appended = dest.appended("INBOX");
    assert_eq!(appended.len(), 3);
    for (body, text) in appended.iter().zip(["one", "two", "three"]) {
        assert!(String::from_utf8_lossy(body).contains(text));
    }
    assert!(dest.created().is_empty());
    assert!(!config.global.checkpoint_file.exists());
    let stats = Statistics::load(&config.global.statistics_file);
    assert_eq!(stats.get("folder", "INBOX"), 3);
    assert_eq!(stats.get("sender_domain", "example.com"), 3);
}

#[test]
fn resume_appends_only_unprocessed_messages() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let messages: Vec<TestMessage> = (0..5).map(|i| message(&format!("msg{i}"))).collect();

    // A previous run delivered messages 0 and 1 before being interrupted.
    let dest = MockDest::new().with_folder("INBOX.Work", &messages[..2]);
    CheckpointStore::new(config.global.checkpoint_file.clone())
        .save(&Checkpoint {
            folder: "Work".to_string(),
            last_processed_index: 1,
            processed: 2,
            bytes: 100,
            skipped: 0,
            updated_at: chrono::Utc::now(),
        })
        .unwrap();

    let source = MockSource::new(&[("Work", messages.clone())]);
    let summary = run(&config, source, &dest, CancelFlag::new(), false);

    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(summary.processed, 5);
    let appended = dest.appended("INBOX.Work");
    assert_eq!(appended.len(), 5);
    // No duplicates: each body appears exactly once, in index order.
    for (i, body) in appended.iter().enumerate() {
        assert!(String::from_utf8_lossy(body).contains(&format!("msg{i}")));
    }
    assert!(!config.global.checkpoint_file.exists());
}

#[test]
fn resume_skips_folders_before_the_checkpointed_one() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    CheckpointStore::new(config.global.checkpoint_file.clone())
        .save(&Checkpoint {
            folder: "Beta".to_string(),
            last_processed_index: 1,
            processed: 4,
            bytes: 100,
            skipped: 0,
            updated_at: chrono::Utc::now(),
        })
        .unwrap();

    let source = MockSource::new(&[
        ("Alpha", vec![message("a0"), message("a1")]),
        ("Beta", vec![message("b0"), message("b1")]),
        ("Gamma", vec![message("g0"), message("g1")]),
    ]);
    let dest = MockDest::new();
    let summary = run(&config, source, &dest, CancelFlag::new(), false);

    assert_eq!(summary.outcome, Outcome::Completed);
    assert!(dest.appended("INBOX.Alpha").is_empty());
    assert!(dest.appended("INBOX.Beta").is_empty());
    assert_eq!(dest.appended("INBOX.Gamma").len(), 2);
}

#[test]
fn checkpoint_for_unknown_folder_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    CheckpointStore::new(config.global.checkpoint_file.clone())
        .save(&Checkpoint {
            folder: "Ghost".to_string(),
            last_processed_index: 7,
            processed: 8,
            bytes: 100,
            skipped: 0,
            updated_at: chrono::Utc::now(),
        })
        .unwrap();

    let source = MockSource::new(&[("INBOX", vec![message("one"), message("two")])]);
    let dest = MockDest::new();
    let summary = run(&config, source, &dest, CancelFlag::new(), false);

    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(dest.appended("INBOX").len(), 2);
}

#[test]
fn cancellation_keeps_a_resumable_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let messages: Vec<TestMessage> = (0..3).map(|i| message(&format!("msg{i}"))).collect();
    let dest = MockDest::new();
    let cancel = CancelFlag::new();

    let mut source = MockSource::new(&[("INBOX", messages.clone())]);
    // The flag flips during the second fetch; the in-flight message still
    // completes, the third is never started.
    source.cancel_on_fetch = Some((2, cancel.clone()));
    let summary = run(&config, source, &dest, cancel, false);

    assert_eq!(summary.outcome, Outcome::Cancelled);
    assert_eq!(summary.processed, 2);
    assert_eq!(dest.appended("INBOX").len(), 2);
    let checkpoint = CheckpointStore::new(config.global.checkpoint_file.clone())
        .load()
        .expect("checkpoint should survive cancellation");
    assert_eq!(checkpoint.folder, "INBOX");
    assert_eq!(checkpoint.last_processed_index, 1);

    // A rerun picks up exactly where the first left off.
    let source = MockSource::new(&[("INBOX", messages)]);
    let summary = run(&config, source, &dest, CancelFlag::new(), false);
    assert_eq!(summary.outcome, Outcome::Completed);
    let appended = dest.appended("INBOX");
    assert_eq!(appended.len(), 3);
    for (i, body) in appended.iter().enumerate() {
        assert!(String::from_utf8_lossy(body).contains(&format!("msg{i}")));
    }
    assert!(!config.global.checkpoint_file.exists());
}

#[test]
fn simulation_mutates_nothing() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let source = MockSource::new(&[(
        "Work",
        vec![message("one"), message("two"), message("three")],
    )]);
    let dest = MockDest::new();

    let summary = run(&config, source, &dest, CancelFlag::new(), true);

    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(summary.processed, 3);
    assert!(dest.created().is_empty());
    assert!(dest.folder_names().is_empty());
    assert!(!config.global.checkpoint_file.exists());
    // Statistics are still produced.
    let stats = Statistics::load(&config.global.statistics_file);
    assert_eq!(stats.get("folder", "INBOX.Work"), 3);
}

#[test]
fn transient_failures_are_retried_transparently() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let mut source = MockSource::new(&[("INBOX", vec![message("one"), message("two")])]);
    source.transient_failures = 2;
    let dest = MockDest::new();

    let summary = run(&config, source, &dest, CancelFlag::new(), false);

    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(dest.appended("INBOX").len(), 2);
}

#[test]
fn dropped_and_root_folders_are_excluded() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.global.folder_mapping = vec![MappingEntry {
        label: "Spam".to_string(),
        folder: None,
    }];

    let source = MockSource::new(&[
        ("[Gmail]/All Mail", vec![message("dup")]),
        ("[Gmail]", vec![]),
        ("Spam", vec![message("junk")]),
        ("Work", vec![message("real")]),
    ]);
    let dest = MockDest::new();
    let summary = run(&config, source, &dest, CancelFlag::new(), false);

    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(summary.processed, 1);
    assert_eq!(dest.created(), vec!["INBOX.Work".to_string()]);
    assert_eq!(dest.appended("INBOX.Work").len(), 1);
    assert_eq!(dest.folder_names(), vec!["INBOX.Work".to_string()]);
}

#[test]
fn flagged_labels_add_the_flagged_state() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let source = MockSource::new(&[("Starred", vec![message("important")])]);
    let dest = MockDest::new();

    run(&config, source, &dest, CancelFlag::new(), false);

    let flags = dest.flags("INBOX.Starred", 0);
    assert!(flags.contains(&"\\Seen".to_string()));
    assert!(flags.contains(&"\\Flagged".to_string()));
}

#[test]
fn malformed_messages_are_skipped_not_fatal() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let broken = TestMessage {
        body: Vec::new(),
        flags: vec![],
    };
    let source = MockSource::new(&[(
        "INBOX",
        vec![message("one"), broken, message("three")],
    )]);
    let dest = MockDest::new();

    let summary = run(&config, source, &dest, CancelFlag::new(), false);

    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(dest.appended("INBOX").len(), 2);
    assert!(!config.global.checkpoint_file.exists());
    let stats = Statistics::load(&config.global.statistics_file);
    assert_eq!(stats.get("skipped", "INBOX"), 1);
}

#[test]
fn attachment_is_extracted_and_linked_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.attachments.enabled = true;
    config.attachments.extension_whitelist = vec![".pdf".to_string()];
    config.attachments.min_size = 1024;
    config.attachments.storage_path = dir.path().join("store");
    config.attachments.storage_url = "file:///store/".to_string();

    let content = vec![b'a'; 2048];
    let source = MockSource::new(&[("INBOX", vec![message_with_pdf(&content)])]);
    let dest = MockDest::new();

    let summary = run(&config, source, &dest, CancelFlag::new(), false);

    assert_eq!(summary.outcome, Outcome::Completed);
    let stored = fs::read(dir.path().join("store").join("2023_10").join("report.pdf")).unwrap();
    assert_eq!(stored, content);
    let appended = dest.appended("INBOX");
    assert_eq!(appended.len(), 1);
    let text = String::from_utf8_lossy(&appended[0]);
    assert_eq!(text.matches("file:///store/2023_10/report.pdf").count(), 1);
    let stats = Statistics::load(&config.global.statistics_file);
    assert_eq!(stats.get("attachments", "extracted"), 1);
}
