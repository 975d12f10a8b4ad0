use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use indicatif::ProgressBar;
use log::{debug, info, warn};
use mailparse::MailHeaderMap;

use crate::attachments::AttachmentExtractor;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::Config;
use crate::mapper::FolderMapper;
use crate::reconnect::Reconnecting;
use crate::stats::Statistics;
use crate::transport::{Transport, TransportError};

/// Cooperative cancellation flag, observed between messages and between
/// folders, never inside a partially applied append.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
}

#[derive(Debug)]
pub struct Summary {
    pub outcome: Outcome,
    pub processed: u64,
    pub skipped: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct Totals {
    processed: u64,
    bytes: u64,
    skipped: u64,
}

#[derive(Debug)]
struct PlanEntry {
    source: String,
    dest: String,
    missing: bool,
}

/// Drives the end-to-end migration: enumerate source folders, resolve
/// destinations, create missing folders, then move messages one by one in
/// strictly increasing index order, checkpointing after every transition.
pub struct Migrator<S: Transport, D: Transport> {
    source: Reconnecting<S>,
    dest: Reconnecting<D>,
    mapper: FolderMapper,
    extractor: AttachmentExtractor,
    checkpoints: CheckpointStore,
    stats: Statistics,
    statistics_file: PathBuf,
    labels_as_flagged: Vec<String>,
    root_folder: String,
    cancel: CancelFlag,
    simulation: bool,
    quiet: bool,
}

impl<S: Transport, D: Transport> Migrator<S, D> {
    pub fn new(
        config: &Config,
        source: S,
        dest: D,
        cancel: CancelFlag,
        simulation: bool,
        quiet: bool,
    ) -> Self {
        let policy = config.transport.retry_policy();
        Migrator {
            source: Reconnecting::new(source, policy.clone()),
            dest: Reconnecting::new(dest, policy),
            mapper: FolderMapper::new(&config.global),
            extractor: AttachmentExtractor::new(config.attachments.clone(), simulation),
            checkpoints: CheckpointStore::new(config.global.checkpoint_file.clone()),
            stats: Statistics::new(),
            statistics_file: config.global.statistics_file.clone(),
            labels_as_flagged: config.global.labels_as_flagged.clone(),
            root_folder: config.global.root_folder.clone(),
            cancel,
            simulation,
            quiet,
        }
    }

    pub fn run(mut self) -> Result<Summary> {
        let result = self.run_inner();
        if let Err(err) = self.stats.save(&self.statistics_file) {
            warn!(
                "could not save statistics to {}: {}",
                self.statistics_file.display(),
                err
            );
        } else {
            info!("statistics saved to {}", self.statistics_file.display());
        }
        debug!("=== STATISTICS ===\n{}", self.stats.format());
        result
    }

    fn run_inner(&mut self) -> Result<Summary> {
        let plan = self.plan()?;
        print_plan(&plan);
        self.prepare_folders(&plan)?;

        let mut resume = if self.simulation {
            None
        } else {
            self.checkpoints.load()
        };
        if let Some(checkpoint) = &resume {
            if plan.iter().any(|e| e.source == checkpoint.folder) {
                info!(
                    "resuming folder {} after message {}",
                    checkpoint.folder,
                    checkpoint.last_processed_index + 1
                );
                self.stats = Statistics::load(&self.statistics_file);
            } else {
                warn!(
                    "checkpoint references unknown folder {:?}, starting from the beginning",
                    checkpoint.folder
                );
                resume = None;
            }
        }

        let mut totals = resume
            .as_ref()
            .map(|c| Totals {
                processed: c.processed,
                bytes: c.bytes,
                skipped: c.skipped,
            })
            .unwrap_or_default();

        let mut outcome = Outcome::Completed;
        for entry in &plan {
            if self.cancel.is_cancelled() {
                outcome = Outcome::Cancelled;
                break;
            }
            let start = match resume.take() {
                Some(checkpoint) if entry.source != checkpoint.folder => {
                    debug!("folder {} already migrated, skipping", entry.source);
                    resume = Some(checkpoint);
                    continue;
                }
                Some(checkpoint) => checkpoint.last_processed_index + 1,
                None => 0,
            };
            if self.migrate_folder(&entry.source, &entry.dest, start, &mut totals)? {
                outcome = Outcome::Cancelled;
                break;
            }
        }

        match outcome {
            Outcome::Completed if !self.simulation => {
                self.checkpoints
                    .clear()
                    .context("cannot remove checkpoint file")?;
                info!("migration completed successfully, checkpoint file deleted");
            }
            Outcome::Completed => info!("simulation completed"),
            Outcome::Cancelled => {
                info!("migration interrupted, checkpoint kept for resume");
            }
        }
        Ok(Summary {
            outcome,
            processed: totals.processed,
            skipped: totals.skipped,
            bytes: totals.bytes,
        })
    }

    /// Resolves every source folder to its destination, skipping the root
    /// folder (its messages live in their label folders) and folders whose
    /// mapping is the drop sentinel.
    fn plan(&mut self) -> Result<Vec<PlanEntry>> {
        let folders = self
            .source
            .list_folders()
            .context("cannot list source folders")?;
        let existing: HashSet<String> = self
            .dest
            .list_folders()
            .context("cannot list destination folders")?
            .into_iter()
            .collect();
        let mut plan = Vec::new();
        for folder in folders {
            self.stats.record("source_folders", &folder);
            if folder == self.root_folder {
                debug!("skipping root folder {}", folder);
                continue;
            }
            let dest = match self.mapper.resolve(std::slice::from_ref(&folder)) {
                Some(dest) => dest,
                None => {
                    debug!("skipping folder {}, its mapping is set to drop", folder);
                    continue;
                }
            };
            let missing = !dest.eq_ignore_ascii_case("INBOX") && !existing.contains(&dest);
            plan.push(PlanEntry {
                source: folder,
                dest,
                missing,
            });
        }
        Ok(plan)
    }

    fn prepare_folders(&mut self, plan: &[PlanEntry]) -> Result<()> {
        if self.simulation {
            return Ok(());
        }
        let mut created = HashSet::new();
        for entry in plan.iter().filter(|e| e.missing) {
            if created.insert(entry.dest.clone()) {
                debug!("creating destination folder {}", entry.dest);
                self.dest
                    .create_folder(&entry.dest)
                    .with_context(|| format!("cannot create destination folder {}", entry.dest))?;
            }
        }
        Ok(())
    }

    /// Returns true when the run was cancelled mid-folder.
    fn migrate_folder(
        &mut self,
        folder: &str,
        dest: &str,
        start: u32,
        totals: &mut Totals,
    ) -> Result<bool> {
        let count = self
            .source
            .select_folder(folder)
            .with_context(|| format!("cannot select source folder {}", folder))?;
        if start >= count {
            debug!("folder {} has no messages left to migrate", folder);
            return Ok(false);
        }
        info!("migrating {} messages from {} to {}", count, folder, dest);
        let progress = create_progress_bar(self.quiet, count as u64);
        progress.inc(start as u64);
        for index in start..count {
            if self.cancel.is_cancelled() {
                progress.finish_and_clear();
                info!(
                    "cancellation requested, stopping before message {} of {}",
                    index + 1,
                    folder
                );
                return Ok(true);
            }
            match self.migrate_message(folder, dest, index) {
                Ok(size) => {
                    totals.processed += 1;
                    totals.bytes += size;
                    self.stats.record("folder", dest);
                }
                Err(TransportError::Malformed(reason)) => {
                    warn!("skipping message {} in {}: {}", index + 1, folder, reason);
                    totals.skipped += 1;
                    self.stats.record("skipped", folder);
                }
                Err(err) => {
                    progress.finish_and_clear();
                    return Err(err).with_context(|| {
                        format!("migration of {} failed at message {}", folder, index + 1)
                    });
                }
            }
            if !self.simulation {
                self.save_checkpoint(folder, index, totals)?;
            }
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(false)
    }

    fn migrate_message(
        &mut self,
        folder: &str,
        dest: &str,
        index: u32,
    ) -> std::result::Result<u64, TransportError> {
        let message = self.source.fetch_message(index)?;
        if message.body.is_empty() {
            return Err(TransportError::Malformed("empty message body".to_string()));
        }
        let size = message.body.len() as u64;
        self.record_sender(&message.body);

        let body = self
            .extractor
            .process(&message.body, message.internal_date, &mut self.stats);

        let mut flags = message.flags.clone();
        if self.should_flag(&message.labels, folder) && !flags.iter().any(|f| f == "\\Flagged") {
            flags.push("\\Flagged".to_string());
        }

        debug!("migrating message {} from {} to {}", index + 1, folder, dest);
        if !self.simulation {
            self.dest.append(dest, &body, &flags, message.internal_date)?;
        }
        Ok(size)
    }

    fn should_flag(&self, labels: &[String], folder: &str) -> bool {
        self.labels_as_flagged
            .iter()
            .any(|flagged| flagged == folder || labels.iter().any(|l| l == flagged))
    }

    fn record_sender(&mut self, body: &[u8]) {
        let domain = mailparse::parse_headers(body)
            .ok()
            .and_then(|(headers, _)| headers.get_first_value("From"))
            .and_then(|from| mailparse::addrparse(&from).ok())
            .and_then(|addrs| addrs.extract_single_info())
            .and_then(|info| {
                info.addr
                    .rsplit_once('@')
                    .map(|(_, domain)| domain.to_ascii_lowercase())
            });
        self.stats
            .record("sender_domain", domain.as_deref().unwrap_or("unknown"));
    }

    fn save_checkpoint(&self, folder: &str, index: u32, totals: &Totals) -> Result<()> {
        let checkpoint = Checkpoint {
            folder: folder.to_string(),
            last_processed_index: index,
            processed: totals.processed,
            bytes: totals.bytes,
            skipped: totals.skipped,
            updated_at: Utc::now(),
        };
        self.checkpoints
            .save(&checkpoint)
            .context("cannot persist checkpoint")
    }
}

fn print_plan(plan: &[PlanEntry]) {
    info!("=== Folder Mapping ===");
    for entry in plan {
        info!(
            "{:<30} -> {}{}",
            entry.source,
            entry.dest,
            if entry.missing { " *" } else { "" }
        );
    }
    info!("destination folders marked with * are missing and will be created");
}

fn create_progress_bar(quiet: bool, len: u64) -> ProgressBar {
    if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(len)
    }
}
