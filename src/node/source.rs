/*!
 * Source role: keep this host's own store current and judge the replicas
 * from the stores they have published into the source control directory.
 */

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

use super::status::{replica_line, source_line};
use crate::config::Context;
use crate::core::consistency::evaluate;
use crate::core::scanner::{ScanSummary, Scanner};
use crate::core::store::{state_file_name, state_file_path, FingerprintStore, CONTROL_DIR};
use crate::error::Result;

pub struct SourceRole<'a> {
    context: &'a Context,
}

impl<'a> SourceRole<'a> {
    pub fn new(context: &'a Context) -> Self {
        Self { context }
    }

    pub fn state_file(&self) -> PathBuf {
        let source = &self.context.source;
        state_file_path(&source.path, &source.host, self.context.id)
    }

    pub fn scan(&self) -> Result<ScanSummary> {
        let settings = &self.context.settings;
        info!("Scanning source {}:{}", self.context.id, self.context.source);
        let mut store = FingerprintStore::open(self.state_file(), settings.lazy_write)?;
        let summary = Scanner::new(
            &self.context.source.path,
            &settings.exclusions,
            settings.hashing,
        )
        .scan(&mut store)?;
        info!(
            "Source {} holds {} files ({} new, {} changed, {} deleted)",
            self.context.source,
            store.len(),
            summary.added,
            summary.modified,
            summary.removed
        );
        Ok(summary)
    }

    /// Source summary line followed by one line per replica
    pub fn status(&self) -> Vec<String> {
        let context = self.context;
        let source = FingerprintStore::read_only(self.state_file());
        let mut lines = vec![source_line(&context.source, &source)];

        for replica in &context.replicas {
            let published = state_file_path(&context.source.path, &replica.host, context.id);
            let store = FingerprintStore::read_only(published);
            let report = evaluate(&source, &store);
            debug!(
                "{}: {} reconciled, {} missing, {} mismatched, {} extra",
                replica, report.reconciled, report.missing, report.mismatched, report.extra
            );
            lines.push(replica_line(replica, &report, context.settings.cycle));
        }

        self.log_extraneous_state_files();
        lines
    }

    /// Names in the control directory for this context that belong to no
    /// known host. They are reported, never removed.
    pub fn extraneous_state_files(&self) -> Vec<String> {
        let context = self.context;
        let dir = context.source.path.join(CONTROL_DIR);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };

        let suffix = format!(".{}.json", context.id);
        let known: BTreeSet<String> = std::iter::once(&context.source)
            .chain(context.replicas.iter())
            .map(|location| state_file_name(&location.host, context.id))
            .collect();

        let mut extraneous: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(&suffix) && !known.contains(name))
            .collect();
        extraneous.sort();
        extraneous
    }

    fn log_extraneous_state_files(&self) {
        for name in self.extraneous_state_files() {
            info!(
                "extraneous state file {}/{}/{}",
                self.context.source.path.display(),
                CONTROL_DIR,
                name
            );
        }
    }
}
