use std::{collections::BTreeMap, sync::Arc};

use futures::future::join_all;
use shared::domain::{ConversationId, PendingMessage, TempId};
use tracing::{info, warn};

use crate::{guards::SessionGuards, offline_cache::OfflineCache, outbound::OptimisticWriter};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub sent: Vec<TempId>,
    pub failed: Vec<TempId>,
    /// Left untouched because an earlier entry in the same conversation failed.
    pub deferred: Vec<TempId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    AlreadyRunning,
    Offline,
    Completed(ReplayReport),
}

pub struct OfflineReplay {
    writer: Arc<OptimisticWriter>,
    cache: Arc<dyn OfflineCache>,
    guards: Arc<SessionGuards>,
}

impl OfflineReplay {
    pub fn new(
        writer: Arc<OptimisticWriter>,
        cache: Arc<dyn OfflineCache>,
        guards: Arc<SessionGuards>,
    ) -> Self {
        Self {
            writer,
            cache,
            guards,
        }
    }

    /// Resubmits the pending-send queue. Safe to call with an empty queue;
    /// a call made while a pass is running returns `AlreadyRunning`.
    pub async fn replay_pending(&self) -> ReplayOutcome {
        if !self.guards.is_online() {
            return ReplayOutcome::Offline;
        }
        let Some(_in_flight) = self.guards.try_begin_replay() else {
            info!("replay: pass already running");
            return ReplayOutcome::AlreadyRunning;
        };

        let queued = match self.cache.pending_messages().await {
            Ok(queued) => queued,
            Err(error) => {
                warn!("replay: failed to read pending queue: {error:#}");
                return ReplayOutcome::Completed(ReplayReport::default());
            }
        };
        if queued.is_empty() {
            return ReplayOutcome::Completed(ReplayReport::default());
        }
        info!(count = queued.len(), "replay: resubmitting pending messages");

        let groups = group_by_conversation(queued);
        let results = join_all(
            groups
                .into_iter()
                .map(|(conversation_id, entries)| self.replay_conversation(conversation_id, entries)),
        )
        .await;

        let mut report = ReplayReport::default();
        for partial in results {
            report.sent.extend(partial.sent);
            report.failed.extend(partial.failed);
            report.deferred.extend(partial.deferred);
        }
        info!(
            sent = report.sent.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            "replay: pass finished"
        );
        ReplayOutcome::Completed(report)
    }

    /// Sequential within one conversation; stops at the first failure so later
    /// messages never overtake an earlier one.
    async fn replay_conversation(
        &self,
        conversation_id: ConversationId,
        entries: Vec<PendingMessage>,
    ) -> ReplayReport {
        let mut report = ReplayReport::default();
        let mut entries = entries.into_iter();
        while let Some(pending) = entries.next() {
            let temp_id = pending.temp_id.clone();
            match self.writer.resubmit(pending).await {
                Ok(_) => report.sent.push(temp_id),
                Err(reason) => {
                    warn!(conversation_id = %conversation_id, temp_id = %temp_id, "replay: resubmit failed: {reason}");
                    report.failed.push(temp_id);
                    report
                        .deferred
                        .extend(entries.by_ref().map(|pending| pending.temp_id));
                    break;
                }
            }
        }
        report
    }
}

fn group_by_conversation(queued: Vec<PendingMessage>) -> BTreeMap<ConversationId, Vec<PendingMessage>> {
    let mut groups: BTreeMap<ConversationId, Vec<PendingMessage>> = BTreeMap::new();
    for pending in queued {
        groups
            .entry(pending.conversation_id.clone())
            .or_default()
            .push(pending);
    }
    for entries in groups.values_mut() {
        entries.sort_by_key(|pending| pending.timestamp);
    }
    groups
}

#[cfg(test)]
#[path = "tests/replay_tests.rs"]
mod tests;
