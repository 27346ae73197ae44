//! Maps one pass's issues onto persistent thread records.
//!
//! Fingerprints are the only matching key. Each record change is a
//! read-decide-write against the store with a compare-and-swap put, so two
//! reconcilers racing on the same file cannot silently overwrite each other.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::issue::Issue;
use crate::threads::{
    HostSync, PastOccurrence, ThreadRecord, ThreadScope, ThreadStatus, ThreadStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ThreadAction {
    /// A fingerprint with no active thread. `record` is the stored record.
    Create { issue: Issue, record: ThreadRecord },
    /// The issue persists from an earlier pass.
    Update { issue: Issue, record: ThreadRecord },
    /// A previously active fingerprint is gone from this pass.
    MarkFixed { record: ThreadRecord },
}

impl ThreadAction {
    pub fn fingerprint(&self) -> &str {
        match self {
            ThreadAction::Create { record, .. }
            | ThreadAction::Update { record, .. }
            | ThreadAction::MarkFixed { record } => &record.fingerprint,
        }
    }

    pub fn record(&self) -> &ThreadRecord {
        match self {
            ThreadAction::Create { record, .. }
            | ThreadAction::Update { record, .. }
            | ThreadAction::MarkFixed { record } => record,
        }
    }
}

/// Identifies one reconciliation pass. `sequence` comes from
/// `ThreadStore::begin_pass` and makes repeated calls for the same pass no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewPass {
    pub sequence: u64,
    pub iteration: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub actions: Vec<ThreadAction>,
    /// Conflicts that survived the retry. The next pass picks them up again.
    pub warnings: Vec<String>,
}

/// Reconciles `issues` for `scope` against `store`.
///
/// CREATE and UPDATE actions follow issue order; MARK_FIXED actions follow,
/// sorted by fingerprint. Store failures other than conflicts propagate.
pub fn reconcile<S: ThreadStore + ?Sized>(
    scope: &ThreadScope,
    issues: &[Issue],
    store: &S,
    pass: ReviewPass,
) -> Result<Reconciliation> {
    let previously_active: BTreeSet<String> = store
        .list(scope)?
        .into_iter()
        .filter(|r| r.status.is_active())
        .map(|r| r.fingerprint)
        .collect();

    let mut result = Reconciliation::default();
    let mut seen = HashSet::new();

    for issue in issues {
        if !seen.insert(issue.fingerprint.as_str()) {
            debug!(fingerprint = %issue.fingerprint, "duplicate issue in pass, skipping");
            continue;
        }
        let outcome = with_retry(store, scope, &issue.fingerprint, |existing| {
            decide_present(existing, issue, pass)
        });
        collect(outcome, &issue.fingerprint, &mut result)?;
    }

    for fingerprint in previously_active.iter().filter(|fp| !seen.contains(fp.as_str())) {
        let outcome = with_retry(store, scope, fingerprint, |existing| {
            decide_absent(existing, pass)
        });
        collect(outcome, fingerprint, &mut result)?;
    }

    debug!(
        file = %scope.file_path,
        pass = pass.sequence,
        actions = result.actions.len(),
        "reconciled"
    );
    Ok(result)
}

/// Planned write: the record to store, the revision it must replace, and
/// the action to report once the write succeeds.
struct Decision {
    record: ThreadRecord,
    expected_revision: Option<u64>,
    kind: ActionKind,
}

enum ActionKind {
    Create(Issue),
    Update(Issue),
    MarkFixed,
}

fn decide_present(existing: Option<ThreadRecord>, issue: &Issue, pass: ReviewPass) -> Option<Decision> {
    match existing {
        None => Some(Decision {
            record: new_record(issue, pass, Vec::new()),
            expected_revision: None,
            kind: ActionKind::Create(issue.clone()),
        }),
        Some(record) if record.last_pass >= pass.sequence => None,
        Some(record) if record.status.is_active() => {
            let expected_revision = Some(record.revision);
            let record = ThreadRecord {
                status: ThreadStatus::Updated,
                last_seen_iteration: pass.iteration,
                line: issue.line,
                description: issue.description.clone(),
                last_pass: pass.sequence,
                ..record
            };
            Some(Decision {
                record,
                expected_revision,
                kind: ActionKind::Update(issue.clone()),
            })
        }
        Some(fixed) => {
            // Fixed threads are never reopened; the reappearance is a new occurrence.
            let expected_revision = Some(fixed.revision);
            let mut history = fixed.history;
            history.push(PastOccurrence {
                external_thread_id: fixed.external_thread_id,
                first_seen_iteration: fixed.first_seen_iteration,
                last_seen_iteration: fixed.last_seen_iteration,
                fixed_in_iteration: fixed.fixed_in_iteration.unwrap_or(fixed.last_seen_iteration),
            });
            Some(Decision {
                record: new_record(issue, pass, history),
                expected_revision,
                kind: ActionKind::Create(issue.clone()),
            })
        }
    }
}

fn decide_absent(existing: Option<ThreadRecord>, pass: ReviewPass) -> Option<Decision> {
    let record = existing?;
    if !record.status.is_active() || record.last_pass >= pass.sequence {
        return None;
    }
    let expected_revision = Some(record.revision);
    // Cleared once the host confirms; until then later passes retry.
    let host_sync = if record.external_thread_id.is_some() {
        HostSync::ConfirmPending
    } else {
        HostSync::Synced
    };
    Some(Decision {
        record: ThreadRecord {
            status: ThreadStatus::Fixed,
            fixed_in_iteration: Some(pass.iteration),
            last_pass: pass.sequence,
            host_sync,
            ..record
        },
        expected_revision,
        kind: ActionKind::MarkFixed,
    })
}

fn new_record(issue: &Issue, pass: ReviewPass, history: Vec<PastOccurrence>) -> ThreadRecord {
    ThreadRecord {
        fingerprint: issue.fingerprint.clone(),
        external_thread_id: None,
        status: ThreadStatus::Open,
        first_seen_iteration: pass.iteration,
        last_seen_iteration: pass.iteration,
        fixed_in_iteration: None,
        line: issue.line,
        description: issue.description.clone(),
        last_pass: pass.sequence,
        revision: 0,
        host_sync: HostSync::Synced,
        history,
    }
}

/// One read-decide-write, repeated once with a fresh read on conflict.
fn with_retry<S: ThreadStore + ?Sized>(
    store: &S,
    scope: &ThreadScope,
    fingerprint: &str,
    decide: impl Fn(Option<ThreadRecord>) -> Option<Decision>,
) -> Result<Option<ThreadAction>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(decision) = decide(store.get(scope, fingerprint)?) else {
            return Ok(None);
        };
        match store.put(scope, decision.record, decision.expected_revision) {
            Ok(record) => {
                let action = match decision.kind {
                    ActionKind::Create(issue) => ThreadAction::Create { issue, record },
                    ActionKind::Update(issue) => ThreadAction::Update { issue, record },
                    ActionKind::MarkFixed => ThreadAction::MarkFixed { record },
                };
                return Ok(Some(action));
            }
            Err(Error::ReconciliationConflict { .. }) if attempt < 2 => {
                debug!(fingerprint, "stale thread record, retrying with fresh read");
            }
            Err(e) => return Err(e),
        }
    }
}

fn collect(
    outcome: Result<Option<ThreadAction>>,
    fingerprint: &str,
    result: &mut Reconciliation,
) -> Result<()> {
    match outcome {
        Ok(Some(action)) => result.actions.push(action),
        Ok(None) => {}
        Err(e @ Error::ReconciliationConflict { .. }) => {
            warn!(fingerprint, error = %e, "thread update lost, next pass will retry");
            result.warnings.push(e.to_string());
        }
        Err(e) => return Err(e),
    }
    Ok(())
}
