//! Similarity-based quorum over buffered state reports.
//!
//! Reports for the same (subject, partition) are grouped. A group resolves
//! once it holds a report from at least `quota` distinct authorities, or once
//! its oldest report has waited longer than the commit timeout. A state is
//! only written when at least two reports corroborate it.

use crate::store::{DurableStore, PendingCommit, StoreTable};
use log::{debug, info, warn};
use shared::{AuthorityId, PartitionId, SubjectId, SubjectState, ZoneConfig};
use std::collections::{BTreeMap, HashMap};

/// Minimum number of agreeing reports for a commit.
pub const MIN_CORROBORATION: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Succeeded,
    Failed,
}

/// Outcome for one buffered report, to be sent back to its origin host.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitResolution {
    pub commit: PendingCommit,
    pub outcome: CommitOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupVerdict {
    pub subject: SubjectId,
    pub partition: PartitionId,
    /// The state written durably, if the group reached quorum.
    pub committed: Option<SubjectState>,
    pub winner: Option<AuthorityId>,
    pub timed_out: bool,
    pub resolutions: Vec<CommitResolution>,
}

impl GroupVerdict {
    pub fn is_committed(&self) -> bool {
        self.committed.is_some()
    }
}

pub struct CommitQuorum {
    quota: usize,
    timeout_ms: u64,
    tolerance: f32,
}

impl CommitQuorum {
    pub fn new(config: &ZoneConfig) -> Self {
        Self {
            quota: config.authority_quota,
            timeout_ms: config.commit_timeout_ms,
            tolerance: config.position_tolerance,
        }
    }

    /// Resolves every ready group under the commit table lock, writes the
    /// winning states and deletes the resolved rows.
    pub fn run<S: DurableStore>(&self, store: &S, now_ms: u64) -> Vec<GroupVerdict> {
        store.exclusive(StoreTable::Commits, || {
            let mut groups: BTreeMap<(SubjectId, PartitionId), Vec<PendingCommit>> =
                BTreeMap::new();
            for commit in store.pending_commits() {
                groups
                    .entry((commit.subject, commit.partition))
                    .or_default()
                    .push(commit);
            }

            let mut verdicts = Vec::new();
            let mut resolved_ids = Vec::new();
            for ((subject, partition), reports) in groups {
                let Some(timed_out) = self.readiness(&reports, now_ms) else {
                    continue;
                };
                let verdict = self.resolve_group(subject, partition, reports, timed_out);
                if let Some(state) = &verdict.committed {
                    match state.to_snapshot() {
                        Ok(snapshot) => store.write_subject_state(subject, &snapshot),
                        Err(e) => warn!("Failed to encode committed state of {}: {}", subject, e),
                    }
                }
                resolved_ids.extend(verdict.resolutions.iter().map(|r| r.commit.id));
                verdicts.push(verdict);
            }

            if !resolved_ids.is_empty() {
                let deleted = store.delete_commits(&resolved_ids);
                debug!("Purged {} resolved commit rows", deleted);
            }
            verdicts
        })
    }

    /// `Some(timed_out)` when the group should be resolved now.
    fn readiness(&self, reports: &[PendingCommit], now_ms: u64) -> Option<bool> {
        let mut authorities: Vec<AuthorityId> = reports.iter().map(|r| r.authority).collect();
        authorities.sort();
        authorities.dedup();
        if authorities.len() >= self.quota {
            return Some(false);
        }

        let oldest = reports.iter().map(|r| r.received_ms).min()?;
        if now_ms.saturating_sub(oldest) > self.timeout_ms {
            return Some(true);
        }
        None
    }

    /// Decides one group. Only the latest report from each authority votes;
    /// older ones and undecodable ones fail.
    pub fn resolve_group(
        &self,
        subject: SubjectId,
        partition: PartitionId,
        reports: Vec<PendingCommit>,
        timed_out: bool,
    ) -> GroupVerdict {
        let mut latest: HashMap<AuthorityId, PendingCommit> = HashMap::new();
        let mut resolutions = Vec::new();
        for report in reports {
            match latest.remove(&report.authority) {
                Some(previous)
                    if (previous.received_ms, previous.id) > (report.received_ms, report.id) =>
                {
                    resolutions.push(failed(report));
                    latest.insert(previous.authority, previous);
                }
                Some(previous) => {
                    resolutions.push(failed(previous));
                    latest.insert(report.authority, report);
                }
                None => {
                    latest.insert(report.authority, report);
                }
            }
        }

        let mut voters: Vec<(PendingCommit, SubjectState)> = Vec::new();
        let mut ballots: Vec<PendingCommit> = latest.into_values().collect();
        ballots.sort_by_key(|r| r.authority);
        for report in ballots {
            match SubjectState::from_snapshot(&report.snapshot) {
                Ok(state) => voters.push((report, state)),
                Err(e) => {
                    warn!(
                        "Discarding undecodable report from {} for {}: {}",
                        report.authority, subject, e
                    );
                    resolutions.push(failed(report));
                }
            }
        }

        // A report counts itself, so a lone report scores one.
        let scores: Vec<usize> = voters
            .iter()
            .map(|(_, state)| {
                voters
                    .iter()
                    .filter(|(_, other)| state.is_similar(other, self.tolerance))
                    .count()
            })
            .collect();

        // Voters are sorted by authority, so the first maximum wins ties.
        let best = scores
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, usize)>, (index, score)| match best {
                Some((_, top)) if top >= *score => best,
                _ => Some((index, *score)),
            });

        let mut verdict = GroupVerdict {
            subject,
            partition,
            committed: None,
            winner: None,
            timed_out,
            resolutions,
        };

        match best {
            Some((index, score)) if score >= MIN_CORROBORATION => {
                let winning = voters[index].1.clone();
                let winner = voters[index].0.authority;
                for (report, state) in voters {
                    let outcome = if state.is_similar(&winning, self.tolerance) {
                        CommitOutcome::Succeeded
                    } else {
                        CommitOutcome::Failed
                    };
                    verdict.resolutions.push(CommitResolution {
                        commit: report,
                        outcome,
                    });
                }
                info!(
                    "Committed {} in {} from {} ({} agreeing reports)",
                    subject, partition, winner, score
                );
                verdict.committed = Some(winning);
                verdict.winner = Some(winner);
            }
            _ => {
                info!(
                    "Rejected {} reports for {} in {}: no corroboration{}",
                    voters.len(),
                    subject,
                    partition,
                    if timed_out { " before timeout" } else { "" }
                );
                verdict
                    .resolutions
                    .extend(voters.into_iter().map(|(report, _)| failed(report)));
            }
        }

        verdict
    }
}

fn failed(commit: PendingCommit) -> CommitResolution {
    CommitResolution {
        commit,
        outcome: CommitOutcome::Failed,
    }
}
