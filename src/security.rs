//! Violation scoring and graduated response.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

const AUDIT_LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub conn_id: String,
    pub kind: ViolationKind,
    pub action: PolicyAction,
    pub at_unix: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    Minor,
    Moderate,
    Major,
    Critical,
}

impl ViolationKind {
    fn severity(self) -> u32 {
        match self {
            ViolationKind::Minor => 1,
            ViolationKind::Moderate => 3,
            ViolationKind::Major => 5,
            ViolationKind::Critical => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Warn,
    Throttle(u64),
    Disconnect,
    Ban,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::Minor => "minor",
            ViolationKind::Moderate => "moderate",
            ViolationKind::Major => "major",
            ViolationKind::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyAction::Allow => write!(f, "allow"),
            PolicyAction::Warn => write!(f, "warn"),
            PolicyAction::Throttle(secs) => write!(f, "throttle({secs}s)"),
            PolicyAction::Disconnect => write!(f, "disconnect"),
            PolicyAction::Ban => write!(f, "ban"),
        }
    }
}

struct Record {
    violations: Vec<(ViolationKind, Instant)>,
    score: u32,
    last_decay: Instant,
    banned: bool,
}

impl Record {
    fn new(now: Instant) -> Self {
        Self {
            violations: Vec::new(),
            score: 0,
            last_decay: now,
            banned: false,
        }
    }
}

const DECAY_INTERVAL: Duration = Duration::from_secs(300);
const DECAY_AMOUNT: u32 = 5;
const VIOLATION_WINDOW: Duration = Duration::from_secs(60);

/// Per-connection violation scoring with a graduated escalation ladder.
pub struct SecurityPolicy {
    records: Mutex<HashMap<String, Record>>,
    audit_log: Mutex<VecDeque<AuditEntry>>,
}

impl SecurityPolicy {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            audit_log: Mutex::new(VecDeque::with_capacity(AUDIT_LOG_CAPACITY)),
        }
    }

    pub async fn report(&self, conn_id: &str, kind: ViolationKind) -> PolicyAction {
        let now = Instant::now();
        let action = {
            let mut records = self.records.lock().await;
            let record = records.entry(conn_id.to_owned()).or_insert_with(|| Record::new(now));

            decay(record, now);

            record.violations.push((kind, now));
            record.score += kind.severity();

            if kind == ViolationKind::Critical {
                record.banned = true;
                PolicyAction::Ban
            } else {
                let recent_count = record
                    .violations
                    .iter()
                    .filter(|(_, at)| now.saturating_duration_since(*at) < VIOLATION_WINDOW)
                    .count();
                if recent_count > 5 || record.score >= 10 {
                    record.banned = true;
                    PolicyAction::Ban
                } else {
                    match record.score {
                        0..=2 => PolicyAction::Allow,
                        3..=5 => PolicyAction::Warn,
                        6..=8 => PolicyAction::Throttle(30),
                        _ => PolicyAction::Disconnect,
                    }
                }
            }
        };

        self.push_audit_entry(conn_id, kind, action).await;
        action
    }

    async fn push_audit_entry(&self, conn_id: &str, kind: ViolationKind, action: PolicyAction) {
        let at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mut log = self.audit_log.lock().await;
        if log.len() >= AUDIT_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(AuditEntry {
            conn_id: conn_id.to_owned(),
            kind,
            action,
            at_unix,
        });
    }

    pub async fn recent_violations(&self) -> Vec<AuditEntry> {
        self.audit_log.lock().await.iter().cloned().collect()
    }

    pub async fn is_banned(&self, conn_id: &str) -> bool {
        self.records
            .lock()
            .await
            .get(conn_id)
            .map(|r| r.banned)
            .unwrap_or(false)
    }

    pub async fn release(&self, conn_id: &str) {
        self.records.lock().await.remove(conn_id);
    }

    pub async fn banned_count(&self) -> usize {
        self.records.lock().await.values().filter(|r| r.banned).count()
    }

    pub async fn score(&self, conn_id: &str) -> u32 {
        self.records.lock().await.get(conn_id).map(|r| r.score).unwrap_or(0)
    }

    /// `(conn_id, score, banned)` for every connection with recorded state.
    pub async fn all_scores(&self) -> Vec<(String, u32, bool)> {
        self.records
            .lock()
            .await
            .iter()
            .map(|(id, r)| (id.clone(), r.score, r.banned))
            .collect()
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn decay(record: &mut Record, now: Instant) {
    let elapsed = now.saturating_duration_since(record.last_decay);
    let periods = (elapsed.as_secs() / DECAY_INTERVAL.as_secs()) as u32;
    if periods == 0 {
        return;
    }
    record.score = record.score.saturating_sub(periods * DECAY_AMOUNT);
    record.last_decay = now;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn critical_violation_bans_immediately() {
        let policy = SecurityPolicy::new();
        assert_eq!(policy.report("c1", ViolationKind::Critical).await, PolicyAction::Ban);
        assert!(policy.is_banned("c1").await);
    }

    #[tokio::test]
    async fn low_scores_allow() {
        let policy = SecurityPolicy::new();
        assert_eq!(policy.report("c1", ViolationKind::Minor).await, PolicyAction::Allow);
    }

    #[tokio::test]
    async fn accumulated_score_bans_at_threshold() {
        let policy = SecurityPolicy::new();
        policy.report("c1", ViolationKind::Major).await;
        let action = policy.report("c1", ViolationKind::Major).await;
        assert_eq!(action, PolicyAction::Ban);
    }

    #[tokio::test]
    async fn release_clears_the_record() {
        let policy = SecurityPolicy::new();
        policy.report("c1", ViolationKind::Critical).await;
        policy.release("c1").await;
        assert!(!policy.is_banned("c1").await);
    }
}
