use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use tracing::{debug, info};

use crate::metadata::GenerationKey;
use crate::repository::Repository;
use crate::types::GenerationId;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Period {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "h" => Some(Period::Hourly),
            "d" => Some(Period::Daily),
            "w" => Some(Period::Weekly),
            "m" => Some(Period::Monthly),
            "y" => Some(Period::Yearly),
            _ => None,
        }
    }

    fn suffix(self) -> char {
        match self {
            Period::Hourly => 'h',
            Period::Daily => 'd',
            Period::Weekly => 'w',
            Period::Monthly => 'm',
            Period::Yearly => 'y',
        }
    }
}

/// Keep the newest generation in each of the `count` most recent periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionRule {
    pub period: Period,
    pub count: usize,
}

/// Which generations survive a forget run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_last: Option<usize>,
    pub rules: Vec<RetentionRule>,
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.keep_last.is_none() && self.rules.is_empty()
    }

    pub fn with_keep_last(mut self, count: usize) -> Self {
        self.keep_last = Some(count);
        self
    }

    /// Indices into `times` of the generations to keep. `times` must be
    /// sorted oldest first.
    pub fn select(&self, times: &[DateTime<Utc>]) -> HashSet<usize> {
        let newest_first: Vec<usize> = (0..times.len()).rev().collect();
        let mut kept = HashSet::new();

        if let Some(count) = self.keep_last {
            kept.extend(newest_first.iter().take(count).copied());
        }
        for rule in &self.rules {
            match rule.period {
                Period::Hourly => keep_per_bucket(&newest_first, times, &mut kept, rule.count, |t| {
                    (t.year(), t.ordinal(), t.hour())
                }),
                Period::Daily => keep_per_bucket(&newest_first, times, &mut kept, rule.count, |t| {
                    (t.year(), t.ordinal(), 0)
                }),
                Period::Weekly => keep_per_bucket(&newest_first, times, &mut kept, rule.count, |t| {
                    let week = t.iso_week();
                    (week.year(), week.week(), 0)
                }),
                Period::Monthly => keep_per_bucket(&newest_first, times, &mut kept, rule.count, |t| {
                    (t.year(), t.month(), 0)
                }),
                Period::Yearly => keep_per_bucket(&newest_first, times, &mut kept, rule.count, |t| {
                    (t.year(), 0, 0)
                }),
            }
        }
        kept
    }
}

/// Walk newest first; the first generation seen in each new bucket is kept,
/// until `max_buckets` buckets have been used.
fn keep_per_bucket<K: Eq + Hash>(
    newest_first: &[usize],
    times: &[DateTime<Utc>],
    kept: &mut HashSet<usize>,
    max_buckets: usize,
    bucket_of: impl Fn(&DateTime<Utc>) -> K,
) {
    let mut seen = HashSet::new();
    for &idx in newest_first {
        if seen.len() >= max_buckets {
            break;
        }
        if seen.insert(bucket_of(&times[idx])) {
            kept.insert(idx);
        }
    }
}

impl FromStr for RetentionPolicy {
    type Err = Error;

    /// Parse comma-separated rules such as `72h,7d,5w,12m,1y`.
    fn from_str(s: &str) -> Result<Self> {
        let mut policy = RetentionPolicy::default();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let split_at = part
                .find(|c: char| !c.is_ascii_digit())
                .ok_or_else(|| Error::Other(format!("Forget policy syntax error: {part}")))?;
            let (count, suffix) = part.split_at(split_at);
            let count: usize = count
                .parse()
                .map_err(|_| Error::Other(format!("Forget policy syntax error: {part}")))?;
            let period = Period::from_suffix(suffix)
                .ok_or_else(|| Error::Other(format!("Forget policy syntax error: {part}")))?;
            policy.rules.retain(|rule| rule.period != period);
            policy.rules.push(RetentionRule { period, count });
        }
        Ok(policy)
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .rules
            .iter()
            .map(|rule| format!("{}{}", rule.count, rule.period.suffix()))
            .collect();
        if let Some(count) = self.keep_last {
            parts.push(format!("last {count}"));
        }
        f.write_str(&parts.join(","))
    }
}

/// Outcome of applying a policy to one client.
#[derive(Debug, Clone, Default)]
pub struct ForgetPlan {
    pub keep: Vec<GenerationId>,
    pub remove: Vec<GenerationId>,
}

/// Time a generation is judged by: when it ended, else when it started.
async fn generation_time(repo: &mut Repository, gen_id: &GenerationId) -> Result<DateTime<Utc>> {
    let (started, ended) = repo.get_generation_times(gen_id).await?;
    let secs = ended.or(started).unwrap_or(0);
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .ok_or_else(|| Error::Corrupted(format!("{gen_id}: invalid timestamp {secs}")))
}

/// Work out which generations of `client` the policy keeps. Checkpoints are
/// never kept in place of a real generation.
///
/// Callers that act on the plan should hold the client lock, so that the
/// generation list cannot change underneath them.
pub async fn plan(repo: &mut Repository, client: &str, policy: &RetentionPolicy) -> Result<ForgetPlan> {
    if policy.is_empty() {
        return Err(Error::Other("Forget policy keeps nothing".to_string()));
    }
    let mut complete = Vec::new();
    let mut checkpoints = Vec::new();
    for gen_id in repo.get_client_generation_ids(client).await? {
        if repo.get_generation_key(&gen_id, GenerationKey::Ended).await?.is_none() {
            continue;
        }
        if repo.is_checkpoint(&gen_id).await? {
            checkpoints.push(gen_id);
        } else {
            let time = generation_time(repo, &gen_id).await?;
            complete.push((gen_id, time));
        }
    }

    let times: Vec<DateTime<Utc>> = complete.iter().map(|(_, t)| *t).collect();
    let kept = policy.select(&times);
    if !complete.is_empty() && kept.is_empty() {
        return Err(Error::Other(format!(
            "refusing to forget: policy {policy} would remove every generation of {client}"
        )));
    }

    let mut result = ForgetPlan::default();
    for (idx, (gen_id, _)) in complete.into_iter().enumerate() {
        if kept.contains(&idx) {
            result.keep.push(gen_id);
        } else {
            result.remove.push(gen_id);
        }
    }
    let newest_kept = result.keep.last().map(|id| id.number);
    for gen_id in checkpoints {
        match newest_kept {
            Some(newest) if gen_id.number < newest => result.remove.push(gen_id),
            _ => result.keep.push(gen_id),
        }
    }
    result.keep.sort();
    result.remove.sort();
    debug!(client = %client, keep = result.keep.len(), remove = result.remove.len(), "Planned forget");
    Ok(result)
}

/// Resolve explicit generation specs ("latest" or a number) of `client`.
/// Every other generation is kept.
pub async fn plan_generations(repo: &mut Repository, client: &str, specs: &[String]) -> Result<ForgetPlan> {
    let mut remove = Vec::new();
    for spec in specs {
        remove.push(repo.interpret_generation_spec(client, spec).await?);
    }
    remove.sort();
    remove.dedup();
    let keep = repo
        .get_client_generation_ids(client)
        .await?
        .into_iter()
        .filter(|gen_id| !remove.contains(gen_id))
        .collect();
    Ok(ForgetPlan { keep, remove })
}

/// Which generations a forget run targets.
#[derive(Debug, Clone, Copy)]
pub enum Selection<'a> {
    Policy(&'a RetentionPolicy),
    Generations(&'a [String]),
}

/// Remove every generation of `client` the policy does not keep.
pub async fn forget(
    repo: &mut Repository,
    client: &str,
    policy: &RetentionPolicy,
    dry_run: bool,
) -> Result<ForgetPlan> {
    forget_selected(repo, client, Selection::Policy(policy), dry_run).await
}

/// Remove exactly the generations named by `specs`.
pub async fn forget_generations(
    repo: &mut Repository,
    client: &str,
    specs: &[String],
    dry_run: bool,
) -> Result<ForgetPlan> {
    forget_selected(repo, client, Selection::Generations(specs), dry_run).await
}

/// Lock the client and the chunk indexes, plan under the locks, then remove
/// and commit. Every failure path and a dry run release both locks.
pub async fn forget_selected(
    repo: &mut Repository,
    client: &str,
    selection: Selection<'_>,
    dry_run: bool,
) -> Result<ForgetPlan> {
    repo.lock_client(client).await?;
    if let Err(e) = repo.lock_chunk_indexes().await {
        repo.unlock_client(client).await?;
        return Err(e);
    }

    let outcome = remove_selected(repo, client, selection, dry_run).await;
    let result = match outcome {
        Ok(result) if !dry_run && !result.remove.is_empty() => result,
        other => {
            repo.unlock_chunk_indexes().await?;
            repo.unlock_client(client).await?;
            return other;
        }
    };

    if let Err(e) = repo.commit_client(client).await {
        repo.unlock_chunk_indexes().await?;
        if repo.got_client_lock(client) {
            repo.unlock_client(client).await?;
        }
        return Err(e);
    }
    if let Err(e) = repo.commit_chunk_indexes().await {
        if repo.got_chunk_indexes_lock() {
            repo.unlock_chunk_indexes().await?;
        }
        return Err(e);
    }
    Ok(result)
}

async fn remove_selected(
    repo: &mut Repository,
    client: &str,
    selection: Selection<'_>,
    dry_run: bool,
) -> Result<ForgetPlan> {
    let result = match selection {
        Selection::Policy(policy) => plan(repo, client, policy).await?,
        Selection::Generations(specs) => plan_generations(repo, client, specs).await?,
    };
    if dry_run {
        return Ok(result);
    }
    for gen_id in &result.remove {
        repo.remove_generation(gen_id).await?;
        info!(generation = %gen_id, "Forgot generation");
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::hooks::Hooks;
    use crate::memory::MemoryBackend;
    use crate::types::RepositorySettings;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_policy() {
        let policy: RetentionPolicy = "72h,7d,5w,12m,1y".parse().unwrap();
        assert_eq!(policy.rules.len(), 5);
        assert_eq!(
            policy.rules[1],
            RetentionRule {
                period: Period::Daily,
                count: 7
            }
        );
        assert_eq!(policy.to_string(), "72h,7d,5w,12m,1y");
        assert!("7x".parse::<RetentionPolicy>().is_err());
        assert!("d".parse::<RetentionPolicy>().is_err());
        assert!("".parse::<RetentionPolicy>().unwrap().is_empty());
    }

    #[test]
    fn test_daily_keeps_newest_per_day() {
        let times = vec![
            at("2024-01-01T08:00:00Z"),
            at("2024-01-01T20:00:00Z"),
            at("2024-01-02T08:00:00Z"),
            at("2024-01-03T08:00:00Z"),
            at("2024-01-03T09:00:00Z"),
        ];
        let policy: RetentionPolicy = "2d".parse().unwrap();
        let kept = policy.select(&times);
        assert_eq!(kept, HashSet::from([2, 4]));

        let policy = policy.with_keep_last(1);
        assert_eq!(policy.select(&times), HashSet::from([2, 4]));

        let policy: RetentionPolicy = "1y".parse().unwrap();
        assert_eq!(policy.select(&times), HashSet::from([4]));
    }

    #[test]
    fn test_weekly_uses_iso_weeks() {
        // 2024-12-30 belongs to ISO week 1 of 2025.
        let times = vec![at("2024-12-29T12:00:00Z"), at("2024-12-30T12:00:00Z")];
        let policy: RetentionPolicy = "2w".parse().unwrap();
        assert_eq!(policy.select(&times), HashSet::from([0, 1]));
    }

    static CLOCK: AtomicU64 = AtomicU64::new(1_700_000_000);

    fn test_clock() -> u64 {
        CLOCK.fetch_add(86_400, Ordering::SeqCst)
    }

    fn settings() -> RepositorySettings {
        RepositorySettings {
            lock_timeout: 0,
            node_size: 8,
            chunk_size: 1024,
            ..Default::default()
        }
    }

    async fn backup(repo: &mut Repository, byte: u8) -> GenerationId {
        repo.lock_client("alice").await.unwrap();
        repo.lock_chunk_indexes().await.unwrap();
        let gen_id = repo.start_generation("alice").await.unwrap();
        repo.put_file_content(&gen_id, "/f", &vec![byte; 1024]).await.unwrap();
        repo.commit_everything().await.unwrap();
        gen_id
    }

    async fn repo_with_generations(backend: Arc<dyn Backend>, count: u8) -> (Repository, Vec<GenerationId>) {
        let mut repo = Repository::init(backend, settings(), Hooks::new()).await.unwrap();
        repo.set_clock(test_clock);
        repo.lock_client_list().await.unwrap();
        repo.add_client("alice").await.unwrap();
        repo.commit_client_list().await.unwrap();

        let mut ids = Vec::new();
        for day in 0..count {
            ids.push(backup(&mut repo, day).await);
        }
        (repo, ids)
    }

    fn assert_unlocked(repo: &Repository) {
        assert!(!repo.got_client_lock("alice"));
        assert!(!repo.got_chunk_indexes_lock());
    }

    #[tokio::test]
    async fn test_forget_removes_old_generations() {
        let (mut repo, ids) = repo_with_generations(Arc::new(MemoryBackend::new()), 4).await;

        let policy = RetentionPolicy::default().with_keep_last(2);
        let dry = forget(&mut repo, "alice", &policy, true).await.unwrap();
        assert_eq!(dry.remove, ids[..2].to_vec());
        assert_eq!(repo.get_client_generation_ids("alice").await.unwrap().len(), 4);
        assert_unlocked(&repo);

        let done = forget(&mut repo, "alice", &policy, false).await.unwrap();
        assert_eq!(done.keep, ids[2..].to_vec());
        assert_eq!(repo.get_client_generation_ids("alice").await.unwrap(), ids[2..].to_vec());
        assert_unlocked(&repo);

        let newest = repo.interpret_generation_spec("alice", "latest").await.unwrap();
        assert_eq!(repo.get_file_content(&newest, "/f").await.unwrap(), vec![3u8; 1024]);
    }

    #[tokio::test]
    async fn test_plan_sees_generations_committed_by_another_session() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let (mut repo, ids) = repo_with_generations(backend.clone(), 3).await;
        assert_eq!(repo.get_client_generation_ids("alice").await.unwrap(), ids);

        let mut other = Repository::open(backend, settings(), Hooks::new()).await.unwrap();
        other.set_clock(test_clock);
        let newest = backup(&mut other, 9).await;

        let policy = RetentionPolicy::default().with_keep_last(1);
        let done = forget(&mut repo, "alice", &policy, false).await.unwrap();
        assert_eq!(done.keep, vec![newest.clone()]);
        assert_eq!(done.remove, ids);
        assert_eq!(repo.get_client_generation_ids("alice").await.unwrap(), vec![newest]);
    }

    #[tokio::test]
    async fn test_forget_named_generations() {
        let (mut repo, ids) = repo_with_generations(Arc::new(MemoryBackend::new()), 3).await;
        let first = ids[0].number.to_string();

        let specs = vec![first.clone(), "latest".to_string(), first];
        let dry = forget_generations(&mut repo, "alice", &specs, true).await.unwrap();
        assert_eq!(dry.remove, vec![ids[0].clone(), ids[2].clone()]);
        assert_eq!(dry.keep, vec![ids[1].clone()]);
        assert_eq!(repo.get_client_generation_ids("alice").await.unwrap(), ids);

        forget_generations(&mut repo, "alice", &specs, false).await.unwrap();
        assert_eq!(repo.get_client_generation_ids("alice").await.unwrap(), vec![ids[1].clone()]);
        assert_unlocked(&repo);
    }

    #[tokio::test]
    async fn test_failed_forget_releases_locks_and_keeps_everything() {
        let (mut repo, ids) = repo_with_generations(Arc::new(MemoryBackend::new()), 2).await;
        let specs = vec![ids[0].number.to_string(), "999".to_string()];

        let err = forget_generations(&mut repo, "alice", &specs, false).await.unwrap_err();
        assert!(matches!(err, Error::GenerationDoesNotExist { .. }));
        assert_unlocked(&repo);
        assert_eq!(repo.get_client_generation_ids("alice").await.unwrap(), ids);

        let everything = RetentionPolicy::default().with_keep_last(0);
        assert!(forget(&mut repo, "alice", &everything, false).await.is_err());
        assert_unlocked(&repo);
    }
}
