use chrono::{Datelike, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::store::Tree;

/// Which registration collection an identifier is being minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Student,
    Teacher,
}

impl RecordKind {
    pub fn prefix(self) -> &'static str {
        match self {
            RecordKind::Student => "GES",
            RecordKind::Teacher => "GET",
        }
    }

    pub fn counter_path(self) -> &'static str {
        match self {
            RecordKind::Student => "counters/students",
            RecordKind::Teacher => "counters/teachers",
        }
    }

    pub fn collection(self) -> &'static str {
        match self {
            RecordKind::Student => "Students",
            RecordKind::Teacher => "Teachers",
        }
    }

    fn label(self) -> &'static str {
        match self {
            RecordKind::Student => "student",
            RecordKind::Teacher => "teacher",
        }
    }
}

/// Monotonic integer counter backing sequence reservation. `increment`
/// must be atomic under concurrent callers; it is the sole source of
/// uniqueness on the happy path.
pub trait SequenceCounter {
    fn get(&self) -> anyhow::Result<Option<i64>>;
    fn set(&self, value: i64) -> anyhow::Result<()>;
    fn increment(&self) -> anyhow::Result<i64>;
}

/// Read-only view of already-assigned identifiers and account usernames,
/// used for collision checks and counter reconciliation.
pub trait RecordDirectory {
    fn record_exists(&self, identifier: &str) -> anyhow::Result<bool>;
    fn username_taken(&self, candidate: &str) -> anyhow::Result<bool>;
    fn assigned_identifiers(&self) -> anyhow::Result<Vec<String>>;
}

const MAX_COLLISION_ATTEMPTS: u32 = 1000;

/// Reserve and format the next display identifier for `kind`:
/// `<PREFIX>_<seq, zero-padded to >=4>_<YY>`, e.g. `GES_0001_26`.
///
/// Never fails. If the counter is unavailable, or more than 1000
/// consecutive candidates collide, the identifier degrades to the low
/// digits of the current timestamp (`<PREFIX>_<6 digits>_<YY>`). Both
/// degradations trade strict sequencing for availability and are logged.
pub fn allocate(
    kind: RecordKind,
    counter: &dyn SequenceCounter,
    directory: &dyn RecordDirectory,
) -> String {
    let year_suffix = current_year_suffix();
    match allocate_sequenced(kind, counter, directory, &year_suffix) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(
                kind = kind.label(),
                error = %e,
                "sequence reservation failed; falling back to timestamp identifier"
            );
            timestamp_identifier(kind.prefix(), &year_suffix)
        }
    }
}

fn allocate_sequenced(
    kind: RecordKind,
    counter: &dyn SequenceCounter,
    directory: &dyn RecordDirectory,
    year_suffix: &str,
) -> anyhow::Result<String> {
    let mut seq = counter.increment()?;
    let mut candidate = format_identifier(kind.prefix(), seq, year_suffix);

    let mut attempts = 0;
    while directory.record_exists(&candidate)? || directory.username_taken(&candidate)? {
        attempts += 1;
        if attempts > MAX_COLLISION_ATTEMPTS {
            tracing::warn!(
                kind = kind.label(),
                attempts,
                "collision scan exhausted; falling back to timestamp identifier"
            );
            return Ok(timestamp_identifier(kind.prefix(), year_suffix));
        }
        seq += 1;
        candidate = format_identifier(kind.prefix(), seq, year_suffix);
    }
    Ok(candidate)
}

/// Raise the counter to the highest sequence number already assigned, so a
/// counter that drifted behind existing records never re-issues one. Run
/// once when a workspace is selected, not per allocation. Best-effort: the
/// collision scan in `allocate` remains the safety net, so failures here
/// are logged and swallowed.
pub fn reconcile_counter(
    kind: RecordKind,
    counter: &dyn SequenceCounter,
    directory: &dyn RecordDirectory,
) {
    let max_assigned = match directory.assigned_identifiers() {
        Ok(ids) => ids
            .iter()
            .filter_map(|id| parse_sequence(id, kind.prefix()))
            .max()
            .unwrap_or(0),
        Err(e) => {
            tracing::warn!(kind = kind.label(), error = %e, "counter reconciliation scan failed");
            return;
        }
    };
    if max_assigned == 0 {
        return;
    }
    match counter.get() {
        Ok(current) => {
            let current = current.unwrap_or(0);
            if current < max_assigned {
                tracing::info!(
                    kind = kind.label(),
                    current,
                    max_assigned,
                    "raising sequence counter to match assigned identifiers"
                );
                if let Err(e) = counter.set(max_assigned) {
                    tracing::warn!(kind = kind.label(), error = %e, "counter raise failed");
                }
            }
        }
        Err(e) => {
            tracing::warn!(kind = kind.label(), error = %e, "counter read failed during reconciliation");
        }
    }
}

fn format_identifier(prefix: &str, seq: i64, year_suffix: &str) -> String {
    format!("{prefix}_{seq:04}_{year_suffix}")
}

fn timestamp_identifier(prefix: &str, year_suffix: &str) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{prefix}_{:06}_{year_suffix}", secs % 1_000_000)
}

fn current_year_suffix() -> String {
    format!("{:02}", Utc::now().year() % 100)
}

/// Numeric portion of an identifier with the expected prefix, or None for
/// anything malformed (foreign prefixes and junk are skipped, not fatal).
fn parse_sequence(identifier: &str, prefix: &str) -> Option<i64> {
    let mut parts = identifier.split('_');
    if parts.next() != Some(prefix) {
        return None;
    }
    let seq = parts.next()?;
    let _year = parts.next()?;
    seq.parse::<i64>().ok()
}

/// Tree-backed counter for one record kind.
pub struct TreeCounter<'a> {
    tree: &'a Tree,
    path: &'static str,
}

impl<'a> TreeCounter<'a> {
    pub fn new(tree: &'a Tree, kind: RecordKind) -> Self {
        TreeCounter {
            tree,
            path: kind.counter_path(),
        }
    }
}

impl SequenceCounter for TreeCounter<'_> {
    fn get(&self) -> anyhow::Result<Option<i64>> {
        self.tree.counter_get(self.path)
    }

    fn set(&self, value: i64) -> anyhow::Result<()> {
        self.tree.counter_set(self.path, value)
    }

    fn increment(&self) -> anyhow::Result<i64> {
        self.tree.counter_increment(self.path)
    }
}

/// Tree-backed directory scanning the kind's record collection and the
/// shared `Users` accounts.
pub struct TreeDirectory<'a> {
    tree: &'a Tree,
    kind: RecordKind,
}

impl<'a> TreeDirectory<'a> {
    pub fn new(tree: &'a Tree, kind: RecordKind) -> Self {
        TreeDirectory { tree, kind }
    }
}

impl RecordDirectory for TreeDirectory<'_> {
    fn record_exists(&self, identifier: &str) -> anyhow::Result<bool> {
        self.tree
            .exists(&format!("{}/{}", self.kind.collection(), identifier))
    }

    fn username_taken(&self, candidate: &str) -> anyhow::Result<bool> {
        for (_, user) in self.tree.children("Users")? {
            if user.get("username").and_then(|v| v.as_str()) == Some(candidate) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn assigned_identifiers(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .tree
            .children(self.kind.collection())?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use chrono::{Datelike, Utc};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    struct FakeCounter {
        value: AtomicI64,
        fail: bool,
    }

    impl FakeCounter {
        fn at(value: i64) -> Self {
            FakeCounter {
                value: AtomicI64::new(value),
                fail: false,
            }
        }

        fn broken() -> Self {
            FakeCounter {
                value: AtomicI64::new(0),
                fail: true,
            }
        }
    }

    impl SequenceCounter for FakeCounter {
        fn get(&self) -> anyhow::Result<Option<i64>> {
            if self.fail {
                bail!("counter store unavailable");
            }
            Ok(Some(self.value.load(Ordering::SeqCst)))
        }

        fn set(&self, value: i64) -> anyhow::Result<()> {
            if self.fail {
                bail!("counter store unavailable");
            }
            self.value.store(value, Ordering::SeqCst);
            Ok(())
        }

        fn increment(&self) -> anyhow::Result<i64> {
            if self.fail {
                bail!("counter store unavailable");
            }
            Ok(self.value.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[derive(Default)]
    struct FakeDirectory {
        records: Mutex<HashSet<String>>,
        usernames: Mutex<HashSet<String>>,
    }

    impl FakeDirectory {
        fn with_records(ids: &[&str]) -> Self {
            let dir = FakeDirectory::default();
            {
                let mut records = dir.records.lock().expect("lock");
                for id in ids {
                    records.insert((*id).to_string());
                }
            }
            dir
        }
    }

    impl RecordDirectory for FakeDirectory {
        fn record_exists(&self, identifier: &str) -> anyhow::Result<bool> {
            Ok(self.records.lock().expect("lock").contains(identifier))
        }

        fn username_taken(&self, candidate: &str) -> anyhow::Result<bool> {
            Ok(self.usernames.lock().expect("lock").contains(candidate))
        }

        fn assigned_identifiers(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.records.lock().expect("lock").iter().cloned().collect())
        }
    }

    fn year_suffix() -> String {
        format!("{:02}", Utc::now().year() % 100)
    }

    #[test]
    fn first_allocation_is_0001() {
        let counter = FakeCounter::at(0);
        let dir = FakeDirectory::default();
        let id = allocate(RecordKind::Student, &counter, &dir);
        assert_eq!(id, format!("GES_0001_{}", year_suffix()));
    }

    #[test]
    fn counter_at_5_yields_0006() {
        let counter = FakeCounter::at(5);
        let dir = FakeDirectory::default();
        let id = allocate(RecordKind::Student, &counter, &dir);
        assert_eq!(id, format!("GES_0006_{}", year_suffix()));
    }

    #[test]
    fn teacher_prefix_is_get() {
        let counter = FakeCounter::at(0);
        let dir = FakeDirectory::default();
        let id = allocate(RecordKind::Teacher, &counter, &dir);
        assert_eq!(id, format!("GET_0001_{}", year_suffix()));
    }

    #[test]
    fn sequence_keeps_growing_past_four_digits() {
        let counter = FakeCounter::at(9999);
        let dir = FakeDirectory::default();
        let id = allocate(RecordKind::Student, &counter, &dir);
        assert_eq!(id, format!("GES_10000_{}", year_suffix()));
    }

    #[test]
    fn collision_with_existing_record_bumps_sequence() {
        let ys = year_suffix();
        let counter = FakeCounter::at(5);
        let dir = FakeDirectory::with_records(&[&format!("GES_0006_{ys}")]);
        let id = allocate(RecordKind::Student, &counter, &dir);
        assert_eq!(id, format!("GES_0007_{ys}"));
    }

    #[test]
    fn collision_with_username_bumps_sequence() {
        let ys = year_suffix();
        let counter = FakeCounter::at(5);
        let dir = FakeDirectory::default();
        dir.usernames
            .lock()
            .expect("lock")
            .insert(format!("GES_0006_{ys}"));
        let id = allocate(RecordKind::Student, &counter, &dir);
        assert_eq!(id, format!("GES_0007_{ys}"));
    }

    #[test]
    fn reconcile_raises_stale_counter_before_reservation() {
        // Counter says 5 but GES_0006 is already on disk; after the startup
        // reconciliation pass the next allocation must not reuse 0006.
        let ys = year_suffix();
        let counter = FakeCounter::at(5);
        let dir = FakeDirectory::with_records(&[&format!("GES_0006_{ys}")]);

        reconcile_counter(RecordKind::Student, &counter, &dir);
        assert_eq!(counter.get().expect("get"), Some(6));

        let id = allocate(RecordKind::Student, &counter, &dir);
        assert_eq!(id, format!("GES_0007_{ys}"));
    }

    #[test]
    fn reconcile_skips_malformed_identifiers() {
        let counter = FakeCounter::at(0);
        let dir = FakeDirectory::with_records(&[
            "GES_0003_26",
            "GES_bogus_26",
            "legacy-import",
            "GET_9999_26",
        ]);
        reconcile_counter(RecordKind::Student, &counter, &dir);
        assert_eq!(counter.get().expect("get"), Some(3));
    }

    #[test]
    fn reconcile_never_lowers_counter() {
        let counter = FakeCounter::at(50);
        let dir = FakeDirectory::with_records(&["GES_0003_26"]);
        reconcile_counter(RecordKind::Student, &counter, &dir);
        assert_eq!(counter.get().expect("get"), Some(50));
    }

    #[test]
    fn broken_counter_falls_back_to_timestamp_identifier() {
        let counter = FakeCounter::broken();
        let dir = FakeDirectory::default();
        let id = allocate(RecordKind::Student, &counter, &dir);
        assert_timestamp_shape(&id, "GES");
    }

    #[test]
    fn collision_exhaustion_falls_back_to_timestamp_identifier() {
        let ys = year_suffix();
        let counter = FakeCounter::at(0);
        let dir = FakeDirectory::default();
        {
            let mut records = dir.records.lock().expect("lock");
            for seq in 1..=1100i64 {
                records.insert(format!("GES_{seq:04}_{ys}"));
            }
        }
        let id = allocate(RecordKind::Student, &counter, &dir);
        assert_timestamp_shape(&id, "GES");
    }

    #[test]
    fn concurrent_allocations_are_pairwise_distinct() {
        let counter = FakeCounter::at(0);
        let dir = FakeDirectory::default();
        let minted: Mutex<Vec<String>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        let id = allocate(RecordKind::Student, &counter, &dir);
                        minted.lock().expect("lock").push(id);
                    }
                });
            }
        });

        let minted = minted.into_inner().expect("lock");
        let distinct: HashSet<&String> = minted.iter().collect();
        assert_eq!(minted.len(), 200);
        assert_eq!(distinct.len(), 200);
    }

    fn assert_timestamp_shape(id: &str, prefix: &str) {
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3, "unexpected shape: {id}");
        assert_eq!(parts[0], prefix);
        assert_eq!(parts[1].len(), 6);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2], year_suffix());
    }
}
