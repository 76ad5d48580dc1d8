use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

use async_trait::async_trait;

/// Seconds after which an unreleased concurrency member counts as abandoned
/// and is pruned on the next acquire. This is a constant of the acquire
/// script rather than a call argument, so every caller of a given store
/// agrees on it.
pub const CONCURRENCY_TTL_SECS: u64 = 60;

/// The closed set of scripts a store must execute atomically.
///
/// One limiter check is exactly one script execution. The keys and argument
/// order below are the contract an out-of-tree backend (e.g. a hosted Lua
/// script) must reproduce bit-exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScript {
    /// keys `[<bucket>.tokens, <bucket>.timestamp]`,
    /// args `[rate, capacity, now, requested]` -> `(allowed, new_tokens)`.
    RateLimit,
    /// keys `[<set>]`, args `[capacity, timestamp, id]` -> `(allowed, in_flight)`.
    ConcurrencyAcquire,
    /// keys `[<set>]`, args `[id]` -> `(true, removed)`.
    ConcurrencyRelease,
}

/// Primitive script arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptArg {
    Int(i64),
    Float(f64),
    Str(String),
}

/// The two-element result every script returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptReply {
    pub allowed: bool,
    pub secondary: f64,
}

/// Why a store round trip failed.
///
/// Callers treat every variant identically: admit the request and report the
/// failure. A broken store must never become a source of denials.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store call timed out")]
    Timeout,

    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("script rejected: {0}")]
    Script(String),
}

/// A key-value store that can run short read-modify-write scripts atomically
/// and expire keys.
///
/// Concurrent executions against the same key are totally ordered by the
/// store; no ordering is guaranteed (or needed) across different keys. Every
/// limiter operation that reads then writes shared state is expressed as
/// exactly one `execute` call; separate read and write calls would
/// reintroduce the race the atomicity exists to prevent.
#[async_trait]
pub trait AtomicStore: Debug + Send + Sync {
    async fn execute(
        &self,
        script: StoreScript,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptReply, StoreError>;
}

#[derive(Debug)]
enum Entry {
    Scalar { value: f64, expires_at: u64 },
    Set { members: Vec<(String, u64)> },
}

/// In-process [`AtomicStore`].
///
/// Each script runs under a single mutex, which gives it the same
/// indivisibility a hosted script engine provides. Expiry is lazy: a scalar
/// key read at or past its deadline counts as absent, so no background
/// reaper is needed. Suitable for unit tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rate_limit(
        entries: &mut HashMap<String, Entry>,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptReply, StoreError> {
        let [tokens_key, stamp_key] = keys else {
            return Err(StoreError::Script(
                "rate limit script takes two keys".to_string(),
            ));
        };
        let rate = float_arg(args, 0)?;
        let capacity = float_arg(args, 1)?;
        let now = int_arg(args, 2)?;
        let requested = float_arg(args, 3)?;

        let tokens = scalar(entries, tokens_key, now, capacity)?;
        let last_refill = scalar(entries, stamp_key, now, 0.0)?;

        // Clamping the delta tolerates clock skew between callers.
        let delta = (now as f64 - last_refill).max(0.0);
        let filled = (tokens + delta * rate).min(capacity);
        let allowed = filled >= requested;
        let new_tokens = if allowed { filled - requested } else { filled };

        let expires_at = now + (2.0 * capacity / rate).floor() as u64;
        entries.insert(
            tokens_key.clone(),
            Entry::Scalar {
                value: new_tokens,
                expires_at,
            },
        );
        entries.insert(
            stamp_key.clone(),
            Entry::Scalar {
                value: now as f64,
                expires_at,
            },
        );

        Ok(ScriptReply {
            allowed,
            secondary: new_tokens,
        })
    }

    fn acquire(
        entries: &mut HashMap<String, Entry>,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptReply, StoreError> {
        let key = single_key(keys)?;
        let capacity = int_arg(args, 0)?;
        let timestamp = int_arg(args, 1)?;
        let id = str_arg(args, 2)?;

        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Entry::Set {
                members: Vec::new(),
            });
        let Entry::Set { members } = entry else {
            return Err(StoreError::Script(format!("key {key} holds a scalar")));
        };

        // Members whose bookkeeping never completed fall out after the TTL.
        let horizon = timestamp.saturating_sub(CONCURRENCY_TTL_SECS);
        members.retain(|(_, stamped)| *stamped >= horizon);

        let in_flight = members.len() as u64;
        let allowed = in_flight < capacity;
        if allowed {
            members.push((id.to_string(), timestamp));
        }

        Ok(ScriptReply {
            allowed,
            secondary: in_flight as f64,
        })
    }

    fn release(
        entries: &mut HashMap<String, Entry>,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptReply, StoreError> {
        let key = single_key(keys)?;
        let id = str_arg(args, 0)?;

        // Releasing a member that pruning already reclaimed is a no-op.
        let removed = match entries.get_mut(key) {
            Some(Entry::Set { members }) => {
                let before = members.len();
                members.retain(|(member, _)| member != id);
                before - members.len()
            }
            _ => 0,
        };

        Ok(ScriptReply {
            allowed: true,
            secondary: removed as f64,
        })
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn execute(
        &self,
        script: StoreScript,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptReply, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Connection("store mutex poisoned".to_string()))?;

        match script {
            StoreScript::RateLimit => Self::rate_limit(&mut entries, keys, args),
            StoreScript::ConcurrencyAcquire => Self::acquire(&mut entries, keys, args),
            StoreScript::ConcurrencyRelease => Self::release(&mut entries, keys, args),
        }
    }
}

fn scalar(
    entries: &HashMap<String, Entry>,
    key: &str,
    now: u64,
    default: f64,
) -> Result<f64, StoreError> {
    match entries.get(key) {
        None => Ok(default),
        Some(Entry::Scalar { value, expires_at }) if *expires_at > now => Ok(*value),
        Some(Entry::Scalar { .. }) => Ok(default),
        Some(Entry::Set { .. }) => Err(StoreError::Script(format!("key {key} holds a set"))),
    }
}

fn single_key(keys: &[String]) -> Result<&String, StoreError> {
    match keys {
        [key] => Ok(key),
        _ => Err(StoreError::Script("script takes one key".to_string())),
    }
}

fn float_arg(args: &[ScriptArg], index: usize) -> Result<f64, StoreError> {
    match args.get(index) {
        Some(ScriptArg::Float(value)) => Ok(*value),
        Some(ScriptArg::Int(value)) => Ok(*value as f64),
        other => Err(StoreError::Script(format!(
            "argument {index} must be numeric, got {other:?}"
        ))),
    }
}

fn int_arg(args: &[ScriptArg], index: usize) -> Result<u64, StoreError> {
    match args.get(index) {
        Some(ScriptArg::Int(value)) if *value >= 0 => Ok(*value as u64),
        other => Err(StoreError::Script(format!(
            "argument {index} must be a non-negative integer, got {other:?}"
        ))),
    }
}

fn str_arg(args: &[ScriptArg], index: usize) -> Result<&str, StoreError> {
    match args.get(index) {
        Some(ScriptArg::Str(value)) => Ok(value),
        other => Err(StoreError::Script(format!(
            "argument {index} must be a string, got {other:?}"
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn rate_limit_keys(identity: &str) -> [String; 2] {
        [
            format!("rate_limit.{identity}.tokens"),
            format!("rate_limit.{identity}.timestamp"),
        ]
    }

    fn rate_limit_args(rate: f64, capacity: f64, now: u64) -> [ScriptArg; 4] {
        [
            ScriptArg::Float(rate),
            ScriptArg::Float(capacity),
            ScriptArg::Int(now as i64),
            ScriptArg::Float(1.0),
        ]
    }

    #[tokio::test]
    async fn rejects_malformed_calls() {
        let store = MemoryStore::new();

        let err = store
            .execute(StoreScript::RateLimit, &[], &rate_limit_args(1.0, 2.0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Script(_)));

        let err = store
            .execute(
                StoreScript::ConcurrencyAcquire,
                &["concurrency.a".to_string()],
                &[ScriptArg::Str("not-a-capacity".to_string())],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Script(_)));
    }

    #[tokio::test]
    async fn expired_bucket_reads_as_fresh() {
        let store = MemoryStore::new();
        let keys = rate_limit_keys("a");

        // rate 1, capacity 2 -> expiry after floor(2 * 2 / 1) = 4 seconds.
        for _ in 0..2 {
            let reply = store
                .execute(StoreScript::RateLimit, &keys, &rate_limit_args(1.0, 2.0, 100))
                .await
                .unwrap();
            assert!(reply.allowed);
        }
        let reply = store
            .execute(StoreScript::RateLimit, &keys, &rate_limit_args(1.0, 2.0, 100))
            .await
            .unwrap();
        assert!(!reply.allowed);

        // Past the deadline both keys read as absent and the bucket is full
        // again, even if refill alone would not have covered the gap.
        let reply = store
            .execute(StoreScript::RateLimit, &keys, &rate_limit_args(1.0, 2.0, 104))
            .await
            .unwrap();
        assert!(reply.allowed);
        assert_eq!(reply.secondary, 1.0);
    }

    #[tokio::test]
    async fn release_of_unknown_member_is_noop() {
        let store = MemoryStore::new();
        let keys = ["concurrency.a".to_string()];

        let reply = store
            .execute(
                StoreScript::ConcurrencyAcquire,
                &keys,
                &[
                    ScriptArg::Int(1),
                    ScriptArg::Int(100),
                    ScriptArg::Str("member-1".to_string()),
                ],
            )
            .await
            .unwrap();
        assert!(reply.allowed);

        let reply = store
            .execute(
                StoreScript::ConcurrencyRelease,
                &keys,
                &[ScriptArg::Str("never-inserted".to_string())],
            )
            .await
            .unwrap();
        assert_eq!(reply.secondary, 0.0);

        // The real member is still counted.
        let reply = store
            .execute(
                StoreScript::ConcurrencyAcquire,
                &keys,
                &[
                    ScriptArg::Int(1),
                    ScriptArg::Int(101),
                    ScriptArg::Str("member-2".to_string()),
                ],
            )
            .await
            .unwrap();
        assert!(!reply.allowed);
        assert_eq!(reply.secondary, 1.0);
    }

    #[tokio::test]
    async fn stale_members_are_pruned_on_acquire() {
        let store = MemoryStore::new();
        let keys = ["concurrency.a".to_string()];

        let reply = store
            .execute(
                StoreScript::ConcurrencyAcquire,
                &keys,
                &[
                    ScriptArg::Int(1),
                    ScriptArg::Int(100),
                    ScriptArg::Str("abandoned".to_string()),
                ],
            )
            .await
            .unwrap();
        assert!(reply.allowed);

        // One second past the TTL the abandoned member no longer counts.
        let reply = store
            .execute(
                StoreScript::ConcurrencyAcquire,
                &keys,
                &[
                    ScriptArg::Int(1),
                    ScriptArg::Int(100 + CONCURRENCY_TTL_SECS as i64 + 1),
                    ScriptArg::Str("fresh".to_string()),
                ],
            )
            .await
            .unwrap();
        assert!(reply.allowed);
        assert_eq!(reply.secondary, 0.0);
    }
}
