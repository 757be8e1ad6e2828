//! Redis-backed store.
//!
//! Each record lives in a hash with a `version` and a JSON `data` field.
//! Inserts and compare-and-set updates run as Lua scripts so the version
//! check and the write are atomic. Scheduled jobs are also indexed in a
//! per-tenant sorted set scored by `next_retry_at` (epoch milliseconds).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{sort_for_dispatch, InsertOutcome, RecoveryStore};
use crate::error::StoreError;
use crate::recovery::job::{DeadLetterJob, DeadLetterStatus};
use crate::recovery::log::JobRecoveryLog;
use crate::recovery::pattern::FailurePattern;

/// KEYS: origin, record, job index, tenant set. ARGV: id, data, tenant.
const INSERT_JOB_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then return existing end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], 'version', 1, 'data', ARGV[2])
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('SADD', KEYS[4], ARGV[3])
return false
"#;

/// KEYS: record, index sets... ARGV: data, member.
const INSERT_RECORD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'version', 1, 'data', ARGV[1])
for i = 2, #KEYS do
  redis.call('SADD', KEYS[i], ARGV[2])
end
return 1
"#;

/// KEYS: record, [schedule zset]. ARGV: expected version, data, [score or '', member].
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current or tonumber(current) ~= tonumber(ARGV[1]) then return 0 end
redis.call('HSET', KEYS[1], 'version', tonumber(ARGV[1]) + 1, 'data', ARGV[2])
if #KEYS > 1 then
  if ARGV[3] == '' then
    redis.call('ZREM', KEYS[2], ARGV[4])
  else
    redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
  end
end
return 1
"#;

/// Manages recovery state in Redis.
pub struct RedisStore {
    connection: redis::aio::ConnectionManager,
    prefix: String,
    insert_job: Script,
    insert_record: Script,
    compare_and_set: Script,
}

impl RedisStore {
    /// Creates a new store connected to the specified Redis URL.
    pub async fn new(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| StoreError::ConnectionFailed {
            url: redis_url.to_string(),
            message: e.to_string(),
        })?;

        let connection =
            client
                .get_connection_manager()
                .await
                .map_err(|e| StoreError::ConnectionFailed {
                    url: redis_url.to_string(),
                    message: e.to_string(),
                })?;

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            insert_job: Script::new(INSERT_JOB_SCRIPT),
            insert_record: Script::new(INSERT_RECORD_SCRIPT),
            compare_and_set: Script::new(COMPARE_AND_SET_SCRIPT),
        })
    }

    fn tenants_key(&self) -> String {
        format!("{}:tenants", self.prefix)
    }

    fn job_key(&self, tenant_id: &str, id: Uuid) -> String {
        format!("{}:{}:job:{}", self.prefix, tenant_id, id)
    }

    fn jobs_key(&self, tenant_id: &str) -> String {
        format!("{}:{}:jobs", self.prefix, tenant_id)
    }

    fn origin_key(&self, job: &DeadLetterJob) -> String {
        format!(
            "{}:{}:origin:{}:{}:{}",
            self.prefix,
            job.tenant_id,
            job.original_queue,
            job.original_job_type,
            job.original_job_id
        )
    }

    fn scheduled_key(&self, tenant_id: &str) -> String {
        format!("{}:{}:scheduled", self.prefix, tenant_id)
    }

    fn log_key(&self, tenant_id: &str, id: Uuid) -> String {
        format!("{}:{}:log:{}", self.prefix, tenant_id, id)
    }

    fn logs_key(&self, tenant_id: &str) -> String {
        format!("{}:{}:logs", self.prefix, tenant_id)
    }

    fn job_logs_key(&self, tenant_id: &str, job_id: Uuid) -> String {
        format!("{}:{}:job_logs:{}", self.prefix, tenant_id, job_id)
    }

    fn pattern_key(&self, tenant_id: &str, signature: &str) -> String {
        format!("{}:{}:pattern:{}", self.prefix, tenant_id, signature)
    }

    fn patterns_key(&self, tenant_id: &str) -> String {
        format!("{}:{}:patterns", self.prefix, tenant_id)
    }

    /// Reads and decodes the `data` field of a record hash.
    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut conn = self.connection.clone();
        let data: Option<String> = conn.hget(key, "data").await?;

        match data {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Loads every record whose member id is in `index`.
    async fn load_index<T: DeserializeOwned>(
        &self,
        index: &str,
        key_for: impl Fn(&str) -> String,
    ) -> Result<Vec<T>, StoreError> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = conn.smembers(index).await?;

        let mut records = Vec::with_capacity(members.len());
        for member in members {
            if let Some(record) = self.load(&key_for(&member)).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Runs the compare-and-set script. Returns true if the write happened.
    async fn cas<T: Serialize>(
        &self,
        keys: &[String],
        expected_version: u64,
        next: &T,
        schedule: Option<(Option<i64>, String)>,
    ) -> Result<bool, StoreError> {
        let data = serde_json::to_string(next)?;
        let mut invocation = self.compare_and_set.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(expected_version).arg(data);
        if let Some((score, member)) = schedule {
            invocation
                .arg(score.map(|s| s.to_string()).unwrap_or_default())
                .arg(member);
        }

        let mut conn = self.connection.clone();
        let written: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }

    async fn insert_record<T: Serialize>(
        &self,
        keys: &[String],
        member: &str,
        record: &T,
    ) -> Result<bool, StoreError> {
        let data = serde_json::to_string(record)?;
        let mut invocation = self.insert_record.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(data).arg(member);

        let mut conn = self.connection.clone();
        let written: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }
}

fn schedule_score(job: &DeadLetterJob) -> Option<i64> {
    match (job.status, job.next_retry_at) {
        (DeadLetterStatus::RetryScheduled, Some(at)) => Some(at.timestamp_millis()),
        _ => None,
    }
}

#[async_trait]
impl RecoveryStore for RedisStore {
    async fn insert_job(
        &self,
        job: &DeadLetterJob,
    ) -> Result<InsertOutcome<DeadLetterJob>, StoreError> {
        let mut stored = job.clone();
        stored.version = 1;
        let data = serde_json::to_string(&stored)?;

        let mut conn = self.connection.clone();
        let existing: Option<String> = self
            .insert_job
            .key(self.origin_key(job))
            .key(self.job_key(&job.tenant_id, job.id))
            .key(self.jobs_key(&job.tenant_id))
            .key(self.tenants_key())
            .arg(job.id.to_string())
            .arg(data)
            .arg(&job.tenant_id)
            .invoke_async(&mut conn)
            .await?;

        let Some(existing_id) = existing else {
            return Ok(InsertOutcome::Inserted(stored));
        };

        let existing_id = Uuid::parse_str(&existing_id).map_err(|e| StoreError::Corrupt {
            key: self.origin_key(job),
            message: e.to_string(),
        })?;
        self.get_job(&job.tenant_id, existing_id)
            .await?
            .map(InsertOutcome::Existing)
            .ok_or_else(|| StoreError::Corrupt {
                key: self.origin_key(job),
                message: "origin index points at a missing job".to_string(),
            })
    }

    async fn get_job(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<DeadLetterJob>, StoreError> {
        self.load(&self.job_key(tenant_id, id)).await
    }

    async fn update_job(&self, job: &DeadLetterJob) -> Result<Option<DeadLetterJob>, StoreError> {
        let mut next = job.clone();
        next.version = job.version + 1;

        let keys = [
            self.job_key(&job.tenant_id, job.id),
            self.scheduled_key(&job.tenant_id),
        ];
        let schedule = Some((schedule_score(&next), job.id.to_string()));

        if self.cas(&keys, job.version, &next, schedule).await? {
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }

    async fn list_jobs(&self, tenant_id: &str) -> Result<Vec<DeadLetterJob>, StoreError> {
        self.load_index(&self.jobs_key(tenant_id), |id| {
            format!("{}:{}:job:{}", self.prefix, tenant_id, id)
        })
        .await
    }

    async fn due_jobs(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeadLetterJob>, StoreError> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(self.scheduled_key(tenant_id), "-inf", now.timestamp_millis())
            .await?;

        let mut due = Vec::with_capacity(ids.len());
        for id in ids {
            let key = format!("{}:{}:job:{}", self.prefix, tenant_id, id);
            if let Some(job) = self.load::<DeadLetterJob>(&key).await? {
                if job.status == DeadLetterStatus::RetryScheduled {
                    due.push(job);
                }
            }
        }

        sort_for_dispatch(&mut due);
        due.truncate(limit);
        Ok(due)
    }

    async fn tenants(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let mut tenants: Vec<String> = conn.smembers(self.tenants_key()).await?;
        tenants.sort();
        Ok(tenants)
    }

    async fn insert_log(&self, log: &JobRecoveryLog) -> Result<JobRecoveryLog, StoreError> {
        let mut stored = log.clone();
        stored.version = 1;

        let keys = [
            self.log_key(&log.tenant_id, log.id),
            self.logs_key(&log.tenant_id),
            self.job_logs_key(&log.tenant_id, log.dead_letter_job_id),
        ];
        if !self
            .insert_record(&keys, &log.id.to_string(), &stored)
            .await?
        {
            return Err(StoreError::CommandFailed(format!(
                "recovery log {} already exists",
                log.id
            )));
        }
        Ok(stored)
    }

    async fn get_log(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<JobRecoveryLog>, StoreError> {
        self.load(&self.log_key(tenant_id, id)).await
    }

    async fn update_log(
        &self,
        log: &JobRecoveryLog,
    ) -> Result<Option<JobRecoveryLog>, StoreError> {
        let mut next = log.clone();
        next.version = log.version + 1;

        let keys = [self.log_key(&log.tenant_id, log.id)];
        if self.cas(&keys, log.version, &next, None).await? {
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }

    async fn logs_for_job(
        &self,
        tenant_id: &str,
        job_id: Uuid,
    ) -> Result<Vec<JobRecoveryLog>, StoreError> {
        let mut logs: Vec<JobRecoveryLog> = self
            .load_index(&self.job_logs_key(tenant_id, job_id), |id| {
                format!("{}:{}:log:{}", self.prefix, tenant_id, id)
            })
            .await?;
        logs.sort_by_key(|l| l.created_at);
        Ok(logs)
    }

    async fn list_logs(&self, tenant_id: &str) -> Result<Vec<JobRecoveryLog>, StoreError> {
        self.load_index(&self.logs_key(tenant_id), |id| {
            format!("{}:{}:log:{}", self.prefix, tenant_id, id)
        })
        .await
    }

    async fn get_pattern(
        &self,
        tenant_id: &str,
        signature: &str,
    ) -> Result<Option<FailurePattern>, StoreError> {
        self.load(&self.pattern_key(tenant_id, signature)).await
    }

    async fn save_pattern(
        &self,
        pattern: &FailurePattern,
    ) -> Result<Option<FailurePattern>, StoreError> {
        let mut next = pattern.clone();
        next.version = pattern.version + 1;
        let record_key = self.pattern_key(&pattern.tenant_id, &pattern.signature);

        let written = if pattern.version == 0 {
            let keys = [record_key, self.patterns_key(&pattern.tenant_id)];
            self.insert_record(&keys, &pattern.signature, &next).await?
        } else {
            self.cas(&[record_key], pattern.version, &next, None).await?
        };

        Ok(written.then_some(next))
    }

    async fn list_patterns(&self, tenant_id: &str) -> Result<Vec<FailurePattern>, StoreError> {
        self.load_index(&self.patterns_key(tenant_id), |signature| {
            format!("{}:{}:pattern:{}", self.prefix, tenant_id, signature)
        })
        .await
    }
}
