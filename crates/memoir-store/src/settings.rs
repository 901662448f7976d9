//! In-process cache of runtime tunables, the model catalog, and active
//! prompts. Settings live in the relational store so operators can tune the
//! pipeline without a rebuild; cache invalidation is deliberately absent —
//! the process is bounced after a settings change.

use std::collections::HashMap;
use std::sync::Mutex;

use memoir_core::AgentRole;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::types::{ModelEntry, RoleTunables};

/// Recognized settings keys carry typed defaults; unknown keys fall back to
/// the values below.
pub const DEFAULT_CACHE_POOL_LIMIT: i64 = 200;
pub const DEFAULT_MAX_SB_CONTEXT: i64 = 50;
pub const DEFAULT_SESSION_EXPIRE_SECS: i64 = 3_600;
pub const DEFAULT_SESSION_EXPIRE_BUF_SECS: i64 = 300;
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;

pub fn default_word_limit(role: AgentRole) -> i64 {
    match role {
        AgentRole::Interviewer => 20_000,
        AgentRole::Stenographer => 10_000,
        AgentRole::Director => 5_000,
    }
}

pub fn default_temperature(role: AgentRole) -> f64 {
    match role {
        AgentRole::Interviewer => 1.0,
        AgentRole::Stenographer => 0.1,
        AgentRole::Director => 0.7,
    }
}

#[derive(Clone)]
struct RawSetting {
    value: String,
    kind: String,
}

pub struct ConfigCache {
    db: Mutex<Connection>,
    settings: Mutex<HashMap<String, Option<RawSetting>>>,
    models: Mutex<HashMap<i64, ModelEntry>>,
    prompts: Mutex<HashMap<i64, String>>,
}

impl ConfigCache {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
            settings: Mutex::new(HashMap::new()),
            models: Mutex::new(HashMap::new()),
            prompts: Mutex::new(HashMap::new()),
        }
    }

    // -- typed accessors -----------------------------------------------------

    pub fn int(&self, key: &str, default: i64) -> i64 {
        match self.raw(key) {
            Some(raw) => raw.value.parse().unwrap_or_else(|_| {
                warn!(key, value = %raw.value, "setting is not an integer, using default");
                default
            }),
            None => default,
        }
    }

    pub fn float(&self, key: &str, default: f64) -> f64 {
        match self.raw(key) {
            Some(raw) => raw.value.parse().unwrap_or_else(|_| {
                warn!(key, value = %raw.value, "setting is not a number, using default");
                default
            }),
            None => default,
        }
    }

    pub fn flag(&self, key: &str, default: bool) -> bool {
        match self.raw(key) {
            Some(raw) => matches!(raw.value.trim(), "1" | "true" | "on" | "yes"),
            None => default,
        }
    }

    pub fn cache_pool_limit(&self) -> i64 {
        self.int("cache_pool_limit", DEFAULT_CACHE_POOL_LIMIT)
    }

    pub fn max_sb_context(&self) -> usize {
        self.int("max_sb_context", DEFAULT_MAX_SB_CONTEXT).max(0) as usize
    }

    pub fn llm_caching_enabled(&self) -> bool {
        self.flag("enable_llm_caching", true)
    }

    pub fn llm_timeout_secs(&self) -> u64 {
        self.int("llm_timeout_secs", DEFAULT_LLM_TIMEOUT_SECS as i64).max(1) as u64
    }

    /// Assemble the per-agent tunables: model selection (a `select` setting
    /// dereferenced through the catalog), temperature, and session budget.
    pub fn tunables(&self, role: AgentRole) -> Result<RoleTunables> {
        let key = role.key();
        let model_id = self.raw(&format!("{key}_llm_model")).and_then(|raw| {
            raw.value.parse::<i64>().ok().or_else(|| {
                warn!(role = %role, value = %raw.value, "model setting is not a catalog id");
                None
            })
        });
        let model = match model_id {
            Some(id) => self.model(id)?,
            None => return Err(StoreError::ModelNotConfigured { role }),
        };

        Ok(RoleTunables {
            role,
            model,
            temperature: self.float(&format!("{key}_llm_temp"), default_temperature(role)),
            word_limit: self.int(
                &format!("{key}_llm_session_word_limit"),
                default_word_limit(role),
            ),
            expire_duration_secs: self.int(
                &format!("{key}_llm_session_expire_duration"),
                DEFAULT_SESSION_EXPIRE_SECS,
            ),
            expire_buffer_secs: self.int(
                &format!("{key}_llm_session_expire_buf"),
                DEFAULT_SESSION_EXPIRE_BUF_SECS,
            ),
        })
    }

    /// Look up a catalog entry by id.
    pub fn model(&self, model_id: i64) -> Result<ModelEntry> {
        if let Some(entry) = self.models.lock().unwrap().get(&model_id) {
            return Ok(entry.clone());
        }

        let db = self.db.lock().unwrap();
        let entry = match db.query_row(
            "SELECT model_id, name, api_model_id, price_in, price_out, cache_discount
             FROM model_catalog WHERE model_id = ?1",
            rusqlite::params![model_id],
            |row| {
                Ok(ModelEntry {
                    model_id: row.get(0)?,
                    name: row.get(1)?,
                    api_model_id: row.get(2)?,
                    price_in: row.get(3)?,
                    price_out: row.get(4)?,
                    cache_discount: row.get(5)?,
                })
            },
        ) {
            Ok(e) => e,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StoreError::ModelNotFound { model_id });
            }
            Err(e) => return Err(e.into()),
        };
        drop(db);

        self.models.lock().unwrap().insert(model_id, entry.clone());
        Ok(entry)
    }

    /// The active system prompt for an agent — the active row with the
    /// highest id wins.
    pub fn active_prompt(&self, role: AgentRole) -> Result<String> {
        let kind = role.prompt_kind();
        if let Some(content) = self.prompts.lock().unwrap().get(&kind) {
            return Ok(content.clone());
        }

        let db = self.db.lock().unwrap();
        let content: String = match db.query_row(
            "SELECT content FROM prompts
             WHERE role = ?1 AND active = 1
             ORDER BY prompt_id DESC
             LIMIT 1",
            rusqlite::params![kind],
            |row| row.get(0),
        ) {
            Ok(c) => c,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StoreError::PromptMissing { role });
            }
            Err(e) => return Err(e.into()),
        };
        drop(db);

        debug!(role = %role, chars = content.chars().count(), "active prompt loaded");
        self.prompts.lock().unwrap().insert(kind, content.clone());
        Ok(content)
    }

    fn raw(&self, key: &str) -> Option<RawSetting> {
        if let Some(cached) = self.settings.lock().unwrap().get(key) {
            return cached.clone();
        }

        let db = self.db.lock().unwrap();
        let loaded: Option<RawSetting> = db
            .query_row(
                "SELECT value, kind FROM settings WHERE key = ?1",
                rusqlite::params![key],
                |row| {
                    Ok(RawSetting {
                        value: row.get(0)?,
                        kind: row.get(1)?,
                    })
                },
            )
            .ok();
        drop(db);

        if loaded.is_none() {
            debug!(key, "setting not seeded, default applies");
        }
        self.settings
            .lock()
            .unwrap()
            .insert(key.to_string(), loaded.clone());
        loaded
    }
}
