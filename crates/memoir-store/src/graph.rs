//! Memoir graph materialization.
//!
//! Turns one parsed extraction payload into graph rows and storyboard
//! entries inside a single transaction. Temp ids ("s1", "t2", "o3", "c1")
//! live only for the duration of one call: sections are processed in
//! S → T → O → C order so later sections can reference earlier ones, and the
//! map is discarded afterwards.

use std::collections::HashMap;

use memoir_core::StoryKind;
use rusqlite::Transaction;
use tracing::{debug, warn};

use crate::error::Result;
use crate::journal::append_entry;
use crate::store::Store;
use crate::types::{CharacterItem, ExtractionDelta, ShotItem, StageItem, TopicItem};

/// Counters for one materialization pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaterializeReport {
    pub inserted: usize,
    pub updated: usize,
    pub linked: usize,
    pub skipped: usize,
}

/// Temp-id arena for one extraction run.
type IdMap = HashMap<String, (StoryKind, i64)>;

/// Outcome of resolving a parent reference.
enum ParentRef {
    Resolved(i64),
    Absent,
    /// A temp-id-shaped reference that is not in the map — the item must be
    /// skipped rather than stored with a dangling parent.
    Unresolvable,
}

impl Store {
    /// Materialize one extraction payload: inserts, coalescing updates,
    /// relation edits, one storyboard row per touched entity, and (when the
    /// Stenographer ran on its cursor) the cursor flip — all or nothing.
    ///
    /// `stn_flip_up_to` is the max story id the Stenographer observed in its
    /// context read, captured before this call inserts new rows.
    pub fn apply_extraction(
        &self,
        user_id: &str,
        delta: &ExtractionDelta,
        stn_flip_up_to: Option<i64>,
    ) -> Result<MaterializeReport> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let mut map = IdMap::new();
        let mut report = MaterializeReport::default();

        for item in &delta.stages {
            apply_stage(&tx, user_id, item, &mut map, &mut report)?;
        }
        for item in &delta.topics {
            apply_topic(&tx, user_id, item, &mut map, &mut report)?;
        }
        for item in &delta.shots {
            apply_shot(&tx, user_id, item, &mut map, &mut report)?;
        }
        for item in &delta.characters {
            apply_character(&tx, user_id, item, &mut map, &mut report)?;
        }
        for rel in &delta.relations {
            apply_relation(&tx, user_id, rel, &map, &mut report)?;
        }

        if let Some(max_id) = stn_flip_up_to {
            tx.execute(
                "UPDATE storyboard SET stn_processed = 1
                 WHERE user_id = ?1 AND story_id <= ?2 AND stn_processed = 0",
                rusqlite::params![user_id, max_id],
            )?;
        }

        tx.commit()?;
        debug!(user_id, ?report, "extraction materialized");
        Ok(report)
    }
}

fn apply_stage(
    tx: &Transaction<'_>,
    user_id: &str,
    item: &StageItem,
    map: &mut IdMap,
    report: &mut MaterializeReport,
) -> Result<()> {
    match item.pt.as_str() {
        "n" => {
            let Some(title) = item.title.as_deref().filter(|t| !t.is_empty()) else {
                warn!(user_id, "stage item without title, skipping");
                report.skipped += 1;
                return Ok(());
            };
            let now = chrono::Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO stages
                 (user_id, title, summary, content, start_time, end_time, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    user_id,
                    title,
                    item.summary,
                    item.content,
                    item.start_time,
                    item.end_time,
                    now,
                ],
            )?;
            let id = tx.last_insert_rowid();
            remember_tid(map, item.tid.as_deref(), StoryKind::Stage, id);
            append_entry(
                tx,
                user_id,
                StoryKind::Stage,
                id,
                title,
                item.summary.as_deref().unwrap_or(""),
            )?;
            report.inserted += 1;
        }
        "u" => {
            let Some(id) = locate(tx, "stages", "title", user_id, item.id, item.title.as_deref())?
            else {
                warn!(user_id, title = ?item.title, "stage update target not found, skipping");
                report.skipped += 1;
                return Ok(());
            };
            tx.execute(
                "UPDATE stages SET
                    title      = COALESCE(?2, title),
                    summary    = COALESCE(?3, summary),
                    content    = COALESCE(?4, content),
                    start_time = COALESCE(?5, start_time),
                    end_time   = COALESCE(?6, end_time)
                 WHERE id = ?1",
                rusqlite::params![
                    id,
                    item.title,
                    item.summary,
                    item.content,
                    item.start_time,
                    item.end_time,
                ],
            )?;
            remember_tid(map, item.tid.as_deref(), StoryKind::Stage, id);
            journal_current(tx, user_id, StoryKind::Stage, id)?;
            report.updated += 1;
        }
        other => {
            warn!(user_id, pt = other, "unknown stage action, skipping");
            report.skipped += 1;
        }
    }
    Ok(())
}

fn apply_topic(
    tx: &Transaction<'_>,
    user_id: &str,
    item: &TopicItem,
    map: &mut IdMap,
    report: &mut MaterializeReport,
) -> Result<()> {
    match item.pt.as_str() {
        "n" => {
            let Some(title) = item.title.as_deref().filter(|t| !t.is_empty()) else {
                warn!(user_id, "topic item without title, skipping");
                report.skipped += 1;
                return Ok(());
            };
            let parent = match resolve_parent(map, item.parent.as_deref(), StoryKind::Stage) {
                ParentRef::Resolved(id) => Some(id),
                ParentRef::Absent => None,
                ParentRef::Unresolvable => {
                    warn!(user_id, parent = ?item.parent, "topic parent tid unresolved, skipping item");
                    report.skipped += 1;
                    return Ok(());
                }
            };
            let now = chrono::Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO topics
                 (user_id, parent_stage_id, title, summary, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![user_id, parent, title, item.summary, item.content, now],
            )?;
            let id = tx.last_insert_rowid();
            remember_tid(map, item.tid.as_deref(), StoryKind::Topic, id);
            append_entry(
                tx,
                user_id,
                StoryKind::Topic,
                id,
                title,
                item.summary.as_deref().unwrap_or(""),
            )?;
            report.inserted += 1;
        }
        "u" => {
            let Some(id) = locate(tx, "topics", "title", user_id, item.id, item.title.as_deref())?
            else {
                warn!(user_id, title = ?item.title, "topic update target not found, skipping");
                report.skipped += 1;
                return Ok(());
            };
            tx.execute(
                "UPDATE topics SET
                    title   = COALESCE(?2, title),
                    summary = COALESCE(?3, summary),
                    content = COALESCE(?4, content)
                 WHERE id = ?1",
                rusqlite::params![id, item.title, item.summary, item.content],
            )?;
            if let ParentRef::Resolved(parent) =
                resolve_parent(map, item.parent.as_deref(), StoryKind::Stage)
            {
                tx.execute(
                    "UPDATE topics SET parent_stage_id = ?2 WHERE id = ?1",
                    rusqlite::params![id, parent],
                )?;
            }
            remember_tid(map, item.tid.as_deref(), StoryKind::Topic, id);
            journal_current(tx, user_id, StoryKind::Topic, id)?;
            report.updated += 1;
        }
        other => {
            warn!(user_id, pt = other, "unknown topic action, skipping");
            report.skipped += 1;
        }
    }
    Ok(())
}

fn apply_shot(
    tx: &Transaction<'_>,
    user_id: &str,
    item: &ShotItem,
    map: &mut IdMap,
    report: &mut MaterializeReport,
) -> Result<()> {
    match item.pt.as_str() {
        "n" => {
            let Some(title) = item.title.as_deref().filter(|t| !t.is_empty()) else {
                warn!(user_id, "shot item without title, skipping");
                report.skipped += 1;
                return Ok(());
            };
            let parent = match resolve_parent(map, item.parent.as_deref(), StoryKind::Topic) {
                ParentRef::Resolved(id) => Some(id),
                ParentRef::Absent => None,
                ParentRef::Unresolvable => {
                    warn!(user_id, parent = ?item.parent, "shot parent tid unresolved, skipping item");
                    report.skipped += 1;
                    return Ok(());
                }
            };
            let now = chrono::Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO shots
                 (user_id, parent_topic_id, title, summary, content, shot_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    user_id,
                    parent,
                    title,
                    item.summary,
                    item.content,
                    item.shot_type,
                    now,
                ],
            )?;
            let id = tx.last_insert_rowid();
            remember_tid(map, item.tid.as_deref(), StoryKind::Shot, id);
            append_entry(
                tx,
                user_id,
                StoryKind::Shot,
                id,
                title,
                item.summary.as_deref().unwrap_or(""),
            )?;
            report.inserted += 1;
        }
        "u" => {
            let Some(id) = locate(tx, "shots", "title", user_id, item.id, item.title.as_deref())?
            else {
                warn!(user_id, title = ?item.title, "shot update target not found, skipping");
                report.skipped += 1;
                return Ok(());
            };
            tx.execute(
                "UPDATE shots SET
                    title     = COALESCE(?2, title),
                    summary   = COALESCE(?3, summary),
                    content   = COALESCE(?4, content),
                    shot_type = COALESCE(?5, shot_type)
                 WHERE id = ?1",
                rusqlite::params![id, item.title, item.summary, item.content, item.shot_type],
            )?;
            if let ParentRef::Resolved(parent) =
                resolve_parent(map, item.parent.as_deref(), StoryKind::Topic)
            {
                tx.execute(
                    "UPDATE shots SET parent_topic_id = ?2 WHERE id = ?1",
                    rusqlite::params![id, parent],
                )?;
            }
            remember_tid(map, item.tid.as_deref(), StoryKind::Shot, id);
            journal_current(tx, user_id, StoryKind::Shot, id)?;
            report.updated += 1;
        }
        other => {
            warn!(user_id, pt = other, "unknown shot action, skipping");
            report.skipped += 1;
        }
    }
    Ok(())
}

fn apply_character(
    tx: &Transaction<'_>,
    user_id: &str,
    item: &CharacterItem,
    map: &mut IdMap,
    report: &mut MaterializeReport,
) -> Result<()> {
    match item.pt.as_str() {
        "n" => {
            let Some(name) = item.name.as_deref().filter(|n| !n.is_empty()) else {
                warn!(user_id, "character item without name, skipping");
                report.skipped += 1;
                return Ok(());
            };
            let shot = match resolve_parent(map, item.parent.as_deref(), StoryKind::Shot) {
                ParentRef::Resolved(id) => Some(id),
                ParentRef::Absent => None,
                ParentRef::Unresolvable => {
                    warn!(user_id, parent = ?item.parent, "character shot tid unresolved, skipping item");
                    report.skipped += 1;
                    return Ok(());
                }
            };
            let now = chrono::Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO characters
                 (user_id, related_shot_id, name, summary, content, relation, evaluation, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    user_id,
                    shot,
                    name,
                    item.summary,
                    item.content,
                    item.relation,
                    item.evaluation,
                    now,
                ],
            )?;
            let id = tx.last_insert_rowid();
            remember_tid(map, item.tid.as_deref(), StoryKind::Character, id);
            append_entry(
                tx,
                user_id,
                StoryKind::Character,
                id,
                name,
                item.summary.as_deref().unwrap_or(""),
            )?;
            report.inserted += 1;
        }
        "u" => {
            let Some(id) =
                locate(tx, "characters", "name", user_id, item.id, item.name.as_deref())?
            else {
                warn!(user_id, name = ?item.name, "character update target not found, skipping");
                report.skipped += 1;
                return Ok(());
            };
            tx.execute(
                "UPDATE characters SET
                    name       = COALESCE(?2, name),
                    summary    = COALESCE(?3, summary),
                    content    = COALESCE(?4, content),
                    relation   = COALESCE(?5, relation),
                    evaluation = COALESCE(?6, evaluation)
                 WHERE id = ?1",
                rusqlite::params![
                    id,
                    item.name,
                    item.summary,
                    item.content,
                    item.relation,
                    item.evaluation,
                ],
            )?;
            if let ParentRef::Resolved(shot) =
                resolve_parent(map, item.parent.as_deref(), StoryKind::Shot)
            {
                tx.execute(
                    "UPDATE characters SET related_shot_id = ?2 WHERE id = ?1",
                    rusqlite::params![id, shot],
                )?;
            }
            remember_tid(map, item.tid.as_deref(), StoryKind::Character, id);
            journal_current(tx, user_id, StoryKind::Character, id)?;
            report.updated += 1;
        }
        other => {
            warn!(user_id, pt = other, "unknown character action, skipping");
            report.skipped += 1;
        }
    }
    Ok(())
}

fn apply_relation(
    tx: &Transaction<'_>,
    user_id: &str,
    rel: &crate::types::RelationItem,
    map: &IdMap,
    report: &mut MaterializeReport,
) -> Result<()> {
    let Some(&(src_kind, src_id)) = map.get(&rel.src) else {
        warn!(user_id, src = %rel.src, "relation src not in this batch, skipping");
        report.skipped += 1;
        return Ok(());
    };

    // The pointer column and the kind the target must have, both inferred
    // from the src level: Topic→Stage, Shot→Topic, Character→Shot.
    let (table, column, tgt_kind) = match src_kind {
        StoryKind::Topic => ("topics", "parent_stage_id", StoryKind::Stage),
        StoryKind::Shot => ("shots", "parent_topic_id", StoryKind::Topic),
        StoryKind::Character => ("characters", "related_shot_id", StoryKind::Shot),
        StoryKind::Stage => {
            warn!(user_id, src = %rel.src, "stages have no parent pointer, skipping relation");
            report.skipped += 1;
            return Ok(());
        }
    };

    match rel.kind.as_str() {
        "link" => {
            let tgt_id = match rel.tgt.as_deref() {
                Some(t) => match map.get(t) {
                    Some(&(kind, id)) if kind == tgt_kind => Some(id),
                    Some(_) => None,
                    None => t.parse::<i64>().ok(),
                },
                None => None,
            };
            let Some(tgt_id) = tgt_id else {
                warn!(user_id, src = %rel.src, tgt = ?rel.tgt, "relation target unresolved, skipping");
                report.skipped += 1;
                return Ok(());
            };
            let sql = format!("UPDATE {table} SET {column} = ?2 WHERE id = ?1 AND user_id = ?3");
            tx.execute(&sql, rusqlite::params![src_id, tgt_id, user_id])?;
            report.linked += 1;
        }
        "unlink" => {
            let sql = format!("UPDATE {table} SET {column} = NULL WHERE id = ?1 AND user_id = ?2");
            tx.execute(&sql, rusqlite::params![src_id, user_id])?;
            report.linked += 1;
        }
        other => {
            warn!(user_id, kind = other, "unknown relation kind, skipping");
            report.skipped += 1;
        }
    }
    Ok(())
}

// -- helpers -----------------------------------------------------------------

fn remember_tid(map: &mut IdMap, tid: Option<&str>, kind: StoryKind, id: i64) {
    if let Some(tid) = tid {
        map.insert(tid.to_string(), (kind, id));
    }
}

/// Resolve a parent reference: the temp-id map wins, then a literal db id;
/// a temp-id-shaped string that is in neither is unresolvable, and anything
/// else means "no parent".
fn resolve_parent(map: &IdMap, raw: Option<&str>, expected: StoryKind) -> ParentRef {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return ParentRef::Absent;
    };
    if let Some(&(kind, id)) = map.get(raw) {
        return if kind == expected {
            ParentRef::Resolved(id)
        } else {
            ParentRef::Unresolvable
        };
    }
    if let Ok(id) = raw.parse::<i64>() {
        return ParentRef::Resolved(id);
    }
    if looks_like_tid(raw) {
        return ParentRef::Unresolvable;
    }
    ParentRef::Absent
}

fn looks_like_tid(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some('s' | 't' | 'o' | 'c'))
        && s.len() > 1
        && chars.all(|c| c.is_ascii_digit())
}

/// Find an update target by explicit id, else by per-user title/name.
fn locate(
    tx: &Transaction<'_>,
    table: &str,
    title_column: &str,
    user_id: &str,
    id: Option<i64>,
    title: Option<&str>,
) -> Result<Option<i64>> {
    if let Some(id) = id {
        let sql = format!("SELECT id FROM {table} WHERE id = ?1 AND user_id = ?2");
        return match tx.query_row(&sql, rusqlite::params![id, user_id], |r| r.get(0)) {
            Ok(found) => Ok(Some(found)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        };
    }
    let Some(title) = title.filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    let sql = format!(
        "SELECT id FROM {table} WHERE user_id = ?1 AND {title_column} = ?2 ORDER BY id LIMIT 1"
    );
    match tx.query_row(&sql, rusqlite::params![user_id, title], |r| r.get(0)) {
        Ok(found) => Ok(Some(found)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Append a journal row reflecting an entity's state after an update.
fn journal_current(
    tx: &Transaction<'_>,
    user_id: &str,
    kind: StoryKind,
    id: i64,
) -> Result<()> {
    let (table, title_column) = match kind {
        StoryKind::Stage => ("stages", "title"),
        StoryKind::Topic => ("topics", "title"),
        StoryKind::Shot => ("shots", "title"),
        StoryKind::Character => ("characters", "name"),
    };
    let sql = format!("SELECT {title_column}, COALESCE(summary, '') FROM {table} WHERE id = ?1");
    let (title, summary): (String, String) =
        tx.query_row(&sql, rusqlite::params![id], |r| Ok((r.get(0)?, r.get(1)?)))?;
    append_entry(tx, user_id, kind, id, &title, &summary)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use memoir_core::AgentRole;
    use rusqlite::Connection;

    fn test_store() -> Store {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        Store::new(conn)
    }

    fn delta(json: &str) -> ExtractionDelta {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn new_items_chain_through_temp_ids() {
        let store = test_store();
        let d = delta(
            r#"{
                "S": [{"pt":"n","tid":"s1","title":"童年"}],
                "T": [{"pt":"n","tid":"t1","parent":"s1","title":"上学"}],
                "O": [{"pt":"n","parent":"t1","title":"第一天"}],
                "R": []
            }"#,
        );
        let report = store.apply_extraction("u-1", &d, None).unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(report.skipped, 0);

        let db = store.db.lock().unwrap();
        let stage_id: i64 = db
            .query_row("SELECT id FROM stages WHERE title = '童年'", [], |r| r.get(0))
            .unwrap();
        let (topic_id, topic_parent): (i64, i64) = db
            .query_row(
                "SELECT id, parent_stage_id FROM topics WHERE title = '上学'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        let shot_parent: i64 = db
            .query_row(
                "SELECT parent_topic_id FROM shots WHERE title = '第一天'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(topic_parent, stage_id);
        assert_eq!(shot_parent, topic_id);

        let contents: Vec<String> = {
            let mut stmt = db
                .prepare("SELECT story_content FROM storyboard ORDER BY story_id")
                .unwrap();
            stmt.query_map([], |r| r.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };
        assert_eq!(contents.len(), 3);
        assert!(contents[0].starts_with("[S:"));
        assert!(contents[1].starts_with("[T:"));
        assert!(contents[2].starts_with("[O:"));
    }

    #[test]
    fn unresolved_tid_parent_skips_the_item() {
        let store = test_store();
        let d = delta(r#"{"T": [{"pt":"n","tid":"t1","parent":"s9","title":"悬空话题"}]}"#);
        let report = store.apply_extraction("u-1", &d, None).unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.skipped, 1);

        let db = store.db.lock().unwrap();
        let n: i64 = db
            .query_row("SELECT COUNT(*) FROM topics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn literal_db_id_parent_is_accepted() {
        let store = test_store();
        store
            .apply_extraction(
                "u-1",
                &delta(r#"{"S": [{"pt":"n","tid":"s1","title":"青年"}]}"#),
                None,
            )
            .unwrap();
        let d = delta(r#"{"T": [{"pt":"n","parent":"1","title":"当兵"}]}"#);
        store.apply_extraction("u-1", &d, None).unwrap();

        let db = store.db.lock().unwrap();
        let parent: i64 = db
            .query_row("SELECT parent_stage_id FROM topics WHERE title = '当兵'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(parent, 1);
    }

    #[test]
    fn updates_coalesce_and_do_not_create_rows() {
        let store = test_store();
        store
            .apply_extraction(
                "u-1",
                &delta(
                    r#"{"O": [{"pt":"n","title":"胡同口","summary":"夏天傍晚","shot_type":2}]}"#,
                ),
                None,
            )
            .unwrap();

        // A null summary must not erase the stored one.
        let report = store
            .apply_extraction(
                "u-1",
                &delta(r#"{"O": [{"pt":"u","title":"胡同口","content":"大槐树下乘凉"}]}"#),
                None,
            )
            .unwrap();
        assert_eq!(report.updated, 1);

        let db = store.db.lock().unwrap();
        let n: i64 = db
            .query_row("SELECT COUNT(*) FROM shots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
        let (summary, content, shot_type): (String, String, i64) = db
            .query_row(
                "SELECT summary, content, shot_type FROM shots WHERE title = '胡同口'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(summary, "夏天傍晚");
        assert_eq!(content, "大槐树下乘凉");
        assert_eq!(shot_type, 2);
    }

    #[test]
    fn update_of_missing_entity_is_skipped() {
        let store = test_store();
        let report = store
            .apply_extraction(
                "u-1",
                &delta(r#"{"S": [{"pt":"u","title":"不存在的阶段","summary":"x"}]}"#),
                None,
            )
            .unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn link_and_unlink_edit_parent_pointers() {
        let store = test_store();
        let d = delta(
            r#"{
                "S": [{"pt":"n","tid":"s1","title":"中年"}],
                "T": [{"pt":"n","tid":"t1","title":"下海"}],
                "R": [{"type":"link","src":"t1","tgt":"s1"}]
            }"#,
        );
        let report = store.apply_extraction("u-1", &d, None).unwrap();
        assert_eq!(report.linked, 1);

        {
            let db = store.db.lock().unwrap();
            let parent: i64 = db
                .query_row("SELECT parent_stage_id FROM topics WHERE title = '下海'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            assert_eq!(parent, 1);
        }

        let d2 = delta(
            r#"{
                "T": [{"pt":"u","tid":"t1","title":"下海"}],
                "R": [{"type":"unlink","src":"t1"}]
            }"#,
        );
        store.apply_extraction("u-1", &d2, None).unwrap();
        let db = store.db.lock().unwrap();
        let parent: Option<i64> = db
            .query_row("SELECT parent_stage_id FROM topics WHERE title = '下海'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(parent.is_none());
    }

    #[test]
    fn stn_cursor_flip_excludes_this_runs_inserts() {
        let store = test_store();
        store
            .apply_extraction(
                "u-1",
                &delta(r#"{"S": [{"pt":"n","title":"老年"}]}"#),
                None,
            )
            .unwrap();
        // One storyboard row now exists with id 1; the next run read it and
        // observed max id 1 before inserting its own rows.
        store
            .apply_extraction(
                "u-1",
                &delta(r#"{"T": [{"pt":"n","title":"带孙子"}]}"#),
                Some(1),
            )
            .unwrap();

        let unprocessed = store
            .unprocessed_storyboard("u-1", AgentRole::Stenographer)
            .unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert!(unprocessed[0].story_content.contains("带孙子"));
    }

    #[test]
    fn storyboard_rows_reference_existing_entities() {
        let store = test_store();
        let d = delta(
            r#"{
                "S": [{"pt":"n","tid":"s1","title":"童年","summary":"1950 年代"}],
                "C": [{"pt":"n","name":"二叔","relation":"叔叔","evaluation":"慷慨"}]
            }"#,
        );
        store.apply_extraction("u-1", &d, None).unwrap();

        for entry in store.latest_storyboard("u-1", 10).unwrap() {
            let table = match entry.story_type {
                StoryKind::Stage => "stages",
                StoryKind::Topic => "topics",
                StoryKind::Shot => "shots",
                StoryKind::Character => "characters",
            };
            let db = store.db.lock().unwrap();
            let exists: i64 = db
                .query_row(
                    &format!("SELECT COUNT(*) FROM {table} WHERE id = ?1"),
                    [entry.entity_id],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1);
        }
    }
}
