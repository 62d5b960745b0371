use anyhow::{bail, Context};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use std::path::Path;
use uuid::Uuid;

/// Hierarchical JSON tree persisted in a single SQLite table.
///
/// Node paths are `/`-separated strings such as `Students/GES_0001_26` or
/// `LessonPlans/<teacherId>/<year>/courses/<courseId>/week_3`. Writes land on
/// exact paths; reads assemble a node together with everything stored below
/// it, so a record written as one object and a flag written later under a
/// deeper path come back as one merged value.
pub struct Tree {
    conn: Connection,
}

pub fn open_store(workspace: &Path) -> anyhow::Result<Tree> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("schoolhub.sqlite3");
    let conn = Connection::open(db_path)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS nodes(
            path TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(Tree { conn })
}

fn check_path(path: &str) -> anyhow::Result<()> {
    if path.is_empty() {
        bail!("empty node path");
    }
    if path.split('/').any(|seg| seg.is_empty()) {
        bail!("node path has empty segment: {path}");
    }
    Ok(())
}

// '0' is the ASCII successor of '/', so [path + "/", path + "0") bounds
// exactly the rows below `path`. LIKE would treat '_' in ids as a wildcard.
const SUBTREE_SQL: &str = "SELECT path, value FROM nodes
     WHERE path >= ?1 || '/' AND path < ?1 || '0'
     ORDER BY path";

impl Tree {
    fn read_node(&self, path: &str) -> anyhow::Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM nodes WHERE path = ?", [path], |r| {
                r.get(0)
            })
            .optional()?;
        match raw {
            Some(s) => {
                let v = serde_json::from_str(&s)
                    .with_context(|| format!("corrupt node value at {path}"))?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    /// Node value at `path`, with descendants folded in as nested objects.
    pub fn get(&self, path: &str) -> anyhow::Result<Option<Value>> {
        check_path(path)?;
        let base = self.read_node(path)?;

        let mut stmt = self.conn.prepare(SUBTREE_SQL)?;
        let rows = stmt
            .query_map([path], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        if rows.is_empty() {
            return Ok(base);
        }

        let mut root = match base {
            Some(Value::Object(m)) => Value::Object(m),
            _ => json!({}),
        };
        for (row_path, raw) in rows {
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("corrupt node value at {row_path}"))?;
            let rel = &row_path[path.len() + 1..];
            insert_nested(&mut root, rel, value);
        }
        Ok(Some(root))
    }

    /// Replaces the node and its entire subtree.
    pub fn set(&self, path: &str, value: &Value) -> anyhow::Result<()> {
        check_path(path)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM nodes WHERE path = ?1 OR (path >= ?1 || '/' AND path < ?1 || '0')",
            [path],
        )?;
        tx.execute(
            "INSERT INTO nodes(path, value) VALUES(?, ?)",
            (path, serde_json::to_string(value)?),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Shallow-merges `patch` keys into the object stored at `path`.
    pub fn update(&self, path: &str, patch: &Map<String, Value>) -> anyhow::Result<()> {
        check_path(path)?;
        let mut current = match self.read_node(path)? {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        };
        for (k, v) in patch {
            current.insert(k.clone(), v.clone());
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO nodes(path, value) VALUES(?, ?)",
            (path, serde_json::to_string(&Value::Object(current))?),
        )?;
        Ok(())
    }

    /// Appends a child under a generated key and returns the key.
    pub fn push(&self, path: &str, value: &Value) -> anyhow::Result<String> {
        check_path(path)?;
        let key = push_key();
        self.conn.execute(
            "INSERT INTO nodes(path, value) VALUES(?, ?)",
            (
                format!("{path}/{key}"),
                serde_json::to_string(value)?,
            ),
        )?;
        Ok(key)
    }

    /// Immediate children of `path` as (key, assembled value) pairs,
    /// ordered by key.
    pub fn children(&self, path: &str) -> anyhow::Result<Vec<(String, Value)>> {
        check_path(path)?;
        let mut stmt = self.conn.prepare(SUBTREE_SQL)?;
        let rows = stmt
            .query_map([path], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut keys: Vec<String> = Vec::new();
        for row_path in rows {
            let rel = &row_path[path.len() + 1..];
            let key = rel.split('/').next().unwrap_or(rel);
            if keys.last().map(String::as_str) != Some(key) {
                keys.push(key.to_string());
            }
        }

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(v) = self.get(&format!("{path}/{key}"))? {
                out.push((key, v));
            }
        }
        Ok(out)
    }

    pub fn exists(&self, path: &str) -> anyhow::Result<bool> {
        check_path(path)?;
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM nodes
                 WHERE path = ?1 OR (path >= ?1 || '/' AND path < ?1 || '0')
                 LIMIT 1",
                [path],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn counter_get(&self, path: &str) -> anyhow::Result<Option<i64>> {
        Ok(self.read_node(path)?.and_then(|v| v.as_i64()))
    }

    pub fn counter_set(&self, path: &str, value: i64) -> anyhow::Result<()> {
        check_path(path)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO nodes(path, value) VALUES(?, ?)",
            (path, value.to_string()),
        )?;
        Ok(())
    }

    /// Read-modify-write increment inside one transaction. An absent
    /// counter is treated as 0.
    pub fn counter_increment(&self, path: &str) -> anyhow::Result<i64> {
        check_path(path)?;
        let tx = self.conn.unchecked_transaction()?;
        let current: Option<String> = tx
            .query_row("SELECT value FROM nodes WHERE path = ?", [path], |r| {
                r.get(0)
            })
            .optional()?;
        let current = current
            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let next = current + 1;
        tx.execute(
            "INSERT OR REPLACE INTO nodes(path, value) VALUES(?, ?)",
            (path, next.to_string()),
        )?;
        tx.commit()?;
        Ok(next)
    }
}

/// Generated child key, for callers that embed the key in the value they
/// are about to `set` (the push-ref pattern).
pub fn push_key() -> String {
    Uuid::new_v4().to_string()
}

fn insert_nested(root: &mut Value, rel_path: &str, value: Value) {
    let mut node = root;
    let mut segments = rel_path.split('/').peekable();
    while let Some(seg) = segments.next() {
        if !node.is_object() {
            *node = json!({});
        }
        let Value::Object(obj) = node else {
            return;
        };
        if segments.peek().is_none() {
            obj.insert(seg.to_string(), value);
            return;
        }
        node = obj.entry(seg.to_string()).or_insert_with(|| json!({}));
    }
}
