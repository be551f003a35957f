use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::data::{
    check_help_page, AddHelpPageStatus, Command, Completion, FlagContext, HelpPage, Policy,
};
use crate::util::hash_strings;

const SCHEMA_VERSION: i32 = 1;

/// Persistent map of help pages keyed by `(executable, help checksum)` and
/// `(executable, argv checksum)`, with merge-on-conflict semantics.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Store> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open completion store {}", path.display()))?;
        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Store> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Store> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(10_000))?;
        init_schema(&conn)?;
        Ok(Store { conn })
    }

    /// §4.4 AddHelpPage. The page's command may be replaced by a stored,
    /// shorter invocation of the same help text.
    pub fn add_help_page(
        &mut self,
        page: &mut HelpPage,
        policy: Policy,
    ) -> anyhow::Result<AddHelpPageStatus> {
        check_help_page(page)?;

        let argv_checksum = hash_strings(&page.command.args);
        let tx = self.conn.transaction()?;

        let mut policy = policy;
        if policy == Policy::Unknown {
            // Inherit the decision made for this exact argv earlier. The
            // checksum covers argv only, not the environment.
            let inherited: Option<String> = tx
                .query_row(
                    "SELECT Policy FROM HelpPage WHERE CommandArgsCheckSum = ?",
                    params![argv_checksum],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(p) = inherited {
                policy = Policy::from_str_lossy(&p);
            }
        }

        let reuse_id = remove_and_merge_conflicting(&tx, &argv_checksum, page)?;
        insert_help_page(&tx, reuse_id, &argv_checksum, page, policy)?;
        tx.commit()?;

        Ok(if reuse_id.is_some() {
            AddHelpPageStatus::Updated
        } else {
            AddHelpPageStatus::New
        })
    }

    /// Deletes the page and its completions; returns the executable path the
    /// page was for, so callers can dirty it on attached shells.
    pub fn remove_help_page(&mut self, help_page_id: i64) -> anyhow::Result<String> {
        let tx = self.conn.transaction()?;
        let path: Option<String> = tx
            .query_row(
                "SELECT ExecutablePath FROM HelpPage WHERE HelpPageId = ?",
                params![help_page_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(path) = path else {
            bail!("no help page with id {help_page_id}");
        };
        remove_help_page_tx(&tx, help_page_id)?;
        tx.commit()?;
        Ok(path)
    }

    /// All completions for an executable across all of its pages, in stored
    /// order.
    pub fn get_completions(&self, executable_path: &str) -> anyhow::Result<Vec<Completion>> {
        let mut stmt = self.conn.prepare(
            "SELECT Completion.Flag, Completion.Context
             FROM Completion INNER JOIN HelpPage
               ON Completion.HelpPageId = HelpPage.HelpPageId
             WHERE HelpPage.ExecutablePath = ?
             ORDER BY Completion.CompletionId",
        )?;
        let rows = stmt.query_map(params![executable_path], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut completions = Vec::new();
        for row in rows {
            let (flag, context) = row?;
            completions.push(Completion {
                flag,
                context: decode_context(context.as_deref()),
            });
        }
        Ok(completions)
    }

    /// One page per distinct executable with its completions aggregated;
    /// used to build the initial script on shell attach.
    pub fn get_all_completions(&self) -> anyhow::Result<Vec<HelpPage>> {
        let mut stmt = self.conn.prepare(
            "SELECT HelpPage.ExecutablePath, Completion.Flag, Completion.Context
             FROM Completion INNER JOIN HelpPage
               ON HelpPage.HelpPageId = Completion.HelpPageId
             ORDER BY HelpPage.ExecutablePath, Completion.CompletionId",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut pages: Vec<HelpPage> = Vec::new();
        for row in rows {
            let (executable_path, flag, context) = row?;
            let completion = Completion {
                flag,
                context: decode_context(context.as_deref()),
            };
            match pages.last_mut() {
                Some(page) if page.executable_path == executable_path => {
                    page.completions.push(completion);
                }
                _ => pages.push(HelpPage {
                    executable_path,
                    completions: vec![completion],
                    ..Default::default()
                }),
            }
        }
        Ok(pages)
    }

    /// Policy stored for this exact argv, `Unknown` when nothing matches.
    /// The lookup covers argv only; environment differences are invisible.
    pub fn get_command_policy(&self, args: &[String]) -> anyhow::Result<Policy> {
        let checksum = hash_strings(args);
        let policy: Option<String> = self
            .conn
            .query_row(
                "SELECT Policy FROM HelpPage WHERE CommandArgsCheckSum = ?",
                params![checksum],
                |row| row.get(0),
            )
            .optional()?;
        Ok(policy
            .map(|p| Policy::from_str_lossy(&p))
            .unwrap_or(Policy::Unknown))
    }

    /// Pages with unparseable stored command JSON surface as a present key
    /// with an absent command.
    pub fn list_commands(&self) -> anyhow::Result<BTreeMap<i64, Option<Command>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT HelpPageId, CommandJson FROM HelpPage")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut result = BTreeMap::new();
        for row in rows {
            let (id, json) = row?;
            match serde_json::from_str::<Command>(&json) {
                Ok(command) => result.insert(id, Some(command)),
                Err(err) => {
                    tracing::warn!("help page {id} has broken command json: {err}");
                    result.insert(id, None)
                }
            };
        }
        Ok(result)
    }
}

fn decode_context(context: Option<&str>) -> FlagContext {
    context
        .and_then(|c| serde_json::from_str(c).ok())
        .unwrap_or_default()
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    match user_version {
        0 => {}
        SCHEMA_VERSION => return Ok(()),
        // Never migrate down; a newer cod owns this file.
        other => bail!("unknown completion store schema version: {other}"),
    }

    conn.execute_batch(&format!(
        "BEGIN;

        CREATE TABLE IF NOT EXISTS HelpPage (
            HelpPageId          INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            ExecutablePath      TEXT NOT NULL,
            HelpTextCheckSum    TEXT NOT NULL,
            CommandArgsCheckSum TEXT NOT NULL,
            CommandJson         TEXT NOT NULL,
            Policy              TEXT NOT NULL,
            UNIQUE (ExecutablePath, HelpTextCheckSum),
            UNIQUE (ExecutablePath, CommandArgsCheckSum)
        );

        CREATE TABLE IF NOT EXISTS Completion (
            CompletionId INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            HelpPageId   INTEGER NOT NULL REFERENCES HelpPage(HelpPageId),
            Flag         TEXT NOT NULL,
            Context      TEXT
        );
        CREATE INDEX IF NOT EXISTS Completion_HelpPageId ON Completion (HelpPageId);
        CREATE INDEX IF NOT EXISTS HelpPage_ExecutablePath ON HelpPage (ExecutablePath);

        PRAGMA user_version = {SCHEMA_VERSION};

        COMMIT;"
    ))?;
    Ok(())
}

fn command_to_json(command: &Command) -> anyhow::Result<String> {
    Ok(serde_json::to_string(command)?)
}

/// Delete rows that conflict with the incoming page on either uniqueness
/// pair, keeping the lowest conflicting id for reuse. When the help text is
/// already known under a shorter invocation, the shorter argv wins.
fn remove_and_merge_conflicting(
    tx: &Transaction<'_>,
    argv_checksum: &str,
    page: &mut HelpPage,
) -> anyhow::Result<Option<i64>> {
    let mut reuse_id: Option<i64> = None;

    let same_help: Option<(i64, String)> = tx
        .query_row(
            "SELECT HelpPageId, CommandJson FROM HelpPage
             WHERE ExecutablePath = ? AND HelpTextCheckSum = ?",
            params![page.executable_path, page.check_sum],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if let Some((id, old_json)) = same_help {
        let cur_json = command_to_json(&page.command)?;
        let old_command: Command = serde_json::from_str(&old_json)
            .with_context(|| format!("help page {id} has broken command json"))?;
        if cur_json.len() > old_json.len() {
            page.command = old_command;
        }
        reuse_id = Some(id);
        remove_help_page_tx(tx, id)?;
    }

    let same_argv: Option<i64> = tx
        .query_row(
            "SELECT HelpPageId FROM HelpPage
             WHERE ExecutablePath = ? AND CommandArgsCheckSum = ?",
            params![page.executable_path, argv_checksum],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = same_argv {
        if reuse_id.map_or(true, |reuse| reuse > id) {
            reuse_id = Some(id);
        }
        remove_help_page_tx(tx, id)?;
    }

    Ok(reuse_id)
}

fn insert_help_page(
    tx: &Transaction<'_>,
    reuse_id: Option<i64>,
    argv_checksum: &str,
    page: &HelpPage,
    policy: Policy,
) -> anyhow::Result<()> {
    let command_json = command_to_json(&page.command)?;
    tx.execute(
        "INSERT INTO HelpPage (
            HelpPageId, ExecutablePath, HelpTextCheckSum,
            CommandArgsCheckSum, CommandJson, Policy
         ) VALUES (?, ?, ?, ?, ?, ?)",
        params![
            reuse_id,
            page.executable_path,
            page.check_sum,
            argv_checksum,
            command_json,
            policy.as_str()
        ],
    )?;
    let help_page_id = tx.last_insert_rowid();

    let mut stmt =
        tx.prepare("INSERT INTO Completion (HelpPageId, Flag, Context) VALUES (?, ?, ?)")?;
    for completion in &page.completions {
        let context = if completion.context.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&completion.context)?)
        };
        stmt.execute(params![help_page_id, completion.flag, context])?;
    }
    Ok(())
}

fn remove_help_page_tx(tx: &Transaction<'_>, help_page_id: i64) -> anyhow::Result<()> {
    // Completions never outlive their page; delete them first so the FK
    // holds at every point inside the transaction.
    tx.execute(
        "DELETE FROM Completion WHERE HelpPageId = ?",
        params![help_page_id],
    )?;
    tx.execute(
        "DELETE FROM HelpPage WHERE HelpPageId = ?",
        params![help_page_id],
    )?;
    Ok(())
}
