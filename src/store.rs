use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, params_from_iter};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::error::{DashError, Result};
use crate::parser::{Dataset, Scalar};

/// Name of the single table inside every session database.
pub const TABLE_NAME: &str = "my_data_table";

const BOOL_TYPE: &str = "BOOLEAN";
/// Contains "TEXT" so SQLite gives the column text affinity.
const MIXED_TYPE: &str = "JSON_TEXT";
const ORDER_COLUMN: &str = "__row";

/// The only state handed to the browser between processing and plotting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReference {
    /// File name of the session database, `<uuid>.db`
    pub table_id: String,
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
}

/// Session tables persisted as one SQLite file each under a shared directory.
///
/// There is no locking: two requests never share a table, and the only
/// deletion path is the age-based sweep.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, reference: &SessionReference) -> Result<PathBuf> {
        let valid = reference
            .table_id
            .strip_suffix(".db")
            .is_some_and(|stem| Uuid::parse_str(stem).is_ok());
        if !valid {
            return Err(DashError::SessionNotFound(reference.table_id.clone()));
        }
        Ok(self.dir.join(&reference.table_id))
    }

    fn open(&self, reference: &SessionReference) -> Result<Connection> {
        let path = self.path_for(reference)?;
        if !path.is_file() {
            return Err(DashError::SessionNotFound(reference.table_id.clone()));
        }
        Ok(Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }

    /// Persist a dataset under a freshly generated identifier.
    ///
    /// Rows keep their order through a hidden `INTEGER PRIMARY KEY` column,
    /// so user fields named `rowid` or `oid` are stored like any other.
    ///
    /// # Arguments
    /// * `dataset` - Merged, tagged records of one processing request
    ///
    /// # Returns
    /// * `Result<SessionReference>` - Identifier of the new table, or the SQLite/IO error
    pub fn create(&self, dataset: &Dataset) -> Result<SessionReference> {
        fs::create_dir_all(&self.dir)?;
        let reference = SessionReference {
            table_id: format!("{}.db", Uuid::new_v4()),
        };
        let path = self.path_for(&reference)?;

        let kinds: Vec<ColumnKind> = (0..dataset.columns.len())
            .map(|i| ColumnKind::of(dataset, i))
            .collect();
        let order_column = order_column_name(&dataset.columns);

        let mut column_defs = vec![format!("{} INTEGER PRIMARY KEY", quote_ident(&order_column))];
        column_defs.extend(
            dataset
                .columns
                .iter()
                .zip(&kinds)
                .map(|(name, kind)| match kind.declared_type() {
                    Some(ty) => format!("{} {ty}", quote_ident(name)),
                    None => quote_ident(name),
                }),
        );

        let mut conn = Connection::open(&path)?;
        conn.execute(
            &format!("CREATE TABLE {} ({})", quote_ident(TABLE_NAME), column_defs.join(", ")),
            [],
        )?;

        let names: Vec<String> = dataset.columns.iter().map(|c| quote_ident(c)).collect();
        let placeholders = vec!["?"; dataset.columns.len()].join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote_ident(TABLE_NAME),
            names.join(", ")
        );
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&insert)?;
            for row in &dataset.rows {
                stmt.execute(params_from_iter(row.iter().zip(&kinds).map(|(v, k)| to_sql(v, *k))))?;
            }
        }
        tx.commit()?;

        log::info!(
            "stored {} rows x {} columns as {}",
            dataset.num_rows(),
            dataset.columns.len(),
            reference.table_id
        );
        Ok(reference)
    }

    /// Column names in stored order.
    pub fn columns(&self, reference: &SessionReference) -> Result<Vec<String>> {
        let conn = self.open(reference)?;
        Ok(column_info(&conn)?.columns.into_iter().map(|(name, _)| name).collect())
    }

    /// Re-read the whole table. Nothing is cached between calls.
    pub fn load(&self, reference: &SessionReference) -> Result<Dataset> {
        let conn = self.open(reference)?;
        let info = column_info(&conn)?;
        let names: Vec<&str> = info.columns.iter().map(|(n, _)| n.as_str()).collect();
        let rows = select_rows(&conn, &info, &names)?;
        Ok(Dataset {
            columns: info.columns.into_iter().map(|(n, _)| n).collect(),
            rows,
        })
    }

    /// Read only the named columns, in on-disk row order.
    pub fn load_columns(&self, reference: &SessionReference, names: &[&str]) -> Result<Vec<Vec<Scalar>>> {
        let conn = self.open(reference)?;
        let info = column_info(&conn)?;
        select_rows(&conn, &info, names)
    }

    /// Delete every file and directory in the store directory whose last
    /// modification is older than `max_age`.
    pub fn sweep(&self, max_age: Duration) -> Result<SweepReport> {
        self.sweep_at(max_age, SystemTime::now())
    }

    pub fn sweep_at(&self, max_age: Duration, now: SystemTime) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("sweep: cannot stat {}: {e}", path.display());
                    continue;
                }
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= max_age {
                continue;
            }

            let removed = if metadata.is_dir() {
                fs::remove_dir_all(&path).map(|_| report.dirs_removed += 1)
            } else {
                fs::remove_file(&path).map(|_| report.files_removed += 1)
            };
            if let Err(e) = removed {
                log::warn!("sweep: cannot remove {}: {e}", path.display());
            }
        }

        Ok(report)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A name for the hidden ordering column that no user column already has.
fn order_column_name(columns: &[String]) -> String {
    let mut name = ORDER_COLUMN.to_string();
    while columns.iter().any(|c| c == &name) {
        name.push('_');
    }
    name
}

/// How the values of one column are laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    /// Numbers and text in SQLite's native storage classes.
    Plain,
    /// Only booleans and nulls, stored as 0/1.
    Bool,
    /// Booleans next to other values; every value is kept as its JSON text.
    Mixed,
}

impl ColumnKind {
    fn of(dataset: &Dataset, idx: usize) -> Self {
        let (mut bools, mut others) = (false, false);
        for row in &dataset.rows {
            match &row[idx] {
                Scalar::Null => {}
                Scalar::Bool(_) => bools = true,
                _ => others = true,
            }
        }
        match (bools, others) {
            (true, false) => ColumnKind::Bool,
            (true, true) => ColumnKind::Mixed,
            _ => ColumnKind::Plain,
        }
    }

    fn declared_type(self) -> Option<&'static str> {
        match self {
            ColumnKind::Plain => None,
            ColumnKind::Bool => Some(BOOL_TYPE),
            ColumnKind::Mixed => Some(MIXED_TYPE),
        }
    }

    fn from_declared(ty: &str) -> Self {
        if ty.eq_ignore_ascii_case(BOOL_TYPE) {
            ColumnKind::Bool
        } else if ty.eq_ignore_ascii_case(MIXED_TYPE) {
            ColumnKind::Mixed
        } else {
            ColumnKind::Plain
        }
    }
}

fn to_sql(value: &Scalar, kind: ColumnKind) -> SqlValue {
    match (value, kind) {
        (Scalar::Null, _) => SqlValue::Null,
        (other, ColumnKind::Mixed) => SqlValue::Text(serde_json::to_string(other).unwrap_or_default()),
        (Scalar::Bool(b), _) => SqlValue::Integer(i64::from(*b)),
        (Scalar::Int(i), _) => SqlValue::Integer(*i),
        (Scalar::Float(f), _) => SqlValue::Real(*f),
        (Scalar::Text(s), _) => SqlValue::Text(s.clone()),
    }
}

fn from_sql(value: SqlValue, kind: ColumnKind) -> Scalar {
    match (value, kind) {
        (SqlValue::Null, _) => Scalar::Null,
        (SqlValue::Text(s), ColumnKind::Mixed) => match serde_json::from_str::<serde_json::Value>(&s) {
            Ok(v) => Scalar::from_json(&v),
            Err(_) => Scalar::Text(s),
        },
        (SqlValue::Integer(i), ColumnKind::Bool) => Scalar::Bool(i != 0),
        (SqlValue::Integer(i), _) => Scalar::Int(i),
        (SqlValue::Real(f), _) => Scalar::Float(f),
        (SqlValue::Text(s), _) => Scalar::Text(s),
        (SqlValue::Blob(b), _) => Scalar::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

struct TableInfo {
    /// Hidden `INTEGER PRIMARY KEY` holding insertion order
    order_column: String,
    /// `(name, declared type)` per user column
    columns: Vec<(String, String)>,
}

fn column_info(conn: &Connection) -> Result<TableInfo> {
    let mut stmt = conn.prepare(&format!(
        "SELECT name, type, pk FROM pragma_table_info('{TABLE_NAME}') ORDER BY cid"
    ))?;
    let mut order_column = None;
    let mut columns = Vec::new();
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
    })?;
    for row in rows {
        let (name, ty, pk) = row?;
        if pk > 0 {
            order_column = Some(name);
        } else {
            columns.push((name, ty));
        }
    }
    let order_column = order_column
        .ok_or_else(|| DashError::SessionNotFound(format!("{TABLE_NAME} has no row order column")))?;
    Ok(TableInfo { order_column, columns })
}

fn select_rows(conn: &Connection, info: &TableInfo, names: &[&str]) -> Result<Vec<Vec<Scalar>>> {
    let kinds: Vec<ColumnKind> = names
        .iter()
        .map(|n| {
            info.columns
                .iter()
                .find(|(name, _)| name == n)
                .map_or(ColumnKind::Plain, |(_, ty)| ColumnKind::from_declared(ty))
        })
        .collect();
    let select_list: Vec<String> = names.iter().map(|n| quote_ident(n)).collect();
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        select_list.join(", "),
        quote_ident(TABLE_NAME),
        quote_ident(&info.order_column)
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            let mut out = Vec::with_capacity(kinds.len());
            for (i, kind) in kinds.iter().enumerate() {
                out.push(from_sql(row.get::<_, SqlValue>(i)?, *kind));
            }
            Ok(out)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
