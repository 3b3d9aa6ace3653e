//! Table schema helpers: engine classification, DDL rewriting for restore,
//! cosmetic-insensitive schema comparison and coordination path parsing.

use crate::control::Table;
use crate::utils::errors::{BackupError, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

static DDL_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:CREATE|ATTACH)\s+(?:TABLE|VIEW|MATERIALIZED\s+VIEW|LIVE\s+VIEW|WINDOW\s+VIEW|DICTIONARY)\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:(?:`[^`]+`|\w+)\.)?(?:`[^`]+`|\w+)",
    )
    .expect("valid DDL header regex")
});

static ATTACH_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\s*)ATTACH\s").expect("valid attach regex"));

static UUID_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s+UUID\s+'[^']+'").expect("valid uuid regex"));

static REPLICATED_WITH_ARGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Replicated(\w*)MergeTree\(\s*'[^']*'\s*,\s*'[^']*'\s*(?:,\s*)?")
        .expect("valid replicated engine regex")
});

static REPLICATED_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Replicated(\w*MergeTree)").expect("valid replicated regex"));

static REPLICA_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(Replicated\w*MergeTree\(\s*'[^']*'\s*,\s*)'[^']*'").expect("valid replica regex")
});

static ZOOKEEPER_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Replicated\S{0,20}MergeTree\('(?P<zk_path>[^']+)',")
        .expect("valid zookeeper path regex")
});

static MACRO: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("valid macro regex"));

static NORMALIZE_DISTRIBUTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"ENGINE = Distributed\('([^']+)', '?(\w+)'?, '?(\w+)'?(, .*)?\)")
        .expect("valid distributed regex")
});

static NORMALIZE_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:attach|create) table `?([^`.\s]+)`?\.`?([^`.\s(]+)`?(?: uuid '[^']+')?")
        .expect("valid header regex")
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static OPEN_PAREN_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\( +").expect("valid regex"));
static CLOSE_PAREN_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r" +\)").expect("valid regex"));

const EXTERNAL_DB_ENGINES: [&str; 4] = [
    "MySQL",
    "MaterializedMySQL",
    "PostgreSQL",
    "MaterializedPostgreSQL",
];

const VIEW_ENGINES: [&str; 4] = ["View", "MaterializedView", "LiveView", "WindowView"];

pub fn is_merge_tree(engine: &str) -> bool {
    engine.ends_with("MergeTree")
}

pub fn is_replicated(engine: &str) -> bool {
    engine.starts_with("Replicated") && is_merge_tree(engine)
}

pub fn is_distributed(engine: &str) -> bool {
    engine == "Distributed"
}

pub fn is_view(engine: &str) -> bool {
    VIEW_ENGINES.contains(&engine)
}

pub fn is_materialized_view(engine: &str) -> bool {
    engine == "MaterializedView"
}

/// Databases whose tables live in another system and hold no local data.
pub fn is_external_db_engine(db_engine: &str) -> bool {
    EXTERNAL_DB_ENGINES.contains(&db_engine)
}

pub fn is_atomic_db_engine(db_engine: &str) -> bool {
    matches!(db_engine, "Atomic" | "Replicated")
}

/// Restore submission classes, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableClass {
    MergeTree,
    Other,
    Distributed,
    View,
}

impl TableClass {
    pub fn of(engine: &str) -> Self {
        if is_merge_tree(engine) {
            TableClass::MergeTree
        } else if is_distributed(engine) {
            TableClass::Distributed
        } else if is_view(engine) {
            TableClass::View
        } else {
            TableClass::Other
        }
    }
}

/// Stable partition of `tables` into submission order: merge-tree, other,
/// distributed, views. Input order is kept within each class.
pub fn order_for_restore(tables: Vec<Table>) -> Vec<Table> {
    let mut tables = tables;
    tables.sort_by_key(|t| TableClass::of(&t.engine));
    tables
}

#[derive(Debug, Clone, Default)]
pub struct RewriteOptions {
    pub force_non_replicated: bool,
    pub override_replica_name: Option<String>,
    pub add_uuid: bool,
    /// Inner table identifier for materialized views
    pub inner_uuid: Option<String>,
}

/// Adapt a captured DDL statement to the restore target.
pub fn rewrite_table_schema(table: &mut Table, options: &RewriteOptions) {
    let mut statement = ATTACH_PREFIX
        .replace(&table.create_statement, "${1}CREATE ")
        .into_owned();

    if is_replicated(&table.engine) {
        if options.force_non_replicated {
            statement = REPLICATED_WITH_ARGS
                .replace_all(&statement, "${1}MergeTree(")
                .into_owned();
            statement = REPLICATED_BARE.replace_all(&statement, "${1}").into_owned();
            table.engine = table.engine.trim_start_matches("Replicated").to_string();
        } else if let Some(replica) = &options.override_replica_name {
            statement = REPLICA_ARG
                .replace_all(&statement, |caps: &Captures<'_>| format!("{}'{}'", &caps[1], replica))
                .into_owned();
        }
    }

    if options.add_uuid {
        if let Some(uuid) = &table.uuid {
            statement = insert_after_header(&statement, &format!(" UUID '{uuid}'"));
        }
        if let Some(inner_uuid) = &options.inner_uuid {
            if is_materialized_view(&table.engine) && !statement.contains("TO INNER UUID") {
                statement = insert_after_header(&statement, &format!(" TO INNER UUID '{inner_uuid}'"));
            }
        }
    }

    table.create_statement = statement;
}

/// Insert `clause` after the object name (and after an existing UUID clause).
/// A UUID clause is never inserted twice.
fn insert_after_header(statement: &str, clause: &str) -> String {
    let Some(header) = DDL_HEADER.find(statement) else {
        return statement.to_string();
    };

    let mut split = header.end();
    let existing_uuid = UUID_CLAUSE.find(&statement[split..]);
    if let Some(existing) = existing_uuid {
        if clause.trim_start().starts_with("UUID") {
            return statement.to_string();
        }
        split += existing.end();
    }

    format!("{}{}{}", &statement[..split], clause, &statement[split..])
}

fn normalize_schema(schema: &str) -> String {
    let res = WHITESPACE.replace_all(schema.trim(), " ");
    let res = NORMALIZE_DISTRIBUTED.replace_all(&res, "ENGINE = Distributed('${1}', '${2}', '${3}'${4})");
    let res = res.to_lowercase();
    let res = NORMALIZE_HEADER.replace(&res, "create table ${1}.${2}");
    let res = OPEN_PAREN_SPACE.replace_all(&res, "(");
    let res = CLOSE_PAREN_SPACE.replace_all(&res, ")");
    res.trim_end().to_string()
}

/// Compare two table schemas ignoring cosmetic differences: quoting,
/// `CREATE` vs `ATTACH ... UUID` framing, quoted vs bare positional
/// arguments of the Distributed engine, and whitespace.
pub fn compare_schema(schema_a: &str, schema_b: &str) -> bool {
    normalize_schema(schema_a) == normalize_schema(schema_b)
}

/// Coordination-service path of a replicated table, parsed from its DDL.
pub fn get_table_zookeeper_path(table: &Table) -> Result<String> {
    ZOOKEEPER_PATH
        .captures(&table.create_statement)
        .map(|caps| caps["zk_path"].to_string())
        .ok_or_else(|| {
            BackupError::InvalidStructure(format!(
                "couldn't parse create statement for zk path: {}",
                table.quoted_name()
            ))
        })
}

/// Replace `{macro}` placeholders with cluster macros, plus `{database}`,
/// `{table}` and `{uuid}` of `table`. Unknown placeholders are kept.
pub fn substitute_macros(value: &str, macros: &HashMap<String, String>, table: Option<&Table>) -> String {
    MACRO
        .replace_all(value, |caps: &Captures<'_>| {
            let name = &caps[1];
            let table_value = table.and_then(|t| match name {
                "database" => Some(t.database.clone()),
                "table" => Some(t.name.clone()),
                "uuid" => t.uuid.clone(),
                _ => None,
            });
            table_value
                .or_else(|| macros.get(name).cloned())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// True if dotted `version` is at least `required` (e.g. `21.4`).
pub fn version_ge(version: &str, required: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|component| component.parse().unwrap_or(0))
            .collect()
    };
    let (have, want) = (parse(version), parse(required));
    for i in 0..want.len().max(have.len()) {
        let (h, w) = (have.get(i).copied().unwrap_or(0), want.get(i).copied().unwrap_or(0));
        if h != w {
            return h > w;
        }
    }
    true
}
