//! Rendering of statements and table descriptors to Postgres SQL.
//!
//! Identifiers come from projection descriptors, never from event payloads;
//! they are still quoted. Values are always bound as parameters.

use tenantview_events::{Condition, Operation, Statement, TableDescriptor, Value};

/// Schema holding the checkpoint table.
pub const CHECKPOINT_SCHEMA: &str = "projections";

/// Table of per-(projection, instance) positions.
pub const CHECKPOINT_TABLE: &str = "projections.current_sequences";

/// `projections.members` → `"projections"."members"`.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Schema part of a qualified table name, if any.
pub fn schema_of(table: &str) -> Option<&str> {
    table.split_once('.').map(|(schema, _)| schema)
}

/// Unqualified part of a table name.
pub fn relation_of(table: &str) -> &str {
    table.rsplit_once('.').map_or(table, |(_, relation)| relation)
}

/// A statement ready to execute: SQL text with `$n` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlStatement {
    fn placeholder(&mut self, value: &Value) -> String {
        self.params.push(value.clone());
        format!("${}", self.params.len())
    }

    fn predicate(&mut self, conditions: &[Condition]) -> String {
        conditions
            .iter()
            .map(|c| format!("{} = {}", quote_ident(&c.column), self.placeholder(&c.value)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

pub fn render(statement: &Statement) -> SqlStatement {
    let mut out = SqlStatement {
        sql: String::new(),
        params: Vec::new(),
    };
    let table = quote_ident(&statement.table);

    let sql = match &statement.operation {
        Operation::Upsert { conflict, values } => {
            let columns: Vec<String> = values.iter().map(|a| quote_ident(&a.column)).collect();
            let placeholders: Vec<String> =
                values.iter().map(|a| out.placeholder(&a.value)).collect();
            let target: Vec<String> = conflict.iter().map(|c| quote_ident(c)).collect();
            let updates: Vec<String> = values
                .iter()
                .filter(|a| !conflict.contains(&a.column))
                .map(|a| {
                    let column = quote_ident(&a.column);
                    format!("{column} = EXCLUDED.{column}")
                })
                .collect();
            let on_conflict = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", updates.join(", "))
            };
            format!(
                "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) {on_conflict}",
                columns.join(", "),
                placeholders.join(", "),
                target.join(", "),
            )
        }
        Operation::Update { values, conditions } => {
            let set: Vec<String> = values
                .iter()
                .map(|a| format!("{} = {}", quote_ident(&a.column), out.placeholder(&a.value)))
                .collect();
            let predicate = out.predicate(conditions);
            format!("UPDATE {table} SET {} WHERE {predicate}", set.join(", "))
        }
        Operation::Delete { conditions } => {
            let predicate = out.predicate(conditions);
            format!("DELETE FROM {table} WHERE {predicate}")
        }
    };
    out.sql = sql;
    out
}

// ─── DDL ───────────────────────────────────────────────────────────────────

pub fn create_schema(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema))
}

pub fn create_table(table: &TableDescriptor) -> String {
    let mut lines: Vec<String> = table
        .columns()
        .iter()
        .map(|c| {
            let not_null = if table.is_key_column(&c.name) {
                " NOT NULL"
            } else {
                ""
            };
            format!("{} {}{not_null}", quote_ident(&c.name), c.column_type.sql_type())
        })
        .collect();
    lines.push(format!(
        "PRIMARY KEY ({})",
        table
            .primary_key()
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>()
            .join(", ")
    ));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table.name()),
        lines.join(", ")
    )
}

/// One `CREATE INDEX` per declared index, named `{relation}_{index}_idx`.
pub fn create_indexes(table: &TableDescriptor) -> Vec<String> {
    let relation = relation_of(table.name());
    table
        .indexes()
        .iter()
        .map(|index| {
            let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&format!("{relation}_{}_idx", index.name)),
                quote_ident(table.name()),
                columns.join(", ")
            )
        })
        .collect()
}

pub fn create_checkpoint_table() -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {} (
            projection_name TEXT NOT NULL,
            instance_id UUID NOT NULL,
            current_sequence BIGINT NOT NULL,
            last_updated TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (projection_name, instance_id)
        )"#,
        quote_ident(CHECKPOINT_TABLE)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantview_core::{InstanceId, OrgId, UserId};
    use tenantview_events::{Assignment, ColumnDef, ColumnType, Index};

    const TABLE: &str = "projections.members";

    #[test]
    fn quotes_each_part() {
        assert_eq!(quote_ident("projections.members"), r#""projections"."members""#);
        assert_eq!(quote_ident(r#"odd"name"#), r#""odd""name""#);
        assert_eq!(schema_of("projections.members"), Some("projections"));
        assert_eq!(schema_of("members"), None);
        assert_eq!(relation_of("projections.members"), "members");
    }

    #[test]
    fn upsert_updates_non_key_columns() {
        let stmt = Statement::upsert(
            TABLE,
            &["instance_id", "user_id"],
            vec![
                Assignment::new("instance_id", InstanceId::new()),
                Assignment::new("user_id", UserId::new()),
                Assignment::new("roles", vec!["IAM_OWNER".to_string()]),
            ],
        );
        let sql = render(&stmt);

        assert_eq!(
            sql.sql,
            r#"INSERT INTO "projections"."members" ("instance_id", "user_id", "roles") VALUES ($1, $2, $3) ON CONFLICT ("instance_id", "user_id") DO UPDATE SET "roles" = EXCLUDED."roles""#
        );
        assert_eq!(sql.params.len(), 3);
    }

    #[test]
    fn key_only_upsert_does_nothing_on_conflict() {
        let stmt = Statement::upsert(
            TABLE,
            &["user_id"],
            vec![Assignment::new("user_id", UserId::new())],
        );
        assert!(render(&stmt).sql.ends_with("DO NOTHING"));
    }

    #[test]
    fn update_numbers_set_before_where() {
        let instance = InstanceId::new();
        let stmt = Statement::update(
            TABLE,
            vec![Assignment::new("sequence", 7_i64)],
            vec![
                Condition::new("instance_id", instance),
                Condition::new("user_id", UserId::new()),
            ],
        );
        let sql = render(&stmt);

        assert_eq!(
            sql.sql,
            r#"UPDATE "projections"."members" SET "sequence" = $1 WHERE "instance_id" = $2 AND "user_id" = $3"#
        );
        assert_eq!(sql.params[0], Value::Int(7));
        assert_eq!(sql.params[1], Value::from(instance));
    }

    #[test]
    fn delete_by_owner() {
        let stmt = Statement::delete(
            TABLE,
            vec![
                Condition::new("instance_id", InstanceId::new()),
                Condition::new("user_resource_owner", OrgId::new()),
            ],
        );
        assert_eq!(
            render(&stmt).sql,
            r#"DELETE FROM "projections"."members" WHERE "instance_id" = $1 AND "user_resource_owner" = $2"#
        );
    }

    #[test]
    fn ddl_for_descriptor() {
        let table = TableDescriptor::new(
            TABLE,
            vec![
                ColumnDef::new("instance_id", ColumnType::Uuid),
                ColumnDef::new("user_id", ColumnType::Uuid),
                ColumnDef::new("roles", ColumnType::TextArray),
            ],
            &["instance_id", "user_id"],
        )
        .with_index(Index::new("user_id", &["user_id"]));

        assert_eq!(
            create_table(&table),
            r#"CREATE TABLE IF NOT EXISTS "projections"."members" ("instance_id" UUID NOT NULL, "user_id" UUID NOT NULL, "roles" TEXT[], PRIMARY KEY ("instance_id", "user_id"))"#
        );
        assert_eq!(
            create_indexes(&table),
            vec![r#"CREATE INDEX IF NOT EXISTS "members_user_id_idx" ON "projections"."members" ("user_id")"#.to_string()]
        );
        assert_eq!(create_schema("projections"), r#"CREATE SCHEMA IF NOT EXISTS "projections""#);
        assert!(create_checkpoint_table().contains("PRIMARY KEY (projection_name, instance_id)"));
    }
}
